//! The Logger Sink: every other task reports diagnostics here instead of
//! touching the log file directly, and a single dedicated task owns the
//! actual file handle.
//!
//! This is deliberately separate from the ambient `tracing` setup in
//! [`crate::telemetry`]: it's the collector's own severity-tagged log
//! file, in the exact line format the original collector wrote, not a
//! structured trace feed for operators running this under a supervisor.

use std::path::PathBuf;

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use crate::config::Config;

const CHANNEL_CAPACITY: usize = 1024;

/// Failures opening or writing the log file.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unable to open log file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to write log file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Severity tag written alongside each log line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
}

impl Severity {
    fn as_str(self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
        }
    }
}

struct LogEntry {
    severity: Severity,
    message: String,
}

/// Cheaply cloneable handle producers use to submit log lines.
/// `debug`-severity lines are dropped at the call site when the
/// collector wasn't started with `debug = 1`, and any line is dropped
/// if the logger task is falling behind and its channel is full -- the
/// log is best-effort, never a backpressure source for the data path.
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::Sender<LogEntry>,
    debug_enabled: bool,
}

impl LogSink {
    pub fn debug(&self, message: String) {
        if self.debug_enabled {
            self.send(Severity::Debug, message);
        }
    }

    pub fn info(&self, message: String) {
        self.send(Severity::Info, message);
    }

    pub fn warning(&self, message: String) {
        self.send(Severity::Warning, message);
    }

    pub fn error(&self, message: String) {
        self.send(Severity::Error, message);
    }

    fn send(&self, severity: Severity, message: String) {
        let _ = self.tx.try_send(LogEntry { severity, message });
    }
}

/// The logger task's half of the channel.
pub struct LogDrain {
    rx: mpsc::Receiver<LogEntry>,
}

/// Build a [`LogSink`]/[`LogDrain`] pair. Every clone of the returned
/// sink must be dropped before [`run`] will return: the drain's `recv`
/// yields `None`, and therefore `run` exits, only once no sender remains
/// -- this is how the logger finishes writing everything already queued
/// before the process exits, rather than being cut off by the same
/// shutdown signal that stops the Receiver and Workers.
#[must_use]
pub fn channel(config: &Config) -> (LogSink, LogDrain) {
    let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
    (
        LogSink {
            tx,
            debug_enabled: config.debug,
        },
        LogDrain { rx },
    )
}

/// Drain `drain` until every [`LogSink`] clone has been dropped, writing
/// one line per entry to `path` and flushing after each write so a crash
/// never loses a line that was already accepted.
///
/// # Errors
///
/// Returns [`Error`] if the file can't be opened, or a write/flush fails.
pub async fn run(path: PathBuf, mut drain: LogDrain) -> Result<(), Error> {
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
        .map_err(|source| Error::Open {
            path: path.clone(),
            source,
        })?;

    while let Some(entry) = drain.rx.recv().await {
        let line = format_line(&entry);
        file.write_all(line.as_bytes())
            .await
            .map_err(|source| Error::Write {
                path: path.clone(),
                source,
            })?;
        file.flush().await.map_err(|source| Error::Write {
            path: path.clone(),
            source,
        })?;
    }

    Ok(())
}

fn format_line(entry: &LogEntry) -> String {
    let now = chrono::Local::now();
    format!(
        "{} freeflow: {} {}\n",
        now.format("%Y/%m/%d %H:%M:%S"),
        entry.severity.as_str(),
        entry.message
    )
}
