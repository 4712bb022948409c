//! Supervisor: parses the CLI and configuration file, starts the logger,
//! spawns the worker pool, runs the UDP receiver on the main task, and
//! tears everything down in order on SIGTERM/SIGINT.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use freeflow::{config, logger, queue, receiver, signals, telemetry, worker};

/// NetFlow v5 collector that ships decoded events to Splunk HEC.
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to the freeflow configuration file.
    #[clap(short = 'c', long = "config")]
    config: PathBuf,

    /// Bind address:port for the ambient Prometheus metrics exporter.
    /// Metrics are always-on ambient telemetry, distinct from the
    /// collector's own Logger Sink output.
    #[clap(long = "metrics-addr", default_value = "127.0.0.1:9090")]
    metrics_addr: SocketAddr,
}

#[derive(thiserror::Error, Debug)]
enum Error {
    #[error(transparent)]
    Config(#[from] config::Error),
    #[error(transparent)]
    Receiver(#[from] receiver::Error),
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt().with_ansi(false).init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{err}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Error> {
    // Per spec §4.7 step 1, SIGTERM/SIGINT handlers are installed before
    // anything else: a signal arriving during a slow config load or
    // telemetry bind must still be caught by our handler rather than
    // falling through to the OS default (an unordered hard kill with no
    // "Terminating worker" log and no logger drain).
    let (trigger, shutdown) = signals::new();
    let trigger = Arc::new(trigger);
    install_signal_handlers(Arc::clone(&trigger));

    let config = Arc::new(config::Config::from_file(&args.config)?);
    info!(
        "loaded configuration: {} worker(s), {} HEC endpoint(s), bind {}:{}",
        config.threads,
        config.hec_endpoints.len(),
        config.bind_addr,
        config.bind_port
    );

    if let Err(err) = telemetry::install(args.metrics_addr) {
        // Ambient telemetry is never allowed to stop the collector from
        // starting: log and carry on without a /metrics endpoint.
        error!("metrics exporter did not start: {err}");
    }

    let (log_sink, log_drain) = logger::channel(&config);
    let logger_handle = tokio::spawn(logger::run(config.log_file.clone(), log_drain));
    log_sink.info("Logging process started.".to_string());

    let (queue_tx, queue_rx) = queue::bounded(&config);

    let mut worker_handles = Vec::with_capacity(config.threads as usize);
    for index in 0..config.threads as usize {
        let config = Arc::clone(&config);
        let queue_tx = queue_tx.clone();
        let queue_rx = queue_rx.clone();
        let log_sink = log_sink.clone();
        let worker_shutdown = shutdown.clone();
        let trigger = Arc::clone(&trigger);
        worker_handles.push(tokio::spawn(async move {
            if let Err(err) = worker::run(
                index,
                &config,
                queue_tx,
                queue_rx,
                log_sink.clone(),
                worker_shutdown,
            )
            .await
            {
                log_sink.error(format!("worker {index} failed to start: {err}"));
                error!("worker {index} failed to start: {err}");
                trigger.fire();
            }
        }));
    }

    let receiver_result = receiver::run(&config, queue_tx, log_sink.clone(), shutdown.clone()).await;
    // A receiver bind failure is itself fatal and must also stop the
    // workers and logger, exactly as it would have if a worker's startup
    // had failed first.
    if receiver_result.is_err() {
        trigger.fire();
    }

    for (index, handle) in worker_handles.into_iter().enumerate() {
        log_sink.info(format!("Terminating worker #{index}"));
        let _ = handle.await;
    }

    drop(log_sink);
    let _ = logger_handle.await;

    receiver_result?;
    Ok(())
}

/// Install SIGTERM and SIGINT handlers that fire the shared shutdown
/// trigger exactly once, per spec §4.7 step 1. Unlike the Logger Sink's
/// own SIGTERM handler (§4.6), these stop the Receiver and Workers, not
/// the Logger -- the supervisor terminates the Logger explicitly, last,
/// after every worker has exited.
fn install_signal_handlers(trigger: Arc<signals::Trigger>) {
    tokio::spawn(async move {
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        let mut sigint =
            signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
        trigger.fire();
    });
}
