//! Owns the TCP (and optional TLS 1.2) connection to one HEC endpoint.
//!
//! A [`Session`] knows how to establish itself, read, write, and report its
//! own health; it deliberately does *not* decide when a read/write failure
//! means "reconnect" -- that classification is the Worker's job (spec
//! §4.2: "The Session itself does not classify").

use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use native_tls::Protocol;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::config::{Config, HecEndpoint};
use crate::signals::Shutdown;

/// Read/write/connect timeout, matching the original's 1s `SO_RCVTIMEO`.
const IO_TIMEOUT: Duration = Duration::from_secs(1);
/// Delay between reconnect attempts in [`Session::reestablish`].
const REESTABLISH_DELAY: Duration = Duration::from_secs(10);
/// TCP keepalive idle time and probe interval, both 60s per the original.
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);

/// Errors that can occur while establishing a [`Session`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Hostname failed to resolve.
    #[error("unknown host {host}: {source}")]
    Dns {
        host: String,
        #[source]
        source: io::Error,
    },
    /// TCP connect failed.
    #[error("couldn't connect to {host}:{port}: {source}")]
    Connect {
        host: String,
        port: u16,
        #[source]
        source: io::Error,
    },
    /// Enabling `SO_KEEPALIVE` (or its idle/interval options) failed.
    #[error("unable to enable TCP keepalive: {0}")]
    Keepalive(#[source] io::Error),
    /// The TLS 1.2 client handshake failed.
    #[error("TLS handshake error: {0}")]
    TlsHandshake(#[source] native_tls::Error),
    /// Building the TLS connector itself failed.
    #[error("unable to build TLS connector: {0}")]
    TlsConnector(#[source] native_tls::Error),
}

/// The transport underneath a [`Session`]: plain TCP, or TCP wrapped in a
/// TLS 1.2 client handshake. Exposes identical read/write/status behavior
/// to callers regardless of which variant is active.
enum Transport {
    Plain(TcpStream),
    Tls(Box<tokio_native_tls::TlsStream<TcpStream>>),
}

/// Outcome of [`Session::status`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    /// Socket reports no pending error.
    Ok,
    /// Socket reports the given error (`getsockopt(SO_ERROR)` equivalent).
    Error(String),
}

/// A live connection to one HEC endpoint.
pub struct Session {
    transport: Transport,
    raw_fd: RawFd,
    endpoint: HecEndpoint,
}

impl Session {
    /// Open a TCP connection to `config.hec_endpoints[worker_index %
    /// hec_endpoints.len()]`, enable keepalive, and if `config.ssl_enabled`
    /// perform a TLS 1.2 client handshake on top.
    ///
    /// # Errors
    ///
    /// Returns [`Error`] on DNS failure, connect failure, inability to
    /// enable keepalive, or TLS handshake failure.
    pub async fn initialize(worker_index: usize, config: &Config) -> Result<Self, Error> {
        let endpoint = config.hec_endpoints[worker_index % config.hec_endpoints.len()].clone();

        let addr = format!("{}:{}", endpoint.host, endpoint.port);
        let mut addrs = tokio::net::lookup_host(&addr).await.map_err(|source| Error::Dns {
            host: endpoint.host.clone(),
            source,
        })?;
        let resolved = addrs.next().ok_or_else(|| Error::Dns {
            host: endpoint.host.clone(),
            source: io::Error::new(io::ErrorKind::NotFound, "no addresses returned"),
        })?;

        let tcp = TcpStream::connect(resolved)
            .await
            .map_err(|source| Error::Connect {
                host: endpoint.host.clone(),
                port: endpoint.port,
                source,
            })?;

        let keepalive = socket2::TcpKeepalive::new()
            .with_time(KEEPALIVE_TIME)
            .with_interval(KEEPALIVE_TIME);
        socket2::SockRef::from(&tcp)
            .set_tcp_keepalive(&keepalive)
            .map_err(Error::Keepalive)?;

        let raw_fd = tcp.as_raw_fd();

        let transport = if config.ssl_enabled {
            let connector = native_tls::TlsConnector::builder()
                .min_protocol_version(Some(Protocol::Tlsv12))
                .max_protocol_version(Some(Protocol::Tlsv12))
                .build()
                .map_err(Error::TlsConnector)?;
            let connector = tokio_native_tls::TlsConnector::from(connector);
            let tls = connector
                .connect(&endpoint.host, tcp)
                .await
                .map_err(Error::TlsHandshake)?;
            Transport::Tls(Box::new(tls))
        } else {
            Transport::Plain(tcp)
        };

        Ok(Session {
            transport,
            raw_fd,
            endpoint,
        })
    }

    /// Retry [`Session::initialize`] every 10 seconds, indefinitely,
    /// until it succeeds or `shutdown` fires. Blocks the caller the whole
    /// time, matching the original's `reestablish_session`.
    ///
    /// Returns `None` if shutdown fired before a connection could be
    /// reestablished.
    pub async fn reestablish(
        worker_index: usize,
        config: &Config,
        shutdown: &mut Shutdown,
    ) -> Option<Self> {
        loop {
            tokio::select! {
                () = shutdown.recv() => return None,
                () = tokio::time::sleep(REESTABLISH_DELAY) => {}
            }
            match Self::initialize(worker_index, config).await {
                Ok(session) => return Some(session),
                Err(_) => continue,
            }
        }
    }

    /// The endpoint this session is connected to.
    #[must_use]
    pub fn endpoint(&self) -> &HecEndpoint {
        &self.endpoint
    }

    /// Write `buf`, bounded by the same 1s timeout as reads. Short writes
    /// are returned as-is (`Ok(n)` with `n < buf.len()`); the caller
    /// decides whether that's acceptable.
    pub async fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let fut = match &mut self.transport {
            Transport::Plain(s) => Box::pin(s.write(buf)) as std::pin::Pin<Box<dyn std::future::Future<Output = io::Result<usize>> + Send + '_>>,
            Transport::Tls(s) => Box::pin(s.write(buf)),
        };
        match tokio::time::timeout(IO_TIMEOUT, fut).await {
            Ok(result) => result,
            Err(_) => Ok(0),
        }
    }

    /// Read into `buf`, bounded by a 1s timeout, the async analogue of
    /// the original's `SO_RCVTIMEO`. `Ok(0)` means the peer performed an
    /// orderly close (a dead connection, not a stall) -- this is kept
    /// distinct from a timeout, which is reported as
    /// `Err(ErrorKind::TimedOut)` so the Worker can tell "no response
    /// yet, keep waiting" apart from "this connection is gone".
    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let fut = match &mut self.transport {
            Transport::Plain(s) => Box::pin(s.read(buf)) as std::pin::Pin<Box<dyn std::future::Future<Output = io::Result<usize>> + Send + '_>>,
            Transport::Tls(s) => Box::pin(s.read(buf)),
        };
        match tokio::time::timeout(IO_TIMEOUT, fut).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out")),
        }
    }

    /// Check the underlying socket for a pending error, the async
    /// equivalent of `getsockopt(SOL_SOCKET, SO_ERROR)`.
    #[must_use]
    pub fn status(&self) -> Status {
        // SAFETY: `raw_fd` is the descriptor backing `self.transport` for
        // the entire lifetime of this `Session`; it is never closed out
        // from under us and never reused for anything else.
        let sock_ref = unsafe { socket2::SockRef::from_raw_fd(self.raw_fd) };
        match sock_ref.take_error() {
            Ok(Some(err)) => Status::Error(err.to_string()),
            Ok(None) => Status::Ok,
            Err(err) => Status::Error(err.to_string()),
        }
    }
}

/// Extract the HTTP status code from a response's first line: the second
/// whitespace-delimited token, e.g. `200` from `HTTP/1.1 200 OK`.
#[must_use]
pub fn parse_status_line(head: &[u8]) -> Option<u16> {
    let text = std::str::from_utf8(head).ok()?;
    let first_line = text.split("\r\n").next()?;
    first_line.split_whitespace().nth(1)?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_status_code_from_response_line() {
        assert_eq!(
            parse_status_line(b"HTTP/1.1 200 OK\r\nContent-Type: application/json\r\n"),
            Some(200)
        );
        assert_eq!(parse_status_line(b"HTTP/1.1 403 Forbidden\r\n"), Some(403));
    }

    #[test]
    fn unparseable_status_line_is_none() {
        assert_eq!(parse_status_line(b""), None);
        assert_eq!(parse_status_line(b"garbage"), None);
    }
}
