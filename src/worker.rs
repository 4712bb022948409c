//! One HEC-shipping cursor.
//!
//! Worker `i` is permanently assigned to `config.hec_endpoints[i %
//! hec_endpoints.len()]`. Its steady-state loop pops a packet, decodes and
//! formats it, ships it to that endpoint, and interprets the response;
//! transient failures are recovered in place (reconnect + requeue), never
//! by the worker exiting. Only a startup-time failure -- bad DNS, refused
//! connect, a failed TLS handshake, or a `403` on the initial probe --
//! is fatal, and even then the worker reports it rather than panicking so
//! the supervisor can shut the whole collector down cleanly.

use std::time::Duration;

use metrics::counter;
use tokio::time::sleep;

use crate::config::Config;
use crate::decoder;
use crate::hec::session::{self, Session, Status};
use crate::hec::{self};
use crate::logger::LogSink;
use crate::queue::{Packet, Receiver as PacketReceiver, Sender as PacketSender};
use crate::signals::Shutdown;

/// How long the worker sleeps between non-blocking polls of an empty
/// packet queue. Keeps shutdown latency low without spinning the CPU.
const POLL_IDLE: Duration = Duration::from_millis(1);
/// Cool-down after a non-200/non-403 HEC response, per spec §4.5: this
/// takes the worker out of rotation while other workers -- possibly
/// targeting different HEC endpoints -- keep trying.
const REJECT_COOLDOWN: Duration = Duration::from_secs(10);
/// Delay between retries of a read that's timing out but whose socket
/// status is still healthy (a stall, not a failure).
const STALL_RETRY_DELAY: Duration = Duration::from_secs(1);
/// Largest response head this worker will buffer while looking for the
/// `\r\n\r\n` header terminator.
const HEAD_BUFFER_CAP: usize = 8192;

/// Why a worker gave up entirely. Startup failures only: a worker never
/// returns an error once it has reached the steady-state loop.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("worker {index}: session initialization failed: {source}")]
    Initialize {
        index: usize,
        #[source]
        source: session::Error,
    },
    #[error("worker {index}: connectivity probe failed: {reason}")]
    Probe { index: usize, reason: String },
    #[error("worker {index}: HEC endpoint rejected authentication (403)")]
    AuthFailed { index: usize },
}

/// Run worker `index` until `shutdown` fires.
///
/// On any startup failure this returns `Err` without shipping a single
/// packet; the caller (the supervisor) is expected to treat that as fatal
/// for the whole process, per spec §4.5/§7: "Worker signals supervisor to
/// terminate the whole process."
pub async fn run(
    index: usize,
    config: &Config,
    queue_tx: PacketSender,
    queue_rx: PacketReceiver,
    log: LogSink,
    mut shutdown: Shutdown,
) -> Result<(), Error> {
    let mut session = Session::initialize(index, config)
        .await
        .map_err(|source| Error::Initialize { index, source })?;
    log.info(format!(
        "worker {index}: connected to {}:{}",
        session.endpoint().host,
        session.endpoint().port
    ));

    probe(index, &mut session, &log).await?;

    log.info(format!("worker {index}: entering service"));
    while !shutdown.is_shutdown() {
        let Some(packet) = queue_rx.try_recv().await else {
            tokio::select! {
                () = shutdown.recv() => break,
                () = sleep(POLL_IDLE) => {}
            }
            continue;
        };

        counter!("packets_received", "worker" => index.to_string()).increment(1);
        ship(
            index,
            packet,
            &mut session,
            config,
            &queue_tx,
            &log,
            &mut shutdown,
        )
        .await;
    }

    log.info(format!("worker {index}: leaving service"));
    Ok(())
}

/// Send the empty-bodied authentication/keep-alive probe and classify the
/// response, per spec §4.5 step 3.
async fn probe(index: usize, session: &mut Session, log: &LogSink) -> Result<(), Error> {
    let request = hec::build_request(session.endpoint(), "");
    let written = session.write(&request).await.map_err(|err| Error::Probe {
        index,
        reason: format!("failed to write all bytes: {err}"),
    })?;
    if written < request.len() {
        return Err(Error::Probe {
            index,
            reason: "failed to write all bytes".to_string(),
        });
    }

    let head = match read_head(session).await {
        HeadOutcome::Complete(head) => head,
        HeadOutcome::Closed => {
            return Err(Error::Probe {
                index,
                reason: "no response to probe (possible TLS mismatch)".to_string(),
            })
        }
        HeadOutcome::TimedOut => {
            return Err(Error::Probe {
                index,
                reason: "no response to probe (read timed out)".to_string(),
            })
        }
    };

    let status = session::parse_status_line(&head).ok_or_else(|| Error::Probe {
        index,
        reason: "unparseable status line".to_string(),
    })?;

    if status == 403 {
        log.error(format!("worker {index}: unable to authenticate"));
        return Err(Error::AuthFailed { index });
    }

    // Read the JSON response body too (spec §4.5 step 3: "Read the HTTP
    // response head, then read the JSON response body") so the connection
    // is left aligned on a request boundary for the steady-state loop.
    drain_body(index, &head, session, log).await;

    Ok(())
}

/// Ship one packet: decode, write, read the response, and react. Never
/// propagates an error -- every failure path here is either logged and
/// recovered from, or ends with the packet requeued, and control always
/// returns to the caller's steady-state loop.
async fn ship(
    index: usize,
    packet: Packet,
    session: &mut Session,
    config: &Config,
    queue_tx: &PacketSender,
    log: &LogSink,
    shutdown: &mut Shutdown,
) {
    let body = match decoder::decode(&packet.datagram, packet.sender, &config.sourcetype) {
        Ok(body) => body,
        Err(err) => {
            log.warning(format!("worker {index}: dropping packet: {err}"));
            counter!("decode_errors", "worker" => index.to_string()).increment(1);
            return;
        }
    };
    if body.is_empty() {
        // A well-formed zero-record datagram: nothing to ship.
        return;
    }
    counter!("records_decoded", "worker" => index.to_string()).increment(1);

    let endpoint = session.endpoint().clone();
    let request = hec::build_request(&endpoint, &body);

    match session.write(&request).await {
        Ok(n) if n < request.len() => {
            log.warning(format!(
                "worker {index}: incomplete delivery ({n}/{} bytes)",
                request.len()
            ));
        }
        Ok(_) => {}
        Err(err) => {
            log.warning(format!("worker {index}: write failed: {err}"));
        }
    }
    counter!("hec_requests_sent", "worker" => index.to_string()).increment(1);

    match read_head(session).await {
        HeadOutcome::Complete(head) => {
            handle_response(index, packet, &head, session, config, queue_tx, log, shutdown).await;
        }
        outcome => {
            recover(index, packet, outcome, session, config, queue_tx, log, shutdown).await;
        }
    }
}

/// Interpret a response head already known to be non-empty: success,
/// rejection (requeue + cool-down), or unparseable (treated the same as
/// a dead connection, entering recovery).
async fn handle_response(
    index: usize,
    packet: Packet,
    head: &[u8],
    session: &mut Session,
    config: &Config,
    queue_tx: &PacketSender,
    log: &LogSink,
    shutdown: &mut Shutdown,
) {
    let Some(code) = session::parse_status_line(head) else {
        log.warning(format!("worker {index}: unparseable HEC response status line"));
        recover(
            index,
            packet,
            HeadOutcome::Closed,
            session,
            config,
            queue_tx,
            log,
            shutdown,
        )
        .await;
        return;
    };

    if code == 200 {
        // Drain the body before returning to the top of the steady-state
        // loop: this is a persistent connection, and leftover body bytes
        // sitting in the stream would otherwise be read as the head of
        // the *next* response.
        drain_body(index, head, session, log).await;
        return;
    }

    log.warning(format!("worker {index}: HEC responded {code}, requeuing"));
    requeue(index, packet, queue_tx, log).await;
    counter!("hec_requeues", "worker" => index.to_string()).increment(1);
    tokio::select! {
        () = shutdown.recv() => {}
        () = sleep(REJECT_COOLDOWN) => {}
    }
    log.info(format!("worker {index}: reentering service"));
    // Best-effort drain per spec §4.5 ("... log INFO 'reentering service'.
    // Then drain the response body with a second read ... before
    // returning to the top"), matching the original's own statement order
    // (`src/worker.c`: the payload `session_read` happens after the
    // `sleep(10)`/"reentering service" log, not before it).
    drain_body(index, head, session, log).await;
}

/// Recovery path for a dead or stalled connection, per spec §4.5: loop
/// between "transient stall, keep waiting" and "dead connection, requeue
/// and reconnect" until a read succeeds or shutdown fires.
///
/// `initial` is whatever the triggering read already told us: a clean
/// peer close ([`HeadOutcome::Closed`], equivalent to `recv() == 0` in
/// the original -- an unambiguous dead connection) goes straight to the
/// reconnect branch, while a timed-out read consults
/// [`Session::status`] to tell a genuine stall from a broken socket.
async fn recover(
    index: usize,
    packet: Packet,
    initial: HeadOutcome,
    session: &mut Session,
    config: &Config,
    queue_tx: &PacketSender,
    log: &LogSink,
    shutdown: &mut Shutdown,
) {
    let mut pending = initial;
    let mut attempt: u32 = 0;
    loop {
        if shutdown.is_shutdown() {
            requeue(index, packet, queue_tx, log).await;
            return;
        }

        match pending {
            HeadOutcome::Complete(head) => {
                handle_response(index, packet, &head, session, config, queue_tx, log, shutdown).await;
                return;
            }
            HeadOutcome::Closed => {
                log.warning(format!("worker {index}: HEC socket error: connection closed"));
                counter!("hec_connection_failures", "worker" => index.to_string()).increment(1);
                requeue(index, packet, queue_tx, log).await;
                reconnect(index, config, log, session, shutdown).await;
                return;
            }
            HeadOutcome::TimedOut => match session.status() {
                Status::Ok => {
                    attempt += 1;
                    log.warning(format!("worker {index}: no response, retrying [#{attempt}]"));
                    tokio::select! {
                        () = shutdown.recv() => {
                            requeue(index, packet, queue_tx, log).await;
                            return;
                        }
                        () = sleep(STALL_RETRY_DELAY) => {}
                    }
                    pending = read_head(session).await;
                }
                Status::Error(reason) => {
                    log.warning(format!("worker {index}: HEC socket error: {reason}"));
                    counter!("hec_connection_failures", "worker" => index.to_string()).increment(1);
                    requeue(index, packet, queue_tx, log).await;
                    reconnect(index, config, log, session, shutdown).await;
                    return;
                }
            },
        }
    }
}

/// Block until a fresh session replaces `session`, or shutdown fires
/// mid-reconnect (in which case `session` is left as-is; the caller has
/// already requeued the in-flight packet and is about to return).
async fn reconnect(
    index: usize,
    config: &Config,
    log: &LogSink,
    session: &mut Session,
    shutdown: &mut Shutdown,
) {
    log.info(format!("worker {index}: attempting to reestablish"));
    if let Some(new_session) = Session::reestablish(index, config, shutdown).await {
        *session = new_session;
        log.info(format!("worker {index}: reentered service"));
    }
}

/// Put `packet` back on the queue so any worker -- possibly targeting a
/// different HEC endpoint -- can retry it. Blocks if the queue is full
/// (spec §4.3: backpressure onto requeuing workers).
async fn requeue(index: usize, packet: Packet, queue_tx: &PacketSender, log: &LogSink) {
    if queue_tx.send(packet).await.is_err() {
        log.error(format!(
            "worker {index}: packet queue gone, dropping a packet on requeue"
        ));
    }
}

/// What reading a response head told us.
enum HeadOutcome {
    /// A full `\r\n\r\n`-terminated header block (or [`HEAD_BUFFER_CAP`]
    /// bytes without one, treated as complete-enough to try parsing).
    Complete(Vec<u8>),
    /// The peer performed an orderly close (`read` returned `0`) -- an
    /// unambiguous dead connection, not a stall.
    Closed,
    /// The 1s read timeout elapsed with no bytes at all.
    TimedOut,
}

/// Read until a full HTTP header block (`\r\n\r\n`) has been observed,
/// accumulating across as many individual `read()` calls as necessary.
/// Tolerates Splunk returning the response head across more than one
/// network read (spec §9 open question #2) as well as a single read that
/// already contains the whole head.
async fn read_head(session: &mut Session) -> HeadOutcome {
    let mut buf = Vec::new();
    let mut scratch = [0u8; 512];
    loop {
        match session.read(&mut scratch).await {
            Ok(0) => return HeadOutcome::Closed,
            Ok(n) => {
                buf.extend_from_slice(&scratch[..n]);
                if buf.windows(4).any(|w| w == b"\r\n\r\n") || buf.len() >= HEAD_BUFFER_CAP {
                    return HeadOutcome::Complete(buf);
                }
            }
            // A stall, whether or not we'd already started accumulating
            // a partial head -- not a close, just "no more bytes yet".
            Err(err) if err.kind() == std::io::ErrorKind::TimedOut => return HeadOutcome::TimedOut,
            Err(_) => return HeadOutcome::Closed,
        }
    }
}

/// Read and discard whatever of the response body hasn't already arrived
/// in `head` (some of which may already trail the `\r\n\r\n` terminator,
/// depending on how Splunk happened to split its writes). Best-effort: a
/// timed-out or closed read just stops the drain, since the worst case is
/// a reconnect next time around, not a hang.
async fn drain_body(index: usize, head: &[u8], session: &mut Session, log: &LogSink) {
    let terminator = head.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
    let Some(terminator) = terminator else {
        return;
    };
    let header_block = &head[..terminator];
    let already_read = head.len() - terminator;
    let total = content_length(header_block);

    if already_read >= total {
        return;
    }
    let mut remaining = total - already_read;
    let mut scratch = [0u8; 4096];
    while remaining > 0 {
        match session.read(&mut scratch).await {
            Ok(0) => return,
            Ok(n) => remaining = remaining.saturating_sub(n),
            Err(err) => {
                log.warning(format!(
                    "worker {index}: failed to drain response body: {err}"
                ));
                return;
            }
        }
    }
}

/// Parse the `Content-Length` header out of a raw HTTP header block,
/// case-insensitively, defaulting to 0 (no body) if absent or unparseable.
fn content_length(header_block: &[u8]) -> usize {
    let Ok(text) = std::str::from_utf8(header_block) else {
        return 0;
    };
    text.lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            name.trim().eq_ignore_ascii_case("content-length").then(|| value.trim())
        })
        .and_then(|value| value.parse().ok())
        .unwrap_or(0)
}
