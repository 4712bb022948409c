//! Binds the NetFlow v5 UDP listener and hands each datagram off to the
//! packet queue for Workers to decode and ship. Deliberately does no
//! decoding itself -- a malformed datagram is the Worker's problem to
//! reject, keeping this task's only failure mode "the socket died".

use std::net::SocketAddr;

use tokio::net::UdpSocket;

use crate::config::Config;
use crate::decoder::MAX_DATAGRAM_SIZE;
use crate::logger::LogSink;
use crate::queue::{Packet, Sender};
use crate::signals::Shutdown;

/// Turn a received datagram into a [`Packet`], or `None` if it should be
/// dropped outright (an IPv6 peer, which this collector's ingress socket
/// never validly sees per spec's IPv6 Non-goal).
fn to_packet(datagram: &[u8], peer: SocketAddr, log: &LogSink) -> Option<Packet> {
    let sender = match peer {
        SocketAddr::V4(v4) => *v4.ip(),
        SocketAddr::V6(v6) => {
            log.warning(format!("dropping datagram from ipv6 peer {v6}"));
            return None;
        }
    };
    Some(Packet {
        sender,
        datagram: datagram.to_vec(),
    })
}

/// Failure establishing the UDP listener itself. Fatal: the collector
/// can't do anything useful without it.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unable to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Run the receive loop until `shutdown` fires.
///
/// # Errors
///
/// Returns [`Error`] if the UDP socket can't be bound. Per-datagram
/// errors (a bad peer address, a transient `recv` failure) are logged
/// and do not stop the loop.
pub async fn run(
    config: &Config,
    tx: Sender,
    log: LogSink,
    mut shutdown: Shutdown,
) -> Result<(), Error> {
    let addr = SocketAddr::from((config.bind_addr, config.bind_port));
    let socket = UdpSocket::bind(addr)
        .await
        .map_err(|source| Error::Bind { addr, source })?;
    log.info(format!("listening for netflow v5 on {addr}"));

    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    loop {
        tokio::select! {
            () = shutdown.recv() => {
                log.info("receiver shutting down".to_string());
                return Ok(());
            }
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, peer)) => {
                        if let Some(packet) = to_packet(&buf[..len], peer, &log) {
                            // Blocking send applies backpressure onto this
                            // receive loop when the packet queue is full
                            // (spec §4.3), while still observing shutdown
                            // so a full queue can't delay termination.
                            tokio::select! {
                                () = shutdown.recv() => {
                                    log.info("receiver shutting down".to_string());
                                    return Ok(());
                                }
                                result = tx.send(packet) => {
                                    if result.is_err() {
                                        log.error("packet queue gone, dropping datagram".to_string());
                                    }
                                }
                            }
                        }
                    }
                    Err(err) => log.warning(format!("udp recv error: {err}")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[tokio::test]
    async fn accepted_datagram_is_enqueued() {
        let (tx, mut rx) = tokio::sync::mpsc::channel(8);
        let (sink, _drain) = crate::logger::channel(&sample_config());

        let peer = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 2055));
        let packet = to_packet(&[1, 2, 3], peer, &sink).expect("ipv4 peer yields a packet");
        tx.send(packet).await.unwrap();

        let packet = rx.recv().await.unwrap();
        assert_eq!(packet.sender, Ipv4Addr::new(203, 0, 113, 7));
        assert_eq!(packet.datagram, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn ipv6_peer_is_dropped_not_enqueued() {
        let (sink, _drain) = crate::logger::channel(&sample_config());

        let peer: SocketAddr = "[::1]:2055".parse().unwrap();
        assert!(to_packet(&[1], peer, &sink).is_none());
    }

    fn sample_config() -> Config {
        Config {
            bind_addr: Ipv4Addr::new(0, 0, 0, 0),
            bind_port: 2055,
            threads: 1,
            queue_size: 1500,
            sourcetype: "netflow".to_string(),
            hec_endpoints: vec![],
            ssl_enabled: false,
            log_file: std::path::PathBuf::new(),
            debug: false,
        }
    }
}
