//! TCP transport: inbound accept loop and the outbound peer pool.
//!
//! Inbound sockets are per-connection read loops that decode frames and
//! forward them to the state thread. Outbound traffic goes through one
//! writer per peer_id; each writer owns its socket, connects lazily, and
//! discards the connection on any failure, so FIFO holds per peer and a
//! dead peer never blocks the state thread.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, Sender, TrySendError};
use thiserror::Error;

use crate::config::Limits;
use crate::proto::{Envelope, LineReader, LineWriter, NodeId, PeerInfo};

use super::metrics;
use super::run::Event;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },
    #[error("peer node_{peer} unreachable: {source}")]
    PeerUnreachable {
        peer: NodeId,
        source: std::io::Error,
    },
}

/// Inbound listener. Accepts connections until shutdown and spawns one
/// reader thread per socket; each decoded frame lands on the event
/// channel. Framing errors close that connection only.
pub struct Server {
    local_addr: SocketAddr,
    join: JoinHandle<()>,
}

impl Server {
    pub fn start(
        listen_addr: &str,
        limits: &Limits,
        events: Sender<Event>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(listen_addr).map_err(|source| TransportError::Bind {
            addr: listen_addr.to_string(),
            source,
        })?;
        let local_addr = listener.local_addr().map_err(|source| TransportError::Bind {
            addr: listen_addr.to_string(),
            source,
        })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| TransportError::Bind {
                addr: listen_addr.to_string(),
                source,
            })?;
        tracing::info!("listening on {local_addr}");

        let max_line_bytes = limits.max_line_bytes;
        let join = thread::spawn(move || {
            accept_loop(listener, max_line_bytes, events, shutdown);
        });

        Ok(Self { local_addr, join })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn join(self) {
        let _ = self.join.join();
    }
}

fn accept_loop(
    listener: TcpListener,
    max_line_bytes: usize,
    events: Sender<Event>,
    shutdown: Arc<AtomicBool>,
) {
    loop {
        if shutdown.load(Ordering::Relaxed) {
            return;
        }
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                tracing::debug!("connection from {peer_addr}");
                let events = events.clone();
                thread::spawn(move || {
                    let _ = stream.set_nonblocking(false);
                    read_loop(stream, peer_addr, max_line_bytes, events);
                });
            }
            Err(ref err) if err.kind() == ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(err) => {
                tracing::error!("accept error: {err}");
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn read_loop(
    stream: TcpStream,
    peer_addr: SocketAddr,
    max_line_bytes: usize,
    events: Sender<Event>,
) {
    let mut reader = LineReader::new(stream, max_line_bytes);
    loop {
        match reader.read_envelope() {
            Ok(Some(envelope)) => {
                if events.send(Event::Inbound(envelope)).is_err() {
                    return;
                }
            }
            Ok(None) => {
                tracing::debug!("connection from {peer_addr} closed");
                return;
            }
            Err(err) => {
                // Protocol violation or socket error: drop this
                // connection, never the node.
                tracing::warn!("closing connection from {peer_addr}: {err}");
                return;
            }
        }
    }
}

/// Outbound connection pool, one writer thread per peer_id.
pub struct Outbound {
    peers: BTreeMap<NodeId, PeerSender>,
    limits: Limits,
    shutdown: Arc<AtomicBool>,
}

struct PeerSender {
    info: PeerInfo,
    tx: Sender<Envelope>,
    join: JoinHandle<()>,
}

impl Outbound {
    pub fn new(limits: Limits, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            peers: BTreeMap::new(),
            limits,
            shutdown,
        }
    }

    /// Queue a frame for `peer`. Never blocks; a full queue (dead or slow
    /// peer) drops the frame, and heartbeats or elections heal the rest.
    pub fn send_to(&mut self, peer: &PeerInfo, envelope: Envelope) {
        let sender = self.sender_for(peer);
        match sender.tx.try_send(envelope) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                metrics::send_failed();
                tracing::warn!("send queue to {peer} full; dropping frame");
            }
            Err(TrySendError::Disconnected(envelope)) => {
                // Writer exited (previous shutdown or panic); start fresh.
                self.peers.remove(&peer.peer_id);
                let sender = self.sender_for(peer);
                if sender.tx.try_send(envelope).is_err() {
                    metrics::send_failed();
                    tracing::warn!("send to {peer} failed; dropping frame");
                }
            }
        }
    }

    /// Send to every peer in the set. Per-peer failures are logged and
    /// non-fatal.
    pub fn broadcast(&mut self, peers: &[PeerInfo], envelope: &Envelope) {
        for peer in peers {
            self.send_to(peer, envelope.clone());
        }
    }

    fn sender_for(&mut self, peer: &PeerInfo) -> &PeerSender {
        let stale = self
            .peers
            .get(&peer.peer_id)
            .is_some_and(|sender| sender.info.addr() != peer.addr());
        if stale {
            // The peer moved; let the old writer drain and die.
            self.peers.remove(&peer.peer_id);
        }

        self.peers.entry(peer.peer_id).or_insert_with(|| {
            let (tx, rx) = bounded(self.limits.send_queue_depth);
            let info = peer.clone();
            let writer_info = peer.clone();
            let limits = self.limits.clone();
            let shutdown = Arc::clone(&self.shutdown);
            let join = thread::spawn(move || {
                writer_loop(writer_info, rx, limits, shutdown);
            });
            PeerSender { info, tx, join }
        })
    }

    /// Drop all queues and join the writer threads.
    pub fn shutdown(self) {
        for (_, sender) in self.peers {
            drop(sender.tx);
            let _ = sender.join.join();
        }
    }
}

fn writer_loop(
    peer: PeerInfo,
    rx: Receiver<Envelope>,
    limits: Limits,
    shutdown: Arc<AtomicBool>,
) {
    let connect_timeout = Duration::from_millis(limits.connect_timeout_ms);
    let mut writer: Option<LineWriter<TcpStream>> = None;

    loop {
        let envelope = match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(envelope) => envelope,
            Err(crossbeam::channel::RecvTimeoutError::Timeout) => {
                if shutdown.load(Ordering::Relaxed) {
                    return;
                }
                continue;
            }
            Err(crossbeam::channel::RecvTimeoutError::Disconnected) => return,
        };

        if writer.is_none() {
            match connect(&peer, connect_timeout, &limits) {
                Ok(connected) => writer = Some(connected),
                Err(err) => {
                    metrics::send_failed();
                    tracing::warn!("{err}");
                    continue;
                }
            }
        }

        if let Some(active) = writer.as_mut() {
            if let Err(err) = active.write_envelope(&envelope) {
                metrics::send_failed();
                tracing::warn!("send to {peer} failed: {err}");
                // Discard; the next frame reconnects lazily.
                writer = None;
            }
        }
    }
}

fn connect(
    peer: &PeerInfo,
    timeout: Duration,
    limits: &Limits,
) -> Result<LineWriter<TcpStream>, TransportError> {
    let unreachable = |source| TransportError::PeerUnreachable {
        peer: peer.peer_id,
        source,
    };

    let mut addrs = peer
        .addr()
        .to_socket_addrs()
        .map_err(unreachable)?;
    let addr = addrs.next().ok_or_else(|| {
        unreachable(std::io::Error::new(
            ErrorKind::AddrNotAvailable,
            "no address resolved",
        ))
    })?;

    let stream = TcpStream::connect_timeout(&addr, timeout).map_err(unreachable)?;
    stream.set_nodelay(true).map_err(unreachable)?;
    tracing::debug!("connected to {peer}");
    Ok(LineWriter::new(stream, limits.max_line_bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam::channel::unbounded;

    use crate::proto::{Payload, Term};

    fn heartbeat(sender: u64) -> Envelope {
        Envelope::new(NodeId::new(sender), Term::new(1), Payload::Heartbeat)
    }

    #[test]
    fn server_delivers_inbound_frames() {
        let (tx, rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let server = Server::start("127.0.0.1:0", &Limits::default(), tx, shutdown.clone())
            .expect("bind");
        let addr = server.local_addr();

        let stream = TcpStream::connect(addr).expect("connect");
        let mut writer = LineWriter::new(stream, 1024 * 1024);
        writer.write_envelope(&heartbeat(5)).expect("write");

        let event = rx.recv_timeout(Duration::from_secs(5)).expect("event");
        match event {
            Event::Inbound(envelope) => assert_eq!(envelope.sender_id, NodeId::new(5)),
            other => panic!("unexpected event {other:?}"),
        }

        shutdown.store(true, Ordering::Relaxed);
        server.join();
    }

    #[test]
    fn malformed_frame_closes_only_that_connection() {
        use std::io::Write;

        let (tx, rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let server = Server::start("127.0.0.1:0", &Limits::default(), tx, shutdown.clone())
            .expect("bind");
        let addr = server.local_addr();

        let mut bad = TcpStream::connect(addr).expect("connect");
        bad.write_all(b"this is not json\n").expect("write");

        // A second, healthy connection still gets through.
        let stream = TcpStream::connect(addr).expect("connect");
        let mut writer = LineWriter::new(stream, 1024 * 1024);
        writer.write_envelope(&heartbeat(7)).expect("write");

        let event = rx.recv_timeout(Duration::from_secs(5)).expect("event");
        match event {
            Event::Inbound(envelope) => assert_eq!(envelope.sender_id, NodeId::new(7)),
            other => panic!("unexpected event {other:?}"),
        }

        shutdown.store(true, Ordering::Relaxed);
        server.join();
    }

    #[test]
    fn outbound_reaches_a_listening_peer() {
        let (tx, rx) = unbounded();
        let shutdown = Arc::new(AtomicBool::new(false));
        let server = Server::start("127.0.0.1:0", &Limits::default(), tx, shutdown.clone())
            .expect("bind");
        let addr = server.local_addr();

        let peer = PeerInfo::new(NodeId::new(9), addr.ip().to_string(), addr.port());
        let mut outbound = Outbound::new(Limits::default(), shutdown.clone());
        outbound.send_to(&peer, heartbeat(1));
        outbound.send_to(&peer, heartbeat(2));

        // FIFO per peer connection.
        for expected in [1u64, 2] {
            let event = rx.recv_timeout(Duration::from_secs(5)).expect("event");
            match event {
                Event::Inbound(envelope) => {
                    assert_eq!(envelope.sender_id, NodeId::new(expected));
                }
                other => panic!("unexpected event {other:?}"),
            }
        }

        shutdown.store(true, Ordering::Relaxed);
        outbound.shutdown();
        server.join();
    }

    #[test]
    fn send_to_unreachable_peer_is_not_fatal() {
        let shutdown = Arc::new(AtomicBool::new(false));
        let mut outbound = Outbound::new(
            Limits {
                connect_timeout_ms: 100,
                ..Limits::default()
            },
            shutdown.clone(),
        );
        // Reserved port that nothing listens on.
        let peer = PeerInfo::new(NodeId::new(4), "127.0.0.1", 1);
        outbound.send_to(&peer, heartbeat(1));
        thread::sleep(Duration::from_millis(300));

        shutdown.store(true, Ordering::Relaxed);
        outbound.shutdown();
    }
}
