//! Connectionless fan-out channel
//!
//! [`PacketChannel`] owns the server socket and the [`ClientRegistry`]. The
//! flush thread calls [`PacketChannel::broadcast`]; the listener thread
//! started by [`start_listener`] feeds every inbound datagram to
//! [`PacketChannel::handle_inbound`].

use bytes::Bytes;
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::RwLock;
use serde::Serialize;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::constants::{MAX_DATAGRAM_SIZE, RECV_BUFFER_SIZE};
use crate::error::NetworkError;
use crate::network::registry::{ClientRegistry, Endpoint};
use crate::network::udp::{create_socket, is_timeout, DatagramSocket};
use crate::protocol::{self, MessageType, Packet};

/// Pause after a receive error before trying again
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);

/// Something audio packets can be fanned out through
pub trait Broadcaster: Send + Sync {
    /// Whether anyone would receive a broadcast
    fn has_clients(&self) -> bool;

    /// Send `payload` as a DATA packet to every listener.
    /// Returns true only if every send succeeded.
    fn broadcast(&self, payload: &[u8]) -> bool;
}

/// Payload received from a listener
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundData {
    pub source: SocketAddr,
    pub payload: Bytes,
}

/// What [`PacketChannel::handle_inbound`] did with a datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundEvent {
    /// DATA packet; `joined` if the source was registered by it
    Data { joined: bool, payload_len: usize },
    /// DISCONNECT packet; `was_registered` if the source was known
    Disconnected { was_registered: bool },
    /// Short datagram or unknown type; the source is still registered
    Discarded { joined: bool },
}

/// Channel counters
#[derive(Default)]
struct ChannelCounters {
    packets_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_failures: AtomicU64,
    datagrams_received: AtomicU64,
    invalid_datagrams: AtomicU64,
    clients_joined: AtomicU64,
    clients_evicted: AtomicU64,
    data_dropped: AtomicU64,
}

/// Channel statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ChannelStats {
    pub packets_sent: u64,
    pub bytes_sent: u64,
    pub send_failures: u64,
    pub datagrams_received: u64,
    pub invalid_datagrams: u64,
    pub clients_joined: u64,
    pub clients_evicted: u64,
    /// Inbound payloads dropped because the consumer was full or gone
    pub data_dropped: u64,
    pub clients: usize,
}

/// UDP fan-out channel
pub struct PacketChannel<S = UdpSocket> {
    socket: S,
    registry: ClientRegistry,
    data_tx: RwLock<Option<Sender<InboundData>>>,
    counters: ChannelCounters,
    recv_buffer_size: usize,
}

impl PacketChannel<UdpSocket> {
    /// Bind the server socket
    pub fn bind(config: &NetworkConfig) -> Result<Self, NetworkError> {
        let socket = create_socket(config)?;
        let mut channel = Self::with_socket(socket);
        channel.recv_buffer_size = config.recv_buffer_size;

        if let Ok(addr) = channel.local_addr() {
            tracing::info!("UDP server bound on {}", addr);
        }
        Ok(channel)
    }
}

impl<S: DatagramSocket> PacketChannel<S> {
    /// Wrap an already bound socket
    pub fn with_socket(socket: S) -> Self {
        Self {
            socket,
            registry: ClientRegistry::new(),
            data_tx: RwLock::new(None),
            counters: ChannelCounters::default(),
            recv_buffer_size: RECV_BUFFER_SIZE,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.socket
            .local_addr()
            .map_err(|e| NetworkError::SocketFailed(e.to_string()))
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }

    /// Route inbound DATA payloads to `tx` (or stop routing with `None`)
    pub fn set_data_channel(&self, tx: Option<Sender<InboundData>>) {
        *self.data_tx.write() = tx;
    }

    /// Send one datagram
    pub fn send_to(&self, datagram: &[u8], target: SocketAddr) -> Result<usize, NetworkError> {
        if datagram.len() > MAX_DATAGRAM_SIZE {
            return Err(NetworkError::PacketTooLarge(datagram.len()));
        }

        match self.socket.send_to(datagram, target) {
            Ok(sent) => {
                self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.counters
                    .bytes_sent
                    .fetch_add(sent as u64, Ordering::Relaxed);
                Ok(sent)
            }
            Err(e) => {
                self.counters.send_failures.fetch_add(1, Ordering::Relaxed);
                Err(NetworkError::SendFailed(e.to_string()))
            }
        }
    }

    /// Frame `payload` as a DATA packet and send it to every registered
    /// endpoint. Endpoints whose send failed are removed after the pass.
    pub fn broadcast(&self, payload: &[u8]) -> bool {
        if payload.is_empty() {
            return false;
        }

        let datagram = protocol::frame(MessageType::Data, payload);
        let mut failed: Vec<Endpoint> = Vec::new();

        for target in self.registry.endpoints() {
            if let Err(e) = self.send_to(&datagram, target) {
                tracing::warn!("Failed to send data to client {}: {}", target, e);
                failed.push(target);
            }
        }

        for endpoint in &failed {
            if self.registry.remove(endpoint) {
                self.counters.clients_evicted.fetch_add(1, Ordering::Relaxed);
                tracing::info!("Client {} removed after send failure", endpoint);
            }
        }

        failed.is_empty()
    }

    /// Classify one inbound datagram and update the registry
    ///
    /// Any datagram registers its source, except DISCONNECT which removes
    /// it. DATA payloads go to the data channel, if one is set.
    pub fn handle_inbound(&self, datagram: &[u8], source: SocketAddr) -> InboundEvent {
        self.counters
            .datagrams_received
            .fetch_add(1, Ordering::Relaxed);

        let packet = match Packet::decode(datagram) {
            Ok(packet) => packet,
            Err(_) => {
                self.counters
                    .invalid_datagrams
                    .fetch_add(1, Ordering::Relaxed);
                let joined = self.observe(source);
                return InboundEvent::Discarded { joined };
            }
        };

        match packet {
            Packet::Disconnect => {
                let was_registered = self.registry.remove(&source);
                if was_registered {
                    tracing::info!("Received disconnect message from {}", source);
                }
                InboundEvent::Disconnected { was_registered }
            }
            Packet::Data(payload) => {
                let joined = self.observe(source);
                let payload_len = payload.len();
                if payload_len > 0 {
                    self.dispatch(InboundData { source, payload });
                }
                InboundEvent::Data {
                    joined,
                    payload_len,
                }
            }
        }
    }

    /// Wait for one datagram (up to the socket timeout) and handle it.
    /// Returns `Ok(None)` on timeout.
    pub fn receive_once(&self, buf: &mut [u8]) -> Result<Option<InboundEvent>, NetworkError> {
        match self.socket.recv_from(buf) {
            Ok((len, source)) => Ok(Some(self.handle_inbound(&buf[..len], source))),
            Err(e) if is_timeout(&e) => Ok(None),
            Err(e) => Err(NetworkError::ReceiveFailed(e.to_string())),
        }
    }

    /// Get statistics
    pub fn stats(&self) -> ChannelStats {
        let c = &self.counters;
        ChannelStats {
            packets_sent: c.packets_sent.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            datagrams_received: c.datagrams_received.load(Ordering::Relaxed),
            invalid_datagrams: c.invalid_datagrams.load(Ordering::Relaxed),
            clients_joined: c.clients_joined.load(Ordering::Relaxed),
            clients_evicted: c.clients_evicted.load(Ordering::Relaxed),
            data_dropped: c.data_dropped.load(Ordering::Relaxed),
            clients: self.registry.len(),
        }
    }

    fn observe(&self, source: SocketAddr) -> bool {
        let joined = self.registry.observe(source);
        if joined {
            self.counters.clients_joined.fetch_add(1, Ordering::Relaxed);
            tracing::info!("New client connected from {}", source);
        }
        joined
    }

    fn dispatch(&self, data: InboundData) {
        let guard = self.data_tx.read();
        let Some(tx) = guard.as_ref() else {
            tracing::debug!(
                "No data consumer, ignoring {} bytes from {}",
                data.payload.len(),
                data.source
            );
            return;
        };

        match tx.try_send(data) {
            Ok(()) => {}
            Err(TrySendError::Full(data)) => {
                self.counters.data_dropped.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(
                    "Data consumer is full, dropping {} bytes from {}",
                    data.payload.len(),
                    data.source
                );
            }
            Err(TrySendError::Disconnected(_)) => {
                self.counters.data_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl<S: DatagramSocket> Broadcaster for PacketChannel<S> {
    fn has_clients(&self) -> bool {
        !self.registry.is_empty()
    }

    fn broadcast(&self, payload: &[u8]) -> bool {
        PacketChannel::broadcast(self, payload)
    }
}

/// Handle to the receive loop thread
pub struct ListenerHandle {
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Check if the receive loop is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the receive loop. Returns within one receive timeout.
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);

        if let Some(handle) = self.thread_handle.take() {
            if handle.join().is_err() {
                tracing::error!("UDP listener thread panicked");
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Run the receive loop of `channel` on its own thread
///
/// The socket must have a read timeout, otherwise [`ListenerHandle::stop`]
/// blocks until the next datagram arrives.
pub fn start_listener<S: DatagramSocket>(
    channel: Arc<PacketChannel<S>>,
) -> Result<ListenerHandle, NetworkError> {
    let running = Arc::new(AtomicBool::new(true));
    let running_for_loop = running.clone();

    let handle = thread::Builder::new()
        .name("udp-listener".to_string())
        .spawn(move || {
            let mut buf = vec![0u8; channel.recv_buffer_size];
            tracing::debug!("UDP listener started");

            while running_for_loop.load(Ordering::Relaxed) {
                if let Err(e) = channel.receive_once(&mut buf) {
                    tracing::error!("recvfrom failed: {}", e);
                    thread::sleep(RECV_ERROR_BACKOFF);
                }
            }

            tracing::debug!("UDP listener stopped");
        })
        .map_err(|e| NetworkError::ThreadSpawn(e.to_string()))?;

    Ok(ListenerHandle {
        running,
        thread_handle: Some(handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;
    use parking_lot::Mutex;
    use std::collections::{HashSet, VecDeque};
    use std::io;

    /// In-memory transport with per-destination failure injection
    #[derive(Default)]
    struct MockSocket {
        sent: Mutex<Vec<(SocketAddr, Vec<u8>)>>,
        failing: Mutex<HashSet<SocketAddr>>,
        inbound: Mutex<VecDeque<(Vec<u8>, SocketAddr)>>,
    }

    impl MockSocket {
        fn fail_sends_to(&self, target: SocketAddr) {
            self.failing.lock().insert(target);
        }

        fn take_sent(&self) -> Vec<(SocketAddr, Vec<u8>)> {
            std::mem::take(&mut *self.sent.lock())
        }
    }

    impl DatagramSocket for MockSocket {
        fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
            if self.failing.lock().contains(&target) {
                return Err(io::Error::new(io::ErrorKind::Other, "host unreachable"));
            }
            self.sent.lock().push((target, buf.to_vec()));
            Ok(buf.len())
        }

        fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
            match self.inbound.lock().pop_front() {
                Some((data, source)) => {
                    buf[..data.len()].copy_from_slice(&data);
                    Ok((data.len(), source))
                }
                None => {
                    // Stand-in for the socket read timeout
                    thread::sleep(Duration::from_millis(1));
                    Err(io::Error::new(io::ErrorKind::WouldBlock, "empty"))
                }
            }
        }

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok(SocketAddr::from(([127, 0, 0, 1], 5001)))
        }
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([192, 168, 4, 2], port))
    }

    fn data_packet(payload: &[u8]) -> Vec<u8> {
        protocol::frame(MessageType::Data, payload).to_vec()
    }

    #[test]
    fn test_data_registers_once() {
        let channel = PacketChannel::with_socket(MockSocket::default());

        assert_eq!(
            channel.handle_inbound(&data_packet(b"hi"), addr(4000)),
            InboundEvent::Data {
                joined: true,
                payload_len: 2
            }
        );
        assert_eq!(
            channel.handle_inbound(&data_packet(b"hi"), addr(4000)),
            InboundEvent::Data {
                joined: false,
                payload_len: 2
            }
        );
        assert_eq!(channel.registry().len(), 1);
        assert_eq!(channel.stats().clients_joined, 1);
    }

    #[test]
    fn test_disconnect_removes_unseen_endpoint() {
        let channel = PacketChannel::with_socket(MockSocket::default());
        let disconnect = Packet::Disconnect.encode();

        assert_eq!(
            channel.handle_inbound(&disconnect, addr(4000)),
            InboundEvent::Disconnected {
                was_registered: false
            }
        );
        assert!(!channel.registry().contains(&addr(4000)));

        channel.handle_inbound(&data_packet(&[]), addr(4000));
        assert!(channel.registry().contains(&addr(4000)));
        channel.handle_inbound(&disconnect, addr(4000));
        assert!(channel.registry().is_empty());
    }

    #[test]
    fn test_malformed_datagrams() {
        let channel = PacketChannel::with_socket(MockSocket::default());

        // Short datagrams and unknown types are discarded, but still join
        assert_eq!(
            channel.handle_inbound(&[0, 0], addr(4000)),
            InboundEvent::Discarded { joined: true }
        );
        assert_eq!(
            channel.handle_inbound(b"hello", addr(4000)),
            InboundEvent::Discarded { joined: false }
        );

        let stats = channel.stats();
        assert_eq!(stats.invalid_datagrams, 2);
        assert_eq!(stats.datagrams_received, 2);
        assert_eq!(stats.clients, 1);
    }

    #[test]
    fn test_disconnect_after_raw_join() {
        let channel = PacketChannel::with_socket(MockSocket::default());

        // A plain-text join never sends a DATA packet
        assert_eq!(
            channel.handle_inbound(b"hello", addr(4000)),
            InboundEvent::Discarded { joined: true }
        );
        assert!(channel.registry().contains(&addr(4000)));

        assert_eq!(
            channel.handle_inbound(&Packet::Disconnect.encode(), addr(4000)),
            InboundEvent::Disconnected {
                was_registered: true
            }
        );
        assert!(channel.registry().is_empty());

        // Nothing goes out to the departed endpoint
        channel.broadcast(&[1, 0]);
        assert!(channel.socket.take_sent().is_empty());
    }

    #[test]
    fn test_data_dispatched_to_consumer() {
        let channel = PacketChannel::with_socket(MockSocket::default());
        let (tx, rx) = bounded(1);
        channel.set_data_channel(Some(tx));

        channel.handle_inbound(&data_packet(b"one"), addr(4000));
        channel.handle_inbound(&data_packet(b"two"), addr(4000));
        // Empty payloads are not dispatched
        channel.handle_inbound(&data_packet(&[]), addr(4000));

        let received = rx.try_recv().unwrap();
        assert_eq!(received.source, addr(4000));
        assert_eq!(&received.payload[..], b"one");
        assert!(rx.try_recv().is_err());
        assert_eq!(channel.stats().data_dropped, 1);
    }

    #[test]
    fn test_broadcast_frames_payload() {
        let channel = PacketChannel::with_socket(MockSocket::default());
        channel.registry().observe(addr(4000));
        channel.registry().observe(addr(4001));

        assert!(channel.broadcast(&[7, 8]));

        let mut sent = channel.socket.take_sent();
        sent.sort_by_key(|(target, _)| target.port());
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], (addr(4000), vec![0, 0, 0, 0, 7, 8]));
        assert_eq!(sent[1], (addr(4001), vec![0, 0, 0, 0, 7, 8]));
        assert_eq!(channel.stats().bytes_sent, 12);
    }

    #[test]
    fn test_broadcast_empty_payload() {
        let channel = PacketChannel::with_socket(MockSocket::default());
        channel.registry().observe(addr(4000));

        assert!(!channel.broadcast(&[]));
        assert!(channel.socket.take_sent().is_empty());
        assert!(channel.registry().contains(&addr(4000)));
    }

    #[test]
    fn test_broadcast_without_clients() {
        let channel = PacketChannel::with_socket(MockSocket::default());
        assert!(!channel.has_clients());
        assert!(channel.broadcast(&[1, 2]));
        assert_eq!(channel.stats().packets_sent, 0);
    }

    #[test]
    fn test_failed_endpoint_evicted() {
        let channel = PacketChannel::with_socket(MockSocket::default());
        let a = addr(4000);
        let b = addr(4001);
        channel.registry().observe(a);
        channel.registry().observe(b);
        channel.socket.fail_sends_to(a);

        let payload = vec![0x55u8; 1920];
        assert!(!channel.broadcast(&payload));
        assert!(!channel.registry().contains(&a));
        assert!(channel.registry().contains(&b));

        let sent = channel.socket.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, b);
        assert_eq!(sent[0].1.len(), 1924);

        // Next pass only reaches B and succeeds
        assert!(channel.broadcast(&payload));
        let sent = channel.socket.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, b);

        let stats = channel.stats();
        assert_eq!(stats.send_failures, 1);
        assert_eq!(stats.clients_evicted, 1);
        assert_eq!(stats.clients, 1);
    }

    #[test]
    fn test_oversized_datagram_rejected() {
        let channel = PacketChannel::with_socket(MockSocket::default());
        let datagram = vec![0u8; MAX_DATAGRAM_SIZE + 1];
        assert!(matches!(
            channel.send_to(&datagram, addr(4000)),
            Err(NetworkError::PacketTooLarge(_))
        ));
    }

    #[test]
    fn test_receive_once() {
        let channel = PacketChannel::with_socket(MockSocket::default());
        channel
            .socket
            .inbound
            .lock()
            .push_back((data_packet(b"x"), addr(4000)));

        let mut buf = [0u8; 64];
        assert_eq!(
            channel.receive_once(&mut buf).unwrap(),
            Some(InboundEvent::Data {
                joined: true,
                payload_len: 1
            })
        );
        assert_eq!(channel.receive_once(&mut buf).unwrap(), None);
    }

    #[test]
    fn test_listener_thread() {
        let channel = Arc::new(PacketChannel::with_socket(MockSocket::default()));
        channel
            .socket
            .inbound
            .lock()
            .push_back((data_packet(b"x"), addr(4000)));

        let mut listener = start_listener(channel.clone()).unwrap();
        assert!(listener.is_running());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while !channel.registry().contains(&addr(4000)) && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        listener.stop();

        assert!(!listener.is_running());
        assert!(channel.registry().contains(&addr(4000)));
    }
}
