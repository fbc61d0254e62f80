//! Listener-side client of the streaming protocol
//!
//! Joins a streamer by sending a bootstrap DATA packet, receives audio
//! packets and leaves with DISCONNECT.

use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use crate::error::NetworkError;
use crate::network::udp::{create_client_socket, is_timeout};
use crate::protocol::{self, Packet};

/// Payload of the bootstrap packet
const BOOTSTRAP_PAYLOAD: &[u8] = b"hello";

/// Large enough for any DATA packet
const CLIENT_RECV_BUFFER: usize = crate::constants::MAX_DATAGRAM_SIZE;

/// Audio received from the streamer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedAudio {
    pub source: SocketAddr,
    pub samples: Vec<i16>,
}

/// UDP client for a streamer
pub struct StreamClient {
    socket: UdpSocket,
    server: SocketAddr,
    buffer: Vec<u8>,
    packets_received: u64,
    samples_received: u64,
}

impl StreamClient {
    /// Bind an ephemeral socket and register with the streamer
    pub fn connect(server: SocketAddr, recv_timeout: Duration) -> Result<Self, NetworkError> {
        let socket = create_client_socket(server, recv_timeout)?;
        let client = Self {
            socket,
            server,
            buffer: vec![0u8; CLIENT_RECV_BUFFER],
            packets_received: 0,
            samples_received: 0,
        };

        client.join()?;
        tracing::info!("Joined streamer at {}", server);
        Ok(client)
    }

    /// Send the bootstrap packet again, e.g. after being evicted
    pub fn join(&self) -> Result<(), NetworkError> {
        self.send_data(BOOTSTRAP_PAYLOAD)
    }

    /// Send a DATA packet to the streamer
    pub fn send_data(&self, payload: &[u8]) -> Result<(), NetworkError> {
        let datagram = protocol::frame(protocol::MessageType::Data, payload);
        self.send(&datagram)
    }

    /// Wait for the next audio packet, up to the receive timeout
    ///
    /// Returns `Ok(None)` on timeout. Datagrams that are not DATA packets
    /// are skipped.
    pub fn recv_audio(&mut self) -> Result<Option<ReceivedAudio>, NetworkError> {
        loop {
            let (len, source) = match self.socket.recv_from(&mut self.buffer) {
                Ok(received) => received,
                Err(e) if is_timeout(&e) => return Ok(None),
                Err(e) => return Err(NetworkError::ReceiveFailed(e.to_string())),
            };

            match Packet::decode(&self.buffer[..len]) {
                Ok(Packet::Data(payload)) => {
                    let samples = protocol::bytes_to_samples(&payload);
                    self.packets_received += 1;
                    self.samples_received += samples.len() as u64;
                    return Ok(Some(ReceivedAudio { source, samples }));
                }
                Ok(Packet::Disconnect) | Err(_) => {
                    tracing::debug!("Ignoring {} byte datagram from {}", len, source);
                }
            }
        }
    }

    /// Tell the streamer to stop sending to this client
    pub fn disconnect(self) -> Result<(), NetworkError> {
        self.send(&Packet::Disconnect.encode())?;
        tracing::info!("Disconnected from {}", self.server);
        Ok(())
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.socket
            .local_addr()
            .map_err(|e| NetworkError::SocketFailed(e.to_string()))
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received
    }

    pub fn samples_received(&self) -> u64 {
        self.samples_received
    }

    fn send(&self, datagram: &[u8]) -> Result<(), NetworkError> {
        self.socket
            .send_to(datagram, self.server)
            .map(|_| ())
            .map_err(|e| NetworkError::SendFailed(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::udp::DatagramSocket;

    #[test]
    fn test_connect_sends_bootstrap() {
        let server = UdpSocket::bind("127.0.0.1:0").unwrap();
        server
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let server_addr = DatagramSocket::local_addr(&server).unwrap();

        let mut client = StreamClient::connect(server_addr, Duration::from_millis(200)).unwrap();

        let mut buf = [0u8; 64];
        let (len, client_addr) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], b"\0\0\0\0hello");

        // Non-DATA datagrams are skipped, DATA is decoded
        server.send_to(b"\x01\0\0\0", client_addr).unwrap();
        server
            .send_to(&protocol::frame(protocol::MessageType::Data, &[1, 0, 2, 0]), client_addr)
            .unwrap();
        let audio = client.recv_audio().unwrap().unwrap();
        assert_eq!(audio.samples, vec![1, 2]);
        assert_eq!(client.packets_received(), 1);

        // Nothing else pending
        assert_eq!(client.recv_audio().unwrap(), None);

        client.disconnect().unwrap();
        let (len, _) = server.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..len], &[1, 0, 0, 0]);
    }
}
