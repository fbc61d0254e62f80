//! UDP socket setup and the datagram transport abstraction

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::NetworkError;

/// Connectionless datagram transport
///
/// Implemented for [`std::net::UdpSocket`]; the fan-out logic only talks to
/// this trait so it can run over an in-memory transport in tests.
pub trait DatagramSocket: Send + Sync + 'static {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize>;

    /// Blocking receive; a timeout surfaces as `WouldBlock` or `TimedOut`
    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl DatagramSocket for UdpSocket {
    fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        UdpSocket::send_to(self, buf, target)
    }

    fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        UdpSocket::recv_from(self, buf)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        UdpSocket::local_addr(self)
    }
}

/// Whether an IO error is a receive timeout rather than a failure
pub fn is_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Create and bind the server socket
pub fn create_socket(config: &NetworkConfig) -> Result<UdpSocket, NetworkError> {
    let addr = config.bind_addr()?;

    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::SocketFailed(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::SocketFailed(e.to_string()))?;

    if let Some(size) = config.socket_send_buffer {
        socket
            .set_send_buffer_size(size)
            .map_err(|e| NetworkError::SocketFailed(format!("SO_SNDBUF: {}", e)))?;
    }
    if let Some(size) = config.socket_recv_buffer {
        socket
            .set_recv_buffer_size(size)
            .map_err(|e| NetworkError::SocketFailed(format!("SO_RCVBUF: {}", e)))?;
    }

    socket
        .set_read_timeout(Some(config.recv_timeout()))
        .map_err(|e| NetworkError::SocketFailed(e.to_string()))?;

    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    Ok(socket.into())
}

/// Create a client socket on an ephemeral port of the server's address family
pub fn create_client_socket(
    server: SocketAddr,
    recv_timeout: Duration,
) -> Result<UdpSocket, NetworkError> {
    let local_ip = match server.ip() {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let local = SocketAddr::new(local_ip, 0);

    let socket = Socket::new(Domain::for_address(local), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::SocketFailed(e.to_string()))?;
    socket
        .set_read_timeout(Some(recv_timeout))
        .map_err(|e| NetworkError::SocketFailed(e.to_string()))?;
    socket
        .bind(&local.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", local, e)))?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loopback_config() -> NetworkConfig {
        NetworkConfig {
            bind_address: "127.0.0.1".into(),
            udp_port: 0,
            recv_timeout_ms: 50,
            ..Default::default()
        }
    }

    #[test]
    fn test_create_socket_ephemeral() {
        let socket = create_socket(&loopback_config()).unwrap();
        let addr = DatagramSocket::local_addr(&socket).unwrap();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
    }

    #[test]
    fn test_recv_timeout() {
        let socket = create_socket(&loopback_config()).unwrap();
        let mut buf = [0u8; 16];
        let err = DatagramSocket::recv_from(&socket, &mut buf).unwrap_err();
        assert!(is_timeout(&err));
    }

    #[test]
    fn test_invalid_bind_address() {
        let config = NetworkConfig {
            bind_address: "localhost:80".into(),
            ..loopback_config()
        };
        assert!(matches!(
            create_socket(&config),
            Err(NetworkError::InvalidAddress(_))
        ));
    }

    #[test]
    fn test_client_to_server() {
        let server = create_socket(&loopback_config()).unwrap();
        let server_addr = DatagramSocket::local_addr(&server).unwrap();
        let client = create_client_socket(server_addr, Duration::from_millis(200)).unwrap();

        DatagramSocket::send_to(&client, b"ping", server_addr).unwrap();
        let mut buf = [0u8; 16];
        let (len, from) = DatagramSocket::recv_from(&server, &mut buf).unwrap();
        assert_eq!(&buf[..len], b"ping");
        assert_eq!(from.port(), DatagramSocket::local_addr(&client).unwrap().port());
    }
}
