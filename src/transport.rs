//! Datagram transport the client sends and receives DHCP messages on.
//!
//! The state machine only needs "send these bytes to that address" and
//! "wait for the next datagram". [`UdpTransport`] is the production
//! implementation; tests substitute an in-memory one.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Error, Result};

/// Largest datagram the client expects to receive.
pub const RECV_BUFFER_SIZE: usize = 1500;

pub trait Transport: Send + Sync + 'static {
    /// Sends `data` to `destination`, returning the number of bytes written.
    ///
    /// Zero bytes written is treated by the caller as a send failure.
    fn send_to(
        &self,
        data: &[u8],
        destination: SocketAddrV4,
    ) -> impl Future<Output = Result<usize>> + Send;

    /// Waits for the next datagram and copies it into `buffer`.
    fn recv(&self, buffer: &mut [u8]) -> impl Future<Output = Result<(usize, SocketAddr)>> + Send;
}

/// UDP socket bound to the DHCP client port.
#[derive(Debug)]
pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    /// Creates the client socket described by `config`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Socket`] if the socket cannot be created or bound.
    /// Binding port 68 usually requires elevated privileges.
    pub fn bind(config: &Config) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|error| Error::Socket(format!("Failed to create socket: {}", error)))?;

        socket
            .set_reuse_address(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_REUSEADDR: {}", error)))?;

        socket
            .set_broadcast(true)
            .map_err(|error| Error::Socket(format!("Failed to set SO_BROADCAST: {}", error)))?;

        socket
            .set_nonblocking(true)
            .map_err(|error| Error::Socket(format!("Failed to set non-blocking: {}", error)))?;

        #[cfg(any(target_os = "linux", target_os = "android"))]
        if let Err(error) = socket.bind_device(Some(config.interface.as_bytes())) {
            warn!(
                "Failed to bind socket to interface {}: {}",
                config.interface, error
            );
        }

        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        warn!(
            "Binding to interface {} is only supported on Linux and will be ignored",
            config.interface
        );

        let bind_addr = SocketAddrV4::new(config.listen_address, config.client_port);
        socket.bind(&bind_addr.into()).map_err(|error| {
            Error::Socket(format!("Failed to bind to {}: {}", bind_addr, error))
        })?;

        let std_socket: std::net::UdpSocket = socket.into();
        let tokio_socket = UdpSocket::from_std(std_socket).map_err(|error| {
            Error::Socket(format!("Failed to convert to tokio socket: {}", error))
        })?;

        debug!("Client socket bound to {}", bind_addr);
        Ok(Self::from_socket(tokio_socket))
    }

    /// Wraps an already bound socket.
    pub fn from_socket(socket: UdpSocket) -> Self {
        Self { socket }
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }
}

impl Transport for UdpTransport {
    async fn send_to(&self, data: &[u8], destination: SocketAddrV4) -> Result<usize> {
        Ok(self.socket.send_to(data, destination).await?)
    }

    async fn recv(&self, buffer: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(self.socket.recv_from(buffer).await?)
    }
}

/// Limited broadcast destination on the given port.
pub fn broadcast(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(Ipv4Addr::BROADCAST, port)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_destination() {
        assert_eq!(broadcast(67).to_string(), "255.255.255.255:67");
    }

    #[tokio::test]
    async fn test_loopback_send_and_recv() {
        let sender = UdpTransport::from_socket(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let receiver = UdpTransport::from_socket(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let destination = match receiver.local_addr().unwrap() {
            SocketAddr::V4(addr) => addr,
            SocketAddr::V6(_) => unreachable!("bound to an IPv4 address"),
        };

        let written = sender.send_to(b"dhcp", destination).await.unwrap();
        assert_eq!(written, 4);

        let mut buffer = [0u8; RECV_BUFFER_SIZE];
        let (size, source) = receiver.recv(&mut buffer).await.unwrap();
        assert_eq!(&buffer[..size], b"dhcp");
        assert_eq!(source, sender.local_addr().unwrap());
    }
}
