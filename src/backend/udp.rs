//! JSON control messages over UDP.
//!
//! Each node session gets its own socket bound to an ephemeral port, so
//! backend replies land on the session that asked for them.

use super::{BackendError, ControlTransport, TransportFactory};
use crate::protocol::control::ControlMessage;
use async_trait::async_trait;
use log::{debug, info};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::UdpSocket;

/// Largest control datagram accepted.
pub const MAX_DATAGRAM: usize = 8192;

pub struct UdpControlTransport {
    socket: UdpSocket,
    backend: SocketAddr,
}

impl UdpControlTransport {
    /// Bind `local` and talk to `backend`.
    ///
    /// Binds through std so it can be called outside an async context; the
    /// socket is registered with the runtime that is current at call time.
    pub fn bind(local: SocketAddr, backend: SocketAddr) -> io::Result<Self> {
        let std_socket = std::net::UdpSocket::bind(local)?;
        std_socket.set_nonblocking(true)?;
        let socket = UdpSocket::from_std(std_socket)?;
        Ok(Self { socket, backend })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn backend(&self) -> SocketAddr {
        self.backend
    }
}

#[async_trait]
impl ControlTransport for UdpControlTransport {
    async fn send(&self, message: &ControlMessage) -> Result<(), BackendError> {
        let json = message.to_json()?;
        self.socket.send_to(json.as_bytes(), self.backend).await?;
        debug!("-> {} {} ({} bytes)", self.backend, message.name(), json.len());
        Ok(())
    }

    async fn recv(&self) -> Result<ControlMessage, BackendError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        let (len, from) = self.socket.recv_from(&mut buf).await?;
        let message = ControlMessage::from_json(&buf[..len])?;
        debug!("<- {} {} ({} bytes)", from, message.name(), len);
        Ok(message)
    }
}

/// Opens one [`UdpControlTransport`] per session.
#[derive(Debug, Clone)]
pub struct UdpTransportFactory {
    bind_ip: IpAddr,
    backend: SocketAddr,
}

impl UdpTransportFactory {
    pub fn new(bind_ip: IpAddr, backend: SocketAddr) -> Self {
        Self { bind_ip, backend }
    }
}

impl TransportFactory for UdpTransportFactory {
    fn open(&self, address: u32) -> Result<Arc<dyn ControlTransport>, BackendError> {
        let transport = UdpControlTransport::bind(SocketAddr::new(self.bind_ip, 0), self.backend)?;
        if let Ok(local) = transport.local_addr() {
            info!(
                "Control socket for node 0x{:08X} on {} -> {}",
                address, local, self.backend
            );
        }
        Ok(Arc::new(transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::control::NodeInfoRequest;
    use std::time::Duration;

    #[tokio::test]
    async fn test_request_reaches_backend_socket() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        let transport =
            UdpControlTransport::bind("127.0.0.1:0".parse().unwrap(), backend_addr).unwrap();

        transport
            .send(&ControlMessage::NodeInfoRequest(NodeInfoRequest {
                address: 0x0D47_3533,
            }))
            .await
            .unwrap();

        let mut buf = [0u8; 1024];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), backend.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&buf[..len]).unwrap();
        assert_eq!(value["topic"], "getInfo");
        assert_eq!(value["data"]["address"], "0x0D473533");

        backend
            .send_to(br#"{"cmd": 4, "data": {}}"#, from)
            .await
            .unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(2), transport.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply, ControlMessage::ResetHard);
    }

    #[tokio::test]
    async fn test_empty_reply_maps_to_not_found() {
        let backend = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let factory = UdpTransportFactory::new(
            "127.0.0.1".parse().unwrap(),
            backend.local_addr().unwrap(),
        );
        let transport = factory.open(1).unwrap();
        transport.send(&ControlMessage::StatusinfoAck).await.unwrap();

        let mut buf = [0u8; 1024];
        let (_, from) = backend.recv_from(&mut buf).await.unwrap();
        backend
            .send_to(br#"{"cmd": 1, "data": {}}"#, from)
            .await
            .unwrap();
        let result = tokio::time::timeout(Duration::from_secs(2), transport.recv())
            .await
            .unwrap();
        assert!(matches!(result, Err(BackendError::NotFound(_))));
    }
}
