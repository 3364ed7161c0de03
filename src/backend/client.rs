//! Request/reply access to the backend.
//!
//! Node sessions talk to the backend through their own send and receive
//! tasks. Tools that only need a single answer (operator lookups, tests)
//! use [`BackendClient`] instead, which pairs each request with the first
//! matching reply.

use super::{BackendError, ControlTransport};
use crate::node::config::NodeConfig;
use crate::node::params::NodeParams;
use crate::protocol::control::{
    ConfigRequest, ControlMessage, NodeInfoRequest, StatusinfoPost,
};
use async_trait::async_trait;
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{timeout_at, Instant};

/// Default time to wait for a backend reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Identity of the node with hardware address `address`.
    async fn fetch_node_params(&self, address: u32) -> Result<NodeParams, BackendError>;

    /// Configuration of the node with backend id `node_id`.
    async fn fetch_node_config(&self, node_id: u32) -> Result<NodeConfig, BackendError>;

    /// Upload one telemetry record. The backend does not answer.
    async fn post_status(&self, post: StatusinfoPost) -> Result<(), BackendError>;
}

/// [`BackendClient`] over any [`ControlTransport`].
///
/// Requests are serialized so a reply can only belong to the request in
/// flight.
pub struct DatagramBackend {
    transport: Arc<dyn ControlTransport>,
    timeout: Duration,
    exchange: Mutex<()>,
}

impl DatagramBackend {
    pub fn new(transport: Arc<dyn ControlTransport>) -> Self {
        Self::with_timeout(transport, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(transport: Arc<dyn ControlTransport>, timeout: Duration) -> Self {
        Self {
            transport,
            timeout,
            exchange: Mutex::new(()),
        }
    }

    /// Send `request` and wait for the first reply `pick` accepts.
    ///
    /// Unrelated messages arriving in between are dropped.
    async fn request<T>(
        &self,
        request: ControlMessage,
        pick: impl Fn(ControlMessage) -> Result<T, ControlMessage> + Send,
    ) -> Result<T, BackendError> {
        let _exchange = self.exchange.lock().await;
        self.transport.send(&request).await?;

        let deadline = Instant::now() + self.timeout;
        loop {
            let message = match timeout_at(deadline, self.transport.recv()).await {
                Ok(received) => received?,
                Err(_) => return Err(BackendError::Timeout),
            };
            match pick(message) {
                Ok(reply) => return Ok(reply),
                Err(other) => debug!(
                    "Ignoring {} while waiting for reply to {}",
                    other.name(),
                    request.name()
                ),
            }
        }
    }
}

#[async_trait]
impl BackendClient for DatagramBackend {
    async fn fetch_node_params(&self, address: u32) -> Result<NodeParams, BackendError> {
        let request = ControlMessage::NodeInfoRequest(NodeInfoRequest { address });
        let reply = self
            .request(request, |m| match m {
                ControlMessage::NodeInfoReply(reply) => Ok(reply),
                other => Err(other),
            })
            .await?;
        if reply.address != address {
            return Err(BackendError::NotFound(format!(
                "address 0x{:08X} (backend answered for 0x{:08X})",
                address, reply.address
            )));
        }
        Ok(NodeParams::from(&reply))
    }

    async fn fetch_node_config(&self, node_id: u32) -> Result<NodeConfig, BackendError> {
        let request = ControlMessage::ConfigRequest(ConfigRequest { node_id });
        let settings = self
            .request(request, |m| match m {
                ControlMessage::ConfigReply(settings) => Ok(settings),
                other => Err(other),
            })
            .await?;
        NodeConfig::from_settings(&settings).map_err(BackendError::InvalidConfig)
    }

    async fn post_status(&self, post: StatusinfoPost) -> Result<(), BackendError> {
        self.transport
            .send(&ControlMessage::StatusinfoPost(Box::new(post)))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::channel::ChannelTransport;
    use crate::protocol::control::{NodeInfoReply, Setting};

    fn reply(address: u32) -> ControlMessage {
        ControlMessage::NodeInfoReply(NodeInfoReply {
            node_id: 7,
            address,
            session_id: 1,
            code: "N7".into(),
            name: "pump".into(),
            firmware_version: 3,
            port: 8888,
        })
    }

    #[tokio::test]
    async fn test_fetch_node_params_skips_unrelated() {
        let (gateway_end, backend_end) = ChannelTransport::pair(4);
        let client = DatagramBackend::new(Arc::new(gateway_end));

        let backend = tokio::spawn(async move {
            let request = backend_end.recv().await.unwrap();
            assert!(matches!(request, ControlMessage::NodeInfoRequest(_)));
            backend_end.send(&ControlMessage::StatusinfoAck).await.unwrap();
            backend_end.send(&reply(0x0D47_3533)).await.unwrap();
            backend_end
        });

        let params = client.fetch_node_params(0x0D47_3533).await.unwrap();
        assert_eq!(params.node_id, 7);
        assert_eq!(params.session_id, 1);
        drop(backend.await.unwrap());
    }

    #[tokio::test]
    async fn test_fetch_times_out() {
        let (gateway_end, backend_end) = ChannelTransport::pair(4);
        let client = DatagramBackend::with_timeout(Arc::new(gateway_end), Duration::from_millis(50));
        let result = client.fetch_node_params(1).await;
        assert!(matches!(result, Err(BackendError::Timeout)));
        drop(backend_end);
    }

    #[tokio::test]
    async fn test_wrong_address_is_not_found() {
        let (gateway_end, backend_end) = ChannelTransport::pair(4);
        let client = DatagramBackend::new(Arc::new(gateway_end));
        backend_end.send(&reply(0x0000_0002)).await.unwrap();
        let result = client.fetch_node_params(0x0000_0001).await;
        assert!(matches!(result, Err(BackendError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_incomplete_config_is_rejected() {
        let (gateway_end, backend_end) = ChannelTransport::pair(4);
        let client = DatagramBackend::new(Arc::new(gateway_end));
        backend_end
            .send(&ControlMessage::ConfigReply(vec![Setting::new(
                "node.statusinfo_interval",
                "int",
                60,
            )]))
            .await
            .unwrap();
        let result = client.fetch_node_config(7).await;
        assert!(matches!(result, Err(BackendError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_closed_transport() {
        let (gateway_end, backend_end) = ChannelTransport::pair(4);
        drop(backend_end);
        let client = DatagramBackend::new(Arc::new(gateway_end));
        assert!(matches!(
            client.fetch_node_config(7).await,
            Err(BackendError::Closed)
        ));
    }
}
