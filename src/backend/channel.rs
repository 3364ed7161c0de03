//! In-memory control transport.
//!
//! Used by tests and the simulator in place of a UDP backend.

use super::{BackendError, ControlTransport, TransportFactory};
use crate::protocol::control::ControlMessage;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

/// Default depth of each direction of a channel pair.
pub const DEFAULT_CHANNEL_DEPTH: usize = 16;

/// One end of a bidirectional in-memory link.
pub struct ChannelTransport {
    tx: mpsc::Sender<ControlMessage>,
    rx: Mutex<mpsc::Receiver<ControlMessage>>,
}

impl ChannelTransport {
    /// Two connected ends: what one sends, the other receives.
    pub fn pair(depth: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel(depth);
        let (b_tx, b_rx) = mpsc::channel(depth);
        (
            Self {
                tx: a_tx,
                rx: Mutex::new(b_rx),
            },
            Self {
                tx: b_tx,
                rx: Mutex::new(a_rx),
            },
        )
    }
}

#[async_trait]
impl ControlTransport for ChannelTransport {
    async fn send(&self, message: &ControlMessage) -> Result<(), BackendError> {
        self.tx
            .send(message.clone())
            .await
            .map_err(|_| BackendError::Closed)
    }

    async fn recv(&self) -> Result<ControlMessage, BackendError> {
        self.rx.lock().await.recv().await.ok_or(BackendError::Closed)
    }
}

/// Backend side of a session opened through [`ChannelTransportFactory`].
pub struct BackendEndpoint {
    /// Node address the session was opened for.
    pub address: u32,
    pub transport: ChannelTransport,
}

/// Hands the backend end of every opened session to a receiver.
pub struct ChannelTransportFactory {
    endpoints: mpsc::Sender<BackendEndpoint>,
    depth: usize,
}

impl ChannelTransportFactory {
    pub fn new(depth: usize) -> (Self, mpsc::Receiver<BackendEndpoint>) {
        let (endpoints, rx) = mpsc::channel(DEFAULT_CHANNEL_DEPTH);
        (Self { endpoints, depth }, rx)
    }
}

impl TransportFactory for ChannelTransportFactory {
    fn open(&self, address: u32) -> Result<Arc<dyn ControlTransport>, BackendError> {
        let (session_end, backend_end) = ChannelTransport::pair(self.depth);
        self.endpoints
            .try_send(BackendEndpoint {
                address,
                transport: backend_end,
            })
            .map_err(|e| BackendError::Unavailable(e.to_string()))?;
        Ok(Arc::new(session_end))
    }
}
