//! Backend side of the gateway.
//!
//! - [`ControlTransport`]: async datagram transport carrying [`ControlMessage`]s
//! - [`udp`]: JSON over UDP, one socket per node session
//! - [`channel`]: in-memory transport pairs
//! - [`client`]: request/reply [`BackendClient`] built on a transport

pub mod channel;
pub mod client;
pub mod udp;

use crate::node::config::ConfigError;
use crate::protocol::control::{ControlError, ControlMessage};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::sync::Arc;

pub use channel::{BackendEndpoint, ChannelTransport, ChannelTransportFactory};
pub use client::{BackendClient, DatagramBackend};
pub use udp::{UdpControlTransport, UdpTransportFactory};

/// Backend errors.
#[derive(Debug)]
pub enum BackendError {
    /// The backend has no record for the requested key.
    NotFound(String),
    /// The backend could not be reached.
    Unavailable(String),
    /// No reply within the request timeout.
    Timeout,
    /// A datagram could not be decoded.
    Malformed(ControlError),
    /// The backend sent settings that do not form a node configuration.
    InvalidConfig(ConfigError),
    /// The transport was shut down.
    Closed,
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(what) => write!(f, "backend has no record for {}", what),
            Self::Unavailable(e) => write!(f, "backend unavailable: {}", e),
            Self::Timeout => write!(f, "backend request timed out"),
            Self::Malformed(e) => write!(f, "{}", e),
            Self::InvalidConfig(e) => write!(f, "backend configuration rejected: {}", e),
            Self::Closed => write!(f, "backend transport closed"),
        }
    }
}

impl std::error::Error for BackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Malformed(e) => Some(e),
            Self::InvalidConfig(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for BackendError {
    fn from(e: io::Error) -> Self {
        Self::Unavailable(e.to_string())
    }
}

impl From<ControlError> for BackendError {
    fn from(e: ControlError) -> Self {
        match e {
            ControlError::NoRecord(cmd) => Self::NotFound(format!("reply 0x{:02X}", cmd)),
            other => Self::Malformed(other),
        }
    }
}

/// Datagram transport to the backend.
///
/// `send` and `recv` may run concurrently from different tasks.
#[async_trait]
pub trait ControlTransport: Send + Sync {
    async fn send(&self, message: &ControlMessage) -> Result<(), BackendError>;

    async fn recv(&self) -> Result<ControlMessage, BackendError>;
}

/// Opens one transport per node session.
pub trait TransportFactory: Send + Sync {
    fn open(&self, address: u32) -> Result<Arc<dyn ControlTransport>, BackendError>;
}
