//! LoRa sensor gateway library.
//!
//! The gateway owns one half-duplex LoRa radio shared by many vibration
//! sensor nodes. It decodes their frames, runs one session state machine per
//! node and relays node data to a backend over a JSON datagram control plane.
//!
//! Everything here runs on a host; the radio is reached through the
//! [`gateway::Transceiver`] trait (SX127x register driver or UDP emulation).

pub mod backend;
pub mod config;
pub mod gateway;
pub mod lora;
pub mod node;
pub mod persistence;
pub mod protocol;
pub mod registry;
pub mod stats;

pub use backend::{BackendClient, BackendError, ControlTransport, DatagramBackend, TransportFactory};
pub use config::{ConfigError, GatewayConfig};
pub use gateway::{ChannelState, GatewayScheduler, SchedulerConfig, Transceiver, UdpAir};
pub use node::{NodeSession, SessionState};
pub use persistence::CaptureStore;
pub use protocol::{ControlMessage, RadioPacket};
pub use registry::{RegistryConfig, RouteOutcome, SessionRegistry};
pub use stats::{GatewayStats, StatsServer, DEFAULT_STATS_PORT};
