//! Radio side of the gateway.
//!
//! - [`radio`]: the [`Transceiver`] capability and its completion events
//! - [`tx_queue`]: outbound frames waiting for the channel
//! - [`scheduler`]: the loop that owns the radio
//! - [`udp_air`]: a [`Transceiver`] that runs over UDP for hosts without a radio

pub mod radio;
pub mod scheduler;
pub mod tx_queue;
pub mod udp_air;

pub use radio::{CompletionSink, LinkQuality, RadioError, RadioEvent, Transceiver};
pub use scheduler::{ChannelState, GatewayScheduler, SchedulerConfig, SchedulerError};
pub use tx_queue::{Downlink, TxQueue};
pub use udp_air::{UdpAir, UdpAirConfig};
