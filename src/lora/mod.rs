//! SX127x LoRa concentrator support.
//!
//! - [`registers`]: register map and read-modify-write helpers
//! - [`sx127x`]: [`Transceiver`](crate::gateway::Transceiver) on a register bus
//! - [`config`]: modulation settings
//! - [`airtime`]: time-on-air
//! - [`duty_cycle`]: transmit airtime budget

pub mod airtime;
pub mod config;
pub mod duty_cycle;
pub mod registers;
pub mod sx127x;

pub use airtime::Modulation;
pub use config::{Bandwidth, CodingRate, RadioConfig, RadioConfigError};
pub use duty_cycle::DutyCycleLimiter;
pub use registers::RegisterBus;
pub use sx127x::Sx127x;
