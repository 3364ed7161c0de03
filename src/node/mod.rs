//! Per-node state.
//!
//! Each node that joins gets a [`NodeSession`]: a state machine that turns
//! radio packets and backend replies into radio and backend messages, run by
//! three tasks (inbound events, backend sender, backend receiver).

pub mod capture;
pub mod config;
pub mod params;
pub mod session;
pub mod telemetry;

pub use config::{NodeConfig, RadioSettings};
pub use params::NodeParams;
pub use session::{
    spawn_session, NodeSession, SessionEvent, SessionHandle, SessionSettings, SessionSnapshot,
    SessionState, Uplink,
};
