//! Gateway configuration.
//!
//! Defaults suit a single host running the gateway next to its backend.
//! Every field can be overridden from the environment:
//!
//! | Variable | Meaning |
//! |---|---|
//! | `LORA_GW_ID` | gateway name in `/stats` |
//! | `LORA_GW_AIR_BIND` | UDP address of the emulated radio |
//! | `LORA_GW_AIR_PEERS` | comma separated node addresses |
//! | `LORA_GW_BACKEND` | backend control address |
//! | `LORA_GW_BACKEND_BIND` | local IP for per-session backend sockets |
//! | `LORA_GW_STATS_PORT` | stats port, `off` disables the endpoint |
//! | `LORA_GW_CAPTURE_DIR` | directory for FFT captures |
//! | `LORA_GW_FREQUENCY_MHZ` | radio frequency |
//! | `LORA_GW_SPREADING_FACTOR` | radio spreading factor |
//! | `LORA_GW_RX_TIMEOUT_MS` | receive window |
//! | `LORA_GW_TX_TTL_SECS` | outbound frame lifetime |
//! | `LORA_GW_DUTY_CYCLE` | transmit duty cycle in percent, `off` disables |
//! | `LORA_GW_MAX_SESSIONS` | session table size |
//! | `LORA_GW_SESSION_TIMEOUT_SECS` | session inactivity timeout |

use crate::gateway::scheduler::{SchedulerConfig, SchedulerError};
use crate::gateway::udp_air::UdpAirConfig;
use crate::lora::config::{RadioConfig, RadioConfigError};
use crate::persistence::default_capture_dir;
use crate::registry::{RegistryConfig, RegistryError};
use crate::stats::DEFAULT_STATS_PORT;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Where the backend listens by default.
pub const DEFAULT_BACKEND_ADDR: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 12344);

#[derive(Debug)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    Var { name: &'static str, value: String },
    Radio(RadioConfigError),
    Scheduler(SchedulerError),
    Registry(RegistryError),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Var { name, value } => write!(f, "invalid value for {}: {:?}", name, value),
            Self::Radio(e) => write!(f, "radio: {}", e),
            Self::Scheduler(e) => write!(f, "{}", e),
            Self::Registry(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for ConfigError {}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub gateway_id: String,
    pub air: UdpAirConfig,
    pub backend_addr: SocketAddr,
    pub backend_bind_ip: IpAddr,
    /// `None` disables the stats endpoint.
    pub stats_port: Option<u16>,
    pub capture_dir: PathBuf,
    pub radio: RadioConfig,
    pub scheduler: SchedulerConfig,
    pub registry: RegistryConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            gateway_id: "lora-gateway".to_string(),
            air: UdpAirConfig::default(),
            backend_addr: DEFAULT_BACKEND_ADDR,
            backend_bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            stats_port: Some(DEFAULT_STATS_PORT),
            capture_dir: default_capture_dir(),
            radio: RadioConfig::default(),
            scheduler: SchedulerConfig::default(),
            registry: RegistryConfig::default(),
        }
    }
}

fn parse<T: FromStr>(
    vars: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    match vars(name) {
        None => Ok(None),
        Some(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Var { name, value }),
    }
}

/// Like [`parse`], but `off` yields `Some(None)`.
fn parse_optional<T: FromStr>(
    vars: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<Option<T>>, ConfigError> {
    match vars(name) {
        Some(value) if value.trim().eq_ignore_ascii_case("off") => Ok(Some(None)),
        _ => parse(vars, name).map(|v| v.map(Some)),
    }
}

impl GatewayConfig {
    /// Defaults overridden by `LORA_GW_*` environment variables, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `vars` returns, validated.
    pub fn from_vars(vars: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(id) = vars("LORA_GW_ID") {
            config.gateway_id = id;
        }
        if let Some(bind) = parse(&vars, "LORA_GW_AIR_BIND")? {
            config.air.bind = bind;
        }
        if let Some(peers) = vars("LORA_GW_AIR_PEERS") {
            config.air.peers = peers
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(|p| {
                    p.parse().map_err(|_| ConfigError::Var {
                        name: "LORA_GW_AIR_PEERS",
                        value: p.to_string(),
                    })
                })
                .collect::<Result<_, _>>()?;
        }
        if let Some(addr) = parse(&vars, "LORA_GW_BACKEND")? {
            config.backend_addr = addr;
        }
        if let Some(ip) = parse(&vars, "LORA_GW_BACKEND_BIND")? {
            config.backend_bind_ip = ip;
        }
        if let Some(port) = parse_optional(&vars, "LORA_GW_STATS_PORT")? {
            config.stats_port = port;
        }
        if let Some(dir) = vars("LORA_GW_CAPTURE_DIR") {
            config.capture_dir = PathBuf::from(dir);
        }
        if let Some(mhz) = parse(&vars, "LORA_GW_FREQUENCY_MHZ")? {
            config.radio.frequency_mhz = mhz;
        }
        if let Some(sf) = parse(&vars, "LORA_GW_SPREADING_FACTOR")? {
            config.radio.spreading_factor = sf;
        }
        if let Some(ms) = parse(&vars, "LORA_GW_RX_TIMEOUT_MS")? {
            config.scheduler.rx_timeout = Duration::from_millis(ms);
        }
        if let Some(secs) = parse(&vars, "LORA_GW_TX_TTL_SECS")? {
            config.scheduler.tx_ttl = Duration::from_secs(secs);
        }
        if let Some(percent) = parse_optional(&vars, "LORA_GW_DUTY_CYCLE")? {
            config.scheduler.duty_cycle_percent = percent;
        }
        if let Some(max) = parse(&vars, "LORA_GW_MAX_SESSIONS")? {
            config.registry.max_sessions = max;
        }
        if let Some(secs) = parse(&vars, "LORA_GW_SESSION_TIMEOUT_SECS")? {
            config.registry.session.timeout = Duration::from_secs(secs);
        }

        // Airtime math needs a sane spreading factor.
        config.radio.validate().map_err(ConfigError::Radio)?;
        config.radio.low_data_rate_optimize =
            config.radio.modulation().requires_low_data_rate_optimize();
        config.scheduler.modulation = config.radio.modulation();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.radio.validate().map_err(ConfigError::Radio)?;
        self.scheduler.validate().map_err(ConfigError::Scheduler)?;
        self.registry.validate().map_err(ConfigError::Registry)?;
        Ok(())
    }
}
