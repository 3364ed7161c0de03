//! Simulated sensor node on the UDP air.
//!
//! Joins the gateway, fetches its configuration, then posts StatusInfo
//! periodically and answers FFT capture requests with a synthetic spectrum.
//!
//! Usage:
//!   NODE_SIM_GATEWAY=127.0.0.1:1700 NODE_SIM_ADDRESS=0x0D473533 cargo run --bin node-sim
//!
//! Environment:
//! - `NODE_SIM_GATEWAY`: gateway UDP air address (default 127.0.0.1:1700)
//! - `NODE_SIM_ADDRESS`: node hardware address, hex (default 0x0D473533)
//! - `NODE_SIM_STATUS_SECS`: StatusInfo period when the gateway sends none

use log::{debug, error, info, warn};
use lora_gateway::node::capture::DEFAULT_CHUNK_COUNT;
use lora_gateway::protocol::radio::{
    self, AppMode, ConfigRequest, FftChunkData, FftPeak, JoinRequest, RadioPacket, StatusInfo,
    FFT_CHUNK_BINS, JOIN_ACCEPTED, UNJOINED_SESSION,
};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

const DEFAULT_GATEWAY: &str = "127.0.0.1:1700";
const DEFAULT_ADDRESS: u32 = 0x0D47_3533;
const FIRMWARE_VERSION: u8 = 3;
const POLL: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Joining,
    AwaitingConfig,
    Running,
}

struct Node {
    socket: UdpSocket,
    gateway: SocketAddr,
    address: u32,
    boot: Instant,
    session_id: u8,
    phase: Phase,
    join_interval: Duration,
    status_interval: Duration,
    next_send: Instant,
    status_count: u32,
}

impl Node {
    fn send(&self, packet: &RadioPacket) -> io::Result<()> {
        let frame = packet
            .encode()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
        debug!("TX {} ({} bytes)", packet.name(), frame.len());
        self.socket.send_to(&frame, self.gateway).map(|_| ())
    }

    fn uptime(&self) -> u32 {
        self.boot.elapsed().as_secs() as u32
    }

    fn on_timer(&mut self) -> io::Result<()> {
        let now = Instant::now();
        if now < self.next_send {
            return Ok(());
        }
        match self.phase {
            Phase::Joining => {
                info!("Sending JoinRequest for 0x{:08X}", self.address);
                self.send(&RadioPacket::JoinRequest(JoinRequest {
                    session_id: UNJOINED_SESSION,
                    address: self.address,
                    start_time: self.uptime(),
                    firmware_version: FIRMWARE_VERSION,
                }))?;
                self.next_send = now + self.join_interval;
            }
            Phase::AwaitingConfig => {
                self.send(&RadioPacket::ConfigRequest(ConfigRequest {
                    session_id: self.session_id,
                }))?;
                self.next_send = now + self.join_interval;
            }
            Phase::Running => {
                self.status_count += 1;
                let status = synthetic_status(self.session_id, self.status_count);
                self.send(&RadioPacket::StatusInfo(status))?;
                self.next_send = now + self.status_interval;
            }
        }
        Ok(())
    }

    fn on_packet(&mut self, packet: RadioPacket) -> io::Result<()> {
        debug!("RX {} in {:?}", packet.name(), self.phase);
        match packet {
            RadioPacket::JoinReply(reply) if self.phase == Phase::Joining => {
                if reply.result != JOIN_ACCEPTED {
                    warn!("Join refused (result {})", reply.result);
                    return Ok(());
                }
                self.session_id = reply.session_id;
                self.join_interval = Duration::from_millis(u64::from(reply.join_interval));
                info!("Joined with session 0x{:02X}", self.session_id);
                match reply.mode {
                    AppMode::EmbeddedConfig(body) => {
                        self.status_interval = Duration::from_secs(u64::from(body.statusinfo_interval));
                        self.phase = Phase::Running;
                    }
                    AppMode::Status => self.phase = Phase::AwaitingConfig,
                }
                self.next_send = Instant::now();
            }
            RadioPacket::ConfigReply(reply) if reply.session_id == self.session_id => {
                let interval = u64::from(reply.body.statusinfo_interval).max(1);
                info!("Configured, StatusInfo every {} s", interval);
                self.status_interval = Duration::from_secs(interval);
                self.phase = Phase::Running;
                self.next_send = Instant::now();
            }
            RadioPacket::Restart(restart) if restart.session_id == self.session_id => {
                if restart.reset_config {
                    info!("Configuration reset requested");
                    self.phase = Phase::AwaitingConfig;
                } else {
                    info!("Restart requested, joining again");
                    self.boot = Instant::now();
                    self.session_id = UNJOINED_SESSION;
                    self.phase = Phase::Joining;
                }
                self.next_send = Instant::now();
            }
            RadioPacket::FftChunkRequest(request) if request.session_id == self.session_id => {
                self.send_spectrum()?;
            }
            other => debug!("Ignoring {}", other.name()),
        }
        Ok(())
    }

    fn send_spectrum(&self) -> io::Result<()> {
        info!("Sending {} FFT chunks", DEFAULT_CHUNK_COUNT);
        let time = self.uptime();
        for sequence in 0..DEFAULT_CHUNK_COUNT {
            let mut bins = [0.0f32; FFT_CHUNK_BINS];
            for (i, bin) in bins.iter_mut().enumerate() {
                let index = usize::from(sequence) * FFT_CHUNK_BINS + i;
                *bin = 1.0 / (1.0 + index as f32);
            }
            self.send(&RadioPacket::FftChunkData(FftChunkData {
                session_id: self.session_id,
                sequence,
                chunk_count: DEFAULT_CHUNK_COUNT,
                time,
                bins,
            }))?;
            std::thread::sleep(POLL);
        }
        Ok(())
    }
}

fn synthetic_status(session_id: u8, count: u32) -> StatusInfo {
    let wobble = (count % 10) as u16;
    StatusInfo {
        session_id,
        battery: 230,
        temperature: 2200 + wobble,
        rms: 410 + wobble,
        vpp: 1650 + 2 * wobble,
        kurtosis_ratio: 3.1,
        ringdown_counts: 4,
        rise_time: Some(12),
        threshold_duration: None,
        peaks: vec![
            FftPeak {
                index: 12,
                value: 0.82,
            },
            FftPeak {
                index: 47,
                value: 0.31,
            },
        ],
    }
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {}={:?}", name, value);
            default
        }),
        Err(_) => default,
    }
}

fn parse_address(raw: &str) -> Option<u32> {
    let hex = raw.trim().trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(hex, 16).ok()
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let gateway: SocketAddr = match std::env::var("NODE_SIM_GATEWAY")
        .unwrap_or_else(|_| DEFAULT_GATEWAY.to_string())
        .parse()
    {
        Ok(addr) => addr,
        Err(e) => {
            error!("Invalid NODE_SIM_GATEWAY: {}", e);
            std::process::exit(2);
        }
    };
    let address = match std::env::var("NODE_SIM_ADDRESS") {
        Ok(raw) => match parse_address(&raw) {
            Some(address) => address,
            None => {
                error!("Invalid NODE_SIM_ADDRESS: {:?}", raw);
                std::process::exit(2);
            }
        },
        Err(_) => DEFAULT_ADDRESS,
    };
    let status_secs: u64 = env_or("NODE_SIM_STATUS_SECS", 30);

    let socket = match UdpSocket::bind("127.0.0.1:0") {
        Ok(socket) => socket,
        Err(e) => {
            error!("Failed to bind: {}", e);
            std::process::exit(1);
        }
    };
    if let Err(e) = socket.set_read_timeout(Some(POLL)) {
        warn!("Failed to set read timeout: {}", e);
    }

    info!("=== Node 0x{:08X} talking to gateway {} ===", address, gateway);
    let mut node = Node {
        socket,
        gateway,
        address,
        boot: Instant::now(),
        session_id: UNJOINED_SESSION,
        phase: Phase::Joining,
        join_interval: Duration::from_secs(10),
        status_interval: Duration::from_secs(status_secs),
        next_send: Instant::now(),
        status_count: 0,
    };

    let mut buf = [0u8; 512];
    loop {
        if let Err(e) = node.on_timer() {
            warn!("Send failed: {}", e);
        }
        match node.socket.recv_from(&mut buf) {
            Ok((len, _)) => match radio::decode(&buf[..len]) {
                Ok(packet) => {
                    if let Err(e) = node.on_packet(packet) {
                        warn!("Send failed: {}", e);
                    }
                }
                Err(e) => warn!("Undecodable frame: {}", e),
            },
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {}
            Err(e) => {
                error!("Receive failed: {}", e);
                std::process::exit(1);
            }
        }
    }
}
