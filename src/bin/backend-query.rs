//! Look up a node in the backend the way the gateway does at join time.
//!
//! Sends a NodeInfoRequest for the given hardware address, then a
//! ConfigRequest for the node id the backend returns, and prints both.
//!
//! Usage:
//!   LORA_GW_BACKEND=127.0.0.1:12344 cargo run --bin backend-query -- 0x0D473533

use log::error;
use lora_gateway::backend::{BackendClient, BackendError, DatagramBackend, UdpControlTransport};
use lora_gateway::config::DEFAULT_BACKEND_ADDR;
use std::net::SocketAddr;
use std::sync::Arc;

fn parse_address(raw: &str) -> Option<u32> {
    let hex = raw.trim().trim_start_matches("0x").trim_start_matches("0X");
    u32::from_str_radix(hex, 16).ok()
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let Some(address) = std::env::args().nth(1).as_deref().and_then(parse_address) else {
        eprintln!("Usage: backend-query <hex node address>");
        std::process::exit(2);
    };
    let backend: SocketAddr = match std::env::var("LORA_GW_BACKEND") {
        Ok(raw) => match raw.parse() {
            Ok(addr) => addr,
            Err(e) => {
                error!("Invalid LORA_GW_BACKEND {:?}: {}", raw, e);
                std::process::exit(2);
            }
        },
        Err(_) => DEFAULT_BACKEND_ADDR,
    };

    let transport = match UdpControlTransport::bind(SocketAddr::from(([0, 0, 0, 0], 0)), backend) {
        Ok(transport) => transport,
        Err(e) => {
            error!("Failed to open backend socket: {}", e);
            std::process::exit(1);
        }
    };
    let client = DatagramBackend::new(Arc::new(transport));

    let params = match client.fetch_node_params(address).await {
        Ok(params) => params,
        Err(BackendError::NotFound(what)) => {
            println!("Node 0x{:08X} unknown to backend ({})", address, what);
            std::process::exit(1);
        }
        Err(e) => {
            error!("Node lookup failed: {}", e);
            std::process::exit(1);
        }
    };
    println!("Node 0x{:08X}", params.address);
    println!("  id:         {}", params.node_id);
    println!("  session id: 0x{:02X}", params.session_id);
    println!("  code:       {}", params.code);
    println!("  name:       {}", params.name);
    println!("  firmware:   {}", params.firmware_version);

    match client.fetch_node_config(params.node_id).await {
        Ok(config) => {
            println!("Configuration");
            println!("  status interval:  {} s", config.statusinfo_interval);
            println!("  listen interval:  {} s", config.statusinfo_listen_interval);
            println!("  fft samples idx:  {}", config.fft_samples);
            println!("  fft peaks:        {}", config.fft_peaks);
            println!("  threshold:        {} V", config.dsp_threshold_voltage);
            println!("  join radio:       {:?}", config.radio);
        }
        Err(BackendError::NotFound(what)) => println!("No configuration ({})", what),
        Err(e) => {
            error!("Configuration lookup failed: {}", e);
            std::process::exit(1);
        }
    }
}
