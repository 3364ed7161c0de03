//! LoRa gateway binary.
//!
//! Runs the gateway on a host with the radio emulated over UDP. Configure it
//! with `LORA_GW_*` environment variables (see `lora_gateway::config`).
//!
//! ```bash
//! LORA_GW_BACKEND=127.0.0.1:12344 cargo run --bin lora-gateway
//! ```

use log::{error, info, warn};
use lora_gateway::backend::UdpTransportFactory;
use lora_gateway::{
    CaptureStore, GatewayConfig, GatewayScheduler, GatewayStats, SessionRegistry, StatsServer,
    UdpAir,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    info!("=== LoRa gateway starting ===");

    let config = match GatewayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {}", e);
            std::process::exit(2);
        }
    };

    let stats = Arc::new(GatewayStats::new(config.gateway_id.clone()));
    let _stats_server = config.stats_port.and_then(|port| {
        match StatsServer::start(None, port, stats.clone()) {
            Ok(server) => Some(server),
            Err(e) => {
                warn!("Failed to start stats server: {}", e);
                warn!("Continuing without stats server");
                None
            }
        }
    });

    let air = match UdpAir::bind(config.air.clone()) {
        Ok(air) => air,
        Err(e) => {
            error!("Failed to open UDP air on {}: {}", config.air.bind, e);
            std::process::exit(1);
        }
    };

    info!("Backend at {}", config.backend_addr);
    let transports = Arc::new(UdpTransportFactory::new(
        config.backend_bind_ip,
        config.backend_addr,
    ));
    let captures = CaptureStore::new(config.capture_dir.clone());

    let (registry, downlinks) =
        match SessionRegistry::new(config.registry.clone(), transports, captures, stats.clone()) {
            Ok(parts) => parts,
            Err(e) => {
                error!("Failed to create session registry: {}", e);
                std::process::exit(2);
            }
        };

    let scheduler = match GatewayScheduler::new(
        air,
        registry,
        downlinks,
        config.scheduler.clone(),
        stats.clone(),
    ) {
        Ok(scheduler) => scheduler,
        Err(e) => {
            error!("Failed to create scheduler: {}", e);
            std::process::exit(2);
        }
    };

    let cancel = CancellationToken::new();
    let scheduler_task = tokio::spawn(scheduler.run(cancel.clone()));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutting down..."),
        Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
    }
    cancel.cancel();

    match scheduler_task.await {
        Ok(finals) => {
            for (address, snapshot) in finals {
                info!("Node 0x{:08X} left in {}", address, snapshot.state);
            }
        }
        Err(e) => error!("Scheduler task failed: {}", e),
    }

    info!("Shutdown complete");
}
