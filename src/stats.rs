//! Gateway counters and the HTTP stats endpoint.
//!
//! `GET /stats` returns the counters as JSON:
//!
//! ```json
//! {
//!   "uptime_secs": 3600,
//!   "gateway": "lora-gw-1",
//!   "radio": { "rx": 230, "crc_errors": 2, "decode_errors": 1, "tx": 150, "tx_errors": 0, "rx_timeouts": 40 },
//!   "routing": { "delivered": 220, "dropped": 7, "sessions_created": 9, "sessions_replaced": 1, "active_sessions": 8 },
//!   "queue": { "queued_frames": 0, "expired_frames": 3, "rejected_frames": 0 }
//! }
//! ```

use log::{error, info, warn};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tiny_http::{Header, Method, Response, Server};

/// Default port for the stats server.
pub const DEFAULT_STATS_PORT: u16 = 8080;

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Radio channel counters.
#[derive(Debug, Default)]
pub struct RadioStats {
    /// Frames that raised RxDone.
    pub rx: AtomicUsize,
    pub crc_errors: AtomicUsize,
    pub decode_errors: AtomicUsize,
    /// Completed transmissions.
    pub tx: AtomicUsize,
    pub tx_errors: AtomicUsize,
    /// Receive windows that closed without a frame.
    pub rx_timeouts: AtomicUsize,
}

impl RadioStats {
    pub fn record_rx(&self) {
        bump(&self.rx);
    }

    pub fn record_crc_error(&self) {
        bump(&self.crc_errors);
    }

    pub fn record_decode_error(&self) {
        bump(&self.decode_errors);
    }

    pub fn record_tx(&self) {
        bump(&self.tx);
    }

    pub fn record_tx_error(&self) {
        bump(&self.tx_errors);
    }

    pub fn record_rx_timeout(&self) {
        bump(&self.rx_timeouts);
    }

    fn to_json(&self) -> String {
        format!(
            r#"{{"rx":{},"crc_errors":{},"decode_errors":{},"tx":{},"tx_errors":{},"rx_timeouts":{}}}"#,
            self.rx.load(Ordering::Relaxed),
            self.crc_errors.load(Ordering::Relaxed),
            self.decode_errors.load(Ordering::Relaxed),
            self.tx.load(Ordering::Relaxed),
            self.tx_errors.load(Ordering::Relaxed),
            self.rx_timeouts.load(Ordering::Relaxed)
        )
    }
}

/// Session routing counters.
#[derive(Debug, Default)]
pub struct RoutingStats {
    /// Packets handed to a session.
    pub delivered: AtomicUsize,
    /// Packets with no session to take them.
    pub dropped: AtomicUsize,
    pub sessions_created: AtomicUsize,
    /// Sessions superseded by a re-join from the same node.
    pub sessions_replaced: AtomicUsize,
    /// Current size of the session table.
    pub active_sessions: AtomicUsize,
}

impl RoutingStats {
    pub fn record_delivered(&self) {
        bump(&self.delivered);
    }

    pub fn record_dropped(&self) {
        bump(&self.dropped);
    }

    fn to_json(&self) -> String {
        format!(
            r#"{{"delivered":{},"dropped":{},"sessions_created":{},"sessions_replaced":{},"active_sessions":{}}}"#,
            self.delivered.load(Ordering::Relaxed),
            self.dropped.load(Ordering::Relaxed),
            self.sessions_created.load(Ordering::Relaxed),
            self.sessions_replaced.load(Ordering::Relaxed),
            self.active_sessions.load(Ordering::Relaxed)
        )
    }
}

/// Outbound queue counters.
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Frames currently waiting for the channel.
    pub queued_frames: AtomicUsize,
    /// Cumulative frames dropped for exceeding the TTL.
    pub expired_frames: AtomicUsize,
    /// Cumulative frames refused because the queue was full.
    pub rejected_frames: AtomicUsize,
}

impl QueueStats {
    fn to_json(&self) -> String {
        format!(
            r#"{{"queued_frames":{},"expired_frames":{},"rejected_frames":{}}}"#,
            self.queued_frames.load(Ordering::Relaxed),
            self.expired_frames.load(Ordering::Relaxed),
            self.rejected_frames.load(Ordering::Relaxed)
        )
    }
}

/// Shared gateway statistics. Updated lock-free from the scheduler and the
/// registry, read by the stats server thread.
#[derive(Debug)]
pub struct GatewayStats {
    start_time: Instant,
    pub gateway_id: String,
    pub radio: RadioStats,
    pub routing: RoutingStats,
    pub queue: QueueStats,
}

impl GatewayStats {
    pub fn new(gateway_id: String) -> Self {
        Self {
            start_time: Instant::now(),
            gateway_id,
            radio: RadioStats::default(),
            routing: RoutingStats::default(),
            queue: QueueStats::default(),
        }
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn to_json(&self) -> String {
        let gateway = serde_json::to_string(&self.gateway_id).unwrap_or_else(|_| "null".into());
        format!(
            r#"{{"uptime_secs":{},"gateway":{},"radio":{},"routing":{},"queue":{}}}"#,
            self.uptime_secs(),
            gateway,
            self.radio.to_json(),
            self.routing.to_json(),
            self.queue.to_json()
        )
    }
}

impl Default for GatewayStats {
    fn default() -> Self {
        Self::new("lora-gateway".to_string())
    }
}

/// HTTP stats server on a background thread.
pub struct StatsServer {
    handle: Option<thread::JoinHandle<()>>,
    shutdown: Arc<AtomicBool>,
}

impl StatsServer {
    /// Start serving `stats` on `bind_addr:port` (`0.0.0.0` when `None`).
    ///
    /// Drop the returned handle to stop the server.
    pub fn start(
        bind_addr: Option<IpAddr>,
        port: u16,
        stats: Arc<GatewayStats>,
    ) -> Result<Self, std::io::Error> {
        let addr = match bind_addr {
            Some(ip) => format!("{}:{}", ip, port),
            None => format!("0.0.0.0:{}", port),
        };

        let server = Server::http(&addr)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::AddrInUse, format!("{}", e)))?;

        info!("Stats server listening on http://{}/stats", addr);

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_clone = shutdown.clone();

        let handle = thread::spawn(move || {
            Self::run_server(server, stats, shutdown_clone);
        });

        Ok(Self {
            handle: Some(handle),
            shutdown,
        })
    }

    fn run_server(server: Server, stats: Arc<GatewayStats>, shutdown: Arc<AtomicBool>) {
        let headers = (
            Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]),
            Header::from_bytes(&b"Location"[..], &b"/stats"[..]),
            Header::from_bytes(&b"Allow"[..], &b"GET"[..]),
        );
        let (Ok(content_type), Ok(location), Ok(allow_get)) = headers else {
            error!("Stats server could not build response headers");
            return;
        };

        loop {
            if shutdown.load(Ordering::Acquire) {
                info!("Stats server shutting down");
                break;
            }

            match server.recv_timeout(Duration::from_millis(100)) {
                Ok(Some(request)) => {
                    if request.method() != &Method::Get {
                        let response = Response::from_string("Method Not Allowed")
                            .with_status_code(405)
                            .with_header(allow_get.clone());
                        let _ = request.respond(response);
                        continue;
                    }

                    let result = match request.url() {
                        "/stats" | "/stats/" => request.respond(
                            Response::from_string(stats.to_json())
                                .with_header(content_type.clone())
                                .with_status_code(200),
                        ),
                        "/" => request.respond(
                            Response::from_string("See /stats for gateway statistics")
                                .with_status_code(302)
                                .with_header(location.clone()),
                        ),
                        _ => request.respond(Response::from_string("Not Found").with_status_code(404)),
                    };
                    if let Err(e) = result {
                        warn!("Failed to send response: {}", e);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    error!("Server error: {}", e);
                    break;
                }
            }
        }
    }

    /// Stop the server. May take up to one 100 ms poll.
    pub fn stop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for StatsServer {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;

    #[test]
    fn test_radio_stats_record() {
        let stats = RadioStats::default();
        stats.record_rx();
        stats.record_rx();
        stats.record_crc_error();
        stats.record_tx();

        assert_eq!(stats.rx.load(Ordering::Relaxed), 2);
        assert_eq!(stats.crc_errors.load(Ordering::Relaxed), 1);
        assert_eq!(stats.tx.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_gateway_stats_json() {
        let stats = GatewayStats::new("gw-test".to_string());
        stats.routing.sessions_created.store(3, Ordering::Relaxed);
        stats.queue.expired_frames.store(2, Ordering::Relaxed);

        let json = stats.to_json();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["gateway"], "gw-test");
        assert_eq!(value["routing"]["sessions_created"], 3);
        assert_eq!(value["queue"]["expired_frames"], 2);
        assert_eq!(value["radio"]["rx"], 0);
    }

    #[test]
    fn test_gateway_id_is_escaped() {
        let stats = GatewayStats::new("gw \"north\"\\1".to_string());
        let value: serde_json::Value = serde_json::from_str(&stats.to_json()).unwrap();
        assert_eq!(value["gateway"], "gw \"north\"\\1");
    }

    #[test]
    fn test_server_serves_stats() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let stats = Arc::new(GatewayStats::new("gw-http".to_string()));
        stats.radio.record_rx();
        let mut server = StatsServer::start(Some("127.0.0.1".parse().unwrap()), port, stats).unwrap();

        let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
        stream
            .write_all(b"GET /stats HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut body = String::new();
        stream.read_to_string(&mut body).unwrap();
        assert!(body.starts_with("HTTP/1.1 200"));
        assert!(body.contains(r#""gateway":"gw-http""#));
        assert!(body.contains(r#""rx":1"#));

        server.stop();
    }
}
