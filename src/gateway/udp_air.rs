//! Radio channel emulated over UDP.
//!
//! One datagram is one LoRa frame. Frames go to every configured peer and to
//! every address a frame was heard from, so simulated nodes only need to
//! know the gateway's address. Like a real half-duplex radio, frames that
//! arrive while the emulated radio is not receiving are lost.

use super::radio::{CompletionSink, LinkQuality, RadioError, RadioEvent, Transceiver};
use crate::protocol::radio::MAX_PACKET_LEN;
use log::{debug, info, warn};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

/// Reader poll period, bounds how long Drop waits for the thread.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct UdpAirConfig {
    pub bind: SocketAddr,
    /// Addresses that receive every transmitted frame.
    pub peers: Vec<SocketAddr>,
    /// Reported for every received frame.
    pub link: LinkQuality,
}

impl Default for UdpAirConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 1700)),
            peers: Vec::new(),
            link: LinkQuality {
                snr: 9.0,
                rssi: -60,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AirMode {
    Standby,
    Receiving,
}

struct AirState {
    mode: AirMode,
    sink: Option<CompletionSink>,
    last_frame: Vec<u8>,
    peers: Vec<SocketAddr>,
}

impl AirState {
    fn learn(&mut self, peer: SocketAddr) {
        if !self.peers.contains(&peer) {
            debug!("New air peer {}", peer);
            self.peers.push(peer);
        }
    }
}

/// UDP-backed [`Transceiver`].
pub struct UdpAir {
    socket: UdpSocket,
    state: Arc<Mutex<AirState>>,
    link: LinkQuality,
    shutdown: Arc<AtomicBool>,
    reader: Option<thread::JoinHandle<()>>,
}

fn lock(state: &Mutex<AirState>) -> MutexGuard<'_, AirState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

impl UdpAir {
    pub fn bind(config: UdpAirConfig) -> io::Result<Self> {
        let socket = UdpSocket::bind(config.bind)?;
        let reader_socket = socket.try_clone()?;
        reader_socket.set_read_timeout(Some(READ_TIMEOUT))?;

        let state = Arc::new(Mutex::new(AirState {
            mode: AirMode::Standby,
            sink: None,
            last_frame: Vec::new(),
            peers: config.peers,
        }));
        let shutdown = Arc::new(AtomicBool::new(false));

        let reader = {
            let state = state.clone();
            let shutdown = shutdown.clone();
            thread::Builder::new()
                .name("udp-air".to_string())
                .spawn(move || Self::read_loop(reader_socket, state, shutdown))?
        };

        info!("UDP air listening on {}", socket.local_addr()?);
        Ok(Self {
            socket,
            state,
            link: config.link,
            shutdown,
            reader: Some(reader),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn add_peer(&self, peer: SocketAddr) {
        lock(&self.state).learn(peer);
    }

    pub fn peers(&self) -> Vec<SocketAddr> {
        lock(&self.state).peers.clone()
    }

    fn read_loop(socket: UdpSocket, state: Arc<Mutex<AirState>>, shutdown: Arc<AtomicBool>) {
        let mut buf = [0u8; MAX_PACKET_LEN + 1];
        while !shutdown.load(Ordering::Acquire) {
            let (len, from) = match socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => {
                    warn!("UDP air receive failed: {}", e);
                    continue;
                }
            };
            if len > MAX_PACKET_LEN {
                warn!("Dropping oversized frame from {} ({}+ bytes)", from, len);
                continue;
            }

            let mut air = lock(&state);
            air.learn(from);
            if air.mode != AirMode::Receiving {
                debug!("Frame from {} lost: radio not receiving", from);
                continue;
            }
            air.last_frame = buf[..len].to_vec();
            if let Some(sink) = &air.sink {
                if !sink.fire() {
                    warn!("RxDone from {} lost: scheduler queue full", from);
                }
            }
        }
        debug!("UDP air reader stopped");
    }
}

impl Transceiver for UdpAir {
    fn set_receive_continuous(&mut self, on_done: CompletionSink) -> Result<(), RadioError> {
        let mut state = lock(&self.state);
        state.mode = AirMode::Receiving;
        state.sink = Some(on_done);
        Ok(())
    }

    fn set_transmit(&mut self, payload: &[u8], on_done: CompletionSink) -> Result<(), RadioError> {
        if payload.is_empty() {
            return Err(RadioError::EmptyPacket);
        }
        if payload.len() > MAX_PACKET_LEN {
            return Err(RadioError::PacketTooLarge {
                size: payload.len(),
                max: MAX_PACKET_LEN,
            });
        }

        let peers = {
            let mut state = lock(&self.state);
            state.mode = AirMode::Standby;
            state.sink = None;
            state.peers.clone()
        };
        if peers.is_empty() {
            debug!("Transmitting {} bytes with no peers", payload.len());
        }
        for peer in &peers {
            if let Err(e) = self.socket.send_to(payload, peer) {
                warn!("UDP air send to {} failed: {}", peer, e);
            }
        }

        if on_done.event() != RadioEvent::TxDone {
            warn!("Transmit completion sink reports {:?}", on_done.event());
        }
        on_done.fire();
        Ok(())
    }

    fn read_received_payload(&mut self) -> Result<Vec<u8>, RadioError> {
        Ok(lock(&self.state).last_frame.clone())
    }

    fn crc_ok(&mut self) -> Result<bool, RadioError> {
        Ok(true)
    }

    fn link_quality(&mut self) -> Result<LinkQuality, RadioError> {
        Ok(self.link)
    }
}

impl Drop for UdpAir {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;
    use tokio::sync::mpsc;

    fn loopback() -> UdpAirConfig {
        UdpAirConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Default::default()
        }
    }

    fn wait_event(rx: &mut mpsc::Receiver<RadioEvent>) -> Option<RadioEvent> {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Ok(event) = rx.try_recv() {
                return Some(event);
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn test_frame_crosses_the_air() {
        let mut gateway = UdpAir::bind(loopback()).unwrap();
        let mut node = UdpAir::bind(UdpAirConfig {
            peers: vec![gateway.local_addr().unwrap()],
            ..loopback()
        })
        .unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        gateway
            .set_receive_continuous(CompletionSink::new(tx.clone(), RadioEvent::RxDone))
            .unwrap();
        node.set_transmit(&[0x10, 0x00, 0xAB], CompletionSink::new(tx, RadioEvent::TxDone))
            .unwrap();

        let mut seen = vec![wait_event(&mut rx), wait_event(&mut rx)];
        seen.sort_by_key(|e| format!("{:?}", e));
        assert_eq!(seen, vec![Some(RadioEvent::RxDone), Some(RadioEvent::TxDone)]);
        assert_eq!(gateway.read_received_payload().unwrap(), vec![0x10, 0x00, 0xAB]);
        assert!(gateway.crc_ok().unwrap());
        assert_eq!(gateway.peers(), vec![node.local_addr().unwrap()]);
    }

    #[test]
    fn test_frames_lost_outside_receive() {
        let mut gateway = UdpAir::bind(loopback()).unwrap();
        let mut node = UdpAir::bind(UdpAirConfig {
            peers: vec![gateway.local_addr().unwrap()],
            ..loopback()
        })
        .unwrap();

        let (tx, mut rx) = mpsc::channel(4);
        node.set_transmit(&[0x30, 0x01], CompletionSink::new(tx, RadioEvent::TxDone))
            .unwrap();
        assert_eq!(wait_event(&mut rx), Some(RadioEvent::TxDone));

        // The sender is still learned as a peer.
        let deadline = Instant::now() + Duration::from_secs(2);
        while gateway.peers().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(gateway.peers().len(), 1);
        assert!(gateway.read_received_payload().unwrap().is_empty());
    }

    #[test]
    fn test_rejects_bad_sizes() {
        let mut air = UdpAir::bind(loopback()).unwrap();
        let (tx, _rx) = mpsc::channel(1);
        let sink = CompletionSink::new(tx, RadioEvent::TxDone);
        assert!(matches!(air.set_transmit(&[], sink.clone()), Err(RadioError::EmptyPacket)));
        assert!(matches!(
            air.set_transmit(&[0u8; 300], sink),
            Err(RadioError::PacketTooLarge { size: 300, .. })
        ));
    }
}
