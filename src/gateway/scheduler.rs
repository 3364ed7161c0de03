//! Radio channel scheduler.
//!
//! The gateway has one half-duplex radio. The scheduler owns it together
//! with the outbound queue and serializes every mode change through a single
//! polling loop:
//!
//! - queued downlink and channel Idle or Receiving: transmit
//! - otherwise, Idle: enter continuous receive and arm the receive timeout
//! - Receiving past the timeout: back to Idle
//! - TxDone: Idle
//! - RxDone: check CRC, decode, route to the session registry, Idle
//!
//! Completion events come from the radio's interrupt context through a
//! bounded channel and are drained at the start of each tick.

use super::radio::{CompletionSink, LinkQuality, RadioEvent, Transceiver};
use super::tx_queue::{Downlink, QueuedFrame, TxQueue, DEFAULT_TX_CAPACITY, DEFAULT_TX_TTL};
use crate::lora::airtime::Modulation;
use crate::lora::config::RadioConfig;
use crate::lora::duty_cycle::{DutyCycleLimiter, DEFAULT_DUTY_CYCLE_WINDOW};
use crate::node::session::{SessionSnapshot, Uplink};
use crate::protocol::radio;
use crate::registry::SessionRegistry;
use crate::stats::GatewayStats;
use log::{debug, info, warn};
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Receive window before the scheduler re-evaluates the channel.
pub const DEFAULT_RX_TIMEOUT: Duration = Duration::from_secs(10);

/// Loop period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Margin on top of the computed airtime before a transmission is
/// considered lost.
pub const DEFAULT_TX_GUARD: Duration = Duration::from_secs(1);

const EVENT_QUEUE_DEPTH: usize = 16;

/// Radio channel state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Idle,
    Receiving,
    Transmitting,
    /// Reserved for listen-before-talk; never entered.
    ChannelActivityDetect,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "Idle",
            Self::Receiving => "Receiving",
            Self::Transmitting => "Transmitting",
            Self::ChannelActivityDetect => "ChannelActivityDetect",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub rx_timeout: Duration,
    pub poll_interval: Duration,
    pub tx_ttl: Duration,
    pub tx_capacity: usize,
    pub tx_guard: Duration,
    /// Transmit duty cycle limit in percent; `None` disables the limiter.
    pub duty_cycle_percent: Option<f32>,
    pub duty_cycle_window: Duration,
    /// Modulation used for airtime estimates.
    pub modulation: Modulation,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            rx_timeout: DEFAULT_RX_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            tx_ttl: DEFAULT_TX_TTL,
            tx_capacity: DEFAULT_TX_CAPACITY,
            tx_guard: DEFAULT_TX_GUARD,
            duty_cycle_percent: None,
            duty_cycle_window: DEFAULT_DUTY_CYCLE_WINDOW,
            modulation: RadioConfig::default().modulation(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.rx_timeout.is_zero() {
            return Err(SchedulerError::InvalidConfig("rx_timeout must be greater than 0"));
        }
        if self.poll_interval.is_zero() {
            return Err(SchedulerError::InvalidConfig("poll_interval must be greater than 0"));
        }
        if self.poll_interval > self.rx_timeout {
            return Err(SchedulerError::InvalidConfig(
                "poll_interval must not exceed rx_timeout",
            ));
        }
        if self.tx_capacity == 0 {
            return Err(SchedulerError::InvalidConfig("tx_capacity must be greater than 0"));
        }
        if let Some(percent) = self.duty_cycle_percent {
            if !(percent > 0.0 && percent <= 100.0) {
                return Err(SchedulerError::InvalidConfig(
                    "duty_cycle_percent must be in (0, 100]",
                ));
            }
            if self.duty_cycle_window.is_zero() {
                return Err(SchedulerError::InvalidConfig(
                    "duty_cycle_window must be greater than 0",
                ));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    InvalidConfig(&'static str),
}

impl fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid scheduler config: {}", msg),
        }
    }
}

impl std::error::Error for SchedulerError {}

/// Owner of the radio, the outbound queue and the session registry.
pub struct GatewayScheduler<T: Transceiver> {
    radio: T,
    registry: SessionRegistry,
    downlinks: mpsc::Receiver<Downlink>,
    tx_queue: TxQueue,
    events_tx: mpsc::Sender<RadioEvent>,
    events: mpsc::Receiver<RadioEvent>,
    state: ChannelState,
    rx_deadline: Option<Instant>,
    tx_deadline: Option<Instant>,
    duty_cycle: Option<DutyCycleLimiter>,
    config: SchedulerConfig,
    stats: Arc<GatewayStats>,
}

impl<T: Transceiver> GatewayScheduler<T> {
    /// `downlinks` is the receiver returned by [`SessionRegistry::new`].
    pub fn new(
        radio: T,
        registry: SessionRegistry,
        downlinks: mpsc::Receiver<Downlink>,
        config: SchedulerConfig,
        stats: Arc<GatewayStats>,
    ) -> Result<Self, SchedulerError> {
        config.validate()?;
        let (events_tx, events) = mpsc::channel(EVENT_QUEUE_DEPTH);
        let duty_cycle = config
            .duty_cycle_percent
            .map(|percent| DutyCycleLimiter::new(percent, config.duty_cycle_window));
        Ok(Self {
            radio,
            registry,
            downlinks,
            tx_queue: TxQueue::new(config.tx_capacity, config.tx_ttl),
            events_tx,
            events,
            state: ChannelState::Idle,
            rx_deadline: None,
            tx_deadline: None,
            duty_cycle,
            config,
            stats,
        })
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    pub fn radio(&self) -> &T {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut T {
        &mut self.radio
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SessionRegistry {
        &mut self.registry
    }

    pub fn queued(&self) -> usize {
        self.tx_queue.len()
    }

    /// Queue a frame for transmission. Returns false if the queue is full.
    pub fn enqueue(&mut self, downlink: Downlink, now: Instant) -> bool {
        match self.tx_queue.push(QueuedFrame::queued_at(downlink, now)) {
            Ok(()) => true,
            Err(_) => {
                self.stats.queue.rejected_frames.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Run until `cancel` fires, then stop every session. Returns the final
    /// session snapshots.
    pub async fn run(mut self, cancel: CancellationToken) -> Vec<(u32, SessionSnapshot)> {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Scheduler running (rx timeout {:?}, poll {:?})",
            self.config.rx_timeout, self.config.poll_interval
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.tick_at(Instant::now());
                }
            }
        }

        info!("Scheduler stopping, {} sessions", self.registry.len());
        let finals = self.registry.shutdown().await;
        for (address, snapshot) in &finals {
            debug!("Session 0x{:08X} ended in {}", address, snapshot.state);
        }
        finals
    }

    /// One scheduler iteration at `now`.
    pub fn tick_at(&mut self, now: Instant) -> ChannelState {
        while let Ok(event) = self.events.try_recv() {
            self.on_event(event);
        }
        while let Ok(downlink) = self.downlinks.try_recv() {
            self.enqueue(downlink, now);
        }

        self.step(now);

        self.stats
            .queue
            .queued_frames
            .store(self.tx_queue.len(), Ordering::Relaxed);
        self.stats
            .queue
            .expired_frames
            .store(self.tx_queue.expired(), Ordering::Relaxed);
        self.state
    }

    fn on_event(&mut self, event: RadioEvent) {
        match (event, self.state) {
            (RadioEvent::TxDone, ChannelState::Transmitting) => {
                self.stats.radio.record_tx();
                self.tx_deadline = None;
                self.state = ChannelState::Idle;
            }
            (RadioEvent::RxDone, ChannelState::Receiving) => {
                self.on_rx_done();
                self.rx_deadline = None;
                self.state = ChannelState::Idle;
            }
            (event, state) => debug!("Ignoring stale {:?} in {}", event, state),
        }
    }

    fn on_rx_done(&mut self) {
        self.stats.radio.record_rx();

        match self.radio.crc_ok() {
            Ok(true) => {}
            Ok(false) => {
                self.stats.radio.record_crc_error();
                debug!("Discarding frame with bad CRC");
                return;
            }
            Err(e) => {
                warn!("CRC status unavailable: {}", e);
                return;
            }
        }

        let bytes = match self.radio.read_received_payload() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Failed to read received frame: {}", e);
                return;
            }
        };
        let link = self.radio.link_quality().unwrap_or_else(|e| {
            warn!("Link quality unavailable: {}", e);
            LinkQuality::default()
        });

        let packet = match radio::decode(&bytes) {
            Ok(packet) => packet,
            Err(e) => {
                self.stats.radio.record_decode_error();
                warn!("Undecodable frame ({} bytes): {}", bytes.len(), e);
                return;
            }
        };

        debug!(
            "RX {} session 0x{:02X} (snr {:.1} dB, rssi {} dBm)",
            packet.name(),
            packet.session_id(),
            link.snr,
            link.rssi
        );
        self.registry.route(Uplink::new(packet, link));
    }

    fn step(&mut self, now: Instant) {
        if matches!(self.state, ChannelState::Idle | ChannelState::Receiving)
            && self.start_transmit(now)
        {
            return;
        }

        match self.state {
            ChannelState::Idle => self.start_receive(now),
            ChannelState::Receiving if self.rx_deadline.is_some_and(|d| now >= d) => {
                debug!("Receive window closed without a frame");
                self.stats.radio.record_rx_timeout();
                self.rx_deadline = None;
                self.state = ChannelState::Idle;
            }
            ChannelState::Transmitting if self.tx_deadline.is_some_and(|d| now >= d) => {
                warn!("No TxDone within the expected airtime, releasing channel");
                self.stats.radio.record_tx_error();
                self.tx_deadline = None;
                self.state = ChannelState::Idle;
            }
            _ => {}
        }
    }

    /// Start the next queued frame. Returns true if a transmission was
    /// attempted.
    fn start_transmit(&mut self, now: Instant) -> bool {
        let Some(len) = self.tx_queue.peek_fresh(now).map(|d| d.frame.len()) else {
            return false;
        };
        let airtime = self.config.modulation.time_on_air(len);
        if let Some(limiter) = &mut self.duty_cycle {
            if !limiter.try_consume_at(airtime, now) {
                debug!("Duty cycle budget exhausted, holding {} queued frames", self.tx_queue.len());
                return false;
            }
        }
        let Some(downlink) = self.tx_queue.pop_fresh(now) else {
            return false;
        };

        let sink = CompletionSink::new(self.events_tx.clone(), RadioEvent::TxDone);
        self.rx_deadline = None;
        match self.radio.set_transmit(&downlink.frame, sink) {
            Ok(()) => {
                debug!(
                    "TX {} for session 0x{:02X} ({} bytes, ~{:?})",
                    downlink.name,
                    downlink.session_id,
                    downlink.frame.len(),
                    airtime
                );
                self.tx_deadline = Some(now + airtime + self.config.tx_guard);
                self.state = ChannelState::Transmitting;
            }
            Err(e) => {
                warn!("Failed to transmit {}: {}", downlink.name, e);
                self.stats.radio.record_tx_error();
                self.state = ChannelState::Idle;
            }
        }
        true
    }

    fn start_receive(&mut self, now: Instant) {
        let sink = CompletionSink::new(self.events_tx.clone(), RadioEvent::RxDone);
        match self.radio.set_receive_continuous(sink) {
            Ok(()) => {
                self.rx_deadline = Some(now + self.config.rx_timeout);
                self.state = ChannelState::Receiving;
            }
            Err(e) => warn!("Failed to enter receive: {}", e),
        }
    }
}
