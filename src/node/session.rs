//! Per-node session.
//!
//! [`NodeSession`] is the state machine proper: it consumes one
//! [`SessionEvent`] at a time and answers with the [`Action`]s the caller
//! has to carry out. It does no I/O, which keeps every transition testable
//! without a runtime.
//!
//! [`spawn_session`] wraps a `NodeSession` in three tokio tasks sharing one
//! cancellation token:
//!
//! - worker: drains the inbound queue, runs the state machine, enforces the
//!   rolling inactivity timeout
//! - sender: drains the outbound control queue into the backend transport
//! - receiver: reads backend replies and feeds them to the inbound queue
//!
//! Radio packets and backend replies share the inbound queue, so the worker
//! sees them in arrival order.

use super::capture::FftCapture;
use super::config::{NodeConfig, RadioSettings};
use super::params::NodeParams;
use super::telemetry::{statusinfo_post, timestamp_now};
use crate::backend::{BackendError, ControlTransport};
use crate::gateway::radio::LinkQuality;
use crate::gateway::tx_queue::Downlink;
use crate::persistence::CaptureStore;
use crate::protocol::control::{self, ControlMessage, NodeInfoReply, NodeInfoRequest, Setting};
use crate::protocol::radio::{
    AppMode, ConfigReply, EncodeError, FftChunkData, FftChunkRequest, JoinReply, JoinRequest,
    RadioPacket, Restart, TemperatureData, TemperatureSample, JOIN_ACCEPTED, UNJOINED_SESSION,
};
use crate::registry::AliasTable;
use log::{debug, error, info, warn};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_util::sync::CancellationToken;

/// Inactivity window after which a session is declared dead.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(1000);

/// Bound on a single backend send.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Depth of the inbound and outbound session queues.
pub const DEFAULT_SESSION_QUEUE: usize = 16;

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Joining,
    Joined,
    Configured,
    ExpectingChunk,
    /// Protocol violation or inactivity timeout.
    Error,
    /// Stopped on request.
    Stopped,
}

impl SessionState {
    /// Whether the session has finished and accepts no more events.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Error | Self::Stopped)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Joining => "Joining",
            Self::Joined => "Joined",
            Self::Configured => "Configured",
            Self::ExpectingChunk => "ExpectingChunk",
            Self::Error => "Error",
            Self::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A decoded radio packet with the signal quality it arrived with.
#[derive(Debug, Clone, PartialEq)]
pub struct Uplink {
    pub packet: RadioPacket,
    pub link: LinkQuality,
}

impl Uplink {
    pub fn new(packet: RadioPacket, link: LinkQuality) -> Self {
        Self { packet, link }
    }
}

/// Input to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Radio(Uplink),
    Control(ControlMessage),
    /// The backend answered a lookup with no record.
    BackendNotFound(String),
    /// Operator request for an FFT spectrum capture.
    RequestCapture,
}

/// Side effect requested by the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum Action {
    /// Queue an encoded frame for the radio.
    SendRadio(Downlink),
    /// Send a message to the backend.
    SendControl(ControlMessage),
    /// Map `session_id` to `address` for uplink routing.
    RegisterAlias { session_id: u8, address: u32 },
    /// Remove this session's alias.
    ReleaseAlias { session_id: u8 },
    /// Flush a finished FFT capture.
    StoreCapture { address: u32, time: u32, bins: Vec<f32> },
}

/// Encode a packet for the TX queue.
fn downlink(packet: RadioPacket) -> Result<Downlink, EncodeError> {
    Ok(Downlink {
        session_id: packet.session_id(),
        name: packet.name(),
        frame: packet.encode()?,
    })
}

/// State machine for one node.
#[derive(Debug)]
pub struct NodeSession {
    state: SessionState,
    /// Hardware address from the JoinRequest.
    address: Option<u32>,
    /// Node uptime reported in the JoinRequest.
    start_time: u32,
    params: Option<NodeParams>,
    config: Option<NodeConfig>,
    join_settings: RadioSettings,
    capture: FftCapture,
    last_temperature: Option<TemperatureSample>,
    /// Whether the last handled event was processed rather than dropped.
    accepted: bool,
}

impl Default for NodeSession {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeSession {
    pub fn new() -> Self {
        Self::with_join_settings(RadioSettings::default())
    }

    /// Session announcing `settings` in its JoinReply.
    pub fn with_join_settings(settings: RadioSettings) -> Self {
        Self {
            state: SessionState::Joining,
            address: None,
            start_time: 0,
            params: None,
            config: None,
            join_settings: settings,
            capture: FftCapture::new(),
            last_temperature: None,
            accepted: false,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn address(&self) -> Option<u32> {
        self.address
    }

    pub fn start_time(&self) -> u32 {
        self.start_time
    }

    pub fn params(&self) -> Option<&NodeParams> {
        self.params.as_ref()
    }

    pub fn config(&self) -> Option<&NodeConfig> {
        self.config.as_ref()
    }

    pub fn last_temperature(&self) -> Option<TemperatureSample> {
        self.last_temperature
    }

    /// Whether the last [`handle`](Self::handle) call processed its event.
    /// Dropped and ignored events do not count as node activity.
    pub fn last_event_accepted(&self) -> bool {
        self.accepted
    }

    /// Chunks received for the capture in progress.
    pub fn chunks_received(&self) -> usize {
        self.capture.received()
    }

    fn session_id(&self) -> Option<u8> {
        self.params.as_ref().map(|p| p.session_id)
    }

    fn label(&self) -> String {
        match self.address {
            Some(address) => format!("0x{:08X}", address),
            None => "<unjoined>".to_string(),
        }
    }

    /// Run one event through the state machine.
    pub fn handle(&mut self, event: SessionEvent) -> Vec<Action> {
        if self.state.is_terminal() {
            debug!("Session {} is {}, ignoring event", self.label(), self.state);
            self.accepted = false;
            return Vec::new();
        }
        self.accepted = true;
        match event {
            SessionEvent::Radio(uplink) => self.on_radio(uplink),
            SessionEvent::Control(message) => self.on_control(message),
            SessionEvent::BackendNotFound(what) => self.on_not_found(what),
            SessionEvent::RequestCapture => self.on_capture_request(),
        }
    }

    /// Inactivity timeout expired.
    pub fn expire(&mut self) -> Vec<Action> {
        warn!("Session {} timed out in {}", self.label(), self.state);
        self.finish(SessionState::Error)
    }

    /// Stop on request.
    pub fn stop(&mut self) -> Vec<Action> {
        if self.state.is_terminal() {
            return Vec::new();
        }
        info!("Session {} stopped in {}", self.label(), self.state);
        self.finish(SessionState::Stopped)
    }

    fn finish(&mut self, state: SessionState) -> Vec<Action> {
        self.state = state;
        self.session_id()
            .map(|session_id| Action::ReleaseAlias { session_id })
            .into_iter()
            .collect()
    }

    fn fail(&mut self, reason: impl fmt::Display) -> Vec<Action> {
        error!("Session {} failed in {}: {}", self.label(), self.state, reason);
        self.finish(SessionState::Error)
    }

    fn unexpected(&mut self, what: &str) -> Vec<Action> {
        warn!(
            "Session {} dropping unexpected {} in {}",
            self.label(),
            what,
            self.state
        );
        self.dropped()
    }

    fn dropped(&mut self) -> Vec<Action> {
        self.accepted = false;
        Vec::new()
    }

    fn transition(&mut self, next: SessionState) {
        if self.state != next {
            info!("Session {}: {} -> {}", self.label(), self.state, next);
            self.state = next;
        }
    }

    fn on_radio(&mut self, uplink: Uplink) -> Vec<Action> {
        let Uplink { packet, link } = uplink;

        if self.state == SessionState::Joining {
            return match packet {
                RadioPacket::JoinRequest(join) => self.on_join_request(join),
                other => self.fail(format!("{} before join completed", other.name())),
            };
        }

        if let Some(expected) = self.session_id() {
            if packet.session_id() != expected {
                warn!(
                    "Session {} dropping {} with session id 0x{:02X}, expected 0x{:02X}",
                    self.label(),
                    packet.name(),
                    packet.session_id(),
                    expected
                );
                return self.dropped();
            }
        }

        match (self.state, packet) {
            (SessionState::Joined, RadioPacket::ConfigRequest(_)) => self.on_config_request(),
            (SessionState::Joined, RadioPacket::StatusInfo(_)) => {
                warn!(
                    "Session {} is not configured, dropping StatusInfo",
                    self.label()
                );
                self.dropped()
            }
            (SessionState::Configured, RadioPacket::StatusInfo(info)) => {
                let (Some(params), Some(config)) = (&self.params, &self.config) else {
                    return self.fail("configured without parameters");
                };
                match statusinfo_post(&info, link, params, config, timestamp_now()) {
                    Ok(post) => vec![Action::SendControl(ControlMessage::StatusinfoPost(
                        Box::new(post),
                    ))],
                    Err(e) => self.fail(e),
                }
            }
            (SessionState::ExpectingChunk, RadioPacket::FftChunkData(chunk)) => {
                self.on_fft_chunk(&chunk)
            }
            (SessionState::ExpectingChunk, RadioPacket::TemperatureData(data)) => {
                self.on_temperature(&data);
                Vec::new()
            }
            (_, other) => self.unexpected(other.name()),
        }
    }

    fn on_join_request(&mut self, join: JoinRequest) -> Vec<Action> {
        if join.session_id != UNJOINED_SESSION {
            return self.fail(format!(
                "JoinRequest carries session id 0x{:02X}",
                join.session_id
            ));
        }
        if let Some(address) = self.address {
            if address != join.address {
                return self.fail(format!(
                    "JoinRequest from 0x{:08X} on session of 0x{:08X}",
                    join.address, address
                ));
            }
        }
        self.address = Some(join.address);
        self.start_time = join.start_time;
        info!(
            "Join request from 0x{:08X} (uptime {} s, firmware {})",
            join.address, join.start_time, join.firmware_version
        );
        vec![Action::SendControl(ControlMessage::NodeInfoRequest(
            NodeInfoRequest {
                address: join.address,
            },
        ))]
    }

    fn on_config_request(&mut self) -> Vec<Action> {
        match &self.params {
            Some(params) => vec![Action::SendControl(ControlMessage::ConfigRequest(
                control::ConfigRequest {
                    node_id: params.node_id,
                },
            ))],
            None => self.fail("joined without parameters"),
        }
    }

    fn on_fft_chunk(&mut self, chunk: &FftChunkData) -> Vec<Action> {
        match self.capture.accept(chunk) {
            Ok(None) => {
                debug!(
                    "Session {} chunk {}/{}",
                    self.label(),
                    chunk.sequence + 1,
                    chunk.chunk_count
                );
                Vec::new()
            }
            Ok(Some(done)) => {
                let Some(address) = self.address else {
                    return self.fail("capture without address");
                };
                info!(
                    "Session {} finished FFT capture of {} bins",
                    self.label(),
                    done.bins.len()
                );
                self.config = None;
                self.transition(SessionState::Joined);
                vec![Action::StoreCapture {
                    address,
                    time: done.time,
                    bins: done.bins,
                }]
            }
            Err(e) => {
                warn!("Session {} dropping chunk: {}", self.label(), e);
                self.dropped()
            }
        }
    }

    fn on_temperature(&mut self, data: &TemperatureData) {
        if let Some(sample) = data.samples.last() {
            debug!(
                "Session {} temperature {} at {}",
                self.label(),
                sample.temperature,
                sample.time
            );
            self.last_temperature = Some(*sample);
        }
    }

    fn on_control(&mut self, message: ControlMessage) -> Vec<Action> {
        match (self.state, message) {
            (SessionState::Joining, ControlMessage::NodeInfoReply(reply)) => {
                self.on_node_info(reply)
            }
            (SessionState::Joined, ControlMessage::ConfigReply(settings)) => {
                self.on_config_reply(&settings)
            }
            (
                SessionState::Joined | SessionState::Configured | SessionState::ExpectingChunk,
                ControlMessage::ResetHard,
            ) => self.on_reset(false),
            (SessionState::Configured, ControlMessage::ResetConfig) => self.on_reset(true),
            (_, ControlMessage::StatusinfoAck) => Vec::new(),
            (_, other) => self.unexpected(other.name()),
        }
    }

    fn on_node_info(&mut self, reply: NodeInfoReply) -> Vec<Action> {
        let Some(address) = self.address else {
            return self.fail("NodeInfoReply before JoinRequest");
        };
        if reply.address != address {
            return self.fail(format!(
                "NodeInfoReply for 0x{:08X} on session of 0x{:08X}",
                reply.address, address
            ));
        }
        if reply.session_id == UNJOINED_SESSION {
            return self.fail("backend assigned session id 0");
        }

        let params = NodeParams::from(&reply);
        let session_id = params.session_id;
        let join = JoinReply {
            session_id,
            result: JOIN_ACCEPTED,
            bandwidth: self.join_settings.bandwidth,
            spreading_factor: self.join_settings.spreading_factor,
            coding_rate: self.join_settings.coding_rate,
            join_interval: self.join_settings.join_interval,
            mode: AppMode::Status,
        };
        let frame = match downlink(RadioPacket::JoinReply(join)) {
            Ok(frame) => frame,
            Err(e) => return self.fail(e),
        };

        info!(
            "Node 0x{:08X} joined as session 0x{:02X} (id {}, {})",
            address, session_id, params.node_id, params.name
        );
        self.params = Some(params);
        self.transition(SessionState::Joined);
        vec![
            Action::RegisterAlias {
                session_id,
                address,
            },
            Action::SendRadio(frame),
        ]
    }

    fn on_config_reply(&mut self, settings: &[Setting]) -> Vec<Action> {
        let Some(session_id) = self.session_id() else {
            return self.fail("joined without parameters");
        };
        let config = match NodeConfig::from_settings(settings) {
            Ok(config) => config,
            Err(e) => return self.fail(e),
        };
        let body = match config.to_config_body() {
            Ok(body) => body,
            Err(e) => return self.fail(e),
        };
        let frame = match downlink(RadioPacket::ConfigReply(ConfigReply { session_id, body })) {
            Ok(frame) => frame,
            Err(e) => return self.fail(e),
        };
        self.config = Some(config);
        self.transition(SessionState::Configured);
        vec![Action::SendRadio(frame)]
    }

    fn on_reset(&mut self, reset_config: bool) -> Vec<Action> {
        let Some(session_id) = self.session_id() else {
            return self.fail("reset without parameters");
        };
        let frame = match downlink(RadioPacket::Restart(Restart {
            session_id,
            reset_config,
        })) {
            Ok(frame) => frame,
            Err(e) => return self.fail(e),
        };
        self.config = None;
        self.capture = FftCapture::new();

        if reset_config {
            self.transition(SessionState::Joined);
            return vec![Action::SendRadio(frame)];
        }

        self.params = None;
        self.transition(SessionState::Joining);
        vec![Action::SendRadio(frame), Action::ReleaseAlias { session_id }]
    }

    fn on_not_found(&mut self, what: String) -> Vec<Action> {
        if self.state == SessionState::Joining {
            return self.fail(format!("backend has no record for {}", what));
        }
        warn!("Session {}: backend has no record for {}", self.label(), what);
        self.dropped()
    }

    fn on_capture_request(&mut self) -> Vec<Action> {
        match (self.state, self.session_id()) {
            (SessionState::Joined | SessionState::Configured, Some(session_id)) => {
                match downlink(RadioPacket::FftChunkRequest(FftChunkRequest { session_id })) {
                    Ok(frame) => {
                        self.capture = FftCapture::new();
                        self.transition(SessionState::ExpectingChunk);
                        vec![Action::SendRadio(frame)]
                    }
                    Err(e) => self.fail(e),
                }
            }
            _ => self.unexpected("capture request"),
        }
    }
}

/// Timing and queue limits for session tasks.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Rolling inactivity timeout.
    pub timeout: Duration,
    /// Bound on one backend send or radio hand-off.
    pub send_timeout: Duration,
    /// Depth of the inbound and outbound queues.
    pub queue_depth: usize,
    /// Radio settings announced in JoinReply.
    pub join: RadioSettings,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_SESSION_TIMEOUT,
            send_timeout: DEFAULT_SEND_TIMEOUT,
            queue_depth: DEFAULT_SESSION_QUEUE,
            join: RadioSettings::default(),
        }
    }
}

/// Shared resources every session task needs.
#[derive(Clone)]
pub struct SessionEnv {
    /// Frames bound for the radio scheduler.
    pub downlinks: mpsc::Sender<Downlink>,
    pub aliases: AliasTable,
    pub captures: CaptureStore,
    pub settings: SessionSettings,
}

/// Published view of a running session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub params: Option<NodeParams>,
    pub config: Option<NodeConfig>,
    pub last_temperature: Option<TemperatureSample>,
}

impl SessionSnapshot {
    fn of(session: &NodeSession) -> Self {
        Self {
            state: session.state,
            params: session.params.clone(),
            config: session.config.clone(),
            last_temperature: session.last_temperature,
        }
    }
}

/// Why an event did not reach a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// Inbound queue is full.
    Full,
    /// Session tasks have exited.
    Closed,
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full => write!(f, "session queue full"),
            Self::Closed => write!(f, "session closed"),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Owner's handle to a running session.
pub struct SessionHandle {
    address: u32,
    serial: u64,
    inbound: mpsc::Sender<SessionEvent>,
    snapshot: watch::Receiver<SessionSnapshot>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn address(&self) -> u32 {
        self.address
    }

    /// Registry-unique id of this session instance.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn state(&self) -> SessionState {
        self.snapshot.borrow().state
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver for state changes.
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Whether the session reached a terminal state or its tasks exited.
    pub fn is_finished(&self) -> bool {
        self.state().is_terminal() || self.tasks.iter().all(|t| t.is_finished())
    }

    /// Queue an event without waiting.
    pub fn deliver(&self, event: SessionEvent) -> Result<(), DeliveryError> {
        self.inbound.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Signal all session tasks to exit.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for the tasks to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Session 0x{:08X} task failed: {}", self.address, e);
            }
        }
    }
}

impl Drop for SessionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Start a session for `address`, seeded with the JoinRequest that opened it.
pub fn spawn_session(
    address: u32,
    serial: u64,
    join: Uplink,
    transport: Arc<dyn ControlTransport>,
    env: SessionEnv,
) -> SessionHandle {
    let depth = env.settings.queue_depth.max(1);
    let (inbound_tx, inbound_rx) = mpsc::channel(depth);
    let (outbound_tx, outbound_rx) = mpsc::channel(depth);

    let session = NodeSession::with_join_settings(env.settings.join);
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::of(&session));
    let cancel = CancellationToken::new();

    // Fresh channel with capacity >= 1: cannot fail.
    let _ = inbound_tx.try_send(SessionEvent::Radio(join));

    let send_timeout = env.settings.send_timeout;
    let worker = tokio::spawn(run_worker(
        Worker {
            session,
            address,
            serial,
            outbound: outbound_tx,
            snapshot: snapshot_tx,
            env,
            cancel: cancel.clone(),
        },
        inbound_rx,
        cancel.clone(),
    ));
    let sender = tokio::spawn(run_sender(
        address,
        transport.clone(),
        outbound_rx,
        send_timeout,
        cancel.clone(),
    ));
    let receiver = tokio::spawn(run_receiver(
        address,
        transport,
        inbound_tx.clone(),
        cancel.clone(),
    ));

    SessionHandle {
        address,
        serial,
        inbound: inbound_tx,
        snapshot: snapshot_rx,
        cancel,
        tasks: vec![worker, sender, receiver],
    }
}

struct Worker {
    session: NodeSession,
    address: u32,
    serial: u64,
    outbound: mpsc::Sender<ControlMessage>,
    snapshot: watch::Sender<SessionSnapshot>,
    env: SessionEnv,
    cancel: CancellationToken,
}

impl Worker {
    async fn execute(&self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::SendRadio(frame) => {
                    let name = frame.name;
                    match timeout(self.env.settings.send_timeout, self.env.downlinks.send(frame))
                        .await
                    {
                        Ok(Ok(())) => debug!("Session 0x{:08X} queued {}", self.address, name),
                        Ok(Err(_)) => warn!(
                            "Session 0x{:08X}: radio scheduler gone, {} lost",
                            self.address, name
                        ),
                        Err(_) => warn!(
                            "Session 0x{:08X}: radio queue busy, {} lost",
                            self.address, name
                        ),
                    }
                }
                Action::SendControl(message) => {
                    if self.outbound.send(message).await.is_err() {
                        warn!("Session 0x{:08X}: backend sender gone", self.address);
                    }
                }
                Action::RegisterAlias {
                    session_id,
                    address,
                } => {
                    match self.env.aliases.register_unless_cancelled(
                        session_id,
                        address,
                        self.serial,
                        &self.cancel,
                    ) {
                        Some(Some(previous)) => warn!(
                            "Session id 0x{:02X} moved from 0x{:08X} to 0x{:08X}",
                            session_id, previous, address
                        ),
                        Some(None) => {}
                        None => debug!(
                            "Session 0x{:08X} cancelled, not registering 0x{:02X}",
                            address, session_id
                        ),
                    }
                }
                Action::ReleaseAlias { session_id } => {
                    self.env.aliases.release(session_id, self.serial);
                }
                Action::StoreCapture {
                    address,
                    time,
                    bins,
                } => {
                    let store = self.env.captures.clone();
                    let written =
                        tokio::task::spawn_blocking(move || store.store_fft(address, time, &bins))
                            .await;
                    match written {
                        Ok(Ok(path)) => info!("Capture of 0x{:08X} saved to {:?}", address, path),
                        Ok(Err(e)) => error!("Failed to save capture of 0x{:08X}: {}", address, e),
                        Err(e) => error!("Capture writer for 0x{:08X} failed: {}", address, e),
                    }
                }
            }
        }
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot::of(&self.session));
    }
}

async fn run_worker(
    mut worker: Worker,
    mut inbound: mpsc::Receiver<SessionEvent>,
    cancel: CancellationToken,
) {
    let window = worker.env.settings.timeout;
    let mut deadline = Instant::now() + window;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let actions = worker.session.stop();
                worker.execute(actions).await;
                break;
            }

            _ = sleep_until(deadline) => {
                let actions = worker.session.expire();
                worker.execute(actions).await;
                break;
            }

            event = inbound.recv() => {
                let Some(event) = event else {
                    let actions = worker.session.stop();
                    worker.execute(actions).await;
                    break;
                };
                let actions = worker.session.handle(event);
                if worker.session.last_event_accepted() {
                    deadline = Instant::now() + window;
                }
                // A send may wait for queue space; stay responsive to stop.
                let stopped = tokio::select! {
                    _ = cancel.cancelled() => true,
                    _ = worker.execute(actions) => false,
                };
                if stopped {
                    let actions = worker.session.stop();
                    worker.execute(actions).await;
                    break;
                }
                worker.publish();
                if worker.session.state().is_terminal() {
                    break;
                }
            }
        }
    }

    worker.publish();
    debug!(
        "Session 0x{:08X} worker exiting in {}",
        worker.address,
        worker.session.state()
    );
    cancel.cancel();
}

async fn run_sender(
    address: u32,
    transport: Arc<dyn ControlTransport>,
    mut outbound: mpsc::Receiver<ControlMessage>,
    send_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            message = outbound.recv() => {
                let Some(message) = message else { break };
                match timeout(send_timeout, transport.send(&message)).await {
                    Ok(Ok(())) => debug!("Session 0x{:08X} sent {}", address, message.name()),
                    Ok(Err(e)) => warn!("Session 0x{:08X} failed to send {}: {}", address, message.name(), e),
                    Err(_) => warn!("Session 0x{:08X} timed out sending {}", address, message.name()),
                }
            }
        }
    }
    debug!("Session 0x{:08X} sender exiting", address);
}

async fn run_receiver(
    address: u32,
    transport: Arc<dyn ControlTransport>,
    inbound: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) {
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => break,
            received = transport.recv() => received,
        };

        let event = match received {
            Ok(message) => SessionEvent::Control(message),
            Err(BackendError::NotFound(what)) => SessionEvent::BackendNotFound(what),
            Err(BackendError::Closed) => {
                warn!("Session 0x{:08X} backend transport closed", address);
                break;
            }
            Err(e) => {
                warn!("Session 0x{:08X} dropping backend datagram: {}", address, e);
                continue;
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = inbound.send(event) => {
                if sent.is_err() {
                    break;
                }
            }
        }
    }
    debug!("Session 0x{:08X} receiver exiting", address);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::config::tests::backend_settings;
    use crate::protocol::radio::{self, FftPeak, StatusInfo, FFT_CHUNK_BINS};

    const ADDRESS: u32 = 0x0D47_3533;

    fn join_request(session_id: u8) -> SessionEvent {
        SessionEvent::Radio(Uplink::new(
            RadioPacket::JoinRequest(JoinRequest {
                session_id,
                address: ADDRESS,
                start_time: 1000,
                firmware_version: 3,
            }),
            LinkQuality::default(),
        ))
    }

    fn node_info(session_id: u8) -> SessionEvent {
        SessionEvent::Control(ControlMessage::NodeInfoReply(NodeInfoReply {
            node_id: 7,
            address: ADDRESS,
            session_id,
            code: "N7".into(),
            name: "pump".into(),
            firmware_version: 3,
            port: 8888,
        }))
    }

    fn over_air(packet: RadioPacket) -> SessionEvent {
        SessionEvent::Radio(Uplink::new(
            packet,
            LinkQuality {
                snr: 7.5,
                rssi: -80,
            },
        ))
    }

    fn status_info(session_id: u8) -> SessionEvent {
        over_air(RadioPacket::StatusInfo(StatusInfo {
            session_id,
            battery: 200,
            temperature: 2300,
            rms: 1000,
            vpp: 3000,
            kurtosis_ratio: 1.5,
            ringdown_counts: 2,
            rise_time: None,
            threshold_duration: Some(200),
            peaks: vec![
                FftPeak {
                    index: 40,
                    value: 0.5,
                },
                FftPeak {
                    index: 10,
                    value: 2.0,
                },
            ],
        }))
    }

    fn joined() -> NodeSession {
        let mut session = NodeSession::new();
        session.handle(join_request(0));
        session.handle(node_info(1));
        assert_eq!(session.state(), SessionState::Joined);
        session
    }

    fn configured() -> NodeSession {
        let mut session = joined();
        session.handle(over_air(RadioPacket::ConfigRequest(radio::ConfigRequest {
            session_id: 1,
        })));
        session.handle(SessionEvent::Control(ControlMessage::ConfigReply(
            backend_settings(),
        )));
        assert_eq!(session.state(), SessionState::Configured);
        session
    }

    fn sent_frame(actions: &[Action]) -> RadioPacket {
        let frame = actions
            .iter()
            .find_map(|a| match a {
                Action::SendRadio(d) => Some(d.frame.clone()),
                _ => None,
            })
            .expect("no radio frame");
        radio::decode(&frame).unwrap()
    }

    #[test]
    fn test_join_request_asks_backend() {
        let mut session = NodeSession::new();
        let actions = session.handle(join_request(0));
        assert_eq!(
            actions,
            vec![Action::SendControl(ControlMessage::NodeInfoRequest(
                NodeInfoRequest { address: ADDRESS }
            ))]
        );
        assert_eq!(session.state(), SessionState::Joining);
        assert_eq!(session.address(), Some(ADDRESS));
        assert_eq!(session.start_time(), 1000);
    }

    #[test]
    fn test_join_request_with_session_id_is_rejected() {
        let mut session = NodeSession::new();
        let actions = session.handle(join_request(5));
        assert!(actions.is_empty());
        assert_eq!(session.state(), SessionState::Error);

        // Terminal: later events are ignored.
        assert!(session.handle(node_info(1)).is_empty());
        assert_eq!(session.state(), SessionState::Error);
    }

    #[test]
    fn test_node_info_reply_joins() {
        let mut session = NodeSession::new();
        session.handle(join_request(0));
        let actions = session.handle(node_info(1));

        assert_eq!(
            actions[0],
            Action::RegisterAlias {
                session_id: 1,
                address: ADDRESS
            }
        );
        match sent_frame(&actions) {
            RadioPacket::JoinReply(reply) => {
                assert_eq!(reply.session_id, 1);
                assert_eq!(reply.result, JOIN_ACCEPTED);
                assert_eq!(reply.mode, AppMode::Status);
                assert_eq!(reply.join_interval, 10_000);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Joined);
        assert_eq!(session.params().map(|p| p.node_id), Some(7));
    }

    #[test]
    fn test_node_info_for_other_address_fails() {
        let mut session = NodeSession::new();
        session.handle(join_request(0));
        let reply = SessionEvent::Control(ControlMessage::NodeInfoReply(NodeInfoReply {
            node_id: 9,
            address: 0x1111_1111,
            session_id: 2,
            code: String::new(),
            name: String::new(),
            firmware_version: 0,
            port: 8888,
        }));
        session.handle(reply);
        assert_eq!(session.state(), SessionState::Error);
    }

    #[test]
    fn test_backend_without_record_fails_join() {
        let mut session = NodeSession::new();
        session.handle(join_request(0));
        session.handle(SessionEvent::BackendNotFound("reply 0x01".into()));
        assert_eq!(session.state(), SessionState::Error);
    }

    #[test]
    fn test_packet_before_join_completes_fails() {
        let mut session = NodeSession::new();
        session.handle(join_request(0));
        session.handle(status_info(0));
        assert_eq!(session.state(), SessionState::Error);
    }

    #[test]
    fn test_config_exchange() {
        let mut session = joined();
        let actions = session.handle(over_air(RadioPacket::ConfigRequest(radio::ConfigRequest {
            session_id: 1,
        })));
        assert_eq!(
            actions,
            vec![Action::SendControl(ControlMessage::ConfigRequest(
                control::ConfigRequest { node_id: 7 }
            ))]
        );

        let actions = session.handle(SessionEvent::Control(ControlMessage::ConfigReply(
            backend_settings(),
        )));
        match sent_frame(&actions) {
            RadioPacket::ConfigReply(reply) => {
                assert_eq!(reply.session_id, 1);
                assert_eq!(reply.body.statusinfo_interval, 60);
                assert_eq!(reply.body.dsp_threshold, 1241);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Configured);
        assert!(session.config().is_some());
    }

    #[test]
    fn test_invalid_config_fails_session() {
        let mut session = joined();
        let mut settings = backend_settings();
        settings.push(Setting::new("temp.temperature_averaging_num", "int", "11"));
        session.handle(SessionEvent::Control(ControlMessage::ConfigReply(settings)));
        assert_eq!(session.state(), SessionState::Error);
    }

    #[test]
    fn test_status_info_before_config_is_dropped() {
        let mut session = joined();
        assert!(session.handle(status_info(1)).is_empty());
        assert_eq!(session.state(), SessionState::Joined);
    }

    #[test]
    fn test_status_info_posts_telemetry() {
        let mut session = configured();
        let actions = session.handle(status_info(1));
        match &actions[..] {
            [Action::SendControl(ControlMessage::StatusinfoPost(post))] => {
                assert_eq!(post.node_id, 7);
                assert_eq!(post.rssi, -80);
                assert_eq!(post.fs, 200_000.0);
                assert_eq!(post.n, 1024);
                assert_eq!(post.peaks().unwrap(), vec![(10, 2.0), (40, 0.5)]);
                assert_eq!(post.rise_time, 0.0);
                assert_eq!(post.threshold_duration, 0.001);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Configured);
    }

    #[test]
    fn test_mismatched_session_id_is_dropped() {
        let mut session = configured();
        assert!(session.handle(status_info(2)).is_empty());
        assert_eq!(session.state(), SessionState::Configured);
    }

    #[test]
    fn test_reset_hard_returns_to_joining() {
        let mut session = configured();
        let actions = session.handle(SessionEvent::Control(ControlMessage::ResetHard));
        match sent_frame(&actions) {
            RadioPacket::Restart(restart) => assert!(!restart.reset_config),
            other => panic!("unexpected {:?}", other),
        }
        assert!(actions.contains(&Action::ReleaseAlias { session_id: 1 }));
        assert_eq!(session.state(), SessionState::Joining);
        assert!(session.params().is_none());
        assert!(session.config().is_none());

        // The node joins again on the same session.
        session.handle(join_request(0));
        session.handle(node_info(1));
        assert_eq!(session.state(), SessionState::Joined);
    }

    #[test]
    fn test_reset_config_returns_to_joined() {
        let mut session = configured();
        let actions = session.handle(SessionEvent::Control(ControlMessage::ResetConfig));
        match sent_frame(&actions) {
            RadioPacket::Restart(restart) => assert!(restart.reset_config),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Joined);
        assert!(session.config().is_none());
        assert!(session.params().is_some());
    }

    #[test]
    fn test_reset_config_while_joined_is_ignored() {
        let mut session = joined();
        assert!(session
            .handle(SessionEvent::Control(ControlMessage::ResetConfig))
            .is_empty());
        assert_eq!(session.state(), SessionState::Joined);
    }

    fn chunk(sequence: u8, chunk_count: u8) -> SessionEvent {
        over_air(RadioPacket::FftChunkData(FftChunkData {
            session_id: 1,
            sequence,
            chunk_count,
            time: 5000,
            bins: [f32::from(sequence); FFT_CHUNK_BINS],
        }))
    }

    #[test]
    fn test_capture_flow() {
        let mut session = configured();
        let actions = session.handle(SessionEvent::RequestCapture);
        assert!(matches!(
            sent_frame(&actions),
            RadioPacket::FftChunkRequest(FftChunkRequest { session_id: 1 })
        ));
        assert_eq!(session.state(), SessionState::ExpectingChunk);

        assert!(session.handle(chunk(0, 2)).is_empty());
        session.handle(over_air(RadioPacket::TemperatureData(TemperatureData {
            session_id: 1,
            sequence: 0,
            samples: vec![TemperatureSample {
                time: 4999,
                temperature: 2250,
            }],
        })));
        assert_eq!(session.chunks_received(), 1);
        assert_eq!(session.last_temperature().map(|t| t.temperature), Some(2250));

        let actions = session.handle(chunk(1, 2));
        match &actions[..] {
            [Action::StoreCapture {
                address,
                time,
                bins,
            }] => {
                assert_eq!(*address, ADDRESS);
                assert_eq!(*time, 5000);
                assert_eq!(bins.len(), 64);
                assert_eq!(bins[32], 1.0);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(session.state(), SessionState::Joined);
        assert!(session.config().is_none());
    }

    #[test]
    fn test_capture_request_while_joining_is_ignored() {
        let mut session = NodeSession::new();
        session.handle(join_request(0));
        assert!(session.handle(SessionEvent::RequestCapture).is_empty());
        assert_eq!(session.state(), SessionState::Joining);
    }

    #[test]
    fn test_expire_and_stop_release_alias() {
        let mut session = joined();
        assert_eq!(
            session.expire(),
            vec![Action::ReleaseAlias { session_id: 1 }]
        );
        assert_eq!(session.state(), SessionState::Error);

        let mut session = NodeSession::new();
        assert!(session.stop().is_empty());
        assert_eq!(session.state(), SessionState::Stopped);
        assert!(session.stop().is_empty());
    }

    #[test]
    fn test_dropped_events_are_not_accepted() {
        let mut session = joined();
        assert!(session.last_event_accepted());

        session.handle(status_info(1));
        assert!(!session.last_event_accepted());

        session.handle(over_air(RadioPacket::ConfigRequest(radio::ConfigRequest {
            session_id: 2,
        })));
        assert!(!session.last_event_accepted());

        session.handle(SessionEvent::Control(ControlMessage::ResetConfig));
        assert!(!session.last_event_accepted());

        session.handle(over_air(RadioPacket::ConfigRequest(radio::ConfigRequest {
            session_id: 1,
        })));
        assert!(session.last_event_accepted());
    }

    mod runtime {
        use super::*;
        use crate::backend::ChannelTransport;
        use crate::persistence::tests::unique_capture_dir;

        const OTHER: u32 = 0x0A0B_0C0D;

        fn env(
            timeout: Duration,
            send_timeout: Duration,
            downlink_depth: usize,
        ) -> (SessionEnv, mpsc::Receiver<Downlink>) {
            let (downlinks, rx) = mpsc::channel(downlink_depth);
            let env = SessionEnv {
                downlinks,
                aliases: AliasTable::new(),
                captures: CaptureStore::new(unique_capture_dir()),
                settings: SessionSettings {
                    timeout,
                    send_timeout,
                    ..Default::default()
                },
            };
            (env, rx)
        }

        fn join_of(address: u32) -> Uplink {
            Uplink::new(
                RadioPacket::JoinRequest(JoinRequest {
                    session_id: 0,
                    address,
                    start_time: 1,
                    firmware_version: 3,
                }),
                LinkQuality::default(),
            )
        }

        fn start(address: u32, serial: u64, env: &SessionEnv) -> (SessionHandle, ChannelTransport) {
            let (session_end, backend_end) = ChannelTransport::pair(16);
            let handle = spawn_session(
                address,
                serial,
                join_of(address),
                Arc::new(session_end),
                env.clone(),
            );
            (handle, backend_end)
        }

        /// Play the backend side of a join.
        async fn answer_join(backend: &ChannelTransport, address: u32, session_id: u8) {
            assert_eq!(
                backend.recv().await.unwrap(),
                ControlMessage::NodeInfoRequest(NodeInfoRequest { address })
            );
            backend
                .send(&ControlMessage::NodeInfoReply(NodeInfoReply {
                    node_id: u32::from(session_id),
                    address,
                    session_id,
                    code: String::new(),
                    name: "node".into(),
                    firmware_version: 3,
                    port: 8888,
                }))
                .await
                .unwrap();
        }

        async fn wait_for(handle: &SessionHandle, state: SessionState) {
            let mut watch = handle.watch();
            watch.wait_for(|s| s.state == state).await.unwrap();
        }

        fn config_request(session_id: u8) -> SessionEvent {
            over_air(RadioPacket::ConfigRequest(radio::ConfigRequest { session_id }))
        }

        #[tokio::test(start_paused = true)]
        async fn test_idle_session_times_out() {
            let (env, _downlinks) = env(Duration::from_secs(10), DEFAULT_SEND_TIMEOUT, 16);
            let (idle, idle_backend) = start(ADDRESS, 1, &env);
            let (busy, busy_backend) = start(OTHER, 2, &env);

            answer_join(&idle_backend, ADDRESS, 1).await;
            answer_join(&busy_backend, OTHER, 2).await;
            wait_for(&idle, SessionState::Joined).await;
            wait_for(&busy, SessionState::Joined).await;
            assert_eq!(env.aliases.lookup(1), Some(ADDRESS));

            for _ in 0..3 {
                tokio::time::sleep(Duration::from_secs(6)).await;
                busy.deliver(config_request(2)).unwrap();
                assert!(matches!(
                    busy_backend.recv().await.unwrap(),
                    ControlMessage::ConfigRequest(_)
                ));
            }

            assert_eq!(idle.state(), SessionState::Error);
            assert_eq!(env.aliases.lookup(1), None);
            assert_eq!(busy.state(), SessionState::Joined);
            assert_eq!(env.aliases.lookup(2), Some(OTHER));

            busy_backend
                .send(&ControlMessage::ConfigReply(backend_settings()))
                .await
                .unwrap();
            wait_for(&busy, SessionState::Configured).await;
            busy.shutdown().await;
            idle.shutdown().await;
        }

        #[tokio::test(start_paused = true)]
        async fn test_dropped_events_do_not_extend_timeout() {
            let (env, _downlinks) = env(Duration::from_secs(10), DEFAULT_SEND_TIMEOUT, 16);
            let (session, backend) = start(ADDRESS, 1, &env);
            answer_join(&backend, ADDRESS, 1).await;
            wait_for(&session, SessionState::Joined).await;

            tokio::time::sleep(Duration::from_secs(6)).await;
            // Not configured yet: dropped.
            session.deliver(status_info(1)).unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;

            assert_eq!(session.state(), SessionState::Error);
            assert_eq!(env.aliases.lookup(1), None);
        }

        #[tokio::test(start_paused = true)]
        async fn test_stop_interrupts_blocked_radio_send() {
            let (env, mut downlinks) = env(DEFAULT_SESSION_TIMEOUT, Duration::from_secs(3600), 1);
            // Fill the radio queue so the JoinReply cannot be handed off.
            env.downlinks
                .try_send(Downlink {
                    session_id: 9,
                    name: "JoinReply",
                    frame: vec![0x02],
                })
                .unwrap();

            let (session, backend) = start(ADDRESS, 1, &env);
            let watch = session.watch();
            answer_join(&backend, ADDRESS, 1).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert_eq!(env.aliases.lookup(1), Some(ADDRESS));

            tokio::time::timeout(Duration::from_secs(1), session.shutdown())
                .await
                .expect("session did not stop while its radio send was pending");

            assert_eq!(watch.borrow().state, SessionState::Stopped);
            assert_eq!(env.aliases.lookup(1), None);
            // Only the filler frame made it.
            assert_eq!(downlinks.recv().await.map(|d| d.session_id), Some(9));
            assert!(downlinks.try_recv().is_err());
        }
    }
}
