//! Session table and uplink routing.
//!
//! The registry keeps one session per node hardware address plus an alias
//! table mapping the one-byte session id each node puts on the air back to
//! that address. Routing reads the alias table; only sessions write it, at
//! the moment they finish joining, and release it when they reset or end.
//!
//! Alias entries carry the serial of the session that registered them, so a
//! session being replaced cannot remove the alias its successor just took.
//! The registry drops a replaced session's aliases itself before starting
//! the successor; a cancelled session can no longer register new ones.

use crate::backend::TransportFactory;
use crate::gateway::tx_queue::Downlink;
use crate::node::session::{
    spawn_session, DeliveryError, SessionEnv, SessionEvent, SessionHandle, SessionSettings,
    SessionSnapshot, SessionState, Uplink,
};
use crate::persistence::CaptureStore;
use crate::protocol::radio::{RadioPacket, UNJOINED_SESSION};
use crate::stats::GatewayStats;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::Ordering;
use std::sync::{Arc, PoisonError, RwLock};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy)]
struct AliasEntry {
    address: u32,
    owner: u64,
}

/// Shared session id to address map.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    inner: Arc<RwLock<HashMap<u8, AliasEntry>>>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `session_id` to `address` on behalf of session `owner`.
    ///
    /// Returns the address previously holding the id, if it was a different
    /// node.
    pub fn register(&self, session_id: u8, address: u32, owner: u64) -> Option<u32> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(session_id, AliasEntry { address, owner })
            .map(|previous| previous.address)
            .filter(|previous| *previous != address)
    }

    /// Like [`register`](Self::register), unless `cancel` has fired.
    ///
    /// The check happens under the table lock, so once the owner's token is
    /// cancelled and [`release_owner`](Self::release_owner) has run, the
    /// owner holds no alias. Returns `None` when the registration was
    /// refused.
    pub fn register_unless_cancelled(
        &self,
        session_id: u8,
        address: u32,
        owner: u64,
        cancel: &CancellationToken,
    ) -> Option<Option<u32>> {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if cancel.is_cancelled() {
            return None;
        }
        Some(
            map.insert(session_id, AliasEntry { address, owner })
                .map(|previous| previous.address)
                .filter(|previous| *previous != address),
        )
    }

    /// Remove every alias held by `owner`. Returns how many were removed.
    pub fn release_owner(&self, owner: u64) -> usize {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let before = map.len();
        map.retain(|_, entry| entry.owner != owner);
        before - map.len()
    }

    /// Remove `session_id` if `owner` still holds it.
    pub fn release(&self, session_id: u8, owner: u64) -> bool {
        let mut map = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match map.get(&session_id) {
            Some(entry) if entry.owner == owner => {
                map.remove(&session_id);
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, session_id: u8) -> Option<u32> {
        let map = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        map.get(&session_id).map(|entry| entry.address)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Registry limits.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Maximum number of sessions, finished ones included.
    pub max_sessions: usize,
    pub session: SessionSettings,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            // One per usable session id.
            max_sessions: 255,
            session: SessionSettings::default(),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<(), RegistryError> {
        if self.max_sessions == 0 {
            return Err(RegistryError::InvalidConfig(
                "max_sessions must be greater than 0",
            ));
        }
        if self.session.timeout.is_zero() {
            return Err(RegistryError::InvalidConfig(
                "session timeout must be greater than 0",
            ));
        }
        if self.session.queue_depth == 0 {
            return Err(RegistryError::InvalidConfig(
                "session queue depth must be greater than 0",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    InvalidConfig(&'static str),
    /// No session for this address.
    UnknownNode(u32),
    Delivery(DeliveryError),
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(msg) => write!(f, "invalid registry config: {}", msg),
            Self::UnknownNode(address) => write!(f, "no session for node 0x{:08X}", address),
            Self::Delivery(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for RegistryError {}

/// Why an uplink was not delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Session id 0 on anything but a JoinRequest.
    Unjoined(&'static str),
    /// No live session holds this session id.
    UnknownSession(u8),
    /// The session's inbound queue is full.
    QueueFull(u32),
    /// The session has already ended.
    SessionClosed(u32),
    /// No room for another session.
    TableFull,
    /// The backend transport for a new session could not be opened.
    TransportUnavailable(String),
}

impl fmt::Display for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unjoined(name) => write!(f, "{} from unjoined node", name),
            Self::UnknownSession(id) => write!(f, "unknown session id 0x{:02X}", id),
            Self::QueueFull(address) => write!(f, "session 0x{:08X} queue full", address),
            Self::SessionClosed(address) => write!(f, "session 0x{:08X} closed", address),
            Self::TableFull => write!(f, "session table full"),
            Self::TransportUnavailable(e) => write!(f, "backend transport unavailable: {}", e),
        }
    }
}

/// Result of routing one uplink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Handed to the existing session of `address`.
    Delivered(u32),
    /// A JoinRequest opened a new session.
    Created(u32),
    /// A JoinRequest replaced the existing session of the same node.
    Replaced(u32),
    Dropped(DropReason),
}

/// Owner of all node sessions.
pub struct SessionRegistry {
    sessions: HashMap<u32, SessionHandle>,
    aliases: AliasTable,
    transports: Arc<dyn TransportFactory>,
    env: SessionEnv,
    max_sessions: usize,
    next_serial: u64,
    stats: Arc<GatewayStats>,
}

impl SessionRegistry {
    /// Create a registry. Frames produced by its sessions arrive on the
    /// returned receiver, which belongs to the radio scheduler.
    pub fn new(
        config: RegistryConfig,
        transports: Arc<dyn TransportFactory>,
        captures: CaptureStore,
        stats: Arc<GatewayStats>,
    ) -> Result<(Self, tokio::sync::mpsc::Receiver<Downlink>), RegistryError> {
        config.validate()?;
        let (downlinks, downlink_rx) = tokio::sync::mpsc::channel(config.session.queue_depth);
        let aliases = AliasTable::new();
        let env = SessionEnv {
            downlinks,
            aliases: aliases.clone(),
            captures,
            settings: config.session,
        };
        Ok((
            Self {
                sessions: HashMap::new(),
                aliases,
                transports,
                env,
                max_sessions: config.max_sessions,
                next_serial: 1,
                stats,
            },
            downlink_rx,
        ))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    pub fn addresses(&self) -> Vec<u32> {
        self.sessions.keys().copied().collect()
    }

    pub fn state_of(&self, address: u32) -> Option<SessionState> {
        self.sessions.get(&address).map(SessionHandle::state)
    }

    pub fn snapshot_of(&self, address: u32) -> Option<SessionSnapshot> {
        self.sessions.get(&address).map(SessionHandle::snapshot)
    }

    /// Route one decoded uplink.
    pub fn route(&mut self, uplink: Uplink) -> RouteOutcome {
        let outcome = self.route_inner(uplink);
        match &outcome {
            RouteOutcome::Dropped(reason) => {
                self.stats.routing.record_dropped();
                warn!("Dropping uplink: {}", reason);
            }
            _ => self.stats.routing.record_delivered(),
        }
        self.stats
            .routing
            .active_sessions
            .store(self.sessions.len(), Ordering::Relaxed);
        outcome
    }

    fn route_inner(&mut self, uplink: Uplink) -> RouteOutcome {
        let session_id = uplink.packet.session_id();

        if session_id == UNJOINED_SESSION {
            let joining = match &uplink.packet {
                RadioPacket::JoinRequest(join) => Some(join.address),
                _ => None,
            };
            return match joining {
                Some(address) => self.start_session(address, uplink),
                None => RouteOutcome::Dropped(DropReason::Unjoined(uplink.packet.name())),
            };
        }

        let Some(address) = self.aliases.lookup(session_id) else {
            return RouteOutcome::Dropped(DropReason::UnknownSession(session_id));
        };
        let Some(handle) = self.sessions.get(&address) else {
            return RouteOutcome::Dropped(DropReason::UnknownSession(session_id));
        };
        debug!(
            "Routing {} for session 0x{:02X} to 0x{:08X}",
            uplink.packet.name(),
            session_id,
            address
        );
        match handle.deliver(SessionEvent::Radio(uplink)) {
            Ok(()) => RouteOutcome::Delivered(address),
            Err(DeliveryError::Full) => RouteOutcome::Dropped(DropReason::QueueFull(address)),
            Err(DeliveryError::Closed) => RouteOutcome::Dropped(DropReason::SessionClosed(address)),
        }
    }

    fn start_session(&mut self, address: u32, join: Uplink) -> RouteOutcome {
        let replaced = match self.sessions.remove(&address) {
            Some(old) => {
                info!(
                    "Node 0x{:08X} joined again, replacing session in {}",
                    address,
                    old.state()
                );
                old.stop();
                let released = self.aliases.release_owner(old.serial());
                if released > 0 {
                    debug!("Released {} alias(es) of replaced session", released);
                }
                true
            }
            None => false,
        };

        if !replaced && self.sessions.len() >= self.max_sessions {
            self.remove_finished();
            if self.sessions.len() >= self.max_sessions {
                return RouteOutcome::Dropped(DropReason::TableFull);
            }
        }

        let transport = match self.transports.open(address) {
            Ok(transport) => transport,
            Err(e) => return RouteOutcome::Dropped(DropReason::TransportUnavailable(e.to_string())),
        };

        let serial = self.next_serial;
        self.next_serial += 1;
        let handle = spawn_session(address, serial, join, transport, self.env.clone());
        self.sessions.insert(address, handle);

        if replaced {
            self.stats
                .routing
                .sessions_replaced
                .fetch_add(1, Ordering::Relaxed);
            RouteOutcome::Replaced(address)
        } else {
            info!("New session for node 0x{:08X}", address);
            self.stats
                .routing
                .sessions_created
                .fetch_add(1, Ordering::Relaxed);
            RouteOutcome::Created(address)
        }
    }

    /// Ask the session of `address` for an FFT capture.
    pub fn request_capture(&self, address: u32) -> Result<(), RegistryError> {
        self.sessions
            .get(&address)
            .ok_or(RegistryError::UnknownNode(address))?
            .deliver(SessionEvent::RequestCapture)
            .map_err(RegistryError::Delivery)
    }

    /// Drop sessions that reached a terminal state. Returns their final
    /// snapshots.
    pub fn remove_finished(&mut self) -> Vec<(u32, SessionSnapshot)> {
        let finished: Vec<u32> = self
            .sessions
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(address, _)| *address)
            .collect();
        let removed: Vec<(u32, SessionSnapshot)> = finished
            .into_iter()
            .filter_map(|address| {
                self.sessions
                    .remove(&address)
                    .map(|handle| (address, handle.snapshot()))
            })
            .collect();
        self.stats
            .routing
            .active_sessions
            .store(self.sessions.len(), Ordering::Relaxed);
        removed
    }

    /// Stop every session and wait for its tasks. Final states stay
    /// inspectable through the returned snapshots.
    pub async fn shutdown(&mut self) -> Vec<(u32, SessionSnapshot)> {
        let mut finals = Vec::with_capacity(self.sessions.len());
        for (address, handle) in self.sessions.drain() {
            handle.stop();
            let mut watch = handle.watch();
            handle.shutdown().await;
            let snapshot = watch.borrow_and_update().clone();
            finals.push((address, snapshot));
        }
        self.stats.routing.active_sessions.store(0, Ordering::Relaxed);
        finals
    }
}
