//! Device session registry
//!
//! Owns the mapping from device identity to connection state and handle, and
//! turns adapter disconnect/reconnect callbacks into state transitions plus
//! [`ConnectionEvent`]s for the rest of the bridge.
//!
//! State machine per session:
//!
//! ```text
//! Disconnected -> Connecting -> Connected <-> Reconnecting
//!       ^             |                            |
//!       +-------------+--- logout / deregister ----+
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};

use crate::adapter::{with_timeout, ConnectionListener, TransportAdapter};
use crate::clock::Clock;
use crate::error::{RegistryError, RegistryResult};
use crate::types::{DeviceHandle, DeviceIdentity, SessionKey};

/// Connection state of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The adapter lost the link and is retrying on its own
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Snapshot of one device session
#[derive(Debug, Clone)]
pub struct DeviceSession {
    identity: DeviceIdentity,
    handle: Option<DeviceHandle>,
    state: ConnectionState,
    last_state_change_at: DateTime<Utc>,
    consecutive_failures: u32,
    /// Registry-wide unique per login attempt; replaced on logout so
    /// in-flight logins can tell they are stale
    generation: u64,
}

impl DeviceSession {
    fn new(identity: DeviceIdentity, now: DateTime<Utc>) -> Self {
        Self {
            identity,
            handle: None,
            state: ConnectionState::Disconnected,
            last_state_change_at: now,
            consecutive_failures: 0,
            generation: 0,
        }
    }

    fn transition(&mut self, state: ConnectionState, now: DateTime<Utc>) {
        if self.state != state {
            self.state = state;
            self.last_state_change_at = now;
        }
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn key(&self) -> SessionKey {
        self.identity.key()
    }

    pub fn handle(&self) -> Option<DeviceHandle> {
        self.handle
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn last_state_change_at(&self) -> DateTime<Utc> {
        self.last_state_change_at
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Connection changes reported to the rest of the bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Disconnected(DeviceHandle),
    Reconnected(DeviceHandle),
}

/// A connected device as seen by one scheduler tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectedDevice {
    pub handle: DeviceHandle,
    pub key: SessionKey,
}

/// Capped exponential backoff for [`SessionRegistry::login_with_retry`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginRetryPolicy {
    /// Default: 5
    pub max_attempts: u32,
    /// Default: 1 second
    pub base_delay: Duration,
    /// Default: 60 seconds
    pub max_delay: Duration,
}

impl Default for LoginRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl LoginRetryPolicy {
    /// Delay before retry number `attempt` (0-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Default)]
struct RegistryState {
    sessions: HashMap<SessionKey, DeviceSession>,
    by_handle: HashMap<DeviceHandle, SessionKey>,
}

#[derive(Debug, Default)]
struct RegistryCounters {
    logins: AtomicU64,
    login_failures: AtomicU64,
    disconnects: AtomicU64,
    reconnects: AtomicU64,
}

/// Thread-safe registry of device sessions
///
/// The session map sits behind a std `RwLock`; the lock is never held across
/// an `.await`, so snapshot reads never wait on network I/O. Logins for the
/// same key are serialized by a per-key async mutex.
pub struct SessionRegistry {
    adapter: Arc<dyn TransportAdapter>,
    state: RwLock<RegistryState>,
    login_locks: DashMap<SessionKey, Arc<Mutex<()>>>,
    events_tx: mpsc::UnboundedSender<ConnectionEvent>,
    clock: Arc<dyn Clock>,
    call_timeout: Duration,
    generations: AtomicU64,
    counters: RegistryCounters,
}

impl SessionRegistry {
    /// Create a registry and the receiver for its connection events
    pub fn new(
        adapter: Arc<dyn TransportAdapter>,
        clock: Arc<dyn Clock>,
        call_timeout: Duration,
    ) -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let registry = Self {
            adapter,
            state: RwLock::new(RegistryState::default()),
            login_locks: DashMap::new(),
            events_tx,
            clock,
            call_timeout,
            generations: AtomicU64::new(0),
            counters: RegistryCounters::default(),
        };

        (registry, events_rx)
    }

    fn read(&self) -> RwLockReadGuard<'_, RegistryState> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryState> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Never reused, even across a deregister that recreates the session
    fn next_generation(&self) -> u64 {
        self.generations.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Listener to hand to [`TransportAdapter::set_connection_listener`]
    pub fn listener(self: &Arc<Self>) -> Arc<dyn ConnectionListener> {
        Arc::new(RegistryListener {
            registry: Arc::downgrade(self),
        })
    }

    /// Log in to a device, or return the handle of its live session
    ///
    /// # Arguments
    /// * `identity` - Device address and credentials
    ///
    /// # Returns
    /// * `Ok(DeviceHandle)` - The new or existing handle
    /// * `Err(RegistryError::LoginFailure)` - The adapter rejected the login
    /// * `Err(RegistryError::LoginAborted)` - The session was logged out while logging in
    pub async fn login(&self, identity: &DeviceIdentity) -> RegistryResult<DeviceHandle> {
        let key = identity.key();

        let lock = self
            .login_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _serialized = lock.lock().await;

        let generation = {
            let mut state = self.write();
            let now = self.clock.now();
            let session = state
                .sessions
                .entry(key.clone())
                .or_insert_with(|| DeviceSession::new(identity.clone(), now));

            if let (ConnectionState::Connected | ConnectionState::Reconnecting, Some(handle)) =
                (session.state, session.handle)
            {
                tracing::debug!(device = %key, %handle, "Already logged in, reusing handle");
                return Ok(handle);
            }

            session.identity = identity.clone();
            session.transition(ConnectionState::Connecting, now);
            session.generation = self.next_generation();
            session.generation
        };

        self.counters.logins.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(device = %key, user = identity.username(), "Logging in");

        let result = with_timeout("Login", self.call_timeout, self.adapter.login(identity)).await;

        let outcome = {
            let mut guard = self.write();
            let state = &mut *guard;
            let now = self.clock.now();

            let current = state
                .sessions
                .get_mut(&key)
                .filter(|session| session.generation == generation);

            match (current, result) {
                (None, Ok(handle)) => Err((Some(handle), RegistryError::LoginAborted(key.clone()))),
                (None, Err(_)) => Err((None, RegistryError::LoginAborted(key.clone()))),
                (Some(session), Ok(handle)) => {
                    session.handle = Some(handle);
                    session.consecutive_failures = 0;
                    session.transition(ConnectionState::Connected, now);
                    state.by_handle.retain(|_, owner| *owner != key);
                    state.by_handle.insert(handle, key.clone());
                    Ok(handle)
                }
                (Some(session), Err(source)) => {
                    session.handle = None;
                    session.consecutive_failures += 1;
                    session.transition(ConnectionState::Disconnected, now);
                    Err((
                        None,
                        RegistryError::LoginFailure {
                            key: key.clone(),
                            source,
                        },
                    ))
                }
            }
        };

        match outcome {
            Ok(handle) => {
                tracing::info!(device = %key, %handle, "Device logged in");
                Ok(handle)
            }
            Err((stale_handle, error)) => {
                if let Some(handle) = stale_handle {
                    tracing::debug!(device = %key, %handle, "Session went away during login, releasing handle");
                    self.release(handle).await;
                }
                if matches!(error, RegistryError::LoginFailure { .. }) {
                    self.counters.login_failures.fetch_add(1, Ordering::Relaxed);
                }
                tracing::warn!(device = %key, error = %error, "Login failed");
                Err(error)
            }
        }
    }

    /// [`Self::login`] with capped exponential backoff between failed attempts
    pub async fn login_with_retry(
        &self,
        identity: &DeviceIdentity,
        policy: &LoginRetryPolicy,
    ) -> RegistryResult<DeviceHandle> {
        let mut attempt = 0;
        loop {
            match self.login(identity).await {
                Ok(handle) => return Ok(handle),
                Err(error @ RegistryError::LoginFailure { .. }) if attempt + 1 < policy.max_attempts => {
                    let delay = policy.delay_for(attempt);
                    tracing::debug!(device = %identity.key(), attempt, ?delay, error = %error, "Retrying login");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }

    /// Handles of all `Connected` sessions, ascending
    pub fn list_connected_handles(&self) -> Vec<DeviceHandle> {
        self.list_connected().into_iter().map(|d| d.handle).collect()
    }

    /// Connected sessions with their keys, ordered by handle
    pub fn list_connected(&self) -> Vec<ConnectedDevice> {
        let state = self.read();
        let mut devices: Vec<ConnectedDevice> = state
            .sessions
            .iter()
            .filter(|(_, session)| session.state == ConnectionState::Connected)
            .filter_map(|(key, session)| {
                session.handle.map(|handle| ConnectedDevice {
                    handle,
                    key: key.clone(),
                })
            })
            .collect();
        devices.sort_by_key(|device| device.handle);
        devices
    }

    /// Move every session to `Disconnected` and release adapter connections.
    ///
    /// Logins in flight are aborted. Logout errors are logged, not returned.
    pub async fn logout_all(&self) {
        let handles: Vec<(SessionKey, DeviceHandle)> = {
            let mut state = self.write();
            let now = self.clock.now();
            state.by_handle.clear();

            state
                .sessions
                .iter_mut()
                .filter_map(|(key, session)| {
                    session.generation = self.next_generation();
                    session.transition(ConnectionState::Disconnected, now);
                    session.handle.take().map(|handle| (key.clone(), handle))
                })
                .collect()
        };

        tracing::info!(sessions = handles.len(), "Logging out all devices");

        let releases = handles.iter().map(|(_, handle)| self.release(*handle));
        futures::future::join_all(releases).await;
    }

    /// Log out (best effort) and forget a session
    pub async fn deregister(&self, key: &SessionKey) -> RegistryResult<Option<DeviceHandle>> {
        let handle = {
            let mut state = self.write();
            let session = state
                .sessions
                .remove(key)
                .ok_or_else(|| RegistryError::UnknownSession(key.clone()))?;
            if let Some(handle) = session.handle {
                state.by_handle.remove(&handle);
            }
            session.handle
        };
        self.login_locks.remove(key);

        if let Some(handle) = handle {
            self.release(handle).await;
        }

        tracing::info!(device = %key, "Device deregistered");
        Ok(handle)
    }

    async fn release(&self, handle: DeviceHandle) {
        if let Err(e) = with_timeout("Logout", self.call_timeout, self.adapter.logout(handle)).await {
            tracing::warn!(%handle, error = %e, "Logout failed");
        }
    }

    /// Adapter callback: the connection behind `handle` dropped
    pub fn on_disconnect(&self, handle: DeviceHandle) {
        let changed = {
            let mut state = self.write();
            let now = self.clock.now();
            let Some(key) = state.by_handle.get(&handle).cloned() else {
                tracing::debug!(%handle, "Disconnect for unknown handle ignored");
                return;
            };
            match state.sessions.get_mut(&key) {
                Some(session) if session.state == ConnectionState::Connected => {
                    session.transition(ConnectionState::Reconnecting, now);
                    Some(key)
                }
                _ => None,
            }
        };

        if let Some(key) = changed {
            self.counters.disconnects.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(device = %key, %handle, "Device disconnected, waiting for adapter reconnect");
            let _ = self.events_tx.send(ConnectionEvent::Disconnected(handle));
        }
    }

    /// Adapter callback: the connection behind `handle` is back
    pub fn on_reconnect(&self, handle: DeviceHandle) {
        let changed = {
            let mut state = self.write();
            let now = self.clock.now();
            let Some(key) = state.by_handle.get(&handle).cloned() else {
                tracing::debug!(%handle, "Reconnect for unknown handle ignored");
                return;
            };
            match state.sessions.get_mut(&key) {
                Some(session) if session.state == ConnectionState::Reconnecting => {
                    session.transition(ConnectionState::Connected, now);
                    Some(key)
                }
                Some(session) => {
                    tracing::debug!(device = %key, %handle, state = %session.state, "Reconnect without prior disconnect ignored");
                    None
                }
                None => None,
            }
        };

        if let Some(key) = changed {
            self.counters.reconnects.fetch_add(1, Ordering::Relaxed);
            tracing::info!(device = %key, %handle, "Device reconnected");
            let _ = self.events_tx.send(ConnectionEvent::Reconnected(handle));
        }
    }

    pub fn session(&self, key: &SessionKey) -> Option<DeviceSession> {
        self.read().sessions.get(key).cloned()
    }

    /// All sessions, ordered by key
    pub fn sessions(&self) -> Vec<DeviceSession> {
        let mut sessions: Vec<DeviceSession> = self.read().sessions.values().cloned().collect();
        sessions.sort_by_key(|session| session.key());
        sessions
    }

    pub fn key_for(&self, handle: DeviceHandle) -> Option<SessionKey> {
        self.read().by_handle.get(&handle).cloned()
    }

    pub fn state_of(&self, handle: DeviceHandle) -> Option<ConnectionState> {
        let state = self.read();
        let key = state.by_handle.get(&handle)?;
        state.sessions.get(key).map(|session| session.state)
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.read();
        let mut stats = RegistryStats {
            sessions: state.sessions.len(),
            logins: self.counters.logins.load(Ordering::Relaxed),
            login_failures: self.counters.login_failures.load(Ordering::Relaxed),
            disconnects: self.counters.disconnects.load(Ordering::Relaxed),
            reconnects: self.counters.reconnects.load(Ordering::Relaxed),
            ..Default::default()
        };

        for session in state.sessions.values() {
            match session.state {
                ConnectionState::Connected => stats.connected += 1,
                ConnectionState::Connecting => stats.connecting += 1,
                ConnectionState::Reconnecting => stats.reconnecting += 1,
                ConnectionState::Disconnected => stats.disconnected += 1,
            }
        }

        stats
    }
}

impl fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("stats", &self.stats())
            .finish()
    }
}

struct RegistryListener {
    registry: Weak<SessionRegistry>,
}

impl ConnectionListener for RegistryListener {
    fn on_disconnect(&self, handle: DeviceHandle) {
        if let Some(registry) = self.registry.upgrade() {
            registry.on_disconnect(handle);
        }
    }

    fn on_reconnect(&self, handle: DeviceHandle) {
        if let Some(registry) = self.registry.upgrade() {
            registry.on_reconnect(handle);
        }
    }
}

/// Registry counters and state breakdown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub sessions: usize,
    pub connected: usize,
    pub connecting: usize,
    pub reconnecting: usize,
    pub disconnected: usize,
    pub logins: u64,
    pub login_failures: u64,
    pub disconnects: u64,
    pub reconnects: u64,
}

impl fmt::Display for RegistryStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} sessions ({} connected, {} reconnecting, {} connecting, {} disconnected), {} logins, {} failed",
            self.sessions,
            self.connected,
            self.reconnecting,
            self.connecting,
            self.disconnected,
            self.logins,
            self.login_failures
        )
    }
}
