//! Mock transport adapter for testing.
//!
//! Simulates a fleet of devices without any network I/O. Failure modes are
//! configured per host so a single adapter can mix healthy and broken devices,
//! and every call is recorded for later assertions.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use device_stream::{
    AdapterError, AdapterResult, ConnectionListener, DeviceHandle, DeviceIdentity, DeviceOperation,
    DeviceTime, EventKind, OperationOutput, PushHandler, RawPush, SubscribeOptions,
    SubscriptionKind, TransportAdapter,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// First handle the mock hands out
pub const FIRST_HANDLE: u64 = 1000;

/// In-memory stand-in for the vendor SDK.
pub struct MockAdapter {
    next_handle: AtomicU64,
    fail_initialize: AtomicBool,
    initialize_count: AtomicU32,
    login_counts: Mutex<HashMap<String, u32>>,
    login_failures: Mutex<HashSet<String>>,
    login_delay: Mutex<Option<Duration>>,
    handles: Mutex<HashMap<DeviceHandle, String>>,
    logouts: Mutex<Vec<DeviceHandle>>,
    subscription_failures: Mutex<HashSet<(String, SubscriptionKind)>>,
    subscription_declines: Mutex<HashSet<(String, SubscriptionKind)>>,
    subscription_delay: Mutex<Option<Duration>>,
    start_calls: Mutex<Vec<(DeviceHandle, SubscriptionKind, SubscribeOptions)>>,
    stop_calls: Mutex<Vec<(DeviceHandle, SubscriptionKind)>>,
    invocations: Mutex<Vec<(DeviceHandle, DeviceOperation)>>,
    invoke_failures: Mutex<HashSet<String>>,
    invoke_delays: Mutex<HashMap<String, Duration>>,
    reboots: AtomicU32,
    time_configs: Mutex<HashMap<DeviceHandle, DeviceTime>>,
    handlers: Mutex<HashMap<EventKind, PushHandler>>,
    listener: Mutex<Option<Arc<dyn ConnectionListener>>>,
}

impl MockAdapter {
    /// Create an adapter where every device is healthy.
    pub fn new() -> Self {
        Self {
            next_handle: AtomicU64::new(FIRST_HANDLE),
            fail_initialize: AtomicBool::new(false),
            initialize_count: AtomicU32::new(0),
            login_counts: Mutex::new(HashMap::new()),
            login_failures: Mutex::new(HashSet::new()),
            login_delay: Mutex::new(None),
            handles: Mutex::new(HashMap::new()),
            logouts: Mutex::new(Vec::new()),
            subscription_failures: Mutex::new(HashSet::new()),
            subscription_declines: Mutex::new(HashSet::new()),
            subscription_delay: Mutex::new(None),
            start_calls: Mutex::new(Vec::new()),
            stop_calls: Mutex::new(Vec::new()),
            invocations: Mutex::new(Vec::new()),
            invoke_failures: Mutex::new(HashSet::new()),
            invoke_delays: Mutex::new(HashMap::new()),
            reboots: AtomicU32::new(0),
            time_configs: Mutex::new(HashMap::new()),
            handlers: Mutex::new(HashMap::new()),
            listener: Mutex::new(None),
        }
    }

    // Failure configuration

    pub fn fail_initialize(&self) {
        self.fail_initialize.store(true, Ordering::SeqCst);
    }

    pub fn fail_login_for(&self, host: &str) {
        self.login_failures.lock().unwrap().insert(host.to_string());
    }

    pub fn clear_login_failure(&self, host: &str) {
        self.login_failures.lock().unwrap().remove(host);
    }

    pub fn set_login_delay(&self, delay: Duration) {
        *self.login_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_subscription_for(&self, host: &str, kind: SubscriptionKind) {
        self.subscription_failures
            .lock()
            .unwrap()
            .insert((host.to_string(), kind));
    }

    pub fn clear_subscription_failure(&self, host: &str, kind: SubscriptionKind) {
        self.subscription_failures
            .lock()
            .unwrap()
            .remove(&(host.to_string(), kind));
    }

    /// Make the device answer `Ok(false)` for `kind`
    pub fn decline_subscription_for(&self, host: &str, kind: SubscriptionKind) {
        self.subscription_declines
            .lock()
            .unwrap()
            .insert((host.to_string(), kind));
    }

    pub fn set_subscription_delay(&self, delay: Duration) {
        *self.subscription_delay.lock().unwrap() = Some(delay);
    }

    pub fn fail_invoke_for(&self, host: &str) {
        self.invoke_failures.lock().unwrap().insert(host.to_string());
    }

    pub fn clear_invoke_failure(&self, host: &str) {
        self.invoke_failures.lock().unwrap().remove(host);
    }

    pub fn set_invoke_delay(&self, host: &str, delay: Duration) {
        self.invoke_delays
            .lock()
            .unwrap()
            .insert(host.to_string(), delay);
    }

    pub fn set_time_config(&self, handle: DeviceHandle, time: DeviceTime) {
        self.time_configs.lock().unwrap().insert(handle, time);
    }

    // Device-side simulation

    /// Deliver a push through the registered handler.
    ///
    /// Returns false when no handler is registered for `kind`.
    pub fn push(&self, kind: EventKind, push: RawPush) -> bool {
        let handler = self.handlers.lock().unwrap().get(&kind).cloned();
        match handler {
            Some(handler) => {
                handler(push);
                true
            }
            None => false,
        }
    }

    pub fn has_handler(&self, kind: EventKind) -> bool {
        self.handlers.lock().unwrap().contains_key(&kind)
    }

    pub fn simulate_disconnect(&self, handle: DeviceHandle) {
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.on_disconnect(handle);
        }
    }

    pub fn simulate_reconnect(&self, handle: DeviceHandle) {
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            listener.on_reconnect(handle);
        }
    }

    // Recorded calls

    pub fn initialize_count(&self) -> u32 {
        self.initialize_count.load(Ordering::SeqCst)
    }

    pub fn login_count(&self, host: &str) -> u32 {
        self.login_counts
            .lock()
            .unwrap()
            .get(host)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_logins(&self) -> u32 {
        self.login_counts.lock().unwrap().values().sum()
    }

    pub fn logouts(&self) -> Vec<DeviceHandle> {
        self.logouts.lock().unwrap().clone()
    }

    pub fn host_of(&self, handle: DeviceHandle) -> Option<String> {
        self.handles.lock().unwrap().get(&handle).cloned()
    }

    pub fn start_calls(&self) -> Vec<(DeviceHandle, SubscriptionKind, SubscribeOptions)> {
        self.start_calls.lock().unwrap().clone()
    }

    pub fn start_count(&self, handle: DeviceHandle, kind: SubscriptionKind) -> usize {
        self.start_calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, k, _)| *h == handle && *k == kind)
            .count()
    }

    pub fn stop_calls(&self) -> Vec<(DeviceHandle, SubscriptionKind)> {
        self.stop_calls.lock().unwrap().clone()
    }

    /// Operations invoked on `handle`, by name, in call order
    pub fn invocations_for(&self, handle: DeviceHandle) -> Vec<&'static str> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|(h, _)| *h == handle)
            .map(|(_, op)| op.name())
            .collect()
    }

    pub fn invocation_count(&self, name: &str) -> usize {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, op)| op.name() == name)
            .count()
    }

    /// Time settings written through SetTimeConfig
    pub fn time_writes(&self) -> Vec<(DeviceHandle, DeviceTime)> {
        self.invocations
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(h, op)| match op {
                DeviceOperation::SetTimeConfig(time) => Some((*h, *time)),
                _ => None,
            })
            .collect()
    }

    /// Successful reboots
    pub fn reboot_count(&self) -> u32 {
        self.reboots.load(Ordering::SeqCst)
    }

    fn host_for(&self, handle: DeviceHandle) -> AdapterResult<String> {
        self.host_of(handle)
            .ok_or(AdapterError::NotConnected(handle))
    }
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TransportAdapter for MockAdapter {
    async fn initialize(&self) -> AdapterResult<()> {
        self.initialize_count.fetch_add(1, Ordering::SeqCst);
        if self.fail_initialize.load(Ordering::SeqCst) {
            return Err(AdapterError::Fault("SDK init returned false".to_string()));
        }
        Ok(())
    }

    async fn login(&self, identity: &DeviceIdentity) -> AdapterResult<DeviceHandle> {
        let host = identity.host().to_string();
        *self
            .login_counts
            .lock()
            .unwrap()
            .entry(host.clone())
            .or_insert(0) += 1;

        let delay = *self.login_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.login_failures.lock().unwrap().contains(&host) {
            return Err(AdapterError::Unreachable(host));
        }

        let handle = DeviceHandle::new(self.next_handle.fetch_add(1, Ordering::SeqCst));
        self.handles.lock().unwrap().insert(handle, host);
        Ok(handle)
    }

    async fn logout(&self, handle: DeviceHandle) -> AdapterResult<()> {
        self.logouts.lock().unwrap().push(handle);
        self.handles
            .lock()
            .unwrap()
            .remove(&handle)
            .map(|_| ())
            .ok_or(AdapterError::NotConnected(handle))
    }

    fn register_push_handler(&self, kind: EventKind, handler: PushHandler) {
        self.handlers.lock().unwrap().insert(kind, handler);
    }

    async fn start_subscription(
        &self,
        handle: DeviceHandle,
        kind: SubscriptionKind,
        options: &SubscribeOptions,
    ) -> AdapterResult<bool> {
        self.start_calls
            .lock()
            .unwrap()
            .push((handle, kind, options.clone()));

        let delay = *self.subscription_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let host = self.host_for(handle)?;
        let key = (host, kind);
        if self.subscription_failures.lock().unwrap().contains(&key) {
            return Err(AdapterError::Rejected(format!("{kind} subscription refused")));
        }
        if self.subscription_declines.lock().unwrap().contains(&key) {
            return Ok(false);
        }
        Ok(true)
    }

    async fn stop_subscription(
        &self,
        handle: DeviceHandle,
        kind: SubscriptionKind,
    ) -> AdapterResult<()> {
        self.stop_calls.lock().unwrap().push((handle, kind));
        Ok(())
    }

    async fn invoke(
        &self,
        handle: DeviceHandle,
        operation: DeviceOperation,
        _timeout: Duration,
    ) -> AdapterResult<OperationOutput> {
        let host = self.host_for(handle)?;
        self.invocations
            .lock()
            .unwrap()
            .push((handle, operation.clone()));

        let delay = self.invoke_delays.lock().unwrap().get(&host).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.invoke_failures.lock().unwrap().contains(&host) {
            return Err(AdapterError::Unreachable(host));
        }

        match operation {
            DeviceOperation::GetTimeConfig => {
                let time = self
                    .time_configs
                    .lock()
                    .unwrap()
                    .get(&handle)
                    .copied()
                    .unwrap_or_else(|| DeviceTime::from_utc(Utc::now(), 420));
                Ok(OperationOutput::TimeConfig(time))
            }
            DeviceOperation::SetTimeConfig(time) => {
                self.time_configs.lock().unwrap().insert(handle, time);
                Ok(OperationOutput::Done)
            }
            DeviceOperation::SnapPicture { .. } => Ok(OperationOutput::Done),
            DeviceOperation::Reboot => {
                self.reboots.fetch_add(1, Ordering::SeqCst);
                Ok(OperationOutput::Done)
            }
        }
    }

    fn set_connection_listener(&self, listener: Arc<dyn ConnectionListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }
}
