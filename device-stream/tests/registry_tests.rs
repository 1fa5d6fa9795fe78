//! Integration tests for the session registry.
//!
//! These tests verify:
//! - Idempotent login, including concurrent callers for the same device
//! - Login failure and timeout handling
//! - Disconnect/reconnect transitions driven by adapter callbacks
//! - Logout, deregistration and logins aborted by a logout

mod mock_adapter;

use device_stream::{
    AdapterError, Clock, ConnectionEvent, ConnectionState, LoginRetryPolicy, RegistryError,
    SessionKey, SessionRegistry, SystemClock, TransportAdapter,
};
use mock_adapter::MockAdapter;
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{create_test_identity, TEST_PORT};
use tokio::sync::mpsc;

fn create_registry(
    adapter: &Arc<MockAdapter>,
    call_timeout: Duration,
) -> (Arc<SessionRegistry>, mpsc::UnboundedReceiver<ConnectionEvent>) {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let transport: Arc<dyn TransportAdapter> = adapter.clone();
    let (registry, events) = SessionRegistry::new(transport, clock, call_timeout);
    let registry = Arc::new(registry);
    adapter.set_connection_listener(registry.listener());
    (registry, events)
}

#[tokio::test]
async fn test_login_is_idempotent() {
    let adapter = Arc::new(MockAdapter::new());
    let (registry, _events) = create_registry(&adapter, Duration::from_millis(500));
    let identity = create_test_identity("10.0.0.1");

    let first = registry.login(&identity).await.expect("first login");
    let second = registry.login(&identity).await.expect("second login");

    assert_eq!(first, second);
    assert_eq!(adapter.login_count("10.0.0.1"), 1);
    assert_eq!(registry.list_connected_handles(), vec![first]);
}

#[tokio::test]
async fn test_concurrent_logins_share_one_adapter_login() {
    let adapter = Arc::new(MockAdapter::new());
    adapter.set_login_delay(Duration::from_millis(50));
    let (registry, _events) = create_registry(&adapter, Duration::from_millis(500));
    let identity = create_test_identity("10.0.0.1");

    let logins = (0..5).map(|_| registry.login(&identity));
    let handles: Vec<_> = futures::future::join_all(logins)
        .await
        .into_iter()
        .map(|result| result.expect("login"))
        .collect();

    assert!(handles.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(adapter.login_count("10.0.0.1"), 1);
    assert_eq!(registry.stats().sessions, 1);
}

#[tokio::test]
async fn test_login_failure_leaves_session_disconnected() {
    let adapter = Arc::new(MockAdapter::new());
    adapter.fail_login_for("10.0.0.2");
    let (registry, _events) = create_registry(&adapter, Duration::from_millis(500));
    let identity = create_test_identity("10.0.0.2");

    let result = registry.login(&identity).await;
    assert!(matches!(
        result,
        Err(RegistryError::LoginFailure {
            source: AdapterError::Unreachable(_),
            ..
        })
    ));

    let session = registry
        .session(&SessionKey::new("10.0.0.2", TEST_PORT))
        .expect("session should be tracked");
    assert_eq!(session.state(), ConnectionState::Disconnected);
    assert_eq!(session.consecutive_failures(), 1);
    assert!(session.handle().is_none());
    assert!(registry.list_connected_handles().is_empty());

    // Login is retried on the next call once the device is reachable
    adapter.clear_login_failure("10.0.0.2");
    let handle = registry.login(&identity).await.expect("second login");
    let session = registry.session(&identity.key()).unwrap();
    assert_eq!(session.handle(), Some(handle));
    assert_eq!(session.consecutive_failures(), 0);
    assert_eq!(adapter.login_count("10.0.0.2"), 2);
}

#[tokio::test]
async fn test_login_times_out() {
    let adapter = Arc::new(MockAdapter::new());
    adapter.set_login_delay(Duration::from_secs(5));
    let (registry, _events) = create_registry(&adapter, Duration::from_millis(50));

    let result = registry.login(&create_test_identity("10.0.0.3")).await;

    assert!(matches!(
        result,
        Err(RegistryError::LoginFailure {
            source: AdapterError::Timeout { .. },
            ..
        })
    ));
    assert_eq!(registry.stats().login_failures, 1);
}

#[tokio::test]
async fn test_list_connected_handles_is_sorted_and_excludes_failures() {
    let adapter = Arc::new(MockAdapter::new());
    adapter.fail_login_for("10.0.0.2");
    let (registry, _events) = create_registry(&adapter, Duration::from_millis(500));

    let a = registry.login(&create_test_identity("10.0.0.1")).await.unwrap();
    let _ = registry.login(&create_test_identity("10.0.0.2")).await;
    let c = registry.login(&create_test_identity("10.0.0.3")).await.unwrap();

    assert_eq!(registry.list_connected_handles(), vec![a, c]);

    // A reconnecting device is not handed to background jobs
    adapter.simulate_disconnect(a);
    assert_eq!(registry.list_connected_handles(), vec![c]);
}

#[tokio::test]
async fn test_disconnect_and_reconnect_transitions() {
    let adapter = Arc::new(MockAdapter::new());
    let (registry, mut events) = create_registry(&adapter, Duration::from_millis(500));
    let handle = registry.login(&create_test_identity("10.0.0.1")).await.unwrap();

    adapter.simulate_disconnect(handle);
    assert_eq!(registry.state_of(handle), Some(ConnectionState::Reconnecting));
    assert_eq!(events.recv().await, Some(ConnectionEvent::Disconnected(handle)));

    adapter.simulate_reconnect(handle);
    assert_eq!(registry.state_of(handle), Some(ConnectionState::Connected));
    assert_eq!(events.recv().await, Some(ConnectionEvent::Reconnected(handle)));

    let stats = registry.stats();
    assert_eq!(stats.disconnects, 1);
    assert_eq!(stats.reconnects, 1);
}

#[tokio::test]
async fn test_reconnect_while_connected_is_ignored() {
    let adapter = Arc::new(MockAdapter::new());
    let (registry, mut events) = create_registry(&adapter, Duration::from_millis(500));
    let handle = registry.login(&create_test_identity("10.0.0.1")).await.unwrap();

    adapter.simulate_reconnect(handle);

    assert_eq!(registry.state_of(handle), Some(ConnectionState::Connected));
    assert!(events.try_recv().is_err());
    assert_eq!(registry.stats().reconnects, 0);
}

#[tokio::test]
async fn test_callbacks_for_unknown_handles_are_ignored() {
    let adapter = Arc::new(MockAdapter::new());
    let (registry, mut events) = create_registry(&adapter, Duration::from_millis(500));
    let handle = registry.login(&create_test_identity("10.0.0.1")).await.unwrap();

    adapter.simulate_disconnect(device_stream::DeviceHandle::new(42));
    adapter.simulate_reconnect(device_stream::DeviceHandle::new(42));

    assert_eq!(registry.state_of(handle), Some(ConnectionState::Connected));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_logout_all_releases_every_handle() {
    let adapter = Arc::new(MockAdapter::new());
    let (registry, _events) = create_registry(&adapter, Duration::from_millis(500));
    let a = registry.login(&create_test_identity("10.0.0.1")).await.unwrap();
    let b = registry.login(&create_test_identity("10.0.0.2")).await.unwrap();

    registry.logout_all().await;

    let mut logouts = adapter.logouts();
    logouts.sort();
    assert_eq!(logouts, vec![a, b]);
    assert!(registry.list_connected_handles().is_empty());
    assert!(registry
        .sessions()
        .iter()
        .all(|session| session.state() == ConnectionState::Disconnected && session.handle().is_none()));

    // Logging in again creates a fresh connection
    let again = registry.login(&create_test_identity("10.0.0.1")).await.unwrap();
    assert_ne!(again, a);
}

#[tokio::test]
async fn test_logout_during_login_aborts_it() {
    let adapter = Arc::new(MockAdapter::new());
    adapter.set_login_delay(Duration::from_millis(200));
    let (registry, _events) = create_registry(&adapter, Duration::from_secs(2));
    let identity = create_test_identity("10.0.0.1");

    let login = {
        let registry = Arc::clone(&registry);
        let identity = identity.clone();
        tokio::spawn(async move { registry.login(&identity).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    registry.logout_all().await;

    let result = login.await.expect("login task panicked");
    assert!(matches!(result, Err(RegistryError::LoginAborted(_))));

    // The handle the adapter produced after the logout is released again
    assert_eq!(adapter.logouts().len(), 1);
    assert!(registry.list_connected_handles().is_empty());
}

#[tokio::test]
async fn test_deregister() {
    let adapter = Arc::new(MockAdapter::new());
    let (registry, _events) = create_registry(&adapter, Duration::from_millis(500));
    let identity = create_test_identity("10.0.0.1");
    let handle = registry.login(&identity).await.unwrap();

    let removed = registry.deregister(&identity.key()).await.expect("deregister");
    assert_eq!(removed, Some(handle));
    assert!(registry.session(&identity.key()).is_none());
    assert!(registry.key_for(handle).is_none());
    assert_eq!(adapter.logouts(), vec![handle]);

    let missing = registry.deregister(&identity.key()).await;
    assert!(matches!(missing, Err(RegistryError::UnknownSession(_))));
}

#[tokio::test]
async fn test_deregister_during_login_keeps_one_session() {
    let adapter = Arc::new(MockAdapter::new());
    adapter.set_login_delay(Duration::from_millis(200));
    let (registry, mut events) = create_registry(&adapter, Duration::from_secs(2));
    let identity = create_test_identity("10.0.0.1");

    let stale = {
        let registry = Arc::clone(&registry);
        let identity = identity.clone();
        tokio::spawn(async move { registry.login(&identity).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    let removed = registry.deregister(&identity.key()).await.expect("deregister");
    assert_eq!(removed, None);

    let fresh = registry.login(&identity).await.expect("second login");
    let result = stale.await.expect("login task panicked");
    assert!(matches!(result, Err(RegistryError::LoginAborted(_))));

    // The first connection is released and no longer tracked
    assert_eq!(adapter.total_logins(), 2);
    let logouts = adapter.logouts();
    assert_eq!(logouts.len(), 1);
    assert_ne!(logouts[0], fresh);
    assert!(registry.key_for(logouts[0]).is_none());
    assert_eq!(registry.list_connected_handles(), vec![fresh]);

    // A disconnect on the released handle does not touch the live session
    adapter.simulate_disconnect(logouts[0]);
    assert_eq!(registry.state_of(fresh), Some(ConnectionState::Connected));
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_login_with_retry_gives_up_after_max_attempts() {
    let adapter = Arc::new(MockAdapter::new());
    adapter.fail_login_for("10.0.0.9");
    let (registry, _events) = create_registry(&adapter, Duration::from_millis(500));
    let policy = LoginRetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
    };

    let result = registry
        .login_with_retry(&create_test_identity("10.0.0.9"), &policy)
        .await;

    assert!(matches!(result, Err(RegistryError::LoginFailure { .. })));
    assert_eq!(adapter.login_count("10.0.0.9"), 3);
}
