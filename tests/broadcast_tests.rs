mod common;

use async_trait::async_trait;
use common::*;
use cvt::broadcast::Broadcaster;
use cvt::registry::{Connection, ConnectionId, ConnectionRegistry, DeliveryError};
use cvt::state::{Alert, SatelliteState};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn sample_state() -> SatelliteState {
    let mut state = SatelliteState::new(epoch());
    state.set_orbit([6771.0, 12.5, -3.0], [0.0, 7.67, 0.1]);
    state.push_alert(Alert::warning("PowerSubsystem", "battery below 30%"));
    state
}

#[tokio::test]
async fn test_failing_member_is_evicted_and_others_get_identical_payloads() {
    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Broadcaster::new(Arc::clone(&registry), SEND_TIMEOUT);

    let mut receivers = Vec::new();
    for n in 0..5 {
        let (connection, rx) = RecordingConnection::new(&format!("observer-{}", n));
        registry.add(Arc::new(connection));
        receivers.push(rx);
    }
    let failing = Arc::new(FailingConnection::default());
    let failing_id = registry.add(failing.clone());

    let state = sample_state();
    let report = broadcaster.broadcast(&state).await.unwrap();

    assert_eq!(report.attempted, 6);
    assert_eq!(report.delivered, 5);
    assert_eq!(report.evicted, vec![failing_id]);
    assert!(!registry.contains(failing_id));
    assert_eq!(registry.len(), 5);
    assert_eq!(failing.close_calls.load(Ordering::SeqCst), 1);

    let expected = state.to_payload().unwrap();
    assert_eq!(report.payload_bytes, expected.len());
    for rx in &mut receivers {
        assert_eq!(rx.try_recv().unwrap(), expected);
        assert!(rx.try_recv().is_err());
    }
}

#[tokio::test(start_paused = true)]
async fn test_stalled_member_is_evicted_after_send_timeout() {
    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Broadcaster::new(Arc::clone(&registry), Duration::from_millis(200));

    let (healthy, mut rx) = RecordingConnection::new("healthy");
    let healthy_id = registry.add(Arc::new(healthy));
    let stalled = Arc::new(StalledConnection::default());
    let stalled_id = registry.add(stalled.clone());

    let started = tokio::time::Instant::now();
    let report = broadcaster.broadcast(&sample_state()).await.unwrap();

    let waited = started.elapsed();
    assert!(waited >= Duration::from_millis(200) && waited < Duration::from_millis(300));
    assert_eq!(report.evicted, vec![stalled_id]);
    assert!(registry.contains(healthy_id));
    assert!(!registry.contains(stalled_id));
    assert_eq!(stalled.close_calls.load(Ordering::SeqCst), 1);
    assert!(rx.try_recv().is_ok());
}

#[tokio::test]
async fn test_empty_registry_is_a_no_op() {
    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Broadcaster::new(Arc::clone(&registry), SEND_TIMEOUT);

    let report = broadcaster.broadcast(&sample_state()).await.unwrap();
    assert_eq!(report.attempted, 0);
    assert_eq!(report.delivered, 0);
    assert!(report.evicted.is_empty());
}

/// Tears itself out of the registry mid-send, the way a transport does when
/// its peer hangs up, and then reports the failure.
struct SelfRemovingConnection {
    registry: Arc<ConnectionRegistry>,
    id: Mutex<Option<ConnectionId>>,
}

#[async_trait]
impl Connection for SelfRemovingConnection {
    async fn send(&self, _payload: &str) -> Result<(), DeliveryError> {
        if let Some(id) = *self.id.lock().unwrap() {
            self.registry.remove(id);
        }
        Err(DeliveryError::Closed)
    }

    async fn close(&self) {}

    fn peer(&self) -> String {
        "self-removing".to_owned()
    }
}

#[tokio::test]
async fn test_member_removed_during_delivery_is_handled() {
    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Broadcaster::new(Arc::clone(&registry), SEND_TIMEOUT);

    let (healthy, mut rx) = RecordingConnection::new("healthy");
    registry.add(Arc::new(healthy));
    let leaving = Arc::new(SelfRemovingConnection {
        registry: Arc::clone(&registry),
        id: Mutex::new(None),
    });
    let leaving_id = registry.add(leaving.clone());
    *leaving.id.lock().unwrap() = Some(leaving_id);

    let report = broadcaster.broadcast(&sample_state()).await.unwrap();

    assert_eq!(report.evicted, vec![leaving_id]);
    assert_eq!(registry.len(), 1);
    assert!(rx.try_recv().is_ok());
}

#[tokio::test]
async fn test_consecutive_broadcasts_skip_evicted_members() {
    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Broadcaster::new(Arc::clone(&registry), SEND_TIMEOUT);

    let (healthy, mut rx) = RecordingConnection::new("healthy");
    registry.add(Arc::new(healthy));
    let failing = Arc::new(FailingConnection::default());
    registry.add(failing.clone());

    broadcaster.broadcast(&sample_state()).await.unwrap();
    let second = broadcaster.broadcast(&sample_state()).await.unwrap();

    assert_eq!(second.attempted, 1);
    assert_eq!(second.delivered, 1);
    assert_eq!(failing.send_calls.load(Ordering::SeqCst), 1);
    assert!(rx.try_recv().is_ok());
    assert!(rx.try_recv().is_ok());
}

#[tokio::test]
async fn test_panicking_member_is_evicted_like_a_failed_one() {
    let registry = Arc::new(ConnectionRegistry::new());
    let broadcaster = Broadcaster::new(Arc::clone(&registry), SEND_TIMEOUT);

    let (healthy, mut rx) = RecordingConnection::new("healthy");
    let healthy_id = registry.add(Arc::new(healthy));
    let panicking = Arc::new(PanickingConnection::default());
    let panicking_id = registry.add(panicking.clone());

    let report = broadcaster.broadcast(&sample_state()).await.unwrap();

    assert_eq!(report.attempted, 2);
    assert_eq!(report.delivered, 1);
    assert_eq!(report.evicted, vec![panicking_id]);
    assert!(registry.contains(healthy_id));
    assert_eq!(panicking.close_calls.load(Ordering::SeqCst), 1);
    assert!(rx.try_recv().is_ok());
}
