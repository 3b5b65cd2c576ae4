#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use cvt::propagator::{PositionProvider, ProviderError, StateVector};
use cvt::registry::{Connection, DeliveryError};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;

pub fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 10, 26, 12, 0, 0).unwrap()
}

/// Forwards every payload to a channel the test reads from.
pub struct RecordingConnection {
    name: String,
    tx: mpsc::UnboundedSender<String>,
    closed: AtomicBool,
    pub close_calls: AtomicUsize,
}

impl RecordingConnection {
    pub fn new(name: &str) -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let connection = Self {
            name: name.to_owned(),
            tx,
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        };
        (connection, rx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for RecordingConnection {
    async fn send(&self, payload: &str) -> Result<(), DeliveryError> {
        if self.is_closed() {
            return Err(DeliveryError::Closed);
        }
        self.tx.send(payload.to_owned()).map_err(|_| DeliveryError::Closed)
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}

/// Every send fails as if the peer went away.
#[derive(Default)]
pub struct FailingConnection {
    pub send_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
}

#[async_trait]
impl Connection for FailingConnection {
    async fn send(&self, _payload: &str) -> Result<(), DeliveryError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        Err(DeliveryError::Io(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            "broken pipe",
        )))
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn peer(&self) -> String {
        "failing".to_owned()
    }
}

/// Never completes a send.
#[derive(Default)]
pub struct StalledConnection {
    pub close_calls: AtomicUsize,
}

#[async_trait]
impl Connection for StalledConnection {
    async fn send(&self, _payload: &str) -> Result<(), DeliveryError> {
        std::future::pending::<()>().await;
        Ok(())
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn peer(&self) -> String {
        "stalled".to_owned()
    }
}

/// Blocks inside `send` until released, recording payloads afterwards.
#[derive(Default)]
pub struct GatedConnection {
    pub entered: Notify,
    pub release: Notify,
    pub delivered: Mutex<Vec<String>>,
}

#[async_trait]
impl Connection for GatedConnection {
    async fn send(&self, payload: &str) -> Result<(), DeliveryError> {
        self.entered.notify_one();
        self.release.notified().await;
        self.delivered.lock().unwrap().push(payload.to_owned());
        Ok(())
    }

    async fn close(&self) {}

    fn peer(&self) -> String {
        "gated".to_owned()
    }
}

/// Returns `[n, 0, 0]` on the n-th call (1-based) and fails on chosen calls.
/// Records the tokio instant of every call.
#[derive(Default)]
pub struct ScriptedProvider {
    calls: AtomicU64,
    failing_calls: HashSet<u64>,
    pub call_instants: Mutex<Vec<Instant>>,
    pub call_times: Mutex<Vec<DateTime<Utc>>>,
}

impl ScriptedProvider {
    pub fn failing_on(calls: &[u64]) -> Self {
        Self {
            failing_calls: calls.iter().copied().collect(),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn instants(&self) -> Vec<Instant> {
        self.call_instants.lock().unwrap().clone()
    }
}

impl PositionProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "ScriptedProvider"
    }

    fn evaluate(&self, at: DateTime<Utc>) -> Result<StateVector, ProviderError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        self.call_instants.lock().unwrap().push(Instant::now());
        self.call_times.lock().unwrap().push(at);

        if self.failing_calls.contains(&call) {
            return Err(ProviderError::Unavailable(format!("injected failure on call {}", call)));
        }
        Ok(StateVector {
            position: [call as f64, 0.0, 0.0],
            velocity: [0.0, 7.5, 0.0],
        })
    }
}

pub const SEND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(1);

/// A testbed with a fixed start time so simulated timestamps are predictable.
pub fn testbed(
    provider: std::sync::Arc<dyn PositionProvider>,
    tick_rate_hz: f64,
    time_warp_factor: f64,
) -> cvt::Testbed {
    let config = cvt::KernelConfig::new(tick_rate_hz, time_warp_factor)
        .unwrap()
        .with_start_time(epoch());
    cvt::Testbed::new(config, provider, SEND_TIMEOUT)
}

/// Register a recording observer and hand back its payload stream.
pub fn observe(testbed: &cvt::Testbed) -> mpsc::UnboundedReceiver<String> {
    let (connection, rx) = RecordingConnection::new("observer");
    testbed.registry().add(std::sync::Arc::new(connection));
    rx
}

pub async fn next_state(rx: &mut mpsc::UnboundedReceiver<String>) -> cvt::SatelliteState {
    let payload = rx.recv().await.expect("observer channel closed");
    serde_json::from_str(&payload).expect("payload is not a satellite state")
}

/// Panics inside `send`, as a buggy transport might.
#[derive(Default)]
pub struct PanickingConnection {
    pub send_calls: AtomicUsize,
    pub close_calls: AtomicUsize,
}

#[async_trait]
impl Connection for PanickingConnection {
    async fn send(&self, _payload: &str) -> Result<(), DeliveryError> {
        self.send_calls.fetch_add(1, Ordering::SeqCst);
        panic!("transport buffer corrupted");
    }

    async fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
    }

    fn peer(&self) -> String {
        "panicking".to_owned()
    }
}
