use crate::registry::{ConnectionId, ConnectionRegistry, DeliveryError};
use crate::state::SatelliteState;
use futures::future::join_all;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum BroadcastError {
    #[error("failed to serialize state: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Outcome of one fan-out.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    pub attempted: usize,
    pub delivered: usize,
    pub evicted: Vec<ConnectionId>,
    pub payload_bytes: usize,
}

/// Delivers one serialized snapshot to every registered observer.
#[derive(Debug)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    send_timeout: Duration,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn send_timeout(&self) -> Duration {
        self.send_timeout
    }

    /// Serialize `state` once and deliver it to a snapshot of the registry.
    ///
    /// Deliveries run concurrently. A member whose delivery fails (a panic in
    /// `send` counts as a failure) or exceeds the send timeout is evicted and closed immediately; the failure never
    /// reaches the caller or the other members. Returns once every delivery
    /// has resolved.
    pub async fn broadcast(&self, state: &SatelliteState) -> Result<BroadcastReport, BroadcastError> {
        let payload: Arc<str> = Arc::from(state.to_payload()?);
        Ok(self.broadcast_payload(payload).await)
    }

    pub async fn broadcast_payload(&self, payload: Arc<str>) -> BroadcastReport {
        let members = self.registry.snapshot();
        let attempted = members.len();

        let deliveries = members.into_iter().map(|(id, connection)| {
            let payload = Arc::clone(&payload);
            async move {
                let send = AssertUnwindSafe(connection.send(&payload)).catch_unwind();
                let result = match tokio::time::timeout(self.send_timeout, send).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(caught)) => Err(DeliveryError::Panicked(panic_message(caught.as_ref()))),
                    Err(_) => Err(DeliveryError::Timeout(self.send_timeout)),
                };

                match result {
                    Ok(()) => None,
                    Err(e) => {
                        warn!("Failed to send state to {} ({}): {}. Removing.", connection.peer(), id, e);
                        self.registry.disconnect(id).await;
                        Some(id)
                    }
                }
            }
        });

        let evicted: Vec<ConnectionId> = join_all(deliveries).await.into_iter().flatten().collect();
        let report = BroadcastReport {
            attempted,
            delivered: attempted - evicted.len(),
            evicted,
            payload_bytes: payload.len(),
        };
        debug!(
            "Broadcast {} bytes to {}/{} clients",
            report.payload_bytes, report.delivered, report.attempted
        );
        report
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}
