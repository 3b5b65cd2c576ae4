//! The set of live observer connections.
//!
//! One mutex guards the whole member set. Every add, remove and
//! copy-for-iteration goes through it, and it is never held across an
//! `.await`, so delivery to one observer cannot block registration or
//! removal of another.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("transport error: {0}")]
    Io(#[from] io::Error),
    #[error("connection closed")]
    Closed,
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
    #[error("delivery panicked: {0}")]
    Panicked(String),
}

/// An outbound channel to one observer.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Deliver one payload. Implementations frame it for their transport.
    async fn send(&self, payload: &str) -> Result<(), DeliveryError>;

    /// Close the channel. Must tolerate being called more than once.
    async fn close(&self);

    /// Human-readable peer description for logs.
    fn peer(&self) -> String;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

pub type Member = (ConnectionId, Arc<dyn Connection>);

#[derive(Default)]
pub struct ConnectionRegistry {
    members: Mutex<HashMap<ConnectionId, Arc<dyn Connection>>>,
    next_id: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn members(&self) -> MutexGuard<'_, HashMap<ConnectionId, Arc<dyn Connection>>> {
        // The map is never left half-updated, so a poisoned lock is still usable.
        self.members.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a connection. Each call yields a fresh id, so registering the
    /// same channel twice produces two independent members.
    pub fn add(&self, connection: Arc<dyn Connection>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let peer = connection.peer();
        let total = {
            let mut members = self.members();
            members.insert(id, connection);
            members.len()
        };
        info!("New client connected: {} ({}). Total clients: {}", peer, id, total);
        id
    }

    /// Unregister a connection. Returns it if it was still a member.
    pub fn remove(&self, id: ConnectionId) -> Option<Arc<dyn Connection>> {
        let (removed, total) = {
            let mut members = self.members();
            let removed = members.remove(&id);
            (removed, members.len())
        };
        match &removed {
            Some(connection) => info!(
                "Client disconnected: {} ({}). Total clients: {}",
                connection.peer(),
                id,
                total
            ),
            None => debug!("Ignoring removal of unknown connection {}", id),
        }
        removed
    }

    /// Remove and close. Only the caller that actually removed the member
    /// closes it; repeated calls are no-ops.
    pub async fn disconnect(&self, id: ConnectionId) -> bool {
        match self.remove(id) {
            Some(connection) => {
                connection.close().await;
                true
            }
            None => false,
        }
    }

    /// Point-in-time copy of the members, safe to iterate without the lock.
    pub fn snapshot(&self) -> Vec<Member> {
        self.members()
            .iter()
            .map(|(id, connection)| (*id, Arc::clone(connection)))
            .collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.members().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.members().len()
    }

    pub fn is_empty(&self) -> bool {
        self.members().is_empty()
    }
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("members", &self.len())
            .finish()
    }
}
