//! Process-wide pool of broker sessions

use crate::{BusError, BusResult, EventBus};
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Shared set of broker sessions
///
/// At most one flush per session is in flight: `acquire` waits for a permit
/// and hands out a guard that releases it on drop, whichever way the flush
/// ends.
pub struct ConnectionPool {
    connections: Vec<Arc<dyn EventBus>>,
    permits: Arc<Semaphore>,
    next: AtomicUsize,
}

/// A session checked out of the pool
pub struct PooledConnection {
    bus: Arc<dyn EventBus>,
    _permit: OwnedSemaphorePermit,
}

impl Deref for PooledConnection {
    type Target = dyn EventBus;

    fn deref(&self) -> &Self::Target {
        self.bus.as_ref()
    }
}

impl ConnectionPool {
    pub fn new(connections: Vec<Arc<dyn EventBus>>) -> BusResult<Self> {
        if connections.is_empty() {
            return Err(BusError::InvalidConfig(
                "connection pool needs at least one connection".to_string(),
            ));
        }

        Ok(Self {
            permits: Arc::new(Semaphore::new(connections.len())),
            connections,
            next: AtomicUsize::new(0),
        })
    }

    /// Check out a session, preferring connected ones in round-robin order
    pub async fn acquire(&self) -> BusResult<PooledConnection> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BusError::InternalError("connection pool closed".to_string()))?;

        let len = self.connections.len();
        let start = self.next.fetch_add(1, Ordering::Relaxed) % len;
        let bus = (0..len)
            .map(|i| &self.connections[(start + i) % len])
            .find(|bus| bus.is_connected())
            .unwrap_or(&self.connections[start])
            .clone();

        Ok(PooledConnection {
            bus,
            _permit: permit,
        })
    }

    pub fn size(&self) -> usize {
        self.connections.len()
    }

    /// Permits not currently checked out
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// Every session reports a live broker connection
    pub fn is_healthy(&self) -> bool {
        self.connections.iter().all(|bus| bus.is_connected())
    }
}
