//! Connection leasing.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::{Result, StoreError};

/// Default number of pooled connections.
pub const DEFAULT_POOL_SIZE: usize = 16;

/// Default time to wait for a free connection.
pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);

/// A fixed set of connection leases.
///
/// Each logical operation holds one lease for its duration and releases it on
/// drop; a lease is never held across unrelated requests.
#[derive(Debug, Clone)]
pub struct ConnectionPool {
    permits: Arc<Semaphore>,
    size: usize,
    acquire_timeout: Duration,
}

impl ConnectionPool {
    /// Creates a pool with `size` connections (at least one).
    #[must_use]
    pub fn new(size: usize, acquire_timeout: Duration) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
            acquire_timeout,
        }
    }

    /// Leases a connection slot.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Connectivity`] if no slot frees up within the
    /// acquire timeout.
    pub async fn lease(&self) -> Result<OwnedSemaphorePermit> {
        let acquire = Arc::clone(&self.permits).acquire_owned();
        match tokio::time::timeout(self.acquire_timeout, acquire).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_closed)) => Err(StoreError::Connectivity {
                message: "connection pool is closed".to_string(),
            }),
            Err(_elapsed) => Err(StoreError::Connectivity {
                message: format!(
                    "timed out after {}ms waiting for a pooled connection",
                    self.acquire_timeout.as_millis()
                ),
            }),
        }
    }

    /// Returns the configured pool size.
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Returns the number of connections currently free.
    #[must_use]
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(DEFAULT_POOL_SIZE, DEFAULT_ACQUIRE_TIMEOUT)
    }
}
