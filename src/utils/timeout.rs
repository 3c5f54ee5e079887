//! Timeout defaults and async timeout wrappers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Default timeout for connect attempts and liveness probes
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default send-idle time after which a keep-alive frame is written
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Default time allowed for a graceful server shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimum time between two automatic connect attempts of a client channel
pub const CONNECT_COOLDOWN: Duration = Duration::from_millis(500);

/// Run a future with a timeout, mapping expiry to [`ProtocolError::Timeout`].
pub async fn with_timeout_error<F, T>(future: F, timeout: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}

/// Run a future with a timeout, returning `None` on expiry.
pub async fn with_timeout<F, T>(future: F, timeout: Duration) -> Option<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await.ok()
}
