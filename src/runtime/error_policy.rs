//! # Error Policy
//!
//! Classification and backoff for watch stream errors.

use crate::observability::metrics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{error, warn};

/// Kind of a watch stream failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchErrorClass {
    /// 401/403: RBAC revoked or token expired
    Unauthorized,
    /// 410: resource version expired
    Expired,
    /// 429: API server storage reinitializing
    TooManyRequests,
    /// 404: CRD missing or resource deleted
    NotFound,
    Other,
}

impl WatchErrorClass {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            WatchErrorClass::Unauthorized => "unauthorized",
            WatchErrorClass::Expired => "expired",
            WatchErrorClass::TooManyRequests => "too_many_requests",
            WatchErrorClass::NotFound => "not_found",
            WatchErrorClass::Other => "other",
        }
    }
}

/// Classify a watch error from its debug representation
///
/// 404 is checked first: a plain-text 404 body surfaces as a decode error whose
/// chain also mentions the failed watch.
#[must_use]
pub fn classify(error_string: &str) -> WatchErrorClass {
    let is_not_found = error_string.contains("ObjectNotFound")
        || error_string.contains("404")
        || error_string.contains("not found");
    if is_not_found {
        return WatchErrorClass::NotFound;
    }
    if error_string.contains("401")
        || error_string.contains("403")
        || error_string.contains("Unauthorized")
        || error_string.contains("Forbidden")
    {
        return WatchErrorClass::Unauthorized;
    }
    if error_string.contains("410")
        || error_string.contains("too old resource version")
        || error_string.contains("Expired")
        || error_string.contains("Gone")
    {
        return WatchErrorClass::Expired;
    }
    if error_string.contains("429")
        || error_string.contains("storage is (re)initializing")
        || error_string.contains("TooManyRequests")
    {
        return WatchErrorClass::TooManyRequests;
    }
    WatchErrorClass::Other
}

/// Handle one watch stream error
///
/// Returns `true` when the watch should be restarted, `false` to keep
/// consuming the current stream.
pub async fn handle_watch_stream_error(
    resource: &str,
    error_string: &str,
    backoff_ms: &AtomicU64,
    max_backoff_ms: u64,
    restart_delay: Duration,
) -> bool {
    let class = classify(error_string);
    match class {
        WatchErrorClass::Unauthorized => {
            error!(
                resource,
                error = %error_string,
                "❌ Watch authentication failed, RBAC may have been revoked or the token expired"
            );
            error!(
                resource,
                "Check the controller ServiceAccount, ClusterRole and ClusterRoleBinding"
            );
            warn!(
                resource,
                delay_secs = restart_delay.as_secs(),
                "Waiting before retrying watch"
            );
            tokio::time::sleep(restart_delay).await;
        }
        WatchErrorClass::Expired => {
            warn!(
                resource,
                "Watch resource version expired (410), watch will restart"
            );
        }
        WatchErrorClass::TooManyRequests => {
            let current = backoff_ms.load(Ordering::Relaxed);
            warn!(
                resource,
                backoff_ms = current,
                "API server storage reinitializing (429), backing off before restart"
            );
            tokio::time::sleep(Duration::from_millis(current)).await;
            backoff_ms.store(current.saturating_mul(2).min(max_backoff_ms), Ordering::Relaxed);
        }
        WatchErrorClass::NotFound => {
            warn!(
                resource,
                error = %error_string,
                "Watched resource not found (404), the CRD may not be installed"
            );
            return false;
        }
        WatchErrorClass::Other => {
            error!(resource, error = %error_string, "Watch stream error");
            tokio::time::sleep(restart_delay).await;
        }
    }

    metrics::increment_watch_restarts(resource);
    true
}
