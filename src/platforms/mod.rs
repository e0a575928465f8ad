//! Upstream platform API clients.

pub mod twitch;
pub mod twitter;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use reqwest::StatusCode;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::error::PlatformError;

/// Used when a 429 comes back without a usable reset header.
const DEFAULT_RATE_LIMIT_RESET: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountInfo {
    pub external_id: String,
    pub display_name: String,
}

/// Resolves a user-supplied handle to the platform's stable id.
#[async_trait]
pub trait AccountLookup: Send + Sync {
    async fn lookup_account(&self, handle: &str) -> Result<AccountInfo, PlatformError>;
}

/// Enforces a minimum gap between consecutive calls to one platform.
#[derive(Debug)]
pub struct CallSpacer {
    delay: Duration,
    last_call: Mutex<Option<Instant>>,
}

impl CallSpacer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            last_call: Mutex::new(None),
        }
    }

    /// Waits until the next call is allowed. Callers queue behind each other.
    pub async fn wait(&self) {
        let mut last_call = self.last_call.lock().await;
        if let Some(previous) = *last_call {
            let ready_at = previous + self.delay;
            if ready_at > Instant::now() {
                trace!("spacing platform call by {:?}", ready_at - Instant::now());
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last_call = Some(Instant::now());
    }
}

/// Reads an epoch-seconds reset header into a wait duration.
pub fn rate_limit_reset(headers: &HeaderMap, header: &str, now_epoch: i64) -> Duration {
    headers
        .get(header)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok())
        .map(|reset| Duration::from_secs((reset - now_epoch).max(1) as u64))
        .unwrap_or(DEFAULT_RATE_LIMIT_RESET)
}

/// Maps a non-success HTTP status to the platform error taxonomy.
pub fn classify_status(
    status: StatusCode,
    headers: &HeaderMap,
    reset_header: &str,
    now_epoch: i64,
) -> Option<PlatformError> {
    if status.is_success() {
        return None;
    }
    Some(match status {
        StatusCode::UNAUTHORIZED => PlatformError::Unauthorized,
        StatusCode::NOT_FOUND => PlatformError::NotFound,
        StatusCode::TOO_MANY_REQUESTS => PlatformError::RateLimited {
            reset_after: rate_limit_reset(headers, reset_header, now_epoch),
        },
        other => PlatformError::transient(format!("HTTP {}", other)),
    })
}
