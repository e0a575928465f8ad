use std::time::Duration;

use thiserror::Error;

/// Failure of a call to an upstream platform API (Twitch, Twitter).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// Network hiccup or 5xx. Retried next pass, never untracks anything.
    #[error("transient platform error: {0}")]
    Transient(String),

    /// The upstream account/channel no longer exists.
    #[error("upstream entity not found")]
    NotFound,

    /// Account-wide rate limit; the whole pass pauses for `reset_after`.
    #[error("rate limited, resets in {reset_after:?}")]
    RateLimited { reset_after: Duration },

    /// Our own credentials were rejected.
    #[error("unauthorized")]
    Unauthorized,

    /// Twitter rejected a `since_id` that is too old to query from.
    #[error("cursor is out of range")]
    StaleCursor,
}

impl PlatformError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }
}

impl From<reqwest::Error> for PlatformError {
    fn from(e: reqwest::Error) -> Self {
        Self::Transient(e.to_string())
    }
}

/// Failure of an outbound Discord call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("missing permissions (403)")]
    Forbidden,

    #[error("not found (404)")]
    NotFound,

    /// The bot token itself is failing; never treated as "channel gone".
    #[error("unauthorized (401)")]
    Unauthorized,

    #[error("transient discord error: {0}")]
    Transient(String),

    #[error("discord call timed out")]
    Timeout,
}

impl DeliveryError {
    /// Timeouts are handled exactly like transient failures.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_) | Self::Timeout)
    }
}

/// User-visible failure of a track/untrack request.
#[derive(Error, Debug)]
pub enum TrackError {
    #[error("'{0}' is not a valid identifier")]
    InvalidIdentifier(String),

    #[error("no account named '{0}' could be found")]
    UnknownAccount(String),

    #[error("{0} is already tracked in this channel")]
    AlreadyTracked(String),

    #[error("{0} is not tracked in this channel")]
    NotTracked(String),

    #[error("platform error: {0}")]
    Platform(PlatformError),

    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_counts_as_transient() {
        assert!(DeliveryError::Timeout.is_transient());
        assert!(DeliveryError::Transient("503".into()).is_transient());
        assert!(!DeliveryError::Forbidden.is_transient());
        assert!(!DeliveryError::NotFound.is_transient());
    }

    #[test]
    fn track_errors_read_well() {
        let e = TrackError::UnknownAccount("nobody".into());
        assert_eq!(e.to_string(), "no account named 'nobody' could be found");
    }
}
