//! Crate-wide error taxonomy.
//!
//! Every failure that escapes the token manager or the resilient client is a
//! typed variant callers can branch on. Provider payloads are summarized, not
//! forwarded; raw secrets never appear in error messages.

use std::sync::Arc;

use crate::client::classify::FaultKind;

/// Errors produced by the token lifecycle and resilient client.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Encryption of a secret failed. Fatal to the operation, never retried.
    #[error("encryption failed: {0}")]
    Encryption(String),

    /// Decryption failed: wrong key, corrupted ciphertext, or tampered auth tag.
    #[error("decryption failed: wrong key or tampered data")]
    Decryption,

    /// Token rejected by shape validation before it ever reached the cipher.
    #[error("invalid token format: {0}")]
    InvalidTokenFormat(String),

    /// Underlying persistence failure (SQLite).
    #[error("token storage error: {0}")]
    Storage(String),

    /// Token refresh exhausted its retries.
    #[error("token refresh failed for {provider}/{tenant_id}: {cause}")]
    RefreshFailed {
        provider: String,
        tenant_id: String,
        cause: String,
    },

    /// The circuit breaker is OPEN for this provider/tenant; no network call
    /// was made.
    #[error("circuit breaker open for {provider}/{tenant_id}")]
    CircuitOpen { provider: String, tenant_id: String },

    /// A request failed authentication even after one forced refresh and replay.
    #[error("authentication failed after token refresh (status {status})")]
    Authentication { status: u16 },

    /// No stored tokens exist for the requested provider/tenant.
    #[error("no tokens stored for {provider}/{tenant_id}")]
    NoTokens { provider: String, tenant_id: String },

    /// No refresh config was registered for this provider/tenant.
    #[error("no refresh config registered for {provider}/{tenant_id}")]
    NotConfigured { provider: String, tenant_id: String },

    /// The bounded rate-limit wait was exceeded.
    #[error("rate limit wait exceeded")]
    RateLimitExceeded,

    /// Operation issued after `TokenManager::shutdown()`.
    #[error("token manager is shut down")]
    ManagerShutdown,

    /// Transport-level failure (connect, timeout, body read).
    #[error("transport error: {0}")]
    Transport(String),

    /// Non-auth provider error (4xx/5xx) after the retry policy gave up.
    #[error("provider returned {status}: {kind:?}")]
    Provider { status: u16, kind: FaultKind },

    /// A concurrent caller's shared operation failed; carries the settled error.
    #[error("{0}")]
    Shared(#[from] Arc<Error>),
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // reqwest errors can embed URLs with query strings; keep the message,
        // the URL never contains secrets on our call paths (bearer is a header).
        Error::Transport(err.to_string())
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
