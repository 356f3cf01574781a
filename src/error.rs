//! Error taxonomy shared by the storage, sync, embedding, and query layers.
//!
//! | Variant | Raised when | Handling |
//! |---------|-------------|----------|
//! | [`Error::Validation`] | Unknown source/account, malformed record | Raised before any work |
//! | [`Error::TransientProvider`] | Network failure, HTTP 429/5xx | Retried with backoff |
//! | [`Error::Provider`] | Non-retryable provider response | Fails the call |
//! | [`Error::RetriesExhausted`] | Retry budget spent | Propagates to the caller |
//! | [`Error::TokenExpired`] | Source rejects the stored sync cursor | Delta sync falls back to full |
//! | [`Error::Storage`] | SQLite failure | The call's transaction is rolled back |
//!
//! Lookup misses are not errors: they are `Ok(None)` / `false`.

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("validation error: {0}")]
    Validation(String),

    #[error("transient provider error: {0}")]
    TransientProvider(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("gave up after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },

    #[error("sync token expired for {source_name}/{account}")]
    TokenExpired {
        source_name: String,
        account: String,
    },

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Validation(msg.into())
    }

    pub fn token_expired(source: &str, account: &str) -> Self {
        Error::TokenExpired {
            source_name: source.to_string(),
            account: account.to_string(),
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::TransientProvider(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // Connection resets, timeouts and DNS failures are all worth another try.
        Error::TransientProvider(err.to_string())
    }
}
