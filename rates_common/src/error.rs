//! Error types shared by the rates workspace.
//!
//! The `RatesError` enum unifies provider failures, payload parsing problems,
//! configuration mistakes and the internal plumbing errors (I/O, channels,
//! poisoned locks), allowing every layer to propagate a single error type.
use std::io;
use std::sync::{Arc, PoisonError};

use thiserror::Error;

/// Unified error type shared by the library and the server.
#[derive(Error, Debug)]
pub enum RatesError {
    /// Network failure or non-success HTTP status reported by a market-data provider.
    #[error("Provider error: {provider} - {message}")]
    Provider {
        /// Provider that failed (e.g. `MOEX`).
        provider: String,
        /// Human-readable description of the failure.
        message: String,
    },

    /// The request to a provider exceeded its connect or read timeout.
    #[error("Timeout: {provider}")]
    Timeout {
        /// Provider that timed out.
        provider: String,
    },

    /// Malformed payload: invalid JSON shape, column/row mismatch or a missing field.
    #[error("Parse error: {0}")]
    Parse(String),

    /// Invalid startup configuration (time of day, timezone, period, pair catalogue).
    #[error("Config error: {0}")]
    Config(String),

    /// A refresh cycle failed and no usable quote set could be served.
    #[error("Quotes temporarily unavailable: {0}")]
    QuotesUnavailable(Arc<RatesError>),

    /// Failure while decoding JSON via serde_json.
    #[error("JSON serialization/deserialization error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// I/O error originating from the standard library.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error indicating a poisoned mutex/lock was encountered.
    #[error("Mutex Lock Poisoned: {0}")]
    MutexLock(String),
}

impl RatesError {
    /// Shorthand for a [`RatesError::Provider`] error.
    pub fn provider(provider: impl Into<String>, message: impl Into<String>) -> Self {
        RatesError::Provider {
            provider: provider.into(),
            message: message.into(),
        }
    }

    /// True for network, timeout and HTTP status failures.
    pub fn is_provider_error(&self) -> bool {
        match self {
            RatesError::Provider { .. } | RatesError::Timeout { .. } => true,
            RatesError::QuotesUnavailable(cause) => cause.is_provider_error(),
            _ => false,
        }
    }

    /// True for malformed or incomplete provider payloads.
    pub fn is_parse_error(&self) -> bool {
        match self {
            RatesError::Parse(_) | RatesError::SerdeJson(_) => true,
            RatesError::QuotesUnavailable(cause) => cause.is_parse_error(),
            _ => false,
        }
    }
}

impl<T> From<PoisonError<T>> for RatesError {
    fn from(err: PoisonError<T>) -> Self {
        RatesError::MutexLock(err.to_string())
    }
}
