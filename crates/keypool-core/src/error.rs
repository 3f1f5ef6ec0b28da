use thiserror::Error;

use crate::key::KeyId;
use crate::service::ServiceKind;
use crate::store::StoreError;

/// Top-level error type for pool operations.
///
/// Only `NoKeysConfigured` and `AllKeysExhausted` are expected to reach the
/// calling subsystem as user-visible failures; the remaining variants signal
/// configuration or administrative conditions the caller can act on.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("no keys configured for service '{service}'")]
    NoKeysConfigured { service: ServiceKind },

    #[error("all keys for service '{service}' are rate-limited or unhealthy")]
    AllKeysExhausted { service: ServiceKind },

    #[error("key '{id}' not found")]
    KeyNotFound { id: KeyId },

    #[error("key '{id}' is disabled and requires manual re-enable")]
    KeyDisabled { id: KeyId },

    #[error("invalid key: {reason}")]
    InvalidKey { reason: String },

    #[error("unknown service '{value}', expected one of openrouter, serpapi, jina, firecrawl, tavily, exa")]
    UnknownService { value: String },

    #[error("key store error: {0}")]
    Store(#[from] StoreError),
}
