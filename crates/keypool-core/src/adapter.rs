use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use crate::key::KeySecret;
use crate::outcome::{CallOutcome, ErrorClass};
use crate::profile::FailureRules;
use crate::service::ServiceKind;

/// Provider-agnostic request handed to a service adapter.
#[derive(Debug, Clone, PartialEq)]
pub struct AdapterRequest {
    pub endpoint: String,
    pub payload: Option<serde_json::Value>,
    pub timeout: Duration,
}

impl AdapterRequest {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.into(),
            payload: None,
            timeout,
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

/// Normalized provider response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterResponse {
    pub status: u16,
    pub body: String,
}

/// Adapter-level error, already classified against the service's failure
/// rules so the core never inspects provider payloads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedError {
    class: ErrorClass,
    message: String,
    status: Option<u16>,
}

impl ClassifiedError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
            status: None,
        }
    }

    /// Classify a non-success HTTP status using the profile's rules.
    pub fn from_status(rules: &FailureRules, status: u16, message: impl Into<String>) -> Self {
        Self {
            class: rules.classify_status(status),
            message: message.into(),
            status: Some(status),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Transient, message)
    }

    pub const fn class(&self) -> ErrorClass {
        self.class
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub const fn status(&self) -> Option<u16> {
        self.status
    }

    /// The outcome to report back to the pool for this error. A statusful
    /// error came from the provider and consumed quota; a status-less one
    /// never left the process.
    pub const fn to_outcome(&self) -> CallOutcome {
        CallOutcome::Failure {
            class: self.class,
            reached_provider: self.status.is_some(),
            latency_ms: None,
        }
    }
}

impl Display for ClassifiedError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.class.as_str())
    }
}

impl std::error::Error for ClassifiedError {}

type AdapterFuture<'a> =
    Pin<Box<dyn Future<Output = Result<AdapterResponse, ClassifiedError>> + Send + 'a>>;

/// Capability contract for the per-provider HTTP integrations, which live
/// outside this crate. The pool hands the selected secret to `execute` and
/// consumes only the classified result.
pub trait ServiceAdapter: Send + Sync {
    fn service(&self) -> ServiceKind;

    fn execute<'a>(&'a self, secret: &'a KeySecret, request: AdapterRequest) -> AdapterFuture<'a>;
}

/// Adapter with no transport; every call fails as a local transient error.
#[derive(Debug, Clone, Copy)]
pub struct NoopAdapter {
    service: ServiceKind,
}

impl NoopAdapter {
    pub const fn new(service: ServiceKind) -> Self {
        Self { service }
    }
}

impl ServiceAdapter for NoopAdapter {
    fn service(&self) -> ServiceKind {
        self.service
    }

    fn execute<'a>(&'a self, _secret: &'a KeySecret, _request: AdapterRequest) -> AdapterFuture<'a> {
        Box::pin(async {
            Err(ClassifiedError::transient(
                "no adapter transport configured",
            ))
        })
    }
}
