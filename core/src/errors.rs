//! Error types for guarded resource calls

use std::error::Error as StdError;
use thiserror::Error;

/// Errors a resource call can resolve with
///
/// The breaker itself only ever produces `ServiceUnavailable`, when a call is
/// short-circuited. Every other variant comes from the underlying provider and
/// is passed through untouched.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Response is missing or could not be interpreted
    #[error("bad response")]
    BadResponse,
    /// Response carried no payload
    #[error("no data received")]
    NoData,
    /// Non-2xx status code received
    #[error("bad status: {status}")]
    BadStatus { status: u16 },
    /// Circuit is open, the call was not attempted
    #[error("service unavailable")]
    ServiceUnavailable,
    /// Any other transport error
    #[error("{0}")]
    Other(#[source] Box<dyn StdError + Send + Sync>),
}

impl ResourceError {
    /// Wrap an arbitrary transport error
    pub fn other(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        ResourceError::Other(error.into())
    }

    /// Whether this error was synthesized by an open circuit
    pub fn is_service_unavailable(&self) -> bool {
        matches!(self, ResourceError::ServiceUnavailable)
    }
}
