//! Error types shared by the dispatch client and compute-service adapters.

use thiserror::Error;

/// Errors surfaced synchronously by dispatch-time operations.
///
/// Stream-level failures never use this type; they travel on a request's
/// `errors` channel as the service's own error type.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The connection to the compute service could not be established
    #[error("Failed to connect to {addr}: {reason}")]
    Connection {
        /// Address that was dialed
        addr: String,
        /// Underlying failure
        reason: String,
    },

    /// The remote call could not be started; nothing was registered
    #[error("Failed to initiate request: {0}")]
    Initiation(String),

    /// The client has been closed and accepts no new requests
    #[error("Dispatch client is closed")]
    Closed,
}

/// Stream-level error emitted by the compute service while a request runs.
///
/// These are forwarded to every observer and never end the stream on their
/// own.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ComputeError {
    /// The service is temporarily unable to make progress
    #[error("Compute service unavailable: {0}")]
    Unavailable(String),

    /// The service refused part of the request
    #[error("Request rejected by compute service: {0}")]
    Rejected(String),

    /// A single update in the stream failed
    #[error("Stream error: {0}")]
    Stream(String),
}

impl From<DispatchError> for ComputeError {
    fn from(error: DispatchError) -> Self {
        match error {
            DispatchError::Initiation(reason) => Self::Rejected(reason),
            other => Self::Unavailable(other.to_string()),
        }
    }
}
