//! # Solution Dispatch Core
//!
//! Core types for multiplexing long-running compute-service requests across
//! many observers.
//!
//! This crate holds the data model only; the dispatch client that owns the
//! service connection and runs the forwarding routines lives in
//! `solution-dispatch-runtime`.
//!
//! ## Core Concepts
//!
//! - **`RequestContext`**: one in-flight call, with an ordered event queue and a done signal
//! - **`RequestProducer`**: the half that feeds a context from the remote stream
//! - **`RequestDescriptor`**: value-equality fingerprint used to find duplicate requests
//! - **`ResultProxy`**: one observer's private view of a request's events
//! - **`ComputeService`**: the external service connection that starts calls
//!
//! ## Example
//!
//! ```ignore
//! use solution_dispatch_core::*;
//!
//! let (ctx, producer) = RequestContext::<SolutionStatus, ComputeError>::channel(
//!     search.request_hash(),
//!     64,
//! );
//!
//! // Pump the remote stream into the producer...
//! tokio::spawn(async move {
//!     while let Some(update) = remote.next().await {
//!         producer.send_result(update).await?;
//!     }
//!     producer.finish();
//! });
//!
//! // ...and hand the context to the dispatch client.
//! Ok(ctx)
//! ```

// Re-export commonly used types
pub use chrono::{DateTime, Utc};
pub use serde::{Deserialize, Serialize};

/// Request identity, fingerprints and the producer/consumer halves of a call
pub mod request;

/// Per-observer subscriptions to a running request
pub mod proxy;

/// Error types for dispatching and streaming
pub mod error;

/// Solution-search domain of the compute service
pub mod compute;

pub use compute::{
    ComputeService, ServiceConnection, SolutionProgress, SolutionScore, SolutionSearchRequest,
    SolutionStatus, StatusContext, StopSolutionSearchRequest,
};
pub use error::{ComputeError, DispatchError};
pub use proxy::{Delivery, ObserverHandle, ProxyCompletion, ProxyEvent, ResultProxy};
pub use request::{
    ParseRequestIdError, ProducerClosed, RequestChannels, RequestContext, RequestDescriptor,
    RequestHash, RequestId, RequestProducer, StreamEvent,
};
