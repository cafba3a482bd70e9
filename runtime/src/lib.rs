//! # Solution Dispatch Runtime
//!
//! Multiplexes long-running streamed requests over one shared compute-service
//! connection.
//!
//! ## Core Components
//!
//! - **`DispatchClient`**: registers requests, runs one forwarding routine per
//!   request, and fans every event out to the request's observers
//! - **Attach protocol**: equivalent requests are found by hash and joined
//!   with a snapshot of the results produced so far
//! - **`SearchCoordinator`**: dispatch-or-attach for solution searches
//! - **`SolutionSession`**: JSON message handling for one websocket connection
//!
//! ## Example
//!
//! ```ignore
//! use solution_dispatch_runtime::{ClientConfig, SearchCoordinator};
//!
//! let coordinator = SearchCoordinator::connect(ClientConfig::from_env()?, |addr| {
//!     GrpcComputeService::dial(addr)
//! })
//! .await?;
//!
//! let subscription = coordinator.start_or_attach(&request).await?;
//! let errors = coordinator
//!     .listen(subscription, |status| println!("{status:?}"))
//!     .await;
//! ```

/// The dispatch client and attach protocol
pub mod client;

/// Client configuration
pub mod config;

mod forwarding;

/// Health snapshots of the dispatch client
pub mod health;

/// Prometheus metrics for observability
pub mod metrics;

/// Retry logic with exponential backoff
pub mod retry;

/// Dispatch-or-attach for solution searches
pub mod search;

/// Websocket message session
pub mod session;

pub use client::{Attachment, DispatchClient};
pub use config::{ClientConfig, ConfigError, OverflowPolicy};
pub use health::{HealthReport, HealthStatus, StalledRequest};
pub use search::{ListenSummary, SearchCoordinator, SearchError, StatusClient, Subscription};
pub use session::{ClientMessage, MessageType, ServerFrame, SolutionSession};
