//! # Solution Dispatch Testing
//!
//! Testing utilities for the solution-dispatch crates.
//!
//! This crate provides:
//! - [`MockComputeService`]: a scriptable in-memory compute service
//! - Helpers to dispatch hand-driven requests and drain proxies with a timeout
//! - Deterministic fixtures and tracing setup for tests
//!
//! ## Example
//!
//! ```ignore
//! use solution_dispatch_testing::{dispatch_manual, drain};
//!
//! #[tokio::test]
//! async fn test_late_observer_gets_snapshot() {
//!     let client = DispatchClient::<(), u32, String>::new((), ClientConfig::default());
//!     let (id, producer) = dispatch_manual(&client, &RequestHash::of(&"q")).await.unwrap();
//!
//!     producer.send_result(1).await.unwrap();
//!     let attachment = client.attach(id).unwrap();
//!     producer.finish();
//!
//!     let (live, _, _) = drain(attachment.proxy).await.unwrap();
//!     assert_eq!([attachment.history, live].concat(), vec![1]);
//! }
//! ```

/// Scriptable compute service
pub mod mocks;

pub use mocks::{MockComputeService, ReceivedCall, ScriptStep, SearchMode, StatusProducer};

use chrono::{DateTime, Utc};
use solution_dispatch_core::{
    DispatchError, ProxyCompletion, RequestContext, RequestDescriptor, RequestId,
    RequestProducer, ResultProxy, ServiceConnection, SolutionProgress, SolutionStatus,
};
use solution_dispatch_runtime::DispatchClient;
use std::time::Duration;

/// Default timeout used by the draining helpers.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Install a `tracing` subscriber for tests.
///
/// Honours `RUST_LOG`, defaulting to `warn`. Safe to call from every test.
pub fn init_test_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

/// Dispatch a request whose producer the test drives by hand.
///
/// # Errors
///
/// Returns whatever [`DispatchClient::dispatch`] returned.
pub async fn dispatch_manual<S, T, E, D>(
    client: &DispatchClient<S, T, E>,
    descriptor: &D,
) -> Result<(RequestId, RequestProducer<T, E>), DispatchError>
where
    S: ServiceConnection,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
    D: RequestDescriptor + ?Sized,
{
    let (context, producer) =
        RequestContext::channel(descriptor.request_hash(), client.config().request_capacity);
    let request_id = client.dispatch(|_| async move { Ok(context) }).await?;
    Ok((request_id, producer))
}

/// Drain a proxy to completion, giving up after [`DEFAULT_TIMEOUT`].
///
/// Returns `None` on timeout.
pub async fn drain<T, E>(proxy: ResultProxy<T, E>) -> Option<(Vec<T>, Vec<E>, ProxyCompletion)> {
    drain_within(proxy, DEFAULT_TIMEOUT).await
}

/// Drain a proxy to completion, giving up after `timeout`.
pub async fn drain_within<T, E>(
    proxy: ResultProxy<T, E>,
    timeout: Duration,
) -> Option<(Vec<T>, Vec<E>, ProxyCompletion)> {
    tokio::time::timeout(timeout, proxy.collect()).await.ok()
}

/// Poll `condition` every millisecond until it holds or `timeout` passes.
pub async fn wait_until<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Fixed timestamp for deterministic fixtures (2025-01-01 00:00:00 UTC).
///
/// # Panics
///
/// Never in practice; the timestamp is a constant.
#[must_use]
#[allow(clippy::expect_used)]
pub fn test_timestamp() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
        .expect("hardcoded timestamp should always parse")
        .with_timezone(&Utc)
}

/// A status stamped with [`test_timestamp`].
#[must_use]
pub fn status(
    request_id: RequestId,
    solution_id: &str,
    progress: SolutionProgress,
) -> SolutionStatus {
    SolutionStatus {
        timestamp: test_timestamp(),
        ..SolutionStatus::new(request_id, solution_id, progress)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_status_is_deterministic() {
        let id = RequestId::new();
        let a = status(id, "s1", SolutionProgress::Running);
        let b = status(id, "s1", SolutionProgress::Running);
        assert_eq!(a, b);
        assert_eq!(a.timestamp, test_timestamp());
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        assert!(wait_until(|| true, Duration::from_millis(10)).await);
        assert!(!wait_until(|| false, Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_drain_times_out_on_open_proxy() {
        let (_handle, proxy) = ResultProxy::<u32, String>::channel(RequestId::new(), 4);
        assert!(drain_within(proxy, Duration::from_millis(10)).await.is_none());
    }
}
