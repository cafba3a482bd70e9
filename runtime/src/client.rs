//! The dispatch client: one shared service connection, many requests, many
//! observers per request.
//!
//! # Lifecycle of a request
//!
//! 1. [`DispatchClient::dispatch`] runs the caller's initiation function
//!    against the connection, registers the returned context as pending and
//!    spawns its forwarding routine.
//! 2. Callers find it with [`DispatchClient::is_request_attachable`] and join
//!    it with [`DispatchClient::attach`], receiving a [`ResultProxy`] and a
//!    copy of every result produced so far.
//! 3. When the producer finishes (or the stall timeout fires) the request moves
//!    to the completed set. Its results stay available through
//!    [`DispatchClient::completed_results`] but it can no longer be attached.
//!
//! # Locking
//!
//! Two `std::sync::Mutex`es guard the shared state: the registry (pending,
//! completed and result buffers) and the downstream observer lists. Neither is
//! held across an `.await` or a channel send. The only place both are held is
//! [`DispatchClient::attach`], which takes the registry first.

use crate::config::ClientConfig;
use crate::forwarding;
use crate::metrics::{AttachMetrics, ConnectionMetrics, RequestMetrics};
use crate::retry::retry_with_backoff;
use crate::health::{HealthReport, HealthStatus, StalledRequest};
use solution_dispatch_core::{
    DispatchError, ObserverHandle, ProxyCompletion, RequestContext, RequestDescriptor,
    RequestHash, RequestId, ResultProxy, ServiceConnection,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;
use tokio::sync::watch;
use tracing::Instrument;

/// A pending request.
#[derive(Debug)]
pub(crate) struct PendingEntry {
    pub(crate) hash: RequestHash,
    /// Dispatch order, used to pick the earliest of several equivalent requests
    pub(crate) sequence: u64,
    pub(crate) started: Instant,
}

/// Outcome of an initiation, published to callers waiting on the same hash.
type InitiationOutcome = watch::Sender<Option<Result<RequestId, DispatchError>>>;

/// Pending and completed requests plus every request's result buffer.
#[derive(Debug)]
pub(crate) struct Registry<T> {
    pub(crate) pending: HashMap<RequestId, PendingEntry>,
    pub(crate) completed: HashMap<RequestId, ProxyCompletion>,
    pub(crate) buffers: HashMap<RequestId, Vec<T>>,
    /// Hashes whose initiation is running in [`DispatchClient::dispatch_or_join`]
    initiating: HashMap<RequestHash, InitiationOutcome>,
}

impl<T> Registry<T> {
    /// Earliest dispatched pending request with `hash`.
    fn earliest_pending(&self, hash: &RequestHash) -> Option<RequestId> {
        self.pending
            .iter()
            .filter(|(_, entry)| entry.hash == *hash)
            .min_by_key(|(_, entry)| entry.sequence)
            .map(|(id, _)| *id)
    }
}

impl<T> Default for Registry<T> {
    fn default() -> Self {
        Self {
            pending: HashMap::new(),
            completed: HashMap::new(),
            buffers: HashMap::new(),
            initiating: HashMap::new(),
        }
    }
}

/// Claim on a hash while its initiation runs.
///
/// Dropping an unresolved claim releases the hash; waiters then see the
/// initiation as abandoned.
struct InitiationClaim<'a, S, T, E> {
    inner: &'a Inner<S, T, E>,
    hash: Option<RequestHash>,
}

impl<S, T, E> InitiationClaim<'_, S, T, E> {
    fn resolve(mut self, outcome: Result<RequestId, DispatchError>) {
        let Some(hash) = self.hash.take() else {
            return;
        };
        let sender = self.inner.lock_registry().initiating.remove(&hash);
        if let Some(sender) = sender {
            sender.send_replace(Some(outcome));
        }
    }
}

impl<S, T, E> Drop for InitiationClaim<'_, S, T, E> {
    fn drop(&mut self) {
        if let Some(hash) = self.hash.take() {
            self.inner.lock_registry().initiating.remove(&hash);
        }
    }
}

/// One attached observer.
///
/// `start_index` is the buffer length at attach time. Results at lower
/// indices were part of the observer's snapshot and are never sent live.
#[derive(Debug)]
pub(crate) struct Observer<T, E> {
    pub(crate) start_index: usize,
    pub(crate) handle: Arc<ObserverHandle<T, E>>,
}

impl<T, E> Clone for Observer<T, E> {
    fn clone(&self) -> Self {
        Self {
            start_index: self.start_index,
            handle: Arc::clone(&self.handle),
        }
    }
}

/// Observer lists keyed by request.
pub(crate) type Downstream<T, E> = HashMap<RequestId, Vec<Observer<T, E>>>;

/// State shared between the client handles and the forwarding routines.
pub(crate) struct Inner<S, T, E> {
    pub(crate) service: Arc<S>,
    pub(crate) config: ClientConfig,
    registry: Mutex<Registry<T>>,
    downstream: Mutex<Downstream<T, E>>,
    closed: AtomicBool,
    pub(crate) stalled: AtomicUsize,
    sequence: AtomicU64,
}

impl<S, T, E> Inner<S, T, E> {
    pub(crate) fn lock_registry(&self) -> MutexGuard<'_, Registry<T>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn lock_downstream(&self) -> MutexGuard<'_, Downstream<T, E>> {
        self.downstream
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Copy of the observer list, so delivery can run without the lock.
    pub(crate) fn observers(&self, request_id: RequestId) -> Vec<Observer<T, E>> {
        self.lock_downstream()
            .get(&request_id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Result of a successful [`DispatchClient::attach`].
#[derive(Debug)]
pub struct Attachment<T, E> {
    /// Live subscription; yields only results produced after the attach.
    pub proxy: ResultProxy<T, E>,
    /// Every result produced before the attach, in order.
    pub history: Vec<T>,
}

impl<T, E> Attachment<T, E> {
    /// Identifier of the attached request.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.proxy.request_id()
    }
}

/// Broker between callers and the requests running on one service
/// connection.
///
/// Cloning is cheap; every clone shares the same connection and state.
///
/// # Example
///
/// ```ignore
/// let client = DispatchClient::new(service, ClientConfig::default());
///
/// let id = match client.is_request_attachable(&request) {
///     Some(id) => id,
///     None => client.dispatch(|svc| async move { svc.search_solutions(&request).await }).await?,
/// };
///
/// if let Some(Attachment { mut proxy, history }) = client.attach(id) {
///     for status in history { render(status); }
///     while let Some(event) = proxy.next_event().await { /* ... */ }
/// }
/// ```
pub struct DispatchClient<S, T, E> {
    inner: Arc<Inner<S, T, E>>,
}

impl<S, T, E> Clone for DispatchClient<S, T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S, T, E> DispatchClient<S, T, E>
where
    S: ServiceConnection,
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Wrap an established service connection.
    #[must_use]
    pub fn new(service: S, config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                service: Arc::new(service),
                config,
                registry: Mutex::new(Registry::default()),
                downstream: Mutex::new(HashMap::new()),
                closed: AtomicBool::new(false),
                stalled: AtomicUsize::new(0),
                sequence: AtomicU64::new(0),
            }),
        }
    }

    /// Establish the service connection with `config.connect_retry` and wrap
    /// it.
    ///
    /// `connector` is called once per attempt with `config.server_addr`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Connection`] once every attempt has failed.
    #[tracing::instrument(skip_all, fields(addr = %config.server_addr))]
    pub async fn connect<C, Fut>(config: ClientConfig, mut connector: C) -> Result<Self, DispatchError>
    where
        C: FnMut(String) -> Fut,
        Fut: Future<Output = Result<S, DispatchError>>,
    {
        let addr = config.server_addr.clone();

        let service = retry_with_backoff(&config.connect_retry, "compute-service", || {
            ConnectionMetrics::record_attempt();
            let attempt = connector(addr.clone());
            async move {
                let outcome = attempt.await;
                if outcome.is_err() {
                    ConnectionMetrics::record_failure();
                }
                outcome
            }
        })
        .await
        .map_err(|err| match err {
            DispatchError::Connection { .. } => err,
            other => DispatchError::Connection {
                addr: addr.clone(),
                reason: other.to_string(),
            },
        })?;

        tracing::info!(addr = %addr, "Connected to compute service");
        Ok(Self::new(service, config))
    }

    /// Issue a new request and start forwarding its events.
    ///
    /// `request_fn` receives the shared connection and must start the remote
    /// call. Returns as soon as the request is registered; no result is
    /// awaited.
    ///
    /// # Errors
    ///
    /// - [`DispatchError::Closed`] after [`DispatchClient::close`]
    /// - whatever `request_fn` returned if initiation failed
    /// - [`DispatchError::Initiation`] if the context reuses a known id
    ///
    /// Nothing is registered in any error case.
    #[tracing::instrument(skip_all, name = "dispatch")]
    pub async fn dispatch<F, Fut>(&self, request_fn: F) -> Result<RequestId, DispatchError>
    where
        F: FnOnce(Arc<S>) -> Fut,
        Fut: Future<Output = Result<RequestContext<T, E>, DispatchError>>,
    {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }

        let context = match request_fn(Arc::clone(&self.inner.service)).await {
            Ok(context) => context,
            Err(err) => {
                RequestMetrics::record_failed();
                tracing::warn!(error = %err, "Request initiation failed");
                return Err(err);
            }
        };

        let (request_id, request_hash, channels) = context.into_parts();

        {
            let mut registry = self.inner.lock_registry();
            if registry.pending.contains_key(&request_id)
                || registry.completed.contains_key(&request_id)
            {
                drop(registry);
                RequestMetrics::record_failed();
                return Err(DispatchError::Initiation(format!(
                    "request id {request_id} is already registered"
                )));
            }

            let sequence = self.inner.sequence.fetch_add(1, Ordering::Relaxed);
            registry.pending.insert(
                request_id,
                PendingEntry {
                    hash: request_hash,
                    sequence,
                    started: Instant::now(),
                },
            );
            registry.buffers.insert(request_id, Vec::new());
        }

        RequestMetrics::record_dispatched();
        tracing::info!(%request_id, "Request dispatched");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(
            forwarding::forward(inner, request_id, channels)
                .instrument(tracing::info_span!("forward", %request_id)),
        );

        Ok(request_id)
    }

    /// Find a pending request equivalent to `descriptor`.
    ///
    /// When several match, the earliest dispatched wins. Completed requests
    /// are never returned.
    pub fn is_request_attachable<D>(&self, descriptor: &D) -> Option<RequestId>
    where
        D: RequestDescriptor + ?Sized,
    {
        let hash = descriptor.request_hash();
        let found = self.inner.lock_registry().earliest_pending(&hash);

        if let Some(request_id) = found {
            AttachMetrics::record_dedup_hit();
            tracing::debug!(%request_id, "Found attachable request");
        }
        found
    }

    /// Join a pending request equivalent to `descriptor`, or dispatch one.
    ///
    /// The descriptor's hash is claimed before `request_fn` runs. Concurrent
    /// callers with an equivalent descriptor wait for that initiation and
    /// join its request instead of starting their own. Returns the request id
    /// and whether an existing request was joined.
    ///
    /// # Errors
    ///
    /// As [`DispatchClient::dispatch`]. Callers that waited on a failed
    /// initiation receive the same error.
    #[tracing::instrument(skip_all, name = "dispatch_or_join")]
    pub async fn dispatch_or_join<D, F, Fut>(
        &self,
        descriptor: &D,
        request_fn: F,
    ) -> Result<(RequestId, bool), DispatchError>
    where
        D: RequestDescriptor + ?Sized,
        F: FnOnce(Arc<S>) -> Fut,
        Fut: Future<Output = Result<RequestContext<T, E>, DispatchError>>,
    {
        if self.is_closed() {
            return Err(DispatchError::Closed);
        }
        let hash = descriptor.request_hash();

        let waiting = {
            let mut registry = self.inner.lock_registry();
            if let Some(request_id) = registry.earliest_pending(&hash) {
                drop(registry);
                AttachMetrics::record_dedup_hit();
                tracing::debug!(%request_id, "Found attachable request");
                return Ok((request_id, true));
            }
            match registry.initiating.get(&hash) {
                Some(outcome) => Some(outcome.subscribe()),
                None => {
                    let (outcome, _) = watch::channel(None);
                    registry.initiating.insert(hash.clone(), outcome);
                    None
                }
            }
        };

        if let Some(mut outcome) = waiting {
            tracing::debug!("Waiting for an equivalent request to start");
            let request_id = outcome
                .wait_for(Option::is_some)
                .await
                .ok()
                .and_then(|outcome| outcome.clone())
                .unwrap_or_else(|| {
                    Err(DispatchError::Initiation(
                        "equivalent request was abandoned before it started".to_string(),
                    ))
                })?;
            AttachMetrics::record_dedup_hit();
            tracing::debug!(%request_id, "Joined request as it started");
            return Ok((request_id, true));
        }

        let claim = InitiationClaim {
            inner: &self.inner,
            hash: Some(hash),
        };
        let outcome = self.dispatch(request_fn).await;
        claim.resolve(outcome.clone());
        outcome.map(|request_id| (request_id, false))
    }

    /// Join a pending request as a new observer.
    ///
    /// Returns `None` if the id is unknown or already completed.
    pub fn attach(&self, request_id: RequestId) -> Option<Attachment<T, E>> {
        let registry = self.inner.lock_registry();

        if !registry.pending.contains_key(&request_id) {
            drop(registry);
            AttachMetrics::record_miss();
            tracing::warn!(%request_id, "Attach to unknown or completed request");
            return None;
        }

        let history = registry
            .buffers
            .get(&request_id)
            .cloned()
            .unwrap_or_default();
        let (handle, proxy) = ResultProxy::channel(request_id, self.inner.config.observer_capacity);

        // Registered before the registry lock is released so no result can
        // land between the snapshot and the live stream.
        self.inner
            .lock_downstream()
            .entry(request_id)
            .or_default()
            .push(Observer {
                start_index: history.len(),
                handle: Arc::new(handle),
            });
        drop(registry);

        AttachMetrics::record_hit();
        tracing::debug!(%request_id, history = history.len(), "Observer attached");

        Some(Attachment { proxy, history })
    }

    /// Whether the request is still running.
    #[must_use]
    pub fn is_pending(&self, request_id: RequestId) -> bool {
        self.inner.lock_registry().pending.contains_key(&request_id)
    }

    /// Whether the request has completed.
    #[must_use]
    pub fn is_completed(&self, request_id: RequestId) -> bool {
        self.inner
            .lock_registry()
            .completed
            .contains_key(&request_id)
    }

    /// How a completed request ended.
    #[must_use]
    pub fn completion(&self, request_id: RequestId) -> Option<ProxyCompletion> {
        self.inner
            .lock_registry()
            .completed
            .get(&request_id)
            .copied()
    }

    /// Number of running requests.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.inner.lock_registry().pending.len()
    }

    /// Number of completed requests still retained.
    #[must_use]
    pub fn completed_count(&self) -> usize {
        self.inner.lock_registry().completed.len()
    }

    /// Final results of a completed request.
    ///
    /// Returns `None` while the request is pending or once it was removed.
    #[must_use]
    pub fn completed_results(&self, request_id: RequestId) -> Option<Vec<T>> {
        let registry = self.inner.lock_registry();
        if registry.completed.contains_key(&request_id) {
            registry.buffers.get(&request_id).cloned()
        } else {
            None
        }
    }

    /// Forget a completed request, returning its results.
    ///
    /// Pending requests are left untouched.
    pub fn remove_completed(&self, request_id: RequestId) -> Option<Vec<T>> {
        let mut registry = self.inner.lock_registry();
        registry.completed.remove(&request_id)?;
        registry.buffers.remove(&request_id)
    }

    /// Number of observers currently attached to a request.
    #[must_use]
    pub fn observer_count(&self, request_id: RequestId) -> usize {
        self.inner
            .lock_downstream()
            .get(&request_id)
            .map_or(0, Vec::len)
    }

    /// The shared service connection.
    #[must_use]
    pub fn service(&self) -> &Arc<S> {
        &self.inner.service
    }

    /// Active configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Stop accepting requests and close the service connection.
    ///
    /// Running requests keep forwarding until their producers finish. Calling
    /// this more than once has no further effect.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!(pending = self.pending_count(), "Closing dispatch client");
        self.inner.service.close();
    }

    /// Whether [`DispatchClient::close`] was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Health of the client.
    ///
    /// Unhealthy once closed; degraded when any request stalled or the
    /// pending count exceeds `pending_warning_threshold`. Retained stalled
    /// requests are listed with the number of results they produced.
    #[must_use]
    pub fn health(&self) -> HealthReport {
        let (pending, completed, mut stalled) = {
            let registry = self.inner.lock_registry();
            let stalled: Vec<_> = registry
                .completed
                .iter()
                .filter(|(_, completion)| **completion == ProxyCompletion::Stalled)
                .map(|(request_id, _)| StalledRequest {
                    request_id: *request_id,
                    results: registry.buffers.get(request_id).map_or(0, Vec::len),
                })
                .collect();
            (registry.pending.len(), registry.completed.len(), stalled)
        };
        stalled.sort_by_key(|stalled| stalled.request_id);
        let observers: usize = self.inner.lock_downstream().values().map(Vec::len).sum();
        let stalled_total = self.inner.stalled.load(Ordering::Relaxed);
        let threshold = self.inner.config.pending_warning_threshold;

        let (status, message) = if self.is_closed() {
            (HealthStatus::Unhealthy, Some("Client is closed".to_string()))
        } else if stalled_total > 0 {
            (
                HealthStatus::Degraded,
                Some(format!("{stalled_total} request(s) stalled")),
            )
        } else if pending > threshold {
            (
                HealthStatus::Degraded,
                Some(format!(
                    "{pending} pending requests exceed threshold of {threshold}"
                )),
            )
        } else {
            (HealthStatus::Healthy, None)
        };

        HealthReport {
            status,
            message,
            server_addr: self.inner.config.server_addr.clone(),
            pending,
            completed,
            observers,
            stalled_total,
            stalled,
            timestamp: chrono::Utc::now(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    type Client = DispatchClient<(), u32, String>;

    fn client() -> Client {
        DispatchClient::new((), ClientConfig::default())
    }

    #[tokio::test]
    async fn test_initiation_failure_registers_nothing() {
        let client = client();

        let err = client
            .dispatch(|_| async { Err(DispatchError::Initiation("refused".into())) })
            .await
            .unwrap_err();

        assert_eq!(err, DispatchError::Initiation("refused".into()));
        assert_eq!(client.pending_count(), 0);
        assert_eq!(client.completed_count(), 0);
    }

    #[tokio::test]
    async fn test_duplicate_request_id_is_rejected() {
        let client = client();
        let id = RequestId::new();
        let hash = RequestHash::of(&"q");

        let (first, _p1) = RequestContext::channel_with_id(id, hash.clone(), 4);
        client.dispatch(|_| async { Ok(first) }).await.unwrap();

        let (second, _p2) = RequestContext::channel_with_id(id, hash, 4);
        let err = client.dispatch(|_| async { Ok(second) }).await.unwrap_err();

        assert!(matches!(err, DispatchError::Initiation(_)));
        assert_eq!(client.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_closed_client_rejects_dispatch() {
        let client = client();
        client.close();
        client.close();

        let err = client
            .dispatch(|_| async { Ok(RequestContext::channel(RequestHash::of(&"q"), 4).0) })
            .await
            .unwrap_err();

        assert_eq!(err, DispatchError::Closed);
        assert!(client.health().status.is_unhealthy());
    }

    #[tokio::test]
    async fn test_attach_unknown_is_none() {
        let client = client();
        assert!(client.attach(RequestId::new()).is_none());
        assert!(client.is_request_attachable(&RequestHash::of(&"q")).is_none());
    }

    #[tokio::test]
    async fn test_earliest_equivalent_request_wins() {
        let client = client();
        let hash = RequestHash::of(&"same");

        let (first, _p1) = RequestContext::channel(hash.clone(), 4);
        let first_id = client.dispatch(|_| async { Ok(first) }).await.unwrap();
        let (second, _p2) = RequestContext::channel(hash.clone(), 4);
        client.dispatch(|_| async { Ok(second) }).await.unwrap();

        assert_eq!(client.is_request_attachable(&hash), Some(first_id));
    }

    #[tokio::test]
    async fn test_concurrent_equivalent_dispatches_start_once() {
        let client = client();
        let hash = RequestHash::of(&"shared");
        let initiations = AtomicUsize::new(0);

        let start = || {
            let (client, hash, initiations) = (&client, &hash, &initiations);
            async move {
                client
                    .dispatch_or_join(hash, |_| async move {
                        initiations.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Ok(RequestContext::channel(hash.clone(), 4).0)
                    })
                    .await
            }
        };
        let (first, second) = tokio::join!(start(), start());

        let (first_id, first_joined) = first.unwrap();
        let (second_id, second_joined) = second.unwrap();
        assert_eq!(initiations.load(Ordering::SeqCst), 1);
        assert_eq!(first_id, second_id);
        assert!(first_joined != second_joined);
        assert!(client.inner.lock_registry().initiating.is_empty());
    }

    #[tokio::test]
    async fn test_waiters_share_a_failed_initiation() {
        let client = client();
        let hash = RequestHash::of(&"doomed");

        let start = || {
            let (client, hash) = (&client, &hash);
            async move {
                client
                    .dispatch_or_join(hash, |_| async {
                        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                        Err(DispatchError::Initiation("refused".into()))
                    })
                    .await
            }
        };
        let (first, second) = tokio::join!(start(), start());

        assert_eq!(first, Err(DispatchError::Initiation("refused".into())));
        assert_eq!(second, Err(DispatchError::Initiation("refused".into())));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_health_degrades_above_pending_threshold() {
        let client: Client = DispatchClient::new(
            (),
            ClientConfig::default().with_pending_warning_threshold(1),
        );
        let mut producers = Vec::new();
        for n in 0..2 {
            let (ctx, producer) = RequestContext::channel(RequestHash::of(&n), 4);
            client.dispatch(|_| async { Ok(ctx) }).await.unwrap();
            producers.push(producer);
        }

        let health = client.health();
        assert!(health.status.is_degraded());
        assert_eq!(health.pending, 2);
        assert!(health.stalled.is_empty());
        assert_eq!(
            health.message.as_deref(),
            Some("2 pending requests exceed threshold of 1")
        );
    }
}
