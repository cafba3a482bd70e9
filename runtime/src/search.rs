//! Dispatch-or-attach for solution searches.
//!
//! A caller that wants search results never has to know whether someone else
//! already started the same search. [`SearchCoordinator::start_or_attach`]
//! joins an equivalent running search when there is one and dispatches a new
//! one otherwise. An equivalent search that is still being initiated counts
//! as running. Stop requests go through the same path.

use crate::client::{Attachment, DispatchClient};
use crate::config::ClientConfig;
use crate::health::HealthReport;
use futures::{Stream, StreamExt};
use solution_dispatch_core::{
    ComputeError, ComputeService, DispatchError, ProxyCompletion, ProxyEvent, RequestContext,
    RequestDescriptor, RequestId, ResultProxy, SolutionSearchRequest, SolutionStatus,
    StopSolutionSearchRequest,
};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;

/// Dispatch client specialised to solution statuses.
pub type StatusClient<S> = DispatchClient<S, SolutionStatus, ComputeError>;

/// Errors from starting or joining a search.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SearchError {
    /// The request could not be dispatched
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    /// The request finished and was removed before it could be observed
    #[error("Request {0} is no longer tracked")]
    Untracked(RequestId),
}

/// A caller's view of one search: what happened so far and, while the search
/// runs, a live proxy for the rest.
#[derive(Debug)]
pub struct Subscription {
    request_id: RequestId,
    history: Vec<SolutionStatus>,
    live: Option<ResultProxy<SolutionStatus, ComputeError>>,
    completion: ProxyCompletion,
    joined: bool,
}

impl Subscription {
    fn live(attachment: Attachment<SolutionStatus, ComputeError>, joined: bool) -> Self {
        Self {
            request_id: attachment.request_id(),
            history: attachment.history,
            live: Some(attachment.proxy),
            completion: ProxyCompletion::Finished,
            joined,
        }
    }

    fn replay(
        request_id: RequestId,
        history: Vec<SolutionStatus>,
        completion: ProxyCompletion,
        joined: bool,
    ) -> Self {
        Self {
            request_id,
            history,
            live: None,
            completion,
            joined,
        }
    }

    /// Identifier of the observed request.
    #[must_use]
    pub const fn request_id(&self) -> RequestId {
        self.request_id
    }

    /// Statuses produced before this subscription was created.
    #[must_use]
    pub fn history(&self) -> &[SolutionStatus] {
        &self.history
    }

    /// Whether more events may still arrive.
    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Whether an already running request was joined instead of dispatching.
    #[must_use]
    pub const fn joined_existing(&self) -> bool {
        self.joined
    }

    /// Every event of the search: history first, then live events, ending
    /// with `Done`.
    pub fn into_events(self) -> impl Stream<Item = ProxyEvent<SolutionStatus, ComputeError>> {
        let Self {
            history,
            live,
            completion,
            ..
        } = self;

        async_stream::stream! {
            for status in history {
                yield ProxyEvent::Result(status);
            }
            match live {
                Some(proxy) => {
                    let mut events = std::pin::pin!(proxy.into_stream());
                    while let Some(event) = events.next().await {
                        yield event;
                    }
                }
                None => yield ProxyEvent::Done(completion),
            }
        }
    }
}

/// What [`SearchCoordinator::listen`] observed.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenSummary {
    /// Statuses passed to the callback, history included
    pub statuses: usize,
    /// Stream-level errors, in arrival order
    pub errors: Vec<ComputeError>,
    /// How the subscription ended
    pub completion: ProxyCompletion,
}

/// Starts, joins and stops solution searches on one compute connection.
pub struct SearchCoordinator<S> {
    client: StatusClient<S>,
}

impl<S> Clone for SearchCoordinator<S> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
        }
    }
}

impl<S: ComputeService> SearchCoordinator<S> {
    /// Coordinate searches over an established connection.
    #[must_use]
    pub fn new(service: S, config: ClientConfig) -> Self {
        Self::from_client(DispatchClient::new(service, config))
    }

    /// Coordinate searches over an existing client.
    #[must_use]
    pub const fn from_client(client: StatusClient<S>) -> Self {
        Self { client }
    }

    /// Connect to the compute service, retrying per `config.connect_retry`.
    ///
    /// # Errors
    ///
    /// Returns [`DispatchError::Connection`] if every attempt failed.
    pub async fn connect<C, Fut>(config: ClientConfig, connector: C) -> Result<Self, DispatchError>
    where
        C: FnMut(String) -> Fut,
        Fut: Future<Output = Result<S, DispatchError>>,
    {
        DispatchClient::connect(config, connector)
            .await
            .map(Self::from_client)
    }

    /// The underlying dispatch client.
    #[must_use]
    pub const fn client(&self) -> &StatusClient<S> {
        &self.client
    }

    /// Join an equivalent running search, or start a new one.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::Dispatch`] if a new search could not be
    /// started.
    #[tracing::instrument(
        skip_all,
        fields(dataset = %request.dataset, target = %request.target_feature)
    )]
    pub async fn start_or_attach(
        &self,
        request: &SolutionSearchRequest,
    ) -> Result<Subscription, SearchError> {
        let owned = request.clone();
        self.dispatch_or_attach(request, |service| async move {
            service.search_solutions(&owned).await
        })
        .await
    }

    /// Ask the service to stop a search.
    ///
    /// The stop call is itself a tracked request; a second identical stop
    /// while the first is in flight joins it.
    ///
    /// # Errors
    ///
    /// Returns [`SearchError::Dispatch`] if the stop call could not be
    /// started.
    #[tracing::instrument(skip_all, fields(target_request = %request.request_id))]
    pub async fn stop(&self, request: &StopSolutionSearchRequest) -> Result<Subscription, SearchError> {
        let owned = request.clone();
        self.dispatch_or_attach(request, |service| async move {
            service.stop_search(&owned).await
        })
        .await
    }

    async fn dispatch_or_attach<D, F, Fut>(
        &self,
        descriptor: &D,
        request_fn: F,
    ) -> Result<Subscription, SearchError>
    where
        D: RequestDescriptor + ?Sized,
        F: FnOnce(Arc<S>) -> Fut,
        Fut: Future<Output = Result<RequestContext<SolutionStatus, ComputeError>, DispatchError>>,
    {
        let (request_id, joined) = self
            .client
            .dispatch_or_join(descriptor, request_fn)
            .await?;

        if let Some(attachment) = self.client.attach(request_id) {
            if joined {
                tracing::info!(%request_id, "Joined running request");
            }
            return Ok(Subscription::live(attachment, joined));
        }

        // Finished before we could attach; hand back everything it produced.
        let history = self
            .client
            .completed_results(request_id)
            .ok_or(SearchError::Untracked(request_id))?;
        let completion = self
            .client
            .completion(request_id)
            .unwrap_or(ProxyCompletion::Finished);
        Ok(Subscription::replay(request_id, history, completion, joined))
    }

    /// Feed every status of `subscription` to `on_status` until the search
    /// ends.
    #[allow(clippy::unused_self)]
    pub async fn listen<F>(&self, subscription: Subscription, mut on_status: F) -> ListenSummary
    where
        F: FnMut(&SolutionStatus),
    {
        let request_id = subscription.request_id();
        let mut summary = ListenSummary {
            statuses: 0,
            errors: Vec::new(),
            completion: ProxyCompletion::Finished,
        };

        let mut events = std::pin::pin!(subscription.into_events());
        while let Some(event) = events.next().await {
            match event {
                ProxyEvent::Result(status) => {
                    summary.statuses += 1;
                    on_status(&status);
                }
                ProxyEvent::Error(error) => {
                    tracing::warn!(%request_id, error = %error, "Search reported an error");
                    summary.errors.push(error);
                }
                ProxyEvent::Done(completion) => summary.completion = completion,
            }
        }

        summary
    }

    /// Close the connection; running searches are left to finish.
    pub fn close(&self) {
        self.client.close();
    }

    /// Health of the connection and the searches running on it.
    #[must_use]
    pub fn health_report(&self) -> HealthReport {
        self.client.health()
    }
}
