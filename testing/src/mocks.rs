//! In-memory compute service for tests.
//!
//! [`MockComputeService`] never talks to a network. Every call creates a real
//! [`StatusContext`] and either hands its producer to the test
//! ([`SearchMode::Manual`]) or feeds it from a script on a spawned task
//! ([`SearchMode::Scripted`]).

#![allow(clippy::missing_panics_doc)]

use solution_dispatch_core::{
    ComputeError, ComputeService, DispatchError, RequestContext, RequestDescriptor, RequestId,
    RequestProducer, ServiceConnection, SolutionProgress, SolutionSearchRequest, SolutionStatus,
    StatusContext, StopSolutionSearchRequest,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Producer half of a solution-status request.
pub type StatusProducer = RequestProducer<SolutionStatus, ComputeError>;

/// One step of a scripted search.
#[derive(Debug, Clone, PartialEq)]
pub enum ScriptStep {
    /// Emit a status for the given solution
    Status {
        /// Solution identifier
        solution_id: String,
        /// Progress to report
        progress: SolutionProgress,
    },
    /// Emit a stream-level error
    Error(ComputeError),
    /// Pause before the next step
    Delay(Duration),
}

impl ScriptStep {
    /// Shorthand for [`ScriptStep::Status`].
    #[must_use]
    pub fn status(solution_id: impl Into<String>, progress: SolutionProgress) -> Self {
        Self::Status {
            solution_id: solution_id.into(),
            progress,
        }
    }
}

/// How searches are fed.
#[derive(Debug, Clone, PartialEq)]
pub enum SearchMode {
    /// Producers are queued for the test to drive
    Manual,
    /// Each search plays the script, then finishes
    Scripted(Vec<ScriptStep>),
}

/// A call received by the mock.
#[derive(Debug, Clone, PartialEq)]
pub enum ReceivedCall {
    /// `search_solutions`
    Search(SolutionSearchRequest),
    /// `stop_search`
    Stop(StopSolutionSearchRequest),
}

#[derive(Debug)]
struct MockState {
    mode: SearchMode,
    capacity: usize,
    producers: Mutex<VecDeque<(RequestId, StatusProducer)>>,
    calls: Mutex<Vec<ReceivedCall>>,
    failures: Mutex<VecDeque<DispatchError>>,
    initiation_delay: Mutex<Option<Duration>>,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

/// Scriptable [`ComputeService`].
///
/// Clones share state, so a test can keep one clone while the client owns
/// another.
///
/// # Example
///
/// ```ignore
/// let service = MockComputeService::manual();
/// let client = DispatchClient::new(service.clone(), ClientConfig::default());
///
/// let id = client
///     .dispatch(|svc| async move { svc.search_solutions(&request).await })
///     .await?;
/// let producer = service.take_producer().unwrap();
/// producer.send_result(status).await?;
/// producer.finish();
/// ```
#[derive(Debug, Clone)]
pub struct MockComputeService {
    state: Arc<MockState>,
}

impl MockComputeService {
    /// Create a mock with the given search mode.
    #[must_use]
    pub fn new(mode: SearchMode) -> Self {
        Self {
            state: Arc::new(MockState {
                mode,
                capacity: 64,
                producers: Mutex::new(VecDeque::new()),
                calls: Mutex::new(Vec::new()),
                failures: Mutex::new(VecDeque::new()),
                initiation_delay: Mutex::new(None),
                closed: AtomicBool::new(false),
                close_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// A mock whose searches are driven by the test.
    #[must_use]
    pub fn manual() -> Self {
        Self::new(SearchMode::Manual)
    }

    /// A mock whose searches play `steps` and then finish.
    #[must_use]
    pub fn scripted(steps: Vec<ScriptStep>) -> Self {
        Self::new(SearchMode::Scripted(steps))
    }

    /// Make the next call fail to initiate with `error`.
    ///
    /// Failures queue up; each call consumes one.
    pub fn fail_next(&self, error: DispatchError) {
        self.state
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Make every later call wait `delay` before its context is created.
    ///
    /// The call is recorded before the wait.
    pub fn delay_initiation(&self, delay: Duration) {
        *self
            .state
            .initiation_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(delay);
    }

    /// Take the oldest producer handed out in manual mode.
    ///
    /// Stop calls always finish on their own and never appear here.
    #[must_use]
    pub fn take_producer(&self) -> Option<StatusProducer> {
        self.take_producer_with_id().map(|(_, producer)| producer)
    }

    /// Like [`MockComputeService::take_producer`], with the request id.
    #[must_use]
    pub fn take_producer_with_id(&self) -> Option<(RequestId, StatusProducer)> {
        self.state
            .producers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    /// Every call received so far, in order.
    #[must_use]
    pub fn calls(&self) -> Vec<ReceivedCall> {
        self.state
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of `search_solutions` calls that reached the service.
    #[must_use]
    pub fn search_count(&self) -> usize {
        self.calls()
            .iter()
            .filter(|call| matches!(call, ReceivedCall::Search(_)))
            .count()
    }

    /// Whether `close` was called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.closed.load(Ordering::SeqCst)
    }

    /// How many times `close` was called.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.state.close_calls.load(Ordering::SeqCst)
    }

    fn record(&self, call: ReceivedCall) -> Result<(), DispatchError> {
        self.state
            .calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);

        let failure = self
            .state
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        failure.map_or(Ok(()), Err)
    }

    async fn initiate(&self, call: ReceivedCall) -> Result<(), DispatchError> {
        self.record(call)?;

        let delay = *self
            .state
            .initiation_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }
}

impl Default for MockComputeService {
    fn default() -> Self {
        Self::manual()
    }
}

impl ServiceConnection for MockComputeService {
    fn close(&self) {
        self.state.closed.store(true, Ordering::SeqCst);
        self.state.close_calls.fetch_add(1, Ordering::SeqCst);
    }
}

impl ComputeService for MockComputeService {
    async fn search_solutions(
        &self,
        request: &SolutionSearchRequest,
    ) -> Result<StatusContext, DispatchError> {
        self.initiate(ReceivedCall::Search(request.clone())).await?;

        let (context, producer) =
            RequestContext::channel(request.request_hash(), self.state.capacity);
        let request_id = context.request_id();

        match &self.state.mode {
            SearchMode::Manual => {
                self.state
                    .producers
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push_back((request_id, producer));
            }
            SearchMode::Scripted(steps) => {
                tokio::spawn(play(request_id, steps.clone(), producer));
            }
        }

        Ok(context)
    }

    async fn stop_search(
        &self,
        request: &StopSolutionSearchRequest,
    ) -> Result<StatusContext, DispatchError> {
        self.initiate(ReceivedCall::Stop(request.clone())).await?;

        let (context, producer) =
            RequestContext::channel(request.request_hash(), self.state.capacity);
        producer.finish();
        Ok(context)
    }
}

async fn play(request_id: RequestId, steps: Vec<ScriptStep>, producer: StatusProducer) {
    for step in steps {
        let sent = match step {
            ScriptStep::Status {
                solution_id,
                progress,
            } => {
                producer
                    .send_result(SolutionStatus::new(request_id, solution_id, progress))
                    .await
            }
            ScriptStep::Error(error) => producer.send_error(error).await,
            ScriptStep::Delay(delay) => {
                tokio::time::sleep(delay).await;
                Ok(())
            }
        };
        if sent.is_err() {
            return;
        }
    }
    producer.finish();
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use solution_dispatch_core::StreamEvent;

    #[tokio::test]
    async fn test_manual_mode_queues_producers() {
        let service = MockComputeService::manual();
        let request = SolutionSearchRequest::new("baseball", "hits");

        let ctx = service.search_solutions(&request).await.unwrap();
        let (id, _producer) = service.take_producer_with_id().unwrap();

        assert_eq!(ctx.request_id(), id);
        assert_eq!(ctx.request_hash(), &request.request_hash());
        assert_eq!(service.calls(), vec![ReceivedCall::Search(request)]);
        assert!(service.take_producer().is_none());
    }

    #[tokio::test]
    async fn test_failures_are_consumed_in_order() {
        let service = MockComputeService::manual();
        service.fail_next(DispatchError::Initiation("busy".into()));
        let request = SolutionSearchRequest::new("baseball", "hits");

        assert!(service.search_solutions(&request).await.is_err());
        assert!(service.search_solutions(&request).await.is_ok());
        assert_eq!(service.search_count(), 2);
    }

    #[tokio::test]
    async fn test_stop_finishes_immediately() {
        let service = MockComputeService::manual();
        let ctx = service
            .stop_search(&StopSolutionSearchRequest::new(RequestId::new()))
            .await
            .unwrap();

        let (_, _, channels) = ctx.into_parts();
        assert!(channels.done.await.is_ok());
        assert!(service.take_producer().is_none());
    }

    #[tokio::test]
    async fn test_scripted_mode_plays_steps() {
        let service = MockComputeService::scripted(vec![
            ScriptStep::status("s1", SolutionProgress::Running),
            ScriptStep::Error(ComputeError::Stream("blip".into())),
            ScriptStep::status("s1", SolutionProgress::Completed),
        ]);
        let ctx = service
            .search_solutions(&SolutionSearchRequest::new("baseball", "hits"))
            .await
            .unwrap();

        let (_, _, mut channels) = ctx.into_parts();
        let mut played = Vec::new();
        for _ in 0..3 {
            played.push(match channels.events.recv().await.unwrap() {
                StreamEvent::Result(status) => format!("{:?}", status.progress),
                StreamEvent::Error(error) => error.to_string(),
            });
        }

        assert_eq!(played, vec!["Running", "Stream error: blip", "Completed"]);
        assert!(channels.done.await.is_ok());
    }

    #[tokio::test]
    async fn test_initiation_delay_holds_the_call() {
        let service = MockComputeService::manual();
        service.delay_initiation(Duration::from_millis(20));

        let started = std::time::Instant::now();
        service
            .search_solutions(&SolutionSearchRequest::new("baseball", "hits"))
            .await
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(20));
        assert_eq!(service.search_count(), 1);
    }

    #[test]
    fn test_close_is_recorded() {
        let service = MockComputeService::manual();
        service.close();
        assert!(service.is_closed());
        assert_eq!(service.close_calls(), 1);
    }
}
