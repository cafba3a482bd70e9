//! Solution-search domain of the external compute service.
//!
//! The compute service runs machine-learning pipeline searches. A search is a
//! long-lived streamed call that emits one [`SolutionStatus`] per candidate
//! solution update. Stopping a search is itself a call to the service and is
//! dispatched and tracked like any other request.

use crate::error::{ComputeError, DispatchError};
use crate::request::{RequestContext, RequestDescriptor, RequestHash, RequestId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;

/// Request context carrying solution statuses and stream errors.
pub type StatusContext = RequestContext<SolutionStatus, ComputeError>;

/// Parameters of a solution search, as sent by the UI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolutionSearchRequest {
    /// Dataset to search over
    pub dataset: String,
    /// Feature to predict
    pub target_feature: String,
    /// Training features; order carries no meaning
    #[serde(default)]
    pub features: Vec<String>,
    /// Task type (e.g. `classification`, `regression`)
    #[serde(default)]
    pub task: String,
    /// Scoring metrics; order carries no meaning
    #[serde(default)]
    pub metrics: Vec<String>,
    /// Upper bound on returned solutions
    #[serde(default = "default_max_solutions")]
    pub max_solutions: u32,
    /// Search time budget in seconds
    #[serde(default = "default_max_time")]
    pub max_time: u64,
    /// Row filters applied before training, passed through opaquely
    #[serde(default)]
    pub filters: serde_json::Value,
}

const fn default_max_solutions() -> u32 {
    5
}

const fn default_max_time() -> u64 {
    600
}

impl SolutionSearchRequest {
    /// Create a request with default limits and no filters.
    #[must_use]
    pub fn new(dataset: impl Into<String>, target_feature: impl Into<String>) -> Self {
        Self {
            dataset: dataset.into(),
            target_feature: target_feature.into(),
            features: Vec::new(),
            task: String::new(),
            metrics: Vec::new(),
            max_solutions: default_max_solutions(),
            max_time: default_max_time(),
            filters: serde_json::Value::Null,
        }
    }

    /// Set the training features.
    #[must_use]
    pub fn with_features<I, S>(mut self, features: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.features = features.into_iter().map(Into::into).collect();
        self
    }

    /// Set the task type.
    #[must_use]
    pub fn with_task(mut self, task: impl Into<String>) -> Self {
        self.task = task.into();
        self
    }

    /// Set the scoring metrics.
    #[must_use]
    pub fn with_metrics<I, S>(mut self, metrics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metrics = metrics.into_iter().map(Into::into).collect();
        self
    }

    /// Set the maximum number of solutions.
    #[must_use]
    pub const fn with_max_solutions(mut self, max_solutions: u32) -> Self {
        self.max_solutions = max_solutions;
        self
    }

    /// Set the row filters.
    #[must_use]
    pub fn with_filters(mut self, filters: serde_json::Value) -> Self {
        self.filters = filters;
        self
    }

    /// Parse a request from a JSON message body.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the body is not a valid request.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl RequestDescriptor for SolutionSearchRequest {
    fn request_hash(&self) -> RequestHash {
        let mut canonical = self.clone();
        canonical.features.sort();
        canonical.features.dedup();
        canonical.metrics.sort();
        canonical.metrics.dedup();
        RequestHash::of(&("search", &canonical))
    }
}

/// Progress of one candidate solution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SolutionProgress {
    /// Queued by the service
    Pending,
    /// Being fitted or scored
    Running,
    /// Finished with scores
    Completed,
    /// Failed
    Errored,
}

impl SolutionProgress {
    /// Whether no further updates will arrive for the solution.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Errored)
    }
}

/// A single score of a solution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SolutionScore {
    /// Metric name
    pub metric: String,
    /// Score value
    pub value: f64,
}

/// One status update emitted by a solution search.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SolutionStatus {
    /// Search request this update belongs to
    pub request_id: RequestId,
    /// Candidate solution
    pub solution_id: String,
    /// Current progress
    pub progress: SolutionProgress,
    /// Scores known so far
    #[serde(default)]
    pub scores: Vec<SolutionScore>,
    /// Produced predictions, once available
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_id: Option<String>,
    /// When the service reported this update
    pub timestamp: DateTime<Utc>,
}

impl SolutionStatus {
    /// Create a status stamped with the current time.
    #[must_use]
    pub fn new(
        request_id: RequestId,
        solution_id: impl Into<String>,
        progress: SolutionProgress,
    ) -> Self {
        Self {
            request_id,
            solution_id: solution_id.into(),
            progress,
            scores: Vec::new(),
            result_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Attach a score.
    #[must_use]
    pub fn with_score(mut self, metric: impl Into<String>, value: f64) -> Self {
        self.scores.push(SolutionScore {
            metric: metric.into(),
            value,
        });
        self
    }

    /// Attach the result identifier.
    #[must_use]
    pub fn with_result(mut self, result_id: impl Into<String>) -> Self {
        self.result_id = Some(result_id.into());
        self
    }
}

/// Request to stop a running solution search.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StopSolutionSearchRequest {
    /// Search to stop
    pub request_id: RequestId,
}

impl StopSolutionSearchRequest {
    /// Create a stop request for the given search.
    #[must_use]
    pub const fn new(request_id: RequestId) -> Self {
        Self { request_id }
    }

    /// Parse a stop request from a JSON message body.
    ///
    /// # Errors
    ///
    /// Returns the JSON error if the body is not a valid stop request.
    pub fn from_json(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl RequestDescriptor for StopSolutionSearchRequest {
    fn request_hash(&self) -> RequestHash {
        RequestHash::of(&("stop", self.request_id))
    }
}

/// A long-lived connection shared by every request the client dispatches.
pub trait ServiceConnection: Send + Sync + 'static {
    /// Release the underlying connection.
    ///
    /// Requests already running are not cancelled by this call.
    fn close(&self) {}
}

impl ServiceConnection for () {}

/// Connection to the external compute service.
///
/// Implementations issue the remote call and return a [`StatusContext`] wired
/// to the remote stream; a background pump feeds it through the matching
/// `RequestProducer`. Failing to start the call is reported as a
/// [`DispatchError`] and must leave nothing running.
pub trait ComputeService: ServiceConnection {
    /// Start a solution search.
    fn search_solutions(
        &self,
        request: &SolutionSearchRequest,
    ) -> impl Future<Output = Result<StatusContext, DispatchError>> + Send;

    /// Ask the service to stop a running search.
    ///
    /// The returned context emits no results; it finishes once the service
    /// acknowledged the stop, with any failure on its errors channel.
    fn stop_search(
        &self,
        request: &StopSolutionSearchRequest,
    ) -> impl Future<Output = Result<StatusContext, DispatchError>> + Send;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_search_hash_ignores_feature_order() {
        let a = SolutionSearchRequest::new("baseball", "hits")
            .with_features(["age", "weight", "height"])
            .with_metrics(["f1", "accuracy"]);
        let b = SolutionSearchRequest::new("baseball", "hits")
            .with_features(["height", "age", "weight"])
            .with_metrics(["accuracy", "f1"]);

        assert_eq!(a.request_hash(), b.request_hash());
    }

    #[test]
    fn test_search_hash_distinguishes_targets() {
        let a = SolutionSearchRequest::new("baseball", "hits");
        let b = SolutionSearchRequest::new("baseball", "runs");
        assert_ne!(a.request_hash(), b.request_hash());
    }

    #[test]
    fn test_search_and_stop_hashes_never_collide_by_shape() {
        let id = RequestId::new();
        let stop = StopSolutionSearchRequest::new(id);
        let search = SolutionSearchRequest::new(id.to_string(), "");
        assert_ne!(stop.request_hash(), search.request_hash());
    }

    #[test]
    fn test_search_from_json_applies_defaults() {
        let body = br#"{"dataset":"baseball","targetFeature":"hits","features":["age"]}"#;
        let request = SolutionSearchRequest::from_json(body).unwrap();

        assert_eq!(request.dataset, "baseball");
        assert_eq!(request.target_feature, "hits");
        assert_eq!(request.features, vec!["age".to_string()]);
        assert_eq!(request.max_solutions, 5);
        assert_eq!(request.max_time, 600);
        assert!(request.filters.is_null());
    }

    #[test]
    fn test_stop_from_json() {
        let id = RequestId::new();
        let body = format!(r#"{{"requestId":"{id}"}}"#);
        let request = StopSolutionSearchRequest::from_json(body.as_bytes()).unwrap();
        assert_eq!(request.request_id, id);

        assert!(StopSolutionSearchRequest::from_json(b"{}").is_err());
    }

    #[test]
    fn test_status_serializes_progress_in_caps() {
        let status = SolutionStatus::new(RequestId::new(), "s1", SolutionProgress::Running)
            .with_score("f1", 0.5);
        let json = serde_json::to_value(&status).unwrap();

        assert_eq!(json["progress"], "RUNNING");
        assert_eq!(json["solutionId"], "s1");
        assert_eq!(json["scores"][0]["metric"], "f1");
        assert!(json.get("resultId").is_none());
        assert!(SolutionProgress::Completed.is_terminal());
        assert!(!SolutionProgress::Running.is_terminal());
    }
}
