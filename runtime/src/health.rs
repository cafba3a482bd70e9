//! Health of a dispatch client.
//!
//! A [`HealthReport`] is a point-in-time snapshot: how many requests are
//! running, and which ones were abandoned by the stall timeout.

use chrono::{DateTime, Utc};
use solution_dispatch_core::RequestId;

/// Health check status levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum HealthStatus {
    /// Accepting requests, nothing stalled
    Healthy,

    /// Accepting requests, but some stalled or too many are pending
    Degraded,

    /// Closed
    Unhealthy,
}

impl HealthStatus {
    /// Check if status is healthy
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Healthy)
    }

    /// Check if status is degraded
    #[must_use]
    pub const fn is_degraded(self) -> bool {
        matches!(self, Self::Degraded)
    }

    /// Check if status is unhealthy
    #[must_use]
    pub const fn is_unhealthy(self) -> bool {
        matches!(self, Self::Unhealthy)
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Healthy => write!(f, "healthy"),
            Self::Degraded => write!(f, "degraded"),
            Self::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// A retained request that ended through the stall timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StalledRequest {
    /// The abandoned request
    pub request_id: RequestId,
    /// Results it produced before going silent
    pub results: usize,
}

/// Snapshot of a dispatch client's health.
#[derive(Debug, Clone)]
pub struct HealthReport {
    /// Overall status
    pub status: HealthStatus,

    /// Why the status is not healthy
    pub message: Option<String>,

    /// Compute service the client talks to
    pub server_addr: String,

    /// Running requests
    pub pending: usize,

    /// Completed requests still retained
    pub completed: usize,

    /// Observers attached across all running requests
    pub observers: usize,

    /// Requests that have stalled since the client started
    pub stalled_total: usize,

    /// Stalled requests that are still retained
    pub stalled: Vec<StalledRequest>,

    /// When the snapshot was taken
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    /// Check if overall status is healthy
    #[must_use]
    pub const fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    /// Whether `request_id` is listed as stalled.
    #[must_use]
    pub fn is_stalled(&self, request_id: RequestId) -> bool {
        self.stalled
            .iter()
            .any(|stalled| stalled.request_id == request_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_status_ordering() {
        assert!(HealthStatus::Healthy < HealthStatus::Degraded);
        assert!(HealthStatus::Degraded < HealthStatus::Unhealthy);
    }

    #[test]
    fn test_health_status_display() {
        assert_eq!(format!("{}", HealthStatus::Healthy), "healthy");
        assert_eq!(format!("{}", HealthStatus::Degraded), "degraded");
        assert_eq!(format!("{}", HealthStatus::Unhealthy), "unhealthy");
    }
}
