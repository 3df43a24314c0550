use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::sampler::ResourceSample;

/// Lifecycle status of a supervised service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Healthy,
    Stopping,
    Crashed,
    Failed,
}

impl ServiceStatus {
    /// A terminal status means the supervisor regards the service as
    /// not currently running.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ServiceStatus::Stopped | ServiceStatus::Crashed | ServiceStatus::Failed
        )
    }

    /// Live in the sense of "has (or is acquiring) a child process".
    pub fn is_live(self) -> bool {
        matches!(
            self,
            ServiceStatus::Starting | ServiceStatus::Running | ServiceStatus::Healthy
        )
    }

    /// Satisfies a `started` dependency wait.
    pub fn is_up(self) -> bool {
        matches!(self, ServiceStatus::Running | ServiceStatus::Healthy)
    }
}

impl std::fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Healthy => "healthy",
            ServiceStatus::Stopping => "stopping",
            ServiceStatus::Crashed => "crashed",
            ServiceStatus::Failed => "failed",
        };
        write!(f, "{name}")
    }
}

/// Mutable runtime state for one service. Owned by the supervisor;
/// observers get clones.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceState {
    pub status: ServiceStatus,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    /// Monotonic across policy-driven restarts; resets only when a
    /// reload replaces the service definition.
    pub restart_count: u32,
    pub last_error: Option<String>,
    pub resources: Option<ResourceSample>,
}

impl Default for ServiceState {
    fn default() -> Self {
        Self {
            status: ServiceStatus::Stopped,
            pid: None,
            started_at: None,
            stopped_at: None,
            exit_code: None,
            restart_count: 0,
            last_error: None,
            resources: None,
        }
    }
}
