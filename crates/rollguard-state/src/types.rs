//! Domain types for the rollguard state store.
//!
//! These types represent the persisted state of deployments, rollback
//! settings, instances, and archived monitoring sessions. All types are
//! serializable to/from JSON for storage in redb tables.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a deployment attempt.
pub type DeploymentId = String;

/// Opaque identifier of an application.
pub type ApplicationId = String;

/// Unique identifier for an instance within a deployment.
pub type InstanceId = String;

/// Validation window assumed when none (or zero) is configured.
pub const DEFAULT_VALIDATION_SECS: u64 = 300;

// ── Deployment ─────────────────────────────────────────────────────

/// Pipeline status of a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Queued,
    InProgress,
    Finished,
    Failed,
    Cancelled,
}

impl DeploymentStatus {
    /// Whether the pipeline is done with this deployment.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Finished | Self::Failed | Self::Cancelled)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::InProgress => 1,
            Self::Finished | Self::Failed | Self::Cancelled => 2,
        }
    }

    /// Whether a report may move a deployment from `self` to `next`.
    ///
    /// Status only advances: terminal states are final and an in-progress
    /// deployment never goes back to queued.
    pub fn can_transition_to(self, next: DeploymentStatus) -> bool {
        if self == next {
            return true;
        }
        if self.is_terminal() {
            return false;
        }
        next.rank() >= self.rank()
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Queued => "queued",
            Self::InProgress => "in_progress",
            Self::Finished => "finished",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// One deploy attempt for an application, as reported by the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Deployment {
    pub id: DeploymentId,
    pub application_id: ApplicationId,
    pub status: DeploymentStatus,
    /// True when this deployment is itself a rollback action.
    #[serde(default)]
    pub is_rollback: bool,
    /// Pull request this preview deployment belongs to. Absent or `<= 0`
    /// means a regular deployment.
    #[serde(default)]
    pub pull_request_id: Option<i64>,
    /// Commit reference the deployment was built from.
    #[serde(default)]
    pub commit: Option<String>,
    /// Unix timestamp (seconds) when the deployment was requested.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
}

impl Deployment {
    /// Build the composite key for the deployments table.
    pub fn table_key(&self) -> String {
        deployment_key(&self.application_id, &self.id)
    }

    /// Whether this is a pull request preview deployment.
    pub fn is_pull_request(&self) -> bool {
        self.pull_request_id.is_some_and(|id| id > 0)
    }

    /// Whether `self` was requested after `other`. Ties on `created_at`
    /// are broken by id so ordering is total.
    pub fn is_newer_than(&self, other: &Deployment) -> bool {
        (self.created_at, self.id.as_str()) > (other.created_at, other.id.as_str())
    }

    /// Whether `self` makes monitoring of `other` stale: a newer release
    /// that is neither cancelled nor a pull request preview.
    pub fn supersedes(&self, other: &Deployment) -> bool {
        self.status != DeploymentStatus::Cancelled
            && !self.is_pull_request()
            && self.is_newer_than(other)
    }
}

/// Composite deployments-table key for an application's deployment.
pub fn deployment_key(application_id: &str, deployment_id: &str) -> String {
    format!("{application_id}/{deployment_id}")
}

/// Composite instances-table key. Shares the deployment key as its prefix.
pub fn instance_key(application_id: &str, deployment_id: &str, instance_id: &str) -> String {
    format!("{}:{instance_id}", deployment_key(application_id, deployment_id))
}

/// Composite sessions-table key for an application's deployment.
pub fn session_key(application_id: &str, deployment_id: &str) -> String {
    format!("{application_id}:{deployment_id}")
}

/// Key separators; application and deployment ids must not contain them.
pub const KEY_SEPARATORS: [char; 2] = ['/', ':'];

/// Whether `id` can be used as an application or deployment key segment.
pub fn is_valid_key_segment(id: &str) -> bool {
    !id.is_empty() && !id.contains(KEY_SEPARATORS)
}

// ── Settings ───────────────────────────────────────────────────────

/// Per-application auto-rollback configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RollbackSettings {
    pub auto_rollback_enabled: bool,
    /// Length of the validation window in seconds. Zero means the default.
    pub rollback_validation_seconds: u64,
    pub rollback_on_health_check_fail: bool,
    pub rollback_on_crash_loop: bool,
    /// Restart count above which the application is considered crash looping.
    pub rollback_max_restarts: u32,
}

impl Default for RollbackSettings {
    fn default() -> Self {
        Self {
            auto_rollback_enabled: false,
            rollback_validation_seconds: DEFAULT_VALIDATION_SECS,
            rollback_on_health_check_fail: true,
            rollback_on_crash_loop: true,
            rollback_max_restarts: 5,
        }
    }
}

impl RollbackSettings {
    /// Apply defaults for values that are present but unusable.
    pub fn normalized(mut self) -> Self {
        if self.rollback_validation_seconds == 0 {
            self.rollback_validation_seconds = DEFAULT_VALIDATION_SECS;
        }
        self
    }
}

// ── Instance ──────────────────────────────────────────────────────

/// Runtime state of one container/process serving a deployment.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceState {
    pub id: InstanceId,
    pub application_id: ApplicationId,
    pub deployment_id: DeploymentId,
    /// Listen address (ip:port) the health probe targets.
    pub address: String,
    pub status: InstanceStatus,
    /// Restarts observed since the deployment started.
    #[serde(default)]
    pub restart_count: u32,
    /// Unix timestamp when this instance started.
    pub started_at: u64,
    /// Unix timestamp of last status change.
    pub updated_at: u64,
}

impl InstanceState {
    /// Build the composite key for the instances table.
    pub fn table_key(&self) -> String {
        instance_key(&self.application_id, &self.deployment_id, &self.id)
    }
}

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Running,
    Restarting,
    Stopped,
}

/// Health verdict for a deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

// ── Sessions ──────────────────────────────────────────────────────

/// Lifecycle of a monitoring session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Succeeded,
    RolledBack,
    Aborted,
}

impl SessionStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Running
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::RolledBack => "rolled_back",
            Self::Aborted => "aborted",
        };
        f.write_str(s)
    }
}

/// Archived outcome of one monitoring session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub application_id: ApplicationId,
    pub deployment_id: DeploymentId,
    /// Deployment the session would roll back to.
    pub rollback_target: DeploymentId,
    pub status: SessionStatus,
    /// Why the session ended, e.g. `crash_loop` or `superseded`.
    pub reason: Option<String>,
    pub total_checks: u32,
    pub checks_performed: u32,
    pub consecutive_failures: u32,
    /// Set once a rollback was attempted.
    pub rollback_succeeded: Option<bool>,
    pub started_at: u64,
    pub finished_at: Option<u64>,
}

impl SessionRecord {
    /// Build the composite key for the sessions table.
    pub fn table_key(&self) -> String {
        session_key(&self.application_id, &self.deployment_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_only_advances() {
        use DeploymentStatus::*;
        assert!(Queued.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Finished));
        assert!(Queued.can_transition_to(Cancelled));
        assert!(Finished.can_transition_to(Finished));
        assert!(!InProgress.can_transition_to(Queued));
        assert!(!Finished.can_transition_to(InProgress));
        assert!(!Failed.can_transition_to(Finished));
    }

    #[test]
    fn pull_request_detection() {
        let mut d = Deployment {
            id: "d1".to_string(),
            application_id: "app".to_string(),
            status: DeploymentStatus::Finished,
            is_rollback: false,
            pull_request_id: None,
            commit: None,
            created_at: 1,
            updated_at: 1,
        };
        assert!(!d.is_pull_request());
        d.pull_request_id = Some(0);
        assert!(!d.is_pull_request());
        d.pull_request_id = Some(-3);
        assert!(!d.is_pull_request());
        d.pull_request_id = Some(42);
        assert!(d.is_pull_request());
    }

    #[test]
    fn only_newer_live_releases_supersede() {
        let current = Deployment {
            id: "d1".to_string(),
            application_id: "app".to_string(),
            status: DeploymentStatus::Finished,
            is_rollback: false,
            pull_request_id: None,
            commit: None,
            created_at: 1000,
            updated_at: 1000,
        };
        let mut next = Deployment {
            id: "d2".to_string(),
            created_at: 2000,
            status: DeploymentStatus::Queued,
            ..current.clone()
        };
        assert!(next.supersedes(&current));
        assert!(!current.supersedes(&next));

        next.pull_request_id = Some(5);
        assert!(!next.supersedes(&current));
        next.pull_request_id = None;
        next.status = DeploymentStatus::Cancelled;
        assert!(!next.supersedes(&current));
    }

    #[test]
    fn settings_defaults_apply_to_partial_json() {
        let s: RollbackSettings =
            serde_json::from_str(r#"{"auto_rollback_enabled": true}"#).unwrap();
        assert!(s.auto_rollback_enabled);
        assert_eq!(s.rollback_validation_seconds, DEFAULT_VALIDATION_SECS);
        assert!(s.rollback_on_health_check_fail);
    }

    #[test]
    fn zero_validation_window_normalizes_to_default() {
        let s = RollbackSettings {
            rollback_validation_seconds: 0,
            ..Default::default()
        }
        .normalized();
        assert_eq!(s.rollback_validation_seconds, DEFAULT_VALIDATION_SECS);
    }

    #[test]
    fn key_segments_reject_separators() {
        assert!(is_valid_key_segment("web-prod"));
        assert!(!is_valid_key_segment(""));
        assert!(!is_valid_key_segment("team/web"));
        assert!(!is_valid_key_segment("web:1"));
    }

    #[test]
    fn instance_key_nests_under_deployment_key() {
        let key = instance_key("api", "1", "i-0");
        assert_eq!(key, "api/1:i-0");
        assert!(key.starts_with(&deployment_key("api", "1")));
        assert_eq!(session_key("api", "1"), "api:1");
    }

    #[test]
    fn deployment_status_wire_format() {
        let json = serde_json::to_string(&DeploymentStatus::InProgress).unwrap();
        assert_eq!(json, "\"in_progress\"");
    }
}
