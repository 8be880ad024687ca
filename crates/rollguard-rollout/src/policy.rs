//! Rollback decision policy — which finished deployments get monitored,
//! and for how many checks.

use std::time::Duration;

use rollguard_state::{DEFAULT_VALIDATION_SECS, Deployment, DeploymentStatus, RollbackSettings};

/// Seconds between two health checks of a session.
pub const CHECK_INTERVAL_SECS: u64 = 30;

/// Consecutive unhealthy checks that trigger a rollback unless configured.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Decide whether a deployment should enter health monitoring.
///
/// Only a `finished` deployment of an application with auto-rollback
/// enabled qualifies, and never a pull request preview or a deployment that
/// is itself a rollback (otherwise a rollback could trigger another one).
/// Absent settings mean the feature is off.
pub fn should_monitor(deployment: &Deployment, settings: Option<&RollbackSettings>) -> bool {
    if deployment.status != DeploymentStatus::Finished {
        return false;
    }
    let Some(settings) = settings else {
        return false;
    };
    settings.auto_rollback_enabled && !deployment.is_pull_request() && !deployment.is_rollback
}

/// Number of checks needed to cover the validation window, at least one.
pub fn compute_check_budget(settings: &RollbackSettings) -> u32 {
    let validation_secs = match settings.rollback_validation_seconds {
        0 => DEFAULT_VALIDATION_SECS,
        secs => secs,
    };
    let checks = validation_secs.div_ceil(CHECK_INTERVAL_SECS).max(1);
    u32::try_from(checks).unwrap_or(u32::MAX)
}

/// Tunables of the monitor loop that are not per-application settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorOptions {
    /// Consecutive unhealthy checks before a health-check rollback.
    pub failure_threshold: u32,
    /// Upper bound on a single health probe.
    pub probe_timeout: Duration,
    /// Upper bound on a rollback call.
    pub rollback_timeout: Duration,
}

impl Default for MonitorOptions {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            probe_timeout: Duration::from_secs(10),
            rollback_timeout: Duration::from_secs(60),
        }
    }
}

impl MonitorOptions {
    /// Failure threshold clamped to at least one failure.
    pub fn effective_failure_threshold(&self) -> u32 {
        self.failure_threshold.max(1)
    }
}
