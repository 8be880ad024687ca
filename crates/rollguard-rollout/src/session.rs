//! Monitoring session — the state machine behind one post-deploy
//! validation window.
//!
//! A session starts `running` and ends in exactly one of `succeeded`,
//! `rolled_back`, or `aborted`. It never performs more than `total_checks`
//! ticks and ignores every tick after it has ended.

use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use rollguard_state::{
    Deployment, HealthStatus, RollbackSettings, SessionRecord, SessionStatus,
};

use crate::policy::CHECK_INTERVAL_SECS;

/// What made a session roll back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackReason {
    /// Consecutive unhealthy checks reached the threshold.
    HealthCheckFailed,
    /// Restarts exceeded `rollback_max_restarts`.
    CrashLoop,
}

impl fmt::Display for RollbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HealthCheckFailed => f.write_str("health_check_failed"),
            Self::CrashLoop => f.write_str("crash_loop"),
        }
    }
}

/// Why a session ended without a verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AbortReason {
    /// A newer deployment of the application started.
    Superseded,
    /// An operator turned auto-rollback off mid-session.
    AutoRollbackDisabled,
    /// Stopped from outside (manual stop, application removed, shutdown).
    Cancelled,
    /// The monitored deployment disappeared from the store.
    DeploymentMissing,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Superseded => f.write_str("superseded"),
            Self::AutoRollbackDisabled => f.write_str("auto_rollback_disabled"),
            Self::Cancelled => f.write_str("cancelled"),
            Self::DeploymentMissing => f.write_str("deployment_missing"),
        }
    }
}

/// Observations gathered for one tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TickInput {
    pub verdict: HealthStatus,
    /// Restarts since the deployment started, when known.
    pub restart_count: Option<u32>,
    /// Unix timestamp of the check.
    pub at: u64,
}

/// Result of feeding a tick into a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// Keep polling.
    Continue,
    /// The validation window passed without a rollback trigger.
    Succeeded,
    /// A rollback trigger fired; the caller must run the rollback.
    Rollback(RollbackReason),
    /// The session had already ended; the tick was ignored.
    Finished,
}

/// Runtime state of one active monitoring session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitoringSession {
    application_id: String,
    deployment_id: String,
    rollback_target: String,
    check_interval_secs: u64,
    total_checks: u32,
    checks_performed: u32,
    consecutive_failures: u32,
    status: SessionStatus,
    rollback_reason: Option<RollbackReason>,
    abort_reason: Option<AbortReason>,
    rollback_succeeded: Option<bool>,
    started_at: u64,
    last_check_at: Option<u64>,
    finished_at: Option<u64>,
}

impl MonitoringSession {
    /// Start a session for `deployment` that rolls back to `rollback_target`.
    pub fn new(deployment: &Deployment, rollback_target: &str, total_checks: u32, now: u64) -> Self {
        Self {
            application_id: deployment.application_id.clone(),
            deployment_id: deployment.id.clone(),
            rollback_target: rollback_target.to_string(),
            check_interval_secs: CHECK_INTERVAL_SECS,
            total_checks: total_checks.max(1),
            checks_performed: 0,
            consecutive_failures: 0,
            status: SessionStatus::Running,
            rollback_reason: None,
            abort_reason: None,
            rollback_succeeded: None,
            started_at: now,
            last_check_at: None,
            finished_at: None,
        }
    }

    /// Feed the result of one health check into the session.
    pub fn record_tick(
        &mut self,
        input: TickInput,
        settings: &RollbackSettings,
        failure_threshold: u32,
    ) -> TickOutcome {
        if self.status.is_terminal() {
            return TickOutcome::Finished;
        }

        self.checks_performed += 1;
        self.last_check_at = Some(input.at);

        if settings.rollback_on_crash_loop
            && input
                .restart_count
                .is_some_and(|restarts| restarts > settings.rollback_max_restarts)
        {
            warn!(
                application_id = %self.application_id,
                deployment_id = %self.deployment_id,
                restarts = ?input.restart_count,
                max = settings.rollback_max_restarts,
                "crash loop detected"
            );
            return self.begin_rollback(RollbackReason::CrashLoop, input.at);
        }

        match input.verdict {
            HealthStatus::Healthy => {
                self.consecutive_failures = 0;
            }
            HealthStatus::Unhealthy => {
                self.consecutive_failures += 1;
                debug!(
                    application_id = %self.application_id,
                    failures = self.consecutive_failures,
                    threshold = failure_threshold,
                    "unhealthy check"
                );
                if settings.rollback_on_health_check_fail
                    && self.consecutive_failures >= failure_threshold.max(1)
                {
                    return self.begin_rollback(RollbackReason::HealthCheckFailed, input.at);
                }
            }
            HealthStatus::Unknown => {}
        }

        if self.checks_performed >= self.total_checks {
            self.status = SessionStatus::Succeeded;
            self.finished_at = Some(input.at);
            info!(
                application_id = %self.application_id,
                deployment_id = %self.deployment_id,
                checks = self.checks_performed,
                "validation window passed"
            );
            return TickOutcome::Succeeded;
        }

        TickOutcome::Continue
    }

    fn begin_rollback(&mut self, reason: RollbackReason, at: u64) -> TickOutcome {
        self.status = SessionStatus::RolledBack;
        self.rollback_reason = Some(reason);
        self.finished_at = Some(at);
        TickOutcome::Rollback(reason)
    }

    /// Record whether the rollback call went through.
    pub fn record_rollback_result(&mut self, succeeded: bool) {
        if self.status == SessionStatus::RolledBack {
            self.rollback_succeeded = Some(succeeded);
        }
    }

    /// End a running session without a verdict. Returns false when the
    /// session had already ended.
    pub fn abort(&mut self, reason: AbortReason, now: u64) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.status = SessionStatus::Aborted;
        self.abort_reason = Some(reason);
        self.finished_at = Some(now);
        true
    }

    pub fn application_id(&self) -> &str {
        &self.application_id
    }

    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    pub fn rollback_target(&self) -> &str {
        &self.rollback_target
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn total_checks(&self) -> u32 {
        self.total_checks
    }

    pub fn checks_performed(&self) -> u32 {
        self.checks_performed
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn rollback_reason(&self) -> Option<RollbackReason> {
        self.rollback_reason
    }

    pub fn abort_reason(&self) -> Option<AbortReason> {
        self.abort_reason
    }

    pub fn rollback_succeeded(&self) -> Option<bool> {
        self.rollback_succeeded
    }

    /// Reason string for the archive and notifications.
    pub fn reason(&self) -> Option<String> {
        self.rollback_reason
            .map(|r| r.to_string())
            .or_else(|| self.abort_reason.map(|r| r.to_string()))
    }

    /// Snapshot for the session archive.
    pub fn to_record(&self) -> SessionRecord {
        SessionRecord {
            application_id: self.application_id.clone(),
            deployment_id: self.deployment_id.clone(),
            rollback_target: self.rollback_target.clone(),
            status: self.status,
            reason: self.reason(),
            total_checks: self.total_checks,
            checks_performed: self.checks_performed,
            consecutive_failures: self.consecutive_failures,
            rollback_succeeded: self.rollback_succeeded,
            started_at: self.started_at,
            finished_at: self.finished_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollguard_state::DeploymentStatus;

    fn deployment() -> Deployment {
        Deployment {
            id: "d2".to_string(),
            application_id: "app".to_string(),
            status: DeploymentStatus::Finished,
            is_rollback: false,
            pull_request_id: None,
            commit: None,
            created_at: 2000,
            updated_at: 2100,
        }
    }

    fn settings() -> RollbackSettings {
        RollbackSettings {
            auto_rollback_enabled: true,
            ..Default::default()
        }
    }

    fn tick(verdict: HealthStatus, at: u64) -> TickInput {
        TickInput {
            verdict,
            restart_count: Some(0),
            at,
        }
    }

    fn session(total: u32) -> MonitoringSession {
        MonitoringSession::new(&deployment(), "d1", total, 1000)
    }

    #[test]
    fn new_session_is_running() {
        let s = session(10);
        assert_eq!(s.status(), SessionStatus::Running);
        assert_eq!(s.checks_performed(), 0);
        assert_eq!(s.rollback_target(), "d1");
    }

    #[test]
    fn all_healthy_checks_succeed() {
        let mut s = session(10);
        for i in 0..9 {
            assert_eq!(s.record_tick(tick(HealthStatus::Healthy, 1030 + i), &settings(), 3), TickOutcome::Continue);
        }
        assert_eq!(s.record_tick(tick(HealthStatus::Healthy, 1300), &settings(), 3), TickOutcome::Succeeded);
        assert_eq!(s.status(), SessionStatus::Succeeded);
        assert_eq!(s.checks_performed(), 10);
    }

    #[test]
    fn three_unhealthy_checks_roll_back() {
        let mut s = session(10);
        s.record_tick(tick(HealthStatus::Healthy, 1030), &settings(), 3);
        assert_eq!(s.record_tick(tick(HealthStatus::Unhealthy, 1060), &settings(), 3), TickOutcome::Continue);
        assert_eq!(s.record_tick(tick(HealthStatus::Unhealthy, 1090), &settings(), 3), TickOutcome::Continue);
        assert_eq!(
            s.record_tick(tick(HealthStatus::Unhealthy, 1120), &settings(), 3),
            TickOutcome::Rollback(RollbackReason::HealthCheckFailed)
        );
        assert_eq!(s.status(), SessionStatus::RolledBack);
        assert_eq!(s.consecutive_failures(), 3);
    }

    #[test]
    fn healthy_check_resets_failure_streak() {
        let mut s = session(10);
        s.record_tick(tick(HealthStatus::Unhealthy, 1030), &settings(), 3);
        s.record_tick(tick(HealthStatus::Unhealthy, 1060), &settings(), 3);
        s.record_tick(tick(HealthStatus::Healthy, 1090), &settings(), 3);
        assert_eq!(s.consecutive_failures(), 0);
        assert_eq!(s.record_tick(tick(HealthStatus::Unhealthy, 1120), &settings(), 3), TickOutcome::Continue);
        assert_eq!(s.status(), SessionStatus::Running);
    }

    #[test]
    fn unknown_never_rolls_back() {
        let mut s = session(50);
        for i in 0..49 {
            let outcome = s.record_tick(tick(HealthStatus::Unknown, 1000 + i), &settings(), 1);
            assert_eq!(outcome, TickOutcome::Continue);
            assert_eq!(s.consecutive_failures(), 0);
        }
        assert_eq!(s.record_tick(tick(HealthStatus::Unknown, 2000), &settings(), 1), TickOutcome::Succeeded);
    }

    #[test]
    fn unknown_does_not_break_failure_streak() {
        let mut s = session(10);
        s.record_tick(tick(HealthStatus::Unhealthy, 1030), &settings(), 3);
        s.record_tick(tick(HealthStatus::Unknown, 1060), &settings(), 3);
        s.record_tick(tick(HealthStatus::Unhealthy, 1090), &settings(), 3);
        assert_eq!(s.consecutive_failures(), 2);
        assert_eq!(s.checks_performed(), 3);
    }

    #[test]
    fn unhealthy_ignored_when_health_rollback_disabled() {
        let mut s = session(4);
        let settings = RollbackSettings {
            rollback_on_health_check_fail: false,
            ..settings()
        };
        for i in 0..3 {
            assert_eq!(s.record_tick(tick(HealthStatus::Unhealthy, 1000 + i), &settings, 1), TickOutcome::Continue);
        }
        assert_eq!(s.record_tick(tick(HealthStatus::Unhealthy, 1100), &settings, 1), TickOutcome::Succeeded);
    }

    #[test]
    fn crash_loop_rolls_back_immediately() {
        let mut s = session(10);
        let input = TickInput {
            verdict: HealthStatus::Healthy,
            restart_count: Some(6),
            at: 1030,
        };
        assert_eq!(s.record_tick(input, &settings(), 3), TickOutcome::Rollback(RollbackReason::CrashLoop));
        assert_eq!(s.checks_performed(), 1);
        assert_eq!(s.reason().as_deref(), Some("crash_loop"));
    }

    #[test]
    fn restarts_at_threshold_are_tolerated() {
        let mut s = session(10);
        let input = TickInput {
            verdict: HealthStatus::Healthy,
            restart_count: Some(5),
            at: 1030,
        };
        assert_eq!(s.record_tick(input, &settings(), 3), TickOutcome::Continue);
    }

    #[test]
    fn crash_loop_ignored_when_disabled() {
        let mut s = session(10);
        let settings = RollbackSettings {
            rollback_on_crash_loop: false,
            ..settings()
        };
        let input = TickInput {
            verdict: HealthStatus::Healthy,
            restart_count: Some(100),
            at: 1030,
        };
        assert_eq!(s.record_tick(input, &settings, 3), TickOutcome::Continue);
    }

    #[test]
    fn never_exceeds_budget() {
        let mut s = session(3);
        let mut ticks = 0;
        loop {
            ticks += 1;
            if s.record_tick(tick(HealthStatus::Unknown, 1000 + ticks), &settings(), 3) != TickOutcome::Continue {
                break;
            }
        }
        assert_eq!(ticks, 3);
        assert!(s.checks_performed() <= s.total_checks());
    }

    #[test]
    fn terminal_session_ignores_ticks() {
        let mut s = session(1);
        assert_eq!(s.record_tick(tick(HealthStatus::Healthy, 1030), &settings(), 3), TickOutcome::Succeeded);
        assert_eq!(s.record_tick(tick(HealthStatus::Unhealthy, 1060), &settings(), 3), TickOutcome::Finished);
        assert_eq!(s.checks_performed(), 1);
        assert_eq!(s.status(), SessionStatus::Succeeded);
    }

    #[test]
    fn abort_is_one_way() {
        let mut s = session(10);
        assert!(s.abort(AbortReason::Superseded, 1100));
        assert!(!s.abort(AbortReason::Cancelled, 1200));
        assert_eq!(s.abort_reason(), Some(AbortReason::Superseded));
        assert_eq!(s.record_tick(tick(HealthStatus::Healthy, 1300), &settings(), 3), TickOutcome::Finished);
        assert_eq!(s.checks_performed(), 0);
    }

    #[test]
    fn finished_session_cannot_be_aborted() {
        let mut s = session(1);
        s.record_tick(tick(HealthStatus::Healthy, 1030), &settings(), 3);
        assert!(!s.abort(AbortReason::Cancelled, 1100));
        assert_eq!(s.status(), SessionStatus::Succeeded);
    }

    #[test]
    fn record_carries_rollback_context() {
        let mut s = session(10);
        for at in [1030, 1060, 1090] {
            s.record_tick(tick(HealthStatus::Unhealthy, at), &settings(), 3);
        }
        s.record_rollback_result(false);

        let record = s.to_record();
        assert_eq!(record.status, SessionStatus::RolledBack);
        assert_eq!(record.reason.as_deref(), Some("health_check_failed"));
        assert_eq!(record.rollback_target, "d1");
        assert_eq!(record.checks_performed, 3);
        assert_eq!(record.rollback_succeeded, Some(false));
        assert_eq!(record.finished_at, Some(1090));
    }
}
