//! Health monitor — background task that validates a deployment after it
//! finishes and rolls it back on sustained failure.
//!
//! The `HealthMonitor` keeps an arena of active sessions keyed by
//! application id. Starting a session is an atomic check-and-insert under
//! the arena lock, so an application never has two live sessions; a newer
//! deployment aborts the stale session as part of starting its own.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{RwLock, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rollguard_rollout::{
    AbortReason, CHECK_INTERVAL_SECS, HealthProbe, MonitorOptions, MonitoringSession, Notification,
    NotificationContext, NotificationLevel, NotificationSink, RollbackError, RollbackExecutor,
    RollbackReason, TickInput, TickOutcome, compute_check_budget, should_monitor,
};
use rollguard_state::{
    Deployment, DeploymentStatus, HealthStatus, RollbackSettings, SessionStatus, StateStore,
};

use crate::notify::TracingNotifier;

/// Why a finished deployment was not monitored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    NotFinished,
    AutoRollbackDisabled,
    PullRequest,
    RollbackDeployment,
    /// No earlier finished deployment to roll back to.
    NoRollbackTarget,
    /// A newer deployment of the application already exists.
    Superseded,
    StoreUnavailable,
}

/// Outcome of `HealthMonitor::on_deployment_finished`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum MonitorDecision {
    Skipped { reason: SkipReason },
    AlreadyMonitoring,
    Started { total_checks: u32, rollback_target: String },
}

/// Per-application session slot.
struct SessionSlot {
    /// Distinguishes this slot from a later one for the same application.
    slot_id: u64,
    deployment: Deployment,
    /// Abort signal for the session task.
    shutdown_tx: watch::Sender<Option<AbortReason>>,
    /// Handle to the background session task.
    handle: JoinHandle<()>,
    /// Latest session state published by the task.
    progress: watch::Receiver<MonitoringSession>,
}

/// Runs post-deploy monitoring sessions for all applications.
#[derive(Clone)]
pub struct HealthMonitor {
    state: StateStore,
    probe: Arc<dyn HealthProbe>,
    rollback: Arc<dyn RollbackExecutor>,
    notifier: Arc<dyn NotificationSink>,
    options: MonitorOptions,
    /// Active sessions: application_id → slot.
    sessions: Arc<RwLock<HashMap<String, SessionSlot>>>,
    next_slot: Arc<AtomicU64>,
}

impl HealthMonitor {
    /// Create a monitor with default options and a tracing notifier.
    pub fn new(
        state: StateStore,
        probe: Arc<dyn HealthProbe>,
        rollback: Arc<dyn RollbackExecutor>,
    ) -> Self {
        Self {
            state,
            probe,
            rollback,
            notifier: Arc::new(TracingNotifier),
            options: MonitorOptions::default(),
            sessions: Arc::new(RwLock::new(HashMap::new())),
            next_slot: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Set the notification sink.
    pub fn with_notifier(mut self, notifier: Arc<dyn NotificationSink>) -> Self {
        self.notifier = notifier;
        self
    }

    /// Set loop options (failure threshold, timeouts).
    pub fn with_options(mut self, options: MonitorOptions) -> Self {
        self.options = options;
        self
    }

    /// Entry point for a deployment that reached a terminal state.
    ///
    /// Applies the rollback policy and, when it approves, starts a session
    /// for the deployment's application, aborting a stale one if present.
    pub async fn on_deployment_finished(&self, deployment: &Deployment) -> MonitorDecision {
        let app = deployment.application_id.as_str();

        if deployment.status != DeploymentStatus::Finished {
            return skipped(SkipReason::NotFinished);
        }

        let settings = match self.state.get_settings(app) {
            Ok(settings) => settings,
            Err(e) => {
                warn!(application_id = %app, error = %e, "failed to read rollback settings");
                return skipped(SkipReason::StoreUnavailable);
            }
        };

        if !should_monitor(deployment, Some(&settings)) {
            let reason = skip_reason(deployment, &settings);
            debug!(application_id = %app, deployment_id = %deployment.id, ?reason, "monitoring skipped");
            return skipped(reason);
        }

        match self.state.has_newer_deployment(app, deployment) {
            Ok(true) => {
                debug!(application_id = %app, deployment_id = %deployment.id, "finished behind a newer deployment");
                return skipped(SkipReason::Superseded);
            }
            Ok(false) => {}
            Err(e) => warn!(application_id = %app, error = %e, "staleness check failed"),
        }

        let target = match self.state.previous_successful_deployment(app, deployment) {
            Ok(Some(target)) => target,
            Ok(None) => {
                self.notifier.notify(Notification {
                    level: NotificationLevel::Info,
                    message: "no earlier deployment to roll back to, monitoring skipped".to_string(),
                    context: NotificationContext {
                        application_id: app.to_string(),
                        deployment_id: deployment.id.clone(),
                        reason: Some("no_rollback_target".to_string()),
                        ..Default::default()
                    },
                });
                return skipped(SkipReason::NoRollbackTarget);
            }
            Err(e) => {
                warn!(application_id = %app, error = %e, "failed to resolve rollback target");
                return skipped(SkipReason::StoreUnavailable);
            }
        };

        let total_checks = compute_check_budget(&settings);
        let mut sessions = self.sessions.write().await;

        if let Some(existing) = sessions.get(app)
            && !existing.handle.is_finished()
        {
            if existing.deployment.id == deployment.id {
                return MonitorDecision::AlreadyMonitoring;
            }
            if existing.deployment.is_newer_than(deployment) {
                debug!(
                    application_id = %app,
                    deployment_id = %deployment.id,
                    active = %existing.deployment.id,
                    "older deployment finished late"
                );
                return skipped(SkipReason::Superseded);
            }
        }

        if let Some(stale) = sessions.remove(app) {
            info!(
                application_id = %app,
                stale = %stale.deployment.id,
                deployment_id = %deployment.id,
                "superseding active session"
            );
            let _ = stale.shutdown_tx.send(Some(AbortReason::Superseded));
        }

        let slot_id = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let session = MonitoringSession::new(deployment, &target.id, total_checks, epoch_secs());
        let (shutdown_tx, shutdown_rx) = watch::channel(None);
        let (progress_tx, progress_rx) = watch::channel(session.clone());

        let monitor = self.clone();
        let deployment_owned = deployment.clone();
        let handle = tokio::spawn(async move {
            monitor
                .run_session(slot_id, deployment_owned, session, settings, shutdown_rx, progress_tx)
                .await;
        });

        sessions.insert(
            app.to_string(),
            SessionSlot {
                slot_id,
                deployment: deployment.clone(),
                shutdown_tx,
                handle,
                progress: progress_rx,
            },
        );
        drop(sessions);

        self.notifier.notify(Notification {
            level: NotificationLevel::Info,
            message: format!("monitoring deployment health for {total_checks} checks"),
            context: NotificationContext {
                application_id: app.to_string(),
                deployment_id: deployment.id.clone(),
                reason: None,
                checks_performed: 0,
                total_checks,
                rollback_target: Some(target.id.clone()),
            },
        });

        MonitorDecision::Started {
            total_checks,
            rollback_target: target.id,
        }
    }

    /// Stop an application's session. It ends as `aborted` before this
    /// returns. Returns false when nothing was running.
    pub async fn cancel(&self, application_id: &str) -> bool {
        let slot = self.sessions.write().await.remove(application_id);
        match slot {
            Some(slot) => {
                abort_slot(slot, AbortReason::Cancelled).await;
                info!(%application_id, "monitoring session cancelled");
                true
            }
            None => false,
        }
    }

    /// Abort the application's session when `deployment` makes it stale.
    /// The session is archived as `superseded` before this returns.
    pub async fn supersede(&self, deployment: &Deployment) -> bool {
        let app = deployment.application_id.as_str();
        let slot = {
            let mut sessions = self.sessions.write().await;
            let stale = sessions
                .get(app)
                .is_some_and(|slot| deployment.supersedes(&slot.deployment));
            if stale { sessions.remove(app) } else { None }
        };
        match slot {
            Some(slot) => {
                let stale = slot.deployment.id.clone();
                abort_slot(slot, AbortReason::Superseded).await;
                info!(application_id = %app, %stale, deployment_id = %deployment.id, "session superseded");
                true
            }
            None => false,
        }
    }

    /// Stop all sessions (for graceful shutdown).
    pub async fn stop_all(&self) {
        let slots: Vec<(String, SessionSlot)> = self.sessions.write().await.drain().collect();
        for (_, slot) in &slots {
            let _ = slot.shutdown_tx.send(Some(AbortReason::Cancelled));
        }
        for (id, slot) in slots {
            let _ = slot.handle.await;
            debug!(application_id = %id, "monitoring session stopped");
        }
        info!("all monitoring sessions stopped");
    }

    /// Snapshots of all active sessions.
    pub async fn active_sessions(&self) -> Vec<MonitoringSession> {
        let sessions = self.sessions.read().await;
        sessions.values().map(|s| s.progress.borrow().clone()).collect()
    }

    /// Snapshot of an application's active session.
    pub async fn session(&self, application_id: &str) -> Option<MonitoringSession> {
        let sessions = self.sessions.read().await;
        sessions
            .get(application_id)
            .map(|s| s.progress.borrow().clone())
    }

    /// Check if an application has an active session.
    pub async fn is_monitoring(&self, application_id: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions.contains_key(application_id)
    }

    /// The tick loop for a single session.
    async fn run_session(
        &self,
        slot_id: u64,
        deployment: Deployment,
        mut session: MonitoringSession,
        mut settings: RollbackSettings,
        mut shutdown: watch::Receiver<Option<AbortReason>>,
        progress: watch::Sender<MonitoringSession>,
    ) {
        let interval = Duration::from_secs(CHECK_INTERVAL_SECS);
        let threshold = self.options.effective_failure_threshold();

        debug!(
            application_id = %deployment.application_id,
            deployment_id = %deployment.id,
            total = session.total_checks(),
            "session loop starting"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                reason = abort_requested(&mut shutdown) => {
                    session.abort(reason, epoch_secs());
                    break;
                }
            }

            if let Some(reason) = self.guard(&deployment, &mut settings) {
                session.abort(reason, epoch_secs());
                break;
            }

            let input = tokio::select! {
                input = self.observe(&deployment) => input,
                reason = abort_requested(&mut shutdown) => {
                    session.abort(reason, epoch_secs());
                    break;
                }
            };

            let outcome = session.record_tick(input, &settings, threshold);
            let _ = progress.send(session.clone());

            match outcome {
                TickOutcome::Continue => {
                    if input.verdict == HealthStatus::Unknown {
                        self.emit(NotificationLevel::Debug, "health check inconclusive, retrying next tick", &session);
                    }
                }
                TickOutcome::Rollback(reason) => {
                    self.execute_rollback(&mut session, reason).await;
                    break;
                }
                TickOutcome::Succeeded | TickOutcome::Finished => break,
            }
        }

        self.finish(slot_id, &session, &progress).await;
    }

    /// Staleness and live-settings checks run before every tick.
    fn guard(&self, deployment: &Deployment, settings: &mut RollbackSettings) -> Option<AbortReason> {
        let app = deployment.application_id.as_str();

        match self.state.get_deployment(app, &deployment.id) {
            Ok(Some(_)) => {}
            Ok(None) => return Some(AbortReason::DeploymentMissing),
            Err(e) => warn!(application_id = %app, error = %e, "failed to re-read deployment"),
        }

        match self.state.has_newer_deployment(app, deployment) {
            Ok(true) => return Some(AbortReason::Superseded),
            Ok(false) => {}
            Err(e) => warn!(application_id = %app, error = %e, "staleness check failed"),
        }

        match self.state.get_settings(app) {
            Ok(live) if !live.auto_rollback_enabled => return Some(AbortReason::AutoRollbackDisabled),
            Ok(live) => *settings = live,
            Err(e) => warn!(application_id = %app, error = %e, "keeping settings snapshot"),
        }

        None
    }

    /// Run the health probe and restart count, each bounded by the probe timeout.
    async fn observe(&self, deployment: &Deployment) -> TickInput {
        let app = deployment.application_id.as_str();
        let timeout = self.options.probe_timeout;

        let verdict = tokio::time::timeout(timeout, self.probe.check_health(app, &deployment.id))
            .await
            .unwrap_or_else(|_| {
                debug!(application_id = %app, deployment_id = %deployment.id, "health probe timed out");
                HealthStatus::Unknown
            });
        let restart_count = tokio::time::timeout(timeout, self.probe.restart_count(app, &deployment.id))
            .await
            .unwrap_or(None);

        TickInput {
            verdict,
            restart_count,
            at: epoch_secs(),
        }
    }

    async fn execute_rollback(&self, session: &mut MonitoringSession, reason: RollbackReason) {
        let app = session.application_id().to_string();
        let target = session.rollback_target().to_string();

        warn!(
            application_id = %app,
            deployment_id = %session.deployment_id(),
            %target,
            %reason,
            "rolling back deployment"
        );

        let result = tokio::time::timeout(self.options.rollback_timeout, self.rollback.rollback(&app, &target))
            .await
            .unwrap_or(Err(RollbackError::Timeout));

        match result {
            Ok(()) => {
                session.record_rollback_result(true);
                let message = match reason {
                    RollbackReason::HealthCheckFailed => {
                        format!("rolled back to {target} after {} failed health checks", session.consecutive_failures())
                    }
                    RollbackReason::CrashLoop => format!("rolled back to {target}: application is crash looping"),
                };
                self.emit(NotificationLevel::Warning, &message, session);
            }
            Err(e) => {
                session.record_rollback_result(false);
                error!(application_id = %app, %target, error = %e, "rollback failed");
                self.emit(
                    NotificationLevel::Critical,
                    &format!("rollback to {target} failed ({reason}): {e}; manual intervention required"),
                    session,
                );
            }
        }
    }

    /// Archive the session, publish its final state, and release the slot.
    async fn finish(
        &self,
        slot_id: u64,
        session: &MonitoringSession,
        progress: &watch::Sender<MonitoringSession>,
    ) {
        match session.status() {
            SessionStatus::Succeeded => {
                self.emit(NotificationLevel::Info, "deployment stable, monitoring finished", session)
            }
            SessionStatus::Aborted => {
                self.emit(NotificationLevel::Info, "monitoring aborted without rollback", session)
            }
            SessionStatus::RolledBack | SessionStatus::Running => {}
        }

        if let Err(e) = self.state.put_session(&session.to_record()) {
            error!(
                application_id = %session.application_id(),
                deployment_id = %session.deployment_id(),
                error = %e,
                "failed to archive session"
            );
        }
        let _ = progress.send(session.clone());

        let mut sessions = self.sessions.write().await;
        if sessions
            .get(session.application_id())
            .is_some_and(|slot| slot.slot_id == slot_id)
        {
            sessions.remove(session.application_id());
        }
    }

    fn emit(&self, level: NotificationLevel, message: &str, session: &MonitoringSession) {
        self.notifier.notify(Notification {
            level,
            message: message.to_string(),
            context: NotificationContext {
                application_id: session.application_id().to_string(),
                deployment_id: session.deployment_id().to_string(),
                reason: session.reason(),
                checks_performed: session.checks_performed(),
                total_checks: session.total_checks(),
                rollback_target: Some(session.rollback_target().to_string()),
            },
        });
    }
}

fn skipped(reason: SkipReason) -> MonitorDecision {
    MonitorDecision::Skipped { reason }
}

fn skip_reason(deployment: &Deployment, settings: &RollbackSettings) -> SkipReason {
    if !settings.auto_rollback_enabled {
        SkipReason::AutoRollbackDisabled
    } else if deployment.is_pull_request() {
        SkipReason::PullRequest
    } else {
        SkipReason::RollbackDeployment
    }
}

async fn abort_slot(slot: SessionSlot, reason: AbortReason) {
    let _ = slot.shutdown_tx.send(Some(reason));
    let _ = slot.handle.await;
}

/// Resolve once an abort has been requested. A dropped sender counts as
/// cancellation.
async fn abort_requested(shutdown: &mut watch::Receiver<Option<AbortReason>>) -> AbortReason {
    loop {
        if let Some(reason) = *shutdown.borrow_and_update() {
            return reason;
        }
        if shutdown.changed().await.is_err() {
            return AbortReason::Cancelled;
        }
    }
}

fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
