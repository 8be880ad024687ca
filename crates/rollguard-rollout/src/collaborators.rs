//! Narrow interfaces to the systems a monitoring session talks to.
//!
//! Methods return boxed futures so the monitor can hold the collaborators
//! as `Arc<dyn Trait>` and tests can swap in fakes.

use std::future::Future;
use std::pin::Pin;

use serde::Serialize;
use thiserror::Error;

use rollguard_state::HealthStatus;

/// Boxed, sendable future returned by collaborator methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Executes health checks for a deployment.
pub trait HealthProbe: Send + Sync {
    /// Probe the deployment. Infrastructure errors must come back as
    /// `HealthStatus::Unknown`, never as `Unhealthy`.
    fn check_health<'a>(
        &'a self,
        application_id: &'a str,
        deployment_id: &'a str,
    ) -> BoxFuture<'a, HealthStatus>;

    /// Restarts observed for the deployment's containers, if known.
    fn restart_count<'a>(
        &'a self,
        application_id: &'a str,
        deployment_id: &'a str,
    ) -> BoxFuture<'a, Option<u32>>;
}

/// Errors from a rollback attempt.
#[derive(Debug, Error)]
pub enum RollbackError {
    #[error("no rollback executor configured")]
    NotConfigured,

    #[error("invalid rollback endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("rollback request failed: {0}")]
    Request(String),

    #[error("rollback rejected with status {0}")]
    Rejected(u16),

    #[error("rollback timed out")]
    Timeout,
}

/// Reverts an application to an earlier deployment.
pub trait RollbackExecutor: Send + Sync {
    /// Roll `application_id` back to `target_deployment_id`. Calling it
    /// twice for the same target must be harmless.
    fn rollback<'a>(
        &'a self,
        application_id: &'a str,
        target_deployment_id: &'a str,
    ) -> BoxFuture<'a, Result<(), RollbackError>>;
}

/// Severity of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationLevel {
    Debug,
    Info,
    Warning,
    Critical,
}

/// Structured context attached to every notification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NotificationContext {
    pub application_id: String,
    pub deployment_id: String,
    pub reason: Option<String>,
    pub checks_performed: u32,
    pub total_checks: u32,
    pub rollback_target: Option<String>,
}

/// A human-readable status line plus its context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub level: NotificationLevel,
    pub message: String,
    pub context: NotificationContext,
}

/// Fire-and-forget observability sink.
pub trait NotificationSink: Send + Sync {
    fn notify(&self, notification: Notification);
}
