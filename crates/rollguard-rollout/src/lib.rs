//! rollguard rollback policy — monitoring decision, check budget, session
//! state machine.
//!
//! This crate decides whether a finished deployment enters post-deploy
//! health monitoring and models the bounded session that follows.
//!
//! # Components
//!
//! - **`policy`** — `should_monitor` and `compute_check_budget`
//! - **`session`** — `MonitoringSession` state machine (tick, rollback, abort)
//! - **`collaborators`** — traits for the health probe, rollback executor,
//!   and notification sink
//! - **`webhook`** — rollback executor that calls out to an HTTP endpoint

pub mod collaborators;
pub mod policy;
pub mod session;
pub mod webhook;

pub use collaborators::{
    BoxFuture, HealthProbe, Notification, NotificationContext, NotificationLevel,
    NotificationSink, RollbackError, RollbackExecutor,
};
pub use policy::{
    CHECK_INTERVAL_SECS, DEFAULT_FAILURE_THRESHOLD, MonitorOptions, compute_check_budget,
    should_monitor,
};
pub use session::{AbortReason, MonitoringSession, RollbackReason, TickInput, TickOutcome};
pub use webhook::{UnconfiguredRollback, WebhookRollback};
