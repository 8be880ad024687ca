//! rollguard-health — post-deploy health monitoring and auto-rollback.
//!
//! When a deployment finishes, the monitor decides whether to watch it and,
//! if so, runs a background session that probes the deployment every 30
//! seconds for the application's validation window.
//!
//! # Architecture
//!
//! ```text
//! HealthMonitor
//!   ├── Session arena (one slot per application)
//!   │   └── Background session task
//!   │       ├── staleness + live settings guard
//!   │       ├── HealthProbe → HealthStatus, restart count
//!   │       ├── MonitoringSession::record_tick
//!   │       └── RollbackExecutor on trigger
//!   ├── NotificationSink for status lines
//!   └── StateStore archive of finished sessions
//! ```
//!
//! `InstanceProbe` is the default probe: it hits the HTTP health path of
//! every instance reported for the deployment. Connection failures and
//! timeouts yield `Unknown`, which never counts toward a rollback.

pub mod checker;
pub mod monitor;
pub mod notify;

pub use checker::{InstanceProbe, aggregate, http_probe};
pub use monitor::{HealthMonitor, MonitorDecision, SkipReason};
pub use notify::TracingNotifier;
