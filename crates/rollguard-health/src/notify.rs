//! Notification sinks.

use tracing::{debug, error, info, warn};

use rollguard_rollout::{Notification, NotificationLevel, NotificationSink};

/// Sink that writes notifications to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn notify(&self, n: Notification) {
        let ctx = &n.context;
        let reason = ctx.reason.as_deref().unwrap_or("-");
        let target = ctx.rollback_target.as_deref().unwrap_or("-");
        match n.level {
            NotificationLevel::Debug => debug!(
                application_id = %ctx.application_id,
                deployment_id = %ctx.deployment_id,
                checks = ctx.checks_performed,
                total = ctx.total_checks,
                "{}", n.message
            ),
            NotificationLevel::Info => info!(
                application_id = %ctx.application_id,
                deployment_id = %ctx.deployment_id,
                checks = ctx.checks_performed,
                total = ctx.total_checks,
                %reason,
                "{}", n.message
            ),
            NotificationLevel::Warning => warn!(
                application_id = %ctx.application_id,
                deployment_id = %ctx.deployment_id,
                checks = ctx.checks_performed,
                total = ctx.total_checks,
                %reason,
                %target,
                "{}", n.message
            ),
            NotificationLevel::Critical => error!(
                application_id = %ctx.application_id,
                deployment_id = %ctx.deployment_id,
                checks = ctx.checks_performed,
                total = ctx.total_checks,
                %reason,
                %target,
                critical = true,
                "{}", n.message
            ),
        }
    }
}
