//! Audit trail written to the log

use super::{AuditEntry, AuditSink};

/// Writes audit entries as structured events on the `agentline::audit` target
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: AuditEntry) {
        tracing::info!(
            target: "agentline::audit",
            user_id = %entry.user_id,
            org_id = entry.org_id.as_deref().unwrap_or("-"),
            action = entry.action,
            resource_type = %entry.resource_type,
            resource_id = entry.resource_id.as_deref().unwrap_or("-"),
            session_id = entry.session_id.as_deref().unwrap_or("-"),
            "audit"
        );
    }
}
