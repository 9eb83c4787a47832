//! Default, `tracing`-backed implementations of the observability
//! capabilities (spec.md §7): a no-op audit publisher and a metrics sink
//! that emits structured events instead of pushing anywhere. Real
//! deployments wire `GuardAuditPublisher` to a SIEM/queue and `AgentMetrics`
//! to Prometheus/OTel; these defaults exist so the engine runs out of the
//! box without either.

use crate::capabilities::{AgentMetrics, GuardAuditEvent, GuardAuditPublisher};
use crate::error::AgentErrorKind;

/// Publishes guard audit events as `tracing` events at debug level.
pub struct NoopAuditPublisher;

impl GuardAuditPublisher for NoopAuditPublisher {
    fn publish(&self, event: GuardAuditEvent) {
        tracing::debug!(
            run_id = event.run_id,
            stage = event.stage,
            outcome = event.outcome,
            reason = event.reason.as_deref(),
            "guard decision published"
        );
    }
}

/// Emits every metric as a structured `tracing` event rather than
/// aggregating counters itself — aggregation belongs to whatever collects
/// the logs (Prometheus exporter, log pipeline, etc.).
pub struct TracingMetrics;

impl AgentMetrics for TracingMetrics {
    fn record_run(&self, success: bool, duration_ms: u64, error_kind: Option<AgentErrorKind>) {
        tracing::info!(
            success,
            duration_ms,
            error_kind = error_kind.map(|k| k.to_string()),
            "agent run completed"
        );
    }

    fn record_tool_call(&self, tool_name: &str, success: bool, duration_ms: u64) {
        tracing::info!(tool_name, success, duration_ms, "tool call completed");
    }

    fn record_guard_rejection(&self, stage: &str) {
        tracing::warn!(stage, "guard rejected command");
    }

    fn record_breaker_transition(&self, from: &str, to: &str) {
        tracing::info!(from, to, "circuit breaker transitioned");
    }

    fn record_fallback_attempt(&self, model: &str, success: bool) {
        tracing::info!(model, success, "fallback model attempted");
    }

    fn record_cache_hit(&self, hit: bool) {
        tracing::debug!(hit, "response cache lookup");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_noop_audit_publisher_does_not_panic() {
        let publisher = NoopAuditPublisher;
        publisher.publish(GuardAuditEvent {
            run_id: "run-1".into(),
            stage: "prompt_injection".into(),
            outcome: "allowed".into(),
            reason: None,
        });
    }

    #[test]
    fn test_tracing_metrics_record_calls_do_not_panic() {
        let metrics = TracingMetrics;
        metrics.record_run(true, 120, None);
        metrics.record_run(false, 50, Some(AgentErrorKind::Timeout));
        metrics.record_tool_call("get_weather", true, 30);
        metrics.record_guard_rejection("prompt_injection");
        metrics.record_breaker_transition("closed", "open");
        metrics.record_fallback_attempt("backup-model", true);
        metrics.record_cache_hit(true);
    }
}
