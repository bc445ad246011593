//! Engine events and the audit trail.
//!
//! RULE: Engines report what they did as EngineEvents. Only the
//! Orchestrator turns events into AuditRecords and hands them to the sink.

use crate::{
    bandit_engine::ExperimentStatus,
    grading_engine::SkippedRecord,
    types::{ExperimentId, FunctionCode, RuleId, Timestamp, VariantId},
    variance_controller::{CorrectionEvent, SuppressionReason, VarianceSeverity},
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use uuid::Uuid;

/// Every auditable thing the engines do.
/// Variants are only ever appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    // ── Grading ─────────────────────────────────────
    GradingCycleCompleted {
        cycle:            u64,
        donors:           usize,
        qualifying:       usize,
        county_scopes:    usize,
        previous_cycle:   Option<u64>,
    },
    DonorRecordSkipped {
        record: SkippedRecord,
    },

    // ── Bandit ──────────────────────────────────────
    AllocationRecomputed {
        experiment_id: ExperimentId,
        draws:         u32,
        before:        Vec<(VariantId, f64)>,
        after:         Vec<(VariantId, f64)>,
    },
    ExperimentStatusChanged {
        experiment_id: ExperimentId,
        from:          ExperimentStatus,
        to:            ExperimentStatus,
    },

    // ── Variance control ────────────────────────────
    CorrectionRecorded {
        event:    CorrectionEvent,
        severity: VarianceSeverity,
    },
    CorrectionSuppressed {
        rule_id:        RuleId,
        function_code:  FunctionCode,
        observed_value: f64,
        reason:         SuppressionReason,
    },
    CorrectionResolved {
        event: CorrectionEvent,
    },
    MetricWindowRejected {
        function_code: FunctionCode,
        reason:        String,
    },
}

impl EngineEvent {
    pub fn component(&self) -> &'static str {
        match self {
            Self::GradingCycleCompleted { .. } | Self::DonorRecordSkipped { .. } => "grading",
            Self::AllocationRecomputed { .. } | Self::ExperimentStatusChanged { .. } => "bandit",
            Self::CorrectionRecorded { .. }
            | Self::CorrectionSuppressed { .. }
            | Self::CorrectionResolved { .. }
            | Self::MetricWindowRejected { .. } => "variance",
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::GradingCycleCompleted { .. } => "grading_cycle_completed",
            Self::DonorRecordSkipped { .. } => "donor_record_skipped",
            Self::AllocationRecomputed { .. } => "allocation_recomputed",
            Self::ExperimentStatusChanged { .. } => "experiment_status_changed",
            Self::CorrectionRecorded { .. } => "correction_recorded",
            Self::CorrectionSuppressed { .. } => "correction_suppressed",
            Self::CorrectionResolved { .. } => "correction_resolved",
            Self::MetricWindowRejected { .. } => "metric_window_rejected",
        }
    }

    /// Flatten into the `{timestamp, component, subject, before, after, reason}` shape.
    pub fn to_audit(&self, timestamp: Timestamp) -> AuditRecord {
        let (subject_id, before, after, reason) = match self {
            Self::GradingCycleCompleted { cycle, donors, qualifying, county_scopes, previous_cycle } => (
                format!("cycle-{cycle}"),
                json!({ "cycle": previous_cycle }),
                json!({ "cycle": cycle, "donors": donors, "qualifying": qualifying, "county_scopes": county_scopes }),
                "scheduled full-population recompute".to_string(),
            ),
            Self::DonorRecordSkipped { record } => (
                record.donor_id.clone(),
                Value::Null,
                Value::Null,
                format!("invalid input: {}", record.reason),
            ),
            Self::AllocationRecomputed { experiment_id, draws, before, after } => (
                experiment_id.clone(),
                allocation_json(before),
                allocation_json(after),
                format!("probability-of-best over {draws} draws"),
            ),
            Self::ExperimentStatusChanged { experiment_id, from, to } => (
                experiment_id.clone(),
                json!({ "status": from }),
                json!({ "status": to }),
                "operator command".to_string(),
            ),
            Self::CorrectionRecorded { event, severity } => (
                format!("{}/{}", event.function_code, event.rule_id),
                serde_json::to_value(&event.before).unwrap_or(Value::Null),
                serde_json::to_value(&event.after).unwrap_or(Value::Null),
                format!(
                    "{} {}: {:?} {:.2} vs threshold {:.2} (severity {:?}, event {})",
                    event.action.name(),
                    event.status,
                    event.metric,
                    event.observed_value,
                    event.threshold,
                    severity,
                    event.event_id
                ),
            ),
            Self::CorrectionSuppressed { rule_id, function_code, observed_value, reason } => (
                format!("{function_code}/{rule_id}"),
                Value::Null,
                Value::Null,
                format!("suppressed by policy at {observed_value:.2}: {reason}"),
            ),
            Self::CorrectionResolved { event } => (
                format!("{}/{}", event.function_code, event.rule_id),
                serde_json::to_value(&event.before).unwrap_or(Value::Null),
                serde_json::to_value(&event.after).unwrap_or(Value::Null),
                format!(
                    "event {} now {}{}",
                    event.event_id,
                    event.status,
                    event.note.as_deref().map(|n| format!(": {n}")).unwrap_or_default()
                ),
            ),
            Self::MetricWindowRejected { function_code, reason } => (
                function_code.clone(),
                Value::Null,
                Value::Null,
                format!("invalid input: {reason}"),
            ),
        };

        AuditRecord {
            audit_id: Uuid::new_v4(),
            timestamp,
            component: self.component().to_string(),
            event_type: self.event_type().to_string(),
            subject_id,
            before,
            after,
            reason,
        }
    }
}

fn allocation_json(shares: &[(VariantId, f64)]) -> Value {
    Value::Object(
        shares
            .iter()
            .map(|(variant, pct)| (variant.clone(), json!(pct)))
            .collect(),
    )
}

/// Immutable audit trail entry as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub audit_id:   Uuid,
    pub timestamp:  Timestamp,
    pub component:  String,
    pub event_type: String,
    pub subject_id: String,
    pub before:     Value,
    pub after:      Value,
    pub reason:     String,
}
