use crate::{bandit_engine::ExperimentStatus, types::ExperimentId};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Operator-issued commands. Variants are appended, never reordered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum OperatorCommand {
    // ── Variance control ──────────────────────────
    ApproveCorrection {
        event_id: Uuid,
        #[serde(default)]
        note:     Option<String>,
    },
    RejectCorrection {
        event_id: Uuid,
        #[serde(default)]
        note:     Option<String>,
    },
    RollbackCorrection {
        event_id: Uuid,
        #[serde(default)]
        note:     Option<String>,
    },

    // ── Experiments ───────────────────────────────
    SetExperimentStatus {
        experiment_id: ExperimentId,
        status:        ExperimentStatus,
    },
}

impl OperatorCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::ApproveCorrection { .. } => "approve_correction",
            Self::RejectCorrection { .. } => "reject_correction",
            Self::RollbackCorrection { .. } => "rollback_correction",
            Self::SetExperimentStatus { .. } => "set_experiment_status",
        }
    }
}
