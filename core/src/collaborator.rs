//! Interfaces to everything the engines do not own.
//!
//! RULE: Engines reach storage, approvals and the audit trail only through
//! these traits. `EngineStore` implements all of them over SQLite; tests and
//! embedders may supply their own.

use crate::{
    bandit_engine::BanditArmState,
    error::EngineResult,
    event::AuditRecord,
    grading_engine::{DonorSnapshot, GradeScope, ScopeEntry, ScopeRanking},
    types::Timestamp,
    variance_controller::{CorrectionEvent, FunctionMetricWindow},
};
use std::sync::Mutex;
use uuid::Uuid;

/// Consistent, read-only view of the donor population.
pub trait DonorSource: Send + Sync {
    fn fetch_qualifying_donors(&self) -> EngineResult<Vec<DonorSnapshot>>;
}

/// Receives the rankings of one grading cycle.
pub trait GradeSink: Send + Sync {
    /// Replace every scope in `rankings` and empty every scope in `cleared`,
    /// all or nothing. Scopes named in neither are left alone.
    fn publish_cycle(&self, rankings: &[ScopeRanking], cleared: &[GradeScope]) -> EngineResult<()>;

    /// Replace a single scope's ranking.
    fn publish_grades(&self, scope: &GradeScope, entries: &[ScopeEntry]) -> EngineResult<()> {
        let ranking = ScopeRanking { scope: scope.clone(), entries: entries.to_vec() };
        self.publish_cycle(std::slice::from_ref(&ranking), &[])
    }
}

pub trait ArmStore: Send + Sync {
    fn load_arm_state(&self, experiment_id: &str) -> EngineResult<Vec<BanditArmState>>;
    fn save_arm_state(&self, experiment_id: &str, arm: &BanditArmState) -> EngineResult<()>;
}

/// Metric window covering `[start, end)` for one function, if one exists.
pub trait MetricSource: Send + Sync {
    fn fetch_metric_window(
        &self,
        function_code: &str,
        start: Timestamp,
        end: Timestamp,
    ) -> EngineResult<Option<FunctionMetricWindow>>;
}

/// Fire-and-forget approval request. The decision comes back later through
/// `OperatorCommand::ApproveCorrection` / `RejectCorrection`.
pub trait ApprovalGate: Send + Sync {
    fn request_approval(&self, event: &CorrectionEvent) -> EngineResult<()>;

    /// Called once a decision for `event_id` has been applied.
    fn approval_resolved(&self, _event_id: Uuid) -> EngineResult<()> {
        Ok(())
    }
}

pub trait AuditSink: Send + Sync {
    fn append_audit(&self, record: &AuditRecord) -> EngineResult<()>;
}

/// Approval gate that only queues requests. Used when approvals are
/// collected out of band (and in tests).
#[derive(Debug, Default)]
pub struct QueuedApprovalGate {
    requested: Mutex<Vec<Uuid>>,
}

impl QueuedApprovalGate {
    pub fn requested(&self) -> Vec<Uuid> {
        self.requested.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

impl ApprovalGate for QueuedApprovalGate {
    fn request_approval(&self, event: &CorrectionEvent) -> EngineResult<()> {
        self.requested
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(event.event_id);
        Ok(())
    }
}
