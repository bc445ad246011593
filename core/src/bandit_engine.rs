//! Thompson-sampling experimentation engine.
//!
//! Each variant's conversion rate is modelled as Beta(alpha, beta) with
//! alpha = conversions + 1 and beta = failures + 1. Selection draws once per
//! arm and takes the maximum; allocation reporting estimates each arm's
//! probability of being best by repeated draws.
//!
//! Locking: one mutex per arm, one RNG mutex per experiment. Experiments
//! share nothing but the registry's read lock.

use crate::{
    collaborator::ArmStore,
    error::{EngineError, EngineResult},
    event::EngineEvent,
    rng::{EngineRng, RngBank},
    subsystem::{CancelToken, EngineCycle},
    types::{ExperimentId, Timestamp, VariantId},
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

pub const DEFAULT_ALLOCATION_DRAWS: u32 = 10_000;
const ALLOCATION_DECIMALS: i32 = 2;

// ── Public types ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Active,
    Paused,
    Completed,
    Archived,
}

impl ExperimentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Archived => "archived",
        }
    }

    fn can_move_to(self, next: ExperimentStatus) -> bool {
        use ExperimentStatus::*;
        matches!(
            (self, next),
            (Active, Paused)
                | (Paused, Active)
                | (Active, Completed)
                | (Paused, Completed)
                | (Active, Archived)
                | (Paused, Archived)
                | (Completed, Archived)
        )
    }
}

impl fmt::Display for ExperimentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStrategy {
    ThompsonSampling,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Variant {
    pub variant_id: VariantId,
    pub label:      String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub experiment_id: ExperimentId,
    pub variants:      Vec<Variant>,
    pub status:        ExperimentStatus,
    pub strategy:      AllocationStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BanditArmState {
    pub variant_id:             VariantId,
    pub alpha:                  u64,
    pub beta:                   u64,
    pub impressions:            u64,
    pub conversions:            u64,
    pub cumulative_revenue:     f64,
    pub traffic_allocation_pct: f64,
}

impl BanditArmState {
    /// Uninformative Beta(1, 1) prior.
    pub fn prior(variant_id: impl Into<VariantId>) -> Self {
        Self {
            variant_id:             variant_id.into(),
            alpha:                  1,
            beta:                   1,
            impressions:            0,
            conversions:            0,
            cumulative_revenue:     0.0,
            traffic_allocation_pct: 0.0,
        }
    }

    fn record(&mut self, converted: bool, revenue: f64) {
        self.impressions += 1;
        if converted {
            self.conversions += 1;
            self.cumulative_revenue += revenue;
        }
        self.refresh_shape();
    }

    fn refresh_shape(&mut self) {
        self.alpha = self.conversions + 1;
        self.beta = (self.impressions - self.conversions) + 1;
    }

    /// Posterior mean conversion rate.
    pub fn posterior_mean(&self) -> f64 {
        self.alpha as f64 / (self.alpha + self.beta) as f64
    }
}

/// Result of one allocation recompute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocationReport {
    pub experiment_id: ExperimentId,
    pub draws:         u32,
    pub before:        Vec<(VariantId, f64)>,
    pub arms:          Vec<BanditArmState>,
}

impl AllocationReport {
    pub fn total_pct(&self) -> f64 {
        self.arms.iter().map(|a| a.traffic_allocation_pct).sum()
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

struct ExperimentSlot {
    experiment_id: ExperimentId,
    variants:      Vec<Variant>,
    strategy:      AllocationStrategy,
    status:        RwLock<ExperimentStatus>,
    arms:          Vec<Mutex<BanditArmState>>,
    positions:     HashMap<VariantId, usize>,
    rng:           Mutex<EngineRng>,
}

impl ExperimentSlot {
    fn status(&self) -> ExperimentStatus {
        *self.status.read().unwrap_or_else(|p| p.into_inner())
    }

    fn shapes(&self) -> EngineResult<Vec<(f64, f64)>> {
        self.arms
            .iter()
            .map(|arm| {
                let arm = arm.lock().map_err(|_| EngineError::LockPoisoned("bandit arm"))?;
                Ok((arm.alpha as f64, arm.beta as f64))
            })
            .collect()
    }

    fn arm_states(&self) -> EngineResult<Vec<BanditArmState>> {
        self.arms
            .iter()
            .map(|arm| {
                arm.lock()
                    .map(|a| a.clone())
                    .map_err(|_| EngineError::LockPoisoned("bandit arm"))
            })
            .collect()
    }

    fn state_error(&self, status: ExperimentStatus) -> EngineError {
        EngineError::InvalidExperimentState {
            experiment_id: self.experiment_id.clone(),
            state:         status.to_string(),
        }
    }
}

pub struct BanditEngine {
    experiments:      RwLock<HashMap<ExperimentId, Arc<ExperimentSlot>>>,
    arm_store:        Arc<dyn ArmStore>,
    rng_bank:         RngBank,
    allocation_draws: u32,
}

impl BanditEngine {
    pub fn new(arm_store: Arc<dyn ArmStore>, rng_bank: RngBank, allocation_draws: u32) -> Self {
        Self {
            experiments: RwLock::new(HashMap::new()),
            arm_store,
            rng_bank,
            allocation_draws: allocation_draws.max(1),
        }
    }

    /// Register an experiment, restoring saved arm state when the store has
    /// it and seeding a Beta(1, 1) prior otherwise.
    pub fn register_experiment(&self, experiment: Experiment) -> EngineResult<()> {
        validate_experiment(&experiment)?;

        let saved: HashMap<VariantId, BanditArmState> = self
            .arm_store
            .load_arm_state(&experiment.experiment_id)?
            .into_iter()
            .map(|arm| (arm.variant_id.clone(), arm))
            .collect();

        let mut arms = Vec::with_capacity(experiment.variants.len());
        let mut positions = HashMap::with_capacity(experiment.variants.len());
        for (i, variant) in experiment.variants.iter().enumerate() {
            let arm = match saved.get(&variant.variant_id) {
                Some(stored) => restore_arm(&experiment.experiment_id, stored)?,
                None => {
                    let mut prior = BanditArmState::prior(variant.variant_id.clone());
                    prior.traffic_allocation_pct = even_share(experiment.variants.len(), i);
                    self.arm_store.save_arm_state(&experiment.experiment_id, &prior)?;
                    prior
                }
            };
            arms.push(Mutex::new(arm));
            positions.insert(variant.variant_id.clone(), i);
        }

        let slot = ExperimentSlot {
            experiment_id: experiment.experiment_id.clone(),
            variants: experiment.variants,
            strategy: experiment.strategy,
            status: RwLock::new(experiment.status),
            arms,
            positions,
            rng: Mutex::new(self.rng_bank.for_experiment(&experiment.experiment_id)),
        };

        let mut registry = self
            .experiments
            .write()
            .map_err(|_| EngineError::LockPoisoned("experiment registry"))?;
        if registry.contains_key(&experiment.experiment_id) {
            return Err(EngineError::InvalidExperimentState {
                experiment_id: experiment.experiment_id,
                state:         "already registered".into(),
            });
        }
        log::info!(
            "bandit: registered experiment '{}' with {} variants ({})",
            experiment.experiment_id,
            slot.variants.len(),
            slot.status()
        );
        registry.insert(experiment.experiment_id, Arc::new(slot));
        Ok(())
    }

    /// Draw one Beta sample per arm and return the arm with the largest draw.
    pub fn select_variant(&self, experiment_id: &str) -> EngineResult<VariantId> {
        let slot = self.slot(experiment_id)?;
        let status = slot.status();
        if status != ExperimentStatus::Active {
            return Err(slot.state_error(status));
        }
        if slot.variants.len() == 1 {
            return Ok(slot.variants[0].variant_id.clone());
        }

        let shapes = slot.shapes()?;
        let mut rng = slot
            .rng
            .lock()
            .map_err(|_| EngineError::LockPoisoned("experiment rng"))?;
        let winner = thompson_winner(&shapes, &mut rng);
        Ok(slot.variants[winner].variant_id.clone())
    }

    /// Record one observed outcome. The arm is locked for the whole
    /// read-modify-write-persist sequence; a failed save leaves it untouched.
    pub fn record_outcome(
        &self,
        experiment_id: &str,
        variant_id: &str,
        converted: bool,
        revenue: f64,
    ) -> EngineResult<BanditArmState> {
        let slot = self.slot(experiment_id)?;
        let status = slot.status();
        if !matches!(status, ExperimentStatus::Active | ExperimentStatus::Paused) {
            return Err(slot.state_error(status));
        }
        let position = *slot.positions.get(variant_id).ok_or_else(|| EngineError::UnknownVariant {
            experiment_id: experiment_id.to_string(),
            variant_id:    variant_id.to_string(),
        })?;
        if !revenue.is_finite() || revenue < 0.0 {
            return Err(EngineError::invalid_input(
                format!("{experiment_id}/{variant_id}"),
                format!("revenue must be a non-negative amount, got {revenue}"),
            ));
        }

        let mut arm = slot.arms[position]
            .lock()
            .map_err(|_| EngineError::LockPoisoned("bandit arm"))?;
        let mut next = arm.clone();
        next.record(converted, revenue);
        self.arm_store.save_arm_state(experiment_id, &next)?;
        *arm = next.clone();
        Ok(next)
    }

    /// Re-estimate each arm's probability of being best and store it as the
    /// traffic allocation percentage. Percentages always sum to exactly 100.
    pub fn recompute_allocation(&self, experiment_id: &str) -> EngineResult<AllocationReport> {
        let slot = self.slot(experiment_id)?;
        let status = slot.status();
        if status == ExperimentStatus::Archived {
            return Err(slot.state_error(status));
        }

        let before: Vec<(VariantId, f64)> = slot
            .arm_states()?
            .into_iter()
            .map(|a| (a.variant_id, a.traffic_allocation_pct))
            .collect();

        let shares = if slot.variants.len() == 1 {
            vec![100.0]
        } else {
            let shapes = slot.shapes()?;
            let mut wins = vec![0u32; shapes.len()];
            {
                let mut rng = slot
                    .rng
                    .lock()
                    .map_err(|_| EngineError::LockPoisoned("experiment rng"))?;
                for _ in 0..self.allocation_draws {
                    wins[thompson_winner(&shapes, &mut rng)] += 1;
                }
            }
            normalize_to_hundred(&wins, self.allocation_draws)
        };

        let mut arms = Vec::with_capacity(shares.len());
        for (arm, share) in slot.arms.iter().zip(shares) {
            let mut arm = arm.lock().map_err(|_| EngineError::LockPoisoned("bandit arm"))?;
            let mut next = arm.clone();
            next.traffic_allocation_pct = share;
            self.arm_store.save_arm_state(experiment_id, &next)?;
            *arm = next.clone();
            arms.push(next);
        }

        log::debug!(
            "bandit: reallocated '{}' over {} draws: {}",
            experiment_id,
            self.allocation_draws,
            arms.iter()
                .map(|a| format!("{}={:.2}%", a.variant_id, a.traffic_allocation_pct))
                .collect::<Vec<_>>()
                .join(" ")
        );

        Ok(AllocationReport {
            experiment_id: experiment_id.to_string(),
            draws: if slot.variants.len() == 1 { 0 } else { self.allocation_draws },
            before,
            arms,
        })
    }

    /// Move an experiment to a new status. Archived is terminal.
    pub fn set_status(
        &self,
        experiment_id: &str,
        next: ExperimentStatus,
    ) -> EngineResult<ExperimentStatus> {
        let slot = self.slot(experiment_id)?;
        let mut status = slot
            .status
            .write()
            .map_err(|_| EngineError::LockPoisoned("experiment status"))?;
        let previous = *status;
        if previous == next {
            return Ok(previous);
        }
        if !previous.can_move_to(next) {
            return Err(EngineError::InvalidTransition {
                from: format!("experiment '{experiment_id}' {previous}"),
                to:   next.to_string(),
            });
        }
        *status = next;
        log::info!("bandit: experiment '{experiment_id}' {previous} -> {next}");
        Ok(previous)
    }

    pub fn experiment(&self, experiment_id: &str) -> EngineResult<Experiment> {
        let slot = self.slot(experiment_id)?;
        Ok(Experiment {
            experiment_id: slot.experiment_id.clone(),
            variants:      slot.variants.clone(),
            status:        slot.status(),
            strategy:      slot.strategy,
        })
    }

    pub fn arm_states(&self, experiment_id: &str) -> EngineResult<Vec<BanditArmState>> {
        self.slot(experiment_id)?.arm_states()
    }

    /// Experiments whose allocation should be refreshed, in id order.
    pub fn reportable_experiment_ids(&self) -> EngineResult<Vec<ExperimentId>> {
        let registry = self
            .experiments
            .read()
            .map_err(|_| EngineError::LockPoisoned("experiment registry"))?;
        let mut ids: Vec<ExperimentId> = registry
            .values()
            .filter(|slot| slot.status() == ExperimentStatus::Active)
            .map(|slot| slot.experiment_id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    fn slot(&self, experiment_id: &str) -> EngineResult<Arc<ExperimentSlot>> {
        let registry = self
            .experiments
            .read()
            .map_err(|_| EngineError::LockPoisoned("experiment registry"))?;
        registry
            .get(experiment_id)
            .cloned()
            .ok_or_else(|| EngineError::InvalidExperimentState {
                experiment_id: experiment_id.to_string(),
                state:         "unknown".into(),
            })
    }
}

// ── Scheduled cycle ──────────────────────────────────────────────────────────

/// Periodic allocation refresh for every active experiment. A failure on one
/// experiment is logged and does not stop the others.
pub struct AllocationCycle {
    engine: Arc<BanditEngine>,
}

impl AllocationCycle {
    pub fn new(engine: Arc<BanditEngine>) -> Self {
        Self { engine }
    }
}

impl EngineCycle for AllocationCycle {
    fn name(&self) -> &'static str {
        "bandit_allocation"
    }

    fn run(&self, _now: Timestamp, cancel: &CancelToken) -> EngineResult<Vec<EngineEvent>> {
        let mut events = Vec::new();
        for experiment_id in self.engine.reportable_experiment_ids()? {
            if cancel.is_cancelled() {
                break;
            }
            match self.engine.recompute_allocation(&experiment_id) {
                Ok(report) => events.push(EngineEvent::AllocationRecomputed {
                    experiment_id: report.experiment_id,
                    draws: report.draws,
                    before: report.before,
                    after: report
                        .arms
                        .into_iter()
                        .map(|a| (a.variant_id, a.traffic_allocation_pct))
                        .collect(),
                }),
                Err(e) => log::warn!("bandit: allocation for '{experiment_id}' failed: {e}"),
            }
        }
        Ok(events)
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn validate_experiment(experiment: &Experiment) -> EngineResult<()> {
    if experiment.experiment_id.trim().is_empty() {
        return Err(EngineError::invalid_input("experiment", "empty experiment id"));
    }
    if experiment.variants.is_empty() {
        return Err(EngineError::invalid_input(
            experiment.experiment_id.clone(),
            "experiment has no variants",
        ));
    }
    let mut seen = std::collections::HashSet::new();
    for variant in &experiment.variants {
        if !seen.insert(variant.variant_id.as_str()) {
            return Err(EngineError::invalid_input(
                experiment.experiment_id.clone(),
                format!("duplicate variant id '{}'", variant.variant_id),
            ));
        }
    }
    Ok(())
}

fn restore_arm(experiment_id: &str, stored: &BanditArmState) -> EngineResult<BanditArmState> {
    if stored.conversions > stored.impressions {
        return Err(EngineError::invalid_input(
            format!("{experiment_id}/{}", stored.variant_id),
            "stored conversions exceed impressions",
        ));
    }
    let mut arm = stored.clone();
    arm.refresh_shape();
    if arm.alpha != stored.alpha || arm.beta != stored.beta {
        log::warn!(
            "bandit: '{experiment_id}/{}' stored shape ({}, {}) disagrees with counts; using ({}, {})",
            stored.variant_id,
            stored.alpha,
            stored.beta,
            arm.alpha,
            arm.beta
        );
    }
    Ok(arm)
}

/// Index of the arm with the largest Beta draw. Ties go to the lower index.
fn thompson_winner(shapes: &[(f64, f64)], rng: &mut EngineRng) -> usize {
    let mut best = 0;
    let mut best_draw = f64::NEG_INFINITY;
    for (i, (alpha, beta)) in shapes.iter().enumerate() {
        let draw = rng.beta(*alpha, *beta);
        if draw > best_draw {
            best = i;
            best_draw = draw;
        }
    }
    best
}

fn round_pct(value: f64) -> f64 {
    let scale = 10f64.powi(ALLOCATION_DECIMALS);
    (value * scale).round() / scale
}

/// Win counts → percentages rounded to two decimals; the rounding residue is
/// folded into the largest share so the total is exactly 100.
fn normalize_to_hundred(wins: &[u32], draws: u32) -> Vec<f64> {
    let mut shares: Vec<f64> = wins
        .iter()
        .map(|w| round_pct(*w as f64 * 100.0 / draws as f64))
        .collect();
    let residue = round_pct(100.0 - shares.iter().sum::<f64>());
    if residue != 0.0 {
        let largest = shares
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap_or(0);
        shares[largest] = round_pct(shares[largest] + residue);
    }
    shares
}

fn even_share(n: usize, position: usize) -> f64 {
    let wins = vec![1u32; n];
    normalize_to_hundred(&wins, n as u32)[position]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalization_sums_to_hundred() {
        let shares = normalize_to_hundred(&[3333, 3333, 3334], 10_000);
        let total: f64 = shares.iter().sum();
        assert!((total - 100.0).abs() < 1e-9, "total was {total}");
    }

    #[test]
    fn even_split_of_three() {
        let total: f64 = (0..3).map(|i| even_share(3, i)).sum();
        assert!((total - 100.0).abs() < 1e-9);
    }

    #[test]
    fn arm_shape_tracks_counts() {
        let mut arm = BanditArmState::prior("a");
        arm.record(true, 25.0);
        arm.record(false, 99.0);
        arm.record(false, 0.0);
        assert_eq!((arm.alpha, arm.beta), (2, 3));
        assert_eq!(arm.cumulative_revenue, 25.0);
    }

    #[test]
    fn status_transitions() {
        use ExperimentStatus::*;
        assert!(Active.can_move_to(Paused));
        assert!(Completed.can_move_to(Archived));
        assert!(!Archived.can_move_to(Active));
        assert!(!Completed.can_move_to(Active));
    }
}
