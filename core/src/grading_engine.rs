//! Dual-scope percentile grading.
//!
//! Every cycle recomputes the whole population:
//!   1. Validate and normalise the snapshot (per-record isolation)
//!   2. Rank qualifying donors statewide
//!   3. Rank each county partition independently
//!   4. Publish every scope, then swap the new result set into the GradeBook
//!
//! Nothing reaches the sink or the GradeBook until every scope has been
//! computed. The sink receives the whole cycle in one call, so a cancelled
//! or failed cycle leaves the previous results in place.

use crate::{
    collaborator::{DonorSource, GradeSink},
    error::{EngineError, EngineResult},
    event::EngineEvent,
    grade::{Grade, GradeThresholds},
    subsystem::{CancelToken, EngineCycle},
    types::{DonorId, Timestamp},
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

pub const PERCENTILE_DECIMALS: i32 = 3;

// ── Public types ─────────────────────────────────────────────────────────────

/// Read-only donor row as delivered by the population source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorSnapshot {
    pub donor_id:           DonorId,
    pub contribution_total: Option<f64>,
    pub county:             Option<String>,
}

impl DonorSnapshot {
    pub fn new(donor_id: impl Into<DonorId>, total: f64, county: Option<&str>) -> Self {
        Self {
            donor_id:           donor_id.into(),
            contribution_total: Some(total),
            county:             county.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "scope", content = "county", rename_all = "snake_case")]
pub enum GradeScope {
    State,
    County(String),
}

impl GradeScope {
    /// Stable storage key: `state` or `county:<name>`.
    pub fn key(&self) -> String {
        match self {
            Self::State => "state".to_string(),
            Self::County(name) => format!("county:{name}"),
        }
    }
}

/// One ranked donor within one scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeEntry {
    pub donor_id:   DonorId,
    pub rank:       u32,
    pub percentile: f64,
    pub grade:      Grade,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeRanking {
    pub scope:   GradeScope,
    pub entries: Vec<ScopeEntry>,
}

/// Fully graded donor. Both scopes are carried side by side and never
/// reconciled with each other.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DonorRecord {
    pub donor_id:           DonorId,
    pub contribution_total: Option<f64>,
    pub county:             Option<String>,
    pub rank_state:         Option<u32>,
    pub percentile_state:   Option<f64>,
    pub grade_state:        Grade,
    pub rank_county:        Option<u32>,
    pub percentile_county:  Option<f64>,
    pub grade_county:       Grade,
}

impl DonorRecord {
    fn ungraded(donor_id: DonorId, contribution_total: Option<f64>, county: Option<String>) -> Self {
        Self {
            donor_id,
            contribution_total,
            county,
            rank_state: None,
            percentile_state: None,
            grade_state: Grade::U,
            rank_county: None,
            percentile_county: None,
            grade_county: Grade::U,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedRecord {
    pub donor_id: DonorId,
    pub reason:   String,
}

/// Output of one grading cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradingCycleResult {
    pub cycle:       u64,
    pub computed_at: Timestamp,
    /// One record per accepted input row, ordered by donor id.
    pub donors:      Vec<DonorRecord>,
    /// State scope first, then counties in name order. Empty scopes are omitted.
    pub scopes:      Vec<ScopeRanking>,
    pub skipped:     Vec<SkippedRecord>,
}

impl GradingCycleResult {
    pub fn donor(&self, donor_id: &str) -> Option<&DonorRecord> {
        self.donors
            .binary_search_by(|d| d.donor_id.as_str().cmp(donor_id))
            .ok()
            .map(|i| &self.donors[i])
    }

    pub fn qualifying_count(&self) -> usize {
        self.scopes
            .iter()
            .find(|s| s.scope == GradeScope::State)
            .map(|s| s.entries.len())
            .unwrap_or(0)
    }
}

// ── GradeBook ────────────────────────────────────────────────────────────────

/// Latest published result set. Readers hold an `Arc` to a complete cycle;
/// a new cycle replaces the pointer in one step.
#[derive(Debug, Default)]
pub struct GradeBook {
    current: RwLock<Option<Arc<GradingCycleResult>>>,
}

impl GradeBook {
    pub fn current(&self) -> Option<Arc<GradingCycleResult>> {
        self.current
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn lookup(&self, donor_id: &str) -> Option<DonorRecord> {
        self.current().and_then(|r| r.donor(donor_id).cloned())
    }

    fn swap(&self, next: Arc<GradingCycleResult>) {
        *self.current.write().unwrap_or_else(|p| p.into_inner()) = Some(next);
    }
}

// ── Engine ───────────────────────────────────────────────────────────────────

pub struct GradingEngine {
    thresholds: GradeThresholds,
    cycle_lock: Mutex<u64>,
    book:       GradeBook,
}

struct Qualifying<'a> {
    donor_id: &'a str,
    total:    f64,
}

impl GradingEngine {
    pub fn new(thresholds: GradeThresholds) -> EngineResult<Self> {
        thresholds.validate()?;
        Ok(Self {
            thresholds,
            cycle_lock: Mutex::new(0),
            book: GradeBook::default(),
        })
    }

    pub fn thresholds(&self) -> &GradeThresholds {
        &self.thresholds
    }

    pub fn book(&self) -> &GradeBook {
        &self.book
    }

    /// Run one full cycle: fetch, compute, publish, swap.
    /// Concurrent callers are serialized on the cycle lock.
    pub fn run_cycle(
        &self,
        source: &dyn DonorSource,
        sink: &dyn GradeSink,
        now: Timestamp,
        cancel: &CancelToken,
    ) -> EngineResult<Arc<GradingCycleResult>> {
        let mut cycle_counter = self
            .cycle_lock
            .lock()
            .map_err(|_| EngineError::LockPoisoned("grading cycle"))?;

        let snapshot = source.fetch_qualifying_donors()?;
        let mut result = self.compute(&snapshot, now, cancel)?;
        result.cycle = *cycle_counter + 1;

        if cancel.is_cancelled() {
            return Err(EngineError::CycleCancelled("grading"));
        }
        // Scopes ranked last cycle but empty now must be cleared in the sink.
        let cleared: Vec<GradeScope> = self
            .book
            .current()
            .map(|previous| {
                previous
                    .scopes
                    .iter()
                    .filter(|p| !result.scopes.iter().any(|s| s.scope == p.scope))
                    .map(|p| p.scope.clone())
                    .collect()
            })
            .unwrap_or_default();
        if !cleared.is_empty() {
            log::info!("grading: clearing {} scopes with no qualifying donors", cleared.len());
        }
        sink.publish_cycle(&result.scopes, &cleared)?;

        *cycle_counter += 1;
        let published = Arc::new(result);
        self.book.swap(Arc::clone(&published));

        log::info!(
            "grading: cycle={} donors={} qualifying={} scopes={} skipped={}",
            published.cycle,
            published.donors.len(),
            published.qualifying_count(),
            published.scopes.len(),
            published.skipped.len()
        );
        Ok(published)
    }

    /// Pure computation over one snapshot. Does not touch the GradeBook.
    pub fn compute(
        &self,
        snapshot: &[DonorSnapshot],
        now: Timestamp,
        cancel: &CancelToken,
    ) -> EngineResult<GradingCycleResult> {
        let mut skipped = Vec::new();
        let mut seen: HashSet<&str> = HashSet::with_capacity(snapshot.len());
        let mut donors: Vec<DonorRecord> = Vec::with_capacity(snapshot.len());

        for row in snapshot {
            if let Err(reason) = validate_row(row) {
                log::warn!("grading: skipping donor '{}': {reason}", row.donor_id);
                skipped.push(SkippedRecord { donor_id: row.donor_id.clone(), reason });
                continue;
            }
            if !seen.insert(row.donor_id.as_str()) {
                let reason = "duplicate donor id in snapshot".to_string();
                log::warn!("grading: skipping donor '{}': {reason}", row.donor_id);
                skipped.push(SkippedRecord { donor_id: row.donor_id.clone(), reason });
                continue;
            }
            if let Some(total) = row.contribution_total {
                if total < 0.0 {
                    log::warn!(
                        "grading: donor '{}' has negative total {total:.2}; grading as U",
                        row.donor_id
                    );
                }
            }
            donors.push(DonorRecord::ungraded(
                row.donor_id.clone(),
                row.contribution_total,
                normalize_county(row.county.as_deref()),
            ));
        }
        donors.sort_by(|a, b| a.donor_id.cmp(&b.donor_id));

        let mut scopes = Vec::new();
        let index: HashMap<String, usize> = donors
            .iter()
            .enumerate()
            .map(|(i, d)| (d.donor_id.clone(), i))
            .collect();

        // State scope.
        let qualifying: Vec<Qualifying<'_>> = donors
            .iter()
            .filter_map(|d| match d.contribution_total {
                Some(total) if total > 0.0 => Some(Qualifying { donor_id: &d.donor_id, total }),
                _ => None,
            })
            .collect();
        let state_entries = self.rank_scope(qualifying);

        // County partitions, in name order for deterministic output.
        let mut partitions: BTreeMap<&str, Vec<Qualifying<'_>>> = BTreeMap::new();
        for d in &donors {
            if let (Some(county), Some(total)) = (d.county.as_deref(), d.contribution_total) {
                if total > 0.0 {
                    partitions
                        .entry(county)
                        .or_default()
                        .push(Qualifying { donor_id: &d.donor_id, total });
                }
            }
        }

        let mut county_rankings = Vec::with_capacity(partitions.len());
        for (county, members) in partitions {
            if cancel.is_cancelled() {
                log::info!("grading: cancelled before county '{county}'");
                return Err(EngineError::CycleCancelled("grading"));
            }
            county_rankings.push(ScopeRanking {
                scope:   GradeScope::County(county.to_string()),
                entries: self.rank_scope(members),
            });
        }

        if !state_entries.is_empty() {
            scopes.push(ScopeRanking { scope: GradeScope::State, entries: state_entries });
        }
        scopes.extend(county_rankings);

        // Fold the rankings back onto the donor records.
        for ranking in &scopes {
            for entry in &ranking.entries {
                let Some(&i) = index.get(&entry.donor_id) else { continue };
                let record = &mut donors[i];
                match ranking.scope {
                    GradeScope::State => {
                        record.rank_state = Some(entry.rank);
                        record.percentile_state = Some(entry.percentile);
                        record.grade_state = entry.grade;
                    }
                    GradeScope::County(_) => {
                        record.rank_county = Some(entry.rank);
                        record.percentile_county = Some(entry.percentile);
                        record.grade_county = entry.grade;
                    }
                }
            }
        }

        Ok(GradingCycleResult {
            cycle: 0,
            computed_at: now,
            donors,
            scopes,
            skipped,
        })
    }

    /// Rank one scope: total descending, donor id ascending on ties.
    fn rank_scope(&self, mut members: Vec<Qualifying<'_>>) -> Vec<ScopeEntry> {
        members.sort_by(|a, b| {
            b.total
                .total_cmp(&a.total)
                .then_with(|| a.donor_id.cmp(&b.donor_id))
        });
        let n = members.len();
        members
            .into_iter()
            .enumerate()
            .map(|(i, m)| {
                let rank = i + 1;
                let percentile = percentile_for(rank, n);
                ScopeEntry {
                    donor_id: m.donor_id.to_string(),
                    rank: rank as u32,
                    percentile,
                    grade: self.thresholds.grade_for(percentile),
                }
            })
            .collect()
    }
}

// ── Scheduled cycle ──────────────────────────────────────────────────────────

pub struct GradingCycle {
    engine: Arc<GradingEngine>,
    source: Arc<dyn DonorSource>,
    sink:   Arc<dyn GradeSink>,
}

impl GradingCycle {
    pub fn new(
        engine: Arc<GradingEngine>,
        source: Arc<dyn DonorSource>,
        sink: Arc<dyn GradeSink>,
    ) -> Self {
        Self { engine, source, sink }
    }
}

impl EngineCycle for GradingCycle {
    fn name(&self) -> &'static str {
        "grading"
    }

    fn run(&self, now: Timestamp, cancel: &CancelToken) -> EngineResult<Vec<EngineEvent>> {
        let previous_cycle = self.engine.book().current().map(|r| r.cycle);
        let result = self
            .engine
            .run_cycle(self.source.as_ref(), self.sink.as_ref(), now, cancel)?;

        let mut events: Vec<EngineEvent> = result
            .skipped
            .iter()
            .cloned()
            .map(|record| EngineEvent::DonorRecordSkipped { record })
            .collect();
        events.push(EngineEvent::GradingCycleCompleted {
            cycle: result.cycle,
            donors: result.donors.len(),
            qualifying: result.qualifying_count(),
            county_scopes: result
                .scopes
                .iter()
                .filter(|s| matches!(s.scope, GradeScope::County(_)))
                .count(),
            previous_cycle,
        });
        Ok(events)
    }
}

/// `100 × (1 − (rank − 1) / n)`, rounded to three decimals.
pub fn percentile_for(rank: usize, n: usize) -> f64 {
    if n == 0 {
        return 0.0;
    }
    let raw = 100.0 * (1.0 - (rank as f64 - 1.0) / n as f64);
    let scale = 10f64.powi(PERCENTILE_DECIMALS);
    (raw * scale).round() / scale
}

fn validate_row(row: &DonorSnapshot) -> Result<(), String> {
    if row.donor_id.trim().is_empty() {
        return Err("empty donor id".into());
    }
    match row.contribution_total {
        Some(total) if !total.is_finite() => Err(format!("non-finite contribution total {total}")),
        _ => Ok(()),
    }
}

fn normalize_county(county: Option<&str>) -> Option<String> {
    county
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentile_top_and_bottom() {
        assert_eq!(percentile_for(1, 100), 100.0);
        assert_eq!(percentile_for(100, 100), 1.0);
        assert_eq!(percentile_for(1, 1), 100.0);
    }

    #[test]
    fn percentile_rounds_to_three_decimals() {
        // 100 * (1 - 1/3) = 66.666...
        assert_eq!(percentile_for(2, 3), 66.667);
    }

    #[test]
    fn blank_county_is_null() {
        assert_eq!(normalize_county(Some("   ")), None);
        assert_eq!(normalize_county(Some(" Travis ")), Some("Travis".into()));
    }
}
