//! Self-correction loop over per-function cost/quality metrics.
//!
//! Per rule: Idle → Triggered → {Applied | PendingApproval | Suppressed}
//! and, on operator request, Applied → RolledBack.
//!
//! RULES:
//!   - Rules are parsed and validated at load; evaluation cannot fail on a rule.
//!   - A function's clock read, cap accounting and event append happen under
//!     that function's lock. Different functions evaluate in parallel.
//!   - Approval requests are handed to the gate after the lock is released and
//!     never awaited.

use crate::{
    clock::Clock,
    collaborator::{ApprovalGate, MetricSource},
    error::{EngineError, EngineResult},
    event::EngineEvent,
    subsystem::{CancelToken, EngineCycle},
    types::{FunctionCode, RuleId, Timestamp},
};
use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

// ── Metric window ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionMetricWindow {
    pub function_code:       FunctionCode,
    pub period_start:        Timestamp,
    pub period_end:          Timestamp,
    pub forecast_cost:       f64,
    pub actual_cost:         f64,
    pub quality_score:       Option<f64>,
    pub effectiveness_score: Option<f64>,
}

impl FunctionMetricWindow {
    /// Reject windows whose derived metrics would be meaningless.
    pub fn validate(&self) -> EngineResult<()> {
        let fail = |reason: String| Err(EngineError::invalid_input(self.function_code.clone(), reason));
        if self.period_end <= self.period_start {
            return fail("period end is not after period start".into());
        }
        if !self.forecast_cost.is_finite() || self.forecast_cost <= 0.0 {
            return fail(format!("forecast cost must be positive, got {}", self.forecast_cost));
        }
        if !self.actual_cost.is_finite() || self.actual_cost < 0.0 {
            return fail(format!("actual cost must be non-negative, got {}", self.actual_cost));
        }
        for (name, score) in [
            ("quality score", self.quality_score),
            ("effectiveness score", self.effectiveness_score),
        ] {
            if let Some(value) = score {
                if !value.is_finite() {
                    return fail(format!("{name} is not finite"));
                }
            }
        }
        Ok(())
    }

    /// `(actual − forecast) / forecast × 100`, two decimals.
    pub fn cost_variance_pct(&self) -> f64 {
        let raw = (self.actual_cost - self.forecast_cost) / self.forecast_cost * 100.0;
        (raw * 100.0).round() / 100.0
    }

    pub fn severity(&self) -> VarianceSeverity {
        VarianceSeverity::from_variance_pct(self.cost_variance_pct())
    }

    pub fn metric(&self, metric: MetricName) -> Option<f64> {
        match metric {
            MetricName::CostVariancePct => Some(self.cost_variance_pct()),
            MetricName::AbsCostVariancePct => Some(self.cost_variance_pct().abs()),
            MetricName::ActualCost => Some(self.actual_cost),
            MetricName::ForecastCost => Some(self.forecast_cost),
            MetricName::QualityScore => self.quality_score,
            MetricName::EffectivenessScore => self.effectiveness_score,
        }
    }
}

/// Reporting band for `|costVariancePct|`. Not used for control decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VarianceSeverity {
    Green,
    Yellow,
    Orange,
    Red,
    Critical,
}

impl VarianceSeverity {
    pub fn from_variance_pct(pct: f64) -> Self {
        let magnitude = pct.abs();
        if magnitude <= 5.0 {
            Self::Green
        } else if magnitude <= 10.0 {
            Self::Yellow
        } else if magnitude <= 20.0 {
            Self::Orange
        } else if magnitude <= 50.0 {
            Self::Red
        } else {
            Self::Critical
        }
    }
}

// ── Rules ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricName {
    CostVariancePct,
    AbsCostVariancePct,
    ActualCost,
    ForecastCost,
    QualityScore,
    EffectivenessScore,
}

impl MetricName {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "cost_variance_pct" => Some(Self::CostVariancePct),
            "abs_cost_variance_pct" => Some(Self::AbsCostVariancePct),
            "actual_cost" => Some(Self::ActualCost),
            "forecast_cost" => Some(Self::ForecastCost),
            "quality_score" => Some(Self::QualityScore),
            "effectiveness_score" => Some(Self::EffectivenessScore),
            _ => None,
        }
    }

    pub fn unit(&self) -> ThresholdUnit {
        match self {
            Self::CostVariancePct | Self::AbsCostVariancePct => ThresholdUnit::Percent,
            Self::ActualCost | Self::ForecastCost => ThresholdUnit::Currency,
            Self::QualityScore | Self::EffectivenessScore => ThresholdUnit::Score,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdUnit {
    Percent,
    Currency,
    Score,
}

impl ThresholdUnit {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "percent" | "%" => Some(Self::Percent),
            "currency" | "usd" | "dollars" => Some(Self::Currency),
            "score" | "points" => Some(Self::Score),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
}

impl Comparison {
    fn parse(s: &str) -> Option<Self> {
        match s {
            ">" | "gt" => Some(Self::Gt),
            ">=" | "gte" => Some(Self::Gte),
            "<" | "lt" => Some(Self::Lt),
            "<=" | "lte" => Some(Self::Lte),
            "==" | "=" | "eq" => Some(Self::Eq),
            _ => None,
        }
    }

    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Gte => value >= threshold,
            Self::Lt => value < threshold,
            Self::Lte => value <= threshold,
            Self::Eq => value == threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub metric:     MetricName,
    pub comparison: Comparison,
    pub threshold:  f64,
    pub unit:       ThresholdUnit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelTier {
    Economy,
    Standard,
    Premium,
}

impl ModelTier {
    /// One step cheaper; Economy is the floor.
    pub fn downgrade(self) -> Self {
        match self {
            Self::Premium => Self::Standard,
            Self::Standard | Self::Economy => Self::Economy,
        }
    }
}

/// Tunable knobs of one metered function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionParameters {
    pub model_tier:            ModelTier,
    pub batch_size:            u32,
    pub rate_limit_per_minute: Option<u32>,
    pub paused:                bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum CorrectionAction {
    DowngradeModelTier,
    ThrottleBatchSize { factor: f64, min_batch_size: u32 },
    LimitRate { per_minute: u32 },
    PauseFunction,
}

impl CorrectionAction {
    pub fn apply(&self, current: &FunctionParameters) -> FunctionParameters {
        let mut next = current.clone();
        match self {
            Self::DowngradeModelTier => next.model_tier = current.model_tier.downgrade(),
            Self::ThrottleBatchSize { factor, min_batch_size } => {
                let scaled = (current.batch_size as f64 * factor).floor() as u32;
                next.batch_size = scaled.max(*min_batch_size).min(current.batch_size);
            }
            Self::LimitRate { per_minute } => {
                next.rate_limit_per_minute = Some(
                    current
                        .rate_limit_per_minute
                        .map_or(*per_minute, |existing| existing.min(*per_minute)),
                );
            }
            Self::PauseFunction => next.paused = true,
        }
        next
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::DowngradeModelTier => "downgrade_model_tier",
            Self::ThrottleBatchSize { .. } => "throttle_batch_size",
            Self::LimitRate { .. } => "limit_rate",
            Self::PauseFunction => "pause_function",
        }
    }
}

/// Rule as written in `correction_rules.json`. Loosely typed on purpose;
/// `CorrectionRule::from_config` turns it into a checked rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub rule_id:                 RuleId,
    pub function_code:           FunctionCode,
    pub metric:                  String,
    pub operator:                String,
    pub threshold:               serde_json::Value,
    pub unit:                    String,
    pub action:                  String,
    #[serde(default)]
    pub parameters:              serde_json::Map<String, serde_json::Value>,
    pub max_corrections_per_day: u32,
    pub cooldown_minutes:        u32,
    #[serde(default)]
    pub requires_approval:       bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionRule {
    pub rule_id:                 RuleId,
    pub function_code:           FunctionCode,
    pub trigger:                 TriggerCondition,
    pub action:                  CorrectionAction,
    pub max_corrections_per_day: u32,
    pub cooldown_minutes:        u32,
    pub requires_approval:       bool,
}

impl CorrectionRule {
    pub fn from_config(config: &RuleConfig) -> EngineResult<Self> {
        let invalid = |reason: String| EngineError::invalid_rule(config.rule_id.clone(), reason);

        if config.rule_id.trim().is_empty() {
            return Err(invalid("empty rule id".into()));
        }
        if config.function_code.trim().is_empty() {
            return Err(invalid("empty function code".into()));
        }
        let metric = MetricName::parse(&config.metric)
            .ok_or_else(|| invalid(format!("unknown metric '{}'", config.metric)))?;
        let comparison = Comparison::parse(&config.operator)
            .ok_or_else(|| invalid(format!("unknown operator '{}'", config.operator)))?;
        let unit = ThresholdUnit::parse(&config.unit)
            .ok_or_else(|| invalid(format!("unknown unit '{}'", config.unit)))?;
        if unit != metric.unit() {
            return Err(invalid(format!(
                "metric '{}' is measured in {:?}, threshold is in {:?}",
                config.metric,
                metric.unit(),
                unit
            )));
        }
        let threshold = config
            .threshold
            .as_f64()
            .filter(|t| t.is_finite())
            .ok_or_else(|| invalid(format!("threshold {} is not a finite number", config.threshold)))?;
        if config.max_corrections_per_day == 0 {
            return Err(invalid("max_corrections_per_day must be at least 1".into()));
        }

        let action = parse_action(&config.action, &config.parameters).map_err(invalid)?;

        Ok(Self {
            rule_id: config.rule_id.clone(),
            function_code: config.function_code.clone(),
            trigger: TriggerCondition { metric, comparison, threshold, unit },
            action,
            max_corrections_per_day: config.max_corrections_per_day,
            cooldown_minutes: config.cooldown_minutes,
            requires_approval: config.requires_approval,
        })
    }
}

fn parse_action(
    name: &str,
    params: &serde_json::Map<String, serde_json::Value>,
) -> Result<CorrectionAction, String> {
    let number = |key: &str| -> Result<f64, String> {
        params
            .get(key)
            .and_then(|v| v.as_f64())
            .ok_or_else(|| format!("action '{name}' needs numeric parameter '{key}'"))
    };
    match name {
        "downgrade_model_tier" => Ok(CorrectionAction::DowngradeModelTier),
        "pause_function" => Ok(CorrectionAction::PauseFunction),
        "throttle_batch_size" => {
            let factor = number("factor")?;
            if !(factor > 0.0 && factor < 1.0) {
                return Err(format!("throttle factor must be in (0, 1), got {factor}"));
            }
            let min_batch_size = params.get("min_batch_size").and_then(|v| v.as_u64()).unwrap_or(1);
            if min_batch_size == 0 || min_batch_size > u64::from(u32::MAX) {
                return Err(format!("min_batch_size {min_batch_size} out of range"));
            }
            Ok(CorrectionAction::ThrottleBatchSize {
                factor,
                min_batch_size: min_batch_size as u32,
            })
        }
        "limit_rate" => {
            let per_minute = number("per_minute")?;
            if per_minute < 1.0 || per_minute.fract() != 0.0 || per_minute > f64::from(u32::MAX) {
                return Err(format!("per_minute must be a positive integer, got {per_minute}"));
            }
            Ok(CorrectionAction::LimitRate { per_minute: per_minute as u32 })
        }
        other => Err(format!("unknown action '{other}'")),
    }
}

/// Parse every rule; invalid rules are returned separately so one bad entry
/// only disables itself.
pub fn load_rules(configs: &[RuleConfig]) -> (Vec<CorrectionRule>, Vec<EngineError>) {
    let mut rules = Vec::new();
    let mut errors = Vec::new();
    for config in configs {
        match CorrectionRule::from_config(config) {
            Ok(rule) => rules.push(rule),
            Err(e) => {
                log::error!("variance: rejecting rule '{}': {e}", config.rule_id);
                errors.push(e);
            }
        }
    }
    (rules, errors)
}

// ── Events and outcomes ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorrectionStatus {
    Applied,
    PendingApproval,
    Rejected,
    RolledBack,
}

impl fmt::Display for CorrectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Applied => "applied",
            Self::PendingApproval => "pending_approval",
            Self::Rejected => "rejected",
            Self::RolledBack => "rolled_back",
        };
        f.write_str(s)
    }
}

/// One firing of a rule. The firing facts never change; only `status`,
/// `resolved_at` and `note` move when an operator acts on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionEvent {
    pub event_id:       Uuid,
    pub rule_id:        RuleId,
    pub function_code:  FunctionCode,
    pub triggered_at:   Timestamp,
    pub metric:         MetricName,
    pub observed_value: f64,
    pub threshold:      f64,
    pub action:         CorrectionAction,
    pub before:         FunctionParameters,
    pub after:          FunctionParameters,
    pub status:         CorrectionStatus,
    pub resolved_at:    Option<Timestamp>,
    pub note:           Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum SuppressionReason {
    Cooldown {
        last_fired_at: Timestamp,
        retry_after:   Timestamp,
    },
    DailyCap {
        fired_today: u32,
        cap:         u32,
    },
}

impl fmt::Display for SuppressionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cooldown { last_fired_at, retry_after } => write!(
                f,
                "cooldown: last fired at {last_fired_at}, eligible again at {retry_after}"
            ),
            Self::DailyCap { fired_today, cap } => {
                write!(f, "daily cap: {fired_today} of {cap} corrections already used today")
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RuleOutcome {
    NotTriggered {
        rule_id: RuleId,
    },
    Applied {
        event: CorrectionEvent,
    },
    PendingApproval {
        event: CorrectionEvent,
    },
    SuppressedByPolicy {
        rule_id:        RuleId,
        function_code:  FunctionCode,
        observed_value: f64,
        at:             Timestamp,
        reason:         SuppressionReason,
    },
}

impl RuleOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    pub fn is_suppressed(&self) -> bool {
        matches!(self, Self::SuppressedByPolicy { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionEvaluation {
    pub function_code:     FunctionCode,
    pub cost_variance_pct: f64,
    pub severity:          VarianceSeverity,
    pub outcomes:          Vec<RuleOutcome>,
}

// ── Controller ───────────────────────────────────────────────────────────────

/// Correction events kept in memory per function. Older resolved events
/// are evicted first; pending approvals are never evicted.
pub const HISTORY_RETENTION: usize = 500;

/// Per-rule firing accounting. Cooldown and daily-cap checks read only this.
#[derive(Debug, Clone, Copy)]
struct FiringLedger {
    last_fired_at: Timestamp,
    day:           NaiveDate,
    fired_on_day:  u32,
}

struct FunctionState {
    parameters: FunctionParameters,
    rules:      Vec<CorrectionRule>,
    history:    Vec<CorrectionEvent>,
    ledger:     HashMap<RuleId, FiringLedger>,
}

impl FunctionState {
    fn new(parameters: FunctionParameters, rules: Vec<CorrectionRule>) -> Self {
        Self { parameters, rules, history: Vec::new(), ledger: HashMap::new() }
    }

    fn policy_block(&self, rule: &CorrectionRule, now: Timestamp) -> Option<SuppressionReason> {
        let ledger = self.ledger.get(&rule.rule_id)?;

        let cooldown = Duration::minutes(i64::from(rule.cooldown_minutes));
        if now - ledger.last_fired_at < cooldown {
            return Some(SuppressionReason::Cooldown {
                last_fired_at: ledger.last_fired_at,
                retry_after:   ledger.last_fired_at + cooldown,
            });
        }

        let fired_today = if ledger.day == now.date_naive() { ledger.fired_on_day } else { 0 };
        if fired_today >= rule.max_corrections_per_day {
            return Some(SuppressionReason::DailyCap {
                fired_today,
                cap: rule.max_corrections_per_day,
            });
        }
        None
    }

    /// Append a firing and return the ids evicted to stay within retention.
    fn record_firing(&mut self, event: CorrectionEvent) -> Vec<Uuid> {
        let now = event.triggered_at;
        let today = now.date_naive();
        self.ledger
            .entry(event.rule_id.clone())
            .and_modify(|l| {
                if l.day == today {
                    l.fired_on_day += 1;
                } else {
                    l.day = today;
                    l.fired_on_day = 1;
                }
                l.last_fired_at = now;
            })
            .or_insert(FiringLedger { last_fired_at: now, day: today, fired_on_day: 1 });
        self.history.push(event);

        let mut evicted = Vec::new();
        while self.history.len() > HISTORY_RETENTION {
            let Some(oldest) = self
                .history
                .iter()
                .position(|e| e.status != CorrectionStatus::PendingApproval)
            else {
                break;
            };
            evicted.push(self.history.remove(oldest).event_id);
        }
        evicted
    }

    fn event_mut(&mut self, event_id: Uuid) -> EngineResult<&mut CorrectionEvent> {
        self.history
            .iter_mut()
            .find(|e| e.event_id == event_id)
            .ok_or_else(|| EngineError::UnknownCorrectionEvent(event_id.to_string()))
    }
}

pub struct VarianceController {
    functions:     RwLock<HashMap<FunctionCode, Arc<Mutex<FunctionState>>>>,
    event_index:   RwLock<HashMap<Uuid, FunctionCode>>,
    approval_gate: Arc<dyn ApprovalGate>,
    clock:         Arc<dyn Clock>,
}

impl VarianceController {
    pub fn new(approval_gate: Arc<dyn ApprovalGate>, clock: Arc<dyn Clock>) -> Self {
        Self {
            functions: RwLock::new(HashMap::new()),
            event_index: RwLock::new(HashMap::new()),
            approval_gate,
            clock,
        }
    }

    /// Register a function with its starting parameters and rules.
    pub fn register_function(
        &self,
        function_code: &str,
        parameters: FunctionParameters,
        rules: Vec<CorrectionRule>,
    ) -> EngineResult<()> {
        let mut ids = HashSet::new();
        for rule in &rules {
            if rule.function_code != function_code {
                return Err(EngineError::invalid_rule(
                    rule.rule_id.clone(),
                    format!("rule targets '{}', not '{function_code}'", rule.function_code),
                ));
            }
            if !ids.insert(rule.rule_id.as_str()) {
                return Err(EngineError::invalid_rule(rule.rule_id.clone(), "duplicate rule id"));
            }
        }

        let state = FunctionState::new(parameters, rules);
        self.functions
            .write()
            .map_err(|_| EngineError::LockPoisoned("function registry"))?
            .insert(function_code.to_string(), Arc::new(Mutex::new(state)));
        log::info!("variance: registered function '{function_code}'");
        Ok(())
    }

    pub fn function_codes(&self) -> EngineResult<Vec<FunctionCode>> {
        let registry = self
            .functions
            .read()
            .map_err(|_| EngineError::LockPoisoned("function registry"))?;
        let mut codes: Vec<FunctionCode> = registry.keys().cloned().collect();
        codes.sort();
        Ok(codes)
    }

    /// Evaluate every rule of the window's function, in rule order.
    pub fn evaluate(&self, window: &FunctionMetricWindow) -> EngineResult<FunctionEvaluation> {
        window.validate()?;
        let function = self.function(&window.function_code)?;

        let mut outcomes = Vec::new();
        let mut approvals = Vec::new();
        {
            let mut state = function
                .lock()
                .map_err(|_| EngineError::LockPoisoned("function state"))?;
            let now = self.clock.now();
            let rules = state.rules.clone();

            for rule in &rules {
                let Some(observed) = window.metric(rule.trigger.metric) else {
                    log::debug!(
                        "variance: rule '{}' skipped, window has no {:?}",
                        rule.rule_id,
                        rule.trigger.metric
                    );
                    outcomes.push(RuleOutcome::NotTriggered { rule_id: rule.rule_id.clone() });
                    continue;
                };
                if !rule.trigger.comparison.holds(observed, rule.trigger.threshold) {
                    outcomes.push(RuleOutcome::NotTriggered { rule_id: rule.rule_id.clone() });
                    continue;
                }

                if let Some(reason) = state.policy_block(rule, now) {
                    log::info!(
                        "variance: '{}' rule '{}' suppressed ({reason})",
                        window.function_code,
                        rule.rule_id
                    );
                    outcomes.push(RuleOutcome::SuppressedByPolicy {
                        rule_id: rule.rule_id.clone(),
                        function_code: window.function_code.clone(),
                        observed_value: observed,
                        at: now,
                        reason,
                    });
                    continue;
                }

                let before = state.parameters.clone();
                let after = rule.action.apply(&before);
                let status = if rule.requires_approval {
                    CorrectionStatus::PendingApproval
                } else {
                    state.parameters = after.clone();
                    CorrectionStatus::Applied
                };
                let event = CorrectionEvent {
                    event_id: Uuid::new_v4(),
                    rule_id: rule.rule_id.clone(),
                    function_code: window.function_code.clone(),
                    triggered_at: now,
                    metric: rule.trigger.metric,
                    observed_value: observed,
                    threshold: rule.trigger.threshold,
                    action: rule.action.clone(),
                    before,
                    after,
                    status,
                    resolved_at: None,
                    note: None,
                };
                let evicted = state.record_firing(event.clone());
                self.index_event(&event, &evicted)?;

                if rule.requires_approval {
                    log::info!(
                        "variance: '{}' rule '{}' awaiting approval ({})",
                        window.function_code,
                        rule.rule_id,
                        rule.action.name()
                    );
                    approvals.push(event.clone());
                    outcomes.push(RuleOutcome::PendingApproval { event });
                } else {
                    log::warn!(
                        "variance: '{}' rule '{}' applied {} ({:?} {:.2} vs {:.2})",
                        window.function_code,
                        rule.rule_id,
                        rule.action.name(),
                        rule.trigger.metric,
                        observed,
                        rule.trigger.threshold
                    );
                    outcomes.push(RuleOutcome::Applied { event });
                }
            }
        }

        for event in &approvals {
            if let Err(e) = self.approval_gate.request_approval(event) {
                log::error!("variance: approval request for {} failed: {e}", event.event_id);
            }
        }

        Ok(FunctionEvaluation {
            function_code: window.function_code.clone(),
            cost_variance_pct: window.cost_variance_pct(),
            severity: window.severity(),
            outcomes,
        })
    }

    /// Apply an approval decision to a pending event. On approval the
    /// action is re-applied to the parameters current at decision time.
    pub fn resolve_approval(
        &self,
        event_id: Uuid,
        approved: bool,
        note: Option<String>,
    ) -> EngineResult<CorrectionEvent> {
        let function = self.function_for_event(event_id)?;
        let mut state = function
            .lock()
            .map_err(|_| EngineError::LockPoisoned("function state"))?;
        let now = self.clock.now();
        let current = state.parameters.clone();

        let event = state.event_mut(event_id)?;
        if event.status != CorrectionStatus::PendingApproval {
            return Err(EngineError::InvalidTransition {
                from: event.status.to_string(),
                to:   if approved { "applied" } else { "rejected" }.into(),
            });
        }
        if approved {
            event.before = current;
            event.after = event.action.apply(&event.before);
            event.status = CorrectionStatus::Applied;
        } else {
            event.status = CorrectionStatus::Rejected;
        }
        event.resolved_at = Some(now);
        event.note = note;
        let resolved = event.clone();

        if approved {
            state.parameters = resolved.after.clone();
        }
        log::info!(
            "variance: correction {} for '{}' {}",
            event_id,
            resolved.function_code,
            resolved.status
        );
        Ok(resolved)
    }

    /// Restore the parameters captured before an applied correction.
    pub fn rollback(&self, event_id: Uuid, note: Option<String>) -> EngineResult<CorrectionEvent> {
        let function = self.function_for_event(event_id)?;
        let mut state = function
            .lock()
            .map_err(|_| EngineError::LockPoisoned("function state"))?;
        let now = self.clock.now();

        let event = state.event_mut(event_id)?;
        if event.status != CorrectionStatus::Applied {
            return Err(EngineError::InvalidTransition {
                from: event.status.to_string(),
                to:   CorrectionStatus::RolledBack.to_string(),
            });
        }
        event.status = CorrectionStatus::RolledBack;
        event.resolved_at = Some(now);
        event.note = note;
        let rolled_back = event.clone();

        state.parameters = rolled_back.before.clone();
        log::warn!(
            "variance: correction {} for '{}' rolled back",
            event_id,
            rolled_back.function_code
        );
        Ok(rolled_back)
    }

    pub fn parameters(&self, function_code: &str) -> EngineResult<FunctionParameters> {
        let function = self.function(function_code)?;
        let state = function
            .lock()
            .map_err(|_| EngineError::LockPoisoned("function state"))?;
        Ok(state.parameters.clone())
    }

    pub fn history(&self, function_code: &str) -> EngineResult<Vec<CorrectionEvent>> {
        let function = self.function(function_code)?;
        let state = function
            .lock()
            .map_err(|_| EngineError::LockPoisoned("function state"))?;
        Ok(state.history.clone())
    }

    pub fn event(&self, event_id: Uuid) -> EngineResult<CorrectionEvent> {
        let function = self.function_for_event(event_id)?;
        let mut state = function
            .lock()
            .map_err(|_| EngineError::LockPoisoned("function state"))?;
        Ok(state.event_mut(event_id)?.clone())
    }

    fn function(&self, function_code: &str) -> EngineResult<Arc<Mutex<FunctionState>>> {
        self.functions
            .read()
            .map_err(|_| EngineError::LockPoisoned("function registry"))?
            .get(function_code)
            .cloned()
            .ok_or_else(|| EngineError::UnknownFunction(function_code.to_string()))
    }

    fn function_for_event(&self, event_id: Uuid) -> EngineResult<Arc<Mutex<FunctionState>>> {
        let code = self
            .event_index
            .read()
            .map_err(|_| EngineError::LockPoisoned("event index"))?
            .get(&event_id)
            .cloned()
            .ok_or_else(|| EngineError::UnknownCorrectionEvent(event_id.to_string()))?;
        self.function(&code)
    }

    fn index_event(&self, event: &CorrectionEvent, evicted: &[Uuid]) -> EngineResult<()> {
        let mut index = self
            .event_index
            .write()
            .map_err(|_| EngineError::LockPoisoned("event index"))?;
        for id in evicted {
            index.remove(id);
        }
        index.insert(event.event_id, event.function_code.clone());
        Ok(())
    }
}

// ── Scheduled cycle ──────────────────────────────────────────────────────────

/// Evaluates the trailing window of every registered function, one worker
/// thread per function.
pub struct VarianceCycle {
    controller: Arc<VarianceController>,
    metrics:    Arc<dyn MetricSource>,
    window:     Duration,
}

impl VarianceCycle {
    pub fn new(
        controller: Arc<VarianceController>,
        metrics: Arc<dyn MetricSource>,
        window: Duration,
    ) -> Self {
        Self { controller, metrics, window }
    }

    fn evaluate_function(&self, function_code: &str, now: Timestamp) -> EngineResult<Vec<EngineEvent>> {
        let Some(window) = self
            .metrics
            .fetch_metric_window(function_code, now - self.window, now)?
        else {
            log::debug!("variance: no metric window for '{function_code}'");
            return Ok(Vec::new());
        };

        let evaluation = match self.controller.evaluate(&window) {
            Ok(evaluation) => evaluation,
            Err(EngineError::InvalidInput { reason, .. }) => {
                log::warn!("variance: skipping window for '{function_code}': {reason}");
                return Ok(vec![EngineEvent::MetricWindowRejected {
                    function_code: function_code.to_string(),
                    reason,
                }]);
            }
            Err(e) => return Err(e),
        };

        let events = evaluation
            .outcomes
            .into_iter()
            .filter_map(|outcome| match outcome {
                RuleOutcome::NotTriggered { .. } => None,
                RuleOutcome::Applied { event } | RuleOutcome::PendingApproval { event } => {
                    Some(EngineEvent::CorrectionRecorded { event, severity: evaluation.severity })
                }
                RuleOutcome::SuppressedByPolicy { rule_id, function_code, observed_value, reason, .. } => {
                    Some(EngineEvent::CorrectionSuppressed {
                        rule_id,
                        function_code,
                        observed_value,
                        reason,
                    })
                }
            })
            .collect();
        Ok(events)
    }
}

impl EngineCycle for VarianceCycle {
    fn name(&self) -> &'static str {
        "variance"
    }

    fn run(&self, now: Timestamp, cancel: &CancelToken) -> EngineResult<Vec<EngineEvent>> {
        let codes = self.controller.function_codes()?;
        let results: Vec<(FunctionCode, EngineResult<Vec<EngineEvent>>)> = std::thread::scope(|scope| {
            let handles: Vec<_> = codes
                .iter()
                .filter(|_| !cancel.is_cancelled())
                .map(|code| (code, scope.spawn(move || self.evaluate_function(code, now))))
                .collect();
            handles
                .into_iter()
                .map(|(code, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(EngineError::Other(anyhow::anyhow!("evaluation thread panicked")))
                    });
                    (code.clone(), result)
                })
                .collect()
        });

        let mut events = Vec::new();
        for (code, result) in results {
            match result {
                Ok(function_events) => events.extend(function_events),
                Err(e) => log::error!("variance: evaluation of '{code}' failed: {e}"),
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_bands() {
        assert_eq!(VarianceSeverity::from_variance_pct(5.0), VarianceSeverity::Green);
        assert_eq!(VarianceSeverity::from_variance_pct(-7.5), VarianceSeverity::Yellow);
        assert_eq!(VarianceSeverity::from_variance_pct(20.0), VarianceSeverity::Orange);
        assert_eq!(VarianceSeverity::from_variance_pct(50.0), VarianceSeverity::Red);
        assert_eq!(VarianceSeverity::from_variance_pct(-50.01), VarianceSeverity::Critical);
    }

    #[test]
    fn throttle_respects_floor() {
        let params = FunctionParameters {
            model_tier:            ModelTier::Premium,
            batch_size:            10,
            rate_limit_per_minute: None,
            paused:                false,
        };
        let action = CorrectionAction::ThrottleBatchSize { factor: 0.5, min_batch_size: 8 };
        assert_eq!(action.apply(&params).batch_size, 8);
    }

    #[test]
    fn rate_limit_only_tightens() {
        let params = FunctionParameters {
            model_tier:            ModelTier::Standard,
            batch_size:            100,
            rate_limit_per_minute: Some(30),
            paused:                false,
        };
        let action = CorrectionAction::LimitRate { per_minute: 60 };
        assert_eq!(action.apply(&params).rate_limit_per_minute, Some(30));
    }

    #[test]
    fn tier_floor_is_economy() {
        assert_eq!(ModelTier::Premium.downgrade(), ModelTier::Standard);
        assert_eq!(ModelTier::Economy.downgrade(), ModelTier::Economy);
    }
}
