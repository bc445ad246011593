//! The Orchestrator: wires engines to collaborators and runs the cycles.
//!
//! CYCLES (independent, each on its own interval):
//!   1. grading            full-population recompute (nightly by default)
//!   2. bandit_allocation  probability-of-best refresh for active experiments
//!   3. variance           trailing-window evaluation of every function
//!
//! Bandit outcomes are not a cycle: callers record them in real time through
//! `bandit()`.
//!
//! RULES:
//!   - Engines never call each other; only the Orchestrator sequences them.
//!   - Every event a cycle or command returns is written to the audit sink.
//!   - A failing cycle is logged and retried on its next interval; it never
//!     stops the other cycles.

use crate::{
    bandit_engine::{AllocationCycle, BanditEngine},
    clock::Clock,
    collaborator::{ApprovalGate, ArmStore, AuditSink, DonorSource, GradeSink, MetricSource},
    command::OperatorCommand,
    config::EngineConfig,
    error::{EngineError, EngineResult},
    event::EngineEvent,
    grading_engine::{GradingCycle, GradingEngine},
    rng::RngBank,
    store::EngineStore,
    subsystem::{CancelToken, EngineCycle},
    types::{FunctionCode, Timestamp},
    variance_controller::{load_rules, CorrectionRule, VarianceController, VarianceCycle},
};
use chrono::Duration;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// Every external dependency the engines need.
#[derive(Clone)]
pub struct Collaborators {
    pub donors:    Arc<dyn DonorSource>,
    pub grades:    Arc<dyn GradeSink>,
    pub arms:      Arc<dyn ArmStore>,
    pub metrics:   Arc<dyn MetricSource>,
    pub approvals: Arc<dyn ApprovalGate>,
    pub audit:     Arc<dyn AuditSink>,
}

impl Collaborators {
    /// Route every collaborator to one SQLite store.
    pub fn from_store(store: Arc<EngineStore>) -> Self {
        Self {
            donors:    store.clone(),
            grades:    store.clone(),
            arms:      store.clone(),
            metrics:   store.clone(),
            approvals: store.clone(),
            audit:     store,
        }
    }
}

struct ScheduledCycle {
    cycle:    Arc<dyn EngineCycle>,
    interval: Duration,
    next_due: Option<Timestamp>,
}

/// What happened to one cycle in a `run_due` pass.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleReport {
    pub cycle:  &'static str,
    pub events: usize,
    pub error:  Option<String>,
}

pub struct Orchestrator {
    grading:        Arc<GradingEngine>,
    bandit:         Arc<BanditEngine>,
    variance:       Arc<VarianceController>,
    approvals:      Arc<dyn ApprovalGate>,
    audit:          Arc<dyn AuditSink>,
    clock:          Arc<dyn Clock>,
    cycles:         Vec<ScheduledCycle>,
    rejected_rules: Vec<EngineError>,
}

impl Orchestrator {
    /// Build a fully wired orchestrator with all cycles registered.
    pub fn build(
        config: &EngineConfig,
        collaborators: Collaborators,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<Self> {
        config.validate()?;

        let grading = Arc::new(GradingEngine::new(config.grading.clone())?);
        let bandit = Arc::new(BanditEngine::new(
            collaborators.arms.clone(),
            RngBank::new(config.schedule.master_seed),
            config.bandit.allocation_draws,
        ));
        let variance = Arc::new(VarianceController::new(
            collaborators.approvals.clone(),
            clock.clone(),
        ));

        let (rules, mut rejected_rules) = load_rules(&config.variance.rules);
        let mut by_function: HashMap<FunctionCode, Vec<CorrectionRule>> = HashMap::new();
        for rule in rules {
            by_function.entry(rule.function_code.clone()).or_default().push(rule);
        }
        for function in &config.variance.functions {
            let rules = by_function.remove(&function.function_code).unwrap_or_default();
            variance.register_function(&function.function_code, function.parameters.clone(), rules)?;
        }
        for (function_code, orphans) in by_function {
            for rule in orphans {
                let e = EngineError::invalid_rule(
                    rule.rule_id,
                    format!("function '{function_code}' is not configured"),
                );
                log::error!("engine: {e}");
                rejected_rules.push(e);
            }
        }

        let schedule = &config.schedule;
        let minutes = |m: u32| Duration::minutes(i64::from(m));
        let cycles = vec![
            ScheduledCycle {
                cycle:    Arc::new(GradingCycle::new(
                    grading.clone(),
                    collaborators.donors.clone(),
                    collaborators.grades.clone(),
                )),
                interval: minutes(schedule.grading_interval_minutes),
                next_due: None,
            },
            ScheduledCycle {
                cycle:    Arc::new(AllocationCycle::new(bandit.clone())),
                interval: minutes(schedule.allocation_interval_minutes),
                next_due: None,
            },
            ScheduledCycle {
                cycle:    Arc::new(VarianceCycle::new(
                    variance.clone(),
                    collaborators.metrics.clone(),
                    minutes(schedule.variance_window_minutes),
                )),
                interval: minutes(schedule.variance_interval_minutes),
                next_due: None,
            },
        ];

        Ok(Self {
            grading,
            bandit,
            variance,
            approvals: collaborators.approvals,
            audit: collaborators.audit,
            clock,
            cycles,
            rejected_rules,
        })
    }

    /// In-memory SQLite store behind every collaborator (tests and demos).
    pub fn build_in_memory(
        config: &EngineConfig,
        clock: Arc<dyn Clock>,
    ) -> EngineResult<(Self, Arc<EngineStore>)> {
        let store = Arc::new(EngineStore::in_memory_migrated()?);
        let orchestrator = Self::build(config, Collaborators::from_store(store.clone()), clock)?;
        Ok((orchestrator, store))
    }

    pub fn grading(&self) -> &Arc<GradingEngine> {
        &self.grading
    }

    pub fn bandit(&self) -> &Arc<BanditEngine> {
        &self.bandit
    }

    pub fn variance(&self) -> &Arc<VarianceController> {
        &self.variance
    }

    /// Rules dropped at load, each with the reason.
    pub fn rejected_rules(&self) -> &[EngineError] {
        &self.rejected_rules
    }

    pub fn cycle_names(&self) -> Vec<&'static str> {
        self.cycles.iter().map(|c| c.cycle.name()).collect()
    }

    /// Run every cycle whose interval has elapsed, in registration order.
    /// Cycles that have never run are due immediately.
    pub fn run_due(&mut self) -> Vec<CycleReport> {
        let now = self.clock.now();
        let mut reports = Vec::new();
        for scheduled in &mut self.cycles {
            if scheduled.next_due.is_some_and(|due| due > now) {
                continue;
            }
            let name = scheduled.cycle.name();
            let outcome = run_and_audit(
                scheduled.cycle.as_ref(),
                self.audit.as_ref(),
                now,
                &CancelToken::new(),
            );
            scheduled.next_due = Some(now + scheduled.interval);
            reports.push(match outcome {
                Ok(events) => CycleReport { cycle: name, events, error: None },
                Err(e) => {
                    log::error!("engine: cycle '{name}' failed: {e}");
                    CycleReport { cycle: name, events: 0, error: Some(e.to_string()) }
                }
            });
        }
        reports
    }

    /// Run one cycle immediately, regardless of schedule, and return its events.
    pub fn run_cycle(&self, name: &str, cancel: &CancelToken) -> EngineResult<Vec<EngineEvent>> {
        let scheduled = self
            .cycles
            .iter()
            .find(|c| c.cycle.name() == name)
            .ok_or_else(|| EngineError::InvalidConfig(format!("no cycle named '{name}'")))?;
        let now = self.clock.now();
        let events = scheduled.cycle.run(now, cancel)?;
        audit_events(self.audit.as_ref(), now, &events)?;
        Ok(events)
    }

    /// Apply an operator command and audit the resulting event.
    pub fn submit_command(&self, command: OperatorCommand) -> EngineResult<EngineEvent> {
        log::info!("engine: command {}", command.name());
        let event = match command {
            OperatorCommand::ApproveCorrection { event_id, note } => {
                let event = self.variance.resolve_approval(event_id, true, note)?;
                self.approvals.approval_resolved(event_id)?;
                EngineEvent::CorrectionResolved { event }
            }
            OperatorCommand::RejectCorrection { event_id, note } => {
                let event = self.variance.resolve_approval(event_id, false, note)?;
                self.approvals.approval_resolved(event_id)?;
                EngineEvent::CorrectionResolved { event }
            }
            OperatorCommand::RollbackCorrection { event_id, note } => {
                let event = self.variance.rollback(event_id, note)?;
                EngineEvent::CorrectionResolved { event }
            }
            OperatorCommand::SetExperimentStatus { experiment_id, status } => {
                let from = self.bandit.set_status(&experiment_id, status)?;
                EngineEvent::ExperimentStatusChanged { experiment_id, from, to: status }
            }
        };
        audit_events(self.audit.as_ref(), self.clock.now(), std::slice::from_ref(&event))?;
        Ok(event)
    }

    /// Start one worker thread per cycle. Each worker wakes every `poll`,
    /// runs its cycle when due and audits the result.
    pub fn spawn_workers(&self, poll: std::time::Duration) -> WorkerHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let cancel = CancelToken::new();
        let last_errors = Arc::new(Mutex::new(Vec::new()));

        let handles = self
            .cycles
            .iter()
            .map(|scheduled| {
                let cycle = scheduled.cycle.clone();
                let interval = scheduled.interval;
                let audit = self.audit.clone();
                let clock = self.clock.clone();
                let shutdown = shutdown.clone();
                let cancel = cancel.clone();
                let last_errors = last_errors.clone();

                std::thread::spawn(move || {
                    let mut next_due: Option<Timestamp> = None;
                    while !shutdown.load(Ordering::SeqCst) {
                        let now = clock.now();
                        if next_due.map_or(true, |due| due <= now) {
                            if let Err(e) = run_and_audit(cycle.as_ref(), audit.as_ref(), now, &cancel) {
                                log::error!("engine: worker '{}' failed: {e}", cycle.name());
                                last_errors
                                    .lock()
                                    .unwrap_or_else(|p| p.into_inner())
                                    .push(format!("{}: {e}", cycle.name()));
                            }
                            next_due = Some(now + interval);
                        }
                        std::thread::sleep(poll);
                    }
                    log::debug!("engine: worker '{}' stopped", cycle.name());
                })
            })
            .collect();

        WorkerHandle { shutdown, cancel, handles, last_errors }
    }
}

/// Running worker threads. Dropping the handle without `shutdown` leaves
/// the workers running until the process exits.
pub struct WorkerHandle {
    shutdown:    Arc<AtomicBool>,
    cancel:      CancelToken,
    handles:     Vec<JoinHandle<()>>,
    last_errors: Arc<Mutex<Vec<String>>>,
}

impl WorkerHandle {
    /// Signal every worker, cancel in-flight cycles and wait for the threads.
    /// Returns the errors the workers logged while running.
    pub fn shutdown(self) -> Vec<String> {
        self.shutdown.store(true, Ordering::SeqCst);
        self.cancel.cancel();
        for handle in self.handles {
            if handle.join().is_err() {
                log::error!("engine: worker thread panicked");
            }
        }
        let errors = self.last_errors.lock().unwrap_or_else(|p| p.into_inner());
        errors.clone()
    }
}

fn run_and_audit(
    cycle: &dyn EngineCycle,
    audit: &dyn AuditSink,
    now: Timestamp,
    cancel: &CancelToken,
) -> EngineResult<usize> {
    let events = cycle.run(now, cancel)?;
    audit_events(audit, now, &events)?;
    log::debug!("engine: cycle '{}' produced {} events", cycle.name(), events.len());
    Ok(events.len())
}

fn audit_events(audit: &dyn AuditSink, now: Timestamp, events: &[EngineEvent]) -> EngineResult<()> {
    for event in events {
        audit.append_audit(&event.to_audit(now))?;
    }
    Ok(())
}
