//! Thompson-sampling bandit: convergence, allocation and arm bookkeeping.

use campaign_engine_core::{
    bandit_engine::{
        AllocationStrategy, BanditEngine, Experiment, ExperimentStatus, Variant,
    },
    collaborator::ArmStore,
    error::EngineError,
    rng::{EngineRng, RngBank},
    store::EngineStore,
};
use std::sync::Arc;
use std::thread;

fn experiment(id: &str, variants: &[&str], status: ExperimentStatus) -> Experiment {
    Experiment {
        experiment_id: id.into(),
        variants:      variants
            .iter()
            .map(|v| Variant { variant_id: v.to_string(), label: format!("variant {v}") })
            .collect(),
        status,
        strategy:      AllocationStrategy::ThompsonSampling,
    }
}

fn build(seed: u64, draws: u32) -> (BanditEngine, Arc<EngineStore>) {
    let store = Arc::new(EngineStore::in_memory_migrated().expect("store"));
    let engine = BanditEngine::new(store.clone(), RngBank::new(seed), draws);
    (engine, store)
}

#[test]
fn converges_on_the_better_arm() {
    let (engine, _store) = build(11, 2_000);
    engine
        .register_experiment(experiment("subject", &["A", "B"], ExperimentStatus::Active))
        .unwrap();

    let mut world = EngineRng::new(99, 0);
    let mut late_a = 0;
    for i in 0..5_000 {
        let variant = engine.select_variant("subject").unwrap();
        let rate = if variant == "A" { 0.50 } else { 0.05 };
        let converted = world.chance(rate);
        engine
            .record_outcome("subject", &variant, converted, if converted { 20.0 } else { 0.0 })
            .unwrap();
        if i >= 4_500 && variant == "A" {
            late_a += 1;
        }
    }
    assert!(late_a >= 450, "only {late_a} of the last 500 selections went to A");

    let report = engine.recompute_allocation("subject").unwrap();
    let a = report.arms.iter().find(|arm| arm.variant_id == "A").unwrap();
    assert!(a.traffic_allocation_pct > 95.0, "A holds {}%", a.traffic_allocation_pct);
}

#[test]
fn allocation_always_sums_to_hundred() {
    let (engine, _store) = build(3, 10_000);
    engine
        .register_experiment(experiment("ask", &["x", "y", "z"], ExperimentStatus::Active))
        .unwrap();

    let initial: f64 = engine
        .arm_states("ask")
        .unwrap()
        .iter()
        .map(|a| a.traffic_allocation_pct)
        .sum();
    assert!((initial - 100.0).abs() < 1e-9, "initial total {initial}");

    let mut world = EngineRng::new(5, 1);
    for round in 0..10 {
        for _ in 0..50 {
            let v = engine.select_variant("ask").unwrap();
            engine.record_outcome("ask", &v, world.chance(0.1), 0.0).unwrap();
        }
        let report = engine.recompute_allocation("ask").unwrap();
        assert_eq!(report.draws, 10_000);
        assert!(
            (report.total_pct() - 100.0).abs() < 1e-9,
            "round {round}: total {}",
            report.total_pct()
        );
        for arm in &report.arms {
            assert!((0.0..=100.0).contains(&arm.traffic_allocation_pct));
        }
    }
}

#[test]
fn single_variant_takes_all_traffic() {
    let (engine, _store) = build(1, 10_000);
    engine
        .register_experiment(experiment("solo", &["only"], ExperimentStatus::Active))
        .unwrap();
    assert_eq!(engine.select_variant("solo").unwrap(), "only");

    let report = engine.recompute_allocation("solo").unwrap();
    assert_eq!(report.arms.len(), 1);
    assert_eq!(report.arms[0].traffic_allocation_pct, 100.0);
    assert_eq!(report.draws, 0);
}

#[test]
fn unknown_variant_leaves_state_untouched() {
    let (engine, store) = build(1, 100);
    engine
        .register_experiment(experiment("exp", &["A", "B"], ExperimentStatus::Active))
        .unwrap();
    engine.record_outcome("exp", "A", true, 10.0).unwrap();
    let before = engine.arm_states("exp").unwrap();

    let err = engine.record_outcome("exp", "C", true, 10.0).unwrap_err();
    assert!(matches!(err, EngineError::UnknownVariant { .. }), "{err:?}");
    assert_eq!(engine.arm_states("exp").unwrap(), before);
    assert_eq!(store.load_arm_state("exp").unwrap(), before);
}

#[test]
fn negative_revenue_is_rejected() {
    let (engine, _store) = build(1, 100);
    engine
        .register_experiment(experiment("exp", &["A", "B"], ExperimentStatus::Active))
        .unwrap();
    let err = engine.record_outcome("exp", "A", true, -5.0).unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput { .. }));
    assert_eq!(engine.arm_states("exp").unwrap()[0].impressions, 0);
}

#[test]
fn selection_requires_an_active_experiment() {
    let (engine, _store) = build(1, 100);
    let err = engine.select_variant("missing").unwrap_err();
    assert!(matches!(err, EngineError::InvalidExperimentState { .. }));

    engine
        .register_experiment(experiment("held", &["A", "B"], ExperimentStatus::Paused))
        .unwrap();
    let err = engine.select_variant("held").unwrap_err();
    assert!(
        matches!(&err, EngineError::InvalidExperimentState { state, .. } if state == "paused"),
        "{err:?}"
    );

    // Late outcomes for a paused experiment still count.
    engine.record_outcome("held", "B", true, 1.0).unwrap();
    assert_eq!(engine.arm_states("held").unwrap()[1].conversions, 1);

    engine.set_status("held", ExperimentStatus::Active).unwrap();
    assert!(engine.select_variant("held").is_ok());
}

#[test]
fn archived_experiments_reject_everything() {
    let (engine, _store) = build(1, 100);
    engine
        .register_experiment(experiment("old", &["A", "B"], ExperimentStatus::Active))
        .unwrap();
    engine.set_status("old", ExperimentStatus::Archived).unwrap();

    assert!(engine.select_variant("old").is_err());
    assert!(engine.record_outcome("old", "A", false, 0.0).is_err());
    assert!(engine.recompute_allocation("old").is_err());
    let err = engine.set_status("old", ExperimentStatus::Active).unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    assert!(engine.reportable_experiment_ids().unwrap().is_empty());
}

#[test]
fn duplicate_registration_is_rejected() {
    let (engine, _store) = build(1, 100);
    let exp = experiment("dup", &["A", "B"], ExperimentStatus::Active);
    engine.register_experiment(exp.clone()).unwrap();
    assert!(engine.register_experiment(exp).is_err());

    let err = BanditEngine::new(Arc::new(EngineStore::in_memory_migrated().unwrap()), RngBank::new(1), 10)
        .register_experiment(experiment("twins", &["A", "A"], ExperimentStatus::Active))
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput { .. }));
}

#[test]
fn concurrent_outcomes_are_never_lost() {
    let (engine, store) = build(1, 100);
    engine
        .register_experiment(experiment("busy", &["A", "B"], ExperimentStatus::Active))
        .unwrap();
    let engine = Arc::new(engine);

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for i in 0..250 {
                    let converted = (i + t) % 4 == 0;
                    engine.record_outcome("busy", "A", converted, 1.0).unwrap();
                    engine.record_outcome("busy", "B", false, 0.0).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let arms = engine.arm_states("busy").unwrap();
    assert_eq!(arms[0].impressions, 2_000);
    assert_eq!(arms[0].conversions, 500);
    assert_eq!(arms[0].alpha, 501);
    assert_eq!(arms[0].beta, 1_501);
    assert_eq!(arms[0].cumulative_revenue, 500.0);
    assert_eq!(arms[1].impressions, 2_000);
    assert_eq!(store.load_arm_state("busy").unwrap(), arms);
}

#[test]
fn arm_state_survives_a_restart() {
    let store = Arc::new(EngineStore::in_memory_migrated().unwrap());
    let first = BanditEngine::new(store.clone(), RngBank::new(8), 100);
    first
        .register_experiment(experiment("durable", &["A", "B"], ExperimentStatus::Active))
        .unwrap();
    for _ in 0..30 {
        first.record_outcome("durable", "A", true, 2.5).unwrap();
    }
    let saved = first.arm_states("durable").unwrap();

    let second = BanditEngine::new(store, RngBank::new(8), 100);
    second
        .register_experiment(experiment("durable", &["A", "B"], ExperimentStatus::Active))
        .unwrap();
    assert_eq!(second.arm_states("durable").unwrap(), saved);
    assert_eq!(saved[0].alpha, 31);
}

#[test]
fn same_seed_same_selections() {
    let run = || {
        let (engine, _store) = build(2024, 100);
        engine
            .register_experiment(experiment("det", &["A", "B", "C"], ExperimentStatus::Active))
            .unwrap();
        (0..200)
            .map(|_| engine.select_variant("det").unwrap())
            .collect::<Vec<_>>()
    };
    assert_eq!(run(), run());
}
