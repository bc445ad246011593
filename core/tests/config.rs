//! Shipped data/ configuration loads, validates and wires cleanly.

use campaign_engine_core::{
    clock::ManualClock,
    config::EngineConfig,
    engine::Orchestrator,
    grade::Grade,
};
use chrono::{TimeZone, Utc};
use std::sync::Arc;

const DATA_DIR: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/../data");

#[test]
fn shipped_config_loads() {
    let config = EngineConfig::load(DATA_DIR).expect("data/ config");
    assert_eq!(config.schedule.grading_interval_minutes, 24 * 60);
    assert_eq!(config.bandit.allocation_draws, 10_000);
    assert_eq!(config.grading.floor, Grade::D);
    assert_eq!(config.grading.grade_for(99.95), Grade::APlusPlus);
    assert_eq!(config.grading.grade_for(29.0), Grade::D);
    assert_eq!(config.variance.functions.len(), 3);
}

#[test]
fn shipped_rules_are_all_valid() {
    let config = EngineConfig::load(DATA_DIR).unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()));
    let (orchestrator, _store) = Orchestrator::build_in_memory(&config, clock).unwrap();
    assert!(orchestrator.rejected_rules().is_empty(), "{:?}", orchestrator.rejected_rules());
    assert_eq!(orchestrator.variance().function_codes().unwrap().len(), 3);
}

#[test]
fn missing_directory_is_an_error() {
    assert!(EngineConfig::load("/nonexistent/engine-data").is_err());
}

#[test]
fn zero_interval_is_rejected() {
    let mut config = EngineConfig::default_test();
    config.schedule.allocation_interval_minutes = 0;
    assert!(config.validate().is_err());
}
