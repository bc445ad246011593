//! Grading engine: percentile ladder, dual scopes and publication.

use campaign_engine_core::{
    collaborator::GradeSink,
    error::{EngineError, EngineResult},
    grade::{Grade, GradeThresholds},
    grading_engine::{
        percentile_for, DonorSnapshot, GradeScope, GradingEngine, ScopeEntry, ScopeRanking,
    },
    store::EngineStore,
    subsystem::CancelToken,
};
use chrono::{TimeZone, Utc};
use std::{sync::Arc, thread};

fn now() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 2, 0, 0).unwrap()
}

fn engine() -> GradingEngine {
    GradingEngine::new(GradeThresholds::default()).expect("default thresholds are valid")
}

/// donor-001 gives the most, donor-100 the least.
fn ladder(n: usize) -> Vec<DonorSnapshot> {
    (1..=n)
        .map(|i| DonorSnapshot::new(format!("donor-{i:03}"), (n - i + 1) as f64 * 10.0, Some("Travis")))
        .collect()
}

#[test]
fn hundred_donor_ladder_matches_threshold_table() {
    let result = engine()
        .compute(&ladder(100), now(), &CancelToken::new())
        .expect("compute");

    let top = result.donor("donor-001").unwrap();
    assert_eq!(top.rank_state, Some(1));
    assert_eq!(top.percentile_state, Some(100.0));
    assert_eq!(top.grade_state, Grade::APlusPlus);

    let middle = result.donor("donor-050").unwrap();
    assert_eq!(middle.rank_state, Some(50));
    assert_eq!(middle.percentile_state, Some(51.0));
    assert_eq!(middle.grade_state, Grade::CPlus);

    let bottom = result.donor("donor-100").unwrap();
    assert_eq!(bottom.rank_state, Some(100));
    assert_eq!(bottom.percentile_state, Some(1.0));
    assert_eq!(bottom.grade_state, Grade::D);
}

#[test]
fn grades_never_increase_as_rank_worsens() {
    let result = engine()
        .compute(&ladder(250), now(), &CancelToken::new())
        .expect("compute");
    let state = &result.scopes[0];
    assert_eq!(state.scope, GradeScope::State);
    for pair in state.entries.windows(2) {
        assert!(pair[0].rank < pair[1].rank);
        assert!(pair[0].grade >= pair[1].grade, "{:?} then {:?}", pair[0], pair[1]);
    }
}

#[test]
fn percentile_bounds() {
    assert_eq!(percentile_for(1, 1), 100.0);
    assert_eq!(percentile_for(1, 7), 100.0);
    assert_eq!(percentile_for(7, 7), 14.286);
}

#[test]
fn state_and_county_scopes_are_independent() {
    let mut donors: Vec<DonorSnapshot> = (0..10_000)
        .map(|i| DonorSnapshot::new(format!("s-{i:05}"), 1_000_000.0 - i as f64, Some("Harris")))
        .collect();
    // Third largest statewide once inserted, and the only big giver in Loving.
    donors.push(DonorSnapshot::new("target", 999_998.5, Some("Loving")));
    for i in 0..4 {
        donors.push(DonorSnapshot::new(format!("loving-{i}"), 10.0 + i as f64, Some("Loving")));
    }

    let result = engine()
        .compute(&donors, now(), &CancelToken::new())
        .expect("compute");
    let target = result.donor("target").unwrap();
    assert_eq!(target.rank_state, Some(3));
    assert_eq!(target.grade_state, Grade::APlusPlus);
    assert_eq!(target.rank_county, Some(1));
    assert_eq!(target.percentile_county, Some(100.0));
    assert_eq!(target.grade_county, Grade::APlusPlus);

    let loving = result
        .scopes
        .iter()
        .find(|s| s.scope == GradeScope::County("Loving".into()))
        .unwrap();
    assert_eq!(loving.entries.len(), 5);
}

#[test]
fn single_donor_county_earns_top_grade() {
    let donors = vec![
        DonorSnapshot::new("a", 50.0, Some("Big")),
        DonorSnapshot::new("b", 500.0, Some("Big")),
        DonorSnapshot::new("solo", 1.0, Some("Tiny")),
    ];
    let result = engine().compute(&donors, now(), &CancelToken::new()).unwrap();
    let solo = result.donor("solo").unwrap();
    assert_eq!(solo.rank_county, Some(1));
    assert_eq!(solo.grade_county, Grade::APlusPlus);
    assert_eq!(solo.rank_state, Some(3));
}

#[test]
fn missing_county_and_non_qualifying_totals_grade_u() {
    let donors = vec![
        DonorSnapshot::new("no-county", 100.0, None),
        DonorSnapshot::new("blank-county", 90.0, Some("   ")),
        DonorSnapshot::new("zero", 0.0, Some("Travis")),
        DonorSnapshot::new("negative", -25.0, Some("Travis")),
        DonorSnapshot::new("giver", 10.0, Some("Travis")),
    ];
    let result = engine().compute(&donors, now(), &CancelToken::new()).unwrap();

    let no_county = result.donor("no-county").unwrap();
    assert_eq!(no_county.grade_state, Grade::APlusPlus);
    assert_eq!(no_county.grade_county, Grade::U);
    assert_eq!(no_county.rank_county, None);
    assert_eq!(result.donor("blank-county").unwrap().county, None);

    for id in ["zero", "negative"] {
        let record = result.donor(id).unwrap();
        assert_eq!(record.grade_state, Grade::U, "{id}");
        assert_eq!(record.grade_county, Grade::U, "{id}");
        assert_eq!(record.rank_state, None, "{id}");
    }
    assert_eq!(result.qualifying_count(), 3);
    assert!(result.skipped.is_empty());
}

#[test]
fn malformed_rows_are_skipped_not_fatal() {
    let mut nan = DonorSnapshot::new("nan", 0.0, None);
    nan.contribution_total = Some(f64::NAN);
    let donors = vec![
        nan,
        DonorSnapshot::new("dup", 10.0, None),
        DonorSnapshot::new("dup", 20.0, None),
        DonorSnapshot::new("ok", 5.0, None),
    ];
    let result = engine().compute(&donors, now(), &CancelToken::new()).unwrap();
    assert_eq!(result.skipped.len(), 2);
    assert!(result.donor("nan").is_none());
    assert_eq!(result.donor("dup").unwrap().contribution_total, Some(10.0));
    assert_eq!(result.qualifying_count(), 2);
}

#[test]
fn ties_break_by_donor_id() {
    let donors = vec![
        DonorSnapshot::new("zeta", 100.0, None),
        DonorSnapshot::new("alpha", 100.0, None),
        DonorSnapshot::new("mid", 100.0, None),
    ];
    let result = engine().compute(&donors, now(), &CancelToken::new()).unwrap();
    assert_eq!(result.donor("alpha").unwrap().rank_state, Some(1));
    assert_eq!(result.donor("mid").unwrap().rank_state, Some(2));
    assert_eq!(result.donor("zeta").unwrap().rank_state, Some(3));
}

#[test]
fn rerunning_unchanged_data_is_idempotent() {
    let store = EngineStore::in_memory_migrated().expect("store");
    store.upsert_donors(&ladder(40)).unwrap();
    let engine = engine();

    let first = engine
        .run_cycle(&store, &store, now(), &CancelToken::new())
        .expect("first cycle");
    let published_first = store.scope_grades(&GradeScope::State).unwrap();
    let second = engine
        .run_cycle(&store, &store, now(), &CancelToken::new())
        .expect("second cycle");
    let published_second = store.scope_grades(&GradeScope::State).unwrap();

    assert_eq!(first.cycle, 1);
    assert_eq!(second.cycle, 2);
    assert_eq!(first.donors, second.donors);
    assert_eq!(first.scopes, second.scopes);
    assert_eq!(published_first, published_second);
    assert_eq!(published_first.len(), 40);
}

#[test]
fn published_grades_replace_previous_cycle() {
    let store = EngineStore::in_memory_migrated().unwrap();
    store.upsert_donors(&ladder(10)).unwrap();
    let engine = engine();
    engine.run_cycle(&store, &store, now(), &CancelToken::new()).unwrap();
    assert_eq!(
        store.published_grade(&GradeScope::State, "donor-010").unwrap(),
        Grade::D
    );

    store
        .upsert_donor(&DonorSnapshot::new("donor-010", 1_000_000.0, Some("Travis")))
        .unwrap();
    engine.run_cycle(&store, &store, now(), &CancelToken::new()).unwrap();
    assert_eq!(
        store.published_grade(&GradeScope::State, "donor-010").unwrap(),
        Grade::APlusPlus
    );
    assert_eq!(
        store.published_grade(&GradeScope::County("Travis".into()), "donor-010").unwrap(),
        Grade::APlusPlus
    );
    assert_eq!(store.published_grade(&GradeScope::State, "nobody").unwrap(), Grade::U);
    assert_eq!(engine.book().lookup("donor-010").unwrap().rank_state, Some(1));
}

#[test]
fn cancelled_cycle_publishes_nothing() {
    let store = EngineStore::in_memory_migrated().unwrap();
    store.upsert_donors(&ladder(25)).unwrap();
    let engine = engine();

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = engine.run_cycle(&store, &store, now(), &cancel).unwrap_err();
    assert!(matches!(err, EngineError::CycleCancelled("grading")));
    assert!(store.scope_grades(&GradeScope::State).unwrap().is_empty());
    assert!(engine.book().current().is_none());
}

#[test]
fn empty_population_publishes_no_scopes() {
    let store = EngineStore::in_memory_migrated().unwrap();
    let result = engine()
        .run_cycle(&store, &store, now(), &CancelToken::new())
        .unwrap();
    assert!(result.donors.is_empty());
    assert!(result.scopes.is_empty());
}

struct UnavailableSink;

impl GradeSink for UnavailableSink {
    fn publish_cycle(&self, _: &[ScopeRanking], _: &[GradeScope]) -> EngineResult<()> {
        Err(EngineError::invalid_input("grade sink", "unavailable"))
    }
}

fn entry(donor_id: &str, rank: u32) -> ScopeEntry {
    ScopeEntry { donor_id: donor_id.into(), rank, percentile: 100.0, grade: Grade::APlusPlus }
}

#[test]
fn failed_publication_keeps_previous_cycle() {
    let store = EngineStore::in_memory_migrated().unwrap();
    store.upsert_donors(&ladder(10)).unwrap();
    let engine = engine();
    engine.run_cycle(&store, &store, now(), &CancelToken::new()).unwrap();
    let before = store.scope_grades(&GradeScope::State).unwrap();

    store
        .upsert_donor(&DonorSnapshot::new("donor-010", 1_000_000.0, Some("Travis")))
        .unwrap();
    let err = engine
        .run_cycle(&store, &UnavailableSink, now(), &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidInput { .. }));
    assert_eq!(engine.book().current().unwrap().cycle, 1);
    assert_eq!(engine.book().lookup("donor-010").unwrap().grade_state, Grade::D);
    assert_eq!(store.scope_grades(&GradeScope::State).unwrap(), before);

    let next = engine.run_cycle(&store, &store, now(), &CancelToken::new()).unwrap();
    assert_eq!(next.cycle, 2);
}

#[test]
fn store_publication_is_all_or_nothing() {
    let store = EngineStore::in_memory_migrated().unwrap();
    let travis = GradeScope::County("Travis".into());
    store
        .publish_cycle(
            &[ScopeRanking { scope: GradeScope::State, entries: vec![entry("a", 1)] }],
            &[],
        )
        .unwrap();

    // The second scope repeats a donor and violates the primary key.
    let err = store.publish_cycle(
        &[
            ScopeRanking { scope: GradeScope::State, entries: vec![entry("b", 1)] },
            ScopeRanking { scope: travis.clone(), entries: vec![entry("c", 1), entry("c", 2)] },
        ],
        &[],
    );
    assert!(err.is_err());
    let state = store.scope_grades(&GradeScope::State).unwrap();
    assert_eq!(state.len(), 1);
    assert_eq!(state[0].donor_id, "a");
    assert!(store.scope_grades(&travis).unwrap().is_empty());
}

#[test]
fn county_emptied_between_cycles_is_cleared() {
    let store = EngineStore::in_memory_migrated().unwrap();
    let loving = GradeScope::County("Loving".into());
    store.upsert_donors(&ladder(5)).unwrap();
    store.upsert_donor(&DonorSnapshot::new("solo", 50.0, Some("Loving"))).unwrap();
    let engine = engine();

    engine.run_cycle(&store, &store, now(), &CancelToken::new()).unwrap();
    assert_eq!(store.published_grade(&loving, "solo").unwrap(), Grade::APlusPlus);

    store.upsert_donor(&DonorSnapshot::new("solo", 0.0, Some("Loving"))).unwrap();
    let second = engine.run_cycle(&store, &store, now(), &CancelToken::new()).unwrap();
    assert!(second.scopes.iter().all(|s| s.scope != loving));
    assert_eq!(store.published_grade(&loving, "solo").unwrap(), Grade::U);
    assert!(store.scope_grades(&loving).unwrap().is_empty());
    assert_eq!(store.scope_grades(&GradeScope::County("Travis".into())).unwrap().len(), 5);
}

#[test]
fn concurrent_cycles_are_serialized() {
    let store = Arc::new(EngineStore::in_memory_migrated().unwrap());
    store.upsert_donors(&ladder(60)).unwrap();
    let engine = Arc::new(engine());

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let engine = Arc::clone(&engine);
            let store = Arc::clone(&store);
            thread::spawn(move || {
                engine
                    .run_cycle(store.as_ref(), store.as_ref(), now(), &CancelToken::new())
                    .unwrap()
                    .cycle
            })
        })
        .collect();
    let mut cycles: Vec<u64> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    cycles.sort_unstable();
    assert_eq!(cycles, vec![1, 2, 3, 4]);

    let latest = engine.book().current().unwrap();
    assert_eq!(latest.cycle, 4);
    let state = latest.scopes.iter().find(|s| s.scope == GradeScope::State).unwrap();
    assert_eq!(store.scope_grades(&GradeScope::State).unwrap(), state.entries);
}
