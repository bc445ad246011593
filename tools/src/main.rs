//! engine-runner: headless runner for the campaign decisioning engine.
//!
//! Usage:
//!   engine-runner --seed 7 --rounds 48 --demo-donors 5000 --db run.db
//!   engine-runner --data-dir ./data --ipc-mode

use anyhow::Result;
use campaign_engine_core::{
    bandit_engine::{AllocationStrategy, Experiment, ExperimentStatus, Variant},
    clock::{Clock, ManualClock},
    command::OperatorCommand,
    config::EngineConfig,
    engine::{Collaborators, Orchestrator},
    grade::Grade,
    grading_engine::{DonorSnapshot, GradeScope},
    rng::{EngineRng, EngineSlot, RngBank},
    store::EngineStore,
    variance_controller::FunctionMetricWindow,
};
use chrono::{Duration, TimeZone, Utc};
use std::collections::BTreeMap;
use std::env;
use std::io::{self, BufRead, Write};
use std::path::Path;
use std::sync::Arc;

const DEMO_EXPERIMENT: &str = "spring_appeal_subject_line";
const ROUND_MINUTES: i64 = 60;
const IMPRESSIONS_PER_ROUND: u32 = 250;
const COUNTIES: [&str; 8] = [
    "Adams", "Bexar", "Cook", "Dallas", "Fulton", "King", "Maricopa", "Travis",
];

#[derive(serde::Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum IpcCommand {
    State,
    RunDue,
    Advance { minutes: i64 },
    Command { command: OperatorCommand },
    Quit,
}

fn main() -> Result<()> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let rounds = parse_arg(&args, "--rounds", 24u64);
    let demo_donors = parse_arg(&args, "--demo-donors", 2_000usize);
    let ipc_mode = args.iter().any(|a| a == "--ipc-mode");
    let db = string_arg(&args, "--db").unwrap_or(":memory:");
    let data_dir = string_arg(&args, "--data-dir").unwrap_or("./data");

    let mut config = if Path::new(data_dir).is_dir() {
        EngineConfig::load(data_dir)?
    } else {
        log::warn!("runner: {data_dir} not found, using built-in configuration");
        EngineConfig::default_test()
    };
    if let Some(seed) = string_arg(&args, "--seed") {
        config.schedule.master_seed = seed.parse()?;
    }
    let seed = config.schedule.master_seed;

    if !ipc_mode {
        println!("Campaign decisioning engine: engine-runner");
        println!("  seed:         {seed}");
        println!("  rounds:       {rounds}");
        println!("  demo donors:  {demo_donors}");
        println!("  db:           {db}");
        println!("  data_dir:     {data_dir}");
        println!();
    }

    let store = Arc::new(if db == ":memory:" {
        EngineStore::in_memory()?
    } else {
        EngineStore::open(db)?
    });
    store.migrate()?;

    let start = Utc
        .with_ymd_and_hms(2026, 1, 5, 6, 0, 0)
        .single()
        .ok_or_else(|| anyhow::anyhow!("invalid start time"))?;
    let clock = Arc::new(ManualClock::new(start));
    let mut orchestrator =
        Orchestrator::build(&config, Collaborators::from_store(store.clone()), clock.clone())?;
    for rejected in orchestrator.rejected_rules() {
        log::warn!("runner: rule disabled: {rejected}");
    }

    let bank = RngBank::new(seed);
    let mut demo_rng = bank.for_slot(EngineSlot::DemoData);
    seed_donors(&store, &mut demo_rng, demo_donors)?;
    orchestrator.bandit().register_experiment(demo_experiment())?;

    if ipc_mode {
        return run_ipc_loop(&mut orchestrator, &clock);
    }

    let true_rates = [("subject_a", 0.035), ("subject_b", 0.050), ("subject_c", 0.080)];
    for round in 0..rounds {
        let round_start = clock.now();
        seed_metric_windows(&store, &config, &mut demo_rng, round_start, round)?;
        simulate_traffic(&orchestrator, &mut demo_rng, &true_rates)?;

        clock.advance_minutes(ROUND_MINUTES);
        for report in orchestrator.run_due() {
            if let Some(error) = &report.error {
                println!("  round {round:>3}: {} failed: {error}", report.cycle);
            }
        }
    }

    // Approve the oldest pending correction so the approval path shows up
    // in the audit trail.
    if let Some(event_id) = store.pending_approval_ids()?.first().copied() {
        orchestrator.submit_command(OperatorCommand::ApproveCorrection {
            event_id,
            note: Some("approved by engine-runner".into()),
        })?;
    }

    print_summary(&orchestrator, &store)?;
    Ok(())
}

fn demo_experiment() -> Experiment {
    let variant = |id: &str, label: &str| Variant { variant_id: id.into(), label: label.into() };
    Experiment {
        experiment_id: DEMO_EXPERIMENT.into(),
        variants:      vec![
            variant("subject_a", "Your neighbors are counting on you"),
            variant("subject_b", "Matching gift ends Friday"),
            variant("subject_c", "A personal note from the candidate"),
        ],
        status:        ExperimentStatus::Active,
        strategy:      AllocationStrategy::ThompsonSampling,
    }
}

/// Heavy-tailed contribution totals spread over a handful of counties.
fn seed_donors(store: &EngineStore, rng: &mut EngineRng, count: usize) -> Result<()> {
    let donors: Vec<DonorSnapshot> = (0..count)
        .map(|i| {
            let total = (rng.pareto(25.0, 1.16) * 100.0).round() / 100.0;
            let county = if rng.chance(0.02) {
                None
            } else {
                Some(COUNTIES[rng.next_u64_below(COUNTIES.len() as u64) as usize])
            };
            DonorSnapshot::new(format!("donor-{i:06}"), total, county)
        })
        .collect();
    store.upsert_donors(&donors)?;
    log::info!("runner: seeded {} donors", donors.len());
    Ok(())
}

/// One hourly metric window per function. Spend drifts around forecast,
/// with an occasional runaway hour.
fn seed_metric_windows(
    store: &EngineStore,
    config: &EngineConfig,
    rng: &mut EngineRng,
    round_start: chrono::DateTime<Utc>,
    round: u64,
) -> Result<()> {
    for function in &config.variance.functions {
        let forecast_cost = 100.0;
        let spike = if rng.chance(0.15) { 0.4 + rng.next_f64() } else { 0.0 };
        let drift = rng.standard_normal() * 0.1;
        let actual_cost = (forecast_cost * (1.0 + drift + spike)).max(0.0);
        store.insert_metric_window(&FunctionMetricWindow {
            function_code: function.function_code.clone(),
            period_start: round_start,
            period_end: round_start + Duration::minutes(ROUND_MINUTES),
            forecast_cost,
            actual_cost,
            quality_score: Some((0.75 + rng.standard_normal() * 0.1).clamp(0.0, 1.0)),
            effectiveness_score: None,
        })?;
    }
    log::debug!("runner: metric windows written for round {round}");
    Ok(())
}

fn simulate_traffic(
    orchestrator: &Orchestrator,
    rng: &mut EngineRng,
    true_rates: &[(&str, f64)],
) -> Result<()> {
    let bandit = orchestrator.bandit();
    for _ in 0..IMPRESSIONS_PER_ROUND {
        let variant_id = bandit.select_variant(DEMO_EXPERIMENT)?;
        let rate = true_rates
            .iter()
            .find(|(id, _)| *id == variant_id)
            .map_or(0.0, |(_, rate)| *rate);
        let converted = rng.chance(rate);
        let revenue = if converted { (rng.pareto(10.0, 1.5) * 100.0).round() / 100.0 } else { 0.0 };
        bandit.record_outcome(DEMO_EXPERIMENT, &variant_id, converted, revenue)?;
    }
    Ok(())
}

fn run_ipc_loop(orchestrator: &mut Orchestrator, clock: &ManualClock) -> Result<()> {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut handle = stdin.lock();
    let mut buffer = String::new();

    loop {
        buffer.clear();
        if handle.read_line(&mut buffer)? == 0 {
            break; // EOF
        }

        let cmd: IpcCommand = match serde_json::from_str(&buffer) {
            Ok(c) => c,
            Err(e) => {
                writeln!(stdout, "{}", serde_json::json!({ "error": e.to_string() }))?;
                stdout.flush()?;
                continue;
            }
        };

        let response = match cmd {
            IpcCommand::Quit => break,
            IpcCommand::State => state_json(orchestrator)?,
            IpcCommand::RunDue => {
                let reports: Vec<_> = orchestrator
                    .run_due()
                    .into_iter()
                    .map(|r| serde_json::json!({ "cycle": r.cycle, "events": r.events, "error": r.error }))
                    .collect();
                serde_json::json!({ "reports": reports })
            }
            IpcCommand::Advance { minutes } => {
                serde_json::json!({ "now": clock.advance_minutes(minutes) })
            }
            IpcCommand::Command { command } => match orchestrator.submit_command(command) {
                Ok(event) => serde_json::json!({ "event": event }),
                Err(e) => serde_json::json!({ "error": e.to_string() }),
            },
        };
        writeln!(stdout, "{response}")?;
        stdout.flush()?;
    }
    Ok(())
}

fn state_json(orchestrator: &Orchestrator) -> Result<serde_json::Value> {
    let grading = orchestrator.grading().book().current().map(|result| {
        serde_json::json!({
            "cycle": result.cycle,
            "computed_at": result.computed_at,
            "donors": result.donors.len(),
            "qualifying": result.qualifying_count(),
        })
    });
    let mut experiments = serde_json::Map::new();
    for experiment_id in orchestrator.bandit().reportable_experiment_ids()? {
        let arms = orchestrator.bandit().arm_states(&experiment_id)?;
        experiments.insert(experiment_id, serde_json::to_value(arms)?);
    }
    let mut functions = serde_json::Map::new();
    for code in orchestrator.variance().function_codes()? {
        let parameters = orchestrator.variance().parameters(&code)?;
        functions.insert(code, serde_json::to_value(parameters)?);
    }
    Ok(serde_json::json!({
        "grading": grading,
        "experiments": experiments,
        "functions": functions,
    }))
}

fn print_summary(orchestrator: &Orchestrator, store: &EngineStore) -> Result<()> {
    println!("=== Summary ===");

    if let Some(result) = orchestrator.grading().book().current() {
        let mut distribution: BTreeMap<Grade, usize> = BTreeMap::new();
        for donor in &result.donors {
            *distribution.entry(donor.grade_state).or_default() += 1;
        }
        println!(
            "  grading cycle {}: {} donors, {} qualifying, {} skipped",
            result.cycle,
            result.donors.len(),
            result.qualifying_count(),
            result.skipped.len()
        );
        for (grade, count) in distribution.iter().rev() {
            println!("    {:<4} {count:>7}", grade.as_str());
        }
        println!(
            "  published state grades:  {}",
            store.scope_grades(&GradeScope::State)?.len()
        );
    }

    let bandit = orchestrator.bandit();
    println!("  experiment {DEMO_EXPERIMENT}:");
    for arm in bandit.arm_states(DEMO_EXPERIMENT)? {
        println!(
            "    {:<10} impressions {:>6}  conversions {:>5}  mean {:.4}  traffic {:>6.2}%  revenue {:>10.2}",
            arm.variant_id,
            arm.impressions,
            arm.conversions,
            arm.posterior_mean(),
            arm.traffic_allocation_pct,
            arm.cumulative_revenue
        );
    }

    let variance = orchestrator.variance();
    for code in variance.function_codes()? {
        let parameters = variance.parameters(&code)?;
        let history = variance.history(&code)?;
        println!(
            "  function {code}: tier {:?}, batch {}, rate limit {:?}, paused {}, {} corrections",
            parameters.model_tier,
            parameters.batch_size,
            parameters.rate_limit_per_minute,
            parameters.paused,
            history.len()
        );
    }

    println!(
        "  audit: {} grading, {} bandit, {} variance entries ({} suppressed)",
        store.audit_records("grading")?.len(),
        store.audit_records("bandit")?.len(),
        store.audit_records("variance")?.len(),
        store.audit_count("variance", "correction_suppressed")?
    );
    println!("  pending approvals: {}", store.pending_approval_ids()?.len());
    Ok(())
}

fn string_arg<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.windows(2).find(|w| w[0] == flag).map(|w| w[1].as_str())
}

fn parse_arg<T: std::str::FromStr>(args: &[String], flag: &str, default: T) -> T {
    string_arg(args, flag)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
