//! Geotrack simulator CLI
//!
//! Runs the fault-injection scenarios against the dashboard core.

use anyhow::{bail, Context};
use clap::Parser;
use geotrack_core::TrackerConfig;
use geotrack_sim::scenarios::ScenarioId;
use geotrack_sim::{ScenarioResult, ScenarioRunner};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Geotrack deterministic simulation CLI
#[derive(Parser, Debug)]
#[command(name = "geotrack-sim")]
#[command(about = "Run deterministic sync scenarios for the tracking dashboard", long_about = None)]
struct Args {
    /// Master seed for determinism (0 = random from time)
    #[arg(short, long, default_value = "42")]
    seed: u64,

    /// Objects seeded into the simulated backend
    #[arg(short, long, default_value = "3")]
    objects: usize,

    /// Scenario to run (reconnect_storm, geofence_breach, stale_refresh,
    /// notification_flood, simulation_cancel, malformed_payloads, all)
    #[arg(short = 'S', long, default_value = "all")]
    scenario: String,

    /// Number of consecutive seeds to test (for CI mode)
    #[arg(long, default_value = "1")]
    seeds: usize,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// JSON output for CI parsing
    #[arg(long)]
    json: bool,

    /// Export per-pump frames of a single scenario to a JSON file
    #[arg(long)]
    export: Option<String>,

    /// Tracker configuration (JSON); missing fields keep their defaults
    #[arg(short, long)]
    config: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // RUST_LOG wins over --verbose
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting tracing subscriber")?;

    if !args.json {
        info!("Geotrack Simulator v{}", env!("CARGO_PKG_VERSION"));
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
    }

    let scenarios: Vec<ScenarioId> = if args.scenario == "all" {
        ScenarioId::all()
    } else {
        let scenario = args
            .scenario
            .parse()
            .map_err(|e: String| anyhow::anyhow!("{e}"))?;
        vec![scenario]
    };

    let tracker = match &args.config {
        Some(path) => {
            let tracker = TrackerConfig::from_file(path)
                .with_context(|| format!("loading tracker config from {path}"))?;
            info!("Loaded tracker config from {}", path);
            tracker
        }
        None => TrackerConfig::default(),
    };

    let base_seed = if args.seed == 0 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .context("system clock before epoch")?
            .as_nanos() as u64
    } else {
        args.seed
    };

    if let Some(export_path) = &args.export {
        if scenarios.len() > 1 {
            bail!("--export only supports a single scenario, not 'all'");
        }
        let scenario = scenarios[0];
        info!("Running with export to: {}", export_path);

        let result = ScenarioRunner::new(base_seed)
            .with_objects(args.objects)
            .with_tracker(tracker)
            .with_export(true)
            .run(scenario);
        if let Some(export) = &result.export {
            export
                .write_to_file(export_path)
                .with_context(|| format!("writing export to {export_path}"))?;
            info!("Exported {} frames to {}", export.frames.len(), export_path);
        }

        report(&result);
        if !result.passed {
            std::process::exit(1);
        }
        return Ok(());
    }

    let mut all_results: Vec<ScenarioResult> = Vec::new();
    for seed_offset in 0..args.seeds {
        let seed = base_seed.wrapping_add(seed_offset as u64);
        let runner = ScenarioRunner::new(seed)
            .with_objects(args.objects)
            .with_tracker(tracker.clone());

        for scenario in &scenarios {
            let result = runner.run(*scenario);
            if !args.json {
                report(&result);
            }
            all_results.push(result);
        }
    }

    let total = all_results.len();
    let failed_count = all_results.iter().filter(|r| !r.passed).count();
    let passed = total - failed_count;

    if args.json {
        let summary = serde_json::json!({
            "total": total,
            "passed": passed,
            "failed": failed_count,
            "results": all_results.iter().map(|r| {
                serde_json::json!({
                    "scenario": r.scenario.name(),
                    "seed": r.seed,
                    "passed": r.passed,
                    "time_secs": r.final_time_secs,
                    "objects": r.final_object_count,
                    "metrics": r.metrics,
                    "failure_reason": r.failure_reason,
                })
            }).collect::<Vec<_>>(),
        });
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        info!("");
        info!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
        if failed_count == 0 {
            info!("✅ All {} scenario runs passed!", total);
        } else {
            error!("❌ {}/{} scenario runs failed!", failed_count, total);
            for result in all_results.iter().filter(|r| !r.passed) {
                error!(
                    "  - {} seed={}: {}",
                    result.scenario.name(),
                    result.seed,
                    result.failure_reason.as_deref().unwrap_or("unknown")
                );
            }
        }
    }

    if failed_count > 0 {
        std::process::exit(1);
    }
    Ok(())
}

fn report(result: &ScenarioResult) {
    if result.passed {
        info!(
            "✓ {} (seed={}) PASSED in {:.1}s virtual",
            result.scenario.name(),
            result.seed,
            result.final_time_secs
        );
    } else {
        error!(
            "✗ {} (seed={}) FAILED: {}",
            result.scenario.name(),
            result.seed,
            result.failure_reason.as_deref().unwrap_or("unknown")
        );
    }
}
