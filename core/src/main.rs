//! ORCHARD PF: particle-filter localization for orchard robots.
//!
//! Two modes of operation:
//!
//! - `trials`: run batches of localization trials from a test manifest against cached logs and
//!   write per-trial results and summary statistics as CSV.
//! - `replay`: replay one or more cached logs through the filter, continuously or one image
//!   frame at a time, and print the estimate as it evolves.
//!
//! Parameters come from a configuration file (TOML/JSON/YAML, see `config`) with command line
//! flags taking precedence. Ctrl-C stops the active run at the next frame boundary.

mod common;

use clap::{Args, Parser, Subcommand};
use common::{collect_logs, init_logger, resolve_logging};
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{info, warn};
use orchard_pf::Pose2;
use orchard_pf::config::{AppConfig, StartRegion};
use orchard_pf::controller::{
    CancellationToken, ExecutionController, RunMode, RunSlot, StopReason,
};
use orchard_pf::detect::CachedDetector;
use orchard_pf::engine::{ParticleFilterEngine, StartDistribution};
use orchard_pf::map::OrchardMap;
use orchard_pf::messages::{RunEvent, event_channel};
use orchard_pf::replay::{CachedLogDirectory, RecordedLog};
use orchard_pf::trials::{BatchMode, BatchSummary, TestManifest, TestSummary, TrialOrchestrator};
use std::error::Error;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

const LONG_ABOUT: &str = "ORCHARD PF: particle-filter localization for orchard robots.

The filter tracks the robot's planar pose against a surveyed map of tree trunks, using wheel
odometry for prediction and trunk detections from depth/color images for correction.

- trials: run batches of localization trials from a CSV test manifest. Each test case names a
  start pose and a cached log; every trial seeds the filter around the start pose and replays
  the log until the filter converges or runs out of steps. Results are appended to a CSV file
  as trials finish.

- replay: replay cached logs through the filter, either continuously or one image frame at a
  time, chaining several logs back to back.

- config: write a configuration file with all default values.

Settings are read from a configuration file (TOML/JSON/YAML) given with --config; flags on the
command line override it.";

const EVENT_POLL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(author, version, about = "Particle-filter localization for orchard robots.", long_about = LONG_ABOUT)]
struct Cli {
    /// Configuration file (TOML/JSON/YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace); overrides `logging.level`
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Log file path; overrides `logging.file` (logs to stderr when neither is set)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        about = "Run localization trials from a test manifest",
        long_about = "Run batches of localization trials. Every row of the test manifest is a start pose plus a cached log; each trial seeds the filter around the start pose with its own seed and replays the log until convergence, the step budget or the end of the log."
    )]
    Trials(TrialArgs),
    #[command(
        about = "Replay cached logs through the filter",
        long_about = "Replay one or more cached logs through the filter. Directories are expanded to the JSON logs they contain. Logs are chained in the order given unless chaining is disabled in the configuration."
    )]
    Replay(ReplayArgs),
    #[command(about = "Write a default configuration file")]
    Config(ConfigArgs),
}

#[derive(Args, Clone, Debug)]
struct TrialArgs {
    /// Test manifest CSV
    #[arg(long)]
    manifest: Option<PathBuf>,
    /// Directory with one cached log per data source
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Output CSV for per-trial results
    #[arg(long)]
    results: Option<PathBuf>,
    /// Output CSV for per-test summaries
    #[arg(long)]
    summary: Option<PathBuf>,
    /// Map JSON
    #[arg(long)]
    map: Option<PathBuf>,
    /// Run only this test case (1-based manifest row)
    #[arg(long)]
    test: Option<usize>,
    /// Load the selected test case's data and start particles without running trials
    #[arg(long, requires = "test")]
    preload_only: bool,
    /// Trials per test case, unless the manifest row sets its own
    #[arg(long)]
    num_trials: Option<usize>,
    /// Base seed; each trial derives its own seed from it
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Clone, Debug)]
struct ReplayArgs {
    /// Cached log files or directories of logs
    #[arg(required = true, num_args = 1..)]
    input: Vec<PathBuf>,
    /// Map JSON
    #[arg(long)]
    map: Option<PathBuf>,
    /// Advance one image frame per Enter key press
    #[arg(long)]
    single_step: bool,
    /// Stop as soon as the filter converges
    #[arg(long)]
    stop_on_convergence: bool,
    /// Start the particles around this x (metres, map frame)
    #[arg(long, requires = "start_y", allow_hyphen_values = true)]
    start_x: Option<f64>,
    #[arg(long, requires = "start_x", allow_hyphen_values = true)]
    start_y: Option<f64>,
    /// Heading at the start position, degrees
    #[arg(long, default_value_t = 0.0, allow_hyphen_values = true)]
    start_heading: f64,
    /// Particle count
    #[arg(long)]
    particles: Option<usize>,
    #[arg(long)]
    seed: Option<u64>,
}

#[derive(Args, Clone, Debug)]
struct ConfigArgs {
    /// Output path; the extension picks the format
    #[arg(short, long, default_value = "orchard-pf.toml")]
    output: PathBuf,
}

/// Read before the logger exists, so nothing here logs.
fn load_config(path: Option<&PathBuf>) -> Result<AppConfig, Box<dyn Error>> {
    Ok(match path {
        Some(path) => AppConfig::from_file(path)?,
        None => AppConfig::default(),
    })
}

fn load_map(config: &AppConfig, flag: Option<&PathBuf>) -> Result<Arc<OrchardMap>, Box<dyn Error>> {
    let path = flag
        .or(config.map.path.as_ref())
        .ok_or("No map given. Use --map or set map.path in the configuration.")?;
    let map = OrchardMap::from_json(path, &config.map)?;
    info!("Loaded map with {} trees from {}", map.len(), path.display());
    Ok(Arc::new(map))
}

/// Cancellation token tripped by Ctrl-C.
fn interrupt_token() -> Result<CancellationToken, Box<dyn Error>> {
    let token = CancellationToken::new();
    let handler_token = token.clone();
    ctrlc::set_handler(move || {
        eprintln!("Interrupted, stopping at the next frame");
        handler_token.cancel();
    })?;
    Ok(token)
}

fn print_event(event: &RunEvent) {
    match event {
        RunEvent::Snapshot(snapshot) => {
            let progress = snapshot
                .position
                .map(|p| match p.total {
                    Some(total) => format!("[{}/{}] t={:.2}s", p.index, total, p.timestamp),
                    None => format!("[{}] t={:.2}s", p.index, p.timestamp),
                })
                .unwrap_or_default();
            println!(
                "{progress} estimate {} ess {:.0}{}",
                snapshot.best_estimate,
                snapshot.effective_sample_size,
                if snapshot.converged { " converged" } else { "" }
            );
        }
        RunEvent::Status(message) => println!("{message}"),
        RunEvent::SourceAdvanced { from, to } => println!("Finished {from}, continuing with {to}"),
        RunEvent::TrialFinished(_) | RunEvent::BatchFinished(_) => {}
        RunEvent::Completed(summary) => println!(
            "Run ended ({:?}): {} image frames, {:.1} m travelled",
            summary.reason, summary.image_frames, summary.distance_traveled
        ),
    }
}

fn drain_events(rx: &Receiver<RunEvent>) {
    for event in rx.try_iter() {
        print_event(&event);
    }
}

/// Print events until `finished` says the background work is done, stopping it on Ctrl-C.
fn pump_events(
    rx: &Receiver<RunEvent>,
    interrupt: &CancellationToken,
    mut finished: impl FnMut() -> bool,
    stop: impl Fn(),
) {
    let mut stopping = false;
    loop {
        if interrupt.is_cancelled() && !stopping {
            stop();
            stopping = true;
        }
        match rx.recv_timeout(EVENT_POLL) {
            Ok(event) => print_event(&event),
            Err(RecvTimeoutError::Timeout) => {
                if finished() {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    drain_events(rx);
}

fn print_summary_row(row: &TestSummary) {
    let fmt = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |v| format!("{v:.2}"));
    println!(
        "{:<20} {:>6} {:>8} {:>8.1}% {:>10} {:>10} {:>10} {:>10}",
        row.test_case_id,
        row.trials,
        row.successes,
        row.convergence_rate * 100.0,
        fmt(row.mean_time_all),
        fmt(row.mean_time_converged),
        fmt(row.median_time_converged),
        fmt(row.mean_distance),
    );
}

fn print_batch_summary(summary: &BatchSummary) {
    println!(
        "{:<20} {:>6} {:>8} {:>9} {:>10} {:>10} {:>10} {:>10}",
        "test", "trials", "success", "rate", "mean t", "mean t ok", "median ok", "mean dist"
    );
    for row in summary.per_test.iter().chain(summary.overall.as_ref()) {
        print_summary_row(row);
    }
    if summary.cancelled {
        println!("Batch was cancelled before all trials finished.");
    }
}

fn run_trials(mut config: AppConfig, args: &TrialArgs) -> Result<(), Box<dyn Error>> {
    let trials = &mut config.trials;
    if let Some(path) = &args.manifest {
        trials.manifest_path = path.clone();
    }
    if let Some(dir) = &args.data_dir {
        trials.data_dir = dir.clone();
    }
    if let Some(path) = &args.results {
        trials.results_path = path.clone();
    }
    if let Some(path) = &args.summary {
        trials.summary_path = Some(path.clone());
    }
    if let Some(n) = args.num_trials {
        trials.num_trials = n;
    }
    if let Some(seed) = args.seed {
        trials.base_seed = seed;
    }
    config.validate()?;

    let mode = match (args.test, args.preload_only) {
        (Some(0), _) => return Err("--test counts manifest rows from 1".into()),
        (Some(n), true) => BatchMode::PreloadOnly(n - 1),
        (Some(n), false) => BatchMode::Selected(n - 1),
        (None, _) => BatchMode::All,
    };

    let map = load_map(&config, args.map.as_ref())?;
    let manifest = TestManifest::from_csv(&config.trials.manifest_path)?;
    let (events, rx) = event_channel();
    let mut orchestrator = TrialOrchestrator::new(
        ParticleFilterEngine::new(map),
        config.filter.clone(),
        config.trials.clone(),
        manifest,
        Box::new(CachedLogDirectory::new(&config.trials.data_dir)),
        Box::new(CachedDetector::new(&config.detector)),
        events,
    )?
    .with_snapshots(config.controller.snapshot_particles);
    if !matches!(mode, BatchMode::PreloadOnly(_)) {
        orchestrator = orchestrator.with_results_file(&config.trials.results_path)?;
        info!(
            "Writing trial results to {}",
            config.trials.results_path.display()
        );
    }

    let interrupt = interrupt_token()?;
    let handle = orchestrator.spawn(mode, &RunSlot::new())?;
    pump_events(
        &rx,
        &interrupt,
        || handle.is_finished(),
        || handle.cancel(),
    );
    let (orchestrator, result) = handle.join()?;
    let summary = result?;
    drain_events(&rx);

    if let BatchMode::PreloadOnly(_) = mode {
        if let Some(estimate) = orchestrator.engine().best_estimate() {
            println!("Start particles loaded, mean pose {estimate}");
        }
        return Ok(());
    }
    print_batch_summary(&summary);
    Ok(())
}

fn run_replay(mut config: AppConfig, args: &ReplayArgs) -> Result<(), Box<dyn Error>> {
    if args.stop_on_convergence {
        config.controller.stop_on_convergence = true;
    }
    if let Some(n) = args.particles {
        config.filter.num_particles = n;
    }
    if args.seed.is_some() {
        config.filter.seed = args.seed;
    }
    config.validate()?;

    let start = match (args.start_x, args.start_y) {
        (Some(x), Some(y)) => {
            let pose = Pose2::new(x, y, args.start_heading.to_radians());
            StartDistribution::Region(StartRegion {
                orientation_range: config.trials.orientation_range,
                ..StartRegion::around(pose, config.trials.start_width, config.trials.start_length)
            })
        }
        _ => StartDistribution::Configured,
    };

    let map = load_map(&config, args.map.as_ref())?;
    let (events, rx) = event_channel();
    let mut controller = ExecutionController::new(
        ParticleFilterEngine::new(map),
        Box::new(CachedDetector::new(&config.detector)),
        config.controller.clone(),
        events,
        RunSlot::new(),
    );
    for path in collect_logs(&args.input)? {
        controller.add_source(Box::new(RecordedLog::from_cached_json(&path)?))?;
    }
    controller.set_parameters(config.filter.clone(), start)?;

    let interrupt = interrupt_token()?;
    if !args.single_step {
        controller.start(RunMode::Continuous)?;
        pump_events(
            &rx,
            &interrupt,
            || !controller.is_running(),
            || controller.stop(),
        );
        let summary = controller.join()?;
        drain_events(&rx);
        if let Some(summary) = summary
            && let Some(estimate) = summary.final_estimate
        {
            println!("Final estimate {estimate}");
        }
        return Ok(());
    }

    println!("Press Enter to advance one image frame, q then Enter to quit.");
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    loop {
        controller.start(RunMode::SingleStep)?;
        let summary = controller.join()?;
        drain_events(&rx);
        match summary.map(|s| s.reason) {
            Some(StopReason::StepComplete) => {}
            Some(reason) => {
                println!("Replay ended: {reason:?}");
                break;
            }
            None => break,
        }
        if interrupt.is_cancelled() {
            break;
        }
        match lines.next() {
            Some(Ok(line)) if line.trim() != "q" => {}
            Some(Err(e)) => {
                warn!("Could not read from stdin: {e}");
                break;
            }
            _ => break,
        }
    }
    Ok(())
}

fn write_default_config(args: &ConfigArgs) -> Result<(), Box<dyn Error>> {
    AppConfig::default().to_file(&args.output)?;
    println!("Wrote default configuration to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    let logging = resolve_logging(
        &config.logging,
        cli.log_level.as_deref(),
        cli.log_file.as_ref(),
    )?;
    init_logger(&logging)?;
    if let Some(path) = &cli.config {
        info!("Loaded configuration from {}", path.display());
    }

    match &cli.command {
        Command::Trials(args) => run_trials(config, args),
        Command::Replay(args) => run_replay(config, args),
        Command::Config(args) => write_default_config(args),
    }
}
