//! Batch trials: how reliably and how fast does the filter converge from a set of start poses?
//!
//! A [`TestManifest`] lists test cases, each a start pose plus the recorded log to replay. For
//! every case the [`TrialOrchestrator`] runs a number of trials: seek the log to the case's
//! start time, reset the filter around the start pose with a per-trial seed, then replay until
//! the filter converges or the step/time budget runs out. Each trial yields a [`TrialResult`],
//! which is appended to the results CSV straight away so an interrupted batch keeps everything
//! finished so far. [`summarize`] aggregates the results per test case and overall.
//!
//! Manifest CSV (header required; all but the first four columns optional):
//!
//! ```text
//! start_x,start_y,start_theta,data_source,num_trials,name,start_width,start_length,start_rotation,orientation_range,start_time
//! 12.0,7.5,1.57,row_3_north,20,row3,4.0,4.0,0.0,0.52,3.5
//! ```
//!
//! Angles are radians, lengths metres, `start_time` seconds from the start of the log.
//! Manifests written for the older tooling name three columns differently and are read as is:
//! `test_name` for `name`, `orientation_center` for `start_theta`, `data_file_name` for
//! `data_source`.
use crate::Pose2;
use crate::config::{ParticleFilterConfig, StartRegion, TrialConfig};
use crate::controller::{CancellationToken, FrameStepper, RunSlot, StepOutcome};
use crate::detect::TreeDetector;
use crate::engine::{ParticleFilterEngine, StartDistribution};
use crate::error::{LocalizationError, Result};
use crate::messages::{EventSink, RunEvent};
use crate::replay::{FrameSource, SourceProvider};

use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::thread::{self, JoinHandle};
use std::time::Instant;

/// One row of the test manifest.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TestCase {
    pub start_x: f64,
    pub start_y: f64,
    #[serde(default, alias = "orientation_center")]
    pub start_theta: f64,
    /// Identifier the [`SourceProvider`] resolves to a frame source.
    #[serde(alias = "data_file_name")]
    pub data_source: String,
    #[serde(default)]
    pub num_trials: Option<usize>,
    #[serde(default, alias = "test_name")]
    pub name: Option<String>,
    #[serde(default)]
    pub start_width: Option<f64>,
    #[serde(default)]
    pub start_length: Option<f64>,
    #[serde(default)]
    pub start_rotation: Option<f64>,
    #[serde(default)]
    pub orientation_range: Option<f64>,
    #[serde(default)]
    pub start_time: Option<f64>,
}

impl TestCase {
    pub fn new(start: Pose2, data_source: impl Into<String>) -> Self {
        TestCase {
            start_x: start.x,
            start_y: start.y,
            start_theta: start.theta,
            data_source: data_source.into(),
            num_trials: None,
            name: None,
            start_width: None,
            start_length: None,
            start_rotation: None,
            orientation_range: None,
            start_time: None,
        }
    }

    pub fn start_pose(&self) -> Pose2 {
        Pose2::new(self.start_x, self.start_y, self.start_theta)
    }

    /// Name used in results: the manifest `name`, or the row position.
    pub fn id(&self, index: usize) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("test_{}", index + 1))
    }

    /// The region the filter is seeded in, falling back to the batch defaults.
    pub fn start_region(&self, defaults: &TrialConfig) -> StartRegion {
        StartRegion {
            center_x: self.start_x,
            center_y: self.start_y,
            width: self.start_width.unwrap_or(defaults.start_width),
            height: self.start_length.unwrap_or(defaults.start_length),
            rotation: self.start_rotation.unwrap_or(0.0),
            orientation_center: self.start_theta,
            orientation_range: self.orientation_range.unwrap_or(defaults.orientation_range),
            both_directions: false,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TestManifest {
    cases: Vec<TestCase>,
}

impl TestManifest {
    pub fn new(cases: Vec<TestCase>) -> Self {
        TestManifest { cases }
    }

    /// Read a manifest CSV. A missing or malformed manifest is a configuration error.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            LocalizationError::config(format!(
                "cannot open test manifest '{}': {e}",
                path.display()
            ))
        })?;
        let manifest = Self::from_reader(file)?;
        info!(
            "Loaded {} test cases from {}",
            manifest.len(),
            path.display()
        );
        Ok(manifest)
    }

    pub fn from_reader<R: Read>(reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .from_reader(reader);
        let mut cases = Vec::new();
        for (row, record) in rdr.deserialize().enumerate() {
            let case: TestCase = record.map_err(|e| {
                LocalizationError::config(format!("test manifest row {}: {e}", row + 1))
            })?;
            cases.push(case);
        }
        if cases.is_empty() {
            return Err(LocalizationError::config("test manifest has no test cases"));
        }
        Ok(TestManifest { cases })
    }

    pub fn cases(&self) -> &[TestCase] {
        &self.cases
    }

    pub fn len(&self) -> usize {
        self.cases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cases.is_empty()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialOutcome {
    Converged,
    /// The step or time budget ran out before convergence.
    TimeoutExceeded,
    /// The log ended before convergence or budget exhaustion.
    StreamExhausted,
}

/// One row of the results CSV.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrialResult {
    pub test_case_id: String,
    pub trial_index: usize,
    pub seed: u64,
    pub outcome: TrialOutcome,
    pub converged: bool,
    /// Log seconds from the first image frame to convergence.
    pub time_to_converge: Option<f64>,
    /// Log seconds replayed.
    pub elapsed_s: f64,
    pub wall_time_s: f64,
    /// Path length from odometry, metres.
    pub distance_traveled: f64,
    pub image_frames: usize,
    /// Distance from the final estimate to the log's reference position.
    pub final_error: Option<f64>,
    /// Converged with a final error under the accuracy threshold; unknown without a reference.
    pub correct: Option<bool>,
    pub final_x: f64,
    pub final_y: f64,
    pub final_theta: f64,
}

impl TrialResult {
    pub fn final_pose(&self) -> Pose2 {
        Pose2::new(self.final_x, self.final_y, self.final_theta)
    }

    /// Counted as a success in the convergence rate.
    pub fn succeeded(&self) -> bool {
        self.converged && self.correct != Some(false)
    }
}

/// Appends trial results to a CSV file, flushing after every row.
pub struct ResultsWriter {
    writer: csv::Writer<File>,
}

impl ResultsWriter {
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        Ok(ResultsWriter {
            writer: csv::Writer::from_path(path)?,
        })
    }

    pub fn append(&mut self, result: &TrialResult) -> Result<()> {
        self.writer.serialize(result)?;
        self.writer.flush()?;
        Ok(())
    }

    pub fn read_all<P: AsRef<Path>>(path: P) -> Result<Vec<TrialResult>> {
        let mut rdr = csv::Reader::from_path(path)?;
        let mut results = Vec::new();
        for record in rdr.deserialize() {
            results.push(record?);
        }
        Ok(results)
    }
}

/// Aggregate statistics for one test case or for the whole batch.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TestSummary {
    pub test_case_id: String,
    pub trials: usize,
    pub successes: usize,
    pub convergence_rate: f64,
    /// Mean log seconds over all trials, converged or not.
    pub mean_time_all: Option<f64>,
    pub mean_time_converged: Option<f64>,
    pub median_time_converged: Option<f64>,
    pub mean_distance: Option<f64>,
}

impl TestSummary {
    fn from_results(test_case_id: String, results: &[&TrialResult]) -> Self {
        let trials = results.len();
        let successes = results.iter().filter(|r| r.succeeded()).count();
        let mut converged_times: Vec<f64> = results
            .iter()
            .filter(|r| r.succeeded())
            .filter_map(|r| r.time_to_converge)
            .collect();
        converged_times.sort_by(|a, b| a.total_cmp(b));
        let all_times: Vec<f64> = results.iter().map(|r| r.elapsed_s).collect();
        let distances: Vec<f64> = results.iter().map(|r| r.distance_traveled).collect();
        TestSummary {
            test_case_id,
            trials,
            successes,
            convergence_rate: if trials > 0 {
                successes as f64 / trials as f64
            } else {
                0.0
            },
            mean_time_all: mean(&all_times),
            mean_time_converged: mean(&converged_times),
            median_time_converged: median(&converged_times),
            mean_distance: mean(&distances),
        }
    }
}

fn mean(values: &[f64]) -> Option<f64> {
    (!values.is_empty()).then(|| values.iter().sum::<f64>() / values.len() as f64)
}

/// Median of sorted values.
fn median(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    match n {
        0 => None,
        _ if n % 2 == 1 => Some(sorted[n / 2]),
        _ => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0),
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct BatchSummary {
    /// One entry per test case, in the order the cases were first run.
    pub per_test: Vec<TestSummary>,
    pub overall: Option<TestSummary>,
    pub cancelled: bool,
}

impl BatchSummary {
    pub fn write_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut writer = csv::Writer::from_path(path)?;
        for row in self.per_test.iter().chain(self.overall.as_ref()) {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

pub fn summarize(results: &[TrialResult]) -> BatchSummary {
    let mut order: Vec<&str> = Vec::new();
    for r in results {
        if !order.contains(&r.test_case_id.as_str()) {
            order.push(&r.test_case_id);
        }
    }
    let per_test = order
        .iter()
        .map(|id| {
            let rows: Vec<&TrialResult> =
                results.iter().filter(|r| r.test_case_id == *id).collect();
            TestSummary::from_results(id.to_string(), &rows)
        })
        .collect();
    let all: Vec<&TrialResult> = results.iter().collect();
    BatchSummary {
        per_test,
        overall: (!all.is_empty()).then(|| TestSummary::from_results("overall".into(), &all)),
        cancelled: false,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchMode {
    All,
    /// Only the test case at this manifest index.
    Selected(usize),
    /// Load the case's data and reset the filter without running any trial.
    PreloadOnly(usize),
}

pub struct TrialOrchestrator {
    engine: ParticleFilterEngine,
    filter: ParticleFilterConfig,
    trials: TrialConfig,
    manifest: TestManifest,
    provider: Box<dyn SourceProvider>,
    detector: Box<dyn TreeDetector>,
    events: EventSink,
    writer: Option<ResultsWriter>,
    results: Vec<TrialResult>,
    loaded: Option<(String, Box<dyn FrameSource>)>,
    snapshot_particles: usize,
}

impl TrialOrchestrator {
    pub fn new(
        engine: ParticleFilterEngine,
        filter: ParticleFilterConfig,
        trials: TrialConfig,
        manifest: TestManifest,
        provider: Box<dyn SourceProvider>,
        detector: Box<dyn TreeDetector>,
        events: EventSink,
    ) -> Result<Self> {
        filter.validate()?;
        trials.validate()?;
        if manifest.is_empty() {
            return Err(LocalizationError::config("test manifest has no test cases"));
        }
        Ok(TrialOrchestrator {
            engine,
            filter,
            trials,
            manifest,
            provider,
            detector,
            events,
            writer: None,
            results: Vec::new(),
            loaded: None,
            snapshot_particles: 0,
        })
    }

    /// Append every finished trial to a CSV file.
    pub fn with_results_file<P: AsRef<Path>>(mut self, path: P) -> Result<Self> {
        self.writer = Some(ResultsWriter::create(path)?);
        Ok(self)
    }

    /// Emit snapshot events with up to `particles` particles after every image frame.
    pub fn with_snapshots(mut self, particles: usize) -> Self {
        self.snapshot_particles = particles;
        self
    }

    pub fn results(&self) -> &[TrialResult] {
        &self.results
    }

    pub fn engine(&self) -> &ParticleFilterEngine {
        &self.engine
    }

    pub fn manifest(&self) -> &TestManifest {
        &self.manifest
    }

    /// Run a batch on the calling thread.
    pub fn run(&mut self, mode: BatchMode, cancel: &CancellationToken) -> Result<BatchSummary> {
        let cases: Vec<usize> = match mode {
            BatchMode::All => (0..self.manifest.len()).collect(),
            BatchMode::Selected(i) => vec![self.check_index(i)?],
            BatchMode::PreloadOnly(i) => {
                let i = self.check_index(i)?;
                self.prepare(i, self.trials.base_seed)?;
                let id = self.manifest.cases()[i].id(i);
                if let Some(snapshot) = self.engine.snapshot(self.snapshot_particles.max(1)) {
                    self.events.emit(RunEvent::Snapshot(snapshot));
                }
                self.events.status(format!("Loaded data for {id}"));
                return Ok(BatchSummary::default());
            }
        };

        let first_new = self.results.len();
        let mut cancelled = false;
        'cases: for case_index in cases {
            let case = &self.manifest.cases()[case_index];
            let id = case.id(case_index);
            let start = case.start_pose();
            let num_trials = case.num_trials.unwrap_or(self.trials.num_trials);
            for trial in 0..num_trials {
                self.events
                    .status(format!("{id}: trial {}/{num_trials} from {start}", trial + 1));
                match self.run_trial(case_index, trial, cancel)? {
                    Some(result) => self.record(result)?,
                    None => {
                        cancelled = true;
                        break 'cases;
                    }
                }
            }
        }

        let mut summary = summarize(&self.results[first_new..]);
        summary.cancelled = cancelled;
        if cancelled {
            self.events.status("Batch cancelled, aborted trial discarded");
        }
        if let Some(path) = &self.trials.summary_path {
            summary.write_csv(path)?;
        }
        self.events.emit(RunEvent::BatchFinished(summary.clone()));
        Ok(summary)
    }

    /// Run a batch on a background thread holding `slot` until it ends.
    pub fn spawn(self, mode: BatchMode, slot: &RunSlot) -> Result<BatchHandle> {
        let guard = slot.try_acquire()?;
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name("pf-trials".into())
            .spawn(move || {
                let _guard = guard;
                let mut orchestrator = self;
                let result = orchestrator.run(mode, &worker_cancel);
                (orchestrator, result)
            })?;
        Ok(BatchHandle { handle, cancel })
    }

    fn check_index(&self, index: usize) -> Result<usize> {
        if index < self.manifest.len() {
            Ok(index)
        } else {
            Err(LocalizationError::config(format!(
                "test index {index} out of range, manifest has {} cases",
                self.manifest.len()
            )))
        }
    }

    fn trial_seed(&self, case_index: usize, trial: usize) -> u64 {
        self.trials
            .base_seed
            .wrapping_add(((case_index as u64) << 32) | trial as u64)
    }

    /// Open (or reuse) the case's frame source, seek to its start and reset the filter.
    fn prepare(&mut self, case_index: usize, seed: u64) -> Result<()> {
        let case = &self.manifest.cases()[case_index];
        let reuse = matches!(&self.loaded, Some((id, _)) if *id == case.data_source);
        if !reuse {
            let source = self.provider.open(&case.data_source)?;
            self.loaded = Some((case.data_source.clone(), source));
        }
        let start_time = case.start_time.unwrap_or(0.0);
        if let Some((_, source)) = self.loaded.as_mut()
            && (source.capabilities().seekable || start_time > 0.0)
        {
            source.set_time_position(start_time)?;
        }
        let config = ParticleFilterConfig {
            seed: Some(seed),
            start: Some(case.start_region(&self.trials)),
            ..self.filter.clone()
        };
        self.engine.reset(config, StartDistribution::Configured)
    }

    fn run_trial(
        &mut self,
        case_index: usize,
        trial: usize,
        cancel: &CancellationToken,
    ) -> Result<Option<TrialResult>> {
        let seed = self.trial_seed(case_index, trial);
        self.prepare(case_index, seed)?;
        let wall = Instant::now();
        let mut stepper = FrameStepper::new(self.snapshot_particles);
        let mut first_image: Option<f64> = None;
        let mut last_image = 0.0;
        let mut reference: Option<Pose2> = None;

        let outcome = loop {
            if cancel.is_cancelled() {
                info!("Trial {} of case {} cancelled", trial + 1, case_index + 1);
                return Ok(None);
            }
            let (_, source) = self.loaded.as_mut().ok_or(LocalizationError::NoSource)?;
            let step = stepper.step(
                &mut self.engine,
                self.detector.as_mut(),
                source.as_mut(),
                &self.events,
            )?;
            match step {
                StepOutcome::Odom | StepOutcome::Pending => {}
                StepOutcome::Exhausted => break TrialOutcome::StreamExhausted,
                StepOutcome::Image {
                    timestamp,
                    converged,
                    ground_truth,
                } => {
                    let start = *first_image.get_or_insert(timestamp);
                    last_image = timestamp;
                    if ground_truth.is_some() {
                        reference = ground_truth;
                    }
                    if converged {
                        break TrialOutcome::Converged;
                    }
                    let out_of_time = self
                        .trials
                        .timeout_s
                        .is_some_and(|limit| timestamp - start >= limit);
                    if stepper.image_frames() >= self.trials.max_steps || out_of_time {
                        break TrialOutcome::TimeoutExceeded;
                    }
                }
            }
        };

        let elapsed_s = first_image.map_or(0.0, |start| last_image - start);
        let final_pose = self.engine.best_estimate().unwrap_or_default();
        let final_error = reference.map(|r| final_pose.distance_to(&r));
        let converged = outcome == TrialOutcome::Converged;
        if outcome == TrialOutcome::StreamExhausted {
            warn!(
                "Case {} trial {} ran out of data before converging",
                case_index + 1,
                trial + 1
            );
        }
        Ok(Some(TrialResult {
            test_case_id: self.manifest.cases()[case_index].id(case_index),
            trial_index: trial,
            seed,
            outcome,
            converged,
            time_to_converge: converged.then_some(elapsed_s),
            elapsed_s,
            wall_time_s: wall.elapsed().as_secs_f64(),
            distance_traveled: stepper.distance_traveled(),
            image_frames: stepper.image_frames(),
            final_error,
            correct: final_error.map(|e| converged && e < self.trials.accuracy_threshold),
            final_x: final_pose.x,
            final_y: final_pose.y,
            final_theta: final_pose.theta,
        }))
    }

    fn record(&mut self, result: TrialResult) -> Result<()> {
        if let Some(writer) = self.writer.as_mut() {
            writer.append(&result)?;
        }
        self.events.status(format!(
            "{} trial {}: {:?} after {} frames ({:.2}s)",
            result.test_case_id,
            result.trial_index + 1,
            result.outcome,
            result.image_frames,
            result.elapsed_s
        ));
        self.events.emit(RunEvent::TrialFinished(result.clone()));
        self.results.push(result);
        Ok(())
    }
}

/// A batch running on a background thread.
pub struct BatchHandle {
    handle: JoinHandle<(TrialOrchestrator, Result<BatchSummary>)>,
    cancel: CancellationToken,
}

impl BatchHandle {
    /// Stop after the current frame; the trial in progress is discarded.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the batch. The orchestrator comes back even when the batch failed.
    pub fn join(self) -> Result<(TrialOrchestrator, Result<BatchSummary>)> {
        self.handle
            .join()
            .map_err(|_| LocalizationError::RunPanicked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;

    fn result(id: &str, converged: bool, time: f64, correct: Option<bool>) -> TrialResult {
        TrialResult {
            test_case_id: id.to_string(),
            trial_index: 0,
            seed: 1,
            outcome: if converged {
                TrialOutcome::Converged
            } else {
                TrialOutcome::TimeoutExceeded
            },
            converged,
            time_to_converge: converged.then_some(time),
            elapsed_s: time,
            wall_time_s: 0.01,
            distance_traveled: 2.0,
            image_frames: 10,
            final_error: None,
            correct,
            final_x: 0.0,
            final_y: 0.0,
            final_theta: 0.0,
        }
    }

    #[test]
    fn manifest_with_optional_columns() {
        let csv = "start_x, start_y, start_theta, data_source, num_trials, name, start_time\n\
                   1.0, 2.0, 0.5, row_a, 3, first, 1.5\n\
                   4.0, 5.0, 0.0, row_b, , ,\n";
        let manifest = TestManifest::from_reader(csv.as_bytes()).unwrap();
        assert_eq!(manifest.len(), 2);
        let a = &manifest.cases()[0];
        assert_eq!(a.num_trials, Some(3));
        assert_eq!(a.id(0), "first");
        assert_eq!(a.start_time, Some(1.5));
        let b = &manifest.cases()[1];
        assert_eq!(b.num_trials, None);
        assert_eq!(b.id(1), "test_2");
        let region = b.start_region(&TrialConfig::default());
        assert_eq!(region.width, TrialConfig::default().start_width);
    }

    #[test]
    fn minimal_manifest_columns() {
        let csv = "start_x,start_y,start_theta,data_source\n0,0,0,log\n";
        let manifest = TestManifest::from_reader(csv.as_bytes()).unwrap();
        assert_eq!(manifest.cases()[0].data_source, "log");
    }

    /// Column names from the older manifest layout map onto the same fields.
    #[test]
    fn legacy_manifest_column_names() {
        let csv = "test_name,start_x,start_y,start_width,start_length,start_rotation,\
                   orientation_center,orientation_range,data_file_name,start_time\n\
                   row3_north,12.0,7.5,4.0,2.0,0.1,1.57,0.52,row_3_north,3.5\n";
        let manifest = TestManifest::from_reader(csv.as_bytes()).unwrap();
        let case = &manifest.cases()[0];
        assert_eq!(case.id(0), "row3_north");
        assert_eq!(case.data_source, "row_3_north");
        assert_eq!(case.start_pose(), Pose2::new(12.0, 7.5, 1.57));
        assert_eq!(case.start_time, Some(3.5));
        let region = case.start_region(&TrialConfig::default());
        assert_eq!(region.width, 4.0);
        assert_eq!(region.height, 2.0);
        assert_eq!(region.rotation, 0.1);
        assert_eq!(region.orientation_center, 1.57);
        assert_eq!(region.orientation_range, 0.52);
        assert_eq!(case.num_trials, None);
    }

    #[test]
    fn missing_or_bad_manifest_is_configuration_error() {
        assert!(matches!(
            TestManifest::from_csv("/nonexistent/tests.csv"),
            Err(LocalizationError::Configuration(_))
        ));
        let bad = "start_x,start_y,start_theta,data_source\nabc,0,0,log\n";
        assert!(matches!(
            TestManifest::from_reader(bad.as_bytes()),
            Err(LocalizationError::Configuration(_))
        ));
    }

    #[test]
    fn summary_rates_and_times() {
        let results = vec![
            result("a", true, 2.0, None),
            result("a", true, 4.0, Some(true)),
            result("a", false, 9.0, None),
            result("b", true, 1.0, Some(false)),
        ];
        let summary = summarize(&results);
        assert_eq!(summary.per_test.len(), 2);
        let a = &summary.per_test[0];
        assert_eq!(a.trials, 3);
        assert_eq!(a.successes, 2);
        assert_approx_eq!(a.convergence_rate, 2.0 / 3.0, 1e-12);
        assert_approx_eq!(a.mean_time_all.unwrap(), 5.0, 1e-12);
        assert_approx_eq!(a.mean_time_converged.unwrap(), 3.0, 1e-12);
        assert_approx_eq!(a.median_time_converged.unwrap(), 3.0, 1e-12);

        // Converged to the wrong place does not count.
        let b = &summary.per_test[1];
        assert_eq!(b.successes, 0);
        assert_eq!(b.mean_time_converged, None);

        let overall = summary.overall.unwrap();
        assert_eq!(overall.trials, 4);
        assert_approx_eq!(overall.convergence_rate, 0.5, 1e-12);
        assert_approx_eq!(overall.mean_distance.unwrap(), 2.0, 1e-12);
    }

    #[test]
    fn results_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("results.csv");
        let mut writer = ResultsWriter::create(&path).unwrap();
        let rows = vec![result("a", true, 2.0, Some(true)), result("b", false, 3.0, None)];
        for r in &rows {
            writer.append(r).unwrap();
        }
        // Rows are on disk before the writer is dropped.
        let back = ResultsWriter::read_all(&path).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn summary_csv_has_overall_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.csv");
        summarize(&[result("a", true, 2.0, None)])
            .write_csv(&path)
            .unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.starts_with("test_case_id,trials,successes,convergence_rate"));
        assert_eq!(text.lines().count(), 3);
        assert!(text.lines().last().unwrap().starts_with("overall,"));
    }

    #[test]
    fn median_of_even_and_odd() {
        assert_eq!(median(&[]), None);
        assert_eq!(median(&[1.0, 3.0, 8.0]), Some(3.0));
        assert_eq!(median(&[1.0, 3.0]), Some(2.0));
    }
}
