//! Runs the particle filter over frame sources on a background thread.
//!
//! The [`ExecutionController`] owns the engine, the queued frame sources and the detector while
//! idle. [`ExecutionController::start`] moves them into a worker thread, which hands them back
//! when the run ends and is joined. While the run is active the controller only holds the
//! thread handle and the run's [`CancellationToken`], so nothing else can touch the engine or
//! change its parameters. Progress is reported as [`RunEvent`]s through the [`EventSink`].
//!
//! Cancellation is cooperative: the worker checks the token between frames, so a stopped run
//! never leaves a half-updated particle set behind.
use crate::Pose2;
use crate::config::{ControllerConfig, ParticleFilterConfig};
use crate::detect::TreeDetector;
use crate::engine::{OdomAccumulator, ParticleFilterEngine, SensorUpdate, StartDistribution};
use crate::error::{LocalizationError, Result};
use crate::messages::{EventSink, Frame, PlaybackPosition, RunEvent};
use crate::replay::{FrameSource, FrameStatus};

use log::{debug, error, info};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Shared stop request for a background run.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Admits one background run at a time across every controller and trial batch sharing it.
#[derive(Clone, Debug, Default)]
pub struct RunSlot(Arc<AtomicBool>);

impl RunSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot until the returned guard is dropped.
    pub fn try_acquire(&self) -> Result<RunSlotGuard> {
        self.0
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| LocalizationError::RunActive)?;
        Ok(RunSlotGuard(self.0.clone()))
    }

    pub fn is_taken(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug)]
pub struct RunSlotGuard(Arc<AtomicBool>);

impl Drop for RunSlotGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Process frames until stopped, converged (when configured) or out of data.
    Continuous,
    /// Process frames up to and including the next image frame, then halt.
    SingleStep,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Cancelled,
    Converged,
    Exhausted,
    StepComplete,
    /// A frame could not be processed; the error is returned from the run.
    Failed,
}

/// What a finished run reports.
#[derive(Clone, Debug, PartialEq)]
pub struct RunSummary {
    pub reason: StopReason,
    pub source: Option<String>,
    pub image_frames: usize,
    pub odom_frames: usize,
    pub degenerate_updates: usize,
    pub distance_traveled: f64,
    pub final_estimate: Option<Pose2>,
    pub converged: bool,
}

/// What one [`FrameStepper::step`] call did.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StepOutcome {
    Odom,
    Image {
        timestamp: f64,
        converged: bool,
        ground_truth: Option<Pose2>,
    },
    Pending,
    Exhausted,
}

/// Applies frames from a source to an engine in arrival order.
///
/// Odometry is accumulated until the next image frame; the image then triggers one motion
/// update, a sensor update when the detector finds something, and resampling per policy.
#[derive(Clone, Debug, Default)]
pub struct FrameStepper {
    odom: OdomAccumulator,
    snapshot_particles: usize,
    image_frames: usize,
    odom_frames: usize,
    degenerate_updates: usize,
    distance: f64,
}

impl FrameStepper {
    /// `snapshot_particles` of zero disables snapshot events.
    pub fn new(snapshot_particles: usize) -> Self {
        FrameStepper {
            snapshot_particles,
            ..Self::default()
        }
    }

    pub fn step(
        &mut self,
        engine: &mut ParticleFilterEngine,
        detector: &mut dyn TreeDetector,
        source: &mut dyn FrameSource,
        events: &EventSink,
    ) -> Result<StepOutcome> {
        match source.next_frame()? {
            FrameStatus::Pending => Ok(StepOutcome::Pending),
            FrameStatus::Exhausted => Ok(StepOutcome::Exhausted),
            FrameStatus::Ready(Frame::Odom(sample)) => {
                self.odom.push(&sample);
                self.odom_frames += 1;
                Ok(StepOutcome::Odom)
            }
            FrameStatus::Ready(Frame::Image(image)) => {
                if let Some(increment) = self.odom.take(image.timestamp) {
                    engine.apply_motion(&increment)?;
                    self.distance += increment.distance;
                }
                if let Some(observations) = detector.detect(&image)? {
                    match engine.sensor_update(&observations)? {
                        SensorUpdate::Updated { .. } => {
                            engine.resample_if_needed()?;
                        }
                        SensorUpdate::Degenerate => {
                            self.degenerate_updates += 1;
                            debug!(
                                "Skipped degenerate sensor update at {:.3}s",
                                image.timestamp
                            );
                        }
                        SensorUpdate::NoObservations => {}
                    }
                }
                self.image_frames += 1;
                let converged = engine.check_convergence();
                if self.snapshot_particles > 0
                    && let Some(mut snapshot) = engine.snapshot(self.snapshot_particles)
                {
                    snapshot.position = Some(PlaybackPosition {
                        index: source.current_position(),
                        total: source.total_count(),
                        timestamp: image.timestamp,
                    });
                    snapshot.backlog = source.backlog();
                    events.emit(RunEvent::Snapshot(snapshot));
                }
                Ok(StepOutcome::Image {
                    timestamp: image.timestamp,
                    converged,
                    ground_truth: image.ground_truth,
                })
            }
        }
    }

    /// Drop pending odometry, e.g. when switching to a source with its own clock.
    pub fn clear_motion(&mut self) {
        self.odom.reset();
    }

    /// Clear pending odometry and all counters.
    pub fn reset(&mut self) {
        *self = Self::new(self.snapshot_particles);
    }

    pub fn image_frames(&self) -> usize {
        self.image_frames
    }

    pub fn odom_frames(&self) -> usize {
        self.odom_frames
    }

    pub fn degenerate_updates(&self) -> usize {
        self.degenerate_updates
    }

    /// Path length integrated from odometry, metres.
    pub fn distance_traveled(&self) -> f64 {
        self.distance
    }
}

/// Everything a run needs exclusive access to.
struct RunState {
    engine: ParticleFilterEngine,
    detector: Box<dyn TreeDetector>,
    sources: VecDeque<Box<dyn FrameSource>>,
    stepper: FrameStepper,
}

struct ActiveRun {
    handle: JoinHandle<(RunState, Result<RunSummary>)>,
    cancel: CancellationToken,
}

pub struct ExecutionController {
    /// `None` while a run holds the state.
    state: Option<RunState>,
    active: Option<ActiveRun>,
    config: ControllerConfig,
    events: EventSink,
    slot: RunSlot,
}

impl ExecutionController {
    pub fn new(
        engine: ParticleFilterEngine,
        detector: Box<dyn TreeDetector>,
        config: ControllerConfig,
        events: EventSink,
        slot: RunSlot,
    ) -> Self {
        let stepper = FrameStepper::new(config.snapshot_particles);
        ExecutionController {
            state: Some(RunState {
                engine,
                detector,
                sources: VecDeque::new(),
                stepper,
            }),
            active: None,
            config,
            events,
            slot,
        }
    }

    /// The run state while no run is active. Once a worker thread panicked its state is gone
    /// and every call that needs it fails with `RunPanicked`.
    fn idle_state(&mut self) -> Result<&mut RunState> {
        self.reap();
        if self.active.is_some() {
            return Err(LocalizationError::RunActive);
        }
        self.state.as_mut().ok_or(LocalizationError::RunPanicked)
    }

    /// Queue a frame source behind any already loaded.
    pub fn add_source(&mut self, source: Box<dyn FrameSource>) -> Result<()> {
        let state = self.idle_state()?;
        info!("Queued frame source {}", source.name());
        state.sources.push_back(source);
        Ok(())
    }

    pub fn source_count(&self) -> usize {
        self.state.as_ref().map_or(0, |s| s.sources.len())
    }

    /// Reinitialize the filter with new parameters. Rejected while a run is active.
    pub fn set_parameters(
        &mut self,
        config: ParticleFilterConfig,
        start: StartDistribution,
    ) -> Result<()> {
        let state = match self.idle_state() {
            Err(LocalizationError::RunActive) => return Err(LocalizationError::ParametersLocked),
            other => other?,
        };
        state.engine.reset(config, start)?;
        state.stepper.reset();
        Ok(())
    }

    pub fn set_controller_config(&mut self, config: ControllerConfig) -> Result<()> {
        let state = match self.idle_state() {
            Err(LocalizationError::RunActive) => return Err(LocalizationError::ParametersLocked),
            other => other?,
        };
        state.stepper = FrameStepper::new(config.snapshot_particles);
        self.config = config;
        Ok(())
    }

    /// Start a background run.
    ///
    /// # Errors
    /// `RunActive` when this controller or another holder of the same [`RunSlot`] is running,
    /// `NoSource` with no frame source queued, `Uninitialized` before the engine was reset,
    /// `RunPanicked` once an earlier run's thread panicked and took the engine with it.
    pub fn start(&mut self, mode: RunMode) -> Result<()> {
        let state = self.idle_state()?;
        if state.sources.is_empty() {
            return Err(LocalizationError::NoSource);
        }
        if state.engine.best_estimate().is_none() {
            return Err(LocalizationError::Uninitialized);
        }
        let guard = self.slot.try_acquire()?;
        let Some(mut state) = self.state.take() else {
            return Err(LocalizationError::RunPanicked);
        };
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let config = self.config.clone();
        let events = self.events.clone();
        info!("Starting {:?} run", mode);
        let handle = thread::Builder::new()
            .name("pf-run".into())
            .spawn(move || {
                let _guard = guard;
                let result = run_loop(&mut state, mode, &config, &worker_cancel, &events);
                if let Err(e) = &result {
                    error!("Run failed: {e}");
                    events.emit(RunEvent::Status(format!("Run failed: {e}")));
                }
                (state, result)
            })?;
        self.active = Some(ActiveRun { handle, cancel });
        Ok(())
    }

    /// Ask the active run to stop at the next frame boundary.
    pub fn stop(&self) {
        if let Some(active) = &self.active {
            active.cancel.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.active
            .as_ref()
            .is_some_and(|a| !a.handle.is_finished())
    }

    /// Wait for the active run and take the engine back. `Ok(None)` when nothing was running.
    pub fn join(&mut self) -> Result<Option<RunSummary>> {
        let Some(active) = self.active.take() else {
            return Ok(None);
        };
        match active.handle.join() {
            Ok((state, result)) => {
                self.state = Some(state);
                result.map(Some)
            }
            Err(_) => Err(LocalizationError::RunPanicked),
        }
    }

    /// Collect a run that already finished on its own.
    fn reap(&mut self) {
        if self.active.as_ref().is_some_and(|a| a.handle.is_finished())
            && let Err(e) = self.join()
        {
            debug!("Collected failed run: {e}");
        }
    }

    /// Engine access while idle.
    pub fn engine(&self) -> Option<&ParticleFilterEngine> {
        match self.active {
            Some(_) => None,
            None => self.state.as_ref().map(|s| &s.engine),
        }
    }
}

impl Drop for ExecutionController {
    fn drop(&mut self) {
        self.stop();
        if let Err(e) = self.join() {
            debug!("Run ended with error during shutdown: {e}");
        }
    }
}

/// Play frames until the run stops, then report how it ended. A failed frame still produces a
/// `Completed` event before the error is returned.
fn run_loop(
    state: &mut RunState,
    mode: RunMode,
    config: &ControllerConfig,
    cancel: &CancellationToken,
    events: &EventSink,
) -> Result<RunSummary> {
    let images_at_start = state.stepper.image_frames();
    let result = drive(state, mode, config, cancel, events);
    let reason = match &result {
        Ok(reason) => *reason,
        Err(_) => StopReason::Failed,
    };
    let summary = RunSummary {
        reason,
        source: state.sources.front().map(|s| s.name().to_string()),
        image_frames: state.stepper.image_frames(),
        odom_frames: state.stepper.odom_frames(),
        degenerate_updates: state.stepper.degenerate_updates(),
        distance_traveled: state.stepper.distance_traveled(),
        final_estimate: state.engine.best_estimate(),
        converged: state.engine.check_convergence(),
    };
    info!(
        "Run stopped ({:?}) after {} image frames",
        reason,
        summary.image_frames - images_at_start
    );
    events.emit(RunEvent::Completed(summary.clone()));
    result.map(|_| summary)
}

fn drive(
    state: &mut RunState,
    mode: RunMode,
    config: &ControllerConfig,
    cancel: &CancellationToken,
    events: &EventSink,
) -> Result<StopReason> {
    let delay = Duration::from_millis(config.playback_delay_ms);
    let reason = loop {
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }
        let Some(source) = state.sources.front_mut() else {
            break StopReason::Exhausted;
        };
        let outcome = state.stepper.step(
            &mut state.engine,
            state.detector.as_mut(),
            source.as_mut(),
            events,
        )?;
        match outcome {
            StepOutcome::Odom | StepOutcome::Pending => {}
            StepOutcome::Exhausted => {
                let finished = state.sources.pop_front();
                let from = finished.as_ref().map(|s| s.name().to_string());
                match (config.chain_sources, state.sources.front()) {
                    (true, Some(next)) => {
                        let to = next.name().to_string();
                        let from = from.unwrap_or_default();
                        events.status(format!("Finished {from}, continuing with {to}"));
                        events.emit(RunEvent::SourceAdvanced { from, to });
                        state.stepper.clear_motion();
                    }
                    _ => break StopReason::Exhausted,
                }
            }
            StepOutcome::Image { converged, .. } => {
                if mode == RunMode::SingleStep {
                    break StopReason::StepComplete;
                }
                if converged && config.stop_on_convergence {
                    break StopReason::Converged;
                }
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
            }
        }
    };
    Ok(reason)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::CachedDetector;
    use crate::map::{MapTree, OrchardMap};
    use crate::messages::{ImageFrame, OdomSample, event_channel};
    use crate::replay::{LiveFeed, RecordedLog};
    use crate::{Pose2, TreeObservation};

    fn engine() -> ParticleFilterEngine {
        let map = OrchardMap::new(vec![MapTree::new(2.0, 1.0), MapTree::new(2.0, -1.0)]).unwrap();
        let mut engine = ParticleFilterEngine::new(Arc::new(map));
        let config = ParticleFilterConfig {
            num_particles: 100,
            seed: Some(3),
            ..ParticleFilterConfig::default()
        };
        engine
            .reset(
                config,
                StartDistribution::Gaussian {
                    pose: Pose2::default(),
                    position_std: 0.3,
                    heading_std: 0.05,
                },
            )
            .unwrap();
        engine
    }

    fn log(name: &str, images: usize) -> Box<dyn FrameSource> {
        let mut frames = Vec::new();
        for i in 0..images {
            let t = i as f64;
            frames.push(Frame::Odom(OdomSample::new(0.0, 0.0, t - 0.5)));
            frames.push(Frame::Image(ImageFrame::new(t).with_observations(vec![
                TreeObservation::new(2.0, 1.0, 0.1),
                TreeObservation::new(2.0, -1.0, 0.1),
            ])));
        }
        Box::new(RecordedLog::new(name, frames))
    }

    fn controller(config: ControllerConfig, events: EventSink) -> ExecutionController {
        ExecutionController::new(
            engine(),
            Box::new(CachedDetector::identity()),
            config,
            events,
            RunSlot::new(),
        )
    }

    #[test]
    fn start_without_source_fails() {
        let mut c = controller(ControllerConfig::default(), EventSink::disabled());
        assert!(matches!(
            c.start(RunMode::Continuous),
            Err(LocalizationError::NoSource)
        ));
    }

    #[test]
    fn continuous_run_completes_on_exhaustion() {
        let (sink, rx) = event_channel();
        let mut c = controller(ControllerConfig::default(), sink);
        c.add_source(log("a", 5)).unwrap();
        c.start(RunMode::Continuous).unwrap();
        let summary = c.join().unwrap().unwrap();
        assert_eq!(summary.reason, StopReason::Exhausted);
        assert_eq!(summary.image_frames, 5);
        let snapshots = rx
            .try_iter()
            .filter(|e| matches!(e, RunEvent::Snapshot(_)))
            .count();
        assert_eq!(snapshots, 5);
        assert!(c.engine().is_some());
    }

    #[test]
    fn single_step_consumes_one_image() {
        let mut c = controller(ControllerConfig::default(), EventSink::disabled());
        c.add_source(log("a", 3)).unwrap();
        for expected in 1..=3 {
            c.start(RunMode::SingleStep).unwrap();
            let summary = c.join().unwrap().unwrap();
            assert_eq!(summary.reason, StopReason::StepComplete);
            assert_eq!(summary.image_frames, expected);
        }
        c.start(RunMode::SingleStep).unwrap();
        assert_eq!(c.join().unwrap().unwrap().reason, StopReason::Exhausted);
    }

    #[test]
    fn chaining_advances_to_next_source() {
        let (sink, rx) = event_channel();
        let mut c = controller(ControllerConfig::default(), sink);
        c.add_source(log("first", 2)).unwrap();
        c.add_source(log("second", 3)).unwrap();
        c.start(RunMode::Continuous).unwrap();
        let summary = c.join().unwrap().unwrap();
        assert_eq!(summary.image_frames, 5);
        assert!(rx.try_iter().any(|e| matches!(
            e,
            RunEvent::SourceAdvanced { ref from, ref to } if from == "first" && to == "second"
        )));
    }

    #[test]
    fn without_chaining_each_start_plays_one_source() {
        let config = ControllerConfig {
            chain_sources: false,
            ..ControllerConfig::default()
        };
        let mut c = controller(config, EventSink::disabled());
        c.add_source(log("first", 2)).unwrap();
        c.add_source(log("second", 3)).unwrap();
        c.start(RunMode::Continuous).unwrap();
        assert_eq!(c.join().unwrap().unwrap().image_frames, 2);
        assert_eq!(c.source_count(), 1);
    }

    #[test]
    fn stop_on_convergence_halts_early() {
        let config = ControllerConfig {
            stop_on_convergence: true,
            ..ControllerConfig::default()
        };
        let mut c = controller(config, EventSink::disabled());
        c.add_source(log("a", 50)).unwrap();
        c.start(RunMode::Continuous).unwrap();
        let summary = c.join().unwrap().unwrap();
        assert_eq!(summary.reason, StopReason::Converged);
        assert!(summary.converged);
        assert!(summary.image_frames < 50);
    }

    /// A live feed that never delivers keeps the run busy until it is stopped; meanwhile a
    /// second start and parameter changes are refused.
    #[test]
    fn busy_run_rejects_start_and_parameter_changes() {
        let (tx, feed) =
            LiveFeed::channel("live", 0.01, Duration::from_millis(5)).unwrap();
        let mut c = controller(ControllerConfig::default(), EventSink::disabled());
        c.add_source(Box::new(feed)).unwrap();
        c.start(RunMode::Continuous).unwrap();
        assert!(c.is_running());
        assert!(matches!(
            c.start(RunMode::Continuous),
            Err(LocalizationError::RunActive)
        ));
        assert!(matches!(
            c.set_parameters(ParticleFilterConfig::default(), StartDistribution::WholeMap),
            Err(LocalizationError::ParametersLocked)
        ));
        assert!(c.engine().is_none());
        c.stop();
        let summary = c.join().unwrap().unwrap();
        assert_eq!(summary.reason, StopReason::Cancelled);
        drop(tx);
    }

    #[test]
    fn shared_slot_admits_one_run() {
        let slot = RunSlot::new();
        let guard = slot.try_acquire().unwrap();
        let mut c = ExecutionController::new(
            engine(),
            Box::new(CachedDetector::identity()),
            ControllerConfig::default(),
            EventSink::disabled(),
            slot.clone(),
        );
        c.add_source(log("a", 1)).unwrap();
        assert!(matches!(
            c.start(RunMode::Continuous),
            Err(LocalizationError::RunActive)
        ));
        drop(guard);
        c.start(RunMode::Continuous).unwrap();
        c.join().unwrap();
        assert!(!slot.is_taken());
    }

    /// Fails every detection after the first few frames.
    struct FailingDetector {
        remaining: usize,
        panic: bool,
    }

    impl TreeDetector for FailingDetector {
        fn detect(&mut self, frame: &ImageFrame) -> Result<Option<Vec<TreeObservation>>> {
            if self.remaining > 0 {
                self.remaining -= 1;
                return Ok(frame.observations.clone());
            }
            if self.panic {
                panic!("detector crashed");
            }
            Err(LocalizationError::Detection("model not loaded".into()))
        }
    }

    fn failing_controller(panic: bool, events: EventSink, slot: RunSlot) -> ExecutionController {
        ExecutionController::new(
            engine(),
            Box::new(FailingDetector {
                remaining: 2,
                panic,
            }),
            ControllerConfig::default(),
            events,
            slot,
        )
    }

    /// A detection error ends the run with a `Completed` event before the error surfaces, and
    /// the engine comes back usable.
    #[test]
    fn failed_frame_still_reports_completion() {
        let (sink, rx) = event_channel();
        let mut c = failing_controller(false, sink, RunSlot::new());
        c.add_source(log("a", 5)).unwrap();
        c.start(RunMode::Continuous).unwrap();
        assert!(matches!(c.join(), Err(LocalizationError::Detection(_))));

        let completed: Vec<RunSummary> = rx
            .try_iter()
            .filter_map(|e| match e {
                RunEvent::Completed(summary) => Some(summary),
                _ => None,
            })
            .collect();
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].reason, StopReason::Failed);
        assert_eq!(completed[0].image_frames, 2);
        assert!(c.engine().is_some());
        c.add_source(log("b", 1)).unwrap();
    }

    /// After the worker panics the controller keeps refusing with `RunPanicked` instead of
    /// claiming a run is still active, and the shared slot is free again.
    #[test]
    fn panicked_run_is_reported_permanently() {
        let slot = RunSlot::new();
        let mut c = failing_controller(true, EventSink::disabled(), slot.clone());
        c.add_source(log("a", 5)).unwrap();
        c.start(RunMode::Continuous).unwrap();
        assert!(matches!(c.join(), Err(LocalizationError::RunPanicked)));
        assert!(!slot.is_taken());

        assert!(matches!(
            c.start(RunMode::Continuous),
            Err(LocalizationError::RunPanicked)
        ));
        assert!(matches!(
            c.set_parameters(ParticleFilterConfig::default(), StartDistribution::WholeMap),
            Err(LocalizationError::RunPanicked)
        ));
        assert!(matches!(
            c.add_source(log("b", 1)),
            Err(LocalizationError::RunPanicked)
        ));
        assert!(c.engine().is_none());
        assert_eq!(c.join().unwrap(), None);
    }
}
