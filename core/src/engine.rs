//! Monte Carlo localization engine.
//!
//! [`ParticleFilterEngine`] is a plain state machine: it knows nothing about threads, files or
//! presentation and only changes when one of its update calls is made. The caller is expected
//! to apply motion and sensor updates in timestamp order, which is what
//! [`crate::controller`] does with the frames of a [`crate::replay::FrameSource`].
//!
//! ```
//! use std::sync::Arc;
//! use orchard_pf::{Pose2, TreeObservation};
//! use orchard_pf::config::{ParticleFilterConfig, StartRegion};
//! use orchard_pf::engine::{ParticleFilterEngine, SensorUpdate, StartDistribution};
//! use orchard_pf::map::{MapTree, OrchardMap};
//!
//! let map = OrchardMap::new(vec![MapTree::new(2.0, 1.0), MapTree::new(2.0, -1.0)]).unwrap();
//! let mut engine = ParticleFilterEngine::new(Arc::new(map));
//! let config = ParticleFilterConfig { num_particles: 200, seed: Some(1), ..Default::default() };
//! let start = StartRegion::around(Pose2::new(0.0, 0.0, 0.0), 1.0, 1.0);
//! engine.reset(config, StartDistribution::Region(start)).unwrap();
//!
//! engine.motion_update(0.0, 0.0, 0.1, 6).unwrap();
//! let seen = [TreeObservation::new(2.0, 1.0, 0.1), TreeObservation::new(2.0, -1.0, 0.1)];
//! assert!(matches!(engine.sensor_update(&seen).unwrap(), SensorUpdate::Updated { .. }));
//! engine.resample_if_needed().unwrap();
//! assert!(engine.best_estimate().is_some());
//! ```
use crate::config::{ConvergenceMetric, ParticleFilterConfig, ResamplePolicy, StartRegion};
use crate::error::{LocalizationError, Result};
use crate::map::{OrchardMap, TreeIndex};
use crate::messages::{EngineSnapshot, OdomSample};
use crate::particle::{Particle, ParticleSet, max_pairwise_distance};
use crate::{Pose2, TreeObservation, wrap_angle};

use log::{debug, info};
use nalgebra::{Rotation2, Vector2};
use rand::prelude::*;
use rand::seq::index;
use rand_distr::Normal;
use std::f64::consts::PI;
use std::sync::Arc;

/// Below this yaw rate the arc model degenerates to straight-line integration.
const STRAIGHT_LINE_YAW_RATE: f64 = 1e-9;

/// Width residual charged to an unassociated observation, in standard deviations.
const UNASSOCIATED_WIDTH_SIGMAS: f64 = 3.0;

/// Where [`ParticleFilterEngine::reset`] draws the initial particles from.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StartDistribution {
    /// The region in the configuration's `start` field, or the whole map when it is unset.
    Configured,
    Region(StartRegion),
    /// Independent Gaussians around a pose.
    Gaussian {
        pose: Pose2,
        position_std: f64,
        heading_std: f64,
    },
    /// Uniform over the map bounds with uniform heading.
    WholeMap,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Ready,
}

/// Outcome of [`ParticleFilterEngine::sensor_update`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SensorUpdate {
    /// Weights were updated and normalized; `associated` counts observation/tree pairings over
    /// all particles.
    Updated { associated: usize },
    /// No particle could explain any observation, or the combined weights were not finite. The
    /// update was skipped and the posterior is unchanged.
    Degenerate,
    NoObservations,
}

impl SensorUpdate {
    pub fn is_updated(&self) -> bool {
        matches!(self, SensorUpdate::Updated { .. })
    }
}

/// Odometry aggregated over the interval between two image frames.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MotionIncrement {
    /// Time-weighted mean forward velocity, m/s.
    pub linear_velocity: f64,
    /// Time-weighted mean yaw rate, rad/s.
    pub angular_velocity: f64,
    pub elapsed_s: f64,
    pub num_readings: usize,
    /// Path length implied by the readings, metres.
    pub distance: f64,
}

/// Collects odometry samples between image frames.
///
/// Each sample's velocity is held over the interval since the previous sample (or since the
/// last image frame), and the last sample's velocity is held up to the image timestamp passed
/// to [`OdomAccumulator::take`].
#[derive(Clone, Debug, Default)]
pub struct OdomAccumulator {
    last_timestamp: Option<f64>,
    last_sample: Option<OdomSample>,
    linear_dt: f64,
    angular_dt: f64,
    elapsed: f64,
    distance: f64,
    readings: usize,
}

impl OdomAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sample: &OdomSample) {
        let dt = match self.last_timestamp {
            Some(t) if sample.timestamp > t => sample.timestamp - t,
            _ => 0.0,
        };
        self.hold(sample, dt);
        self.readings += 1;
        self.last_timestamp = Some(sample.timestamp);
        self.last_sample = Some(*sample);
    }

    fn hold(&mut self, sample: &OdomSample, dt: f64) {
        self.linear_dt += sample.linear_velocity * dt;
        self.angular_dt += sample.angular_velocity * dt;
        self.elapsed += dt;
        self.distance += sample.linear_velocity.abs() * dt;
    }

    pub fn pending_readings(&self) -> usize {
        self.readings
    }

    /// Close the interval at an image timestamp. Returns `None` when no odometry arrived since
    /// the previous image.
    pub fn take(&mut self, image_timestamp: f64) -> Option<MotionIncrement> {
        if self.readings > 0
            && let (Some(last), Some(t)) = (self.last_sample, self.last_timestamp)
            && image_timestamp > t
        {
            self.hold(&last, image_timestamp - t);
        }
        let increment = (self.readings > 0).then(|| {
            let (linear_velocity, angular_velocity) = if self.elapsed > 0.0 {
                (self.linear_dt / self.elapsed, self.angular_dt / self.elapsed)
            } else {
                self.last_sample
                    .map(|s| (s.linear_velocity, s.angular_velocity))
                    .unwrap_or((0.0, 0.0))
            };
            MotionIncrement {
                linear_velocity,
                angular_velocity,
                elapsed_s: self.elapsed,
                num_readings: self.readings,
                distance: self.distance,
            }
        });
        self.linear_dt = 0.0;
        self.angular_dt = 0.0;
        self.elapsed = 0.0;
        self.distance = 0.0;
        self.readings = 0;
        self.last_timestamp = Some(image_timestamp);
        increment
    }

    /// Forget everything, including the last timestamp anchor.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

pub struct ParticleFilterEngine {
    map: Arc<OrchardMap>,
    index: TreeIndex,
    config: ParticleFilterConfig,
    particles: ParticleSet,
    state: EngineState,
    rng: StdRng,
    seed: u64,
    /// Bumped by every mutation; keys the down-sampling RNG.
    generation: u64,
}

impl std::fmt::Debug for ParticleFilterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticleFilterEngine")
            .field("state", &self.state)
            .field("seed", &self.seed)
            .field("generation", &self.generation)
            .field("particles", &self.particles)
            .finish()
    }
}

impl ParticleFilterEngine {
    /// Create an uninitialized engine over a map. Call [`ParticleFilterEngine::reset`] before
    /// any update.
    pub fn new(map: Arc<OrchardMap>) -> Self {
        let config = ParticleFilterConfig::default();
        let index = TreeIndex::build(&map, config.bin_size);
        ParticleFilterEngine {
            map,
            index,
            config,
            particles: ParticleSet::default(),
            state: EngineState::Uninitialized,
            rng: StdRng::seed_from_u64(0),
            seed: 0,
            generation: 0,
        }
    }

    /// Replace the configuration and reseed the particle set.
    ///
    /// # Errors
    /// `Configuration` when the parameters fail validation. The engine is left untouched in
    /// that case.
    pub fn reset(&mut self, config: ParticleFilterConfig, start: StartDistribution) -> Result<()> {
        config.validate()?;
        let seed = config.seed.unwrap_or_else(rand::random);
        let mut rng = StdRng::seed_from_u64(seed);
        let start = match start {
            StartDistribution::Configured => config
                .start
                .map(StartDistribution::Region)
                .unwrap_or(StartDistribution::WholeMap),
            other => other,
        };
        let poses = sample_start(&self.map, &start, config.num_particles, &mut rng)?;
        if (self.index.bin_size() - config.bin_size).abs() > f64::EPSILON {
            self.index = TreeIndex::build(&self.map, config.bin_size);
        }
        info!(
            "Particle filter reset: {} particles, seed {}, start {:?}",
            config.num_particles, seed, start
        );
        self.particles = ParticleSet::from_poses(poses);
        self.config = config;
        self.rng = rng;
        self.seed = seed;
        self.generation = self.generation.wrapping_add(1);
        self.state = EngineState::Ready;
        Ok(())
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &ParticleFilterConfig {
        &self.config
    }

    pub fn map(&self) -> &Arc<OrchardMap> {
        &self.map
    }

    pub fn particles(&self) -> &ParticleSet {
        &self.particles
    }

    /// Seed used by the last reset.
    pub fn seed(&self) -> u64 {
        self.seed
    }

    fn ensure_ready(&self) -> Result<()> {
        match self.state {
            EngineState::Ready => Ok(()),
            EngineState::Uninitialized => Err(LocalizationError::Uninitialized),
        }
    }

    /// Propagate every particle with differential-drive kinematics.
    ///
    /// Each particle integrates its own noisy copy of the velocities over `elapsed_time`. The
    /// noise standard deviations shrink with `sqrt(num_readings)` since the velocities are
    /// averages. A zero or negative `elapsed_time` leaves the particles untouched.
    pub fn motion_update(
        &mut self,
        linear_velocity: f64,
        angular_velocity: f64,
        elapsed_time: f64,
        num_readings: usize,
    ) -> Result<()> {
        self.ensure_ready()?;
        if !(elapsed_time > 0.0) {
            if elapsed_time < 0.0 {
                debug!("Ignoring motion update with negative elapsed time {elapsed_time}");
            }
            return Ok(());
        }
        let scale = (num_readings.max(1) as f64).sqrt();
        let linear_noise = Normal::new(0.0, self.config.linear_noise_std / scale)
            .map_err(|e| LocalizationError::config(format!("linear noise: {e}")))?;
        let angular_noise = Normal::new(0.0, self.config.angular_noise_std / scale)
            .map_err(|e| LocalizationError::config(format!("angular noise: {e}")))?;
        for p in self.particles.iter_mut() {
            let v = linear_velocity + linear_noise.sample(&mut self.rng);
            let w = angular_velocity + angular_noise.sample(&mut self.rng);
            p.pose = integrate(&p.pose, v, w, elapsed_time);
        }
        self.generation = self.generation.wrapping_add(1);
        Ok(())
    }

    pub fn apply_motion(&mut self, increment: &MotionIncrement) -> Result<()> {
        self.motion_update(
            increment.linear_velocity,
            increment.angular_velocity,
            increment.elapsed_s,
            increment.num_readings,
        )
    }

    /// Reweight the particles by how well the map explains the observations.
    ///
    /// Each observation is moved into the map frame through the particle pose and paired with
    /// the nearest tree inside the gate. Paired observations score a Gaussian position residual
    /// (and width residual when enabled); unpaired ones score as if they sat on the gate.
    pub fn sensor_update(&mut self, observations: &[TreeObservation]) -> Result<SensorUpdate> {
        self.ensure_ready()?;
        if observations.is_empty() {
            return Ok(SensorUpdate::NoObservations);
        }
        let cfg = &self.config;
        let position_scale = 1.0 / (2.0 * cfg.position_sd * cfg.position_sd);
        let width_scale = 1.0 / (2.0 * cfg.width_sd * cfg.width_sd);
        let mut unassociated = -cfg.gate_distance * cfg.gate_distance * position_scale;
        if cfg.include_width {
            unassociated -= UNASSOCIATED_WIDTH_SIGMAS * UNASSOCIATED_WIDTH_SIGMAS * 0.5;
        }

        let mut associated = 0usize;
        let mut log_weights = Vec::with_capacity(self.particles.len());
        for p in self.particles.iter() {
            let mut log_likelihood = 0.0;
            for obs in observations {
                let world = p.pose.transform_point(&obs.offset());
                let class = if cfg.match_class { obs.class } else { None };
                match self
                    .index
                    .nearest_within(&self.map, &world, cfg.gate_distance, class)
                {
                    Some((tree, distance)) => {
                        associated += 1;
                        log_likelihood -= distance * distance * position_scale;
                        if cfg.include_width
                            && let Some(width) = tree.width
                        {
                            let dw = obs.width - width;
                            log_likelihood -= dw * dw * width_scale;
                        }
                    }
                    None => log_likelihood += unassociated,
                }
            }
            log_weights.push(p.weight.ln() + log_likelihood);
        }

        if associated == 0 {
            debug!(
                "Degenerate sensor update: none of {} observations fall inside the gate of any particle",
                observations.len()
            );
            return Ok(SensorUpdate::Degenerate);
        }
        let max_log = log_weights.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if !max_log.is_finite() {
            debug!("Degenerate sensor update: no finite log weight");
            return Ok(SensorUpdate::Degenerate);
        }
        let weights: Vec<f64> = log_weights.iter().map(|lw| (lw - max_log).exp()).collect();
        let sum: f64 = weights.iter().sum();
        if !(sum > 0.0 && sum.is_finite()) {
            debug!("Degenerate sensor update: weight sum {sum}");
            return Ok(SensorUpdate::Degenerate);
        }
        for (p, w) in self.particles.iter_mut().zip(weights) {
            p.weight = w / sum;
        }
        self.generation = self.generation.wrapping_add(1);
        Ok(SensorUpdate::Updated { associated })
    }

    /// Resample with the configured strategy; weights become uniform.
    pub fn resample(&mut self) -> Result<()> {
        self.ensure_ready()?;
        self.particles.normalize_weights();
        self.particles
            .resample(self.config.resampling_strategy, &mut self.rng);
        self.generation = self.generation.wrapping_add(1);
        Ok(())
    }

    /// Resample when the configured policy asks for it. Returns whether resampling happened.
    pub fn resample_if_needed(&mut self) -> Result<bool> {
        self.ensure_ready()?;
        let needed = match self.config.resample_policy {
            ResamplePolicy::Always => true,
            ResamplePolicy::EffectiveSampleSize { threshold } => {
                self.particles.effective_sample_size()
                    < threshold * self.particles.len() as f64
            }
        };
        if needed {
            self.resample()?;
        }
        Ok(needed)
    }

    pub fn effective_sample_size(&self) -> f64 {
        self.particles.effective_sample_size()
    }

    /// Single pose summarizing the posterior, `None` before the first reset.
    pub fn best_estimate(&self) -> Option<Pose2> {
        match self.state {
            EngineState::Ready => Some(self.particles.estimate(self.config.estimate_strategy)),
            EngineState::Uninitialized => None,
        }
    }

    /// Spread of the particle cloud in metres under the configured metric.
    pub fn spread(&self) -> Option<f64> {
        if self.state == EngineState::Uninitialized {
            return None;
        }
        let spread = match self.config.convergence_metric {
            ConvergenceMetric::Covariance => {
                let eigen = self.particles.position_covariance().symmetric_eigenvalues();
                eigen.max().max(0.0).sqrt()
            }
            ConvergenceMetric::MaxPairwiseDistance => {
                max_pairwise_distance(&self.downsample(self.config.convergence_sample_size))
            }
        };
        Some(spread)
    }

    /// True when the spread is under the convergence threshold.
    pub fn check_convergence(&self) -> bool {
        self.spread()
            .is_some_and(|s| s < self.config.convergence_threshold)
    }

    /// Up to `n` particles chosen at random, in set order. The choice only changes when the
    /// particles do, so repeated calls between updates return the same subset.
    pub fn downsample(&self, n: usize) -> Vec<Particle> {
        let len = self.particles.len();
        if n >= len {
            return self.particles.as_slice().to_vec();
        }
        let mut rng =
            StdRng::seed_from_u64(self.seed ^ self.generation.wrapping_mul(0x9E37_79B9_7F4A_7C15));
        let mut picked = index::sample(&mut rng, len, n).into_vec();
        picked.sort_unstable();
        let all = self.particles.as_slice();
        picked.into_iter().map(|i| all[i]).collect()
    }

    /// Owned copy of the state for presentation, `None` before the first reset.
    pub fn snapshot(&self, max_particles: usize) -> Option<EngineSnapshot> {
        let best_estimate = self.best_estimate()?;
        Some(EngineSnapshot {
            particles: self.downsample(max_particles),
            best_estimate,
            converged: self.check_convergence(),
            effective_sample_size: self.effective_sample_size(),
            position: None,
            backlog: None,
        })
    }
}

fn integrate(pose: &Pose2, v: f64, w: f64, dt: f64) -> Pose2 {
    let theta = pose.theta;
    if w.abs() < STRAIGHT_LINE_YAW_RATE {
        Pose2::new(
            pose.x + v * dt * theta.cos(),
            pose.y + v * dt * theta.sin(),
            theta + w * dt,
        )
    } else {
        let r = v / w;
        let next = theta + w * dt;
        Pose2::new(
            pose.x + r * (next.sin() - theta.sin()),
            pose.y + r * (theta.cos() - next.cos()),
            next,
        )
    }
}

fn sample_start(
    map: &OrchardMap,
    start: &StartDistribution,
    count: usize,
    rng: &mut StdRng,
) -> Result<Vec<Pose2>> {
    let poses = match *start {
        StartDistribution::Region(region) => {
            let rotation = Rotation2::new(region.rotation);
            let center = Vector2::new(region.center_x, region.center_y);
            (0..count)
                .map(|i| {
                    let offset = Vector2::new(
                        (rng.random::<f64>() - 0.5) * region.width,
                        (rng.random::<f64>() - 0.5) * region.height,
                    );
                    let p = center + rotation * offset;
                    let mut theta = region.orientation_center
                        + (rng.random::<f64>() - 0.5) * region.orientation_range;
                    if region.both_directions && i % 2 == 1 {
                        theta += PI;
                    }
                    Pose2::new(p.x, p.y, theta)
                })
                .collect()
        }
        StartDistribution::Gaussian {
            pose,
            position_std,
            heading_std,
        } => {
            let position = Normal::new(0.0, position_std)
                .map_err(|e| LocalizationError::config(format!("start position std: {e}")))?;
            let heading = Normal::new(0.0, heading_std)
                .map_err(|e| LocalizationError::config(format!("start heading std: {e}")))?;
            (0..count)
                .map(|_| {
                    Pose2::new(
                        pose.x + position.sample(rng),
                        pose.y + position.sample(rng),
                        pose.theta + heading.sample(rng),
                    )
                })
                .collect()
        }
        StartDistribution::WholeMap | StartDistribution::Configured => {
            let b = map.bounds();
            (0..count)
                .map(|_| {
                    Pose2::new(
                        b.min_x + rng.random::<f64>() * (b.max_x - b.min_x),
                        b.min_y + rng.random::<f64>() * (b.max_y - b.min_y),
                        rng.random_range(-PI..PI),
                    )
                })
                .collect()
        }
    };
    Ok(poses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EstimateStrategy;
    use crate::map::MapTree;
    use assert_approx_eq::assert_approx_eq;

    fn grid_map() -> Arc<OrchardMap> {
        let mut trees = Vec::new();
        for row in 0..4 {
            for col in 0..10 {
                trees.push(MapTree::new(col as f64 * 2.0, row as f64 * 4.0));
            }
        }
        Arc::new(OrchardMap::new(trees).unwrap())
    }

    fn quiet_config(num_particles: usize) -> ParticleFilterConfig {
        ParticleFilterConfig {
            num_particles,
            linear_noise_std: 0.0,
            angular_noise_std: 0.0,
            seed: Some(7),
            ..ParticleFilterConfig::default()
        }
    }

    fn ready_engine(config: ParticleFilterConfig, start: Pose2) -> ParticleFilterEngine {
        let mut engine = ParticleFilterEngine::new(grid_map());
        engine
            .reset(config, StartDistribution::Region(StartRegion::around(start, 1.0, 1.0)))
            .unwrap();
        engine
    }

    #[test]
    fn updates_before_reset_fail() {
        let mut engine = ParticleFilterEngine::new(grid_map());
        assert_eq!(engine.state(), EngineState::Uninitialized);
        assert!(matches!(
            engine.motion_update(1.0, 0.0, 0.1, 1),
            Err(LocalizationError::Uninitialized)
        ));
        assert!(matches!(
            engine.sensor_update(&[TreeObservation::new(1.0, 0.0, 0.1)]),
            Err(LocalizationError::Uninitialized)
        ));
        assert!(engine.best_estimate().is_none());
        assert!(!engine.check_convergence());
    }

    #[test]
    fn invalid_reset_keeps_previous_state() {
        let mut engine = ready_engine(quiet_config(50), Pose2::new(5.0, 2.0, 0.0));
        let before = engine.particles().clone();
        let bad = ParticleFilterConfig {
            num_particles: 0,
            ..ParticleFilterConfig::default()
        };
        assert!(engine.reset(bad, StartDistribution::WholeMap).is_err());
        assert_eq!(engine.particles(), &before);
        assert_eq!(engine.state(), EngineState::Ready);
    }

    #[test]
    fn reset_fills_capacity_inside_region() {
        let engine = ready_engine(quiet_config(300), Pose2::new(5.0, 2.0, 0.0));
        assert_eq!(engine.particles().len(), 300);
        assert_approx_eq!(engine.particles().weight_sum(), 1.0, 1e-9);
        assert!(engine.particles().iter().all(|p| (p.pose.x - 5.0).abs() <= 0.5
            && (p.pose.y - 2.0).abs() <= 0.5));
    }

    #[test]
    fn both_directions_flips_every_other_particle() {
        let mut engine = ParticleFilterEngine::new(grid_map());
        let region = StartRegion {
            orientation_range: 0.0,
            both_directions: true,
            ..StartRegion::around(Pose2::new(5.0, 2.0, 0.0), 1.0, 1.0)
        };
        engine
            .reset(quiet_config(10), StartDistribution::Region(region))
            .unwrap();
        let flipped = engine
            .particles()
            .iter()
            .filter(|p| (p.pose.theta.abs() - PI).abs() < 1e-9)
            .count();
        assert_eq!(flipped, 5);
    }

    #[test]
    fn whole_map_prior_covers_bounds() {
        let mut engine = ParticleFilterEngine::new(grid_map());
        engine
            .reset(quiet_config(500), StartDistribution::Configured)
            .unwrap();
        assert!(engine.particles().iter().all(|p| (0.0..=18.0).contains(&p.pose.x)
            && (0.0..=12.0).contains(&p.pose.y)));
        assert!(!engine.check_convergence());
    }

    /// Zero elapsed time leaves every pose untouched, noise or not.
    #[test]
    fn zero_elapsed_time_is_identity() {
        let config = ParticleFilterConfig {
            linear_noise_std: 0.5,
            angular_noise_std: 0.5,
            ..quiet_config(100)
        };
        let mut engine = ready_engine(config, Pose2::new(5.0, 2.0, 0.3));
        let before = engine.particles().clone();
        engine.motion_update(1.5, 0.4, 0.0, 3).unwrap();
        assert_eq!(engine.particles(), &before);
    }

    #[test]
    fn straight_and_arc_motion_without_noise() {
        let mut engine = ParticleFilterEngine::new(grid_map());
        engine
            .reset(
                quiet_config(4),
                StartDistribution::Gaussian {
                    pose: Pose2::new(1.0, 1.0, 0.0),
                    position_std: 0.0,
                    heading_std: 0.0,
                },
            )
            .unwrap();
        engine.motion_update(2.0, 0.0, 0.5, 1).unwrap();
        for p in engine.particles().iter() {
            assert_approx_eq!(p.pose.x, 2.0, 1e-12);
            assert_approx_eq!(p.pose.y, 1.0, 1e-12);
        }
        // Quarter circle of radius 1 to the left.
        engine.motion_update(PI / 2.0, PI / 2.0, 1.0, 1).unwrap();
        for p in engine.particles().iter() {
            assert_approx_eq!(p.pose.x, 3.0, 1e-9);
            assert_approx_eq!(p.pose.y, 2.0, 1e-9);
            assert_approx_eq!(p.pose.theta, PI / 2.0, 1e-9);
        }
    }

    #[test]
    fn sensor_update_normalizes_and_prefers_true_pose() {
        let truth = Pose2::new(5.0, 2.0, 0.0);
        let mut engine = ready_engine(quiet_config(400), truth);
        // Trees at (6, 0) and (6, 4) seen from the true pose.
        let obs = [
            TreeObservation::new(1.0, -2.0, 0.1),
            TreeObservation::new(1.0, 2.0, 0.1),
        ];
        let outcome = engine.sensor_update(&obs).unwrap();
        assert!(outcome.is_updated());
        assert_approx_eq!(engine.particles().weight_sum(), 1.0, 1e-9);
        let best = engine
            .particles()
            .iter()
            .max_by(|a, b| a.weight.total_cmp(&b.weight))
            .unwrap();
        assert!(best.pose.distance_to(&truth) < 0.3);
    }

    #[test]
    fn far_observations_are_degenerate() {
        let mut engine = ready_engine(quiet_config(50), Pose2::new(500.0, 500.0, 0.0));
        let before = engine.particles().clone();
        let outcome = engine
            .sensor_update(&[TreeObservation::new(1.0, 0.0, 0.1)])
            .unwrap();
        assert_eq!(outcome, SensorUpdate::Degenerate);
        assert_eq!(engine.particles(), &before);
        assert_eq!(
            engine.sensor_update(&[]).unwrap(),
            SensorUpdate::NoObservations
        );
    }

    #[test]
    fn resample_policy_thresholds() {
        let config = ParticleFilterConfig {
            resample_policy: ResamplePolicy::EffectiveSampleSize { threshold: 0.5 },
            ..quiet_config(100)
        };
        let mut engine = ready_engine(config.clone(), Pose2::new(5.0, 2.0, 0.0));
        assert!(!engine.resample_if_needed().unwrap());

        let always = ParticleFilterConfig {
            resample_policy: ResamplePolicy::Always,
            ..config
        };
        let mut engine = ready_engine(always, Pose2::new(5.0, 2.0, 0.0));
        assert!(engine.resample_if_needed().unwrap());
        assert_eq!(engine.particles().len(), 100);
        assert_approx_eq!(engine.particles().weight_sum(), 1.0, 1e-9);
    }

    #[test]
    fn estimate_and_downsample_are_idempotent() {
        let mut engine = ready_engine(quiet_config(300), Pose2::new(5.0, 2.0, 0.2));
        engine
            .sensor_update(&[TreeObservation::new(1.0, -2.0, 0.1)])
            .unwrap();
        assert_eq!(engine.best_estimate(), engine.best_estimate());
        let a = engine.downsample(40);
        let b = engine.downsample(40);
        assert_eq!(a.len(), 40);
        assert_eq!(a, b);
        assert_eq!(engine.downsample(1000).len(), 300);
    }

    #[test]
    fn highest_weight_strategy_returns_a_particle() {
        let config = ParticleFilterConfig {
            estimate_strategy: EstimateStrategy::HighestWeight,
            ..quiet_config(50)
        };
        let engine = ready_engine(config, Pose2::new(5.0, 2.0, 0.0));
        let best = engine.best_estimate().unwrap();
        assert!(engine.particles().iter().any(|p| p.pose == best));
    }

    #[test]
    fn tight_cloud_converges_under_both_metrics() {
        for metric in [
            ConvergenceMetric::Covariance,
            ConvergenceMetric::MaxPairwiseDistance,
        ] {
            let config = ParticleFilterConfig {
                convergence_metric: metric,
                convergence_threshold: 0.5,
                ..quiet_config(200)
            };
            let mut engine = ParticleFilterEngine::new(grid_map());
            engine
                .reset(
                    config,
                    StartDistribution::Region(StartRegion::around(Pose2::new(5.0, 2.0, 0.0), 0.2, 0.2)),
                )
                .unwrap();
            assert!(engine.check_convergence(), "{metric:?}");
        }
    }

    #[test]
    fn accumulator_holds_velocity_until_image() {
        let mut acc = OdomAccumulator::new();
        assert!(acc.take(1.0).is_none());
        acc.push(&OdomSample::new(1.0, 0.0, 1.25));
        acc.push(&OdomSample::new(3.0, 0.2, 1.5));
        let inc = acc.take(2.0).unwrap();
        assert_eq!(inc.num_readings, 2);
        assert_approx_eq!(inc.elapsed_s, 1.0, 1e-12);
        // 0.25 s at 1 m/s, then 0.75 s at 3 m/s.
        assert_approx_eq!(inc.distance, 2.5, 1e-12);
        assert_approx_eq!(inc.linear_velocity, 2.5, 1e-12);
        assert_approx_eq!(inc.angular_velocity, 0.15, 1e-12);
        assert!(acc.take(3.0).is_none());
    }
}
