//! Particles, the fixed-capacity particle set and the resampling strategies.
use crate::Pose2;
use crate::config::EstimateStrategy;

use nalgebra::{Matrix2, Vector2};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Debug, Display};

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Particle {
    pub pose: Pose2,
    pub weight: f64,
}

impl Particle {
    pub fn new(pose: Pose2, weight: f64) -> Particle {
        Particle { pose, weight }
    }
}

impl Display for Particle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Particle")
            .field("x", &self.pose.x)
            .field("y", &self.pose.y)
            .field("theta_deg", &self.pose.theta.to_degrees())
            .field("weight", &self.weight)
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResamplingStrategy {
    /// Low-variance resampling: one uniform draw, `n` evenly spaced pointers.
    #[default]
    Systematic,
    Multinomial,
    Residual,
}

impl ResamplingStrategy {
    /// Draw `particles.len()` particles in proportion to their weights. The returned particles
    /// all carry weight `1 / n`. Weights must already be normalized.
    pub fn resample<R: Rng + ?Sized>(&self, particles: &[Particle], rng: &mut R) -> Vec<Particle> {
        if particles.is_empty() {
            return Vec::new();
        }
        match self {
            ResamplingStrategy::Systematic => systematic_resample(particles, rng),
            ResamplingStrategy::Multinomial => multinomial_resample(particles, rng),
            ResamplingStrategy::Residual => residual_resample(particles, rng),
        }
    }
}

/// Walk the cumulative weights with sorted pointers and copy the particle each pointer lands
/// in. `positions` must be ascending and lie in `[0, total)`.
fn select_by_positions(particles: &[Particle], positions: &[f64]) -> Vec<Particle> {
    let n = particles.len();
    let uniform = 1.0 / n as f64;
    let mut selected = Vec::with_capacity(positions.len());
    let mut i = 0;
    let mut cumsum = particles[0].weight;
    for &u in positions {
        while u >= cumsum && i < n - 1 {
            i += 1;
            cumsum += particles[i].weight;
        }
        selected.push(Particle::new(particles[i].pose, uniform));
    }
    selected
}

pub fn systematic_resample<R: Rng + ?Sized>(particles: &[Particle], rng: &mut R) -> Vec<Particle> {
    let n = particles.len();
    let step = 1.0 / n as f64;
    let start = rng.random::<f64>() * step;
    let positions: Vec<f64> = (0..n).map(|k| start + k as f64 * step).collect();
    select_by_positions(particles, &positions)
}

pub fn multinomial_resample<R: Rng + ?Sized>(particles: &[Particle], rng: &mut R) -> Vec<Particle> {
    let n = particles.len();
    let mut positions: Vec<f64> = (0..n).map(|_| rng.random::<f64>()).collect();
    positions.sort_by(|a, b| a.total_cmp(b));
    select_by_positions(particles, &positions)
}

/// Deterministic copies for the integer part of `n * w`, then systematic draws over the
/// fractional remainders.
pub fn residual_resample<R: Rng + ?Sized>(particles: &[Particle], rng: &mut R) -> Vec<Particle> {
    let n = particles.len();
    let uniform = 1.0 / n as f64;
    let mut new_particles = Vec::<Particle>::with_capacity(n);
    let mut residual: Vec<f64> = vec![0.0; n];
    for (i, p) in particles.iter().enumerate() {
        let copies = (p.weight * n as f64).floor() as usize;
        residual[i] = p.weight * n as f64 - copies as f64;
        for _ in 0..copies.min(n - new_particles.len()) {
            new_particles.push(Particle::new(p.pose, uniform));
        }
    }
    let residual_particles = n - new_particles.len();
    if residual_particles > 0 {
        let sum_residual: f64 = residual.iter().sum();
        if sum_residual <= 0.0 {
            // Rounding left no remainder mass; top up from the heaviest particles.
            let mut order: Vec<usize> = (0..n).collect();
            order.sort_by(|&a, &b| particles[b].weight.total_cmp(&particles[a].weight));
            for &i in order.iter().cycle().take(residual_particles) {
                new_particles.push(Particle::new(particles[i].pose, uniform));
            }
            return new_particles;
        }
        let remainder: Vec<Particle> = particles
            .iter()
            .zip(&residual)
            .map(|(p, r)| Particle::new(p.pose, r / sum_residual))
            .collect();
        let step = 1.0 / residual_particles as f64;
        let start = rng.random::<f64>() * step;
        let positions: Vec<f64> = (0..residual_particles)
            .map(|k| start + k as f64 * step)
            .collect();
        new_particles.extend(select_by_positions(&remainder, &positions));
    }
    new_particles
}

/// The filter's posterior: an insertion-ordered set of weighted poses with a fixed capacity.
#[derive(Clone, Default, PartialEq)]
pub struct ParticleSet {
    particles: Vec<Particle>,
}

impl Debug for ParticleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let min_weight = self
            .particles
            .iter()
            .map(|p| p.weight)
            .fold(f64::INFINITY, f64::min);
        let max_weight = self.particles.iter().map(|p| p.weight).fold(0.0, f64::max);
        f.debug_struct("ParticleSet")
            .field("num_particles", &self.particles.len())
            .field("effective_particles", &self.effective_sample_size())
            .field(
                "weight_range",
                &format_args!("[{:.4e}, {:.4e}]", min_weight, max_weight),
            )
            .field("mean", &format_args!("{}", self.weighted_mean()))
            .finish()
    }
}

impl ParticleSet {
    /// Build a set from poses with uniform weights.
    pub fn from_poses(poses: impl IntoIterator<Item = Pose2>) -> Self {
        let mut particles: Vec<Particle> = poses.into_iter().map(|p| Particle::new(p, 0.0)).collect();
        let uniform = 1.0 / particles.len().max(1) as f64;
        for p in &mut particles {
            p.weight = uniform;
        }
        ParticleSet { particles }
    }

    pub fn len(&self) -> usize {
        self.particles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.particles.is_empty()
    }

    pub fn as_slice(&self) -> &[Particle] {
        &self.particles
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Particle> {
        self.particles.iter()
    }

    pub(crate) fn iter_mut(&mut self) -> std::slice::IterMut<'_, Particle> {
        self.particles.iter_mut()
    }

    pub fn weight_sum(&self) -> f64 {
        self.particles.iter().map(|p| p.weight).sum()
    }

    /// Scale weights to sum to one. Falls back to uniform weights when the sum is zero or not
    /// finite.
    pub fn normalize_weights(&mut self) {
        let sum = self.weight_sum();
        if sum > 0.0 && sum.is_finite() {
            for p in &mut self.particles {
                p.weight /= sum;
            }
        } else {
            self.set_uniform_weights();
        }
    }

    pub fn set_uniform_weights(&mut self) {
        let uniform = 1.0 / self.particles.len().max(1) as f64;
        for p in &mut self.particles {
            p.weight = uniform;
        }
    }

    /// `1 / sum(w^2)` for normalized weights.
    pub fn effective_sample_size(&self) -> f64 {
        let sum_sq: f64 = self.particles.iter().map(|p| p.weight * p.weight).sum();
        if sum_sq > 0.0 { 1.0 / sum_sq } else { 0.0 }
    }

    /// Replace the population with a resampled one of the same size.
    pub fn resample<R: Rng + ?Sized>(&mut self, strategy: ResamplingStrategy, rng: &mut R) {
        let capacity = self.particles.len();
        let resampled = strategy.resample(&self.particles, rng);
        debug_assert_eq!(resampled.len(), capacity);
        self.particles = resampled;
    }

    pub fn estimate(&self, strategy: EstimateStrategy) -> Pose2 {
        match strategy {
            EstimateStrategy::WeightedAverage => self.weighted_mean(),
            EstimateStrategy::HighestWeight => self.highest_weight(),
        }
    }

    /// Weighted mean position with a circular mean heading.
    pub fn weighted_mean(&self) -> Pose2 {
        let sum = self.weight_sum();
        if self.particles.is_empty() || !(sum > 0.0) {
            return Pose2::default();
        }
        let (mut x, mut y, mut s, mut c) = (0.0, 0.0, 0.0, 0.0);
        for p in &self.particles {
            x += p.weight * p.pose.x;
            y += p.weight * p.pose.y;
            s += p.weight * p.pose.theta.sin();
            c += p.weight * p.pose.theta.cos();
        }
        Pose2::new(x / sum, y / sum, s.atan2(c))
    }

    pub fn highest_weight(&self) -> Pose2 {
        self.particles
            .iter()
            .max_by(|a, b| a.weight.total_cmp(&b.weight))
            .map(|p| p.pose)
            .unwrap_or_default()
    }

    /// Weighted 2x2 covariance of the particle positions.
    pub fn position_covariance(&self) -> Matrix2<f64> {
        let sum = self.weight_sum();
        if self.particles.is_empty() || !(sum > 0.0) {
            return Matrix2::zeros();
        }
        let mean = self
            .particles
            .iter()
            .fold(Vector2::zeros(), |acc, p| acc + p.pose.position() * p.weight)
            / sum;
        self.particles.iter().fold(Matrix2::zeros(), |acc, p| {
            let d = p.pose.position() - mean;
            acc + d * d.transpose() * p.weight
        }) / sum
    }
}

/// Largest distance between any two of the given particles.
pub fn max_pairwise_distance(particles: &[Particle]) -> f64 {
    let mut max_sq: f64 = 0.0;
    for (i, a) in particles.iter().enumerate() {
        for b in &particles[i + 1..] {
            max_sq = max_sq.max((a.pose.position() - b.pose.position()).norm_squared());
        }
    }
    max_sq.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_approx_eq::assert_approx_eq;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn skewed_set() -> ParticleSet {
        let mut set = ParticleSet::from_poses((0..10).map(|i| Pose2::new(i as f64, 0.0, 0.0)));
        for (i, p) in set.iter_mut().enumerate() {
            p.weight = if i == 3 { 10.0 } else { 1.0 };
        }
        set.normalize_weights();
        set
    }

    /// Every strategy keeps the particle count and leaves uniform weights that sum to one.
    #[test]
    fn resampling_preserves_count_and_weight_sum() {
        let mut rng = StdRng::seed_from_u64(11);
        for strategy in [
            ResamplingStrategy::Systematic,
            ResamplingStrategy::Multinomial,
            ResamplingStrategy::Residual,
        ] {
            let mut set = skewed_set();
            set.resample(strategy, &mut rng);
            assert_eq!(set.len(), 10, "{strategy:?}");
            assert_approx_eq!(set.weight_sum(), 1.0, 1e-12);
            assert!(set.iter().all(|p| (p.weight - 0.1).abs() < 1e-12));
        }
    }

    /// The heavy particle holds more than half of the mass, so systematic resampling must copy
    /// it at least five times.
    #[test]
    fn systematic_resampling_favours_heavy_particle() {
        let mut rng = StdRng::seed_from_u64(3);
        let set = skewed_set();
        let resampled = systematic_resample(set.as_slice(), &mut rng);
        let copies = resampled.iter().filter(|p| p.pose.x == 3.0).count();
        assert!(copies >= 5, "copies = {copies}");
    }

    #[test]
    fn residual_resampling_copies_integer_parts() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut set = ParticleSet::from_poses((0..4).map(|i| Pose2::new(i as f64, 0.0, 0.0)));
        for (p, w) in set.iter_mut().zip([0.5, 0.25, 0.25, 0.0]) {
            p.weight = w;
        }
        let resampled = residual_resample(set.as_slice(), &mut rng);
        let xs: Vec<f64> = resampled.iter().map(|p| p.pose.x).collect();
        assert_eq!(xs, vec![0.0, 0.0, 1.0, 2.0]);
    }

    #[test]
    fn effective_sample_size_bounds() {
        let uniform = ParticleSet::from_poses((0..8).map(|_| Pose2::default()));
        assert_approx_eq!(uniform.effective_sample_size(), 8.0, 1e-9);

        let mut single = uniform.clone();
        for (i, p) in single.iter_mut().enumerate() {
            p.weight = if i == 0 { 1.0 } else { 0.0 };
        }
        assert_approx_eq!(single.effective_sample_size(), 1.0, 1e-12);
    }

    #[test]
    fn normalize_falls_back_to_uniform() {
        let mut set = ParticleSet::from_poses((0..4).map(|_| Pose2::default()));
        for p in set.iter_mut() {
            p.weight = 0.0;
        }
        set.normalize_weights();
        assert!(set.iter().all(|p| (p.weight - 0.25).abs() < 1e-12));
    }

    /// Headings either side of +/-pi average to pi rather than zero.
    #[test]
    fn weighted_mean_uses_circular_heading() {
        let set = ParticleSet::from_poses([
            Pose2::new(0.0, 0.0, 179f64.to_radians()),
            Pose2::new(2.0, 4.0, -179f64.to_radians()),
        ]);
        let mean = set.weighted_mean();
        assert_approx_eq!(mean.x, 1.0, 1e-12);
        assert_approx_eq!(mean.y, 2.0, 1e-12);
        assert_approx_eq!(mean.theta.abs(), std::f64::consts::PI, 1e-9);
    }

    #[test]
    fn covariance_and_pairwise_spread() {
        let set = ParticleSet::from_poses([Pose2::new(-1.0, 0.0, 0.0), Pose2::new(1.0, 0.0, 0.0)]);
        let cov = set.position_covariance();
        assert_approx_eq!(cov[(0, 0)], 1.0, 1e-12);
        assert_approx_eq!(cov[(1, 1)], 0.0, 1e-12);
        assert_approx_eq!(max_pairwise_distance(set.as_slice()), 2.0, 1e-12);
        assert_eq!(set.highest_weight(), Pose2::new(1.0, 0.0, 0.0));
    }
}
