//! Configuration for the filter, the execution controller and the trial harness.
//!
//! Every section derives `serde` with field defaults, so a configuration file only needs the
//! keys it wants to change. [`AppConfig`] is read and written as TOML, JSON or YAML depending on
//! the file extension.
//!
//! ```
//! use orchard_pf::config::{AppConfig, ResamplePolicy};
//!
//! let config: AppConfig = toml::from_str(
//!     r#"
//!     [filter]
//!     num_particles = 2000
//!     resample_policy = { kind = "always" }
//!     "#,
//! )
//! .unwrap();
//! assert_eq!(config.filter.num_particles, 2000);
//! assert_eq!(config.filter.resample_policy, ResamplePolicy::Always);
//! ```
use crate::Pose2;
use crate::error::{LocalizationError, Result};
use crate::particle::ResamplingStrategy;

use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// When the engine resamples after a successful sensor update.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResamplePolicy {
    /// Resample after every non-degenerate sensor update.
    Always,
    /// Resample when the effective sample size falls below `threshold * num_particles`.
    EffectiveSampleSize { threshold: f64 },
}

impl Default for ResamplePolicy {
    fn default() -> Self {
        ResamplePolicy::EffectiveSampleSize { threshold: 0.5 }
    }
}

/// How the single best pose is extracted from the particle set.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimateStrategy {
    /// Weighted mean position with a circular mean for the heading.
    #[default]
    WeightedAverage,
    HighestWeight,
}

/// Spread measure compared against the convergence threshold.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConvergenceMetric {
    /// Square root of the largest eigenvalue of the weighted position covariance.
    #[default]
    Covariance,
    /// Largest distance between any two particles of a down-sampled subset.
    MaxPairwiseDistance,
}

/// A rotated rectangle of start positions with a band of start headings.
///
/// Positions are drawn uniformly inside the rectangle, headings uniformly within
/// `orientation_center +/- orientation_range / 2`. With `both_directions`, half of the particles
/// are flipped by pi so the filter can start without knowing which way the robot faces along a
/// row.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StartRegion {
    pub center_x: f64,
    pub center_y: f64,
    pub width: f64,
    pub height: f64,
    /// Rotation of the rectangle about its centre, radians.
    pub rotation: f64,
    pub orientation_center: f64,
    pub orientation_range: f64,
    pub both_directions: bool,
}

impl Default for StartRegion {
    fn default() -> Self {
        StartRegion {
            center_x: 0.0,
            center_y: 0.0,
            width: 2.0,
            height: 2.0,
            rotation: 0.0,
            orientation_center: 0.0,
            orientation_range: 20f64.to_radians(),
            both_directions: false,
        }
    }
}

impl StartRegion {
    /// A `width` x `height` rectangle centred on `pose`, facing the pose heading.
    pub fn around(pose: Pose2, width: f64, height: f64) -> Self {
        StartRegion {
            center_x: pose.x,
            center_y: pose.y,
            width,
            height,
            orientation_center: pose.theta,
            ..StartRegion::default()
        }
    }

    pub fn center(&self) -> Pose2 {
        Pose2::new(self.center_x, self.center_y, self.orientation_center)
    }

    fn validate(&self) -> Result<()> {
        let finite = [
            self.center_x,
            self.center_y,
            self.width,
            self.height,
            self.rotation,
            self.orientation_center,
            self.orientation_range,
        ]
        .iter()
        .all(|v| v.is_finite());
        if !finite {
            return Err(LocalizationError::config("start region contains a non-finite value"));
        }
        if self.width < 0.0 || self.height < 0.0 || self.orientation_range < 0.0 {
            return Err(LocalizationError::config(
                "start region width, height and orientation range must be non-negative",
            ));
        }
        Ok(())
    }
}

/// Particle filter parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParticleFilterConfig {
    /// Fixed particle set capacity.
    pub num_particles: usize,
    /// Linear velocity noise standard deviation for a single odometry reading, m/s.
    pub linear_noise_std: f64,
    /// Angular velocity noise standard deviation for a single odometry reading, rad/s.
    pub angular_noise_std: f64,
    /// Association gate: observations farther than this from every map tree are unassociated.
    pub gate_distance: f64,
    /// Standard deviation of the position residual, metres.
    pub position_sd: f64,
    /// Standard deviation of the trunk width residual, metres.
    pub width_sd: f64,
    pub include_width: bool,
    /// Only associate observations with map trees of the same class.
    pub match_class: bool,
    /// Cell size of the map's spatial index, metres.
    pub bin_size: f64,
    pub resampling_strategy: ResamplingStrategy,
    pub estimate_strategy: EstimateStrategy,
    pub convergence_metric: ConvergenceMetric,
    /// Spread below which the filter counts as converged, metres.
    pub convergence_threshold: f64,
    /// Subset size used for down-sampled spread checks and snapshots.
    pub convergence_sample_size: usize,
    /// Fixed seed for reproducible runs; drawn from the OS when unset.
    pub seed: Option<u64>,
    pub resample_policy: ResamplePolicy,
    /// Start region used by [`crate::engine::StartDistribution::Configured`]; `None` spreads
    /// the particles over the whole map.
    pub start: Option<StartRegion>,
}

impl Default for ParticleFilterConfig {
    fn default() -> Self {
        ParticleFilterConfig {
            num_particles: 1000,
            linear_noise_std: 0.1,
            angular_noise_std: 0.05,
            gate_distance: 1.0,
            position_sd: 0.2,
            width_sd: 0.05,
            include_width: false,
            match_class: false,
            bin_size: 1.0,
            resampling_strategy: ResamplingStrategy::default(),
            estimate_strategy: EstimateStrategy::default(),
            convergence_metric: ConvergenceMetric::default(),
            convergence_threshold: 0.5,
            convergence_sample_size: 200,
            seed: None,
            resample_policy: ResamplePolicy::default(),
            start: None,
        }
    }
}

impl ParticleFilterConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_particles == 0 {
            return Err(LocalizationError::config("num_particles must be at least 1"));
        }
        for (name, value) in [
            ("linear_noise_std", self.linear_noise_std),
            ("angular_noise_std", self.angular_noise_std),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(LocalizationError::config(format!(
                    "{name} must be finite and non-negative, got {value}"
                )));
            }
        }
        for (name, value) in [
            ("gate_distance", self.gate_distance),
            ("position_sd", self.position_sd),
            ("width_sd", self.width_sd),
            ("bin_size", self.bin_size),
            ("convergence_threshold", self.convergence_threshold),
        ] {
            if !value.is_finite() || value <= 0.0 {
                return Err(LocalizationError::config(format!(
                    "{name} must be finite and positive, got {value}"
                )));
            }
        }
        if let ResamplePolicy::EffectiveSampleSize { threshold } = self.resample_policy
            && !(threshold > 0.0 && threshold <= 1.0)
        {
            return Err(LocalizationError::config(format!(
                "effective sample size threshold must be in (0, 1], got {threshold}"
            )));
        }
        if self.convergence_sample_size < 2 {
            return Err(LocalizationError::config(
                "convergence_sample_size must be at least 2",
            ));
        }
        if let Some(region) = &self.start {
            region.validate()?;
        }
        Ok(())
    }
}

/// Playback options for [`crate::controller::ExecutionController`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Halt a continuous run as soon as the filter converges.
    pub stop_on_convergence: bool,
    /// Move on to the next queued frame source when the current one is exhausted.
    pub chain_sources: bool,
    /// Particles copied into each snapshot event.
    pub snapshot_particles: usize,
    /// Pause after each image frame, milliseconds.
    pub playback_delay_ms: u64,
    /// Longest a live source blocks waiting for sensor data, milliseconds.
    pub live_poll_timeout_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        ControllerConfig {
            stop_on_convergence: false,
            chain_sources: true,
            snapshot_particles: 500,
            playback_delay_ms: 0,
            live_poll_timeout_ms: 100,
        }
    }
}

/// Batch trial settings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrialConfig {
    pub manifest_path: PathBuf,
    /// Directory holding one cached log per data-source identifier.
    pub data_dir: PathBuf,
    pub results_path: PathBuf,
    pub summary_path: Option<PathBuf>,
    /// Repetitions per test case unless the manifest row overrides it.
    pub num_trials: usize,
    /// Image frames a trial may consume before it times out.
    pub max_steps: usize,
    /// Simulated seconds a trial may run before it times out.
    pub timeout_s: Option<f64>,
    /// Final position error under which a converged trial counts as correct, metres.
    pub accuracy_threshold: f64,
    pub base_seed: u64,
    /// Start region size and heading band for manifest rows that do not carry their own.
    pub start_width: f64,
    pub start_length: f64,
    pub orientation_range: f64,
}

impl Default for TrialConfig {
    fn default() -> Self {
        TrialConfig {
            manifest_path: PathBuf::from("tests.csv"),
            data_dir: PathBuf::from("data"),
            results_path: PathBuf::from("results.csv"),
            summary_path: None,
            num_trials: 10,
            max_steps: 2000,
            timeout_s: None,
            accuracy_threshold: 0.5,
            base_seed: 42,
            start_width: 4.0,
            start_length: 4.0,
            orientation_range: 30f64.to_radians(),
        }
    }
}

impl TrialConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_trials == 0 {
            return Err(LocalizationError::config("num_trials must be at least 1"));
        }
        if self.max_steps == 0 {
            return Err(LocalizationError::config("max_steps must be at least 1"));
        }
        if let Some(t) = self.timeout_s
            && !(t.is_finite() && t > 0.0)
        {
            return Err(LocalizationError::config(format!(
                "timeout_s must be finite and positive, got {t}"
            )));
        }
        if !(self.accuracy_threshold.is_finite() && self.accuracy_threshold > 0.0) {
            return Err(LocalizationError::config(
                "accuracy_threshold must be finite and positive",
            ));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapConfig {
    pub path: Option<PathBuf>,
    /// Shift the map so its minimum corner sits at `(origin_offset, origin_offset)`.
    pub move_origin: bool,
    pub origin_offset: f64,
}

impl Default for MapConfig {
    fn default() -> Self {
        MapConfig {
            path: None,
            move_origin: true,
            origin_offset: 5.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// `class_mapping[raw]` is the class reported for detector label `raw`.
    pub class_mapping: Vec<u8>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        DetectorConfig {
            class_mapping: vec![1, 2, 0],
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Off => "off",
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }

    pub fn filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Off => log::LevelFilter::Off,
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = LocalizationError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(LogLevel::Off),
            "error" => Ok(LogLevel::Error),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "info" => Ok(LogLevel::Info),
            "debug" => Ok(LogLevel::Debug),
            "trace" => Ok(LogLevel::Trace),
            _ => Err(LocalizationError::config(format!(
                "invalid log level '{s}', expected off, error, warn, info, debug or trace"
            ))),
        }
    }
}

/// Where log records go. Command line flags override both fields.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: LogLevel,
    /// Append to this file instead of writing to stderr.
    pub file: Option<PathBuf>,
}

/// Top-level application configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub logging: LoggingConfig,
    pub map: MapConfig,
    pub filter: ParticleFilterConfig,
    pub controller: ControllerConfig,
    pub trials: TrialConfig,
    pub detector: DetectorConfig,
}

impl AppConfig {
    pub fn validate(&self) -> Result<()> {
        self.filter.validate()?;
        self.trials.validate()
    }

    /// Write the configuration to a JSON file (pretty-printed).
    pub fn to_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        serde_json::to_writer_pretty(file, self)?;
        Ok(())
    }

    pub fn from_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(file)?)
    }

    pub fn to_yaml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = serde_yaml::to_string(self)
            .map_err(|e| LocalizationError::config(format!("YAML encode failed: {e}")))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }

    pub fn from_yaml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        serde_yaml::from_reader(file)
            .map_err(|e| LocalizationError::config(format!("invalid YAML config: {e}")))
    }

    pub fn to_toml<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let mut file = File::create(path)?;
        let s = toml::to_string(self)
            .map_err(|e| LocalizationError::config(format!("TOML encode failed: {e}")))?;
        file.write_all(s.as_bytes())?;
        Ok(())
    }

    pub fn from_toml<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut s = String::new();
        let mut file = File::open(path)?;
        file.read_to_string(&mut s)?;
        toml::from_str(&s).map_err(|e| LocalizationError::config(format!("invalid TOML config: {e}")))
    }

    /// Generic write: choose format by file extension (.json/.yaml/.yml/.toml)
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let p = path.as_ref();
        match extension(p).as_deref() {
            Some("json") => self.to_json(p),
            Some("yaml") | Some("yml") => self.to_yaml(p),
            Some("toml") => self.to_toml(p),
            _ => Err(unsupported_extension(p)),
        }
    }

    /// Generic read: choose format by file extension (.json/.yaml/.yml/.toml). The loaded
    /// configuration is validated before it is returned.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let p = path.as_ref();
        if !p.is_file() {
            return Err(LocalizationError::config(format!(
                "config file '{}' does not exist",
                p.display()
            )));
        }
        let config = match extension(p).as_deref() {
            Some("json") => Self::from_json(p)?,
            Some("yaml") | Some("yml") => Self::from_yaml(p)?,
            Some("toml") => Self::from_toml(p)?,
            _ => return Err(unsupported_extension(p)),
        };
        config.validate()?;
        Ok(config)
    }
}

fn extension(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|s| s.to_str())
        .map(|s| s.to_lowercase())
}

fn unsupported_extension(path: &Path) -> LocalizationError {
    LocalizationError::config(format!(
        "unsupported config file extension for '{}', expected .json, .yaml, .yml or .toml",
        path.display()
    ))
}
