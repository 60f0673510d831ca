//! Monte Carlo localization for robots driving between orchard tree rows.
//!
//! A particle filter ([`engine::ParticleFilterEngine`]) tracks the robot pose against a static
//! map of tree trunks ([`map::OrchardMap`]). It is driven by odometry and by trunk detections
//! extracted from paired depth/color images. The rest of the crate feeds it:
//!
//! - [`sync`] pairs depth and color frames by timestamp and interleaves odometry in time order.
//! - [`replay`] provides frame sources: in-memory recordings, cached-detection JSON logs and a
//!   live channel feed.
//! - [`controller`] runs the filter over a frame source on a background thread with
//!   cooperative cancellation and single-step playback.
//! - [`trials`] replays recorded logs from many start poses and aggregates how often and how
//!   quickly the filter converges.
//!
//! Results flow back to the caller as [`messages::RunEvent`] values on a channel, so the
//! presentation side never holds a reference to live filter state.
pub mod config;
pub mod controller;
pub mod detect;
pub mod engine;
pub mod error;
pub mod map;
pub mod messages;
pub mod particle;
pub mod replay;
pub mod sync;
pub mod trials;

pub use error::{LocalizationError, Result};

use nalgebra::{Rotation2, Vector2};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::fmt::{self, Display};

/// Wrap an angle in radians to `(-pi, pi]`.
pub fn wrap_angle(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(2.0 * PI);
    if wrapped > PI { wrapped - 2.0 * PI } else { wrapped }
}

/// Planar robot pose in map coordinates (metres, radians).
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Pose2 {
    pub x: f64,
    pub y: f64,
    pub theta: f64,
}

impl Pose2 {
    pub fn new(x: f64, y: f64, theta: f64) -> Self {
        Pose2 {
            x,
            y,
            theta: wrap_angle(theta),
        }
    }

    pub fn position(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }

    /// Euclidean distance between the positions of two poses; heading is ignored.
    pub fn distance_to(&self, other: &Pose2) -> f64 {
        (self.position() - other.position()).norm()
    }

    /// Map a point expressed in the robot frame (x forward, y left) into the map frame.
    pub fn transform_point(&self, local: &Vector2<f64>) -> Vector2<f64> {
        self.position() + Rotation2::new(self.theta) * local
    }
}

impl Display for Pose2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({:.3} m, {:.3} m, {:.1} deg)",
            self.x,
            self.y,
            self.theta.to_degrees()
        )
    }
}

/// A single detected trunk, relative to the robot.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct TreeObservation {
    /// Forward offset in metres.
    pub x: f64,
    /// Leftward offset in metres.
    pub y: f64,
    /// Estimated trunk width in metres.
    pub width: f64,
    /// Trunk class label, if the detector provides one.
    pub class: Option<u8>,
}

impl TreeObservation {
    pub fn new(x: f64, y: f64, width: f64) -> Self {
        TreeObservation {
            x,
            y,
            width,
            class: None,
        }
    }

    pub fn with_class(mut self, class: u8) -> Self {
        self.class = Some(class);
        self
    }

    pub fn offset(&self) -> Vector2<f64> {
        Vector2::new(self.x, self.y)
    }
}
