//! Frames flowing into the filter and events flowing out of it.
//!
//! A [`Frame`] is the synchronized unit of sensor input: an odometry sample or a paired
//! depth/color image. Frames are produced in timestamp order by a
//! [`FrameSource`](crate::replay::FrameSource), consumed once, and never mutated.
//!
//! [`RunEvent`]s go the other way, from a background run to whoever presents its progress.
//! They carry owned copies only, so the receiver never touches live filter state.
use crate::controller::RunSummary;
use crate::particle::Particle;
use crate::trials::{BatchSummary, TrialResult};
use crate::{Pose2, TreeObservation};

use crossbeam_channel::{Receiver, Sender};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Wheel odometry reading, velocities in the robot frame.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct OdomSample {
    /// Forward velocity, m/s.
    pub linear_velocity: f64,
    /// Yaw rate, rad/s.
    pub angular_velocity: f64,
    /// Seconds, on the same clock as the image frames.
    pub timestamp: f64,
}

impl OdomSample {
    pub fn new(linear_velocity: f64, angular_velocity: f64, timestamp: f64) -> Self {
        OdomSample {
            linear_velocity,
            angular_velocity,
            timestamp,
        }
    }
}

/// Raw image buffer shared between frames without copying.
#[derive(Clone, Debug, PartialEq)]
pub struct Image {
    pub width: u32,
    pub height: u32,
    pub encoding: String,
    pub data: Arc<[u8]>,
}

impl Image {
    pub fn new(width: u32, height: u32, encoding: impl Into<String>, data: Vec<u8>) -> Self {
        Image {
            width,
            height,
            encoding: encoding.into(),
            data: data.into(),
        }
    }
}

/// A depth/color pair captured at (nearly) the same instant.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ImageFrame {
    pub timestamp: f64,
    pub depth: Option<Image>,
    pub color: Option<Image>,
    /// Trunk detections extracted ahead of time, for cached logs.
    pub observations: Option<Vec<TreeObservation>>,
    /// Reference pose recorded with the frame, when the log has one.
    pub ground_truth: Option<Pose2>,
}

impl ImageFrame {
    pub fn new(timestamp: f64) -> Self {
        ImageFrame {
            timestamp,
            ..ImageFrame::default()
        }
    }

    pub fn with_observations(mut self, observations: Vec<TreeObservation>) -> Self {
        self.observations = Some(observations);
        self
    }

    pub fn with_ground_truth(mut self, pose: Pose2) -> Self {
        self.ground_truth = Some(pose);
        self
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum Frame {
    Image(ImageFrame),
    Odom(OdomSample),
}

impl Frame {
    pub fn timestamp(&self) -> f64 {
        match self {
            Frame::Image(img) => img.timestamp,
            Frame::Odom(odom) => odom.timestamp,
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, Frame::Image(_))
    }
}

/// Where playback stands within the current frame source.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct PlaybackPosition {
    /// Image frames consumed so far.
    pub index: usize,
    /// Total image frames, for sources with a known length.
    pub total: Option<usize>,
    pub timestamp: f64,
}

/// Owned copy of the filter state for display.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineSnapshot {
    /// Down-sampled particles.
    pub particles: Vec<Particle>,
    pub best_estimate: Pose2,
    pub converged: bool,
    pub effective_sample_size: f64,
    pub position: Option<PlaybackPosition>,
    /// Image pairs waiting in a live feed.
    pub backlog: Option<usize>,
}

#[derive(Clone, Debug)]
pub enum RunEvent {
    Snapshot(EngineSnapshot),
    Status(String),
    /// The controller moved on to the next queued frame source.
    SourceAdvanced { from: String, to: String },
    TrialFinished(TrialResult),
    BatchFinished(BatchSummary),
    Completed(RunSummary),
}

/// Sending half of the event channel. A sink without a channel drops every event, and a
/// disconnected receiver is not an error for the run.
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    tx: Option<Sender<RunEvent>>,
}

impl EventSink {
    pub fn new(tx: Sender<RunEvent>) -> Self {
        EventSink { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        EventSink { tx: None }
    }

    pub fn emit(&self, event: RunEvent) {
        if let Some(tx) = &self.tx
            && tx.send(event).is_err()
        {
            debug!("Event receiver dropped, discarding event");
        }
    }

    /// Log a status line and forward it to the receiver.
    pub fn status(&self, message: impl Into<String>) {
        let message = message.into();
        info!("{}", message);
        self.emit(RunEvent::Status(message));
    }
}

/// Unbounded event channel for a background run.
pub fn event_channel() -> (EventSink, Receiver<RunEvent>) {
    let (tx, rx) = crossbeam_channel::unbounded();
    (EventSink::new(tx), rx)
}
