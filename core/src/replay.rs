//! Frame sources: where the controller and the trial harness get their frames from.
//!
//! - [`RecordedLog`] replays an in-memory, timestamp-ordered frame list and supports seeking.
//!   [`RecordedLog::from_cached_json`] builds one from a cached-detection log.
//! - [`LiveFeed`] receives raw sensor messages over a channel and pairs them through a
//!   [`StreamSynchronizer`].
//!
//! Cached-detection logs are JSON objects keyed by the message time in milliseconds:
//!
//! ```json
//! {
//!   "0":    {"x_odom": 0.4, "theta_odom": 0.01},
//!   "33":   {"tree_data": {"positions": [[1.8, 0.9]], "widths": [0.12], "classes": [0]},
//!            "location_estimate": {"x": 12.0, "y": 7.5}},
//!   "66":   null
//! }
//! ```
//!
//! Odometry entries carry forward velocity and yaw rate. Image entries carry the trunk
//! detections (robot frame, x forward, y left) and optionally a reference position; `null` is an
//! image with nothing detected. Everything after the last image with detections is dropped.
use crate::error::{LocalizationError, Result};
use crate::messages::{Frame, Image, ImageFrame, OdomSample};
use crate::sync::StreamSynchronizer;
use crate::{Pose2, TreeObservation};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use log::{debug, info};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Result of asking a source for its next frame.
#[derive(Clone, Debug, PartialEq)]
pub enum FrameStatus {
    Ready(Frame),
    /// Nothing available right now; a live source may produce more later.
    Pending,
    /// The source will never produce another frame.
    Exhausted,
}

/// What a frame source supports, used to pick playback behavior.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub seekable: bool,
    pub live: bool,
    /// Image frames carry pre-extracted detections.
    pub cached_observations: bool,
}

pub trait FrameSource: Send {
    fn name(&self) -> &str;

    fn capabilities(&self) -> Capabilities;

    fn next_frame(&mut self) -> Result<FrameStatus>;

    /// Position playback at the first image frame at least `seconds` after the start of the
    /// source.
    fn set_time_position(&mut self, seconds: f64) -> Result<()>;

    /// Image frames consumed so far.
    fn current_position(&self) -> usize;

    /// Total image frames, when known.
    fn total_count(&self) -> Option<usize>;

    /// Sensor data waiting to be processed, for live sources.
    fn backlog(&self) -> Option<usize> {
        None
    }
}

/// Seekable, timestamp-ordered frames held in memory.
#[derive(Clone, Debug)]
pub struct RecordedLog {
    name: String,
    frames: Vec<Frame>,
    cursor: usize,
    images_consumed: usize,
    image_count: usize,
    cached_observations: bool,
}

impl RecordedLog {
    /// Frames are sorted by timestamp; equal timestamps keep their given order.
    pub fn new(name: impl Into<String>, mut frames: Vec<Frame>) -> Self {
        frames.sort_by(|a, b| a.timestamp().total_cmp(&b.timestamp()));
        let image_count = frames.iter().filter(|f| f.is_image()).count();
        let cached_observations = frames
            .iter()
            .any(|f| matches!(f, Frame::Image(img) if img.observations.is_some()));
        RecordedLog {
            name: name.into(),
            frames,
            cursor: 0,
            images_consumed: 0,
            image_count,
            cached_observations,
        }
    }

    pub fn from_cached_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| {
            LocalizationError::config(format!("cannot open log '{}': {e}", path.display()))
        })?;
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("cached log")
            .to_string();
        let log = Self::from_cached_reader(name, BufReader::new(file))?;
        info!(
            "Loaded {} frames ({} images) from {}",
            log.frames.len(),
            log.image_count,
            path.display()
        );
        Ok(log)
    }

    pub fn from_cached_reader<R: Read>(name: impl Into<String>, reader: R) -> Result<Self> {
        let raw: HashMap<String, Option<CachedEntry>> = serde_json::from_reader(reader)?;
        let mut entries = Vec::with_capacity(raw.len());
        for (key, entry) in raw {
            let ms: f64 = key.trim().parse().map_err(|_| {
                LocalizationError::config(format!("cached log key '{key}' is not a timestamp"))
            })?;
            entries.push((ms / 1000.0, entry));
        }
        entries.sort_by(|a, b| a.0.total_cmp(&b.0));

        let mut frames = Vec::with_capacity(entries.len());
        let mut keep = 0;
        for (timestamp, entry) in entries {
            let frame = match entry {
                Some(CachedEntry::Odom {
                    x_odom,
                    theta_odom,
                }) => Frame::Odom(OdomSample::new(x_odom, theta_odom, timestamp)),
                Some(CachedEntry::Image {
                    tree_data,
                    location_estimate,
                }) => {
                    let mut frame = ImageFrame::new(timestamp);
                    if let Some(trees) = tree_data {
                        frame.observations = Some(trees.into_observations()?);
                    }
                    frame.ground_truth = location_estimate
                        .map(|l| Pose2::new(l.x, l.y, l.theta.unwrap_or(0.0)));
                    Frame::Image(frame)
                }
                None => Frame::Image(ImageFrame::new(timestamp)),
            };
            let has_detections =
                matches!(&frame, Frame::Image(img) if img.observations.is_some());
            frames.push(frame);
            if has_detections {
                keep = frames.len();
            }
        }
        frames.truncate(keep);
        Ok(Self::new(name, frames))
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    fn start_time(&self) -> f64 {
        self.frames.first().map(Frame::timestamp).unwrap_or(0.0)
    }
}

impl FrameSource for RecordedLog {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            seekable: true,
            live: false,
            cached_observations: self.cached_observations,
        }
    }

    fn next_frame(&mut self) -> Result<FrameStatus> {
        let Some(frame) = self.frames.get(self.cursor) else {
            return Ok(FrameStatus::Exhausted);
        };
        self.cursor += 1;
        if frame.is_image() {
            self.images_consumed += 1;
        }
        Ok(FrameStatus::Ready(frame.clone()))
    }

    fn set_time_position(&mut self, seconds: f64) -> Result<()> {
        let target = self.start_time() + seconds;
        let from = self.frames.partition_point(|f| f.timestamp() < target);
        let Some(offset) = self.frames[from..].iter().position(Frame::is_image) else {
            return Err(LocalizationError::SeekOutOfRange {
                source_name: self.name.clone(),
                requested: seconds,
                end: self.frames.last().map(Frame::timestamp).unwrap_or(0.0) - self.start_time(),
            });
        };
        self.cursor = from + offset;
        self.images_consumed = self.frames[..self.cursor]
            .iter()
            .filter(|f| f.is_image())
            .count();
        debug!(
            "{}: positioned at frame {} ({:.3}s)",
            self.name,
            self.cursor,
            self.frames[self.cursor].timestamp() - self.start_time()
        );
        Ok(())
    }

    fn current_position(&self) -> usize {
        self.images_consumed
    }

    fn total_count(&self) -> Option<usize> {
        Some(self.image_count)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum CachedEntry {
    Odom {
        x_odom: f64,
        theta_odom: f64,
    },
    Image {
        #[serde(default)]
        tree_data: Option<CachedTrees>,
        #[serde(default)]
        location_estimate: Option<CachedLocation>,
    },
}

#[derive(Deserialize)]
struct CachedTrees {
    positions: Vec<[f64; 2]>,
    widths: Vec<f64>,
    #[serde(default)]
    classes: Vec<u8>,
}

impl CachedTrees {
    fn into_observations(self) -> Result<Vec<TreeObservation>> {
        if self.widths.len() != self.positions.len()
            || (!self.classes.is_empty() && self.classes.len() != self.positions.len())
        {
            return Err(LocalizationError::config(format!(
                "cached tree data has {} positions, {} widths and {} classes",
                self.positions.len(),
                self.widths.len(),
                self.classes.len()
            )));
        }
        Ok(self
            .positions
            .iter()
            .zip(&self.widths)
            .enumerate()
            .map(|(i, (p, &width))| TreeObservation {
                x: p[0],
                y: p[1],
                width,
                class: self.classes.get(i).copied(),
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct CachedLocation {
    x: f64,
    y: f64,
    #[serde(default)]
    theta: Option<f64>,
}

/// Raw sensor message for a [`LiveFeed`].
#[derive(Clone, Debug)]
pub enum SensorMessage {
    Depth { timestamp: f64, image: Image },
    Color { timestamp: f64, image: Image },
    Odom(OdomSample),
}

/// Frames assembled from sensor messages arriving on a channel.
pub struct LiveFeed {
    name: String,
    rx: Receiver<SensorMessage>,
    sync: StreamSynchronizer,
    poll_timeout: Duration,
    images: usize,
    disconnected: bool,
}

impl LiveFeed {
    pub fn new(
        name: impl Into<String>,
        rx: Receiver<SensorMessage>,
        tolerance: f64,
        poll_timeout: Duration,
    ) -> Result<Self> {
        Ok(LiveFeed {
            name: name.into(),
            rx,
            sync: StreamSynchronizer::new(tolerance)?,
            poll_timeout,
            images: 0,
            disconnected: false,
        })
    }

    /// Release images without odometry once newer images run `lag` seconds ahead of them.
    pub fn with_max_odom_lag(mut self, lag: f64) -> Result<Self> {
        self.sync = self.sync.with_max_odom_lag(lag)?;
        Ok(self)
    }

    fn disconnect(&mut self) {
        self.disconnected = true;
        self.sync.finish();
    }

    /// A feed together with the sender sensor drivers publish into.
    pub fn channel(
        name: impl Into<String>,
        tolerance: f64,
        poll_timeout: Duration,
    ) -> Result<(Sender<SensorMessage>, Self)> {
        let (tx, rx) = crossbeam_channel::unbounded();
        Ok((tx, Self::new(name, rx, tolerance, poll_timeout)?))
    }

    fn ingest(&mut self, message: SensorMessage) {
        match message {
            SensorMessage::Depth { timestamp, image } => self.sync.push_depth(timestamp, image),
            SensorMessage::Color { timestamp, image } => self.sync.push_color(timestamp, image),
            SensorMessage::Odom(sample) => self.sync.push_odom(sample),
        }
    }

    fn drain_channel(&mut self) {
        loop {
            match self.rx.try_recv() {
                Ok(message) => self.ingest(message),
                Err(TryRecvError::Empty) => return,
                Err(TryRecvError::Disconnected) => {
                    self.disconnect();
                    return;
                }
            }
        }
    }
}

impl FrameSource for LiveFeed {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            seekable: false,
            live: true,
            cached_observations: false,
        }
    }

    fn next_frame(&mut self) -> Result<FrameStatus> {
        loop {
            self.drain_channel();
            if let Some(frame) = self.sync.poll() {
                if frame.is_image() {
                    self.images += 1;
                }
                return Ok(FrameStatus::Ready(frame));
            }
            if self.disconnected {
                return Ok(FrameStatus::Exhausted);
            }
            match self.rx.recv_timeout(self.poll_timeout) {
                Ok(message) => self.ingest(message),
                Err(RecvTimeoutError::Timeout) => return Ok(FrameStatus::Pending),
                Err(RecvTimeoutError::Disconnected) => self.disconnect(),
            }
        }
    }

    fn set_time_position(&mut self, _seconds: f64) -> Result<()> {
        Err(LocalizationError::config(format!(
            "{} is a live feed and cannot seek",
            self.name
        )))
    }

    fn current_position(&self) -> usize {
        self.images
    }

    fn total_count(&self) -> Option<usize> {
        None
    }

    fn backlog(&self) -> Option<usize> {
        Some(self.sync.backlog())
    }
}

/// Opens the frame source named by a test manifest row.
pub trait SourceProvider: Send {
    fn open(&self, data_source: &str) -> Result<Box<dyn FrameSource>>;
}

impl<F> SourceProvider for F
where
    F: Fn(&str) -> Result<Box<dyn FrameSource>> + Send,
{
    fn open(&self, data_source: &str) -> Result<Box<dyn FrameSource>> {
        self(data_source)
    }
}

/// Cached-detection logs stored as `<dir>/<data_source>.json`.
#[derive(Clone, Debug)]
pub struct CachedLogDirectory {
    dir: PathBuf,
}

impl CachedLogDirectory {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        CachedLogDirectory { dir: dir.into() }
    }

    pub fn path_for(&self, data_source: &str) -> PathBuf {
        let path = self.dir.join(data_source);
        if path.extension().is_some() {
            path
        } else {
            path.with_extension("json")
        }
    }
}

impl SourceProvider for CachedLogDirectory {
    fn open(&self, data_source: &str) -> Result<Box<dyn FrameSource>> {
        Ok(Box::new(RecordedLog::from_cached_json(
            self.path_for(data_source),
        )?))
    }
}
