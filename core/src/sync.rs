//! Pairs depth and color images by timestamp and interleaves odometry in time order.
//!
//! Each substream is assumed to arrive in its own timestamp order; the substreams may run ahead
//! of or behind each other arbitrarily. A paired image is held back until odometry has reached
//! its timestamp, so motion is always applied before the image that follows it. A stalled
//! odometry stream only delays images by `max_odom_lag` seconds of newer image data, and
//! [`StreamSynchronizer::finish`] releases whatever is left at end of stream.
use crate::error::{LocalizationError, Result};
use crate::messages::{Frame, Image, ImageFrame, OdomSample};

use log::debug;
use std::collections::VecDeque;

/// Image time an odometry stream may fall behind before images are released without it.
pub const DEFAULT_MAX_ODOM_LAG: f64 = 2.0;

/// Counters for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub paired: u64,
    /// Images dropped because no partner arrived within tolerance.
    pub stale_images: u64,
    /// Odometry dropped because it predates an image already emitted.
    pub stale_odom: u64,
    /// Images released before odometry caught up with them.
    pub lagged_images: u64,
}

#[derive(Debug)]
pub struct StreamSynchronizer {
    tolerance: f64,
    max_odom_lag: f64,
    depth: VecDeque<(f64, Image)>,
    color: VecDeque<(f64, Image)>,
    odom: VecDeque<OdomSample>,
    pending: Option<ImageFrame>,
    last_image: Option<f64>,
    /// Newest odometry timestamp ever received.
    odom_horizon: Option<f64>,
    finished: bool,
    stats: SyncStats,
}

impl StreamSynchronizer {
    /// `tolerance` is the largest depth/color timestamp difference, in seconds, that still
    /// forms a pair.
    pub fn new(tolerance: f64) -> Result<Self> {
        if !(tolerance.is_finite() && tolerance >= 0.0) {
            return Err(LocalizationError::config(format!(
                "synchronizer tolerance must be finite and non-negative, got {tolerance}"
            )));
        }
        Ok(StreamSynchronizer {
            tolerance,
            max_odom_lag: DEFAULT_MAX_ODOM_LAG,
            depth: VecDeque::new(),
            color: VecDeque::new(),
            odom: VecDeque::new(),
            pending: None,
            last_image: None,
            odom_horizon: None,
            finished: false,
            stats: SyncStats::default(),
        })
    }

    /// Release a held image once newer image data runs `lag` seconds ahead of it, even when no
    /// odometry has reached it.
    pub fn with_max_odom_lag(mut self, lag: f64) -> Result<Self> {
        if !(lag.is_finite() && lag >= 0.0) {
            return Err(LocalizationError::config(format!(
                "max odometry lag must be finite and non-negative, got {lag}"
            )));
        }
        self.max_odom_lag = lag;
        Ok(self)
    }

    /// No more data will arrive: held images are released without waiting for odometry.
    pub fn finish(&mut self) {
        self.finished = true;
    }

    pub fn push_depth(&mut self, timestamp: f64, image: Image) {
        Self::push_image(&mut self.depth, &mut self.stats, "depth", timestamp, image);
    }

    pub fn push_color(&mut self, timestamp: f64, image: Image) {
        Self::push_image(&mut self.color, &mut self.stats, "color", timestamp, image);
    }

    fn push_image(
        queue: &mut VecDeque<(f64, Image)>,
        stats: &mut SyncStats,
        stream: &str,
        timestamp: f64,
        image: Image,
    ) {
        if queue.back().is_some_and(|(t, _)| timestamp < *t) {
            stats.stale_images += 1;
            debug!("Discarding out-of-order {stream} image at {timestamp:.4}");
            return;
        }
        queue.push_back((timestamp, image));
    }

    pub fn push_odom(&mut self, sample: OdomSample) {
        if self
            .odom
            .back()
            .is_some_and(|last| sample.timestamp < last.timestamp)
        {
            self.stats.stale_odom += 1;
            debug!("Discarding out-of-order odometry at {:.4}", sample.timestamp);
            return;
        }
        self.odom_horizon = Some(sample.timestamp);
        self.odom.push_back(sample);
    }

    /// Next frame in timestamp order, or `None` when nothing can be emitted yet.
    ///
    /// Odometry between the previous and the next paired image is emitted first, one sample
    /// per call, then the image itself once odometry at or past its timestamp has arrived.
    pub fn poll(&mut self) -> Option<Frame> {
        if self.pending.is_none() {
            self.pending = self.pair_images();
        }
        let image_time = self.pending.as_ref()?.timestamp;
        self.evict_stale_odom();
        if self
            .odom
            .front()
            .is_some_and(|o| o.timestamp < image_time)
        {
            return self.odom.pop_front().map(Frame::Odom);
        }
        if !self.odom_caught_up(image_time) {
            if !self.image_lag_exceeded(image_time) {
                return None;
            }
            self.stats.lagged_images += 1;
            debug!(
                "Releasing image at {image_time:.4} without odometry, newest odometry at {:?}",
                self.odom_horizon
            );
        }
        self.last_image = Some(image_time);
        self.pending.take().map(Frame::Image)
    }

    fn pair_images(&mut self) -> Option<ImageFrame> {
        loop {
            let d = self.depth.front()?.0;
            let c = self.color.front()?.0;
            if (d - c).abs() <= self.tolerance {
                let (_, depth) = self.depth.pop_front()?;
                let (_, color) = self.color.pop_front()?;
                self.stats.paired += 1;
                return Some(ImageFrame {
                    timestamp: d,
                    depth: Some(depth),
                    color: Some(color),
                    ..ImageFrame::default()
                });
            }
            let (stream, stale) = if d < c {
                ("depth", self.depth.pop_front())
            } else {
                ("color", self.color.pop_front())
            };
            if let Some((t, _)) = stale {
                self.stats.stale_images += 1;
                debug!("Stale {stream} frame at {t:.4} has no partner within {:.4}s", self.tolerance);
            }
        }
    }

    fn odom_caught_up(&self, image_time: f64) -> bool {
        self.finished || self.odom_horizon.is_some_and(|t| t >= image_time)
    }

    fn image_lag_exceeded(&self, image_time: f64) -> bool {
        let newest = [self.depth.back(), self.color.back()]
            .into_iter()
            .flatten()
            .map(|(t, _)| *t)
            .fold(f64::NEG_INFINITY, f64::max);
        newest - image_time > self.max_odom_lag
    }

    fn evict_stale_odom(&mut self) {
        let Some(last) = self.last_image else {
            return;
        };
        while self.odom.front().is_some_and(|o| o.timestamp < last) {
            if let Some(o) = self.odom.pop_front() {
                self.stats.stale_odom += 1;
                debug!("Evicting odometry at {:.4}, older than image at {last:.4}", o.timestamp);
            }
        }
    }

    /// Paired or pairable images waiting to be emitted.
    pub fn backlog(&self) -> usize {
        self.depth.len().min(self.color.len()) + usize::from(self.pending.is_some())
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }
}
