//! Synthetic orchard and drive shared by the integration tests.
//!
//! Two tree rows at y = +-1.5 m with irregular spacing, so a short stretch of observations
//! pins down the position along the row. The robot drives straight down the middle at 1 m/s,
//! sampling odometry at 10 Hz and images at 2 Hz; every image carries the trunks visible
//! ahead of it and the true pose as reference.
#![allow(dead_code)]

use orchard_pf::map::{MapTree, OrchardMap};
use orchard_pf::messages::{Frame, ImageFrame, OdomSample};
use orchard_pf::replay::RecordedLog;
use orchard_pf::{Pose2, TreeObservation};

const NORTH_ROW: [f64; 12] = [0.0, 1.7, 4.1, 5.3, 8.0, 9.2, 12.5, 13.1, 16.4, 18.0, 21.0, 22.3];
const SOUTH_ROW: [f64; 10] = [0.8, 3.0, 3.9, 6.6, 10.1, 11.0, 14.2, 17.3, 19.5, 23.0];
const ROW_OFFSET: f64 = 1.5;
const VIEW_RANGE: f64 = 5.5;
pub const TRUNK_WIDTH: f64 = 0.2;

pub const SPEED: f64 = 1.0;
pub const START_X: f64 = 2.0;
pub const DURATION_S: f64 = 10.0;

pub fn orchard() -> OrchardMap {
    let trees = NORTH_ROW
        .iter()
        .map(|&x| (x, ROW_OFFSET))
        .chain(SOUTH_ROW.iter().map(|&x| (x, -ROW_OFFSET)))
        .enumerate()
        .map(|(i, (x, y))| MapTree {
            object_number: Some(i as u32),
            width: Some(TRUNK_WIDTH),
            ..MapTree::new(x, y)
        })
        .collect();
    OrchardMap::new(trees).unwrap()
}

/// True pose `t` seconds into the drive.
pub fn true_pose(t: f64) -> Pose2 {
    Pose2::new(START_X + SPEED * t, 0.0, 0.0)
}

/// Trunks ahead of `pose` in the robot frame.
pub fn visible_trees(map: &OrchardMap, pose: &Pose2) -> Vec<TreeObservation> {
    map.trees()
        .iter()
        .filter_map(|tree| {
            let dx = tree.x - pose.x;
            let dy = tree.y - pose.y;
            let (s, c) = (-pose.theta).sin_cos();
            let local = (c * dx - s * dy, s * dx + c * dy);
            (local.0 > 0.3 && local.0 <= VIEW_RANGE && local.1.abs() < 3.0)
                .then(|| TreeObservation::new(local.0, local.1, TRUNK_WIDTH))
        })
        .collect()
}

pub fn drive_frames(map: &OrchardMap) -> Vec<Frame> {
    let mut frames = Vec::new();
    let images = (DURATION_S * 2.0) as usize;
    for i in 0..=images {
        let t = i as f64 * 0.5;
        let pose = true_pose(t);
        frames.push(Frame::Image(
            ImageFrame::new(t)
                .with_observations(visible_trees(map, &pose))
                .with_ground_truth(pose),
        ));
    }
    let samples = (DURATION_S * 10.0) as usize;
    for k in 0..samples {
        let t = 0.05 + k as f64 * 0.1;
        frames.push(Frame::Odom(OdomSample::new(SPEED, 0.0, t)));
    }
    frames
}

pub fn drive_log(name: &str) -> RecordedLog {
    RecordedLog::new(name, drive_frames(&orchard()))
}

/// The drive as a cached-detection JSON document, keyed by milliseconds.
pub fn drive_json() -> serde_json::Value {
    let map = orchard();
    let mut doc = serde_json::Map::new();
    for frame in drive_frames(&map) {
        let key = format!("{}", (frame.timestamp() * 1000.0).round() as u64);
        let value = match frame {
            Frame::Odom(o) => serde_json::json!({
                "x_odom": o.linear_velocity,
                "theta_odom": o.angular_velocity,
            }),
            Frame::Image(img) => {
                let obs = img.observations.unwrap_or_default();
                let truth = img.ground_truth.unwrap_or_default();
                serde_json::json!({
                    "tree_data": {
                        "positions": obs.iter().map(|o| [o.x, o.y]).collect::<Vec<_>>(),
                        "widths": obs.iter().map(|o| o.width).collect::<Vec<_>>(),
                    },
                    "location_estimate": { "x": truth.x, "y": truth.y, "theta": truth.theta },
                })
            }
        };
        doc.insert(key, value);
    }
    serde_json::Value::Object(doc)
}
