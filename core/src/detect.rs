//! Trunk detection seam.
//!
//! The segmentation model runs outside this crate. Anything that turns an [`ImageFrame`] into
//! trunk observations implements [`TreeDetector`]; for cached logs the detections are already in
//! the frame and [`CachedDetector`] only remaps their class labels.
use crate::TreeObservation;
use crate::config::DetectorConfig;
use crate::error::{LocalizationError, Result};
use crate::messages::ImageFrame;

use log::warn;

pub trait TreeDetector: Send {
    /// Observations for one image frame. `Ok(None)` means the frame holds nothing usable and
    /// the sensor update should be skipped.
    fn detect(&mut self, frame: &ImageFrame) -> Result<Option<Vec<TreeObservation>>>;
}

/// Reads detections stored in the frame.
#[derive(Clone, Debug)]
pub struct CachedDetector {
    class_mapping: Vec<u8>,
}

impl Default for CachedDetector {
    fn default() -> Self {
        Self::new(&DetectorConfig::default())
    }
}

impl CachedDetector {
    pub fn new(config: &DetectorConfig) -> Self {
        CachedDetector {
            class_mapping: config.class_mapping.clone(),
        }
    }

    /// Detector that passes class labels through unchanged.
    pub fn identity() -> Self {
        CachedDetector {
            class_mapping: Vec::new(),
        }
    }

    fn remap(&self, class: u8) -> Option<u8> {
        if self.class_mapping.is_empty() {
            return Some(class);
        }
        self.class_mapping.get(usize::from(class)).copied()
    }
}

impl TreeDetector for CachedDetector {
    fn detect(&mut self, frame: &ImageFrame) -> Result<Option<Vec<TreeObservation>>> {
        let Some(observations) = &frame.observations else {
            if frame.depth.is_some() || frame.color.is_some() {
                return Err(LocalizationError::Detection(format!(
                    "frame at {:.3}s has images but no cached detections",
                    frame.timestamp
                )));
            }
            return Ok(None);
        };
        let mut out = Vec::with_capacity(observations.len());
        for obs in observations {
            let class = match obs.class {
                Some(raw) => match self.remap(raw) {
                    Some(mapped) => Some(mapped),
                    None => {
                        warn!("Class label {raw} has no mapping, dropping the label");
                        None
                    }
                },
                None => None,
            };
            out.push(TreeObservation { class, ..*obs });
        }
        Ok(Some(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Image;

    #[test]
    fn remaps_classes_with_default_mapping() {
        let frame = ImageFrame::new(1.0).with_observations(vec![
            TreeObservation::new(1.0, 0.0, 0.1).with_class(0),
            TreeObservation::new(1.0, 1.0, 0.1).with_class(2),
            TreeObservation::new(1.0, 2.0, 0.1),
        ]);
        let obs = CachedDetector::default().detect(&frame).unwrap().unwrap();
        let classes: Vec<Option<u8>> = obs.iter().map(|o| o.class).collect();
        assert_eq!(classes, vec![Some(1), Some(0), None]);
    }

    #[test]
    fn unmapped_class_is_dropped_and_identity_passes_through() {
        let frame = ImageFrame::new(1.0)
            .with_observations(vec![TreeObservation::new(1.0, 0.0, 0.1).with_class(7)]);
        let obs = CachedDetector::default().detect(&frame).unwrap().unwrap();
        assert_eq!(obs[0].class, None);
        let obs = CachedDetector::identity().detect(&frame).unwrap().unwrap();
        assert_eq!(obs[0].class, Some(7));
    }

    #[test]
    fn empty_frame_has_no_observations() {
        let mut detector = CachedDetector::default();
        assert!(detector.detect(&ImageFrame::new(0.0)).unwrap().is_none());

        let mut with_images = ImageFrame::new(0.0);
        with_images.depth = Some(Image::new(1, 1, "16UC1", vec![0, 0]));
        assert!(matches!(
            detector.detect(&with_images),
            Err(LocalizationError::Detection(_))
        ));
    }
}
