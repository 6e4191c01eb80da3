//! Face locator: frontal pass, profile pass, mirrored profile pass.

use crate::cascade::{CascadeDetector, CascadeError, DetectParams, HaarCascade};
use crate::types::{Frame, Rect, Region, View};
use std::path::Path;

/// Anything that proposes face rectangles in a grayscale frame.
pub trait RegionDetector: Send + Sync {
    fn detect(&self, frame: &Frame) -> Vec<Rect>;
}

/// Runs the three detection passes and concatenates their results.
///
/// Output order is pass order (frontal, profile_left, profile_right), then
/// detector order within a pass. Overlapping regions across passes are not
/// reconciled.
pub struct FaceLocator {
    frontal: Box<dyn RegionDetector>,
    profile: Box<dyn RegionDetector>,
}

impl FaceLocator {
    pub fn new(frontal: Box<dyn RegionDetector>, profile: Box<dyn RegionDetector>) -> Self {
        Self { frontal, profile }
    }

    /// Build a locator from two cascade files sharing one window policy.
    pub fn from_cascades(
        frontal_path: &Path,
        profile_path: &Path,
        params: DetectParams,
    ) -> Result<Self, CascadeError> {
        let frontal = HaarCascade::load(frontal_path)?;
        let profile = HaarCascade::load(profile_path)?;
        Ok(Self::new(
            Box::new(CascadeDetector::new(frontal, params)),
            Box::new(CascadeDetector::new(profile, params)),
        ))
    }

    /// Locate every candidate face. An empty result is a normal outcome.
    pub fn locate(&self, frame: &Frame) -> Vec<Region> {
        let mut regions: Vec<Region> = self
            .frontal
            .detect(frame)
            .into_iter()
            .map(|r| Region::from_rect(r, View::Frontal))
            .collect();

        regions.extend(
            self.profile
                .detect(frame)
                .into_iter()
                .map(|r| Region::from_rect(r, View::ProfileLeft)),
        );

        let mirrored = frame.mirrored();
        regions.extend(self.profile.detect(&mirrored).into_iter().map(|r| {
            let x = frame.width.saturating_sub(r.x + r.width);
            Region::from_rect(Rect { x, ..r }, View::ProfileRight)
        }));

        tracing::debug!(regions = regions.len(), "located faces");
        regions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reports a fixed rectangle whenever the top-left pixel is bright.
    struct MarkerDetector(Rect);

    impl RegionDetector for MarkerDetector {
        fn detect(&self, frame: &Frame) -> Vec<Rect> {
            if frame.pixel(0, 0) > 128 {
                vec![self.0]
            } else {
                Vec::new()
            }
        }
    }

    struct NoDetector;

    impl RegionDetector for NoDetector {
        fn detect(&self, _frame: &Frame) -> Vec<Rect> {
            Vec::new()
        }
    }

    fn frame_with_marker(left: bool, right: bool) -> Frame {
        let (w, h) = (100u32, 50u32);
        let mut data = vec![0u8; (w * h) as usize];
        if left {
            data[0] = 255;
        }
        if right {
            data[(w - 1) as usize] = 255;
        }
        Frame::new(data, w, h).unwrap()
    }

    #[test]
    fn test_no_faces_is_empty() {
        let locator = FaceLocator::new(Box::new(NoDetector), Box::new(NoDetector));
        assert!(locator.locate(&frame_with_marker(true, true)).is_empty());
    }

    #[test]
    fn test_pass_order_and_views() {
        let rect = Rect::new(10, 5, 20, 30);
        let locator = FaceLocator::new(
            Box::new(MarkerDetector(rect)),
            Box::new(MarkerDetector(rect)),
        );
        let regions = locator.locate(&frame_with_marker(true, true));
        let views: Vec<View> = regions.iter().map(|r| r.view).collect();
        assert_eq!(views, vec![View::Frontal, View::ProfileLeft, View::ProfileRight]);
    }

    #[test]
    fn test_mirrored_pass_remaps_x() {
        let rect = Rect::new(10, 5, 20, 30);
        let locator = FaceLocator::new(Box::new(NoDetector), Box::new(MarkerDetector(rect)));
        // Marker only at the right edge: visible to the mirrored pass only.
        let regions = locator.locate(&frame_with_marker(false, true));
        assert_eq!(regions.len(), 1);
        let r = regions[0];
        assert_eq!(r.view, View::ProfileRight);
        assert_eq!((r.x, r.y, r.width, r.height), (100 - 10 - 20, 5, 20, 30));
    }
}
