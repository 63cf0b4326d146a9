//! Detection results and diagnostics structures.
//!
//! These types describe what happened during processing of a single scene:
//! - the extracted scene features,
//! - per-object correspondence sets from the matching stage,
//! - accepted detections with their homographies,
//! - rejected candidates with the reason,
//! - matched-distance extrema and per-stage timing.

use std::collections::BTreeMap;

use nalgebra::Matrix3;
use opencv::core::{KeyPoint, Mat, Size, Vector};

/// Correspondences as (object descriptor index, scene keypoint index) pairs,
/// in insertion order.
pub type MatchPairs = Vec<(i32, i32)>;

/// Why a candidate was not accepted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RejectedCode {
    Undef,
    /// Not enough correspondences to attempt a fit.
    LowMatches,
    /// Fit succeeded but kept too few inliers.
    LowInliers,
    /// Every correspondence was an inlier (degenerate fit).
    AllInliers,
    /// A mapped corner left the tolerated scene neighborhood.
    NotValid,
    /// A corner angle of the mapped rectangle was too sharp.
    ByAngle,
    /// Too close to an already accepted instance of the same object.
    Superposed,
    /// A mapped corner fell outside the scene rectangle.
    CornersOutside,
}

/// One accepted object instance.
#[derive(Clone, Debug)]
pub struct Detection {
    pub object_id: i32,
    /// Planar projective transform taking object coordinates to scene
    /// coordinates.
    pub homography: Matrix3<f64>,
    /// Size of the reference object image.
    pub object_size: Size,
    pub inliers: MatchPairs,
    pub outliers: MatchPairs,
    pub filename: String,
}

/// One rejected candidate, kept for diagnostics.
#[derive(Clone, Debug)]
pub struct RejectedCandidate {
    pub object_id: i32,
    pub code: RejectedCode,
    pub inliers: MatchPairs,
    pub outliers: MatchPairs,
}

/// Wall-clock breakdown of one `detect` call, milliseconds.
#[derive(Clone, Copy, Debug, Default)]
pub struct TimingStats {
    pub total_ms: f64,
    pub keypoint_detection_ms: f64,
    pub descriptor_extraction_ms: f64,
    /// Scene-vocabulary build time; only non-zero in non-inverted mode.
    pub indexing_ms: f64,
    pub matching_ms: f64,
    pub homography_ms: f64,
}

/// Everything produced by one pass over a scene image.
#[derive(Clone)]
pub struct DetectionInfo {
    pub scene_keypoints: Vector<KeyPoint>,
    pub scene_descriptors: Mat,
    /// Per-object correspondences, keyed by object id (every registered
    /// object has an entry, possibly empty).
    pub matches: BTreeMap<i32, MatchPairs>,
    /// Accepted detections, in library id order; the same id appears more
    /// than once when multi-detection finds several instances.
    pub detections: Vec<Detection>,
    pub rejected: Vec<RejectedCandidate>,
    /// Smallest nearest-neighbor distance seen while matching; -1 until a
    /// first distance is recorded.
    pub min_matched_distance: f32,
    pub max_matched_distance: f32,
    pub timing: TimingStats,
    /// False when the call degraded to a no-op (empty image, inconsistent
    /// vocabulary mode).
    pub success: bool,
}

impl Default for DetectionInfo {
    fn default() -> Self {
        Self {
            scene_keypoints: Vector::new(),
            scene_descriptors: Mat::default(),
            matches: BTreeMap::new(),
            detections: Vec::new(),
            rejected: Vec::new(),
            min_matched_distance: -1.0,
            max_matched_distance: -1.0,
            timing: TimingStats::default(),
            success: false,
        }
    }
}

impl DetectionInfo {
    /// Record one nearest-neighbor distance into the min/max extrema.
    pub(crate) fn record_distance(&mut self, d: f32) {
        if self.min_matched_distance == -1.0 || self.min_matched_distance > d {
            self.min_matched_distance = d;
        }
        if self.max_matched_distance == -1.0 || self.max_matched_distance < d {
            self.max_matched_distance = d;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_extrema_start_at_sentinel() {
        let mut info = DetectionInfo::default();
        assert_eq!(info.min_matched_distance, -1.0);
        assert_eq!(info.max_matched_distance, -1.0);

        info.record_distance(5.0);
        info.record_distance(2.0);
        info.record_distance(9.0);
        assert_eq!(info.min_matched_distance, 2.0);
        assert_eq!(info.max_matched_distance, 9.0);
    }
}
