//! Keypoint detection and descriptor extraction.
//!
//! Wraps the OpenCV feature pipelines behind one [`FeatureExtractor`] so the
//! rest of the crate never cares which detector is configured. Binary (ORB)
//! and float (SIFT) descriptors are both supported; the active kind decides
//! the distance type used by the vocabulary.

use anyhow::Result;
use opencv::core::{KeyPoint, Mat, Point2f, Ptr, Vector};
use opencv::features2d::{ORB_ScoreType, ORB, SIFT};
use opencv::prelude::*;

use crate::settings::{FeatureKind, Settings};

/// Keypoints plus their descriptor matrix for one image.
#[derive(Clone)]
pub struct FeatureSet {
    pub keypoints: Vector<KeyPoint>,
    /// One row per keypoint; empty when nothing was detected.
    pub descriptors: Mat,
}

/// The configured detector/extractor pair.
///
/// OpenCV's `Feature2D` handles are stateful and not shareable across
/// threads, so worker batches create one extractor each from the same
/// settings.
pub enum FeatureExtractor {
    Orb(Ptr<ORB>),
    Sift(Ptr<SIFT>),
}

impl FeatureExtractor {
    pub fn new(settings: &Settings) -> Result<Self> {
        match &settings.feature2d.extractor {
            FeatureKind::Orb(orb) => Ok(Self::Orb(ORB::create(
                orb.n_features,
                orb.scale_factor,
                orb.n_levels,
                orb.edge_threshold,
                orb.first_level,
                orb.wta_k,
                ORB_ScoreType::HARRIS_SCORE,
                orb.patch_size,
                orb.fast_threshold,
            )?)),
            FeatureKind::Sift(sift) => Ok(Self::Sift(SIFT::create(
                sift.n_features,
                sift.n_octave_layers,
                sift.contrast_threshold,
                sift.edge_threshold,
                sift.sigma,
            )?)),
        }
    }

    /// Detect keypoints in a grayscale image.
    pub fn detect(&mut self, image: &Mat) -> Result<Vector<KeyPoint>> {
        let mut keypoints = Vector::<KeyPoint>::new();
        match self {
            Self::Orb(orb) => orb.detect(image, &mut keypoints, &opencv::core::no_array())?,
            Self::Sift(sift) => sift.detect(image, &mut keypoints, &opencv::core::no_array())?,
        }
        Ok(keypoints)
    }

    /// Compute descriptors for the given keypoints.
    ///
    /// The extractor may drop keypoints it cannot describe; the returned
    /// keypoint list governs the descriptor row count.
    pub fn compute(&mut self, image: &Mat, keypoints: &mut Vector<KeyPoint>) -> Result<Mat> {
        let mut descriptors = Mat::default();
        match self {
            Self::Orb(orb) => orb.compute(image, keypoints, &mut descriptors)?,
            Self::Sift(sift) => sift.compute(image, keypoints, &mut descriptors)?,
        }
        Ok(descriptors)
    }

    /// Detect, truncate to `max_features`, and describe in one call.
    pub fn extract(&mut self, image: &Mat, max_features: i32) -> Result<FeatureSet> {
        let keypoints = self.detect(image)?;
        let mut keypoints = limit_keypoints(keypoints, max_features);
        if keypoints.is_empty() {
            return Ok(FeatureSet { keypoints, descriptors: Mat::default() });
        }
        let descriptors = self.compute(image, &mut keypoints)?;
        Ok(FeatureSet { keypoints, descriptors })
    }
}

/// Keep the `max_keypoints` keypoints with the largest absolute response.
///
/// Ties keep their original order; the returned list is sorted by response,
/// strongest first. With `max_keypoints <= 0` or fewer keypoints than the
/// cap, the input is returned unchanged.
pub fn limit_keypoints(keypoints: Vector<KeyPoint>, max_keypoints: i32) -> Vector<KeyPoint> {
    if max_keypoints <= 0 || keypoints.len() <= max_keypoints as usize {
        return keypoints;
    }

    let mut order: Vec<usize> = (0..keypoints.len()).collect();
    // Stable sort: equal responses stay in original index order.
    order.sort_by(|&a, &b| {
        let ra = keypoints.get(a).map(|k| k.response().abs()).unwrap_or(0.0);
        let rb = keypoints.get(b).map(|k| k.response().abs()).unwrap_or(0.0);
        rb.total_cmp(&ra)
    });

    let mut kept = Vector::<KeyPoint>::new();
    for &i in order.iter().take(max_keypoints as usize) {
        if let Ok(kp) = keypoints.get(i) {
            kept.push(kp);
        }
    }
    kept
}

/// Pixel coordinates of each keypoint, in keypoint order.
pub fn keypoints_to_points(keypoints: &Vector<KeyPoint>) -> Vec<Point2f> {
    keypoints.iter().map(|kp| kp.pt()).collect()
}
