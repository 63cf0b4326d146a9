//! Runtime configuration for the detection pipeline.
//!
//! Settings are grouped the way the pipeline consumes them: `general`
//! (threading, search topology, vocabulary maintenance), `feature2d`
//! (detector/extractor selection), `nearest_neighbor` (match acceptance and
//! FLANN tuning) and `homography` (robust fit and geometric validation).
//!
//! The whole tree serializes to a single JSON file; every field has a default
//! so partial files load cleanly.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use anyhow::{Context, Result};
use opencv::calib3d;
use opencv::core;
use opencv::flann::flann_distance_t;
use serde::{Deserialize, Serialize};

/// Top-level settings tree.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub general: GeneralSettings,
    pub feature2d: FeatureSettings,
    pub nearest_neighbor: NearestNeighborSettings,
    pub homography: HomographySettings,
}

impl Settings {
    /// Load settings from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path.as_ref())
            .with_context(|| format!("opening settings file {}", path.as_ref().display()))?;
        let settings = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing settings file {}", path.as_ref().display()))?;
        Ok(settings)
    }

    /// Save settings to a JSON file (pretty-printed).
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())
            .with_context(|| format!("creating settings file {}", path.as_ref().display()))?;
        serde_json::to_writer_pretty(BufWriter::new(file), self)
            .with_context(|| format!("writing settings file {}", path.as_ref().display()))?;
        Ok(())
    }

    /// Number of workers for a batch of `items` independent tasks.
    /// `threads == 0` means one worker per item.
    pub fn batch_size(&self, items: usize) -> usize {
        if self.general.threads == 0 {
            items.max(1)
        } else {
            self.general.threads.max(1) as usize
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralSettings {
    /// Worker pool size. 0 = one worker per item, 1 = fully serial.
    pub threads: i32,
    /// Build the vocabulary over the object library and query it with the
    /// scene (true), or index the scene and query the library (false).
    pub inverted_search: bool,
    /// Quantize new descriptors against existing words instead of always
    /// allocating fresh ones.
    pub vocabulary_incremental: bool,
    /// In incremental mode, rebuild the index once this many new words have
    /// accumulated in the staging block.
    pub vocabulary_update_min_words: i32,
    /// Accept several instances of the same object in one scene.
    pub multi_detection: bool,
    /// Minimum distance (pixels) between accepted instances of one object.
    pub multi_detection_radius: i32,
    /// Next object id handed out by the library. Persisted with the settings.
    pub next_obj_id: i32,
    /// Shell-glob filename filters for directory loading.
    pub image_formats: String,
    /// Publish a detection event even when nothing was found.
    pub send_no_obj_detected_events: bool,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            threads: 1,
            inverted_search: true,
            vocabulary_incremental: false,
            vocabulary_update_min_words: 2000,
            multi_detection: false,
            multi_detection_radius: 30,
            next_obj_id: 1,
            image_formats: "*.png *.jpg *.jpeg *.bmp *.tiff *.ppm *.pgm".to_string(),
            send_no_obj_detected_events: false,
        }
    }
}

/// Which feature pipeline produces keypoints and descriptors.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FeatureKind {
    Orb(OrbSettings),
    Sift(SiftSettings),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct OrbSettings {
    pub n_features: i32,
    pub scale_factor: f32,
    pub n_levels: i32,
    pub edge_threshold: i32,
    pub first_level: i32,
    /// Number of points producing each BRIEF element; 3 or 4 switches the
    /// matcher to Hamming-2 distance.
    pub wta_k: i32,
    pub patch_size: i32,
    pub fast_threshold: i32,
}

impl Default for OrbSettings {
    fn default() -> Self {
        Self {
            n_features: 500,
            scale_factor: 1.2,
            n_levels: 8,
            edge_threshold: 31,
            first_level: 0,
            wta_k: 2,
            patch_size: 31,
            fast_threshold: 20,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SiftSettings {
    pub n_features: i32,
    pub n_octave_layers: i32,
    pub contrast_threshold: f64,
    pub edge_threshold: f64,
    pub sigma: f64,
}

impl Default for SiftSettings {
    fn default() -> Self {
        Self {
            n_features: 0,
            n_octave_layers: 3,
            contrast_threshold: 0.04,
            edge_threshold: 10.0,
            sigma: 1.6,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FeatureSettings {
    pub extractor: FeatureKind,
    /// Keep only the strongest keypoints per image. 0 = no cap.
    pub max_features: i32,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            extractor: FeatureKind::Orb(OrbSettings::default()),
            max_features: 0,
        }
    }
}

/// FLANN index structure used for the vocabulary.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum IndexKind {
    /// Pick LSH for binary descriptors and a KD-tree forest for float ones.
    Auto,
    Linear,
    KdTree { trees: i32 },
    Lsh { table_number: i32, key_size: i32, multi_probe_level: i32 },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct NearestNeighborSettings {
    /// Accept a match only if nearest ≤ ratio · second-nearest.
    pub nndr_ratio_used: bool,
    pub nndr_ratio: f32,
    /// Accept a match only if nearest distance ≤ `min_distance`.
    pub min_distance_used: bool,
    pub min_distance: f32,
    pub index: IndexKind,
    /// FLANN search recursion budget.
    pub search_checks: i32,
}

impl Default for NearestNeighborSettings {
    fn default() -> Self {
        Self {
            nndr_ratio_used: true,
            nndr_ratio: 0.8,
            min_distance_used: false,
            min_distance: 1.6,
            index: IndexKind::Auto,
            search_checks: 32,
        }
    }
}

/// Robust estimation method passed to `calib3d::find_homography`.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HomographyMethod {
    LeastSquares,
    Ransac,
    Lmeds,
    Rho,
}

impl HomographyMethod {
    pub fn to_opencv(self) -> i32 {
        match self {
            HomographyMethod::LeastSquares => 0,
            HomographyMethod::Ransac => calib3d::RANSAC,
            HomographyMethod::Lmeds => calib3d::LMEDS,
            HomographyMethod::Rho => calib3d::RHO,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct HomographySettings {
    /// Run the homography stage at all; without it matching results are the
    /// final output.
    pub homography_computed: bool,
    pub method: HomographyMethod,
    pub ransac_reproj_thr: f64,
    /// A candidate needs at least this many correspondences to be fitted and
    /// this many inliers to be accepted.
    pub minimum_inliers: i32,
    /// Reject detections whose mapped rectangle has a corner angle outside
    /// `[min_angle, 180 - min_angle]` degrees. 0 disables the test.
    pub min_angle: i32,
    /// Reject fits where every correspondence is an inlier (degenerate for
    /// textured planar objects seen in larger scenes).
    pub ignore_when_all_inliers: bool,
    /// Require all four mapped corners to fall inside the scene image.
    pub all_corners_visible: bool,
}

impl Default for HomographySettings {
    fn default() -> Self {
        Self {
            homography_computed: true,
            method: HomographyMethod::Ransac,
            ransac_reproj_thr: 1.0,
            minimum_inliers: 10,
            min_angle: 0,
            ignore_when_all_inliers: false,
            all_corners_visible: false,
        }
    }
}

impl Settings {
    /// True when the configured extractor emits binary (CV_8U) descriptors.
    pub fn binary_descriptors(&self) -> bool {
        matches!(self.feature2d.extractor, FeatureKind::Orb(_))
    }

    /// OpenCV norm for brute-force distance over the configured descriptors.
    /// ORB with WTA_K of 3 or 4 packs multi-point comparisons and needs
    /// Hamming-2.
    pub fn norm_type(&self) -> i32 {
        match &self.feature2d.extractor {
            FeatureKind::Orb(orb) if orb.wta_k == 3 || orb.wta_k == 4 => core::NORM_HAMMING2,
            FeatureKind::Orb(_) => core::NORM_HAMMING,
            FeatureKind::Sift(_) => core::NORM_L2,
        }
    }

    /// FLANN distance for the vocabulary index.
    pub fn flann_distance(&self) -> flann_distance_t {
        if self.binary_descriptors() {
            flann_distance_t::FLANN_DIST_HAMMING
        } else {
            flann_distance_t::FLANN_DIST_EUCLIDEAN
        }
    }

    /// Concrete index structure after resolving `IndexKind::Auto`.
    pub fn index_kind(&self) -> IndexKind {
        match self.nearest_neighbor.index {
            IndexKind::Auto => {
                if self.binary_descriptors() {
                    IndexKind::Lsh { table_number: 12, key_size: 20, multi_probe_level: 2 }
                } else {
                    IndexKind::KdTree { trees: 4 }
                }
            }
            other => other,
        }
    }

    /// Extensions (lowercase, no dot) accepted by the directory scan.
    pub fn image_extensions(&self) -> Vec<String> {
        self.general
            .image_formats
            .split_whitespace()
            .map(|f| f.trim_start_matches('*').trim_start_matches('.').to_lowercase())
            .filter(|f| !f.is_empty())
            .collect()
    }
}
