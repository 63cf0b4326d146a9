//! Detection engine: object registration, vocabulary maintenance, and the
//! Extract -> Match -> Verify pipeline for a scene image.

pub mod homography;
pub mod info;
pub mod matching;

pub use info::{
    Detection, DetectionInfo, MatchPairs, RejectedCandidate, RejectedCode, TimingStats,
};

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Instant;

use anyhow::{anyhow, bail, Context, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use opencv::core::{self, Mat, Size};
use opencv::imgcodecs;
use opencv::imgproc;
use opencv::prelude::*;
use tracing::{error, info, warn};

use crate::features::{keypoints_to_points, limit_keypoints, FeatureExtractor, FeatureSet};
use crate::library::{self, ObjectLibrary, ObjSignature};
use crate::settings::Settings;
use crate::vocabulary::Vocabulary;

use matching::MatchingStage;

fn ms(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Top-level detector owning the object library, the vocabulary, and the
/// global descriptor store.
pub struct Detector {
    settings: Settings,
    library: ObjectLibrary,
    vocabulary: Vocabulary,
    /// Non-inverted single-matrix mode keeps one concatenated matrix under
    /// key 0; multi-thread mode keeps one matrix per object id.
    objects_descriptors: BTreeMap<i32, Mat>,
    /// Concatenated-row upper bound -> object id (single-matrix mode only).
    data_range: BTreeMap<i32, i32>,
    detections_tx: Option<Sender<DetectionInfo>>,
}

impl Detector {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            library: ObjectLibrary::new(),
            vocabulary: Vocabulary::new(),
            objects_descriptors: BTreeMap::new(),
            data_range: BTreeMap::new(),
            detections_tx: None,
        }
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Mutable settings access. Changing the feature pipeline or the search
    /// topology requires `update_objects` + `update_vocabulary` before the
    /// next `detect`; until then the consistency gate skips matching.
    pub fn settings_mut(&mut self) -> &mut Settings {
        &mut self.settings
    }

    pub fn library(&self) -> &ObjectLibrary {
        &self.library
    }

    pub fn object(&self, id: i32) -> Option<&ObjSignature> {
        self.library.get(id)
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// Subscribe to detection events published by [`detect_and_publish`].
    ///
    /// [`detect_and_publish`]: Detector::detect_and_publish
    pub fn detection_events(&mut self) -> Receiver<DetectionInfo> {
        let (tx, rx) = unbounded();
        self.detections_tx = Some(tx);
        rx
    }

    /// Register an image file as a reference object. A filename stem that
    /// parses to a positive integer proposes the object id.
    pub fn add_object_from_file(&mut self, path: impl AsRef<Path>) -> Result<i32> {
        let path = path.as_ref();
        info!("loading object file {}", path.display());
        let image = imgcodecs::imread(
            path.to_str().context("object path is not valid UTF-8")?,
            imgcodecs::IMREAD_GRAYSCALE,
        )?;
        if image.empty() {
            bail!("could not read image {}", path.display());
        }
        let id = library::id_from_filename(path);
        let filename = path.file_name().and_then(|n| n.to_str()).unwrap_or_default().to_string();
        self.add_object(image, id, &filename)
    }

    /// Register an in-memory grayscale image as a reference object.
    ///
    /// `id == 0` asks for auto-assignment; a colliding explicit id is
    /// reassigned with a warning. Any mutation of the library invalidates
    /// the vocabulary.
    pub fn add_object(&mut self, image: Mat, mut id: i32, filename: &str) -> Result<i32> {
        if id > 0 && self.library.contains(id) {
            warn!(
                "object {} already added, a new id will be generated (new id={})",
                id, self.settings.general.next_obj_id
            );
            id = 0;
        }
        if id == 0 {
            id = self.settings.general.next_obj_id.max(1);
            while self.library.contains(id) {
                id += 1;
            }
        }
        // The allocator only moves forward.
        self.settings.general.next_obj_id = self.settings.general.next_obj_id.max(id + 1);

        self.library.insert(ObjSignature::new(id, image, filename))?;
        self.clear_vocabulary();
        Ok(id)
    }

    pub fn remove_object(&mut self, id: i32) {
        if self.library.remove(id).is_some() {
            self.clear_vocabulary();
        }
    }

    pub fn remove_all_objects(&mut self) {
        self.library.clear();
        self.clear_vocabulary();
    }

    /// Load every image in `dir` (natural name order, configured formats),
    /// then extract features and rebuild the vocabulary.
    pub fn load_objects(&mut self, dir: impl AsRef<Path>) -> Result<usize> {
        let files = library::list_images(dir.as_ref(), &self.settings.image_extensions())?;
        let mut loaded = 0;
        for file in &files {
            match self.add_object_from_file(file) {
                Ok(_) => loaded += 1,
                Err(e) => warn!("skipping {}: {e:#}", file.display()),
            }
        }
        if loaded > 0 {
            self.update_objects()?;
            self.update_vocabulary()?;
        }
        Ok(loaded)
    }

    fn clear_vocabulary(&mut self) {
        self.objects_descriptors.clear();
        self.data_range.clear();
        self.vocabulary.clear();
    }

    /// Extract features for every signature that does not have them yet.
    /// Per-object work is independent and runs in worker batches.
    pub fn update_objects(&mut self) -> Result<()> {
        let pending: Vec<ExtractTask> = self
            .library
            .iter()
            .filter(|(_, sig)| !sig.has_features())
            .map(|(&id, sig)| {
                Ok(ExtractTask {
                    object_id: id,
                    image: sig.image().try_clone()?,
                    settings: self.settings.clone(),
                })
            })
            .collect::<Result<_>>()?;

        if pending.is_empty() {
            info!("no objects to update");
            return Ok(());
        }

        let start = Instant::now();
        info!("extracting features from {} objects...", pending.len());
        let batch = self.settings.batch_size(pending.len());

        let mut tasks = pending.into_iter().peekable();
        while tasks.peek().is_some() {
            let wave: Vec<ExtractTask> = tasks.by_ref().take(batch).collect();
            let outputs: Vec<Result<ExtractOutput>> = std::thread::scope(|scope| {
                let handles: Vec<_> =
                    wave.into_iter().map(|task| scope.spawn(move || task.run())).collect();
                handles
                    .into_iter()
                    .map(|h| {
                        h.join().unwrap_or_else(|_| Err(anyhow!("extraction worker panicked")))
                    })
                    .collect()
            });
            for output in outputs {
                let output = output?;
                if let Some(signature) = self.library.get_mut(output.object_id) {
                    signature.set_data(output.features.keypoints, output.features.descriptors);
                }
            }
        }

        info!(
            "extracting features from {} objects... done ({:.0} ms)",
            self.library.len(),
            ms(start)
        );
        Ok(())
    }

    /// Rebuild the global descriptor store and, in inverted mode, the
    /// vocabulary itself.
    pub fn update_vocabulary(&mut self) -> Result<()> {
        self.clear_vocabulary();

        // All non-empty descriptor matrices must agree on width and type.
        let mut count = 0;
        let mut dim = -1;
        let mut typ = -1;
        for (_, signature) in self.library.iter() {
            let descriptors = signature.descriptors();
            if descriptors.empty() {
                continue;
            }
            if dim >= 0 && descriptors.cols() != dim {
                error!(
                    "objects do not all have the same descriptor size; they must all \
                     come from the same descriptor extractor"
                );
                return Ok(());
            }
            dim = descriptors.cols();
            if typ >= 0 && descriptors.typ() != typ {
                error!(
                    "objects do not all have the same descriptor type; they must all \
                     come from the same descriptor extractor"
                );
                return Ok(());
            }
            typ = descriptors.typ();
            count += descriptors.rows();
        }

        if count == 0 {
            return Ok(());
        }
        info!(
            "updating global descriptor store: objects={}, descriptors={}, dim={}, type={}",
            self.library.len(),
            count,
            dim,
            typ
        );

        let inverted = self.settings.general.inverted_search;
        if inverted || self.settings.general.threads == 1 {
            // One concatenated matrix; data_range maps each object's last
            // row back to its id.
            let mut parts = core::Vector::<Mat>::new();
            let mut row = 0;
            for (&id, signature) in self.library.iter() {
                let rows = signature.descriptors().rows();
                if rows > 0 {
                    parts.push(signature.descriptors().try_clone()?);
                    row += rows;
                    self.data_range.insert(row - 1, id);
                }
            }
            let mut all = Mat::default();
            core::vconcat(&parts, &mut all)?;
            self.objects_descriptors.insert(0, all);

            if inverted {
                self.build_inverted_vocabulary()?;
            }
        } else {
            for (&id, signature) in self.library.iter() {
                if !signature.descriptors().empty() {
                    self.objects_descriptors.insert(id, signature.descriptors().try_clone()?);
                }
            }
        }

        Ok(())
    }

    fn build_inverted_vocabulary(&mut self) -> Result<()> {
        let incremental = self.settings.general.vocabulary_incremental;
        let start = Instant::now();
        info!("creating {}vocabulary...", if incremental { "incremental " } else { "" });

        let min_words = self.settings.general.vocabulary_update_min_words;
        let mut added_words = 0usize;
        for id in self.library.ids() {
            let Some(descriptors) =
                self.library.get(id).map(|s| s.descriptors().try_clone()).transpose()?
            else {
                continue;
            };
            let local = Instant::now();
            let words = self.vocabulary.add_words(&descriptors, id, incremental, &self.settings)?;
            added_words += words.len();

            let mut flushed = false;
            if incremental && added_words > 0 && added_words >= min_words as usize {
                self.vocabulary.update(&self.settings)?;
                added_words = 0;
                flushed = true;
            }
            info!(
                "object {}: {} words from {} descriptors ({} total, {:.0} ms){}",
                id,
                words.len(),
                descriptors.rows(),
                self.vocabulary.size(),
                ms(local),
                if flushed { " updated" } else { "" }
            );
            if let Some(signature) = self.library.get_mut(id) {
                signature.set_words(words);
            }
        }
        if added_words > 0 {
            self.vocabulary.update(&self.settings)?;
        }

        info!(
            "creating {}vocabulary... done, size={} ({:.0} ms)",
            if incremental { "incremental " } else { "" },
            self.vocabulary.size(),
            ms(start)
        );
        Ok(())
    }

    /// Run the full pipeline over a scene image.
    ///
    /// Recoverable conditions (empty image, vocabulary in the wrong mode,
    /// featureless scene) degrade to a warning; `info.success` reports
    /// whether matching actually ran (or was trivially accepted).
    pub fn detect(&mut self, image: &Mat) -> Result<DetectionInfo> {
        let total = Instant::now();
        let mut detection_info = DetectionInfo::default();

        if image.empty() {
            warn!("empty scene image");
            return Ok(detection_info);
        }
        let gray = to_grayscale(image)?;

        let start = Instant::now();
        let mut extractor = FeatureExtractor::new(&self.settings)?;
        let keypoints = extractor.detect(&gray)?;
        detection_info.timing.keypoint_detection_ms = ms(start);

        let start = Instant::now();
        if !keypoints.is_empty() {
            let mut keypoints = limit_keypoints(keypoints, self.settings.feature2d.max_features);
            let descriptors = extractor.compute(&gray, &mut keypoints)?;
            if keypoints.len() as i32 != descriptors.rows() {
                error!(
                    "scene: {} keypoints but {} descriptor rows",
                    keypoints.len(),
                    descriptors.rows()
                );
            }
            detection_info.scene_keypoints = keypoints;
            detection_info.scene_descriptors = descriptors;
        }
        detection_info.timing.descriptor_extraction_ms = ms(start);

        let empty_scene = detection_info.scene_keypoints.is_empty();

        let stage = MatchingStage {
            settings: &self.settings,
            library: &self.library,
            objects_descriptors: &self.objects_descriptors,
            data_range: &self.data_range,
        };
        let consistent = stage.consistent(&self.vocabulary);
        let dims_match = self
            .objects_descriptors
            .values()
            .next()
            .map(|m| {
                m.cols() == detection_info.scene_descriptors.cols()
                    && m.typ() == detection_info.scene_descriptors.typ()
            })
            .unwrap_or(false);

        if !self.objects_descriptors.is_empty() && !empty_scene && consistent && dims_match {
            detection_info.success = true;

            let start = Instant::now();
            let scene_descriptors = std::mem::take(&mut detection_info.scene_descriptors);
            let indexing_ms =
                stage.run(&mut self.vocabulary, &scene_descriptors, &mut detection_info)?;
            detection_info.scene_descriptors = scene_descriptors;
            detection_info.timing.indexing_ms = indexing_ms;
            detection_info.timing.matching_ms = ms(start) - indexing_ms;

            if self.settings.homography.homography_computed {
                let start = Instant::now();
                let scene_points = keypoints_to_points(&detection_info.scene_keypoints);
                let scene_size = Size::new(gray.cols(), gray.rows());
                let (detections, rejected) = homography::run(
                    &self.settings,
                    &self.library,
                    &detection_info.matches,
                    &scene_points,
                    scene_size,
                )?;
                detection_info.detections = detections;
                detection_info.rejected = rejected;
                detection_info.timing.homography_ms = ms(start);
            }
        } else if !self.objects_descriptors.is_empty() && !empty_scene {
            warn!("cannot search, objects must be updated");
        } else if empty_scene {
            warn!("no features detected in the scene");
            detection_info.success = true;
        }

        detection_info.timing.total_ms = ms(total);
        Ok(detection_info)
    }

    /// Run [`detect`] and publish the result on the event channel when
    /// something was found (or unconditionally with
    /// `send_no_obj_detected_events`).
    ///
    /// [`detect`]: Detector::detect
    pub fn detect_and_publish(&mut self, image: &Mat) -> Result<DetectionInfo> {
        let detection_info = self.detect(image)?;

        match detection_info.detections.len() {
            0 if self.settings.general.send_no_obj_detected_events => {
                info!("no objects detected ({:.0} ms)", detection_info.timing.total_ms)
            }
            0 => {}
            1 => info!(
                "object {} detected ({:.0} ms)",
                detection_info.detections[0].object_id, detection_info.timing.total_ms
            ),
            n => info!("{} objects detected ({:.0} ms)", n, detection_info.timing.total_ms),
        }

        if !detection_info.detections.is_empty()
            || self.settings.general.send_no_obj_detected_events
        {
            if let Some(tx) = &self.detections_tx {
                let _ = tx.send(detection_info.clone());
            }
        }
        Ok(detection_info)
    }
}

fn to_grayscale(image: &Mat) -> Result<Mat> {
    if image.channels() != 1 || image.depth() != core::CV_8U {
        let mut gray = Mat::default();
        imgproc::cvt_color_def(image, &mut gray, imgproc::COLOR_BGR2GRAY)?;
        Ok(gray)
    } else {
        Ok(image.try_clone()?)
    }
}

/// One per-object feature extraction job. Each worker builds its own
/// extractor from the shared settings.
struct ExtractTask {
    object_id: i32,
    image: Mat,
    settings: Settings,
}

struct ExtractOutput {
    object_id: i32,
    features: FeatureSet,
}

// SAFETY: the task owns its image and the output owns its keypoints and
// descriptors; nothing is shared while a batch is in flight. The raw
// pointers inside the OpenCV handles are plain heap data moved across the
// thread boundary, never aliased.
unsafe impl Send for ExtractTask {}
unsafe impl Send for ExtractOutput {}

impl ExtractTask {
    fn run(self) -> Result<ExtractOutput> {
        let start = Instant::now();
        let mut extractor = FeatureExtractor::new(&self.settings)?;
        let features = extractor.extract(&self.image, self.settings.feature2d.max_features)?;
        if features.keypoints.is_empty() {
            warn!("no features detected in object {}", self.object_id);
        } else {
            info!(
                "object {}: {} descriptors extracted ({:.0} ms)",
                self.object_id,
                features.descriptors.rows(),
                ms(start)
            );
        }
        Ok(ExtractOutput { object_id: self.object_id, features })
    }
}
