//! Visual vocabulary: a descriptor index with an incremental front.
//!
//! The vocabulary quantizes descriptors into integer words. Because the FLANN
//! index cannot grow in place, descriptors live in two blocks: the
//! `indexed` block covered by the built index, and a `staging` block of rows
//! appended since the last [`Vocabulary::update`]. Word ids are dense over
//! both blocks: row `r` of the indexed block is word `r`, and the k-th
//! staging row is word `indexed.rows + k`.
//!
//! `word_to_objects` records which library objects contributed each word.
//! When the vocabulary is built over a scene instead (non-inverted search),
//! the recorded object id is -1; the two modes never mix.

use std::cell::UnsafeCell;
use std::collections::BTreeMap;

use anyhow::{Context, Result};
use opencv::core::{self, Mat, Vector};
use opencv::flann::{
    Index, KDTreeIndexParams, LinearIndexParams, LshIndexParams, SearchParams,
};
use opencv::prelude::*;

use crate::settings::{IndexKind, Settings};

/// Word id -> list of indices, insertion order preserved per word.
pub type Words = BTreeMap<i32, Vec<i32>>;

/// A built FLANN index over a fixed descriptor matrix.
///
/// `knnSearch` is logically read-only but the C++ method is not `const`, so
/// the binding wants `&mut Index`. The index is kept behind an `UnsafeCell`
/// to expose searching through `&self`.
pub struct SearchIndex {
    inner: UnsafeCell<Index>,
}

// SAFETY: after construction the index is only ever used through
// `knn_search`, which reads the tree and writes caller-owned output
// matrices. Rebuilds create a fresh SearchIndex under `&mut Vocabulary`,
// which the borrow checker serializes against all searches.
unsafe impl Send for SearchIndex {}
unsafe impl Sync for SearchIndex {}

impl SearchIndex {
    /// Build an index over `descriptors` with the configured structure and
    /// distance type.
    pub fn build(descriptors: &Mat, settings: &Settings) -> Result<Self> {
        let dist = settings.flann_distance();
        let index = match settings.index_kind() {
            IndexKind::Linear | IndexKind::Auto => {
                Index::new(descriptors, &LinearIndexParams::new()?, dist)?
            }
            IndexKind::KdTree { trees } => {
                Index::new(descriptors, &KDTreeIndexParams::new(trees)?, dist)?
            }
            IndexKind::Lsh { table_number, key_size, multi_probe_level } => Index::new(
                descriptors,
                &LshIndexParams::new(table_number, key_size, multi_probe_level)?,
                dist,
            )?,
        };
        Ok(Self { inner: UnsafeCell::new(index) })
    }

    /// Build a linear (exhaustive) index; used for the staging-block scan on
    /// float descriptors.
    pub fn build_linear(descriptors: &Mat, settings: &Settings) -> Result<Self> {
        let index = Index::new(descriptors, &LinearIndexParams::new()?, settings.flann_distance())?;
        Ok(Self { inner: UnsafeCell::new(index) })
    }

    /// k-NN lookup. Distances come back as `CV_32F`; integer distance output
    /// (Hamming) is converted.
    pub fn knn_search(&self, queries: &Mat, k: i32, checks: i32) -> Result<(Mat, Mat)> {
        let mut indices = Mat::default();
        let mut dists = Mat::default();
        let params = SearchParams::new(checks, 0.0, true, false)?;
        let index = unsafe { &mut *self.inner.get() };
        index
            .knn_search(queries, &mut indices, &mut dists, k, &params)
            .context("FLANN knnSearch failed")?;
        Ok((indices, dists_as_f32(dists)?))
    }
}

/// Convert an integer distance matrix to `CV_32F`; float input passes
/// through.
fn dists_as_f32(dists: Mat) -> Result<Mat> {
    if dists.typ() == core::CV_32S {
        let mut converted = Mat::default();
        dists.convert_to(&mut converted, core::CV_32F, 1.0, 0.0)?;
        Ok(converted)
    } else {
        Ok(dists)
    }
}

/// Append the rows of `src` to `dst` (same width and element type).
pub(crate) fn append_rows(dst: &mut Mat, src: &Mat) -> Result<()> {
    if src.empty() {
        return Ok(());
    }
    if dst.empty() {
        *dst = src.try_clone()?;
        return Ok(());
    }
    assert_eq!(dst.typ(), src.typ(), "descriptor element type mismatch");
    assert_eq!(dst.cols(), src.cols(), "descriptor width mismatch");
    let mut parts = Vector::<Mat>::new();
    parts.push(std::mem::take(dst));
    parts.push(src.try_clone()?);
    core::vconcat(&parts, dst)?;
    Ok(())
}

#[derive(Default)]
pub struct Vocabulary {
    indexed_descriptors: Mat,
    not_indexed_descriptors: Mat,
    not_indexed_word_ids: Vec<i32>,
    word_to_objects: BTreeMap<i32, Vec<i32>>,
    index: Option<SearchIndex>,
}

impl Vocabulary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.indexed_descriptors = Mat::default();
        self.not_indexed_descriptors = Mat::default();
        self.not_indexed_word_ids.clear();
        self.word_to_objects.clear();
        self.index = None;
    }

    /// Total number of words (indexed + staging).
    pub fn size(&self) -> i32 {
        self.indexed_descriptors.rows() + self.not_indexed_descriptors.rows()
    }

    pub fn indexed_rows(&self) -> i32 {
        self.indexed_descriptors.rows()
    }

    pub fn staging_rows(&self) -> i32 {
        self.not_indexed_descriptors.rows()
    }

    pub fn word_to_objects(&self) -> &BTreeMap<i32, Vec<i32>> {
        &self.word_to_objects
    }

    /// Object id recorded for the very first word, if any. The matching gate
    /// uses it to tell a library vocabulary (non-negative ids) from a scene
    /// vocabulary (-1).
    pub fn first_object_id(&self) -> Option<i32> {
        self.word_to_objects.values().next().and_then(|v| v.first().copied())
    }

    /// How many times `object_id` was recorded under `word_id`.
    pub fn word_object_count(&self, word_id: i32, object_id: i32) -> usize {
        self.word_to_objects
            .get(&word_id)
            .map(|objs| objs.iter().filter(|&&o| o == object_id).count())
            .unwrap_or(0)
    }

    /// Objects recorded under `word_id`, in insertion order.
    pub fn objects_of_word(&self, word_id: i32) -> &[i32] {
        self.word_to_objects.get(&word_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Add descriptors for `object_id`, returning word id -> descriptor rows.
    ///
    /// Non-incremental: every row becomes a fresh word in the staging block.
    /// Incremental: each row is first matched (NNDR over index + staging
    /// candidates merged by distance) and only unmatched rows become new
    /// words.
    pub fn add_words(
        &mut self,
        descriptors: &Mat,
        object_id: i32,
        incremental: bool,
        settings: &Settings,
    ) -> Result<Words> {
        let mut words = Words::new();
        if descriptors.empty() {
            return Ok(words);
        }

        if incremental {
            self.add_words_incremental(descriptors, object_id, settings, &mut words)?;
        } else {
            for i in 0..descriptors.rows() {
                let word_id =
                    self.indexed_descriptors.rows() + self.not_indexed_descriptors.rows() + i;
                self.word_to_objects.entry(word_id).or_default().push(object_id);
                words.entry(word_id).or_default().push(i);
                self.not_indexed_word_ids.push(word_id);
            }
            append_rows(&mut self.not_indexed_descriptors, descriptors)?;
        }

        Ok(words)
    }

    fn add_words_incremental(
        &mut self,
        descriptors: &Mat,
        object_id: i32,
        settings: &Settings,
        words: &mut Words,
    ) -> Result<()> {
        let k = 2i32;
        let checks = settings.nearest_neighbor.search_checks;
        let ratio = settings.nearest_neighbor.nndr_ratio;

        // One batched query against the built index covers all rows.
        let global = match &self.index {
            Some(index) if self.indexed_descriptors.rows() >= k => {
                assert_eq!(self.indexed_descriptors.typ(), descriptors.typ());
                assert_eq!(self.indexed_descriptors.cols(), descriptors.cols());
                Some(index.knn_search(descriptors, k, checks)?)
            }
            _ => None,
        };

        for i in 0..descriptors.rows() {
            // Nearest candidates over both blocks, sorted by distance.
            let mut candidates: Vec<(f32, i32)> = Vec::with_capacity(2 * k as usize);

            if self.not_indexed_descriptors.rows() > 0 {
                self.scan_staging(descriptors, i, k, settings, &mut candidates)?;
            }

            if let Some((results, dists)) = &global {
                for j in 0..k {
                    let word_id = *results.at_2d::<i32>(i, j)?;
                    if word_id >= 0 {
                        candidates.push((*dists.at_2d::<f32>(i, j)?, word_id));
                    }
                }
            }

            candidates.sort_by(|a, b| a.0.total_cmp(&b.0));

            let matched = candidates.len() >= 2 && candidates[0].0 <= ratio * candidates[1].0;
            if matched {
                let word_id = candidates[0].1;
                words.entry(word_id).or_default().push(i);
                self.word_to_objects.entry(word_id).or_default().push(object_id);
            } else {
                // New word: the id is allocated before the row is appended,
                // so the k-th staging row is always word `indexed.rows + k`.
                let word_id =
                    self.indexed_descriptors.rows() + self.not_indexed_descriptors.rows();
                self.not_indexed_word_ids.push(word_id);
                append_rows(&mut self.not_indexed_descriptors, &descriptors.row(i)?.try_clone()?)?;
                words.entry(word_id).or_default().push(i);
                self.word_to_objects.entry(word_id).or_default().push(object_id);
            }
        }

        Ok(())
    }

    /// Linear scan of the staging block for row `i` of `descriptors`,
    /// appending `(distance, word id)` candidates.
    fn scan_staging(
        &self,
        descriptors: &Mat,
        i: i32,
        k: i32,
        settings: &Settings,
        candidates: &mut Vec<(f32, i32)>,
    ) -> Result<()> {
        assert_eq!(self.not_indexed_descriptors.typ(), descriptors.typ());
        assert_eq!(self.not_indexed_descriptors.cols(), descriptors.cols());

        let staging_rows = self.not_indexed_descriptors.rows();
        let query = descriptors.row(i)?.try_clone()?;

        let (results, dists) = if descriptors.typ() == core::CV_8U {
            // Binary descriptors: brute-force Hamming (Hamming-2 for ORB with
            // WTA_K 3 or 4).
            let mut results = Mat::default();
            let mut dists = Mat::default();
            core::batch_distance(
                &query,
                &self.not_indexed_descriptors,
                &mut dists,
                core::CV_32S,
                &mut results,
                settings.norm_type(),
                if staging_rows >= k { k } else { 1 },
                &core::no_array(),
                0,
                false,
            )?;
            (results, dists_as_f32(dists)?)
        } else {
            let tmp = SearchIndex::build_linear(&self.not_indexed_descriptors, settings)?;
            tmp.knn_search(
                &query,
                if staging_rows > 1 { k } else { 1 },
                settings.nearest_neighbor.search_checks,
            )?
        };

        for j in 0..results.cols() {
            let row_idx = *results.at_2d::<i32>(0, j)?;
            if row_idx >= 0 {
                candidates
                    .push((*dists.at_2d::<f32>(0, j)?, self.not_indexed_word_ids[row_idx as usize]));
            }
        }
        Ok(())
    }

    /// Fold the staging block into the indexed block and rebuild the index.
    ///
    /// The rebuild is total; there is no incremental insertion at the FLANN
    /// level, only at the vocabulary level.
    pub fn update(&mut self, settings: &Settings) -> Result<()> {
        if !self.not_indexed_descriptors.empty() {
            let staging = std::mem::take(&mut self.not_indexed_descriptors);
            append_rows(&mut self.indexed_descriptors, &staging)?;
            self.not_indexed_word_ids.clear();
        }

        if !self.indexed_descriptors.empty() {
            self.index = Some(SearchIndex::build(&self.indexed_descriptors, settings)?);
        }
        Ok(())
    }

    /// k-NN search over the indexed block.
    ///
    /// Precondition: the staging block is empty (`update` has run). Violating
    /// it is a programming error, not a runtime condition.
    pub fn search(&self, queries: &Mat, k: i32, settings: &Settings) -> Result<(Mat, Mat)> {
        assert!(
            self.not_indexed_descriptors.empty() && self.not_indexed_word_ids.is_empty(),
            "vocabulary searched with a non-empty staging block"
        );

        match &self.index {
            Some(index) if !self.indexed_descriptors.empty() => {
                assert_eq!(queries.typ(), self.indexed_descriptors.typ());
                assert_eq!(queries.cols(), self.indexed_descriptors.cols());
                index.knn_search(queries, k, settings.nearest_neighbor.search_checks)
            }
            _ => Ok((Mat::default(), Mat::default())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::{FeatureKind, SiftSettings};

    fn float_settings() -> Settings {
        let mut settings = Settings::default();
        settings.feature2d.extractor = FeatureKind::Sift(SiftSettings::default());
        settings
    }

    fn float_descriptors(rows: &[[f32; 4]]) -> Mat {
        let rows: Vec<Vec<f32>> = rows.iter().map(|r| r.to_vec()).collect();
        Mat::from_slice_2d(&rows).unwrap()
    }

    #[test]
    fn non_incremental_allocates_dense_words() {
        let settings = float_settings();
        let mut vocab = Vocabulary::new();
        let descs =
            float_descriptors(&[[0.0, 0.0, 0.0, 0.0], [10.0, 0.0, 0.0, 0.0], [0.0, 10.0, 0.0, 0.0]]);

        let words = vocab.add_words(&descs, 7, false, &settings).unwrap();

        assert_eq!(vocab.size(), 3);
        assert_eq!(vocab.staging_rows(), 3);
        for (w, rows) in &words {
            assert_eq!(rows, &vec![*w]);
        }
        assert_eq!(vocab.first_object_id(), Some(7));
        assert_eq!(vocab.objects_of_word(1), &[7]);
    }

    #[test]
    fn update_flushes_staging_and_builds_index() {
        let settings = float_settings();
        let mut vocab = Vocabulary::new();
        let descs = float_descriptors(&[
            [0.0, 0.0, 0.0, 0.0],
            [100.0, 0.0, 0.0, 0.0],
            [0.0, 100.0, 0.0, 0.0],
        ]);
        vocab.add_words(&descs, 1, false, &settings).unwrap();
        vocab.update(&settings).unwrap();

        assert_eq!(vocab.staging_rows(), 0);
        assert_eq!(vocab.indexed_rows(), 3);
        assert_eq!(vocab.indexed_rows(), vocab.size());

        let (results, dists) = vocab.search(&descs, 2, &settings).unwrap();
        assert_eq!(results.rows(), 3);
        for i in 0..3 {
            assert_eq!(*results.at_2d::<i32>(i, 0).unwrap(), i);
            assert!(*dists.at_2d::<f32>(i, 0).unwrap() < 1e-3);
        }
    }

    #[test]
    fn incremental_readd_matches_existing_words() {
        let settings = float_settings();
        let mut vocab = Vocabulary::new();
        let descs = float_descriptors(&[[0.0, 0.0, 0.0, 0.0], [100.0, 100.0, 100.0, 100.0]]);

        // First pass: nothing to match against, so both rows become words.
        let words = vocab.add_words(&descs, 1, true, &settings).unwrap();
        assert_eq!(vocab.size(), 2);
        assert_eq!(words.len(), 2);

        // Second pass: each row matches its own word at distance zero.
        let words = vocab.add_words(&descs, 2, true, &settings).unwrap();
        assert_eq!(vocab.size(), 2);
        assert_eq!(words.keys().copied().collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(vocab.objects_of_word(0), &[1, 2]);
    }

    #[test]
    fn staging_word_ids_stay_dense() {
        let settings = float_settings();
        let mut vocab = Vocabulary::new();
        let a = float_descriptors(&[[0.0, 0.0, 0.0, 0.0], [50.0, 0.0, 0.0, 0.0]]);
        vocab.add_words(&a, 1, false, &settings).unwrap();
        vocab.update(&settings).unwrap();

        let b = float_descriptors(&[[0.0, 80.0, 0.0, 0.0], [0.0, 0.0, 80.0, 0.0]]);
        vocab.add_words(&b, 2, true, &settings).unwrap();

        assert_eq!(vocab.indexed_rows(), 2);
        for (k, &w) in vocab.not_indexed_word_ids.iter().enumerate() {
            assert_eq!(w, vocab.indexed_rows() + k as i32);
        }
    }

    #[test]
    fn binary_staging_scan_uses_hamming() {
        let settings = Settings::default(); // ORB -> CV_8U, NORM_HAMMING
        let mut vocab = Vocabulary::new();
        let rows: Vec<Vec<u8>> = vec![vec![0u8; 32], vec![0xFF; 32]];
        let descs = Mat::from_slice_2d(&rows).unwrap();

        vocab.add_words(&descs, 1, true, &settings).unwrap();
        assert_eq!(vocab.size(), 2);

        // Identical rows re-quantize to the existing words.
        vocab.add_words(&descs, 3, true, &settings).unwrap();
        assert_eq!(vocab.size(), 2);
        assert_eq!(vocab.objects_of_word(0), &[1, 3]);
    }

    #[test]
    fn scene_mode_records_minus_one() {
        let settings = float_settings();
        let mut vocab = Vocabulary::new();
        let descs = float_descriptors(&[[1.0, 2.0, 3.0, 4.0]]);
        vocab.add_words(&descs, -1, false, &settings).unwrap();
        assert_eq!(vocab.first_object_id(), Some(-1));
    }

    #[test]
    fn clear_resets_everything() {
        let settings = float_settings();
        let mut vocab = Vocabulary::new();
        let descs = float_descriptors(&[[1.0, 0.0, 0.0, 0.0]]);
        vocab.add_words(&descs, 1, false, &settings).unwrap();
        vocab.update(&settings).unwrap();
        vocab.clear();
        assert_eq!(vocab.size(), 0);
        assert!(vocab.word_to_objects().is_empty());
        assert!(vocab.first_object_id().is_none());
    }
}
