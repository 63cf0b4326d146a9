//! The two-mode nearest-neighbor matching stage.
//!
//! Inverted mode queries the scene descriptors against a vocabulary built
//! over the object library; non-inverted mode indexes the scene and queries
//! the library descriptors against it. Both directions produce the same
//! output: per-object (object descriptor index, scene keypoint index) pairs.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use opencv::core::Mat;
use opencv::prelude::*;
use tracing::warn;

use crate::detection::info::{DetectionInfo, MatchPairs};
use crate::library::ObjectLibrary;
use crate::settings::Settings;
use crate::vocabulary::{Vocabulary, Words};

/// Shared read-only inputs of the matching stage.
pub(crate) struct MatchingStage<'a> {
    pub settings: &'a Settings,
    pub library: &'a ObjectLibrary,
    /// Single concatenated matrix under key 0, or one matrix per object id.
    pub objects_descriptors: &'a BTreeMap<i32, Mat>,
    /// Concatenated-row upper bound -> owning object id.
    pub data_range: &'a BTreeMap<i32, i32>,
}

/// Accept/reject one query row given its nearest distances.
fn decide(d0: f32, d1: Option<f32>, settings: &Settings) -> bool {
    let nn = &settings.nearest_neighbor;
    let mut matched = false;
    if nn.nndr_ratio_used {
        if let Some(d1) = d1 {
            matched = d0 <= nn.nndr_ratio * d1;
        }
    }
    if (matched || !nn.nndr_ratio_used) && nn.min_distance_used {
        matched = d0 <= nn.min_distance;
    }
    if !matched && !nn.nndr_ratio_used && !nn.min_distance_used {
        // No criterion: match to the nearest descriptor.
        matched = true;
    }
    matched
}

/// Map a concatenated-matrix row to (object id, first row of that object).
fn object_of_row(data_range: &BTreeMap<i32, i32>, row: i32) -> Option<(i32, i32)> {
    let (_, &object_id) = data_range.range(row..).next()?;
    let first_row = data_range.range(..row).next_back().map(|(&upper, _)| upper + 1).unwrap_or(0);
    Some((object_id, first_row))
}

impl MatchingStage<'_> {
    /// The vocabulary must have been populated in the mode the settings ask
    /// for: library words (non-negative object ids) for inverted search, a
    /// scene vocabulary (-1) or nothing for non-inverted search.
    pub fn consistent(&self, vocabulary: &Vocabulary) -> bool {
        if self.settings.general.inverted_search {
            vocabulary.size() > 0 && vocabulary.first_object_id() != Some(-1)
        } else {
            vocabulary.size() == 0 || vocabulary.first_object_id() == Some(-1)
        }
    }

    /// Run matching; fills `info.matches` and the distance extrema, returns
    /// the time spent building the scene index (non-inverted only).
    pub fn run(
        &self,
        vocabulary: &mut Vocabulary,
        scene_descriptors: &Mat,
        info: &mut DetectionInfo,
    ) -> Result<f64> {
        for (&id, _) in self.library.iter() {
            info.matches.insert(id, MatchPairs::new());
        }

        let inverted = self.settings.general.inverted_search;
        let k = if self.settings.nearest_neighbor.nndr_ratio_used { 2 } else { 1 };

        let mut scene_words = Words::new();
        let mut indexing_ms = 0.0;
        if !inverted {
            // Index the scene. The staging block must be flushed before any
            // search, so the index is rebuilt even in incremental mode.
            let start = std::time::Instant::now();
            vocabulary.clear();
            scene_words = vocabulary.add_words(
                scene_descriptors,
                -1,
                self.settings.general.vocabulary_incremental,
                self.settings,
            )?;
            vocabulary.update(self.settings)?;
            indexing_ms = start.elapsed().as_secs_f64() * 1000.0;
        }

        if inverted || self.settings.general.threads == 1 {
            self.run_serial(vocabulary, scene_descriptors, &scene_words, k, info)?;
        } else {
            self.run_parallel(vocabulary, &scene_words, k, info)?;
        }

        Ok(indexing_ms)
    }

    fn run_serial(
        &self,
        vocabulary: &Vocabulary,
        scene_descriptors: &Mat,
        scene_words: &Words,
        k: i32,
        info: &mut DetectionInfo,
    ) -> Result<()> {
        let inverted = self.settings.general.inverted_search;
        let queries = if inverted {
            scene_descriptors
        } else {
            match self.objects_descriptors.get(&0) {
                Some(m) => m,
                None => return Ok(()),
            }
        };

        let (results, dists) = vocabulary.search(queries, k, self.settings)?;

        for i in 0..dists.rows() {
            let d0 = *dists.at_2d::<f32>(i, 0)?;
            let d1 = if k >= 2 && dists.cols() >= 2 {
                Some(*dists.at_2d::<f32>(i, 1)?)
            } else {
                None
            };
            let matched = decide(d0, d1, self.settings);
            info.record_distance(d0);
            if !matched {
                continue;
            }

            let word_id = *results.at_2d::<i32>(i, 0)?;
            if inverted {
                // A word shared within one object is ambiguous; only
                // single-occurrence (word, object) pairs contribute.
                for &object_id in vocabulary.objects_of_word(word_id) {
                    if vocabulary.word_object_count(word_id, object_id) != 1 {
                        continue;
                    }
                    let Some(signature) = self.library.get(object_id) else { continue };
                    let Some(obj_rows) = signature.words().get(&word_id) else { continue };
                    if let (Some(&obj_idx), Some(pairs)) =
                        (obj_rows.first(), info.matches.get_mut(&object_id))
                    {
                        pairs.push((obj_idx, i));
                    }
                }
            } else {
                let Some((object_id, first_row)) = object_of_row(self.data_range, i) else {
                    continue;
                };
                let scene_rows = scene_words.get(&word_id).map(Vec::as_slice).unwrap_or(&[]);
                if scene_rows.len() == 1 {
                    if let Some(pairs) = info.matches.get_mut(&object_id) {
                        pairs.push((i - first_row, scene_rows[0]));
                    }
                }
            }
        }

        Ok(())
    }

    /// Non-inverted, multi-threaded: each object's descriptor block is an
    /// independent query set against the scene vocabulary.
    fn run_parallel(
        &self,
        vocabulary: &Vocabulary,
        scene_words: &Words,
        k: i32,
        info: &mut DetectionInfo,
    ) -> Result<()> {
        let ids: Vec<i32> = self.objects_descriptors.keys().copied().collect();
        let batch = self.settings.batch_size(ids.len());

        for chunk in ids.chunks(batch) {
            let outcomes: Vec<(i32, Result<SearchOutcome>)> = std::thread::scope(|scope| {
                let handles: Vec<_> = chunk
                    .iter()
                    .map(|&id| {
                        let task = SearchTask {
                            vocabulary,
                            descriptors: &self.objects_descriptors[&id],
                            scene_words,
                            settings: self.settings,
                            k,
                        };
                        (id, scope.spawn(move || task.run()))
                    })
                    .collect();
                handles
                    .into_iter()
                    .map(|(id, h)| {
                        (id, h.join().unwrap_or_else(|_| Err(anyhow!("search worker panicked"))))
                    })
                    .collect()
            });

            // Workers finish in any order; reduction follows submission
            // (id) order.
            for (id, outcome) in outcomes {
                let outcome = outcome?;
                if outcome.min_distance != -1.0 {
                    info.record_distance(outcome.min_distance);
                }
                if outcome.max_distance != -1.0 {
                    info.record_distance(outcome.max_distance);
                }
                info.matches.insert(id, outcome.pairs);
            }
        }

        if info.min_matched_distance == -1.0 {
            warn!("matching produced no nearest-neighbor distances");
        }
        Ok(())
    }
}

struct SearchOutcome {
    pairs: MatchPairs,
    min_distance: f32,
    max_distance: f32,
}

/// One per-object search job. Workers only read: the vocabulary index is
/// search-only between rebuilds and the descriptor matrices are frozen for
/// the whole batch.
struct SearchTask<'a> {
    vocabulary: &'a Vocabulary,
    descriptors: &'a Mat,
    scene_words: &'a Words,
    settings: &'a Settings,
    k: i32,
}

// SAFETY: the OpenCV handles reached through these references (Mat, FLANN
// index) are only read while a batch is in flight; all mutation happens on
// the control thread between batches. The raw pointers inside the bindings
// are an artifact of the FFI, not shared mutable state.
unsafe impl Send for SearchTask<'_> {}
unsafe impl Sync for SearchTask<'_> {}

impl SearchTask<'_> {
    fn run(&self) -> Result<SearchOutcome> {
        let mut outcome =
            SearchOutcome { pairs: MatchPairs::new(), min_distance: -1.0, max_distance: -1.0 };

        let (results, dists) = self.vocabulary.search(self.descriptors, self.k, self.settings)?;
        for i in 0..dists.rows() {
            let d0 = *dists.at_2d::<f32>(i, 0)?;
            let d1 = if self.k >= 2 && dists.cols() >= 2 {
                Some(*dists.at_2d::<f32>(i, 1)?)
            } else {
                None
            };
            let matched = decide(d0, d1, self.settings);

            if outcome.min_distance == -1.0 || outcome.min_distance > d0 {
                outcome.min_distance = d0;
            }
            if outcome.max_distance == -1.0 || outcome.max_distance < d0 {
                outcome.max_distance = d0;
            }

            if matched {
                let word_id = *results.at_2d::<i32>(i, 0)?;
                let scene_rows =
                    self.scene_words.get(&word_id).map(Vec::as_slice).unwrap_or(&[]);
                if scene_rows.len() == 1 {
                    outcome.pairs.push((i, scene_rows[0]));
                }
            }
        }

        Ok(outcome)
    }
}
