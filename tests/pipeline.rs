//! End-to-end pipeline tests on synthetic images.
//!
//! Objects are deterministic textured patches; scenes are built by pasting
//! patches at known offsets, so the expected homography is a pure
//! translation and exact-duplicate descriptors guarantee zero-distance
//! matches.

use std::path::PathBuf;

use opencv::core::{Mat, Scalar, Vector, CV_8UC1};
use opencv::imgcodecs;
use opencv::prelude::*;

use planar_detect::detection::{Detector, RejectedCode};
use planar_detect::settings::Settings;

/// Deterministic blocky texture; strong corners for the feature detector.
fn textured_patch(width: i32, height: i32, seed: u32) -> Mat {
    let mut image =
        Mat::new_rows_cols_with_default(height, width, CV_8UC1, Scalar::all(0.0)).unwrap();
    let mut state = seed.wrapping_mul(2654435761).max(1);
    let block = 5;
    for by in 0..(height + block - 1) / block {
        for bx in 0..(width + block - 1) / block {
            state = state.wrapping_mul(1664525).wrapping_add(1013904223);
            let value = (state >> 24) as u8;
            for y in (by * block)..((by + 1) * block).min(height) {
                for x in (bx * block)..((bx + 1) * block).min(width) {
                    *image.at_2d_mut::<u8>(y, x).unwrap() = value;
                }
            }
        }
    }
    image
}

fn paste(scene: &mut Mat, patch: &Mat, x0: i32, y0: i32) {
    for y in 0..patch.rows() {
        for x in 0..patch.cols() {
            *scene.at_2d_mut::<u8>(y0 + y, x0 + x).unwrap() = *patch.at_2d::<u8>(y, x).unwrap();
        }
    }
}

fn scene_with(patch: &Mat, positions: &[(i32, i32)], width: i32, height: i32) -> Mat {
    let mut scene =
        Mat::new_rows_cols_with_default(height, width, CV_8UC1, Scalar::all(96.0)).unwrap();
    for &(x, y) in positions {
        paste(&mut scene, patch, x, y);
    }
    scene
}

/// ORB everywhere, serial, no match criteria: every scene descriptor pairs
/// with its nearest word and RANSAC does the pruning.
fn e2e_settings() -> Settings {
    let mut settings = Settings::default();
    settings.general.threads = 1;
    settings.general.inverted_search = true;
    settings.general.vocabulary_incremental = false;
    settings.nearest_neighbor.nndr_ratio_used = false;
    settings.nearest_neighbor.min_distance_used = false;
    settings.homography.minimum_inliers = 8;
    settings
}

fn temp_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("planar-detect-{}-{}", name, std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn load_objects_assigns_ids_from_stems() {
    let dir = temp_dir("load");
    for (name, seed) in [("1.png", 11), ("2.png", 22), ("foo.png", 33)] {
        let patch = textured_patch(120, 90, seed);
        imgcodecs::imwrite(dir.join(name).to_str().unwrap(), &patch, &Vector::new()).unwrap();
    }

    let mut detector = Detector::new(e2e_settings());
    let loaded = detector.load_objects(&dir).unwrap();
    assert_eq!(loaded, 3);

    // "1.png" and "2.png" propose their stems; "foo.png" is auto-assigned.
    assert_eq!(detector.library().ids(), vec![1, 2, 3]);
    assert_eq!(detector.settings().general.next_obj_id, 4);

    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn detects_translated_copy_with_identity_homography() {
    let patch = textured_patch(200, 150, 7);
    let (dx, dy) = (180, 120);
    let scene = scene_with(&patch, &[(dx, dy)], 640, 480);

    let mut detector = Detector::new(e2e_settings());
    let id = detector.add_object(patch, 0, "patch.png").unwrap();
    detector.update_objects().unwrap();
    detector.update_vocabulary().unwrap();

    let info = detector.detect(&scene).unwrap();
    assert!(info.success);
    assert!(
        info.matches[&id].len() >= 50,
        "expected at least 50 matches, got {}",
        info.matches[&id].len()
    );

    assert_eq!(info.detections.len(), 1);
    let detection = &info.detections[0];
    assert_eq!(detection.object_id, id);
    assert!(detection.inliers.len() >= 8);

    // Pure translation: the homography is close to identity plus offset.
    let h = &detection.homography;
    assert!((h[(0, 2)] - dx as f64).abs() < 5.0, "tx = {}", h[(0, 2)]);
    assert!((h[(1, 2)] - dy as f64).abs() < 5.0, "ty = {}", h[(1, 2)]);
    assert!((h[(0, 0)] - 1.0).abs() < 0.1);
    assert!((h[(1, 1)] - 1.0).abs() < 0.1);
}

#[test]
fn non_inverted_serial_search_finds_the_object() {
    let patch = textured_patch(200, 150, 19);
    let scene = scene_with(&patch, &[(100, 80)], 640, 480);

    let mut settings = e2e_settings();
    settings.general.inverted_search = false;
    settings.general.threads = 1;

    let mut detector = Detector::new(settings);
    let id = detector.add_object(patch, 0, "patch.png").unwrap();
    detector.update_objects().unwrap();
    detector.update_vocabulary().unwrap();

    let info = detector.detect(&scene).unwrap();
    assert!(info.success);
    assert_eq!(info.detections.len(), 1);
    assert_eq!(info.detections[0].object_id, id);
    let h = &info.detections[0].homography;
    assert!((h[(0, 2)] - 100.0).abs() < 5.0);
    assert!((h[(1, 2)] - 80.0).abs() < 5.0);
}

#[test]
fn non_inverted_parallel_search_matches_serial() {
    let patch_a = textured_patch(200, 150, 3);
    let patch_b = textured_patch(180, 140, 101);
    let scene = scene_with(&patch_a, &[(60, 50)], 640, 480);

    let mut settings = e2e_settings();
    settings.general.inverted_search = false;
    settings.general.threads = 4;

    let mut detector = Detector::new(settings);
    let id_a = detector.add_object(patch_a, 0, "a.png").unwrap();
    let _id_b = detector.add_object(patch_b, 0, "b.png").unwrap();
    detector.update_objects().unwrap();
    detector.update_vocabulary().unwrap();

    let info = detector.detect(&scene).unwrap();
    assert!(info.success);
    assert_eq!(info.detections.len(), 1);
    assert_eq!(info.detections[0].object_id, id_a);
}

#[test]
fn high_minimum_inliers_rejects_with_low_matches() {
    let patch = textured_patch(200, 150, 7);
    let scene = scene_with(&patch, &[(100, 100)], 640, 480);

    let mut settings = e2e_settings();
    settings.homography.minimum_inliers = 1000;

    let mut detector = Detector::new(settings);
    let id = detector.add_object(patch, 0, "patch.png").unwrap();
    detector.update_objects().unwrap();
    detector.update_vocabulary().unwrap();

    let info = detector.detect(&scene).unwrap();
    assert!(info.success);
    assert!(info.detections.is_empty());
    let rejection = info.rejected.iter().find(|r| r.object_id == id).unwrap();
    assert_eq!(rejection.code, RejectedCode::LowMatches);
}

#[test]
fn multi_detection_finds_both_distant_copies() {
    let patch = textured_patch(200, 150, 7);
    // Two instances 500 px apart.
    let scene = scene_with(&patch, &[(50, 100), (550, 100)], 1100, 400);

    let mut settings = e2e_settings();
    settings.general.multi_detection = true;
    settings.general.multi_detection_radius = 50;
    settings.feature2d.max_features = 0;
    if let planar_detect::settings::FeatureKind::Orb(orb) = &mut settings.feature2d.extractor {
        orb.n_features = 1500;
    }

    let mut detector = Detector::new(settings);
    let id = detector.add_object(patch, 0, "patch.png").unwrap();
    detector.update_objects().unwrap();
    detector.update_vocabulary().unwrap();

    let info = detector.detect(&scene).unwrap();
    assert!(info.success);
    assert_eq!(info.detections.len(), 2, "expected both instances accepted");
    assert!(info.detections.iter().all(|d| d.object_id == id));

    let mut txs: Vec<f64> = info.detections.iter().map(|d| d.homography[(0, 2)]).collect();
    txs.sort_by(|a, b| a.total_cmp(b));
    assert!((txs[0] - 50.0).abs() < 10.0);
    assert!((txs[1] - 550.0).abs() < 10.0);
}

#[test]
fn multi_detection_radius_superposes_second_copy() {
    let patch = textured_patch(200, 150, 7);
    let scene = scene_with(&patch, &[(50, 100), (550, 100)], 1100, 400);

    let mut settings = e2e_settings();
    settings.general.multi_detection = true;
    // Both instances fall inside one radius: only one can be accepted.
    settings.general.multi_detection_radius = 1000;
    if let planar_detect::settings::FeatureKind::Orb(orb) = &mut settings.feature2d.extractor {
        orb.n_features = 1500;
    }

    let mut detector = Detector::new(settings);
    let id = detector.add_object(patch, 0, "patch.png").unwrap();
    detector.update_objects().unwrap();
    detector.update_vocabulary().unwrap();

    let info = detector.detect(&scene).unwrap();
    assert!(info.success);
    assert_eq!(info.detections.len(), 1);
    assert!(info
        .rejected
        .iter()
        .any(|r| r.object_id == id && r.code == RejectedCode::Superposed));
}

#[test]
fn mode_switch_without_rebuild_skips_matching() {
    let patch = textured_patch(200, 150, 7);
    let scene = scene_with(&patch, &[(100, 100)], 640, 480);

    let mut detector = Detector::new(e2e_settings());
    detector.add_object(patch, 0, "patch.png").unwrap();
    detector.update_objects().unwrap();
    detector.update_vocabulary().unwrap();

    assert!(detector.detect(&scene).unwrap().success);

    // The vocabulary still holds library words; the gate must refuse to
    // search it in non-inverted mode.
    detector.settings_mut().general.inverted_search = false;
    let info = detector.detect(&scene).unwrap();
    assert!(!info.success);
    assert!(info.detections.is_empty());
}

#[test]
fn empty_scene_accepts_with_no_detections() {
    let patch = textured_patch(200, 150, 7);
    // A uniform image yields no keypoints.
    let scene = Mat::new_rows_cols_with_default(480, 640, CV_8UC1, Scalar::all(128.0)).unwrap();

    let mut detector = Detector::new(e2e_settings());
    detector.add_object(patch, 0, "patch.png").unwrap();
    detector.update_objects().unwrap();
    detector.update_vocabulary().unwrap();

    let info = detector.detect(&scene).unwrap();
    assert!(info.success);
    assert!(info.detections.is_empty());
    assert!(info.matches.values().all(|pairs| pairs.is_empty()));
}

#[test]
fn detection_events_are_published() {
    let patch = textured_patch(200, 150, 7);
    let scene = scene_with(&patch, &[(100, 100)], 640, 480);

    let mut detector = Detector::new(e2e_settings());
    let events = detector.detection_events();
    detector.add_object(patch, 0, "patch.png").unwrap();
    detector.update_objects().unwrap();
    detector.update_vocabulary().unwrap();

    detector.detect_and_publish(&scene).unwrap();
    let event = events.try_recv().expect("a detection event");
    assert_eq!(event.detections.len(), 1);

    // Without send_no_obj_detected_events an empty result stays silent.
    let blank = Mat::new_rows_cols_with_default(480, 640, CV_8UC1, Scalar::all(128.0)).unwrap();
    detector.detect_and_publish(&blank).unwrap();
    assert!(events.try_recv().is_err());
}
