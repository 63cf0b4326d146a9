//! Per-candidate homography fitting and geometric validation.
//!
//! Each candidate (one object's correspondence set) is fitted with a robust
//! planar homography. Fits run in parallel batches; validation of the mapped
//! rectangle (bounds, corner angles, superposition, visibility) runs on the
//! control thread, where multi-detection may append new candidates built
//! from a detection's outliers.

use std::collections::BTreeMap;

use anyhow::{anyhow, Result};
use nalgebra::Matrix3;
use opencv::calib3d;
use opencv::core::{Mat, Point2f, Rect, Size, Vector};
use opencv::prelude::*;
use tracing::debug;

use crate::detection::info::{Detection, MatchPairs, RejectedCandidate, RejectedCode};
use crate::library::ObjectLibrary;
use crate::settings::Settings;

struct Candidate {
    object_id: i32,
    pairs: MatchPairs,
}

struct FitOutcome {
    object_id: i32,
    code: RejectedCode,
    homography: Option<Matrix3<f64>>,
    inliers: MatchPairs,
    outliers: MatchPairs,
}

/// Run the homography stage over all per-object match sets.
///
/// Returns accepted detections and rejected candidates, both in candidate
/// order (library id order, with multi-detection re-queues appended).
pub(crate) fn run(
    settings: &Settings,
    library: &ObjectLibrary,
    matches: &BTreeMap<i32, MatchPairs>,
    scene_points: &[Point2f],
    scene_size: Size,
) -> Result<(Vec<Detection>, Vec<RejectedCandidate>)> {
    // Keypoint coordinates per object, extracted once so fit workers only
    // see plain data.
    let object_points: BTreeMap<i32, Vec<Point2f>> = library
        .iter()
        .map(|(&id, sig)| (id, crate::features::keypoints_to_points(sig.keypoints())))
        .collect();

    let mut candidates: Vec<Candidate> = matches
        .iter()
        .map(|(&object_id, pairs)| Candidate { object_id, pairs: pairs.clone() })
        .collect();

    let mut detections = Vec::new();
    let mut rejected = Vec::new();

    // The candidate list grows while multi-detection is re-queueing, so the
    // bound is re-read every batch.
    let mut next = 0;
    while next < candidates.len() {
        let batch = settings.batch_size(candidates.len() - next);
        let end = (next + batch).min(candidates.len());

        let outcomes: Vec<Result<FitOutcome>> = std::thread::scope(|scope| {
            let handles: Vec<_> = candidates[next..end]
                .iter()
                .map(|candidate| {
                    let obj_pts = object_points.get(&candidate.object_id).map(Vec::as_slice);
                    scope.spawn(move || fit_candidate(candidate, obj_pts, scene_points, settings))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| h.join().unwrap_or_else(|_| Err(anyhow!("homography worker panicked"))))
                .collect()
        });
        next = end;

        for outcome in outcomes {
            let outcome = outcome?;
            validate(
                outcome,
                settings,
                library,
                scene_size,
                &mut candidates,
                &mut detections,
                &mut rejected,
            );
        }
    }

    Ok((detections, rejected))
}

/// Fit one candidate: correspondence gathering, robust fit, inlier
/// partition, all-inlier degeneracy check.
fn fit_candidate(
    candidate: &Candidate,
    object_points: Option<&[Point2f]>,
    scene_points: &[Point2f],
    settings: &Settings,
) -> Result<FitOutcome> {
    let mut outcome = FitOutcome {
        object_id: candidate.object_id,
        code: RejectedCode::Undef,
        homography: None,
        inliers: MatchPairs::new(),
        outliers: MatchPairs::new(),
    };

    if candidate.pairs.len() < settings.homography.minimum_inliers as usize {
        outcome.code = RejectedCode::LowMatches;
        return Ok(outcome);
    }
    let object_points = object_points.unwrap_or(&[]);

    let mut src = Vector::<Point2f>::new();
    let mut dst = Vector::<Point2f>::new();
    for &(obj_idx, scene_idx) in &candidate.pairs {
        let (Some(op), Some(sp)) =
            (object_points.get(obj_idx as usize), scene_points.get(scene_idx as usize))
        else {
            outcome.code = RejectedCode::LowMatches;
            return Ok(outcome);
        };
        src.push(*op);
        dst.push(*sp);
    }

    let mut mask = Mat::default();
    let homography = match calib3d::find_homography(
        &src,
        &dst,
        &mut mask,
        settings.homography.method.to_opencv(),
        settings.homography.ransac_reproj_thr,
    ) {
        Ok(h) => h,
        Err(e) => {
            debug!("object {}: homography fit failed: {e}", candidate.object_id);
            Mat::default()
        }
    };

    for (k, &pair) in candidate.pairs.iter().enumerate() {
        let inlier = mask.at::<u8>(k as i32).map(|&v| v != 0).unwrap_or(false);
        if inlier {
            outcome.inliers.push(pair);
        } else {
            outcome.outliers.push(pair);
        }
    }

    if !homography.empty() {
        if outcome.inliers.len() == candidate.pairs.len()
            && (settings.homography.ignore_when_all_inliers
                || opencv::core::count_non_zero(&homography)? < 1)
        {
            outcome.code = RejectedCode::AllInliers;
        } else {
            outcome.homography = Some(mat_to_matrix3(&homography)?);
        }
    }

    Ok(outcome)
}

/// Geometric validation and accept/reject bookkeeping for one fit outcome.
fn validate(
    outcome: FitOutcome,
    settings: &Settings,
    library: &ObjectLibrary,
    scene_size: Size,
    candidates: &mut Vec<Candidate>,
    detections: &mut Vec<Detection>,
    rejected: &mut Vec<RejectedCandidate>,
) {
    let FitOutcome { object_id, mut code, homography, inliers, outliers } = outcome;

    if code == RejectedCode::Undef
        && (homography.is_none() || inliers.len() < settings.homography.minimum_inliers as usize)
    {
        code = RejectedCode::LowInliers;
    }

    if code == RejectedCode::Undef {
        if let Some(homography) = homography {
            let signature = library.get(object_id);
            let rect = signature.map(|s| s.rect()).unwrap_or_else(|| Rect::new(0, 0, 0, 0));
            let corners = mapped_corners(&homography, &rect);

            if !corners_within_bounds(&corners, scene_size) {
                code = RejectedCode::NotValid;
            }

            if code == RejectedCode::Undef
                && settings.homography.min_angle > 0
                && !corner_angles_ok(&corners, settings.homography.min_angle as f64)
            {
                code = RejectedCode::ByAngle;
            }

            if code == RejectedCode::Undef && settings.general.multi_detection {
                let radius = settings.general.multi_detection_radius as f64;
                let too_close = detections
                    .iter()
                    .filter(|d| d.object_id == object_id)
                    .map(|d| {
                        let dx = d.homography[(0, 2)] - homography[(0, 2)];
                        let dy = d.homography[(1, 2)] - homography[(1, 2)];
                        (dx * dx + dy * dy).sqrt()
                    })
                    .any(|dist| dist < radius);
                if too_close {
                    code = RejectedCode::Superposed;
                } else {
                    // Accepted instance: look for another one among its
                    // outliers.
                    candidates.push(Candidate { object_id, pairs: outliers.clone() });
                }
            }

            if code == RejectedCode::Undef && settings.homography.all_corners_visible {
                let within = corners.iter().all(|&(x, y)| {
                    x >= 0.0
                        && x <= scene_size.width as f64
                        && y >= 0.0
                        && y <= scene_size.height as f64
                });
                if !within {
                    code = RejectedCode::CornersOutside;
                }
            }

            if code == RejectedCode::Undef {
                detections.push(Detection {
                    object_id,
                    homography,
                    object_size: rect.size(),
                    inliers,
                    outliers,
                    filename: signature.map(|s| s.filename().to_string()).unwrap_or_default(),
                });
                return;
            }
        }
    }

    rejected.push(RejectedCandidate { object_id, code, inliers, outliers });
}

/// Object rectangle corners mapped through the homography, with perspective
/// divide. Order: top-left, top-right, bottom-right, bottom-left.
fn mapped_corners(h: &Matrix3<f64>, rect: &Rect) -> [(f64, f64); 4] {
    let (w, ht) = (rect.width as f64, rect.height as f64);
    [
        project(h, 0.0, 0.0),
        project(h, w, 0.0),
        project(h, w, ht),
        project(h, 0.0, ht),
    ]
}

fn project(h: &Matrix3<f64>, x: f64, y: f64) -> (f64, f64) {
    let w = h[(2, 0)] * x + h[(2, 1)] * y + h[(2, 2)];
    (
        (h[(0, 0)] * x + h[(0, 1)] * y + h[(0, 2)]) / w,
        (h[(1, 0)] * x + h[(1, 1)] * y + h[(1, 2)]) / w,
    )
}

/// A corner further than one scene size outside the scene means the fit is
/// bogus.
fn corners_within_bounds(corners: &[(f64, f64); 4], scene: Size) -> bool {
    let (w, h) = (scene.width as f64, scene.height as f64);
    corners.iter().all(|&(x, y)| {
        x.is_finite()
            && y.is_finite()
            && x >= -w
            && x <= 2.0 * w
            && y >= -h
            && y <= 2.0 * h
    })
}

/// Every consecutive-edge angle must stay in `[min_angle, 180 - min_angle]`
/// degrees.
fn corner_angles_ok(corners: &[(f64, f64); 4], min_angle: f64) -> bool {
    for a in 0..4 {
        let p0 = corners[a];
        let p1 = corners[(a + 1) % 4];
        let p2 = corners[(a + 2) % 4];
        let ab = (p1.0 - p0.0, p1.1 - p0.1);
        let cb = (p2.0 - p1.0, p2.1 - p1.1);
        let na = (ab.0 * ab.0 + ab.1 * ab.1).sqrt();
        let nb = (cb.0 * cb.0 + cb.1 * cb.1).sqrt();
        if na == 0.0 || nb == 0.0 {
            return false;
        }
        let cos = ((ab.0 * cb.0 + ab.1 * cb.1) / (na * nb)).clamp(-1.0, 1.0);
        let angle = cos.acos().to_degrees();
        if angle < min_angle || angle > 180.0 - min_angle {
            return false;
        }
    }
    true
}

fn mat_to_matrix3(mat: &Mat) -> Result<Matrix3<f64>> {
    let mut out = Matrix3::zeros();
    for r in 0..3 {
        for c in 0..3 {
            out[(r as usize, c as usize)] = *mat.at_2d::<f64>(r, c)?;
        }
    }
    Ok(out)
}
