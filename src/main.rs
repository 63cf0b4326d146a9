use anyhow::{bail, Context, Result};
use opencv::imgcodecs;
use tracing::{info, warn};

use planar_detect::detection::Detector;
use planar_detect::settings::Settings;

fn main() -> Result<()> {
    // Initialize tracing subscriber with environment filter
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let mut args = std::env::args().skip(1);
    let usage = "usage: planar-detect <objects-dir> <scene-image>... [--settings <file.json>]";
    let objects_dir = args.next().context(usage)?;

    let mut scenes: Vec<String> = Vec::new();
    let mut settings = Settings::default();
    while let Some(arg) = args.next() {
        if arg == "--settings" {
            let path = args.next().context("--settings needs a file argument")?;
            settings = Settings::load(&path)?;
            info!("loaded settings from {path}");
        } else {
            scenes.push(arg);
        }
    }
    if scenes.is_empty() {
        bail!(usage);
    }

    let mut detector = Detector::new(settings);
    let loaded = detector.load_objects(&objects_dir)?;
    if loaded == 0 {
        bail!("no objects loaded from {objects_dir}");
    }
    info!("loaded {loaded} objects from {objects_dir}");

    for scene_path in &scenes {
        let scene = imgcodecs::imread(scene_path, imgcodecs::IMREAD_COLOR)?;
        if scene.empty() {
            warn!("could not read scene {scene_path}, skipping");
            continue;
        }

        let result = detector.detect_and_publish(&scene)?;
        info!(
            "{}: {} detections, {} rejected, {} scene features ({:.1} ms total, \
             {:.1} ms matching, {:.1} ms homography)",
            scene_path,
            result.detections.len(),
            result.rejected.len(),
            result.scene_keypoints.len(),
            result.timing.total_ms,
            result.timing.matching_ms,
            result.timing.homography_ms,
        );

        for detection in &result.detections {
            let h = &detection.homography;
            info!(
                "  object {} ({}): {} inliers / {} outliers, translation ({:.1}, {:.1})",
                detection.object_id,
                detection.filename,
                detection.inliers.len(),
                detection.outliers.len(),
                h[(0, 2)],
                h[(1, 2)],
            );
        }
        for rejection in &result.rejected {
            if !rejection.inliers.is_empty() || !rejection.outliers.is_empty() {
                info!(
                    "  object {} rejected: {:?} ({} inliers / {} outliers)",
                    rejection.object_id,
                    rejection.code,
                    rejection.inliers.len(),
                    rejection.outliers.len(),
                );
            }
        }
    }

    Ok(())
}
