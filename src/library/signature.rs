//! A registered reference object and its extracted feature data.

use opencv::core::{KeyPoint, Mat, Rect, Vector};
use opencv::prelude::*;
use tracing::error;

use crate::vocabulary::Words;

/// One reference object: grayscale image, extracted features, and the word
/// assignments produced by the vocabulary build.
///
/// Signatures are exclusively owned by the [`ObjectLibrary`]; everything
/// downstream refers to them by id and integer keypoint indices.
///
/// [`ObjectLibrary`]: crate::library::ObjectLibrary
pub struct ObjSignature {
    id: i32,
    image: Mat,
    filename: String,
    keypoints: Vector<KeyPoint>,
    descriptors: Mat,
    words: Words,
}

impl ObjSignature {
    pub fn new(id: i32, image: Mat, filename: impl Into<String>) -> Self {
        Self {
            id,
            image,
            filename: filename.into(),
            keypoints: Vector::new(),
            descriptors: Mat::default(),
            words: Words::new(),
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: i32) {
        self.id = id;
    }

    pub fn image(&self) -> &Mat {
        &self.image
    }

    pub fn filename(&self) -> &str {
        &self.filename
    }

    pub fn keypoints(&self) -> &Vector<KeyPoint> {
        &self.keypoints
    }

    pub fn descriptors(&self) -> &Mat {
        &self.descriptors
    }

    pub fn words(&self) -> &Words {
        &self.words
    }

    pub fn set_words(&mut self, words: Words) {
        self.words = words;
    }

    /// Axis-aligned bounding rectangle of the object image.
    pub fn rect(&self) -> Rect {
        Rect::new(0, 0, self.image.cols(), self.image.rows())
    }

    /// True once features have been extracted (or extraction found nothing).
    pub fn has_features(&self) -> bool {
        !self.keypoints.is_empty() || !self.descriptors.empty()
    }

    /// Store extraction output. The descriptor row count must equal the
    /// keypoint count whenever descriptors are present.
    pub fn set_data(&mut self, keypoints: Vector<KeyPoint>, descriptors: Mat) {
        if !descriptors.empty() && keypoints.len() as i32 != descriptors.rows() {
            error!(
                "object {}: {} keypoints but {} descriptor rows",
                self.id,
                keypoints.len(),
                descriptors.rows()
            );
        }
        self.keypoints = keypoints;
        self.descriptors = descriptors;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::CV_8UC1;

    #[test]
    fn rect_tracks_image_size() {
        let image = Mat::new_rows_cols_with_default(
            48,
            64,
            CV_8UC1,
            opencv::core::Scalar::all(0.0),
        )
        .unwrap();
        let sig = ObjSignature::new(3, image, "3.png");
        let rect = sig.rect();
        assert_eq!((rect.width, rect.height), (64, 48));
        assert!(!sig.has_features());
    }

    #[test]
    fn set_data_keeps_rows_aligned() {
        let sig_image = Mat::default();
        let mut sig = ObjSignature::new(1, sig_image, "1.png");
        let mut kps = Vector::<KeyPoint>::new();
        kps.push(KeyPoint::new_coords(1.0, 2.0, 7.0, -1.0, 0.5, 0, -1).unwrap());
        kps.push(KeyPoint::new_coords(3.0, 4.0, 7.0, -1.0, 0.4, 0, -1).unwrap());
        let descs = Mat::from_slice_2d(&[vec![1.0f32, 0.0], vec![0.0f32, 1.0]]).unwrap();
        sig.set_data(kps, descs);
        assert_eq!(sig.keypoints().len() as i32, sig.descriptors().rows());
        assert!(sig.has_features());
    }
}
