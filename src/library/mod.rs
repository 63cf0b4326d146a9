//! The object library: id-ordered storage of reference objects.

pub mod signature;

pub use signature::ObjSignature;

use std::cmp::Ordering;
use std::collections::btree_map;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

/// Reference objects keyed by id. Iteration is always in ascending id order,
/// which fixes the reduction order of every parallel stage downstream.
#[derive(Default)]
pub struct ObjectLibrary {
    objects: BTreeMap<i32, ObjSignature>,
}

impl ObjectLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn contains(&self, id: i32) -> bool {
        self.objects.contains_key(&id)
    }

    pub fn get(&self, id: i32) -> Option<&ObjSignature> {
        self.objects.get(&id)
    }

    pub fn get_mut(&mut self, id: i32) -> Option<&mut ObjSignature> {
        self.objects.get_mut(&id)
    }

    /// Insert a signature under its own id. Ids must be unique and positive.
    pub fn insert(&mut self, signature: ObjSignature) -> Result<()> {
        if signature.id() <= 0 {
            bail!("object id must be positive, got {}", signature.id());
        }
        if self.objects.contains_key(&signature.id()) {
            bail!("object {} already in the library", signature.id());
        }
        self.objects.insert(signature.id(), signature);
        Ok(())
    }

    pub fn remove(&mut self, id: i32) -> Option<ObjSignature> {
        self.objects.remove(&id)
    }

    pub fn clear(&mut self) {
        self.objects.clear();
    }

    pub fn ids(&self) -> Vec<i32> {
        self.objects.keys().copied().collect()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, i32, ObjSignature> {
        self.objects.iter()
    }

    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, i32, ObjSignature> {
        self.objects.iter_mut()
    }
}

/// List image files in `dir` whose extension matches one of `extensions`
/// (lowercase, no dot), sorted in natural name order ("2.png" before
/// "10.png").
pub fn list_images(dir: &Path, extensions: &[String]) -> Result<Vec<PathBuf>> {
    let entries = std::fs::read_dir(dir)
        .with_context(|| format!("reading object directory {}", dir.display()))?;

    let mut files: Vec<PathBuf> = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_lowercase())
            .unwrap_or_default();
        if extensions.iter().any(|e| *e == ext) {
            files.push(path);
        }
    }

    files.sort_by(|a, b| {
        natural_cmp(
            a.file_name().and_then(|n| n.to_str()).unwrap_or(""),
            b.file_name().and_then(|n| n.to_str()).unwrap_or(""),
        )
    });
    Ok(files)
}

/// Natural-order comparison: maximal digit runs compare numerically,
/// everything else bytewise.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut ca = a.chars().peekable();
    let mut cb = b.chars().peekable();

    loop {
        match (ca.peek().copied(), cb.peek().copied()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => {
                if x.is_ascii_digit() && y.is_ascii_digit() {
                    let na = take_number(&mut ca);
                    let nb = take_number(&mut cb);
                    match na.cmp(&nb) {
                        Ordering::Equal => {}
                        other => return other,
                    }
                } else {
                    match x.cmp(&y) {
                        Ordering::Equal => {
                            ca.next();
                            cb.next();
                        }
                        other => return other,
                    }
                }
            }
        }
    }
}

fn take_number(chars: &mut std::iter::Peekable<std::str::Chars<'_>>) -> u64 {
    let mut value: u64 = 0;
    while let Some(c) = chars.peek().copied() {
        if let Some(d) = c.to_digit(10) {
            value = value.saturating_mul(10).saturating_add(d as u64);
            chars.next();
        } else {
            break;
        }
    }
    value
}

/// Candidate object id from a filename: a stem that parses to a positive
/// integer proposes that id, anything else asks for auto-assignment (0).
pub fn id_from_filename(path: &Path) -> i32 {
    path.file_stem()
        .and_then(|s| s.to_str())
        .and_then(|s| s.parse::<i32>().ok())
        .filter(|id| *id > 0)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::Mat;

    #[test]
    fn natural_order_sorts_numbers_numerically() {
        let mut names = vec!["10.png", "2.png", "img3.png", "1.png"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["1.png", "2.png", "10.png", "img3.png"]);
    }

    #[test]
    fn id_parsing_from_stems() {
        assert_eq!(id_from_filename(Path::new("/tmp/12.png")), 12);
        assert_eq!(id_from_filename(Path::new("/tmp/foo.png")), 0);
        assert_eq!(id_from_filename(Path::new("/tmp/-4.png")), 0);
        assert_eq!(id_from_filename(Path::new("/tmp/0.png")), 0);
    }

    #[test]
    fn insert_rejects_duplicates_and_bad_ids() {
        let mut lib = ObjectLibrary::new();
        lib.insert(ObjSignature::new(5, Mat::default(), "5.png")).unwrap();
        assert!(lib.insert(ObjSignature::new(5, Mat::default(), "dup.png")).is_err());
        assert!(lib.insert(ObjSignature::new(0, Mat::default(), "zero.png")).is_err());
        assert_eq!(lib.ids(), vec![5]);
    }

    #[test]
    fn iteration_is_id_ordered() {
        let mut lib = ObjectLibrary::new();
        for id in [9, 1, 4] {
            lib.insert(ObjSignature::new(id, Mat::default(), format!("{id}.png"))).unwrap();
        }
        assert_eq!(lib.ids(), vec![1, 4, 9]);
    }
}
