//! Content diff between a mirror checkout and the local record store.
//!
//! Both sides are reduced to manifests (relative path -> SHA-256) so the
//! comparison never depends on timestamps or git history.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, Result};

/// Relative path (forward slashes) -> hex SHA-256.
pub type Manifest = BTreeMap<String, String>;

/// Changes needed to turn one manifest into another.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct ManifestDiff {
    pub added: Vec<String>,
    pub modified: Vec<String>,
    pub removed: Vec<String>,
}

impl ManifestDiff {
    /// Check if there are any changes.
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.modified.is_empty() || !self.removed.is_empty()
    }

    /// Get the total number of changes.
    pub fn change_count(&self) -> usize {
        self.added.len() + self.modified.len() + self.removed.len()
    }

    /// Folders touched by any change, for paths shaped `{prefix}/{folder}/...`.
    pub fn changed_folders(&self, prefix: &str) -> BTreeSet<u32> {
        self.all_paths()
            .filter_map(|path| folder_of(path, prefix))
            .collect()
    }

    /// Folders that did not exist at the destination before.
    pub fn new_folders(&self, prefix: &str, previous: &Manifest) -> BTreeSet<u32> {
        let existing: BTreeSet<u32> = previous.keys().filter_map(|p| folder_of(p, prefix)).collect();
        self.added
            .iter()
            .filter_map(|p| folder_of(p, prefix))
            .filter(|f| !existing.contains(f))
            .collect()
    }

    fn all_paths(&self) -> impl Iterator<Item = &String> {
        self.added
            .iter()
            .chain(self.modified.iter())
            .chain(self.removed.iter())
    }
}

fn folder_of(path: &str, prefix: &str) -> Option<u32> {
    let rest = path.strip_prefix(prefix)?.strip_prefix('/')?;
    rest.split('/').next()?.parse().ok()
}

/// Calculator for computing diffs between manifests.
#[derive(Debug, Clone, Default)]
pub struct DiffCalculator;

impl DiffCalculator {
    pub fn new() -> Self {
        Self
    }

    /// Calculate what changes turn `previous` into `current`.
    pub fn calculate(&self, previous: &Manifest, current: &Manifest) -> ManifestDiff {
        let mut diff = ManifestDiff::default();

        for (path, hash) in current {
            match previous.get(path) {
                None => diff.added.push(path.clone()),
                Some(old) if old != hash => diff.modified.push(path.clone()),
                Some(_) => {}
            }
        }
        diff.removed = previous
            .keys()
            .filter(|path| !current.contains_key(*path))
            .cloned()
            .collect();

        diff
    }
}

/// Convenience function to calculate diff.
pub fn calculate_diff(previous: &Manifest, current: &Manifest) -> ManifestDiff {
    DiffCalculator::new().calculate(previous, current)
}

/// Hex SHA-256 of a file's contents.
pub fn hash_file(path: &Path) -> io::Result<String> {
    let bytes = std::fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Build a manifest from `(filesystem path, manifest key)` roots.
///
/// A directory root is walked recursively with its files keyed under the
/// given key; a file root is keyed as-is. Missing roots are skipped.
pub async fn build_manifest(roots: Vec<(PathBuf, String)>) -> Result<Manifest> {
    tokio::task::spawn_blocking(move || {
        let mut manifest = Manifest::new();
        for (path, key) in roots {
            collect(&path, &key, &mut manifest)?;
        }
        Ok::<_, io::Error>(manifest)
    })
    .await
    .map_err(|e| AppError::Io(io::Error::other(e)))?
    .map_err(AppError::from)
}

fn collect(path: &Path, key: &str, manifest: &mut Manifest) -> io::Result<()> {
    let meta = match std::fs::metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    if meta.is_file() {
        manifest.insert(key.to_string(), hash_file(path)?);
        return Ok(());
    }

    for item in std::fs::read_dir(path)? {
        let item = item?;
        let name = item.file_name();
        let name = name.to_string_lossy();
        if name == ".git" {
            continue;
        }
        collect(&item.path(), &format!("{key}/{name}"), manifest)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manifest(items: &[(&str, &str)]) -> Manifest {
        items
            .iter()
            .map(|(p, h)| (p.to_string(), h.to_string()))
            .collect()
    }

    #[test]
    fn test_no_changes() {
        let prev = manifest(&[("index.json", "a"), ("pic/data/1/info.json", "b")]);
        let result = calculate_diff(&prev, &prev.clone());
        assert!(!result.has_changes());
        assert_eq!(result.change_count(), 0);
    }

    #[test]
    fn test_mixed_changes() {
        let prev = manifest(&[
            ("pic/data/1/info.json", "keep"),
            ("pic/data/2/info.json", "old"),
            ("pic/data/3/info.json", "gone"),
        ]);
        let curr = manifest(&[
            ("pic/data/1/info.json", "keep"),
            ("pic/data/2/info.json", "new"),
            ("pic/data/4/info.json", "fresh"),
        ]);

        let result = calculate_diff(&prev, &curr);
        assert_eq!(result.added, vec!["pic/data/4/info.json"]);
        assert_eq!(result.modified, vec!["pic/data/2/info.json"]);
        assert_eq!(result.removed, vec!["pic/data/3/info.json"]);
        assert_eq!(
            result.changed_folders("pic/data").into_iter().collect::<Vec<_>>(),
            vec![2, 3, 4]
        );
        assert_eq!(
            result.new_folders("pic/data", &prev).into_iter().collect::<Vec<_>>(),
            vec![4]
        );
    }

    #[test]
    fn test_folder_of() {
        assert_eq!(folder_of("pic/data/12/images/a.jpg", "pic/data"), Some(12));
        assert_eq!(folder_of("index.json", "pic/data"), None);
        assert_eq!(folder_of("pic/database/1", "pic/data"), None);
    }

    #[tokio::test]
    async fn test_build_manifest() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("7/images")).unwrap();
        std::fs::write(tmp.path().join("7/info.json"), "{}").unwrap();
        std::fs::write(tmp.path().join("7/images/a.jpg"), "img").unwrap();
        std::fs::write(tmp.path().join("index.json"), "{}").unwrap();

        let manifest = build_manifest(vec![
            (tmp.path().join("7"), "pic/data/7".into()),
            (tmp.path().join("index.json"), "index.json".into()),
            (tmp.path().join("apiid.json"), "apiid.json".into()),
        ])
        .await
        .unwrap();

        assert_eq!(
            manifest.keys().cloned().collect::<Vec<_>>(),
            vec!["index.json", "pic/data/7/images/a.jpg", "pic/data/7/info.json"]
        );
        assert_eq!(manifest["index.json"], manifest["pic/data/7/info.json"]);
    }
}
