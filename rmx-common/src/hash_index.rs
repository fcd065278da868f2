//! Content index of a project tree.
//!
//! Maps each tracked file (root-relative, `/`-separated) to the BLAKE3 digest
//! of its contents. The index is rebuilt for every sync; a serialized copy
//! travels inside each patch as [`MANIFEST_NAME`] so the receiving side can
//! report its state without rehashing.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::ignore::{IgnoreError, IgnoreSet};

/// Reserved file holding the serialized index inside a synced tree.
pub const MANIFEST_NAME: &str = ".rmx-index.json";

const HASH_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to walk {root}: {source}")]
    Walk {
        root: PathBuf,
        #[source]
        source: walkdir::Error,
    },
    #[error(transparent)]
    Ignore(#[from] IgnoreError),
    #[error("invalid manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Relative path -> content digest. Ordered so manifests serialize stably.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HashIndex(BTreeMap<String, String>);

impl HashIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk `root` and hash every file not excluded by `ignore`.
    ///
    /// Directories that are hidden or ignored are pruned without being
    /// visited. Each directory's `.syncignore` adds rules for that directory
    /// and everything below it. A file that cannot be read fails the build.
    pub fn build(root: &Path, ignore: &IgnoreSet) -> Result<Self, IndexError> {
        let mut scopes: HashMap<PathBuf, IgnoreSet> = HashMap::new();
        scopes.insert(root.to_path_buf(), ignore.scoped_to(root)?);
        let mut scope_error: Option<IgnoreError> = None;
        let mut index = Self::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| {
                if entry.depth() == 0 {
                    return true;
                }
                let Some(parent) = entry.path().parent() else {
                    return false;
                };
                let name = entry.file_name().to_string_lossy();
                let scoped = {
                    let Some(rules) = scopes.get(parent) else {
                        return false;
                    };
                    if !entry.file_type().is_dir() {
                        return !rules.is_ignored(&name);
                    }
                    if rules.prunes_dir(&name) {
                        return false;
                    }
                    rules.scoped_to(entry.path())
                };
                match scoped {
                    Ok(rules) => {
                        scopes.insert(entry.path().to_path_buf(), rules);
                        true
                    }
                    Err(e) => {
                        scope_error.get_or_insert(e);
                        false
                    }
                }
            });

        for entry in walker {
            let entry = entry.map_err(|source| IndexError::Walk {
                root: root.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let is_file = entry.file_type().is_file()
                || (entry.file_type().is_symlink() && path.is_file());
            if !is_file {
                continue;
            }
            let Some(key) = relative_key(root, path) else {
                continue;
            };
            let digest = hash_file(path)?;
            index.0.insert(key, digest);
        }

        if let Some(e) = scope_error {
            return Err(e.into());
        }
        debug!(root = %root.display(), files = index.len(), "Built hash index");
        Ok(index)
    }

    /// Read the manifest a previous patch left in `root`, or rebuild the index
    /// when there is none or it cannot be parsed.
    pub fn load_or_build(root: &Path, ignore: &IgnoreSet) -> Result<Self, IndexError> {
        let manifest = root.join(MANIFEST_NAME);
        if manifest.is_file() {
            match Self::read_manifest(&manifest) {
                Ok(index) => return Ok(index),
                Err(e) => warn!(error = %e, "Rebuilding index from tree"),
            }
        }
        if !root.exists() {
            return Ok(Self::new());
        }
        Self::build(root, ignore)
    }

    pub fn read_manifest(path: &Path) -> Result<Self, IndexError> {
        let content = std::fs::read_to_string(path).map_err(|source| IndexError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| IndexError::Manifest {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn to_manifest_json(&self) -> String {
        // A map of strings always serializes.
        serde_json::to_string(&self.0).unwrap_or_else(|_| "{}".to_string())
    }

    pub fn insert(&mut self, path: impl Into<String>, digest: impl Into<String>) {
        self.0.insert(path.into(), digest.into());
    }

    pub fn remove(&mut self, path: &str) -> Option<String> {
        self.0.remove(path)
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains_key(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for HashIndex {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Stream a file through BLAKE3 and return the hex digest.
pub fn hash_file(path: &Path) -> Result<String, IndexError> {
    let read_err = |source| IndexError::Read {
        path: path.to_path_buf(),
        source,
    };
    let mut file = File::open(path).map_err(read_err)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(read_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize().to_hex().to_string())
}

/// Digest of an in-memory buffer, as [`hash_file`] would compute it.
pub fn hash_bytes(data: &[u8]) -> String {
    blake3::hash(data).to_hex().to_string()
}

fn relative_key(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<_> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ignore::SYNCIGNORE_FILE;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    #[test]
    fn test_build_hashes_nested_files_with_forward_slashes() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", "x");
        write(dir.path(), "src/lib/mod.py", "print(1)");

        let index = HashIndex::build(dir.path(), &IgnoreSet::with_defaults()).unwrap();
        assert_eq!(index.len(), 2);
        assert_eq!(index.get("a.txt"), Some(hash_bytes(b"x").as_str()));
        assert!(index.contains("src/lib/mod.py"));
    }

    #[test]
    fn test_build_prunes_hidden_and_ignored_dirs() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "keep.py", "1");
        write(dir.path(), ".venv/lib.py", "2");
        write(dir.path(), "__pycache__/keep.cpython.pyc", "3");
        write(dir.path(), "pkg/__pycache__/x.pyc", "4");
        write(dir.path(), "pkg/mod.pyc", "5");

        let index = HashIndex::build(dir.path(), &IgnoreSet::with_defaults()).unwrap();
        let keys: Vec<_> = index.keys().collect();
        assert_eq!(keys, vec!["keep.py"]);
    }

    #[test]
    fn test_hidden_files_are_tracked() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), ".env.example", "A=1");
        let index = HashIndex::build(dir.path(), &IgnoreSet::empty()).unwrap();
        assert!(index.contains(".env.example"));
    }

    #[test]
    fn test_syncignore_applies_to_its_directory_and_below() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "data/.syncignore", "*.bin\n");
        write(dir.path(), "data/raw.bin", "x");
        write(dir.path(), "data/deep/more.bin", "y");
        write(dir.path(), "data/notes.txt", "z");
        write(dir.path(), "top.bin", "w");

        let index = HashIndex::build(dir.path(), &IgnoreSet::empty()).unwrap();
        assert!(index.contains("top.bin"));
        assert!(index.contains("data/notes.txt"));
        assert!(index.contains(&format!("data/{SYNCIGNORE_FILE}")));
        assert!(!index.contains("data/raw.bin"));
        assert!(!index.contains("data/deep/more.bin"));
    }

    #[test]
    fn test_syncignore_can_prune_directories() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), ".syncignore", "checkpoints\n");
        write(dir.path(), "checkpoints/epoch1.pt", "weights");
        write(dir.path(), "train.py", "fit()");

        let index = HashIndex::build(dir.path(), &IgnoreSet::empty()).unwrap();
        assert!(index.contains("train.py"));
        assert!(!index.contains("checkpoints/epoch1.pt"));
    }

    #[test]
    fn test_identical_content_gives_identical_index() {
        let a = TempDir::new().unwrap();
        let b = TempDir::new().unwrap();
        for root in [a.path(), b.path()] {
            write(root, "z.txt", "last");
            write(root, "a/b.txt", "first");
        }
        let ia = HashIndex::build(a.path(), &IgnoreSet::empty()).unwrap();
        let ib = HashIndex::build(b.path(), &IgnoreSet::empty()).unwrap();
        assert_eq!(ia, ib);
    }

    #[test]
    fn test_hash_file_matches_hash_bytes_across_chunks() {
        let dir = TempDir::new().unwrap();
        let data = vec![7u8; HASH_CHUNK_SIZE * 2 + 17];
        let path = dir.path().join("big.bin");
        fs::write(&path, &data).unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_bytes(&data));
    }

    #[test]
    fn test_missing_file_is_read_error() {
        let err = hash_file(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, IndexError::Read { .. }));
    }

    #[test]
    fn test_manifest_roundtrip_and_load_or_build() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.txt", "x");
        let built = HashIndex::build(dir.path(), &IgnoreSet::with_defaults()).unwrap();

        let mut recorded = built.clone();
        recorded.insert("ghost.txt", "feed");
        fs::write(dir.path().join(MANIFEST_NAME), recorded.to_manifest_json()).unwrap();

        // The manifest is trusted over the tree.
        let loaded = HashIndex::load_or_build(dir.path(), &IgnoreSet::with_defaults()).unwrap();
        assert_eq!(loaded, recorded);

        // A corrupt manifest falls back to walking; the manifest itself is never indexed.
        fs::write(dir.path().join(MANIFEST_NAME), "not json").unwrap();
        let rebuilt = HashIndex::load_or_build(dir.path(), &IgnoreSet::with_defaults()).unwrap();
        assert_eq!(rebuilt, built);
    }

    #[test]
    fn test_load_or_build_missing_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let index =
            HashIndex::load_or_build(&dir.path().join("nope"), &IgnoreSet::with_defaults())
                .unwrap();
        assert!(index.is_empty());
    }
}
