//! Patch engine: diff two indexes, pack the changes, apply them remotely.
//!
//! A patch is a zstd-compressed tar archive holding every added or changed
//! file plus the sender's full [`HashIndex`] as [`MANIFEST_NAME`]. Deletions
//! travel next to the archive, not inside it.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use chrono::Local;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::errors::ErrorCode;
use crate::hash_index::{HashIndex, IndexError, MANIFEST_NAME};
use crate::ignore::IgnoreSet;

/// Extension of patch archives.
pub const ARCHIVE_EXTENSION: &str = "tar.zst";

const ZSTD_LEVEL: i32 = 3;

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Error)]
pub enum PatchError {
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("patch archive not found: {0}")]
    ArchiveMissing(PathBuf),
    #[error("failed to write patch archive {path}: {source}")]
    Pack {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt patch archive {path}: {source}")]
    Corrupt {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("refusing path outside the project tree: {0}")]
    UnsafePath(String),
    #[error("invalid base64 patch payload: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl PatchError {
    /// Catalog code reported to the peer when this ends a session.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Index(_) => ErrorCode::TransferIndexFailed,
            Self::ArchiveMissing(_) => ErrorCode::TransferArchiveMissing,
            Self::Pack { .. } => ErrorCode::TransferUnreadableFile,
            Self::Corrupt { .. } => ErrorCode::TransferArchiveCorrupt,
            Self::UnsafePath(_) => ErrorCode::TransferUnsafePath,
            Self::Encoding(_) => ErrorCode::TransferEncodingError,
            Self::Io { .. } => ErrorCode::InternalDaemonError,
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(std::io::Error) -> PatchError + '_ {
    move |source| PatchError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Paths to transfer and paths to remove.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffResult {
    /// In `desired` but absent from or different in `current`.
    pub changed: Vec<String>,
    /// In `current` but absent from `desired`.
    pub deleted: Vec<String>,
}

impl DiffResult {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }
}

/// Compare the desired state against what the other side reports.
pub fn diff(desired: &HashIndex, current: &HashIndex) -> DiffResult {
    let mut result = DiffResult::default();
    for (path, digest) in desired.iter() {
        match current.get(path) {
            None => {
                debug!(path, "Added");
                result.changed.push(path.to_string());
            }
            Some(theirs) if theirs != digest => {
                debug!(path, "Changed");
                result.changed.push(path.to_string());
            }
            Some(_) => {}
        }
    }
    for path in current.keys() {
        if !desired.contains(path) {
            debug!(path, "Deleted");
            result.deleted.push(path.to_string());
        }
    }
    result
}

/// Result of [`pack`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackOutcome {
    /// Archive on disk, or `None` when there is nothing to transfer.
    pub archive: Option<PathBuf>,
    pub deleted: Vec<String>,
    /// State both sides share once the patch is applied.
    pub index: HashIndex,
}

impl PackOutcome {
    pub fn is_noop(&self) -> bool {
        self.archive.is_none()
    }
}

/// Build a patch bringing a tree at `server` state up to `root`, writing the
/// archive to the system temp directory.
pub fn pack(root: &Path, server: &HashIndex, ignore: &IgnoreSet) -> Result<PackOutcome, PatchError> {
    pack_into(root, server, ignore, &std::env::temp_dir())
}

/// Like [`pack`], writing the archive into `out_dir`.
pub fn pack_into(
    root: &Path,
    server: &HashIndex,
    ignore: &IgnoreSet,
    out_dir: &Path,
) -> Result<PackOutcome, PatchError> {
    let index = HashIndex::build(root, ignore)?;
    let DiffResult { changed, deleted } = diff(&index, server);
    if changed.is_empty() && deleted.is_empty() {
        debug!(root = %root.display(), "Tree already in sync");
        return Ok(PackOutcome {
            archive: None,
            deleted: Vec::new(),
            index,
        });
    }

    let path = out_dir.join(archive_name(root));
    write_archive(root, &changed, &index, &path).map_err(|source| PatchError::Pack {
        path: path.clone(),
        source,
    })?;
    info!(
        archive = %path.display(),
        changed = changed.len(),
        deleted = deleted.len(),
        "Packed patch"
    );

    Ok(PackOutcome {
        archive: Some(path),
        deleted,
        index,
    })
}

/// `<timestamp>_<root folder>.tar.zst`
pub fn archive_name(root: &Path) -> String {
    let folder = root
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    let stamp = Local::now().format("%Y-%m-%d_%H.%M.%S");
    format!("{stamp}_{folder}.{ARCHIVE_EXTENSION}")
}

fn write_archive(
    root: &Path,
    changed: &[String],
    index: &HashIndex,
    path: &Path,
) -> std::io::Result<()> {
    let file = BufWriter::new(File::create(path)?);
    let encoder = zstd::Encoder::new(file, ZSTD_LEVEL)?;
    let mut builder = tar::Builder::new(encoder);

    for rel in changed {
        builder.append_path_with_name(root.join(rel), rel)?;
    }

    let manifest = index.to_manifest_json();
    let mut header = tar::Header::new_gnu();
    header.set_size(manifest.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(Local::now().timestamp().max(0) as u64);
    header.set_cksum();
    builder.append_data(&mut header, MANIFEST_NAME, manifest.as_bytes())?;

    let encoder = builder.into_inner()?;
    let mut file = encoder.finish()?;
    std::io::Write::flush(&mut file)
}

/// Entry names inside a patch archive, in archive order.
pub fn archive_entries(path: &Path) -> Result<Vec<String>, PatchError> {
    let corrupt = |source| PatchError::Corrupt {
        path: path.to_path_buf(),
        source,
    };
    let mut archive = open_archive(path)?;
    let mut names = Vec::new();
    for entry in archive.entries().map_err(corrupt)? {
        let entry = entry.map_err(corrupt)?;
        let name = entry.path().map_err(corrupt)?;
        names.push(name.to_string_lossy().replace('\\', "/"));
    }
    Ok(names)
}

fn open_archive(path: &Path) -> Result<tar::Archive<zstd::Decoder<'static, BufReader<File>>>, PatchError> {
    if !path.is_file() {
        return Err(PatchError::ArchiveMissing(path.to_path_buf()));
    }
    let file = File::open(path).map_err(io_err(path))?;
    let decoder = zstd::Decoder::new(file).map_err(|source| PatchError::Corrupt {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(tar::Archive::new(decoder))
}

/// Extract `archive` over `target`, then prune directories left empty.
///
/// The archive is unpacked into a staging directory first; `target` is only
/// modified once the whole archive decoded cleanly. `target` is created if
/// it does not exist.
pub fn apply(archive: &Path, target: &Path) -> Result<usize, PatchError> {
    let mut reader = open_archive(archive)?;
    fs::create_dir_all(target).map_err(io_err(target))?;

    let staging = staging_dir(target);
    fs::create_dir_all(&staging).map_err(io_err(&staging))?;
    if let Err(source) = reader.unpack(&staging) {
        let _ = fs::remove_dir_all(&staging);
        return Err(PatchError::Corrupt {
            path: archive.to_path_buf(),
            source,
        });
    }

    let moved = move_tree(&staging, target);
    let _ = fs::remove_dir_all(&staging);
    let moved = moved?;

    let pruned = prune_empty_dirs(target)?;
    info!(target = %target.display(), files = moved, pruned, "Applied patch");
    Ok(moved)
}

fn staging_dir(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    let seq = STAGING_COUNTER.fetch_add(1, Ordering::SeqCst);
    target.with_file_name(format!(".{name}.staging-{}-{seq}", std::process::id()))
}

fn move_tree(staging: &Path, target: &Path) -> Result<usize, PatchError> {
    let mut moved = 0;
    for entry in WalkDir::new(staging).min_depth(1) {
        let entry = entry.map_err(|e| PatchError::Io {
            path: staging.to_path_buf(),
            source: e.into(),
        })?;
        if entry.file_type().is_dir() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(staging) else {
            continue;
        };
        let dest = target.join(rel);
        if let Some(parent) = dest.parent() {
            if parent.is_file() {
                fs::remove_file(parent).map_err(io_err(parent))?;
            }
            fs::create_dir_all(parent).map_err(io_err(parent))?;
        }
        if dest.is_dir() {
            fs::remove_dir_all(&dest).map_err(io_err(&dest))?;
        }
        fs::rename(entry.path(), &dest).map_err(io_err(&dest))?;
        moved += 1;
    }
    Ok(moved)
}

/// Remove every directory under `root` that holds no entries, deepest first.
/// Hidden and default-ignored directories are left alone.
pub fn prune_empty_dirs(root: &Path) -> Result<usize, PatchError> {
    let keep = IgnoreSet::with_defaults();
    // Pre-order so `filter_entry` skips kept subtrees; reversed, every child
    // precedes its parent.
    let mut dirs = Vec::new();
    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|e| !(e.file_type().is_dir() && keep.prunes_dir(&e.file_name().to_string_lossy())));
    for entry in walker {
        let entry = entry.map_err(|e| PatchError::Io {
            path: root.to_path_buf(),
            source: e.into(),
        })?;
        if entry.file_type().is_dir() {
            dirs.push(entry.into_path());
        }
    }

    let mut removed = 0;
    for path in dirs.iter().rev() {
        let is_empty = fs::read_dir(path).map_err(io_err(path))?.next().is_none();
        if is_empty {
            fs::remove_dir(path).map_err(io_err(path))?;
            debug!(dir = %path.display(), "Pruned empty directory");
            removed += 1;
        }
    }
    Ok(removed)
}

/// Remove the files (or directories) a peer reported as deleted.
///
/// Every path must stay inside `target`; a path that escapes it fails the
/// whole call before anything is removed.
pub fn apply_deletions(target: &Path, deleted: &[String]) -> Result<usize, PatchError> {
    let resolved = deleted
        .iter()
        .map(|rel| {
            safe_relative(rel)
                .map(|p| target.join(p))
                .ok_or_else(|| PatchError::UnsafePath(rel.clone()))
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut removed = 0;
    for path in resolved {
        match fs::symlink_metadata(&path) {
            Ok(meta) if meta.is_dir() => {
                fs::remove_dir_all(&path).map_err(io_err(&path))?;
                removed += 1;
            }
            Ok(_) => {
                fs::remove_file(&path).map_err(io_err(&path))?;
                removed += 1;
            }
            Err(_) => debug!(path = %path.display(), "Already gone"),
        }
    }
    Ok(removed)
}

/// Accept only plain relative paths (no root, no `..`).
pub fn safe_relative(rel: &str) -> Option<PathBuf> {
    let path = Path::new(rel);
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    (!out.as_os_str().is_empty()).then_some(out)
}

/// Read an archive into the base64 form used on the wire.
pub fn encode_archive(path: &Path) -> Result<String, PatchError> {
    let bytes = fs::read(path).map_err(|source| {
        if source.kind() == std::io::ErrorKind::NotFound {
            PatchError::ArchiveMissing(path.to_path_buf())
        } else {
            PatchError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    })?;
    Ok(BASE64.encode(bytes))
}

/// Decode a wire payload back into an archive file at `path`.
pub fn decode_archive(payload: &str, path: &Path) -> Result<(), PatchError> {
    let bytes = BASE64.decode(payload.trim())?;
    fs::write(path, bytes).map_err(io_err(path))
}
