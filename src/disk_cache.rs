//! Disk tier (C3): a namespaced directory of byte blobs with age/size
//! sweeping and read fallback across auxiliary read-only roots.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::error::DiskCacheError;
use crate::key::{filename_for_key, Key};

/// One regular file's attributes as read by the sweeper.
#[derive(Debug, Clone)]
struct FileRecord {
    path: PathBuf,
    modified: SystemTime,
    size: u64,
}

/// Outcome of a completed [`DiskCache::sweep`] pass, reported to the
/// completion callback per spec §4.3.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub age_evicted: u64,
    pub size_evicted: u64,
    pub bytes_reclaimed: u64,
}

/// Filesystem-backed byte store under `<root>/<namespace>`. Cheap to
/// clone: every field is a path, scalar, or small `Vec` of paths, so a
/// clone is a fine way to move a handle into an IO-executor job closure.
#[derive(Clone)]
pub struct DiskCache {
    primary_root: PathBuf,
    auxiliary_roots: Vec<PathBuf>,
    max_cache_age: Duration,
    max_cache_size: u64,
}

impl DiskCache {
    pub fn new(
        primary_root: impl Into<PathBuf>,
        auxiliary_roots: Vec<PathBuf>,
        max_cache_age: Duration,
        max_cache_size: u64,
    ) -> Self {
        Self { primary_root: primary_root.into(), auxiliary_roots, max_cache_age, max_cache_size }
    }

    pub fn namespace_path(&self) -> &Path {
        &self.primary_root
    }

    fn candidate_paths(&self, key: &Key) -> Vec<PathBuf> {
        let filename = filename_for_key(key);
        let bare = bare_filename(&filename);

        let mut candidates = Vec::with_capacity(2 + self.auxiliary_roots.len() * 2);
        candidates.push(self.primary_root.join(&filename));
        if bare != filename {
            candidates.push(self.primary_root.join(&bare));
        }
        for root in &self.auxiliary_roots {
            candidates.push(root.join(&filename));
            if bare != filename {
                candidates.push(root.join(&bare));
            }
        }
        candidates
    }

    /// Fast existence probe; safe to call off the IO executor. Tries the
    /// primary path both with and without the filename extension.
    pub fn exists(&self, key: &Key) -> bool {
        let filename = filename_for_key(key);
        let bare = bare_filename(&filename);
        self.primary_root.join(&filename).is_file() || self.primary_root.join(&bare).is_file()
    }

    /// Creates the namespace directory and writes `bytes` for `key`,
    /// writing to a sibling temp file first so the final rename is
    /// atomic from the caller's perspective.
    pub fn write(
        &self,
        key: &Key,
        bytes: &[u8],
        exclude_from_backup: bool,
    ) -> Result<(), DiskCacheError> {
        std::fs::create_dir_all(&self.primary_root).map_err(|source| {
            DiskCacheError::CreateNamespace { path: self.primary_root.clone(), source }
        })?;

        let filename = filename_for_key(key);
        let final_path = self.primary_root.join(&filename);
        let tmp_path = self.primary_root.join(format!(".{filename}.{}.tmp", std::process::id()));

        std::fs::write(&tmp_path, bytes)
            .map_err(|source| DiskCacheError::Write { path: tmp_path.clone(), source })?;
        std::fs::rename(&tmp_path, &final_path)
            .map_err(|source| DiskCacheError::Write { path: final_path.clone(), source })?;

        if exclude_from_backup {
            set_exclude_from_backup(&final_path);
        }

        debug!(path = %final_path.display(), bytes = bytes.len(), "disk cache write");
        Ok(())
    }

    /// Reads bytes for `key`, trying the primary path (with and without
    /// extension) then each auxiliary root in registration order.
    /// Returns the first non-empty read.
    pub fn read(&self, key: &Key) -> Option<Vec<u8>> {
        for candidate in self.candidate_paths(key) {
            match std::fs::read(&candidate) {
                Ok(bytes) if !bytes.is_empty() => return Some(bytes),
                Ok(_) => continue,
                Err(err) if err.kind() == io::ErrorKind::NotFound => continue,
                Err(err) => {
                    warn!(path = %candidate.display(), error = %err, "disk cache read failed");
                    continue;
                }
            }
        }
        None
    }

    /// Best-effort removal; errors are swallowed.
    pub fn remove(&self, key: &Key) {
        let filename = filename_for_key(key);
        let bare = bare_filename(&filename);
        for name in [filename, bare] {
            let path = self.primary_root.join(&name);
            if let Err(err) = std::fs::remove_file(&path) {
                if err.kind() != io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %err, "disk cache remove failed");
                }
            }
        }
    }

    /// Deletes and recreates the namespace directory.
    pub fn remove_all(&self) -> Result<(), DiskCacheError> {
        match std::fs::remove_dir_all(&self.primary_root) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(DiskCacheError::Remove { path: self.primary_root.clone(), source }),
        }
        std::fs::create_dir_all(&self.primary_root)
            .map_err(|source| DiskCacheError::CreateNamespace { path: self.primary_root.clone(), source })
    }

    /// Total allocated bytes under the namespace directory.
    pub fn size(&self) -> u64 {
        self.enumerate().iter().map(|record| record.size).sum()
    }

    /// Count of regular files under the namespace directory.
    pub fn count(&self) -> u64 {
        self.enumerate().len() as u64
    }

    /// Runs `callback` with `(size, count)`, in one traversal.
    pub fn calculate(&self, callback: impl FnOnce(u64, u64)) {
        let records = self.enumerate();
        let size = records.iter().map(|r| r.size).sum();
        callback(size, records.len() as u64);
    }

    fn enumerate(&self) -> Vec<FileRecord> {
        let mut records = Vec::new();
        let Ok(entries) = std::fs::read_dir(&self.primary_root) else { return records };
        for entry in entries.flatten() {
            let Ok(metadata) = entry.metadata() else { continue };
            if metadata.is_dir() {
                continue;
            }
            let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
            records.push(FileRecord { path: entry.path(), modified, size: metadata.len() });
        }
        records
    }

    /// Two-pass age-and-size garbage collection (spec §4.3).
    ///
    /// Pass 1 deletes every file whose modification time is at or
    /// before `now - max_cache_age`. Pass 2, only when `max_cache_size`
    /// is non-zero and the surviving total exceeds it, deletes the
    /// oldest-remaining files (oldest-modified first) until the total
    /// drops below half of `max_cache_size`.
    ///
    /// Per the Open Question in spec §9, `current_size` after pass 1 is
    /// the sum over *surviving* files only --- pass 1's deletions are
    /// simply never added to the running total, not subtracted from it.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(SystemTime::now())
    }

    fn sweep_at(&self, now: SystemTime) -> SweepReport {
        let mut report = SweepReport::default();
        let expiration = now.checked_sub(self.max_cache_age).unwrap_or(SystemTime::UNIX_EPOCH);

        let mut survivors = Vec::new();
        let mut current_size: u64 = 0;

        for record in self.enumerate() {
            if record.modified <= expiration {
                if std::fs::remove_file(&record.path).is_ok() {
                    report.age_evicted += 1;
                    report.bytes_reclaimed += record.size;
                } else {
                    warn!(path = %record.path.display(), "sweep: failed to remove expired file");
                }
            } else {
                current_size += record.size;
                survivors.push(record);
            }
        }

        if self.max_cache_size > 0 && current_size > self.max_cache_size {
            let desired = self.max_cache_size / 2;
            survivors.sort_by_key(|record| record.modified);

            for record in survivors {
                if current_size < desired {
                    break;
                }
                if std::fs::remove_file(&record.path).is_ok() {
                    report.size_evicted += 1;
                    report.bytes_reclaimed += record.size;
                    current_size = current_size.saturating_sub(record.size);
                }
            }
        }

        debug!(?report, "disk cache sweep complete");
        report
    }
}

/// Strips a trailing `.ext` from a digest+extension filename, yielding
/// the bare-digest form used by pre-extension-preserving cache writers.
fn bare_filename(filename: &str) -> String {
    match filename.find('.') {
        Some(dot) => filename[..dot].to_string(),
        None => filename.to_string(),
    }
}

#[cfg(not(target_os = "macos"))]
fn set_exclude_from_backup(_path: &Path) {
    // No equivalent attribute outside Apple platforms; best-effort no-op.
}

#[cfg(target_os = "macos")]
fn set_exclude_from_backup(path: &Path) {
    use std::ffi::CString;

    let Ok(c_path) = CString::new(path.as_os_str().as_encoded_bytes()) else { return };
    let key = match CString::new("com.apple.metadata:com_apple_backup_excludeItem") {
        Ok(key) => key,
        Err(_) => return,
    };
    let value = b"com.apple.backupd";
    unsafe {
        libc::setxattr(
            c_path.as_ptr(),
            key.as_ptr(),
            value.as_ptr() as *const _,
            value.len(),
            0,
            0,
        );
    }
}
