use std::fs::{read_dir, remove_file};
use std::io;
use std::path::Path;
use std::time::{Duration, SystemTime};

use super::disk::{DiskStore, catch_not_found};

/// What a [`DiskStore::sweep`] removed and what it kept.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub removed_files: usize,
    pub removed_bytes: u64,

    pub retained_files: usize,
    pub retained_bytes: u64,
}

impl DiskStore {
    /// Removes every file whose `mtime` is older than `max_age`.
    ///
    /// Individual failures are logged and skipped, so one unreadable file does not keep the
    /// rest of the directory from being swept.
    pub fn sweep(&self, max_age: Duration) -> io::Result<SweepStats> {
        let cutoff = SystemTime::now()
            .checked_sub(max_age)
            .unwrap_or(SystemTime::UNIX_EPOCH);

        tracing::info!(
            "Sweeping images older than {} from `{}`",
            humantime::format_duration(max_age),
            self.path().display()
        );

        let mut stats = SweepStats::default();
        let Some(entries) = catch_not_found(|| read_dir(self.path()))? else {
            tracing::warn!("Directory not found: `{}`", self.path().display());
            return Ok(stats);
        };

        for entry in entries {
            let path = entry?.path();
            if let Err(e) = try_sweep_path(&path, cutoff, &mut stats) {
                tracing::error!(
                    error = &e as &dyn std::error::Error,
                    path = %path.display(),
                    "Failed to sweep cache file",
                );
            }
        }

        tracing::info!(
            "Retained {} files, totaling {} bytes",
            stats.retained_files,
            stats.retained_bytes,
        );
        tracing::info!(
            "Removed {} files, totaling {} bytes",
            stats.removed_files,
            stats.removed_bytes
        );

        metric!(gauge("caches.size.files") = stats.retained_files as u64);
        metric!(gauge("caches.size.bytes") = stats.retained_bytes);
        metric!(counter("caches.sweep.files_removed") += stats.removed_files as i64);
        metric!(counter("caches.sweep.bytes_removed") += stats.removed_bytes as i64);

        Ok(stats)
    }
}

/// Tries to sweep the file at `path`, returning `true` if it was removed.
fn try_sweep_path(path: &Path, cutoff: SystemTime, stats: &mut SweepStats) -> io::Result<bool> {
    tracing::trace!("Checking file `{}`", path.display());
    let Some(metadata) = catch_not_found(|| path.metadata())? else {
        return Ok(true);
    };
    if !metadata.is_file() {
        return Ok(false);
    }
    let size = metadata.len();

    if metadata.modified()? < cutoff {
        tracing::debug!("Removing file `{}`", path.display());
        catch_not_found(|| remove_file(path))?;

        stats.removed_bytes += size;
        stats.removed_files += 1;

        return Ok(true);
    }
    stats.retained_bytes += size;
    stats.retained_files += 1;

    Ok(false)
}
