/// Count and age based retention for archives and full-install snapshots
///
/// Rotation only ever deletes whole archives (with their checksum sidecars)
/// or whole snapshot directories. Asking to keep at least as many as exist
/// is a no-op.

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

use crate::core::archive::{list_archives, Archive};
use crate::utils::{dir_size, format_bytes, remove_path, RetentionPolicy, INSTALL_SNAPSHOT_MARKER};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RotationReport {
    pub kept: usize,
    pub deleted: Vec<PathBuf>,
    pub freed: u64,
}

impl RotationReport {
    fn merge(&mut self, other: RotationReport) {
        self.kept = other.kept;
        self.deleted.extend(other.deleted);
        self.freed += other.freed;
    }
}

/// Keep the `keep` most recently modified archives in `dir`, delete the rest
pub fn rotate_archives(dir: &Path, keep: usize) -> Result<RotationReport> {
    let archives = list_archives(dir)?;
    let mut report = RotationReport {
        kept: archives.len().min(keep),
        ..Default::default()
    };

    for archive in archives.into_iter().skip(keep) {
        delete_archive(&archive, &mut report);
    }

    if !report.deleted.is_empty() {
        info!(
            "Rotated {} archive(s) in {}, freed {}",
            report.deleted.len(),
            dir.display(),
            format_bytes(report.freed)
        );
    }
    Ok(report)
}

/// Delete archives older than `max_age_days`; the newest archive always survives
pub fn prune_older_than(dir: &Path, max_age_days: u64) -> Result<RotationReport> {
    let archives = list_archives(dir)?;
    let max_age = Duration::from_secs(max_age_days.saturating_mul(24 * 60 * 60));
    let now = SystemTime::now();
    let mut report = RotationReport::default();

    for (index, archive) in archives.into_iter().enumerate() {
        let age = now.duration_since(archive.modified).unwrap_or_default();
        if index == 0 || age <= max_age {
            report.kept += 1;
            continue;
        }
        delete_archive(&archive, &mut report);
    }

    Ok(report)
}

/// Count rotation then age pruning, only when auto-cleanup is enabled
pub fn apply_policy(dir: &Path, policy: &RetentionPolicy) -> Result<RotationReport> {
    if !policy.auto_cleanup {
        debug!("Automatic cleanup disabled; keeping all archives in {}", dir.display());
        return Ok(RotationReport {
            kept: list_archives(dir)?.len(),
            ..Default::default()
        });
    }

    let mut report = rotate_archives(dir, policy.count)?;
    if policy.max_age_days > 0 {
        report.merge(prune_older_than(dir, policy.max_age_days)?);
    }
    Ok(report)
}

fn delete_archive(archive: &Archive, report: &mut RotationReport) {
    match fs::remove_file(&archive.path) {
        Ok(()) => {
            debug!("Deleted archive {}", archive.path.display());
            report.freed += archive.size;
            report.deleted.push(archive.path.clone());
            let sidecar = archive.checksum_path();
            if let Ok(meta) = fs::metadata(&sidecar) {
                if fs::remove_file(&sidecar).is_ok() {
                    report.freed += meta.len();
                }
            }
        }
        Err(e) => warn!("Failed to delete {}: {}", archive.path.display(), e),
    }
}

/// Snapshot directories `<root_name>.backup.<timestamp>` in `base_dir`, newest first
pub fn list_snapshots(base_dir: &Path, root_name: &str) -> Result<Vec<PathBuf>> {
    let prefix = format!("{}{}", root_name, INSTALL_SNAPSHOT_MARKER);
    let mut snapshots: Vec<(String, PathBuf)> = Vec::new();

    for entry in fs::read_dir(base_dir).with_context(|| format!("Failed to read {}", base_dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if let Some(stamp) = name.strip_prefix(&prefix) {
            if !stamp.is_empty() {
                snapshots.push((stamp.to_string(), entry.path()));
            }
        }
    }

    // Timestamps sort lexicographically in chronological order
    snapshots.sort_by(|a, b| b.0.cmp(&a.0));
    Ok(snapshots.into_iter().map(|(_, path)| path).collect())
}

/// Keep the `keep` newest full-install snapshots, reporting space freed
pub fn rotate_snapshots(base_dir: &Path, root_name: &str, keep: usize) -> Result<RotationReport> {
    let snapshots = list_snapshots(base_dir, root_name)?;
    let mut report = RotationReport {
        kept: snapshots.len().min(keep),
        ..Default::default()
    };

    for snapshot in snapshots.into_iter().skip(keep) {
        let size = dir_size(&snapshot);
        match remove_path(&snapshot) {
            Ok(()) => {
                debug!("Deleted snapshot {}", snapshot.display());
                report.freed += size;
                report.deleted.push(snapshot);
            }
            Err(e) => warn!("Failed to delete snapshot {}: {}", snapshot.display(), e),
        }
    }

    if !report.deleted.is_empty() {
        info!(
            "Removed {} old snapshot(s), freed {}",
            report.deleted.len(),
            format_bytes(report.freed)
        );
    }
    Ok(report)
}
