/// Full-install snapshots: plain copies of the deployment root kept next to it
/// as `<root>.backup.<timestamp>`, rotated by the install-backup policy.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::core::error::{OpsError, OpsResult};
use crate::core::lock::OperationLock;
use crate::core::retention::{rotate_snapshots, RotationReport};
use crate::utils::{
    copy_dir_recursive, remove_path, sibling_path, timestamp_now, InstallBackupPolicy,
    INSTALL_SNAPSHOT_MARKER,
};

#[derive(Debug, Clone)]
pub struct InstallSnapshot {
    pub path: PathBuf,
    pub bytes: u64,
    pub rotation: Option<RotationReport>,
}

pub fn create_install_snapshot(root: &Path, policy: &InstallBackupPolicy) -> OpsResult<InstallSnapshot> {
    if !root.is_dir() {
        return Err(OpsError::Config(format!("deployment root {} does not exist", root.display())));
    }
    let _lock = OperationLock::acquire(root)?;

    let target = sibling_path(root, &format!("{}{}", INSTALL_SNAPSHOT_MARKER, timestamp_now()));
    if target.exists() {
        return Err(OpsError::ArchiveCreationFailure(format!("{} already exists", target.display())));
    }

    info!("Snapshotting {} to {}", root.display(), target.display());
    let bytes = match copy_dir_recursive(root, &target) {
        Ok(bytes) => bytes,
        Err(e) => {
            if let Err(cleanup) = remove_path(&target) {
                warn!("Failed to remove partial snapshot {}: {}", target.display(), cleanup);
            }
            return Err(OpsError::ArchiveCreationFailure(format!("snapshot failed: {:#}", e)));
        }
    };

    let rotation = match (root.parent(), root.file_name()) {
        (Some(parent), Some(name)) => match rotate_snapshots(parent, &name.to_string_lossy(), policy.count) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Snapshot rotation failed: {:#}", e);
                None
            }
        },
        _ => None,
    };

    Ok(InstallSnapshot { path: target, bytes, rotation })
}
