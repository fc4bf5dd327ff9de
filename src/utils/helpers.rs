/// Helper utilities for stackguard

use anyhow::{Context, Result};
use chrono::{DateTime, Local};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::utils::{AppConfig, COMPOSE_FILE, TIMESTAMP_FORMAT};

/// Get the deployment root directory (where docker-compose.yml is located).
/// The result is canonical so sibling paths and locks never depend on the working directory.
pub fn find_deployment_root(config: &AppConfig) -> Result<PathBuf> {
    // 1. Check saved configuration
    if let Some(root) = &config.deployment_root {
        if root.join(COMPOSE_FILE).exists() {
            return canonical(root);
        }
        anyhow::bail!(
            "Configured deployment root {} has no {}",
            root.display(),
            COMPOSE_FILE
        );
    }

    // 2. Check environment variable
    if let Ok(root) = std::env::var("STACKGUARD_ROOT") {
        let path = PathBuf::from(root);
        if path.join(COMPOSE_FILE).exists() {
            return canonical(&path);
        }
    }

    // 3. Search for docker-compose.yml in current and parent directories
    let current_dir = std::env::current_dir()
        .context("Failed to get current directory")?;

    let mut dir = current_dir.as_path();
    loop {
        if dir.join(COMPOSE_FILE).exists() {
            return canonical(dir);
        }

        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }

    anyhow::bail!(
        "Could not find a deployment root\n\n\
        Please specify the location:\n\n\
        Option 1 - Pass it explicitly:\n\
          stackguard --root /path/to/deployment backup create\n\n\
        Option 2 - Set environment variable:\n\
          export STACKGUARD_ROOT=/path/to/deployment\n\n\
        Option 3 - Configure it:\n\
          echo 'deployment_root = \"/path/to/deployment\"' >> ~/.config/stackguard/config.toml"
    )
}

fn canonical(path: &Path) -> Result<PathBuf> {
    fs::canonicalize(path).with_context(|| format!("Failed to resolve {}", path.display()))
}

/// Sibling path of the deployment root: `<parent>/<name><suffix>`
pub fn sibling_path(root: &Path, suffix: &str) -> PathBuf {
    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "deployment".to_string());
    root.with_file_name(format!("{}{}", name, suffix))
}

/// Current local time formatted for archive and snapshot names
pub fn timestamp_now() -> String {
    Local::now().format(TIMESTAMP_FORMAT).to_string()
}

/// Format bytes to human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format timestamp to human-readable string
pub fn format_timestamp(dt: &DateTime<Local>) -> String {
    dt.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Restrict a file to owner read/write
pub fn set_owner_only(path: &Path) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
        .with_context(|| format!("Failed to restrict permissions on {}", path.display()))
}

/// Total size in bytes of all regular files below `path`
pub fn dir_size(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter_map(|e| e.metadata().ok())
        .filter(|m| m.is_file())
        .map(|m| m.len())
        .sum()
}

/// Recursively copy a directory tree, preserving permissions and symlinks
pub fn copy_dir_recursive(src: &Path, dest: &Path) -> Result<u64> {
    let mut copied = 0u64;
    fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;

    for entry in WalkDir::new(src).min_depth(1) {
        let entry = entry.with_context(|| format!("Failed to walk {}", src.display()))?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .context("Walked outside of source tree")?;
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)
                .with_context(|| format!("Failed to create {}", target.display()))?;
            let mode = entry.metadata()?.permissions().mode();
            fs::set_permissions(&target, fs::Permissions::from_mode(mode))?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(&link, &target)
                .with_context(|| format!("Failed to recreate symlink {}", target.display()))?;
        } else {
            copied += fs::copy(entry.path(), &target)
                .with_context(|| format!("Failed to copy {}", entry.path().display()))?;
        }
    }

    Ok(copied)
}

/// Remove a file or directory tree if it exists
pub fn remove_path(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

/// Parse Docker container status to simplified state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    Paused,
    Restarting,
    Dead,
    Unknown,
}

impl From<&str> for ContainerState {
    fn from(status: &str) -> Self {
        let status_lower = status.to_lowercase();
        if status_lower.contains("up") || status_lower.contains("running") {
            ContainerState::Running
        } else if status_lower.contains("paused") {
            ContainerState::Paused
        } else if status_lower.contains("restarting") {
            ContainerState::Restarting
        } else if status_lower.contains("dead") || status_lower.contains("removing") {
            ContainerState::Dead
        } else if status_lower.contains("exited") || status_lower.contains("stopped") || status_lower.contains("created") {
            ContainerState::Stopped
        } else {
            ContainerState::Unknown
        }
    }
}

impl ContainerState {
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Running => "Running",
            ContainerState::Stopped => "Stopped",
            ContainerState::Paused => "Paused",
            ContainerState::Restarting => "Restarting",
            ContainerState::Dead => "Dead",
            ContainerState::Unknown => "Unknown",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1048576), "1.00 MB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
        assert_eq!(format_bytes(12), "12 B");
    }

    #[test]
    fn test_sibling_path() {
        let root = Path::new("/opt/stack");
        assert_eq!(sibling_path(root, ".rollback"), PathBuf::from("/opt/stack.rollback"));
        assert_eq!(sibling_path(root, ".old"), PathBuf::from("/opt/stack.old"));
    }

    #[test]
    fn test_copy_dir_recursive_preserves_tree() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        fs::create_dir_all(src.join("config/nested")).unwrap();
        fs::write(src.join("docker-compose.yml"), "services: {}\n").unwrap();
        fs::write(src.join("config/nested/app.toml"), "a = 1\n").unwrap();
        std::os::unix::fs::symlink("docker-compose.yml", src.join("compose.yml")).unwrap();
        fs::set_permissions(src.join("config/nested/app.toml"), fs::Permissions::from_mode(0o640)).unwrap();

        let dest = dir.path().join("dest");
        let copied = copy_dir_recursive(&src, &dest).unwrap();

        assert_eq!(copied, 19);
        assert_eq!(fs::read_to_string(dest.join("config/nested/app.toml")).unwrap(), "a = 1\n");
        assert_eq!(fs::read_link(dest.join("compose.yml")).unwrap(), PathBuf::from("docker-compose.yml"));
        let mode = fs::metadata(dest.join("config/nested/app.toml")).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
        assert_eq!(dir_size(&dest), dir_size(&src));
    }

    #[test]
    fn test_container_state() {
        assert_eq!(ContainerState::from("Up 2 hours"), ContainerState::Running);
        assert_eq!(ContainerState::from("running"), ContainerState::Running);
        assert_eq!(ContainerState::from("Exited (0)"), ContainerState::Stopped);
        assert!(ContainerState::Running.is_running());
        assert!(!ContainerState::Stopped.is_running());
    }

    #[test]
    fn test_relative_root_is_made_canonical() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("stack");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join(COMPOSE_FILE), "services: {}\n").unwrap();

        // Same directory, spelled relative to the working directory
        let cwd = std::env::current_dir().unwrap();
        let up: PathBuf = cwd.components().skip(1).map(|_| "..").collect();
        let relative = up.join(root.strip_prefix("/").unwrap());
        assert!(relative.is_relative());

        let config = AppConfig { deployment_root: Some(relative), ..AppConfig::default() };
        let found = find_deployment_root(&config).unwrap();
        let expected = root.canonicalize().unwrap();
        assert_eq!(found, expected);
        assert_eq!(sibling_path(&found, ".rollback"), expected.with_file_name("stack.rollback"));
    }

    #[test]
    fn test_remove_path_handles_missing() {
        let dir = TempDir::new().unwrap();
        assert!(remove_path(&dir.path().join("nope")).is_ok());
        let file = dir.path().join("f");
        fs::write(&file, "x").unwrap();
        remove_path(&file).unwrap();
        assert!(!file.exists());
    }
}
