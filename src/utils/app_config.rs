/// Application configuration management
/// Stores operator settings in ~/.config/stackguard/config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

use crate::utils::constants::*;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Deployment root (directory holding docker-compose.yml)
    pub deployment_root: Option<PathBuf>,
    /// Where archives are written; defaults to `<root parent>/<root name>-backups`
    pub backup_dir: Option<PathBuf>,
    pub archive_prefix: String,
    /// Image used for short-lived volume export/import containers
    pub helper_image: String,
    /// Compose project name; falls back to COMPOSE_PROJECT_NAME or the root directory name
    pub compose_project: Option<String>,
    pub services: ServicesConfig,
    pub volumes: VolumesConfig,
    pub retention: RetentionPolicy,
    pub install_backups: InstallBackupPolicy,
    pub timeouts: TimeoutsConfig,
    pub encryption: EncryptionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServicesConfig {
    pub database: String,
    pub secrets_store: String,
    /// Services that must be running after a restore
    pub critical: Vec<String>,
    pub db_user: Option<String>,
    pub db_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumesConfig {
    /// Logical volume names (without compose project prefix)
    pub critical: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    pub count: usize,
    pub max_age_days: u64,
    pub auto_cleanup: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallBackupPolicy {
    pub count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    #[serde(with = "human_duration")]
    pub stop: Duration,
    #[serde(with = "human_duration")]
    pub start: Duration,
    #[serde(with = "human_duration")]
    pub settle: Duration,
    #[serde(with = "human_duration")]
    pub db_restore: Duration,
    #[serde(with = "human_duration")]
    pub retry_delay: Duration,
    pub db_dump_attempts: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncryptionConfig {
    pub enabled: bool,
    pub key_id: String,
    /// Fallback key file; defaults to ~/.config/stackguard/backup.key
    pub key_file: Option<PathBuf>,
    pub kdf_iterations: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            deployment_root: None,
            backup_dir: None,
            archive_prefix: DEFAULT_ARCHIVE_PREFIX.to_string(),
            helper_image: DEFAULT_HELPER_IMAGE.to_string(),
            compose_project: None,
            services: ServicesConfig::default(),
            volumes: VolumesConfig::default(),
            retention: RetentionPolicy::default(),
            install_backups: InstallBackupPolicy::default(),
            timeouts: TimeoutsConfig::default(),
            encryption: EncryptionConfig::default(),
        }
    }
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            database: DEFAULT_DATABASE_SERVICE.to_string(),
            secrets_store: DEFAULT_SECRETS_SERVICE.to_string(),
            critical: DEFAULT_CRITICAL_SERVICES.iter().map(|s| s.to_string()).collect(),
            db_user: None,
            db_name: None,
        }
    }
}

impl Default for VolumesConfig {
    fn default() -> Self {
        Self {
            critical: DEFAULT_CRITICAL_VOLUMES.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            count: 5,
            max_age_days: 30,
            auto_cleanup: true,
        }
    }
}

impl Default for InstallBackupPolicy {
    fn default() -> Self {
        Self { count: 2 }
    }
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            stop: Duration::from_secs(30),
            start: Duration::from_secs(60),
            settle: Duration::from_secs(15),
            db_restore: Duration::from_secs(600),
            retry_delay: Duration::from_secs(5),
            db_dump_attempts: 3,
        }
    }
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            key_id: DEFAULT_KEY_ID.to_string(),
            key_file: None,
            kdf_iterations: DEFAULT_KDF_ITERATIONS,
        }
    }
}

impl AppConfig {
    /// Get default config file path
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("stackguard");
        Ok(config_dir.join("config.toml"))
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Self = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;

        Ok(config)
    }

    /// Load configuration, falling back to defaults when the file is absent or malformed
    pub fn load_or_default(path: Option<&Path>) -> Self {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::config_path() {
                Ok(p) => p,
                Err(_) => return Self::default(),
            },
        };

        if !path.exists() {
            return Self::default();
        }

        match Self::load(&path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Ignoring configuration at {}: {:#}; using defaults", path.display(), e);
                Self::default()
            }
        }
    }

    /// Deployment root, failing when it has not been resolved
    pub fn root(&self) -> Result<&Path> {
        self.deployment_root
            .as_deref()
            .context("Deployment root is not configured")
    }

    /// Backup destination directory, always absolute
    pub fn backup_dir(&self) -> Result<PathBuf> {
        if let Some(dir) = &self.backup_dir {
            if dir.is_relative() {
                let cwd = std::env::current_dir().context("Failed to get current directory")?;
                return Ok(cwd.join(dir));
            }
            return Ok(dir.clone());
        }
        let root = self.root()?;
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "deployment".to_string());
        let parent = root.parent().unwrap_or_else(|| Path::new("/"));
        Ok(parent.join(format!("{}-backups", name)))
    }

    /// Key file used by the file-based key store
    pub fn key_file(&self) -> Result<PathBuf> {
        if let Some(path) = &self.encryption.key_file {
            return Ok(path.clone());
        }
        Ok(Self::config_path()?
            .parent()
            .map(|p| p.join("backup.key"))
            .context("Failed to derive key file location")?)
    }
}

/// Serde helpers for humantime strings such as "30s" or "10m"
mod human_duration {
    use super::*;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
