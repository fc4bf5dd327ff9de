/// Backup creation
///
/// preflight -> database dump (retried) -> volume exports (soft) ->
/// archive assembly -> integrity check -> publish -> optional encryption ->
/// retention. Everything is assembled in a staging directory inside the
/// destination that is removed on every exit path.

use anyhow::anyhow;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::core::archive::{archive_name, checksum_path, dump_file_name, Archive};
use crate::core::codec::{ArchiveCodec, ArchiveSource, Exclusions};
use crate::core::config::DatabaseCredentials;
use crate::core::docker::ContainerRuntime;
use crate::core::encryption::EncryptionManager;
use crate::core::error::{OpsError, OpsResult};
use crate::core::integrity::{IntegrityReport, IntegrityVerifier};
use crate::core::lock::OperationLock;
use crate::core::preflight::{PreflightChecker, PreflightOutcome};
use crate::core::retention::{apply_policy, RotationReport};
use crate::core::retry::RetryPolicy;
use crate::utils::{
    remove_path, set_owner_only, timestamp_now, AppConfig, DB_DUMP_HEADER_LINES, DB_DUMP_HEADER_MARKER,
    DB_DUMP_PREFIX, DB_DUMP_SUFFIX, DEFAULT_EXCLUSIONS, RESERVED_DIR, VOLUME_EXPORTS_DIR,
};

#[derive(Debug, Clone)]
pub struct BackupSummary {
    pub archive: Archive,
    pub integrity: IntegrityReport,
    pub preflight_warnings: Vec<String>,
    pub volumes_exported: Vec<String>,
    pub volumes_skipped: Vec<String>,
    pub rotation: Option<RotationReport>,
}

pub struct BackupCreator {
    config: AppConfig,
    root: PathBuf,
    destination: PathBuf,
    runtime: Arc<dyn ContainerRuntime>,
    codec: Arc<dyn ArchiveCodec>,
    preflight: PreflightChecker,
    encryption: Option<EncryptionManager>,
    credentials: DatabaseCredentials,
}

impl BackupCreator {
    pub fn new(
        config: &AppConfig,
        runtime: Arc<dyn ContainerRuntime>,
        codec: Arc<dyn ArchiveCodec>,
    ) -> OpsResult<Self> {
        let root = config
            .root()
            .map_err(|e| OpsError::Config(e.to_string()))?
            .to_path_buf();
        let destination = config
            .backup_dir()
            .map_err(|e| OpsError::Config(e.to_string()))?;
        let credentials = DatabaseCredentials::resolve(config, &root);
        let encryption = if config.encryption.enabled {
            Some(EncryptionManager::from_config(config)?)
        } else {
            None
        };

        Ok(Self {
            preflight: PreflightChecker::new(runtime.clone(), config, credentials.clone()),
            config: config.clone(),
            root,
            destination,
            runtime,
            codec,
            encryption,
            credentials,
        })
    }

    pub fn with_encryption(mut self, manager: EncryptionManager) -> Self {
        self.encryption = Some(manager);
        self
    }

    pub fn with_preflight(mut self, preflight: PreflightChecker) -> Self {
        self.preflight = preflight;
        self
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub async fn create(&self) -> OpsResult<BackupSummary> {
        let _lock = OperationLock::acquire(&self.root)?;
        info!("Creating backup of {} into {}", self.root.display(), self.destination.display());

        fs::create_dir_all(&self.destination)?;

        let preflight_warnings = match self.preflight.check(&self.destination).await {
            PreflightOutcome::Pass { warnings } => warnings,
            PreflightOutcome::Fail { reasons } => {
                error!("Preflight failed: {}", reasons.join("; "));
                return Err(OpsError::PreflightFailure(reasons));
            }
        };

        let staging = tempfile::Builder::new()
            .prefix(".stackguard-staging-")
            .tempdir_in(&self.destination)
            .map_err(|e| OpsError::ArchiveCreationFailure(format!("cannot create staging directory: {}", e)))?;
        debug!("Staging in {}", staging.path().display());

        let timestamp = timestamp_now();
        let dump_name = dump_file_name(&timestamp);
        let dump_path = staging.path().join(&dump_name);
        self.dump_database(&dump_path).await?;

        let reserved = staging.path().join(RESERVED_DIR);
        let volumes_dir = staging.path().join(VOLUME_EXPORTS_DIR);
        fs::create_dir_all(&volumes_dir)?;
        let (volumes_exported, volumes_skipped) = self.export_volumes(&volumes_dir).await;

        let name = archive_name(&self.config.archive_prefix, &timestamp);
        let staged_archive = staging.path().join(&name);
        let sources = [
            ArchiveSource::contents_of(&self.root),
            ArchiveSource::named(&dump_path, &dump_name),
            ArchiveSource::named(&reserved, RESERVED_DIR),
        ];
        let entries = self
            .codec
            .create(&sources, &self.exclusions()?, &staged_archive)
            .map_err(|e| OpsError::ArchiveCreationFailure(format!("{:#}", e)))?;
        debug!("Assembled {} with {} entries", name, entries);

        let integrity = IntegrityVerifier::new(self.codec.clone()).verify(&staged_archive)?;

        let published = self.publish(&staged_archive, &name)?;
        drop(staging);

        let final_path = match &self.encryption {
            Some(manager) => manager.encrypt(&published).map_err(|e| {
                error!("Encryption failed; plaintext archive kept at {}", published.display());
                e
            })?,
            None => published,
        };

        let rotation = match apply_policy(&self.destination, &self.config.retention) {
            Ok(report) => Some(report),
            Err(e) => {
                warn!("Retention failed: {:#}", e);
                None
            }
        };

        let archive = Archive::from_path(&final_path).map_err(|e| OpsError::ArchiveCreationFailure(format!("{:#}", e)))?;
        info!("Backup created: {}", archive.path.display());

        Ok(BackupSummary {
            archive,
            integrity,
            preflight_warnings,
            volumes_exported,
            volumes_skipped,
            rotation,
        })
    }

    async fn dump_database(&self, dump_path: &Path) -> OpsResult<()> {
        let policy = RetryPolicy::new(self.config.timeouts.db_dump_attempts, self.config.timeouts.retry_delay);
        let service = self.config.services.database.as_str();
        let command = vec![
            "pg_dump".to_string(),
            "-U".to_string(),
            self.credentials.user.clone(),
            "--clean".to_string(),
            "--if-exists".to_string(),
            self.credentials.database.clone(),
        ];

        let dump = policy
            .run(
                "database dump",
                |_| {
                    let runtime = self.runtime.clone();
                    let command = command.clone();
                    async move {
                        let container = runtime
                            .find_container(service)
                            .await?
                            .ok_or_else(|| anyhow!("database service '{}' not found", service))?;
                        let out = runtime.exec(&container.name, command).await?;
                        if !out.success() {
                            return Err(anyhow!("pg_dump exited with {}: {}", out.exit_code, out.stderr_text()));
                        }
                        Ok(out.stdout)
                    }
                },
                |out: &Vec<u8>| validate_dump(out),
            )
            .await
            .map_err(|e| {
                error!("Database dump failed: {}", e);
                OpsError::DatabaseBackupFailure {
                    attempts: e.attempts,
                    reason: e.last_error,
                }
            })?;

        fs::write(dump_path, &dump)?;
        info!("Database dumped ({} bytes)", dump.len());
        Ok(())
    }

    /// Export every critical volume that exists; failures are only logged
    async fn export_volumes(&self, volumes_dir: &Path) -> (Vec<String>, Vec<String>) {
        let mut exported = Vec::new();
        let mut skipped = Vec::new();

        for logical in &self.config.volumes.critical {
            let volume = match self.runtime.resolve_volume(logical).await {
                Ok(Some(volume)) => volume,
                Ok(None) => {
                    debug!("Volume '{}' does not exist, skipping", logical);
                    skipped.push(logical.clone());
                    continue;
                }
                Err(e) => {
                    warn!("Could not resolve volume '{}': {:#}", logical, e);
                    skipped.push(logical.clone());
                    continue;
                }
            };

            let dest = volumes_dir.join(format!("{}.tar.gz", logical));
            match self.runtime.export_volume(&volume, dest.clone()).await {
                Ok(()) => {
                    info!("Exported volume {}", volume);
                    exported.push(logical.clone());
                }
                Err(e) => {
                    warn!("Failed to export volume {}: {:#}", volume, e);
                    if let Err(e) = remove_path(&dest) {
                        warn!("Could not remove partial export {}: {:#}", dest.display(), e);
                    }
                    skipped.push(logical.clone());
                }
            }
        }

        (exported, skipped)
    }

    fn exclusions(&self) -> OpsResult<Exclusions> {
        let build = || -> anyhow::Result<Exclusions> {
            let mut exclusions = Exclusions::new()
                .top_level(RESERVED_DIR)?
                .top_level(&format!("{}*{}", DB_DUMP_PREFIX, DB_DUMP_SUFFIX))?
                .path(&self.destination);
            for pattern in DEFAULT_EXCLUSIONS {
                exclusions = exclusions.pattern(pattern)?;
            }
            Ok(exclusions)
        };
        build().map_err(|e| OpsError::ArchiveCreationFailure(format!("{:#}", e)))
    }

    /// Move the verified archive and its sidecar into the destination, owner-only
    fn publish(&self, staged: &Path, name: &str) -> OpsResult<PathBuf> {
        let target = self.destination.join(name);
        if target.exists() {
            return Err(OpsError::ArchiveCreationFailure(format!("{} already exists", target.display())));
        }

        let fail = |e: std::io::Error| OpsError::ArchiveCreationFailure(format!("cannot publish archive: {}", e));
        fs::rename(staged, &target).map_err(fail)?;
        let staged_sidecar = checksum_path(staged);
        if staged_sidecar.exists() {
            fs::rename(&staged_sidecar, checksum_path(&target)).map_err(fail)?;
        }
        set_owner_only(&target).map_err(|e| OpsError::ArchiveCreationFailure(format!("{:#}", e)))?;

        Ok(target)
    }
}

/// Accept dump output only if it is non-empty and carries the dump header
fn validate_dump(output: &[u8]) -> Result<(), String> {
    if output.iter().all(|b| b.is_ascii_whitespace()) {
        return Err("dump output is empty".to_string());
    }

    let text = String::from_utf8_lossy(&output[..output.len().min(8192)]);
    if text
        .lines()
        .take(DB_DUMP_HEADER_LINES)
        .any(|line| line.contains(DB_DUMP_HEADER_MARKER))
    {
        Ok(())
    } else {
        let first = text.lines().next().unwrap_or_default();
        Err(format!("dump header not found (output starts with: {:?})", first))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cipher::Aes256CbcCipher;
    use crate::core::codec::TarGzCodec;
    use crate::core::docker::{ContainerInfo, ExecOutput, MockContainerRuntime};
    use crate::core::secrets::{KeyChain, KeyFileStore, SecretStore};
    use crate::utils::ContainerState;
    use rand::RngCore;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;

    const DUMP: &str = "--\n-- PostgreSQL database dump\n--\n\nCREATE TABLE users (id int);\n";

    struct Fixture {
        _dir: tempfile::TempDir,
        config: AppConfig,
        root: PathBuf,
        backups: PathBuf,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::TempDir::new().unwrap();
        let root = dir.path().join("stack");
        fs::create_dir_all(root.join("config")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("docker-compose.yml"), "services:\n  postgres: {}\n").unwrap();
        fs::write(root.join(".env"), "POSTGRES_USER=app\nPOSTGRES_DB=appdb\n").unwrap();
        fs::write(root.join(".git").join("HEAD"), "ref").unwrap();
        fs::create_dir_all(root.join("volumes/pgdata")).unwrap();
        fs::write(root.join("volumes/pgdata/PG_VERSION"), "16").unwrap();
        let mut noise = vec![0u8; 2 * 1024 * 1024];
        rand::thread_rng().fill_bytes(&mut noise);
        fs::write(root.join("config").join("blob.bin"), &noise).unwrap();

        let backups = dir.path().join("backups");
        let mut config = AppConfig::default();
        config.deployment_root = Some(root.clone());
        config.backup_dir = Some(backups.clone());
        config.timeouts.retry_delay = Duration::ZERO;
        config.volumes.critical = vec!["uploads".into(), "certs".into()];

        Fixture { _dir: dir, config, root, backups }
    }

    fn running(name: &str) -> ContainerInfo {
        ContainerInfo {
            id: name.into(),
            name: name.into(),
            image: "postgres:16".into(),
            status: "Up".into(),
            state: ContainerState::Running,
            health: None,
        }
    }

    fn healthy_runtime(dump: &'static str) -> MockContainerRuntime {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ping().returning(|| true);
        runtime
            .expect_find_container()
            .returning(|s| Ok(Some(running(&format!("stack-{}-1", s)))));
        runtime.expect_exec().returning(move |_, cmd| {
            let stdout = if cmd[0] == "pg_dump" { dump.as_bytes().to_vec() } else { Vec::new() };
            Ok(ExecOutput { exit_code: 0, stdout, stderr: Vec::new() })
        });
        runtime.expect_resolve_volume().returning(|v| {
            Ok(if v == "uploads" { Some(format!("stack_{}", v)) } else { None })
        });
        runtime.expect_export_volume().returning(|_, dest| {
            fs::write(dest, b"volume-bytes")?;
            Ok(())
        });
        runtime
    }

    fn creator(f: &Fixture, runtime: MockContainerRuntime) -> BackupCreator {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(runtime);
        let creds = DatabaseCredentials::resolve(&f.config, &f.root);
        BackupCreator::new(&f.config, runtime.clone(), Arc::new(TarGzCodec::new()))
            .unwrap()
            .with_preflight(
                PreflightChecker::new(runtime, &f.config, creds)
                    .with_free_space_probe(|_| Some(u64::MAX)),
            )
    }

    fn destination_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_create_backup_end_to_end() {
        let f = fixture();
        let summary = creator(&f, healthy_runtime(DUMP)).create().await.unwrap();

        let archive = &summary.archive;
        assert!(archive.name.starts_with("stack_backup_") && archive.name.ends_with(".tar.gz"));
        assert_eq!(archive.path.parent().unwrap(), f.backups);
        let mode = fs::metadata(&archive.path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(archive.checksum.is_some());
        assert!(summary.preflight_warnings.is_empty());
        assert_eq!(summary.volumes_exported, vec!["uploads"]);
        assert_eq!(summary.volumes_skipped, vec!["certs"]);
        assert!(summary.integrity.warnings.is_empty());

        let entries = TarGzCodec::new().list(&archive.path).unwrap();
        assert!(entries.contains(&"docker-compose.yml".to_string()));
        assert!(entries.contains(&".stackguard/volumes/uploads.tar.gz".to_string()));
        assert!(entries.contains(&"volumes/pgdata/PG_VERSION".to_string()));
        assert!(entries.contains(&summary.integrity.dump));
        assert!(!entries.iter().any(|e| e.starts_with(".git")));

        // Exactly one archive plus its sidecar; staging is gone
        let files = destination_files(&f.backups);
        assert_eq!(files, vec![archive.name.clone(), format!("{}.sha256", archive.name)]);
    }

    #[tokio::test]
    async fn test_dump_retries_exhausted_leaves_no_archive() {
        let f = fixture();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ping().returning(|| true);
        runtime
            .expect_find_container()
            .returning(|s| Ok(Some(running(s))));
        runtime
            .expect_exec()
            .withf(|_, cmd| cmd[0] == "pg_isready")
            .returning(|_, _| Ok(ExecOutput::default()));
        runtime
            .expect_exec()
            .withf(|_, cmd| cmd[0] == "pg_dump")
            .times(3)
            .returning(|_, _| {
                Ok(ExecOutput {
                    exit_code: 0,
                    stdout: b"psql: FATAL: password authentication failed".to_vec(),
                    stderr: Vec::new(),
                })
            });
        runtime.expect_export_volume().never();

        match creator(&f, runtime).create().await {
            Err(OpsError::DatabaseBackupFailure { attempts, reason }) => {
                assert_eq!(attempts, 3);
                assert!(reason.contains("header"));
            }
            other => panic!("unexpected {:?}", other.map(|s| s.archive.name)),
        }
        assert!(destination_files(&f.backups).is_empty());
    }

    #[tokio::test]
    async fn test_preflight_failure_aborts_before_dump() {
        let f = fixture();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ping().returning(|| false);
        runtime.expect_exec().never();

        assert!(matches!(
            creator(&f, runtime).create().await,
            Err(OpsError::PreflightFailure(_))
        ));
    }

    #[tokio::test]
    async fn test_volume_export_failure_is_soft() {
        let f = fixture();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ping().returning(|| true);
        runtime
            .expect_find_container()
            .returning(|s| Ok(Some(running(s))));
        runtime.expect_exec().returning(|_, cmd| {
            let stdout = if cmd[0] == "pg_dump" { DUMP.as_bytes().to_vec() } else { Vec::new() };
            Ok(ExecOutput { exit_code: 0, stdout, stderr: Vec::new() })
        });
        runtime
            .expect_resolve_volume()
            .returning(|v| Ok(Some(v.to_string())));
        runtime.expect_export_volume().returning(|_, dest| {
            fs::write(&dest, b"trunc")?;
            Err(anyhow!("helper container failed"))
        });

        let summary = creator(&f, runtime).create().await.unwrap();
        assert!(summary.volumes_exported.is_empty());
        assert_eq!(summary.volumes_skipped.len(), 2);

        // Partial exports never reach the archive
        let entries = TarGzCodec::new().list(&summary.archive.path).unwrap();
        assert!(!entries.iter().any(|e| e.starts_with(".stackguard/volumes/")));
    }

    #[tokio::test]
    async fn test_backup_dir_inside_root_keeps_volume_exports() {
        let mut f = fixture();
        f.backups = f.root.join("backups");
        f.config.backup_dir = Some(f.backups.clone());

        let summary = creator(&f, healthy_runtime(DUMP)).create().await.unwrap();

        let entries = TarGzCodec::new().list(&summary.archive.path).unwrap();
        assert!(entries.contains(&".stackguard/volumes/uploads.tar.gz".to_string()));
        assert!(!entries.iter().any(|e| e.starts_with("backups")));
        assert!(summary.integrity.warnings.is_empty());
    }

    #[tokio::test]
    async fn test_encrypted_backup_replaces_plaintext() {
        let f = fixture();
        let stores: Vec<Box<dyn SecretStore>> =
            vec![Box::new(KeyFileStore::new(f.backups.with_file_name("keys").join("backup.key")))];
        let manager = EncryptionManager::new(Arc::new(Aes256CbcCipher::new()), KeyChain::new(stores), "k", 1_000);

        let summary = creator(&f, healthy_runtime(DUMP))
            .with_encryption(manager)
            .create()
            .await
            .unwrap();

        assert!(summary.archive.encrypted);
        let files = destination_files(&f.backups);
        assert_eq!(files.len(), 2);
        assert!(files.iter().all(|n| n.contains(".tar.gz.enc")));
    }

    #[tokio::test]
    async fn test_concurrent_backup_fails_fast() {
        let f = fixture();
        let _held = OperationLock::acquire(&f.root).unwrap();
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ping().never();

        assert!(matches!(
            creator(&f, runtime).create().await,
            Err(OpsError::AlreadyInProgress(_))
        ));
    }

    #[test]
    fn test_validate_dump() {
        assert!(validate_dump(DUMP.as_bytes()).is_ok());
        assert!(validate_dump(b"").is_err());
        assert!(validate_dump(b"  \n").is_err());
        let late_header = format!("{}-- PostgreSQL database dump\n", "x\n".repeat(25));
        assert!(validate_dump(late_header.as_bytes()).is_err());
    }
}
