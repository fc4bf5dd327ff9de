/// Restore with rollback
///
/// INIT -> SNAPSHOT -> STOP -> EXTRACT -> VALIDATE -> SWAP -> RESTORE_DATA ->
/// START -> SETTLE -> CLEANUP. Any failure from EXTRACT on goes through
/// ROLLBACK, which puts the pre-restore deployment root back in place. If
/// that fails too the outcome is FATAL and everything is left on disk for
/// the operator.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::core::archive::{decrypted_path, is_dump_entry};
use crate::core::codec::ArchiveCodec;
use crate::core::config::DatabaseCredentials;
use crate::core::docker::{ContainerRuntime, ExecOutput};
use crate::core::encryption::EncryptionManager;
use crate::core::error::{OpsError, OpsResult};
use crate::core::integrity::IntegrityVerifier;
use crate::core::lock::OperationLock;
use crate::core::retry::RetryPolicy;
use crate::utils::{
    copy_dir_recursive, remove_path, sibling_path, AppConfig, COMPOSE_FILE, ENCRYPTED_EXTENSION,
    ENV_FILE, RESERVED_DIR, ROLLBACK_SUFFIX, SWAP_ASIDE_SUFFIX, VOLUME_EXPORTS_DIR,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStage {
    Init,
    Snapshot,
    Stop,
    Extract,
    Validate,
    Swap,
    RestoreData,
    Start,
    Settle,
    Cleanup,
    Rollback,
}

impl fmt::Display for RestoreStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreStage::Init => "INIT",
            RestoreStage::Snapshot => "SNAPSHOT",
            RestoreStage::Stop => "STOP",
            RestoreStage::Extract => "EXTRACT",
            RestoreStage::Validate => "VALIDATE",
            RestoreStage::Swap => "SWAP",
            RestoreStage::RestoreData => "RESTORE_DATA",
            RestoreStage::Start => "START",
            RestoreStage::Settle => "SETTLE",
            RestoreStage::Cleanup => "CLEANUP",
            RestoreStage::Rollback => "ROLLBACK",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RestoreOutcome {
    /// Restore committed; `warnings` lists soft data-restore failures
    Success { warnings: Vec<String> },
    /// Restore failed at `stage` and the previous deployment is back in place
    RolledBack { stage: RestoreStage, reason: String },
    /// Rollback itself failed; needs manual intervention
    Fatal { stage: RestoreStage, reason: String },
}

impl RestoreOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RestoreOutcome::Success { .. })
    }

    /// Typed error for a non-successful outcome
    pub fn error(&self) -> Option<OpsError> {
        match self {
            RestoreOutcome::Success { .. } => None,
            RestoreOutcome::RolledBack { stage, reason } => Some(match stage {
                RestoreStage::Swap => OpsError::AtomicSwapFailure(reason.clone()),
                RestoreStage::Start | RestoreStage::Settle => OpsError::ServiceStartFailure(reason.clone()),
                _ => OpsError::RestoreValidationFailure(reason.clone()),
            }),
            RestoreOutcome::Fatal { stage, reason } => {
                Some(OpsError::RollbackFailure(format!("{} (failed at {})", reason, stage)))
            }
        }
    }
}

pub struct RestoreOrchestrator {
    config: AppConfig,
    root: PathBuf,
    runtime: Arc<dyn ContainerRuntime>,
    codec: Arc<dyn ArchiveCodec>,
    encryption: Option<EncryptionManager>,
    credentials: DatabaseCredentials,
}

/// Per-run facts the rollback path needs
struct RunState {
    had_root: bool,
    swapped: bool,
}

impl RestoreOrchestrator {
    pub fn new(config: &AppConfig, runtime: Arc<dyn ContainerRuntime>, codec: Arc<dyn ArchiveCodec>) -> OpsResult<Self> {
        let root = config
            .root()
            .map_err(|e| OpsError::Config(e.to_string()))?
            .to_path_buf();
        Ok(Self {
            credentials: DatabaseCredentials::resolve(config, &root),
            config: config.clone(),
            root,
            runtime,
            codec,
            encryption: None,
        })
    }

    pub fn with_encryption(mut self, manager: EncryptionManager) -> Self {
        self.encryption = Some(manager);
        self
    }

    fn snapshot_path(&self) -> PathBuf {
        sibling_path(&self.root, ROLLBACK_SUFFIX)
    }

    fn aside_path(&self) -> PathBuf {
        sibling_path(&self.root, SWAP_ASIDE_SUFFIX)
    }

    /// Restore the deployment root from `archive`.
    ///
    /// Rejections before anything is touched (lock held elsewhere, stale
    /// snapshot, failed verification or decryption) come back as `Err`.
    pub async fn restore(&self, archive: &Path, skip_verify: bool) -> OpsResult<RestoreOutcome> {
        let _lock = OperationLock::acquire(&self.root)?;

        for leftover in [self.snapshot_path(), self.aside_path()] {
            if leftover.exists() {
                error!("Found {} from an interrupted restore", leftover.display());
                return Err(OpsError::StaleSnapshot(leftover));
            }
        }

        let parent = self
            .root
            .parent()
            .ok_or_else(|| OpsError::Config(format!("{} has no parent directory", self.root.display())))?;
        // Scratch space on the same filesystem as the root so the swap is a rename
        let scratch = tempfile::Builder::new()
            .prefix(".stackguard-restore-")
            .tempdir_in(parent)?;

        // INIT
        info!("[{}] Preparing restore from {}", RestoreStage::Init, archive.display());
        let source = self.prepare_source(archive, scratch.path())?;
        if skip_verify {
            warn!("Archive verification skipped");
        } else {
            IntegrityVerifier::new(self.codec.clone())
                .verify(&source)
                .map_err(|e| {
                    error!("Archive rejected, deployment untouched: {}", e);
                    e
                })?;
        }

        let mut state = RunState {
            had_root: self.root.exists(),
            swapped: false,
        };

        // SNAPSHOT
        self.take_snapshot();

        // STOP
        self.stop_services(RestoreStage::Stop).await;

        // EXTRACT
        info!("[{}] Extracting archive", RestoreStage::Extract);
        let staging = scratch.path().join("staging");
        if let Err(e) = self.codec.extract(&source, &staging) {
            return Ok(self.rollback(RestoreStage::Extract, format!("{:#}", e), &state).await);
        }

        // VALIDATE
        let missing: Vec<&str> = [COMPOSE_FILE, ENV_FILE]
            .into_iter()
            .filter(|f| !staging.join(f).exists())
            .collect();
        if !missing.is_empty() {
            let reason = format!("extracted archive lacks {}", missing.join(", "));
            return Ok(self.rollback(RestoreStage::Validate, reason, &state).await);
        }

        // SWAP
        info!("[{}] Swapping deployment root", RestoreStage::Swap);
        if let Err(reason) = self.swap(&staging, state.had_root) {
            return Ok(self.rollback(RestoreStage::Swap, reason, &state).await);
        }
        state.swapped = true;

        // RESTORE_DATA
        let warnings = self.restore_data().await;

        // START
        info!("[{}] Starting services", RestoreStage::Start);
        let start = RetryPolicy::once(self.config.timeouts.start)
            .run("start services", |_| self.runtime.start_services(), |_| Ok(()))
            .await;
        if let Err(e) = start {
            return Ok(self.rollback(RestoreStage::Start, e.to_string(), &state).await);
        }

        // SETTLE
        info!(
            "[{}] Waiting {} before health checks",
            RestoreStage::Settle,
            humantime::format_duration(self.config.timeouts.settle)
        );
        tokio::time::sleep(self.config.timeouts.settle).await;
        let unhealthy = self.unhealthy_services().await;
        if !unhealthy.is_empty() {
            let reason = format!("critical services not healthy: {}", unhealthy.join(", "));
            return Ok(self.rollback(RestoreStage::Settle, reason, &state).await);
        }

        // CLEANUP
        for leftover in [self.aside_path(), self.snapshot_path()] {
            if let Err(e) = remove_path(&leftover) {
                warn!("[{}] Could not remove {}: {}", RestoreStage::Cleanup, leftover.display(), e);
            }
        }

        info!("Restore from {} completed", archive.display());
        Ok(RestoreOutcome::Success { warnings })
    }

    /// Plain archive to restore from; encrypted archives are decrypted into `scratch`
    fn prepare_source(&self, archive: &Path, scratch: &Path) -> OpsResult<PathBuf> {
        if !archive.is_file() {
            return Err(OpsError::integrity(archive, "archive does not exist"));
        }
        if !archive.to_string_lossy().ends_with(ENCRYPTED_EXTENSION) {
            return Ok(archive.to_path_buf());
        }

        let name = decrypted_path(archive)
            .and_then(|p| p.file_name().map(|n| n.to_owned()))
            .ok_or_else(|| OpsError::integrity(archive, "cannot derive decrypted name"))?;
        let output = scratch.join(name);

        match &self.encryption {
            Some(manager) => manager.decrypt_to(archive, &output),
            None => EncryptionManager::from_config(&self.config)?.decrypt_to(archive, &output),
        }
    }

    /// Best effort: a missing root or a failed copy only costs the snapshot
    fn take_snapshot(&self) {
        let snapshot = self.snapshot_path();
        if !self.root.exists() {
            warn!("[{}] {} does not exist; nothing to snapshot", RestoreStage::Snapshot, self.root.display());
            return;
        }

        match copy_dir_recursive(&self.root, &snapshot) {
            Ok(bytes) => info!(
                "[{}] Rollback snapshot at {} ({} bytes)",
                RestoreStage::Snapshot,
                snapshot.display(),
                bytes
            ),
            Err(e) => {
                warn!("[{}] Snapshot failed, continuing without it: {:#}", RestoreStage::Snapshot, e);
                if let Err(e) = remove_path(&snapshot) {
                    warn!("Could not remove partial snapshot {}: {}", snapshot.display(), e);
                }
            }
        }
    }

    /// Bounded stop; escalates to killing the project's containers
    async fn stop_services(&self, stage: RestoreStage) {
        info!("[{}] Stopping services", stage);
        let stop = RetryPolicy::once(self.config.timeouts.stop)
            .run("stop services", |_| self.runtime.stop_services(), |_| Ok(()))
            .await;

        if let Err(e) = stop {
            warn!("[{}] Graceful stop failed ({}); forcing", stage, e);
            match self.runtime.force_stop_services().await {
                Ok(killed) => info!("[{}] Force-stopped {} container(s)", stage, killed),
                Err(e) => warn!("[{}] Force stop failed: {:#}", stage, e),
            }
        }
    }

    /// Move the live root aside and the staging tree into place
    fn swap(&self, staging: &Path, had_root: bool) -> Result<(), String> {
        let aside = self.aside_path();
        if had_root {
            fs::rename(&self.root, &aside).map_err(|e| format!("cannot move live root aside: {}", e))?;
        }

        if let Err(e) = fs::rename(staging, &self.root) {
            let reason = format!("cannot move restored tree into place: {}", e);
            if had_root {
                if let Err(back) = fs::rename(&aside, &self.root) {
                    error!("Could not put {} back: {}", aside.display(), back);
                    return Err(format!("{}; restoring the original root also failed: {}", reason, back));
                }
            }
            return Err(reason);
        }

        Ok(())
    }

    /// Volumes and database from the restored tree. Every failure here is a warning.
    async fn restore_data(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        info!("[{}] Restoring volumes and database", RestoreStage::RestoreData);

        let reserved = self.root.join(RESERVED_DIR);
        for export in volume_exports(&self.root.join(VOLUME_EXPORTS_DIR)) {
            let Some(logical) = export
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_suffix(".tar.gz"))
                .map(|n| n.to_string())
            else {
                continue;
            };

            let volume = match self.runtime.resolve_volume(&logical).await {
                Ok(Some(volume)) => volume,
                Ok(None) => self.runtime.qualify_volume(&logical),
                Err(e) => {
                    warnings.push(format!("cannot resolve volume {}: {:#}", logical, e));
                    continue;
                }
            };

            match self.runtime.import_volume(&volume, export.clone()).await {
                Ok(()) => info!("Restored volume {}", volume),
                Err(e) => warnings.push(format!("volume {} not restored: {:#}", volume, e)),
            }
        }

        let dumps = dump_files(&self.root);
        match dumps.as_slice() {
            [] => warnings.push("no database dump in restored tree".to_string()),
            [dump] => {
                if let Err(e) = self.restore_database(dump).await {
                    warnings.push(format!("database not restored: {}", e));
                }
            }
            many => warnings.push(format!("{} database dumps in restored tree; database not restored", many.len())),
        }

        // The live root must not carry restore artefacts into the next backup
        let mut artefacts = dumps;
        artefacts.push(reserved);
        for artefact in artefacts {
            if let Err(e) = remove_path(&artefact) {
                warn!("Could not remove {}: {}", artefact.display(), e);
            }
        }

        for warning in &warnings {
            warn!("[{}] {}", RestoreStage::RestoreData, warning);
        }
        warnings
    }

    async fn restore_database(&self, dump: &Path) -> Result<(), String> {
        let service = self.config.services.database.as_str();
        self.runtime
            .start_service(service)
            .await
            .map_err(|e| format!("cannot start {}: {:#}", service, e))?;

        let ready = RetryPolicy::new(self.config.timeouts.db_dump_attempts, self.config.timeouts.retry_delay)
            .run(
                "database readiness",
                |_| async move {
                    let container = self
                        .runtime
                        .find_container(service)
                        .await?
                        .ok_or_else(|| anyhow::anyhow!("service '{}' not found", service))?;
                    let out = self
                        .runtime
                        .exec(
                            &container.name,
                            vec!["pg_isready".to_string(), "-U".to_string(), self.credentials.user.clone()],
                        )
                        .await?;
                    Ok::<_, anyhow::Error>((container.name, out))
                },
                |ready: &(String, ExecOutput)| {
                    if ready.1.success() {
                        Ok(())
                    } else {
                        Err(format!("pg_isready exit {}", ready.1.exit_code))
                    }
                },
            )
            .await
            .map_err(|e| e.to_string())?;
        let container = ready.0;

        let command = vec![
            "psql".to_string(),
            "-U".to_string(),
            self.credentials.user.clone(),
            "-d".to_string(),
            self.credentials.database.clone(),
        ];
        let out = RetryPolicy::once(self.config.timeouts.db_restore)
            .run(
                "database restore",
                |_| self.runtime.exec_with_input(&container, command.clone(), dump.to_path_buf()),
                |out: &ExecOutput| {
                    if out.success() {
                        Ok(())
                    } else {
                        Err(format!("psql exited with {}: {}", out.exit_code, out.stderr_text()))
                    }
                },
            )
            .await
            .map_err(|e| e.to_string())?;

        debug!("psql wrote {} bytes of output", out.stdout.len());
        info!("Database restored from {}", dump.display());
        Ok(())
    }

    async fn unhealthy_services(&self) -> Vec<String> {
        let mut unhealthy = Vec::new();
        for service in &self.config.services.critical {
            match self.runtime.find_container(service).await {
                Ok(Some(container)) if container.is_healthy() => {
                    debug!("{} is {}", service, container.status);
                }
                Ok(Some(container)) => unhealthy.push(format!(
                    "{} ({}{})",
                    service,
                    container.state.as_str().to_lowercase(),
                    container.health.map(|h| format!(", {}", h)).unwrap_or_default()
                )),
                Ok(None) => unhealthy.push(format!("{} (not found)", service)),
                Err(e) => unhealthy.push(format!("{} ({:#})", service, e)),
            }
        }
        unhealthy
    }

    async fn rollback(&self, stage: RestoreStage, reason: String, state: &RunState) -> RestoreOutcome {
        error!("[{}] Restore failed: {}; rolling back", stage, reason);

        // Services started from the restored tree must be down before it is replaced
        if state.swapped {
            self.stop_services(RestoreStage::Rollback).await;
        }

        if state.swapped || !self.root.exists() {
            if let Err(e) = self.reinstate(state.had_root) {
                error!(
                    "[{}] ROLLBACK FAILED: {}. Manual intervention required; nothing further will be attempted. \
                     Inspect {} and {}",
                    RestoreStage::Rollback,
                    e,
                    self.snapshot_path().display(),
                    self.aside_path().display()
                );
                return RestoreOutcome::Fatal {
                    stage,
                    reason: format!("{}; rollback failed: {}", reason, e),
                };
            }
        }

        for leftover in [self.snapshot_path(), self.aside_path()] {
            if let Err(e) = remove_path(&leftover) {
                warn!("[{}] Could not remove {}: {}", RestoreStage::Rollback, leftover.display(), e);
            }
        }

        let restart = RetryPolicy::once(self.config.timeouts.start)
            .run("restart services", |_| self.runtime.start_services(), |_| Ok(()))
            .await;
        if let Err(e) = restart {
            warn!("[{}] Services did not restart after rollback: {}", RestoreStage::Rollback, e);
        }

        info!("[{}] Previous deployment reinstated", RestoreStage::Rollback);
        RestoreOutcome::RolledBack { stage, reason }
    }

    /// Put the pre-restore root back: the snapshot first, the swapped-aside root otherwise
    fn reinstate(&self, had_root: bool) -> Result<(), String> {
        let source = [self.snapshot_path(), self.aside_path()]
            .into_iter()
            .find(|p| p.is_dir());

        let Some(source) = source else {
            if had_root {
                return Err("neither the rollback snapshot nor the original root is available".to_string());
            }
            // There was no root before the restore
            return remove_path(&self.root).map_err(|e| format!("cannot remove restored root: {}", e));
        };

        remove_path(&self.root).map_err(|e| format!("cannot remove restored root: {}", e))?;
        fs::rename(&source, &self.root)
            .map_err(|e| format!("cannot move {} into place: {}", source.display(), e))?;
        info!("Reinstated {} from {}", self.root.display(), source.display());
        Ok(())
    }
}

fn volume_exports(dir: &Path) -> Vec<PathBuf> {
    let mut exports: Vec<PathBuf> = fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && p.to_string_lossy().ends_with(".tar.gz"))
                .collect()
        })
        .unwrap_or_default();
    exports.sort();
    exports
}

fn dump_files(root: &Path) -> Vec<PathBuf> {
    let mut dumps: Vec<PathBuf> = fs::read_dir(root)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| is_dump_entry(&e.file_name().to_string_lossy()))
                .map(|e| e.path())
                .collect()
        })
        .unwrap_or_default();
    dumps.sort();
    dumps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::archive::write_checksum;
    use crate::core::backup::BackupCreator;
    use crate::core::cipher::Aes256CbcCipher;
    use crate::core::codec::{ArchiveSource, Exclusions, TarGzCodec};
    use crate::core::docker::{ContainerInfo, MockContainerRuntime};
    use crate::core::preflight::PreflightChecker;
    use crate::core::secrets::{KeyChain, KeyFileStore, SecretStore};
    use crate::utils::ContainerState;
    use anyhow::anyhow;
    use rand::RngCore;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;
    use walkdir::WalkDir;

    struct Fixture {
        dir: TempDir,
        config: AppConfig,
        root: PathBuf,
        archive: PathBuf,
    }

    impl Fixture {
        fn parent_leftovers(&self) -> Vec<String> {
            fs::read_dir(self.dir.path())
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
                .filter(|n| n.starts_with(".stackguard-restore-") || n.ends_with(".rollback") || n.ends_with(".old"))
                .collect()
        }
    }

    fn tree(root: &Path) -> BTreeMap<String, Vec<u8>> {
        WalkDir::new(root)
            .min_depth(1)
            .into_iter()
            .map(|e| e.unwrap())
            .map(|e| {
                let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().to_string();
                let data = if e.file_type().is_file() { fs::read(e.path()).unwrap() } else { Vec::new() };
                (rel, data)
            })
            .collect()
    }

    /// Live root holds the "old" deployment; the archive carries a "new" one
    fn fixture(with_env_in_archive: bool) -> Fixture {
        let dir = TempDir::new().unwrap();
        let root = dir.path().join("stack");
        fs::create_dir_all(root.join("config")).unwrap();
        fs::write(root.join(COMPOSE_FILE), "services: {old: {}}\n").unwrap();
        fs::write(root.join(ENV_FILE), "POSTGRES_USER=app\nPOSTGRES_DB=appdb\n").unwrap();
        fs::write(root.join("config").join("app.toml"), "version = \"old\"\n").unwrap();

        let source = dir.path().join("source");
        fs::create_dir_all(source.join("config")).unwrap();
        fs::create_dir_all(source.join(VOLUME_EXPORTS_DIR)).unwrap();
        fs::create_dir_all(source.join("volumes/pgdata")).unwrap();
        fs::write(source.join("volumes/pgdata/PG_VERSION"), "16").unwrap();
        fs::write(source.join(COMPOSE_FILE), "services: {new: {}}\n").unwrap();
        if with_env_in_archive {
            fs::write(source.join(ENV_FILE), "POSTGRES_USER=app\nPOSTGRES_DB=appdb\n").unwrap();
        }
        fs::write(source.join("config").join("app.toml"), "version = \"new\"\n").unwrap();
        fs::write(source.join("database_backup_20260101_000000.sql"), "-- PostgreSQL database dump\n").unwrap();
        fs::write(source.join(VOLUME_EXPORTS_DIR).join("uploads.tar.gz"), b"vol").unwrap();
        let mut noise = vec![0u8; 2 * 1024 * 1024];
        rand::thread_rng().fill_bytes(&mut noise);
        fs::write(source.join("config").join("blob.bin"), &noise).unwrap();

        let backups = dir.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        let archive = backups.join("stack_backup_20260101_000000.tar.gz");
        TarGzCodec::new()
            .create(&[ArchiveSource::contents_of(&source)], &Exclusions::new(), &archive)
            .unwrap();

        let mut config = AppConfig::default();
        config.deployment_root = Some(root.clone());
        config.backup_dir = Some(backups);
        config.services.critical = vec!["postgres".into(), "api".into()];
        config.timeouts.settle = Duration::ZERO;
        config.timeouts.retry_delay = Duration::ZERO;
        config.timeouts.stop = Duration::from_secs(5);
        config.timeouts.start = Duration::from_secs(5);

        Fixture { dir, config, root, archive }
    }

    fn container(name: &str, healthy: bool) -> ContainerInfo {
        ContainerInfo {
            id: name.into(),
            name: format!("stack-{}-1", name),
            image: "img".into(),
            status: "Up".into(),
            state: ContainerState::Running,
            health: Some(if healthy { "healthy" } else { "unhealthy" }.into()),
        }
    }

    /// Runtime where every data step succeeds; start and health behaviour are scripted
    fn scripted_runtime<S, H>(start: S, healthy: H) -> MockContainerRuntime
    where
        S: Fn(usize) -> anyhow::Result<()> + Send + 'static,
        H: Fn(&str) -> bool + Send + 'static,
    {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_stop_services().returning(|| Ok(()));
        runtime.expect_force_stop_services().never();
        runtime
            .expect_resolve_volume()
            .returning(|v| Ok(Some(format!("stack_{}", v))));
        runtime.expect_import_volume().returning(|_, _| Ok(()));
        runtime.expect_start_service().returning(|_| Ok(()));
        runtime
            .expect_find_container()
            .returning(move |s| Ok(Some(container(s, healthy(s)))));
        runtime.expect_exec().returning(|_, _| Ok(ExecOutput::default()));
        runtime
            .expect_exec_with_input()
            .returning(|_, _, _| Ok(ExecOutput::default()));
        let calls = AtomicUsize::new(0);
        runtime
            .expect_start_services()
            .returning(move || start(calls.fetch_add(1, Ordering::SeqCst)));
        runtime
    }

    fn orchestrator(f: &Fixture, runtime: MockContainerRuntime) -> RestoreOrchestrator {
        RestoreOrchestrator::new(&f.config, Arc::new(runtime), Arc::new(TarGzCodec::new())).unwrap()
    }

    #[tokio::test]
    async fn test_successful_restore_replaces_root() {
        let f = fixture(true);
        let mut runtime = MockContainerRuntime::new();
        runtime
            .expect_stop_services()
            .returning(|| Err(anyhow!("timed out")));
        runtime.expect_force_stop_services().times(1).returning(|| Ok(3));
        runtime.expect_resolve_volume().returning(|_| Ok(None));
        runtime
            .expect_qualify_volume()
            .returning(|v| format!("stack_{}", v));
        runtime
            .expect_import_volume()
            .withf(|v, src| v == "stack_uploads" && src.ends_with(".stackguard/volumes/uploads.tar.gz"))
            .times(1)
            .returning(|_, _| Ok(()));
        runtime
            .expect_start_service()
            .withf(|s| s == "postgres")
            .times(1)
            .returning(|_| Ok(()));
        runtime
            .expect_find_container()
            .returning(|s| Ok(Some(container(s, true))));
        runtime.expect_exec().returning(|_, _| Ok(ExecOutput::default()));
        runtime
            .expect_exec_with_input()
            .withf(|c, cmd, dump| {
                c == "stack-postgres-1"
                    && cmd[0] == "psql"
                    && cmd.contains(&"appdb".to_string())
                    && dump.ends_with("database_backup_20260101_000000.sql")
            })
            .times(1)
            .returning(|_, _, _| Ok(ExecOutput::default()));
        runtime.expect_start_services().times(1).returning(|| Ok(()));

        let outcome = orchestrator(&f, runtime).restore(&f.archive, false).await.unwrap();
        assert_eq!(outcome, RestoreOutcome::Success { warnings: vec![] });

        assert_eq!(
            fs::read_to_string(f.root.join("config").join("app.toml")).unwrap(),
            "version = \"new\"\n"
        );
        assert!(!f.root.join(RESERVED_DIR).exists());
        assert_eq!(fs::read_to_string(f.root.join("volumes/pgdata/PG_VERSION")).unwrap(), "16");
        assert!(dump_files(&f.root).is_empty());
        assert!(f.parent_leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_validation_failure_rolls_back_untouched() {
        let f = fixture(false);
        let before = tree(&f.root);
        let runtime = scripted_runtime(|_| Ok(()), |_| true);

        let outcome = orchestrator(&f, runtime).restore(&f.archive, false).await.unwrap();
        match &outcome {
            RestoreOutcome::RolledBack { stage, reason } => {
                assert_eq!(*stage, RestoreStage::Validate);
                assert!(reason.contains(".env"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(outcome.error(), Some(OpsError::RestoreValidationFailure(_))));
        assert_eq!(tree(&f.root), before);
        assert!(f.parent_leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_start_failure_restores_previous_root() {
        let f = fixture(true);
        let before = tree(&f.root);
        let runtime = scripted_runtime(
            |call| if call == 0 { Err(anyhow!("port already allocated")) } else { Ok(()) },
            |_| true,
        );

        let outcome = orchestrator(&f, runtime).restore(&f.archive, false).await.unwrap();
        assert!(matches!(outcome, RestoreOutcome::RolledBack { stage: RestoreStage::Start, .. }));
        assert!(matches!(outcome.error(), Some(OpsError::ServiceStartFailure(_))));
        assert_eq!(tree(&f.root), before);
        assert!(f.parent_leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_unhealthy_service_after_settle_rolls_back() {
        let f = fixture(true);
        let before = tree(&f.root);
        let runtime = scripted_runtime(|_| Ok(()), |s| s != "api");

        let outcome = orchestrator(&f, runtime).restore(&f.archive, false).await.unwrap();
        match outcome {
            RestoreOutcome::RolledBack { stage, reason } => {
                assert_eq!(stage, RestoreStage::Settle);
                assert!(reason.contains("api"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(tree(&f.root), before);
    }

    #[tokio::test]
    async fn test_unverifiable_archive_never_touches_root() {
        let f = fixture(true);
        let before = tree(&f.root);
        let mut bytes = fs::read(&f.archive).unwrap();
        let len = bytes.len();
        for b in &mut bytes[len - 64..] {
            *b ^= 0xA5;
        }
        fs::write(&f.archive, &bytes).unwrap();

        let mut runtime = MockContainerRuntime::new();
        runtime.expect_stop_services().never();
        runtime.expect_start_services().never();

        let result = orchestrator(&f, runtime).restore(&f.archive, false).await;
        assert!(matches!(result, Err(OpsError::IntegrityFailure { .. })));
        assert_eq!(tree(&f.root), before);
        assert!(f.parent_leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_stale_snapshot_is_surfaced() {
        let f = fixture(true);
        let stale = f.dir.path().join("stack.rollback");
        fs::create_dir_all(&stale).unwrap();

        let runtime = MockContainerRuntime::new();
        match orchestrator(&f, runtime).restore(&f.archive, false).await {
            Err(OpsError::StaleSnapshot(path)) => assert_eq!(path, stale),
            other => panic!("unexpected {:?}", other),
        }
        assert!(stale.exists());
    }

    #[tokio::test]
    async fn test_rollback_failure_is_fatal() {
        let f = fixture(true);
        let snapshot = f.dir.path().join("stack.rollback");
        let aside = f.dir.path().join("stack.old");
        let runtime = scripted_runtime(
            move |_| {
                // Pull both recovery sources away before the failure is reported
                fs::remove_dir_all(&snapshot)?;
                fs::remove_dir_all(&aside)?;
                Err(anyhow!("compose up failed"))
            },
            |_| true,
        );

        let outcome = orchestrator(&f, runtime).restore(&f.archive, false).await.unwrap();
        match &outcome {
            RestoreOutcome::Fatal { stage, reason } => {
                assert_eq!(*stage, RestoreStage::Start);
                assert!(reason.contains("rollback failed"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(outcome.error(), Some(OpsError::RollbackFailure(_))));
        assert!(f.root.join(COMPOSE_FILE).exists(), "no further remediation touches the root");
    }

    #[tokio::test]
    async fn test_encrypted_archive_is_decrypted_to_scratch() {
        let f = fixture(true);
        let key_file = f.dir.path().join("keys").join("backup.key");
        let manager = || {
            let stores: Vec<Box<dyn SecretStore>> = vec![Box::new(KeyFileStore::new(&key_file))];
            EncryptionManager::new(Arc::new(Aes256CbcCipher::new()), KeyChain::new(stores), "k", 1_000)
        };
        write_checksum(&f.archive).unwrap();
        let encrypted = manager().encrypt(&f.archive).unwrap();

        let runtime = scripted_runtime(|_| Ok(()), |_| true);
        let outcome = orchestrator(&f, runtime)
            .with_encryption(manager())
            .restore(&encrypted, false)
            .await
            .unwrap();

        assert!(outcome.is_success());
        assert_eq!(
            fs::read_to_string(f.root.join("config").join("app.toml")).unwrap(),
            "version = \"new\"\n"
        );
        assert!(!f.archive.exists(), "plaintext is only ever written to scratch");
        assert!(f.parent_leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_stops_restored_services_before_reinstating() {
        let f = fixture(true);
        let before = tree(&f.root);
        let root = f.root.clone();
        let stops = Arc::new(AtomicUsize::new(0));
        let seen = stops.clone();

        let mut runtime = MockContainerRuntime::new();
        runtime.expect_stop_services().times(2).returning(move || {
            // The second stop happens while the restored tree is still live
            if seen.fetch_add(1, Ordering::SeqCst) == 1 {
                let app = fs::read_to_string(root.join("config").join("app.toml"))?;
                anyhow::ensure!(app.contains("new"), "stopped after reinstating");
            }
            Ok(())
        });
        runtime.expect_force_stop_services().never();
        runtime
            .expect_resolve_volume()
            .returning(|v| Ok(Some(format!("stack_{}", v))));
        runtime.expect_import_volume().returning(|_, _| Ok(()));
        runtime.expect_start_service().returning(|_| Ok(()));
        runtime
            .expect_find_container()
            .returning(|s| Ok(Some(container(s, true))));
        runtime.expect_exec().returning(|_, _| Ok(ExecOutput::default()));
        runtime
            .expect_exec_with_input()
            .returning(|_, _, _| Ok(ExecOutput::default()));
        let calls = AtomicUsize::new(0);
        runtime.expect_start_services().times(2).returning(move || {
            if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(anyhow!("port already allocated"))
            } else {
                Ok(())
            }
        });

        let outcome = orchestrator(&f, runtime).restore(&f.archive, false).await.unwrap();
        assert!(matches!(outcome, RestoreOutcome::RolledBack { stage: RestoreStage::Start, .. }));
        assert_eq!(stops.load(Ordering::SeqCst), 2);
        assert_eq!(tree(&f.root), before);
    }

    #[tokio::test]
    async fn test_swap_failure_keeps_live_root() {
        let f = fixture(true);
        let before = tree(&f.root);
        let aside = f.dir.path().join("stack.old");

        let mut runtime = MockContainerRuntime::new();
        // Occupy the swap-aside path once the stale check has passed
        runtime.expect_stop_services().times(1).returning(move || {
            fs::create_dir_all(aside.join("occupied"))?;
            Ok(())
        });
        runtime.expect_force_stop_services().never();
        runtime.expect_import_volume().never();
        runtime.expect_start_services().times(1).returning(|| Ok(()));

        let outcome = orchestrator(&f, runtime).restore(&f.archive, false).await.unwrap();
        match &outcome {
            RestoreOutcome::RolledBack { stage, reason } => {
                assert_eq!(*stage, RestoreStage::Swap);
                assert!(reason.contains("cannot move live root aside"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(outcome.error(), Some(OpsError::AtomicSwapFailure(_))));
        assert_eq!(tree(&f.root), before);
        assert!(f.parent_leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_extract_failure_without_verification_rolls_back() {
        let f = fixture(true);
        let before = tree(&f.root);
        let bytes = fs::read(&f.archive).unwrap();
        fs::write(&f.archive, &bytes[..bytes.len() / 2]).unwrap();

        let mut runtime = MockContainerRuntime::new();
        runtime.expect_stop_services().times(1).returning(|| Ok(()));
        runtime.expect_import_volume().never();
        runtime.expect_start_services().times(1).returning(|| Ok(()));

        let outcome = orchestrator(&f, runtime).restore(&f.archive, true).await.unwrap();
        assert!(matches!(outcome, RestoreOutcome::RolledBack { stage: RestoreStage::Extract, .. }));
        assert!(matches!(outcome.error(), Some(OpsError::RestoreValidationFailure(_))));
        assert_eq!(tree(&f.root), before);
        assert!(f.parent_leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_restore_without_previous_root() {
        let f = fixture(true);
        fs::remove_dir_all(&f.root).unwrap();

        let runtime = scripted_runtime(|_| Ok(()), |_| true);
        let outcome = orchestrator(&f, runtime).restore(&f.archive, false).await.unwrap();
        assert!(outcome.is_success());
        assert_eq!(
            fs::read_to_string(f.root.join("config").join("app.toml")).unwrap(),
            "version = \"new\"\n"
        );
        assert!(f.parent_leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_failed_restore_without_previous_root_removes_tree() {
        let f = fixture(true);
        fs::remove_dir_all(&f.root).unwrap();

        let runtime = scripted_runtime(
            |call| if call == 0 { Err(anyhow!("compose up failed")) } else { Ok(()) },
            |_| true,
        );
        let outcome = orchestrator(&f, runtime).restore(&f.archive, false).await.unwrap();
        assert!(matches!(outcome, RestoreOutcome::RolledBack { stage: RestoreStage::Start, .. }));
        assert!(!f.root.exists());
        assert!(f.parent_leftovers().is_empty());
    }

    #[tokio::test]
    async fn test_backup_then_restore_round_trip() {
        const DUMP: &str = "--\n-- PostgreSQL database dump\n--\nCREATE TABLE t ();\n";

        let dir = TempDir::new().unwrap();
        let root = dir.path().join("stack");
        fs::create_dir_all(root.join("config")).unwrap();
        fs::create_dir_all(root.join("volumes/pgdata")).unwrap();
        fs::write(root.join(COMPOSE_FILE), "services:\n  postgres: {}\n").unwrap();
        fs::write(root.join(ENV_FILE), "POSTGRES_USER=app\nPOSTGRES_DB=appdb\n").unwrap();
        fs::write(root.join("config").join("app.toml"), "version = 1\n").unwrap();
        fs::write(root.join("volumes/pgdata/PG_VERSION"), "16").unwrap();
        let mut noise = vec![0u8; 2 * 1024 * 1024];
        rand::thread_rng().fill_bytes(&mut noise);
        fs::write(root.join("config").join("blob.bin"), &noise).unwrap();

        let mut config = AppConfig::default();
        config.deployment_root = Some(root.clone());
        config.backup_dir = Some(dir.path().join("backups"));
        config.services.critical = vec!["postgres".into()];
        config.volumes.critical = vec!["uploads".into()];
        config.timeouts.settle = Duration::ZERO;
        config.timeouts.retry_delay = Duration::ZERO;

        let mut backup_runtime = MockContainerRuntime::new();
        backup_runtime.expect_ping().returning(|| true);
        backup_runtime
            .expect_find_container()
            .returning(|s| Ok(Some(container(s, true))));
        backup_runtime.expect_exec().returning(|_, cmd| {
            let stdout = if cmd[0] == "pg_dump" { DUMP.as_bytes().to_vec() } else { Vec::new() };
            Ok(ExecOutput { exit_code: 0, stdout, stderr: Vec::new() })
        });
        backup_runtime
            .expect_resolve_volume()
            .returning(|v| Ok(Some(format!("stack_{}", v))));
        backup_runtime.expect_export_volume().returning(|_, dest| {
            fs::write(dest, b"uploads-export")?;
            Ok(())
        });
        let backup_runtime: Arc<dyn ContainerRuntime> = Arc::new(backup_runtime);
        let creds = DatabaseCredentials::resolve(&config, &root);
        let summary = BackupCreator::new(&config, backup_runtime.clone(), Arc::new(TarGzCodec::new()))
            .unwrap()
            .with_preflight(
                PreflightChecker::new(backup_runtime, &config, creds).with_free_space_probe(|_| Some(u64::MAX)),
            )
            .create()
            .await
            .unwrap();
        let before = tree(&root);

        fs::write(root.join("config").join("app.toml"), "version = 2\n").unwrap();
        fs::write(root.join("config").join("extra.toml"), "x = 1\n").unwrap();

        let mut runtime = MockContainerRuntime::new();
        runtime.expect_stop_services().returning(|| Ok(()));
        runtime
            .expect_resolve_volume()
            .returning(|v| Ok(Some(format!("stack_{}", v))));
        runtime
            .expect_import_volume()
            .withf(|v, src| v == "stack_uploads" && fs::read(src).map(|b| b == b"uploads-export").unwrap_or(false))
            .times(1)
            .returning(|_, _| Ok(()));
        runtime.expect_start_service().returning(|_| Ok(()));
        runtime
            .expect_find_container()
            .returning(|s| Ok(Some(container(s, true))));
        runtime.expect_exec().returning(|_, _| Ok(ExecOutput::default()));
        runtime
            .expect_exec_with_input()
            .withf(|_, _, dump| fs::read_to_string(dump).map(|d| d == DUMP).unwrap_or(false))
            .times(1)
            .returning(|_, _, _| Ok(ExecOutput::default()));
        runtime.expect_start_services().times(1).returning(|| Ok(()));

        let orchestrator =
            RestoreOrchestrator::new(&config, Arc::new(runtime), Arc::new(TarGzCodec::new())).unwrap();
        let outcome = orchestrator.restore(&summary.archive.path, false).await.unwrap();

        assert_eq!(outcome, RestoreOutcome::Success { warnings: vec![] });
        assert_eq!(tree(&root), before);
        assert!(!root.join(RESERVED_DIR).exists());
        assert!(dump_files(&root).is_empty());
    }

    #[test]
    fn test_outcome_errors_map_to_exit_codes() {
        let rolled = RestoreOutcome::RolledBack { stage: RestoreStage::Swap, reason: "x".into() };
        assert_eq!(rolled.error().unwrap().exit_code(), 20);
        let fatal = RestoreOutcome::Fatal { stage: RestoreStage::Start, reason: "x".into() };
        assert_eq!(fatal.error().unwrap().exit_code(), 30);
        assert!(RestoreOutcome::Success { warnings: vec![] }.error().is_none());
    }
}
