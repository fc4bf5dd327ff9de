/// Runtime readiness checks before a backup
///
/// Only an unreachable container runtime fails the check. Everything else is
/// reported as a warning and left for the backup itself to fail on.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysinfo::Disks;
use tracing::{debug, info, warn};

use crate::core::config::DatabaseCredentials;
use crate::core::docker::ContainerRuntime;
use crate::utils::{format_bytes, AppConfig, MIN_FREE_SPACE};

#[derive(Debug, Clone, PartialEq)]
pub enum PreflightOutcome {
    Pass { warnings: Vec<String> },
    Fail { reasons: Vec<String> },
}

pub struct PreflightChecker {
    runtime: Arc<dyn ContainerRuntime>,
    database_service: String,
    secrets_service: String,
    credentials: DatabaseCredentials,
    free_space: fn(&Path) -> Option<u64>,
}

impl PreflightChecker {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: &AppConfig, credentials: DatabaseCredentials) -> Self {
        Self {
            runtime,
            database_service: config.services.database.clone(),
            secrets_service: config.services.secrets_store.clone(),
            credentials,
            free_space,
        }
    }

    /// Replace the free-space lookup (the default asks the OS)
    pub fn with_free_space_probe(mut self, probe: fn(&Path) -> Option<u64>) -> Self {
        self.free_space = probe;
        self
    }

    pub async fn check(&self, destination: &Path) -> PreflightOutcome {
        if !self.runtime.ping().await {
            return PreflightOutcome::Fail {
                reasons: vec!["container runtime is not reachable".to_string()],
            };
        }

        let mut warnings = Vec::new();

        let database = self.probe_service(&self.database_service, &mut warnings).await;
        self.probe_service(&self.secrets_service, &mut warnings).await;

        if let Some(container) = database {
            let command = vec![
                "pg_isready".to_string(),
                "-U".to_string(),
                self.credentials.user.clone(),
            ];
            match self.runtime.exec(&container, command).await {
                Ok(out) if out.success() => debug!("Database accepts connections"),
                Ok(out) => warnings.push(format!(
                    "database is not ready for queries (pg_isready exit {})",
                    out.exit_code
                )),
                Err(e) => warnings.push(format!("database readiness check failed: {:#}", e)),
            }
        }

        match (self.free_space)(destination) {
            Some(available) if available < MIN_FREE_SPACE => warnings.push(format!(
                "only {} free on backup destination, at least {} recommended",
                format_bytes(available),
                format_bytes(MIN_FREE_SPACE)
            )),
            Some(available) => debug!("{} free on backup destination", format_bytes(available)),
            None => warnings.push(format!(
                "could not determine free space for {}",
                destination.display()
            )),
        }

        for warning in &warnings {
            warn!("Preflight: {}", warning);
        }
        info!("Preflight passed with {} warning(s)", warnings.len());

        PreflightOutcome::Pass { warnings }
    }

    /// Running container name for `service`, recording a warning otherwise
    async fn probe_service(&self, service: &str, warnings: &mut Vec<String>) -> Option<String> {
        match self.runtime.find_container(service).await {
            Ok(Some(container)) if container.state.is_running() => Some(container.name),
            Ok(Some(container)) => {
                warnings.push(format!("service '{}' is {}", service, container.state.as_str().to_lowercase()));
                None
            }
            Ok(None) => {
                warnings.push(format!("service '{}' not found", service));
                None
            }
            Err(e) => {
                warnings.push(format!("lookup of service '{}' failed: {:#}", service, e));
                None
            }
        }
    }
}

/// Available bytes on the filesystem holding `path` (or its nearest existing ancestor)
pub fn free_space(path: &Path) -> Option<u64> {
    let mut probe: PathBuf = path.to_path_buf();
    while !probe.exists() {
        probe = probe.parent()?.to_path_buf();
    }
    let probe = probe.canonicalize().ok()?;

    let disks = Disks::new_with_refreshed_list();
    disks
        .list()
        .iter()
        .filter(|d| probe.starts_with(d.mount_point()))
        .max_by_key(|d| d.mount_point().as_os_str().len())
        .map(|d| d.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::docker::{ContainerInfo, ExecOutput, MockContainerRuntime};
    use crate::utils::ContainerState;
    use anyhow::anyhow;
    use tempfile::TempDir;

    fn container(name: &str, state: ContainerState) -> ContainerInfo {
        ContainerInfo {
            id: format!("id-{}", name),
            name: name.to_string(),
            image: "img".to_string(),
            status: String::new(),
            state,
            health: None,
        }
    }

    fn checker(runtime: MockContainerRuntime) -> PreflightChecker {
        let creds = DatabaseCredentials { user: "app".into(), database: "app".into() };
        PreflightChecker::new(Arc::new(runtime), &AppConfig::default(), creds)
            .with_free_space_probe(|_| Some(3 * MIN_FREE_SPACE))
    }

    #[tokio::test]
    async fn test_unreachable_runtime_is_the_only_hard_failure() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ping().returning(|| false);
        runtime.expect_find_container().never();

        let dir = TempDir::new().unwrap();
        let outcome = checker(runtime).check(dir.path()).await;
        assert!(matches!(outcome, PreflightOutcome::Fail { ref reasons } if reasons.len() == 1));
    }

    #[tokio::test]
    async fn test_healthy_services_pass_cleanly() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ping().returning(|| true);
        runtime
            .expect_find_container()
            .returning(|s| Ok(Some(container(&format!("stack-{}-1", s), ContainerState::Running))));
        runtime
            .expect_exec()
            .withf(|c, cmd| c == "stack-postgres-1" && cmd[0] == "pg_isready" && cmd[2] == "app")
            .times(1)
            .returning(|_, _| Ok(ExecOutput::default()));

        let dir = TempDir::new().unwrap();
        assert_eq!(
            checker(runtime).check(dir.path()).await,
            PreflightOutcome::Pass { warnings: vec![] }
        );
    }

    #[tokio::test]
    async fn test_degraded_services_only_warn() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ping().returning(|| true);
        runtime.expect_find_container().returning(|s| match s {
            "postgres" => Ok(Some(container("pg", ContainerState::Running))),
            _ => Err(anyhow!("daemon hiccup")),
        });
        runtime.expect_exec().returning(|_, _| {
            Ok(ExecOutput { exit_code: 2, ..Default::default() })
        });

        let dir = TempDir::new().unwrap();
        let outcome = checker(runtime)
            .with_free_space_probe(|_| Some(1024))
            .check(dir.path()).await;
        match outcome {
            PreflightOutcome::Pass { warnings } => {
                assert_eq!(warnings.len(), 3, "{:?}", warnings);
                assert!(warnings[0].contains("vault"));
                assert!(warnings[1].contains("not ready"));
                assert!(warnings[2].contains("free"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stopped_database_skips_readiness_probe() {
        let mut runtime = MockContainerRuntime::new();
        runtime.expect_ping().returning(|| true);
        runtime
            .expect_find_container()
            .returning(|s| Ok(Some(container(s, ContainerState::Stopped))));
        runtime.expect_exec().never();

        let dir = TempDir::new().unwrap();
        match checker(runtime).check(dir.path()).await {
            PreflightOutcome::Pass { warnings } => {
                assert!(warnings.iter().any(|w| w.contains("'postgres' is stopped")));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_free_space_for_missing_directory_uses_ancestor() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("not").join("yet");
        assert_eq!(free_space(&nested).is_some(), free_space(dir.path()).is_some());
    }
}
