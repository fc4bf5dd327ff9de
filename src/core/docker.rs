/// Docker and Docker Compose integration
///
/// `ContainerRuntime` is the typed seam the backup and restore components
/// talk to; `DockerManager` implements it over the Docker API (bollard) and
/// short-lived `docker compose` / `docker run` subprocesses.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bollard::container::{KillContainerOptions, ListContainersOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::ContainerSummary;
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::core::config::ConfigManager;
use crate::utils::{AppConfig, ContainerState, ENV_FILE};

const PROJECT_LABEL: &str = "com.docker.compose.project";
const SERVICE_LABEL: &str = "com.docker.compose.service";

#[derive(Debug, Clone, PartialEq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub image: String,
    pub status: String,
    pub state: ContainerState,
    pub health: Option<String>,
}

impl ContainerInfo {
    /// Running and not reported unhealthy by its healthcheck
    pub fn is_healthy(&self) -> bool {
        self.state.is_running() && self.health.as_deref() != Some("unhealthy")
    }
}

/// Result of a command executed inside a container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// Operations the lifecycle manager needs from the container runtime
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Whether the runtime daemon answers at all
    async fn ping(&self) -> bool;

    /// Locate the container backing a service: exact name, compose service label, then name pattern
    async fn find_container(&self, service: &str) -> Result<Option<ContainerInfo>>;

    async fn exec(&self, container: &str, command: Vec<String>) -> Result<ExecOutput>;

    /// Execute with `input` streamed to the command's stdin
    async fn exec_with_input(&self, container: &str, command: Vec<String>, input: PathBuf) -> Result<ExecOutput>;

    /// Actual volume name for a logical volume, if it exists
    async fn resolve_volume(&self, logical: &str) -> Result<Option<String>>;

    /// Name a logical volume gets when compose creates it
    fn qualify_volume(&self, logical: &str) -> String;

    async fn export_volume(&self, volume: &str, dest: PathBuf) -> Result<()>;

    async fn import_volume(&self, volume: &str, src: PathBuf) -> Result<()>;

    async fn stop_services(&self) -> Result<()>;

    /// Kill every container of the project; returns how many were killed
    async fn force_stop_services(&self) -> Result<usize>;

    async fn start_services(&self) -> Result<()>;

    async fn start_service(&self, service: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct DockerManager {
    docker: Docker,
    project_root: PathBuf,
    project: String,
    helper_image: String,
}

impl DockerManager {
    /// Create a new Docker manager for the deployment in `config`
    pub fn new(config: &AppConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon. Is Docker running?")?;

        let project_root = config.root()?.to_path_buf();
        let project = resolve_project_name(config, &project_root);
        debug!("Using compose project '{}' at {}", project, project_root.display());

        Ok(Self {
            docker,
            project_root,
            project,
            helper_image: config.helper_image.clone(),
        })
    }

    /// List all containers of this compose project
    pub async fn list_containers(&self) -> Result<Vec<ContainerInfo>> {
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![format!("{}={}", PROJECT_LABEL, self.project)],
        );

        let options = Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        });

        let containers = self.docker.list_containers(options).await?;
        Ok(containers.into_iter().map(container_summary_to_info).collect())
    }

    /// Execute docker-compose command
    pub async fn compose_command(&self, args: &[&str]) -> Result<String> {
        let output = Command::new("docker")
            .arg("compose")
            .arg("--project-name")
            .arg(&self.project)
            .args(args)
            .current_dir(&self.project_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute docker compose command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Docker compose command failed: {}", stderr.trim()));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Run a throwaway helper container
    async fn run_helper(&self, args: &[String]) -> Result<()> {
        let output = Command::new("docker")
            .arg("run")
            .arg("--rm")
            .args(args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to run helper container")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Helper container failed: {}", stderr.trim()));
        }

        Ok(())
    }

    async fn volume_exists(&self, name: &str) -> Result<bool> {
        match self.docker.inspect_volume(name).await {
            Ok(_) => Ok(true),
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => Ok(false),
            Err(e) => Err(e).with_context(|| format!("Failed to inspect volume {}", name)),
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerManager {
    async fn ping(&self) -> bool {
        self.docker.ping().await.is_ok()
    }

    async fn find_container(&self, service: &str) -> Result<Option<ContainerInfo>> {
        // 1. Identity lookup by container name
        if let Ok(inspect) = self.docker.inspect_container(service, None).await {
            let state = inspect
                .state
                .as_ref()
                .and_then(|s| s.status.as_ref())
                .map(|s| s.to_string())
                .unwrap_or_else(|| "unknown".to_string());
            let health = inspect
                .state
                .as_ref()
                .and_then(|s| s.health.as_ref())
                .and_then(|h| h.status.as_ref())
                .map(|h| h.to_string())
                .filter(|h| !h.is_empty() && h != "none");

            return Ok(Some(ContainerInfo {
                id: inspect.id.unwrap_or_default(),
                name: inspect
                    .name
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_else(|| service.to_string()),
                image: inspect
                    .config
                    .and_then(|c| c.image)
                    .unwrap_or_else(|| "unknown".to_string()),
                status: state.clone(),
                state: ContainerState::from(state.as_str()),
                health,
            }));
        }

        let containers = self.list_containers().await?;

        // 2. Compose service label
        let mut filters = HashMap::new();
        filters.insert(
            "label".to_string(),
            vec![
                format!("{}={}", PROJECT_LABEL, self.project),
                format!("{}={}", SERVICE_LABEL, service),
            ],
        );
        let labelled = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await?;
        if let Some(summary) = labelled.into_iter().next() {
            return Ok(Some(container_summary_to_info(summary)));
        }

        // 3. Name-pattern fallback
        Ok(containers.into_iter().find(|c| c.name.contains(service)))
    }

    async fn exec(&self, container: &str, command: Vec<String>) -> Result<ExecOutput> {
        let exec = self
            .docker
            .create_exec(
                container,
                CreateExecOptions {
                    cmd: Some(command),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("Failed to create exec in {}", container))?;

        let mut result = ExecOutput::default();

        if let StartExecResults::Attached { mut output, .. } = self.docker.start_exec(&exec.id, None).await? {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    bollard::container::LogOutput::StdOut { message } => result.stdout.extend_from_slice(&message),
                    bollard::container::LogOutput::StdErr { message } => result.stderr.extend_from_slice(&message),
                    _ => {}
                }
            }
        }

        let inspect = self.docker.inspect_exec(&exec.id).await?;
        result.exit_code = inspect.exit_code.unwrap_or(-1);

        Ok(result)
    }

    async fn exec_with_input(&self, container: &str, command: Vec<String>, input: PathBuf) -> Result<ExecOutput> {
        let file = std::fs::File::open(&input)
            .with_context(|| format!("Failed to open {}", input.display()))?;

        let output = Command::new("docker")
            .arg("exec")
            .arg("-i")
            .arg(container)
            .args(&command)
            .stdin(Stdio::from(file))
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .context("Failed to execute docker exec")?;

        Ok(ExecOutput {
            exit_code: output.status.code().map(i64::from).unwrap_or(-1),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }

    async fn resolve_volume(&self, logical: &str) -> Result<Option<String>> {
        let qualified = self.qualify_volume(logical);
        if self.volume_exists(&qualified).await? {
            return Ok(Some(qualified));
        }
        if self.volume_exists(logical).await? {
            return Ok(Some(logical.to_string()));
        }
        Ok(None)
    }

    fn qualify_volume(&self, logical: &str) -> String {
        format!("{}_{}", self.project, logical)
    }

    async fn export_volume(&self, volume: &str, dest: PathBuf) -> Result<()> {
        let (dir, file) = split_file_path(&dest)?;
        self.run_helper(&[
            "-v".to_string(),
            format!("{}:/source:ro", volume),
            "-v".to_string(),
            format!("{}:/backup", dir.display()),
            self.helper_image.clone(),
            "tar".to_string(),
            "czf".to_string(),
            format!("/backup/{}", file),
            "-C".to_string(),
            "/source".to_string(),
            ".".to_string(),
        ])
        .await
        .with_context(|| format!("Failed to export volume {}", volume))
    }

    async fn import_volume(&self, volume: &str, src: PathBuf) -> Result<()> {
        let (dir, file) = split_file_path(&src)?;
        self.run_helper(&[
            "-v".to_string(),
            format!("{}:/target", volume),
            "-v".to_string(),
            format!("{}:/backup:ro", dir.display()),
            self.helper_image.clone(),
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "find /target -mindepth 1 -delete && tar xzf /backup/{} -C /target",
                file
            ),
        ])
        .await
        .with_context(|| format!("Failed to import volume {}", volume))
    }

    async fn stop_services(&self) -> Result<()> {
        self.compose_command(&["stop"]).await?;
        Ok(())
    }

    async fn force_stop_services(&self) -> Result<usize> {
        let mut killed = 0;
        for container in self.list_containers().await? {
            if !container.state.is_running() {
                continue;
            }
            match self
                .docker
                .kill_container(&container.id, None::<KillContainerOptions<String>>)
                .await
            {
                Ok(_) => killed += 1,
                Err(e) => warn!("Failed to kill {}: {}", container.name, e),
            }
        }
        Ok(killed)
    }

    async fn start_services(&self) -> Result<()> {
        self.compose_command(&["up", "-d"]).await?;
        Ok(())
    }

    async fn start_service(&self, service: &str) -> Result<()> {
        self.compose_command(&["up", "-d", service]).await?;
        Ok(())
    }
}

/// Compose project name: configured, then COMPOSE_PROJECT_NAME from .env, then the root directory name
pub fn resolve_project_name(config: &AppConfig, project_root: &Path) -> String {
    if let Some(project) = &config.compose_project {
        return project.clone();
    }

    if let Ok(env) = ConfigManager::load(project_root.join(ENV_FILE)) {
        if let Some(name) = env.get("COMPOSE_PROJECT_NAME").filter(|n| !n.is_empty()) {
            return name.to_string();
        }
    }

    let dir_name = project_root
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let normalized: String = dir_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();

    if normalized.is_empty() {
        "default".to_string()
    } else {
        normalized
    }
}

/// Convert ContainerSummary to ContainerInfo
fn container_summary_to_info(summary: ContainerSummary) -> ContainerInfo {
    let name = summary
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|n| n.trim_start_matches('/').to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let status = summary.status.clone().unwrap_or_else(|| "unknown".to_string());
    let state = summary
        .state
        .as_deref()
        .unwrap_or("unknown")
        .into();

    let health = summary
        .status
        .as_ref()
        .and_then(|s| {
            // Check unhealthy BEFORE healthy (unhealthy contains "healthy" as substring)
            if s.contains("unhealthy") {
                Some("unhealthy".to_string())
            } else if s.contains("starting") {
                Some("starting".to_string())
            } else if s.contains("healthy") {
                Some("healthy".to_string())
            } else {
                None
            }
        });

    ContainerInfo {
        id: summary.id.unwrap_or_default(),
        name,
        image: summary.image.unwrap_or_else(|| "unknown".to_string()),
        status,
        state,
        health,
    }
}

fn split_file_path(path: &Path) -> Result<(PathBuf, String)> {
    let dir = path
        .parent()
        .ok_or_else(|| anyhow!("{} has no parent directory", path.display()))?;
    let dir = std::fs::canonicalize(dir)
        .with_context(|| format!("Failed to resolve {}", dir.display()))?;
    let file = path
        .file_name()
        .ok_or_else(|| anyhow!("{} has no file name", path.display()))?
        .to_string_lossy()
        .to_string();
    Ok((dir, file))
}
