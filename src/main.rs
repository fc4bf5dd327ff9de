use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::error;

use stackguard::cli::{BackupCommands, Cli, Commands, KeyCommands};
use stackguard::core::archive::list_archives;
use stackguard::core::retention::{rotate_archives, RotationReport};
use stackguard::core::snapshot::create_install_snapshot;
use stackguard::core::{
    BackupCreator, ContainerRuntime, DockerManager, EncryptionManager, IntegrityVerifier, OpsError,
    OpsResult, RestoreOrchestrator, RestoreOutcome, TarGzCodec,
};
use stackguard::utils::{find_deployment_root, format_bytes, format_timestamp, logger, AppConfig};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = logger::init(&cli.log_level) {
        eprintln!("Failed to initialize logging: {:#}", e);
    }

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!("{}", e);
            eprintln!("✗ {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}

async fn run(cli: Cli) -> OpsResult<u8> {
    let mut config = AppConfig::load_or_default(cli.config.as_deref());
    if let Some(root) = cli.root {
        config.deployment_root = Some(root);
    }

    match cli.command {
        Commands::Backup { command } => handle_backup(command, config).await,
        Commands::Key { command } => handle_key(command, &config),
    }
}

/// Resolve the deployment root into `config`
fn with_root(mut config: AppConfig) -> OpsResult<AppConfig> {
    let root = find_deployment_root(&config).map_err(|e| OpsError::Config(format!("{:#}", e)))?;
    config.deployment_root = Some(root);
    Ok(config)
}

fn connect_runtime(config: &AppConfig) -> OpsResult<Arc<dyn ContainerRuntime>> {
    let docker = DockerManager::new(config)
        .map_err(|e| OpsError::PreflightFailure(vec![format!("container runtime: {:#}", e)]))?;
    Ok(Arc::new(docker))
}

fn catalog_error(e: anyhow::Error) -> OpsError {
    OpsError::Io(std::io::Error::other(format!("{:#}", e)))
}

async fn handle_backup(command: BackupCommands, config: AppConfig) -> OpsResult<u8> {
    match command {
        BackupCommands::Create => {
            let config = with_root(config)?;
            let creator = BackupCreator::new(&config, connect_runtime(&config)?, Arc::new(TarGzCodec::new()))?;
            println!("Creating backup in {}...", creator.destination().display());
            let summary = creator.create().await?;

            println!("✓ Backup created: {}", summary.archive.path.display());
            println!("  Size:      {}", format_bytes(summary.archive.size));
            println!("  Entries:   {}", summary.integrity.entries);
            if let Some(checksum) = &summary.archive.checksum {
                println!("  SHA-256:   {}", checksum);
            }
            println!("  Encrypted: {}", if summary.archive.encrypted { "yes" } else { "no" });
            println!(
                "  Volumes:   {} exported, {} skipped",
                summary.volumes_exported.len(),
                summary.volumes_skipped.len()
            );
            for volume in &summary.volumes_skipped {
                println!("    ⚠ {} not included", volume);
            }
            for warning in summary.preflight_warnings.iter().chain(&summary.integrity.warnings) {
                println!("  ⚠ {}", warning);
            }
            if let Some(rotation) = &summary.rotation {
                print_rotation(rotation);
            }
            Ok(0)
        }
        BackupCommands::Restore { archive, skip_verify } => {
            let config = with_root(config)?;
            let orchestrator =
                RestoreOrchestrator::new(&config, connect_runtime(&config)?, Arc::new(TarGzCodec::new()))?;
            println!("Restoring from {}...", archive.display());

            let outcome = orchestrator.restore(&archive, skip_verify).await?;
            match &outcome {
                RestoreOutcome::Success { warnings } => {
                    println!("✓ Restore completed");
                    for warning in warnings {
                        println!("  ⚠ {}", warning);
                    }
                }
                RestoreOutcome::RolledBack { stage, reason } => {
                    println!("✗ Restore failed at {}: {}", stage, reason);
                    println!("  The previous deployment has been put back in place.");
                }
                RestoreOutcome::Fatal { stage, reason } => {
                    println!("✗ Restore failed at {} and could not be rolled back: {}", stage, reason);
                    println!("  MANUAL INTERVENTION REQUIRED. Rollback material was left next to the deployment root.");
                }
            }
            Ok(outcome.error().map(|e| e.exit_code()).unwrap_or(0))
        }
        BackupCommands::Verify { archive } => {
            let report = IntegrityVerifier::new(Arc::new(TarGzCodec::new())).verify(&archive)?;
            println!("✓ {} is valid", archive.display());
            println!("  Size:    {}", format_bytes(report.size));
            if report.entries > 0 {
                println!("  Entries: {}", report.entries);
            }
            if !report.dump.is_empty() {
                println!("  Dump:    {}", report.dump);
            }
            for warning in &report.warnings {
                println!("  ⚠ {}", warning);
            }
            Ok(0)
        }
        BackupCommands::List { json } => {
            let dir = backup_dir(config)?;
            let archives = list_archives(&dir).map_err(catalog_error)?;

            if json {
                let out = serde_json::to_string_pretty(&archives).map_err(|e| catalog_error(e.into()))?;
                println!("{}", out);
                return Ok(0);
            }

            if archives.is_empty() {
                println!("No archives in {}", dir.display());
                return Ok(0);
            }

            println!("Archives in {}\n", dir.display());
            println!("{:<45} {:<20} {:>10} {:<9}", "Name", "Created", "Size", "Encrypted");
            println!("{}", "-".repeat(87));
            for archive in &archives {
                println!(
                    "{:<45} {:<20} {:>10} {:<9}",
                    archive.name,
                    format_timestamp(&archive.created_at),
                    format_bytes(archive.size),
                    if archive.encrypted { "yes" } else { "no" }
                );
            }
            Ok(0)
        }
        BackupCommands::Rotate { count } => {
            let keep = count.unwrap_or(config.retention.count);
            let dir = backup_dir(config)?;
            let report = rotate_archives(&dir, keep).map_err(catalog_error)?;
            print_rotation(&report);
            Ok(0)
        }
        BackupCommands::Encrypt { archive } => {
            let encrypted = EncryptionManager::from_config(&config)?.encrypt(&archive)?;
            println!("✓ Encrypted to {}", encrypted.display());
            Ok(0)
        }
        BackupCommands::Decrypt { archive } => {
            let plain = EncryptionManager::from_config(&config)?.decrypt(&archive)?;
            println!("✓ Decrypted to {}", plain.display());
            Ok(0)
        }
        BackupCommands::Snapshot => {
            let config = with_root(config)?;
            let root = config.root().map_err(|e| OpsError::Config(e.to_string()))?;
            let snapshot = create_install_snapshot(root, &config.install_backups)?;
            println!("✓ Snapshot created: {} ({})", snapshot.path.display(), format_bytes(snapshot.bytes));
            if let Some(rotation) = &snapshot.rotation {
                print_rotation(rotation);
            }
            Ok(0)
        }
    }
}

/// Explicit backup directory, or the default derived from the deployment root
fn backup_dir(config: AppConfig) -> OpsResult<PathBuf> {
    let config = if config.backup_dir.is_some() { config } else { with_root(config)? };
    config.backup_dir().map_err(|e| OpsError::Config(e.to_string()))
}

fn print_rotation(report: &RotationReport) {
    if report.deleted.is_empty() {
        println!("  Retention: {} kept, nothing removed", report.kept);
        return;
    }
    println!(
        "  Retention: {} kept, {} removed, {} freed",
        report.kept,
        report.deleted.len(),
        format_bytes(report.freed)
    );
    for path in &report.deleted {
        let name = path.file_name().map(|n| n.to_string_lossy()).unwrap_or_else(|| path.to_string_lossy());
        println!("    - {}", name);
    }
}

fn handle_key(command: KeyCommands, config: &AppConfig) -> OpsResult<u8> {
    let manager = EncryptionManager::from_config(config)?;

    match command {
        KeyCommands::Export { file } => {
            let store = manager.export_key(&file)?;
            println!("✓ Key '{}' from the {} written to {}", manager.key_id(), store, file.display());
            println!("  Keep this file somewhere safe; without it encrypted archives cannot be restored.");
        }
        KeyCommands::Import { file } => {
            let store = manager.import_key(&file)?;
            println!("✓ Key '{}' stored in the {}", manager.key_id(), store);
        }
        KeyCommands::Status => match manager.key_status()? {
            Some(store) => println!("✓ Key '{}' is held by the {}", manager.key_id(), store),
            None => println!("No key '{}' found; one is created on the first encrypted backup", manager.key_id()),
        },
    }

    Ok(0)
}
