/// CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "stackguard")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Settings file (defaults to ~/.config/stackguard/config.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Deployment root (directory holding docker-compose.yml)
    #[arg(long, global = true)]
    pub root: Option<PathBuf>,

    /// Log level when RUST_LOG is not set
    #[arg(long, global = true, default_value = "info")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Backup, restore and retention operations
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Encryption key custody
    Key {
        #[command(subcommand)]
        command: KeyCommands,
    },
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Create a verified backup archive of the deployment
    Create,

    /// Restore the deployment from an archive, rolling back on failure
    Restore {
        archive: PathBuf,

        /// Skip the up-front integrity check
        #[arg(long)]
        skip_verify: bool,
    },

    /// Check an archive's integrity
    Verify { archive: PathBuf },

    /// List archives in the backup directory
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Keep only the newest archives
    Rotate {
        /// Number of archives to keep (defaults to the retention count)
        count: Option<usize>,
    },

    /// Encrypt an archive, replacing the plaintext
    Encrypt { archive: PathBuf },

    /// Decrypt an archive next to the encrypted one
    Decrypt { archive: PathBuf },

    /// Copy the whole deployment root to a timestamped sibling directory
    Snapshot,
}

#[derive(Subcommand)]
pub enum KeyCommands {
    /// Write the encryption key to a new file
    Export { file: PathBuf },

    /// Store a key read from a file
    Import { file: PathBuf },

    /// Show which store holds the key
    Status,
}
