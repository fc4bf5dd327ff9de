/// Deployment layout, naming conventions and default values

/// Service definition file every deployment root carries
pub const COMPOSE_FILE: &str = "docker-compose.yml";

/// Configuration file every deployment root carries
pub const ENV_FILE: &str = ".env";

/// Top-level directory reserved for stackguard's own entries inside an archive.
/// The deployment root's own directory of this name is never archived.
pub const RESERVED_DIR: &str = ".stackguard";

/// Per-volume exports inside an archive: `.stackguard/volumes/<volume>.tar.gz`
pub const VOLUME_EXPORTS_DIR: &str = ".stackguard/volumes";

/// Database dump naming convention: `database_backup_<timestamp>.sql`
pub const DB_DUMP_PREFIX: &str = "database_backup_";
pub const DB_DUMP_SUFFIX: &str = ".sql";

/// Marker that must appear near the top of a usable dump
pub const DB_DUMP_HEADER_MARKER: &str = "PostgreSQL database dump";

/// How many leading lines of a dump are searched for the header marker
pub const DB_DUMP_HEADER_LINES: usize = 20;

pub const ARCHIVE_EXTENSION: &str = ".tar.gz";
pub const ENCRYPTED_EXTENSION: &str = ".enc";
pub const CHECKSUM_EXTENSION: &str = ".sha256";

/// Suffixes for sibling directories of the deployment root
pub const ROLLBACK_SUFFIX: &str = ".rollback";
pub const SWAP_ASIDE_SUFFIX: &str = ".old";
pub const INSTALL_SNAPSHOT_MARKER: &str = ".backup.";
pub const LOCK_SUFFIX: &str = ".stackguard.lock";

/// Timestamp format used in archive and snapshot names
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Archives smaller than this are treated as truncated
pub const MIN_ARCHIVE_SIZE: u64 = 1024 * 1024;

/// Free space below this on the backup destination produces a warning
pub const MIN_FREE_SPACE: u64 = 1024 * 1024 * 1024;

/// Entries that never belong in an archive of the deployment root
pub const DEFAULT_EXCLUSIONS: &[&str] = &[
    ".git",
    "node_modules",
    "target",
    "__pycache__",
    ".cache",
    "logs",
    "*.log",
    "*.tmp",
];

pub const DEFAULT_ARCHIVE_PREFIX: &str = "stack_backup";
pub const DEFAULT_HELPER_IMAGE: &str = "alpine:3.20";
pub const DEFAULT_DATABASE_SERVICE: &str = "postgres";
pub const DEFAULT_SECRETS_SERVICE: &str = "vault";
pub const DEFAULT_DB_USER: &str = "postgres";

pub const DEFAULT_CRITICAL_SERVICES: &[&str] = &["postgres", "vault", "api", "proxy"];

pub const DEFAULT_CRITICAL_VOLUMES: &[&str] = &[
    "postgres_data",
    "vault_data",
    "uploads",
    "certs",
];

/// Key id used in the platform store and kernel keyring
pub const DEFAULT_KEY_ID: &str = "stackguard-backup-key";

/// Service name the platform secret store files the key under
pub const KEYRING_SERVICE: &str = "stackguard";

/// Encryption key length in bytes (hex encoded when stored)
pub const KEY_BYTES: usize = 32;

pub const DEFAULT_KDF_ITERATIONS: u32 = 100_000;
