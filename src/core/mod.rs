pub mod error;
pub mod retry;
pub mod lock;
pub mod docker;
pub mod codec;
pub mod cipher;
pub mod secrets;
pub mod config;
pub mod archive;
pub mod preflight;
pub mod integrity;
pub mod encryption;
pub mod retention;
pub mod backup;
pub mod snapshot;
pub mod restore;

pub use docker::{ContainerRuntime, DockerManager};
pub use config::ConfigManager;
pub use error::{OpsError, OpsResult};
pub use codec::{ArchiveCodec, TarGzCodec};
pub use backup::BackupCreator;
pub use encryption::EncryptionManager;
pub use integrity::IntegrityVerifier;
pub use restore::{RestoreOrchestrator, RestoreOutcome, RestoreStage};
