pub mod constants;
pub mod helpers;
pub mod app_config;
pub mod logger;

pub use constants::*;
pub use helpers::*;
pub use app_config::{AppConfig, InstallBackupPolicy, RetentionPolicy};
