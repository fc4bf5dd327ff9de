/// Reader for the deployment's .env file
///
/// The lifecycle manager never writes the deployment configuration; it only
/// reads the database credentials and compose project name from it.

use anyhow::{anyhow, Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::utils::{AppConfig, DEFAULT_DB_USER, ENV_FILE};

pub struct ConfigManager {
    values: HashMap<String, String>,
}

/// Credentials used for dump and restore inside the database container
#[derive(Debug, Clone, PartialEq)]
pub struct DatabaseCredentials {
    pub user: String,
    pub database: String,
}

impl ConfigManager {
    /// Load configuration from .env file
    pub fn load<P: AsRef<Path>>(env_file: P) -> Result<Self> {
        let env_file = env_file.as_ref();

        if !env_file.exists() {
            return Err(anyhow!(".env file not found at {}", env_file.display()));
        }

        let content = fs::read_to_string(env_file)
            .context("Failed to read .env file")?;

        let mut values = HashMap::new();
        for line in content.lines() {
            let line = line.trim();

            // Skip comments and empty lines
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let line = line.strip_prefix("export ").unwrap_or(line);

            // Parse key=value
            if let Some((key, value)) = line.split_once('=') {
                values.insert(key.trim().to_string(), unquote(value.trim()).to_string());
            }
        }

        Ok(Self { values })
    }

    /// Load the .env file of a deployment root
    pub fn for_root(root: &Path) -> Result<Self> {
        Self::load(root.join(ENV_FILE))
    }

    /// Get a configuration value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|v| v.as_str())
    }
}

impl DatabaseCredentials {
    /// Resolve credentials: operator config first, then the deployment .env, then defaults
    pub fn resolve(config: &AppConfig, root: &Path) -> Self {
        let env = ConfigManager::for_root(root).ok();
        let from_env = |key: &str| {
            env.as_ref()
                .and_then(|e| e.get(key))
                .filter(|v| !v.is_empty())
                .map(|v| v.to_string())
        };

        let user = config
            .services
            .db_user
            .clone()
            .or_else(|| from_env("POSTGRES_USER"))
            .unwrap_or_else(|| DEFAULT_DB_USER.to_string());
        let database = config
            .services
            .db_name
            .clone()
            .or_else(|| from_env("POSTGRES_DB"))
            .unwrap_or_else(|| user.clone());

        Self { user, database }
    }
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2
        && ((bytes[0] == b'"' && bytes[bytes.len() - 1] == b'"')
            || (bytes[0] == b'\'' && bytes[bytes.len() - 1] == b'\''))
    {
        &value[1..value.len() - 1]
    } else {
        value
    }
}
