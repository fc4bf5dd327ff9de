/// Encryption key custody
///
/// Keys live in exactly one of three stores, consulted in a fixed order:
/// the platform credential store, the kernel user keyring, then an
/// owner-only key file. Key values are never logged.

use anyhow::{anyhow, bail, Context, Result};
use rand::RngCore;
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use crate::utils::{AppConfig, KEYRING_SERVICE, KEY_BYTES};

#[cfg_attr(test, mockall::automock)]
pub trait SecretStore: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this store can be used on this host right now
    fn is_available(&self) -> bool;

    fn get(&self, id: &str) -> Result<Option<Zeroizing<String>>>;

    fn put(&self, id: &str, secret: &str) -> Result<()>;
}

/// OS credential store (Secret Service, macOS Keychain, Windows Credential Manager)
pub struct PlatformStore {
    service: String,
}

impl PlatformStore {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into() }
    }

    fn entry(&self, id: &str) -> Result<keyring::Entry> {
        keyring::Entry::new(&self.service, id).map_err(|e| anyhow!("Keychain error: {}", e))
    }
}

impl SecretStore for PlatformStore {
    fn name(&self) -> &'static str {
        "platform keychain"
    }

    fn is_available(&self) -> bool {
        let Ok(entry) = self.entry("stackguard-probe") else {
            return false;
        };
        match entry.get_password() {
            Ok(_) | Err(keyring::Error::NoEntry) => true,
            Err(e) => {
                debug!("Platform keychain unavailable: {}", e);
                false
            }
        }
    }

    fn get(&self, id: &str) -> Result<Option<Zeroizing<String>>> {
        match self.entry(id)?.get_password() {
            Ok(secret) => Ok(Some(Zeroizing::new(secret))),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(anyhow!("Failed to read from keychain: {}", e)),
        }
    }

    fn put(&self, id: &str, secret: &str) -> Result<()> {
        self.entry(id)?
            .set_password(secret)
            .map_err(|e| anyhow!("Failed to store in keychain: {}", e))
    }
}

/// Linux kernel user keyring, driven through `keyctl`
pub struct KernelKeyring;

impl KernelKeyring {
    fn keyctl(args: &[&str]) -> Result<std::process::Output> {
        Command::new("keyctl")
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .context("Failed to run keyctl")
    }
}

impl SecretStore for KernelKeyring {
    fn name(&self) -> &'static str {
        "kernel keyring"
    }

    fn is_available(&self) -> bool {
        Self::keyctl(&["show", "@u"])
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn get(&self, id: &str) -> Result<Option<Zeroizing<String>>> {
        let search = Self::keyctl(&["search", "@u", "user", id])?;
        if !search.status.success() {
            return Ok(None);
        }
        let serial = String::from_utf8_lossy(&search.stdout).trim().to_string();

        let pipe = Self::keyctl(&["pipe", &serial])?;
        if !pipe.status.success() {
            bail!(
                "keyctl pipe failed: {}",
                String::from_utf8_lossy(&pipe.stderr).trim()
            );
        }
        let secret = Zeroizing::new(pipe.stdout);
        let text = std::str::from_utf8(&secret).context("Keyring entry is not valid UTF-8")?;
        Ok(Some(Zeroizing::new(text.trim().to_string())))
    }

    fn put(&self, id: &str, secret: &str) -> Result<()> {
        let mut child = Command::new("keyctl")
            .args(["padd", "user", id, "@u"])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to run keyctl")?;

        child
            .stdin
            .take()
            .context("keyctl stdin unavailable")?
            .write_all(secret.as_bytes())?;

        let output = child.wait_with_output()?;
        if !output.status.success() {
            bail!(
                "keyctl padd failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}

/// Owner-only key file; the last resort of the chain
pub struct KeyFileStore {
    path: PathBuf,
}

impl KeyFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SecretStore for KeyFileStore {
    fn name(&self) -> &'static str {
        "key file"
    }

    fn is_available(&self) -> bool {
        self.path.parent().is_some()
    }

    fn get(&self, _id: &str) -> Result<Option<Zeroizing<String>>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let mode = fs::metadata(&self.path)?.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                "Key file {} is accessible by other users (mode {:o}); restricting to owner",
                self.path.display(),
                mode & 0o777
            );
            fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        }

        let contents = Zeroizing::new(
            fs::read_to_string(&self.path)
                .with_context(|| format!("Failed to read key file {}", self.path.display()))?,
        );
        let key = contents.trim();
        if key.is_empty() {
            return Ok(None);
        }
        Ok(Some(Zeroizing::new(key.to_string())))
    }

    fn put(&self, _id: &str, secret: &str) -> Result<()> {
        let dir = self
            .path
            .parent()
            .context("Key file has no parent directory")?;
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700))?;

        // NamedTempFile is created 0600, so the key is never readable by others
        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(secret.as_bytes())?;
        tmp.write_all(b"\n")?;
        tmp.as_file().sync_all()?;
        tmp.persist(&self.path)
            .map_err(|e| anyhow!("Failed to write key file {}: {}", self.path.display(), e.error))?;
        fs::set_permissions(&self.path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }
}

/// Prioritized key retrieval chain
pub struct KeyChain {
    stores: Vec<Box<dyn SecretStore>>,
}

impl KeyChain {
    pub fn new(stores: Vec<Box<dyn SecretStore>>) -> Self {
        Self { stores }
    }

    /// Platform keychain, kernel keyring, then the configured key file
    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Ok(Self::new(vec![
            Box::new(PlatformStore::new(KEYRING_SERVICE)),
            Box::new(KernelKeyring),
            Box::new(KeyFileStore::new(config.key_file()?)),
        ]))
    }

    /// First hit wins; a failing store is skipped with a warning
    pub fn get(&self, id: &str) -> Result<Option<(Zeroizing<String>, &'static str)>> {
        Ok(self.lookup(id).0)
    }

    /// First hit plus the names of stores that could not be read before it
    fn lookup(&self, id: &str) -> (Option<(Zeroizing<String>, &'static str)>, Vec<&'static str>) {
        let mut unreadable = Vec::new();
        for store in self.stores.iter().filter(|s| s.is_available()) {
            match store.get(id) {
                Ok(Some(secret)) => {
                    debug!("Key '{}' found in {}", id, store.name());
                    return (Some((secret, store.name())), unreadable);
                }
                Ok(None) => debug!("Key '{}' not in {}", id, store.name()),
                Err(e) => {
                    warn!("Could not read {}: {:#}", store.name(), e);
                    unreadable.push(store.name());
                }
            }
        }
        (None, unreadable)
    }

    /// Store `secret` in the first store that accepts it and reads it back intact
    pub fn store(&self, id: &str, secret: &str) -> Result<&'static str> {
        for store in self.stores.iter().filter(|s| s.is_available()) {
            if let Err(e) = store.put(id, secret) {
                warn!("Could not store key in {}: {:#}", store.name(), e);
                continue;
            }
            match store.get(id) {
                Ok(Some(read)) if read.as_str() == secret => {
                    info!("Key '{}' stored in {}", id, store.name());
                    return Ok(store.name());
                }
                Ok(_) => warn!("Key written to {} did not read back", store.name()),
                Err(e) => warn!("Could not verify key in {}: {:#}", store.name(), e),
            }
        }
        bail!("No secret store accepted the key")
    }

    /// Existing key, or a freshly generated one that is durably stored first.
    ///
    /// A new key is only generated when every available store answered that
    /// it holds none; an unreadable store may still hold the current key.
    pub fn get_or_create(&self, id: &str) -> Result<(Zeroizing<String>, &'static str)> {
        let (found, unreadable) = self.lookup(id);
        if let Some(found) = found {
            return Ok(found);
        }
        if !unreadable.is_empty() {
            bail!(
                "Refusing to generate key '{}': could not read {}",
                id,
                unreadable.join(", ")
            );
        }

        info!("No encryption key '{}' found; generating a new one", id);
        let key = generate_key();
        let source = self.store(id, &key)?;
        Ok((key, source))
    }
}

/// 256 random bits, hex encoded
pub fn generate_key() -> Zeroizing<String> {
    let mut bytes = Zeroizing::new([0u8; KEY_BYTES]);
    rand::thread_rng().fill_bytes(&mut bytes[..]);
    Zeroizing::new(hex::encode(&bytes[..]))
}

pub fn is_valid_key(key: &str) -> bool {
    key.len() == KEY_BYTES * 2 && key.chars().all(|c| c.is_ascii_hexdigit())
}
