/// Archive encryption, decryption and key lifecycle
///
/// The key is handed to the cipher through a short-lived owner-only file that
/// is overwritten and removed as soon as the cipher returns.

use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::core::archive::{checksum_path, decrypted_path, encrypted_path, verify_checksum, write_checksum};
use crate::core::cipher::{Aes256CbcCipher, Cipher};
use crate::core::error::{OpsError, OpsResult};
use crate::core::secrets::{is_valid_key, KeyChain};
use crate::utils::{remove_path, set_owner_only, AppConfig};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Key material written for the cipher; wiped on drop
struct KeyMaterial {
    file: Option<NamedTempFile>,
    len: usize,
}

impl KeyMaterial {
    fn write(key: &str) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new().prefix(".stackguard-key-").tempfile()?;
        file.write_all(key.as_bytes())?;
        file.write_all(b"\n")?;
        file.as_file().sync_all()?;
        Ok(Self { file: Some(file), len: key.len() + 1 })
    }

    fn path(&self) -> &Path {
        self.file.as_ref().map(|f| f.path()).unwrap_or_else(|| Path::new(""))
    }
}

impl Drop for KeyMaterial {
    fn drop(&mut self) {
        let Some(mut file) = self.file.take() else {
            return;
        };
        let overwrite = (|| -> std::io::Result<()> {
            use std::io::Seek;
            file.as_file_mut().rewind()?;
            file.write_all(&vec![0u8; self.len])?;
            file.as_file().sync_all()
        })();
        if let Err(e) = overwrite {
            debug!("Key material overwrite failed, removing only: {}", e);
        }
        if let Err(e) = file.close() {
            warn!("Failed to remove key material file: {}", e);
        }
    }
}

pub struct EncryptionManager {
    cipher: Arc<dyn Cipher>,
    keys: KeyChain,
    key_id: String,
    iterations: u32,
}

impl EncryptionManager {
    pub fn new(cipher: Arc<dyn Cipher>, keys: KeyChain, key_id: impl Into<String>, iterations: u32) -> Self {
        Self {
            cipher,
            keys,
            key_id: key_id.into(),
            iterations,
        }
    }

    pub fn from_config(config: &AppConfig) -> OpsResult<Self> {
        let keys = KeyChain::from_config(config).map_err(|e| OpsError::Config(format!("{:#}", e)))?;
        Ok(Self::new(
            Arc::new(Aes256CbcCipher::new()),
            keys,
            config.encryption.key_id.clone(),
            config.encryption.kdf_iterations,
        ))
    }

    /// Encrypt `archive` to `<archive>.enc`, then delete the plaintext.
    /// On failure the plaintext archive is left untouched.
    pub fn encrypt(&self, archive: &Path) -> OpsResult<PathBuf> {
        if !archive.is_file() {
            return Err(OpsError::EncryptionFailure(format!("{} does not exist", archive.display())));
        }
        let output = encrypted_path(archive);
        if output.exists() {
            return Err(OpsError::EncryptionFailure(format!("{} already exists", output.display())));
        }

        let (key, source) = self
            .keys
            .get_or_create(&self.key_id)
            .map_err(|e| OpsError::EncryptionFailure(format!("no usable key store: {:#}", e)))?;
        debug!("Encrypting with key '{}' from {}", self.key_id, source);

        let partial = partial_path(&output);
        let result = {
            let material = KeyMaterial::write(&key)
                .map_err(|e| OpsError::EncryptionFailure(format!("cannot stage key material: {}", e)))?;
            self.cipher.encrypt(archive, &partial, material.path(), self.iterations)
        };
        if let Err(e) = result {
            discard(&partial);
            return Err(OpsError::EncryptionFailure(format!("{:#}", e)));
        }

        fs::rename(&partial, &output)?;
        set_owner_only(&output).map_err(|e| OpsError::EncryptionFailure(format!("{:#}", e)))?;
        write_checksum(&output).map_err(|e| OpsError::EncryptionFailure(format!("{:#}", e)))?;

        fs::remove_file(archive)?;
        discard(&checksum_path(archive));

        info!("Encrypted {} -> {}", archive.display(), output.display());
        Ok(output)
    }

    /// Decrypt `<archive>.enc` next to itself
    pub fn decrypt(&self, encrypted: &Path) -> OpsResult<PathBuf> {
        let output = decrypted_path(encrypted).ok_or_else(|| {
            OpsError::EncryptionFailure(format!("{} is not an .enc file", encrypted.display()))
        })?;
        self.decrypt_to(encrypted, &output)
    }

    /// Decrypt into `output`, which must not exist yet. Output appears only
    /// once the padding and the gzip header check out.
    pub fn decrypt_to(&self, encrypted: &Path, output: &Path) -> OpsResult<PathBuf> {
        if output.exists() {
            return Err(OpsError::EncryptionFailure(format!(
                "refusing to overwrite {}",
                output.display()
            )));
        }

        match verify_checksum(encrypted) {
            Ok(Some(true)) => debug!("Checksum of {} verified", encrypted.display()),
            Ok(Some(false)) => return Err(OpsError::integrity(encrypted, "checksum mismatch")),
            Ok(None) => warn!("No checksum sidecar for {}; decrypting unverified", encrypted.display()),
            Err(e) => return Err(OpsError::integrity(encrypted, format!("{:#}", e))),
        }

        let (key, source) = self
            .keys
            .get(&self.key_id)
            .map_err(|e| OpsError::KeyUnavailable(format!("{:#}", e)))?
            .ok_or_else(|| OpsError::KeyUnavailable(format!("key '{}' not found in any store", self.key_id)))?;
        debug!("Decrypting with key '{}' from {}", self.key_id, source);

        let partial = partial_path(output);
        let result = {
            let material = KeyMaterial::write(&key)
                .map_err(|e| OpsError::EncryptionFailure(format!("cannot stage key material: {}", e)))?;
            self.cipher.decrypt(encrypted, &partial, material.path(), self.iterations)
        };

        let checked = result
            .map_err(|e| format!("{:#}", e))
            .and_then(|_| has_gzip_magic(&partial));
        if let Err(reason) = checked {
            discard(&partial);
            return Err(OpsError::EncryptionFailure(format!(
                "decryption of {} failed: {}",
                encrypted.display(),
                reason
            )));
        }

        fs::rename(&partial, output)?;
        info!("Decrypted {} -> {}", encrypted.display(), output.display());
        Ok(output.to_path_buf())
    }

    /// Write the key (hex) to a new owner-only file
    pub fn export_key(&self, dest: &Path) -> OpsResult<&'static str> {
        let (key, source) = self
            .keys
            .get(&self.key_id)
            .map_err(|e| OpsError::KeyUnavailable(format!("{:#}", e)))?
            .ok_or_else(|| OpsError::KeyUnavailable(format!("key '{}' not found in any store", self.key_id)))?;

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(dest)?;
        file.write_all(key.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;

        info!("Exported key '{}' from {} to {}", self.key_id, source, dest.display());
        Ok(source)
    }

    /// Store a hex key read from `src` in the first available store
    pub fn import_key(&self, src: &Path) -> OpsResult<&'static str> {
        let mut contents = zeroize::Zeroizing::new(String::new());
        fs::File::open(src)?.read_to_string(&mut contents)?;
        let key = contents.trim();
        if !is_valid_key(key) {
            return Err(OpsError::Config(format!(
                "{} does not contain a 64-character hex key",
                src.display()
            )));
        }

        if let Ok(Some((existing, source))) = self.keys.get(&self.key_id) {
            if existing.as_str() != key {
                warn!("Replacing existing key '{}' held in {}", self.key_id, source);
            }
        }

        self.keys
            .store(&self.key_id, key)
            .map_err(|e| OpsError::KeyUnavailable(format!("{:#}", e)))
    }

    /// Which store currently holds the key, if any
    pub fn key_status(&self) -> OpsResult<Option<&'static str>> {
        Ok(self
            .keys
            .get(&self.key_id)
            .map_err(|e| OpsError::KeyUnavailable(format!("{:#}", e)))?
            .map(|(_, source)| source))
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }
}

fn partial_path(output: &Path) -> PathBuf {
    let name = output
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    output.with_file_name(format!(".{}.partial", name))
}

fn has_gzip_magic(path: &Path) -> Result<(), String> {
    let mut magic = [0u8; 2];
    fs::File::open(path)
        .and_then(|mut f| f.read_exact(&mut magic))
        .map_err(|e| format!("cannot read output: {}", e))?;
    if magic != GZIP_MAGIC {
        return Err("output is not a gzip stream (wrong key?)".to_string());
    }
    Ok(())
}

/// Remove a leftover file; a failure is logged and otherwise ignored
fn discard(path: &Path) {
    if let Err(e) = remove_path(path) {
        warn!("Could not remove {}: {}", path.display(), e);
    }
}
