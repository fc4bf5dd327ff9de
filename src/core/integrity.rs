/// Archive integrity verification
///
/// Checks run in order and stop at the first hard failure: minimum size,
/// readability of the whole stream, then the manifest. A passing plaintext
/// archive gets a fresh checksum sidecar.

use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::archive::{is_dump_entry, verify_checksum, write_checksum};
use crate::core::codec::ArchiveCodec;
use crate::core::error::{OpsError, OpsResult};
use crate::utils::{format_bytes, COMPOSE_FILE, ENCRYPTED_EXTENSION, ENV_FILE, MIN_ARCHIVE_SIZE, VOLUME_EXPORTS_DIR};

#[derive(Debug, Clone, PartialEq)]
pub struct IntegrityReport {
    pub size: u64,
    pub entries: usize,
    /// Name of the database dump entry; empty for encrypted archives
    pub dump: String,
    pub warnings: Vec<String>,
    pub checksum: Option<String>,
}

pub struct IntegrityVerifier {
    codec: Arc<dyn ArchiveCodec>,
}

impl IntegrityVerifier {
    pub fn new(codec: Arc<dyn ArchiveCodec>) -> Self {
        Self { codec }
    }

    pub fn verify(&self, path: &Path) -> OpsResult<IntegrityReport> {
        let size = std::fs::metadata(path)
            .map_err(|e| OpsError::integrity(path, format!("cannot read archive: {}", e)))?
            .len();
        if size < MIN_ARCHIVE_SIZE {
            return Err(OpsError::integrity(
                path,
                format!("archive is only {}, expected at least {}", format_bytes(size), format_bytes(MIN_ARCHIVE_SIZE)),
            ));
        }

        if path.to_string_lossy().ends_with(ENCRYPTED_EXTENSION) {
            return self.verify_encrypted(path, size);
        }

        let entries = self
            .codec
            .list(path)
            .map_err(|e| OpsError::integrity(path, format!("corrupt archive: {:#}", e)))?;
        debug!("{} lists {} entries", path.display(), entries.len());

        let mut warnings = Vec::new();
        let has = |name: &str| entries.iter().any(|e| e == name);

        for required in [COMPOSE_FILE, ENV_FILE] {
            if !has(required) {
                warnings.push(format!("{} is missing from the archive", required));
            }
        }

        let volumes_prefix = format!("{}/", VOLUME_EXPORTS_DIR);
        if !has(VOLUME_EXPORTS_DIR) && !entries.iter().any(|e| e.starts_with(&volumes_prefix)) {
            warnings.push(format!("{}/ is missing from the archive", VOLUME_EXPORTS_DIR));
        }

        let dumps: Vec<&String> = entries.iter().filter(|e| is_dump_entry(e)).collect();
        let dump = match dumps.as_slice() {
            [] => return Err(OpsError::integrity(path, "no database dump in archive")),
            [one] => one.to_string(),
            many => {
                return Err(OpsError::integrity(
                    path,
                    format!("{} database dumps in archive, expected exactly one", many.len()),
                ))
            }
        };

        for warning in &warnings {
            warn!("{}: {}", path.display(), warning);
        }

        let checksum = write_checksum(path)
            .map_err(|e| OpsError::integrity(path, format!("cannot write checksum: {:#}", e)))?;

        info!("Archive {} verified ({} entries)", path.display(), entries.len());
        Ok(IntegrityReport {
            size,
            entries: entries.len(),
            dump,
            warnings,
            checksum: Some(checksum),
        })
    }

    /// Encrypted archives cannot be listed; check the header and the recorded checksum
    fn verify_encrypted(&self, path: &Path, size: u64) -> OpsResult<IntegrityReport> {
        let mut header = [0u8; 8];
        File::open(path)
            .and_then(|mut f| f.read_exact(&mut header))
            .map_err(|e| OpsError::integrity(path, format!("cannot read header: {}", e)))?;
        if &header != b"Salted__" {
            return Err(OpsError::integrity(path, "not an encrypted archive"));
        }

        let mut warnings = Vec::new();
        match verify_checksum(path) {
            Ok(Some(true)) => {}
            Ok(Some(false)) => return Err(OpsError::integrity(path, "checksum mismatch")),
            Ok(None) => warnings.push("no checksum sidecar; contents not verified".to_string()),
            Err(e) => return Err(OpsError::integrity(path, format!("{:#}", e))),
        }

        for warning in &warnings {
            warn!("{}: {}", path.display(), warning);
        }

        Ok(IntegrityReport {
            size,
            entries: 0,
            dump: String::new(),
            warnings,
            checksum: crate::core::archive::read_checksum(path).ok().flatten(),
        })
    }
}
