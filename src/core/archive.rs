/// Archive naming, catalog and checksum sidecars

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, TimeZone};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::utils::{
    set_owner_only, ARCHIVE_EXTENSION, CHECKSUM_EXTENSION, DB_DUMP_PREFIX, DB_DUMP_SUFFIX,
    ENCRYPTED_EXTENSION, TIMESTAMP_FORMAT,
};

/// One full backup on disk
#[derive(Debug, Clone, Serialize)]
pub struct Archive {
    pub path: PathBuf,
    pub name: String,
    pub created_at: DateTime<Local>,
    pub size: u64,
    pub checksum: Option<String>,
    pub encrypted: bool,
    #[serde(skip)]
    pub modified: SystemTime,
}

impl Archive {
    pub fn from_path(path: &Path) -> Result<Self> {
        let meta = fs::metadata(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let modified = meta.modified()?;
        let created_at = timestamp_from_name(&name)
            .unwrap_or_else(|| DateTime::<Local>::from(modified));

        Ok(Self {
            path: path.to_path_buf(),
            encrypted: name.ends_with(ENCRYPTED_EXTENSION),
            checksum: read_checksum(path).ok().flatten(),
            created_at,
            size: meta.len(),
            modified,
            name,
        })
    }

    pub fn checksum_path(&self) -> PathBuf {
        checksum_path(&self.path)
    }
}

/// `<prefix>_<timestamp>.tar.gz`
pub fn archive_name(prefix: &str, timestamp: &str) -> String {
    format!("{}_{}{}", prefix, timestamp, ARCHIVE_EXTENSION)
}

/// `database_backup_<timestamp>.sql`
pub fn dump_file_name(timestamp: &str) -> String {
    format!("{}{}{}", DB_DUMP_PREFIX, timestamp, DB_DUMP_SUFFIX)
}

/// A database dump stored at the archive top level
pub fn is_dump_entry(entry: &str) -> bool {
    !entry.contains('/') && entry.starts_with(DB_DUMP_PREFIX) && entry.ends_with(DB_DUMP_SUFFIX)
}

pub fn is_archive_file(name: &str) -> bool {
    name.ends_with(ARCHIVE_EXTENSION)
        || name.ends_with(&format!("{}{}", ARCHIVE_EXTENSION, ENCRYPTED_EXTENSION))
}

/// Encrypted form of an archive path
pub fn encrypted_path(archive: &Path) -> PathBuf {
    append_extension(archive, ENCRYPTED_EXTENSION)
}

/// Plaintext form of an encrypted archive path
pub fn decrypted_path(encrypted: &Path) -> Option<PathBuf> {
    let name = encrypted.file_name()?.to_string_lossy().to_string();
    let plain = name.strip_suffix(ENCRYPTED_EXTENSION)?;
    Some(encrypted.with_file_name(plain))
}

pub fn checksum_path(archive: &Path) -> PathBuf {
    append_extension(archive, CHECKSUM_EXTENSION)
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(ext);
    PathBuf::from(os)
}

/// Parse the `_<YYYYmmdd_HHMMSS>` part of an archive name
fn timestamp_from_name(name: &str) -> Option<DateTime<Local>> {
    let stem = name
        .strip_suffix(ENCRYPTED_EXTENSION)
        .unwrap_or(name)
        .strip_suffix(ARCHIVE_EXTENSION)?;
    // Timestamp is the trailing 15 characters: YYYYmmdd_HHMMSS
    let ts = stem.get(stem.len().checked_sub(15)?..)?;
    let naive = NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).ok()?;
    Local.from_local_datetime(&naive).single()
}

/// SHA-256 of a file, hex encoded
pub fn compute_checksum(path: &Path) -> Result<String> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
    );
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Write `<archive>.sha256` in sha256sum format; returns the digest
pub fn write_checksum(archive: &Path) -> Result<String> {
    let digest = compute_checksum(archive)?;
    let name = archive
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let sidecar = checksum_path(archive);
    fs::write(&sidecar, format!("{}  {}\n", digest, name))
        .with_context(|| format!("Failed to write {}", sidecar.display()))?;
    set_owner_only(&sidecar)?;
    Ok(digest)
}

/// Digest recorded in the sidecar, if one exists
pub fn read_checksum(archive: &Path) -> Result<Option<String>> {
    let sidecar = checksum_path(archive);
    if !sidecar.exists() {
        return Ok(None);
    }
    let contents = fs::read_to_string(&sidecar)
        .with_context(|| format!("Failed to read {}", sidecar.display()))?;
    Ok(contents.split_whitespace().next().map(|s| s.to_lowercase()))
}

/// `None` when there is no sidecar to check against
pub fn verify_checksum(archive: &Path) -> Result<Option<bool>> {
    match read_checksum(archive)? {
        Some(expected) => Ok(Some(compute_checksum(archive)? == expected)),
        None => Ok(None),
    }
}

/// All archives in `dir`, newest first by modification time
pub fn list_archives(dir: &Path) -> Result<Vec<Archive>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut archives = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().to_string();
        if !entry.file_type()?.is_file() || !is_archive_file(&name) {
            continue;
        }
        archives.push(Archive::from_path(&entry.path())?);
    }

    archives.sort_by(|a, b| b.modified.cmp(&a.modified).then_with(|| b.name.cmp(&a.name)));
    Ok(archives)
}
