/// Compressed tar archive codec
///
/// Creates, lists and extracts `.tar.gz` archives. Listing reads the whole
/// stream, so truncation or a corrupted tail surfaces as an error rather than
/// a short listing.

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use regex::Regex;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::{Component, Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// One input of an archive: a file or directory stored under `name`.
/// A directory with an empty name contributes its contents at the archive top level.
/// Exclusions only apply to `filtered` sources; named sources are stored whole.
#[derive(Debug, Clone)]
pub struct ArchiveSource {
    pub path: PathBuf,
    pub name: String,
    pub filtered: bool,
}

impl ArchiveSource {
    pub fn contents_of(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), name: String::new(), filtered: true }
    }

    pub fn named(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self { path: path.into(), name: name.into(), filtered: false }
    }
}

/// Glob-style exclusions (`*`, `?`) matched against single path components
#[derive(Debug, Clone, Default)]
pub struct Exclusions {
    any_level: Vec<Regex>,
    top_level: Vec<Regex>,
    paths: Vec<PathBuf>,
}

impl Exclusions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclude components matching `pattern` at any depth
    pub fn pattern(mut self, pattern: &str) -> Result<Self> {
        self.any_level.push(glob_to_regex(pattern)?);
        Ok(self)
    }

    /// Exclude entries matching `pattern` directly below a source root
    pub fn top_level(mut self, pattern: &str) -> Result<Self> {
        self.top_level.push(glob_to_regex(pattern)?);
        Ok(self)
    }

    /// Exclude an absolute path (and everything below it)
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.paths.push(path.into());
        self
    }

    /// Whether `relative` (below `source_root`) is excluded
    pub fn is_excluded(&self, source_root: &Path, relative: &Path) -> bool {
        let absolute = source_root.join(relative);
        if self.paths.iter().any(|p| absolute.starts_with(p)) {
            return true;
        }

        let mut components = relative.components().filter_map(|c| match c {
            Component::Normal(name) => Some(name.to_string_lossy()),
            _ => None,
        });

        if let Some(first) = components.next() {
            if self.top_level.iter().any(|r| r.is_match(&first)) {
                return true;
            }
            if self.any_level.iter().any(|r| r.is_match(&first)) {
                return true;
            }
        }

        components.any(|name| self.any_level.iter().any(|r| r.is_match(&name)))
    }
}

fn glob_to_regex(pattern: &str) -> Result<Regex> {
    let escaped = regex::escape(pattern)
        .replace(r"\*", ".*")
        .replace(r"\?", ".");
    Regex::new(&format!("^{}$", escaped))
        .with_context(|| format!("Invalid exclusion pattern '{}'", pattern))
}

pub trait ArchiveCodec: Send + Sync {
    /// Write a new archive at `output`; returns the number of entries written
    fn create(&self, sources: &[ArchiveSource], exclusions: &Exclusions, output: &Path) -> Result<usize>;

    /// Every entry path in the archive, normalized (no leading `./`, no trailing `/`)
    fn list(&self, archive: &Path) -> Result<Vec<String>>;

    /// Extract into `dest`, refusing entries that would escape it
    fn extract(&self, archive: &Path, dest: &Path) -> Result<()>;
}

#[derive(Debug, Clone, Default)]
pub struct TarGzCodec;

impl TarGzCodec {
    pub fn new() -> Self {
        Self
    }
}

impl ArchiveCodec for TarGzCodec {
    fn create(&self, sources: &[ArchiveSource], exclusions: &Exclusions, output: &Path) -> Result<usize> {
        let file = File::create(output)
            .with_context(|| format!("Failed to create {}", output.display()))?;
        let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
        let mut builder = tar::Builder::new(encoder);
        builder.follow_symlinks(false);

        let mut entries = 0usize;

        for source in sources {
            let meta = std::fs::symlink_metadata(&source.path)
                .with_context(|| format!("Archive source {} is missing", source.path.display()))?;

            if !meta.is_dir() {
                if source.name.is_empty() {
                    bail!("File source {} needs a name", source.path.display());
                }
                builder
                    .append_path_with_name(&source.path, &source.name)
                    .with_context(|| format!("Failed to add {}", source.path.display()))?;
                entries += 1;
                continue;
            }

            let walker = WalkDir::new(&source.path)
                .min_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_entry(|e| {
                    e.path()
                        .strip_prefix(&source.path)
                        .map(|rel| !source.filtered || !exclusions.is_excluded(&source.path, rel))
                        .unwrap_or(false)
                });

            if !source.name.is_empty() {
                builder.append_dir(&source.name, &source.path)?;
                entries += 1;
            }

            for entry in walker {
                let entry = entry.with_context(|| format!("Failed to walk {}", source.path.display()))?;
                let file_type = entry.file_type();
                if !(file_type.is_dir() || file_type.is_file() || file_type.is_symlink()) {
                    debug!("Skipping special file {}", entry.path().display());
                    continue;
                }

                let relative = entry.path().strip_prefix(&source.path)?;
                let name = if source.name.is_empty() {
                    relative.to_path_buf()
                } else {
                    Path::new(&source.name).join(relative)
                };

                builder
                    .append_path_with_name(entry.path(), &name)
                    .with_context(|| format!("Failed to add {}", entry.path().display()))?;
                entries += 1;
            }
        }

        let encoder = builder.into_inner().context("Failed to finalize tar stream")?;
        let writer = encoder.finish().context("Failed to finalize gzip stream")?;
        let file = writer
            .into_inner()
            .map_err(|e| anyhow!("Failed to flush archive: {}", e.error()))?;
        file.sync_all()?;

        Ok(entries)
    }

    fn list(&self, archive: &Path) -> Result<Vec<String>> {
        let file = File::open(archive)
            .with_context(|| format!("Failed to open {}", archive.display()))?;
        let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

        let mut names = Vec::new();
        for entry in tar.entries().context("Failed to read archive")? {
            let entry = entry.context("Corrupt archive entry")?;
            let path = entry.path().context("Invalid entry path")?;
            names.push(normalize_entry(&path));
        }

        // Drain to EOF so the gzip trailer (CRC and length) is verified too
        let mut rest = tar.into_inner();
        io::copy(&mut rest, &mut io::sink()).context("Archive stream is corrupt")?;

        Ok(names)
    }

    fn extract(&self, archive: &Path, dest: &Path) -> Result<()> {
        let file = File::open(archive)
            .with_context(|| format!("Failed to open {}", archive.display()))?;
        let mut tar = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
        tar.set_preserve_permissions(true);
        tar.set_preserve_mtime(true);

        std::fs::create_dir_all(dest)?;

        for entry in tar.entries().context("Failed to read archive")? {
            let mut entry = entry.context("Corrupt archive entry")?;
            let path = entry.path().context("Invalid entry path")?.to_path_buf();
            let unpacked = entry
                .unpack_in(dest)
                .with_context(|| format!("Failed to extract {}", path.display()))?;
            if !unpacked {
                bail!("Refusing to extract entry outside destination: {}", path.display());
            }
        }

        Ok(())
    }
}

fn normalize_entry(path: &Path) -> String {
    let s = path.to_string_lossy();
    let s = s.strip_prefix("./").unwrap_or(&s);
    s.trim_end_matches('/').to_string()
}
