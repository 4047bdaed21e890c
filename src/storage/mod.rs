//! Data-directory file access and hashing.
//!
//! All wire paths are relative, forward-slash normalized and validated
//! before touching the filesystem. Parent directories are created on write.

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::layout::{FileBlock, FileEntry};

/// Uniform block size used when partitioning files for diffing.
pub const DEFAULT_BLOCK_SIZE: u32 = 1_024_000;

/// Chunk size for streaming whole-file hashes.
const HASH_READ_SIZE: usize = 8 * 1024;

/// SHA-256 of the empty input; the hash of a zero-length file or block.
pub fn empty_hash() -> Vec<u8> {
    Sha256::digest(b"").to_vec()
}

/// Validate that a wire path is relative and cannot escape the base
/// directory.
fn validate_path(relative: &str) -> Result<&Path> {
    if relative.is_empty() {
        return Err(Error::Protocol("empty path not allowed".into()));
    }
    let path = Path::new(relative);
    if path.is_absolute() {
        return Err(Error::Protocol(format!(
            "absolute path not allowed: {relative}"
        )));
    }
    for component in path.components() {
        match component {
            Component::Normal(_) => {}
            _ => {
                return Err(Error::Protocol(format!(
                    "path traversal not allowed: {relative}"
                )))
            }
        }
    }
    Ok(path)
}

/// File access rooted at a peer's data directory.
#[derive(Debug, Clone)]
pub struct Storage {
    base: PathBuf,
}

impl Storage {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base_dir(&self) -> &Path {
        &self.base
    }

    fn resolve(&self, relative: &str) -> Result<PathBuf> {
        Ok(self.base.join(validate_path(relative)?))
    }

    /// Walk the data directory and hash every regular file. A missing base
    /// directory yields an empty layout.
    pub fn scan_layout(&self) -> Result<BTreeMap<String, FileEntry>> {
        let mut files = BTreeMap::new();
        if self.base.is_dir() {
            self.scan_dir(&mut files, &self.base, "")?;
        }
        Ok(files)
    }

    fn scan_dir(
        &self,
        files: &mut BTreeMap<String, FileEntry>,
        dir: &Path,
        prefix: &str,
    ) -> Result<()> {
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            let rel = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.scan_dir(files, &entry.path(), &rel)?;
            } else if file_type.is_file() {
                let size = entry.metadata()?.len();
                let hash = hash_file(&entry.path(), size)?;
                files.insert(rel.clone(), FileEntry::new(rel, size, hash));
            }
        }
        Ok(())
    }

    /// Streaming SHA-256 of a whole file.
    pub fn file_hash(&self, relative: &str) -> Result<Vec<u8>> {
        let path = self.resolve(relative)?;
        let size = fs::metadata(&path)?.len();
        hash_file(&path, size)
    }

    pub fn file_size(&self, relative: &str) -> Result<u64> {
        Ok(fs::metadata(self.resolve(relative)?)?.len())
    }

    /// Compute the block partition of a file with per-block SHA-256 hashes,
    /// reading one block at a time.
    pub fn block_hashes(&self, relative: &str, block_size: u32) -> Result<Vec<FileBlock>> {
        let path = self.resolve(relative)?;
        let mut file = File::open(&path)?;
        let size = file.metadata()?.len();

        let mut blocks = Vec::new();
        if size > 0 && block_size > 0 {
            let block_size = block_size as u64;
            let count = (size - 1) / block_size + 1;
            let mut buf = Vec::new();
            for i in 0..count {
                let offset = block_size * i;
                let len = (size - offset).min(block_size) as usize;
                buf.resize(len, 0);
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut buf)?;
                blocks.push(FileBlock {
                    offset,
                    size: len as u64,
                    hash: Sha256::digest(&buf).to_vec(),
                });
            }
        }
        Ok(blocks)
    }

    pub fn read_block(&self, relative: &str, offset: u64, size: u64) -> Result<Vec<u8>> {
        let path = self.resolve(relative)?;
        let mut file = File::open(&path)?;
        let mut buf = vec![0u8; size as usize];
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Write bytes at an offset, creating the file and parent directories
    /// as needed. Existing content outside the range is preserved.
    pub fn write_block(&self, relative: &str, offset: u64, data: &[u8]) -> Result<()> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().write(true).create(true).open(&path)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    /// Rewrite the file from empty, creating parent directories as needed.
    pub fn truncate_file(&self, relative: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        File::create(&path)?;
        Ok(())
    }

    /// Delete a file. A file that is already gone is fine.
    pub fn delete_file(&self, relative: &str) -> Result<()> {
        let path = self.resolve(relative)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

fn hash_file(path: &Path, size: u64) -> Result<Vec<u8>> {
    let mut hasher = Sha256::new();
    if size > 0 {
        let mut file = File::open(path)?;
        let mut buf = [0u8; HASH_READ_SIZE];
        loop {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
    }
    Ok(hasher.finalize().to_vec())
}
