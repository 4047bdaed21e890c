//! File layout data model.
//!
//! A layout describes the hashable content of one data directory: every
//! regular file with its size, whole-file hash and (optionally) a uniform
//! block partition with per-block hashes.

use std::collections::BTreeMap;
use std::sync::Mutex;

/// One fixed-size byte range of a file. The last block of a file may be
/// shorter than the block size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileBlock {
    pub offset: u64,
    pub size: u64,
    /// SHA-256 of the block content. Empty while unknown.
    pub hash: Vec<u8>,
}

impl FileBlock {
    pub fn new(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            hash: Vec::new(),
        }
    }

    pub fn has_hash(&self) -> bool {
        !self.hash.is_empty()
    }
}

/// Compute the uniform block partition of a file as (offset, size) pairs.
/// A zero-size file has no blocks.
pub fn block_partition(file_size: u64, block_size: u64) -> Vec<(u64, u64)> {
    if file_size == 0 || block_size == 0 {
        return Vec::new();
    }
    let count = (file_size - 1) / block_size + 1;
    (0..count)
        .map(|i| {
            let offset = block_size * i;
            (offset, (file_size - offset).min(block_size))
        })
        .collect()
}

/// One regular file inside a layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Forward-slash relative path, immutable after creation.
    pub path: String,
    pub size: u64,
    /// SHA-256 of the whole file content. A zero-length file hashes to
    /// SHA-256 of the empty string.
    pub hash: Vec<u8>,
    /// Uniform block size the partition was computed with. Zero while no
    /// partition is attached.
    pub block_size: u32,
    /// Block partition ordered by ascending offset. `None` while not
    /// populated; `Some(vec![])` for an empty file with a partition.
    pub blocks: Option<Vec<FileBlock>>,
}

impl FileEntry {
    pub fn new(path: impl Into<String>, size: u64, hash: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            size,
            hash,
            block_size: 0,
            blocks: None,
        }
    }

    pub fn has_blocks(&self) -> bool {
        self.blocks.is_some()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.as_ref().map_or(0, Vec::len)
    }

    /// Attach an unhashed partition of `size` by `block_size`, dropping any
    /// previous blocks.
    pub fn set_partition(&mut self, block_size: u32) {
        self.block_size = block_size;
        self.blocks = Some(
            block_partition(self.size, block_size as u64)
                .into_iter()
                .map(|(offset, size)| FileBlock::new(offset, size))
                .collect(),
        );
    }
}

/// Mapping from relative path to file entry, guarded by its own lock.
///
/// Readers take snapshots; diffing code must never observe a layout
/// mid-mutation.
#[derive(Debug, Default)]
pub struct FileLayout {
    files: Mutex<BTreeMap<String, FileEntry>>,
}

impl FileLayout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: BTreeMap<String, FileEntry>) -> Self {
        Self {
            files: Mutex::new(entries),
        }
    }

    pub fn file_at(&self, path: &str) -> Option<FileEntry> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn set_file(&self, entry: FileEntry) {
        self.files
            .lock()
            .unwrap()
            .insert(entry.path.clone(), entry);
    }

    pub fn remove_file(&self, path: &str) {
        self.files.lock().unwrap().remove(path);
    }

    pub fn file_count(&self) -> usize {
        self.files.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.lock().unwrap().is_empty()
    }

    /// Clone the full path map for diffing.
    pub fn snapshot(&self) -> BTreeMap<String, FileEntry> {
        self.files.lock().unwrap().clone()
    }
}
