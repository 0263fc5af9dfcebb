#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::expect_used, clippy::unwrap_used))]

//! Narrow storage interface for descriptors and item files.
//!
//! Everything the engine persists goes through `StorageBackend`, a pluggable
//! byte-addressable store with random-read and append-only-write handles.
//! Paths are relative to the database root and constructed only by the
//! functions in [`paths`].

pub mod fs;
pub mod meta;
pub mod paths;
pub mod retry;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient storage error at {path}: {msg}")]
    Transient { path: String, msg: String },
    #[error("permanent storage error at {path}: {msg}")]
    Permanent { path: String, msg: String },
    #[error("corrupt descriptor at {path}: {msg}")]
    Corrupt { path: String, msg: String },
    #[error("unsupported storage root: {0}")]
    UnsupportedRoot(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }
}

pub trait RandomReadFile: Send + std::fmt::Debug {
    fn size(&self) -> Result<u64, StoreError>;
    /// Reads exactly `dst.len()` bytes starting at `pos`.
    fn read_at(&self, pos: u64, dst: &mut [u8]) -> Result<(), StoreError>;
}

pub trait WriteFile: Send {
    fn append(&mut self, bytes: &[u8]) -> Result<(), StoreError>;
    /// Flushes and durably persists everything appended so far.
    fn save(&mut self) -> Result<(), StoreError>;
}

pub trait StorageBackend: Send + Sync {
    fn make_random_read_file(&self, path: &str) -> Result<Box<dyn RandomReadFile>, StoreError>;
    fn make_write_file(&self, path: &str) -> Result<Box<dyn WriteFile>, StoreError>;
    fn exists(&self, path: &str) -> Result<bool, StoreError>;
    /// Idempotent: deleting a missing object succeeds.
    fn delete(&self, path: &str) -> Result<(), StoreError>;
}

/// Opens a storage back-end from a root string. Only POSIX directories are
/// supported in this build; the trait keeps object stores pluggable.
pub fn open_from_root(root: &str) -> Result<Box<dyn StorageBackend>, StoreError> {
    let trimmed = root.trim();
    if trimmed.is_empty() {
        return Err(StoreError::UnsupportedRoot(root.to_string()));
    }
    Ok(Box::new(fs::PosixStorage::new(trimmed)))
}

/// Reads `len` bytes at `pos`, retrying transient failures.
pub fn read_bytes(
    file: &dyn RandomReadFile,
    pos: u64,
    len: usize,
) -> Result<Vec<u8>, StoreError> {
    retry::with_backoff(|| {
        let mut buf = vec![0u8; len];
        file.read_at(pos, &mut buf)?;
        Ok(buf)
    })
}

pub fn read_u64_le(file: &dyn RandomReadFile, pos: u64) -> Result<u64, StoreError> {
    let bytes = read_bytes(file, pos, 8)?;
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes);
    Ok(u64::from_le_bytes(raw))
}

pub fn read_i64_slice_le(
    file: &dyn RandomReadFile,
    pos: u64,
    count: usize,
) -> Result<Vec<i64>, StoreError> {
    let bytes = read_bytes(file, pos, count * 8)?;
    Ok(bytes
        .chunks_exact(8)
        .map(|chunk| {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(chunk);
            i64::from_le_bytes(raw)
        })
        .collect())
}
