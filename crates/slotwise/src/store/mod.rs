//! Package store: content-addressed storage of immutable update artifacts.
//!
//! Artifacts are addressed by the BLAKE3 hash of their bytes. A `put` whose
//! bytes do not hash to the declared identifier is rejected, and full reads
//! are re-verified so on-disk corruption surfaces as `IntegrityViolation`
//! instead of reaching a device. Ranged reads exist so that agents can resume
//! interrupted downloads; the store keeps no per-client progress.

mod fs;

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, RwLock};

pub use fs::FsPackageStore;

use crate::error::{Error, Result};
use crate::hash::ContentHash;

/// Storage backend for update artifacts.
///
/// Implementations must be safe for concurrent readers; content never
/// changes once stored.
pub trait PackageStore: Send + Sync + Debug {
    /// Store `bytes` under `declared`.
    ///
    /// Storing an artifact that already exists is a no-op.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IntegrityViolation`] if `bytes` do not hash to
    /// `declared`, or an I/O error from the backend.
    fn put(&self, declared: &ContentHash, bytes: &[u8]) -> Result<()>;

    /// Fetch and verify a complete artifact.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the artifact is absent and
    /// [`Error::IntegrityViolation`] if the stored bytes are corrupt.
    fn get(&self, hash: &ContentHash) -> Result<Vec<u8>>;

    /// Fetch `len` bytes starting at `offset`; the result is shorter only at
    /// the end of the artifact.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the artifact is absent and
    /// [`Error::RangeNotSatisfiable`] if `offset` is past the end.
    fn get_range(&self, hash: &ContentHash, offset: u64, len: u64) -> Result<Vec<u8>>;

    /// Size of a stored artifact.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the artifact is absent.
    fn size(&self, hash: &ContentHash) -> Result<u64>;

    /// Whether an artifact is present.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be queried.
    fn contains(&self, hash: &ContentHash) -> Result<bool>;

    /// All stored artifact hashes.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be listed.
    fn list(&self) -> Result<Vec<ContentHash>>;

    /// Hash `bytes` and store them, returning the hash.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend write fails.
    fn put_bytes(&self, bytes: &[u8]) -> Result<ContentHash> {
        let hash = ContentHash::of(bytes);
        self.put(&hash, bytes)?;
        Ok(hash)
    }
}

fn package_not_found(hash: &ContentHash) -> Error {
    Error::not_found(format!("package {hash}"))
}

/// Clamp a requested range against an artifact of `size` bytes.
pub(crate) fn clamp_range(offset: u64, len: u64, size: u64) -> Result<(u64, u64)> {
    if offset > size || (offset == size && size > 0) {
        return Err(Error::RangeNotSatisfiable { offset, len, size });
    }
    let end = offset.saturating_add(len).min(size);
    Ok((offset, end))
}

/// In-memory package store, used by tests and the local transport.
#[derive(Debug, Default)]
pub struct MemoryPackageStore {
    objects: RwLock<HashMap<ContentHash, Arc<Vec<u8>>>>,
}

impl MemoryPackageStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn object(&self, hash: &ContentHash) -> Result<Arc<Vec<u8>>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::internal("package store lock poisoned"))?;
        objects
            .get(hash)
            .cloned()
            .ok_or_else(|| package_not_found(hash))
    }

    /// Overwrite stored bytes without verification, to simulate corruption.
    #[cfg(test)]
    pub(crate) fn corrupt(&self, hash: &ContentHash, bytes: Vec<u8>) {
        if let Ok(mut objects) = self.objects.write() {
            objects.insert(*hash, Arc::new(bytes));
        }
    }
}

impl PackageStore for MemoryPackageStore {
    fn put(&self, declared: &ContentHash, bytes: &[u8]) -> Result<()> {
        declared.verify(bytes)?;
        let mut objects = self
            .objects
            .write()
            .map_err(|_| Error::internal("package store lock poisoned"))?;
        objects
            .entry(*declared)
            .or_insert_with(|| Arc::new(bytes.to_vec()));
        Ok(())
    }

    fn get(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let bytes = self.object(hash)?;
        hash.verify(&bytes)?;
        Ok(bytes.as_ref().clone())
    }

    fn get_range(&self, hash: &ContentHash, offset: u64, len: u64) -> Result<Vec<u8>> {
        let bytes = self.object(hash)?;
        let (start, end) = clamp_range(offset, len, bytes.len() as u64)?;
        let start = usize::try_from(start).map_err(|_| Error::internal("offset overflow"))?;
        let end = usize::try_from(end).map_err(|_| Error::internal("offset overflow"))?;
        Ok(bytes[start..end].to_vec())
    }

    fn size(&self, hash: &ContentHash) -> Result<u64> {
        Ok(self.object(hash)?.len() as u64)
    }

    fn contains(&self, hash: &ContentHash) -> Result<bool> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::internal("package store lock poisoned"))?;
        Ok(objects.contains_key(hash))
    }

    fn list(&self) -> Result<Vec<ContentHash>> {
        let objects = self
            .objects
            .read()
            .map_err(|_| Error::internal("package store lock poisoned"))?;
        let mut hashes: Vec<_> = objects.keys().copied().collect();
        hashes.sort();
        Ok(hashes)
    }
}
