//! Filesystem-backed package store.
//!
//! Layout under the root directory:
//!
//! ```text
//! objects/<aa>/<hash>     immutable artifacts, <aa> = first two hex digits
//! tmp/<hash>.<id>.partial in-flight writes, renamed into place when complete
//! ```

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{clamp_range, package_not_found, PackageStore};
use crate::durable;
use crate::error::{Error, Result};
use crate::hash::ContentHash;

const OBJECTS_DIR: &str = "objects";
const TMP_DIR: &str = "tmp";
const PARTIAL_SUFFIX: &str = ".partial";

/// Package store rooted at a directory.
#[derive(Debug, Clone)]
pub struct FsPackageStore {
    root: PathBuf,
}

impl FsPackageStore {
    /// Open (creating if needed) a store at `root` and sweep leftover partial writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory layout cannot be created.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let store = Self {
            root: root.as_ref().to_path_buf(),
        };
        for dir in [store.root.join(OBJECTS_DIR), store.root.join(TMP_DIR)] {
            fs::create_dir_all(&dir).map_err(|source| Error::DirectoryCreate {
                path: dir.clone(),
                source,
            })?;
        }
        let swept = store.sweep_partials()?;
        if swept > 0 {
            info!("Removed {} partial package writes", swept);
        }
        Ok(store)
    }

    /// Root directory of the store.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, hash: &ContentHash) -> PathBuf {
        let hex = hash.to_hex();
        self.root.join(OBJECTS_DIR).join(&hex[..2]).join(hex)
    }

    /// Delete any `.partial` files left over from interrupted writes.
    ///
    /// # Errors
    ///
    /// Returns an error if the temp directory cannot be read.
    pub fn sweep_partials(&self) -> Result<usize> {
        let mut removed = 0;
        for entry in fs::read_dir(self.root.join(TMP_DIR))? {
            let entry = entry?;
            if entry.file_type()?.is_file()
                && entry.file_name().to_string_lossy().ends_with(PARTIAL_SUFFIX)
            {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    fn open_object(&self, hash: &ContentHash) -> Result<File> {
        match File::open(self.object_path(hash)) {
            Ok(file) => Ok(file),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(package_not_found(hash)),
            Err(e) => Err(e.into()),
        }
    }
}

impl PackageStore for FsPackageStore {
    fn put(&self, declared: &ContentHash, bytes: &[u8]) -> Result<()> {
        declared.verify(bytes)?;
        let target = self.object_path(declared);
        if target.exists() {
            debug!(hash = %declared.short(), "package already stored");
            return Ok(());
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        let tmp = self.root.join(TMP_DIR).join(format!(
            "{}.{}{PARTIAL_SUFFIX}",
            declared.to_hex(),
            Uuid::new_v4().simple()
        ));
        durable::replace_file(&tmp, &target, bytes)?;

        debug!(hash = %declared.short(), size = bytes.len(), "stored package");
        Ok(())
    }

    fn get(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        self.open_object(hash)?.read_to_end(&mut bytes)?;
        if let Err(err) = hash.verify(&bytes) {
            warn!(hash = %hash.short(), "stored package failed verification");
            return Err(err);
        }
        Ok(bytes)
    }

    fn get_range(&self, hash: &ContentHash, offset: u64, len: u64) -> Result<Vec<u8>> {
        let mut file = self.open_object(hash)?;
        let size = file.metadata()?.len();
        let (start, end) = clamp_range(offset, len, size)?;
        file.seek(SeekFrom::Start(start))?;
        let mut buf = Vec::new();
        file.take(end - start).read_to_end(&mut buf)?;
        Ok(buf)
    }

    fn size(&self, hash: &ContentHash) -> Result<u64> {
        Ok(self.open_object(hash)?.metadata()?.len())
    }

    fn contains(&self, hash: &ContentHash) -> Result<bool> {
        Ok(self.object_path(hash).is_file())
    }

    fn list(&self) -> Result<Vec<ContentHash>> {
        let mut hashes = Vec::new();
        for shard in fs::read_dir(self.root.join(OBJECTS_DIR))? {
            let shard = shard?;
            if !shard.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(shard.path())? {
                let name = entry?.file_name();
                match name.to_string_lossy().parse::<ContentHash>() {
                    Ok(hash) => hashes.push(hash),
                    Err(_) => warn!("Ignoring stray file {:?} in package store", name),
                }
            }
        }
        hashes.sort();
        Ok(hashes)
    }
}
