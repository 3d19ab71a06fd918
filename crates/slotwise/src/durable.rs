//! Crash-safe file replacement.

use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use crate::error::Result;

/// Write `bytes` to `tmp`, sync it, rename it over `target`, then sync the
/// directory holding `target` so the new entry survives power loss.
///
/// `tmp` is removed if any step before the rename fails. Once this returns
/// `Ok`, a crash leaves `target` holding `bytes`.
pub(crate) fn replace_file(tmp: &Path, target: &Path, bytes: &[u8]) -> Result<()> {
    let write = || -> Result<()> {
        let mut file = File::create(tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(tmp, target)?;
        Ok(())
    };
    if let Err(err) = write() {
        let _ = fs::remove_file(tmp);
        return Err(err);
    }
    if let Some(parent) = target.parent() {
        sync_dir(parent)?;
    }
    Ok(())
}

#[cfg(unix)]
fn sync_dir(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> Result<()> {
    Ok(())
}
