//! Release/metadata registry.
//!
//! The authoritative catalog of channels, releases and packages, plus the
//! per-device records the server maintains from agent reports. Resolution runs
//! against an `Arc<ReleaseSnapshot>` so readers never touch the database;
//! every catalog write reloads the snapshot and swaps it in.

mod snapshot;

use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use semver::Version;
use tracing::{debug, info};
use uuid::Uuid;

pub use snapshot::{ReleaseEntry, ReleaseSnapshot, Resolution, ResolvedUpdate};

use crate::error::{Error, Result};
use crate::model::{validate_name, DeviceRecord, Release, UpdateSession};
use crate::storage::{Storage, StorageStats};

/// Catalog of releases and device state.
#[derive(Debug)]
pub struct Registry {
    storage: Mutex<Storage>,
    snapshot: RwLock<Arc<ReleaseSnapshot>>,
}

impl Registry {
    /// Wrap an opened storage and load the initial snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the catalog cannot be loaded.
    pub fn new(storage: Storage) -> Result<Self> {
        let snapshot = load_snapshot(&storage)?;
        Ok(Self {
            storage: Mutex::new(storage),
            snapshot: RwLock::new(Arc::new(snapshot)),
        })
    }

    /// An in-memory registry.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn in_memory() -> Result<Self> {
        Self::new(Storage::open_in_memory()?)
    }

    fn storage(&self) -> Result<MutexGuard<'_, Storage>> {
        self.storage
            .lock()
            .map_err(|_| Error::internal("storage lock poisoned"))
    }

    /// Current release snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot lock is poisoned.
    pub fn snapshot(&self) -> Result<Arc<ReleaseSnapshot>> {
        self.snapshot
            .read()
            .map(|s| Arc::clone(&s))
            .map_err(|_| Error::internal("snapshot lock poisoned"))
    }

    fn refresh(&self, storage: &Storage) -> Result<()> {
        let fresh = Arc::new(load_snapshot(storage)?);
        *self
            .snapshot
            .write()
            .map_err(|_| Error::internal("snapshot lock poisoned"))? = fresh;
        Ok(())
    }

    /// Resolve the best update for a device.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed identifiers and
    /// [`Error::ChannelUnknown`] for an unknown channel.
    pub fn resolve(
        &self,
        device_id: &str,
        channel: &str,
        current: &Version,
        force_full: bool,
    ) -> Result<Resolution> {
        validate_name("device id", device_id)?;
        validate_name("channel", channel)?;
        let resolution = self.snapshot()?.resolve(channel, current, force_full)?;
        match &resolution {
            Resolution::UpToDate => {
                debug!(device_id, channel, current = %current, "Device is up to date");
            }
            Resolution::Available(update) => debug!(
                device_id,
                channel,
                current = %current,
                version = %update.release.version,
                kind = %update.package.kind,
                "Resolved update"
            ),
        }
        Ok(resolution)
    }

    // === Catalog ===

    /// Create a channel. Returns `false` if it already existed.
    ///
    /// # Errors
    ///
    /// Returns a validation error for a malformed name or a storage error.
    pub fn create_channel(&self, name: &str) -> Result<bool> {
        validate_name("channel", name)?;
        let storage = self.storage()?;
        let created = storage.create_channel(name)?;
        if created {
            self.refresh(&storage)?;
        }
        Ok(created)
    }

    /// Insert a published release, creating its channel on first use.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ReleaseExists`] for a duplicate version, or a storage error.
    pub fn insert_release(&self, entry: &ReleaseEntry) -> Result<()> {
        validate_name("channel", &entry.release.channel)?;
        let storage = self.storage()?;
        storage.create_channel(&entry.release.channel)?;
        storage.insert_release(entry)?;
        self.refresh(&storage)?;
        info!(
            channel = %entry.release.channel,
            version = %entry.release.version,
            "Release published"
        );
        Ok(())
    }

    /// Mark a release unavailable. Returns `false` if it was already retired.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the release does not exist.
    pub fn retire(&self, channel: &str, version: &Version) -> Result<bool> {
        let storage = self.storage()?;
        let changed = storage.set_release_available(channel, version, false)?;
        if changed {
            self.refresh(&storage)?;
            info!(channel, version = %version, "Release retired");
        }
        Ok(changed)
    }

    /// Releases of a channel, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelUnknown`] if the channel does not exist.
    pub fn releases(&self, channel: &str) -> Result<Vec<Release>> {
        let snapshot = self.snapshot()?;
        let entries = snapshot
            .releases(channel)
            .ok_or_else(|| Error::ChannelUnknown {
                channel: channel.to_string(),
            })?;
        Ok(entries.iter().map(|e| e.release.clone()).collect())
    }

    /// A release with its packages and manifest.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the release does not exist.
    pub fn release(&self, channel: &str, version: &Version) -> Result<ReleaseEntry> {
        self.storage()?
            .release(channel, version)?
            .ok_or_else(|| Error::not_found(format!("release {version} in channel '{channel}'")))
    }

    /// Every release in every channel.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn entries(&self) -> Result<Vec<ReleaseEntry>> {
        self.storage()?.load_entries()
    }

    // === Devices ===

    /// A device record.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        self.storage()?.device(device_id)
    }

    /// A session.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn session(&self, session_id: &Uuid) -> Result<Option<UpdateSession>> {
        self.storage()?.session(session_id)
    }

    /// Recent sessions of a device.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn sessions_for_device(&self, device_id: &str, limit: usize) -> Result<Vec<UpdateSession>> {
        self.storage()?.sessions_for_device(device_id, limit)
    }

    /// Persist a device record and session atomically.
    ///
    /// Callers serialize per device; see `server::DeviceLocks`.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn record_report(&self, device: &DeviceRecord, session: &UpdateSession) -> Result<()> {
        self.storage()?.record_report(device, session)
    }

    /// Database statistics.
    ///
    /// # Errors
    ///
    /// Returns a storage error.
    pub fn stats(&self) -> Result<StorageStats> {
        self.storage()?.stats()
    }
}

fn load_snapshot(storage: &Storage) -> Result<ReleaseSnapshot> {
    Ok(ReleaseSnapshot::new(
        storage.list_channels()?,
        storage.load_entries()?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHash;
    use crate::model::{Package, PackageKind};
    use chrono::Utc;

    fn full_entry(channel: &str, version: Version) -> ReleaseEntry {
        let image = ContentHash::of(version.to_string().as_bytes());
        ReleaseEntry::new(
            Release {
                channel: channel.to_string(),
                version: version.clone(),
                manifest_hash: image,
                signature: String::new(),
                minimum_source_version: None,
                changelog: String::new(),
                created_at: Utc::now(),
                available: true,
            },
            "{}".to_string(),
            vec![Package {
                kind: PackageKind::Full,
                source_version: None,
                target_version: version,
                content_hash: image,
                target_hash: image,
                size_bytes: 1,
                signature: String::new(),
            }],
        )
    }

    #[test]
    fn test_publish_refreshes_snapshot() {
        let registry = Registry::in_memory().unwrap();
        let before = registry.snapshot().unwrap();
        assert!(!before.has_channel("stable"));

        registry
            .insert_release(&full_entry("stable", Version::new(1, 0, 0)))
            .unwrap();

        // Old snapshot is unaffected; the new one sees the release.
        assert!(!before.has_channel("stable"));
        let resolution = registry
            .resolve("dev-1", "stable", &Version::new(0, 9, 0), false)
            .unwrap();
        assert_eq!(
            resolution.update().unwrap().release.version,
            Version::new(1, 0, 0)
        );
    }

    #[test]
    fn test_retire_hides_release() {
        let registry = Registry::in_memory().unwrap();
        registry
            .insert_release(&full_entry("stable", Version::new(1, 0, 0)))
            .unwrap();
        assert!(registry.retire("stable", &Version::new(1, 0, 0)).unwrap());
        assert!(!registry.retire("stable", &Version::new(1, 0, 0)).unwrap());

        let resolution = registry
            .resolve("dev-1", "stable", &Version::new(0, 9, 0), false)
            .unwrap();
        assert_eq!(resolution, Resolution::UpToDate);
        // Retired releases stay listed.
        assert_eq!(registry.releases("stable").unwrap().len(), 1);
    }

    #[test]
    fn test_resolve_validates_identifiers() {
        let registry = Registry::in_memory().unwrap();
        registry.create_channel("stable").unwrap();
        assert!(matches!(
            registry
                .resolve("bad device", "stable", &Version::new(1, 0, 0), false)
                .unwrap_err(),
            Error::Validation(_)
        ));
        assert!(matches!(
            registry
                .resolve("dev-1", "nightly", &Version::new(1, 0, 0), false)
                .unwrap_err(),
            Error::ChannelUnknown { .. }
        ));
    }

    #[test]
    fn test_empty_channel_is_up_to_date() {
        let registry = Registry::in_memory().unwrap();
        assert!(registry.create_channel("beta").unwrap());
        assert!(!registry.create_channel("beta").unwrap());
        assert_eq!(
            registry
                .resolve("dev-1", "beta", &Version::new(1, 0, 0), false)
                .unwrap(),
            Resolution::UpToDate
        );
        assert!(registry.releases("beta").unwrap().is_empty());
    }

    #[test]
    fn test_release_lookup() {
        let registry = Registry::in_memory().unwrap();
        let entry = full_entry("stable", Version::new(1, 0, 0));
        registry.insert_release(&entry).unwrap();
        assert_eq!(
            registry.release("stable", &Version::new(1, 0, 0)).unwrap(),
            entry
        );
        assert!(matches!(
            registry
                .release("stable", &Version::new(2, 0, 0))
                .unwrap_err(),
            Error::NotFound { .. }
        ));
    }
}
