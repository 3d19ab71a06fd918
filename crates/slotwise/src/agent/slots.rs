//! A/B slots: which slot is active, what each holds, and the image files.
//!
//! [`BootControl`] is the persisted slot bookkeeping. The active slot and
//! the rollback slot are never written while a switch is pending; staging
//! always targets the standby slot.

use std::fs;
use std::path::{Path, PathBuf};

use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::durable;
use crate::error::{Error, Result};
use crate::hash::ContentHash;

const IMAGE_FILE: &str = "image";

/// One of the two image slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    /// Slot A.
    A,
    /// Slot B.
    B,
}

impl Slot {
    /// The opposite slot.
    #[must_use]
    pub fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }

    /// Directory name under `slots/`.
    #[must_use]
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::A => "a",
            Self::B => "b",
        }
    }
}

impl std::fmt::Display for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// What a slot holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotImage {
    /// Version of the image.
    pub version: Version,
    /// Hash of the image bytes.
    pub hash: ContentHash,
}

/// Persisted A/B bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootControl {
    active: Slot,
    a: Option<SlotImage>,
    b: Option<SlotImage>,
    staged: Option<Slot>,
    pending: Option<Slot>,
    rollback: Option<Slot>,
}

impl BootControl {
    /// Bookkeeping for a device whose `active` slot holds `image`.
    #[must_use]
    pub fn new(active: Slot, image: SlotImage) -> Self {
        let mut control = Self {
            active,
            a: None,
            b: None,
            staged: None,
            pending: None,
            rollback: None,
        };
        *control.image_mut(active) = Some(image);
        control
    }

    fn image_mut(&mut self, slot: Slot) -> &mut Option<SlotImage> {
        match slot {
            Slot::A => &mut self.a,
            Slot::B => &mut self.b,
        }
    }

    /// Slot the device boots from.
    #[must_use]
    pub fn active(&self) -> Slot {
        self.active
    }

    /// Image held by `slot`.
    #[must_use]
    pub fn image(&self, slot: Slot) -> Option<&SlotImage> {
        match slot {
            Slot::A => self.a.as_ref(),
            Slot::B => self.b.as_ref(),
        }
    }

    /// Image held by the active slot.
    #[must_use]
    pub fn active_image(&self) -> Option<&SlotImage> {
        self.image(self.active)
    }

    /// Slot holding a staged image, if any.
    #[must_use]
    pub fn staged(&self) -> Option<Slot> {
        self.staged
    }

    /// The staged image, if any.
    #[must_use]
    pub fn staged_image(&self) -> Option<&SlotImage> {
        self.staged.and_then(|slot| self.image(slot))
    }

    /// Slot activated but not yet confirmed.
    #[must_use]
    pub fn pending(&self) -> Option<Slot> {
        self.pending
    }

    /// Slot the next image must be written to.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] while a switch is pending, since the
    /// standby slot is then the rollback target.
    pub fn standby(&self) -> Result<Slot> {
        if self.pending.is_some() {
            return Err(Error::InvalidState {
                state: "switch pending".to_string(),
                operation: "stage an image",
            });
        }
        Ok(self.active.other())
    }

    /// Record that `image` was written to the standby slot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] while a switch is pending.
    pub fn stage(&mut self, image: SlotImage) -> Result<Slot> {
        let standby = self.standby()?;
        *self.image_mut(standby) = Some(image);
        self.staged = Some(standby);
        Ok(standby)
    }

    /// Forget a staged image. Returns the slot it occupied.
    pub fn discard_stage(&mut self) -> Option<Slot> {
        let slot = self.staged.take()?;
        *self.image_mut(slot) = None;
        Some(slot)
    }

    /// Make the staged slot active, remembering the old one for rollback.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if nothing is staged or a switch is
    /// already pending.
    pub fn switch(&mut self) -> Result<Slot> {
        if self.pending.is_some() {
            return Err(Error::InvalidState {
                state: "switch pending".to_string(),
                operation: "switch slots",
            });
        }
        let slot = self.staged.take().ok_or_else(|| Error::InvalidState {
            state: "nothing staged".to_string(),
            operation: "switch slots",
        })?;
        self.rollback = Some(self.active);
        self.active = slot;
        self.pending = Some(slot);
        Ok(slot)
    }

    /// Accept the pending slot. The previous slot keeps its image as the
    /// single level of history until the next stage overwrites it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if no switch is pending.
    pub fn commit(&mut self) -> Result<()> {
        if self.pending.take().is_none() {
            return Err(Error::InvalidState {
                state: "no switch pending".to_string(),
                operation: "commit",
            });
        }
        self.rollback = None;
        Ok(())
    }

    /// Return to the rollback slot, dropping the failed image.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if there is no rollback target.
    pub fn rollback(&mut self) -> Result<Slot> {
        let target = self.rollback.take().ok_or_else(|| Error::InvalidState {
            state: "no rollback target".to_string(),
            operation: "roll back",
        })?;
        let failed = self.active;
        self.active = target;
        self.pending = None;
        self.staged = None;
        *self.image_mut(failed) = None;
        Ok(target)
    }
}

/// Image files for both slots under `<data_dir>/slots`.
#[derive(Debug, Clone)]
pub struct SlotStore {
    root: PathBuf,
}

impl SlotStore {
    /// Open (creating if needed) the slot directories.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        for slot in [Slot::A, Slot::B] {
            let dir = root.join(slot.dir_name());
            fs::create_dir_all(&dir).map_err(|source| Error::DirectoryCreate { path: dir, source })?;
        }
        Ok(Self { root })
    }

    /// Path of a slot's image file.
    #[must_use]
    pub fn image_path(&self, slot: Slot) -> PathBuf {
        self.root.join(slot.dir_name()).join(IMAGE_FILE)
    }

    /// Atomically replace a slot's image.
    ///
    /// # Errors
    ///
    /// Returns an error if the image cannot be written; the slot keeps its
    /// previous content in that case.
    pub fn write(&self, slot: Slot, bytes: &[u8]) -> Result<ContentHash> {
        let target = self.image_path(slot);
        let tmp = target.with_extension("partial");
        durable::replace_file(&tmp, &target, bytes)?;
        debug!(slot = %slot, size = bytes.len(), "Wrote slot image");
        Ok(ContentHash::of(bytes))
    }

    /// Read a slot's image and check it against `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::IntegrityViolation`] if the image does not match.
    pub fn read_verified(&self, slot: Slot, expected: &ContentHash) -> Result<Vec<u8>> {
        let bytes = fs::read(self.image_path(slot))?;
        expected.verify(&bytes)?;
        Ok(bytes)
    }

    /// Delete a slot's image if present.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be removed.
    pub fn clear(&self, slot: Slot) -> Result<()> {
        match fs::remove_file(self.image_path(slot)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
