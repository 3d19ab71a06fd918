//! Activation hook: make the device boot or restart into a slot.

use std::path::Path;

use async_trait::async_trait;
use semver::Version;
use tokio::process::Command;
use tracing::{debug, warn};

use super::slots::Slot;
use crate::error::{Error, Result};

/// Switches the running system to a slot.
///
/// Called both when applying a new slot and when rolling back to the
/// previous one, so implementations must be idempotent.
#[async_trait]
pub trait Activator: Send + Sync + std::fmt::Debug {
    /// Activate `slot`, whose image at `image` is `version`.
    async fn activate(&self, slot: Slot, image: &Path, version: &Version) -> Result<()>;
}

/// Activator that does nothing; the slot pointer in the state file is the
/// only record of which slot is active.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopActivator;

#[async_trait]
impl Activator for NoopActivator {
    async fn activate(&self, slot: Slot, _image: &Path, version: &Version) -> Result<()> {
        debug!(slot = %slot, version = %version, "No activation command configured");
        Ok(())
    }
}

/// Runs an external program to activate a slot.
///
/// The program sees `SLOTWISE_SLOT`, `SLOTWISE_IMAGE` and
/// `SLOTWISE_VERSION` in its environment. A non-zero exit is an apply
/// failure.
#[derive(Debug, Clone)]
pub struct CommandActivator {
    program: String,
    args: Vec<String>,
}

impl CommandActivator {
    /// Build from a command line; the first element is the program.
    ///
    /// # Errors
    ///
    /// Returns a validation error for an empty command line.
    pub fn new(command: &[String]) -> Result<Self> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| Error::validation("activate_command is empty"))?;
        Ok(Self {
            program: program.clone(),
            args: args.to_vec(),
        })
    }
}

#[async_trait]
impl Activator for CommandActivator {
    async fn activate(&self, slot: Slot, image: &Path, version: &Version) -> Result<()> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .env("SLOTWISE_SLOT", slot.dir_name())
            .env("SLOTWISE_IMAGE", image)
            .env("SLOTWISE_VERSION", version.to_string())
            .output()
            .await
            .map_err(|e| Error::apply(format!("failed to run {}: {e}", self.program)))?;

        if output.status.success() {
            debug!(slot = %slot, version = %version, "Activation command succeeded");
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(
            slot = %slot,
            status = %output.status,
            stderr = %stderr.trim(),
            "Activation command failed"
        );
        Err(Error::apply(format!(
            "{} exited with {}",
            self.program, output.status
        )))
    }
}
