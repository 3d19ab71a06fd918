//! Persisted agent state.
//!
//! Everything the agent needs to resume after a crash or restart lives in a
//! single JSON file that is replaced atomically on every change.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use super::slots::BootControl;
use crate::durable;
use crate::error::{Error, Result};
use crate::model::{Package, ReasonCode, Report, UpdateState};
use crate::registry::ResolvedUpdate;

/// File name of the state file inside the agent data directory.
pub const STATE_FILE: &str = "agent-state.json";

/// The in-flight update session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Session id used in every report.
    pub session_id: Uuid,
    /// What the server resolved.
    pub update: ResolvedUpdate,
    /// Bytes of the package already received and synced to disk.
    pub download_offset: u64,
    /// Failed verification attempts so far.
    pub verify_attempts: u32,
    /// Resolve with `full=true` from now on.
    pub force_full: bool,
    /// Most recent failure within the session; the rollback reason once
    /// the new slot is rejected.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<ReasonCode>,
    /// End of the confirmation window, set on entering `confirming`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirm_deadline: Option<DateTime<Utc>>,
    /// When the session began.
    pub started_at: DateTime<Utc>,
}

impl SessionState {
    /// Start a session for a resolved update.
    #[must_use]
    pub fn new(update: ResolvedUpdate) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            update,
            download_offset: 0,
            verify_attempts: 0,
            force_full: false,
            failure: None,
            confirm_deadline: None,
            started_at: Utc::now(),
        }
    }

    /// The package being installed.
    #[must_use]
    pub fn package(&self) -> &Package {
        &self.update.package
    }

    /// The version being installed.
    #[must_use]
    pub fn target_version(&self) -> &Version {
        &self.update.release.version
    }

    /// Replace the resolved update, keeping the session id and attempt count.
    pub fn retarget(&mut self, update: ResolvedUpdate) {
        self.update = update;
        self.download_offset = 0;
        self.confirm_deadline = None;
    }
}

/// Everything the agent persists.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentState {
    /// Device identifier.
    pub device_id: String,
    /// Update channel.
    pub channel: String,
    /// State machine position.
    pub state: UpdateState,
    /// Version the device is running.
    pub current_version: Version,
    /// Most recent version confirmed healthy.
    pub last_known_good_version: Version,
    /// A/B bookkeeping.
    pub boot: BootControl,
    /// In-flight session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionState>,
    /// Terminal reports not yet acknowledged by the server.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_reports: Vec<Report>,
}

impl AgentState {
    /// State of a freshly provisioned device running `version`.
    #[must_use]
    pub fn provisioned(device_id: String, channel: String, version: Version, boot: BootControl) -> Self {
        Self {
            device_id,
            channel,
            state: UpdateState::Idle,
            current_version: version.clone(),
            last_known_good_version: version,
            boot,
            session: None,
            pending_reports: Vec::new(),
        }
    }

    /// Session, or an invalid-state error naming `operation`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] when no session is in flight.
    pub fn session_mut(&mut self, operation: &'static str) -> Result<&mut SessionState> {
        let state = self.state;
        self.session.as_mut().ok_or_else(|| Error::InvalidState {
            state: state.to_string(),
            operation,
        })
    }
}

/// Location of the state file and its atomic replacement.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    /// State file inside `data_dir`.
    #[must_use]
    pub fn in_dir(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(STATE_FILE),
        }
    }

    /// Path of the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether the device has been provisioned.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Read the state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the device was never provisioned, or a
    /// parse error if the file is damaged.
    pub fn load(&self) -> Result<AgentState> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::not_found(format!(
                    "agent state at {} (run `slotwise agent init` first)",
                    self.path.display()
                )));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write the state: temp file, fsync, rename, fsync of the directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written. The previous state
    /// remains in place in that case.
    pub fn save(&self, state: &AgentState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let bytes = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        durable::replace_file(&tmp, &self.path, &bytes)?;
        debug!(state = %state.state, "Saved agent state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::slots::{Slot, SlotImage};
    use crate::hash::ContentHash;

    fn state() -> AgentState {
        let version = Version::new(1, 0, 0);
        let boot = BootControl::new(
            Slot::A,
            SlotImage {
                version: version.clone(),
                hash: ContentHash::of(b"v1"),
            },
        );
        AgentState::provisioned("dev-1".into(), "stable".into(), version, boot)
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::in_dir(dir.path());
        assert!(!file.exists());

        let mut state = state();
        state.state = UpdateState::Active;
        file.save(&state).unwrap();
        assert_eq!(file.load().unwrap(), state);
        assert!(!file.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_load_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let err = StateFile::in_dir(dir.path()).load().unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_load_damaged_file_fails() {
        let dir = tempfile::tempdir().unwrap();
        let file = StateFile::in_dir(dir.path());
        fs::write(file.path(), b"{ not json").unwrap();
        assert!(matches!(file.load().unwrap_err(), Error::Json(_)));
    }

    #[test]
    fn test_session_mut_requires_session() {
        let mut state = state();
        assert!(matches!(
            state.session_mut("verify").unwrap_err(),
            Error::InvalidState { .. }
        ));
    }
}
