//! Client update agent.
//!
//! One [`Agent`] per device runs a single sequential state machine:
//! `idle → checking → downloading → verifying → staged → applying →
//! confirming → active`, with `rolling_back` as the exit from `applying` and
//! `confirming`, and `failed` as the exit from everything before `applying`.
//!
//! Every transition is persisted before the work of the next state starts,
//! so a restarted agent resumes where it stopped. Nothing before `staged`
//! touches the active slot; once `applying` begins the session always runs
//! to `active`, either on the new version or back on the last known good.
//!
//! The agent is normally driven through an [`AgentHandle`] (see
//! [`Agent::spawn`]), which serializes commands through an actor task.

mod activate;
mod cancel;
pub mod control;
mod handle;
mod retry;
mod slots;
mod state;
mod transport;

use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub use activate::{Activator, CommandActivator, NoopActivator};
pub use cancel::CancelGate;
pub use handle::{AgentHandle, CheckOutcome};
pub use retry::Backoff;
pub use slots::{BootControl, Slot, SlotImage, SlotStore};
pub use state::{AgentState, SessionState, StateFile, STATE_FILE};
pub use transport::{HttpTransport, LocalTransport, UpdateTransport};

use crate::config::Config;
use crate::delta::{apply_patch_limited, Patch};
use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::model::{validate_name, PackageKind, ReasonCode, Report, SessionOutcome, UpdateState};
use crate::registry::Resolution;
use crate::trust::TrustedKeys;

const SLOTS_DIR: &str = "slots";
const DOWNLOADS_DIR: &str = "downloads";
const HEALTH_QUEUE: usize = 16;

/// Agent tuning and identity.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Device identifier.
    pub device_id: String,
    /// Update channel.
    pub channel: String,
    /// Directory holding the state file, slots and downloads.
    pub data_dir: PathBuf,
    /// Pinned keys release manifests must be signed with.
    pub trusted_keys: TrustedKeys,
    /// Bytes requested per range fetch.
    pub download_chunk_bytes: u64,
    /// Retry schedule for network operations.
    pub backoff: Backoff,
    /// Verification failures tolerated before the session fails.
    pub max_verify_attempts: u32,
    /// How long a newly activated slot has to report health.
    pub confirmation_window: Duration,
    /// Largest package the device will download.
    pub max_package_bytes: u64,
    /// Continue from `staged` to `applying` without an explicit apply.
    pub auto_apply: bool,
}

impl AgentOptions {
    /// Options from the `[agent]` and `[trust]` configuration sections.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the device id or trusted keys are
    /// missing or malformed.
    pub fn from_config(config: &Config) -> Result<Self> {
        let agent = &config.agent;
        let device_id = agent.device_id.clone().ok_or_else(|| Error::ConfigValidation {
            message: "agent.device_id is not set".to_string(),
        })?;
        let trusted_keys = TrustedKeys::from_hex(&config.trust.trusted_keys)?;
        Ok(Self {
            device_id,
            channel: agent.channel.clone(),
            data_dir: agent.data_dir.clone(),
            trusted_keys,
            download_chunk_bytes: agent.download_chunk_bytes,
            backoff: Backoff {
                max_attempts: agent.max_network_attempts,
                base: Duration::from_millis(agent.backoff_base_ms),
                max: Duration::from_millis(agent.backoff_max_ms),
            },
            max_verify_attempts: agent.max_verify_attempts,
            confirmation_window: Duration::from_secs(agent.confirmation_window_secs),
            max_package_bytes: agent.max_package_bytes,
            auto_apply: agent.auto_apply,
        })
    }
}

/// How a check or apply ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// No newer release on the channel.
    UpToDate,
    /// Verified and staged; waiting for an explicit apply.
    Staged {
        /// Staged version.
        version: Version,
    },
    /// New version activated and confirmed healthy.
    Updated {
        /// Version now running.
        version: Version,
    },
    /// New version activated and reverted.
    RolledBack {
        /// Version running after the rollback.
        version: Version,
        /// Why the new version was rejected.
        reason: ReasonCode,
    },
    /// Session ended without touching the running system.
    Failed {
        /// Why.
        reason: ReasonCode,
    },
}

/// Snapshot of the agent published after every persisted change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentStatus {
    /// Device identifier.
    pub device_id: String,
    /// Update channel.
    pub channel: String,
    /// State machine position.
    pub state: UpdateState,
    /// Version running.
    pub current_version: Version,
    /// Most recent confirmed version.
    pub last_known_good_version: Version,
    /// Slot the device boots from.
    pub active_slot: Slot,
    /// Version waiting in the standby slot.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staged_version: Option<Version>,
    /// In-flight session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    /// Version the session installs.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_version: Option<Version>,
    /// Bytes downloaded so far.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub download_offset: Option<u64>,
    /// Size of the package being downloaded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_size: Option<u64>,
    /// End of the confirmation window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirm_deadline: Option<DateTime<Utc>>,
    /// Terminal reports waiting for delivery.
    pub pending_reports: usize,
}

impl From<&AgentState> for AgentStatus {
    fn from(state: &AgentState) -> Self {
        let session = state.session.as_ref();
        Self {
            device_id: state.device_id.clone(),
            channel: state.channel.clone(),
            state: state.state,
            current_version: state.current_version.clone(),
            last_known_good_version: state.last_known_good_version.clone(),
            active_slot: state.boot.active(),
            staged_version: state.boot.staged_image().map(|i| i.version.clone()),
            session_id: session.map(|s| s.session_id),
            target_version: session.map(|s| s.target_version().clone()),
            download_offset: session.map(|s| s.download_offset),
            package_size: session.map(|s| s.package().size_bytes),
            confirm_deadline: session.and_then(|s| s.confirm_deadline),
            pending_reports: state.pending_reports.len(),
        }
    }
}

enum Step {
    Continue,
    Done(CycleOutcome),
}

/// The per-device update state machine.
#[derive(Debug)]
pub struct Agent {
    options: AgentOptions,
    transport: Arc<dyn UpdateTransport>,
    activator: Arc<dyn Activator>,
    slots: SlotStore,
    file: StateFile,
    downloads: PathBuf,
    state: AgentState,
    cancel: Arc<CancelGate>,
    health_tx: mpsc::Sender<bool>,
    health_rx: mpsc::Receiver<bool>,
    status_tx: watch::Sender<AgentStatus>,
}

fn is_resting(state: UpdateState) -> bool {
    matches!(
        state,
        UpdateState::Idle | UpdateState::Active | UpdateState::Failed | UpdateState::Staged
    )
}

impl Agent {
    /// Write the factory image into slot A and create the state file.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] if the device is already provisioned,
    /// or an I/O error.
    pub fn provision(options: &AgentOptions, version: Version, image: &[u8]) -> Result<AgentState> {
        validate_name("device id", &options.device_id)?;
        validate_name("channel", &options.channel)?;
        let file = StateFile::in_dir(&options.data_dir);
        if file.exists() {
            return Err(Error::InvalidState {
                state: "provisioned".to_string(),
                operation: "provision",
            });
        }
        let slots = SlotStore::open(options.data_dir.join(SLOTS_DIR))?;
        let hash = slots.write(Slot::A, image)?;
        let boot = BootControl::new(
            Slot::A,
            SlotImage {
                version: version.clone(),
                hash,
            },
        );
        let state = AgentState::provisioned(
            options.device_id.clone(),
            options.channel.clone(),
            version,
            boot,
        );
        file.save(&state)?;
        info!(
            device_id = %state.device_id,
            version = %state.current_version,
            hash = %hash.short(),
            "Provisioned device"
        );
        Ok(state)
    }

    /// Load a provisioned agent.
    ///
    /// # Errors
    ///
    /// Returns an error if the device was never provisioned, the state file
    /// belongs to another device, or no trusted key is configured.
    pub fn open(
        options: AgentOptions,
        transport: Arc<dyn UpdateTransport>,
        activator: Arc<dyn Activator>,
    ) -> Result<Self> {
        validate_name("device id", &options.device_id)?;
        validate_name("channel", &options.channel)?;
        if options.trusted_keys.is_empty() {
            return Err(Error::ConfigValidation {
                message: "the agent needs at least one trusted key".to_string(),
            });
        }

        let file = StateFile::in_dir(&options.data_dir);
        let mut state = file.load()?;
        if state.device_id != options.device_id {
            return Err(Error::validation(format!(
                "state file belongs to device '{}', not '{}'",
                state.device_id, options.device_id
            )));
        }
        if state.channel != options.channel {
            info!(from = %state.channel, to = %options.channel, "Update channel changed");
            state.channel.clone_from(&options.channel);
            file.save(&state)?;
        }

        let slots = SlotStore::open(options.data_dir.join(SLOTS_DIR))?;
        let downloads = options.data_dir.join(DOWNLOADS_DIR);
        fs::create_dir_all(&downloads).map_err(|source| Error::DirectoryCreate {
            path: downloads.clone(),
            source,
        })?;

        let cancel = if state.state.is_past_point_of_no_return() {
            CancelGate::closed()
        } else {
            CancelGate::default()
        };
        let (health_tx, health_rx) = mpsc::channel(HEALTH_QUEUE);
        let (status_tx, _) = watch::channel(AgentStatus::from(&state));
        Ok(Self {
            options,
            transport,
            activator,
            slots,
            file,
            downloads,
            state,
            cancel: Arc::new(cancel),
            health_tx,
            health_rx,
            status_tx,
        })
    }

    /// Persisted state.
    #[must_use]
    pub fn state(&self) -> &AgentState {
        &self.state
    }

    /// Current status.
    #[must_use]
    pub fn status(&self) -> AgentStatus {
        self.status_tx.borrow().clone()
    }

    /// Subscribe to status changes.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AgentStatus> {
        self.status_tx.subscribe()
    }

    /// Sender for health signals (`true` healthy, `false` failing).
    #[must_use]
    pub fn health_sender(&self) -> mpsc::Sender<bool> {
        self.health_tx.clone()
    }

    /// Gate for cancelling the in-flight session at its next checkpoint.
    #[must_use]
    pub fn cancel_gate(&self) -> Arc<CancelGate> {
        Arc::clone(&self.cancel)
    }

    /// Slot image files.
    #[must_use]
    pub fn slots(&self) -> &SlotStore {
        &self.slots
    }

    /// Check for an update and carry it as far as the options allow.
    ///
    /// If an earlier session was interrupted, it is resumed instead.
    ///
    /// # Errors
    ///
    /// Protocol failures are outcomes, not errors. An error means local
    /// storage failed; the state stays where it was and the next check or
    /// [`Agent::recover`] resumes it.
    pub async fn check_now(&mut self) -> Result<CycleOutcome> {
        let result = self.run_check().await;
        self.settle_cancel(result).await
    }

    async fn run_check(&mut self) -> Result<CycleOutcome> {
        self.flush_reports().await?;
        if is_resting(self.state.state) {
            self.transition(UpdateState::Checking)?;
        } else {
            info!(state = %self.state.state, "Resuming interrupted update");
        }
        self.drive(false).await
    }

    /// Apply a staged update.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidState`] unless an update is staged.
    pub async fn apply_staged(&mut self) -> Result<CycleOutcome> {
        if self.state.state != UpdateState::Staged {
            return Err(Error::InvalidState {
                state: self.state.state.to_string(),
                operation: "apply",
            });
        }
        let result = self.drive(true).await;
        self.settle_cancel(result).await
    }

    /// Cancel a resting staged session. Returns whether anything was
    /// cancelled.
    ///
    /// # Errors
    ///
    /// Returns an error if local state cannot be written.
    pub async fn cancel(&mut self) -> Result<bool> {
        self.cancel.take();
        if self.state.state != UpdateState::Staged {
            return Ok(false);
        }
        self.cancel_session().await?;
        Ok(true)
    }

    /// Resume a session interrupted by a crash or restart.
    ///
    /// Returns `None` if the agent was at rest.
    ///
    /// # Errors
    ///
    /// Returns an error if local storage fails.
    pub async fn recover(&mut self) -> Result<Option<CycleOutcome>> {
        self.flush_reports().await?;
        if is_resting(self.state.state) {
            return Ok(None);
        }
        info!(state = %self.state.state, "Recovering interrupted update");
        let result = self.drive(false).await;
        self.settle_cancel(result).await.map(Some)
    }

    /// Shut the cancel gate at the end of a cycle. A request that arrived
    /// as a stage-only cycle ended discards the stage.
    async fn settle_cancel(&mut self, result: Result<CycleOutcome>) -> Result<CycleOutcome> {
        if self.cancel.shut() && self.state.state == UpdateState::Staged {
            return self.cancel_session().await;
        }
        result
    }

    async fn drive(&mut self, apply: bool) -> Result<CycleOutcome> {
        if !self.state.state.is_past_point_of_no_return() {
            self.cancel.open();
        }
        loop {
            let state = self.state.state;
            if is_resting(state) && state != UpdateState::Staged {
                return Err(Error::InvalidState {
                    state: state.to_string(),
                    operation: "continue an update",
                });
            }
            if !state.is_past_point_of_no_return() && self.cancel.take() {
                return self.cancel_session().await;
            }
            let step = match state {
                UpdateState::Checking => self.step_check().await?,
                UpdateState::Downloading => self.step_download().await?,
                UpdateState::Verifying => self.step_verify().await?,
                UpdateState::Staged => self.step_staged(apply).await?,
                UpdateState::Applying => self.step_apply().await?,
                UpdateState::Confirming => self.step_confirm().await?,
                UpdateState::RollingBack => self.step_rollback().await?,
                UpdateState::Idle | UpdateState::Active | UpdateState::Failed => Step::Continue,
            };
            if let Step::Done(outcome) = step {
                return Ok(outcome);
            }
        }
    }

    async fn step_check(&mut self) -> Result<Step> {
        let force_full = self.state.session.as_ref().is_some_and(|s| s.force_full);
        let transport = Arc::clone(&self.transport);
        let device_id = self.state.device_id.clone();
        let channel = self.state.channel.clone();
        let current = self.state.current_version.clone();

        let resolved = self
            .options
            .backoff
            .retry("resolve", || {
                transport.resolve(&device_id, &channel, &current, force_full)
            })
            .await;
        let resolution = match resolved {
            Ok(resolution) => resolution,
            Err(err) => return self.fail(err).await,
        };

        let update = match resolution {
            Resolution::Available(update)
                if update.release.version > current && update.release.channel == channel =>
            {
                *update
            }
            Resolution::Available(update) => {
                warn!(
                    version = %update.release.version,
                    current = %current,
                    "Ignoring resolution that is not an upgrade on this channel"
                );
                return self.up_to_date().await;
            }
            Resolution::UpToDate => return self.up_to_date().await,
        };

        if let Some(staged) = self.state.boot.staged_image().map(|i| i.version.clone()) {
            self.discard_stage()?;
            if update.release.version <= staged {
                info!(
                    staged = %staged,
                    resolved = %update.release.version,
                    "Discarding stale stage"
                );
                self.persist()?;
                return Ok(Step::Continue);
            }
            info!(staged = %staged, resolved = %update.release.version, "Newer release replaces stage");
        }

        let required = update.package.size_bytes;
        let previous = self.state.session.as_ref().map(|s| s.package().content_hash);
        match self.state.session.as_mut() {
            Some(session) => session.retarget(update),
            None => self.state.session = Some(SessionState::new(update)),
        }
        if let Some(previous) = previous {
            self.remove_download(&previous)?;
        }
        if required > self.options.max_package_bytes {
            return self
                .fail(Error::InsufficientStorage {
                    required,
                    available: self.options.max_package_bytes,
                })
                .await;
        }

        if let Some(session) = &self.state.session {
            info!(
                device_id = %self.state.device_id,
                session_id = %session.session_id,
                version = %session.target_version(),
                kind = %session.package().kind,
                size = session.package().size_bytes,
                "Update available"
            );
        }
        self.transition(UpdateState::Downloading)?;
        self.report_progress().await;
        Ok(Step::Continue)
    }

    async fn up_to_date(&mut self) -> Result<Step> {
        self.discard_stage()?;
        if let Some(session) = &self.state.session {
            // The session's release is no longer offered.
            let reason = session.failure.unwrap_or(ReasonCode::Cancelled);
            let hash = session.package().content_hash;
            info!(session_id = %session.session_id, "Update no longer offered");
            self.remove_download(&hash)?;
            self.finish(SessionOutcome::Failed, Some(reason), UpdateState::Failed)
                .await?;
            return Ok(Step::Done(CycleOutcome::Failed { reason }));
        }
        debug!(version = %self.state.current_version, "Already up to date");
        self.transition(UpdateState::Idle)?;
        Ok(Step::Done(CycleOutcome::UpToDate))
    }

    async fn step_download(&mut self) -> Result<Step> {
        let session = self.state.session_mut("download")?;
        let package = session.package().clone();
        let mut offset = session.download_offset;
        let size = package.size_bytes;
        let hash = package.content_hash;

        let path = self.download_path(&hash);
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)?;
        // Bytes past the persisted offset were never synced and recorded.
        file.set_len(offset)?;
        file.seek(SeekFrom::Start(offset))?;
        if offset > 0 {
            info!(hash = %hash.short(), offset, size, "Resuming download");
        }

        let transport = Arc::clone(&self.transport);
        let backoff = self.options.backoff;
        while offset < size {
            if self.cancel.take() {
                drop(file);
                return self.cancel_session().await.map(Step::Done);
            }
            let want = (size - offset).min(self.options.download_chunk_bytes);
            let fetched = backoff
                .retry("download", || transport.fetch_range(&hash, offset, want))
                .await;
            let bytes = match fetched {
                Ok(bytes) if !bytes.is_empty() && bytes.len() as u64 <= want => bytes,
                Ok(bytes) => {
                    let err = Error::network(format!(
                        "server returned {} bytes for a {want}-byte range",
                        bytes.len()
                    ));
                    return self.fail(err).await;
                }
                Err(err) => return self.fail(err).await,
            };
            file.write_all(&bytes)?;
            file.sync_data()?;
            offset += bytes.len() as u64;
            self.state.session_mut("download")?.download_offset = offset;
            self.persist()?;
        }
        drop(file);

        debug!(hash = %hash.short(), size, "Download complete");
        self.transition(UpdateState::Verifying)?;
        Ok(Step::Continue)
    }

    async fn step_verify(&mut self) -> Result<Step> {
        let hash = self.state.session_mut("verify")?.package().content_hash;
        if !self.download_path(&hash).exists() {
            warn!(hash = %hash.short(), "Downloaded package is gone, downloading again");
            self.state.session_mut("verify")?.download_offset = 0;
            self.transition(UpdateState::Downloading)?;
            return Ok(Step::Continue);
        }

        let err = match self.verify_and_stage() {
            Ok(slot) => {
                info!(
                    slot = %slot,
                    version = ?self.state.boot.staged_image().map(|i| i.version.to_string()),
                    "Update verified and staged"
                );
                self.transition(UpdateState::Staged)?;
                self.remove_download(&hash)?;
                self.report_progress().await;
                return Ok(Step::Continue);
            }
            // Local storage fault; the download is kept and verification
            // runs again on the next check.
            Err(err @ Error::Io(_)) => return Err(err),
            Err(err) => err,
        };

        self.remove_download(&hash)?;

        if matches!(err, Error::PatchIncompatible { .. } | Error::PatchMalformed(_)) {
            let session = self.state.session_mut("verify")?;
            if session.force_full {
                return self.fail(err).await;
            }
            session.force_full = true;
            session.failure = err.reason_code();
            warn!("Delta unusable, falling back to the full image: {err}");
            self.transition(UpdateState::Checking)?;
            return Ok(Step::Continue);
        }

        if err.requires_redownload() {
            let max = self.options.max_verify_attempts;
            let session = self.state.session_mut("verify")?;
            session.verify_attempts += 1;
            session.failure = err.reason_code();
            let attempts = session.verify_attempts;
            if attempts < max {
                warn!(attempt = attempts, of = max, "Verification failed, downloading again: {err}");
                self.transition(UpdateState::Checking)?;
                return Ok(Step::Continue);
            }
        }
        self.fail(err).await
    }

    /// Verify the downloaded package and write the resulting image to the
    /// standby slot.
    fn verify_and_stage(&mut self) -> Result<Slot> {
        let session = self
            .state
            .session
            .as_ref()
            .ok_or_else(|| Error::internal("verifying without a session"))?;
        let update = &session.update;
        let package = &update.package;

        let manifest_bytes = update.manifest.as_bytes();
        let manifest_hash = ContentHash::of(manifest_bytes);
        if manifest_hash != update.release.manifest_hash {
            return Err(Error::signature(format!(
                "manifest hashes to {manifest_hash}, release declares {}",
                update.release.manifest_hash
            )));
        }
        let manifest = self
            .options
            .trusted_keys
            .verify_manifest(manifest_bytes, &update.release.signature)?;
        if manifest.channel != self.state.channel || manifest.version != update.release.version {
            return Err(Error::signature(format!(
                "manifest describes {}@{}, expected {}@{}",
                manifest.channel, manifest.version, self.state.channel, update.release.version
            )));
        }
        manifest.check_package(package)?;

        let bytes = fs::read(self.download_path(&package.content_hash))?;
        package.content_hash.verify(&bytes)?;

        let image = match package.kind {
            PackageKind::Full => bytes,
            PackageKind::Delta => {
                let active = self
                    .state
                    .boot
                    .active_image()
                    .ok_or_else(|| Error::internal("active slot has no image"))?;
                if package.source_version.as_ref() != Some(&active.version) {
                    return Err(Error::PatchIncompatible {
                        expected: Patch::decode(&bytes)?.source,
                        actual: active.hash,
                    });
                }
                // The release's full image is exactly what the patch rebuilds.
                let target_len = manifest
                    .full_entry()
                    .map_or(self.options.max_package_bytes, |full| full.size_bytes);
                let base = match self.slots.read_verified(self.state.boot.active(), &active.hash) {
                    Ok(base) => base,
                    // A damaged local base cannot be patched; the full image can still be used.
                    Err(Error::IntegrityViolation { expected, actual }) => {
                        return Err(Error::PatchIncompatible { expected, actual });
                    }
                    Err(err) => return Err(err),
                };
                apply_patch_limited(&base, &bytes, target_len)?
            }
        };
        package.target_hash.verify(&image)?;

        let staged = SlotImage {
            version: update.release.version.clone(),
            hash: package.target_hash,
        };
        let standby = self.state.boot.standby()?;
        self.slots.write(standby, &image)?;
        self.state.boot.stage(staged)
    }

    async fn step_staged(&mut self, apply: bool) -> Result<Step> {
        if !apply && !self.options.auto_apply {
            let version = self.state.session_mut("stage")?.target_version().clone();
            return Ok(Step::Done(CycleOutcome::Staged { version }));
        }
        if !self.cancel.close() {
            return self.cancel_session().await.map(Step::Done);
        }
        let target = self.state.session_mut("apply")?.target_version().clone();
        let slot = self.state.boot.switch()?;
        self.state.current_version = target.clone();
        info!(slot = %slot, version = %target, "Switching active slot");
        self.transition(UpdateState::Applying)?;
        Ok(Step::Continue)
    }

    async fn step_apply(&mut self) -> Result<Step> {
        self.report_progress().await;
        let slot = self.state.boot.active();
        let version = self.state.current_version.clone();
        let window = chrono::Duration::from_std(self.options.confirmation_window)
            .map_err(|_| Error::internal("confirmation window out of range"))?;

        // Signals sent before activation say nothing about the new slot. The
        // restarted application may report while the activator still runs,
        // so anything after this point is kept.
        while self.health_rx.try_recv().is_ok() {}
        match self
            .activator
            .activate(slot, &self.slots.image_path(slot), &version)
            .await
        {
            Ok(()) => {
                self.state.session_mut("confirm")?.confirm_deadline = Some(Utc::now() + window);
                self.transition(UpdateState::Confirming)?;
                self.report_progress().await;
            }
            Err(err) => {
                error!(slot = %slot, version = %version, "Activation failed: {err}");
                self.state.session_mut("roll back")?.failure = Some(ReasonCode::ApplyFailure);
                self.transition(UpdateState::RollingBack)?;
            }
        }
        Ok(Step::Continue)
    }

    async fn step_confirm(&mut self) -> Result<Step> {
        let deadline = match self.state.session_mut("confirm")?.confirm_deadline {
            Some(deadline) => deadline,
            None => {
                let window = chrono::Duration::from_std(self.options.confirmation_window)
                    .map_err(|_| Error::internal("confirmation window out of range"))?;
                let deadline = Utc::now() + window;
                self.state.session_mut("confirm")?.confirm_deadline = Some(deadline);
                self.persist()?;
                deadline
            }
        };
        let remaining = (deadline - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        debug!(
            version = %self.state.current_version,
            remaining_ms = remaining.as_millis(),
            "Waiting for health signal"
        );

        let failure = match tokio::time::timeout(remaining, self.health_rx.recv()).await {
            Ok(Some(true)) => return self.commit().await,
            Ok(Some(false)) => ReasonCode::HealthCheckFailed,
            Ok(None) | Err(_) => ReasonCode::ConfirmationTimeout,
        };
        warn!(
            version = %self.state.current_version,
            reason = %failure,
            "Update not confirmed, rolling back"
        );
        self.state.session_mut("roll back")?.failure = Some(failure);
        self.transition(UpdateState::RollingBack)?;
        Ok(Step::Continue)
    }

    async fn commit(&mut self) -> Result<Step> {
        self.state.boot.commit()?;
        let version = self.state.current_version.clone();
        self.state.last_known_good_version = version.clone();
        info!(device_id = %self.state.device_id, version = %version, "Update confirmed");
        self.finish(SessionOutcome::Success, None, UpdateState::Active)
            .await?;
        Ok(Step::Done(CycleOutcome::Updated { version }))
    }

    async fn step_rollback(&mut self) -> Result<Step> {
        if self.state.boot.pending().is_some() {
            let failed = self.state.boot.active();
            let slot = self.state.boot.rollback()?;
            self.state.current_version = self.state.last_known_good_version.clone();
            self.persist()?;
            self.slots.clear(failed)?;
            info!(slot = %slot, version = %self.state.current_version, "Reverted active slot");
        }

        let slot = self.state.boot.active();
        let version = self.state.current_version.clone();
        // Left in rolling_back on failure; the next check or recovery retries.
        self.activator
            .activate(slot, &self.slots.image_path(slot), &version)
            .await?;

        let reason = self
            .state
            .session
            .as_ref()
            .and_then(|s| s.failure)
            .unwrap_or(ReasonCode::ApplyFailure);
        self.finish(SessionOutcome::RolledBack, Some(reason), UpdateState::Active)
            .await?;
        Ok(Step::Done(CycleOutcome::RolledBack { version, reason }))
    }

    /// End the session before anything touched the running system.
    ///
    /// Only called with failures of the exchange with the server; the next
    /// check resolves from scratch.
    async fn fail(&mut self, err: Error) -> Result<Step> {
        let reason = err.session_reason();
        warn!(device_id = %self.state.device_id, reason = %reason, "Update failed: {err}");
        self.discard_local_artifacts()?;
        self.finish(SessionOutcome::Failed, Some(reason), UpdateState::Failed)
            .await?;
        Ok(Step::Done(CycleOutcome::Failed { reason }))
    }

    async fn cancel_session(&mut self) -> Result<CycleOutcome> {
        info!(device_id = %self.state.device_id, state = %self.state.state, "Cancelling update");
        self.discard_local_artifacts()?;
        let reason = ReasonCode::Cancelled;
        self.finish(SessionOutcome::Failed, Some(reason), UpdateState::Failed)
            .await?;
        Ok(CycleOutcome::Failed { reason })
    }

    fn discard_local_artifacts(&mut self) -> Result<()> {
        if let Some(hash) = self.state.session.as_ref().map(|s| s.package().content_hash) {
            self.remove_download(&hash)?;
        }
        self.discard_stage()?;
        Ok(())
    }

    fn discard_stage(&mut self) -> Result<()> {
        if let Some(slot) = self.state.boot.discard_stage() {
            self.slots.clear(slot)?;
            debug!(slot = %slot, "Discarded staged image");
        }
        Ok(())
    }

    fn download_path(&self, hash: &ContentHash) -> PathBuf {
        self.downloads.join(format!("{hash}.part"))
    }

    fn remove_download(&self, hash: &ContentHash) -> Result<()> {
        match fs::remove_file(self.download_path(hash)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn transition(&mut self, to: UpdateState) -> Result<()> {
        let from = self.state.state;
        self.state.state = to;
        self.persist()?;
        if from != to {
            info!(device_id = %self.state.device_id, from = %from, to = %to, "Agent state transition");
        }
        Ok(())
    }

    fn persist(&mut self) -> Result<()> {
        self.file.save(&self.state)?;
        self.status_tx.send_replace(AgentStatus::from(&self.state));
        Ok(())
    }

    fn build_report(
        &self,
        session: Option<&SessionState>,
        outcome: SessionOutcome,
        reason: Option<ReasonCode>,
    ) -> Report {
        Report {
            session_id: session.map_or_else(Uuid::new_v4, |s| s.session_id),
            device_id: self.state.device_id.clone(),
            target_version: session.map_or_else(
                || self.state.current_version.clone(),
                |s| s.target_version().clone(),
            ),
            package_hash: session.map(|s| s.package().content_hash),
            package_kind: session.map(|s| s.package().kind),
            state: self.state.state,
            outcome,
            reason,
            current_version: self.state.current_version.clone(),
            last_known_good_version: Some(self.state.last_known_good_version.clone()),
        }
    }

    /// Close the session and queue its terminal report.
    async fn finish(
        &mut self,
        outcome: SessionOutcome,
        reason: Option<ReasonCode>,
        end: UpdateState,
    ) -> Result<()> {
        let session = self.state.session.take();
        let from = self.state.state;
        self.state.state = end;
        let report = self.build_report(session.as_ref(), outcome, reason);
        info!(
            device_id = %report.device_id,
            session_id = %report.session_id,
            target = %report.target_version,
            outcome = %outcome,
            reason = ?reason,
            "Update session finished"
        );
        self.state.pending_reports.push(report);
        self.persist()?;
        if from != end {
            info!(device_id = %self.state.device_id, from = %from, to = %end, "Agent state transition");
        }
        self.flush_reports().await
    }

    /// Best-effort progress report; failures are only logged.
    async fn report_progress(&self) {
        let Some(session) = &self.state.session else {
            return;
        };
        let report = self.build_report(Some(session), SessionOutcome::InProgress, None);
        if let Err(err) = self.transport.report(&report).await {
            debug!(state = %report.state, "Progress report not delivered: {err}");
        }
    }

    /// Deliver queued terminal reports in order, stopping at the first
    /// transient failure.
    async fn flush_reports(&mut self) -> Result<()> {
        if self.state.pending_reports.is_empty() {
            return Ok(());
        }
        let mut done = 0;
        for report in &self.state.pending_reports {
            match self.transport.report(report).await {
                Ok(ack) => {
                    debug!(session_id = %report.session_id, replayed = ack.replayed, "Report delivered");
                    done += 1;
                }
                Err(err) if err.is_retryable() => {
                    warn!(
                        pending = self.state.pending_reports.len() - done,
                        "Report delivery deferred: {err}"
                    );
                    break;
                }
                Err(err) => {
                    warn!(session_id = %report.session_id, "Server rejected report, dropping it: {err}");
                    done += 1;
                }
            }
        }
        if done > 0 {
            self.state.pending_reports.drain(..done);
            self.persist()?;
        }
        Ok(())
    }
}
