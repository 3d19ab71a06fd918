//! Update server: resolution, package retrieval and report ingestion.
//!
//! [`UpdateService`] holds the protocol logic and is transport-agnostic; the
//! [`http`] module exposes it over axum, and the agent's local transport
//! calls it in-process.

pub mod http;
mod locks;

use std::sync::Arc;

use chrono::Utc;
use semver::Version;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

pub use locks::DeviceLocks;

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::model::{DeviceRecord, Release, Report, SessionOutcome, UpdateSession, UpdateState};
use crate::registry::{Registry, Resolution};
use crate::store::PackageStore;

/// Acknowledgement of a report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReportAck {
    /// The session as recorded.
    pub session: UpdateSession,
    /// True if the report was a replay of an already terminal session and
    /// changed nothing.
    pub replayed: bool,
}

/// Server-side protocol core.
#[derive(Debug)]
pub struct UpdateService {
    registry: Arc<Registry>,
    store: Arc<dyn PackageStore>,
    locks: DeviceLocks,
    max_range_bytes: u64,
}

impl UpdateService {
    /// Create a service over a registry and package store.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<dyn PackageStore>,
        lock_shards: usize,
        max_range_bytes: u64,
    ) -> Self {
        Self {
            registry,
            store,
            locks: DeviceLocks::new(lock_shards),
            max_range_bytes: max_range_bytes.max(1),
        }
    }

    /// The registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// The package store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn PackageStore> {
        &self.store
    }

    /// Largest range served by one request.
    #[must_use]
    pub fn max_range_bytes(&self) -> u64 {
        self.max_range_bytes
    }

    /// Resolve the best update for a device.
    ///
    /// # Errors
    ///
    /// See [`Registry::resolve`].
    pub fn resolve(
        &self,
        device_id: &str,
        channel: &str,
        current: &Version,
        force_full: bool,
    ) -> Result<Resolution> {
        let resolution = self
            .registry
            .resolve(device_id, channel, current, force_full)?;
        if let Some(update) = resolution.update() {
            debug!(
                device = device_id,
                from = %current,
                to = %update.release.version,
                kind = %update.package.kind,
                "Resolved update"
            );
        }
        Ok(resolution)
    }

    /// Size of a package.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the package is absent.
    pub fn package_size(&self, hash: &ContentHash) -> Result<u64> {
        self.store.size(hash)
    }

    /// A complete, verified package.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::IntegrityViolation`].
    pub fn package(&self, hash: &ContentHash) -> Result<Vec<u8>> {
        self.store.get(hash)
    }

    /// Up to `len` bytes of a package from `offset`, capped at the configured
    /// maximum range size.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] or [`Error::RangeNotSatisfiable`].
    pub fn package_range(&self, hash: &ContentHash, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.store
            .get_range(hash, offset, len.min(self.max_range_bytes))
    }

    /// Record an agent report.
    ///
    /// Reports for one device are serialized. A report whose session is
    /// already terminal is a replay: nothing is written and the stored
    /// session is returned.
    ///
    /// # Errors
    ///
    /// Returns a validation error for malformed reports or a session id
    /// reused by another device, or a storage error.
    pub async fn report(&self, report: Report) -> Result<ReportAck> {
        report.validate()?;
        let _guard = self.locks.lock(&report.device_id).await;

        let existing = self.registry.session(&report.session_id)?;
        if let Some(existing) = &existing {
            if existing.device_id != report.device_id {
                return Err(Error::validation(format!(
                    "session {} belongs to another device",
                    report.session_id
                )));
            }
            if existing.is_terminal() {
                debug!(
                    device_id = %report.device_id,
                    session_id = %report.session_id,
                    "Ignoring replayed report for terminal session"
                );
                return Ok(ReportAck {
                    session: existing.clone(),
                    replayed: true,
                });
            }
        }

        let now = Utc::now();
        let mut device = self
            .registry
            .device(&report.device_id)?
            .unwrap_or_else(|| DeviceRecord {
                device_id: report.device_id.clone(),
                current_version: report.current_version.clone(),
                last_known_good_version: None,
                pending_version: None,
                update_status: UpdateState::Idle,
                last_report_at: now,
            });
        apply_report(&mut device, &report);
        device.last_report_at = now;

        let session = UpdateSession {
            session_id: report.session_id,
            device_id: report.device_id.clone(),
            target_version: report.target_version.clone(),
            package_hash: report
                .package_hash
                .or_else(|| existing.as_ref().and_then(|s| s.package_hash)),
            package_kind: report
                .package_kind
                .or_else(|| existing.as_ref().and_then(|s| s.package_kind)),
            started_at: existing.as_ref().map_or(now, |s| s.started_at),
            updated_at: now,
            state: report.state,
            outcome: report.outcome,
            failure_reason: report.reason,
        };
        self.registry.record_report(&device, &session)?;

        if session.is_terminal() {
            info!(
                device_id = %session.device_id,
                session_id = %session.session_id,
                target = %session.target_version,
                outcome = %session.outcome,
                reason = ?session.failure_reason,
                "Session finished"
            );
        } else {
            debug!(
                device_id = %session.device_id,
                session_id = %session.session_id,
                state = %session.state,
                "Session progress"
            );
        }
        Ok(ReportAck {
            session,
            replayed: false,
        })
    }

    /// A device record.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the device has never reported.
    pub fn device(&self, device_id: &str) -> Result<DeviceRecord> {
        self.registry
            .device(device_id)?
            .ok_or_else(|| Error::not_found(format!("device '{device_id}'")))
    }

    /// A session.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the session is unknown.
    pub fn session(&self, session_id: &Uuid) -> Result<UpdateSession> {
        self.registry
            .session(session_id)?
            .ok_or_else(|| Error::not_found(format!("session {session_id}")))
    }

    /// Releases of a channel, newest first.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelUnknown`] if the channel does not exist.
    pub fn releases(&self, channel: &str) -> Result<Vec<Release>> {
        self.registry.releases(channel)
    }
}

/// Fold a report into the device record.
fn apply_report(device: &mut DeviceRecord, report: &Report) {
    match report.outcome {
        SessionOutcome::InProgress => {
            device.current_version = report.current_version.clone();
            device.pending_version = Some(report.target_version.clone());
            device.update_status = report.state;
        }
        SessionOutcome::Success => {
            device.current_version = report.target_version.clone();
            device.last_known_good_version = Some(report.target_version.clone());
            device.pending_version = None;
            device.update_status = UpdateState::Active;
        }
        SessionOutcome::RolledBack => {
            device.current_version = report.current_version.clone();
            device.pending_version = None;
            device.update_status = UpdateState::Active;
        }
        SessionOutcome::Failed => {
            device.current_version = report.current_version.clone();
            device.pending_version = None;
            device.update_status = UpdateState::Failed;
        }
    }
    if let Some(lkg) = &report.last_known_good_version {
        if report.outcome != SessionOutcome::Success {
            device.last_known_good_version = Some(lkg.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PackageKind, ReasonCode};
    use crate::store::MemoryPackageStore;

    fn service() -> UpdateService {
        UpdateService::new(
            Arc::new(Registry::in_memory().unwrap()),
            Arc::new(MemoryPackageStore::new()),
            4,
            1024,
        )
    }

    fn report(session_id: Uuid, state: UpdateState, outcome: SessionOutcome) -> Report {
        let reason = match outcome {
            SessionOutcome::Failed | SessionOutcome::RolledBack => {
                Some(ReasonCode::ConfirmationTimeout)
            }
            _ => None,
        };
        let current = if outcome == SessionOutcome::Success {
            Version::new(1, 2, 0)
        } else {
            Version::new(1, 0, 0)
        };
        Report {
            session_id,
            device_id: "dev-1".to_string(),
            target_version: Version::new(1, 2, 0),
            package_hash: Some(ContentHash::of(b"pkg")),
            package_kind: Some(PackageKind::Delta),
            state,
            outcome,
            reason,
            current_version: current,
            last_known_good_version: Some(Version::new(1, 0, 0)),
        }
    }

    #[tokio::test]
    async fn test_progress_sets_pending() {
        let service = service();
        let session_id = Uuid::new_v4();
        let ack = service
            .report(report(
                session_id,
                UpdateState::Downloading,
                SessionOutcome::InProgress,
            ))
            .await
            .unwrap();
        assert!(!ack.replayed);

        let device = service.device("dev-1").unwrap();
        assert_eq!(device.pending_version, Some(Version::new(1, 2, 0)));
        assert_eq!(device.update_status, UpdateState::Downloading);
        assert_eq!(device.current_version, Version::new(1, 0, 0));
    }

    #[tokio::test]
    async fn test_success_advances_versions() {
        let service = service();
        let session_id = Uuid::new_v4();
        service
            .report(report(session_id, UpdateState::Active, SessionOutcome::Success))
            .await
            .unwrap();

        let device = service.device("dev-1").unwrap();
        assert_eq!(device.current_version, Version::new(1, 2, 0));
        assert_eq!(device.last_known_good_version, Some(Version::new(1, 2, 0)));
        assert_eq!(device.pending_version, None);
        assert_eq!(device.update_status, UpdateState::Active);
    }

    #[tokio::test]
    async fn test_terminal_replay_is_ignored() {
        let service = service();
        let session_id = Uuid::new_v4();
        let terminal = report(session_id, UpdateState::Active, SessionOutcome::RolledBack);

        let first = service.report(terminal.clone()).await.unwrap();
        let device_before = service.device("dev-1").unwrap();

        let second = service.report(terminal).await.unwrap();
        assert!(second.replayed);
        assert_eq!(second.session, first.session);
        assert_eq!(service.device("dev-1").unwrap(), device_before);

        // A late progress report for the finished session changes nothing either.
        let late = service
            .report(report(
                session_id,
                UpdateState::Downloading,
                SessionOutcome::InProgress,
            ))
            .await
            .unwrap();
        assert!(late.replayed);
        assert_eq!(service.device("dev-1").unwrap(), device_before);
    }

    #[tokio::test]
    async fn test_session_keeps_start_time() {
        let service = service();
        let session_id = Uuid::new_v4();
        let first = service
            .report(report(
                session_id,
                UpdateState::Downloading,
                SessionOutcome::InProgress,
            ))
            .await
            .unwrap();
        let second = service
            .report(report(session_id, UpdateState::Active, SessionOutcome::Success))
            .await
            .unwrap();
        assert_eq!(first.session.started_at, second.session.started_at);
        assert_eq!(second.session.outcome, SessionOutcome::Success);
    }

    #[tokio::test]
    async fn test_session_cannot_move_devices() {
        let service = service();
        let session_id = Uuid::new_v4();
        service
            .report(report(
                session_id,
                UpdateState::Downloading,
                SessionOutcome::InProgress,
            ))
            .await
            .unwrap();

        let mut hijack = report(session_id, UpdateState::Active, SessionOutcome::Success);
        hijack.device_id = "dev-2".to_string();
        assert!(matches!(
            service.report(hijack).await.unwrap_err(),
            Error::Validation(_)
        ));
    }

    #[tokio::test]
    async fn test_invalid_report_rejected() {
        let service = service();
        let mut bad = report(Uuid::new_v4(), UpdateState::Failed, SessionOutcome::Failed);
        bad.reason = None;
        assert!(service.report(bad).await.is_err());
        assert!(matches!(
            service.device("dev-1").unwrap_err(),
            Error::NotFound { .. }
        ));
    }

    #[test]
    fn test_package_range_is_capped() {
        let service = service();
        let hash = service.store().put_bytes(&vec![7u8; 4096]).unwrap();
        assert_eq!(service.package_range(&hash, 0, 1_000_000).unwrap().len(), 1024);
        assert_eq!(service.package_size(&hash).unwrap(), 4096);
    }
}
