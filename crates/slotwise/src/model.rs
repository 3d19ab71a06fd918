//! Core data model for slotwise.
//!
//! Server-side records (releases, packages, device records, sessions) and the
//! report message the agent sends when its update state changes.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use semver::Version;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::hash::ContentHash;

/// Whether a package is a complete image or a patch against an older one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PackageKind {
    /// A complete image of the target version.
    Full,
    /// A binary patch from `source_version` to the target version.
    Delta,
}

impl std::fmt::Display for PackageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "full"),
            Self::Delta => write!(f, "delta"),
        }
    }
}

impl std::str::FromStr for PackageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(Self::Full),
            "delta" => Ok(Self::Delta),
            other => Err(Error::validation(format!("unknown package kind: {other}"))),
        }
    }
}

/// A published, signed update offering on a channel.
///
/// Releases are never mutated after publishing; `available` only ever goes
/// from `true` to `false` when a release is retired.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    /// Channel the release was published to.
    pub channel: String,
    /// Release version.
    pub version: Version,
    /// BLAKE3 hash of the canonical manifest bytes.
    pub manifest_hash: ContentHash,
    /// Hex Ed25519 signature over the canonical manifest bytes.
    pub signature: String,
    /// Oldest version deltas were generated from, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minimum_source_version: Option<Version>,
    /// Free-form release notes.
    pub changelog: String,
    /// When the release was published.
    pub created_at: DateTime<Utc>,
    /// False once the release has been retired.
    pub available: bool,
}

/// A concrete artifact implementing a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// Full image or delta patch.
    pub kind: PackageKind,
    /// Version the patch applies to; `None` for full images.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_version: Option<Version>,
    /// Version this package produces.
    pub target_version: Version,
    /// Hash of the package bytes as stored and transferred.
    pub content_hash: ContentHash,
    /// Hash of the image the package produces (equals `content_hash` for full images).
    pub target_hash: ContentHash,
    /// Size of the package bytes.
    pub size_bytes: u64,
    /// Hex Ed25519 signature over the package content hash.
    pub signature: String,
}

impl Package {
    /// True when this is a delta from `version`.
    #[must_use]
    pub fn is_delta_from(&self, version: &Version) -> bool {
        self.kind == PackageKind::Delta && self.source_version.as_ref() == Some(version)
    }
}

/// Update state of a device, shared by the agent state machine and the
/// server-side device record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    /// Waiting for a trigger.
    Idle,
    /// Asking the server for the best update.
    Checking,
    /// Transferring package bytes.
    Downloading,
    /// Checking hashes and signatures.
    Verifying,
    /// Verified image written to the inactive slot.
    Staged,
    /// Swapping the active slot.
    Applying,
    /// New slot active, waiting for a health signal.
    Confirming,
    /// Reverting to the last known good slot.
    RollingBack,
    /// Running a confirmed version.
    Active,
    /// Session ended before anything touched the running system.
    Failed,
}

impl UpdateState {
    /// True once a session may no longer be cancelled.
    #[must_use]
    pub fn is_past_point_of_no_return(&self) -> bool {
        matches!(self, Self::Applying | Self::Confirming | Self::RollingBack)
    }
}

impl std::fmt::Display for UpdateState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Checking => "checking",
            Self::Downloading => "downloading",
            Self::Verifying => "verifying",
            Self::Staged => "staged",
            Self::Applying => "applying",
            Self::Confirming => "confirming",
            Self::RollingBack => "rolling_back",
            Self::Active => "active",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for UpdateState {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "idle" => Self::Idle,
            "checking" => Self::Checking,
            "downloading" => Self::Downloading,
            "verifying" => Self::Verifying,
            "staged" => Self::Staged,
            "applying" => Self::Applying,
            "confirming" => Self::Confirming,
            "rolling_back" => Self::RollingBack,
            "active" => Self::Active,
            "failed" => Self::Failed,
            other => return Err(Error::validation(format!("unknown update state: {other}"))),
        })
    }
}

/// Outcome of an update session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionOutcome {
    /// The session has not reached a terminal state.
    InProgress,
    /// The new version was confirmed healthy.
    Success,
    /// The session stopped before touching the running system.
    Failed,
    /// The new version was activated and then reverted.
    RolledBack,
}

impl SessionOutcome {
    /// Whether this outcome ends the session.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Success => write!(f, "success"),
            Self::Failed => write!(f, "failed"),
            Self::RolledBack => write!(f, "rolled_back"),
        }
    }
}

impl std::str::FromStr for SessionOutcome {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "in_progress" => Ok(Self::InProgress),
            "success" => Ok(Self::Success),
            "failed" => Ok(Self::Failed),
            "rolled_back" => Ok(Self::RolledBack),
            other => Err(Error::validation(format!("unknown outcome: {other}"))),
        }
    }
}

/// Machine-readable failure reason attached to terminal reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    /// The device's channel does not exist.
    ChannelUnknown,
    /// Hash mismatch on stored, received or reconstructed content.
    IntegrityViolation,
    /// Manifest signature did not verify.
    SignatureInvalid,
    /// Delta could not be applied to the local base.
    PatchIncompatible,
    /// Network retries exhausted.
    NetworkFailure,
    /// The server could not supply the resolved package.
    PackageUnavailable,
    /// Package larger than local storage allows.
    InsufficientStorage,
    /// Slot swap or activation failed.
    ApplyFailure,
    /// No health signal within the confirmation window.
    ConfirmationTimeout,
    /// The application reported itself unhealthy.
    HealthCheckFailed,
    /// Cancelled by a user or policy.
    Cancelled,
}

impl std::fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::ChannelUnknown => "channel_unknown",
            Self::IntegrityViolation => "integrity_violation",
            Self::SignatureInvalid => "signature_invalid",
            Self::PatchIncompatible => "patch_incompatible",
            Self::NetworkFailure => "network_failure",
            Self::PackageUnavailable => "package_unavailable",
            Self::InsufficientStorage => "insufficient_storage",
            Self::ApplyFailure => "apply_failure",
            Self::ConfirmationTimeout => "confirmation_timeout",
            Self::HealthCheckFailed => "health_check_failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

impl std::str::FromStr for ReasonCode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "channel_unknown" => Self::ChannelUnknown,
            "integrity_violation" => Self::IntegrityViolation,
            "signature_invalid" => Self::SignatureInvalid,
            "patch_incompatible" => Self::PatchIncompatible,
            "network_failure" => Self::NetworkFailure,
            "package_unavailable" => Self::PackageUnavailable,
            "insufficient_storage" => Self::InsufficientStorage,
            "apply_failure" => Self::ApplyFailure,
            "confirmation_timeout" => Self::ConfirmationTimeout,
            "health_check_failed" => Self::HealthCheckFailed,
            "cancelled" => Self::Cancelled,
            other => return Err(Error::validation(format!("unknown reason code: {other}"))),
        })
    }
}

/// Server-side view of one device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    /// Device identifier.
    pub device_id: String,
    /// Version the device is running.
    pub current_version: Version,
    /// Most recent version confirmed healthy.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_known_good_version: Option<Version>,
    /// Version of an in-flight session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pending_version: Option<Version>,
    /// Last reported update state.
    pub update_status: UpdateState,
    /// When the device last reported.
    pub last_report_at: DateTime<Utc>,
}

/// A single check-to-apply attempt, kept for audit and idempotent replay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateSession {
    /// Session identifier chosen by the agent.
    pub session_id: Uuid,
    /// Device running the session.
    pub device_id: String,
    /// Version the session is installing.
    pub target_version: Version,
    /// Package downloaded for the session.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_hash: Option<ContentHash>,
    /// Kind of that package.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub package_kind: Option<PackageKind>,
    /// When the session was first reported.
    pub started_at: DateTime<Utc>,
    /// When the session was last updated.
    pub updated_at: DateTime<Utc>,
    /// Last reported state.
    pub state: UpdateState,
    /// Session outcome.
    pub outcome: SessionOutcome,
    /// Failure reason for failed and rolled back sessions.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<ReasonCode>,
}

impl UpdateSession {
    /// Whether the session has ended.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.outcome.is_terminal()
    }
}

/// A state report from an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Report {
    /// Session identifier; replays with the same id are idempotent.
    pub session_id: Uuid,
    /// Reporting device.
    pub device_id: String,
    /// Version the session targets.
    pub target_version: Version,
    /// Package used, once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_hash: Option<ContentHash>,
    /// Kind of the package used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub package_kind: Option<PackageKind>,
    /// Agent state at the time of the report.
    pub state: UpdateState,
    /// Outcome; `in_progress` for progress reports.
    pub outcome: SessionOutcome,
    /// Failure reason, for failed and rolled back outcomes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<ReasonCode>,
    /// Version the device is running after this transition.
    pub current_version: Version,
    /// Device's last known good version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_good_version: Option<Version>,
}

impl Report {
    /// Validate identifiers and outcome/reason consistency.
    ///
    /// # Errors
    ///
    /// Returns a validation error describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        validate_name("device id", &self.device_id)?;
        match self.outcome {
            SessionOutcome::Failed | SessionOutcome::RolledBack if self.reason.is_none() => Err(
                Error::validation(format!("{} report requires a reason", self.outcome)),
            ),
            SessionOutcome::Success if self.reason.is_some() => {
                Err(Error::validation("success report must not carry a reason"))
            }
            _ => Ok(()),
        }
    }
}

fn name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    // Constant pattern; compilation cannot fail at runtime.
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").expect("identifier pattern compiles")
    })
}

/// Check a channel name or device id.
///
/// # Errors
///
/// Returns a validation error if `value` is empty, too long, or contains
/// characters outside `[A-Za-z0-9._-]`.
pub fn validate_name(kind: &str, value: &str) -> Result<()> {
    if name_pattern().is_match(value) {
        Ok(())
    } else {
        Err(Error::validation(format!("invalid {kind}: '{value}'")))
    }
}
