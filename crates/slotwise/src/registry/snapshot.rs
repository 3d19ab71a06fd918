//! Immutable release snapshot and update resolution.
//!
//! Resolution is a pure function of `(channel, current_version)` over a
//! snapshot; the registry replaces the snapshot wholesale after every write.

use std::collections::HashMap;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Package, PackageKind, Release};

/// A release together with its packages and canonical manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseEntry {
    /// Release record.
    pub release: Release,
    /// Canonical manifest JSON the release signature covers.
    pub manifest: String,
    /// Packages implementing the release.
    pub packages: Vec<Package>,
}

impl ReleaseEntry {
    /// Bundle a release with its manifest and packages.
    #[must_use]
    pub fn new(release: Release, manifest: String, packages: Vec<Package>) -> Self {
        Self {
            release,
            manifest,
            packages,
        }
    }

    /// The full-image package.
    #[must_use]
    pub fn full_package(&self) -> Option<&Package> {
        self.packages.iter().find(|p| p.kind == PackageKind::Full)
    }

    /// The delta a device at `current` may use, if one exists and the
    /// release's minimum source version admits it.
    #[must_use]
    pub fn delta_from(&self, current: &Version) -> Option<&Package> {
        if let Some(minimum) = &self.release.minimum_source_version {
            if current < minimum {
                return None;
            }
        }
        self.packages.iter().find(|p| p.is_delta_from(current))
    }
}

/// The selected release and package for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedUpdate {
    /// Release to install.
    pub release: Release,
    /// Package chosen for this device.
    pub package: Package,
    /// Canonical manifest JSON, verified by the agent against the signature.
    pub manifest: String,
}

/// Outcome of resolving an update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Resolution {
    /// No eligible release is newer than the device's version.
    UpToDate,
    /// An update is available.
    #[serde(rename = "update_available")]
    Available(Box<ResolvedUpdate>),
}

impl Resolution {
    /// The resolved update, if any.
    #[must_use]
    pub fn update(&self) -> Option<&ResolvedUpdate> {
        match self {
            Self::UpToDate => None,
            Self::Available(update) => Some(update),
        }
    }
}

/// Point-in-time view of every channel and its releases.
#[derive(Debug, Clone, Default)]
pub struct ReleaseSnapshot {
    /// Releases per channel, newest version first.
    channels: HashMap<String, Vec<ReleaseEntry>>,
}

impl ReleaseSnapshot {
    /// Build a snapshot. Channels with no releases still exist.
    #[must_use]
    pub fn new(channels: impl IntoIterator<Item = String>, entries: Vec<ReleaseEntry>) -> Self {
        let mut map: HashMap<String, Vec<ReleaseEntry>> =
            channels.into_iter().map(|c| (c, Vec::new())).collect();
        for entry in entries {
            map.entry(entry.release.channel.clone())
                .or_default()
                .push(entry);
        }
        for releases in map.values_mut() {
            releases.sort_by(|a, b| b.release.version.cmp(&a.release.version));
        }
        Self { channels: map }
    }

    /// Whether `channel` exists.
    #[must_use]
    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.contains_key(channel)
    }

    /// Channel names, sorted.
    #[must_use]
    pub fn channels(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.channels.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Releases of a channel, newest first, retired ones included.
    #[must_use]
    pub fn releases(&self, channel: &str) -> Option<&[ReleaseEntry]> {
        self.channels.get(channel).map(Vec::as_slice)
    }

    /// Pick the update for a device on `channel` running `current`.
    ///
    /// The highest available release newer than `current` wins. A delta from
    /// `current` is preferred over the full image unless `force_full` is set.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelUnknown`] if the channel does not exist.
    pub fn resolve(&self, channel: &str, current: &Version, force_full: bool) -> Result<Resolution> {
        let releases = self
            .channels
            .get(channel)
            .ok_or_else(|| Error::ChannelUnknown {
                channel: channel.to_string(),
            })?;

        let Some(entry) = releases
            .iter()
            .find(|e| e.release.available && e.release.version > *current)
        else {
            return Ok(Resolution::UpToDate);
        };

        let delta = if force_full {
            None
        } else {
            entry.delta_from(current)
        };
        let package = delta.or_else(|| entry.full_package()).ok_or_else(|| {
            Error::internal(format!(
                "release {} in channel '{channel}' has no full package",
                entry.release.version
            ))
        })?;

        Ok(Resolution::Available(Box::new(ResolvedUpdate {
            release: entry.release.clone(),
            package: package.clone(),
            manifest: entry.manifest.clone(),
        })))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::ContentHash;
    use chrono::Utc;
    use proptest::prelude::*;

    fn v(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn package(kind: PackageKind, source: Option<&str>, target: &str) -> Package {
        let hash = ContentHash::of(format!("{kind} {source:?} {target}").as_bytes());
        Package {
            kind,
            source_version: source.map(v),
            target_version: v(target),
            content_hash: hash,
            target_hash: ContentHash::of(target.as_bytes()),
            size_bytes: 10,
            signature: String::new(),
        }
    }

    fn entry(channel: &str, version: &str, deltas_from: &[&str], available: bool) -> ReleaseEntry {
        let mut packages = vec![package(PackageKind::Full, None, version)];
        for source in deltas_from {
            packages.push(package(PackageKind::Delta, Some(source), version));
        }
        ReleaseEntry::new(
            Release {
                channel: channel.to_string(),
                version: v(version),
                manifest_hash: ContentHash::of(version.as_bytes()),
                signature: String::new(),
                minimum_source_version: deltas_from.iter().map(|s| v(s)).min(),
                changelog: String::new(),
                created_at: Utc::now(),
                available,
            },
            String::new(),
            packages,
        )
    }

    fn stable_snapshot() -> ReleaseSnapshot {
        ReleaseSnapshot::new(
            ["stable".to_string(), "beta".to_string()],
            vec![
                entry("stable", "1.0.0", &[], true),
                entry("stable", "1.2.0", &["1.0.0"], true),
            ],
        )
    }

    #[test]
    fn test_delta_preferred_when_source_matches() {
        let resolution = stable_snapshot()
            .resolve("stable", &v("1.0.0"), false)
            .unwrap();
        let update = resolution.update().unwrap();
        assert_eq!(update.release.version, v("1.2.0"));
        assert_eq!(update.package.kind, PackageKind::Delta);
        assert_eq!(update.package.source_version, Some(v("1.0.0")));
    }

    #[test]
    fn test_full_when_no_delta_matches() {
        let resolution = stable_snapshot()
            .resolve("stable", &v("1.1.0"), false)
            .unwrap();
        assert_eq!(resolution.update().unwrap().package.kind, PackageKind::Full);
    }

    #[test]
    fn test_force_full() {
        let resolution = stable_snapshot()
            .resolve("stable", &v("1.0.0"), true)
            .unwrap();
        assert_eq!(resolution.update().unwrap().package.kind, PackageKind::Full);
    }

    #[test]
    fn test_up_to_date() {
        let snapshot = stable_snapshot();
        assert_eq!(
            snapshot.resolve("stable", &v("1.2.0"), false).unwrap(),
            Resolution::UpToDate
        );
        assert_eq!(
            snapshot.resolve("beta", &v("0.1.0"), false).unwrap(),
            Resolution::UpToDate
        );
    }

    #[test]
    fn test_unknown_channel() {
        let err = stable_snapshot()
            .resolve("nightly", &v("1.0.0"), false)
            .unwrap_err();
        assert!(matches!(err, Error::ChannelUnknown { .. }));
    }

    #[test]
    fn test_unavailable_release_skipped() {
        let snapshot = ReleaseSnapshot::new(
            ["stable".to_string()],
            vec![
                entry("stable", "1.1.0", &[], true),
                entry("stable", "1.2.0", &[], false),
            ],
        );
        let resolution = snapshot.resolve("stable", &v("1.0.0"), false).unwrap();
        assert_eq!(resolution.update().unwrap().release.version, v("1.1.0"));
        assert_eq!(
            snapshot.resolve("stable", &v("1.1.0"), false).unwrap(),
            Resolution::UpToDate
        );
    }

    #[test]
    fn test_minimum_source_version_blocks_delta() {
        let mut release = entry("stable", "2.0.0", &["1.0.0"], true);
        release.release.minimum_source_version = Some(v("1.5.0"));
        let snapshot = ReleaseSnapshot::new(["stable".to_string()], vec![release]);
        let resolution = snapshot.resolve("stable", &v("1.0.0"), false).unwrap();
        assert_eq!(resolution.update().unwrap().package.kind, PackageKind::Full);
    }

    #[test]
    fn test_resolution_wire_format() {
        let json = serde_json::to_value(Resolution::UpToDate).unwrap();
        assert_eq!(json, serde_json::json!({"status": "up_to_date"}));

        let resolution = stable_snapshot()
            .resolve("stable", &v("1.0.0"), false)
            .unwrap();
        let json = serde_json::to_value(&resolution).unwrap();
        assert_eq!(json["status"], "update_available");
        assert_eq!(json["release"]["version"], "1.2.0");
        let parsed: Resolution = serde_json::from_value(json).unwrap();
        assert_eq!(parsed, resolution);
    }

    proptest! {
        #[test]
        fn prop_resolution_is_monotonic(
            releases in proptest::collection::vec((0u64..5, 0u64..5, any::<bool>()), 0..12),
            current in (0u64..5, 0u64..5),
        ) {
            let mut seen = std::collections::HashSet::new();
            let entries: Vec<ReleaseEntry> = releases
                .into_iter()
                .filter(|(major, minor, _)| seen.insert((*major, *minor)))
                .map(|(major, minor, available)| {
                    entry("stable", &format!("{major}.{minor}.0"), &[], available)
                })
                .collect();
            let snapshot = ReleaseSnapshot::new(["stable".to_string()], entries.clone());
            let current = Version::new(current.0, current.1, 0);

            match snapshot.resolve("stable", &current, false).unwrap() {
                Resolution::UpToDate => {
                    prop_assert!(entries
                        .iter()
                        .all(|e| !e.release.available || e.release.version <= current));
                }
                Resolution::Available(update) => {
                    prop_assert!(update.release.version > current);
                    prop_assert!(update.release.available);
                    prop_assert!(entries.iter().all(|e| !e.release.available
                        || e.release.version <= update.release.version));
                }
            }
        }
    }
}
