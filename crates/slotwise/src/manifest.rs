//! Release manifests.
//!
//! A manifest binds a release's channel, version and prerequisites to the
//! content hashes of every package implementing it. The release signature
//! covers the manifest's canonical bytes, so once the manifest verifies, each
//! package only needs a hash check.
//!
//! The canonical form is the compact `serde_json` encoding of [`Manifest`];
//! field order is fixed by the struct and there are no maps, so encoding the
//! same value always yields the same bytes.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::model::{Package, PackageKind};

/// Current manifest format.
pub const MANIFEST_FORMAT: u32 = 1;

/// Signed description of a release.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    /// Format version, currently [`MANIFEST_FORMAT`].
    pub format: u32,
    /// Channel the release belongs to.
    pub channel: String,
    /// Release version.
    pub version: Version,
    /// Oldest version deltas were generated from.
    pub minimum_source_version: Option<Version>,
    /// Release notes.
    pub changelog: String,
    /// Publish time.
    pub created_at: DateTime<Utc>,
    /// Packages, full image first, then deltas by ascending source version.
    pub packages: Vec<ManifestEntry>,
}

/// One package as recorded in a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Full image or delta.
    pub kind: PackageKind,
    /// Delta source version.
    pub source_version: Option<Version>,
    /// Version produced.
    pub target_version: Version,
    /// Hash of the package bytes.
    pub content_hash: ContentHash,
    /// Hash of the image produced.
    pub target_hash: ContentHash,
    /// Size of the package bytes.
    pub size_bytes: u64,
}

impl From<&Package> for ManifestEntry {
    fn from(package: &Package) -> Self {
        Self {
            kind: package.kind,
            source_version: package.source_version.clone(),
            target_version: package.target_version.clone(),
            content_hash: package.content_hash,
            target_hash: package.target_hash,
            size_bytes: package.size_bytes,
        }
    }
}

impl Manifest {
    /// Canonical bytes; the signature and manifest hash are computed over these.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Parse manifest bytes, insisting they are in canonical form.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the bytes do not parse, are not
    /// canonical, or use an unknown format.
    pub fn from_canonical(bytes: &[u8]) -> Result<Self> {
        let manifest: Self = serde_json::from_slice(bytes)
            .map_err(|e| Error::validation(format!("unparseable manifest: {e}")))?;
        if manifest.format != MANIFEST_FORMAT {
            return Err(Error::validation(format!(
                "unsupported manifest format {}",
                manifest.format
            )));
        }
        if manifest.canonical_bytes()? != bytes {
            return Err(Error::validation("manifest is not in canonical form"));
        }
        Ok(manifest)
    }

    /// The full-image entry.
    #[must_use]
    pub fn full_entry(&self) -> Option<&ManifestEntry> {
        self.packages.iter().find(|p| p.kind == PackageKind::Full)
    }

    /// The entry for a package hash.
    #[must_use]
    pub fn entry(&self, content_hash: &ContentHash) -> Option<&ManifestEntry> {
        self.packages
            .iter()
            .find(|p| p.content_hash == *content_hash)
    }

    /// Confirm that a package descriptor is exactly the one this manifest lists.
    ///
    /// # Errors
    ///
    /// Returns [`Error::SignatureInvalid`] if the package is absent from the
    /// manifest or any of its fields disagree with the signed entry.
    pub fn check_package(&self, package: &Package) -> Result<()> {
        let entry = self.entry(&package.content_hash).ok_or_else(|| {
            Error::signature(format!(
                "package {} is not listed in the signed manifest",
                package.content_hash
            ))
        })?;
        if ManifestEntry::from(package) != *entry {
            return Err(Error::signature(format!(
                "package {} does not match its manifest entry",
                package.content_hash
            )));
        }
        if entry.target_version != self.version {
            return Err(Error::signature("package targets a different version"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Manifest {
        let image = ContentHash::of(b"image");
        Manifest {
            format: MANIFEST_FORMAT,
            channel: "stable".into(),
            version: Version::new(1, 2, 0),
            minimum_source_version: Some(Version::new(1, 0, 0)),
            changelog: "fixes".into(),
            created_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            packages: vec![
                ManifestEntry {
                    kind: PackageKind::Full,
                    source_version: None,
                    target_version: Version::new(1, 2, 0),
                    content_hash: image,
                    target_hash: image,
                    size_bytes: 5,
                },
                ManifestEntry {
                    kind: PackageKind::Delta,
                    source_version: Some(Version::new(1, 0, 0)),
                    target_version: Version::new(1, 2, 0),
                    content_hash: ContentHash::of(b"patch"),
                    target_hash: image,
                    size_bytes: 5,
                },
            ],
        }
    }

    fn package_for(entry: &ManifestEntry) -> Package {
        Package {
            kind: entry.kind,
            source_version: entry.source_version.clone(),
            target_version: entry.target_version.clone(),
            content_hash: entry.content_hash,
            target_hash: entry.target_hash,
            size_bytes: entry.size_bytes,
            signature: String::new(),
        }
    }

    #[test]
    fn test_canonical_bytes_are_stable() {
        let manifest = sample();
        assert_eq!(
            manifest.canonical_bytes().unwrap(),
            manifest.clone().canonical_bytes().unwrap()
        );
        let parsed = Manifest::from_canonical(&manifest.canonical_bytes().unwrap()).unwrap();
        assert_eq!(parsed, manifest);
    }

    #[test]
    fn test_non_canonical_bytes_rejected() {
        let manifest = sample();
        let pretty = serde_json::to_vec_pretty(&manifest).unwrap();
        assert!(Manifest::from_canonical(&pretty).is_err());
    }

    #[test]
    fn test_unknown_format_rejected() {
        let mut manifest = sample();
        manifest.format = 99;
        let bytes = manifest.canonical_bytes().unwrap();
        assert!(Manifest::from_canonical(&bytes).is_err());
    }

    #[test]
    fn test_check_package() {
        let manifest = sample();
        let delta = package_for(&manifest.packages[1]);
        assert!(manifest.check_package(&delta).is_ok());

        let mut resized = delta.clone();
        resized.size_bytes = 6;
        assert!(matches!(
            manifest.check_package(&resized).unwrap_err(),
            Error::SignatureInvalid { .. }
        ));

        let mut unknown = delta;
        unknown.content_hash = ContentHash::of(b"forged");
        assert!(manifest.check_package(&unknown).is_err());
    }

    #[test]
    fn test_full_entry() {
        let manifest = sample();
        assert_eq!(manifest.full_entry().unwrap().kind, PackageKind::Full);
    }
}
