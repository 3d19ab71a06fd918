//! Publisher-side operations: publishing a release and auditing the catalog.
//!
//! Publishing stores the full image, generates deltas from earlier releases
//! in the channel, builds and signs the manifest, signs each package, and
//! inserts everything into the registry in one transaction. Patch generation
//! happens here and only here; devices never diff.

use chrono::Utc;
use semver::Version;
use tracing::{debug, info, warn};

use crate::delta;
use crate::error::{Error, Result};
use crate::hash::ContentHash;
use crate::manifest::{Manifest, ManifestEntry, MANIFEST_FORMAT};
use crate::model::{validate_name, Package, PackageKind, Release};
use crate::registry::{ReleaseEntry, Registry};
use crate::store::PackageStore;
use crate::trust::{ReleaseSigner, TrustedKeys};

/// Input to [`publish`].
#[derive(Debug, Clone)]
pub struct PublishRequest {
    /// Target channel; created if it does not exist.
    pub channel: String,
    /// New version; must not already exist in the channel.
    pub version: Version,
    /// Full image bytes.
    pub image: Vec<u8>,
    /// Release notes.
    pub changelog: String,
    /// Oldest release to generate deltas from; `None` means every earlier one.
    pub minimum_source_version: Option<Version>,
}

/// Publish a release.
///
/// # Errors
///
/// Returns [`Error::ReleaseExists`] if the version is already published in
/// the channel, a validation error for a bad channel name, or a store or
/// storage error.
pub fn publish(
    registry: &Registry,
    store: &dyn PackageStore,
    signer: &ReleaseSigner,
    request: PublishRequest,
) -> Result<ReleaseEntry> {
    let PublishRequest {
        channel,
        version,
        image,
        changelog,
        minimum_source_version,
    } = request;
    validate_name("channel", &channel)?;

    let snapshot = registry.snapshot()?;
    let earlier = snapshot.releases(&channel).unwrap_or_default();
    if earlier.iter().any(|e| e.release.version == version) {
        return Err(Error::ReleaseExists {
            channel,
            version: version.to_string(),
        });
    }

    let image_hash = store.put_bytes(&image)?;
    let mut packages = vec![Package {
        kind: PackageKind::Full,
        source_version: None,
        target_version: version.clone(),
        content_hash: image_hash,
        target_hash: image_hash,
        size_bytes: image.len() as u64,
        signature: signer.sign_package(&image_hash),
    }];

    let mut sources: Vec<_> = earlier
        .iter()
        .filter(|e| e.release.available && e.release.version < version)
        .filter(|e| {
            minimum_source_version
                .as_ref()
                .map_or(true, |minimum| e.release.version >= *minimum)
        })
        .collect();
    sources.sort_by(|a, b| a.release.version.cmp(&b.release.version));

    for source in sources {
        let source_version = &source.release.version;
        let Some(base_package) = source.full_package() else {
            continue;
        };
        if !store.contains(&base_package.content_hash)? {
            warn!(
                channel = %channel,
                source = %source_version,
                "Full image of source release not in store; skipping delta"
            );
            continue;
        }
        let base = store.get(&base_package.content_hash)?;
        let patch = delta::diff(&base, &image).encode();
        if patch.len() >= image.len() {
            debug!(source = %source_version, "Delta not smaller than full image; skipping");
            continue;
        }

        let patch_hash = store.put_bytes(&patch)?;
        debug!(
            source = %source_version,
            target = %version,
            size = patch.len(),
            "Generated delta"
        );
        packages.push(Package {
            kind: PackageKind::Delta,
            source_version: Some(source_version.clone()),
            target_version: version.clone(),
            content_hash: patch_hash,
            target_hash: image_hash,
            size_bytes: patch.len() as u64,
            signature: signer.sign_package(&patch_hash),
        });
    }

    let manifest = Manifest {
        format: MANIFEST_FORMAT,
        channel: channel.clone(),
        version: version.clone(),
        minimum_source_version: minimum_source_version.clone(),
        changelog: changelog.clone(),
        created_at: Utc::now(),
        packages: packages.iter().map(ManifestEntry::from).collect(),
    };
    let manifest_bytes = manifest.canonical_bytes()?;
    let manifest_json = String::from_utf8(manifest_bytes)
        .map_err(|e| Error::internal(format!("manifest is not UTF-8: {e}")))?;

    let release = Release {
        channel,
        version,
        manifest_hash: ContentHash::of(manifest_json.as_bytes()),
        signature: signer.sign(manifest_json.as_bytes()),
        minimum_source_version,
        changelog,
        created_at: manifest.created_at,
        available: true,
    };
    let entry = ReleaseEntry::new(release, manifest_json, packages);
    registry.insert_release(&entry)?;

    info!(
        channel = %entry.release.channel,
        version = %entry.release.version,
        deltas = entry.packages.len() - 1,
        "Published release"
    );
    Ok(entry)
}

/// One problem found by [`audit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditFinding {
    /// What was checked, e.g. `stable 1.2.0` or a package hash.
    pub subject: String,
    /// What is wrong with it.
    pub problem: String,
}

/// Result of [`audit`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuditReport {
    /// Releases checked.
    pub releases: usize,
    /// Packages checked.
    pub packages: usize,
    /// Problems found.
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    /// Whether the audit found nothing wrong.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.findings.is_empty()
    }

    fn record(&mut self, subject: impl Into<String>, err: &Error) {
        self.findings.push(AuditFinding {
            subject: subject.into(),
            problem: err.to_string(),
        });
    }
}

/// Re-verify every release signature, manifest hash, package signature and
/// stored package against `trusted`.
///
/// # Errors
///
/// Returns an error only if the catalog cannot be read; individual problems
/// are collected in the report.
pub fn audit(
    registry: &Registry,
    store: &dyn PackageStore,
    trusted: &TrustedKeys,
) -> Result<AuditReport> {
    let mut report = AuditReport::default();
    for entry in registry.entries()? {
        report.releases += 1;
        let subject = format!("{} {}", entry.release.channel, entry.release.version);
        let manifest_bytes = entry.manifest.as_bytes();

        if let Err(err) = entry.release.manifest_hash.verify(manifest_bytes) {
            report.record(&subject, &err);
        }
        let manifest = match trusted.verify_manifest(manifest_bytes, &entry.release.signature) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                report.record(&subject, &err);
                None
            }
        };

        for package in &entry.packages {
            report.packages += 1;
            let subject = format!("{subject} {} {}", package.kind, package.content_hash.short());
            let checks = [
                manifest
                    .as_ref()
                    .map_or(Ok(()), |m| m.check_package(package)),
                trusted.verify_package(&package.content_hash, &package.signature),
                store.get(&package.content_hash).map(|_| ()),
            ];
            for err in checks.iter().filter_map(|c| c.as_ref().err()) {
                report.record(&subject, err);
            }
        }
    }

    if report.is_clean() {
        info!(
            releases = report.releases,
            packages = report.packages,
            "Audit clean"
        );
    } else {
        warn!(findings = report.findings.len(), "Audit found problems");
    }
    Ok(report)
}
