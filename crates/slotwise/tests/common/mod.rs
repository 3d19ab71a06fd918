//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use semver::Version;
use slotwise::agent::{
    Agent, AgentOptions, Backoff, LocalTransport, NoopActivator, UpdateTransport,
};
use slotwise::delta;
use slotwise::manifest::{Manifest, ManifestEntry, MANIFEST_FORMAT};
use slotwise::model::{Package, PackageKind, Release};
use slotwise::publish::{publish, PublishRequest};
use slotwise::registry::{ReleaseEntry, Registry};
use slotwise::server::UpdateService;
use slotwise::store::{MemoryPackageStore, PackageStore};
use slotwise::trust::ReleaseSigner;
use slotwise::ContentHash;

pub const DEVICE: &str = "dev-1";
pub const CHANNEL: &str = "stable";

/// Deterministic image for `version`: a shared body with a version trailer,
/// so deltas between versions are small.
pub fn image(version: &str) -> Vec<u8> {
    let mut bytes: Vec<u8> = (0..8192u32).map(|i| (i * 31 % 251) as u8).collect();
    bytes.extend_from_slice(format!("firmware {version}").as_bytes());
    bytes
}

pub fn v(version: &str) -> Version {
    Version::parse(version).unwrap()
}

/// An in-process server plus one device's data directory.
pub struct Fleet {
    pub dir: tempfile::TempDir,
    pub registry: Arc<Registry>,
    pub store: Arc<MemoryPackageStore>,
    pub signer: ReleaseSigner,
    pub service: Arc<UpdateService>,
    pub options: AgentOptions,
}

impl Fleet {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Registry::in_memory().unwrap());
        let store = Arc::new(MemoryPackageStore::new());
        let signer = ReleaseSigner::generate();
        let service = Arc::new(UpdateService::new(
            Arc::clone(&registry),
            Arc::clone(&store) as Arc<dyn PackageStore>,
            8,
            1 << 20,
        ));
        let options = AgentOptions {
            device_id: DEVICE.to_string(),
            channel: CHANNEL.to_string(),
            data_dir: dir.path().to_path_buf(),
            trusted_keys: signer.trusted_keys(),
            download_chunk_bytes: 2048,
            backoff: Backoff {
                max_attempts: 3,
                base: Duration::from_millis(1),
                max: Duration::from_millis(4),
            },
            max_verify_attempts: 2,
            confirmation_window: Duration::from_secs(30),
            max_package_bytes: 1 << 20,
            auto_apply: true,
        };
        Self {
            dir,
            registry,
            store,
            signer,
            service,
            options,
        }
    }

    /// Fleet whose device is provisioned at 1.0.0, which is also published.
    pub fn at_v1() -> Self {
        let fleet = Self::new();
        fleet.publish("1.0.0");
        Agent::provision(&fleet.options, v("1.0.0"), &image("1.0.0")).unwrap();
        fleet
    }

    pub fn publish(&self, version: &str) -> ReleaseEntry {
        publish(
            &self.registry,
            self.store.as_ref(),
            &self.signer,
            PublishRequest {
                channel: CHANNEL.to_string(),
                version: v(version),
                image: image(version),
                changelog: format!("release {version}"),
                minimum_source_version: None,
            },
        )
        .unwrap()
    }

    /// Publish without deltas, so only the full image is offered.
    pub fn publish_full_only(&self, version: &str) -> ReleaseEntry {
        publish(
            &self.registry,
            self.store.as_ref(),
            &self.signer,
            PublishRequest {
                channel: CHANNEL.to_string(),
                version: v(version),
                image: image(version),
                changelog: format!("release {version}"),
                minimum_source_version: Some(v(version)),
            },
        )
        .unwrap()
    }

    /// Publish a correctly signed release whose delta from `source` declares
    /// the wrong target hash.
    pub fn publish_bad_delta(&self, source: &str, version: &str) {
        let target = image(version);
        let target_hash = self.store.put_bytes(&target).unwrap();
        let patch = delta::diff(&image(source), &target).encode();
        let patch_hash = self.store.put_bytes(&patch).unwrap();

        let packages = vec![
            Package {
                kind: PackageKind::Full,
                source_version: None,
                target_version: v(version),
                content_hash: target_hash,
                target_hash,
                size_bytes: target.len() as u64,
                signature: self.signer.sign_package(&target_hash),
            },
            Package {
                kind: PackageKind::Delta,
                source_version: Some(v(source)),
                target_version: v(version),
                content_hash: patch_hash,
                target_hash: ContentHash::of(b"not the reconstructed image"),
                size_bytes: patch.len() as u64,
                signature: self.signer.sign_package(&patch_hash),
            },
        ];
        let manifest = Manifest {
            format: MANIFEST_FORMAT,
            channel: CHANNEL.to_string(),
            version: v(version),
            minimum_source_version: None,
            changelog: String::new(),
            created_at: chrono::Utc::now(),
            packages: packages.iter().map(ManifestEntry::from).collect(),
        };
        let manifest_json = String::from_utf8(manifest.canonical_bytes().unwrap()).unwrap();
        let release = Release {
            channel: CHANNEL.to_string(),
            version: v(version),
            manifest_hash: ContentHash::of(manifest_json.as_bytes()),
            signature: self.signer.sign(manifest_json.as_bytes()),
            minimum_source_version: None,
            changelog: String::new(),
            created_at: manifest.created_at,
            available: true,
        };
        self.registry
            .insert_release(&ReleaseEntry::new(release, manifest_json, packages))
            .unwrap();
    }

    pub fn local_transport(&self) -> Arc<LocalTransport> {
        Arc::new(LocalTransport::new(Arc::clone(&self.service)))
    }

    pub fn agent(&self) -> Agent {
        self.agent_with(self.local_transport())
    }

    pub fn agent_with(&self, transport: Arc<dyn UpdateTransport>) -> Agent {
        Agent::open(self.options.clone(), transport, Arc::new(NoopActivator)).unwrap()
    }
}
