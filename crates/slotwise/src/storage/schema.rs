//! `SQLite` schema for the update server's registry and device state.
//!
//! Versions are stored as their semver string form; ordering is done in Rust
//! after loading, never by SQL string comparison.

/// Named update tracks.
pub const CREATE_CHANNELS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS channels (
    name TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
)
";

/// Releases. Rows are never deleted; retiring clears `available`.
pub const CREATE_RELEASES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS releases (
    channel TEXT NOT NULL REFERENCES channels(name),
    version TEXT NOT NULL,
    manifest TEXT NOT NULL,
    manifest_hash TEXT NOT NULL,
    signature TEXT NOT NULL,
    minimum_source_version TEXT,
    changelog TEXT NOT NULL,
    created_at TEXT NOT NULL,
    available INTEGER NOT NULL DEFAULT 1,
    PRIMARY KEY (channel, version)
)
";

/// Packages implementing a release.
pub const CREATE_PACKAGES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS packages (
    channel TEXT NOT NULL,
    target_version TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    kind TEXT NOT NULL,
    source_version TEXT,
    target_hash TEXT NOT NULL,
    size_bytes INTEGER NOT NULL,
    signature TEXT NOT NULL,
    PRIMARY KEY (channel, target_version, content_hash),
    FOREIGN KEY (channel, target_version) REFERENCES releases(channel, version)
)
";

/// Lookup of packages by content hash, used by the audit.
pub const CREATE_PACKAGE_HASH_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_packages_hash ON packages(content_hash)
";

/// One row per device.
pub const CREATE_DEVICES_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS devices (
    device_id TEXT PRIMARY KEY,
    current_version TEXT NOT NULL,
    last_known_good_version TEXT,
    pending_version TEXT,
    update_status TEXT NOT NULL,
    last_report_at TEXT NOT NULL
)
";

/// Update sessions keyed by the agent-chosen session id.
pub const CREATE_SESSIONS_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS sessions (
    session_id TEXT PRIMARY KEY,
    device_id TEXT NOT NULL,
    target_version TEXT NOT NULL,
    package_hash TEXT,
    package_kind TEXT,
    started_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    state TEXT NOT NULL,
    outcome TEXT NOT NULL,
    failure_reason TEXT
)
";

/// Session history per device. Added by migration 2.
pub const CREATE_SESSION_DEVICE_INDEX: &str = r"
CREATE INDEX IF NOT EXISTS idx_sessions_device ON sessions(device_id, started_at DESC)
";

/// Key-value metadata (schema version).
pub const CREATE_METADATA_TABLE: &str = r"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
";

/// Base (version 1) schema creation statements in order.
pub const SCHEMA_STATEMENTS: &[&str] = &[
    CREATE_CHANNELS_TABLE,
    CREATE_RELEASES_TABLE,
    CREATE_PACKAGES_TABLE,
    CREATE_PACKAGE_HASH_INDEX,
    CREATE_DEVICES_TABLE,
    CREATE_SESSIONS_TABLE,
    CREATE_METADATA_TABLE,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_not_empty() {
        assert!(!SCHEMA_STATEMENTS.is_empty());
        for stmt in SCHEMA_STATEMENTS {
            assert!(!stmt.trim().is_empty());
        }
    }

    #[test]
    fn test_releases_keyed_by_channel_and_version() {
        assert!(CREATE_RELEASES_TABLE.contains("PRIMARY KEY (channel, version)"));
        assert!(CREATE_RELEASES_TABLE.contains("available INTEGER NOT NULL"));
    }

    #[test]
    fn test_sessions_keyed_by_session_id() {
        assert!(CREATE_SESSIONS_TABLE.contains("session_id TEXT PRIMARY KEY"));
    }
}
