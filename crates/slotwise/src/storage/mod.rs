//! Storage layer for the update server.
//!
//! `SQLite`-backed persistence of channels, releases with their packages and
//! signed manifests, device records and update sessions. Resolution never
//! queries this directly; the registry loads everything into an immutable
//! snapshot after each write.

pub mod migrations;
pub mod schema;

use std::collections::HashMap;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::Utc;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use semver::Version;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::model::{DeviceRecord, Package, Release, UpdateSession};
use crate::registry::ReleaseEntry;

/// Persistent store for registry and device state.
///
/// Not `Sync`; the registry wraps it in a mutex and holds the lock for single
/// calls only.
#[derive(Debug)]
pub struct Storage {
    /// Path to the database file.
    path: PathBuf,
    /// Database connection.
    conn: Connection,
}

impl Storage {
    /// Open or create a database at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or schema initialization fails.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|source| Error::DirectoryCreate {
                    path: parent.to_path_buf(),
                    source,
                })?;
            }
        }

        debug!("Opening database at {}", path.display());
        let conn = Connection::open(&path).map_err(|source| Error::DatabaseOpen {
            path: path.clone(),
            source,
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        migrations::initialize_schema(&conn)?;

        info!("Database opened at {}", path.display());
        Ok(Self { path, conn })
    }

    /// Create an in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the in-memory database cannot be created.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|source| Error::DatabaseOpen {
            path: PathBuf::from(":memory:"),
            source,
        })?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        migrations::initialize_schema(&conn)?;

        Ok(Self {
            path: PathBuf::from(":memory:"),
            conn,
        })
    }

    /// Path to the database file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    // === Channels ===

    /// Create a channel. Returns `false` if it already existed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn create_channel(&self, name: &str) -> Result<bool> {
        let affected = self.conn.execute(
            "INSERT OR IGNORE INTO channels (name, created_at) VALUES (?1, ?2)",
            params![name, Utc::now().to_rfc3339()],
        )?;
        if affected > 0 {
            info!(channel = name, "Created channel");
        }
        Ok(affected > 0)
    }

    /// Whether a channel exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn channel_exists(&self, name: &str) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM channels WHERE name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// All channel names, sorted.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn list_channels(&self) -> Result<Vec<String>> {
        let mut stmt = self.conn.prepare("SELECT name FROM channels ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(names)
    }

    // === Releases ===

    /// Insert a release and its packages in one transaction.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelUnknown`] if the channel does not exist,
    /// [`Error::ReleaseExists`] if the version is already published there,
    /// or a database error.
    pub fn insert_release(&self, entry: &ReleaseEntry) -> Result<()> {
        let release = &entry.release;
        if !self.channel_exists(&release.channel)? {
            return Err(Error::ChannelUnknown {
                channel: release.channel.clone(),
            });
        }
        if self.release_exists(&release.channel, &release.version)? {
            return Err(Error::ReleaseExists {
                channel: release.channel.clone(),
                version: release.version.to_string(),
            });
        }

        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            r"
            INSERT INTO releases (channel, version, manifest, manifest_hash, signature,
                                  minimum_source_version, changelog, created_at, available)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ",
            params![
                release.channel,
                release.version.to_string(),
                entry.manifest,
                release.manifest_hash.to_hex(),
                release.signature,
                release.minimum_source_version.as_ref().map(ToString::to_string),
                release.changelog,
                release.created_at.to_rfc3339(),
                release.available,
            ],
        )?;
        for package in &entry.packages {
            tx.execute(
                r"
                INSERT INTO packages (channel, target_version, content_hash, kind, source_version,
                                      target_hash, size_bytes, signature)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                ",
                params![
                    release.channel,
                    package.target_version.to_string(),
                    package.content_hash.to_hex(),
                    package.kind.to_string(),
                    package.source_version.as_ref().map(ToString::to_string),
                    package.target_hash.to_hex(),
                    to_sql_size(package.size_bytes)?,
                    package.signature,
                ],
            )?;
        }
        tx.commit()?;

        debug!(
            channel = %release.channel,
            version = %release.version,
            packages = entry.packages.len(),
            "Inserted release"
        );
        Ok(())
    }

    fn release_exists(&self, channel: &str, version: &Version) -> Result<bool> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM releases WHERE channel = ?1 AND version = ?2",
            params![channel, version.to_string()],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    /// Mark a release available or unavailable. Returns `false` if it was
    /// already in that state.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the release does not exist.
    pub fn set_release_available(
        &self,
        channel: &str,
        version: &Version,
        available: bool,
    ) -> Result<bool> {
        if !self.release_exists(channel, version)? {
            return Err(Error::not_found(format!("release {version} in channel '{channel}'")));
        }
        let affected = self.conn.execute(
            "UPDATE releases SET available = ?3 WHERE channel = ?1 AND version = ?2 AND available != ?3",
            params![channel, version.to_string(), available],
        )?;
        Ok(affected > 0)
    }

    /// Load one release with its packages.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn release(&self, channel: &str, version: &Version) -> Result<Option<ReleaseEntry>> {
        let row = self
            .conn
            .query_row(
                &format!("{RELEASE_COLUMNS} WHERE channel = ?1 AND version = ?2"),
                params![channel, version.to_string()],
                Self::row_to_release,
            )
            .optional()?;
        let Some((release, manifest)) = row else {
            return Ok(None);
        };

        let mut stmt = self.conn.prepare(&format!(
            "{PACKAGE_COLUMNS} WHERE channel = ?1 AND target_version = ?2"
        ))?;
        let packages = stmt
            .query_map(params![channel, version.to_string()], Self::row_to_package)?
            .map(|r| r.map(|(_, package)| package))
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(Some(ReleaseEntry::new(release, manifest, packages)))
    }

    /// Every release with its packages, across all channels.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn load_entries(&self) -> Result<Vec<ReleaseEntry>> {
        let mut stmt = self.conn.prepare(PACKAGE_COLUMNS)?;
        let mut packages: HashMap<(String, Version), Vec<Package>> = HashMap::new();
        for row in stmt.query_map([], Self::row_to_package)? {
            let (channel, package) = row?;
            packages
                .entry((channel, package.target_version.clone()))
                .or_default()
                .push(package);
        }

        let mut stmt = self.conn.prepare(RELEASE_COLUMNS)?;
        let entries = stmt
            .query_map([], Self::row_to_release)?
            .map(|row| {
                row.map(|(release, manifest)| {
                    let key = (release.channel.clone(), release.version.clone());
                    let packages = packages.remove(&key).unwrap_or_default();
                    ReleaseEntry::new(release, manifest, packages)
                })
            })
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    // === Devices and sessions ===

    /// Load a device record.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn device(&self, device_id: &str) -> Result<Option<DeviceRecord>> {
        let device = self
            .conn
            .query_row(
                r"
                SELECT device_id, current_version, last_known_good_version, pending_version,
                       update_status, last_report_at
                FROM devices WHERE device_id = ?1
                ",
                [device_id],
                Self::row_to_device,
            )
            .optional()?;
        Ok(device)
    }

    /// Load a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn session(&self, session_id: &Uuid) -> Result<Option<UpdateSession>> {
        let session = self
            .conn
            .query_row(
                &format!("{SESSION_COLUMNS} WHERE session_id = ?1"),
                [session_id.to_string()],
                Self::row_to_session,
            )
            .optional()?;
        Ok(session)
    }

    /// Most recent sessions of a device, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn sessions_for_device(&self, device_id: &str, limit: usize) -> Result<Vec<UpdateSession>> {
        let mut stmt = self.conn.prepare(&format!(
            "{SESSION_COLUMNS} WHERE device_id = ?1 ORDER BY started_at DESC LIMIT ?2"
        ))?;
        let limit_i64 = i64::try_from(limit).unwrap_or(i64::MAX);
        let sessions = stmt
            .query_map(params![device_id, limit_i64], Self::row_to_session)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(sessions)
    }

    /// Write a device record and a session together.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails; nothing is written
    /// in that case.
    pub fn record_report(&self, device: &DeviceRecord, session: &UpdateSession) -> Result<()> {
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            r"
            INSERT OR REPLACE INTO devices (device_id, current_version, last_known_good_version,
                                            pending_version, update_status, last_report_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                device.device_id,
                device.current_version.to_string(),
                device.last_known_good_version.as_ref().map(ToString::to_string),
                device.pending_version.as_ref().map(ToString::to_string),
                device.update_status.to_string(),
                device.last_report_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            r"
            INSERT OR REPLACE INTO sessions (session_id, device_id, target_version, package_hash,
                                             package_kind, started_at, updated_at, state, outcome,
                                             failure_reason)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            ",
            params![
                session.session_id.to_string(),
                session.device_id,
                session.target_version.to_string(),
                session.package_hash.map(|h| h.to_hex()),
                session.package_kind.map(|k| k.to_string()),
                session.started_at.to_rfc3339(),
                session.updated_at.to_rfc3339(),
                session.state.to_string(),
                session.outcome.to_string(),
                session.failure_reason.map(|r| r.to_string()),
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Row counts and file size.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    pub fn stats(&self) -> Result<StorageStats> {
        let count = |table: &str| -> Result<i64> {
            Ok(self
                .conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?)
        };

        let db_size_bytes = if self.path.to_string_lossy() == ":memory:" {
            0
        } else {
            std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
        };

        Ok(StorageStats {
            channels: count("channels")?,
            releases: count("releases")?,
            packages: count("packages")?,
            devices: count("devices")?,
            sessions: count("sessions")?,
            db_size_bytes,
        })
    }

    // === Row mapping ===

    fn row_to_release(row: &Row) -> rusqlite::Result<(Release, String)> {
        let release = Release {
            channel: row.get(0)?,
            version: parse_column(row, 1)?,
            manifest_hash: parse_column(row, 3)?,
            signature: row.get(4)?,
            minimum_source_version: parse_optional_column(row, 5)?,
            changelog: row.get(6)?,
            created_at: parse_column(row, 7)?,
            available: row.get(8)?,
        };
        Ok((release, row.get(2)?))
    }

    fn row_to_package(row: &Row) -> rusqlite::Result<(String, Package)> {
        let size: i64 = row.get(6)?;
        let package = Package {
            target_version: parse_column(row, 1)?,
            content_hash: parse_column(row, 2)?,
            kind: parse_column(row, 3)?,
            source_version: parse_optional_column(row, 4)?,
            target_hash: parse_column(row, 5)?,
            size_bytes: u64::try_from(size).map_err(|e| conversion_error(6, e))?,
            signature: row.get(7)?,
        };
        Ok((row.get(0)?, package))
    }

    fn row_to_device(row: &Row) -> rusqlite::Result<DeviceRecord> {
        Ok(DeviceRecord {
            device_id: row.get(0)?,
            current_version: parse_column(row, 1)?,
            last_known_good_version: parse_optional_column(row, 2)?,
            pending_version: parse_optional_column(row, 3)?,
            update_status: parse_column(row, 4)?,
            last_report_at: parse_column(row, 5)?,
        })
    }

    fn row_to_session(row: &Row) -> rusqlite::Result<UpdateSession> {
        Ok(UpdateSession {
            session_id: parse_column(row, 0)?,
            device_id: row.get(1)?,
            target_version: parse_column(row, 2)?,
            package_hash: parse_optional_column(row, 3)?,
            package_kind: parse_optional_column(row, 4)?,
            started_at: parse_column(row, 5)?,
            updated_at: parse_column(row, 6)?,
            state: parse_column(row, 7)?,
            outcome: parse_column(row, 8)?,
            failure_reason: parse_optional_column(row, 9)?,
        })
    }
}

const RELEASE_COLUMNS: &str = r"
SELECT channel, version, manifest, manifest_hash, signature, minimum_source_version,
       changelog, created_at, available
FROM releases";

const PACKAGE_COLUMNS: &str = r"
SELECT channel, target_version, content_hash, kind, source_version, target_hash,
       size_bytes, signature
FROM packages";

const SESSION_COLUMNS: &str = r"
SELECT session_id, device_id, target_version, package_hash, package_kind, started_at,
       updated_at, state, outcome, failure_reason
FROM sessions";

/// Row counts of the server database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageStats {
    /// Number of channels.
    pub channels: i64,
    /// Number of releases, including retired ones.
    pub releases: i64,
    /// Number of packages.
    pub packages: i64,
    /// Number of known devices.
    pub devices: i64,
    /// Number of recorded sessions.
    pub sessions: i64,
    /// Size of the database file in bytes.
    pub db_size_bytes: u64,
}

fn to_sql_size(size: u64) -> Result<i64> {
    i64::try_from(size).map_err(|_| Error::validation(format!("size {size} out of range")))
}

fn conversion_error(idx: usize, err: impl Display) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, err.to_string().into())
}

fn parse_column<T>(row: &Row, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    let text: String = row.get(idx)?;
    text.parse().map_err(|e| conversion_error(idx, e))
}

fn parse_optional_column<T>(row: &Row, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    let text: Option<String> = row.get(idx)?;
    text.map(|t| t.parse().map_err(|e| conversion_error(idx, e)))
        .transpose()
}
