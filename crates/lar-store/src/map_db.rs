//! SQLite map database.
//!
//! Persists a whole [`MapArchive`] and loads it back without loss: `f64`
//! values go to `REAL` columns unchanged, timestamps are RFC-3339 with
//! nanoseconds, descriptors are raw blobs, and anchor quaternions are
//! stored component-wise and restored without renormalisation.
//!
//! [`MapDatabase::save`] replaces the previous contents inside one
//! transaction.
//!
//! # Storage layout
//!
//! | table | columns |
//! |---|---|
//! | `landmarks` | `id` PK, `x`, `y`, `z`, `ox`/`oy`/`oz` (nullable orientation), `descriptor` BLOB(32), `observations`, `last_seen` TEXT, `is_usable` |
//! | `anchors` | `id` PK, `name`, `kind` (`map_origin`/`user`), `tx`/`ty`/`tz`, `qi`/`qj`/`qk`/`qw`, `created_at` TEXT |
//! | `gps_observations` | `seq` PK (arrival order), `timestamp` TEXT, `rx`/`ry`/`rz`, `latitude`, `longitude`, `accuracy` |
//! | `map_info` | `key` PK, `value` INTEGER (`schema_version`, `revision`, `next_landmark_id`, `next_anchor_id`) |
//!
//! # Example
//!
//! ```rust
//! use lar_store::map_db::MapDatabase;
//! use lar_types::MapArchive;
//!
//! let mut db = MapDatabase::open_in_memory().unwrap();
//! let archive = MapArchive {
//!     landmarks: vec![],
//!     anchors: vec![],
//!     gps_observations: vec![],
//!     next_landmark_id: 0,
//!     next_anchor_id: 1,
//!     revision: 0,
//! };
//! db.save(&archive).unwrap();
//! assert_eq!(db.load().unwrap(), archive);
//! ```

use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use lar_types::{
    Anchor, AnchorId, AnchorKind, DESCRIPTOR_BYTES, Descriptor, GeodeticPoint, GpsObservation,
    Landmark, LandmarkId, MapArchive, Transform,
};
use nalgebra::{Quaternion, Translation3, UnitQuaternion, Vector3};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use thiserror::Error;

/// Current on-disk layout version.
pub const SCHEMA_VERSION: i64 = 1;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

/// Errors that can arise from map database operations.
#[derive(Error, Debug)]
pub enum MapDbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Map database holds no saved map")]
    Empty,
    #[error("Map database schema version {0} is newer than supported {SCHEMA_VERSION}")]
    UnsupportedVersion(i64),
}

// ─────────────────────────────────────────────────────────────────────────────
// Column helpers
// ─────────────────────────────────────────────────────────────────────────────

fn time_to_text(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn time_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let text: String = row.get(idx)?;
    text.parse::<DateTime<Utc>>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn descriptor_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Descriptor> {
    let blob: Vec<u8> = row.get(idx)?;
    let bytes: [u8; DESCRIPTOR_BYTES] = blob.try_into().map_err(|b: Vec<u8>| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Blob,
            format!("descriptor has {} bytes", b.len()).into(),
        )
    })?;
    Ok(Descriptor(bytes))
}

fn kind_to_text(kind: AnchorKind) -> &'static str {
    match kind {
        AnchorKind::MapOrigin => "map_origin",
        AnchorKind::User => "user",
    }
}

fn kind_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<AnchorKind> {
    let text: String = row.get(idx)?;
    match text.as_str() {
        "map_origin" => Ok(AnchorKind::MapOrigin),
        "user" => Ok(AnchorKind::User),
        other => Err(rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("unknown anchor kind {other:?}").into(),
        )),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// MapDatabase
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed map archive.
pub struct MapDatabase {
    conn: Connection,
}

impl MapDatabase {
    /// Open (or create) a map database at `path`.
    pub fn open(path: &Path) -> Result<Self, MapDbError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    /// Open a temporary in-memory database (useful for testing).
    pub fn open_in_memory() -> Result<Self, MapDbError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.init_schema()?;
        Ok(db)
    }

    fn init_schema(&self) -> Result<(), MapDbError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS landmarks (
                id           INTEGER NOT NULL PRIMARY KEY,
                x            REAL NOT NULL,
                y            REAL NOT NULL,
                z            REAL NOT NULL,
                ox           REAL,
                oy           REAL,
                oz           REAL,
                descriptor   BLOB NOT NULL,
                observations INTEGER NOT NULL,
                last_seen    TEXT NOT NULL,
                is_usable    INTEGER NOT NULL
            );
            CREATE TABLE IF NOT EXISTS anchors (
                id         INTEGER NOT NULL PRIMARY KEY,
                name       TEXT NOT NULL,
                kind       TEXT NOT NULL,
                tx REAL NOT NULL, ty REAL NOT NULL, tz REAL NOT NULL,
                qi REAL NOT NULL, qj REAL NOT NULL, qk REAL NOT NULL, qw REAL NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS gps_observations (
                seq       INTEGER NOT NULL PRIMARY KEY,
                timestamp TEXT NOT NULL,
                rx REAL NOT NULL, ry REAL NOT NULL, rz REAL NOT NULL,
                latitude  REAL NOT NULL,
                longitude REAL NOT NULL,
                accuracy  REAL NOT NULL
            );
            CREATE TABLE IF NOT EXISTS map_info (
                key   TEXT NOT NULL PRIMARY KEY,
                value INTEGER NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Replace the stored map with `archive` in a single transaction.
    pub fn save(&mut self, archive: &MapArchive) -> Result<(), MapDbError> {
        let tx = self.conn.transaction()?;
        tx.execute_batch(
            "DELETE FROM landmarks;
             DELETE FROM anchors;
             DELETE FROM gps_observations;
             DELETE FROM map_info;",
        )?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO landmarks
                     (id, x, y, z, ox, oy, oz, descriptor, observations, last_seen, is_usable)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for l in &archive.landmarks {
                stmt.execute(params![
                    l.id.0 as i64,
                    l.position.x,
                    l.position.y,
                    l.position.z,
                    l.orientation.map(|o| o.x),
                    l.orientation.map(|o| o.y),
                    l.orientation.map(|o| o.z),
                    &l.descriptor.0[..],
                    l.observations,
                    time_to_text(&l.last_seen),
                    l.is_usable,
                ])?;
            }

            let mut stmt = tx.prepare(
                "INSERT INTO anchors
                     (id, name, kind, tx, ty, tz, qi, qj, qk, qw, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            )?;
            for a in &archive.anchors {
                let t = &a.transform.translation.vector;
                let q = &a.transform.rotation.coords;
                stmt.execute(params![
                    a.id.0 as i64,
                    a.name,
                    kind_to_text(a.kind),
                    t.x,
                    t.y,
                    t.z,
                    q.x,
                    q.y,
                    q.z,
                    q.w,
                    time_to_text(&a.created_at),
                ])?;
            }

            let mut stmt = tx.prepare(
                "INSERT INTO gps_observations
                     (seq, timestamp, rx, ry, rz, latitude, longitude, accuracy)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            )?;
            for (seq, o) in archive.gps_observations.iter().enumerate() {
                stmt.execute(params![
                    seq as i64,
                    time_to_text(&o.timestamp),
                    o.relative.x,
                    o.relative.y,
                    o.relative.z,
                    o.global.latitude,
                    o.global.longitude,
                    o.accuracy,
                ])?;
            }

            let mut stmt = tx.prepare("INSERT INTO map_info (key, value) VALUES (?1, ?2)")?;
            for (key, value) in [
                ("schema_version", SCHEMA_VERSION),
                ("revision", archive.revision as i64),
                ("next_landmark_id", archive.next_landmark_id as i64),
                ("next_anchor_id", archive.next_anchor_id as i64),
            ] {
                stmt.execute(params![key, value])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// Load the stored map.
    ///
    /// Returns [`MapDbError::Empty`] if nothing was ever saved.
    pub fn load(&self) -> Result<MapArchive, MapDbError> {
        let version = self.info("schema_version")?.ok_or(MapDbError::Empty)?;
        if version > SCHEMA_VERSION {
            return Err(MapDbError::UnsupportedVersion(version));
        }
        let counter = |key: &str| -> Result<u64, MapDbError> {
            Ok(self.info(key)?.unwrap_or_default() as u64)
        };

        Ok(MapArchive {
            landmarks: self.load_landmarks()?,
            anchors: self.load_anchors()?,
            gps_observations: self.load_gps()?,
            next_landmark_id: counter("next_landmark_id")?,
            next_anchor_id: counter("next_anchor_id")?,
            revision: counter("revision")?,
        })
    }

    /// Number of stored landmarks.
    pub fn landmark_count(&self) -> Result<usize, MapDbError> {
        let n: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM landmarks", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    fn info(&self, key: &str) -> Result<Option<i64>, MapDbError> {
        Ok(self
            .conn
            .query_row("SELECT value FROM map_info WHERE key = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?)
    }

    fn load_landmarks(&self) -> Result<Vec<Landmark>, MapDbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, x, y, z, ox, oy, oz, descriptor, observations, last_seen, is_usable
             FROM landmarks ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let orientation = match (
                row.get::<_, Option<f64>>(4)?,
                row.get::<_, Option<f64>>(5)?,
                row.get::<_, Option<f64>>(6)?,
            ) {
                (Some(x), Some(y), Some(z)) => Some(Vector3::new(x, y, z)),
                _ => None,
            };
            Ok(Landmark {
                id: LandmarkId(row.get::<_, i64>(0)? as u64),
                position: Vector3::new(row.get(1)?, row.get(2)?, row.get(3)?),
                orientation,
                descriptor: descriptor_column(row, 7)?,
                observations: row.get(8)?,
                last_seen: time_column(row, 9)?,
                is_usable: row.get(10)?,
                is_matched: false,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn load_anchors(&self) -> Result<Vec<Anchor>, MapDbError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, kind, tx, ty, tz, qi, qj, qk, qw, created_at
             FROM anchors ORDER BY id ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let rotation = UnitQuaternion::new_unchecked(Quaternion::<f64>::new(
                row.get(9)?,
                row.get(6)?,
                row.get(7)?,
                row.get(8)?,
            ));
            let translation = Translation3::<f64>::new(row.get(3)?, row.get(4)?, row.get(5)?);
            Ok(Anchor {
                id: AnchorId(row.get::<_, i64>(0)? as u64),
                name: row.get(1)?,
                kind: kind_column(row, 2)?,
                transform: Transform::from_parts(translation, rotation),
                created_at: time_column(row, 10)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    fn load_gps(&self) -> Result<Vec<GpsObservation>, MapDbError> {
        let mut stmt = self.conn.prepare(
            "SELECT timestamp, rx, ry, rz, latitude, longitude, accuracy
             FROM gps_observations ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(GpsObservation {
                timestamp: time_column(row, 0)?,
                relative: Vector3::new(row.get(1)?, row.get(2)?, row.get(3)?),
                global: GeodeticPoint::new(row.get(4)?, row.get(5)?),
                accuracy: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn sample_archive() -> MapArchive {
        let t0 = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        MapArchive {
            landmarks: vec![
                Landmark {
                    id: LandmarkId(0),
                    position: Vector3::new(0.1, 0.2, -0.30000000000000004),
                    orientation: Some(Vector3::new(0.0, 1.0, 0.0)),
                    descriptor: Descriptor::from_seed(11),
                    observations: 4,
                    last_seen: t0,
                    is_usable: true,
                    is_matched: false,
                },
                Landmark {
                    id: LandmarkId(3),
                    position: Vector3::new(1e-12, -7.25, 1.0 / 3.0),
                    orientation: None,
                    descriptor: Descriptor::from_seed(12),
                    observations: 1,
                    last_seen: t0 + Duration::nanoseconds(1),
                    is_usable: false,
                    is_matched: false,
                },
            ],
            anchors: vec![
                Anchor {
                    id: AnchorId(2),
                    name: "map-origin".to_string(),
                    kind: AnchorKind::MapOrigin,
                    transform: Transform::from_parts(
                        Translation3::new(0.5, 0.0, -1.0),
                        UnitQuaternion::from_euler_angles(0.0, 0.3, 0.0),
                    ),
                    created_at: t0,
                },
                Anchor {
                    id: AnchorId(4),
                    name: "kitchen door".to_string(),
                    kind: AnchorKind::User,
                    transform: Transform::identity(),
                    created_at: t0,
                },
            ],
            gps_observations: vec![
                GpsObservation {
                    timestamp: t0,
                    relative: Vector3::new(0.0, 1.4, 0.0),
                    global: GeodeticPoint::new(47.3769, 8.5417),
                    accuracy: 4.5,
                },
                GpsObservation {
                    timestamp: t0 + Duration::seconds(1),
                    relative: Vector3::new(0.7, 1.4, -0.2),
                    global: GeodeticPoint::new(47.37691, 8.54171),
                    accuracy: 3.0,
                },
            ],
            next_landmark_id: 4,
            next_anchor_id: 5,
            revision: 17,
        }
    }

    #[test]
    fn save_then_load_is_lossless() {
        let mut db = MapDatabase::open_in_memory().unwrap();
        let archive = sample_archive();
        db.save(&archive).unwrap();
        assert_eq!(db.load().unwrap(), archive);
        assert_eq!(db.landmark_count().unwrap(), 2);
    }

    #[test]
    fn save_replaces_previous_contents() {
        let mut db = MapDatabase::open_in_memory().unwrap();
        db.save(&sample_archive()).unwrap();

        let mut smaller = sample_archive();
        smaller.landmarks.truncate(1);
        smaller.gps_observations.clear();
        smaller.revision = 18;
        db.save(&smaller).unwrap();

        assert_eq!(db.load().unwrap(), smaller);
    }

    #[test]
    fn empty_database_reports_empty() {
        let db = MapDatabase::open_in_memory().unwrap();
        assert!(matches!(db.load(), Err(MapDbError::Empty)));
    }

    #[test]
    fn persists_across_connections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.sqlite");
        {
            let mut db = MapDatabase::open(&path).unwrap();
            db.save(&sample_archive()).unwrap();
        }
        let db = MapDatabase::open(&path).unwrap();
        assert_eq!(db.load().unwrap(), sample_archive());
    }

    #[test]
    fn newer_schema_is_rejected() {
        let mut db = MapDatabase::open_in_memory().unwrap();
        db.save(&sample_archive()).unwrap();
        db.conn
            .execute(
                "UPDATE map_info SET value = ?1 WHERE key = 'schema_version'",
                [SCHEMA_VERSION + 1],
            )
            .unwrap();
        assert!(matches!(db.load(), Err(MapDbError::UnsupportedVersion(_))));
    }
}
