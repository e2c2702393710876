//! Session directories.
//!
//! A mapping session persists to one directory:
//!
//! ```text
//! <sessions_root>/<created-at millis>/
//!     metadata.json          session log, replaced atomically
//!     frames/<id>.json       frame pose and features
//!     frames/<id>.img        frame image bytes, if any
//!     map.sqlite             map archive (see `map_db`)
//! ```
//!
//! [`SessionStore`] is the seam the live mapper writes through, so tests and
//! embedders can substitute their own persistence.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use lar_types::{Feature, Frame, FrameId, LarError, MapArchive, SessionMetadata, Transform};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::map_db::{MapDatabase, MapDbError};

pub const METADATA_FILE: &str = "metadata.json";
pub const MAP_FILE: &str = "map.sqlite";
const FRAMES_DIR: &str = "frames";

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    MapDb(#[from] MapDbError),
}

impl StoreError {
    fn io(path: &Path, source: io::Error) -> Self {
        StoreError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Convert into the workspace error, tagging the failed operation.
    pub fn into_lar(self, operation: &str) -> LarError {
        LarError::Persistence {
            operation: operation.to_string(),
            details: self.to_string(),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SessionStore trait
// ─────────────────────────────────────────────────────────────────────────────

/// Persistence backend for a live mapping session.
pub trait SessionStore: Send + Sync {
    /// Where this session lives, for display.
    fn location(&self) -> &Path;

    fn write_metadata(&self, metadata: &SessionMetadata) -> Result<(), StoreError>;

    fn write_frame(&self, id: FrameId, frame: &Frame) -> Result<(), StoreError>;

    /// Persist the map archive; returns the path it was written to.
    fn save_map(&self, archive: &MapArchive) -> Result<PathBuf, StoreError>;

    /// Load an archive from a session directory or a map file.
    fn load_map(&self, path: &Path) -> Result<MapArchive, StoreError>;
}

/// Frame file contents; the image goes to a sibling `.img` file.
#[derive(Serialize, Deserialize)]
struct FrameFile {
    timestamp: DateTime<Utc>,
    camera_pose: Transform,
    features: Vec<Feature>,
}

// ─────────────────────────────────────────────────────────────────────────────
// DirectoryStore
// ─────────────────────────────────────────────────────────────────────────────

/// [`SessionStore`] backed by a plain directory.
#[derive(Debug, Clone)]
pub struct DirectoryStore {
    dir: PathBuf,
}

impl DirectoryStore {
    /// Create a fresh session directory under `root`, named by the current
    /// time in milliseconds.
    pub fn create_session(root: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(root).map_err(|e| StoreError::io(root, e))?;
        let mut stamp = Utc::now().timestamp_millis();
        loop {
            let dir = root.join(stamp.to_string());
            match fs::create_dir(&dir) {
                Ok(()) => return Self::open(&dir),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => stamp += 1,
                Err(e) => return Err(StoreError::io(&dir, e)),
            }
        }
    }

    /// Use an existing (or new) directory as the session directory.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        let frames = dir.join(FRAMES_DIR);
        fs::create_dir_all(&frames).map_err(|e| StoreError::io(&frames, e))?;
        debug!(dir = %dir.display(), "session directory ready");
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn read_metadata(&self) -> Result<SessionMetadata, StoreError> {
        let path = self.dir.join(METADATA_FILE);
        let raw = fs::read_to_string(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Read a frame back, with its image if one was written.
    pub fn read_frame(&self, id: FrameId) -> Result<Frame, StoreError> {
        let (json_path, img_path) = self.frame_paths(id);
        let raw = fs::read_to_string(&json_path).map_err(|e| StoreError::io(&json_path, e))?;
        let file: FrameFile = serde_json::from_str(&raw)?;
        let image = match fs::read(&img_path) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(StoreError::io(&img_path, e)),
        };
        Ok(Frame {
            timestamp: file.timestamp,
            camera_pose: file.camera_pose,
            features: file.features,
            image,
        })
    }

    fn frame_paths(&self, id: FrameId) -> (PathBuf, PathBuf) {
        let frames = self.dir.join(FRAMES_DIR);
        (
            frames.join(format!("{id}.json")),
            frames.join(format!("{id}.img")),
        )
    }
}

/// Load a map archive from a session directory or directly from a map file.
pub fn load_archive(path: &Path) -> Result<MapArchive, StoreError> {
    let file = if path.is_dir() {
        path.join(MAP_FILE)
    } else {
        path.to_path_buf()
    };
    if !file.exists() {
        return Err(StoreError::io(
            &file,
            io::Error::new(io::ErrorKind::NotFound, "map file not found"),
        ));
    }
    Ok(MapDatabase::open(&file)?.load()?)
}

/// Write `bytes` to `path` via a temporary sibling and rename.
fn replace_file(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes).map_err(|e| StoreError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))
}

impl SessionStore for DirectoryStore {
    fn location(&self) -> &Path {
        &self.dir
    }

    fn write_metadata(&self, metadata: &SessionMetadata) -> Result<(), StoreError> {
        let json = serde_json::to_vec_pretty(metadata)?;
        replace_file(&self.dir.join(METADATA_FILE), &json)
    }

    fn write_frame(&self, id: FrameId, frame: &Frame) -> Result<(), StoreError> {
        let (json_path, img_path) = self.frame_paths(id);
        let file = FrameFile {
            timestamp: frame.timestamp,
            camera_pose: frame.camera_pose,
            features: frame.features.clone(),
        };
        let json = serde_json::to_vec(&file)?;
        fs::write(&json_path, json).map_err(|e| StoreError::io(&json_path, e))?;
        if let Some(image) = &frame.image {
            fs::write(&img_path, image).map_err(|e| StoreError::io(&img_path, e))?;
        }
        Ok(())
    }

    fn save_map(&self, archive: &MapArchive) -> Result<PathBuf, StoreError> {
        let path = self.dir.join(MAP_FILE);
        let mut db = MapDatabase::open(&path)?;
        db.save(archive)?;
        debug!(
            path = %path.display(),
            revision = archive.revision,
            landmarks = archive.landmarks.len(),
            "map saved"
        );
        Ok(path)
    }

    fn load_map(&self, path: &Path) -> Result<MapArchive, StoreError> {
        load_archive(path)
    }
}
