//! `lar-store` – session persistence.
//!
//! Everything a mapping session leaves on disk lives in one directory named
//! after the session's creation time (Unix milliseconds).
//!
//! # Modules
//!
//! - [`map_db`] – [`MapDatabase`][map_db::MapDatabase]: the full map
//!   (landmarks, anchors, GPS log, id counters) in a SQLite file, written in
//!   a single transaction so a crash never leaves half a map.
//! - [`session`] – the [`SessionStore`][session::SessionStore] trait and its
//!   [`DirectoryStore`][session::DirectoryStore] implementation: metadata
//!   JSON, per-frame files, and the map database.

pub mod map_db;
pub mod session;

pub use map_db::{MapDatabase, MapDbError};
pub use session::{
    DirectoryStore, MAP_FILE, METADATA_FILE, SessionStore, StoreError, load_archive,
};
