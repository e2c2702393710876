//! `lar-cockpit` – Debug Visualization Server
//!
//! Boots a small HTTP + WebSocket server (default port `8080`) that:
//!
//! 1. **Serves** a single-page canvas plot of the map at every non-WebSocket
//!    HTTP path.
//!
//! 2. **Streams** a [`DebugScene`] (prioritized landmarks, GPS track,
//!    anchors, latest user location) as JSON to every connected browser tab
//!    after each [`MapChanged`] or [`UserLocation`] event on the
//!    [`EventBus`].
//!
//! The server only reads snapshots; it never mutates the map.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use lar_cockpit::CockpitServer;
//! use lar_kernel::{Map, SnapshotSource};
//! use lar_middleware::EventBus;
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = Arc::new(EventBus::default());
//!     let source: Arc<dyn SnapshotSource> = Arc::new(Map::new().snapshot());
//!     CockpitServer::new(Arc::clone(&bus), source)
//!         .run()
//!         .await
//!         .expect("cockpit server failed");
//! }
//! ```
//!
//! [`EventBus`]: lar_middleware::EventBus
//! [`MapChanged`]: lar_types::EventPayload::MapChanged
//! [`UserLocation`]: lar_types::EventPayload::UserLocation

pub mod scene;
pub mod server;

pub use scene::{DebugScene, SceneAnchor, SceneLandmark};
pub use server::{CockpitServer, DEFAULT_MAX_LANDMARKS, DEFAULT_PORT};
