//! `lar-runtime` – Mapping Session Engine
//!
//! Drives a live mapping session and answers localization queries against
//! saved maps.
//!
//! # Modules
//!
//! - [`live_mapper`] – [`LiveMapper`][live_mapper::LiveMapper]:
//!   the session orchestrator. Frames, poses, GPS fixes, and user actions
//!   from concurrent producers are serialized through a single map writer
//!   task (weighted between an interactive and a background queue), while
//!   the [`MapBuilder`][map_builder::MapBuilder] runs on its own lane so
//!   slow optimization never blocks readers.
//! - [`map_builder`] – the [`MapBuilder`][map_builder::MapBuilder] seam and
//!   the descriptor-matching [`DescriptorMapBuilder`][map_builder::DescriptorMapBuilder].
//! - [`tracker`] – [`Tracker`][tracker::Tracker]: read-only localization of
//!   frames inside a frozen map, plus the origin relocation math.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional OTLP span
//!   exporter. Set `OTEL_EXPORTER_OTLP_ENDPOINT` to enable trace export.
//!
//! # Map ownership
//!
//! The [`Map`][lar_kernel::Map] is owned by exactly one task inside a
//! `LiveMapper`. Everything else (the builder, trackers, the cockpit, the
//! CLI) sees immutable [`MapSnapshot`][lar_kernel::MapSnapshot]s.

pub mod live_mapper;
pub mod map_builder;
pub mod telemetry;
pub mod tracker;

pub use live_mapper::{
    FrameOutcome, LiveMapper, MapperConfig, MapperStats, ProcessReport, SessionState,
};
pub use map_builder::{BuilderConfig, BuilderError, DescriptorMapBuilder, MapBuilder};
pub use telemetry::{TracerProviderGuard, init_tracing};
pub use tracker::{Localization, Tracker, TrackerConfig, origin_in_tracking_frame};

// Re-exported so binaries can depend on the runtime alone for snapshots.
pub use lar_kernel::{MapSnapshot, SnapshotSource};
