//! [`LiveMapper`] – the mapping session orchestrator.
//!
//! Device producers (poses, frames, GPS fixes, user actions) call into one
//! shared `LiveMapper` concurrently. Internally there are two tasks:
//!
//! ```text
//!  add_frame / process ──▶ builder lane ──(proposal)──┐
//!                          (owns MapBuilder,          │ background queue
//!                           spawn_blocking)           ▼
//!  add_position / add_locations ─────────────────▶ map writer ──▶ watch<SessionState>
//!  place_anchor / relocate_origin ──(interactive)──▶ (owns Map)  ──▶ EventBus
//! ```
//!
//! * **Map writer** – the only owner of the [`Map`]. Every mutation is a
//!   message; after each commit it publishes an immutable [`SessionState`]
//!   through a `watch` channel and a [`MapChange`] on [`Topic::MapUpdates`].
//!   It serves up to `interactive_weight` consecutive interactive commands
//!   (anchors, origin relocation) before yielding to one background command
//!   (frame commits, poses, GPS fixes). It never does I/O.
//! * **Builder lane** – the only owner of the [`MapBuilder`]. Jobs run one
//!   at a time on the blocking pool against the latest committed snapshot,
//!   and the lane waits for the writer's acknowledgement before the next
//!   job, so a proposal always sees the previous one committed.
//!
//! Readers ([`LiveMapper::snapshot`] and friends) only borrow the latest
//! `watch` value and never wait for the builder. Disk writes
//! ([`LiveMapper::write_metadata`], [`LiveMapper::save_map`], per-frame
//! files) run on the blocking pool outside the writer.
//!
//! # Backpressure
//!
//! All queues are bounded. Pose samples are rate limited
//! (`max_pose_rate_hz`) and dropped when the background queue is full;
//! frames and fixes wait for space. Drops show up in [`LiveMapper::stats`].

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use lar_kernel::{Map, MapMutation, MapSnapshot, SnapshotSource};
use lar_middleware::{EventBus, Topic};
use lar_perception::georeference::DEFAULT_MIN_DISPLACEMENT_M;
use lar_perception::trajectory::DEFAULT_TRAJECTORY_CAPACITY;
use lar_perception::{Trajectory, UserLocator};
use lar_store::{SessionStore, StoreError};
use lar_types::{
    Anchor, AnchorId, Event, EventPayload, Frame, FrameId, FrameRecord, GeodeticPoint, GpsFix,
    GpsObservation, Landmark, LandmarkDelta, LarError, MapChange, MapChangeKind, PoseSample,
    SessionMetadata, Transform,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::map_builder::MapBuilder;
use crate::tracker::{Localization, origin_in_tracking_frame};

const SOURCE: &str = "lar-runtime::live_mapper";

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Tuning for [`LiveMapper`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MapperConfig {
    pub interactive_capacity: usize,
    pub background_capacity: usize,
    pub builder_capacity: usize,
    /// Interactive commands served in a row before one background command.
    pub interactive_weight: usize,
    /// Upper bound on accepted pose samples per second; `0` disables.
    pub max_pose_rate_hz: f64,
    pub trajectory_capacity: usize,
    /// Minimum movement before a new user location is surfaced.
    pub location_hysteresis_m: f64,
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            interactive_capacity: 32,
            background_capacity: 256,
            builder_capacity: 64,
            interactive_weight: 4,
            max_pose_rate_hz: 60.0,
            trajectory_capacity: DEFAULT_TRAJECTORY_CAPACITY,
            location_hysteresis_m: DEFAULT_MIN_DISPLACEMENT_M,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public result types
// ─────────────────────────────────────────────────────────────────────────────

/// What happened to a frame passed to [`LiveMapper::add_frame`].
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Ingested {
        frame_id: FrameId,
        created: usize,
        updated: usize,
    },
    /// The builder or the map rejected the frame; the map is unchanged.
    Skipped { reason: String },
}

/// Result of one [`LiveMapper::process`] pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessReport {
    /// Map revision after the pass.
    pub revision: u64,
    /// Landmarks created or updated by the pass.
    pub changed: usize,
}

/// Counters exposed by [`LiveMapper::stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MapperStats {
    pub frames_ingested: u64,
    pub frames_skipped: u64,
    pub poses_accepted: u64,
    pub poses_dropped: u64,
    pub gps_accepted: u64,
    pub gps_dropped: u64,
    pub process_passes: u64,
}

#[derive(Default)]
struct Counters {
    frames_ingested: AtomicU64,
    frames_skipped: AtomicU64,
    poses_accepted: AtomicU64,
    poses_dropped: AtomicU64,
    gps_accepted: AtomicU64,
    gps_dropped: AtomicU64,
    process_passes: AtomicU64,
}

fn bump(counter: &AtomicU64, by: u64) {
    counter.fetch_add(by, Ordering::Relaxed);
}

impl Counters {
    fn read(&self) -> MapperStats {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MapperStats {
            frames_ingested: get(&self.frames_ingested),
            frames_skipped: get(&self.frames_skipped),
            poses_accepted: get(&self.poses_accepted),
            poses_dropped: get(&self.poses_dropped),
            gps_accepted: get(&self.gps_accepted),
            gps_dropped: get(&self.gps_dropped),
            process_passes: get(&self.process_passes),
        }
    }
}

/// Committed session state published after every writer step.
#[derive(Debug, Clone)]
pub struct SessionState {
    pub map: MapSnapshot,
    pub frames: Arc<Vec<FrameRecord>>,
    /// Latest georeferenced user location that passed the hysteresis.
    pub user_location: Option<GeodeticPoint>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

type Reply<T> = oneshot::Sender<Result<T, LarError>>;

enum Interactive {
    PlaceAnchor {
        name: String,
        transform: Transform,
        reply: Reply<MapChange>,
    },
    ReplaceOrigin {
        transform: Transform,
        reply: Reply<MapChange>,
    },
}

enum Background {
    CommitFrame {
        frame: Arc<Frame>,
        delta: LandmarkDelta,
        reply: Reply<FrameId>,
    },
    CommitLandmarks {
        delta: LandmarkDelta,
        reply: Reply<MapChange>,
    },
    Pose(PoseSample),
    Locations {
        fixes: Vec<GpsFix>,
        reply: Reply<usize>,
    },
    /// Acknowledged once every earlier background command is applied.
    Flush(oneshot::Sender<()>),
}

enum BuilderJob {
    AddFrame {
        frame: Arc<Frame>,
        reply: Reply<FrameOutcome>,
    },
    Position(PoseSample),
    Process {
        reply: Reply<ProcessReport>,
    },
    Flush(oneshot::Sender<()>),
}

// ─────────────────────────────────────────────────────────────────────────────
// Map writer
// ─────────────────────────────────────────────────────────────────────────────

struct Writer {
    map: Map,
    frames: Arc<Vec<FrameRecord>>,
    trajectory: Trajectory,
    locator: UserLocator,
    user_location: Option<GeodeticPoint>,
    state_tx: watch::Sender<SessionState>,
    bus: Arc<EventBus>,
    counters: Arc<Counters>,
}

impl Writer {
    async fn run(
        mut self,
        mut interactive: mpsc::Receiver<Interactive>,
        mut background: mpsc::Receiver<Background>,
        weight: usize,
    ) {
        let weight = weight.max(1);
        let mut streak = 0usize;
        loop {
            if streak < weight {
                tokio::select! {
                    biased;
                    Some(cmd) = interactive.recv() => {
                        streak += 1;
                        self.interactive(cmd);
                    }
                    Some(cmd) = background.recv() => {
                        streak = 0;
                        self.background(cmd);
                    }
                    else => break,
                }
            } else {
                tokio::select! {
                    biased;
                    Some(cmd) = background.recv() => {
                        streak = 0;
                        self.background(cmd);
                    }
                    Some(cmd) = interactive.recv() => self.interactive(cmd),
                    else => break,
                }
            }
        }
        debug!(revision = self.map.revision(), "map writer stopped");
    }

    fn interactive(&mut self, cmd: Interactive) {
        match cmd {
            Interactive::PlaceAnchor {
                name,
                transform,
                reply,
            } => {
                let result = self.commit(MapMutation::AddAnchor { name, transform });
                let _ = reply.send(result);
            }
            Interactive::ReplaceOrigin { transform, reply } => {
                let result = self.commit(MapMutation::ReplaceOrigin { transform });
                let _ = reply.send(result);
            }
        }
    }

    fn background(&mut self, cmd: Background) {
        match cmd {
            Background::CommitFrame {
                frame,
                delta,
                reply,
            } => {
                let _ = reply.send(self.commit_frame(&frame, delta));
            }
            Background::CommitLandmarks { delta, reply } => {
                let _ = reply.send(self.commit(MapMutation::ApplyLandmarks(delta)));
            }
            Background::Pose(sample) => self.record_pose(sample),
            Background::Locations { fixes, reply } => {
                let _ = reply.send(self.append_fixes(fixes));
            }
            Background::Flush(done) => {
                let _ = done.send(());
            }
        }
    }

    fn commit(&mut self, mutation: MapMutation) -> Result<MapChange, LarError> {
        let change = self.apply(mutation)?;
        self.publish_state();
        self.announce(&change);
        Ok(change)
    }

    fn apply(&mut self, mutation: MapMutation) -> Result<MapChange, LarError> {
        let label = mutation.label();
        self.map.apply(mutation).inspect_err(|err| {
            warn!(mutation = label, error = %err, "map mutation rejected");
        })
    }

    fn commit_frame(&mut self, frame: &Frame, delta: LandmarkDelta) -> Result<FrameId, LarError> {
        let change = if delta.is_empty() {
            None
        } else {
            Some(self.apply(MapMutation::ApplyLandmarks(delta))?)
        };
        let id = FrameId(self.frames.len() as u64);
        // The published state shares this log, so the push copies it.
        Arc::make_mut(&mut self.frames).push(FrameRecord {
            id,
            timestamp: frame.timestamp,
            position: frame.camera_pose.translation.vector,
            feature_count: frame.features.len(),
        });
        self.publish_state();
        if let Some(change) = change {
            self.announce(&change);
        }
        Ok(id)
    }

    fn record_pose(&mut self, sample: PoseSample) {
        if !self.trajectory.push(sample) {
            debug!(timestamp = %sample.timestamp, "out-of-order pose ignored");
            return;
        }
        if self.locate(&sample.position) {
            self.publish_state();
        }
    }

    fn append_fixes(&mut self, fixes: Vec<GpsFix>) -> Result<usize, LarError> {
        let mut newest = self
            .map
            .snapshot()
            .gps_observations()
            .last()
            .map(|o| o.timestamp);
        let offered = fixes.len();
        let mut accepted = Vec::with_capacity(offered);

        for fix in fixes {
            if newest.is_some_and(|t| fix.timestamp <= t) {
                warn!(timestamp = %fix.timestamp, "stale GPS fix dropped");
                continue;
            }
            let Some(relative) = self.trajectory.position_at(fix.timestamp) else {
                warn!(timestamp = %fix.timestamp, "GPS fix dropped: no pose history yet");
                continue;
            };
            newest = Some(fix.timestamp);
            accepted.push(GpsObservation {
                timestamp: fix.timestamp,
                relative,
                global: fix.coordinate,
                accuracy: fix.horizontal_accuracy,
            });
        }

        let count = accepted.len();
        bump(&self.counters.gps_dropped, (offered - count) as u64);
        if count == 0 {
            return Ok(0);
        }
        let change = self.apply(MapMutation::AppendGps(accepted)).inspect_err(|_| {
            bump(&self.counters.gps_dropped, count as u64);
        })?;
        bump(&self.counters.gps_accepted, count as u64);

        if let Some(latest) = self.trajectory.latest().map(|s| s.position) {
            self.locate(&latest);
        }
        self.publish_state();
        self.announce(&change);
        Ok(count)
    }

    /// Run the user locator; returns `true` when a new location surfaced.
    fn locate(&mut self, position: &nalgebra::Vector3<f64>) -> bool {
        let snapshot = self.map.snapshot();
        let Some(point) = self.locator.observe(snapshot.gps_observations(), position) else {
            return false;
        };
        self.user_location = Some(point);
        self.bus.publish_to(
            Topic::Localization,
            Event::new(SOURCE, EventPayload::UserLocation(point)),
        );
        true
    }

    fn publish_state(&self) {
        self.state_tx.send_replace(SessionState {
            map: self.map.snapshot(),
            frames: Arc::clone(&self.frames),
            user_location: self.user_location,
        });
    }

    fn announce(&self, change: &MapChange) {
        self.bus.publish_to(
            Topic::MapUpdates,
            Event::new(SOURCE, EventPayload::MapChanged(change.clone())),
        );
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder lane
// ─────────────────────────────────────────────────────────────────────────────

struct BuilderLane {
    builder: Option<Box<dyn MapBuilder>>,
    state: watch::Receiver<SessionState>,
    background: mpsc::Sender<Background>,
    counters: Arc<Counters>,
}

impl BuilderLane {
    async fn run(mut self, mut jobs: mpsc::Receiver<BuilderJob>) {
        while let Some(job) = jobs.recv().await {
            match job {
                BuilderJob::Position(sample) => {
                    if let Some(builder) = self.builder.as_mut() {
                        builder.add_position(&sample);
                    }
                }
                BuilderJob::AddFrame { frame, reply } => {
                    let _ = reply.send(self.add_frame(frame).await);
                }
                BuilderJob::Process { reply } => {
                    let _ = reply.send(self.process().await);
                }
                BuilderJob::Flush(done) => {
                    let (tx, rx) = oneshot::channel();
                    if self.background.send(Background::Flush(tx)).await.is_ok() {
                        let _ = rx.await;
                    }
                    let _ = done.send(());
                }
            }
        }
        debug!("builder lane stopped");
    }

    /// Run `f` on the blocking pool with the builder and the latest
    /// committed snapshot. A panic inside `f` comes back as `Ok(Err(msg))`
    /// and the builder stays in the lane.
    async fn run_blocking<T, F>(&mut self, f: F) -> Result<Result<T, String>, LarError>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn MapBuilder, &MapSnapshot) -> T + Send + 'static,
    {
        let mut builder = self
            .builder
            .take()
            .ok_or_else(|| LarError::Builder("map builder unavailable".to_string()))?;
        let snapshot = self.state.borrow().map.clone();
        let (builder, out) = tokio::task::spawn_blocking(move || {
            let out = panic::catch_unwind(AssertUnwindSafe(|| f(builder.as_mut(), &snapshot)))
                .map_err(|payload| panic_message(payload.as_ref()));
            (builder, out)
        })
        .await
        .map_err(|e| {
            error!(error = %e, "map builder task failed");
            LarError::Builder(format!("map builder task failed: {e}"))
        })?;
        self.builder = Some(builder);
        if let Err(message) = &out {
            error!(panic = %message, "map builder panicked");
        }
        Ok(out)
    }

    async fn add_frame(&mut self, frame: Arc<Frame>) -> Result<FrameOutcome, LarError> {
        let input = Arc::clone(&frame);
        let proposal = self.run_blocking(move |b, map| b.add_frame(map, &input)).await?;
        let delta = match proposal {
            Ok(Ok(delta)) => delta,
            Ok(Err(err)) => {
                warn!(error = %err, "frame skipped by builder");
                return Ok(FrameOutcome::Skipped {
                    reason: err.to_string(),
                });
            }
            Err(message) => {
                return Ok(FrameOutcome::Skipped {
                    reason: format!("map builder panicked: {message}"),
                });
            }
        };
        let (created, updated) = (delta.created.len(), delta.updated.len());

        let (reply, ack) = oneshot::channel();
        self.background
            .send(Background::CommitFrame {
                frame,
                delta,
                reply,
            })
            .await
            .map_err(|_| LarError::MapperClosed)?;
        match ack.await.map_err(|_| LarError::MapperClosed)? {
            Ok(frame_id) => Ok(FrameOutcome::Ingested {
                frame_id,
                created,
                updated,
            }),
            Err(err) => Ok(FrameOutcome::Skipped {
                reason: err.to_string(),
            }),
        }
    }

    async fn process(&mut self) -> Result<ProcessReport, LarError> {
        let (delta, base) = self
            .run_blocking(|b, map| b.process(map).map(|d| (d, map.revision())))
            .await?
            .map_err(|message| LarError::Builder(format!("map builder panicked: {message}")))??;
        bump(&self.counters.process_passes, 1);
        if delta.is_empty() {
            return Ok(ProcessReport {
                revision: base,
                changed: 0,
            });
        }
        let changed = delta.created.len() + delta.updated.len();

        let (reply, ack) = oneshot::channel();
        self.background
            .send(Background::CommitLandmarks { delta, reply })
            .await
            .map_err(|_| LarError::MapperClosed)?;
        let change = ack.await.map_err(|_| LarError::MapperClosed)??;
        Ok(ProcessReport {
            revision: change.revision,
            changed,
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// LiveMapper
// ─────────────────────────────────────────────────────────────────────────────

/// Handle to a running mapping session. Share it behind an `Arc`.
pub struct LiveMapper {
    session_id: Uuid,
    created_at: DateTime<Utc>,
    interactive: mpsc::Sender<Interactive>,
    background: mpsc::Sender<Background>,
    builder: mpsc::Sender<BuilderJob>,
    state: watch::Receiver<SessionState>,
    counters: Arc<Counters>,
    pose_limiter: Option<DefaultDirectRateLimiter>,
    store: Arc<dyn SessionStore>,
    bus: Arc<EventBus>,
    persist_lock: Mutex<()>,
    tasks: Vec<JoinHandle<()>>,
}

fn pose_limiter(max_rate_hz: f64) -> Option<DefaultDirectRateLimiter> {
    if !(max_rate_hz.is_finite() && max_rate_hz > 0.0) {
        return None;
    }
    let period = Duration::from_secs_f64(1.0 / max_rate_hz.max(1e-3));
    Quota::with_period(period).map(RateLimiter::direct)
}

impl LiveMapper {
    /// Start a session over a fresh map. Must be called inside a Tokio
    /// runtime.
    pub fn start(
        config: MapperConfig,
        builder: Box<dyn MapBuilder>,
        store: Arc<dyn SessionStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self::start_with_map(config, Map::new(), builder, store, bus)
    }

    /// Start a session that continues an existing map.
    pub fn start_with_map(
        config: MapperConfig,
        map: Map,
        builder: Box<dyn MapBuilder>,
        store: Arc<dyn SessionStore>,
        bus: Arc<EventBus>,
    ) -> Self {
        let counters = Arc::new(Counters::default());
        let (state_tx, state_rx) = watch::channel(SessionState {
            map: map.snapshot(),
            frames: Arc::default(),
            user_location: None,
        });
        let (interactive_tx, interactive_rx) = mpsc::channel(config.interactive_capacity.max(1));
        let (background_tx, background_rx) = mpsc::channel(config.background_capacity.max(1));
        let (builder_tx, builder_rx) = mpsc::channel(config.builder_capacity.max(1));

        let writer = Writer {
            map,
            frames: Arc::default(),
            trajectory: Trajectory::new(config.trajectory_capacity),
            locator: UserLocator::new(config.location_hysteresis_m),
            user_location: None,
            state_tx,
            bus: Arc::clone(&bus),
            counters: Arc::clone(&counters),
        };
        let lane = BuilderLane {
            builder: Some(builder),
            state: state_rx.clone(),
            background: background_tx.clone(),
            counters: Arc::clone(&counters),
        };
        let tasks = vec![
            tokio::spawn(writer.run(interactive_rx, background_rx, config.interactive_weight)),
            tokio::spawn(lane.run(builder_rx)),
        ];

        let session_id = Uuid::new_v4();
        info!(
            session = %session_id,
            location = %store.location().display(),
            interactive_weight = config.interactive_weight,
            "live mapper started"
        );
        Self {
            session_id,
            created_at: Utc::now(),
            interactive: interactive_tx,
            background: background_tx,
            builder: builder_tx,
            state: state_rx,
            counters,
            pose_limiter: pose_limiter(config.max_pose_rate_hz),
            store,
            bus,
            persist_lock: Mutex::new(()),
            tasks,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn location(&self) -> PathBuf {
        self.store.location().to_path_buf()
    }

    // ── Ingestion ────────────────────────────────────────────────────────────

    /// Hand a frame to the builder and commit its proposal. Resolves after
    /// the commit (or the skip) and after the frame was written to disk.
    #[instrument(skip_all, fields(features = frame.features.len()))]
    pub async fn add_frame(&self, frame: Frame) -> Result<FrameOutcome, LarError> {
        let frame = Arc::new(frame);
        let (reply, outcome) = oneshot::channel();
        self.builder
            .send(BuilderJob::AddFrame {
                frame: Arc::clone(&frame),
                reply,
            })
            .await
            .map_err(|_| LarError::MapperClosed)?;
        let outcome = outcome.await.map_err(|_| LarError::MapperClosed)??;

        match &outcome {
            FrameOutcome::Ingested { frame_id, .. } => {
                bump(&self.counters.frames_ingested, 1);
                let id = *frame_id;
                self.persist("write_frame", move |store| store.write_frame(id, &frame))
                    .await?;
            }
            FrameOutcome::Skipped { reason } => {
                bump(&self.counters.frames_skipped, 1);
                self.bus.publish_to(
                    Topic::SessionAlerts,
                    Event::new(
                        SOURCE,
                        EventPayload::FrameSkipped {
                            reason: reason.clone(),
                        },
                    ),
                );
            }
        }
        Ok(outcome)
    }

    /// Record a pose sample. Never waits: returns `false` if the sample was
    /// rate limited or the queue was full.
    pub fn add_position(&self, sample: PoseSample) -> bool {
        if let Some(limiter) = &self.pose_limiter {
            if limiter.check().is_err() {
                bump(&self.counters.poses_dropped, 1);
                return false;
            }
        }
        match self.background.try_send(Background::Pose(sample)) {
            Ok(()) => {
                bump(&self.counters.poses_accepted, 1);
                if let Err(TrySendError::Full(_)) =
                    self.builder.try_send(BuilderJob::Position(sample))
                {
                    debug!("builder busy, pose not forwarded");
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                bump(&self.counters.poses_dropped, 1);
                debug!("background queue full, pose dropped");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Pair each fix with the interpolated local position at its timestamp
    /// and append it to the GPS log. Returns how many were accepted.
    pub async fn add_locations(&self, fixes: Vec<GpsFix>) -> Result<usize, LarError> {
        if fixes.is_empty() {
            return Ok(0);
        }
        let (reply, accepted) = oneshot::channel();
        self.background
            .send(Background::Locations { fixes, reply })
            .await
            .map_err(|_| LarError::MapperClosed)?;
        accepted.await.map_err(|_| LarError::MapperClosed)?
    }

    /// Run one builder optimization pass and commit its result. Calls queue
    /// behind each other and behind pending frames.
    #[instrument(skip_all)]
    pub async fn process(&self) -> Result<ProcessReport, LarError> {
        let (reply, report) = oneshot::channel();
        self.builder
            .send(BuilderJob::Process { reply })
            .await
            .map_err(|_| LarError::MapperClosed)?;
        let report = report.await.map_err(|_| LarError::MapperClosed)??;
        info!(revision = report.revision, changed = report.changed, "optimization pass committed");
        Ok(report)
    }

    // ── User actions ─────────────────────────────────────────────────────────

    pub async fn place_anchor(
        &self,
        name: impl Into<String>,
        transform: Transform,
    ) -> Result<AnchorId, LarError> {
        let (reply, change) = oneshot::channel();
        self.interactive
            .send(Interactive::PlaceAnchor {
                name: name.into(),
                transform,
                reply,
            })
            .await
            .map_err(|_| LarError::MapperClosed)?;
        match change.await.map_err(|_| LarError::MapperClosed)??.kind {
            MapChangeKind::AnchorAdded { id } => Ok(id),
            other => Err(LarError::Invariant {
                rule: "add_anchor".to_string(),
                details: format!("unexpected change {other:?}"),
            }),
        }
    }

    /// Move the map origin so the map lines up with the device's current
    /// tracking frame. The old origin is removed and the new one added in a
    /// single revision.
    pub async fn relocate_origin(
        &self,
        localization: &Localization,
        camera_pose: &Transform,
    ) -> Result<MapChange, LarError> {
        let transform = origin_in_tracking_frame(localization, camera_pose);
        let (reply, change) = oneshot::channel();
        self.interactive
            .send(Interactive::ReplaceOrigin { transform, reply })
            .await
            .map_err(|_| LarError::MapperClosed)?;
        let change = change.await.map_err(|_| LarError::MapperClosed)??;
        info!(revision = change.revision, inliers = localization.inliers, "map origin relocated");
        Ok(change)
    }

    // ── Persistence ──────────────────────────────────────────────────────────

    /// Persist the session log. Safe to call any number of times.
    pub async fn write_metadata(&self) -> Result<SessionMetadata, LarError> {
        let _guard = self.persist_lock.lock().await;
        let metadata = self.metadata();
        let written = metadata.clone();
        self.persist("write_metadata", move |store| store.write_metadata(&written))
            .await?;
        debug!(frames = metadata.frame_count, revision = metadata.map_revision, "metadata written");
        Ok(metadata)
    }

    /// Persist the full map in a reloadable form.
    pub async fn save_map(&self) -> Result<PathBuf, LarError> {
        let _guard = self.persist_lock.lock().await;
        let archive = self.snapshot().to_archive();
        let (revision, landmarks) = (archive.revision, archive.landmarks.len());
        let path = self
            .persist("save_map", move |store| store.save_map(&archive))
            .await?;
        info!(path = %path.display(), revision, landmarks, "map saved");
        Ok(path)
    }

    fn metadata(&self) -> SessionMetadata {
        let state = self.state.borrow().clone();
        SessionMetadata {
            session_id: self.session_id,
            created_at: self.created_at,
            updated_at: Utc::now(),
            map_revision: state.map.revision(),
            frame_count: state.frames.len(),
            frames: state.frames.as_ref().clone(),
            gps_observations: state.map.gps_observations().to_vec(),
            landmark_count: state.map.landmark_count(),
            usable_landmark_count: state.map.usable_landmark_count(),
        }
    }

    async fn persist<T, F>(&self, operation: &'static str, f: F) -> Result<T, LarError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn SessionStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let err = match tokio::task::spawn_blocking(move || f(store.as_ref())).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(e)) => e.into_lar(operation),
            Err(e) => LarError::Persistence {
                operation: operation.to_string(),
                details: e.to_string(),
            },
        };
        error!(operation, error = %err, "persistence failure");
        self.bus.publish_to(
            Topic::SessionAlerts,
            Event::new(
                SOURCE,
                EventPayload::PersistenceFault {
                    operation: operation.to_string(),
                    message: err.to_string(),
                },
            ),
        );
        Err(err)
    }

    // ── Readers ──────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> MapSnapshot {
        self.state.borrow().map.clone()
    }

    pub fn landmarks(&self) -> Vec<Landmark> {
        self.snapshot().landmarks().cloned().collect()
    }

    pub fn anchors(&self) -> Vec<Anchor> {
        self.snapshot().anchors().cloned().collect()
    }

    pub fn gps_observations(&self) -> Vec<GpsObservation> {
        self.snapshot().gps_observations().to_vec()
    }

    pub fn user_location(&self) -> Option<GeodeticPoint> {
        self.state.borrow().user_location
    }

    pub fn frame_count(&self) -> usize {
        self.state.borrow().frames.len()
    }

    pub fn stats(&self) -> MapperStats {
        self.counters.read()
    }

    /// Receiver that is notified after every committed writer step.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    /// Wait until every frame, pose and fix handed in so far is committed.
    pub async fn flush(&self) -> Result<(), LarError> {
        let (done, flushed) = oneshot::channel();
        self.builder
            .send(BuilderJob::Flush(done))
            .await
            .map_err(|_| LarError::MapperClosed)?;
        flushed.await.map_err(|_| LarError::MapperClosed)
    }

    /// Stop accepting work, let both tasks drain their queues, and join
    /// them.
    pub async fn shutdown(self) {
        let LiveMapper {
            interactive,
            background,
            builder,
            tasks,
            ..
        } = self;
        drop((interactive, background, builder));
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "live mapper task failed");
            }
        }
        info!("live mapper stopped");
    }
}

impl SnapshotSource for LiveMapper {
    fn snapshot(&self) -> MapSnapshot {
        LiveMapper::snapshot(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
