//! REPL – Read-Eval-Print Loop for the `lar` interactive shell.
//!
//! Supported slash-commands:
//!   /snap                       – capture a frame, write metadata, optimize
//!   /optimize                   – run one map optimization pass
//!   /localize                   – localize the current frame in the loaded map
//!   /save                       – save the map and session metadata
//!   /load <path>                – load a saved map for localization
//!   /track                      – localize against the live session map
//!   /anchor <name> <x> <y> <z>  – place a user anchor
//!   /gps <lat> <lon> [accuracy] – feed a GPS fix
//!   /walk <steps>               – run the simulated device for `steps` poses
//!   /replay <file>              – feed a JSON-Lines recording
//!   /record <file> <steps>      – record a simulated walk
//!   /cockpit                    – start the debug visualization server
//!   /status                     – session counters
//!   /help                       – show this list
//!   /quit | /exit               – write metadata and exit
//!
//! The device is a [`SimScene`]; its step counter is the session clock.

use colored::Colorize;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use lar_cockpit::CockpitServer;
use lar_hal::{CaptureEvent, CaptureSource, ReplaySource, ReplayWriter, SimScene, SimSceneConfig};
use lar_kernel::SnapshotSource;
use lar_middleware::{EventBus, Topic};
use lar_runtime::{DescriptorMapBuilder, FrameOutcome, LiveMapper, Tracker};
use lar_store::DirectoryStore;
use lar_types::{Event, EventPayload, GeodeticPoint, GpsFix, LarError, Transform};
use nalgebra::{Translation3, UnitQuaternion};
use tokio::runtime::Runtime;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::config::Config;

// ─────────────────────────────────────────────────────────────────────────────
// Command parsing
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Snap,
    Optimize,
    Localize,
    Save,
    Load(PathBuf),
    Track,
    Anchor { name: String, position: [f64; 3] },
    Gps { latitude: f64, longitude: f64, accuracy: f64 },
    Walk(u64),
    Replay(PathBuf),
    Record { path: PathBuf, steps: u64 },
    Cockpit,
    Status,
    Help,
    Quit,
}

const DEFAULT_GPS_ACCURACY_M: f64 = 5.0;

fn arg<T: std::str::FromStr>(value: Option<&str>, what: &str) -> Result<T, String> {
    let raw = value.ok_or_else(|| format!("missing {what}"))?;
    raw.parse()
        .map_err(|_| format!("'{raw}' is not a valid {what}"))
}

fn finite(value: f64, what: &str) -> Result<f64, String> {
    if value.is_finite() {
        Ok(value)
    } else {
        Err(format!("{what} must be finite"))
    }
}

/// Parse one input line into a [`Command`].
pub fn parse(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let head = words.next().ok_or_else(|| "empty command".to_string())?;
    let args: Vec<&str> = words.collect();
    let at = |i: usize| args.get(i).copied();

    let cmd = match head {
        "/snap" => Command::Snap,
        "/optimize" => Command::Optimize,
        "/localize" => Command::Localize,
        "/save" => Command::Save,
        "/load" => Command::Load(PathBuf::from(at(0).ok_or("usage: /load <path>")?)),
        "/track" => Command::Track,
        "/anchor" => {
            if args.len() != 4 {
                return Err("usage: /anchor <name> <x> <y> <z>".to_string());
            }
            Command::Anchor {
                name: args[0].to_string(),
                position: [
                    finite(arg(at(1), "x")?, "x")?,
                    finite(arg(at(2), "y")?, "y")?,
                    finite(arg(at(3), "z")?, "z")?,
                ],
            }
        }
        "/gps" => {
            let latitude: f64 = arg(at(0), "latitude")?;
            let longitude: f64 = arg(at(1), "longitude")?;
            if !(-90.0..=90.0).contains(&latitude) || !(-180.0..=180.0).contains(&longitude) {
                return Err("coordinate out of range".to_string());
            }
            let accuracy = match at(2) {
                Some(_) => finite(arg(at(2), "accuracy")?, "accuracy")?,
                None => DEFAULT_GPS_ACCURACY_M,
            };
            Command::Gps {
                latitude,
                longitude,
                accuracy,
            }
        }
        "/walk" => Command::Walk(arg(at(0), "step count")?),
        "/replay" => Command::Replay(PathBuf::from(at(0).ok_or("usage: /replay <file>")?)),
        "/record" => Command::Record {
            path: PathBuf::from(at(0).ok_or("usage: /record <file> <steps>")?),
            steps: arg(at(1), "step count")?,
        },
        "/cockpit" => Command::Cockpit,
        "/status" => Command::Status,
        "/help" => Command::Help,
        "/quit" | "/exit" => Command::Quit,
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(cmd)
}

// ─────────────────────────────────────────────────────────────────────────────
// Shell
// ─────────────────────────────────────────────────────────────────────────────

/// Session state behind the prompt.
pub struct Shell {
    rt: Runtime,
    cfg: Config,
    bus: Arc<EventBus>,
    mapper: Arc<LiveMapper>,
    tracker: Arc<Tracker>,
    device: Arc<SimScene>,
    step: u64,
    cockpit: Option<JoinHandle<()>>,
}

impl Shell {
    /// Create a session directory and start the live mapper.
    pub fn start(cfg: Config) -> Result<Self, String> {
        let rt = Runtime::new().map_err(|e| format!("Failed to start runtime: {e}"))?;
        let store = DirectoryStore::create_session(&cfg.sessions_root)
            .map_err(|e| format!("Failed to create session: {e}"))?;
        let bus = Arc::new(EventBus::default());
        let mapper = {
            let _guard = rt.enter();
            LiveMapper::start(
                cfg.mapper.clone(),
                Box::new(DescriptorMapBuilder::new(cfg.builder.clone())),
                Arc::new(store),
                Arc::clone(&bus),
            )
        };
        Ok(Self {
            rt,
            cfg,
            bus,
            mapper: Arc::new(mapper),
            tracker: Arc::new(Tracker::default()),
            device: Arc::new(SimScene::new(SimSceneConfig::default())),
            step: 0,
            cockpit: None,
        })
    }

    pub fn session_dir(&self) -> PathBuf {
        self.mapper.location()
    }

    /// Run one command. Returns `false` when the shell should exit.
    pub fn execute(&mut self, cmd: Command) -> bool {
        let result = match cmd {
            Command::Snap => self.snap(),
            Command::Optimize => self.optimize(),
            Command::Localize => self.localize(),
            Command::Save => self.save(),
            Command::Load(path) => self.load(path),
            Command::Track => {
                self.track();
                Ok(())
            }
            Command::Anchor { name, position } => self.anchor(name, position),
            Command::Gps {
                latitude,
                longitude,
                accuracy,
            } => self.gps(GeodeticPoint::new(latitude, longitude), accuracy),
            Command::Walk(steps) => self.walk(steps),
            Command::Replay(path) => self.replay(path),
            Command::Record { path, steps } => self.record(path, steps),
            Command::Cockpit => self.cockpit(),
            Command::Status => {
                self.status();
                Ok(())
            }
            Command::Help => {
                cmd_help();
                Ok(())
            }
            Command::Quit => {
                self.quit();
                return false;
            }
        };
        if let Err(e) = result {
            println!("{}: {}", "Error".red(), e);
        }
        true
    }

    /// Capture sample: ingest the current frame, persist the session log,
    /// then run one optimization pass. The cockpit redraws from the
    /// resulting map updates.
    fn snap(&mut self) -> Result<(), LarError> {
        let frame = self.device.frame_at(self.step);
        self.step += 1;
        match self.rt.block_on(self.mapper.add_frame(frame))? {
            FrameOutcome::Ingested {
                frame_id,
                created,
                updated,
            } => println!(
                "  {} frame {} ({} new, {} updated landmarks)",
                "✓".green(),
                frame_id.to_string().bold(),
                created,
                updated
            ),
            FrameOutcome::Skipped { reason } => {
                println!("  {} frame skipped: {}", "⚠".yellow(), reason);
                return Ok(());
            }
        }
        self.rt.block_on(self.mapper.write_metadata())?;
        self.optimize()
    }

    fn optimize(&mut self) -> Result<(), LarError> {
        let report = self.rt.block_on(self.mapper.process())?;
        println!(
            "  {} revision {} ({} landmarks changed)",
            "✓".green(),
            report.revision.to_string().bold(),
            report.changed
        );
        Ok(())
    }

    fn localize(&mut self) -> Result<(), LarError> {
        if !self.tracker.is_bound() {
            println!(
                "  No map bound. Use {} or {} first.",
                "/track".bold(),
                "/load <path>".bold()
            );
            return Ok(());
        }
        let frame = self.device.frame_at(self.step);
        let camera_pose = frame.camera_pose;
        let tracker = Arc::clone(&self.tracker);
        let Some(loc) = self.rt.block_on(tracker.localize_in_background(frame)) else {
            self.bus.publish_to(
                Topic::Localization,
                Event::new(
                    "lar-cli",
                    EventPayload::LocalizationFailed {
                        reason: "no consistent pose".to_string(),
                    },
                ),
            );
            println!("  {} not localized", "✗".red());
            return Ok(());
        };
        self.bus.publish_to(
            Topic::Localization,
            Event::new(
                "lar-cli",
                EventPayload::Localized {
                    matched: loc.matches,
                    inliers: loc.inliers,
                    transform: loc.transform,
                },
            ),
        );
        let t = loc.transform.translation.vector;
        println!(
            "  {} localized: {} inliers of {} matches, rms {:.3} m, camera at ({:.2}, {:.2}, {:.2})",
            "✓".green(),
            loc.inliers,
            loc.matches,
            loc.rms_error_m,
            t.x,
            t.y,
            t.z
        );
        let change = self
            .rt
            .block_on(self.mapper.relocate_origin(&loc, &camera_pose))?;
        println!("  map origin relocated (revision {})", change.revision);
        Ok(())
    }

    fn save(&mut self) -> Result<(), LarError> {
        let path = self.rt.block_on(self.mapper.save_map())?;
        let metadata = self.rt.block_on(self.mapper.write_metadata())?;
        println!(
            "  {} map saved to {} ({} landmarks, {} frames)",
            "✓".green(),
            path.display().to_string().bold(),
            metadata.landmark_count,
            metadata.frame_count
        );
        Ok(())
    }

    fn load(&mut self, path: PathBuf) -> Result<(), LarError> {
        let tracker = Tracker::load(&path, self.cfg.tracker.clone())?;
        println!(
            "  {} loaded {} ({} usable landmarks)",
            "✓".green(),
            path.display().to_string().bold(),
            tracker.usable_landmark_count()
        );
        self.tracker = Arc::new(tracker);
        Ok(())
    }

    /// Bind the tracker to the map as committed right now.
    fn track(&mut self) {
        let tracker = Tracker::new(self.mapper.snapshot(), self.cfg.tracker.clone());
        println!(
            "  {} tracking against the live map (revision {}, {} usable landmarks)",
            "✓".green(),
            tracker.map().map_or(0, |m| m.revision()),
            tracker.usable_landmark_count()
        );
        self.tracker = Arc::new(tracker);
    }

    fn anchor(&mut self, name: String, [x, y, z]: [f64; 3]) -> Result<(), LarError> {
        let transform = Transform::from_parts(Translation3::new(x, y, z), UnitQuaternion::identity());
        let id = self.rt.block_on(self.mapper.place_anchor(name.clone(), transform))?;
        println!("  {} anchor {} '{}'", "✓".green(), id.0, name.bold());
        Ok(())
    }

    fn gps(&mut self, coordinate: GeodeticPoint, accuracy: f64) -> Result<(), LarError> {
        // Feed the device position at the same instant so the fix can be
        // paired with a local position.
        self.mapper.add_position(self.device.pose_at(self.step));
        let fix = GpsFix {
            timestamp: self.device.timestamp_at(self.step),
            coordinate,
            horizontal_accuracy: accuracy,
            altitude: None,
        };
        let accepted = self.rt.block_on(self.mapper.add_locations(vec![fix]))?;
        if accepted == 0 {
            println!("  {} fix dropped (stale)", "⚠".yellow());
        } else {
            println!("  {} fix recorded", "✓".green());
        }
        self.step += 1;
        Ok(())
    }

    /// Drive poses, frames and fixes from three concurrent producers.
    fn walk(&mut self, steps: u64) -> Result<(), LarError> {
        let (start, end) = (self.step, self.step + steps);
        let frame_every = self.device.config().frame_interval.max(1) as usize;
        let gps_every = self.device.config().gps_interval.max(1) as usize;

        let poses = {
            let (mapper, device) = (Arc::clone(&self.mapper), Arc::clone(&self.device));
            self.rt.spawn(async move {
                for step in start..end {
                    mapper.add_position(device.pose_at(step));
                    tokio::task::yield_now().await;
                }
                Ok::<(), LarError>(())
            })
        };
        let frames = {
            let (mapper, device) = (Arc::clone(&self.mapper), Arc::clone(&self.device));
            self.rt.spawn(async move {
                for step in (start..end).step_by(frame_every) {
                    mapper.add_frame(device.frame_at(step)).await?;
                }
                Ok::<(), LarError>(())
            })
        };
        let fixes = {
            let (mapper, device) = (Arc::clone(&self.mapper), Arc::clone(&self.device));
            self.rt.spawn(async move {
                for step in (start..end).step_by(gps_every) {
                    mapper.add_locations(vec![device.fix_at(step)]).await?;
                    tokio::task::yield_now().await;
                }
                Ok::<(), LarError>(())
            })
        };

        for task in [poses, frames, fixes] {
            self.rt
                .block_on(task)
                .map_err(|e| LarError::Channel(format!("producer task failed: {e}")))??;
        }
        self.step = end;
        let stats = self.mapper.stats();
        println!(
            "  {} walked {} steps ({} frames, {} poses accepted / {} dropped, {} fixes)",
            "✓".green(),
            steps,
            stats.frames_ingested,
            stats.poses_accepted,
            stats.poses_dropped,
            stats.gps_accepted
        );
        Ok(())
    }

    fn replay(&mut self, path: PathBuf) -> Result<(), LarError> {
        let mut source = ReplaySource::open(&path)?;
        let mut events = 0usize;
        while let Some(event) = source.next_event()? {
            debug!(kind = event.kind(), "replaying event");
            match event {
                CaptureEvent::Pose(sample) => {
                    self.mapper.add_position(sample);
                }
                CaptureEvent::Frame(frame) => {
                    self.rt.block_on(self.mapper.add_frame(frame))?;
                }
                CaptureEvent::Locations(fixes) => {
                    self.rt.block_on(self.mapper.add_locations(fixes))?;
                }
            }
            events += 1;
        }
        println!(
            "  {} replayed {} events from {}",
            "✓".green(),
            events,
            source.id().bold()
        );
        Ok(())
    }

    fn record(&mut self, path: PathBuf, steps: u64) -> Result<(), LarError> {
        let mut source = SimScene::new(SimSceneConfig {
            max_steps: Some(steps),
            ..SimSceneConfig::default()
        });
        let mut writer = ReplayWriter::create(&path)?;
        writer.record_all(&mut source)?;
        let events = writer.finish()?;
        println!(
            "  {} recorded {} events to {}",
            "✓".green(),
            events,
            path.display().to_string().bold()
        );
        Ok(())
    }

    fn cockpit(&mut self) -> Result<(), LarError> {
        if self.cockpit.as_ref().is_some_and(|h| !h.is_finished()) {
            println!("  Cockpit already running on port {}", self.cfg.cockpit_port);
            return Ok(());
        }
        let source: Arc<dyn SnapshotSource> = self.mapper.clone();
        let server = CockpitServer::new(Arc::clone(&self.bus), source)
            .with_port(self.cfg.cockpit_port)
            .with_max_landmarks(self.cfg.max_rendered_landmarks);
        self.cockpit = Some(self.rt.spawn(async move {
            if let Err(e) = server.run().await {
                warn!(error = %e, "cockpit stopped");
            }
        }));
        println!(
            "  {} cockpit at {}",
            "✓".green(),
            format!("http://localhost:{}", self.cfg.cockpit_port).bold()
        );
        Ok(())
    }

    fn status(&self) {
        let snapshot = self.mapper.snapshot();
        let stats = self.mapper.stats();
        println!("{}", "Session".bold().underline());
        println!("  session     : {}", self.mapper.session_id());
        println!("  directory   : {}", self.session_dir().display());
        println!("  revision    : {}", snapshot.revision());
        println!(
            "  landmarks   : {} ({} usable)",
            snapshot.landmark_count(),
            snapshot.usable_landmark_count()
        );
        println!("  anchors     : {}", snapshot.anchors().count());
        println!("  gps fixes   : {}", snapshot.gps_observations().len());
        println!("  frames      : {}", self.mapper.frame_count());
        println!("  device step : {}", self.step);
        match self.mapper.user_location() {
            Some(p) => println!("  user        : {:.6}, {:.6}", p.latitude, p.longitude),
            None => println!("  user        : {}", "not georeferenced".dimmed()),
        }
        println!(
            "  tracker     : {}",
            if self.tracker.is_bound() {
                format!("{} usable landmarks", self.tracker.usable_landmark_count()).green()
            } else {
                "unbound".dimmed()
            }
        );
        match serde_json::to_string(&stats) {
            Ok(json) => println!("  stats       : {}", json.dimmed()),
            Err(e) => debug!(error = %e, "stats serialization failed"),
        }
    }

    fn quit(&mut self) {
        if let Some(handle) = self.cockpit.take() {
            handle.abort();
        }
        if let Err(e) = self.rt.block_on(self.mapper.flush()) {
            println!("{}: {}", "Error draining the mapper".red(), e);
        }
        match self.rt.block_on(self.mapper.write_metadata()) {
            Ok(m) => println!(
                "  {} session metadata written ({} frames)",
                "✓".green(),
                m.frame_count
            ),
            Err(e) => println!("{}: {}", "Error writing metadata".red(), e),
        }
        println!("{}", "Goodbye.".green());
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
pub fn run(mut shell: Shell, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            shell.execute(Command::Quit);
            break;
        }

        print!("{} ", "lar>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => {
                shell.execute(Command::Quit);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let input = line.trim();
        if input.is_empty() {
            continue;
        }

        match parse(input) {
            Ok(cmd) => {
                if !shell.execute(cmd) {
                    break;
                }
            }
            Err(e) => println!(
                "{} {}. Type {} for available commands.",
                "Error:".red(),
                e.yellow(),
                "/help".bold()
            ),
        }
    }
}

fn cmd_help() {
    println!();
    println!("{}", "lar Commands".bold().underline());
    println!("  {}                       – capture, save metadata, optimize", "/snap".bold().cyan());
    println!("  {}                   – run one optimization pass", "/optimize".bold().cyan());
    println!("  {}                   – localize in the loaded map", "/localize".bold().cyan());
    println!("  {}                       – save map and metadata", "/save".bold().cyan());
    println!("  {}                – load a saved map", "/load <path>".bold().cyan());
    println!("  {}                      – localize in the live map", "/track".bold().cyan());
    println!("  {}  – place a user anchor", "/anchor <name> <x> <y> <z>".bold().cyan());
    println!("  {} – feed a GPS fix", "/gps <lat> <lon> [accuracy]".bold().cyan());
    println!("  {}               – simulate a walk", "/walk <steps>".bold().cyan());
    println!("  {}              – replay a recording", "/replay <file>".bold().cyan());
    println!("  {}      – record a simulated walk", "/record <file> <steps>".bold().cyan());
    println!("  {}                    – start the debug view", "/cockpit".bold().cyan());
    println!("  {}                     – session counters", "/status".bold().cyan());
    println!("  {}                – exit", "/quit  /exit".bold().cyan());
    println!();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_argumentless_commands() {
        assert_eq!(parse("/snap"), Ok(Command::Snap));
        assert_eq!(parse("  /optimize  "), Ok(Command::Optimize));
        assert_eq!(parse("/exit"), Ok(Command::Quit));
        assert_eq!(parse("/track"), Ok(Command::Track));
    }

    #[test]
    fn parses_anchor() {
        assert_eq!(
            parse("/anchor door 1 0.5 -2"),
            Ok(Command::Anchor {
                name: "door".to_string(),
                position: [1.0, 0.5, -2.0]
            })
        );
        assert!(parse("/anchor door 1 2").is_err());
        assert!(parse("/anchor door 1 2 NaN").is_err());
    }

    #[test]
    fn gps_accuracy_is_optional() {
        assert_eq!(
            parse("/gps 47.37 8.54"),
            Ok(Command::Gps {
                latitude: 47.37,
                longitude: 8.54,
                accuracy: DEFAULT_GPS_ACCURACY_M
            })
        );
        assert_eq!(
            parse("/gps 47.37 8.54 2.5"),
            Ok(Command::Gps {
                latitude: 47.37,
                longitude: 8.54,
                accuracy: 2.5
            })
        );
        assert!(parse("/gps 147 8").is_err());
    }

    #[test]
    fn parses_paths_and_counts() {
        assert_eq!(parse("/load /tmp/s1"), Ok(Command::Load(PathBuf::from("/tmp/s1"))));
        assert_eq!(parse("/walk 300"), Ok(Command::Walk(300)));
        assert_eq!(
            parse("/record walk.jsonl 60"),
            Ok(Command::Record {
                path: PathBuf::from("walk.jsonl"),
                steps: 60
            })
        );
        assert!(parse("/walk far").is_err());
        assert!(parse("/load").is_err());
    }

    #[test]
    fn unknown_command_is_an_error() {
        assert_eq!(parse("/fly"), Err("unknown command '/fly'".to_string()));
    }

    fn test_shell(root: &std::path::Path) -> Shell {
        let cfg = Config {
            sessions_root: root.to_path_buf(),
            mapper: lar_runtime::MapperConfig {
                max_pose_rate_hz: 0.0,
                ..Default::default()
            },
            ..Config::default()
        };
        Shell::start(cfg).unwrap()
    }

    #[test]
    fn walk_save_and_localize_against_saved_map() {
        let root = tempfile::tempdir().unwrap();
        let mut shell = test_shell(root.path());

        assert!(shell.execute(Command::Walk(150)));
        assert!(shell.execute(Command::Optimize));
        assert!(shell.execute(Command::Save));
        let snapshot = shell.mapper.snapshot();
        assert!(snapshot.usable_landmark_count() > 0);
        let stats = shell.mapper.stats();
        assert_eq!(stats.gps_accepted + stats.gps_dropped, 5);
        assert_eq!(snapshot.gps_observations().len() as u64, stats.gps_accepted);

        let dir = shell.session_dir();
        assert!(shell.execute(Command::Load(dir)));
        assert!(shell.tracker.is_bound());

        shell.step = 60;
        let before = shell.mapper.snapshot().origin().unwrap().id;
        assert!(shell.execute(Command::Localize));
        let after = shell.mapper.snapshot();
        assert_ne!(after.origin().unwrap().id, before);
        assert_eq!(after.anchors().filter(|a| a.is_origin()).count(), 1);
    }

    #[test]
    fn record_then_replay_feeds_the_mapper() {
        let root = tempfile::tempdir().unwrap();
        let recording = root.path().join("walk.jsonl");
        let mut shell = test_shell(&root.path().join("sessions"));

        assert!(shell.execute(Command::Record {
            path: recording.clone(),
            steps: 45
        }));
        assert!(shell.execute(Command::Replay(recording)));
        assert_eq!(shell.mapper.frame_count(), 3);
        assert!(shell.mapper.snapshot().landmark_count() > 0);
    }

    #[test]
    fn quit_ends_the_loop_and_writes_metadata() {
        let root = tempfile::tempdir().unwrap();
        let mut shell = test_shell(root.path());
        assert!(shell.execute(Command::Snap));
        let dir = shell.session_dir();
        assert!(!shell.execute(Command::Quit));
        assert!(dir.join(lar_store::METADATA_FILE).exists());
    }

    #[test]
    fn snap_ingests_writes_metadata_and_optimizes() {
        let root = tempfile::tempdir().unwrap();
        let mut shell = test_shell(root.path());
        let mut updates = shell.bus.subscribe_to(Topic::MapUpdates);

        assert_eq!(parse("/snap"), Ok(Command::Snap));
        assert!(shell.execute(Command::Snap));
        assert!(shell.execute(Command::Snap));

        let stats = shell.mapper.stats();
        assert_eq!(stats.frames_ingested, 2);
        assert_eq!(stats.process_passes, 2);
        assert!(shell.mapper.snapshot().usable_landmark_count() > 0);

        let stored = DirectoryStore::open(&shell.session_dir())
            .unwrap()
            .read_metadata()
            .unwrap();
        assert_eq!(stored.frame_count, 2);

        let mut landmark_changes = 0;
        while let Ok(event) = updates.try_recv() {
            if matches!(
                event.payload,
                EventPayload::MapChanged(lar_types::MapChange {
                    kind: lar_types::MapChangeKind::LandmarksUpdated { .. },
                    ..
                })
            ) {
                landmark_changes += 1;
            }
        }
        // Two frame commits plus the optimization pass that promoted landmarks.
        assert!(landmark_changes >= 3, "saw {landmark_changes}");
    }

    #[test]
    fn track_binds_the_live_map_for_localization() {
        let root = tempfile::tempdir().unwrap();
        let mut shell = test_shell(root.path());

        assert!(shell.execute(Command::Localize));
        assert!(!shell.tracker.is_bound());

        assert!(shell.execute(Command::Walk(150)));
        assert!(shell.execute(Command::Optimize));
        assert!(shell.execute(Command::Track));
        assert!(shell.tracker.is_bound());
        assert_eq!(
            shell.tracker.map().unwrap().revision(),
            shell.mapper.snapshot().revision()
        );

        shell.step = 60;
        let before = shell.mapper.snapshot().origin().unwrap().id;
        assert!(shell.execute(Command::Localize));
        assert_ne!(shell.mapper.snapshot().origin().unwrap().id, before);
    }

    #[test]
    fn quit_commits_queued_frames_before_the_final_metadata() {
        let root = tempfile::tempdir().unwrap();
        let mut shell = test_shell(root.path());
        let frame = shell.device.frame_at(0);
        let mapper = Arc::clone(&shell.mapper);
        // Hand the frame to the builder lane and stop waiting for its commit.
        let _ = shell.rt.block_on(async {
            tokio::time::timeout(std::time::Duration::ZERO, mapper.add_frame(frame)).await
        });
        let dir = shell.session_dir();

        assert!(!shell.execute(Command::Quit));
        let stored = DirectoryStore::open(&dir).unwrap().read_metadata().unwrap();
        assert_eq!(stored.frame_count, 1);
    }
}
