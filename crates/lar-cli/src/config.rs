//! Configuration – reads/writes `~/.lar/config.toml`.

use lar_runtime::{BuilderConfig, MapperConfig, TrackerConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Persisted user configuration stored in `~/.lar/config.toml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Directory under which each session gets its own folder.
    #[serde(default = "default_sessions_root")]
    pub sessions_root: PathBuf,

    /// HTTP/WebSocket port of the cockpit.
    #[serde(default = "default_cockpit_port")]
    pub cockpit_port: u16,

    /// Landmark cap for each scene pushed to the cockpit.
    #[serde(default = "default_max_rendered_landmarks")]
    pub max_rendered_landmarks: usize,

    #[serde(default)]
    pub mapper: MapperConfig,

    #[serde(default)]
    pub builder: BuilderConfig,

    #[serde(default)]
    pub tracker: TrackerConfig,
}

fn home_dir() -> String {
    std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .unwrap_or_else(|_| ".".to_string())
}

fn default_sessions_root() -> PathBuf {
    PathBuf::from(home_dir()).join(".lar").join("sessions")
}
fn default_cockpit_port() -> u16 {
    lar_cockpit::DEFAULT_PORT
}
fn default_max_rendered_landmarks() -> usize {
    lar_cockpit::DEFAULT_MAX_LANDMARKS
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sessions_root: default_sessions_root(),
            cockpit_port: default_cockpit_port(),
            max_rendered_landmarks: default_max_rendered_landmarks(),
            mapper: MapperConfig::default(),
            builder: BuilderConfig::default(),
            tracker: TrackerConfig::default(),
        }
    }
}

/// Return the path to `~/.lar/config.toml`.
pub fn config_path() -> PathBuf {
    config_path_for_home(&home_dir())
}

pub(crate) fn config_path_for_home(home: &str) -> PathBuf {
    PathBuf::from(home).join(".lar").join("config.toml")
}

/// Load the config from disk with environment overrides applied. Returns
/// `None` if the file does not exist.
pub fn load() -> Result<Option<Config>, String> {
    let mut cfg = load_from(&config_path())?;
    if let Some(cfg) = cfg.as_mut() {
        apply_env_overrides(cfg);
    }
    Ok(cfg)
}

/// Parse the config at `path` as written, without overrides.
pub(crate) fn load_from(path: &Path) -> Result<Option<Config>, String> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = fs::read_to_string(path)
        .map_err(|e| format!("Failed to read config at {}: {}", path.display(), e))?;
    toml::from_str(&raw)
        .map(Some)
        .map_err(|e| format!("Failed to parse config: {}", e))
}

/// Apply `LAR_*` environment variable overrides to `cfg`. Values that do
/// not parse are ignored.
///
/// | Variable | Config field |
/// |---|---|
/// | `LAR_SESSIONS_ROOT` | `sessions_root` |
/// | `LAR_COCKPIT_PORT` | `cockpit_port` |
/// | `LAR_MAX_RENDERED_LANDMARKS` | `max_rendered_landmarks` |
/// | `LAR_MAX_POSE_RATE_HZ` | `mapper.max_pose_rate_hz` |
pub fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(v) = std::env::var("LAR_SESSIONS_ROOT")
        && !v.trim().is_empty()
    {
        cfg.sessions_root = PathBuf::from(v);
    }
    if let Ok(v) = std::env::var("LAR_COCKPIT_PORT")
        && let Ok(port) = v.parse::<u16>()
    {
        cfg.cockpit_port = port;
    }
    if let Ok(v) = std::env::var("LAR_MAX_RENDERED_LANDMARKS")
        && let Ok(max) = v.parse::<usize>()
    {
        cfg.max_rendered_landmarks = max;
    }
    if let Ok(v) = std::env::var("LAR_MAX_POSE_RATE_HZ")
        && let Ok(hz) = v.parse::<f64>()
        && hz.is_finite()
        && hz >= 0.0
    {
        cfg.mapper.max_pose_rate_hz = hz;
    }
}

/// Save the config to disk, creating `~/.lar/` if necessary.
pub fn save(cfg: &Config) -> Result<(), String> {
    save_to(cfg, &config_path())
}

pub(crate) fn save_to(cfg: &Config, path: &Path) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(parent, fs::Permissions::from_mode(0o700))
                .map_err(|e| format!("Failed to set config directory permissions: {}", e))?;
        }
    }
    let raw = toml::to_string_pretty(cfg)
        .map_err(|e| format!("Failed to serialize config: {}", e))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)
            .and_then(|mut f| {
                use std::io::Write;
                f.write_all(raw.as_bytes())
            })
            .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    }
    #[cfg(not(unix))]
    fs::write(path, raw)
        .map_err(|e| format!("Failed to write config at {}: {}", path.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[test]
    fn config_file_has_restrictive_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        save_to(&Config::default(), &path).expect("save");

        let file_mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(file_mode, 0o600);
        let dir_mode = fs::metadata(path.parent().unwrap()).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o700);
    }

    #[test]
    fn roundtrip_default_config() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());

        let cfg = Config::default();
        save_to(&cfg, &path).expect("save");

        let loaded = load_from(&path).expect("load ok").expect("some");
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.max_rendered_landmarks, 1000);
        assert_eq!(loaded.mapper.interactive_weight, 4);
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("config.toml");
        fs::write(&path, "cockpit_port = 9001\n\n[mapper]\ninteractive_weight = 2\n").unwrap();

        let loaded = load_from(&path).unwrap().unwrap();
        assert_eq!(loaded.cockpit_port, 9001);
        assert_eq!(loaded.mapper.interactive_weight, 2);
        assert_eq!(loaded.mapper.background_capacity, MapperConfig::default().background_capacity);
        assert_eq!(loaded.tracker, TrackerConfig::default());
    }

    #[test]
    fn config_path_points_to_lar_dir() {
        let p = config_path_for_home("/home/testuser");
        assert_eq!(p, PathBuf::from("/home/testuser/.lar/config.toml"));
    }

    #[test]
    fn load_from_returns_none_when_missing() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = config_path_for_home(&dir.path().to_string_lossy());
        assert!(load_from(&path).expect("no error").is_none());
    }

    #[test]
    fn apply_env_overrides_changes_cockpit_port() {
        // SAFETY: no other test in this crate touches this variable.
        unsafe { std::env::set_var("LAR_COCKPIT_PORT", "9999") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.cockpit_port, 9999);
        unsafe { std::env::remove_var("LAR_COCKPIT_PORT") };
    }

    #[test]
    fn apply_env_overrides_ignores_invalid_landmark_cap() {
        // SAFETY: no other test in this crate touches this variable.
        unsafe { std::env::set_var("LAR_MAX_RENDERED_LANDMARKS", "lots") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.max_rendered_landmarks, 1000);
        unsafe { std::env::remove_var("LAR_MAX_RENDERED_LANDMARKS") };
    }

    #[test]
    fn apply_env_overrides_changes_pose_rate() {
        // SAFETY: no other test in this crate touches this variable.
        unsafe { std::env::set_var("LAR_MAX_POSE_RATE_HZ", "15.5") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.mapper.max_pose_rate_hz, 15.5);
        unsafe { std::env::remove_var("LAR_MAX_POSE_RATE_HZ") };
    }

    #[test]
    fn apply_env_overrides_changes_sessions_root() {
        // SAFETY: no other test in this crate touches this variable.
        unsafe { std::env::set_var("LAR_SESSIONS_ROOT", "/data/lar") };
        let mut cfg = Config::default();
        apply_env_overrides(&mut cfg);
        assert_eq!(cfg.sessions_root, PathBuf::from("/data/lar"));
        unsafe { std::env::remove_var("LAR_SESSIONS_ROOT") };
    }
}
