//! Driver configuration: environment knobs and the optional JSON file.
//!
//! Everything is resolved once into a [`DriverConfig`] and handed to the
//! driver constructors; nothing reads the environment in a hot path.

use crate::Result;
use log::LevelFilter;
use serde::Deserialize;
use std::path::Path;

pub const CONFIG_PATH_ENV: &str = "XRT_CONFIG_PATH";

pub fn read_env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn parse_bool(v: &str) -> Option<bool> {
    match v.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn read_env_i32(name: &str, default: i32) -> i32 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<i32>().ok())
        .unwrap_or(default)
}

pub fn read_env_string(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Parses a log level name; accepts the full names and their first letter.
pub fn parse_log_level(v: &str) -> Option<LevelFilter> {
    match v.trim().to_ascii_lowercase().as_str() {
        "trace" | "t" => Some(LevelFilter::Trace),
        "debug" | "d" => Some(LevelFilter::Debug),
        "info" | "i" => Some(LevelFilter::Info),
        "warn" | "w" | "warning" => Some(LevelFilter::Warn),
        "error" | "e" => Some(LevelFilter::Error),
        "off" | "none" => Some(LevelFilter::Off),
        _ => None,
    }
}

/// Reads a `*_LOG` variable, defaulting to `Warn`.
pub fn read_env_log_level(name: &str) -> LevelFilter {
    std::env::var(name)
        .ok()
        .and_then(|v| parse_log_level(&v))
        .unwrap_or(LevelFilter::Warn)
}

/// Resolved per-driver log levels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLevels {
    pub psmv: LevelFilter,
    pub v4l2: LevelFilter,
    pub android: LevelFilter,
    pub realsense: LevelFilter,
    pub depthai: LevelFilter,
    pub wmr: LevelFilter,
    pub sink: LevelFilter,
}

impl LogLevels {
    pub fn from_env() -> Self {
        Self {
            psmv: read_env_log_level("PSMV_LOG"),
            v4l2: read_env_log_level("V4L2_LOG"),
            android: read_env_log_level("ANDROID_SENSORS_LOG"),
            realsense: read_env_log_level("RS_LOG"),
            depthai: read_env_log_level("DEPTHAI_LOG"),
            wmr: read_env_log_level("WMR_LOG"),
            sink: read_env_log_level("SINK_LOG"),
        }
    }
}

impl Default for LogLevels {
    fn default() -> Self {
        Self {
            psmv: LevelFilter::Warn,
            v4l2: LevelFilter::Warn,
            android: LevelFilter::Warn,
            realsense: LevelFilter::Warn,
            depthai: LevelFilter::Warn,
            wmr: LevelFilter::Warn,
            sink: LevelFilter::Warn,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub slam: bool,
    pub hand_tracking: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct RealSenseConfig {
    pub stereo: bool,
    pub video_width: u32,
    pub video_height: u32,
    pub video_fps: u32,
    pub gyro_fps: u32,
    pub accel_fps: u32,
    pub stream1_index: u32,
    pub stream2_index: u32,
}

impl Default for RealSenseConfig {
    fn default() -> Self {
        Self {
            stereo: true,
            video_width: 640,
            video_height: 360,
            video_fps: 30,
            gyro_fps: 200,
            accel_fps: 250,
            stream1_index: 1,
            stream2_index: 2,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct V4l2Config {
    /// Device node, e.g. `/dev/video0`.
    pub device: Option<String>,
    pub exposure_absolute: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PsmvConfig {
    /// Overrides the rotating default ball colour.
    pub led_color: Option<[u8; 3]>,
}

/// Contents of the JSON config file. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFile {
    pub tracking: TrackingConfig,
    pub realsense: RealSenseConfig,
    pub v4l2: V4l2Config,
    pub psmv: PsmvConfig,
}

const KNOWN_KEYS: &[&str] = &["tracking", "realsense", "v4l2", "psmv"];

impl ConfigFile {
    /// Parses a config document; unknown top-level keys are logged and skipped.
    pub fn parse(text: &str) -> Result<ConfigFile> {
        let root: serde_json::Value = serde_json::from_str(text)?;
        let obj = match root {
            serde_json::Value::Object(obj) => obj,
            _ => {
                return Err(crate::XrError::InvalidArgument(
                    "config root must be a JSON object".into(),
                ))
            }
        };

        let mut cfg = ConfigFile::default();
        for (key, value) in obj {
            match key.as_str() {
                "tracking" => cfg.tracking = serde_json::from_value(value)?,
                "realsense" => cfg.realsense = serde_json::from_value(value)?,
                "v4l2" => cfg.v4l2 = serde_json::from_value(value)?,
                "psmv" => cfg.psmv = serde_json::from_value(value)?,
                other => {
                    log::warn!(
                        "Ignoring unknown config key '{}' (known: {})",
                        other,
                        KNOWN_KEYS.join(", ")
                    );
                }
            }
        }
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<ConfigFile> {
        let text = std::fs::read_to_string(path)?;
        log::info!("Loaded config from {}", path.display());
        Self::parse(&text)
    }
}

/// Everything a driver needs from its environment, resolved up front.
#[derive(Debug, Clone, PartialEq)]
pub struct DriverConfig {
    pub log: LogLevels,
    /// `OHMD_ALLOW_FINITE_DIFF`
    pub allow_finite_diff: bool,
    /// `V4L2_EXPOSURE_ABSOLUTE`
    pub v4l2_exposure_absolute: i32,
    pub file: ConfigFile,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            log: LogLevels::default(),
            allow_finite_diff: true,
            v4l2_exposure_absolute: 10,
            file: ConfigFile::default(),
        }
    }
}

impl DriverConfig {
    /// Reads the environment knobs and, if `XRT_CONFIG_PATH` is set, the
    /// JSON file. A broken config file is logged and replaced by defaults.
    pub fn from_env() -> Self {
        let path = std::env::var(CONFIG_PATH_ENV).ok().filter(|p| !p.is_empty());
        let file = match path {
            Some(p) => ConfigFile::load(Path::new(&p)).unwrap_or_else(|e| {
                log::error!("Failed to load config '{}': {}", p, e);
                ConfigFile::default()
            }),
            None => ConfigFile::default(),
        };
        Self::from_env_with_file(file)
    }

    pub fn from_env_with_file(file: ConfigFile) -> Self {
        let exposure = file
            .v4l2
            .exposure_absolute
            .unwrap_or_else(|| read_env_i32("V4L2_EXPOSURE_ABSOLUTE", 10));
        Self {
            log: LogLevels::from_env(),
            allow_finite_diff: read_env_bool("OHMD_ALLOW_FINITE_DIFF", true),
            v4l2_exposure_absolute: exposure,
            file,
        }
    }
}
