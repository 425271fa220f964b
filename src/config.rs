//! TOML configuration.
//!
//! Lookup order: the `BYTEBITE_CONFIG` environment variable, then
//! `<data dir>/config.toml`, then compiled-in defaults. The data directory is
//! `BYTEBITE_DATA_DIR` or `~/bytebite-data`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub const CONFIG_ENV: &str = "BYTEBITE_CONFIG";
pub const DATA_DIR_ENV: &str = "BYTEBITE_DATA_DIR";
pub const CONFIG_FILE: &str = "config.toml";

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub gpio: GpioPins,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub offensive: OffensiveConfig,
    #[serde(default)]
    pub forensic: ForensicConfig,
    #[serde(default)]
    pub comparison: ComparisonConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "BYTEBITE_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let data_path = default_data_dir().join(CONFIG_FILE);
        if data_path.exists() {
            match Self::load(&data_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %data_path.display(),
                        error = %e,
                        "config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }

    /// Where `load_or_default` looks first.
    pub fn resolve_path() -> PathBuf {
        match std::env::var(CONFIG_ENV) {
            Ok(p) if !p.trim().is_empty() => PathBuf::from(p),
            _ => default_data_dir().join(CONFIG_FILE),
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let body = toml::to_string_pretty(self).context("failed to serialize configuration")?;
        std::fs::write(path, body)
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Configured logs directory; relative paths resolve against the data
    /// directory.
    pub fn logs_dir(&self) -> PathBuf {
        let configured = self.paths.logs_dir.trim();
        if configured.is_empty() {
            return default_logs_dir();
        }
        let dir = PathBuf::from(configured);
        if dir.is_absolute() {
            dir
        } else {
            default_data_dir().join(dir)
        }
    }

    /// Cumulative results database inside the logs directory.
    pub fn results_db(&self) -> PathBuf {
        self.logs_dir().join("results.db")
    }

    /// Markdown rendering of the results database.
    pub fn results_md(&self) -> PathBuf {
        self.logs_dir().join("results.md")
    }
}

pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var(DATA_DIR_ENV) {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir.trim());
        }
    }
    directories::BaseDirs::new()
        .map(|b| b.home_dir().join("bytebite-data"))
        .unwrap_or_else(|| PathBuf::from("bytebite-data"))
}

pub fn default_logs_dir() -> PathBuf {
    default_data_dir().join("logs")
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device serial passed as `adb -s`; empty selects the only device.
    #[serde(default)]
    pub serial: String,
    #[serde(default = "default_adb_bin")]
    pub adb_bin: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial: String::new(),
            adb_bin: default_adb_bin(),
        }
    }
}

fn default_adb_bin() -> String {
    "adb".to_string()
}

/// Physical button pins. Recorded in run metadata only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpioPins {
    #[serde(default = "default_start_pin")]
    pub start: u8,
    #[serde(default = "default_cancel_pin")]
    pub cancel: u8,
    #[serde(default = "default_view_pin")]
    pub view_logs: u8,
}

impl Default for GpioPins {
    fn default() -> Self {
        Self {
            start: default_start_pin(),
            cancel: default_cancel_pin(),
            view_logs: default_view_pin(),
        }
    }
}

fn default_start_pin() -> u8 {
    22
}
fn default_cancel_pin() -> u8 {
    27
}
fn default_view_pin() -> u8 {
    17
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Empty means `<data dir>/logs`.
    #[serde(default)]
    pub logs_dir: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffensiveConfig {
    #[serde(default = "default_marker_dir")]
    pub marker_dir: String,
    #[serde(default = "default_marker_file")]
    pub marker_file: String,
    #[serde(default = "default_trace_tag")]
    pub trace_tag: String,
    #[serde(default = "default_open_url")]
    pub open_url: String,
    #[serde(default)]
    pub test_apk_path: String,
    #[serde(default)]
    pub test_package: String,
    #[serde(default)]
    pub test_activity: String,
    #[serde(default = "default_true")]
    pub collect_network: bool,
}

impl Default for OffensiveConfig {
    fn default() -> Self {
        Self {
            marker_dir: default_marker_dir(),
            marker_file: default_marker_file(),
            trace_tag: default_trace_tag(),
            open_url: default_open_url(),
            test_apk_path: String::new(),
            test_package: String::new(),
            test_activity: String::new(),
            collect_network: true,
        }
    }
}

fn default_marker_dir() -> String {
    "/sdcard/ByteBiteDemo".to_string()
}
fn default_marker_file() -> String {
    crate::device::adb::DEFAULT_MARKER_FILE.to_string()
}
fn default_trace_tag() -> String {
    "ByteBiteDemo".to_string()
}
fn default_open_url() -> String {
    "https://example.com".to_string()
}
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForensicConfig {
    #[serde(default = "default_logcat_tail")]
    pub logcat_tail: u32,
    #[serde(default)]
    pub target_package: String,
    #[serde(default = "default_true")]
    pub pull_apk: bool,
    #[serde(default = "default_true")]
    pub collect_network: bool,
    #[serde(default)]
    pub root_mode: bool,
}

impl Default for ForensicConfig {
    fn default() -> Self {
        Self {
            logcat_tail: default_logcat_tail(),
            target_package: String::new(),
            pull_apk: true,
            collect_network: true,
            root_mode: false,
        }
    }
}

fn default_logcat_tail() -> u32 {
    1000
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComparisonConfig {
    /// Whether a differential run may execute its elevated phase at all.
    #[serde(default = "default_true")]
    pub run_root_phase: bool,
}

impl Default for ComparisonConfig {
    fn default() -> Self {
        Self {
            run_root_phase: true,
        }
    }
}
