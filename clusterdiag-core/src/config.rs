//! Configuration loading and management
//!
//! Configuration is loaded from `~/.config/clusterdiag/config.toml`
//!
//! This module follows the XDG Base Directory Specification:
//! - Config: `$XDG_CONFIG_HOME/clusterdiag/` (~/.config/clusterdiag/)
//! - Data: `$XDG_DATA_HOME/clusterdiag/` (~/.local/share/clusterdiag/)
//! - State/Logs: `$XDG_STATE_HOME/clusterdiag/` (~/.local/state/clusterdiag/)
//!
//! In a real deployment `storage.root` points at the file share mounted by
//! every instance; the XDG data dir is only a single-host fallback.

use crate::error::{Error, Result};
use crate::types::DiagnosticTool;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Returns a best-effort home directory path.
fn home_dir() -> PathBuf {
    std::env::var_os("HOME")
        .map(PathBuf::from)
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Returns XDG_CONFIG_HOME or ~/.config
fn xdg_config_home() -> PathBuf {
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".config"))
}

/// Returns XDG_DATA_HOME or ~/.local/share
fn xdg_data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/share"))
}

/// Returns XDG_STATE_HOME or ~/.local/state
fn xdg_state_home() -> PathBuf {
    std::env::var("XDG_STATE_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| home_dir().join(".local/state"))
}

/// Main configuration struct
#[derive(Debug, Deserialize, Default)]
pub struct Config {
    /// Shared storage locations
    #[serde(default)]
    pub storage: StorageConfig,

    /// Session lock retry policy
    #[serde(default)]
    pub lock: LockConfig,

    /// Permanent artifact storage
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Identity overrides for this instance
    #[serde(default)]
    pub instance: InstanceConfig,

    /// Session lifecycle settings
    #[serde(default)]
    pub session: SessionConfig,

    /// External capture programs
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Shared and local storage locations
#[derive(Debug, Deserialize, Default, Clone)]
pub struct StorageConfig {
    /// Root of the shared store holding `active/` and `completed/`
    pub root: Option<PathBuf>,
    /// Instance-local scratch space for in-progress captures
    pub scratch_root: Option<PathBuf>,
}

impl StorageConfig {
    /// Configured shared root, or `$XDG_DATA_HOME/clusterdiag/sessions`
    pub fn root(&self) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| Config::data_dir().join("sessions"))
    }

    /// Configured scratch root, or `<tmp>/clusterdiag`
    pub fn scratch_root(&self) -> PathBuf {
        self.scratch_root
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("clusterdiag"))
    }
}

/// Retry policy for acquiring a session lock
#[derive(Debug, Deserialize, Clone)]
pub struct LockConfig {
    /// Attempts before the marker is presumed orphaned
    #[serde(default = "default_lock_max_attempts")]
    pub max_attempts: u32,

    /// Delay between attempts in milliseconds
    #[serde(default = "default_lock_retry_interval")]
    pub retry_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_lock_max_attempts(),
            retry_interval_ms: default_lock_retry_interval(),
        }
    }
}

impl LockConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }
}

fn default_lock_max_attempts() -> u32 {
    60
}

fn default_lock_retry_interval() -> u64 {
    1000
}

/// Permanent artifact storage
#[derive(Debug, Deserialize, Clone)]
pub struct ArchiveConfig {
    /// Archive root (defaults to `<storage.root>/logs`)
    pub root: Option<PathBuf>,

    /// Host identifier used in externally reachable paths
    #[serde(default = "default_archive_host")]
    pub host: String,

    /// Archive location as exposed by the virtual file system
    #[serde(default = "default_archive_vfs_path")]
    pub vfs_path: String,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            root: None,
            host: default_archive_host(),
            vfs_path: default_archive_vfs_path(),
        }
    }
}

impl ArchiveConfig {
    /// Configured archive root, or `<storage_root>/logs`
    pub fn root(&self, storage_root: &Path) -> PathBuf {
        self.root
            .clone()
            .unwrap_or_else(|| storage_root.join("logs"))
    }
}

fn default_archive_host() -> String {
    "localhost".to_string()
}

fn default_archive_vfs_path() -> String {
    "data/diagnostics/logs".to_string()
}

/// Identity overrides for this instance
#[derive(Debug, Deserialize, Default, Clone)]
pub struct InstanceConfig {
    /// Full instance identifier
    pub id: Option<String>,
    /// Short identifier used to prefix archived file names
    pub short_id: Option<String>,
}

/// Session lifecycle settings
#[derive(Debug, Deserialize, Clone)]
pub struct SessionConfig {
    /// Minutes after which an unfinished session is force-completed
    #[serde(default = "default_max_duration_minutes")]
    pub max_duration_minutes: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_duration_minutes: default_max_duration_minutes(),
        }
    }
}

impl SessionConfig {
    pub fn max_duration(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.max_duration_minutes as i64)
    }
}

fn default_max_duration_minutes() -> u64 {
    30
}

/// External capture programs, one per tool
#[derive(Debug, Deserialize, Default, Clone)]
pub struct ToolsConfig {
    pub memory_dump: Option<ToolCommandConfig>,
    pub profiler: Option<ToolCommandConfig>,
}

impl ToolsConfig {
    /// Command configured for `tool`, if any
    pub fn command_for(&self, tool: DiagnosticTool) -> Option<&ToolCommandConfig> {
        match tool {
            DiagnosticTool::MemoryDump => self.memory_dump.as_ref(),
            DiagnosticTool::Profiler => self.profiler.as_ref(),
        }
    }
}

/// A capture program and its arguments.
///
/// Arguments may contain `{params}`, `{output_dir}` and `{instance}`
/// placeholders, substituted per invocation.
#[derive(Debug, Deserialize, Clone)]
pub struct ToolCommandConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// Logging configuration
#[derive(Debug, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Maximum number of log files to keep
    #[serde(default = "default_max_log_files")]
    pub max_files: usize,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            max_files: default_max_log_files(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_max_log_files() -> usize {
    5
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path();

        if !config_path.exists() {
            tracing::info!("No config file found at {:?}, using defaults", config_path);
            return Ok(Config::default());
        }

        Self::load_from(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("failed to read config file {:?}: {}", path, e)))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| Error::Config(format!("failed to parse config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration, returning error message if invalid
    pub fn validate(&self) -> Result<()> {
        if self.lock.max_attempts == 0 {
            return Err(Error::Config(
                "lock.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.archive.host.trim().is_empty() {
            return Err(Error::Config("archive.host must not be empty".to_string()));
        }
        for tool in DiagnosticTool::ALL {
            if let Some(cmd) = self.tools.command_for(tool) {
                if cmd.command.trim().is_empty() {
                    return Err(Error::Config(format!(
                        "tools.{}.command must not be empty",
                        tool
                    )));
                }
            }
        }
        Ok(())
    }

    /// Returns the default config file path
    ///
    /// `$XDG_CONFIG_HOME/clusterdiag/config.toml` (~/.config/clusterdiag/config.toml)
    pub fn config_path() -> PathBuf {
        xdg_config_home().join("clusterdiag").join("config.toml")
    }

    /// Returns the data directory path
    ///
    /// `$XDG_DATA_HOME/clusterdiag/` (~/.local/share/clusterdiag/)
    pub fn data_dir() -> PathBuf {
        xdg_data_home().join("clusterdiag")
    }

    /// Returns the state directory path (for logs)
    ///
    /// `$XDG_STATE_HOME/clusterdiag/` (~/.local/state/clusterdiag/)
    pub fn state_dir() -> PathBuf {
        xdg_state_home().join("clusterdiag")
    }

    /// Returns the log file path
    ///
    /// `$XDG_STATE_HOME/clusterdiag/clusterdiag.log` (~/.local/state/clusterdiag/clusterdiag.log)
    pub fn log_path() -> PathBuf {
        Self::state_dir().join("clusterdiag.log")
    }

    /// Ensure XDG base directory environment variables are set.
    ///
    /// This is mainly for CLI binaries that want explicit, stable path behavior
    /// before invoking other components that read these env vars.
    pub fn ensure_xdg_env() {
        let home = home_dir();

        if std::env::var("XDG_DATA_HOME").is_err() {
            std::env::set_var("XDG_DATA_HOME", home.join(".local/share"));
        }

        if std::env::var("XDG_STATE_HOME").is_err() {
            std::env::set_var("XDG_STATE_HOME", home.join(".local/state"));
        }

        if std::env::var("XDG_CONFIG_HOME").is_err() {
            std::env::set_var("XDG_CONFIG_HOME", home.join(".config"));
        }
    }
}
