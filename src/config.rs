//! Configuration loading.
//!
//! Precedence is env > file > defaults. The file is `$TOLLGATE_CONFIG_PATH`
//! or `./tollgate.toml`; a missing file is not an error.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::kernel::replay::ReplayMode;
use crate::tools::CAPABILITY_TOOL;

/// Name of the directory created under the user's home for persistent state.
const DATA_DIR_NAME: &str = ".tollgate";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TollgateConfig {
    /// Kernel settings.
    pub kernel: KernelConfig,
    /// Filesystem locations.
    pub paths: PathsConfig,
    /// Per-tool overrides of the built-in catalogue, keyed by tool name.
    pub tools: BTreeMap<String, ToolOverride>,
}

impl TollgateConfig {
    /// Load configuration from file, then apply environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config file path using a custom env resolver.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("TOLLGATE_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("tollgate.toml"))
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function so tests never touch the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("TOLLGATE_LOG_LEVEL") {
            self.kernel.log_level = v;
        }
        if let Some(v) = env("TOLLGATE_EVENT_BUFFER") {
            match v.parse() {
                Ok(n) => self.kernel.event_buffer = n,
                Err(_) => tracing::warn!(
                    var = "TOLLGATE_EVENT_BUFFER",
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env("TOLLGATE_DATA_DIR") {
            self.paths.data_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = env("TOLLGATE_DATABASE") {
            self.paths.database = Some(PathBuf::from(v));
        }
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed or has wrongly typed values.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Self = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }
}

// ── Kernel config ───────────────────────────────────────────────

/// Kernel core settings (`[kernel]`).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KernelConfig {
    /// Tracing filter used when `RUST_LOG` is unset.
    pub log_level: String,
    /// Per-observer event channel capacity. Slow observers lose the oldest events.
    pub event_buffer: usize,
    /// Replay mode given to newly created sessions.
    pub default_replay_mode: ReplayMode,
    /// Tool that additionally requires the session capability flag.
    pub capability_tool: String,
    /// Working directory recorded for new sessions. Defaults to the process cwd.
    pub working_dir: Option<PathBuf>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            event_buffer: 256,
            default_replay_mode: ReplayMode::Off,
            capability_tool: CAPABILITY_TOOL.to_string(),
            working_dir: None,
        }
    }
}

// ── Paths config ────────────────────────────────────────────────

/// Filesystem paths for persistent state (`[paths]`).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root for all state. Defaults to `~/.tollgate`.
    pub data_dir: Option<PathBuf>,
    /// SQLite database file. Defaults to `{data_dir}/tollgate.db`.
    pub database: Option<PathBuf>,
    /// Directory for rotated JSON logs. Defaults to `{data_dir}/logs`.
    pub logs_dir: Option<PathBuf>,
}

impl PathsConfig {
    /// Resolved data directory.
    ///
    /// # Errors
    ///
    /// Returns an error if no data dir is configured and the home directory
    /// cannot be determined.
    pub fn data_dir(&self) -> Result<PathBuf> {
        match &self.data_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_data_dir(),
        }
    }

    /// Resolved SQLite database path.
    ///
    /// # Errors
    ///
    /// See [`PathsConfig::data_dir`].
    pub fn database(&self) -> Result<PathBuf> {
        match &self.database {
            Some(db) => Ok(db.clone()),
            None => Ok(self.data_dir()?.join("tollgate.db")),
        }
    }

    /// Resolved logs directory.
    ///
    /// # Errors
    ///
    /// See [`PathsConfig::data_dir`].
    pub fn logs_dir(&self) -> Result<PathBuf> {
        match &self.logs_dir {
            Some(dir) => Ok(dir.clone()),
            None => Ok(self.data_dir()?.join("logs")),
        }
    }
}

/// Resolve the default data directory (`~/.tollgate/`).
///
/// # Errors
///
/// Returns an error if the home directory cannot be determined.
pub fn default_data_dir() -> Result<PathBuf> {
    let home = directories::BaseDirs::new()
        .ok_or_else(|| anyhow::anyhow!("cannot determine home directory"))?;
    Ok(home.home_dir().join(DATA_DIR_NAME))
}

// ── Tool overrides ──────────────────────────────────────────────

/// Override of one built-in tool descriptor (`[tools.<name>]`).
///
/// Unset fields keep the catalogue value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ToolOverride {
    /// Maximum calls per turn.
    pub calls_per_turn: Option<u32>,
    /// Maximum bytes per turn. `0` removes the byte limit.
    pub bytes_per_turn: Option<u64>,
    /// Whether an explicit grant is needed.
    pub require_grant: Option<bool>,
    /// Whether the tool is refused outright in replay mode.
    pub deny_in_replay: Option<bool>,
}

// ── Tests ───────────────────────────────────────────────────────
