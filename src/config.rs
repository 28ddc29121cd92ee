use regex::Regex;
use serde::{Deserialize, Serialize};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

const DEFAULT_OUTPUT_ROOT: &str = "/data/output";
const DEFAULT_DATABASE: &str = "gis";
const DEFAULT_DB_USER: &str = "postgres";
const DEFAULT_MIN_ZOOM: u8 = 0;
const DEFAULT_MAX_ZOOM: u8 = 6;
const DEFAULT_CACHE_MB: u32 = 2000;
const DEFAULT_PROGRESS_INTERVAL: u64 = 1000;
const DEFAULT_SOCKET_PATH: &str = "/run/renderd/renderd.sock";
const DEFAULT_READY_ATTEMPTS: u32 = 30;
const DEFAULT_READY_INTERVAL_MS: u64 = 1000;
/// Every non-blank line counts as one rendered tile unless overridden.
const DEFAULT_TILE_LINE_PATTERN: &str = r"\S";
/// renderd refuses zoom levels above this.
pub const MAX_SUPPORTED_ZOOM: u8 = 20;

const DEFAULT_PLUGIN_DIRS: &[&str] = &[
    "/usr/lib/mapnik/4.0/input",
    "/usr/lib/mapnik/3.1/input",
    "/usr/lib/mapnik/3.0/input",
    "/usr/lib/x86_64-linux-gnu/mapnik/4.0/input",
    "/usr/lib/x86_64-linux-gnu/mapnik/3.1/input",
    "/usr/lib/aarch64-linux-gnu/mapnik/4.0/input",
    "/usr/lib/aarch64-linux-gnu/mapnik/3.1/input",
    "/usr/local/lib/mapnik/input",
];

const DEFAULT_FONT_DIRS: &[&str] = &[
    "/usr/share/fonts/truetype",
    "/usr/share/fonts",
    "/usr/local/share/fonts",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    #[error("Failed to parse {field}: {error}")]
    ParseError { field: String, error: String },

    #[error("Failed to read config file {}: {error}", .path.display())]
    Io { path: PathBuf, error: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProgressMode {
    /// One generation call for the whole zoom range, progress sampled every N tiles.
    Interval,
    /// One generation call per zoom level.
    PerZoom,
}

impl FromStr for ProgressMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "interval" => Ok(ProgressMode::Interval),
            "per-zoom" | "perzoom" | "zoom" => Ok(ProgressMode::PerZoom),
            other => Err(format!(
                "Invalid progress mode: {}. Valid options: interval, per-zoom",
                other
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageSelector {
    Import,
    Render,
    All,
}

impl StageSelector {
    pub fn includes_import(&self) -> bool {
        matches!(self, StageSelector::Import | StageSelector::All)
    }

    pub fn includes_render(&self) -> bool {
        matches!(self, StageSelector::Render | StageSelector::All)
    }
}

impl fmt::Display for StageSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            StageSelector::Import => "import",
            StageSelector::Render => "render",
            StageSelector::All => "all",
        })
    }
}

impl FromStr for StageSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "import" => Ok(StageSelector::Import),
            "render" => Ok(StageSelector::Render),
            "all" => Ok(StageSelector::All),
            other => Err(format!(
                "Invalid stage: {}. Valid options: import, render, all",
                other
            )),
        }
    }
}

/// Bounded retry schedule for readiness polling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    pub attempts: u32,
    pub interval: Duration,
}

impl PollSettings {
    pub fn new(attempts: u32, interval: Duration) -> Self {
        Self { attempts, interval }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_READY_ATTEMPTS,
            interval: Duration::from_millis(DEFAULT_READY_INTERVAL_MS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub source: Option<PathBuf>,
    pub output_root: PathBuf,
    pub data_root: Option<PathBuf>,
    pub database: String,
    pub db_user: String,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub cache_mb: u32,
    pub import_processes: u32,
    pub render_threads: u32,
    pub flat_nodes: Option<PathBuf>,
    pub loader_extra_args: Vec<String>,
    pub reset: bool,
    pub progress_mode: ProgressMode,
    pub progress_interval: u64,
    pub log_file: Option<PathBuf>,
    pub stage: StageSelector,
    pub state_dir: Option<PathBuf>,
    pub socket_path: PathBuf,
    pub checkpoints: bool,
    pub manage_engine: bool,
    pub engine_ready: PollSettings,
    pub socket_ready: PollSettings,
    pub plugin_dirs: Vec<PathBuf>,
    pub font_dirs: Vec<PathBuf>,
    pub tile_line_pattern: String,
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

fn env_path(key: &str) -> Option<PathBuf> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
}

fn env_path_list(key: &str, defaults: &[&str]) -> Vec<PathBuf> {
    match env::var(key) {
        Ok(v) if !v.trim().is_empty() => env::split_paths(&v).collect(),
        _ => defaults.iter().map(PathBuf::from).collect(),
    }
}

fn available_cpus() -> u32 {
    std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(1)
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let cpus = available_cpus();

        let engine_ready = PollSettings {
            attempts: env_parse("TILEPIPE_ENGINE_READY_ATTEMPTS").unwrap_or(DEFAULT_READY_ATTEMPTS),
            interval: Duration::from_millis(
                env_parse("TILEPIPE_ENGINE_READY_INTERVAL_MS").unwrap_or(DEFAULT_READY_INTERVAL_MS),
            ),
        };
        let socket_ready = PollSettings {
            attempts: env_parse("TILEPIPE_SOCKET_READY_ATTEMPTS").unwrap_or(DEFAULT_READY_ATTEMPTS),
            interval: Duration::from_millis(
                env_parse("TILEPIPE_SOCKET_READY_INTERVAL_MS").unwrap_or(DEFAULT_READY_INTERVAL_MS),
            ),
        };

        let loader_extra_args = env::var("TILEPIPE_LOADER_EXTRA_ARGS")
            .ok()
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        Self {
            source: env_path("TILEPIPE_SOURCE"),
            output_root: env_path("TILEPIPE_OUTPUT_ROOT")
                .unwrap_or_else(|| PathBuf::from(DEFAULT_OUTPUT_ROOT)),
            data_root: env_path("TILEPIPE_DATA_ROOT"),
            database: env::var("TILEPIPE_DATABASE").unwrap_or_else(|_| DEFAULT_DATABASE.to_string()),
            db_user: env::var("TILEPIPE_DB_USER").unwrap_or_else(|_| DEFAULT_DB_USER.to_string()),
            min_zoom: env_parse("TILEPIPE_MIN_ZOOM").unwrap_or(DEFAULT_MIN_ZOOM),
            max_zoom: env_parse("TILEPIPE_MAX_ZOOM").unwrap_or(DEFAULT_MAX_ZOOM),
            cache_mb: env_parse("TILEPIPE_CACHE_MB").unwrap_or(DEFAULT_CACHE_MB),
            import_processes: env_parse("TILEPIPE_IMPORT_PROCESSES").unwrap_or(cpus),
            render_threads: env_parse("TILEPIPE_RENDER_THREADS").unwrap_or(cpus),
            flat_nodes: env_path("TILEPIPE_FLAT_NODES"),
            loader_extra_args,
            reset: env_parse("TILEPIPE_RESET").unwrap_or(false),
            progress_mode: env_parse("TILEPIPE_PROGRESS_MODE").unwrap_or(ProgressMode::Interval),
            progress_interval: env_parse("TILEPIPE_PROGRESS_INTERVAL")
                .unwrap_or(DEFAULT_PROGRESS_INTERVAL),
            log_file: env_path("TILEPIPE_LOG_FILE"),
            stage: env_parse("TILEPIPE_STAGE").unwrap_or(StageSelector::All),
            state_dir: env_path("TILEPIPE_STATE_DIR"),
            socket_path: env_path("TILEPIPE_SOCKET_PATH")
                .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH)),
            checkpoints: env_parse("TILEPIPE_CHECKPOINTS").unwrap_or(true),
            manage_engine: env_parse("TILEPIPE_MANAGE_ENGINE").unwrap_or(true),
            engine_ready,
            socket_ready,
            plugin_dirs: env_path_list("TILEPIPE_PLUGIN_DIRS", DEFAULT_PLUGIN_DIRS),
            font_dirs: env_path_list("TILEPIPE_FONT_DIRS", DEFAULT_FONT_DIRS),
            tile_line_pattern: env::var("TILEPIPE_TILE_LINE_PATTERN")
                .unwrap_or_else(|_| DEFAULT_TILE_LINE_PATTERN.to_string()),
        }
    }
}

impl PipelineConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_zoom > self.max_zoom {
            return Err(ConfigError::ValidationFailed(format!(
                "Minimum zoom ({}) cannot exceed maximum zoom ({})",
                self.min_zoom, self.max_zoom
            )));
        }
        if self.max_zoom > MAX_SUPPORTED_ZOOM {
            return Err(ConfigError::ValidationFailed(format!(
                "Maximum zoom cannot exceed {}",
                MAX_SUPPORTED_ZOOM
            )));
        }

        if self.database.is_empty()
            || !self
                .database
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_')
        {
            return Err(ConfigError::ValidationFailed(format!(
                "Invalid database name: '{}'. Use letters, digits and underscores",
                self.database
            )));
        }

        if self.cache_mb == 0 {
            return Err(ConfigError::ValidationFailed(
                "Cache size must be at least 1 MB".to_string(),
            ));
        }
        if self.import_processes == 0 {
            return Err(ConfigError::ValidationFailed(
                "Import process count must be at least 1".to_string(),
            ));
        }
        if self.render_threads == 0 {
            return Err(ConfigError::ValidationFailed(
                "Render thread count must be at least 1".to_string(),
            ));
        }

        if self.engine_ready.attempts == 0 || self.socket_ready.attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "Readiness polling needs at least 1 attempt".to_string(),
            ));
        }

        Regex::new(&self.tile_line_pattern).map_err(|e| ConfigError::ParseError {
            field: "tile_line_pattern".to_string(),
            error: e.to_string(),
        })?;

        Ok(())
    }

    pub fn tile_dir(&self) -> PathBuf {
        self.output_root.join("tiles")
    }

    pub fn style_dir(&self) -> PathBuf {
        self.output_root.join("style")
    }

    pub fn session_log_path(&self) -> PathBuf {
        self.log_file
            .clone()
            .unwrap_or_else(|| self.output_root.join("render.log"))
    }

    pub fn state_dir_path(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| self.output_root.join(".tilepipe-state"))
    }

    /// Overlays values present in `file` on top of this configuration.
    pub fn apply_file(&mut self, file: FileConfig) {
        macro_rules! overlay {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = file.$field { self.$field = v; })*
            };
        }
        overlay!(
            output_root,
            database,
            db_user,
            min_zoom,
            max_zoom,
            cache_mb,
            import_processes,
            render_threads,
            loader_extra_args,
            reset,
            progress_mode,
            progress_interval,
            stage,
            socket_path,
            checkpoints,
            manage_engine,
            plugin_dirs,
            font_dirs,
            tile_line_pattern,
        );

        if file.source.is_some() {
            self.source = file.source;
        }
        if file.data_root.is_some() {
            self.data_root = file.data_root;
        }
        if file.flat_nodes.is_some() {
            self.flat_nodes = file.flat_nodes;
        }
        if file.log_file.is_some() {
            self.log_file = file.log_file;
        }
        if file.state_dir.is_some() {
            self.state_dir = file.state_dir;
        }
        if let Some(attempts) = file.engine_ready_attempts {
            self.engine_ready.attempts = attempts;
        }
        if let Some(ms) = file.engine_ready_interval_ms {
            self.engine_ready.interval = Duration::from_millis(ms);
        }
        if let Some(attempts) = file.socket_ready_attempts {
            self.socket_ready.attempts = attempts;
        }
        if let Some(ms) = file.socket_ready_interval_ms {
            self.socket_ready.interval = Duration::from_millis(ms);
        }
    }
}

/// On-disk TOML configuration. Every key is optional.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub source: Option<PathBuf>,
    pub output_root: Option<PathBuf>,
    pub data_root: Option<PathBuf>,
    pub database: Option<String>,
    pub db_user: Option<String>,
    pub min_zoom: Option<u8>,
    pub max_zoom: Option<u8>,
    pub cache_mb: Option<u32>,
    pub import_processes: Option<u32>,
    pub render_threads: Option<u32>,
    pub flat_nodes: Option<PathBuf>,
    pub loader_extra_args: Option<Vec<String>>,
    pub reset: Option<bool>,
    pub progress_mode: Option<ProgressMode>,
    pub progress_interval: Option<u64>,
    pub log_file: Option<PathBuf>,
    pub stage: Option<StageSelector>,
    pub state_dir: Option<PathBuf>,
    pub socket_path: Option<PathBuf>,
    pub checkpoints: Option<bool>,
    pub manage_engine: Option<bool>,
    pub engine_ready_attempts: Option<u32>,
    pub engine_ready_interval_ms: Option<u64>,
    pub socket_ready_attempts: Option<u32>,
    pub socket_ready_interval_ms: Option<u64>,
    pub plugin_dirs: Option<Vec<PathBuf>>,
    pub font_dirs: Option<Vec<PathBuf>>,
    pub tile_line_pattern: Option<String>,
}

impl FileConfig {
    /// `<user config dir>/tilepipe/config.toml`, used when no file is given explicitly.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("tilepipe").join("config.toml"))
    }

    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::ParseError {
            field: "config file".to_string(),
            error: e.to_string(),
        })
    }
}
