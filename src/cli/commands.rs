use crate::checkpoint::PipelineStage;
use crate::config::{PipelineConfig, PollSettings, ProgressMode, StageSelector};
use clap::{Args, Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

/// Resumable OSM import and tile rendering pipeline
#[derive(Parser, Debug)]
#[command(
    name = "tilepipe",
    about = "Resumable OSM import and tile rendering pipeline",
    version,
    long_about = "tilepipe imports an OpenStreetMap extract into PostGIS and renders map tiles \
                  from it. Each stage records a fingerprint of its inputs, so re-running with \
                  unchanged inputs skips work that is already done."
)]
pub struct CliArgs {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, value_name = "LEVEL", help = "Set logging level")]
    pub log_level: Option<String>,

    #[arg(short = 'v', long, global = true, help = "Debug-level logging")]
    pub verbose: bool,

    #[arg(
        short = 'q',
        long,
        global = true,
        conflicts_with = "verbose",
        help = "Quiet mode - only errors"
    )]
    pub quiet: bool,

    #[arg(
        long,
        global = true,
        value_name = "FILE",
        help = "TOML configuration file, applied over defaults and TILEPIPE_* variables"
    )]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    #[command(
        about = "Run the pipeline",
        long_about = "Runs the import stage, the render stage, or both.\n\n\
                      Examples:\n  \
                      tilepipe run --source /data/region.osm.pbf\n  \
                      tilepipe run import --source /data/region.osm.pbf --reset\n  \
                      tilepipe run render --max-zoom 12 --progress-mode per-zoom"
    )]
    Run(RunArgs),

    #[command(about = "Show recorded stage checkpoints")]
    Status(StatusArgs),

    #[command(
        about = "Clear stage checkpoints",
        long_about = "Clears the checkpoint of one stage and every stage downstream of it, \
                      or all checkpoints when no stage is given."
    )]
    ResetCheckpoints(ResetArgs),
}

/// Location of the checkpoint directory, shared by every command.
#[derive(Args, Debug, Clone, Default)]
pub struct StateLocation {
    #[arg(long, value_name = "DIR", help = "Output root (tiles, style, logs)")]
    pub output_root: Option<PathBuf>,

    #[arg(
        long,
        value_name = "DIR",
        help = "Checkpoint directory [default: <output-root>/.tilepipe-state]"
    )]
    pub state_dir: Option<PathBuf>,
}

impl StateLocation {
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(root) = &self.output_root {
            config.output_root = root.clone();
        }
        if let Some(dir) = &self.state_dir {
            config.state_dir = Some(dir.clone());
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    #[arg(value_enum, value_name = "STAGE", help = "Stages to run [default: all]")]
    pub stage: Option<StageArg>,

    #[command(flatten)]
    pub location: StateLocation,

    #[arg(short = 's', long, value_name = "FILE", help = "OSM extract to import")]
    pub source: Option<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Persistent database data directory")]
    pub data_root: Option<PathBuf>,

    #[arg(short = 'd', long, value_name = "NAME", help = "Target database")]
    pub database: Option<String>,

    #[arg(long, value_name = "USER", help = "Database user")]
    pub db_user: Option<String>,

    #[arg(long, value_name = "Z", help = "Lowest zoom level to render")]
    pub min_zoom: Option<u8>,

    #[arg(long, value_name = "Z", help = "Highest zoom level to render")]
    pub max_zoom: Option<u8>,

    #[arg(long, value_name = "MB", help = "Loader node cache size")]
    pub cache_mb: Option<u32>,

    #[arg(long, value_name = "N", help = "Loader process count")]
    pub processes: Option<u32>,

    #[arg(long, value_name = "N", help = "Render thread count")]
    pub threads: Option<u32>,

    #[arg(long, value_name = "FILE", help = "Flat node storage file for the loader")]
    pub flat_nodes: Option<PathBuf>,

    #[arg(
        long = "loader-arg",
        value_name = "ARG",
        allow_hyphen_values = true,
        help = "Extra argument passed to the loader (repeatable)"
    )]
    pub loader_args: Vec<String>,

    #[arg(long, help = "Drop and recreate the database before importing")]
    pub reset: bool,

    #[arg(long, value_enum, help = "How render progress is reported")]
    pub progress_mode: Option<ProgressModeArg>,

    #[arg(
        long,
        value_name = "TILES",
        help = "Tiles between progress messages (0 passes job output through)"
    )]
    pub progress_interval: Option<u64>,

    #[arg(long, value_name = "FILE", help = "Session log for render job output")]
    pub log_file: Option<PathBuf>,

    #[arg(long, value_name = "PATH", help = "Rendering daemon socket")]
    pub socket: Option<PathBuf>,

    #[arg(long, help = "Ignore and do not record checkpoints")]
    pub no_checkpoints: bool,

    #[arg(long, help = "Use an already running database engine")]
    pub external_engine: bool,

    #[arg(long, value_name = "N", help = "Database readiness attempts")]
    pub engine_ready_attempts: Option<u32>,

    #[arg(long, value_name = "N", help = "Daemon socket readiness attempts")]
    pub socket_ready_attempts: Option<u32>,

    #[arg(long, value_name = "MS", help = "Interval between readiness attempts")]
    pub ready_interval_ms: Option<u64>,

    #[arg(long, value_name = "DIR", help = "Mapnik plugin directory candidate (repeatable)")]
    pub plugin_dir: Vec<PathBuf>,

    #[arg(long, value_name = "DIR", help = "Font directory candidate (repeatable)")]
    pub font_dir: Vec<PathBuf>,

    #[arg(long, value_name = "REGEX", help = "Pattern identifying tile-completion lines")]
    pub tile_line_pattern: Option<String>,
}

impl RunArgs {
    /// Overlays flags given on the command line; absent flags keep the
    /// values from lower layers.
    pub fn apply(&self, config: &mut PipelineConfig) {
        self.location.apply(config);

        if let Some(stage) = self.stage {
            config.stage = stage.into();
        }
        if let Some(source) = &self.source {
            config.source = Some(source.clone());
        }
        if let Some(data_root) = &self.data_root {
            config.data_root = Some(data_root.clone());
        }
        if let Some(database) = &self.database {
            config.database = database.clone();
        }
        if let Some(user) = &self.db_user {
            config.db_user = user.clone();
        }
        if let Some(z) = self.min_zoom {
            config.min_zoom = z;
        }
        if let Some(z) = self.max_zoom {
            config.max_zoom = z;
        }
        if let Some(mb) = self.cache_mb {
            config.cache_mb = mb;
        }
        if let Some(n) = self.processes {
            config.import_processes = n;
        }
        if let Some(n) = self.threads {
            config.render_threads = n;
        }
        if let Some(path) = &self.flat_nodes {
            config.flat_nodes = Some(path.clone());
        }
        if !self.loader_args.is_empty() {
            config.loader_extra_args = self.loader_args.clone();
        }
        if self.reset {
            config.reset = true;
        }
        if let Some(mode) = self.progress_mode {
            config.progress_mode = mode.into();
        }
        if let Some(every) = self.progress_interval {
            config.progress_interval = every;
        }
        if let Some(path) = &self.log_file {
            config.log_file = Some(path.clone());
        }
        if let Some(socket) = &self.socket {
            config.socket_path = socket.clone();
        }
        if self.no_checkpoints {
            config.checkpoints = false;
        }
        if self.external_engine {
            config.manage_engine = false;
        }
        if let Some(n) = self.engine_ready_attempts {
            config.engine_ready.attempts = n;
        }
        if let Some(n) = self.socket_ready_attempts {
            config.socket_ready.attempts = n;
        }
        if let Some(ms) = self.ready_interval_ms {
            let interval = Duration::from_millis(ms);
            config.engine_ready = PollSettings::new(config.engine_ready.attempts, interval);
            config.socket_ready = PollSettings::new(config.socket_ready.attempts, interval);
        }
        if !self.plugin_dir.is_empty() {
            config.plugin_dirs = self.plugin_dir.clone();
        }
        if !self.font_dir.is_empty() {
            config.font_dirs = self.font_dir.clone();
        }
        if let Some(pattern) = &self.tile_line_pattern {
            config.tile_line_pattern = pattern.clone();
        }
    }
}

#[derive(Parser, Debug, Clone)]
pub struct StatusArgs {
    #[command(flatten)]
    pub location: StateLocation,

    #[arg(
        short = 'f',
        long,
        value_enum,
        default_value = "human",
        help = "Output format"
    )]
    pub format: OutputFormatArg,
}

#[derive(Parser, Debug, Clone)]
pub struct ResetArgs {
    #[arg(value_enum, value_name = "STAGE", help = "Stage to clear with its downstream stages [default: all]")]
    pub stage: Option<StageNameArg>,

    #[command(flatten)]
    pub location: StateLocation,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageArg {
    Import,
    Render,
    All,
}

impl From<StageArg> for StageSelector {
    fn from(arg: StageArg) -> Self {
        match arg {
            StageArg::Import => StageSelector::Import,
            StageArg::Render => StageSelector::Render,
            StageArg::All => StageSelector::All,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageNameArg {
    Import,
    StatisticsRefresh,
    Render,
}

impl From<StageNameArg> for PipelineStage {
    fn from(arg: StageNameArg) -> Self {
        match arg {
            StageNameArg::Import => PipelineStage::Import,
            StageNameArg::StatisticsRefresh => PipelineStage::StatisticsRefresh,
            StageNameArg::Render => PipelineStage::Render,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressModeArg {
    Interval,
    PerZoom,
}

impl From<ProgressModeArg> for ProgressMode {
    fn from(arg: ProgressModeArg) -> Self {
        match arg {
            ProgressModeArg::Interval => ProgressMode::Interval,
            ProgressModeArg::PerZoom => ProgressMode::PerZoom,
        }
    }
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormatArg {
    Json,
    Human,
}

impl From<OutputFormatArg> for super::output::OutputFormat {
    fn from(arg: OutputFormatArg) -> Self {
        match arg {
            OutputFormatArg::Json => super::output::OutputFormat::Json,
            OutputFormatArg::Human => super::output::OutputFormat::Human,
        }
    }
}
