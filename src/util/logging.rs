//! Tracing subscriber setup
//!
//! Events go to stderr with an RFC3339 timestamp. `RUST_LOG`, when set,
//! replaces the computed filter entirely.
//!
//! ```no_run
//! use tilepipe::util::{init_logging, LoggingConfig};
//!
//! init_logging(LoggingConfig::resolve(Some("debug"), false, false));
//! tracing::info!(stage = "import", "Starting stage");
//! ```

use std::env;
use std::sync::Once;
use tracing::Level;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

static INIT: Once = Once::new();

pub const LEVEL_ENV: &str = "TILEPIPE_LOG_LEVEL";
pub const JSON_ENV: &str = "TILEPIPE_LOG_JSON";

/// Noisy crates kept at warn unless `RUST_LOG` says otherwise.
const QUIET_DEPENDENCIES: &[&str] = &["tokio", "mio"];

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Minimum level for this crate's events
    pub level: Level,

    /// Emit one JSON object per event
    pub use_json: bool,

    /// Include the module target (e.g. tilepipe::render::supervisor)
    pub include_target: bool,

    /// Include file and line number
    pub include_location: bool,

    /// Include thread ids and names
    pub include_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            use_json: false,
            include_target: true,
            include_location: false,
            include_thread_ids: false,
        }
    }
}

impl LoggingConfig {
    /// Builds the configuration from command-line switches and the environment.
    ///
    /// The level comes from the first of: `log_level`, `verbose` (debug),
    /// `quiet` (error), `TILEPIPE_LOG_LEVEL`, then info. `TILEPIPE_LOG_JSON=true`
    /// selects JSON output.
    pub fn resolve(log_level: Option<&str>, verbose: bool, quiet: bool) -> Self {
        let level = if let Some(level_str) = log_level {
            parse_level(level_str)
        } else if verbose {
            Level::DEBUG
        } else if quiet {
            Level::ERROR
        } else {
            env::var(LEVEL_ENV)
                .map(|l| parse_level(&l))
                .unwrap_or(Level::INFO)
        };

        Self {
            level,
            use_json: json_from_env(),
            ..Default::default()
        }
    }
}

fn json_from_env() -> bool {
    env::var(JSON_ENV)
        .ok()
        .and_then(|v| v.parse::<bool>().ok())
        .unwrap_or(false)
}

/// Case-insensitive level name; unknown names fall back to INFO with a warning.
pub fn parse_level(level_str: &str) -> Level {
    match level_str.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => {
            eprintln!(
                "Invalid log level '{}', defaulting to INFO. Valid levels: trace, debug, info, warn, error",
                level_str
            );
            Level::INFO
        }
    }
}

fn build_filter(level: Level) -> EnvFilter {
    if env::var("RUST_LOG").is_ok() {
        return EnvFilter::from_default_env();
    }

    let mut filter = EnvFilter::new(level.to_string());
    for directive in QUIET_DEPENDENCIES
        .iter()
        .map(|krate| format!("{}=warn", krate))
        .chain(std::iter::once(format!("tilepipe={}", level)))
    {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }
    filter
}

/// Installs the global subscriber. Only the first call has any effect.
pub fn init_logging(config: LoggingConfig) {
    INIT.call_once(|| {
        let filter = build_filter(config.level);

        if config.use_json {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .json()
                        .with_writer(std::io::stderr)
                        .with_target(config.include_target)
                        .with_file(config.include_location)
                        .with_line_number(config.include_location)
                        .with_thread_ids(config.include_thread_ids)
                        .with_thread_names(config.include_thread_ids),
                )
                .init();
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(
                    fmt::layer()
                        .with_writer(std::io::stderr)
                        .with_target(config.include_target)
                        .with_file(config.include_location)
                        .with_line_number(config.include_location)
                        .with_thread_ids(config.include_thread_ids)
                        .with_thread_names(config.include_thread_ids),
                )
                .init();
        }
    });
}
