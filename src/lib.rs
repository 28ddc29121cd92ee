//! tilepipe - resumable OpenStreetMap import and tile rendering
//!
//! The pipeline imports an OSM extract into PostGIS, refreshes planner
//! statistics and renders a tile pyramid through a supervised rendering
//! daemon. Every stage records a fingerprint of its inputs in a
//! [`checkpoint::CheckpointStore`], so an unchanged rerun skips finished work
//! and a changed parameter reruns only the stages it affects.
//!
//! External tools are driven through [`process::CommandRunner`];
//! [`process::MockRunner`] stands in for them in tests.
//!
//! ```ignore
//! use std::sync::Arc;
//! use tilepipe::{LoggingHandler, PipelineConfig, PipelineDriver, SystemRunner};
//!
//! let mut config = PipelineConfig::default();
//! config.source = Some("/data/region.osm.pbf".into());
//! config.validate()?;
//!
//! let driver = PipelineDriver::new(config, Arc::new(SystemRunner::new()), Arc::new(LoggingHandler));
//! let summary = driver.run().await?;
//! ```

pub mod checkpoint;
pub mod cli;
pub mod config;
pub mod database;
pub mod error;
pub mod fingerprint;
pub mod import;
pub mod pipeline;
pub mod process;
pub mod progress;
pub mod render;
pub mod util;

pub use checkpoint::{CheckpointStore, PipelineStage};
pub use config::{ConfigError, PipelineConfig, ProgressMode, StageSelector};
pub use error::{PipelineError, PipelineResult};
pub use fingerprint::{compute_token, StageToken};
pub use pipeline::{PipelineDriver, RunSummary};
pub use process::{CommandRunner, MockRunner, SystemRunner};
pub use progress::{LoggingHandler, ProgressEvent, ProgressHandler};
pub use util::{init_logging, LoggingConfig};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
