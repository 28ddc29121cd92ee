//! Tile rendering: style and daemon configuration, the daemon lifecycle,
//! and the tile job strategies.

pub mod config;
pub mod session_log;
pub mod strategy;
pub mod style;
pub mod supervisor;

pub use config::{resolve_resource, DaemonConfig};
pub use session_log::SessionLog;
pub use strategy::{JobReport, ProgressSampler, RenderStrategy, TileCommand};
pub use style::{StyleSheet, STYLE_VERSION};
pub use supervisor::{
    Readiness, RenderDaemonHandle, RenderSettings, RenderSupervisor, SupervisorState,
};
