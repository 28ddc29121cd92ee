//! Logging-based progress handler

use super::{ProgressEvent, ProgressHandler};
use tracing::{error, info, warn};

/// Handler that logs progress events using tracing
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl ProgressHandler for LoggingHandler {
    fn on_progress(&self, event: &ProgressEvent) {
        match event {
            ProgressEvent::Started { selector } => {
                info!(stages = %selector, "Starting pipeline");
            }
            ProgressEvent::StageStarted { stage } => {
                info!(stage = %stage, "Starting stage");
            }
            ProgressEvent::StageSkipped { stage, token } => {
                info!(
                    stage = %stage,
                    token = &token[..token.len().min(12)],
                    "Checkpoint matches, skipping stage"
                );
            }
            ProgressEvent::StageComplete { stage, duration } => {
                info!(
                    stage = %stage,
                    duration_ms = duration.as_millis(),
                    "Stage complete"
                );
            }
            ProgressEvent::DaemonReady { pid, attempts } => {
                info!(pid, attempts, "Rendering daemon ready");
            }
            ProgressEvent::TilesRendered { total } => {
                info!(tiles = total, "Render progress");
            }
            ProgressEvent::TilesFlushed { remaining, total } => {
                info!(tiles = total, since_last = remaining, "Render progress (final)");
            }
            ProgressEvent::ZoomLevelStarted {
                zoom,
                estimated_tiles,
            } => {
                info!(zoom, estimated_tiles, "Rendering zoom level");
            }
            ProgressEvent::ZoomLevelComplete {
                zoom,
                tiles,
                duration,
            } => {
                info!(
                    zoom,
                    tiles,
                    duration_ms = duration.as_millis(),
                    "Zoom level complete"
                );
            }
            ProgressEvent::ZoomLevelFailed { zoom, code } => {
                warn!(zoom, code, "Zoom level failed");
            }
            ProgressEvent::Completed { total_time } => {
                info!(total_time_ms = total_time.as_millis(), "Pipeline complete");
            }
            ProgressEvent::Failed { error } => {
                error!(error = %error, "Pipeline failed");
            }
        }
    }
}
