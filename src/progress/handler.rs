//! Progress handler trait and events

use crate::checkpoint::PipelineStage;
use std::time::Duration;

/// Events emitted while the pipeline runs
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// Pipeline run started
    Started { selector: String },

    /// A stage is about to execute
    StageStarted { stage: PipelineStage },

    /// A stage was skipped because its checkpoint still matches
    StageSkipped { stage: PipelineStage, token: String },

    /// A stage finished successfully
    StageComplete {
        stage: PipelineStage,
        duration: Duration,
    },

    /// Rendering daemon accepted connections
    DaemonReady { pid: u32, attempts: u32 },

    /// Interim tile count during an interval-sampled job
    TilesRendered { total: u64 },

    /// Final count for tiles seen since the last interim report
    TilesFlushed { remaining: u64, total: u64 },

    /// Per-zoom job is about to render a level
    ZoomLevelStarted { zoom: u8, estimated_tiles: u64 },

    /// Per-zoom job finished a level
    ZoomLevelComplete {
        zoom: u8,
        tiles: u64,
        duration: Duration,
    },

    /// Per-zoom job aborted on a level
    ZoomLevelFailed { zoom: u8, code: i32 },

    /// Pipeline finished successfully
    Completed { total_time: Duration },

    /// Pipeline failed
    Failed { error: String },
}

/// Trait for handling progress events
pub trait ProgressHandler: Send + Sync {
    /// Called when a progress event occurs
    fn on_progress(&self, event: &ProgressEvent);
}

/// No-op handler that ignores all events
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpHandler;

impl ProgressHandler for NoOpHandler {
    fn on_progress(&self, _event: &ProgressEvent) {
        // Intentionally empty
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingHandler {
        count: Arc<AtomicUsize>,
    }

    impl ProgressHandler for CountingHandler {
        fn on_progress(&self, _event: &ProgressEvent) {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_noop_handler() {
        let handler = NoOpHandler;
        handler.on_progress(&ProgressEvent::Started {
            selector: "all".to_string(),
        });
    }

    #[test]
    fn test_progress_events() {
        let count = Arc::new(AtomicUsize::new(0));
        let handler = CountingHandler {
            count: count.clone(),
        };

        handler.on_progress(&ProgressEvent::StageStarted {
            stage: PipelineStage::Import,
        });
        handler.on_progress(&ProgressEvent::TilesRendered { total: 500 });
        handler.on_progress(&ProgressEvent::Completed {
            total_time: Duration::from_secs(5),
        });

        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_event_debug() {
        let event = ProgressEvent::ZoomLevelStarted {
            zoom: 3,
            estimated_tiles: 64,
        };
        let debug_str = format!("{:?}", event);
        assert!(debug_str.contains("ZoomLevelStarted"));
        assert!(debug_str.contains("zoom: 3"));
    }
}
