use crate::config::ConfigError;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Exit code used for precondition failures (missing inputs, resources, metadata).
pub const EXIT_PRECONDITION: i32 = 2;
/// Exit code used when a bounded readiness poll runs out of attempts.
pub const EXIT_READINESS_TIMEOUT: i32 = 3;
/// Exit code used when the checkpoint store cannot be read or written.
pub const EXIT_CHECKPOINT_IO: i32 = 4;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Required resource '{resource}' not found (searched: {})", format_paths(.searched))]
    MissingResource {
        resource: String,
        searched: Vec<PathBuf>,
    },

    #[error("{what} not ready after {attempts} attempts ({:.1}s)", .elapsed.as_secs_f64())]
    ReadinessTimeout {
        what: String,
        attempts: u32,
        elapsed: Duration,
    },

    #[error("{step} failed with exit status {code}")]
    ToolFailed { step: String, code: i32 },

    #[error("Checkpoint store I/O error at {}: {source}", .path.display())]
    CheckpointIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Interrupted by signal {signal}")]
    Cancelled { signal: i32 },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PipelineError {
    pub fn precondition(message: impl Into<String>) -> Self {
        PipelineError::Precondition(message.into())
    }

    pub fn tool_failed(step: impl Into<String>, code: i32) -> Self {
        PipelineError::ToolFailed {
            step: step.into(),
            code,
        }
    }

    /// Process exit code for this failure. External tool failures surface the
    /// tool's own status; everything else maps onto a fixed code.
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Precondition(_)
            | PipelineError::MissingResource { .. }
            | PipelineError::Config(_) => EXIT_PRECONDITION,
            PipelineError::ReadinessTimeout { .. } => EXIT_READINESS_TIMEOUT,
            PipelineError::ToolFailed { code, .. } => {
                if *code == 0 {
                    1
                } else {
                    *code
                }
            }
            PipelineError::CheckpointIo { .. } => EXIT_CHECKPOINT_IO,
            PipelineError::Cancelled { signal } => 128 + signal,
            PipelineError::Other(_) => 1,
        }
    }
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_failure_propagates_code() {
        let err = PipelineError::tool_failed("osm2pgsql", 7);
        assert_eq!(err.exit_code(), 7);
        assert_eq!(err.to_string(), "osm2pgsql failed with exit status 7");
    }

    #[test]
    fn test_tool_failure_never_exits_zero() {
        assert_eq!(PipelineError::tool_failed("render_list", 0).exit_code(), 1);
    }

    #[test]
    fn test_missing_resource_names_resource() {
        let err = PipelineError::MissingResource {
            resource: "mapnik plugins".to_string(),
            searched: vec![PathBuf::from("/a"), PathBuf::from("/b")],
        };
        let msg = err.to_string();
        assert!(msg.contains("mapnik plugins"));
        assert!(msg.contains("/a, /b"));
        assert_eq!(err.exit_code(), EXIT_PRECONDITION);
    }

    #[test]
    fn test_readiness_timeout_reports_attempts() {
        let err = PipelineError::ReadinessTimeout {
            what: "renderd socket".to_string(),
            attempts: 30,
            elapsed: Duration::from_secs(30),
        };
        assert!(err.to_string().contains("30 attempts"));
        assert_eq!(err.exit_code(), EXIT_READINESS_TIMEOUT);
    }

    #[test]
    fn test_cancelled_exit_code() {
        assert_eq!(PipelineError::Cancelled { signal: 15 }.exit_code(), 143);
        assert_eq!(PipelineError::Cancelled { signal: 2 }.exit_code(), 130);
    }
}
