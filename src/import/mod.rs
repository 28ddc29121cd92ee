//! Bulk import of an OSM extract and the statistics refresh that follows it

use crate::error::{PipelineError, PipelineResult};
use crate::process::{CommandRunner, CommandSpec};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};

pub const LOADER_PROGRAM: &str = "osm2pgsql";

/// Flags that shape the database schema the renderer expects; not tunable.
const STRUCTURAL_FLAGS: &[&str] = &["--create", "--slim", "--multi-geometry", "--hstore"];

#[derive(Debug, Clone)]
pub struct ImportRequest {
    pub database: String,
    pub db_user: String,
    pub source: PathBuf,
    pub cache_mb: u32,
    pub processes: u32,
    pub flat_nodes: Option<PathBuf>,
    pub extra_args: Vec<String>,
}

impl ImportRequest {
    pub fn loader_command(&self) -> CommandSpec {
        let mut spec = CommandSpec::new(LOADER_PROGRAM)
            .args(STRUCTURAL_FLAGS.iter().copied())
            .args([
                "--cache".to_string(),
                self.cache_mb.to_string(),
                "--number-processes".to_string(),
                self.processes.to_string(),
                "--database".to_string(),
                self.database.clone(),
                "--username".to_string(),
                self.db_user.clone(),
            ]);

        if let Some(flat_nodes) = &self.flat_nodes {
            spec = spec.arg("--flat-nodes").path_arg(flat_nodes);
        }

        spec.args(self.extra_args.iter().cloned())
            .path_arg(&self.source)
    }
}

pub struct ImportStage {
    runner: Arc<dyn CommandRunner>,
}

impl ImportStage {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// Runs the loader. A non-zero exit is fatal; a partial import is left
    /// in place for the next run's checkpoint invalidation to deal with.
    pub async fn import_data(&self, request: &ImportRequest) -> PipelineResult<()> {
        if !request.source.is_file() {
            return Err(missing_source(&request.source));
        }

        let spec = request.loader_command();
        info!(
            source = %request.source.display(),
            database = %request.database,
            cache_mb = request.cache_mb,
            processes = request.processes,
            "Importing extract"
        );

        let start = Instant::now();
        let code = self
            .runner
            .stream(&spec, &mut |line: &str| {
                info!(target: "tilepipe::loader", "{}", line);
            })
            .await?;

        if code != 0 {
            error!(code, "Import failed");
            return Err(PipelineError::tool_failed(LOADER_PROGRAM, code));
        }

        info!(elapsed_s = start.elapsed().as_secs(), "Import complete");
        Ok(())
    }

    pub async fn refresh_statistics(&self, database: &str, db_user: &str) -> PipelineResult<()> {
        info!(database, "Refreshing planner statistics");
        let spec = CommandSpec::new("psql").args([
            "-U",
            db_user,
            "-d",
            database,
            "-v",
            "ON_ERROR_STOP=1",
            "-c",
            "ANALYZE;",
        ]);

        let start = Instant::now();
        let out = self.runner.output(&spec).await?;
        if !out.success() {
            error!(code = out.code, stderr = %out.stderr.trim(), "Statistics refresh failed");
            return Err(PipelineError::tool_failed("statistics refresh", out.code));
        }

        info!(elapsed_s = start.elapsed().as_secs(), "Statistics refresh complete");
        Ok(())
    }
}

pub fn missing_source(path: &Path) -> PipelineError {
    PipelineError::precondition(format!("Source file not found: {}", path.display()))
}
