//! Per-stage completion records
//!
//! Layout: one file per stage under the state directory, named
//! `<stage>.token`, holding a single-line token. Writes go to a temporary
//! sibling first and are renamed into place, so readers see either the old
//! token or the new one.

use crate::error::{PipelineError, PipelineResult};
use crate::fingerprint::StageToken;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PipelineStage {
    Import,
    StatisticsRefresh,
    Render,
}

impl PipelineStage {
    pub const ALL: [PipelineStage; 3] = [
        PipelineStage::Import,
        PipelineStage::StatisticsRefresh,
        PipelineStage::Render,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Import => "import",
            PipelineStage::StatisticsRefresh => "statistics-refresh",
            PipelineStage::Render => "render",
        }
    }

    /// Stages that consume this stage's output, in pipeline order.
    pub fn downstream(&self) -> &'static [PipelineStage] {
        match self {
            PipelineStage::Import => &[PipelineStage::StatisticsRefresh, PipelineStage::Render],
            PipelineStage::StatisticsRefresh => &[PipelineStage::Render],
            PipelineStage::Render => &[],
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineStage {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "import" => Ok(PipelineStage::Import),
            "statistics-refresh" | "analyze" => Ok(PipelineStage::StatisticsRefresh),
            "render" => Ok(PipelineStage::Render),
            other => Err(format!(
                "Invalid stage: {}. Valid options: import, statistics-refresh, render",
                other
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn record_path(&self, stage: PipelineStage) -> PathBuf {
        self.dir.join(format!("{}.token", stage.as_str()))
    }

    fn ensure_dir(&self) -> PipelineResult<()> {
        fs::create_dir_all(&self.dir).map_err(|source| PipelineError::CheckpointIo {
            path: self.dir.clone(),
            source,
        })
    }

    /// Records that `stage` completed for `token`, replacing any previous record.
    pub fn mark(&self, stage: PipelineStage, token: &StageToken) -> PipelineResult<()> {
        self.ensure_dir()?;

        let path = self.record_path(stage);
        let tmp = self
            .dir
            .join(format!(".{}.token.{}.tmp", stage.as_str(), std::process::id()));
        let io_err = |source| PipelineError::CheckpointIo {
            path: tmp.clone(),
            source,
        };

        let mut file = fs::File::create(&tmp).map_err(io_err)?;
        writeln!(file, "{}", token.as_str()).map_err(io_err)?;
        file.sync_all().map_err(io_err)?;
        drop(file);

        fs::rename(&tmp, &path).map_err(|source| PipelineError::CheckpointIo {
            path: path.clone(),
            source,
        })?;

        info!(stage = %stage, token = token.short(), "Checkpoint recorded");
        Ok(())
    }

    /// Removes the record for `stage`; absent records are fine.
    pub fn clear(&self, stage: PipelineStage) -> PipelineResult<()> {
        let path = self.record_path(stage);
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(stage = %stage, "Checkpoint cleared");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(source) => Err(PipelineError::CheckpointIo { path, source }),
        }
    }

    pub fn read(&self, stage: PipelineStage) -> PipelineResult<Option<StageToken>> {
        let path = self.record_path(stage);
        match fs::read_to_string(&path) {
            Ok(content) => {
                let token = content.lines().next().unwrap_or("").trim();
                if token.is_empty() {
                    Ok(None)
                } else {
                    Ok(Some(StageToken::from_recorded(token)))
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(PipelineError::CheckpointIo { path, source }),
        }
    }

    pub fn matches(&self, stage: PipelineStage, token: &StageToken) -> PipelineResult<bool> {
        Ok(self.read(stage)?.as_ref() == Some(token))
    }

    /// Clears every stage that consumes `stage`'s output. `stage` itself is left alone.
    pub fn clear_downstream(&self, stage: PipelineStage) -> PipelineResult<()> {
        for downstream in stage.downstream() {
            self.clear(*downstream)?;
        }
        Ok(())
    }

    /// Clears `stage` and everything downstream of it.
    pub fn invalidate(&self, stage: PipelineStage) -> PipelineResult<()> {
        self.clear(stage)?;
        self.clear_downstream(stage)
    }

    pub fn clear_all(&self) -> PipelineResult<()> {
        for stage in PipelineStage::ALL {
            self.clear(stage)?;
        }
        Ok(())
    }

    pub fn snapshot(&self) -> PipelineResult<Vec<(PipelineStage, Option<StageToken>)>> {
        PipelineStage::ALL
            .iter()
            .map(|stage| Ok((*stage, self.read(*stage)?)))
            .collect()
    }
}
