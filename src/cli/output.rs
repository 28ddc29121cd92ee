//! Checkpoint status rendering

use crate::checkpoint::{CheckpointStore, PipelineStage};
use crate::error::PipelineResult;
use anyhow::Context;
use serde::Serialize;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// JSON format (machine-readable)
    Json,
    /// Human-readable aligned text
    Human,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageStatus {
    pub stage: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub state_dir: PathBuf,
    pub stages: Vec<StageStatus>,
}

impl StatusReport {
    pub fn collect(store: &CheckpointStore) -> PipelineResult<Self> {
        let stages = store
            .snapshot()?
            .into_iter()
            .map(|(stage, token): (PipelineStage, _)| StageStatus {
                stage: stage.as_str().to_string(),
                token: token.map(|t| t.as_str().to_string()),
            })
            .collect();
        Ok(Self {
            state_dir: store.dir().to_path_buf(),
            stages,
        })
    }

    pub fn render(&self, format: OutputFormat) -> PipelineResult<String> {
        match format {
            OutputFormat::Json => Ok(serde_json::to_string_pretty(self)
                .context("Failed to serialize checkpoint status")?),
            OutputFormat::Human => Ok(self.render_human()),
        }
    }

    fn render_human(&self) -> String {
        let width = self
            .stages
            .iter()
            .map(|s| s.stage.len())
            .max()
            .unwrap_or(0);

        let mut out = format!("Checkpoints in {}\n", self.state_dir.display());
        for status in &self.stages {
            let token = status.token.as_deref().unwrap_or("absent");
            out.push_str(&format!("  {:<width$}  {}\n", status.stage, token, width = width));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::compute_token;
    use tempfile::TempDir;

    fn report() -> (TempDir, StatusReport) {
        let dir = TempDir::new().unwrap();
        let store = CheckpointStore::new(dir.path().join("state"));
        store
            .mark(PipelineStage::Import, &compute_token("import", 1, ["x"]))
            .unwrap();
        let report = StatusReport::collect(&store).unwrap();
        (dir, report)
    }

    #[test]
    fn test_collect_lists_every_stage() {
        let (_dir, report) = report();
        let names: Vec<&str> = report.stages.iter().map(|s| s.stage.as_str()).collect();
        assert_eq!(names, vec!["import", "statistics-refresh", "render"]);
        assert!(report.stages[0].token.is_some());
        assert!(report.stages[2].token.is_none());
    }

    #[test]
    fn test_human_output() {
        let (_dir, report) = report();
        let text = report.render(OutputFormat::Human).unwrap();
        assert!(text.starts_with("Checkpoints in "));
        assert!(text.contains("render"));
        assert!(text.contains("absent"));
    }

    #[test]
    fn test_json_output() {
        let (_dir, report) = report();
        let json = report.render(OutputFormat::Json).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["stages"][1]["stage"], "statistics-refresh");
        assert!(value["stages"][1]["token"].is_null());
        assert_eq!(value["stages"][0]["token"].as_str().unwrap().len(), 64);
    }
}
