//! Rendering daemon configuration

use crate::error::{PipelineError, PipelineResult};
use anyhow::Context;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const DAEMON_CONFIG_FILE: &str = "renderd.conf";

/// Map section name; the tile job addresses this map with `-m`.
pub const MAP_NAME: &str = "default";

/// Returns the first candidate directory that exists.
pub fn resolve_resource(resource: &str, candidates: &[PathBuf]) -> PipelineResult<PathBuf> {
    match candidates.iter().find(|c| c.is_dir()) {
        Some(found) => {
            debug!(resource, path = %found.display(), "Resolved resource");
            Ok(found.clone())
        }
        None => Err(PipelineError::MissingResource {
            resource: resource.to_string(),
            searched: candidates.to_vec(),
        }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub threads: u32,
    pub tile_dir: PathBuf,
    pub socket_path: PathBuf,
    pub plugins_dir: PathBuf,
    pub font_dir: PathBuf,
    pub style_path: PathBuf,
    pub max_zoom: u8,
}

impl DaemonConfig {
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out)
            .map(|()| out)
            .unwrap_or_default()
    }

    pub fn render_into(&self, out: &mut impl fmt::Write) -> fmt::Result {
        let stats = self.socket_path.with_extension("stats");

        writeln!(out, "[renderd]")?;
        writeln!(out, "num_threads={}", self.threads)?;
        writeln!(out, "tile_dir={}", self.tile_dir.display())?;
        writeln!(out, "stats_file={}", stats.display())?;
        writeln!(out, "socketname={}", self.socket_path.display())?;
        writeln!(out)?;
        writeln!(out, "[mapnik]")?;
        writeln!(out, "plugins_dir={}", self.plugins_dir.display())?;
        writeln!(out, "font_dir={}", self.font_dir.display())?;
        writeln!(out, "font_dir_recurse=true")?;
        writeln!(out)?;
        writeln!(out, "[{}]", MAP_NAME)?;
        writeln!(out, "URI=/tile/")?;
        writeln!(out, "XML={}", self.style_path.display())?;
        writeln!(out, "HOST=localhost")?;
        writeln!(out, "TILESIZE=256")?;
        writeln!(out, "MAXZOOM={}", self.max_zoom)
    }

    /// Writes the configuration into `dir`, returning its path.
    pub fn write(&self, dir: &Path) -> PipelineResult<PathBuf> {
        fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
        let path = dir.join(DAEMON_CONFIG_FILE);
        fs::write(&path, self.render())
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!(path = %path.display(), "Wrote rendering daemon configuration");
        Ok(path)
    }
}
