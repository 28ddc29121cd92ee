//! Tile job execution strategies
//!
//! Both strategies drive the same tile tool and return the tool's exit
//! status. Output is copied to the session log and sampled into progress
//! events, neither of which can influence the returned status.

use super::config::MAP_NAME;
use super::session_log::SessionLog;
use crate::config::ProgressMode;
use crate::error::PipelineResult;
use crate::process::{CommandRunner, CommandSpec};
use crate::progress::{ProgressEvent, ProgressHandler};
use regex::Regex;
use std::path::PathBuf;
use std::time::Instant;
use tracing::debug;

pub const TILE_TOOL: &str = "render_list";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderStrategy {
    /// One job over the whole range; a progress event every `every` tiles.
    /// Zero disables sampling.
    Interval { every: u64 },
    /// One job per zoom level, stopping at the first failing level.
    PerZoom,
}

impl RenderStrategy {
    pub fn from_mode(mode: ProgressMode, every: u64) -> Self {
        match mode {
            ProgressMode::Interval => RenderStrategy::Interval { every },
            ProgressMode::PerZoom => RenderStrategy::PerZoom,
        }
    }
}

/// Arguments of the tile tool that do not vary between invocations.
#[derive(Debug, Clone)]
pub struct TileCommand {
    pub socket_path: PathBuf,
    pub tile_dir: PathBuf,
    pub threads: u32,
}

impl TileCommand {
    pub fn for_range(&self, min_zoom: u8, max_zoom: u8) -> CommandSpec {
        CommandSpec::new(TILE_TOOL)
            .args(["-a", "-f"])
            .args([
                "-z".to_string(),
                min_zoom.to_string(),
                "-Z".to_string(),
                max_zoom.to_string(),
                "-n".to_string(),
                self.threads.to_string(),
            ])
            .arg("-s")
            .path_arg(&self.socket_path)
            .args(["-m", MAP_NAME])
            .arg("-t")
            .path_arg(&self.tile_dir)
    }
}

/// Counts tile lines and decides when an interim report is due.
#[derive(Debug, Clone)]
pub struct ProgressSampler {
    every: u64,
    seen: u64,
    reported: u64,
}

impl ProgressSampler {
    pub fn new(every: u64) -> Self {
        Self {
            every,
            seen: 0,
            reported: 0,
        }
    }

    /// Records one tile line. Returns the running total when it lands on
    /// an interval boundary.
    pub fn observe(&mut self) -> Option<u64> {
        self.seen += 1;
        if self.every > 0 && self.seen % self.every == 0 {
            self.reported = self.seen;
            Some(self.seen)
        } else {
            None
        }
    }

    /// Tiles seen since the last interim report, if any.
    pub fn finish(&mut self) -> Option<u64> {
        let remaining = self.seen - self.reported;
        self.reported = self.seen;
        (self.every > 0 && remaining > 0).then_some(remaining)
    }

    pub fn total(&self) -> u64 {
        self.seen
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobReport {
    /// Exit status of the tile tool; for per-zoom runs, the failing level's.
    pub code: i32,
    pub tiles: u64,
    pub levels_completed: Vec<u8>,
    pub failed_level: Option<u8>,
}

impl JobReport {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Tile count estimate for a full pyramid level.
pub fn estimated_tiles(zoom: u8) -> u64 {
    4u64.saturating_pow(u32::from(zoom))
}

pub struct JobContext<'a> {
    pub runner: &'a dyn CommandRunner,
    pub command: &'a TileCommand,
    pub tile_line: &'a Regex,
    pub progress: &'a dyn ProgressHandler,
    pub log: &'a mut SessionLog,
}

pub async fn run_job(
    strategy: RenderStrategy,
    min_zoom: u8,
    max_zoom: u8,
    ctx: JobContext<'_>,
) -> PipelineResult<JobReport> {
    match strategy {
        RenderStrategy::Interval { every } => run_interval(every, min_zoom, max_zoom, ctx).await,
        RenderStrategy::PerZoom => run_per_zoom(min_zoom, max_zoom, ctx).await,
    }
}

async fn run_interval(
    every: u64,
    min_zoom: u8,
    max_zoom: u8,
    ctx: JobContext<'_>,
) -> PipelineResult<JobReport> {
    let JobContext {
        runner,
        command,
        tile_line,
        progress,
        log,
    } = ctx;

    let spec = command.for_range(min_zoom, max_zoom);
    log.header(&format!("{} zoom {}-{}", TILE_TOOL, min_zoom, max_zoom));
    debug!(command = %spec, "Starting tile job");

    let mut sampler = ProgressSampler::new(every);
    let code = runner
        .stream(&spec, &mut |line: &str| {
            log.line(line);
            if every == 0 {
                debug!(target: "tilepipe::render_list", "{}", line);
            }
            if tile_line.is_match(line) {
                if let Some(total) = sampler.observe() {
                    progress.on_progress(&ProgressEvent::TilesRendered { total });
                }
            }
        })
        .await?;

    if let Some(remaining) = sampler.finish() {
        progress.on_progress(&ProgressEvent::TilesFlushed {
            remaining,
            total: sampler.total(),
        });
    }
    log.header(&format!("{} exited with status {}", TILE_TOOL, code));

    let completed = if code == 0 {
        (min_zoom..=max_zoom).collect()
    } else {
        Vec::new()
    };
    Ok(JobReport {
        code,
        tiles: sampler.total(),
        levels_completed: completed,
        failed_level: None,
    })
}

async fn run_per_zoom(min_zoom: u8, max_zoom: u8, ctx: JobContext<'_>) -> PipelineResult<JobReport> {
    let JobContext {
        runner,
        command,
        tile_line,
        progress,
        log,
    } = ctx;

    let mut report = JobReport {
        code: 0,
        tiles: 0,
        levels_completed: Vec::new(),
        failed_level: None,
    };

    for zoom in min_zoom..=max_zoom {
        progress.on_progress(&ProgressEvent::ZoomLevelStarted {
            zoom,
            estimated_tiles: estimated_tiles(zoom),
        });
        log.header(&format!("{} zoom {}", TILE_TOOL, zoom));

        let spec = command.for_range(zoom, zoom);
        let start = Instant::now();
        let mut level_tiles = 0u64;
        let code = runner
            .stream(&spec, &mut |line: &str| {
                log.line(line);
                if tile_line.is_match(line) {
                    level_tiles += 1;
                }
            })
            .await?;
        report.tiles += level_tiles;

        if code != 0 {
            log.header(&format!("zoom {} failed with status {}", zoom, code));
            progress.on_progress(&ProgressEvent::ZoomLevelFailed { zoom, code });
            report.code = code;
            report.failed_level = Some(zoom);
            return Ok(report);
        }

        progress.on_progress(&ProgressEvent::ZoomLevelComplete {
            zoom,
            tiles: level_tiles,
            duration: start.elapsed(),
        });
        report.levels_completed.push(zoom);
    }

    Ok(report)
}
