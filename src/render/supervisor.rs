//! Rendering daemon lifecycle
//!
//! ```text
//! Idle -> ConfigGenerated -> DaemonStarting -> DaemonReady -> JobRunning
//!      -> JobSucceeded | JobFailed -> DaemonStopped
//! ```
//!
//! Any failure after the daemon is spawned still ends in `DaemonStopped`:
//! [`RenderSupervisor::run`] stops it explicitly, and [`RenderDaemonHandle`]
//! stops it on drop when the run future is cancelled.

use super::config::{resolve_resource, DaemonConfig};
use super::session_log::SessionLog;
use super::strategy::{run_job, JobContext, JobReport, RenderStrategy, TileCommand, TILE_TOOL};
use super::style::write_style;
use crate::config::{ConfigError, PipelineConfig, PollSettings};
use crate::error::{PipelineError, PipelineResult};
use crate::process::{ChildHandle, CommandRunner, CommandSpec, StopSignal};
use crate::progress::{ProgressEvent, ProgressHandler};
use crate::util::poll_until;
use anyhow::Context;
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const DAEMON_PROGRAM: &str = "renderd";
const DAEMON_LOG_FILE: &str = "renderd.log";
const DEFAULT_STOP_GRACE: Duration = Duration::from_secs(10);
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    ConfigGenerated,
    DaemonStarting,
    DaemonReady,
    JobRunning,
    JobSucceeded,
    JobFailed,
    DaemonStopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Starting,
    Ready,
    Failed,
}

#[derive(Debug, Clone)]
pub struct RenderSettings {
    pub database: String,
    pub db_user: String,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub threads: u32,
    pub tile_dir: PathBuf,
    pub style_dir: PathBuf,
    pub socket_path: PathBuf,
    pub plugin_dirs: Vec<PathBuf>,
    pub font_dirs: Vec<PathBuf>,
    pub socket_ready: PollSettings,
    pub strategy: RenderStrategy,
    pub session_log: PathBuf,
    pub tile_line: Regex,
    pub stop_grace: Duration,
}

impl RenderSettings {
    pub fn from_config(config: &PipelineConfig) -> PipelineResult<Self> {
        let tile_line = Regex::new(&config.tile_line_pattern).map_err(|e| {
            ConfigError::ParseError {
                field: "tile_line_pattern".to_string(),
                error: e.to_string(),
            }
        })?;

        Ok(Self {
            database: config.database.clone(),
            db_user: config.db_user.clone(),
            min_zoom: config.min_zoom,
            max_zoom: config.max_zoom,
            threads: config.render_threads,
            tile_dir: config.tile_dir(),
            style_dir: config.style_dir(),
            socket_path: config.socket_path.clone(),
            plugin_dirs: config.plugin_dirs.clone(),
            font_dirs: config.font_dirs.clone(),
            socket_ready: config.socket_ready,
            strategy: RenderStrategy::from_mode(config.progress_mode, config.progress_interval),
            session_log: config.session_log_path(),
            tile_line,
            stop_grace: DEFAULT_STOP_GRACE,
        })
    }
}

/// A running rendering daemon. Dropping the handle stops the daemon.
pub struct RenderDaemonHandle {
    runner: Arc<dyn CommandRunner>,
    child: Box<dyn ChildHandle>,
    pid: u32,
    socket_path: PathBuf,
    readiness: Readiness,
    grace: Duration,
    stopped: bool,
}

impl RenderDaemonHandle {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn readiness(&self) -> Readiness {
        self.readiness
    }

    /// SIGTERM, then SIGKILL if the daemon outlives the grace period.
    /// The spawned child is always reaped. Blocks the calling thread while
    /// waiting, so it is reserved for `Drop`; async callers use
    /// [`RenderDaemonHandle::shutdown`].
    pub fn stop(&mut self) {
        if !self.request_stop() {
            return;
        }
        let deadline = Instant::now() + self.grace;
        loop {
            match self.poll_exit() {
                Some(Some(code)) => return self.exited(code),
                Some(None) if Instant::now() < deadline => {}
                _ => break,
            }
            std::thread::sleep(STOP_POLL_INTERVAL);
        }
        self.kill_and_reap();
    }

    /// Same sequence as [`RenderDaemonHandle::stop`], waiting on the tokio
    /// timer instead of the thread.
    pub async fn shutdown(&mut self) {
        if !self.request_stop() {
            return;
        }
        let deadline = Instant::now() + self.grace;
        loop {
            match self.poll_exit() {
                Some(Some(code)) => return self.exited(code),
                Some(None) if Instant::now() < deadline => {}
                _ => break,
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
        self.kill_and_reap();
    }

    /// Sends SIGTERM. Returns false when there is nothing left to wait for.
    fn request_stop(&mut self) -> bool {
        if self.stopped {
            return false;
        }
        self.stopped = true;

        let child_pid = self.child.id();
        if let Ok(Some(code)) = self.child.try_wait() {
            debug!(pid = child_pid, code, "Rendering daemon already exited");
            if self.pid == child_pid {
                return false;
            }
        }

        info!(pid = self.pid, "Stopping rendering daemon");
        self.send_all(StopSignal::Terminate);
        true
    }

    /// `None` when the child can no longer be polled.
    fn poll_exit(&mut self) -> Option<Option<i32>> {
        match self.child.try_wait() {
            Ok(status) => Some(status),
            Err(e) => {
                warn!("Failed to poll rendering daemon: {:#}", e);
                None
            }
        }
    }

    fn exited(&self, code: i32) {
        debug!(pid = self.child.id(), code, "Rendering daemon exited");
    }

    fn kill_and_reap(&mut self) {
        warn!(
            pid = self.pid,
            grace_ms = self.grace.as_millis() as u64,
            "Rendering daemon ignored SIGTERM, killing"
        );
        self.send_all(StopSignal::Kill);
        let child_pid = self.child.id();
        match self.child.wait() {
            Ok(code) => debug!(pid = child_pid, code, "Rendering daemon reaped"),
            Err(e) => warn!(pid = child_pid, "Failed to reap rendering daemon: {:#}", e),
        }
    }

    fn send_all(&self, signal: StopSignal) {
        let child_pid = self.child.id();
        self.send(self.pid, signal);
        if self.pid != child_pid {
            self.send(child_pid, signal);
        }
    }

    fn send(&self, pid: u32, signal: StopSignal) {
        if let Err(e) = self.runner.signal(pid, signal) {
            debug!(pid, ?signal, "Signal not delivered: {:#}", e);
        }
    }
}

impl Drop for RenderDaemonHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub struct RenderSupervisor {
    runner: Arc<dyn CommandRunner>,
    progress: Arc<dyn ProgressHandler>,
    settings: RenderSettings,
    state: SupervisorState,
    config_path: Option<PathBuf>,
    daemon: Option<RenderDaemonHandle>,
}

impl RenderSupervisor {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        progress: Arc<dyn ProgressHandler>,
        settings: RenderSettings,
    ) -> Self {
        Self {
            runner,
            progress,
            settings,
            state: SupervisorState::Idle,
            config_path: None,
            daemon: None,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn daemon(&self) -> Option<&RenderDaemonHandle> {
        self.daemon.as_ref()
    }

    /// Full lifecycle: configure, start, render, stop. A non-zero job status
    /// becomes [`PipelineError::ToolFailed`] carrying that status.
    pub async fn run(&mut self) -> PipelineResult<JobReport> {
        let result = self.configure_start_render().await;
        self.stop_daemon().await;

        let report = result?;
        if report.success() {
            return Ok(report);
        }
        let step = match report.failed_level {
            Some(zoom) => format!("{} (zoom {})", TILE_TOOL, zoom),
            None => TILE_TOOL.to_string(),
        };
        Err(PipelineError::tool_failed(step, report.code))
    }

    async fn configure_start_render(&mut self) -> PipelineResult<JobReport> {
        self.generate_config()?;
        self.start_daemon().await?;
        self.run_tile_job().await
    }

    /// Resolves mapnik resources and writes the style and daemon configuration.
    pub fn generate_config(&mut self) -> PipelineResult<PathBuf> {
        let settings = &self.settings;
        let plugins_dir = resolve_resource("mapnik plugin directory", &settings.plugin_dirs)?;
        let font_dir = resolve_resource("font directory", &settings.font_dirs)?;

        let style = write_style(&settings.style_dir, &settings.database, &settings.db_user)?;
        fs::create_dir_all(&settings.tile_dir)
            .with_context(|| format!("Failed to create {}", settings.tile_dir.display()))?;

        let path = DaemonConfig {
            threads: settings.threads,
            tile_dir: settings.tile_dir.clone(),
            socket_path: settings.socket_path.clone(),
            plugins_dir,
            font_dir,
            style_path: style.path,
            max_zoom: settings.max_zoom,
        }
        .write(&settings.style_dir)?;

        self.config_path = Some(path.clone());
        self.state = SupervisorState::ConfigGenerated;
        Ok(path)
    }

    /// Spawns the daemon and waits for its socket. The handle is kept before
    /// waiting, so a readiness failure still tears the daemon down.
    pub async fn start_daemon(&mut self) -> PipelineResult<()> {
        let config_path = match (&self.state, &self.config_path) {
            (SupervisorState::ConfigGenerated, Some(path)) => path.clone(),
            _ => {
                return Err(PipelineError::precondition(
                    "Rendering daemon configuration has not been generated",
                ))
            }
        };

        let socket_path = self.settings.socket_path.clone();
        clear_stale_socket(&socket_path)?;

        let spec = CommandSpec::new(DAEMON_PROGRAM)
            .arg("-f")
            .arg("-c")
            .path_arg(&config_path);
        let log = self.settings.style_dir.join(DAEMON_LOG_FILE);
        info!(command = %spec, log = %log.display(), "Starting rendering daemon");

        self.state = SupervisorState::DaemonStarting;
        let child = self.runner.spawn(&spec, Some(log.as_path()))?;
        let handle = self.daemon.insert(RenderDaemonHandle {
            runner: self.runner.clone(),
            pid: child.id(),
            child,
            socket_path: socket_path.clone(),
            readiness: Readiness::Starting,
            grace: self.settings.stop_grace,
            stopped: false,
        });

        let mut exited = None;
        let waited = poll_until("rendering daemon socket", self.settings.socket_ready, || {
            if exited.is_none() {
                if let Ok(Some(code)) = handle.child.try_wait() {
                    exited = Some(code);
                }
            }
            let done = exited.is_some() || socket_path.exists();
            async move { done }
        })
        .await;

        if let Some(code) = exited {
            handle.readiness = Readiness::Failed;
            warn!(code, log = %log.display(), "Rendering daemon exited during startup");
            return Err(PipelineError::tool_failed(DAEMON_PROGRAM, code));
        }
        let attempts = match waited {
            Ok(attempts) => attempts,
            Err(e) => {
                handle.readiness = Readiness::Failed;
                return Err(e);
            }
        };

        if let Some(pid) = discover_pid(self.runner.as_ref()).await {
            handle.pid = pid;
        }
        handle.readiness = Readiness::Ready;
        let pid = handle.pid;

        self.state = SupervisorState::DaemonReady;
        self.progress
            .on_progress(&ProgressEvent::DaemonReady { pid, attempts });
        Ok(())
    }

    /// Runs the tile job against a ready daemon. The report carries the
    /// job's own exit status.
    pub async fn run_tile_job(&mut self) -> PipelineResult<JobReport> {
        if self.state != SupervisorState::DaemonReady {
            return Err(PipelineError::precondition(
                "Rendering daemon is not ready for a tile job",
            ));
        }
        self.state = SupervisorState::JobRunning;

        let settings = &self.settings;
        let command = TileCommand {
            socket_path: settings.socket_path.clone(),
            tile_dir: settings.tile_dir.clone(),
            threads: settings.threads,
        };
        let mut log = SessionLog::open(&settings.session_log);

        let report = run_job(
            settings.strategy,
            settings.min_zoom,
            settings.max_zoom,
            JobContext {
                runner: self.runner.as_ref(),
                command: &command,
                tile_line: &settings.tile_line,
                progress: self.progress.as_ref(),
                log: &mut log,
            },
        )
        .await;

        self.state = match &report {
            Ok(r) if r.success() => SupervisorState::JobSucceeded,
            _ => SupervisorState::JobFailed,
        };
        report
    }

    pub async fn stop_daemon(&mut self) {
        if let Some(mut daemon) = self.daemon.take() {
            daemon.shutdown().await;
            self.state = SupervisorState::DaemonStopped;
        }
    }
}

fn clear_stale_socket(socket: &Path) -> PipelineResult<()> {
    if let Some(parent) = socket.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    if fs::symlink_metadata(socket).is_ok() {
        debug!(socket = %socket.display(), "Removing stale daemon socket");
        fs::remove_file(socket)
            .with_context(|| format!("Failed to remove stale socket {}", socket.display()))?;
    }
    Ok(())
}

/// Newest process named exactly like the daemon, if the lookup works.
async fn discover_pid(runner: &dyn CommandRunner) -> Option<u32> {
    let spec = CommandSpec::new("pgrep").args(["-n", "-x", DAEMON_PROGRAM]);
    match runner.output(&spec).await {
        Ok(out) if out.success() => out.stdout.trim().parse().ok(),
        Ok(_) => None,
        Err(e) => {
            debug!("pgrep unavailable: {:#}", e);
            None
        }
    }
}
