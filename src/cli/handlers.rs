//! Command handlers. Each returns the process exit code.

use super::commands::{ResetArgs, RunArgs, StateLocation, StatusArgs};
use super::output::StatusReport;
use crate::checkpoint::{CheckpointStore, PipelineStage};
use crate::config::{FileConfig, PipelineConfig};
use crate::error::{PipelineError, PipelineResult};
use crate::pipeline::PipelineDriver;
use crate::process::SystemRunner;
use crate::progress::LoggingHandler;
use anyhow::Context;
use nix::sys::signal::Signal;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{debug, error, info, warn};

/// Defaults and environment, then the config file, then `overlay`.
///
/// Without an explicit file, the per-user default file is read if it exists.
pub fn load_config<F>(config_file: Option<&Path>, overlay: F) -> PipelineResult<PipelineConfig>
where
    F: FnOnce(&mut PipelineConfig),
{
    let mut config = PipelineConfig::default();
    let file = match config_file {
        Some(path) => Some(path.to_path_buf()),
        None => FileConfig::default_path().filter(|p| p.is_file()),
    };
    if let Some(path) = file {
        debug!(path = %path.display(), "Loading configuration file");
        config.apply_file(FileConfig::load(&path)?);
    }
    overlay(&mut config);
    config.validate()?;
    Ok(config)
}

pub async fn handle_run(args: &RunArgs, config_file: Option<&Path>) -> i32 {
    let config = match load_config(config_file, |c| args.apply(c)) {
        Ok(config) => config,
        Err(e) => return report_failure(&e),
    };

    let driver = PipelineDriver::new(
        config,
        Arc::new(SystemRunner::new()),
        Arc::new(LoggingHandler),
    );

    match run_until_signal(driver.run()).await {
        Ok(summary) => {
            info!(
                executed = ?summary.executed,
                skipped = ?summary.skipped,
                "Run finished"
            );
            0
        }
        Err(e) => report_failure(&e),
    }
}

pub fn handle_status(args: &StatusArgs, config_file: Option<&Path>) -> i32 {
    let result = checkpoint_store(&args.location, config_file)
        .and_then(|store| StatusReport::collect(&store))
        .and_then(|report| report.render(args.format.into()));

    match result {
        Ok(text) => {
            print!("{}", text);
            0
        }
        Err(e) => report_failure(&e),
    }
}

pub fn handle_reset(args: &ResetArgs, config_file: Option<&Path>) -> i32 {
    let result = checkpoint_store(&args.location, config_file).and_then(|store| {
        match args.stage {
            Some(stage) => {
                let stage = PipelineStage::from(stage);
                store.invalidate(stage)?;
                info!(stage = %stage, "Cleared checkpoint and downstream checkpoints");
            }
            None => {
                store.clear_all()?;
                info!(state_dir = %store.dir().display(), "Cleared all checkpoints");
            }
        }
        Ok(())
    });

    match result {
        Ok(()) => 0,
        Err(e) => report_failure(&e),
    }
}

fn checkpoint_store(
    location: &StateLocation,
    config_file: Option<&Path>,
) -> PipelineResult<CheckpointStore> {
    let config = load_config(config_file, |c| location.apply(c))?;
    Ok(CheckpointStore::new(config.state_dir_path()))
}

/// Drives `work` until it finishes or SIGINT/SIGTERM arrives. On a signal
/// the future is dropped, which runs the daemon and engine guards it owns.
pub async fn run_until_signal<T, F>(work: F) -> PipelineResult<T>
where
    F: Future<Output = PipelineResult<T>>,
{
    let mut terminate =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;

    tokio::select! {
        result = work => result,
        _ = interrupt.recv() => {
            warn!("Interrupted, shutting down");
            Err(PipelineError::Cancelled { signal: Signal::SIGINT as i32 })
        }
        _ = terminate.recv() => {
            warn!("Terminated, shutting down");
            Err(PipelineError::Cancelled { signal: Signal::SIGTERM as i32 })
        }
    }
}

fn report_failure(e: &PipelineError) -> i32 {
    let code = e.exit_code();
    error!(exit_code = code, "{}", e);
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_load_config_layers() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("tilepipe.toml");
        fs::write(&file, "database = \"from_file\"\nmax_zoom = 9\n").unwrap();

        let config = load_config(Some(&file), |c| c.max_zoom = 11).unwrap();
        assert_eq!(config.database, "from_file");
        assert_eq!(config.max_zoom, 11);
    }

    #[test]
    fn test_load_config_validates_after_overlay() {
        let err = load_config(None, |c| {
            c.min_zoom = 5;
            c.max_zoom = 3;
        })
        .unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_PRECONDITION);
    }

    #[test]
    fn test_missing_config_file_is_config_error() {
        let err = load_config(Some(Path::new("/nonexistent/tp.toml")), |_| {}).unwrap_err();
        assert!(matches!(err, PipelineError::Config(_)));
    }

    #[tokio::test]
    #[serial]
    async fn test_run_until_signal_passes_result_through() {
        let value = run_until_signal(async { Ok::<_, PipelineError>(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    #[serial]
    async fn test_sigterm_cancels_and_drops_work() {
        struct Guard(Arc<std::sync::atomic::AtomicBool>);
        impl Drop for Guard {
            fn drop(&mut self) {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
            }
        }

        let dropped = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let guard = Guard(dropped.clone());
        let work = async move {
            let _guard = guard;
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, PipelineError>(())
        };

        let pid = nix::unistd::Pid::this();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = nix::sys::signal::kill(pid, Signal::SIGTERM);
        });

        let err = run_until_signal(work).await.unwrap_err();
        assert_eq!(err.exit_code(), 143);
        assert!(dropped.load(std::sync::atomic::Ordering::SeqCst));
    }
}
