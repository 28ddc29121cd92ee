use super::{ChildHandle, CommandOutput, CommandRunner, CommandSpec, StopSignal};
use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::fs::OpenOptions;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

/// Runs commands on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl SystemRunner {
    pub fn new() -> Self {
        Self
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

fn tokio_command(spec: &CommandSpec) -> tokio::process::Command {
    let mut cmd = tokio::process::Command::new(&spec.program);
    cmd.args(&spec.args);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &spec.current_dir {
        cmd.current_dir(dir);
    }
    cmd
}

fn std_command(spec: &CommandSpec) -> std::process::Command {
    let mut cmd = std::process::Command::new(&spec.program);
    cmd.args(&spec.args);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &spec.current_dir {
        cmd.current_dir(dir);
    }
    cmd
}

/// Forwards every line until EOF. Lines are decoded lossily and the pipe is
/// drained even once nobody listens, so the child never sees a closed pipe.
async fn forward_lines<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut listening = true;
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                if !listening {
                    continue;
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']);
                listening = tx.send(line.to_string()).is_ok();
            }
            Err(e) => {
                debug!(error = %e, "Stopped reading child output");
                break;
            }
        }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        debug!(command = %spec, "Running");
        let output = tokio_command(spec)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await
            .with_context(|| format!("Failed to execute {}", spec.program))?;

        Ok(CommandOutput {
            code: exit_code(output.status),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn stream(
        &self,
        spec: &CommandSpec,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<i32> {
        debug!(command = %spec, "Streaming");
        let mut child = tokio_command(spec)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to execute {}", spec.program))?;

        let stdout = child.stdout.take().context("Child stdout not captured")?;
        let stderr = child.stderr.take().context("Child stderr not captured")?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let stdout_task = tokio::spawn(forward_lines(stdout, tx.clone()));
        let stderr_task = tokio::spawn(forward_lines(stderr, tx));

        while let Some(line) = rx.recv().await {
            on_line(&line);
        }

        let status = child
            .wait()
            .await
            .with_context(|| format!("Failed to wait for {}", spec.program))?;
        let _ = stdout_task.await;
        let _ = stderr_task.await;

        Ok(exit_code(status))
    }

    fn run_blocking(&self, spec: &CommandSpec) -> Result<i32> {
        debug!(command = %spec, "Running (blocking)");
        let status = std_command(spec)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .with_context(|| format!("Failed to execute {}", spec.program))?;
        Ok(exit_code(status))
    }

    fn spawn(&self, spec: &CommandSpec, log: Option<&Path>) -> Result<Box<dyn ChildHandle>> {
        debug!(command = %spec, "Spawning background process");
        let mut cmd = std_command(spec);
        cmd.stdin(Stdio::null());

        match log {
            Some(path) => {
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .with_context(|| format!("Failed to open log {}", path.display()))?;
                let err_file = file
                    .try_clone()
                    .context("Failed to duplicate log file handle")?;
                cmd.stdout(Stdio::from(file)).stderr(Stdio::from(err_file));
            }
            None => {
                cmd.stdout(Stdio::null()).stderr(Stdio::null());
            }
        }

        let child = cmd
            .spawn()
            .with_context(|| format!("Failed to start {}", spec.program))?;
        Ok(Box::new(SystemChild { child }))
    }

    fn signal(&self, pid: u32, signal: StopSignal) -> Result<()> {
        let sig = match signal {
            StopSignal::Terminate => Signal::SIGTERM,
            StopSignal::Kill => Signal::SIGKILL,
        };
        let raw = i32::try_from(pid).context("Process id out of range")?;
        kill(Pid::from_raw(raw), sig).with_context(|| format!("Failed to send {:?} to {}", sig, pid))
    }
}

struct SystemChild {
    child: std::process::Child,
}

impl ChildHandle for SystemChild {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        Ok(self
            .child
            .try_wait()
            .context("Failed to poll child process")?
            .map(exit_code))
    }

    fn wait(&mut self) -> Result<i32> {
        Ok(exit_code(
            self.child.wait().context("Failed to wait for child process")?,
        ))
    }
}
