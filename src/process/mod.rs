//! External command execution
//!
//! Every external tool the pipeline drives (psql, osm2pgsql, renderd,
//! render_list, ...) goes through [`CommandRunner`], so the orchestration
//! logic can be exercised against [`MockRunner`] without a database or a
//! rendering stack installed.

mod mock;
mod system;

pub use mock::{MockChildState, MockReply, MockRunner};
pub use system::SystemRunner;

use anyhow::Result;
use async_trait::async_trait;
use std::fmt;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub current_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            current_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.display().to_string())
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// Value following `flag`, e.g. `value_of("-z")` on `render_list -z 3`.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        self.args
            .iter()
            .position(|a| a == flag)
            .and_then(|i| self.args.get(i + 1))
            .map(String::as_str)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                write!(f, " '{}'", arg.replace('\'', "'\\''"))?;
            } else {
                write!(f, " {}", arg)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Terminate,
    Kill,
}

/// A background process started with [`CommandRunner::spawn`].
pub trait ChildHandle: Send {
    fn id(&self) -> u32;

    /// Exit code if the process has already exited.
    fn try_wait(&mut self) -> Result<Option<i32>>;

    /// Blocks until the process exits and reaps it.
    fn wait(&mut self) -> Result<i32>;
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs to completion, capturing stdout and stderr.
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Runs to completion, handing every stdout/stderr line to `on_line` as it
    /// arrives. The returned code is the child's own exit status; nothing
    /// `on_line` does can change it.
    async fn stream(
        &self,
        spec: &CommandSpec,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<i32>;

    /// Synchronous variant for teardown paths that run inside `Drop`.
    fn run_blocking(&self, spec: &CommandSpec) -> Result<i32>;

    /// Starts a background process with stdout/stderr appended to `log`
    /// (or discarded).
    fn spawn(&self, spec: &CommandSpec, log: Option<&Path>) -> Result<Box<dyn ChildHandle>>;

    fn signal(&self, pid: u32, signal: StopSignal) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_quotes_whitespace() {
        let spec = CommandSpec::new("psql")
            .args(["-c", "SELECT 1"])
            .arg("it's");
        assert_eq!(spec.to_string(), "psql -c 'SELECT 1' it's");
    }

    #[test]
    fn test_value_of() {
        let spec = CommandSpec::new("render_list").args(["-z", "3", "-Z", "5"]);
        assert_eq!(spec.value_of("-z"), Some("3"));
        assert_eq!(spec.value_of("-Z"), Some("5"));
        assert_eq!(spec.value_of("-n"), None);
        assert!(spec.has_arg("-Z"));
    }
}
