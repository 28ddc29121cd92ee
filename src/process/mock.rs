use super::{ChildHandle, CommandOutput, CommandRunner, CommandSpec, StopSignal};
use anyhow::Result;
use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

/// Scripted reply for a mocked command.
#[derive(Debug, Clone, Default)]
pub struct MockReply {
    pub code: i32,
    pub stdout: String,
    pub lines: Vec<String>,
    /// Spawned children stay alive through SIGTERM; only SIGKILL ends them.
    pub ignore_terminate: bool,
}

impl MockReply {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn code(code: i32) -> Self {
        Self {
            code,
            ..Self::default()
        }
    }

    pub fn stdout(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            ..Self::default()
        }
    }

    pub fn lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = code;
        self
    }

    pub fn ignoring_terminate(mut self) -> Self {
        self.ignore_terminate = true;
        self
    }
}

type Responder = Arc<dyn Fn(&CommandSpec) -> MockReply + Send + Sync>;

/// Observable state of a child started through [`MockRunner::spawn`].
#[derive(Debug)]
pub struct MockChildState {
    pub pid: u32,
    pub spec: CommandSpec,
    ignore_terminate: bool,
    exited: AtomicBool,
    reaped: AtomicBool,
}

impl MockChildState {
    pub fn exited(&self) -> bool {
        self.exited.load(Ordering::SeqCst)
    }

    pub fn reaped(&self) -> bool {
        self.reaped.load(Ordering::SeqCst)
    }
}

/// In-memory [`CommandRunner`] for tests: records every call and answers from
/// per-program responders. Unscripted programs succeed with no output.
pub struct MockRunner {
    responders: Mutex<Vec<(String, Responder)>>,
    calls: Mutex<Vec<CommandSpec>>,
    signals: Mutex<Vec<(u32, StopSignal)>>,
    children: Mutex<Vec<Arc<MockChildState>>>,
    next_pid: AtomicU32,
}

impl MockRunner {
    pub fn new() -> Self {
        Self {
            responders: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            signals: Mutex::new(Vec::new()),
            children: Mutex::new(Vec::new()),
            next_pid: AtomicU32::new(4000),
        }
    }

    /// Registers a responder for `program`. Later registrations take precedence.
    pub fn on<F>(&self, program: &str, responder: F)
    where
        F: Fn(&CommandSpec) -> MockReply + Send + Sync + 'static,
    {
        self.responders
            .lock()
            .unwrap()
            .insert(0, (program.to_string(), Arc::new(responder)));
    }

    pub fn reply(&self, program: &str, reply: MockReply) {
        self.on(program, move |_| reply.clone());
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, program: &str) -> Vec<CommandSpec> {
        self.calls()
            .into_iter()
            .filter(|c| c.program == program)
            .collect()
    }

    pub fn count(&self, program: &str) -> usize {
        self.calls_to(program).len()
    }

    pub fn signals(&self) -> Vec<(u32, StopSignal)> {
        self.signals.lock().unwrap().clone()
    }

    pub fn children(&self) -> Vec<Arc<MockChildState>> {
        self.children.lock().unwrap().clone()
    }

    pub fn clear_calls(&self) {
        self.calls.lock().unwrap().clear();
    }

    fn respond(&self, spec: &CommandSpec) -> MockReply {
        self.calls.lock().unwrap().push(spec.clone());
        let responder = self
            .responders
            .lock()
            .unwrap()
            .iter()
            .find(|(program, _)| *program == spec.program)
            .map(|(_, r)| r.clone());
        match responder {
            Some(r) => r(spec),
            None => MockReply::ok(),
        }
    }
}

impl Default for MockRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for MockRunner {
    async fn output(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let reply = self.respond(spec);
        Ok(CommandOutput {
            code: reply.code,
            stdout: reply.stdout,
            stderr: String::new(),
        })
    }

    async fn stream(
        &self,
        spec: &CommandSpec,
        on_line: &mut (dyn for<'a> FnMut(&'a str) + Send),
    ) -> Result<i32> {
        let reply = self.respond(spec);
        for line in &reply.lines {
            on_line(line);
        }
        Ok(reply.code)
    }

    fn run_blocking(&self, spec: &CommandSpec) -> Result<i32> {
        Ok(self.respond(spec).code)
    }

    fn spawn(&self, spec: &CommandSpec, _log: Option<&Path>) -> Result<Box<dyn ChildHandle>> {
        let reply = self.respond(spec);
        let state = Arc::new(MockChildState {
            pid: self.next_pid.fetch_add(1, Ordering::SeqCst),
            spec: spec.clone(),
            ignore_terminate: reply.ignore_terminate,
            exited: AtomicBool::new(reply.code != 0),
            reaped: AtomicBool::new(false),
        });
        self.children.lock().unwrap().push(state.clone());
        Ok(Box::new(MockChild {
            state,
            code: reply.code,
        }))
    }

    fn signal(&self, pid: u32, signal: StopSignal) -> Result<()> {
        self.signals.lock().unwrap().push((pid, signal));
        if let Some(child) = self.children().iter().find(|c| c.pid == pid) {
            if signal == StopSignal::Kill || !child.ignore_terminate {
                child.exited.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }
}

struct MockChild {
    state: Arc<MockChildState>,
    code: i32,
}

impl ChildHandle for MockChild {
    fn id(&self) -> u32 {
        self.state.pid
    }

    fn try_wait(&mut self) -> Result<Option<i32>> {
        if self.state.exited() {
            self.state.reaped.store(true, Ordering::SeqCst);
            Ok(Some(self.code))
        } else {
            Ok(None)
        }
    }

    fn wait(&mut self) -> Result<i32> {
        self.state.exited.store(true, Ordering::SeqCst);
        self.state.reaped.store(true, Ordering::SeqCst);
        Ok(self.code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unscripted_program_succeeds() {
        let runner = MockRunner::new();
        let out = runner.output(&CommandSpec::new("psql")).await.unwrap();
        assert!(out.success());
        assert_eq!(runner.count("psql"), 1);
    }

    #[tokio::test]
    async fn test_latest_responder_wins() {
        let runner = MockRunner::new();
        runner.reply("psql", MockReply::stdout("first"));
        runner.reply("psql", MockReply::stdout("second"));
        let out = runner.output(&CommandSpec::new("psql")).await.unwrap();
        assert_eq!(out.stdout, "second");
    }

    #[tokio::test]
    async fn test_stream_feeds_lines() {
        let runner = MockRunner::new();
        runner.reply("render_list", MockReply::lines(["a", "b"]).with_code(2));
        let mut seen = Vec::new();
        let code = runner
            .stream(&CommandSpec::new("render_list"), &mut |l: &str| {
                seen.push(l.to_string())
            })
            .await
            .unwrap();
        assert_eq!(code, 2);
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_stream_through_shared_runner() {
        let runner: Arc<dyn CommandRunner> = {
            let mock = MockRunner::new();
            mock.reply("osm2pgsql", MockReply::lines(["Processing: Node(10k)", "done"]));
            Arc::new(mock)
        };
        let mut last = String::new();
        let code = runner
            .stream(&CommandSpec::new("osm2pgsql"), &mut |line: &str| {
                last.clear();
                last.push_str(line);
            })
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(last, "done");
    }

    #[test]
    fn test_spawned_child_reaped_after_signal() {
        let runner = MockRunner::new();
        let mut child = runner.spawn(&CommandSpec::new("renderd"), None).unwrap();
        assert_eq!(child.try_wait().unwrap(), None);

        runner.signal(child.id(), StopSignal::Terminate).unwrap();
        assert_eq!(child.try_wait().unwrap(), Some(0));
        assert!(runner.children()[0].reaped());
    }
}
