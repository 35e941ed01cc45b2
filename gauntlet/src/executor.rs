use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Mutex;

use crate::matrix::Step;
use crate::report::AttemptOutcome;
use crate::runtime::{ExecutionRecord, ShutdownToken, StepExecutor};

/// Bounded tail buffer for a step's combined output stream.
///
/// Large outputs are not held in memory: once the buffer is full the
/// oldest line is dropped and counted, and the rendered tail carries an
/// omission marker.
#[derive(Debug)]
pub struct OutputTail {
    lines: VecDeque<String>,
    max_lines: usize,
    dropped: usize,
}

impl OutputTail {
    pub fn new(max_lines: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(max_lines.min(1024)),
            max_lines,
            dropped: 0,
        }
    }

    pub fn push(&mut self, line: String) {
        if self.max_lines == 0 {
            self.dropped += 1;
            return;
        }
        if self.lines.len() == self.max_lines {
            self.lines.pop_front();
            self.dropped += 1;
        }
        self.lines.push_back(line);
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Render the tail, prefixed with an omission marker when lines
    /// were dropped.
    pub fn to_lines(&self) -> Vec<String> {
        let mut out = Vec::with_capacity(self.lines.len() + 1);
        if self.dropped > 0 {
            out.push(format!("[... {} earlier lines omitted]", self.dropped));
        }
        out.extend(self.lines.iter().cloned());
        out
    }
}

/// Runs a step's command as an isolated child process.
///
/// The command runs under `sh -c` in its own process group, with a
/// snapshot of the parent environment plus the step's declared
/// overrides (the parent environment is never mutated). Combined
/// stdout/stderr is streamed line-wise into a bounded [`OutputTail`].
/// On timeout or cancellation the whole process group is terminated,
/// not just the direct child, so no subprocesses are orphaned.
#[derive(Clone, Debug)]
pub struct ProcessExecutor {
    shell: String,
    tail_lines: usize,
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self {
            shell: "/bin/sh".to_string(),
            tail_lines: 64,
        }
    }

    /// Override the shell used to interpret step commands.
    #[must_use]
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    /// Bound on retained output lines per attempt.
    #[must_use]
    pub fn with_tail_lines(mut self, tail_lines: usize) -> Self {
        self.tail_lines = tail_lines;
        self
    }

    fn exec_error(message: String) -> ExecutionRecord {
        ExecutionRecord {
            outcome: AttemptOutcome::ExecError { message },
            output_tail: Vec::new(),
        }
    }

    fn build_command(&self, step: &Step) -> Command {
        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&step.command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd.envs(&step.env);
        if let Some(variant) = &step.variant {
            cmd.env("GAUNTLET_VARIANT", variant);
        }
        if let Some(tp) = step.tp_degree {
            cmd.env("GAUNTLET_TP_DEGREE", tp.to_string());
        }
        if let Some(dir) = &step.working_dir {
            cmd.current_dir(dir);
        }
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }
}

#[async_trait]
impl StepExecutor for ProcessExecutor {
    async fn execute(
        &self,
        step: &Step,
        timeout: Duration,
        shutdown: &ShutdownToken,
    ) -> ExecutionRecord {
        if let Some(dir) = &step.working_dir {
            if !dir.is_dir() {
                return Self::exec_error(format!(
                    "working directory `{}` does not exist",
                    dir.display()
                ));
            }
        }

        let mut child = match self.build_command(step).spawn() {
            Ok(child) => child,
            Err(err) => {
                return Self::exec_error(format!("failed to spawn `{}`: {err}", self.shell))
            }
        };

        let tail = Arc::new(Mutex::new(OutputTail::new(self.tail_lines)));
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(drain_lines(stdout, Arc::clone(&tail))));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(drain_lines(stderr, Arc::clone(&tail))));
        }

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => match status.code() {
                    Some(0) => AttemptOutcome::Passed,
                    Some(code) => AttemptOutcome::Failed { exit_code: code },
                    // Killed by a signal outside our control.
                    None => AttemptOutcome::Failed { exit_code: -1 },
                },
                Err(err) => AttemptOutcome::ExecError {
                    message: format!("wait failed: {err}"),
                },
            },
            _ = tokio::time::sleep(timeout) => {
                tracing::warn!(step = %step.name, timeout_secs = timeout.as_secs_f64(), "step timed out, killing process tree");
                kill_process_tree(&mut child).await;
                AttemptOutcome::TimedOut
            }
            _ = shutdown.cancelled() => {
                tracing::info!(step = %step.name, "cancellation requested, killing process tree");
                kill_process_tree(&mut child).await;
                AttemptOutcome::Cancelled
            }
        };

        // Pipes close once the process group is gone, so the readers
        // always finish.
        for reader in readers {
            let _ = reader.await;
        }

        let output_tail = tail.lock().await.to_lines();
        ExecutionRecord {
            outcome,
            output_tail,
        }
    }
}

async fn drain_lines<R>(reader: R, tail: Arc<Mutex<OutputTail>>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        tail.lock().await.push(line);
    }
}

/// Terminate the child's entire process group, then reap the child.
async fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child was spawned as its own group leader, so killing the
        // group takes any subprocesses down with it.
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    if let Err(err) = child.kill().await {
        tracing::debug!("child already exited before kill: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_bounds_retained_lines() {
        let mut tail = OutputTail::new(3);
        for i in 0..10 {
            tail.push(format!("line{i}"));
        }
        let lines = tail.to_lines();
        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("7 earlier lines omitted"));
        assert_eq!(lines[3], "line9");
    }

    #[test]
    fn tail_without_overflow_has_no_marker() {
        let mut tail = OutputTail::new(8);
        tail.push("only".to_string());
        assert_eq!(tail.to_lines(), vec!["only".to_string()]);
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::flavor::FlavorId;
        use std::collections::BTreeMap;
        use std::time::Instant;

        fn step(command: &str) -> Step {
            Step {
                name: "test-step".to_string(),
                flavor: FlavorId::from("g2"),
                command: command.to_string(),
                tp_degree: None,
                env: BTreeMap::new(),
                working_dir: None,
                variant: None,
            }
        }

        async fn execute(step: &Step) -> ExecutionRecord {
            ProcessExecutor::new()
                .execute(step, Duration::from_secs(10), &ShutdownToken::new())
                .await
        }

        #[tokio::test]
        async fn exit_zero_passes() {
            let record = execute(&step("true")).await;
            assert_eq!(record.outcome, AttemptOutcome::Passed);
        }

        #[tokio::test]
        async fn nonzero_exit_fails_in_band() {
            let record = execute(&step("exit 3")).await;
            assert_eq!(record.outcome, AttemptOutcome::Failed { exit_code: 3 });
        }

        #[tokio::test]
        async fn env_overrides_and_variant_reach_the_child() {
            let mut s = step(r#"test "$GAUNTLET_SMOKE" = on && test "$GAUNTLET_VARIANT" = v1"#);
            s.env.insert("GAUNTLET_SMOKE".to_string(), "on".to_string());
            s.variant = Some("v1".to_string());
            let record = execute(&s).await;
            assert_eq!(record.outcome, AttemptOutcome::Passed);
            // The override never leaked into the orchestrator's env.
            assert!(std::env::var("GAUNTLET_SMOKE").is_err());
        }

        #[tokio::test]
        async fn captures_combined_output_tail() {
            let record = execute(&step("echo out; echo err >&2")).await;
            assert_eq!(record.outcome, AttemptOutcome::Passed);
            assert_eq!(record.output_tail.len(), 2);
        }

        #[tokio::test]
        async fn missing_working_dir_is_out_of_band() {
            let mut s = step("true");
            s.working_dir = Some("/nonexistent/gauntlet-workdir".into());
            let record = execute(&s).await;
            assert!(matches!(record.outcome, AttemptOutcome::ExecError { .. }));
        }

        #[tokio::test]
        async fn timeout_kills_the_process_tree() {
            let start = Instant::now();
            let record = ProcessExecutor::new()
                .execute(
                    &step("sleep 30"),
                    Duration::from_millis(200),
                    &ShutdownToken::new(),
                )
                .await;
            assert_eq!(record.outcome, AttemptOutcome::TimedOut);
            assert!(start.elapsed() < Duration::from_secs(5));
        }

        #[tokio::test]
        async fn cancellation_interrupts_a_running_step() {
            let shutdown = ShutdownToken::new();
            let canceller = shutdown.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                canceller.cancel();
            });
            let record = ProcessExecutor::new()
                .execute(&step("sleep 30"), Duration::from_secs(60), &shutdown)
                .await;
            assert_eq!(record.outcome, AttemptOutcome::Cancelled);
        }
    }
}
