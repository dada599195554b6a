//! Shell command execution with output capture and timeout enforcement.

use std::io::Read;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use anyhow::{Context as _, Result};

/// How often the timeout loop polls a running child process.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Wrap `value` in single quotes for safe interpolation into `sh -c`.
#[must_use]
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Result of a completed command execution.
#[derive(Debug, Clone)]
pub struct ExecResult {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Whether the process exited with status zero.
    pub success: bool,
    /// Exit code, if the process exited normally.
    pub code: Option<i32>,
}

/// Outcome of running a command under a time budget.
#[derive(Debug, Clone)]
pub enum ExecOutcome {
    /// The command ran to completion (successfully or not).
    Completed(ExecResult),
    /// The command exceeded its budget and was killed.
    TimedOut,
}

/// Abstraction over subprocess execution.
///
/// The engine only depends on observable exit codes and captured output,
/// never on what the command does — implement this trait to swap in a
/// scripted mock during unit tests. The production implementation is
/// [`SystemExecutor`].
pub trait Executor: Send + Sync {
    /// Run `command` through `sh -c`, capturing output.
    ///
    /// A `timeout` of `None` waits indefinitely; otherwise the child is
    /// killed when the budget expires and [`ExecOutcome::TimedOut`] is
    /// returned. Non-zero exits are reported via [`ExecResult::success`],
    /// not as errors.
    ///
    /// # Errors
    ///
    /// Returns an error only if the command could not be spawned or waited
    /// on at all (environment failure).
    fn run_shell(&self, command: &str, timeout: Option<Duration>) -> Result<ExecOutcome>;

    /// Check if a program is available on `PATH`.
    fn which(&self, program: &str) -> bool;
}

/// Production [`Executor`] backed by real subprocesses.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemExecutor;

/// Drain a pipe to a lossily-decoded string on a separate thread.
fn spawn_reader<R: Read + Send + 'static>(pipe: Option<R>) -> std::thread::JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

/// Wait for `child`, polling `try_wait` so the deadline can interrupt it.
///
/// Returns `None` if the deadline expired and the child was killed.
fn wait_with_deadline(child: &mut Child, timeout: Option<Duration>) -> Result<Option<i32>> {
    let deadline = timeout.map(|t| Instant::now() + t);
    loop {
        if let Some(status) = child.try_wait().context("failed to wait on child")? {
            return Ok(Some(status.code().unwrap_or(-1)));
        }
        if let Some(deadline) = deadline {
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(None);
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

impl Executor for SystemExecutor {
    fn run_shell(&self, command: &str, timeout: Option<Duration>) -> Result<ExecOutcome> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn: {command}"))?;

        let stdout_handle = spawn_reader(child.stdout.take());
        let stderr_handle = spawn_reader(child.stderr.take());

        let code = wait_with_deadline(&mut child, timeout)?;
        let stdout = stdout_handle.join().unwrap_or_default();
        let stderr = stderr_handle.join().unwrap_or_default();

        Ok(match code {
            Some(code) => ExecOutcome::Completed(ExecResult {
                stdout,
                stderr,
                success: code == 0,
                code: Some(code),
            }),
            None => ExecOutcome::TimedOut,
        })
    }

    fn which(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Shared scripted executor for unit tests.
///
/// Maintains a FIFO queue of responses consumed one per `run_shell` call and
/// records every command line issued, so tests can assert both behaviour and
/// exact invocations. When the queue is empty any call returns a failed
/// `exit 1` result.
#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use anyhow::Result;

    use super::{ExecOutcome, ExecResult, Executor};

    /// One scripted response.
    #[derive(Debug, Clone)]
    pub enum Response {
        /// Complete with the given result.
        Complete(ExecResult),
        /// Report a timeout.
        TimedOut,
        /// Fail to spawn entirely (environment error).
        SpawnError(String),
    }

    /// A configurable scripted [`Executor`].
    #[derive(Debug, Default)]
    pub struct ScriptedExecutor {
        responses: Mutex<VecDeque<Response>>,
        calls: Mutex<Vec<String>>,
        which_result: bool,
    }

    impl ScriptedExecutor {
        /// A successful `exit 0` result with the given stdout.
        pub fn ok_result(stdout: &str) -> ExecResult {
            ExecResult {
                stdout: stdout.to_string(),
                stderr: String::new(),
                success: true,
                code: Some(0),
            }
        }

        /// A failed result with the given exit code and stderr.
        pub fn exit_result(code: i32, stderr: &str) -> ExecResult {
            ExecResult {
                stdout: String::new(),
                stderr: stderr.to_string(),
                success: code == 0,
                code: Some(code),
            }
        }

        /// Build an executor from an ordered response list.
        pub fn with_responses(responses: Vec<Response>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                calls: Mutex::new(Vec::new()),
                which_result: true,
            }
        }

        /// Single successful response with the given stdout.
        pub fn ok(stdout: &str) -> Self {
            Self::with_responses(vec![Response::Complete(Self::ok_result(stdout))])
        }

        /// Single failed response with the given exit code.
        pub fn exit(code: i32, stderr: &str) -> Self {
            Self::with_responses(vec![Response::Complete(Self::exit_result(code, stderr))])
        }

        /// Report every `which` lookup as missing.
        pub fn without_tools(mut self) -> Self {
            self.which_result = false;
            self
        }

        /// Every command line issued so far, in order.
        pub fn recorded_calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .clone()
        }
    }

    impl Executor for ScriptedExecutor {
        fn run_shell(&self, command: &str, _timeout: Option<Duration>) -> Result<ExecOutcome> {
            self.calls
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .push(command.to_string());
            let next = self
                .responses
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .pop_front();
            match next {
                Some(Response::Complete(result)) => Ok(ExecOutcome::Completed(result)),
                Some(Response::TimedOut) => Ok(ExecOutcome::TimedOut),
                Some(Response::SpawnError(message)) => Err(anyhow::anyhow!(message)),
                None => Ok(ExecOutcome::Completed(Self::exit_result(
                    1,
                    "unexpected call",
                ))),
            }
        }

        fn which(&self, _program: &str) -> bool {
            self.which_result
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    fn completed(outcome: ExecOutcome) -> ExecResult {
        match outcome {
            ExecOutcome::Completed(result) => result,
            ExecOutcome::TimedOut => panic!("expected completion, got timeout"),
        }
    }

    #[test]
    fn run_shell_captures_stdout() {
        let result = completed(SystemExecutor.run_shell("echo hello", None).unwrap());
        assert!(result.success);
        assert_eq!(result.stdout.trim(), "hello");
        assert_eq!(result.code, Some(0));
    }

    #[test]
    fn run_shell_captures_stderr_and_exit_code() {
        let result = completed(
            SystemExecutor
                .run_shell("echo oops >&2; exit 3", None)
                .unwrap(),
        );
        assert!(!result.success);
        assert_eq!(result.code, Some(3));
        assert_eq!(result.stderr.trim(), "oops");
    }

    #[test]
    fn run_shell_kills_on_timeout() {
        let start = Instant::now();
        let outcome = SystemExecutor
            .run_shell("sleep 30", Some(Duration::from_millis(100)))
            .unwrap();
        assert!(matches!(outcome, ExecOutcome::TimedOut));
        assert!(
            start.elapsed() < Duration::from_secs(5),
            "timeout should fire well before the sleep finishes"
        );
    }

    #[test]
    fn run_shell_within_timeout_completes() {
        let result = completed(
            SystemExecutor
                .run_shell("echo quick", Some(Duration::from_secs(10)))
                .unwrap(),
        );
        assert!(result.success);
    }

    #[test]
    fn which_finds_known_program() {
        assert!(SystemExecutor.which("sh"));
    }

    #[test]
    fn which_missing_program() {
        assert!(!SystemExecutor.which("this-program-does-not-exist-12345"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
