//! Command execution abstraction.
//!
//! Every external tool the daemon drives (decrypt, eject, `ssh-add`, session
//! lock, desktop notifications) goes through [`ShellExecutor`], so the state
//! machine can be exercised with a recording fake in tests.
//!
//! [`SystemShell`] starts each child in its own process group. A deadline
//! covers the whole group: anything the tool left running that still holds
//! its output pipes is killed once the deadline passes.

use std::io::{ErrorKind, Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tracing::{debug, warn};

use crate::error::{Error, IoResultExt, Result};

/// How often a running child is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Time a child gets between SIGTERM and SIGKILL once its deadline passed.
const TERMINATE_GRACE: Duration = Duration::from_millis(500);

/// A fully described command invocation.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use usbkey_core::executor::CommandSpec;
///
/// let spec = CommandSpec::new("ssh-add")
///     .args(["-t", "7200", "/Volumes/usbkey/id_ed25519"])
///     .timeout(Duration::from_secs(30));
/// assert_eq!(spec.display(), "ssh-add -t 7200 /Volumes/usbkey/id_ed25519");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Bytes written to the child's stdin, which is then closed.
    pub stdin: Option<Vec<u8>>,
    /// Upper bound on wall-clock time; `None` waits forever.
    pub timeout: Option<Duration>,
}

impl CommandSpec {
    /// Creates a spec for `program` with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Self::default()
        }
    }

    /// Appends a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Pipes `input` into the child's stdin.
    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }

    /// Bounds the command's run time.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Human-readable command line. Never includes stdin contents.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, or -1 when the child was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Returns true if the command exited with code 0.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs external commands.
pub trait ShellExecutor: Send + Sync {
    /// Runs the command to completion and captures its output.
    ///
    /// A non-zero exit code is not an error at this level.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;

    /// Runs the command and turns a non-zero exit code into
    /// [`Error::CommandExit`].
    fn run_checked(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(spec)?;
        if !output.success() {
            return Err(Error::CommandExit {
                command: spec.display(),
                code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output)
    }
}

/// [`ShellExecutor`] backed by `std::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemShell {
    default_timeout: Option<Duration>,
}

impl SystemShell {
    /// Creates a shell with no default timeout.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a shell that applies `timeout` to specs that carry none.
    pub fn with_default_timeout(timeout: Duration) -> Self {
        Self {
            default_timeout: Some(timeout),
        }
    }
}

impl ShellExecutor for SystemShell {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let command_line = spec.display();
        debug!(command = %command_line, "running command");

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .command_context(&command_line)?;

        let writer = match (spec.stdin.clone(), child.stdin.take()) {
            (Some(input), Some(mut stdin)) => Some(thread::spawn(move || {
                // The child may exit without draining stdin.
                match stdin.write_all(&input) {
                    Err(e) if e.kind() != ErrorKind::BrokenPipe => Err(e),
                    _ => Ok(()),
                }
            })),
            _ => None,
        };
        let stdout_reader = child.stdout.take().map(spawn_reader);
        let stderr_reader = child.stderr.take().map(spawn_reader);

        let timeout = spec.timeout.or(self.default_timeout);
        let deadline = timeout.map(|limit| Instant::now() + limit);
        let group = Pid::from_raw(child.id() as i32);
        let status = match timeout {
            Some(limit) => wait_with_deadline(&mut child, limit, &command_line)?,
            None => child.wait().command_context(&command_line)?,
        };

        if let Some(handle) = writer
            && let Ok(Err(e)) = handle.join()
        {
            warn!(command = %command_line, error = %e, "failed to feed stdin");
        }

        let stdout = collect_pipe(stdout_reader, deadline, group, &command_line);
        let stderr = collect_pipe(stderr_reader, deadline, group, &command_line);
        Ok(CommandOutput {
            exit_code: status.code().unwrap_or(-1),
            stdout,
            stderr,
        })
    }
}

/// Polls the child until it exits or `limit` passes.
///
/// On expiry the child gets SIGTERM, then SIGKILL after a short grace period,
/// and the call fails with [`Error::CommandTimeout`].
fn wait_with_deadline(child: &mut Child, limit: Duration, command: &str) -> Result<ExitStatus> {
    let deadline = Instant::now() + limit;
    loop {
        if let Some(status) = child.try_wait().command_context(command)? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    warn!(command, secs = limit.as_secs(), "command timed out; terminating");
    let group = Pid::from_raw(child.id() as i32);
    if let Err(e) = killpg(group, Signal::SIGTERM) {
        debug!(command, error = %e, "SIGTERM failed");
    }

    let grace_deadline = Instant::now() + TERMINATE_GRACE;
    while Instant::now() < grace_deadline {
        if child.try_wait().command_context(command)?.is_some() {
            return Err(Error::CommandTimeout {
                command: command.to_string(),
                secs: limit.as_secs(),
            });
        }
        thread::sleep(POLL_INTERVAL);
    }

    let _ = killpg(group, Signal::SIGKILL);
    let _ = child.kill();
    let _ = child.wait();
    Err(Error::CommandTimeout {
        command: command.to_string(),
        secs: limit.as_secs(),
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut pipe: R) -> Receiver<Vec<u8>> {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        let _ = tx.send(buf);
    });
    rx
}

/// Waits for a pipe to reach EOF, at most until `deadline`.
///
/// A pipe still open at the deadline is held by something the child left
/// behind; the child's process group is killed and whatever was read within
/// a short grace period is returned.
fn collect_pipe(
    reader: Option<Receiver<Vec<u8>>>,
    deadline: Option<Instant>,
    group: Pid,
    command: &str,
) -> String {
    let Some(reader) = reader else {
        return String::new();
    };
    let bytes = match deadline {
        None => reader.recv().ok(),
        Some(deadline) => reader
            .recv_timeout(deadline.saturating_duration_since(Instant::now()))
            .ok()
            .or_else(|| {
                warn!(command, "output still held open after exit; killing process group");
                if let Err(e) = killpg(group, Signal::SIGKILL) {
                    debug!(command, error = %e, "SIGKILL failed");
                }
                reader.recv_timeout(TERMINATE_GRACE).ok()
            }),
    };
    bytes
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_without_args() {
        assert_eq!(CommandSpec::new("lsblk").display(), "lsblk");
    }

    #[test]
    fn test_display_hides_stdin() {
        let spec = CommandSpec::new("hdiutil")
            .args(["attach", "-stdinpass", "/Volumes/KEY/osx.sparseimage"])
            .stdin(b"hunter2".to_vec());
        let shown = spec.display();
        assert!(!shown.contains("hunter2"));
        assert_eq!(shown, "hdiutil attach -stdinpass /Volumes/KEY/osx.sparseimage");
    }

    #[test]
    fn test_run_captures_stdout_and_exit_code() {
        let shell = SystemShell::new();
        let output = shell
            .run(&CommandSpec::new("sh").args(["-c", "echo hello; exit 3"]))
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "hello");
        assert!(!output.success());
    }

    #[test]
    fn test_run_pipes_stdin() {
        let shell = SystemShell::new();
        let output = shell
            .run(&CommandSpec::new("cat").stdin(b"key-bytes".to_vec()))
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, "key-bytes");
    }

    #[test]
    fn test_run_checked_reports_exit() {
        let shell = SystemShell::new();
        let err = shell
            .run_checked(&CommandSpec::new("sh").args(["-c", "echo boom >&2; exit 1"]))
            .unwrap_err();
        match err {
            Error::CommandExit { code, stderr, .. } => {
                assert_eq!(code, 1);
                assert_eq!(stderr, "boom");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_run_times_out() {
        let shell = SystemShell::with_default_timeout(Duration::from_millis(200));
        let started = Instant::now();
        let err = shell.run(&CommandSpec::new("sleep").arg("10")).unwrap_err();
        assert_eq!(err.kind(), "command_timeout");
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_timeout_kills_the_whole_group() {
        let shell = SystemShell::with_default_timeout(Duration::from_millis(300));
        let started = Instant::now();
        let err = shell
            .run(&CommandSpec::new("sh").args(["-c", "sleep 8 & sleep 8"]))
            .unwrap_err();
        assert_eq!(err.kind(), "command_timeout");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_background_child_holding_pipes_is_bounded() {
        let shell = SystemShell::with_default_timeout(Duration::from_millis(500));
        let started = Instant::now();
        let output = shell
            .run(&CommandSpec::new("sh").args(["-c", "sleep 8 & echo started; exit 0"]))
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "started");
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn test_missing_program_is_execution_error() {
        let shell = SystemShell::new();
        let err = shell
            .run(&CommandSpec::new("usbkey-definitely-not-a-binary"))
            .unwrap_err();
        assert_eq!(err.kind(), "command_execution");
    }
}
