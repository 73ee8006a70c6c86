//! External tool invocation shared by the CLI-driven backends

use std::ffi::OsStr;
use std::io::Read;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{BackendError, BackendResult};

/// Applied to lifecycle tool calls that have no caller-provided deadline
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

const POLL_MIN: Duration = Duration::from_millis(5);
const POLL_MAX: Duration = Duration::from_millis(100);

/// Captured result of a finished process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    /// `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Best human-readable failure text: stderr, else stdout
    pub fn message(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

/// Run `program` to completion, capturing its output.
///
/// The child runs in its own process group. Once `timeout` elapses the whole
/// group is killed, including background processes that still hold the
/// output pipes, and the child is reaped.
pub fn run<I, S>(program: impl AsRef<OsStr>, args: I, timeout: Duration) -> BackendResult<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let name = program.to_string_lossy().into_owned();
    let deadline = Instant::now() + timeout;

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    own_process_group(&mut command);
    let mut child = command.spawn().map_err(|e| spawn_error(&name, e))?;

    let (tx, rx) = mpsc::channel();
    drain(child.stdout.take(), Stream::Stdout, tx.clone());
    drain(child.stderr.take(), Stream::Stderr, tx);

    let status = wait_until(&mut child, &name, deadline, timeout)?;

    // The pipes close only when every process holding them is gone
    let mut stdout = String::new();
    let mut stderr = String::new();
    loop {
        match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
            Ok((Stream::Stdout, text)) => stdout = text,
            Ok((Stream::Stderr, text)) => stderr = text,
            Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {
                kill_group(&child);
                tracing::warn!(
                    program = %name,
                    timeout_ms = timeout.as_millis() as u64,
                    "Command left processes holding its output, killed"
                );
                return Err(BackendError::Timeout(timeout));
            }
        }
    }

    Ok(CommandOutput {
        status: status.code(),
        stdout,
        stderr,
    })
}

/// Run `program` with all stdio detached.
///
/// Needed for tools that leave a long-lived process holding their standard
/// streams (e.g. `crun create`), where reading to EOF would never finish.
pub fn run_detached<I, S>(program: impl AsRef<OsStr>, args: I, timeout: Duration) -> BackendResult<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let name = program.to_string_lossy().into_owned();

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    own_process_group(&mut command);
    let mut child = command.spawn().map_err(|e| spawn_error(&name, e))?;

    let status = wait_until(&mut child, &name, Instant::now() + timeout, timeout)?;
    Ok(CommandOutput {
        status: status.code(),
        stdout: String::new(),
        stderr: String::new(),
    })
}

/// Run `program` and return its stdout, classifying any failure
pub fn check<I, S>(program: impl AsRef<OsStr>, args: I, timeout: Duration) -> BackendResult<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let program = program.as_ref();
    let output = run(program, args, timeout)?;
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(classify(&program.to_string_lossy(), &output))
    }
}

/// Map a failed invocation onto the backend error taxonomy
pub fn classify(program: &str, output: &CommandOutput) -> BackendError {
    let message = format!("{}: {}", program, output.message());
    let lower = message.to_ascii_lowercase();

    if lower.contains("does not exist")
        || lower.contains("doesn't exist")
        || lower.contains("not found")
        || lower.contains("no such")
    {
        BackendError::NotFound(message)
    } else if lower.contains("permission denied") || lower.contains("not permitted") {
        BackendError::PermissionDenied(message)
    } else if lower.contains("invalid") || lower.contains("usage:") {
        BackendError::InvalidInput(message)
    } else {
        BackendError::RuntimeError {
            message,
            exit_code: output.status,
        }
    }
}

fn spawn_error(program: &str, e: std::io::Error) -> BackendError {
    match e.kind() {
        std::io::ErrorKind::NotFound => {
            BackendError::UnsupportedOperation(format!("{} is not installed", program))
        }
        std::io::ErrorKind::PermissionDenied => {
            BackendError::PermissionDenied(format!("cannot execute {}: {}", program, e))
        }
        _ => BackendError::runtime(format!("failed to spawn {}: {}", program, e)),
    }
}

fn wait_until(child: &mut Child, program: &str, deadline: Instant, timeout: Duration) -> BackendResult<ExitStatus> {
    let mut poll = POLL_MIN;

    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() >= deadline => {
                kill_group(child);
                let _ = child.kill();
                let _ = child.wait();
                tracing::warn!(program = %program, timeout_ms = timeout.as_millis() as u64, "Command timed out, killed");
                return Err(BackendError::Timeout(timeout));
            }
            Ok(None) => {
                thread::sleep(poll.min(deadline.saturating_duration_since(Instant::now())).max(POLL_MIN));
                poll = (poll * 2).min(POLL_MAX);
            }
            Err(e) => {
                kill_group(child);
                let _ = child.kill();
                let _ = child.wait();
                return Err(BackendError::runtime(format!("waiting for {} failed: {}", program, e)));
            }
        }
    }
}

#[cfg(unix)]
fn own_process_group(command: &mut Command) {
    use std::os::unix::process::CommandExt;
    command.process_group(0);
}

#[cfg(not(unix))]
fn own_process_group(_command: &mut Command) {}

/// SIGKILL every process in the child's group; the group id is the child pid
#[cfg(unix)]
fn kill_group(child: &Child) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        tracing::debug!(pid = child.id(), error = %e, "Process group already gone");
    }
}

#[cfg(not(unix))]
fn kill_group(_child: &Child) {}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>, stream: Stream, tx: Sender<(Stream, String)>) {
    if let Some(mut pipe) = pipe {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            let _ = tx.send((stream, String::from_utf8_lossy(&buf).into_owned()));
        });
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn output(status: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            status: Some(status),
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    #[test]
    fn test_run_captures_output() {
        let out = run("sh", ["-c", "echo hello; echo oops >&2; exit 3"], Duration::from_secs(10)).unwrap();
        assert_eq!(out.status, Some(3));
        assert_eq!(out.stdout.trim(), "hello");
        assert_eq!(out.message(), "oops");
        assert!(!out.success());
    }

    #[test]
    fn test_check_returns_stdout() {
        let stdout = check("sh", ["-c", "printf ok"], Duration::from_secs(10)).unwrap();
        assert_eq!(stdout, "ok");
    }

    #[test]
    fn test_timeout_kills_child() {
        let started = Instant::now();
        let err = run("sleep", ["5"], Duration::from_millis(100)).unwrap_err();
        assert_eq!(err, BackendError::Timeout(Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(4));
    }

    #[test]
    fn test_timeout_covers_background_holding_pipes() {
        let started = Instant::now();
        let err = run("sh", ["-c", "sleep 4 & echo done"], Duration::from_millis(200)).unwrap_err();
        assert_eq!(err, BackendError::Timeout(Duration::from_millis(200)));
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_background_with_closed_pipes_is_not_waited_for() {
        let out = run("sh", ["-c", "sleep 4 >/dev/null 2>&1 & echo done"], Duration::from_secs(2)).unwrap();
        assert!(out.success());
        assert_eq!(out.stdout.trim(), "done");
    }

    #[test]
    fn test_missing_binary_is_unsupported() {
        let err = run("definitely-not-a-real-tool-xyz", Vec::<String>::new(), DEFAULT_TIMEOUT).unwrap_err();
        assert!(matches!(err, BackendError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_run_detached() {
        let out = run_detached("sh", ["-c", "exit 0"], Duration::from_secs(10)).unwrap();
        assert!(out.success());
    }

    #[test]
    fn test_classify() {
        assert!(matches!(
            classify("lxc-info", &output(1, "Container 4242 does not exist")),
            BackendError::NotFound(_)
        ));
        assert!(matches!(
            classify("crun", &output(1, "open /run/crun: Permission denied")),
            BackendError::PermissionDenied(_)
        ));
        assert!(matches!(
            classify("lxc-create", &output(1, "Invalid template")),
            BackendError::InvalidInput(_)
        ));
        assert_eq!(
            classify("lxc-start", &output(2, "boom")),
            BackendError::RuntimeError {
                message: "lxc-start: boom".into(),
                exit_code: Some(2),
            }
        );
    }
}
