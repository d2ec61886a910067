//! Process execution: run a validated command in its working directory and capture
//! stdout, stderr and the exit code. No shell is used; arguments are passed as a list.
//!
//! Both pipes are drained by independent tasks while the child runs. Reading one stream to
//! the end before touching the other deadlocks as soon as the child fills the other pipe.
//!
//! On Unix the child leads its own process group. When a deadline passes, the whole group
//! is killed, so descendants that inherited the pipes cannot hold the request open.

use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Exit code reported when the process could not be started.
pub const SPAWN_FAILED_EXIT_CODE: i32 = -1;

/// Exit code reported when the process ran past its deadline and was killed.
pub const TIMED_OUT_EXIT_CODE: i32 = 124;

/// Exit code reported when the process ended without one (e.g. killed by a signal).
pub const NO_EXIT_CODE: i32 = -1;

/// How long the pipe readers get to reach end-of-stream after a kill.
const KILL_GRACE: Duration = Duration::from_secs(2);

/// How the process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    Exited,
    Signaled,
    SpawnFailed,
    TimedOut,
}

/// Captured output and exit status of one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    pub termination: Termination,
}

impl ExecutionResult {
    fn spawn_failed(error: &std::io::Error) -> Self {
        Self {
            stdout: Vec::new(),
            stderr: error.to_string().into_bytes(),
            exit_code: SPAWN_FAILED_EXIT_CODE,
            termination: Termination::SpawnFailed,
        }
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// Spawns commands with full stdio capture and an optional deadline.
#[derive(Debug, Clone, Default)]
pub struct CommandExecutor {
    timeout: Option<Duration>,
}

impl CommandExecutor {
    /// `None` blocks until the command exits, however long that takes.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run `command args...` in `cwd`. Never fails: a process that cannot be started comes
    /// back as a [`Termination::SpawnFailed`] result with the error text in stderr.
    ///
    /// With a deadline, the run ends at the deadline (plus a short grace period to collect
    /// output) even if the child or one of its descendants is still running.
    pub async fn run(&self, command: &str, args: &[String], cwd: &Path) -> ExecutionResult {
        let mut cmd = Command::new(command);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::debug!("spawn failed for {}: {}", command, e);
                return ExecutionResult::spawn_failed(&e);
            }
        };
        let pid = child.id();
        let deadline = self.timeout.map(|limit| Instant::now() + limit);

        let mut stdout = Drain::spawn(child.stdout.take());
        let mut stderr = Drain::spawn(child.stderr.take());

        let mut timed_out = false;
        let waited = match deadline {
            None => child.wait().await,
            Some(deadline) => match tokio::time::timeout_at(deadline, child.wait()).await {
                Ok(status) => status,
                Err(_) => {
                    log::warn!("{} still running at its deadline, killing it", command);
                    timed_out = true;
                    kill_process_group(&mut child, pid);
                    child.wait().await
                }
            },
        };

        // A descendant that inherited the pipes keeps them open after the child is gone.
        let (out_closed, err_closed) =
            tokio::join!(stdout.wait_closed(deadline), stderr.wait_closed(deadline));
        if !(out_closed && err_closed) {
            if !timed_out {
                log::warn!(
                    "{} left processes holding its output open past the deadline, killing them",
                    command
                );
                timed_out = true;
            }
            kill_process_group(&mut child, pid);
            let grace = Some(Instant::now() + KILL_GRACE);
            let (out_closed, err_closed) =
                tokio::join!(stdout.wait_closed(grace), stderr.wait_closed(grace));
            if !(out_closed && err_closed) {
                log::warn!("output of {} still open after kill, giving up on it", command);
            }
        }

        let stdout = stdout.into_output();
        let mut stderr = stderr.into_output();
        let (exit_code, termination) = match waited {
            _ if timed_out => (TIMED_OUT_EXIT_CODE, Termination::TimedOut),
            Ok(status) => match status.code() {
                Some(code) => (code, Termination::Exited),
                None => (NO_EXIT_CODE, Termination::Signaled),
            },
            Err(e) => {
                stderr.extend_from_slice(format!("wait failed: {}", e).as_bytes());
                (NO_EXIT_CODE, Termination::Signaled)
            }
        };
        ExecutionResult {
            stdout,
            stderr,
            exit_code,
            termination,
        }
    }
}

/// Kill the child and, on Unix, every process left in its group.
fn kill_process_group(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = pid.and_then(|p| i32::try_from(p).ok()) {
            if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                log::debug!("killpg {}: {}", pid, e);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = pid;

    if let Err(e) = child.start_kill() {
        log::debug!("kill: {}", e);
    }
}

/// One pipe read to end-of-stream on its own task. Output read so far stays available
/// when the reader is abandoned.
struct Drain {
    buf: Arc<Mutex<Vec<u8>>>,
    task: JoinHandle<()>,
    closed: bool,
}

impl Drain {
    fn spawn<R>(pipe: Option<R>) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let buf = Arc::new(Mutex::new(Vec::new()));
        let sink = buf.clone();
        let task = tokio::spawn(async move {
            let Some(mut pipe) = pipe else { return };
            let mut chunk = [0u8; 8192];
            loop {
                match pipe.read(&mut chunk).await {
                    Ok(0) => break,
                    Ok(n) => lock(&sink).extend_from_slice(&chunk[..n]),
                    Err(e) => {
                        log::debug!("reading child output: {}", e);
                        break;
                    }
                }
            }
        });
        Self {
            buf,
            task,
            closed: false,
        }
    }

    /// Wait for end-of-stream, giving up at `until`. True once the pipe has closed.
    async fn wait_closed(&mut self, until: Option<Instant>) -> bool {
        if !self.closed {
            self.closed = match until {
                None => {
                    let _ = (&mut self.task).await;
                    true
                }
                Some(until) => tokio::time::timeout_at(until, &mut self.task).await.is_ok(),
            };
        }
        self.closed
    }

    fn into_output(self) -> Vec<u8> {
        self.task.abort();
        let out = std::mem::take(&mut *lock(&self.buf));
        out
    }
}

fn lock(buf: &Mutex<Vec<u8>>) -> MutexGuard<'_, Vec<u8>> {
    buf.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn args(a: &[&str]) -> Vec<String> {
        a.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let exec = CommandExecutor::new(None);
        let r = exec.run("echo", &args(&["hello", "world"]), Path::new("/")).await;
        assert_eq!(r.termination, Termination::Exited);
        assert_eq!(r.exit_code, 0);
        assert_eq!(r.stdout_lossy(), "hello world\n");
        assert!(r.stderr.is_empty());
    }

    #[tokio::test]
    async fn captures_stderr_and_nonzero_exit() {
        let exec = CommandExecutor::new(None);
        let r = exec
            .run("sh", &args(&["-c", "echo oops >&2; exit 3"]), Path::new("/"))
            .await;
        assert_eq!(r.exit_code, 3);
        assert_eq!(r.stderr_lossy(), "oops\n");
        assert!(r.stdout.is_empty());
    }

    #[tokio::test]
    async fn runs_in_requested_directory() {
        let dir = std::env::temp_dir();
        let exec = CommandExecutor::new(None);
        let r = exec.run("pwd", &[], &dir).await;
        let reported = std::fs::canonicalize(r.stdout_lossy().trim()).unwrap();
        assert_eq!(reported, std::fs::canonicalize(&dir).unwrap());
    }

    #[tokio::test]
    async fn large_output_on_both_streams_does_not_deadlock() {
        // Well past a 64 KiB pipe buffer on each stream, written interleaved.
        let script = "i=0; while [ $i -lt 4000 ]; do \
                      echo 'stdout line padded to be long enough to fill pipes quickly'; \
                      echo 'stderr line padded to be long enough to fill pipes quickly' >&2; \
                      i=$((i+1)); done";
        let exec = CommandExecutor::new(Some(Duration::from_secs(60)));
        let r = exec.run("sh", &args(&["-c", script]), Path::new("/")).await;
        assert_eq!(r.termination, Termination::Exited);
        assert_eq!(r.exit_code, 0);
        assert_eq!(r.stdout_lossy().lines().count(), 4000);
        assert_eq!(r.stderr_lossy().lines().count(), 4000);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_failure() {
        let exec = CommandExecutor::new(None);
        let r = exec
            .run("definitely-not-a-real-binary-4f1c", &[], Path::new("/"))
            .await;
        assert_eq!(r.termination, Termination::SpawnFailed);
        assert_eq!(r.exit_code, SPAWN_FAILED_EXIT_CODE);
        assert!(!r.stderr.is_empty());
        assert!(r.stdout.is_empty());
    }

    #[tokio::test]
    async fn missing_cwd_is_a_spawn_failure() {
        let exec = CommandExecutor::new(None);
        let r = exec
            .run("echo", &args(&["x"]), Path::new("/definitely/not/a/dir/4f1c"))
            .await;
        assert_eq!(r.termination, Termination::SpawnFailed);
        assert_eq!(r.exit_code, SPAWN_FAILED_EXIT_CODE);
    }

    #[tokio::test]
    async fn deadline_kills_the_process_and_keeps_partial_output() {
        let exec = CommandExecutor::new(Some(Duration::from_millis(300)));
        let start = std::time::Instant::now();
        let r = exec
            .run("sh", &args(&["-c", "echo started; exec sleep 30"]), Path::new("/"))
            .await;
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(r.termination, Termination::TimedOut);
        assert_eq!(r.exit_code, TIMED_OUT_EXIT_CODE);
        assert_eq!(r.stdout_lossy(), "started\n");
    }

    #[tokio::test]
    async fn deadline_kills_descendants_holding_the_pipes() {
        let exec = CommandExecutor::new(Some(Duration::from_millis(300)));
        let start = std::time::Instant::now();
        let r = exec
            .run("sh", &args(&["-c", "echo started; sleep 5; echo done"]), Path::new("/"))
            .await;
        assert!(start.elapsed() < Duration::from_secs(3), "took {:?}", start.elapsed());
        assert_eq!(r.termination, Termination::TimedOut);
        assert_eq!(r.exit_code, TIMED_OUT_EXIT_CODE);
        assert_eq!(r.stdout_lossy(), "started\n");
    }

    #[tokio::test]
    async fn background_process_cannot_outlive_the_deadline() {
        let exec = CommandExecutor::new(Some(Duration::from_millis(500)));
        let start = std::time::Instant::now();
        let r = exec
            .run("sh", &args(&["-c", "sleep 5 & echo forked"]), Path::new("/"))
            .await;
        assert!(start.elapsed() < Duration::from_secs(3), "took {:?}", start.elapsed());
        assert_eq!(r.termination, Termination::TimedOut);
        assert_eq!(r.stdout_lossy(), "forked\n");
    }

    #[tokio::test]
    async fn fast_command_under_a_deadline_exits_normally() {
        let exec = CommandExecutor::new(Some(Duration::from_secs(10)));
        let r = exec.run("echo", &args(&["quick"]), Path::new("/")).await;
        assert_eq!(r.termination, Termination::Exited);
        assert_eq!(r.exit_code, 0);
        assert_eq!(r.stdout_lossy(), "quick\n");
    }
}
