use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Serialize, Serializer};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default timeout for a single command (60 seconds)
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// How long output readers may keep draining once the process has been killed
const DRAIN_GRACE: Duration = Duration::from_secs(1);

/// A single process invocation. Built once, never changed while it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    argv: Vec<String>,
    working_dir: PathBuf,
    environment: BTreeMap<String, String>,
    timeout: Duration,
    stdin: Option<Vec<u8>>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
            working_dir: PathBuf::from("."),
            environment: BTreeMap::new(),
            timeout: DEFAULT_TIMEOUT,
            stdin: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    /// Environment overrides, merged onto the inherited process environment
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Payload written to the child's stdin, which is closed afterwards
    pub fn stdin(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(payload.into());
        self
    }

    pub fn program(&self) -> &str {
        &self.argv[0]
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    pub fn cwd(&self) -> &Path {
        &self.working_dir
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.environment
    }

    pub fn time_limit(&self) -> Duration {
        self.timeout
    }

    pub fn input(&self) -> Option<&[u8]> {
        self.stdin.as_deref()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.argv.join(" "))
    }
}

/// Outcome of running one [`Command`].
///
/// Every failure mode (non-zero exit, timeout, spawn error) is encoded here;
/// [`ProcessRunner::run`] never fails on its own.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionResult {
    #[serde(rename = "success")]
    succeeded: bool,
    #[serde(serialize_with = "lossy_utf8")]
    stdout: Vec<u8>,
    #[serde(serialize_with = "lossy_utf8")]
    stderr: Vec<u8>,
    #[serde(rename = "exitcode")]
    exit_code: i32,
    #[serde(serialize_with = "seconds")]
    duration: Duration,
}

impl ExecutionResult {
    fn completed(exit_code: i32, stdout: Vec<u8>, stderr: Vec<u8>, duration: Duration) -> Self {
        Self {
            succeeded: exit_code == 0,
            stdout,
            stderr,
            exit_code,
            duration,
        }
    }

    /// Timeout, spawn failure or any other condition without a real exit code.
    pub fn failure(stderr: impl Into<String>, duration: Duration) -> Self {
        Self {
            succeeded: false,
            stdout: Vec::new(),
            stderr: stderr.into().into_bytes(),
            exit_code: -1,
            duration,
        }
    }

    fn dry_run(cmd: &Command) -> Self {
        Self::completed(0, format!("DRY RUN: {cmd}").into_bytes(), Vec::new(), Duration::ZERO)
    }

    pub fn succeeded(&self) -> bool {
        self.succeeded
    }

    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    pub fn stderr(&self) -> &[u8] {
        &self.stderr
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    pub fn duration(&self) -> Duration {
        self.duration
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|e| {
            serde_json::json!({ "success": false, "stderr": e.to_string(), "exitcode": -1 })
        })
    }
}

fn lossy_utf8<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

fn seconds<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_f64(duration.as_secs_f64())
}

/// Spawns commands, one OS process per call.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    dry_run: bool,
    permits: Arc<Semaphore>,
}

impl ProcessRunner {
    /// `max_concurrent` caps how many processes may be alive at once.
    pub fn new(dry_run: bool, max_concurrent: usize) -> Self {
        Self {
            dry_run,
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub async fn run(&self, cmd: &Command) -> ExecutionResult {
        if self.dry_run {
            info!(command = %cmd, "dry run, not executing");
            return ExecutionResult::dry_run(cmd);
        }

        let Ok(_permit) = self.permits.acquire().await else {
            return ExecutionResult::failure("Command runner is shutting down", Duration::ZERO);
        };

        let started = Instant::now();
        let mut child = match spawn(cmd) {
            Ok(child) => child,
            Err(e) => {
                warn!(command = %cmd, error = %e, "failed to spawn command");
                return ExecutionResult::failure(
                    format!("Failed to execute {}: {}", cmd.program(), e),
                    started.elapsed(),
                );
            }
        };
        let pid = child.id();
        debug!(command = %cmd, pid = ?pid, "spawned");

        let stdout = child.stdout.take().map(|pipe| tokio::spawn(read_all(pipe)));
        let stderr = child.stderr.take().map(|pipe| tokio::spawn(read_all(pipe)));
        if let (Some(payload), Some(mut pipe)) = (cmd.input(), child.stdin.take()) {
            let payload = payload.to_vec();
            tokio::spawn(async move {
                if let Err(e) = pipe.write_all(&payload).await {
                    debug!(error = %e, "stdin closed before payload was written");
                }
            });
        }

        let deadline = started + cmd.time_limit();
        match tokio::time::timeout_at(deadline.into(), child.wait()).await {
            Ok(Ok(status)) => {
                let (stdout, stderr) = drain(&mut child, pid, stdout, stderr, deadline).await;
                let elapsed = started.elapsed();
                let result = ExecutionResult::completed(exit_code(status), stdout, stderr, elapsed);
                debug!(command = %cmd, exit_code = result.exit_code, "finished");
                result
            }
            Ok(Err(e)) => {
                terminate(&mut child, pid).await;
                ExecutionResult::failure(
                    format!("Failed to wait for {}: {}", cmd.program(), e),
                    started.elapsed(),
                )
            }
            Err(_) => {
                warn!(
                    command = %cmd,
                    timeout = ?cmd.time_limit(),
                    "command timed out, terminating"
                );
                terminate(&mut child, pid).await;
                let stdout = collect(stdout, DRAIN_GRACE).await;
                abort(stderr);
                ExecutionResult {
                    stdout,
                    ..ExecutionResult::failure(
                        format!("Command timed out after {}", describe(cmd.time_limit())),
                        started.elapsed(),
                    )
                }
            }
        }
    }
}

fn spawn(cmd: &Command) -> std::io::Result<Child> {
    let mut process = tokio::process::Command::new(cmd.program());
    process
        .args(&cmd.argv()[1..])
        .current_dir(cmd.cwd())
        .envs(cmd.environment())
        .stdin(if cmd.input().is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own process group, so a timeout can take the whole tree down.
    #[cfg(unix)]
    process.process_group(0);
    process.spawn()
}

async fn read_all<R: AsyncRead + Unpin>(mut pipe: R) -> Vec<u8> {
    let mut buf = Vec::new();
    if let Err(e) = pipe.read_to_end(&mut buf).await {
        debug!(error = %e, "output pipe read failed");
    }
    buf
}

/// Collect output after a normal exit. Background children that inherited the
/// pipes are killed once the deadline passes.
async fn drain(
    child: &mut Child,
    pid: Option<u32>,
    stdout: Option<JoinHandle<Vec<u8>>>,
    stderr: Option<JoinHandle<Vec<u8>>>,
    deadline: Instant,
) -> (Vec<u8>, Vec<u8>) {
    let readers = async { (join(stdout).await, join(stderr).await) };
    tokio::pin!(readers);
    match tokio::time::timeout_at(deadline.into(), &mut readers).await {
        Ok(output) => output,
        Err(_) => {
            terminate(child, pid).await;
            tokio::time::timeout(DRAIN_GRACE, readers)
                .await
                .unwrap_or_default()
        }
    }
}

async fn join(reader: Option<JoinHandle<Vec<u8>>>) -> Vec<u8> {
    match reader {
        Some(handle) => handle.await.unwrap_or_default(),
        None => Vec::new(),
    }
}

async fn collect(reader: Option<JoinHandle<Vec<u8>>>, grace: Duration) -> Vec<u8> {
    let Some(mut handle) = reader else {
        return Vec::new();
    };
    match tokio::time::timeout(grace, &mut handle).await {
        Ok(Ok(buf)) => buf,
        Ok(Err(_)) => Vec::new(),
        Err(_) => {
            handle.abort();
            Vec::new()
        }
    }
}

fn abort(reader: Option<JoinHandle<Vec<u8>>>) {
    if let Some(handle) = reader {
        handle.abort();
    }
}

/// Kill the child's process group, then the child, and reap it.
/// `pid` is captured at spawn time; the group outlives a reaped leader.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        kill_process_group(pid);
    }
    #[cfg(not(unix))]
    let _ = pid;
    if let Err(e) = child.kill().await {
        debug!(error = %e, "child already gone");
    }
}

#[cfg(unix)]
fn kill_process_group(pid: u32) {
    use nix::errno::Errno;
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(raw), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => warn!(pid, error = %e, "failed to kill process group"),
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

fn describe(timeout: Duration) -> String {
    if timeout.as_millis() % 1000 == 0 {
        format!("{} seconds", timeout.as_secs())
    } else {
        format!("{} ms", timeout.as_millis())
    }
}
