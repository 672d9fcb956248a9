//! Helpers for running child processes with timeouts, cancellation and bounded output.

use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

use crate::io::cancel::{CancelToken, POLL_INTERVAL};

/// How long the output readers may take to drain once the child is gone.
const READER_GRACE: Duration = Duration::from_secs(2);

/// How a child process should be run.
#[derive(Debug, Clone, Copy)]
pub struct CommandRequest<'a> {
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Tee stdout line by line into this file while the child runs.
    pub stream_path: Option<&'a Path>,
    pub cancel: Option<&'a CancelToken>,
}

impl<'a> CommandRequest<'a> {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            stdin: None,
            timeout,
            output_limit_bytes,
            stream_path: None,
            cancel: None,
        }
    }

    pub fn stdin(mut self, input: &'a [u8]) -> Self {
        self.stdin = Some(input);
        self
    }

    pub fn stream_to(mut self, path: Option<&'a Path>) -> Self {
        self.stream_path = path;
        self
    }

    pub fn cancel(mut self, token: &'a CancelToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out && !self.cancelled
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout then stderr, with truncation notices, for feeding back to a model.
    pub fn combined(&self, label: &str) -> String {
        let mut text = self.stdout_text();
        text.push_str(&self.stdout_truncated_notice(label));
        let stderr = self.stderr_text();
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        text.push_str(&self.stderr_truncated_notice(label));
        text
    }

    pub fn stdout_truncated_notice(&self, label: &str) -> String {
        if self.stdout_truncated > 0 {
            format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            )
        } else {
            String::new()
        }
    }

    pub fn stderr_truncated_notice(&self, label: &str) -> String {
        if self.stderr_truncated > 0 {
            format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            )
        } else {
            String::new()
        }
    }
}

type StreamFile = Arc<Option<Mutex<BufWriter<std::fs::File>>>>;

/// Run a command and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
/// The child leads its own process group. On timeout or cancellation the whole group is killed
/// and reaped before this returns; after a normal exit the group is killed too, so background
/// processes the child left behind cannot hold the pipes open or outlive the call.
#[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs(), output_limit_bytes = request.output_limit_bytes, streaming = request.stream_path.is_some()))]
pub fn run_command(mut cmd: Command, request: &CommandRequest<'_>) -> Result<CommandOutput> {
    if request.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    if let Some(input) = request.stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        if let Err(e) = child_stdin.write_all(input) {
            kill_process_group(&mut child);
            return Err(e).context("write stdin");
        }
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stream_file: StreamFile = match request.stream_path {
        Some(path) => Arc::new(Some(Mutex::new(open_stream_file(path)?))),
        None => Arc::new(None),
    };

    let limit = request.output_limit_bytes;
    let stdout_handle = thread::spawn(move || {
        read_stream_limited_with_tee(stdout, limit, stream_file)
    });
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));

    let started = Instant::now();
    let mut timed_out = false;
    let mut cancelled = false;
    let status = loop {
        let remaining = request.timeout.saturating_sub(started.elapsed());
        let slice = POLL_INTERVAL.min(remaining).max(Duration::from_millis(1));
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break status;
        }
        if request.cancel.is_some_and(CancelToken::is_cancelled) {
            warn!("command cancelled, killing process group");
            cancelled = true;
            break kill_and_reap(&mut child)?;
        }
        if started.elapsed() >= request.timeout {
            warn!(
                timeout_secs = request.timeout.as_secs(),
                "command timed out, killing process group"
            );
            timed_out = true;
            break kill_and_reap(&mut child)?;
        }
    };

    if !timed_out && !cancelled {
        kill_group(child.id());
    }

    let readers_deadline = Instant::now() + READER_GRACE;
    let (stdout, stdout_truncated) =
        join_output(stdout_handle, "stdout", readers_deadline).context("join stdout")?;
    let (stderr, stderr_truncated) =
        join_output(stderr_handle, "stderr", readers_deadline).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, cancelled, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
        cancelled,
    })
}

fn open_stream_file(path: &Path) -> Result<BufWriter<std::fs::File>> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create stream dir {}", parent.display()))?;
    }
    let file = std::fs::File::create(path)
        .with_context(|| format!("create stream file {}", path.display()))?;
    Ok(BufWriter::new(file))
}

fn kill_and_reap(child: &mut Child) -> Result<ExitStatus> {
    kill_process_group(child);
    child.wait().context("wait command after kill")
}

/// SIGKILL the child's whole process group, then the child itself.
fn kill_process_group(child: &mut Child) {
    kill_group(child.id());
    if let Err(err) = child.kill() {
        debug!(err = %err, "kill after process group kill");
    }
}

/// SIGKILL the process group led by `pid`. An already empty group is fine.
fn kill_group(pid: u32) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(pid) = i32::try_from(pid)
            && let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL)
            && err != nix::errno::Errno::ESRCH
        {
            warn!(err = %err, "failed to kill process group");
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

/// Join a reader thread, giving up once `deadline` passes.
///
/// A process that left the group (e.g. via `setsid`) can keep the pipe open
/// forever; its reader is then detached and the stream reported empty.
fn join_output(
    handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>,
    stream: &'static str,
    deadline: Instant,
) -> Result<(Vec<u8>, usize)> {
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            warn!(stream, "output pipe still open after the command exited, not waiting");
            return Ok((Vec::new(), 0));
        }
        thread::sleep(Duration::from_millis(10));
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

/// Read a stream with a size limit, optionally tee-ing each line to a file.
fn read_stream_limited_with_tee<R: Read>(
    reader: R,
    limit: usize,
    stream_file: StreamFile,
) -> Result<(Vec<u8>, usize)> {
    let mut buf_reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;

    loop {
        let mut line = Vec::new();
        let n = buf_reader
            .read_until(b'\n', &mut line)
            .context("read line")?;
        if n == 0 {
            break;
        }

        if let Some(ref mutex) = *stream_file
            && let Ok(mut writer) = mutex.lock()
        {
            // Flush per line so transcripts can be tailed while the model runs.
            if let Err(e) = writer.write_all(&line) {
                warn!(err = %e, "failed to write to stream file");
            } else if let Err(e) = writer.flush() {
                warn!(err = %e, "failed to flush stream file");
            }
        }

        let remaining = limit.saturating_sub(collected.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            collected.extend_from_slice(&line[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((collected, truncated))
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
