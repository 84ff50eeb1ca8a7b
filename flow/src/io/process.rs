//! Child processes with timeouts and bounded output.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status.success() && !self.timed_out
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Stdout followed by stderr, for recording in a job body.
    pub fn combined_text(&self) -> String {
        let mut text = self.stdout_text();
        let stderr = self.stderr_text();
        if !stderr.trim().is_empty() {
            if !text.is_empty() && !text.ends_with('\n') {
                text.push('\n');
            }
            text.push_str(&stderr);
        }
        text
    }

    /// Short description of a failure: exit code or timeout.
    pub fn failure_reason(&self) -> String {
        if self.timed_out {
            "timed out".to_string()
        } else {
            match self.status.code() {
                Some(code) => format!("exit code {code}"),
                None => "terminated by signal".to_string(),
            }
        }
    }

    pub fn truncated_notice(&self, label: &str) -> String {
        let mut notice = String::new();
        if self.stdout_truncated > 0 {
            notice.push_str(&format!(
                "\n[{label} stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        if self.stderr_truncated > 0 {
            notice.push_str(&format!(
                "\n[{label} stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        notice
    }
}

/// Knobs for [`run_command`].
#[derive(Debug, Clone)]
pub struct RunOptions<'a> {
    pub stdin: Option<&'a [u8]>,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    /// Copy each stdout and stderr line to this file as it arrives.
    pub tee_path: Option<PathBuf>,
}

impl RunOptions<'_> {
    pub fn new(timeout: Duration, output_limit_bytes: usize) -> Self {
        Self {
            stdin: None,
            timeout,
            output_limit_bytes,
            tee_path: None,
        }
    }
}

type Tee = std::sync::Arc<Option<std::sync::Mutex<BufWriter<File>>>>;

/// Run a command, draining stdout and stderr concurrently so the child never
/// blocks on a full pipe. Output beyond the limit is discarded but still read.
#[instrument(skip_all, fields(timeout_secs = opts.timeout.as_secs(), tee = opts.tee_path.is_some()))]
pub fn run_command(mut cmd: Command, opts: &RunOptions<'_>) -> Result<CommandOutput> {
    if opts.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let tee: Tee = std::sync::Arc::new(match &opts.tee_path {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create log dir {}", parent.display()))?;
            }
            let file = File::create(path)
                .with_context(|| format!("create log file {}", path.display()))?;
            Some(std::sync::Mutex::new(BufWriter::new(file)))
        }
        None => None,
    });

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(err) => {
            error!(err = %err, "failed to spawn command");
            return Err(err).context("spawn command");
        }
    };

    if let Some(input) = opts.stdin {
        let mut child_stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        child_stdin.write_all(input).context("write stdin")?;
    }

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let limit = opts.output_limit_bytes;
    let stdout_tee = tee.clone();
    let stderr_tee = tee.clone();
    let stdout_handle = thread::spawn(move || read_lines_limited(stdout, limit, &stdout_tee));
    let stderr_handle = thread::spawn(move || read_lines_limited(stderr, limit, &stderr_tee));

    let mut timed_out = false;
    let status = match child.wait_timeout(opts.timeout).context("wait for command")? {
        Some(status) => status,
        None => {
            warn!(
                timeout_secs = opts.timeout.as_secs(),
                "command timed out, killing"
            );
            timed_out = true;
            child.kill().context("kill command")?;
            child.wait().context("wait command after kill")?
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// `sh -c <script>` in `cwd`.
pub fn shell_command(script: &str, cwd: &Path) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(script).current_dir(cwd);
    cmd
}

/// Whether a process with `pid` exists (`kill -0`).
pub fn pid_alive(pid: u32) -> bool {
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

fn join_output(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_lines_limited<R: Read>(reader: R, limit: usize, tee: &Tee) -> Result<(Vec<u8>, usize)> {
    let mut reader = BufReader::new(reader);
    let mut collected = Vec::new();
    let mut truncated = 0usize;
    loop {
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).context("read output")?;
        if n == 0 {
            break;
        }
        if let Some(mutex) = &**tee
            && let Ok(mut writer) = mutex.lock()
            && let Err(err) = writer.write_all(&line).and_then(|()| writer.flush())
        {
            warn!(err = %err, "failed to write log line");
        }
        let remaining = limit.saturating_sub(collected.len());
        let keep = n.min(remaining);
        collected.extend_from_slice(&line[..keep]);
        truncated += n - keep;
    }
    Ok((collected, truncated))
}
