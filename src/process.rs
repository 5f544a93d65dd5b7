use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::agent::CancelSignal;
use crate::error::{Error, Result};

/// How many trailing stderr lines are kept for error messages.
const STDERR_TAIL: usize = 20;

/// Configuration for spawning a child process.
#[derive(Debug)]
pub struct ProcessConfig {
    pub command: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub timeout: Option<Duration>,
    pub log_prefix: String,
    pub env: Vec<(String, String)>,
    /// Receives each stdout line as soon as it is read.
    pub stdout_sink: Option<mpsc::UnboundedSender<String>>,
    pub cancel: Option<CancelSignal>,
}

impl ProcessConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        let command = command.into();
        Self {
            log_prefix: command.clone(),
            command,
            args,
            working_dir: working_dir.into(),
            timeout: None,
            env: vec![],
            stdout_sink: None,
            cancel: None,
        }
    }
}

/// Output from a completed child process.
#[derive(Debug)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub signal: Option<i32>,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0 && self.signal.is_none()
    }

    pub fn stdout(&self) -> String {
        self.stdout_lines.join("\n")
    }

    /// The last few stderr lines, for attaching to error messages.
    pub fn stderr_tail(&self) -> String {
        let start = self.stderr_lines.len().saturating_sub(STDERR_TAIL);
        self.stderr_lines[start..].join("\n")
    }
}

/// Spawn a child process and stream its output line-by-line.
///
/// The child runs in its own process group on Unix. On timeout or
/// cancellation the whole group gets SIGTERM, then SIGKILL half a second later.
pub async fn spawn_and_stream(mut config: ProcessConfig) -> Result<ProcessOutput> {
    let mut cmd = Command::new(&config.command);
    cmd.args(&config.args)
        .current_dir(&config.working_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &config.env {
        cmd.env(key, value);
    }

    #[cfg(unix)]
    cmd.process_group(0);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::Process(format!("failed to spawn '{}': {e}", config.command)))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::Process("child has no pid".into()))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Process("child stdout not captured".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Process("child stderr not captured".into()))?;

    let prefix_out = config.log_prefix.clone();
    let prefix_err = config.log_prefix.clone();
    let sink = config.stdout_sink.take();

    let stdout_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            debug!("[{prefix_out}] {line}");
            if let Some(sink) = &sink {
                let _ = sink.send(line.clone());
            }
            lines.push(line);
        }
        lines
    });

    let stderr_task = tokio::spawn(async move {
        let mut lines = Vec::new();
        let mut reader = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = reader.next_line().await {
            warn!("[{prefix_err}] {line}");
            lines.push(line);
        }
        lines
    });

    let mut cancel = config.cancel.take();

    let status = tokio::select! {
        status = child.wait() => status.map_err(|e| Error::Process(format!("wait error: {e}")))?,
        _ = sleep_or_forever(config.timeout) => {
            terminate_group(pid).await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(Error::Process(format!(
                "'{}' timed out after {:?}",
                config.command,
                config.timeout.unwrap_or_default()
            )));
        }
        _ = wait_cancelled(cancel.as_mut()) => {
            terminate_group(pid).await;
            stdout_task.abort();
            stderr_task.abort();
            return Err(Error::Cancelled(format!("'{}' run", config.command)));
        }
    };

    let stdout_lines = stdout_task
        .await
        .map_err(|e| Error::Process(format!("stdout reader failed: {e}")))?;
    let stderr_lines = stderr_task
        .await
        .map_err(|e| Error::Process(format!("stderr reader failed: {e}")))?;

    let (exit_code, signal) = extract_exit_info(&status);

    Ok(ProcessOutput {
        exit_code,
        signal,
        stdout_lines,
        stderr_lines,
    })
}

async fn sleep_or_forever(timeout: Option<Duration>) {
    match timeout {
        Some(dur) => tokio::time::sleep(dur).await,
        None => std::future::pending().await,
    }
}

async fn wait_cancelled(cancel: Option<&mut CancelSignal>) {
    match cancel {
        Some(signal) => signal.cancelled().await,
        None => std::future::pending().await,
    }
}

#[cfg(unix)]
async fn terminate_group(pid: u32) {
    let pgid = pid as i32;
    unsafe {
        libc::killpg(pgid, libc::SIGTERM);
    }
    tokio::time::sleep(Duration::from_millis(500)).await;
    unsafe {
        libc::killpg(pgid, libc::SIGKILL);
    }
}

// Elsewhere the child is killed when it is dropped.
#[cfg(not(unix))]
async fn terminate_group(_pid: u32) {}

fn extract_exit_info(status: &std::process::ExitStatus) -> (i32, Option<i32>) {
    if let Some(code) = status.code() {
        return (code, None);
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(sig) = status.signal() {
            return (128 + sig, Some(sig));
        }
    }
    (-1, None)
}

/// Run a short command to completion and return its stdout, failing on a
/// non-zero exit. Used for `gh`/`git` calls and status probes.
pub async fn run_captured(
    command: &str,
    args: &[&str],
    working_dir: &std::path::Path,
    timeout: Duration,
) -> Result<String> {
    let mut config = ProcessConfig::new(
        command,
        args.iter().map(|a| a.to_string()).collect(),
        working_dir,
    );
    config.timeout = Some(timeout);
    let output = spawn_and_stream(config).await?;
    if !output.success() {
        return Err(Error::Process(format!(
            "{command} {} exited with code {}: {}",
            args.first().copied().unwrap_or_default(),
            output.exit_code,
            output.stderr_tail()
        )));
    }
    Ok(output.stdout())
}
