use std::{
    io,
    process::{ExitStatus, Stdio},
};

use tokio::{
    io::{AsyncRead, AsyncReadExt},
    process::{Child, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tracing::{info, warn};

use crate::{
    downloader::{extract_filename, has_destination_marker},
    error::DownloadError,
    models::MediaFormat,
    registry::JobRegistry,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    /// SIGTERM on unix.
    Terminate,
    Kill,
}

/// The job record's grip on a running downloader. Signals travel to the
/// supervising task, which owns the child itself.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    pid: Option<u32>,
    signals: mpsc::UnboundedSender<ProcessSignal>,
}

impl ProcessHandle {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Returns false once the process has exited and its supervisor is gone.
    pub fn send(&self, signal: ProcessSignal) -> bool {
        self.signals.send(signal).is_ok()
    }
}

pub struct SpawnedProcess {
    child: Child,
    signals: mpsc::UnboundedReceiver<ProcessSignal>,
    stdout: JoinHandle<String>,
    stderr: JoinHandle<String>,
}

#[derive(Debug)]
pub struct ProcessExit {
    pub status: io::Result<ExitStatus>,
    pub stdout: String,
    pub stderr: String,
    /// Whether a cancellation signal was delivered while the process ran.
    pub signalled: bool,
}

pub fn spawn_process(mut command: Command) -> io::Result<(SpawnedProcess, ProcessHandle)> {
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = command.spawn()?;
    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = ProcessHandle {
        pid: child.id(),
        signals: tx,
    };

    Ok((
        SpawnedProcess {
            child,
            signals: rx,
            stdout,
            stderr,
        },
        handle,
    ))
}

/// Most output kept per stream; older bytes are dropped first.
pub const MAX_CAPTURED_OUTPUT: usize = 10 * 1024 * 1024;

fn drain<R>(stream: Option<R>) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        match stream {
            Some(stream) => capture_tail(stream, MAX_CAPTURED_OUTPUT).await,
            None => String::new(),
        }
    })
}

/// Reads a stream to the end, keeping only its last `limit` bytes.
async fn capture_tail<R>(mut stream: R, limit: usize) -> String
where
    R: AsyncRead + Unpin,
{
    let mut kept = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match stream.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                kept.extend_from_slice(&chunk[..n]);
                // Trim in batches so a long stream is not shifted per read.
                if kept.len() > limit.saturating_mul(2) {
                    kept.drain(..kept.len() - limit);
                }
            }
            Err(err) => {
                warn!("Failed reading downloader output: {err}");
                break;
            }
        }
    }
    if kept.len() > limit {
        kept.drain(..kept.len() - limit);
    }
    String::from_utf8_lossy(&kept).into_owned()
}

impl SpawnedProcess {
    /// Waits for exit while relaying signals from the owning job.
    pub async fn wait(self) -> ProcessExit {
        let SpawnedProcess {
            mut child,
            mut signals,
            stdout,
            stderr,
        } = self;

        let mut signalled = false;
        let status = loop {
            tokio::select! {
                status = child.wait() => break status,
                Some(signal) = signals.recv() => {
                    signalled = true;
                    if let Err(err) = deliver(&mut child, signal) {
                        warn!(pid = ?child.id(), ?signal, "Failed signalling downloader: {err}");
                    }
                }
            }
        };
        drop(signals);

        ProcessExit {
            status,
            stdout: stdout.await.unwrap_or_default(),
            stderr: stderr.await.unwrap_or_default(),
            signalled,
        }
    }
}

fn deliver(child: &mut Child, signal: ProcessSignal) -> io::Result<()> {
    match signal {
        ProcessSignal::Terminate => terminate(child),
        ProcessSignal::Kill => child.start_kill(),
    }
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    // SAFETY: plain kill(2) on a pid this process spawned and has not reaped.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> io::Result<()> {
    child.start_kill()
}

#[cfg(unix)]
fn killed_by_signal(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;

    matches!(status.signal(), Some(libc::SIGTERM) | Some(libc::SIGKILL))
}

#[cfg(not(unix))]
fn killed_by_signal(_status: &ExitStatus) -> bool {
    false
}

impl ProcessExit {
    /// Maps the raw exit into a file name or the reason there is none.
    pub fn outcome(&self, format: MediaFormat) -> Result<String, DownloadError> {
        let status = match &self.status {
            Ok(status) => status,
            Err(err) => {
                return Err(DownloadError::ProcessFailure(format!(
                    "Failed waiting for downloader: {err}"
                )))
            }
        };

        if !status.success() {
            if self.signalled || killed_by_signal(status) {
                return Err(DownloadError::CancellationInduced);
            }
            let stderr = self.stderr.trim();
            let message = if stderr.is_empty() {
                format!("Downloader exited with {status}")
            } else {
                stderr.to_string()
            };
            return Err(DownloadError::ProcessFailure(message));
        }

        let stderr = self.stderr.trim();
        if !stderr.is_empty() && !has_destination_marker(&self.stdout) {
            return Err(DownloadError::ProcessFailure(stderr.to_string()));
        }

        extract_filename(&self.stdout, format).ok_or(DownloadError::FilenameUndetermined)
    }
}

/// Drives one job from `queued` to a terminal state.
pub async fn supervise(registry: JobRegistry, job_id: String) {
    let Some((process, format)) = registry.begin_download(&job_id).await else {
        return;
    };

    let exit = process.wait().await;
    info!(
        job_id = %job_id,
        status = ?exit.status,
        signalled = exit.signalled,
        "Downloader exited"
    );

    registry.record_outcome(&job_id, exit.outcome(format)).await;
}
