//! Spawning and signalling the Studio server process
//!
//! The supervisor only talks to [`Spawner`] and [`ProcessControl`]; the tokio
//! implementation below is the production one. Exit is published through a
//! `watch` channel so both `stop()` and the crash watcher can wait on it.

use crate::logs::LogStream;
use std::io;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Notify, watch};
use tracing::{debug, trace, warn};

/// How the process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    /// `None` when terminated by a signal
    pub code: Option<i32>,
}

impl ProcessExit {
    pub fn is_abnormal(&self) -> bool {
        self.code != Some(0)
    }
}

impl From<ExitStatus> for ProcessExit {
    fn from(status: ExitStatus) -> Self {
        Self {
            code: status.code(),
        }
    }
}

pub type ExitReceiver = watch::Receiver<Option<ProcessExit>>;

/// Receives each stdout/stderr line of the server
pub type OutputSink = Arc<dyn Fn(LogStream, String) + Send + Sync>;

/// Signals a running process
pub trait ProcessControl: Send + Sync {
    /// Ask the process to exit (SIGTERM on unix).
    fn terminate(&self) -> io::Result<()>;
    /// Force the process to exit.
    fn kill(&self) -> io::Result<()>;
}

/// A freshly spawned server
pub struct SpawnedProcess {
    pub pid: u32,
    pub exited: ExitReceiver,
    pub control: Box<dyn ProcessControl>,
}

/// Starts `<binary> --port <port>` with captured stdio
pub trait Spawner: Send + Sync {
    fn spawn(&self, binary: &Path, port: u16, output: OutputSink) -> io::Result<SpawnedProcess>;
}

/// Spawns through `tokio::process`. Must be called inside a runtime.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSpawner;

impl Spawner for TokioSpawner {
    fn spawn(&self, binary: &Path, port: u16, output: OutputSink) -> io::Result<SpawnedProcess> {
        let mut child = Command::new(binary)
            .arg("--port")
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child
            .id()
            .ok_or_else(|| io::Error::other("process exited before reporting a pid"))?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, LogStream::Stdout, Arc::clone(&output)));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, LogStream::Stderr, output));
        }

        let (exit_tx, exited) = watch::channel(None);
        let kill = Arc::new(Notify::new());
        tokio::spawn(reap(child, Arc::clone(&kill), exit_tx));

        debug!(pid, port, binary = %binary.display(), "spawned studio server");
        Ok(SpawnedProcess {
            pid,
            exited,
            control: Box::new(TokioControl { pid, kill }),
        })
    }
}

struct TokioControl {
    pid: u32,
    kill: Arc<Notify>,
}

impl ProcessControl for TokioControl {
    #[cfg(unix)]
    fn terminate(&self) -> io::Result<()> {
        let pid = libc::pid_t::try_from(self.pid)
            .map_err(|_| io::Error::other(format!("pid {} out of range", self.pid)))?;
        // SAFETY: kill(2) has no memory-safety preconditions.
        let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
        if rc == 0 {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }

    #[cfg(not(unix))]
    fn terminate(&self) -> io::Result<()> {
        self.kill()
    }

    fn kill(&self) -> io::Result<()> {
        // Stores a permit if the reaper is not currently waiting.
        self.kill.notify_one();
        Ok(())
    }
}

/// Own the child until it exits, honouring kill requests, then publish the exit.
async fn reap(mut child: Child, kill: Arc<Notify>, exit_tx: watch::Sender<Option<ProcessExit>>) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            () = kill.notified() => {
                if let Err(e) = child.start_kill() {
                    debug!("kill failed: {}", e);
                }
            }
        }
    };

    let exit = match status {
        Ok(status) => ProcessExit::from(status),
        Err(e) => {
            warn!("failed to wait for studio server: {}", e);
            ProcessExit { code: None }
        }
    };
    trace!(?exit, "studio server reaped");
    let _ = exit_tx.send(Some(exit));
}

async fn forward_lines<R>(reader: R, stream: LogStream, output: OutputSink)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => output(stream, line),
            Ok(None) => break,
            Err(e) => {
                debug!("stopped reading server {}: {}", stream.as_str(), e);
                break;
            }
        }
    }
}

/// Whether the process has exited, or nothing is left to report it.
pub(crate) fn has_exited(exited: &ExitReceiver) -> bool {
    exited.borrow().is_some() || exited.has_changed().is_err()
}

/// Wait until `exited` reports an exit or its sender is gone.
pub(crate) async fn wait_exit(exited: &mut ExitReceiver) {
    let _ = exited.wait_for(Option::is_some).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_exit_is_normal() {
        assert!(!ProcessExit { code: Some(0) }.is_abnormal());
        assert!(ProcessExit { code: Some(1) }.is_abnormal());
        assert!(ProcessExit { code: None }.is_abnormal());
    }

    #[tokio::test]
    async fn spawn_missing_binary_fails() {
        let sink: OutputSink = Arc::new(|_: LogStream, _: String| {});
        let result = TokioSpawner.spawn(Path::new("/nonexistent/studio-server"), 4983, sink);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn wait_exit_returns_when_sender_dropped() {
        let (tx, mut rx) = watch::channel(None);
        drop(tx);
        wait_exit(&mut rx).await;
    }
}
