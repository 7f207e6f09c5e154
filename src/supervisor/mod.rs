//! Studio server supervisor
//!
//! Owns the server process and the session state. Every state change goes
//! through [`SessionState::apply`]; the studio endpoint registration in the
//! [`MessageRouter`] changes in the same call as the move to or from
//! `Running`, so the two cannot drift apart.
//!
//! Lifecycle:
//! - `start()` spawns `<binary> --port <port>` and polls `GET /health` every
//!   500 ms for up to 30 s before reporting `Ready`.
//! - `webview_open()` attaches the detail surface (`Ready -> Running`).
//! - `webview_close()`, `stop()` and crashes all converge on `Stopped`.
//! - `stop()` sends SIGTERM, waits up to 5 s, then kills.

pub mod health;
pub mod process;
pub mod prompt;

use crate::config::StudioConfig;
use crate::logs::{LogBuffer, LogLine, LogStream};
use crate::observer::{ListenerError, Observers, SubscriptionId};
use crate::router::{Endpoint, MessageRouter};
use crate::{SessionOp, SessionState, StudioError, Transition};
use health::{HealthProbe, HttpProbe};
use process::{ExitReceiver, OutputSink, ProcessControl, ProcessExit, Spawner, TokioSpawner};
use prompt::{CrashAction, CrashPrompt, LogOnlyPrompt};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use health::base_url;

/// Delay between health probes
pub const READY_POLL_INTERVAL: Duration = Duration::from_millis(500);
/// Total readiness budget
pub const READY_TIMEOUT: Duration = Duration::from_secs(30);
/// Grace period between SIGTERM and kill
pub const STOP_GRACE: Duration = Duration::from_secs(5);
/// Binary looked up on the search path when none is configured
pub const DEFAULT_BINARY: &str = "studio-server";

const EXITED_EARLY: &str = "process exited unexpectedly";

/// Status as exposed to callers. `pid`/`url` are set iff `running`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub running: bool,
    pub port: u16,
    pub pid: Option<u32>,
    pub url: Option<String>,
}

/// Notifications delivered to [`StudioSupervisor::subscribe`] listeners
#[derive(Debug, Clone)]
pub enum SessionEvent {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    /// Process exited without being asked to
    Crashed {
        port: u16,
        code: Option<i32>,
        /// Whether the detail surface was open at the time
        attached: bool,
    },
    ServerOutput(LogLine),
}

/// Injected collaborators
pub struct Collaborators {
    pub spawner: Arc<dyn Spawner>,
    pub probe: Arc<dyn HealthProbe>,
    pub prompt: Arc<dyn CrashPrompt>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            spawner: Arc::new(TokioSpawner),
            probe: Arc::new(HttpProbe::new()),
            prompt: Arc::new(LogOnlyPrompt),
        }
    }
}

struct ServerHandle {
    pid: u32,
    port: u16,
    /// Set once the health probe succeeds
    base_url: Option<String>,
    exited: ExitReceiver,
    control: Box<dyn ProcessControl>,
}

enum ProcessSlot {
    NoProcess,
    Process {
        handle: ServerHandle,
        started_at: Instant,
    },
}

struct Core {
    state: SessionState,
    process: ProcessSlot,
    config: StudioConfig,
    dismissed: bool,
    /// Bumped whenever the current process changes owner, so late events
    /// from an old process are ignored.
    epoch: u64,
    readiness: Option<CancellationToken>,
    /// Closes when the in-flight `start()` settles
    starting: Option<watch::Receiver<()>>,
    /// Flips to `true` once an in-flight stop has confirmed the exit
    stopping: Option<watch::Receiver<bool>>,
}

impl Core {
    /// Apply `op`, returning the change if the state moved.
    fn transition(&mut self, op: SessionOp) -> Result<Option<SessionEvent>, StudioError> {
        let from = self.state;
        match from.apply(op) {
            Transition::To(to) if to == from => Ok(None),
            Transition::To(to) => {
                self.state = to;
                Ok(Some(SessionEvent::StateChanged { from, to }))
            }
            Transition::Illegal => Err(StudioError::InvalidTransition { from, op }),
        }
    }

    fn status(&self) -> ServerStatus {
        match &self.process {
            ProcessSlot::Process { handle, .. } if self.state.is_live() => ServerStatus {
                running: true,
                port: handle.port,
                pid: Some(handle.pid),
                url: handle.base_url.clone(),
            },
            _ => ServerStatus {
                running: false,
                port: self.config.port,
                pid: None,
                url: None,
            },
        }
    }

    fn cancel_readiness(&mut self) {
        if let Some(token) = self.readiness.take() {
            token.cancel();
        }
    }

    /// The stop still in progress, if any. Finished or abandoned stops are cleared.
    fn pending_stop(&mut self) -> Option<watch::Receiver<bool>> {
        let done = match &self.stopping {
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
            None => return None,
        };
        if done {
            self.stopping = None;
            None
        } else {
            self.stopping.clone()
        }
    }
}

/// A process spawned by `start()` that still has to become ready
struct Launch {
    epoch: u64,
    port: u16,
    exited: ExitReceiver,
    token: CancellationToken,
    change: Option<SessionEvent>,
    /// Dropped when this start settles, releasing concurrent callers
    settled: watch::Sender<()>,
}

/// What a `start()` call has to wait for before it can act
enum Wait {
    Stopped(watch::Receiver<bool>),
    Settled(watch::Receiver<()>),
}

enum StopPlan {
    Idle,
    Wait(watch::Receiver<bool>),
    Terminate(ServerHandle, Instant),
}

struct Shared {
    core: Mutex<Core>,
    router: MessageRouter,
    spawner: Arc<dyn Spawner>,
    probe: Arc<dyn HealthProbe>,
    prompt: Arc<dyn CrashPrompt>,
    logs: LogBuffer,
    events: Observers<SessionEvent>,
}

/// Supervises one Studio server session. Cheap to clone.
#[derive(Clone)]
pub struct StudioSupervisor {
    shared: Arc<Shared>,
}

impl StudioSupervisor {
    /// Supervisor with the production spawner, HTTP probe and a log-only prompt.
    pub fn new(config: StudioConfig, router: MessageRouter) -> Self {
        Self::with_collaborators(config, router, Collaborators::default())
    }

    pub fn with_collaborators(
        config: StudioConfig,
        router: MessageRouter,
        collaborators: Collaborators,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                core: Mutex::new(Core {
                    state: SessionState::Stopped,
                    process: ProcessSlot::NoProcess,
                    config,
                    dismissed: false,
                    epoch: 0,
                    readiness: None,
                    starting: None,
                    stopping: None,
                }),
                router,
                spawner: collaborators.spawner,
                probe: collaborators.probe,
                prompt: collaborators.prompt,
                logs: LogBuffer::new(),
                events: Observers::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Core> {
        self.shared
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, event: Option<SessionEvent>) {
        if let Some(event) = event {
            if let SessionEvent::StateChanged { from, to } = &event {
                debug!(%from, %to, "session state changed");
            }
            self.shared.events.emit(&event);
        }
    }

    pub fn state(&self) -> SessionState {
        self.lock().state
    }

    pub fn status(&self) -> ServerStatus {
        self.lock().status()
    }

    pub fn config(&self) -> StudioConfig {
        self.lock().config.clone()
    }

    /// Replace the configuration. Takes effect on the next `start()`.
    pub fn update_config(&self, config: StudioConfig) {
        debug!(?config, "studio config updated");
        self.lock().config = config;
    }

    /// Whether the user closed the detail surface during this session
    pub fn is_dismissed(&self) -> bool {
        self.lock().dismissed
    }

    pub fn router(&self) -> &MessageRouter {
        &self.shared.router
    }

    pub fn recent_logs(&self) -> Vec<LogLine> {
        self.shared.logs.snapshot()
    }

    pub fn subscribe<F>(&self, listener: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        self.shared.events.subscribe(listener)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    /// Start the server and wait until it answers its health check.
    ///
    /// Waits for an in-flight stop first. If another `start()` is already
    /// in progress, waits for it to settle and reports the resulting status.
    /// Otherwise returns the current status unchanged when not `Stopped`.
    pub async fn start(&self) -> Result<ServerStatus, StudioError> {
        let launch = loop {
            let wait = {
                let mut core = self.lock();
                if let Some(pending) = core.pending_stop() {
                    Wait::Stopped(pending)
                } else if core.state == SessionState::Starting
                    && let Some(starting) = core.starting.clone()
                {
                    Wait::Settled(starting)
                } else if core.state != SessionState::Stopped {
                    return Ok(core.status());
                } else {
                    break self.launch(&mut core)?;
                }
            };
            match wait {
                Wait::Stopped(pending) => {
                    debug!("waiting for the previous server to stop");
                    wait_stopped(pending).await;
                }
                Wait::Settled(mut starting) => {
                    debug!("start already in progress, waiting for it");
                    let _ = starting.changed().await;
                    return Ok(self.status());
                }
            }
        };

        let Launch {
            epoch,
            port,
            exited,
            token,
            change,
            settled,
        } = launch;
        self.emit(change);
        self.watch_for_crash(epoch, exited.clone());
        let result = self.await_ready(epoch, port, exited, token).await;
        drop(settled);
        result
    }

    /// Spawn the server and move to `Starting`. Caller holds the lock.
    fn launch(&self, core: &mut Core) -> Result<Launch, StudioError> {
        let port = core.config.port;
        let binary =
            resolve_binary(&core.config).map_err(|reason| StudioError::startup(port, reason))?;
        let spawned = self
            .shared
            .spawner
            .spawn(&binary, port, self.output_sink())
            .map_err(|e| StudioError::startup(port, e.to_string()))?;

        info!(port, pid = spawned.pid, "studio server spawned");
        core.epoch += 1;
        let token = CancellationToken::new();
        core.readiness = Some(token.clone());
        let (settled, starting) = watch::channel(());
        core.starting = Some(starting);
        let exited = spawned.exited.clone();
        core.process = ProcessSlot::Process {
            handle: ServerHandle {
                pid: spawned.pid,
                port,
                base_url: None,
                exited: spawned.exited,
                control: spawned.control,
            },
            started_at: Instant::now(),
        };
        let change = core.transition(SessionOp::Start)?;
        Ok(Launch {
            epoch: core.epoch,
            port,
            exited,
            token,
            change,
            settled,
        })
    }

    /// Poll the health endpoint until ready, cancelled, exited, or out of time.
    async fn await_ready(
        &self,
        epoch: u64,
        port: u16,
        mut exited: ExitReceiver,
        token: CancellationToken,
    ) -> Result<ServerStatus, StudioError> {
        let url = base_url(port);
        let deadline = Instant::now() + READY_TIMEOUT;
        let mut failed_rounds: u32 = 0;

        loop {
            if process::has_exited(&exited) {
                return self.fail_startup(epoch, port, EXITED_EARLY).await;
            }
            if token.is_cancelled() {
                return Err(StudioError::startup(port, "startup cancelled"));
            }

            let healthy = tokio::select! {
                biased;
                () = token.cancelled() => continue,
                () = process::wait_exit(&mut exited) => continue,
                healthy = self.shared.probe.probe(&url) => healthy,
            };

            if healthy {
                return self.mark_ready(epoch, port, &url, &token, failed_rounds);
            }

            failed_rounds += 1;
            if Instant::now() >= deadline {
                let reason = format!(
                    "timed out after {}s waiting for {url}/health",
                    READY_TIMEOUT.as_secs()
                );
                return self.fail_startup(epoch, port, reason).await;
            }

            tokio::select! {
                biased;
                () = token.cancelled() => {}
                () = process::wait_exit(&mut exited) => {}
                () = tokio::time::sleep(READY_POLL_INTERVAL) => {}
            }
        }
    }

    fn mark_ready(
        &self,
        epoch: u64,
        port: u16,
        url: &str,
        token: &CancellationToken,
        failed_rounds: u32,
    ) -> Result<ServerStatus, StudioError> {
        let (change, status) = {
            let mut core = self.lock();
            if core.epoch != epoch || token.is_cancelled() {
                return Err(StudioError::startup(port, "startup cancelled"));
            }
            if let ProcessSlot::Process { handle, .. } = &mut core.process {
                handle.base_url = Some(url.to_string());
            }
            core.readiness = None;
            let change = core.transition(SessionOp::ServerReady)?;
            (change, core.status())
        };
        info!(port, failed_rounds, "studio server ready at {}", url);
        self.emit(change);
        Ok(status)
    }

    /// Tear down whatever was started for `epoch`, then report the failure.
    async fn fail_startup(
        &self,
        epoch: u64,
        port: u16,
        reason: impl Into<String>,
    ) -> Result<ServerStatus, StudioError> {
        let error = StudioError::startup(port, reason);
        warn!("{}", error);
        self.stop_process(SessionOp::Stop, Some(epoch)).await;
        Err(error)
    }

    /// Stop the server. Never fails; returns once the process is gone.
    pub async fn stop(&self) {
        self.stop_process(SessionOp::Stop, None).await;
    }

    /// Stop then start again.
    pub async fn restart(&self) -> Result<ServerStatus, StudioError> {
        self.stop().await;
        self.start().await
    }

    async fn stop_process(&self, op: SessionOp, only_epoch: Option<u64>) {
        let (done_tx, done_rx) = watch::channel(false);
        let plan = {
            let mut core = self.lock();
            if only_epoch.is_some_and(|epoch| epoch != core.epoch) {
                return;
            }
            core.cancel_readiness();
            match std::mem::replace(&mut core.process, ProcessSlot::NoProcess) {
                ProcessSlot::Process { handle, started_at } => {
                    core.epoch += 1;
                    core.stopping = Some(done_rx);
                    StopPlan::Terminate(handle, started_at)
                }
                ProcessSlot::NoProcess => match core.pending_stop() {
                    Some(pending) => StopPlan::Wait(pending),
                    None => StopPlan::Idle,
                },
            }
        };

        match plan {
            StopPlan::Wait(pending) => {
                // The stop already running owns the transition.
                wait_stopped(pending).await;
                return;
            }
            StopPlan::Terminate(handle, started_at) => {
                terminate(&handle).await;
                info!(
                    port = handle.port,
                    pid = handle.pid,
                    uptime = ?started_at.elapsed(),
                    "studio server stopped"
                );
            }
            StopPlan::Idle => {}
        }

        self.shared.router.unregister_studio();
        let change = {
            let mut core = self.lock();
            core.stopping = None;
            // Stop-like ops are legal from every state; fall back for the
            // close edge when the session already left Running.
            core.transition(op)
                .or_else(|_| core.transition(SessionOp::Stop))
                .unwrap_or(None)
        };
        self.emit(change);
        done_tx.send_replace(true);
    }

    /// Attach the detail surface: `Ready -> Running` plus studio registration.
    pub fn webview_open(&self, endpoint: Arc<dyn Endpoint>) -> Result<ServerStatus, StudioError> {
        let (change, status) = {
            let mut core = self.lock();
            // A server being stopped cannot take a surface.
            if matches!(core.process, ProcessSlot::NoProcess) {
                return Err(StudioError::InvalidTransition {
                    from: core.state,
                    op: SessionOp::WebviewOpen,
                });
            }
            let change = core.transition(SessionOp::WebviewOpen)?;
            (change, core.status())
        };
        self.shared.router.register_studio(endpoint);
        self.emit(change);
        Ok(status)
    }

    /// The user closed the detail surface. Tears the server down if it was
    /// attached; otherwise only records the dismissal.
    pub async fn webview_close(&self) {
        let attached = {
            let mut core = self.lock();
            core.dismissed = true;
            core.state == SessionState::Running
        };
        if !attached {
            debug!("detail surface closed while not attached");
            return;
        }
        self.stop_process(SessionOp::WebviewClose, None).await;
    }

    /// Start and attach `endpoint` unless the user dismissed the surface
    /// this session or auto-start is off. Returns `None` when skipped.
    pub async fn auto_open(
        &self,
        endpoint: Arc<dyn Endpoint>,
    ) -> Result<Option<ServerStatus>, StudioError> {
        let (auto_start, dismissed) = {
            let core = self.lock();
            (core.config.auto_start, core.dismissed)
        };
        if !auto_start || dismissed {
            debug!(auto_start, dismissed, "skipping auto open");
            return Ok(None);
        }

        let status = self.start().await?;
        match self.state() {
            SessionState::Running => Ok(Some(status)),
            SessionState::Ready => self.webview_open(endpoint).map(Some),
            state => {
                debug!(%state, "server not ready, skipping auto open");
                Ok(None)
            }
        }
    }

    /// Stop the server and dispose the router.
    pub async fn shutdown(&self) {
        self.stop().await;
        self.shared.router.dispose();
    }

    fn output_sink(&self) -> OutputSink {
        let shared = Arc::downgrade(&self.shared);
        Arc::new(move |stream: LogStream, text: String| {
            match stream {
                LogStream::Stdout => info!(target: "studio::server", "{}", text),
                LogStream::Stderr => warn!(target: "studio::server", "{}", text),
            }
            if let Some(shared) = shared.upgrade() {
                let line = shared.logs.push(stream, text);
                shared.events.emit(&SessionEvent::ServerOutput(line));
            }
        })
    }

    fn watch_for_crash(&self, epoch: u64, mut exited: ExitReceiver) {
        let shared = Arc::downgrade(&self.shared);
        tokio::spawn(async move {
            process::wait_exit(&mut exited).await;
            let exit = (*exited.borrow()).unwrap_or(ProcessExit { code: None });
            if let Some(shared) = shared.upgrade() {
                StudioSupervisor { shared }.handle_exit(epoch, exit).await;
            }
        });
    }

    /// Unsolicited exit of the process started in `epoch`.
    async fn handle_exit(&self, epoch: u64, exit: ProcessExit) {
        let (port, attached, change) = {
            let mut core = self.lock();
            // Exits we caused through stop() arrive with a stale epoch.
            if core.epoch != epoch {
                return;
            }
            let ProcessSlot::Process { handle, .. } =
                std::mem::replace(&mut core.process, ProcessSlot::NoProcess)
            else {
                return;
            };
            core.epoch += 1;
            core.cancel_readiness();
            let attached = core.state == SessionState::Running;
            let change = core.transition(SessionOp::Crash).unwrap_or(None);
            (handle.port, attached, change)
        };

        self.shared.router.unregister_studio();
        self.emit(change);
        self.emit(Some(SessionEvent::Crashed {
            port,
            code: exit.code,
            attached,
        }));

        if !(attached && exit.is_abnormal()) {
            info!(port, code = ?exit.code, attached, "studio server exited");
            return;
        }

        let error = StudioError::Crash {
            port,
            code: exit.code,
        };
        warn!("{}", error);
        match self.shared.prompt.ask(&error).await {
            Some(CrashAction::Restart) => {
                if let Err(e) = self.start().await {
                    warn!("restart after crash failed: {}", e);
                }
            }
            Some(CrashAction::ViewLogs) => self.shared.prompt.show_logs(&self.recent_logs()),
            None => {}
        }
    }
}

/// Configured binary, or [`DEFAULT_BINARY`] from the search path.
fn resolve_binary(config: &StudioConfig) -> Result<PathBuf, String> {
    match &config.binary {
        Some(path) => Ok(path.clone()),
        None => which::which(DEFAULT_BINARY)
            .map_err(|e| format!("{DEFAULT_BINARY} not found on PATH: {e}")),
    }
}

async fn wait_stopped(mut done: watch::Receiver<bool>) {
    let _ = done.wait_for(|done| *done).await;
}

/// SIGTERM, wait up to [`STOP_GRACE`], then kill and wait.
async fn terminate(handle: &ServerHandle) {
    let mut exited = handle.exited.clone();
    if process::has_exited(&exited) {
        return;
    }

    if let Err(e) = handle.control.terminate() {
        debug!(pid = handle.pid, "terminate failed: {}", e);
    }
    if tokio::time::timeout(STOP_GRACE, process::wait_exit(&mut exited))
        .await
        .is_ok()
    {
        return;
    }

    warn!(
        "{}",
        StudioError::StopTimeout {
            port: handle.port,
            grace: STOP_GRACE,
        }
    );
    if let Err(e) = handle.control.kill() {
        warn!(pid = handle.pid, "kill failed: {}", e);
    }
    process::wait_exit(&mut exited).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_binary_is_used_verbatim() {
        let config = StudioConfig {
            binary: Some(PathBuf::from("/opt/studio/bin/server")),
            ..StudioConfig::default()
        };
        assert_eq!(
            resolve_binary(&config).unwrap(),
            PathBuf::from("/opt/studio/bin/server")
        );
    }

    #[test]
    fn new_supervisor_is_stopped() {
        let supervisor = StudioSupervisor::with_collaborators(
            StudioConfig::default(),
            MessageRouter::new(),
            Collaborators {
                spawner: Arc::new(TokioSpawner),
                probe: Arc::new(HttpProbe::new()),
                prompt: Arc::new(LogOnlyPrompt),
            },
        );
        assert_eq!(supervisor.state(), SessionState::Stopped);
        let status = supervisor.status();
        assert!(!status.running);
        assert_eq!(status.port, StudioConfig::default().port);
        assert!(status.pid.is_none());
        assert!(status.url.is_none());
        assert!(!supervisor.is_dismissed());
    }

    #[test]
    fn update_config_does_not_transition() {
        let supervisor = StudioSupervisor::new(StudioConfig::default(), MessageRouter::new());
        supervisor.update_config(StudioConfig {
            port: 5111,
            ..StudioConfig::default()
        });
        assert_eq!(supervisor.state(), SessionState::Stopped);
        assert_eq!(supervisor.status().port, 5111);
    }

    #[test]
    fn webview_open_rejected_when_stopped() {
        struct Null;
        impl Endpoint for Null {
            fn post(&self, _: &crate::BusMessage) -> Result<(), crate::EndpointError> {
                Ok(())
            }
        }

        let supervisor = StudioSupervisor::new(StudioConfig::default(), MessageRouter::new());
        let err = supervisor.webview_open(Arc::new(Null)).unwrap_err();
        assert_eq!(
            err,
            StudioError::InvalidTransition {
                from: SessionState::Stopped,
                op: SessionOp::WebviewOpen,
            }
        );
        assert!(!supervisor.router().has_studio());
    }
}
