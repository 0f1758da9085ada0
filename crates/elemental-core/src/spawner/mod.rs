// ABOUTME: Subprocess spawner - creates, supervises, and terminates one process per session.
// ABOUTME: Two spawn paths (headless pipes, interactive PTY) behind one public contract.

mod headless;
mod interactive;
mod provider;

pub use provider::{ClaudeProvider, Provider, ProviderRegistry};

use chrono::{DateTime, Utc};
use portable_pty::{ChildKiller, MasterPty, PtySize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{oneshot, watch, Mutex as AsyncMutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::EventBus;
use crate::config::OrchestratorConfig;
use crate::error::{OrchestratorError, Result};
use crate::event::{encode_input_record, SessionEvent};
use crate::session::{transition, SessionSnapshot, SessionStatus};
use crate::types::{AgentRole, SessionMode, WorkerMode};

/// Everything needed to spawn one session.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub agent_id: String,
    pub role: AgentRole,
    pub worker_mode: Option<WorkerMode>,
    pub mode: SessionMode,
    pub working_dir: PathBuf,
    /// First user turn, delivered as the first stdin record in headless mode.
    pub initial_prompt: Option<String>,
    /// Resume a prior upstream conversation.
    pub resume_upstream_id: Option<String>,
    /// Per-call init deadline override (clamped to the configured floor).
    pub init_timeout: Option<Duration>,
}

impl SpawnOptions {
    pub fn new(
        agent_id: impl Into<String>,
        role: AgentRole,
        working_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            agent_id: agent_id.into(),
            role,
            worker_mode: None,
            mode: SessionMode::Headless,
            working_dir: working_dir.into(),
            initial_prompt: None,
            resume_upstream_id: None,
            init_timeout: None,
        }
    }
}

struct SessionState {
    status: SessionStatus,
    upstream_session_id: Option<String>,
    started_at: Option<DateTime<Utc>>,
    last_activity_at: DateTime<Utc>,
    ended_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
}

pub(crate) enum SessionIo {
    Headless {
        stdin: tokio::process::ChildStdin,
        pid: Option<u32>,
    },
    Interactive {
        writer: Box<dyn Write + Send>,
        master: Box<dyn MasterPty + Send>,
        killer: Box<dyn ChildKiller + Send + Sync>,
    },
    Closed,
}

/// Live record of one session, owned by the spawner's table.
pub struct SessionHandle {
    pub id: String,
    pub agent_id: String,
    pub role: AgentRole,
    pub worker_mode: Option<WorkerMode>,
    pub mode: SessionMode,
    pub working_dir: PathBuf,
    pub created_at: DateTime<Utc>,
    state: Mutex<SessionState>,
    io: AsyncMutex<SessionIo>,
    init_tx: Mutex<Option<oneshot::Sender<()>>>,
    init_rx: AsyncMutex<Option<oneshot::Receiver<()>>>,
    exit_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("agent_id", &self.agent_id)
            .field("role", &self.role)
            .field("worker_mode", &self.worker_mode)
            .field("mode", &self.mode)
            .field("working_dir", &self.working_dir)
            .field("created_at", &self.created_at)
            .finish()
    }
}

impl SessionHandle {
    fn new(opts: &SpawnOptions) -> Self {
        let (init_tx, init_rx) = oneshot::channel();
        let (exit_tx, _) = watch::channel(false);
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: opts.agent_id.clone(),
            role: opts.role,
            worker_mode: opts.worker_mode,
            mode: opts.mode,
            working_dir: opts.working_dir.clone(),
            created_at: now,
            state: Mutex::new(SessionState {
                status: SessionStatus::Starting,
                upstream_session_id: opts.resume_upstream_id.clone(),
                started_at: None,
                last_activity_at: now,
                ended_at: None,
                exit_code: None,
            }),
            io: AsyncMutex::new(SessionIo::Closed),
            init_tx: Mutex::new(Some(init_tx)),
            init_rx: AsyncMutex::new(Some(init_rx)),
            exit_tx,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.state.lock().expect("session state poisoned").status
    }

    pub fn upstream_session_id(&self) -> Option<String> {
        self.state
            .lock()
            .expect("session state poisoned")
            .upstream_session_id
            .clone()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock().expect("session state poisoned");
        SessionSnapshot {
            id: self.id.clone(),
            agent_id: self.agent_id.clone(),
            role: self.role,
            worker_mode: self.worker_mode,
            mode: self.mode,
            status: state.status,
            upstream_session_id: state.upstream_session_id.clone(),
            working_dir: self.working_dir.clone(),
            created_at: self.created_at,
            started_at: state.started_at,
            last_activity_at: state.last_activity_at,
            ended_at: state.ended_at,
            exit_code: state.exit_code,
        }
    }

    /// Stamp activity on every observed event.
    pub(crate) fn touch(&self) {
        self.state
            .lock()
            .expect("session state poisoned")
            .last_activity_at = Utc::now();
    }

    pub(crate) fn record_upstream_id(&self, upstream_id: &str) {
        let mut state = self.state.lock().expect("session state poisoned");
        state.upstream_session_id = Some(upstream_id.to_string());
    }

    /// Serialized status change through the transition table.
    pub(crate) fn transition_to(&self, to: SessionStatus) -> Result<()> {
        let mut state = self.state.lock().expect("session state poisoned");
        transition(&mut state.status, to)?;
        if to == SessionStatus::Running && state.started_at.is_none() {
            state.started_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Fire the init handshake waiter; safe to call at most once.
    pub(crate) fn signal_ready(&self) {
        if let Some(tx) = self
            .init_tx
            .lock()
            .expect("session init lock poisoned")
            .take()
        {
            let _ = tx.send(());
        }
    }

    pub(crate) async fn set_io(&self, io: SessionIo) {
        *self.io.lock().await = io;
    }

    fn exit_receiver(&self) -> watch::Receiver<bool> {
        self.exit_tx.subscribe()
    }
}

/// Mark a session's process as exited. Idempotent: subprocess and PTY
/// libraries may deliver exit twice, and terminate can race natural exit.
pub(crate) fn handle_exit(bus: &EventBus, handle: &SessionHandle, exit_code: Option<i32>) {
    {
        let mut state = handle.state.lock().expect("session state poisoned");
        if state.ended_at.is_some() {
            return;
        }
        state.ended_at = Some(Utc::now());
        state.exit_code = exit_code;
        match state.status {
            // An intentionally parked session keeps its status so the
            // upstream id stays resumable.
            SessionStatus::Suspended | SessionStatus::Terminated => {}
            _ => {
                let _ = transition(&mut state.status, SessionStatus::Terminated);
            }
        }
    }
    // Fail any pending init waiter, then wake terminate waiters.
    handle
        .init_tx
        .lock()
        .expect("session init lock poisoned")
        .take();
    let _ = handle.exit_tx.send(true);
    info!(session_id = %handle.id, exit_code = ?exit_code, "session process exited");
    bus.close(&handle.id, SessionEvent::session_exit(exit_code));
}

/// Creates and supervises subprocess sessions.
pub struct Spawner {
    pub(crate) provider: Arc<dyn Provider>,
    pub(crate) bus: Arc<EventBus>,
    pub(crate) config: OrchestratorConfig,
    sessions: Mutex<HashMap<String, Arc<SessionHandle>>>,
}

impl Spawner {
    pub fn new(provider: Arc<dyn Provider>, bus: Arc<EventBus>, config: OrchestratorConfig) -> Self {
        Self {
            provider,
            bus,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> Arc<EventBus> {
        self.bus.clone()
    }

    /// Launch a session. Returns with the session registered and in
    /// `starting` (interactive sessions are already `running`); await
    /// readiness with [`Spawner::await_ready`].
    pub async fn spawn(&self, opts: SpawnOptions) -> Result<Arc<SessionHandle>> {
        if !self.provider.is_available() {
            return Err(OrchestratorError::SpawnFailure(format!(
                "provider '{}' binary '{}' not found on PATH",
                self.provider.name(),
                self.provider.binary()
            )));
        }
        if !opts.working_dir.is_dir() {
            return Err(OrchestratorError::SpawnFailure(format!(
                "working directory missing: {}",
                opts.working_dir.display()
            )));
        }

        let handle = Arc::new(SessionHandle::new(&opts));
        self.sessions
            .lock()
            .expect("session table poisoned")
            .insert(handle.id.clone(), handle.clone());
        debug!(
            session_id = %handle.id,
            agent_id = %opts.agent_id,
            mode = %opts.mode,
            resume = opts.resume_upstream_id.is_some(),
            "spawning session"
        );

        let spawned = match opts.mode {
            SessionMode::Headless => headless::spawn(self, &handle, &opts).await,
            SessionMode::Interactive => interactive::spawn(self, &handle, &opts).await,
        };
        if let Err(e) = spawned {
            handle_exit(&self.bus, &handle, None);
            return Err(e);
        }
        Ok(handle)
    }

    /// Wait for the init handshake (headless) or return immediately
    /// (interactive). On timeout the session is force-killed and ends
    /// `terminated`.
    pub async fn await_ready(
        &self,
        handle: &Arc<SessionHandle>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        if handle.mode == SessionMode::Interactive {
            return Ok(());
        }
        let deadline = self.config.clamp_init_timeout(timeout);
        let rx = handle.init_rx.lock().await.take();
        let Some(rx) = rx else {
            return match handle.status() {
                SessionStatus::Running => Ok(()),
                status => Err(OrchestratorError::InvalidState {
                    operation: "await_ready",
                    status,
                }),
            };
        };
        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(OrchestratorError::SpawnFailure(
                "subprocess exited before the init handshake".to_string(),
            )),
            Err(_) => {
                warn!(session_id = %handle.id, "init handshake timed out, killing session");
                let _ = self.terminate(&handle.id, false).await;
                Err(OrchestratorError::Timeout {
                    operation: "init handshake",
                    timeout: deadline,
                })
            }
        }
    }

    /// Write one user turn to a running headless session's stdin.
    pub async fn send_input(&self, session_id: &str, text: &str) -> Result<()> {
        let handle = self.get(session_id)?;
        let status = handle.status();
        if !status.accepts_input() {
            return Err(OrchestratorError::InvalidState {
                operation: "send_input",
                status,
            });
        }
        if handle.mode != SessionMode::Headless {
            return Err(OrchestratorError::InvalidState {
                operation: "send_input on interactive session",
                status,
            });
        }
        let record = encode_input_record(text);
        let mut io = handle.io.lock().await;
        let SessionIo::Headless { stdin, .. } = &mut *io else {
            return Err(OrchestratorError::InvalidState {
                operation: "send_input",
                status: handle.status(),
            });
        };
        let write = async {
            stdin.write_all(record.as_bytes()).await?;
            stdin.flush().await
        };
        tokio::time::timeout(self.config.write_timeout(), write)
            .await
            .map_err(|_| OrchestratorError::Timeout {
                operation: "stdin write",
                timeout: self.config.write_timeout(),
            })??;
        handle.touch();
        Ok(())
    }

    /// Forward opaque bytes to a running interactive session's terminal.
    pub async fn write_pty(&self, session_id: &str, bytes: &[u8]) -> Result<()> {
        let handle = self.get(session_id)?;
        let status = handle.status();
        if !status.accepts_input() {
            return Err(OrchestratorError::InvalidState {
                operation: "write_pty",
                status,
            });
        }
        let mut io = handle.io.lock().await;
        let SessionIo::Interactive { writer, .. } = &mut *io else {
            return Err(OrchestratorError::InvalidState {
                operation: "write_pty on headless session",
                status,
            });
        };
        writer.write_all(bytes)?;
        writer.flush()?;
        handle.touch();
        Ok(())
    }

    /// Resize the terminal. Fire-and-forget: failures on a closed PTY are
    /// downgraded to warnings.
    pub async fn resize(&self, session_id: &str, rows: u16, cols: u16) -> Result<()> {
        let handle = self.get(session_id)?;
        let io = handle.io.lock().await;
        match &*io {
            SessionIo::Interactive { master, .. } => {
                if let Err(e) = master.resize(PtySize {
                    rows,
                    cols,
                    pixel_width: 0,
                    pixel_height: 0,
                }) {
                    warn!(session_id = %session_id, error = %e, "pty resize failed");
                }
                Ok(())
            }
            _ => Err(OrchestratorError::InvalidState {
                operation: "resize on headless session",
                status: handle.status(),
            }),
        }
    }

    /// Stop a session. Graceful sends the mode-appropriate soft shutdown and
    /// escalates to a kill after the grace window; forced kills immediately.
    /// Terminating an already-terminated session is a no-op.
    pub async fn terminate(&self, session_id: &str, graceful: bool) -> Result<()> {
        let handle = self.get(session_id)?;
        {
            let mut state = handle.state.lock().expect("session state poisoned");
            match state.status {
                SessionStatus::Terminated => return Ok(()),
                // A suspended session's process is already gone; settle it.
                SessionStatus::Suspended => {
                    transition(&mut state.status, SessionStatus::Terminated)?;
                    return Ok(());
                }
                SessionStatus::Running if graceful => {
                    transition(&mut state.status, SessionStatus::Terminating)?;
                }
                _ => {}
            }
        }

        let mut exited = handle.exit_receiver();
        if graceful {
            self.soft_shutdown(&handle).await;
            let grace = self.config.grace_timeout();
            if tokio::time::timeout(grace, exited.wait_for(|done| *done))
                .await
                .is_ok()
            {
                return Ok(());
            }
            warn!(session_id = %session_id, "graceful shutdown expired, force killing");
        }

        self.force_kill(&handle).await;
        let grace = self.config.grace_timeout();
        tokio::time::timeout(grace, exited.wait_for(|done| *done))
            .await
            .map_err(|_| OrchestratorError::Timeout {
                operation: "terminate",
                timeout: grace,
            })?
            .map_err(|_| OrchestratorError::Other("exit watcher dropped".to_string()))?;
        Ok(())
    }

    /// Park a session: kill the process but keep the record (and its
    /// upstream id) so the caller can resume later.
    pub async fn suspend(&self, session_id: &str) -> Result<()> {
        let handle = self.get(session_id)?;
        {
            let mut state = handle.state.lock().expect("session state poisoned");
            match state.status {
                SessionStatus::Terminated | SessionStatus::Suspended => return Ok(()),
                _ => transition(&mut state.status, SessionStatus::Suspended)?,
            }
        }
        let mut exited = handle.exit_receiver();
        self.force_kill(&handle).await;
        let grace = self.config.grace_timeout();
        let _ = tokio::time::timeout(grace, exited.wait_for(|done| *done)).await;
        info!(session_id = %session_id, "session suspended");
        Ok(())
    }

    async fn soft_shutdown(&self, handle: &SessionHandle) {
        let mut io = handle.io.lock().await;
        match &mut *io {
            SessionIo::Headless { pid: Some(pid), .. } => {
                signal_process(*pid, false);
            }
            SessionIo::Interactive { writer, .. } => {
                if let Err(e) = writer.write_all(b"exit\r").and_then(|_| writer.flush()) {
                    debug!(session_id = %handle.id, error = %e, "exit write to pty failed");
                }
            }
            _ => {}
        }
    }

    async fn force_kill(&self, handle: &SessionHandle) {
        let mut io = handle.io.lock().await;
        match &mut *io {
            SessionIo::Headless { pid: Some(pid), .. } => {
                signal_process(*pid, true);
            }
            SessionIo::Interactive { killer, .. } => {
                if let Err(e) = killer.kill() {
                    debug!(session_id = %handle.id, error = %e, "pty kill failed");
                }
            }
            _ => {}
        }
    }

    pub fn get(&self, session_id: &str) -> Result<Arc<SessionHandle>> {
        self.sessions
            .lock()
            .expect("session table poisoned")
            .get(session_id)
            .cloned()
            .ok_or_else(|| OrchestratorError::session_not_found(session_id))
    }

    /// Sessions that have not reached `terminated`.
    pub fn list_active(&self) -> Vec<SessionSnapshot> {
        self.collect(|snap| snap.status != SessionStatus::Terminated)
    }

    pub fn list_all(&self) -> Vec<SessionSnapshot> {
        self.collect(|_| true)
    }

    pub fn list_by_agent(&self, agent_id: &str) -> Vec<SessionSnapshot> {
        self.collect(|snap| snap.agent_id == agent_id)
    }

    /// Most recently created session for an agent, live or not.
    pub fn most_recent_for_agent(&self, agent_id: &str) -> Option<SessionSnapshot> {
        self.list_by_agent(agent_id)
            .into_iter()
            .max_by_key(|snap| snap.created_at)
    }

    fn collect(&self, keep: impl Fn(&SessionSnapshot) -> bool) -> Vec<SessionSnapshot> {
        let sessions = self.sessions.lock().expect("session table poisoned");
        let mut snapshots: Vec<SessionSnapshot> = sessions
            .values()
            .map(|handle| handle.snapshot())
            .filter(|snap| keep(snap))
            .collect();
        snapshots.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        snapshots
    }
}

#[cfg(unix)]
fn signal_process(pid: u32, force: bool) {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;

    let signal = if force {
        Signal::SIGKILL
    } else {
        Signal::SIGTERM
    };
    if let Err(e) = kill(Pid::from_raw(pid as i32), signal) {
        debug!(pid, ?signal, error = %e, "signal delivery failed");
    }
}

#[cfg(not(unix))]
fn signal_process(pid: u32, _force: bool) {
    warn!(pid, "process signalling is unsupported on this platform");
}
