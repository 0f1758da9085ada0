// ABOUTME: Interactive spawn path - provider CLI inside a login shell on a PTY.
// ABOUTME: Output is opaque pty-data; the upstream id is scraped best-effort from the terminal.

use std::io::Read;
use std::sync::Arc;
use std::sync::OnceLock;

use portable_pty::{native_pty_system, CommandBuilder, PtySize};
use regex::Regex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{handle_exit, SessionHandle, SessionIo, SpawnOptions, Spawner};
use crate::bus::EventBus;
use crate::error::{OrchestratorError, Result};
use crate::event::SessionEvent;
use crate::session::SessionStatus;

/// Best-effort "Session: <id>" scrape; a stable interactive resume path
/// needs an out-of-band channel.
fn session_line_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"Session:\s*([A-Za-z0-9_-]+)").expect("static regex"))
}

pub(super) async fn spawn(
    spawner: &Spawner,
    handle: &Arc<SessionHandle>,
    opts: &SpawnOptions,
) -> Result<()> {
    let pty_system = native_pty_system();
    let pair = pty_system
        .openpty(PtySize {
            rows: spawner.config.pty_rows,
            cols: spawner.config.pty_cols,
            pixel_width: 0,
            pixel_height: 0,
        })
        .map_err(|e| OrchestratorError::SpawnFailure(format!("pty allocation failed: {}", e)))?;

    let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/bash".to_string());
    let invocation = spawner
        .provider
        .interactive_invocation(opts.resume_upstream_id.as_deref());
    debug!(
        session_id = %handle.id,
        shell = %shell,
        invocation = %invocation,
        "spawning interactive session"
    );

    let mut cmd = CommandBuilder::new(&shell);
    cmd.arg("-l");
    cmd.arg("-c");
    cmd.arg(&invocation);
    cmd.cwd(&opts.working_dir);
    cmd.env("ELEMENTAL_SESSION_ID", &handle.id);
    cmd.env("TERM", "xterm-256color");
    if let Some(root) = &spawner.config.workspace_root {
        cmd.env("ELEMENTAL_ROOT", root);
    }

    let child = pair
        .slave
        .spawn_command(cmd)
        .map_err(|e| OrchestratorError::SpawnFailure(format!("pty spawn failed: {}", e)))?;
    drop(pair.slave);

    let killer = child.clone_killer();
    let reader = pair
        .master
        .try_clone_reader()
        .map_err(|e| OrchestratorError::SpawnFailure(format!("pty reader unavailable: {}", e)))?;
    let writer = pair
        .master
        .take_writer()
        .map_err(|e| OrchestratorError::SpawnFailure(format!("pty writer unavailable: {}", e)))?;

    handle
        .set_io(SessionIo::Interactive {
            writer,
            master: pair.master,
            killer,
        })
        .await;

    // No protocol handshake on a terminal: running as soon as the PTY is up.
    handle.transition_to(SessionStatus::Running)?;
    handle.signal_ready();

    // Blocking PTY reads live on a plain thread; the async pump publishes.
    let (tx, rx) = mpsc::unbounded_channel::<Vec<u8>>();
    std::thread::spawn(move || pump_reader(reader, tx));
    tokio::spawn(publish_output(spawner.bus(), handle.clone(), rx));

    // Reap the child off the runtime; exit delivery is idempotent.
    let bus = spawner.bus();
    let exit_handle = handle.clone();
    tokio::task::spawn_blocking(move || {
        let mut child = child;
        let exit_code = match child.wait() {
            Ok(status) => Some(status.exit_code() as i32),
            Err(e) => {
                warn!(session_id = %exit_handle.id, error = %e, "failed to reap pty child");
                None
            }
        };
        handle_exit(&bus, &exit_handle, exit_code);
    });

    Ok(())
}

fn pump_reader(mut reader: Box<dyn Read + Send>, tx: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buffer = [0u8; 4096];
    loop {
        match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(buffer[..n].to_vec()).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(error = %e, "pty read ended");
                break;
            }
        }
    }
}

async fn publish_output(
    bus: Arc<EventBus>,
    handle: Arc<SessionHandle>,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(bytes) = rx.recv().await {
        if handle.upstream_session_id().is_none() {
            let text = String::from_utf8_lossy(&bytes);
            if let Some(captures) = session_line_regex().captures(&text) {
                let upstream_id = captures[1].to_string();
                debug!(
                    session_id = %handle.id,
                    upstream_id = %upstream_id,
                    "scraped upstream session id from terminal output"
                );
                handle.record_upstream_id(&upstream_id);
            }
        }
        handle.touch();
        bus.publish(&handle.id, &SessionEvent::pty_data(bytes));
    }
}
