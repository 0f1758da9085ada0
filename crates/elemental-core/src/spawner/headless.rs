// ABOUTME: Headless spawn path - line-delimited JSON over pipes.
// ABOUTME: Initial prompt goes down stdin as the first record; stdout is parsed per line.

use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tracing::{debug, warn};

use super::{handle_exit, SessionHandle, SessionIo, SpawnOptions, Spawner};
use crate::bus::EventBus;
use crate::error::{OrchestratorError, Result};
use crate::event::{encode_input_record, parse_line, SessionEventKind};
use crate::session::SessionStatus;

pub(super) async fn spawn(
    spawner: &Spawner,
    handle: &Arc<SessionHandle>,
    opts: &SpawnOptions,
) -> Result<()> {
    let binary = spawner.provider.binary().to_string();
    let args = spawner
        .provider
        .headless_args(opts.resume_upstream_id.as_deref());
    debug!(session_id = %handle.id, binary = %binary, args = ?args, "spawning headless session");

    let mut cmd = Command::new(&binary);
    cmd.args(&args)
        .current_dir(&opts.working_dir)
        .env("ELEMENTAL_SESSION_ID", &handle.id)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(root) = &spawner.config.workspace_root {
        cmd.env("ELEMENTAL_ROOT", root);
    }

    let mut child = cmd.spawn().map_err(|e| {
        OrchestratorError::SpawnFailure(format!("failed to spawn '{}': {}", binary, e))
    })?;

    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| OrchestratorError::SpawnFailure("failed to capture stdin".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| OrchestratorError::SpawnFailure("failed to capture stdout".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| OrchestratorError::SpawnFailure("failed to capture stderr".to_string()))?;
    let pid = child.id();

    // The subprocess blocks waiting for JSON input, so the first user turn
    // must be written right after process creation.
    let record = encode_input_record(opts.initial_prompt.as_deref().unwrap_or_default());
    let write = async {
        stdin.write_all(record.as_bytes()).await?;
        stdin.flush().await
    };
    match tokio::time::timeout(spawner.config.write_timeout(), write).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let _ = child.kill().await;
            return Err(OrchestratorError::SpawnFailure(format!(
                "initial prompt write failed: {}",
                e
            )));
        }
        Err(_) => {
            let _ = child.kill().await;
            return Err(OrchestratorError::Timeout {
                operation: "initial prompt write",
                timeout: spawner.config.write_timeout(),
            });
        }
    }

    handle.set_io(SessionIo::Headless { stdin, pid }).await;

    // Drain stderr so the child never blocks on a full pipe.
    let stderr_session = handle.id.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if !line.is_empty() {
                debug!(session_id = %stderr_session, stderr = %line, "subprocess stderr");
            }
        }
    });

    tokio::spawn(supervise(spawner.bus(), handle.clone(), child, stdout));
    Ok(())
}

/// Per-session reader: parses stdout into events, then reaps the child.
async fn supervise(
    bus: Arc<EventBus>,
    handle: Arc<SessionHandle>,
    mut child: Child,
    mut stdout: ChildStdout,
) {
    // Partial lines are carried across chunks in this buffer.
    let mut parse_buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 8192];

    loop {
        match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                parse_buf.extend_from_slice(&chunk[..n]);
                while let Some(pos) = parse_buf.iter().position(|b| *b == b'\n') {
                    let raw: Vec<u8> = parse_buf.drain(..=pos).collect();
                    let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
                    process_line(&bus, &handle, line.trim_end_matches('\r'));
                }
            }
            Err(e) => {
                warn!(session_id = %handle.id, error = %e, "stdout read failed");
                break;
            }
        }
    }
    // A final line without a trailing newline still counts.
    if !parse_buf.is_empty() {
        let line = String::from_utf8_lossy(&parse_buf).to_string();
        process_line(&bus, &handle, line.trim());
    }

    let exit_code = match child.wait().await {
        Ok(status) => status.code(),
        Err(e) => {
            warn!(session_id = %handle.id, error = %e, "failed to reap subprocess");
            None
        }
    };
    handle_exit(&bus, &handle, exit_code);
}

fn process_line(bus: &EventBus, handle: &SessionHandle, line: &str) {
    if line.is_empty() {
        return;
    }
    let event = parse_line(line);
    if let SessionEventKind::Raw { .. } = event.kind {
        debug!(session_id = %handle.id, line = %line, "non-JSON stdout line");
    }
    if event.is_init() {
        if let Some(upstream_id) = event.upstream_session_id() {
            debug!(session_id = %handle.id, upstream_id = %upstream_id, "init handshake");
            handle.record_upstream_id(upstream_id);
        }
        if handle.status() == SessionStatus::Starting {
            if let Err(e) = handle.transition_to(SessionStatus::Running) {
                warn!(session_id = %handle.id, error = %e, "init transition rejected");
            }
        }
        handle.signal_ready();
    }
    handle.touch();
    bus.publish(&handle.id, &event);
}
