// ABOUTME: Route handlers - agent lifecycle, per-session SSE, aggregated feed, dispatch trigger.
// ABOUTME: SSE bodies are streamed, never buffered; slow clients fall to the bus eviction policy.

use std::collections::HashSet;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::Stream;
use serde::Deserialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio_stream::StreamExt;
use tracing::warn;

use elemental_core::{
    AgentRole, Channel, ChannelHub, DispatchDaemon, OrchestratorError, ResumeOptions,
    SessionManager, SessionMode, SessionSnapshot, StartOptions,
};

use crate::ws::ws_handler;

pub struct AppState {
    pub manager: Arc<SessionManager>,
    pub daemon: Arc<DispatchDaemon>,
    pub hub: Arc<ChannelHub>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/agents/:id/start", post(start_agent))
        .route("/agents/:id/stop", post(stop_agent))
        .route("/agents/:id/message", post(message_agent))
        .route("/agents/:id/stream", get(stream_agent))
        .route("/api/events/stream", get(events_stream))
        .route("/ws", get(ws_handler))
        .route("/dispatch/poll-now", post(dispatch_poll_now))
        .with_state(state)
}

/// Core errors mapped onto HTTP statuses; the body carries the error kind
/// for the CLI's exit-code mapping.
pub(crate) struct ApiError(OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(err: OrchestratorError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            OrchestratorError::NotFound { .. } => StatusCode::NOT_FOUND,
            OrchestratorError::InvalidState { .. }
            | OrchestratorError::InvalidTransition { .. }
            | OrchestratorError::Conflict(_) => StatusCode::CONFLICT,
            OrchestratorError::ParseFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            OrchestratorError::Timeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            OrchestratorError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({
            "error": { "kind": self.0.kind(), "message": self.0.to_string() },
        });
        (status, Json(body)).into_response()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StartAgentRequest {
    initial_prompt: Option<String>,
    resume: bool,
    role: Option<AgentRole>,
    mode: Option<SessionMode>,
    working_dir: Option<PathBuf>,
}

async fn start_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(req): Json<StartAgentRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let role = req.role.unwrap_or(AgentRole::Worker);
    let start = StartOptions {
        mode: req.mode,
        initial_prompt: req.initial_prompt,
        working_dir: req.working_dir,
        run_ready_check: role == AgentRole::Worker,
        ..Default::default()
    };
    let session_id = if req.resume {
        let opts = ResumeOptions {
            start,
            fall_back_to_start: true,
            require_anchored_work: false,
        };
        state.manager.resume(&agent_id, role, opts).await?
    } else {
        state.manager.start(&agent_id, role, start).await?
    };
    Ok(Json(json!({ "session_id": session_id })))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StopAgentRequest {
    graceful: Option<bool>,
}

async fn stop_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(req): Json<StopAgentRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = current_session(&state, &agent_id)?;
    state
        .manager
        .stop(&session.id, req.graceful.unwrap_or(true))
        .await?;
    Ok(Json(json!({})))
}

#[derive(Debug, Deserialize)]
struct MessageRequest {
    content: String,
}

async fn message_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
    Json(req): Json<MessageRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let session = current_session(&state, &agent_id)?;
    state.manager.send(&session.id, &req.content).await?;
    Ok(Json(json!({})))
}

/// Per-session SSE: `event: <type>\ndata: <json>\n\n`, headers flushed
/// before the first event, body streamed until the subscriber closes.
async fn stream_agent(
    State(state): State<Arc<AppState>>,
    Path(agent_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let session = current_session(&state, &agent_id)?;
    let mut events = state.manager.stream(&session.id)?;

    let stream = async_stream::stream! {
        while let Some(event) = events.next().await {
            match Event::default().event(event.label()).json_data(&event) {
                Ok(sse_event) => yield Ok::<_, Infallible>(sse_event),
                Err(e) => warn!(error = %e, "failed to encode session event"),
            }
        }
    };
    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct EventsQuery {
    channels: Option<String>,
}

pub(crate) fn parse_channels(raw: Option<&str>) -> HashSet<Channel> {
    let Some(raw) = raw else {
        // No filter: everything.
        return [
            Channel::Tasks,
            Channel::Sessions,
            Channel::Messages,
            Channel::Agents,
        ]
        .into_iter()
        .collect();
    };
    raw.split(',')
        .filter_map(|token| token.parse().ok())
        .collect()
}

/// Aggregated cross-session feed over the hub.
async fn events_stream(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let channels = parse_channels(query.channels.as_deref());
    let mut rx = state.hub.subscribe();

    let stream = async_stream::stream! {
        loop {
            match rx.recv().await {
                Ok(event) if channels.contains(&event.channel) => {
                    match Event::default().event(event.channel.as_str()).json_data(&event) {
                        Ok(sse_event) => yield Ok::<_, Infallible>(sse_event),
                        Err(e) => warn!(error = %e, "failed to encode hub event"),
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    // Slow consumer: cut the stream rather than stall the hub.
                    warn!(skipped, "SSE consumer lagged, disconnecting");
                    break;
                }
                Err(RecvError::Closed) => break,
            }
        }
    };
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn dispatch_poll_now(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    state.daemon.poll_now();
    Json(json!({}))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let active = state.manager.list_active();
    Json(json!({
        "status": "ok",
        "active_sessions": active.len(),
        "dispatch": state.daemon.stats(),
        "feed_subscribers": state.hub.receiver_count(),
    }))
}

fn current_session(state: &AppState, agent_id: &str) -> Result<SessionSnapshot, ApiError> {
    state
        .manager
        .most_recent_for_agent(agent_id)
        .ok_or_else(|| ApiError(OrchestratorError::agent_not_found(agent_id)))
}
