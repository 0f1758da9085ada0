// ABOUTME: Session event model - parses streaming JSONL from agent subprocesses.
// ABOUTME: One tagged variant per wire event type, raw record kept alongside for passthrough.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A parsed item emitted by an agent subprocess, in parse order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub received_at: DateTime<Utc>,
    /// The original wire record, untouched, for consumers that need
    /// provider-specific fields.
    pub raw: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEventKind {
    System {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        upstream_session_id: Option<String>,
    },
    Assistant {
        text: String,
    },
    User {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        id: String,
        output: String,
        is_error: bool,
    },
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subtype: Option<String>,
        is_error: bool,
    },
    Error {
        message: String,
    },
    /// A stdout line that was not valid JSON; kept verbatim.
    Raw {
        line: String,
    },
    /// Opaque terminal output from an interactive (PTY) session.
    PtyData {
        bytes: Vec<u8>,
    },
}

impl SessionEvent {
    pub fn new(kind: SessionEventKind, raw: Value) -> Self {
        Self {
            kind,
            received_at: Utc::now(),
            raw,
        }
    }

    pub fn raw_line(line: impl Into<String>) -> Self {
        let line = line.into();
        let raw = Value::String(line.clone());
        Self::new(SessionEventKind::Raw { line }, raw)
    }

    pub fn pty_data(bytes: Vec<u8>) -> Self {
        Self::new(SessionEventKind::PtyData { bytes }, Value::Null)
    }

    pub fn error(message: impl Into<String>) -> Self {
        let message = message.into();
        let raw = serde_json::json!({ "type": "error", "error": message });
        Self::new(SessionEventKind::Error { message }, raw)
    }

    /// The subscriber-eviction notice delivered before a slow consumer's
    /// stream is closed.
    pub fn slow_consumer() -> Self {
        let raw = serde_json::json!({ "type": "error", "reason": "slow_consumer" });
        Self::new(
            SessionEventKind::Error {
                message: "slow_consumer".to_string(),
            },
            raw,
        )
    }

    /// The synthetic terminal event emitted when a session's process exits.
    pub fn session_exit(exit_code: Option<i32>) -> Self {
        let raw = serde_json::json!({
            "type": "result",
            "subtype": "session_exit",
            "exit_code": exit_code,
        });
        Self::new(
            SessionEventKind::Result {
                subtype: Some("session_exit".to_string()),
                is_error: exit_code.map(|c| c != 0).unwrap_or(false),
            },
            raw,
        )
    }

    /// Wire `type` label, used as the SSE event name.
    pub fn label(&self) -> &'static str {
        match &self.kind {
            SessionEventKind::System { .. } => "system",
            SessionEventKind::Assistant { .. } => "assistant",
            SessionEventKind::User { .. } => "user",
            SessionEventKind::ToolUse { .. } => "tool_use",
            SessionEventKind::ToolResult { .. } => "tool_result",
            SessionEventKind::Result { .. } => "result",
            SessionEventKind::Error { .. } => "error",
            SessionEventKind::Raw { .. } => "raw",
            SessionEventKind::PtyData { .. } => "pty-data",
        }
    }

    /// True for the `system/init` handshake event.
    pub fn is_init(&self) -> bool {
        matches!(
            &self.kind,
            SessionEventKind::System { subtype: Some(s), .. } if s == "init"
        )
    }

    pub fn upstream_session_id(&self) -> Option<&str> {
        match &self.kind {
            SessionEventKind::System {
                upstream_session_id,
                ..
            } => upstream_session_id.as_deref(),
            _ => None,
        }
    }
}

/// Parse one stdout line into an event.
///
/// A line that is not a JSON object becomes a `Raw` event; parse failures
/// never terminate a session.
pub fn parse_line(line: &str) -> SessionEvent {
    let json: Value = match serde_json::from_str(line) {
        Ok(Value::Object(map)) => Value::Object(map),
        _ => return SessionEvent::raw_line(line),
    };
    let kind = classify(&json);
    SessionEvent::new(kind, json)
}

fn classify(json: &Value) -> SessionEventKind {
    let event_type = json.get("type").and_then(|t| t.as_str()).unwrap_or("");
    let subtype = json
        .get("subtype")
        .and_then(|s| s.as_str())
        .map(String::from);

    match event_type {
        "system" => SessionEventKind::System {
            upstream_session_id: json
                .get("session_id")
                .and_then(|s| s.as_str())
                .map(String::from),
            subtype,
        },
        "assistant" => {
            // Tool invocations ride inside assistant messages; surface the
            // first one as the event, text otherwise.
            if let Some((id, name, input)) = first_tool_use(json) {
                SessionEventKind::ToolUse { id, name, input }
            } else {
                SessionEventKind::Assistant {
                    text: collect_text(json),
                }
            }
        }
        "user" => {
            // Tool results come back as user messages.
            if let Some((id, output, is_error)) = first_tool_result(json) {
                SessionEventKind::ToolResult {
                    id,
                    output,
                    is_error,
                }
            } else {
                SessionEventKind::User {
                    text: collect_text(json),
                }
            }
        }
        "tool_use" => SessionEventKind::ToolUse {
            id: str_field(json, "tool_use_id").or_else(|| str_field(json, "id")).unwrap_or_default(),
            name: str_field(json, "tool").or_else(|| str_field(json, "name")).unwrap_or_default(),
            input: json.get("tool_input").cloned().unwrap_or(Value::Null),
        },
        "tool_result" => SessionEventKind::ToolResult {
            id: str_field(json, "tool_use_id").unwrap_or_default(),
            output: str_field(json, "content").unwrap_or_default(),
            is_error: json
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        },
        "result" => SessionEventKind::Result {
            subtype,
            is_error: json
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
        },
        "error" => SessionEventKind::Error {
            message: str_field(json, "error")
                .or_else(|| str_field(json, "message"))
                .unwrap_or_else(|| "unknown error".to_string()),
        },
        _ => SessionEventKind::Raw {
            line: json.to_string(),
        },
    }
}

fn str_field(json: &Value, key: &str) -> Option<String> {
    json.get(key).and_then(|v| v.as_str()).map(String::from)
}

fn content_blocks(json: &Value) -> Option<&Vec<Value>> {
    json.get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_array())
}

fn collect_text(json: &Value) -> String {
    // Plain string content first, then nested content blocks.
    if let Some(text) = json
        .get("message")
        .and_then(|m| m.get("content"))
        .and_then(|c| c.as_str())
    {
        return text.to_string();
    }
    if let Some(text) = str_field(json, "message") {
        return text;
    }
    let Some(blocks) = content_blocks(json) else {
        return String::new();
    };
    let mut out = String::new();
    for block in blocks {
        if block.get("type").and_then(|t| t.as_str()) == Some("text") {
            if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text);
            }
        }
    }
    out
}

fn first_tool_use(json: &Value) -> Option<(String, String, Value)> {
    for block in content_blocks(json)? {
        if block.get("type").and_then(|t| t.as_str()) == Some("tool_use") {
            return Some((
                str_field(block, "id").unwrap_or_default(),
                str_field(block, "name").unwrap_or_default(),
                block.get("input").cloned().unwrap_or(Value::Null),
            ));
        }
    }
    None
}

fn first_tool_result(json: &Value) -> Option<(String, String, bool)> {
    for block in content_blocks(json)? {
        if block.get("type").and_then(|t| t.as_str()) == Some("tool_result") {
            return Some((
                str_field(block, "tool_use_id").unwrap_or_default(),
                str_field(block, "content").unwrap_or_default(),
                block
                    .get("is_error")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            ));
        }
    }
    None
}

/// Encode one input turn as the line-delimited JSON record the subprocess
/// expects on stdin.
pub fn encode_input_record(text: &str) -> String {
    let record = serde_json::json!({
        "type": "user",
        "message": { "role": "user", "content": text },
    });
    let mut line = record.to_string();
    line.push('\n');
    line
}
