// ABOUTME: Cross-session broadcast hub feeding the aggregated event stream.
// ABOUTME: Channels: tasks, sessions, messages, agents; receivers that lag are dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;

pub const DEFAULT_HUB_CAPACITY: usize = 256;

/// Named event channels the external feeds can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Tasks,
    Sessions,
    Messages,
    Agents,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Tasks => "tasks",
            Channel::Sessions => "sessions",
            Channel::Messages => "messages",
            Channel::Agents => "agents",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Channel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tasks" => Ok(Channel::Tasks),
            "sessions" => Ok(Channel::Sessions),
            "messages" => Ok(Channel::Messages),
            "agents" => Ok(Channel::Agents),
            other => Err(format!("unknown channel: {other}")),
        }
    }
}

/// One event on the aggregated feed.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelEvent {
    pub channel: Channel,
    pub payload: Value,
    pub at: DateTime<Utc>,
}

/// Broadcast fan-out across all sessions and the dispatch daemon.
///
/// Consumers hold a `broadcast::Receiver`; one that falls behind sees
/// `Lagged` and is expected to close (the stream endpoints translate that
/// into slow-consumer disconnection).
pub struct ChannelHub {
    tx: broadcast::Sender<ChannelEvent>,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn publish(&self, channel: Channel, payload: Value) {
        // Send errors only mean "no receivers right now".
        let _ = self.tx.send(ChannelEvent {
            channel,
            payload,
            at: Utc::now(),
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for ChannelHub {
    fn default() -> Self {
        Self::new(DEFAULT_HUB_CAPACITY)
    }
}
