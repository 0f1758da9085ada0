// ABOUTME: Session lifecycle state machine with an explicit transition table.
// ABOUTME: Every status change in the spawner goes through transition().

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Starting,
    Running,
    Suspended,
    Terminating,
    Terminated,
}

impl SessionStatus {
    /// The complete set of legal edges. Terminated is final.
    pub fn allowed_transitions(self) -> &'static [SessionStatus] {
        use SessionStatus::*;
        match self {
            Starting => &[Running, Terminated],
            Running => &[Suspended, Terminating, Terminated],
            Suspended => &[Running, Terminated],
            Terminating => &[Terminated],
            Terminated => &[],
        }
    }

    pub fn can_transition_to(self, to: SessionStatus) -> bool {
        self.allowed_transitions().contains(&to)
    }

    /// A session accepts input only while running.
    pub fn accepts_input(self) -> bool {
        self == SessionStatus::Running
    }

    pub fn is_terminal(self) -> bool {
        self == SessionStatus::Terminated
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Starting => "starting",
            SessionStatus::Running => "running",
            SessionStatus::Suspended => "suspended",
            SessionStatus::Terminating => "terminating",
            SessionStatus::Terminated => "terminated",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Apply one transition, rejecting anything outside the table.
pub fn transition(status: &mut SessionStatus, to: SessionStatus) -> Result<()> {
    if !status.can_transition_to(to) {
        return Err(OrchestratorError::InvalidTransition { from: *status, to });
    }
    *status = to;
    Ok(())
}
