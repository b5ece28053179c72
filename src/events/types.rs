//! Storage record types
//!
//! These are the rows of the durable store and double as the wire shapes
//! returned by `session/list` / `session/get` (camelCase on the wire).

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::RequestId;

/// Session lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Subprocess spawned, handshake not yet complete
    Initializing,
    /// Handshake complete; processing or idle awaiting a prompt
    Running,
    /// At least one permission request from the agent is unresolved
    Waiting,
    /// Terminated cleanly by explicit client cancel
    Completed,
    /// Handshake or protocol failure
    Error,
    /// Subprocess exited while the session was active
    Exited,
}

impl SessionStatus {
    /// True for states in which no agent subprocess may remain attached.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionStatus::Completed | SessionStatus::Error | SessionStatus::Exited
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Initializing => "initializing",
            SessionStatus::Running => "running",
            SessionStatus::Waiting => "waiting",
            SessionStatus::Completed => "completed",
            SessionStatus::Error => "error",
            SessionStatus::Exited => "exited",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "initializing" => Some(SessionStatus::Initializing),
            "running" => Some(SessionStatus::Running),
            "waiting" => Some(SessionStatus::Waiting),
            "completed" => Some(SessionStatus::Completed),
            "error" => Some(SessionStatus::Error),
            "exited" => Some(SessionStatus::Exited),
            _ => None,
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One session row
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_id: String,
    pub agent_type: String,
    pub cwd: String,
    pub title: String,
    /// The id the agent returned from its own create-session call.
    /// Immutable once set.
    pub agent_session_id: Option<String>,
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_reason: Option<String>,
    pub archived: bool,
    pub created_at: u64,
    pub updated_at: u64,
}

/// One event row: `(session_id, seq)` is unique, `seq` is contiguous from 1
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventRecord {
    pub session_id: String,
    pub seq: u64,
    pub update_type: String,
    /// Opaque payload, preserved byte-for-byte on replay
    pub payload: Value,
    pub created_at: u64,
}

/// A live agent→client request awaiting a reply
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingPermission {
    pub session_id: String,
    /// The agent's JSON-RPC id, number-or-string preserved exactly
    pub request_id: RequestId,
    pub kind: String,
    pub payload: Value,
    pub created_at: u64,
}

/// Filter for `session/list`
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub archived: Option<bool>,
    pub statuses: Option<Vec<SessionStatus>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_round_trip() {
        for status in [
            SessionStatus::Initializing,
            SessionStatus::Running,
            SessionStatus::Waiting,
            SessionStatus::Completed,
            SessionStatus::Error,
            SessionStatus::Exited,
        ] {
            assert_eq!(SessionStatus::parse(status.as_str()), Some(status));
        }
        assert!(SessionStatus::parse("bogus").is_none());
    }

    #[test]
    fn terminal_states() {
        assert!(!SessionStatus::Initializing.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(!SessionStatus::Waiting.is_terminal());
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Error.is_terminal());
        assert!(SessionStatus::Exited.is_terminal());
    }

    #[test]
    fn session_record_wire_shape() {
        let record = SessionRecord {
            session_id: "s1".into(),
            agent_type: "claude".into(),
            cwd: "/tmp".into(),
            title: "hello".into(),
            agent_session_id: None,
            status: SessionStatus::Running,
            exit_reason: None,
            archived: false,
            created_at: 1,
            updated_at: 2,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["sessionId"], "s1");
        assert_eq!(json["status"], "running");
        assert!(json.get("exitReason").is_none());
    }
}
