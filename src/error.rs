//! Bridge error types

use thiserror::Error;

use crate::protocol;

/// Bridge error type
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed JSON from a peer
    #[error("Parse error: {0}")]
    Parse(String),

    /// JSON-RPC structural or parameter error
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown session or request id
    #[error("Not found: {0}")]
    NotFound(String),

    /// Operation attempted before the handshake completed
    #[error("Not ready: {0}")]
    NotReady(String),

    /// Handshake or pending-request deadline exceeded
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Agent subprocess could not be started
    #[error("Spawn failed: {0}")]
    SpawnFailed(String),

    /// Subprocess pipe read/write failure
    #[error("Agent IO error: {0}")]
    AgentIo(String),

    /// Session reached a terminal state while a caller was waiting
    #[error("Session terminated: {0}")]
    SessionTerminated(String),

    /// WebSocket closed while a request was in flight
    #[error("Client gone: {0}")]
    ClientGone(String),

    /// Event store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Map this error onto the JSON-RPC error code returned to clients.
    pub fn rpc_code(&self) -> i64 {
        match self {
            Error::Parse(_) => protocol::PARSE_ERROR,
            Error::InvalidRequest(_) | Error::NotFound(_) | Error::NotReady(_) => {
                protocol::INVALID_PARAMS
            }
            _ => protocol::INTERNAL_ERROR,
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_codes() {
        assert_eq!(Error::Parse("x".into()).rpc_code(), -32700);
        assert_eq!(Error::NotFound("x".into()).rpc_code(), -32602);
        assert_eq!(Error::NotReady("x".into()).rpc_code(), -32602);
        assert_eq!(Error::InvalidRequest("x".into()).rpc_code(), -32602);
        assert_eq!(Error::SpawnFailed("x".into()).rpc_code(), -32603);
        assert_eq!(Error::Timeout("x".into()).rpc_code(), -32603);
        assert_eq!(Error::SessionTerminated("x".into()).rpc_code(), -32603);
    }
}
