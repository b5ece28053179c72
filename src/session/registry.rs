//! In-flight request correlation
//!
//! Three tables, one per producer, so ids from different identity spaces can
//! never collide:
//!
//! 1. Client requests awaiting an agent result. The bridge allocates a fresh
//!    numeric id, forwards under it, and routes the agent's reply back to
//!    the waiting caller.
//! 2. Agent requests awaiting a client response (permissions). Keyed by the
//!    agent's own id, preserved verbatim for the reply path.
//! 3. Handshake-internal requests, scoped to one session and purged when it
//!    terminates.
//!
//! Bridge-allocated ids (tables 1 and 3) share one counter; an agent reply
//! is resolved against the handshake table first, then the client table.
//! Waiters enforce their own deadlines with `tokio::time::timeout` and
//! remove the entry on expiry; session termination and client disconnect
//! drain the matching entries here.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use serde_json::Value;
use tokio::sync::oneshot;

use crate::error::{Error, Result};
use crate::protocol::RequestId;

/// Receiving half handed to whoever awaits an agent reply.
pub type ReplyReceiver = oneshot::Receiver<Result<Value>>;

struct Waiter {
    session_id: String,
    /// Connection that originated the request; `None` for bridge-internal.
    conn_id: Option<String>,
    tx: oneshot::Sender<Result<Value>>,
}

/// A parked agent→client request.
#[derive(Debug, Clone)]
pub struct ParkedRequest {
    /// The agent's id exactly as it appeared on the wire.
    pub request_id: RequestId,
    pub kind: String,
}

/// Correlation tables for every in-flight request.
#[derive(Default)]
pub struct RequestRegistry {
    next_id: AtomicI64,
    client: Mutex<HashMap<i64, Waiter>>,
    handshake: Mutex<HashMap<i64, Waiter>>,
    permissions: Mutex<HashMap<String, Vec<ParkedRequest>>>,
}

impl RequestRegistry {
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            ..Default::default()
        }
    }

    fn allocate(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    // =========================================================================
    // Bridge-originated requests (client passthrough + handshake)
    // =========================================================================

    /// Register a client-originated request being forwarded to the agent.
    /// Returns the fresh bridge-scoped id to forward under.
    pub fn register_client(&self, session_id: &str, conn_id: &str) -> (i64, ReplyReceiver) {
        let id = self.allocate();
        let (tx, rx) = oneshot::channel();
        let mut client = self.client.lock().expect("registry lock poisoned");
        client.insert(
            id,
            Waiter {
                session_id: session_id.to_string(),
                conn_id: Some(conn_id.to_string()),
                tx,
            },
        );
        (id, rx)
    }

    /// Register a handshake-internal request for a session.
    pub fn register_handshake(&self, session_id: &str) -> (i64, ReplyReceiver) {
        let id = self.allocate();
        let (tx, rx) = oneshot::channel();
        let mut handshake = self.handshake.lock().expect("registry lock poisoned");
        handshake.insert(
            id,
            Waiter {
                session_id: session_id.to_string(),
                conn_id: None,
                tx,
            },
        );
        (id, rx)
    }

    /// Route an agent reply to whoever is waiting on the bridge id.
    /// Returns false when nothing was waiting (late or unknown reply).
    pub fn resolve(&self, id: i64, outcome: Result<Value>) -> bool {
        let waiter = {
            let mut handshake = self.handshake.lock().expect("registry lock poisoned");
            handshake.remove(&id)
        }
        .or_else(|| {
            let mut client = self.client.lock().expect("registry lock poisoned");
            client.remove(&id)
        });

        match waiter {
            Some(w) => {
                let _ = w.tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop an entry without resolving it (the waiter timed out).
    pub fn remove(&self, id: i64) {
        self.handshake
            .lock()
            .expect("registry lock poisoned")
            .remove(&id);
        self.client
            .lock()
            .expect("registry lock poisoned")
            .remove(&id);
    }

    // =========================================================================
    // Agent-originated requests (permissions)
    // =========================================================================

    /// Park an agent request until a client responds.
    pub fn park_agent_request(&self, session_id: &str, request_id: RequestId, kind: &str) {
        let mut permissions = self.permissions.lock().expect("registry lock poisoned");
        permissions
            .entry(session_id.to_string())
            .or_default()
            .push(ParkedRequest {
                request_id,
                kind: kind.to_string(),
            });
    }

    /// Take a parked agent request by id, returning the agent's original id.
    ///
    /// Tries an exact match first; a numeric-looking string falls back to
    /// its numeric form, so a client echoing `"42"` still resolves the
    /// agent's `42`.
    pub fn take_agent_request(
        &self,
        session_id: &str,
        request_id: &RequestId,
    ) -> Option<ParkedRequest> {
        let mut permissions = self.permissions.lock().expect("registry lock poisoned");
        let parked = permissions.get_mut(session_id)?;

        let pos = parked
            .iter()
            .position(|p| &p.request_id == request_id)
            .or_else(|| {
                let numeric = request_id.numeric_form()?;
                parked.iter().position(|p| p.request_id == numeric)
            })?;
        let entry = parked.remove(pos);
        if parked.is_empty() {
            permissions.remove(session_id);
        }
        Some(entry)
    }

    /// Find which session parked a request with this id (for raw client
    /// replies that carry no session context).
    pub fn find_agent_request(&self, request_id: &RequestId) -> Option<String> {
        let permissions = self.permissions.lock().expect("registry lock poisoned");
        let numeric = request_id.numeric_form();
        permissions
            .iter()
            .find(|(_, parked)| {
                parked.iter().any(|p| {
                    &p.request_id == request_id || Some(&p.request_id) == numeric.as_ref()
                })
            })
            .map(|(session_id, _)| session_id.clone())
    }

    /// Unresolved agent requests parked for a session.
    pub fn parked_count(&self, session_id: &str) -> usize {
        self.permissions
            .lock()
            .expect("registry lock poisoned")
            .get(session_id)
            .map(|p| p.len())
            .unwrap_or(0)
    }

    // =========================================================================
    // Failure draining
    // =========================================================================

    /// Resolve every entry tied to a session with `session_terminated`.
    /// No entry may linger past its session's terminal state.
    pub fn fail_session(&self, session_id: &str) {
        let drained: Vec<Waiter> = {
            let mut handshake = self.handshake.lock().expect("registry lock poisoned");
            let mut client = self.client.lock().expect("registry lock poisoned");
            let hs_ids: Vec<i64> = handshake
                .iter()
                .filter(|(_, w)| w.session_id == session_id)
                .map(|(id, _)| *id)
                .collect();
            let cl_ids: Vec<i64> = client
                .iter()
                .filter(|(_, w)| w.session_id == session_id)
                .map(|(id, _)| *id)
                .collect();
            hs_ids
                .into_iter()
                .filter_map(|id| handshake.remove(&id))
                .chain(cl_ids.into_iter().filter_map(|id| client.remove(&id)))
                .collect()
        };
        for waiter in drained {
            let _ = waiter.tx.send(Err(Error::SessionTerminated(format!(
                "session {session_id} reached a terminal state"
            ))));
        }

        self.permissions
            .lock()
            .expect("registry lock poisoned")
            .remove(session_id);
    }

    /// Resolve every client-originated entry for a disconnected client with
    /// `client_gone`.
    pub fn fail_client(&self, conn_id: &str) {
        let drained: Vec<Waiter> = {
            let mut client = self.client.lock().expect("registry lock poisoned");
            let ids: Vec<i64> = client
                .iter()
                .filter(|(_, w)| w.conn_id.as_deref() == Some(conn_id))
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| client.remove(&id)).collect()
        };
        for waiter in drained {
            let _ = waiter.tx.send(Err(Error::ClientGone(format!(
                "connection {conn_id} closed"
            ))));
        }
    }

    /// Outstanding bridge-originated entries, for diagnostics and tests.
    pub fn outstanding(&self) -> usize {
        self.client.lock().expect("registry lock poisoned").len()
            + self.handshake.lock().expect("registry lock poisoned").len()
    }
}
