//! SQLite-backed event store
//!
//! Durable, process-local record of sessions, their ordered event logs, and
//! open permission requests. WAL journal mode; a single connection behind a
//! mutex, so every operation is a short serialized critical section. That
//! serialization is what makes `append_event`'s seq allocation gap-free:
//! two concurrent appends on one session can never observe the same MAX.

use std::path::Path;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::{params, Connection};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::events::types::{
    EventRecord, PendingPermission, SessionFilter, SessionRecord, SessionStatus,
};
use crate::protocol::RequestId;

/// Durable store for sessions, events, and pending permission requests.
pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    /// Open (or create) the store at the given path.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Storage(format!("failed to create {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| Error::Storage(format!("failed to open database: {e}")))?;
        Self::init(conn)
    }

    /// In-memory store with identical semantics, for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Storage(format!("failed to open in-memory database: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| Error::Storage(format!("failed to set WAL mode: {e}")))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS sessions (
                session_id TEXT PRIMARY KEY,
                agent_type TEXT NOT NULL,
                cwd TEXT NOT NULL,
                title TEXT NOT NULL,
                agent_session_id TEXT,
                status TEXT NOT NULL,
                exit_reason TEXT,
                archived INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS events (
                session_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                update_type TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, seq)
            );

            CREATE TABLE IF NOT EXISTS pending_requests (
                session_id TEXT NOT NULL,
                request_id TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (session_id, request_id)
            );

            CREATE INDEX IF NOT EXISTS idx_sessions_archived ON sessions(archived);
            CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);",
        )
        .map_err(|e| Error::Storage(format!("failed to create schema: {e}")))?;

        tracing::info!("Event store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("store lock poisoned".to_string()))
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// Insert a new session row in `initializing` status.
    pub fn create_session(
        &self,
        session_id: &str,
        agent_type: &str,
        cwd: &str,
        title: &str,
    ) -> Result<SessionRecord> {
        let now = now_millis();
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sessions (session_id, agent_type, cwd, title, status, archived, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
            params![session_id, agent_type, cwd, title, SessionStatus::Initializing.as_str(), now as i64],
        )
        .map_err(|e| Error::Storage(format!("failed to insert session: {e}")))?;

        Ok(SessionRecord {
            session_id: session_id.to_string(),
            agent_type: agent_type.to_string(),
            cwd: cwd.to_string(),
            title: title.to_string(),
            agent_session_id: None,
            status: SessionStatus::Initializing,
            exit_reason: None,
            archived: false,
            created_at: now,
            updated_at: now,
        })
    }

    /// Fetch one session by id.
    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT session_id, agent_type, cwd, title, agent_session_id, status, exit_reason, archived, created_at, updated_at
                 FROM sessions WHERE session_id = ?1",
            )
            .map_err(|e| Error::Storage(format!("failed to prepare query: {e}")))?;

        let raw = stmt
            .query_map(params![session_id], row_to_raw_session)
            .map_err(|e| Error::Storage(format!("failed to query session: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("failed to read session: {e}")))?;

        raw.into_iter().next().map(raw_to_session).transpose()
    }

    /// List sessions, optionally filtered by archived flag and status set.
    /// Newest first.
    pub fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT session_id, agent_type, cwd, title, agent_session_id, status, exit_reason, archived, created_at, updated_at
                 FROM sessions ORDER BY created_at DESC",
            )
            .map_err(|e| Error::Storage(format!("failed to prepare query: {e}")))?;

        let raw = stmt
            .query_map([], row_to_raw_session)
            .map_err(|e| Error::Storage(format!("failed to query sessions: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("failed to read sessions: {e}")))?;

        let mut sessions = Vec::new();
        for row in raw {
            let record = raw_to_session(row)?;
            if let Some(archived) = filter.archived {
                if record.archived != archived {
                    continue;
                }
            }
            if let Some(ref statuses) = filter.statuses {
                if !statuses.contains(&record.status) {
                    continue;
                }
            }
            sessions.push(record);
        }
        Ok(sessions)
    }

    /// Update a session's status.
    pub fn set_status(&self, session_id: &str, status: SessionStatus) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE sessions SET status = ?2, updated_at = ?3 WHERE session_id = ?1",
                params![session_id, status.as_str(), now_millis() as i64],
            )
            .map_err(|e| Error::Storage(format!("failed to update status: {e}")))?;
        if changed == 0 {
            return Err(Error::NotFound(format!("unknown session {session_id}")));
        }
        Ok(())
    }

    /// Record the agent's own session id. Immutable once set: a second call
    /// with a different value is rejected.
    pub fn set_agent_session_id(&self, session_id: &str, agent_session_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE sessions SET agent_session_id = ?2, updated_at = ?3
                 WHERE session_id = ?1 AND (agent_session_id IS NULL OR agent_session_id = ?2)",
                params![session_id, agent_session_id, now_millis() as i64],
            )
            .map_err(|e| Error::Storage(format!("failed to set agent session id: {e}")))?;
        if changed == 0 {
            let exists: bool = conn
                .query_row(
                    "SELECT 1 FROM sessions WHERE session_id = ?1",
                    params![session_id],
                    |_| Ok(true),
                )
                .unwrap_or(false);
            return if exists {
                Err(Error::InvalidRequest(format!(
                    "agent session id already set for {session_id}"
                )))
            } else {
                Err(Error::NotFound(format!("unknown session {session_id}")))
            };
        }
        Ok(())
    }

    /// Update a session's title.
    pub fn set_title(&self, session_id: &str, title: &str) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE sessions SET title = ?2, updated_at = ?3 WHERE session_id = ?1",
                params![session_id, title, now_millis() as i64],
            )
            .map_err(|e| Error::Storage(format!("failed to set title: {e}")))?;
        if changed == 0 {
            return Err(Error::NotFound(format!("unknown session {session_id}")));
        }
        Ok(())
    }

    /// Move a session into a terminal status, recording the exit reason.
    pub fn set_terminal(
        &self,
        session_id: &str,
        status: SessionStatus,
        reason: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE sessions SET status = ?2, exit_reason = ?3, updated_at = ?4 WHERE session_id = ?1",
                params![session_id, status.as_str(), reason, now_millis() as i64],
            )
            .map_err(|e| Error::Storage(format!("failed to set terminal status: {e}")))?;
        if changed == 0 {
            return Err(Error::NotFound(format!("unknown session {session_id}")));
        }
        Ok(())
    }

    /// Soft-delete: set the archived flag.
    pub fn archive(&self, session_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "UPDATE sessions SET archived = 1, updated_at = ?2 WHERE session_id = ?1",
                params![session_id, now_millis() as i64],
            )
            .map_err(|e| Error::Storage(format!("failed to archive: {e}")))?;
        if changed == 0 {
            return Err(Error::NotFound(format!("unknown session {session_id}")));
        }
        Ok(())
    }

    // =========================================================================
    // Events
    // =========================================================================

    /// Append one event, atomically allocating the next seq for the session
    /// (1 for the first event). The store lock serializes the MAX read and
    /// the insert; the primary key is the backstop.
    pub fn append_event(
        &self,
        session_id: &str,
        update_type: &str,
        payload: &Value,
    ) -> Result<EventRecord> {
        let now = now_millis();
        let payload_text = serde_json::to_string(payload)?;

        let conn = self.lock()?;
        let seq: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Storage(format!("failed to allocate seq: {e}")))?;

        conn.execute(
            "INSERT INTO events (session_id, seq, update_type, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, seq, update_type, payload_text, now as i64],
        )
        .map_err(|e| Error::Storage(format!("failed to insert event: {e}")))?;

        Ok(EventRecord {
            session_id: session_id.to_string(),
            seq: seq as u64,
            update_type: update_type.to_string(),
            payload: payload.clone(),
            created_at: now,
        })
    }

    /// Events for a session in seq order, optionally only those with
    /// `seq > since`.
    pub fn list_events(&self, session_id: &str, since: Option<u64>) -> Result<Vec<EventRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT seq, update_type, payload, created_at FROM events
                 WHERE session_id = ?1 AND seq > ?2 ORDER BY seq ASC",
            )
            .map_err(|e| Error::Storage(format!("failed to prepare query: {e}")))?;

        let raw = stmt
            .query_map(
                params![session_id, since.unwrap_or(0) as i64],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .map_err(|e| Error::Storage(format!("failed to query events: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("failed to read events: {e}")))?;

        let mut events = Vec::with_capacity(raw.len());
        for (seq, update_type, payload, created_at) in raw {
            events.push(EventRecord {
                session_id: session_id.to_string(),
                seq: seq as u64,
                update_type,
                payload: serde_json::from_str(&payload)?,
                created_at: created_at as u64,
            });
        }
        Ok(events)
    }

    /// Highest seq for a session, 0 if it has no events.
    pub fn last_seq(&self, session_id: &str) -> Result<u64> {
        let conn = self.lock()?;
        let seq: i64 = conn
            .query_row(
                "SELECT COALESCE(MAX(seq), 0) FROM events WHERE session_id = ?1",
                params![session_id],
                |row| row.get(0),
            )
            .map_err(|e| Error::Storage(format!("failed to query last seq: {e}")))?;
        Ok(seq as u64)
    }

    // =========================================================================
    // Pending permissions
    // =========================================================================

    /// Record a live agent→client request. At most one unresolved request
    /// per `(session_id, request_id)` — a duplicate is rejected.
    pub fn add_pending(
        &self,
        session_id: &str,
        request_id: &RequestId,
        kind: &str,
        payload: &Value,
    ) -> Result<()> {
        let id_text = serde_json::to_string(request_id)?;
        let payload_text = serde_json::to_string(payload)?;
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO pending_requests (session_id, request_id, kind, payload, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, id_text, kind, payload_text, now_millis() as i64],
        )
        .map_err(|e| Error::Storage(format!("failed to insert pending request: {e}")))?;
        Ok(())
    }

    /// Remove a pending request. Returns whether a row was deleted.
    pub fn delete_pending(&self, session_id: &str, request_id: &RequestId) -> Result<bool> {
        let id_text = serde_json::to_string(request_id)?;
        let conn = self.lock()?;
        let changed = conn
            .execute(
                "DELETE FROM pending_requests WHERE session_id = ?1 AND request_id = ?2",
                params![session_id, id_text],
            )
            .map_err(|e| Error::Storage(format!("failed to delete pending request: {e}")))?;
        Ok(changed > 0)
    }

    /// All unresolved requests for a session, oldest first.
    pub fn list_pending(&self, session_id: &str) -> Result<Vec<PendingPermission>> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare(
                "SELECT request_id, kind, payload, created_at FROM pending_requests
                 WHERE session_id = ?1 ORDER BY created_at ASC, request_id ASC",
            )
            .map_err(|e| Error::Storage(format!("failed to prepare query: {e}")))?;

        let raw = stmt
            .query_map(params![session_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, i64>(3)?,
                ))
            })
            .map_err(|e| Error::Storage(format!("failed to query pending requests: {e}")))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| Error::Storage(format!("failed to read pending requests: {e}")))?;

        let mut pending = Vec::with_capacity(raw.len());
        for (id_text, kind, payload, created_at) in raw {
            pending.push(PendingPermission {
                session_id: session_id.to_string(),
                request_id: serde_json::from_str(&id_text)?,
                kind,
                payload: serde_json::from_str(&payload)?,
                created_at: created_at as u64,
            });
        }
        Ok(pending)
    }

    /// Drop every pending request for a session (terminal-state cleanup).
    pub fn clear_pending(&self, session_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM pending_requests WHERE session_id = ?1",
            params![session_id],
        )
        .map_err(|e| Error::Storage(format!("failed to clear pending requests: {e}")))?;
        Ok(())
    }
}

type RawSession = (
    String,
    String,
    String,
    String,
    Option<String>,
    String,
    Option<String>,
    bool,
    i64,
    i64,
);

fn row_to_raw_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawSession> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
    ))
}

fn raw_to_session(raw: RawSession) -> Result<SessionRecord> {
    let (session_id, agent_type, cwd, title, agent_session_id, status, exit_reason, archived, created_at, updated_at) =
        raw;
    let status = SessionStatus::parse(&status)
        .ok_or_else(|| Error::Storage(format!("invalid status {status:?} for {session_id}")))?;
    Ok(SessionRecord {
        session_id,
        agent_type,
        cwd,
        title,
        agent_session_id,
        status,
        exit_reason,
        archived,
        created_at: created_at as u64,
        updated_at: updated_at as u64,
    })
}

/// Current time in milliseconds since UNIX epoch
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn make_store() -> EventStore {
        EventStore::open_in_memory().unwrap()
    }

    #[test]
    fn create_and_get_session() {
        let store = make_store();
        let record = store
            .create_session("s1", "claude", "/tmp", "hello")
            .unwrap();
        assert_eq!(record.status, SessionStatus::Initializing);

        let fetched = store.get_session("s1").unwrap().unwrap();
        assert_eq!(fetched.title, "hello");
        assert!(fetched.agent_session_id.is_none());
        assert!(!fetched.archived);
    }

    #[test]
    fn get_session_unknown() {
        let store = make_store();
        assert!(store.get_session("nope").unwrap().is_none());
    }

    #[test]
    fn seq_is_contiguous_from_one() {
        let store = make_store();
        store.create_session("s1", "a", "/tmp", "t").unwrap();

        for i in 1..=5u64 {
            let event = store
                .append_event("s1", "agent_message_chunk", &json!({"n": i}))
                .unwrap();
            assert_eq!(event.seq, i);
        }

        let events = store.list_events("s1", None).unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3, 4, 5]);
        assert_eq!(store.last_seq("s1").unwrap(), 5);
    }

    #[test]
    fn seq_is_per_session() {
        let store = make_store();
        store.create_session("s1", "a", "/tmp", "t").unwrap();
        store.create_session("s2", "a", "/tmp", "t").unwrap();

        assert_eq!(store.append_event("s1", "x", &json!({})).unwrap().seq, 1);
        assert_eq!(store.append_event("s2", "x", &json!({})).unwrap().seq, 1);
        assert_eq!(store.append_event("s1", "x", &json!({})).unwrap().seq, 2);
    }

    #[test]
    fn append_then_read_returns_it_last() {
        let store = make_store();
        store.create_session("s1", "a", "/tmp", "t").unwrap();
        store.append_event("s1", "a", &json!({"first": true})).unwrap();

        let before = store.last_seq("s1").unwrap();
        let appended = store
            .append_event("s1", "b", &json!({"second": true}))
            .unwrap();

        let events = store.list_events("s1", Some(before)).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].seq, appended.seq);
        assert_eq!(events[0].payload, json!({"second": true}));
    }

    #[test]
    fn list_events_since_filters_exactly() {
        let store = make_store();
        store.create_session("s1", "a", "/tmp", "t").unwrap();
        for i in 1..=4 {
            store.append_event("s1", "x", &json!({"n": i})).unwrap();
        }

        let events = store.list_events("s1", Some(2)).unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![3, 4]);
    }

    #[test]
    fn concurrent_appends_never_share_a_seq() {
        let store = std::sync::Arc::new(make_store());
        store.create_session("s1", "a", "/tmp", "t").unwrap();

        let mut handles = Vec::new();
        for t in 0..4 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..25 {
                    store
                        .append_event("s1", "x", &json!({"t": t, "i": i}))
                        .unwrap();
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let events = store.list_events("s1", None).unwrap();
        let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, (1..=100).collect::<Vec<u64>>());
    }

    #[test]
    fn crash_and_recover_preserves_acknowledged_events() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bridge.db");

        {
            let store = EventStore::open(&path).unwrap();
            store.create_session("s1", "a", "/tmp", "t").unwrap();
            store.append_event("s1", "x", &json!({"n": 1})).unwrap();
            store.append_event("s1", "x", &json!({"n": 2})).unwrap();
        }

        let store = EventStore::open(&path).unwrap();
        let events = store.list_events("s1", None).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].payload, json!({"n": 2}));
        assert_eq!(store.append_event("s1", "x", &json!({})).unwrap().seq, 3);
    }

    #[test]
    fn agent_session_id_is_immutable() {
        let store = make_store();
        store.create_session("s1", "a", "/tmp", "t").unwrap();

        store.set_agent_session_id("s1", "agent-1").unwrap();
        // Idempotent with the same value
        store.set_agent_session_id("s1", "agent-1").unwrap();
        // Rejected with a different one
        assert!(store.set_agent_session_id("s1", "agent-2").is_err());

        let record = store.get_session("s1").unwrap().unwrap();
        assert_eq!(record.agent_session_id.as_deref(), Some("agent-1"));
    }

    #[test]
    fn status_and_terminal_updates() {
        let store = make_store();
        store.create_session("s1", "a", "/tmp", "t").unwrap();

        store.set_status("s1", SessionStatus::Running).unwrap();
        assert_eq!(
            store.get_session("s1").unwrap().unwrap().status,
            SessionStatus::Running
        );

        store
            .set_terminal("s1", SessionStatus::Exited, Some("process_exit"))
            .unwrap();
        let record = store.get_session("s1").unwrap().unwrap();
        assert_eq!(record.status, SessionStatus::Exited);
        assert_eq!(record.exit_reason.as_deref(), Some("process_exit"));

        assert!(matches!(
            store.set_status("nope", SessionStatus::Running),
            Err(Error::NotFound(_))
        ));
    }

    #[test]
    fn list_sessions_filters() {
        let store = make_store();
        store.create_session("s1", "a", "/tmp", "t").unwrap();
        store.create_session("s2", "a", "/tmp", "t").unwrap();
        store.create_session("s3", "a", "/tmp", "t").unwrap();
        store.set_status("s2", SessionStatus::Running).unwrap();
        store.archive("s3").unwrap();

        let all = store.list_sessions(&SessionFilter::default()).unwrap();
        assert_eq!(all.len(), 3);

        let unarchived = store
            .list_sessions(&SessionFilter {
                archived: Some(false),
                statuses: None,
            })
            .unwrap();
        assert_eq!(unarchived.len(), 2);

        let running = store
            .list_sessions(&SessionFilter {
                archived: None,
                statuses: Some(vec![SessionStatus::Running]),
            })
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].session_id, "s2");
    }

    #[test]
    fn pending_unique_per_request_id() {
        let store = make_store();
        store.create_session("s1", "a", "/tmp", "t").unwrap();

        let id = RequestId::Num(7);
        store
            .add_pending("s1", &id, "session/request_permission", &json!({"x": 1}))
            .unwrap();
        assert!(store
            .add_pending("s1", &id, "session/request_permission", &json!({"x": 2}))
            .is_err());

        // Number and string ids are distinct keys
        store
            .add_pending(
                "s1",
                &RequestId::Str("7".into()),
                "session/request_permission",
                &json!({}),
            )
            .unwrap();

        let pending = store.list_pending("s1").unwrap();
        assert_eq!(pending.len(), 2);
        assert!(pending.iter().any(|p| p.request_id == RequestId::Num(7)));
        assert!(pending
            .iter()
            .any(|p| p.request_id == RequestId::Str("7".into())));
    }

    #[test]
    fn pending_delete_and_clear() {
        let store = make_store();
        store.create_session("s1", "a", "/tmp", "t").unwrap();

        let id = RequestId::Num(1);
        store.add_pending("s1", &id, "k", &json!({})).unwrap();
        assert!(store.delete_pending("s1", &id).unwrap());
        assert!(!store.delete_pending("s1", &id).unwrap());

        store.add_pending("s1", &RequestId::Num(2), "k", &json!({})).unwrap();
        store.add_pending("s1", &RequestId::Num(3), "k", &json!({})).unwrap();
        store.clear_pending("s1").unwrap();
        assert!(store.list_pending("s1").unwrap().is_empty());
    }

    #[test]
    fn payload_preserved_byte_for_byte() {
        let store = make_store();
        store.create_session("s1", "a", "/tmp", "t").unwrap();

        let payload = json!({
            "sessionUpdate": "tool_call",
            "toolCallId": "t1",
            "nested": {"a": [1, 2, 3], "b": null, "c": "ünïcode"}
        });
        store.append_event("s1", "tool_call", &payload).unwrap();

        let events = store.list_events("s1", None).unwrap();
        assert_eq!(events[0].payload, payload);
    }
}
