//! Per-session state machine and orchestration
//!
//! One `SessionCore` owns every session in the process. Per session it
//! coordinates: the agent subprocess (spawn, handshake, frame pump, exit),
//! the durable event log, the correlation registry, and fan-out to
//! subscribed clients.
//!
//! Status flow: `initializing → running ⇄ waiting`, ending in `completed`
//! (client cancel), `error` (handshake/protocol failure), or `exited`
//! (subprocess gone). Terminal states never hold an agent subprocess.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch, RwLock};
use uuid::Uuid;

use crate::agent::{self, AgentHandle, ExitInfo};
use crate::broker::{Broker, ClientSender};
use crate::config::BridgeConfig;
use crate::error::{Error, Result};
use crate::events::store::now_millis;
use crate::events::{EventRecord, EventStore, SessionFilter, SessionStatus};
use crate::protocol::{self, RequestId, RpcFrame};
use crate::session::registry::RequestRegistry;

/// Grace period between forwarding `session/cancel` and killing the group,
/// so the agent can flush a final few updates.
const CANCEL_KILL_GRACE: Duration = Duration::from_secs(2);

/// The connection a client request arrived on.
#[derive(Clone)]
pub struct ClientCtx {
    pub conn_id: String,
    pub sender: ClientSender,
}

struct ActiveAgent {
    handle: Arc<AgentHandle>,
    /// Populated when the handshake records the agent's own session id.
    agent_session_id: watch::Receiver<Option<String>>,
}

/// Owns session lifecycles and brokers between clients and agents.
pub struct SessionCore {
    config: BridgeConfig,
    store: Arc<EventStore>,
    registry: Arc<RequestRegistry>,
    broker: Arc<Broker>,
    /// One live agent per session while status is non-terminal.
    active: RwLock<HashMap<String, ActiveAgent>>,
}

impl SessionCore {
    pub fn new(
        config: BridgeConfig,
        store: Arc<EventStore>,
        registry: Arc<RequestRegistry>,
        broker: Arc<Broker>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            broker,
            active: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<EventStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<RequestRegistry> {
        &self.registry
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    // =========================================================================
    // Client-facing operations
    // =========================================================================

    /// `session/new`: spawn an agent, start the handshake, subscribe the
    /// creator. Returns as soon as the subprocess is up; the handshake
    /// completes (or fails) asynchronously.
    pub async fn create_session(
        self: &Arc<Self>,
        agent_type: Option<String>,
        cwd: Option<String>,
        title: Option<String>,
        ctx: &ClientCtx,
    ) -> Result<Value> {
        let session_id = new_session_id();
        let agent_type = agent_type.unwrap_or_else(|| "default".to_string());
        let cwd = cwd.unwrap_or_else(|| self.config.default_cwd.to_string_lossy().into_owned());
        let title = title.unwrap_or_else(|| "New session".to_string());

        self.store
            .create_session(&session_id, &agent_type, &cwd, &title)?;

        let spawned = match agent::spawn(&self.config.agent_command, Path::new(&cwd), &[]) {
            Ok(spawned) => spawned,
            Err(e) => {
                tracing::warn!(%session_id, "Agent spawn failed: {e}");
                let _ = self
                    .store
                    .set_terminal(&session_id, SessionStatus::Error, Some("spawn_failed"));
                return Err(e);
            }
        };

        let (sid_tx, sid_rx) = watch::channel(None);
        self.active.write().await.insert(
            session_id.clone(),
            ActiveAgent {
                handle: spawned.handle.clone(),
                agent_session_id: sid_rx,
            },
        );
        self.broker
            .subscribe(&session_id, &ctx.conn_id, ctx.sender.clone());

        let core = Arc::clone(self);
        let pump_session = session_id.clone();
        tokio::spawn(async move {
            core.run_agent_pump(pump_session, spawned.frames, spawned.exit)
                .await;
        });

        let core = Arc::clone(self);
        let hs_session = session_id.clone();
        let handle = spawned.handle;
        tokio::spawn(async move {
            core.run_handshake(hs_session, handle, cwd, sid_tx).await;
        });

        tracing::info!(%session_id, %agent_type, "Session created");
        Ok(json!({ "sessionId": session_id }))
    }

    /// `session/list`
    pub fn list_sessions(
        &self,
        archived: Option<bool>,
        statuses: Option<Vec<String>>,
    ) -> Result<Value> {
        let statuses = match statuses {
            None => None,
            Some(names) => {
                let mut parsed = Vec::with_capacity(names.len());
                for name in &names {
                    parsed.push(SessionStatus::parse(name).ok_or_else(|| {
                        Error::InvalidRequest(format!("unknown status {name:?}"))
                    })?);
                }
                Some(parsed)
            }
        };
        let sessions = self
            .store
            .list_sessions(&SessionFilter { archived, statuses })?;
        Ok(json!({ "sessions": sessions }))
    }

    /// `session/get` (and its `session/sync` alias): session row, event
    /// replay from `since`, open permissions. Subscribes the caller unless
    /// the session is archived.
    pub async fn get_session(
        &self,
        session_id: &str,
        since: Option<u64>,
        ctx: &ClientCtx,
    ) -> Result<Value> {
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| Error::NotFound(format!("unknown session {session_id}")))?;
        let updates = self.store.list_events(session_id, since)?;
        let pending = self.store.list_pending(session_id)?;

        if !session.archived {
            self.broker
                .subscribe(session_id, &ctx.conn_id, ctx.sender.clone());
        }

        Ok(json!({
            "session": session,
            "updates": updates.iter().map(update_wire).collect::<Vec<_>>(),
            "pendingRequests": pending,
        }))
    }

    /// `session/prompt`: record the user turn, forward to the agent under a
    /// bridge-scoped id, ack immediately. May suspend until the handshake
    /// has produced the agent's session id, bounded by the handshake
    /// timeout.
    pub async fn prompt(
        self: &Arc<Self>,
        session_id: &str,
        prompt: Value,
        ctx: &ClientCtx,
    ) -> Result<Value> {
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| Error::NotFound(format!("unknown session {session_id}")))?;
        if session.archived {
            return Err(Error::InvalidRequest(format!(
                "session {session_id} is archived"
            )));
        }
        if session.status.is_terminal() {
            return Err(Error::InvalidRequest(format!(
                "session {session_id} is {}",
                session.status
            )));
        }
        if session.status == SessionStatus::Waiting {
            return Err(Error::InvalidRequest(format!(
                "session {session_id} has a pending permission request"
            )));
        }

        self.broker
            .subscribe(session_id, &ctx.conn_id, ctx.sender.clone());

        let (handle, mut sid_rx) = {
            let active = self.active.read().await;
            let agent = active.get(session_id).ok_or_else(|| {
                Error::SessionTerminated(format!("session {session_id} has no live agent"))
            })?;
            (agent.handle.clone(), agent.agent_session_id.clone())
        };

        let agent_session_id = match tokio::time::timeout(
            self.config.handshake_timeout(),
            sid_rx.wait_for(|v| v.is_some()),
        )
        .await
        {
            Ok(Ok(guard)) => guard
                .clone()
                .ok_or_else(|| Error::Internal("empty agent session id".to_string()))?,
            Ok(Err(_)) => {
                return Err(Error::SessionTerminated(format!(
                    "session {session_id} terminated before the handshake finished"
                )))
            }
            Err(_) => {
                // The wait elapsed with the handshake still pending
                return Err(Error::NotReady(format!(
                    "session {session_id} has not completed its handshake"
                )))
            }
        };

        // Record the user turn so reconnecting clients replay it too.
        let blocks = match prompt.as_array() {
            Some(blocks) => blocks.clone(),
            None => vec![prompt.clone()],
        };
        let mut appended = Vec::with_capacity(blocks.len());
        for block in &blocks {
            let payload = json!({ "sessionUpdate": "user_message_chunk", "content": block });
            appended.push(
                self.store
                    .append_event(session_id, "user_message_chunk", &payload)?,
            );
        }
        self.publish_events(session_id, &appended);

        let (bridge_id, reply_rx) = self.registry.register_client(session_id, &ctx.conn_id);
        let frame = protocol::request(
            &RequestId::Num(bridge_id),
            "session/prompt",
            json!({ "sessionId": agent_session_id, "prompt": prompt }),
        );
        if let Err(e) = handle.send(&frame).await {
            self.registry.remove(bridge_id);
            self.handle_agent_exit(session_id, "io_error", None).await;
            return Err(e);
        }

        // Immediate ack; the stop reason is consumed by a detached watcher
        // so the registry entry cannot linger past its deadline or the
        // session's terminal state.
        let watch_session = session_id.to_string();
        let registry = self.registry.clone();
        let deadline = self.config.agent_reply_timeout();
        tokio::spawn(async move {
            match tokio::time::timeout(deadline, reply_rx).await {
                Ok(Ok(Ok(result))) => tracing::debug!(
                    session_id = %watch_session,
                    stop_reason = ?result.get("stopReason"),
                    "Prompt turn finished"
                ),
                Ok(Ok(Err(e))) => {
                    tracing::debug!(session_id = %watch_session, "Prompt resolved with error: {e}")
                }
                Ok(Err(_)) => {}
                Err(_) => {
                    registry.remove(bridge_id);
                    tracing::warn!(session_id = %watch_session, "Agent never replied to prompt");
                }
            }
        });

        Ok(json!({ "success": true }))
    }

    /// `session/respond`: resolve a pending permission and forward the
    /// client's answer to the agent under the agent's original id.
    pub async fn respond(
        &self,
        session_id: &str,
        request_id: &Value,
        response: Value,
    ) -> Result<Value> {
        let rid = RequestId::from_value(request_id)
            .ok_or_else(|| Error::InvalidRequest("requestId must be a number or string".into()))?;
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| Error::NotFound(format!("unknown session {session_id}")))?;

        let parked = self
            .registry
            .take_agent_request(session_id, &rid)
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no pending request {rid} for session {session_id}"
                ))
            })?;

        let handle = self.agent_handle(session_id).await.ok_or_else(|| {
            Error::SessionTerminated(format!("session {session_id} has no live agent"))
        })?;

        // Echo the agent's id exactly as it arrived (42 stays 42, "r1" stays "r1").
        let original_id = serde_json::to_value(&parked.request_id)?;
        if let Err(e) = handle
            .send(&protocol::response(&original_id, response))
            .await
        {
            self.handle_agent_exit(session_id, "io_error", None).await;
            return Err(e);
        }

        let _ = self.store.delete_pending(session_id, &parked.request_id);
        if session.status == SessionStatus::Waiting && self.store.list_pending(session_id)?.is_empty()
        {
            self.store.set_status(session_id, SessionStatus::Running)?;
            self.publish_status(session_id, SessionStatus::Running, None);
        }

        tracing::info!(session_id, request_id = %parked.request_id, "Permission resolved");
        Ok(json!({ "success": true }))
    }

    /// A raw JSON-RPC reply from a client (id + result, no method): find the
    /// session that parked the matching agent request and resolve it.
    pub async fn client_reply(&self, id: &Value, result: Value) -> Result<Value> {
        let rid = RequestId::from_value(id)
            .ok_or_else(|| Error::InvalidRequest("reply id must be a number or string".into()))?;
        let session_id = self
            .registry
            .find_agent_request(&rid)
            .ok_or_else(|| Error::NotFound(format!("no pending request with id {rid}")))?;
        self.respond(&session_id, id, result).await
    }

    /// `session/cancel`: notify the agent, mark the session completed, and
    /// release everything waiting on it. The subprocess gets a short grace
    /// period to flush final updates before its group is killed.
    pub async fn cancel(&self, session_id: &str) -> Result<Value> {
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| Error::NotFound(format!("unknown session {session_id}")))?;
        if session.status.is_terminal() {
            return Err(Error::InvalidRequest(format!(
                "session {session_id} is already {}",
                session.status
            )));
        }

        let agent = self.active.write().await.remove(session_id);
        if let Some(agent) = agent {
            let target = session
                .agent_session_id
                .clone()
                .unwrap_or_else(|| session_id.to_string());
            let _ = agent
                .handle
                .send(&protocol::notification(
                    "session/cancel",
                    json!({ "sessionId": target }),
                ))
                .await;
            let handle = agent.handle;
            tokio::spawn(async move {
                tokio::time::sleep(CANCEL_KILL_GRACE).await;
                handle.kill();
            });
        }

        self.store
            .set_terminal(session_id, SessionStatus::Completed, None)?;
        self.publish_status(session_id, SessionStatus::Completed, None);
        self.store.clear_pending(session_id)?;
        self.registry.fail_session(session_id);

        tracing::info!(session_id, "Session cancelled");
        Ok(json!({ "success": true }))
    }

    /// `session/archive`: soft-delete. A live session is torn down first so
    /// no agent subprocess outlives archival; all subscribers are dropped
    /// and no new implicit subscriptions are accepted.
    pub async fn archive(&self, session_id: &str) -> Result<Value> {
        let session = self
            .store
            .get_session(session_id)?
            .ok_or_else(|| Error::NotFound(format!("unknown session {session_id}")))?;

        if !session.status.is_terminal() {
            let agent = self.active.write().await.remove(session_id);
            if let Some(agent) = agent {
                let target = session
                    .agent_session_id
                    .clone()
                    .unwrap_or_else(|| session_id.to_string());
                let _ = agent
                    .handle
                    .send(&protocol::notification(
                        "session/cancel",
                        json!({ "sessionId": target }),
                    ))
                    .await;
                agent.handle.kill();
            }
            self.store
                .set_terminal(session_id, SessionStatus::Completed, None)?;
            self.store.clear_pending(session_id)?;
            self.registry.fail_session(session_id);
        }

        self.store.archive(session_id)?;
        self.broker.remove_session(session_id);

        tracing::info!(session_id, "Session archived");
        Ok(json!({ "success": true }))
    }

    /// `session/set_title`
    pub fn set_title(&self, session_id: &str, title: &str) -> Result<Value> {
        self.store.set_title(session_id, title)?;
        self.broker.publish(
            session_id,
            &protocol::notification(
                "session/title_changed",
                json!({ "sessionId": session_id, "title": title }),
            ),
        );
        Ok(json!({ "success": true }))
    }

    /// A WebSocket closed: drop its subscriptions and fail its in-flight
    /// requests with `client_gone`.
    pub fn client_disconnected(&self, conn_id: &str) {
        self.broker.drop_connection(conn_id);
        self.registry.fail_client(conn_id);
    }

    /// Kill every live agent (bridge shutdown).
    pub async fn shutdown(&self) {
        let mut active = self.active.write().await;
        for (session_id, agent) in active.drain() {
            tracing::info!(%session_id, "Killing agent on shutdown");
            agent.handle.kill();
        }
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    async fn run_handshake(
        self: Arc<Self>,
        session_id: String,
        handle: Arc<AgentHandle>,
        cwd: String,
        sid_tx: watch::Sender<Option<String>>,
    ) {
        match self.handshake_steps(&session_id, &handle, &cwd).await {
            Ok(agent_session_id) => {
                if let Err(e) = self.finish_handshake(&session_id, &agent_session_id) {
                    tracing::warn!(%session_id, "Failed to record handshake result: {e}");
                    return;
                }
                let _ = sid_tx.send(Some(agent_session_id));
            }
            Err(e) => {
                tracing::warn!(%session_id, "Handshake failed: {e}");
                handle.kill();
                self.fail_session(&session_id, &e.to_string()).await;
            }
        }
    }

    /// Run the two handshake steps, exactly once, in order. One attempt;
    /// any timeout or error reply fails the session.
    async fn handshake_steps(
        &self,
        session_id: &str,
        handle: &AgentHandle,
        cwd: &str,
    ) -> Result<String> {
        self.handshake_request(
            session_id,
            handle,
            "initialize",
            json!({ "protocolVersion": 1, "capabilities": {} }),
        )
        .await?;

        let created = self
            .handshake_request(
                session_id,
                handle,
                "session/new",
                json!({ "cwd": cwd, "mcpServers": [] }),
            )
            .await?;

        created
            .get("sessionId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| Error::Parse("agent session/new reply carried no sessionId".into()))
    }

    async fn handshake_request(
        &self,
        session_id: &str,
        handle: &AgentHandle,
        method: &str,
        params: Value,
    ) -> Result<Value> {
        let (id, rx) = self.registry.register_handshake(session_id);
        if let Err(e) = handle
            .send(&protocol::request(&RequestId::Num(id), method, params))
            .await
        {
            self.registry.remove(id);
            return Err(e);
        }

        match tokio::time::timeout(self.config.handshake_timeout(), rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(Error::SessionTerminated(format!(
                "session {session_id} terminated during {method}"
            ))),
            Err(_) => {
                self.registry.remove(id);
                Err(Error::Timeout(format!("{method} timed out")))
            }
        }
    }

    fn finish_handshake(&self, session_id: &str, agent_session_id: &str) -> Result<()> {
        self.store
            .set_agent_session_id(session_id, agent_session_id)?;
        self.store.set_status(session_id, SessionStatus::Running)?;
        let event = self.store.append_event(
            session_id,
            "status_changed",
            &json!({ "sessionUpdate": "status_changed", "status": "running" }),
        )?;
        self.publish_events(session_id, std::slice::from_ref(&event));
        self.publish_status(session_id, SessionStatus::Running, None);
        tracing::info!(session_id, agent_session_id, "Handshake complete");
        Ok(())
    }

    // =========================================================================
    // Agent frame pump
    // =========================================================================

    async fn run_agent_pump(
        self: Arc<Self>,
        session_id: String,
        mut frames: mpsc::UnboundedReceiver<Value>,
        exit: oneshot::Receiver<ExitInfo>,
    ) {
        while let Some(frame) = frames.recv().await {
            self.handle_agent_frame(&session_id, frame).await;
        }

        // Stdout closed: the subprocess exited or its pipe broke.
        let code = match tokio::time::timeout(Duration::from_secs(5), exit).await {
            Ok(Ok(info)) => info.code,
            _ => None,
        };
        self.handle_agent_exit(&session_id, "process_exit", code)
            .await;
    }

    async fn handle_agent_frame(&self, session_id: &str, frame: Value) {
        let parsed: RpcFrame = match serde_json::from_value(frame) {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!(session_id, "Unintelligible agent frame: {e}");
                return;
            }
        };

        if parsed.is_reply() {
            let rid = parsed.request_id();
            let outcome = match parsed.error {
                Some(err) => Err(Error::Internal(format!("agent error reply: {err}"))),
                None => Ok(parsed.result.unwrap_or(Value::Null)),
            };
            match rid {
                Some(RequestId::Num(id)) => {
                    if !self.registry.resolve(id, outcome) {
                        tracing::debug!(session_id, id, "Reply for unknown or expired request");
                    }
                }
                other => tracing::debug!(session_id, ?other, "Reply with foreign id, ignoring"),
            }
            return;
        }

        match parsed.method.as_deref() {
            Some("session/update") => {
                self.handle_agent_update(session_id, parsed.params.unwrap_or(Value::Null));
            }
            Some("session/request_permission") => match parsed.request_id() {
                Some(rid) => {
                    self.handle_permission_request(
                        session_id,
                        rid,
                        parsed.params.unwrap_or(Value::Null),
                    )
                    .await;
                }
                None => tracing::warn!(session_id, "Permission request without a usable id"),
            },
            Some(method) => {
                if let Some(id) = parsed.id {
                    // Unsupported request: answer so the agent is not left hanging.
                    if let Some(handle) = self.agent_handle(session_id).await {
                        let _ = handle
                            .send(&protocol::error_response(
                                &id,
                                protocol::METHOD_NOT_FOUND,
                                &format!("unsupported method {method}"),
                            ))
                            .await;
                    }
                } else {
                    tracing::debug!(session_id, method, "Ignoring unknown agent notification");
                }
            }
            None => tracing::debug!(session_id, "Agent frame with no method and no result"),
        }
    }

    /// `session/update` notification: append one event whose type is the
    /// update's discriminator, then fan out. The payload is stored opaquely.
    fn handle_agent_update(&self, session_id: &str, params: Value) {
        let update = params.get("update").cloned().unwrap_or(params);
        let update_type = update
            .get("sessionUpdate")
            .and_then(Value::as_str)
            .unwrap_or("update")
            .to_string();

        match self.store.append_event(session_id, &update_type, &update) {
            Ok(event) => self.publish_events(session_id, std::slice::from_ref(&event)),
            Err(e) => tracing::error!(session_id, %update_type, "Failed to append event: {e}"),
        }
    }

    async fn handle_permission_request(&self, session_id: &str, rid: RequestId, params: Value) {
        let session = match self.store.get_session(session_id) {
            Ok(Some(session)) => session,
            _ => {
                tracing::warn!(session_id, "Permission request for unknown session");
                return;
            }
        };
        if session.status.is_terminal() {
            tracing::debug!(session_id, "Ignoring permission request on terminal session");
            return;
        }

        let kind = "session/request_permission";
        if let Err(e) = self.store.add_pending(session_id, &rid, kind, &params) {
            tracing::warn!(session_id, request_id = %rid, "Dropping duplicate permission request: {e}");
            return;
        }
        self.registry
            .park_agent_request(session_id, rid.clone(), kind);

        if session.status != SessionStatus::Waiting {
            if let Err(e) = self.store.set_status(session_id, SessionStatus::Waiting) {
                tracing::warn!(session_id, "Failed to mark session waiting: {e}");
            }
            self.publish_status(session_id, SessionStatus::Waiting, None);
        }

        self.broker.publish(
            session_id,
            &protocol::notification(
                "session/request",
                json!({ "sessionId": session_id, "requestId": rid, "request": params }),
            ),
        );
        tracing::info!(session_id, request_id = %rid, "Permission requested");
    }

    // =========================================================================
    // Exit handling
    // =========================================================================

    /// Subprocess exit (or pipe failure): transition to `exited` unless the
    /// session was already terminal, then release everything waiting on it.
    async fn handle_agent_exit(&self, session_id: &str, reason: &str, code: Option<i32>) {
        self.active.write().await.remove(session_id);

        let session = match self.store.get_session(session_id) {
            Ok(Some(session)) => session,
            _ => {
                self.registry.fail_session(session_id);
                return;
            }
        };
        if session.status.is_terminal() {
            self.registry.fail_session(session_id);
            return;
        }

        tracing::info!(session_id, reason, exit_code = ?code, "Agent exited");

        if let Err(e) = self
            .store
            .set_terminal(session_id, SessionStatus::Exited, Some(reason))
        {
            tracing::warn!(session_id, "Failed to record exit: {e}");
        }

        let payload = json!({
            "sessionUpdate": "status_changed",
            "status": "exited",
            "reason": reason,
            "exitCode": code,
        });
        match self.store.append_event(session_id, "status_changed", &payload) {
            Ok(event) => self.publish_events(session_id, std::slice::from_ref(&event)),
            Err(e) => tracing::warn!(session_id, "Failed to append exit event: {e}"),
        }
        self.publish_status(session_id, SessionStatus::Exited, Some(reason));

        let _ = self.store.clear_pending(session_id);
        self.registry.fail_session(session_id);
    }

    /// Handshake/protocol failure path: terminal `error` status. A session
    /// that already reached a terminal state (a cancel or archive raced the
    /// handshake) is left untouched.
    async fn fail_session(&self, session_id: &str, reason: &str) {
        self.active.write().await.remove(session_id);

        let session = match self.store.get_session(session_id) {
            Ok(Some(session)) => session,
            _ => {
                self.registry.fail_session(session_id);
                return;
            }
        };
        if session.status.is_terminal() {
            self.registry.fail_session(session_id);
            return;
        }

        if let Err(e) = self
            .store
            .set_terminal(session_id, SessionStatus::Error, Some(reason))
        {
            tracing::warn!(session_id, "Failed to record error state: {e}");
        }
        let payload = json!({
            "sessionUpdate": "status_changed",
            "status": "error",
            "reason": reason,
        });
        match self.store.append_event(session_id, "status_changed", &payload) {
            Ok(event) => self.publish_events(session_id, std::slice::from_ref(&event)),
            Err(e) => tracing::warn!(session_id, "Failed to append error event: {e}"),
        }
        self.publish_status(session_id, SessionStatus::Error, Some(reason));

        let _ = self.store.clear_pending(session_id);
        self.registry.fail_session(session_id);
    }

    // =========================================================================
    // Internal helpers
    // =========================================================================

    async fn agent_handle(&self, session_id: &str) -> Option<Arc<AgentHandle>> {
        self.active
            .read()
            .await
            .get(session_id)
            .map(|agent| agent.handle.clone())
    }

    fn publish_events(&self, session_id: &str, events: &[EventRecord]) {
        if events.is_empty() {
            return;
        }
        self.broker.publish(
            session_id,
            &protocol::notification(
                "session/updated",
                json!({
                    "sessionId": session_id,
                    "updates": events.iter().map(update_wire).collect::<Vec<_>>(),
                }),
            ),
        );
    }

    fn publish_status(&self, session_id: &str, status: SessionStatus, exit_reason: Option<&str>) {
        let mut params = json!({ "sessionId": session_id, "status": status });
        if let Some(reason) = exit_reason {
            params["exitReason"] = json!(reason);
        }
        self.broker.publish(
            session_id,
            &protocol::notification("session/status_changed", params),
        );
    }
}

/// The wire triple clients see for one event.
fn update_wire(event: &EventRecord) -> Value {
    json!({
        "seq": event.seq,
        "updateType": event.update_type,
        "payload": event.payload,
    })
}

/// Opaque bridge-assigned session id: time plus random, unique for the
/// process lifetime.
fn new_session_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", now_millis(), &suffix[..8])
}
