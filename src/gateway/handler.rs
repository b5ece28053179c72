//! WebSocket handler and JSON-RPC dispatch
//!
//! One task per connection reads frames; each request runs in its own task
//! so a suspended `session/prompt` never blocks the rest of the socket.
//! Responses and notifications share the connection's outbound channel, so
//! each response lands only on the socket that asked (client-chosen ids can
//! collide across connections without interference).

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::error::Error;
use crate::protocol::{self, RpcFrame};
use crate::session::core::{ClientCtx, SessionCore};

/// Shared state for gateway handlers
#[derive(Clone)]
pub struct GatewayState {
    pub core: Arc<SessionCore>,
}

/// WebSocket upgrade handler for `/ws`
pub async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<GatewayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.core))
}

/// Per-connection loop: parse each text frame as one JSON-RPC message and
/// dispatch it. Close tears down subscriptions and in-flight requests.
async fn handle_socket(socket: WebSocket, core: Arc<SessionCore>) {
    let conn_id = uuid::Uuid::new_v4().to_string();
    tracing::info!(%conn_id, "Client connected");

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let ctx = ClientCtx {
        conn_id: conn_id.clone(),
        sender: tx,
    };

    // Writer: everything outbound (responses + notifications) funnels here
    let writer_conn = conn_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_sender.send(Message::Text(text)).await.is_err() {
                tracing::debug!(conn_id = %writer_conn, "WebSocket send failed");
                break;
            }
        }
    });

    while let Some(Ok(msg)) = ws_receiver.next().await {
        match msg {
            Message::Text(text) => {
                let core = core.clone();
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Some(response) = handle_text(&core, &ctx, &text).await {
                        send_frame(&ctx, &response);
                    }
                });
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    core.client_disconnected(&conn_id);
    writer.abort();
    tracing::info!(%conn_id, "Client disconnected");
}

/// Handle one inbound text frame; returns the response to send, if any.
async fn handle_text(core: &Arc<SessionCore>, ctx: &ClientCtx, text: &str) -> Option<Value> {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(e) => {
            return Some(protocol::error_response(
                &Value::Null,
                protocol::PARSE_ERROR,
                &format!("parse error: {e}"),
            ));
        }
    };

    let frame: RpcFrame = match serde_json::from_value(value) {
        Ok(frame) => frame,
        Err(e) => {
            return Some(protocol::error_response(
                &Value::Null,
                protocol::INVALID_REQUEST,
                &format!("invalid request: {e}"),
            ));
        }
    };

    // A reply (id + result/error, no method) is a client answering an agent
    // request directly; route it to the permission path.
    if frame.is_reply() {
        let id = frame.id.unwrap_or(Value::Null);
        let result = frame.result.unwrap_or(Value::Null);
        if let Err(e) = core.client_reply(&id, result).await {
            tracing::warn!(conn_id = %ctx.conn_id, "Unroutable client reply: {e}");
        }
        return None;
    }

    let method = match frame.method {
        Some(method) => method,
        None => {
            return frame.id.map(|id| {
                protocol::error_response(
                    &id,
                    protocol::INVALID_REQUEST,
                    "message has neither method nor result",
                )
            });
        }
    };

    let outcome = dispatch(core, ctx, &method, frame.params).await;

    // Notifications get no response, even on error
    let id = frame.id?;
    Some(match outcome {
        Ok(result) => protocol::response(&id, result),
        Err((code, message)) => protocol::error_response(&id, code, &message),
    })
}

// =============================================================================
// Method dispatch
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    archived: Option<bool>,
    status: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewParams {
    agent_type: Option<String>,
    cwd: Option<String>,
    title: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GetParams {
    session_id: String,
    since: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptParams {
    session_id: String,
    prompt: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RespondParams {
    session_id: String,
    request_id: Value,
    response: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SessionIdParams {
    session_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SetTitleParams {
    session_id: String,
    title: String,
}

fn parse_params<T: serde::de::DeserializeOwned>(
    params: Option<Value>,
) -> Result<T, (i64, String)> {
    serde_json::from_value(params.unwrap_or_else(|| json!({})))
        .map_err(|e| (protocol::INVALID_PARAMS, format!("invalid params: {e}")))
}

fn rpc_err(e: Error) -> (i64, String) {
    (e.rpc_code(), e.to_string())
}

/// Route one request to the session core.
async fn dispatch(
    core: &Arc<SessionCore>,
    ctx: &ClientCtx,
    method: &str,
    params: Option<Value>,
) -> Result<Value, (i64, String)> {
    match method {
        "session/list" => {
            let p: ListParams = parse_params(params)?;
            core.list_sessions(p.archived, p.status).map_err(rpc_err)
        }
        "session/new" => {
            let p: NewParams = parse_params(params)?;
            core.create_session(p.agent_type, p.cwd, p.title, ctx)
                .await
                .map_err(rpc_err)
        }
        // `session/sync` is accepted as an alias for `session/get`
        "session/get" | "session/sync" => {
            let p: GetParams = parse_params(params)?;
            core.get_session(&p.session_id, p.since, ctx)
                .await
                .map_err(rpc_err)
        }
        "session/prompt" => {
            let p: PromptParams = parse_params(params)?;
            core.prompt(&p.session_id, p.prompt, ctx)
                .await
                .map_err(rpc_err)
        }
        "session/respond" => {
            let p: RespondParams = parse_params(params)?;
            core.respond(&p.session_id, &p.request_id, p.response)
                .await
                .map_err(rpc_err)
        }
        "session/cancel" => {
            let p: SessionIdParams = parse_params(params)?;
            core.cancel(&p.session_id).await.map_err(rpc_err)
        }
        "session/archive" => {
            let p: SessionIdParams = parse_params(params)?;
            core.archive(&p.session_id).await.map_err(rpc_err)
        }
        "session/set_title" => {
            let p: SetTitleParams = parse_params(params)?;
            core.set_title(&p.session_id, &p.title).map_err(rpc_err)
        }
        other => Err((
            protocol::METHOD_NOT_FOUND,
            format!("unknown method {other}"),
        )),
    }
}

fn send_frame(ctx: &ClientCtx, frame: &Value) {
    match serde_json::to_string(frame) {
        Ok(text) => {
            let _ = ctx.sender.send(text);
        }
        Err(e) => tracing::warn!(conn_id = %ctx.conn_id, "Failed to serialize response: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::Broker;
    use crate::config::BridgeConfig;
    use crate::events::EventStore;
    use crate::session::registry::RequestRegistry;
    use tempfile::TempDir;

    fn make_core() -> (Arc<SessionCore>, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = BridgeConfig {
            // Never spawned in these tests, but keep it harmless
            agent_command: "cat".to_string(),
            default_cwd: dir.path().to_path_buf(),
            data_dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        let core = Arc::new(SessionCore::new(
            config,
            Arc::new(EventStore::open_in_memory().unwrap()),
            Arc::new(RequestRegistry::new()),
            Arc::new(Broker::new()),
        ));
        (core, dir)
    }

    fn make_ctx(name: &str) -> (ClientCtx, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            ClientCtx {
                conn_id: name.to_string(),
                sender: tx,
            },
            rx,
        )
    }

    #[tokio::test]
    async fn malformed_json_yields_parse_error() {
        let (core, _dir) = make_core();
        let (ctx, _rx) = make_ctx("c1");

        let resp = handle_text(&core, &ctx, "{not json").await.unwrap();
        assert_eq!(resp["error"]["code"], -32700);
        assert!(resp["id"].is_null());
    }

    #[tokio::test]
    async fn non_object_frame_is_invalid_request() {
        let (core, _dir) = make_core();
        let (ctx, _rx) = make_ctx("c1");

        let resp = handle_text(&core, &ctx, "[1,2,3]").await.unwrap();
        assert_eq!(resp["error"]["code"], -32600);
    }

    #[tokio::test]
    async fn unknown_method_yields_method_not_found() {
        let (core, _dir) = make_core();
        let (ctx, _rx) = make_ctx("c1");

        let resp = handle_text(
            &core,
            &ctx,
            r#"{"jsonrpc":"2.0","id":1,"method":"session/reboot"}"#,
        )
        .await
        .unwrap();
        assert_eq!(resp["error"]["code"], -32601);
        assert_eq!(resp["id"], 1);
    }

    #[tokio::test]
    async fn missing_required_param_yields_invalid_params() {
        let (core, _dir) = make_core();
        let (ctx, _rx) = make_ctx("c1");

        let resp = handle_text(
            &core,
            &ctx,
            r#"{"jsonrpc":"2.0","id":2,"method":"session/get","params":{}}"#,
        )
        .await
        .unwrap();
        assert_eq!(resp["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn unknown_session_yields_invalid_params_code() {
        let (core, _dir) = make_core();
        let (ctx, _rx) = make_ctx("c1");

        let resp = handle_text(
            &core,
            &ctx,
            r#"{"jsonrpc":"2.0","id":3,"method":"session/get","params":{"sessionId":"nope"}}"#,
        )
        .await
        .unwrap();
        assert_eq!(resp["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn list_on_empty_store() {
        let (core, _dir) = make_core();
        let (ctx, _rx) = make_ctx("c1");

        let resp = handle_text(
            &core,
            &ctx,
            r#"{"jsonrpc":"2.0","id":4,"method":"session/list"}"#,
        )
        .await
        .unwrap();
        assert_eq!(resp["id"], 4);
        assert_eq!(resp["result"]["sessions"], json!([]));
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let (core, _dir) = make_core();
        let (ctx, _rx) = make_ctx("c1");

        // Unknown method, but no id: still silent per JSON-RPC
        let resp = handle_text(
            &core,
            &ctx,
            r#"{"jsonrpc":"2.0","method":"session/reboot"}"#,
        )
        .await;
        assert!(resp.is_none());
    }

    #[tokio::test]
    async fn same_client_id_on_two_connections_stays_separate() {
        let (core, _dir) = make_core();
        let (ctx_a, _rx_a) = make_ctx("conn-a");
        let (ctx_b, _rx_b) = make_ctx("conn-b");

        // Both clients picked id 42; each gets its own response on its own
        // channel because routing is per-connection by construction.
        let frame = r#"{"jsonrpc":"2.0","id":42,"method":"session/list"}"#;
        let resp_a = handle_text(&core, &ctx_a, frame).await.unwrap();
        let resp_b = handle_text(&core, &ctx_b, frame).await.unwrap();
        assert_eq!(resp_a["id"], 42);
        assert_eq!(resp_b["id"], 42);
        assert!(resp_a.get("result").is_some());
        assert!(resp_b.get("result").is_some());
    }

    #[tokio::test]
    async fn string_request_id_echoed_verbatim() {
        let (core, _dir) = make_core();
        let (ctx, _rx) = make_ctx("c1");

        let resp = handle_text(
            &core,
            &ctx,
            r#"{"jsonrpc":"2.0","id":"req-7","method":"session/list"}"#,
        )
        .await
        .unwrap();
        assert_eq!(resp["id"], "req-7");
    }

    #[tokio::test]
    async fn raw_reply_with_no_pending_request_is_swallowed() {
        let (core, _dir) = make_core();
        let (ctx, _rx) = make_ctx("c1");

        let resp = handle_text(
            &core,
            &ctx,
            r#"{"jsonrpc":"2.0","id":9001,"result":{"outcome":{"outcome":"cancelled"}}}"#,
        )
        .await;
        assert!(resp.is_none());
    }
}
