//! acp-bridge — bridge between browser clients and local agent subprocesses
//!
//! Multiplexes many long-lived sessions, each bound to a subprocess speaking
//! a newline-delimited JSON-RPC dialect over its pipes, onto any number of
//! transient WebSocket clients; records every agent event into a durable
//! per-session ordered log; and brokers asynchronous permission requests
//! from agent back to a human.
//!
//! ## Architecture
//!
//! ```text
//! Browser ←→ WS (JSON-RPC) ←→ Gateway (axum) ←→ pipes (NDJSON-RPC) ←→ agent
//!            /ws                ├ session core                          subprocess
//!                               ├ request registry
//!                               ├ broker (pub/sub)
//!                               └ event store (SQLite, WAL)
//! ```
//!
//! ## Modules
//!
//! - [`gateway`]: WebSocket accept loop and JSON-RPC dispatch
//! - [`session`]: per-session state machine and request correlation
//! - [`agent`]: subprocess spawning and newline-delimited framing
//! - [`events`]: durable store for sessions, events, and pending permissions
//! - [`broker`]: fan-out of updates to subscribed clients
//! - [`protocol`]: JSON-RPC message model shared by both dialects
//! - [`config`]: startup configuration

pub mod agent;
pub mod broker;
pub mod config;
pub mod error;
pub mod events;
pub mod gateway;
pub mod protocol;
pub mod session;

pub use config::BridgeConfig;
pub use error::{Error, Result};
