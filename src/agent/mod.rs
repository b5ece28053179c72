//! Agent subprocess management
//!
//! Each session owns one agent subprocess speaking newline-delimited
//! JSON-RPC over its standard streams:
//!
//! ```text
//! SessionCore ──send──▶ child stdin   (one compact JSON object + '\n')
//! SessionCore ◀─frames── child stdout (LineBuffer → serde_json per line)
//!              ◀─exit───  wait task   (exactly one ExitInfo)
//! ```

pub mod framing;
pub mod process;

pub use framing::LineBuffer;
pub use process::{spawn, AgentHandle, ExitInfo, SpawnedAgent};
