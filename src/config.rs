//! Bridge configuration management
//!
//! Configuration is read once at startup: built-in defaults, then an
//! optional TOML file, then the environment (`PORT`, `HOST`, `AGENT_COMMAND`,
//! `DEFAULT_CWD`, `STATIC_DIR`). The durable store lives under
//! `<home>/.acp-client/`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

/// Main bridge configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Host to bind to
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Shell command that starts an agent subprocess
    pub agent_command: String,

    /// Working directory for sessions that do not specify one
    pub default_cwd: PathBuf,

    /// Directory of static UI files served at `/`
    pub static_dir: PathBuf,

    /// Directory holding the durable store
    pub data_dir: PathBuf,

    /// Handshake step timeout in milliseconds
    pub handshake_timeout_ms: u64,

    /// Deadline for an agent's reply to a forwarded request, in milliseconds
    pub agent_reply_timeout_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 3001,
            agent_command: "claude-code-acp".to_string(),
            default_cwd: std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/tmp")),
            static_dir: PathBuf::from("public"),
            data_dir: default_data_dir(),
            handshake_timeout_ms: 60_000,
            agent_reply_timeout_ms: 600_000,
        }
    }
}

impl BridgeConfig {
    /// Load configuration: defaults, then the optional TOML file at `path`,
    /// then environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .map_err(|e| Error::Config(format!("failed to read {}: {}", p.display(), e)))?;
                toml::from_str(&content)
                    .map_err(|e| Error::Config(format!("failed to parse {}: {}", p.display(), e)))?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Apply environment variable overrides in place.
    pub fn apply_env(&mut self) {
        if let Ok(host) = std::env::var("HOST") {
            self.host = host;
        }
        if let Ok(port) = std::env::var("PORT") {
            match port.parse() {
                Ok(p) => self.port = p,
                Err(_) => tracing::warn!(%port, "Ignoring unparseable PORT"),
            }
        }
        if let Ok(cmd) = std::env::var("AGENT_COMMAND") {
            self.agent_command = cmd;
        }
        if let Ok(cwd) = std::env::var("DEFAULT_CWD") {
            self.default_cwd = PathBuf::from(cwd);
        }
        if let Ok(dir) = std::env::var("STATIC_DIR") {
            self.static_dir = PathBuf::from(dir);
        }
    }

    /// Path of the SQLite database file.
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("bridge.db")
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    pub fn agent_reply_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_reply_timeout_ms)
    }
}

/// Default data directory (`<home>/.acp-client/`)
pub fn default_data_dir() -> PathBuf {
    dirs_next::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".acp-client")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.port, 3001);
        assert_eq!(config.agent_command, "claude-code-acp");
        assert_eq!(config.handshake_timeout(), Duration::from_secs(60));
        assert!(config.db_path().ends_with("bridge.db"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: BridgeConfig = toml::from_str("port = 9000\n").unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "127.0.0.1");
    }

    #[test]
    fn data_dir_under_home() {
        let dir = default_data_dir();
        assert!(dir.ends_with(".acp-client"));
    }
}
