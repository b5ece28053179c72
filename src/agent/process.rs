//! Agent subprocess lifecycle
//!
//! Spawns the configured agent command through a shell (so PATH resolution
//! and version managers behave as in an interactive environment), wires its
//! pipes, and exposes a send-one-frame operation, a parsed-frame stream, and
//! an exactly-once exit signal.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

use crate::agent::framing::LineBuffer;
use crate::error::{Error, Result};

/// How the subprocess ended.
#[derive(Debug, Clone, Copy)]
pub struct ExitInfo {
    pub code: Option<i32>,
}

/// A live agent subprocess: serialized stdin writes and process-group kill.
pub struct AgentHandle {
    pid: u32,
    stdin: Mutex<ChildStdin>,
}

/// Everything `spawn` hands back: the shared handle, the parsed-frame
/// stream (closed on stdout EOF), and the exit signal.
pub struct SpawnedAgent {
    pub handle: Arc<AgentHandle>,
    pub frames: mpsc::UnboundedReceiver<Value>,
    pub exit: oneshot::Receiver<ExitInfo>,
}

/// Spawn `command` via `/bin/sh -c` in its own process group.
///
/// Stdio is piped; stderr is drained to diagnostic logs only. A reader task
/// assembles newline-delimited frames from stdout and drops lines that are
/// not valid JSON. The exit signal fires exactly once, whatever the cause.
pub fn spawn(command: &str, cwd: &Path, env: &[(String, String)]) -> Result<SpawnedAgent> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c")
        .arg(command)
        .current_dir(cwd)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .kill_on_drop(true);

    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::SpawnFailed(format!("failed to spawn {command:?}: {e}")))?;

    let pid = child
        .id()
        .ok_or_else(|| Error::SpawnFailed("child exited before pid was read".to_string()))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::SpawnFailed("child stdin not captured".to_string()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::SpawnFailed("child stdout not captured".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::SpawnFailed("child stderr not captured".to_string()))?;

    tracing::info!(pid, command, "Spawned agent subprocess");

    // Frame reader: stdout bytes → lines → parsed JSON values
    let (frames_tx, frames_rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut stdout = stdout;
        let mut buf = [0u8; 8192];
        let mut lines = LineBuffer::new();
        loop {
            match stdout.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in lines.feed(&buf[..n]) {
                        match serde_json::from_str::<Value>(&line) {
                            Ok(frame) => {
                                if frames_tx.send(frame).is_err() {
                                    return;
                                }
                            }
                            Err(e) => {
                                let preview = &line[..line.len().min(200)];
                                tracing::warn!(pid, "Dropping invalid agent frame: {e} (raw: {preview})");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(pid, "Agent stdout read failed: {e}");
                    break;
                }
            }
        }
    });

    // Stderr drain: diagnostic logging only, not part of the protocol
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(pid, "agent stderr: {line}");
        }
    });

    // Exit monitor: owns the child, fires once
    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::spawn(async move {
        let info = match child.wait().await {
            Ok(status) => ExitInfo {
                code: status.code(),
            },
            Err(e) => {
                tracing::warn!(pid, "Agent wait failed: {e}");
                ExitInfo { code: None }
            }
        };
        tracing::info!(pid, exit_code = ?info.code, "Agent subprocess exited");
        let _ = exit_tx.send(info);
    });

    Ok(SpawnedAgent {
        handle: Arc::new(AgentHandle {
            pid,
            stdin: Mutex::new(stdin),
        }),
        frames: frames_rx,
        exit: exit_rx,
    })
}

impl AgentHandle {
    /// Serialize `frame` compactly, append a newline, write and flush.
    ///
    /// Writes are serialized by the stdin lock so concurrent producers
    /// cannot interleave partial frames.
    pub async fn send(&self, frame: &Value) -> Result<()> {
        let mut line = serde_json::to_vec(frame)?;
        line.push(b'\n');

        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(&line)
            .await
            .map_err(|e| Error::AgentIo(format!("stdin write failed: {e}")))?;
        stdin
            .flush()
            .await
            .map_err(|e| Error::AgentIo(format!("stdin flush failed: {e}")))?;
        Ok(())
    }

    /// Terminate the agent's whole process group.
    pub fn kill(&self) {
        // The child was started with process_group(0), so its pgid == pid.
        let ret = unsafe { libc::kill(-(self.pid as i32), libc::SIGKILL) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!(pid = self.pid, "Failed to kill agent process group: {err}");
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    #[tokio::test]
    async fn spawn_echo_round_trip() {
        // cat echoes each frame back unchanged
        let mut agent = spawn("cat", Path::new("/tmp"), &[]).unwrap();

        agent.handle.send(&json!({"hello": "world"})).await.unwrap();
        let frame = tokio::time::timeout(Duration::from_secs(5), agent.frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, json!({"hello": "world"}));

        agent.handle.kill();
        let info = tokio::time::timeout(Duration::from_secs(5), agent.exit)
            .await
            .unwrap()
            .unwrap();
        assert!(info.code.is_none() || info.code != Some(0));
    }

    #[tokio::test]
    async fn invalid_lines_do_not_interrupt_stream() {
        let mut agent = spawn(
            "printf 'not json\\n{\"ok\":1}\\n'",
            Path::new("/tmp"),
            &[],
        )
        .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(5), agent.frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, json!({"ok": 1}));
    }

    #[tokio::test]
    async fn exit_signal_fires_on_natural_exit() {
        let agent = spawn("exit 3", Path::new("/tmp"), &[]).unwrap();
        let info = tokio::time::timeout(Duration::from_secs(5), agent.exit)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(info.code, Some(3));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let result = spawn("cat", Path::new("/definitely/not/a/dir"), &[]);
        assert!(matches!(result, Err(Error::SpawnFailed(_))));
    }
}
