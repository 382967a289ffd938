use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::task::JoinHandle;
use tracing::debug;

use super::TransportError;

/// How to launch a tool server. Immutable once a transport is created from
/// it; deserialized from the `servers` section of the config file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSpec {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub working_directory: Option<PathBuf>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
}

/// Outcome of a reaped child: exit code (None if killed by signal) and the
/// tail of whatever it wrote to stderr.
#[derive(Debug, Clone)]
pub struct ExitInfo {
    pub code: Option<i32>,
    pub stderr_tail: String,
}

/// Last 8 KiB of child stderr, for diagnostics only. Tool servers are free
/// to log there; none of it is ever parsed as protocol traffic.
const STDERR_TAIL_LIMIT: usize = 8 * 1024;

#[derive(Clone, Default)]
struct StderrTail {
    bytes: Arc<Mutex<VecDeque<u8>>>,
}

impl StderrTail {
    fn push(&self, chunk: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap();
        bytes.extend(chunk);
        while bytes.len() > STDERR_TAIL_LIMIT {
            bytes.pop_front();
        }
    }

    fn contents(&self) -> String {
        let bytes = self.bytes.lock().unwrap();
        String::from_utf8_lossy(&bytes.iter().copied().collect::<Vec<u8>>()).into_owned()
    }
}

/// Owns one child process and its raw streams.
///
/// The transport takes stdin/stdout for its loops; the `ProcessManager`
/// itself is handed to the supervisory task, which is the only place that
/// ever awaits `wait()` or `kill()`.
pub struct ProcessManager {
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Option<ChildStdout>,
    stderr_tail: StderrTail,
    _stderr_task: JoinHandle<()>,
}

impl ProcessManager {
    pub fn spawn(spec: &ServerSpec) -> Result<Self, TransportError> {
        let mut command = Command::new(&spec.command);
        command
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // No exit path may orphan the child, panics included.
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_directory {
            command.current_dir(dir);
        }
        command.envs(&spec.environment);

        let mut child = command.spawn().map_err(|source| TransportError::Spawn {
            command: spec.command.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let stderr_tail = StderrTail::default();
        let tail = stderr_tail.clone();
        let stderr_task = tokio::spawn(async move {
            let Some(mut stderr) = stderr else {
                return;
            };
            let mut chunk = [0u8; 1024];
            loop {
                match stderr.read(&mut chunk).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => tail.push(&chunk[..n]),
                }
            }
        });

        debug!(command = %spec.command, pid = ?child.id(), "spawned tool server");
        Ok(Self {
            child,
            stdin,
            stdout,
            stderr_tail,
            _stderr_task: stderr_task,
        })
    }

    pub fn take_stdin(&mut self) -> Option<ChildStdin> {
        self.stdin.take()
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn stderr_tail(&self) -> String {
        self.stderr_tail.contents()
    }

    /// Suspend until the child exits. Only the supervisory task calls this.
    pub async fn wait(&mut self) -> ExitInfo {
        let status = self.child.wait().await.ok();
        ExitInfo {
            code: status.and_then(|s| s.code()),
            stderr_tail: self.stderr_tail(),
        }
    }

    /// Graceful termination, then force-kill after `grace`.
    ///
    /// By the time this runs the write loop has exited and dropped stdin,
    /// which is the termination request a stdio server understands. A child
    /// that has already exited is reaped and nothing more.
    pub async fn kill(&mut self, grace: Duration) -> ExitInfo {
        if let Ok(Some(status)) = self.child.try_wait() {
            return ExitInfo {
                code: status.code(),
                stderr_tail: self.stderr_tail(),
            };
        }
        let status = match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(waited) => waited.ok(),
            Err(_elapsed) => {
                debug!("grace period elapsed, force-killing child");
                let _ = self.child.start_kill();
                self.child.wait().await.ok()
            }
        };
        ExitInfo {
            code: status.and_then(|s| s.code()),
            stderr_tail: self.stderr_tail(),
        }
    }
}
