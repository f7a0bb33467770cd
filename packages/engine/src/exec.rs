//! Host shell execution for steps that run outside a container, and the
//! cooperative debug facility built on top of it. A step with no image
//! spawns `/bin/sh` with piped stdin; the session stays addressable by step
//! id so `/debug` can feed it commands until `last` closes stdin.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tracing::{debug, warn};

use stagehand_logstream::Sink;

use crate::errors::{EngineError, Result};
use crate::spec::{RunState, Step};

/// One interactive shell owned by a running host step. Commands are queued
/// under the stdin mutex so concurrent debug writes do not interleave.
pub struct ShellSession {
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
}

impl ShellSession {
    async fn add(&self, command: &str) -> Result<()> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| EngineError::Shell("shell session input already closed".into()))?;
        stdin.write_all(command.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Closing stdin lets the shell drain queued commands and exit; the
    /// owning run observes the exit and publishes the step result.
    async fn finish(&self) {
        let mut guard = self.stdin.lock().await;
        guard.take();
    }
}

/// Per-stage registry of live shell sessions, keyed by step id.
#[derive(Default)]
pub struct SessionPool {
    sessions: Mutex<HashMap<String, Arc<ShellSession>>>,
}

impl SessionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs a step as a host shell. The step's command lines are written to
    /// stdin up front; stdin stays open for debug commands until `last`.
    pub async fn run(&self, step: &Step, output: Arc<dyn Sink>) -> Result<RunState> {
        let mut cmd = tokio::process::Command::new("/bin/sh");
        if !step.working_dir.is_empty() {
            cmd.current_dir(&step.working_dir);
        }
        for (key, value) in &step.envs {
            if !value.is_empty() {
                cmd.env(key, value);
            }
        }
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd.spawn()?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| EngineError::Shell("could not open shell stdin".into()))?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let session = Arc::new(ShellSession {
            stdin: tokio::sync::Mutex::new(Some(stdin)),
        });
        self.sessions
            .lock()
            .unwrap()
            .insert(step.id.clone(), session.clone());

        if let Some(out) = stdout {
            tokio::spawn(pump(out, output.clone()));
        }
        if let Some(err) = stderr {
            tokio::spawn(pump(err, output.clone()));
        }

        for line in &step.command {
            session.add(line).await?;
        }

        debug!(step_id = %step.id, "host shell session started");
        let status = child.wait().await;
        self.sessions.lock().unwrap().remove(&step.id);

        let status = status?;
        Ok(RunState {
            exited: true,
            exit_code: i64::from(status.code().unwrap_or(-1)),
            oom_killed: false,
        })
    }

    /// Queues a debug command on the step's session; `last` closes stdin.
    pub async fn debug(&self, step_id: &str, command: &str, last: bool) -> Result<()> {
        let session = self
            .sessions
            .lock()
            .unwrap()
            .get(step_id)
            .cloned()
            .ok_or_else(|| {
                EngineError::Shell(format!("no active shell session for step {step_id}"))
            })?;
        if !command.is_empty() {
            session.add(command).await?;
        }
        if last {
            session.finish().await;
        }
        Ok(())
    }
}

async fn pump(mut reader: impl tokio::io::AsyncRead + Unpin, output: Arc<dyn Sink>) {
    use tokio::io::AsyncReadExt;
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => output.write(&buf[..n]),
            Err(err) => {
                warn!(error = %err, "failed to read shell output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Capture(Mutex<Vec<u8>>);

    impl Sink for Capture {
        fn write(&self, data: &[u8]) {
            self.0.lock().unwrap().extend_from_slice(data);
        }
    }

    fn shell_step(id: &str, command: &[&str]) -> Step {
        Step {
            id: id.to_string(),
            command: command.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn host_step_runs_commands_and_reports_exit() {
        let pool = Arc::new(SessionPool::new());
        let output = Arc::new(Capture::default());
        let step = shell_step("st1", &["echo from-shell", "exit 3"]);

        let state = pool.run(&step, output.clone()).await.unwrap();

        assert!(state.exited);
        assert_eq!(state.exit_code, 3);
        let captured = String::from_utf8(output.0.lock().unwrap().clone()).unwrap();
        assert!(captured.contains("from-shell"));
    }

    #[tokio::test]
    async fn debug_commands_reach_the_session() {
        let pool = Arc::new(SessionPool::new());
        let output = Arc::new(Capture::default());
        let step = shell_step("st2", &[]);

        let runner = {
            let pool = pool.clone();
            let output = output.clone();
            tokio::spawn(async move { pool.run(&step, output).await })
        };

        // wait for the session to register
        for _ in 0..50 {
            if pool.sessions.lock().unwrap().contains_key("st2") {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }

        pool.debug("st2", "echo debugged", false).await.unwrap();
        pool.debug("st2", "", true).await.unwrap();

        let state = runner.await.unwrap().unwrap();
        assert_eq!(state.exit_code, 0);
        let captured = String::from_utf8(output.0.lock().unwrap().clone()).unwrap();
        assert!(captured.contains("debugged"));
    }

    #[tokio::test]
    async fn debug_on_unknown_step_fails() {
        let pool = SessionPool::new();
        let err = pool.debug("missing", "ls", false).await.unwrap_err();
        assert!(err.to_string().contains("missing"));
    }
}
