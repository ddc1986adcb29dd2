//! External update script execution

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

/// How the update subprocess ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateProcessResult {
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, if the process was killed
    pub signal: Option<i32>,
}

impl UpdateProcessResult {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<ExitStatus> for UpdateProcessResult {
    fn from(status: ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// Runs the update and reports how it ended
#[async_trait]
pub trait UpdateRunner: Send + Sync {
    async fn run(&self) -> anyhow::Result<UpdateProcessResult>;
}

/// Runs a script through an interpreter, relaying its output to ours
#[derive(Debug, Clone)]
pub struct ScriptRunner {
    interpreter: String,
    script: PathBuf,
}

impl ScriptRunner {
    pub fn new(interpreter: impl Into<String>, script: impl Into<PathBuf>) -> Self {
        Self {
            interpreter: interpreter.into(),
            script: script.into(),
        }
    }
}

#[async_trait]
impl UpdateRunner for ScriptRunner {
    async fn run(&self) -> anyhow::Result<UpdateProcessResult> {
        info!(interpreter = %self.interpreter, script = %self.script.display(), "Running update script");

        let mut cmd = Command::new(&self.interpreter);
        cmd.arg(&self.script);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        let mut child = cmd.spawn().map_err(|e| {
            anyhow::anyhow!("Failed to spawn {} {}: {}", self.interpreter, self.script.display(), e)
        })?;
        debug!(pid = child.id().unwrap_or(0), "Update script spawned");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        // Relay chunks as they arrive rather than line by line
        let relay_out = async move {
            if let Some(mut out) = stdout {
                let mut sink = tokio::io::stdout();
                let _ = tokio::io::copy(&mut out, &mut sink).await;
                let _ = sink.flush().await;
            }
        };
        let relay_err = async move {
            if let Some(mut err) = stderr {
                let mut sink = tokio::io::stderr();
                let _ = tokio::io::copy(&mut err, &mut sink).await;
                let _ = sink.flush().await;
            }
        };

        let (status, _, _) = tokio::join!(child.wait(), relay_out, relay_err);
        Ok(status?.into())
    }
}
