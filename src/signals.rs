//! OS signals that end the process

use crate::lifecycle::Lifecycle;
use std::sync::Arc;
use tracing::info;
#[cfg(unix)]
use tokio::signal::unix::{signal, Signal, SignalKind};

/// Termination signals the front-end reacts to: SIGINT, SIGTERM, SIGUSR1 and SIGUSR2
#[cfg(unix)]
pub struct ShutdownSignals {
    interrupt: Signal,
    terminate: Signal,
    user1: Signal,
    user2: Signal,
}

#[cfg(unix)]
impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            user1: signal(SignalKind::user_defined1())?,
            user2: signal(SignalKind::user_defined2())?,
        })
    }

    /// Wait for the next signal and return its name
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.interrupt.recv() => "SIGINT",
            _ = self.terminate.recv() => "SIGTERM",
            _ = self.user1.recv() => "SIGUSR1",
            _ = self.user2.recv() => "SIGUSR2",
        }
    }
}

/// Turn every received signal into a shutdown request until the lifecycle has stopped,
/// whoever stopped it, then return the status the process should exit with
pub async fn run_until_stopped(mut signals: ShutdownSignals, lifecycle: Arc<Lifecycle>) -> i32 {
    let stopped = lifecycle.stopped();
    tokio::pin!(stopped);

    loop {
        tokio::select! {
            name = signals.recv() => {
                info!(signal = name, "Received signal, shutting down...");
                let lifecycle = Arc::clone(&lifecycle);
                tokio::spawn(async move {
                    lifecycle.shutdown().await;
                });
            }
            _ = &mut stopped => break,
        }
    }

    lifecycle.exit_code()
}

#[cfg(not(unix))]
pub struct ShutdownSignals;

#[cfg(not(unix))]
impl ShutdownSignals {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self)
    }

    pub async fn recv(&mut self) -> &'static str {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
        "Ctrl+C"
    }
}
