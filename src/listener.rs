//! Listener handles
//!
//! A [`ListenerHandle`] owns one bound TCP endpoint and the task accepting on it.
//! Every accepted connection runs in its own task inside a `JoinSet`, so tearing the
//! listener down aborts in-flight connections instead of waiting for sockets to close.

use crate::error::ListenerError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, error, info};

/// Something that serves accepted TCP connections
#[async_trait]
pub trait ConnectionService: Send + Sync + 'static {
    async fn serve(&self, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()>;
}

/// Lifecycle of a single listener, driven by its handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerPhase {
    /// Accepting new connections
    Accepting,
    /// Listening socket dropped, existing connections still running
    Closed,
    /// All connections aborted
    Destroyed,
}

/// A bound, accepting endpoint with a forced-teardown operation
pub struct ListenerHandle {
    name: &'static str,
    local_addr: SocketAddr,
    phase_tx: watch::Sender<ListenerPhase>,
    task: Mutex<Option<JoinHandle<()>>>,
    abort_handle: Mutex<Option<AbortHandle>>,
}

impl ListenerHandle {
    /// Create a handle for a bound listener. Nothing is accepted until [`start`](Self::start).
    pub fn new(name: &'static str, local_addr: SocketAddr) -> Self {
        let (phase_tx, _) = watch::channel(ListenerPhase::Accepting);
        Self {
            name,
            local_addr,
            phase_tx,
            task: Mutex::new(None),
            abort_handle: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn phase(&self) -> ListenerPhase {
        *self.phase_tx.borrow()
    }

    /// Begin accepting connections on `listener`
    pub fn start(&self, listener: TcpListener, service: Arc<dyn ConnectionService>) {
        let phase_rx = self.phase_tx.subscribe();
        let task = tokio::spawn(accept_loop(self.name, listener, service, phase_rx));
        *self.abort_handle.lock() = Some(task.abort_handle());
        *self.task.lock() = Some(task);
    }

    /// Stop accepting. Live connections keep running until [`destroy`](Self::destroy).
    pub fn close(&self) {
        self.phase_tx.send_if_modified(|phase| {
            if *phase == ListenerPhase::Accepting {
                *phase = ListenerPhase::Closed;
                true
            } else {
                false
            }
        });
    }

    /// Close the listener, abort every live connection, and wait until the accept task is gone
    pub async fn destroy(&self) -> Result<(), ListenerError> {
        self.phase_tx.send_replace(ListenerPhase::Destroyed);

        let task = self.task.lock().take();
        match task {
            Some(task) => task.await.map_err(|source| ListenerError::Task {
                name: self.name,
                source,
            }),
            None => Ok(()),
        }
    }

    /// Abort the accept task, and with it every connection, without waiting.
    /// Used when a destroy does not finish in time.
    pub fn abort(&self) {
        self.task.lock().take();
        if let Some(handle) = self.abort_handle.lock().take() {
            handle.abort();
        }
    }
}

async fn accept_loop(
    name: &'static str,
    listener: TcpListener,
    service: Arc<dyn ConnectionService>,
    mut phase_rx: watch::Receiver<ListenerPhase>,
) {
    let mut connections = JoinSet::new();

    while *phase_rx.borrow_and_update() == ListenerPhase::Accepting {
        tokio::select! {
            biased;
            changed = phase_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let service = Arc::clone(&service);
                        connections.spawn(async move {
                            if let Err(e) = service.serve(stream, peer).await {
                                debug!(listener = name, peer = %peer, error = %e, "Connection error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(listener = name, error = %e, "Failed to accept connection");
                    }
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    drop(listener);
    debug!(listener = name, live = connections.len(), "Stopped accepting");

    // Keep reaping finished connections until the handle asks for destruction
    loop {
        if *phase_rx.borrow_and_update() == ListenerPhase::Destroyed {
            break;
        }
        tokio::select! {
            biased;
            changed = phase_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    let aborted = connections.len();
    connections.shutdown().await;
    info!(listener = name, aborted, "Listener destroyed");
}
