//! Server registry and graceful shutdown coordination
//!
//! [`Lifecycle`] is the single owner of every listener created at startup. Signal
//! handlers and the webhook pipeline share it through an `Arc` and both funnel into
//! [`Lifecycle::shutdown`], which runs the teardown exactly once.

use crate::error::ListenerError;
use crate::listener::{ConnectionService, ListenerHandle};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Exit status asking the external supervisor to restart the process
pub const RESTART_EXIT_CODE: i32 = 1;

/// Process-level lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Draining,
    Stopped,
}

/// Ordered collection of every listener created at startup
#[derive(Default)]
struct ServerRegistry {
    handles: Vec<Arc<ListenerHandle>>,
}

impl ServerRegistry {
    fn len(&self) -> usize {
        self.handles.len()
    }

    fn addrs(&self) -> Vec<(&'static str, SocketAddr)> {
        self.handles
            .iter()
            .map(|h| (h.name(), h.local_addr()))
            .collect()
    }
}

/// Owned context shared by everything that may end the process
pub struct Lifecycle {
    registry: Mutex<ServerRegistry>,
    state: watch::Sender<LifecycleState>,
    restart_requested: AtomicBool,
    destroy_timeout: Duration,
}

impl Lifecycle {
    pub fn new(destroy_timeout: Duration) -> Arc<Self> {
        let (state, _) = watch::channel(LifecycleState::Running);
        Arc::new(Self {
            registry: Mutex::new(ServerRegistry::default()),
            state,
            restart_requested: AtomicBool::new(false),
            destroy_timeout,
        })
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Number of listeners still registered
    pub fn listener_count(&self) -> usize {
        self.registry.lock().len()
    }

    /// Names and addresses of registered listeners, in registration order
    pub fn listener_addrs(&self) -> Vec<(&'static str, SocketAddr)> {
        self.registry.lock().addrs()
    }

    /// Register a bound listener, then start accepting on it.
    ///
    /// Registration happens first so a shutdown can never miss a listener that is already
    /// serving. Refused once shutdown has begun.
    pub fn launch(
        &self,
        name: &'static str,
        listener: TcpListener,
        service: Arc<dyn ConnectionService>,
    ) -> std::io::Result<Arc<ListenerHandle>> {
        let addr = listener.local_addr()?;
        let handle = Arc::new(ListenerHandle::new(name, addr));

        {
            let mut registry = self.registry.lock();
            if self.state() != LifecycleState::Running {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "shutdown in progress",
                ));
            }
            registry.handles.push(Arc::clone(&handle));
        }

        handle.start(listener, service);
        info!(listener = name, addr = %addr, "Listener started");
        Ok(handle)
    }

    /// Tear down every registered listener. Only the first call does any work; later
    /// calls log and return immediately.
    ///
    /// Returns `true` if this call performed the teardown.
    pub async fn shutdown(&self) -> bool {
        let began = self.state.send_if_modified(|state| {
            if *state == LifecycleState::Running {
                *state = LifecycleState::Draining;
                true
            } else {
                false
            }
        });
        if !began {
            info!("Already shutting down");
            return false;
        }

        let handles = std::mem::take(&mut self.registry.lock().handles);
        info!(count = handles.len(), "Shutting down listeners");

        // Stop every accept loop first so nothing new arrives while we tear down
        for handle in &handles {
            handle.close();
        }

        for handle in &handles {
            if let Err(e) = self.destroy(handle).await {
                error!(listener = handle.name(), error = %e, "Listener teardown failed");
            }
        }

        self.state.send_replace(LifecycleState::Stopped);
        info!("All listeners shut down");
        true
    }

    /// Destroy one listener, aborting it outright if that takes longer than the timeout
    async fn destroy(&self, handle: &ListenerHandle) -> Result<(), ListenerError> {
        match tokio::time::timeout(self.destroy_timeout, handle.destroy()).await {
            Ok(result) => result,
            Err(_) => {
                handle.abort();
                Err(ListenerError::Timeout {
                    name: handle.name(),
                    after: self.destroy_timeout,
                })
            }
        }
    }

    /// Shut down and record that the process should exit with the restart status
    pub async fn restart(&self) -> bool {
        self.restart_requested.store(true, Ordering::SeqCst);
        self.shutdown().await
    }

    pub fn restart_requested(&self) -> bool {
        self.restart_requested.load(Ordering::SeqCst)
    }

    /// Exit status the process should terminate with once stopped
    pub fn exit_code(&self) -> i32 {
        if self.restart_requested() {
            RESTART_EXIT_CODE
        } else {
            0
        }
    }

    /// Resolve once teardown has completed, whoever triggered it
    pub async fn stopped(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives in self, so the channel cannot close while we wait
        let _ = rx.wait_for(|state| *state == LifecycleState::Stopped).await;
    }
}
