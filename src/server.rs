//! Listener topology selection and provisioning

use crate::app::{AppRouter, AppService};
use crate::config::Config;
use crate::error::StartupError;
use crate::lifecycle::Lifecycle;
use crate::listener::{ConnectionService, ListenerHandle};
use crate::mux::Multiplexer;
use crate::redirect::RedirectService;
use crate::tls;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_HTTPS_PORT: u16 = 443;

/// Listeners that were started, by role
#[derive(Debug, Clone)]
pub enum Topology {
    /// No certificate material: the application is served in plaintext
    Plain { app: SocketAddr },
    /// HTTPS with a redirect responder, optionally behind a multiplexing front port
    Tls {
        https: SocketAddr,
        redirect: SocketAddr,
        front: Option<SocketAddr>,
    },
}

impl Topology {
    pub fn is_tls(&self) -> bool {
        matches!(self, Topology::Tls { .. })
    }
}

impl fmt::Display for Topology {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topology::Plain { app } => write!(f, "plain (app on {})", app),
            Topology::Tls {
                https,
                redirect,
                front: Some(front),
            } => write!(
                f,
                "tls (front {} -> https {}, redirect {})",
                front, https, redirect
            ),
            Topology::Tls {
                https,
                redirect,
                front: None,
            } => write!(f, "tls (https {}, redirect {})", https, redirect),
        }
    }
}

/// Choose a topology from the configuration, bind its listeners and register each with
/// the lifecycle. Backends are registered before the multiplexer that feeds them.
pub async fn provision(
    config: &Config,
    lifecycle: &Arc<Lifecycle>,
    router: Arc<AppRouter>,
) -> Result<Topology, StartupError> {
    let bind_ip: IpAddr = config
        .server
        .bind
        .parse()
        .map_err(|_| StartupError::InvalidBindAddress(config.server.bind.clone()))?;
    let front_port = config.server.front_port();

    if !config.tls.material_present() {
        info!(
            cert = %config.tls.cert,
            key = %config.tls.key,
            "No certificate material found, serving plain HTTP"
        );
        let port = front_port.unwrap_or(DEFAULT_HTTP_PORT);
        let service = Arc::new(AppService::new(router));
        let app = start(lifecycle, "app", SocketAddr::new(bind_ip, port), service).await?;
        return Ok(Topology::Plain {
            app: app.local_addr(),
        });
    }

    let acceptor = tls::acceptor_from_files(Path::new(&config.tls.cert), Path::new(&config.tls.key))?;

    let (https_port, redirect_port, backend_ip) = match front_port {
        Some(port) => {
            let https = port.checked_add(1).ok_or(StartupError::PortOverflow(port))?;
            let redirect = port.checked_add(2).ok_or(StartupError::PortOverflow(port))?;
            (https, redirect, IpAddr::V4(Ipv4Addr::LOCALHOST))
        }
        None => (DEFAULT_HTTPS_PORT, DEFAULT_HTTP_PORT, bind_ip),
    };

    let https_service = Arc::new(AppService::new(router).with_tls(acceptor));
    let https = start(
        lifecycle,
        "https",
        SocketAddr::new(backend_ip, https_port),
        https_service,
    )
    .await?;
    let redirect = start(
        lifecycle,
        "redirect",
        SocketAddr::new(backend_ip, redirect_port),
        Arc::new(RedirectService),
    )
    .await?;

    let front = match front_port {
        Some(port) => {
            let mux = Multiplexer::new(
                https.local_addr(),
                redirect.local_addr(),
                config.server.first_byte_timeout(),
            );
            let handle = start(lifecycle, "mux", SocketAddr::new(bind_ip, port), Arc::new(mux)).await?;
            Some(handle.local_addr())
        }
        None => None,
    };

    Ok(Topology::Tls {
        https: https.local_addr(),
        redirect: redirect.local_addr(),
        front,
    })
}

async fn start(
    lifecycle: &Lifecycle,
    name: &'static str,
    addr: SocketAddr,
    service: Arc<dyn ConnectionService>,
) -> Result<Arc<ListenerHandle>, StartupError> {
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| StartupError::Bind { name, addr, source })?;

    lifecycle
        .launch(name, listener, service)
        .map_err(|source| StartupError::Bind { name, addr, source })
}
