use frontdoor::app::AppRouter;
use frontdoor::auth::NoAccountService;
use frontdoor::config::Config;
use frontdoor::lifecycle::Lifecycle;
use frontdoor::server::{self, Topology};
use frontdoor::signals::{self, ShutdownSignals};
use frontdoor::update::ScriptRunner;
use frontdoor::webhooks::WebhookPipeline;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

const PKG_NAME: &str = env!("CARGO_PKG_NAME");
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("frontdoor=debug".parse().expect("valid log directive")),
        )
        .init();

    let config = match Config::locate(std::env::args().nth(1).map(PathBuf::from)) {
        Some(path) => {
            let config = Config::load(&path).map_err(|e| {
                error!(path = %path.display(), error = %e, "Failed to load configuration");
                e
            })?;
            info!(path = %path.display(), "Configuration loaded");
            config
        }
        None => {
            warn!("No configuration file found, using built-in defaults");
            Config::default()
        }
    };

    print_startup_banner(&config);

    let lifecycle = Lifecycle::new(config.server.shutdown_timeout());

    let mut router = AppRouter::new(
        Arc::new(NoAccountService),
        &config.server.static_dir,
        config.server.max_body_bytes,
    );
    match config.webhook.secret() {
        Some(secret) => {
            let runner = ScriptRunner::new(&config.webhook.interpreter, &config.webhook.update_script);
            let pipeline = WebhookPipeline::new(
                secret,
                &config.webhook.branch,
                Arc::new(runner),
                Arc::clone(&lifecycle),
            )
            .with_max_body_bytes(config.webhook.max_body_bytes);
            info!(
                tracked_ref = pipeline.tracked_ref(),
                max_body_bytes = pipeline.max_body_bytes(),
                "Self-update webhook enabled"
            );
            router = router.with_webhook(pipeline);
        }
        None => info!("No webhook secret configured, self-update webhook disabled"),
    }

    // Install handlers before any listener exists so an early signal is not lost
    let shutdown_signals = ShutdownSignals::install()?;

    let topology = match server::provision(&config, &lifecycle, Arc::new(router)).await {
        Ok(topology) => topology,
        Err(e) => {
            error!(error = %e, "Failed to start listeners");
            lifecycle.shutdown().await;
            return Err(e.into());
        }
    };
    log_topology(&topology);

    let code = signals::run_until_stopped(shutdown_signals, Arc::clone(&lifecycle)).await;
    info!(exit_code = code, restart = lifecycle.restart_requested(), "Shutdown complete");
    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting front-end");
    info!(
        bind = %config.server.bind,
        front_port = ?config.server.front_port(),
        tls_material = config.tls.material_present(),
        static_dir = %config.server.static_dir,
        "Server configuration"
    );
    info!(
        first_byte_timeout_secs = config.server.first_byte_timeout_secs,
        shutdown_timeout_secs = config.server.shutdown_timeout_secs,
        max_body_bytes = config.server.max_body_bytes,
        "Connection settings"
    );
    info!(
        webhook = config.webhook.secret().is_some(),
        branch = %config.webhook.branch,
        update_script = %config.webhook.update_script,
        "Self-update settings"
    );
}

fn log_topology(topology: &Topology) {
    match topology {
        Topology::Plain { app } => {
            info!(app = %app, "Serving plain HTTP");
        }
        Topology::Tls {
            https,
            redirect,
            front,
        } => {
            info!(https = %https, redirect = %redirect, front = ?front, "Serving HTTPS");
        }
    }
}
