use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Config file tried first when no path is given on the command line
pub const LOCAL_CONFIG_FILE: &str = "config.toml";
/// Checked-in fallback used when no local config exists
pub const DEFAULT_CONFIG_FILE: &str = "config.default.toml";

/// Global configuration for the front-end
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Certificate material for the HTTPS topology
    #[serde(default)]
    pub tls: TlsConfig,

    /// Self-update webhook configuration
    #[serde(default)]
    pub webhook: WebhookConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Front port (0 means unset: plain listener on 80, or HTTPS on 443 + redirect on 80)
    #[serde(default)]
    pub port: u16,

    /// Bind address for externally reachable listeners (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// How long the multiplexer waits for the first byte of a connection
    #[serde(default = "default_first_byte_timeout")]
    pub first_byte_timeout_secs: u64,

    /// Upper bound on each listener teardown during shutdown
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Directory holding the single-page application
    #[serde(default = "default_static_dir")]
    pub static_dir: String,

    /// Maximum accepted request body size
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl ServerConfig {
    /// The explicitly configured front port, if any
    pub fn front_port(&self) -> Option<u16> {
        (self.port > 0).then_some(self.port)
    }

    pub fn first_byte_timeout(&self) -> Duration {
        Duration::from_secs(self.first_byte_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 0,
            bind: default_bind_address(),
            first_byte_timeout_secs: default_first_byte_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            static_dir: default_static_dir(),
            max_body_bytes: default_max_body_bytes(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    /// Path to the certificate chain (PEM format)
    #[serde(default = "default_tls_cert")]
    pub cert: String,

    /// Path to the private key (PEM format)
    #[serde(default = "default_tls_key")]
    pub key: String,
}

impl TlsConfig {
    /// Both halves of the certificate pair exist on disk
    pub fn material_present(&self) -> bool {
        Path::new(&self.cert).exists() && Path::new(&self.key).exists()
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            cert: default_tls_cert(),
            key: default_tls_key(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct WebhookConfig {
    /// Shared secret for signature verification. The endpoint does not exist without it.
    pub secret: Option<String>,

    /// Branch whose pushes trigger the update (default: master)
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Update script run on a tracked push
    #[serde(default = "default_update_script")]
    pub update_script: String,

    /// Interpreter used to run the update script
    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Largest delivery body accepted on the webhook route (default: 25 MiB)
    #[serde(default = "default_webhook_max_body_bytes")]
    pub max_body_bytes: usize,
}

impl WebhookConfig {
    /// The configured secret, treating an empty string as absent
    pub fn secret(&self) -> Option<&str> {
        self.secret.as_deref().filter(|s| !s.is_empty())
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: None,
            branch: default_branch(),
            update_script: default_update_script(),
            interpreter: default_interpreter(),
            max_body_bytes: default_webhook_max_body_bytes(),
        }
    }
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_first_byte_timeout() -> u64 {
    10
}

fn default_shutdown_timeout() -> u64 {
    10
}

fn default_static_dir() -> String {
    "app".to_string()
}

fn default_max_body_bytes() -> usize {
    1024 * 1024
}

fn default_tls_cert() -> String {
    "./certificate.crt".to_string()
}

fn default_tls_key() -> String {
    "./privatekey.pem".to_string()
}

fn default_webhook_max_body_bytes() -> usize {
    25 * 1024 * 1024
}

fn default_branch() -> String {
    "master".to_string()
}

fn default_update_script() -> String {
    "update.sh".to_string()
}

fn default_interpreter() -> String {
    "bash".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Pick the config file: explicit argument, then the local file, then the checked-in default.
    /// Returns `None` when nothing exists and built-in defaults should be used.
    pub fn locate(explicit: Option<PathBuf>) -> Option<PathBuf> {
        if explicit.is_some() {
            return explicit;
        }
        [LOCAL_CONFIG_FILE, DEFAULT_CONFIG_FILE]
            .into_iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.bind.parse::<std::net::IpAddr>().is_err() {
            errors.push(format!("server.bind '{}' is not an IP address", self.server.bind));
        }
        if self.server.first_byte_timeout_secs == 0 {
            errors.push("server.first_byte_timeout_secs must be greater than 0".to_string());
        }
        if self.server.shutdown_timeout_secs == 0 {
            errors.push("server.shutdown_timeout_secs must be greater than 0".to_string());
        }
        // port+2 must still be a valid port for the redirect listener
        if self.server.port > u16::MAX - 2 {
            errors.push(format!(
                "server.port {} leaves no room for the backend listeners",
                self.server.port
            ));
        }
        if self.webhook.secret.is_some() && self.webhook.branch.is_empty() {
            errors.push("webhook.branch must not be empty".to_string());
        }
        if self.webhook.max_body_bytes == 0 {
            errors.push("webhook.max_body_bytes must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
