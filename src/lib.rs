//! Frontdoor - TLS/plaintext front-end with self-update
//!
//! This library provides the network front of a web application:
//! - Serves the application over HTTPS with an HTTP-to-HTTPS redirect responder
//! - Optionally multiplexes TLS and plaintext traffic on a single front port by
//!   peeking at the first byte of each connection
//! - Falls back to a single plaintext listener when no certificate material exists
//! - Accepts signed GitHub webhooks that run an update script and restart the process
//! - Tears every listener down exactly once on signals or after an update

pub mod app;
pub mod assets;
pub mod auth;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod mux;
pub mod redirect;
pub mod server;
pub mod signals;
pub mod tls;
pub mod update;
pub mod webhooks;
