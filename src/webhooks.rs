//! Self-update webhook
//!
//! Accepts signed GitHub deliveries on `POST /api/github`. A push to the tracked branch
//! runs the update script, then tears every listener down and asks the supervisor for a
//! restart through the exit status.

use crate::error::{json_response, WebhookRejection};
use crate::lifecycle::Lifecycle;
use crate::update::UpdateRunner;
use hmac::{Hmac, Mac};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{HeaderMap, Response, StatusCode};
use serde::Deserialize;
use sha1::Sha1;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type HmacSha1 = Hmac<Sha1>;

/// Route the pipeline is mounted on
pub const WEBHOOK_PATH: &str = "/api/github";

pub const EVENT_HEADER: &str = "x-github-event";
pub const DELIVERY_HEADER: &str = "x-github-delivery";
pub const SIGNATURE_HEADER: &str = "x-hub-signature";

/// User-agent prefix every GitHub delivery carries
pub const SENDER_PREFIX: &str = "GitHub-Hookshot/";

const SIGNATURE_PREFIX: &str = "sha1=";

/// GitHub caps delivery payloads at 25 MB
pub const DEFAULT_MAX_BODY_BYTES: usize = 25 * 1024 * 1024;

/// Kind of delivered event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Ping,
    Push,
    Other(String),
}

impl EventKind {
    fn parse(s: &str) -> Self {
        match s {
            "ping" => EventKind::Ping,
            "push" => EventKind::Push,
            other => EventKind::Other(other.to_string()),
        }
    }
}

/// A delivery whose headers are present. The signature is not yet checked.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub kind: EventKind,
    pub delivery: String,
    pub signature: String,
    pub body: Bytes,
}

impl WebhookEvent {
    pub fn from_request(headers: &HeaderMap, body: Bytes) -> Result<Self, WebhookRejection> {
        let header = |name: &str| headers.get(name).and_then(|v| v.to_str().ok());

        let from_github = header(hyper::header::USER_AGENT.as_str())
            .map(|ua| ua.starts_with(SENDER_PREFIX))
            .unwrap_or(false);

        match (header(EVENT_HEADER), header(DELIVERY_HEADER), header(SIGNATURE_HEADER)) {
            (Some(kind), Some(delivery), Some(signature)) if from_github => Ok(Self {
                kind: EventKind::parse(kind),
                delivery: delivery.to_string(),
                signature: signature.to_string(),
                body,
            }),
            _ => Err(WebhookRejection::InvalidDelivery),
        }
    }

    /// The `ref` field of a push payload. Unparseable bodies have no ref.
    pub fn pushed_ref(&self) -> Option<String> {
        #[derive(Deserialize)]
        struct PushPayload {
            #[serde(rename = "ref")]
            ref_name: Option<String>,
        }

        serde_json::from_slice::<PushPayload>(&self.body)
            .ok()
            .and_then(|p| p.ref_name)
    }
}

/// What an accepted delivery led to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    /// Ping acknowledged
    Pong,
    /// Push to the tracked branch; the update runs in the background
    UpdateScheduled,
    /// Push to some other ref
    Ignored { pushed_ref: Option<String> },
}

fn keyed_mac(secret: &str, body: &[u8]) -> Result<HmacSha1, hmac::digest::InvalidLength> {
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())?;
    mac.update(body);
    Ok(mac)
}

/// Hex HMAC-SHA1 of `body` keyed with `secret`
pub fn sign(secret: &str, body: &[u8]) -> Result<String, hmac::digest::InvalidLength> {
    Ok(hex::encode(keyed_mac(secret, body)?.finalize().into_bytes()))
}

/// Check a `sha1=<hex>` signature header against the body in constant time
pub fn verify_signature(secret: &str, body: &[u8], header: &str) -> bool {
    let Some(provided) = header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(provided) = hex::decode(provided) else {
        return false;
    };

    match keyed_mac(secret, body) {
        Ok(mac) => mac.verify_slice(&provided).is_ok(),
        Err(_) => false,
    }
}

pub struct WebhookPipeline {
    secret: String,
    tracked_ref: String,
    runner: Arc<dyn UpdateRunner>,
    lifecycle: Arc<Lifecycle>,
    max_body_bytes: usize,
}

impl WebhookPipeline {
    pub fn new(
        secret: impl Into<String>,
        branch: &str,
        runner: Arc<dyn UpdateRunner>,
        lifecycle: Arc<Lifecycle>,
    ) -> Self {
        Self {
            secret: secret.into(),
            tracked_ref: format!("refs/heads/{}", branch),
            runner,
            lifecycle,
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
        }
    }

    /// Cap delivery bodies at `limit` bytes instead of the default
    pub fn with_max_body_bytes(mut self, limit: usize) -> Self {
        self.max_body_bytes = limit;
        self
    }

    pub fn tracked_ref(&self) -> &str {
        &self.tracked_ref
    }

    /// Largest delivery body the route reads. Independent of the general API cap.
    pub fn max_body_bytes(&self) -> usize {
        self.max_body_bytes
    }

    /// Validate and dispatch a delivery. A tracked push spawns the update before returning.
    pub fn handle(&self, headers: &HeaderMap, body: Bytes) -> Result<WebhookOutcome, WebhookRejection> {
        let event = WebhookEvent::from_request(headers, body)?;
        debug!(delivery = %event.delivery, "Webhook delivery received, validating");

        if !verify_signature(&self.secret, &event.body, &event.signature) {
            return Err(WebhookRejection::SignatureMismatch);
        }

        match event.kind {
            EventKind::Ping => {
                info!(delivery = %event.delivery, "Webhook ping received");
                Ok(WebhookOutcome::Pong)
            }
            EventKind::Push => {
                let pushed_ref = event.pushed_ref();
                if pushed_ref.as_deref() == Some(self.tracked_ref.as_str()) {
                    info!(delivery = %event.delivery, pushed_ref = %self.tracked_ref, "Push to tracked branch, updating");
                    let runner = Arc::clone(&self.runner);
                    let lifecycle = Arc::clone(&self.lifecycle);
                    tokio::spawn(run_update(runner, lifecycle));
                    Ok(WebhookOutcome::UpdateScheduled)
                } else {
                    info!(delivery = %event.delivery, pushed_ref = ?pushed_ref, "Push to untracked ref, ignoring");
                    Ok(WebhookOutcome::Ignored { pushed_ref })
                }
            }
            EventKind::Other(_) => Err(WebhookRejection::UnsupportedEvent),
        }
    }

    /// Handle a delivery and build the JSON boolean response
    pub fn respond(&self, headers: &HeaderMap, body: Bytes) -> Response<Full<Bytes>> {
        match self.handle(headers, body) {
            Ok(_) => json_response(StatusCode::OK, &true),
            Err(rejection) => {
                warn!(reason = rejection.as_str(), "Webhook delivery rejected");
                rejection.into_response()
            }
        }
    }
}

/// Run the update, then shut down and request a restart however the script ended
async fn run_update(runner: Arc<dyn UpdateRunner>, lifecycle: Arc<Lifecycle>) {
    match runner.run().await {
        Ok(result) if result.success() => {
            info!(signal = ?result.signal, "Update script finished");
        }
        Ok(result) => {
            warn!(code = ?result.code, signal = ?result.signal, "Update script exited with non-zero status");
        }
        Err(e) => {
            error!(error = %e, "Update script could not be started, restarting anyway");
        }
    }

    info!("Bringing down listeners for restart");
    lifecycle.restart().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::update::UpdateProcessResult;
    use async_trait::async_trait;
    use hyper::header::HeaderValue;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    const SECRET: &str = "abc";

    struct CountingRunner {
        spawned: AtomicUsize,
        code: i32,
    }

    #[async_trait]
    impl UpdateRunner for CountingRunner {
        async fn run(&self) -> anyhow::Result<UpdateProcessResult> {
            self.spawned.fetch_add(1, Ordering::SeqCst);
            Ok(UpdateProcessResult {
                code: Some(self.code),
                signal: None,
            })
        }
    }

    fn pipeline(code: i32) -> (WebhookPipeline, Arc<CountingRunner>, Arc<Lifecycle>) {
        let runner = Arc::new(CountingRunner {
            spawned: AtomicUsize::new(0),
            code,
        });
        let lifecycle = Lifecycle::new(Duration::from_secs(5));
        let pipeline = WebhookPipeline::new(SECRET, "master", runner.clone(), Arc::clone(&lifecycle));
        (pipeline, runner, lifecycle)
    }

    fn signed_headers(event: &str, body: &[u8]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(EVENT_HEADER, HeaderValue::from_str(event).unwrap());
        headers.insert(DELIVERY_HEADER, HeaderValue::from_static("72d3162e-cc78-11e3-81ab-4c9367dc0958"));
        headers.insert(
            SIGNATURE_HEADER,
            HeaderValue::from_str(&format!("sha1={}", sign(SECRET, body).unwrap())).unwrap(),
        );
        headers.insert(
            hyper::header::USER_AGENT,
            HeaderValue::from_static("GitHub-Hookshot/044aadd"),
        );
        headers
    }

    #[test]
    fn test_reference_signature() {
        assert_eq!(sign("abc", b"hello").unwrap(), "d373670db3c99ebfa96060e993c340ccf6dd079e");
        assert!(verify_signature(
            "abc",
            b"hello",
            "sha1=d373670db3c99ebfa96060e993c340ccf6dd079e"
        ));
    }

    #[test]
    fn test_signature_bit_flips_rejected() {
        let header = format!("sha1={}", sign("abc", b"hello").unwrap());
        // 'h' ^ 0x01 == 'i'
        assert!(!verify_signature("abc", b"iello", &header));
        // 'c' ^ 0x01 == 'b'
        assert!(!verify_signature("abb", b"hello", &header));
    }

    #[test]
    fn test_signature_format() {
        let digest = sign("abc", b"hello").unwrap();
        assert!(!verify_signature("abc", b"hello", &digest));
        assert!(!verify_signature("abc", b"hello", &format!("sha256={}", digest)));
        assert!(!verify_signature("abc", b"hello", "sha1=not-hex"));
        assert!(!verify_signature("abc", b"hello", "sha1="));
    }

    #[tokio::test]
    async fn test_ping_accepted_without_spawn() {
        let (pipeline, runner, _) = pipeline(0);
        let body = br#"{"zen":"Keep it logically awesome."}"#;

        let outcome = pipeline.handle(&signed_headers("ping", body), Bytes::from_static(body));
        assert_eq!(outcome, Ok(WebhookOutcome::Pong));
        assert_eq!(runner.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tracked_push_updates_and_restarts() {
        let (pipeline, runner, lifecycle) = pipeline(0);
        let body = br#"{"ref":"refs/heads/master"}"#;

        let outcome = pipeline.handle(&signed_headers("push", body), Bytes::from_static(body));
        assert_eq!(outcome, Ok(WebhookOutcome::UpdateScheduled));

        tokio::time::timeout(Duration::from_secs(2), lifecycle.stopped())
            .await
            .expect("update should trigger shutdown");
        assert_eq!(runner.spawned.load(Ordering::SeqCst), 1);
        assert_eq!(lifecycle.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_failed_update_still_restarts() {
        let (pipeline, _, lifecycle) = pipeline(2);
        let body = br#"{"ref":"refs/heads/master"}"#;

        pipeline.handle(&signed_headers("push", body), Bytes::from_static(body)).unwrap();

        tokio::time::timeout(Duration::from_secs(2), lifecycle.stopped())
            .await
            .expect("non-zero exit must not block the restart");
        assert!(lifecycle.restart_requested());
    }

    struct MissingInterpreter;

    #[async_trait]
    impl UpdateRunner for MissingInterpreter {
        async fn run(&self) -> anyhow::Result<UpdateProcessResult> {
            anyhow::bail!("Failed to spawn /nonexistent/bash update.sh: No such file or directory")
        }
    }

    #[tokio::test]
    async fn test_unspawnable_update_still_restarts() {
        let lifecycle = Lifecycle::new(Duration::from_secs(5));
        let pipeline = WebhookPipeline::new(SECRET, "master", Arc::new(MissingInterpreter), Arc::clone(&lifecycle));
        let body = br#"{"ref":"refs/heads/master"}"#;

        let outcome = pipeline.handle(&signed_headers("push", body), Bytes::from_static(body));
        assert_eq!(outcome, Ok(WebhookOutcome::UpdateScheduled));

        tokio::time::timeout(Duration::from_secs(2), lifecycle.stopped())
            .await
            .expect("spawn failure must still hand control to the supervisor");
        assert_eq!(lifecycle.exit_code(), 1);
    }

    #[tokio::test]
    async fn test_untracked_push_ignored() {
        let (pipeline, runner, lifecycle) = pipeline(0);
        let body = br#"{"ref":"refs/heads/other"}"#;

        let outcome = pipeline.handle(&signed_headers("push", body), Bytes::from_static(body));
        assert_eq!(
            outcome,
            Ok(WebhookOutcome::Ignored {
                pushed_ref: Some("refs/heads/other".to_string())
            })
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(runner.spawned.load(Ordering::SeqCst), 0);
        assert!(!lifecycle.restart_requested());
    }

    #[tokio::test]
    async fn test_unknown_event_rejected() {
        let (pipeline, _, _) = pipeline(0);
        let body = b"{}";

        let outcome = pipeline.handle(&signed_headers("issues", body), Bytes::from_static(body));
        assert_eq!(outcome, Err(WebhookRejection::UnsupportedEvent));
    }

    #[tokio::test]
    async fn test_bad_signature_rejected_before_dispatch() {
        let (pipeline, runner, _) = pipeline(0);
        let signed = br#"{"ref":"refs/heads/master"}"#;
        let tampered = br#"{"ref":"refs/heads/master","x":1}"#;

        let outcome = pipeline.handle(&signed_headers("push", signed), Bytes::from_static(tampered));
        assert_eq!(outcome, Err(WebhookRejection::SignatureMismatch));
        assert_eq!(runner.spawned.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_headers_rejected() {
        let (pipeline, _, _) = pipeline(0);
        let body = b"{}";

        for missing in [EVENT_HEADER, DELIVERY_HEADER, SIGNATURE_HEADER, "user-agent"] {
            let mut headers = signed_headers("ping", body);
            headers.remove(missing);
            assert_eq!(
                pipeline.handle(&headers, Bytes::from_static(body)),
                Err(WebhookRejection::InvalidDelivery),
                "missing {}",
                missing
            );
        }
    }

    #[tokio::test]
    async fn test_foreign_user_agent_rejected() {
        let (pipeline, _, _) = pipeline(0);
        let body = b"{}";
        let mut headers = signed_headers("ping", body);
        headers.insert(hyper::header::USER_AGENT, HeaderValue::from_static("curl/8.0"));

        assert_eq!(
            pipeline.handle(&headers, Bytes::from_static(body)),
            Err(WebhookRejection::InvalidDelivery)
        );
    }

    #[test]
    fn test_pushed_ref_tolerates_garbage() {
        let event = WebhookEvent {
            kind: EventKind::Push,
            delivery: "d".to_string(),
            signature: String::new(),
            body: Bytes::from_static(b"not json"),
        };
        assert_eq!(event.pushed_ref(), None);
    }

    #[tokio::test]
    async fn test_respond_status_codes() {
        let (pipeline, _, _) = pipeline(0);
        let body = b"{}";

        let ok = pipeline.respond(&signed_headers("ping", body), Bytes::from_static(body));
        assert_eq!(ok.status(), StatusCode::OK);

        let mut forged = signed_headers("ping", body);
        forged.insert(SIGNATURE_HEADER, HeaderValue::from_static("sha1=00"));
        let denied = pipeline.respond(&forged, Bytes::from_static(body));
        assert_eq!(denied.status(), StatusCode::FORBIDDEN);

        let unsupported = pipeline.respond(&signed_headers("release", body), Bytes::from_static(body));
        assert_eq!(unsupported.status(), StatusCode::BAD_REQUEST);
    }
}
