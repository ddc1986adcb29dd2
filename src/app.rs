//! Application listener: the API surface owned by the front-end plus the static app

use crate::assets::StaticFiles;
use crate::auth::{authorize_request, Authorizer};
use crate::error::{json_response, WebhookRejection};
use crate::listener::ConnectionService;
use crate::webhooks::{WebhookPipeline, WEBHOOK_PATH};
use async_trait::async_trait;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Bytes, Incoming};
use hyper::header::HeaderValue;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

const API_PREFIX: &str = "/api";
const HEALTH_PATH: &str = "/api/health";

/// Body fields never written to logs
const CENSORED_FIELDS: [&str; 2] = ["password", "code"];

/// Routes application requests
pub struct AppRouter {
    webhook: Option<WebhookPipeline>,
    authorizer: Arc<dyn Authorizer>,
    static_files: StaticFiles,
    max_body_bytes: usize,
}

impl AppRouter {
    pub fn new(
        authorizer: Arc<dyn Authorizer>,
        static_dir: impl Into<std::path::PathBuf>,
        max_body_bytes: usize,
    ) -> Self {
        Self {
            webhook: None,
            authorizer,
            static_files: StaticFiles::new(static_dir),
            max_body_bytes,
        }
    }

    /// Mount the self-update webhook. Without this the route does not exist.
    pub fn with_webhook(mut self, pipeline: WebhookPipeline) -> Self {
        self.webhook = Some(pipeline);
        self
    }

    pub fn webhook_enabled(&self) -> bool {
        self.webhook.is_some()
    }

    pub async fn handle<B>(&self, req: Request<B>, peer: SocketAddr) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let path = req.uri().path();
        if path == API_PREFIX || path.starts_with("/api/") {
            let mut response = self.handle_api(req, peer).await;
            let headers = response.headers_mut();
            headers.insert("access-control-allow-origin", HeaderValue::from_static("*"));
            headers.insert("access-control-allow-headers", HeaderValue::from_static("*"));
            return response;
        }

        match *req.method() {
            Method::GET => self.static_files.serve(path, false).await,
            Method::HEAD => self.static_files.serve(path, true).await,
            _ => json_response(StatusCode::NOT_FOUND, &()),
        }
    }

    async fn handle_api<B>(&self, req: Request<B>, peer: SocketAddr) -> Response<Full<Bytes>>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    {
        let (parts, body) = req.into_parts();

        if parts.method == Method::OPTIONS {
            return Response::builder()
                .status(StatusCode::OK)
                .body(Full::new(Bytes::new()))
                .expect("valid response builder");
        }

        // Deliveries are routed before reading so they get the webhook's own cap
        let webhook = match (&parts.method, parts.uri.path(), &self.webhook) {
            (&Method::POST, WEBHOOK_PATH, Some(webhook)) => Some(webhook),
            _ => None,
        };
        let limit = webhook.map_or(self.max_body_bytes, |w| w.max_body_bytes());

        let body = match Limited::new(body, limit).collect().await {
            Ok(collected) => collected.to_bytes(),
            Err(e) if e.is::<http_body_util::LengthLimitError>() => {
                debug!(peer = %peer, limit, "Request body too large");
                return match webhook {
                    Some(_) => {
                        warn!(peer = %peer, limit, "Webhook delivery exceeds body limit");
                        WebhookRejection::InvalidDelivery.into_response()
                    }
                    None => json_response(StatusCode::PAYLOAD_TOO_LARGE, &()),
                };
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Failed to read request body");
                return json_response(StatusCode::BAD_REQUEST, &());
            }
        };

        let path = parts.uri.path();
        debug!(
            peer = %peer,
            method = %parts.method,
            path,
            body = %censor_body(&body),
            "API request"
        );

        if let Some(webhook) = webhook {
            return webhook.respond(&parts.headers, body);
        }

        match (&parts.method, path) {
            (&Method::GET, HEALTH_PATH) => json_response(StatusCode::OK, &true),
            _ => match authorize_request(self.authorizer.as_ref(), &parts.headers).await {
                Ok(account) => {
                    debug!(account = %account, path, "No handler for API route");
                    json_response(StatusCode::NOT_FOUND, &())
                }
                Err(e) => {
                    debug!(peer = %peer, path, error = %e, "Unauthorized API request");
                    json_response(StatusCode::OK, &())
                }
            },
        }
    }
}

/// Render a request body for logs with sensitive fields masked
pub fn censor_body(body: &[u8]) -> String {
    if body.is_empty() {
        return "{}".to_string();
    }

    match serde_json::from_slice::<serde_json::Value>(body) {
        Ok(mut value) => {
            if let Some(object) = value.as_object_mut() {
                for field in CENSORED_FIELDS {
                    if let Some(v) = object.get_mut(field) {
                        *v = serde_json::Value::String("[censored]".to_string());
                    }
                }
            }
            value.to_string()
        }
        Err(_) => format!("<{} bytes>", body.len()),
    }
}

/// Serves the application, either in plaintext or behind TLS
pub struct AppService {
    router: Arc<AppRouter>,
    tls_acceptor: Option<TlsAcceptor>,
}

impl AppService {
    pub fn new(router: Arc<AppRouter>) -> Self {
        Self {
            router,
            tls_acceptor: None,
        }
    }

    pub fn with_tls(mut self, acceptor: TlsAcceptor) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }
}

#[async_trait]
impl ConnectionService for AppService {
    async fn serve(&self, stream: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let router = Arc::clone(&self.router);
        match &self.tls_acceptor {
            Some(acceptor) => {
                let tls_stream = acceptor
                    .accept(stream)
                    .await
                    .map_err(|e| anyhow::anyhow!("TLS handshake failed: {}", e))?;
                serve_app_connection(tls_stream, peer, router).await
            }
            None => serve_app_connection(stream, peer, router).await,
        }
    }
}

async fn serve_app_connection<S>(stream: S, peer: SocketAddr, router: Arc<AppRouter>) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req: Request<Incoming>| {
        let router = Arc::clone(&router);
        async move { Ok::<_, hyper::Error>(router.handle(req, peer).await) }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
