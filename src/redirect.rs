//! HTTP-to-HTTPS redirect responder

use crate::listener::ConnectionService;
use async_trait::async_trait;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use tokio::net::TcpStream;

/// Answers every request with a 301 to the https equivalent of the requested URL
#[derive(Debug, Default)]
pub struct RedirectService;

#[async_trait]
impl ConnectionService for RedirectService {
    async fn serve(&self, stream: TcpStream, _peer: SocketAddr) -> anyhow::Result<()> {
        let io = TokioIo::new(stream);
        let service = service_fn(|req: Request<Incoming>| async move {
            Ok::<_, hyper::Error>(https_redirect(&req))
        });

        AutoBuilder::new(TokioExecutor::new())
            .serve_connection(io, service)
            .await
            .map_err(|e| anyhow::anyhow!("Redirect connection error: {}", e))?;

        Ok(())
    }
}

/// Build an HTTPS redirect response (301 Moved Permanently), keeping host, path and query
pub fn https_redirect<B>(req: &Request<B>) -> Response<Full<Bytes>> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().authority().map(|a| a.as_str()));

    let Some(host) = host else {
        return Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .header(hyper::header::CONTENT_TYPE, "text/plain")
            .body(Full::new(Bytes::from("Missing Host header")))
            .expect("valid response builder");
    };

    let path = req.uri().path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    let location = format!("https://{}{}", host, path);

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from("Redirecting to HTTPS")))
        .expect("valid response builder")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(uri: &str, host: Option<&str>) -> Request<()> {
        let mut builder = Request::builder().uri(uri);
        if let Some(host) = host {
            builder = builder.header(hyper::header::HOST, host);
        }
        builder.body(()).unwrap()
    }

    #[test]
    fn test_redirect_preserves_path_and_query() {
        let response = https_redirect(&get("/projects/42?tab=code&x=1", Some("example.com")));
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(
            response.headers().get(hyper::header::LOCATION).unwrap(),
            "https://example.com/projects/42?tab=code&x=1"
        );
    }

    #[test]
    fn test_redirect_keeps_host_port() {
        let response = https_redirect(&get("/", Some("example.com:8080")));
        assert_eq!(
            response.headers().get(hyper::header::LOCATION).unwrap(),
            "https://example.com:8080/"
        );
    }

    #[test]
    fn test_redirect_root() {
        let response = https_redirect(&get("/", Some("example.com")));
        assert_eq!(
            response.headers().get(hyper::header::LOCATION).unwrap(),
            "https://example.com/"
        );
    }

    #[test]
    fn test_redirect_uses_absolute_uri_authority() {
        let response = https_redirect(&get("http://example.org/a?b", None));
        assert_eq!(
            response.headers().get(hyper::header::LOCATION).unwrap(),
            "https://example.org/a?b"
        );
    }

    #[test]
    fn test_redirect_without_host() {
        let response = https_redirect(&get("/", None));
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
