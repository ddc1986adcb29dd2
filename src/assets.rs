//! Static single-page application files

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

const INDEX_FILE: &str = "index.html";

/// Serves files under a root directory, falling back to `index.html` for unknown paths
#[derive(Debug, Clone)]
pub struct StaticFiles {
    root: PathBuf,
}

impl StaticFiles {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map a request path onto the root. Anything but plain path segments is refused.
    pub fn resolve(&self, request_path: &str) -> Option<PathBuf> {
        let relative = Path::new(request_path.trim_start_matches('/'));
        let mut resolved = self.root.clone();
        for component in relative.components() {
            match component {
                Component::Normal(segment) => resolved.push(segment),
                Component::CurDir => {}
                _ => return None,
            }
        }
        Some(resolved)
    }

    /// Serve `request_path`; `head` omits the body
    pub async fn serve(&self, request_path: &str, head: bool) -> Response<Full<Bytes>> {
        let Some(path) = self.resolve(request_path) else {
            debug!(path = request_path, "Refusing path outside static root");
            return not_found();
        };

        let path = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => path.join(INDEX_FILE),
            Ok(_) => path,
            Err(_) => self.root.join(INDEX_FILE),
        };

        let (path, contents) = match tokio::fs::read(&path).await {
            Ok(contents) => (path, contents),
            Err(_) => {
                let index = self.root.join(INDEX_FILE);
                match tokio::fs::read(&index).await {
                    Ok(contents) => (index, contents),
                    Err(e) => {
                        debug!(path = %index.display(), error = %e, "Application index not found");
                        return not_found();
                    }
                }
            }
        };

        let body = if head { Bytes::new() } else { Bytes::from(contents) };
        Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, content_type(&path))
            .body(Full::new(body))
            .expect("valid response builder")
    }
}

fn not_found() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(Full::new(Bytes::from("Not Found")))
        .expect("valid response builder")
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css; charset=utf-8",
        Some("js") | Some("mjs") => "application/javascript; charset=utf-8",
        Some("json") | Some("map") => "application/json",
        Some("svg") => "image/svg+xml",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("ico") => "image/x-icon",
        Some("woff") => "font/woff",
        Some("woff2") => "font/woff2",
        Some("txt") | Some("md") => "text/plain; charset=utf-8",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}
