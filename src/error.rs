//! Error types and JSON responses for the front-end

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Fatal problems while provisioning listeners. Any of these aborts startup.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("failed to bind {name} listener on {addr}: {source}")]
    Bind {
        name: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid bind address '{0}'")]
    InvalidBindAddress(String),

    #[error("port {0} leaves no room for the backend listeners")]
    PortOverflow(u16),

    #[error("failed to read {path}: {source}")]
    CertificateRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificates found in {0}")]
    NoCertificates(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
}

/// Failures while tearing down a single listener
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("{name} listener task failed: {source}")]
    Task {
        name: &'static str,
        #[source]
        source: tokio::task::JoinError,
    },

    #[error("{name} listener did not stop within {after:?}")]
    Timeout { name: &'static str, after: Duration },
}

/// Reasons a webhook delivery is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WebhookRejection {
    /// Required headers missing or not from the expected sender
    InvalidDelivery,
    /// HMAC signature did not match the body
    SignatureMismatch,
    /// Event kind other than ping or push
    UnsupportedEvent,
}

impl WebhookRejection {
    /// Get the HTTP status code for this rejection
    pub fn status_code(&self) -> StatusCode {
        match self {
            WebhookRejection::InvalidDelivery => StatusCode::BAD_REQUEST,
            WebhookRejection::SignatureMismatch => StatusCode::FORBIDDEN,
            WebhookRejection::UnsupportedEvent => StatusCode::BAD_REQUEST,
        }
    }

    /// Stable identifier for log fields
    pub fn as_str(&self) -> &'static str {
        match self {
            WebhookRejection::InvalidDelivery => "INVALID_DELIVERY",
            WebhookRejection::SignatureMismatch => "SIGNATURE_MISMATCH",
            WebhookRejection::UnsupportedEvent => "UNSUPPORTED_EVENT",
        }
    }

    /// The response sent back to the webhook sender
    pub fn into_response(self) -> Response<Full<Bytes>> {
        json_response(self.status_code(), &false)
    }
}

/// Failures of the opaque per-request authorization check
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("missing token")]
    MissingToken,

    #[error("token rejected: {0}")]
    Rejected(String),

    #[error("no account service configured")]
    Unavailable,
}

/// Create a JSON response from any serializable value
pub fn json_response<T: Serialize + ?Sized>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    let body = serde_json::to_vec(value).unwrap_or_else(|_| b"null".to_vec());

    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt;

    #[test]
    fn test_rejection_status_codes() {
        assert_eq!(
            WebhookRejection::InvalidDelivery.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            WebhookRejection::SignatureMismatch.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            WebhookRejection::UnsupportedEvent.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[tokio::test]
    async fn test_rejection_response_body_is_false() {
        let response = WebhookRejection::SignatureMismatch.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"false");
    }

    #[test]
    fn test_startup_error_messages() {
        let err = StartupError::NoPrivateKey(PathBuf::from("./privatekey.pem"));
        assert_eq!(err.to_string(), "no private key found in ./privatekey.pem");

        let err = StartupError::PortOverflow(65535);
        assert!(err.to_string().contains("65535"));
    }

    #[test]
    fn test_rejection_identifiers() {
        assert_eq!(WebhookRejection::SignatureMismatch.as_str(), "SIGNATURE_MISMATCH");
        assert_eq!(WebhookRejection::UnsupportedEvent.as_str(), "UNSUPPORTED_EVENT");
    }
}
