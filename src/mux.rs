//! Protocol sniffing multiplexer
//!
//! Reads the first chunk of every connection on the front port and forwards the whole
//! connection to the HTTPS terminator when it starts with a TLS handshake record, or to
//! the redirect responder otherwise. After that first byte the traffic is never inspected.

use crate::listener::ConnectionService;
use async_trait::async_trait;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

/// TLS record content type for a handshake
pub const TLS_HANDSHAKE_RECORD: u8 = 0x16;

/// Size of the buffer used for the initial read
const FIRST_CHUNK_SIZE: usize = 4096;

/// Where a connection is sent after sniffing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Tls,
    Plain,
}

impl Route {
    /// Classify a connection by its first byte
    pub fn classify(first_byte: u8) -> Self {
        if first_byte == TLS_HANDSHAKE_RECORD {
            Route::Tls
        } else {
            Route::Plain
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Route::Tls => "tls",
            Route::Plain => "plain",
        }
    }
}

/// Front-port connection service
pub struct Multiplexer {
    tls_backend: SocketAddr,
    plain_backend: SocketAddr,
    first_byte_timeout: Duration,
}

impl Multiplexer {
    pub fn new(tls_backend: SocketAddr, plain_backend: SocketAddr, first_byte_timeout: Duration) -> Self {
        Self {
            tls_backend,
            plain_backend,
            first_byte_timeout,
        }
    }

    pub fn backend_for(&self, route: Route) -> SocketAddr {
        match route {
            Route::Tls => self.tls_backend,
            Route::Plain => self.plain_backend,
        }
    }
}

#[async_trait]
impl ConnectionService for Multiplexer {
    async fn serve(&self, mut client: TcpStream, peer: SocketAddr) -> anyhow::Result<()> {
        let mut first = vec![0u8; FIRST_CHUNK_SIZE];

        let n = match tokio::time::timeout(self.first_byte_timeout, client.read(&mut first)).await {
            Ok(result) => result?,
            Err(_) => {
                debug!(peer = %peer, timeout_secs = self.first_byte_timeout.as_secs(), "No data before timeout, closing");
                return Ok(());
            }
        };
        if n == 0 {
            debug!(peer = %peer, "Client closed before sending data");
            return Ok(());
        }

        let route = Route::classify(first[0]);
        let backend_addr = self.backend_for(route);

        // On failure the client is dropped, which closes it
        let mut backend = TcpStream::connect(backend_addr).await.map_err(|e| {
            anyhow::anyhow!("Failed to connect to {} backend {}: {}", route.as_str(), backend_addr, e)
        })?;

        backend.write_all(&first[..n]).await?;
        drop(first);

        match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
            Ok((client_to_backend, backend_to_client)) => {
                debug!(
                    peer = %peer,
                    route = route.as_str(),
                    client_to_backend = client_to_backend + n as u64,
                    backend_to_client,
                    "Connection closed"
                );
            }
            Err(e) => {
                debug!(peer = %peer, route = route.as_str(), error = %e, "Connection closed with error");
            }
        }

        Ok(())
    }
}
