//! Certificate loading for the HTTPS terminator

use crate::error::StartupError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Build a TLS acceptor from a PEM certificate chain and private key on disk
pub fn acceptor_from_files(cert_path: &Path, key_path: &Path) -> Result<TlsAcceptor, StartupError> {
    let certs = load_certs(cert_path)?;
    let key = load_key(key_path)?;

    let config = rustls::ServerConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()?
    .with_no_client_auth()
    .with_single_cert(certs, key)?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn open(path: &Path) -> Result<BufReader<File>, StartupError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| StartupError::CertificateRead {
            path: path.to_path_buf(),
            source,
        })
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, StartupError> {
    let mut reader = open(path)?;
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| StartupError::CertificateRead {
            path: path.to_path_buf(),
            source,
        })?;

    if certs.is_empty() {
        return Err(StartupError::NoCertificates(path.to_path_buf()));
    }

    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, StartupError> {
    let mut reader = open(path)?;

    loop {
        match rustls_pemfile::read_one(&mut reader).map_err(|source| {
            StartupError::CertificateRead {
                path: path.to_path_buf(),
                source,
            }
        })? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(StartupError::NoPrivateKey(path.to_path_buf()))
}
