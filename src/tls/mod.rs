//! Listener-side TLS. Certificates and keys are PEM files named in the
//! engine configuration; the resulting acceptor wraps accepted TCP streams
//! before they reach the HTTP machinery or the balancer relay.

use anyhow::{bail, Context, Result};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

/// Build a rustls server config from PEM certificate and key files.
pub fn load_server_config(cert_file: &Path, key_file: &Path) -> Result<Arc<ServerConfig>> {
    let mut cert_reader = BufReader::new(
        File::open(cert_file)
            .with_context(|| format!("unable to read certificate {}", cert_file.display()))?,
    );
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::io::Result<Vec<_>>>()
        .with_context(|| format!("invalid certificate {}", cert_file.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", cert_file.display());
    }

    let mut key_reader = BufReader::new(
        File::open(key_file)
            .with_context(|| format!("unable to read private key {}", key_file.display()))?,
    );
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut key_reader)
        .with_context(|| format!("invalid private key {}", key_file.display()))?
        .with_context(|| format!("no private key found in {}", key_file.display()))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("certificate and key do not match")?;

    Ok(Arc::new(config))
}

/// Build a TLS acceptor for a listener from PEM certificate and key files.
pub fn acceptor(cert_file: &Path, key_file: &Path) -> Result<TlsAcceptor> {
    Ok(TlsAcceptor::from(load_server_config(cert_file, key_file)?))
}
