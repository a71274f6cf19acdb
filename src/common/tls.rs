//! Server-side TLS listener setup for `tls-enable` (spec §4.4). Grounded
//! on the teacher's `rustls`/`tokio-rustls` dependency pair; the teacher
//! only builds a rustls *client* config (`bin/tls_bench.rs`), so the
//! server-side cert/key loading here follows `rustls-pemfile`'s own
//! documented usage rather than a teacher call site.

use crate::{Error, Result};
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;

pub async fn load_acceptor(cert_file: &str, key_file: &str) -> Result<TlsAcceptor> {
    let cert_bytes = tokio::fs::read(cert_file)
        .await
        .map_err(|e| Error::tls(format!("reading tls cert file {cert_file}: {e}")))?;
    let key_bytes = tokio::fs::read(key_file)
        .await
        .map_err(|e| Error::tls(format!("reading tls key file {key_file}: {e}")))?;

    let certs = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::tls(format!("parsing tls cert file {cert_file}: {e}")))?;
    let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .map_err(|e| Error::tls(format!("parsing tls key file {key_file}: {e}")))?
        .ok_or_else(|| Error::tls(format!("no private key found in {key_file}")))?;

    let config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| Error::tls(format!("building tls server config: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
