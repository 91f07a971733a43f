//! Uplink transport: connecting to the hub, with or without TLS.
//!
//! The session does not care which one it got; both plain `TcpStream` and
//! `TlsStream<TcpStream>` are boxed behind [`LinkStream`].

use std::io;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::info;

use super::config::LinkConfig;
use super::error::RelayError;

/// Combined async read+write trait for type-erased link streams.
pub trait LinkTransport: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> LinkTransport for T {}

/// A connected uplink stream, ready for framing with `LineCodec`.
pub type LinkStream = Box<dyn LinkTransport>;

/// Open the uplink, bounded by the configured connect timeout.
pub async fn connect_uplink(link: &LinkConfig) -> Result<LinkStream, RelayError> {
    let addr = link.addr();
    let connect = TcpStream::connect((link.host.as_str(), link.port));
    let tcp = match tokio::time::timeout(link.connect_timeout, connect).await {
        Ok(Ok(tcp)) => tcp,
        Ok(Err(source)) => return Err(RelayError::Connect { addr, source }),
        Err(_) => {
            return Err(RelayError::Connect {
                addr,
                source: io::Error::new(
                    io::ErrorKind::TimedOut,
                    format!("no answer within {}s", link.connect_timeout.as_secs()),
                ),
            })
        }
    };
    // Botnet traffic is small interactive lines.
    let _ = tcp.set_nodelay(true);

    if !link.tls {
        info!(%addr, "uplink connected");
        return Ok(Box::new(tcp));
    }

    let ca_file = link
        .ca_file
        .as_deref()
        .ok_or_else(|| RelayError::Tls("no CA bundle configured".into()))?;
    let connector = build_connector(ca_file)?;
    let name = ServerName::try_from(link.host.clone())
        .map_err(|e| RelayError::Tls(format!("{}: {e}", link.host)))?;
    let tls = connector
        .connect(name, tcp)
        .await
        .map_err(|source| RelayError::Connect { addr: addr.clone(), source })?;
    info!(%addr, "uplink connected over TLS");
    Ok(Box::new(tls))
}

/// A TLS connector trusting only the roots in the PEM bundle at `ca_file`.
pub fn build_connector(ca_file: &Path) -> Result<TlsConnector, RelayError> {
    let pem = std::fs::read(ca_file)
        .map_err(|e| RelayError::Tls(format!("{}: {e}", ca_file.display())))?;

    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut &pem[..]) {
        let cert = cert.map_err(|e| RelayError::Tls(format!("{}: {e}", ca_file.display())))?;
        roots
            .add(cert)
            .map_err(|e| RelayError::Tls(format!("{}: {e}", ca_file.display())))?;
    }
    if roots.is_empty() {
        return Err(RelayError::Tls(format!(
            "{}: no certificates found",
            ca_file.display()
        )));
    }

    let config = ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(TlsConnector::from(Arc::new(config)))
}
