use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use rustls::{ClientConfig, ServerName};
use tokio::{net::TcpStream, time::timeout};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::{config::Config, error::Error, server::Server, starttls, verify::PeerVerifier};

pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(4);

async fn connect_tcp(server: &Server) -> Result<TcpStream, Error> {
    let address = server.address();
    match timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(address)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(Error::Connect(format!("{address}: {err}"))),
        Err(_) => Err(Error::ConnectTimeout(address.to_string())),
    }
}

pub(crate) async fn handshake(
    tcp: TcpStream,
    config: &mut Config,
) -> Result<TlsStream<TcpStream>, Error> {
    let server_name = ServerName::try_from(config.server.name.as_str()).map_err(|_| {
        Error::InvalidAddress(format!("invalid server name {:?}", config.server.name))
    })?;

    // The built-in verifier is replaced wholesale; the peer verifier
    // mutates the shared attempt state, which is merged back into the
    // caller's Config whether or not the handshake succeeds.
    let state = Arc::new(Mutex::new(config.clone()));
    let tls_config = ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(PeerVerifier::new(state.clone())))
        .with_no_client_auth();

    let connector = TlsConnector::from(Arc::new(tls_config));
    let result = connector.connect(server_name, tcp).await;

    *config = state.lock().clone();
    match result {
        Ok(conn) => Ok(conn),
        Err(err) => Err(config
            .fail
            .take()
            .unwrap_or_else(|| Error::TlsHandshake(err.to_string()))),
    }
}

/// Connects to `config.server` and negotiates TLS with DANE and/or
/// PKIX peer authentication. On success the outcome of the attempt is
/// recorded on `config` (`ok_dane`, `ok_pkix`, the chains, and the
/// per-record TLSA diagnostics).
pub async fn dial_tls(config: &mut Config) -> Result<TlsStream<TcpStream>, Error> {
    let tcp = connect_tcp(&config.server).await?;
    handshake(tcp, config).await
}

/// Like [`dial_tls`], but first runs the STARTTLS dance selected by
/// `config.app` on the cleartext connection.
pub async fn dial_starttls(config: &mut Config) -> Result<TlsStream<TcpStream>, Error> {
    let mut tcp = connect_tcp(&config.server).await?;
    starttls::negotiate(&mut tcp, config).await?;
    handshake(tcp, config).await
}
