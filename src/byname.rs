use std::{net::IpAddr, sync::Arc, time::Duration};

use tokio::{
    net::TcpStream,
    sync::{mpsc, watch, Semaphore},
    time::sleep,
};
use tokio_rustls::client::TlsStream;

use crate::{config::Config, dial::dial_tls, error::Error, resolver::Resolver, tlsa::TlsaInfo};

/// Upper bound on simultaneous connection attempts per lookup.
pub const MAX_PARALLEL_CONNECTIONS: usize = 30;

/// How long IPv4 attempts wait before dialing, giving IPv6 the first
/// shot at winning the race.
pub const IPV6_HEADSTART: Duration = Duration::from_millis(25);

type Connection = (TlsStream<TcpStream>, Config);

async fn resolve_endpoint(
    resolver: &Resolver,
    host: &str,
    port: u16,
) -> Result<(Option<TlsaInfo>, Vec<IpAddr>), Error> {
    let tlsa = resolver.get_tlsa(host, port).await?;
    if !resolver.pkix_fallback && tlsa.is_none() {
        return Err(Error::NoTlsaRecords);
    }
    let ip_list = resolver.get_addresses(host, tlsa.is_some()).await?;
    if ip_list.is_empty() {
        return Err(Error::NoAddresses(host.to_string()));
    }
    Ok((tlsa, ip_list))
}

async fn attempt(
    host: &str,
    ip: IpAddr,
    port: u16,
    tlsa: Option<&TlsaInfo>,
) -> Result<Connection, (IpAddr, Error)> {
    let mut config = Config::new(host, ip, port).map_err(|err| (ip, err))?;
    if let Some(tlsa) = tlsa {
        config.set_tlsa(tlsa);
    }
    if ip.is_ipv4() {
        sleep(IPV6_HEADSTART).await;
    }
    match dial_tls(&mut config).await {
        Ok(conn) => Ok((conn, config)),
        Err(err) => Err((ip, err)),
    }
}

/// Resolves `host` and connects to its addresses one at a time, in DNS
/// order (AAAA before A), returning the first authenticated connection.
///
/// DANE is used when secure TLSA records exist, with PKIX fallback
/// otherwise. For custom per-attempt settings use [`dial_tls`] or
/// [`crate::dial_starttls`] directly.
pub async fn connect_by_name(host: &str, port: u16) -> Result<Connection, Error> {
    let resolver = Resolver::system()?;
    connect_by_name_with(&resolver, host, port).await
}

/// [`connect_by_name`] with an explicit resolver.
pub async fn connect_by_name_with(
    resolver: &Resolver,
    host: &str,
    port: u16,
) -> Result<Connection, Error> {
    let (tlsa, ip_list) = resolve_endpoint(resolver, host, port).await?;
    for ip in ip_list {
        let mut config = Config::new(host, ip, port)?;
        if let Some(tlsa) = &tlsa {
            config.set_tlsa(tlsa);
        }
        match dial_tls(&mut config).await {
            Ok(conn) => return Ok((conn, config)),
            Err(err) => {
                tracing::debug!(
                    module = "byname",
                    event = "connect-error",
                    server = %config.server,
                    reason = %err,
                    "Connection attempt failed."
                );
            }
        }
    }
    Err(Error::ExhaustedAddresses(host.to_string()))
}

/// Parallel [`connect_by_name`]: one task per resolved address, bounded
/// by [`MAX_PARALLEL_CONNECTIONS`], IPv4 delayed by [`IPV6_HEADSTART`].
/// The first address to authenticate wins; the rest are dropped.
pub async fn connect_by_name_async(host: &str, port: u16) -> Result<Connection, Error> {
    let resolver = Resolver::system()?;
    connect_by_name_async_with(&resolver, host, port).await
}

/// [`connect_by_name_async`] with explicit control over PKIX fallback.
/// With `pkix_fallback` off, a host without secure TLSA records is
/// refused before any connection is attempted.
pub async fn connect_by_name_async_strict(
    host: &str,
    port: u16,
    pkix_fallback: bool,
) -> Result<Connection, Error> {
    let mut resolver = Resolver::system()?;
    resolver.pkix_fallback = pkix_fallback;
    connect_by_name_async_with(&resolver, host, port).await
}

/// [`connect_by_name_async`] with an explicit resolver.
pub async fn connect_by_name_async_with(
    resolver: &Resolver,
    host: &str,
    port: u16,
) -> Result<Connection, Error> {
    let (tlsa, ip_list) = resolve_endpoint(resolver, host, port).await?;

    let semaphore = Arc::new(Semaphore::new(MAX_PARALLEL_CONNECTIONS));
    let (result_tx, mut result_rx) = mpsc::channel(1);
    let (done_tx, done_rx) = watch::channel(false);

    for ip in ip_list {
        let semaphore = semaphore.clone();
        let result_tx = result_tx.clone();
        let mut done_rx = done_rx.clone();
        let tlsa = tlsa.clone();
        let host = host.to_string();
        tokio::spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };
            let outcome = attempt(&host, ip, port, tlsa.as_ref()).await;
            // A winner may already have been picked; either hand the
            // result over or drop it on the done signal, but never
            // block while holding the permit.
            tokio::select! {
                _ = done_rx.changed() => (),
                _ = result_tx.send(outcome) => (),
            }
        });
    }
    drop(result_tx);

    while let Some(outcome) = result_rx.recv().await {
        match outcome {
            Ok(success) => {
                let _ = done_tx.send(true);
                return Ok(success);
            }
            Err((ip, err)) => {
                tracing::debug!(
                    module = "byname",
                    event = "connect-error",
                    host = host,
                    ip = %ip,
                    reason = %err,
                    "Connection attempt failed."
                );
            }
        }
    }
    Err(Error::ExhaustedAddresses(host.to_string()))
}
