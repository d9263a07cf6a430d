use std::{net::IpAddr, path::Path, time::Duration};

use crate::{error::Error, server::Server};

pub const DEFAULT_DNS_TIMEOUT: Duration = Duration::from_secs(3);
pub const DEFAULT_DNS_RETRIES: u32 = 3;
pub const DEFAULT_EDNS_PAYLOAD: u16 = 1460;
pub const DEFAULT_RESOLVER_PORT: u16 = 53;
pub const DEFAULT_RESOLV_CONF: &str = "/etc/resolv.conf";

/// Configuration for talking to a validating recursive resolver.
///
/// The library performs no DNSSEC validation of its own; it trusts the
/// AD bit set by the resolver, which is why `ad` defaults to on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolver {
    pub servers: Vec<Server>,
    pub rd: bool,
    pub ad: bool,
    pub cd: bool,
    pub timeout: Duration,
    pub retries: u32,
    pub payload: u16,
    pub want_ipv4: bool,
    pub want_ipv6: bool,
    pub pkix_fallback: bool,
}

impl Resolver {
    pub fn new(servers: Vec<Server>) -> Self {
        Resolver {
            servers,
            rd: true,
            ad: true,
            cd: false,
            timeout: DEFAULT_DNS_TIMEOUT,
            retries: DEFAULT_DNS_RETRIES,
            payload: DEFAULT_EDNS_PAYLOAD,
            want_ipv4: true,
            want_ipv6: true,
            pkix_fallback: true,
        }
    }

    /// Reads the nameservers from an `/etc/resolv.conf`-format file.
    pub fn from_resolv_conf(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let contents = std::fs::read(path)
            .map_err(|err| Error::Io(format!("failed to read {}: {err}", path.display())))?;
        let conf = resolv_conf::Config::parse(&contents)
            .map_err(|err| Error::Io(format!("failed to parse {}: {err}", path.display())))?;
        let mut servers = Vec::with_capacity(conf.nameservers.len());
        for nameserver in &conf.nameservers {
            let ip: IpAddr = nameserver.into();
            servers.push(Server::new(String::new(), ip, DEFAULT_RESOLVER_PORT)?);
        }
        if servers.is_empty() {
            return Err(Error::Io(format!(
                "no nameservers found in {}",
                path.display()
            )));
        }
        Ok(Resolver::new(servers))
    }

    /// The system default resolver.
    pub fn system() -> Result<Self, Error> {
        Resolver::from_resolv_conf(DEFAULT_RESOLV_CONF)
    }

    pub(crate) fn first_server(&self) -> Result<&Server, Error> {
        self.servers
            .first()
            .ok_or_else(|| Error::Transport("resolver has no servers".to_string()))
    }
}
