use std::{
    fmt,
    net::{IpAddr, SocketAddr},
};

use crate::error::Error;

/// A single TLS server endpoint: the name presented for SNI and
/// certificate checks, plus the address actually dialed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    pub name: String,
    pub ip: IpAddr,
    pub port: u16,
}

impl Server {
    pub fn new(name: impl Into<String>, ip: IpAddr, port: u16) -> Result<Self, Error> {
        if port == 0 {
            return Err(Error::InvalidAddress("port 0".to_string()));
        }
        Ok(Server {
            name: name.into(),
            ip,
            port,
        })
    }

    /// Builds a server from a textual IP address.
    pub fn parse(name: impl Into<String>, ip: &str, port: u16) -> Result<Self, Error> {
        let ip = ip
            .parse::<IpAddr>()
            .map_err(|_| Error::InvalidAddress(format!("unparseable IP address {ip:?}")))?;
        Server::new(name, ip, port)
    }

    /// Canonical wire address, `ip:port` for IPv4 and `[ip]:port` for IPv6.
    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.name, self.address())
    }
}
