//! DANE TLS client authentication (RFC 6698, 7671, 7672).
//!
//! Opens authenticated TLS connections to named hosts using
//! DNSSEC-signed TLSA records to pin or constrain the server
//! certificate, falling back to classical PKIX validation when no
//! secure TLSA data is published. DNSSEC validation itself is
//! delegated to a trusted validating resolver; this library inspects
//! the AD bit and performs no validation of its own.

pub mod byname;
pub mod config;
pub mod dial;
pub mod dns;
pub mod error;
pub mod resolver;
pub mod server;
pub mod starttls;
pub mod tlsa;
pub mod verify;

#[cfg(test)]
pub mod tests;

pub use byname::{
    connect_by_name, connect_by_name_async, connect_by_name_async_strict,
    connect_by_name_async_with, connect_by_name_with, IPV6_HEADSTART, MAX_PARALLEL_CONNECTIONS,
};
pub use config::{AppProtocol, Config};
pub use dial::{dial_starttls, dial_tls, TCP_CONNECT_TIMEOUT};
pub use dns::Query;
pub use error::Error;
pub use resolver::Resolver;
pub use server::Server;
pub use tlsa::{
    cert_to_pem, compute_tlsa, TlsaInfo, TlsaRecord, DANE_EE, DANE_TA, PKIX_EE, PKIX_TA,
};
