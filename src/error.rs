use std::fmt;

use crate::config::AppProtocol;

/// Everything that can go wrong between a name and an authenticated
/// TLS connection, classified by the layer that produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    // Resolver
    BadRcode(u16),
    NoSuchName(String),
    EmptyResponse,
    Transport(String),

    // Authentication input
    UnauthenticatedTlsa,
    UnauthenticatedAddress,
    NoTlsaRecords,

    // Crypto input
    UnknownSelector(u8),
    UnknownMatchingType(u8),
    BadCertificateEncoding(String),

    // Chain building
    PkixBuildFailed(String),
    DaneBuildFailed(String),

    // Authentication outcome
    DaneAuthFailed,
    HostnameMismatch(String),

    // Connecting
    InvalidAddress(String),
    NoAddresses(String),
    ExhaustedAddresses(String),
    ConnectTimeout(String),
    Connect(String),
    StartTls { proto: AppProtocol, phase: String },
    TlsHandshake(String),
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::BadRcode(code) => write!(f, "DNS response rcode: {code}"),
            Error::NoSuchName(qname) => write!(f, "{qname}: non-existent domain name"),
            Error::EmptyResponse => f.write_str("empty DNS response"),
            Error::Transport(details) => write!(f, "DNS transport failed: {details}"),
            Error::UnauthenticatedTlsa => f.write_str("TLSA response was unauthenticated"),
            Error::UnauthenticatedAddress => f.write_str("address response was unauthenticated"),
            Error::NoTlsaRecords => f.write_str("no TLSA records found"),
            Error::UnknownSelector(selector) => write!(f, "unknown TLSA selector: {selector}"),
            Error::UnknownMatchingType(mtype) => {
                write!(f, "unknown TLSA matching type: {mtype}")
            }
            Error::BadCertificateEncoding(details) => {
                write!(f, "failed to parse server certificate: {details}")
            }
            Error::PkixBuildFailed(details) => {
                write!(f, "PKIX certificate chain verification failed: {details}")
            }
            Error::DaneBuildFailed(details) => {
                write!(f, "DANE certificate chain verification failed: {details}")
            }
            Error::DaneAuthFailed => f.write_str("DANE TLS authentication failed"),
            Error::HostnameMismatch(name) => {
                write!(f, "server certificate is not valid for {name:?}")
            }
            Error::InvalidAddress(details) => write!(f, "invalid address: {details}"),
            Error::NoAddresses(host) => write!(f, "{host}: no addresses found"),
            Error::ExhaustedAddresses(host) => {
                write!(f, "failed to connect to any server address for {host:?}")
            }
            Error::ConnectTimeout(addr) => write!(f, "connection to {addr} timed out"),
            Error::Connect(details) => write!(f, "connection failed: {details}"),
            Error::StartTls { proto, phase } => {
                write!(f, "{proto} STARTTLS failed: {phase}")
            }
            Error::TlsHandshake(details) => write!(f, "TLS handshake failed: {details}"),
            Error::Io(details) => f.write_str(details),
        }
    }
}

impl std::error::Error for Error {}
