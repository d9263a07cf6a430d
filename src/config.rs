use std::{fmt, net::IpAddr, str::FromStr, sync::Arc};

use rustls::Certificate;

use crate::{error::Error, server::Server, tlsa::TlsaInfo};

/// Application protocols with a STARTTLS upgrade dance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppProtocol {
    Smtp,
    Imap,
    Pop3,
    XmppClient,
    XmppServer,
}

impl fmt::Display for AppProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AppProtocol::Smtp => "smtp",
            AppProtocol::Imap => "imap",
            AppProtocol::Pop3 => "pop3",
            AppProtocol::XmppClient => "xmpp-client",
            AppProtocol::XmppServer => "xmpp-server",
        })
    }
}

impl FromStr for AppProtocol {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "smtp" => Ok(AppProtocol::Smtp),
            "imap" => Ok(AppProtocol::Imap),
            "pop3" => Ok(AppProtocol::Pop3),
            "xmpp-client" => Ok(AppProtocol::XmppClient),
            "xmpp-server" => Ok(AppProtocol::XmppServer),
            other => Err(Error::Connect(format!(
                "unknown STARTTLS application {other:?}"
            ))),
        }
    }
}

/// The authentication context for a single connection attempt.
///
/// A `Config` is built per (host, ip, port), populated with TLSA data
/// before dialing, mutated by the peer verifier during that one
/// handshake, and read back by the caller afterwards. It is never
/// shared between attempts; [`Config::set_tlsa`] deep-copies the RRset
/// so concurrent attempts cannot race on per-record match state.
#[derive(Clone, Debug)]
pub struct Config {
    pub server: Server,
    pub app: Option<AppProtocol>,
    pub service_name: Option<String>,

    /// Attempt DANE authentication when TLSA data is present.
    pub dane: bool,
    /// Allow falling back to PKIX authentication.
    pub pkix: bool,
    /// Perform the name check even for DANE-EE records.
    pub dane_ee_name_check: bool,
    /// Allow the PKIX-* usage modes under SMTP.
    pub smtp_any_mode: bool,
    /// Skip all peer verification (diagnostics only).
    pub no_verify: bool,
    /// Park verification errors in [`Config::diag_error`] and hand the
    /// caller a live connection for inspection.
    pub diag_mode: bool,

    pub tlsa: Option<TlsaInfo>,

    // Outcome of the last handshake
    pub ok_dane: bool,
    pub ok_pkix: bool,
    pub peer_chain: Vec<Certificate>,
    pub pkix_chains: Vec<Vec<Certificate>>,
    pub dane_chains: Vec<Vec<Certificate>>,
    pub diag_error: Option<Error>,
    pub transcript: String,

    pub(crate) roots: Option<Arc<Vec<Vec<u8>>>>,
    pub(crate) fail: Option<Error>,
}

impl Config {
    /// A fresh attempt context with DANE and PKIX fallback enabled.
    pub fn new(name: impl Into<String>, ip: IpAddr, port: u16) -> Result<Self, Error> {
        Ok(Config {
            server: Server::new(name, ip, port)?,
            app: None,
            service_name: None,
            dane: true,
            pkix: true,
            dane_ee_name_check: false,
            smtp_any_mode: false,
            no_verify: false,
            diag_mode: false,
            tlsa: None,
            ok_dane: false,
            ok_pkix: false,
            peer_chain: Vec::new(),
            pkix_chains: Vec::new(),
            dane_chains: Vec::new(),
            diag_error: None,
            transcript: String::new(),
            roots: None,
            fail: None,
        })
    }

    /// Installs a deep copy of the TLSA RRset with cleared match state.
    pub fn set_tlsa(&mut self, tlsa: &TlsaInfo) {
        let mut tlsa = tlsa.clone();
        tlsa.uncheck();
        self.tlsa = Some(tlsa);
    }

    pub fn set_app(&mut self, app: AppProtocol) {
        self.app = Some(app);
    }

    /// STARTTLS service identity, when different from the server name.
    pub fn set_service_name(&mut self, name: impl Into<String>) {
        self.service_name = Some(name.into());
    }

    /// Disallows PKIX fallback; only DANE authentication may succeed.
    pub fn no_pkix_fallback(&mut self) {
        self.pkix = false;
    }

    /// Replaces the system trust store with a caller-supplied set of
    /// DER root certificates for PKIX chain building.
    pub fn set_roots(&mut self, roots: Vec<Vec<u8>>) {
        self.roots = Some(Arc::new(roots));
    }

    /// Whether DANE authentication will actually run on this attempt.
    pub fn dane_armed(&self) -> bool {
        self.dane && self.tlsa.is_some()
    }

    /// The verified chains produced by the last handshake: the
    /// PKIX-built chains when PKIX validation succeeded, otherwise the
    /// self-anchored DANE chains.
    pub fn verified_chains(&self) -> &[Vec<Certificate>] {
        if !self.pkix_chains.is_empty() {
            &self.pkix_chains
        } else {
            &self.dane_chains
        }
    }

    // DANE usages consume the self-anchored chains, PKIX usages the
    // root-store chains. Only one set is populated per attempt, so the
    // other set stands in when a record's preferred set is empty.
    pub(crate) fn chains_for_usage(&self, usage: u8) -> &[Vec<Certificate>] {
        let (preferred, other) = if usage == crate::tlsa::DANE_TA || usage == crate::tlsa::DANE_EE {
            (&self.dane_chains, &self.pkix_chains)
        } else {
            (&self.pkix_chains, &self.dane_chains)
        };
        if !preferred.is_empty() {
            preferred
        } else {
            other
        }
    }
}
