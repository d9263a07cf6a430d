use std::{borrow::Cow, fmt, fmt::Write};

use rustls::Certificate;
use sha2::{Digest, Sha256, Sha512};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::{
    config::{AppProtocol, Config},
    error::Error,
    verify::cert_matches_name,
};

// DANE certificate usage modes (RFC 7671)
pub const PKIX_TA: u8 = 0; // Certificate Authority constraint
pub const PKIX_EE: u8 = 1; // Service certificate constraint
pub const DANE_TA: u8 = 2; // Trust anchor assertion
pub const DANE_EE: u8 = 3; // Domain issued certificate

/// One TLSA record's rdata, plus the match state recorded during the
/// most recent authentication. Association data is lowercase hex.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsaRecord {
    pub usage: u8,
    pub selector: u8,
    pub mtype: u8,
    pub data: String,
    pub checked: bool,
    pub ok: bool,
    pub message: String,
}

impl TlsaRecord {
    pub fn new(usage: u8, selector: u8, mtype: u8, data: String) -> Self {
        TlsaRecord {
            usage,
            selector,
            mtype,
            data,
            checked: false,
            ok: false,
            message: String::new(),
        }
    }
}

impl fmt::Display for TlsaRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix = self.data.get(..8).unwrap_or(self.data.as_str());
        write!(
            f,
            "DANE TLSA {} {} {} [{}..]",
            self.usage, self.selector, self.mtype, prefix
        )
    }
}

/// The TLSA RRset for one service endpoint.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsaInfo {
    pub qname: String,
    pub alias: Vec<String>,
    pub rdata: Vec<TlsaRecord>,
}

impl TlsaInfo {
    pub fn new(qname: String) -> Self {
        TlsaInfo {
            qname,
            alias: Vec::new(),
            rdata: Vec::new(),
        }
    }

    /// Clears the match state of every record.
    pub fn uncheck(&mut self) {
        for record in self.rdata.iter_mut() {
            record.checked = false;
            record.ok = false;
            record.message.clear();
        }
    }

    /// Per-record matching results, one line each.
    pub fn results(&self) -> String {
        if self.rdata.is_empty() {
            return "No TLSA records available.\n".to_string();
        }
        let mut out = String::new();
        for record in &self.rdata {
            let _ = if !record.checked {
                writeln!(out, "{record}: not checked")
            } else if record.ok {
                writeln!(out, "{record}: OK {}", record.message)
            } else {
                writeln!(out, "{record}: FAIL {}", record.message)
            };
        }
        out
    }
}

/// Computes the TLSA association data for a certificate under the given
/// selector and matching type, as lowercase hex.
pub fn compute_tlsa(selector: u8, mtype: u8, cert_der: &[u8]) -> Result<String, Error> {
    let preimage: Cow<'_, [u8]> = match selector {
        0 => Cow::Borrowed(cert_der),
        1 => {
            let (_, cert) = X509Certificate::from_der(cert_der)
                .map_err(|err| Error::BadCertificateEncoding(err.to_string()))?;
            Cow::Owned(cert.public_key().raw.to_vec())
        }
        selector => return Err(Error::UnknownSelector(selector)),
    };
    match mtype {
        0 => Ok(hex::encode(preimage.as_ref())),
        1 => Ok(hex::encode(Sha256::digest(preimage.as_ref()))),
        2 => Ok(hex::encode(Sha512::digest(preimage.as_ref()))),
        mtype => Err(Error::UnknownMatchingType(mtype)),
    }
}

/// PEM-encodes a DER certificate.
pub fn cert_to_pem(cert_der: &[u8]) -> String {
    pem::encode(&pem::Pem {
        tag: "CERTIFICATE".to_string(),
        contents: cert_der.to_vec(),
    })
}

/// Matches one TLSA record against a certificate chain, recording the
/// outcome and a diagnostic on the record itself.
///
/// EE usages hash the leaf; TA usages walk every certificate above the
/// leaf and keep scanning after a match, so the diagnostic reports the
/// deepest matching certificate. PKIX-* usages additionally require
/// that PKIX validation already succeeded.
pub fn chain_matches_tlsa(chain: &[Certificate], record: &mut TlsaRecord, config: &Config) -> bool {
    let mut authenticated = false;

    record.checked = true;
    match record.usage {
        PKIX_EE | DANE_EE => match compute_tlsa(record.selector, record.mtype, &chain[0].0) {
            Ok(hash) if hash == record.data => {
                if record.usage == DANE_EE || config.ok_pkix {
                    authenticated = true;
                    record.ok = true;
                    record.message = "matched EE certificate".to_string();
                } else {
                    record.ok = false;
                    record.message = "matched EE certificate but PKIX failed".to_string();
                }
            }
            Ok(_) => {
                record.ok = false;
                record.message = "did not match EE certificate".to_string();
            }
            Err(err) => {
                record.ok = false;
                record.message = err.to_string();
            }
        },
        PKIX_TA | DANE_TA => {
            let mut hash_matched = false;
            for (depth, cert) in chain.iter().enumerate().skip(1) {
                match compute_tlsa(record.selector, record.mtype, &cert.0) {
                    Ok(hash) if hash == record.data => {
                        hash_matched = true;
                        if record.usage == DANE_TA || config.ok_pkix {
                            authenticated = true;
                            record.ok = true;
                            record.message = format!("matched TA certificate at depth {depth}");
                        } else {
                            record.ok = false;
                            record.message =
                                format!("matched TA certificate at depth {depth} but PKIX failed");
                        }
                    }
                    Ok(_) => (),
                    Err(err) => {
                        record.ok = false;
                        record.message = err.to_string();
                        break;
                    }
                }
            }
            if !hash_matched {
                record.ok = false;
                record.message = "did not match any TA certificate".to_string();
            }
        }
        usage => {
            record.ok = false;
            record.message = format!("invalid usage mode: {usage}");
        }
    }

    authenticated
}

// RFC 7672: SMTP clients are expected to use only the DANE usage modes,
// unless explicitly configured otherwise.
fn smtp_usage_ok(record: &TlsaRecord, config: &Config) -> bool {
    config.smtp_any_mode || record.usage == DANE_TA || record.usage == DANE_EE
}

/// Authenticates one certificate chain against one TLSA record,
/// including the SMTP usage filter and the name check that DANE-EE
/// skips by default.
pub fn authenticate_single(
    chain: &[Certificate],
    record: &mut TlsaRecord,
    config: &Config,
) -> bool {
    record.checked = true;
    if config.app == Some(AppProtocol::Smtp) && !smtp_usage_ok(record, config) {
        record.ok = false;
        record.message = "invalid usage mode for smtp".to_string();
        return false;
    }
    if !chain_matches_tlsa(chain, record, config) {
        return false;
    }
    if record.usage == DANE_EE && !config.dane_ee_name_check {
        return true;
    }
    if cert_matches_name(&chain[0], &config.server.name) {
        true
    } else {
        record.ok = false;
        record.message.push_str(" but name check failed");
        false
    }
}

/// Probes every TLSA record against every verified chain and sets
/// `config.ok_dane` accordingly. All records are always probed so that
/// each one carries a diagnostic afterwards; there is no early exit.
pub fn authenticate_all(config: &mut Config) {
    let mut ok_dane = false;
    if let Some(mut tlsa) = config.tlsa.take() {
        for record in tlsa.rdata.iter_mut() {
            let chains = config.chains_for_usage(record.usage);
            if chains.is_empty() {
                record.checked = true;
                record.ok = false;
                record.message = "no verified chains available".to_string();
                continue;
            }
            for chain in chains {
                if authenticate_single(chain, record, config) {
                    ok_dane = true;
                }
            }
        }
        config.tlsa = Some(tlsa);
    }
    config.ok_dane = ok_dane;
}
