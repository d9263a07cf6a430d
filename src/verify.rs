use std::{
    sync::{Arc, OnceLock},
    time::SystemTime,
};

use parking_lot::Mutex;
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, ServerName,
};
use webpki::{DnsNameRef, EndEntityCert, TlsServerTrustAnchors, TrustAnchor};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::{config::Config, error::Error, tlsa::authenticate_all};

static SUPPORTED_SIG_ALGS: &[&webpki::SignatureAlgorithm] = &[
    &webpki::ECDSA_P256_SHA256,
    &webpki::ECDSA_P256_SHA384,
    &webpki::ECDSA_P384_SHA256,
    &webpki::ECDSA_P384_SHA384,
    &webpki::ED25519,
    &webpki::RSA_PKCS1_2048_8192_SHA256,
    &webpki::RSA_PKCS1_2048_8192_SHA384,
    &webpki::RSA_PKCS1_2048_8192_SHA512,
    &webpki::RSA_PKCS1_3072_8192_SHA384,
    &webpki::RSA_PSS_2048_8192_SHA256_LEGACY_KEY,
    &webpki::RSA_PSS_2048_8192_SHA384_LEGACY_KEY,
    &webpki::RSA_PSS_2048_8192_SHA512_LEGACY_KEY,
];

static SYSTEM_ROOTS: OnceLock<Arc<Vec<Vec<u8>>>> = OnceLock::new();

/// The system trust store as DER certificates, loaded once per process.
pub(crate) fn system_roots() -> Arc<Vec<Vec<u8>>> {
    SYSTEM_ROOTS
        .get_or_init(|| match rustls_native_certs::load_native_certs() {
            Ok(certs) => Arc::new(certs.into_iter().map(|cert| cert.0).collect()),
            Err(err) => {
                tracing::warn!(
                    module = "verify",
                    event = "root-store",
                    "Failed to load the system trust store: {err}"
                );
                Arc::new(Vec::new())
            }
        })
        .clone()
}

/// Whether the certificate is valid for `name` according to its SAN.
pub(crate) fn cert_matches_name(cert: &Certificate, name: &str) -> bool {
    let Ok(end_entity) = EndEntityCert::try_from(cert.0.as_slice()) else {
        return false;
    };
    let Ok(dns_name) = DnsNameRef::try_from_ascii_str(name) else {
        return false;
    };
    end_entity.verify_is_valid_for_dns_name(dns_name).is_ok()
}

fn webpki_time(now: SystemTime) -> Result<webpki::Time, &'static str> {
    webpki::Time::try_from(now).map_err(|_| "system time before the UNIX epoch")
}

/// Verifies the presented chain against a set of root certificates and
/// returns the chains that validation could have built. Name checks are
/// left to the caller.
pub(crate) fn verify_chain_pkix(
    chain: &[Certificate],
    roots: &[Vec<u8>],
    now: SystemTime,
) -> Result<Vec<Vec<Certificate>>, Error> {
    let tail = chain
        .last()
        .ok_or_else(|| Error::PkixBuildFailed("empty certificate chain".to_string()))?;

    let anchors = roots
        .iter()
        .filter_map(|der| TrustAnchor::try_from_cert_der(der).ok())
        .collect::<Vec<_>>();
    if anchors.is_empty() {
        return Err(Error::PkixBuildFailed("no usable trust anchors".to_string()));
    }

    let end_entity = EndEntityCert::try_from(chain[0].0.as_slice())
        .map_err(|err| Error::BadCertificateEncoding(err.to_string()))?;
    let intermediates = chain[1..]
        .iter()
        .map(|cert| cert.0.as_slice())
        .collect::<Vec<_>>();
    end_entity
        .verify_is_valid_tls_server_cert(
            SUPPORTED_SIG_ALGS,
            &TlsServerTrustAnchors(&anchors),
            &intermediates,
            webpki_time(now).map_err(|err| Error::PkixBuildFailed(err.to_string()))?,
        )
        .map_err(|err| Error::PkixBuildFailed(err.to_string()))?;

    // webpki does not report the path it built, so reconstruct the
    // candidate chains: the presented chain, extended with each store
    // root that issued its tail. A self-issued tail already ends at
    // its root.
    let (_, tail_cert) = X509Certificate::from_der(&tail.0)
        .map_err(|err| Error::BadCertificateEncoding(err.to_string()))?;
    let mut chains = Vec::new();
    if tail_cert.subject().as_raw() != tail_cert.issuer().as_raw() {
        for root_der in roots {
            if let Ok((_, root)) = X509Certificate::from_der(root_der) {
                if root.subject().as_raw() == tail_cert.issuer().as_raw() {
                    let mut with_root = chain.to_vec();
                    with_root.push(Certificate(root_der.clone()));
                    chains.push(with_root);
                }
            }
        }
    }
    if chains.is_empty() {
        chains.push(chain.to_vec());
    }
    Ok(chains)
}

/// Verifies the presented chain against its own tail certificate as the
/// sole trust anchor, which is what lets DANE-TA vouch for an issuer
/// the public PKI does not know.
pub(crate) fn verify_chain_dane(
    chain: &[Certificate],
    now: SystemTime,
) -> Result<Vec<Vec<Certificate>>, Error> {
    let tail = chain
        .last()
        .ok_or_else(|| Error::DaneBuildFailed("empty certificate chain".to_string()))?;

    // A lone certificate is its own anchor; trust in it is asserted by
    // the TLSA record, not by the chain.
    if chain.len() == 1 {
        return Ok(vec![chain.to_vec()]);
    }

    let anchor = TrustAnchor::try_from_cert_der(&tail.0)
        .map_err(|err| Error::DaneBuildFailed(err.to_string()))?;
    let end_entity = EndEntityCert::try_from(chain[0].0.as_slice())
        .map_err(|err| Error::BadCertificateEncoding(err.to_string()))?;
    let intermediates = chain[1..chain.len() - 1]
        .iter()
        .map(|cert| cert.0.as_slice())
        .collect::<Vec<_>>();
    end_entity
        .verify_is_valid_tls_server_cert(
            SUPPORTED_SIG_ALGS,
            &TlsServerTrustAnchors(&[anchor]),
            &intermediates,
            webpki_time(now).map_err(|err| Error::DaneBuildFailed(err.to_string()))?,
        )
        .map_err(|err| Error::DaneBuildFailed(err.to_string()))?;

    Ok(vec![chain.to_vec()])
}

/// The handshake-time peer verifier. It carries a handle back to the
/// attempt's [`Config`], replaces the rustls built-in verification
/// entirely, and composes PKIX chain building, DANE chain building and
/// TLSA matching into the `ok_pkix` / `ok_dane` outcome.
pub(crate) struct PeerVerifier {
    state: Arc<Mutex<Config>>,
}

impl PeerVerifier {
    pub(crate) fn new(state: Arc<Mutex<Config>>) -> Self {
        PeerVerifier { state }
    }
}

fn verify_peer(
    config: &mut Config,
    chain: &[Certificate],
    server_name: &ServerName,
    now: SystemTime,
) -> Result<(), Error> {
    if config.no_verify {
        config.peer_chain = chain.to_vec();
        return Ok(());
    }

    for cert in chain {
        X509Certificate::from_der(&cert.0)
            .map_err(|err| Error::BadCertificateEncoding(err.to_string()))?;
    }
    config.peer_chain = chain.to_vec();

    let roots = config.roots.clone().unwrap_or_else(system_roots);
    let pkix_error = match verify_chain_pkix(chain, &roots, now) {
        Ok(chains) => {
            config.ok_pkix = true;
            config.pkix_chains = chains;
            None
        }
        Err(err) => {
            tracing::debug!(
                module = "verify",
                event = "pkix-failed",
                server = %config.server,
                reason = %err,
                "PKIX chain verification failed."
            );
            Some(err)
        }
    };

    if !config.dane_armed() {
        if let Some(err) = pkix_error {
            return Err(err);
        }
        let name = match server_name {
            ServerName::DnsName(dns) => dns.as_ref().to_string(),
            ServerName::IpAddress(ip) => ip.to_string(),
            _ => config.server.name.clone(),
        };
        if !cert_matches_name(&chain[0], &name) {
            return Err(Error::HostnameMismatch(name));
        }
        return Ok(());
    }

    if !config.ok_pkix {
        config.dane_chains = verify_chain_dane(chain, now)?;
    }

    authenticate_all(config);
    if !config.ok_dane {
        return Err(Error::DaneAuthFailed);
    }
    Ok(())
}

impl ServerCertVerifier for PeerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        intermediates: &[Certificate],
        server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let mut chain = Vec::with_capacity(intermediates.len() + 1);
        chain.push(end_entity.clone());
        chain.extend_from_slice(intermediates);

        let mut config = self.state.lock();
        match verify_peer(&mut config, &chain, server_name, now) {
            Ok(()) => Ok(ServerCertVerified::assertion()),
            Err(err) if config.diag_mode => {
                tracing::debug!(
                    module = "verify",
                    event = "diag-mode",
                    server = %config.server,
                    reason = %err,
                    "Verification failed, returning connection for diagnostics."
                );
                config.diag_error = Some(err);
                Ok(ServerCertVerified::assertion())
            }
            Err(err) => {
                config.fail = Some(err.clone());
                Err(rustls::Error::General(err.to_string()))
            }
        }
    }
}
