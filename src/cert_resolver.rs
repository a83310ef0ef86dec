//! C6: `CertificateResolver` — maps an already-verified peer certificate to
//! a requesting `SAE_ID`.
//!
//! TLS-level verification (chain, validity period against the configured
//! client CA) happens in `http::tls`; this module only extracts identity
//! from a certificate that has already passed that check, or decodes one
//! conveyed by a trusted reverse proxy. Grounded on the DER-parsing pattern common to the pack's mTLS
//! services (e.g. `routinator`'s `src/cert.rs` and `x509-parser` usage in
//! `protojour-authly`'s `k8s_auth_server.rs`).

use crate::error::KmeError;
use dashmap::DashMap;
use regex::Regex;
use std::sync::Arc;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Error};
use x509_parser::time::ASN1Time;

/// How the peer certificate reached this process.
#[derive(Debug, Clone)]
pub enum ClientAuthMode {
    /// Verified directly by the TLS stack on this connection.
    DirectMutualTls,
    /// Conveyed by a trusted upstream proxy via a configured header.
    TrustedProxy { proxy_addr: String },
}

/// A certificate that has already cleared chain/validity verification,
/// ready for identity extraction. Unifies the direct-mTLS and
/// trusted-proxy paths behind one shape.
#[derive(Debug, Clone)]
pub struct VerifiedCertificate {
    pub der: Vec<u8>,
    pub mode: ClientAuthMode,
}

pub struct CertificateResolver {
    /// SAN pattern used when the Common Name is not itself a legal
    /// `SAE_ID`. A single capture group yields the SAE ID.
    san_pattern: Option<Regex>,
    /// fingerprint (sha256 hex) -> SAE_ID, valid for the life of the
    /// resolver (i.e. the TLS session, in practice one per connection
    /// handler instance).
    fingerprint_cache: DashMap<String, String>,
}

impl CertificateResolver {
    pub fn new(san_pattern: Option<String>) -> Result<Self, KmeError> {
        let san_pattern = san_pattern
            .map(|p| Regex::new(&p))
            .transpose()
            .map_err(|e| KmeError::Internal(format!("invalid SAN pattern: {e}")))?;
        Ok(Self {
            san_pattern,
            fingerprint_cache: DashMap::new(),
        })
    }

    pub fn resolve(&self, cert: &VerifiedCertificate) -> Result<String, KmeError> {
        let fingerprint = sha256_hex(&cert.der);
        if let Some(cached) = self.fingerprint_cache.get(&fingerprint) {
            return Ok(cached.value().clone());
        }

        let (_, parsed) = X509Certificate::from_der(&cert.der)
            .map_err(|e| KmeError::AuthenticationError(format!("unparseable certificate: {e}")))?;

        self.check_validity(&parsed)?;

        let sae_id = self
            .common_name(&parsed)
            .filter(|cn| is_legal_sae_id(cn))
            .or_else(|| self.sae_id_from_san(&parsed))
            .ok_or_else(|| {
                KmeError::AuthenticationError(
                    "no SAE_ID could be extracted from the peer certificate".into(),
                )
            })?;

        self.fingerprint_cache.insert(fingerprint, sae_id.clone());
        Ok(sae_id)
    }

    fn check_validity(&self, cert: &X509Certificate<'_>) -> Result<(), KmeError> {
        let now = ASN1Time::now();
        if !cert.validity().is_valid_at(now) {
            return Err(KmeError::AuthenticationError(
                "peer certificate is outside its validity period".into(),
            ));
        }
        Ok(())
    }

    fn common_name(&self, cert: &X509Certificate<'_>) -> Option<String> {
        cert.subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(|s| s.to_string())
    }

    fn sae_id_from_san(&self, cert: &X509Certificate<'_>) -> Option<String> {
        let pattern = self.san_pattern.as_ref()?;
        let san = cert
            .subject_alternative_name()
            .ok()
            .flatten()?
            .value
            .general_names
            .iter()
            .find_map(|name| match name {
                GeneralName::DNSName(s) => Some(s.to_string()),
                GeneralName::RFC822Name(s) => Some(s.to_string()),
                GeneralName::OtherName(_, bytes) => {
                    String::from_utf8(bytes.to_vec()).ok()
                }
                _ => None,
            })?;
        pattern
            .captures(&san)
            .and_then(|c| c.get(1))
            .map(|m| m.as_str().to_string())
    }
}

fn is_legal_sae_id(candidate: &str) -> bool {
    !candidate.is_empty()
        && candidate.len() <= 64
        && candidate.chars().all(|c| c.is_ascii_alphanumeric())
}

fn sha256_hex(der: &[u8]) -> String {
    use ring_sha256::digest;
    hex::encode(digest(der))
}

/// Thin wrapper so the rest of the module only names one hashing call site;
/// kept separate so swapping the fingerprint algorithm touches one spot.
mod ring_sha256 {
    pub fn digest(bytes: &[u8]) -> [u8; 32] {
        use x509_parser::nom::AsBytes;
        let digest = ring::digest::digest(&ring::digest::SHA256, bytes.as_bytes());
        let mut out = [0u8; 32];
        out.copy_from_slice(digest.as_ref());
        out
    }
}

/// Decodes a trusted-proxy forwarded-certificate header value: PEM text
/// that has been percent/URL-encoded in transit.
pub fn decode_trusted_proxy_header(raw: &str, proxy_addr: &str) -> Result<VerifiedCertificate, KmeError> {
    let decoded = percent_encoding::percent_decode_str(raw)
        .decode_utf8()
        .map_err(|e| KmeError::AuthenticationError(format!("invalid proxy header encoding: {e}")))?;
    let (_, pem) = x509_parser::pem::parse_x509_pem(decoded.as_bytes())
        .map_err(|e| KmeError::AuthenticationError(format!("invalid proxy-forwarded certificate: {e}")))?;
    Ok(VerifiedCertificate {
        der: pem.contents,
        mode: ClientAuthMode::TrustedProxy {
            proxy_addr: proxy_addr.to_string(),
        },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_cert(cn: &str) -> Vec<u8> {
        let params = rcgen::CertificateParams::new(vec![]).unwrap();
        let mut params = params;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, cn);
        let key_pair = rcgen::KeyPair::generate().unwrap();
        let cert = params.self_signed(&key_pair).unwrap();
        cert.der().to_vec()
    }

    #[test]
    fn legal_sae_id_accepted_from_common_name() {
        let resolver = CertificateResolver::new(None).unwrap();
        let der = test_cert("SLAVE00000000001");
        let verified = VerifiedCertificate {
            der,
            mode: ClientAuthMode::DirectMutualTls,
        };
        let sae_id = resolver.resolve(&verified).unwrap();
        assert_eq!(sae_id, "SLAVE00000000001");
    }

    #[test]
    fn resolution_is_cached_by_fingerprint() {
        let resolver = CertificateResolver::new(None).unwrap();
        let der = test_cert("MASTER0000000001");
        let verified = VerifiedCertificate {
            der,
            mode: ClientAuthMode::DirectMutualTls,
        };
        let first = resolver.resolve(&verified).unwrap();
        let second = resolver.resolve(&verified).unwrap();
        assert_eq!(first, second);
        assert_eq!(resolver.fingerprint_cache.len(), 1);
    }

    #[test]
    fn illegal_common_name_without_san_pattern_fails() {
        let resolver = CertificateResolver::new(None).unwrap();
        let der = test_cert("not a legal sae id!!");
        let verified = VerifiedCertificate {
            der,
            mode: ClientAuthMode::DirectMutualTls,
        };
        let err = resolver.resolve(&verified).unwrap_err();
        assert!(matches!(err, KmeError::AuthenticationError(_)));
    }
}
