//! Handshake extension support
//!
//! Three concerns live here: the in-memory cache of DER OCSP responses used
//! for stapling, the precedence rule between the status_request and
//! status_request_v2 extensions, and the RFC 6066 `trusted_ca_keys` wire
//! codec the client sends and the server matches chains against.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use openssl::ex_data::Index;
use openssl::hash::{hash, MessageDigest};
use openssl::ssl::Ssl;
use openssl::x509::X509;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::certificate::Certificate;
use crate::types::CertError;

// ----------------------------------------------------------------------------
// OCSP staple cache

/// Cache of OCSP responses keyed by a digest of the certificate they vouch
/// for. Responses can be swapped at any time via [`OcspStapleCache::load`],
/// which is how certificate rotation refreshes staples without a restart.
#[derive(Default)]
pub struct OcspStapleCache {
    cache: Mutex<HashMap<[u8; 32], Vec<u8>>>,
}

impl OcspStapleCache {
    /// Digest identifying a certificate inside the cache: SHA-256 over the
    /// certificate's signature bytes, cheap and collision-free for the
    /// handful of chain certificates a server presents.
    pub fn digest(certificate: &X509) -> Option<[u8; 32]> {
        let signature = certificate.signature().as_slice();
        if signature.is_empty() {
            return None;
        }
        let mut hasher = Sha256::new();
        hasher.update(signature);
        Some(hasher.finalize().into())
    }

    /// Replace the cache content. Entries whose response file cannot be read
    /// are dropped and reported through the return value.
    pub fn load(&self, entries: &[([u8; 32], PathBuf)]) -> bool {
        let mut updated = HashMap::new();
        let mut complete = true;

        for (digest, file) in entries {
            match std::fs::read(file) {
                Ok(der) => {
                    updated.insert(*digest, der);
                }
                Err(e) => {
                    warn!(file = %file.display(), error = %e, "could not load OCSP response");
                    complete = false;
                }
            }
        }

        *self.cache.lock().unwrap() = updated;
        complete
    }

    pub fn clear(&self) {
        self.cache.lock().unwrap().clear();
    }

    pub fn lookup(&self, digest: &[u8; 32]) -> Option<Vec<u8>> {
        self.cache.lock().unwrap().get(digest).cloned()
    }
}

// ----------------------------------------------------------------------------
// status_request / status_request_v2 precedence

/// Per-connection handshake state recorded by the extension callbacks,
/// attached to the `Ssl` via ex-data.
#[derive(Default)]
pub struct HandshakeFlags {
    pub status_request_v2: AtomicBool,
    pub trusted_ca_keys_seen: AtomicBool,
}

impl HandshakeFlags {
    pub fn saw_status_request_v2(&self) -> bool {
        self.status_request_v2.load(Ordering::Relaxed)
    }

    pub fn saw_trusted_ca_keys(&self) -> bool {
        self.trusted_ca_keys_seen.load(Ordering::Relaxed)
    }
}

/// Ex-data slot carrying the flags; allocated once per process.
pub fn flags_index() -> Index<Ssl, Arc<HandshakeFlags>> {
    static INDEX: OnceLock<Index<Ssl, Arc<HandshakeFlags>>> = OnceLock::new();
    *INDEX.get_or_init(|| {
        Ssl::new_ex_index::<Arc<HandshakeFlags>>().expect("ex-data index allocation")
    })
}

/// Whether a status_request (v1) staple may be sent.
///
/// When the client requested status_request_v2 as well, v2 takes precedence
/// and the v1 response is withheld, except on TLS 1.3 where
/// status_request_v2 is deprecated and v1 remains the only channel.
pub fn should_staple_v1(v2_requested: bool, tls13_session: bool) -> bool {
    !v2_requested || tls13_session
}

// ----------------------------------------------------------------------------
// trusted_ca_keys (RFC 6066 section 6)

const IDENTIFIER_PRE_AGREED: u8 = 0;
const IDENTIFIER_KEY_SHA1_HASH: u8 = 1;
const IDENTIFIER_X509_NAME: u8 = 2;
const IDENTIFIER_CERT_SHA1_HASH: u8 = 3;

const SHA1_LEN: usize = 20;

/// Decoded `trusted_ca_keys` payload, also used to configure what a client
/// advertises.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrustedCaKeysData {
    pub pre_agreed: bool,
    pub key_sha1_hashes: Vec<[u8; SHA1_LEN]>,
    pub cert_sha1_hashes: Vec<[u8; SHA1_LEN]>,
    /// DER-encoded X.500 subject names.
    pub x509_names: Vec<Vec<u8>>,
}

impl TrustedCaKeysData {
    pub fn is_empty(&self) -> bool {
        !self.pre_agreed
            && self.key_sha1_hashes.is_empty()
            && self.cert_sha1_hashes.is_empty()
            && self.x509_names.is_empty()
    }

    /// Advertise the given trust anchors by certificate hash.
    pub fn from_certificates(anchors: &[Certificate]) -> Result<Self, CertError> {
        let mut data = TrustedCaKeysData::default();
        for anchor in anchors {
            data.cert_sha1_hashes.push(certificate_sha1(anchor)?);
        }
        Ok(data)
    }

    /// Encode as the extension payload: a 16-bit length-prefixed list of
    /// TrustedAuthority entries.
    pub fn encode(&self) -> Vec<u8> {
        let mut list = Vec::new();

        if self.pre_agreed {
            list.push(IDENTIFIER_PRE_AGREED);
        }
        for hash in &self.key_sha1_hashes {
            list.push(IDENTIFIER_KEY_SHA1_HASH);
            list.extend_from_slice(hash);
        }
        for name in &self.x509_names {
            list.push(IDENTIFIER_X509_NAME);
            list.extend_from_slice(&(name.len() as u16).to_be_bytes());
            list.extend_from_slice(name);
        }
        for hash in &self.cert_sha1_hashes {
            list.push(IDENTIFIER_CERT_SHA1_HASH);
            list.extend_from_slice(hash);
        }

        let mut out = Vec::with_capacity(list.len() + 2);
        out.extend_from_slice(&(list.len() as u16).to_be_bytes());
        out.extend_from_slice(&list);
        out
    }

    /// Decode an extension payload. Returns None on malformed input.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 2 {
            return None;
        }
        let declared = u16::from_be_bytes([payload[0], payload[1]]) as usize;
        let mut rest = &payload[2..];
        if rest.len() != declared {
            return None;
        }

        let mut data = TrustedCaKeysData::default();
        while !rest.is_empty() {
            let identifier = rest[0];
            rest = &rest[1..];

            match identifier {
                IDENTIFIER_PRE_AGREED => data.pre_agreed = true,
                IDENTIFIER_KEY_SHA1_HASH | IDENTIFIER_CERT_SHA1_HASH => {
                    if rest.len() < SHA1_LEN {
                        return None;
                    }
                    let mut digest = [0u8; SHA1_LEN];
                    digest.copy_from_slice(&rest[..SHA1_LEN]);
                    rest = &rest[SHA1_LEN..];
                    if identifier == IDENTIFIER_KEY_SHA1_HASH {
                        data.key_sha1_hashes.push(digest);
                    } else {
                        data.cert_sha1_hashes.push(digest);
                    }
                }
                IDENTIFIER_X509_NAME => {
                    if rest.len() < 2 {
                        return None;
                    }
                    let len = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                    rest = &rest[2..];
                    if rest.len() < len {
                        return None;
                    }
                    data.x509_names.push(rest[..len].to_vec());
                    rest = &rest[len..];
                }
                _ => return None,
            }
        }

        Some(data)
    }

    /// Whether any of the given trust anchors satisfies this request.
    pub fn matches_any(&self, anchors: &[Certificate]) -> bool {
        if self.pre_agreed {
            return true;
        }

        for anchor in anchors {
            if let Ok(digest) = certificate_sha1(anchor) {
                if self.cert_sha1_hashes.contains(&digest) {
                    return true;
                }
            }
            if let Ok(digest) = public_key_sha1(anchor) {
                if self.key_sha1_hashes.contains(&digest) {
                    return true;
                }
            }
            if let Ok(subject) = anchor.subject_der() {
                if self.x509_names.iter().any(|n| *n == subject) {
                    return true;
                }
            }
        }
        false
    }
}

/// SHA-1 over the DER certificate, as mandated by the extension format.
fn certificate_sha1(certificate: &Certificate) -> Result<[u8; SHA1_LEN], CertError> {
    let der = certificate.x509().to_der()?;
    let digest = hash(MessageDigest::sha1(), &der)?;
    let mut out = [0u8; SHA1_LEN];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// SHA-1 over the DER SubjectPublicKeyInfo.
fn public_key_sha1(certificate: &Certificate) -> Result<[u8; SHA1_LEN], CertError> {
    let der = certificate.public_key_der()?;
    let digest = hash(MessageDigest::sha1(), &der)?;
    let mut out = [0u8; SHA1_LEN];
    out.copy_from_slice(&digest);
    Ok(out)
}

/// Load the trust anchors of a chain config file for matching.
pub fn load_trust_anchors(path: &Path) -> Vec<Certificate> {
    match crate::bundle::CertificateBundle::from_path(path, crate::types::EncodingFormat::Pem) {
        Ok(bundle) => bundle.split(),
        Err(e) => {
            debug!(file = %path.display(), error = %e, "could not load trust anchors");
            Vec::new()
        }
    }
}

/// status_request_v2 ClientHello payload: one ocsp_multi item with empty
/// responder list and empty extensions.
pub const STATUS_REQUEST_V2_CLIENT_PAYLOAD: [u8; 9] =
    [0x00, 0x07, 0x02, 0x00, 0x04, 0x00, 0x00, 0x00, 0x00];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ca_cert;

    #[test]
    fn test_v1_staple_precedence() {
        // v2 requested on TLS 1.2: v2 wins, no v1 staple.
        assert!(!should_staple_v1(true, false));
        // v2 requested on TLS 1.3: v2 is deprecated there, v1 staples.
        assert!(should_staple_v1(true, true));
        // v2 absent: v1 staples regardless of protocol version.
        assert!(should_staple_v1(false, false));
        assert!(should_staple_v1(false, true));
    }

    #[test]
    fn test_trusted_ca_keys_codec_round_trip() {
        let data = TrustedCaKeysData {
            pre_agreed: true,
            key_sha1_hashes: vec![[0x11; 20]],
            cert_sha1_hashes: vec![[0x22; 20], [0x33; 20]],
            x509_names: vec![vec![0x30, 0x03, 0x31, 0x01, 0x00]],
        };

        let encoded = data.encode();
        let decoded = TrustedCaKeysData::decode(&encoded).unwrap();
        assert_eq!(decoded, data);
    }

    #[test]
    fn test_trusted_ca_keys_rejects_malformed() {
        assert!(TrustedCaKeysData::decode(&[]).is_none());
        // Declared length beyond the payload.
        assert!(TrustedCaKeysData::decode(&[0x00, 0x10, 0x00]).is_none());
        // Truncated hash entry.
        assert!(TrustedCaKeysData::decode(&[0x00, 0x03, 0x01, 0xaa, 0xbb]).is_none());
        // Unknown identifier.
        assert!(TrustedCaKeysData::decode(&[0x00, 0x01, 0x07]).is_none());
    }

    #[test]
    fn test_trusted_ca_keys_matches_cert_and_key_hash() {
        let (anchor, _) = ca_cert("TCK Root", None, 365).unwrap();
        let (other, _) = ca_cert("TCK Other", None, 365).unwrap();

        let by_cert = TrustedCaKeysData::from_certificates(std::slice::from_ref(&anchor)).unwrap();
        assert!(by_cert.matches_any(&[anchor.clone()]));
        assert!(!by_cert.matches_any(&[other.clone()]));

        let by_key = TrustedCaKeysData {
            key_sha1_hashes: vec![public_key_sha1(&anchor).unwrap()],
            ..Default::default()
        };
        assert!(by_key.matches_any(&[other.clone(), anchor.clone()]));

        let by_name = TrustedCaKeysData {
            x509_names: vec![anchor.subject_der().unwrap()],
            ..Default::default()
        };
        assert!(by_name.matches_any(&[anchor.clone()]));

        let pre_agreed = TrustedCaKeysData {
            pre_agreed: true,
            ..Default::default()
        };
        assert!(pre_agreed.matches_any(&[other]));
    }

    #[test]
    fn test_staple_cache_load_and_lookup() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, _) = ca_cert("Staple Root", None, 365).unwrap();
        let digest = OcspStapleCache::digest(cert.x509()).unwrap();

        let response_file = dir.path().join("root.ocsp.der");
        std::fs::write(&response_file, b"\x30\x05ocsp").unwrap();

        let cache = OcspStapleCache::default();
        assert!(cache.load(&[(digest, response_file)]));
        assert_eq!(cache.lookup(&digest).unwrap(), b"\x30\x05ocsp");

        // Missing file drops the entry and reports incompleteness.
        assert!(!cache.load(&[(digest, dir.path().join("missing.der"))]));
        assert!(cache.lookup(&digest).is_none());
    }
}
