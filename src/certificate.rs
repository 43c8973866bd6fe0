//! X.509 certificate wrapper
//!
//! Wraps an `openssl::x509::X509` together with the file it was loaded from
//! (when any) and derives the hash-data triple used everywhere else as the
//! certificate's identity. Parsing, signature checks and name handling are
//! delegated to the crypto library; this module only decides what a
//! certificate *means* to the store.

use std::path::{Path, PathBuf};

use openssl::nid::Nid;
use openssl::x509::X509;
use sha2::{Digest, Sha256};

use crate::types::{CertError, CertificateHashData, EncodingFormat};

/// A parsed certificate plus its optional backing file.
#[derive(Debug, Clone)]
pub struct Certificate {
    x509: X509,
    path: Option<PathBuf>,
}

impl Certificate {
    pub fn new(x509: X509) -> Self {
        Self { x509, path: None }
    }

    pub fn with_path(x509: X509, path: &Path) -> Self {
        Self {
            x509,
            path: Some(path.to_path_buf()),
        }
    }

    /// Parse one or more certificates from raw bytes.
    ///
    /// PEM input may concatenate multiple certificates; DER carries exactly
    /// one. Returns `Load` when nothing parseable is found.
    pub fn parse_many(data: &[u8], encoding: EncodingFormat) -> Result<Vec<Certificate>, CertError> {
        let parsed = match encoding {
            EncodingFormat::Pem => X509::stack_from_pem(data),
            EncodingFormat::Der => X509::from_der(data).map(|c| vec![c]),
        };

        match parsed {
            Ok(certs) if !certs.is_empty() => Ok(certs.into_iter().map(Certificate::new).collect()),
            Ok(_) => Err(CertError::Load {
                path: PathBuf::new(),
                reason: "no certificate in input".to_string(),
            }),
            Err(e) => Err(CertError::Load {
                path: PathBuf::new(),
                reason: e.to_string(),
            }),
        }
    }

    /// Parse a single certificate; fails if the input holds none.
    pub fn parse(data: &[u8], encoding: EncodingFormat) -> Result<Certificate, CertError> {
        Ok(Self::parse_many(data, encoding)?.remove(0))
    }

    pub fn x509(&self) -> &X509 {
        &self.x509
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn set_path(&mut self, path: &Path) {
        self.path = Some(path.to_path_buf());
    }

    pub fn common_name(&self) -> Option<String> {
        self.x509
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|e| e.data().as_utf8().ok())
            .map(|s| s.to_string())
    }

    pub fn subject_der(&self) -> Result<Vec<u8>, CertError> {
        Ok(self.x509.subject_name().to_der()?)
    }

    pub fn issuer_der(&self) -> Result<Vec<u8>, CertError> {
        Ok(self.x509.issuer_name().to_der()?)
    }

    /// Subject and issuer are the same name and the signature verifies with
    /// the certificate's own key.
    pub fn is_self_signed(&self) -> bool {
        let same_name = match (self.subject_der(), self.issuer_der()) {
            (Ok(s), Ok(i)) => s == i,
            _ => false,
        };
        if !same_name {
            return false;
        }

        self.x509
            .public_key()
            .and_then(|key| self.x509.verify(&key))
            .unwrap_or(false)
    }

    /// True when `issuer` directly issued this certificate: name linkage plus
    /// an actual signature check, so two CAs with the same subject cannot be
    /// confused.
    pub fn is_issued_by(&self, issuer: &Certificate) -> bool {
        let names_link = match (self.issuer_der(), issuer.subject_der()) {
            (Ok(i), Ok(s)) => i == s,
            _ => false,
        };
        if !names_link {
            return false;
        }

        issuer
            .x509
            .public_key()
            .and_then(|key| self.x509.verify(&key))
            .unwrap_or(false)
    }

    /// Seconds elapsed since `notBefore`; negative for not-yet-valid
    /// certificates.
    pub fn age_seconds(&self) -> i64 {
        time_from(self.x509.not_before()).unwrap_or(i64::MIN)
    }

    /// Seconds until `notAfter`; negative for expired certificates.
    pub fn expires_in_seconds(&self) -> i64 {
        -time_from(self.x509.not_after()).unwrap_or(i64::MAX)
    }

    pub fn is_expired(&self) -> bool {
        self.expires_in_seconds() < 0
    }

    /// Currently inside the validity window.
    pub fn is_valid(&self) -> bool {
        self.age_seconds() >= 0 && !self.is_expired()
    }

    /// Serial number as lowercase hex with leading zeros stripped.
    pub fn serial_number(&self) -> Result<String, CertError> {
        let bn = self.x509.serial_number().to_bn()?;
        let mut serial = bn.to_hex_str()?.to_string().to_lowercase();

        let trimmed = serial.trim_start_matches('0');
        serial = if trimmed.is_empty() {
            "0".to_string()
        } else {
            trimmed.to_string()
        };

        Ok(serial)
    }

    /// DER-encoded SubjectPublicKeyInfo.
    pub fn public_key_der(&self) -> Result<Vec<u8>, CertError> {
        Ok(self.x509.public_key()?.public_key_to_der()?)
    }

    /// Hash data with an explicit issuer, as placed in a hierarchy.
    pub fn hash_data_with_issuer(
        &self,
        issuer: &Certificate,
    ) -> Result<CertificateHashData, CertError> {
        Ok(CertificateHashData {
            issuer_name_hash: sha256(&self.issuer_der()?),
            issuer_key_hash: sha256(&issuer.public_key_der()?),
            serial_number: self.serial_number()?,
        })
    }

    /// Hash data using the certificate's own key as the issuer key.
    ///
    /// Exact for self-signed certificates; for others it serves as the
    /// issuer-independent proxy identity used for store de-duplication. The
    /// hierarchy recomputes the true triple once the issuer is known.
    pub fn proxy_hash_data(&self) -> Result<CertificateHashData, CertError> {
        Ok(CertificateHashData {
            issuer_name_hash: sha256(&self.issuer_der()?),
            issuer_key_hash: sha256(&self.public_key_der()?),
            serial_number: self.serial_number()?,
        })
    }

    /// Same logical certificate, independent of encoding and storage.
    pub fn same_certificate(&self, other: &Certificate) -> bool {
        match (self.proxy_hash_data(), other.proxy_hash_data()) {
            (Ok(a), Ok(b)) => a == b,
            _ => false,
        }
    }

    /// OCSP responder endpoint from the authority-information-access
    /// extension, if the certificate carries one.
    pub fn responder_url(&self) -> Option<String> {
        let access = self.x509.authority_info()?;
        for entry in access.iter() {
            if entry.method().nid() == Nid::AD_OCSP {
                if let Some(uri) = entry.location().uri() {
                    return Some(uri.to_string());
                }
            }
        }
        None
    }

    /// PEM export, trailing newline included.
    pub fn export_pem(&self) -> Result<Vec<u8>, CertError> {
        Ok(self.x509.to_pem()?)
    }
}

impl PartialEq for Certificate {
    fn eq(&self, other: &Self) -> bool {
        self.same_certificate(other)
    }
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Seconds from `t` to now; positive when `t` lies in the past.
fn time_from(t: &openssl::asn1::Asn1TimeRef) -> Option<i64> {
    let now = openssl::asn1::Asn1Time::days_from_now(0).ok()?;
    let diff = t.diff(&now).ok()?;
    Some(i64::from(diff.days) * 86_400 + i64::from(diff.secs))
}
