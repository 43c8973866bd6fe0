//! Shared vocabulary of the PKI subsystem
//!
//! Certificate categories and roles, the typed results returned by the
//! lifecycle operations, and the hash-data identifier used to address a
//! certificate independently of where it is stored.

use std::fmt;
use std::path::PathBuf;

use secrecy::Secret;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// CA trust-store categories, one on-disk bundle (file or directory) each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum CaCategory {
    /// Backend (charging-station management system) roots.
    Csms,
    /// Manufacturer roots, used for firmware-update validation.
    Mf,
    /// Mobility-operator roots (contract certificates).
    Mo,
    /// Charging-infrastructure (ISO 15118) roots.
    V2g,
}

impl CaCategory {
    pub const ALL: [CaCategory; 4] = [
        CaCategory::Csms,
        CaCategory::Mf,
        CaCategory::Mo,
        CaCategory::V2g,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CaCategory::Csms => "CSMS",
            CaCategory::Mf => "MF",
            CaCategory::Mo => "MO",
            CaCategory::V2g => "V2G",
        }
    }
}

impl fmt::Display for CaCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Leaf-certificate roles.
///
/// Only `Csms` and `V2g` leafs are managed on disk (certificate + key
/// directories); `Mf` and `Mo` exist for chain verification of
/// externally-presented certificates and are rejected by key-pair and
/// install operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LeafRole {
    /// TLS client identity towards the backend.
    Csms,
    /// SECC identity towards the vehicle (TLS server for ISO 15118).
    V2g,
    /// Manufacturer certificates (firmware signing).
    Mf,
    /// Mobility-operator contract certificates.
    Mo,
}

impl LeafRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            LeafRole::Csms => "CSMS",
            LeafRole::V2g => "SECC",
            LeafRole::Mf => "MF",
            LeafRole::Mo => "MO",
        }
    }

    /// CA category holding the trust anchors for this role.
    pub fn ca_category(&self) -> CaCategory {
        match self {
            LeafRole::Csms => CaCategory::Csms,
            LeafRole::V2g => CaCategory::V2g,
            LeafRole::Mf => CaCategory::Mf,
            LeafRole::Mo => CaCategory::Mo,
        }
    }
}

impl fmt::Display for LeafRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Certificate kinds addressable through [`get_installed_certificates`].
///
/// [`get_installed_certificates`]: crate::security::SecurityManager::get_installed_certificates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CertificateKind {
    CsmsRoot,
    MfRoot,
    MoRoot,
    V2gRoot,
    /// The active V2G leaf chain, reported leaf-first with the CA bundle merged in.
    V2gCertificateChain,
}

impl CertificateKind {
    pub fn ca_category(&self) -> Option<CaCategory> {
        match self {
            CertificateKind::CsmsRoot => Some(CaCategory::Csms),
            CertificateKind::MfRoot => Some(CaCategory::Mf),
            CertificateKind::MoRoot => Some(CaCategory::Mo),
            CertificateKind::V2gRoot => Some(CaCategory::V2g),
            CertificateKind::V2gCertificateChain => None,
        }
    }
}

/// Supported certificate encodings for load and key-pair queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodingFormat {
    Pem,
    Der,
}

/// Result of installing or updating a certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallResult {
    Accepted,
    InvalidFormat,
    InvalidCertificateChain,
    Expired,
    InvalidSignature,
    NoRootCertificateInstalled,
    WriteError,
    StoreLimitReached,
}

/// Result of validating a certificate chain against a trust store.
///
/// Every underlying library error code maps to exactly one of these; codes
/// without a dedicated variant collapse into [`ValidationResult::InvalidChain`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationResult {
    Valid,
    Expired,
    InvalidSignature,
    InvalidLeafSignature,
    IssuerNotFound,
    InvalidChain,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteResult {
    Accepted,
    NotFound,
    Failed,
}

/// Status of a leaf key-pair lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyPairStatus {
    Accepted,
    /// The requested role does not support key pairs.
    Rejected,
    /// No leaf certificate at all for the role.
    NotFound,
    /// Leaf certificates exist but none is currently valid.
    NotFoundValid,
    /// A valid leaf exists but no private key on disk matches it.
    PrivateKeyNotFound,
}

/// File references for a resolved leaf certificate and its private key.
///
/// `certificate_chain_path` points at the file holding the leaf plus any
/// sub-CAs, `certificate_path` at the file holding the leaf alone. Either may
/// be absent; at least one is present when the lookup succeeded.
pub struct KeyPairInfo {
    pub key_path: PathBuf,
    pub certificate_chain_path: Option<PathBuf>,
    pub certificate_path: Option<PathBuf>,
    pub password: Option<Secret<String>>,
}

impl fmt::Debug for KeyPairInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPairInfo")
            .field("key_path", &self.key_path)
            .field("certificate_chain_path", &self.certificate_chain_path)
            .field("certificate_path", &self.certificate_path)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

#[derive(Debug)]
pub struct KeyPairResult {
    pub status: KeyPairStatus,
    pub info: Option<KeyPairInfo>,
}

impl KeyPairResult {
    pub fn status(status: KeyPairStatus) -> Self {
        Self { status, info: None }
    }
}

/// Status of a certificate-signing-request generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrStatus {
    Accepted,
    /// CSR generation is only allowed for the CSMS and V2G leaf roles.
    InvalidRole,
    KeyGenError,
    GenerationError,
}

#[derive(Debug)]
pub struct CsrResult {
    pub status: CsrStatus,
    /// PEM-encoded CSR when `status` is `Accepted`.
    pub csr: Option<String>,
}

mod hex_digest {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], ser: S) -> Result<S::Ok, S::Error> {
        ser.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(de: D) -> Result<[u8; 32], D::Error> {
        let text = String::deserialize(de)?;
        let raw = hex::decode(&text).map_err(serde::de::Error::custom)?;
        raw.try_into()
            .map_err(|_| serde::de::Error::custom("digest must be 32 bytes"))
    }
}

/// Content-addressable certificate identifier.
///
/// SHA-256 over the DER-encoded issuer name, SHA-256 over the issuer's
/// DER-encoded public key, and the serial number as lowercase hex without
/// leading zeros. Two certificates with equal hash data are the same logical
/// certificate regardless of encoding or storage location.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CertificateHashData {
    #[serde(with = "hex_digest")]
    pub issuer_name_hash: [u8; 32],
    #[serde(with = "hex_digest")]
    pub issuer_key_hash: [u8; 32],
    pub serial_number: String,
}

impl CertificateHashData {
    /// Comparison used for external lookups: digests byte-exact, serial
    /// case-insensitive since management protocols differ in hex casing.
    pub fn matches(&self, other: &CertificateHashData) -> bool {
        self.issuer_name_hash == other.issuer_name_hash
            && self.issuer_key_hash == other.issuer_key_hash
            && self
                .serial_number
                .eq_ignore_ascii_case(&other.serial_number)
    }
}

impl fmt::Display for CertificateHashData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}:{}",
            hex::encode(self.issuer_name_hash),
            hex::encode(self.issuer_key_hash),
            self.serial_number
        )
    }
}

/// One root (or leaf, for chain queries) plus the hash data of everything it
/// transitively issued, parent-before-child.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateHashDataChain {
    pub kind: String,
    pub certificate_hash_data: CertificateHashData,
    pub child_certificate_hash_data: Vec<CertificateHashData>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GetInstalledStatus {
    Accepted,
    NotFound,
}

#[derive(Debug)]
pub struct GetInstalledResult {
    pub status: GetInstalledStatus,
    pub chains: Vec<CertificateHashDataChain>,
}

/// A certificate awaiting an OCSP response, with its responder endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OcspRequestData {
    pub certificate_hash_data: CertificateHashData,
    pub responder_url: String,
}

/// Internal error type.
///
/// Never crosses the public manager boundary: operations convert it into the
/// typed result enums above.
#[derive(Debug, Error)]
pub enum CertError {
    #[error("failed to load certificate material from {path}: {reason}")]
    Load { path: PathBuf, reason: String },
    #[error("no certificate matches the given hash data")]
    NotFound,
    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),
    #[error("no currently valid certificate available")]
    NoValidCertificate,
    #[error("invalid operation: {0}")]
    InvalidOperation(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Crypto(#[from] openssl::error::ErrorStack),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_data_serde_round_trip() {
        let hash = CertificateHashData {
            issuer_name_hash: [0xab; 32],
            issuer_key_hash: [0x01; 32],
            serial_number: "1a2b3c".to_string(),
        };

        let json = serde_json::to_string(&hash).unwrap();
        assert!(json.contains(&"ab".repeat(32)));

        let back: CertificateHashData = serde_json::from_str(&json).unwrap();
        assert_eq!(back, hash);
    }

    #[test]
    fn hash_data_rejects_short_digest() {
        let json = r#"{"issuer_name_hash":"abcd","issuer_key_hash":"abcd","serial_number":"1"}"#;
        assert!(serde_json::from_str::<CertificateHashData>(json).is_err());
    }

    #[test]
    fn leaf_role_maps_to_ca_category() {
        assert_eq!(LeafRole::Csms.ca_category(), CaCategory::Csms);
        assert_eq!(LeafRole::V2g.ca_category(), CaCategory::V2g);
    }
}
