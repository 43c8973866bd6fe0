//! EVSE PKI - Certificate Lifecycle and TLS Trust-Chain Management
//!
//! This library manages the certificate stores of an EV charging station and
//! the TLS connections built on top of them: the trust anchors for the
//! backend (CSMS), vehicle (ISO 15118 / V2G), manufacturer and mobility
//! operator PKIs, the station's own leaf certificates and private keys, OCSP
//! material, and a caller-driven non-blocking TLS server/client pair.
//!
//! # Overview
//!
//! ```text
//! SecurityManager (lifecycle operations)
//!   ├── CertificateBundle (one per CA category / leaf directory)
//!   │     └── CertificateHierarchy (issuer trees, rebuilt per query)
//!   ├── key resolution (certificate -> private key file)
//!   └── OCSP cache (responses stored beside certificates)
//!
//! tls::Server / tls::Client
//!   └── tls::Connection (per-socket handshake/read/write state machine)
//! ```
//!
//! Certificates are addressed by their **hash data** - the
//! {issuer-name-hash, issuer-key-hash, serial-number} triple - independent of
//! encoding or storage location, which is also the identifier external
//! management protocols use for install/delete/OCSP requests.
//!
//! # Quick Start
//!
//! ```no_run
//! use evse_pki::security::{SecurityManager, SecurityOptions, StorePaths};
//! use evse_pki::types::CaCategory;
//!
//! # fn main() -> anyhow::Result<()> {
//! let paths = StorePaths {
//!     csms_ca_bundle: "certs/ca/csms/CSMS_ROOT_CA.pem".into(),
//!     mf_ca_bundle: "certs/ca/mf/MF_ROOT_CA.pem".into(),
//!     mo_ca_bundle: "certs/ca/mo/MO_ROOT_CA.pem".into(),
//!     v2g_ca_bundle: "certs/ca/v2g/V2G_ROOT_CA.pem".into(),
//!     csms_leaf_cert_dir: "certs/client/csms".into(),
//!     csms_leaf_key_dir: "certs/client/csms".into(),
//!     secc_leaf_cert_dir: "certs/client/cso".into(),
//!     secc_leaf_key_dir: "certs/client/cso".into(),
//! };
//!
//! let mut security = SecurityManager::new(paths, SecurityOptions::default())?;
//!
//! let pem = std::fs::read_to_string("new_root.pem")?;
//! let result = security.install_ca_certificate(&pem, CaCategory::Csms);
//! println!("install: {result:?}");
//! # Ok(())
//! # }
//! ```
//!
//! # Concurrency
//!
//! The certificate side provides no internal locking: callers serialize
//! lifecycle operations against the same store. On the TLS side each
//! [`tls::Connection`] is an independent state machine with single-reader /
//! single-writer semantics; the server dispatches accepted connections to a
//! bounded worker pool and can suspend/update its configuration while
//! established connections keep running.

pub mod bundle;
pub mod certificate;
pub mod fs_utils;
pub mod hierarchy;
pub mod keys;
pub mod ocsp;
pub mod security;
pub mod tls;
pub mod types;

#[cfg(test)]
pub(crate) mod test_support;

pub use bundle::{BundleSource, CertificateBundle};
pub use certificate::Certificate;
pub use hierarchy::{CertificateHierarchy, CertificateNode};
pub use security::{SecurityManager, SecurityOptions, StorePaths};
pub use types::{
    CaCategory, CertificateHashData, CertificateKind, DeleteResult, EncodingFormat, InstallResult,
    KeyPairResult, KeyPairStatus, LeafRole, ValidationResult,
};
