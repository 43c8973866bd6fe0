//! Private-key resolution and CSR generation
//!
//! A leaf certificate's key lives somewhere in the role's key directory under
//! a filename the store does not control. Resolution probes candidate `.key`
//! files against the certificate's public key; the scan order is
//! lexicographic so the result does not depend on filesystem iteration order.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::symm::Cipher;
use openssl::x509::{X509Name, X509Req};
use secrecy::{ExposeSecret, Secret};
use tracing::{debug, warn};

use crate::certificate::Certificate;
use crate::fs_utils;
use crate::types::CertError;

/// Extension identifying private key files inside a key directory.
pub const KEY_EXTENSION: &str = "key";

pub fn is_key_file(path: &Path) -> bool {
    path.is_file()
        && path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case(KEY_EXTENSION))
            .unwrap_or(false)
}

/// Parse a private key, decrypting with `password` when one is configured.
fn load_private_key(
    data: &[u8],
    password: Option<&Secret<String>>,
) -> Result<PKey<Private>, CertError> {
    let key = match password {
        Some(pass) => {
            PKey::private_key_from_pem_passphrase(data, pass.expose_secret().as_bytes())?
        }
        None => PKey::private_key_from_pem(data)?,
    };
    Ok(key)
}

fn key_matches(
    certificate: &Certificate,
    key_path: &Path,
    password: Option<&Secret<String>>,
) -> bool {
    let data = match fs::read(key_path) {
        Ok(d) => d,
        Err(e) => {
            warn!(key = %key_path.display(), error = %e, "could not read candidate key");
            return false;
        }
    };

    let key = match load_private_key(&data, password) {
        Ok(k) => k,
        Err(e) => {
            // Corrupt or wrongly encrypted candidates do not abort the scan.
            warn!(key = %key_path.display(), error = %e, "could not parse candidate key");
            return false;
        }
    };

    certificate
        .x509()
        .public_key()
        .map(|public| public.public_eq(&key))
        .unwrap_or(false)
}

/// Find the private key belonging to `certificate` inside `key_dir`.
///
/// The certificate's own filename with a `.key` extension is probed first as a
/// fast path, then every key file in lexicographic order. Fails with
/// `NoPrivateKey` once all candidates are exhausted.
pub fn resolve_private_key(
    certificate: &Certificate,
    key_dir: &Path,
    password: Option<&Secret<String>>,
) -> Result<PathBuf, CertError> {
    if let Some(cert_path) = certificate.path() {
        let sibling = cert_path.with_extension(KEY_EXTENSION);
        if sibling.exists() && key_matches(certificate, &sibling, password) {
            debug!(key = %sibling.display(), "key resolved via certificate filename");
            return Ok(sibling);
        }
    }

    let candidates = fs_utils::sorted_files(key_dir).map_err(|e| CertError::Load {
        path: key_dir.to_path_buf(),
        reason: e.to_string(),
    })?;

    for candidate in candidates.iter().filter(|p| is_key_file(p)) {
        if key_matches(certificate, candidate, password) {
            debug!(key = %candidate.display(), "key resolved via directory scan");
            return Ok(candidate.clone());
        }
    }

    Err(CertError::NoPrivateKey(key_dir.to_path_buf()))
}

/// Certificate files under `cert_dir` containing a certificate that matches
/// the private key at `key_path`. Used by garbage collection to tell orphaned
/// keys from paired ones; a key can match several files when the leaf exists
/// both alone and inside a chain file.
pub fn certificate_files_of_key(
    key_path: &Path,
    cert_dir: &Path,
    password: Option<&Secret<String>>,
) -> Result<BTreeSet<PathBuf>, CertError> {
    let data = fs::read(key_path)?;
    let key = load_private_key(&data, password)?;

    let bundle =
        crate::bundle::CertificateBundle::from_path(cert_dir, crate::types::EncodingFormat::Pem)?;

    let mut matches = BTreeSet::new();
    for cert in bundle.certificates() {
        let paired = cert
            .x509()
            .public_key()
            .map(|public| public.public_eq(&key))
            .unwrap_or(false);
        if paired {
            if let Some(path) = cert.path() {
                matches.insert(path.to_path_buf());
            }
        }
    }

    if matches.is_empty() {
        return Err(CertError::NoValidCertificate);
    }
    Ok(matches)
}

/// Subject fields for a certificate signing request.
pub struct CsrInfo<'a> {
    pub country: &'a str,
    pub organization: &'a str,
    pub common_name: &'a str,
}

/// Generate an EC P-256 key at `key_path` and return a PEM CSR for it.
///
/// The key is written before the CSR is returned so a crash between the two
/// leaves a resolvable key rather than an unusable CSR. Encrypted with
/// AES-128-CBC when a password is configured; file mode 0600 on unix.
pub fn generate_csr(
    info: &CsrInfo<'_>,
    key_path: &Path,
    password: Option<&Secret<String>>,
) -> Result<String, CertError> {
    let mut group = openssl::ec::EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    group.set_asn1_flag(openssl::ec::Asn1Flag::NAMED_CURVE);
    let key = PKey::from_ec_key(openssl::ec::EcKey::generate(&group)?)?;

    let pem = match password {
        Some(pass) => key.private_key_to_pem_pkcs8_passphrase(
            Cipher::aes_128_cbc(),
            pass.expose_secret().as_bytes(),
        )?,
        None => key.private_key_to_pem_pkcs8()?,
    };
    fs::write(key_path, pem)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(key_path, fs::Permissions::from_mode(0o600))?;
    }

    let mut name = X509Name::builder()?;
    name.append_entry_by_nid(Nid::COUNTRYNAME, info.country)?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, info.organization)?;
    name.append_entry_by_nid(Nid::COMMONNAME, info.common_name)?;
    let name = name.build();

    let mut builder = X509Req::builder()?;
    builder.set_version(0)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(&key)?;
    builder.sign(&key, MessageDigest::sha256())?;

    let csr = builder.build().to_pem()?;
    Ok(String::from_utf8_lossy(&csr).into_owned())
}
