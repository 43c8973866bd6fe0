//! OCSP cache
//!
//! OCSP responses are persisted next to the certificate they belong to, in an
//! `ocsp/` folder sibling to the certificate file, named after the
//! certificate's file stem: `<stem>.ocsp.der`, raw DER bytes. Certificates
//! without a backing file cannot cache responses.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::certificate::Certificate;
use crate::hierarchy::CertificateHierarchy;
use crate::types::{CertificateHashData, OcspRequestData};

/// Cache file location for a certificate, or None for in-memory certificates.
pub fn cache_path_for(certificate: &Certificate) -> Option<PathBuf> {
    let cert_path = certificate.path()?;
    let parent = cert_path.parent()?;
    let stem = cert_path.file_stem()?;

    let mut name = stem.to_os_string();
    name.push(".ocsp.der");
    Some(parent.join("ocsp").join(name))
}

/// Pending OCSP requests for a leaf chain.
///
/// Builds the hierarchy from the trust-anchor set plus the leaf chain, walks
/// the descendants of the first valid self-signed root and collects each
/// certificate's hash data together with its responder endpoint. Certificates
/// without an embedded responder URL are skipped (logged, not fatal);
/// duplicate hashes are reported once.
pub fn request_data(
    trust_anchors: Vec<Certificate>,
    leaf_chain: Vec<Certificate>,
) -> Vec<OcspRequestData> {
    let hierarchy = CertificateHierarchy::build_with_leaves(trust_anchors, leaf_chain);
    let mut requests: Vec<OcspRequestData> = Vec::new();

    for root in hierarchy.roots() {
        if !(root.certificate.is_self_signed() && root.certificate.is_valid()) {
            continue;
        }

        let mut any = false;
        CertificateHierarchy::for_each_descendant(root, &mut |node, _| {
            any = true;
            match node.certificate.responder_url() {
                Some(url) => {
                    let duplicate = requests
                        .iter()
                        .any(|r| r.certificate_hash_data.matches(&node.hash));
                    if !duplicate {
                        requests.push(OcspRequestData {
                            certificate_hash_data: node.hash.clone(),
                            responder_url: url,
                        });
                    }
                }
                None => {
                    debug!(
                        subject = node.certificate.common_name().unwrap_or_default(),
                        "certificate carries no OCSP responder URL"
                    );
                }
            }
        });

        // A root with actual descendants settles the chain; otherwise keep
        // looking for a better root.
        if any {
            break;
        }
    }

    requests
}

/// Persist an OCSP response for the certificate identified by `hash`.
///
/// Silently does nothing (beyond logging) when no certificate matches or the
/// match has no on-disk file.
pub fn update_cache(hierarchy: &CertificateHierarchy, hash: &CertificateHashData, response: &[u8]) {
    let certificate = match hierarchy.find_certificate(hash) {
        Ok(c) => c,
        Err(_) => {
            warn!(%hash, "no certificate matches OCSP cache update");
            return;
        }
    };

    let Some(cache_path) = cache_path_for(certificate) else {
        warn!(%hash, "certificate has no backing file, cannot cache OCSP response");
        return;
    };

    if let Some(dir) = cache_path.parent() {
        if let Err(e) = fs::create_dir_all(dir) {
            warn!(dir = %dir.display(), error = %e, "could not create ocsp directory");
            return;
        }
    }

    match fs::write(&cache_path, response) {
        Ok(()) => debug!(file = %cache_path.display(), "OCSP response cached"),
        Err(e) => warn!(file = %cache_path.display(), error = %e, "could not write OCSP response"),
    }
}

/// Path of the cached response for `hash`, when one exists on disk.
pub fn retrieve_cache(
    hierarchy: &CertificateHierarchy,
    hash: &CertificateHashData,
) -> Option<PathBuf> {
    let certificate = hierarchy.find_certificate(hash).ok()?;
    let cache_path = cache_path_for(certificate)?;
    cache_path.exists().then_some(cache_path)
}

/// Cached response files under `cert_dir/ocsp` whose certificate file no
/// longer exists. Consumed by garbage collection.
pub fn stale_cache_files(cert_dir: &Path) -> Vec<PathBuf> {
    let ocsp_dir = cert_dir.join("ocsp");
    let Ok(entries) = crate::fs_utils::sorted_files(&ocsp_dir) else {
        return Vec::new();
    };

    let mut stale = Vec::new();
    for file in entries {
        let name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
        let Some(stem) = name.strip_suffix(".ocsp.der") else {
            continue;
        };

        let still_owned = crate::fs_utils::sorted_files(cert_dir)
            .map(|certs| {
                certs.iter().any(|c| {
                    c.file_stem()
                        .and_then(|s| s.to_str())
                        .map(|s| s == stem)
                        .unwrap_or(false)
                })
            })
            .unwrap_or(false);

        if !still_owned {
            stale.push(file);
        }
    }
    stale
}
