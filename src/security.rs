//! Certificate lifecycle manager
//!
//! Orchestrates the store, hierarchy builder and key resolver into the
//! install/update/delete/verify operations exposed to the application layer.
//! Operations are stateless over persistent store state: every call loads the
//! affected bundles fresh from disk, mutates them in memory and exports. No
//! internal locking is provided; callers serialize concurrent lifecycle
//! operations externally.
//!
//! Internal failures surface as typed results, never as panics or raw errors
//! escaping the public API.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use openssl::stack::Stack;
use openssl::x509::store::X509StoreBuilder;
use openssl::x509::verify::X509VerifyFlags;
use openssl::x509::{X509, X509StoreContext};
use secrecy::Secret;
use tracing::{debug, error, info, warn};

use crate::bundle::CertificateBundle;
use crate::certificate::Certificate;
use crate::fs_utils;
use crate::hierarchy::CertificateHierarchy;
use crate::keys::{self, CsrInfo};
use crate::ocsp;
use crate::types::{
    CaCategory, CertError, CertificateHashData, CertificateHashDataChain, CertificateKind,
    CsrResult, CsrStatus, DeleteResult, EncodingFormat, GetInstalledResult, GetInstalledStatus,
    InstallResult, KeyPairInfo, KeyPairResult, KeyPairStatus, LeafRole, OcspRequestData,
    ValidationResult,
};

const PEM_EXTENSION: &str = "pem";

/// On-disk locations of the four CA trust stores and the per-role leaf
/// certificate/key directories. CA stores may be single bundle files or
/// directories; leaf locations must be directories.
#[derive(Debug, Clone)]
pub struct StorePaths {
    pub csms_ca_bundle: PathBuf,
    pub mf_ca_bundle: PathBuf,
    pub mo_ca_bundle: PathBuf,
    pub v2g_ca_bundle: PathBuf,
    pub csms_leaf_cert_dir: PathBuf,
    pub csms_leaf_key_dir: PathBuf,
    pub secc_leaf_cert_dir: PathBuf,
    pub secc_leaf_key_dir: PathBuf,
}

pub struct SecurityOptions {
    /// Password for encrypted private keys, shared across all keys.
    pub private_key_password: Option<Secret<String>>,
    /// Accept CA certificates whose validity starts in the future
    /// (pre-provisioning). Expired certificates are rejected regardless.
    pub accept_future_ca: bool,
    /// Upper bound on certificate-store files before installs are refused.
    pub max_store_entries: usize,
    /// Lifetime of a generated CSR key without a certificate response.
    pub csr_expiry: Duration,
    /// Newest leaf entries kept by garbage collection even when expired,
    /// a safeguard against a badly set system clock.
    pub minimum_leaf_entries: usize,
}

impl Default for SecurityOptions {
    fn default() -> Self {
        Self {
            private_key_password: None,
            accept_future_ca: false,
            max_store_entries: 2000,
            csr_expiry: Duration::from_secs(3600),
            minimum_leaf_entries: 10,
        }
    }
}

pub struct SecurityManager {
    paths: StorePaths,
    options: SecurityOptions,
    /// Keys generated for CSRs awaiting their certificate, with creation time.
    managed_csr: HashMap<PathBuf, Instant>,
}

impl SecurityManager {
    /// Set up the manager, creating missing leaf directories and CA bundle
    /// files (self-healing default layout). Fails when a leaf directory and a
    /// CA bundle point at the same location, which would let garbage
    /// collection eat trust anchors.
    pub fn new(paths: StorePaths, options: SecurityOptions) -> Result<Self, CertError> {
        for dir in [
            &paths.csms_leaf_cert_dir,
            &paths.csms_leaf_key_dir,
            &paths.secc_leaf_cert_dir,
            &paths.secc_leaf_key_dir,
        ] {
            if !dir.exists() {
                warn!(dir = %dir.display(), "leaf directory missing, creating");
            }
            fs_utils::create_if_missing(dir, true).map_err(|e| CertError::Load {
                path: dir.clone(),
                reason: e.to_string(),
            })?;
            if !dir.is_dir() {
                return Err(CertError::InvalidOperation(format!(
                    "{} is not a directory",
                    dir.display()
                )));
            }
        }

        for category in CaCategory::ALL {
            let bundle = ca_bundle_path_of(&paths, category).to_path_buf();
            if !bundle.exists() {
                warn!(bundle = %bundle.display(), %category, "CA bundle missing, creating");
                let as_dir = bundle.extension().is_none();
                fs_utils::create_if_missing(&bundle, as_dir).map_err(|e| CertError::Load {
                    path: bundle.clone(),
                    reason: e.to_string(),
                })?;
            }

            for dir in [
                &paths.csms_leaf_cert_dir,
                &paths.csms_leaf_key_dir,
                &paths.secc_leaf_cert_dir,
                &paths.secc_leaf_key_dir,
            ] {
                if *dir == bundle {
                    return Err(CertError::InvalidOperation(format!(
                        "leaf directory {} overlaps the {} CA bundle",
                        dir.display(),
                        category
                    )));
                }
            }
        }

        Ok(Self {
            paths,
            options,
            managed_csr: HashMap::new(),
        })
    }

    pub fn ca_bundle_path(&self, category: CaCategory) -> &Path {
        ca_bundle_path_of(&self.paths, category)
    }

    /// Certificate and key directories for roles managed on disk.
    fn leaf_dirs(&self, role: LeafRole) -> Option<(&Path, &Path)> {
        match role {
            LeafRole::Csms => Some((&self.paths.csms_leaf_cert_dir, &self.paths.csms_leaf_key_dir)),
            LeafRole::V2g => Some((&self.paths.secc_leaf_cert_dir, &self.paths.secc_leaf_key_dir)),
            LeafRole::Mf | LeafRole::Mo => None,
        }
    }

    // ------------------------------------------------------------------
    // CA installation

    /// Install (or update in place) a CA certificate in the category's
    /// bundle.
    pub fn install_ca_certificate(&mut self, pem: &str, category: CaCategory) -> InstallResult {
        info!(%category, "installing CA certificate");

        if self.store_is_full() {
            error!("certificate store limit reached, refusing install");
            return InstallResult::StoreLimitReached;
        }

        let mut certificate = match Certificate::parse(pem.as_bytes(), EncodingFormat::Pem) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "CA certificate failed to parse");
                return InstallResult::InvalidFormat;
            }
        };

        if certificate.is_expired() {
            warn!("CA certificate is expired");
            return InstallResult::Expired;
        }
        if !certificate.is_valid() && !self.options.accept_future_ca {
            warn!("CA certificate is not yet valid and pre-provisioning is disabled");
            return InstallResult::Expired;
        }

        let bundle_path = self.ca_bundle_path(category).to_path_buf();
        let mut bundle = match CertificateBundle::from_path(&bundle_path, EncodingFormat::Pem) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "could not load CA bundle");
                return InstallResult::InvalidFormat;
            }
        };

        if bundle.is_directory() {
            let prefix = format!("{}_ROOT_", category.as_str());
            match fs_utils::unique_file_in(&bundle_path, &prefix, PEM_EXTENSION) {
                Ok(path) => certificate.set_path(&path),
                Err(e) => {
                    error!(error = %e, "could not allocate certificate filename");
                    return InstallResult::WriteError;
                }
            }
        }

        let stored = if bundle.contains(&certificate) {
            bundle.update_certificate(certificate)
        } else {
            bundle.add_certificate(certificate).is_ok()
        };

        if !stored {
            return InstallResult::WriteError;
        }
        if bundle.export() {
            InstallResult::Accepted
        } else {
            // In-memory state is discarded here; the next operation re-reads
            // whatever subset reached disk.
            InstallResult::WriteError
        }
    }

    // ------------------------------------------------------------------
    // Deletion

    /// Delete the certificate identified by `hash` wherever it lives.
    ///
    /// The hash alone does not reveal the category, so all CA bundles and
    /// both leaf directories are searched. Deleting a CA also removes its
    /// descendants; deleting the CSMS leaf is refused.
    pub fn delete_certificate(&mut self, hash: &CertificateHashData) -> DeleteResult {
        info!(serial = %hash.serial_number, "deleting certificate");

        let mut found = false;
        let mut failed = false;

        for category in CaCategory::ALL {
            let path = self.ca_bundle_path(category).to_path_buf();
            let mut bundle = match CertificateBundle::from_path(&path, EncodingFormat::Pem) {
                Ok(b) => b,
                Err(e) => {
                    warn!(bundle = %path.display(), error = %e, "could not load CA bundle");
                    continue;
                }
            };

            let deleted = bundle.delete_certificate(hash, true);
            if !deleted.is_empty() {
                found = true;
                if !bundle.export() {
                    failed = true;
                }
            }
        }

        for role in [LeafRole::V2g, LeafRole::Csms] {
            let Some((cert_dir, _)) = self.leaf_dirs(role) else {
                continue;
            };
            let cert_dir = cert_dir.to_path_buf();
            let root_path = self.ca_bundle_path(role.ca_category()).to_path_buf();

            let roots = CertificateBundle::from_path(&root_path, EncodingFormat::Pem);
            let mut leafs = match CertificateBundle::from_path(&cert_dir, EncodingFormat::Pem) {
                Ok(b) => b,
                Err(e) => {
                    warn!(dir = %cert_dir.display(), error = %e, "could not load leaf bundle");
                    continue;
                }
            };

            // Roots are needed so issued-leaf hashes compute with the real
            // issuer key.
            let hierarchy = CertificateHierarchy::build_with_leaves(
                roots.map(|r| r.split()).unwrap_or_default(),
                leafs.split(),
            );

            let Some(target) = hierarchy.find_certificate(hash).ok().cloned() else {
                continue;
            };

            let deleted = leafs.delete_certificate_exact(&target, true);
            if !deleted.is_empty() {
                found = true;
                if role == LeafRole::Csms {
                    // The charging-station certificate must not be deleted
                    // (OCPP M04.FR.06); leave the files untouched.
                    error!(
                        subject = target.common_name().unwrap_or_default(),
                        "refusing to delete the charging station certificate"
                    );
                    failed = true;
                } else if !leafs.export() {
                    error!("leaf certificate removal failed to write");
                    failed = true;
                }
            }
        }

        if !found {
            DeleteResult::NotFound
        } else if failed {
            DeleteResult::Failed
        } else {
            DeleteResult::Accepted
        }
    }

    /// Delete a root certificate, guarding the trust anchors a secure profile
    /// depends on: the last valid CSMS root is refused at `security_profile
    /// >= 2`, the last valid V2G root at `security_profile >= 3`. The policy
    /// check happens before any mutation.
    pub fn delete_root_certificate(
        &mut self,
        hash: &CertificateHashData,
        security_profile: i32,
    ) -> DeleteResult {
        let guarded = [
            (CaCategory::Csms, 2),
            (CaCategory::V2g, 3),
        ];

        for (category, minimum_profile) in guarded {
            if security_profile < minimum_profile {
                continue;
            }
            if self.is_last_valid_root(category, hash) {
                error!(
                    %category,
                    security_profile,
                    "refusing to delete the last trusted root while a secure profile is active"
                );
                return DeleteResult::Failed;
            }
        }

        self.delete_certificate(hash)
    }

    fn is_last_valid_root(&self, category: CaCategory, hash: &CertificateHashData) -> bool {
        let Ok(bundle) =
            CertificateBundle::from_path(self.ca_bundle_path(category), EncodingFormat::Pem)
        else {
            return false;
        };

        let hierarchy = bundle.hierarchy();
        let valid_roots: Vec<_> = hierarchy
            .roots()
            .iter()
            .filter(|r| r.certificate.is_self_signed() && r.certificate.is_valid())
            .collect();

        valid_roots.len() == 1 && valid_roots[0].hash.matches(hash)
    }

    // ------------------------------------------------------------------
    // Leaf update and verification

    /// Verify a chain and install its leaf, requiring a resident private key.
    pub fn update_leaf_certificate(&mut self, chain_pem: &str, role: LeafRole) -> InstallResult {
        info!(%role, "updating leaf certificate");

        if self.store_is_full() {
            error!("certificate store limit reached, refusing leaf update");
            return InstallResult::StoreLimitReached;
        }

        let Some((cert_dir, key_dir)) = self.leaf_dirs(role) else {
            error!(%role, "leaf updates are only supported for CSMS and SECC roles");
            return InstallResult::WriteError;
        };
        let cert_dir = cert_dir.to_path_buf();
        let key_dir = key_dir.to_path_buf();

        let chain_bundle = match CertificateBundle::from_memory(chain_pem.as_bytes(), EncodingFormat::Pem)
        {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "leaf chain failed to parse");
                return InstallResult::InvalidFormat;
            }
        };
        let chain = chain_bundle.split();
        if chain.is_empty() {
            return InstallResult::InvalidFormat;
        }

        let verdict = self.verify_certificate(chain_pem, role);
        if verdict != ValidationResult::Valid {
            return to_install_result(verdict);
        }

        // The first certificate in the chain is the leaf.
        let leaf = &chain[0];

        let key_path = match keys::resolve_private_key(
            leaf,
            &key_dir,
            self.options.private_key_password.as_ref(),
        ) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "leaf certificate has no matching private key, refusing install");
                return InstallResult::WriteError;
            }
        };

        let leaf_path = match fs_utils::unique_file_in(
            &cert_dir,
            &format!("{}_LEAF_", role.as_str()),
            PEM_EXTENSION,
        ) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "could not allocate leaf filename");
                return InstallResult::WriteError;
            }
        };

        let leaf_pem = match leaf.export_pem() {
            Ok(p) => p,
            Err(_) => return InstallResult::InvalidFormat,
        };
        if let Err(e) = fs::write(&leaf_path, &leaf_pem) {
            error!(file = %leaf_path.display(), error = %e, "could not write leaf certificate");
            return InstallResult::WriteError;
        }

        // The CSR that produced this key is fulfilled; the key is no longer
        // an orphan candidate.
        self.managed_csr.remove(&key_path);

        if chain.len() > 1 {
            let chain_path = match fs_utils::unique_file_in(
                &cert_dir,
                &format!("{}_CHAIN_", role.as_str()),
                PEM_EXTENSION,
            ) {
                Ok(p) => p,
                Err(e) => {
                    error!(error = %e, "could not allocate chain filename");
                    return InstallResult::WriteError;
                }
            };
            let content = match chain_bundle.export_string() {
                Ok(c) => c,
                Err(_) => return InstallResult::WriteError,
            };
            if let Err(e) = fs::write(&chain_path, content) {
                // Sub-CAs are required for a connection, so this is a failure.
                error!(file = %chain_path.display(), error = %e, "could not write leaf chain");
                return InstallResult::WriteError;
            }
        }

        InstallResult::Accepted
    }

    /// Validate a chain against the trust anchors for `role`.
    ///
    /// The V2G root bundle is unconditionally trusted alongside the role's own
    /// bundle, except for manufacturer certificates. Chain members after the
    /// leaf load as untrusted helpers; self-signed members are ignored.
    pub fn verify_certificate(&self, chain_pem: &str, role: LeafRole) -> ValidationResult {
        info!(%role, "verifying certificate chain");

        let category = role.ca_category();
        if !self.is_ca_certificate_installed(category) {
            return ValidationResult::IssuerNotFound;
        }

        let chain = match CertificateBundle::from_memory(chain_pem.as_bytes(), EncodingFormat::Pem)
        {
            Ok(b) => b.split(),
            Err(e) => {
                warn!(error = %e, "could not parse chain for verification");
                return ValidationResult::Unknown;
            }
        };
        if chain.is_empty() {
            return ValidationResult::Unknown;
        }

        let leaf = &chain[0];

        // Expired is reported precisely even though time checking is disabled
        // below to allow pre-provisioned (not yet valid) certificates.
        if leaf.is_expired() {
            return ValidationResult::Expired;
        }

        let mut untrusted = match Stack::<X509>::new() {
            Ok(s) => s,
            Err(_) => return ValidationResult::Unknown,
        };
        for cert in chain.iter().skip(1) {
            if cert.is_self_signed() {
                warn!(
                    subject = cert.common_name().unwrap_or_default(),
                    "ignoring self-signed certificate supplied inside the chain"
                );
            } else if untrusted.push(cert.x509().clone()).is_err() {
                return ValidationResult::Unknown;
            }
        }

        let mut trust = match X509StoreBuilder::new() {
            Ok(b) => b,
            Err(_) => return ValidationResult::Unknown,
        };

        let mut categories = vec![category];
        if role != LeafRole::Mf && category != CaCategory::V2g {
            categories.push(CaCategory::V2g);
        }
        for trusted_category in categories {
            let path = self.ca_bundle_path(trusted_category);
            match CertificateBundle::from_path(path, EncodingFormat::Pem) {
                Ok(bundle) => {
                    for cert in bundle.certificates() {
                        if trust.add_cert(cert.x509().clone()).is_err() {
                            return ValidationResult::Unknown;
                        }
                    }
                }
                Err(e) => {
                    warn!(bundle = %path.display(), error = %e, "could not load trust bundle")
                }
            }
        }

        if trust.set_flags(X509VerifyFlags::NO_CHECK_TIME).is_err() {
            return ValidationResult::Unknown;
        }
        let store = trust.build();

        let mut context = match X509StoreContext::new() {
            Ok(c) => c,
            Err(_) => return ValidationResult::Unknown,
        };

        let outcome = context.init(&store, leaf.x509(), &untrusted, |ctx| {
            let ok = ctx.verify_cert()?;
            if ok {
                Ok(None)
            } else {
                Ok(Some(ctx.error()))
            }
        });

        match outcome {
            Ok(None) => ValidationResult::Valid,
            Ok(Some(code)) => map_verify_error(code.as_raw()),
            Err(e) => {
                warn!(error = %e, "chain verification failed to run");
                ValidationResult::Unknown
            }
        }
    }

    // ------------------------------------------------------------------
    // Queries

    pub fn is_ca_certificate_installed(&self, category: CaCategory) -> bool {
        let Ok(bundle) =
            CertificateBundle::from_path(self.ca_bundle_path(category), EncodingFormat::Pem)
        else {
            return false;
        };

        bundle
            .hierarchy()
            .roots()
            .iter()
            .any(|r| r.certificate.is_self_signed() && r.certificate.is_valid())
    }

    /// Hash-data chains for the requested certificate kinds.
    pub fn get_installed_certificates(&self, kinds: &[CertificateKind]) -> GetInstalledResult {
        let mut chains: Vec<CertificateHashDataChain> = Vec::new();

        for kind in kinds {
            if let Some(category) = kind.ca_category() {
                let path = self.ca_bundle_path(category);
                let bundle = match CertificateBundle::from_path(path, EncodingFormat::Pem) {
                    Ok(b) => b,
                    Err(e) => {
                        warn!(bundle = %path.display(), error = %e, "could not load CA bundle");
                        continue;
                    }
                };

                let hierarchy = bundle.hierarchy();
                debug!(%category, "hierarchy:\n{}", hierarchy.to_debug_string());

                for root in hierarchy.roots() {
                    let mut children = Vec::new();
                    CertificateHierarchy::for_each_descendant(root, &mut |node, _| {
                        children.push(node.hash.clone());
                    });
                    chains.push(CertificateHashDataChain {
                        kind: kind_name(*kind).to_string(),
                        certificate_hash_data: root.hash.clone(),
                        child_certificate_hash_data: children,
                    });
                }
            } else {
                self.collect_v2g_chain(&mut chains);
            }
        }

        GetInstalledResult {
            status: if chains.is_empty() {
                GetInstalledStatus::NotFound
            } else {
                GetInstalledStatus::Accepted
            },
            chains,
        }
    }

    /// The V2G leaf chain merged into the CA bundle, reported leaf-first.
    fn collect_v2g_chain(&self, chains: &mut Vec<CertificateHashDataChain>) {
        let key_pair = self.get_key_pair(LeafRole::V2g, EncodingFormat::Pem);
        let Some(info) = key_pair.info else {
            return;
        };
        let Some(leaf_source) = info.certificate_chain_path.or(info.certificate_path) else {
            return;
        };

        let leaf_bundle = match CertificateBundle::from_path(&leaf_source, EncodingFormat::Pem) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "could not load installed leaf chain");
                return;
            }
        };
        let ca_bundle = match CertificateBundle::from_path(
            self.ca_bundle_path(CaCategory::V2g),
            EncodingFormat::Pem,
        ) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "could not load V2G bundle");
                return;
            }
        };

        let hierarchy =
            CertificateHierarchy::build_with_leaves(ca_bundle.split(), leaf_bundle.split());

        for root in hierarchy.roots() {
            // Hierarchy order is root -> subCA1 -> subCA2 -> leaf; the chain
            // is reported leaf-first with ancestors as children.
            let mut ordered = Vec::new();
            CertificateHierarchy::for_each_descendant(root, &mut |node, _| {
                ordered.push(node.hash.clone());
            });

            if let Some(leaf_hash) = ordered.pop() {
                ordered.reverse();
                chains.push(CertificateHashDataChain {
                    kind: kind_name(CertificateKind::V2gCertificateChain).to_string(),
                    certificate_hash_data: leaf_hash,
                    child_certificate_hash_data: ordered,
                });
            }
        }
    }

    pub fn get_count_of_installed_certificates(&self, kinds: &[CertificateKind]) -> usize {
        let mut locations: std::collections::BTreeSet<PathBuf> = std::collections::BTreeSet::new();

        for kind in kinds {
            match kind.ca_category() {
                Some(category) => {
                    locations.insert(self.ca_bundle_path(category).to_path_buf());
                }
                None => {
                    locations.insert(self.paths.secc_leaf_cert_dir.clone());
                }
            }
        }

        locations
            .iter()
            .filter_map(|p| CertificateBundle::from_path(p, EncodingFormat::Pem).ok())
            .map(|b| b.certificate_count())
            .sum()
    }

    /// Most recent valid leaf with its private key and certificate files.
    pub fn get_key_pair(&self, role: LeafRole, _encoding: EncodingFormat) -> KeyPairResult {
        info!(%role, "requesting leaf key pair");

        let Some((cert_dir, key_dir)) = self.leaf_dirs(role) else {
            warn!(%role, "key pairs exist only for CSMS and SECC roles");
            return KeyPairResult::status(KeyPairStatus::Rejected);
        };

        let leafs = match CertificateBundle::from_path(cert_dir, EncodingFormat::Pem) {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "could not load leaf directory");
                return KeyPairResult::status(KeyPairStatus::NotFound);
            }
        };
        if leafs.is_empty() {
            return KeyPairResult::status(KeyPairStatus::NotFound);
        }

        let password = self.options.private_key_password.as_ref();

        let mut any_valid = false;
        let mut selected: Option<(Certificate, PathBuf)> = None;

        for (_, chain) in leafs.chains_newest_first() {
            let leaf = &chain[0];
            if !leaf.is_valid() {
                continue;
            }
            any_valid = true;

            match keys::resolve_private_key(leaf, key_dir, password) {
                Ok(key_path) => {
                    selected = Some((leaf.clone(), key_path));
                    break;
                }
                Err(_) => continue,
            }
        }

        if !any_valid {
            warn!(%role, "no currently valid leaf certificate");
            return KeyPairResult::status(KeyPairStatus::NotFoundValid);
        }
        let Some((leaf, key_path)) = selected else {
            warn!(%role, "valid leaf present but no matching private key");
            return KeyPairResult::status(KeyPairStatus::PrivateKeyNotFound);
        };

        // Locate the full-chain file and the single-certificate file among
        // the directory's files containing the selected leaf. Both optional.
        let mut chain_path = None;
        let mut single_path = None;
        for (path, chain) in leafs.chains() {
            if chain.iter().any(|c| c.same_certificate(&leaf)) {
                if chain.len() > 1 {
                    chain_path.get_or_insert_with(|| path.clone());
                } else {
                    single_path.get_or_insert_with(|| path.clone());
                }
            }
            if chain_path.is_some() && single_path.is_some() {
                break;
            }
        }

        if chain_path.is_none() {
            debug!(%role, "no full-chain file for the selected leaf");
        }
        if single_path.is_none() {
            debug!(%role, "no single-certificate file for the selected leaf");
        }

        KeyPairResult {
            status: KeyPairStatus::Accepted,
            info: Some(KeyPairInfo {
                key_path,
                certificate_chain_path: chain_path,
                certificate_path: single_path,
                password: self.options.private_key_password.clone(),
            }),
        }
    }

    /// Bundle file (or first valid root file in directory mode) used as the
    /// verify location for `category`.
    pub fn get_verify_file(&self, category: CaCategory) -> Option<PathBuf> {
        let bundle =
            CertificateBundle::from_path(self.ca_bundle_path(category), EncodingFormat::Pem)
                .ok()?;

        if !bundle.is_directory() {
            return bundle.path().map(Path::to_path_buf);
        }

        let hierarchy = bundle.hierarchy();
        hierarchy
            .roots()
            .iter()
            .find(|r| r.certificate.is_self_signed() && r.certificate.is_valid())
            .and_then(|r| r.certificate.path().map(Path::to_path_buf))
    }

    /// Days until the role's active leaf expires; 0 when none is installed.
    pub fn get_leaf_expiry_days_count(&self, role: LeafRole) -> i64 {
        let key_pair = self.get_key_pair(role, EncodingFormat::Pem);
        let Some(info) = key_pair.info else {
            return 0;
        };
        let Some(path) = info.certificate_chain_path.or(info.certificate_path) else {
            return 0;
        };

        match CertificateBundle::from_path(&path, EncodingFormat::Pem) {
            // The leaf is always first in a chain file.
            Ok(bundle) => bundle
                .certificates()
                .next()
                .map(|c| c.expires_in_seconds() / 86_400)
                .unwrap_or(0),
            Err(_) => 0,
        }
    }

    // ------------------------------------------------------------------
    // CSR handling

    /// Generate a CSR for `role`, leaving the new private key in the role's
    /// key directory. Roles without managed keys are rejected before any key
    /// material is created.
    pub fn generate_certificate_signing_request(
        &mut self,
        role: LeafRole,
        country: &str,
        organization: &str,
        common_name: &str,
    ) -> CsrResult {
        let Some((_, key_dir)) = self.leaf_dirs(role) else {
            error!(%role, "CSR generation is not allowed for this role");
            return CsrResult {
                status: CsrStatus::InvalidRole,
                csr: None,
            };
        };

        info!(%role, "generating certificate signing request");

        let key_path = match fs_utils::unique_file_in(
            key_dir,
            &format!("{}_LEAF_", role.as_str()),
            keys::KEY_EXTENSION,
        ) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "could not allocate key filename");
                return CsrResult {
                    status: CsrStatus::KeyGenError,
                    csr: None,
                };
            }
        };

        match keys::generate_csr(
            &CsrInfo {
                country,
                organization,
                common_name,
            },
            &key_path,
            self.options.private_key_password.as_ref(),
        ) {
            Ok(csr) => {
                // Track the key so an unanswered CSR is collected later.
                self.managed_csr.insert(key_path, Instant::now());
                CsrResult {
                    status: CsrStatus::Accepted,
                    csr: Some(csr),
                }
            }
            Err(CertError::Io(e)) => {
                error!(error = %e, "could not write CSR private key");
                CsrResult {
                    status: CsrStatus::KeyGenError,
                    csr: None,
                }
            }
            Err(e) => {
                error!(error = %e, "CSR generation failed");
                CsrResult {
                    status: CsrStatus::GenerationError,
                    csr: None,
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // OCSP

    /// OCSP request data for the active V2G leaf chain.
    pub fn get_v2g_ocsp_request_data(&self) -> Vec<OcspRequestData> {
        let key_pair = self.get_key_pair(LeafRole::V2g, EncodingFormat::Pem);
        let Some(info) = key_pair.info else {
            warn!("no V2G key pair for OCSP request data");
            return Vec::new();
        };
        let Some(path) = info.certificate_chain_path.or(info.certificate_path) else {
            return Vec::new();
        };

        let Ok(leaf_bundle) = CertificateBundle::from_path(&path, EncodingFormat::Pem) else {
            return Vec::new();
        };
        let Ok(roots) = CertificateBundle::from_path(
            self.ca_bundle_path(CaCategory::V2g),
            EncodingFormat::Pem,
        ) else {
            return Vec::new();
        };

        ocsp::request_data(roots.split(), leaf_bundle.split())
    }

    /// OCSP request data for an MO contract chain presented over the wire.
    pub fn get_mo_ocsp_request_data(&self, chain_pem: &str) -> Vec<OcspRequestData> {
        let chain = match CertificateBundle::from_memory(chain_pem.as_bytes(), EncodingFormat::Pem)
        {
            Ok(b) => b.split(),
            Err(e) => {
                warn!(error = %e, "could not parse MO chain");
                return Vec::new();
            }
        };
        let Ok(roots) = CertificateBundle::from_path(
            self.ca_bundle_path(CaCategory::Mo),
            EncodingFormat::Pem,
        ) else {
            return Vec::new();
        };

        ocsp::request_data(roots.split(), chain)
    }

    pub fn update_ocsp_cache(&self, hash: &CertificateHashData, response: &[u8]) {
        info!("updating OCSP cache");

        let hierarchy = self.v2g_hierarchy();
        ocsp::update_cache(&hierarchy, hash, response);
    }

    pub fn retrieve_ocsp_cache(&self, hash: &CertificateHashData) -> Option<PathBuf> {
        let hierarchy = self.v2g_hierarchy();
        ocsp::retrieve_cache(&hierarchy, hash)
    }

    fn v2g_hierarchy(&self) -> CertificateHierarchy {
        let roots = CertificateBundle::from_path(
            self.ca_bundle_path(CaCategory::V2g),
            EncodingFormat::Pem,
        )
        .map(|b| b.split())
        .unwrap_or_default();
        let leafs = CertificateBundle::from_path(&self.paths.secc_leaf_cert_dir, EncodingFormat::Pem)
            .map(|b| b.split())
            .unwrap_or_default();

        CertificateHierarchy::build_with_leaves(roots, leafs)
    }

    // ------------------------------------------------------------------
    // Garbage collection

    /// Remove expired leaf certificates (keeping the newest
    /// `minimum_leaf_entries` regardless), their keys and OCSP files, plus
    /// CSR keys that never received a certificate.
    ///
    /// The caller is responsible for invoking this on its own schedule and
    /// for a correctly set system clock.
    pub fn garbage_collect(&mut self) {
        info!("garbage collecting certificate store");

        let password = self.options.private_key_password.clone();
        let mut doomed: Vec<PathBuf> = Vec::new();
        let mut protected_keys: std::collections::BTreeSet<PathBuf> = Default::default();

        let leaf_dirs = [
            (
                self.paths.csms_leaf_cert_dir.clone(),
                self.paths.csms_leaf_key_dir.clone(),
            ),
            (
                self.paths.secc_leaf_cert_dir.clone(),
                self.paths.secc_leaf_key_dir.clone(),
            ),
        ];

        for (cert_dir, key_dir) in &leaf_dirs {
            let Ok(bundle) = CertificateBundle::from_path(cert_dir, EncodingFormat::Pem) else {
                continue;
            };

            for (index, (path, chain)) in bundle.chains_newest_first().into_iter().enumerate() {
                let leaf = &chain[0];

                if index < self.options.minimum_leaf_entries {
                    if let Ok(key) = keys::resolve_private_key(leaf, key_dir, password.as_ref()) {
                        self.managed_csr.remove(&key);
                        protected_keys.insert(key);
                    }
                    continue;
                }

                if leaf.is_expired() {
                    doomed.push(path.clone());
                    if let Ok(key) = keys::resolve_private_key(leaf, key_dir, password.as_ref()) {
                        doomed.push(key);
                    }
                    if let Some(ocsp_file) = ocsp::cache_path_for(leaf) {
                        if ocsp_file.exists() {
                            doomed.push(ocsp_file);
                        }
                    }
                }
            }
        }

        for path in &doomed {
            match fs::remove_file(path) {
                Ok(()) => info!(file = %path.display(), "deleted expired certificate material"),
                Err(e) => warn!(file = %path.display(), error = %e, "could not delete expired file"),
            }
        }

        // Keys without any paired certificate get (back) onto the CSR list so
        // a late certificate response still has a chance; they are deleted
        // only once the expiry elapses.
        for (cert_dir, key_dir) in &leaf_dirs {
            let Ok(files) = fs_utils::sorted_files(key_dir) else {
                continue;
            };
            for key_file in files.into_iter().filter(|p| keys::is_key_file(p)) {
                if protected_keys.contains(&key_file) {
                    continue;
                }
                let paired =
                    keys::certificate_files_of_key(&key_file, cert_dir, password.as_ref()).is_ok();
                if !paired {
                    self.managed_csr.entry(key_file).or_insert_with(Instant::now);
                }
            }
        }

        let expiry = self.options.csr_expiry;
        let mut expired_csr = Vec::new();
        self.managed_csr.retain(|path, created| {
            if created.elapsed() > expiry {
                expired_csr.push(path.clone());
                false
            } else {
                true
            }
        });
        for path in expired_csr {
            debug!(file = %path.display(), "deleting key of expired CSR");
            let _ = fs::remove_file(path);
        }

        // OCSP responses whose certificate disappeared.
        let mut ocsp_dirs: Vec<PathBuf> = leaf_dirs.iter().map(|(c, _)| c.clone()).collect();
        for category in CaCategory::ALL {
            let bundle = self.ca_bundle_path(category);
            if bundle.is_dir() {
                ocsp_dirs.push(bundle.to_path_buf());
            } else if let Some(parent) = bundle.parent() {
                ocsp_dirs.push(parent.to_path_buf());
            }
        }
        for dir in ocsp_dirs {
            for stale in ocsp::stale_cache_files(&dir) {
                match fs::remove_file(&stale) {
                    Ok(()) => info!(file = %stale.display(), "deleted stale OCSP response"),
                    Err(e) => warn!(file = %stale.display(), error = %e, "could not delete OCSP file"),
                }
            }
        }
    }

    /// Number of CSR keys currently tracked for expiry.
    pub fn managed_csr_count(&self) -> usize {
        self.managed_csr.len()
    }

    fn store_is_full(&self) -> bool {
        let mut entries: std::collections::BTreeSet<PathBuf> = Default::default();

        let mut locations: Vec<PathBuf> = CaCategory::ALL
            .iter()
            .map(|c| self.ca_bundle_path(*c).to_path_buf())
            .collect();
        locations.extend([
            self.paths.csms_leaf_cert_dir.clone(),
            self.paths.csms_leaf_key_dir.clone(),
            self.paths.secc_leaf_cert_dir.clone(),
            self.paths.secc_leaf_key_dir.clone(),
        ]);

        for location in locations {
            if location.is_file() {
                entries.insert(location);
            } else if location.is_dir() {
                if let Ok(files) = fs_utils::sorted_files(&location) {
                    entries.extend(files);
                }
            }
        }

        let full = entries.len() > self.options.max_store_entries;
        if full {
            warn!(
                entries = entries.len(),
                limit = self.options.max_store_entries,
                "certificate store entry limit exceeded"
            );
        }
        full
    }
}

fn ca_bundle_path_of(paths: &StorePaths, category: CaCategory) -> &Path {
    match category {
        CaCategory::Csms => &paths.csms_ca_bundle,
        CaCategory::Mf => &paths.mf_ca_bundle,
        CaCategory::Mo => &paths.mo_ca_bundle,
        CaCategory::V2g => &paths.v2g_ca_bundle,
    }
}

fn kind_name(kind: CertificateKind) -> &'static str {
    match kind {
        CertificateKind::CsmsRoot => "CSMSRootCertificate",
        CertificateKind::MfRoot => "ManufacturerRootCertificate",
        CertificateKind::MoRoot => "MORootCertificate",
        CertificateKind::V2gRoot => "V2GRootCertificate",
        CertificateKind::V2gCertificateChain => "V2GCertificateChain",
    }
}

/// Fixed, total mapping from library verify-error codes to the result
/// taxonomy; unmapped codes collapse to `InvalidChain`.
fn map_verify_error(code: i32) -> ValidationResult {
    match code {
        openssl_sys::X509_V_ERR_CERT_HAS_EXPIRED
        | openssl_sys::X509_V_ERR_CERT_NOT_YET_VALID => ValidationResult::Expired,
        openssl_sys::X509_V_ERR_CERT_SIGNATURE_FAILURE => ValidationResult::InvalidSignature,
        openssl_sys::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT
        | openssl_sys::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY => {
            ValidationResult::IssuerNotFound
        }
        openssl_sys::X509_V_ERR_UNABLE_TO_VERIFY_LEAF_SIGNATURE => {
            ValidationResult::InvalidLeafSignature
        }
        _ => ValidationResult::InvalidChain,
    }
}

fn to_install_result(validation: ValidationResult) -> InstallResult {
    match validation {
        ValidationResult::Valid => InstallResult::Accepted,
        ValidationResult::Expired => InstallResult::Expired,
        ValidationResult::InvalidSignature | ValidationResult::InvalidLeafSignature => {
            InstallResult::InvalidSignature
        }
        ValidationResult::IssuerNotFound => InstallResult::NoRootCertificateInstalled,
        ValidationResult::InvalidChain => InstallResult::InvalidCertificateChain,
        ValidationResult::Unknown => InstallResult::InvalidFormat,
    }
}
