//! Certificate bundle store
//!
//! A bundle owns the certificates of one role, backed by either a single
//! (possibly multi-PEM) file, a directory of individually managed files, or
//! plain memory for chains received over the wire. Directory bundles keep one
//! chain per file so every certificate stays individually addressable;
//! file bundles share the single backing path.
//!
//! Loading a directory accepts whichever files parse and skips the rest with
//! a warning, since a directory aggregates independently managed files.
//! Loading a single file is all-or-nothing.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, error, warn};

use crate::certificate::Certificate;
use crate::fs_utils;
use crate::hierarchy::CertificateHierarchy;
use crate::types::{CertError, CertificateHashData, EncodingFormat};

const CERTIFICATE_EXTENSIONS: [&str; 3] = ["pem", "crt", "der"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BundleSource {
    File(PathBuf),
    Directory(PathBuf),
    Memory,
}

pub struct CertificateBundle {
    source: BundleSource,
    /// One entry per backing file; memory bundles use a single empty key.
    chains: BTreeMap<PathBuf, Vec<Certificate>>,
}

impl CertificateBundle {
    /// Load a bundle from a file or directory path.
    ///
    /// A missing path is created empty (file when the path carries an
    /// extension, directory otherwise) rather than treated as an error, so a
    /// fresh installation starts from a usable layout.
    pub fn from_path(path: &Path, encoding: EncodingFormat) -> Result<Self, CertError> {
        if !path.exists() {
            let as_dir = path.extension().is_none();
            fs_utils::create_if_missing(path, as_dir).map_err(|e| CertError::Load {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        }

        if path.is_dir() {
            let mut chains = BTreeMap::new();

            let files = fs_utils::sorted_files(path).map_err(|e| CertError::Load {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;

            for file in files {
                if !is_certificate_file(&file) {
                    continue;
                }
                match load_chain_file(&file, encoding) {
                    Ok(certs) => {
                        chains.insert(file, certs);
                    }
                    Err(e) => {
                        // Independently managed files; one bad entry must not
                        // take the whole directory down.
                        warn!(file = %file.display(), error = %e, "skipping unparseable certificate file");
                    }
                }
            }

            return Ok(Self {
                source: BundleSource::Directory(path.to_path_buf()),
                chains,
            });
        }

        let data = fs::read(path).map_err(|e| CertError::Load {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let mut chains = BTreeMap::new();
        if data.iter().any(|b| !b.is_ascii_whitespace()) {
            let certs =
                Certificate::parse_many(&data, encoding).map_err(|e| CertError::Load {
                    path: path.to_path_buf(),
                    reason: e.to_string(),
                })?;
            let certs = certs
                .into_iter()
                .map(|mut c| {
                    c.set_path(path);
                    c
                })
                .collect();
            chains.insert(path.to_path_buf(), certs);
        } else {
            chains.insert(path.to_path_buf(), Vec::new());
        }

        Ok(Self {
            source: BundleSource::File(path.to_path_buf()),
            chains,
        })
    }

    /// Build an in-memory bundle from raw bytes (e.g. a chain received over a
    /// management protocol). Cannot be exported.
    pub fn from_memory(data: &[u8], encoding: EncodingFormat) -> Result<Self, CertError> {
        let certs = Certificate::parse_many(data, encoding)?;
        let mut chains = BTreeMap::new();
        chains.insert(PathBuf::new(), certs);

        Ok(Self {
            source: BundleSource::Memory,
            chains,
        })
    }

    pub fn source(&self) -> &BundleSource {
        &self.source
    }

    pub fn is_directory(&self) -> bool {
        matches!(self.source, BundleSource::Directory(_))
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.source {
            BundleSource::File(p) | BundleSource::Directory(p) => Some(p),
            BundleSource::Memory => None,
        }
    }

    pub fn certificate_count(&self) -> usize {
        self.chains.values().map(Vec::len).sum()
    }

    pub fn chain_count(&self) -> usize {
        self.chains.values().filter(|c| !c.is_empty()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.certificate_count() == 0
    }

    pub fn certificates(&self) -> impl Iterator<Item = &Certificate> {
        self.chains.values().flatten()
    }

    /// Flatten into an owned, unordered certificate list.
    pub fn split(&self) -> Vec<Certificate> {
        self.certificates().cloned().collect()
    }

    /// Chains (one per backing file) in deterministic path order.
    pub fn chains(&self) -> impl Iterator<Item = (&PathBuf, &Vec<Certificate>)> {
        self.chains.iter()
    }

    /// Chains ordered newest-first by the leading certificate's expiry, the
    /// order leaf selection walks them in.
    pub fn chains_newest_first(&self) -> Vec<(&PathBuf, &Vec<Certificate>)> {
        let mut ordered: Vec<_> = self.chains.iter().filter(|(_, c)| !c.is_empty()).collect();
        ordered.sort_by_key(|(_, chain)| std::cmp::Reverse(chain[0].expires_in_seconds()));
        ordered
    }

    pub fn contains(&self, certificate: &Certificate) -> bool {
        self.certificates().any(|c| c.same_certificate(certificate))
    }

    /// Search by hash data: self-signed certificates first (their proxy hash
    /// is exact), then through a hierarchy rebuild for issued certificates.
    pub fn find_by_hash(&self, hash: &CertificateHashData) -> Option<Certificate> {
        for cert in self.certificates() {
            if cert.is_self_signed() {
                if let Ok(h) = cert.proxy_hash_data() {
                    if h.matches(hash) {
                        return Some(cert.clone());
                    }
                }
            }
        }

        self.hierarchy().find_certificate(hash).ok().cloned()
    }

    /// Insert a certificate.
    ///
    /// Directory bundles require the certificate's path to have been assigned
    /// inside the bundle directory beforehand; anything else is an invalid
    /// operation.
    pub fn add_certificate(&mut self, certificate: Certificate) -> Result<(), CertError> {
        match &self.source {
            BundleSource::Directory(dir) => {
                let path = certificate
                    .path()
                    .map(Path::to_path_buf)
                    .ok_or_else(|| {
                        CertError::InvalidOperation(
                            "certificate added to a directory bundle needs a file path".into(),
                        )
                    })?;
                if !path.starts_with(dir) {
                    return Err(CertError::InvalidOperation(format!(
                        "certificate path {} is outside bundle directory {}",
                        path.display(),
                        dir.display()
                    )));
                }
                self.chains.entry(path).or_default().push(certificate);
            }
            BundleSource::File(path) => {
                let mut certificate = certificate;
                certificate.set_path(path);
                let path = path.clone();
                self.chains.entry(path).or_default().push(certificate);
            }
            BundleSource::Memory => {
                self.chains.entry(PathBuf::new()).or_default().push(certificate);
            }
        }
        Ok(())
    }

    /// Insert unless an equal-hash certificate is already present.
    pub fn add_certificate_unique(&mut self, certificate: Certificate) -> Result<bool, CertError> {
        if self.contains(&certificate) {
            return Ok(false);
        }
        self.add_certificate(certificate)?;
        Ok(true)
    }

    /// Replace an existing entry matched by hash data, keeping its file path.
    pub fn update_certificate(&mut self, certificate: Certificate) -> bool {
        for chain in self.chains.values_mut() {
            for existing in chain.iter_mut() {
                if existing.same_certificate(&certificate) {
                    let mut replacement = certificate;
                    if let Some(path) = existing.path() {
                        let path = path.to_path_buf();
                        replacement.set_path(&path);
                    }
                    *existing = replacement;
                    return true;
                }
            }
        }
        false
    }

    /// Remove the certificate matching `hash`, optionally together with every
    /// certificate it transitively issued. Returns the removed certificates.
    pub fn delete_certificate(
        &mut self,
        hash: &CertificateHashData,
        include_issued: bool,
    ) -> Vec<Certificate> {
        let target = match self.hierarchy().find_certificate(hash) {
            Ok(cert) => cert.clone(),
            Err(_) => return Vec::new(),
        };
        self.delete_certificate_exact(&target, include_issued)
    }

    /// Remove an already-resolved certificate. Used when the hash lookup had
    /// to happen against a wider hierarchy (e.g. leaf plus external roots)
    /// than this bundle alone provides.
    pub fn delete_certificate_exact(
        &mut self,
        target: &Certificate,
        include_issued: bool,
    ) -> Vec<Certificate> {
        let mut doomed = vec![target.clone()];
        if include_issued {
            doomed.extend(self.hierarchy().collect_descendants(target));
        }

        let mut deleted = Vec::new();
        for chain in self.chains.values_mut() {
            chain.retain(|cert| {
                let hit = doomed.iter().any(|d| d.same_certificate(cert));
                if hit {
                    deleted.push(cert.clone());
                }
                !hit
            });
        }

        deleted
    }

    /// Most recent currently valid certificate, by `notBefore`.
    pub fn latest_valid(&self) -> Result<&Certificate, CertError> {
        self.certificates()
            .filter(|c| c.is_valid())
            .min_by_key(|c| c.age_seconds())
            .ok_or(CertError::NoValidCertificate)
    }

    /// Rebuild the hierarchy for the current content. Derived and disposable:
    /// recomputed per query, never patched in place.
    pub fn hierarchy(&self) -> CertificateHierarchy {
        CertificateHierarchy::build(self.split())
    }

    /// Concatenated PEM of every certificate in the bundle.
    pub fn export_string(&self) -> Result<String, CertError> {
        let mut out = String::new();
        for cert in self.certificates() {
            out.push_str(&String::from_utf8_lossy(&cert.export_pem()?));
        }
        Ok(out)
    }

    /// Write the in-memory state back to the backing file or directory.
    ///
    /// Returns false on any failure; already-written files stay in place (no
    /// rollback). Memory bundles cannot be exported.
    pub fn export(&mut self) -> bool {
        match self.source.clone() {
            BundleSource::Memory => {
                error!("export is invalid for a memory-backed bundle");
                false
            }
            BundleSource::File(path) => {
                if self.is_empty() {
                    return match fs::remove_file(&path) {
                        Ok(()) => true,
                        Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
                        Err(e) => {
                            error!(file = %path.display(), error = %e, "could not remove emptied bundle");
                            false
                        }
                    };
                }

                let content = match self.export_string() {
                    Ok(c) => c,
                    Err(e) => {
                        error!(error = %e, "could not serialize bundle");
                        return false;
                    }
                };

                match fs_utils::write_file_atomic(&path, content.as_bytes()) {
                    Ok(()) => true,
                    Err(e) => {
                        error!(file = %path.display(), error = %e, "bundle export failed");
                        false
                    }
                }
            }
            BundleSource::Directory(dir) => self.export_directory(&dir),
        }
    }

    fn export_directory(&mut self, dir: &Path) -> bool {
        let mut success = true;

        // Remove filesystem entries whose chains are gone or emptied.
        if let Ok(existing) = fs_utils::sorted_files(dir) {
            for file in existing {
                if !is_certificate_file(&file) {
                    continue;
                }
                let keep = self.chains.get(&file).map(|c| !c.is_empty()).unwrap_or(false);
                if !keep {
                    if let Err(e) = fs::remove_file(&file) {
                        error!(file = %file.display(), error = %e, "could not delete certificate file");
                        success = false;
                    } else {
                        debug!(file = %file.display(), "deleted certificate file");
                    }
                }
            }
        }

        self.chains.retain(|_, chain| !chain.is_empty());

        for (file, chain) in &self.chains {
            let mut content = String::new();
            let mut serializable = true;
            for cert in chain {
                match cert.export_pem() {
                    Ok(pem) => content.push_str(&String::from_utf8_lossy(&pem)),
                    Err(e) => {
                        error!(error = %e, "could not serialize certificate");
                        serializable = false;
                    }
                }
            }
            if !serializable {
                success = false;
                continue;
            }
            if let Err(e) = fs_utils::write_file_atomic(file, content.as_bytes()) {
                error!(file = %file.display(), error = %e, "certificate file export failed");
                success = false;
            }
        }

        success
    }
}

fn is_certificate_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| CERTIFICATE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn load_chain_file(path: &Path, encoding: EncodingFormat) -> Result<Vec<Certificate>, CertError> {
    let data = fs::read(path).map_err(|e| CertError::Load {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    let encoding = match path.extension().and_then(|e| e.to_str()) {
        Some("der") => EncodingFormat::Der,
        _ => encoding,
    };

    let certs = Certificate::parse_many(&data, encoding).map_err(|e| CertError::Load {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    Ok(certs
        .into_iter()
        .map(|mut c| {
            c.set_path(path);
            c
        })
        .collect())
}
