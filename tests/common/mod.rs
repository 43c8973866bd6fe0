//! Shared fixtures: generated PKIs and pre-wired certificate stores.

#![allow(dead_code)]

use std::path::{Path, PathBuf};

use anyhow::Result;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{Asn1Flag, EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509, X509Extension, X509Name};

use evse_pki::security::{SecurityManager, SecurityOptions, StorePaths};
use evse_pki::types::EncodingFormat;
use evse_pki::Certificate;

/// Install the test log subscriber once; RUST_LOG selects verbosity.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

pub fn ec_key() -> Result<PKey<Private>> {
    let mut group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    group.set_asn1_flag(Asn1Flag::NAMED_CURVE);
    Ok(PKey::from_ec_key(EcKey::generate(&group)?)?)
}

pub struct CertSpec<'a> {
    pub cn: &'a str,
    pub issuer: Option<(&'a Certificate, &'a PKey<Private>)>,
    pub is_ca: bool,
    pub san_dns: Option<&'a str>,
    pub ocsp_url: Option<&'a str>,
    pub not_before_days: i64,
    pub not_after_days: i64,
}

impl<'a> Default for CertSpec<'a> {
    fn default() -> Self {
        Self {
            cn: "unnamed",
            issuer: None,
            is_ca: false,
            san_dns: None,
            ocsp_url: None,
            not_before_days: -1,
            not_after_days: 365,
        }
    }
}

#[allow(deprecated)]
pub fn make_cert(spec: CertSpec<'_>) -> Result<(Certificate, PKey<Private>)> {
    let key = ec_key()?;

    let mut name = X509Name::builder()?;
    name.append_entry_by_nid(Nid::COMMONNAME, spec.cn)?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, "EVSE Test PKI")?;
    name.append_entry_by_nid(Nid::COUNTRYNAME, "DE")?;
    let name = name.build();

    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&*serial.to_asn1_integer()?)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(&key)?;

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)?
        .as_secs() as i64;
    builder.set_not_before(&*Asn1Time::from_unix(now + spec.not_before_days * 86_400)?)?;
    builder.set_not_after(&*Asn1Time::from_unix(now + spec.not_after_days * 86_400)?)?;

    if spec.is_ca {
        builder.append_extension(BasicConstraints::new().critical().ca().build()?)?;
        builder.append_extension(KeyUsage::new().critical().key_cert_sign().crl_sign().build()?)?;
    } else {
        builder.append_extension(BasicConstraints::new().build()?)?;
        builder.append_extension(
            KeyUsage::new().critical().digital_signature().key_agreement().build()?,
        )?;
    }

    let issuer_x509: Option<&openssl::x509::X509Ref> =
        spec.issuer.map(|(cert, _)| &**cert.x509());
    match issuer_x509 {
        Some(issuer) => builder.set_issuer_name(issuer.subject_name())?,
        None => builder.set_issuer_name(&name)?,
    }

    let mut contextual = Vec::new();
    {
        let ctx = builder.x509v3_context(issuer_x509, None);
        if let Some(dns) = spec.san_dns {
            contextual.push(SubjectAlternativeName::new().dns(dns).build(&ctx)?);
        }
        if let Some(url) = spec.ocsp_url {
            contextual.push(X509Extension::new_nid(
                None,
                Some(&ctx),
                Nid::INFO_ACCESS,
                &format!("OCSP;URI:{url}"),
            )?);
        }
    }
    for extension in contextual {
        builder.append_extension(extension)?;
    }

    match spec.issuer {
        Some((_, issuer_key)) => builder.sign(issuer_key, MessageDigest::sha256())?,
        None => builder.sign(&key, MessageDigest::sha256())?,
    }

    Ok((Certificate::new(builder.build()), key))
}

pub fn ca_cert(
    cn: &str,
    issuer: Option<(&Certificate, &PKey<Private>)>,
) -> Result<(Certificate, PKey<Private>)> {
    make_cert(CertSpec {
        cn,
        issuer,
        is_ca: true,
        ..Default::default()
    })
}

pub fn leaf_cert(
    cn: &str,
    issuer: &Certificate,
    issuer_key: &PKey<Private>,
) -> Result<(Certificate, PKey<Private>)> {
    make_cert(CertSpec {
        cn,
        issuer: Some((issuer, issuer_key)),
        ..Default::default()
    })
}

pub fn write_cert(path: &Path, cert: &Certificate) -> Result<()> {
    std::fs::write(path, cert.export_pem()?)?;
    Ok(())
}

pub fn write_chain(path: &Path, certs: &[&Certificate]) -> Result<()> {
    let mut out = Vec::new();
    for cert in certs {
        out.extend_from_slice(&cert.export_pem()?);
    }
    std::fs::write(path, out)?;
    Ok(())
}

pub fn write_key(path: &Path, key: &PKey<Private>) -> Result<()> {
    std::fs::write(path, key.private_key_to_pem_pkcs8()?)?;
    Ok(())
}

pub fn pem_string(cert: &Certificate) -> String {
    String::from_utf8(cert.export_pem().unwrap()).unwrap()
}

pub fn chain_pem(certs: &[&Certificate]) -> String {
    certs.iter().map(|c| pem_string(c)).collect()
}

/// A certificate store rooted in a temp directory, with a V2G PKI
/// (root -> sub-CA -> SECC leaf + key) and a CSMS root pre-installed.
pub struct TestStore {
    pub dir: tempfile::TempDir,
    pub paths: StorePaths,
    pub v2g_root: Certificate,
    pub v2g_root_key: PKey<Private>,
    pub v2g_sub: Certificate,
    pub v2g_sub_key: PKey<Private>,
    pub secc_leaf: Certificate,
    pub secc_leaf_key: PKey<Private>,
    pub csms_root: Certificate,
    pub csms_root_key: PKey<Private>,
}

impl TestStore {
    pub fn new() -> Result<Self> {
        init_tracing();
        let dir = tempfile::tempdir()?;
        let base = dir.path();

        let paths = StorePaths {
            csms_ca_bundle: base.join("ca/csms/CSMS_ROOT_CA.pem"),
            mf_ca_bundle: base.join("ca/mf/MF_ROOT_CA.pem"),
            mo_ca_bundle: base.join("ca/mo/MO_ROOT_CA.pem"),
            v2g_ca_bundle: base.join("ca/v2g/V2G_ROOT_CA.pem"),
            csms_leaf_cert_dir: base.join("client/csms"),
            csms_leaf_key_dir: base.join("client/csms"),
            secc_leaf_cert_dir: base.join("client/cso"),
            secc_leaf_key_dir: base.join("client/cso"),
        };

        let (v2g_root, v2g_root_key) = ca_cert("V2G Test Root", None)?;
        let (v2g_sub, v2g_sub_key) = make_cert(CertSpec {
            cn: "V2G Test SubCA",
            issuer: Some((&v2g_root, &v2g_root_key)),
            is_ca: true,
            ocsp_url: Some("http://ocsp.v2g.test/"),
            ..Default::default()
        })?;
        let (secc_leaf, secc_leaf_key) = leaf_cert("SECC Leaf", &v2g_sub, &v2g_sub_key)?;
        let (csms_root, csms_root_key) = ca_cert("CSMS Test Root", None)?;

        std::fs::create_dir_all(paths.csms_leaf_cert_dir.clone())?;
        std::fs::create_dir_all(paths.secc_leaf_cert_dir.clone())?;
        for bundle in [
            &paths.csms_ca_bundle,
            &paths.mf_ca_bundle,
            &paths.mo_ca_bundle,
            &paths.v2g_ca_bundle,
        ] {
            std::fs::create_dir_all(bundle.parent().unwrap())?;
        }

        write_chain(&paths.v2g_ca_bundle, &[&v2g_root, &v2g_sub])?;
        write_cert(&paths.csms_ca_bundle, &csms_root)?;

        write_cert(&paths.secc_leaf_cert_dir.join("SECC_LEAF_seed.pem"), &secc_leaf)?;
        write_chain(
            &paths.secc_leaf_cert_dir.join("SECC_CHAIN_seed.pem"),
            &[&secc_leaf, &v2g_sub],
        )?;
        write_key(&paths.secc_leaf_key_dir.join("SECC_LEAF_seed.key"), &secc_leaf_key)?;

        Ok(Self {
            dir,
            paths,
            v2g_root,
            v2g_root_key,
            v2g_sub,
            v2g_sub_key,
            secc_leaf,
            secc_leaf_key,
            csms_root,
            csms_root_key,
        })
    }

    pub fn manager(&self) -> SecurityManager {
        SecurityManager::new(self.paths.clone(), SecurityOptions::default()).unwrap()
    }

    pub fn manager_with(&self, options: SecurityOptions) -> SecurityManager {
        SecurityManager::new(self.paths.clone(), options).unwrap()
    }

    /// Files currently in the SECC leaf certificate directory.
    pub fn secc_leaf_files(&self) -> Vec<PathBuf> {
        let mut files: Vec<_> = std::fs::read_dir(&self.paths.secc_leaf_cert_dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.is_file())
            .collect();
        files.sort();
        files
    }

    pub fn v2g_bundle_certificates(&self) -> usize {
        evse_pki::CertificateBundle::from_path(&self.paths.v2g_ca_bundle, EncodingFormat::Pem)
            .unwrap()
            .certificate_count()
    }
}
