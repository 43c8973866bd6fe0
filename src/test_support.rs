//! Certificate and key builders shared by the unit tests.

use std::path::Path;

use anyhow::Result;
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{Asn1Flag, EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{BasicConstraints, KeyUsage, SubjectAlternativeName};
use openssl::x509::{X509, X509Name};

use crate::certificate::Certificate;

pub fn ec_key() -> Result<PKey<Private>> {
    let mut group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    group.set_asn1_flag(Asn1Flag::NAMED_CURVE);
    Ok(PKey::from_ec_key(EcKey::generate(&group)?)?)
}

fn subject(cn: &str) -> Result<X509Name> {
    let mut builder = X509Name::builder()?;
    builder.append_entry_by_nid(Nid::COMMONNAME, cn)?;
    builder.append_entry_by_nid(Nid::ORGANIZATIONNAME, "EVSE Test PKI")?;
    builder.append_entry_by_nid(Nid::COUNTRYNAME, "DE")?;
    Ok(builder.build())
}

fn random_serial() -> Result<openssl::asn1::Asn1Integer> {
    let mut serial = BigNum::new()?;
    serial.rand(64, MsbOption::MAYBE_ZERO, false)?;
    Ok(serial.to_asn1_integer()?)
}

struct CertSpec<'a> {
    cn: &'a str,
    issuer: Option<(&'a Certificate, &'a PKey<Private>)>,
    is_ca: bool,
    san_dns: Option<&'a str>,
    not_before_days: i64,
    not_after_days: i64,
}

fn build(spec: CertSpec<'_>) -> Result<(Certificate, PKey<Private>)> {
    let key = ec_key()?;
    let name = subject(spec.cn)?;

    let mut builder = X509::builder()?;
    builder.set_version(2)?;
    builder.set_serial_number(&*random_serial()?)?;
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

    match spec.issuer {
        Some((issuer_cert, issuer_key)) => {
            builder.set_issuer_name(issuer_cert.x509().subject_name())?;
            if let Some(dns) = spec.san_dns {
                let ctx = builder.x509v3_context(Some(&**issuer_cert.x509()), None);
                let san = SubjectAlternativeName::new().dns(dns).build(&ctx)?;
                builder.append_extension(san)?;
            }
            builder.sign(issuer_key, MessageDigest::sha256())?;
        }
        None => {
            builder.set_issuer_name(&name)?;
            if let Some(dns) = spec.san_dns {
                let ctx = builder.x509v3_context(None, None);
                let san = SubjectAlternativeName::new().dns(dns).build(&ctx)?;
                builder.append_extension(san)?;
            }
            builder.sign(&key, MessageDigest::sha256())?;
        }
    }

    Ok((Certificate::new(builder.build()), key))
}

/// Self-signed (or issued, when `issuer` is given) CA certificate.
pub fn ca_cert(
    cn: &str,
    issuer: Option<(&Certificate, &PKey<Private>)>,
    days: i64,
) -> Result<(Certificate, PKey<Private>)> {
    build(CertSpec {
        cn,
        issuer,
        is_ca: true,
        san_dns: None,
        not_before_days: -1,
        not_after_days: days,
    })
}

/// End-entity certificate signed by `issuer`.
pub fn leaf_cert(
    cn: &str,
    issuer: &Certificate,
    issuer_key: &PKey<Private>,
    days: i64,
) -> Result<(Certificate, PKey<Private>)> {
    build(CertSpec {
        cn,
        issuer: Some((issuer, issuer_key)),
        is_ca: false,
        san_dns: None,
        not_before_days: -1,
        not_after_days: days,
    })
}

/// Self-signed certificate with an arbitrary validity window, in whole days
/// relative to now. Negative offsets lie in the past.
pub fn cert_with_window(
    cn: &str,
    not_before_days: i64,
    not_after_days: i64,
) -> Result<(Certificate, PKey<Private>)> {
    build(CertSpec {
        cn,
        issuer: None,
        is_ca: false,
        san_dns: None,
        not_before_days,
        not_after_days,
    })
}

pub fn write_cert(path: &Path, cert: &Certificate) -> Result<()> {
    std::fs::write(path, cert.export_pem()?)?;
    Ok(())
}

pub fn write_key(path: &Path, key: &PKey<Private>) -> Result<()> {
    std::fs::write(path, key.private_key_to_pem_pkcs8()?)?;
    Ok(())
}
