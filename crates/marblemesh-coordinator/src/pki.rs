//! Coordinator PKI: CA bootstrap and marble certificate issuance
//!
//! The coordinator owns a two-level ECDSA P-256 hierarchy created at the
//! first manifest commit:
//!
//! ```text
//! Root CA (self-signed, offline after bootstrap)
//!   └── Intermediate CA (pathlen=0, signs marble leaf certificates)
//! ```
//!
//! Marble leaves are issued against a CSR: the CSR contributes the subject
//! (CommonName and Organization are overwritten) and the requested
//! SubjectAlternativeName entries, while the certified public key is the
//! fresh key pair the coordinator generates for the marble.

use std::net::IpAddr;

use marblemesh_core::{Certificate, PrivateKey, PublicKey};
use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{HasPublic, PKey, PKeyRef, Private};
use openssl::rsa::Rsa;
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509Builder, X509NameBuilder, X509Req, X509};
use x509_parser::prelude::*;

use crate::error::Error;

const ORGANIZATION: &str = "MarbleMesh Coordinator";
const ROOT_CA_COMMON_NAME: &str = "MarbleMesh Root CA";
const INTERMEDIATE_CA_COMMON_NAME: &str = "MarbleMesh Intermediate CA";

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const SERIAL_NUMBER_BITS: i32 = 128;
// 9999-12-31T23:59:59Z; X.509 encoders reject larger GeneralizedTime values
const MAX_NOT_AFTER_UNIX: i64 = 253_402_300_799;

const ROOT_CA_PATH_LENGTH: u32 = 1;
const INTERMEDIATE_CA_PATH_LENGTH: u32 = 0;
const DEFAULT_RSA_KEY_BITS: u32 = 2048;

/// The CA material created at manifest commit
#[derive(Debug, Clone)]
pub struct CaHierarchy {
    /// Self-signed root certificate, DER
    pub root_cert: Certificate,
    /// Root private key, PKCS#8 DER
    pub root_key: PrivateKey,
    /// Intermediate certificate signed by the root, DER
    pub intermediate_cert: Certificate,
    /// Intermediate private key, PKCS#8 DER
    pub intermediate_key: PrivateKey,
}

/// Generate a fresh ECDSA P-256 key pair
pub(crate) fn p256_keypair() -> Result<PKey<Private>, Error> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1)?;
    let key = EcKey::generate(&group)?;
    Ok(PKey::from_ec_key(key)?)
}

/// The raw private scalar of a PKCS#8-encoded EC key, used as input key
/// material for the seal-key derivation
pub(crate) fn private_scalar(key: &PrivateKey) -> Result<Vec<u8>, Error> {
    let pkey = PKey::private_key_from_pkcs8(key.as_bytes())?;
    let ec = pkey.ec_key()?;
    Ok(ec.private_key().to_vec())
}

fn random_serial(builder: &mut X509Builder) -> Result<(), Error> {
    let mut serial = BigNum::new()?;
    serial.rand(SERIAL_NUMBER_BITS, MsbOption::MAYBE_ZERO, false)?;
    let serial = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial)?;
    Ok(())
}

fn ca_name(common_name: &str) -> Result<openssl::x509::X509Name, Error> {
    let mut name = X509NameBuilder::new()?;
    name.append_entry_by_nid(Nid::COMMONNAME, common_name)?;
    name.append_entry_by_nid(Nid::ORGANIZATIONNAME, ORGANIZATION)?;
    Ok(name.build())
}

fn build_ca_certificate(
    common_name: &str,
    key: &PKey<Private>,
    issuer: Option<(&X509, &PKey<Private>)>,
    path_length: u32,
) -> Result<X509, Error> {
    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;
    random_serial(&mut builder)?;

    let subject = ca_name(common_name)?;
    builder.set_subject_name(&subject)?;
    match issuer {
        Some((issuer_cert, _)) => builder.set_issuer_name(issuer_cert.subject_name())?,
        None => builder.set_issuer_name(&subject)?,
    }

    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::from_unix(MAX_NOT_AFTER_UNIX)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(key)?;

    let mut constraints = BasicConstraints::new();
    constraints.critical().ca().pathlen(path_length);
    builder.append_extension(constraints.build()?)?;

    let mut usage = KeyUsage::new();
    usage.critical().key_cert_sign().crl_sign().digital_signature();
    builder.append_extension(usage.build()?)?;

    let signing_key = issuer.map(|(_, signer)| signer).unwrap_or(key);
    builder.sign(signing_key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Create the root and intermediate CA at first manifest commit
pub fn generate_ca_hierarchy() -> Result<CaHierarchy, Error> {
    let root_key = p256_keypair()?;
    let root_cert = build_ca_certificate(ROOT_CA_COMMON_NAME, &root_key, None, ROOT_CA_PATH_LENGTH)?;

    let intermediate_key = p256_keypair()?;
    let intermediate_cert = build_ca_certificate(
        INTERMEDIATE_CA_COMMON_NAME,
        &intermediate_key,
        Some((&root_cert, &root_key)),
        INTERMEDIATE_CA_PATH_LENGTH,
    )?;

    Ok(CaHierarchy {
        root_cert: Certificate::new(root_cert.to_der()?),
        root_key: PrivateKey::from(root_key.private_key_to_pkcs8()?),
        intermediate_cert: Certificate::new(intermediate_cert.to_der()?),
        intermediate_key: PrivateKey::from(intermediate_key.private_key_to_pkcs8()?),
    })
}

/// DNS names and IP addresses requested in a CSR's
/// SubjectAlternativeName extension
///
/// rust-openssl exposes no safe reader for request extensions, so the SAN
/// entries are pulled out with `x509-parser` and re-emitted on the leaf.
fn csr_subject_alt_names(csr_der: &[u8]) -> Result<(Vec<String>, Vec<IpAddr>), Error> {
    let (_, csr) =
        X509CertificationRequest::from_der(csr_der).map_err(|_| Error::MalformedCsr)?;

    let mut dns_names = Vec::new();
    let mut ip_addresses = Vec::new();
    if let Some(extensions) = csr.requested_extensions() {
        for extension in extensions {
            if let ParsedExtension::SubjectAlternativeName(san) = extension {
                for general_name in &san.general_names {
                    match general_name {
                        GeneralName::DNSName(name) => dns_names.push((*name).to_string()),
                        GeneralName::IPAddress(bytes) => {
                            if let Ok(v4) = <[u8; 4]>::try_from(*bytes) {
                                ip_addresses.push(IpAddr::from(v4));
                            } else if let Ok(v6) = <[u8; 16]>::try_from(*bytes) {
                                ip_addresses.push(IpAddr::from(v6));
                            }
                        }
                        _ => {}
                    }
                }
            }
        }
    }
    Ok((dns_names, ip_addresses))
}

/// Sign a marble CSR into a leaf certificate
///
/// The CSR must carry a valid self-signature. CommonName is overwritten
/// with the marble UUID and Organization with the issuer organization of
/// the signing certificate; remaining subject entries, DNS names and IP
/// addresses are taken from the CSR. The certified key is `leaf_public`,
/// the key pair generated for the marble, not the CSR key.
pub fn sign_marble_csr<T: HasPublic>(
    csr_der: &[u8],
    leaf_public: &PKeyRef<T>,
    marble_uuid: &str,
    intermediate_cert: &Certificate,
    intermediate_key: &PrivateKey,
) -> Result<Certificate, Error> {
    let request = X509Req::from_der(csr_der).map_err(|_| Error::MalformedCsr)?;
    let request_key = request.public_key().map_err(|_| Error::MalformedCsr)?;
    if !request.verify(&request_key).map_err(|_| Error::MalformedCsr)? {
        return Err(Error::InvalidCsrSignature);
    }

    let issuer = X509::from_der(intermediate_cert.der())?;
    let issuer_key = PKey::private_key_from_pkcs8(intermediate_key.as_bytes())?;

    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;
    random_serial(&mut builder)?;

    let mut subject = X509NameBuilder::new()?;
    for entry in request.subject_name().entries() {
        let nid = entry.object().nid();
        if nid == Nid::COMMONNAME || nid == Nid::ORGANIZATIONNAME {
            continue;
        }
        let value = entry.data().as_utf8().map_err(|_| Error::MalformedCsr)?;
        subject.append_entry_by_nid(nid, &value)?;
    }
    subject.append_entry_by_nid(Nid::COMMONNAME, marble_uuid)?;
    for organization in issuer.issuer_name().entries_by_nid(Nid::ORGANIZATIONNAME) {
        let value = organization.data().as_utf8()?;
        subject.append_entry_by_nid(Nid::ORGANIZATIONNAME, &value)?;
    }
    let subject = subject.build();
    builder.set_subject_name(&subject)?;
    builder.set_issuer_name(issuer.subject_name())?;

    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::from_unix(MAX_NOT_AFTER_UNIX)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(leaf_public)?;

    let mut constraints = BasicConstraints::new();
    constraints.critical();
    builder.append_extension(constraints.build()?)?;

    let mut usage = KeyUsage::new();
    usage.critical().digital_signature().key_agreement();
    builder.append_extension(usage.build()?)?;

    let mut extended = ExtendedKeyUsage::new();
    extended.server_auth().client_auth();
    builder.append_extension(extended.build()?)?;

    let (dns_names, ip_addresses) = csr_subject_alt_names(csr_der)?;
    if !dns_names.is_empty() || !ip_addresses.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for name in &dns_names {
            san.dns(name);
        }
        for address in &ip_addresses {
            san.ip(&address.to_string());
        }
        let extension = {
            let context = builder.x509v3_context(Some(&issuer), None);
            san.build(&context)?
        };
        builder.append_extension(extension)?;
    }

    builder.sign(&issuer_key, MessageDigest::sha256())?;
    Ok(Certificate::new(builder.build().to_der()?))
}

/// Generate a self-signed certificate plus key pair for a user-defined
/// `cert-*` secret
pub(crate) fn generate_secret_certificate(
    name: &str,
    kind: &str,
    size: u32,
    valid_for_days: u32,
) -> Result<(Certificate, PublicKey, PrivateKey), Error> {
    let key = match kind {
        "cert-ecdsa" => p256_keypair()?,
        "cert-ed25519" => PKey::generate_ed25519()?,
        "cert-rsa" => {
            let bits = if size == 0 { DEFAULT_RSA_KEY_BITS } else { size };
            PKey::from_rsa(Rsa::generate(bits)?)?
        }
        other => {
            return Err(Error::InvalidSecretSpec {
                name: name.to_string(),
                reason: format!("unsupported certificate type '{other}'"),
            })
        }
    };
    // Ed25519 signing embeds its own digest
    let digest = if kind == "cert-ed25519" {
        MessageDigest::null()
    } else {
        MessageDigest::sha256()
    };

    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;
    random_serial(&mut builder)?;

    let mut subject = X509NameBuilder::new()?;
    subject.append_entry_by_nid(Nid::COMMONNAME, name)?;
    subject.append_entry_by_nid(Nid::ORGANIZATIONNAME, ORGANIZATION)?;
    let subject = subject.build();
    builder.set_subject_name(&subject)?;
    builder.set_issuer_name(&subject)?;

    let not_before = Asn1Time::days_from_now(0)?;
    builder.set_not_before(&not_before)?;
    let not_after = Asn1Time::days_from_now(valid_for_days)?;
    builder.set_not_after(&not_after)?;
    builder.set_pubkey(&key)?;

    let mut constraints = BasicConstraints::new();
    constraints.critical();
    builder.append_extension(constraints.build()?)?;

    let mut usage = KeyUsage::new();
    usage.critical().digital_signature().key_encipherment();
    builder.append_extension(usage.build()?)?;

    builder.sign(&key, digest)?;

    Ok((
        Certificate::new(builder.build().to_der()?),
        PublicKey::from(key.public_key_to_der()?),
        PrivateKey::from(key.private_key_to_pkcs8()?),
    ))
}
