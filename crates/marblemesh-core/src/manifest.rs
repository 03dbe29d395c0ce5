//! Manifest model: the signed policy describing a mesh
//!
//! The manifest defines which enclave packages are allowed, which marbles
//! (services) may be activated, their activation budget and parameters, the
//! transparent-TLS topology and the user-defined secrets. It is pure data:
//! the only behaviour is the [`Manifest::check`] consistency rule set.
//!
//! Manifests are committed from JSON. Unknown fields are rejected to prevent
//! silent policy drift, so a typo in a manifest fails the commit instead of
//! weakening the policy.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::CheckError;
use crate::quote::{InfrastructureProperties, PackageProperties};
use crate::rpc::Parameters;

/// Base64 (de)serialization for binary fields of the manifest and its
/// sealed-state form.
pub(crate) mod b64 {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(de::Error::custom)
    }
}

/// A DER-encoded X.509 certificate
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate(#[serde(with = "b64")] pub Vec<u8>);

impl Certificate {
    /// Wrap raw DER bytes
    pub fn new(der: Vec<u8>) -> Self {
        Self(der)
    }

    /// The DER encoding
    pub fn der(&self) -> &[u8] {
        &self.0
    }

    /// Whether the certificate is unset
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Vec<u8>> for Certificate {
    fn from(der: Vec<u8>) -> Self {
        Self(der)
    }
}

/// A binary private key (PKCS#8 DER for asymmetric keys, raw bytes for
/// symmetric material); a distinct type so the PEM encoder can pick the
/// right block label
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrivateKey(#[serde(with = "b64")] pub Vec<u8>);

impl PrivateKey {
    /// The encoded key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for PrivateKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// A binary public key (PKIX/SubjectPublicKeyInfo DER for asymmetric keys,
/// raw bytes for symmetric material)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey(#[serde(with = "b64")] pub Vec<u8>);

impl PublicKey {
    /// The encoded key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for PublicKey {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// A secret declaration and, once materialised, its value
///
/// The declaration half (`Type`, `Size`, `Shared`, `ValidFor`) comes from
/// the manifest; the value half (`Cert`, `Public`, `Private`) is filled by
/// the secret engine. Shared secrets are materialised once and persisted,
/// per-marble secrets are regenerated on every activation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "PascalCase")]
pub struct Secret {
    /// Secret type: `symmetric-key`, `cert-ecdsa`, `cert-ed25519` or `cert-rsa`
    #[serde(rename = "Type")]
    pub kind: String,
    /// Size in bits (symmetric keys: key length, RSA: modulus length)
    pub size: u32,
    /// Whether the secret is shared across all marbles
    pub shared: bool,
    /// Materialised certificate for `cert-*` secrets
    pub cert: Certificate,
    /// Certificate validity in days for `cert-*` secrets
    pub valid_for: u32,
    /// Materialised private half
    pub private: PrivateKey,
    /// Materialised public half
    pub public: PublicKey,
}

/// A service in the mesh that is verified and parameterised by the
/// coordinator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "PascalCase")]
pub struct Marble {
    /// References one of the allowed packages of the manifest
    pub package: String,
    /// Limits how many instances of this marble may activate; 0 means
    /// unlimited
    pub max_activations: u64,
    /// Files, environment and argv handed to the application, with secret
    /// placeholders
    pub parameters: Parameters,
    /// Transparent-TLS tags applying to this marble
    #[serde(rename = "TLS")]
    pub tls: Vec<String>,
}

/// One endpoint entry of a TLS tag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "PascalCase")]
pub struct TlsTagEntry {
    /// Remote address, only meaningful for outgoing entries
    pub addr: String,
    /// TCP port
    pub port: u16,
    /// Name of a user secret whose certificate/key serve the endpoint
    /// instead of the marble credentials (incoming entries only)
    pub cert: String,
    /// Disable client authentication on this incoming endpoint
    pub disable_client_auth: bool,
}

/// The endpoints covered by one TLS tag
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "PascalCase")]
pub struct TlsTag {
    /// Ports the marble accepts mesh connections on
    pub incoming: Vec<TlsTagEntry>,
    /// Remote endpoints the marble dials with mesh credentials
    pub outgoing: Vec<TlsTagEntry>,
}

/// The rules of a mesh
///
/// `main` is the committed policy; an `update` manifest may overlay the
/// `SecurityVersion` of packages and nothing else.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "PascalCase")]
pub struct Manifest {
    /// Allowed enclave packages and their attestation properties
    pub packages: BTreeMap<String, PackageProperties>,
    /// Allowed infrastructure providers; empty means any infrastructure is
    /// accepted
    pub infrastructures: BTreeMap<String, InfrastructureProperties>,
    /// Allowed services with their package reference and parameters
    pub marbles: BTreeMap<String, Marble>,
    /// Transparent-TLS topology, keyed by tag
    #[serde(rename = "TLS")]
    pub tls: BTreeMap<String, TlsTag>,
    /// User-defined secrets to generate
    pub secrets: BTreeMap<String, Secret>,
    /// TLS certificates authenticating clients of the admin API
    pub clients: BTreeMap<String, Certificate>,
    /// Public key to which the state encryption key is escrowed
    pub recovery_key: String,
}

impl Manifest {
    /// Check that the manifest is consistent
    ///
    /// Deterministic and side-effect-free: at least one package, at least
    /// one marble, and every marble's package reference resolves.
    pub fn check(&self) -> Result<(), CheckError> {
        if self.packages.is_empty() {
            return Err(CheckError::NoPackages);
        }
        if self.marbles.is_empty() {
            return Err(CheckError::NoMarbles);
        }
        for (name, marble) in &self.marbles {
            if !self.packages.contains_key(&marble.package) {
                return Err(CheckError::MissingPackage {
                    marble: name.clone(),
                    package: marble.package.clone(),
                });
            }
        }
        Ok(())
    }
}
