//! Secret engine: per-marble authentication secrets and user-defined
//! secrets
//!
//! Per activation the engine generates a fresh ECDSA P-256 key pair for
//! the marble, derives its 32-byte sealing key from the root private
//! scalar and the instance UUID, and has the PKI sign the marble's CSR
//! into a leaf certificate. User-defined secrets declared in the manifest
//! are materialised here as well: per-marble secrets on every activation,
//! shared secrets once (the coordinator persists those).
//!
//! The random source is injectable so tests can seed it; the derivation
//! itself is deterministic in the root key and the marble UUID.

use std::collections::BTreeMap;
use std::sync::Mutex;

use hkdf::Hkdf;
use marblemesh_core::template::ReservedSecrets;
use marblemesh_core::{Certificate, PrivateKey, PublicKey, Secret};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use uuid::Uuid;

use crate::error::Error;
use crate::pki;

/// Length of the derived per-marble sealing key
pub const SEAL_KEY_LENGTH: usize = 32;

const DEFAULT_CERT_VALIDITY_DAYS: u32 = 365;

/// Generates activation secrets
pub struct SecretEngine {
    rng: Mutex<Box<dyn RngCore + Send>>,
}

impl Default for SecretEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl SecretEngine {
    /// Engine backed by the operating system RNG
    pub fn new() -> Self {
        Self {
            rng: Mutex::new(Box::new(OsRng)),
        }
    }

    /// Engine backed by a caller-provided RNG; lets tests seed the
    /// symmetric-key material
    pub fn with_rng(rng: Box<dyn RngCore + Send>) -> Self {
        Self {
            rng: Mutex::new(rng),
        }
    }

    /// Generate the coordinator-issued secrets for one marble activation:
    /// a fresh key pair, the sealing key and the leaf certificate signed
    /// against the CSR
    pub fn generate_marble_auth_secrets(
        &self,
        csr_der: &[u8],
        marble_uuid: &Uuid,
        root_key: &PrivateKey,
        intermediate_cert: &Certificate,
        intermediate_key: &PrivateKey,
    ) -> Result<ReservedSecrets, Error> {
        let marble_key = pki::p256_keypair()?;
        let encoded_private = PrivateKey::from(marble_key.private_key_to_pkcs8()?);
        let encoded_public = PublicKey::from(marble_key.public_key_to_der()?);

        let seal_key = self.derive_seal_key(root_key, marble_uuid)?;

        let leaf_cert = pki::sign_marble_csr(
            csr_der,
            &marble_key,
            &marble_uuid.to_string(),
            intermediate_cert,
            intermediate_key,
        )?;

        Ok(ReservedSecrets {
            root_ca: Secret {
                cert: intermediate_cert.clone(),
                ..Default::default()
            },
            marble_cert: Secret {
                cert: leaf_cert,
                public: encoded_public,
                private: encoded_private,
                ..Default::default()
            },
            seal_key: Secret {
                public: PublicKey::from(seal_key.to_vec()),
                private: PrivateKey::from(seal_key.to_vec()),
                ..Default::default()
            },
        })
    }

    /// Derive the marble's sealing key from the root private scalar, with
    /// the instance UUID as salt
    pub fn derive_seal_key(
        &self,
        root_key: &PrivateKey,
        marble_uuid: &Uuid,
    ) -> Result<[u8; SEAL_KEY_LENGTH], Error> {
        let scalar = pki::private_scalar(root_key)?;
        let hkdf = Hkdf::<Sha256>::new(Some(marble_uuid.as_bytes()), &scalar);
        let mut seal_key = [0u8; SEAL_KEY_LENGTH];
        hkdf.expand(&[], &mut seal_key)
            .map_err(|err| Error::Crypto(format!("seal key derivation failed: {err}")))?;
        Ok(seal_key)
    }

    /// Materialise one user-defined secret according to its declaration
    pub fn generate_user_secret(&self, name: &str, spec: &Secret) -> Result<Secret, Error> {
        let mut secret = Secret {
            kind: spec.kind.clone(),
            size: spec.size,
            shared: spec.shared,
            valid_for: spec.valid_for,
            ..Default::default()
        };

        match spec.kind.as_str() {
            "symmetric-key" => {
                if spec.size == 0 || spec.size % 8 != 0 {
                    return Err(Error::InvalidSecretSpec {
                        name: name.to_string(),
                        reason: format!(
                            "symmetric key size must be a positive multiple of 8, got {}",
                            spec.size
                        ),
                    });
                }
                let mut key = vec![0u8; spec.size as usize / 8];
                self.rng.lock().unwrap().fill_bytes(&mut key);
                secret.public = PublicKey::from(key.clone());
                secret.private = PrivateKey::from(key);
            }
            "cert-ecdsa" | "cert-ed25519" | "cert-rsa" => {
                let valid_for = if spec.valid_for == 0 {
                    DEFAULT_CERT_VALIDITY_DAYS
                } else {
                    spec.valid_for
                };
                let (cert, public, private) =
                    pki::generate_secret_certificate(name, &spec.kind, spec.size, valid_for)?;
                secret.cert = cert;
                secret.public = public;
                secret.private = private;
                secret.valid_for = valid_for;
            }
            other => {
                return Err(Error::InvalidSecretSpec {
                    name: name.to_string(),
                    reason: format!("unsupported secret type '{other}'"),
                });
            }
        }
        Ok(secret)
    }

    /// Materialise a batch of user-defined secrets
    pub fn generate_user_secrets<'a, I>(&self, specs: I) -> Result<BTreeMap<String, Secret>, Error>
    where
        I: IntoIterator<Item = (&'a String, &'a Secret)>,
    {
        let mut secrets = BTreeMap::new();
        for (name, spec) in specs {
            secrets.insert(name.clone(), self.generate_user_secret(name, spec)?);
        }
        Ok(secrets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn root_key() -> PrivateKey {
        pki::generate_ca_hierarchy().unwrap().root_key
    }

    #[test]
    fn seal_key_is_deterministic_in_root_key_and_uuid() {
        let engine = SecretEngine::new();
        let root = root_key();
        let uuid = Uuid::parse_str("00000000-0000-0000-0000-000000000001").unwrap();

        let first = engine.derive_seal_key(&root, &uuid).unwrap();
        let second = engine.derive_seal_key(&root, &uuid).unwrap();
        assert_eq!(first, second);
        assert_eq!(first.len(), SEAL_KEY_LENGTH);

        let other_uuid = Uuid::parse_str("00000000-0000-0000-0000-000000000002").unwrap();
        assert_ne!(engine.derive_seal_key(&root, &other_uuid).unwrap(), first);
    }

    #[test]
    fn symmetric_secrets_honour_size_and_seeded_rng() {
        let spec = Secret {
            kind: "symmetric-key".into(),
            size: 128,
            ..Default::default()
        };

        let engine_a = SecretEngine::with_rng(Box::new(StdRng::seed_from_u64(7)));
        let engine_b = SecretEngine::with_rng(Box::new(StdRng::seed_from_u64(7)));

        let a = engine_a.generate_user_secret("apiKey", &spec).unwrap();
        let b = engine_b.generate_user_secret("apiKey", &spec).unwrap();

        assert_eq!(a.public.as_bytes().len(), 16);
        assert_eq!(a.public, b.public);
        assert_eq!(a.public.as_bytes(), a.private.as_bytes());
    }

    #[test]
    fn symmetric_secret_size_must_be_byte_aligned() {
        let engine = SecretEngine::new();
        for size in [0, 5, 127] {
            let spec = Secret {
                kind: "symmetric-key".into(),
                size,
                ..Default::default()
            };
            assert!(matches!(
                engine.generate_user_secret("bad", &spec).unwrap_err(),
                Error::InvalidSecretSpec { .. }
            ));
        }
    }

    #[test]
    fn unknown_secret_type_is_rejected() {
        let engine = SecretEngine::new();
        let spec = Secret {
            kind: "quantum-key".into(),
            size: 64,
            ..Default::default()
        };
        assert!(matches!(
            engine.generate_user_secret("weird", &spec).unwrap_err(),
            Error::InvalidSecretSpec { .. }
        ));
    }

    #[test]
    fn auth_secrets_carry_intermediate_and_fresh_leaf() {
        let ca = pki::generate_ca_hierarchy().unwrap();
        let engine = SecretEngine::new();
        let uuid = Uuid::parse_str("00000000-0000-0000-0000-00000000cafe").unwrap();

        let csr = {
            use openssl::hash::MessageDigest;
            use openssl::nid::Nid;
            use openssl::x509::{X509NameBuilder, X509Req};
            let key = crate::pki::p256_keypair().unwrap();
            let mut builder = X509Req::builder().unwrap();
            let mut name = X509NameBuilder::new().unwrap();
            name.append_entry_by_nid(Nid::COMMONNAME, "marble").unwrap();
            let name = name.build();
            builder.set_subject_name(&name).unwrap();
            builder.set_pubkey(&key).unwrap();
            builder.sign(&key, MessageDigest::sha256()).unwrap();
            builder.build().to_der().unwrap()
        };

        let auth = engine
            .generate_marble_auth_secrets(&csr, &uuid, &ca.root_key, &ca.intermediate_cert, &ca.intermediate_key)
            .unwrap();

        assert_eq!(auth.root_ca.cert, ca.intermediate_cert);
        assert!(!auth.marble_cert.cert.is_empty());
        assert!(!auth.marble_cert.public.as_bytes().is_empty());
        assert!(!auth.marble_cert.private.as_bytes().is_empty());
        assert_eq!(auth.seal_key.public.as_bytes().len(), SEAL_KEY_LENGTH);
        assert_eq!(auth.seal_key.public, PublicKey::from(auth.seal_key.private.as_bytes().to_vec()));
    }
}
