//! In-memory storage backend
//!
//! Default store implementation keeping all values in a single map under
//! the persisted key layout. Suitable for tests and single-instance
//! development deployments; data is lost on restart.

use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use async_trait::async_trait;
use marblemesh_core::{Certificate, Manifest, PrivateKey, Secret};
use tracing::debug;

use super::{Store, StoreError};

const SECRET_PREFIX: &str = "secrets/";

/// In-memory store implementation
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    /// Create a new empty store
    pub fn new() -> Self {
        Self::default()
    }

    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let values = self.values.read().unwrap();
        values
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotSet(key.to_string()))
    }

    fn put(&self, key: String, value: Vec<u8>) {
        let mut values = self.values.write().unwrap();
        values.insert(key, value);
    }

    fn decode_json<T: serde::de::DeserializeOwned>(key: &str, raw: &[u8]) -> Result<T, StoreError> {
        serde_json::from_slice(raw).map_err(|err| StoreError::Corrupt(format!("{key}: {err}")))
    }

    fn encode_json<T: serde::Serialize>(key: &str, value: &T) -> Result<Vec<u8>, StoreError> {
        serde_json::to_vec(value).map_err(|err| StoreError::Internal(format!("{key}: {err}")))
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_certificate(&self, name: &str) -> Result<Certificate, StoreError> {
        self.get(&format!("cert/{name}")).map(Certificate::from)
    }

    async fn put_certificate(&self, name: &str, cert: &Certificate) -> Result<(), StoreError> {
        self.put(format!("cert/{name}"), cert.der().to_vec());
        Ok(())
    }

    async fn get_private_key(&self, name: &str) -> Result<PrivateKey, StoreError> {
        self.get(&format!("privk/{name}")).map(PrivateKey::from)
    }

    async fn put_private_key(&self, name: &str, key: &PrivateKey) -> Result<(), StoreError> {
        self.put(format!("privk/{name}"), key.as_bytes().to_vec());
        Ok(())
    }

    async fn get_manifest(&self, name: &str) -> Result<Manifest, StoreError> {
        let key = format!("manifest/{name}");
        let raw = self.get(&key)?;
        Self::decode_json(&key, &raw)
    }

    async fn put_manifest(&self, name: &str, manifest: &Manifest) -> Result<(), StoreError> {
        let key = format!("manifest/{name}");
        let encoded = Self::encode_json(&key, manifest)?;
        debug!(manifest = %name, "Storing manifest");
        self.put(key, encoded);
        Ok(())
    }

    async fn get_secret_map(&self) -> Result<BTreeMap<String, Secret>, StoreError> {
        let values = self.values.read().unwrap();
        let mut secrets = BTreeMap::new();
        for (key, raw) in values.iter() {
            if let Some(name) = key.strip_prefix(SECRET_PREFIX) {
                secrets.insert(name.to_string(), Self::decode_json(key, raw)?);
            }
        }
        Ok(secrets)
    }

    async fn put_secret(&self, name: &str, secret: &Secret) -> Result<(), StoreError> {
        let key = format!("{SECRET_PREFIX}{name}");
        let encoded = Self::encode_json(&key, secret)?;
        debug!(secret = %name, "Storing shared secret");
        self.put(key, encoded);
        Ok(())
    }

    async fn get_activations(&self, marble_type: &str) -> Result<u64, StoreError> {
        let key = format!("activations/{marble_type}");
        let raw = self.get(&key)?;
        let bytes: [u8; 8] = raw
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Corrupt(key))?;
        Ok(u64::from_le_bytes(bytes))
    }

    async fn put_activations(&self, marble_type: &str, count: u64) -> Result<(), StoreError> {
        self.put(
            format!("activations/{marble_type}"),
            count.to_le_bytes().to_vec(),
        );
        Ok(())
    }

    async fn increment_activations(&self, marble_type: &str) -> Result<u64, StoreError> {
        let key = format!("activations/{marble_type}");
        let mut values = self.values.write().unwrap();
        let current = match values.get(&key) {
            Some(raw) => {
                let bytes: [u8; 8] = raw
                    .as_slice()
                    .try_into()
                    .map_err(|_| StoreError::Corrupt(key.clone()))?;
                u64::from_le_bytes(bytes)
            }
            None => 0,
        };
        let next = current + 1;
        values.insert(key, next.to_le_bytes().to_vec());
        Ok(next)
    }
}
