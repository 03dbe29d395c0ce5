//! The coordinator core: state machine and policy commits
//!
//! The coordinator is a state machine:
//!
//! ```text
//! AcceptingManifest ──set_manifest──► AcceptingMarbles ──update──► AcceptingMarbles
//!         └───────────────────recovery──────────────────────┘
//! ```
//!
//! Activation is accepted only in `AcceptingMarbles`. One coordinator-wide
//! lock serialises every activation from the state check through the
//! counter increment; activation frequency is low, and a consistent view
//! of manifest, overlay and budget outweighs throughput. The lock guards
//! the state itself, so holding it *is* the state gate.

mod activation;

use std::fmt;
use std::sync::Arc;

use marblemesh_core::{Manifest, QuoteVerifier};
use tokio::sync::Mutex;
use tracing::info;

use crate::error::Error;
use crate::pki;
use crate::secrets::SecretEngine;
use crate::storage::Store;

/// Coordinator lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// No manifest committed yet; activations are rejected
    AcceptingManifest,
    /// Manifest committed, CA bootstrapped; marbles may activate
    AcceptingMarbles,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::AcceptingManifest => f.write_str("accepting manifest"),
            State::AcceptingMarbles => f.write_str("accepting marbles"),
        }
    }
}

/// Coordinator configuration
#[derive(Debug, Clone, Copy, Default)]
pub struct CoordinatorConfig {
    /// Skip quote verification entirely; for development meshes on
    /// non-SGX hardware
    pub simulation_mode: bool,
}

/// The activation core of the mesh
///
/// Owns the CA material and the store for the life of the process;
/// per-marble material is created during activation, returned once and
/// never persisted.
pub struct Coordinator {
    pub(crate) store: Arc<dyn Store>,
    pub(crate) verifier: Arc<dyn QuoteVerifier>,
    pub(crate) secrets: SecretEngine,
    pub(crate) config: CoordinatorConfig,
    /// Serialising lock; also guards the state
    pub(crate) mux: Mutex<State>,
}

impl Coordinator {
    /// Create a coordinator in the `AcceptingManifest` state
    pub fn new(
        store: Arc<dyn Store>,
        verifier: Arc<dyn QuoteVerifier>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            store,
            verifier,
            secrets: SecretEngine::new(),
            config,
            mux: Mutex::new(State::AcceptingManifest),
        }
    }

    /// Replace the secret engine, e.g. with one using a seeded RNG
    pub fn with_secret_engine(mut self, secrets: SecretEngine) -> Self {
        self.secrets = secrets;
        self
    }

    /// Current lifecycle state
    pub async fn state(&self) -> State {
        *self.mux.lock().await
    }

    /// Commit the mesh policy
    ///
    /// Parses and checks the manifest, bootstraps the root and
    /// intermediate CA, persists both and transitions to
    /// `AcceptingMarbles`. Allowed exactly once, in `AcceptingManifest`.
    pub async fn set_manifest(&self, raw_manifest: &[u8]) -> Result<(), Error> {
        let mut state = self.mux.lock().await;
        if *state != State::AcceptingManifest {
            return Err(Error::WrongState {
                operation: "set manifest",
                state: *state,
            });
        }

        let manifest: Manifest = serde_json::from_slice(raw_manifest)
            .map_err(|err| Error::ManifestParse(err.to_string()))?;
        manifest.check()?;

        let ca = pki::generate_ca_hierarchy()?;
        self.store.put_certificate("root", &ca.root_cert).await?;
        self.store
            .put_certificate("intermediate", &ca.intermediate_cert)
            .await?;
        self.store.put_private_key("root", &ca.root_key).await?;
        self.store
            .put_private_key("intermediate", &ca.intermediate_key)
            .await?;
        self.store.put_manifest("main", &manifest).await?;

        *state = State::AcceptingMarbles;
        info!(
            packages = manifest.packages.len(),
            marbles = manifest.marbles.len(),
            secrets = manifest.secrets.len(),
            "Manifest committed, accepting marbles"
        );
        Ok(())
    }

    /// Commit an update overlay
    ///
    /// The overlay may only raise the `SecurityVersion` of packages the
    /// committed manifest already defines; everything else is rejected.
    pub async fn update_manifest(&self, raw_update: &[u8]) -> Result<(), Error> {
        let state = self.mux.lock().await;
        if *state != State::AcceptingMarbles {
            return Err(Error::WrongState {
                operation: "update manifest",
                state: *state,
            });
        }

        let update: Manifest = serde_json::from_slice(raw_update)
            .map_err(|err| Error::ManifestParse(err.to_string()))?;
        if update.packages.is_empty() {
            return Err(Error::InvalidUpdate("no packages to update".into()));
        }

        let main = self.store.get_manifest("main").await?;
        for (name, package) in &update.packages {
            let Some(existing) = main.packages.get(name) else {
                return Err(Error::InvalidUpdate(format!("unknown package '{name}'")));
            };
            let Some(new_version) = package.security_version else {
                return Err(Error::InvalidUpdate(format!(
                    "package '{name}' carries no SecurityVersion"
                )));
            };
            if let Some(old_version) = existing.security_version {
                if new_version < old_version {
                    return Err(Error::InvalidUpdate(format!(
                        "SecurityVersion of package '{name}' must not decrease ({old_version} -> {new_version})"
                    )));
                }
            }
        }

        self.store.put_manifest("update", &update).await?;
        info!(packages = update.packages.len(), "Update manifest committed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Code;
    use crate::storage::MemoryStore;
    use marblemesh_core::MockVerifier;
    use serde_json::json;

    fn coordinator() -> Coordinator {
        Coordinator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MockVerifier::accepting()),
            CoordinatorConfig::default(),
        )
    }

    fn manifest_bytes() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "Packages": {"backend": {"SecurityVersion": 1}},
            "Marbles": {"worker": {"Package": "backend"}}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn set_manifest_transitions_and_bootstraps_ca() {
        let coordinator = coordinator();
        assert_eq!(coordinator.state().await, State::AcceptingManifest);

        coordinator.set_manifest(&manifest_bytes()).await.unwrap();
        assert_eq!(coordinator.state().await, State::AcceptingMarbles);

        for name in ["root", "intermediate"] {
            assert!(!coordinator
                .store
                .get_certificate(name)
                .await
                .unwrap()
                .is_empty());
            coordinator.store.get_private_key(name).await.unwrap();
        }
    }

    #[tokio::test]
    async fn set_manifest_twice_is_a_precondition_failure() {
        let coordinator = coordinator();
        coordinator.set_manifest(&manifest_bytes()).await.unwrap();

        let err = coordinator.set_manifest(&manifest_bytes()).await.unwrap_err();
        assert_eq!(err.code(), Code::FailedPrecondition);
    }

    #[tokio::test]
    async fn malformed_and_inconsistent_manifests_are_rejected() {
        let coordinator = coordinator();

        let err = coordinator.set_manifest(b"{ not json").await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        let dangling = serde_json::to_vec(&json!({
            "Packages": {"backend": {}},
            "Marbles": {"worker": {"Package": "missing"}}
        }))
        .unwrap();
        let err = coordinator.set_manifest(&dangling).await.unwrap_err();
        assert_eq!(err.code(), Code::InvalidArgument);

        // nothing was committed
        assert_eq!(coordinator.state().await, State::AcceptingManifest);
    }

    #[tokio::test]
    async fn update_overlay_is_validated_against_main() {
        let coordinator = coordinator();
        coordinator.set_manifest(&manifest_bytes()).await.unwrap();

        let unknown = serde_json::to_vec(&json!({
            "Packages": {"ghost": {"SecurityVersion": 2}}
        }))
        .unwrap();
        assert_eq!(
            coordinator.update_manifest(&unknown).await.unwrap_err().code(),
            Code::InvalidArgument
        );

        let downgrade = serde_json::to_vec(&json!({
            "Packages": {"backend": {"SecurityVersion": 0}}
        }))
        .unwrap();
        assert_eq!(
            coordinator.update_manifest(&downgrade).await.unwrap_err().code(),
            Code::InvalidArgument
        );

        let raise = serde_json::to_vec(&json!({
            "Packages": {"backend": {"SecurityVersion": 5}}
        }))
        .unwrap();
        coordinator.update_manifest(&raise).await.unwrap();

        let update = coordinator.store.get_update_manifest().await.unwrap();
        assert_eq!(update.packages["backend"].security_version, Some(5));
    }

    #[tokio::test]
    async fn update_before_manifest_is_a_precondition_failure() {
        let coordinator = coordinator();
        let raise = serde_json::to_vec(&json!({
            "Packages": {"backend": {"SecurityVersion": 5}}
        }))
        .unwrap();
        assert_eq!(
            coordinator.update_manifest(&raise).await.unwrap_err().code(),
            Code::FailedPrecondition
        );
    }
}
