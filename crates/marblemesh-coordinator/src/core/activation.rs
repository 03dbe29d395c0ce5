//! The attested activation pipeline
//!
//! `Activate` authenticates a freshly started marble and equips it for the
//! mesh: quote validation against the committed policy (with the update
//! overlay applied), activation-budget enforcement, issuance of the
//! per-instance credentials, secret materialisation and parameter
//! customisation.
//!
//! The entire pipeline runs under the coordinator lock. No error path
//! increments the activation counter; the only store write before the
//! commit point is the idempotent counter seed.

use std::collections::BTreeMap;

use marblemesh_core::template::customize_parameters;
use marblemesh_core::{
    ActivationReq, ActivationResp, Certificate, InfrastructureProperties, Manifest,
    RequestContext, Secret,
};
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{Coordinator, State};
use crate::error::Error;
use crate::storage::StoreError;
use crate::ttls;

impl Coordinator {
    /// Authenticate a marble and return its activation parameters
    ///
    /// The request must name a marble type of the committed manifest and
    /// carry a CSR; the transport context must hold the peer TLS
    /// certificate the quote is bound to. On success the marble receives
    /// its leaf certificate chain, private key, seal key and customised
    /// parameters, and the activation counter of its type advances by
    /// one.
    pub async fn activate(
        &self,
        req: &ActivationReq,
        ctx: &RequestContext,
    ) -> Result<ActivationResp, Error> {
        // serialising lock, held until the response is built
        let state = self.mux.lock().await;
        info!(marble_type = %req.marble_type, "Received activation request");
        if *state != State::AcceptingMarbles {
            return Err(Error::NotAcceptingMarbles);
        }

        let peer_cert = ctx
            .peer_certificate
            .as_ref()
            .ok_or(Error::MissingPeerCertificate)?;
        self.verify_manifest_requirement(peer_cert, &req.quote, &req.marble_type)
            .await?;

        let marble_uuid =
            Uuid::parse_str(&req.uuid).map_err(|err| Error::InvalidUuid(err.to_string()))?;

        let root_key = self.store.get_private_key("root").await?;
        let intermediate_cert = self.store.get_certificate("intermediate").await?;
        let intermediate_key = self.store.get_private_key("intermediate").await?;

        let auth_secrets = self
            .secrets
            .generate_marble_auth_secrets(
                &req.csr,
                &marble_uuid,
                &root_key,
                &intermediate_cert,
                &intermediate_key,
            )
            .map_err(|err| {
                error!(
                    marble_type = %req.marble_type,
                    uuid = %marble_uuid,
                    error = %err,
                    "Could not generate marble authentication secrets"
                );
                err
            })?;

        let main_manifest = self.store.get_manifest("main").await?;
        let user_secrets = self.materialize_user_secrets(&main_manifest).await?;

        // existence was checked in verify_manifest_requirement
        let marble = main_manifest
            .marbles
            .get(&req.marble_type)
            .ok_or(Error::UnknownMarbleType)?;

        let mut params = customize_parameters(&marble.parameters, &auth_secrets, &user_secrets)
            .map_err(|err| {
                error!(
                    marble_type = %req.marble_type,
                    uuid = %marble_uuid,
                    error = %err,
                    "Could not customize parameters"
                );
                Error::from(err)
            })?;

        // written after templating so a manifest template cannot overwrite it
        ttls::set_ttls_config(marble, &main_manifest, &auth_secrets, &user_secrets, &mut params)?;

        // commit point: after this the activation counts, cancellation or not
        self.store.increment_activations(&req.marble_type).await?;

        info!(
            marble_type = %req.marble_type,
            uuid = %marble_uuid,
            "Successfully activated new marble"
        );
        Ok(ActivationResp { parameters: params })
    }

    /// Verify the marble against the committed policy
    ///
    /// Looks up marble and package, applies the update overlay's
    /// `SecurityVersion`, validates the quote (unless in simulation mode)
    /// and checks the activation budget. The counter read-back/seed is
    /// protected by the activation lock held by the caller.
    async fn verify_manifest_requirement(
        &self,
        peer_cert: &Certificate,
        quote: &[u8],
        marble_type: &str,
    ) -> Result<(), Error> {
        let main = self.store.get_manifest("main").await?;
        let update = self.store.get_update_manifest().await?;

        let marble = main
            .marbles
            .get(marble_type)
            .ok_or(Error::UnknownMarbleType)?;
        let mut package = main
            .packages
            .get(&marble.package)
            .cloned()
            .ok_or(Error::UndefinedPackage)?;

        // an updated package only overlays its security version
        if let Some(update_package) = update.packages.get(&marble.package) {
            package.security_version = update_package.security_version;
        }

        if !self.config.simulation_mode {
            if main.infrastructures.is_empty() {
                self.verifier
                    .validate(
                        quote,
                        peer_cert.der(),
                        &package,
                        &InfrastructureProperties::default(),
                    )
                    .map_err(|err| Error::QuoteRejected(err.to_string()))?;
            } else {
                // first matching infrastructure wins; key order keeps the
                // audit trail reproducible
                let matched = main.infrastructures.iter().find(|(_, infra)| {
                    self.verifier
                        .validate(quote, peer_cert.der(), &package, infra)
                        .is_ok()
                });
                match matched {
                    Some((name, _)) => {
                        info!(
                            marble_type = %marble_type,
                            infrastructure = %name,
                            "Quote validated"
                        );
                    }
                    None => {
                        return Err(Error::QuoteRejected(
                            "no matching infrastructure".into(),
                        ))
                    }
                }
            }
        }

        // activation budget; MaxActivations == 0 means unlimited
        let activations = match self.store.get_activations(marble_type).await {
            Ok(count) => count,
            Err(StoreError::NotSet(_)) => 0,
            Err(err) => return Err(err.into()),
        };
        // idempotent seed so the later increment sees a defined counter
        self.store.put_activations(marble_type, activations).await?;
        if marble.max_activations > 0 && activations >= marble.max_activations {
            warn!(
                marble_type = %marble_type,
                max_activations = marble.max_activations,
                "Reached max activations count"
            );
            return Err(Error::ActivationsExhausted);
        }
        Ok(())
    }

    /// Materialise the user-defined secrets for this activation
    ///
    /// Per-marble secrets are regenerated every time and never stored.
    /// Shared secrets are created on first need, persisted, and shadow
    /// any per-marble value of the same name.
    async fn materialize_user_secrets(
        &self,
        manifest: &Manifest,
    ) -> Result<BTreeMap<String, Secret>, Error> {
        let mut secrets = self
            .secrets
            .generate_user_secrets(manifest.secrets.iter().filter(|(_, spec)| !spec.shared))?;

        let stored = self.store.get_secret_map().await?;
        for (name, spec) in manifest.secrets.iter().filter(|(_, spec)| spec.shared) {
            match stored.get(name) {
                Some(existing) => {
                    secrets.insert(name.clone(), existing.clone());
                }
                None => {
                    let secret = self.secrets.generate_user_secret(name, spec)?;
                    self.store.put_secret(name, &secret).await?;
                    info!(secret = %name, "Materialized shared secret");
                    secrets.insert(name.clone(), secret);
                }
            }
        }
        Ok(secrets)
    }
}
