//! Integration tests for the activation pipeline
//!
//! These tests drive the coordinator end to end through `set_manifest` /
//! `update_manifest` / `activate` and verify:
//! - the happy path with parameter templating and reserved env injection
//! - activation-budget enforcement and counter semantics
//! - quote rejection and the update overlay
//! - TTLS config assembly with marble and user credentials
//! - issued-certificate properties (chain, subject, serial uniqueness)

use std::sync::Arc;

use marblemesh_coordinator::{Code, Coordinator, CoordinatorConfig, MemoryStore, State, Store};
use marblemesh_core::template::pem_certificate;
use marblemesh_core::{
    ActivationReq, ActivationResp, Certificate, MockVerifier, QuoteVerifier, RequestContext,
};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::{X509NameBuilder, X509Req, X509};
use serde_json::{json, Value};

const UUID_1: &str = "00000000-0000-0000-0000-000000000001";
const UUID_2: &str = "00000000-0000-0000-0000-000000000002";

// =============================================================================
// Test Helpers
// =============================================================================

/// Build a valid CSR the way a marble-side runtime would
fn generate_csr() -> Vec<u8> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut builder = X509Req::builder().unwrap();
    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_nid(Nid::COMMONNAME, "marble").unwrap();
    let name = name.build();
    builder.set_subject_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    builder.build().to_der().unwrap()
}

fn request(marble_type: &str, uuid: &str) -> ActivationReq {
    ActivationReq {
        marble_type: marble_type.to_string(),
        quote: b"test-quote".to_vec(),
        csr: generate_csr(),
        uuid: uuid.to_string(),
    }
}

fn peer_context() -> RequestContext {
    // any certificate bytes; the mock verifier does not inspect them
    RequestContext::with_peer(Certificate::new(vec![0x30, 0x82, 0x00, 0x00]))
}

async fn coordinator_with(
    manifest: &Value,
    verifier: Arc<dyn QuoteVerifier>,
    simulation_mode: bool,
) -> (Coordinator, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let coordinator = Coordinator::new(
        store.clone(),
        verifier,
        CoordinatorConfig { simulation_mode },
    );
    coordinator
        .set_manifest(&serde_json::to_vec(manifest).unwrap())
        .await
        .unwrap();
    (coordinator, store)
}

fn simple_manifest(max_activations: u64) -> Value {
    json!({
        "Packages": {
            "backend": {"SecurityVersion": 3}
        },
        "Marbles": {
            "worker": {
                "Package": "backend",
                "MaxActivations": max_activations,
                "Parameters": {
                    "Env": {"GREETING": "hello {{ raw .Marblerun.SealKey.Public }}"}
                }
            }
        }
    })
}

fn leaf_of(resp: &ActivationResp) -> X509 {
    let chain = resp.parameters.env["EDG_CERT_CHAIN"].as_str().unwrap();
    // the first block of the chain is the leaf
    X509::from_pem(chain.as_bytes()).unwrap()
}

// =============================================================================
// Activation Flows
// =============================================================================

#[tokio::test]
async fn activation_succeeds_without_tls_and_templates_raw_secret() {
    let (coordinator, store) = coordinator_with(
        &simple_manifest(0),
        Arc::new(MockVerifier::rejecting()), // must not be consulted
        true,
    )
    .await;

    let resp = coordinator
        .activate(&request("worker", UUID_1), &peer_context())
        .await
        .unwrap();

    let env = &resp.parameters.env;
    assert!(env["EDG_CA"]
        .as_str()
        .unwrap()
        .starts_with("-----BEGIN CERTIFICATE-----"));
    assert_eq!(env["GREETING"].len(), "hello ".len() + 32);
    assert!(!env.contains_key("MARBLE_TTLS_CONFIG"));

    assert_eq!(store.get_activations("worker").await.unwrap(), 1);
}

#[tokio::test]
async fn third_activation_past_max_is_resource_exhausted() {
    let (coordinator, store) = coordinator_with(
        &simple_manifest(2),
        Arc::new(MockVerifier::accepting()),
        true,
    )
    .await;

    coordinator
        .activate(&request("worker", UUID_1), &peer_context())
        .await
        .unwrap();
    coordinator
        .activate(&request("worker", UUID_2), &peer_context())
        .await
        .unwrap();

    let err = coordinator
        .activate(&request("worker", UUID_1), &peer_context())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::ResourceExhausted);
    assert_eq!(store.get_activations("worker").await.unwrap(), 2);
}

#[tokio::test]
async fn quote_rejection_leaves_counter_untouched() {
    let (coordinator, store) = coordinator_with(
        &simple_manifest(0),
        Arc::new(MockVerifier::rejecting()),
        false,
    )
    .await;

    let err = coordinator
        .activate(&request("worker", UUID_1), &peer_context())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    // the counter was never seeded
    assert!(store.get_activations("worker").await.is_err());
}

#[tokio::test]
async fn unknown_marble_type_is_rejected_without_seeding_a_counter() {
    let (coordinator, store) = coordinator_with(
        &simple_manifest(0),
        Arc::new(MockVerifier::accepting()),
        true,
    )
    .await;

    let err = coordinator
        .activate(&request("nope", UUID_1), &peer_context())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);
    assert!(store.get_activations("nope").await.is_err());
}

#[tokio::test]
async fn update_overlay_raises_security_version_for_activation() {
    // the verifier demands SecurityVersion >= 5, the manifest commits 3
    let (coordinator, _store) = coordinator_with(
        &simple_manifest(0),
        Arc::new(MockVerifier::require_security_version(5)),
        false,
    )
    .await;

    let err = coordinator
        .activate(&request("worker", UUID_1), &peer_context())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);

    let overlay = serde_json::to_vec(&json!({
        "Packages": {"backend": {"SecurityVersion": 5}}
    }))
    .unwrap();
    coordinator.update_manifest(&overlay).await.unwrap();

    coordinator
        .activate(&request("worker", UUID_1), &peer_context())
        .await
        .unwrap();
}

#[tokio::test]
async fn ttls_uses_user_certificate_and_honours_disabled_client_auth() {
    let manifest = json!({
        "Packages": {"backend": {}},
        "Marbles": {
            "web": {
                "Package": "backend",
                "TLS": ["serve"]
            }
        },
        "TLS": {
            "serve": {
                "Incoming": [
                    {"Port": 443, "Cert": "userCert", "DisableClientAuth": true}
                ]
            }
        },
        "Secrets": {
            "userCert": {"Type": "cert-ecdsa", "Shared": true}
        }
    });
    let (coordinator, store) =
        coordinator_with(&manifest, Arc::new(MockVerifier::accepting()), true).await;

    let resp = coordinator
        .activate(&request("web", UUID_1), &peer_context())
        .await
        .unwrap();

    let raw = resp.parameters.env["MARBLE_TTLS_CONFIG"].as_str().unwrap();
    let config: Value = serde_json::from_str(raw).unwrap();
    let incoming = &config["tls"]["Incoming"]["*:443"];
    assert_eq!(incoming["clientAuth"], json!(false));

    // the shared secret materialised lazily and backs the endpoint
    let shared = store.get_secret_map().await.unwrap();
    assert_eq!(
        incoming["clicrt"].as_str().unwrap(),
        pem_certificate(&shared["userCert"].cert)
    );
}

// =============================================================================
// Invariants
// =============================================================================

#[tokio::test]
async fn activation_requires_accepting_marbles_state() {
    let coordinator = Coordinator::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MockVerifier::accepting()),
        CoordinatorConfig::default(),
    );
    assert_eq!(coordinator.state().await, State::AcceptingManifest);

    let err = coordinator
        .activate(&request("worker", UUID_1), &peer_context())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::FailedPrecondition);
}

#[tokio::test]
async fn activation_requires_a_peer_certificate() {
    let (coordinator, _store) = coordinator_with(
        &simple_manifest(0),
        Arc::new(MockVerifier::accepting()),
        true,
    )
    .await;

    let err = coordinator
        .activate(&request("worker", UUID_1), &RequestContext::anonymous())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
}

#[tokio::test]
async fn malformed_uuid_is_an_invalid_argument() {
    let (coordinator, store) = coordinator_with(
        &simple_manifest(0),
        Arc::new(MockVerifier::accepting()),
        true,
    )
    .await;

    let err = coordinator
        .activate(&request("worker", "not-a-uuid"), &peer_context())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // rejected after the seed, before the increment
    assert_eq!(store.get_activations("worker").await.unwrap(), 0);
}

#[tokio::test]
async fn counters_advance_by_one_per_activation() {
    let (coordinator, store) = coordinator_with(
        &simple_manifest(0),
        Arc::new(MockVerifier::accepting()),
        true,
    )
    .await;

    for expected in 1..=3u64 {
        coordinator
            .activate(&request("worker", UUID_1), &peer_context())
            .await
            .unwrap();
        assert_eq!(store.get_activations("worker").await.unwrap(), expected);
    }
}

#[tokio::test]
async fn repeated_activation_issues_distinct_certificates() {
    let (coordinator, store) = coordinator_with(
        &simple_manifest(0),
        Arc::new(MockVerifier::accepting()),
        true,
    )
    .await;

    // same UUID, distinct CSRs
    let first = coordinator
        .activate(&request("worker", UUID_1), &peer_context())
        .await
        .unwrap();
    let second = coordinator
        .activate(&request("worker", UUID_1), &peer_context())
        .await
        .unwrap();

    let serial_1 = leaf_of(&first).serial_number().to_bn().unwrap();
    let serial_2 = leaf_of(&second).serial_number().to_bn().unwrap();
    assert_ne!(serial_1.to_vec(), serial_2.to_vec());

    assert_eq!(store.get_activations("worker").await.unwrap(), 2);
}

#[tokio::test]
async fn issued_leaf_chains_to_the_intermediate_and_names_the_uuid() {
    let (coordinator, store) = coordinator_with(
        &simple_manifest(0),
        Arc::new(MockVerifier::accepting()),
        true,
    )
    .await;

    let resp = coordinator
        .activate(&request("worker", UUID_1), &peer_context())
        .await
        .unwrap();

    let leaf = leaf_of(&resp);
    let intermediate =
        X509::from_der(store.get_certificate("intermediate").await.unwrap().der()).unwrap();
    assert!(leaf.verify(&intermediate.public_key().unwrap()).unwrap());

    let common_name = leaf
        .subject_name()
        .entries_by_nid(Nid::COMMONNAME)
        .next()
        .unwrap()
        .data()
        .as_utf8()
        .unwrap()
        .to_string();
    assert_eq!(common_name, UUID_1);

    // EDG_CA is the intermediate, and the chain ends with it
    let ca_pem = resp.parameters.env["EDG_CA"].as_str().unwrap();
    let chain = resp.parameters.env["EDG_CERT_CHAIN"].as_str().unwrap();
    assert!(chain.ends_with(ca_pem));
    let ca = X509::from_pem(ca_pem.as_bytes()).unwrap();
    assert_eq!(ca.to_der().unwrap(), intermediate.to_der().unwrap());

    // the delivered private key is a parseable PKCS#8 document
    let key_pem = resp.parameters.env["EDG_PRIVATE_KEY"].as_str().unwrap();
    PKey::private_key_from_pem(key_pem.as_bytes()).unwrap();
}

#[tokio::test]
async fn reserved_env_wins_over_manifest_values() {
    let manifest = json!({
        "Packages": {"backend": {}},
        "Marbles": {
            "worker": {
                "Package": "backend",
                "Parameters": {
                    "Env": {
                        "EDG_CA": "spoofed",
                        "EDG_CERT_CHAIN": "spoofed",
                        "EDG_PRIVATE_KEY": "spoofed"
                    }
                }
            }
        }
    });
    let (coordinator, _store) =
        coordinator_with(&manifest, Arc::new(MockVerifier::accepting()), true).await;

    let resp = coordinator
        .activate(&request("worker", UUID_1), &peer_context())
        .await
        .unwrap();

    for name in ["EDG_CA", "EDG_CERT_CHAIN", "EDG_PRIVATE_KEY"] {
        let value = resp.parameters.env[name].as_str().unwrap();
        assert_ne!(value, "spoofed");
        assert!(value.starts_with("-----BEGIN"));
    }
}

#[tokio::test]
async fn invalid_csr_fails_without_consuming_budget() {
    let (coordinator, store) = coordinator_with(
        &simple_manifest(2),
        Arc::new(MockVerifier::accepting()),
        true,
    )
    .await;

    let mut req = request("worker", UUID_1);
    req.csr = b"garbage".to_vec();
    let err = coordinator.activate(&req, &peer_context()).await.unwrap_err();
    assert_eq!(err.code(), Code::InvalidArgument);

    // seeded but not incremented; the budget is still fully available
    assert_eq!(store.get_activations("worker").await.unwrap(), 0);
    coordinator
        .activate(&request("worker", UUID_1), &peer_context())
        .await
        .unwrap();
    coordinator
        .activate(&request("worker", UUID_2), &peer_context())
        .await
        .unwrap();
}

#[tokio::test]
async fn templates_resolve_user_and_reserved_secrets() {
    let manifest = json!({
        "Packages": {"backend": {}},
        "Marbles": {
            "worker": {
                "Package": "backend",
                "Parameters": {
                    "Env": {"CERT": "{{ pem .Marblerun.MarbleCert.Cert }}"},
                    "Files": {"/secrets/api.key": "{{ hex .Secrets.apiKey }}"}
                }
            }
        },
        "Secrets": {
            "apiKey": {"Type": "symmetric-key", "Size": 128}
        }
    });
    let (coordinator, _store) =
        coordinator_with(&manifest, Arc::new(MockVerifier::accepting()), true).await;

    let resp = coordinator
        .activate(&request("worker", UUID_1), &peer_context())
        .await
        .unwrap();

    // templated cert matches the issued leaf byte for byte
    let templated = resp.parameters.env["CERT"].as_str().unwrap();
    let leaf = leaf_of(&resp);
    assert_eq!(
        X509::from_pem(templated.as_bytes()).unwrap().to_der().unwrap(),
        leaf.to_der().unwrap()
    );

    // 128-bit key, hex encoded
    let hexed = resp.parameters.files["/secrets/api.key"].as_str().unwrap();
    assert_eq!(hexed.len(), 32);
    assert!(hexed.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn shared_secrets_are_stable_across_activations() {
    let manifest = json!({
        "Packages": {"backend": {}},
        "Marbles": {
            "worker": {
                "Package": "backend",
                "Parameters": {
                    "Env": {"SHARED": "{{ hex .Secrets.meshKey }}", "UNIQUE": "{{ hex .Secrets.ownKey }}"}
                }
            }
        },
        "Secrets": {
            "meshKey": {"Type": "symmetric-key", "Size": 256, "Shared": true},
            "ownKey": {"Type": "symmetric-key", "Size": 256}
        }
    });
    let (coordinator, _store) =
        coordinator_with(&manifest, Arc::new(MockVerifier::accepting()), true).await;

    let first = coordinator
        .activate(&request("worker", UUID_1), &peer_context())
        .await
        .unwrap();
    let second = coordinator
        .activate(&request("worker", UUID_2), &peer_context())
        .await
        .unwrap();

    assert_eq!(
        first.parameters.env["SHARED"],
        second.parameters.env["SHARED"]
    );
    assert_ne!(
        first.parameters.env["UNIQUE"],
        second.parameters.env["UNIQUE"]
    );
}

#[tokio::test]
async fn infrastructure_match_admits_and_mismatch_rejects() {
    let mut manifest = simple_manifest(0);
    manifest["Infrastructures"] = json!({
        "azure": {"QESVN": 2},
        "alibaba": {"QESVN": 3}
    });

    // verifier accepts some infrastructure
    let (coordinator, _store) =
        coordinator_with(&manifest, Arc::new(MockVerifier::accepting()), false).await;
    coordinator
        .activate(&request("worker", UUID_1), &peer_context())
        .await
        .unwrap();

    // verifier accepts none
    let (coordinator, _store) =
        coordinator_with(&manifest, Arc::new(MockVerifier::rejecting()), false).await;
    let err = coordinator
        .activate(&request("worker", UUID_1), &peer_context())
        .await
        .unwrap_err();
    assert_eq!(err.code(), Code::Unauthenticated);
}
