//! # MarbleMesh Core
//!
//! Policy model and wire types for the MarbleMesh coordinator, the trust
//! anchor of a confidential-computing mesh.
//!
//! ## Key Concepts
//!
//! - **Manifest**: the signed policy describing allowed packages, marbles,
//!   secrets and the TLS topology
//! - **Marble**: a workload instance (enclave process) admitted into the
//!   mesh after remote attestation
//! - **Quote**: a remote-attestation report binding an enclave measurement
//!   to the worker's TLS key
//! - **Parameter templating**: expansion of secret placeholders in the
//!   argv/env/files handed to an activated marble
//!
//! This crate is transport- and storage-free: the coordinator service in
//! `marblemesh-coordinator` wires it to a store, a quote verifier and a
//! PKI.

pub mod error;
pub mod manifest;
pub mod quote;
pub mod rpc;
pub mod template;

pub use error::{CheckError, TemplateError};
pub use manifest::{
    Certificate, Manifest, Marble, PrivateKey, PublicKey, Secret, TlsTag, TlsTagEntry,
};
pub use quote::{
    InfrastructureProperties, MockVerifier, PackageProperties, QuoteError, QuoteVerifier,
};
pub use rpc::{ActivationReq, ActivationResp, ParamValue, Parameters, RequestContext};
pub use template::{customize_parameters, ReservedSecrets, SecretsWrapper};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
