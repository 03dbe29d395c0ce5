//! # MarbleMesh Coordinator
//!
//! The activation core of a confidential-computing mesh: a central trust
//! anchor that attests and bootstraps enclave workloads ("marbles").
//!
//! When a newly started marble connects, the coordinator
//!
//! 1. validates its remote-attestation quote, bound to the worker's TLS
//!    key, against the committed manifest (with the update overlay
//!    applied),
//! 2. enforces the per-type activation budget,
//! 3. issues a per-instance X.509 certificate chained to the internal
//!    intermediate CA,
//! 4. materialises per-marble and shared secrets, and
//! 5. returns the application parameters with all secret placeholders
//!    expanded, plus the transparent-TLS configuration for the mesh.
//!
//! The RPC transport, sealed storage backends and attestation verifier
//! backends are external collaborators behind the [`Store`] and
//! [`QuoteVerifier`](marblemesh_core::QuoteVerifier) interfaces.

pub mod core;
pub mod error;
pub mod pki;
pub mod secrets;
pub mod storage;
pub mod ttls;

pub use crate::core::{Coordinator, CoordinatorConfig, State};
pub use error::{Code, Error};
pub use pki::{generate_ca_hierarchy, CaHierarchy};
pub use secrets::SecretEngine;
pub use storage::{MemoryStore, Store, StoreError};
