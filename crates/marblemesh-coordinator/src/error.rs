//! Coordinator error type and status-code mapping
//!
//! Every failure of the activation pipeline maps onto one of five
//! gRPC-style status codes. Messages are safe to return to the caller:
//! they never carry secret material, raw quotes or private keys.

use marblemesh_core::{CheckError, TemplateError};
use thiserror::Error;

use crate::core::State;
use crate::storage::StoreError;

/// Status code of an error, mirroring the subset of gRPC codes the
/// activation surface uses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Code {
    /// The coordinator is not in a state that allows the operation
    FailedPrecondition,
    /// The caller could not be authenticated (peer certificate, quote,
    /// infrastructure match)
    Unauthenticated,
    /// The request is malformed or references unknown policy entries
    InvalidArgument,
    /// The activation budget of the marble type is exhausted
    ResourceExhausted,
    /// Store, crypto or template failure, or inconsistent committed policy
    Internal,
}

/// Errors of the coordinator service
#[derive(Error, Debug)]
pub enum Error {
    /// Activation requested outside the `AcceptingMarbles` state
    #[error("cannot accept marbles in current state")]
    NotAcceptingMarbles,

    /// A policy operation was attempted in the wrong state
    #[error("cannot {operation} in state {state}")]
    WrongState {
        /// The rejected operation
        operation: &'static str,
        /// The coordinator state at the time
        state: State,
    },

    /// The transport provided no peer TLS certificate
    #[error("couldn't get marble TLS certificate")]
    MissingPeerCertificate,

    /// Quote verification failed against every candidate infrastructure
    #[error("invalid quote: {0}")]
    QuoteRejected(String),

    /// The requested marble type is not part of the manifest
    #[error("unknown marble type requested")]
    UnknownMarbleType,

    /// The marble's package vanished from the committed manifest
    #[error("undefined package")]
    UndefinedPackage,

    /// The request UUID is not a valid RFC 4122 identifier
    #[error("invalid marble UUID: {0}")]
    InvalidUuid(String),

    /// The CSR could not be parsed
    #[error("failed to parse CSR")]
    MalformedCsr,

    /// The CSR carries an invalid self-signature
    #[error("signature over CSR is invalid")]
    InvalidCsrSignature,

    /// The activation budget for the marble type is used up
    #[error("reached max activations count for marble type")]
    ActivationsExhausted,

    /// The manifest JSON could not be parsed
    #[error("invalid manifest: {0}")]
    ManifestParse(String),

    /// The manifest failed its consistency check
    #[error(transparent)]
    ManifestCheck(#[from] CheckError),

    /// The update overlay is inconsistent with the committed manifest
    #[error("invalid update manifest: {0}")]
    InvalidUpdate(String),

    /// A TLS tag references a user secret that does not exist
    #[error("TLS config references unknown secret '{0}'")]
    UnknownTlsSecret(String),

    /// A declared secret cannot be generated as specified
    #[error("cannot generate secret '{name}': {reason}")]
    InvalidSecretSpec {
        /// Secret name from the manifest
        name: String,
        /// Why generation failed
        reason: String,
    },

    /// Parameter templating failed
    #[error(transparent)]
    Template(#[from] TemplateError),

    /// Store access failed
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A cryptographic operation failed
    #[error("crypto error: {0}")]
    Crypto(String),
}

impl Error {
    /// The status code this error maps to
    pub fn code(&self) -> Code {
        match self {
            Error::NotAcceptingMarbles | Error::WrongState { .. } => Code::FailedPrecondition,
            Error::MissingPeerCertificate | Error::QuoteRejected(_) => Code::Unauthenticated,
            Error::UnknownMarbleType
            | Error::InvalidUuid(_)
            | Error::MalformedCsr
            | Error::InvalidCsrSignature
            | Error::ManifestParse(_)
            | Error::ManifestCheck(_)
            | Error::InvalidUpdate(_) => Code::InvalidArgument,
            Error::ActivationsExhausted => Code::ResourceExhausted,
            Error::UndefinedPackage
            | Error::UnknownTlsSecret(_)
            | Error::InvalidSecretSpec { .. }
            | Error::Template(_)
            | Error::Store(_)
            | Error::Crypto(_) => Code::Internal,
        }
    }
}

impl From<openssl::error::ErrorStack> for Error {
    fn from(err: openssl::error::ErrorStack) -> Self {
        Error::Crypto(err.to_string())
    }
}
