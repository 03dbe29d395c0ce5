//! Error types for the MarbleMesh policy model

use thiserror::Error;

/// Errors found by [`Manifest::check`](crate::manifest::Manifest::check)
///
/// A manifest that fails any of these rules must not be committed; the
/// coordinator rejects it before any state is touched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckError {
    /// The manifest defines no packages
    #[error("no allowed packages defined")]
    NoPackages,

    /// The manifest defines no marbles
    #[error("no allowed marbles defined")]
    NoMarbles,

    /// A marble references a package that is not part of the manifest
    #[error("manifest does not contain package '{package}' referenced by marble '{marble}'")]
    MissingPackage {
        /// Marble holding the dangling reference
        marble: String,
        /// The referenced package key
        package: String,
    },
}

/// Errors raised while expanding parameter templates
///
/// The `File` and `Env` variants wrap an inner error with the path or
/// variable name that failed, so the coordinator can surface the location
/// without echoing the template input.
#[derive(Error, Debug)]
pub enum TemplateError {
    /// Malformed template action
    #[error("template syntax error: {0}")]
    Syntax(String),

    /// Function outside the closed pem/hex/raw/base64 set
    #[error("unknown template function '{0}'")]
    UnknownFunction(String),

    /// Reference into the secret tree that does not resolve
    #[error("unknown secret reference '{0}'")]
    UnknownReference(String),

    /// The referenced value cannot be encoded by the requested function
    #[error("invalid secret type for '{0}'")]
    InvalidSecretType(&'static str),

    /// Template of a file entry failed
    #[error("invalid format of file {path}")]
    File {
        /// Path of the failing file entry
        path: String,
        #[source]
        source: Box<TemplateError>,
    },

    /// Template of an environment variable failed
    #[error("invalid format of environment variable {name}")]
    Env {
        /// Name of the failing variable
        name: String,
        #[source]
        source: Box<TemplateError>,
    },
}
