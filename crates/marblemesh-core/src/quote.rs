//! Remote-attestation quote verification capability
//!
//! The coordinator never inspects quotes itself; it hands the quote, the
//! peer's TLS certificate and the expected package/infrastructure
//! properties to a [`QuoteVerifier`]. Production deployments plug in a
//! DCAP-backed verifier; tests and simulation setups use [`MockVerifier`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::manifest::b64;

/// A quote failed verification
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct QuoteError(pub String);

/// Expected properties of an enclave package
///
/// A quote is matched against the measurement fields and must report at
/// least `SecurityVersion`. Unset fields are not enforced.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PackageProperties {
    /// Enclave measurement hash (MRENCLAVE), hex-encoded
    #[serde(rename = "UniqueID")]
    pub unique_id: String,
    /// Enclave signer hash (MRSIGNER), hex-encoded
    #[serde(rename = "SignerID")]
    pub signer_id: String,
    /// Product ID of the enclave
    #[serde(rename = "ProductID")]
    pub product_id: Option<u64>,
    /// Lowest acceptable security (ISV SVN) version
    #[serde(rename = "SecurityVersion")]
    pub security_version: Option<u64>,
    /// Whether debug enclaves are admitted
    #[serde(rename = "Debug")]
    pub debug: bool,
}

/// Expected platform properties of an infrastructure provider
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InfrastructureProperties {
    /// Quoting enclave security version
    #[serde(rename = "QESVN")]
    pub qe_svn: Option<u16>,
    /// Provisioning certification enclave security version
    #[serde(rename = "PCESVN")]
    pub pce_svn: Option<u16>,
    /// Expected CPU security version
    #[serde(rename = "CPUSVN", with = "b64")]
    pub cpu_svn: Vec<u8>,
    /// Root CA of the attestation collateral
    #[serde(rename = "RootCA", with = "b64")]
    pub root_ca: Vec<u8>,
}

/// Decides whether a quote proves the expected enclave on an allowed
/// platform
///
/// Implementations must be purely functional in their inputs: same quote,
/// certificate and properties, same verdict.
pub trait QuoteVerifier: Send + Sync {
    /// Validate `quote` against the peer certificate it must be bound to
    /// and the expected package/infrastructure properties
    fn validate(
        &self,
        quote: &[u8],
        peer_cert_der: &[u8],
        pkg: &PackageProperties,
        infra: &InfrastructureProperties,
    ) -> Result<(), QuoteError>;
}

#[derive(Debug, Clone, Copy)]
enum MockMode {
    Accept,
    Reject,
    RequireSecurityVersion(u64),
}

/// Scriptable verifier for tests and wiring checks
///
/// `accepting` admits every quote, `rejecting` admits none, and
/// `require_security_version` admits quotes whose expected package reports
/// at least the given security version - enough to exercise the
/// update-overlay path without attestation collateral.
#[derive(Debug, Clone)]
pub struct MockVerifier {
    mode: MockMode,
}

impl MockVerifier {
    /// A verifier that accepts every quote
    pub fn accepting() -> Self {
        Self { mode: MockMode::Accept }
    }

    /// A verifier that rejects every quote
    pub fn rejecting() -> Self {
        Self { mode: MockMode::Reject }
    }

    /// A verifier that requires `pkg.security_version >= min`
    pub fn require_security_version(min: u64) -> Self {
        Self {
            mode: MockMode::RequireSecurityVersion(min),
        }
    }
}

impl QuoteVerifier for MockVerifier {
    fn validate(
        &self,
        _quote: &[u8],
        _peer_cert_der: &[u8],
        pkg: &PackageProperties,
        _infra: &InfrastructureProperties,
    ) -> Result<(), QuoteError> {
        match self.mode {
            MockMode::Accept => Ok(()),
            MockMode::Reject => Err(QuoteError("mock verifier rejects all quotes".into())),
            MockMode::RequireSecurityVersion(min) => {
                let version = pkg.security_version.unwrap_or(0);
                if version >= min {
                    Ok(())
                } else {
                    Err(QuoteError(format!(
                        "security version {version} below required {min}"
                    )))
                }
            }
        }
    }
}
