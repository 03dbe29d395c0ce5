//! Activation wire types
//!
//! The activation surface is a single operation,
//! `Activate(ActivationReq) -> ActivationResp`, carried over a mutually
//! authenticated transport that is out of scope here. The transport hands
//! the coordinator a [`RequestContext`] with the peer's TLS certificate,
//! which the attestation quote must be bound to.

use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::manifest::{b64, Certificate};

/// Reserved variable carrying the PEM-encoded intermediate CA certificate
pub const MARBLE_ENV_INTERMEDIATE_CA: &str = "EDG_CA";
/// Reserved variable carrying the marble certificate chain (leaf then
/// intermediate, PEM)
pub const MARBLE_ENV_CERTIFICATE_CHAIN: &str = "EDG_CERT_CHAIN";
/// Reserved variable carrying the marble's PKCS#8 private key (PEM)
pub const MARBLE_ENV_PRIVATE_KEY: &str = "EDG_PRIVATE_KEY";
/// Variable carrying the transparent-TLS configuration (JSON); only set
/// when the marble has TLS tags
pub const MARBLE_ENV_TTLS_CONFIG: &str = "MARBLE_TTLS_CONFIG";

/// A parameter value: a byte string
///
/// Values come out of the manifest as UTF-8, but template expansion with
/// the `raw` encoder may splice arbitrary bytes into them, so the value
/// type is bytes rather than `String`. Serialisation emits the exact text
/// when the bytes are valid UTF-8 and a lossy rendering otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParamValue(Vec<u8>);

impl ParamValue {
    /// The raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// The value as text, if it is valid UTF-8
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.0).ok()
    }

    /// Consume into the raw bytes
    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl Deref for ParamValue {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.0
    }
}

impl From<Vec<u8>> for ParamValue {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

impl From<String> for ParamValue {
    fn from(text: String) -> Self {
        Self(text.into_bytes())
    }
}

impl From<&str> for ParamValue {
    fn from(text: &str) -> Self {
        Self(text.as_bytes().to_vec())
    }
}

impl fmt::Display for ParamValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl Serialize for ParamValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(&self.0) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => serializer.serialize_str(&String::from_utf8_lossy(&self.0)),
        }
    }
}

impl<'de> Deserialize<'de> for ParamValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(Self::from)
    }
}

/// Application parameters delivered to a marble at activation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "PascalCase")]
pub struct Parameters {
    /// Command line, passed through verbatim
    pub argv: Vec<String>,
    /// Environment variables; values may contain secret placeholders
    pub env: BTreeMap<String, ParamValue>,
    /// File contents by path; values may contain secret placeholders
    pub files: BTreeMap<String, ParamValue>,
}

/// An activation request from a freshly started marble
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActivationReq {
    /// Marble type, must be present in the manifest
    #[serde(rename = "MarbleType")]
    pub marble_type: String,
    /// Remote-attestation quote bound to the peer TLS key
    #[serde(rename = "Quote", with = "b64")]
    pub quote: Vec<u8>,
    /// Certificate signing request, DER
    #[serde(rename = "CSR", with = "b64")]
    pub csr: Vec<u8>,
    /// Instance UUID chosen by the marble (RFC 4122, textual)
    #[serde(rename = "UUID")]
    pub uuid: String,
}

/// The coordinator's answer to a successful activation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ActivationResp {
    /// Customised parameters with all placeholders expanded and the
    /// reserved variables injected
    #[serde(rename = "Parameters")]
    pub parameters: Parameters,
}

/// Transport-provided context of an activation call
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    /// The TLS certificate the peer presented on this connection
    pub peer_certificate: Option<Certificate>,
}

impl RequestContext {
    /// Context for a connection authenticated with `peer` certificate
    pub fn with_peer(peer: Certificate) -> Self {
        Self {
            peer_certificate: Some(peer),
        }
    }

    /// Context without a peer certificate; activation will be rejected
    pub fn anonymous() -> Self {
        Self::default()
    }
}
