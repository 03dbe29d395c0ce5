//! Parameter templating over the activation secret tree
//!
//! Manifest environment variables and file contents may reference secrets
//! through `{{ <encoder> .<path> }}` placeholders, e.g.
//! `{{ pem .Marblerun.MarbleCert.Cert }}` or
//! `{{ base64 .Secrets.apiKey }}`. The function set is deliberately closed
//! to the four encoders below - templates are untrusted manifest input, so
//! there is no reflection catalogue, no file inclusion and no control flow.
//!
//! After expansion the reserved `EDG_*` variables are overwritten
//! unconditionally; a manifest cannot spoof the credentials the coordinator
//! hands out.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine};
use pem::{EncodeConfig, LineEnding, Pem};

use crate::error::TemplateError;
use crate::manifest::{Certificate, PrivateKey, Secret};
use crate::rpc::{
    ParamValue, Parameters, MARBLE_ENV_CERTIFICATE_CHAIN, MARBLE_ENV_INTERMEDIATE_CA,
    MARBLE_ENV_PRIVATE_KEY,
};

const PEM_TAG_CERTIFICATE: &str = "CERTIFICATE";
const PEM_TAG_PUBLIC_KEY: &str = "PUBLIC KEY";
const PEM_TAG_PRIVATE_KEY: &str = "PRIVATE KEY";

/// The secrets issued by the coordinator itself during an activation,
/// reachable in templates under the `Marblerun` prefix
#[derive(Debug, Clone, Default)]
pub struct ReservedSecrets {
    /// Carries the intermediate CA certificate (named RootCA for
    /// templating compatibility)
    pub root_ca: Secret,
    /// The marble's leaf certificate with its PKIX public and PKCS#8
    /// private key
    pub marble_cert: Secret,
    /// 32 bytes of sealing key derived for this marble instance
    pub seal_key: Secret,
}

/// The full secret tree templates resolve against
#[derive(Debug, Clone, Copy)]
pub struct SecretsWrapper<'a> {
    /// Coordinator-issued secrets, `.Marblerun.*`
    pub marblerun: &'a ReservedSecrets,
    /// User-defined secrets from the manifest, `.Secrets.*`
    pub secrets: &'a BTreeMap<String, Secret>,
}

/// A resolved template reference
enum SecretData<'a> {
    Cert(&'a Certificate),
    Public(&'a [u8]),
    Private(&'a [u8]),
    Whole(&'a Secret),
}

fn pem_block(tag: &str, der: &[u8]) -> String {
    pem::encode_config(
        &Pem::new(tag, der.to_vec()),
        EncodeConfig::new().set_line_ending(LineEnding::LF),
    )
}

/// PEM-encode a certificate
pub fn pem_certificate(cert: &Certificate) -> String {
    pem_block(PEM_TAG_CERTIFICATE, cert.der())
}

/// PEM-encode a PKCS#8 private key
pub fn pem_private_key(key: &PrivateKey) -> String {
    pem_block(PEM_TAG_PRIVATE_KEY, key.as_bytes())
}

fn resolve<'a>(
    path: &str,
    secrets: &SecretsWrapper<'a>,
) -> Result<SecretData<'a>, TemplateError> {
    let unknown = || TemplateError::UnknownReference(path.to_string());
    let trimmed = path.strip_prefix('.').ok_or_else(|| {
        TemplateError::Syntax(format!("reference '{path}' must start with '.'"))
    })?;

    let mut segments = trimmed.split('.');
    let root = segments.next().ok_or_else(unknown)?;
    let name = segments.next().ok_or_else(unknown)?;

    let secret = match root {
        "Marblerun" => match name {
            "RootCA" => &secrets.marblerun.root_ca,
            "MarbleCert" => &secrets.marblerun.marble_cert,
            "SealKey" => &secrets.marblerun.seal_key,
            _ => return Err(unknown()),
        },
        "Secrets" => secrets.secrets.get(name).ok_or_else(unknown)?,
        _ => return Err(unknown()),
    };

    let data = match segments.next() {
        None => SecretData::Whole(secret),
        Some("Cert") => SecretData::Cert(&secret.cert),
        Some("Public") => SecretData::Public(secret.public.as_bytes()),
        Some("Private") => SecretData::Private(secret.private.as_bytes()),
        Some(_) => return Err(unknown()),
    };
    if segments.next().is_some() {
        return Err(unknown());
    }
    Ok(data)
}

fn encode_pem(data: &SecretData) -> Result<String, TemplateError> {
    match data {
        SecretData::Cert(cert) => Ok(pem_block(PEM_TAG_CERTIFICATE, cert.der())),
        SecretData::Public(bytes) => Ok(pem_block(PEM_TAG_PUBLIC_KEY, bytes)),
        SecretData::Private(bytes) => Ok(pem_block(PEM_TAG_PRIVATE_KEY, bytes)),
        SecretData::Whole(_) => Err(TemplateError::InvalidSecretType("pem")),
    }
}

fn encode_raw(data: &SecretData) -> Vec<u8> {
    match data {
        SecretData::Cert(cert) => cert.der().to_vec(),
        SecretData::Public(bytes) | SecretData::Private(bytes) => bytes.to_vec(),
        SecretData::Whole(secret) => secret.public.as_bytes().to_vec(),
    }
}

fn eval_action(action: &str, secrets: &SecretsWrapper) -> Result<Vec<u8>, TemplateError> {
    let mut tokens = action.split_whitespace();
    let function = tokens
        .next()
        .ok_or_else(|| TemplateError::Syntax("empty action".into()))?;
    let path = tokens
        .next()
        .ok_or_else(|| TemplateError::Syntax(format!("'{function}' is missing its operand")))?;
    if tokens.next().is_some() {
        return Err(TemplateError::Syntax(format!(
            "too many operands in '{action}'"
        )));
    }

    let data = resolve(path, secrets)?;
    match function {
        "pem" => Ok(encode_pem(&data)?.into_bytes()),
        "hex" => Ok(hex::encode(encode_raw(&data)).into_bytes()),
        "raw" => Ok(encode_raw(&data)),
        "base64" => Ok(STANDARD.encode(encode_raw(&data)).into_bytes()),
        _ => Err(TemplateError::UnknownFunction(function.to_string())),
    }
}

/// Expand every `{{ ... }}` placeholder of `template` against the secret
/// tree
///
/// Literal text passes through byte for byte; the result is a byte string
/// because the `raw` encoder may splice binary material.
pub fn expand(template: &str, secrets: &SecretsWrapper) -> Result<Vec<u8>, TemplateError> {
    let mut out = Vec::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.extend_from_slice(rest[..start].as_bytes());
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| TemplateError::Syntax("unterminated '{{' action".into()))?;
        out.extend_from_slice(&eval_action(after[..end].trim(), secrets)?);
        rest = &after[end + 2..];
    }
    out.extend_from_slice(rest.as_bytes());
    Ok(out)
}

/// Expand all placeholders of `params` and inject the reserved variables
///
/// Argv is passed through verbatim. Every env and file value is treated as
/// a template over the combined secret tree. The reserved `EDG_*` variables
/// are written last and always win over manifest-provided values.
pub fn customize_parameters(
    params: &Parameters,
    reserved: &ReservedSecrets,
    user_secrets: &BTreeMap<String, Secret>,
) -> Result<Parameters, TemplateError> {
    let secrets = SecretsWrapper {
        marblerun: reserved,
        secrets: user_secrets,
    };

    let mut custom = Parameters {
        argv: params.argv.clone(),
        ..Default::default()
    };

    for (path, data) in &params.files {
        let expanded = expand_value(data, &secrets).map_err(|err| TemplateError::File {
            path: path.clone(),
            source: Box::new(err),
        })?;
        custom.files.insert(path.clone(), expanded);
    }

    for (name, data) in &params.env {
        let expanded = expand_value(data, &secrets).map_err(|err| TemplateError::Env {
            name: name.clone(),
            source: Box::new(err),
        })?;
        custom.env.insert(name.clone(), expanded);
    }

    let ca_pem = pem_certificate(&reserved.root_ca.cert);
    let leaf_pem = pem_certificate(&reserved.marble_cert.cert);
    let key_pem = pem_private_key(&reserved.marble_cert.private);

    custom.env.insert(
        MARBLE_ENV_INTERMEDIATE_CA.to_string(),
        ParamValue::from(ca_pem.clone()),
    );
    custom.env.insert(
        MARBLE_ENV_CERTIFICATE_CHAIN.to_string(),
        ParamValue::from(format!("{leaf_pem}{ca_pem}")),
    );
    custom
        .env
        .insert(MARBLE_ENV_PRIVATE_KEY.to_string(), ParamValue::from(key_pem));

    Ok(custom)
}

fn expand_value(
    value: &ParamValue,
    secrets: &SecretsWrapper,
) -> Result<ParamValue, TemplateError> {
    let source = value
        .as_str()
        .ok_or_else(|| TemplateError::Syntax("template is not valid UTF-8".into()))?;
    expand(source, secrets).map(ParamValue::from)
}
