use crate::{gateway, host::InvalidHostSpecifier, policy, trigger::InvalidRegexPattern};
use anyhow::{Context, Result};
use istio_config_k8s_api::{self as api, canonical_kind, is_kind};
use serde::Deserialize;
use std::num::NonZeroU16;

/// A configuration problem found while converting a resource.
///
/// These do not prevent a resource from being indexed: the offending part is
/// dropped or interpreted so that it grants nothing.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("gateway must declare at least one server")]
    NoServers,

    #[error("server on port {port} must declare at least one host")]
    NoHosts { port: NonZeroU16 },

    #[error("invalid host {host:?}: {source}")]
    MalformedHost {
        host: String,
        #[source]
        source: InvalidHostSpecifier,
    },

    #[error("invalid port number {0}")]
    InvalidPort(u32),

    #[error("server on port {port} has invalid TLS options: {source}")]
    InvalidTls {
        port: NonZeroU16,
        #[source]
        source: gateway::InvalidTls,
    },

    #[error(transparent)]
    InvalidRegexPattern(#[from] InvalidRegexPattern),

    #[error("only one of jwksUri and jwks may be set")]
    JwksConflict,

    #[error("target selector must name a service")]
    EmptyTargetName,
}

/// A converted resource, along with the problems found in its configuration.
#[derive(Debug)]
pub struct Validated<T> {
    pub value: T,
    pub errors: Vec<ConfigError>,
}

/// The outcome of validating a single manifest document.
#[derive(Debug)]
pub struct Report {
    pub kind: String,
    pub namespace: String,
    pub name: String,
    pub errors: Vec<ConfigError>,
}

// === impl Validated ===

impl<T> Validated<T> {
    pub fn new(value: T, errors: Vec<ConfigError>) -> Self {
        Self { value, errors }
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Fails with the first configuration error, if any.
    pub fn into_result(self) -> Result<T, ConfigError> {
        match self.errors.into_iter().next() {
            Some(error) => Err(error),
            None => Ok(self.value),
        }
    }
}

// === impl Report ===

impl Report {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A supported resource read from a manifest.
#[derive(Debug)]
pub enum Resource {
    Gateway(api::Gateway),
    Policy(api::Policy),
}

#[derive(Debug)]
pub struct Document {
    /// Position of the document in its manifest.
    pub index: usize,
    pub resource: Resource,
}

/// Reads every `Gateway` and `Policy` from a (possibly multi-document) YAML
/// manifest. Documents of other kinds are skipped.
///
/// Resources without a namespace are placed in `default_ns`.
pub fn read_manifests(yaml: &str, default_ns: &str) -> Result<Vec<Document>> {
    let mut docs = Vec::new();
    for (index, doc) in serde_yaml::Deserializer::from_str(yaml).enumerate() {
        let value = serde_yaml::Value::deserialize(doc)
            .with_context(|| format!("document {index} is not valid YAML"))?;
        if value.is_null() {
            continue;
        }

        let api_version = value.get("apiVersion").and_then(|v| v.as_str()).unwrap_or("");
        let kind = value.get("kind").and_then(|v| v.as_str()).unwrap_or("");

        let resource = if is_kind::<api::Gateway>(api_version, kind) {
            let mut gw: api::Gateway = serde_yaml::from_value(value)
                .with_context(|| format!("document {index} is not a valid Gateway"))?;
            gw.metadata
                .namespace
                .get_or_insert_with(|| default_ns.to_string());
            Resource::Gateway(gw)
        } else if is_kind::<api::Policy>(api_version, kind) {
            let mut p: api::Policy = serde_yaml::from_value(value)
                .with_context(|| format!("document {index} is not a valid Policy"))?;
            p.metadata
                .namespace
                .get_or_insert_with(|| default_ns.to_string());
            Resource::Policy(p)
        } else {
            tracing::debug!(document = index, %api_version, %kind, "skipping unsupported resource");
            continue;
        };
        docs.push(Document { index, resource });
    }
    Ok(docs)
}

/// Validates every `Gateway` and `Policy` in a (possibly multi-document) YAML
/// manifest.
///
/// Resources without a namespace are validated as though they were in
/// `default_ns`.
pub fn validate_manifests(yaml: &str, default_ns: &str) -> Result<Vec<Report>> {
    read_manifests(yaml, default_ns)?
        .into_iter()
        .map(|Document { index, resource }| -> Result<Report> {
            match resource {
                Resource::Gateway(gw) => {
                    let validated = gateway::Gateway::from_resource(gw)
                        .with_context(|| format!("document {index}"))?;
                    Ok(Report {
                        kind: canonical_kind::<api::Gateway>(),
                        namespace: validated.value.namespace,
                        name: validated.value.name,
                        errors: validated.errors,
                    })
                }
                Resource::Policy(p) => {
                    let validated = policy::Policy::from_resource(p)
                        .with_context(|| format!("document {index}"))?;
                    Ok(Report {
                        kind: canonical_kind::<api::Policy>(),
                        namespace: validated.value.namespace,
                        name: validated.value.name,
                        errors: validated.errors,
                    })
                }
            }
        })
        .collect()
}
