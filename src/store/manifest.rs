//! Manifest loading: multi-document YAML or JSON into [`Resource`] values.
//!
//! Documents of kinds gateplane does not read (Deployments, ConfigMaps, ...)
//! are skipped so whole application manifests can be pointed at directly.

use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::errors::{Error, Result};
use crate::resources::Resource;

const KNOWN_KINDS: &[&str] = &[
    "Ingress",
    "HTTPProxy",
    "GatewayClass",
    "Gateway",
    "HTTPRoute",
    "ReferenceGrant",
    "Service",
    "Endpoints",
    "Secret",
    "TLSCertificateDelegation",
];

/// Parse every document in `text`. JSON input may be one object or an array.
pub fn parse_manifests(text: &str) -> Result<Vec<Resource>> {
    let trimmed = text.trim_start();
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        return parse_json(trimmed);
    }

    let mut out = Vec::new();
    for (index, document) in serde_yaml::Deserializer::from_str(text).enumerate() {
        let value = serde_yaml::Value::deserialize(document)?;
        if value.is_null() {
            continue;
        }
        push_document(&mut out, index, serde_json::to_value(value)?)?;
    }
    Ok(out)
}

fn parse_json(text: &str) -> Result<Vec<Resource>> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    let documents = match value {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };
    let mut out = Vec::new();
    for (index, document) in documents.into_iter().enumerate() {
        push_document(&mut out, index, document)?;
    }
    Ok(out)
}

fn push_document(out: &mut Vec<Resource>, index: usize, document: serde_json::Value) -> Result<()> {
    // `kind: List` wraps further documents.
    if document.get("kind").and_then(|k| k.as_str()) == Some("List") {
        if let Some(serde_json::Value::Array(items)) = document.get("items") {
            for item in items {
                push_document(out, index, item.clone())?;
            }
        }
        return Ok(());
    }

    let kind = document.get("kind").and_then(|k| k.as_str()).unwrap_or_default().to_string();
    if !KNOWN_KINDS.contains(&kind.as_str()) {
        debug!(document = index, kind = %kind, "Skipping manifest document of unhandled kind");
        return Ok(());
    }
    let resource: Resource = serde_json::from_value(document)
        .map_err(|e| Error::validation(format!("manifest document {index} ({kind}): {e}")))?;
    out.push(resource);
    Ok(())
}

/// Read and parse a manifest file.
pub fn load_manifest_file(path: &Path) -> Result<Vec<Resource>> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read manifests {}: {e}", path.display())))?;
    parse_manifests(&text)
}
