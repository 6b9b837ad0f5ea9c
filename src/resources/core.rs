//! Core kinds: Service, Endpoints, Secret and TLSCertificateDelegation.

use std::collections::BTreeMap;

use base64::Engine;
use serde::{Deserialize, Serialize};

use super::meta::ObjectMeta;

/// Service annotations naming ports that speak a specific upstream protocol.
pub const UPSTREAM_PROTOCOL_ANNOTATIONS: &[(&str, UpstreamProtocol)] = &[
    ("projectcontour.io/upstream-protocol.h2", UpstreamProtocol::H2),
    ("projectcontour.io/upstream-protocol.h2c", UpstreamProtocol::H2c),
    ("projectcontour.io/upstream-protocol.tls", UpstreamProtocol::Tls),
];

/// Protocol spoken to an upstream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpstreamProtocol {
    #[default]
    Http1,
    H2,
    H2c,
    Tls,
}

impl UpstreamProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpstreamProtocol::Http1 => "http1",
            UpstreamProtocol::H2 => "h2",
            UpstreamProtocol::H2c => "h2c",
            UpstreamProtocol::Tls => "tls",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "" => Some(UpstreamProtocol::Http1),
            "h2" => Some(UpstreamProtocol::H2),
            "h2c" => Some(UpstreamProtocol::H2c),
            "tls" => Some(UpstreamProtocol::Tls),
            _ => None,
        }
    }

    /// Whether the upstream connection is TLS.
    pub fn is_tls(&self) -> bool {
        matches!(self, UpstreamProtocol::H2 | UpstreamProtocol::Tls)
    }

    /// Whether the upstream speaks HTTP/2.
    pub fn is_http2(&self) -> bool {
        matches!(self, UpstreamProtocol::H2 | UpstreamProtocol::H2c)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: ServiceSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceSpec {
    #[serde(rename = "type")]
    pub service_type: String,
    pub external_name: Option<String>,
    pub ports: Vec<ServicePort>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServicePort {
    pub name: String,
    pub port: u32,
    pub protocol: String,
}

impl Service {
    /// Find a port by number or name.
    pub fn port(&self, port: &PortRef) -> Option<&ServicePort> {
        self.spec.ports.iter().find(|p| match port {
            PortRef::Number(n) => p.port == *n,
            PortRef::Name(name) => &p.name == name,
        })
    }

    pub fn is_external_name(&self) -> bool {
        self.spec.service_type == "ExternalName"
    }

    /// Upstream protocol for a port, from the service annotations.
    pub fn upstream_protocol(&self, port: &ServicePort) -> UpstreamProtocol {
        for (annotation, protocol) in UPSTREAM_PROTOCOL_ANNOTATIONS {
            if let Some(value) = self.metadata.annotation(annotation) {
                let named = value.split(',').map(str::trim).any(|entry| {
                    entry == port.port.to_string() || (!port.name.is_empty() && entry == port.name)
                });
                if named {
                    return *protocol;
                }
            }
        }
        UpstreamProtocol::Http1
    }
}

/// A port referenced by number or by name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortRef {
    Number(u32),
    Name(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Endpoints {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub subsets: Vec<EndpointSubset>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct EndpointSubset {
    pub addresses: Vec<EndpointAddress>,
    pub ports: Vec<EndpointPort>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointAddress {
    pub ip: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EndpointPort {
    pub name: String,
    pub port: u32,
}

/// Secret type carrying a certificate and key.
pub const SECRET_TYPE_TLS: &str = "kubernetes.io/tls";
pub const TLS_CERT_KEY: &str = "tls.crt";
pub const TLS_PRIVATE_KEY_KEY: &str = "tls.key";
pub const CA_CERT_KEY: &str = "ca.crt";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Secret {
    pub metadata: ObjectMeta,
    #[serde(default, rename = "type")]
    pub secret_type: String,
    /// Base64 encoded values.
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    /// Plain text values, taking precedence over `data`.
    #[serde(default)]
    pub string_data: BTreeMap<String, String>,
}

impl Secret {
    /// Decoded value for `key`.
    pub fn value(&self, key: &str) -> Result<Option<Vec<u8>>, String> {
        if let Some(value) = self.string_data.get(key) {
            return Ok(Some(value.clone().into_bytes()));
        }
        match self.data.get(key) {
            None => Ok(None),
            Some(encoded) => base64::engine::general_purpose::STANDARD
                .decode(encoded.trim())
                .map(Some)
                .map_err(|e| format!("key {key:?} is not valid base64: {e}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TlsCertificateDelegation {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: TlsCertificateDelegationSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsCertificateDelegationSpec {
    pub delegations: Vec<CertificateDelegation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CertificateDelegation {
    pub secret_name: String,
    /// Namespaces allowed to use the secret; `*` grants all.
    pub target_namespaces: Vec<String>,
}
