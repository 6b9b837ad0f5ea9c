//! Controller configuration file.
//!
//! The file is YAML with kebab-case keys. Parsing is lenient about values and
//! strict about keys: an unknown key fails [`Parameters::parse`], while a known
//! key with an unsupported value parses and is reported by
//! [`Parameters::validate`].

use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;

use serde::{Deserialize, Deserializer, Serialize};

use crate::utils::{is_valid_header_name, parse_timeout, Timeout};
use crate::{Error, Result};

/// Cipher suites used when the file does not name any.
pub const DEFAULT_TLS_CIPHERS: &[&str] = &[
    "[ECDHE-ECDSA-AES128-GCM-SHA256|ECDHE-ECDSA-CHACHA20-POLY1305]",
    "[ECDHE-RSA-AES128-GCM-SHA256|ECDHE-RSA-CHACHA20-POLY1305]",
    "ECDHE-ECDSA-AES256-GCM-SHA384",
    "ECDHE-RSA-AES256-GCM-SHA384",
];

const VALID_TLS_CIPHERS: &[&str] = &[
    "[ECDHE-ECDSA-AES128-GCM-SHA256|ECDHE-ECDSA-CHACHA20-POLY1305]",
    "[ECDHE-RSA-AES128-GCM-SHA256|ECDHE-RSA-CHACHA20-POLY1305]",
    "ECDHE-ECDSA-AES128-GCM-SHA256",
    "ECDHE-RSA-AES128-GCM-SHA256",
    "ECDHE-ECDSA-AES128-SHA",
    "ECDHE-RSA-AES128-SHA",
    "AES128-GCM-SHA256",
    "AES128-SHA",
    "ECDHE-ECDSA-AES256-GCM-SHA384",
    "ECDHE-RSA-AES256-GCM-SHA384",
    "ECDHE-ECDSA-AES256-SHA",
    "ECDHE-RSA-AES256-SHA",
    "AES256-GCM-SHA384",
    "AES256-SHA",
];

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

fn string_or_number<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Integer(i64),
        Float(f64),
    }

    Ok(match Option::<Scalar>::deserialize(deserializer)? {
        None => String::new(),
        Some(Scalar::Text(s)) => s,
        Some(Scalar::Integer(i)) => i.to_string(),
        Some(Scalar::Float(f)) => f.to_string(),
    })
}

/// Top-level controller configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct Parameters {
    pub debug: bool,

    #[serde(alias = "incluster")]
    pub in_cluster: bool,

    /// Ignore `permitInsecure` on HTTPProxy routes.
    #[serde(alias = "disablePermitInsecure")]
    pub disable_permit_insecure: bool,

    #[serde(deserialize_with = "null_as_default")]
    pub ingress: IngressParameters,

    #[serde(deserialize_with = "null_as_default")]
    pub tls: TlsParameters,

    #[serde(deserialize_with = "null_as_default")]
    pub timeouts: TimeoutParameters,

    #[serde(deserialize_with = "null_as_default")]
    pub cluster: ClusterParameters,

    #[serde(deserialize_with = "null_as_default")]
    pub network: NetworkParameters,

    #[serde(deserialize_with = "null_as_default")]
    pub default_http_versions: Vec<HttpVersion>,

    #[serde(deserialize_with = "null_as_default")]
    pub policy: PolicyParameters,

    #[serde(deserialize_with = "null_as_default")]
    pub listener: ListenerParameters,

    #[serde(deserialize_with = "null_as_default")]
    pub gateway: GatewayParameters,

    pub enable_external_name_service: bool,

    /// Namespaces allowed to hold root HTTPProxies; empty means all.
    #[serde(deserialize_with = "null_as_default")]
    pub root_namespaces: Vec<String>,

    #[serde(deserialize_with = "null_as_default")]
    pub header_matching: HeaderMatchingParameters,
}

impl Default for Parameters {
    fn default() -> Self {
        Self::defaults()
    }
}

impl Parameters {
    /// The configuration used when no file is given.
    pub fn defaults() -> Self {
        Self {
            debug: false,
            in_cluster: false,
            disable_permit_insecure: false,
            ingress: IngressParameters::default(),
            tls: TlsParameters::default(),
            timeouts: TimeoutParameters::default(),
            cluster: ClusterParameters::default(),
            network: NetworkParameters::default(),
            default_http_versions: Vec::new(),
            policy: PolicyParameters::default(),
            listener: ListenerParameters::default(),
            gateway: GatewayParameters::default(),
            enable_external_name_service: false,
            root_namespaces: Vec::new(),
            header_matching: HeaderMatchingParameters::default(),
        }
    }

    /// Parse parameters from YAML. Missing keys take their defaults.
    pub fn parse<R: Read>(mut reader: R) -> Result<Self> {
        let mut content = String::new();
        reader.read_to_string(&mut content)?;

        let has_content = content
            .lines()
            .map(str::trim)
            .any(|line| !line.is_empty() && !line.starts_with('#') && line != "---");
        if !has_content {
            return Ok(Self::defaults());
        }

        let parsed: Option<Self> = serde_yaml::from_str(&content)?;
        Ok(parsed.unwrap_or_default())
    }

    /// Parse parameters from a file on disk.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path).map_err(|e| {
            Error::config(format!("Unable to open parameters file {}: {}", path.display(), e))
        })?;
        Self::parse(file)
    }

    /// Check every value. Reports the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.tls.validate()?;
        self.timeouts.validate()?;
        self.cluster.dns_lookup_family.validate()?;
        for version in &self.default_http_versions {
            version.validate()?;
        }
        self.policy.request_headers.validate()?;
        self.policy.response_headers.validate()?;
        self.listener.validate()?;
        self.gateway.validate()?;
        self.header_matching.absent_header_policy.validate()?;
        Ok(())
    }

    /// Whether HTTPProxy `permitInsecure` is honoured.
    pub fn permit_insecure_allowed(&self) -> bool {
        !self.disable_permit_insecure
    }
}

/// Ingress class filtering.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct IngressParameters {
    /// Only objects of this class are processed; unset means objects without a class.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
}

/// Downstream TLS defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct TlsParameters {
    #[serde(deserialize_with = "string_or_number")]
    pub minimum_protocol_version: String,

    #[serde(deserialize_with = "null_as_default")]
    pub cipher_suites: Vec<String>,
}

impl TlsParameters {
    pub fn validate(&self) -> Result<()> {
        match self.minimum_protocol_version.trim() {
            "" | "1.2" | "1.3" => {}
            other => {
                return Err(Error::validation_field(
                    format!("invalid TLS minimum protocol version {other:?}"),
                    "tls.minimum-protocol-version",
                ))
            }
        }

        for cipher in &self.cipher_suites {
            let cipher = cipher.trim();
            if !VALID_TLS_CIPHERS.contains(&cipher) {
                return Err(Error::validation_field(
                    format!("invalid cipher suite {cipher:?}"),
                    "tls.cipher-suites",
                ));
            }
        }
        Ok(())
    }

    /// The minimum version to apply, `1.2` when unset.
    pub fn minimum_protocol_version(&self) -> &str {
        match self.minimum_protocol_version.trim() {
            "" => "1.2",
            other => other,
        }
    }

    /// Cipher suites to configure on downstream TLS contexts.
    pub fn cipher_suites(&self) -> Vec<String> {
        sanitize_cipher_suites(&self.cipher_suites)
    }
}

/// Trim and de-duplicate cipher suites, keeping order; empty input yields the defaults.
pub fn sanitize_cipher_suites(ciphers: &[String]) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for cipher in ciphers {
        let cipher = cipher.trim();
        if cipher.is_empty() || out.iter().any(|c| c == cipher) {
            continue;
        }
        out.push(cipher.to_string());
    }
    if out.is_empty() {
        return DEFAULT_TLS_CIPHERS.iter().map(|c| c.to_string()).collect();
    }
    out
}

/// Listener and cluster timeouts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct TimeoutParameters {
    #[serde(skip_serializing_if = "String::is_empty")]
    pub request_timeout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub connection_idle_timeout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub stream_idle_timeout: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub max_connection_duration: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub connect_timeout: String,
}

impl Default for TimeoutParameters {
    fn default() -> Self {
        Self {
            request_timeout: String::new(),
            connection_idle_timeout: "60s".to_string(),
            stream_idle_timeout: String::new(),
            max_connection_duration: String::new(),
            connect_timeout: "2s".to_string(),
        }
    }
}

impl TimeoutParameters {
    pub fn validate(&self) -> Result<()> {
        let fields = [
            ("timeouts.request-timeout", &self.request_timeout),
            ("timeouts.connection-idle-timeout", &self.connection_idle_timeout),
            ("timeouts.stream-idle-timeout", &self.stream_idle_timeout),
            ("timeouts.max-connection-duration", &self.max_connection_duration),
            ("timeouts.connect-timeout", &self.connect_timeout),
        ];
        for (field, value) in fields {
            parse_timeout(value).map_err(|e| Error::validation_field(e, field))?;
        }

        if parse_timeout(&self.connect_timeout).ok() == Some(Timeout::Disabled) {
            return Err(Error::validation_field(
                "connect timeout may not be infinite",
                "timeouts.connect-timeout",
            ));
        }
        Ok(())
    }

    pub fn request(&self) -> Timeout {
        parse_timeout(&self.request_timeout).unwrap_or_default()
    }

    pub fn connection_idle(&self) -> Timeout {
        parse_timeout(&self.connection_idle_timeout).unwrap_or_default()
    }

    pub fn stream_idle(&self) -> Timeout {
        parse_timeout(&self.stream_idle_timeout).unwrap_or_default()
    }

    pub fn max_connection_duration(&self) -> Timeout {
        parse_timeout(&self.max_connection_duration).unwrap_or_default()
    }

    pub fn connect(&self) -> Timeout {
        parse_timeout(&self.connect_timeout).unwrap_or_default()
    }
}

/// Upstream cluster settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ClusterParameters {
    pub dns_lookup_family: ClusterDnsFamily,
}

/// DNS family used to resolve ExternalName upstreams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ClusterDnsFamily {
    #[default]
    Auto,
    V4,
    V6,
    Unsupported(String),
}

impl From<String> for ClusterDnsFamily {
    fn from(value: String) -> Self {
        match value.as_str() {
            "auto" => Self::Auto,
            "v4" => Self::V4,
            "v6" => Self::V6,
            _ => Self::Unsupported(value),
        }
    }
}

impl From<ClusterDnsFamily> for String {
    fn from(value: ClusterDnsFamily) -> Self {
        match value {
            ClusterDnsFamily::Auto => "auto".to_string(),
            ClusterDnsFamily::V4 => "v4".to_string(),
            ClusterDnsFamily::V6 => "v6".to_string(),
            ClusterDnsFamily::Unsupported(s) => s,
        }
    }
}

impl ClusterDnsFamily {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Unsupported(s) => Err(Error::validation_field(
                format!("invalid cluster dns family type {s:?}"),
                "cluster.dns-lookup-family",
            )),
            _ => Ok(()),
        }
    }
}

/// Downstream network settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct NetworkParameters {
    /// Trusted hops when computing the client address from X-Forwarded-For.
    pub num_trusted_hops: u32,
}

/// HTTP protocol versions offered to downstream clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HttpVersion {
    Http1,
    Http2,
    Unsupported(String),
}

impl From<String> for HttpVersion {
    fn from(value: String) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "http/1.1" => Self::Http1,
            "http/2" => Self::Http2,
            _ => Self::Unsupported(value),
        }
    }
}

impl From<HttpVersion> for String {
    fn from(value: HttpVersion) -> Self {
        match value {
            HttpVersion::Http1 => "http/1.1".to_string(),
            HttpVersion::Http2 => "http/2".to_string(),
            HttpVersion::Unsupported(s) => s,
        }
    }
}

impl HttpVersion {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Unsupported(s) => Err(Error::validation_field(
                format!("invalid HTTP version {s:?}"),
                "default-http-versions",
            )),
            _ => Ok(()),
        }
    }
}

/// Header mutations applied to every generated route.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct HeadersPolicy {
    #[serde(deserialize_with = "null_as_default", skip_serializing_if = "BTreeMap::is_empty")]
    pub set: BTreeMap<String, String>,
    #[serde(deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
}

impl HeadersPolicy {
    pub fn validate(&self) -> Result<()> {
        for name in self.set.keys().chain(self.remove.iter()) {
            if !is_valid_header_name(name) {
                return Err(Error::validation_field(
                    format!("invalid header name {name:?}"),
                    "policy",
                ));
            }
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.remove.is_empty()
    }
}

/// Global header policies.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct PolicyParameters {
    #[serde(deserialize_with = "null_as_default")]
    pub request_headers: HeadersPolicy,
    #[serde(deserialize_with = "null_as_default")]
    pub response_headers: HeadersPolicy,
    /// Also apply the policies to Ingress routes.
    #[serde(alias = "applyToIngress")]
    pub apply_to_ingress: bool,
}

/// Where a generated listener binds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ListenerAddress {
    pub name: String,
    pub address: String,
    pub port: u16,
}

/// Listener settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ListenerParameters {
    /// Either empty or `exact`.
    pub connection_balancer: String,
    pub http: ListenerAddress,
    pub https: ListenerAddress,
}

impl Default for ListenerParameters {
    fn default() -> Self {
        Self {
            connection_balancer: String::new(),
            http: ListenerAddress {
                name: "ingress_http".to_string(),
                address: "0.0.0.0".to_string(),
                port: 8080,
            },
            https: ListenerAddress {
                name: "ingress_https".to_string(),
                address: "0.0.0.0".to_string(),
                port: 8443,
            },
        }
    }
}

impl ListenerParameters {
    pub fn validate(&self) -> Result<()> {
        match self.connection_balancer.as_str() {
            "" | "exact" => {}
            other => {
                return Err(Error::validation_field(
                    format!("invalid listener connection balancer value {other:?}, only 'exact' connection balancing is supported for now"),
                    "listener.connection-balancer",
                ))
            }
        }
        if self.http.name == self.https.name {
            return Err(Error::validation_field(
                "HTTP and HTTPS listeners need distinct names",
                "listener",
            ));
        }
        Ok(())
    }
}

/// A namespace/name pair where both or neither must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct NamespacedName {
    pub namespace: String,
    pub name: String,
}

impl NamespacedName {
    pub fn validate(&self) -> Result<()> {
        let name_set = !self.name.trim().is_empty();
        let namespace_set = !self.namespace.trim().is_empty();
        if name_set != namespace_set {
            return Err(Error::validation(
                "namespace and name must both be set or both be empty",
            ));
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.name.trim().is_empty() && self.namespace.trim().is_empty()
    }
}

/// Gateway API settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct GatewayParameters {
    /// GatewayClasses with this controller name are reconciled.
    pub controller_name: String,
    /// When set, only this Gateway is processed.
    #[serde(deserialize_with = "null_as_default")]
    pub gateway_ref: NamespacedName,
}

impl Default for GatewayParameters {
    fn default() -> Self {
        Self {
            controller_name: "gateplane.io/gateway-controller".to_string(),
            gateway_ref: NamespacedName::default(),
        }
    }
}

impl GatewayParameters {
    pub fn validate(&self) -> Result<()> {
        self.gateway_ref
            .validate()
            .map_err(|e| Error::validation_field(e.to_string(), "gateway.gateway-ref"))
    }
}

/// How `NotExact`/`NotContains` header conditions treat a missing header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AbsentHeaderPolicy {
    /// The condition requires the header; a missing header fails it.
    #[default]
    NoMatch,
    /// A missing header is evaluated as an empty value.
    Match,
}

/// Header matching settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct HeaderMatchingParameters {
    pub absent_header_policy: AbsentHeaderPolicySetting,
}

/// Serialized form of [`AbsentHeaderPolicy`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AbsentHeaderPolicySetting {
    #[default]
    NoMatch,
    Match,
    Unsupported(String),
}

impl From<String> for AbsentHeaderPolicySetting {
    fn from(value: String) -> Self {
        match value.as_str() {
            "" | "no-match" => Self::NoMatch,
            "match" => Self::Match,
            _ => Self::Unsupported(value),
        }
    }
}

impl From<AbsentHeaderPolicySetting> for String {
    fn from(value: AbsentHeaderPolicySetting) -> Self {
        match value {
            AbsentHeaderPolicySetting::NoMatch => "no-match".to_string(),
            AbsentHeaderPolicySetting::Match => "match".to_string(),
            AbsentHeaderPolicySetting::Unsupported(s) => s,
        }
    }
}

impl AbsentHeaderPolicySetting {
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Unsupported(s) => Err(Error::validation_field(
                format!("invalid absent header policy {s:?}"),
                "header-matching.absent-header-policy",
            )),
            _ => Ok(()),
        }
    }

    pub fn policy(&self) -> AbsentHeaderPolicy {
        match self {
            Self::Match => AbsentHeaderPolicy::Match,
            _ => AbsentHeaderPolicy::NoMatch,
        }
    }
}
