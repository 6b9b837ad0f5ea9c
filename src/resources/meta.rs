use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Namespace used when an object does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";

/// The resource kinds the builder reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Kind {
    Ingress,
    #[serde(rename = "HTTPProxy")]
    HttpProxy,
    GatewayClass,
    Gateway,
    #[serde(rename = "HTTPRoute")]
    HttpRoute,
    ReferenceGrant,
    Service,
    Endpoints,
    Secret,
    #[serde(rename = "TLSCertificateDelegation")]
    TlsCertificateDelegation,
}

impl Kind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Ingress => "Ingress",
            Kind::HttpProxy => "HTTPProxy",
            Kind::GatewayClass => "GatewayClass",
            Kind::Gateway => "Gateway",
            Kind::HttpRoute => "HTTPRoute",
            Kind::ReferenceGrant => "ReferenceGrant",
            Kind::Service => "Service",
            Kind::Endpoints => "Endpoints",
            Kind::Secret => "Secret",
            Kind::TlsCertificateDelegation => "TLSCertificateDelegation",
        }
    }

    /// Kinds whose objects receive status outcomes.
    pub fn has_status(&self) -> bool {
        matches!(self, Kind::Ingress | Kind::HttpProxy | Kind::Gateway | Kind::HttpRoute)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PartialOrd for Kind {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Kinds order by name so object identities compare lexicographically.
impl Ord for Kind {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

/// Identity of a stored object: (kind, namespace, name).
///
/// Ordering is lexicographic over the triple, which is what the conflict
/// tie-break relies on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub kind: Kind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn new(kind: Kind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { kind, namespace: namespace.into(), name: name.into() }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// A namespace-scoped name, used for references between objects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NamespacedRef {
    pub namespace: String,
    pub name: String,
}

impl NamespacedRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into() }
    }

    /// Parse `name` or `namespace/name`, defaulting the namespace.
    pub fn parse(value: &str, default_namespace: &str) -> Self {
        match value.split_once('/') {
            Some((namespace, name)) => Self::new(namespace, name),
            None => Self::new(default_namespace, value),
        }
    }
}

impl fmt::Display for NamespacedRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Object metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ObjectMeta {
    pub name: String,
    pub namespace: String,
    pub generation: i64,
    pub annotations: BTreeMap<String, String>,
}

impl ObjectMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into(), ..Default::default() }
    }

    /// The namespace, with the default applied.
    pub fn namespace(&self) -> &str {
        if self.namespace.is_empty() {
            DEFAULT_NAMESPACE
        } else {
            &self.namespace
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn with_annotation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.annotations.insert(key.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_keys_order_by_kind_name() {
        let proxy = ObjectKey::new(Kind::HttpProxy, "a", "x");
        let ingress = ObjectKey::new(Kind::Ingress, "a", "x");
        let route = ObjectKey::new(Kind::HttpRoute, "a", "x");
        assert!(proxy < route);
        assert!(route < ingress);
    }

    #[test]
    fn test_object_keys_order_by_namespace_then_name() {
        let a = ObjectKey::new(Kind::HttpProxy, "default", "b");
        let b = ObjectKey::new(Kind::HttpProxy, "prod", "a");
        assert!(a < b);
        assert!(ObjectKey::new(Kind::HttpProxy, "prod", "a") < ObjectKey::new(Kind::HttpProxy, "prod", "b"));
    }

    #[test]
    fn test_namespaced_ref_parse() {
        assert_eq!(NamespacedRef::parse("tls", "web"), NamespacedRef::new("web", "tls"));
        assert_eq!(NamespacedRef::parse("certs/tls", "web"), NamespacedRef::new("certs", "tls"));
    }

    #[test]
    fn test_default_namespace() {
        assert_eq!(ObjectMeta::new("", "x").namespace(), "default");
        assert_eq!(ObjectMeta::new("prod", "x").namespace(), "prod");
    }
}
