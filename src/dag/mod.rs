//! # Routing DAG
//!
//! The resolved routing graph: Listener → VirtualHost → Route → Cluster.
//!
//! A [`Dag`] is produced fresh by [`builder::Builder`] on every build and is
//! never mutated once published. Clusters and secrets live once in flat
//! tables keyed by [`ClusterKey`] and [`SecretKey`]; routes and virtual hosts
//! refer to them by key.

pub mod builder;
pub mod matching;
pub mod processors;
pub mod status;

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use crate::resources::{ObjectKey, UpstreamProtocol};
use crate::utils::{short_hash, Timeout};

pub use builder::{BuildContext, BuildOutput, Builder};
pub use matching::{HeaderCondition, HeaderMatch, MatchSpec, PathMatch, Pattern, QueryCondition, QueryMatch, Request};
pub use status::{StatusOutcome, StatusUpdate, ValidationError, Validity};

/// Hostname of the catch-all virtual host.
pub const WILDCARD_HOST: &str = "*";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListenerProtocol {
    Http,
    Https,
}

/// Where a listener comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ListenerOrigin {
    /// The configured `ingress_http`/`ingress_https` pair.
    Default,
    /// A Gateway API listener port.
    Gateway,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Listener {
    pub name: String,
    pub address: String,
    pub port: u16,
    pub protocol: ListenerProtocol,
    pub origin: ListenerOrigin,
    /// Ordered by hostname.
    pub virtual_hosts: Vec<VirtualHost>,
}

impl Listener {
    pub fn virtual_host(&self, hostname: &str) -> Option<&VirtualHost> {
        self.virtual_hosts.iter().find(|v| v.hostname == hostname)
    }

    /// The virtual host serving `host`: exact name, then the longest matching
    /// `*.` wildcard, then `*`.
    pub fn virtual_host_for(&self, host: &str) -> Option<&VirtualHost> {
        let host = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
        if let Some(vhost) = self.virtual_host(&host) {
            return Some(vhost);
        }
        self.virtual_hosts
            .iter()
            .filter(|v| {
                v.hostname
                    .strip_prefix('*')
                    .map(|suffix| suffix.starts_with('.') && host.ends_with(suffix))
                    .unwrap_or(false)
            })
            .max_by_key(|v| v.hostname.len())
            .or_else(|| self.virtual_host(WILDCARD_HOST))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VirtualHost {
    pub hostname: String,
    pub tls: Option<VirtualHostTls>,
    /// Ordered by match precedence; the first matching route wins.
    pub routes: Vec<Route>,
}

/// TLS termination settings of a secure virtual host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHostTls {
    pub secret: SecretKey,
    pub min_version: TlsVersion,
    pub max_version: Option<TlsVersion>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TlsVersion {
    V1_2,
    V1_3,
}

impl TlsVersion {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "1.2" => Some(TlsVersion::V1_2),
            "1.3" => Some(TlsVersion::V1_3),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TlsVersion::V1_2 => "1.2",
            TlsVersion::V1_3 => "1.3",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub match_spec: MatchSpec,
    pub action: RouteAction,
    /// Object the route was generated from.
    pub source: ObjectKey,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RouteAction {
    Forward(Forward),
    Redirect(Redirect),
}

impl RouteAction {
    pub fn clusters(&self) -> impl Iterator<Item = &ClusterKey> + '_ {
        let clusters: &[WeightedCluster] = match self {
            RouteAction::Forward(f) => &f.clusters,
            RouteAction::Redirect(_) => &[],
        };
        clusters.iter().map(|c| &c.cluster)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Forward {
    pub clusters: Vec<WeightedCluster>,
    pub policy: RoutePolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WeightedCluster {
    pub cluster: ClusterKey,
    pub weight: u32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoutePolicy {
    pub timeout: Timeout,
    pub idle_timeout: Timeout,
    pub retry: Option<RetryPolicy>,
    pub request_headers: HeaderMutation,
    pub response_headers: HeaderMutation,
    pub rate_limit: Option<LocalRateLimit>,
    pub prefix_rewrite: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retry_on: Vec<String>,
    pub count: u32,
    pub per_try_timeout: Timeout,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMutation {
    pub set: Vec<(String, String)>,
    pub add: Vec<(String, String)>,
    pub remove: Vec<String>,
}

impl HeaderMutation {
    pub fn is_empty(&self) -> bool {
        self.set.is_empty() && self.add.is_empty() && self.remove.is_empty()
    }

    /// Layer `global` underneath: entries already set here win.
    pub fn with_defaults(mut self, global: &crate::config::HeadersPolicy) -> Self {
        for (name, value) in &global.set {
            if !self.set.iter().any(|(n, _)| n.eq_ignore_ascii_case(name)) {
                self.set.push((name.clone(), value.clone()));
            }
        }
        for name in &global.remove {
            if !self.remove.iter().any(|n| n.eq_ignore_ascii_case(name)) {
                self.remove.push(name.clone());
            }
        }
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRateLimit {
    pub requests: u32,
    pub unit: Duration,
    pub burst: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    pub scheme: Option<String>,
    pub hostname: Option<String>,
    pub port: Option<u32>,
    pub status_code: u32,
}

impl Redirect {
    /// Permanent redirect to the `https` scheme.
    pub fn https_upgrade() -> Self {
        Self { scheme: Some("https".to_string()), hostname: None, port: None, status_code: 301 }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LbStrategy {
    #[default]
    RoundRobin,
    WeightedLeastRequest,
    Random,
}

impl LbStrategy {
    /// Unknown strategies fall back to round robin.
    pub fn parse(value: &str) -> Self {
        match value {
            "WeightedLeastRequest" => LbStrategy::WeightedLeastRequest,
            "Random" => LbStrategy::Random,
            _ => LbStrategy::RoundRobin,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LbStrategy::RoundRobin => "RoundRobin",
            LbStrategy::WeightedLeastRequest => "WeightedLeastRequest",
            LbStrategy::Random => "Random",
        }
    }
}

/// Verification of the upstream's certificate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UpstreamValidation {
    pub ca_secret: SecretKey,
    pub subject_name: String,
}

/// Everything that makes two upstreams distinct clusters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClusterKey {
    pub namespace: String,
    pub service: String,
    pub port: u32,
    pub port_name: String,
    pub protocol: UpstreamProtocol,
    pub lb_strategy: LbStrategy,
    pub validation: Option<UpstreamValidation>,
    /// DNS name for ExternalName services.
    pub external_name: Option<String>,
}

impl ClusterKey {
    pub fn new(namespace: &str, service: &str, port: u32, port_name: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            service: service.to_string(),
            port,
            port_name: port_name.to_string(),
            protocol: UpstreamProtocol::default(),
            lb_strategy: LbStrategy::default(),
            validation: None,
            external_name: None,
        }
    }

    /// `<namespace>/<service>/<port>/<hash of the policy fields>`.
    pub fn name(&self) -> String {
        let validation = self
            .validation
            .as_ref()
            .map(|v| format!("{}/{}|{}", v.ca_secret.namespace, v.ca_secret.name, v.subject_name))
            .unwrap_or_default();
        let hash = short_hash([
            self.port_name.as_str(),
            self.protocol.as_str(),
            self.lb_strategy.as_str(),
            validation.as_str(),
            self.external_name.as_deref().unwrap_or_default(),
        ]);
        format!("{}/{}/{}/{}", self.namespace, self.service, self.port, hash)
    }

    /// `<namespace>/<service>/<port name or number>`, shared by every cluster
    /// of the same service port.
    pub fn load_assignment_name(&self) -> String {
        let port = if self.port_name.is_empty() { self.port.to_string() } else { self.port_name.clone() };
        format!("{}/{}/{}", self.namespace, self.service, port)
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cluster {
    pub key: ClusterKey,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SecretKind {
    /// Certificate chain and private key.
    Tls,
    /// CA bundle for upstream validation.
    Ca,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretKey {
    pub namespace: String,
    pub name: String,
    pub kind: SecretKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecretData {
    Tls { cert_chain: Vec<u8>, private_key: Vec<u8> },
    Ca { ca: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub key: SecretKey,
    /// `<namespace>/<name>/<hash of the content>`.
    pub name: String,
    pub data: SecretData,
}

impl Secret {
    pub fn new(key: SecretKey, data: SecretData) -> Self {
        let hash = match &data {
            SecretData::Tls { cert_chain, private_key } => {
                short_hash([b"tls".as_slice(), cert_chain.as_slice(), private_key.as_slice()])
            }
            SecretData::Ca { ca } => short_hash([b"ca".as_slice(), ca.as_slice()]),
        };
        let name = format!("{}/{}/{}", key.namespace, key.name, hash);
        Self { key, name, data }
    }
}

/// The routing graph.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dag {
    /// Store revision the graph was built from.
    pub revision: u64,
    /// Ordered by name.
    pub listeners: Vec<Listener>,
    pub clusters: BTreeMap<ClusterKey, Cluster>,
    pub secrets: BTreeMap<SecretKey, Secret>,
}

impl Dag {
    pub fn listener(&self, name: &str) -> Option<&Listener> {
        self.listeners.iter().find(|l| l.name == name)
    }

    pub fn cluster(&self, key: &ClusterKey) -> Option<&Cluster> {
        self.clusters.get(key)
    }

    pub fn secret(&self, key: &SecretKey) -> Option<&Secret> {
        self.secrets.get(key)
    }

    /// The route a request for `host` on `listener` is served by, if any.
    pub fn select_route(&self, listener: &str, host: &str, request: &Request) -> Option<&Route> {
        self.listener(listener)?
            .virtual_host_for(host)?
            .routes
            .iter()
            .find(|r| r.match_spec.matches(request))
    }

    pub fn route_count(&self) -> usize {
        self.listeners.iter().flat_map(|l| &l.virtual_hosts).map(|v| v.routes.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Kind;

    fn vhost(hostname: &str, prefix: &str) -> VirtualHost {
        VirtualHost {
            hostname: hostname.to_string(),
            tls: None,
            routes: vec![Route {
                match_spec: MatchSpec::prefix(prefix),
                action: RouteAction::Redirect(Redirect::https_upgrade()),
                source: ObjectKey::new(Kind::Ingress, "default", hostname),
            }],
        }
    }

    #[test]
    fn test_virtual_host_selection() {
        let listener = Listener {
            name: "ingress_http".into(),
            address: "0.0.0.0".into(),
            port: 8080,
            protocol: ListenerProtocol::Http,
            origin: ListenerOrigin::Default,
            virtual_hosts: vec![
                vhost("*", "/"),
                vhost("*.example.com", "/"),
                vhost("*.api.example.com", "/"),
                vhost("www.example.com", "/"),
            ],
        };
        let pick = |h: &str| listener.virtual_host_for(h).map(|v| v.hostname.as_str());
        assert_eq!(pick("www.example.com:8080"), Some("www.example.com"));
        assert_eq!(pick("v1.api.example.com"), Some("*.api.example.com"));
        assert_eq!(pick("shop.example.com"), Some("*.example.com"));
        assert_eq!(pick("example.com"), Some("*"));
    }

    #[test]
    fn test_cluster_names_depend_on_policy() {
        let plain = ClusterKey::new("default", "kuard", 80, "http");
        let mut h2 = plain.clone();
        h2.protocol = UpstreamProtocol::H2c;
        assert!(plain.name().starts_with("default/kuard/80/"));
        assert_eq!(plain.name().len(), "default/kuard/80/".len() + 10);
        assert_ne!(plain.name(), h2.name());
        assert_eq!(plain.load_assignment_name(), h2.load_assignment_name());
        assert_eq!(ClusterKey::new("default", "kuard", 80, "").load_assignment_name(), "default/kuard/80");
    }

    #[test]
    fn test_secret_names_follow_content() {
        let key = SecretKey { namespace: "default".into(), name: "tls".into(), kind: SecretKind::Tls };
        let a = Secret::new(key.clone(), SecretData::Tls { cert_chain: b"a".to_vec(), private_key: b"k".to_vec() });
        let b = Secret::new(key, SecretData::Tls { cert_chain: b"b".to_vec(), private_key: b"k".to_vec() });
        assert!(a.name.starts_with("default/tls/"));
        assert_ne!(a.name, b.name);
    }
}
