//! Discovery resource types and the per-type resource sets a translation
//! produces.

use std::collections::BTreeMap;
use std::fmt;

use envoy_types::pb::envoy::config::core::v3::{
    config_source::ConfigSourceSpecifier, AggregatedConfigSource, ApiVersion, ConfigSource,
};
use envoy_types::pb::google::protobuf::Any;
use prost::Message;

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str = "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const SECRET_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.Secret";

pub const HTTP_CONNECTION_MANAGER_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
pub const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
pub const DOWNSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.DownstreamTlsContext";
pub const UPSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";
pub const LOCAL_RATE_LIMIT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.http.local_ratelimit.v3.LocalRateLimit";
pub const ROUTER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";

pub const LOCAL_RATE_LIMIT_FILTER_NAME: &str = "envoy.filters.http.local_ratelimit";
pub const ROUTER_FILTER_NAME: &str = "envoy.filters.http.router";
pub const TLS_TRANSPORT_SOCKET_NAME: &str = "envoy.transport_sockets.tls";

/// The discovery resource types served.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    Cluster,
    Endpoint,
    Listener,
    Route,
    Secret,
}

impl ResourceType {
    pub const ALL: [ResourceType; 5] = [
        ResourceType::Cluster,
        ResourceType::Endpoint,
        ResourceType::Listener,
        ResourceType::Route,
        ResourceType::Secret,
    ];

    pub fn type_url(&self) -> &'static str {
        match self {
            ResourceType::Cluster => CLUSTER_TYPE_URL,
            ResourceType::Endpoint => ENDPOINT_TYPE_URL,
            ResourceType::Listener => LISTENER_TYPE_URL,
            ResourceType::Route => ROUTE_TYPE_URL,
            ResourceType::Secret => SECRET_TYPE_URL,
        }
    }

    pub fn from_type_url(type_url: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.type_url() == type_url)
    }

    /// Short protocol name used in logs.
    pub fn short_name(&self) -> &'static str {
        match self {
            ResourceType::Cluster => "CDS",
            ResourceType::Endpoint => "EDS",
            ResourceType::Listener => "LDS",
            ResourceType::Route => "RDS",
            ResourceType::Secret => "SDS",
        }
    }

    /// Whether clients subscribe to named resources of this type. Clusters
    /// and listeners are always served in full.
    pub fn is_named(&self) -> bool {
        matches!(self, ResourceType::Endpoint | ResourceType::Route | ResourceType::Secret)
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.short_name())
    }
}

/// Encode `message` into an `Any` with the given type URL.
pub fn any_from_message<M: Message>(type_url: &str, message: &M) -> Any {
    Any { type_url: type_url.to_string(), value: message.encode_to_vec() }
}

/// Config source pointing back at this server over ADS.
pub fn ads_config_source() -> ConfigSource {
    ConfigSource {
        resource_api_version: ApiVersion::V3 as i32,
        config_source_specifier: Some(ConfigSourceSpecifier::Ads(AggregatedConfigSource::default())),
        ..Default::default()
    }
}

/// One name-ordered resource collection per type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceSets {
    sets: BTreeMap<ResourceType, BTreeMap<String, Any>>,
}

impl ResourceSets {
    pub fn new() -> Self {
        let mut sets = BTreeMap::new();
        for resource_type in ResourceType::ALL {
            sets.insert(resource_type, BTreeMap::new());
        }
        Self { sets }
    }

    pub fn insert(&mut self, resource_type: ResourceType, name: impl Into<String>, resource: Any) {
        self.sets.entry(resource_type).or_default().insert(name.into(), resource);
    }

    pub fn get(&self, resource_type: ResourceType) -> &BTreeMap<String, Any> {
        static EMPTY: BTreeMap<String, Any> = BTreeMap::new();
        self.sets.get(&resource_type).unwrap_or(&EMPTY)
    }

    pub fn resource(&self, resource_type: ResourceType, name: &str) -> Option<&Any> {
        self.get(resource_type).get(name)
    }

    pub fn names(&self, resource_type: ResourceType) -> impl Iterator<Item = &str> + '_ {
        self.get(resource_type).keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.sets.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Decode one resource; used by tests and diagnostics.
    pub fn decode<M: Message + Default>(&self, resource_type: ResourceType, name: &str) -> Option<M> {
        self.resource(resource_type, name).and_then(|any| M::decode(any.value.as_slice()).ok())
    }
}
