//! projectcontour.io/v1 HTTPProxy.

use serde::{Deserialize, Serialize};

use super::meta::ObjectMeta;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpProxy {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: HttpProxySpec,
}

impl HttpProxy {
    /// Root proxies carry a virtual host.
    pub fn is_root(&self) -> bool {
        self.spec.virtualhost.is_some()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpProxySpec {
    pub virtualhost: Option<VirtualHostSpec>,
    pub routes: Vec<RouteSpec>,
    pub includes: Vec<Include>,
    pub ingress_class_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VirtualHostSpec {
    pub fqdn: String,
    pub tls: Option<TlsSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TlsSpec {
    /// `name` or `namespace/name` when delegated.
    pub secret_name: String,
    pub minimum_protocol_version: String,
    pub maximum_protocol_version: String,
    pub passthrough: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Include {
    pub name: String,
    /// Defaults to the including proxy's namespace.
    pub namespace: String,
    pub conditions: Vec<MatchCondition>,
}

/// One entry of a condition list. Exactly one field should be set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MatchCondition {
    pub prefix: Option<String>,
    pub exact: Option<String>,
    pub regex: Option<String>,
    pub header: Option<HeaderMatchCondition>,
    pub query_parameter: Option<QueryParameterMatchCondition>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeaderMatchCondition {
    pub name: String,
    pub present: bool,
    #[serde(rename = "notpresent")]
    pub not_present: bool,
    pub contains: Option<String>,
    #[serde(rename = "notcontains")]
    pub not_contains: Option<String>,
    pub exact: Option<String>,
    #[serde(rename = "notexact")]
    pub not_exact: Option<String>,
    pub regex: Option<String>,
    /// Evaluate a missing header as empty for the negative matchers.
    pub treat_missing_as_empty: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QueryParameterMatchCondition {
    pub name: String,
    pub exact: Option<String>,
    pub prefix: Option<String>,
    pub suffix: Option<String>,
    pub regex: Option<String>,
    pub contains: Option<String>,
    pub present: bool,
    pub ignore_case: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouteSpec {
    pub conditions: Vec<MatchCondition>,
    pub services: Vec<ServiceSpec>,
    pub timeout_policy: Option<TimeoutPolicy>,
    pub retry_policy: Option<RetryPolicy>,
    pub request_headers_policy: Option<HeadersPolicy>,
    pub response_headers_policy: Option<HeadersPolicy>,
    pub rate_limit_policy: Option<RateLimitPolicy>,
    pub load_balancer_policy: Option<LoadBalancerPolicy>,
    pub path_rewrite_policy: Option<PathRewritePolicy>,
    pub permit_insecure: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceSpec {
    pub name: String,
    pub port: u32,
    pub weight: Option<u32>,
    pub protocol: Option<String>,
    pub validation: Option<UpstreamValidation>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UpstreamValidation {
    pub ca_secret: String,
    pub subject_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    pub response: String,
    pub idle: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    pub count: u32,
    pub per_try_timeout: String,
    pub retry_on: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeadersPolicy {
    pub set: Vec<HeaderValue>,
    pub remove: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeaderValue {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitPolicy {
    pub local: Option<LocalRateLimitSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalRateLimitSpec {
    pub requests: u32,
    /// `second`, `minute` or `hour`.
    pub unit: String,
    pub burst: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadBalancerPolicy {
    pub strategy: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PathRewritePolicy {
    pub replace_prefix: Vec<ReplacePrefix>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplacePrefix {
    pub prefix: String,
    pub replacement: String,
}
