//! Common test utilities for all integration tests.
//!
//! Fixture builders for manifests, builds and discovery requests.

#![allow(dead_code)]
#![allow(clippy::duplicate_mod)]

use std::sync::Arc;

use envoy_types::pb::envoy::config::core::v3::Node;
use envoy_types::pb::envoy::service::discovery::v3::DiscoveryRequest;
use gateplane::config::Parameters;
use gateplane::dag::{BuildOutput, Builder};
use gateplane::resources::Resource;
use gateplane::store::{parse_manifests, InMemoryStore, ResourceSnapshot};

/// Parse a manifest fixture, panicking on malformed YAML.
pub fn manifests(yaml: &str) -> Vec<Resource> {
    parse_manifests(yaml).expect("fixture manifests parse")
}

pub fn snapshot(yaml: &str) -> ResourceSnapshot {
    ResourceSnapshot::from_resources(manifests(yaml))
}

/// Build `yaml` with default parameters.
pub fn build(yaml: &str) -> BuildOutput {
    build_with(yaml, Parameters::defaults())
}

pub fn build_with(yaml: &str, params: Parameters) -> BuildOutput {
    Builder::new(Arc::new(params)).build(&snapshot(yaml))
}

pub fn store(yaml: &str) -> Arc<InMemoryStore> {
    let store = Arc::new(InMemoryStore::new());
    store.apply_all(manifests(yaml));
    store
}

/// A ClusterIP service with one named port.
pub fn service(namespace: &str, name: &str, port: u32) -> String {
    format!(
        r#"
---
apiVersion: v1
kind: Service
metadata:
  name: {name}
  namespace: {namespace}
spec:
  ports:
  - name: http
    port: {port}
    protocol: TCP
"#
    )
}

/// Endpoints for `name` with the given pod IPs on port `port`.
pub fn endpoints(namespace: &str, name: &str, port: u32, ips: &[&str]) -> String {
    let addresses: String = ips.iter().map(|ip| format!("\n    - ip: {ip}")).collect();
    format!(
        r#"
---
apiVersion: v1
kind: Endpoints
metadata:
  name: {name}
  namespace: {namespace}
subsets:
  - addresses:{addresses}
    ports:
    - name: http
      port: {port}
"#
    )
}

/// A root HTTPProxy for `fqdn` with one `/` route to `service`.
pub fn simple_proxy(namespace: &str, name: &str, fqdn: &str, service: &str) -> String {
    format!(
        r#"
---
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata:
  name: {name}
  namespace: {namespace}
spec:
  virtualhost:
    fqdn: {fqdn}
  routes:
  - conditions:
    - prefix: /
    services:
    - name: {service}
      port: 80
"#
    )
}

pub fn node(id: &str) -> Node {
    Node { id: id.to_string(), cluster: "gateplane-test".to_string(), ..Default::default() }
}

pub fn request(type_url: &str, version: &str, nonce: &str, names: &[&str]) -> DiscoveryRequest {
    DiscoveryRequest {
        version_info: version.to_string(),
        node: Some(node("envoy-1")),
        resource_names: names.iter().map(|n| n.to_string()).collect(),
        type_url: type_url.to_string(),
        response_nonce: nonce.to_string(),
        ..Default::default()
    }
}
