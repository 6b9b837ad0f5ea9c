//! ClusterLoadAssignments from `Endpoints` objects.
//!
//! Endpoints are not part of the graph: they change far more often than
//! routing objects and are resolved against the clusters at translation time.

use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::core::v3::{
    address::Address as AddressType, socket_address::PortSpecifier, Address, SocketAddress,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint::HostIdentifier, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};

use crate::dag::ClusterKey;
use crate::resources::core::Endpoints;
use crate::store::ResourceSnapshot;

/// Ready addresses per service port, keyed by namespace and service name.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EndpointIndex {
    services: BTreeMap<(String, String), Vec<PortAddresses>>,
}

#[derive(Debug, Clone, PartialEq)]
struct PortAddresses {
    name: String,
    port: u32,
    addresses: Vec<String>,
}

impl EndpointIndex {
    pub fn from_snapshot(snapshot: &ResourceSnapshot) -> Self {
        let mut index = Self::default();
        for endpoints in snapshot.endpoints_all() {
            index.insert(endpoints);
        }
        index
    }

    pub fn insert(&mut self, endpoints: &Endpoints) {
        let mut ports: Vec<PortAddresses> = Vec::new();
        for subset in &endpoints.subsets {
            for port in &subset.ports {
                let entry = match ports.iter_mut().find(|p| p.name == port.name && p.port == port.port) {
                    Some(entry) => entry,
                    None => {
                        ports.push(PortAddresses { name: port.name.clone(), port: port.port, addresses: Vec::new() });
                        let last = ports.len() - 1;
                        &mut ports[last]
                    }
                };
                entry.addresses.extend(subset.addresses.iter().map(|a| a.ip.clone()));
            }
        }
        for port in &mut ports {
            port.addresses.sort();
            port.addresses.dedup();
        }
        let key = (endpoints.metadata.namespace().to_string(), endpoints.metadata.name.clone());
        self.services.insert(key, ports);
    }

    /// Addresses serving a cluster's port: the endpoint port with the service
    /// port's name, or the only port when the service port is unnamed.
    fn addresses(&self, cluster: &ClusterKey) -> Vec<(String, u32)> {
        let Some(ports) = self.services.get(&(cluster.namespace.clone(), cluster.service.clone())) else {
            return Vec::new();
        };
        let port = if cluster.port_name.is_empty() {
            ports.iter().find(|p| p.name.is_empty()).or_else(|| (ports.len() == 1).then(|| &ports[0]))
        } else {
            ports.iter().find(|p| p.name == cluster.port_name)
        };
        port.map(|p| p.addresses.iter().map(|a| (a.clone(), p.port)).collect()).unwrap_or_default()
    }

    /// Load assignment for a cluster, empty when no endpoint is ready.
    pub fn load_assignment(&self, cluster: &ClusterKey) -> ClusterLoadAssignment {
        let lb_endpoints: Vec<LbEndpoint> = self
            .addresses(cluster)
            .into_iter()
            .map(|(address, port)| lb_endpoint(address, port))
            .collect();
        ClusterLoadAssignment {
            cluster_name: cluster.load_assignment_name(),
            endpoints: if lb_endpoints.is_empty() {
                Vec::new()
            } else {
                vec![LocalityLbEndpoints { lb_endpoints, ..Default::default() }]
            },
            ..Default::default()
        }
    }
}

pub(crate) fn socket_address(address: String, port: u32) -> Address {
    Address {
        address: Some(AddressType::SocketAddress(SocketAddress {
            address,
            port_specifier: Some(PortSpecifier::PortValue(port)),
            ..Default::default()
        })),
    }
}

pub(crate) fn lb_endpoint(address: String, port: u32) -> LbEndpoint {
    LbEndpoint {
        host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
            address: Some(socket_address(address, port)),
            ..Default::default()
        })),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::core::{EndpointAddress, EndpointPort, EndpointSubset};
    use crate::resources::ObjectMeta;

    fn endpoints(ports: &[(&str, u32)], ips: &[&str]) -> Endpoints {
        Endpoints {
            metadata: ObjectMeta::new("default", "kuard"),
            subsets: vec![EndpointSubset {
                addresses: ips.iter().map(|ip| EndpointAddress { ip: ip.to_string() }).collect(),
                ports: ports.iter().map(|(n, p)| EndpointPort { name: n.to_string(), port: *p }).collect(),
            }],
        }
    }

    #[test]
    fn test_named_port_selection() {
        let mut index = EndpointIndex::default();
        index.insert(&endpoints(&[("http", 8080), ("metrics", 9090)], &["10.0.0.2", "10.0.0.1"]));

        let cla = index.load_assignment(&ClusterKey::new("default", "kuard", 80, "http"));
        assert_eq!(cla.cluster_name, "default/kuard/http");
        let lb = &cla.endpoints[0].lb_endpoints;
        assert_eq!(lb.len(), 2);
        assert_eq!(lb[0], lb_endpoint("10.0.0.1".into(), 8080));
    }

    #[test]
    fn test_unnamed_single_port_and_missing_service() {
        let mut index = EndpointIndex::default();
        index.insert(&endpoints(&[("", 8080)], &["10.0.0.1"]));
        let cla = index.load_assignment(&ClusterKey::new("default", "kuard", 80, ""));
        assert_eq!(cla.endpoints[0].lb_endpoints.len(), 1);

        let missing = index.load_assignment(&ClusterKey::new("default", "other", 80, ""));
        assert_eq!(missing.cluster_name, "default/other/80");
        assert!(missing.endpoints.is_empty());
    }
}
