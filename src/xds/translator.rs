//! DAG → discovery resources.
//!
//! Translation is a pure function of the graph, the endpoint index and the
//! parameters. It fails only when the graph is internally inconsistent, in
//! which case nothing from it may be published.

use std::sync::Arc;

use tracing::debug;

use super::cluster::build_cluster;
use super::endpoint::EndpointIndex;
use super::listener::build_listener;
use super::resources::{
    any_from_message, ResourceSets, ResourceType, CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL, LISTENER_TYPE_URL,
    ROUTE_TYPE_URL, SECRET_TYPE_URL,
};
use super::route::{route_configuration, secure_route_config_name};
use super::secret::build_secret;
use crate::config::Parameters;
use crate::dag::{Dag, ListenerProtocol};
use crate::errors::Result;

#[derive(Debug, Clone)]
pub struct Translator {
    params: Arc<Parameters>,
}

impl Translator {
    pub fn new(params: Arc<Parameters>) -> Self {
        Self { params }
    }

    pub fn translate(&self, dag: &Dag, endpoints: &EndpointIndex) -> Result<ResourceSets> {
        let mut sets = ResourceSets::new();

        for cluster in dag.clusters.values() {
            let built = build_cluster(cluster, dag, &self.params)?;
            sets.insert(ResourceType::Cluster, built.name.clone(), any_from_message(CLUSTER_TYPE_URL, &built));

            if cluster.key.external_name.is_none() {
                let assignment = endpoints.load_assignment(&cluster.key);
                sets.insert(
                    ResourceType::Endpoint,
                    assignment.cluster_name.clone(),
                    any_from_message(ENDPOINT_TYPE_URL, &assignment),
                );
            }
        }

        for secret in dag.secrets.values() {
            sets.insert(ResourceType::Secret, secret.name.clone(), any_from_message(SECRET_TYPE_URL, &build_secret(secret)));
        }

        for listener in &dag.listeners {
            let built = build_listener(listener, dag, &self.params)?;
            sets.insert(ResourceType::Listener, built.name.clone(), any_from_message(LISTENER_TYPE_URL, &built));

            match listener.protocol {
                ListenerProtocol::Http => {
                    let config = route_configuration(&listener.name, &listener.virtual_hosts, dag)?;
                    sets.insert(ResourceType::Route, config.name.clone(), any_from_message(ROUTE_TYPE_URL, &config));
                }
                ListenerProtocol::Https => {
                    for vhost in &listener.virtual_hosts {
                        let name = secure_route_config_name(listener, &vhost.hostname);
                        let config = route_configuration(&name, std::iter::once(vhost), dag)?;
                        sets.insert(ResourceType::Route, name, any_from_message(ROUTE_TYPE_URL, &config));
                    }
                }
            }
        }

        debug!(
            revision = dag.revision,
            clusters = sets.get(ResourceType::Cluster).len(),
            endpoints = sets.get(ResourceType::Endpoint).len(),
            listeners = sets.get(ResourceType::Listener).len(),
            routes = sets.get(ResourceType::Route).len(),
            secrets = sets.get(ResourceType::Secret).len(),
            "Translated DAG into discovery resources"
        );
        Ok(sets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{
        Cluster, ClusterKey, Forward, Listener, ListenerOrigin, MatchSpec, Route, RouteAction, RoutePolicy,
        VirtualHost, WeightedCluster,
    };
    use crate::errors::Error;
    use crate::resources::{Kind, ObjectKey};
    use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;

    fn dag_with_route(cluster: ClusterKey, register: bool) -> Dag {
        let mut dag = Dag::default();
        if register {
            dag.clusters.insert(cluster.clone(), Cluster { key: cluster.clone(), name: cluster.name() });
        }
        dag.listeners.push(Listener {
            name: "ingress_http".into(),
            address: "0.0.0.0".into(),
            port: 8080,
            protocol: ListenerProtocol::Http,
            origin: ListenerOrigin::Default,
            virtual_hosts: vec![VirtualHost {
                hostname: "example.com".into(),
                tls: None,
                routes: vec![Route {
                    match_spec: MatchSpec::prefix("/"),
                    action: RouteAction::Forward(Forward {
                        clusters: vec![WeightedCluster { cluster, weight: 1 }],
                        policy: RoutePolicy::default(),
                    }),
                    source: ObjectKey::new(Kind::Ingress, "default", "web"),
                }],
            }],
        });
        dag
    }

    #[test]
    fn test_translate_produces_every_type() {
        let key = ClusterKey::new("default", "web", 80, "http");
        let dag = dag_with_route(key.clone(), true);
        let sets = Translator::new(Arc::new(Parameters::defaults())).translate(&dag, &EndpointIndex::default()).unwrap();

        assert_eq!(sets.names(ResourceType::Cluster).collect::<Vec<_>>(), vec![key.name().as_str()]);
        assert_eq!(sets.names(ResourceType::Endpoint).collect::<Vec<_>>(), vec!["default/web/http"]);
        assert_eq!(sets.names(ResourceType::Listener).collect::<Vec<_>>(), vec!["ingress_http"]);
        let routes: RouteConfiguration = sets.decode(ResourceType::Route, "ingress_http").unwrap();
        assert_eq!(routes.virtual_hosts[0].domains, vec!["example.com".to_string(), "example.com:*".to_string()]);
        assert!(sets.get(ResourceType::Secret).is_empty());
    }

    #[test]
    fn test_dangling_cluster_fails_translation() {
        let dag = dag_with_route(ClusterKey::new("default", "web", 80, "http"), false);
        let err = Translator::new(Arc::new(Parameters::defaults())).translate(&dag, &EndpointIndex::default()).unwrap_err();
        assert!(matches!(err, Error::Invariant(_)));
    }
}
