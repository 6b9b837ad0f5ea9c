//! Build properties: determinism, precedence, conflict stability and
//! isolation of invalid objects.

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use gateplane::config::Parameters;
use gateplane::dag::status::reason;
use gateplane::dag::{Builder, Request, RouteAction, Validity};
use gateplane::resources::{Kind, ObjectKey};
use gateplane::store::{InMemoryStore, ResourceStore};
use gateplane::xds::{EndpointIndex, ResourceType, Translator};
use proptest::prelude::*;

fn ingress(name: &str, host: &str, path: &str, service: &str) -> String {
    format!(
        r#"
---
apiVersion: networking.k8s.io/v1
kind: Ingress
metadata:
  name: {name}
  namespace: default
spec:
  rules:
  - host: {host}
    http:
      paths:
      - path: {path}
        pathType: Prefix
        backend:
          service:
            name: {service}
            port:
              number: 80
"#
    )
}

/// One HTTPProxy routing each prefix to `svc-<index>`.
fn prefix_proxy(prefixes: &[String]) -> String {
    let mut yaml = String::new();
    for index in 0..prefixes.len() {
        yaml.push_str(&common::service("default", &format!("svc-{index}"), 80));
    }
    yaml.push_str(
        r#"
---
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata:
  name: prefixes
  namespace: default
spec:
  virtualhost:
    fqdn: prefixes.example.com
  routes:
"#,
    );
    for (index, prefix) in prefixes.iter().enumerate() {
        yaml.push_str(&format!(
            "  - conditions:\n    - prefix: {prefix}\n    services:\n    - name: svc-{index}\n      port: 80\n"
        ));
    }
    yaml
}

fn routed_service(dag: &gateplane::dag::Dag, host: &str, path: &str) -> Option<String> {
    match &dag.select_route("ingress_http", host, &Request::get(path))?.action {
        RouteAction::Forward(forward) => Some(forward.clusters[0].cluster.service.clone()),
        RouteAction::Redirect(_) => None,
    }
}

#[test]
fn test_longer_prefix_wins() {
    let prefixes = vec!["/a".to_string(), "/ab".to_string()];
    let dag = common::build(&prefix_proxy(&prefixes)).dag;
    assert_eq!(routed_service(&dag, "prefixes.example.com", "/ab/x").as_deref(), Some("svc-1"));
    assert_eq!(routed_service(&dag, "prefixes.example.com", "/ac").as_deref(), Some("svc-0"));
    assert_eq!(routed_service(&dag, "prefixes.example.com", "/b"), None);
}

#[test]
fn test_build_is_deterministic_across_apply_order() {
    let docs = common::manifests(&format!(
        "{}{}{}{}",
        common::service("default", "web", 80),
        common::service("default", "api", 80),
        ingress("web", "web.example.com", "/", "web"),
        common::simple_proxy("default", "api", "api.example.com", "api"),
    ));

    let forward = Arc::new(InMemoryStore::new());
    forward.apply_all(docs.clone());
    let reverse = Arc::new(InMemoryStore::new());
    for doc in docs.into_iter().rev() {
        reverse.apply(doc);
    }

    let builder = Builder::new(Arc::new(Parameters::defaults()));
    let a = builder.build(&forward.snapshot());
    let b = builder.build(&reverse.snapshot());
    assert_eq!(a.dag.listeners, b.dag.listeners);
    assert_eq!(a.dag.clusters, b.dag.clusters);
    assert_eq!(a.statuses, b.statuses);

    let translator = Translator::new(Arc::new(Parameters::defaults()));
    let sets_a = translator.translate(&a.dag, &EndpointIndex::from_snapshot(&forward.snapshot())).unwrap();
    let sets_b = translator.translate(&b.dag, &EndpointIndex::from_snapshot(&reverse.snapshot())).unwrap();
    assert_eq!(sets_a, sets_b);
}

#[test]
fn test_clusters_are_shared_across_virtual_hosts() {
    let yaml = format!(
        "{}{}{}",
        common::service("default", "shared", 80),
        ingress("one", "one.example.com", "/", "shared"),
        ingress("two", "two.example.com", "/", "shared"),
    );
    let out = common::build(&yaml);
    assert_eq!(out.dag.clusters.len(), 1);
    let sets = Translator::new(Arc::new(Parameters::defaults()))
        .translate(&out.dag, &EndpointIndex::default())
        .unwrap();
    assert_eq!(sets.get(ResourceType::Cluster).len(), 1);
}

#[test]
fn test_invalid_object_does_not_affect_others() {
    let yaml = format!(
        r#"{}{}
---
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata:
  name: broken
  namespace: default
spec:
  virtualhost:
    fqdn: broken.example.com
  routes:
  - conditions:
    - regex: "/(unclosed"
    services:
    - name: web
      port: 80
"#,
        common::service("default", "web", 80),
        common::simple_proxy("default", "good", "good.example.com", "web"),
    );
    let out = common::build(&yaml);

    let broken = out.status(&ObjectKey::new(Kind::HttpProxy, "default", "broken")).unwrap();
    assert_eq!(broken.validity, Validity::Invalid);
    let good = out.status(&ObjectKey::new(Kind::HttpProxy, "default", "good")).unwrap();
    assert_eq!(good.validity, Validity::Valid);
    assert_eq!(routed_service(&out.dag, "good.example.com", "/").as_deref(), Some("web"));
    assert_eq!(routed_service(&out.dag, "broken.example.com", "/"), None);
}

#[test]
fn test_missing_service_invalidates_only_its_object() {
    let yaml = format!(
        "{}{}{}",
        common::service("default", "web", 80),
        common::simple_proxy("default", "good", "good.example.com", "web"),
        common::simple_proxy("default", "dangling", "dangling.example.com", "nope"),
    );
    let out = common::build(&yaml);
    let dangling = out.status(&ObjectKey::new(Kind::HttpProxy, "default", "dangling")).unwrap();
    assert_eq!(dangling.reason, reason::SERVICE_UNRESOLVED);
    assert_eq!(out.dag.route_count(), 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_first_match_is_longest_prefix(
        prefixes in prop::collection::btree_set("/[ab]{1,3}", 1..6),
        path in "/[ab]{0,5}",
    ) {
        let prefixes: Vec<String> = prefixes.into_iter().collect();
        let dag = common::build(&prefix_proxy(&prefixes)).dag;

        let expected = prefixes
            .iter()
            .enumerate()
            .filter(|(_, p)| path.starts_with(p.as_str()))
            .max_by_key(|(_, p)| p.len())
            .map(|(index, _)| format!("svc-{index}"));
        prop_assert_eq!(routed_service(&dag, "prefixes.example.com", &path), expected);
    }

    #[test]
    fn prop_matching_routes_are_exclusive_per_spec(
        prefixes in prop::collection::btree_set("/[ab]{1,3}", 1..6),
    ) {
        let prefixes: Vec<String> = prefixes.into_iter().collect();
        let out = common::build(&prefix_proxy(&prefixes));
        let vhost = out.dag.listener("ingress_http").unwrap().virtual_host("prefixes.example.com").unwrap();
        let specs: BTreeSet<String> = vhost.routes.iter().map(|r| format!("{:?}", r.match_spec)).collect();
        prop_assert_eq!(specs.len(), vhost.routes.len());
    }

    #[test]
    fn prop_conflict_loser_is_stable(
        names in prop::collection::btree_set("[a-z]{1,8}", 2..4),
        reverse in any::<bool>(),
    ) {
        let names: Vec<String> = names.into_iter().collect();
        let mut docs = common::manifests(&common::service("default", "web", 80));
        let mut ingresses: Vec<_> = names
            .iter()
            .flat_map(|n| common::manifests(&ingress(n, "x.example.com", "/", "web")))
            .collect();
        if reverse {
            ingresses.reverse();
        }
        docs.extend(ingresses);

        let store = InMemoryStore::new();
        for doc in docs {
            store.apply(doc);
        }
        let builder = Builder::new(Arc::new(Parameters::defaults()));
        for _ in 0..2 {
            let out = builder.build(&store.snapshot());
            let vhost = out.dag.listener("ingress_http").unwrap().virtual_host("x.example.com").unwrap();
            prop_assert_eq!(vhost.routes.len(), 1);
            prop_assert_eq!(&vhost.routes[0].source.name, &names[0]);
            for loser in &names[1..] {
                let status = out.status(&ObjectKey::new(Kind::Ingress, "default", loser.as_str())).unwrap();
                prop_assert_eq!(status.reason.as_str(), reason::ROUTE_CONFLICT);
            }
        }
    }
}
