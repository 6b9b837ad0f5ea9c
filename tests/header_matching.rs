//! Header condition routing, evaluated against built graphs and checked in
//! the translated Envoy route configuration.

mod common;

use envoy_types::pb::envoy::config::route::v3::{header_matcher::HeaderMatchSpecifier, RouteConfiguration};
use gateplane::config::Parameters;
use gateplane::dag::{Dag, Request, RouteAction};
use gateplane::xds::{EndpointIndex, ResourceType, Translator};
use std::sync::Arc;

const HOST: &str = "headermatch.example.com";

fn fixture() -> String {
    let mut yaml = String::new();
    for suffix in ["present", "notpresent", "contains", "notcontains", "exact", "notexact", "regex"] {
        yaml.push_str(&common::service("default", &format!("echo-header-{suffix}"), 80));
    }
    yaml.push_str(
        r#"
---
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata:
  name: headermatch
  namespace: default
spec:
  virtualhost:
    fqdn: headermatch.example.com
  routes:
  - conditions:
    - header:
        name: Target-Present
        present: true
    services:
    - name: echo-header-present
      port: 80
  - conditions:
    - header:
        name: Target-Contains
        contains: ContainsValue
    services:
    - name: echo-header-contains
      port: 80
  - conditions:
    - header:
        name: Target-NotContains
        notcontains: ContainsValue
    services:
    - name: echo-header-notcontains
      port: 80
  - conditions:
    - header:
        name: Target-Exact
        exact: ExactValue
    services:
    - name: echo-header-exact
      port: 80
  - conditions:
    - header:
        name: Target-NotExact
        notexact: ExactValue
    services:
    - name: echo-header-notexact
      port: 80
  - conditions:
    - header:
        name: Target-Regex
        regex: "Regex.*"
    services:
    - name: echo-header-regex
      port: 80
"#,
    );
    yaml
}

fn not_present_fixture() -> String {
    let mut yaml = common::service("default", "echo-header-present", 80);
    yaml.push_str(&common::service("default", "echo-header-notpresent", 80));
    yaml.push_str(
        r#"
---
apiVersion: projectcontour.io/v1
kind: HTTPProxy
metadata:
  name: headermatch
  namespace: default
spec:
  virtualhost:
    fqdn: headermatch.example.com
  routes:
  - conditions:
    - header:
        name: Target-Present
        present: true
    services:
    - name: echo-header-present
      port: 80
  - conditions:
    - header:
        name: Target-Present
        notpresent: true
    services:
    - name: echo-header-notpresent
      port: 80
"#,
    );
    yaml
}

/// The service a request is routed to, if any.
fn routed(dag: &Dag, request: &Request) -> Option<String> {
    let route = dag.select_route("ingress_http", HOST, request)?;
    match &route.action {
        RouteAction::Forward(forward) => Some(forward.clusters[0].cluster.service.clone()),
        RouteAction::Redirect(_) => None,
    }
}

fn get(headers: &[(&str, &str)]) -> Request {
    headers.iter().fold(Request::get("/"), |r, (name, value)| r.with_header(name, value))
}

#[test]
fn test_fixture_is_valid() {
    let out = common::build(&fixture());
    assert!(out.statuses.iter().all(|u| u.outcome.validity == gateplane::dag::Validity::Valid));
    assert_eq!(out.dag.route_count(), 6);
}

#[test]
fn test_present() {
    let dag = common::build(&fixture()).dag;
    assert_eq!(routed(&dag, &get(&[("Target-Present", "random")])).as_deref(), Some("echo-header-present"));
}

#[test]
fn test_contains() {
    let dag = common::build(&fixture()).dag;
    assert_eq!(routed(&dag, &get(&[("Target-Contains", "ContainsValue")])).as_deref(), Some("echo-header-contains"));
    assert_eq!(
        routed(&dag, &get(&[("Target-Contains", "xxx ContainsValue xxx")])).as_deref(),
        Some("echo-header-contains")
    );
    assert_eq!(routed(&dag, &get(&[("Target-Contains", "random")])), None);
}

#[test]
fn test_exact() {
    let dag = common::build(&fixture()).dag;
    assert_eq!(routed(&dag, &get(&[("Target-Exact", "ExactValue")])).as_deref(), Some("echo-header-exact"));
    assert_eq!(routed(&dag, &get(&[("Target-Exact", "NotExactValue")])), None);
    assert_eq!(routed(&dag, &get(&[("Target-Exact", "random")])), None);
}

#[test]
fn test_regex() {
    let dag = common::build(&fixture()).dag;
    assert_eq!(routed(&dag, &get(&[("Target-Regex", "RegexMatch")])).as_deref(), Some("echo-header-regex"));
    assert_eq!(routed(&dag, &get(&[("Target-Regex", "NonMatching")])), None);
}

#[test]
fn test_negated_conditions_with_header_present() {
    let dag = common::build(&fixture()).dag;
    assert_eq!(routed(&dag, &get(&[("Target-NotContains", "random")])).as_deref(), Some("echo-header-notcontains"));
    assert_eq!(routed(&dag, &get(&[("Target-NotContains", "ContainsValue")])), None);
    assert_eq!(routed(&dag, &get(&[("Target-NotContains", "xxx ContainsValue xxx")])), None);
    assert_eq!(routed(&dag, &get(&[("Target-NotExact", "random")])).as_deref(), Some("echo-header-notexact"));
    assert_eq!(routed(&dag, &get(&[("Target-NotExact", "NotExactValue")])).as_deref(), Some("echo-header-notexact"));
    assert_eq!(routed(&dag, &get(&[("Target-NotExact", "ExactValue")])), None);
}

#[test]
fn test_request_table() {
    let dag = common::build(&fixture()).dag;
    let cases: &[(&str, &str, Option<&str>)] = &[
        ("Target-Present", "random", Some("echo-header-present")),
        ("Target-Contains", "random", None),
        ("Target-Contains", "ContainsValue", Some("echo-header-contains")),
        ("Target-Contains", "xxx ContainsValue xxx", Some("echo-header-contains")),
        ("Target-NotContains", "ContainsValue", None),
        ("Target-NotContains", "xxx ContainsValue xxx", None),
        ("Target-NotContains", "random", Some("echo-header-notcontains")),
        ("Target-Exact", "random", None),
        ("Target-Exact", "NotExactValue", None),
        ("Target-Exact", "ExactValue", Some("echo-header-exact")),
        ("Target-NotExact", "random", Some("echo-header-notexact")),
        ("Target-NotExact", "NotExactValue", Some("echo-header-notexact")),
        ("Target-NotExact", "ExactValue", None),
        ("Target-Regex", "RegexMatch", Some("echo-header-regex")),
        ("Target-Regex", "NonMatching", None),
    ];
    for (name, value, expected) in cases {
        assert_eq!(routed(&dag, &get(&[(name, value)])).as_deref(), *expected, "{name}: {value}");
    }
}

#[test]
fn test_negated_conditions_require_the_header_by_default() {
    let dag = common::build(&fixture()).dag;
    assert_eq!(routed(&dag, &get(&[])), None);
}

#[test]
fn test_absent_header_policy_match() {
    let params = Parameters::parse("header-matching:\n  absent-header-policy: match\n".as_bytes()).unwrap();
    let dag = common::build_with(&fixture(), params).dag;
    let service = routed(&dag, &get(&[])).expect("an absent header satisfies a negated condition");
    assert!(service == "echo-header-notcontains" || service == "echo-header-notexact", "routed to {service}");
}

#[test]
fn test_not_present() {
    let dag = common::build(&not_present_fixture()).dag;
    assert_eq!(routed(&dag, &get(&[])).as_deref(), Some("echo-header-notpresent"));
    assert_eq!(routed(&dag, &get(&[("Target-Present", "random")])).as_deref(), Some("echo-header-present"));
}

#[test]
fn test_envoy_encoding_of_negated_conditions() {
    let out = common::build(&fixture());
    let sets = Translator::new(Arc::new(Parameters::defaults()))
        .translate(&out.dag, &EndpointIndex::default())
        .unwrap();
    let config: RouteConfiguration = sets.decode(ResourceType::Route, "ingress_http").unwrap();
    let vhost = &config.virtual_hosts[0];
    assert_eq!(vhost.domains, vec![HOST.to_string(), format!("{HOST}:*")]);

    let not_exact = vhost
        .routes
        .iter()
        .find(|r| r.r#match.as_ref().unwrap().headers.iter().any(|h| h.name == "target-notexact"))
        .unwrap();
    let headers = &not_exact.r#match.as_ref().unwrap().headers;
    // Presence first, then the inverted value match.
    assert_eq!(headers.len(), 2);
    assert!(matches!(headers[0].header_match_specifier, Some(HeaderMatchSpecifier::PresentMatch(true))));
    assert!(!headers[0].invert_match);
    assert!(headers[1].invert_match);
    assert!(matches!(headers[1].header_match_specifier, Some(HeaderMatchSpecifier::StringMatch(_))));
}
