//! Gateway API → listeners and virtual hosts.
//!
//! A Gateway is managed when it is the configured gateway reference or, when
//! no reference is configured, when its GatewayClass names our controller.
//! Each listener of a managed Gateway becomes (or joins) a listener named
//! after its protocol and port. HTTPRoutes attach to those listeners through
//! their parent references.

use std::collections::BTreeSet;

use tracing::debug;

use super::{check_mutation, find_duplicate, hostname, timeout, tls_versions, total_weight, Processor};
use crate::dag::builder::{BuildContext, ListenerSpec, UpstreamOptions, VirtualHostFragment};
use crate::dag::matching::Pattern;
use crate::dag::status::{reason, ValidationError};
use crate::dag::{
    Forward, HeaderCondition, HeaderMatch, HeaderMutation, ListenerOrigin, ListenerProtocol, MatchSpec, PathMatch,
    QueryCondition, QueryMatch, Redirect, Route, RouteAction, RoutePolicy, SecretKind, VirtualHostTls,
    WeightedCluster, WILDCARD_HOST,
};
use crate::config::{AbsentHeaderPolicy, Parameters};
use crate::resources::core::PortRef;
use crate::resources::gateway::{
    GatewayListener, HttpBackendRef, HttpHeaderFilter, HttpRouteMatch, HttpRouteRule, ParentReference,
};
use crate::resources::{Gateway, HttpRoute, Kind, NamespacedRef, ObjectKey};
use crate::store::ResourceSnapshot;

/// Address Gateway listeners bind to.
const GATEWAY_LISTENER_ADDRESS: &str = "0.0.0.0";

pub struct GatewayApiProcessor;

/// A validated listener of a managed Gateway.
struct AttachableListener {
    /// Listener in the graph.
    listener: String,
    /// `sectionName` routes select it by.
    section: String,
    hostname: Option<String>,
    tls: Option<VirtualHostTls>,
    all_namespaces: bool,
}

struct ManagedGateway {
    key: ObjectKey,
    listeners: Vec<AttachableListener>,
}

impl Processor for GatewayApiProcessor {
    fn name(&self) -> &'static str {
        "gateway-api"
    }

    fn run(&self, ctx: &mut BuildContext<'_>) {
        let snapshot = ctx.snapshot();
        let params = ctx.params();

        let mut managed = Vec::new();
        for gateway in snapshot.gateways() {
            let key = ObjectKey::new(Kind::Gateway, gateway.metadata.namespace(), gateway.metadata.name.clone());
            if !is_managed(snapshot, params, gateway) {
                debug!(object = %key, "Ignoring Gateway of another controller");
                continue;
            }
            match gateway_listeners(ctx, &key, gateway) {
                Ok(listeners) => {
                    ctx.set_valid(&key, "valid Gateway");
                    managed.push(ManagedGateway { key, listeners });
                }
                Err(e) => ctx.set_invalid(&key, e),
            }
        }

        for route in snapshot.http_routes() {
            let key = ObjectKey::new(Kind::HttpRoute, route.metadata.namespace(), route.metadata.name.clone());
            let Some(attached) = attached_listeners(&managed, &key, route) else {
                continue;
            };
            let result = route_fragments(ctx, &key, route, &attached).and_then(|f| ctx.commit(&key, f));
            match result {
                Ok(()) => ctx.set_valid(&key, "accepted HTTPRoute"),
                Err(e) => ctx.set_invalid(&key, e),
            }
        }
    }
}

fn is_managed(snapshot: &ResourceSnapshot, params: &Parameters, gateway: &Gateway) -> bool {
    let reference = &params.gateway.gateway_ref;
    if !reference.is_empty() {
        return reference.namespace == gateway.metadata.namespace() && reference.name == gateway.metadata.name;
    }
    snapshot
        .gateway_class(&gateway.spec.gateway_class_name)
        .map(|class| class.spec.controller_name == params.gateway.controller_name)
        .unwrap_or(false)
}

fn gateway_listeners(
    ctx: &mut BuildContext<'_>,
    key: &ObjectKey,
    gateway: &Gateway,
) -> Result<Vec<AttachableListener>, ValidationError> {
    let mut names = BTreeSet::new();
    let mut out = Vec::new();
    for listener in &gateway.spec.listeners {
        if !names.insert(listener.name.as_str()) {
            return Err(ValidationError::new(
                reason::LISTENER_INVALID,
                format!("listener name {:?} is used more than once", listener.name),
            ));
        }
        out.push(gateway_listener(ctx, key, listener).map_err(|e| ValidationError {
            description: format!("listener {:?}: {}", listener.name, e.description),
            ..e
        })?);
    }
    Ok(out)
}

fn gateway_listener(
    ctx: &mut BuildContext<'_>,
    key: &ObjectKey,
    listener: &GatewayListener,
) -> Result<AttachableListener, ValidationError> {
    let protocol = match listener.protocol.as_str() {
        "HTTP" => ListenerProtocol::Http,
        "HTTPS" => ListenerProtocol::Https,
        other => {
            return Err(ValidationError::new(reason::UNSUPPORTED, format!("protocol {other:?} is not supported")))
        }
    };
    let port = u16::try_from(listener.port)
        .ok()
        .filter(|p| *p > 0)
        .ok_or_else(|| ValidationError::new(reason::LISTENER_INVALID, format!("invalid port {}", listener.port)))?;
    let host = listener.hostname.as_deref().map(hostname).transpose()?;

    let all_namespaces = match listener
        .allowed_routes
        .as_ref()
        .and_then(|a| a.namespaces.as_ref())
        .and_then(|n| n.from.as_deref())
    {
        None | Some("Same") => false,
        Some("All") => true,
        Some(other) => {
            return Err(ValidationError::new(
                reason::UNSUPPORTED,
                format!("allowedRoutes.namespaces.from {other:?} is not supported"),
            ))
        }
    };

    let tls = match protocol {
        ListenerProtocol::Http => None,
        ListenerProtocol::Https => Some(listener_tls(ctx, key, listener)?),
    };

    let name = match protocol {
        ListenerProtocol::Http => format!("http-{port}"),
        ListenerProtocol::Https => format!("https-{port}"),
    };
    ctx.add_listener(ListenerSpec {
        name: name.clone(),
        address: GATEWAY_LISTENER_ADDRESS.to_string(),
        port,
        protocol,
        origin: ListenerOrigin::Gateway,
    })?;

    Ok(AttachableListener { listener: name, section: listener.name.clone(), hostname: host, tls, all_namespaces })
}

fn listener_tls(
    ctx: &mut BuildContext<'_>,
    key: &ObjectKey,
    listener: &GatewayListener,
) -> Result<VirtualHostTls, ValidationError> {
    let tls_error = |msg: &str| ValidationError::new(reason::TLS_ERROR, msg.to_string());
    let tls = listener.tls.as_ref().ok_or_else(|| tls_error("HTTPS listener requires tls"))?;
    match tls.mode.as_deref() {
        None | Some("Terminate") => {}
        Some(mode) => return Err(ValidationError::new(reason::UNSUPPORTED, format!("TLS mode {mode:?} is not supported"))),
    }
    let cert = tls.certificate_refs.first().ok_or_else(|| tls_error("HTTPS listener requires a certificateRef"))?;
    if !matches!(cert.group.as_deref(), None | Some("")) || !matches!(cert.kind.as_deref(), None | Some("Secret")) {
        return Err(tls_error("certificateRefs must refer to a core Secret"));
    }
    let namespace = cert.namespace.clone().unwrap_or_else(|| key.namespace.clone());
    if !ctx.reference_permitted(key, Kind::Secret, &namespace, &cert.name) {
        return Err(ValidationError::new(
            reason::REF_NOT_PERMITTED,
            format!("secret {namespace}/{} is not permitted by any ReferenceGrant", cert.name),
        ));
    }
    let secret = ctx.resolve_secret(&NamespacedRef::new(namespace, cert.name.clone()), SecretKind::Tls)?;
    let (min_version, max_version) = tls_versions("", "", ctx.params())?;
    Ok(VirtualHostTls { secret, min_version, max_version })
}

/// Listeners the route attaches to, or `None` when none of its parents is a
/// managed Gateway.
fn attached_listeners<'g>(
    managed: &'g [ManagedGateway],
    key: &ObjectKey,
    route: &HttpRoute,
) -> Option<Vec<&'g AttachableListener>> {
    let mut ours = false;
    let mut attached = Vec::new();
    for parent in &route.spec.parent_refs {
        let Some(gateway) = managed.iter().find(|g| parent_matches(parent, &key.namespace, &g.key)) else {
            continue;
        };
        ours = true;
        for listener in &gateway.listeners {
            if parent.section_name.as_deref().is_some_and(|s| s != listener.section) {
                continue;
            }
            if listener.all_namespaces || gateway.key.namespace == key.namespace {
                attached.push(listener);
            }
        }
    }
    ours.then_some(attached)
}

fn parent_matches(parent: &ParentReference, route_namespace: &str, gateway: &ObjectKey) -> bool {
    let namespace = parent.namespace.as_deref().unwrap_or(route_namespace);
    parent.name == gateway.name && namespace == gateway.namespace
}

fn route_fragments(
    ctx: &mut BuildContext<'_>,
    key: &ObjectKey,
    route: &HttpRoute,
    attached: &[&AttachableListener],
) -> Result<Vec<VirtualHostFragment>, ValidationError> {
    if attached.is_empty() {
        return Err(ValidationError::new(
            reason::NOT_ALLOWED_BY_LISTENERS,
            "no parent listener allows this route",
        ));
    }
    let route_hosts = route.spec.hostnames.iter().map(|h| hostname(h)).collect::<Result<Vec<_>, _>>()?;

    let mut routes = Vec::new();
    for rule in &route.spec.rules {
        routes.extend(rule_routes(ctx, key, rule)?);
    }
    if let Some(dup) = find_duplicate(&routes) {
        return Err(ValidationError::new(
            reason::DUPLICATE_MATCH_CONDITIONS,
            format!("match {:?} is defined more than once", dup.match_spec.path),
        ));
    }

    let mut fragments = Vec::new();
    for listener in attached {
        for host in intersect_hostnames(listener.hostname.as_deref(), &route_hosts) {
            fragments.push(VirtualHostFragment {
                listener: listener.listener.clone(),
                hostname: host,
                tls: listener.tls.clone(),
                routes: routes.clone(),
            });
        }
    }
    if fragments.is_empty() {
        return Err(ValidationError::new(
            reason::NOT_ALLOWED_BY_LISTENERS,
            "no route hostname intersects a parent listener hostname",
        ));
    }
    Ok(fragments)
}

/// Hostnames served for a route on a listener.
pub(crate) fn intersect_hostnames(listener: Option<&str>, route: &[String]) -> Vec<String> {
    match (listener, route.is_empty()) {
        (None, true) => vec![WILDCARD_HOST.to_string()],
        (None, false) => route.to_vec(),
        (Some(l), true) => vec![l.to_string()],
        (Some(l), false) => route.iter().filter_map(|r| intersect(l, r)).collect::<BTreeSet<_>>().into_iter().collect(),
    }
}

fn intersect(listener: &str, route: &str) -> Option<String> {
    if listener == route {
        return Some(route.to_string());
    }
    match (listener.strip_prefix("*."), route.strip_prefix("*.")) {
        (Some(suffix), None) if route.ends_with(&format!(".{suffix}")) => Some(route.to_string()),
        (None, Some(suffix)) if listener.ends_with(&format!(".{suffix}")) => Some(listener.to_string()),
        (Some(l), Some(r)) if l.ends_with(&format!(".{r}")) => Some(listener.to_string()),
        (Some(l), Some(r)) if r.ends_with(&format!(".{l}")) => Some(route.to_string()),
        _ => None,
    }
}

fn rule_routes(ctx: &mut BuildContext<'_>, key: &ObjectKey, rule: &HttpRouteRule) -> Result<Vec<Route>, ValidationError> {
    let mut policy = RoutePolicy::default();
    let mut redirect = None;
    for filter in &rule.filters {
        match filter.filter_type.as_str() {
            "RequestHeaderModifier" => policy.request_headers = header_filter(filter.request_header_modifier.as_ref())?,
            "ResponseHeaderModifier" => {
                policy.response_headers = header_filter(filter.response_header_modifier.as_ref())?
            }
            "RequestRedirect" => {
                let spec = filter.request_redirect.clone().unwrap_or_default();
                let status_code = spec.status_code.unwrap_or(302);
                if status_code != 301 && status_code != 302 {
                    return Err(ValidationError::new(
                        reason::INVALID_POLICY,
                        format!("redirect status code {status_code} must be 301 or 302"),
                    ));
                }
                if let Some(host) = &spec.hostname {
                    hostname(host)?;
                }
                redirect = Some(Redirect { scheme: spec.scheme, hostname: spec.hostname, port: spec.port, status_code });
            }
            other => {
                return Err(ValidationError::new(reason::UNSUPPORTED, format!("filter type {other:?} is not supported")))
            }
        }
    }
    if let Some(timeouts) = &rule.timeouts {
        policy.timeout = timeout(timeouts.request.as_deref().unwrap_or_default(), "timeouts.request")?;
    }

    let action = match redirect {
        Some(redirect) => RouteAction::Redirect(redirect),
        None => RouteAction::Forward(Forward { clusters: backends(ctx, key, &rule.backend_refs)?, policy }),
    };

    let default_match = [HttpRouteMatch::default()];
    let matches = if rule.matches.is_empty() { &default_match[..] } else { &rule.matches[..] };
    matches
        .iter()
        .map(|m| Ok(Route { match_spec: match_spec(m)?, action: action.clone(), source: key.clone() }))
        .collect()
}

fn header_filter(filter: Option<&HttpHeaderFilter>) -> Result<HeaderMutation, ValidationError> {
    let Some(filter) = filter else { return Ok(HeaderMutation::default()) };
    let mutation = HeaderMutation {
        set: filter.set.iter().map(|h| (h.name.clone(), h.value.clone())).collect(),
        add: filter.add.iter().map(|h| (h.name.clone(), h.value.clone())).collect(),
        remove: filter.remove.clone(),
    };
    check_mutation(&mutation)?;
    Ok(mutation)
}

fn backends(
    ctx: &mut BuildContext<'_>,
    key: &ObjectKey,
    refs: &[HttpBackendRef],
) -> Result<Vec<WeightedCluster>, ValidationError> {
    if refs.is_empty() {
        return Err(ValidationError::new(reason::NO_BACKENDS, "rule has no backendRefs"));
    }
    let mut clusters = Vec::new();
    for backend in refs {
        if !matches!(backend.group.as_deref(), None | Some("")) || !matches!(backend.kind.as_deref(), None | Some("Service")) {
            return Err(ValidationError::new(
                reason::UNSUPPORTED,
                format!("backendRef {} must refer to a core Service", backend.name),
            ));
        }
        let port = backend.port.ok_or_else(|| {
            ValidationError::new(reason::SERVICE_UNRESOLVED, format!("backendRef {} requires a port", backend.name))
        })?;
        let namespace = backend.namespace.clone().unwrap_or_else(|| key.namespace.clone());
        if !ctx.reference_permitted(key, Kind::Service, &namespace, &backend.name) {
            return Err(ValidationError::new(
                reason::REF_NOT_PERMITTED,
                format!("service {namespace}/{} is not permitted by any ReferenceGrant", backend.name),
            ));
        }
        let cluster = ctx.service_cluster(&namespace, &backend.name, &PortRef::Number(port), UpstreamOptions::default())?;
        clusters.push(WeightedCluster { cluster, weight: backend.weight.unwrap_or(1) });
    }
    if total_weight(clusters.iter().map(|c| c.weight))? == 0 {
        return Err(ValidationError::new(reason::NO_BACKENDS, "all backendRefs have weight 0"));
    }
    Ok(clusters)
}

fn match_spec(m: &HttpRouteMatch) -> Result<MatchSpec, ValidationError> {
    let invalid = |msg: String| ValidationError::new(reason::INVALID_MATCH, msg);

    let path = match &m.path {
        None => PathMatch::Prefix("/".to_string()),
        Some(p) => {
            let value = p.value.clone().unwrap_or_else(|| "/".to_string());
            match p.match_type.as_deref().unwrap_or("PathPrefix") {
                "Exact" if value.starts_with('/') => PathMatch::Exact(value),
                "PathPrefix" if value.starts_with('/') => PathMatch::Prefix(value),
                "RegularExpression" => PathMatch::Regex(Pattern::new(&value).map_err(invalid)?),
                "Exact" | "PathPrefix" => return Err(invalid(format!("path {value:?} must start with '/'"))),
                other => return Err(invalid(format!("path match type {other:?} is not supported"))),
            }
        }
    };

    let mut headers = Vec::new();
    for h in &m.headers {
        if !crate::utils::is_valid_header_name(&h.name) {
            return Err(invalid(format!("invalid header name {:?}", h.name)));
        }
        let condition = match h.match_type.as_deref().unwrap_or("Exact") {
            "Exact" => HeaderCondition::Exact(h.value.clone()),
            "RegularExpression" => HeaderCondition::Regex(Pattern::new(&h.value).map_err(invalid)?),
            other => return Err(invalid(format!("header match type {other:?} is not supported"))),
        };
        headers.push(HeaderMatch::new(&h.name, condition, AbsentHeaderPolicy::NoMatch));
    }

    let mut query = Vec::new();
    for q in &m.query_params {
        if q.name.is_empty() {
            return Err(invalid("query parameter match requires a name".into()));
        }
        let condition = match q.match_type.as_deref().unwrap_or("Exact") {
            "Exact" => QueryCondition::Exact(q.value.clone()),
            "RegularExpression" => QueryCondition::Regex(Pattern::new(&q.value).map_err(invalid)?),
            other => return Err(invalid(format!("query match type {other:?} is not supported"))),
        };
        query.push(QueryMatch::new(&q.name, condition, false));
    }
    Ok(MatchSpec::new(path, headers, query))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::gateway::{HttpHeaderMatch, HttpPathMatch};

    #[test]
    fn test_hostname_intersection() {
        let hosts = |v: &[&str]| v.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        assert_eq!(intersect_hostnames(None, &[]), hosts(&["*"]));
        assert_eq!(intersect_hostnames(Some("a.example.com"), &[]), hosts(&["a.example.com"]));
        assert_eq!(
            intersect_hostnames(Some("*.example.com"), &hosts(&["a.example.com", "b.other.com"])),
            hosts(&["a.example.com"])
        );
        assert_eq!(intersect_hostnames(Some("a.example.com"), &hosts(&["*.example.com"])), hosts(&["a.example.com"]));
        assert_eq!(
            intersect_hostnames(Some("*.example.com"), &hosts(&["*.a.example.com"])),
            hosts(&["*.a.example.com"])
        );
        assert!(intersect_hostnames(Some("a.example.com"), &hosts(&["b.example.com"])).is_empty());
    }

    #[test]
    fn test_match_defaults_to_root_prefix() {
        let spec = match_spec(&HttpRouteMatch::default()).unwrap();
        assert_eq!(spec.path, PathMatch::Prefix("/".into()));
    }

    #[test]
    fn test_match_types() {
        let m = HttpRouteMatch {
            path: Some(HttpPathMatch { match_type: Some("Exact".into()), value: Some("/login".into()) }),
            headers: vec![HttpHeaderMatch { match_type: None, name: "X-Version".into(), value: "2".into() }],
            query_params: vec![HttpHeaderMatch {
                match_type: Some("RegularExpression".into()),
                name: "id".into(),
                value: "[0-9]+".into(),
            }],
        };
        let spec = match_spec(&m).unwrap();
        assert_eq!(spec.path, PathMatch::Exact("/login".into()));
        assert_eq!(spec.headers[0].name, "x-version");
        assert_eq!(spec.query[0].condition, QueryCondition::Regex(Pattern::new("[0-9]+").unwrap()));

        let bad = HttpRouteMatch {
            path: Some(HttpPathMatch { match_type: Some("PathPrefix".into()), value: Some("nope".into()) }),
            ..Default::default()
        };
        assert!(match_spec(&bad).is_err());
    }
}
