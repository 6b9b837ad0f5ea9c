//! HTTPProxy → virtual hosts on the default listeners.
//!
//! Root proxies (those with a `virtualhost`) own an fqdn. Their include tree
//! is walked depth first; include conditions are merged into every route
//! below them. A child that fails validation is excluded on its own; a cycle
//! anywhere in the tree invalidates the root. Proxies no valid root reaches
//! are reported as orphaned.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::{
    check_mutation, class_matches, find_duplicate, hostname, proxy_weights, timeout, tls_versions, Processor,
};
use crate::config::AbsentHeaderPolicy;
use crate::dag::builder::{BuildContext, UpstreamOptions, VirtualHostFragment};
use crate::dag::matching::Pattern;
use crate::dag::status::{reason, ValidationError};
use crate::dag::{
    Forward, HeaderCondition, HeaderMatch, HeaderMutation, LbStrategy, LocalRateLimit, MatchSpec, PathMatch,
    QueryCondition, QueryMatch, Redirect, RetryPolicy, Route, RouteAction, RoutePolicy, SecretKind,
    UpstreamValidation, VirtualHostTls,
};
use crate::resources::core::PortRef;
use crate::resources::httpproxy::{HeaderMatchCondition, HeadersPolicy, MatchCondition, QueryParameterMatchCondition, RouteSpec, ServiceSpec};
use crate::resources::{HttpProxy, Kind, NamespacedRef, ObjectKey, UpstreamProtocol};

/// Retry conditions Envoy accepts in `retry_on`.
const RETRY_ON: &[&str] = &[
    "5xx",
    "gateway-error",
    "reset",
    "connect-failure",
    "retriable-4xx",
    "refused-stream",
    "retriable-status-codes",
    "retriable-headers",
    "cancelled",
    "deadline-exceeded",
    "internal",
    "resource-exhausted",
    "unavailable",
];

pub struct HttpProxyProcessor;

impl Processor for HttpProxyProcessor {
    fn name(&self) -> &'static str {
        "httpproxy"
    }

    fn run(&self, ctx: &mut BuildContext<'_>) {
        let snapshot = ctx.snapshot();
        let params = ctx.params();
        let configured = params.ingress.class_name.as_deref();

        let proxies: Vec<(ObjectKey, &HttpProxy)> = snapshot
            .http_proxies()
            .filter(|p| class_matches(p.spec.ingress_class_name.as_deref(), configured))
            .map(|p| (proxy_key(p), p))
            .collect();

        let mut fqdns: BTreeMap<String, usize> = BTreeMap::new();
        for (_, proxy) in &proxies {
            if let Some(vhost) = &proxy.spec.virtualhost {
                *fqdns.entry(vhost.fqdn.to_ascii_lowercase()).or_default() += 1;
            }
        }

        let mut reached: BTreeSet<ObjectKey> = BTreeSet::new();
        for (key, proxy) in &proxies {
            let Some(vhost) = &proxy.spec.virtualhost else { continue };
            if !params.root_namespaces.is_empty()
                && !params.root_namespaces.iter().any(|ns| ns == proxy.metadata.namespace())
            {
                ctx.set_invalid(
                    key,
                    ValidationError::new(
                        reason::ROOT_NAMESPACE,
                        format!("root HTTPProxy cannot be defined in namespace {}", proxy.metadata.namespace()),
                    ),
                );
                continue;
            }
            if fqdns.get(&vhost.fqdn.to_ascii_lowercase()).copied().unwrap_or(0) > 1 {
                ctx.set_invalid(
                    key,
                    ValidationError::new(
                        reason::DUPLICATE_VHOST,
                        format!("fqdn {:?} is used in multiple HTTPProxies", vhost.fqdn),
                    ),
                );
                continue;
            }

            let result = root_fragments(ctx, key, proxy).and_then(|(fragments, members)| {
                ctx.commit(key, fragments)?;
                Ok(members)
            });
            match result {
                Ok(members) => {
                    for member in &members {
                        ctx.set_valid(member, "valid HTTPProxy");
                    }
                    reached.extend(members);
                }
                Err(e) => ctx.set_invalid(key, e),
            }
        }

        for (key, proxy) in &proxies {
            if !proxy.is_root() && !reached.contains(key) && !ctx.has_status(key) {
                debug!(object = %key, "HTTPProxy is not included by any valid root");
                ctx.set_orphaned(key, "this HTTPProxy is not part of a delegation chain from a root HTTPProxy");
            }
        }
    }
}

fn proxy_key(proxy: &HttpProxy) -> ObjectKey {
    ObjectKey::new(Kind::HttpProxy, proxy.metadata.namespace(), proxy.metadata.name.clone())
}

/// A route plus whether it may be served over plaintext on a secure host.
struct ProxyRoute {
    route: Route,
    permit_insecure: bool,
}

/// Routes of a proxy and the proxies contributing them.
struct Subtree {
    routes: Vec<ProxyRoute>,
    members: BTreeSet<ObjectKey>,
}

/// Conditions inherited from the include chain.
#[derive(Clone, Default)]
struct Inherited {
    prefix: String,
    headers: Vec<HeaderMatch>,
}

fn root_fragments(
    ctx: &mut BuildContext<'_>,
    key: &ObjectKey,
    proxy: &HttpProxy,
) -> Result<(Vec<VirtualHostFragment>, BTreeSet<ObjectKey>), ValidationError> {
    let Some(vhost) = &proxy.spec.virtualhost else {
        return Err(ValidationError::new(reason::INCLUDE_ERROR, "not a root HTTPProxy"));
    };
    let fqdn = hostname(&vhost.fqdn)?;
    let namespace = proxy.metadata.namespace();

    let tls = match &vhost.tls {
        None => None,
        Some(tls) => {
            if tls.passthrough {
                return Err(ValidationError::new(reason::TLS_ERROR, "TLS passthrough is not supported"));
            }
            if tls.secret_name.is_empty() {
                return Err(ValidationError::new(reason::TLS_ERROR, "tls.secretName is required"));
            }
            let secret = NamespacedRef::parse(&tls.secret_name, namespace);
            if !ctx.delegation_permits(&secret, namespace) {
                return Err(ValidationError::new(
                    reason::DELEGATION_NOT_PERMITTED,
                    format!("secret {secret} is not delegated to namespace {namespace}"),
                ));
            }
            let secret = ctx.resolve_secret(&secret, SecretKind::Tls)?;
            let (min_version, max_version) =
                tls_versions(&tls.minimum_protocol_version, &tls.maximum_protocol_version, ctx.params())?;
            Some(VirtualHostTls { secret, min_version, max_version })
        }
    };

    let mut chain = vec![key.clone()];
    let subtree = walk(ctx, key, proxy, &Inherited::default(), &mut chain)?;

    let allow_insecure = ctx.params().permit_insecure_allowed();
    let mut plaintext = Vec::new();
    let mut secure = Vec::new();
    for ProxyRoute { route, permit_insecure } in subtree.routes {
        match tls {
            None => plaintext.push(route),
            Some(_) => {
                if permit_insecure && allow_insecure {
                    plaintext.push(route.clone());
                } else {
                    plaintext.push(Route {
                        match_spec: route.match_spec.clone(),
                        action: RouteAction::Redirect(Redirect::https_upgrade()),
                        source: route.source.clone(),
                    });
                }
                secure.push(route);
            }
        }
    }

    let mut fragments = vec![VirtualHostFragment {
        listener: ctx.http_listener().to_string(),
        hostname: fqdn.clone(),
        tls: None,
        routes: plaintext,
    }];
    if let Some(tls) = tls {
        fragments.push(VirtualHostFragment {
            listener: ctx.https_listener().to_string(),
            hostname: fqdn,
            tls: Some(tls),
            routes: secure,
        });
    }
    Ok((fragments, subtree.members))
}

/// Routes contributed by `proxy` and everything it includes.
///
/// An `Err` excludes `proxy`; `IncludeCycle` errors propagate to the root.
fn walk(
    ctx: &mut BuildContext<'_>,
    key: &ObjectKey,
    proxy: &HttpProxy,
    inherited: &Inherited,
    chain: &mut Vec<ObjectKey>,
) -> Result<Subtree, ValidationError> {
    let namespace = proxy.metadata.namespace();
    let absent = ctx.params().header_matching.absent_header_policy.policy();

    let mut own: Vec<ProxyRoute> = Vec::new();
    for spec in &proxy.spec.routes {
        let conditions = parse_conditions(&spec.conditions, absent, true)?;
        let path = merge_path(&inherited.prefix, conditions.path)?;
        let mut headers = inherited.headers.clone();
        headers.extend(conditions.headers);
        let match_spec = MatchSpec::new(path, headers, conditions.query);

        let mut policy = route_policy(ctx, spec)?;
        policy.prefix_rewrite = prefix_rewrite(spec, &match_spec.path)?;
        let clusters = route_clusters(ctx, namespace, spec)?;
        own.push(ProxyRoute {
            route: Route {
                match_spec,
                action: RouteAction::Forward(Forward { clusters: proxy_weights(clusters)?, policy }),
                source: key.clone(),
            },
            permit_insecure: spec.permit_insecure,
        });
    }
    let routes: Vec<Route> = own.iter().map(|r| r.route.clone()).collect();
    if let Some(dup) = find_duplicate(&routes) {
        return Err(ValidationError::new(
            reason::DUPLICATE_MATCH_CONDITIONS,
            format!("route {:?} is defined more than once", dup.match_spec.path),
        ));
    }

    let mut subtree = Subtree { routes: own, members: BTreeSet::from([key.clone()]) };
    let mut include_conditions = BTreeSet::new();
    for include in &proxy.spec.includes {
        let conditions = parse_conditions(&include.conditions, absent, false)?;
        let child_prefix = match &conditions.path {
            Some(PathMatch::Prefix(p)) => p.clone(),
            _ => "/".to_string(),
        };
        let mut child_inherited = Inherited {
            prefix: path_literal(&merge_path(&inherited.prefix, conditions.path)?),
            headers: inherited.headers.clone(),
        };
        child_inherited.headers.extend(conditions.headers.iter().cloned());
        if !include_conditions.insert((child_prefix, conditions.headers)) {
            return Err(ValidationError::new(
                reason::DUPLICATE_MATCH_CONDITIONS,
                "duplicate conditions defined on an include",
            ));
        }

        let child_ns = if include.namespace.is_empty() { namespace } else { include.namespace.as_str() };
        let child_key = ObjectKey::new(Kind::HttpProxy, child_ns, include.name.clone());
        if chain.contains(&child_key) {
            return Err(ValidationError::new(
                reason::INCLUDE_CYCLE,
                format!("include {child_ns}/{} creates an include cycle", include.name),
            ));
        }
        let Some(child) = ctx.snapshot().http_proxy(child_ns, &include.name) else {
            return Err(ValidationError::new(
                reason::INCLUDE_ERROR,
                format!("include {child_ns}/{} not found", include.name),
            ));
        };
        if child.is_root() {
            return Err(ValidationError::new(
                reason::INCLUDE_ERROR,
                format!("root HTTPProxy cannot include another root HTTPProxy ({child_ns}/{})", include.name),
            ));
        }

        chain.push(child_key.clone());
        let result = walk(ctx, &child_key, child, &child_inherited, chain);
        chain.pop();
        match result {
            Ok(child_tree) => {
                subtree.routes.extend(child_tree.routes);
                subtree.members.extend(child_tree.members);
            }
            Err(e) if e.reason == reason::INCLUDE_CYCLE => return Err(e),
            Err(e) => ctx.set_invalid(&child_key, e),
        }
    }
    Ok(subtree)
}

/// Parsed condition list.
struct Conditions {
    path: Option<PathMatch>,
    headers: Vec<HeaderMatch>,
    query: Vec<QueryMatch>,
}

fn parse_conditions(
    conditions: &[MatchCondition],
    absent: AbsentHeaderPolicy,
    is_route: bool,
) -> Result<Conditions, ValidationError> {
    let invalid = |msg: String| ValidationError::new(reason::INVALID_MATCH, msg);
    let mut out = Conditions { path: None, headers: Vec::new(), query: Vec::new() };

    for condition in conditions {
        let set = [
            condition.prefix.is_some(),
            condition.exact.is_some(),
            condition.regex.is_some(),
            condition.header.is_some(),
            condition.query_parameter.is_some(),
        ]
        .iter()
        .filter(|s| **s)
        .count();
        if set != 1 {
            return Err(invalid("a condition must set exactly one of prefix, exact, regex, header or queryParameter".into()));
        }

        let path = if let Some(prefix) = &condition.prefix {
            if !prefix.starts_with('/') {
                return Err(invalid(format!("prefix {prefix:?} must start with '/'")));
            }
            Some(PathMatch::Prefix(prefix.clone()))
        } else if let Some(exact) = &condition.exact {
            if !is_route {
                return Err(invalid("exact conditions are not allowed on includes".into()));
            }
            if !exact.starts_with('/') {
                return Err(invalid(format!("exact path {exact:?} must start with '/'")));
            }
            Some(PathMatch::Exact(exact.clone()))
        } else if let Some(regex) = &condition.regex {
            if !is_route {
                return Err(invalid("regex conditions are not allowed on includes".into()));
            }
            Some(PathMatch::Regex(Pattern::new(regex).map_err(invalid)?))
        } else {
            None
        };
        if let Some(path) = path {
            if out.path.is_some() {
                return Err(invalid("more than one path condition".into()));
            }
            out.path = Some(path);
        }

        if let Some(header) = &condition.header {
            out.headers.push(header_match(header, absent)?);
        }
        if let Some(query) = &condition.query_parameter {
            if !is_route {
                return Err(invalid("queryParameter conditions are not allowed on includes".into()));
            }
            out.query.push(query_match(query)?);
        }
    }
    Ok(out)
}

fn header_match(header: &HeaderMatchCondition, absent: AbsentHeaderPolicy) -> Result<HeaderMatch, ValidationError> {
    let invalid = |msg: String| ValidationError::new(reason::INVALID_MATCH, msg);
    if !crate::utils::is_valid_header_name(&header.name) {
        return Err(invalid(format!("invalid header name {:?}", header.name)));
    }
    let mut conditions = Vec::new();
    if header.present {
        conditions.push(HeaderCondition::Present);
    }
    if header.not_present {
        conditions.push(HeaderCondition::NotPresent);
    }
    if let Some(v) = &header.contains {
        conditions.push(HeaderCondition::Contains(v.clone()));
    }
    if let Some(v) = &header.not_contains {
        conditions.push(HeaderCondition::NotContains(v.clone()));
    }
    if let Some(v) = &header.exact {
        conditions.push(HeaderCondition::Exact(v.clone()));
    }
    if let Some(v) = &header.not_exact {
        conditions.push(HeaderCondition::NotExact(v.clone()));
    }
    if let Some(v) = &header.regex {
        conditions.push(HeaderCondition::Regex(Pattern::new(v).map_err(invalid)?));
    }
    if conditions.len() != 1 {
        return Err(invalid(format!("header condition {:?} must set exactly one match type", header.name)));
    }

    let absent = match header.treat_missing_as_empty {
        Some(true) => AbsentHeaderPolicy::Match,
        Some(false) => AbsentHeaderPolicy::NoMatch,
        None => absent,
    };
    let condition = conditions.remove(0);
    Ok(HeaderMatch::new(&header.name, condition, absent))
}

fn query_match(query: &QueryParameterMatchCondition) -> Result<QueryMatch, ValidationError> {
    let invalid = |msg: String| ValidationError::new(reason::INVALID_MATCH, msg);
    if query.name.is_empty() {
        return Err(invalid("queryParameter condition requires a name".into()));
    }
    let mut conditions = Vec::new();
    if let Some(v) = &query.exact {
        conditions.push(QueryCondition::Exact(v.clone()));
    }
    if let Some(v) = &query.prefix {
        conditions.push(QueryCondition::Prefix(v.clone()));
    }
    if let Some(v) = &query.suffix {
        conditions.push(QueryCondition::Suffix(v.clone()));
    }
    if let Some(v) = &query.contains {
        conditions.push(QueryCondition::Contains(v.clone()));
    }
    if let Some(v) = &query.regex {
        conditions.push(QueryCondition::Regex(Pattern::new(v).map_err(invalid)?));
    }
    if query.present {
        conditions.push(QueryCondition::Present);
    }
    if conditions.len() != 1 {
        return Err(invalid(format!("queryParameter condition {:?} must set exactly one match type", query.name)));
    }
    Ok(QueryMatch::new(&query.name, conditions.remove(0), query.ignore_case))
}

/// Prepend an include prefix to a route's path matcher.
fn merge_path(prefix: &str, own: Option<PathMatch>) -> Result<PathMatch, ValidationError> {
    let join = |path: &str| -> String {
        if prefix.is_empty() || prefix == "/" {
            path.to_string()
        } else if path == "/" {
            prefix.to_string()
        } else {
            format!("{}{}", prefix.trim_end_matches('/'), path)
        }
    };
    Ok(match own {
        None => PathMatch::Prefix(join("/")),
        Some(PathMatch::Prefix(p)) => PathMatch::Prefix(join(&p)),
        Some(PathMatch::Exact(p)) => PathMatch::Exact(join(&p)),
        Some(PathMatch::Regex(r)) if prefix.is_empty() || prefix == "/" => PathMatch::Regex(r),
        Some(PathMatch::Regex(r)) => {
            let merged = format!("{}{}", regex::escape(prefix.trim_end_matches('/')), r.as_str());
            PathMatch::Regex(Pattern::new(&merged).map_err(|e| ValidationError::new(reason::INVALID_MATCH, e))?)
        }
    })
}

fn path_literal(path: &PathMatch) -> String {
    match path {
        PathMatch::Prefix(p) | PathMatch::Exact(p) => p.clone(),
        PathMatch::Regex(p) => p.as_str().to_string(),
    }
}

fn route_clusters(
    ctx: &mut BuildContext<'_>,
    namespace: &str,
    spec: &RouteSpec,
) -> Result<Vec<(crate::dag::ClusterKey, Option<u32>)>, ValidationError> {
    if spec.services.is_empty() {
        return Err(ValidationError::new(reason::SERVICE_UNRESOLVED, "route has no services"));
    }
    let lb_strategy = spec
        .load_balancer_policy
        .as_ref()
        .map(|p| LbStrategy::parse(&p.strategy))
        .unwrap_or_default();

    let mut clusters = Vec::new();
    for service in &spec.services {
        let cluster = service_cluster(ctx, namespace, service, lb_strategy)?;
        clusters.push((cluster, service.weight));
    }
    Ok(clusters)
}

fn service_cluster(
    ctx: &mut BuildContext<'_>,
    namespace: &str,
    service: &ServiceSpec,
    lb_strategy: LbStrategy,
) -> Result<crate::dag::ClusterKey, ValidationError> {
    let protocol = match service.protocol.as_deref() {
        None => None,
        Some(p) => Some(UpstreamProtocol::parse(p).ok_or_else(|| {
            ValidationError::new(reason::INVALID_POLICY, format!("unsupported upstream protocol {p:?}"))
        })?),
    };

    let validation = match &service.validation {
        None => None,
        Some(v) => {
            if v.subject_name.is_empty() {
                return Err(ValidationError::new(reason::TLS_ERROR, "upstream validation requires subjectName"));
            }
            let ca = NamespacedRef::parse(&v.ca_secret, namespace);
            if !ctx.delegation_permits(&ca, namespace) {
                return Err(ValidationError::new(
                    reason::DELEGATION_NOT_PERMITTED,
                    format!("secret {ca} is not delegated to namespace {namespace}"),
                ));
            }
            let ca_secret = ctx.resolve_secret(&ca, SecretKind::Ca)?;
            Some(UpstreamValidation { ca_secret, subject_name: v.subject_name.clone() })
        }
    };
    let requires_tls = validation.is_some();

    let key = ctx.service_cluster(
        namespace,
        &service.name,
        &PortRef::Number(service.port),
        UpstreamOptions { protocol, lb_strategy, validation },
    )?;
    if requires_tls && !key.protocol.is_tls() {
        return Err(ValidationError::new(
            reason::TLS_ERROR,
            format!("upstream validation on {} requires protocol tls or h2", service.name),
        ));
    }
    Ok(key)
}

fn mutation(policy: Option<&HeadersPolicy>) -> HeaderMutation {
    policy
        .map(|p| HeaderMutation {
            set: p.set.iter().map(|h| (h.name.clone(), h.value.clone())).collect(),
            add: Vec::new(),
            remove: p.remove.clone(),
        })
        .unwrap_or_default()
}

fn route_policy(ctx: &BuildContext<'_>, spec: &RouteSpec) -> Result<RoutePolicy, ValidationError> {
    let global = &ctx.params().policy;
    let mut policy = RoutePolicy {
        request_headers: mutation(spec.request_headers_policy.as_ref()).with_defaults(&global.request_headers),
        response_headers: mutation(spec.response_headers_policy.as_ref()).with_defaults(&global.response_headers),
        ..Default::default()
    };
    check_mutation(&policy.request_headers)?;
    check_mutation(&policy.response_headers)?;

    if let Some(t) = &spec.timeout_policy {
        policy.timeout = timeout(&t.response, "timeoutPolicy.response")?;
        policy.idle_timeout = timeout(&t.idle, "timeoutPolicy.idle")?;
    }

    if let Some(r) = &spec.retry_policy {
        let retry_on = if r.retry_on.is_empty() { vec!["5xx".to_string()] } else { r.retry_on.clone() };
        if let Some(bad) = retry_on.iter().find(|c| !RETRY_ON.contains(&c.as_str())) {
            return Err(ValidationError::new(reason::INVALID_POLICY, format!("unsupported retryOn value {bad:?}")));
        }
        policy.retry = Some(RetryPolicy {
            retry_on,
            count: if r.count == 0 { 1 } else { r.count },
            per_try_timeout: timeout(&r.per_try_timeout, "retryPolicy.perTryTimeout")?,
        });
    }

    if let Some(local) = spec.rate_limit_policy.as_ref().and_then(|p| p.local.as_ref()) {
        let unit = match local.unit.as_str() {
            "second" => std::time::Duration::from_secs(1),
            "minute" => std::time::Duration::from_secs(60),
            "hour" => std::time::Duration::from_secs(3600),
            other => {
                return Err(ValidationError::new(
                    reason::INVALID_POLICY,
                    format!("rate limit unit {other:?} must be second, minute or hour"),
                ))
            }
        };
        if local.requests == 0 {
            return Err(ValidationError::new(reason::INVALID_POLICY, "rate limit requests must be positive"));
        }
        policy.rate_limit = Some(LocalRateLimit { requests: local.requests, unit, burst: local.burst });
    }
    Ok(policy)
}

/// Replacement prefix for the route, chosen by the route's own prefix with
/// an empty-prefix entry as fallback.
fn prefix_rewrite(spec: &RouteSpec, path: &PathMatch) -> Result<Option<String>, ValidationError> {
    let Some(rewrite) = &spec.path_rewrite_policy else { return Ok(None) };
    if rewrite.replace_prefix.is_empty() {
        return Ok(None);
    }
    let PathMatch::Prefix(prefix) = path else {
        return Err(ValidationError::new(reason::INVALID_POLICY, "prefix rewrite requires a prefix condition"));
    };
    rewrite
        .replace_prefix
        .iter()
        .find(|r| &r.prefix == prefix)
        .or_else(|| rewrite.replace_prefix.iter().find(|r| r.prefix.is_empty()))
        .map(|r| Some(r.replacement.clone()))
        .ok_or_else(|| {
            ValidationError::new(reason::INVALID_POLICY, format!("no replacePrefix entry matches prefix {prefix:?}"))
        })
}
