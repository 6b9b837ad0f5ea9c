//! Ingress → virtual hosts on the default listeners.

use std::collections::BTreeMap;

use tracing::debug;

use super::{check_header_names, class_matches, find_duplicate, hostname, timeout, tls_versions, Processor};
use crate::dag::builder::{BuildContext, UpstreamOptions, VirtualHostFragment};
use crate::dag::matching::Pattern;
use crate::dag::status::{reason, ValidationError};
use crate::dag::{
    Forward, HeaderMutation, MatchSpec, PathMatch, Redirect, RetryPolicy, Route, RouteAction, RoutePolicy,
    SecretKind, VirtualHostTls, WeightedCluster, WILDCARD_HOST,
};
use crate::resources::core::PortRef;
use crate::resources::ingress::{
    HttpIngressPath, IngressBackend, PathType, ANNOTATION_FORCE_SSL_REDIRECT, ANNOTATION_NUM_RETRIES,
    ANNOTATION_PER_TRY_TIMEOUT, ANNOTATION_RESPONSE_TIMEOUT, ANNOTATION_RETRY_ON, ANNOTATION_TLS_MIN_VERSION,
};
use crate::resources::{Ingress, Kind, NamespacedRef, ObjectKey};

/// Characters that make an `ImplementationSpecific` path a regex.
const REGEX_META: &[char] = &['^', '+', '*', '[', ']', '%'];

pub struct IngressProcessor;

impl Processor for IngressProcessor {
    fn name(&self) -> &'static str {
        "ingress"
    }

    fn run(&self, ctx: &mut BuildContext<'_>) {
        let snapshot = ctx.snapshot();
        let configured = ctx.params().ingress.class_name.as_deref();
        for ingress in snapshot.ingresses() {
            let key = ObjectKey::new(Kind::Ingress, ingress.metadata.namespace(), ingress.metadata.name.clone());
            if !class_matches(ingress.class(), configured) {
                debug!(object = %key, class = ?ingress.class(), "Ignoring Ingress of another class");
                continue;
            }
            let result = fragments(ctx, &key, ingress).and_then(|f| ctx.commit(&key, f));
            match result {
                Ok(()) => ctx.set_valid(&key, "valid Ingress"),
                Err(e) => ctx.set_invalid(&key, e),
            }
        }
    }
}

fn fragments(
    ctx: &mut BuildContext<'_>,
    key: &ObjectKey,
    ingress: &Ingress,
) -> Result<Vec<VirtualHostFragment>, ValidationError> {
    let namespace = ingress.metadata.namespace();
    let policy = route_policy(ctx, ingress)?;

    let mut tls_hosts: BTreeMap<String, VirtualHostTls> = BTreeMap::new();
    for tls in &ingress.spec.tls {
        if tls.secret_name.is_empty() {
            continue;
        }
        let secret = NamespacedRef::parse(&tls.secret_name, namespace);
        if !ctx.delegation_permits(&secret, namespace) {
            return Err(ValidationError::new(
                reason::DELEGATION_NOT_PERMITTED,
                format!("secret {secret} is not delegated to namespace {namespace}"),
            ));
        }
        let secret = ctx.resolve_secret(&secret, SecretKind::Tls)?;
        let min = ingress.metadata.annotation(ANNOTATION_TLS_MIN_VERSION).unwrap_or_default();
        let (min_version, max_version) = tls_versions(min, "", ctx.params())?;
        for host in &tls.hosts {
            let host = hostname(host)?;
            tls_hosts.insert(host, VirtualHostTls { secret: secret.clone(), min_version, max_version });
        }
    }

    let mut by_host: BTreeMap<String, Vec<Route>> = BTreeMap::new();
    if let Some(backend) = &ingress.spec.default_backend {
        let action = forward(ctx, namespace, backend, &policy)?;
        by_host.entry(WILDCARD_HOST.to_string()).or_default().push(Route {
            match_spec: MatchSpec::prefix("/"),
            action,
            source: key.clone(),
        });
    }
    for rule in &ingress.spec.rules {
        let host = if rule.host.is_empty() { WILDCARD_HOST.to_string() } else { hostname(&rule.host)? };
        let Some(http) = &rule.http else { continue };
        for path in &http.paths {
            let action = forward(ctx, namespace, &path.backend, &policy)?;
            by_host.entry(host.clone()).or_default().push(Route {
                match_spec: MatchSpec::new(path_match(path)?, Vec::new(), Vec::new()),
                action,
                source: key.clone(),
            });
        }
    }
    for (host, routes) in &by_host {
        if let Some(dup) = find_duplicate(routes) {
            return Err(ValidationError::new(
                reason::DUPLICATE_MATCH_CONDITIONS,
                format!("path {:?} is defined more than once for host {host}", dup.match_spec.path),
            ));
        }
    }

    let force_ssl = ingress.metadata.annotation(ANNOTATION_FORCE_SSL_REDIRECT) == Some("true");
    let mut out = Vec::new();
    for (host, routes) in by_host {
        let tls = tls_hosts.get(&host).cloned();
        let plaintext = if tls.is_some() && force_ssl {
            routes
                .iter()
                .map(|r| Route {
                    match_spec: r.match_spec.clone(),
                    action: RouteAction::Redirect(Redirect::https_upgrade()),
                    source: r.source.clone(),
                })
                .collect()
        } else {
            routes.clone()
        };
        out.push(VirtualHostFragment {
            listener: ctx.http_listener().to_string(),
            hostname: host.clone(),
            tls: None,
            routes: plaintext,
        });
        if let Some(tls) = tls {
            out.push(VirtualHostFragment { listener: ctx.https_listener().to_string(), hostname: host, tls: Some(tls), routes });
        }
    }
    Ok(out)
}

fn path_match(path: &HttpIngressPath) -> Result<PathMatch, ValidationError> {
    let value = if path.path.is_empty() { "/" } else { path.path.as_str() };
    let invalid = || ValidationError::new(reason::INVALID_MATCH, format!("path {value:?} must start with '/'"));
    match path.path_type {
        PathType::Exact if value.starts_with('/') => Ok(PathMatch::Exact(value.to_string())),
        PathType::Prefix if value.starts_with('/') => Ok(PathMatch::Prefix(value.to_string())),
        PathType::ImplementationSpecific if value.contains(REGEX_META) => {
            let pattern = Pattern::new(value).map_err(|e| ValidationError::new(reason::INVALID_MATCH, e))?;
            Ok(PathMatch::Regex(pattern))
        }
        PathType::ImplementationSpecific if value.starts_with('/') => Ok(PathMatch::Prefix(value.to_string())),
        _ => Err(invalid()),
    }
}

fn forward(
    ctx: &mut BuildContext<'_>,
    namespace: &str,
    backend: &IngressBackend,
    policy: &RoutePolicy,
) -> Result<RouteAction, ValidationError> {
    let unresolved = |msg: &str| ValidationError::new(reason::SERVICE_UNRESOLVED, msg.to_string());
    let service = backend.service.as_ref().ok_or_else(|| unresolved("backend has no service"))?;
    let port = match (&service.port.number, &service.port.name) {
        (Some(number), _) => PortRef::Number(*number),
        (None, Some(name)) => PortRef::Name(name.clone()),
        (None, None) => return Err(unresolved("backend service port is not set")),
    };
    let cluster = ctx.service_cluster(namespace, &service.name, &port, UpstreamOptions::default())?;
    Ok(RouteAction::Forward(Forward {
        clusters: vec![WeightedCluster { cluster, weight: 1 }],
        policy: policy.clone(),
    }))
}

fn route_policy(ctx: &BuildContext<'_>, ingress: &Ingress) -> Result<RoutePolicy, ValidationError> {
    let meta = &ingress.metadata;
    let mut policy = RoutePolicy {
        timeout: timeout(meta.annotation(ANNOTATION_RESPONSE_TIMEOUT).unwrap_or_default(), "response timeout")?,
        ..Default::default()
    };

    if let Some(retry_on) = meta.annotation(ANNOTATION_RETRY_ON) {
        let count = match meta.annotation(ANNOTATION_NUM_RETRIES) {
            None => 1,
            Some(n) => n.trim().parse::<u32>().map_err(|_| {
                ValidationError::new(reason::INVALID_POLICY, format!("invalid {ANNOTATION_NUM_RETRIES} {n:?}"))
            })?,
        };
        policy.retry = Some(RetryPolicy {
            retry_on: retry_on.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect(),
            count,
            per_try_timeout: timeout(meta.annotation(ANNOTATION_PER_TRY_TIMEOUT).unwrap_or_default(), "per-try timeout")?,
        });
    }

    let global = &ctx.params().policy;
    if global.apply_to_ingress {
        check_header_names(global.request_headers.set.keys().chain(global.response_headers.set.keys()))?;
        policy.request_headers = HeaderMutation::default().with_defaults(&global.request_headers);
        policy.response_headers = HeaderMutation::default().with_defaults(&global.response_headers);
    }
    Ok(policy)
}
