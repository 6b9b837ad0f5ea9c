//! RDS route configurations.
//!
//! The plaintext listener carries one route configuration named after the
//! listener. Secure virtual hosts each get their own, named
//! `https/<fqdn>` on the default listener and `<listener>/<fqdn>` on Gateway
//! listeners, so a filter chain selected by SNI only ever sees its own host.

use std::collections::HashMap;

use envoy_types::pb::envoy::config::core::v3::{
    header_value_option::HeaderAppendAction, HeaderValue, HeaderValueOption, RuntimeFractionalPercent,
};
use envoy_types::pb::envoy::config::route::v3::{
    header_matcher::HeaderMatchSpecifier,
    query_parameter_matcher::QueryParameterMatchSpecifier,
    redirect_action::{RedirectResponseCode, SchemeRewriteSpecifier},
    route::Action,
    route_action::ClusterSpecifier,
    route_match::PathSpecifier,
    weighted_cluster::ClusterWeight,
    HeaderMatcher, QueryParameterMatcher, RedirectAction, Route as EnvoyRoute, RouteAction as EnvoyRouteAction,
    RouteConfiguration, RouteMatch, RetryPolicy as EnvoyRetryPolicy, VirtualHost as EnvoyVirtualHost,
    WeightedCluster as EnvoyWeightedCluster,
};
use envoy_types::pb::envoy::extensions::filters::http::local_ratelimit::v3::LocalRateLimit as LocalRateLimitConfig;
use envoy_types::pb::envoy::r#type::matcher::v3::{string_matcher::MatchPattern, RegexMatcher, StringMatcher};
use envoy_types::pb::envoy::r#type::v3::{fractional_percent, FractionalPercent, TokenBucket};
use envoy_types::pb::google::protobuf::{Any, UInt32Value};

use super::resources::{any_from_message, LOCAL_RATE_LIMIT_FILTER_NAME, LOCAL_RATE_LIMIT_TYPE_URL};
use crate::config::AbsentHeaderPolicy;
use crate::dag::{
    Dag, Forward, HeaderCondition, HeaderMatch, HeaderMutation, Listener, ListenerOrigin, LocalRateLimit, MatchSpec,
    PathMatch, QueryCondition, QueryMatch, Redirect, Route, RouteAction, VirtualHost, WILDCARD_HOST,
};
use crate::errors::{Error, Result};
use crate::utils::duration::duration_to_proto;

const LOCAL_RATE_LIMIT_STAT_PREFIX: &str = "vhost_local_rate_limit";

/// Name of the route configuration serving `hostname` on a secure listener.
pub fn secure_route_config_name(listener: &Listener, hostname: &str) -> String {
    match listener.origin {
        ListenerOrigin::Default => format!("https/{hostname}"),
        ListenerOrigin::Gateway => format!("{}/{hostname}", listener.name),
    }
}

/// Build a route configuration from virtual hosts, in the given order.
pub fn route_configuration<'a>(
    name: &str,
    virtual_hosts: impl IntoIterator<Item = &'a VirtualHost>,
    dag: &Dag,
) -> Result<RouteConfiguration> {
    let virtual_hosts = virtual_hosts.into_iter().map(|v| virtual_host(v, dag)).collect::<Result<Vec<_>>>()?;
    Ok(RouteConfiguration { name: name.to_string(), virtual_hosts, ..Default::default() })
}

fn virtual_host(vhost: &VirtualHost, dag: &Dag) -> Result<EnvoyVirtualHost> {
    let domains = if vhost.hostname == WILDCARD_HOST {
        vec![WILDCARD_HOST.to_string()]
    } else {
        vec![vhost.hostname.clone(), format!("{}:*", vhost.hostname)]
    };
    Ok(EnvoyVirtualHost {
        name: vhost.hostname.clone(),
        domains,
        routes: vhost.routes.iter().map(|r| route(r, dag)).collect::<Result<_>>()?,
        ..Default::default()
    })
}

fn route(route: &Route, dag: &Dag) -> Result<EnvoyRoute> {
    let mut out = EnvoyRoute { r#match: Some(route_match(&route.match_spec)), ..Default::default() };
    match &route.action {
        RouteAction::Redirect(redirect) => out.action = Some(Action::Redirect(redirect_action(redirect))),
        RouteAction::Forward(forward) => {
            out.action = Some(Action::Route(route_action(forward, dag)?));
            let policy = &forward.policy;
            out.request_headers_to_add = header_options(&policy.request_headers);
            out.request_headers_to_remove = policy.request_headers.remove.clone();
            out.response_headers_to_add = header_options(&policy.response_headers);
            out.response_headers_to_remove = policy.response_headers.remove.clone();
            if let Some(limit) = &policy.rate_limit {
                out.typed_per_filter_config = HashMap::from([(
                    LOCAL_RATE_LIMIT_FILTER_NAME.to_string(),
                    local_rate_limit(limit),
                )]);
            }
        }
    }
    Ok(out)
}

fn route_match(spec: &MatchSpec) -> RouteMatch {
    let path_specifier = match &spec.path {
        PathMatch::Exact(path) => PathSpecifier::Path(path.clone()),
        PathMatch::Prefix(prefix) => PathSpecifier::Prefix(prefix.clone()),
        PathMatch::Regex(regex) => PathSpecifier::SafeRegex(regex_matcher(regex.as_str())),
    };
    RouteMatch {
        path_specifier: Some(path_specifier),
        headers: spec.headers.iter().flat_map(header_matchers).collect(),
        query_parameters: spec.query.iter().map(query_matcher).collect(),
        ..Default::default()
    }
}

fn regex_matcher(regex: &str) -> RegexMatcher {
    RegexMatcher { regex: regex.to_string(), ..Default::default() }
}

fn string_matcher(pattern: MatchPattern, ignore_case: bool) -> StringMatcher {
    StringMatcher { match_pattern: Some(pattern), ignore_case, ..Default::default() }
}

/// Envoy matchers for one header condition.
///
/// An inverted string match succeeds on a missing header, so a negated value
/// condition that requires the header is preceded by a presence matcher.
fn header_matchers(header: &HeaderMatch) -> Vec<HeaderMatcher> {
    let matcher = |specifier: HeaderMatchSpecifier, invert: bool| HeaderMatcher {
        name: header.name.clone(),
        header_match_specifier: Some(specifier),
        invert_match: invert,
        ..Default::default()
    };
    let string = |pattern: MatchPattern| HeaderMatchSpecifier::StringMatch(string_matcher(pattern, false));

    match &header.condition {
        HeaderCondition::Present => vec![matcher(HeaderMatchSpecifier::PresentMatch(true), false)],
        HeaderCondition::NotPresent => vec![matcher(HeaderMatchSpecifier::PresentMatch(true), true)],
        HeaderCondition::Exact(v) => vec![matcher(string(MatchPattern::Exact(v.clone())), false)],
        HeaderCondition::Contains(v) => vec![matcher(string(MatchPattern::Contains(v.clone())), false)],
        HeaderCondition::Regex(v) => vec![matcher(string(MatchPattern::SafeRegex(regex_matcher(v.as_str()))), false)],
        HeaderCondition::NotExact(v) | HeaderCondition::NotContains(v) => {
            let pattern = match &header.condition {
                HeaderCondition::NotExact(_) => MatchPattern::Exact(v.clone()),
                _ => MatchPattern::Contains(v.clone()),
            };
            let mut negated = matcher(string(pattern), true);
            match header.absent {
                AbsentHeaderPolicy::Match => {
                    negated.treat_missing_header_as_empty = true;
                    vec![negated]
                }
                AbsentHeaderPolicy::NoMatch => {
                    vec![matcher(HeaderMatchSpecifier::PresentMatch(true), false), negated]
                }
            }
        }
    }
}

fn query_matcher(query: &QueryMatch) -> QueryParameterMatcher {
    let pattern = |pattern: MatchPattern| {
        QueryParameterMatchSpecifier::StringMatch(string_matcher(pattern, query.ignore_case))
    };
    let specifier = match &query.condition {
        QueryCondition::Present => QueryParameterMatchSpecifier::PresentMatch(true),
        QueryCondition::Exact(v) => pattern(MatchPattern::Exact(v.clone())),
        QueryCondition::Prefix(v) => pattern(MatchPattern::Prefix(v.clone())),
        QueryCondition::Suffix(v) => pattern(MatchPattern::Suffix(v.clone())),
        QueryCondition::Contains(v) => pattern(MatchPattern::Contains(v.clone())),
        QueryCondition::Regex(v) => pattern(MatchPattern::SafeRegex(regex_matcher(v.as_str()))),
    };
    QueryParameterMatcher {
        name: query.name.clone(),
        query_parameter_match_specifier: Some(specifier),
        ..Default::default()
    }
}

fn route_action(forward: &Forward, dag: &Dag) -> Result<EnvoyRouteAction> {
    let mut names = Vec::with_capacity(forward.clusters.len());
    for weighted in &forward.clusters {
        let cluster = dag
            .cluster(&weighted.cluster)
            .ok_or_else(|| Error::invariant(format!("route references cluster {} that is not in the graph", weighted.cluster)))?;
        names.push((cluster.name.clone(), weighted.weight));
    }

    let cluster_specifier = match names.as_slice() {
        [] => return Err(Error::invariant("forward route without clusters")),
        [(name, _)] => ClusterSpecifier::Cluster(name.clone()),
        _ => ClusterSpecifier::WeightedClusters(EnvoyWeightedCluster {
            clusters: names
                .into_iter()
                .map(|(name, weight)| ClusterWeight {
                    name,
                    weight: Some(UInt32Value { value: weight }),
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        }),
    };

    let policy = &forward.policy;
    #[allow(deprecated)]
    let action = EnvoyRouteAction {
        cluster_specifier: Some(cluster_specifier),
        timeout: policy.timeout.to_proto(),
        idle_timeout: policy.idle_timeout.to_proto(),
        retry_policy: policy.retry.as_ref().map(|retry| EnvoyRetryPolicy {
            retry_on: retry.retry_on.join(","),
            num_retries: Some(UInt32Value { value: retry.count }),
            per_try_timeout: retry.per_try_timeout.to_proto(),
            ..Default::default()
        }),
        prefix_rewrite: policy.prefix_rewrite.clone().unwrap_or_default(),
        ..Default::default()
    };
    Ok(action)
}

fn header_options(mutation: &HeaderMutation) -> Vec<HeaderValueOption> {
    let option = |(key, value): &(String, String), action: HeaderAppendAction| HeaderValueOption {
        header: Some(HeaderValue { key: key.clone(), value: value.clone(), ..Default::default() }),
        append_action: action as i32,
        ..Default::default()
    };
    mutation
        .set
        .iter()
        .map(|h| option(h, HeaderAppendAction::OverwriteIfExistsOrAdd))
        .chain(mutation.add.iter().map(|h| option(h, HeaderAppendAction::AppendIfExistsOrAdd)))
        .collect()
}

fn redirect_action(redirect: &Redirect) -> RedirectAction {
    let response_code = match redirect.status_code {
        302 => RedirectResponseCode::Found,
        303 => RedirectResponseCode::SeeOther,
        307 => RedirectResponseCode::TemporaryRedirect,
        308 => RedirectResponseCode::PermanentRedirect,
        _ => RedirectResponseCode::MovedPermanently,
    };
    RedirectAction {
        scheme_rewrite_specifier: redirect.scheme.clone().map(SchemeRewriteSpecifier::SchemeRedirect),
        host_redirect: redirect.hostname.clone().unwrap_or_default(),
        port_redirect: redirect.port.unwrap_or_default(),
        response_code: response_code as i32,
        ..Default::default()
    }
}

fn always_on() -> Option<RuntimeFractionalPercent> {
    Some(RuntimeFractionalPercent {
        runtime_key: String::new(),
        default_value: Some(FractionalPercent {
            numerator: 100,
            denominator: fractional_percent::DenominatorType::Hundred as i32,
        }),
    })
}

fn local_rate_limit(limit: &LocalRateLimit) -> Any {
    let config = LocalRateLimitConfig {
        stat_prefix: LOCAL_RATE_LIMIT_STAT_PREFIX.to_string(),
        token_bucket: Some(TokenBucket {
            max_tokens: limit.requests.saturating_add(limit.burst),
            tokens_per_fill: Some(UInt32Value { value: limit.requests }),
            fill_interval: Some(duration_to_proto(limit.unit)),
            ..Default::default()
        }),
        filter_enabled: always_on(),
        filter_enforced: always_on(),
        ..Default::default()
    };
    any_from_message(LOCAL_RATE_LIMIT_TYPE_URL, &config)
}
