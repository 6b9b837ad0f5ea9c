//! # Processors
//!
//! One processor per root resource kind. Each reads its objects from the
//! snapshot, validates them, and commits virtual host fragments to the
//! [`BuildContext`]. They run in a fixed order: Ingress, HTTPProxy, Gateway API.

pub mod gateway;
pub mod httpproxy;
pub mod ingress;

use super::builder::BuildContext;
use super::status::{reason, ValidationError};
use super::{HeaderMutation, Route, TlsVersion, WeightedCluster};
use crate::config::Parameters;
use crate::utils::{is_valid_header_name, is_valid_hostname, parse_timeout, Timeout};

pub use gateway::GatewayApiProcessor;
pub use httpproxy::HttpProxyProcessor;
pub use ingress::IngressProcessor;

/// Ingress class served when none is configured.
pub const DEFAULT_INGRESS_CLASS: &str = "gateplane";

/// Contributes one resource kind to the build.
pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    fn run(&self, ctx: &mut BuildContext<'_>);
}

/// The processors in build order.
pub fn default_processors() -> Vec<Box<dyn Processor>> {
    vec![Box::new(IngressProcessor), Box::new(HttpProxyProcessor), Box::new(GatewayApiProcessor)]
}

/// With a class configured only objects of that class are served; otherwise
/// objects without a class or with the default class.
pub fn class_matches(object_class: Option<&str>, configured: Option<&str>) -> bool {
    match configured {
        Some(configured) => object_class == Some(configured),
        None => object_class.map(|c| c == DEFAULT_INGRESS_CLASS).unwrap_or(true),
    }
}

pub(crate) fn hostname(value: &str) -> Result<String, ValidationError> {
    let host = value.trim().to_ascii_lowercase();
    if !is_valid_hostname(&host) {
        return Err(ValidationError::new(reason::INVALID_HOSTNAME, format!("invalid hostname {value:?}")));
    }
    Ok(host)
}

pub(crate) fn timeout(value: &str, field: &str) -> Result<Timeout, ValidationError> {
    parse_timeout(value)
        .map_err(|e| ValidationError::new(reason::INVALID_POLICY, format!("invalid {field} {value:?}: {e}")))
}

/// TLS versions of a secure virtual host. An empty minimum uses the
/// configured one, and a lower minimum is raised to it.
pub(crate) fn tls_versions(
    minimum: &str,
    maximum: &str,
    params: &Parameters,
) -> Result<(TlsVersion, Option<TlsVersion>), ValidationError> {
    let floor = TlsVersion::parse(params.tls.minimum_protocol_version()).unwrap_or(TlsVersion::V1_2);
    let min = match minimum.trim() {
        "" => floor,
        value => TlsVersion::parse(value).ok_or_else(|| {
            ValidationError::new(reason::TLS_ERROR, format!("invalid minimum TLS protocol version {value:?}"))
        })?,
    }
    .max(floor);
    let max = match maximum.trim() {
        "" => None,
        value => Some(TlsVersion::parse(value).ok_or_else(|| {
            ValidationError::new(reason::TLS_ERROR, format!("invalid maximum TLS protocol version {value:?}"))
        })?),
    };
    if let Some(max) = max {
        if min > max {
            return Err(ValidationError::new(
                reason::TLS_ERROR,
                format!(
                    "minimum TLS protocol version {} is greater than the maximum {}",
                    min.as_str(),
                    max.as_str()
                ),
            ));
        }
    }
    Ok((min, max))
}

pub(crate) fn check_header_names<'n, I: IntoIterator<Item = &'n String>>(names: I) -> Result<(), ValidationError> {
    for name in names {
        if !is_valid_header_name(name) {
            return Err(ValidationError::new(reason::INVALID_POLICY, format!("invalid header name {name:?}")));
        }
    }
    Ok(())
}

pub(crate) fn check_mutation(mutation: &HeaderMutation) -> Result<(), ValidationError> {
    check_header_names(
        mutation
            .set
            .iter()
            .map(|(n, _)| n)
            .chain(mutation.add.iter().map(|(n, _)| n))
            .chain(mutation.remove.iter()),
    )
}

/// Sum of route weights; Envoy requires it to fit in a u32.
pub(crate) fn total_weight<I: IntoIterator<Item = u32>>(weights: I) -> Result<u32, ValidationError> {
    let total: u64 = weights.into_iter().map(u64::from).sum();
    u32::try_from(total).map_err(|_| {
        ValidationError::new(reason::INVALID_POLICY, format!("total route weight {total} exceeds {}", u32::MAX))
    })
}

/// Weights for an HTTPProxy route: unset weights are zero when any weight is
/// set, and an all-zero route splits evenly.
pub(crate) fn proxy_weights(
    clusters: Vec<(super::ClusterKey, Option<u32>)>,
) -> Result<Vec<WeightedCluster>, ValidationError> {
    let total = total_weight(clusters.iter().map(|(_, w)| w.unwrap_or(0)))?;
    Ok(clusters
        .into_iter()
        .map(|(cluster, weight)| WeightedCluster {
            cluster,
            weight: if total == 0 { 1 } else { weight.unwrap_or(0) },
        })
        .collect())
}

/// First duplicate match specification among one object's routes.
pub(crate) fn find_duplicate(routes: &[Route]) -> Option<&Route> {
    let mut seen = std::collections::BTreeSet::new();
    routes.iter().find(|r| !seen.insert(&r.match_spec))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::ClusterKey;

    #[test]
    fn test_class_matching() {
        assert!(class_matches(None, None));
        assert!(class_matches(Some("gateplane"), None));
        assert!(!class_matches(Some("nginx"), None));
        assert!(class_matches(Some("internal"), Some("internal")));
        assert!(!class_matches(None, Some("internal")));
    }

    #[test]
    fn test_tls_versions() {
        let mut params = Parameters::defaults();
        assert_eq!(tls_versions("", "", &params).unwrap(), (TlsVersion::V1_2, None));
        assert_eq!(tls_versions("1.3", "1.3", &params).unwrap(), (TlsVersion::V1_3, Some(TlsVersion::V1_3)));
        assert!(tls_versions("1.3", "1.2", &params).is_err());
        assert!(tls_versions("1.1", "", &params).is_err());

        params.tls.minimum_protocol_version = "1.3".into();
        assert_eq!(tls_versions("1.2", "", &params).unwrap().0, TlsVersion::V1_3);
    }

    #[test]
    fn test_proxy_weights() {
        let a = ClusterKey::new("d", "a", 80, "");
        let b = ClusterKey::new("d", "b", 80, "");
        let even = proxy_weights(vec![(a.clone(), None), (b.clone(), None)]).unwrap();
        assert_eq!(even.iter().map(|w| w.weight).collect::<Vec<_>>(), vec![1, 1]);
        let split = proxy_weights(vec![(a.clone(), Some(90)), (b.clone(), None)]).unwrap();
        assert_eq!(split.iter().map(|w| w.weight).collect::<Vec<_>>(), vec![90, 0]);

        let err = proxy_weights(vec![(a, Some(u32::MAX)), (b, Some(1))]).err().unwrap();
        assert_eq!(err.reason, reason::INVALID_POLICY);
    }

    #[test]
    fn test_total_weight_bounds() {
        assert_eq!(total_weight([u32::MAX - 1, 1]).unwrap(), u32::MAX);
        assert!(total_weight([u32::MAX, u32::MAX]).is_err());
        assert_eq!(total_weight(std::iter::empty()).unwrap(), 0);
    }
}
