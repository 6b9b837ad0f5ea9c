//! CDS clusters.
//!
//! Service clusters are EDS clusters whose endpoints are served under the
//! service port's load assignment name. ExternalName services become
//! STRICT_DNS clusters with an inline load assignment.

use std::collections::HashMap;

use envoy_types::pb::envoy::config::cluster::v3::cluster::{
    ClusterDiscoveryType, DiscoveryType, DnsLookupFamily, EdsClusterConfig, LbPolicy,
};
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::transport_socket::ConfigType as TransportSocketConfigType;
use envoy_types::pb::envoy::config::core::v3::{Http2ProtocolOptions, TransportSocket};
use envoy_types::pb::envoy::config::endpoint::v3::{ClusterLoadAssignment, LocalityLbEndpoints};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    common_tls_context::{CombinedCertificateValidationContext, ValidationContextType},
    subject_alt_name_matcher::SanType,
    CertificateValidationContext, CommonTlsContext, SdsSecretConfig, SubjectAltNameMatcher, UpstreamTlsContext,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::http_protocol_options::explicit_http_config::ProtocolConfig;
use envoy_types::pb::envoy::extensions::upstreams::http::v3::{
    http_protocol_options::{ExplicitHttpConfig, UpstreamProtocolOptions},
    HttpProtocolOptions as UpstreamHttpProtocolOptionsV3,
};
use envoy_types::pb::envoy::r#type::matcher::v3::{string_matcher::MatchPattern, StringMatcher};
use envoy_types::pb::google::protobuf::Any;

use super::endpoint::lb_endpoint;
use super::resources::{
    ads_config_source, any_from_message, HTTP_PROTOCOL_OPTIONS_TYPE_URL, TLS_TRANSPORT_SOCKET_NAME,
    UPSTREAM_TLS_CONTEXT_TYPE_URL,
};
use crate::config::{ClusterDnsFamily, Parameters};
use crate::dag::{Cluster as DagCluster, Dag, LbStrategy, UpstreamValidation};
use crate::errors::{Error, Result};

const HTTP_PROTOCOL_OPTIONS_KEY: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";

/// Build the CDS resource for a graph cluster.
pub fn build_cluster(cluster: &DagCluster, dag: &Dag, params: &Parameters) -> Result<Cluster> {
    let key = &cluster.key;
    let mut out = Cluster {
        name: cluster.name.clone(),
        lb_policy: lb_policy(key.lb_strategy) as i32,
        connect_timeout: params.timeouts.connect().to_proto(),
        ..Default::default()
    };

    match &key.external_name {
        Some(host) => {
            out.cluster_discovery_type = Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32));
            out.dns_lookup_family = dns_lookup_family(&params.cluster.dns_lookup_family) as i32;
            out.load_assignment = Some(ClusterLoadAssignment {
                cluster_name: key.load_assignment_name(),
                endpoints: vec![LocalityLbEndpoints {
                    lb_endpoints: vec![lb_endpoint(host.clone(), key.port)],
                    ..Default::default()
                }],
                ..Default::default()
            });
        }
        None => {
            out.cluster_discovery_type = Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32));
            out.eds_cluster_config = Some(EdsClusterConfig {
                eds_config: Some(ads_config_source()),
                service_name: key.load_assignment_name(),
            });
        }
    }

    if key.protocol.is_http2() {
        out.typed_extension_protocol_options = http2_protocol_options();
    }

    if key.protocol.is_tls() {
        let sni = key.external_name.clone().unwrap_or_default();
        let alpn = if key.protocol.is_http2() { vec!["h2".to_string()] } else { Vec::new() };
        let validation = key.validation.as_ref().map(|v| validation_context(v, dag)).transpose()?;
        let context = UpstreamTlsContext {
            common_tls_context: Some(CommonTlsContext {
                alpn_protocols: alpn,
                validation_context_type: validation,
                ..Default::default()
            }),
            sni,
            ..Default::default()
        };
        out.transport_socket = Some(TransportSocket {
            name: TLS_TRANSPORT_SOCKET_NAME.to_string(),
            config_type: Some(TransportSocketConfigType::TypedConfig(any_from_message(
                UPSTREAM_TLS_CONTEXT_TYPE_URL,
                &context,
            ))),
        });
    }

    Ok(out)
}

/// Subject-name check against the certificate, trust anchors from SDS.
fn validation_context(validation: &UpstreamValidation, dag: &Dag) -> Result<ValidationContextType> {
    let secret = dag.secret(&validation.ca_secret).ok_or_else(|| {
        Error::invariant(format!(
            "cluster references CA secret {}/{} that is not in the graph",
            validation.ca_secret.namespace, validation.ca_secret.name
        ))
    })?;
    Ok(ValidationContextType::CombinedValidationContext(CombinedCertificateValidationContext {
        default_validation_context: Some(CertificateValidationContext {
            match_typed_subject_alt_names: vec![SubjectAltNameMatcher {
                san_type: SanType::Dns as i32,
                matcher: Some(StringMatcher {
                    match_pattern: Some(MatchPattern::Exact(validation.subject_name.clone())),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            ..Default::default()
        }),
        validation_context_sds_secret_config: Some(SdsSecretConfig {
            name: secret.name.clone(),
            sds_config: Some(ads_config_source()),
        }),
        ..Default::default()
    }))
}

fn lb_policy(strategy: LbStrategy) -> LbPolicy {
    match strategy {
        LbStrategy::RoundRobin => LbPolicy::RoundRobin,
        LbStrategy::WeightedLeastRequest => LbPolicy::LeastRequest,
        LbStrategy::Random => LbPolicy::Random,
    }
}

fn dns_lookup_family(family: &ClusterDnsFamily) -> DnsLookupFamily {
    match family {
        ClusterDnsFamily::V4 => DnsLookupFamily::V4Only,
        ClusterDnsFamily::V6 => DnsLookupFamily::V6Only,
        ClusterDnsFamily::Auto | ClusterDnsFamily::Unsupported(_) => DnsLookupFamily::Auto,
    }
}

fn http2_protocol_options() -> HashMap<String, Any> {
    let options = UpstreamHttpProtocolOptionsV3 {
        upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(ExplicitHttpConfig {
            protocol_config: Some(ProtocolConfig::Http2ProtocolOptions(Http2ProtocolOptions::default())),
        })),
        ..Default::default()
    };
    HashMap::from([(
        HTTP_PROTOCOL_OPTIONS_KEY.to_string(),
        any_from_message(HTTP_PROTOCOL_OPTIONS_TYPE_URL, &options),
    )])
}
