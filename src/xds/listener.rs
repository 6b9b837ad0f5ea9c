//! LDS listeners.
//!
//! Plaintext listeners carry a single filter chain whose connection manager
//! fetches the listener's route configuration over RDS. Secure listeners carry
//! one filter chain per virtual host, selected by SNI, each terminating TLS
//! with a certificate fetched over SDS.

use envoy_types::pb::envoy::config::core::v3::{
    transport_socket::ConfigType as TransportSocketConfigType, HttpProtocolOptions, TransportSocket,
};
use envoy_types::pb::envoy::config::listener::v3::{
    filter::ConfigType as FilterConfigType,
    listener::{
        connection_balance_config::{BalanceType, ExactBalance},
        ConnectionBalanceConfig,
    },
    Filter, FilterChain, FilterChainMatch, Listener,
};
use envoy_types::pb::envoy::extensions::filters::http::local_ratelimit::v3::LocalRateLimit;
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::{CodecType, RouteSpecifier},
    http_filter::ConfigType as HttpFilterConfigType,
    HttpConnectionManager, HttpFilter, Rds,
};
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    tls_parameters::TlsProtocol, CommonTlsContext, DownstreamTlsContext, SdsSecretConfig, TlsParameters,
};
use envoy_types::pb::google::protobuf::BoolValue;

use super::endpoint::socket_address;
use super::resources::{
    ads_config_source, any_from_message, DOWNSTREAM_TLS_CONTEXT_TYPE_URL, HTTP_CONNECTION_MANAGER_TYPE_URL,
    LOCAL_RATE_LIMIT_FILTER_NAME, LOCAL_RATE_LIMIT_TYPE_URL, ROUTER_FILTER_NAME, ROUTER_TYPE_URL,
    TLS_TRANSPORT_SOCKET_NAME,
};
use super::route::secure_route_config_name;
use crate::config::{HttpVersion, Parameters};
use crate::dag::{Dag, Listener as DagListener, ListenerProtocol, TlsVersion, VirtualHost, WILDCARD_HOST};
use crate::errors::{Error, Result};

pub const HTTP_CONNECTION_MANAGER_FILTER_NAME: &str = "envoy.filters.network.http_connection_manager";

/// Build the LDS resource for a graph listener.
pub fn build_listener(listener: &DagListener, dag: &Dag, params: &Parameters) -> Result<Listener> {
    let filter_chains = match listener.protocol {
        ListenerProtocol::Http => vec![FilterChain {
            filters: vec![http_connection_manager(&listener.name, &listener.name, params)],
            ..Default::default()
        }],
        ListenerProtocol::Https => listener
            .virtual_hosts
            .iter()
            .map(|vhost| secure_filter_chain(listener, vhost, dag, params))
            .collect::<Result<_>>()?,
    };

    let connection_balance_config = (params.listener.connection_balancer == "exact").then(|| ConnectionBalanceConfig {
        balance_type: Some(BalanceType::ExactBalance(ExactBalance {})),
    });

    Ok(Listener {
        name: listener.name.clone(),
        address: Some(socket_address(listener.address.clone(), u32::from(listener.port))),
        filter_chains,
        connection_balance_config,
        ..Default::default()
    })
}

fn secure_filter_chain(listener: &DagListener, vhost: &VirtualHost, dag: &Dag, params: &Parameters) -> Result<FilterChain> {
    let tls = vhost.tls.as_ref().ok_or_else(|| {
        Error::invariant(format!("virtual host {} on secure listener {} has no TLS settings", vhost.hostname, listener.name))
    })?;
    let secret = dag.secret(&tls.secret).ok_or_else(|| {
        Error::invariant(format!(
            "virtual host {} references secret {}/{} that is not in the graph",
            vhost.hostname, tls.secret.namespace, tls.secret.name
        ))
    })?;

    let context = DownstreamTlsContext {
        common_tls_context: Some(CommonTlsContext {
            tls_params: Some(TlsParameters {
                tls_minimum_protocol_version: tls_protocol(tls.min_version) as i32,
                tls_maximum_protocol_version: tls.max_version.map(tls_protocol).unwrap_or(TlsProtocol::TlSv13) as i32,
                cipher_suites: params.tls.cipher_suites(),
                ..Default::default()
            }),
            tls_certificate_sds_secret_configs: vec![SdsSecretConfig {
                name: secret.name.clone(),
                sds_config: Some(ads_config_source()),
            }],
            alpn_protocols: alpn_protocols(&params.default_http_versions),
            ..Default::default()
        }),
        ..Default::default()
    };

    // The catch-all host owns the chain matching any (or no) SNI.
    let server_names = if vhost.hostname == WILDCARD_HOST { Vec::new() } else { vec![vhost.hostname.clone()] };
    let route_config = secure_route_config_name(listener, &vhost.hostname);
    Ok(FilterChain {
        filter_chain_match: Some(FilterChainMatch { server_names, ..Default::default() }),
        filters: vec![http_connection_manager(&route_config, &listener.name, params)],
        transport_socket: Some(TransportSocket {
            name: TLS_TRANSPORT_SOCKET_NAME.to_string(),
            config_type: Some(TransportSocketConfigType::TypedConfig(any_from_message(
                DOWNSTREAM_TLS_CONTEXT_TYPE_URL,
                &context,
            ))),
        }),
        ..Default::default()
    })
}

fn http_connection_manager(route_config_name: &str, stat_prefix: &str, params: &Parameters) -> Filter {
    let timeouts = &params.timeouts;
    let hcm = HttpConnectionManager {
        codec_type: codec_type(&params.default_http_versions) as i32,
        stat_prefix: stat_prefix.to_string(),
        route_specifier: Some(RouteSpecifier::Rds(Rds {
            route_config_name: route_config_name.to_string(),
            config_source: Some(ads_config_source()),
        })),
        http_filters: http_filters(),
        use_remote_address: Some(BoolValue { value: true }),
        xff_num_trusted_hops: params.network.num_trusted_hops,
        normalize_path: Some(BoolValue { value: true }),
        request_timeout: timeouts.request().to_proto(),
        stream_idle_timeout: timeouts.stream_idle().to_proto(),
        common_http_protocol_options: Some(HttpProtocolOptions {
            idle_timeout: timeouts.connection_idle().to_proto(),
            max_connection_duration: timeouts.max_connection_duration().to_proto(),
            ..Default::default()
        }),
        ..Default::default()
    };
    Filter {
        name: HTTP_CONNECTION_MANAGER_FILTER_NAME.to_string(),
        config_type: Some(FilterConfigType::TypedConfig(any_from_message(HTTP_CONNECTION_MANAGER_TYPE_URL, &hcm))),
    }
}

/// Local rate limiting, inert unless a route carries its own bucket, then
/// the router.
fn http_filters() -> Vec<HttpFilter> {
    let local_rate_limit = LocalRateLimit { stat_prefix: "http".to_string(), ..Default::default() };
    vec![
        HttpFilter {
            name: LOCAL_RATE_LIMIT_FILTER_NAME.to_string(),
            config_type: Some(HttpFilterConfigType::TypedConfig(any_from_message(
                LOCAL_RATE_LIMIT_TYPE_URL,
                &local_rate_limit,
            ))),
            ..Default::default()
        },
        HttpFilter {
            name: ROUTER_FILTER_NAME.to_string(),
            config_type: Some(HttpFilterConfigType::TypedConfig(any_from_message(ROUTER_TYPE_URL, &Router::default()))),
            ..Default::default()
        },
    ]
}

fn codec_type(versions: &[HttpVersion]) -> CodecType {
    let http1 = versions.contains(&HttpVersion::Http1);
    let http2 = versions.contains(&HttpVersion::Http2);
    match (http1, http2) {
        (true, false) => CodecType::Http1,
        (false, true) => CodecType::Http2,
        _ => CodecType::Auto,
    }
}

fn alpn_protocols(versions: &[HttpVersion]) -> Vec<String> {
    match codec_type(versions) {
        CodecType::Http1 => vec!["http/1.1".to_string()],
        CodecType::Http2 => vec!["h2".to_string()],
        _ => vec!["h2".to_string(), "http/1.1".to_string()],
    }
}

fn tls_protocol(version: TlsVersion) -> TlsProtocol {
    match version {
        TlsVersion::V1_2 => TlsProtocol::TlSv12,
        TlsVersion::V1_3 => TlsProtocol::TlSv13,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::{ListenerOrigin, Secret, SecretData, SecretKey, SecretKind, VirtualHostTls};
    use prost::Message;

    fn decode_hcm(filter: &Filter) -> HttpConnectionManager {
        let Some(FilterConfigType::TypedConfig(any)) = &filter.config_type else { panic!("expected typed config") };
        HttpConnectionManager::decode(any.value.as_slice()).expect("decode hcm")
    }

    fn rds_name(hcm: &HttpConnectionManager) -> &str {
        match &hcm.route_specifier {
            Some(RouteSpecifier::Rds(rds)) => &rds.route_config_name,
            other => panic!("expected RDS, got {other:?}"),
        }
    }

    #[test]
    fn test_http_listener() {
        let listener = DagListener {
            name: "ingress_http".into(),
            address: "0.0.0.0".into(),
            port: 8080,
            protocol: ListenerProtocol::Http,
            origin: ListenerOrigin::Default,
            virtual_hosts: Vec::new(),
        };
        let mut params = Parameters::defaults();
        params.network.num_trusted_hops = 2;
        params.listener.connection_balancer = "exact".into();
        let built = build_listener(&listener, &Dag::default(), &params).unwrap();

        assert_eq!(built.filter_chains.len(), 1);
        assert!(built.connection_balance_config.is_some());
        let hcm = decode_hcm(&built.filter_chains[0].filters[0]);
        assert_eq!(rds_name(&hcm), "ingress_http");
        assert_eq!(hcm.xff_num_trusted_hops, 2);
        let names: Vec<_> = hcm.http_filters.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec![LOCAL_RATE_LIMIT_FILTER_NAME, ROUTER_FILTER_NAME]);
    }

    #[test]
    fn test_https_listener_has_a_chain_per_host() {
        let key = SecretKey { namespace: "default".into(), name: "tls".into(), kind: SecretKind::Tls };
        let secret = Secret::new(key.clone(), SecretData::Tls { cert_chain: b"c".to_vec(), private_key: b"k".to_vec() });
        let mut dag = Dag::default();
        dag.secrets.insert(key.clone(), secret.clone());

        let vhost = |host: &str| VirtualHost {
            hostname: host.into(),
            tls: Some(VirtualHostTls { secret: key.clone(), min_version: TlsVersion::V1_3, max_version: None }),
            routes: Vec::new(),
        };
        let listener = DagListener {
            name: "ingress_https".into(),
            address: "0.0.0.0".into(),
            port: 8443,
            protocol: ListenerProtocol::Https,
            origin: ListenerOrigin::Default,
            virtual_hosts: vec![vhost("a.example.com"), vhost("b.example.com")],
        };
        let built = build_listener(&listener, &dag, &Parameters::defaults()).unwrap();
        assert_eq!(built.filter_chains.len(), 2);

        let chain = &built.filter_chains[1];
        assert_eq!(chain.filter_chain_match.as_ref().unwrap().server_names, vec!["b.example.com".to_string()]);
        assert_eq!(rds_name(&decode_hcm(&chain.filters[0])), "https/b.example.com");

        let Some(TransportSocketConfigType::TypedConfig(any)) = &chain.transport_socket.as_ref().unwrap().config_type
        else {
            panic!("expected tls transport socket")
        };
        let context = DownstreamTlsContext::decode(any.value.as_slice()).unwrap();
        let common = context.common_tls_context.unwrap();
        assert_eq!(common.tls_certificate_sds_secret_configs[0].name, secret.name);
        assert_eq!(common.tls_params.unwrap().tls_minimum_protocol_version, TlsProtocol::TlSv13 as i32);

        let catch_all = DagListener {
            name: "https-443".into(),
            origin: ListenerOrigin::Gateway,
            virtual_hosts: vec![vhost(WILDCARD_HOST), vhost("a.example.com")],
            ..listener
        };
        let built = build_listener(&catch_all, &dag, &Parameters::defaults()).unwrap();
        assert!(built.filter_chains[0].filter_chain_match.as_ref().unwrap().server_names.is_empty());
        assert_eq!(built.filter_chains[1].filter_chain_match.as_ref().unwrap().server_names, vec!["a.example.com"]);
    }

    #[test]
    fn test_codec_follows_http_versions() {
        assert_eq!(codec_type(&[]), CodecType::Auto);
        assert_eq!(codec_type(&[HttpVersion::Http1]), CodecType::Http1);
        assert_eq!(codec_type(&[HttpVersion::Http2]), CodecType::Http2);
        assert_eq!(codec_type(&[HttpVersion::Http2, HttpVersion::Http1]), CodecType::Auto);
        assert_eq!(alpn_protocols(&[HttpVersion::Http2]), vec!["h2".to_string()]);
    }
}
