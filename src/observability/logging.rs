//! # Structured Logging
//!
//! Span macros and startup logging built on the tracing ecosystem.

/// Create a tracing span for a DAG rebuild.
#[macro_export]
macro_rules! build_span {
    ($revision:expr) => {
        tracing::info_span!(
            "dag_build",
            revision = %$revision,
            build_id = %uuid::Uuid::new_v4()
        )
    };
    ($revision:expr, $($field:tt)*) => {
        tracing::info_span!(
            "dag_build",
            revision = %$revision,
            build_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Create a tracing span for xDS operations
#[macro_export]
macro_rules! xds_span {
    ($operation:expr, $node_id:expr) => {
        tracing::info_span!(
            "xds_operation",
            operation = %$operation,
            node_id = %$node_id,
            operation_id = %uuid::Uuid::new_v4()
        )
    };
    ($operation:expr, $node_id:expr, $($field:tt)*) => {
        tracing::info_span!(
            "xds_operation",
            operation = %$operation,
            node_id = %$node_id,
            operation_id = %uuid::Uuid::new_v4(),
            $($field)*
        )
    };
}

/// Log configuration at startup
pub fn log_config_info(config: &crate::config::ControlPlaneConfig, params: &crate::config::Parameters) {
    tracing::info!(
        xds_address = %config.xds.bind_address(),
        holdoff_delay_ms = config.pipeline.holdoff_delay_ms,
        holdoff_max_delay_ms = config.pipeline.holdoff_max_delay_ms,
        http_listener = %params.listener.http.name,
        https_listener = %params.listener.https.name,
        ingress_class = ?params.ingress.class_name,
        gateway_controller = %params.gateway.controller_name,
        external_name_services = params.enable_external_name_service,
        "gateplane control plane configuration"
    );
}
