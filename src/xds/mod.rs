//! Envoy xDS (eXtended Discovery Service) implementation
//!
//! Turns the routing graph into Envoy resources and serves them:
//! - [`translator`]: DAG → clusters, endpoints, listeners, routes and secrets
//! - [`cache`]: versioned snapshots of the translated resources
//! - [`stream`]: the per-client state-of-the-world protocol loop
//! - [`server`]: ADS plus the CDS, EDS, LDS, RDS and SDS gRPC services

pub mod cache;
pub mod cluster;
pub mod endpoint;
pub mod listener;
pub mod resources;
pub mod route;
pub mod secret;
pub mod server;
pub mod stream;
pub mod translator;

pub use cache::{Snapshot, SnapshotCache};
pub use endpoint::EndpointIndex;
pub use resources::{ResourceSets, ResourceType};
pub use server::DiscoveryServer;
pub use translator::Translator;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use tonic::transport::Server;
use tracing::info;

use crate::config::XdsServerConfig;
use crate::{Error, Result};

/// Serve every discovery service from `cache` until `shutdown_signal` fires.
pub async fn start_xds_server<F>(config: &XdsServerConfig, cache: Arc<SnapshotCache>, shutdown_signal: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr: SocketAddr = config
        .bind_address()
        .parse()
        .map_err(|e| Error::config(format!("Invalid xDS address: {}", e)))?;

    let discovery = DiscoveryServer::new(cache, config.stream_buffer);

    info!(address = %addr, stream_buffer = config.stream_buffer, "Starting Envoy xDS server");

    let server = Server::builder()
        .add_service(discovery.ads_service())
        .add_service(discovery.cds_service())
        .add_service(discovery.eds_service())
        .add_service(discovery.lds_service())
        .add_service(discovery.rds_service())
        .add_service(discovery.sds_service())
        .serve_with_shutdown(addr, shutdown_signal);

    info!("xDS server listening on {}", addr);

    server.await.map_err(|e| {
        let error_msg = e.to_string();
        if error_msg.contains("Address already in use") || error_msg.contains("bind") {
            Error::transport(format!(
                "xDS server failed to bind to {}: Port {} is already in use. Please use a different port or stop the existing service.",
                addr,
                addr.port()
            ))
        } else {
            Error::transport(format!("xDS server failed: {}", e))
        }
    })?;

    info!("xDS server stopped");
    Ok(())
}
