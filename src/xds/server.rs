//! gRPC discovery services.
//!
//! One [`DiscoveryServer`] backs the aggregated service and the five
//! single-type services. Every state-of-the-world stream is handed to
//! [`spawn_stream`]; incremental (delta) streams are not served.

use std::pin::Pin;
use std::sync::Arc;

use envoy_types::pb::envoy::service::cluster::v3::cluster_discovery_service_server::{
    ClusterDiscoveryService, ClusterDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::discovery::v3::{
    aggregated_discovery_service_server::{AggregatedDiscoveryService, AggregatedDiscoveryServiceServer},
    DeltaDiscoveryRequest, DeltaDiscoveryResponse, DiscoveryRequest, DiscoveryResponse,
};
use envoy_types::pb::envoy::service::endpoint::v3::endpoint_discovery_service_server::{
    EndpointDiscoveryService, EndpointDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::listener::v3::listener_discovery_service_server::{
    ListenerDiscoveryService, ListenerDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::route::v3::route_discovery_service_server::{
    RouteDiscoveryService, RouteDiscoveryServiceServer,
};
use envoy_types::pb::envoy::service::secret::v3::secret_discovery_service_server::{
    SecretDiscoveryService, SecretDiscoveryServiceServer,
};
use tokio_stream::Stream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};

use super::cache::SnapshotCache;
use super::resources::ResourceType;
use super::stream::{build_response, spawn_stream, ResponseStream};
use crate::errors::Error;

type DeltaStream = Pin<Box<dyn Stream<Item = std::result::Result<DeltaDiscoveryResponse, Status>> + Send>>;

fn delta_unimplemented() -> Status {
    Status::unimplemented("incremental xDS is not supported; use state-of-the-world streams")
}

/// Serves discovery requests from a [`SnapshotCache`].
#[derive(Debug, Clone)]
pub struct DiscoveryServer {
    cache: Arc<SnapshotCache>,
    stream_buffer: usize,
}

impl DiscoveryServer {
    pub fn new(cache: Arc<SnapshotCache>, stream_buffer: usize) -> Self {
        Self { cache, stream_buffer }
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> {
        &self.cache
    }

    fn open_stream(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
        fixed_type: Option<ResourceType>,
        label: &'static str,
    ) -> Response<ResponseStream> {
        info!(stream = label, remote_addr = ?request.remote_addr(), "New discovery stream connection established");
        Response::new(spawn_stream(self.cache.clone(), request.into_inner(), fixed_type, self.stream_buffer, label))
    }

    /// Unary fetch: the current resources of one type, no ACK bookkeeping.
    fn fetch(&self, request: DiscoveryRequest, resource_type: ResourceType) -> Result<DiscoveryResponse, Status> {
        if !request.type_url.is_empty() && request.type_url != resource_type.type_url() {
            return Err(Error::xds(format!(
                "type_url {} does not match the {} service",
                request.type_url, resource_type
            ))
            .into());
        }
        let snapshot = self.cache.snapshot();
        if !snapshot.is_published(resource_type) {
            return Err(Status::unavailable("no configuration has been published yet"));
        }
        let response = build_response(resource_type, &snapshot, &request.resource_names);
        debug!(
            type_url = %resource_type,
            version = %response.version_info,
            resources = response.resources.len(),
            "Answered discovery fetch"
        );
        Ok(response)
    }

    pub fn ads_service(&self) -> AggregatedDiscoveryServiceServer<Self> {
        AggregatedDiscoveryServiceServer::new(self.clone())
    }

    pub fn cds_service(&self) -> ClusterDiscoveryServiceServer<Self> {
        ClusterDiscoveryServiceServer::new(self.clone())
    }

    pub fn eds_service(&self) -> EndpointDiscoveryServiceServer<Self> {
        EndpointDiscoveryServiceServer::new(self.clone())
    }

    pub fn lds_service(&self) -> ListenerDiscoveryServiceServer<Self> {
        ListenerDiscoveryServiceServer::new(self.clone())
    }

    pub fn rds_service(&self) -> RouteDiscoveryServiceServer<Self> {
        RouteDiscoveryServiceServer::new(self.clone())
    }

    pub fn sds_service(&self) -> SecretDiscoveryServiceServer<Self> {
        SecretDiscoveryServiceServer::new(self.clone())
    }
}

#[tonic::async_trait]
impl AggregatedDiscoveryService for DiscoveryServer {
    type StreamAggregatedResourcesStream = ResponseStream;
    type DeltaAggregatedResourcesStream = DeltaStream;

    async fn stream_aggregated_resources(
        &self,
        request: Request<Streaming<DiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::StreamAggregatedResourcesStream>, Status> {
        Ok(self.open_stream(request, None, "ADS"))
    }

    async fn delta_aggregated_resources(
        &self,
        _request: Request<Streaming<DeltaDiscoveryRequest>>,
    ) -> std::result::Result<Response<Self::DeltaAggregatedResourcesStream>, Status> {
        Err(delta_unimplemented())
    }
}

/// Implements one single-type discovery service on [`DiscoveryServer`].
macro_rules! single_type_service {
    (
        $service:ident, $resource_type:expr, $label:literal,
        $stream_fn:ident: $stream_ty:ident,
        $delta_fn:ident: $delta_ty:ident,
        $fetch_fn:ident
    ) => {
        #[tonic::async_trait]
        impl $service for DiscoveryServer {
            type $stream_ty = ResponseStream;
            type $delta_ty = DeltaStream;

            async fn $stream_fn(
                &self,
                request: Request<Streaming<DiscoveryRequest>>,
            ) -> std::result::Result<Response<Self::$stream_ty>, Status> {
                Ok(self.open_stream(request, Some($resource_type), $label))
            }

            async fn $delta_fn(
                &self,
                _request: Request<Streaming<DeltaDiscoveryRequest>>,
            ) -> std::result::Result<Response<Self::$delta_ty>, Status> {
                Err(delta_unimplemented())
            }

            async fn $fetch_fn(
                &self,
                request: Request<DiscoveryRequest>,
            ) -> std::result::Result<Response<DiscoveryResponse>, Status> {
                self.fetch(request.into_inner(), $resource_type).map(Response::new)
            }
        }
    };
}

single_type_service!(
    ClusterDiscoveryService, ResourceType::Cluster, "CDS",
    stream_clusters: StreamClustersStream,
    delta_clusters: DeltaClustersStream,
    fetch_clusters
);

single_type_service!(
    EndpointDiscoveryService, ResourceType::Endpoint, "EDS",
    stream_endpoints: StreamEndpointsStream,
    delta_endpoints: DeltaEndpointsStream,
    fetch_endpoints
);

single_type_service!(
    ListenerDiscoveryService, ResourceType::Listener, "LDS",
    stream_listeners: StreamListenersStream,
    delta_listeners: DeltaListenersStream,
    fetch_listeners
);

single_type_service!(
    RouteDiscoveryService, ResourceType::Route, "RDS",
    stream_routes: StreamRoutesStream,
    delta_routes: DeltaRoutesStream,
    fetch_routes
);

single_type_service!(
    SecretDiscoveryService, ResourceType::Secret, "SDS",
    stream_secrets: StreamSecretsStream,
    delta_secrets: DeltaSecretsStream,
    fetch_secrets
);
