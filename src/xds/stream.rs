//! State-of-the-world discovery stream loop.
//!
//! One loop runs per connected client. For every resource type the client
//! subscribes to it keeps a small state machine:
//!
//! - **Idle**: no response outstanding; a watch task waits on the cache.
//! - **AwaitingAck**: a response was sent; the next request carrying its
//!   nonce is the client's ACK or NACK.
//!
//! Requests carrying any other nonce are stale and ignored. A NACK is logged
//! and re-arms the watch on the rejected version, so the same version is
//! never resent and the next publication goes out as usual. When the stream
//! ends every watch task is aborted.

use std::collections::BTreeMap;
use std::sync::Arc;

use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tonic::Status;
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

use super::cache::{Snapshot, SnapshotCache};
use super::resources::ResourceType;
use crate::xds_span;

pub type ResponseStream = ReceiverStream<Result<DiscoveryResponse, Status>>;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    Idle,
    AwaitingAck { nonce: Arc<str>, version: Arc<str> },
}

/// Tracks the last sent version and nonce of one type on one stream.
#[derive(Debug)]
struct TypeState {
    phase: Phase,
    /// Version of the last response the client acknowledged or rejected.
    last_version: Arc<str>,
    last_nonce: Option<Arc<str>>,
    names: Vec<String>,
    watch: Option<JoinHandle<()>>,
}

impl TypeState {
    fn new() -> Self {
        Self { phase: Phase::Idle, last_version: Arc::from(""), last_nonce: None, names: Vec::new(), watch: None }
    }

    fn abort_watch(&mut self) {
        if let Some(handle) = self.watch.take() {
            handle.abort();
        }
    }
}

/// Aborts every outstanding watch when dropped.
struct Watches(BTreeMap<ResourceType, TypeState>);

impl Drop for Watches {
    fn drop(&mut self) {
        for state in self.0.values_mut() {
            state.abort_watch();
        }
    }
}

/// What to do with one request.
#[derive(Debug, PartialEq, Eq)]
enum Decision {
    /// Register a watch for versions other than this one.
    Watch(Arc<str>),
    Ignore,
}

/// Start a stream loop on its own task and return the response stream.
///
/// `fixed_type` is the type of a single-type service (CDS, LDS...); requests
/// on those streams may leave `type_url` empty.
pub fn spawn_stream<S>(
    cache: Arc<SnapshotCache>,
    requests: S,
    fixed_type: Option<ResourceType>,
    buffer: usize,
    label: &'static str,
) -> ResponseStream
where
    S: Stream<Item = Result<DiscoveryRequest, Status>> + Send + Unpin + 'static,
{
    let (tx, rx) = mpsc::channel(buffer.max(1));
    tokio::spawn(run_stream(cache, requests, tx, fixed_type, label));
    ReceiverStream::new(rx)
}

/// The stream loop. Returns when the client goes away.
pub async fn run_stream<S>(
    cache: Arc<SnapshotCache>,
    mut requests: S,
    tx: mpsc::Sender<Result<DiscoveryResponse, Status>>,
    fixed_type: Option<ResourceType>,
    label: &'static str,
) where
    S: Stream<Item = Result<DiscoveryRequest, Status>> + Send + Unpin + 'static,
{
    let (push_tx, mut push_rx) = mpsc::channel::<(ResourceType, Arc<Snapshot>)>(ResourceType::ALL.len());
    let mut watches = Watches(BTreeMap::new());
    let mut node_id = String::new();

    loop {
        tokio::select! {
            request = requests.next() => {
                let request = match request {
                    Some(Ok(request)) => request,
                    Some(Err(status)) => {
                        debug!(stream = label, node_id = %node_id, error = %status, "Discovery stream errored");
                        break;
                    }
                    None => {
                        info!(stream = label, node_id = %node_id, "Discovery stream ended by client");
                        break;
                    }
                };
                if node_id.is_empty() {
                    if let Some(node) = &request.node {
                        node_id = node.id.clone();
                    }
                }

                let resource_type = if request.type_url.is_empty() {
                    fixed_type
                } else {
                    ResourceType::from_type_url(&request.type_url)
                };
                let Some(resource_type) = resource_type.filter(|t| fixed_type.is_none() || fixed_type == Some(*t)) else {
                    warn!(stream = label, node_id = %node_id, type_url = %request.type_url, "Ignoring request for unsupported type");
                    continue;
                };

                let span = xds_span!(label, node_id, type_url = %resource_type);
                let state = watches.0.entry(resource_type).or_insert_with(TypeState::new);
                let decision = span.in_scope(|| handle_request(state, &request));
                if let Decision::Watch(known) = decision {
                    state.abort_watch();
                    let cache = cache.clone();
                    let push_tx = push_tx.clone();
                    state.watch = Some(tokio::spawn(
                        async move {
                            let snapshot = cache.watch(resource_type, &known).await;
                            let _ = push_tx.send((resource_type, snapshot)).await;
                        }
                        .instrument(span),
                    ));
                }
            }
            Some((resource_type, snapshot)) = push_rx.recv() => {
                let Some(state) = watches.0.get_mut(&resource_type) else { continue };
                state.watch = None;
                let response = build_response(resource_type, &snapshot, &state.names);
                info!(
                    stream = label,
                    node_id = %node_id,
                    type_url = %resource_type,
                    version = %response.version_info,
                    nonce = %response.nonce,
                    resources = response.resources.len(),
                    "Sending discovery response"
                );
                state.phase = Phase::AwaitingAck {
                    nonce: Arc::from(response.nonce.as_str()),
                    version: Arc::from(response.version_info.as_str()),
                };
                state.last_nonce = Some(Arc::from(response.nonce.as_str()));
                if tx.send(Ok(response)).await.is_err() {
                    info!(stream = label, node_id = %node_id, "Discovery stream receiver dropped");
                    break;
                }
            }
            _ = tx.closed() => {
                info!(stream = label, node_id = %node_id, "Discovery stream closed");
                break;
            }
        }
    }
    // Watches are aborted when `watches` drops here.
}

/// Advance one type's state machine for a request.
fn handle_request(state: &mut TypeState, request: &DiscoveryRequest) -> Decision {
    // Names are only taken from requests that are acted on; a stale request
    // must not hide a subscription change from the next ACK.
    let names_changed = state.names != request.resource_names;

    match &state.phase {
        Phase::AwaitingAck { nonce, version } if request.response_nonce == nonce.as_ref() => {
            let version = version.clone();
            state.phase = Phase::Idle;
            state.names = request.resource_names.clone();
            match &request.error_detail {
                Some(error) => {
                    warn!(
                        version = %version,
                        nonce = %request.response_nonce,
                        accepted_version = %request.version_info,
                        error_code = error.code,
                        error_message = %error.message,
                        "[NACK] Envoy rejected previous response"
                    );
                    state.last_version = Arc::from(request.version_info.as_str());
                }
                None => {
                    debug!(version = %version, nonce = %request.response_nonce, "[ACK] Envoy accepted response");
                    state.last_version = version.clone();
                }
            }
            if names_changed {
                Decision::Watch(Arc::from(""))
            } else {
                Decision::Watch(version)
            }
        }
        Phase::Idle if state.last_nonce.is_none() => {
            info!(
                version_info = %request.version_info,
                resource_names = request.resource_names.len(),
                "Received discovery request"
            );
            state.names = request.resource_names.clone();
            Decision::Watch(Arc::from(""))
        }
        Phase::Idle if names_changed && state.last_nonce.as_deref() == Some(request.response_nonce.as_str()) => {
            debug!(resource_names = request.resource_names.len(), "Subscription changed");
            state.names = request.resource_names.clone();
            Decision::Watch(Arc::from(""))
        }
        Phase::Idle if state.last_nonce.as_deref() == Some(request.response_nonce.as_str()) => {
            debug!(nonce = %request.response_nonce, "[ACK] Skipping duplicate discovery request");
            Decision::Ignore
        }
        _ => {
            debug!(nonce = %request.response_nonce, "Ignoring discovery request with stale nonce");
            Decision::Ignore
        }
    }
}

/// Response for `resource_type` from `snapshot`, limited to `names` for
/// types clients subscribe to by name.
pub(crate) fn build_response(resource_type: ResourceType, snapshot: &Snapshot, names: &[String]) -> DiscoveryResponse {
    let all = snapshot.resources(resource_type);
    let resources = if resource_type.is_named() && !names.is_empty() {
        all.iter().filter(|(name, _)| names.iter().any(|n| n == *name)).map(|(_, any)| any.clone()).collect()
    } else {
        all.values().cloned().collect()
    };
    DiscoveryResponse {
        version_info: snapshot.version_info(resource_type),
        resources,
        type_url: resource_type.type_url().to_string(),
        nonce: Uuid::new_v4().to_string(),
        ..Default::default()
    }
}
