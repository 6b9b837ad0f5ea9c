//! Discovery stream protocol: ACK/NACK handling, resource filtering, stream
//! teardown and snapshot atomicity, driven through in-process channels.

mod common;

use std::sync::Arc;
use std::time::Duration;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::service::discovery::v3::{DiscoveryRequest, DiscoveryResponse};
use envoy_types::pb::google::rpc::Status as RpcStatus;
use gateplane::xds::resources::{any_from_message, CLUSTER_TYPE_URL, ENDPOINT_TYPE_URL};
use gateplane::xds::stream::run_stream;
use gateplane::xds::{ResourceSets, ResourceType, SnapshotCache};
use prost::Message;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tonic::Status;

const QUIET: Duration = Duration::from_millis(100);

struct Client {
    requests: mpsc::Sender<Result<DiscoveryRequest, Status>>,
    responses: mpsc::Receiver<Result<DiscoveryResponse, Status>>,
    task: JoinHandle<()>,
}

impl Client {
    fn connect(cache: &Arc<SnapshotCache>, fixed_type: Option<ResourceType>) -> Self {
        let (requests, request_rx) = mpsc::channel(16);
        let (response_tx, responses) = mpsc::channel(16);
        let task = tokio::spawn(run_stream(
            cache.clone(),
            ReceiverStream::new(request_rx),
            response_tx,
            fixed_type,
            "test",
        ));
        Self { requests, responses, task }
    }

    async fn send(&self, request: DiscoveryRequest) {
        self.requests.send(Ok(request)).await.unwrap();
    }

    async fn recv(&mut self) -> DiscoveryResponse {
        timeout(Duration::from_secs(5), self.responses.recv())
            .await
            .expect("response within timeout")
            .expect("stream open")
            .expect("ok response")
    }

    async fn assert_silent(&mut self) {
        assert!(timeout(QUIET, self.responses.recv()).await.is_err(), "unexpected response");
    }
}

fn clusters(names: &[&str]) -> ResourceSets {
    let mut sets = ResourceSets::new();
    for name in names {
        let cluster = Cluster { name: name.to_string(), ..Default::default() };
        sets.insert(ResourceType::Cluster, *name, any_from_message(CLUSTER_TYPE_URL, &cluster));
    }
    sets
}

fn cluster_names(response: &DiscoveryResponse) -> Vec<String> {
    response
        .resources
        .iter()
        .map(|any| Cluster::decode(any.value.as_slice()).unwrap().name)
        .collect()
}

async fn wait_for_pending(cache: &SnapshotCache, expected: usize) {
    timeout(Duration::from_secs(5), async {
        while cache.pending_watches() != expected {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("pending watches settle");
}

#[tokio::test]
async fn test_ack_then_push_on_change() {
    let cache = Arc::new(SnapshotCache::new());
    cache.set_snapshot(clusters(&["a"]));
    let mut client = Client::connect(&cache, None);

    client.send(common::request(CLUSTER_TYPE_URL, "", "", &[])).await;
    let first = client.recv().await;
    assert_eq!(first.version_info, "1");
    assert_eq!(first.type_url, CLUSTER_TYPE_URL);
    assert_eq!(cluster_names(&first), vec!["a"]);

    client.send(common::request(CLUSTER_TYPE_URL, "1", &first.nonce, &[])).await;
    client.assert_silent().await;

    cache.set_snapshot(clusters(&["a", "b"]));
    let second = client.recv().await;
    assert_eq!(second.version_info, "2");
    assert_ne!(second.nonce, first.nonce);
    assert_eq!(cluster_names(&second), vec!["a", "b"]);
}

#[tokio::test]
async fn test_nack_is_not_retransmitted() {
    let cache = Arc::new(SnapshotCache::new());
    cache.set_snapshot(clusters(&["a"]));
    let mut client = Client::connect(&cache, None);

    client.send(common::request(CLUSTER_TYPE_URL, "", "", &[])).await;
    let first = client.recv().await;
    client.send(common::request(CLUSTER_TYPE_URL, "1", &first.nonce, &[])).await;

    cache.set_snapshot(clusters(&["bad"]));
    let rejected = client.recv().await;
    assert_eq!(rejected.version_info, "2");

    let mut nack = common::request(CLUSTER_TYPE_URL, "1", &rejected.nonce, &[]);
    nack.error_detail = Some(RpcStatus { code: 3, message: "cluster bad is invalid".into(), ..Default::default() });
    client.send(nack).await;
    client.assert_silent().await;

    // Publishing the same clusters again does not move the type version.
    cache.set_snapshot(clusters(&["bad"]));
    client.assert_silent().await;

    cache.set_snapshot(clusters(&["fixed"]));
    let fixed = client.recv().await;
    assert_eq!(fixed.version_info, "4");
    assert_eq!(cluster_names(&fixed), vec!["fixed"]);
}

#[tokio::test]
async fn test_stale_nonce_is_ignored() {
    let cache = Arc::new(SnapshotCache::new());
    cache.set_snapshot(clusters(&["a"]));
    let mut client = Client::connect(&cache, None);

    client.send(common::request(CLUSTER_TYPE_URL, "", "", &[])).await;
    let first = client.recv().await;
    client.send(common::request(CLUSTER_TYPE_URL, "0", "not-a-nonce", &[])).await;
    client.assert_silent().await;

    // The real ACK still works afterwards.
    client.send(common::request(CLUSTER_TYPE_URL, "1", &first.nonce, &[])).await;
    cache.set_snapshot(clusters(&["b"]));
    assert_eq!(client.recv().await.version_info, "2");
}

#[tokio::test]
async fn test_endpoint_requests_are_filtered_by_name() {
    let cache = Arc::new(SnapshotCache::new());
    let mut sets = ResourceSets::new();
    for name in ["default/a/http", "default/b/http"] {
        let assignment = ClusterLoadAssignment { cluster_name: name.to_string(), ..Default::default() };
        sets.insert(ResourceType::Endpoint, name, any_from_message(ENDPOINT_TYPE_URL, &assignment));
    }
    cache.set_snapshot(sets);

    let mut client = Client::connect(&cache, Some(ResourceType::Endpoint));
    // Single-type streams may leave type_url empty.
    client.send(common::request("", "", "", &["default/b/http"])).await;
    let response = client.recv().await;
    assert_eq!(response.resources.len(), 1);
    let assignment = ClusterLoadAssignment::decode(response.resources[0].value.as_slice()).unwrap();
    assert_eq!(assignment.cluster_name, "default/b/http");

    // Widening the subscription refetches with the same version.
    client.send(common::request("", "1", &response.nonce, &["default/a/http", "default/b/http"])).await;
    let widened = client.recv().await;
    assert_eq!(widened.version_info, "1");
    assert_eq!(widened.resources.len(), 2);
}

#[tokio::test]
async fn test_unpublished_type_waits_for_first_snapshot() {
    let cache = Arc::new(SnapshotCache::new());
    let mut client = Client::connect(&cache, None);
    client.send(common::request(CLUSTER_TYPE_URL, "", "", &[])).await;
    wait_for_pending(&cache, 1).await;
    client.assert_silent().await;

    cache.set_snapshot(clusters(&["a"]));
    assert_eq!(client.recv().await.version_info, "1");
}

#[tokio::test]
async fn test_disconnect_aborts_watches() {
    let cache = Arc::new(SnapshotCache::new());
    cache.set_snapshot(clusters(&["a"]));
    let mut client = Client::connect(&cache, None);

    client.send(common::request(CLUSTER_TYPE_URL, "", "", &[])).await;
    let first = client.recv().await;
    client.send(common::request(CLUSTER_TYPE_URL, "1", &first.nonce, &[])).await;
    wait_for_pending(&cache, 1).await;

    let Client { requests, task, .. } = client;
    drop(requests);
    timeout(Duration::from_secs(5), task).await.expect("stream loop exits").unwrap();
    wait_for_pending(&cache, 0).await;
}

#[tokio::test]
async fn test_dropped_receiver_ends_stream() {
    let cache = Arc::new(SnapshotCache::new());
    let client = Client::connect(&cache, None);
    client.send(common::request(CLUSTER_TYPE_URL, "", "", &[])).await;
    wait_for_pending(&cache, 1).await;

    let Client { requests, responses, task } = client;
    drop(responses);
    timeout(Duration::from_secs(5), task).await.expect("stream loop exits").unwrap();
    drop(requests);
    wait_for_pending(&cache, 0).await;
}

#[tokio::test]
async fn test_each_response_comes_from_one_snapshot() {
    let cache = Arc::new(SnapshotCache::new());
    cache.set_snapshot(clusters(&["0-a", "0-b", "0-c"]));
    let mut client = Client::connect(&cache, None);

    let publisher = {
        let cache = cache.clone();
        tokio::spawn(async move {
            for generation in 1..=50 {
                let names: Vec<String> = ["a", "b", "c"].iter().map(|s| format!("{generation}-{s}")).collect();
                let refs: Vec<&str> = names.iter().map(String::as_str).collect();
                cache.set_snapshot(clusters(&refs));
                tokio::task::yield_now().await;
            }
        })
    };

    let mut request = common::request(CLUSTER_TYPE_URL, "", "", &[]);
    loop {
        client.send(request).await;
        let response = client.recv().await;
        let names = cluster_names(&response);
        assert_eq!(names.len(), 3);
        let generation = names[0].split('-').next().unwrap().to_string();
        assert!(names.iter().all(|n| n.starts_with(&format!("{generation}-"))), "mixed snapshot: {names:?}");
        if generation == "50" {
            break;
        }
        request = common::request(CLUSTER_TYPE_URL, &response.version_info, &response.nonce, &[]);
    }
    publisher.await.unwrap();
}
