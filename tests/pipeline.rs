//! Rebuild pipeline: store changes through to published snapshots and
//! status write-back.

mod common;

use std::sync::Arc;
use std::time::Duration;

use gateplane::config::{Parameters, PipelineConfig};
use gateplane::pipeline::{immediate, Pipeline};
use gateplane::resources::{Kind, ObjectKey};
use gateplane::status::{ChannelStatusSink, LoggingStatusSink, StatusCache};
use gateplane::store::InMemoryStore;
use gateplane::xds::{ResourceType, SnapshotCache};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Instant};

fn app(name: &str) -> String {
    format!(
        "{}{}",
        common::service("default", name, 80),
        common::simple_proxy("default", name, &format!("{name}.example.com"), name)
    )
}

fn spawn_pipeline(
    store: Arc<InMemoryStore>,
    cache: Arc<SnapshotCache>,
    config: PipelineConfig,
) -> (oneshot::Sender<()>, tokio::task::JoinHandle<()>) {
    let status = Arc::new(StatusCache::new(Arc::new(LoggingStatusSink)));
    let pipeline = Pipeline::new(Arc::new(Parameters::defaults()), store, cache, status, config);
    let (stop, stopped) = oneshot::channel::<()>();
    let task = tokio::spawn(pipeline.run(async {
        let _ = stopped.await;
    }));
    (stop, task)
}

#[tokio::test]
async fn test_burst_of_changes_is_one_rebuild() {
    let store = common::store(&app("base"));
    let cache = Arc::new(SnapshotCache::new());
    let config = PipelineConfig { holdoff_delay_ms: 200, holdoff_max_delay_ms: 5000 };
    let (stop, task) = spawn_pipeline(store.clone(), cache.clone(), config);

    let initial = cache.watch(ResourceType::Cluster, "").await;
    assert_eq!(initial.version(), 1);
    assert_eq!(initial.resources(ResourceType::Cluster).len(), 1);

    for index in 0..5 {
        store.apply_all(common::manifests(&app(&format!("app{index}"))));
        sleep(Duration::from_millis(10)).await;
    }

    let rebuilt = timeout(Duration::from_secs(5), cache.watch(ResourceType::Cluster, "1")).await.unwrap();
    assert_eq!(rebuilt.version(), 2);
    assert_eq!(rebuilt.resources(ResourceType::Cluster).len(), 6);

    stop.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_max_delay_bounds_a_continuous_stream_of_changes() {
    let store = common::store(&app("base"));
    let cache = Arc::new(SnapshotCache::new());
    let config = PipelineConfig { holdoff_delay_ms: 100, holdoff_max_delay_ms: 300 };
    let (stop, task) = spawn_pipeline(store.clone(), cache.clone(), config);
    cache.watch(ResourceType::Cluster, "").await;

    let writer = {
        let store = store.clone();
        tokio::spawn(async move {
            let until = Instant::now() + Duration::from_millis(3000);
            let mut index = 0;
            while Instant::now() < until {
                store.apply_all(common::manifests(&app(&format!("churn{index}"))));
                index += 1;
                sleep(Duration::from_millis(20)).await;
            }
        })
    };

    let rebuilt = timeout(Duration::from_millis(2000), cache.watch(ResourceType::Cluster, "1")).await;
    assert!(rebuilt.is_ok(), "no rebuild while changes kept arriving");
    assert!(!writer.is_finished());

    writer.await.unwrap();
    stop.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_deleted_object_disappears_from_snapshot() {
    let store = common::store(&format!("{}{}", app("one"), app("two")));
    let cache = Arc::new(SnapshotCache::new());
    let (stop, task) = spawn_pipeline(store.clone(), cache.clone(), immediate());

    let first = cache.watch(ResourceType::Cluster, "").await;
    assert_eq!(first.resources(ResourceType::Cluster).len(), 2);

    assert!(store.delete(&ObjectKey::new(Kind::HttpProxy, "default", "two")));
    let second = cache.watch(ResourceType::Cluster, &first.version_info(ResourceType::Cluster)).await;
    assert_eq!(second.resources(ResourceType::Cluster).len(), 1);
    // Listeners keep their version when only clusters and routes changed.
    assert_eq!(second.version_info(ResourceType::Listener), first.version_info(ResourceType::Listener));

    stop.send(()).unwrap();
    task.await.unwrap();
}

#[tokio::test]
async fn test_unchanged_statuses_are_written_once() {
    let store = common::store(&app("web"));
    let (sink, mut rx) = ChannelStatusSink::new(8);
    let pipeline = Pipeline::new(
        Arc::new(Parameters::defaults()),
        store.clone(),
        Arc::new(SnapshotCache::new()),
        Arc::new(StatusCache::new(Arc::new(sink))),
        immediate(),
    );

    pipeline.rebuild().await.unwrap();
    let written = rx.recv().await.unwrap();
    assert!(written.iter().any(|u| u.key == ObjectKey::new(Kind::HttpProxy, "default", "web")));

    pipeline.rebuild().await.unwrap();
    assert!(rx.try_recv().is_err());

    store.apply_all(common::manifests(&common::simple_proxy("default", "web", "web.example.com", "missing")));
    pipeline.rebuild().await.unwrap();
    let changed = rx.recv().await.unwrap();
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0].outcome.reason, "ServiceUnresolvedReference");
}
