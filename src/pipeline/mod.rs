//! # Rebuild pipeline
//!
//! Store change → holdoff → build → translate → snapshot swap → status sink.
//!
//! A single task drives the pipeline, so at most one build is in flight.
//! Change notifications arrive on a `watch` channel of store revisions, so a
//! burst of changes seen during a build collapses into one follow-up build
//! that reads the latest state.

use std::future::Future;
use std::sync::Arc;

use arc_swap::ArcSwap;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{Parameters, PipelineConfig};
use crate::dag::{Builder, Dag};
use crate::errors::{Error, Result};
use crate::status::StatusSink;
use crate::store::ResourceStore;
use crate::xds::{EndpointIndex, SnapshotCache, Translator};

/// Result of one successful rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RebuildSummary {
    pub store_revision: u64,
    pub snapshot_version: u64,
    pub routes: usize,
    pub invalid_objects: usize,
}

pub struct Pipeline {
    store: Arc<dyn ResourceStore>,
    builder: Arc<Builder>,
    translator: Translator,
    cache: Arc<SnapshotCache>,
    status: Arc<dyn StatusSink>,
    dag: ArcSwap<Dag>,
    config: PipelineConfig,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("revision", &self.dag.load().revision)
            .field("config", &self.config)
            .finish()
    }
}

impl Pipeline {
    pub fn new(
        params: Arc<Parameters>,
        store: Arc<dyn ResourceStore>,
        cache: Arc<SnapshotCache>,
        status: Arc<dyn StatusSink>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            builder: Arc::new(Builder::new(params.clone())),
            translator: Translator::new(params),
            cache,
            status,
            dag: ArcSwap::from_pointee(Dag::default()),
            config,
        }
    }

    /// The graph behind the current snapshot.
    pub fn dag(&self) -> Arc<Dag> {
        self.dag.load_full()
    }

    /// Build from the current store contents and publish.
    ///
    /// When translation fails nothing is published and the previous snapshot
    /// keeps being served.
    pub async fn rebuild(&self) -> Result<RebuildSummary> {
        let snapshot = self.store.snapshot();
        let store_revision = snapshot.revision();
        let builder = self.builder.clone();
        let translator = self.translator.clone();

        let (output, translated) = tokio::task::spawn_blocking(move || {
            let output = builder.build(&snapshot);
            let endpoints = EndpointIndex::from_snapshot(&snapshot);
            let translated = translator.translate(&output.dag, &endpoints);
            (output, translated)
        })
        .await
        .map_err(|e| Error::internal(format!("Build task failed: {}", e)))?;

        let sets = translated?;
        let routes = output.dag.route_count();
        let invalid_objects = output
            .statuses
            .iter()
            .filter(|u| u.outcome.validity == crate::dag::status::Validity::Invalid)
            .count();

        self.dag.store(Arc::new(output.dag));
        let snapshot_version = self.cache.set_snapshot(sets);

        if let Err(e) = self.status.publish(output.statuses).await {
            warn!(error = %e, store_revision, "Failed to publish status updates");
        }

        info!(store_revision, snapshot_version, routes, invalid_objects, "Rebuild complete");
        Ok(RebuildSummary { store_revision, snapshot_version, routes, invalid_objects })
    }

    async fn rebuild_logged(&self) {
        match self.rebuild().await {
            Ok(_) => {}
            Err(e) if e.is_fatal() => {
                error!(error = %e, "Rebuild failed; keeping the previous snapshot")
            }
            Err(e) => warn!(error = %e, "Rebuild failed; keeping the previous snapshot"),
        }
    }

    /// Rebuild once, then after every store change until `shutdown` fires or
    /// the store goes away.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()> + Send,
    {
        let mut changes = self.store.subscribe();
        changes.borrow_and_update();
        self.rebuild_logged().await;

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Rebuild pipeline shutting down");
                    return;
                }
                changed = changes.changed() => {
                    if changed.is_err() {
                        info!("Resource store closed; stopping rebuild pipeline");
                        return;
                    }
                }
            }

            let store_closed = self.holdoff(&mut changes).await;
            let revision = *changes.borrow_and_update();
            debug!(revision, "Rebuilding after store change");
            self.rebuild_logged().await;
            if store_closed {
                info!("Resource store closed; stopping rebuild pipeline");
                return;
            }
        }
    }

    /// Wait for a quiet period of `holdoff_delay`, but no longer than
    /// `holdoff_max_delay` in total. Returns true when the store closed.
    async fn holdoff(&self, changes: &mut tokio::sync::watch::Receiver<u64>) -> bool {
        let delay = self.config.holdoff_delay();
        if delay.is_zero() {
            return false;
        }
        let deadline = Instant::now() + self.config.holdoff_max_delay().max(delay);
        loop {
            let quiet_until = (Instant::now() + delay).min(deadline);
            match tokio::time::timeout_at(quiet_until, changes.changed()).await {
                Err(_) => return false,
                Ok(Err(_)) => return true,
                Ok(Ok(())) if Instant::now() >= deadline => return false,
                Ok(Ok(())) => {
                    debug!(revision = *changes.borrow(), "Store changed during holdoff");
                }
            }
        }
    }
}

/// Holdoff settings that build immediately, for tests and one-shot runs.
pub fn immediate() -> PipelineConfig {
    PipelineConfig { holdoff_delay_ms: 0, holdoff_max_delay_ms: 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{ChannelStatusSink, LoggingStatusSink};
    use crate::store::{parse_manifests, InMemoryStore};
    use crate::xds::ResourceType;

    const APP: &str = r#"
kind: Service
metadata:
  name: web
  namespace: default
spec:
  ports:
  - name: http
    port: 80
---
kind: Ingress
apiVersion: networking.k8s.io/v1
metadata:
  name: web
  namespace: default
spec:
  rules:
  - host: web.example.com
    http:
      paths:
      - path: /
        pathType: Prefix
        backend:
          service:
            name: web
            port:
              number: 80
"#;

    fn pipeline(store: Arc<InMemoryStore>, cache: Arc<SnapshotCache>) -> Pipeline {
        Pipeline::new(
            Arc::new(Parameters::defaults()),
            store,
            cache,
            Arc::new(LoggingStatusSink),
            immediate(),
        )
    }

    #[tokio::test]
    async fn test_rebuild_publishes_snapshot_and_dag() {
        let store = Arc::new(InMemoryStore::new());
        store.apply_all(parse_manifests(APP).unwrap());
        let cache = Arc::new(SnapshotCache::new());
        let pipeline = pipeline(store, cache.clone());

        let summary = pipeline.rebuild().await.unwrap();
        assert_eq!(summary.snapshot_version, 1);
        assert_eq!(summary.routes, 1);
        assert_eq!(summary.invalid_objects, 0);

        let snapshot = cache.snapshot();
        assert_eq!(snapshot.resources(ResourceType::Cluster).len(), 1);
        assert!(snapshot.resources(ResourceType::Listener).contains_key("ingress_http"));
        assert_eq!(pipeline.dag().revision, summary.store_revision);
    }

    #[tokio::test]
    async fn test_statuses_reach_the_sink() {
        let store = Arc::new(InMemoryStore::new());
        store.apply_all(parse_manifests(APP).unwrap());
        let (sink, mut rx) = ChannelStatusSink::new(4);
        let pipeline = Pipeline::new(
            Arc::new(Parameters::defaults()),
            store,
            Arc::new(SnapshotCache::new()),
            Arc::new(sink),
            immediate(),
        );
        pipeline.rebuild().await.unwrap();
        let updates = rx.recv().await.unwrap();
        assert!(updates.iter().any(|u| u.key.name == "web"));
    }

    #[tokio::test]
    async fn test_run_rebuilds_after_store_change() {
        let store = Arc::new(InMemoryStore::new());
        let cache = Arc::new(SnapshotCache::new());
        let pipeline = pipeline(store.clone(), cache.clone());
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(pipeline.run(async {
            let _ = stop_rx.await;
        }));

        let initial = cache.watch(ResourceType::Listener, "").await;
        assert_eq!(initial.version(), 1);

        store.apply_all(parse_manifests(APP).unwrap());
        let updated = cache.watch(ResourceType::Cluster, &initial.version_info(ResourceType::Cluster)).await;
        assert_eq!(updated.resources(ResourceType::Cluster).len(), 1);

        stop_tx.send(()).unwrap();
        task.await.unwrap();
    }
}
