//! Versioned snapshot cache.
//!
//! A [`Snapshot`] holds every resource type of one publication. The cache
//! swaps snapshots through a `watch` channel, so a writer never waits for
//! readers and a reader always sees one publication in full.
//!
//! Versions: the snapshot version counts publications. Each type carries the
//! snapshot version at which its content last changed, which is what clients
//! see as `version_info`. A type version of `0` means nothing was published.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use envoy_types::pb::google::protobuf::Any;
use tokio::sync::watch;
use tracing::{debug, info};

use super::resources::{ResourceSets, ResourceType};

/// One publication of all resource types.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    version: u64,
    resources: ResourceSets,
    type_versions: BTreeMap<ResourceType, u64>,
}

impl Snapshot {
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn type_version(&self, resource_type: ResourceType) -> u64 {
        self.type_versions.get(&resource_type).copied().unwrap_or_default()
    }

    /// `version_info` sent to clients for `resource_type`.
    pub fn version_info(&self, resource_type: ResourceType) -> String {
        self.type_version(resource_type).to_string()
    }

    pub fn is_published(&self, resource_type: ResourceType) -> bool {
        self.type_version(resource_type) > 0
    }

    pub fn resources(&self, resource_type: ResourceType) -> &BTreeMap<String, Any> {
        self.resources.get(resource_type)
    }

    pub fn resource_sets(&self) -> &ResourceSets {
        &self.resources
    }
}

/// Decrements the pending count when a suspended watch resolves or is dropped.
struct PendingGuard<'a>(&'a AtomicUsize);

impl<'a> PendingGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
pub struct SnapshotCache {
    tx: watch::Sender<Arc<Snapshot>>,
    pending: AtomicUsize,
}

impl Default for SnapshotCache {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotCache {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(Arc::new(Snapshot::default()));
        Self { tx, pending: AtomicUsize::new(0) }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Snapshot> {
        self.tx.borrow().clone()
    }

    /// Publish `sets` as the next snapshot and return its version.
    ///
    /// Types whose content is unchanged keep their version, so their
    /// watchers stay suspended.
    pub fn set_snapshot(&self, sets: ResourceSets) -> u64 {
        let mut published = 0;
        let mut changed = Vec::new();
        self.tx.send_modify(|current| {
            let version = current.version + 1;
            let mut type_versions = BTreeMap::new();
            for resource_type in ResourceType::ALL {
                let same = current.is_published(resource_type)
                    && current.resources(resource_type) == sets.get(resource_type);
                let type_version = if same {
                    current.type_version(resource_type)
                } else {
                    changed.push(resource_type);
                    version
                };
                type_versions.insert(resource_type, type_version);
            }
            *current = Arc::new(Snapshot { version, resources: sets, type_versions });
            published = version;
        });

        info!(
            version = published,
            changed_types = ?changed.iter().map(ResourceType::short_name).collect::<Vec<_>>(),
            pending_watches = self.pending_watches(),
            "Published snapshot"
        );
        published
    }

    /// Wait until the version of `resource_type` differs from `known_version`.
    ///
    /// Resolves immediately when it already does. Dropping the future
    /// cancels the watch.
    pub async fn watch(&self, resource_type: ResourceType, known_version: &str) -> Arc<Snapshot> {
        let mut rx = self.tx.subscribe();
        let mut guard = None;
        loop {
            let snapshot = rx.borrow_and_update().clone();
            if snapshot.is_published(resource_type) && snapshot.version_info(resource_type) != known_version {
                return snapshot;
            }
            if guard.is_none() {
                debug!(resource_type = %resource_type, known_version, "Watch suspended");
                guard = Some(PendingGuard::new(&self.pending));
            }
            if rx.changed().await.is_err() {
                // The sender lives as long as `self`.
                std::future::pending::<()>().await;
            }
        }
    }

    /// Number of suspended watches.
    pub fn pending_watches(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }
}
