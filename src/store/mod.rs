//! # Resource Store
//!
//! Point-in-time views of every watched object plus change notification.
//! The builder only ever reads an immutable [`ResourceSnapshot`]; writers go
//! through [`InMemoryStore`], which publishes a fresh snapshot per change and
//! bumps a revision counter subscribers can wait on.

pub mod manifest;

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use arc_swap::ArcSwap;
use tokio::sync::watch;
use tracing::debug;

use crate::resources::{
    Endpoints, Gateway, GatewayClass, HttpProxy, HttpRoute, Ingress, Kind, ObjectKey, ReferenceGrant, Resource,
    Secret, Service, TlsCertificateDelegation,
};

pub use manifest::{load_manifest_file, parse_manifests};

/// A stored object and the store revision at which it last changed.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredObject {
    pub resource: Resource,
    pub revision: u64,
}

/// Read-only view of all watched objects at one store revision.
#[derive(Debug, Clone, Default)]
pub struct ResourceSnapshot {
    revision: u64,
    objects: BTreeMap<ObjectKey, StoredObject>,
}

macro_rules! typed_accessors {
    ($($all:ident, $one:ident, $variant:ident, $ty:ty;)*) => {
        $(
            pub fn $all(&self) -> impl Iterator<Item = &$ty> + '_ {
                self.of_kind(Kind::$variant).filter_map(|r| match r {
                    Resource::$variant(o) => Some(o),
                    _ => None,
                })
            }

            pub fn $one(&self, namespace: &str, name: &str) -> Option<&$ty> {
                match self.get(&ObjectKey::new(Kind::$variant, namespace, name)) {
                    Some(Resource::$variant(o)) => Some(o),
                    _ => None,
                }
            }
        )*
    };
}

impl ResourceSnapshot {
    /// Build a snapshot directly from objects, all at revision 1.
    pub fn from_resources<I: IntoIterator<Item = Resource>>(resources: I) -> Self {
        let objects = resources
            .into_iter()
            .map(|resource| (resource.key(), StoredObject { resource, revision: 1 }))
            .collect();
        Self { revision: 1, objects }
    }

    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn get(&self, key: &ObjectKey) -> Option<&Resource> {
        self.objects.get(key).map(|o| &o.resource)
    }

    /// Revision at which the object last changed.
    pub fn object_revision(&self, key: &ObjectKey) -> Option<u64> {
        self.objects.get(key).map(|o| o.revision)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&ObjectKey, &Resource)> + '_ {
        self.objects.iter().map(|(k, o)| (k, &o.resource))
    }

    /// All objects of `kind`, ordered by namespace then name.
    fn of_kind(&self, kind: Kind) -> impl Iterator<Item = &Resource> + '_ {
        let start = ObjectKey::new(kind, "", "");
        self.objects
            .range(start..)
            .take_while(move |(k, _)| k.kind == kind)
            .map(|(_, o)| &o.resource)
    }

    typed_accessors! {
        ingresses, ingress, Ingress, Ingress;
        http_proxies, http_proxy, HttpProxy, HttpProxy;
        gateway_classes, gateway_class_by_ns, GatewayClass, GatewayClass;
        gateways, gateway, Gateway, Gateway;
        http_routes, http_route, HttpRoute, HttpRoute;
        reference_grants, reference_grant, ReferenceGrant, ReferenceGrant;
        services, service, Service, Service;
        endpoints_all, endpoints, Endpoints, Endpoints;
        secrets, secret, Secret, Secret;
        delegations, delegation, TlsCertificateDelegation, TlsCertificateDelegation;
    }

    /// GatewayClass objects are cluster scoped.
    pub fn gateway_class(&self, name: &str) -> Option<&GatewayClass> {
        self.gateway_class_by_ns("", name)
    }
}

/// Source of resource snapshots and change notifications.
pub trait ResourceStore: Send + Sync {
    /// The current point-in-time view.
    fn snapshot(&self) -> Arc<ResourceSnapshot>;

    /// Receives the store revision after every change.
    fn subscribe(&self) -> watch::Receiver<u64>;
}

/// Reference [`ResourceStore`] fed by the manifest loader or tests.
pub struct InMemoryStore {
    objects: Mutex<BTreeMap<ObjectKey, StoredObject>>,
    current: ArcSwap<ResourceSnapshot>,
    revision_tx: watch::Sender<u64>,
}

impl std::fmt::Debug for InMemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryStore").field("revision", &*self.revision_tx.borrow()).finish()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (revision_tx, _) = watch::channel(0);
        Self {
            objects: Mutex::new(BTreeMap::new()),
            current: ArcSwap::from_pointee(ResourceSnapshot::default()),
            revision_tx,
        }
    }

    pub fn revision(&self) -> u64 {
        *self.revision_tx.borrow()
    }

    /// Add or replace one object. Returns the store revision afterwards.
    pub fn apply(&self, resource: Resource) -> u64 {
        self.apply_all(std::iter::once(resource))
    }

    /// Add or replace several objects as one change.
    ///
    /// Objects identical to what is stored do not bump the revision.
    pub fn apply_all<I: IntoIterator<Item = Resource>>(&self, resources: I) -> u64 {
        let mut objects = self.objects.lock().expect("resource store lock poisoned");
        let next = self.revision() + 1;
        let mut changed = false;
        for resource in resources {
            let key = resource.key();
            if objects.get(&key).map(|o| o.resource == resource).unwrap_or(false) {
                continue;
            }
            debug!(object = %key, revision = next, "Applied resource");
            objects.insert(key, StoredObject { resource, revision: next });
            changed = true;
        }
        if changed {
            self.publish(&objects, next)
        } else {
            next - 1
        }
    }

    /// Remove an object. Returns whether it existed.
    pub fn delete(&self, key: &ObjectKey) -> bool {
        let mut objects = self.objects.lock().expect("resource store lock poisoned");
        if objects.remove(key).is_none() {
            return false;
        }
        debug!(object = %key, "Deleted resource");
        let next = self.revision() + 1;
        self.publish(&objects, next);
        true
    }

    fn publish(&self, objects: &BTreeMap<ObjectKey, StoredObject>, revision: u64) -> u64 {
        self.current.store(Arc::new(ResourceSnapshot { revision, objects: objects.clone() }));
        self.revision_tx.send_replace(revision);
        revision
    }
}

impl ResourceStore for InMemoryStore {
    fn snapshot(&self) -> Arc<ResourceSnapshot> {
        self.current.load_full()
    }

    fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision_tx.subscribe()
    }
}
