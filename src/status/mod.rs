//! # Status write-back
//!
//! Every build produces one [`StatusUpdate`] per source object. Writing those
//! back to the resource store is the job of a [`StatusSink`]; gateplane ships
//! a logging sink and a channel sink, and wraps either in a [`StatusCache`] so
//! identical outcomes are only forwarded once.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dag::status::{StatusOutcome, StatusUpdate, Validity};
use crate::errors::{Error, Result};
use crate::resources::ObjectKey;

/// Receives per-object build outcomes.
#[async_trait]
pub trait StatusSink: Send + Sync {
    async fn publish(&self, updates: Vec<StatusUpdate>) -> Result<()>;
}

/// Logs every outcome it receives.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingStatusSink;

#[async_trait]
impl StatusSink for LoggingStatusSink {
    async fn publish(&self, updates: Vec<StatusUpdate>) -> Result<()> {
        for update in updates {
            let StatusUpdate { key, outcome } = update;
            match outcome.validity {
                Validity::Valid => debug!(
                    object = %key,
                    generation = outcome.observed_generation,
                    "Object is valid"
                ),
                Validity::Invalid => warn!(
                    object = %key,
                    generation = outcome.observed_generation,
                    reason = %outcome.reason,
                    description = %outcome.description,
                    "Object is invalid"
                ),
                Validity::Orphaned => info!(
                    object = %key,
                    generation = outcome.observed_generation,
                    description = %outcome.description,
                    "Object is orphaned"
                ),
            }
        }
        Ok(())
    }
}

/// Forwards each batch of updates over an mpsc channel.
#[derive(Debug, Clone)]
pub struct ChannelStatusSink {
    tx: mpsc::Sender<Vec<StatusUpdate>>,
}

impl ChannelStatusSink {
    pub fn new(buffer: usize) -> (Self, mpsc::Receiver<Vec<StatusUpdate>>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }
}

#[async_trait]
impl StatusSink for ChannelStatusSink {
    async fn publish(&self, updates: Vec<StatusUpdate>) -> Result<()> {
        self.tx
            .send(updates)
            .await
            .map_err(|_| Error::internal("Status channel receiver dropped"))
    }
}

/// Idempotent write-back in front of another sink.
///
/// Remembers the last outcome forwarded per object and passes on only the
/// ones that changed. Objects missing from a batch are forgotten, so an
/// object that comes back later is written again.
pub struct StatusCache {
    inner: Arc<dyn StatusSink>,
    last: DashMap<ObjectKey, StatusOutcome>,
}

impl std::fmt::Debug for StatusCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusCache").field("tracked", &self.last.len()).finish()
    }
}

impl StatusCache {
    pub fn new(inner: Arc<dyn StatusSink>) -> Self {
        Self { inner, last: DashMap::new() }
    }

    /// Number of objects with a remembered outcome.
    pub fn tracked(&self) -> usize {
        self.last.len()
    }

    fn changed(&self, updates: Vec<StatusUpdate>) -> Vec<StatusUpdate> {
        let present: std::collections::HashSet<&ObjectKey> = updates.iter().map(|u| &u.key).collect();
        self.last.retain(|key, _| present.contains(key));

        let mut changed = Vec::new();
        for update in &updates {
            let same = self.last.get(&update.key).is_some_and(|last| *last == update.outcome);
            if !same {
                changed.push(update.clone());
            }
        }
        changed
    }
}

#[async_trait]
impl StatusSink for StatusCache {
    async fn publish(&self, updates: Vec<StatusUpdate>) -> Result<()> {
        let total = updates.len();
        let changed = self.changed(updates);
        debug!(total, changed = changed.len(), "Filtered status updates");
        if changed.is_empty() {
            return Ok(());
        }

        self.inner.publish(changed.clone()).await?;
        // Remember outcomes only once the inner sink took them, so a failed
        // write is retried with the next build.
        for update in changed {
            self.last.insert(update.key, update.outcome);
        }
        Ok(())
    }
}
