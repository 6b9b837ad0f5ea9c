//! # gateplane
//!
//! gateplane is the control plane of an ingress and Gateway API controller.
//! It compiles independently authored routing objects (Ingress, HTTPProxy,
//! Gateway and HTTPRoute) into one consistent routing graph and serves it to
//! a fleet of Envoy proxies over the xDS discovery protocol.
//!
//! ## Architecture
//!
//! ```text
//! Resource Store → holdoff → DAG Builder → Translator → Snapshot Cache → Discovery Server → Envoy
//!                                 ↓
//!                            Status Sink
//! ```
//!
//! ## Core Components
//!
//! - [`store`]: point-in-time views of watched objects and change notification
//! - [`dag`]: processors, conflict resolution and the immutable routing graph
//! - [`xds`]: translation to Envoy resources, versioned snapshots, gRPC services
//! - [`pipeline`]: debounced rebuilds with atomic publication
//! - [`status`]: idempotent write-back of per-object outcomes
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gateplane::{
//!     config::{Parameters, PipelineConfig},
//!     pipeline::Pipeline,
//!     status::LoggingStatusSink,
//!     store::InMemoryStore,
//!     xds::SnapshotCache,
//! };
//!
//! #[tokio::main]
//! async fn main() -> gateplane::Result<()> {
//!     let cache = Arc::new(SnapshotCache::new());
//!     let pipeline = Pipeline::new(
//!         Arc::new(Parameters::defaults()),
//!         Arc::new(InMemoryStore::new()),
//!         cache.clone(),
//!         Arc::new(LoggingStatusSink),
//!         PipelineConfig::default(),
//!     );
//!     let summary = pipeline.rebuild().await?;
//!     println!("published snapshot {}", summary.snapshot_version);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dag;
pub mod errors;
pub mod observability;
pub mod pipeline;
pub mod resources;
pub mod status;
pub mod store;
pub mod utils;
pub mod xds;

// Re-export commonly used types and traits
pub use config::{ControlPlaneConfig, Parameters};
pub use errors::{Error, Result};
pub use observability::init_tracing;

/// Application version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name from Cargo.toml
pub const APP_NAME: &str = env!("CARGO_PKG_NAME");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_available() {
        assert!(!VERSION.is_empty());
        assert_eq!(APP_NAME, "gateplane");
    }
}
