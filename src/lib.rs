//! Matview-Store: deduplicating cache of stream-fed materialized views
//!
//! Many callers ask for "the data at index ≥ N". The store keeps at most one
//! live subscription per distinct query, wakes every waiter as soon as the view
//! advances past its requested index, and reclaims idle views after a grace
//! period while keeping actively watched views alive.
//!
//! # Core Concepts
//!
//! - **Requests**: queries identified by a fingerprint of their cache-relevant fields
//! - **Views**: accumulators folded from an ordered event stream
//! - **Materializers**: one per entry, driving a streaming subscription into a view
//! - **Store**: the fingerprint map, expiry schedule and idle reaper
//!
//! # Example
//!
//! ```no_run
//! use matview_store::prelude::*;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> matview_store::error::Result<()> {
//! let client = Arc::new(InMemoryStreamingClient::new());
//! let store: Store<ServiceHealthView> = Store::new(StoreConfig::default());
//! tokio::spawn({
//!     let store = store.clone();
//!     async move { store.run(CancellationToken::new()).await }
//! });
//!
//! // Blocks until the view has advanced past index 10
//! let request = ServiceHealthRequest::new("web", client).with_min_index(10);
//! let result = store.get(&CancellationToken::new(), &request).await?;
//! println!("{} instances at index {}", result.value.nodes.len(), result.index);
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod cli;
pub mod config;
pub mod core;
pub mod error;
pub mod index;
pub mod storage;
pub mod stream;

/// Prelude module for common imports
pub mod prelude {
    pub use crate::api::ServiceHealthRequest;
    pub use crate::config::{BackoffConfig, StoreConfig};
    pub use crate::core::*;
    pub use crate::error::{Error, Result};
    pub use crate::storage::*;
    pub use crate::stream::{InMemoryStreamingClient, StreamingClient, SubscribeRequest};
}
