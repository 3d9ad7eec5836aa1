//! Storage layer: materialized views, their materializers and the store

pub mod entry;
pub mod materialized_view;
pub mod materializer;
pub mod retry;
pub mod store;

pub use entry::EntryStats;
pub use materialized_view::*;
pub use materializer::{Materializer, MaterializerDeps, MaterializerState, RequestFn};
pub use retry::Backoff;
pub use store::Store;
