//! Per-fingerprint bookkeeping held in the store's map

use crate::index::{ExpiryHandle, Position};
use crate::storage::materialized_view::View;
use crate::storage::materializer::{Materializer, MaterializerState};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One cached query: its materializer, consumer count and expiry slot.
///
/// Entries are only read or mutated under the store lock.
pub(crate) struct Entry<V: View> {
    /// Distinguishes a recreated entry from the one it replaced
    pub(crate) id: u64,
    pub(crate) materializer: Arc<Materializer<V>>,
    /// Callers currently waiting on or subscribed to this entry
    pub(crate) requests: usize,
    /// Active `Notify` subscriptions; while non-zero the entry is pinned
    pub(crate) watchers: usize,
    pub(crate) expiry: ExpiryHandle,
    /// Stops the materializer's run loop
    pub(crate) stop: CancellationToken,
}

impl<V: View> Entry<V> {
    /// A materializer that stopped can never satisfy another caller
    pub(crate) fn is_dead(&self) -> bool {
        self.materializer.state() == MaterializerState::Stopped
    }
}

/// Snapshot of an entry's bookkeeping, for operators and tests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStats {
    pub requests: usize,
    pub watchers: usize,
    /// Position in the expiry heap; `NotIndexed` while pinned
    pub expiry: Position,
    /// When the entry will be reclaimed if it stays idle
    pub expires_at: Option<Instant>,
    pub state: MaterializerState,
    pub index: u64,
}
