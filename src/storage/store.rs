//! Store: deduplicating cache of materialized views.
//!
//! One [`Entry`] exists per request fingerprint. Its materializer starts with
//! the first caller and keeps running while callers come and go. When the last
//! caller leaves, the entry is scheduled for reclamation after the idle TTL;
//! `Notify` subscribers pin it for as long as they are subscribed.
//!
//! The store lock guards the entry map and the expiry heap together. It is
//! held only for bookkeeping, never across a wait or an I/O call.

use crate::config::StoreConfig;
use crate::core::request::{fingerprint, CacheInfo, CacheResult, Request, UpdateEvent};
use crate::error::{Error, Result};
use crate::index::ExpiryHeap;
use crate::storage::entry::{Entry, EntryStats};
use crate::storage::materialized_view::View;
use crate::storage::materializer::Materializer;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

struct State<V: View> {
    by_key: HashMap<String, Entry<V>>,
    expiry: ExpiryHeap<String>,
    next_id: u64,
}

impl<V: View> State<V> {
    fn evict(&mut self, key: &str) -> Option<Entry<V>> {
        let entry = self.by_key.remove(key)?;
        self.expiry.remove(entry.expiry);
        entry.stop.cancel();
        Some(entry)
    }
}

struct Inner<V: View> {
    state: Mutex<State<V>>,
    /// Wakes the reaper when the expiry schedule changes
    schedule_changed: Notify,
    config: StoreConfig,
}

impl<V: View> Inner<V> {
    fn lock(&self) -> MutexGuard<'_, State<V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drop one request from an entry, scheduling its expiry when it goes idle.
    fn release(&self, key: &str, id: u64, watcher: bool) {
        let mut guard = self.lock();
        let state = &mut *guard;
        let Some(entry) = state.by_key.get_mut(key).filter(|e| e.id == id) else {
            return;
        };
        entry.requests = entry.requests.saturating_sub(1);
        if watcher {
            entry.watchers = entry.watchers.saturating_sub(1);
        }
        if entry.requests == 0 {
            state
                .expiry
                .update(entry.expiry, Instant::now() + self.config.idle_ttl);
            drop(guard);
            self.schedule_changed.notify_one();
        }
    }

    /// Remove an entry whose materializer terminated, unless it was already replaced.
    fn evict_failed(&self, key: &str, id: u64) {
        let mut state = self.lock();
        if state.by_key.get(key).is_some_and(|e| e.id == id) {
            state.evict(key);
            tracing::debug!(key, "removed failed entry");
        }
    }
}

impl<V: View> Drop for Inner<V> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in state.by_key.values() {
            entry.stop.cancel();
        }
    }
}

/// A counted claim on an entry; dropping it releases the request.
struct Lease<V: View> {
    inner: Arc<Inner<V>>,
    key: String,
    id: u64,
    watcher: bool,
    materializer: Arc<Materializer<V>>,
}

impl<V: View> Drop for Lease<V> {
    fn drop(&mut self) {
        self.inner.release(&self.key, self.id, self.watcher);
    }
}

/// Shared cache of materialized views, cheap to clone.
pub struct Store<V: View> {
    inner: Arc<Inner<V>>,
}

impl<V: View> Clone for Store<V> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<V: View> Store<V> {
    /// Create an empty store. [`Store::run`] must be spawned to reclaim idle entries.
    pub fn new(config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    by_key: HashMap::new(),
                    expiry: ExpiryHeap::new(),
                    next_id: 0,
                }),
                schedule_changed: Notify::new(),
                config,
            }),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    /// Reclaim idle entries until `stop` fires, then stop every materializer.
    pub async fn run(&self, stop: CancellationToken) {
        loop {
            let changed = self.inner.schedule_changed.notified();
            let next = self.inner.lock().expiry.peek().map(|e| e.deadline);
            let sleep = async move {
                match next {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                _ = stop.cancelled() => break,
                _ = changed => {}
                _ = sleep => self.reap_expired(),
            }
        }

        let mut state = self.inner.lock();
        let keys: Vec<String> = state.by_key.keys().cloned().collect();
        for key in &keys {
            state.evict(key);
        }
        tracing::debug!(entries = keys.len(), "store stopped");
    }

    fn reap_expired(&self) {
        let now = Instant::now();
        let mut guard = self.inner.lock();
        let state = &mut *guard;
        while let Some(next) = state.expiry.peek() {
            if next.deadline > now {
                break;
            }
            let handle = next.handle;
            let key = next.key.clone();
            match state.by_key.get(&key) {
                Some(entry) if entry.expiry == handle && entry.requests == 0 => {
                    state.evict(&key);
                    tracing::debug!(key = %key, "reclaimed idle entry");
                }
                Some(entry) if entry.expiry == handle => {
                    // Still in use; the last release reschedules it.
                    state.expiry.pin(handle);
                }
                _ => {
                    state.expiry.remove(handle);
                }
            }
        }
    }

    /// Find or create the entry for `req` and count one more request on it.
    fn acquire<R>(&self, req: &R, info: &CacheInfo, watcher: bool) -> Result<Lease<V>>
    where
        R: Request<View = V>,
    {
        let key = fingerprint(req.kind(), info);
        let mut guard = self.inner.lock();
        let state = &mut *guard;

        if let Some(dead) = state.by_key.get(&key).filter(|e| e.is_dead()) {
            let failure = dead.materializer.failure();
            state.evict(&key);
            tracing::debug!(key = %key, ?failure, "replacing stopped entry");
        }

        if !state.by_key.contains_key(&key) {
            let deps = req.new_materializer().map_err(|err| match err {
                Error::Construction(_) => err,
                other => Error::Construction(other.to_string()),
            })?;
            let materializer = Arc::new(Materializer::new(deps, self.inner.config.backoff.clone()));
            let stop = CancellationToken::new();
            let id = state.next_id;
            state.next_id += 1;
            let expiry = state.expiry.insert_not_indexed(key.clone(), Instant::now());
            state.by_key.insert(
                key.clone(),
                Entry {
                    id,
                    materializer: materializer.clone(),
                    requests: 0,
                    watchers: 0,
                    expiry,
                    stop: stop.clone(),
                },
            );
            self.spawn_materializer(key.clone(), id, materializer, stop);
            tracing::debug!(key = %key, "created entry");
        }

        let Some(entry) = state.by_key.get_mut(&key) else {
            return Err(Error::Closed);
        };
        entry.requests += 1;
        if watcher {
            entry.watchers += 1;
            state.expiry.pin(entry.expiry);
        }
        Ok(Lease {
            inner: self.inner.clone(),
            key,
            id: entry.id,
            watcher,
            materializer: entry.materializer.clone(),
        })
    }

    fn spawn_materializer(
        &self,
        key: String,
        id: u64,
        materializer: Arc<Materializer<V>>,
        stop: CancellationToken,
    ) {
        let inner: Weak<Inner<V>> = Arc::downgrade(&self.inner);
        let span = tracing::debug_span!("materializer", key = %key);
        tokio::spawn(
            async move {
                if materializer.run(stop).await.is_err() {
                    if let Some(inner) = inner.upgrade() {
                        inner.evict_failed(&key, id);
                    }
                }
            }
            .instrument(span),
        );
    }

    /// Read the view for `req` once it has advanced past `req`'s minimum index.
    ///
    /// Blocks until the view is ready, `cancel` fires, or the request timeout
    /// elapses.
    pub async fn get<R>(&self, cancel: &CancellationToken, req: &R) -> Result<CacheResult<V::Output>>
    where
        R: Request<View = V>,
    {
        let info = req.cache_info();
        let lease = self.acquire(req, &info, false)?;
        let wait = lease.materializer.wait_for_index(cancel, info.min_index);
        let result = if info.timeout.is_zero() {
            wait.await
        } else {
            tokio::time::timeout(info.timeout, wait)
                .await
                .unwrap_or(Err(Error::DeadlineExceeded))
        };
        drop(lease);
        result
    }

    /// Push every advance of the view for `req` onto `updates` until `cancel` fires.
    ///
    /// Only registration errors are returned here. A consumer that falls
    /// behind receives the newest result once it has room again; intermediate
    /// results are skipped, never reordered. A fatal materializer error is
    /// delivered once and ends the subscription.
    pub fn notify<R>(
        &self,
        cancel: CancellationToken,
        req: &R,
        correlation_id: impl Into<String>,
        updates: mpsc::Sender<UpdateEvent<V::Output>>,
    ) -> Result<()>
    where
        R: Request<View = V>,
    {
        let info = req.cache_info();
        let lease = self.acquire(req, &info, true)?;
        let correlation_id = correlation_id.into();
        let span = tracing::debug_span!(
            "notify",
            key = %lease.key,
            correlation_id = %correlation_id
        );
        tokio::spawn(
            forward(lease, cancel, info.min_index, correlation_id, updates).instrument(span),
        );
        Ok(())
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.inner.lock().by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bookkeeping for the entry with fingerprint `key`
    pub fn entry_stats(&self, key: &str) -> Option<EntryStats> {
        let state = self.inner.lock();
        let entry = state.by_key.get(key)?;
        Some(EntryStats {
            requests: entry.requests,
            watchers: entry.watchers,
            expiry: state.expiry.position(entry.expiry)?,
            expires_at: state.expiry.deadline(entry.expiry),
            state: entry.materializer.state(),
            index: entry.materializer.index(),
        })
    }
}

async fn forward<V: View>(
    lease: Lease<V>,
    cancel: CancellationToken,
    min_index: u64,
    correlation_id: String,
    updates: mpsc::Sender<UpdateEvent<V::Output>>,
) {
    let materializer = lease.materializer.clone();
    let mut last: Option<u64> = None;
    let mut pending: Option<UpdateEvent<V::Output>> = None;
    let mut failed = false;

    loop {
        let floor = last;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            _ = updates.closed() => {
                tracing::debug!("update receiver dropped");
                break;
            }
            permit = updates.reserve(), if pending.is_some() => {
                let Ok(permit) = permit else {
                    tracing::debug!("update receiver dropped");
                    break;
                };
                if let Some(event) = pending.take() {
                    permit.send(event);
                }
                if failed {
                    break;
                }
            }
            result = materializer.wait_until(&cancel, move |index| match floor {
                Some(last) => index > last,
                None => min_index == 0 || index > min_index,
            }), if !failed => {
                let result = match result {
                    Ok(result) => result,
                    Err(err) if err.is_cancellation() => break,
                    Err(err) => {
                        tracing::warn!(error = %err, "notify subscription ended");
                        failed = true;
                        pending = Some(UpdateEvent {
                            correlation_id: correlation_id.clone(),
                            result: Err(err),
                        });
                        continue;
                    }
                };
                if let Some(skipped) = &pending {
                    if let Ok(skipped) = &skipped.result {
                        tracing::trace!(skipped = skipped.index, latest = result.index, "coalesced update for slow consumer");
                    }
                }
                last = Some(result.index);
                pending = Some(UpdateEvent {
                    correlation_id: correlation_id.clone(),
                    result: Ok(result),
                });
            }
        }
    }
    drop(lease);
}
