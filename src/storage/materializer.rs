//! Materializer: drives one streaming subscription into one view.
//!
//! The run loop is the only writer of the view. After each applied batch it
//! publishes an owned snapshot of the view through a `watch` channel, which
//! doubles as the wake signal for every waiter blocked in
//! [`Materializer::wait_for_index`].
//!
//! ```text
//! Initializing --snapshot--> Streaming --error--> Recovering --snapshot--> Streaming
//!       \______________________________\_______________\____ stop/fatal ____> Stopped
//! ```

use crate::config::BackoffConfig;
use crate::core::event::{Event, StreamItem};
use crate::core::request::CacheResult;
use crate::error::{Error, Result};
use crate::storage::materialized_view::View;
use crate::storage::retry::Backoff;
use crate::stream::{StreamingClient, SubscribeRequest};
use futures::StreamExt;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Builds the subscribe request for a starting index
pub type RequestFn = Box<dyn Fn(u64) -> SubscribeRequest + Send + Sync>;

/// Everything a materializer needs, supplied by the request
pub struct MaterializerDeps<V> {
    /// Initial, empty view
    pub view: V,
    pub client: Arc<dyn StreamingClient>,
    pub request: RequestFn,
}

impl<V> MaterializerDeps<V> {
    pub fn new<F>(view: V, client: Arc<dyn StreamingClient>, request: F) -> Self
    where
        F: Fn(u64) -> SubscribeRequest + Send + Sync + 'static,
    {
        Self {
            view,
            client,
            request: Box::new(request),
        }
    }
}

/// Lifecycle of the run loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaterializerState {
    /// Waiting for the first snapshot
    Initializing,
    /// Applying live events
    Streaming,
    /// Resubscribing after a stream error
    Recovering,
    /// Terminal
    Stopped,
}

#[derive(Debug, Clone)]
struct Published<T> {
    index: u64,
    /// `None` until the first snapshot completes
    result: Option<T>,
    state: MaterializerState,
    /// Set when the run loop terminated fatally
    err: Option<Error>,
}

/// Keeps a view current with its event stream and lets callers block until
/// it reaches an index.
pub struct Materializer<V: View> {
    view: Mutex<V>,
    client: Arc<dyn StreamingClient>,
    request: RequestFn,
    backoff: BackoffConfig,
    published: watch::Sender<Published<V::Output>>,
}

impl<V: View> Materializer<V> {
    pub fn new(deps: MaterializerDeps<V>, backoff: BackoffConfig) -> Self {
        let (published, _) = watch::channel(Published {
            index: 0,
            result: None,
            state: MaterializerState::Initializing,
            err: None,
        });
        Self {
            view: Mutex::new(deps.view),
            client: deps.client,
            request: deps.request,
            backoff,
            published,
        }
    }

    /// Consume the stream until `stop` fires or a fatal error occurs.
    ///
    /// Must be called at most once. Returns the fatal error, if any, after it
    /// has been handed to every waiter.
    pub async fn run(&self, stop: CancellationToken) -> Result<()> {
        let mut backoff = Backoff::new(self.backoff.clone());
        let outcome = loop {
            let err = tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                err = self.run_subscription(&mut backoff) => err,
            };

            if !err.is_retryable() {
                tracing::error!(error = %err, "materializer failed");
                break Err(Error::MaterializerFailed(err.to_string()));
            }
            self.set_state(MaterializerState::Recovering);

            if let Error::StreamReset(reason) = &err {
                tracing::debug!(%reason, "stream reset, resubscribing from snapshot");
                continue;
            }
            let Some(delay) = backoff.next_delay() else {
                tracing::error!(
                    error = %err,
                    failures = backoff.failures(),
                    "subscription retries exhausted"
                );
                break Err(Error::MaterializerFailed(format!(
                    "retries exhausted after {} failures: {}",
                    backoff.failures(),
                    err
                )));
            };
            tracing::warn!(
                error = %err,
                failures = backoff.failures(),
                delay_ms = delay.as_millis() as u64,
                "subscription failed, retrying"
            );
            tokio::select! {
                _ = stop.cancelled() => break Ok(()),
                _ = tokio::time::sleep(delay) => {}
            }
        };

        self.published.send_modify(|p| {
            p.state = MaterializerState::Stopped;
            if let Err(err) = &outcome {
                p.err = Some(err.clone());
            }
        });
        outcome
    }

    /// Run one subscription until it fails; only returns on error.
    async fn run_subscription(&self, backoff: &mut Backoff) -> Error {
        // Every subscription starts from a fresh snapshot, so the view is
        // rebuilt in full at the end-of-snapshot marker.
        let request = (self.request)(0);
        tracing::debug!(topic = %request.topic, key = %request.key, "subscribing");
        let mut stream = match self.client.subscribe(request).await {
            Ok(stream) => stream,
            Err(err) => return err,
        };

        let mut snapshot: Option<Vec<Event>> = Some(Vec::new());
        while let Some(item) = stream.next().await {
            let item = match item {
                Ok(item) => item,
                Err(err) => return err,
            };
            match item {
                StreamItem::NewSnapshotToFollow => {
                    snapshot = Some(Vec::new());
                }
                StreamItem::EndOfSnapshot { index } => {
                    let events = snapshot.take().unwrap_or_default();
                    let applied = self.apply(index, |view| {
                        view.reset();
                        view.update(&events)
                    });
                    if let Err(err) = applied {
                        return err;
                    }
                    backoff.reset();
                }
                StreamItem::Events { index, events } => {
                    if let Some(buffered) = snapshot.as_mut() {
                        buffered.extend(events);
                        continue;
                    }
                    if let Err(err) = self.apply(index, |view| view.update(&events)) {
                        return err;
                    }
                }
            }
        }
        Error::Transport("subscription stream ended".to_string())
    }

    /// Mutate the view and publish its new result at `index`.
    ///
    /// After a resubscribe the stream may replay indexes below the last
    /// published one; those are applied but not published, so readers never
    /// see the index move backwards.
    fn apply<F>(&self, index: u64, f: F) -> Result<()>
    where
        F: FnOnce(&mut V) -> Result<()>,
    {
        let result = {
            let mut view = self.view.lock().unwrap_or_else(PoisonError::into_inner);
            f(&mut *view).map_err(|err| match err {
                Error::View(_) => err,
                other => Error::View(other.to_string()),
            })?;
            view.result(index)
        };

        let published = self.published.send_if_modified(|p| {
            if p.result.is_some() && index < p.index {
                return false;
            }
            p.index = index;
            p.result = Some(result);
            p.state = MaterializerState::Streaming;
            true
        });
        if published {
            tracing::trace!(index, "view advanced");
        }
        Ok(())
    }

    fn set_state(&self, state: MaterializerState) {
        self.published.send_if_modified(|p| {
            let changed = p.state != state;
            p.state = state;
            changed
        });
    }

    /// Block until the view is ready and its index exceeds `min_index`.
    ///
    /// A `min_index` of zero is satisfied by the first complete snapshot.
    pub async fn wait_for_index(
        &self,
        cancel: &CancellationToken,
        min_index: u64,
    ) -> Result<CacheResult<V::Output>> {
        self.wait_until(cancel, |index| min_index == 0 || index > min_index)
            .await
    }

    /// Block until the published index satisfies `ready`.
    pub(crate) async fn wait_until<F>(
        &self,
        cancel: &CancellationToken,
        ready: F,
    ) -> Result<CacheResult<V::Output>>
    where
        F: Fn(u64) -> bool,
    {
        let mut rx = self.published.subscribe();
        loop {
            {
                let current = rx.borrow_and_update();
                if let Some(err) = &current.err {
                    return Err(err.clone());
                }
                if current.state == MaterializerState::Stopped {
                    return Err(Error::Closed);
                }
                if let Some(value) = &current.result {
                    if ready(current.index) {
                        return Ok(CacheResult {
                            value: value.clone(),
                            index: current.index,
                        });
                    }
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Canceled),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(Error::Closed);
                    }
                }
            }
        }
    }

    /// Latest published result, without blocking
    pub fn current_view(&self) -> Option<CacheResult<V::Output>> {
        let current = self.published.borrow();
        current.result.as_ref().map(|value| CacheResult {
            value: value.clone(),
            index: current.index,
        })
    }

    /// Highest published index
    pub fn index(&self) -> u64 {
        self.published.borrow().index
    }

    pub fn state(&self) -> MaterializerState {
        self.published.borrow().state
    }

    /// Fatal error the run loop terminated with, if any
    pub fn failure(&self) -> Option<Error> {
        self.published.borrow().err.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::event::{Payload, ServiceNode, Topic};
    use crate::storage::materialized_view::ServiceHealthView;
    use crate::stream::{InMemoryStreamingClient, MockStreamingClient};
    use std::time::Duration;

    fn subscribe_request(index: u64) -> SubscribeRequest {
        SubscribeRequest {
            topic: Topic::ServiceHealth,
            key: "web".to_string(),
            token: "abcd".to_string(),
            datacenter: "dc1".to_string(),
            namespace: String::new(),
            index,
        }
    }

    fn fast_backoff(max_failures: Option<u32>) -> BackoffConfig {
        BackoffConfig {
            min_wait: Duration::from_millis(10),
            factor: 2,
            max_wait: Duration::from_millis(50),
            jitter_percent: 0,
            max_failures,
        }
    }

    fn start(
        client: Arc<dyn StreamingClient>,
        backoff: BackoffConfig,
    ) -> (
        Arc<Materializer<ServiceHealthView>>,
        CancellationToken,
        tokio::task::JoinHandle<Result<()>>,
    ) {
        let deps = MaterializerDeps::new(ServiceHealthView::new(), client, subscribe_request);
        let materializer = Arc::new(Materializer::new(deps, backoff));
        let stop = CancellationToken::new();
        let handle = tokio::spawn({
            let materializer = materializer.clone();
            let stop = stop.clone();
            async move { materializer.run(stop).await }
        });
        (materializer, stop, handle)
    }

    fn register(index: u64, node: &str) -> StreamItem {
        StreamItem::event(Event::register(index, ServiceNode::new(node, "web")))
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_until_snapshot() {
        let client = Arc::new(InMemoryStreamingClient::new());
        let (materializer, _stop, _) = start(client.clone(), fast_backoff(None));
        let cancel = CancellationToken::new();

        let early = tokio::time::timeout(
            Duration::from_millis(50),
            materializer.wait_for_index(&cancel, 0),
        )
        .await;
        assert!(early.is_err(), "no snapshot yet");
        assert_eq!(materializer.state(), MaterializerState::Initializing);
        assert!(materializer.current_view().is_none());

        client.queue_events([StreamItem::end_of_snapshot(2)]);
        let result = materializer.wait_for_index(&cancel, 0).await.unwrap();
        assert_eq!(result.index, 2);
        assert!(result.value.nodes.is_empty());
        assert_eq!(materializer.state(), MaterializerState::Streaming);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wakes_on_advance_past_min_index() {
        let client = Arc::new(InMemoryStreamingClient::new());
        client.queue_events([StreamItem::end_of_snapshot(2), register(10, "node1")]);
        let (materializer, _stop, _) = start(client.clone(), fast_backoff(None));
        let cancel = CancellationToken::new();

        let result = materializer.wait_for_index(&cancel, 9).await.unwrap();
        assert_eq!(result.index, 10);

        let waiter = tokio::spawn({
            let materializer = materializer.clone();
            let cancel = cancel.clone();
            async move { materializer.wait_for_index(&cancel, 10).await }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        client.queue_events([register(11, "node2")]);
        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.index, 11);
        assert_eq!(result.value.nodes.len(), 2);
        assert_eq!(materializer.current_view().unwrap().index, 11);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_only_affects_one_waiter() {
        let client = Arc::new(InMemoryStreamingClient::new());
        client.queue_events([StreamItem::end_of_snapshot(2)]);
        let (materializer, _stop, _) = start(client.clone(), fast_backoff(None));

        let canceled = CancellationToken::new();
        let patient = CancellationToken::new();
        let first = tokio::spawn({
            let (m, c) = (materializer.clone(), canceled.clone());
            async move { m.wait_for_index(&c, 5).await }
        });
        let second = tokio::spawn({
            let (m, c) = (materializer.clone(), patient.clone());
            async move { m.wait_for_index(&c, 5).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        canceled.cancel();
        assert_eq!(first.await.unwrap().unwrap_err(), Error::Canceled);
        assert!(!second.is_finished());

        client.queue_events([register(6, "node1")]);
        assert_eq!(second.await.unwrap().unwrap().index, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_from_transport_error_without_regressing() {
        let client = Arc::new(InMemoryStreamingClient::new());
        client.queue_events([
            StreamItem::end_of_snapshot(2),
            register(10, "node1"),
            register(22, "node2"),
        ]);
        let (materializer, _stop, _) = start(client.clone(), fast_backoff(None));
        let cancel = CancellationToken::new();
        assert_eq!(materializer.wait_for_index(&cancel, 21).await.unwrap().index, 22);

        client.queue_error(Error::Transport("connection reset".into()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        let subscriptions = client.subscriptions();
        assert_eq!(subscriptions.len(), 2);
        assert!(subscriptions.iter().all(|req| req.index == 0));
        let current = materializer.current_view().unwrap();
        assert_eq!(current.index, 22);
        assert_eq!(current.value.nodes.len(), 2);

        client.queue_events([register(24, "node3")]);
        let result = materializer.wait_for_index(&cancel, 22).await.unwrap();
        assert_eq!(result.index, 24);
        assert_eq!(result.value.nodes.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_reset_resubscribes_without_backoff() {
        let client = Arc::new(InMemoryStreamingClient::new());
        client.queue_events([StreamItem::end_of_snapshot(2), register(10, "node1")]);
        // Any counted failure would be fatal, and any backoff would sleep 10s
        let backoff = BackoffConfig {
            min_wait: Duration::from_secs(10),
            max_wait: Duration::from_secs(10),
            ..fast_backoff(Some(1))
        };
        let (materializer, _stop, handle) = start(client.clone(), backoff);
        let cancel = CancellationToken::new();
        assert_eq!(materializer.wait_for_index(&cancel, 0).await.unwrap().index, 10);

        for resets in 1..=5 {
            client.queue_error(Error::StreamReset("snapshot invalidated".into()));
            tokio::time::sleep(Duration::from_millis(1)).await;
            assert_eq!(client.subscriptions().len(), resets + 1);
            assert_eq!(client.active_subscribers(), 1);
            assert!(!handle.is_finished());
        }
        assert!(client.subscriptions().iter().all(|req| req.index == 0));
        assert!(materializer.failure().is_none());
        assert_eq!(materializer.current_view().unwrap().index, 10);

        client.queue_events([register(11, "node2")]);
        let result = materializer.wait_for_index(&cancel, 10).await.unwrap();
        assert_eq!(result.index, 11);
        assert_eq!(result.value.nodes.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_to_follow_is_applied_atomically() {
        let client = Arc::new(InMemoryStreamingClient::new());
        client.queue_events([StreamItem::end_of_snapshot(2), register(10, "node1")]);
        let (materializer, _stop, _) = start(client.clone(), fast_backoff(None));
        let cancel = CancellationToken::new();
        assert_eq!(materializer.wait_for_index(&cancel, 9).await.unwrap().index, 10);

        client.queue_events([
            StreamItem::NewSnapshotToFollow,
            register(30, "node2"),
            register(31, "node3"),
        ]);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let current = materializer.current_view().unwrap();
        assert_eq!(current.index, 10);
        assert_eq!(current.value.nodes.len(), 1);

        client.queue_events([StreamItem::end_of_snapshot(31)]);
        let result = materializer.wait_for_index(&cancel, 10).await.unwrap();
        assert_eq!(result.index, 31);
        let ids: Vec<_> = result.value.nodes.iter().map(|n| n.node.as_str()).collect();
        assert_eq!(ids, vec!["node2", "node3"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_view_error_fails_all_waiters() {
        let client = Arc::new(InMemoryStreamingClient::new());
        client.queue_events([StreamItem::end_of_snapshot(2)]);
        let (materializer, _stop, handle) = start(client.clone(), fast_backoff(None));
        let cancel = CancellationToken::new();

        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let (m, c) = (materializer.clone(), cancel.clone());
                tokio::spawn(async move { m.wait_for_index(&c, 100).await })
            })
            .collect();
        tokio::time::sleep(Duration::from_millis(10)).await;

        client.queue_events([StreamItem::event(Event::new(
            5,
            Payload::Other {
                kind: "kv".to_string(),
                data: serde_json::Value::Null,
            },
        ))]);

        for waiter in waiters {
            let err = waiter.await.unwrap().unwrap_err();
            assert!(matches!(err, Error::MaterializerFailed(msg) if msg.contains("kv")));
        }
        assert!(matches!(handle.await.unwrap(), Err(Error::MaterializerFailed(_))));
        assert_eq!(materializer.state(), MaterializerState::Stopped);
        assert!(materializer.failure().is_some());
        assert!(materializer.wait_for_index(&cancel, 0).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_is_fatal() {
        let mut mock = MockStreamingClient::new();
        mock.expect_subscribe()
            .times(3)
            .returning(|_| Err(Error::Transport("connection refused".into())));
        let (materializer, _stop, handle) = start(Arc::new(mock), fast_backoff(Some(3)));
        let cancel = CancellationToken::new();

        let err = materializer.wait_for_index(&cancel, 0).await.unwrap_err();
        assert!(matches!(err, Error::MaterializerFailed(msg) if msg.contains("connection refused")));
        assert!(handle.await.unwrap().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_materializer_rejects_waiters() {
        let client = Arc::new(InMemoryStreamingClient::new());
        client.queue_events([StreamItem::end_of_snapshot(2)]);
        let (materializer, stop, handle) = start(client.clone(), fast_backoff(None));
        let cancel = CancellationToken::new();

        let pending = tokio::spawn({
            let (m, c) = (materializer.clone(), cancel.clone());
            async move { m.wait_for_index(&c, 50).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;

        stop.cancel();
        assert_eq!(handle.await.unwrap(), Ok(()));
        assert_eq!(pending.await.unwrap().unwrap_err(), Error::Closed);
        assert_eq!(
            materializer.wait_for_index(&cancel, 0).await.unwrap_err(),
            Error::Closed
        );
        assert_eq!(client.active_subscribers(), 0);
    }
}
