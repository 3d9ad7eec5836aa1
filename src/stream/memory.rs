//! In-memory streaming client.
//!
//! Queued items are recorded in a history that is replayed to every new
//! subscriber and fanned out live to subscribers that are already connected.
//! Used by the demo binary and by tests to drive materializers.

use super::{EventStream, StreamingClient, SubscribeRequest};
use crate::core::event::StreamItem;
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

#[derive(Default)]
struct ClientState {
    history: Vec<StreamItem>,
    subscribers: Vec<mpsc::UnboundedSender<Result<StreamItem>>>,
    requests: Vec<SubscribeRequest>,
}

/// Streaming client backed by an in-process queue
#[derive(Default)]
pub struct InMemoryStreamingClient {
    state: Mutex<ClientState>,
}

impl InMemoryStreamingClient {
    /// Create a client with an empty history
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append items to the history and deliver them to live subscribers
    pub fn queue_events(&self, items: impl IntoIterator<Item = StreamItem>) {
        let mut state = self.state();
        for item in items {
            state
                .subscribers
                .retain(|tx| tx.send(Ok(item.clone())).is_ok());
            state.history.push(item);
        }
    }

    /// Fail every live subscription with `err`.
    ///
    /// The error is not recorded in the history, so later subscribers replay
    /// cleanly.
    pub fn queue_error(&self, err: Error) {
        let mut state = self.state();
        for tx in state.subscribers.drain(..) {
            let _ = tx.send(Err(err.clone()));
        }
    }

    /// Every subscribe request received so far, in order
    pub fn subscriptions(&self) -> Vec<SubscribeRequest> {
        self.state().requests.clone()
    }

    /// Number of subscriptions whose stream is still being consumed
    pub fn active_subscribers(&self) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }
}

#[async_trait]
impl StreamingClient for InMemoryStreamingClient {
    async fn subscribe(&self, request: SubscribeRequest) -> Result<EventStream> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state();

        let from = request.index;
        for item in &state.history {
            let replay = match item {
                _ if from == 0 => true,
                StreamItem::Events { index, .. } => *index > from,
                _ => false,
            };
            if replay {
                let _ = tx.send(Ok(item.clone()));
            }
        }
        tracing::debug!(
            topic = %request.topic,
            key = %request.key,
            index = from,
            "in-memory subscription opened"
        );
        state.requests.push(request);
        state.subscribers.push(tx);

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }
}
