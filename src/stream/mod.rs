//! Streaming subscription client contract.
//!
//! A [`StreamingClient`] turns a [`SubscribeRequest`] into an ordered stream of
//! [`StreamItem`]s. The stream is lazy and unbounded; it may fail at any point,
//! after which the caller resubscribes.

pub mod memory;

pub use memory::InMemoryStreamingClient;

use crate::core::event::{StreamItem, Topic};
use crate::error::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// Boxed stream returned by [`StreamingClient::subscribe`].
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamItem>> + Send>>;

/// Parameters of a single subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub topic: Topic,
    pub key: String,
    pub token: String,
    pub datacenter: String,
    pub namespace: String,
    /// Index to resume from; zero requests a full snapshot
    pub index: u64,
}

/// Source of ordered events for a subscription.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StreamingClient: Send + Sync {
    /// Open a subscription. Errors from the returned stream are transport
    /// failures; [`crate::error::Error::StreamReset`] asks for a full resync.
    async fn subscribe(&self, request: SubscribeRequest) -> Result<EventStream>;
}
