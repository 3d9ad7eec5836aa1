//! In-process simulation behind `matview simulate`

use crate::api::ServiceHealthRequest;
use crate::config::StoreConfig;
use crate::core::event::{Event, ServiceNode, StreamItem};
use crate::error::{Error, Result};
use crate::storage::{ServiceHealthView, Store};
use crate::stream::InMemoryStreamingClient;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const CONCURRENT_READERS: usize = 8;
const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// What callers observed during a simulation
#[derive(Debug, Clone, Serialize)]
pub struct SimulationReport {
    /// Index of the completed snapshot
    pub snapshot_index: u64,
    /// Index seen by each concurrent first reader
    pub reader_indexes: Vec<u64>,
    /// Index the blocked reader woke up at
    pub blocked_reader_index: u64,
    /// Indexes pushed to the notify subscriber, in delivery order
    pub notify_indexes: Vec<u64>,
    /// Instances in the final view
    pub final_nodes: Vec<ServiceNode>,
    /// Subscriptions opened against the stream
    pub subscriptions: usize,
    /// Entries cached while callers were active
    pub entries_while_active: usize,
    /// Entries left once the idle TTL passed
    pub entries_after_ttl: usize,
}

async fn step<T>(fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
    tokio::time::timeout(STEP_TIMEOUT, fut)
        .await
        .unwrap_or(Err(Error::DeadlineExceeded))
}

/// Run readers and a subscriber against a store fed by an in-memory stream.
pub async fn simulate(config: StoreConfig, items: u64, updates: u64) -> Result<SimulationReport> {
    config.validate()?;
    let idle_ttl = config.idle_ttl;
    let client = Arc::new(InMemoryStreamingClient::new());
    let store: Store<ServiceHealthView> = Store::new(config);
    let stop = CancellationToken::new();
    tokio::spawn({
        let (store, stop) = (store.clone(), stop.clone());
        async move { store.run(stop).await }
    });

    client.queue_events((1..=items).map(|i| {
        StreamItem::event(Event::register(
            i,
            ServiceNode::new(format!("node{i}"), "web").with_address(format!("10.0.0.{i}"), 8080),
        ))
    }));
    let snapshot_index = items.max(1);
    client.queue_events([StreamItem::end_of_snapshot(snapshot_index)]);

    let request = ServiceHealthRequest::new("web", client.clone()).with_datacenter("dc1");
    let cancel = CancellationToken::new();

    let (tx, mut rx) = mpsc::channel(4);
    store.notify(cancel.clone(), &request, "simulate", tx)?;

    let readers: Vec<_> = (0..CONCURRENT_READERS)
        .map(|_| {
            let (store, request, cancel) = (store.clone(), request.clone(), cancel.clone());
            tokio::spawn(async move { store.get(&cancel, &request).await })
        })
        .collect();
    let mut reader_indexes = Vec::with_capacity(readers.len());
    for reader in readers {
        let result = step(async {
            reader
                .await
                .map_err(|e| Error::Io(format!("reader task failed: {e}")))?
        })
        .await?;
        reader_indexes.push(result.index);
    }

    let final_index = snapshot_index + updates;
    let blocked = tokio::spawn({
        let (store, cancel) = (store.clone(), cancel.clone());
        let request = request.clone().with_min_index(final_index.saturating_sub(1));
        async move { store.get(&cancel, &request).await }
    });

    for i in 1..=updates {
        let index = snapshot_index + i;
        let node = ServiceNode::new(format!("node{}", items + i), "web");
        let event = if i % 3 == 0 && items >= i / 3 {
            Event::deregister(index, ServiceNode::new(format!("node{}", i / 3), "web"))
        } else {
            Event::register(index, node)
        };
        client.queue_events([StreamItem::event(event)]);
    }
    let entries_while_active = store.len();

    let blocked_result = step(async {
        blocked
            .await
            .map_err(|e| Error::Io(format!("blocked reader task failed: {e}")))?
    })
    .await?;

    let mut notify_indexes = Vec::new();
    let mut final_nodes = Vec::new();
    while notify_indexes.last().copied().unwrap_or(0) < final_index {
        let update = step(async { rx.recv().await.ok_or(Error::Closed) }).await?;
        let result = update.result?;
        notify_indexes.push(result.index);
        final_nodes = result.value.nodes;
    }

    cancel.cancel();
    tokio::time::sleep(idle_ttl + Duration::from_millis(50)).await;
    let entries_after_ttl = store.len();
    stop.cancel();

    tracing::info!(
        snapshot_index,
        final_index,
        entries_after_ttl,
        "simulation finished"
    );

    Ok(SimulationReport {
        snapshot_index,
        reader_indexes,
        blocked_reader_index: blocked_result.index,
        notify_indexes,
        final_nodes,
        subscriptions: client.subscriptions().len(),
        entries_while_active,
        entries_after_ttl,
    })
}
