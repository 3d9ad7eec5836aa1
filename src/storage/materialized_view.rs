//! Materialized views folded from stream events.
//!
//! A [`View`] owns all domain state for one cache entry. It is mutated only by
//! the materializer that owns it; readers get owned snapshots from
//! [`View::result`], never references into live state.

use crate::core::event::{CatalogOp, Event, Payload, ServiceNode};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Accumulator over an ordered event stream.
pub trait View: Send + 'static {
    /// Snapshot handed to readers
    type Output: Clone + Send + Sync + 'static;

    /// Apply events in stream order. An error is fatal for the materializer.
    fn update(&mut self, events: &[Event]) -> Result<()>;

    /// Snapshot of the current state at `index`
    fn result(&self, index: u64) -> Self::Output;

    /// Drop all state ahead of a new snapshot
    fn reset(&mut self);
}

/// Healthy instances of a service as of an index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealthResult {
    /// Instances ordered by unique ID
    pub nodes: Vec<ServiceNode>,
    pub index: u64,
}

/// View of registered service instances keyed by node and service ID.
#[derive(Debug, Default)]
pub struct ServiceHealthView {
    nodes: BTreeMap<String, ServiceNode>,
}

impl ServiceHealthView {
    /// Create an empty view
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl View for ServiceHealthView {
    type Output = ServiceHealthResult;

    fn update(&mut self, events: &[Event]) -> Result<()> {
        for event in events {
            let Payload::ServiceHealth(update) = &event.payload else {
                return Err(Error::View(format!(
                    "unexpected event type for service health view: {}",
                    event.payload.kind()
                )));
            };
            let id = update.node.unique_id();
            match update.op {
                CatalogOp::Register => {
                    self.nodes.insert(id, update.node.clone());
                }
                CatalogOp::Deregister => {
                    self.nodes.remove(&id);
                }
            }
        }
        Ok(())
    }

    fn result(&self, index: u64) -> ServiceHealthResult {
        ServiceHealthResult {
            nodes: self.nodes.values().cloned().collect(),
            index,
        }
    }

    fn reset(&mut self) {
        self.nodes.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_deregister() {
        let mut view = ServiceHealthView::new();
        view.update(&[
            Event::register(10, ServiceNode::new("node1", "web")),
            Event::register(11, ServiceNode::new("node2", "web")),
        ])
        .unwrap();
        assert_eq!(view.len(), 2);

        view.update(&[Event::deregister(12, ServiceNode::new("node1", "web"))])
            .unwrap();
        let result = view.result(12);
        assert_eq!(result.index, 12);
        assert_eq!(result.nodes, vec![ServiceNode::new("node2", "web")]);
    }

    #[test]
    fn test_reregister_replaces_instance() {
        let mut view = ServiceHealthView::new();
        view.update(&[
            Event::register(10, ServiceNode::new("node1", "web")),
            Event::register(22, ServiceNode::new("node1", "web").with_address("10.0.0.1", 8080)),
        ])
        .unwrap();

        let result = view.result(22);
        assert_eq!(result.nodes.len(), 1);
        assert_eq!(result.nodes[0].port, 8080);
    }

    #[test]
    fn test_result_is_a_snapshot() {
        let mut view = ServiceHealthView::new();
        view.update(&[Event::register(10, ServiceNode::new("node1", "web"))])
            .unwrap();
        let before = view.result(10);

        view.reset();
        assert!(view.is_empty());
        assert_eq!(before.nodes.len(), 1);
    }

    #[test]
    fn test_rejects_foreign_payload() {
        let mut view = ServiceHealthView::new();
        let err = view
            .update(&[Event::new(
                5,
                Payload::Other {
                    kind: "kv".to_string(),
                    data: serde_json::json!({"key": "a"}),
                },
            )])
            .unwrap_err();
        assert!(matches!(err, Error::View(msg) if msg.contains("kv")));
    }
}
