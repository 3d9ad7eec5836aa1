//! Event types delivered by a streaming subscription

use serde::{Deserialize, Serialize};
use std::fmt;

/// Topic an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Topic {
    /// Health of service instances
    ServiceHealth,
    /// Health of service instances behind a connect proxy
    ServiceHealthConnect,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::ServiceHealth => write!(f, "service_health"),
            Topic::ServiceHealthConnect => write!(f, "service_health_connect"),
        }
    }
}

/// Catalog operation carried by a health event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CatalogOp {
    Register,
    Deregister,
}

/// A service instance registered on a node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceNode {
    /// Node name
    pub node: String,
    /// Service instance ID
    pub service_id: String,
    /// Logical service name
    pub service: String,
    /// Address the instance listens on
    pub address: String,
    /// Port the instance listens on
    pub port: u16,
}

impl ServiceNode {
    /// Create a service node with the instance ID equal to the service name
    pub fn new(node: impl Into<String>, service: impl Into<String>) -> Self {
        let service = service.into();
        Self {
            node: node.into(),
            service_id: service.clone(),
            service,
            address: String::new(),
            port: 0,
        }
    }

    /// Set the listening address
    pub fn with_address(mut self, address: impl Into<String>, port: u16) -> Self {
        self.address = address.into();
        self.port = port;
        self
    }

    /// Identity of the instance across events: node plus service ID
    pub fn unique_id(&self) -> String {
        format!("{}/{}", self.node, self.service_id)
    }
}

/// Health change for one service instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceHealthUpdate {
    pub op: CatalogOp,
    pub node: ServiceNode,
}

/// Event payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// A service health registration change
    ServiceHealth(ServiceHealthUpdate),
    /// A payload this crate does not interpret, kept opaque
    Other {
        kind: String,
        data: serde_json::Value,
    },
}

impl Payload {
    /// Short name of the payload variant, for logs and errors
    pub fn kind(&self) -> &str {
        match self {
            Payload::ServiceHealth(_) => "service_health",
            Payload::Other { kind, .. } => kind,
        }
    }
}

/// One event applied to a view
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Raft-style index at which the change was committed
    pub index: u64,
    /// Event payload
    pub payload: Payload,
}

impl Event {
    /// Create a new event
    pub fn new(index: u64, payload: Payload) -> Self {
        Self { index, payload }
    }

    /// Register a service instance
    pub fn register(index: u64, node: ServiceNode) -> Self {
        Self::new(
            index,
            Payload::ServiceHealth(ServiceHealthUpdate {
                op: CatalogOp::Register,
                node,
            }),
        )
    }

    /// Deregister a service instance
    pub fn deregister(index: u64, node: ServiceNode) -> Self {
        Self::new(
            index,
            Payload::ServiceHealth(ServiceHealthUpdate {
                op: CatalogOp::Deregister,
                node,
            }),
        )
    }
}

/// Item yielded by a subscription stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "item", rename_all = "snake_case")]
pub enum StreamItem {
    /// Events committed together at `index`
    Events { index: u64, events: Vec<Event> },
    /// The initial full state has been delivered up to `index`
    EndOfSnapshot { index: u64 },
    /// The server cannot resume from the requested index; a full snapshot follows
    NewSnapshotToFollow,
}

impl StreamItem {
    /// A batch holding a single event
    pub fn event(event: Event) -> Self {
        StreamItem::Events {
            index: event.index,
            events: vec![event],
        }
    }

    /// Snapshot-complete marker
    pub fn end_of_snapshot(index: u64) -> Self {
        StreamItem::EndOfSnapshot { index }
    }

    /// Index carried by the item, if any
    pub fn index(&self) -> Option<u64> {
        match self {
            StreamItem::Events { index, .. } | StreamItem::EndOfSnapshot { index } => Some(*index),
            StreamItem::NewSnapshotToFollow => None,
        }
    }
}
