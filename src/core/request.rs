//! Request contract between callers and the store

use crate::error::Result;
use crate::storage::materializer::MaterializerDeps;
use crate::storage::materialized_view::View;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Cache-relevant fields of a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheInfo {
    /// Target key (service name, etc.)
    pub key: String,
    /// ACL token the view is materialized for
    pub token: String,
    pub datacenter: String,
    pub namespace: String,
    /// Upper bound on how long a blocking read may wait; zero means no bound
    pub timeout: Duration,
    /// The read is satisfied once the view index exceeds this value
    pub min_index: u64,
}

/// A query that can be served from a materialized view
pub trait Request: Send + Sync {
    /// View type that materializes this request
    type View: View;

    /// Cache-relevant fields of this request
    fn cache_info(&self) -> CacheInfo;

    /// Identifier of the request kind, part of the fingerprint
    fn kind(&self) -> &str;

    /// Build the view and subscription dependencies for a new entry
    fn new_materializer(&self) -> Result<MaterializerDeps<Self::View>>;
}

/// Deterministic cache key for a request.
///
/// Fields are length-prefixed before hashing so distinct tuples never
/// collide by concatenation, and the token never appears in clear text.
pub fn fingerprint(kind: &str, info: &CacheInfo) -> String {
    let mut hasher = Sha256::new();
    for field in [&info.datacenter, &info.namespace, &info.token, &info.key] {
        hasher.update((field.len() as u64).to_be_bytes());
        hasher.update(field.as_bytes());
    }
    format!("{}/{:x}", kind, hasher.finalize())
}

/// Value returned by a satisfied read
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheResult<T> {
    pub value: T,
    /// Index the value was materialized at
    pub index: u64,
}

/// Update pushed to a `Notify` subscriber
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent<T> {
    /// Caller-chosen ID used to demultiplex updates on a shared channel
    pub correlation_id: String,
    pub result: Result<CacheResult<T>>,
}
