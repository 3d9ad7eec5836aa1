//! Service health requests

use crate::core::event::Topic;
use crate::core::request::{CacheInfo, Request};
use crate::error::{Error, Result};
use crate::storage::materialized_view::ServiceHealthView;
use crate::storage::materializer::MaterializerDeps;
use crate::stream::{StreamingClient, SubscribeRequest};
use std::sync::Arc;
use std::time::Duration;

/// Blocking query for the healthy instances of one service
#[derive(Clone)]
pub struct ServiceHealthRequest {
    pub service: String,
    pub token: String,
    pub datacenter: String,
    pub namespace: String,
    /// Query instances behind connect proxies instead of the service itself
    pub connect: bool,
    pub min_index: u64,
    pub timeout: Duration,
    client: Arc<dyn StreamingClient>,
}

impl ServiceHealthRequest {
    pub fn new(service: impl Into<String>, client: Arc<dyn StreamingClient>) -> Self {
        Self {
            service: service.into(),
            token: String::new(),
            datacenter: String::new(),
            namespace: String::new(),
            connect: false,
            min_index: 0,
            timeout: Duration::ZERO,
            client,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = token.into();
        self
    }

    pub fn with_datacenter(mut self, datacenter: impl Into<String>) -> Self {
        self.datacenter = datacenter.into();
        self
    }

    pub fn with_min_index(mut self, index: u64) -> Self {
        self.min_index = index;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn connect(mut self) -> Self {
        self.connect = true;
        self
    }

    fn topic(&self) -> Topic {
        if self.connect {
            Topic::ServiceHealthConnect
        } else {
            Topic::ServiceHealth
        }
    }
}

impl Request for ServiceHealthRequest {
    type View = ServiceHealthView;

    fn cache_info(&self) -> CacheInfo {
        CacheInfo {
            key: self.service.clone(),
            token: self.token.clone(),
            datacenter: self.datacenter.clone(),
            namespace: self.namespace.clone(),
            timeout: self.timeout,
            min_index: self.min_index,
        }
    }

    fn kind(&self) -> &str {
        match self.topic() {
            Topic::ServiceHealth => "service-health",
            Topic::ServiceHealthConnect => "service-health-connect",
        }
    }

    fn new_materializer(&self) -> Result<MaterializerDeps<ServiceHealthView>> {
        if self.service.is_empty() {
            return Err(Error::Construction(
                "service health request needs a service name".to_string(),
            ));
        }
        let template = SubscribeRequest {
            topic: self.topic(),
            key: self.service.clone(),
            token: self.token.clone(),
            datacenter: self.datacenter.clone(),
            namespace: self.namespace.clone(),
            index: 0,
        };
        Ok(MaterializerDeps::new(
            ServiceHealthView::new(),
            self.client.clone(),
            move |index| SubscribeRequest {
                index,
                ..template.clone()
            },
        ))
    }
}
