use std::sync::Arc;
use std::time::Duration;

use lib_sync::coordinator::ResourceDescriptor;
use lib_sync::core::Subscription;
use lib_sync::ingestors::Priority;
use lib_sync::retrieve::{http_fetcher, ApiClient};
use serde::{Deserialize, Serialize};

/// One HTTP-backed resource the agent keeps in sync.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSpec {
    /// Cache and registry key.
    pub key: String,
    /// Path relative to the API base URL.
    pub path: String,
    /// Push channel; `type` or `type:id`.
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default)]
    pub interval_ms: Option<u64>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub ttl_ms: Option<u64>,
    #[serde(default)]
    pub urgent_events: Vec<String>,
    #[serde(default = "default_polling")]
    pub polling: bool,
}

fn default_polling() -> bool {
    true
}

impl ResourceSpec {
    pub fn subscription(&self) -> Option<Subscription> {
        let channel = self.channel.as_deref()?;
        Some(match channel.split_once(':') {
            Some((resource_type, id)) if !id.is_empty() => Subscription::new(resource_type).with_id(id),
            Some((resource_type, _)) => Subscription::new(resource_type),
            None => Subscription::new(channel),
        })
    }

    pub fn descriptor(&self, client: Arc<ApiClient>) -> ResourceDescriptor {
        let mut descriptor =
            ResourceDescriptor::with_fetcher(self.key.clone(), http_fetcher(client, self.path.clone()))
                .priority(self.priority)
                .urgent_events(&self.urgent_events);

        if let Some(subscription) = self.subscription() {
            descriptor = descriptor.subscribe(subscription);
        }
        if let Some(ms) = self.interval_ms {
            descriptor = descriptor.interval(Duration::from_millis(ms));
        }
        if let Some(ms) = self.ttl_ms {
            descriptor = descriptor.ttl(Duration::from_millis(ms));
        }
        if !self.polling {
            descriptor = descriptor.without_polling();
        }
        descriptor
    }
}
