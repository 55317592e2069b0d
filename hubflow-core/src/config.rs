//! Hub identity and runtime tunables.

use std::time::Duration;

use serde::Deserialize;

/// Group name used when the caller does not specify one.
pub const DEFAULT_CONSUMER_GROUP: &str = "$Default";

pub(crate) const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(15);

/// Shared-access policy used to mint authorization tokens for a hub.
#[derive(Clone, PartialEq, Deserialize)]
pub struct SharedAccessPolicy {
    pub name: String,
    pub key: String,
}

impl std::fmt::Debug for SharedAccessPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedAccessPolicy")
            .field("name", &self.name)
            .field("key", &"****")
            .finish()
    }
}

/// Identity of one event hub inside a service namespace. Immutable; the
/// derived endpoint URIs are pure functions of the identity.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HubConfig {
    pub namespace: String,
    pub hub_name: String,
    pub policy: SharedAccessPolicy,
}

impl HubConfig {
    pub fn base_https_uri(&self) -> String {
        format!(
            "https://{}.servicebus.windows.net/{}/",
            self.namespace, self.hub_name
        )
    }

    pub fn base_amqp_uri(&self) -> String {
        format!(
            "amqps://{}.servicebus.windows.net/{}/",
            self.namespace, self.hub_name
        )
    }

    /// Source address of one partition's receive link for a consumer group.
    pub fn subscribe_uri(&self, group: &ConsumerGroup, partition_id: &str) -> String {
        format!(
            "{}ConsumerGroups/{}/Partitions/{}",
            self.base_amqp_uri(),
            group.as_str(),
            partition_id
        )
    }

    /// Dedicated send address of one partition.
    pub fn partition_send_uri(&self, partition_id: &str) -> String {
        format!("{}Partitions/{}", self.base_amqp_uri(), partition_id)
    }

    /// Hub-level send address; the broker routes by partition key.
    pub fn hub_send_uri(&self) -> String {
        self.base_amqp_uri()
    }
}

/// Named, independent cursor position over all of a hub's partitions.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(transparent)]
pub struct ConsumerGroup(String);

impl ConsumerGroup {
    pub fn new(name: impl Into<String>) -> Self {
        ConsumerGroup(name.into())
    }

    /// Absent or empty group names normalize to the service default group.
    pub fn normalize(name: Option<&str>) -> Self {
        match name {
            Some(name) if !name.is_empty() => ConsumerGroup(name.to_string()),
            _ => ConsumerGroup(DEFAULT_CONSUMER_GROUP.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for ConsumerGroup {
    fn default() -> Self {
        ConsumerGroup(DEFAULT_CONSUMER_GROUP.to_string())
    }
}

impl std::fmt::Display for ConsumerGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Controls how in-memory partition state is persisted.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CheckpointConfig {
    /// Interval between background flushes. `Duration::ZERO` disables the
    /// scheduler; state is then only persisted by explicit flush calls.
    #[serde(default = "default_flush_interval")]
    pub flush_interval: Duration,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        CheckpointConfig {
            flush_interval: DEFAULT_FLUSH_INTERVAL,
        }
    }
}

fn default_flush_interval() -> Duration {
    DEFAULT_FLUSH_INTERVAL
}
