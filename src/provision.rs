//! Queue provisioning.
//!
//! Maps channel names to broker queues and declares them lazily, once per
//! layer instance. `declare_all` is the hook worker startup calls with the
//! statically known channel names so that messages published before the
//! consumer starts are kept.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::LayerConfig;
use crate::error::Result;
use crate::layer::ChannelLayer;
use crate::names;
use crate::transport::{DeclareOutcome, Overflow, QueueSpec, Transport};

/// A declared channel queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueHandle {
    pub channel: String,
    pub queue: String,
    pub capacity: u32,
    /// TTL applied to every message published to this channel.
    pub expiry: Duration,
}

/// Capability exposed by layers whose channels live in broker queues.
#[async_trait]
pub trait QueueProvisioner: Send + Sync {
    /// Declare the queue behind `channel` unless this instance already did.
    async fn ensure_channel_queue(&self, channel: &str) -> Result<QueueHandle>;

    /// Declare every channel in `channels`. Returns how many were new to this instance.
    async fn declare_all(&self, channels: &BTreeSet<String>) -> Result<usize>;
}

/// Declare queues for `channels` if `layer` is broker backed; otherwise do nothing.
///
/// Safe to call unconditionally from worker startup.
pub async fn declare_all(layer: &dyn ChannelLayer, channels: &BTreeSet<String>) -> Result<usize> {
    match layer.provisioner() {
        Some(provisioner) => provisioner.declare_all(channels).await,
        None => {
            debug!(
                backend = layer.backend(),
                "Channel layer has no queue provisioning, skipping declare"
            );
            Ok(0)
        }
    }
}

/// Per-instance queue naming and declaration cache.
pub struct Provisioner {
    transport: Arc<dyn Transport>,
    prefix: String,
    capacity: u32,
    expiry: Duration,
    idle_expiry: Duration,
    declared: RwLock<HashSet<String>>,
}

impl Provisioner {
    pub fn new(transport: Arc<dyn Transport>, config: &LayerConfig) -> Self {
        Self {
            transport,
            prefix: config.queue_prefix.clone(),
            capacity: config.capacity,
            expiry: config.expiry(),
            idle_expiry: config.queue_idle_expiry(),
            declared: RwLock::new(HashSet::new()),
        }
    }

    /// Broker queue name for `channel`.
    pub fn queue_name(&self, channel: &str) -> String {
        format!("{}{}", self.prefix, channel)
    }

    /// Channel name for a queue this layer names, if it carries the prefix.
    pub fn channel_name<'a>(&self, queue: &'a str) -> Option<&'a str> {
        queue.strip_prefix(self.prefix.as_str())
    }

    fn handle(&self, channel: &str) -> QueueHandle {
        QueueHandle {
            channel: channel.to_string(),
            queue: self.queue_name(channel),
            capacity: self.capacity,
            expiry: self.expiry,
        }
    }

    /// Declare unconditionally, e.g. after the broker auto-deleted the queue.
    ///
    /// A queue already declared with other arguments, by an instance with
    /// different settings, is used as it stands.
    pub async fn redeclare(&self, channel: &str) -> Result<QueueHandle> {
        names::validate_channel(channel)?;
        let handle = self.handle(channel);
        let outcome = self
            .transport
            .declare_queue(&QueueSpec {
                name: handle.queue.clone(),
                capacity: self.capacity,
                idle_expiry: self.idle_expiry,
                overflow: Overflow::RejectPublish,
                dead_letter: true,
            })
            .await?;
        if outcome == DeclareOutcome::Conflict {
            warn!(
                channel = %channel,
                queue = %handle.queue,
                capacity = self.capacity,
                "Queue exists with other arguments, keeping them"
            );
        }
        self.declared.write().await.insert(channel.to_string());
        Ok(handle)
    }

    /// Drop the cache entry so the next use declares again.
    pub async fn forget(&self, channel: &str) {
        self.declared.write().await.remove(channel);
    }

    /// Channels declared by this instance.
    pub async fn known_channels(&self) -> BTreeSet<String> {
        self.declared.read().await.iter().cloned().collect()
    }

    pub async fn reset(&self) {
        self.declared.write().await.clear();
    }
}

#[async_trait]
impl QueueProvisioner for Provisioner {
    async fn ensure_channel_queue(&self, channel: &str) -> Result<QueueHandle> {
        if self.declared.read().await.contains(channel) {
            return Ok(self.handle(channel));
        }
        self.redeclare(channel).await
    }

    async fn declare_all(&self, channels: &BTreeSet<String>) -> Result<usize> {
        let mut declared = 0;
        for channel in channels {
            if self.declared.read().await.contains(channel) {
                continue;
            }
            self.redeclare(channel).await?;
            declared += 1;
        }

        info!(
            requested = channels.len(),
            declared, "Declared channel queues"
        );
        Ok(declared)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LayerError;
    use crate::transport::MemoryTransport;

    fn provisioner() -> (Arc<MemoryTransport>, Provisioner) {
        let transport = Arc::new(MemoryTransport::new());
        let config = LayerConfig::default().with_capacity(5);
        let provisioner = Provisioner::new(transport.clone(), &config);
        (transport, provisioner)
    }

    #[test]
    fn test_queue_naming_round_trip() {
        let (_, provisioner) = provisioner();
        assert_eq!(provisioner.queue_name("chat"), "burrow.chat");
        assert_eq!(provisioner.channel_name("burrow.chat"), Some("chat"));
        assert_eq!(provisioner.channel_name("other.chat"), None);
    }

    #[tokio::test]
    async fn test_ensure_declares_once() {
        let (transport, provisioner) = provisioner();

        let handle = provisioner.ensure_channel_queue("chat").await.unwrap();
        assert_eq!(handle.queue, "burrow.chat");
        assert_eq!(handle.capacity, 5);

        // Deleting behind the cache's back shows the second call is a no-op.
        transport.delete("burrow.chat").await.unwrap();
        provisioner.ensure_channel_queue("chat").await.unwrap();
        assert!(transport.queue_names().await.is_empty());

        provisioner.forget("chat").await;
        provisioner.ensure_channel_queue("chat").await.unwrap();
        assert!(transport.queue_names().await.contains("burrow.chat"));
    }

    #[tokio::test]
    async fn test_declare_all_is_idempotent() {
        let (transport, provisioner) = provisioner();
        let channels: BTreeSet<String> = ["http.request", "websocket.receive"]
            .into_iter()
            .map(String::from)
            .collect();

        assert_eq!(provisioner.declare_all(&channels).await.unwrap(), 2);
        let first = transport.queue_names().await;
        assert_eq!(provisioner.declare_all(&channels).await.unwrap(), 0);

        assert_eq!(transport.queue_names().await, first);
        assert_eq!(provisioner.known_channels().await, channels);
    }

    #[tokio::test]
    async fn test_queue_declared_with_other_settings_is_reused() {
        let (transport, provisioner) = provisioner();
        let roomier = Provisioner::new(
            transport.clone(),
            &LayerConfig::default().with_capacity(10),
        );

        provisioner.ensure_channel_queue("chat").await.unwrap();
        let handle = roomier.ensure_channel_queue("chat").await.unwrap();

        assert_eq!(handle.queue, "burrow.chat");
        assert_eq!(roomier.known_channels().await.len(), 1);
        assert_eq!(
            transport.queue_names().await,
            BTreeSet::from(["burrow.chat".to_string()])
        );
    }

    #[tokio::test]
    async fn test_rejects_invalid_channel() {
        let (_, provisioner) = provisioner();
        let err = provisioner
            .ensure_channel_queue("not valid")
            .await
            .unwrap_err();
        assert!(matches!(err, LayerError::InvalidName { kind: "channel", .. }));
    }
}
