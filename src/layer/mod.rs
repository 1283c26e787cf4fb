//! Channel layer interface.
//!
//! This module contains:
//! - `ChannelLayer` trait: send/receive on named channels and group fan-out
//! - `GroupSendResult`: per-member outcome of a broadcast
//! - Implementations: `AmqpChannelLayer` (broker backed), `MockChannelLayer`

use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::codec::Message;
use crate::error::{LayerError, Result};
use crate::provision::QueueProvisioner;

pub mod amqp;
pub mod mock;

pub use amqp::{AmqpChannelLayer, SweepReport};
pub use mock::MockChannelLayer;

/// Optional feature sets a layer may support.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extension {
    /// `group_add`, `group_discard`, `send_group`, `group_channels`.
    Groups,
    /// `flush`.
    Flush,
}

/// Outcome of `send_group`. Failures are isolated per member.
#[derive(Debug, Default)]
pub struct GroupSendResult {
    /// Members the message was enqueued for.
    pub delivered: Vec<String>,
    /// Members that could not take the message, with the reason.
    pub failed: Vec<(String, LayerError)>,
}

impl GroupSendResult {
    /// True when every live member received the message.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Interface the application framework talks to.
///
/// Implementations:
/// - `AmqpChannelLayer`: RabbitMQ queues (or the in-memory emulation)
/// - `MockChannelLayer`: recording layer for tests
#[async_trait]
pub trait ChannelLayer: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Extensions this layer supports.
    fn extensions(&self) -> &'static [Extension];

    /// Queue provisioning capability; `None` for layers without broker queues.
    fn provisioner(&self) -> Option<&dyn QueueProvisioner> {
        None
    }

    /// Send `message` to `channel`.
    ///
    /// Fails with `CapacityExceeded` when the channel is full.
    async fn send(&self, channel: &str, message: &Message) -> Result<()>;

    /// Take one message from any of `channels`.
    ///
    /// Returns `None` when nothing is available. With `block`, waits up to
    /// the configured timeout first.
    async fn receive(&self, channels: &[&str], block: bool) -> Result<Option<(String, Message)>>;

    /// Create a new uniquely named channel rooted at `prefix`.
    async fn new_channel(&self, prefix: &str) -> Result<String>;

    /// Add `channel` to `group`, or refresh its membership.
    async fn group_add(&self, group: &str, channel: &str) -> Result<()>;

    /// Remove `channel` from `group`. Not an error if it is not a member.
    async fn group_discard(&self, group: &str, channel: &str) -> Result<()>;

    /// Send `message` to every live member of `group`.
    async fn send_group(&self, group: &str, message: &Message) -> Result<GroupSendResult>;

    /// Live members of `group`.
    async fn group_channels(&self, group: &str) -> Result<BTreeSet<String>>;

    /// Drop every channel message and group membership this layer knows.
    async fn flush(&self) -> Result<()>;

    /// Release the connection and background work.
    async fn close(&self) -> Result<()>;
}
