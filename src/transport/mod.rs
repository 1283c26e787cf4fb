//! Broker transport abstraction.
//!
//! The channel layer only needs a handful of broker primitives: queues with a
//! length limit and an idle expiry, per-message TTL, publisher confirms,
//! polling gets, fanout exchanges with bindings, and notification of expired
//! messages. `Transport` captures exactly those.
//!
//! Implementations:
//! - `AmqpTransport`: RabbitMQ via lapin, one connection and one channel
//! - `MemoryTransport`: in-process emulation for standalone use and tests

use std::collections::BTreeSet;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{LayerError, Result};

pub mod amqp;
pub mod memory;
pub mod params;

pub use amqp::AmqpTransport;
pub use memory::MemoryTransport;
pub use params::ConnectionParams;

/// What the broker does with a publish to a full queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    /// Refuse the new message (`reject-publish`).
    RejectPublish,
    /// Discard the oldest message to make room (`drop-head`).
    DropHead,
}

impl Overflow {
    /// Value of the `x-overflow` queue argument.
    pub fn as_str(&self) -> &'static str {
        match self {
            Overflow::RejectPublish => "reject-publish",
            Overflow::DropHead => "drop-head",
        }
    }
}

/// Declaration parameters of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Broker-side queue name.
    pub name: String,
    /// Maximum number of queued messages.
    pub capacity: u32,
    /// The broker deletes the queue after it has been unused this long.
    pub idle_expiry: Duration,
    pub overflow: Overflow,
    /// Route messages that expire in this queue to the expiry exchange.
    pub dead_letter: bool,
}

/// Broker verdict on a queue declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclareOutcome {
    /// Created, or already present with the same arguments.
    Declared,
    /// Already present with different arguments; the existing queue is kept
    /// as it is.
    Conflict,
}

/// Broker verdict on a single publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Enqueued.
    Accepted,
    /// Queue at its length limit; message dropped by the broker.
    Rejected,
    /// Queue does not exist (never declared or auto-deleted).
    Unroutable,
}

/// Result of polling a queue once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch {
    Message(Vec<u8>),
    Empty,
    /// The queue does not exist on the broker.
    Missing,
}

/// Broker primitives used by the channel layer.
///
/// Implementations serialize protocol operations internally: callers may
/// share one transport between tasks. Everything a transport stores lives on
/// the broker, so layers on separate transports to the same broker observe
/// the same queues, bindings and expiry notifications.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Short backend name for logs.
    fn kind(&self) -> &'static str;

    /// Whether the underlying connection is still usable.
    fn is_connected(&self) -> bool;

    /// Fail with `LayerError::Connection` when the connection is gone.
    fn ensure_alive(&self) -> Result<()> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(LayerError::Connection(format!(
                "{} connection is closed",
                self.kind()
            )))
        }
    }

    /// Declare a queue. A queue that already exists with other arguments is
    /// left untouched and reported as `DeclareOutcome::Conflict`.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<DeclareOutcome>;

    /// Current message count, or `None` if the queue does not exist.
    async fn queue_depth(&self, queue: &str) -> Result<Option<u32>>;

    /// Publish `body` to `queue` with a per-message TTL and wait for the
    /// broker's verdict.
    async fn publish(&self, queue: &str, body: &[u8], ttl: Duration) -> Result<PublishOutcome>;

    /// Take the oldest message from `queue` without waiting.
    async fn fetch(&self, queue: &str) -> Result<Fetch>;

    /// Delete `queue` and its bindings. Missing queues are ignored.
    async fn delete(&self, queue: &str) -> Result<()>;

    /// Delete `queue` only if it holds no messages. Returns whether it was
    /// deleted.
    async fn delete_if_empty(&self, queue: &str) -> Result<bool>;

    /// Declare a fanout exchange. Idempotent.
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    /// Delete an exchange and its bindings. Missing exchanges are ignored.
    async fn delete_exchange(&self, exchange: &str) -> Result<()>;

    /// Bind `queue` to `exchange`. Returns `false` when either is missing.
    async fn bind(&self, queue: &str, exchange: &str) -> Result<bool>;

    /// Remove the binding. Missing bindings, queues and exchanges are ignored.
    async fn unbind(&self, queue: &str, exchange: &str) -> Result<()>;

    /// Queues bound to `exchange`; empty when the exchange does not exist.
    async fn bindings(&self, exchange: &str) -> Result<BTreeSet<String>>;

    /// Names of queues that lost a message to TTL expiry, one entry per
    /// expired message. Notifications are shared by every transport on the
    /// broker and each one is handed out once.
    async fn drain_expired(&self) -> Result<Vec<String>>;

    /// Close the connection.
    async fn close(&self) -> Result<()>;
}
