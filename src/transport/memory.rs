//! In-memory transport emulating the RabbitMQ features the layer relies on.
//!
//! Per-message TTL (expired at the head of the queue, like RabbitMQ),
//! `x-max-length` with reject-publish or drop-head overflow, `x-expires` idle
//! deletion, fanout exchanges with bindings, dead-letter notification on
//! expiry, unroutable publishes to missing queues, and the refusal to
//! redeclare a queue with different arguments. Uses tokio's clock so tests
//! can pause and advance time.
//!
//! Layers sharing one `MemoryTransport` behave like processes sharing one
//! broker.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use super::{DeclareOutcome, Fetch, Overflow, PublishOutcome, QueueSpec, Transport};
use crate::error::Result;

struct MemoryQueue {
    capacity: u32,
    idle_expiry: Duration,
    overflow: Overflow,
    dead_letter: bool,
    messages: VecDeque<(Instant, Vec<u8>)>,
    last_used: Instant,
}

impl MemoryQueue {
    fn matches(&self, spec: &QueueSpec) -> bool {
        self.capacity == spec.capacity
            && self.idle_expiry == spec.idle_expiry
            && self.overflow == spec.overflow
            && self.dead_letter == spec.dead_letter
    }
}

#[derive(Default)]
struct MemoryState {
    queues: HashMap<String, MemoryQueue>,
    /// Exchange name to bound queue names.
    exchanges: HashMap<String, BTreeSet<String>>,
    /// The broker-wide dead-letter queue.
    expired: VecDeque<String>,
}

impl MemoryState {
    /// Apply TTL and idle expiry as of `now`.
    fn expire(&mut self, now: Instant) {
        let MemoryState {
            queues,
            exchanges,
            expired,
        } = self;

        for (name, queue) in queues.iter_mut() {
            while matches!(queue.messages.front(), Some((deadline, _)) if *deadline <= now) {
                queue.messages.pop_front();
                if queue.dead_letter {
                    expired.push_back(name.clone());
                }
            }
        }

        let mut removed = Vec::new();
        queues.retain(|name, queue| {
            let keep = now.duration_since(queue.last_used) < queue.idle_expiry;
            if !keep {
                debug!(queue = %name, "Idle queue expired");
                removed.push(name.clone());
            }
            keep
        });
        for name in removed {
            Self::unbind_everywhere(exchanges, &name);
        }
    }

    fn remove_queue(&mut self, name: &str) -> bool {
        let removed = self.queues.remove(name).is_some();
        Self::unbind_everywhere(&mut self.exchanges, name);
        removed
    }

    fn unbind_everywhere(exchanges: &mut HashMap<String, BTreeSet<String>>, queue: &str) {
        for bound in exchanges.values_mut() {
            bound.remove(queue);
        }
    }
}

/// Broker emulation for standalone mode and tests.
pub struct MemoryTransport {
    state: Mutex<MemoryState>,
    connected: AtomicBool,
}

impl Default for MemoryTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryTransport {
    pub fn new() -> Self {
        info!("Memory transport initialized");
        Self {
            state: Mutex::new(MemoryState::default()),
            connected: AtomicBool::new(true),
        }
    }

    /// Simulate connection loss. Every later operation fails with
    /// `LayerError::Connection`.
    pub fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    /// Names of the queues that currently exist.
    pub async fn queue_names(&self) -> BTreeSet<String> {
        let mut state = self.state.lock().await;
        state.expire(Instant::now());
        state.queues.keys().cloned().collect()
    }

    /// Names of the exchanges that currently exist.
    pub async fn exchange_names(&self) -> BTreeSet<String> {
        self.state.lock().await.exchanges.keys().cloned().collect()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> &'static str {
        "memory"
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<DeclareOutcome> {
        self.ensure_alive()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.expire(now);

        let queue = state
            .queues
            .entry(spec.name.clone())
            .or_insert_with(|| MemoryQueue {
                capacity: spec.capacity,
                idle_expiry: spec.idle_expiry,
                overflow: spec.overflow,
                dead_letter: spec.dead_letter,
                messages: VecDeque::new(),
                last_used: now,
            });
        queue.last_used = now;

        Ok(if queue.matches(spec) {
            DeclareOutcome::Declared
        } else {
            DeclareOutcome::Conflict
        })
    }

    async fn queue_depth(&self, queue: &str) -> Result<Option<u32>> {
        self.ensure_alive()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.expire(now);

        Ok(state.queues.get_mut(queue).map(|queue| {
            queue.last_used = now;
            queue.messages.len() as u32
        }))
    }

    async fn publish(&self, queue: &str, body: &[u8], ttl: Duration) -> Result<PublishOutcome> {
        self.ensure_alive()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.expire(now);

        // Publishing does not count as use for idle expiry.
        let Some(queue) = state.queues.get_mut(queue) else {
            return Ok(PublishOutcome::Unroutable);
        };
        if queue.messages.len() >= queue.capacity as usize {
            match queue.overflow {
                Overflow::RejectPublish => return Ok(PublishOutcome::Rejected),
                Overflow::DropHead => {
                    queue.messages.pop_front();
                }
            }
        }
        queue.messages.push_back((now + ttl, body.to_vec()));
        Ok(PublishOutcome::Accepted)
    }

    async fn fetch(&self, queue: &str) -> Result<Fetch> {
        self.ensure_alive()?;
        let now = Instant::now();
        let mut state = self.state.lock().await;
        state.expire(now);

        let Some(queue) = state.queues.get_mut(queue) else {
            return Ok(Fetch::Missing);
        };
        queue.last_used = now;
        Ok(match queue.messages.pop_front() {
            Some((_, body)) => Fetch::Message(body),
            None => Fetch::Empty,
        })
    }

    async fn delete(&self, queue: &str) -> Result<()> {
        self.ensure_alive()?;
        self.state.lock().await.remove_queue(queue);
        Ok(())
    }

    async fn delete_if_empty(&self, queue: &str) -> Result<bool> {
        self.ensure_alive()?;
        let mut state = self.state.lock().await;
        state.expire(Instant::now());

        let empty = state.queues.get(queue).map(|q| q.messages.is_empty());
        Ok(empty == Some(true) && state.remove_queue(queue))
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_alive()?;
        self.state
            .lock()
            .await
            .exchanges
            .entry(exchange.to_string())
            .or_default();
        Ok(())
    }

    async fn delete_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_alive()?;
        self.state.lock().await.exchanges.remove(exchange);
        Ok(())
    }

    async fn bind(&self, queue: &str, exchange: &str) -> Result<bool> {
        self.ensure_alive()?;
        let mut state = self.state.lock().await;
        state.expire(Instant::now());

        if !state.queues.contains_key(queue) {
            return Ok(false);
        }
        Ok(match state.exchanges.get_mut(exchange) {
            Some(bound) => {
                bound.insert(queue.to_string());
                true
            }
            None => false,
        })
    }

    async fn unbind(&self, queue: &str, exchange: &str) -> Result<()> {
        self.ensure_alive()?;
        if let Some(bound) = self.state.lock().await.exchanges.get_mut(exchange) {
            bound.remove(queue);
        }
        Ok(())
    }

    async fn bindings(&self, exchange: &str) -> Result<BTreeSet<String>> {
        self.ensure_alive()?;
        let mut state = self.state.lock().await;
        state.expire(Instant::now());
        Ok(state.exchanges.get(exchange).cloned().unwrap_or_default())
    }

    async fn drain_expired(&self) -> Result<Vec<String>> {
        self.ensure_alive()?;
        let mut state = self.state.lock().await;
        state.expire(Instant::now());
        Ok(state.expired.drain(..).collect())
    }

    async fn close(&self) -> Result<()> {
        self.disconnect();
        Ok(())
    }
}
