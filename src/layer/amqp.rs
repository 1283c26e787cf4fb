//! Queue-backed channel layer.
//!
//! Every channel is one broker queue named `<prefix><channel>`. Messages
//! carry a per-message TTL; queues are length limited with reject-publish
//! overflow and auto-delete after a long idle period. Group memberships are
//! exchange bindings on the broker (see `group`). Expired messages are
//! dead-lettered to a fanout exchange; when one leaves its channel queue
//! empty, the queue is deleted, which drops the channel from every group.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use backon::BackoffBuilder;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::{ChannelLayer, Extension, GroupSendResult};
use crate::codec::{self, Message};
use crate::config::LayerConfig;
use crate::error::{LayerError, Result};
use crate::group::{GroupMembership, MembershipState};
use crate::names;
use crate::provision::{Provisioner, QueueProvisioner};
use crate::management::ManagementClient;
use crate::transport::{
    AmqpTransport, ConnectionParams, Fetch, MemoryTransport, PublishOutcome, Transport,
};
use crate::utils::retry::{receive_backoff, MAX_POLL_DELAY};

const EXTENSIONS: &[Extension] = &[Extension::Groups, Extension::Flush];

/// Result of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Channels dropped from all their groups because their last message
    /// expired.
    pub evicted: usize,
    /// Memberships removed because their own TTL ran out.
    pub expired: usize,
}

struct LayerInner {
    config: LayerConfig,
    transport: Arc<dyn Transport>,
    provisioner: Provisioner,
    groups: GroupMembership,
    /// Groups this instance touched, for the sweep and flush.
    known_groups: RwLock<BTreeSet<String>>,
    cursor: AtomicUsize,
}

impl LayerInner {
    async fn publish_encoded(&self, channel: &str, body: &[u8]) -> Result<()> {
        let handle = self.provisioner.ensure_channel_queue(channel).await?;
        let mut outcome = self
            .transport
            .publish(&handle.queue, body, handle.expiry)
            .await?;

        if outcome == PublishOutcome::Unroutable {
            debug!(channel = %channel, queue = %handle.queue, "Queue missing, redeclaring");
            self.provisioner.redeclare(channel).await?;
            outcome = self
                .transport
                .publish(&handle.queue, body, handle.expiry)
                .await?;
        }

        match outcome {
            PublishOutcome::Accepted => {
                debug!(channel = %channel, bytes = body.len(), "Sent message");
                Ok(())
            }
            PublishOutcome::Rejected => Err(LayerError::CapacityExceeded {
                channel: channel.to_string(),
                capacity: handle.capacity,
            }),
            PublishOutcome::Unroutable => Err(LayerError::Protocol(format!(
                "Queue '{}' vanished during publish",
                handle.queue
            ))),
        }
    }

    /// One non-blocking pass over `channels`, starting at a rotating offset.
    async fn poll_once(&self, channels: &[&str]) -> Result<Option<(String, Message)>> {
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % channels.len();

        for offset in 0..channels.len() {
            let channel = channels[(start + offset) % channels.len()];
            let handle = self.provisioner.ensure_channel_queue(channel).await?;

            loop {
                match self.transport.fetch(&handle.queue).await? {
                    Fetch::Message(body) => match codec::decode(channel, &body) {
                        Ok(message) => return Ok(Some((channel.to_string(), message))),
                        Err(e) => {
                            warn!(channel = %channel, error = %e, "Skipping undecodable message");
                        }
                    },
                    Fetch::Empty => break,
                    Fetch::Missing => {
                        self.provisioner.forget(channel).await;
                        break;
                    }
                }
            }
        }

        Ok(None)
    }

    /// Evict channels whose last message expired from every group.
    ///
    /// Deletes the emptied channel queue, which removes all of its bindings.
    /// The broker refuses the delete if a message arrived in the meantime.
    async fn reconcile_expired(&self) -> Result<usize> {
        let expired = self.transport.drain_expired().await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let channels: BTreeSet<&str> = expired
            .iter()
            .filter_map(|queue| self.provisioner.channel_name(queue))
            .collect();

        let mut evicted = 0;
        for channel in channels {
            let queue = self.provisioner.queue_name(channel);
            if self.transport.queue_depth(&queue).await? != Some(0) {
                continue;
            }
            if self.transport.delete_if_empty(&queue).await? {
                self.provisioner.forget(channel).await;
                debug!(channel = %channel, "Evicted channel with expired messages");
                evicted += 1;
            }
        }

        if evicted > 0 {
            info!(evicted, "Evicted channels with expired messages from their groups");
        }
        Ok(evicted)
    }

    async fn sweep(&self) -> Result<SweepReport> {
        let evicted = self.reconcile_expired().await?;
        let groups = self.known_groups.read().await.clone();
        let mut expired = 0;
        for group in groups {
            expired += self.groups.live_members(&group).await?.1;
        }
        Ok(SweepReport { evicted, expired })
    }

    async fn live_members(&self, group: &str) -> Result<BTreeSet<String>> {
        self.reconcile_expired().await?;
        Ok(self.groups.live_members(group).await?.0)
    }
}

/// Channel layer on top of a `Transport`.
///
/// One instance owns one broker connection. Group memberships live on the
/// broker, so every instance connected to it sees the same groups.
pub struct AmqpChannelLayer {
    inner: Arc<LayerInner>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpChannelLayer {
    /// Connect to the broker named by `config.url`.
    pub async fn connect(config: LayerConfig) -> Result<Self> {
        config.validate()?;
        let params = Arc::new(ConnectionParams::parse(&config.url)?);
        let management = ManagementClient::for_broker(&config, &params)?;
        let transport =
            AmqpTransport::connect(params, config.expiry_exchange.clone(), management).await?;
        Self::with_transport(config, Arc::new(transport))
    }

    /// Layer backed by the in-memory broker emulation.
    pub fn in_memory(config: LayerConfig) -> Result<Self> {
        Self::with_transport(config, Arc::new(MemoryTransport::new()))
    }

    /// Build a layer on an existing transport.
    ///
    /// Starts the background membership sweep when called inside a tokio
    /// runtime and `sweep_interval_ms` is non-zero.
    pub fn with_transport(config: LayerConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        config.validate()?;
        let provisioner = Provisioner::new(transport.clone(), &config);
        let groups = GroupMembership::new(transport.clone(), &config);
        let inner = Arc::new(LayerInner {
            config,
            transport,
            provisioner,
            groups,
            known_groups: RwLock::new(BTreeSet::new()),
            cursor: AtomicUsize::new(0),
        });

        let reaper = spawn_reaper(&inner);

        info!(
            backend = inner.transport.kind(),
            capacity = inner.config.capacity,
            expiry_secs = inner.config.expiry,
            group_expiry_secs = inner.config.group_expiry,
            sweep = reaper.is_some(),
            "Channel layer initialized"
        );

        Ok(Self {
            inner,
            reaper: Mutex::new(reaper),
        })
    }

    pub fn config(&self) -> &LayerConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.inner.transport
    }

    pub fn is_connected(&self) -> bool {
        self.inner.transport.is_connected()
    }

    /// Run one reconciliation pass now instead of waiting for the sweep.
    pub async fn sweep(&self) -> Result<SweepReport> {
        self.inner.transport.ensure_alive()?;
        self.inner.sweep().await
    }

    /// Membership of `channel` in `group` as stored on the broker, without
    /// reaping anything.
    pub async fn membership_state(&self, group: &str, channel: &str) -> Result<MembershipState> {
        self.inner.transport.ensure_alive()?;
        names::validate_group(group)?;
        names::validate_channel(channel)?;
        self.inner.groups.state(group, channel).await
    }

    fn stop_reaper(&self) {
        if let Ok(mut reaper) = self.reaper.lock() {
            if let Some(handle) = reaper.take() {
                handle.abort();
            }
        }
    }
}

fn spawn_reaper(inner: &Arc<LayerInner>) -> Option<JoinHandle<()>> {
    let interval = inner.config.sweep_interval()?;
    let budget = inner.config.sweep_budget();
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!("No tokio runtime, membership sweep disabled");
        return None;
    };

    let weak = Arc::downgrade(inner);
    Some(runtime.spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            ticker.tick().await;
            let Some(inner) = weak.upgrade() else {
                break;
            };
            if !inner.transport.is_connected() {
                debug!("Transport closed, stopping membership sweep");
                break;
            }

            match tokio::time::timeout(budget, inner.sweep()).await {
                Ok(Ok(report)) => {
                    if report != SweepReport::default() {
                        debug!(
                            evicted = report.evicted,
                            expired = report.expired,
                            "Membership sweep"
                        );
                    }
                }
                Ok(Err(e)) => warn!(error = %e, "Membership sweep failed"),
                Err(_) => warn!(
                    budget_ms = budget.as_millis() as u64,
                    "Membership sweep exceeded its time budget"
                ),
            }
        }
    }))
}

impl Drop for AmqpChannelLayer {
    fn drop(&mut self) {
        self.stop_reaper();
    }
}

impl std::fmt::Debug for AmqpChannelLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AmqpChannelLayer")
            .field("backend", &self.inner.transport.kind())
            .field("capacity", &self.inner.config.capacity)
            .field("expiry", &self.inner.config.expiry)
            .field("group_expiry", &self.inner.config.group_expiry)
            .finish()
    }
}

#[async_trait]
impl ChannelLayer for AmqpChannelLayer {
    fn backend(&self) -> &'static str {
        self.inner.transport.kind()
    }

    fn extensions(&self) -> &'static [Extension] {
        EXTENSIONS
    }

    fn provisioner(&self) -> Option<&dyn QueueProvisioner> {
        Some(&self.inner.provisioner)
    }

    #[tracing::instrument(name = "layer.send", skip_all, fields(channel = %channel))]
    async fn send(&self, channel: &str, message: &Message) -> Result<()> {
        self.inner.transport.ensure_alive()?;
        names::validate_channel(channel)?;
        let body = codec::encode(message)?;
        self.inner.publish_encoded(channel, &body).await
    }

    #[tracing::instrument(name = "layer.receive", skip_all, fields(channels = channels.len(), block = block))]
    async fn receive(&self, channels: &[&str], block: bool) -> Result<Option<(String, Message)>> {
        self.inner.transport.ensure_alive()?;
        if channels.is_empty() {
            return Ok(None);
        }
        for channel in channels {
            names::validate_channel(channel)?;
        }

        let deadline = Instant::now() + self.inner.config.blocking_timeout();
        let mut backoff = receive_backoff().build();

        loop {
            if let Some(received) = self.inner.poll_once(channels).await? {
                debug!(channel = %received.0, "Received message");
                return Ok(Some(received));
            }
            if !block {
                return Ok(None);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let delay = backoff
                .next()
                .unwrap_or(MAX_POLL_DELAY)
                .min(deadline - now);
            tokio::time::sleep(delay).await;
            self.inner.transport.ensure_alive()?;
        }
    }

    #[tracing::instrument(name = "layer.new_channel", skip_all, fields(prefix = %prefix))]
    async fn new_channel(&self, prefix: &str) -> Result<String> {
        self.inner.transport.ensure_alive()?;
        let channel = names::unique_channel(prefix)?;
        self.inner.provisioner.ensure_channel_queue(&channel).await?;
        debug!(channel = %channel, "Created channel");
        Ok(channel)
    }

    #[tracing::instrument(name = "layer.group_add", skip_all, fields(group = %group, channel = %channel))]
    async fn group_add(&self, group: &str, channel: &str) -> Result<()> {
        let inner = &self.inner;
        inner.transport.ensure_alive()?;
        names::validate_group(group)?;
        names::validate_channel(channel)?;
        // Expiries that predate this add must not evict the fresh membership.
        inner.reconcile_expired().await?;

        let handle = inner.provisioner.ensure_channel_queue(channel).await?;
        if !inner.groups.add(group, channel, &handle.queue).await? {
            // Deleted behind this instance's cache, e.g. evicted elsewhere.
            let handle = inner.provisioner.redeclare(channel).await?;
            if !inner.groups.add(group, channel, &handle.queue).await? {
                return Err(LayerError::Protocol(format!(
                    "Queue '{}' vanished while joining group '{}'",
                    handle.queue, group
                )));
            }
        }

        inner.known_groups.write().await.insert(group.to_string());
        debug!("Added group member");
        Ok(())
    }

    #[tracing::instrument(name = "layer.group_discard", skip_all, fields(group = %group, channel = %channel))]
    async fn group_discard(&self, group: &str, channel: &str) -> Result<()> {
        self.inner.transport.ensure_alive()?;
        names::validate_group(group)?;
        names::validate_channel(channel)?;
        let queue = self.inner.provisioner.queue_name(channel);
        self.inner.groups.discard(group, &queue).await?;
        debug!("Removed group member");
        Ok(())
    }

    #[tracing::instrument(name = "layer.send_group", skip_all, fields(group = %group))]
    async fn send_group(&self, group: &str, message: &Message) -> Result<GroupSendResult> {
        self.inner.transport.ensure_alive()?;
        names::validate_group(group)?;
        let body = codec::encode(message)?;
        let members = self.inner.live_members(group).await?;

        let mut result = GroupSendResult::default();
        for channel in members {
            match self.inner.publish_encoded(&channel, &body).await {
                Ok(()) => result.delivered.push(channel),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Group delivery failed");
                    result.failed.push((channel, e));
                }
            }
        }

        debug!(
            delivered = result.delivered.len(),
            failed = result.failed.len(),
            "Sent group message"
        );
        Ok(result)
    }

    async fn group_channels(&self, group: &str) -> Result<BTreeSet<String>> {
        self.inner.transport.ensure_alive()?;
        names::validate_group(group)?;
        self.inner.live_members(group).await
    }

    #[tracing::instrument(name = "layer.flush", skip_all)]
    async fn flush(&self) -> Result<()> {
        let inner = &self.inner;
        inner.transport.ensure_alive()?;

        let groups = std::mem::take(&mut *inner.known_groups.write().await);
        let mut channels = inner.provisioner.known_channels().await;
        for group in &groups {
            channels.extend(inner.groups.remove_group(group).await?);
        }

        for channel in &channels {
            inner
                .transport
                .delete(&inner.provisioner.queue_name(channel))
                .await?;
        }

        // Notifications for queues that no longer exist.
        inner.transport.drain_expired().await?;
        inner.provisioner.reset().await;

        info!(
            channels = channels.len(),
            groups = groups.len(),
            "Flushed channel layer"
        );
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.stop_reaper();
        self.inner.transport.close().await
    }
}
