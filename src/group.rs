//! Group membership kept on the broker.
//!
//! A group is a fanout exchange `<prefix><group>`. A channel is a member
//! while its queue is bound to that exchange and the membership marker, a
//! queue `<prefix><group>:<channel>` holding one message with TTL
//! `group_expiry`, is not empty. `group_add` replaces the marker message,
//! which restarts the clock. Deleting a channel queue drops every one of its
//! bindings at once, so eviction from all groups is a single broker call.
//!
//! Nothing here is cached: every layer instance on the broker reads the same
//! memberships, and racing adds and discards resolve in the order the broker
//! applies the bind and unbind.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::LayerConfig;
use crate::error::{LayerError, Result};
use crate::transport::{DeclareOutcome, Overflow, PublishOutcome, QueueSpec, Transport};

/// Separates group and channel in marker queue names. Neither name may
/// contain it.
pub const MARKER_SEPARATOR: char = ':';

/// Observable state of one (group, channel) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipState {
    Active,
    /// Marker expired but the binding is not yet reaped.
    Expired,
    /// Discarded, reaped, evicted, or never added.
    Absent,
}

/// Reads and writes memberships through a `Transport`.
pub struct GroupMembership {
    transport: Arc<dyn Transport>,
    prefix: String,
    ttl: Duration,
    marker_idle_expiry: Duration,
}

impl GroupMembership {
    pub fn new(transport: Arc<dyn Transport>, config: &LayerConfig) -> Self {
        Self {
            transport,
            prefix: config.queue_prefix.clone(),
            ttl: config.group_expiry(),
            marker_idle_expiry: config.queue_idle_expiry(),
        }
    }

    pub fn exchange_name(&self, group: &str) -> String {
        format!("{}{}", self.prefix, group)
    }

    pub fn marker_name(&self, group: &str, channel: &str) -> String {
        format!("{}{}{}{}", self.prefix, group, MARKER_SEPARATOR, channel)
    }

    fn channel_of<'a>(&self, queue: &'a str) -> Option<&'a str> {
        queue
            .strip_prefix(self.prefix.as_str())
            .filter(|channel| !channel.contains(MARKER_SEPARATOR))
    }

    fn marker_spec(&self, marker: &str) -> QueueSpec {
        QueueSpec {
            name: marker.to_string(),
            capacity: 1,
            idle_expiry: self.marker_idle_expiry,
            overflow: Overflow::DropHead,
            dead_letter: false,
        }
    }

    /// Start or refresh the membership of `channel`, whose queue is `queue`.
    ///
    /// Returns `false` when the channel queue is missing; nothing is bound
    /// in that case.
    pub async fn add(&self, group: &str, channel: &str, queue: &str) -> Result<bool> {
        let exchange = self.exchange_name(group);
        self.transport.declare_exchange(&exchange).await?;

        // Redeclaring also renews the marker queue's idle lease.
        let marker = self.marker_name(group, channel);
        if self.transport.declare_queue(&self.marker_spec(&marker)).await?
            == DeclareOutcome::Conflict
        {
            warn!(queue = %marker, "Membership marker exists with other arguments");
        }

        match self
            .transport
            .publish(&marker, channel.as_bytes(), self.ttl)
            .await?
        {
            PublishOutcome::Accepted => {}
            outcome => {
                return Err(LayerError::Protocol(format!(
                    "Membership marker '{}' not stored: {:?}",
                    marker, outcome
                )))
            }
        }

        self.transport.bind(queue, &exchange).await
    }

    /// End a membership. Silent when absent.
    pub async fn discard(&self, group: &str, queue: &str) -> Result<()> {
        self.transport.unbind(queue, &self.exchange_name(group)).await
    }

    /// Live members of `group`, plus how many expired bindings were reaped.
    pub async fn live_members(&self, group: &str) -> Result<(BTreeSet<String>, usize)> {
        let exchange = self.exchange_name(group);
        let mut live = BTreeSet::new();
        let mut reaped = 0;

        for queue in self.transport.bindings(&exchange).await? {
            let Some(channel) = self.channel_of(&queue) else {
                continue;
            };
            if self.marker_is_set(group, channel).await? {
                live.insert(channel.to_string());
            } else {
                self.transport.unbind(&queue, &exchange).await?;
                debug!(group = %group, channel = %channel, "Reaped expired membership");
                reaped += 1;
            }
        }

        Ok((live, reaped))
    }

    async fn marker_is_set(&self, group: &str, channel: &str) -> Result<bool> {
        let depth = self
            .transport
            .queue_depth(&self.marker_name(group, channel))
            .await?;
        Ok(depth.is_some_and(|depth| depth > 0))
    }

    pub async fn state(&self, group: &str, channel: &str) -> Result<MembershipState> {
        let queue = format!("{}{}", self.prefix, channel);
        if !self
            .transport
            .bindings(&self.exchange_name(group))
            .await?
            .contains(&queue)
        {
            return Ok(MembershipState::Absent);
        }
        Ok(if self.marker_is_set(group, channel).await? {
            MembershipState::Active
        } else {
            MembershipState::Expired
        })
    }

    /// Delete the group's exchange and markers. Returns the channels that
    /// were bound to it.
    pub async fn remove_group(&self, group: &str) -> Result<BTreeSet<String>> {
        let exchange = self.exchange_name(group);
        let channels: BTreeSet<String> = self
            .transport
            .bindings(&exchange)
            .await?
            .iter()
            .filter_map(|queue| self.channel_of(queue))
            .map(String::from)
            .collect();

        for channel in &channels {
            self.transport
                .delete(&self.marker_name(group, channel))
                .await?;
        }
        self.transport.delete_exchange(&exchange).await?;
        Ok(channels)
    }
}
