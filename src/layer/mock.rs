//! Mock channel layer for testing.
//!
//! Keeps messages in per-channel FIFOs with no expiry or capacity, and
//! records every send for assertions.

use std::collections::{BTreeSet, HashMap, VecDeque};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{ChannelLayer, Extension, GroupSendResult};
use crate::codec::Message;
use crate::error::{LayerError, Result};
use crate::names;

const EXTENSIONS: &[Extension] = &[Extension::Groups, Extension::Flush];

/// Mock channel layer for testing.
#[derive(Default)]
pub struct MockChannelLayer {
    queues: RwLock<HashMap<String, VecDeque<Message>>>,
    groups: RwLock<HashMap<String, BTreeSet<String>>>,
    sent: RwLock<Vec<(String, Message)>>,
    fail_on_send: RwLock<bool>,
}

impl MockChannelLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn set_fail_on_send(&self, fail: bool) {
        *self.fail_on_send.write().await = fail;
    }

    pub async fn sent_count(&self) -> usize {
        self.sent.read().await.len()
    }

    pub async fn take_sent(&self) -> Vec<(String, Message)> {
        std::mem::take(&mut *self.sent.write().await)
    }
}

#[async_trait]
impl ChannelLayer for MockChannelLayer {
    fn backend(&self) -> &'static str {
        "mock"
    }

    fn extensions(&self) -> &'static [Extension] {
        EXTENSIONS
    }

    async fn send(&self, channel: &str, message: &Message) -> Result<()> {
        names::validate_channel(channel)?;
        if *self.fail_on_send.read().await {
            return Err(LayerError::Connection("Mock send failure".to_string()));
        }
        self.queues
            .write()
            .await
            .entry(channel.to_string())
            .or_default()
            .push_back(message.clone());
        self.sent
            .write()
            .await
            .push((channel.to_string(), message.clone()));
        Ok(())
    }

    async fn receive(&self, channels: &[&str], _block: bool) -> Result<Option<(String, Message)>> {
        let mut queues = self.queues.write().await;
        for channel in channels {
            if let Some(message) = queues.get_mut(*channel).and_then(VecDeque::pop_front) {
                return Ok(Some((channel.to_string(), message)));
            }
        }
        Ok(None)
    }

    async fn new_channel(&self, prefix: &str) -> Result<String> {
        names::unique_channel(prefix)
    }

    async fn group_add(&self, group: &str, channel: &str) -> Result<()> {
        names::validate_group(group)?;
        names::validate_channel(channel)?;
        self.groups
            .write()
            .await
            .entry(group.to_string())
            .or_default()
            .insert(channel.to_string());
        Ok(())
    }

    async fn group_discard(&self, group: &str, channel: &str) -> Result<()> {
        if let Some(members) = self.groups.write().await.get_mut(group) {
            members.remove(channel);
        }
        Ok(())
    }

    async fn send_group(&self, group: &str, message: &Message) -> Result<GroupSendResult> {
        let members = self.group_channels(group).await?;
        let mut result = GroupSendResult::default();
        for channel in members {
            match self.send(&channel, message).await {
                Ok(()) => result.delivered.push(channel),
                Err(e) => result.failed.push((channel, e)),
            }
        }
        Ok(result)
    }

    async fn group_channels(&self, group: &str) -> Result<BTreeSet<String>> {
        Ok(self
            .groups
            .read()
            .await
            .get(group)
            .cloned()
            .unwrap_or_default())
    }

    async fn flush(&self) -> Result<()> {
        self.queues.write().await.clear();
        self.groups.write().await.clear();
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}
