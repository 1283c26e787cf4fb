//! ChannelLayer interface step definitions.

use std::collections::BTreeSet;
use std::time::Duration;

use burrow::{
    declare_all, AmqpChannelLayer, ChannelLayer, GroupSendResult, LayerConfig, LayerError,
    Message,
};
use cucumber::{given, then, when, World};
use serde_json::json;

use crate::backend::{ChannelBackend, LayerContext};

/// Test context for ChannelLayer scenarios.
#[derive(Debug, World)]
#[world(init = Self::new)]
pub struct ChannelLayerWorld {
    backend: ChannelBackend,
    context: Option<LayerContext>,
    last_received: Option<(String, Message)>,
    last_result: Option<Result<(), LayerError>>,
    last_group_send: Option<GroupSendResult>,
    new_channels: Vec<String>,
    declared: Vec<usize>,
}

impl ChannelLayerWorld {
    fn new() -> Self {
        Self {
            backend: ChannelBackend::from_env(),
            context: None,
            last_received: None,
            last_result: None,
            last_group_send: None,
            new_channels: Vec::new(),
            declared: Vec::new(),
        }
    }

    fn layer(&self) -> &AmqpChannelLayer {
        self.context
            .as_ref()
            .expect("Channel layer not initialized")
            .layer
            .as_ref()
    }

    async fn send(&mut self, n: u64, channel: &str) {
        let result = self.layer().send(channel, &message(n)).await;
        self.last_result = Some(result);
    }

    async fn receive(&mut self, channels: &str) {
        let channels: Vec<&str> = channels.split(',').collect();
        self.last_received = self
            .layer()
            .receive(&channels, false)
            .await
            .expect("Failed to receive");
    }
}

fn message(n: u64) -> Message {
    let mut message = Message::new();
    message.insert("type".to_string(), json!("test.message"));
    message.insert("n".to_string(), json!(n));
    message
}

// --- Background ---

#[given(
    expr = "a channel layer with capacity {int}, expiry {int} seconds and group expiry {int} seconds"
)]
async fn given_channel_layer(
    world: &mut ChannelLayerWorld,
    capacity: u32,
    expiry: u64,
    group_expiry: u64,
) {
    println!("Using backend: {}", world.backend.name());
    let config = LayerConfig::default()
        .with_capacity(capacity)
        .with_expiry(expiry)
        .with_group_expiry(group_expiry)
        .with_blocking_timeout(Duration::from_millis(500))
        .with_sweep_interval(Duration::from_millis(250));
    world.context = Some(LayerContext::new(world.backend, config).await);
}

// --- Given steps ---

#[given(expr = "I send message {int} to {string}")]
async fn given_sent_message(world: &mut ChannelLayerWorld, n: u64, channel: String) {
    world.send(n, &channel).await;
    world
        .last_result
        .take()
        .expect("No send result")
        .expect("Failed to send message");
}

#[given(expr = "I send {int} messages to {string}")]
async fn given_sent_messages(world: &mut ChannelLayerWorld, count: u64, channel: String) {
    for n in 0..count {
        world
            .layer()
            .send(&channel, &message(n))
            .await
            .expect("Failed to send message");
    }
}

#[given(expr = "I have received from {string}")]
async fn given_received(world: &mut ChannelLayerWorld, channels: String) {
    world.receive(&channels).await;
    assert!(world.last_received.is_some(), "Expected a message");
}

#[given(expr = "{string} is in group {string}")]
async fn given_group_member(world: &mut ChannelLayerWorld, channel: String, group: String) {
    world
        .layer()
        .group_add(&group, &channel)
        .await
        .expect("Failed to add group member");
}

// --- When steps ---

#[when(expr = "I receive from {string}")]
async fn when_receive(world: &mut ChannelLayerWorld, channels: String) {
    world.receive(&channels).await;
}

#[when(expr = "I wait {int} seconds")]
async fn when_wait(_world: &mut ChannelLayerWorld, secs: u64) {
    tokio::time::sleep(Duration::from_secs(secs)).await;
}

#[when(expr = "I create {int} new channels with prefix {string}")]
async fn when_new_channels(world: &mut ChannelLayerWorld, count: usize, prefix: String) {
    for _ in 0..count {
        let channel = world
            .layer()
            .new_channel(&prefix)
            .await
            .expect("Failed to create channel");
        world.new_channels.push(channel);
    }
}

#[when(expr = "I send message {int} to {string}")]
async fn when_send(world: &mut ChannelLayerWorld, n: u64, channel: String) {
    world.send(n, &channel).await;
}

#[when(expr = "I send message {int} to group {string}")]
async fn when_send_group(world: &mut ChannelLayerWorld, n: u64, group: String) {
    let result = world
        .layer()
        .send_group(&group, &message(n))
        .await
        .expect("Failed to send group message");
    world.last_group_send = Some(result);
}

#[when(expr = "another layer instance sends message {int} to group {string}")]
async fn when_peer_send_group(world: &mut ChannelLayerWorld, n: u64, group: String) {
    let peer = world
        .context
        .as_ref()
        .expect("Channel layer not initialized")
        .peer()
        .await;
    let result = peer
        .send_group(&group, &message(n))
        .await
        .expect("Failed to send group message");
    world.last_group_send = Some(result);
}

#[when(expr = "another layer instance discards {string} from group {string}")]
async fn when_peer_discard(world: &mut ChannelLayerWorld, channel: String, group: String) {
    let peer = world
        .context
        .as_ref()
        .expect("Channel layer not initialized")
        .peer()
        .await;
    let result = peer.group_discard(&group, &channel).await;
    world.last_result = Some(result);
}

#[when(expr = "I discard {string} from group {string}")]
async fn when_discard(world: &mut ChannelLayerWorld, channel: String, group: String) {
    let result = world.layer().group_discard(&group, &channel).await;
    world.last_result = Some(result);
}

#[when(expr = "I declare channels {string}")]
async fn when_declare(world: &mut ChannelLayerWorld, channels: String) {
    let channels: BTreeSet<String> = channels.split(',').map(String::from).collect();
    let declared = declare_all(world.layer(), &channels)
        .await
        .expect("Failed to declare channels");
    world.declared.push(declared);
}

#[when("I flush the layer")]
async fn when_flush(world: &mut ChannelLayerWorld) {
    world.layer().flush().await.expect("Failed to flush");
}

// --- Then steps ---

#[then("nothing is received")]
async fn then_nothing_received(world: &mut ChannelLayerWorld) {
    assert!(
        world.last_received.is_none(),
        "Expected nothing, got {:?}",
        world.last_received
    );
}

#[then(expr = "message {int} is received from {string}")]
async fn then_message_received(world: &mut ChannelLayerWorld, n: u64, channel: String) {
    let (from, received) = world.last_received.take().expect("Nothing was received");
    assert_eq!(from, channel);
    assert_eq!(received, message(n));
}

#[then(expr = "the new channels are distinct and start with {string}")]
async fn then_new_channels_distinct(world: &mut ChannelLayerWorld, prefix: String) {
    let unique: BTreeSet<&String> = world.new_channels.iter().collect();
    assert_eq!(unique.len(), world.new_channels.len());
    for channel in &world.new_channels {
        assert!(channel.starts_with(&prefix), "{} lacks prefix", channel);
    }
}

#[then("the send fails because the channel is full")]
async fn then_send_full(world: &mut ChannelLayerWorld) {
    match world.last_result.take() {
        Some(Err(e)) => assert!(e.is_capacity_exceeded(), "Unexpected error: {}", e),
        other => panic!("Expected CapacityExceeded, got {:?}", other),
    }
}

#[then("the send succeeds")]
async fn then_send_succeeds(world: &mut ChannelLayerWorld) {
    assert!(matches!(world.last_result, Some(Ok(()))));
}

#[then("the operation succeeds")]
async fn then_operation_succeeds(world: &mut ChannelLayerWorld) {
    assert!(matches!(world.last_result, Some(Ok(()))));
}

#[then(expr = "the group message was delivered to {int} members")]
async fn then_group_delivered(world: &mut ChannelLayerWorld, count: usize) {
    let result = world.last_group_send.as_ref().expect("No group send");
    assert_eq!(result.delivered.len(), count, "Delivered: {:?}", result);
}

#[then(expr = "the group message failed for {string}")]
async fn then_group_failed(world: &mut ChannelLayerWorld, channel: String) {
    let result = world.last_group_send.as_ref().expect("No group send");
    let failed: Vec<&str> = result.failed.iter().map(|(c, _)| c.as_str()).collect();
    assert_eq!(failed, vec![channel.as_str()]);
    assert!(result.failed[0].1.is_capacity_exceeded());
}

#[then(expr = "group {string} has {int} members")]
async fn then_group_count(world: &mut ChannelLayerWorld, group: String, count: usize) {
    let members = world
        .layer()
        .group_channels(&group)
        .await
        .expect("Failed to list group");
    assert_eq!(members.len(), count, "Members: {:?}", members);
}

#[then(expr = "group {string} has exactly {string}")]
async fn then_group_exactly(world: &mut ChannelLayerWorld, group: String, channel: String) {
    let members = world
        .layer()
        .group_channels(&group)
        .await
        .expect("Failed to list group");
    assert_eq!(members, BTreeSet::from([channel]));
}

#[then(expr = "the declarations created {int} and then {int} queues")]
async fn then_declared(world: &mut ChannelLayerWorld, first: usize, second: usize) {
    assert_eq!(world.declared, vec![first, second]);
}
