//! Burrow - RabbitMQ channel layer
//!
//! Named channels with bounded capacity and self-expiring messages, plus
//! groups for fan-out, for applications that exchange small JSON messages
//! between processes through a RabbitMQ broker.
//!
//! ```no_run
//! use burrow::{AmqpChannelLayer, ChannelLayer, LayerConfig, Message};
//!
//! # async fn run() -> burrow::Result<()> {
//! let layer = AmqpChannelLayer::connect(LayerConfig::load(None)?).await?;
//! let reply = layer.new_channel("websocket.send").await?;
//! layer.group_add("room", &reply).await?;
//! layer.send_group("room", &Message::new()).await?;
//! let received = layer.receive(&[reply.as_str()], true).await?;
//! # let _ = received;
//! layer.close().await
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod error;
pub mod group;
pub mod layer;
pub mod management;
pub mod names;
pub mod provision;
pub mod transport;
pub mod utils;

pub use codec::Message;
pub use config::LayerConfig;
pub use error::{LayerError, Result};
pub use layer::{AmqpChannelLayer, ChannelLayer, Extension, GroupSendResult, MockChannelLayer};
pub use management::ManagementClient;
pub use provision::{declare_all, QueueProvisioner};
pub use transport::Transport;
