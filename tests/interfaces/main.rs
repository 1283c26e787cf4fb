//! Interface tests for channel layer backends using Cucumber.
//!
//! These tests verify that every transport behind `AmqpChannelLayer` honors the
//! same contract. Select a backend via environment variable:
//!
//! ```bash
//! # In-memory broker emulation (default)
//! cargo test --test interfaces
//!
//! # RabbitMQ (uses testcontainers)
//! CHANNEL_BACKEND=amqp cargo test --test interfaces --features docker-tests
//! ```

mod backend;
mod steps;

use cucumber::World;
use steps::channel_layer::ChannelLayerWorld;

#[tokio::main]
async fn main() {
    burrow::utils::bootstrap::init_tracing();

    println!("\n=== Running ChannelLayer Interface Tests ===\n");
    ChannelLayerWorld::cucumber()
        .fail_on_skipped()
        .run("tests/interfaces/features/channel_layer.feature")
        .await;
}
