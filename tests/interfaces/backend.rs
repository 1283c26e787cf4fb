//! Backend factory for interface tests.
//!
//! Provides a unified way to create a channel layer based on environment configuration.

use std::env;
use std::sync::Arc;

use burrow::{AmqpChannelLayer, ChannelLayer, LayerConfig};

#[cfg(feature = "docker-tests")]
use std::time::Duration;

#[cfg(feature = "docker-tests")]
use testcontainers::{
    core::{IntoContainerPort, WaitFor},
    runners::AsyncRunner,
    GenericImage, ImageExt,
};

/// Channel layer backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelBackend {
    Memory,
    Amqp,
}

impl ChannelBackend {
    pub fn from_env() -> Self {
        match env::var("CHANNEL_BACKEND")
            .unwrap_or_else(|_| "memory".to_string())
            .to_lowercase()
            .as_str()
        {
            "amqp" | "rabbitmq" => ChannelBackend::Amqp,
            _ => ChannelBackend::Memory,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ChannelBackend::Memory => "memory",
            ChannelBackend::Amqp => "amqp",
        }
    }
}

/// Container handles to keep containers alive during tests.
#[allow(dead_code)]
#[derive(Debug)]
pub enum ContainerHandle {
    None,
    #[cfg(feature = "docker-tests")]
    Rabbitmq(testcontainers::ContainerAsync<GenericImage>),
}

/// Holds the layer under test for a scenario.
pub struct LayerContext {
    pub layer: Arc<AmqpChannelLayer>,
    /// Container handle to keep container alive.
    #[allow(dead_code)]
    container: ContainerHandle,
}

impl std::fmt::Debug for LayerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerContext")
            .field("layer", &self.layer)
            .field("container", &self.container)
            .finish()
    }
}

impl LayerContext {
    /// Create a layer for the configured backend.
    pub async fn new(backend: ChannelBackend, config: LayerConfig) -> Self {
        match backend {
            ChannelBackend::Memory => Self::create_memory(config),
            ChannelBackend::Amqp => Self::create_amqp(config).await,
        }
    }

    /// Another layer instance on the same broker, as a second process would
    /// have.
    pub async fn peer(&self) -> AmqpChannelLayer {
        let config = self.layer.config().clone();
        match self.layer.backend() {
            "memory" => AmqpChannelLayer::with_transport(config, self.layer.transport().clone())
                .expect("Failed to create peer layer"),
            _ => AmqpChannelLayer::connect(config)
                .await
                .expect("Failed to connect peer layer"),
        }
    }

    fn create_memory(config: LayerConfig) -> Self {
        LayerContext {
            layer: Arc::new(
                AmqpChannelLayer::in_memory(config).expect("Failed to create memory layer"),
            ),
            container: ContainerHandle::None,
        }
    }

    #[cfg(feature = "docker-tests")]
    async fn create_amqp(config: LayerConfig) -> Self {
        let image = GenericImage::new("rabbitmq", "3-management")
            .with_exposed_port(5672.tcp())
            .with_exposed_port(15672.tcp())
            .with_wait_for(WaitFor::message_on_stdout("Server startup complete"));

        let container = image
            .with_startup_timeout(Duration::from_secs(60))
            .start()
            .await
            .expect("Failed to start rabbitmq container");

        // Brief delay to ensure RabbitMQ is fully ready
        tokio::time::sleep(Duration::from_secs(2)).await;

        let host_port = container
            .get_host_port_ipv4(5672)
            .await
            .expect("Failed to get mapped port");

        let management_port = container
            .get_host_port_ipv4(15672)
            .await
            .expect("Failed to get mapped management port");

        let host = container.get_host().await.expect("Failed to get host");

        let url = format!("amqp://guest:guest@{}:{}/%2f", host, host_port);
        let management_url = Some(format!("http://{}:{}", host, management_port));

        let layer = AmqpChannelLayer::connect(LayerConfig {
            url,
            management_url,
            ..config
        })
            .await
            .expect("Failed to connect channel layer");

        LayerContext {
            layer: Arc::new(layer),
            container: ContainerHandle::Rabbitmq(container),
        }
    }

    #[cfg(not(feature = "docker-tests"))]
    async fn create_amqp(_config: LayerConfig) -> Self {
        panic!("RabbitMQ backend needs Docker. Build with --features docker-tests");
    }
}
