//! AMQP (RabbitMQ) transport.
//!
//! Owns exactly one connection and one channel. Heartbeats are answered by
//! lapin's I/O reactor independently of the session lock, so long idle
//! periods and blocking receives never starve keepalive.
//!
//! Expired messages are dead-lettered to a durable fanout exchange with one
//! durable queue of the same name behind it. Every transport on the broker
//! competes for that queue, so each notification is handled once. Exchange
//! bindings are listed through the management API.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use lapin::{
    options::{
        BasicGetOptions, BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        ExchangeDeleteOptions, QueueBindOptions, QueueDeclareOptions, QueueDeleteOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    publisher_confirm::Confirmation,
    types::{AMQPValue, FieldTable},
    BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind,
};
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, info, warn};

use super::{ConnectionParams, DeclareOutcome, Fetch, PublishOutcome, QueueSpec, Transport};
use crate::error::{LayerError, Result};
use crate::management::ManagementClient;

/// Upper bound on expiry notifications drained in one call.
const MAX_EXPIRED_PER_DRAIN: usize = 1024;

/// RabbitMQ transport backed by a single lapin connection.
pub struct AmqpTransport {
    params: Arc<ConnectionParams>,
    connection: Connection,
    session: Mutex<Channel>,
    /// Dead-letter exchange, and the name of the queue bound to it.
    expiry_exchange: String,
    management: ManagementClient,
}

impl AmqpTransport {
    /// Connect and prepare the expiry notification queue.
    ///
    /// Refused connections and authentication failures surface as
    /// `LayerError::Connection`.
    pub async fn connect(
        params: Arc<ConnectionParams>,
        expiry_exchange: impl Into<String>,
        management: ManagementClient,
    ) -> Result<Self> {
        let expiry_exchange = expiry_exchange.into();
        let connection =
            Connection::connect_uri(params.uri().clone(), ConnectionProperties::default())
                .await
                .map_err(|e| {
                    LayerError::Connection(format!("Failed to connect to {}: {}", params, e))
                })?;

        let channel = Self::open_session(&connection, &expiry_exchange).await?;

        info!(
            broker = %params,
            heartbeat = ?params.heartbeat(),
            expiry_exchange = %expiry_exchange,
            "Connected to AMQP"
        );

        Ok(Self {
            params,
            connection,
            session: Mutex::new(channel),
            expiry_exchange,
            management,
        })
    }

    pub fn params(&self) -> &ConnectionParams {
        &self.params
    }

    /// Open a confirm-mode channel and make sure the expiry exchange and its
    /// notification queue exist.
    async fn open_session(connection: &Connection, expiry_exchange: &str) -> Result<Channel> {
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| LayerError::Connection(format!("Failed to create channel: {}", e)))?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| LayerError::Protocol(format!("Failed to enable confirms: {}", e)))?;

        channel
            .exchange_declare(
                expiry_exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| LayerError::Protocol(format!("Failed to declare exchange: {}", e)))?;

        channel
            .queue_declare(
                expiry_exchange,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| LayerError::Protocol(format!("Failed to declare expiry queue: {}", e)))?;

        channel
            .queue_bind(
                expiry_exchange,
                expiry_exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| LayerError::Protocol(format!("Failed to bind expiry queue: {}", e)))?;

        Ok(channel)
    }

    /// Lock the session, reopening the channel if a soft error closed it.
    async fn session(&self) -> Result<MutexGuard<'_, Channel>> {
        self.ensure_alive()?;

        let mut channel = self.session.lock().await;
        if !channel.status().connected() {
            warn!(broker = %self.params, "AMQP channel closed, reopening");
            *channel = Self::open_session(&self.connection, &self.expiry_exchange).await?;
        }
        Ok(channel)
    }

    /// Classify a lapin failure: connection loss or broker refusal.
    fn map_err(&self, context: &str, err: lapin::Error) -> LayerError {
        if self.connection.status().connected() {
            LayerError::Protocol(format!("{}: {}", context, err))
        } else {
            LayerError::Connection(format!("{}: {}", context, err))
        }
    }

    fn queue_arguments(&self, spec: &QueueSpec) -> Result<FieldTable> {
        let idle_expiry = i64::try_from(spec.idle_expiry.as_millis()).map_err(|_| {
            LayerError::Configuration(format!(
                "Idle expiry of queue '{}' does not fit x-expires",
                spec.name
            ))
        })?;

        let mut args = FieldTable::default();
        args.insert(
            "x-max-length".into(),
            AMQPValue::LongLongInt(i64::from(spec.capacity)),
        );
        args.insert(
            "x-overflow".into(),
            AMQPValue::LongString(spec.overflow.as_str().into()),
        );
        args.insert("x-expires".into(), AMQPValue::LongLongInt(idle_expiry));
        if spec.dead_letter {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(self.expiry_exchange.as_str().into()),
            );
        }
        Ok(args)
    }
}

fn soft_error(err: &lapin::Error, kind: AMQPSoftError) -> bool {
    matches!(
        err,
        lapin::Error::ProtocolError(e) if matches!(e.kind(), AMQPErrorKind::Soft(soft) if *soft == kind)
    )
}

fn is_not_found(err: &lapin::Error) -> bool {
    soft_error(err, AMQPSoftError::NOTFOUND)
}

fn is_precondition_failed(err: &lapin::Error) -> bool {
    soft_error(err, AMQPSoftError::PRECONDITIONFAILED)
}

fn passive() -> QueueDeclareOptions {
    QueueDeclareOptions {
        passive: true,
        ..Default::default()
    }
}

#[async_trait]
impl Transport for AmqpTransport {
    fn kind(&self) -> &'static str {
        "amqp"
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<DeclareOutcome> {
        let arguments = self.queue_arguments(spec)?;
        let mut channel = self.session().await?;

        match channel
            .queue_declare(&spec.name, QueueDeclareOptions::default(), arguments)
            .await
        {
            Ok(_) => {
                debug!(queue = %spec.name, capacity = spec.capacity, "Declared queue");
                Ok(DeclareOutcome::Declared)
            }
            Err(e) if is_precondition_failed(&e) => {
                // The broker closed the channel; the queue exists with other arguments.
                *channel = Self::open_session(&self.connection, &self.expiry_exchange).await?;
                channel
                    .queue_declare(&spec.name, passive(), FieldTable::default())
                    .await
                    .map_err(|e| self.map_err("Failed to inspect conflicting queue", e))?;
                Ok(DeclareOutcome::Conflict)
            }
            Err(e) => Err(self.map_err("Failed to declare queue", e)),
        }
    }

    async fn queue_depth(&self, queue: &str) -> Result<Option<u32>> {
        let channel = self.session().await?;
        match channel
            .queue_declare(queue, passive(), FieldTable::default())
            .await
        {
            Ok(declared) => Ok(Some(declared.message_count())),
            Err(e) if is_not_found(&e) => Ok(None),
            Err(e) => Err(self.map_err("Failed to inspect queue", e)),
        }
    }

    async fn publish(&self, queue: &str, body: &[u8], ttl: Duration) -> Result<PublishOutcome> {
        let channel = self.session().await?;

        let properties = BasicProperties::default()
            .with_content_type("application/json".into())
            .with_expiration(ttl.as_millis().to_string().into());

        let confirm = channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions {
                    mandatory: true,
                    ..Default::default()
                },
                body,
                properties,
            )
            .await
            .map_err(|e| self.map_err("Failed to publish", e))?;

        let confirmation = confirm
            .await
            .map_err(|e| self.map_err("Publish confirmation failed", e))?;

        Ok(match confirmation {
            Confirmation::Ack(Some(_)) | Confirmation::Nack(Some(_)) => PublishOutcome::Unroutable,
            Confirmation::Ack(None) | Confirmation::NotRequested => PublishOutcome::Accepted,
            Confirmation::Nack(None) => PublishOutcome::Rejected,
        })
    }

    async fn fetch(&self, queue: &str) -> Result<Fetch> {
        let channel = self.session().await?;
        match channel
            .basic_get(queue, BasicGetOptions { no_ack: true })
            .await
        {
            Ok(Some(message)) => Ok(Fetch::Message(message.delivery.data)),
            Ok(None) => Ok(Fetch::Empty),
            Err(e) if is_not_found(&e) => Ok(Fetch::Missing),
            Err(e) => Err(self.map_err("Failed to get message", e)),
        }
    }

    async fn delete(&self, queue: &str) -> Result<()> {
        let channel = self.session().await?;
        match channel
            .queue_delete(queue, QueueDeleteOptions::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(self.map_err("Failed to delete queue", e)),
        }
    }

    async fn delete_if_empty(&self, queue: &str) -> Result<bool> {
        let channel = self.session().await?;
        match channel
            .queue_delete(
                queue,
                QueueDeleteOptions {
                    if_empty: true,
                    ..Default::default()
                },
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(e) if is_not_found(&e) || is_precondition_failed(&e) => Ok(false),
            Err(e) => Err(self.map_err("Failed to delete queue", e)),
        }
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        let channel = self.session().await?;
        channel
            .exchange_declare(
                exchange,
                ExchangeKind::Fanout,
                ExchangeDeclareOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| self.map_err("Failed to declare exchange", e))
    }

    async fn delete_exchange(&self, exchange: &str) -> Result<()> {
        let channel = self.session().await?;
        match channel
            .exchange_delete(exchange, ExchangeDeleteOptions::default())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(self.map_err("Failed to delete exchange", e)),
        }
    }

    async fn bind(&self, queue: &str, exchange: &str) -> Result<bool> {
        let channel = self.session().await?;
        match channel
            .queue_bind(
                queue,
                exchange,
                "",
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
        {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(self.map_err("Failed to bind queue", e)),
        }
    }

    async fn unbind(&self, queue: &str, exchange: &str) -> Result<()> {
        let channel = self.session().await?;
        match channel
            .queue_unbind(queue, exchange, "", FieldTable::default())
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(self.map_err("Failed to unbind queue", e)),
        }
    }

    async fn bindings(&self, exchange: &str) -> Result<BTreeSet<String>> {
        self.ensure_alive()?;
        self.management.exchange_bindings(exchange).await
    }

    async fn drain_expired(&self) -> Result<Vec<String>> {
        let channel = self.session().await?;
        let mut expired = Vec::new();

        while expired.len() < MAX_EXPIRED_PER_DRAIN {
            let message = channel
                .basic_get(&self.expiry_exchange, BasicGetOptions { no_ack: true })
                .await
                .map_err(|e| self.map_err("Failed to drain expiry queue", e))?;

            match message {
                // Dead-lettered messages keep their original routing key,
                // which is the channel queue name.
                Some(message) => expired.push(message.delivery.routing_key.as_str().to_string()),
                None => break,
            }
        }

        if !expired.is_empty() {
            debug!(count = expired.len(), "Drained expiry notifications");
        }
        Ok(expired)
    }

    async fn close(&self) -> Result<()> {
        if !self.is_connected() {
            return Ok(());
        }
        self.connection
            .close(200, "OK")
            .await
            .map_err(|e| LayerError::Connection(format!("Failed to close connection: {}", e)))?;
        info!(broker = %self.params, "Closed AMQP connection");
        Ok(())
    }
}

