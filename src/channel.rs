// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # AMQP Connection and Channel Management
//!
//! [`RabbitMQConnectionFactory`] opens one connection per configured server,
//! on first use, and builds the `lapin` backed clients on top of it. Every
//! client owns its channels: a channel closed by the broker after a failed
//! declaration is replaced on the next call.

use crate::{
    admin::RabbitMQAdmin,
    client::{AdminClient, ConnectionFactory, ConnectionIdentity, PublishClient, SubscribeClient},
    configs::RabbitMQConfigs,
    errors::{AmqpError, BoxError},
    publisher::RabbitMQPublisher,
    subscriber::RabbitMQSubscriber,
};
use async_trait::async_trait;
use lapin::{types::LongString, Channel, Connection, ConnectionProperties};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, error};

/// Creates a new channel on `conn`.
pub async fn new_amqp_channel(conn: &Connection) -> Result<Arc<Channel>, AmqpError> {
    debug!("creating amqp channel...");
    match conn.create_channel().await {
        Ok(c) => {
            debug!(channel = c.id(), "channel created");
            Ok(Arc::new(c))
        }
        Err(err) => {
            error!(error = err.to_string(), "error to create the channel");
            Err(AmqpError::ChannelError)
        }
    }
}

/// A channel reopened whenever the previous one is no longer usable.
pub(crate) struct ChannelSlot {
    connection: Arc<Connection>,
    channel: Mutex<Option<Arc<Channel>>>,
}

impl ChannelSlot {
    pub(crate) fn new(connection: Arc<Connection>) -> Self {
        ChannelSlot {
            connection,
            channel: Mutex::new(None),
        }
    }

    pub(crate) async fn get(&self) -> Result<Arc<Channel>, AmqpError> {
        let mut slot = self.channel.lock().await;
        if let Some(channel) = slot.as_ref() {
            if channel.status().connected() {
                return Ok(channel.clone());
            }
            debug!(channel = channel.id(), "channel closed, reopening");
        }

        let channel = new_amqp_channel(&self.connection).await?;
        *slot = Some(channel.clone());
        Ok(channel)
    }
}

/// Connection factory for a RabbitMQ server.
pub struct RabbitMQConnectionFactory {
    configs: RabbitMQConfigs,
    connection: OnceCell<Arc<Connection>>,
}

impl RabbitMQConnectionFactory {
    pub fn new(configs: RabbitMQConfigs) -> Arc<Self> {
        Arc::new(RabbitMQConnectionFactory {
            configs,
            connection: OnceCell::new(),
        })
    }

    /// The shared connection, established on the first call.
    pub async fn connection(&self) -> Result<Arc<Connection>, AmqpError> {
        self.connection
            .get_or_try_init(|| async {
                debug!(host = %self.configs.host, port = self.configs.port, "creating amqp connection...");
                let options = ConnectionProperties::default()
                    .with_connection_name(LongString::from(self.configs.connection_name.clone()));

                match Connection::connect(&self.configs.uri(), options).await {
                    Ok(conn) => {
                        debug!("amqp connected");
                        Ok(Arc::new(conn))
                    }
                    Err(err) => {
                        error!(error = err.to_string(), "failure to connect");
                        Err(AmqpError::ConnectionError(err.to_string()))
                    }
                }
            })
            .await
            .cloned()
    }
}

#[async_trait]
impl ConnectionFactory for RabbitMQConnectionFactory {
    fn identity(&self) -> ConnectionIdentity {
        ConnectionIdentity::new(&self.configs.host, self.configs.port, &self.configs.vhost)
    }

    async fn create_publish_client(&self) -> Result<Arc<dyn PublishClient>, BoxError> {
        let conn = self.connection().await?;
        Ok(RabbitMQPublisher::new(self.identity(), conn))
    }

    async fn create_admin_client(&self) -> Result<Arc<dyn AdminClient>, BoxError> {
        let conn = self.connection().await?;
        Ok(RabbitMQAdmin::new(self.identity(), conn))
    }

    async fn create_subscribe_client(&self) -> Result<Arc<dyn SubscribeClient>, BoxError> {
        let conn = self.connection().await?;
        Ok(RabbitMQSubscriber::new(conn))
    }
}
