// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Topology Administration
//!
//! `lapin` implementation of [`AdminClient`].

use crate::{
    channel::ChannelSlot,
    client::{AdminClient, ConnectionIdentity},
    errors::BoxError,
    exchange::{ExchangeDefinition, AMQP_HEADERS_MATCH},
    queue::{QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use lapin::{
    options::{ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongLongInt, LongString, ShortString},
    Connection,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// Constant for the queue argument used to specify message TTL
pub const AMQP_HEADERS_MESSAGE_TTL: &str = "x-message-ttl";
/// Constant for the queue argument used to mirror a queue across the cluster
pub const AMQP_HEADERS_HA_POLICY: &str = "x-ha-policy";

pub struct RabbitMQAdmin {
    identity: ConnectionIdentity,
    channel: ChannelSlot,
}

impl RabbitMQAdmin {
    pub fn new(identity: ConnectionIdentity, connection: Arc<Connection>) -> Arc<RabbitMQAdmin> {
        Arc::new(RabbitMQAdmin {
            identity,
            channel: ChannelSlot::new(connection),
        })
    }
}

#[async_trait]
impl AdminClient for RabbitMQAdmin {
    fn identity(&self) -> ConnectionIdentity {
        self.identity.clone()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BoxError> {
        debug!("creating exchange: {}", def.name());
        let channel = self.channel.get().await?;

        channel
            .exchange_declare(
                def.name(),
                def.exchange_kind().try_into()?,
                ExchangeDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    auto_delete: def.is_auto_delete(),
                    internal: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), name = def.name(), "error to declare the exchange");
                err
            })?;

        debug!("exchange: {} was created", def.name());
        Ok(())
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, BoxError> {
        let name = def.name().unwrap_or_default();
        debug!("creating queue: {}", name);
        let channel = self.channel.get().await?;

        let queue = channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    passive: false,
                    durable: def.is_durable(),
                    exclusive: def.is_exclusive(),
                    auto_delete: def.is_auto_delete(),
                    nowait: false,
                },
                queue_arguments(def),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue = name, "error to declare the queue");
                err
            })?;

        debug!("queue: {} was created", queue.name().as_str());
        Ok(queue.name().as_str().to_owned())
    }

    async fn bind(&self, binding: &QueueBinding) -> Result<(), BoxError> {
        let channel = self.channel.get().await?;

        channel
            .queue_bind(
                binding.queue_name(),
                binding.exchange_name(),
                binding.key(),
                QueueBindOptions { nowait: false },
                binding_arguments(binding),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to bind queue to exchange");
                err
            })?;

        Ok(())
    }
}

fn queue_arguments(def: &QueueDefinition) -> FieldTable {
    let mut args = BTreeMap::new();

    if let Some(ttl) = def.message_ttl() {
        args.insert(
            ShortString::from(AMQP_HEADERS_MESSAGE_TTL),
            AMQPValue::LongLongInt(LongLongInt::from(ttl)),
        );
    }

    if def.is_ha() {
        args.insert(
            ShortString::from(AMQP_HEADERS_HA_POLICY),
            AMQPValue::LongString(LongString::from("all")),
        );
    }

    FieldTable::from(args)
}

fn binding_arguments(binding: &QueueBinding) -> FieldTable {
    let Some(arguments) = binding.args() else {
        return FieldTable::default();
    };

    let mut args = BTreeMap::new();
    args.insert(
        ShortString::from(AMQP_HEADERS_MATCH),
        AMQPValue::LongString(LongString::from(arguments.mode.as_str())),
    );
    for (key, value) in &arguments.values {
        args.insert(
            ShortString::from(key.clone()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }

    FieldTable::from(args)
}
