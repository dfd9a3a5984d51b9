// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Message Publisher
//!
//! `lapin` implementation of [`PublishClient`]. Wire properties map onto the
//! AMQP basic properties and wire headers onto the header field table.

use crate::{
    channel::ChannelSlot,
    client::{ConnectionIdentity, PublishClient, ReplyDestination},
    errors::BoxError,
    message::{HeaderValue, Headers, WireMessage},
};
use async_trait::async_trait;
use lapin::{
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Connection,
};
use std::{collections::BTreeMap, sync::Arc};
use tracing::{debug, error};

/// RabbitMQ implementation of [`PublishClient`].
///
/// Publishes share one channel. Reply destinations are server-named,
/// exclusive queues living as long as the connection.
pub struct RabbitMQPublisher {
    identity: ConnectionIdentity,
    channel: ChannelSlot,
}

impl RabbitMQPublisher {
    pub fn new(identity: ConnectionIdentity, connection: Arc<Connection>) -> Arc<RabbitMQPublisher> {
        Arc::new(RabbitMQPublisher {
            identity,
            channel: ChannelSlot::new(connection),
        })
    }
}

#[async_trait]
impl PublishClient for RabbitMQPublisher {
    fn identity(&self) -> ConnectionIdentity {
        self.identity.clone()
    }

    async fn publish(&self, exchange: &str, routing_key: &str, msg: &WireMessage) -> Result<(), BoxError> {
        let channel = self.channel.get().await?;

        match channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions {
                    immediate: false,
                    mandatory: false,
                },
                &msg.body,
                basic_properties(msg),
            )
            .await
        {
            Err(err) => {
                error!(error = err.to_string(), "error publishing message");
                Err(err.into())
            }
            _ => Ok(()),
        }
    }

    async fn provision_reply_destination(&self) -> Result<ReplyDestination, BoxError> {
        let channel = self.channel.get().await?;

        let queue = channel
            .queue_declare(
                "",
                QueueDeclareOptions {
                    passive: false,
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to declare the reply queue");
                err
            })?;

        debug!("reply queue: {} was created", queue.name().as_str());
        Ok(ReplyDestination {
            queue: queue.name().as_str().to_owned(),
        })
    }
}

fn basic_properties(msg: &WireMessage) -> BasicProperties {
    let props = &msg.properties;
    let mut basic = BasicProperties::default().with_headers(field_table(&msg.headers));

    if let Some(priority) = props.priority {
        basic = basic.with_priority(priority);
    }
    if let Some(delivery_mode) = props.delivery_mode {
        basic = basic.with_delivery_mode(delivery_mode);
    }
    if let Some(reply_to) = &props.reply_to {
        basic = basic.with_reply_to(ShortString::from(reply_to.clone()));
    }
    if let Some(correlation_id) = &props.correlation_id {
        basic = basic.with_correlation_id(ShortString::from(correlation_id.clone()));
    }
    if let Some(content_type) = &props.content_type {
        basic = basic.with_content_type(ShortString::from(content_type.clone()));
    }
    if let Some(message_id) = &props.message_id {
        basic = basic.with_message_id(ShortString::from(message_id.clone()));
    }
    if let Some(expiration) = &props.expiration {
        basic = basic.with_expiration(ShortString::from(expiration.clone()));
    }

    basic
}

/// Converts wire headers to an AMQP field table.
pub(crate) fn field_table(headers: &Headers) -> FieldTable {
    let mut btree = BTreeMap::<ShortString, AMQPValue>::default();

    for (key, value) in headers {
        let amqp_value = match value {
            HeaderValue::Null => AMQPValue::Void,
            HeaderValue::Bool(v) => AMQPValue::Boolean(*v),
            HeaderValue::Int(v) => AMQPValue::LongLongInt(*v),
            HeaderValue::Float(v) => AMQPValue::Double(*v),
            HeaderValue::String(v) => AMQPValue::LongString(LongString::from(v.clone())),
        };

        btree.insert(ShortString::from(key.clone()), amqp_value);
    }

    FieldTable::from(btree)
}
