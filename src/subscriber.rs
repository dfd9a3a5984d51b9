// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Subscriber
//!
//! `lapin` implementation of [`SubscribeClient`].
//!
//! Every subscription gets its own channel, with the prefetch limit applied
//! through `basic.qos`, and a task draining the consumer stream into the
//! delivery callback one message at a time. Cancelling a subscription closes
//! its channel, which returns unacknowledged deliveries to the queue.

use crate::{
    channel::new_amqp_channel,
    client::{AckHandle, DeliveryCallback, SubscribeClient, Subscription},
    errors::{AmqpError, BoxError},
    message::{HeaderValue, Headers, WireMessage, WireProperties},
    queue::AcknowledgeMode,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    acker::Acker,
    options::{BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions},
    protocol::basic::AMQPProperties,
    types::{AMQPValue, FieldTable},
    Channel, Connection,
};
use std::{collections::HashMap, sync::Arc};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, error, warn};
use uuid::Uuid;

struct ActiveConsumer {
    channel: Arc<Channel>,
    task: JoinHandle<()>,
}

/// RabbitMQ implementation of [`SubscribeClient`].
pub struct RabbitMQSubscriber {
    connection: Arc<Connection>,
    consumers: Mutex<HashMap<String, ActiveConsumer>>,
}

impl RabbitMQSubscriber {
    pub fn new(connection: Arc<Connection>) -> Arc<RabbitMQSubscriber> {
        Arc::new(RabbitMQSubscriber {
            connection,
            consumers: Mutex::new(HashMap::default()),
        })
    }
}

#[async_trait]
impl SubscribeClient for RabbitMQSubscriber {
    async fn subscribe(
        &self,
        queue: &str,
        prefetch_count: u16,
        ack_mode: AcknowledgeMode,
        callback: Arc<dyn DeliveryCallback>,
    ) -> Result<Subscription, BoxError> {
        let channel = new_amqp_channel(&self.connection).await?;

        channel
            .basic_qos(prefetch_count, BasicQosOptions { global: false })
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to set the prefetch count");
                err
            })?;

        let tag = format!("ctag-{}", Uuid::new_v4());
        let mut consumer = channel
            .basic_consume(
                queue,
                &tag,
                BasicConsumeOptions {
                    no_local: false,
                    no_ack: false,
                    exclusive: false,
                    nowait: false,
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "error to create the consumer");
                err
            })?;

        debug!(queue = queue, tag = %tag, ack_mode = ?ack_mode, prefetch = prefetch_count, "consuming");

        let task = tokio::spawn(async move {
            while let Some(result) = consumer.next().await {
                match result {
                    Ok(delivery) => {
                        let msg = wire_message(&delivery.properties, &delivery.data);
                        let ack = Box::new(LapinAck {
                            acker: delivery.acker,
                        });
                        callback.on_message(msg, ack).await;
                    }
                    Err(err) => error!(error = err.to_string(), "errors consume msg"),
                }
            }
            debug!("consumer stream ended");
        });

        self.consumers
            .lock()
            .await
            .insert(tag.clone(), ActiveConsumer { channel, task });

        Ok(Subscription {
            queue: queue.to_owned(),
            tag,
        })
    }

    async fn cancel(&self, subscription: &Subscription) -> Result<(), BoxError> {
        let Some(active) = self.consumers.lock().await.remove(&subscription.tag) else {
            warn!(tag = %subscription.tag, "cancelling an unknown subscription");
            return Ok(());
        };

        let cancelled = active
            .channel
            .basic_cancel(&subscription.tag, BasicCancelOptions { nowait: false })
            .await;
        let closed = active.channel.close(200, "OK").await;
        active.task.abort();

        match cancelled.and(closed) {
            Ok(_) => {
                debug!(tag = %subscription.tag, "subscription cancelled");
                Ok(())
            }
            Err(err) => {
                error!(error = err.to_string(), tag = %subscription.tag, "error to cancel the consumer");
                Err(AmqpError::SubscribeError(err.to_string()).into())
            }
        }
    }
}

struct LapinAck {
    acker: Acker,
}

#[async_trait]
impl AckHandle for LapinAck {
    async fn ack(&self) -> Result<(), BoxError> {
        self.acker
            .ack(BasicAckOptions { multiple: false })
            .await
            .map(|_| ())
            .map_err(|err| err.into())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BoxError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue,
            })
            .await
            .map(|_| ())
            .map_err(|err| err.into())
    }
}

/// Builds a wire message from a delivery.
pub(crate) fn wire_message(props: &AMQPProperties, data: &[u8]) -> WireMessage {
    let text = |v: &Option<lapin::types::ShortString>| v.as_ref().map(|s| s.as_str().to_owned());

    WireMessage {
        body: data.to_vec(),
        properties: WireProperties {
            priority: *props.priority(),
            reply_to: text(props.reply_to()),
            correlation_id: text(props.correlation_id()),
            delivery_mode: *props.delivery_mode(),
            content_type: text(props.content_type()),
            message_id: text(props.message_id()),
            expiration: text(props.expiration()),
        },
        headers: props
            .headers()
            .as_ref()
            .map(headers_of)
            .unwrap_or_default(),
    }
}

fn headers_of(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| header_value(value).map(|v| (key.as_str().to_owned(), v)))
        .collect()
}

fn header_value(value: &AMQPValue) -> Option<HeaderValue> {
    let converted = match value {
        AMQPValue::Void => HeaderValue::Null,
        AMQPValue::Boolean(v) => HeaderValue::Bool(*v),
        AMQPValue::ShortShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::ShortUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongUInt(v) => HeaderValue::Int(i64::from(*v)),
        AMQPValue::LongLongInt(v) => HeaderValue::Int(*v),
        AMQPValue::Timestamp(v) => HeaderValue::Int(i64::try_from(*v).ok()?),
        AMQPValue::Float(v) => HeaderValue::Float(f64::from(*v)),
        AMQPValue::Double(v) => HeaderValue::Float(*v),
        AMQPValue::ShortString(v) => HeaderValue::String(v.as_str().to_owned()),
        AMQPValue::LongString(v) => HeaderValue::String(String::from_utf8_lossy(v.as_bytes()).into_owned()),
        other => {
            debug!(value = ?other, "skipping header of unsupported type");
            return None;
        }
    };

    Some(converted)
}
