// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Broker Client Boundaries
//!
//! Traits the endpoint bridge consumes from a broker client library:
//! topology administration, publishing, subscribing and acknowledging, plus
//! the connection factory that creates them. The [`crate::channel`] family of
//! modules implements them on top of `lapin`, [`crate::memory`] in process.

use crate::{
    errors::BoxError,
    exchange::ExchangeDefinition,
    message::WireMessage,
    queue::{AcknowledgeMode, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::{fmt, sync::Arc};

/// Connection identity used to match clients against connection factories.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionIdentity {
    pub host: String,
    pub port: u16,
    pub vhost: String,
}

impl ConnectionIdentity {
    pub fn new(host: &str, port: u16, vhost: &str) -> Self {
        ConnectionIdentity {
            host: host.to_owned(),
            port,
            vhost: vhost.to_owned(),
        }
    }
}

impl fmt::Display for ConnectionIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}{}", self.host, self.port, self.vhost)
    }
}

/// Destination replies are routed to through the default exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyDestination {
    pub queue: String,
}

/// An open subscription, returned by [`SubscribeClient::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subscription {
    pub queue: String,
    pub tag: String,
}

/// Declares exchanges, queues and bindings.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AdminClient: Send + Sync {
    fn identity(&self) -> ConnectionIdentity;

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BoxError>;

    /// Declares the queue and returns its name, generated by the broker for
    /// unnamed definitions.
    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, BoxError>;

    async fn bind(&self, binding: &QueueBinding) -> Result<(), BoxError>;
}

/// Publishes wire messages.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PublishClient: Send + Sync {
    fn identity(&self) -> ConnectionIdentity;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        msg: &WireMessage,
    ) -> Result<(), BoxError>;

    /// Creates a queue that replies can be routed to.
    async fn provision_reply_destination(&self) -> Result<ReplyDestination, BoxError>;
}

/// Settles a single delivery.
#[async_trait]
pub trait AckHandle: Send + Sync {
    async fn ack(&self) -> Result<(), BoxError>;

    /// Negatively acknowledges the delivery; `requeue` asks the broker to
    /// deliver it again instead of dead-lettering or dropping it.
    async fn nack(&self, requeue: bool) -> Result<(), BoxError>;
}

/// Receives deliveries from a subscription.
///
/// Calls are sequential per subscription: the next delivery is not handed
/// over before the previous call returns.
#[async_trait]
pub trait DeliveryCallback: Send + Sync {
    async fn on_message(&self, msg: WireMessage, ack: Box<dyn AckHandle>);
}

/// Opens and cancels subscriptions.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SubscribeClient: Send + Sync {
    async fn subscribe(
        &self,
        queue: &str,
        prefetch_count: u16,
        ack_mode: AcknowledgeMode,
        callback: Arc<dyn DeliveryCallback>,
    ) -> Result<Subscription, BoxError>;

    /// Cancels the subscription. Deliveries left unacknowledged go back to the queue.
    async fn cancel(&self, subscription: &Subscription) -> Result<(), BoxError>;
}

/// Creates the clients bound to one broker connection.
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    fn identity(&self) -> ConnectionIdentity;

    async fn create_publish_client(&self) -> Result<Arc<dyn PublishClient>, BoxError>;

    async fn create_admin_client(&self) -> Result<Arc<dyn AdminClient>, BoxError>;

    async fn create_subscribe_client(&self) -> Result<Arc<dyn SubscribeClient>, BoxError>;
}
