// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Component
//!
//! Entry point creating endpoints from scheme-qualified addresses such as
//! `rabbitmq:directExchange:q1:k?prefetchCount=10`. The `connection` option
//! selects the connection profile an endpoint works with; without it the
//! first registered profile is used.
//!
//! ```no_run
//! use rabbitmq_endpoint::{component::RabbitMQComponent, configs::ComponentConfigs, message::GenericMessage};
//!
//! # async fn run() -> Result<(), rabbitmq_endpoint::errors::AmqpError> {
//! let configs = ComponentConfigs::from_json(r#"{"connections": [{"name": "local"}]}"#)?;
//! let component = RabbitMQComponent::from_configs(configs)?;
//!
//! let producer = component.create_endpoint("rabbitmq:directExchange:k")?.create_producer();
//! producer.start().await?;
//! producer.send(&GenericMessage::new("HELLO WORLD")).await?;
//! # Ok(())
//! # }
//! ```

use crate::{
    address::EndpointDescriptor,
    body::{BodyConverter, DefaultBodyConverter},
    channel::RabbitMQConnectionFactory,
    configs::ComponentConfigs,
    consumer::{MessageProcessor, RabbitMQConsumer},
    errors::AmqpError,
    producer::RabbitMQProducer,
    registry::{ConnectionProfile, ConnectionRegistry},
};
use std::{sync::Arc, time::Duration};
use tracing::{debug, error};

pub struct RabbitMQComponent {
    configs: ComponentConfigs,
    registry: Arc<ConnectionRegistry>,
    converter: Arc<dyn BodyConverter>,
}

impl RabbitMQComponent {
    /// Creates a component over an already populated registry.
    pub fn new(configs: ComponentConfigs, registry: ConnectionRegistry) -> Result<Self, AmqpError> {
        if registry.is_empty() {
            error!("cannot find a connection factory");
            return Err(AmqpError::ConfigurationError(
                "no connection factory is registered".to_owned(),
            ));
        }

        Ok(RabbitMQComponent {
            configs,
            registry: Arc::new(registry),
            converter: Arc::new(DefaultBodyConverter),
        })
    }

    /// Registers a RabbitMQ connection factory for every configured connection.
    pub fn from_configs(configs: ComponentConfigs) -> Result<Self, AmqpError> {
        let mut registry = ConnectionRegistry::new();
        for connection in &configs.connections {
            registry.register(
                &connection.name,
                RabbitMQConnectionFactory::new(connection.rabbitmq.clone()),
            )?;
        }

        RabbitMQComponent::new(configs, registry)
    }

    /// Replaces the body converter handed to endpoints created afterwards.
    pub fn with_converter(mut self, converter: Arc<dyn BodyConverter>) -> Self {
        self.converter = converter;
        self
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn configs(&self) -> &ComponentConfigs {
        &self.configs
    }

    pub fn create_endpoint(&self, uri: &str) -> Result<RabbitMQEndpoint, AmqpError> {
        let descriptor = EndpointDescriptor::parse_uri(uri, &self.configs.scheme)?;
        let profile = self.registry.profile(descriptor.connection())?;
        debug!(address = %descriptor, profile = profile.name(), "endpoint created");

        Ok(RabbitMQEndpoint {
            descriptor,
            profile,
            converter: self.converter.clone(),
            reply_timeout: Duration::from_millis(self.configs.reply_timeout_ms),
        })
    }
}

/// A parsed address bound to its connection profile. Creates the consumers
/// and producers working with it.
#[derive(Clone)]
pub struct RabbitMQEndpoint {
    descriptor: EndpointDescriptor,
    profile: Arc<ConnectionProfile>,
    converter: Arc<dyn BodyConverter>,
    reply_timeout: Duration,
}

impl RabbitMQEndpoint {
    pub fn descriptor(&self) -> &EndpointDescriptor {
        &self.descriptor
    }

    pub fn profile(&self) -> &ConnectionProfile {
        &self.profile
    }

    pub fn create_consumer(&self, processor: Arc<dyn MessageProcessor>) -> RabbitMQConsumer {
        RabbitMQConsumer::new(
            self.descriptor.as_consumer_role(),
            self.profile.clone(),
            self.converter.clone(),
            processor,
        )
    }

    pub fn create_producer(&self) -> RabbitMQProducer {
        RabbitMQProducer::new(
            self.descriptor.as_producer_role(),
            self.profile.clone(),
            self.converter.clone(),
            self.reply_timeout,
        )
    }
}
