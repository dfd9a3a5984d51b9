// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Endpoint Configuration
//!
//! Connection and component settings, deserializable with `serde`.

use crate::errors::AmqpError;
use serde::Deserialize;
use tracing::error;

/// Default URI scheme accepted by [`crate::component::RabbitMQComponent`].
pub const DEFAULT_SCHEME: &str = "rabbitmq";
/// Default request-reply deadline in milliseconds.
pub const DEFAULT_REPLY_TIMEOUT_MS: u64 = 5000;

/// Connection settings for a RabbitMQ server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RabbitMQConfigs {
    pub host: String,
    pub port: u16,
    pub vhost: String,
    pub user: String,
    pub password: String,
    pub connection_name: String,
}

impl Default for RabbitMQConfigs {
    fn default() -> Self {
        RabbitMQConfigs {
            host: "localhost".to_owned(),
            port: 5672,
            vhost: "/".to_owned(),
            user: "guest".to_owned(),
            password: "guest".to_owned(),
            connection_name: "rabbitmq-endpoint".to_owned(),
        }
    }
}

impl RabbitMQConfigs {
    /// Builds the `amqp://` URI for these settings.
    ///
    /// The virtual host is percent-encoded, so the default `/` vhost becomes `%2f`.
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.user,
            self.password,
            self.host,
            self.port,
            self.vhost.replace('%', "%25").replace('/', "%2f")
        )
    }
}

/// A connection registered under a profile name.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct NamedConnection {
    pub name: String,
    #[serde(flatten)]
    pub rabbitmq: RabbitMQConfigs,
}

/// Component-wide settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ComponentConfigs {
    /// URI scheme stripped from endpoint addresses.
    pub scheme: String,
    /// Deadline applied to request-reply exchanges that don't supply their own.
    pub reply_timeout_ms: u64,
    /// Ordered connections; the first one is the default profile.
    pub connections: Vec<NamedConnection>,
}

impl Default for ComponentConfigs {
    fn default() -> Self {
        ComponentConfigs {
            scheme: DEFAULT_SCHEME.to_owned(),
            reply_timeout_ms: DEFAULT_REPLY_TIMEOUT_MS,
            connections: vec![],
        }
    }
}

impl ComponentConfigs {
    /// Parses component settings from a JSON document.
    pub fn from_json(json: &str) -> Result<Self, AmqpError> {
        serde_json::from_str(json).map_err(|err| {
            error!(error = err.to_string(), "failure to parse component configs");
            AmqpError::ConfigurationError(err.to_string())
        })
    }
}
