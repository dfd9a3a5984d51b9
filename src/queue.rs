// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Queue Management
//!
//! This module provides the per-endpoint queue options parsed from the
//! address, the definition handed to an admin client when a queue is
//! declared, and the queue-to-exchange binding.

use crate::exchange::MatchMode;
use std::str::FromStr;

/// How deliveries are acknowledged by a consumer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AcknowledgeMode {
    /// Acknowledged on receipt, whatever the callback outcome.
    #[default]
    Auto,
    /// Acknowledged after the callback succeeds, negatively acknowledged otherwise.
    Manual,
    /// Same acknowledgement contract as `Manual`.
    Transacted,
}

impl AcknowledgeMode {
    /// Whether the acknowledgement waits for the callback outcome.
    pub fn is_deferred(&self) -> bool {
        !matches!(self, AcknowledgeMode::Auto)
    }
}

impl FromStr for AcknowledgeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(AcknowledgeMode::Auto),
            "manual" => Ok(AcknowledgeMode::Manual),
            "transacted" => Ok(AcknowledgeMode::Transacted),
            other => Err(format!("unsupported acknowledge mode `{}`", other)),
        }
    }
}

/// Queue and subscription options carried by an endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
    pub high_availability: bool,
    pub prefetch_count: u16,
    pub concurrent_consumers: u16,
    pub time_to_live: Option<u32>,
    pub acknowledge_mode: AcknowledgeMode,
}

impl Default for QueueOptions {
    fn default() -> Self {
        QueueOptions {
            durable: false,
            auto_delete: true,
            exclusive: false,
            high_availability: false,
            prefetch_count: 1,
            concurrent_consumers: 1,
            time_to_live: None,
            acknowledge_mode: AcknowledgeMode::Auto,
        }
    }
}

/// Definition of a queue with its configuration parameters.
///
/// A definition without a name asks the broker for a generated temporary queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueDefinition {
    pub(crate) name: Option<String>,
    pub(crate) durable: bool,
    pub(crate) delete: bool,
    pub(crate) exclusive: bool,
    pub(crate) ha: bool,
    pub(crate) ttl: Option<u32>,
}

impl QueueDefinition {
    /// Creates a new queue definition with the given name.
    pub fn new(name: &str) -> QueueDefinition {
        QueueDefinition {
            name: Some(name.to_owned()),
            ..Default::default()
        }
    }

    /// Creates a definition for a broker-named, exclusive, auto-deleted queue.
    pub fn temporary() -> QueueDefinition {
        QueueDefinition {
            name: None,
            exclusive: true,
            delete: true,
            ..Default::default()
        }
    }

    /// Builds the definition from the endpoint's queue options.
    pub fn from_options(name: Option<&str>, options: &QueueOptions) -> QueueDefinition {
        match name {
            None => QueueDefinition {
                ttl: options.time_to_live,
                ..QueueDefinition::temporary()
            },
            Some(name) => QueueDefinition {
                name: Some(name.to_owned()),
                durable: options.durable,
                delete: options.auto_delete,
                exclusive: options.exclusive,
                ha: options.high_availability,
                ttl: options.time_to_live,
            },
        }
    }

    /// Makes the queue durable, persisting across broker restarts.
    pub fn durable(mut self) -> Self {
        self.durable = true;
        self
    }

    /// Sets the queue to auto-delete when its last consumer goes away.
    pub fn delete(mut self) -> Self {
        self.delete = true;
        self
    }

    /// Makes the queue exclusive to the connection.
    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    /// Mirrors the queue across cluster nodes.
    pub fn ha(mut self) -> Self {
        self.ha = true;
        self
    }

    /// Sets the message Time-To-Live (TTL) for the queue, in milliseconds.
    pub fn ttl(mut self, ttl: u32) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Gets the queue name.
    ///
    /// # Returns
    /// The requested name, or `None` when the broker should generate one
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Whether the queue survives a broker restart.
    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Whether the broker deletes the queue once its last consumer is cancelled.
    pub fn is_auto_delete(&self) -> bool {
        self.delete
    }

    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }

    pub fn is_ha(&self) -> bool {
        self.ha
    }

    /// Gets the message Time-To-Live set with [`QueueDefinition::ttl`].
    ///
    /// # Returns
    /// The TTL in milliseconds, or `None` when messages never expire
    pub fn message_ttl(&self) -> Option<u32> {
        self.ttl
    }
}

/// Header predicate of a headers-exchange binding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BindingArgs {
    pub mode: MatchMode,
    pub values: Vec<(String, String)>,
}

impl BindingArgs {
    /// Looks up the value a header must carry to match.
    ///
    /// # Parameters
    /// * `key` - The header name
    ///
    /// # Returns
    /// The expected value, or `None` when the predicate ignores `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.values
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Configuration for binding a queue to an exchange.
///
/// Direct and topic exchanges match on the routing key, headers exchanges on
/// the binding arguments, and fanout exchanges ignore both.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct QueueBinding {
    pub(crate) queue_name: String,
    pub(crate) exchange_name: String,
    pub(crate) routing_key: String,
    pub(crate) arguments: Option<BindingArgs>,
}

impl QueueBinding {
    /// Creates a new queue binding for the given queue.
    ///
    /// By default, the exchange name and routing key are empty strings.
    pub fn new(queue: &str) -> QueueBinding {
        QueueBinding {
            queue_name: queue.to_owned(),
            exchange_name: String::new(),
            routing_key: String::new(),
            arguments: None,
        }
    }

    /// Sets the exchange to bind the queue to.
    pub fn exchange(mut self, exchange: &str) -> Self {
        self.exchange_name = exchange.to_owned();
        self
    }

    /// Sets the routing key for the binding.
    pub fn routing_key(mut self, key: &str) -> Self {
        self.routing_key = key.to_owned();
        self
    }

    /// Sets the header predicate for the binding.
    pub fn arguments(mut self, args: BindingArgs) -> Self {
        self.arguments = Some(args);
        self
    }

    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// Gets the binding's routing key.
    ///
    /// # Returns
    /// The key, empty for fanout and headers bindings
    pub fn key(&self) -> &str {
        &self.routing_key
    }

    /// Header predicate of a headers binding.
    pub fn args(&self) -> Option<&BindingArgs> {
        self.arguments.as_ref()
    }
}
