// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Endpoint Addresses
//!
//! This module parses an endpoint address into an [`EndpointDescriptor`] and
//! resolves the descriptor into the concrete topology a producer or a
//! consumer works with.
//!
//! An address is a colon-separated positional sequence optionally followed by
//! a `?key=value&...` query:
//!
//! ```text
//! <exchange>[:<queueOrRoutingKey>[:<routingKey>]][?opt=val&...]
//! ```
//!
//! With two segments the second one is ambiguous. Parsing keeps it as an
//! unresolved field; [`EndpointDescriptor::as_producer_role`] reads it as a
//! routing key while [`EndpointDescriptor::as_consumer_role`] reads it as a
//! queue name. The exchange type is inferred during that resolution, never
//! while parsing.
//!
//! A single segment always names the exchange, for both roles. The consumer
//! then binds a server-named temporary queue and the producer publishes with
//! an empty routing key unless the message header supplies one.
//!
//! Only a kind given with `type` is declared by a producer. A producer whose
//! kind is inferred publishes to the exchange its consumers declared, so a
//! producer and a consumer on the same two-segment address never disagree on
//! the exchange type.

use crate::{
    errors::AmqpError,
    exchange::{ExchangeKind, MatchMode},
    queue::{AcknowledgeMode, BindingArgs, QueueOptions},
};
use std::fmt;

/// Exchange name selecting the broker's default exchange.
pub const DEFAULT_EXCHANGE: &str = "";

const OPTION_TYPE: &str = "type";
const OPTION_DURABLE: &str = "durable";
const OPTION_AUTO_DELETE: &str = "autodelete";
const OPTION_EXCLUSIVE: &str = "exclusive";
const OPTION_HA: &str = "ha";
const OPTION_PREFETCH_COUNT: &str = "prefetchcount";
const OPTION_CONCURRENT_CONSUMERS: &str = "concurrentconsumers";
const OPTION_TIME_TO_LIVE: &str = "timetolive";
const OPTION_ACKNOWLEDGE_MODE: &str = "acknowledgemode";
const OPTION_CONNECTION: &str = "connection";

/// Positional fields following the exchange name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PositionalTarget {
    /// Only the exchange was named.
    Exchange,
    /// A single field whose role depends on how the endpoint is used.
    Unresolved(String),
    /// Queue name and routing key given explicitly. Empty segments are absent.
    Explicit {
        queue: Option<String>,
        routing_key: Option<String>,
    },
}

/// How an endpoint is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Producer,
    Consumer,
}

/// A parsed endpoint address. Immutable; one descriptor may back both a
/// producer and a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    address: String,
    exchange_name: String,
    target: PositionalTarget,
    binding_args: Option<BindingArgs>,
    explicit_kind: Option<ExchangeKind>,
    options: QueueOptions,
    connection: Option<String>,
}

/// The topology an endpoint works with once its role is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedEndpoint {
    pub role: Role,
    pub exchange_name: String,
    /// `None` asks the broker for a temporary queue. Always `None` for producers.
    pub queue_name: Option<String>,
    pub routing_key: Option<String>,
    pub binding_args: Option<BindingArgs>,
    pub kind: ExchangeKind,
    /// `true` when `kind` came from the `type` option rather than the
    /// shape of the address.
    pub kind_is_explicit: bool,
    pub options: QueueOptions,
}

impl ResolvedEndpoint {
    pub fn is_using_default_exchange(&self) -> bool {
        self.kind == ExchangeKind::Default
    }
}

impl EndpointDescriptor {
    /// Parses an address with its scheme already removed.
    pub fn parse(address: &str) -> Result<EndpointDescriptor, AmqpError> {
        let (positional, query) = match address.split_once('?') {
            Some((positional, query)) => (positional, Some(query)),
            None => (address, None),
        };

        if positional.is_empty() {
            return Err(AmqpError::address(address, "missing exchange name"));
        }

        let segments: Vec<&str> = positional.split(':').collect();
        let (exchange_name, target) = match segments.as_slice() {
            [exchange] => (exchange.to_string(), PositionalTarget::Exchange),
            [exchange, field] if field.is_empty() => {
                (exchange.to_string(), PositionalTarget::Exchange)
            }
            [exchange, field] => (
                exchange.to_string(),
                PositionalTarget::Unresolved(field.to_string()),
            ),
            [exchange, queue, routing_key] => (
                exchange.to_string(),
                PositionalTarget::Explicit {
                    queue: non_empty(queue),
                    routing_key: non_empty(routing_key),
                },
            ),
            _ => {
                return Err(AmqpError::address(
                    address,
                    format!("expected at most 3 segments, found {}", segments.len()),
                ))
            }
        };

        if exchange_name == DEFAULT_EXCHANGE && target == PositionalTarget::Exchange {
            return Err(AmqpError::address(
                address,
                "the default exchange needs a queue or routing key",
            ));
        }

        let mut descriptor = EndpointDescriptor {
            address: address.to_owned(),
            exchange_name,
            target,
            binding_args: None,
            explicit_kind: None,
            options: QueueOptions::default(),
            connection: None,
        };

        if let Some(query) = query {
            descriptor.apply_query(query)?;
        }

        if descriptor.explicit_kind == Some(ExchangeKind::Headers) {
            if let PositionalTarget::Explicit {
                routing_key: Some(key_values),
                ..
            } = &descriptor.target
            {
                descriptor.binding_args = Some(parse_key_values(key_values)?);
            }
        }

        Ok(descriptor)
    }

    /// Parses a scheme-qualified address such as `rabbitmq:exchange:queue:key`.
    pub fn parse_uri(uri: &str, scheme: &str) -> Result<EndpointDescriptor, AmqpError> {
        match uri
            .strip_prefix(scheme)
            .and_then(|rest| rest.strip_prefix(':'))
        {
            Some(remaining) => EndpointDescriptor::parse(remaining),
            None => Err(AmqpError::address(
                uri,
                format!("expected the `{}:` scheme", scheme),
            )),
        }
    }

    fn apply_query(&mut self, query: &str) -> Result<(), AmqpError> {
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let Some((key, value)) = pair.split_once('=') else {
                return Err(AmqpError::address(
                    &self.address,
                    format!("option `{}` has no value", pair),
                ));
            };

            match key.to_ascii_lowercase().as_str() {
                OPTION_TYPE => {
                    if self.explicit_kind.is_some() {
                        return Err(AmqpError::address(&self.address, "duplicated `type` option"));
                    }
                    let kind = value
                        .to_ascii_lowercase()
                        .parse::<ExchangeKind>()
                        .map_err(|reason| AmqpError::address(&self.address, reason))?;
                    self.explicit_kind = Some(kind);
                }
                OPTION_DURABLE => self.options.durable = self.parse_flag(key, value)?,
                OPTION_AUTO_DELETE => self.options.auto_delete = self.parse_flag(key, value)?,
                OPTION_EXCLUSIVE => self.options.exclusive = self.parse_flag(key, value)?,
                OPTION_HA => self.options.high_availability = self.parse_flag(key, value)?,
                OPTION_PREFETCH_COUNT => {
                    self.options.prefetch_count = self.parse_positive(key, value)?
                }
                OPTION_CONCURRENT_CONSUMERS => {
                    self.options.concurrent_consumers = self.parse_positive(key, value)?
                }
                OPTION_TIME_TO_LIVE => {
                    let ttl = value.parse::<u32>().map_err(|_| {
                        AmqpError::address(
                            &self.address,
                            format!("`{}` must be a number of milliseconds", key),
                        )
                    })?;
                    self.options.time_to_live = Some(ttl);
                }
                OPTION_ACKNOWLEDGE_MODE => {
                    self.options.acknowledge_mode = value
                        .parse::<AcknowledgeMode>()
                        .map_err(|reason| AmqpError::address(&self.address, reason))?;
                }
                OPTION_CONNECTION => self.connection = non_empty(value),
                _ => {
                    return Err(AmqpError::address(
                        &self.address,
                        format!("unknown option `{}`", key),
                    ))
                }
            }
        }

        Ok(())
    }

    fn parse_flag(&self, key: &str, value: &str) -> Result<bool, AmqpError> {
        value.to_ascii_lowercase().parse::<bool>().map_err(|_| {
            AmqpError::address(&self.address, format!("`{}` must be true or false", key))
        })
    }

    fn parse_positive(&self, key: &str, value: &str) -> Result<u16, AmqpError> {
        match value.parse::<u16>() {
            Ok(n) if n >= 1 => Ok(n),
            _ => Err(AmqpError::address(
                &self.address,
                format!("`{}` must be an integer of at least 1", key),
            )),
        }
    }

    /// The address this descriptor was parsed from, without the scheme.
    pub fn address(&self) -> &str {
        &self.address
    }

    /// Gets the exchange named by the first segment.
    ///
    /// # Returns
    /// The exchange name; empty for the default exchange
    pub fn exchange_name(&self) -> &str {
        &self.exchange_name
    }

    /// The positional segments after the exchange, before any role is applied.
    pub fn target(&self) -> &PositionalTarget {
        &self.target
    }

    /// Gets the headers binding arguments parsed from the routing key segment.
    ///
    /// # Returns
    /// The arguments when the routing key held `key=value` pairs, `None` otherwise
    pub fn binding_args(&self) -> Option<&BindingArgs> {
        self.binding_args.as_ref()
    }

    /// Gets the exchange kind given with the `type` option.
    ///
    /// # Returns
    /// The requested kind, or `None` when the kind is left to role inference
    pub fn explicit_kind(&self) -> Option<ExchangeKind> {
        self.explicit_kind
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    /// Profile requested with the `connection` option.
    pub fn connection(&self) -> Option<&str> {
        self.connection.as_deref()
    }

    /// Whether the first segment is empty, which selects the broker's default exchange.
    pub fn is_using_default_exchange(&self) -> bool {
        self.exchange_name == DEFAULT_EXCHANGE
    }

    /// Resolves the descriptor for publishing: the unresolved field is a
    /// routing key and no queue is involved.
    pub fn as_producer_role(&self) -> ResolvedEndpoint {
        let routing_key = match &self.target {
            PositionalTarget::Exchange => None,
            PositionalTarget::Unresolved(field) => Some(field.clone()),
            PositionalTarget::Explicit { routing_key, .. } => routing_key.clone(),
        };

        ResolvedEndpoint {
            role: Role::Producer,
            exchange_name: self.exchange_name.clone(),
            queue_name: None,
            kind: infer_exchange_kind(self, Role::Producer),
            kind_is_explicit: self.explicit_kind.is_some(),
            routing_key,
            binding_args: None,
            options: self.options.clone(),
        }
    }

    /// Resolves the descriptor for consuming: the unresolved field is a queue
    /// name, which on the default exchange is also the routing key.
    pub fn as_consumer_role(&self) -> ResolvedEndpoint {
        let kind = infer_exchange_kind(self, Role::Consumer);

        let (queue_name, routing_key) = match &self.target {
            PositionalTarget::Exchange => (None, None),
            PositionalTarget::Unresolved(field) if self.is_using_default_exchange() => {
                (Some(field.clone()), Some(field.clone()))
            }
            PositionalTarget::Unresolved(field) => (Some(field.clone()), None),
            PositionalTarget::Explicit { queue, routing_key } => {
                (queue.clone(), routing_key.clone())
            }
        };

        let (routing_key, binding_args) = match kind {
            ExchangeKind::Headers => (None, self.binding_args.clone()),
            ExchangeKind::Fanout => (None, None),
            _ => (routing_key, None),
        };

        ResolvedEndpoint {
            role: Role::Consumer,
            exchange_name: self.exchange_name.clone(),
            queue_name,
            routing_key,
            binding_args,
            kind,
            kind_is_explicit: self.explicit_kind.is_some(),
            options: self.options.clone(),
        }
    }
}

impl fmt::Display for EndpointDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.address)
    }
}

/// Infers the exchange type of a descriptor used in the given role.
///
/// 1. the empty exchange name is the broker's default exchange;
/// 2. an explicit `type` option wins;
/// 3. a consumer reading the unresolved field as its queue, with no routing
///    key, binds to a fanout exchange;
/// 4. anything else is a direct exchange.
pub fn infer_exchange_kind(descriptor: &EndpointDescriptor, role: Role) -> ExchangeKind {
    if descriptor.is_using_default_exchange() {
        return ExchangeKind::Default;
    }

    if let Some(kind) = descriptor.explicit_kind {
        return kind;
    }

    match (&descriptor.target, role) {
        (PositionalTarget::Unresolved(_), Role::Consumer) => ExchangeKind::Fanout,
        _ => ExchangeKind::Direct,
    }
}

/// Parses headers-exchange binding arguments such as `a=1&b=2` (all must
/// match) or `a=1|b=2` (any may match). A string uses a single delimiter style.
pub fn parse_key_values(input: &str) -> Result<BindingArgs, AmqpError> {
    let mode = match (input.contains('&'), input.contains('|')) {
        (true, true) => {
            return Err(AmqpError::address(
                input,
                "binding arguments mix `&` and `|` delimiters",
            ))
        }
        (_, true) => MatchMode::Any,
        _ => MatchMode::All,
    };

    let delimiter = match mode {
        MatchMode::All => '&',
        MatchMode::Any => '|',
    };

    let mut values = Vec::new();
    for piece in input.split(delimiter).filter(|p| !p.is_empty()) {
        match piece.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                values.push((key.to_owned(), value.to_owned()))
            }
            _ => {
                return Err(AmqpError::address(
                    input,
                    format!("binding argument `{}` is not a key=value pair", piece),
                ))
            }
        }
    }

    Ok(BindingArgs { mode, values })
}

fn non_empty(value: &str) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value.to_owned())
    }
}
