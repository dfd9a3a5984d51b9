// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Error Types for the RabbitMQ Endpoint
//!
//! This module provides the error taxonomy used across the endpoint bridge.
//! The `AmqpError` enum covers configuration, address parsing, topology
//! declaration, publishing, request-reply timeouts and delivery processing.
//!
//! Broker-facing boundaries report failures as [`BoxError`] so that transports
//! can keep their own error chains; [`find_root_cause`] strips those chains
//! down to the innermost cause before the error reaches a caller.

use std::error::Error;
use thiserror::Error;

/// Boxed error returned by the broker-facing boundaries.
pub type BoxError = Box<dyn Error + Send + Sync>;

/// Maximum number of `source()` links followed by [`find_root_cause`].
pub const MAX_CAUSE_DEPTH: usize = 32;

/// Represents errors that can occur while operating an AMQP endpoint.
///
/// Configuration and address errors are raised while endpoints are created,
/// topology errors when consumers or producers start, and publish, timeout
/// and processing errors while messages flow.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmqpError {
    /// Internal errors that don't fit into other categories
    #[error("internal error")]
    InternalError,

    /// No connection factory is available or the profile can't be resolved
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// The endpoint address could not be parsed
    #[error("invalid endpoint address `{address}`: {reason}")]
    AddressSyntaxError { address: String, reason: String },

    /// The broker rejected an exchange, queue or binding declaration
    #[error("failure to declare topology: {0}")]
    TopologyDeclarationError(String),

    /// Error publishing a message, already unwrapped to its root cause
    #[error("failure to publish: {0}")]
    PublishError(String),

    /// No reply arrived before the request deadline
    #[error("no reply received within {0}ms")]
    TimeoutError(u64),

    /// The processing callback failed for a delivered message
    #[error("failure to process delivery: {0}")]
    DeliveryProcessingError(String),

    /// Error converting a message body or a reserved header
    #[error("failure to convert message: {0}")]
    ConversionError(String),

    /// Error establishing a connection to the RabbitMQ server
    #[error("failure to connect: {0}")]
    ConnectionError(String),

    /// Error creating a channel from an established connection
    #[error("failure to create a channel")]
    ChannelError,

    /// Error opening or cancelling a subscription
    #[error("failure to subscribe: {0}")]
    SubscribeError(String),

    /// The consumer or producer was used while stopped
    #[error("endpoint is not started")]
    NotStartedError,

    /// The producer stopped while the request was waiting for its reply
    #[error("request abandoned before a reply arrived")]
    RequestAbandonedError,

    /// Error acknowledging a message
    #[error("failure to ack message")]
    AckMessageError,

    /// Error negative-acknowledging a message
    #[error("failure to nack message")]
    NackMessageError,
}

impl AmqpError {
    pub(crate) fn address(address: &str, reason: impl Into<String>) -> Self {
        AmqpError::AddressSyntaxError {
            address: address.to_owned(),
            reason: reason.into(),
        }
    }
}

/// Walks the `source()` chain of `err` and returns the first error without a cause.
///
/// Traversal stops after [`MAX_CAUSE_DEPTH`] links, returning the deepest error
/// reached so far.
pub fn find_root_cause<'e>(err: &'e (dyn Error + 'static)) -> &'e (dyn Error + 'static) {
    let mut current = err;
    for _ in 0..MAX_CAUSE_DEPTH {
        match current.source() {
            Some(cause) => current = cause,
            None => break,
        }
    }
    current
}

/// Renders the root cause of a boundary error as a message.
pub(crate) fn root_cause_message(err: &BoxError) -> String {
    find_root_cause(err.as_ref()).to_string()
}
