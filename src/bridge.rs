// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Bridge
//!
//! Translates between [`WireMessage`] and [`GenericMessage`].
//!
//! Four broker properties are exposed to generic messages as reserved
//! headers: [`PRIORITY`], [`REPLY_TO`], [`CORRELATION_ID`] and
//! [`DELIVERY_MODE`]. Going to the wire they are moved back into the
//! properties and never appear in the header table. Every other header is
//! copied as-is in both directions.

use crate::{
    body::BodyConverter,
    errors::AmqpError,
    message::{ExchangePattern, GenericMessage, HeaderValue, Headers, WireMessage},
};
use tracing::warn;
use uuid::Uuid;

/// Reserved header carrying the message priority property.
pub const PRIORITY: &str = "PRIORITY";
/// Reserved header carrying the reply-to property.
pub const REPLY_TO: &str = "REPLY_TO";
/// Reserved header carrying the correlation id property.
pub const CORRELATION_ID: &str = "CORRELATION_ID";
/// Reserved header carrying the delivery mode property.
pub const DELIVERY_MODE: &str = "DELIVERY_MODE";

/// Overrides the endpoint routing key for a single publish.
pub const ROUTING_KEY: &str = "ROUTING_KEY";
/// Name of the exchange a consumed message came through.
pub const EXCHANGE_NAME: &str = "EXCHANGE_NAME";
/// Name of the queue a consumed message was read from.
pub const QUEUE_NAME: &str = "QUEUE_NAME";
/// Set on replies whose request failed; carries the failure message.
pub const EXCEPTION: &str = "EXCEPTION";

/// Headers moved into wire properties.
pub const RESERVED_HEADERS: [&str; 4] = [PRIORITY, REPLY_TO, CORRELATION_ID, DELIVERY_MODE];

pub fn is_reserved(name: &str) -> bool {
    RESERVED_HEADERS.contains(&name)
}

/// Bidirectional translation with an injected body converter.
pub struct MessageBridge<'c> {
    converter: &'c dyn BodyConverter,
}

impl<'c> MessageBridge<'c> {
    pub fn new(converter: &'c dyn BodyConverter) -> Self {
        MessageBridge { converter }
    }

    /// Converts a delivered wire message.
    ///
    /// Wire headers are copied verbatim, except names colliding with the
    /// reserved headers, which only ever reflect the wire properties. A
    /// message carrying a reply-to is an InOut exchange. A message id is
    /// synthesized when the wire message has none.
    pub fn from_wire(&self, wire: &WireMessage) -> Result<GenericMessage, AmqpError> {
        let body = self
            .converter
            .decode(&wire.body, wire.properties.content_type.as_deref())?;

        let mut headers: Headers = wire
            .headers
            .iter()
            .filter(|(name, _)| {
                let reserved = is_reserved(name);
                if reserved {
                    warn!(header = name.as_str(), "ignoring wire header named like a reserved property");
                }
                !reserved
            })
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();

        let props = &wire.properties;
        if let Some(priority) = props.priority {
            headers.insert(PRIORITY.to_owned(), HeaderValue::from(priority));
        }
        if let Some(reply_to) = &props.reply_to {
            headers.insert(REPLY_TO.to_owned(), HeaderValue::from(reply_to.as_str()));
        }
        if let Some(correlation_id) = &props.correlation_id {
            headers.insert(
                CORRELATION_ID.to_owned(),
                HeaderValue::from(correlation_id.as_str()),
            );
        }
        if let Some(delivery_mode) = props.delivery_mode {
            headers.insert(DELIVERY_MODE.to_owned(), HeaderValue::from(delivery_mode));
        }

        Ok(GenericMessage {
            body,
            headers,
            pattern: exchange_pattern(wire),
            message_id: Some(
                props
                    .message_id
                    .clone()
                    .unwrap_or_else(|| Uuid::new_v4().to_string()),
            ),
        })
    }

    /// Converts a generic message for publishing.
    ///
    /// Reserved headers become wire properties and are left out of the wire
    /// header table; null reserved headers leave the property unset.
    pub fn to_wire(&self, msg: &GenericMessage) -> Result<WireMessage, AmqpError> {
        let (body, content_type) = self.converter.encode(&msg.body)?;

        let mut wire = WireMessage::new(body);
        wire.properties.content_type = content_type;
        wire.properties.message_id = msg.message_id.clone();

        for (name, value) in &msg.headers {
            match name.as_str() {
                PRIORITY => wire.properties.priority = octet_property(name, value)?,
                DELIVERY_MODE => wire.properties.delivery_mode = octet_property(name, value)?,
                REPLY_TO => wire.properties.reply_to = string_property(value),
                CORRELATION_ID => wire.properties.correlation_id = string_property(value),
                _ => {
                    wire.headers.insert(name.clone(), value.clone());
                }
            }
        }

        Ok(wire)
    }

    /// Converts a request: the reply destination and a fresh correlation id
    /// replace whatever the message carried. Returns the correlation id.
    pub fn to_wire_request(
        &self,
        msg: &GenericMessage,
        reply_to: &str,
    ) -> Result<(WireMessage, String), AmqpError> {
        let mut wire = self.to_wire(msg)?;
        let correlation_id = Uuid::new_v4().to_string();

        wire.properties.reply_to = Some(reply_to.to_owned());
        wire.properties.correlation_id = Some(correlation_id.clone());

        Ok((wire, correlation_id))
    }
}

/// InOut when the message names a reply destination.
pub fn exchange_pattern(wire: &WireMessage) -> ExchangePattern {
    match wire.properties.reply_to {
        Some(_) => ExchangePattern::InOut,
        None => ExchangePattern::InOnly,
    }
}

/// The routing key to publish with: the per-message override header when
/// present, otherwise the endpoint's own key.
pub fn routing_key_for(msg: &GenericMessage, endpoint_key: Option<&str>) -> String {
    match msg.headers.get(ROUTING_KEY) {
        Some(HeaderValue::Null) | None => endpoint_key.unwrap_or_default().to_owned(),
        Some(value) => value.to_string(),
    }
}

fn string_property(value: &HeaderValue) -> Option<String> {
    match value {
        HeaderValue::Null => None,
        other => Some(other.to_string()),
    }
}

fn octet_property(name: &str, value: &HeaderValue) -> Result<Option<u8>, AmqpError> {
    if value.is_null() {
        return Ok(None);
    }

    value
        .as_i64()
        .and_then(|v| u8::try_from(v).ok())
        .map(Some)
        .ok_or_else(|| {
            AmqpError::ConversionError(format!("header `{}` must be an integer in 0..=255", name))
        })
}
