// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Bodies
//!
//! Typed message bodies and the converters that turn them into broker bytes.

use crate::errors::AmqpError;
use serde::{de::DeserializeOwned, Serialize};
use tracing::error;

/// Content type for JSON bodies
pub const JSON_CONTENT_TYPE: &str = "application/json";
/// Content type for UTF-8 text bodies
pub const TEXT_CONTENT_TYPE: &str = "text/plain";
/// Content type for raw byte bodies
pub const BYTES_CONTENT_TYPE: &str = "application/octet-stream";

/// The payload of a generic message.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum Body {
    #[default]
    Empty,
    Text(String),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl Body {
    /// Serializes `value` into a JSON body.
    pub fn json<T: Serialize>(value: &T) -> Result<Body, AmqpError> {
        serde_json::to_value(value)
            .map(Body::Json)
            .map_err(|err| AmqpError::ConversionError(err.to_string()))
    }

    /// Deserializes a JSON or text body into `T`.
    pub fn deserialize<T: DeserializeOwned>(&self) -> Result<T, AmqpError> {
        let res = match self {
            Body::Json(v) => serde_json::from_value(v.clone()),
            Body::Text(v) => serde_json::from_str(v),
            Body::Bytes(v) => serde_json::from_slice(v),
            Body::Empty => serde_json::from_value(serde_json::Value::Null),
        };

        res.map_err(|err| AmqpError::ConversionError(err.to_string()))
    }

    /// Text view of the body; JSON strings are unwrapped.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Body::Text(v) => Some(v),
            Body::Json(serde_json::Value::String(v)) => Some(v),
            Body::Bytes(v) => std::str::from_utf8(v).ok(),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }
}

impl From<&str> for Body {
    fn from(v: &str) -> Self {
        Body::Text(v.to_owned())
    }
}

impl From<String> for Body {
    fn from(v: String) -> Self {
        Body::Text(v)
    }
}

impl From<Vec<u8>> for Body {
    fn from(v: Vec<u8>) -> Self {
        Body::Bytes(v)
    }
}

impl From<serde_json::Value> for Body {
    fn from(v: serde_json::Value) -> Self {
        Body::Json(v)
    }
}

/// Converts message bodies to and from broker bytes.
pub trait BodyConverter: Send + Sync {
    /// Encodes a body, returning the bytes and the content type to advertise.
    fn encode(&self, body: &Body) -> Result<(Vec<u8>, Option<String>), AmqpError>;

    /// Decodes bytes using the advertised content type as the target hint.
    fn decode(&self, bytes: &[u8], content_type: Option<&str>) -> Result<Body, AmqpError>;
}

/// Picks the body representation from the content type.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultBodyConverter;

impl BodyConverter for DefaultBodyConverter {
    fn encode(&self, body: &Body) -> Result<(Vec<u8>, Option<String>), AmqpError> {
        match body {
            Body::Empty => Ok((vec![], None)),
            Body::Text(v) => Ok((v.as_bytes().to_vec(), Some(TEXT_CONTENT_TYPE.to_owned()))),
            Body::Bytes(v) => Ok((v.clone(), Some(BYTES_CONTENT_TYPE.to_owned()))),
            Body::Json(v) => serde_json::to_vec(v)
                .map(|bytes| (bytes, Some(JSON_CONTENT_TYPE.to_owned())))
                .map_err(|err| {
                    error!(error = err.to_string(), "failure to encode json body");
                    AmqpError::ConversionError(err.to_string())
                }),
        }
    }

    fn decode(&self, bytes: &[u8], content_type: Option<&str>) -> Result<Body, AmqpError> {
        let mime = content_type.map(mime_essence);
        match mime {
            _ if bytes.is_empty() && mime.is_none() => Ok(Body::Empty),
            Some(JSON_CONTENT_TYPE) => serde_json::from_slice(bytes).map(Body::Json).map_err(|err| {
                error!(error = err.to_string(), "failure to decode json body");
                AmqpError::ConversionError(err.to_string())
            }),
            Some(m) if m.starts_with("text/") => String::from_utf8(bytes.to_vec())
                .map(Body::Text)
                .map_err(|err| AmqpError::ConversionError(err.to_string())),
            _ => Ok(Body::Bytes(bytes.to_vec())),
        }
    }
}

/// Always exchanges JSON documents; text bodies travel as JSON strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonBodyConverter;

impl BodyConverter for JsonBodyConverter {
    fn encode(&self, body: &Body) -> Result<(Vec<u8>, Option<String>), AmqpError> {
        let value = match body {
            Body::Empty => serde_json::Value::Null,
            Body::Text(v) => serde_json::Value::String(v.clone()),
            Body::Json(v) => v.clone(),
            Body::Bytes(v) => serde_json::from_slice(v)
                .map_err(|err| AmqpError::ConversionError(err.to_string()))?,
        };

        serde_json::to_vec(&value)
            .map(|bytes| (bytes, Some(JSON_CONTENT_TYPE.to_owned())))
            .map_err(|err| AmqpError::ConversionError(err.to_string()))
    }

    fn decode(&self, bytes: &[u8], _content_type: Option<&str>) -> Result<Body, AmqpError> {
        if bytes.is_empty() {
            return Ok(Body::Empty);
        }

        match serde_json::from_slice::<serde_json::Value>(bytes) {
            Ok(serde_json::Value::String(v)) => Ok(Body::Text(v)),
            Ok(serde_json::Value::Null) => Ok(Body::Empty),
            Ok(v) => Ok(Body::Json(v)),
            Err(err) => {
                error!(error = err.to_string(), "failure to decode json body");
                Err(AmqpError::ConversionError(err.to_string()))
            }
        }
    }
}

fn mime_essence(content_type: &str) -> &str {
    content_type.split(';').next().unwrap_or_default().trim()
}
