// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! The two message shapes the bridge translates between: the broker-facing
//! [`WireMessage`] (raw body, typed properties, headers) and the
//! application-facing [`GenericMessage`] (typed body, headers, exchange pattern).

use crate::body::Body;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt};

/// Header map shared by both message shapes.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A header value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl HeaderValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            HeaderValue::Int(v) => Some(*v),
            HeaderValue::String(v) => v.parse().ok(),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, HeaderValue::Null)
    }
}

impl fmt::Display for HeaderValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HeaderValue::Null => Ok(()),
            HeaderValue::Bool(v) => write!(f, "{}", v),
            HeaderValue::Int(v) => write!(f, "{}", v),
            HeaderValue::Float(v) => write!(f, "{}", v),
            HeaderValue::String(v) => f.write_str(v),
        }
    }
}

impl From<&str> for HeaderValue {
    fn from(v: &str) -> Self {
        HeaderValue::String(v.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(v: String) -> Self {
        HeaderValue::String(v)
    }
}

impl From<i64> for HeaderValue {
    fn from(v: i64) -> Self {
        HeaderValue::Int(v)
    }
}

impl From<i32> for HeaderValue {
    fn from(v: i32) -> Self {
        HeaderValue::Int(v.into())
    }
}

impl From<u8> for HeaderValue {
    fn from(v: u8) -> Self {
        HeaderValue::Int(v.into())
    }
}

impl From<bool> for HeaderValue {
    fn from(v: bool) -> Self {
        HeaderValue::Bool(v)
    }
}

impl From<f64> for HeaderValue {
    fn from(v: f64) -> Self {
        HeaderValue::Float(v)
    }
}

/// Broker message properties carried outside the header table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WireProperties {
    pub priority: Option<u8>,
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub delivery_mode: Option<u8>,
    pub content_type: Option<String>,
    pub message_id: Option<String>,
    /// Per-message TTL in milliseconds, as the broker's string property.
    pub expiration: Option<String>,
}

/// A message as published to, or delivered by, the broker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WireMessage {
    pub body: Vec<u8>,
    pub properties: WireProperties,
    pub headers: Headers,
}

impl WireMessage {
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        WireMessage {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }
}

/// Whether the sender expects a reply.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ExchangePattern {
    #[default]
    InOnly,
    InOut,
}

/// A message as seen by producers and processing callbacks.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GenericMessage {
    pub body: Body,
    pub headers: Headers,
    pub pattern: ExchangePattern,
    pub message_id: Option<String>,
}

impl GenericMessage {
    pub fn new(body: impl Into<Body>) -> Self {
        GenericMessage {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    pub fn with_pattern(mut self, pattern: ExchangePattern) -> Self {
        self.pattern = pattern;
        self
    }

    pub fn header(&self, key: &str) -> Option<&HeaderValue> {
        self.headers.get(key)
    }

    pub fn is_in_out(&self) -> bool {
        self.pattern == ExchangePattern::InOut
    }
}
