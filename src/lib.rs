// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # RabbitMQ Endpoint
//!
//! Bridges an integration framework's message exchanges to AMQP 0-9-1
//! brokers. Endpoints are described by compact addresses
//! (`rabbitmq:exchange:queue:routingKey?options`), from which the crate
//! infers and declares the exchange, queue and binding topology, then runs
//! consumers and producers (with request-reply) over it.

mod otel;

pub mod address;
pub mod admin;
pub mod body;
pub mod bridge;
pub mod channel;
pub mod client;
pub mod component;
pub mod configs;
pub mod consumer;
pub mod errors;
pub mod exchange;
pub mod memory;
pub mod message;
pub mod producer;
pub mod publisher;
pub mod queue;
pub mod registry;
pub mod subscriber;
pub mod topology;
