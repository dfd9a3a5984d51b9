// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

#![allow(dead_code)]

use async_trait::async_trait;
use opentelemetry::Context;
use rabbitmq_endpoint::{
    component::RabbitMQComponent,
    configs::ComponentConfigs,
    consumer::{MessageProcessor, RabbitMQConsumer},
    errors::AmqpError,
    memory::InMemoryBroker,
    message::GenericMessage,
    registry::ConnectionRegistry,
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::sync::{mpsc, Semaphore};

pub const RECEIVE_DEADLINE: Duration = Duration::from_secs(2);

pub fn component(broker: &InMemoryBroker) -> RabbitMQComponent {
    let configs = ComponentConfigs {
        reply_timeout_ms: 2000,
        ..ComponentConfigs::default()
    };
    RabbitMQComponent::new(configs, ConnectionRegistry::with_factory(Arc::new(broker.clone()))).unwrap()
}

pub async fn started_consumer(
    component: &RabbitMQComponent,
    uri: &str,
    processor: Arc<dyn MessageProcessor>,
) -> RabbitMQConsumer {
    let consumer = component.create_endpoint(uri).unwrap().create_consumer(processor);
    consumer.start().await.unwrap();
    consumer
}

pub async fn next(received: &mut mpsc::UnboundedReceiver<GenericMessage>) -> GenericMessage {
    tokio::time::timeout(RECEIVE_DEADLINE, received.recv())
        .await
        .expect("no message before the deadline")
        .expect("collector dropped")
}

pub async fn assert_nothing_received(received: &mut mpsc::UnboundedReceiver<GenericMessage>) {
    let outcome = tokio::time::timeout(Duration::from_millis(100), received.recv()).await;
    assert!(outcome.is_err(), "unexpected message: {:?}", outcome);
}

/// Forwards every message it processes.
pub struct Collector {
    received: mpsc::UnboundedSender<GenericMessage>,
}

impl Collector {
    pub fn new() -> (Arc<Collector>, mpsc::UnboundedReceiver<GenericMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Collector { received: tx }), rx)
    }
}

#[async_trait]
impl MessageProcessor for Collector {
    async fn process(&self, _ctx: &Context, msg: &GenericMessage) -> Result<Option<GenericMessage>, AmqpError> {
        let _ = self.received.send(msg.clone());
        Ok(None)
    }
}

/// Answers every request with the same body.
pub struct Responder(pub &'static str);

#[async_trait]
impl MessageProcessor for Responder {
    async fn process(&self, _ctx: &Context, _msg: &GenericMessage) -> Result<Option<GenericMessage>, AmqpError> {
        Ok(Some(GenericMessage::new(self.0)))
    }
}

/// Never answers in time.
pub struct Sleeper(pub Duration);

#[async_trait]
impl MessageProcessor for Sleeper {
    async fn process(&self, _ctx: &Context, _msg: &GenericMessage) -> Result<Option<GenericMessage>, AmqpError> {
        tokio::time::sleep(self.0).await;
        Ok(None)
    }
}

/// Fails the first `failures` messages it is handed, then forwards them.
pub struct FailFirst {
    failures: usize,
    calls: AtomicUsize,
    received: mpsc::UnboundedSender<GenericMessage>,
}

impl FailFirst {
    pub fn new(failures: usize) -> (Arc<FailFirst>, mpsc::UnboundedReceiver<GenericMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let processor = FailFirst {
            failures,
            calls: AtomicUsize::new(0),
            received: tx,
        };
        (Arc::new(processor), rx)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Acquire)
    }
}

#[async_trait]
impl MessageProcessor for FailFirst {
    async fn process(&self, _ctx: &Context, msg: &GenericMessage) -> Result<Option<GenericMessage>, AmqpError> {
        let call = self.calls.fetch_add(1, Ordering::AcqRel);
        if call < self.failures {
            return Err(AmqpError::DeliveryProcessingError(format!("failure #{}", call + 1)));
        }
        let _ = self.received.send(msg.clone());
        Ok(None)
    }
}

/// Holds every message until a permit is released for it.
pub struct Gate {
    permits: Arc<Semaphore>,
    received: mpsc::UnboundedSender<GenericMessage>,
}

impl Gate {
    pub fn new() -> (Arc<Gate>, Arc<Semaphore>, mpsc::UnboundedReceiver<GenericMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(0));
        let gate = Gate {
            permits: permits.clone(),
            received: tx,
        };
        (Arc::new(gate), permits, rx)
    }
}

#[async_trait]
impl MessageProcessor for Gate {
    async fn process(&self, _ctx: &Context, msg: &GenericMessage) -> Result<Option<GenericMessage>, AmqpError> {
        let _ = self.received.send(msg.clone());
        match self.permits.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Err(AmqpError::InternalError),
        }
        Ok(None)
    }
}
