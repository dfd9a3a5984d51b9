// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Endpoint Consumer
//!
//! Subscribes to the queue resolved for an endpoint and dispatches every
//! delivery to a [`MessageProcessor`].
//!
//! `start()` declares the topology and opens `concurrentConsumers`
//! subscriptions with the configured prefetch count; `stop()` cancels them
//! and leaves the topology in place. Both are idempotent and a stopped
//! consumer can be started again.
//!
//! Under `auto` acknowledgement a delivery is acknowledged as soon as it is
//! received, so a failing processor loses the message. Under `manual` and
//! `transacted` acknowledgement the delivery is acknowledged once the
//! processor succeeds and negatively acknowledged with requeue otherwise.
//!
//! Requests (deliveries carrying a reply-to) are answered through the
//! default exchange with the request's correlation id. A failing processor
//! answers with an error reply carrying the [`EXCEPTION`] header.

use crate::{
    address::ResolvedEndpoint,
    body::{Body, BodyConverter},
    bridge::{MessageBridge, CORRELATION_ID, EXCEPTION, EXCHANGE_NAME, QUEUE_NAME, REPLY_TO},
    client::{AckHandle, DeliveryCallback, SubscribeClient, Subscription},
    errors::{root_cause_message, AmqpError},
    message::{GenericMessage, HeaderValue, WireMessage},
    otel,
    queue::AcknowledgeMode,
    registry::ConnectionProfile,
    topology::TopologyResolver,
};
use async_trait::async_trait;
use opentelemetry::{
    global,
    trace::{Span, Status},
    Context,
};
use std::{
    borrow::Cow,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// Handles messages consumed by an endpoint.
///
/// For requests, `Ok(Some(reply))` is sent back as the reply and `Ok(None)`
/// echoes the request. Errors become [`AmqpError::DeliveryProcessingError`]
/// from the requester's point of view.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(
        &self,
        ctx: &Context,
        msg: &GenericMessage,
    ) -> Result<Option<GenericMessage>, AmqpError>;
}

struct ActiveSubscriptions {
    active: Arc<AtomicBool>,
    client: Arc<dyn SubscribeClient>,
    queue: String,
    subscriptions: Vec<Subscription>,
}

/// Consumer side of an endpoint.
pub struct RabbitMQConsumer {
    endpoint: ResolvedEndpoint,
    profile: Arc<ConnectionProfile>,
    converter: Arc<dyn BodyConverter>,
    processor: Arc<dyn MessageProcessor>,
    state: Mutex<Option<ActiveSubscriptions>>,
}

impl RabbitMQConsumer {
    pub fn new(
        endpoint: ResolvedEndpoint,
        profile: Arc<ConnectionProfile>,
        converter: Arc<dyn BodyConverter>,
        processor: Arc<dyn MessageProcessor>,
    ) -> Self {
        RabbitMQConsumer {
            endpoint,
            profile,
            converter,
            processor,
            state: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &ResolvedEndpoint {
        &self.endpoint
    }

    pub async fn is_started(&self) -> bool {
        self.state.lock().await.is_some()
    }

    /// Name of the queue consumed while started; broker-generated for
    /// endpoints without a queue name.
    pub async fn queue_name(&self) -> Option<String> {
        self.state.lock().await.as_ref().map(|s| s.queue.clone())
    }

    /// Declares the topology and opens the subscriptions. Does nothing when
    /// already started.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let mut state = self.state.lock().await;
        if state.is_some() {
            debug!(exchange = %self.endpoint.exchange_name, "consumer already started");
            return Ok(());
        }

        let admin = self.profile.admin_client().await?;
        let declared = TopologyResolver::new(admin.as_ref())
            .declare(&self.endpoint)
            .await?;
        let Some(queue) = declared.queue_name else {
            error!("consumer topology declared without a queue");
            return Err(AmqpError::InternalError);
        };

        let client = self.profile.subscribe_client().await?;
        let active = Arc::new(AtomicBool::new(true));
        let callback: Arc<dyn DeliveryCallback> = Arc::new(DeliveryDispatcher {
            exchange_name: self.endpoint.exchange_name.clone(),
            queue: queue.clone(),
            ack_mode: self.endpoint.options.acknowledge_mode,
            active: active.clone(),
            profile: self.profile.clone(),
            converter: self.converter.clone(),
            processor: self.processor.clone(),
        });

        let options = &self.endpoint.options;
        let mut subscriptions = Vec::with_capacity(options.concurrent_consumers.into());
        for _ in 0..options.concurrent_consumers.max(1) {
            match client
                .subscribe(
                    &queue,
                    options.prefetch_count,
                    options.acknowledge_mode,
                    callback.clone(),
                )
                .await
            {
                Ok(subscription) => subscriptions.push(subscription),
                Err(err) => {
                    error!(error = err.to_string(), queue = %queue, "error to subscribe to the queue");
                    active.store(false, Ordering::Release);
                    cancel_all(client.as_ref(), &subscriptions).await;
                    return Err(AmqpError::SubscribeError(root_cause_message(&err)));
                }
            }
        }

        info!(
            queue = %queue,
            exchange = %self.endpoint.exchange_name,
            consumers = subscriptions.len(),
            prefetch = options.prefetch_count,
            "consumer started"
        );

        *state = Some(ActiveSubscriptions {
            active,
            client,
            queue,
            subscriptions,
        });

        Ok(())
    }

    /// Cancels the subscriptions. No delivery is dispatched once this
    /// returns; deliveries the broker still hands over are requeued.
    pub async fn stop(&self) -> Result<(), AmqpError> {
        let Some(current) = self.state.lock().await.take() else {
            debug!(exchange = %self.endpoint.exchange_name, "consumer already stopped");
            return Ok(());
        };

        current.active.store(false, Ordering::Release);
        let failure = cancel_all(current.client.as_ref(), &current.subscriptions).await;

        info!(queue = %current.queue, "consumer stopped");
        match failure {
            Some(reason) => Err(AmqpError::SubscribeError(reason)),
            None => Ok(()),
        }
    }
}

/// Cancels every subscription, returning the first failure.
async fn cancel_all(client: &dyn SubscribeClient, subscriptions: &[Subscription]) -> Option<String> {
    let mut failure = None;
    for subscription in subscriptions {
        if let Err(err) = client.cancel(subscription).await {
            error!(
                error = err.to_string(),
                queue = %subscription.queue,
                tag = %subscription.tag,
                "error to cancel the subscription"
            );
            failure.get_or_insert_with(|| root_cause_message(&err));
        }
    }
    failure
}

/// Delivery callback shared by the subscriptions of one started consumer.
struct DeliveryDispatcher {
    exchange_name: String,
    queue: String,
    ack_mode: AcknowledgeMode,
    active: Arc<AtomicBool>,
    profile: Arc<ConnectionProfile>,
    converter: Arc<dyn BodyConverter>,
    processor: Arc<dyn MessageProcessor>,
}

#[async_trait]
impl DeliveryCallback for DeliveryDispatcher {
    async fn on_message(&self, wire: WireMessage, ack: Box<dyn AckHandle>) {
        if !self.active.load(Ordering::Acquire) {
            debug!(queue = %self.queue, "consumer stopped, returning delivery to the queue");
            if let Err(err) = ack.nack(true).await {
                error!(error = err.to_string(), "error whiling nack msg");
            }
            return;
        }

        let tracer = global::tracer(otel::CONSUMER_TRACER);
        let (ctx, mut span) = otel::new_span(&wire.headers, &tracer, &self.queue);

        if !self.ack_mode.is_deferred() {
            if let Err(err) = ack.ack().await {
                error!(error = err.to_string(), "error whiling ack msg");
                span.record_error(err.as_ref());
            }
        }

        let bridge = MessageBridge::new(self.converter.as_ref());
        let mut msg = match bridge.from_wire(&wire) {
            Ok(msg) => msg,
            Err(err) => {
                error!(error = err.to_string(), queue = %self.queue, "failure to convert delivery");
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from("failure to convert delivery"),
                });
                // an undecodable message is never requeued
                if self.ack_mode.is_deferred() {
                    settle(ack.as_ref(), false, &mut span).await;
                }
                return;
            }
        };
        msg.headers
            .insert(EXCHANGE_NAME.to_owned(), HeaderValue::from(self.exchange_name.as_str()));
        msg.headers
            .insert(QUEUE_NAME.to_owned(), HeaderValue::from(self.queue.as_str()));

        debug!(queue = %self.queue, message_id = ?msg.message_id, "received message");

        let result = self.processor.process(&ctx, &msg).await;
        let succeeded = result.is_ok();
        match &result {
            Ok(_) => {
                debug!("message successfully processed");
                span.set_status(Status::Ok);
            }
            Err(err) => {
                let err = AmqpError::DeliveryProcessingError(failure_message(err));
                match self.ack_mode {
                    AcknowledgeMode::Auto => {
                        error!(error = err.to_string(), queue = %self.queue, "error whiling handling msg")
                    }
                    _ => warn!(error = err.to_string(), "error whiling handling msg, requeuing for latter"),
                }
                span.record_error(&err);
                span.set_status(Status::Error {
                    description: Cow::from(err.to_string()),
                });
            }
        }

        if msg.is_in_out() {
            self.reply(&bridge, &wire, &msg, result, &mut span).await;
        }

        if self.ack_mode.is_deferred() {
            settle(ack.as_ref(), succeeded, &mut span).await;
        }
    }
}

impl DeliveryDispatcher {
    async fn reply(
        &self,
        bridge: &MessageBridge<'_>,
        request_wire: &WireMessage,
        request: &GenericMessage,
        result: Result<Option<GenericMessage>, AmqpError>,
        span: &mut impl Span,
    ) {
        let Some(reply_to) = request_wire.properties.reply_to.as_deref() else {
            return;
        };

        let mut reply = match result {
            Ok(Some(reply)) => reply,
            Ok(None) => GenericMessage {
                body: request.body.clone(),
                headers: request.headers.clone(),
                ..GenericMessage::default()
            },
            Err(err) => {
                let reason = failure_message(&err);
                GenericMessage::new(Body::Text(reason.clone())).with_header(EXCEPTION, reason)
            }
        };
        reply.headers.remove(REPLY_TO);
        reply.headers.remove(CORRELATION_ID);

        let mut wire = match bridge.to_wire(&reply) {
            Ok(wire) => wire,
            Err(err) => {
                error!(error = err.to_string(), "failure to convert reply");
                span.record_error(&err);
                return;
            }
        };
        wire.properties.correlation_id = request_wire.properties.correlation_id.clone();

        let publisher = match self.profile.publish_client().await {
            Ok(publisher) => publisher,
            Err(err) => {
                error!(error = err.to_string(), "cannot reply without a publish client");
                span.record_error(&err);
                return;
            }
        };

        debug!(reply_to = reply_to, correlation_id = ?wire.properties.correlation_id, "sending reply");
        if let Err(err) = publisher.publish("", reply_to, &wire).await {
            error!(error = err.to_string(), reply_to = reply_to, "error publishing reply");
            span.record_error(err.as_ref());
        }
    }
}

async fn settle(ack: &dyn AckHandle, succeeded: bool, span: &mut impl Span) {
    let res = if succeeded {
        ack.ack().await.map_err(|err| (err, AmqpError::AckMessageError))
    } else {
        ack.nack(true).await.map_err(|err| (err, AmqpError::NackMessageError))
    };

    if let Err((err, kind)) = res {
        error!(error = err.to_string(), "{}", kind);
        span.record_error(err.as_ref());
        span.set_status(Status::Error {
            description: Cow::from(kind.to_string()),
        });
    }
}

/// Message reported to the requester for a failed request.
fn failure_message(err: &AmqpError) -> String {
    match err {
        AmqpError::DeliveryProcessingError(reason) => reason.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        address::EndpointDescriptor,
        body::DefaultBodyConverter,
        client::{
            testing::{FixedFactory, RecordingAck},
            MockAdminClient, MockPublishClient, MockSubscribeClient,
        },
        registry::ConnectionRegistry,
    };
    use std::sync::Mutex as StdMutex;

    type Captured = Arc<StdMutex<Vec<Arc<dyn DeliveryCallback>>>>;

    fn admin() -> MockAdminClient {
        let mut admin = MockAdminClient::new();
        admin.expect_declare_exchange().returning(|_| Ok(()));
        admin
            .expect_declare_queue()
            .returning(|def| Ok(def.name().unwrap_or("amq.gen-1").to_owned()));
        admin.expect_bind().returning(|_| Ok(()));
        admin
    }

    fn subscriber(captured: Captured) -> MockSubscribeClient {
        let mut client = MockSubscribeClient::new();
        client
            .expect_subscribe()
            .returning(move |queue, _, _, callback| {
                let mut all = captured.lock().unwrap();
                all.push(callback);
                Ok(Subscription {
                    queue: queue.to_owned(),
                    tag: format!("ctag-{}", all.len()),
                })
            });
        client.expect_cancel().returning(|_| Ok(()));
        client
    }

    fn consumer(
        address: &str,
        publish: MockPublishClient,
        subscribe: MockSubscribeClient,
        processor: MockMessageProcessor,
    ) -> RabbitMQConsumer {
        let factory = FixedFactory::new(Arc::new(publish), Arc::new(admin()), Arc::new(subscribe));
        let profile = ConnectionRegistry::with_factory(Arc::new(factory))
            .profile(None)
            .unwrap();
        RabbitMQConsumer::new(
            EndpointDescriptor::parse(address).unwrap().as_consumer_role(),
            profile,
            Arc::new(DefaultBodyConverter),
            Arc::new(processor),
        )
    }

    #[tokio::test]
    async fn start_and_stop_are_idempotent() {
        let captured = Captured::default();
        let consumer = consumer(
            "exchange1:queue1:test.a?concurrentConsumers=2",
            MockPublishClient::new(),
            subscriber(captured.clone()),
            MockMessageProcessor::new(),
        );

        consumer.start().await.unwrap();
        consumer.start().await.unwrap();
        assert_eq!(captured.lock().unwrap().len(), 2);
        assert_eq!(consumer.queue_name().await.as_deref(), Some("queue1"));

        consumer.stop().await.unwrap();
        consumer.stop().await.unwrap();
        assert!(!consumer.is_started().await);

        consumer.start().await.unwrap();
        assert_eq!(captured.lock().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn auto_mode_acks_before_a_failing_processor() {
        let captured = Captured::default();
        let mut processor = MockMessageProcessor::new();
        processor
            .expect_process()
            .withf(|_, msg| {
                msg.header(QUEUE_NAME) == Some(&HeaderValue::from("queue1"))
                    && msg.header(EXCHANGE_NAME) == Some(&HeaderValue::from("exchange1"))
            })
            .times(1)
            .returning(|_, _| Err(AmqpError::DeliveryProcessingError("boom".to_owned())));
        let consumer = consumer(
            "exchange1:queue1:test.a",
            MockPublishClient::new(),
            subscriber(captured.clone()),
            processor,
        );
        consumer.start().await.unwrap();

        let (ack, settled) = RecordingAck::new();
        let callback = captured.lock().unwrap()[0].clone();
        callback.on_message(WireMessage::new("x"), Box::new(ack)).await;

        assert_eq!(*settled.lock().unwrap(), vec!["ack"]);
    }

    #[tokio::test]
    async fn manual_mode_requeues_failed_deliveries() {
        let captured = Captured::default();
        let mut processor = MockMessageProcessor::new();
        processor
            .expect_process()
            .returning(|_, msg| match msg.body.as_text() {
                Some("bad") => Err(AmqpError::DeliveryProcessingError("rejected".to_owned())),
                _ => Ok(None),
            });
        let consumer = consumer(
            "exchange1:queue1:test.a?acknowledgeMode=manual",
            MockPublishClient::new(),
            subscriber(captured.clone()),
            processor,
        );
        consumer.start().await.unwrap();
        let callback = captured.lock().unwrap()[0].clone();

        let (ack, settled) = RecordingAck::new();
        callback.on_message(WireMessage::new("bad"), Box::new(ack)).await;
        assert_eq!(*settled.lock().unwrap(), vec!["nack:requeue"]);

        let (ack, settled) = RecordingAck::new();
        callback.on_message(WireMessage::new("good"), Box::new(ack)).await;
        assert_eq!(*settled.lock().unwrap(), vec!["ack"]);
    }

    #[tokio::test]
    async fn deliveries_after_stop_are_returned_to_the_queue() {
        let captured = Captured::default();
        let mut processor = MockMessageProcessor::new();
        processor.expect_process().never();
        let consumer = consumer(
            "exchange1:queue1:test.a",
            MockPublishClient::new(),
            subscriber(captured.clone()),
            processor,
        );
        consumer.start().await.unwrap();
        let callback = captured.lock().unwrap()[0].clone();
        consumer.stop().await.unwrap();

        let (ack, settled) = RecordingAck::new();
        callback.on_message(WireMessage::new("late"), Box::new(ack)).await;

        assert_eq!(*settled.lock().unwrap(), vec!["nack:requeue"]);
    }

    #[tokio::test]
    async fn failed_requests_are_answered_with_an_exception_reply() {
        let captured = Captured::default();
        let mut processor = MockMessageProcessor::new();
        processor
            .expect_process()
            .returning(|_, _| Err(AmqpError::DeliveryProcessingError("handler exploded".to_owned())));
        let mut publish = MockPublishClient::new();
        publish
            .expect_publish()
            .withf(|exchange, routing_key, wire| {
                exchange.is_empty()
                    && routing_key == "amq.gen-reply"
                    && wire.properties.correlation_id.as_deref() == Some("corr-1")
                    && wire.properties.reply_to.is_none()
                    && wire.headers.get(EXCEPTION) == Some(&HeaderValue::from("handler exploded"))
            })
            .times(1)
            .returning(|_, _, _| Ok(()));
        let consumer = consumer(
            "exchange1:queue1:test.a",
            publish,
            subscriber(captured.clone()),
            processor,
        );
        consumer.start().await.unwrap();

        let mut request = WireMessage::new("REQUEST");
        request.properties.reply_to = Some("amq.gen-reply".to_owned());
        request.properties.correlation_id = Some("corr-1".to_owned());
        let (ack, _) = RecordingAck::new();
        let callback = captured.lock().unwrap()[0].clone();
        callback.on_message(request, Box::new(ack)).await;
    }

    #[tokio::test]
    async fn subscribe_failure_fails_start() {
        let mut subscribe = MockSubscribeClient::new();
        subscribe
            .expect_subscribe()
            .returning(|_, _, _, _| Err("ACCESS_REFUSED".into()));
        let consumer = consumer(
            "exchange1:queue1:test.a",
            MockPublishClient::new(),
            subscribe,
            MockMessageProcessor::new(),
        );

        assert_eq!(
            consumer.start().await,
            Err(AmqpError::SubscribeError("ACCESS_REFUSED".to_owned()))
        );
        assert!(!consumer.is_started().await);
    }
}
