// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Endpoint Producer
//!
//! Publishes generic messages to the exchange resolved for an endpoint and
//! correlates request-reply exchanges.
//!
//! Requests are published with a reply destination and a fresh correlation
//! id. The reply destination is provisioned on the first request and shared
//! by every request of the producer; a listener on it completes the pending
//! request whose correlation id the reply carries. Pending requests are
//! evicted when their reply arrives, when their deadline passes or when the
//! publish fails.

use crate::{
    address::ResolvedEndpoint,
    body::BodyConverter,
    bridge::{self, MessageBridge, EXCEPTION},
    client::{AckHandle, DeliveryCallback, PublishClient, SubscribeClient, Subscription},
    errors::{root_cause_message, AmqpError},
    message::{ExchangePattern, GenericMessage, WireMessage},
    otel,
    queue::AcknowledgeMode,
    registry::ConnectionProfile,
    topology::TopologyResolver,
};
use async_trait::async_trait;
use opentelemetry::Context;
use std::{
    collections::HashMap,
    future::Future,
    pin::Pin,
    sync::Arc,
    task::Poll,
    time::{Duration, Instant},
};
use tokio::{
    sync::{oneshot, Mutex},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Prefetch count of the reply listener.
pub const REPLY_PREFETCH_COUNT: u16 = 100;

struct PendingReply {
    sender: oneshot::Sender<WireMessage>,
    deadline: Instant,
}

/// In-flight requests keyed by correlation id.
#[derive(Default)]
pub(crate) struct PendingReplies {
    entries: Mutex<HashMap<String, PendingReply>>,
}

impl PendingReplies {
    /// Registers a request. Entries whose deadline already passed are purged
    /// on the way.
    async fn register(&self, correlation_id: &str, timeout: Duration) -> oneshot::Receiver<WireMessage> {
        let (sender, receiver) = oneshot::channel();
        let now = Instant::now();

        let mut entries = self.entries.lock().await;
        entries.retain(|id, pending| {
            let alive = pending.deadline > now;
            if !alive {
                debug!(correlation_id = %id, "purging expired pending reply");
            }
            alive
        });
        entries.insert(
            correlation_id.to_owned(),
            PendingReply {
                sender,
                deadline: now + timeout,
            },
        );

        receiver
    }

    /// Hands a reply to its request. Returns false for unknown correlation ids.
    async fn complete(&self, correlation_id: &str, reply: WireMessage) -> bool {
        let Some(pending) = self.entries.lock().await.remove(correlation_id) else {
            return false;
        };
        pending.sender.send(reply).is_ok()
    }

    async fn evict(&self, correlation_id: &str) -> bool {
        self.entries.lock().await.remove(correlation_id).is_some()
    }

    /// Drops every entry; their waiters observe an abandoned request.
    async fn clear(&self) -> usize {
        let mut entries = self.entries.lock().await;
        let dropped = entries.len();
        entries.clear();
        dropped
    }

    async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}

/// Completes pending requests from the reply destination.
struct ReplyListener {
    replies: Arc<PendingReplies>,
}

#[async_trait]
impl DeliveryCallback for ReplyListener {
    async fn on_message(&self, msg: WireMessage, ack: Box<dyn AckHandle>) {
        if let Err(err) = ack.ack().await {
            error!(error = err.to_string(), "error whiling ack reply");
        }

        let Some(correlation_id) = msg.properties.correlation_id.clone() else {
            warn!("discarding reply without correlation id");
            return;
        };

        if !self.replies.complete(&correlation_id, msg).await {
            warn!(correlation_id = %correlation_id, "discarding reply for an unknown or expired request");
        }
    }
}

struct ReplyChannel {
    destination: String,
    subscriber: Arc<dyn SubscribeClient>,
    subscription: Subscription,
}

enum ReplyState {
    Failed(Option<AmqpError>),
    Waiting(JoinHandle<Result<GenericMessage, AmqpError>>),
}

/// Completion handle of an asynchronous request.
///
/// Resolves to the reply, or to the error that ended the request: a publish
/// failure, a timeout, or an error reported by the consumer.
pub struct ReplyHandle {
    correlation_id: Option<String>,
    state: ReplyState,
}

impl ReplyHandle {
    fn failed(err: AmqpError) -> Self {
        ReplyHandle {
            correlation_id: None,
            state: ReplyState::Failed(Some(err)),
        }
    }

    /// Correlation id of the published request; `None` when it was never published.
    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }
}

impl Future for ReplyHandle {
    type Output = Result<GenericMessage, AmqpError>;

    fn poll(self: Pin<&mut Self>, cx: &mut std::task::Context<'_>) -> Poll<Self::Output> {
        match &mut self.get_mut().state {
            ReplyState::Failed(err) => Poll::Ready(Err(err.take().unwrap_or(AmqpError::InternalError))),
            ReplyState::Waiting(task) => Pin::new(task).poll(cx).map(|joined| {
                joined.unwrap_or_else(|err| {
                    error!(error = err.to_string(), "reply task failed");
                    Err(AmqpError::InternalError)
                })
            }),
        }
    }
}

/// Producer side of an endpoint.
pub struct RabbitMQProducer {
    endpoint: ResolvedEndpoint,
    profile: Arc<ConnectionProfile>,
    converter: Arc<dyn BodyConverter>,
    default_timeout: Duration,
    publisher: Mutex<Option<Arc<dyn PublishClient>>>,
    reply_channel: Mutex<Option<ReplyChannel>>,
    replies: Arc<PendingReplies>,
}

impl RabbitMQProducer {
    pub fn new(
        endpoint: ResolvedEndpoint,
        profile: Arc<ConnectionProfile>,
        converter: Arc<dyn BodyConverter>,
        default_timeout: Duration,
    ) -> Self {
        RabbitMQProducer {
            endpoint,
            profile,
            converter,
            default_timeout,
            publisher: Mutex::new(None),
            reply_channel: Mutex::new(None),
            replies: Arc::new(PendingReplies::default()),
        }
    }

    pub fn endpoint(&self) -> &ResolvedEndpoint {
        &self.endpoint
    }

    pub async fn is_started(&self) -> bool {
        self.publisher.lock().await.is_some()
    }

    /// Number of requests still waiting for a reply.
    pub async fn pending_replies(&self) -> usize {
        self.replies.len().await
    }

    /// Declares the exchange and acquires the publish client. Does nothing
    /// when already started.
    pub async fn start(&self) -> Result<(), AmqpError> {
        let mut publisher = self.publisher.lock().await;
        if publisher.is_some() {
            debug!(exchange = %self.endpoint.exchange_name, "producer already started");
            return Ok(());
        }

        let admin = self.profile.admin_client().await?;
        TopologyResolver::new(admin.as_ref())
            .declare(&self.endpoint)
            .await?;

        *publisher = Some(self.profile.publish_client().await?);
        info!(exchange = %self.endpoint.exchange_name, kind = %self.endpoint.kind, "producer started");

        Ok(())
    }

    /// Releases the reply destination. Requests still waiting for a reply
    /// fail with [`AmqpError::RequestAbandonedError`].
    pub async fn stop(&self) -> Result<(), AmqpError> {
        if self.publisher.lock().await.take().is_none() {
            debug!(exchange = %self.endpoint.exchange_name, "producer already stopped");
            return Ok(());
        }

        let mut result = Ok(());
        if let Some(channel) = self.reply_channel.lock().await.take() {
            if let Err(err) = channel.subscriber.cancel(&channel.subscription).await {
                error!(error = err.to_string(), queue = %channel.destination, "error to cancel the reply listener");
                result = Err(AmqpError::SubscribeError(root_cause_message(&err)));
            }
        }

        let abandoned = self.replies.clear().await;
        if abandoned > 0 {
            warn!(abandoned, "producer stopped with requests waiting for replies");
        }

        info!(exchange = %self.endpoint.exchange_name, "producer stopped");
        result
    }

    /// Publishes a message without waiting for a reply.
    pub async fn send(&self, msg: &GenericMessage) -> Result<(), AmqpError> {
        let publisher = self.current_publisher().await?;

        let mut wire = MessageBridge::new(self.converter.as_ref()).to_wire(msg)?;
        self.prepare(&mut wire);

        self.publish(publisher.as_ref(), msg, &wire).await
    }

    /// Publishes a request and waits for its reply.
    pub async fn request(&self, msg: &GenericMessage, timeout: Duration) -> Result<GenericMessage, AmqpError> {
        self.request_async(msg, timeout).await.await
    }

    /// Publishes a request and returns a handle completing with its reply.
    ///
    /// The deadline runs from the publish whether or not the handle is polled.
    pub async fn request_async(&self, msg: &GenericMessage, timeout: Duration) -> ReplyHandle {
        match self.publish_request(msg, timeout).await {
            Ok(handle) => handle,
            Err(err) => ReplyHandle::failed(err),
        }
    }

    /// Sends `msg` according to its exchange pattern. Requests wait for their
    /// reply with the producer's default timeout.
    pub async fn process(&self, msg: &GenericMessage) -> Result<Option<GenericMessage>, AmqpError> {
        match msg.pattern {
            ExchangePattern::InOnly => self.send(msg).await.map(|_| None),
            ExchangePattern::InOut => self.request(msg, self.default_timeout).await.map(Some),
        }
    }

    async fn publish_request(&self, msg: &GenericMessage, timeout: Duration) -> Result<ReplyHandle, AmqpError> {
        let publisher = self.current_publisher().await?;
        let reply_to = self.reply_destination(publisher.as_ref()).await?;

        let bridge = MessageBridge::new(self.converter.as_ref());
        let (mut wire, correlation_id) = bridge.to_wire_request(msg, &reply_to)?;
        self.prepare(&mut wire);

        let receiver = self.replies.register(&correlation_id, timeout).await;
        if let Err(err) = self.publish(publisher.as_ref(), msg, &wire).await {
            self.replies.evict(&correlation_id).await;
            return Err(err);
        }
        debug!(correlation_id = %correlation_id, reply_to = %reply_to, "request published");

        let replies = self.replies.clone();
        let converter = self.converter.clone();
        let id = correlation_id.clone();
        let task = tokio::spawn(async move {
            match tokio::time::timeout(timeout, receiver).await {
                Ok(Ok(reply)) => decode_reply(converter.as_ref(), &reply),
                Ok(Err(_)) => Err(AmqpError::RequestAbandonedError),
                Err(_) => {
                    replies.evict(&id).await;
                    warn!(correlation_id = %id, "no reply before the deadline");
                    Err(AmqpError::TimeoutError(timeout.as_millis() as u64))
                }
            }
        });

        Ok(ReplyHandle {
            correlation_id: Some(correlation_id),
            state: ReplyState::Waiting(task),
        })
    }

    async fn current_publisher(&self) -> Result<Arc<dyn PublishClient>, AmqpError> {
        match self.publisher.lock().await.as_ref() {
            Some(publisher) => Ok(publisher.clone()),
            None => {
                error!(exchange = %self.endpoint.exchange_name, "producer used while stopped");
                Err(AmqpError::NotStartedError)
            }
        }
    }

    async fn reply_destination(&self, publisher: &dyn PublishClient) -> Result<String, AmqpError> {
        let mut channel = self.reply_channel.lock().await;
        if let Some(channel) = channel.as_ref() {
            return Ok(channel.destination.clone());
        }

        let destination = publisher
            .provision_reply_destination()
            .await
            .map_err(|err| {
                error!(error = err.to_string(), "failure to provision the reply destination");
                AmqpError::PublishError(root_cause_message(&err))
            })?;

        let subscriber = self.profile.subscribe_client().await?;
        let listener = Arc::new(ReplyListener {
            replies: self.replies.clone(),
        });
        let subscription = subscriber
            .subscribe(
                &destination.queue,
                REPLY_PREFETCH_COUNT,
                AcknowledgeMode::Auto,
                listener,
            )
            .await
            .map_err(|err| {
                error!(error = err.to_string(), queue = %destination.queue, "error to listen for replies");
                AmqpError::SubscribeError(root_cause_message(&err))
            })?;

        info!(queue = %destination.queue, "reply destination ready");
        *channel = Some(ReplyChannel {
            destination: destination.queue.clone(),
            subscriber,
            subscription,
        });

        Ok(destination.queue)
    }

    fn prepare(&self, wire: &mut WireMessage) {
        if wire.properties.message_id.is_none() {
            wire.properties.message_id = Some(Uuid::new_v4().to_string());
        }
        if let Some(ttl) = self.endpoint.options.time_to_live {
            wire.properties.expiration = Some(ttl.to_string());
        }
        otel::inject(&Context::current(), &mut wire.headers);
    }

    async fn publish(
        &self,
        publisher: &dyn PublishClient,
        msg: &GenericMessage,
        wire: &WireMessage,
    ) -> Result<(), AmqpError> {
        let routing_key = bridge::routing_key_for(msg, self.endpoint.routing_key.as_deref());

        publisher
            .publish(&self.endpoint.exchange_name, &routing_key, wire)
            .await
            .map_err(|err| {
                error!(
                    error = err.to_string(),
                    exchange = %self.endpoint.exchange_name,
                    routing_key = %routing_key,
                    "error publishing message"
                );
                AmqpError::PublishError(root_cause_message(&err))
            })
    }
}

/// Turns a reply into the requester's result; replies flagged with the
/// exception header carry the consumer's failure.
fn decode_reply(converter: &dyn BodyConverter, reply: &WireMessage) -> Result<GenericMessage, AmqpError> {
    if let Some(reason) = reply.headers.get(EXCEPTION) {
        return Err(AmqpError::DeliveryProcessingError(reason.to_string()));
    }

    MessageBridge::new(converter).from_wire(reply)
}
