// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # In-Memory Broker
//!
//! An in-process broker implementing every client boundary, for tests and
//! for running endpoints without a RabbitMQ server.
//!
//! Routing follows AMQP 0-9-1 semantics for the default, direct, fanout,
//! topic and headers exchanges. A queue gets at most one copy of a message
//! however many of its bindings match, and unroutable messages are dropped.
//!
//! Each subscription is served by a task handing deliveries to its callback
//! one at a time, holding back once `prefetch` deliveries are unsettled.
//! Deliveries still unsettled when a subscription is cancelled go back to
//! the front of their queue, and an auto-delete queue is deleted together
//! with its bindings when its last subscription is cancelled.

use crate::{
    client::{
        AckHandle, AdminClient, ConnectionFactory, ConnectionIdentity, DeliveryCallback,
        PublishClient, ReplyDestination, SubscribeClient, Subscription,
    },
    errors::BoxError,
    exchange::{ExchangeDefinition, ExchangeKind, MatchMode},
    message::WireMessage,
    queue::{AcknowledgeMode, BindingArgs, QueueBinding, QueueDefinition},
};
use async_trait::async_trait;
use std::{
    collections::{BTreeSet, HashMap, VecDeque},
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex as SyncMutex, PoisonError,
    },
    time::{Duration, Instant},
};
use tokio::{
    sync::{Mutex, Notify, Semaphore},
    task::JoinHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Prefix of broker-generated queue names.
pub const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";

struct Enqueued {
    msg: WireMessage,
    expires_at: Option<Instant>,
}

struct MemoryQueue {
    name: String,
    auto_delete: bool,
    ttl: Option<u32>,
    messages: Mutex<VecDeque<Enqueued>>,
    notify: Notify,
    consumers: AtomicUsize,
}

impl MemoryQueue {
    fn new(name: &str, def: &QueueDefinition) -> Self {
        MemoryQueue {
            name: name.to_owned(),
            auto_delete: def.is_auto_delete(),
            ttl: def.message_ttl(),
            messages: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            consumers: AtomicUsize::new(0),
        }
    }

    /// Enqueues a message. The shorter of the message expiration and the
    /// queue TTL applies.
    async fn enqueue(&self, msg: WireMessage) {
        let message_ttl = msg
            .properties
            .expiration
            .as_deref()
            .and_then(|v| v.parse::<u64>().ok());
        let ttl = match (message_ttl, self.ttl.map(u64::from)) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };

        self.messages.lock().await.push_back(Enqueued {
            msg,
            expires_at: ttl.map(|ms| Instant::now() + Duration::from_millis(ms)),
        });
        self.notify.notify_one();
    }

    async fn requeue(&self, mut returned: Vec<(u64, WireMessage)>) {
        if returned.is_empty() {
            return;
        }

        returned.sort_by_key(|(tag, _)| *tag);
        let mut messages = self.messages.lock().await;
        for (_, msg) in returned.into_iter().rev() {
            messages.push_front(Enqueued {
                msg,
                expires_at: None,
            });
        }
        drop(messages);
        self.notify.notify_one();
    }

    /// Waits for the next live message.
    async fn receive(&self) -> WireMessage {
        loop {
            {
                let now = Instant::now();
                let mut messages = self.messages.lock().await;
                while let Some(next) = messages.pop_front() {
                    match next.expires_at {
                        Some(at) if at <= now => debug!(queue = %self.name, "dropping expired message"),
                        _ => {
                            if !messages.is_empty() {
                                self.notify.notify_one();
                            }
                            return next.msg;
                        }
                    }
                }
            }
            self.notify.notified().await;
        }
    }

    async fn depth(&self) -> usize {
        self.messages.lock().await.len()
    }
}

struct MemoryExchange {
    kind: ExchangeKind,
    bindings: Vec<QueueBinding>,
}

impl MemoryExchange {
    /// Names of the queues bound to receive a message.
    fn route(&self, routing_key: &str, msg: &WireMessage) -> BTreeSet<String> {
        self.bindings
            .iter()
            .filter(|binding| match self.kind {
                ExchangeKind::Direct => binding.key() == routing_key,
                ExchangeKind::Fanout => true,
                ExchangeKind::Topic => topic_matches(binding.key(), routing_key),
                ExchangeKind::Headers => binding
                    .args()
                    .is_some_and(|args| headers_match(args, msg)),
                ExchangeKind::Default => false,
            })
            .map(|binding| binding.queue_name().to_owned())
            .collect()
    }
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, MemoryExchange>,
    queues: HashMap<String, Arc<MemoryQueue>>,
    exchange_declarations: usize,
    queue_declarations: usize,
}

impl Topology {
    fn delete_queue(&mut self, name: &str) {
        if self.queues.remove(name).is_some() {
            for exchange in self.exchanges.values_mut() {
                exchange.bindings.retain(|b| b.queue_name() != name);
            }
            info!(queue = name, "auto-delete queue removed");
        }
    }
}

struct MemorySubscription {
    queue: Arc<MemoryQueue>,
    permits: Semaphore,
    next_tag: AtomicU64,
    unacked: SyncMutex<HashMap<u64, WireMessage>>,
}

impl MemorySubscription {
    fn track(&self, msg: WireMessage) -> u64 {
        let tag = self.next_tag.fetch_add(1, Ordering::AcqRel);
        self.unacked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(tag, msg);
        tag
    }

    fn untrack_all(&self) -> Vec<(u64, WireMessage)> {
        self.unacked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect()
    }

    async fn settle(&self, tag: u64, requeue: bool) {
        let removed = self
            .unacked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&tag);
        let Some(msg) = removed else {
            debug!(tag, "delivery already settled");
            return;
        };

        if requeue {
            self.queue.requeue(vec![(tag, msg)]).await;
        }
        self.permits.add_permits(1);
    }
}

struct MemoryAck {
    subscription: Arc<MemorySubscription>,
    tag: u64,
}

#[async_trait]
impl AckHandle for MemoryAck {
    async fn ack(&self) -> Result<(), BoxError> {
        self.subscription.settle(self.tag, false).await;
        Ok(())
    }

    async fn nack(&self, requeue: bool) -> Result<(), BoxError> {
        self.subscription.settle(self.tag, requeue).await;
        Ok(())
    }
}

struct Broker {
    identity: ConnectionIdentity,
    topology: Mutex<Topology>,
    subscriptions: Mutex<HashMap<String, (Arc<MemorySubscription>, JoinHandle<()>)>>,
}

/// In-process broker. Clones share the same broker.
#[derive(Clone)]
pub struct InMemoryBroker {
    inner: Arc<Broker>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        InMemoryBroker::new(ConnectionIdentity::new("memory", 0, "/"))
    }
}

impl InMemoryBroker {
    pub fn new(identity: ConnectionIdentity) -> Self {
        InMemoryBroker {
            inner: Arc::new(Broker {
                identity,
                topology: Mutex::new(Topology::default()),
                subscriptions: Mutex::new(HashMap::default()),
            }),
        }
    }

    pub async fn exchange_kind(&self, name: &str) -> Option<ExchangeKind> {
        self.inner.topology.lock().await.exchanges.get(name).map(|e| e.kind)
    }

    /// Bindings of an exchange; zero for unknown exchanges.
    pub async fn binding_count(&self, exchange: &str) -> usize {
        self.inner
            .topology
            .lock()
            .await
            .exchanges
            .get(exchange)
            .map_or(0, |e| e.bindings.len())
    }

    pub async fn has_queue(&self, name: &str) -> bool {
        self.inner.topology.lock().await.queues.contains_key(name)
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.inner.topology.lock().await.queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Messages waiting in a queue, not counting unsettled deliveries.
    pub async fn queue_depth(&self, name: &str) -> Option<usize> {
        let queue = self.inner.topology.lock().await.queues.get(name).cloned()?;
        Some(queue.depth().await)
    }

    pub async fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .topology
            .lock()
            .await
            .queues
            .get(queue)
            .map_or(0, |q| q.consumers.load(Ordering::Acquire))
    }

    /// Number of exchange and queue declarations received, including
    /// redeclarations of existing objects.
    pub async fn declarations(&self) -> (usize, usize) {
        let topology = self.inner.topology.lock().await;
        (topology.exchange_declarations, topology.queue_declarations)
    }

    async fn declare_generated_queue(&self, def: &QueueDefinition) -> String {
        let mut topology = self.inner.topology.lock().await;
        topology.queue_declarations += 1;

        let name = match def.name() {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => format!("{}{}", GENERATED_QUEUE_PREFIX, Uuid::new_v4()),
        };
        if !topology.queues.contains_key(&name) {
            debug!(queue = %name, "queue created");
            topology
                .queues
                .insert(name.clone(), Arc::new(MemoryQueue::new(&name, def)));
        }
        name
    }
}

#[async_trait]
impl AdminClient for InMemoryBroker {
    fn identity(&self) -> ConnectionIdentity {
        self.inner.identity.clone()
    }

    async fn declare_exchange(&self, def: &ExchangeDefinition) -> Result<(), BoxError> {
        if def.exchange_kind() == ExchangeKind::Default || def.name().is_empty() {
            return Err("ACCESS_REFUSED - the default exchange cannot be declared".into());
        }

        let mut topology = self.inner.topology.lock().await;
        topology.exchange_declarations += 1;

        match topology.exchanges.get(def.name()) {
            Some(existing) if existing.kind != def.exchange_kind() => Err(format!(
                "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                def.name(),
                def.exchange_kind(),
                existing.kind
            )
            .into()),
            Some(_) => Ok(()),
            None => {
                debug!(exchange = def.name(), kind = %def.exchange_kind(), "exchange created");
                topology.exchanges.insert(
                    def.name().to_owned(),
                    MemoryExchange {
                        kind: def.exchange_kind(),
                        bindings: vec![],
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, def: &QueueDefinition) -> Result<String, BoxError> {
        Ok(self.declare_generated_queue(def).await)
    }

    async fn bind(&self, binding: &QueueBinding) -> Result<(), BoxError> {
        let mut topology = self.inner.topology.lock().await;

        if !topology.queues.contains_key(binding.queue_name()) {
            return Err(format!("NOT_FOUND - no queue '{}'", binding.queue_name()).into());
        }
        let Some(exchange) = topology.exchanges.get_mut(binding.exchange_name()) else {
            return Err(format!("NOT_FOUND - no exchange '{}'", binding.exchange_name()).into());
        };

        if !exchange.bindings.contains(binding) {
            exchange.bindings.push(binding.clone());
        }
        Ok(())
    }
}

#[async_trait]
impl PublishClient for InMemoryBroker {
    fn identity(&self) -> ConnectionIdentity {
        self.inner.identity.clone()
    }

    async fn publish(&self, exchange: &str, routing_key: &str, msg: &WireMessage) -> Result<(), BoxError> {
        let targets: Vec<Arc<MemoryQueue>> = {
            let topology = self.inner.topology.lock().await;
            let names = if exchange.is_empty() {
                BTreeSet::from([routing_key.to_owned()])
            } else {
                match topology.exchanges.get(exchange) {
                    Some(e) => e.route(routing_key, msg),
                    None => return Err(format!("NOT_FOUND - no exchange '{}'", exchange).into()),
                }
            };
            names
                .iter()
                .filter_map(|name| topology.queues.get(name).cloned())
                .collect()
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "message is unroutable, dropping it");
        }
        for queue in targets {
            queue.enqueue(msg.clone()).await;
        }
        Ok(())
    }

    async fn provision_reply_destination(&self) -> Result<ReplyDestination, BoxError> {
        let queue = self
            .declare_generated_queue(&QueueDefinition::temporary())
            .await;
        Ok(ReplyDestination { queue })
    }
}

#[async_trait]
impl SubscribeClient for InMemoryBroker {
    async fn subscribe(
        &self,
        queue: &str,
        prefetch_count: u16,
        ack_mode: AcknowledgeMode,
        callback: Arc<dyn DeliveryCallback>,
    ) -> Result<Subscription, BoxError> {
        let Some(target) = self.inner.topology.lock().await.queues.get(queue).cloned() else {
            return Err(format!("NOT_FOUND - no queue '{}'", queue).into());
        };
        target.consumers.fetch_add(1, Ordering::AcqRel);

        let subscription = Arc::new(MemorySubscription {
            queue: target,
            permits: Semaphore::new(usize::from(prefetch_count.max(1))),
            next_tag: AtomicU64::new(1),
            unacked: SyncMutex::new(HashMap::default()),
        });

        let delivering = subscription.clone();
        let task = tokio::spawn(async move {
            loop {
                match delivering.permits.acquire().await {
                    Ok(permit) => permit.forget(),
                    Err(_) => return,
                }

                let msg = delivering.queue.receive().await;
                let tag = delivering.track(msg.clone());
                let ack = Box::new(MemoryAck {
                    subscription: delivering.clone(),
                    tag,
                });
                callback.on_message(msg, ack).await;
            }
        });

        let tag = format!("ctag-{}", Uuid::new_v4());
        debug!(queue, tag = %tag, ack_mode = ?ack_mode, prefetch = prefetch_count, "consuming");
        self.inner
            .subscriptions
            .lock()
            .await
            .insert(tag.clone(), (subscription, task));

        Ok(Subscription {
            queue: queue.to_owned(),
            tag,
        })
    }

    async fn cancel(&self, subscription: &Subscription) -> Result<(), BoxError> {
        let Some((active, task)) = self.inner.subscriptions.lock().await.remove(&subscription.tag) else {
            warn!(tag = %subscription.tag, "cancelling an unknown subscription");
            return Ok(());
        };

        active.permits.close();
        task.abort();
        let _ = task.await;

        let returned = active.untrack_all();
        if !returned.is_empty() {
            debug!(count = returned.len(), queue = %active.queue.name, "returning unsettled deliveries");
        }
        active.queue.requeue(returned).await;

        let remaining = active.queue.consumers.fetch_sub(1, Ordering::AcqRel).saturating_sub(1);
        if remaining == 0 && active.queue.auto_delete {
            self.inner.topology.lock().await.delete_queue(&active.queue.name);
        }
        Ok(())
    }
}

#[async_trait]
impl ConnectionFactory for InMemoryBroker {
    fn identity(&self) -> ConnectionIdentity {
        self.inner.identity.clone()
    }

    async fn create_publish_client(&self) -> Result<Arc<dyn PublishClient>, BoxError> {
        Ok(Arc::new(self.clone()))
    }

    async fn create_admin_client(&self) -> Result<Arc<dyn AdminClient>, BoxError> {
        Ok(Arc::new(self.clone()))
    }

    async fn create_subscribe_client(&self) -> Result<Arc<dyn SubscribeClient>, BoxError> {
        Ok(Arc::new(self.clone()))
    }
}

/// Matches a routing key against a binding pattern, where `*` stands for
/// exactly one word and `#` for zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    fn matches(pattern: &[&str], key: &[&str]) -> bool {
        match (pattern.split_first(), key.split_first()) {
            (None, None) => true,
            (Some((&"#", rest)), _) => {
                matches(rest, key) || key.split_first().is_some_and(|(_, tail)| matches(pattern, tail))
            }
            (Some((&"*", rest)), Some((_, tail))) => matches(rest, tail),
            (Some((word, rest)), Some((head, tail))) if word == head => matches(rest, tail),
            _ => false,
        }
    }

    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    matches(&pattern, &key)
}

/// Evaluates a headers binding. Argument names starting with `x-` are not
/// matched against.
pub fn headers_match(args: &BindingArgs, msg: &WireMessage) -> bool {
    let mut pairs = args.values.iter().filter(|(key, _)| !key.starts_with("x-"));
    let matched = |(key, value): &(String, String)| {
        msg.headers
            .get(key)
            .is_some_and(|header| header.to_string() == *value)
    };

    match args.mode {
        MatchMode::All => pairs.all(|pair| matched(pair)),
        MatchMode::Any => pairs.any(|pair| matched(pair)),
    }
}
