// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{assert_nothing_received, component, next, started_consumer, Collector};
use rabbitmq_endpoint::{
    bridge::{EXCHANGE_NAME, QUEUE_NAME, ROUTING_KEY},
    errors::AmqpError,
    exchange::ExchangeKind,
    memory::InMemoryBroker,
    message::GenericMessage,
};

#[tokio::test]
async fn direct_exchange_delivers_body_and_headers() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (collector, mut received) = Collector::new();
    let _consumer = started_consumer(&component, "rabbitmq:directExchange:q1:k", collector).await;

    let producer = component
        .create_endpoint("rabbitmq:directExchange:q1:k")
        .unwrap()
        .create_producer();
    producer.start().await.unwrap();
    producer
        .send(&GenericMessage::new("HELLO WORLD").with_header("HeaderKey", "HeaderValue"))
        .await
        .unwrap();

    let msg = next(&mut received).await;
    assert_eq!(msg.body.as_text(), Some("HELLO WORLD"));
    assert_eq!(msg.header("HeaderKey").and_then(|v| v.as_str()), Some("HeaderValue"));
    assert!(msg.message_id.is_some());
    assert_eq!(msg.header(EXCHANGE_NAME).and_then(|v| v.as_str()), Some("directExchange"));
    assert_eq!(msg.header(QUEUE_NAME).and_then(|v| v.as_str()), Some("q1"));
}

#[tokio::test]
async fn two_segment_consumer_binds_a_fanout_exchange() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (first, mut first_received) = Collector::new();
    let (second, mut second_received) = Collector::new();
    let _q1 = started_consumer(&component, "rabbitmq:fanoutExchange:q1", first).await;
    let _q2 = started_consumer(&component, "rabbitmq:fanoutExchange:q2", second).await;
    assert_eq!(broker.exchange_kind("fanoutExchange").await, Some(ExchangeKind::Fanout));

    let producer = component
        .create_endpoint("rabbitmq:fanoutExchange?type=fanout")
        .unwrap()
        .create_producer();
    producer.start().await.unwrap();
    producer.send(&GenericMessage::new("broadcast")).await.unwrap();

    assert_eq!(next(&mut first_received).await.body.as_text(), Some("broadcast"));
    assert_eq!(next(&mut second_received).await.body.as_text(), Some("broadcast"));
}

#[tokio::test]
async fn two_segment_producer_and_consumer_share_the_exchange_when_consumer_starts_first() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (collector, mut received) = Collector::new();
    let _consumer = started_consumer(&component, "rabbitmq:events:q1", collector).await;

    let producer = component
        .create_endpoint("rabbitmq:events:q1")
        .unwrap()
        .create_producer();
    producer.start().await.unwrap();
    producer.send(&GenericMessage::new("consumer first")).await.unwrap();

    assert_eq!(next(&mut received).await.body.as_text(), Some("consumer first"));
    assert_eq!(broker.exchange_kind("events").await, Some(ExchangeKind::Fanout));
    assert_eq!(broker.declarations().await.0, 1);
}

#[tokio::test]
async fn two_segment_producer_and_consumer_share_the_exchange_when_producer_starts_first() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let producer = component
        .create_endpoint("rabbitmq:events:q1")
        .unwrap()
        .create_producer();
    producer.start().await.unwrap();
    assert_eq!(broker.exchange_kind("events").await, None);

    let (collector, mut received) = Collector::new();
    let _consumer = started_consumer(&component, "rabbitmq:events:q1", collector).await;
    producer.send(&GenericMessage::new("producer first")).await.unwrap();

    assert_eq!(next(&mut received).await.body.as_text(), Some("producer first"));
    assert_eq!(broker.exchange_kind("events").await, Some(ExchangeKind::Fanout));
}

#[tokio::test]
async fn headers_exchange_all_requires_every_pair() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (collector, mut received) = Collector::new();
    let _consumer = started_consumer(
        &component,
        "rabbitmq:headerAndExchange:q3:cheese=gouda&fromage=jack?type=headers",
        collector,
    )
    .await;

    let producer = component
        .create_endpoint("rabbitmq:headerAndExchange?type=headers")
        .unwrap()
        .create_producer();
    producer.start().await.unwrap();

    producer
        .send(&GenericMessage::new("partial").with_header("cheese", "gouda").with_header("fromage", "bleu"))
        .await
        .unwrap();
    producer
        .send(&GenericMessage::new("complete").with_header("cheese", "gouda").with_header("fromage", "jack"))
        .await
        .unwrap();

    assert_eq!(next(&mut received).await.body.as_text(), Some("complete"));
    assert_nothing_received(&mut received).await;
}

#[tokio::test]
async fn headers_exchange_any_requires_one_pair() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (collector, mut received) = Collector::new();
    let _consumer = started_consumer(
        &component,
        "rabbitmq:headerOrExchange:q4:cheese=white|fromage=jack?type=headers",
        collector,
    )
    .await;

    let producer = component
        .create_endpoint("rabbitmq:headerOrExchange?type=headers")
        .unwrap()
        .create_producer();
    producer.start().await.unwrap();

    producer
        .send(&GenericMessage::new("none").with_header("cheese", "gouda"))
        .await
        .unwrap();
    producer
        .send(&GenericMessage::new("one").with_header("cheese", "gouda").with_header("fromage", "jack"))
        .await
        .unwrap();

    assert_eq!(next(&mut received).await.body.as_text(), Some("one"));
    assert_nothing_received(&mut received).await;
}

#[tokio::test]
async fn default_exchange_routes_by_queue_name() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (collector, mut received) = Collector::new();
    let _consumer = started_consumer(&component, "rabbitmq::test.e", collector).await;
    assert!(broker.has_queue("test.e").await);

    for uri in ["rabbitmq::test.e", "rabbitmq::test.e:test.e"] {
        let producer = component.create_endpoint(uri).unwrap().create_producer();
        producer.start().await.unwrap();
        producer.send(&GenericMessage::new(uri)).await.unwrap();
        assert_eq!(next(&mut received).await.body.as_text(), Some(uri));
    }

    assert_eq!(broker.declarations().await.0, 0);
}

#[tokio::test]
async fn topic_exchange_matches_wildcards() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (collector, mut received) = Collector::new();
    let _consumer = started_consumer(&component, "rabbitmq:topicExchange:q5:orders.*?type=topic", collector).await;

    let producer = component
        .create_endpoint("rabbitmq:topicExchange?type=topic")
        .unwrap()
        .create_producer();
    producer.start().await.unwrap();

    producer
        .send(&GenericMessage::new("nested").with_header(ROUTING_KEY, "orders.eu.created"))
        .await
        .unwrap();
    producer
        .send(&GenericMessage::new("created").with_header(ROUTING_KEY, "orders.created"))
        .await
        .unwrap();

    assert_eq!(next(&mut received).await.body.as_text(), Some("created"));
    assert_nothing_received(&mut received).await;
}

#[tokio::test]
async fn routing_key_header_overrides_the_address() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (k1, mut k1_received) = Collector::new();
    let (k2, mut k2_received) = Collector::new();
    let _q1 = started_consumer(&component, "rabbitmq:directExchange:q1:k1", k1).await;
    let _q2 = started_consumer(&component, "rabbitmq:directExchange:q2:k2", k2).await;

    let producer = component
        .create_endpoint("rabbitmq:directExchange:k1")
        .unwrap()
        .create_producer();
    producer.start().await.unwrap();
    producer
        .send(&GenericMessage::new("rerouted").with_header(ROUTING_KEY, "k2"))
        .await
        .unwrap();

    assert_eq!(next(&mut k2_received).await.body.as_text(), Some("rerouted"));
    assert_nothing_received(&mut k1_received).await;
}

#[tokio::test]
async fn conflicting_exchange_types_fail_the_declaration() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (collector, _received) = Collector::new();
    let _direct = started_consumer(&component, "rabbitmq:exchange2:q1:k", collector.clone()).await;

    let fanout = component
        .create_endpoint("rabbitmq:exchange2:q2?type=fanout")
        .unwrap()
        .create_consumer(collector);
    let err = fanout.start().await.unwrap_err();

    assert!(matches!(err, AmqpError::TopologyDeclarationError(_)));
    assert!(!fanout.is_started().await);
    assert_eq!(broker.exchange_kind("exchange2").await, Some(ExchangeKind::Direct));
}

#[tokio::test]
async fn time_to_live_expires_unconsumed_messages() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (collector, mut received) = Collector::new();
    let consumer = started_consumer(
        &component,
        "rabbitmq:ttlExchange:ttl-q:k?timeToLive=50&autodelete=false",
        collector,
    )
    .await;
    consumer.stop().await.unwrap();

    let producer = component
        .create_endpoint("rabbitmq:ttlExchange:k")
        .unwrap()
        .create_producer();
    producer.start().await.unwrap();
    producer.send(&GenericMessage::new("stale")).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    producer.send(&GenericMessage::new("fresh")).await.unwrap();

    consumer.start().await.unwrap();
    assert_eq!(next(&mut received).await.body.as_text(), Some("fresh"));
    assert_nothing_received(&mut received).await;
}
