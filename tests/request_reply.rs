// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{component, started_consumer, FailFirst, Responder, Sleeper};
use rabbitmq_endpoint::{
    errors::AmqpError,
    memory::InMemoryBroker,
    message::{ExchangePattern, GenericMessage},
};
use std::{sync::Arc, time::Duration};

const ADDRESS: &str = "rabbitmq:requestExchange:requests:rk";

#[tokio::test]
async fn request_waits_for_the_response() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let _consumer = started_consumer(&component, ADDRESS, Arc::new(Responder("RESPONSE"))).await;

    let producer = component.create_endpoint(ADDRESS).unwrap().create_producer();
    producer.start().await.unwrap();

    let reply = producer
        .request(&GenericMessage::new("REQUEST"), Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(reply.body.as_text(), Some("RESPONSE"));
    assert_eq!(producer.pending_replies().await, 0);
}

#[tokio::test]
async fn concurrent_async_requests_are_correlated() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (echo, _received) = FailFirst::new(0);
    let _consumer = started_consumer(&component, ADDRESS, echo).await;

    let producer = component.create_endpoint(ADDRESS).unwrap().create_producer();
    producer.start().await.unwrap();

    let first = producer
        .request_async(&GenericMessage::new("first"), Duration::from_secs(2))
        .await;
    let second = producer
        .request_async(&GenericMessage::new("second"), Duration::from_secs(2))
        .await;
    assert_ne!(first.correlation_id(), second.correlation_id());

    let (first, second) = tokio::join!(first, second);
    assert_eq!(first.unwrap().body.as_text(), Some("first"));
    assert_eq!(second.unwrap().body.as_text(), Some("second"));
}

#[tokio::test]
async fn process_follows_the_exchange_pattern() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let _consumer = started_consumer(&component, ADDRESS, Arc::new(Responder("RESPONSE"))).await;

    let producer = component.create_endpoint(ADDRESS).unwrap().create_producer();
    producer.start().await.unwrap();

    let one_way = producer.process(&GenericMessage::new("event")).await.unwrap();
    assert!(one_way.is_none());

    let request = GenericMessage::new("REQUEST").with_pattern(ExchangePattern::InOut);
    let reply = producer.process(&request).await.unwrap();
    assert_eq!(reply.and_then(|r| r.body.as_text().map(str::to_owned)).as_deref(), Some("RESPONSE"));
}

#[tokio::test]
async fn missing_replies_time_out_and_are_evicted() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let _consumer = started_consumer(&component, ADDRESS, Arc::new(Sleeper(Duration::from_millis(500)))).await;

    let producer = component.create_endpoint(ADDRESS).unwrap().create_producer();
    producer.start().await.unwrap();

    let err = producer
        .request(&GenericMessage::new("REQUEST"), Duration::from_millis(100))
        .await
        .unwrap_err();

    assert!(matches!(err, AmqpError::TimeoutError(100)));
    assert_eq!(producer.pending_replies().await, 0);
}

#[tokio::test]
async fn processing_failures_reach_the_requester() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (failing, _received) = FailFirst::new(1);
    let _consumer = started_consumer(&component, ADDRESS, failing).await;

    let producer = component.create_endpoint(ADDRESS).unwrap().create_producer();
    producer.start().await.unwrap();

    let err = producer
        .request(&GenericMessage::new("REQUEST"), Duration::from_secs(2))
        .await
        .unwrap_err();

    match err {
        AmqpError::DeliveryProcessingError(reason) => assert!(reason.contains("failure #1")),
        other => panic!("unexpected error: {:?}", other),
    }
}

#[tokio::test]
async fn stopping_the_producer_abandons_waiting_requests() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let _consumer = started_consumer(&component, ADDRESS, Arc::new(Sleeper(Duration::from_secs(1)))).await;

    let producer = component.create_endpoint(ADDRESS).unwrap().create_producer();
    producer.start().await.unwrap();

    let handle = producer
        .request_async(&GenericMessage::new("REQUEST"), Duration::from_secs(5))
        .await;
    producer.stop().await.unwrap();

    assert!(matches!(handle.await, Err(AmqpError::RequestAbandonedError)));
    assert!(matches!(
        producer.send(&GenericMessage::new("late")).await,
        Err(AmqpError::NotStartedError)
    ));
}
