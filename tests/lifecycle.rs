// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod common;

use common::{assert_nothing_received, component, next, started_consumer, Collector, FailFirst, Gate};
use rabbitmq_endpoint::{memory::InMemoryBroker, message::GenericMessage};

#[tokio::test]
async fn restarted_consumer_resumes_without_duplicate_topology() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (collector, mut received) = Collector::new();
    let consumer = started_consumer(
        &component,
        "rabbitmq:directExchange:q1:k?autodelete=false",
        collector,
    )
    .await;

    let producer = component
        .create_endpoint("rabbitmq:directExchange:k")
        .unwrap()
        .create_producer();
    producer.start().await.unwrap();
    producer.send(&GenericMessage::new("before")).await.unwrap();
    assert_eq!(next(&mut received).await.body.as_text(), Some("before"));

    consumer.stop().await.unwrap();
    consumer.stop().await.unwrap();
    assert!(!consumer.is_started().await);
    assert_eq!(broker.consumer_count("q1").await, 0);
    assert!(broker.has_queue("q1").await);

    producer.send(&GenericMessage::new("while stopped")).await.unwrap();
    assert_nothing_received(&mut received).await;
    assert_eq!(broker.queue_depth("q1").await, Some(1));
    let (exchanges, queues) = broker.declarations().await;

    consumer.start().await.unwrap();
    consumer.start().await.unwrap();
    assert_eq!(broker.consumer_count("q1").await, 1);
    assert_eq!(broker.declarations().await, (exchanges + 1, queues + 1));
    assert_eq!(next(&mut received).await.body.as_text(), Some("while stopped"));

    producer.send(&GenericMessage::new("after")).await.unwrap();
    assert_eq!(next(&mut received).await.body.as_text(), Some("after"));
    assert_nothing_received(&mut received).await;
    assert_eq!(broker.binding_count("directExchange").await, 1);
}

#[tokio::test]
async fn concurrent_consumers_compete_for_messages() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (collector, mut received) = Collector::new();
    let _consumer = started_consumer(
        &component,
        "rabbitmq:workExchange:work:k?concurrentConsumers=3",
        collector,
    )
    .await;
    assert_eq!(broker.consumer_count("work").await, 3);

    let producer = component
        .create_endpoint("rabbitmq:workExchange:k")
        .unwrap()
        .create_producer();
    producer.start().await.unwrap();
    for i in 0..6 {
        producer.send(&GenericMessage::new(format!("job-{}", i))).await.unwrap();
    }

    let mut bodies = vec![];
    for _ in 0..6 {
        bodies.push(next(&mut received).await.body.as_text().map(str::to_owned));
    }
    bodies.sort();
    bodies.dedup();
    assert_eq!(bodies.len(), 6);
    assert_nothing_received(&mut received).await;
}

#[tokio::test]
async fn slow_processing_holds_back_deliveries() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (gate, permits, mut received) = Gate::new();
    let _consumer = started_consumer(
        &component,
        "rabbitmq:slowExchange:slow:k?prefetchCount=1&acknowledgeMode=manual&autodelete=false",
        gate,
    )
    .await;

    let producer = component
        .create_endpoint("rabbitmq:slowExchange:k")
        .unwrap()
        .create_producer();
    producer.start().await.unwrap();
    for i in 0..3 {
        producer.send(&GenericMessage::new(format!("m{}", i))).await.unwrap();
    }

    assert_eq!(next(&mut received).await.body.as_text(), Some("m0"));
    assert_nothing_received(&mut received).await;
    assert_eq!(broker.queue_depth("slow").await, Some(2));

    permits.add_permits(3);
    assert_eq!(next(&mut received).await.body.as_text(), Some("m1"));
    assert_eq!(next(&mut received).await.body.as_text(), Some("m2"));
}

#[tokio::test]
async fn manual_acknowledgement_requeues_failed_messages() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (flaky, mut received) = FailFirst::new(2);
    let _consumer = started_consumer(
        &component,
        "rabbitmq:retryExchange:retry:k?acknowledgeMode=manual",
        flaky.clone(),
    )
    .await;

    let producer = component
        .create_endpoint("rabbitmq:retryExchange:k")
        .unwrap()
        .create_producer();
    producer.start().await.unwrap();
    producer.send(&GenericMessage::new("retried")).await.unwrap();

    assert_eq!(next(&mut received).await.body.as_text(), Some("retried"));
    assert_eq!(flaky.calls(), 3);
    assert_eq!(broker.queue_depth("retry").await, Some(0));
}

#[tokio::test]
async fn automatic_acknowledgement_drops_failed_messages() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let (flaky, mut received) = FailFirst::new(1);
    let _consumer = started_consumer(&component, "rabbitmq:lossyExchange:lossy:k", flaky.clone()).await;

    let producer = component
        .create_endpoint("rabbitmq:lossyExchange:k")
        .unwrap()
        .create_producer();
    producer.start().await.unwrap();
    producer.send(&GenericMessage::new("lost")).await.unwrap();
    producer.send(&GenericMessage::new("kept")).await.unwrap();

    assert_eq!(next(&mut received).await.body.as_text(), Some("kept"));
    assert_eq!(flaky.calls(), 2);
}

#[tokio::test]
async fn producer_start_and_stop_are_idempotent() {
    let broker = InMemoryBroker::default();
    let component = component(&broker);
    let producer = component
        .create_endpoint("rabbitmq:fanoutExchange?type=fanout")
        .unwrap()
        .create_producer();

    producer.start().await.unwrap();
    producer.start().await.unwrap();
    assert!(producer.is_started().await);
    assert_eq!(broker.declarations().await.0, 1);

    producer.stop().await.unwrap();
    producer.stop().await.unwrap();
    assert!(!producer.is_started().await);

    producer.start().await.unwrap();
    producer.send(&GenericMessage::new("again")).await.unwrap();
}
