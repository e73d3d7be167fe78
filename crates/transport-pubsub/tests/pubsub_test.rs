//! Integration tests for the pub/sub transport over the in-process broker.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use serial_test::serial;
use tether_message::{HandlerError, HandlerResponse, MessageConnection};
use tether_transport::{Frame, FrameEncoding, FrameType, Transport, TransportError, Value};
use tether_transport_pubsub::{
    MemoryBrokerConfig, MemoryClient, NatsClient, NatsConfig, PubSubTransport,
    PubSubTransportOptions, PublishSubject, cached_connection_count,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

async fn transport(
    config: &MemoryBrokerConfig,
    subscribe: &str,
    publish: &str,
) -> Arc<PubSubTransport<MemoryClient>> {
    PubSubTransport::<MemoryClient>::connect(
        config.clone(),
        PubSubTransportOptions::new(publish).with_subscription(subscribe),
    )
    .await
    .unwrap()
}

fn collect(transport: &PubSubTransport<MemoryClient>) -> mpsc::UnboundedReceiver<Frame> {
    let (tx, rx) = mpsc::unbounded_channel();
    transport.on_receive(Arc::new(move |frame| {
        let _ = tx.send(frame);
    }));
    rx
}

#[tokio::test]
#[serial]
async fn test_large_payload_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = MemoryBrokerConfig::new("large-payload").with_max_payload(512);
    let client_side = transport(&config, "svc.reply", "svc.request").await;
    let server_side = transport(&config, "svc.request", "svc.reply").await;

    let client = MessageConnection::<String>::new(client_side.clone());
    let server = MessageConnection::<String>::new(server_side.clone());
    server.on_receive(|payload: String| async move {
        Ok::<_, HandlerError>(HandlerResponse::Single(payload))
    });

    let payload: String = (0..20_000)
        .map(|i| char::from(b'a' + u8::try_from(i % 26).unwrap()))
        .collect();
    let response = client.request_one(payload.clone()).await.unwrap();
    assert_eq!(response, payload);

    client_side.close().await.unwrap();
    server_side.close().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_equal_config_shares_connection() {
    let _ = tracing_subscriber::fmt::try_init();

    let before = cached_connection_count().await;

    let config = MemoryBrokerConfig::new("shared");
    let a = transport(&config, "a.in", "a.out").await;
    let b = transport(&config, "b.in", "b.out").await;
    assert!(Arc::ptr_eq(a.client(), b.client()));
    assert_eq!(cached_connection_count().await, before + 1);

    let other = transport(&MemoryBrokerConfig::new("other"), "c.in", "c.out").await;
    assert!(!Arc::ptr_eq(a.client(), other.client()));
    assert_eq!(cached_connection_count().await, before + 2);

    a.close().await.unwrap();
    assert_eq!(cached_connection_count().await, before + 1);

    // A fresh connection replaces the released one.
    let c = transport(&config, "d.in", "d.out").await;
    assert!(!Arc::ptr_eq(a.client(), c.client()));

    b.close().await.unwrap();
    c.close().await.unwrap();
    other.close().await.unwrap();
    assert_eq!(cached_connection_count().await, before);
}

#[tokio::test]
#[serial]
async fn test_stream_end_follows_first_subject() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = MemoryBrokerConfig::new("subjects");
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver_calls = calls.clone();
    let publisher = PubSubTransport::<MemoryClient>::connect(
        config.clone(),
        PubSubTransportOptions::new(PublishSubject::resolver(move |frame| {
            if frame.correlation_id == 9 {
                return None;
            }
            let n = resolver_calls.fetch_add(1, Ordering::SeqCst) + 1;
            Some(format!("out.{n}"))
        })),
    )
    .await
    .unwrap();

    let first = transport(&config, "out.1", "unused").await;
    let second = transport(&config, "out.2", "unused").await;
    let mut first_rx = collect(&first);
    let mut second_rx = collect(&second);

    let source = Uuid::new_v4();
    publisher
        .send(Frame::multi(7, Value::Integer(1.into()), source))
        .await
        .unwrap();
    publisher
        .send(Frame::multi(7, Value::Integer(2.into()), source))
        .await
        .unwrap();
    publisher.send(Frame::end(7, source)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let mut types = Vec::new();
    for _ in 0..3 {
        let frame = timeout(Duration::from_secs(5), first_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.correlation_id, 7);
        types.push(frame.frame_type);
    }
    assert_eq!(types, vec![FrameType::Multi, FrameType::Multi, FrameType::End]);

    // Nothing remembered for this id, so the resolver decides.
    publisher.send(Frame::end(8, source)).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    let frame = timeout(Duration::from_secs(5), second_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(frame.correlation_id, 8);

    let err = publisher
        .send(Frame::send(9, Value::Null, source))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::NoSubject(9)));

    publisher.close().await.unwrap();
    first.close().await.unwrap();
    second.close().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_failed_stream_releases_subject() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = MemoryBrokerConfig::new("failed-streams");
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver_calls = calls.clone();
    let publisher = PubSubTransport::<MemoryClient>::connect(
        config.clone(),
        PubSubTransportOptions::new(PublishSubject::resolver(move |_| {
            let n = resolver_calls.fetch_add(1, Ordering::SeqCst);
            Some(if n == 0 { "streams".to_string() } else { format!("elsewhere.{n}") })
        })),
    )
    .await
    .unwrap();
    let subscriber = transport(&config, "streams", "unused").await;
    let mut received = collect(&subscriber);

    // The subject is picked once, by the first frame of the stream.
    let source = Uuid::new_v4();
    publisher
        .send(Frame::multi(1, Value::Integer(1.into()), source))
        .await
        .unwrap();
    publisher
        .send(Frame::anomaly(1, Value::Text("ran dry".to_string()), source))
        .await
        .unwrap();
    assert_eq!(publisher.open_streams(), 0);

    let mut types = Vec::new();
    for _ in 0..2 {
        let frame = timeout(Duration::from_secs(5), received.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame.correlation_id, 1);
        types.push(frame.frame_type);
    }
    assert_eq!(types, vec![FrameType::Multi, FrameType::Anomaly]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Every kind of terminal frame forgets the stream.
    for id in 2..=100u64 {
        publisher
            .send(Frame::multi(id, Value::Null, source))
            .await
            .unwrap();
        let last = match id % 3 {
            0 => Frame::error(id, Value::Null, source),
            1 => Frame::response(id, Value::Null, source),
            _ => Frame::anomaly(id, Value::Null, source),
        };
        publisher.send(last).await.unwrap();
    }
    assert_eq!(publisher.open_streams(), 0);

    publisher.close().await.unwrap();
    subscriber.close().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_close_closes_shared_connection() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = MemoryBrokerConfig::new("close-shared");
    let a = transport(&config, "a.in", "a.out").await;
    let b = transport(&config, "b.in", "b.out").await;
    let mut b_rx = collect(&b);
    assert!(Arc::ptr_eq(a.client(), b.client()));

    a.close().await.unwrap();

    // b is not closed itself, but its connection is gone.
    assert!(!b.is_closed());
    let err = b
        .send(Frame::send(1, Value::Null, Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectionClosed));

    // Its subscription ended with the connection.
    let sender = transport(&config, "unused", "b.in").await;
    sender
        .send(Frame::send(2, Value::Null, Uuid::new_v4()))
        .await
        .unwrap();
    assert!(
        timeout(Duration::from_millis(200), b_rx.recv())
            .await
            .is_err()
    );

    // Already closed by a, so closing b only marks it closed.
    b.close().await.unwrap();
    assert!(b.is_closed());
    sender.close().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_oversized_text_frame_is_rejected() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = MemoryBrokerConfig::new("text").with_max_payload(128);
    let transport = PubSubTransport::<MemoryClient>::connect(
        config,
        PubSubTransportOptions::new("text.out").with_encoding(FrameEncoding::Json),
    )
    .await
    .unwrap();

    let frame = Frame::send(1, Value::Text("x".repeat(1_000)), Uuid::new_v4());
    let err = transport.send(frame).await.unwrap_err();
    assert!(matches!(err, TransportError::PayloadTooLarge { max: 128, .. }));

    transport
        .send(Frame::send(2, Value::Text("small".to_string()), Uuid::new_v4()))
        .await
        .unwrap();

    transport.close().await.unwrap();
}

#[tokio::test]
#[serial]
async fn test_send_after_close_fails() {
    let _ = tracing_subscriber::fmt::try_init();

    let transport = transport(&MemoryBrokerConfig::new("closing"), "in", "out").await;
    transport.close().await.unwrap();
    assert!(transport.is_closed());

    let err = transport
        .send(Frame::send(1, Value::Null, Uuid::new_v4()))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectionClosed));

    // Closing twice is harmless.
    transport.close().await.unwrap();
}

#[tokio::test]
#[serial]
#[ignore = "requires a running nats-server on localhost:4222"]
async fn test_nats_large_payload_round_trip() {
    let _ = tracing_subscriber::fmt::try_init();

    let config = NatsConfig::new("nats://localhost:4222").with_name("tether-test");
    let client_side = PubSubTransport::<NatsClient>::connect(
        config.clone(),
        PubSubTransportOptions::new("tether.test.request").with_subscription("tether.test.reply"),
    )
    .await
    .unwrap();
    let server_side = PubSubTransport::<NatsClient>::connect(
        config,
        PubSubTransportOptions::new("tether.test.reply").with_subscription("tether.test.request"),
    )
    .await
    .unwrap();
    assert!(Arc::ptr_eq(client_side.client(), server_side.client()));

    let client = MessageConnection::<Vec<u8>>::new(client_side.clone());
    let server = MessageConnection::<Vec<u8>>::new(server_side.clone());
    server.on_receive(|payload: Vec<u8>| async move {
        Ok::<_, HandlerError>(HandlerResponse::Single(payload))
    });

    // Larger than the default 1 MiB max payload.
    let payload: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 253) as u8).collect();
    client.set_response_timeout(Duration::from_secs(30));
    let response = client.request_one(payload.clone()).await.unwrap();
    assert_eq!(response, payload);

    client_side.close().await.unwrap();
    server_side.close().await.unwrap();
}
