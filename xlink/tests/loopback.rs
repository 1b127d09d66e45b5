use std::ops::ControlFlow;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use xlink::core::chunk;
use xlink::reliable::{Backoff, RetryPolicy};
use xlink::{
    Channel, ChannelState, DatagramChannel, Delivery, Document, Error, ErrorKind, Escalation,
    PubSubChannel, Supervisor, SupervisorConfig, TransportConfig,
};

const WAIT: Duration = Duration::from_secs(5);

fn init() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn doc(value: serde_json::Value) -> Document {
    Document::from_value(value).unwrap()
}

/// JPEG-shaped payload whose only end-of-image marker is the final two bytes.
fn jpeg_like(len: usize) -> Vec<u8> {
    let mut data: Vec<u8> = (0..len).map(|i| (i % 200) as u8).collect();
    data[0] = 0xFF;
    data[1] = 0xD8;
    data[len - 2] = 0xFF;
    data[len - 1] = 0xD9;
    data
}

async fn datagram_pair(buffer_size: usize) -> (DatagramChannel, DatagramChannel) {
    let mut rx = DatagramChannel::with_config(
        TransportConfig::new()
            .with("host", "127.0.0.1")
            .with("bufferSize", buffer_size)
            .with("timeout", 100),
    )
    .unwrap();
    rx.connect().await.unwrap();
    let port = rx.local_addr().unwrap().port();

    let mut tx = DatagramChannel::with_config(
        TransportConfig::new()
            .with("host", "127.0.0.1")
            .with("port", port)
            .with("bufferSize", buffer_size),
    )
    .unwrap();
    tx.connect().await.unwrap();
    (rx, tx)
}

async fn pubsub_pair(
    server: TransportConfig,
    client: TransportConfig,
) -> (PubSubChannel, PubSubChannel) {
    let mut bound = PubSubChannel::with_config(
        server.with("endpoint", "tcp://127.0.0.1:0").with("bind", true),
    )
    .unwrap();
    bound.connect().await.unwrap();
    let port = bound.local_addr().unwrap().port();

    let mut dialer = PubSubChannel::with_config(
        client.with("endpoint", format!("tcp://127.0.0.1:{}", port)),
    )
    .unwrap();
    dialer.connect().await.unwrap();

    tokio::time::timeout(WAIT, async {
        while bound.peer_count() == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    (bound, dialer)
}

#[tokio::test]
async fn test_three_chunk_frame_over_udp() {
    init();
    let (mut rx, tx) = datagram_pair(xlink::MEDIA_BUFFER_SIZE).await;
    let (frames_tx, mut frames) = mpsc::unbounded_channel();
    rx.start_listener(move |delivery| {
        if let Delivery::Frame(frame) = delivery {
            frames_tx.send(frame)?;
        }
        Ok(())
    })
    .unwrap();

    let payload = jpeg_like(150_000);
    let pieces: Vec<&[u8]> = chunk::split(&payload, 64_996).collect();
    assert_eq!(pieces.len(), 3);
    for piece in pieces {
        tx.send_chunk(piece).await.unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let frame = tokio::time::timeout(WAIT, frames.recv()).await.unwrap().unwrap();
    assert_eq!(&*frame.data, payload.as_slice());
    assert!(
        tokio::time::timeout(Duration::from_millis(200), frames.recv())
            .await
            .is_err()
    );
    assert_eq!(rx.frame_slot().latest().unwrap().sequence, frame.sequence);

    let stats = rx.stats();
    assert_eq!(stats.chunks, 3);
    assert_eq!(stats.frames, 1);
    assert_eq!(stats.integrity_failures, 0);
    rx.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_document_round_trip_over_udp() {
    init();
    let (mut rx, tx) = datagram_pair(xlink::DEFAULT_BUFFER_SIZE).await;
    let (docs_tx, mut docs) = mpsc::unbounded_channel();
    rx.start_listener(move |delivery| {
        if let Delivery::Document(document) = delivery {
            docs_tx.send(document)?;
        }
        Ok(())
    })
    .unwrap();

    let original = doc(json!({
        "sensor_id": "T1",
        "reading": 21.5,
        "count": 3,
        "ok": true,
        "note": null,
        "tags": ["a", 1, false],
        "data": {"value": 21.5, "nested": {"deep": "yes"}}
    }));
    tx.send_document(&original).await.unwrap();

    let received = tokio::time::timeout(WAIT, docs.recv()).await.unwrap().unwrap();
    assert_eq!(received, original);
    rx.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_untagged_framing_round_trip() {
    init();
    let config = |port: u16| {
        TransportConfig::new()
            .with("host", "127.0.0.1")
            .with("port", port)
            .with("framing", "untagged")
            .with("timeout", 100)
    };
    let mut rx = DatagramChannel::with_config(config(9)).unwrap();
    rx.connect().await.unwrap();
    let mut tx = DatagramChannel::with_config(config(rx.local_addr().unwrap().port())).unwrap();
    tx.connect().await.unwrap();

    let (events_tx, mut events) = mpsc::unbounded_channel();
    rx.start_listener(move |delivery| {
        events_tx.send(delivery)?;
        Ok(())
    })
    .unwrap();

    tx.send_document(&doc(json!({"kind": "status"}))).await.unwrap();
    tx.send_frame(&jpeg_like(20_000)).await.unwrap();

    let first = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(first, Delivery::Document(d) if d.get("kind") == Some(&json!("status"))));
    let second = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(second, Delivery::Frame(f) if f.len() == 20_000));
    rx.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_publish_then_templated() {
    init();
    let (mut subscriber, mut publisher) = pubsub_pair(
        TransportConfig::new()
            .with("socketType", "SUB")
            .with("topic", "sensors")
            .with("timeout", 2000),
        TransportConfig::new()
            .with("socketType", "PUB")
            .with("topic", "sensors/temperature"),
    )
    .await;

    // filtered out by the subscriber
    publisher
        .publish("control/stop", &doc(json!({"stop": true})))
        .unwrap();

    let first = doc(json!({"sensor_id": "T1", "data": {"value": 21.5}}));
    publisher.send_document(&first).unwrap();

    publisher.set_template(doc(json!({"sensor_id": "T1", "metadata": {"units": "C"}})));
    publisher
        .send_templated(&doc(json!({"data": {"value": 22.0}})))
        .unwrap();

    let received_first = subscriber.receive_message().await.unwrap();
    assert_eq!(received_first, first);

    let (topic, payload) = subscriber.receive_raw().await.unwrap();
    assert_eq!(topic, "sensors/temperature");
    let second = Document::decode(&payload).unwrap();
    assert_eq!(second.pointer("metadata.units"), Some(&json!("C")));
    assert_eq!(second.pointer("data.value"), Some(&json!(22.0)));
    assert_eq!(second.get("sensor_id"), Some(&json!("T1")));

    // nothing else arrives
    let err = subscriber.receive_message().await.unwrap_err();
    assert!(err.is_timeout());

    publisher.disconnect().await.unwrap();
    subscriber.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_subscriber_listener() {
    init();
    let (mut subscriber, publisher) = pubsub_pair(
        TransportConfig::new().with("role", "SUB"),
        TransportConfig::new().with("role", "PUB").with("topic", "status"),
    )
    .await;

    let (messages_tx, mut messages) = mpsc::unbounded_channel();
    subscriber
        .start_listener(move |message| {
            messages_tx.send(message)?;
            Ok(())
        })
        .unwrap();
    assert_eq!(
        subscriber.receive_message().await.unwrap_err().kind(),
        ErrorKind::ConnectionState
    );

    publisher.send_document(&doc(json!({"battery": 87}))).unwrap();
    let message = tokio::time::timeout(WAIT, messages.recv()).await.unwrap().unwrap();
    assert_eq!(message.topic, "status");
    assert_eq!(message.document.get("battery"), Some(&json!(87)));

    subscriber.stop_listener().await;
    publisher.send_document(&doc(json!({"battery": 86}))).unwrap();
    let direct = tokio::time::timeout(WAIT, subscriber.receive_message())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(direct.get("battery"), Some(&json!(86)));
    subscriber.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_request_reply_alternation() {
    init();
    let (replier, requester) = pubsub_pair(
        TransportConfig::new().with("role", "REP").with("timeout", 2000),
        TransportConfig::new().with("role", "REQ").with("timeout", 2000),
    )
    .await;

    assert!(matches!(requester.receive_message().await, Err(Error::Sequence(_))));
    assert!(matches!(
        replier.send_document(&doc(json!({"unsolicited": true}))),
        Err(Error::Sequence(_))
    ));

    requester.send_document(&doc(json!({"cmd": "status"}))).unwrap();
    assert!(matches!(
        requester.send_document(&doc(json!({"cmd": "again"}))),
        Err(Error::Sequence(_))
    ));

    let request = replier.receive_message().await.unwrap();
    assert_eq!(request.get("cmd"), Some(&json!("status")));
    assert!(matches!(replier.receive_message().await, Err(Error::Sequence(_))));
    replier.send_document(&doc(json!({"state": "ok"}))).unwrap();

    let reply = requester.receive_message().await.unwrap();
    assert_eq!(reply.get("state"), Some(&json!("ok")));

    // the next round is allowed again
    requester.send_document(&doc(json!({"cmd": "next"}))).unwrap();
}

#[tokio::test]
async fn test_push_pull() {
    init();
    let (mut puller, pusher) = pubsub_pair(
        TransportConfig::new().with("role", "PULL"),
        TransportConfig::new().with("role", "PUSH"),
    )
    .await;

    let (jobs_tx, mut jobs) = mpsc::unbounded_channel();
    puller
        .start_listener(move |message| {
            jobs_tx.send(message.document)?;
            Ok(())
        })
        .unwrap();

    for n in 0..3 {
        pusher.send_document(&doc(json!({"job": n}))).unwrap();
    }
    for n in 0..3 {
        let job = tokio::time::timeout(WAIT, jobs.recv()).await.unwrap().unwrap();
        assert_eq!(job.get("job"), Some(&json!(n)));
    }
    assert!(pusher.receive_message().await.is_err());
    puller.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_publisher_redials_restarted_subscriber() {
    init();
    let sub_config = TransportConfig::new().with("role", "SUB").with("timeout", 2000);
    let (mut subscriber, mut publisher) =
        pubsub_pair(sub_config.clone(), TransportConfig::new().with("role", "PUB")).await;
    let port = subscriber.local_addr().unwrap().port();

    publisher.send_document(&doc(json!({"seq": 1}))).unwrap();
    let first = subscriber.receive_message().await.unwrap();
    assert_eq!(first.get("seq"), Some(&json!(1)));

    subscriber.disconnect().await.unwrap();
    tokio::time::timeout(WAIT, async {
        while publisher.peer_count() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    assert!(!publisher.is_connected());
    assert_eq!(publisher.state(), ChannelState::Disconnected);
    let err = publisher.send_document(&doc(json!({"seq": 2}))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(err.is_retryable());

    let mut restarted = PubSubChannel::with_config(
        sub_config
            .with("endpoint", format!("tcp://127.0.0.1:{}", port))
            .with("bind", true),
    )
    .unwrap();
    tokio::time::timeout(WAIT, async {
        while restarted.connect().await.is_err() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    publisher.connect().await.unwrap();
    assert!(publisher.is_connected());
    publisher.send_document(&doc(json!({"seq": 3}))).unwrap();
    let third = restarted.receive_message().await.unwrap();
    assert_eq!(third.get("seq"), Some(&json!(3)));

    publisher.disconnect().await.unwrap();
    restarted.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_push_without_peer_is_retryable() {
    init();
    let mut pusher = PubSubChannel::with_config(
        TransportConfig::new()
            .with("role", "PUSH")
            .with("endpoint", "tcp://127.0.0.1:0")
            .with("bind", true),
    )
    .unwrap();
    pusher.connect().await.unwrap();
    assert_eq!(pusher.peer_count(), 0);

    let err = pusher.send_document(&doc(json!({"job": 1}))).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Transport);
    assert!(err.is_retryable());
    pusher.disconnect().await.unwrap();
}

async fn exercise_lifecycle<C: Channel>(mut channel: C, options: TransportConfig) {
    assert_eq!(channel.state(), ChannelState::Created);
    channel.disconnect().await.unwrap();

    channel.configure(options).unwrap();
    assert_eq!(channel.state(), ChannelState::Configured);

    channel.connect().await.unwrap();
    assert!(channel.is_connected());
    assert_eq!(
        channel.connect().await.unwrap_err().kind(),
        ErrorKind::ConnectionState
    );

    channel.disconnect().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Disconnected);
    channel.disconnect().await.unwrap();

    // reconnect after disconnect
    channel.connect().await.unwrap();
    channel.disconnect().await.unwrap();
}

#[tokio::test]
async fn test_lifecycle_contract() {
    init();
    exercise_lifecycle(
        DatagramChannel::new(),
        TransportConfig::new().with("host", "127.0.0.1"),
    )
    .await;
    exercise_lifecycle(
        PubSubChannel::new(),
        TransportConfig::new()
            .with("role", "PUB")
            .with("endpoint", "tcp://127.0.0.1:0")
            .with("bind", true),
    )
    .await;
}

#[tokio::test]
async fn test_supervised_connect_exhausts() {
    init();
    // reserve a port, then free it so nothing listens there
    let port = {
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        spare.local_addr().unwrap().port()
    };
    let config = SupervisorConfig {
        policy: RetryPolicy {
            attempts: 3,
            backoff: Backoff::new(Duration::from_millis(5), 0.5, Duration::from_millis(50)),
            stable_after: Duration::from_secs(60),
        },
        escalation: Escalation::AbandonTask,
    };

    let endpoint = format!("tcp://127.0.0.1:{}", port);
    let handle = Supervisor::new("telemetry push", config).spawn(move || {
        let endpoint = endpoint.clone();
        async move {
            let mut channel = PubSubChannel::with_config(
                TransportConfig::new()
                    .with("role", "PUSH")
                    .with("endpoint", endpoint),
            )?;
            channel.connect().await?;
            Ok::<_, Error>(ControlFlow::Break(()))
        }
    });

    let result = tokio::time::timeout(WAIT, handle).await.unwrap().unwrap();
    match result {
        Err(Error::RetryExhausted { operation, attempts, last }) => {
            assert_eq!(operation, "telemetry push");
            assert_eq!(attempts, 3);
            assert_eq!(last.kind(), ErrorKind::Transport);
        }
        other => panic!("expected exhaustion, got {:?}", other),
    }
}
