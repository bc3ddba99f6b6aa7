use std::sync::Arc;

use nsbroker::codec::FrameCodec;
use nsbroker::dispatcher::Dispatcher;
use nsbroker::metrics::Counters;

fn dispatcher() -> Dispatcher {
    Dispatcher::new(Arc::new(FrameCodec::new()), Arc::new(Counters::new()))
}

#[tokio::test]
async fn concurrent_routes_preserve_per_subscriber_order() {
    let dispatcher = Arc::new(dispatcher());
    let (_queue, mut rx) = dispatcher.subscribe("/feed").unwrap();

    let mut handles = Vec::new();
    for batch in 0..4 {
        let dispatcher = Arc::clone(&dispatcher);
        handles.push(tokio::spawn(async move {
            for i in 0..25 {
                let payload = format!("{batch}:{i}").into_bytes();
                dispatcher.route("/feed", payload).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let mut received = Vec::new();
    while let Ok(message) = rx.try_recv() {
        received.push(String::from_utf8(message.raw.clone()).unwrap());
    }
    assert_eq!(received.len(), 100);

    // each batch's own messages must still appear in the order that batch
    // sent them, even though batches interleaved with each other.
    for batch in 0..4 {
        let ordered: Vec<_> = received
            .iter()
            .filter(|m| m.starts_with(&format!("{batch}:")))
            .cloned()
            .collect();
        let expected: Vec<_> = (0..25).map(|i| format!("{batch}:{i}")).collect();
        assert_eq!(ordered, expected);
    }
}

#[tokio::test]
async fn subscriber_joining_mid_stream_only_sees_messages_after_it_subscribed() {
    let dispatcher = Arc::new(dispatcher());
    dispatcher.route("/a/b", b"before".to_vec()).unwrap();

    let (_queue, mut rx) = dispatcher.subscribe("/a/b").unwrap();
    dispatcher.route("/a/b", b"after".to_vec()).unwrap();

    let message = rx.recv().await.unwrap();
    assert_eq!(message.raw, b"after");
}

#[tokio::test]
async fn unsubscribing_one_ancestor_does_not_affect_a_sibling_subscription() {
    let dispatcher = Arc::new(dispatcher());
    let (queue_a, mut rx_a) = dispatcher.subscribe("/a").unwrap();
    let (_queue_b, mut rx_b) = dispatcher.subscribe("/a/b").unwrap();

    dispatcher.unsubscribe("/a", &queue_a);
    dispatcher.route("/a/b", b"still-here".to_vec()).unwrap();

    assert!(rx_a.try_recv().is_err());
    assert_eq!(rx_b.recv().await.unwrap().raw, b"still-here");
}
