// tests/memory_queue.rs
//
// Contract tests for the messaging surface, exercised against the memory
// backend (the reference implementation of contract semantics).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

use taskbus::{
    //
    consumer,
    subscriber,
    Error,
    Message,
    QueueConfig,
    QueuePtr,
};

const FAST_RETRY: Duration = Duration::from_millis(50);

async fn connect_memory() -> QueuePtr {
    // ---
    taskbus::connect(&QueueConfig::memory().with_retry_interval(FAST_RETRY))
        .await
        .expect("memory backend should connect")
}

/// Subscribe listener that forwards every delivery into a channel.
fn forwarding_subscriber(tx: mpsc::UnboundedSender<Message>) -> taskbus::SubscribeListener {
    // ---
    subscriber(move |msg| {
        let tx = tx.clone();
        async move {
            let _ = tx.send(msg);
        }
    })
}

async fn recv_soon(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
    // ---
    timeout(Duration::from_secs(1), rx.recv())
        .await
        .expect("timed out waiting for delivery")
        .expect("delivery channel closed unexpectedly")
}

#[tokio::test]
async fn test_publish_before_subscribe_is_dropped() {
    // ---
    let queue = connect_memory().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    queue
        .publish("news", None, json!({"seq": 1}))
        .await
        .unwrap();

    queue
        .subscribe("news", None, forwarding_subscriber(tx))
        .await
        .unwrap();
    queue
        .publish("news", None, json!({"seq": 2}))
        .await
        .unwrap();

    let msg = recv_soon(&mut rx).await;
    assert_eq!(msg.get("seq"), Some(&json!(2)));
    assert!(rx.try_recv().is_err(), "pre-subscribe publish was buffered");
}

#[tokio::test]
async fn test_publish_reaches_exact_channel_only() {
    // ---
    let queue = connect_memory().await;
    let (tx_a, mut rx_a) = mpsc::unbounded_channel();
    let (tx_b, mut rx_b) = mpsc::unbounded_channel();
    let (tx_plain, mut rx_plain) = mpsc::unbounded_channel();

    queue
        .subscribe("news", Some("sports"), forwarding_subscriber(tx_a))
        .await
        .unwrap();
    queue
        .subscribe("news", Some("weather"), forwarding_subscriber(tx_b))
        .await
        .unwrap();
    queue
        .subscribe("news", None, forwarding_subscriber(tx_plain))
        .await
        .unwrap();

    queue
        .publish("news", Some("sports"), json!({"headline": "win"}))
        .await
        .unwrap();

    let msg = recv_soon(&mut rx_a).await;
    assert_eq!(msg.get("headline"), Some(&json!("win")));
    assert!(rx_b.try_recv().is_err());
    assert!(rx_plain.try_recv().is_err());
}

#[tokio::test]
async fn test_subscribe_rejects_empty_name() {
    // ---
    let queue = connect_memory().await;
    let (tx, _rx) = mpsc::unbounded_channel();

    let result = queue.subscribe("", None, forwarding_subscriber(tx)).await;
    assert!(matches!(result, Err(Error::InvalidArgument(_))));
}

#[tokio::test]
async fn test_send_round_robin_order() {
    // ---
    let queue = connect_memory().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    for index in 0..2u32 {
        let tx = tx.clone();
        queue
            .consume(
                "jobs",
                consumer(move |_msg| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send(index);
                        Ok(None)
                    }
                }),
            )
            .await
            .unwrap();
    }

    for _ in 0..4 {
        queue.send("jobs", json!({})).await.unwrap();
    }

    let mut order = Vec::new();
    for _ in 0..4 {
        order.push(rx.recv().await.unwrap());
    }
    assert_eq!(order, vec![0, 1, 0, 1]);
}

#[tokio::test]
async fn test_send_with_no_consumer_is_retried() {
    // ---
    let queue = connect_memory().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    queue.send("jobs", json!({"n": 7})).await.unwrap();

    // Consumer arrives late; the retry sweep must deliver the buffered task.
    queue
        .consume(
            "jobs",
            consumer(move |msg| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(msg);
                    Ok(None)
                }
            }),
        )
        .await
        .unwrap();

    let msg = recv_soon(&mut rx).await;
    assert_eq!(msg.get("n"), Some(&json!(7)));
    assert!(msg.ts > 0);
}

#[tokio::test]
async fn test_failed_send_task_is_requeued() {
    // ---
    let queue = connect_memory().await;
    let (tx, mut rx) = mpsc::unbounded_channel();
    let failed_once = Arc::new(AtomicBool::new(false));

    queue
        .consume(
            "flaky",
            consumer(move |msg| {
                let tx = tx.clone();
                let failed_once = Arc::clone(&failed_once);
                async move {
                    if !failed_once.swap(true, Ordering::SeqCst) {
                        return Err(Error::Consumer("transient".into()));
                    }
                    let _ = tx.send(msg);
                    Ok(None)
                }
            }),
        )
        .await
        .unwrap();

    queue.send("flaky", json!({"n": 1})).await.unwrap();

    // First attempt fails and re-queues; the sweep delivers the second.
    let msg = recv_soon(&mut rx).await;
    assert_eq!(msg.get("n"), Some(&json!(1)));
}

#[tokio::test]
async fn test_rpc_echoes_consumer_reply() {
    // ---
    let queue = connect_memory().await;

    queue
        .consume(
            "echo",
            consumer(|msg| async move {
                Ok(Some(json!({"bar": msg.get("bar").cloned().unwrap_or(Value::Null)})))
            }),
        )
        .await
        .unwrap();

    let reply = queue
        .rpc("echo", json!({"bar": "X"}), Some(Duration::from_secs(2)))
        .await
        .unwrap();

    assert_eq!(reply.get("bar"), Some(&json!("X")));
    assert!(reply.ts > 0);
}

#[tokio::test]
async fn test_rpc_with_empty_reply_yields_bare_timestamp() {
    // ---
    let queue = connect_memory().await;

    queue
        .consume("quiet", consumer(|_msg| async move { Ok(None) }))
        .await
        .unwrap();

    let reply = queue
        .rpc("quiet", json!({}), Some(Duration::from_secs(2)))
        .await
        .unwrap();

    assert!(reply.ts > 0);
    assert!(reply.data.is_empty());
}

#[tokio::test]
async fn test_rpc_surfaces_consumer_failure() {
    // ---
    let queue = connect_memory().await;

    queue
        .consume(
            "broken",
            consumer(|_msg| async move {
                Err::<Option<Value>, _>(Error::Consumer("boom".into()))
            }),
        )
        .await
        .unwrap();

    let result = queue
        .rpc("broken", json!({}), Some(Duration::from_secs(2)))
        .await;
    assert!(matches!(result, Err(Error::Consumer(reason)) if reason == "boom"));
}

#[tokio::test]
async fn test_rpc_times_out_without_consumer() {
    // ---
    let queue = connect_memory().await;

    let result = queue
        .rpc("nobody", json!({}), Some(Duration::from_millis(50)))
        .await;
    assert!(matches!(result, Err(Error::Timeout)));
}

#[tokio::test]
async fn test_rpc_pending_completes_when_consumer_appears() {
    // ---
    let queue = connect_memory().await;

    let call = {
        let queue = queue.clone();
        tokio::spawn(async move {
            queue
                .rpc("late", json!({"bar": "Y"}), Some(Duration::from_secs(2)))
                .await
        })
    };

    sleep(Duration::from_millis(20)).await;
    queue
        .consume(
            "late",
            consumer(|msg| async move {
                Ok(Some(json!({"bar": msg.get("bar").cloned().unwrap_or(Value::Null)})))
            }),
        )
        .await
        .unwrap();

    let reply = call.await.unwrap().unwrap();
    assert_eq!(reply.get("bar"), Some(&json!("Y")));
}

#[tokio::test]
async fn test_disposed_consumer_leaves_rotation() {
    // ---
    let queue = connect_memory().await;
    let (tx, mut rx) = mpsc::unbounded_channel();

    let first = {
        let tx = tx.clone();
        queue
            .consume(
                "jobs",
                consumer(move |_msg| {
                    let tx = tx.clone();
                    async move {
                        let _ = tx.send("first");
                        Ok(None)
                    }
                }),
            )
            .await
            .unwrap()
    };
    queue
        .consume(
            "jobs",
            consumer(move |_msg| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send("second");
                    Ok(None)
                }
            }),
        )
        .await
        .unwrap();

    first.dispose();
    assert!(first.is_disposed());

    for _ in 0..3 {
        queue.send("jobs", json!({})).await.unwrap();
    }
    for _ in 0..3 {
        assert_eq!(rx.recv().await.unwrap(), "second");
    }
}

#[tokio::test]
async fn test_disconnect_rejects_further_operations() {
    // ---
    let queue = connect_memory().await;
    queue.disconnect().await.unwrap();
    // Disconnecting twice is a no-op.
    queue.disconnect().await.unwrap();

    assert!(matches!(
        queue.publish("news", None, json!({})).await,
        Err(Error::Disposed)
    ));

    let (tx, _rx) = mpsc::unbounded_channel();
    assert!(matches!(
        queue.subscribe("news", None, forwarding_subscriber(tx)).await,
        Err(Error::Disposed)
    ));

    assert!(matches!(
        queue.send("jobs", json!({})).await,
        Err(Error::Disposed)
    ));

    assert!(matches!(
        queue
            .consume("jobs", consumer(|_msg| async move { Ok(None) }))
            .await,
        Err(Error::Disposed)
    ));

    assert!(matches!(
        queue.rpc("jobs", json!({}), None).await,
        Err(Error::Disposed)
    ));
}

#[tokio::test]
async fn test_sequence_buffers_and_pulls_in_order() {
    // ---
    let queue = connect_memory().await;
    let sequence = queue.subscribe_sequence("events").await.unwrap();

    for seq in 0..3 {
        queue
            .publish("events", None, json!({"seq": seq}))
            .await
            .unwrap();
    }

    // Producers never block; a slow consumer just accumulates entries.
    assert_eq!(sequence.buffered(), 3);

    for seq in 0..3 {
        let msg = sequence.next().await.unwrap();
        assert_eq!(msg.get("seq"), Some(&json!(seq)));
    }

    sequence.dispose();
    assert!(sequence.is_disposed());
    queue
        .publish("events", None, json!({"seq": 99}))
        .await
        .unwrap();
    assert_eq!(sequence.buffered(), 0);
}

#[tokio::test]
async fn test_sequence_wakes_parked_consumer() {
    // ---
    let queue = connect_memory().await;
    let sequence = queue.subscribe_sequence("ticks").await.unwrap();

    let puller = tokio::spawn(async move {
        let msg = sequence.next().await.unwrap();
        msg.get("n").cloned()
    });

    sleep(Duration::from_millis(20)).await;
    queue.publish("ticks", None, json!({"n": 5})).await.unwrap();

    let value = timeout(Duration::from_secs(1), puller)
        .await
        .expect("sequence consumer not woken")
        .unwrap();
    assert_eq!(value, Some(json!(5)));
}
