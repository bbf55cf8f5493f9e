use serde::de::IgnoredAny;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rabbit_bridge::services::{post, user};
use rabbit_bridge::worker::typed;
use rabbit_bridge::{
    Broker, ConnectionState, CorrelationId, Envelope, Reply, Service, WorkerBuilder,
};

use crate::common::{eventually, test_config, Harness};

#[tokio::test]
async fn test_failed_requests_are_answered_and_acked_once() {
    let harness = Harness::demo().await;

    let bad_login = harness
        .client
        .send(user::LOGIN, Some(&json!({"email": "a@b.com"})))
        .await
        .unwrap();
    assert_eq!(
        serde_json::from_str::<Value>(&bad_login).unwrap(),
        json!({"success": false, "message": "Invalid login request."})
    );

    let not_json = harness
        .client
        .send(user::REGISTER, Some(&"just a string"))
        .await
        .unwrap();
    assert!(not_json.contains(r#""success":false"#));

    let broker = harness.broker.clone();
    eventually("both requests acked", || {
        let broker = broker.clone();
        async move { broker.queue_stats("user_service").unwrap().acked == 2 }
    })
    .await;

    let stats = harness.broker.queue_stats("user_service").unwrap();
    assert_eq!(stats.nacked, 0);
    assert_eq!(stats.redelivered, 0);
    assert_eq!(stats.ready + stats.unacked, 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_like_is_not_toggled_twice() {
    let harness = Harness::demo().await;
    harness
        .client
        .send(post::CREATE, Some(&json!({"user_id": 1, "text": "hello"})))
        .await
        .unwrap();

    // The same request (same message id) reaching the worker twice
    let like = Envelope::request(
        post::LIKE,
        json!({"post_id": 1, "user_id": 2}).to_string().into_bytes(),
        CorrelationId::new(),
    );
    harness.broker.publish("gateway_exchange", &like).await.unwrap();
    harness.broker.publish("gateway_exchange", &like).await.unwrap();

    let broker = harness.broker.clone();
    eventually("both deliveries answered", || {
        let broker = broker.clone();
        async move { broker.queue_stats("post_responses").unwrap().acked == 3 }
    })
    .await;

    let likes = harness
        .client
        .send(post::LIKES_GET, Some(&json!({"id": 1})))
        .await
        .unwrap();
    let likes: Value = serde_json::from_str(&likes).unwrap();
    assert_eq!(likes.as_array().unwrap().len(), 1);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_calls_succeed_again_after_broker_outage() {
    let harness = Harness::demo().await;
    harness
        .client
        .send(user::REGISTER, Some(&json!({"name": "Ada", "email": "a@b.com", "password": "x"})))
        .await
        .unwrap();

    harness.broker.disconnect();
    assert_eq!(harness.gateway.health().state(), ConnectionState::Reconnecting);
    let during = harness
        .client
        .send(user::GET_ALL, Some(&json!({})))
        .await
        .unwrap_err();
    assert!(during.is_transport());

    tokio::time::sleep(Duration::from_millis(30)).await;
    harness.broker.restore();
    assert!(harness.gateway.health().wait_connected(Duration::from_secs(2)).await);

    let users = harness
        .client
        .send(user::GET_ALL, Some(&json!({})))
        .await
        .unwrap();
    let users: Value = serde_json::from_str(&users).unwrap();
    assert_eq!(users[0]["email"], json!("a@b.com"));
    harness.shutdown().await;
}

#[tokio::test]
async fn test_prefetch_bounds_concurrent_handlers() {
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let (r, p) = (running.clone(), peak.clone());
    let slow = WorkerBuilder::new("image", Service::Image.queue())
        .route(
            "image.process",
            typed("Image processing request was null.", move |_: IgnoredAny| {
                let (running, peak) = (r.clone(), p.clone());
                async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(Reply::ok("done"))
                }
            }),
        )
        .build();

    let mut config = test_config();
    config.worker.prefetch_count = 2;
    let harness = Harness::start_with(config, vec![slow]).await;

    let mut calls = Vec::new();
    for _ in 0..8 {
        let client = harness.client.clone();
        calls.push(tokio::spawn(async move {
            client.send("image.process", Some(&json!({}))).await
        }));
    }
    for call in calls {
        assert!(call.await.unwrap().is_ok());
    }

    assert!(peak.load(Ordering::SeqCst) <= 2);
    assert!(peak.load(Ordering::SeqCst) >= 1);
    harness.shutdown().await;
}
