use serde_json::{json, Value};
use std::time::Duration;

use rabbit_bridge::services::user::LoginRequest;
use rabbit_bridge::services::{post, user, IdRequest};
use rabbit_bridge::worker::typed;
use rabbit_bridge::{Reply, RpcError, WorkerBuilder};

use crate::common::Harness;

fn parse(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap()
}

#[tokio::test]
async fn test_login_resolves_with_exact_worker_payload() {
    let login = WorkerBuilder::new("user", "user_service")
        .route(
            user::LOGIN,
            typed("Invalid login request.", |req: LoginRequest| async move {
                assert_eq!(req.email, "a@b.com");
                assert_eq!(req.password, "x");
                Ok(Reply::ok("token-123"))
            }),
        )
        .build();
    let harness = Harness::start(vec![login]).await;

    let response = harness
        .client
        .send(user::LOGIN, Some(&json!({"email": "a@b.com", "password": "x"})))
        .await
        .unwrap();

    assert_eq!(response, r#"{"success":true,"message":"token-123"}"#);
    assert_eq!(harness.client.pending_calls(), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_register_login_and_query_through_demo_workers() {
    let harness = Harness::demo().await;
    let client = &harness.client;

    let registered = client
        .send(user::REGISTER, Some(&json!({"name": "Ada", "email": "a@b.com", "password": "x"})))
        .await
        .unwrap();
    assert_eq!(parse(&registered), json!({"success": true, "message": "User created successfully."}));

    let login = parse(
        &client
            .send(user::LOGIN, Some(&json!({"email": "a@b.com", "password": "x"})))
            .await
            .unwrap(),
    );
    assert_eq!(login["success"], json!(true));

    // Queries come back as the raw domain payload
    let users = parse(&client.send::<Value>(user::GET_ALL, None).await.unwrap());
    assert_eq!(users.as_array().unwrap().len(), 1);
    assert_eq!(users[0]["name"], json!("Ada"));

    harness.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_calls_on_distinct_keys_get_their_own_responses() {
    let harness = Harness::demo().await;
    harness
        .client
        .send(post::CREATE, Some(&json!({"user_id": 1, "text": "first"})))
        .await
        .unwrap();

    let mut calls = Vec::new();
    for i in 0..10 {
        let client = harness.client.clone();
        calls.push(tokio::spawn(async move {
            let (key, body) = match i % 3 {
                0 => (user::GET_ALL, json!({})),
                1 => (post::GET_ALL, json!({})),
                _ => ("image.process", json!({"PostId": i, "ImageData": "aGVsbG8="})),
            };
            (i, client.send(key, Some(&body)).await.unwrap())
        }));
    }

    for call in calls {
        let (i, response) = call.await.unwrap();
        let response = parse(&response);
        match i % 3 {
            0 => assert_eq!(response, json!([])),
            1 => assert_eq!(response[0]["text"], json!("first")),
            _ => {
                assert_eq!(response["PostId"], json!(i));
                assert_eq!(response["success"], json!(true));
            }
        }
    }
    harness.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_calls_on_the_same_key_do_not_cross() {
    let harness = Harness::demo().await;
    for text in ["one", "two", "three", "four", "five"] {
        harness
            .client
            .send(post::CREATE, Some(&json!({"user_id": 1, "text": text})))
            .await
            .unwrap();
    }

    let mut calls = Vec::new();
    for round in 0..4 {
        for id in 1..=5i64 {
            let client = harness.client.clone();
            calls.push(tokio::spawn(async move {
                let post: Value = client
                    .call(post::GET_BY_ID, &IdRequest { id })
                    .await
                    .unwrap();
                (round, id, post)
            }));
        }
    }

    let texts = ["one", "two", "three", "four", "five"];
    for call in calls {
        let (_, id, post) = call.await.unwrap();
        assert_eq!(post["id"], json!(id));
        assert_eq!(post["text"], json!(texts[(id - 1) as usize]));
    }
    assert_eq!(harness.client.pending_calls(), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_unbound_routing_key_times_out() {
    let harness = Harness::demo().await;

    let err = harness
        .client
        .send_with_timeout("video.encode", Some(&json!({})), Duration::from_millis(50))
        .await
        .unwrap_err();

    assert!(matches!(err, RpcError::Timeout { .. }));
    assert_eq!(harness.client.pending_calls(), 0);
    harness.shutdown().await;
}

#[tokio::test]
async fn test_key_without_handler_gets_unhandled_request() {
    let only_login = WorkerBuilder::new("user", "user_service")
        .route(
            user::LOGIN,
            typed("Invalid login request.", |_: LoginRequest| async {
                Ok(Reply::ok("token"))
            }),
        )
        .build();
    let harness = Harness::start(vec![only_login]).await;

    let response = harness
        .client
        .send(user::DELETE, Some(&json!({"id": 1})))
        .await
        .unwrap();
    assert_eq!(parse(&response), json!({"success": false, "message": "Unhandled request."}));
    harness.shutdown().await;
}
