use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::IgnoredAny, Deserialize, Serialize};
use std::sync::Arc;

use super::IdRequest;
use crate::message::Reply;
use crate::worker::{typed, HandlerError, RequestShape, WorkerBuilder, UNHANDLED_REQUEST};

pub const QUEUE: &str = "user_service";
pub const RESPONSE_QUEUE: &str = "user_responses";

pub const REGISTER: &str = "user.register";
pub const LOGIN: &str = "user.login";
pub const GET_ALL: &str = "user.get_all";
pub const GET_BY_ID: &str = "user.get_by_id";
pub const UPDATE: &str = "user.update";
pub const DELETE: &str = "user.delete";

pub const ROUTING_KEYS: [&str; 6] = [REGISTER, LOGIN, GET_ALL, GET_BY_ID, UPDATE, DELETE];

pub const USER_CREATED: &str = "User created successfully.";
pub const USER_UPDATED: &str = "User updated successfully.";
pub const USER_DELETED: &str = "User deleted successfully.";

fn default_role() -> String {
    "user".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    #[serde(alias = "Id", alias = "ID", default)]
    pub id: i64,
    #[serde(alias = "Name", default)]
    pub name: String,
    #[serde(alias = "Email", default)]
    pub email: String,
    #[serde(alias = "Password", default, skip_serializing)]
    pub password: String,
    #[serde(alias = "Role", default = "default_role")]
    pub role: String,
    #[serde(alias = "Created_at", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl RequestShape for User {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoginRequest {
    #[serde(alias = "Email")]
    pub email: String,
    #[serde(alias = "Password")]
    pub password: String,
}

impl RequestShape for LoginRequest {}

/// Storage and authentication behind the user service.
#[async_trait]
pub trait UserBackend: Send + Sync {
    async fn create_user(&self, user: User) -> Result<(), HandlerError>;

    /// Returns a session token.
    async fn login(&self, email: &str, password: &str) -> Result<String, HandlerError>;

    async fn all_users(&self) -> Vec<User>;

    async fn user_by_id(&self, id: i64) -> Option<User>;

    async fn update_user(&self, id: i64, user: User) -> Result<(), HandlerError>;

    /// Returns false when no such user exists.
    async fn delete_user(&self, id: i64) -> bool;
}

/// Routes every user routing key to `backend`.
pub fn worker(backend: Arc<dyn UserBackend>) -> WorkerBuilder {
    let register = backend.clone();
    let login = backend.clone();
    let get_all = backend.clone();
    let get_by_id = backend.clone();
    let update = backend.clone();
    let delete = backend;

    WorkerBuilder::new("user", QUEUE)
        .route(
            REGISTER,
            typed("User could not be registered : message was null.", move |user: User| {
                let backend = register.clone();
                async move {
                    backend
                        .create_user(user)
                        .await
                        .map(|()| Reply::ok(USER_CREATED))
                }
            }),
        )
        .route(
            LOGIN,
            typed("Invalid login request.", move |req: LoginRequest| {
                let backend = login.clone();
                async move {
                    backend
                        .login(&req.email, &req.password)
                        .await
                        .map(Reply::ok)
                }
            }),
        )
        .route(
            GET_ALL,
            typed("Invalid request.", move |_: IgnoredAny| {
                let backend = get_all.clone();
                async move { Ok(Reply::data(&backend.all_users().await)) }
            }),
        )
        .route(
            GET_BY_ID,
            typed("User could not be found: invalid request.", move |req: IdRequest| {
                let backend = get_by_id.clone();
                async move {
                    Ok(match backend.user_by_id(req.id).await {
                        Some(user) => Reply::data(&user),
                        None => Reply::failure(UNHANDLED_REQUEST),
                    })
                }
            }),
        )
        .route(
            UPDATE,
            typed("User could not be updated : message was null.", move |user: User| {
                let backend = update.clone();
                async move {
                    backend
                        .update_user(user.id, user)
                        .await
                        .map(|()| Reply::ok(USER_UPDATED))
                }
            }),
        )
        .route(
            DELETE,
            typed("User could not be deleted: invalid request.", move |req: IdRequest| {
                let backend = delete.clone();
                async move {
                    Ok(if backend.delete_user(req.id).await {
                        Reply::ok(USER_DELETED)
                    } else {
                        Reply::failure("User could not be deleted.")
                    })
                }
            }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemoryUserStore;
    use serde_json::{json, Value};

    async fn call(worker: &crate::worker::Worker, key: &str, body: Value) -> Value {
        let reply = worker.dispatch(key, body.to_string().as_bytes()).await;
        serde_json::from_slice(&reply.to_bytes()).unwrap()
    }

    #[tokio::test]
    async fn test_register_then_login() {
        let worker = worker(Arc::new(MemoryUserStore::new())).build();

        let registered = call(
            &worker,
            REGISTER,
            json!({"name": "Ada", "email": "a@b.com", "password": "x"}),
        )
        .await;
        assert_eq!(registered, json!({"success": true, "message": USER_CREATED}));

        let duplicate = call(
            &worker,
            REGISTER,
            json!({"name": "Ada", "email": "a@b.com", "password": "y"}),
        )
        .await;
        assert_eq!(duplicate["success"], json!(false));
        assert_eq!(duplicate["message"], json!("User with this email already exists."));

        let login = call(&worker, LOGIN, json!({"email": "a@b.com", "password": "x"})).await;
        assert_eq!(login["success"], json!(true));
        assert!(!login["message"].as_str().unwrap().is_empty());

        let wrong = call(&worker, LOGIN, json!({"email": "a@b.com", "password": "nope"})).await;
        assert_eq!(wrong, json!({"success": false, "message": "Incorrect password."}));
    }

    #[tokio::test]
    async fn test_malformed_requests_get_failure_messages() {
        let worker = worker(Arc::new(MemoryUserStore::new())).build();

        assert_eq!(
            call(&worker, LOGIN, json!({"email": "a@b.com"})).await,
            json!({"success": false, "message": "Invalid login request."})
        );
        assert_eq!(
            call(&worker, REGISTER, Value::Null).await,
            json!({"success": false, "message": "User could not be registered : message was null."})
        );
        assert_eq!(
            call(&worker, GET_BY_ID, json!({"id": 0})).await,
            json!({"success": false, "message": "User could not be found: invalid request."})
        );
    }

    #[tokio::test]
    async fn test_queries_return_raw_data_without_passwords() {
        let worker = worker(Arc::new(MemoryUserStore::new())).build();
        call(
            &worker,
            REGISTER,
            json!({"name": "Ada", "email": "a@b.com", "password": "x"}),
        )
        .await;

        let all = call(&worker, GET_ALL, json!({})).await;
        let users = all.as_array().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["email"], json!("a@b.com"));
        assert_eq!(users[0]["role"], json!("user"));
        assert!(users[0].get("password").is_none());

        let id = users[0]["id"].clone();
        let one = call(&worker, GET_BY_ID, json!({"id": id})).await;
        assert_eq!(one["name"], json!("Ada"));

        let deleted = call(&worker, DELETE, json!({"id": id})).await;
        assert_eq!(deleted, json!({"success": true, "message": USER_DELETED}));
        let again = call(&worker, DELETE, json!({"id": id})).await;
        assert_eq!(again, json!({"success": false, "message": "User could not be deleted."}));
    }
}
