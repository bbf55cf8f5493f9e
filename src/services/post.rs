use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{de::IgnoredAny, Deserialize, Serialize};
use std::sync::Arc;

use super::IdRequest;
use crate::message::Reply;
use crate::worker::{typed, HandlerError, RequestShape, WorkerBuilder, UNHANDLED_REQUEST};

pub const QUEUE: &str = "post_service";
pub const RESPONSE_QUEUE: &str = "post_responses";

pub const CREATE: &str = "post.create";
pub const GET_ALL: &str = "post.get_all";
pub const GET_BY_ID: &str = "post.get_by_id";
pub const UPDATE: &str = "post.update";
pub const DELETE: &str = "post.delete";
pub const LIKE: &str = "post.like";
pub const COMMENT: &str = "post.comment";
pub const LIKES_GET: &str = "post.likes_get";
pub const COMMENTS_GET: &str = "post.comments_get";

pub const ROUTING_KEYS: [&str; 9] = [
    CREATE,
    GET_ALL,
    GET_BY_ID,
    UPDATE,
    DELETE,
    LIKE,
    COMMENT,
    LIKES_GET,
    COMMENTS_GET,
];

const POST_NOT_FOUND: &str = "Post could not be found: invalid request.";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Post {
    #[serde(alias = "Id", alias = "ID", default)]
    pub id: i64,
    #[serde(alias = "User_id", default)]
    pub user_id: i64,
    #[serde(alias = "Text", default)]
    pub text: String,
    #[serde(alias = "Image_url", default)]
    pub image_url: Option<String>,
    #[serde(alias = "Created_at", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl RequestShape for Post {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Like {
    #[serde(alias = "Id", alias = "ID", default)]
    pub id: i64,
    #[serde(alias = "Post_id", default)]
    pub post_id: i64,
    #[serde(alias = "User_id", default)]
    pub user_id: i64,
    #[serde(alias = "Created_at", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl RequestShape for Like {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Comment {
    #[serde(alias = "Id", alias = "ID", default)]
    pub id: i64,
    #[serde(alias = "Post_id", default)]
    pub post_id: i64,
    #[serde(alias = "User_id", default)]
    pub user_id: i64,
    #[serde(alias = "Text", default)]
    pub text: String,
    #[serde(alias = "Created_at", default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl RequestShape for Comment {}

/// Result of `post.like`: the same request toggles the like on and off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LikeToggle {
    Liked,
    Unliked,
}

impl LikeToggle {
    pub fn message(&self) -> &'static str {
        match self {
            LikeToggle::Liked => "Post liked successfully.",
            LikeToggle::Unliked => "Post unliked successfully.",
        }
    }
}

#[async_trait]
pub trait PostBackend: Send + Sync {
    async fn create_post(&self, post: Post) -> Result<(), HandlerError>;

    async fn all_posts(&self) -> Vec<Post>;

    async fn post_by_id(&self, id: i64) -> Option<Post>;

    async fn update_post(&self, id: i64, post: Post) -> Result<(), HandlerError>;

    async fn delete_post(&self, id: i64) -> bool;

    async fn toggle_like(&self, like: Like) -> Result<LikeToggle, HandlerError>;

    async fn comment(&self, comment: Comment) -> Result<(), HandlerError>;

    async fn likes(&self, post_id: i64) -> Vec<Like>;

    async fn comments(&self, post_id: i64) -> Vec<Comment>;
}

pub fn worker(backend: Arc<dyn PostBackend>) -> WorkerBuilder {
    let create = backend.clone();
    let get_all = backend.clone();
    let get_by_id = backend.clone();
    let update = backend.clone();
    let delete = backend.clone();
    let like = backend.clone();
    let comment = backend.clone();
    let likes_get = backend.clone();
    let comments_get = backend;

    WorkerBuilder::new("post", QUEUE)
        .route(
            CREATE,
            typed("Post could not be created : message was null.", move |post: Post| {
                let backend = create.clone();
                async move {
                    backend
                        .create_post(post)
                        .await
                        .map(|()| Reply::ok("Post created successfully."))
                }
            }),
        )
        .route(
            GET_ALL,
            typed("Invalid request.", move |_: IgnoredAny| {
                let backend = get_all.clone();
                async move { Ok(Reply::data(&backend.all_posts().await)) }
            }),
        )
        .route(
            GET_BY_ID,
            typed(POST_NOT_FOUND, move |req: IdRequest| {
                let backend = get_by_id.clone();
                async move {
                    Ok(match backend.post_by_id(req.id).await {
                        Some(post) => Reply::data(&post),
                        None => Reply::failure(UNHANDLED_REQUEST),
                    })
                }
            }),
        )
        .route(
            UPDATE,
            typed("Post could not be updated : message was null.", move |post: Post| {
                let backend = update.clone();
                async move {
                    backend
                        .update_post(post.id, post)
                        .await
                        .map(|()| Reply::ok("Post updated successfully."))
                }
            }),
        )
        .route(
            DELETE,
            typed("Post could not be deleted: invalid request.", move |req: IdRequest| {
                let backend = delete.clone();
                async move {
                    Ok(if backend.delete_post(req.id).await {
                        Reply::ok("Post deleted successfully.")
                    } else {
                        Reply::failure("Post could not be deleted.")
                    })
                }
            }),
        )
        .route(
            LIKE,
            typed("Post could not be liked: invalid request.", move |req: Like| {
                let backend = like.clone();
                async move {
                    backend
                        .toggle_like(req)
                        .await
                        .map(|toggle| Reply::ok(toggle.message()))
                }
            }),
        )
        .route(
            COMMENT,
            typed("Post could not be commented on: invalid request.", move |req: Comment| {
                let backend = comment.clone();
                async move {
                    backend
                        .comment(req)
                        .await
                        .map(|()| Reply::ok("Post commented successfully."))
                }
            }),
        )
        .route(
            LIKES_GET,
            typed(POST_NOT_FOUND, move |req: IdRequest| {
                let backend = likes_get.clone();
                async move { Ok(Reply::data(&backend.likes(req.id).await)) }
            }),
        )
        .route(
            COMMENTS_GET,
            typed(POST_NOT_FOUND, move |req: IdRequest| {
                let backend = comments_get.clone();
                async move { Ok(Reply::data(&backend.comments(req.id).await)) }
            }),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::MemoryPostStore;
    use crate::worker::Worker;
    use serde_json::{json, Value};

    async fn call(worker: &Worker, key: &str, body: Value) -> Value {
        let reply = worker.dispatch(key, body.to_string().as_bytes()).await;
        serde_json::from_slice(&reply.to_bytes()).unwrap()
    }

    async fn worker_with_post() -> Worker {
        let worker = worker(Arc::new(MemoryPostStore::new())).build();
        let created = call(&worker, CREATE, json!({"user_id": 1, "text": "hello"})).await;
        assert_eq!(created, json!({"success": true, "message": "Post created successfully."}));
        worker
    }

    #[tokio::test]
    async fn test_like_toggles() {
        let worker = worker_with_post().await;
        let like = json!({"post_id": 1, "user_id": 7});

        assert_eq!(call(&worker, LIKE, like.clone()).await["message"], json!("Post liked successfully."));
        assert_eq!(call(&worker, LIKES_GET, json!({"id": 1})).await.as_array().unwrap().len(), 1);
        assert_eq!(call(&worker, LIKE, like).await["message"], json!("Post unliked successfully."));
        assert_eq!(call(&worker, LIKES_GET, json!({"id": 1})).await, json!([]));
    }

    #[tokio::test]
    async fn test_capitalized_field_names_are_accepted() {
        let worker = worker_with_post().await;

        let post = call(&worker, GET_BY_ID, json!({"Id": 1})).await;
        assert_eq!(post["text"], json!("hello"));

        let like = json!({"Post_id": 1, "User_id": 7});
        assert_eq!(call(&worker, LIKE, like).await["message"], json!("Post liked successfully."));
        let likes = call(&worker, LIKES_GET, json!({"ID": 1})).await;
        assert_eq!(likes[0]["user_id"], json!(7));
    }

    #[tokio::test]
    async fn test_comments_and_lookups() {
        let worker = worker_with_post().await;

        let commented = call(&worker, COMMENT, json!({"post_id": 1, "user_id": 2, "text": "nice"})).await;
        assert_eq!(commented, json!({"success": true, "message": "Post commented successfully."}));
        let comments = call(&worker, COMMENTS_GET, json!({"id": 1})).await;
        assert_eq!(comments[0]["text"], json!("nice"));

        let post = call(&worker, GET_BY_ID, json!({"id": 1})).await;
        assert_eq!(post["text"], json!("hello"));
        assert_eq!(
            call(&worker, GET_BY_ID, json!({"id": -3})).await,
            json!({"success": false, "message": POST_NOT_FOUND})
        );
        assert_eq!(
            call(&worker, COMMENTS_GET, json!({})).await,
            json!({"success": false, "message": POST_NOT_FOUND})
        );
    }

    #[tokio::test]
    async fn test_backend_rejections_are_failure_envelopes() {
        let worker = worker_with_post().await;

        assert_eq!(
            call(&worker, CREATE, json!({"user_id": 1, "text": "  "})).await,
            json!({"success": false, "message": "Post text cannot be empty."})
        );
        assert_eq!(
            call(&worker, UPDATE, json!({"id": 99, "text": "edit"})).await,
            json!({"success": false, "message": "Post with this id does not exist."})
        );
        assert_eq!(
            call(&worker, DELETE, json!({"id": 99})).await,
            json!({"success": false, "message": "Post could not be deleted."})
        );
    }
}
