// src/services/memory.rs
// In-memory backends so the services can run without a database.

use async_trait::async_trait;
use base64::prelude::*;
use chrono::Utc;
use std::collections::BTreeMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::image::ImageBackend;
use super::post::{Comment, Like, LikeToggle, Post, PostBackend};
use super::user::{User, UserBackend};
use crate::worker::HandlerError;

fn rejected(message: &str) -> HandlerError {
    HandlerError::Rejected(message.to_string())
}

fn looks_like_email(email: &str) -> bool {
    match email.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.')
        }
        None => false,
    }
}

fn check_user_fields(user: &User) -> Result<(), HandlerError> {
    if user.name.trim().is_empty() || user.email.trim().is_empty() || user.password.trim().is_empty() {
        return Err(rejected("Name, email and password fields are required."));
    }
    Ok(())
}

#[derive(Default)]
struct UserTable {
    next_id: i64,
    users: BTreeMap<i64, User>,
}

#[derive(Default)]
pub struct MemoryUserStore {
    table: RwLock<UserTable>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserBackend for MemoryUserStore {
    async fn create_user(&self, mut user: User) -> Result<(), HandlerError> {
        check_user_fields(&user)?;
        let mut table = self.table.write().await;
        if table.users.values().any(|u| u.email == user.email) {
            return Err(rejected("User with this email already exists."));
        }
        if !looks_like_email(&user.email) {
            return Err(rejected("Invalid email format."));
        }

        table.next_id += 1;
        user.id = table.next_id;
        user.created_at = Utc::now();
        table.users.insert(user.id, user);
        Ok(())
    }

    async fn login(&self, email: &str, password: &str) -> Result<String, HandlerError> {
        let table = self.table.read().await;
        let user = table
            .users
            .values()
            .find(|u| u.email == email)
            .ok_or_else(|| rejected("User not found."))?;
        if user.password != password {
            return Err(rejected("Incorrect password."));
        }
        Ok(Uuid::new_v4().simple().to_string())
    }

    async fn all_users(&self) -> Vec<User> {
        self.table.read().await.users.values().cloned().collect()
    }

    async fn user_by_id(&self, id: i64) -> Option<User> {
        self.table.read().await.users.get(&id).cloned()
    }

    async fn update_user(&self, id: i64, update: User) -> Result<(), HandlerError> {
        check_user_fields(&update)?;
        let mut table = self.table.write().await;
        if table
            .users
            .values()
            .any(|u| u.email == update.email && u.id != id)
        {
            return Err(rejected("User with this email already exists."));
        }
        if !looks_like_email(&update.email) {
            return Err(rejected("Invalid email format."));
        }

        let user = table
            .users
            .get_mut(&id)
            .ok_or_else(|| rejected("User with this id does not exist."))?;
        user.name = update.name;
        user.email = update.email;
        user.password = update.password;
        user.role = update.role;
        Ok(())
    }

    async fn delete_user(&self, id: i64) -> bool {
        self.table.write().await.users.remove(&id).is_some()
    }
}

#[derive(Default)]
struct PostTable {
    next_id: i64,
    posts: BTreeMap<i64, Post>,
    likes: Vec<Like>,
    comments: Vec<Comment>,
}

#[derive(Default)]
pub struct MemoryPostStore {
    table: RwLock<PostTable>,
}

impl MemoryPostStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PostBackend for MemoryPostStore {
    async fn create_post(&self, mut post: Post) -> Result<(), HandlerError> {
        if post.text.trim().is_empty() {
            return Err(rejected("Post text cannot be empty."));
        }
        let mut table = self.table.write().await;
        table.next_id += 1;
        post.id = table.next_id;
        post.created_at = Utc::now();
        table.posts.insert(post.id, post);
        Ok(())
    }

    async fn all_posts(&self) -> Vec<Post> {
        self.table.read().await.posts.values().cloned().collect()
    }

    async fn post_by_id(&self, id: i64) -> Option<Post> {
        self.table.read().await.posts.get(&id).cloned()
    }

    async fn update_post(&self, id: i64, update: Post) -> Result<(), HandlerError> {
        if update.text.trim().is_empty() {
            return Err(rejected("Post text cannot be empty."));
        }
        let mut table = self.table.write().await;
        let post = table
            .posts
            .get_mut(&id)
            .ok_or_else(|| rejected("Post with this id does not exist."))?;
        post.text = update.text;
        post.image_url = update.image_url;
        Ok(())
    }

    async fn delete_post(&self, id: i64) -> bool {
        let mut table = self.table.write().await;
        let removed = table.posts.remove(&id).is_some();
        if removed {
            table.likes.retain(|l| l.post_id != id);
            table.comments.retain(|c| c.post_id != id);
        }
        removed
    }

    async fn toggle_like(&self, mut like: Like) -> Result<LikeToggle, HandlerError> {
        let mut table = self.table.write().await;
        if !table.posts.contains_key(&like.post_id) {
            return Err(rejected("User or Post with this ID does not exist."));
        }
        let existing = table
            .likes
            .iter()
            .position(|l| l.post_id == like.post_id && l.user_id == like.user_id);

        match existing {
            Some(index) => {
                table.likes.remove(index);
                Ok(LikeToggle::Unliked)
            }
            None => {
                like.id = table.likes.iter().map(|l| l.id).max().unwrap_or(0) + 1;
                like.created_at = Utc::now();
                table.likes.push(like);
                Ok(LikeToggle::Liked)
            }
        }
    }

    async fn comment(&self, mut comment: Comment) -> Result<(), HandlerError> {
        let mut table = self.table.write().await;
        if !table.posts.contains_key(&comment.post_id) {
            return Err(rejected("User or Post with this ID does not exist."));
        }
        comment.id = table.comments.iter().map(|c| c.id).max().unwrap_or(0) + 1;
        comment.created_at = Utc::now();
        table.comments.push(comment);
        Ok(())
    }

    async fn likes(&self, post_id: i64) -> Vec<Like> {
        let table = self.table.read().await;
        table.likes.iter().filter(|l| l.post_id == post_id).cloned().collect()
    }

    async fn comments(&self, post_id: i64) -> Vec<Comment> {
        let table = self.table.read().await;
        table
            .comments
            .iter()
            .filter(|c| c.post_id == post_id)
            .cloned()
            .collect()
    }
}

/// Accepts any well-formed base64 image and hands out a URL for it. The
/// bytes are not kept.
pub struct MemoryImageStore {
    base_url: String,
}

impl Default for MemoryImageStore {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5149/images".to_string(),
        }
    }
}

impl MemoryImageStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

#[async_trait]
impl ImageBackend for MemoryImageStore {
    async fn store_image(&self, post_id: i64, image_data: &str) -> Result<String, HandlerError> {
        let bytes = match BASE64_STANDARD.decode(image_data.trim()) {
            Ok(bytes) if !bytes.is_empty() => bytes,
            _ => {
                return Err(HandlerError::InvalidRequest(
                    "Image data is not valid base64.".to_string(),
                ))
            }
        };
        tracing::debug!(post_id, bytes = bytes.len(), "Image accepted");
        Ok(format!("{}/{}.jpg", self.base_url, Uuid::new_v4()))
    }
}
