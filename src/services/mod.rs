// src/services/mod.rs
// Message contracts of the domain services: routing keys, request shapes and
// the wiring from each key to a backend call.

pub mod image;
pub mod memory;
pub mod post;
pub mod user;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use crate::worker::{RequestShape, WorkerBuilder};

pub use memory::{MemoryImageStore, MemoryPostStore, MemoryUserStore};

/// Body of requests that only name an entity, e.g. `{"id": 3}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdRequest {
    #[serde(alias = "Id", alias = "ID", default)]
    pub id: i64,
}

impl RequestShape for IdRequest {
    fn validate(&self) -> bool {
        self.id > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    User,
    Post,
    Image,
}

impl Service {
    pub const ALL: [Service; 3] = [Service::User, Service::Post, Service::Image];

    pub fn name(&self) -> &'static str {
        match self {
            Service::User => "user",
            Service::Post => "post",
            Service::Image => "image",
        }
    }

    pub fn queue(&self) -> &'static str {
        match self {
            Service::User => user::QUEUE,
            Service::Post => post::QUEUE,
            Service::Image => image::QUEUE,
        }
    }

    pub fn response_queue(&self) -> &'static str {
        match self {
            Service::User => user::RESPONSE_QUEUE,
            Service::Post => post::RESPONSE_QUEUE,
            Service::Image => image::RESPONSE_QUEUE,
        }
    }

    pub fn routing_keys(&self) -> &'static [&'static str] {
        match self {
            Service::User => &user::ROUTING_KEYS,
            Service::Post => &post::ROUTING_KEYS,
            Service::Image => &image::ROUTING_KEYS,
        }
    }

    /// Worker backed by an in-memory store, for demos and tests.
    pub fn demo_worker(&self) -> WorkerBuilder {
        match self {
            Service::User => user::worker(Arc::new(MemoryUserStore::new())),
            Service::Post => post::worker(Arc::new(MemoryPostStore::new())),
            Service::Image => image::worker(Arc::new(MemoryImageStore::new())),
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Service {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Service::ALL
            .into_iter()
            .find(|service| service.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown service '{}' (expected user, post or image)", s))
    }
}
