use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::message::Reply;
use crate::worker::{typed, HandlerError, RequestShape, WorkerBuilder};

pub const QUEUE: &str = "image_service";
pub const RESPONSE_QUEUE: &str = "image_responses";

pub const PROCESS: &str = "image.process";

pub const ROUTING_KEYS: [&str; 1] = [PROCESS];

/// Base64 image attached to a post. Field names are the ones callers
/// already send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRequest {
    #[serde(rename = "PostId", alias = "post_id", alias = "postId", default)]
    pub post_id: i64,
    #[serde(rename = "ImageData", alias = "image_data", alias = "imageData", default)]
    pub image_data: Option<String>,
}

impl RequestShape for ImageRequest {
    fn validate(&self) -> bool {
        self.image_data.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageProcessed {
    pub success: bool,
    #[serde(rename = "ImageUrl")]
    pub image_url: String,
    #[serde(rename = "PostId")]
    pub post_id: i64,
}

#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Stores the decoded image and returns the URL it is served from.
    async fn store_image(&self, post_id: i64, image_data: &str) -> Result<String, HandlerError>;
}

pub fn worker(backend: Arc<dyn ImageBackend>) -> WorkerBuilder {
    WorkerBuilder::new("image", QUEUE).route(
        PROCESS,
        typed("Image processing request was null.", move |req: ImageRequest| {
            let backend = backend.clone();
            async move {
                let data = req.image_data.unwrap_or_default();
                backend
                    .store_image(req.post_id, &data)
                    .await
                    .map(|image_url| {
                        Reply::data(&ImageProcessed {
                            success: !image_url.is_empty(),
                            image_url,
                            post_id: req.post_id,
                        })
                    })
            }
        }),
    )
}
