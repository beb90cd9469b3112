use std::collections::HashMap;

use async_trait::async_trait;

mod optimize;

pub use optimize::{
    ImageOptimizer, MediaError, OptimizeOutcome, SkipReason, JPEG_QUALITY, MAX_EDGE,
    OPTIMIZED_MARKER_KEY, OPTIMIZED_MARKER_VALUE, PRODUCT_IMAGE_PREFIX,
};

/// Descriptor handed to the transform job when an object lands in storage.
#[derive(Debug, Clone)]
pub struct UploadEvent {
    pub bucket: String,
    pub path: String,
    pub content_type: Option<String>,
    pub custom_metadata: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct StoredMediaObject {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
    pub custom_metadata: HashMap<String, String>,
}

/// Backend the optimize job reads from and writes back to. Implemented by
/// the storage crate; tests substitute an in-memory store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn fetch(&self, bucket: &str, path: &str) -> anyhow::Result<Option<StoredMediaObject>>;

    /// Overwrites the object at `{bucket, path}` in a single write carrying
    /// bytes, content type, and the full custom metadata map. Readers must
    /// never observe the bytes without the metadata or vice versa.
    async fn publish(
        &self,
        bucket: &str,
        path: &str,
        bytes: Vec<u8>,
        content_type: Option<String>,
        custom_metadata: HashMap<String, String>,
    ) -> anyhow::Result<()>;
}
