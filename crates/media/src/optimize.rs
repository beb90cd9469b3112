use std::{
    io::Cursor,
    path::{Path, PathBuf},
};

use image::{GenericImageView, ImageOutputFormat};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{ObjectStore, UploadEvent};

/// Longest edge after normalization. Images already within the bound are
/// never upscaled.
pub const MAX_EDGE: u32 = 1080;
pub const JPEG_QUALITY: u8 = 80;
pub const OPTIMIZED_MARKER_KEY: &str = "optimized";
pub const OPTIMIZED_MARKER_VALUE: &str = "true";
/// Only objects under this prefix are normalized.
pub const PRODUCT_IMAGE_PREFIX: &str = "products/";

#[derive(Debug, Error)]
pub enum MediaError {
    #[error("object {bucket}/{path} not found")]
    Missing { bucket: String, path: String },
    #[error("failed to fetch object: {0}")]
    Fetch(#[source] anyhow::Error),
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),
    #[error("failed to publish transformed object: {0}")]
    Publish(#[source] anyhow::Error),
    #[error("scratch file io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("transform task aborted: {0}")]
    Task(#[from] tokio::task::JoinError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotAnImage,
    OutsidePrefix,
    AlreadyOptimized,
}

impl SkipReason {
    fn as_str(&self) -> &'static str {
        match self {
            SkipReason::NotAnImage => "not an image",
            SkipReason::OutsidePrefix => "outside product image prefix",
            SkipReason::AlreadyOptimized => "already optimized",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimizeOutcome {
    Skipped(SkipReason),
    Optimized { width: u32, height: u32 },
    Failed,
}

/// One-shot normalization of freshly uploaded product images: bound the
/// longest edge, re-encode as JPEG, mark the object so a duplicate delivery
/// is a no-op.
///
/// Each invocation is isolated; scratch files carry a per-invocation suffix
/// so concurrent deliveries never collide.
pub struct ImageOptimizer {
    scratch_dir: PathBuf,
}

impl Default for ImageOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageOptimizer {
    pub fn new() -> Self {
        Self {
            scratch_dir: std::env::temp_dir(),
        }
    }

    pub fn with_scratch_dir(scratch_dir: impl Into<PathBuf>) -> Self {
        Self {
            scratch_dir: scratch_dir.into(),
        }
    }

    /// Gate for the whole job: image content type, product prefix, no marker.
    pub fn should_process(event: &UploadEvent) -> Result<(), SkipReason> {
        let is_image = event
            .content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("image/"));
        if !is_image {
            return Err(SkipReason::NotAnImage);
        }
        if !event.path.starts_with(PRODUCT_IMAGE_PREFIX) {
            return Err(SkipReason::OutsidePrefix);
        }
        if event
            .custom_metadata
            .get(OPTIMIZED_MARKER_KEY)
            .is_some_and(|v| v == OPTIMIZED_MARKER_VALUE)
        {
            return Err(SkipReason::AlreadyOptimized);
        }
        Ok(())
    }

    /// Runs the job to completion. Never re-raises: failures are logged and
    /// reported in the outcome so the caller's runtime stays clean.
    pub async fn process(&self, store: &dyn ObjectStore, event: &UploadEvent) -> OptimizeOutcome {
        if let Err(reason) = Self::should_process(event) {
            debug!(
                bucket = %event.bucket,
                path = %event.path,
                reason = reason.as_str(),
                "media: skipping upload"
            );
            return OptimizeOutcome::Skipped(reason);
        }

        match self.optimize(store, event).await {
            Ok((width, height)) => {
                info!(
                    bucket = %event.bucket,
                    path = %event.path,
                    width,
                    height,
                    "media: image normalized"
                );
                OptimizeOutcome::Optimized { width, height }
            }
            Err(error) => {
                warn!(
                    bucket = %event.bucket,
                    path = %event.path,
                    %error,
                    "media: optimize failed"
                );
                OptimizeOutcome::Failed
            }
        }
    }

    async fn optimize(
        &self,
        store: &dyn ObjectStore,
        event: &UploadEvent,
    ) -> Result<(u32, u32), MediaError> {
        let scratch = self.scratch_path(&event.path);
        let result = self.optimize_via_scratch(store, event, &scratch).await;

        // The scratch copy goes away on every exit path.
        match tokio::fs::remove_file(&scratch).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => debug!(scratch = %scratch.display(), %err, "media: scratch cleanup failed"),
        }

        result
    }

    async fn optimize_via_scratch(
        &self,
        store: &dyn ObjectStore,
        event: &UploadEvent,
        scratch: &Path,
    ) -> Result<(u32, u32), MediaError> {
        let object = store
            .fetch(&event.bucket, &event.path)
            .await
            .map_err(MediaError::Fetch)?
            .ok_or_else(|| MediaError::Missing {
                bucket: event.bucket.clone(),
                path: event.path.clone(),
            })?;

        tokio::fs::write(scratch, &object.bytes).await?;

        let scratch_path = scratch.to_path_buf();
        let (bytes, width, height) =
            tokio::task::spawn_blocking(move || transcode(&scratch_path)).await??;

        let mut metadata = object.custom_metadata;
        metadata.insert(
            OPTIMIZED_MARKER_KEY.to_string(),
            OPTIMIZED_MARKER_VALUE.to_string(),
        );

        store
            .publish(
                &event.bucket,
                &event.path,
                bytes,
                object.content_type,
                metadata,
            )
            .await
            .map_err(MediaError::Publish)?;

        Ok((width, height))
    }

    fn scratch_path(&self, object_path: &str) -> PathBuf {
        let base = Path::new(object_path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        self.scratch_dir
            .join(format!("{base}.{}", Uuid::new_v4().simple()))
    }
}

/// Decode from the scratch file, shrink so the longest edge fits
/// [`MAX_EDGE`], and re-encode at [`JPEG_QUALITY`].
fn transcode(scratch: &Path) -> Result<(Vec<u8>, u32, u32), MediaError> {
    let decoded = image::open(scratch).map_err(MediaError::Decode)?;

    let (width, height) = decoded.dimensions();
    let resized = if width.max(height) > MAX_EDGE {
        // Triangle keeps product shots free of the ringing sharper filters
        // put around text and hard edges.
        decoded.resize(MAX_EDGE, MAX_EDGE, image::imageops::FilterType::Triangle)
    } else {
        decoded
    };

    let (out_width, out_height) = resized.dimensions();
    let mut encoded = Vec::new();
    resized
        .write_to(
            &mut Cursor::new(&mut encoded),
            ImageOutputFormat::Jpeg(JPEG_QUALITY),
        )
        .map_err(MediaError::Encode)?;

    Ok((encoded, out_width, out_height))
}

#[cfg(test)]
#[path = "tests/optimize_tests.rs"]
mod tests;
