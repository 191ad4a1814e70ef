use crate::config::StorageConfig;
use crate::error::StorageError;
use crate::files::{is_supported_image, Bucket, File};
use crate::object_store::StoredObject;
use crate::regions::RegionRouter;
use crate::transcoder::{optimize_blocking, MediaTranscoder};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Cache of bounded renditions of attachment images, keyed by content hash
pub struct PreviewCache {
    router: RegionRouter,
    transcoder: Arc<dyn MediaTranscoder>,
    bucket: String,
    max_dimension: u32,
    max_source_bytes: u64,
    transcode_timeout: Duration,
}

impl PreviewCache {
    pub fn new(
        router: RegionRouter,
        transcoder: Arc<dyn MediaTranscoder>,
        config: &StorageConfig,
    ) -> Self {
        Self {
            router,
            transcoder,
            bucket: config.previews_bucket.clone(),
            max_dimension: config.preview_max_dimension,
            max_source_bytes: config.preview_max_source_bytes,
            transcode_timeout: config.transcode_timeout(),
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Whether a file can have a preview at all
    pub fn is_eligible(&self, file: &File) -> bool {
        file.bucket == Bucket::Attachments.as_str() && is_supported_image(&file.mime)
    }

    /// Serve the preview of a file, or the original whenever a preview cannot
    /// be produced. Only a failure to read the original is an error.
    #[instrument(skip(self, file), fields(id = %file.id, hash = %file.hash))]
    pub async fn get_preview_object(&self, file: &File) -> Result<StoredObject, StorageError> {
        if !self.is_eligible(file) {
            return self.original(file).await;
        }

        if let Some(preview) = self.cached(file).await {
            metrics::counter!("uploads.preview.hits").increment(1);
            return Ok(preview);
        }
        metrics::counter!("uploads.preview.misses").increment(1);

        let original = self.original(file).await?;
        if !self.fill(file, &original).await {
            return Ok(original);
        }

        // The cache was just filled, so this read is the hit path
        Ok(self.cached(file).await.unwrap_or(original))
    }

    /// Compute and store the preview ahead of the first request
    pub async fn warm(&self, file: &File) -> Result<(), StorageError> {
        if !self.is_eligible(file) || self.cached(file).await.is_some() {
            return Ok(());
        }

        let original = self.original(file).await?;
        self.fill(file, &original).await;
        Ok(())
    }

    async fn original(&self, file: &File) -> Result<StoredObject, StorageError> {
        self.router
            .get_with_failover(&file.bucket, &file.hash, &file.upload_region)
            .await
    }

    async fn cached(&self, file: &File) -> Option<StoredObject> {
        match self.router.get_local(&self.bucket, &file.hash).await {
            Ok(object) => Some(object),
            Err(StorageError::ObjectNotFound { .. }) => None,
            Err(e) => {
                warn!(error = %e, "Preview cache read failed");
                None
            }
        }
    }

    /// Transcode and store a preview. Returns false when nothing was stored.
    async fn fill(&self, file: &File, original: &StoredObject) -> bool {
        if original.body.len() as u64 > self.max_source_bytes {
            debug!(size = original.body.len(), "Source too large for a preview");
            return false;
        }

        let transcoded = match optimize_blocking(
            self.transcoder.clone(),
            original.body.clone(),
            file.mime.clone(),
            self.max_dimension,
            self.transcode_timeout,
        )
        .await
        {
            Ok(transcoded) => transcoded,
            Err(e) => {
                warn!(error = %e, "Preview transcode failed, serving original");
                return false;
            }
        };

        // Never cache a preview larger than its source
        let body = if transcoded.bytes.len() >= original.body.len() {
            original.body.clone()
        } else {
            transcoded.bytes
        };

        match self
            .router
            .put_local(&self.bucket, &file.hash, body, &file.mime)
            .await
        {
            Ok(()) => {
                metrics::counter!("uploads.preview.stored").increment(1);
                true
            }
            Err(e) => {
                warn!(error = %e, "Preview store failed, serving original");
                false
            }
        }
    }
}
