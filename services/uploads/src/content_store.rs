//! Content-addressed file storage.
//!
//! Physical objects are stored once per `(hash, bucket)` under the content
//! hash; every upload gets its own catalog row pointing at that object. The
//! object is released when the last row referencing it is deleted.

use crate::blocklist::BlocklistGuard;
use crate::catalog::Catalog;
use crate::config::{LimitsConfig, StorageConfig};
use crate::error::{AuthError, Result, StorageError, UploadsError};
use crate::files::{
    content_hash, generate_id, is_supported_image, Bucket, File, MAX_ID_CHARS, MAX_MIME_CHARS,
    MAX_UPLOADER_CHARS,
};
use crate::moderation::BanNotifier;
use crate::object_store::StoredObject;
use crate::preview::PreviewCache;
use crate::regions::RegionRouter;
use crate::tasks::BackgroundTasks;
use crate::transcoder::{fit_within, optimize_blocking, probe_blocking, MediaTranscoder};
use bytes::Bytes;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// An upload that passed authorization
#[derive(Debug, Clone)]
pub struct NewFile {
    pub bucket: Bucket,
    pub bytes: Bytes,
    /// Already cleaned filename
    pub filename: String,
    pub mime: String,
    pub uploaded_by: String,
    /// Identifier reserved by the token issuer, if any
    pub id: Option<String>,
}

pub struct ContentStore {
    catalog: Arc<dyn Catalog>,
    router: RegionRouter,
    blocklist: BlocklistGuard,
    transcoder: Arc<dyn MediaTranscoder>,
    previews: Arc<PreviewCache>,
    notifier: Arc<dyn BanNotifier>,
    tasks: BackgroundTasks,
    limits: LimitsConfig,
    data_exports_bucket: String,
    transcode_timeout: Duration,
}

impl ContentStore {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        router: RegionRouter,
        transcoder: Arc<dyn MediaTranscoder>,
        notifier: Arc<dyn BanNotifier>,
        tasks: BackgroundTasks,
        storage: &StorageConfig,
        limits: LimitsConfig,
    ) -> Self {
        let previews = Arc::new(PreviewCache::new(router.clone(), transcoder.clone(), storage));
        Self {
            blocklist: BlocklistGuard::new(catalog.clone()),
            catalog,
            router,
            transcoder,
            previews,
            notifier,
            tasks,
            limits,
            data_exports_bucket: storage.data_exports_bucket.clone(),
            transcode_timeout: storage.transcode_timeout(),
        }
    }

    pub fn previews(&self) -> &PreviewCache {
        &self.previews
    }

    pub fn limits(&self) -> &LimitsConfig {
        &self.limits
    }

    /// Store an upload and record a new unclaimed file for it
    #[instrument(
        skip(self, new),
        fields(bucket = %new.bucket, size_bytes = new.bytes.len(), uploaded_by = %new.uploaded_by)
    )]
    pub async fn create_file(&self, new: NewFile) -> Result<File> {
        let started = Instant::now();

        let max = self.limits.max_bytes(new.bucket);
        let size = new.bytes.len() as u64;
        if size > max {
            return Err(UploadsError::TooLarge { size, max });
        }

        check_columns(&new)?;

        let hash = content_hash(&new.bytes, &new.mime);

        let status = self.blocklist.check(&hash).await?;
        if status.blocked {
            metrics::counter!("uploads.files.blocked").increment(1);
            warn!(hash = %hash, auto_ban = status.auto_ban, "Rejected blocked upload");
            if status.auto_ban {
                let notifier = self.notifier.clone();
                let user = new.uploaded_by.clone();
                self.tasks.spawn("ban_notify", async move {
                    notifier.ban_user(&user, &hash).await
                });
            }
            return Err(UploadsError::Blocked);
        }

        let max_dimension = new.bucket.max_dimension();
        if max_dimension.is_some() && !is_supported_image(&new.mime) {
            return Err(UploadsError::UnsupportedMediaType(new.mime));
        }

        let id = new
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(generate_id);
        let bucket = new.bucket.as_str();

        // Upload ids come from tokens, so a second use of one is a replay
        if self.catalog.get_file(&id).await?.is_some() {
            warn!(id = %id, "Rejected upload for an id already in use");
            return Err(UploadsError::AlreadyClaimed);
        }

        let fresh_object = self.router.stat_local(bucket, &hash).await?.is_none();
        if !fresh_object {
            metrics::counter!("uploads.files.deduplicated").increment(1);
            debug!(hash = %hash, "Object already stored, adding reference");
        } else {
            let body = match max_dimension {
                Some(max) => {
                    optimize_blocking(
                        self.transcoder.clone(),
                        new.bytes.clone(),
                        new.mime.clone(),
                        max,
                        self.transcode_timeout,
                    )
                    .await?
                    .bytes
                }
                None => new.bytes.clone(),
            };
            self.router.put_local(bucket, &hash, body, &new.mime).await?;
        }

        let (width, height) = self.dimensions(&new.bytes, &new.mime, max_dimension).await;

        let file = File {
            id,
            hash,
            bucket: bucket.to_string(),
            mime: new.mime,
            filename: new.filename,
            width,
            height,
            upload_region: self.router.primary_name().to_string(),
            uploaded_by: new.uploaded_by,
            uploaded_at: Utc::now().timestamp(),
            claimed: false,
            used_by: None,
        };
        if let Err(e) = self.catalog.insert_file(&file).await {
            return Err(self.abandon_insert(&file, fresh_object, e.into()).await);
        }

        if self.previews.is_eligible(&file) {
            let previews = self.previews.clone();
            let warm = file.clone();
            self.tasks
                .spawn("preview_warm", async move { previews.warm(&warm).await });
        }

        metrics::counter!("uploads.files.created", "bucket" => bucket).increment(1);
        metrics::histogram!("uploads.create.duration_seconds").record(started.elapsed().as_secs_f64());
        info!(id = %file.id, hash = %file.hash, "File created");

        Ok(file)
    }

    /// Undo a write whose catalog row never landed. The object is released
    /// only when it was written by this call and nothing else references it.
    async fn abandon_insert(&self, file: &File, fresh_object: bool, err: UploadsError) -> UploadsError {
        if fresh_object {
            match self.catalog.count_references(&file.hash, &file.bucket).await {
                Ok(0) => {
                    let _ = self.router.delete_everywhere(&file.bucket, &file.hash).await;
                    info!(bucket = %file.bucket, hash = %file.hash, "Released object after failed insert");
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(hash = %file.hash, error = %e, "Could not count references, leaving object in place");
                }
            }
        }

        // Lost a race with another upload using the same id
        match self.catalog.get_file(&file.id).await {
            Ok(Some(_)) => UploadsError::AlreadyClaimed,
            _ => err,
        }
    }

    /// Header-probed dimensions of the stored rendition, `(0, 0)` when unknown
    async fn dimensions(&self, bytes: &Bytes, mime: &str, max_dimension: Option<u32>) -> (i32, i32) {
        if !is_supported_image(mime) {
            return (0, 0);
        }

        match probe_blocking(self.transcoder.clone(), bytes.clone(), self.transcode_timeout).await {
            Ok(dims) => {
                let (width, height) = match max_dimension {
                    Some(max) => fit_within(dims.width, dims.height, max),
                    None => (dims.width, dims.height),
                };
                (
                    i32::try_from(width).unwrap_or(i32::MAX),
                    i32::try_from(height).unwrap_or(i32::MAX),
                )
            }
            Err(e) => {
                debug!(error = %e, "Could not probe dimensions");
                (0, 0)
            }
        }
    }

    pub async fn get_file(&self, id: &str) -> Result<File> {
        self.catalog
            .get_file(id)
            .await?
            .ok_or(UploadsError::NotFound)
    }

    /// Read the original object, failing over to the upload region
    pub async fn get_object(&self, file: &File) -> Result<StoredObject> {
        self.router
            .get_with_failover(&file.bucket, &file.hash, &file.upload_region)
            .await
            .map_err(not_found_or_unavailable)
    }

    /// Read the preview rendition, or the original when there is none
    pub async fn get_preview_object(&self, file: &File) -> Result<StoredObject> {
        self.previews
            .get_preview_object(file)
            .await
            .map_err(not_found_or_unavailable)
    }

    /// Size of the stored object in bytes
    pub async fn object_size(&self, file: &File) -> Result<u64> {
        self.router
            .stat_with_failover(&file.bucket, &file.hash, &file.upload_region)
            .await?
            .map(|info| info.size)
            .ok_or(UploadsError::NotFound)
    }

    /// Mark a file as attached to a durable resource
    #[instrument(skip(self, file), fields(id = %file.id))]
    pub async fn claim(&self, file: &File) -> Result<()> {
        if file.claimed {
            return Err(UploadsError::AlreadyClaimed);
        }

        if self.catalog.claim_file(&file.id).await? {
            metrics::counter!("uploads.files.claimed").increment(1);
            return Ok(());
        }

        // Nothing changed: either someone claimed it first or it is gone
        match self.catalog.get_file(&file.id).await? {
            Some(_) => Err(UploadsError::AlreadyClaimed),
            None => Err(UploadsError::NotFound),
        }
    }

    /// Delete a file, releasing its object when no other file references it.
    /// Returns false when the file was already gone.
    pub async fn delete(&self, file: &File) -> Result<bool> {
        self.remove(file, false).await
    }

    /// Delete a file only if it is still unclaimed
    pub async fn delete_if_unclaimed(&self, file: &File) -> Result<bool> {
        self.remove(file, true).await
    }

    #[instrument(skip(self, file), fields(id = %file.id, hash = %file.hash))]
    async fn remove(&self, file: &File, only_unclaimed: bool) -> Result<bool> {
        let Some(remaining) = self.catalog.delete_file(&file.id, only_unclaimed).await? else {
            return Ok(false);
        };
        metrics::counter!("uploads.files.deleted").increment(1);

        if remaining == 0 {
            self.release_object(file).await;
        } else {
            debug!(remaining = remaining, "Object still referenced");
        }
        Ok(true)
    }

    async fn release_object(&self, file: &File) {
        let primary = self.router.delete_everywhere(&file.bucket, &file.hash);
        if file.bucket == Bucket::Attachments.as_str() {
            let preview = self
                .router
                .delete_everywhere(self.previews.bucket(), &file.hash);
            futures::join!(primary, preview);
        } else {
            primary.await;
        }

        metrics::counter!("uploads.objects.deleted").increment(1);
        info!(bucket = %file.bucket, hash = %file.hash, "Object released");
    }

    /// Mark every file of a user unclaimed, leaving deletion to the sweeper
    pub async fn unclaim_uploader(&self, uploaded_by: &str) -> Result<u64> {
        Ok(self.catalog.unclaim_by_uploader(uploaded_by).await?)
    }

    /// Record the resource an attachment is used by
    pub async fn mark_used(&self, id: &str, resource: &str) -> Result<u64> {
        Ok(self.catalog.set_used_by(id, resource).await?)
    }

    pub async fn clear_used_by_id(&self, id: &str) -> Result<u64> {
        Ok(self.catalog.clear_used_by_id(id).await?)
    }

    pub async fn clear_used_by_uploader(&self, uploaded_by: &str) -> Result<u64> {
        Ok(self.catalog.clear_used_by_uploader(uploaded_by).await?)
    }

    /// Fetch a data export archive from the primary region
    pub async fn get_data_export(&self, id: &str) -> Result<StoredObject> {
        self.router
            .get_local(&self.data_exports_bucket, id)
            .await
            .map_err(not_found_or_unavailable)
    }

    pub async fn ping(&self) -> Result<()> {
        Ok(self.catalog.ping().await?)
    }
}

/// Reject values the catalog columns cannot hold, before anything is written
fn check_columns(new: &NewFile) -> Result<()> {
    let too_long = |value: &str, max: usize| value.chars().count() > max;

    if new.id.as_deref().is_some_and(|id| too_long(id, MAX_ID_CHARS)) {
        return Err(AuthError::Malformed("upload id too long".into()).into());
    }
    if too_long(&new.uploaded_by, MAX_UPLOADER_CHARS) {
        return Err(AuthError::Malformed("uploader too long".into()).into());
    }
    if too_long(&new.mime, MAX_MIME_CHARS) {
        return Err(UploadsError::UnsupportedMediaType(new.mime.clone()));
    }
    Ok(())
}

fn not_found_or_unavailable(e: StorageError) -> UploadsError {
    match e {
        StorageError::ObjectNotFound { .. } => UploadsError::NotFound,
        other => UploadsError::StorageUnavailable(other),
    }
}

#[cfg(test)]
pub(crate) mod harness {
    use super::*;
    use crate::memory::{MemoryCatalog, MemoryObjectStore};
    use crate::moderation::MockBanNotifier;
    use crate::regions::Region;
    use crate::transcoder::ImageTranscoder;

    pub struct Harness {
        pub catalog: Arc<MemoryCatalog>,
        pub local: Arc<MemoryObjectStore>,
        pub remote: Arc<MemoryObjectStore>,
        pub tasks: BackgroundTasks,
        pub store: Arc<ContentStore>,
    }

    pub fn with_notifier(notifier: MockBanNotifier) -> Harness {
        let catalog = Arc::new(MemoryCatalog::new());
        let local = Arc::new(MemoryObjectStore::new());
        let remote = Arc::new(MemoryObjectStore::new());
        let router = RegionRouter::new(
            vec![
                Region::new("local", local.clone()),
                Region::new("remote", remote.clone()),
            ],
            Duration::from_secs(5),
        )
        .unwrap();
        let tasks = BackgroundTasks::new();
        let store = Arc::new(ContentStore::new(
            catalog.clone(),
            router,
            Arc::new(ImageTranscoder::new()),
            Arc::new(notifier),
            tasks.clone(),
            &StorageConfig::default(),
            LimitsConfig::default(),
        ));

        Harness {
            catalog,
            local,
            remote,
            tasks,
            store,
        }
    }

    pub fn harness() -> Harness {
        let mut notifier = MockBanNotifier::new();
        notifier.expect_ban_user().never();
        with_notifier(notifier)
    }

    pub fn upload(bucket: Bucket, bytes: &[u8], mime: &str, user: &str) -> NewFile {
        NewFile {
            bucket,
            bytes: Bytes::copy_from_slice(bytes),
            filename: "upload.bin".to_string(),
            mime: mime.to_string(),
            uploaded_by: user.to_string(),
            id: None,
        }
    }
}
