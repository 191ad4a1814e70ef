use crate::error::StorageError;
use crate::object_store::{ObjectInfo, ObjectStore, StoredObject};
use bytes::Bytes;
use futures::future::join_all;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// One configured object store backend
#[derive(Clone)]
pub struct Region {
    pub name: String,
    pub store: Arc<dyn ObjectStore>,
}

impl Region {
    pub fn new(name: impl Into<String>, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            name: name.into(),
            store,
        }
    }
}

/// Routes object I/O across regions. `regions[0]` is the local primary: all
/// writes go there and reads try it first.
#[derive(Clone)]
pub struct RegionRouter {
    regions: Arc<Vec<Region>>,
    timeout: Duration,
}

impl RegionRouter {
    pub fn new(regions: Vec<Region>, timeout: Duration) -> Result<Self, StorageError> {
        if regions.is_empty() {
            return Err(StorageError::UnknownRegion(
                "no regions configured".to_string(),
            ));
        }
        Ok(Self {
            regions: Arc::new(regions),
            timeout,
        })
    }

    pub fn primary(&self) -> &Region {
        &self.regions[0]
    }

    /// Name recorded as the upload region of new files
    pub fn primary_name(&self) -> &str {
        &self.primary().name
    }

    pub fn region_names(&self) -> Vec<&str> {
        self.regions.iter().map(|r| r.name.as_str()).collect()
    }

    fn region(&self, name: &str) -> Option<&Region> {
        self.regions.iter().find(|r| r.name == name)
    }

    async fn bounded<T, F>(&self, operation: &'static str, fut: F) -> Result<T, StorageError>
    where
        F: Future<Output = Result<T, StorageError>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                metrics::counter!("uploads.region.timeouts", "operation" => operation)
                    .increment(1);
                Err(StorageError::Timeout {
                    operation,
                    after: self.timeout,
                })
            }
        }
    }

    /// Stat an object in the primary region
    pub async fn stat_local(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>, StorageError> {
        self.bounded("stat", self.primary().store.stat(bucket, key))
            .await
    }

    /// Read an object from the primary region only
    pub async fn get_local(&self, bucket: &str, key: &str) -> Result<StoredObject, StorageError> {
        self.bounded("get", self.primary().store.get(bucket, key))
            .await
    }

    /// Write an object to the primary region only. Replication is external.
    pub async fn put_local(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.bounded("put", self.primary().store.put(bucket, key, body, content_type))
            .await
    }

    /// Read from the primary, falling back to the region the object was
    /// uploaded to when the primary fails for any reason
    #[instrument(skip(self))]
    pub async fn get_with_failover(
        &self,
        bucket: &str,
        key: &str,
        upload_region: &str,
    ) -> Result<StoredObject, StorageError> {
        let err = match self.get_local(bucket, key).await {
            Ok(object) => return Ok(object),
            Err(e) => e,
        };

        let Some(fallback) = self.fallback_for(upload_region) else {
            return Err(err);
        };

        warn!(
            error = %err,
            fallback = %fallback.name,
            "Primary region read failed, trying upload region"
        );
        metrics::counter!("uploads.region.failovers").increment(1);

        self.bounded("get", fallback.store.get(bucket, key)).await
    }

    /// Stat with the same failover rule as [`RegionRouter::get_with_failover`]
    pub async fn stat_with_failover(
        &self,
        bucket: &str,
        key: &str,
        upload_region: &str,
    ) -> Result<Option<ObjectInfo>, StorageError> {
        let err = match self.stat_local(bucket, key).await {
            Ok(info) => return Ok(info),
            Err(e) => e,
        };

        match self.fallback_for(upload_region) {
            Some(fallback) => self.bounded("stat", fallback.store.stat(bucket, key)).await,
            None => Err(err),
        }
    }

    fn fallback_for(&self, upload_region: &str) -> Option<&Region> {
        if upload_region == self.primary_name() {
            return None;
        }
        let region = self.region(upload_region);
        if region.is_none() {
            debug!(upload_region = %upload_region, "Upload region is not configured");
        }
        region
    }

    /// Delete an object from every region concurrently. Per-region failures
    /// are logged and counted; the number of failed regions is returned.
    #[instrument(skip(self))]
    pub async fn delete_everywhere(&self, bucket: &str, key: &str) -> usize {
        let deletes = self.regions.iter().map(|region| async move {
            let result = self.bounded("delete", region.store.delete(bucket, key)).await;
            (region.name.as_str(), result)
        });

        let mut failed = 0;
        for (region, result) in join_all(deletes).await {
            if let Err(e) = result {
                failed += 1;
                metrics::counter!("uploads.region.delete_failures").increment(1);
                warn!(region = %region, error = %e, "Region delete failed");
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryObjectStore;
    use async_trait::async_trait;

    fn two_regions() -> (Arc<MemoryObjectStore>, Arc<MemoryObjectStore>, RegionRouter) {
        let local = Arc::new(MemoryObjectStore::new());
        let remote = Arc::new(MemoryObjectStore::new());
        let router = RegionRouter::new(
            vec![
                Region::new("local", local.clone()),
                Region::new("remote", remote.clone()),
            ],
            Duration::from_secs(1),
        )
        .unwrap();
        (local, remote, router)
    }

    #[test]
    fn test_router_requires_a_region() {
        assert!(RegionRouter::new(Vec::new(), Duration::from_secs(1)).is_err());
    }

    #[tokio::test]
    async fn test_writes_only_go_to_primary() {
        let (local, remote, router) = two_regions();
        router
            .put_local("icons", "h", Bytes::from_static(b"x"), "image/png")
            .await
            .unwrap();
        assert!(local.contains("icons", "h"));
        assert!(!remote.contains("icons", "h"));
        assert_eq!(router.primary_name(), "local");
    }

    #[tokio::test]
    async fn test_failover_to_upload_region() {
        let (local, remote, router) = two_regions();
        remote
            .put("attachments", "h", Bytes::from_static(b"remote"), "image/png")
            .await
            .unwrap();
        local.set_failing(true);

        let object = router
            .get_with_failover("attachments", "h", "remote")
            .await
            .unwrap();
        assert_eq!(object.body, Bytes::from_static(b"remote"));
    }

    #[tokio::test]
    async fn test_no_failover_when_uploaded_locally() {
        let (local, remote, router) = two_regions();
        remote
            .put("attachments", "h", Bytes::from_static(b"remote"), "image/png")
            .await
            .unwrap();
        local.set_failing(true);

        assert!(router
            .get_with_failover("attachments", "h", "local")
            .await
            .is_err());
        assert!(router
            .get_with_failover("attachments", "h", "elsewhere")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_missing_locally_is_served_from_upload_region() {
        let (_local, remote, router) = two_regions();
        remote
            .put("attachments", "h", Bytes::from_static(b"lagging"), "image/png")
            .await
            .unwrap();

        let object = router
            .get_with_failover("attachments", "h", "remote")
            .await
            .unwrap();
        assert_eq!(object.body, Bytes::from_static(b"lagging"));
    }

    #[tokio::test]
    async fn test_delete_everywhere_tolerates_region_failure() {
        let (local, remote, router) = two_regions();
        local
            .put("icons", "h", Bytes::from_static(b"x"), "image/png")
            .await
            .unwrap();
        remote
            .put("icons", "h", Bytes::from_static(b"x"), "image/png")
            .await
            .unwrap();
        remote.set_failing(true);

        assert_eq!(router.delete_everywhere("icons", "h").await, 1);
        assert!(!local.contains("icons", "h"));
    }

    struct Stalled;

    #[async_trait]
    impl ObjectStore for Stalled {
        async fn stat(&self, _: &str, _: &str) -> Result<Option<ObjectInfo>, StorageError> {
            futures::future::pending().await
        }
        async fn get(&self, _: &str, _: &str) -> Result<StoredObject, StorageError> {
            futures::future::pending().await
        }
        async fn put(&self, _: &str, _: &str, _: Bytes, _: &str) -> Result<(), StorageError> {
            futures::future::pending().await
        }
        async fn delete(&self, _: &str, _: &str) -> Result<(), StorageError> {
            futures::future::pending().await
        }
        async fn ensure_bucket(&self, _: &str) -> Result<(), StorageError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_region_times_out() {
        let router = RegionRouter::new(
            vec![Region::new("local", Arc::new(Stalled))],
            Duration::from_secs(5),
        )
        .unwrap();

        let err = router.stat_local("icons", "h").await.unwrap_err();
        assert!(matches!(err, StorageError::Timeout { operation: "stat", .. }));
    }
}
