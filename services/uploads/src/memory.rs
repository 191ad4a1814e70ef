//! In-memory catalog and object store.
//!
//! Both implement the same traits as the Postgres and S3 backends and can be
//! told to fail every call, which is how region failover and degraded-preview
//! paths are exercised without infrastructure.

use crate::catalog::Catalog;
use crate::error::StorageError;
use crate::files::File;
use crate::object_store::{ObjectInfo, ObjectStore, StoredObject};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn injected() -> StorageError {
    StorageError::ObjectStore("injected failure".to_string())
}

/// Object store kept in a map keyed by `(bucket, key)`
#[derive(Default)]
pub struct MemoryObjectStore {
    objects: Mutex<HashMap<(String, String), StoredObject>>,
    failing: AtomicBool,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Seed an object carrying user metadata
    pub fn insert_with_metadata(
        &self,
        bucket: &str,
        key: &str,
        body: impl Into<Bytes>,
        content_type: &str,
        metadata: HashMap<String, String>,
    ) {
        let body = body.into();
        self.objects.lock().insert(
            (bucket.to_string(), key.to_string()),
            StoredObject {
                info: ObjectInfo {
                    content_type: content_type.to_string(),
                    size: body.len() as u64,
                    metadata,
                },
                body,
            },
        );
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.objects
            .lock()
            .contains_key(&(bucket.to_string(), key.to_string()))
    }

    /// Number of objects held in a bucket
    pub fn object_count(&self, bucket: &str) -> usize {
        self.objects
            .lock()
            .keys()
            .filter(|(b, _)| b == bucket)
            .count()
    }

    /// Number of successful puts so far
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    fn check(&self) -> Result<(), StorageError> {
        if self.failing.load(Ordering::SeqCst) {
            Err(injected())
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn stat(&self, bucket: &str, key: &str) -> Result<Option<ObjectInfo>, StorageError> {
        self.check()?;
        Ok(self
            .objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .map(|o| o.info.clone()))
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<StoredObject, StorageError> {
        self.check()?;
        self.objects
            .lock()
            .get(&(bucket.to_string(), key.to_string()))
            .cloned()
            .ok_or_else(|| StorageError::ObjectNotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<(), StorageError> {
        self.check()?;
        self.insert_with_metadata(bucket, key, body, content_type, HashMap::new());
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> Result<(), StorageError> {
        self.check()?;
        self.objects
            .lock()
            .remove(&(bucket.to_string(), key.to_string()));
        Ok(())
    }

    async fn ensure_bucket(&self, _bucket: &str) -> Result<(), StorageError> {
        self.check()
    }
}

#[derive(Default)]
struct CatalogState {
    files: HashMap<String, File>,
    blocked: HashMap<String, bool>,
}

/// Catalog kept behind one lock, so every call is a single consistent unit
#[derive(Default)]
pub struct MemoryCatalog {
    state: Mutex<CatalogState>,
    failing: AtomicBool,
    failing_inserts: AtomicBool,
    fail_next: AtomicUsize,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail only `insert_file`, leaving reads and deletes working
    pub fn set_failing_inserts(&self, failing: bool) {
        self.failing_inserts.store(failing, Ordering::SeqCst);
    }

    /// Fail the next `calls` catalog calls, then recover
    pub fn fail_next(&self, calls: usize) {
        self.fail_next.store(calls, Ordering::SeqCst);
    }

    /// Add a hash to the blocklist
    pub fn block(&self, hash: &str, auto_ban: bool) {
        self.state.lock().blocked.insert(hash.to_string(), auto_ban);
    }

    pub fn file_count(&self) -> usize {
        self.state.lock().files.len()
    }

    /// Rows sharing a `(hash, bucket)`
    pub fn reference_count(&self, hash: &str, bucket: &str) -> usize {
        self.state
            .lock()
            .files
            .values()
            .filter(|f| f.hash == hash && f.bucket == bucket)
            .count()
    }

    fn check(&self) -> Result<(), StorageError> {
        let transient = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient || self.failing.load(Ordering::SeqCst) {
            Err(StorageError::Catalog("injected failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn update_where<F, U>(&self, filter: F, update: U) -> Result<u64, StorageError>
    where
        F: Fn(&File) -> bool,
        U: Fn(&mut File),
    {
        self.check()?;
        let mut state = self.state.lock();
        let mut changed = 0;
        for file in state.files.values_mut().filter(|f| filter(f)) {
            update(file);
            changed += 1;
        }
        Ok(changed)
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn insert_file(&self, file: &File) -> Result<(), StorageError> {
        self.check()?;
        if self.failing_inserts.load(Ordering::SeqCst) {
            return Err(StorageError::Catalog("injected insert failure".to_string()));
        }
        let mut state = self.state.lock();
        if state.files.contains_key(&file.id) {
            return Err(StorageError::Catalog(format!(
                "duplicate key value violates unique constraint: {}",
                file.id
            )));
        }
        state.files.insert(file.id.clone(), file.clone());
        Ok(())
    }

    async fn get_file(&self, id: &str) -> Result<Option<File>, StorageError> {
        self.check()?;
        Ok(self.state.lock().files.get(id).cloned())
    }

    async fn claim_file(&self, id: &str) -> Result<bool, StorageError> {
        self.check()?;
        let mut state = self.state.lock();
        match state.files.get_mut(id) {
            Some(file) if !file.claimed => {
                file.claimed = true;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_file(&self, id: &str, only_unclaimed: bool) -> Result<Option<i64>, StorageError> {
        self.check()?;
        let mut state = self.state.lock();
        let removable = state
            .files
            .get(id)
            .map(|f| !only_unclaimed || !f.claimed)
            .unwrap_or(false);
        if !removable {
            return Ok(None);
        }

        let Some(removed) = state.files.remove(id) else {
            return Ok(None);
        };
        let remaining = state
            .files
            .values()
            .filter(|f| f.hash == removed.hash && f.bucket == removed.bucket)
            .count();
        Ok(Some(remaining as i64))
    }

    async fn count_references(&self, hash: &str, bucket: &str) -> Result<i64, StorageError> {
        self.check()?;
        Ok(self.reference_count(hash, bucket) as i64)
    }

    async fn list_stale_unclaimed(&self, cutoff: i64, limit: i64) -> Result<Vec<File>, StorageError> {
        self.check()?;
        let state = self.state.lock();
        let mut stale: Vec<File> = state
            .files
            .values()
            .filter(|f| !f.claimed && f.uploaded_at < cutoff)
            .cloned()
            .collect();
        stale.sort_by_key(|f| f.uploaded_at);
        stale.truncate(limit.max(0) as usize);
        Ok(stale)
    }

    async fn unclaim_by_uploader(&self, uploaded_by: &str) -> Result<u64, StorageError> {
        self.update_where(|f| f.uploaded_by == uploaded_by, |f| f.claimed = false)
    }

    async fn set_used_by(&self, id: &str, resource: &str) -> Result<u64, StorageError> {
        self.update_where(
            |f| f.id == id && f.bucket == "attachments",
            |f| {
                f.used_by = Some(resource.to_string());
                f.claimed = true;
            },
        )
    }

    async fn clear_used_by_id(&self, id: &str) -> Result<u64, StorageError> {
        self.update_where(
            |f| f.id == id && f.bucket == "attachments",
            |f| {
                f.used_by = None;
                f.claimed = false;
            },
        )
    }

    async fn clear_used_by_uploader(&self, uploaded_by: &str) -> Result<u64, StorageError> {
        self.update_where(
            |f| f.uploaded_by == uploaded_by && f.bucket == "attachments",
            |f| {
                f.used_by = None;
                f.claimed = false;
            },
        )
    }

    async fn block_status(&self, hash: &str) -> Result<Option<bool>, StorageError> {
        self.check()?;
        Ok(self.state.lock().blocked.get(hash).copied())
    }

    async fn ping(&self) -> Result<(), StorageError> {
        self.check()
    }
}
