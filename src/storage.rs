//! Object-store capability consumed by the environment.
//!
//! The environment never talks to a vendor SDK directly: it programs against
//! [`StorageProvider`], a bucket-aware trait offering the seven primitives it
//! needs (head/get/put/delete/copy/list/create-bucket), each returning either
//! success or a typed error code.
//!
//! Implementations:
//! - [`InMemoryProvider`]: for unit tests
//! - `S3Provider` (in `s3.rs`): for production, over the `object_store` crate

use crate::CloudError;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Range;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Typed error codes from the object store.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("no such bucket: {0}")]
    NoSuchBucket(String),
    #[error("no such key: {0}")]
    NoSuchKey(String),
    #[error("resource not found: {0}")]
    ResourceNotFound(String),
    #[error("bucket already exists: {0}")]
    BucketAlreadyExists(String),
    #[error("bucket already owned by you: {0}")]
    BucketAlreadyOwnedByYou(String),
    #[error("{0}")]
    Other(String),
}

impl StorageError {
    /// Object stores in the wild report a missing object under several type
    /// codes, and sometimes only in the human-readable message, so both the
    /// typed codes and a 404 substring count.
    pub fn is_not_found(&self) -> bool {
        match self {
            StorageError::NoSuchBucket(_)
            | StorageError::NoSuchKey(_)
            | StorageError::ResourceNotFound(_) => true,
            StorageError::Other(msg) => msg.contains("Response code: 404"),
            _ => false,
        }
    }

    pub fn is_bucket_exists(&self) -> bool {
        matches!(
            self,
            StorageError::BucketAlreadyExists(_) | StorageError::BucketAlreadyOwnedByYou(_)
        )
    }
}

/// Remote errors classify into NotFound vs IoError; only NotFound drives
/// the router's fallback logic.
impl From<StorageError> for CloudError {
    fn from(e: StorageError) -> Self {
        if e.is_not_found() {
            CloudError::NotFound(e.to_string())
        } else {
            CloudError::IoError(e.to_string())
        }
    }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Metadata of one remote object, as returned by a Head probe.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectInfo {
    pub size: u64,
    /// Last modification, microseconds since the Unix epoch.
    pub modified_micros: u64,
    /// Custom key/value metadata attached at PUT time.
    pub metadata: HashMap<String, String>,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListPage {
    /// Object keys, in alphabetical order.
    pub objects: Vec<String>,
    /// Continuation marker, when the server provides one.
    pub next_marker: Option<String>,
    /// Whether more keys remain past this page.
    pub truncated: bool,
}

/// The raw object-store capability. No retries happen at this layer; retry
/// policy is injected separately where it is needed.
#[async_trait]
pub trait StorageProvider: Send + Sync + 'static {
    async fn create_bucket(&self, bucket: &str, region: &str) -> StorageResult<()>;

    async fn exists_bucket(&self, bucket: &str) -> StorageResult<bool>;

    async fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo>;

    /// Fetch an object body, optionally restricted to a byte range. Ranges
    /// extending past the object end are clamped.
    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> StorageResult<Bytes>;

    /// Store an object. Writes are atomic at the object granularity: the
    /// last put wins, partial visibility cannot occur.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        metadata: Option<HashMap<String, String>>,
    ) -> StorageResult<()>;

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()>;

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> StorageResult<()>;

    /// One page of keys under `prefix`, alphabetical, starting strictly
    /// after `marker`.
    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        marker: Option<&str>,
        max_keys: usize,
    ) -> StorageResult<ListPage>;
}

fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

#[derive(Debug, Clone)]
struct StoredObject {
    data: Bytes,
    modified_micros: u64,
    metadata: HashMap<String, String>,
}

/// In-memory bucket-aware object store used by the test suite.
///
/// Listing pages report `truncated` without a `next_marker`, the way an S3
/// ListObjects response without a delimiter does, so callers exercise the
/// last-key fallback.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    buckets: RwLock<HashMap<String, BTreeMap<String, StoredObject>>>,
}

impl InMemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Direct fixture access for tests: store an object, creating the bucket
    /// if needed.
    pub fn seed(&self, bucket: &str, key: &str, data: impl Into<Bytes>) {
        let mut buckets = self.buckets.write();
        buckets.entry(bucket.to_string()).or_default().insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                modified_micros: now_micros(),
                metadata: HashMap::new(),
            },
        );
    }

    /// Does the object currently exist? Fixture helper for tests.
    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.buckets
            .read()
            .get(bucket)
            .map(|b| b.contains_key(key))
            .unwrap_or(false)
    }
}

#[async_trait]
impl StorageProvider for InMemoryProvider {
    async fn create_bucket(&self, bucket: &str, _region: &str) -> StorageResult<()> {
        let mut buckets = self.buckets.write();
        if buckets.contains_key(bucket) {
            return Err(StorageError::BucketAlreadyOwnedByYou(bucket.to_string()));
        }
        buckets.insert(bucket.to_string(), BTreeMap::new());
        Ok(())
    }

    async fn exists_bucket(&self, bucket: &str) -> StorageResult<bool> {
        Ok(self.buckets.read().contains_key(bucket))
    }

    async fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo> {
        let buckets = self.buckets.read();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| StorageError::NoSuchBucket(bucket.to_string()))?;
        let obj = objects
            .get(key)
            .ok_or_else(|| StorageError::NoSuchKey(key.to_string()))?;
        Ok(ObjectInfo {
            size: obj.data.len() as u64,
            modified_micros: obj.modified_micros,
            metadata: obj.metadata.clone(),
        })
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> StorageResult<Bytes> {
        let buckets = self.buckets.read();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| StorageError::NoSuchBucket(bucket.to_string()))?;
        let obj = objects
            .get(key)
            .ok_or_else(|| StorageError::NoSuchKey(key.to_string()))?;
        match range {
            None => Ok(obj.data.clone()),
            Some(r) => {
                let len = obj.data.len() as u64;
                let start = r.start.min(len) as usize;
                let end = r.end.min(len) as usize;
                Ok(obj.data.slice(start..end))
            }
        }
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        metadata: Option<HashMap<String, String>>,
    ) -> StorageResult<()> {
        let mut buckets = self.buckets.write();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::NoSuchBucket(bucket.to_string()))?;
        objects.insert(
            key.to_string(),
            StoredObject {
                data: body,
                modified_micros: now_micros(),
                metadata: metadata.unwrap_or_default(),
            },
        );
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let mut buckets = self.buckets.write();
        let objects = buckets
            .get_mut(bucket)
            .ok_or_else(|| StorageError::NoSuchBucket(bucket.to_string()))?;
        objects
            .remove(key)
            .ok_or_else(|| StorageError::NoSuchKey(key.to_string()))?;
        Ok(())
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> StorageResult<()> {
        let mut buckets = self.buckets.write();
        let obj = buckets
            .get(src_bucket)
            .ok_or_else(|| StorageError::NoSuchBucket(src_bucket.to_string()))?
            .get(src_key)
            .ok_or_else(|| StorageError::NoSuchKey(src_key.to_string()))?
            .clone();
        let dst = buckets
            .get_mut(dst_bucket)
            .ok_or_else(|| StorageError::NoSuchBucket(dst_bucket.to_string()))?;
        dst.insert(
            dst_key.to_string(),
            StoredObject {
                modified_micros: now_micros(),
                ..obj
            },
        );
        Ok(())
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        marker: Option<&str>,
        max_keys: usize,
    ) -> StorageResult<ListPage> {
        let buckets = self.buckets.read();
        let objects = buckets
            .get(bucket)
            .ok_or_else(|| StorageError::NoSuchBucket(bucket.to_string()))?;
        let mut page = ListPage::default();
        for key in objects.keys() {
            if !key.starts_with(prefix) {
                continue;
            }
            if let Some(m) = marker {
                if key.as_str() <= m {
                    continue;
                }
            }
            if page.objects.len() == max_keys {
                page.truncated = true;
                break;
            }
            page.objects.push(key.clone());
        }
        Ok(page)
    }
}
