//! S3-compatible storage provider built on the `object_store` crate.
//!
//! One `AmazonS3` handle is scoped to one bucket, so the provider keeps a
//! handle per bucket it touches. Works against AWS S3 and S3-compatible
//! services (MinIO, LocalStack) via a custom endpoint.

use crate::config::CloudCredentials;
use crate::storage::{ListPage, ObjectInfo, StorageError, StorageProvider, StorageResult};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{Attribute, AttributeValue, Attributes, GetOptions, ObjectStore, PutOptions};
use parking_lot::RwLock;
use std::borrow::Cow;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;

pub struct S3Provider {
    region: String,
    credentials: CloudCredentials,
    /// Custom endpoint for S3-compatible services.
    endpoint: Option<String>,
    handles: RwLock<HashMap<String, Arc<dyn ObjectStore>>>,
}

impl S3Provider {
    pub fn new(region: &str, credentials: CloudCredentials) -> S3Provider {
        S3Provider {
            region: region.to_string(),
            credentials,
            endpoint: None,
            handles: RwLock::new(HashMap::new()),
        }
    }

    /// Point the provider at an S3-compatible endpoint (MinIO, LocalStack).
    pub fn with_endpoint(mut self, endpoint: &str) -> S3Provider {
        self.endpoint = Some(endpoint.to_string());
        self
    }

    fn handle(&self, bucket: &str) -> StorageResult<Arc<dyn ObjectStore>> {
        if let Some(handle) = self.handles.read().get(bucket) {
            return Ok(handle.clone());
        }

        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(bucket)
            .with_region(&self.region);
        if !self.credentials.access_key_id.is_empty() {
            builder = builder
                .with_access_key_id(&self.credentials.access_key_id)
                .with_secret_access_key(&self.credentials.secret_key);
        }
        if let Some(endpoint) = &self.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::Other(e.to_string()))?;
        let handle: Arc<dyn ObjectStore> = Arc::new(store);
        self.handles
            .write()
            .insert(bucket.to_string(), handle.clone());
        Ok(handle)
    }
}

fn mtime_micros(modified: DateTime<Utc>) -> u64 {
    modified.timestamp_micros().max(0) as u64
}

fn map_error(err: object_store::Error, what: &str) -> StorageError {
    match err {
        object_store::Error::NotFound { .. } => StorageError::NoSuchKey(what.to_string()),
        other => {
            let msg = other.to_string();
            if msg.contains("404") {
                StorageError::ResourceNotFound(format!("{what}: {msg}"))
            } else {
                StorageError::Other(format!("{what}: {msg}"))
            }
        }
    }
}

fn list_prefix(prefix: &str) -> Option<ObjectPath> {
    if prefix.is_empty() {
        None
    } else {
        Some(ObjectPath::from(prefix))
    }
}

#[async_trait]
impl StorageProvider for S3Provider {
    /// The `object_store` crate has no bucket-creation call, so reachable
    /// buckets report already-owned (which initialization treats as
    /// success) and unreachable ones ask the operator to provision.
    async fn create_bucket(&self, bucket: &str, _region: &str) -> StorageResult<()> {
        if self.exists_bucket(bucket).await? {
            return Err(StorageError::BucketAlreadyOwnedByYou(bucket.to_string()));
        }
        Err(StorageError::Other(format!(
            "bucket {bucket} does not exist and must be provisioned out of band"
        )))
    }

    async fn exists_bucket(&self, bucket: &str) -> StorageResult<bool> {
        let store = self.handle(bucket)?;
        let mut stream = store.list(None);
        match stream.next().await {
            None => Ok(true),
            Some(Ok(_)) => Ok(true),
            Some(Err(e)) => {
                let mapped = map_error(e, bucket);
                if mapped.is_not_found() {
                    Ok(false)
                } else {
                    Err(mapped)
                }
            }
        }
    }

    async fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo> {
        let store = self.handle(bucket)?;
        let path = ObjectPath::from(key);
        let options = GetOptions {
            head: true,
            ..Default::default()
        };
        let result = store
            .get_opts(&path, options)
            .await
            .map_err(|e| map_error(e, key))?;

        let mut metadata = HashMap::new();
        for (attr, value) in result.attributes.iter() {
            if let Attribute::Metadata(name) = attr {
                let value: &str = value;
                metadata.insert(name.to_string(), value.to_string());
            }
        }
        Ok(ObjectInfo {
            size: result.meta.size as u64,
            modified_micros: mtime_micros(result.meta.last_modified),
            metadata,
        })
    }

    async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> StorageResult<Bytes> {
        let store = self.handle(bucket)?;
        let path = ObjectPath::from(key);
        match range {
            Some(r) => store
                .get_range(&path, r.start as usize..r.end as usize)
                .await
                .map_err(|e| map_error(e, key)),
            None => {
                let result = store.get(&path).await.map_err(|e| map_error(e, key))?;
                result.bytes().await.map_err(|e| map_error(e, key))
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
        let store = self.handle(bucket)?;
        let path = ObjectPath::from(key);

        let mut attributes = Attributes::new();
        if let Some(metadata) = metadata {
            for (k, v) in metadata {
                attributes.insert(Attribute::Metadata(Cow::Owned(k)), AttributeValue::from(v));
            }
        }
        let options = PutOptions {
            attributes,
            ..Default::default()
        };
        store
            .put_opts(&path, body.into(), options)
            .await
            .map_err(|e| map_error(e, key))?;
        Ok(())
    }

    async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let store = self.handle(bucket)?;
        let path = ObjectPath::from(key);
        store.delete(&path).await.map_err(|e| map_error(e, key))
    }

    async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> StorageResult<()> {
        if src_bucket == dst_bucket {
            let store = self.handle(src_bucket)?;
            let from = ObjectPath::from(src_key);
            let to = ObjectPath::from(dst_key);
            return store.copy(&from, &to).await.map_err(|e| map_error(e, src_key));
        }

        // A handle is scoped to one bucket; cross-bucket copies go through
        // the client.
        let body = self.get(src_bucket, src_key, None).await?;
        self.put(dst_bucket, dst_key, body, None).await
    }

    async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        marker: Option<&str>,
        max_keys: usize,
    ) -> StorageResult<ListPage> {
        let store = self.handle(bucket)?;
        let prefix_path = list_prefix(prefix);
        let offset_path = marker.map(ObjectPath::from);

        let mut stream = match &offset_path {
            Some(offset) => store.list_with_offset(prefix_path.as_ref(), offset),
            None => store.list(prefix_path.as_ref()),
        };

        let mut page = ListPage::default();
        while let Some(item) = stream.next().await {
            let meta = item.map_err(|e| map_error(e, bucket))?;
            if page.objects.len() == max_keys {
                page.truncated = true;
                break;
            }
            page.objects.push(meta.location.to_string());
        }
        // No continuation marker: callers resume from the last key returned.
        Ok(page)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handles_are_cached_per_bucket() {
        let provider = S3Provider::new("us-west-2", CloudCredentials::default());
        let a = provider.handle("bucket-a").unwrap();
        let b = provider.handle("bucket-a").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = provider.handle("bucket-b").unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[test]
    fn test_endpoint_builder() {
        let provider = S3Provider::new(
            "us-west-2",
            CloudCredentials {
                access_key_id: "key".to_string(),
                secret_key: "secret".to_string(),
            },
        )
        .with_endpoint("http://127.0.0.1:9000");
        assert!(provider.handle("bucket").is_ok());
    }

    #[test]
    fn test_list_prefix_empty_is_none() {
        assert!(list_prefix("").is_none());
        assert_eq!(list_prefix("db1/").unwrap().as_ref(), "db1");
    }
}
