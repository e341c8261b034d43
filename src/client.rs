//! Telemetry wrapper around the raw storage provider.
//!
//! Every object-store call in the environment goes through [`StorageClient`],
//! which brackets the call with a timer and, on completion, reports
//! `(op kind, bytes observed, elapsed micros, ok)` to the configured callback.
//! The most recent result is also parked in a thread-local slot for code
//! paths that fold the latency of their own just-issued call into cloud
//! statistics.

use crate::storage::{ListPage, ObjectInfo, StorageProvider, StorageResult};
use bytes::Bytes;
use std::cell::Cell;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use std::time::Instant;

/// Kind of a cloud request, as reported to the telemetry callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Read,
    Write,
    List,
    Create,
    Delete,
    Copy,
    Info,
}

/// Called after every cloud operation with
/// `(op, bytes, latency in microseconds, is_success)`. Must be thread-safe.
pub type RequestCallback = Arc<dyn Fn(OpKind, u64, u64, bool) + Send + Sync>;

/// Outcome of the calling thread's most recent storage operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LastOpResult {
    pub micros: u64,
    pub ok: bool,
}

thread_local! {
    static LAST_OP: Cell<Option<LastOpResult>> = const { Cell::new(None) };
}

/// Thin typed adaptor over the storage provider. No retries are performed
/// here; retry policy is a separately injected strategy.
pub struct StorageClient {
    provider: Arc<dyn StorageProvider>,
    callback: Option<RequestCallback>,
}

impl StorageClient {
    pub fn new(provider: Arc<dyn StorageProvider>, callback: Option<RequestCallback>) -> Self {
        Self { provider, callback }
    }

    /// The calling thread's most recent operation result. Absent when the
    /// thread has not issued any operation; callers must treat that as zero.
    pub fn last_op_result() -> Option<LastOpResult> {
        LAST_OP.get()
    }

    fn finish(&self, op: OpKind, bytes: u64, started: Instant, ok: bool) {
        let micros = started.elapsed().as_micros() as u64;
        LAST_OP.set(Some(LastOpResult { micros, ok }));
        if let Some(cb) = &self.callback {
            cb(op, bytes, micros, ok);
        }
    }

    pub async fn create_bucket(&self, bucket: &str, region: &str) -> StorageResult<()> {
        let started = Instant::now();
        let out = self.provider.create_bucket(bucket, region).await;
        self.finish(OpKind::Create, 0, started, out.is_ok());
        out
    }

    pub async fn exists_bucket(&self, bucket: &str) -> StorageResult<bool> {
        let started = Instant::now();
        let out = self.provider.exists_bucket(bucket).await;
        self.finish(OpKind::Info, 0, started, out.is_ok());
        out
    }

    pub async fn head(&self, bucket: &str, key: &str) -> StorageResult<ObjectInfo> {
        let started = Instant::now();
        let out = self.provider.head(bucket, key).await;
        let bytes = out.as_ref().map(|i| i.size).unwrap_or(0);
        self.finish(OpKind::Info, bytes, started, out.is_ok());
        out
    }

    pub async fn get(
        &self,
        bucket: &str,
        key: &str,
        range: Option<Range<u64>>,
    ) -> StorageResult<Bytes> {
        let started = Instant::now();
        let out = self.provider.get(bucket, key, range).await;
        let bytes = out.as_ref().map(|b| b.len() as u64).unwrap_or(0);
        self.finish(OpKind::Read, bytes, started, out.is_ok());
        out
    }

    pub async fn put(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
        metadata: Option<HashMap<String, String>>,
    ) -> StorageResult<()> {
        let started = Instant::now();
        let bytes = body.len() as u64;
        let out = self.provider.put(bucket, key, body, metadata).await;
        self.finish(OpKind::Write, bytes, started, out.is_ok());
        out
    }

    pub async fn delete(&self, bucket: &str, key: &str) -> StorageResult<()> {
        let started = Instant::now();
        let out = self.provider.delete(bucket, key).await;
        self.finish(OpKind::Delete, 0, started, out.is_ok());
        out
    }

    pub async fn copy(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> StorageResult<()> {
        let started = Instant::now();
        let out = self
            .provider
            .copy(src_bucket, src_key, dst_bucket, dst_key)
            .await;
        self.finish(OpKind::Copy, 0, started, out.is_ok());
        out
    }

    pub async fn list(
        &self,
        bucket: &str,
        prefix: &str,
        marker: Option<&str>,
        max_keys: usize,
    ) -> StorageResult<ListPage> {
        let started = Instant::now();
        let out = self.provider.list(bucket, prefix, marker, max_keys).await;
        let bytes = out.as_ref().map(|p| p.objects.len() as u64).unwrap_or(0);
        self.finish(OpKind::List, bytes, started, out.is_ok());
        out
    }

    /// Keys to list per request when enumerating a prefix.
    pub const LIST_PAGE_SIZE: usize = 50;

    /// Enumerate every key under `prefix`, following continuation markers.
    /// When a truncated page carries no marker, the key of the last returned
    /// object continues the walk. Enumeration is alphabetical; callers must
    /// not rely on temporal order.
    pub async fn list_all(&self, bucket: &str, prefix: &str) -> StorageResult<Vec<String>> {
        let mut out = Vec::new();
        let mut marker: Option<String> = None;
        loop {
            let page = self
                .list(bucket, prefix, marker.as_deref(), Self::LIST_PAGE_SIZE)
                .await?;
            let last = page.objects.last().cloned();
            out.extend(page.objects);
            if !page.truncated {
                return Ok(out);
            }
            marker = page.next_marker.or(last);
            if marker.is_none() {
                return Ok(out);
            }
        }
    }
}
