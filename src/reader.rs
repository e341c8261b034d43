//! Readable file backed by a remote object.
//!
//! Construction issues a single Head probe to learn the object's size and
//! modification time; every read after that is a range request. A missing
//! object does not fail construction: the status is stored and poisons all
//! subsequent reads, which lets the router inspect it and fall back to the
//! next tier.

use crate::client::StorageClient;
use crate::env::{RandomAccessFile, SequentialFile};
use crate::filename::FileInfo;
use crate::{CloudError, CloudResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;

pub struct CloudReadableFile {
    client: Arc<StorageClient>,
    bucket: String,
    key: String,
    info: FileInfo,
    /// False for directory-marker probes, which have no file role.
    is_file: bool,
    file_size: u64,
    last_modified_micros: u64,
    /// Sequential read cursor.
    offset: u64,
    status: CloudResult<()>,
}

impl std::fmt::Debug for CloudReadableFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudReadableFile")
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("is_file", &self.is_file)
            .field("file_size", &self.file_size)
            .field("offset", &self.offset)
            .field("status", &self.status)
            .finish()
    }
}

impl CloudReadableFile {
    /// Open a remote object for reading. The returned handle always exists;
    /// check [`status`](Self::status) to learn whether the object does.
    pub async fn open(
        client: Arc<StorageClient>,
        bucket: &str,
        key: &str,
        is_file: bool,
    ) -> CloudReadableFile {
        tracing::debug!(bucket, key, "opening remote readable file");
        let info = FileInfo::parse(key);
        debug_assert!(!is_file || info.is_cloud_stored());
        let (file_size, last_modified_micros, status) = match client.head(bucket, key).await {
            Ok(head) => (head.size, head.modified_micros, Ok(())),
            Err(e) => {
                let status: CloudResult<()> = Err(e.into());
                tracing::debug!(bucket, key, error = ?status, "remote head failed");
                (0, 0, status)
            }
        };
        CloudReadableFile {
            client,
            bucket: bucket.to_string(),
            key: key.to_string(),
            info,
            is_file,
            file_size,
            last_modified_micros,
            offset: 0,
            status,
        }
    }

    /// The construction status: Ok when the Head probe found the object.
    pub fn status(&self) -> CloudResult<()> {
        self.status.clone()
    }

    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn last_modified_micros(&self) -> u64 {
        self.last_modified_micros
    }

    pub fn is_file(&self) -> bool {
        self.is_file
    }

    async fn read_range(&self, offset: u64, n: usize) -> CloudResult<Bytes> {
        self.status.clone()?;

        if offset >= self.file_size {
            return Ok(Bytes::new());
        }

        // Trim the request to the object's end.
        let mut n = n as u64;
        if offset + n > self.file_size {
            n = self.file_size - offset;
        }

        // Ranges are inclusive on the wire, so a zero-length range cannot be
        // expressed; request one byte and drop it.
        let range_len = n.max(1);
        let body = self
            .client
            .get(&self.bucket, &self.key, Some(offset..offset + range_len))
            .await
            .map_err(CloudError::from)?;
        if n == 0 {
            return Ok(Bytes::new());
        }
        let take = (n as usize).min(body.len());
        Ok(body.slice(..take))
    }
}

#[async_trait]
impl SequentialFile for CloudReadableFile {
    async fn read(&mut self, n: usize) -> CloudResult<Bytes> {
        let result = self.read_range(self.offset, n).await?;
        self.offset += result.len() as u64;
        Ok(result)
    }

    async fn skip(&mut self, n: u64) -> CloudResult<()> {
        self.status.clone()?;
        // The cursor never moves past the end of the object.
        self.offset = (self.offset + n).min(self.file_size);
        Ok(())
    }
}

#[async_trait]
impl RandomAccessFile for CloudReadableFile {
    async fn read_at(&self, offset: u64, n: usize) -> CloudResult<Bytes> {
        self.read_range(offset, n).await
    }

    fn unique_id(&self) -> Vec<u8> {
        self.info.unique_id()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryProvider;

    async fn fixture(key: &str, data: Vec<u8>) -> (Arc<StorageClient>, CloudReadableFile) {
        let provider = Arc::new(InMemoryProvider::new());
        provider.seed("acme", key, data);
        let client = Arc::new(StorageClient::new(provider, None));
        let file = CloudReadableFile::open(client.clone(), "acme", key, true).await;
        (client, file)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 256) as u8).collect()
    }

    #[tokio::test]
    async fn test_head_populates_size() {
        let (_client, file) = fixture("db1/000123.sst", pattern(1024)).await;
        file.status().unwrap();
        assert_eq!(file.file_size(), 1024);
        assert!(file.last_modified_micros() > 0);
    }

    #[tokio::test]
    async fn test_missing_object_poisons_reads() {
        let provider = Arc::new(InMemoryProvider::new());
        provider.seed("acme", "other", b"x".to_vec());
        let client = Arc::new(StorageClient::new(provider, None));
        let mut file = CloudReadableFile::open(client, "acme", "db1/000404.sst", true).await;

        assert!(file.status().unwrap_err().is_not_found());
        assert!(file.read(4).await.unwrap_err().is_not_found());
        assert!(file.read_at(0, 4).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_sequential_read_advances_cursor() {
        let (_client, mut file) = fixture("db1/000123.sst", pattern(1024)).await;
        let first = file.read(16).await.unwrap();
        assert_eq!(&first[..], &pattern(16)[..]);
        let next = file.read(4).await.unwrap();
        assert_eq!(&next[..], &[16, 17, 18, 19]);
    }

    #[tokio::test]
    async fn test_random_read_clamps_at_eof() {
        let (_client, file) = fixture("db1/000123.sst", pattern(1024)).await;
        let tail = file.read_at(1020, 8).await.unwrap();
        assert_eq!(tail.len(), 4);
        assert_eq!(&tail[..], &[0xFC, 0xFD, 0xFE, 0xFF]);
    }

    #[tokio::test]
    async fn test_read_past_eof_is_empty_success() {
        let (_client, mut file) = fixture("db1/000123.sst", pattern(8)).await;
        assert_eq!(file.read_at(8, 4).await.unwrap().len(), 0);
        assert_eq!(file.read_at(100, 4).await.unwrap().len(), 0);

        file.skip(100).await.unwrap();
        assert!(file.read(4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_length_probe() {
        let (_client, file) = fixture("db1/000123.sst", pattern(64)).await;
        // A zero-byte probe must succeed and return nothing.
        assert!(file.read_at(0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unique_id_follows_file_number() {
        let (_client, file) = fixture("db1/000123.sst", pattern(8)).await;
        assert_eq!(file.unique_id(), crate::filename::encode_varint64(123));

        let provider = Arc::new(InMemoryProvider::new());
        provider.seed("acme", "db1/IDENTITY", b"uuid".to_vec());
        let client = Arc::new(StorageClient::new(provider, None));
        let ident = CloudReadableFile::open(client, "acme", "db1/IDENTITY", true).await;
        assert!(ident.unique_id().is_empty());
    }
}
