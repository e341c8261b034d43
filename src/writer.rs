//! Writable file whose durable home is the destination bucket.
//!
//! The engine sees an ordinary local writable file; durability is layered on
//! top. For an SST the whole object is uploaded once, on close. For the
//! manifest every sync is an upload opportunity, throttled by the configured
//! cadence, and close forces one final upload. The local manifest copy is
//! never deleted; the local SST copy survives only when
//! `keep_local_sst_files` is set.

use crate::client::StorageClient;
use crate::config::CloudEnvOptions;
use crate::env::{Env, EnvOptions, WritableFile};
use crate::filename::{FileInfo, FileKind};
use crate::stats::{CloudStats, Histogram, Ticker};
use crate::{CloudError, CloudResult};
use async_trait::async_trait;
use std::sync::Arc;

pub struct CloudWritableFile {
    base: Arc<dyn Env>,
    client: Arc<StorageClient>,
    local_path: String,
    bucket: String,
    key: String,
    is_manifest: bool,
    manifest_periodicity_millis: u64,
    last_manifest_upload_micros: u64,
    keep_local_sst_files: bool,
    stats: Option<Arc<CloudStats>>,
    local: Option<Box<dyn WritableFile>>,
    status: CloudResult<()>,
}

impl std::fmt::Debug for CloudWritableFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudWritableFile")
            .field("local_path", &self.local_path)
            .field("bucket", &self.bucket)
            .field("key", &self.key)
            .field("is_manifest", &self.is_manifest)
            .field("keep_local_sst_files", &self.keep_local_sst_files)
            .field("status", &self.status)
            .finish()
    }
}

impl CloudWritableFile {
    /// Create the local temp file through the base env and bind it to the
    /// remote object it will become. Check [`status`](Self::status) for the
    /// outcome of the local creation.
    pub async fn create(
        base: Arc<dyn Env>,
        client: Arc<StorageClient>,
        local_path: &str,
        bucket: &str,
        key: &str,
        options: &EnvOptions,
        cloud_options: &CloudEnvOptions,
    ) -> CloudWritableFile {
        let is_manifest = FileInfo::parse(local_path).kind == FileKind::Manifest;
        tracing::debug!(bucket, key, local_path, is_manifest, "opening cloud writable file");

        let (local, status) = match base.new_writable_file(local_path, options).await {
            Ok(file) => (Some(file), Ok(())),
            Err(e) => {
                tracing::error!(local_path, error = %e, "local temp file creation failed");
                (None, Err(e))
            }
        };

        CloudWritableFile {
            base,
            client,
            local_path: local_path.to_string(),
            bucket: bucket.to_string(),
            key: key.to_string(),
            is_manifest,
            manifest_periodicity_millis: cloud_options.manifest_durable_periodicity_millis,
            last_manifest_upload_micros: 0,
            keep_local_sst_files: cloud_options.keep_local_sst_files,
            stats: cloud_options.stats.clone(),
            local,
            status,
        }
    }

    pub fn status(&self) -> CloudResult<()> {
        self.status.clone()
    }

    fn local(&mut self) -> CloudResult<&mut Box<dyn WritableFile>> {
        match &self.status {
            Ok(()) => self
                .local
                .as_mut()
                .ok_or_else(|| CloudError::IoError(format!("{} already closed", self.local_path))),
            Err(e) => Err(e.clone()),
        }
    }

    /// Upload the manifest if forced or if the cadence allows it.
    ///
    /// TODO: confirm whether manifest_durable_periodicity_millis is really
    /// milliseconds. The predicate scales it by 1000 against a microsecond
    /// clock, so configured values behave as seconds today. Preserved until
    /// the unit question is settled upstream.
    async fn copy_manifest(&mut self, force: bool) -> CloudResult<()> {
        let now = self.base.now_micros();
        let due = self.last_manifest_upload_micros + 1000 * self.manifest_periodicity_millis < now;
        if !(force || due) {
            return Ok(());
        }

        upload_file(
            &self.base,
            &self.client,
            &self.local_path,
            &self.bucket,
            &self.key,
        )
        .await?;
        self.last_manifest_upload_micros = now;
        tracing::debug!(
            bucket = %self.bucket,
            key = %self.key,
            "manifest made durable"
        );

        if let Some(stats) = &self.stats {
            stats.record_tick(Ticker::NumberManifestWrites, 1);
            // Fold the latency of the PUT we just issued into the histogram.
            // An empty slot counts as a zero measurement.
            let micros = StorageClient::last_op_result()
                .map(|r| r.micros)
                .unwrap_or(0);
            stats.measure_time(Histogram::ManifestWritesTime, micros / 1000);
        }
        Ok(())
    }
}

#[async_trait]
impl WritableFile for CloudWritableFile {
    async fn append(&mut self, data: &[u8]) -> CloudResult<()> {
        self.local()?.append(data).await
    }

    async fn flush(&mut self) -> CloudResult<()> {
        self.local()?.flush().await
    }

    async fn sync(&mut self) -> CloudResult<()> {
        if self.local.is_none() {
            return self.status.clone();
        }
        self.local()?.sync().await?;
        if self.is_manifest {
            self.copy_manifest(false).await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> CloudResult<()> {
        let Some(mut local) = self.local.take() else {
            return self.status.clone();
        };
        tracing::debug!(local_path = %self.local_path, "closing cloud writable file");
        local.close().await?;

        if self.is_manifest {
            // Force one final upload; the local manifest is kept
            // unconditionally.
            return self.copy_manifest(true).await;
        }

        upload_file(
            &self.base,
            &self.client,
            &self.local_path,
            &self.bucket,
            &self.key,
        )
        .await?;

        if !self.keep_local_sst_files {
            self.base.delete_file(&self.local_path).await?;
        }
        Ok(())
    }
}

/// Upload a local file as one whole-object PUT. Object-store writes are
/// atomic at the object granularity, so partial visibility cannot occur.
/// Zero-length files are refused; an empty upload is a poison pill that
/// points at an engine bug.
pub async fn upload_file(
    base: &Arc<dyn Env>,
    client: &Arc<StorageClient>,
    local_path: &str,
    bucket: &str,
    key: &str,
) -> CloudResult<()> {
    let size = base.get_file_size(local_path).await.unwrap_or(0);
    if size == 0 {
        tracing::error!(local_path, "refusing to upload zero-size file");
        return Err(CloudError::IoError(format!("{local_path} zero size")));
    }

    let mut reader = base
        .new_sequential_file(local_path, &EnvOptions::default())
        .await?;
    let body = reader.read(size as usize).await?;
    client
        .put(bucket, key, body, None)
        .await
        .map_err(|e| CloudError::IoError(e.to_string()))?;
    tracing::debug!(local_path, bucket, key, size, "uploaded");
    Ok(())
}

/// Download a remote object into a local file: GET into `<path>.tmp`, then
/// rename into place. Empty objects are rejected without leaving a partial
/// file behind.
pub async fn download_file(
    base: &Arc<dyn Env>,
    client: &Arc<StorageClient>,
    bucket: &str,
    key: &str,
    local_path: &str,
) -> CloudResult<()> {
    let body = client
        .get(bucket, key, None)
        .await
        .map_err(CloudError::from)?;
    if body.is_empty() {
        tracing::error!(bucket, key, "refusing to download zero-size object");
        return Err(CloudError::IoError(format!("{key} zero size")));
    }

    let tmp = format!("{local_path}.tmp");
    let mut writer = base.new_writable_file(&tmp, &EnvOptions::default()).await?;
    writer.append(&body).await?;
    writer.close().await?;
    base.rename_file(&tmp, local_path).await?;
    tracing::info!(bucket, key, local_path, size = body.len(), "downloaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BucketOptions;
    use crate::env::ManualClockEnv;
    use crate::stats::CloudStats;
    use crate::storage::{InMemoryProvider, StorageProvider};
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
        env: Arc<ManualClockEnv>,
        provider: Arc<InMemoryProvider>,
        client: Arc<StorageClient>,
        options: CloudEnvOptions,
        stats: Arc<CloudStats>,
    }

    async fn fixture() -> Fixture {
        let provider = Arc::new(InMemoryProvider::new());
        provider.create_bucket("acme", "us-west-2").await.unwrap();
        let client = Arc::new(StorageClient::new(provider.clone(), None));
        let stats = Arc::new(CloudStats::new());
        let options = CloudEnvOptions::default()
            .with_dest_bucket(BucketOptions::new("acme", "db1", "us-west-2"))
            .with_stats(stats.clone());
        Fixture {
            dir: TempDir::new().unwrap(),
            env: ManualClockEnv::new(1_000_000),
            provider,
            client,
            options,
            stats,
        }
    }

    fn local(f: &Fixture, leaf: &str) -> String {
        f.dir.path().join(leaf).to_string_lossy().into_owned()
    }

    async fn writable(f: &Fixture, leaf: &str, key: &str) -> CloudWritableFile {
        CloudWritableFile::create(
            f.env.clone(),
            f.client.clone(),
            &local(f, leaf),
            "acme",
            key,
            &EnvOptions::default(),
            &f.options,
        )
        .await
    }

    #[tokio::test]
    async fn test_sst_uploaded_and_local_removed_on_close() {
        let f = fixture().await;
        let mut file = writable(&f, "000042.sst", "db1/000042.sst").await;
        file.status().unwrap();

        file.append(&vec![7u8; 4096]).await.unwrap();
        file.close().await.unwrap();

        assert!(f.provider.contains("acme", "db1/000042.sst"));
        let head = f.client.head("acme", "db1/000042.sst").await.unwrap();
        assert_eq!(head.size, 4096);
        // keep_local_sst_files defaults to false: the temp file is gone.
        assert!(f
            .env
            .file_exists(&local(&f, "000042.sst"))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_keep_local_sst_files_preserves_temp() {
        let mut f = fixture().await;
        f.options = f.options.clone().with_keep_local_sst_files(true);
        let mut file = writable(&f, "000043.sst", "db1/000043.sst").await;
        file.append(b"payload").await.unwrap();
        file.close().await.unwrap();

        assert!(f.provider.contains("acme", "db1/000043.sst"));
        f.env.file_exists(&local(&f, "000043.sst")).await.unwrap();
    }

    #[tokio::test]
    async fn test_zero_byte_upload_refused() {
        let f = fixture().await;
        let mut file = writable(&f, "000044.sst", "db1/000044.sst").await;
        let err = file.close().await.unwrap_err();
        assert!(matches!(err, CloudError::IoError(_)));
        assert!(!f.provider.contains("acme", "db1/000044.sst"));
    }

    #[tokio::test]
    async fn test_manifest_cadence() {
        let f = fixture().await;
        // periodicity 60 000, clock at 1 000 000 µs.
        let mut file = writable(&f, "MANIFEST-000001", "db1/MANIFEST-000001").await;
        file.append(b"version-edit").await.unwrap();

        // 0 + 1000 * 60000 = 6e7 > 1e6: not due yet.
        file.sync().await.unwrap();
        assert!(!f.provider.contains("acme", "db1/MANIFEST-000001"));
        assert_eq!(f.stats.ticker_count(Ticker::NumberManifestWrites), 0);

        // Just past the window: due.
        f.env.set_now_micros(60_000_001);
        file.sync().await.unwrap();
        assert!(f.provider.contains("acme", "db1/MANIFEST-000001"));
        assert_eq!(f.stats.ticker_count(Ticker::NumberManifestWrites), 1);
        assert_eq!(f.stats.histogram(Histogram::ManifestWritesTime).count, 1);

        // Within the window again: no second upload.
        f.env.set_now_micros(60_000_002);
        file.sync().await.unwrap();
        assert_eq!(f.stats.ticker_count(Ticker::NumberManifestWrites), 1);
    }

    #[tokio::test]
    async fn test_manifest_close_forces_upload_and_keeps_local() {
        let f = fixture().await;
        let mut file = writable(&f, "MANIFEST-000002", "db1/MANIFEST-000002").await;
        file.append(b"version-edit").await.unwrap();

        // Close forces the upload even though the cadence window is open.
        file.close().await.unwrap();
        assert!(f.provider.contains("acme", "db1/MANIFEST-000002"));
        assert_eq!(f.stats.ticker_count(Ticker::NumberManifestWrites), 1);
        // The local manifest is preserved unconditionally.
        f.env
            .file_exists(&local(&f, "MANIFEST-000002"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_download_roundtrip() {
        let f = fixture().await;
        f.provider.seed("acme", "db1/000050.sst", vec![3u8; 128]);

        let target = local(&f, "000050.sst");
        let base: Arc<dyn Env> = f.env.clone();
        download_file(&base, &f.client, "acme", "db1/000050.sst", &target)
            .await
            .unwrap();

        assert_eq!(f.env.get_file_size(&target).await.unwrap(), 128);
        // No temp file left behind.
        assert!(f
            .env
            .file_exists(&format!("{target}.tmp"))
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_download_zero_byte_refused() {
        let f = fixture().await;
        f.provider.seed("acme", "db1/empty.sst", Vec::new());

        let target = local(&f, "empty.sst");
        let base: Arc<dyn Env> = f.env.clone();
        let err = download_file(&base, &f.client, "acme", "db1/empty.sst", &target)
            .await
            .unwrap_err();
        assert!(matches!(err, CloudError::IoError(_)));
        // Neither the file nor its temp sibling exists.
        assert!(f.env.file_exists(&target).await.is_err());
        assert!(f.env.file_exists(&format!("{target}.tmp")).await.is_err());
    }

    #[tokio::test]
    async fn test_download_missing_object_is_not_found() {
        let f = fixture().await;
        let target = local(&f, "missing.sst");
        let base: Arc<dyn Env> = f.env.clone();
        let err = download_file(&base, &f.client, "acme", "db1/missing.sst", &target)
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
