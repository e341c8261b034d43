//! The cloud environment: a file-classifying router over three tiers.
//!
//! Implements the full [`Env`] surface. Every operation classifies the file
//! by its leaf name and dispatches:
//!
//! - SST/MANIFEST/IDENTITY: local disk first, then the destination bucket,
//!   then the source bucket. The fallback order is strict and writes go
//!   only to the destination; the source is read-only at all times.
//! - WAL (and the manifest when local log files are disabled): the
//!   streaming log tier.
//! - Everything else: the base local environment.
//!
//! The environment owns two background workers, both joined by
//! [`close`](CloudEnv::close): the deferred-deletion scheduler and, in log
//! mode, the stream tailer.

use crate::client::StorageClient;
use crate::config::{BucketOptions, CloudEnvOptions};
use crate::deletion::DeletionScheduler;
use crate::env::{
    Directory, Env, EnvOptions, FileLock, RandomAccessFile, SequentialFile, WritableFile,
};
use crate::filename::{basename, FileInfo, FileKind};
use crate::logctl::{LogController, LogTransport};
use crate::reader::CloudReadableFile;
use crate::registry::{DbidList, DbidRegistry};
use crate::storage::{ObjectInfo, StorageError, StorageProvider};
use crate::writer::{download_file, upload_file, CloudWritableFile};
use crate::{CloudError, CloudResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// Compose an object key from a bucket's object prefix and a local path's
/// leaf name.
fn object_name(prefix: &str, local: &str) -> String {
    let leaf = basename(local);
    if prefix.is_empty() {
        leaf.to_string()
    } else {
        format!("{prefix}/{leaf}")
    }
}

pub struct CloudEnv {
    base: Arc<dyn Env>,
    options: CloudEnvOptions,
    client: Arc<StorageClient>,
    registry: DbidRegistry,
    deleter: Option<DeletionScheduler>,
    log: Option<Arc<LogController>>,
    init_status: CloudResult<()>,
}

impl CloudEnv {
    /// Build the environment: validate the bucket binding, create the
    /// destination bucket, and start the background workers.
    ///
    /// Construction always returns an environment. A failed validation is
    /// persisted as the environment's status; every subsequent operation
    /// returns it and no workers are started.
    pub async fn open(
        base: Arc<dyn Env>,
        provider: Arc<dyn StorageProvider>,
        log_transport: Option<Arc<dyn LogTransport>>,
        options: CloudEnvOptions,
    ) -> CloudEnv {
        options.dump();
        let client = Arc::new(StorageClient::new(
            provider,
            options.request_callback.clone(),
        ));
        let registry = DbidRegistry::new(client.clone());

        let mut init_status = options.validate();

        if init_status.is_ok() && !options.keep_local_log_files && log_transport.is_none() {
            init_status = Err(CloudError::InvalidArgument(
                "log-tier routing requires a log transport".to_string(),
            ));
        }

        // Create the destination bucket; an existing or already-owned
        // bucket is success.
        if init_status.is_ok() {
            if let Some(dest) = &options.dest_bucket {
                init_status = match client.create_bucket(&dest.bucket, &dest.region).await {
                    Ok(()) => Ok(()),
                    Err(e) if e.is_bucket_exists() => Ok(()),
                    Err(e) => {
                        tracing::error!(bucket = %dest.bucket, error = %e, "bucket creation failed");
                        Err(CloudError::IoError(e.to_string()))
                    }
                };
            }
        }

        let deleter = match (&init_status, &options.dest_bucket) {
            (Ok(()), Some(dest)) => Some(DeletionScheduler::start(
                client.clone(),
                dest.bucket.clone(),
                options.file_deletion_delay,
            )),
            _ => None,
        };

        let mut log = None;
        if init_status.is_ok() && !options.keep_local_log_files {
            if let Some(transport) = log_transport {
                // The stream is named after the bucket the environment
                // reads from.
                let topic = options
                    .src_bucket
                    .as_ref()
                    .or(options.dest_bucket.as_ref())
                    .map(|b| b.bucket.clone())
                    .unwrap_or_default();
                init_status = match LogController::prepare(
                    base.clone(),
                    transport,
                    &options.log_tier_cache_root,
                    &topic,
                )
                .await
                {
                    Ok(controller) => {
                        let controller = Arc::new(controller);
                        match controller.start_tailing(&topic).await {
                            Ok(()) => {
                                log = Some(controller);
                                Ok(())
                            }
                            Err(e) => Err(e),
                        }
                    }
                    Err(e) => Err(e),
                };
            }
        }

        if let Err(e) = &init_status {
            tracing::error!(error = %e, "cloud environment initialization failed");
        } else {
            tracing::info!("cloud environment ready");
        }

        CloudEnv {
            base,
            options,
            client,
            registry,
            deleter,
            log,
            init_status,
        }
    }

    /// The persisted initialization status. A failed initialization renders
    /// the environment unusable: every operation returns this error.
    pub fn status(&self) -> CloudResult<()> {
        self.init_status.clone()
    }

    pub fn base_env(&self) -> &Arc<dyn Env> {
        &self.base
    }

    pub fn cloud_options(&self) -> &CloudEnvOptions {
        &self.options
    }

    pub fn src_bucket(&self) -> Option<&BucketOptions> {
        self.options.src_bucket.as_ref()
    }

    pub fn dest_bucket(&self) -> Option<&BucketOptions> {
        self.options.dest_bucket.as_ref()
    }

    /// Stop and join the background workers. Pending deferred deletions are
    /// cancelled, not drained.
    pub async fn close(&self) {
        if let Some(deleter) = &self.deleter {
            deleter.shutdown().await;
        }
        if let Some(log) = &self.log {
            log.stop_tailing().await;
        }
    }

    fn srcname(&self, local: &str) -> String {
        match &self.options.src_bucket {
            Some(src) => object_name(&src.object_prefix, local),
            None => basename(local).to_string(),
        }
    }

    fn destname(&self, local: &str) -> String {
        match &self.options.dest_bucket {
            Some(dest) => object_name(&dest.object_prefix, local),
            None => basename(local).to_string(),
        }
    }

    fn log_controller(&self) -> CloudResult<&Arc<LogController>> {
        self.log.as_ref().ok_or_else(|| {
            CloudError::InvalidArgument("log tier is not configured".to_string())
        })
    }

    /// Does this operation route through the streaming log tier?
    fn routes_to_log(&self, info: &FileInfo) -> bool {
        info.is_log_routed() && !self.options.keep_local_log_files
    }

    fn check_option(&self, options: &EnvOptions) -> CloudResult<()> {
        if options.use_mmap_reads && !self.options.keep_local_sst_files {
            return Err(CloudError::InvalidArgument(
                "mmap reads require keep_local_sst_files".to_string(),
            ));
        }
        Ok(())
    }

    /// Open a remote readable, trying dest before src. Only a missing
    /// object falls through to the next bucket.
    async fn open_remote(&self, fname: &str) -> CloudResult<CloudReadableFile> {
        if let Some(dest) = &self.options.dest_bucket {
            let file = CloudReadableFile::open(
                self.client.clone(),
                &dest.bucket,
                &self.destname(fname),
                true,
            )
            .await;
            match file.status() {
                Ok(()) => return Ok(file),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if let Some(src) = &self.options.src_bucket {
            let file = CloudReadableFile::open(
                self.client.clone(),
                &src.bucket,
                &self.srcname(fname),
                true,
            )
            .await;
            file.status()?;
            return Ok(file);
        }
        Err(CloudError::NotFound(format!(
            "{fname} not found in any bucket"
        )))
    }

    /// Pull a remote copy of `fname` into the local filesystem, dest first.
    async fn download_to_local(&self, fname: &str) -> CloudResult<()> {
        if let Some(dest) = &self.options.dest_bucket {
            match download_file(
                &self.base,
                &self.client,
                &dest.bucket,
                &self.destname(fname),
                fname,
            )
            .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        if let Some(src) = &self.options.src_bucket {
            return download_file(
                &self.base,
                &self.client,
                &src.bucket,
                &self.srcname(fname),
                fname,
            )
            .await;
        }
        Err(CloudError::NotFound(format!(
            "{fname} not found in any bucket"
        )))
    }

    /// Head the object backing `fname`, dest first, then src.
    async fn remote_file_info(&self, fname: &str) -> CloudResult<ObjectInfo> {
        if let Some(dest) = &self.options.dest_bucket {
            match self.client.head(&dest.bucket, &self.destname(fname)).await {
                Ok(info) => return Ok(info),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        if let Some(src) = &self.options.src_bucket {
            return self
                .client
                .head(&src.bucket, &self.srcname(fname))
                .await
                .map_err(CloudError::from);
        }
        Err(CloudError::NotFound(fname.to_string()))
    }

    async fn exists_in_bucket(&self, bucket: &str, key: &str) -> CloudResult<()> {
        self.exists_object(bucket, key).await
    }

    fn children_of(keys: Vec<String>, strip: &str) -> Vec<String> {
        keys.into_iter()
            .map(|key| match key.strip_prefix(strip) {
                Some(rest) if !strip.is_empty() => rest.to_string(),
                _ => basename(&key).to_string(),
            })
            .collect()
    }

    async fn bucket_children(&self, bucket: &str, object_prefix: &str) -> CloudResult<Vec<String>> {
        let prefix = if object_prefix.is_empty() {
            String::new()
        } else {
            format!("{object_prefix}/")
        };
        let keys = self
            .client
            .list_all(bucket, &prefix)
            .await
            .map_err(CloudError::from)?;
        Ok(Self::children_of(keys, &prefix))
    }

    // ---- cloud-specific surface ----

    /// Read a file straight from the named bucket, bypassing the local
    /// tier. `fname` is the object key.
    pub async fn new_sequential_file_cloud(
        &self,
        bucket: &str,
        fname: &str,
        _options: &EnvOptions,
    ) -> CloudResult<Box<dyn SequentialFile>> {
        self.status()?;
        let file = CloudReadableFile::open(self.client.clone(), bucket, fname, true).await;
        file.status()?;
        Ok(Box::new(file))
    }

    /// Delete every object in the bucket. Housekeeping: deletions are
    /// immediate, not deferred.
    pub async fn empty_bucket(&self, bucket: &str) -> CloudResult<()> {
        self.status()?;
        let keys = self
            .client
            .list_all(bucket, "")
            .await
            .map_err(CloudError::from)?;
        tracing::info!(bucket, objects = keys.len(), "emptying bucket");
        for key in keys {
            match self.client.delete(bucket, &key).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Register this database's dbid → directory mapping in the
    /// destination bucket.
    pub async fn save_dbid(&self, dbid: &str, dirname: &str) -> CloudResult<()> {
        self.status()?;
        let Some(dest) = &self.options.dest_bucket else {
            return Err(CloudError::InvalidArgument(
                "save_dbid requires a destination bucket".to_string(),
            ));
        };
        self.registry.save(&dest.bucket, dbid, dirname).await
    }

    pub async fn get_path_for_dbid(&self, bucket: &str, dbid: &str) -> CloudResult<String> {
        self.status()?;
        self.registry.path_for(bucket, dbid).await
    }

    pub async fn get_dbid_list(&self, bucket: &str) -> CloudResult<DbidList> {
        self.status()?;
        self.registry.list(bucket).await
    }

    pub async fn delete_dbid(&self, bucket: &str, dbid: &str) -> CloudResult<()> {
        self.status()?;
        self.registry.delete(bucket, dbid).await
    }

    /// All object keys under `prefix` in the bucket, alphabetical.
    pub async fn list_objects(&self, bucket: &str, prefix: &str) -> CloudResult<Vec<String>> {
        self.status()?;
        self.client
            .list_all(bucket, prefix)
            .await
            .map_err(CloudError::from)
    }

    /// Immediate remote deletion, for housekeeping paths.
    pub async fn delete_object(&self, bucket: &str, key: &str) -> CloudResult<()> {
        self.status()?;
        self.client
            .delete(bucket, key)
            .await
            .map_err(CloudError::from)
    }

    /// Probe a key for existence with a one-byte ranged GET. List-after-
    /// write is not consistent on object stores, read-after-write is.
    pub async fn exists_object(&self, bucket: &str, key: &str) -> CloudResult<()> {
        self.status()?;
        match self.client.get(bucket, key, Some(0..1)).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                Err(CloudError::NotFound(format!("{bucket}/{key}")))
            }
            Err(StorageError::Other(msg))
                if msg.contains("416")
                    || msg.to_ascii_lowercase().contains("range not satisfiable")
                    || msg.to_ascii_lowercase().contains("invalidrange") =>
            {
                // Zero-length marker objects have no readable range but do
                // exist.
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn get_object_size(&self, bucket: &str, key: &str) -> CloudResult<u64> {
        self.status()?;
        self.client
            .head(bucket, key)
            .await
            .map(|info| info.size)
            .map_err(CloudError::from)
    }

    pub async fn copy_object(
        &self,
        src_bucket: &str,
        src_key: &str,
        dst_bucket: &str,
        dst_key: &str,
    ) -> CloudResult<()> {
        self.status()?;
        self.client
            .copy(src_bucket, src_key, dst_bucket, dst_key)
            .await
            .map_err(CloudError::from)
    }

    /// Number of deferred deletions currently queued.
    pub fn pending_deletions(&self) -> usize {
        self.deleter.as_ref().map(|d| d.pending()).unwrap_or(0)
    }

    /// Cancel the pending deferred deletion of a file that a compaction
    /// referenced again.
    pub fn remove_file_from_deletion_queue(&self, file_number: u64) -> bool {
        self.deleter
            .as_ref()
            .map(|d| d.remove(file_number))
            .unwrap_or(false)
    }

    /// Override the deferred-deletion delay. Test hook.
    pub fn set_file_deletion_delay(&self, delay: Duration) {
        if let Some(deleter) = &self.deleter {
            deleter.set_delay(delay);
        }
    }

    /// Upload the identity file and update the local name. Renames of other
    /// engine files are rejected: objects cannot be renamed atomically.
    async fn rename_identity(&self, src: &str, target: &str) -> CloudResult<()> {
        let Some(dest) = &self.options.dest_bucket else {
            return Err(CloudError::NotSupported(
                "identity rename requires a destination bucket".to_string(),
            ));
        };
        upload_file(
            &self.base,
            &self.client,
            src,
            &dest.bucket,
            &self.destname(target),
        )
        .await?;
        self.base.rename_file(src, target).await
    }
}

#[async_trait]
impl Env for CloudEnv {
    async fn new_sequential_file(
        &self,
        fname: &str,
        options: &EnvOptions,
    ) -> CloudResult<Box<dyn SequentialFile>> {
        self.status()?;
        self.check_option(options)?;
        let info = FileInfo::parse(fname);

        if self.routes_to_log(&info) {
            return self.log_controller()?.new_sequential_file(fname, options).await;
        }
        if info.is_cloud_stored() {
            match self.base.new_sequential_file(fname, options).await {
                Ok(file) => return Ok(file),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            let file = self.open_remote(fname).await?;
            return Ok(Box::new(file));
        }
        self.base.new_sequential_file(fname, options).await
    }

    async fn new_random_access_file(
        &self,
        fname: &str,
        options: &EnvOptions,
    ) -> CloudResult<Box<dyn RandomAccessFile>> {
        self.status()?;
        self.check_option(options)?;
        let info = FileInfo::parse(fname);

        if self.routes_to_log(&info) {
            return self
                .log_controller()?
                .new_random_access_file(fname, options)
                .await;
        }
        if info.is_cloud_stored() {
            match self.base.new_random_access_file(fname, options).await {
                Ok(file) => return Ok(file),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            if self.options.keep_local_sst_files {
                // Restore the local copy, then serve reads from disk.
                self.download_to_local(fname).await?;
                return self.base.new_random_access_file(fname, options).await;
            }
            let file = self.open_remote(fname).await?;
            return Ok(Box::new(file));
        }
        self.base.new_random_access_file(fname, options).await
    }

    async fn new_writable_file(
        &self,
        fname: &str,
        options: &EnvOptions,
    ) -> CloudResult<Box<dyn WritableFile>> {
        self.status()?;
        let info = FileInfo::parse(fname);

        if self.routes_to_log(&info) {
            return Ok(Box::new(self.log_controller()?.new_writable_file(fname)));
        }

        // SSTs always become objects; the manifest only when periodic
        // durability is on. The identity file is written locally and
        // uploaded when it is renamed into place.
        let wants_cloud = match info.kind {
            FileKind::Sst => true,
            FileKind::Manifest => self.options.manifest_durable_periodicity_millis > 0,
            _ => false,
        };
        match (&self.options.dest_bucket, wants_cloud) {
            (Some(dest), true) => {
                let file = CloudWritableFile::create(
                    self.base.clone(),
                    self.client.clone(),
                    fname,
                    &dest.bucket,
                    &self.destname(fname),
                    options,
                    &self.options,
                )
                .await;
                file.status()?;
                Ok(Box::new(file))
            }
            _ => self.base.new_writable_file(fname, options).await,
        }
    }

    async fn new_directory(&self, name: &str) -> CloudResult<Box<dyn Directory>> {
        self.status()?;
        self.base.new_directory(name).await
    }

    async fn file_exists(&self, fname: &str) -> CloudResult<()> {
        self.status()?;
        let info = FileInfo::parse(fname);

        if self.routes_to_log(&info) {
            return self.log_controller()?.file_exists(fname).await;
        }
        if info.is_cloud_stored() {
            match self.base.file_exists(fname).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
            if let Some(dest) = &self.options.dest_bucket {
                match self
                    .exists_in_bucket(&dest.bucket, &self.destname(fname))
                    .await
                {
                    Ok(()) => return Ok(()),
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }
            if let Some(src) = &self.options.src_bucket {
                return self.exists_in_bucket(&src.bucket, &self.srcname(fname)).await;
            }
            return Err(CloudError::NotFound(fname.to_string()));
        }
        self.base.file_exists(fname).await
    }

    async fn get_children(&self, path: &str) -> CloudResult<Vec<String>> {
        self.status()?;
        // Local children, then the bucket listings folded in. When two
        // unique buckets are configured the result may contain duplicates;
        // callers must tolerate them.
        let mut result = match self.base.get_children(path).await {
            Ok(children) => children,
            Err(e) if e.is_not_found() => Vec::new(),
            Err(e) => return Err(e),
        };
        if let Some(src) = &self.options.src_bucket {
            result.extend(
                self.bucket_children(&src.bucket, &src.object_prefix)
                    .await?,
            );
        }
        if let Some(dest) = &self.options.dest_bucket {
            if self.options.src_bucket.is_none() || self.options.two_unique_buckets() {
                result.extend(
                    self.bucket_children(&dest.bucket, &dest.object_prefix)
                        .await?,
                );
            }
        }
        Ok(result)
    }

    async fn delete_file(&self, fname: &str) -> CloudResult<()> {
        self.status()?;
        let info = FileInfo::parse(fname);

        if self.routes_to_log(&info) {
            return self.log_controller()?.delete_log_file(fname).await;
        }
        if info.is_cloud_stored() {
            let mut enqueued = false;
            if let Some(deleter) = &self.deleter {
                deleter.enqueue(&self.destname(fname), info.number);
                enqueued = true;
            }
            return match self.base.delete_file(fname).await {
                Ok(()) => Ok(()),
                // The local copy may legitimately be gone already (it was
                // dropped after upload); the remote deletion is queued.
                Err(e) if e.is_not_found() && enqueued => Ok(()),
                Err(e) => Err(e),
            };
        }
        self.base.delete_file(fname).await
    }

    async fn create_dir(&self, name: &str) -> CloudResult<()> {
        self.status()?;
        if let Some(dest) = &self.options.dest_bucket {
            // A directory is a zero-size marker object.
            self.client
                .put(&dest.bucket, &self.destname(name), bytes::Bytes::new(), None)
                .await
                .map_err(|e| CloudError::IoError(e.to_string()))?;
        }
        self.base.create_dir(name).await
    }

    async fn create_dir_if_missing(&self, name: &str) -> CloudResult<()> {
        self.status()?;
        if let Some(dest) = &self.options.dest_bucket {
            self.client
                .put(&dest.bucket, &self.destname(name), bytes::Bytes::new(), None)
                .await
                .map_err(|e| CloudError::IoError(e.to_string()))?;
        }
        self.base.create_dir_if_missing(name).await
    }

    async fn delete_dir(&self, name: &str) -> CloudResult<()> {
        self.status()?;
        if let Some(dest) = &self.options.dest_bucket {
            // Refuse while the destination still lists children under the
            // directory's prefix.
            let prefix = format!("{}/", self.destname(name));
            let children = self
                .client
                .list_all(&dest.bucket, &prefix)
                .await
                .map_err(CloudError::from)?;
            if !children.is_empty() {
                return Err(CloudError::IoError(format!(
                    "{name} is not empty in bucket {}",
                    dest.bucket
                )));
            }
            match self.client.delete(&dest.bucket, &self.destname(name)).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }
        self.base.delete_dir(name).await
    }

    async fn get_file_size(&self, fname: &str) -> CloudResult<u64> {
        self.status()?;
        let info = FileInfo::parse(fname);

        if self.routes_to_log(&info) {
            return self.log_controller()?.get_file_size(fname).await;
        }
        if info.is_cloud_stored() {
            if self.base.file_exists(fname).await.is_ok() {
                return self.base.get_file_size(fname).await;
            }
            return self.remote_file_info(fname).await.map(|i| i.size);
        }
        self.base.get_file_size(fname).await
    }

    async fn get_file_modification_time(&self, fname: &str) -> CloudResult<u64> {
        self.status()?;
        let info = FileInfo::parse(fname);

        if self.routes_to_log(&info) {
            return self
                .log_controller()?
                .get_file_modification_time(fname)
                .await;
        }
        if info.is_cloud_stored() {
            if self.base.file_exists(fname).await.is_ok() {
                return self.base.get_file_modification_time(fname).await;
            }
            return self.remote_file_info(fname).await.map(|i| i.modified_micros);
        }
        self.base.get_file_modification_time(fname).await
    }

    async fn rename_file(&self, src: &str, target: &str) -> CloudResult<()> {
        self.status()?;
        match FileInfo::parse(src).kind {
            FileKind::Sst | FileKind::Manifest | FileKind::WriteAheadLog => {
                Err(CloudError::NotSupported(format!(
                    "rename of {src} is not supported on cloud storage"
                )))
            }
            FileKind::Identity => self.rename_identity(src, target).await,
            FileKind::Other => self.base.rename_file(src, target).await,
        }
    }

    async fn link_file(&self, _src: &str, _target: &str) -> CloudResult<()> {
        Err(CloudError::NotSupported(
            "hard links are not supported on cloud storage".to_string(),
        ))
    }

    async fn lock_file(&self, fname: &str) -> CloudResult<FileLock> {
        // Remote locking is not supported; the lock is a local no-op token.
        self.status()?;
        Ok(FileLock {
            path: fname.to_string(),
        })
    }

    async fn unlock_file(&self, _lock: FileLock) -> CloudResult<()> {
        Ok(())
    }

    async fn new_logger(&self, fname: &str) -> CloudResult<Box<dyn WritableFile>> {
        self.base.new_logger(fname).await
    }

    fn now_micros(&self) -> u64 {
        self.base.now_micros()
    }
}
