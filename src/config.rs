//! Configuration for the cloud storage environment.

use crate::client::RequestCallback;
use crate::stats::CloudStats;
use crate::{CloudError, CloudResult};
use std::sync::Arc;
use std::time::Duration;

/// Which cloud service backs the environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CloudType {
    /// Not really a cloud environment.
    None,
    #[default]
    Aws,
    Gcp,
    Azure,
    Rackspace,
}

/// Opaque key/secret pair for the object-store service.
#[derive(Clone, Default)]
pub struct CloudCredentials {
    pub access_key_id: String,
    pub secret_key: String,
}

impl std::fmt::Debug for CloudCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print the secret.
        f.debug_struct("CloudCredentials")
            .field("access_key_id", &self.access_key_id)
            .finish_non_exhaustive()
    }
}

/// One endpoint of the two-bucket binding: a bucket, the object path inside
/// it where the engine's files live, and the bucket's region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketOptions {
    pub bucket: String,
    pub object_prefix: String,
    pub region: String,
}

impl BucketOptions {
    pub fn new(bucket: &str, object_prefix: &str, region: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            object_prefix: object_prefix.to_string(),
            region: region.to_string(),
        }
    }
}

/// If you do not specify a region, buckets land in the standard region which
/// might not satisfy read-your-own-writes, so the default is pinned.
pub const DEFAULT_REGION: &str = "us-west-2";

/// Configuration for the cloud environment. Immutable after construction.
#[derive(Clone)]
pub struct CloudEnvOptions {
    pub cloud_type: CloudType,

    pub credentials: CloudCredentials,

    /// Read-only source bucket. Reads fall back here after local disk and
    /// the destination bucket.
    pub src_bucket: Option<BucketOptions>,

    /// Read-write destination bucket. All uploads and deletions target it.
    pub dest_bucket: Option<BucketOptions>,

    /// If false, a local SST file is deleted as soon as its upload completes
    /// and reads are served by range requests against the bucket.
    /// Default: false
    pub keep_local_sst_files: bool,

    /// If false, WAL and manifest traffic bypasses local disk and flows
    /// through the streaming log tier instead.
    /// Default: true
    pub keep_local_log_files: bool,

    /// Lower bound between manifest uploads; 0 disables periodic upload.
    /// Only meaningful when `keep_local_log_files` is true.
    /// Default: 1 minute
    pub manifest_durable_periodicity_millis: u64,

    /// Cadence of the bucket-wide orphan cleaner. Retained for compatibility;
    /// the scan itself needs manifest knowledge that lives above this crate,
    /// so no purger task is spawned here.
    /// Default: 10 minutes
    pub purger_periodicity_millis: u64,

    /// How long a destination-bucket deletion stays queued before the worker
    /// issues it. The delay masks out-of-order compactions that briefly
    /// reference freshly superseded files.
    /// Default: 1 hour
    pub file_deletion_delay: Duration,

    /// Root of the streaming-log tier's local cache. Each environment
    /// creates a unique directory beneath `<root>/<bucket>/`.
    pub log_tier_cache_root: String,

    /// Called after every object-store operation with
    /// `(op, bytes, latency in microseconds, is_success)`.
    pub request_callback: Option<RequestCallback>,

    /// Metrics sink for cloud operations.
    pub stats: Option<Arc<CloudStats>>,
}

impl Default for CloudEnvOptions {
    fn default() -> Self {
        Self {
            cloud_type: CloudType::Aws,
            credentials: CloudCredentials::default(),
            src_bucket: None,
            dest_bucket: None,
            keep_local_sst_files: false,
            keep_local_log_files: true,
            manifest_durable_periodicity_millis: 60 * 1000,
            purger_periodicity_millis: 10 * 60 * 1000,
            file_deletion_delay: Duration::from_secs(3600),
            log_tier_cache_root: "/tmp/.cloud-env-logcache".to_string(),
            request_callback: None,
            stats: None,
        }
    }
}

impl CloudEnvOptions {
    /// Builder-style: set the read-only source bucket.
    pub fn with_src_bucket(mut self, bucket: BucketOptions) -> Self {
        self.src_bucket = Some(bucket);
        self
    }

    /// Builder-style: set the read-write destination bucket.
    pub fn with_dest_bucket(mut self, bucket: BucketOptions) -> Self {
        self.dest_bucket = Some(bucket);
        self
    }

    /// Builder-style: keep or discard local SST files after upload.
    pub fn with_keep_local_sst_files(mut self, keep: bool) -> Self {
        self.keep_local_sst_files = keep;
        self
    }

    /// Builder-style: route WAL/manifest through the streaming log tier.
    pub fn with_keep_local_log_files(mut self, keep: bool) -> Self {
        self.keep_local_log_files = keep;
        self
    }

    /// Builder-style: set the manifest upload cadence.
    pub fn with_manifest_periodicity_millis(mut self, millis: u64) -> Self {
        self.manifest_durable_periodicity_millis = millis;
        self
    }

    /// Builder-style: set the deferred-deletion delay.
    pub fn with_file_deletion_delay(mut self, delay: Duration) -> Self {
        self.file_deletion_delay = delay;
        self
    }

    /// Builder-style: set the log-tier cache root.
    pub fn with_log_tier_cache_root(mut self, root: &str) -> Self {
        self.log_tier_cache_root = root.to_string();
        self
    }

    /// Builder-style: set the per-operation telemetry callback.
    pub fn with_request_callback(mut self, callback: RequestCallback) -> Self {
        self.request_callback = Some(callback);
        self
    }

    /// Builder-style: set the statistics sink.
    pub fn with_stats(mut self, stats: Arc<CloudStats>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Do the src and dest bindings name two distinct bucket locations?
    /// They are the same location only when both the bucket and the object
    /// prefix match.
    pub fn two_unique_buckets(&self) -> bool {
        match (&self.src_bucket, &self.dest_bucket) {
            (Some(src), Some(dest)) => {
                src.bucket != dest.bucket || src.object_prefix != dest.object_prefix
            }
            _ => false,
        }
    }

    /// Reject impossible combinations before any I/O happens.
    pub fn validate(&self) -> CloudResult<()> {
        if self.manifest_durable_periodicity_millis > 0 && !self.keep_local_log_files {
            return Err(CloudError::InvalidArgument(
                "periodic manifest upload requires keep_local_log_files".to_string(),
            ));
        }
        if let (Some(src), Some(dest)) = (&self.src_bucket, &self.dest_bucket) {
            if src.region != dest.region {
                return Err(CloudError::InvalidArgument(format!(
                    "src bucket region {} does not match dest bucket region {}",
                    src.region, dest.region
                )));
            }
        }
        Ok(())
    }

    /// Log the effective configuration at environment construction.
    pub fn dump(&self) {
        tracing::info!(
            cloud_type = ?self.cloud_type,
            src_bucket = ?self.src_bucket,
            dest_bucket = ?self.dest_bucket,
            keep_local_sst_files = self.keep_local_sst_files,
            keep_local_log_files = self.keep_local_log_files,
            manifest_durable_periodicity_millis = self.manifest_durable_periodicity_millis,
            purger_periodicity_millis = self.purger_periodicity_millis,
            file_deletion_delay_secs = self.file_deletion_delay.as_secs(),
            "cloud environment options"
        );
    }
}

impl std::fmt::Debug for CloudEnvOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudEnvOptions")
            .field("cloud_type", &self.cloud_type)
            .field("src_bucket", &self.src_bucket)
            .field("dest_bucket", &self.dest_bucket)
            .field("keep_local_sst_files", &self.keep_local_sst_files)
            .field("keep_local_log_files", &self.keep_local_log_files)
            .field(
                "manifest_durable_periodicity_millis",
                &self.manifest_durable_periodicity_millis,
            )
            .field("purger_periodicity_millis", &self.purger_periodicity_millis)
            .field("file_deletion_delay", &self.file_deletion_delay)
            .field("log_tier_cache_root", &self.log_tier_cache_root)
            .finish()
    }
}

/// Look up a configuration value by its conventional upper-case environment
/// variable, falling back to the lower-case spelling.
fn env_either(upper: &str, lower: &str) -> Option<String> {
    std::env::var(upper).ok().or_else(|| std::env::var(lower).ok())
}

/// Resolve credentials and region for running tests against a live service.
/// Returns `(access_key_id, secret_key, region)`.
pub fn test_credentials() -> CloudResult<(String, String, String)> {
    let key = env_either("AWS_ACCESS_KEY_ID", "aws_access_key_id").ok_or_else(|| {
        CloudError::InvalidArgument("AWS_ACCESS_KEY_ID is not set".to_string())
    })?;
    let secret = env_either("AWS_SECRET_ACCESS_KEY", "aws_secret_access_key").ok_or_else(
        || CloudError::InvalidArgument("AWS_SECRET_ACCESS_KEY is not set".to_string()),
    )?;
    let region = env_either("AWS_DEFAULT_REGION", "aws_default_region")
        .unwrap_or_else(|| DEFAULT_REGION.to_string());
    Ok((key, secret, region))
}

/// Bucket name suffix so that all tests on one machine share a bucket:
/// overridable via the environment, defaulting to the effective uid.
pub fn test_bucket_suffix() -> String {
    if let Ok(name) = std::env::var("ROCKSDB_CLOUD_TEST_BUCKET_NAME") {
        return name;
    }
    effective_uid().unwrap_or_else(|| "0".to_string())
}

#[cfg(target_os = "linux")]
fn effective_uid() -> Option<String> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("Uid:"))?;
    // Uid: real effective saved fs
    line.split_whitespace().nth(2).map(|s| s.to_string())
}

#[cfg(not(target_os = "linux"))]
fn effective_uid() -> Option<String> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = CloudEnvOptions::default();
        assert!(!opts.keep_local_sst_files);
        assert!(opts.keep_local_log_files);
        assert_eq!(opts.manifest_durable_periodicity_millis, 60_000);
        assert_eq!(opts.purger_periodicity_millis, 600_000);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_region_mismatch_rejected() {
        let opts = CloudEnvOptions::default()
            .with_src_bucket(BucketOptions::new("acme", "db1", "us-west-2"))
            .with_dest_bucket(BucketOptions::new("acme", "db2", "us-east-1"));
        let err = opts.validate().unwrap_err();
        assert!(matches!(err, CloudError::InvalidArgument(_)));
    }

    #[test]
    fn test_manifest_periodicity_requires_local_logs() {
        let opts = CloudEnvOptions::default().with_keep_local_log_files(false);
        assert!(opts.validate().is_err());

        let opts = CloudEnvOptions::default()
            .with_keep_local_log_files(false)
            .with_manifest_periodicity_millis(0);
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_two_unique_buckets() {
        let same = CloudEnvOptions::default()
            .with_src_bucket(BucketOptions::new("acme", "db1", "us-west-2"))
            .with_dest_bucket(BucketOptions::new("acme", "db1", "us-west-2"));
        assert!(!same.two_unique_buckets());

        let differs = CloudEnvOptions::default()
            .with_src_bucket(BucketOptions::new("acme", "db1", "us-west-2"))
            .with_dest_bucket(BucketOptions::new("acme", "db2", "us-west-2"));
        assert!(differs.two_unique_buckets());

        let only_dest = CloudEnvOptions::default()
            .with_dest_bucket(BucketOptions::new("acme", "db1", "us-west-2"));
        assert!(!only_dest.two_unique_buckets());
    }
}
