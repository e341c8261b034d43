//! Cloud storage environment for a log-structured merge-tree engine.
//!
//! This crate adapts an LSM database to use an S3-compatible object store as
//! the durable home for its immutable files while keeping mutable and hot
//! state on a local filesystem. The engine talks to a single [`Env`]
//! capability; the cloud variant classifies every file by role and routes
//! each operation to one of three tiers:
//!
//! ```text
//! SST / MANIFEST / IDENTITY  →  local disk, falling back to dest then src bucket
//! WAL / MANIFEST (log mode)  →  streaming log tier with a local cache
//! everything else            →  local disk only
//! ```
//!
//! # Usage
//!
//! ```rust,no_run
//! use cloud_env::{BucketOptions, CloudEnv, CloudEnvOptions, Env, EnvOptions, LocalEnv, WritableFile};
//! use cloud_env::storage::InMemoryProvider;
//! use std::sync::Arc;
//!
//! # async fn example() -> cloud_env::CloudResult<()> {
//! let options = CloudEnvOptions::default()
//!     .with_dest_bucket(BucketOptions::new("acme", "db1", "us-west-2"));
//! let env = CloudEnv::open(
//!     LocalEnv::new(),
//!     Arc::new(InMemoryProvider::new()),
//!     None,
//!     options,
//! )
//! .await;
//! env.status()?;
//! let mut file = env.new_writable_file("/data/000042.sst", &EnvOptions::default()).await?;
//! file.append(b"payload").await?;
//! file.close().await?;
//! env.close().await;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod cloud;
pub mod config;
pub mod deletion;
pub mod env;
pub mod filename;
pub mod logctl;
pub mod reader;
pub mod registry;
pub mod retry;
pub mod s3;
pub mod stats;
pub mod storage;
pub mod writer;

pub use client::{OpKind, RequestCallback, StorageClient};
pub use cloud::CloudEnv;
pub use config::{BucketOptions, CloudCredentials, CloudEnvOptions, CloudType};
pub use env::{Env, EnvOptions, LocalEnv, SequentialFile, WritableFile};
pub use stats::CloudStats;

use thiserror::Error;

/// Errors surfaced by the cloud environment.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloudError {
    /// The file or object does not exist in the probed location. Drives the
    /// local → dest → src fallback in the router.
    #[error("not found: {0}")]
    NotFound(String),

    /// Local I/O failure, or any remote failure that is not a missing object.
    #[error("I/O error: {0}")]
    IoError(String),

    /// Rejected configuration or option combination.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not available on this tier (e.g. renaming an SST).
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The retry driver exhausted its polling window.
    #[error("operation timed out")]
    TimedOut,

    /// A background worker is already active (e.g. duplicate tailer start).
    #[error("busy: {0}")]
    Busy(String),
}

impl CloudError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, CloudError::NotFound(_))
    }
}

impl From<std::io::Error> for CloudError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            CloudError::NotFound(e.to_string())
        } else {
            CloudError::IoError(e.to_string())
        }
    }
}

/// Result type alias for environment operations.
pub type CloudResult<T> = Result<T, CloudError>;
