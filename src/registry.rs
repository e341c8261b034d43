//! Registry of database ids inside a bucket.
//!
//! Every database instance announces itself under `.rockset/dbid/<dbid>`:
//! an empty-bodied object whose `dirname` metadata names the directory the
//! database lives in. Registry entries are the one sanctioned zero-length
//! write; their payload rides entirely in metadata.

use crate::client::StorageClient;
use crate::{CloudError, CloudResult};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Key prefix of registry entries at the bucket root.
pub const DBID_REGISTRY_PREFIX: &str = ".rockset/dbid/";

/// Metadata key carrying the database directory.
const DIRNAME_KEY: &str = "dirname";

/// dbid → directory name, for every database registered in a bucket.
pub type DbidList = BTreeMap<String, String>;

pub struct DbidRegistry {
    client: Arc<StorageClient>,
}

impl DbidRegistry {
    pub fn new(client: Arc<StorageClient>) -> DbidRegistry {
        DbidRegistry { client }
    }

    fn key(dbid: &str) -> String {
        format!("{DBID_REGISTRY_PREFIX}{dbid}")
    }

    /// Record that `dbid` lives in `dirname`.
    pub async fn save(&self, bucket: &str, dbid: &str, dirname: &str) -> CloudResult<()> {
        let mut metadata = HashMap::new();
        metadata.insert(DIRNAME_KEY.to_string(), dirname.to_string());
        self.client
            .put(bucket, &Self::key(dbid), Bytes::new(), Some(metadata))
            .await
            .map_err(|e| CloudError::IoError(e.to_string()))?;
        tracing::info!(bucket, dbid, dirname, "dbid registered");
        Ok(())
    }

    /// Resolve the directory a dbid maps to.
    pub async fn path_for(&self, bucket: &str, dbid: &str) -> CloudResult<String> {
        let info = self
            .client
            .head(bucket, &Self::key(dbid))
            .await
            .map_err(CloudError::from)?;
        info.metadata.get(DIRNAME_KEY).cloned().ok_or_else(|| {
            CloudError::IoError(format!("dbid {dbid} entry has no {DIRNAME_KEY} metadata"))
        })
    }

    /// Enumerate every registered dbid in the bucket, resolving each entry's
    /// directory.
    pub async fn list(&self, bucket: &str) -> CloudResult<DbidList> {
        let keys = self
            .client
            .list_all(bucket, DBID_REGISTRY_PREFIX)
            .await
            .map_err(CloudError::from)?;

        let mut out = DbidList::new();
        for key in keys {
            let Some(dbid) = key.strip_prefix(DBID_REGISTRY_PREFIX) else {
                continue;
            };
            let dirname = self.path_for(bucket, dbid).await?;
            out.insert(dbid.to_string(), dirname);
        }
        Ok(out)
    }

    /// Drop a dbid from the registry.
    pub async fn delete(&self, bucket: &str, dbid: &str) -> CloudResult<()> {
        self.client
            .delete(bucket, &Self::key(dbid))
            .await
            .map_err(CloudError::from)?;
        tracing::info!(bucket, dbid, "dbid deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryProvider, StorageProvider};

    async fn registry() -> DbidRegistry {
        let provider = Arc::new(InMemoryProvider::new());
        provider.create_bucket("acme", "us-west-2").await.unwrap();
        DbidRegistry::new(Arc::new(StorageClient::new(provider, None)))
    }

    #[tokio::test]
    async fn test_save_then_resolve() {
        let registry = registry().await;
        registry.save("acme", "X7", "/paths/x").await.unwrap();
        assert_eq!(registry.path_for("acme", "X7").await.unwrap(), "/paths/x");
    }

    #[tokio::test]
    async fn test_list() {
        let registry = registry().await;
        registry.save("acme", "X7", "/paths/x").await.unwrap();
        registry.save("acme", "Y3", "/paths/y").await.unwrap();

        let list = registry.list("acme").await.unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list.get("X7").unwrap(), "/paths/x");
        assert_eq!(list.get("Y3").unwrap(), "/paths/y");
    }

    #[tokio::test]
    async fn test_delete_then_not_found() {
        let registry = registry().await;
        registry.save("acme", "X7", "/paths/x").await.unwrap();
        registry.delete("acme", "X7").await.unwrap();

        let err = registry.path_for("acme", "X7").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(registry.list("acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_dbid_is_not_found() {
        let registry = registry().await;
        assert!(registry
            .path_for("acme", "nope")
            .await
            .unwrap_err()
            .is_not_found());
    }

    #[tokio::test]
    async fn test_overwrite_updates_dirname() {
        let registry = registry().await;
        registry.save("acme", "X7", "/paths/old").await.unwrap();
        registry.save("acme", "X7", "/paths/new").await.unwrap();
        assert_eq!(registry.path_for("acme", "X7").await.unwrap(), "/paths/new");
    }
}
