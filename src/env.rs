//! The filesystem capability consumed by the database engine.
//!
//! [`Env`] is the polymorphic surface the engine programs against. Concrete
//! variants: [`LocalEnv`] (plain local filesystem), `CloudEnv` (the
//! classifying router in `cloud.rs`), and [`ManualClockEnv`] (a local
//! environment with a settable clock, for simulations and tests).

use crate::{CloudError, CloudResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufWriter};

/// Per-open options. `use_mmap_reads` is rejected by the cloud tiers when
/// the local SST copy may be absent.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvOptions {
    pub use_mmap_reads: bool,
}

/// A file read from front to back.
#[async_trait]
pub trait SequentialFile: Send + Sync + std::fmt::Debug {
    /// Read up to `n` bytes at the current cursor. An empty result at or
    /// past the end of file is success, not an error.
    async fn read(&mut self, n: usize) -> CloudResult<Bytes>;

    /// Advance the cursor by `n` bytes.
    async fn skip(&mut self, n: u64) -> CloudResult<()>;
}

/// A file supporting positioned reads.
#[async_trait]
pub trait RandomAccessFile: Send + Sync + std::fmt::Debug {
    /// Read up to `n` bytes starting at `offset`.
    async fn read_at(&self, offset: u64, n: usize) -> CloudResult<Bytes>;

    /// A stable id usable as a persistent-cache key; empty when the file
    /// has none.
    fn unique_id(&self) -> Vec<u8> {
        Vec::new()
    }
}

/// An append-only writable file.
#[async_trait]
pub trait WritableFile: Send + Sync + std::fmt::Debug {
    async fn append(&mut self, data: &[u8]) -> CloudResult<()>;
    async fn flush(&mut self) -> CloudResult<()>;
    async fn sync(&mut self) -> CloudResult<()>;
    async fn close(&mut self) -> CloudResult<()>;
}

/// Handle to an open directory, for metadata syncs.
#[async_trait]
pub trait Directory: Send + Sync + std::fmt::Debug {
    async fn fsync(&self) -> CloudResult<()> {
        Ok(())
    }
}

/// Token for a held file lock.
#[derive(Debug)]
pub struct FileLock {
    pub(crate) path: String,
}

impl FileLock {
    pub fn path(&self) -> &str {
        &self.path
    }
}

/// The filesystem surface. Times are microseconds since the Unix epoch.
#[async_trait]
pub trait Env: Send + Sync {
    async fn new_sequential_file(
        &self,
        fname: &str,
        options: &EnvOptions,
    ) -> CloudResult<Box<dyn SequentialFile>>;

    async fn new_random_access_file(
        &self,
        fname: &str,
        options: &EnvOptions,
    ) -> CloudResult<Box<dyn RandomAccessFile>>;

    async fn new_writable_file(
        &self,
        fname: &str,
        options: &EnvOptions,
    ) -> CloudResult<Box<dyn WritableFile>>;

    async fn new_directory(&self, name: &str) -> CloudResult<Box<dyn Directory>>;

    /// Ok when the file exists, NotFound otherwise.
    async fn file_exists(&self, fname: &str) -> CloudResult<()>;

    async fn get_children(&self, path: &str) -> CloudResult<Vec<String>>;

    async fn delete_file(&self, fname: &str) -> CloudResult<()>;

    async fn create_dir(&self, name: &str) -> CloudResult<()>;

    async fn create_dir_if_missing(&self, name: &str) -> CloudResult<()>;

    async fn delete_dir(&self, name: &str) -> CloudResult<()>;

    async fn get_file_size(&self, fname: &str) -> CloudResult<u64>;

    async fn get_file_modification_time(&self, fname: &str) -> CloudResult<u64>;

    async fn rename_file(&self, src: &str, target: &str) -> CloudResult<()>;

    async fn link_file(&self, src: &str, target: &str) -> CloudResult<()>;

    async fn lock_file(&self, fname: &str) -> CloudResult<FileLock>;

    async fn unlock_file(&self, lock: FileLock) -> CloudResult<()>;

    /// Open the informational log sink for the engine.
    async fn new_logger(&self, fname: &str) -> CloudResult<Box<dyn WritableFile>>;

    fn now_micros(&self) -> u64;
}

/// The plain local filesystem over tokio.
#[derive(Debug, Default)]
pub struct LocalEnv;

impl LocalEnv {
    pub fn new() -> Arc<LocalEnv> {
        Arc::new(LocalEnv)
    }
}

#[derive(Debug)]
struct LocalSequentialFile {
    file: File,
}

#[async_trait]
impl SequentialFile for LocalSequentialFile {
    async fn read(&mut self, n: usize) -> CloudResult<Bytes> {
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let got = self.file.read(&mut buf[filled..]).await?;
            if got == 0 {
                break;
            }
            filled += got;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }

    async fn skip(&mut self, n: u64) -> CloudResult<()> {
        self.file.seek(SeekFrom::Current(n as i64)).await?;
        Ok(())
    }
}

#[derive(Debug)]
struct LocalRandomAccessFile {
    file: tokio::sync::Mutex<File>,
}

#[async_trait]
impl RandomAccessFile for LocalRandomAccessFile {
    async fn read_at(&self, offset: u64, n: usize) -> CloudResult<Bytes> {
        let mut file = self.file.lock().await;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            let got = file.read(&mut buf[filled..]).await?;
            if got == 0 {
                break;
            }
            filled += got;
        }
        buf.truncate(filled);
        Ok(Bytes::from(buf))
    }
}

#[derive(Debug)]
struct LocalWritableFile {
    writer: Option<BufWriter<File>>,
    path: String,
}

impl LocalWritableFile {
    fn writer(&mut self) -> CloudResult<&mut BufWriter<File>> {
        self.writer
            .as_mut()
            .ok_or_else(|| CloudError::IoError(format!("{} already closed", self.path)))
    }
}

#[async_trait]
impl WritableFile for LocalWritableFile {
    async fn append(&mut self, data: &[u8]) -> CloudResult<()> {
        self.writer()?.write_all(data).await?;
        Ok(())
    }

    async fn flush(&mut self) -> CloudResult<()> {
        self.writer()?.flush().await?;
        Ok(())
    }

    async fn sync(&mut self) -> CloudResult<()> {
        let writer = self.writer()?;
        writer.flush().await?;
        writer.get_ref().sync_all().await?;
        Ok(())
    }

    async fn close(&mut self) -> CloudResult<()> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush().await?;
            writer.into_inner().sync_all().await?;
        }
        Ok(())
    }
}

#[derive(Debug)]
struct LocalDirectory {
    path: String,
}

#[async_trait]
impl Directory for LocalDirectory {
    async fn fsync(&self) -> CloudResult<()> {
        let dir = File::open(&self.path).await?;
        dir.sync_all().await?;
        Ok(())
    }
}

#[async_trait]
impl Env for LocalEnv {
    async fn new_sequential_file(
        &self,
        fname: &str,
        _options: &EnvOptions,
    ) -> CloudResult<Box<dyn SequentialFile>> {
        let file = File::open(fname).await?;
        Ok(Box::new(LocalSequentialFile { file }))
    }

    async fn new_random_access_file(
        &self,
        fname: &str,
        _options: &EnvOptions,
    ) -> CloudResult<Box<dyn RandomAccessFile>> {
        let file = File::open(fname).await?;
        Ok(Box::new(LocalRandomAccessFile {
            file: tokio::sync::Mutex::new(file),
        }))
    }

    async fn new_writable_file(
        &self,
        fname: &str,
        _options: &EnvOptions,
    ) -> CloudResult<Box<dyn WritableFile>> {
        let file = File::create(fname).await?;
        Ok(Box::new(LocalWritableFile {
            writer: Some(BufWriter::new(file)),
            path: fname.to_string(),
        }))
    }

    async fn new_directory(&self, name: &str) -> CloudResult<Box<dyn Directory>> {
        let meta = tokio::fs::metadata(name).await?;
        if !meta.is_dir() {
            return Err(CloudError::InvalidArgument(format!(
                "{name} is not a directory"
            )));
        }
        Ok(Box::new(LocalDirectory {
            path: name.to_string(),
        }))
    }

    async fn file_exists(&self, fname: &str) -> CloudResult<()> {
        tokio::fs::metadata(fname).await?;
        Ok(())
    }

    async fn get_children(&self, path: &str) -> CloudResult<Vec<String>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            out.push(entry.file_name().to_string_lossy().into_owned());
        }
        Ok(out)
    }

    async fn delete_file(&self, fname: &str) -> CloudResult<()> {
        tokio::fs::remove_file(fname).await?;
        Ok(())
    }

    async fn create_dir(&self, name: &str) -> CloudResult<()> {
        tokio::fs::create_dir(name).await?;
        Ok(())
    }

    async fn create_dir_if_missing(&self, name: &str) -> CloudResult<()> {
        match tokio::fs::create_dir(name).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_dir(&self, name: &str) -> CloudResult<()> {
        tokio::fs::remove_dir(name).await?;
        Ok(())
    }

    async fn get_file_size(&self, fname: &str) -> CloudResult<u64> {
        Ok(tokio::fs::metadata(fname).await?.len())
    }

    async fn get_file_modification_time(&self, fname: &str) -> CloudResult<u64> {
        let modified = tokio::fs::metadata(fname).await?.modified()?;
        Ok(modified
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0))
    }

    async fn rename_file(&self, src: &str, target: &str) -> CloudResult<()> {
        tokio::fs::rename(src, target).await?;
        Ok(())
    }

    async fn link_file(&self, src: &str, target: &str) -> CloudResult<()> {
        tokio::fs::hard_link(src, target).await?;
        Ok(())
    }

    async fn lock_file(&self, fname: &str) -> CloudResult<FileLock> {
        OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(fname)
            .await?;
        Ok(FileLock {
            path: fname.to_string(),
        })
    }

    async fn unlock_file(&self, _lock: FileLock) -> CloudResult<()> {
        Ok(())
    }

    async fn new_logger(&self, fname: &str) -> CloudResult<Box<dyn WritableFile>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(fname)
            .await?;
        Ok(Box::new(LocalWritableFile {
            writer: Some(BufWriter::new(file)),
            path: fname.to_string(),
        }))
    }

    fn now_micros(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0)
    }
}

/// A local environment whose clock is driven by the caller. Used to test
/// time-dependent policies like the manifest upload cadence.
pub struct ManualClockEnv {
    inner: Arc<dyn Env>,
    now: AtomicU64,
}

impl ManualClockEnv {
    pub fn new(start_micros: u64) -> Arc<ManualClockEnv> {
        Arc::new(ManualClockEnv {
            inner: LocalEnv::new(),
            now: AtomicU64::new(start_micros),
        })
    }

    pub fn set_now_micros(&self, micros: u64) {
        self.now.store(micros, Ordering::SeqCst);
    }
}

#[async_trait]
impl Env for ManualClockEnv {
    async fn new_sequential_file(
        &self,
        fname: &str,
        options: &EnvOptions,
    ) -> CloudResult<Box<dyn SequentialFile>> {
        self.inner.new_sequential_file(fname, options).await
    }

    async fn new_random_access_file(
        &self,
        fname: &str,
        options: &EnvOptions,
    ) -> CloudResult<Box<dyn RandomAccessFile>> {
        self.inner.new_random_access_file(fname, options).await
    }

    async fn new_writable_file(
        &self,
        fname: &str,
        options: &EnvOptions,
    ) -> CloudResult<Box<dyn WritableFile>> {
        self.inner.new_writable_file(fname, options).await
    }

    async fn new_directory(&self, name: &str) -> CloudResult<Box<dyn Directory>> {
        self.inner.new_directory(name).await
    }

    async fn file_exists(&self, fname: &str) -> CloudResult<()> {
        self.inner.file_exists(fname).await
    }

    async fn get_children(&self, path: &str) -> CloudResult<Vec<String>> {
        self.inner.get_children(path).await
    }

    async fn delete_file(&self, fname: &str) -> CloudResult<()> {
        self.inner.delete_file(fname).await
    }

    async fn create_dir(&self, name: &str) -> CloudResult<()> {
        self.inner.create_dir(name).await
    }

    async fn create_dir_if_missing(&self, name: &str) -> CloudResult<()> {
        self.inner.create_dir_if_missing(name).await
    }

    async fn delete_dir(&self, name: &str) -> CloudResult<()> {
        self.inner.delete_dir(name).await
    }

    async fn get_file_size(&self, fname: &str) -> CloudResult<u64> {
        self.inner.get_file_size(fname).await
    }

    async fn get_file_modification_time(&self, fname: &str) -> CloudResult<u64> {
        self.inner.get_file_modification_time(fname).await
    }

    async fn rename_file(&self, src: &str, target: &str) -> CloudResult<()> {
        self.inner.rename_file(src, target).await
    }

    async fn link_file(&self, src: &str, target: &str) -> CloudResult<()> {
        self.inner.link_file(src, target).await
    }

    async fn lock_file(&self, fname: &str) -> CloudResult<FileLock> {
        self.inner.lock_file(fname).await
    }

    async fn unlock_file(&self, lock: FileLock) -> CloudResult<()> {
        self.inner.unlock_file(lock).await
    }

    async fn new_logger(&self, fname: &str) -> CloudResult<Box<dyn WritableFile>> {
        self.inner.new_logger(fname).await
    }

    fn now_micros(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn path(dir: &TempDir, leaf: &str) -> String {
        dir.path().join(leaf).to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn test_write_then_read_sequential() {
        let dir = TempDir::new().unwrap();
        let env = LocalEnv::new();
        let fname = path(&dir, "000001.sst");

        let mut w = env
            .new_writable_file(&fname, &EnvOptions::default())
            .await
            .unwrap();
        w.append(b"hello ").await.unwrap();
        w.append(b"world").await.unwrap();
        w.close().await.unwrap();

        let mut r = env
            .new_sequential_file(&fname, &EnvOptions::default())
            .await
            .unwrap();
        assert_eq!(&r.read(5).await.unwrap()[..], b"hello");
        r.skip(1).await.unwrap();
        assert_eq!(&r.read(100).await.unwrap()[..], b"world");
        assert!(r.read(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_random_access() {
        let dir = TempDir::new().unwrap();
        let env = LocalEnv::new();
        let fname = path(&dir, "000002.sst");

        let mut w = env
            .new_writable_file(&fname, &EnvOptions::default())
            .await
            .unwrap();
        w.append(b"0123456789").await.unwrap();
        w.close().await.unwrap();

        let r = env
            .new_random_access_file(&fname, &EnvOptions::default())
            .await
            .unwrap();
        assert_eq!(&r.read_at(3, 4).await.unwrap()[..], b"3456");
        assert_eq!(&r.read_at(8, 10).await.unwrap()[..], b"89");
    }

    #[tokio::test]
    async fn test_file_metadata_ops() {
        let dir = TempDir::new().unwrap();
        let env = LocalEnv::new();
        let fname = path(&dir, "CURRENT");

        assert!(env.file_exists(&fname).await.unwrap_err().is_not_found());
        assert!(env.get_file_size(&fname).await.unwrap_err().is_not_found());

        let mut w = env
            .new_writable_file(&fname, &EnvOptions::default())
            .await
            .unwrap();
        w.append(b"MANIFEST-000001\n").await.unwrap();
        w.close().await.unwrap();

        env.file_exists(&fname).await.unwrap();
        assert_eq!(env.get_file_size(&fname).await.unwrap(), 16);
        assert!(env.get_file_modification_time(&fname).await.unwrap() > 0);

        let children = env.get_children(&path(&dir, "")).await.unwrap();
        assert!(children.contains(&"CURRENT".to_string()));

        env.delete_file(&fname).await.unwrap();
        assert!(env.file_exists(&fname).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_dirs() {
        let dir = TempDir::new().unwrap();
        let env = LocalEnv::new();
        let sub = path(&dir, "sub");

        env.create_dir(&sub).await.unwrap();
        assert!(env.create_dir(&sub).await.is_err());
        env.create_dir_if_missing(&sub).await.unwrap();

        let d = env.new_directory(&sub).await.unwrap();
        d.fsync().await.unwrap();

        env.delete_dir(&sub).await.unwrap();
        assert!(env.file_exists(&sub).await.is_err());
    }

    #[tokio::test]
    async fn test_rename_and_link() {
        let dir = TempDir::new().unwrap();
        let env = LocalEnv::new();
        let a = path(&dir, "a");
        let b = path(&dir, "b");
        let c = path(&dir, "c");

        let mut w = env
            .new_writable_file(&a, &EnvOptions::default())
            .await
            .unwrap();
        w.append(b"x").await.unwrap();
        w.close().await.unwrap();

        env.rename_file(&a, &b).await.unwrap();
        assert!(env.file_exists(&a).await.is_err());
        env.file_exists(&b).await.unwrap();

        env.link_file(&b, &c).await.unwrap();
        env.file_exists(&c).await.unwrap();
    }

    #[tokio::test]
    async fn test_manual_clock() {
        let env = ManualClockEnv::new(1_000_000);
        assert_eq!(env.now_micros(), 1_000_000);
        env.set_now_micros(60_000_001);
        assert_eq!(env.now_micros(), 60_000_001);
    }
}
