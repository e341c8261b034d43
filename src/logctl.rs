//! Streaming log tier for WAL and manifest traffic.
//!
//! When local log files are disabled, every write-ahead-log and manifest
//! write becomes a record on a partitioned append log (a Kinesis-like
//! transport). A tailer task replays the stream into a local cache
//! directory; read-side operations resolve against that cache, polling
//! through the retry driver because stream visibility lags writes.
//!
//! ## Record format
//!
//! ```text
//! [op: varint32][payload]
//! Append: [offset: fixed64][name_len: varint32][name][data_len: varint32][data]
//! Delete: [name_len: varint32][name]
//! Closed: [file_size: fixed64][name_len: varint32][name]
//! ```

use crate::env::{Env, EnvOptions, RandomAccessFile, SequentialFile, WritableFile};
use crate::filename::basename;
use crate::retry::{retry, DEFAULT_RETRY_PERIOD};
use crate::{CloudError, CloudResult};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::SeekFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

const OP_APPEND: u32 = 0x1;
const OP_DELETE: u32 = 0x2;
const OP_CLOSED: u32 = 0x4;

/// One record on the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogRecord {
    /// Add data to a log file at the given offset.
    Append {
        filename: String,
        offset: u64,
        data: Bytes,
    },
    /// Tombstone: the log file was deleted.
    Delete { filename: String },
    /// The log file was closed at the given size.
    Closed { filename: String, file_size: u64 },
}

fn put_varint32(buf: &mut BytesMut, mut v: u32) {
    while v >= 0x80 {
        buf.put_u8((v as u8) | 0x80);
        v >>= 7;
    }
    buf.put_u8(v as u8);
}

fn get_varint32(data: &[u8], pos: &mut usize) -> Option<u32> {
    let mut shift = 0u32;
    let mut out = 0u32;
    while shift <= 28 {
        let byte = *data.get(*pos)?;
        *pos += 1;
        out |= ((byte & 0x7F) as u32) << shift;
        if byte & 0x80 == 0 {
            return Some(out);
        }
        shift += 7;
    }
    None
}

fn put_length_prefixed(buf: &mut BytesMut, slice: &[u8]) {
    put_varint32(buf, slice.len() as u32);
    buf.put_slice(slice);
}

fn get_length_prefixed<'a>(data: &'a [u8], pos: &mut usize) -> Option<&'a [u8]> {
    let len = get_varint32(data, pos)? as usize;
    let slice = data.get(*pos..*pos + len)?;
    *pos += len;
    Some(slice)
}

fn get_fixed64(data: &[u8], pos: &mut usize) -> Option<u64> {
    let slice = data.get(*pos..*pos + 8)?;
    *pos += 8;
    Some(u64::from_le_bytes(slice.try_into().ok()?))
}

impl LogRecord {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            LogRecord::Append {
                filename,
                offset,
                data,
            } => {
                put_varint32(&mut buf, OP_APPEND);
                buf.put_u64_le(*offset);
                put_length_prefixed(&mut buf, filename.as_bytes());
                put_length_prefixed(&mut buf, data);
            }
            LogRecord::Delete { filename } => {
                put_varint32(&mut buf, OP_DELETE);
                put_length_prefixed(&mut buf, filename.as_bytes());
            }
            LogRecord::Closed {
                filename,
                file_size,
            } => {
                put_varint32(&mut buf, OP_CLOSED);
                buf.put_u64_le(*file_size);
                put_length_prefixed(&mut buf, filename.as_bytes());
            }
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> CloudResult<LogRecord> {
        let mut pos = 0usize;
        let parse_error = || CloudError::IoError("unable to parse payload from stream".to_string());
        let op = get_varint32(data, &mut pos).ok_or_else(parse_error)?;
        match op {
            OP_APPEND => {
                let offset = get_fixed64(data, &mut pos).ok_or_else(parse_error)?;
                let name = get_length_prefixed(data, &mut pos).ok_or_else(parse_error)?;
                let payload = get_length_prefixed(data, &mut pos).ok_or_else(parse_error)?;
                Ok(LogRecord::Append {
                    filename: String::from_utf8_lossy(name).into_owned(),
                    offset,
                    data: Bytes::copy_from_slice(payload),
                })
            }
            OP_DELETE => {
                let name = get_length_prefixed(data, &mut pos).ok_or_else(parse_error)?;
                Ok(LogRecord::Delete {
                    filename: String::from_utf8_lossy(name).into_owned(),
                })
            }
            OP_CLOSED => {
                let file_size = get_fixed64(data, &mut pos).ok_or_else(parse_error)?;
                let name = get_length_prefixed(data, &mut pos).ok_or_else(parse_error)?;
                Ok(LogRecord::Closed {
                    filename: String::from_utf8_lossy(name).into_owned(),
                    file_size,
                })
            }
            other => Err(CloudError::IoError(format!(
                "unknown stream operation {other:#x}"
            ))),
        }
    }
}

/// The partitioned append log the tier rides on. One stream per
/// environment; records arrive at the tailer in append order.
#[async_trait]
pub trait LogTransport: Send + Sync + 'static {
    async fn create_stream(&self, topic: &str) -> CloudResult<()>;

    async fn append(&self, record: Bytes) -> CloudResult<()>;

    /// Wait for and return the next record.
    async fn recv(&self) -> CloudResult<Bytes>;
}

/// In-process transport used by tests and single-node setups.
#[derive(Default)]
pub struct MemoryTransport {
    queue: Mutex<std::collections::VecDeque<Bytes>>,
    notify: Notify,
}

impl MemoryTransport {
    pub fn new() -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport::default())
    }
}

#[async_trait]
impl LogTransport for MemoryTransport {
    async fn create_stream(&self, _topic: &str) -> CloudResult<()> {
        Ok(())
    }

    async fn append(&self, record: Bytes) -> CloudResult<()> {
        self.queue.lock().push_back(record);
        self.notify.notify_one();
        Ok(())
    }

    async fn recv(&self) -> CloudResult<Bytes> {
        loop {
            let notified = self.notify.notified();
            if let Some(record) = self.queue.lock().pop_front() {
                return Ok(record);
            }
            notified.await;
        }
    }
}

/// Controller for the streaming log tier: owns the cache directory and the
/// tailer task, and offers cache-backed read operations.
pub struct LogController {
    base: Arc<dyn Env>,
    transport: Arc<dyn LogTransport>,
    cache_dir: String,
    retry_period: Duration,
    running: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    tailer: Mutex<Option<JoinHandle<()>>>,
}

impl LogController {
    /// Create the cache directory hierarchy `<root>/<bucket>/<uid>` and bind
    /// the controller to it.
    pub async fn prepare(
        base: Arc<dyn Env>,
        transport: Arc<dyn LogTransport>,
        cache_root: &str,
        bucket: &str,
    ) -> CloudResult<LogController> {
        let bucket_dir = format!("{cache_root}/{bucket}");
        let uid = format!("{}-{}", std::process::id(), base.now_micros());
        let cache_dir = format!("{bucket_dir}/{uid}");

        base.create_dir_if_missing(cache_root).await?;
        base.create_dir_if_missing(&bucket_dir).await?;
        base.create_dir_if_missing(&cache_dir).await?;

        Ok(LogController {
            base,
            transport,
            cache_dir,
            retry_period: DEFAULT_RETRY_PERIOD,
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(Notify::new()),
            tailer: Mutex::new(None),
        })
    }

    pub fn cache_dir(&self) -> &str {
        &self.cache_dir
    }

    /// Where a logical log file lives in the cache.
    pub fn cache_path(&self, fname: &str) -> String {
        format!("{}/{}", self.cache_dir, basename(fname))
    }

    /// Create the stream and start the tailer task. A second start is Busy.
    pub async fn start_tailing(&self, topic: &str) -> CloudResult<()> {
        {
            let tailer = self.tailer.lock();
            if tailer.is_some() {
                return Err(CloudError::Busy("tailer already started".to_string()));
            }
        }

        self.transport.create_stream(topic).await?;
        self.running.store(true, Ordering::SeqCst);

        let transport = self.transport.clone();
        let cache_dir = self.cache_dir.clone();
        let running = self.running.clone();
        let shutdown = self.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut cache_files: HashMap<String, tokio::fs::File> = HashMap::new();
            loop {
                tokio::select! {
                    _ = shutdown.notified() => break,
                    record = transport.recv() => match record {
                        Ok(raw) => match LogRecord::decode(&raw) {
                            Ok(record) => {
                                if let Err(e) = apply(&cache_dir, &mut cache_files, record).await {
                                    tracing::warn!(error = %e, "tailer failed to apply record");
                                }
                            }
                            Err(e) => tracing::warn!(error = %e, "tailer dropped record"),
                        },
                        Err(e) => {
                            tracing::warn!(error = %e, "stream receive failed, tailer exiting");
                            break;
                        }
                    }
                }
                if !running.load(Ordering::SeqCst) {
                    break;
                }
            }
        });
        *self.tailer.lock() = Some(handle);
        Ok(())
    }

    /// Stop the tailer and wait for it to exit.
    pub async fn stop_tailing(&self) {
        self.running.store(false, Ordering::SeqCst);
        self.shutdown.notify_one();
        let handle = self.tailer.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Open a log file for sequential reads from the cache, waiting out the
    /// stream's visibility lag.
    pub async fn new_sequential_file(
        &self,
        fname: &str,
        options: &EnvOptions,
    ) -> CloudResult<Box<dyn SequentialFile>> {
        let path = self.cache_path(fname);
        let base = self.base.clone();
        let options = *options;
        retry(self.retry_period, move || {
            let base = base.clone();
            let path = path.clone();
            async move { base.new_sequential_file(&path, &options).await }
        })
        .await
    }

    pub async fn new_random_access_file(
        &self,
        fname: &str,
        options: &EnvOptions,
    ) -> CloudResult<Box<dyn RandomAccessFile>> {
        let path = self.cache_path(fname);
        let base = self.base.clone();
        let options = *options;
        retry(self.retry_period, move || {
            let base = base.clone();
            let path = path.clone();
            async move { base.new_random_access_file(&path, &options).await }
        })
        .await
    }

    pub async fn file_exists(&self, fname: &str) -> CloudResult<()> {
        let path = self.cache_path(fname);
        let base = self.base.clone();
        retry(self.retry_period, move || {
            let base = base.clone();
            let path = path.clone();
            async move { base.file_exists(&path).await }
        })
        .await
    }

    pub async fn get_file_size(&self, fname: &str) -> CloudResult<u64> {
        let path = self.cache_path(fname);
        let base = self.base.clone();
        retry(self.retry_period, move || {
            let base = base.clone();
            let path = path.clone();
            async move { base.get_file_size(&path).await }
        })
        .await
    }

    pub async fn get_file_modification_time(&self, fname: &str) -> CloudResult<u64> {
        let path = self.cache_path(fname);
        let base = self.base.clone();
        retry(self.retry_period, move || {
            let base = base.clone();
            let path = path.clone();
            async move { base.get_file_modification_time(&path).await }
        })
        .await
    }

    /// Open a log file for writing: every append becomes a stream record.
    pub fn new_writable_file(&self, fname: &str) -> LogWritableFile {
        LogWritableFile {
            transport: self.transport.clone(),
            filename: basename(fname).to_string(),
            offset: 0,
            closed: false,
        }
    }

    /// Emit a deletion tombstone for a log file.
    pub async fn delete_log_file(&self, fname: &str) -> CloudResult<()> {
        let record = LogRecord::Delete {
            filename: basename(fname).to_string(),
        };
        self.transport.append(record.encode()).await
    }
}

/// Replay one record into the cache directory.
async fn apply(
    cache_dir: &str,
    cache_files: &mut HashMap<String, tokio::fs::File>,
    record: LogRecord,
) -> CloudResult<()> {
    match record {
        LogRecord::Append {
            filename,
            offset,
            data,
        } => {
            let path = format!("{cache_dir}/{}", basename(&filename));
            if !cache_files.contains_key(&path) {
                let file = tokio::fs::OpenOptions::new()
                    .read(true)
                    .write(true)
                    .create(true)
                    .truncate(false)
                    .open(&path)
                    .await?;
                cache_files.insert(path.clone(), file);
            }
            let Some(file) = cache_files.get_mut(&path) else {
                return Err(CloudError::IoError(format!("{path} not open")));
            };
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(&data).await?;
            file.flush().await?;
            tracing::trace!(path, offset, bytes = data.len(), "tailer appended");
        }
        LogRecord::Delete { filename } => {
            let path = format!("{cache_dir}/{}", basename(&filename));
            cache_files.remove(&path);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            tracing::trace!(path, "tailer deleted");
        }
        LogRecord::Closed {
            filename,
            file_size,
        } => {
            let path = format!("{cache_dir}/{}", basename(&filename));
            if let Some(mut file) = cache_files.remove(&path) {
                file.flush().await?;
                file.sync_all().await?;
            }
            tracing::trace!(path, file_size, "tailer closed");
        }
    }
    Ok(())
}

/// A WAL/manifest handle that writes records to the stream instead of disk.
pub struct LogWritableFile {
    transport: Arc<dyn LogTransport>,
    filename: String,
    offset: u64,
    closed: bool,
}

impl std::fmt::Debug for LogWritableFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogWritableFile")
            .field("filename", &self.filename)
            .field("offset", &self.offset)
            .field("closed", &self.closed)
            .finish()
    }
}

#[async_trait]
impl WritableFile for LogWritableFile {
    async fn append(&mut self, data: &[u8]) -> CloudResult<()> {
        if self.closed {
            return Err(CloudError::IoError(format!(
                "{} already closed",
                self.filename
            )));
        }
        let record = LogRecord::Append {
            filename: self.filename.clone(),
            offset: self.offset,
            data: Bytes::copy_from_slice(data),
        };
        self.transport.append(record.encode()).await?;
        self.offset += data.len() as u64;
        Ok(())
    }

    async fn flush(&mut self) -> CloudResult<()> {
        // Records are shipped as they are appended.
        Ok(())
    }

    async fn sync(&mut self) -> CloudResult<()> {
        Ok(())
    }

    async fn close(&mut self) -> CloudResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        let record = LogRecord::Closed {
            filename: self.filename.clone(),
            file_size: self.offset,
        };
        self.transport.append(record.encode()).await
    }
}
