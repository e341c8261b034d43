//! Deferred deletion of destination-bucket objects.
//!
//! Deleting an SST removes the local file at once, but the remote object
//! only after a fixed delay measured from the enqueue instant. The delay
//! masks out-of-order compactions that briefly reference freshly superseded
//! files. One consumer task per environment drains the FIFO; shutdown exits
//! immediately without draining.

use crate::client::StorageClient;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct PendingDelete {
    enqueued: Instant,
    key: String,
    file_number: Option<u64>,
}

struct SchedulerShared {
    queue: Mutex<VecDeque<PendingDelete>>,
    delay: Mutex<Duration>,
    running: AtomicBool,
    notify: Notify,
}

/// FIFO of pending destination-bucket deletions with one consumer task.
pub struct DeletionScheduler {
    shared: Arc<SchedulerShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DeletionScheduler {
    /// Spawn the consumer task deleting from `bucket` after `delay`.
    pub fn start(client: Arc<StorageClient>, bucket: String, delay: Duration) -> DeletionScheduler {
        let shared = Arc::new(SchedulerShared {
            queue: Mutex::new(VecDeque::new()),
            delay: Mutex::new(delay),
            running: AtomicBool::new(true),
            notify: Notify::new(),
        });

        let worker_shared = shared.clone();
        let worker = tokio::spawn(async move {
            Self::run(worker_shared, client, bucket).await;
        });

        DeletionScheduler {
            shared,
            worker: Mutex::new(Some(worker)),
        }
    }

    async fn run(shared: Arc<SchedulerShared>, client: Arc<StorageClient>, bucket: String) {
        loop {
            if !shared.running.load(Ordering::SeqCst) {
                return;
            }

            let head = shared.queue.lock().front().cloned();
            let Some(entry) = head else {
                shared.notify.notified().await;
                continue;
            };

            // The delay is measured from the enqueue instant, not from when
            // the worker got around to this entry.
            let deadline = entry.enqueued + *shared.delay.lock();
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                // Woken early: shutdown, delay change, or cancellation.
                // Loop around and re-evaluate.
                _ = shared.notify.notified() => continue,
            }
            if !shared.running.load(Ordering::SeqCst) {
                return;
            }

            // Pop only if this entry is still at the head; a cancellation
            // may have removed it while we slept.
            let popped = {
                let mut queue = shared.queue.lock();
                match queue.front() {
                    Some(front) if front.key == entry.key && front.enqueued == entry.enqueued => {
                        queue.pop_front()
                    }
                    _ => None,
                }
            };
            let Some(entry) = popped else { continue };

            // The network call happens with no lock held.
            match client.delete(&bucket, &entry.key).await {
                Ok(()) => {
                    tracing::debug!(bucket, key = %entry.key, "deferred delete done");
                }
                Err(e) if e.is_not_found() => {}
                Err(e) => {
                    tracing::warn!(bucket, key = %entry.key, error = %e, "deferred delete failed");
                }
            }
        }
    }

    /// Queue a destination-bucket key for deletion after the delay.
    pub fn enqueue(&self, key: &str, file_number: Option<u64>) {
        self.shared.queue.lock().push_back(PendingDelete {
            enqueued: Instant::now(),
            key: key.to_string(),
            file_number,
        });
        self.shared.notify.notify_one();
    }

    /// Cancel the pending deletion of a file that is referenced again.
    /// Returns whether an entry was removed.
    pub fn remove(&self, file_number: u64) -> bool {
        let mut queue = self.shared.queue.lock();
        let before = queue.len();
        queue.retain(|e| e.file_number != Some(file_number));
        let removed = queue.len() != before;
        drop(queue);
        if removed {
            self.shared.notify.notify_one();
        }
        removed
    }

    pub fn pending(&self) -> usize {
        self.shared.queue.lock().len()
    }

    /// Override the deletion delay. Applies to queued entries too.
    pub fn set_delay(&self, delay: Duration) {
        *self.shared.delay.lock() = delay;
        self.shared.notify.notify_one();
    }

    /// Stop the worker without draining the queue and wait for it to exit.
    pub async fn shutdown(&self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.shared.notify.notify_one();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}
