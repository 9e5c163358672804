//! Single-thread priority work queue.
//!
//! Each submission worker runs on one of these: a named OS thread draining a
//! three-band queue, highest band first and FIFO within a band. The handler
//! receives the queue's own [`WorkerContext`] with every item so it can check
//! it is running where the item was routed.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::error::{SubmitterError, SubmitterResult};

/// Queue band. Higher bands are always drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum QueuePriority {
    /// Bulk data, compressed data, read cache
    Low = 0,
    /// Metadata, journal, block map, verify
    Medium = 1,
    /// Flushes and latency-sensitive I/O
    High = 2,
}

impl QueuePriority {
    /// Number of bands.
    pub const COUNT: usize = 3;

    /// Returns the band index (0-2).
    #[inline]
    pub fn as_index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for QueuePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QueuePriority::Low => write!(f, "Low"),
            QueuePriority::Medium => write!(f, "Medium"),
            QueuePriority::High => write!(f, "High"),
        }
    }
}

/// Identity of the queue delivering an item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerContext {
    /// Worker index within its submitter.
    pub index: usize,
    /// Thread name.
    pub name: String,
}

/// Callbacks run on the queue's thread.
pub trait WorkHandler<T>: Send + Sync + 'static {
    /// Runs once, just before the first item is processed.
    fn start(&self, _ctx: &WorkerContext) {}

    /// Processes one item.
    fn process(&self, ctx: &WorkerContext, item: T);

    /// Runs once when the thread exits, if `start` ran.
    fn finish(&self, _ctx: &WorkerContext) {}
}

/// Counters for one work queue.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkQueueStats {
    /// Items accepted per band [Low, Medium, High].
    pub enqueued: [u64; QueuePriority::COUNT],
    /// Items handed to the handler per band.
    pub processed: [u64; QueuePriority::COUNT],
    /// Items refused because the queue was stopping.
    pub rejected: u64,
    /// Longest queue seen.
    pub max_queue_length: usize,
    /// Sum of time items spent waiting, in microseconds.
    pub total_wait_us: u64,
    /// Longest wait, in microseconds.
    pub max_wait_us: u64,
}

impl WorkQueueStats {
    fn record_wait(&mut self, waited: Duration) {
        let us = waited.as_micros().min(u128::from(u64::MAX)) as u64;
        self.total_wait_us = self.total_wait_us.saturating_add(us);
        self.max_wait_us = self.max_wait_us.max(us);
    }

    /// Total items processed.
    pub fn total_processed(&self) -> u64 {
        self.processed.iter().sum()
    }
}

/// Read-only view of a queue for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkQueueSnapshot {
    /// Thread name.
    pub name: String,
    /// Items waiting per band [Low, Medium, High].
    pub pending: [usize; QueuePriority::COUNT],
    /// Whether the queue still accepts items.
    pub accepting: bool,
    /// Counters.
    pub stats: WorkQueueStats,
}

impl WorkQueueSnapshot {
    /// Items waiting across all bands.
    pub fn pending_total(&self) -> usize {
        self.pending.iter().sum()
    }
}

struct Queued<T> {
    item: T,
    enqueued_at: Instant,
}

struct QueueInner<T> {
    bands: [VecDeque<Queued<T>>; QueuePriority::COUNT],
    stopping: bool,
    stats: WorkQueueStats,
}

impl<T> QueueInner<T> {
    fn len(&self) -> usize {
        self.bands.iter().map(|b| b.len()).sum()
    }

    fn pop_highest(&mut self) -> Option<Queued<T>> {
        for idx in (0..QueuePriority::COUNT).rev() {
            if let Some(queued) = self.bands[idx].pop_front() {
                self.stats.processed[idx] += 1;
                self.stats.record_wait(queued.enqueued_at.elapsed());
                return Some(queued);
            }
        }
        None
    }
}

struct QueueShared<T> {
    inner: Mutex<QueueInner<T>>,
    available: Condvar,
}

/// A named thread draining a priority queue into a [`WorkHandler`].
pub struct WorkQueue<T> {
    ctx: WorkerContext,
    shared: Arc<QueueShared<T>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Send + 'static> WorkQueue<T> {
    /// Starts the queue thread.
    pub fn spawn<H: WorkHandler<T>>(
        name: String,
        index: usize,
        handler: Arc<H>,
    ) -> SubmitterResult<Self> {
        let shared = Arc::new(QueueShared {
            inner: Mutex::new(QueueInner {
                bands: [VecDeque::new(), VecDeque::new(), VecDeque::new()],
                stopping: false,
                stats: WorkQueueStats::default(),
            }),
            available: Condvar::new(),
        });
        let ctx = WorkerContext { index, name };

        let thread = {
            let shared = Arc::clone(&shared);
            let thread_ctx = ctx.clone();
            std::thread::Builder::new()
                .name(ctx.name.clone())
                .spawn(move || run(shared, thread_ctx, handler))
                .map_err(|source| SubmitterError::ThreadSpawn {
                    name: ctx.name.clone(),
                    source,
                })?
        };

        debug!("Started work queue {}", ctx.name);
        Ok(Self {
            ctx,
            shared,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queues an item. Hands the item back if the queue is stopping.
    pub fn enqueue(&self, item: T, priority: QueuePriority) -> Result<(), T> {
        let mut inner = self.shared.inner.lock();
        if inner.stopping {
            inner.stats.rejected += 1;
            return Err(item);
        }
        inner.bands[priority.as_index()].push_back(Queued {
            item,
            enqueued_at: Instant::now(),
        });
        inner.stats.enqueued[priority.as_index()] += 1;
        let len = inner.len();
        inner.stats.max_queue_length = inner.stats.max_queue_length.max(len);
        drop(inner);

        self.shared.available.notify_one();
        Ok(())
    }

    /// Stops accepting items, drains what is queued and joins the thread.
    ///
    /// Idempotent; later calls return immediately.
    pub fn finish(&self) {
        {
            let mut inner = self.shared.inner.lock();
            inner.stopping = true;
        }
        self.shared.available.notify_all();

        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Work queue {} thread panicked", self.ctx.name);
            } else {
                info!("Work queue {} finished", self.ctx.name);
            }
        }
    }

    /// Whether the queue still accepts items.
    pub fn is_accepting(&self) -> bool {
        !self.shared.inner.lock().stopping
    }

    /// Copies the queue state without changing it.
    pub fn snapshot(&self) -> WorkQueueSnapshot {
        let inner = self.shared.inner.lock();
        WorkQueueSnapshot {
            name: self.ctx.name.clone(),
            pending: [
                inner.bands[0].len(),
                inner.bands[1].len(),
                inner.bands[2].len(),
            ],
            accepting: !inner.stopping,
            stats: inner.stats.clone(),
        }
    }

    /// Identity passed to the handler.
    pub fn context(&self) -> &WorkerContext {
        &self.ctx
    }
}

impl<T> Drop for WorkQueue<T> {
    fn drop(&mut self) {
        self.shared.inner.lock().stopping = true;
        self.shared.available.notify_all();
        if let Some(handle) = self.thread.get_mut().take() {
            let _ = handle.join();
        }
    }
}

fn run<T, H: WorkHandler<T>>(shared: Arc<QueueShared<T>>, ctx: WorkerContext, handler: Arc<H>) {
    let mut started = false;
    loop {
        let next = {
            let mut inner = shared.inner.lock();
            loop {
                if let Some(queued) = inner.pop_highest() {
                    break Some(queued);
                }
                if inner.stopping {
                    break None;
                }
                shared.available.wait(&mut inner);
            }
        };
        let Some(queued) = next else {
            break;
        };
        if !started {
            handler.start(&ctx);
            started = true;
        }
        handler.process(&ctx, queued.item);
    }
    if started {
        handler.finish(&ctx);
    }
    debug!("Work queue {} thread exiting", ctx.name);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(usize, u32)>>,
        hooks: Mutex<Vec<&'static str>>,
    }

    impl WorkHandler<u32> for Recorder {
        fn start(&self, _ctx: &WorkerContext) {
            self.hooks.lock().push("start");
        }

        fn process(&self, ctx: &WorkerContext, item: u32) {
            self.seen.lock().push((ctx.index, item));
        }

        fn finish(&self, _ctx: &WorkerContext) {
            self.hooks.lock().push("finish");
        }
    }

    struct Gated {
        gate: Mutex<Option<mpsc::Receiver<()>>>,
        seen: Mutex<Vec<u32>>,
    }

    impl WorkHandler<u32> for Gated {
        fn process(&self, _ctx: &WorkerContext, item: u32) {
            if item == 0 {
                if let Some(rx) = self.gate.lock().take() {
                    let _ = rx.recv();
                }
            }
            self.seen.lock().push(item);
        }
    }

    #[test]
    fn test_priority_as_index() {
        assert_eq!(QueuePriority::Low.as_index(), 0);
        assert_eq!(QueuePriority::Medium.as_index(), 1);
        assert_eq!(QueuePriority::High.as_index(), 2);
        assert!(QueuePriority::High > QueuePriority::Low);
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", QueuePriority::Low), "Low");
        assert_eq!(format!("{}", QueuePriority::Medium), "Medium");
        assert_eq!(format!("{}", QueuePriority::High), "High");
    }

    #[test]
    fn test_items_processed_with_context() {
        let handler = Arc::new(Recorder::default());
        let queue = WorkQueue::spawn("testQ3".to_string(), 3, Arc::clone(&handler)).unwrap();
        queue.enqueue(10, QueuePriority::Low).unwrap();
        queue.enqueue(11, QueuePriority::Low).unwrap();
        queue.finish();

        assert_eq!(*handler.seen.lock(), vec![(3, 10), (3, 11)]);
        assert_eq!(*handler.hooks.lock(), vec!["start", "finish"]);
    }

    #[test]
    fn test_hooks_skipped_without_items() {
        let handler = Arc::new(Recorder::default());
        let queue = WorkQueue::spawn("idleQ".to_string(), 0, Arc::clone(&handler)).unwrap();
        queue.finish();
        assert!(handler.hooks.lock().is_empty());
    }

    #[test]
    fn test_bands_drain_high_first() {
        let (tx, rx) = mpsc::channel();
        let handler = Arc::new(Gated {
            gate: Mutex::new(Some(rx)),
            seen: Mutex::new(Vec::new()),
        });
        let queue = WorkQueue::spawn("gateQ".to_string(), 0, Arc::clone(&handler)).unwrap();

        // Item 0 blocks the thread while the rest pile up.
        queue.enqueue(0, QueuePriority::High).unwrap();
        queue.enqueue(1, QueuePriority::Low).unwrap();
        queue.enqueue(2, QueuePriority::Medium).unwrap();
        queue.enqueue(3, QueuePriority::High).unwrap();
        queue.enqueue(4, QueuePriority::Low).unwrap();
        tx.send(()).unwrap();
        queue.finish();

        assert_eq!(*handler.seen.lock(), vec![0, 3, 2, 1, 4]);
    }

    #[test]
    fn test_enqueue_after_finish_returns_item() {
        let handler = Arc::new(Recorder::default());
        let queue = WorkQueue::spawn("doneQ".to_string(), 0, handler).unwrap();
        queue.finish();
        assert!(!queue.is_accepting());
        assert_eq!(queue.enqueue(5, QueuePriority::High), Err(5));
        assert_eq!(queue.snapshot().stats.rejected, 1);
    }

    #[test]
    fn test_finish_is_idempotent() {
        let handler = Arc::new(Recorder::default());
        let queue = WorkQueue::spawn("twiceQ".to_string(), 0, handler).unwrap();
        queue.finish();
        queue.finish();
    }

    #[test]
    fn test_snapshot_counts() {
        let (tx, rx) = mpsc::channel();
        let handler = Arc::new(Gated {
            gate: Mutex::new(Some(rx)),
            seen: Mutex::new(Vec::new()),
        });
        let queue = WorkQueue::spawn("snapQ".to_string(), 0, Arc::clone(&handler)).unwrap();
        queue.enqueue(0, QueuePriority::High).unwrap();
        queue.enqueue(1, QueuePriority::Low).unwrap();
        queue.enqueue(2, QueuePriority::Low).unwrap();

        let snap = queue.snapshot();
        assert_eq!(snap.name, "snapQ");
        assert!(snap.accepting);
        assert_eq!(snap.stats.enqueued, [2, 0, 1]);
        assert!(snap.pending[0] >= 1);

        tx.send(()).unwrap();
        queue.finish();
        let snap = queue.snapshot();
        assert_eq!(snap.pending_total(), 0);
        assert_eq!(snap.stats.total_processed(), 3);
        assert!(snap.stats.max_queue_length >= 2);
    }

    #[test]
    fn test_thread_is_named() {
        struct NameCheck(Mutex<Option<String>>);
        impl WorkHandler<()> for NameCheck {
            fn process(&self, _ctx: &WorkerContext, _item: ()) {
                *self.0.lock() = std::thread::current().name().map(str::to_string);
            }
        }

        let handler = Arc::new(NameCheck(Mutex::new(None)));
        let queue = WorkQueue::spawn("namedbioQ1".to_string(), 1, Arc::clone(&handler)).unwrap();
        queue.enqueue((), QueuePriority::Low).unwrap();
        queue.finish();
        assert_eq!(handler.0.lock().as_deref(), Some("namedbioQ1"));
    }
}
