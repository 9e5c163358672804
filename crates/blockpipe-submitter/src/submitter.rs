//! The I/O submitter: routing, merging and lifecycle of the worker pool.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::block::Pbn;
use crate::config::SubmitterConfig;
use crate::error::{SubmitterError, SubmitterResult};
use crate::request::{Bio, IoClass, Request, RequestIdGen};
use crate::routing::{Rotor, Routing};
use crate::stats::{SubmitterStats, SubmitterStatsSnapshot};
use crate::transport::BlockTransport;
use crate::worker::{reject_bios, MergeKind, WorkItem, WorkKind, WorkerDump, WorkerHandle};

/// State shared by the submitter and every worker.
pub(crate) struct SubmitterShared<T: BlockTransport> {
    pub(crate) config: SubmitterConfig,
    pub(crate) routing: Routing,
    pub(crate) stats: Arc<SubmitterStats>,
    pub(crate) transport: Arc<T>,
}

/// What happened to a submitted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitOutcome {
    /// Joined a group that is already queued.
    Merged(MergeKind),
    /// Queued on its worker.
    Queued,
    /// Refused because the submitter is shutting down; its completion got
    /// [`SubmitterError::ShuttingDown`].
    Rejected,
}

impl SubmitOutcome {
    /// Whether the request joined an existing group.
    pub fn is_merged(&self) -> bool {
        matches!(self, SubmitOutcome::Merged(_))
    }
}

/// Diagnostic view of the whole submitter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitterDump {
    /// Whether new requests are accepted.
    pub accepting: bool,
    /// Routing geometry.
    pub routing: Routing,
    /// Per-worker state, by index.
    pub workers: Vec<WorkerDump>,
    /// Counters at dump time.
    pub stats: SubmitterStatsSnapshot,
}

impl fmt::Display for SubmitterDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "submitter: accepting={}, workers={}, rotation_interval={}",
            self.accepting,
            self.routing.worker_count(),
            self.routing.rotation_interval()
        )?;
        for worker in &self.workers {
            writeln!(f, "  {}", worker)?;
        }
        Ok(())
    }
}

/// Routes block I/O to a fixed pool of submission workers.
///
/// Requests with PBN affinity always reach the worker that owns their PBN;
/// flushes and generic tasks are spread by a rotor. Adjacent data requests on
/// one worker are merged into a single group and submitted together in
/// ascending sector order inside the worker's batching scope.
pub struct IoSubmitter<T: BlockTransport> {
    shared: Arc<SubmitterShared<T>>,
    workers: Vec<WorkerHandle<T>>,
    rotor: Rotor,
    ids: RequestIdGen,
    accepting: AtomicBool,
}

impl<T: BlockTransport> IoSubmitter<T> {
    /// Creates the submitter and starts one named thread per worker.
    ///
    /// On failure every worker created so far is stopped and freed, newest
    /// first, before the error is returned.
    pub fn new(config: SubmitterConfig, transport: Arc<T>) -> SubmitterResult<Self> {
        config.validate()?;
        let routing = Routing::new(config.worker_count, config.rotation_interval)?;
        info!(
            "Creating bio submitter: prefix={}, workers={}, rotation_interval={}, map_capacity={:?}",
            config.thread_name_prefix,
            config.worker_count,
            config.rotation_interval,
            config.map_capacity()
        );

        let shared = Arc::new(SubmitterShared {
            config,
            routing,
            stats: Arc::new(SubmitterStats::new()),
            transport,
        });

        let count = routing.worker_count() as usize;
        let mut workers = Vec::with_capacity(count);
        for index in 0..count {
            match WorkerHandle::spawn(&shared, index) {
                Ok(handle) => workers.push(handle),
                Err(e) => {
                    error!("Bio queue {} initialization failed: {}", index, e);
                    release_workers(workers);
                    return Err(e);
                }
            }
        }

        Ok(Self {
            shared,
            workers,
            rotor: Rotor::new(routing),
            ids: RequestIdGen::new(),
            accepting: AtomicBool::new(true),
        })
    }

    /// Routes `request` to its worker, merging it into an adjacent group when possible.
    pub fn submit(&self, request: Request) -> SubmitOutcome {
        let id = self.ids.next_id();
        let mut bio = request.into_bio(id, self.shared.config.sectors_per_block);

        if !self.accepting.load(Ordering::Acquire) {
            debug!("Rejecting request {:?}: submitter is stopping", id);
            self.shared.stats.record_rejected(reject_bios([bio]));
            return SubmitOutcome::Rejected;
        }

        if self.shared.config.md_raid5_mode {
            apply_md_raid5_flags(&mut bio);
        }

        let class = bio.class;
        let index = if class.has_pbn_affinity() {
            self.shared.routing.worker_for_pbn(bio.pbn)
        } else {
            self.rotor.next_worker()
        };
        self.shared.stats.record_routed();
        let handle = &self.workers[index];

        if self.shared.config.merge_enabled && class.is_mergeable() {
            let pbn = bio.pbn;
            let report = match handle.merge_or_queue(id, bio, class.priority()) {
                Ok(report) => report,
                Err(bios) => {
                    warn!("Worker {} stopped; rejecting request {:?}", index, id);
                    self.shared.stats.record_rejected(reject_bios(bios));
                    return SubmitOutcome::Rejected;
                }
            };
            if report.insert_failures > 0 {
                warn!(
                    "Bio map on worker {} is full; request {:?} may miss merges",
                    index, id
                );
                self.shared
                    .stats
                    .record_map_insert_failures(report.insert_failures);
            }
            if let Some(kind) = report.kind {
                match kind {
                    MergeKind::Back => self.shared.stats.record_back_merge(),
                    MergeKind::Front => self.shared.stats.record_front_merge(),
                }
                debug!("Request {:?} ({}) merged {:?} on worker {}", id, pbn, kind, index);
                return SubmitOutcome::Merged(kind);
            }
        } else {
            let item = WorkItem {
                target: index,
                kind: WorkKind::Single { bio },
            };
            if let Err(item) = handle.enqueue(item, class.priority()) {
                warn!("Worker {} stopped; rejecting request {:?}", index, id);
                self.shared.stats.record_rejected(handle.reject(item));
                return SubmitOutcome::Rejected;
            }
        }
        debug!("Request {:?} queued on worker {}", id, index);
        SubmitOutcome::Queued
    }

    /// Runs `task` on a worker chosen by the rotor, in `class`'s priority band.
    ///
    /// Returns the worker index.
    pub fn enqueue_work_item<F>(&self, class: IoClass, task: F) -> SubmitterResult<usize>
    where
        F: FnOnce() + Send + 'static,
    {
        if !self.accepting.load(Ordering::Acquire) {
            return Err(SubmitterError::ShuttingDown);
        }
        let index = self.rotor.next_worker();
        let item = WorkItem {
            target: index,
            kind: WorkKind::Task {
                task: Box::new(task),
            },
        };
        self.workers[index]
            .enqueue(item, class.priority())
            .map_err(|_| SubmitterError::ShuttingDown)?;
        self.shared.stats.record_task();
        Ok(index)
    }

    /// First shutdown phase: refuses new work, then drains and joins every
    /// worker, newest first. Idempotent.
    pub fn stop_accepting(&self) {
        if !self.accepting.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Stopping {} bio submission workers", self.workers.len());
        for handle in self.workers.iter().rev() {
            handle.stop();
        }
        let stats = self.shared.stats.snapshot();
        info!(
            "Bio submission workers stopped: routed={}, submitted={}, merges={}, rejected={}",
            stats.requests_routed,
            stats.bios_submitted,
            stats.merges(),
            stats.rejected
        );
    }

    /// Second shutdown phase: frees every worker's merge state, newest first.
    pub fn destroy(mut self) {
        self.stop_accepting();
        let workers = std::mem::take(&mut self.workers);
        let leftover = release_workers(workers);
        if leftover > 0 {
            warn!("Bio submitter destroyed with {} groups never submitted", leftover);
        }
        info!("Bio submitter destroyed");
    }

    /// Logs and returns the state of every worker.
    pub fn dump_state(&self) -> SubmitterDump {
        let dump = SubmitterDump {
            accepting: self.is_accepting(),
            routing: self.shared.routing,
            workers: self.workers.iter().map(WorkerHandle::dump).collect(),
            stats: self.shared.stats.snapshot(),
        };
        for worker in &dump.workers {
            info!("{}", worker);
        }
        dump
    }

    /// Worker owning `pbn`.
    #[inline]
    pub fn worker_for_pbn(&self, pbn: Pbn) -> usize {
        self.shared.routing.worker_for_pbn(pbn)
    }

    /// Routing geometry.
    pub fn routing(&self) -> Routing {
        self.shared.routing
    }

    /// Number of workers.
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Whether new requests are accepted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    /// Active configuration.
    pub fn config(&self) -> &SubmitterConfig {
        &self.shared.config
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SubmitterStatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// The transport bios are handed to.
    pub fn transport(&self) -> &Arc<T> {
        &self.shared.transport
    }
}

impl<T: BlockTransport> Drop for IoSubmitter<T> {
    fn drop(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.stop_accepting();
        release_workers(std::mem::take(&mut self.workers));
    }
}

impl<T: BlockTransport> fmt::Debug for IoSubmitter<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoSubmitter")
            .field("routing", &self.shared.routing)
            .field("workers", &self.workers.len())
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

/// MD RAID5 prefers unflagged data writes and sync journal writes.
fn apply_md_raid5_flags(bio: &mut Bio) {
    if bio.class.is_data() {
        bio.sync = false;
    } else if bio.class.is_journal() {
        bio.sync = true;
    }
}

/// Stops then frees workers, newest first. Returns the groups left behind.
fn release_workers<T: BlockTransport>(workers: Vec<WorkerHandle<T>>) -> usize {
    workers
        .into_iter()
        .rev()
        .map(|handle| {
            handle.stop();
            handle.release()
        })
        .sum()
}
