//! Submission workers and the adjacency merge algorithm.
//!
//! A worker owns one [`MergeState`] behind a mutex and one work queue. Data
//! bios routed to the worker first try to join a pending group at an adjacent
//! sector; only bios that start a new group are queued. When the worker runs
//! a group's item it detaches the whole group under the lock, then submits
//! every bio head to tail with the lock released.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::adjacency::AdjacencyMap;
use crate::block::{Pbn, Sector};
use crate::error::{SubmitterError, SubmitterResult};
use crate::request::{Bio, MergedGroup, RequestId};
use crate::submitter::SubmitterShared;
use crate::transport::BlockTransport;
use crate::work_queue::{QueuePriority, WorkHandler, WorkQueue, WorkQueueSnapshot, WorkerContext};

/// Which side of an existing group a new bio joined.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MergeKind {
    /// Appended after the group's tail.
    Back,
    /// Prepended before the group's head.
    Front,
}

/// Result of [`MergeState::try_merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    /// Side joined, or `None` if the bio started its own group.
    pub kind: Option<MergeKind>,
    /// Boundary keys the map could not record.
    pub insert_failures: u64,
}

/// Pending groups of one worker and the sector index over their boundaries.
#[derive(Debug)]
pub struct MergeState {
    map: AdjacencyMap<RequestId>,
    groups: HashMap<RequestId, MergedGroup>,
}

impl MergeState {
    /// Allocates the state for `worker` with a map of `capacity` keys.
    pub fn new(worker: usize, capacity: usize) -> SubmitterResult<Self> {
        Ok(Self {
            map: AdjacencyMap::with_capacity(worker, capacity)?,
            groups: HashMap::new(),
        })
    }

    /// Owner of a group `bio` may join on the given side.
    fn mergeable(&self, bio: &Bio, kind: MergeKind, sectors_per_block: u64) -> Option<RequestId> {
        let sector = match kind {
            MergeKind::Back => bio.sector.checked_back(sectors_per_block)?,
            MergeKind::Front => bio.sector.checked_front(sectors_per_block)?,
        };
        let owner = self.map.get(sector)?;
        let group = self.groups.get(&owner)?;
        if group.class() != bio.class || group.direction() != bio.direction {
            return None;
        }
        // The key may be left over from a boundary that has since moved.
        let boundary = match kind {
            MergeKind::Back => group.tail_sector()?,
            MergeKind::Front => group.head_sector()?,
        };
        (boundary == sector).then_some(owner)
    }

    /// Joins `bio` to an adjacent group, or records it as a new group owned by `id`.
    ///
    /// When both neighbours qualify the front merge wins, so a group whose
    /// work item is already queued keeps that item.
    pub fn try_merge(&mut self, id: RequestId, bio: Bio, sectors_per_block: u64) -> MergeReport {
        let prev = self.mergeable(&bio, MergeKind::Back, sectors_per_block);
        let mut next = self.mergeable(&bio, MergeKind::Front, sectors_per_block);
        if prev == next {
            next = None;
        }

        let target = match (prev, next) {
            (_, Some(next)) => Some((next, MergeKind::Front)),
            (Some(prev), None) => Some((prev, MergeKind::Back)),
            (None, None) => None,
        };

        if let Some((owner, kind)) = target {
            if let Some(group) = self.groups.get_mut(&owner) {
                match kind {
                    MergeKind::Back => {
                        if let Some(tail) = group.tail_sector() {
                            self.map.remove_if(tail, owner);
                        }
                        group.append(bio);
                    }
                    MergeKind::Front => {
                        if let Some(head) = group.head_sector() {
                            self.map.remove_if(head, owner);
                        }
                        group.prepend(bio);
                    }
                }
                let head = group.head_sector();
                let tail = group.tail_sector();
                let insert_failures = self.index_boundaries(owner, head, tail);
                return MergeReport {
                    kind: Some(kind),
                    insert_failures,
                };
            }
        }

        let sector = bio.sector;
        self.groups.insert(id, MergedGroup::new(bio));
        // A missing key only costs later merge chances; the group is still queued.
        let insert_failures = u64::from(self.map.insert(sector, id).is_err());
        MergeReport {
            kind: None,
            insert_failures,
        }
    }

    fn index_boundaries(
        &mut self,
        owner: RequestId,
        head: Option<Sector>,
        tail: Option<Sector>,
    ) -> u64 {
        let mut failures = 0;
        for sector in [head, tail].into_iter().flatten() {
            if self.map.insert(sector, owner).is_err() {
                failures += 1;
            }
        }
        failures
    }

    /// Takes `owner`'s group out of the state, dropping both boundary keys.
    pub fn detach(&mut self, owner: RequestId) -> Option<MergedGroup> {
        let group = self.groups.remove(&owner)?;
        if let Some(head) = group.head_sector() {
            self.map.remove_if(head, owner);
        }
        if let Some(tail) = group.tail_sector() {
            self.map.remove_if(tail, owner);
        }
        Some(group)
    }

    /// The pending group owned by `owner`.
    pub fn group(&self, owner: RequestId) -> Option<&MergedGroup> {
        self.groups.get(&owner)
    }

    /// Number of pending groups.
    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    /// The sector index.
    pub fn map(&self) -> &AdjacencyMap<RequestId> {
        &self.map
    }

    /// Checks that every indexed sector is a head or tail of a pending group
    /// it names, and that no key names a group that is gone.
    pub fn boundaries_consistent(&self) -> bool {
        let mut indexed = 0;
        let keys_match = self.groups.iter().all(|(owner, group)| {
            let keys = self.map.keys_for(*owner);
            indexed += keys.len();
            keys.into_iter().all(|sector| {
                Some(sector) == group.head_sector() || Some(sector) == group.tail_sector()
            })
        });
        keys_match && indexed == self.map.len() && self.map.len() <= 2 * self.groups.len()
    }

    /// Drops every pending group and key, returning how many groups were left.
    fn clear(&mut self) -> usize {
        let left = self.groups.len();
        self.groups.clear();
        self.map.clear();
        left
    }
}

/// Lifecycle of a submission worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum WorkerPhase {
    /// Created, no item processed yet
    Idle = 0,
    /// Batching scope open
    Batching = 1,
    /// Thread exited
    Stopped = 2,
}

impl WorkerPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => WorkerPhase::Idle,
            1 => WorkerPhase::Batching,
            _ => WorkerPhase::Stopped,
        }
    }
}

impl fmt::Display for WorkerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkerPhase::Idle => write!(f, "idle"),
            WorkerPhase::Batching => write!(f, "batching"),
            WorkerPhase::Stopped => write!(f, "stopped"),
        }
    }
}

/// What a queued item carries.
pub(crate) enum WorkKind {
    /// Owner of a merge group; the bios live in the worker's merge state.
    Group { owner: RequestId, pbn: Pbn },
    /// A bio submitted on its own.
    Single { bio: Bio },
    /// A task scheduled through the rotor.
    Task { task: Box<dyn FnOnce() + Send> },
}

/// A queued unit of work and the worker it was routed to.
pub(crate) struct WorkItem {
    pub(crate) target: usize,
    pub(crate) kind: WorkKind,
}

impl WorkItem {
    /// PBN that chose this item's worker, if it was routed by PBN.
    fn routing_pbn(&self) -> Option<Pbn> {
        match &self.kind {
            WorkKind::Group { pbn, .. } => Some(*pbn),
            WorkKind::Single { bio } if bio.class.has_pbn_affinity() => Some(bio.pbn),
            _ => None,
        }
    }
}

/// One submission worker: merge state, lock and batching scope.
pub(crate) struct SubmissionWorker<T: BlockTransport> {
    index: usize,
    name: String,
    state: Mutex<MergeState>,
    phase: AtomicU8,
    shared: Arc<SubmitterShared<T>>,
}

impl<T: BlockTransport> SubmissionWorker<T> {
    fn new(index: usize, shared: Arc<SubmitterShared<T>>) -> SubmitterResult<Self> {
        let capacity = shared
            .config
            .map_capacity()
            .ok_or_else(|| SubmitterError::InvalidConfig {
                reason: "max_requests_active is too large".to_string(),
            })?;
        let state = MergeState::new(index, capacity).map_err(|e| {
            error!("Bio map initialization failed for worker {}: {}", index, e);
            e
        })?;
        Ok(Self {
            index,
            name: format!("{}bioQ{}", shared.config.thread_name_prefix, index),
            state: Mutex::new(state),
            phase: AtomicU8::new(WorkerPhase::Idle as u8),
            shared,
        })
    }

    pub(crate) fn detach(&self, owner: RequestId) -> Option<MergedGroup> {
        self.state.lock().detach(owner)
    }

    fn phase(&self) -> WorkerPhase {
        WorkerPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: WorkerPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    fn assert_affinity(&self, ctx: &WorkerContext, item: &WorkItem) {
        let current = std::thread::current();
        let thread = current.name().unwrap_or("<unnamed>");
        if thread != self.name || ctx.index != self.index || item.target != self.index {
            error!(
                "Work item for worker {} delivered to thread {} (worker {})",
                item.target, thread, self.index
            );
            panic!(
                "work item for worker {} delivered to thread {} (worker {})",
                item.target, thread, self.index
            );
        }
        if let Some(pbn) = item.routing_pbn() {
            let expected = self.shared.routing.worker_for_pbn(pbn);
            if expected != self.index {
                error!(
                    "Running in wrong bio queue ({} vs {}) for {}",
                    self.index, expected, pbn
                );
                panic!(
                    "running in wrong bio queue ({} vs {}) for {}",
                    self.index, expected, pbn
                );
            }
        }
    }

    fn send_to_device(&self, mut bio: Bio) {
        bio.device = Some(self.shared.config.device());
        self.shared.stats.record_submitted(&bio);
        let stats = Arc::clone(&self.shared.stats);
        let (class, direction, sync) = (bio.class, bio.direction, bio.sync);
        bio.chain_completion(move |result| {
            stats.record_completed(class, direction, sync, result.is_ok());
        });
        debug!(
            "Submitting bio: id={:?}, {}, sector={}, class={}, worker={}",
            bio.id, bio.pbn, bio.sector.0, bio.class, self.index
        );
        self.shared.transport.submit(self.index, bio);
    }
}

impl<T: BlockTransport> WorkHandler<WorkItem> for SubmissionWorker<T> {
    fn start(&self, _ctx: &WorkerContext) {
        self.shared.transport.start_plug(self.index);
        self.set_phase(WorkerPhase::Batching);
        debug!("{} opened batching scope", self.name);
    }

    fn process(&self, ctx: &WorkerContext, item: WorkItem) {
        self.assert_affinity(ctx, &item);
        match item.kind {
            WorkKind::Group { owner, .. } => {
                // Merges may have grown the group since it was queued.
                let group = self.detach(owner);
                match group {
                    Some(group) => {
                        debug!(
                            "{} submitting group of {} owned by {:?}",
                            self.name,
                            group.len(),
                            owner
                        );
                        for bio in group.into_bios() {
                            self.send_to_device(bio);
                        }
                    }
                    None => debug!("{} found group {:?} already detached", self.name, owner),
                }
            }
            WorkKind::Single { bio } => self.send_to_device(bio),
            WorkKind::Task { task } => task(),
        }
    }

    fn finish(&self, _ctx: &WorkerContext) {
        self.shared.transport.finish_plug(self.index);
        self.set_phase(WorkerPhase::Stopped);
        debug!("{} closed batching scope", self.name);
    }
}

/// Diagnostic view of one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerDump {
    /// Worker index.
    pub index: usize,
    /// Lifecycle phase.
    pub phase: WorkerPhase,
    /// Groups waiting for their work item.
    pub pending_groups: usize,
    /// Indexed sectors.
    pub map_entries: usize,
    /// Map capacity.
    pub map_capacity: usize,
    /// Queue state.
    pub queue: WorkQueueSnapshot,
}

impl fmt::Display for WorkerDump {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}]: queued low={} medium={} high={}, groups={}, map={}/{}, processed={}",
            self.queue.name,
            self.phase,
            self.queue.pending[QueuePriority::Low.as_index()],
            self.queue.pending[QueuePriority::Medium.as_index()],
            self.queue.pending[QueuePriority::High.as_index()],
            self.pending_groups,
            self.map_entries,
            self.map_capacity,
            self.queue.stats.total_processed()
        )
    }
}

/// Completes each bio with `ShuttingDown`. Returns how many.
pub(crate) fn reject_bios(bios: impl IntoIterator<Item = Bio>) -> u64 {
    let mut count = 0;
    for bio in bios {
        bio.reject();
        count += 1;
    }
    count
}

/// A worker together with the queue thread that drives it.
pub(crate) struct WorkerHandle<T: BlockTransport> {
    pub(crate) worker: Arc<SubmissionWorker<T>>,
    queue: WorkQueue<WorkItem>,
}

impl<T: BlockTransport> WorkerHandle<T> {
    pub(crate) fn spawn(shared: &Arc<SubmitterShared<T>>, index: usize) -> SubmitterResult<Self> {
        let worker = Arc::new(SubmissionWorker::new(index, Arc::clone(shared))?);
        let queue = WorkQueue::spawn(worker.name.clone(), index, Arc::clone(&worker))?;
        Ok(Self { worker, queue })
    }

    pub(crate) fn enqueue(&self, item: WorkItem, priority: QueuePriority) -> Result<(), WorkItem> {
        self.queue.enqueue(item, priority)
    }

    /// Joins `bio` to an adjacent group, or starts a group owned by `id` and
    /// queues its item.
    ///
    /// A new group is queued before the state lock is released, so no other
    /// bio can join a group whose item the queue then refuses. On refusal
    /// the group is taken back out and its bios are returned.
    pub(crate) fn merge_or_queue(
        &self,
        id: RequestId,
        bio: Bio,
        priority: QueuePriority,
    ) -> Result<MergeReport, VecDeque<Bio>> {
        let pbn = bio.pbn;
        let sectors_per_block = self.worker.shared.config.sectors_per_block;
        let mut state = self.worker.state.lock();
        let report = state.try_merge(id, bio, sectors_per_block);
        if report.kind.is_some() {
            return Ok(report);
        }
        let item = WorkItem {
            target: self.worker.index,
            kind: WorkKind::Group { owner: id, pbn },
        };
        match self.queue.enqueue(item, priority) {
            Ok(()) => Ok(report),
            Err(_) => Err(state
                .detach(id)
                .map(MergedGroup::into_bios)
                .unwrap_or_default()),
        }
    }

    /// Fails every bio carried by an item the queue refused. Returns how many.
    pub(crate) fn reject(&self, item: WorkItem) -> u64 {
        match item.kind {
            WorkKind::Group { owner, .. } => self
                .worker
                .detach(owner)
                .map_or(0, |group| reject_bios(group.into_bios())),
            WorkKind::Single { bio } => reject_bios([bio]),
            WorkKind::Task { .. } => 0,
        }
    }

    /// Stops accepting items, drains the queue and joins the thread.
    pub(crate) fn stop(&self) {
        self.queue.finish();
        self.worker.set_phase(WorkerPhase::Stopped);
    }

    /// Frees the merge state. Returns the number of groups still pending.
    pub(crate) fn release(self) -> usize {
        let left = self.worker.state.lock().clear();
        if left > 0 {
            warn!("{} released with {} pending groups", self.worker.name, left);
        }
        left
    }

    pub(crate) fn dump(&self) -> WorkerDump {
        let (pending_groups, map_entries, map_capacity) = {
            let state = self.worker.state.lock();
            (state.group_count(), state.map().len(), state.map().capacity())
        };
        WorkerDump {
            index: self.worker.index,
            phase: self.worker.phase(),
            pending_groups,
            map_entries,
            map_capacity,
            queue: self.queue.snapshot(),
        }
    }
}
