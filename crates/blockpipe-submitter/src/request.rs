//! Requests, bios and merged bio groups.
//!
//! A [`Request`] is what upper layers hand to the submitter. Once accepted it
//! becomes a [`Bio`] carrying its own completion continuation. Data bios that
//! sit on the same worker at adjacent sectors are collected into a
//! [`MergedGroup`] and submitted together, lowest sector first.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::block::{DeviceId, IoDirection, Pbn, Sector};
use crate::error::{SubmitterError, SubmitterResult};
use crate::work_queue::QueuePriority;

/// Identifier assigned to every request the submitter accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Atomic counter for generating unique request IDs.
#[derive(Debug)]
pub struct RequestIdGen {
    next: AtomicU64,
}

impl RequestIdGen {
    /// Create a new ID generator starting from 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Generate the next unique request ID.
    pub fn next_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Category of a request; selects its queue band, merge eligibility and counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoClass {
    /// User data block
    Data,
    /// Compressed data block written by the packer
    CompressedData,
    /// Generic metadata
    Metadata,
    /// Recovery journal block
    Journal,
    /// Slab journal block
    SlabJournal,
    /// Block map page
    BlockMap,
    /// Cache flush, no PBN affinity
    Flush,
    /// Latency-sensitive I/O
    HighPriority,
    /// Read cache fill
    ReadCache,
    /// Dedupe verification read
    Verify,
}

impl IoClass {
    /// Queue band for this class.
    pub fn priority(self) -> QueuePriority {
        match self {
            IoClass::Flush | IoClass::HighPriority => QueuePriority::High,
            IoClass::Metadata
            | IoClass::Journal
            | IoClass::SlabJournal
            | IoClass::BlockMap
            | IoClass::Verify => QueuePriority::Medium,
            IoClass::Data | IoClass::CompressedData | IoClass::ReadCache => QueuePriority::Low,
        }
    }

    /// Only plain data bios take part in adjacency merging.
    #[inline]
    pub fn is_mergeable(self) -> bool {
        matches!(self, IoClass::Data)
    }

    /// User data, compressed or not.
    #[inline]
    pub fn is_data(self) -> bool {
        matches!(self, IoClass::Data | IoClass::CompressedData)
    }

    /// Whether requests of this class are routed by PBN rather than by the rotor.
    #[inline]
    pub fn has_pbn_affinity(self) -> bool {
        !matches!(self, IoClass::Flush)
    }

    /// Whether this class is journal traffic (recovery or slab journal).
    #[inline]
    pub fn is_journal(self) -> bool {
        matches!(self, IoClass::Journal | IoClass::SlabJournal)
    }

    /// Work item action name used in queue dumps.
    pub fn action_name(self) -> &'static str {
        match self {
            IoClass::Data => "bio_data",
            IoClass::CompressedData => "bio_compressed_data",
            IoClass::Metadata => "bio_metadata",
            IoClass::Journal => "bio_journal",
            IoClass::SlabJournal => "bio_slab_journal",
            IoClass::BlockMap => "bio_block_map",
            IoClass::Flush => "bio_flush",
            IoClass::HighPriority => "bio_high",
            IoClass::ReadCache => "bio_readcache",
            IoClass::Verify => "bio_verify",
        }
    }
}

impl fmt::Display for IoClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.action_name())
    }
}

/// Result delivered to a bio's completion continuation.
pub type BioResult = SubmitterResult<()>;

/// Continuation invoked exactly once when the transport finishes a bio.
pub type CompletionCallback = Box<dyn FnOnce(BioResult) + Send + 'static>;

/// Receiving end of a channel-backed completion, see [`Request::with_channel`].
pub type CompletionReceiver = oneshot::Receiver<BioResult>;

/// A block I/O request as handed over by upper layers.
pub struct Request {
    pbn: Pbn,
    class: IoClass,
    direction: IoDirection,
    sync: bool,
    on_complete: Option<CompletionCallback>,
}

impl Request {
    /// Creates a request with no completion continuation.
    pub fn new(pbn: Pbn, class: IoClass, direction: IoDirection) -> Self {
        Self {
            pbn,
            class,
            direction,
            sync: false,
            on_complete: None,
        }
    }

    /// Sets the synchronous-I/O flag.
    pub fn with_sync(mut self, sync: bool) -> Self {
        self.sync = sync;
        self
    }

    /// Registers the completion continuation.
    pub fn on_complete<F>(mut self, callback: F) -> Self
    where
        F: FnOnce(BioResult) + Send + 'static,
    {
        self.on_complete = Some(Box::new(callback));
        self
    }

    /// Registers a one-shot channel as the completion continuation.
    pub fn with_channel(self) -> (Self, CompletionReceiver) {
        let (tx, rx) = oneshot::channel();
        let request = self.on_complete(move |result| {
            // The receiver may have been dropped; nobody is waiting then.
            let _ = tx.send(result);
        });
        (request, rx)
    }

    /// Physical block number.
    pub fn pbn(&self) -> Pbn {
        self.pbn
    }

    /// Request class.
    pub fn class(&self) -> IoClass {
        self.class
    }

    /// Data direction.
    pub fn direction(&self) -> IoDirection {
        self.direction
    }

    /// Converts into a bio starting at the block's first sector.
    pub fn into_bio(self, id: RequestId, sectors_per_block: u64) -> Bio {
        Bio {
            id,
            pbn: self.pbn,
            sector: self.pbn.start_sector(sectors_per_block),
            class: self.class,
            direction: self.direction,
            sync: self.sync,
            device: None,
            completion: self.on_complete,
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("pbn", &self.pbn)
            .field("class", &self.class)
            .field("direction", &self.direction)
            .field("sync", &self.sync)
            .field("has_callback", &self.on_complete.is_some())
            .finish()
    }
}

/// An accepted request, ready for the transport.
pub struct Bio {
    /// Request identifier.
    pub id: RequestId,
    /// Physical block number.
    pub pbn: Pbn,
    /// Starting device sector.
    pub sector: Sector,
    /// Request class.
    pub class: IoClass,
    /// Data direction.
    pub direction: IoDirection,
    /// Synchronous-I/O flag.
    pub sync: bool,
    /// Target device, attached just before transport submission.
    pub device: Option<DeviceId>,
    completion: Option<CompletionCallback>,
}

impl Bio {
    /// Runs the completion continuation, consuming the bio.
    pub fn complete(mut self, result: BioResult) {
        if let Some(callback) = self.completion.take() {
            callback(result);
        }
    }

    /// Runs `hook` ahead of the existing continuation.
    pub(crate) fn chain_completion<F>(&mut self, hook: F)
    where
        F: FnOnce(&BioResult) + Send + 'static,
    {
        let inner = self.completion.take();
        self.completion = Some(Box::new(move |result: BioResult| {
            hook(&result);
            if let Some(callback) = inner {
                callback(result);
            }
        }));
    }

    /// Fails the bio because the submitter no longer accepts work.
    pub(crate) fn reject(self) {
        self.complete(Err(SubmitterError::ShuttingDown));
    }
}

impl fmt::Debug for Bio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bio")
            .field("id", &self.id)
            .field("pbn", &self.pbn)
            .field("sector", &self.sector)
            .field("class", &self.class)
            .field("direction", &self.direction)
            .field("sync", &self.sync)
            .field("device", &self.device)
            .finish()
    }
}

/// Contiguous run of same-class, same-direction bios, ordered by sector.
#[derive(Debug)]
pub struct MergedGroup {
    class: IoClass,
    direction: IoDirection,
    bios: VecDeque<Bio>,
}

impl MergedGroup {
    /// Starts a group holding a single bio.
    pub fn new(bio: Bio) -> Self {
        let mut bios = VecDeque::with_capacity(1);
        let class = bio.class;
        let direction = bio.direction;
        bios.push_back(bio);
        Self {
            class,
            direction,
            bios,
        }
    }

    /// Class shared by every bio in the group.
    pub fn class(&self) -> IoClass {
        self.class
    }

    /// Direction shared by every bio in the group.
    pub fn direction(&self) -> IoDirection {
        self.direction
    }

    /// Sector of the first bio.
    pub fn head_sector(&self) -> Option<Sector> {
        self.bios.front().map(|bio| bio.sector)
    }

    /// Sector of the last bio.
    pub fn tail_sector(&self) -> Option<Sector> {
        self.bios.back().map(|bio| bio.sector)
    }

    /// Number of bios in the group.
    pub fn len(&self) -> usize {
        self.bios.len()
    }

    /// True once every bio has been taken out.
    pub fn is_empty(&self) -> bool {
        self.bios.is_empty()
    }

    /// Adds a bio after the current tail.
    pub fn append(&mut self, bio: Bio) {
        self.bios.push_back(bio);
    }

    /// Adds a bio before the current head.
    pub fn prepend(&mut self, bio: Bio) {
        self.bios.push_front(bio);
    }

    /// Bio sectors from head to tail.
    pub fn sectors(&self) -> Vec<Sector> {
        self.bios.iter().map(|bio| bio.sector).collect()
    }

    /// Consumes the group, yielding bios head to tail.
    pub fn into_bios(self) -> VecDeque<Bio> {
        self.bios
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn data_bio(id: u64, pbn: u64) -> Bio {
        Request::new(Pbn(pbn), IoClass::Data, IoDirection::Write).into_bio(RequestId(id), 1)
    }

    #[test]
    fn test_request_id_gen() {
        let gen = RequestIdGen::new();
        assert_eq!(gen.next_id(), RequestId(1));
        assert_eq!(gen.next_id(), RequestId(2));
        assert_eq!(gen.next_id(), RequestId(3));
    }

    #[test]
    fn test_class_priorities() {
        assert_eq!(IoClass::Flush.priority(), QueuePriority::High);
        assert_eq!(IoClass::HighPriority.priority(), QueuePriority::High);
        assert_eq!(IoClass::Metadata.priority(), QueuePriority::Medium);
        assert_eq!(IoClass::Journal.priority(), QueuePriority::Medium);
        assert_eq!(IoClass::BlockMap.priority(), QueuePriority::Medium);
        assert_eq!(IoClass::Verify.priority(), QueuePriority::Medium);
        assert_eq!(IoClass::Data.priority(), QueuePriority::Low);
        assert_eq!(IoClass::CompressedData.priority(), QueuePriority::Low);
        assert_eq!(IoClass::ReadCache.priority(), QueuePriority::Low);
    }

    #[test]
    fn test_only_data_merges() {
        assert!(IoClass::Data.is_mergeable());
        assert!(!IoClass::CompressedData.is_mergeable());
        assert!(!IoClass::Metadata.is_mergeable());
        assert!(!IoClass::ReadCache.is_mergeable());
    }

    #[test]
    fn test_only_flush_lacks_affinity() {
        assert!(!IoClass::Flush.has_pbn_affinity());
        assert!(IoClass::Data.has_pbn_affinity());
        assert!(IoClass::HighPriority.has_pbn_affinity());
    }

    #[test]
    fn test_into_bio_derives_sector() {
        let bio = Request::new(Pbn(12), IoClass::Journal, IoDirection::Read)
            .with_sync(true)
            .into_bio(RequestId(9), 8);
        assert_eq!(bio.id, RequestId(9));
        assert_eq!(bio.sector, Sector(96));
        assert!(bio.sync);
        assert!(bio.device.is_none());
    }

    #[test]
    fn test_complete_runs_callback_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let bio = Request::new(Pbn(1), IoClass::Data, IoDirection::Write)
            .on_complete(move |result| sink.lock().unwrap().push(result.is_ok()))
            .into_bio(RequestId(1), 8);
        bio.complete(Ok(()));
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_chain_completion_runs_hook_first() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let outer = Arc::clone(&order);
        let inner = Arc::clone(&order);
        let mut bio = Request::new(Pbn(1), IoClass::Data, IoDirection::Write)
            .on_complete(move |_| inner.lock().unwrap().push("callback"))
            .into_bio(RequestId(1), 8);
        bio.chain_completion(move |_| outer.lock().unwrap().push("hook"));
        bio.complete(Ok(()));
        assert_eq!(*order.lock().unwrap(), vec!["hook", "callback"]);
    }

    #[test]
    fn test_reject_reports_shutdown() {
        let (request, mut rx) =
            Request::new(Pbn(3), IoClass::Data, IoDirection::Read).with_channel();
        request.into_bio(RequestId(1), 8).reject();
        let result = rx.try_recv().unwrap();
        assert!(matches!(result, Err(SubmitterError::ShuttingDown)));
    }

    #[tokio::test]
    async fn test_channel_completion() {
        let (request, rx) = Request::new(Pbn(3), IoClass::Data, IoDirection::Write).with_channel();
        let bio = request.into_bio(RequestId(4), 8);
        std::thread::spawn(move || bio.complete(Ok(())));
        assert!(rx.await.unwrap().is_ok());
    }

    #[test]
    fn test_group_append_and_prepend() {
        let mut group = MergedGroup::new(data_bio(2, 101));
        group.prepend(data_bio(1, 100));
        group.append(data_bio(3, 102));

        assert_eq!(group.len(), 3);
        assert_eq!(group.head_sector(), Some(Sector(100)));
        assert_eq!(group.tail_sector(), Some(Sector(102)));
        assert_eq!(group.sectors(), vec![Sector(100), Sector(101), Sector(102)]);

        let ids: Vec<RequestId> = group.into_bios().into_iter().map(|b| b.id).collect();
        assert_eq!(ids, vec![RequestId(1), RequestId(2), RequestId(3)]);
    }

    #[test]
    fn test_group_keeps_class_and_direction() {
        let group = MergedGroup::new(data_bio(1, 5));
        assert_eq!(group.class(), IoClass::Data);
        assert_eq!(group.direction(), IoDirection::Write);
        assert!(!group.is_empty());
    }
}
