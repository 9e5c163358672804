//! Bio submission and completion counters.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::block::IoDirection;
use crate::request::{Bio, IoClass};

/// Counter group a bio is charged to.
///
/// Data bios count as "out"; everything else counts as metadata, with
/// journal and block-map bios additionally counted on their own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BioCategory {
    /// User data
    Out,
    /// Any non-data bio
    Metadata,
    /// Recovery or slab journal bio
    Journal,
    /// Block map page bio
    PageCache,
}

impl BioCategory {
    /// Categories charged for a bio of `class`.
    pub fn for_class(class: IoClass) -> &'static [BioCategory] {
        match class {
            IoClass::Data | IoClass::CompressedData | IoClass::ReadCache => &[BioCategory::Out],
            IoClass::Journal | IoClass::SlabJournal => {
                &[BioCategory::Metadata, BioCategory::Journal]
            }
            IoClass::BlockMap => &[BioCategory::Metadata, BioCategory::PageCache],
            _ => &[BioCategory::Metadata],
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
struct BioCounters {
    read: AtomicU64,
    write: AtomicU64,
    sync: AtomicU64,
}

impl BioCounters {
    fn record(&self, direction: IoDirection, sync: bool) {
        match direction {
            IoDirection::Read => self.read.fetch_add(1, Ordering::Relaxed),
            IoDirection::Write => self.write.fetch_add(1, Ordering::Relaxed),
        };
        if sync {
            self.sync.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn snapshot(&self) -> BioCountsSnapshot {
        BioCountsSnapshot {
            read: self.read.load(Ordering::Relaxed),
            write: self.write.load(Ordering::Relaxed),
            sync: self.sync.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time read/write/sync counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BioCountsSnapshot {
    /// Read bios
    pub read: u64,
    /// Write bios
    pub write: u64,
    /// Bios carrying the sync flag
    pub sync: u64,
}

impl BioCountsSnapshot {
    /// Reads plus writes.
    pub fn total(&self) -> u64 {
        self.read + self.write
    }
}

/// Shared counters updated by producers, workers and completions.
#[derive(Debug, Default)]
pub struct SubmitterStats {
    routed: AtomicU64,
    submitted: AtomicU64,
    completed: AtomicU64,
    completion_errors: AtomicU64,
    submitted_by: [BioCounters; 4],
    completed_by: [BioCounters; 4],
    back_merges: AtomicU64,
    front_merges: AtomicU64,
    map_insert_failures: AtomicU64,
    rejected: AtomicU64,
    tasks: AtomicU64,
}

impl SubmitterStats {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// A request was routed to a worker.
    #[inline]
    pub fn record_routed(&self) {
        self.routed.fetch_add(1, Ordering::Relaxed);
    }

    /// A bio was handed to the transport.
    pub fn record_submitted(&self, bio: &Bio) {
        self.submitted.fetch_add(1, Ordering::Relaxed);
        for category in BioCategory::for_class(bio.class) {
            self.submitted_by[category.index()].record(bio.direction, bio.sync);
        }
    }

    /// A bio's completion arrived.
    pub fn record_completed(&self, class: IoClass, direction: IoDirection, sync: bool, ok: bool) {
        self.completed.fetch_add(1, Ordering::Relaxed);
        if !ok {
            self.completion_errors.fetch_add(1, Ordering::Relaxed);
        }
        for category in BioCategory::for_class(class) {
            self.completed_by[category.index()].record(direction, sync);
        }
    }

    /// A request joined an existing group behind its tail.
    #[inline]
    pub fn record_back_merge(&self) {
        self.back_merges.fetch_add(1, Ordering::Relaxed);
    }

    /// A request joined an existing group ahead of its head.
    #[inline]
    pub fn record_front_merge(&self) {
        self.front_merges.fetch_add(1, Ordering::Relaxed);
    }

    /// The adjacency map could not record a key.
    #[inline]
    pub fn record_map_insert_failures(&self, count: u64) {
        if count > 0 {
            self.map_insert_failures.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// `count` bios were failed with `ShuttingDown` without reaching the transport.
    #[inline]
    pub fn record_rejected(&self, count: u64) {
        if count > 0 {
            self.rejected.fetch_add(count, Ordering::Relaxed);
        }
    }

    /// A generic task was queued.
    #[inline]
    pub fn record_task(&self) {
        self.tasks.fetch_add(1, Ordering::Relaxed);
    }

    /// Copies all counters.
    pub fn snapshot(&self) -> SubmitterStatsSnapshot {
        let by = |counters: &[BioCounters; 4]| CategorySnapshot {
            out: counters[BioCategory::Out.index()].snapshot(),
            meta: counters[BioCategory::Metadata.index()].snapshot(),
            journal: counters[BioCategory::Journal.index()].snapshot(),
            page_cache: counters[BioCategory::PageCache.index()].snapshot(),
        };
        SubmitterStatsSnapshot {
            requests_routed: self.routed.load(Ordering::Relaxed),
            bios_submitted: self.submitted.load(Ordering::Relaxed),
            bios_completed: self.completed.load(Ordering::Relaxed),
            completion_errors: self.completion_errors.load(Ordering::Relaxed),
            submitted: by(&self.submitted_by),
            completed: by(&self.completed_by),
            back_merges: self.back_merges.load(Ordering::Relaxed),
            front_merges: self.front_merges.load(Ordering::Relaxed),
            map_insert_failures: self.map_insert_failures.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            tasks_enqueued: self.tasks.load(Ordering::Relaxed),
        }
    }
}

/// Counts broken down by category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CategorySnapshot {
    /// Data bios
    pub out: BioCountsSnapshot,
    /// Non-data bios
    pub meta: BioCountsSnapshot,
    /// Journal bios (also counted in `meta`)
    pub journal: BioCountsSnapshot,
    /// Block map bios (also counted in `meta`)
    pub page_cache: BioCountsSnapshot,
}

/// Serializable copy of [`SubmitterStats`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmitterStatsSnapshot {
    /// Requests routed to a worker (merged or queued).
    pub requests_routed: u64,
    /// Bios handed to the transport.
    pub bios_submitted: u64,
    /// Bios whose completion ran.
    pub bios_completed: u64,
    /// Completions that reported an error.
    pub completion_errors: u64,
    /// Submitted bios by category.
    pub submitted: CategorySnapshot,
    /// Completed bios by category.
    pub completed: CategorySnapshot,
    /// Requests appended to a group tail.
    pub back_merges: u64,
    /// Requests prepended to a group head.
    pub front_merges: u64,
    /// Map keys that could not be recorded.
    pub map_insert_failures: u64,
    /// Requests refused during shutdown.
    pub rejected: u64,
    /// Generic tasks queued through the rotor.
    pub tasks_enqueued: u64,
}

impl SubmitterStatsSnapshot {
    /// Total merges of either kind.
    pub fn merges(&self) -> u64 {
        self.back_merges + self.front_merges
    }

    /// Bios handed to the transport whose completion has not run yet.
    pub fn bios_in_flight(&self) -> u64 {
        self.bios_submitted.saturating_sub(self.bios_completed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::Pbn;
    use crate::request::{Request, RequestId};

    fn bio(class: IoClass, direction: IoDirection, sync: bool) -> Bio {
        Request::new(Pbn(1), class, direction)
            .with_sync(sync)
            .into_bio(RequestId(1), 8)
    }

    #[test]
    fn test_categories() {
        assert_eq!(BioCategory::for_class(IoClass::Data), &[BioCategory::Out]);
        assert_eq!(
            BioCategory::for_class(IoClass::Journal),
            &[BioCategory::Metadata, BioCategory::Journal]
        );
        assert_eq!(
            BioCategory::for_class(IoClass::BlockMap),
            &[BioCategory::Metadata, BioCategory::PageCache]
        );
        assert_eq!(
            BioCategory::for_class(IoClass::Flush),
            &[BioCategory::Metadata]
        );
    }

    #[test]
    fn test_submitted_breakdown() {
        let stats = SubmitterStats::new();
        stats.record_submitted(&bio(IoClass::Data, IoDirection::Write, false));
        stats.record_submitted(&bio(IoClass::Data, IoDirection::Read, false));
        stats.record_submitted(&bio(IoClass::Journal, IoDirection::Write, true));
        stats.record_submitted(&bio(IoClass::BlockMap, IoDirection::Read, false));

        let snap = stats.snapshot();
        assert_eq!(snap.bios_submitted, 4);
        assert_eq!(snap.submitted.out.total(), 2);
        assert_eq!(snap.submitted.meta.total(), 2);
        assert_eq!(snap.submitted.journal.write, 1);
        assert_eq!(snap.submitted.journal.sync, 1);
        assert_eq!(snap.submitted.page_cache.read, 1);
    }

    #[test]
    fn test_completed_and_errors() {
        let stats = SubmitterStats::new();
        stats.record_completed(IoClass::Data, IoDirection::Write, false, true);
        stats.record_completed(IoClass::Metadata, IoDirection::Read, false, false);

        let snap = stats.snapshot();
        assert_eq!(snap.bios_completed, 2);
        assert_eq!(snap.completion_errors, 1);
        assert_eq!(snap.completed.out.write, 1);
        assert_eq!(snap.completed.meta.read, 1);
    }

    #[test]
    fn test_merge_and_failure_counters() {
        let stats = SubmitterStats::new();
        stats.record_back_merge();
        stats.record_front_merge();
        stats.record_front_merge();
        stats.record_map_insert_failures(0);
        stats.record_map_insert_failures(2);
        stats.record_rejected(1);
        stats.record_rejected(0);
        stats.record_routed();
        stats.record_task();

        let snap = stats.snapshot();
        assert_eq!(snap.merges(), 3);
        assert_eq!(snap.map_insert_failures, 2);
        assert_eq!(snap.rejected, 1);
        assert_eq!(snap.requests_routed, 1);
        assert_eq!(snap.tasks_enqueued, 1);
    }

    #[test]
    fn test_in_flight() {
        let stats = SubmitterStats::new();
        stats.record_submitted(&bio(IoClass::Data, IoDirection::Write, false));
        stats.record_submitted(&bio(IoClass::Data, IoDirection::Write, false));
        stats.record_completed(IoClass::Data, IoDirection::Write, false, true);
        assert_eq!(stats.snapshot().bios_in_flight(), 1);
    }

    #[test]
    fn test_snapshot_serializes() {
        let stats = SubmitterStats::new();
        stats.record_routed();
        let json = serde_json::to_string(&stats.snapshot()).unwrap();
        assert!(json.contains("\"requests_routed\":1"));
    }
}
