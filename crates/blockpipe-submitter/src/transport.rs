//! Transport seam between submission workers and the block device.
//!
//! Workers hand every bio to a [`BlockTransport`]. Submission is
//! fire-and-forget: the transport owns the bio from then on and reports the
//! outcome through the bio's own completion. [`RecordingTransport`] keeps an
//! in-memory log of submissions for tests and diagnostics.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::block::{DeviceId, IoDirection, Pbn, Sector};
use crate::error::SubmitterError;
use crate::request::{Bio, IoClass, RequestId};

/// The device driver below the submitter.
pub trait BlockTransport: Send + Sync + 'static {
    /// Takes ownership of `bio`. May block the calling worker thread.
    fn submit(&self, worker: usize, bio: Bio);

    /// Opens the batching scope for `worker`'s thread.
    fn start_plug(&self, _worker: usize) {}

    /// Closes the batching scope for `worker`'s thread.
    fn finish_plug(&self, _worker: usize) {}
}

impl<T: BlockTransport + ?Sized> BlockTransport for Arc<T> {
    fn submit(&self, worker: usize, bio: Bio) {
        (**self).submit(worker, bio)
    }

    fn start_plug(&self, worker: usize) {
        (**self).start_plug(worker)
    }

    fn finish_plug(&self, worker: usize) {
        (**self).finish_plug(worker)
    }
}

/// One bio as seen by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubmittedBio {
    /// Request identifier.
    pub id: RequestId,
    /// Physical block number.
    pub pbn: Pbn,
    /// Starting sector.
    pub sector: Sector,
    /// Request class.
    pub class: IoClass,
    /// Data direction.
    pub direction: IoDirection,
    /// Sync flag at submission time.
    pub sync: bool,
    /// Device attached by the worker.
    pub device: Option<DeviceId>,
    /// Worker that submitted it.
    pub worker: usize,
    /// Name of the submitting thread.
    pub thread: Option<String>,
    /// Whether the worker's batching scope was open.
    pub plugged: bool,
}

#[derive(Debug, Default)]
struct RecorderInner {
    submitted: Vec<SubmittedBio>,
    open_plugs: Vec<usize>,
    plugs_started: u64,
    plugs_finished: u64,
    fail_reason: Option<String>,
}

/// In-memory transport that records every submission and completes it at once.
#[derive(Debug, Default)]
pub struct RecordingTransport {
    inner: Mutex<RecorderInner>,
}

impl RecordingTransport {
    /// Creates a transport that completes every bio successfully.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes subsequent completions fail with `reason`, or succeed again with `None`.
    pub fn set_failure(&self, reason: Option<&str>) {
        self.inner.lock().fail_reason = reason.map(str::to_string);
    }

    /// All submissions so far, in arrival order.
    pub fn submitted(&self) -> Vec<SubmittedBio> {
        self.inner.lock().submitted.clone()
    }

    /// Sectors submitted so far, in arrival order.
    pub fn submitted_sectors(&self) -> Vec<Sector> {
        self.inner.lock().submitted.iter().map(|s| s.sector).collect()
    }

    /// Number of submissions so far.
    pub fn submitted_count(&self) -> usize {
        self.inner.lock().submitted.len()
    }

    /// (started, finished) batching scopes.
    pub fn plug_counts(&self) -> (u64, u64) {
        let inner = self.inner.lock();
        (inner.plugs_started, inner.plugs_finished)
    }
}

impl BlockTransport for RecordingTransport {
    fn submit(&self, worker: usize, bio: Bio) {
        let failure = {
            let mut inner = self.inner.lock();
            let plugged = inner.open_plugs.contains(&worker);
            inner.submitted.push(SubmittedBio {
                id: bio.id,
                pbn: bio.pbn,
                sector: bio.sector,
                class: bio.class,
                direction: bio.direction,
                sync: bio.sync,
                device: bio.device,
                worker,
                thread: std::thread::current().name().map(str::to_string),
                plugged,
            });
            inner.fail_reason.clone()
        };

        debug!(
            "Recorded bio: id={:?}, sector={}, worker={}",
            bio.id, bio.sector.0, worker
        );

        match failure {
            None => bio.complete(Ok(())),
            Some(reason) => {
                let device = bio
                    .device
                    .map(|d| d.to_string())
                    .unwrap_or_else(|| "unknown".to_string());
                bio.complete(Err(SubmitterError::Transport { device, reason }));
            }
        }
    }

    fn start_plug(&self, worker: usize) {
        let mut inner = self.inner.lock();
        inner.open_plugs.push(worker);
        inner.plugs_started += 1;
    }

    fn finish_plug(&self, worker: usize) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.open_plugs.iter().position(|w| *w == worker) {
            inner.open_plugs.swap_remove(pos);
        }
        inner.plugs_finished += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::Request;

    fn bio(id: u64, pbn: u64) -> Bio {
        Request::new(Pbn(pbn), IoClass::Data, IoDirection::Write).into_bio(RequestId(id), 8)
    }

    #[test]
    fn test_records_in_order() {
        let transport = RecordingTransport::new();
        transport.submit(0, bio(1, 10));
        transport.submit(1, bio(2, 3));

        let submitted = transport.submitted();
        assert_eq!(submitted.len(), 2);
        assert_eq!(submitted[0].id, RequestId(1));
        assert_eq!(submitted[0].sector, Sector(80));
        assert_eq!(submitted[1].worker, 1);
        assert_eq!(transport.submitted_sectors(), vec![Sector(80), Sector(24)]);
    }

    #[test]
    fn test_completes_successfully() {
        let transport = RecordingTransport::new();
        let (request, mut rx) =
            Request::new(Pbn(1), IoClass::Data, IoDirection::Read).with_channel();
        transport.submit(0, request.into_bio(RequestId(1), 8));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_injected_failure() {
        let transport = RecordingTransport::new();
        transport.set_failure(Some("medium error"));
        let (request, mut rx) =
            Request::new(Pbn(1), IoClass::Data, IoDirection::Read).with_channel();
        let mut bio = request.into_bio(RequestId(1), 8);
        bio.device = Some(DeviceId(2));
        transport.submit(0, bio);

        match rx.try_recv().unwrap() {
            Err(SubmitterError::Transport { device, reason }) => {
                assert_eq!(device, "dev2");
                assert_eq!(reason, "medium error");
            }
            other => panic!("unexpected completion: {:?}", other),
        }

        transport.set_failure(None);
        let (request, mut rx) =
            Request::new(Pbn(2), IoClass::Data, IoDirection::Read).with_channel();
        transport.submit(0, request.into_bio(RequestId(2), 8));
        assert!(rx.try_recv().unwrap().is_ok());
    }

    #[test]
    fn test_plug_tracking() {
        let transport = RecordingTransport::new();
        transport.submit(0, bio(1, 1));
        transport.start_plug(0);
        transport.submit(0, bio(2, 2));
        transport.submit(1, bio(3, 3));
        transport.finish_plug(0);

        let submitted = transport.submitted();
        assert!(!submitted[0].plugged);
        assert!(submitted[1].plugged);
        assert!(!submitted[2].plugged);
        assert_eq!(transport.plug_counts(), (1, 1));
    }

    #[test]
    fn test_arc_forwarding() {
        let transport = Arc::new(RecordingTransport::new());
        let as_trait: &dyn BlockTransport = &transport;
        as_trait.start_plug(4);
        as_trait.submit(4, bio(1, 1));
        as_trait.finish_plug(4);
        assert_eq!(transport.submitted_count(), 1);
        assert!(transport.submitted()[0].plugged);
    }
}
