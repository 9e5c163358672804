#![warn(missing_docs)]

//! Blockpipe submitter: PBN-affine bio submission workers with adjacent-request merging
//!
//! This crate routes block I/O to a fixed pool of submission threads. Every
//! physical block number maps to exactly one worker, so all I/O for a block is
//! submitted in order from one thread. Adjacent data requests on a worker are
//! collected into one group and handed to the transport together, in ascending
//! sector order, inside the worker's batching scope.

pub mod adjacency;
pub mod block;
pub mod config;
pub mod error;
pub mod request;
pub mod routing;
pub mod stats;
pub mod submitter;
pub mod transport;
pub mod work_queue;
pub mod worker;

pub use adjacency::{AdjacencyMap, MapFull};
pub use block::{DeviceId, IoDirection, Pbn, Sector, DEFAULT_SECTORS_PER_BLOCK, SECTOR_SIZE};
pub use config::{SubmitterConfig, MAX_WORKERS};
pub use error::{SubmitterError, SubmitterResult};
pub use request::{Bio, BioResult, CompletionReceiver, IoClass, MergedGroup, Request, RequestId};
pub use routing::{Rotor, Routing};
pub use stats::{BioCategory, BioCountsSnapshot, CategorySnapshot, SubmitterStats, SubmitterStatsSnapshot};
pub use submitter::{IoSubmitter, SubmitOutcome, SubmitterDump};
pub use transport::{BlockTransport, RecordingTransport, SubmittedBio};
pub use work_queue::{QueuePriority, WorkHandler, WorkQueue, WorkQueueSnapshot, WorkQueueStats, WorkerContext};
pub use worker::{MergeKind, MergeReport, MergeState, WorkerDump, WorkerPhase};
