//! Error types for the bio submission subsystem.

use thiserror::Error;

/// Result type alias for submitter operations.
pub type SubmitterResult<T> = Result<T, SubmitterError>;

/// Error variants for submitter construction and bio completion.
#[derive(Debug, Error)]
pub enum SubmitterError {
    /// The submitter configuration is unusable.
    #[error("Invalid submitter config: {reason}")]
    InvalidConfig {
        /// Description of the problem.
        reason: String,
    },

    /// The configuration could not be parsed.
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] serde_json::Error),

    /// A worker's adjacency map could not be allocated.
    #[error("Adjacency map allocation failed for worker {worker}: {capacity} entries ({reason})")]
    MapAllocation {
        /// Index of the worker whose map failed.
        worker: usize,
        /// Requested number of map entries.
        capacity: usize,
        /// Allocator failure description.
        reason: String,
    },

    /// A submission thread could not be started.
    #[error("Failed to spawn submission thread {name}: {source}")]
    ThreadSpawn {
        /// Thread name that failed to start.
        name: String,
        /// Underlying OS error.
        #[source]
        source: std::io::Error,
    },

    /// The submitter has stopped accepting work.
    #[error("Submitter is shutting down")]
    ShuttingDown,

    /// The transport reported a failure for a bio.
    #[error("Transport error on {device}: {reason}")]
    Transport {
        /// The device identifier.
        device: String,
        /// Description of the error.
        reason: String,
    },
}
