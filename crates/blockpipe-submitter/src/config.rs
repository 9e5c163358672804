//! Configuration for the bio submitter.

use serde::{Deserialize, Serialize};

use crate::block::{DeviceId, DEFAULT_SECTORS_PER_BLOCK};
use crate::error::{SubmitterError, SubmitterResult};

/// Upper bound on submission workers.
pub const MAX_WORKERS: u32 = 100;

/// Configuration for an [`IoSubmitter`](crate::IoSubmitter) instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubmitterConfig {
    /// Prefix for submission thread names; threads are named `{prefix}bioQ{index}`.
    pub thread_name_prefix: String,
    /// Number of submission workers.
    pub worker_count: u32,
    /// Consecutive PBNs routed to one worker before moving to the next.
    pub rotation_interval: u32,
    /// Upper bound on requests in flight at once; sizes the adjacency maps.
    pub max_requests_active: usize,
    /// Device sectors per physical block.
    pub sectors_per_block: u64,
    /// Whether adjacent data bios are collected into merged groups.
    pub merge_enabled: bool,
    /// MD RAID5 tuning: clear sync on data bios, set it on journal bios.
    pub md_raid5_mode: bool,
    /// Device index attached to every submitted bio.
    pub device_idx: u16,
}

impl Default for SubmitterConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "blockpipe".to_string(),
            worker_count: 4,
            rotation_interval: 64,
            max_requests_active: 2000,
            sectors_per_block: DEFAULT_SECTORS_PER_BLOCK,
            merge_enabled: true,
            md_raid5_mode: false,
            device_idx: 0,
        }
    }
}

impl SubmitterConfig {
    /// Creates a configuration with the given worker geometry and defaults elsewhere.
    pub fn new(
        thread_name_prefix: &str,
        worker_count: u32,
        rotation_interval: u32,
        max_requests_active: usize,
    ) -> Self {
        Self {
            thread_name_prefix: thread_name_prefix.to_string(),
            worker_count,
            rotation_interval,
            max_requests_active,
            ..Default::default()
        }
    }

    /// Parses a JSON configuration; missing fields take their defaults.
    pub fn from_json(json: &str) -> SubmitterResult<Self> {
        let config: SubmitterConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Entries each worker's adjacency map may hold: one key for the
    /// first sector and one for the last of every request.
    pub fn map_capacity(&self) -> Option<usize> {
        if !self.merge_enabled {
            return Some(0);
        }
        self.max_requests_active.checked_mul(2)
    }

    /// The device identity attached to submitted bios.
    #[inline]
    pub fn device(&self) -> DeviceId {
        DeviceId(self.device_idx)
    }

    /// Validates the configuration.
    pub fn validate(&self) -> SubmitterResult<()> {
        if self.worker_count == 0 {
            return Err(invalid("worker_count must be > 0"));
        }
        if self.worker_count > MAX_WORKERS {
            return Err(SubmitterError::InvalidConfig {
                reason: format!(
                    "worker_count {} exceeds the limit of {}",
                    self.worker_count, MAX_WORKERS
                ),
            });
        }
        if self.rotation_interval == 0 {
            return Err(invalid("rotation_interval must be > 0"));
        }
        if self.sectors_per_block == 0 {
            return Err(invalid("sectors_per_block must be > 0"));
        }
        if self.thread_name_prefix.contains('\0') {
            return Err(invalid("thread_name_prefix must not contain NUL bytes"));
        }
        if self.map_capacity().is_none() {
            return Err(invalid("max_requests_active is too large"));
        }
        Ok(())
    }
}

fn invalid(reason: &str) -> SubmitterError {
    SubmitterError::InvalidConfig {
        reason: reason.to_string(),
    }
}
