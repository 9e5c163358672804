//! Sector-indexed map of pending merge groups.
//!
//! Each submission worker keeps one [`AdjacencyMap`] naming the group owner
//! queued at a given sector. A merged group is reachable through exactly two
//! keys, its head sector and its tail sector, so a newly arriving bio can find
//! a neighbour on either side with a single lookup.
//!
//! The map is bounded. Inserting a new key into a full map fails with
//! [`MapFull`]; callers treat that as "no entry recorded", since the map only
//! makes merging possible and never decides correctness.

use std::collections::HashMap;

use thiserror::Error;

use crate::block::Sector;
use crate::error::{SubmitterError, SubmitterResult};

/// A new key could not be added because the map is at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Adjacency map full: cannot index {sector} (capacity {capacity})")]
pub struct MapFull {
    /// The sector that was not recorded.
    pub sector: Sector,
    /// Capacity of the map.
    pub capacity: usize,
}

/// Bounded map from sector to the owner of the group bordering it.
#[derive(Debug)]
pub struct AdjacencyMap<V> {
    entries: HashMap<Sector, V>,
    capacity: usize,
}

impl<V: Copy + PartialEq> AdjacencyMap<V> {
    /// Allocates a map able to hold `capacity` keys for `worker`.
    pub fn with_capacity(worker: usize, capacity: usize) -> SubmitterResult<Self> {
        let mut entries = HashMap::new();
        entries
            .try_reserve(capacity)
            .map_err(|e| SubmitterError::MapAllocation {
                worker,
                capacity,
                reason: e.to_string(),
            })?;
        Ok(Self { entries, capacity })
    }

    /// Looks up the owner indexed at `sector`.
    #[inline]
    pub fn get(&self, sector: Sector) -> Option<V> {
        self.entries.get(&sector).copied()
    }

    /// Indexes `value` at `sector`, returning the value it replaced.
    ///
    /// Replacing an existing key always succeeds; adding a key to a full map
    /// fails.
    pub fn insert(&mut self, sector: Sector, value: V) -> Result<Option<V>, MapFull> {
        if let Some(slot) = self.entries.get_mut(&sector) {
            return Ok(Some(std::mem::replace(slot, value)));
        }
        if self.entries.len() >= self.capacity {
            return Err(MapFull {
                sector,
                capacity: self.capacity,
            });
        }
        self.entries.insert(sector, value);
        Ok(None)
    }

    /// Removes `sector`, whatever it points at.
    #[inline]
    pub fn remove(&mut self, sector: Sector) -> Option<V> {
        self.entries.remove(&sector)
    }

    /// Removes `sector` only if it still points at `value`.
    ///
    /// Absent or re-pointed keys are left alone.
    pub fn remove_if(&mut self, sector: Sector, value: V) -> bool {
        if self.entries.get(&sector) == Some(&value) {
            self.entries.remove(&sector);
            true
        } else {
            false
        }
    }

    /// All sectors currently indexing `value`, ascending.
    pub fn keys_for(&self, value: V) -> Vec<Sector> {
        let mut keys: Vec<Sector> = self
            .entries
            .iter()
            .filter(|(_, v)| **v == value)
            .map(|(k, _)| *k)
            .collect();
        keys.sort_unstable();
        keys
    }

    /// Number of indexed sectors.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if no sector is indexed.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Maximum number of keys.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drops every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}
