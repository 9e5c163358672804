//! PBN-to-worker routing and the round-robin rotor.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::block::Pbn;
use crate::error::{SubmitterError, SubmitterResult};

/// Fixed routing geometry of a submitter.
///
/// Runs of `rotation_interval` consecutive PBNs land on the same worker, which
/// keeps neighbouring blocks mergeable while spreading load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Routing {
    worker_count: u32,
    rotation_interval: u32,
}

impl Routing {
    /// Creates the routing for `worker_count` workers.
    pub fn new(worker_count: u32, rotation_interval: u32) -> SubmitterResult<Self> {
        if worker_count == 0 || rotation_interval == 0 {
            return Err(SubmitterError::InvalidConfig {
                reason: format!(
                    "routing needs non-zero worker_count and rotation_interval (got {} and {})",
                    worker_count, rotation_interval
                ),
            });
        }
        Ok(Self {
            worker_count,
            rotation_interval,
        })
    }

    /// Number of workers.
    #[inline]
    pub fn worker_count(&self) -> u32 {
        self.worker_count
    }

    /// Consecutive PBNs per worker.
    #[inline]
    pub fn rotation_interval(&self) -> u32 {
        self.rotation_interval
    }

    /// `worker_count * rotation_interval`.
    #[inline]
    pub fn modulus(&self) -> u64 {
        u64::from(self.worker_count) * u64::from(self.rotation_interval)
    }

    /// Worker owning `pbn`.
    #[inline]
    pub fn worker_for_pbn(&self, pbn: Pbn) -> usize {
        self.worker_for_slot(pbn.0)
    }

    /// Worker for an arbitrary slot counter.
    #[inline]
    pub fn worker_for_slot(&self, slot: u64) -> usize {
        ((slot % self.modulus()) / u64::from(self.rotation_interval)) as usize
    }
}

/// Round-robin source for requests with no PBN affinity.
///
/// The counter wraps at the routing modulus so every full cycle visits each
/// worker exactly `rotation_interval` times.
#[derive(Debug)]
pub struct Rotor {
    routing: Routing,
    next: AtomicU64,
}

impl Rotor {
    /// Creates a rotor starting at worker 0.
    pub fn new(routing: Routing) -> Self {
        Self {
            routing,
            next: AtomicU64::new(0),
        }
    }

    /// Advances the rotor, returning the chosen worker.
    pub fn next_worker(&self) -> usize {
        let modulus = self.routing.modulus();
        let slot = self
            .next
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |slot| {
                Some((slot + 1) % modulus)
            })
            .unwrap_or_else(|slot| slot);
        self.routing.worker_for_slot(slot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scenario_four_by_eight() {
        let routing = Routing::new(4, 8).unwrap();
        assert_eq!(routing.worker_for_pbn(Pbn(0)), 0);
        assert_eq!(routing.worker_for_pbn(Pbn(7)), 0);
        assert_eq!(routing.worker_for_pbn(Pbn(8)), 1);
        assert_eq!(routing.worker_for_pbn(Pbn(31)), 3);
        assert_eq!(routing.worker_for_pbn(Pbn(32)), 0);
    }

    #[test]
    fn test_modulus() {
        let routing = Routing::new(u32::MAX, u32::MAX).unwrap();
        assert_eq!(routing.modulus(), u64::from(u32::MAX) * u64::from(u32::MAX));
    }

    #[test]
    fn test_zero_geometry_rejected() {
        assert!(Routing::new(0, 8).is_err());
        assert!(Routing::new(4, 0).is_err());
    }

    #[test]
    fn test_large_pbn() {
        let routing = Routing::new(3, 5).unwrap();
        let worker = routing.worker_for_pbn(Pbn(u64::MAX));
        assert!(worker < 3);
        assert_eq!(worker, ((u64::MAX % 15) / 5) as usize);
    }

    #[test]
    fn test_rotor_cycle() {
        let rotor = Rotor::new(Routing::new(2, 3).unwrap());
        let picks: Vec<usize> = (0..12).map(|_| rotor.next_worker()).collect();
        assert_eq!(picks, vec![0, 0, 0, 1, 1, 1, 0, 0, 0, 1, 1, 1]);
    }

    #[test]
    fn test_rotor_single_worker() {
        let rotor = Rotor::new(Routing::new(1, 1).unwrap());
        for _ in 0..10 {
            assert_eq!(rotor.next_worker(), 0);
        }
    }

    #[test]
    fn test_rotor_concurrent_fairness() {
        use std::sync::Arc;

        let rotor = Arc::new(Rotor::new(Routing::new(4, 2).unwrap()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let rotor = Arc::clone(&rotor);
                std::thread::spawn(move || {
                    let mut counts = [0usize; 4];
                    for _ in 0..200 {
                        counts[rotor.next_worker()] += 1;
                    }
                    counts
                })
            })
            .collect();

        let mut totals = [0usize; 4];
        for handle in handles {
            for (total, count) in totals.iter_mut().zip(handle.join().unwrap()) {
                *total += count;
            }
        }
        // 800 picks is exactly 100 full cycles of 8 slots.
        assert_eq!(totals, [200, 200, 200, 200]);
    }
}
