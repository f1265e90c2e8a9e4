//! Driver port allocation for concurrently running shards.
//!
//! Each shard's session talks to its device driver over its own port. The
//! [`PortAllocator`] is created once per orchestrator run and shared by
//! reference with every shard task; its claim set is the only state the
//! shard tasks mutate concurrently.
//!
//! Ports are never released during a run. Different runs draw from a
//! shuffled range, which keeps reuse across back-to-back invocations
//! unlikely.

use std::collections::HashSet;
use std::ops::RangeInclusive;
use std::sync::Mutex;

use rand::seq::SliceRandom;
use rand::thread_rng;
use tracing::debug;

use super::ShardError;

/// Default first port of the allocation range.
pub const DEFAULT_PORT_RANGE_START: u16 = 7001;

/// Default last port of the allocation range (inclusive).
pub const DEFAULT_PORT_RANGE_END: u16 = 7128;

/// Hands out exclusive ports to shards.
#[derive(Debug)]
pub struct PortAllocator {
    range: RangeInclusive<u16>,
    claimed: Mutex<HashSet<u16>>,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self::new(DEFAULT_PORT_RANGE_START..=DEFAULT_PORT_RANGE_END)
    }
}

impl PortAllocator {
    /// Creates an allocator over `range`.
    pub fn new(range: RangeInclusive<u16>) -> Self {
        Self {
            range,
            claimed: Mutex::new(HashSet::new()),
        }
    }

    /// The port used when a run has a single shard.
    pub fn default_port(&self) -> u16 {
        *self.range.start()
    }

    /// Acquires a port for one shard.
    ///
    /// - A `pinned` port is always returned as-is.
    /// - With one effective shard, the [`default_port`](Self::default_port)
    ///   is returned without searching.
    /// - Otherwise the range is shuffled and the first port not yet claimed
    ///   is claimed atomically.
    ///
    /// # Errors
    ///
    /// Returns [`ShardError::PortsExhausted`] when every port in the range is
    /// already claimed.
    pub fn acquire(&self, effective_shards: usize, pinned: Option<u16>) -> Result<u16, ShardError> {
        if let Some(port) = pinned {
            return Ok(port);
        }
        if effective_shards <= 1 {
            return Ok(self.default_port());
        }

        let mut candidates: Vec<u16> = self.range.clone().collect();
        candidates.shuffle(&mut thread_rng());

        // A poisoned lock still holds a consistent set: inserts are atomic.
        let mut claimed = self
            .claimed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let port = candidates
            .into_iter()
            .find(|port| claimed.insert(*port))
            .ok_or(ShardError::PortsExhausted {
                start: *self.range.start(),
                end: *self.range.end(),
            })?;

        debug!("Claimed port {}", port);
        Ok(port)
    }

    /// Number of ports claimed so far.
    pub fn claimed_count(&self) -> usize {
        self.claimed
            .lock()
            .map(|c| c.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }
}
