//! Per-migration logical clocks.
//!
//! One clock exists per in-flight migration. Every clock mutation happens
//! under a single store-wide mutex so an increment-and-snapshot is atomic
//! with respect to the forwarding loop, and so `(source_time,
//! destination_time)` snapshots are never torn.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use parking_lot::Mutex;

use crate::error::AgentError;
use crate::wire::MigrationClock;

/// Store of migration clocks keyed by PID.
pub struct ClockStore {
    clocks: Mutex<HashMap<i32, MigrationClock>>,
}

impl Default for ClockStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ClockStore {
    pub fn new() -> Self {
        Self {
            clocks: Mutex::new(HashMap::new()),
        }
    }

    /// Source-side start: create a zeroed clock for `pid`. Fails if one
    /// already exists — a process may not be migrated twice concurrently.
    pub fn begin_migration(&self, pid: i32) -> Result<MigrationClock, AgentError> {
        match self.clocks.lock().entry(pid) {
            Entry::Occupied(_) => Err(AgentError::AlreadyMigrating(pid)),
            Entry::Vacant(slot) => Ok(*slot.insert(MigrationClock::default())),
        }
    }

    /// Destination-side start: adopt the clock announced by the source.
    pub fn insert_mirror(&self, pid: i32, clock: MigrationClock) {
        self.clocks.lock().insert(pid, clock);
    }

    /// Advance local source time and return the resulting snapshot.
    pub fn tick_source(&self, pid: i32) -> Result<MigrationClock, AgentError> {
        let mut clocks = self.clocks.lock();
        let clock = clocks
            .get_mut(&pid)
            .ok_or(AgentError::UnknownMigration(pid))?;
        clock.source_time += 1;
        Ok(*clock)
    }

    /// Destination-side update for one received frame: advance local
    /// destination time and overwrite source time with the message's value
    /// (the sender guarantees it is never behind what we have seen).
    pub fn merge_remote(&self, pid: i32, source_time: u64) -> Result<MigrationClock, AgentError> {
        let mut clocks = self.clocks.lock();
        let clock = clocks
            .get_mut(&pid)
            .ok_or(AgentError::UnknownMigration(pid))?;
        clock.destination_time += 1;
        clock.source_time = source_time;
        Ok(*clock)
    }

    /// Consistent snapshot of a clock pair.
    pub fn snapshot(&self, pid: i32) -> Option<MigrationClock> {
        self.clocks.lock().get(&pid).copied()
    }

    pub fn end_migration(&self, pid: i32) {
        self.clocks.lock().remove(&pid);
    }

    pub fn active_count(&self) -> usize {
        self.clocks.lock().len()
    }
}
