//! In-memory interval lock table.
//!
//! Locks are kept per key, sorted by generation, so conflict scans can bound
//! themselves to "locks below generation X" with a partition point. The
//! generation comparisons implement snapshot semantics:
//!
//! * a read at generation `g` only conflicts with *write* locks below `g`
//!   (a same-generation write is invisible to that read);
//! * a write at generation `g` conflicts with any overlapping lock from
//!   another origin whose generation is strictly above `g`; a lock at or
//!   below `g` will observe the redirection the commit leaves behind. A read
//!   lock ahead of the writer happens when another write transaction has
//!   already advanced the generation sequence; that reader could observe a
//!   partial state and must win.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use harbor_proto::diag::LockInfo;
use harbor_types::{ConnectionId, Generation, TimeRange};

/// A lock request was blocked; carries the blocking origin so the caller can
/// report who to wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeniedBy(pub ConnectionId);

#[derive(Debug)]
struct LockEntry {
    id: u64,
    origin: ConnectionId,
    generation: Generation,
    range: TimeRange,
    write: bool,
}

#[derive(Debug, Default)]
struct LockTable {
    keys: HashMap<String, Vec<LockEntry>>,
    next_id: u64,
}

/// The archive's lock manager. Cheap to clone; all clones share one table.
#[derive(Debug, Clone, Default)]
pub struct ArchiveLocker {
    table: Arc<Mutex<LockTable>>,
}

impl ArchiveLocker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires a read lock at `generation`.
    pub fn acquire_read(
        &self,
        generation: Generation,
        origin: ConnectionId,
        key: &str,
        range: TimeRange,
    ) -> Result<LockGuard, DeniedBy> {
        let mut table = self.table.lock();
        if let Some(entries) = table.keys.get(key) {
            // Writes at or above our generation are invisible to this read.
            let below = entries.partition_point(|e| e.generation < generation);
            if let Some(blocker) = entries
                .iter()
                .take(below)
                .find(|e| e.write && e.origin != origin && e.range.overlaps(&range))
            {
                return Err(DeniedBy(blocker.origin));
            }
        }
        Ok(self.insert(&mut table, generation, origin, key, range, false))
    }

    /// Acquires a write lock at `generation`.
    pub fn acquire_write(
        &self,
        generation: Generation,
        origin: ConnectionId,
        key: &str,
        range: TimeRange,
    ) -> Result<LockGuard, DeniedBy> {
        let mut table = self.table.lock();
        if let Some(entries) = table.keys.get(key) {
            if let Some(blocker) = entries.iter().find(|e| {
                e.origin != origin && e.range.overlaps(&range) && e.generation > generation
            }) {
                return Err(DeniedBy(blocker.origin));
            }
        }
        Ok(self.insert(&mut table, generation, origin, key, range, true))
    }

    fn insert(
        &self,
        table: &mut LockTable,
        generation: Generation,
        origin: ConnectionId,
        key: &str,
        range: TimeRange,
        write: bool,
    ) -> LockGuard {
        let id = table.next_id;
        table.next_id += 1;
        let entries = table.keys.entry(key.to_string()).or_default();
        let position = entries.partition_point(|e| e.generation <= generation);
        entries.insert(
            position,
            LockEntry {
                id,
                origin,
                generation,
                range,
                write,
            },
        );
        debug!(%origin, %generation, key, %range, write, "lock acquired");
        LockGuard {
            locker: self.clone(),
            key: key.to_string(),
            id,
        }
    }

    fn release(&self, key: &str, id: u64) {
        let mut table = self.table.lock();
        if let Some(entries) = table.keys.get_mut(key) {
            entries.retain(|e| e.id != id);
            if entries.is_empty() {
                table.keys.remove(key);
            }
            debug!(key, id, "lock released");
        }
    }

    /// All currently held locks, for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LockInfo> {
        let table = self.table.lock();
        let mut out: Vec<LockInfo> = table
            .keys
            .iter()
            .flat_map(|(key, entries)| {
                entries.iter().map(move |e| LockInfo {
                    origin: e.origin.0,
                    generation: e.generation.0,
                    key: key.clone(),
                    start: e.range.start,
                    end: e.range.end,
                    write: e.write,
                })
            })
            .collect();
        out.sort_by(|a, b| (&a.key, a.generation).cmp(&(&b.key, b.generation)));
        out
    }
}

/// A held lock; released on drop.
#[derive(Debug)]
pub struct LockGuard {
    locker: ArchiveLocker,
    key: String,
    id: u64,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.locker.release(&self.key, self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ConnectionId = ConnectionId(1);
    const B: ConnectionId = ConnectionId(2);

    fn range(start: i64, end: i64) -> TimeRange {
        TimeRange::new(start, end)
    }

    #[test]
    fn disjoint_ranges_never_conflict() {
        let locker = ArchiveLocker::new();
        let _w = locker
            .acquire_write(Generation(5), A, "k", range(0, 100))
            .unwrap();
        // Any origin, any generation, any type: disjoint is always granted.
        let _r = locker
            .acquire_read(Generation(9), B, "k", range(100, 200))
            .unwrap();
        let _w2 = locker
            .acquire_write(Generation(1), B, "k", range(200, 300))
            .unwrap();
    }

    #[test]
    fn different_keys_never_conflict() {
        let locker = ArchiveLocker::new();
        let _w = locker
            .acquire_write(Generation(5), A, "k1", range(0, 100))
            .unwrap();
        let _w2 = locker
            .acquire_write(Generation(9), B, "k2", range(0, 100))
            .unwrap();
    }

    #[test]
    fn read_conflicts_only_with_earlier_writes() {
        let locker = ArchiveLocker::new();
        let _w = locker
            .acquire_write(Generation(5), A, "k", range(0, 100))
            .unwrap();

        // The write at generation 5 is invisible to reads at 5 or below.
        let _r5 = locker
            .acquire_read(Generation(5), B, "k", range(0, 100))
            .unwrap();
        let _r3 = locker
            .acquire_read(Generation(3), B, "k", range(0, 100))
            .unwrap();

        // A read above the write's generation would observe it mid-flight.
        let denied = locker
            .acquire_read(Generation(6), B, "k", range(50, 150))
            .unwrap_err();
        assert_eq!(denied, DeniedBy(A));
    }

    #[test]
    fn write_behind_a_later_lock_is_denied() {
        let locker = ArchiveLocker::new();
        let _held = locker
            .acquire_write(Generation(6), A, "k", range(0, 100))
            .unwrap();

        // Requesting at a lower generation than an overlapping holder: the
        // holder's effects would land above us, so we must not write under it.
        let denied = locker
            .acquire_write(Generation(5), B, "k", range(50, 150))
            .unwrap_err();
        assert_eq!(denied, DeniedBy(A));

        // At or above the holder's generation we see its redirection.
        let _ok = locker
            .acquire_write(Generation(6), B, "k", range(50, 150))
            .unwrap();
    }

    #[test]
    fn write_denied_by_read_ahead_of_it() {
        let locker = ArchiveLocker::new();
        let _read = locker
            .acquire_read(Generation(8), A, "k", range(0, 100))
            .unwrap();

        let denied = locker
            .acquire_write(Generation(7), B, "k", range(0, 10))
            .unwrap_err();
        assert_eq!(denied, DeniedBy(A));

        // A read at or behind the writer's generation is fine.
        let _ok = locker
            .acquire_write(Generation(8), B, "k", range(0, 10))
            .unwrap();
    }

    #[test]
    fn same_origin_never_conflicts_with_itself() {
        let locker = ArchiveLocker::new();
        let _w = locker
            .acquire_write(Generation(5), A, "k", range(0, 100))
            .unwrap();
        let _w2 = locker
            .acquire_write(Generation(2), A, "k", range(0, 100))
            .unwrap();
        let _r = locker
            .acquire_read(Generation(9), A, "k", range(0, 100))
            .unwrap();
    }

    #[test]
    fn release_on_drop_unblocks() {
        let locker = ArchiveLocker::new();
        let held = locker
            .acquire_write(Generation(9), A, "k", range(0, 100))
            .unwrap();
        assert!(locker
            .acquire_write(Generation(5), B, "k", range(0, 100))
            .is_err());
        drop(held);
        assert!(locker
            .acquire_write(Generation(5), B, "k", range(0, 100))
            .is_ok());
        assert_eq!(locker.snapshot().len(), 1);
    }
}
