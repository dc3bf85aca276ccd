//! Identifier newtypes and the time-range primitive.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Version counter for the whole store. A write transaction is assigned
/// generation `g` at begin; its changes become visible as generation `g + 1`
/// once committed. Readers pin a generation and see a consistent view of the
/// store as of that generation for the lifetime of their handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(pub u64);

impl Generation {
    pub const ZERO: Generation = Generation(0);

    #[must_use]
    pub fn next(self) -> Generation {
        Generation(self.0 + 1)
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// Identifies one client connection for the lifetime of the server process.
/// Connections are the origin of locks, intents, and notification
/// listenership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Per-connection identifier of an advisory write intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IntentUid(pub u64);

impl fmt::Display for IntentUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "intent-{}", self.0)
    }
}

/// Identifies one storage handle in the generation reference counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HolderId(pub u64);

/// Half-open time interval `[start, end)` in the pipeline's native epoch.
///
/// Locks, intents, and notifications are all scoped to a range on a logical
/// key; overlap is the only relation the coordination layer ever asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    #[must_use]
    pub fn new(start: i64, end: i64) -> Self {
        TimeRange { start, end }
    }

    /// Half-open overlap check; touching ranges do not overlap.
    #[must_use]
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_is_half_open() {
        let a = TimeRange::new(0, 10);
        assert!(a.overlaps(&TimeRange::new(9, 20)));
        assert!(a.overlaps(&TimeRange::new(-5, 1)));
        assert!(!a.overlaps(&TimeRange::new(10, 20)));
        assert!(!a.overlaps(&TimeRange::new(-5, 0)));
    }

    #[test]
    fn overlap_is_symmetric() {
        let a = TimeRange::new(0, 100);
        let b = TimeRange::new(50, 150);
        assert!(a.overlaps(&b));
        assert!(b.overlaps(&a));
    }

    #[test]
    fn generation_ordering() {
        assert!(Generation(3) < Generation(4));
        assert_eq!(Generation(3).next(), Generation(4));
    }
}
