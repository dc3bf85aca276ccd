//! Advisory write-intent registry.
//!
//! Intents never conflict with each other and are never rejected; they exist
//! so a lock requester can discover who is about to write a range and push
//! an intent hit to them *before* the real lock conflict materializes.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use harbor_proto::diag::IntentInfo;
use harbor_types::{ConnectionId, IntentUid, TimeRange};

#[derive(Debug)]
struct IntentEntry {
    uid: IntentUid,
    key: String,
    range: TimeRange,
}

/// Registry of declared intents. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct IntentTracker {
    by_origin: Arc<Mutex<HashMap<ConnectionId, Vec<IntentEntry>>>>,
}

impl IntentTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, origin: ConnectionId, uid: IntentUid, key: &str, range: TimeRange) {
        debug!(%origin, %uid, key, %range, "intent acquired");
        self.by_origin
            .lock()
            .entry(origin)
            .or_default()
            .push(IntentEntry {
                uid,
                key: key.to_string(),
                range,
            });
    }

    /// Releases one intent, returning what it covered, or `None` if it was
    /// not held.
    pub fn release(&self, origin: ConnectionId, uid: IntentUid) -> Option<(String, TimeRange)> {
        let mut by_origin = self.by_origin.lock();
        let entries = by_origin.get_mut(&origin)?;
        let position = entries.iter().position(|e| e.uid == uid)?;
        let entry = entries.remove(position);
        if entries.is_empty() {
            by_origin.remove(&origin);
        }
        Some((entry.key, entry.range))
    }

    /// Origins other than `origin` holding an intent overlapping the range.
    #[must_use]
    pub fn conflicting(
        &self,
        origin: ConnectionId,
        key: &str,
        range: TimeRange,
    ) -> Vec<ConnectionId> {
        let by_origin = self.by_origin.lock();
        let mut out: Vec<ConnectionId> = by_origin
            .iter()
            .filter(|(other, _)| **other != origin)
            .filter(|(_, entries)| {
                entries
                    .iter()
                    .any(|e| e.key == key && e.range.overlaps(&range))
            })
            .map(|(other, _)| *other)
            .collect();
        out.sort();
        out
    }

    /// Drops everything a disconnecting origin still holds.
    pub fn disconnect(&self, origin: ConnectionId) {
        if self.by_origin.lock().remove(&origin).is_some() {
            debug!(%origin, "released intents of disconnected origin");
        }
    }

    /// All declared intents, for diagnostics.
    #[must_use]
    pub fn snapshot(&self) -> Vec<IntentInfo> {
        let by_origin = self.by_origin.lock();
        let mut out: Vec<IntentInfo> = by_origin
            .iter()
            .flat_map(|(origin, entries)| {
                entries.iter().map(move |e| IntentInfo {
                    origin: origin.0,
                    uid: e.uid.0,
                    key: e.key.clone(),
                    start: e.range.start,
                    end: e.range.end,
                })
            })
            .collect();
        out.sort_by(|a, b| (a.origin, a.uid).cmp(&(b.origin, b.uid)));
        out
    }
}
