//! Per-connection transaction state machine.
//!
//! A transaction pins one storage handle (read or write), collects lock
//! guards, queues notifications, and stages intent changes. Commit of a
//! write transaction applies staged intent changes, commits the storage
//! handle, releases all locks, and only then dispatches the queued
//! notifications; releasing the locks first means a listener that reacts to
//! a notification by locking the same range never deadlocks against the
//! committing transaction.

use parking_lot::Mutex;
use std::fs::File;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, warn};

use harbor_storage::{ReadHandle, Storage, WriteHandle};
use harbor_types::{ArchiveError, ConnectionId, Generation, IntentUid, TimeRange};

use crate::intent::IntentTracker;
use crate::locker::{ArchiveLocker, DeniedBy, LockGuard};
use crate::notify::{NotificationDispatch, QueuedNotification};

/// Transaction state visible to other tasks (diagnostics, denial messages).
#[derive(Debug)]
pub struct TxnShared {
    pub write: bool,
    pub generation: Generation,
    pub status: String,
    pub started: Instant,
    pub locks_held: usize,
    pub queued_notifications: usize,
}

/// The connection registry holds one slot per connection; `Some` while a
/// transaction is open.
pub type TxnSlot = Arc<Mutex<Option<TxnShared>>>;

/// Outcome of a lock attempt inside a transaction.
#[derive(Debug)]
pub enum LockAttempt {
    Granted,
    /// Blocked by a conflicting lock from this origin.
    DeniedByLock(ConnectionId),
    /// Blocked by declared write intents; each listed origin is owed an
    /// intent-hit push before the denial is reported.
    DeniedByIntent(Vec<ConnectionId>),
}

enum Handle {
    Read(ReadHandle),
    Write(WriteHandle),
}

pub struct Transaction {
    origin: ConnectionId,
    generation: Generation,
    storage: Storage,
    locker: ArchiveLocker,
    intents: IntentTracker,
    dispatch: NotificationDispatch,
    handle: Option<Handle>,
    locks: Vec<LockGuard>,
    queued: Vec<QueuedNotification>,
    staged_acquires: Vec<(IntentUid, String, TimeRange)>,
    staged_releases: Vec<IntentUid>,
    slot: TxnSlot,
    finished: bool,
}

impl Transaction {
    /// Opens a transaction for `origin`, pinning a storage handle and
    /// publishing its state into `slot`.
    pub fn begin(
        origin: ConnectionId,
        write: bool,
        storage: Storage,
        locker: ArchiveLocker,
        intents: IntentTracker,
        dispatch: NotificationDispatch,
        slot: TxnSlot,
    ) -> Result<Transaction, ArchiveError> {
        let handle = if write {
            Handle::Write(storage.begin_write()?)
        } else {
            Handle::Read(storage.begin_read())
        };
        let generation = match &handle {
            Handle::Read(h) => h.generation(),
            Handle::Write(h) => h.generation(),
        };
        *slot.lock() = Some(TxnShared {
            write,
            generation,
            status: "active".to_string(),
            started: Instant::now(),
            locks_held: 0,
            queued_notifications: 0,
        });
        debug!(%origin, %generation, write, "transaction opened");
        Ok(Transaction {
            origin,
            generation,
            storage,
            locker,
            intents,
            dispatch,
            handle: Some(handle),
            locks: Vec::new(),
            queued: Vec::new(),
            staged_acquires: Vec::new(),
            staged_releases: Vec::new(),
            slot,
            finished: false,
        })
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self.handle, Some(Handle::Write(_)))
    }

    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn set_status(&self, status: &str) {
        self.update_slot(|shared| shared.status = status.to_string());
    }

    fn update_slot(&self, f: impl FnOnce(&mut TxnShared)) {
        if let Some(shared) = self.slot.lock().as_mut() {
            f(shared);
        }
    }

    fn write_handle(&mut self) -> Result<&mut WriteHandle, ArchiveError> {
        match self.handle.as_mut() {
            Some(Handle::Write(h)) => Ok(h),
            _ => Err(ArchiveError::WriteTransactionRequired),
        }
    }

    /// Opens `name` as seen at this transaction's generation.
    pub fn read_file(&self, name: &str) -> Result<(File, u64), ArchiveError> {
        self.storage.read_file(name, self.generation)
    }

    /// Stages a write of `name`; the caller streams content into the
    /// returned path.
    pub fn stage_write(&mut self, name: &str) -> Result<PathBuf, ArchiveError> {
        self.write_handle()?.write_file(name)
    }

    /// Discards a staged write whose content never materialized.
    pub fn unstage_write(&mut self, name: &str) -> Result<(), ArchiveError> {
        self.write_handle()?.unstage(name)
    }

    pub fn remove_file(&mut self, name: &str) -> Result<(), ArchiveError> {
        self.write_handle()?.remove_file(name)
    }

    /// Attempts a read lock. Declared write intents take precedence over the
    /// lock table: the conflicting origins are reported so they can be
    /// pushed an intent hit.
    pub fn lock_read(&mut self, key: &str, range: TimeRange) -> LockAttempt {
        let conflicting = self.intents.conflicting(self.origin, key, range);
        if !conflicting.is_empty() {
            return LockAttempt::DeniedByIntent(conflicting);
        }
        match self
            .locker
            .acquire_read(self.generation, self.origin, key, range)
        {
            Ok(guard) => {
                self.locks.push(guard);
                self.update_slot(|shared| shared.locks_held += 1);
                LockAttempt::Granted
            }
            Err(DeniedBy(origin)) => LockAttempt::DeniedByLock(origin),
        }
    }

    /// Attempts a write lock; requires a write transaction.
    pub fn lock_write(&mut self, key: &str, range: TimeRange) -> Result<LockAttempt, ArchiveError> {
        if !self.is_write() {
            return Err(ArchiveError::WriteTransactionRequired);
        }
        let conflicting = self.intents.conflicting(self.origin, key, range);
        if !conflicting.is_empty() {
            return Ok(LockAttempt::DeniedByIntent(conflicting));
        }
        match self
            .locker
            .acquire_write(self.generation, self.origin, key, range)
        {
            Ok(guard) => {
                self.locks.push(guard);
                self.update_slot(|shared| shared.locks_held += 1);
                Ok(LockAttempt::Granted)
            }
            Err(DeniedBy(origin)) => Ok(LockAttempt::DeniedByLock(origin)),
        }
    }

    /// Queues a notification for dispatch at commit.
    pub fn send_notification(&mut self, key: &str, range: TimeRange) -> Result<(), ArchiveError> {
        if !self.is_write() {
            return Err(ArchiveError::WriteTransactionRequired);
        }
        self.queued.push(self.dispatch.queue(key, range));
        self.update_slot(|shared| shared.queued_notifications += 1);
        Ok(())
    }

    /// Declares an intent. Immediate intents register right away; staged
    /// ones take effect at commit and require a write transaction.
    pub fn acquire_intent(
        &mut self,
        uid: IntentUid,
        key: &str,
        range: TimeRange,
        immediate: bool,
    ) -> Result<(), ArchiveError> {
        if immediate {
            self.intents.acquire(self.origin, uid, key, range);
            return Ok(());
        }
        if !self.is_write() {
            return Err(ArchiveError::WriteTransactionRequired);
        }
        self.staged_acquires.push((uid, key.to_string(), range));
        Ok(())
    }

    pub fn release_intent(&mut self, uid: IntentUid, immediate: bool) -> Result<(), ArchiveError> {
        if immediate {
            return match self.intents.release(self.origin, uid) {
                Some(_) => Ok(()),
                None => Err(ArchiveError::UnknownIntent(uid)),
            };
        }
        if !self.is_write() {
            return Err(ArchiveError::WriteTransactionRequired);
        }
        self.staged_releases.push(uid);
        Ok(())
    }

    /// Applies staged intent changes, returning what the releases removed so
    /// a later failure can restore them. On a failed release every change
    /// already made is rolled back, leaving the intent table untouched.
    fn apply_staged_intents(
        &mut self,
    ) -> Result<Vec<(IntentUid, String, TimeRange)>, ArchiveError> {
        let mut released: Vec<(IntentUid, String, TimeRange)> = Vec::new();
        for uid in &self.staged_releases {
            match self.intents.release(self.origin, *uid) {
                Some((key, range)) => released.push((*uid, key, range)),
                None => {
                    for (uid, key, range) in released {
                        self.intents.acquire(self.origin, uid, &key, range);
                    }
                    return Err(ArchiveError::UnknownIntent(*uid));
                }
            }
        }
        for (uid, key, range) in &self.staged_acquires {
            self.intents.acquire(self.origin, *uid, key, *range);
        }
        // staged_acquires stays until the storage commit succeeds; a failed
        // commit needs it to undo the acquisitions.
        self.staged_releases.clear();
        Ok(released)
    }

    fn rollback_staged_intents(
        &self,
        released: &[(IntentUid, String, TimeRange)],
        acquired: &[(IntentUid, String, TimeRange)],
    ) {
        for (uid, _, _) in acquired {
            if self.intents.release(self.origin, *uid).is_none() {
                warn!(%uid, "staged intent vanished during rollback");
            }
        }
        for (uid, key, range) in released {
            self.intents.acquire(self.origin, *uid, key, *range);
        }
    }

    /// Commits the transaction. For a read transaction this only releases
    /// the handle and locks. For a write transaction: staged intent changes,
    /// then the storage commit (progress feeds the status string), then lock
    /// release, then notification dispatch. `deliver` enqueues one push on
    /// one connection; the committing origin is skipped so a transaction
    /// listening on its own key cannot wait on itself.
    pub async fn commit(
        mut self,
        mut deliver: impl FnMut(ConnectionId, QueuedNotification) -> bool,
    ) -> Result<Option<Generation>, ArchiveError> {
        self.finished = true;
        let handle = self.handle.take();
        match handle {
            None | Some(Handle::Read(_)) => {
                // Dropping the read handle releases its generation pin.
                self.locks.clear();
                *self.slot.lock() = None;
                Ok(None)
            }
            Some(Handle::Write(write)) => {
                let released = match self.apply_staged_intents() {
                    Ok(released) => released,
                    Err(err) => {
                        write.abort();
                        self.locks.clear();
                        *self.slot.lock() = None;
                        return Err(err);
                    }
                };

                let slot = Arc::clone(&self.slot);
                let commit_result = write.commit(|done, total| {
                    if let Some(shared) = slot.lock().as_mut() {
                        shared.status = format!("commit {done}/{total}");
                    }
                });
                let visible = match commit_result {
                    Ok(visible) => visible,
                    Err(err) => {
                        // The journal never became durable; nothing was
                        // applied. Undo the intent changes and fail cleanly.
                        self.rollback_staged_intents(&released, &self.staged_acquires);
                        self.staged_acquires.clear();
                        self.locks.clear();
                        *self.slot.lock() = None;
                        return Err(err);
                    }
                };
                self.staged_acquires.clear();

                // Locks go first so notified listeners can lock immediately.
                self.locks.clear();
                self.update_slot(|shared| {
                    shared.locks_held = 0;
                    shared.status = "notifying".to_string();
                });

                let origin = self.origin;
                let queued = std::mem::take(&mut self.queued);
                self.dispatch
                    .dispatch(&queued, |conn, notification| {
                        conn != origin && deliver(conn, notification)
                    })
                    .await;

                *self.slot.lock() = None;
                debug!(%origin, generation = %visible, "transaction committed");
                Ok(Some(visible))
            }
        }
    }

    /// Aborts the transaction, discarding staged content, queued
    /// notifications, and staged intent changes.
    pub fn abort(mut self) {
        self.finished = true;
        match self.handle.take() {
            Some(Handle::Write(write)) => write.abort(),
            Some(Handle::Read(read)) => read.release(),
            None => {}
        }
        self.locks.clear();
        self.queued.clear();
        self.staged_acquires.clear();
        self.staged_releases.clear();
        *self.slot.lock() = None;
        debug!(origin = %self.origin, "transaction aborted");
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            error!(
                origin = %self.origin,
                generation = %self.generation,
                "transaction dropped without commit or abort; forcing abort"
            );
            if let Some(Handle::Write(write)) = self.handle.take() {
                write.abort();
            }
            self.locks.clear();
            *self.slot.lock() = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const A: ConnectionId = ConnectionId(1);
    const B: ConnectionId = ConnectionId(2);

    struct Fixture {
        storage: Storage,
        locker: ArchiveLocker,
        intents: IntentTracker,
        dispatch: NotificationDispatch,
    }

    impl Fixture {
        fn new(root: &std::path::Path) -> Fixture {
            Fixture {
                storage: Storage::open(root).unwrap(),
                locker: ArchiveLocker::new(),
                intents: IntentTracker::new(),
                dispatch: NotificationDispatch::new(),
            }
        }

        fn begin(&self, origin: ConnectionId, write: bool) -> (Transaction, TxnSlot) {
            let slot: TxnSlot = Arc::new(Mutex::new(None));
            let txn = Transaction::begin(
                origin,
                write,
                self.storage.clone(),
                self.locker.clone(),
                self.intents.clone(),
                self.dispatch.clone(),
                Arc::clone(&slot),
            )
            .unwrap();
            (txn, slot)
        }
    }

    #[tokio::test]
    async fn write_commit_applies_and_releases() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path());

        let (mut txn, slot) = fx.begin(A, true);
        assert!(matches!(
            txn.lock_write("line/a.dat", TimeRange::new(0, 100)),
            Ok(LockAttempt::Granted)
        ));
        let staged = txn.stage_write("line/a.dat").unwrap();
        std::fs::write(staged, b"payload").unwrap();
        assert_eq!(slot.lock().as_ref().unwrap().locks_held, 1);

        let visible = txn.commit(|_, _| true).await.unwrap();
        assert_eq!(visible, Some(Generation(1)));
        assert!(slot.lock().is_none());
        assert!(fx.locker.snapshot().is_empty());

        let (read, _) = fx.begin(B, false);
        let (mut file, _) = read.read_file("line/a.dat").unwrap();
        let mut out = Vec::new();
        std::io::Read::read_to_end(&mut file, &mut out).unwrap();
        assert_eq!(out, b"payload");
        read.abort();
    }

    #[tokio::test]
    async fn intent_conflict_blocks_lock() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        fx.intents
            .acquire(B, IntentUid(1), "line/a.dat", TimeRange::new(0, 100));

        let (mut txn, _slot) = fx.begin(A, true);
        match txn.lock_write("line/a.dat", TimeRange::new(50, 60)).unwrap() {
            LockAttempt::DeniedByIntent(origins) => assert_eq!(origins, vec![B]),
            other => panic!("expected intent denial, got {other:?}"),
        }
        txn.abort();
    }

    #[tokio::test]
    async fn staged_intents_swap_at_commit() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        fx.intents
            .acquire(A, IntentUid(1), "old", TimeRange::new(0, 10));

        let (mut txn, _slot) = fx.begin(A, true);
        txn.release_intent(IntentUid(1), false).unwrap();
        txn.acquire_intent(IntentUid(2), "new", TimeRange::new(0, 10), false)
            .unwrap();
        // Nothing moved yet.
        assert_eq!(fx.intents.snapshot().len(), 1);
        assert_eq!(fx.intents.snapshot()[0].uid, 1);

        txn.commit(|_, _| true).await.unwrap();
        let after = fx.intents.snapshot();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].uid, 2);
        assert_eq!(after[0].key, "new");
    }

    #[tokio::test]
    async fn staged_release_of_unknown_intent_aborts_commit() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        fx.intents
            .acquire(A, IntentUid(1), "held", TimeRange::new(0, 10));

        let (mut txn, slot) = fx.begin(A, true);
        txn.release_intent(IntentUid(1), false).unwrap();
        txn.release_intent(IntentUid(9), false).unwrap();
        let err = txn.commit(|_, _| true).await.unwrap_err();
        assert!(matches!(err, ArchiveError::UnknownIntent(IntentUid(9))));
        assert!(slot.lock().is_none());

        // The successfully released intent was restored.
        let after = fx.intents.snapshot();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].uid, 1);
    }

    #[tokio::test]
    async fn committing_origin_is_skipped_in_dispatch() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        fx.dispatch.listen(A, "line");
        fx.dispatch.listen(B, "line");

        let (mut txn, _slot) = fx.begin(A, true);
        txn.send_notification("line", TimeRange::new(0, 100)).unwrap();

        let mut delivered = Vec::new();
        // B acknowledges implicitly by disconnecting after delivery.
        let dispatch = fx.dispatch.clone();
        txn.commit(|conn, _| {
            delivered.push(conn);
            dispatch.disconnect(conn);
            true
        })
        .await
        .unwrap();
        assert_eq!(delivered, vec![B]);
    }

    #[tokio::test]
    async fn read_transaction_rejects_write_ops() {
        let dir = tempdir().unwrap();
        let fx = Fixture::new(dir.path());
        let (mut txn, _slot) = fx.begin(A, false);
        assert!(matches!(
            txn.stage_write("line/a.dat"),
            Err(ArchiveError::WriteTransactionRequired)
        ));
        assert!(matches!(
            txn.lock_write("k", TimeRange::new(0, 1)),
            Err(ArchiveError::WriteTransactionRequired)
        ));
        assert!(matches!(
            txn.send_notification("k", TimeRange::new(0, 1)),
            Err(ArchiveError::WriteTransactionRequired)
        ));
        // Read locks are fine.
        assert!(matches!(
            txn.lock_read("k", TimeRange::new(0, 1)),
            LockAttempt::Granted
        ));
        txn.commit(|_, _| true).await.unwrap();
    }
}
