//! The store proper: generations, handles, redirections, commit, recovery.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, File};
use std::io;
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::UNIX_EPOCH;
use tracing::{debug, error, warn};

use harbor_types::{ArchiveError, Generation, HolderId};

use crate::journal::{self, Journal, JournalAction, JOURNAL_FILE};
use crate::names;

const VERSION_FILE: &str = ".version";
const VERSION_TMP: &str = ".version.tmp";
const TRANSACTION_PREFIX: &str = ".transaction_";
const REDIRECTION_PREFIX: &str = ".redirection_";

/// What a redirection remembers about one displaced name.
#[derive(Debug)]
enum RedirectEntry {
    /// The pre-commit content was preserved under the redirection directory.
    Preserved,
    /// The commit created the file; older readers must see it as absent.
    Absent,
}

/// Pre-commit content displaced by the commit that became visible at
/// `Redirection`'s generation, kept alive for readers pinned below it.
#[derive(Debug)]
struct Redirection {
    dir: PathBuf,
    entries: HashMap<String, RedirectEntry>,
}

#[derive(Debug)]
struct Meta {
    /// Generation new readers pin.
    current: Generation,
    /// Generation the next write transaction is assigned.
    next_write: Generation,
    next_holder: u64,
    /// Live handle references per generation.
    refs: BTreeMap<Generation, HashSet<HolderId>>,
    /// Keyed by the generation at which the displacing commit became visible.
    redirections: BTreeMap<Generation, Redirection>,
    /// Names staged by currently open write transactions.
    staged: HashMap<String, Generation>,
}

struct Inner {
    root: PathBuf,
    meta: Mutex<Meta>,
}

/// Handle to the archive store. Cheap to clone; all clones share one store.
#[derive(Clone)]
pub struct Storage {
    inner: Arc<Inner>,
}

impl Storage {
    /// Opens (or creates) the store at `root`, replaying any journal left
    /// behind by a crash and discarding stale redirection directories.
    pub fn open(root: impl Into<PathBuf>) -> Result<Storage, ArchiveError> {
        let root = root.into();
        fs::create_dir_all(&root)?;

        let floor = recover(&root)?;

        let version_path = root.join(VERSION_FILE);
        let stored = match fs::read_to_string(&version_path) {
            Ok(raw) => raw
                .trim()
                .parse::<u64>()
                .map(Generation)
                .map_err(|_| ArchiveError::Io(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("corrupt {VERSION_FILE}"),
                )))?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Generation::ZERO,
            Err(err) => return Err(err.into()),
        };
        let current = stored.max(floor);
        if current != stored {
            write_version(&root, current)?;
        } else if !version_path.exists() {
            write_version(&root, current)?;
        }

        debug!(root = %root.display(), generation = %current, "storage opened");
        Ok(Storage {
            inner: Arc::new(Inner {
                root,
                meta: Mutex::new(Meta {
                    current,
                    next_write: current,
                    next_holder: 0,
                    refs: BTreeMap::new(),
                    redirections: BTreeMap::new(),
                    staged: HashMap::new(),
                }),
            }),
        })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Generation a reader beginning now would pin.
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.inner.meta.lock().current
    }

    /// Pins the current generation for reading.
    #[must_use]
    pub fn begin_read(&self) -> ReadHandle {
        let mut meta = self.inner.meta.lock();
        let generation = meta.current;
        let holder = allocate_holder(&mut meta, generation);
        ReadHandle {
            storage: self.clone(),
            generation,
            holder,
            released: false,
        }
    }

    /// Allocates the next write generation and its staging directory.
    pub fn begin_write(&self) -> Result<WriteHandle, ArchiveError> {
        let (generation, holder) = {
            let mut meta = self.inner.meta.lock();
            let generation = meta.next_write;
            meta.next_write = generation.next();
            let holder = allocate_holder(&mut meta, generation);
            (generation, holder)
        };
        let staging_dir = self
            .inner
            .root
            .join(format!("{TRANSACTION_PREFIX}{}", generation.0));
        if let Err(err) = fs::create_dir(&staging_dir) {
            self.release(generation, holder);
            return Err(err.into());
        }
        Ok(WriteHandle {
            storage: self.clone(),
            generation,
            holder,
            staging_dir,
            actions: BTreeMap::new(),
            next_stage: 0,
            finished: false,
        })
    }

    /// Opens `name` as seen at `generation`. The open happens under the meta
    /// lock so a concurrent commit cannot displace the file in between.
    pub fn read_file(
        &self,
        name: &str,
        generation: Generation,
    ) -> Result<(File, u64), ArchiveError> {
        let name = names::normalize(name, true)?;
        let meta = self.inner.meta.lock();

        let mut path = None;
        for (_, redirection) in meta
            .redirections
            .range((Bound::Excluded(generation), Bound::Unbounded))
        {
            match redirection.entries.get(name) {
                Some(RedirectEntry::Preserved) => {
                    path = Some(redirection.dir.join(name));
                    break;
                }
                Some(RedirectEntry::Absent) => {
                    return Err(ArchiveError::NotFound(name.to_string()));
                }
                None => {}
            }
        }
        let path = path.unwrap_or_else(|| self.inner.root.join(name));

        let file = File::open(&path).map_err(|err| {
            if err.kind() == io::ErrorKind::NotFound {
                ArchiveError::NotFound(name.to_string())
            } else {
                ArchiveError::Io(err)
            }
        })?;
        let metadata = file.metadata()?;
        if !metadata.is_file() {
            return Err(ArchiveError::InvalidName(name.to_string()));
        }
        Ok((file, metadata.len()))
    }

    /// Regular files under `path` (recursively) with mtime strictly greater
    /// than `modified_after`, skipping dot-entries at every level. Paths are
    /// relative to the store root, sorted.
    pub fn list_files(
        &self,
        path: &str,
        modified_after: f64,
    ) -> Result<Vec<(String, f64)>, ArchiveError> {
        let path = names::normalize_dir(path)?;
        let base = if path.is_empty() {
            self.inner.root.clone()
        } else {
            self.inner.root.join(path)
        };
        let mut out = Vec::new();
        if base.is_dir() {
            walk_files(&base, path, modified_after, &mut out)?;
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(out)
    }

    fn release(&self, generation: Generation, holder: HolderId) {
        let mut meta = self.inner.meta.lock();
        if let Some(holders) = meta.refs.get_mut(&generation) {
            holders.remove(&holder);
            if holders.is_empty() {
                meta.refs.remove(&generation);
            }
        }
        self.evict_redirections(&mut meta);
    }

    /// Drops every redirection strictly below the lowest still-referenced
    /// generation (or all of them when nothing is referenced).
    fn evict_redirections(&self, meta: &mut Meta) {
        let min_ref = meta.refs.keys().next().copied();
        let expired: Vec<Generation> = meta
            .redirections
            .keys()
            .copied()
            .filter(|gen| match min_ref {
                Some(min) => *gen < min,
                None => true,
            })
            .collect();
        for gen in expired {
            if let Some(redirection) = meta.redirections.remove(&gen) {
                debug!(generation = %gen, "releasing redirection");
                if redirection.dir.exists() {
                    if let Err(err) = fs::remove_dir_all(&redirection.dir) {
                        warn!(
                            dir = %redirection.dir.display(),
                            %err,
                            "failed to delete redirection directory"
                        );
                    }
                }
            }
        }
    }

    fn claim_staged(&self, name: &str, generation: Generation) -> Result<(), ArchiveError> {
        let mut meta = self.inner.meta.lock();
        match meta.staged.get(name) {
            Some(owner) if *owner != generation => Err(ArchiveError::StagedElsewhere {
                name: name.to_string(),
            }),
            _ => {
                meta.staged.insert(name.to_string(), generation);
                Ok(())
            }
        }
    }

    fn unclaim(&self, name: &str, generation: Generation) {
        let mut meta = self.inner.meta.lock();
        if meta.staged.get(name) == Some(&generation) {
            meta.staged.remove(name);
        }
    }

    fn unclaim_all(&self, generation: Generation) {
        let mut meta = self.inner.meta.lock();
        meta.staged.retain(|_, owner| *owner != generation);
    }
}

fn allocate_holder(meta: &mut Meta, generation: Generation) -> HolderId {
    let holder = HolderId(meta.next_holder);
    meta.next_holder += 1;
    meta.refs.entry(generation).or_default().insert(holder);
    holder
}

/// Read access to the store at one pinned generation. The generation
/// reference is released on drop; `release` makes the point explicit.
pub struct ReadHandle {
    storage: Storage,
    generation: Generation,
    holder: HolderId,
    released: bool,
}

impl ReadHandle {
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn read_file(&self, name: &str) -> Result<(File, u64), ArchiveError> {
        self.storage.read_file(name, self.generation)
    }

    pub fn release(mut self) {
        self.released = true;
        self.storage.release(self.generation, self.holder);
    }
}

impl Drop for ReadHandle {
    fn drop(&mut self) {
        if !self.released {
            self.storage.release(self.generation, self.holder);
        }
    }
}

/// One pending change staged by a write transaction.
#[derive(Debug)]
enum Action {
    Write { staged: String },
    Remove,
}

/// Write access at one assigned generation. Changes are staged in a
/// per-transaction directory and only reach the store through `commit`;
/// `abort` (or a leak-detected drop) discards them.
pub struct WriteHandle {
    storage: Storage,
    generation: Generation,
    holder: HolderId,
    staging_dir: PathBuf,
    actions: BTreeMap<String, Action>,
    next_stage: u64,
    finished: bool,
}

impl WriteHandle {
    #[must_use]
    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Stages a write of `name` and returns the path the caller writes the
    /// new content to. Re-staging a name discards the previous staging;
    /// staging a name held by another open transaction is a hard error.
    pub fn write_file(&mut self, name: &str) -> Result<PathBuf, ArchiveError> {
        let name = names::normalize(name, true)?;
        self.storage.claim_staged(name, self.generation)?;
        let staged = match self.actions.get(name) {
            Some(Action::Write { staged }) => staged.clone(),
            _ => {
                let staged = format!("stage_{}", self.next_stage);
                self.next_stage += 1;
                staged
            }
        };
        let path = self.staging_dir.join(&staged);
        self.actions
            .insert(name.to_string(), Action::Write { staged });
        Ok(path)
    }

    /// Convenience for callers that already hold the content in memory.
    pub fn write_file_bytes(&mut self, name: &str, content: &[u8]) -> Result<(), ArchiveError> {
        let path = self.write_file(name)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// Discards a staged write of `name` and releases its claim. For callers
    /// that staged a name but failed to produce the content.
    pub fn unstage(&mut self, name: &str) -> Result<(), ArchiveError> {
        let name = names::normalize(name, true)?;
        if let Some(Action::Write { staged }) = self.actions.get(name) {
            let stale = self.staging_dir.join(staged);
            if let Err(err) = fs::remove_file(&stale) {
                if err.kind() != io::ErrorKind::NotFound {
                    return Err(err.into());
                }
            }
        }
        self.actions.remove(name);
        self.storage.unclaim(name, self.generation);
        Ok(())
    }

    /// Stages removal of `name`.
    pub fn remove_file(&mut self, name: &str) -> Result<(), ArchiveError> {
        let name = names::normalize(name, true)?;
        self.storage.claim_staged(name, self.generation)?;
        if let Some(Action::Write { staged }) = self.actions.get(name) {
            let stale = self.staging_dir.join(staged);
            if let Err(err) = fs::remove_file(&stale) {
                if err.kind() != io::ErrorKind::NotFound {
                    return Err(err.into());
                }
            }
        }
        self.actions.insert(name.to_string(), Action::Remove);
        Ok(())
    }

    /// Applies the staged changes. Crash-safe: the journal is durable before
    /// the first destination mutation, so a crash mid-apply is finished by
    /// startup recovery. An I/O failure after the journal is durable is
    /// fatal for the process; partial application cannot be rolled back
    /// without breaking pinned readers.
    pub fn commit(
        mut self,
        mut progress: impl FnMut(usize, usize),
    ) -> Result<Generation, ArchiveError> {
        self.finished = true;
        let visible = self.generation.next();

        let actions: Vec<(String, JournalAction)> = self
            .actions
            .iter()
            .map(|(name, action)| {
                let journaled = match action {
                    Action::Write { staged } => JournalAction::Rename {
                        staged: staged.clone(),
                        dest: name.clone(),
                    },
                    Action::Remove => JournalAction::Remove { dest: name.clone() },
                };
                (name.clone(), journaled)
            })
            .collect();

        // Before the journal is durable the commit can still fail cleanly.
        // A rename whose staged source is missing would only surface after
        // the point of no return, so it is checked here.
        for (name, action) in &actions {
            if let JournalAction::Rename { staged, .. } = action {
                if !self.staging_dir.join(staged).is_file() {
                    self.cleanup();
                    return Err(ArchiveError::Io(io::Error::new(
                        io::ErrorKind::NotFound,
                        format!("staged content for {name:?} is missing"),
                    )));
                }
            }
        }
        if let Err(err) = journal::write_journal(
            &self.staging_dir.join(JOURNAL_FILE),
            &Journal {
                generation: self.generation.0,
                actions: actions.iter().map(|(_, a)| a.clone()).collect(),
            },
        ) {
            self.cleanup();
            return Err(err.into());
        }

        // The journal is durable; from here on every failure is fatal. The
        // meta lock is held across the whole apply so no reader can begin or
        // resolve a path against a half-applied commit.
        let mut meta = self.storage.inner.meta.lock();

        let need_redirect = meta.refs.iter().any(|(gen, holders)| {
            *gen <= visible && holders.iter().any(|h| *h != self.holder)
        });
        let redirect_dir = self
            .storage
            .inner
            .root
            .join(format!("{REDIRECTION_PREFIX}{}", visible.0));
        let mut redirect_entries: HashMap<String, RedirectEntry> = HashMap::new();

        let total = actions.len();
        for (index, (name, action)) in actions.iter().enumerate() {
            let result = apply_action(
                &self.storage.inner.root,
                &self.staging_dir,
                name,
                action,
                need_redirect.then_some((redirect_dir.as_path(), &mut redirect_entries)),
            );
            if let Err(err) = result {
                fatal_commit(name, err);
            }
            progress(index + 1, total);
        }

        if let Err(err) = write_version(&self.storage.inner.root, visible.max(meta.current)) {
            fatal_commit(VERSION_FILE, err);
        }

        meta.current = meta.current.max(visible);
        meta.next_write = meta.next_write.max(visible);
        if !redirect_entries.is_empty() {
            meta.redirections.insert(
                visible,
                Redirection {
                    dir: redirect_dir,
                    entries: redirect_entries,
                },
            );
        }
        if let Some(holders) = meta.refs.get_mut(&self.generation) {
            holders.remove(&self.holder);
            if holders.is_empty() {
                meta.refs.remove(&self.generation);
            }
        }
        meta.staged.retain(|_, owner| *owner != self.generation);
        self.storage.evict_redirections(&mut meta);
        drop(meta);

        if let Err(err) = fs::remove_dir_all(&self.staging_dir) {
            fatal_commit(&self.staging_dir.display().to_string(), err);
        }

        debug!(generation = %visible, changes = total, "commit applied");
        Ok(visible)
    }

    /// Discards all staged changes.
    pub fn abort(mut self) {
        self.finished = true;
        self.cleanup();
    }

    fn cleanup(&mut self) {
        if let Err(err) = fs::remove_dir_all(&self.staging_dir) {
            if err.kind() != io::ErrorKind::NotFound {
                warn!(
                    dir = %self.staging_dir.display(),
                    %err,
                    "failed to delete staging directory"
                );
            }
        }
        self.storage.unclaim_all(self.generation);
        self.storage.release(self.generation, self.holder);
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if !self.finished {
            error!(
                generation = %self.generation,
                "write handle leaked without commit or abort; discarding staged changes"
            );
            self.cleanup();
        }
    }
}

fn fatal_commit(name: &str, err: io::Error) -> ! {
    error!(
        %name,
        %err,
        "unrecoverable I/O failure while applying a durable commit; aborting"
    );
    std::process::abort();
}

/// Applies one journaled action against the live tree, preserving displaced
/// content into the redirection when one is being built.
fn apply_action(
    root: &Path,
    staging_dir: &Path,
    name: &str,
    action: &JournalAction,
    redirect: Option<(&Path, &mut HashMap<String, RedirectEntry>)>,
) -> io::Result<()> {
    let dest = root.join(name);

    let mut displaced = false;
    if let Some((redirect_dir, entries)) = redirect {
        if dest.exists() {
            let preserved = redirect_dir.join(name);
            if let Some(parent) = preserved.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(&dest, &preserved)?;
            entries.insert(name.to_string(), RedirectEntry::Preserved);
            displaced = true;
        } else {
            entries.insert(name.to_string(), RedirectEntry::Absent);
        }
    }

    match action {
        JournalAction::Rename { staged, .. } => {
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::rename(staging_dir.join(staged), &dest)?;
        }
        JournalAction::Remove { .. } => {
            if !displaced {
                if let Err(err) = fs::remove_file(&dest) {
                    if err.kind() != io::ErrorKind::NotFound {
                        return Err(err);
                    }
                }
            }
            remove_empty_parents(root, &dest);
        }
    }
    Ok(())
}

/// Removes now-empty parent directories up to (but never including) `root`.
fn remove_empty_parents(root: &Path, dest: &Path) {
    let mut dir = dest.parent();
    while let Some(current) = dir {
        if current == root {
            break;
        }
        if fs::remove_dir(current).is_err() {
            break;
        }
        dir = current.parent();
    }
}

fn write_version(root: &Path, generation: Generation) -> io::Result<()> {
    let tmp = root.join(VERSION_TMP);
    {
        let mut file = File::create(&tmp)?;
        use std::io::Write;
        writeln!(file, "{}", generation.0)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, root.join(VERSION_FILE))
}

/// Startup recovery: replays leftover journals idempotently, deletes stale
/// transaction and redirection directories, and returns the lowest
/// generation `.version` must be advanced to.
fn recover(root: &Path) -> Result<Generation, ArchiveError> {
    let mut floor = Generation::ZERO;
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(floor),
        Err(err) => return Err(err.into()),
    };
    let mut leftovers: Vec<(u64, PathBuf)> = Vec::new();
    for entry in entries {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if let Some(suffix) = name.strip_prefix(TRANSACTION_PREFIX) {
            match suffix.parse::<u64>() {
                Ok(generation) => leftovers.push((generation, entry.path())),
                Err(_) => {
                    warn!(
                        dir = %entry.path().display(),
                        "discarding unrecognized transaction directory"
                    );
                    fs::remove_dir_all(entry.path())?;
                }
            }
        } else if name.starts_with(REDIRECTION_PREFIX) {
            // No reader can be pinned to a prior process's generations.
            fs::remove_dir_all(entry.path())?;
        } else if name == VERSION_TMP {
            fs::remove_file(entry.path())?;
        }
    }

    // Oldest journal first, so leftovers touching the same name settle in
    // commit order regardless of directory iteration order.
    leftovers.sort_unstable_by_key(|(generation, _)| *generation);
    for (_, dir) in leftovers {
        let journal_path = dir.join(JOURNAL_FILE);
        if journal_path.exists() {
            match journal::read_journal(&journal_path) {
                Ok(journal) => {
                    debug!(dir = %dir.display(), "replaying commit journal");
                    replay(root, &dir, &journal)?;
                    floor = floor.max(Generation(journal.generation).next());
                }
                Err(err)
                    if matches!(
                        err.kind(),
                        io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof
                    ) =>
                {
                    warn!(dir = %dir.display(), "discarding torn commit journal");
                }
                Err(err) => return Err(err.into()),
            }
        }
        fs::remove_dir_all(&dir)?;
    }
    Ok(floor)
}

/// Replays one journal. Idempotent: entries whose staged source is already
/// gone were applied before the crash and are skipped.
fn replay(root: &Path, staging_dir: &Path, journal: &Journal) -> io::Result<()> {
    for action in &journal.actions {
        match action {
            JournalAction::Rename { staged, dest } => {
                let source = staging_dir.join(staged);
                if !source.exists() {
                    continue;
                }
                let dest = root.join(dest);
                if let Some(parent) = dest.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::rename(&source, &dest)?;
            }
            JournalAction::Remove { dest } => {
                let dest = root.join(dest);
                if let Err(err) = fs::remove_file(&dest) {
                    if err.kind() != io::ErrorKind::NotFound {
                        return Err(err);
                    }
                }
                remove_empty_parents(root, &dest);
            }
        }
    }
    Ok(())
}

fn walk_files(
    dir: &Path,
    prefix: &str,
    modified_after: f64,
    out: &mut Vec<(String, f64)>,
) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let Some(name) = file_name.to_str() else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        let relative = if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{prefix}/{name}")
        };
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_files(&entry.path(), &relative, modified_after, out)?;
        } else if file_type.is_file() {
            let metadata = entry.metadata()?;
            let mtime = metadata
                .modified()?
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0);
            if mtime > modified_after {
                out.push((relative, mtime));
            }
        }
    }
    Ok(())
}
