//! Open-handle table for a mounted volume.
//!
//! Every successful `ZwCreateFile` produces one [`OpenFile`] entry keyed by an
//! opaque [`HandleId`]. The driver stores the id in `DOKAN_FILE_INFO.Context`
//! and hands it back with every subsequent callback on that open.
//!
//! # Handle Lifecycle
//!
//! 1. **Reserve**: share access is checked and an id is allocated. The entry is
//!    invisible to lookups until committed.
//! 2. **Commit**: the filesystem accepted the open; the entry becomes `Open`
//!    holding one reference for the native open.
//! 3. **Lookup**: in-flight requests take a counted [`HandleGuard`].
//! 4. **Cleanup**: the last user handle is gone; share access is released.
//! 5. **Close**: the native reference is dropped. The entry is evicted, and the
//!    finaliser runs, only once every guard has been dropped too.
//!
//! Ids are allocated from a monotonically increasing counter that skips 0 and
//! any id still present, so an id is never reused while referenced.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use crate::error::{DokanError, DokanResult};
use crate::flags::{AccessMask, CreateOptions, ShareAccess};
use crate::path::{DokanPath, PathKey};
use crate::request::CreateRequest;

/// Opaque identifier of an open file or directory.
///
/// 0 is reserved for "no handle".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    /// The null handle.
    pub const NONE: HandleId = HandleId(0);

    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h-{}", self.0)
    }
}

/// Lifecycle state of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    /// Reserved; the filesystem has not accepted the open yet.
    Pending,
    Open,
    /// `Cleanup` ran; only paging I/O and close may follow.
    CleanedUp,
    /// `CloseFile` ran or the volume is being torn down.
    Closing,
}

#[derive(Debug)]
struct Lifecycle {
    state: HandleState,
    refs: usize,
    share_held: bool,
}

/// State of one open file or directory.
pub struct OpenFile {
    id: HandleId,
    path: RwLock<DokanPath>,
    key: Mutex<PathKey>,
    access: AccessMask,
    share: ShareAccess,
    options: CreateOptions,
    is_directory: AtomicBool,
    delete_on_close: AtomicBool,
    user_context: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
    op_lock: RwLock<()>,
}

impl OpenFile {
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Current path; follows renames.
    pub fn path(&self) -> DokanPath {
        self.path.read().clone()
    }

    pub fn access(&self) -> AccessMask {
        self.access
    }

    pub fn share(&self) -> ShareAccess {
        self.share
    }

    pub fn options(&self) -> CreateOptions {
        self.options
    }

    pub fn is_directory(&self) -> bool {
        self.is_directory.load(Ordering::Acquire)
    }

    pub fn delete_on_close(&self) -> bool {
        self.delete_on_close.load(Ordering::Acquire)
    }

    pub fn set_delete_on_close(&self, value: bool) {
        self.delete_on_close.store(value, Ordering::Release);
    }

    /// Per-open word owned by the filesystem implementation.
    pub fn user_context(&self) -> &AtomicU64 {
        &self.user_context
    }

    pub fn state(&self) -> HandleState {
        self.lifecycle.lock().state
    }

    /// Outstanding references: the native open plus in-flight requests.
    pub fn refs(&self) -> usize {
        self.lifecycle.lock().refs
    }

    /// Per-handle operation lock.
    ///
    /// Shared operations hold it for reading, serialized ones for writing.
    pub fn op_lock(&self) -> &RwLock<()> {
        &self.op_lock
    }
}

impl fmt::Debug for OpenFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OpenFile")
            .field("id", &self.id)
            .field("path", &*self.path.read())
            .field("access", &self.access)
            .field("share", &self.share)
            .field("is_directory", &self.is_directory())
            .field("delete_on_close", &self.delete_on_close())
            .finish_non_exhaustive()
    }
}

/// NT share-access bookkeeping for one file.
#[derive(Debug, Default, Clone, Copy)]
struct ShareCounts {
    opens: u32,
    readers: u32,
    writers: u32,
    deleters: u32,
    shared_read: u32,
    shared_write: u32,
    shared_delete: u32,
}

impl ShareCounts {
    fn conflicts(&self, access: AccessMask, share: ShareAccess) -> bool {
        (access.can_read() && self.shared_read < self.opens)
            || (access.can_write() && self.shared_write < self.opens)
            || (access.can_delete() && self.shared_delete < self.opens)
            || (self.readers > 0 && !share.contains(ShareAccess::READ))
            || (self.writers > 0 && !share.contains(ShareAccess::WRITE))
            || (self.deleters > 0 && !share.contains(ShareAccess::DELETE))
    }

    fn apply(&mut self, access: AccessMask, share: ShareAccess, add: bool) {
        let bump = |counter: &mut u32, on: bool| {
            if on {
                *counter = if add {
                    counter.saturating_add(1)
                } else {
                    counter.saturating_sub(1)
                };
            }
        };
        bump(&mut self.opens, true);
        bump(&mut self.readers, access.can_read());
        bump(&mut self.writers, access.can_write());
        bump(&mut self.deleters, access.can_delete());
        bump(&mut self.shared_read, share.contains(ShareAccess::READ));
        bump(&mut self.shared_write, share.contains(ShareAccess::WRITE));
        bump(&mut self.shared_delete, share.contains(ShareAccess::DELETE));
    }

    fn is_empty(&self) -> bool {
        self.opens == 0
    }
}

type Finalizer = Box<dyn Fn(&OpenFile) + Send + Sync>;

/// Thread-safe table of open handles for one mount.
pub struct HandleTable {
    handles: DashMap<u64, Arc<OpenFile>>,
    next_id: AtomicU64,
    shares: Mutex<HashMap<PathKey, ShareCounts>>,
    case_sensitive: bool,
    live: Mutex<usize>,
    drained: Condvar,
    finalizer: Finalizer,
}

impl HandleTable {
    /// Create a table whose evictions need no callback.
    pub fn new(case_sensitive: bool) -> Self {
        Self::with_finalizer(case_sensitive, |_| {})
    }

    /// Create a table that runs `finalizer` once per evicted entry.
    ///
    /// The finaliser runs on whichever thread drops the last reference and
    /// must not call back into the table.
    pub fn with_finalizer<F>(case_sensitive: bool, finalizer: F) -> Self
    where
        F: Fn(&OpenFile) + Send + Sync + 'static,
    {
        Self {
            handles: DashMap::new(),
            next_id: AtomicU64::new(1),
            shares: Mutex::new(HashMap::new()),
            case_sensitive,
            live: Mutex::new(0),
            drained: Condvar::new(),
            finalizer: Box::new(finalizer),
        }
    }

    pub fn case_sensitive(&self) -> bool {
        self.case_sensitive
    }

    /// Check share access and allocate an id for a new open.
    pub fn reserve(&self, path: &DokanPath, request: &CreateRequest) -> DokanResult<Reservation<'_>> {
        let key = path.key(self.case_sensitive);
        let access = request.access.mapped();
        let share_held = access.has_data_access();

        if share_held {
            let mut shares = self.shares.lock();
            let counts = shares.entry(key.clone()).or_default();
            if counts.conflicts(access, request.share) {
                if counts.is_empty() {
                    shares.remove(&key);
                }
                debug!(path = %path, ?access, share = ?request.share, "Sharing violation");
                return Err(DokanError::SharingViolation(path.to_string()));
            }
            counts.apply(access, request.share, true);
        }

        let is_directory = request.options.contains(CreateOptions::DIRECTORY_FILE);
        let delete_on_close = request.options.contains(CreateOptions::DELETE_ON_CLOSE);

        loop {
            let id = self
                .next_id
                .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                    Some(current.checked_add(1).unwrap_or(1))
                })
                .unwrap_or_else(|current| current);
            if id == 0 {
                continue;
            }
            if let Entry::Vacant(entry) = self.handles.entry(id) {
                let file = Arc::new(OpenFile {
                    id: HandleId(id),
                    path: RwLock::new(path.clone()),
                    key: Mutex::new(key),
                    access,
                    share: request.share,
                    options: request.options,
                    is_directory: AtomicBool::new(is_directory),
                    delete_on_close: AtomicBool::new(delete_on_close),
                    user_context: AtomicU64::new(0),
                    lifecycle: Mutex::new(Lifecycle {
                        state: HandleState::Pending,
                        refs: 1,
                        share_held,
                    }),
                    op_lock: RwLock::new(()),
                });
                entry.insert(Arc::clone(&file));
                *self.live.lock() += 1;
                return Ok(Reservation {
                    table: self,
                    file,
                    committed: false,
                });
            }
        }
    }

    /// Take a counted reference to an open handle.
    pub fn lookup(&self, id: HandleId) -> DokanResult<HandleGuard<'_>> {
        let file = self
            .handles
            .get(&id.0)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or(DokanError::InvalidHandle(id))?;
        {
            let mut lifecycle = file.lifecycle.lock();
            match lifecycle.state {
                HandleState::Pending | HandleState::Closing => {
                    return Err(DokanError::InvalidHandle(id));
                }
                HandleState::Open | HandleState::CleanedUp => lifecycle.refs += 1,
            }
        }
        Ok(HandleGuard { table: self, file })
    }

    /// Transition `Open -> CleanedUp`, releasing share access.
    pub fn mark_cleaned_up(&self, file: &OpenFile) -> DokanResult<()> {
        {
            let mut lifecycle = file.lifecycle.lock();
            if lifecycle.state != HandleState::Open {
                return Err(DokanError::invalid_state(format!(
                    "cleanup on {} in state {:?}",
                    file.id, lifecycle.state
                )));
            }
            lifecycle.state = HandleState::CleanedUp;
        }
        self.release_share(file);
        Ok(())
    }

    /// Drop the native reference to a handle.
    ///
    /// Closing an id that is already closing or gone succeeds. The entry is
    /// evicted once the last in-flight guard is dropped.
    pub fn close(&self, id: HandleId) -> DokanResult<CloseOutcome> {
        let Some(file) = self.handles.get(&id.0).map(|entry| Arc::clone(entry.value())) else {
            return Ok(CloseOutcome::AlreadyReleased);
        };

        let finalize = {
            let mut lifecycle = file.lifecycle.lock();
            match lifecycle.state {
                HandleState::Pending => return Err(DokanError::InvalidHandle(id)),
                HandleState::Closing => return Ok(CloseOutcome::AlreadyReleased),
                HandleState::Open | HandleState::CleanedUp => {}
            }
            lifecycle.state = HandleState::Closing;
            lifecycle.refs = lifecycle.refs.saturating_sub(1);
            lifecycle.refs == 0
        };

        self.release_share(&file);
        if finalize {
            self.finalize(&file);
            Ok(CloseOutcome::Released)
        } else {
            debug!(handle = %id, refs = file.refs(), "Close deferred until in-flight requests finish");
            Ok(CloseOutcome::Deferred)
        }
    }

    /// Point every open under `from` at its new location after a rename.
    pub fn rename(&self, from: &DokanPath, to: &DokanPath) {
        let files: Vec<Arc<OpenFile>> = self.handles.iter().map(|e| Arc::clone(e.value())).collect();
        let mut shares = self.shares.lock();
        for file in files {
            let mut path = file.path.write();
            let Some(rebased) = path.rebase(from, to, self.case_sensitive) else {
                continue;
            };
            let new_key = rebased.key(self.case_sensitive);
            let mut key = file.key.lock();
            if file.lifecycle.lock().share_held {
                if let Some(counts) = shares.get_mut(&*key) {
                    counts.apply(file.access, file.share, false);
                    if counts.is_empty() {
                        shares.remove(&*key);
                    }
                }
                shares
                    .entry(new_key.clone())
                    .or_default()
                    .apply(file.access, file.share, true);
            }
            *key = new_key;
            *path = rebased;
        }
    }

    /// Number of entries, including pending reservations.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Ids of committed handles that have not been closed.
    pub fn open_handles(&self) -> Vec<HandleId> {
        let mut ids: Vec<HandleId> = self
            .handles
            .iter()
            .filter(|entry| {
                matches!(
                    entry.value().state(),
                    HandleState::Open | HandleState::CleanedUp
                )
            })
            .map(|entry| HandleId(*entry.key()))
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Sum of reference counts across all entries.
    pub fn outstanding_refs(&self) -> usize {
        self.handles.iter().map(|entry| entry.value().refs()).sum()
    }

    /// Block until every entry has been evicted or `timeout` elapses.
    ///
    /// Returns `true` if the table drained.
    pub fn wait_until_empty(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut live = self.live.lock();
        while *live > 0 {
            if self.drained.wait_until(&mut live, deadline).timed_out() {
                return *live == 0;
            }
        }
        true
    }

    /// Tear down every committed entry.
    ///
    /// Each entry is marked closing, then the per-handle lock is taken (bounded
    /// by `lock_timeout`) so no operation body is mid-flight, then the native
    /// reference is dropped. Returns the number of entries still referenced
    /// by in-flight requests.
    pub fn force_close_all(&self, lock_timeout: Duration) -> usize {
        let files: Vec<Arc<OpenFile>> = self.handles.iter().map(|e| Arc::clone(e.value())).collect();
        for file in &files {
            {
                let mut lifecycle = file.lifecycle.lock();
                if matches!(lifecycle.state, HandleState::Pending | HandleState::Closing) {
                    continue;
                }
                lifecycle.state = HandleState::Closing;
            }
            self.release_share(file);

            match file.op_lock.try_write_for(lock_timeout) {
                Some(guard) => drop(guard),
                None => warn!(handle = %file.id, "Forced close could not synchronise with handle lock"),
            }

            let finalize = {
                let mut lifecycle = file.lifecycle.lock();
                lifecycle.refs = lifecycle.refs.saturating_sub(1);
                lifecycle.refs == 0
            };
            if finalize {
                self.finalize(file);
            }
        }

        self.handles
            .iter()
            .filter(|entry| entry.value().refs() > 0)
            .count()
    }

    // Lock order: shares, then path, key, lifecycle.
    fn release_share(&self, file: &OpenFile) {
        let mut shares = self.shares.lock();
        let key = file.key.lock();
        if !std::mem::replace(&mut file.lifecycle.lock().share_held, false) {
            return;
        }
        if let Some(counts) = shares.get_mut(&*key) {
            counts.apply(file.access, file.share, false);
            if counts.is_empty() {
                shares.remove(&*key);
            }
        }
    }

    fn finalize(&self, file: &OpenFile) {
        self.handles.remove(&file.id.0);
        (self.finalizer)(file);
        self.evicted();
    }

    fn evicted(&self) {
        let mut live = self.live.lock();
        *live = live.saturating_sub(1);
        if *live == 0 {
            self.drained.notify_all();
        }
    }
}

impl fmt::Debug for HandleTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleTable")
            .field("handles", &self.handles.len())
            .field("case_sensitive", &self.case_sensitive)
            .finish_non_exhaustive()
    }
}

/// Result of [`HandleTable::close`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOutcome {
    /// Evicted immediately.
    Released,
    /// Evicted when the last in-flight request finishes.
    Deferred,
    /// Nothing to do; the handle was already closed.
    AlreadyReleased,
}

/// A reserved, not yet committed, open.
///
/// Dropping it without [`commit`](Reservation::commit) rolls the reservation
/// back.
pub struct Reservation<'a> {
    table: &'a HandleTable,
    file: Arc<OpenFile>,
    committed: bool,
}

impl Reservation<'_> {
    pub fn file(&self) -> &OpenFile {
        &self.file
    }

    pub fn id(&self) -> HandleId {
        self.file.id
    }

    /// Make the entry visible to lookups.
    pub fn commit(mut self, is_directory: bool) -> HandleId {
        self.file.is_directory.store(is_directory, Ordering::Release);
        self.file.lifecycle.lock().state = HandleState::Open;
        self.committed = true;
        self.file.id
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.committed {
            self.table.release_share(&self.file);
            self.table.handles.remove(&self.file.id.0);
            self.table.evicted();
        }
    }
}

/// Counted reference held by an in-flight request.
pub struct HandleGuard<'a> {
    table: &'a HandleTable,
    file: Arc<OpenFile>,
}

impl fmt::Debug for HandleGuard<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("HandleGuard").field(&self.file).finish()
    }
}

impl std::ops::Deref for HandleGuard<'_> {
    type Target = OpenFile;

    fn deref(&self) -> &OpenFile {
        &self.file
    }
}

impl Drop for HandleGuard<'_> {
    fn drop(&mut self) {
        let finalize = {
            let mut lifecycle = self.file.lifecycle.lock();
            lifecycle.refs = lifecycle.refs.saturating_sub(1);
            lifecycle.refs == 0 && lifecycle.state == HandleState::Closing
        };
        if finalize {
            self.table.finalize(&self.file);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flags::CreateDisposition;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    fn path(raw: &str) -> DokanPath {
        DokanPath::parse(raw).unwrap()
    }

    fn open(table: &HandleTable, raw: &str, access: AccessMask, share: ShareAccess) -> DokanResult<HandleId> {
        let request = CreateRequest::open(access).share(share);
        Ok(table.reserve(&path(raw), &request)?.commit(false))
    }

    #[test]
    fn test_ids_start_at_one_and_are_unique() {
        let table = HandleTable::new(false);
        let a = open(&table, "\\a", AccessMask::GENERIC_READ, ShareAccess::all()).unwrap();
        let b = open(&table, "\\b", AccessMask::GENERIC_READ, ShareAccess::all()).unwrap();
        assert_eq!(a.raw(), 1);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_id_allocation_skips_zero_and_live_ids() {
        let table = HandleTable::new(false);
        let first = open(&table, "\\a", AccessMask::GENERIC_READ, ShareAccess::all()).unwrap();
        table.next_id.store(u64::MAX, Ordering::Relaxed);
        let max = open(&table, "\\b", AccessMask::GENERIC_READ, ShareAccess::all()).unwrap();
        assert_eq!(max.raw(), u64::MAX);
        // Counter wraps to 1, which is still live, so 2 is chosen.
        let wrapped = open(&table, "\\c", AccessMask::GENERIC_READ, ShareAccess::all()).unwrap();
        assert_eq!(first.raw(), 1);
        assert_eq!(wrapped.raw(), 2);
    }

    #[test]
    fn test_lookup_unknown_handle() {
        let table = HandleTable::new(false);
        let err = table.lookup(HandleId::from_raw(42)).unwrap_err();
        assert!(matches!(err, DokanError::InvalidHandle(id) if id.raw() == 42));
    }

    #[test]
    fn test_pending_reservation_is_invisible_and_rolls_back() {
        let table = HandleTable::new(false);
        let request = CreateRequest::open(AccessMask::GENERIC_WRITE).share(ShareAccess::empty());
        let reservation = table.reserve(&path("\\a"), &request).unwrap();
        let id = reservation.id();
        assert!(table.lookup(id).is_err());
        drop(reservation);
        assert!(table.is_empty());
        // Share access was rolled back too.
        assert!(open(&table, "\\a", AccessMask::GENERIC_WRITE, ShareAccess::empty()).is_ok());
    }

    #[test]
    fn test_exclusive_open_admits_one_data_opener() {
        let table = HandleTable::new(false);
        open(&table, "\\a.txt", AccessMask::GENERIC_WRITE, ShareAccess::empty()).unwrap();
        let err = open(&table, "\\A.TXT", AccessMask::GENERIC_READ, ShareAccess::all()).unwrap_err();
        assert!(matches!(err, DokanError::SharingViolation(_)));
        // Attribute-only opens never conflict.
        assert!(open(&table, "\\a.txt", AccessMask::FILE_READ_ATTRIBUTES, ShareAccess::empty()).is_ok());
    }

    #[test]
    fn test_case_sensitive_identity() {
        let table = HandleTable::new(true);
        open(&table, "\\a.txt", AccessMask::GENERIC_WRITE, ShareAccess::empty()).unwrap();
        assert!(open(&table, "\\A.TXT", AccessMask::GENERIC_WRITE, ShareAccess::empty()).is_ok());
    }

    #[test]
    fn test_share_modes() {
        let table = HandleTable::new(false);
        open(&table, "\\f", AccessMask::GENERIC_READ, ShareAccess::READ).unwrap();
        // Another reader that shares read is fine.
        open(&table, "\\f", AccessMask::GENERIC_READ, ShareAccess::READ).unwrap();
        // A writer is refused: existing opens do not share write.
        assert!(open(&table, "\\f", AccessMask::GENERIC_WRITE, ShareAccess::all()).is_err());
        // A reader that refuses to share read conflicts with existing readers.
        assert!(open(&table, "\\f", AccessMask::GENERIC_READ, ShareAccess::WRITE).is_err());
    }

    #[test]
    fn test_cleanup_releases_share_access() {
        let table = HandleTable::new(false);
        let id = open(&table, "\\f", AccessMask::GENERIC_WRITE, ShareAccess::empty()).unwrap();
        {
            let guard = table.lookup(id).unwrap();
            table.mark_cleaned_up(&guard).unwrap();
            assert!(table.mark_cleaned_up(&guard).is_err());
        }
        assert!(open(&table, "\\f", AccessMask::GENERIC_WRITE, ShareAccess::empty()).is_ok());
        assert_eq!(table.lookup(id).unwrap().state(), HandleState::CleanedUp);
    }

    #[test]
    fn test_close_is_idempotent() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let table = HandleTable::with_finalizer(false, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let id = open(&table, "\\f", AccessMask::GENERIC_READ, ShareAccess::all()).unwrap();
        assert_eq!(table.close(id).unwrap(), CloseOutcome::Released);
        assert_eq!(table.close(id).unwrap(), CloseOutcome::AlreadyReleased);
        assert_eq!(table.close(id).unwrap(), CloseOutcome::AlreadyReleased);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_close_deferred_while_referenced() {
        let closed = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&closed);
        let table = HandleTable::with_finalizer(false, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let id = open(&table, "\\f", AccessMask::GENERIC_READ, ShareAccess::all()).unwrap();
        let guard = table.lookup(id).unwrap();
        assert_eq!(guard.refs(), 2);

        assert_eq!(table.close(id).unwrap(), CloseOutcome::Deferred);
        assert_eq!(closed.load(Ordering::SeqCst), 0);
        // Closing entries accept no new requests.
        assert!(table.lookup(id).is_err());
        assert_eq!(table.close(id).unwrap(), CloseOutcome::AlreadyReleased);

        drop(guard);
        assert_eq!(closed.load(Ordering::SeqCst), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn test_id_not_reused_while_referenced() {
        let table = HandleTable::new(false);
        let id = open(&table, "\\f", AccessMask::GENERIC_READ, ShareAccess::all()).unwrap();
        let guard = table.lookup(id).unwrap();
        table.close(id).unwrap();
        table.next_id.store(id.raw(), Ordering::Relaxed);
        let next = open(&table, "\\g", AccessMask::GENERIC_READ, ShareAccess::all()).unwrap();
        assert_ne!(next, id);
        drop(guard);
    }

    #[test]
    fn test_rename_moves_open_paths() {
        let table = HandleTable::new(false);
        let dir = open(&table, "\\docs", AccessMask::FILE_READ_ATTRIBUTES, ShareAccess::all()).unwrap();
        let file = open(&table, "\\docs\\a.txt", AccessMask::GENERIC_WRITE, ShareAccess::empty()).unwrap();
        table.rename(&path("\\docs"), &path("\\archive"));
        assert_eq!(table.lookup(dir).unwrap().path(), path("\\archive"));
        assert_eq!(table.lookup(file).unwrap().path(), path("\\archive\\a.txt"));
        // Share accounting followed the rename.
        assert!(open(&table, "\\docs\\a.txt", AccessMask::GENERIC_WRITE, ShareAccess::empty()).is_ok());
        assert!(open(&table, "\\archive\\a.txt", AccessMask::GENERIC_WRITE, ShareAccess::all()).is_err());
    }

    #[test]
    fn test_wait_until_empty() {
        let table = Arc::new(HandleTable::new(false));
        let id = open(&table, "\\f", AccessMask::GENERIC_READ, ShareAccess::all()).unwrap();
        assert!(!table.wait_until_empty(Duration::from_millis(20)));

        let closer = {
            let table = Arc::clone(&table);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                table.close(id).unwrap();
            })
        };
        assert!(table.wait_until_empty(Duration::from_secs(5)));
        closer.join().unwrap();
    }

    #[test]
    fn test_force_close_all_reports_referenced() {
        let table = HandleTable::new(false);
        let a = open(&table, "\\a", AccessMask::GENERIC_READ, ShareAccess::all()).unwrap();
        let _b = open(&table, "\\b", AccessMask::GENERIC_READ, ShareAccess::all()).unwrap();
        let guard = table.lookup(a).unwrap();

        let remaining = table.force_close_all(Duration::from_millis(10));
        assert_eq!(remaining, 1);
        assert_eq!(table.len(), 1);
        drop(guard);
        assert!(table.is_empty());
        assert!(table.wait_until_empty(Duration::ZERO));
    }

    #[test]
    fn test_reserve_marks_directory_and_delete_on_close() {
        let table = HandleTable::new(false);
        let request = CreateRequest::open(AccessMask::GENERIC_READ)
            .disposition(CreateDisposition::OpenIf)
            .options(CreateOptions::DIRECTORY_FILE | CreateOptions::DELETE_ON_CLOSE);
        let reservation = table.reserve(&path("\\d"), &request).unwrap();
        assert!(reservation.file().is_directory());
        assert!(reservation.file().delete_on_close());
        let id = reservation.commit(true);
        assert_eq!(table.open_handles(), vec![id]);
    }
}
