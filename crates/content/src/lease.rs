//! Bounded pool of scratch-file leases.
//!
//! The [`FileLeaser`] hands out scratch files in two modes. A
//! [`ReadWriteLease`] is exclusively owned and mutable; it cannot be revoked
//! out from under its holder. A [`ReadLease`] is an immutable cache entry
//! that the leaser may revoke at any time to stay within its limits.
//!
//! Two limits apply: a maximum number of leases of either kind, and a
//! maximum byte total. Read/write leases always succeed their writes; growth
//! is absorbed by evicting the least recently used read leases, since those
//! hold immutable data that can be re-fetched, while read/write leases back
//! in-flight mutations that cannot.
//!
//! # Thread safety
//!
//! A single mutex guards the LRU order, the byte counters, and entry
//! membership. Scratch I/O happens outside that critical section; each read
//! lease carries an inner per-file mutex serializing positional access to
//! its backing file. Lock order is always outer (pool) before inner (file).

use std::collections::{HashMap, VecDeque};
use std::fs::File;
use std::io::SeekFrom;
use std::os::unix::fs::FileExt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::ContentError;
use crate::scratch::ScratchDir;

/// Identifier for a read lease in the pool's bookkeeping.
type LeaseId = u64;

// ============================================================================
// Pool state
// ============================================================================

/// Bookkeeping guarded by the pool mutex.
struct LeaserState {
    /// Read leases in recency order: front = least recently used.
    lru: VecDeque<LeaseId>,
    /// Live read leases by id.
    entries: HashMap<LeaseId, Arc<ReadLeaseShared>>,
    /// Sum of live read lease sizes.
    read_bytes: u64,
    /// Sum of tracked read/write lease sizes.
    rw_bytes: u64,
    /// Number of live read/write leases.
    rw_count: usize,
    /// Next read lease id. Id zero is reserved for born-revoked leases.
    next_id: LeaseId,
}

impl LeaserState {
    fn new() -> Self {
        Self {
            lru: VecDeque::new(),
            entries: HashMap::new(),
            read_bytes: 0,
            rw_bytes: 0,
            rw_count: 0,
            next_id: 1,
        }
    }

    fn allocate_id(&mut self) -> LeaseId {
        let id: LeaseId = self.next_id;
        self.next_id += 1;
        id
    }

    /// Remove a read lease from the books. Harmless if already gone.
    fn remove_entry(&mut self, id: LeaseId, size: u64) {
        if self.entries.remove(&id).is_some() {
            self.lru.retain(|&entry| entry != id);
            self.read_bytes -= size;
        }
    }

    /// Move a read lease to the most recently used position.
    fn touch(&mut self, id: LeaseId) {
        if self.entries.contains_key(&id) {
            self.lru.retain(|&entry| entry != id);
            self.lru.push_back(id);
        }
    }
}

struct LeaserInner {
    scratch: ScratchDir,
    max_files: usize,
    max_bytes: u64,
    state: Mutex<LeaserState>,
}

impl LeaserInner {
    /// Evict least recently used read leases until both limits hold.
    ///
    /// Read/write leases are never evicted, so once the LRU list is empty
    /// the totals are allowed to exceed the limits.
    fn evict_locked(&self, state: &mut LeaserState) {
        while state.entries.len() + state.rw_count > self.max_files
            || state.rw_bytes + state.read_bytes > self.max_bytes
        {
            let Some(id) = state.lru.pop_front() else {
                break;
            };
            if let Some(shared) = state.entries.remove(&id) {
                state.read_bytes -= shared.size;
                let file: Option<LeaseFile> = shared.slot.lock().take();
                drop(file);
                tracing::debug!(id, size = shared.size, "evicted least recently used read lease");
            }
        }
    }

    /// Revoke one read lease: drop it from the books and free its file.
    fn revoke_shared(&self, shared: &ReadLeaseShared) {
        let mut state = self.state.lock();
        state.remove_entry(shared.id, shared.size);
        let file: Option<LeaseFile> = shared.slot.lock().take();
        drop(state);
        drop(file);
    }
}

// ============================================================================
// File leaser
// ============================================================================

/// Counters describing the current pool state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaserStats {
    /// Number of live read leases.
    pub read_lease_count: usize,
    /// Sum of live read lease sizes in bytes.
    pub read_lease_bytes: u64,
    /// Number of live read/write leases.
    pub rw_lease_count: usize,
}

/// Bounded allocator for scratch-file leases. Cheap to clone; clones share
/// one pool.
#[derive(Clone)]
pub struct FileLeaser {
    inner: Arc<LeaserInner>,
}

impl FileLeaser {
    /// Create a pool over the given scratch directory.
    ///
    /// `max_files` bounds the number of leases of either kind; `max_bytes`
    /// bounds the byte total across tracked leases.
    pub fn new(scratch: ScratchDir, max_files: usize, max_bytes: u64) -> Self {
        Self {
            inner: Arc::new(LeaserInner {
                scratch,
                max_files,
                max_bytes,
                state: Mutex::new(LeaserState::new()),
            }),
        }
    }

    /// The pool's byte limit.
    pub fn max_bytes(&self) -> u64 {
        self.inner.max_bytes
    }

    /// Create an empty read/write lease, evicting read leases as needed to
    /// stay within the file-count limit.
    pub fn new_file(&self) -> Result<ReadWriteLease, ContentError> {
        let file: File = self.inner.scratch.create().map_err(ContentError::ScratchIo)?;

        let mut state = self.inner.state.lock();
        state.rw_count += 1;
        self.inner.evict_locked(&mut state);
        drop(state);

        Ok(ReadWriteLease {
            leaser: Arc::clone(&self.inner),
            file: Some(file),
            pos: 0,
            size: 0,
        })
    }

    /// Revoke every outstanding read lease.
    pub fn revoke_read_leases(&self) {
        let mut state = self.inner.state.lock();
        state.lru.clear();
        state.read_bytes = 0;
        let entries: Vec<Arc<ReadLeaseShared>> = state.entries.drain().map(|(_, v)| v).collect();
        for shared in &entries {
            let file: Option<LeaseFile> = shared.slot.lock().take();
            drop(file);
        }
    }

    /// Snapshot the pool counters.
    pub fn stats(&self) -> LeaserStats {
        let state = self.inner.state.lock();
        LeaserStats {
            read_lease_count: state.entries.len(),
            read_lease_bytes: state.read_bytes,
            rw_lease_count: state.rw_count,
        }
    }
}

// ============================================================================
// Read/write lease
// ============================================================================

/// Exclusively owned, mutable scratch file.
///
/// Writes never fail for pool-limit reasons; growth instead evicts read
/// leases in anticipation of a future [`downgrade`](Self::downgrade).
/// Dropping the lease releases its backing file.
pub struct ReadWriteLease {
    leaser: Arc<LeaserInner>,
    /// Taken exactly once, by `downgrade` or `Drop`.
    file: Option<File>,
    pos: u64,
    size: u64,
}

impl ReadWriteLease {
    fn file(&self) -> &File {
        self.file.as_ref().expect("read/write lease already consumed")
    }

    /// Current size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read from the current position, advancing it. A short (possibly
    /// zero-length) read signals end of file.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, ContentError> {
        let n: usize = read_full_at(self.file(), buf, self.pos)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Read at an absolute offset without moving the position.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, ContentError> {
        Ok(read_full_at(self.file(), buf, offset)?)
    }

    /// Write at the current position, advancing it.
    pub fn write(&mut self, buf: &[u8]) -> Result<usize, ContentError> {
        let offset: u64 = self.pos;
        let n: usize = self.write_at(buf, offset)?;
        self.pos += n as u64;
        Ok(n)
    }

    /// Write at an absolute offset without moving the position. Writing past
    /// the current end extends the file, filling any gap with NULs.
    pub fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize, ContentError> {
        if buf.is_empty() {
            return Ok(0);
        }
        self.file().write_all_at(buf, offset)?;
        let end: u64 = offset + buf.len() as u64;
        if end > self.size {
            self.record_resize(end);
        }
        Ok(buf.len())
    }

    /// Reposition the cursor used by `read` and `write`.
    pub fn seek(&mut self, from: SeekFrom) -> Result<u64, ContentError> {
        self.pos = resolve_seek(from, self.pos, self.size)?;
        Ok(self.pos)
    }

    /// Set the file size, extending with NULs or discarding the tail.
    pub fn truncate(&mut self, new_size: u64) -> Result<(), ContentError> {
        self.file().set_len(new_size)?;
        self.record_resize(new_size);
        Ok(())
    }

    /// Convert into a read lease over the same contents.
    ///
    /// Atomic with respect to the pool: the bytes move from the read/write
    /// side of the accounting to the read side, and eviction runs to make
    /// room for the new entrant. A lease larger than the pool's byte limit
    /// is born revoked.
    pub fn downgrade(mut self) -> ReadLease {
        let file: File = self.file.take().expect("read/write lease already consumed");
        let size: u64 = self.size;
        let pos: u64 = self.pos;
        let leaser: Arc<LeaserInner> = Arc::clone(&self.leaser);

        let mut state = leaser.state.lock();
        state.rw_count -= 1;
        state.rw_bytes -= size;

        if size > leaser.max_bytes {
            drop(state);
            drop(file);
            tracing::debug!(size, limit = leaser.max_bytes, "downgraded lease born revoked");
            return ReadLease {
                leaser,
                shared: Arc::new(ReadLeaseShared {
                    id: 0,
                    size,
                    slot: Mutex::new(None),
                }),
            };
        }

        let id: LeaseId = state.allocate_id();
        let shared = Arc::new(ReadLeaseShared {
            id,
            size,
            slot: Mutex::new(Some(LeaseFile { file, pos })),
        });
        state.entries.insert(id, Arc::clone(&shared));
        state.lru.push_back(id);
        state.read_bytes += size;
        leaser.evict_locked(&mut state);
        drop(state);

        ReadLease { leaser, shared }
    }

    /// Update the tracked size and apply byte pressure to the read pool.
    fn record_resize(&mut self, new_size: u64) {
        if new_size == self.size {
            return;
        }
        let grew: bool = new_size > self.size;

        let mut state = self.leaser.state.lock();
        if grew {
            state.rw_bytes += new_size - self.size;
        } else {
            state.rw_bytes -= self.size - new_size;
        }
        self.size = new_size;
        if grew {
            self.leaser.evict_locked(&mut state);
        }
    }
}

impl Drop for ReadWriteLease {
    fn drop(&mut self) {
        if let Some(file) = self.file.take() {
            let mut state = self.leaser.state.lock();
            state.rw_count -= 1;
            state.rw_bytes -= self.size;
            drop(state);
            drop(file);
        }
    }
}

impl std::fmt::Debug for ReadWriteLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadWriteLease")
            .field("size", &self.size)
            .field("pos", &self.pos)
            .finish()
    }
}

// ============================================================================
// Read lease
// ============================================================================

/// Per-lease state shared between the handle and the pool.
struct ReadLeaseShared {
    id: LeaseId,
    size: u64,
    /// `None` once revoked. The inner mutex serializes file access.
    slot: Mutex<Option<LeaseFile>>,
}

struct LeaseFile {
    file: File,
    pos: u64,
}

/// Immutable scratch file, revocable by the pool at any time.
///
/// Every successful observation promotes the lease to most recently used.
/// Once revoked (by eviction, [`revoke`](Self::revoke), or a failed fit at
/// downgrade time) all operations fail with [`ContentError::Revoked`].
/// Dropping the lease revokes it.
pub struct ReadLease {
    leaser: Arc<LeaserInner>,
    shared: Arc<ReadLeaseShared>,
}

impl ReadLease {
    /// Size in bytes of the leased contents.
    pub fn size(&self) -> u64 {
        self.shared.size
    }

    /// True once the lease has been revoked.
    pub fn revoked(&self) -> bool {
        self.shared.slot.lock().is_none()
    }

    /// Read from the current position, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, ContentError> {
        self.touch();
        let mut slot = self.shared.slot.lock();
        let lease_file: &mut LeaseFile = slot.as_mut().ok_or(ContentError::Revoked)?;
        let n: usize = read_full_at(&lease_file.file, buf, lease_file.pos)?;
        lease_file.pos += n as u64;
        Ok(n)
    }

    /// Read at an absolute offset without moving the position.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> Result<usize, ContentError> {
        self.touch();
        let slot = self.shared.slot.lock();
        let lease_file: &LeaseFile = slot.as_ref().ok_or(ContentError::Revoked)?;
        Ok(read_full_at(&lease_file.file, buf, offset)?)
    }

    /// Reposition the cursor used by `read`.
    pub fn seek(&self, from: SeekFrom) -> Result<u64, ContentError> {
        self.touch();
        let mut slot = self.shared.slot.lock();
        let lease_file: &mut LeaseFile = slot.as_mut().ok_or(ContentError::Revoked)?;
        lease_file.pos = resolve_seek(from, lease_file.pos, self.shared.size)?;
        Ok(lease_file.pos)
    }

    /// Convert back into a read/write lease over the same contents,
    /// removing this entry from the read pool.
    pub fn upgrade(self) -> Result<ReadWriteLease, ContentError> {
        let mut state = self.leaser.state.lock();
        let mut slot = self.shared.slot.lock();
        let Some(lease_file) = slot.take() else {
            return Err(ContentError::Revoked);
        };
        state.remove_entry(self.shared.id, self.shared.size);
        state.rw_count += 1;
        state.rw_bytes += self.shared.size;
        drop(slot);
        drop(state);

        Ok(ReadWriteLease {
            leaser: Arc::clone(&self.leaser),
            file: Some(lease_file.file),
            pos: lease_file.pos,
            size: self.shared.size,
        })
    }

    /// Revoke the lease, releasing its backing file. Idempotent.
    pub fn revoke(&self) {
        self.leaser.revoke_shared(&self.shared);
    }

    fn touch(&self) {
        let mut state = self.leaser.state.lock();
        state.touch(self.shared.id);
    }
}

impl Drop for ReadLease {
    fn drop(&mut self) {
        self.leaser.revoke_shared(&self.shared);
    }
}

impl std::fmt::Debug for ReadLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadLease")
            .field("size", &self.shared.size)
            .field("revoked", &self.revoked())
            .finish()
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Read until the buffer is full or end of file. Short only at EOF.
fn read_full_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    let mut total: usize = 0;
    let mut pos: u64 = offset;
    while total < buf.len() {
        match file.read_at(&mut buf[total..], pos) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                pos += n as u64;
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(total)
}

/// Resolve a seek target against the current position and size.
fn resolve_seek(from: SeekFrom, pos: u64, size: u64) -> Result<u64, ContentError> {
    let target: i128 = match from {
        SeekFrom::Start(n) => n as i128,
        SeekFrom::End(delta) => size as i128 + delta as i128,
        SeekFrom::Current(delta) => pos as i128 + delta as i128,
    };
    if target < 0 || target > u64::MAX as i128 {
        return Err(ContentError::InvalidOffset(target as i64));
    }
    Ok(target as u64)
}

// ============================================================================
// Tests
// ============================================================================
