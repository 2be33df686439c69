//! Mutable view over immutable remote contents.

use std::sync::Arc;
use std::time::SystemTime;

use crate::clock::Clock;
use crate::error::ContentError;
use crate::lease::ReadWriteLease;
use crate::proxy::ReadProxy;

/// A point-in-time description of a mutable content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatResult {
    /// Current size in bytes.
    pub size: u64,

    /// All bytes in `[0, dirty_threshold)` are unmodified from the initial
    /// contents.
    pub dirty_threshold: u64,

    /// When the contents were last modified, or `None` if never.
    pub mtime: Option<SystemTime>,
}

/// The dirty half of a released [`MutableContent`].
#[derive(Debug)]
pub struct DirtyContent {
    /// Exclusive lease over the current contents.
    pub rw: ReadWriteLease,

    /// Lowest offset ever written or truncated to.
    pub dirty_threshold: u64,

    /// Time of the last modification.
    pub mtime: SystemTime,
}

/// Outcome of [`MutableContent::release`].
pub enum Release {
    /// Never modified; the content is handed back, still usable.
    Clean(MutableContent),

    /// Modified; the caller now owns the backing lease and the content is
    /// gone.
    Dirty(DirtyContent),
}

/// A mutable view on some content, created from an initial read-only proxy.
///
/// The view starts clean, serving reads straight from the proxy. The first
/// write or truncate upgrades the proxy into an exclusively owned
/// read/write lease; from then on the view is dirty and tracks the lowest
/// modified offset plus a modification time. The transition is irreversible
/// for the lifetime of the value.
///
/// All operations take `&mut self`: there is one writer and one reader at a
/// time, and callers needing concurrency must add their own lock.
pub struct MutableContent {
    clock: Arc<dyn Clock>,

    /// The initial contents. `None` once dirtied.
    initial: Option<Box<dyn ReadProxy>>,

    /// The dirtied contents. `None` while clean. Exactly one of `initial`
    /// and `rw` is set.
    rw: Option<ReadWriteLease>,

    /// Lowest offset ever written or truncated to. Equals the initial size
    /// while clean.
    dirty_threshold: u64,

    /// Time of the last modification, or `None` if never modified.
    mtime: Option<SystemTime>,
}

impl MutableContent {
    /// Wrap the given initial contents.
    pub fn new(initial: Box<dyn ReadProxy>, clock: Arc<dyn Clock>) -> Self {
        let dirty_threshold: u64 = initial.size();
        Self {
            clock,
            initial: Some(initial),
            rw: None,
            dirty_threshold,
            mtime: None,
        }
    }

    /// True once the contents have diverged from the initial state.
    pub fn dirty(&self) -> bool {
        self.rw.is_some()
    }

    /// Read up to `buf.len()` bytes at `offset`. A short (possibly
    /// zero-length) read signals end of content.
    pub async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, ContentError> {
        match (&mut self.initial, &self.rw) {
            (Some(proxy), _) => proxy.read_at(buf, offset).await,
            (None, Some(rw)) => rw.read_at(buf, offset),
            (None, None) => Err(ContentError::Usage("mutable content already released")),
        }
    }

    /// Write `buf` at `offset`, dirtying the content. Writing past the end
    /// extends the file, filling any gap with NULs.
    pub async fn write_at(&mut self, buf: &[u8], offset: u64) -> Result<usize, ContentError> {
        self.ensure_dirty().await?;
        self.dirty_threshold = self.dirty_threshold.min(offset);
        self.mtime = Some(self.clock.now());

        self.rw
            .as_mut()
            .expect("dirty content holds a read/write lease")
            .write_at(buf, offset)
    }

    /// Set the size to `n`, dirtying the content. Truncating a clean suffix
    /// counts as dirtying from `n`.
    pub async fn truncate(&mut self, n: u64) -> Result<(), ContentError> {
        self.ensure_dirty().await?;
        self.dirty_threshold = self.dirty_threshold.min(n);
        self.mtime = Some(self.clock.now());

        self.rw
            .as_mut()
            .expect("dirty content holds a read/write lease")
            .truncate(n)
    }

    /// Describe the current state.
    pub fn stat(&self) -> StatResult {
        let size: u64 = match (&self.initial, &self.rw) {
            (Some(proxy), _) => proxy.size(),
            (_, Some(rw)) => rw.size(),
            (None, None) => 0,
        };
        StatResult {
            size,
            dirty_threshold: self.dirty_threshold,
            mtime: self.mtime,
        }
    }

    /// Give up the content.
    ///
    /// A clean content is handed back untouched. A dirty one is consumed:
    /// the caller receives the backing read/write lease together with the
    /// captured dirty threshold and mtime.
    pub fn release(mut self) -> Release {
        match self.rw.take() {
            None => Release::Clean(self),
            Some(rw) => Release::Dirty(DirtyContent {
                rw,
                dirty_threshold: self.dirty_threshold,
                mtime: self.mtime.expect("dirty content always has an mtime"),
            }),
        }
    }

    /// Upgrade the initial proxy into a read/write lease if still clean.
    ///
    /// On failure the content stays clean and the operation may be retried.
    async fn ensure_dirty(&mut self) -> Result<(), ContentError> {
        if self.rw.is_some() {
            return Ok(());
        }

        let proxy: &mut Box<dyn ReadProxy> = self
            .initial
            .as_mut()
            .expect("clean content holds its initial proxy");
        let rw: ReadWriteLease = proxy.upgrade().await?;

        self.rw = Some(rw);
        self.initial = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SimulatedClock;
    use crate::lease::FileLeaser;
    use crate::proxy::{ChunkedReadProxy, Refresher};
    use crate::scratch::ScratchDir;
    use blobmount_remote::RemoteError;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    struct StubRefresher {
        data: Vec<u8>,
        /// Fail this many fetches before starting to succeed.
        failures: AtomicUsize,
    }

    impl StubRefresher {
        fn new(data: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                data: data.to_vec(),
                failures: AtomicUsize::new(0),
            })
        }

        fn failing(data: &[u8], failures: usize) -> Arc<Self> {
            Arc::new(Self {
                data: data.to_vec(),
                failures: AtomicUsize::new(failures),
            })
        }
    }

    #[async_trait::async_trait]
    impl Refresher for StubRefresher {
        async fn fetch(&self, offset: u64, len: u64) -> Result<Bytes, RemoteError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(RemoteError::NotFound {
                    name: "stub".to_string(),
                });
            }
            let start: usize = offset as usize;
            Ok(Bytes::copy_from_slice(&self.data[start..start + len as usize]))
        }
    }

    struct Harness {
        _dir: TempDir,
        leaser: FileLeaser,
        clock: Arc<SimulatedClock>,
    }

    impl Harness {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            Self {
                leaser: FileLeaser::new(ScratchDir::new(dir.path()), 64, 1 << 20),
                clock: Arc::new(SimulatedClock::default()),
                _dir: dir,
            }
        }

        fn content(&self, refresher: Arc<StubRefresher>, size: u64) -> MutableContent {
            let proxy = ChunkedReadProxy::new(self.leaser.clone(), refresher, size, 1 << 10);
            MutableContent::new(Box::new(proxy), self.clock.clone())
        }
    }

    #[tokio::test]
    async fn test_initial_stat() {
        let harness = Harness::new();
        let content = harness.content(StubRefresher::new(b"taco"), 4);

        let stat: StatResult = content.stat();
        assert_eq!(stat.size, 4);
        assert_eq!(stat.dirty_threshold, 4);
        assert_eq!(stat.mtime, None);
        assert!(!content.dirty());
    }

    #[tokio::test]
    async fn test_clean_reads_come_from_initial_contents() {
        let harness = Harness::new();
        let mut content = harness.content(StubRefresher::new(b"taco"), 4);

        let mut buf = [0u8; 4];
        assert_eq!(content.read_at(&mut buf, 0).await.unwrap(), 4);
        assert_eq!(&buf, b"taco");
        assert!(!content.dirty());
    }

    #[tokio::test]
    async fn test_write_dirties_and_stamps_mtime() {
        let harness = Harness::new();
        let mut content = harness.content(StubRefresher::new(b"taco"), 4);

        harness.clock.advance(Duration::from_secs(1));
        let write_time: SystemTime = harness.clock.now();

        assert_eq!(content.write_at(b"p", 0).await.unwrap(), 1);
        harness.clock.advance(Duration::from_secs(1));

        assert!(content.dirty());
        let stat: StatResult = content.stat();
        assert_eq!(stat.size, 4);
        assert_eq!(stat.dirty_threshold, 0);
        assert_eq!(stat.mtime, Some(write_time));

        let mut buf = [0u8; 4];
        assert_eq!(content.read_at(&mut buf, 0).await.unwrap(), 4);
        assert_eq!(&buf, b"paco");
    }

    #[tokio::test]
    async fn test_write_extends_with_nul_gap() {
        let harness = Harness::new();
        let mut content = harness.content(StubRefresher::new(b"taco"), 4);

        content.write_at(b"xy", 6).await.unwrap();

        let stat: StatResult = content.stat();
        assert_eq!(stat.size, 8);
        assert_eq!(stat.dirty_threshold, 4);

        let mut buf = [0u8; 8];
        assert_eq!(content.read_at(&mut buf, 0).await.unwrap(), 8);
        assert_eq!(&buf, b"taco\0\0xy");
    }

    #[tokio::test]
    async fn test_dirty_threshold_is_monotone() {
        let harness = Harness::new();
        let mut content = harness.content(StubRefresher::new(b"tacoburrito"), 11);

        content.write_at(b"x", 7).await.unwrap();
        assert_eq!(content.stat().dirty_threshold, 7);

        content.write_at(b"y", 3).await.unwrap();
        assert_eq!(content.stat().dirty_threshold, 3);

        // Writing above the threshold does not raise it.
        content.write_at(b"z", 9).await.unwrap();
        assert_eq!(content.stat().dirty_threshold, 3);

        content.truncate(1).await.unwrap();
        assert_eq!(content.stat().dirty_threshold, 1);
    }

    #[tokio::test]
    async fn test_truncate_dirties_from_the_new_size() {
        let harness = Harness::new();
        let mut content = harness.content(StubRefresher::new(b"taco"), 4);

        harness.clock.advance(Duration::from_secs(1));
        let truncate_time: SystemTime = harness.clock.now();

        content.truncate(2).await.unwrap();
        harness.clock.advance(Duration::from_secs(1));

        let stat: StatResult = content.stat();
        assert_eq!(stat.size, 2);
        assert_eq!(stat.dirty_threshold, 2);
        assert_eq!(stat.mtime, Some(truncate_time));

        let mut buf = [0u8; 4];
        assert_eq!(content.read_at(&mut buf, 0).await.unwrap(), 2);
        assert_eq!(&buf[..2], b"ta");
    }

    #[tokio::test]
    async fn test_truncate_upward_keeps_threshold_at_initial_size() {
        let harness = Harness::new();
        let mut content = harness.content(StubRefresher::new(b"taco"), 4);

        content.truncate(6).await.unwrap();

        let stat: StatResult = content.stat();
        assert_eq!(stat.size, 6);
        assert_eq!(stat.dirty_threshold, 4);
    }

    #[tokio::test]
    async fn test_release_clean_hands_the_content_back() {
        let harness = Harness::new();
        let content = harness.content(StubRefresher::new(b"taco"), 4);

        let mut content = match content.release() {
            Release::Clean(content) => content,
            Release::Dirty(_) => panic!("clean content released as dirty"),
        };

        // Still usable.
        let mut buf = [0u8; 4];
        assert_eq!(content.read_at(&mut buf, 0).await.unwrap(), 4);
        assert_eq!(&buf, b"taco");
    }

    #[tokio::test]
    async fn test_release_dirty_yields_the_lease_and_threshold() {
        let harness = Harness::new();
        let mut content = harness.content(StubRefresher::new(b"taco"), 4);

        content.write_at(b"p", 1).await.unwrap();
        let mtime: SystemTime = harness.clock.now();

        let dirty: DirtyContent = match content.release() {
            Release::Dirty(dirty) => dirty,
            Release::Clean(_) => panic!("dirty content released as clean"),
        };

        assert_eq!(dirty.dirty_threshold, 1);
        assert_eq!(dirty.mtime, mtime);
        assert_eq!(dirty.rw.size(), 4);

        let mut buf = [0u8; 4];
        dirty.rw.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"tpco");
    }

    #[tokio::test]
    async fn test_failed_upgrade_leaves_the_content_clean_and_retryable() {
        let harness = Harness::new();
        let mut content = harness.content(StubRefresher::failing(b"taco", 1), 4);

        // The first write fails to fault in the initial contents.
        let err = content.write_at(b"p", 0).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(!content.dirty());
        assert_eq!(content.stat().dirty_threshold, 4);
        assert_eq!(content.stat().mtime, None);

        // The retry succeeds.
        assert_eq!(content.write_at(b"p", 0).await.unwrap(), 1);
        assert!(content.dirty());

        let mut buf = [0u8; 4];
        assert_eq!(content.read_at(&mut buf, 0).await.unwrap(), 4);
        assert_eq!(&buf, b"paco");
    }
}
