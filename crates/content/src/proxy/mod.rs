//! Lazy read proxies over remote byte ranges.
//!
//! A read proxy presents an immutable remote range as readable without
//! materializing anything until it is touched. Materialized pieces live in
//! revocable read leases, so the leaser may reclaim them at any time; the
//! proxy re-fetches transparently on the next access.

mod chunked;
mod multi;
mod object;

pub use chunked::ChunkedReadProxy;
pub use multi::MultiReadProxy;
pub use object::{new_object_proxy, ObjectRefresher};

use async_trait::async_trait;
use bytes::Bytes;

use blobmount_remote::RemoteError;

use crate::error::ContentError;
use crate::lease::ReadWriteLease;

/// Materializes sub-ranges of a remote byte range.
///
/// Offsets are relative to the proxied range. Implementations typically wrap
/// a ranged, generation-pinned remote read.
#[async_trait]
pub trait Refresher: Send + Sync {
    /// Produce exactly `len` bytes starting at `offset`.
    async fn fetch(&self, offset: u64, len: u64) -> Result<Bytes, RemoteError>;
}

/// An immutable view of a remote byte range of known size.
///
/// External synchronization is required; all access goes through `&mut self`.
/// A short (possibly zero-length) read from [`read_at`](Self::read_at)
/// signals the end of the range.
#[async_trait]
pub trait ReadProxy: Send {
    /// Size of the proxied range in bytes.
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes starting at `offset`.
    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, ContentError>;

    /// Materialize everything into an exclusively owned read/write lease.
    ///
    /// On success the proxy's caches are consumed and the caller should drop
    /// it. On failure the proxy is intact and the call may be retried.
    async fn upgrade(&mut self) -> Result<ReadWriteLease, ContentError>;
}
