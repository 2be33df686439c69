//! Chunked read proxy over a single refresher.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use blobmount_remote::RemoteError;

use crate::error::ContentError;
use crate::lease::{FileLeaser, ReadLease, ReadWriteLease};
use crate::proxy::{ReadProxy, Refresher};

/// How many times a read retries after the same chunk's lease is revoked
/// mid-read before giving up.
const MAX_CHUNK_REVOCATIONS: usize = 3;

/// Lazy, chunked cache over an immutable remote byte range.
///
/// The range is partitioned into fixed-size chunks (the tail chunk may be
/// shorter). Each chunk is materialized on first touch by fetching it
/// through the refresher into a read lease. Revoked chunk leases are
/// re-fetched transparently on the next access.
pub struct ChunkedReadProxy {
    leaser: FileLeaser,
    refresher: Arc<dyn Refresher>,
    size: u64,
    chunk_size: u64,
    /// One slot per chunk; `None` until materialized or after revocation is
    /// observed.
    chunks: Vec<Option<ReadLease>>,
}

impl ChunkedReadProxy {
    /// Create a proxy over `size` bytes served by `refresher`.
    pub fn new(
        leaser: FileLeaser,
        refresher: Arc<dyn Refresher>,
        size: u64,
        chunk_size: u64,
    ) -> Self {
        assert!(chunk_size > 0, "chunk size must be positive");
        let chunk_count: usize = size.div_ceil(chunk_size) as usize;
        Self {
            leaser,
            refresher,
            size,
            chunk_size,
            chunks: (0..chunk_count).map(|_| None).collect(),
        }
    }

    /// Create a single-chunk proxy whose contents are already held in
    /// `seed`, avoiding the first fetch. The seed must cover the whole
    /// proxied range.
    pub fn with_seed(
        leaser: FileLeaser,
        refresher: Arc<dyn Refresher>,
        size: u64,
        chunk_size: u64,
        seed: ReadLease,
    ) -> Result<Self, ContentError> {
        if seed.size() != size {
            debug_assert!(false, "seed lease size {} != proxied size {}", seed.size(), size);
            return Err(ContentError::Usage("seed lease size must match proxied size"));
        }
        let mut proxy = Self::new(leaser, refresher, size, chunk_size);
        match proxy.chunks.len() {
            0 => {}
            1 => proxy.chunks[0] = Some(seed),
            _ => return Err(ContentError::Usage("seed lease requires a single-chunk proxy")),
        }
        Ok(proxy)
    }

    fn chunk_len(&self, index: usize) -> u64 {
        let start: u64 = index as u64 * self.chunk_size;
        self.chunk_size.min(self.size - start)
    }

    /// Materialize the chunk at `index` if its slot is empty.
    async fn ensure_chunk(&mut self, index: usize) -> Result<(), ContentError> {
        if self.chunks[index].is_some() {
            return Ok(());
        }

        let start: u64 = index as u64 * self.chunk_size;
        let len: u64 = self.chunk_len(index);

        let data: Bytes = self.refresher.fetch(start, len).await?;
        if data.len() as u64 != len {
            return Err(ContentError::Remote(RemoteError::Io(format!(
                "refresher returned {} bytes for a {} byte chunk at offset {}",
                data.len(),
                len,
                start
            ))));
        }

        let mut rwl: ReadWriteLease = self.leaser.new_file()?;
        rwl.write_at(&data, 0)?;
        let lease: ReadLease = rwl.downgrade();

        // A chunk that cannot fit in the read pool at all can never be
        // cached; retrying would fetch it forever.
        if lease.revoked() {
            return Err(ContentError::TooLarge {
                size: len,
                limit: self.leaser.max_bytes(),
            });
        }

        self.chunks[index] = Some(lease);
        Ok(())
    }

    /// Fill `buf` from the chunk at `index`, starting `offset` bytes into
    /// the chunk. The requested range must lie within the chunk.
    async fn read_chunk(
        &mut self,
        index: usize,
        offset: u64,
        buf: &mut [u8],
    ) -> Result<(), ContentError> {
        let mut revocations: usize = 0;
        loop {
            self.ensure_chunk(index).await?;
            let lease: &ReadLease = self.chunks[index]
                .as_ref()
                .expect("chunk slot filled by ensure_chunk");

            match lease.read_at(buf, offset) {
                Ok(n) => {
                    debug_assert_eq!(n, buf.len(), "in-range chunk read came up short");
                    return Ok(());
                }
                Err(err) if err.is_revoked() => {
                    // Reclaimed between materialization and read; fetch
                    // again.
                    self.chunks[index] = None;
                    revocations += 1;
                    if revocations >= MAX_CHUNK_REVOCATIONS {
                        tracing::debug!(index, revocations, "giving up on repeatedly revoked chunk");
                        return Err(ContentError::Revoked);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[async_trait]
impl ReadProxy for ChunkedReadProxy {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, ContentError> {
        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }

        let end: u64 = (offset + buf.len() as u64).min(self.size);
        let mut filled: usize = 0;
        let mut pos: u64 = offset;

        while pos < end {
            let index: usize = (pos / self.chunk_size) as usize;
            let chunk_start: u64 = index as u64 * self.chunk_size;
            let chunk_end: u64 = chunk_start + self.chunk_len(index);

            let want: usize = (end.min(chunk_end) - pos) as usize;
            self.read_chunk(index, pos - chunk_start, &mut buf[filled..filled + want])
                .await?;

            filled += want;
            pos += want as u64;
        }

        Ok(filled)
    }

    async fn upgrade(&mut self) -> Result<ReadWriteLease, ContentError> {
        let mut target: ReadWriteLease = self.leaser.new_file()?;

        for index in 0..self.chunks.len() {
            let start: u64 = index as u64 * self.chunk_size;
            let len: u64 = self.chunk_len(index);

            // Prefer the cached chunk if it survives; it is in the target
            // afterwards either way, so the cache entry is dropped.
            if let Some(lease) = self.chunks[index].take() {
                let mut staging: Vec<u8> = vec![0u8; len as usize];
                match lease.read_at(&mut staging, 0) {
                    Ok(n) if n as u64 == len => {
                        target.write_at(&staging, start)?;
                        continue;
                    }
                    Ok(_) => {}
                    Err(err) if err.is_revoked() => {}
                    Err(err) => return Err(err),
                }
            }

            // Fetch straight into the target. Read/write leases are exempt
            // from eviction, so this cannot churn against the read pool the
            // way staging through a read lease would.
            let data: Bytes = self.refresher.fetch(start, len).await?;
            if data.len() as u64 != len {
                return Err(ContentError::Remote(RemoteError::Io(format!(
                    "refresher returned {} bytes for a {} byte chunk at offset {}",
                    data.len(),
                    len,
                    start
                ))));
            }
            target.write_at(&data, start)?;
        }

        Ok(target)
    }
}

impl std::fmt::Debug for ChunkedReadProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedReadProxy")
            .field("size", &self.size)
            .field("chunk_size", &self.chunk_size)
            .field("materialized", &self.chunks.iter().filter(|c| c.is_some()).count())
            .finish()
    }
}
