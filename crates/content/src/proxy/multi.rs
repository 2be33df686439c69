//! Concatenating read proxy.

use async_trait::async_trait;

use crate::error::ContentError;
use crate::lease::{FileLeaser, ReadLease, ReadWriteLease};
use crate::proxy::ReadProxy;

/// One wrapped proxy, indexed by its logical starting offset.
struct Part {
    start: u64,
    size: u64,
    proxy: Box<dyn ReadProxy>,
}

/// Concatenation of an ordered sequence of read proxies.
///
/// Part `i` starts at the sum of the sizes of parts `0..i`; the total size
/// is the sum over all parts. An optional top-level read lease covering the
/// entire concatenation serves as a fast path: it is consulted first on
/// every read and upgrade, and once observed revoked it is dropped and the
/// per-part path takes over for good.
pub struct MultiReadProxy {
    leaser: FileLeaser,
    size: u64,
    parts: Vec<Part>,
    lease: Option<ReadLease>,
}

impl MultiReadProxy {
    /// Wrap `proxies` in concatenation order.
    ///
    /// If `lease` is provided it must hold exactly the concatenated
    /// contents; a size mismatch is a usage error.
    pub fn new(
        leaser: FileLeaser,
        proxies: Vec<Box<dyn ReadProxy>>,
        lease: Option<ReadLease>,
    ) -> Result<Self, ContentError> {
        let mut parts: Vec<Part> = Vec::with_capacity(proxies.len());
        let mut size: u64 = 0;
        for proxy in proxies {
            let part_size: u64 = proxy.size();
            parts.push(Part {
                start: size,
                size: part_size,
                proxy,
            });
            size += part_size;
        }

        if let Some(lease) = &lease {
            if lease.size() != size {
                debug_assert!(
                    false,
                    "top-level lease of {} bytes does not match combined size {}",
                    lease.size(),
                    size
                );
                return Err(ContentError::Usage(
                    "top-level lease size must match combined proxy size",
                ));
            }
        }

        Ok(Self {
            leaser,
            size,
            parts,
            lease,
        })
    }

    /// Index of the part containing `offset`: the last part whose start
    /// offset is at most `offset`.
    fn containing_part(&self, offset: u64) -> usize {
        self.parts.partition_point(|part| part.start <= offset) - 1
    }
}

#[async_trait]
impl ReadProxy for MultiReadProxy {
    fn size(&self) -> u64 {
        self.size
    }

    async fn read_at(&mut self, buf: &mut [u8], offset: u64) -> Result<usize, ContentError> {
        // Fast path: read directly from the top-level lease.
        if let Some(lease) = &self.lease {
            match lease.read_at(buf, offset) {
                Ok(n) => return Ok(n),
                Err(err) if err.is_revoked() => {
                    tracing::debug!("top-level lease revoked; falling back to wrapped proxies");
                    self.lease = None;
                }
                Err(err) => return Err(err),
            }
        }

        if buf.is_empty() || offset >= self.size {
            return Ok(0);
        }

        let mut index: usize = self.containing_part(offset);
        let mut filled: usize = 0;
        let mut pos: u64 = offset;

        while filled < buf.len() && index < self.parts.len() {
            let part: &mut Part = &mut self.parts[index];
            if part.size == 0 {
                index += 1;
                continue;
            }

            let rel: u64 = pos - part.start;
            let want: usize = ((part.size - rel) as usize).min(buf.len() - filled);
            let n: usize = part.proxy.read_at(&mut buf[filled..filled + want], rel).await?;
            debug_assert_eq!(n, want, "wrapped proxy served a short in-range read");

            filled += n;
            pos += n as u64;
            if n < want {
                break;
            }
            if pos == part.start + part.size {
                index += 1;
            }
        }

        Ok(filled)
    }

    async fn upgrade(&mut self) -> Result<ReadWriteLease, ContentError> {
        // Fast path: upgrade the top-level lease directly.
        if let Some(lease) = self.lease.take() {
            match lease.upgrade() {
                Ok(rwl) => return Ok(rwl),
                Err(err) if err.is_revoked() => {}
                Err(err) => return Err(err),
            }
        }

        // Accumulate each wrapped proxy in turn.
        let mut target: ReadWriteLease = self.leaser.new_file()?;
        let mut pos: u64 = 0;
        for part in &mut self.parts {
            let source: ReadWriteLease = part.proxy.upgrade().await?;
            copy_into(&source, &mut target, pos, part.size)?;
            pos += part.size;
        }

        Ok(target)
    }
}

/// Copy `len` bytes from the start of `source` into `target` at
/// `dst_offset`.
fn copy_into(
    source: &ReadWriteLease,
    target: &mut ReadWriteLease,
    dst_offset: u64,
    len: u64,
) -> Result<(), ContentError> {
    const COPY_BUF: usize = 128 * 1024;

    let mut buf: Vec<u8> = vec![0u8; COPY_BUF.min(len as usize).max(1)];
    let mut copied: u64 = 0;
    while copied < len {
        let want: usize = ((len - copied) as usize).min(buf.len());
        let n: usize = source.read_at(&mut buf[..want], copied)?;
        if n == 0 {
            return Err(ContentError::ScratchIo(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "upgraded lease shorter than its proxy's size",
            )));
        }
        target.write_at(&buf[..n], dst_offset + copied)?;
        copied += n as u64;
    }
    Ok(())
}

impl std::fmt::Debug for MultiReadProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiReadProxy")
            .field("size", &self.size)
            .field("parts", &self.parts.len())
            .field("has_lease", &self.lease.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{ChunkedReadProxy, Refresher};
    use crate::scratch::ScratchDir;
    use blobmount_remote::RemoteError;
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use tempfile::TempDir;

    struct StubRefresher {
        data: Vec<u8>,
        fetches: Mutex<usize>,
    }

    impl StubRefresher {
        fn new(data: &[u8]) -> Arc<Self> {
            Arc::new(Self {
                data: data.to_vec(),
                fetches: Mutex::new(0),
            })
        }

        fn fetch_count(&self) -> usize {
            *self.fetches.lock()
        }
    }

    #[async_trait]
    impl Refresher for StubRefresher {
        async fn fetch(&self, offset: u64, len: u64) -> Result<Bytes, RemoteError> {
            *self.fetches.lock() += 1;
            let start: usize = offset as usize;
            Ok(Bytes::copy_from_slice(&self.data[start..start + len as usize]))
        }
    }

    fn new_leaser() -> (FileLeaser, TempDir) {
        let dir = TempDir::new().unwrap();
        let leaser = FileLeaser::new(ScratchDir::new(dir.path()), 64, 1 << 20);
        (leaser, dir)
    }

    /// Build a multi proxy over the given strings, one part per string.
    fn multi_over(
        leaser: &FileLeaser,
        contents: &[&[u8]],
        lease: Option<ReadLease>,
    ) -> (MultiReadProxy, Vec<Arc<StubRefresher>>) {
        let mut refreshers: Vec<Arc<StubRefresher>> = Vec::new();
        let mut proxies: Vec<Box<dyn ReadProxy>> = Vec::new();
        for data in contents {
            let refresher = StubRefresher::new(data);
            refreshers.push(refresher.clone());
            proxies.push(Box::new(ChunkedReadProxy::new(
                leaser.clone(),
                refresher,
                data.len() as u64,
                3,
            )));
        }
        let proxy = MultiReadProxy::new(leaser.clone(), proxies, lease).unwrap();
        (proxy, refreshers)
    }

    fn full_lease(leaser: &FileLeaser, data: &[u8]) -> ReadLease {
        let mut rwl = leaser.new_file().unwrap();
        rwl.write_at(data, 0).unwrap();
        rwl.downgrade()
    }

    #[tokio::test]
    async fn test_size_is_sum_of_parts() {
        let (leaser, _dir) = new_leaser();
        let (proxy, _) = multi_over(&leaser, &[b"taco", b"", b"burrito"], None);
        assert_eq!(proxy.size(), 11);
    }

    #[tokio::test]
    async fn test_read_within_one_part() {
        let (leaser, _dir) = new_leaser();
        let (mut proxy, refreshers) = multi_over(&leaser, &[b"taco", b"burrito"], None);

        let mut buf = [0u8; 3];
        assert_eq!(proxy.read_at(&mut buf, 5).await.unwrap(), 3);
        assert_eq!(&buf, b"urr");

        // Only the second part was touched.
        assert_eq!(refreshers[0].fetch_count(), 0);
        assert!(refreshers[1].fetch_count() > 0);
    }

    #[tokio::test]
    async fn test_read_spanning_parts() {
        let (leaser, _dir) = new_leaser();
        let (mut proxy, _) = multi_over(&leaser, &[b"taco", b"", b"burrito"], None);

        let mut buf = [0u8; 7];
        assert_eq!(proxy.read_at(&mut buf, 2).await.unwrap(), 7);
        assert_eq!(&buf, b"coburri");
    }

    #[tokio::test]
    async fn test_read_past_end_is_eof() {
        let (leaser, _dir) = new_leaser();
        let (mut proxy, _) = multi_over(&leaser, &[b"taco", b"burrito"], None);

        let mut buf = [0u8; 8];
        assert_eq!(proxy.read_at(&mut buf, 11).await.unwrap(), 0);
        assert_eq!(proxy.read_at(&mut buf, 100).await.unwrap(), 0);

        // Straddling the end yields a short read.
        assert_eq!(proxy.read_at(&mut buf, 8).await.unwrap(), 3);
        assert_eq!(&buf[..3], b"ito");
    }

    #[tokio::test]
    async fn test_top_level_lease_serves_reads() {
        let (leaser, _dir) = new_leaser();
        let lease = full_lease(&leaser, b"tacoburrito");
        let (mut proxy, refreshers) = multi_over(&leaser, &[b"taco", b"burrito"], Some(lease));

        let mut buf = [0u8; 11];
        assert_eq!(proxy.read_at(&mut buf, 0).await.unwrap(), 11);
        assert_eq!(&buf, b"tacoburrito");
        assert_eq!(refreshers[0].fetch_count(), 0);
        assert_eq!(refreshers[1].fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_revoked_top_level_lease_falls_back() {
        let (leaser, _dir) = new_leaser();
        let lease = full_lease(&leaser, b"tacoburrito");
        lease.revoke();
        let (mut proxy, refreshers) = multi_over(&leaser, &[b"taco", b"burrito"], Some(lease));

        let mut buf = [0u8; 11];
        assert_eq!(proxy.read_at(&mut buf, 0).await.unwrap(), 11);
        assert_eq!(&buf, b"tacoburrito");
        assert!(refreshers[0].fetch_count() > 0);

        // The lease is gone for good; later reads keep using the parts.
        assert_eq!(proxy.read_at(&mut buf[..4], 0).await.unwrap(), 4);
        assert_eq!(&buf[..4], b"taco");
    }

    #[tokio::test]
    async fn test_mismatched_top_level_lease_is_rejected() {
        let (leaser, _dir) = new_leaser();
        let lease = full_lease(&leaser, b"short");

        let refresher = StubRefresher::new(b"tacoburrito");
        let proxies: Vec<Box<dyn ReadProxy>> = vec![Box::new(ChunkedReadProxy::new(
            leaser.clone(),
            refresher,
            11,
            3,
        ))];

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            MultiReadProxy::new(leaser.clone(), proxies, Some(lease))
        }));

        // Debug builds trap; release builds refuse with a usage error.
        if let Ok(inner) = result {
            assert!(matches!(inner.unwrap_err(), ContentError::Usage(_)));
        }
    }

    #[tokio::test]
    async fn test_upgrade_concatenates_parts() {
        let (leaser, _dir) = new_leaser();
        let (mut proxy, _) = multi_over(&leaser, &[b"taco", b"", b"burrito"], None);

        let rwl: ReadWriteLease = proxy.upgrade().await.unwrap();
        assert_eq!(rwl.size(), 11);

        let mut buf = [0u8; 11];
        rwl.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"tacoburrito");
    }

    #[tokio::test]
    async fn test_upgrade_uses_top_level_lease() {
        let (leaser, _dir) = new_leaser();
        let lease = full_lease(&leaser, b"tacoburrito");
        let (mut proxy, refreshers) = multi_over(&leaser, &[b"taco", b"burrito"], Some(lease));

        let rwl: ReadWriteLease = proxy.upgrade().await.unwrap();
        assert_eq!(rwl.size(), 11);

        let mut buf = [0u8; 11];
        rwl.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"tacoburrito");
        assert_eq!(refreshers[0].fetch_count(), 0);
        assert_eq!(refreshers[1].fetch_count(), 0);
    }

    #[tokio::test]
    async fn test_upgrade_with_revoked_lease_falls_back() {
        let (leaser, _dir) = new_leaser();
        let lease = full_lease(&leaser, b"tacoburrito");
        lease.revoke();
        let (mut proxy, _) = multi_over(&leaser, &[b"taco", b"burrito"], Some(lease));

        let rwl: ReadWriteLease = proxy.upgrade().await.unwrap();

        let mut buf = [0u8; 11];
        rwl.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"tacoburrito");
    }
}
