//! Read proxies over remote objects.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;

use blobmount_remote::{Bucket, ObjectRecord, ReadObjectRequest, RemoteError};

use crate::error::ContentError;
use crate::lease::{FileLeaser, ReadLease};
use crate::proxy::{ChunkedReadProxy, MultiReadProxy, ReadProxy, Refresher};

/// Refresher that serves a sub-range of one generation of a remote object.
///
/// Reads are pinned to the record's generation: if the object is replaced or
/// deleted remotely, fetches fail with not-found instead of returning bytes
/// from a different version.
pub struct ObjectRefresher {
    bucket: Arc<dyn Bucket>,
    name: String,
    generation: i64,
    /// Absolute start of the proxied range within the object.
    start: u64,
}

impl ObjectRefresher {
    /// Serve the range of `record` beginning at absolute offset `start`.
    pub fn new(bucket: Arc<dyn Bucket>, record: &ObjectRecord, start: u64) -> Self {
        Self {
            bucket,
            name: record.name.clone(),
            generation: record.generation,
            start,
        }
    }
}

#[async_trait]
impl Refresher for ObjectRefresher {
    async fn fetch(&self, offset: u64, len: u64) -> Result<Bytes, RemoteError> {
        let lo: u64 = self.start + offset;
        self.bucket
            .read_object(ReadObjectRequest {
                name: self.name.clone(),
                generation: Some(self.generation),
                range: Some(lo..lo + len),
            })
            .await
    }
}

/// Build a read proxy over the full contents of a remote object.
///
/// If `top_lease` is provided it must hold exactly the object's contents
/// (typically the lease returned by a just-completed sync) and is used as
/// the first copy, saving a re-fetch. Objects no larger than `chunk_size`
/// get a single chunked proxy; larger objects get a multi proxy with one
/// chunk-sized sub-proxy per chunk.
pub fn new_object_proxy(
    leaser: &FileLeaser,
    bucket: Arc<dyn Bucket>,
    record: &ObjectRecord,
    top_lease: Option<ReadLease>,
    chunk_size: u64,
) -> Result<Box<dyn ReadProxy>, ContentError> {
    if record.size <= chunk_size {
        let refresher = Arc::new(ObjectRefresher::new(bucket, record, 0));
        let proxy: ChunkedReadProxy = match top_lease {
            Some(lease) => ChunkedReadProxy::with_seed(
                leaser.clone(),
                refresher,
                record.size,
                chunk_size,
                lease,
            )?,
            None => ChunkedReadProxy::new(leaser.clone(), refresher, record.size, chunk_size),
        };
        return Ok(Box::new(proxy));
    }

    let mut parts: Vec<Box<dyn ReadProxy>> = Vec::new();
    let mut start: u64 = 0;
    while start < record.size {
        let len: u64 = chunk_size.min(record.size - start);
        let refresher = Arc::new(ObjectRefresher::new(Arc::clone(&bucket), record, start));
        parts.push(Box::new(ChunkedReadProxy::new(
            leaser.clone(),
            refresher,
            len,
            chunk_size,
        )));
        start += len;
    }

    Ok(Box::new(MultiReadProxy::new(leaser.clone(), parts, top_lease)?))
}
