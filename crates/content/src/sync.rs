//! Flushing dirty content back to the remote object.

use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use blobmount_remote::{
    Bucket, ComposeObjectsRequest, ComposeSource, CreateObjectRequest, ObjectRecord,
};

use crate::content::{DirtyContent, MutableContent, Release};
use crate::error::ContentError;
use crate::lease::{ReadLease, ReadWriteLease};

/// Outcome of [`ObjectSyncer::sync_object`].
pub enum SyncResult {
    /// The content was never modified. It is handed back, still usable, and
    /// the remote was not touched.
    Clean(MutableContent),

    /// The content was flushed as a new generation of the source object.
    /// The lease retains the flushed bytes and can seed a fresh read proxy
    /// over the new record, saving a re-fetch.
    Synced {
        /// Read lease over exactly the flushed contents.
        lease: ReadLease,
        /// Record for the newly written generation.
        record: ObjectRecord,
    },
}

impl std::fmt::Debug for SyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncResult::Clean(_) => write!(f, "SyncResult::Clean(..)"),
            SyncResult::Synced { record, .. } => {
                write!(f, "SyncResult::Synced {{ record: {record:?}, .. }}")
            }
        }
    }
}

/// Flushes mutable content to the remote with generation-based optimistic
/// concurrency.
///
/// A pure append (nothing below the source object's size was touched, and
/// the growth is at least `append_threshold` bytes) is flushed by uploading
/// only the suffix to a temporary object and composing it onto the source
/// server-side. Everything else is a full overwrite. Both paths require the
/// destination to still be at the source record's generation; a concurrent
/// remote update surfaces as a precondition failure, never retried here.
///
/// The syncer is stateless across calls and may be used concurrently on
/// distinct contents.
pub struct ObjectSyncer {
    bucket: Arc<dyn Bucket>,
    append_threshold: u64,
    tmp_prefix: String,
}

impl ObjectSyncer {
    /// Create a syncer writing temporary compose sources under `tmp_prefix`.
    ///
    /// With `append_threshold` zero, every pure append uses the compose fast
    /// path; larger values amortize compose overhead for small appends.
    pub fn new(append_threshold: u64, tmp_prefix: impl Into<String>, bucket: Arc<dyn Bucket>) -> Self {
        Self {
            bucket,
            append_threshold,
            tmp_prefix: tmp_prefix.into(),
        }
    }

    /// Flush `content` back to the object described by `src`.
    ///
    /// A clean content is a no-op and is handed back. A dirty content is
    /// consumed; on success the new record and a lease retaining the flushed
    /// bytes are returned, and on failure the local modifications are gone
    /// and the caller resolves the conflict at its own level (typically by
    /// re-reading the remote).
    pub async fn sync_object(
        &self,
        src: &ObjectRecord,
        content: MutableContent,
    ) -> Result<SyncResult, ContentError> {
        let dirty: DirtyContent = match content.release() {
            Release::Clean(content) => return Ok(SyncResult::Clean(content)),
            Release::Dirty(dirty) => dirty,
        };

        let new_size: u64 = dirty.rw.size();
        if dirty.dirty_threshold > src.size {
            debug_assert!(
                false,
                "dirty threshold {} above source size {}",
                dirty.dirty_threshold, src.size
            );
            return Err(ContentError::Usage(
                "dirty threshold above the source object size",
            ));
        }

        let record: ObjectRecord = if self.uses_append_path(dirty.dirty_threshold, src.size, new_size)
        {
            tracing::debug!(name = %src.name, suffix = new_size - src.size, "syncing via append compose");
            self.append_compose(src, &dirty.rw, new_size).await?
        } else {
            tracing::debug!(name = %src.name, size = new_size, "syncing via full overwrite");
            self.full_overwrite(src, &dirty.rw, new_size).await?
        };

        Ok(SyncResult::Synced {
            lease: dirty.rw.downgrade(),
            record,
        })
    }

    /// Whether a flush qualifies for the append compose fast path. Pure
    /// function of the sizes, so flush behavior is reproducible.
    fn uses_append_path(&self, dirty_threshold: u64, src_size: u64, new_size: u64) -> bool {
        dirty_threshold >= src_size
            && src_size > 0
            && new_size >= src_size
            && new_size - src_size >= self.append_threshold
    }

    /// Upload the suffix to a temporary object, compose it onto the source,
    /// and best-effort delete the temporary.
    async fn append_compose(
        &self,
        src: &ObjectRecord,
        rw: &ReadWriteLease,
        new_size: u64,
    ) -> Result<ObjectRecord, ContentError> {
        let suffix: Vec<u8> = read_lease_range(rw, src.size..new_size)?;
        let tmp_name: String = format!("{}{}", self.tmp_prefix, Uuid::new_v4().simple());

        let tmp: ObjectRecord = self
            .bucket
            .create_object(CreateObjectRequest {
                name: tmp_name.clone(),
                contents: Bytes::from(suffix),
                generation_precondition: None,
                metadata: BTreeMap::new(),
            })
            .await?;

        let composed = self
            .bucket
            .compose_objects(ComposeObjectsRequest {
                dst_name: src.name.clone(),
                dst_generation_precondition: Some(src.generation),
                sources: vec![
                    ComposeSource {
                        name: src.name.clone(),
                        generation: src.generation,
                    },
                    ComposeSource {
                        name: tmp_name.clone(),
                        generation: tmp.generation,
                    },
                ],
            })
            .await;

        // Clean up the temporary whether or not the compose landed. Leaked
        // temporaries are tolerated and collected separately.
        if let Err(err) = self.bucket.delete_object(&tmp_name).await {
            tracing::debug!(name = %tmp_name, %err, "leaving temporary compose source behind");
        }

        Ok(composed?)
    }

    /// Upload the entire contents as a new generation of the source.
    async fn full_overwrite(
        &self,
        src: &ObjectRecord,
        rw: &ReadWriteLease,
        new_size: u64,
    ) -> Result<ObjectRecord, ContentError> {
        let contents: Vec<u8> = read_lease_range(rw, 0..new_size)?;

        let record = self
            .bucket
            .create_object(CreateObjectRequest {
                name: src.name.clone(),
                contents: Bytes::from(contents),
                generation_precondition: Some(src.generation),
                metadata: BTreeMap::new(),
            })
            .await?;

        Ok(record)
    }
}

/// Read an exact byte range out of a read/write lease.
fn read_lease_range(rw: &ReadWriteLease, range: Range<u64>) -> Result<Vec<u8>, ContentError> {
    let len: usize = (range.end - range.start) as usize;
    let mut buf: Vec<u8> = vec![0u8; len];
    let n: usize = rw.read_at(&mut buf, range.start)?;
    if n != len {
        return Err(ContentError::ScratchIo(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "scratch file shorter than its tracked size",
        )));
    }
    Ok(buf)
}
