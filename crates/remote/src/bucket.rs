//! The `Bucket` trait and its request types.

use std::collections::BTreeMap;
use std::ops::Range;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::RemoteError;
use crate::record::ObjectRecord;

/// Request to write a new generation of an object.
#[derive(Debug, Clone)]
pub struct CreateObjectRequest {
    /// Destination object name.
    pub name: String,

    /// Full contents of the new generation.
    pub contents: Bytes,

    /// Generation the current object must have for the write to proceed.
    /// `Some(0)` means the object must not exist; `None` writes
    /// unconditionally.
    pub generation_precondition: Option<i64>,

    /// Metadata to attach to the new generation.
    pub metadata: BTreeMap<String, String>,
}

impl CreateObjectRequest {
    /// Build an unconditional request with no metadata.
    pub fn new(name: impl Into<String>, contents: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            contents: contents.into(),
            generation_precondition: None,
            metadata: BTreeMap::new(),
        }
    }

    /// Require the destination to currently be at `generation`.
    pub fn with_generation_precondition(mut self, generation: i64) -> Self {
        self.generation_precondition = Some(generation);
        self
    }
}

/// One source object for a compose operation.
#[derive(Debug, Clone)]
pub struct ComposeSource {
    /// Source object name.
    pub name: String,

    /// Generation to read. Zero means the current generation.
    pub generation: i64,
}

/// Request to compose several objects into a destination.
///
/// The store concatenates the source contents, in order, into a new
/// generation of the destination, atomically under the destination
/// precondition.
#[derive(Debug, Clone)]
pub struct ComposeObjectsRequest {
    /// Destination object name.
    pub dst_name: String,

    /// Generation the destination must have for the compose to proceed.
    pub dst_generation_precondition: Option<i64>,

    /// Sources, concatenated in order.
    pub sources: Vec<ComposeSource>,
}

/// Request to read (a range of) an object.
#[derive(Debug, Clone)]
pub struct ReadObjectRequest {
    /// Object name.
    pub name: String,

    /// Pin the read to a specific generation. A pinned read of a generation
    /// that has been replaced or deleted fails with not-found rather than
    /// returning bytes from a different version.
    pub generation: Option<i64>,

    /// Byte range to read; `None` reads everything. Ranges extending past
    /// the end are truncated.
    pub range: Option<Range<u64>>,
}

/// Interface to a remote, versioned blob store.
///
/// Implement this trait to integrate with a real store; tests use
/// [`crate::FakeBucket`]. All operations may block for an unbounded time;
/// dropping the returned future aborts the in-flight request.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Look up the current record for a name.
    async fn stat_object(&self, name: &str) -> Result<ObjectRecord, RemoteError>;

    /// Write a new generation of an object.
    async fn create_object(&self, req: CreateObjectRequest) -> Result<ObjectRecord, RemoteError>;

    /// Concatenate source objects into a new generation of the destination.
    async fn compose_objects(
        &self,
        req: ComposeObjectsRequest,
    ) -> Result<ObjectRecord, RemoteError>;

    /// Read object contents.
    async fn read_object(&self, req: ReadObjectRequest) -> Result<Bytes, RemoteError>;

    /// Delete an object. Deleting a missing object fails with not-found.
    async fn delete_object(&self, name: &str) -> Result<(), RemoteError>;

    /// List current records whose names start with `prefix`, sorted by name.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectRecord>, RemoteError>;
}
