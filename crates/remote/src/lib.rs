//! Remote blob store interface for blobmount.
//!
//! This crate defines the seam between the local content-mutation engine and
//! the remote, object-oriented blob store ("the bucket"): immutable object
//! records, the async [`Bucket`] trait, and an in-memory [`FakeBucket`] used
//! by tests.
//!
//! Objects are versioned: every distinct write of a name is assigned a
//! monotonically increasing *generation* number by the store. Mutating
//! operations accept generation preconditions, which is what the core's
//! optimistic concurrency control is built on.

pub mod bucket;
pub mod error;
pub mod fake;
pub mod record;

pub use bucket::{
    Bucket, ComposeObjectsRequest, ComposeSource, CreateObjectRequest, ReadObjectRequest,
};
pub use error::RemoteError;
pub use fake::FakeBucket;
pub use record::ObjectRecord;
