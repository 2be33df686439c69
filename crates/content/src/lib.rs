//! Local content-mutation engine for remote blob objects.
//!
//! This crate turns the contents of a remote, immutable, versioned blob
//! into a locally mutable byte range that can be read, overwritten,
//! extended, truncated, and eventually flushed back, while bounding the
//! on-disk scratch space used across many open files and detecting
//! concurrent remote modification.
//!
//! # Architecture
//!
//! ```text
//! ObjectSyncer      flush with generation preconditions, append fast path
//! MutableContent    copy-on-write view, dirty threshold, mtime
//! ReadProxy         lazy chunked cache over a remote range
//! FileLeaser        bounded pool of scratch files, LRU eviction
//! ScratchDir        anonymous temporary files
//! ```
//!
//! The kernel-facing filesystem adapter, inode graph, and transport live in
//! external crates; they drive this engine through [`MutableContent`] and
//! [`ObjectSyncer`] and provide their own per-file synchronization.

pub mod clock;
pub mod content;
pub mod error;
pub mod lease;
pub mod proxy;
pub mod scratch;
pub mod sync;

pub use clock::{Clock, SimulatedClock, SystemClock};
pub use content::{DirtyContent, MutableContent, Release, StatResult};
pub use error::ContentError;
pub use lease::{FileLeaser, LeaserStats, ReadLease, ReadWriteLease};
pub use proxy::{
    new_object_proxy, ChunkedReadProxy, MultiReadProxy, ObjectRefresher, ReadProxy, Refresher,
};
pub use scratch::ScratchDir;
pub use sync::{ObjectSyncer, SyncResult};
