//! In-memory bucket for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use crate::bucket::{
    Bucket, ComposeObjectsRequest, CreateObjectRequest, ReadObjectRequest,
};
use crate::error::RemoteError;
use crate::record::ObjectRecord;

/// One stored generation.
#[derive(Debug, Clone)]
struct StoredObject {
    record: ObjectRecord,
    data: Bytes,
}

/// In-memory [`Bucket`] implementation.
///
/// Keeps only the newest generation of each name, assigns generations from a
/// process-wide monotone counter, and implements the same precondition and
/// compose semantics the core expects from a real store.
#[derive(Debug)]
pub struct FakeBucket {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    /// Starts at one; generation zero stands for "absent" in preconditions.
    next_generation: AtomicI64,
}

impl Default for FakeBucket {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeBucket {
    /// Create an empty bucket.
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
            next_generation: AtomicI64::new(1),
        }
    }

    /// Number of objects currently stored.
    pub fn object_count(&self) -> usize {
        self.objects.lock().len()
    }

    fn allocate_generation(&self) -> i64 {
        self.next_generation.fetch_add(1, Ordering::Relaxed)
    }

    /// Check a generation precondition against the current state of `name`.
    fn check_precondition(
        objects: &BTreeMap<String, StoredObject>,
        name: &str,
        precondition: Option<i64>,
    ) -> Result<(), RemoteError> {
        let Some(required) = precondition else {
            return Ok(());
        };

        let found: i64 = objects.get(name).map(|o| o.record.generation).unwrap_or(0);
        if found != required {
            return Err(RemoteError::Precondition {
                name: name.to_string(),
                required,
                found,
            });
        }

        Ok(())
    }

    fn not_found(name: &str) -> RemoteError {
        RemoteError::NotFound {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl Bucket for FakeBucket {
    async fn stat_object(&self, name: &str) -> Result<ObjectRecord, RemoteError> {
        let objects = self.objects.lock();
        objects
            .get(name)
            .map(|o| o.record.clone())
            .ok_or_else(|| Self::not_found(name))
    }

    async fn create_object(&self, req: CreateObjectRequest) -> Result<ObjectRecord, RemoteError> {
        let mut objects = self.objects.lock();
        Self::check_precondition(&objects, &req.name, req.generation_precondition)?;

        let record = ObjectRecord {
            name: req.name.clone(),
            generation: self.allocate_generation(),
            size: req.contents.len() as u64,
            metadata: req.metadata,
        };
        objects.insert(
            req.name,
            StoredObject {
                record: record.clone(),
                data: req.contents,
            },
        );

        Ok(record)
    }

    async fn compose_objects(
        &self,
        req: ComposeObjectsRequest,
    ) -> Result<ObjectRecord, RemoteError> {
        let mut objects = self.objects.lock();
        Self::check_precondition(&objects, &req.dst_name, req.dst_generation_precondition)?;

        // Gather source contents before touching the destination, so a
        // missing source leaves the bucket unchanged.
        let mut combined: Vec<u8> = Vec::new();
        for source in &req.sources {
            let stored = objects.get(&source.name).ok_or_else(|| Self::not_found(&source.name))?;
            if source.generation != 0 && stored.record.generation != source.generation {
                return Err(Self::not_found(&source.name));
            }
            combined.extend_from_slice(&stored.data);
        }

        let record = ObjectRecord {
            name: req.dst_name.clone(),
            generation: self.allocate_generation(),
            size: combined.len() as u64,
            metadata: BTreeMap::new(),
        };
        objects.insert(
            req.dst_name,
            StoredObject {
                record: record.clone(),
                data: Bytes::from(combined),
            },
        );

        Ok(record)
    }

    async fn read_object(&self, req: ReadObjectRequest) -> Result<Bytes, RemoteError> {
        let objects = self.objects.lock();
        let stored = objects.get(&req.name).ok_or_else(|| Self::not_found(&req.name))?;

        if let Some(generation) = req.generation {
            if stored.record.generation != generation {
                return Err(Self::not_found(&req.name));
            }
        }

        let data: Bytes = match req.range {
            None => stored.data.clone(),
            Some(range) => {
                let len: u64 = stored.data.len() as u64;
                let start: usize = range.start.min(len) as usize;
                let end: usize = range.end.min(len) as usize;
                stored.data.slice(start..end.max(start))
            }
        };

        Ok(data)
    }

    async fn delete_object(&self, name: &str) -> Result<(), RemoteError> {
        let mut objects = self.objects.lock();
        objects
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| Self::not_found(name))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectRecord>, RemoteError> {
        let objects = self.objects.lock();
        Ok(objects
            .values()
            .filter(|o| o.record.name.starts_with(prefix))
            .map(|o| o.record.clone())
            .collect())
    }
}
