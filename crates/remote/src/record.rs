//! Object records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Immutable descriptor for one generation of a remote object.
///
/// Records are minted by the store; the core only consumes them. A record
/// describes the object as it existed at the moment of the operation that
/// produced it. A later write to the same name yields a new record with a
/// larger generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Object name within the bucket.
    pub name: String,

    /// Store-assigned version number, monotone per name.
    pub generation: i64,

    /// Content length in bytes.
    pub size: u64,

    /// Opaque user metadata.
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ObjectRecord {
    /// Create a record with no metadata.
    pub fn new(name: impl Into<String>, generation: i64, size: u64) -> Self {
        Self {
            name: name.into(),
            generation,
            size,
            metadata: BTreeMap::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trips_through_json() {
        let mut record = ObjectRecord::new("dir/leaf", 17, 4096);
        record
            .metadata
            .insert("content-type".to_string(), "text/plain".to_string());

        let encoded: String = serde_json::to_string(&record).unwrap();
        let decoded: ObjectRecord = serde_json::from_str(&encoded).unwrap();

        assert_eq!(decoded, record);
    }

    #[test]
    fn test_record_metadata_defaults_to_empty() {
        let decoded: ObjectRecord =
            serde_json::from_str(r#"{"name":"foo","generation":1,"size":4}"#).unwrap();

        assert_eq!(decoded.name, "foo");
        assert!(decoded.metadata.is_empty());
    }
}
