//! The wire-agnostic key/value unit the streamer routes and batches.

use bytes::Bytes;

/// One upsert or deletion. A `None` value denotes deletion.
///
/// Keys and values are opaque byte strings at this layer; interpretation is
/// delegated to the server and to the receiver the cluster was configured
/// with.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: Bytes,
    pub value: Option<Bytes>,
}

impl Entry {
    /// Build an upsert entry.
    pub fn upsert(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    /// Build a deletion entry (tombstone).
    pub fn delete(key: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: None,
        }
    }

    pub fn is_delete(&self) -> bool {
        self.value.is_none()
    }
}
