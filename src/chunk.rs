//! Chunks and the expected-consumer set.
//!
//! Every live chunk shares one [`ExpectedConsumers`] handle with its
//! session. The expected count is deliberately not stored on the chunk:
//! when a receiver leaves, every chunk's remaining-count must shrink at
//! once, without touching the chunks themselves.

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};

/// The set of receiver ids each live chunk must be acknowledged by
/// before it can be evicted.
///
/// Membership only — admission rules (the consumer cap, the
/// no-new-receivers-after-eviction rule) live on the buffer.
pub struct ExpectedConsumers {
    set: RwLock<HashSet<String>>,
}

impl ExpectedConsumers {
    pub fn new() -> Self {
        Self {
            set: RwLock::new(HashSet::new()),
        }
    }

    /// Returns false if the id was already present.
    pub fn add(&self, id: &str) -> bool {
        self.set.write().insert(id.to_string())
    }

    /// Returns true if the id was present.
    pub fn remove(&self, id: &str) -> bool {
        self.set.write().remove(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.set.read().contains(id)
    }

    pub fn len(&self) -> usize {
        self.set.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.read().is_empty()
    }
}

impl Default for ExpectedConsumers {
    fn default() -> Self {
        Self::new()
    }
}

/// One unit of payload plus its acknowledgement counter.
pub struct Chunk {
    payload: Bytes,
    expected: Arc<ExpectedConsumers>,
    /// Guarded so that an increment and the expected-size observation it
    /// is capped by happen as one step.
    acks: Mutex<usize>,
}

impl Chunk {
    pub fn new(payload: Bytes, expected: Arc<ExpectedConsumers>) -> Self {
        Self {
            payload,
            expected,
            acks: Mutex::new(0),
        }
    }

    /// Cheap shared handle to the immutable payload bytes.
    pub fn data(&self) -> Bytes {
        self.payload.clone()
    }

    pub fn size(&self) -> usize {
        self.payload.len()
    }

    pub fn acks(&self) -> usize {
        *self.acks.lock()
    }

    /// Record one acknowledgement. Silently capped: an ack beyond the
    /// current expected-consumer count is dropped.
    pub fn increment_acks(&self) {
        let mut acks = self.acks.lock();
        if *acks < self.expected.len() {
            *acks += 1;
        }
    }

    /// How many acknowledgements are still needed before eviction.
    ///
    /// The consumer set may have shrunk below the recorded ack count; the
    /// result saturates at zero.
    pub fn remaining(&self) -> usize {
        let acks = self.acks.lock();
        self.expected.len().saturating_sub(*acks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn consumers(ids: &[&str]) -> Arc<ExpectedConsumers> {
        let set = ExpectedConsumers::new();
        for id in ids {
            set.add(id);
        }
        Arc::new(set)
    }

    #[test]
    fn test_expected_consumers_add_remove() {
        let set = ExpectedConsumers::new();
        assert!(set.add("r1"));
        assert!(!set.add("r1"));
        assert_eq!(set.len(), 1);
        assert!(set.contains("r1"));
        assert!(set.remove("r1"));
        assert!(!set.remove("r1"));
        assert!(set.is_empty());
    }

    #[test]
    fn test_acks_capped_by_expected() {
        let chunk = Chunk::new(Bytes::from_static(b"abc"), consumers(&["r1", "r2"]));

        assert_eq!(chunk.remaining(), 2);
        chunk.increment_acks();
        chunk.increment_acks();
        chunk.increment_acks(); // beyond expected — dropped
        assert_eq!(chunk.acks(), 2);
        assert_eq!(chunk.remaining(), 0);
    }

    #[test]
    fn test_remaining_shrinks_with_consumer_set() {
        let expected = consumers(&["r1", "r2"]);
        let chunk = Chunk::new(Bytes::from_static(b"abc"), Arc::clone(&expected));

        chunk.increment_acks();
        assert_eq!(chunk.remaining(), 1);

        // The straggler leaves; the chunk is now fully acknowledged.
        expected.remove("r2");
        assert_eq!(chunk.remaining(), 0);
    }

    #[test]
    fn test_remaining_saturates_when_set_shrinks_below_acks() {
        let expected = consumers(&["r1", "r2"]);
        let chunk = Chunk::new(Bytes::from_static(b"abc"), Arc::clone(&expected));

        chunk.increment_acks();
        chunk.increment_acks();
        expected.remove("r1");
        expected.remove("r2");
        assert_eq!(chunk.remaining(), 0);
    }

    #[test]
    fn test_zero_expected_means_nothing_remaining() {
        let chunk = Chunk::new(Bytes::from_static(b"abc"), Arc::new(ExpectedConsumers::new()));
        assert_eq!(chunk.remaining(), 0);
        chunk.increment_acks(); // capped at zero expected
        assert_eq!(chunk.acks(), 0);
    }

    #[test]
    fn test_data_is_shared_not_copied() {
        let payload = Bytes::from(vec![7u8; 128]);
        let chunk = Chunk::new(payload.clone(), consumers(&["r1"]));

        let handle = chunk.data();
        assert_eq!(handle, payload);
        assert_eq!(chunk.size(), 128);
    }
}
