//! The per-session chunk buffer.
//!
//! An ordered map of index → chunk with admission, reference-counted
//! eviction, EOF and the initial-freeze rule. Indices are assigned
//! monotonically starting at 1 and never reused, so gaps appear as
//! chunks are evicted.
//!
//! The freeze exists so that receivers joining shortly after the sender
//! starts pushing still see the stream from the start: while it is
//! active no chunk is evicted, even one nobody is waiting for. It is
//! lifted by the first real acknowledgement or by the session's freeze
//! timer, and can never be reinstated — once data has been dropped, a
//! late joiner would see a hole, which is why joining is refused from
//! the first eviction on.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;

use crate::chunk::{Chunk, ExpectedConsumers};
use crate::config::RelayConfig;
use crate::protocol::ChunkInfo;

/// What a successful acknowledgement did to the buffer.
pub struct AckOutcome {
    /// Payload size of the acknowledged chunk.
    pub chunk_size: usize,
    /// Indices evicted by the sweep this call triggered, in order.
    pub removed: Vec<u64>,
    /// True when this ack was the one that lifted the initial freeze.
    pub freeze_lifted: bool,
}

struct BufferState {
    chunks: BTreeMap<u64, Arc<Chunk>>,
    max_index: u64,
    eof: bool,
    some_chunk_removed: bool,
    initial_freeze: bool,
}

/// Ordered, indexed chunk storage for one transfer session.
pub struct Buffer {
    max_chunk_size: usize,
    queue_max: usize,
    max_consumers: usize,
    expected: Arc<ExpectedConsumers>,
    state: RwLock<BufferState>,
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl Buffer {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            max_chunk_size: config.max_chunk_size,
            queue_max: config.queue_max,
            max_consumers: config.max_consumers,
            expected: Arc::new(ExpectedConsumers::new()),
            state: RwLock::new(BufferState {
                chunks: BTreeMap::new(),
                max_index: 0,
                eof: false,
                some_chunk_removed: false,
                initial_freeze: true,
            }),
            bytes_in: AtomicU64::new(0),
            bytes_out: AtomicU64::new(0),
        }
    }

    /// Store a new chunk and return its index, or `None` when the
    /// payload is empty or oversized, the queue is full, or EOF has
    /// already been declared.
    pub fn add_chunk(&self, payload: Bytes) -> Option<u64> {
        if payload.is_empty() || payload.len() > self.max_chunk_size {
            return None;
        }

        let index = {
            let mut state = self.state.write();

            if state.eof {
                tracing::warn!("add_chunk after EOF rejected");
                return None;
            }
            if state.chunks.len() >= self.queue_max {
                return None;
            }

            let size = payload.len();
            state.max_index += 1;
            let index = state.max_index;
            state
                .chunks
                .insert(index, Arc::new(Chunk::new(payload, Arc::clone(&self.expected))));
            self.bytes_in.fetch_add(size as u64, Ordering::Relaxed);
            index
        };

        Some(index)
    }

    /// Shared handle to a chunk's payload. Every hit counts toward
    /// `bytes_out`, including re-reads.
    pub fn get(&self, index: u64) -> Option<Bytes> {
        let state = self.state.read();
        let data = state.chunks.get(&index)?.data();
        self.bytes_out.fetch_add(data.len() as u64, Ordering::Relaxed);
        Some(data)
    }

    /// Record one acknowledgement for `index` and sweep. Returns `None`
    /// when the index is unknown (already evicted or never existed).
    ///
    /// The first successful ack lifts the initial freeze: a real
    /// receiver demonstrably has the data, so eviction can start.
    pub fn ack(&self, index: u64) -> Option<AckOutcome> {
        let mut state = self.state.write();

        let chunk = state.chunks.get(&index)?;
        let chunk_size = chunk.size();
        chunk.increment_acks();

        let freeze_lifted = state.initial_freeze;
        state.initial_freeze = false;

        let removed = Self::sweep(&mut state);

        Some(AckOutcome {
            chunk_size,
            removed,
            freeze_lifted,
        })
    }

    /// Declare the upload finished. Returns false (with a warning) when
    /// EOF was already set.
    pub fn set_eof(&self) -> bool {
        let mut state = self.state.write();
        if state.eof {
            tracing::warn!("set_eof called twice");
            return false;
        }
        state.eof = true;
        true
    }

    /// Admit a new expected consumer. Refused once any chunk has been
    /// evicted, at the consumer cap, or for a duplicate id.
    pub fn add_expected_consumer(&self, id: &str) -> bool {
        let state = self.state.write();

        if state.some_chunk_removed || self.expected.len() + 1 > self.max_consumers {
            return false;
        }

        self.expected.add(id)
    }

    /// Drop `id` from the expected set and sweep. Returns whether the id
    /// was present and the indices the sweep evicted.
    pub fn remove_expected_consumer(&self, id: &str) -> (bool, Vec<u64>) {
        let mut state = self.state.write();

        if !self.expected.remove(id) {
            return (false, Vec::new());
        }

        (true, Self::sweep(&mut state))
    }

    /// Lift the initial freeze and sweep. Returns `None` when the freeze
    /// was already lifted.
    pub fn drop_initial_freeze(&self) -> Option<Vec<u64>> {
        let mut state = self.state.write();

        if !state.initial_freeze {
            return None;
        }
        state.initial_freeze = false;

        Some(Self::sweep(&mut state))
    }

    // ── Queries ───────────────────────────────────────────────────────────

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }

    pub fn chunk_count(&self) -> usize {
        self.state.read().chunks.len()
    }

    /// The largest index ever assigned. Does not decrease on eviction.
    pub fn current_max_index(&self) -> u64 {
        self.state.read().max_index
    }

    /// Back-pressure signal: true while the queue has room for another
    /// chunk.
    pub fn new_chunk_allowed(&self) -> bool {
        self.state.read().chunks.len() < self.queue_max
    }

    pub fn eof(&self) -> bool {
        self.state.read().eof
    }

    pub fn initial_freeze(&self) -> bool {
        self.state.read().initial_freeze
    }

    pub fn some_chunk_removed(&self) -> bool {
        self.state.read().some_chunk_removed
    }

    pub fn expected_consumer_count(&self) -> usize {
        self.expected.len()
    }

    /// Index and size of every chunk currently buffered, in index order.
    pub fn chunks_info(&self) -> Vec<ChunkInfo> {
        self.state
            .read()
            .chunks
            .iter()
            .map(|(index, chunk)| ChunkInfo {
                index: *index,
                size: chunk.size() as u64,
            })
            .collect()
    }

    /// Evict every fully-acknowledged chunk. Must be called with the
    /// state write lock held; skipped entirely while the freeze is
    /// active.
    fn sweep(state: &mut BufferState) -> Vec<u64> {
        if state.initial_freeze {
            return Vec::new();
        }

        let mut removed = Vec::new();
        state.chunks.retain(|index, chunk| {
            if chunk.remaining() == 0 {
                removed.push(*index);
                false
            } else {
                true
            }
        });

        if !removed.is_empty() {
            state.some_chunk_removed = true;
        }

        removed
    }
}
