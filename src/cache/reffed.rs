use std::sync::Arc;

use crate::cache::spin::{Spin, SpinGuard};
use crate::tree::chunk::Chunk;
use crate::tree::key::ChunkKey;

/// ReffedChunk is the cache's unit of residency: a refcount and an optional
/// resident chunk behind one spinlock. The count tracks pruner pointers plus
/// the owned set's hold; the resident is absent between a finished save and
/// the slot's erasure, and before a reanimation fills it.
pub struct ReffedChunk {
    state: Spin<ReffedState>,
}

impl ReffedChunk {
    pub fn new() -> ReffedChunk {
        ReffedChunk {
            state: Spin::new(ReffedState { ref_count: 0, resident: None }),
        }
    }

    pub fn lock(&self) -> SpinGuard<ReffedState> {
        self.state.lock()
    }
}

pub struct ReffedState {
    ref_count: u64,
    resident: Option<Arc<Chunk>>,
}

impl ReffedState {
    pub fn add(&mut self) {
        self.ref_count += 1;
    }

    /// Drops one ref; true while holders remain.
    pub fn del(&mut self) -> bool {
        assert!(self.ref_count > 0, "ref count underflow");
        self.ref_count -= 1;
        self.ref_count > 0
    }

    pub fn count(&self) -> u64 {
        self.ref_count
    }

    pub fn exists(&self) -> bool {
        self.resident.is_some()
    }

    /// Materializes an empty resident, about to be first used or filled by a
    /// reanimation.
    pub fn assign(&mut self, key: ChunkKey, span: usize) -> Arc<Chunk> {
        assert!(self.resident.is_none(), "resident already assigned");
        let chunk = Arc::new(Chunk::new(key, span));
        self.resident = Some(Arc::clone(&chunk));
        chunk
    }

    /// Drops the resident after a finished save.
    pub fn reset(&mut self) {
        assert_eq!(self.ref_count, 0, "resetting a held chunk");
        assert!(self.resident.is_some(), "resetting an empty slot");
        self.resident = None;
    }

    pub fn chunk(&self) -> &Arc<Chunk> {
        self.resident.as_ref().expect("slot has no resident chunk")
    }
}
