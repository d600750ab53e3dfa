use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::cache::ChunkCache;
use crate::tree::chunk::Chunk;
use crate::tree::key::{Dxyz, Xyz};

/// Pruner is a thread's fast path into the cache: one map per touched depth
/// from position to the resident chunk the thread has pinned. Every entry
/// corresponds to exactly one ref the thread holds on the chunk's slot, so
/// lookups here skip the slice locks entirely.
///
/// A pruner lives for one work batch. Dropping it hands all refs back to the
/// cache, one [`ChunkCache::prune`] call per depth.
pub struct Pruner {
    cache: Arc<ChunkCache>,
    touched: Vec<FxHashMap<Xyz, Arc<Chunk>>>,
}

impl Pruner {
    pub fn new(cache: Arc<ChunkCache>) -> Pruner {
        Pruner { cache, touched: Vec::new() }
    }

    pub fn get(&self, dxyz: Dxyz) -> Option<Arc<Chunk>> {
        self.touched.get(dxyz.depth).and_then(|slice| slice.get(&dxyz.pos)).map(Arc::clone)
    }

    pub(super) fn set(&mut self, dxyz: Dxyz, chunk: Arc<Chunk>) {
        if self.touched.len() <= dxyz.depth {
            self.touched.resize_with(dxyz.depth + 1, FxHashMap::default);
        }
        let previous = self.touched[dxyz.depth].insert(dxyz.pos, chunk);
        debug_assert!(previous.is_none(), "chunk pinned twice by one pruner");
    }
}

impl Drop for Pruner {
    fn drop(&mut self) {
        for (depth, stale) in self.touched.iter().enumerate() {
            if !stale.is_empty() {
                self.cache.prune(depth, stale);
            }
        }
    }
}
