pub mod info;
pub mod pruner;
pub mod reffed;
pub mod spin;

use std::collections::BTreeSet;
use std::io;
use std::sync::{Arc, Weak};

use log::{debug, error};
use rustc_hash::FxHashMap;

use crate::cache::info::Info;
use crate::cache::pruner::Pruner;
use crate::cache::reffed::ReffedChunk;
use crate::cache::spin::Spin;
use crate::io::endpoint::Endpoint;
use crate::io::hierarchy::Hierarchy;
use crate::systems::jobs::IoPool;
use crate::tree::chunk::Chunk;
use crate::tree::key::{ChunkKey, Dxyz, Key, Xyz};
use crate::tree::voxel::Voxel;

/// Deepest level the tree can reach; one slice is preallocated per level.
const MAX_DEPTH: usize = 64;

/// ChunkCache keeps the hot set of octree chunks resident while ingestion
/// threads hammer them, brings previously saved chunks back on demand, and
/// writes cold ones behind the scenes on the I/O pool.
///
/// Locking is layered. Each depth slice guards its position map, each slot
/// guards its refcount and resident, and the owned set and the info counters
/// have locks of their own. The owned and slice locks are only ever taken
/// with no finer lock held, a chunk lock only under its slice lock, under
/// the owned lock, or alone, and the info lock is always innermost. The two
/// blocking operations, load and save, run under only the chunk lock, so one
/// chunk's I/O stalls its own touchers but never its siblings.
pub struct ChunkCache {
    // handle to ourselves for the job closures dispatched onto the pool
    me: Weak<ChunkCache>,

    slices: Vec<Spin<FxHashMap<Xyz, Arc<ReffedChunk>>>>,
    owned: Spin<BTreeSet<Dxyz>>,
    info: Spin<Info>,
    failure: Spin<Option<io::Error>>,

    hierarchy: Arc<Hierarchy>,
    io_pool: Arc<IoPool>,
    out: Arc<Endpoint>,
    tmp: Arc<Endpoint>,

    cache_size: usize,
    span: usize,
}

impl ChunkCache {
    pub fn new(
        hierarchy: Arc<Hierarchy>,
        io_pool: Arc<IoPool>,
        out: Arc<Endpoint>,
        tmp: Arc<Endpoint>,
        cache_size: usize,
        span: usize,
    ) -> Arc<ChunkCache> {
        let mut slices = Vec::with_capacity(MAX_DEPTH);
        slices.resize_with(MAX_DEPTH, || Spin::new(FxHashMap::default()));

        Arc::new_cyclic(|me| ChunkCache {
            me: me.clone(),
            slices,
            owned: Spin::new(BTreeSet::new()),
            info: Spin::new(Info::default()),
            failure: Spin::new(None),
            hierarchy,
            io_pool,
            out,
            tmp,
            cache_size,
            span,
        })
    }

    /// The owned-set bound handed to [`ChunkCache::maybe_purge`] by drivers.
    pub fn cache_size(&self) -> usize {
        self.cache_size
    }

    /// Inserts the voxel into the subtree rooted at `chunk_key`, descending
    /// one level at a time until a chunk takes it. Concurrent callers need
    /// independent pruners; everything else is shared.
    pub fn insert(
        &self,
        voxel: Voxel,
        key: &mut Key,
        mut chunk_key: ChunkKey,
        pruner: &mut Pruner,
    ) -> io::Result<()> {
        loop {
            let chunk = match pruner.get(chunk_key.dxyz()) {
                Some(chunk) => chunk,
                None => self.add_ref(chunk_key, pruner)?,
            };
            if chunk.insert(&voxel, key) {
                return Ok(());
            }

            // full at this depth; hand the voxel to the child under its point
            let dir = chunk_key.bounds().direction(voxel.position);
            let stepped = key.step(voxel.position);
            debug_assert_eq!(stepped, dir);
            chunk_key = chunk_key.child(dir);
            assert!(chunk_key.dxyz().depth < MAX_DEPTH, "tree deeper than {} levels", MAX_DEPTH);
        }
    }

    /// First touch of a chunk by this thread: pins the slot (creating it if
    /// needed), registers the resident with the pruner and returns it. A
    /// slot whose resident was already written out is reanimated from the
    /// store before this returns.
    fn add_ref(&self, chunk_key: ChunkKey, pruner: &mut Pruner) -> io::Result<Arc<Chunk>> {
        let dxyz = chunk_key.dxyz();
        let mut slice = self.slices[dxyz.depth].lock();

        if let Some(reffed) = slice.get(&dxyz.pos) {
            let reffed = Arc::clone(reffed);
            let mut state = reffed.lock();
            state.add();
            drop(slice);

            let chunk = if state.exists() {
                let chunk = Arc::clone(state.chunk());
                pruner.set(dxyz, Arc::clone(&chunk));
                chunk
            } else {
                // written out but not yet erased; reanimate. The pruner entry
                // must exist before the blocking load, so a racing toucher
                // observing our ref always finds a matching pointer.
                let chunk = state.assign(chunk_key, self.span);
                self.info.lock().read += 1;
                pruner.set(dxyz, Arc::clone(&chunk));
                let np = self.hierarchy.get(dxyz);
                assert!(np > 0, "reanimating {} without remote content", dxyz);
                debug!("reanimating {} ({} points)", dxyz, np);
                chunk.load(&self.out, np)?;
                chunk
            };
            drop(state);

            // if the owned set held this slot, take it back; our own ref
            // added above keeps the count from reaching zero here
            let mut owned = self.owned.lock();
            if owned.contains(&dxyz) {
                let mut state = reffed.lock();
                assert!(state.count() > 1, "reclaimed {} without the owned ref", dxyz);
                state.del();
                owned.remove(&dxyz);
            }
            drop(owned);

            Ok(chunk)
        } else {
            let reffed = Arc::new(ReffedChunk::new());
            slice.insert(dxyz.pos, Arc::clone(&reffed));
            self.info.lock().alive += 1;

            let mut state = reffed.lock();
            state.add();
            let chunk = state.assign(chunk_key, self.span);
            pruner.set(dxyz, Arc::clone(&chunk));
            drop(slice);

            // a nonzero persisted count means the chunk predates this
            // process: a resumed build
            let np = self.hierarchy.get(dxyz);
            if np > 0 {
                self.info.lock().read += 1;
                debug!("reanimating {} ({} points)", dxyz, np);
                chunk.load(&self.out, np)?;
            }
            drop(state);

            Ok(chunk)
        }
    }

    /// Called by a pruner handing back its refs for one depth. A chunk whose
    /// last ref goes away is not destroyed; the owned set takes over its
    /// ref, so a prompt re-touch costs no I/O.
    pub(crate) fn prune(&self, depth: usize, stale: &FxHashMap<Xyz, Arc<Chunk>>) {
        let mut slice = self.slices[depth].lock();
        for pos in stale.keys() {
            let reffed = Arc::clone(slice.get(pos).expect("pruned chunk missing from its slice"));
            let mut state = reffed.lock();
            if state.del() {
                continue;
            }

            // last ref: the owned set takes the slot over
            state.add();
            drop(state);
            drop(slice);
            self.owned.lock().insert(Dxyz::new(depth, *pos));
            slice = self.slices[depth].lock();
        }
    }

    /// Shrinks the owned set to at most `cap` entries by scheduling the
    /// evicted chunks for serialization. The deepest chunks go first: they
    /// are the smallest and coldest, so they are the cheapest to bring back.
    ///
    /// Advisory only; concurrent prunes may push the set above `cap` again
    /// until the next call.
    pub fn maybe_purge(&self, cap: usize) {
        let mut owned = self.owned.lock();
        while owned.len() > cap {
            let dxyz = owned.pop_last().expect("owned set emptied under its lock");
            {
                let slice = self.slices[dxyz.depth].lock();
                let reffed = slice.get(&dxyz.pos).expect("owned chunk missing from its slice");
                let mut state = reffed.lock();
                if state.del() {
                    // re-reffed between pop and lock; the slot is theirs now
                    continue;
                }
            }
            drop(owned);

            // serialization blocks on I/O, so it must not run under any lock
            let cache = self.me.upgrade().expect("cache gone mid-purge");
            self.io_pool.push(Box::new(move || {
                if let Err(err) = cache.maybe_serialize(dxyz) {
                    error!("serializing {} failed: {}", dxyz, err);
                    cache.record_failure(err);
                }
            }));

            owned = self.owned.lock();
        }
    }

    /// Pool-side write of one evicted chunk. Everything is re-checked under
    /// the locks, because the world may have moved on between dispatch and
    /// now: the slot can be gone, reclaimed, or already written by an
    /// earlier duplicate of this job.
    fn maybe_serialize(&self, dxyz: Dxyz) -> io::Result<()> {
        let slice = self.slices[dxyz.depth].lock();
        let Some(reffed) = slice.get(&dxyz.pos) else {
            return Ok(());
        };
        let reffed = Arc::clone(reffed);
        let mut state = reffed.lock();
        if state.count() > 0 {
            return Ok(());
        }
        if !state.exists() {
            return Ok(());
        }
        // the slice must stay usable while we write; our chunk lock alone
        // makes any toucher of this slot wait for the finished save
        drop(slice);

        self.info.lock().written += 1;
        let chunk = Arc::clone(state.chunk());
        let np = chunk.save(&self.out, &self.tmp)?;
        assert!(np > 0, "saved {} with no points", dxyz);
        self.hierarchy.set(dxyz, np);
        debug!("serialized {} ({} points)", dxyz, np);
        state.reset();
        drop(state);

        self.maybe_erase(dxyz);
        Ok(())
    }

    /// Removes a fully written slot from its slice. The local handle keeps
    /// the slot alive until both guards are gone, so dropping the map entry
    /// under its own lock is sound.
    fn maybe_erase(&self, dxyz: Dxyz) {
        let mut slice = self.slices[dxyz.depth].lock();
        let Some(reffed) = slice.get(&dxyz.pos) else {
            return;
        };
        let reffed = Arc::clone(reffed);
        let state = reffed.lock();
        if state.count() > 0 || state.exists() {
            // re-touched between reset and now; leave the slot in place
            return;
        }
        slice.remove(&dxyz.pos);

        let mut info = self.info.lock();
        assert!(info.alive > 0, "alive counter underflow");
        info.alive -= 1;
    }

    /// Snapshots the counters and zeroes the two rates; `alive` is a level
    /// and stays.
    pub fn latch_info(&self) -> Info {
        let mut info = self.info.lock();
        let snapshot = *info;
        info.read = 0;
        info.written = 0;
        snapshot
    }

    fn record_failure(&self, err: io::Error) {
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(err);
        }
    }

    /// Flushes everything: evicts the whole owned set, waits for the pool to
    /// drain, and checks that the cache is really empty. Call once, after
    /// the last pruner is gone.
    pub fn shutdown(&self) -> io::Result<()> {
        self.maybe_purge(0);
        self.io_pool.wait_until_processed();

        if let Some(err) = self.failure.lock().take() {
            return Err(err);
        }
        for slice in &self.slices {
            assert!(slice.lock().is_empty(), "chunks left resident after shutdown");
        }
        assert_eq!(self.info.lock().alive, 0, "alive counter nonzero after shutdown");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;

    use cgmath::Point3;
    use tempfile::TempDir;

    use crate::cache::info::Info;
    use crate::cache::pruner::Pruner;
    use crate::cache::ChunkCache;
    use crate::io::endpoint::Endpoint;
    use crate::io::hierarchy::Hierarchy;
    use crate::systems::jobs::IoPool;
    use crate::tree::bounds::Bounds;
    use crate::tree::key::{ChunkKey, Dxyz, Key, Xyz};
    use crate::tree::voxel::Voxel;

    /// Shared blob directories so that several caches can build on top of
    /// each other, the way a resumed build does.
    struct Store {
        out_dir: TempDir,
        tmp_dir: TempDir,
    }

    impl Store {
        fn new() -> Store {
            Store {
                out_dir: TempDir::new().unwrap(),
                tmp_dir: TempDir::new().unwrap(),
            }
        }

        fn cache(&self, hierarchy: &Arc<Hierarchy>, cache_size: usize, span: usize) -> Arc<ChunkCache> {
            let out = Arc::new(Endpoint::new(self.out_dir.path()).unwrap());
            let tmp = Arc::new(Endpoint::new(self.tmp_dir.path()).unwrap());
            let io_pool = Arc::new(IoPool::new(2));
            ChunkCache::new(Arc::clone(hierarchy), io_pool, out, tmp, cache_size, span)
        }

        fn blob_count(&self) -> usize {
            fs::read_dir(self.out_dir.path()).unwrap().count()
        }
    }

    fn bounds16() -> Bounds {
        Bounds::new(Point3::new(0.0, 0.0, 0.0), Point3::new(16.0, 16.0, 16.0))
    }

    fn root_key() -> ChunkKey {
        ChunkKey::root(bounds16())
    }

    /// Deterministic pseudo-random voxels inside the 16-cube.
    fn lcg_voxels(n: usize, seed: u64) -> Vec<Voxel> {
        let mut state = seed;
        let mut unit = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            (state >> 11) as f64 / (1u64 << 53) as f64
        };
        (0..n)
            .map(|i| Voxel::new(unit() * 16.0, unit() * 16.0, unit() * 16.0, (i % 7) as u16))
            .collect()
    }

    /// Inserts every voxel under a single pruner, then releases the refs.
    fn insert_all(cache: &Arc<ChunkCache>, voxels: &[Voxel]) {
        let mut pruner = Pruner::new(Arc::clone(cache));
        for voxel in voxels {
            let mut key = Key::new(bounds16());
            cache.insert(*voxel, &mut key, root_key(), &mut pruner).unwrap();
        }
    }

    /// Every chunk a single-threaded build touches is saved exactly once at
    /// shutdown, and the cache drains completely.
    #[test]
    fn saves_every_chunk_once_at_shutdown() {
        let store = Store::new();
        let hierarchy = Arc::new(Hierarchy::new());
        let cache = store.cache(&hierarchy, 2, 64);

        insert_all(&cache, &lcg_voxels(1000, 1));
        cache.maybe_purge(2);
        cache.shutdown().unwrap();

        let latched = cache.latch_info();
        assert_eq!(latched.alive, 0);
        assert_eq!(latched.written as usize, hierarchy.len());
        assert_eq!(hierarchy.total(), 1000);
        assert_eq!(store.blob_count(), hierarchy.len());
    }

    /// A second build over the same stores reanimates the saved root chunk
    /// and ends with every point accounted for.
    #[test]
    fn reanimates_previously_saved_chunks() {
        let store = Store::new();
        let hierarchy = Arc::new(Hierarchy::new());

        let first = store.cache(&hierarchy, 2, 4);
        insert_all(&first, &[
            Voxel::new(1.0, 1.0, 1.0, 0),
            Voxel::new(2.0, 2.0, 2.0, 0),
            Voxel::new(3.0, 3.0, 3.0, 0),
            Voxel::new(5.0, 5.0, 5.0, 0),
        ]);
        first.shutdown().unwrap();
        assert_eq!(hierarchy.get(Dxyz::ROOT), 4);

        let second = store.cache(&hierarchy, 2, 4);
        insert_all(&second, &[Voxel::new(1.5, 1.5, 1.5, 0)]);

        // the root was full, so the new point went one level down; touching
        // the root cost exactly one read
        let latched = second.latch_info();
        assert_eq!(latched.read, 1);

        second.shutdown().unwrap();
        assert_eq!(hierarchy.get(Dxyz::ROOT), 4);
        assert_eq!(hierarchy.len(), 2);
        assert_eq!(hierarchy.total(), 5);
    }

    /// One thread inserts while another purges continuously with a zero
    /// cap. No deadlock, and no point is lost.
    #[test]
    fn insert_races_with_continuous_purge() {
        let store = Store::new();
        let hierarchy = Arc::new(Hierarchy::new());
        let cache = store.cache(&hierarchy, 0, 16);
        let voxels = lcg_voxels(2000, 7);

        let done = AtomicBool::new(false);
        thread::scope(|scope| {
            let inserter = {
                let cache = Arc::clone(&cache);
                let voxels = &voxels;
                let done = &done;
                scope.spawn(move || {
                    for batch in voxels.chunks(50) {
                        let mut pruner = Pruner::new(Arc::clone(&cache));
                        for voxel in batch {
                            let mut key = Key::new(bounds16());
                            cache.insert(*voxel, &mut key, root_key(), &mut pruner).unwrap();
                        }
                    }
                    done.store(true, Ordering::Relaxed);
                })
            };
            let purger = {
                let cache = Arc::clone(&cache);
                let done = &done;
                scope.spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        cache.maybe_purge(0);
                    }
                })
            };
            inserter.join().unwrap();
            purger.join().unwrap();
        });

        cache.shutdown().unwrap();
        assert_eq!(hierarchy.total(), 2000);
    }

    /// A serialization job queued twice for the same chunk writes once; the
    /// duplicate finds the slot gone and does nothing.
    #[test]
    fn duplicate_serialize_is_a_noop() {
        let store = Store::new();
        let hierarchy = Arc::new(Hierarchy::new());
        let cache = store.cache(&hierarchy, 2, 8);

        insert_all(&cache, &lcg_voxels(1, 3));
        cache.maybe_purge(0);
        cache.io_pool.wait_until_processed();

        let latched = cache.latch_info();
        assert_eq!(latched.written, 1);
        assert_eq!(latched.alive, 0);

        cache.maybe_serialize(Dxyz::ROOT).unwrap();
        assert_eq!(cache.latch_info().written, 0);

        cache.shutdown().unwrap();
        assert_eq!(hierarchy.get(Dxyz::ROOT), 1);
    }

    /// N threads racing on the first touch of one saved chunk: one slot, one
    /// load, N refs.
    #[test]
    fn concurrent_first_touch_loads_once() {
        let store = Store::new();
        let hierarchy = Arc::new(Hierarchy::new());

        let seeder = store.cache(&hierarchy, 2, 8);
        insert_all(&seeder, &lcg_voxels(3, 11));
        seeder.shutdown().unwrap();
        assert_eq!(hierarchy.get(Dxyz::ROOT), 3);

        let cache = store.cache(&hierarchy, 2, 8);
        let n = 8;
        let (tx, rx) = mpsc::channel();
        thread::scope(|scope| {
            for _ in 0..n {
                let cache = Arc::clone(&cache);
                let tx = tx.clone();
                scope.spawn(move || {
                    let mut pruner = Pruner::new(Arc::clone(&cache));
                    let chunk = cache.add_ref(root_key(), &mut pruner).unwrap();
                    tx.send((pruner, chunk)).unwrap();
                });
            }
            drop(tx);
            let pinned: Vec<_> = rx.iter().collect();
            assert_eq!(pinned.len(), n);

            let latched = cache.latch_info();
            assert_eq!(latched.alive, 1);
            assert_eq!(latched.read, 1);

            let first = &pinned[0].1;
            for (_, chunk) in &pinned {
                assert!(Arc::ptr_eq(first, chunk));
                assert_eq!(chunk.np(), 3);
            }

            {
                let slice = cache.slices[0].lock();
                let reffed = Arc::clone(slice.get(&Xyz::ORIGIN).unwrap());
                drop(slice);
                assert_eq!(reffed.lock().count(), n as u64);
            }
        });

        cache.shutdown().unwrap();
    }

    /// Two inserters against a repeated bounded purge: the owned set obeys
    /// the cap whenever purge has the last word.
    #[test]
    fn purge_bounds_owned_set_under_contention() {
        let store = Store::new();
        let hierarchy = Arc::new(Hierarchy::new());
        let cache = store.cache(&hierarchy, 3, 16);
        let voxels = lcg_voxels(2000, 13);
        let (left, right) = voxels.split_at(1000);

        let done = AtomicBool::new(false);
        thread::scope(|scope| {
            let mut inserters = Vec::new();
            for part in [left, right] {
                let cache = Arc::clone(&cache);
                inserters.push(scope.spawn(move || {
                    for batch in part.chunks(64) {
                        let mut pruner = Pruner::new(Arc::clone(&cache));
                        for voxel in batch {
                            let mut key = Key::new(bounds16());
                            cache.insert(*voxel, &mut key, root_key(), &mut pruner).unwrap();
                        }
                        drop(pruner);
                        cache.maybe_purge(cache.cache_size());
                    }
                }));
            }
            let purger = {
                let cache = Arc::clone(&cache);
                let done = &done;
                scope.spawn(move || {
                    while !done.load(Ordering::Relaxed) {
                        cache.maybe_purge(3);
                    }
                })
            };
            for inserter in inserters {
                inserter.join().unwrap();
            }
            done.store(true, Ordering::Relaxed);
            purger.join().unwrap();
        });

        cache.maybe_purge(3);
        assert!(cache.owned.lock().len() <= 3);

        cache.shutdown().unwrap();
        assert_eq!(hierarchy.total(), 2000);
    }

    /// The owned set evicts its maximum first, which is always the deepest
    /// resident chunk.
    #[test]
    fn purge_evicts_deepest_first() {
        let store = Store::new();
        let hierarchy = Arc::new(Hierarchy::new());
        let cache = store.cache(&hierarchy, 2, 1);

        // span 1 forces a chain: one chunk per depth 0, 1 and 2
        insert_all(&cache, &[
            Voxel::new(1.0, 1.0, 1.0, 0),
            Voxel::new(1.1, 1.1, 1.1, 0),
            Voxel::new(1.2, 1.2, 1.2, 0),
        ]);
        assert_eq!(cache.owned.lock().len(), 3);

        cache.maybe_purge(2);
        {
            let owned = cache.owned.lock();
            assert_eq!(owned.len(), 2);
            assert!(owned.iter().all(|dxyz| dxyz.depth < 2));
        }

        cache.io_pool.wait_until_processed();
        assert_eq!(hierarchy.len(), 1);
        assert_eq!(hierarchy.total(), 1);

        cache.shutdown().unwrap();
        assert_eq!(hierarchy.len(), 3);
    }

    /// Re-touching an owned chunk takes it back without any I/O.
    #[test]
    fn reclaim_takes_chunk_back_from_owned_set() {
        let store = Store::new();
        let hierarchy = Arc::new(Hierarchy::new());
        let cache = store.cache(&hierarchy, 8, 8);

        insert_all(&cache, &lcg_voxels(2, 5));
        assert_eq!(cache.owned.lock().len(), 1);

        let mut pruner = Pruner::new(Arc::clone(&cache));
        let chunk = cache.add_ref(root_key(), &mut pruner).unwrap();
        assert_eq!(chunk.np(), 2);
        assert!(cache.owned.lock().is_empty());
        assert_eq!(cache.latch_info().read, 0);

        {
            let slice = cache.slices[0].lock();
            let reffed = Arc::clone(slice.get(&Xyz::ORIGIN).unwrap());
            drop(slice);
            assert_eq!(reffed.lock().count(), 1);
        }

        drop(pruner);
        cache.shutdown().unwrap();
    }

    /// While a pruner holds its refs the owned set stays empty; dropping it
    /// hands the zero-count chunks over, ref intact.
    #[test]
    fn dropping_the_pruner_hands_chunks_to_the_owned_set() {
        let store = Store::new();
        let hierarchy = Arc::new(Hierarchy::new());
        let cache = store.cache(&hierarchy, 8, 8);

        let mut pruner = Pruner::new(Arc::clone(&cache));
        let mut key = Key::new(bounds16());
        cache.insert(Voxel::new(1.0, 1.0, 1.0, 0), &mut key, root_key(), &mut pruner).unwrap();
        assert!(cache.owned.lock().is_empty());

        drop(pruner);
        assert_eq!(cache.owned.lock().len(), 1);
        {
            let slice = cache.slices[0].lock();
            let reffed = Arc::clone(slice.get(&Xyz::ORIGIN).unwrap());
            drop(slice);
            assert_eq!(reffed.lock().count(), 1);
        }

        cache.shutdown().unwrap();
    }

    /// Latching returns the rates since the previous latch and zeroes them;
    /// the alive level survives.
    #[test]
    fn latch_resets_the_rate_counters() {
        let store = Store::new();
        let hierarchy = Arc::new(Hierarchy::new());
        let cache = store.cache(&hierarchy, 2, 8);

        insert_all(&cache, &lcg_voxels(5, 17));
        cache.shutdown().unwrap();

        let first = cache.latch_info();
        assert!(first.written > 0);
        assert_eq!(first.alive, 0);

        let second = cache.latch_info();
        assert_eq!(second, Info { alive: 0, read: 0, written: 0 });
    }
}
