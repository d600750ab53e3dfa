use std::io;

use crate::cache::spin::Spin;
use crate::io::endpoint::Endpoint;
use crate::tree::key::{ChunkKey, Key};
use crate::tree::voxel::Voxel;

/// Chunk is one cell of the octree holding the voxels that landed at its
/// depth. Insertion is internally synchronized: every ingestion thread
/// holding a pinned pointer to the chunk may insert concurrently.
pub struct Chunk {
    key: ChunkKey,
    span: usize,
    voxels: Spin<Vec<Voxel>>,
}

impl Chunk {
    pub fn new(key: ChunkKey, span: usize) -> Chunk {
        assert!(span > 0, "chunk span must be positive");
        Chunk { key, span, voxels: Spin::new(Vec::new()) }
    }

    /// Tries to take the voxel. Returns false exactly when the chunk is at
    /// capacity; the caller then descends one level toward the voxel.
    pub fn insert(&self, voxel: &Voxel, key: &Key) -> bool {
        debug_assert_eq!(key.dxyz(), self.key.dxyz());

        let mut voxels = self.voxels.lock();
        if voxels.len() >= self.span {
            return false;
        }
        voxels.push(*voxel);
        true
    }

    pub fn np(&self) -> u64 {
        self.voxels.lock().len() as u64
    }

    fn blob_name(&self) -> String {
        format!("{}.bin", self.key.dxyz())
    }

    /// Writes the chunk's voxels through the staging endpoint into the store
    /// and returns how many were saved. The encode happens under the voxel
    /// lock, the blocking write after it.
    pub fn save(&self, out: &Endpoint, tmp: &Endpoint) -> io::Result<u64> {
        let voxels = self.voxels.lock();
        let np = voxels.len() as u64;
        let mut buf = Vec::with_capacity(voxels.len() * Voxel::ENCODED_SIZE);
        for voxel in voxels.iter() {
            voxel.encode_into(&mut buf);
        }
        drop(voxels);

        out.ensure_put(tmp, &self.blob_name(), &buf)?;
        Ok(np)
    }

    /// Restores `np` previously saved voxels from the store. Voxels inserted
    /// since the chunk was assigned stay behind the restored ones.
    pub fn load(&self, out: &Endpoint, np: u64) -> io::Result<()> {
        let bytes = out.get(&self.blob_name())?;
        let expected = np as usize * Voxel::ENCODED_SIZE;
        if bytes.len() != expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("blob {}: got {} bytes, want {}", self.blob_name(), bytes.len(), expected),
            ));
        }

        let mut restored = Vec::with_capacity(np as usize);
        for encoded in bytes.chunks_exact(Voxel::ENCODED_SIZE) {
            restored.push(Voxel::decode(encoded));
        }

        let mut voxels = self.voxels.lock();
        restored.append(&mut voxels);
        *voxels = restored;
        Ok(())
    }
}
