use std::fs;
use std::io;
use std::path::Path;

use dashmap::DashMap;

use crate::tree::key::Dxyz;

/// Persistent mapping from chunk identifier to saved point count. A nonzero
/// count means the store holds prior content for that chunk; the cache
/// consults it on every first touch and updates it after every save.
///
/// Per-key updates are atomic, so concurrent serializations of different
/// chunks never step on each other.
pub struct Hierarchy {
    counts: DashMap<Dxyz, u64>,
}

impl Hierarchy {
    pub fn new() -> Hierarchy {
        Hierarchy { counts: DashMap::new() }
    }

    /// Returns the persisted point count for the chunk, or 0 if the store
    /// has never seen it.
    pub fn get(&self, dxyz: Dxyz) -> u64 {
        self.counts.get(&dxyz).map(|np| *np).unwrap_or(0)
    }

    pub fn set(&self, dxyz: Dxyz, np: u64) {
        self.counts.insert(dxyz, np);
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    /// Sum of all persisted point counts.
    pub fn total(&self) -> u64 {
        self.counts.iter().map(|entry| *entry.value()).sum()
    }

    /// Reads a hierarchy file written by [`Hierarchy::save`]. A missing file
    /// is a fresh build and yields an empty hierarchy.
    pub fn load(path: &Path) -> io::Result<Hierarchy> {
        let hierarchy = Hierarchy::new();
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(hierarchy),
            Err(err) => return Err(err),
        };

        let map: serde_json::Map<String, serde_json::Value> = serde_json::from_slice(&data)?;
        for (key, value) in map {
            let dxyz: Dxyz = key.parse().map_err(|_| {
                io::Error::new(io::ErrorKind::InvalidData, format!("bad hierarchy key {:?}", key))
            })?;
            let np = value.as_u64().ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, format!("bad hierarchy count for {}", dxyz))
            })?;
            hierarchy.counts.insert(dxyz, np);
        }
        Ok(hierarchy)
    }

    /// Writes the hierarchy as a JSON object keyed by `d-x-y-z`.
    pub fn save(&self, path: &Path) -> io::Result<()> {
        let mut map = serde_json::Map::new();
        for entry in self.counts.iter() {
            map.insert(entry.key().to_string(), serde_json::Value::from(*entry.value()));
        }
        fs::write(path, serde_json::to_vec_pretty(&map)?)
    }
}
