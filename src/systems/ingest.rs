use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use cgmath::Point3;
use log::info;

use crate::cache::info::Info;
use crate::cache::pruner::Pruner;
use crate::cache::ChunkCache;
use crate::io::endpoint::Endpoint;
use crate::io::hierarchy::Hierarchy;
use crate::io::reader;
use crate::systems::jobs::IoPool;
use crate::tree::bounds::Bounds;
use crate::tree::key::{ChunkKey, Key};
use crate::tree::voxel::Voxel;

const HIERARCHY_FILE: &str = "hierarchy.json";
const BOUNDS_FILE: &str = "bounds.json";

/// Build parameters. `span` is the per-chunk point capacity, `cache_size`
/// the owned-set bound between purges.
#[derive(Clone, Debug)]
pub struct Config {
    pub out_dir: PathBuf,
    pub tmp_dir: PathBuf,
    pub span: usize,
    pub cache_size: usize,
    pub workers: usize,
    pub batch_size: usize,
}

impl Config {
    pub fn new(out_dir: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>) -> Config {
        Config {
            out_dir: out_dir.into(),
            tmp_dir: tmp_dir.into(),
            span: 4096,
            cache_size: 64,
            workers: num_cpus::get(),
            batch_size: 16384,
        }
    }
}

pub struct BuildReport {
    pub points: u64,
    pub chunks: usize,
    pub info: Info,
}

/// Runs one ingestion pass: reads the input, pushes every point through the
/// cache and flushes everything back out. Running it again over the same
/// output directory resumes from the persisted hierarchy.
pub fn build(input: &Path, config: &Config) -> io::Result<BuildReport> {
    let voxels = reader::read_voxels(input)?;
    if voxels.is_empty() {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "input contains no points"));
    }

    let out = Arc::new(Endpoint::new(&config.out_dir)?);
    let tmp = Arc::new(Endpoint::new(&config.tmp_dir)?);
    info!("writing blobs to {} (staging in {})", out.root().display(), tmp.root().display());
    let bounds = load_or_init_bounds(&config.out_dir.join(BOUNDS_FILE), &voxels)?;

    let hierarchy_path = config.out_dir.join(HIERARCHY_FILE);
    let hierarchy = Arc::new(Hierarchy::load(&hierarchy_path)?);
    let resumed = hierarchy.len();
    if resumed > 0 {
        info!("resuming build over {} persisted chunks", resumed);
    }

    let workers = config.workers.max(1);
    let io_pool = Arc::new(IoPool::new(workers));
    let cache = ChunkCache::new(
        Arc::clone(&hierarchy),
        Arc::clone(&io_pool),
        out,
        tmp,
        config.cache_size,
        config.span,
    );

    info!(
        "indexing {} points across {} workers (span {}, cache {})",
        voxels.len(), workers, config.span, config.cache_size,
    );

    let root = ChunkKey::root(bounds);
    let batches: Vec<&[Voxel]> = voxels.chunks(config.batch_size).collect();
    let next = AtomicUsize::new(0);

    let ingested: io::Result<()> = thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let cache = Arc::clone(&cache);
            let next = &next;
            let batches = &batches;
            handles.push(scope.spawn(move || -> io::Result<()> {
                loop {
                    let index = next.fetch_add(1, Ordering::Relaxed);
                    let Some(batch) = batches.get(index) else {
                        return Ok(());
                    };

                    let mut pruner = Pruner::new(Arc::clone(&cache));
                    for voxel in batch.iter() {
                        let mut key = Key::new(bounds);
                        cache.insert(*voxel, &mut key, root, &mut pruner)?;
                    }
                    drop(pruner);
                    cache.maybe_purge(cache.cache_size());
                }
            }));
        }

        let mut first_err = None;
        for handle in handles {
            if let Err(err) = handle.join().expect("ingestion worker panicked") {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    });

    let flushed = ingested.and_then(|()| cache.shutdown());
    if let Err(err) = flushed {
        drop(cache);
        if let Some(pool) = Arc::into_inner(io_pool) {
            pool.stop();
        }
        return Err(err);
    }

    hierarchy.save(&hierarchy_path)?;
    let latched = cache.latch_info();
    info!(
        "build finished: {} chunks, {} points persisted ({} reanimations, {} saves)",
        hierarchy.len(), hierarchy.total(), latched.read, latched.written,
    );

    drop(cache);
    Arc::into_inner(io_pool).expect("io pool still referenced after shutdown").stop();

    Ok(BuildReport {
        points: hierarchy.total(),
        chunks: hierarchy.len(),
        info: latched,
    })
}

/// The root cube has to be identical across resumed runs, so the first run
/// persists it next to the blobs and later runs read it back.
fn load_or_init_bounds(path: &Path, voxels: &[Voxel]) -> io::Result<Bounds> {
    match fs::read(path) {
        Ok(data) => {
            let raw: Vec<f64> = serde_json::from_slice(&data)?;
            if raw.len() != 4 || raw[3] <= 0.0 {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "malformed bounds file"));
            }
            let min = Point3::new(raw[0], raw[1], raw[2]);
            let bounds = Bounds::new(min, min + cgmath::Vector3::new(raw[3], raw[3], raw[3]));
            for voxel in voxels {
                if !bounds.contains(voxel.position) {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("point {:?} outside the indexed bounds", voxel.position),
                    ));
                }
            }
            Ok(bounds)
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            let bounds = reader::cube_bounds(voxels);
            let min = bounds.min();
            let raw = vec![min.x, min.y, min.z, bounds.edge()];
            fs::write(path, serde_json::to_vec(&raw)?)?;
            Ok(bounds)
        }
        Err(err) => Err(err),
    }
}
