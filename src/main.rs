#![allow(dead_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

mod cache;
mod io;
mod systems;
mod tree;

use crate::systems::ingest;

/// Octree point-cloud indexer: sorts point samples into chunked octree
/// cells and persists them to a blob directory.
#[derive(Parser)]
#[command(name = "octile", version)]
struct Args {
    /// Input point file, one `x y z [intensity]` sample per line.
    input: PathBuf,

    /// Directory for finished chunk blobs and the build metadata.
    #[arg(long)]
    out: PathBuf,

    /// Staging directory for in-flight writes.
    #[arg(long)]
    tmp: PathBuf,

    /// Points a chunk holds before inserts overflow to its children.
    #[arg(long, default_value_t = 4096)]
    span: usize,

    /// Unreferenced chunks kept resident between purges.
    #[arg(long, default_value_t = 64)]
    cache_size: usize,

    /// Ingestion worker threads.
    #[arg(long, default_value_t = num_cpus::get())]
    workers: usize,

    /// Points handed to a worker per pruner lifetime.
    #[arg(long, default_value_t = 16384)]
    batch_size: usize,
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut config = ingest::Config::new(args.out, args.tmp);
    config.span = args.span;
    config.cache_size = args.cache_size;
    config.workers = args.workers;
    config.batch_size = args.batch_size;

    match ingest::build(&args.input, &config) {
        Ok(report) => {
            println!(
                "indexed {} points into {} chunks ({} reanimations, {} saves)",
                report.points, report.chunks, report.info.read, report.info.written,
            );
            ExitCode::SUCCESS
        }
        Err(err) => {
            eprintln!("error: {}", err);
            ExitCode::FAILURE
        }
    }
}
