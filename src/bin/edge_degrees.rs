use std::error::Error;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;
use env_logger::Env;

use membound::programs::edge_degrees::{EdgeLineWriter, EdgeListSource, compute_edge_degrees};
use membound::{
    DEFAULT_MERGE_FACTOR, DEFAULT_SEGMENT_SIZE, MemoryAllocator, Outcome, SpillStore, TaskConfig,
    TaskContext,
};

#[derive(Parser, Debug)]
#[command(
    name = "edge_degrees",
    version,
    about = "Annotate each undirected edge with the degrees of its endpoints"
)]
struct Args {
    /// Edge list, one `a<delimiter>b` pair per line
    #[arg(long)]
    input: PathBuf,

    /// Output file of `a|b|degree(a)|degree(b)` lines
    #[arg(long)]
    output: PathBuf,

    #[arg(long = "memory-mb", default_value_t = 64)]
    memory_mb: usize,

    #[arg(long, default_value_t = ',')]
    delimiter: char,

    #[arg(long = "merge-factor", default_value_t = DEFAULT_MERGE_FACTOR)]
    merge_factor: usize,

    /// Directory for spill files (defaults to the system temp dir)
    #[arg(long = "spill-dir")]
    spill_dir: Option<PathBuf>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = TaskConfig::try_new(args.memory_mb)?.with_merge_factor(args.merge_factor);
    let allocator = MemoryAllocator::new(config.memory_bytes(), DEFAULT_SEGMENT_SIZE);
    let spill_store = match &args.spill_dir {
        Some(dir) => SpillStore::new(dir)?,
        None => SpillStore::in_system_temp()?,
    };
    let ctx = TaskContext::new(allocator, spill_store.clone());

    let start = Instant::now();
    let edges = EdgeListSource::new(BufReader::new(File::open(&args.input)?), args.delimiter);
    let mut output = EdgeLineWriter::new(BufWriter::new(File::create(&args.output)?));
    let stats = match compute_edge_degrees(edges, &config, &ctx, &mut output)? {
        Outcome::Completed(stats) => stats,
        Outcome::Cancelled => {
            log::warn!("Computation was cancelled, output is partial");
            return Ok(());
        }
    };
    let lines = output.finish()?;

    log::info!(
        "Wrote {} edges over {} vertices to {} in {:.2?}",
        lines,
        stats.vertices,
        args.output.display(),
        start.elapsed()
    );
    log::info!("{}", spill_store.io_stats());
    Ok(())
}
