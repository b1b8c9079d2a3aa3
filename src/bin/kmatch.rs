use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use kmatch::*;
use tracing::info;

/// Canonical k-mer index and record matcher.
#[derive(Parser, Debug)]
#[command(name = "kmatch", author, version, about)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Keep records whose sequence shares enough canonical k-mers with a reference table
    Filter(FilterArgs),

    /// Build a canonical k-mer table (KMER<TAB>COUNT) from k-mers or sequences
    Index(IndexArgs),
}

#[derive(Args, Debug)]
struct IndexingArgs {
    /// K-mer length (1..=255)
    #[arg(short = 'k', long)]
    k: usize,

    /// Key backend: packed|bytes
    #[arg(long, default_value = "packed")]
    codec: String,

    /// Drop reference k-mers seen fewer than N times
    #[arg(long, default_value_t = 0)]
    min_count: u64,

    /// Abort if the index grows beyond N distinct k-mers
    #[arg(long)]
    max_keys: Option<usize>,

    /// Leading bases used to shard the index (4^N shards)
    #[arg(long, default_value_t = 4)]
    prefix_bases: usize,
}

#[derive(Args, Debug)]
struct PipelineArgs {
    /// Worker threads per stage (defaults to all cores)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Records per batch
    #[arg(long, default_value_t = 1000)]
    batch_size: usize,

    /// Batches in flight per queue (defaults to 2 x threads)
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Seconds between warnings while waiting for input
    #[arg(long, default_value_t = 5)]
    startup_warn_secs: u64,

    /// Give up if input does not start within this many seconds
    #[arg(long)]
    startup_timeout_secs: Option<u64>,
}

#[derive(Args, Debug)]
struct FilterArgs {
    /// Reference k-mer table or sequences (.gz accepted)
    #[arg(short, long = "ref")]
    reference: String,

    #[command(flatten)]
    indexing: IndexingArgs,

    /// Minimum k-mer hits for a record to pass
    #[arg(short, long, default_value_t = 1)]
    min_matches: u64,

    /// Keep records that do NOT reach the threshold
    #[arg(short = 'v', long)]
    invert: bool,

    /// 0-based whitespace-separated field holding the sequence
    #[arg(short, long, default_value_t = 0)]
    field: usize,

    /// Append the hit count to each passing record
    #[arg(long)]
    annotate: bool,

    /// Output path (`-` for stdout, `.gz` for gzip)
    #[arg(short, long, default_value = "-")]
    out: String,

    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Input records (`-` or none for stdin)
    inputs: Vec<String>,
}

#[derive(Args, Debug)]
struct IndexArgs {
    #[command(flatten)]
    indexing: IndexingArgs,

    /// Output path (`-` for stdout, `.gz` for gzip)
    #[arg(short, long, default_value = "-")]
    out: String,

    #[command(flatten)]
    pipeline: PipelineArgs,

    /// Input k-mers or sequences (`-` or none for stdin)
    inputs: Vec<String>,
}

fn pipeline_config(args: &PipelineArgs) -> PipelineConfig {
    let mut cfg = PipelineConfig::default()
        .in_buffer_size(args.batch_size)
        .out_buffer_size(args.batch_size)
        .startup_warn_interval(Duration::from_secs(args.startup_warn_secs));
    if let Some(n) = args.threads {
        cfg = cfg.threads(n);
    }
    let capacity = args.queue_capacity.unwrap_or(2 * cfg.thread_count());
    cfg = cfg.in_queue_capacity(capacity).out_queue_capacity(capacity);
    if let Some(secs) = args.startup_timeout_secs {
        cfg = cfg.startup_timeout(Duration::from_secs(secs));
    }
    cfg
}

fn build_config(args: &IndexingArgs) -> Result<BuildConfig> {
    let codec: Codec = args.codec.parse().map_err(anyhow::Error::msg)?;
    let mut index = IndexConfig::default().prefix_bases(args.prefix_bases);
    if let Some(n) = args.max_keys {
        index = index.max_keys(n);
    }
    Ok(BuildConfig::new(args.k)
        .codec(codec)
        .index(index)
        .min_count(args.min_count))
}

fn sources(inputs: &[String]) -> Vec<InputSource> {
    inputs.iter().map(|s| InputSource::from_arg(s)).collect()
}

fn filter(args: FilterArgs) -> Result<()> {
    let start = Instant::now();
    let pipeline = pipeline_config(&args.pipeline);
    let build = build_config(&args.indexing)?;

    let ref_reader = kmatch::io::open_chain(&[InputSource::from_arg(&args.reference)], &pipeline)
        .with_context(|| format!("opening reference {}", args.reference))?;
    let (index, _) = build_index(ref_reader, &build, &pipeline)
        .with_context(|| format!("indexing reference {}", args.reference))?;
    info!(
        keys = index.len(),
        secs = start.elapsed().as_secs_f64(),
        "reference indexed"
    );

    let cfg = MatchConfig::default()
        .k(args.indexing.k)
        .min_matches(args.min_matches)
        .invert(args.invert)
        .field(args.field)
        .annotate(args.annotate);
    let target = OutputTarget::from_arg(&args.out);
    let writer =
        RecordWriter::create(&target).with_context(|| format!("creating output {target}"))?;
    let reader = kmatch::io::open_chain(&sources(&args.inputs), &pipeline)
        .context("opening input records")?;

    let (stats, written) =
        run_matching(&index, reader, &cfg, &pipeline, writer).context("matching records")?;

    let pct = |n: u64| {
        if stats.records == 0 {
            0.0
        } else {
            100.0 * n as f64 / stats.records as f64
        }
    };
    eprintln!("Input:\t\t{} records", stats.records);
    eprintln!("Passed:\t\t{} records ({:.2}%)", stats.passed, pct(stats.passed));
    eprintln!("Failed:\t\t{} records ({:.2}%)", stats.failed, pct(stats.failed));
    if stats.malformed > 0 {
        eprintln!("Malformed:\t{} records", stats.malformed);
    }
    eprintln!("Written:\t{} records to {}", written.records, target);
    eprintln!("Time:\t\t{:.3} seconds", start.elapsed().as_secs_f32());
    Ok(())
}

fn index(args: IndexArgs) -> Result<()> {
    let pipeline = pipeline_config(&args.pipeline);
    let build = build_config(&args.indexing)?;
    let reader = kmatch::io::open_chain(&sources(&args.inputs), &pipeline)
        .context("opening input k-mers")?;
    let (index, stats) = build_index(reader, &build, &pipeline).context("building index")?;

    let target = OutputTarget::from_arg(&args.out);
    let lines = index
        .dump_to(&target)
        .with_context(|| format!("writing k-mer table to {target}"))?;
    eprintln!(
        "Built k={} index: {} records, {} k-mers, {} distinct written",
        index.k(),
        stats.records,
        stats.kmers,
        lines
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.cmd {
        Command::Filter(args) => filter(args),
        Command::Index(args) => index(args),
    }
}
