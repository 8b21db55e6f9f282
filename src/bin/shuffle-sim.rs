//! shuffle-sim: run in-process producers and consumers through the exchange.
//!
//! Every row id is produced once; the run fails unless each consumer sees
//! exactly the rows its output kind promises it.
//!
//! Usage:
//!   shuffle-sim --producers 8 --pages-per-producer 200 --kind partitioned
//!   shuffle-sim --kind broadcast --consumers 3 --json

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use futures::future::try_join_all;
use serde::Serialize;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use shuffle_exchange::exchange::clear_factories;
use shuffle_exchange::{
    BincodeCodec, EnqueueStatus, ExchangeClient, ExchangeConfig, ExchangeStats,
    LocalExchangeSource, MemoryPool, OutputBufferManager, OutputKind, PageCodec,
};

/// Consumers give up if no data shows up for this long.
const STALL_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Kind {
    Partitioned,
    Broadcast,
    Arbitrary,
}

impl From<Kind> for OutputKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Partitioned => OutputKind::Partitioned,
            Kind::Broadcast => OutputKind::Broadcast,
            Kind::Arbitrary => OutputKind::Arbitrary,
        }
    }
}

#[derive(Debug, Parser)]
#[command(name = "shuffle-sim", version, about = "Simulate a shuffle through the exchange")]
struct Args {
    /// Number of producer tasks (defaults to the number of CPUs)
    #[arg(long)]
    producers: Option<usize>,

    /// Number of consumer tasks, one destination each
    #[arg(long, default_value_t = 2)]
    consumers: u32,

    #[arg(long, default_value_t = 100)]
    pages_per_producer: u64,

    #[arg(long, default_value_t = 1024)]
    rows_per_page: u64,

    /// How producer output is spread over consumers
    #[arg(long, value_enum, default_value_t = Kind::Partitioned)]
    kind: Kind,

    /// TOML file with exchange settings
    #[arg(long, env = "SHUFFLE_SIM_CONFIG")]
    config: Option<PathBuf>,

    /// Override the consumer ceiling from the config file
    #[arg(long)]
    max_queued_bytes: Option<u64>,

    /// LZ4-compress page bodies
    #[arg(long)]
    compress: bool,

    /// Print the report as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Serialize)]
struct ConsumerReport {
    destination: u32,
    rows: u64,
    stats: ExchangeStats,
}

#[derive(Debug, Serialize)]
struct Report {
    kind: String,
    producers: usize,
    consumers: u32,
    pages_produced: u64,
    rows_produced: u64,
    bytes_produced: u64,
    producer_blocks: u64,
    elapsed_ms: u128,
    consumer_reports: Vec<ConsumerReport>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let mut config = match &args.config {
        Some(path) => ExchangeConfig::load(path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => ExchangeConfig::default(),
    };
    if let Some(bytes) = args.max_queued_bytes {
        config.max_queued_bytes = bytes;
    }
    config.validate().context("invalid exchange config")?;
    if args.consumers == 0 {
        bail!("--consumers must be at least 1");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    let report = runtime.block_on(run(&args, config))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

async fn run(args: &Args, config: ExchangeConfig) -> anyhow::Result<Report> {
    let producers = args.producers.unwrap_or_else(num_cpus::get).max(1);
    let kind = OutputKind::from(args.kind);
    let start = Instant::now();

    clear_factories();
    let manager = OutputBufferManager::new(config.output_buffer.clone());
    LocalExchangeSource::register(Arc::clone(&manager));

    for p in 0..producers {
        manager.initialize_task(&producer_id(p), kind, args.consumers)?;
    }
    info!(
        producers,
        consumers = args.consumers,
        kind = ?kind,
        max_queued_bytes = config.max_queued_bytes,
        "starting shuffle"
    );

    let producer_tasks = (0..producers).map(|p| {
        let manager = Arc::clone(&manager);
        let pages = args.pages_per_producer;
        let rows_per_page = args.rows_per_page;
        let consumers = args.consumers;
        let compress = args.compress;
        tokio::spawn(async move {
            produce(&manager, p, pages, rows_per_page, consumers, compress).await
        })
    });

    let root_pool = MemoryPool::new_root("shuffle-sim");
    let consumer_tasks = (0..args.consumers).map(|destination| {
        let config = config.clone();
        let pool = MemoryPool::new_child(format!("consumer-{destination}"), &root_pool);
        tokio::spawn(async move { consume(destination, producers, config, pool).await })
    });

    let (produced, consumed) = futures::join!(
        try_join_all(producer_tasks),
        try_join_all(consumer_tasks)
    );

    let mut pages_produced = 0;
    let mut bytes_produced = 0;
    let mut producer_blocks = 0;
    for result in produced.context("producer task panicked")? {
        let stats = result?;
        pages_produced += stats.pages;
        bytes_produced += stats.bytes;
        producer_blocks += stats.blocks;
    }

    let mut consumer_rows = Vec::new();
    let mut consumer_reports = Vec::new();
    for result in consumed.context("consumer task panicked")? {
        let (report, rows) = result?;
        consumer_reports.push(report);
        consumer_rows.push(rows);
    }

    let rows_produced = producers as u64 * args.pages_per_producer * args.rows_per_page;
    verify(kind, rows_produced, &consumer_rows)?;

    Ok(Report {
        kind: format!("{kind:?}").to_lowercase(),
        producers,
        consumers: args.consumers,
        pages_produced,
        rows_produced,
        bytes_produced,
        producer_blocks,
        elapsed_ms: start.elapsed().as_millis(),
        consumer_reports,
    })
}

fn producer_id(p: usize) -> String {
    format!("producer-{p}")
}

#[derive(Debug, Default)]
struct ProducerStats {
    pages: u64,
    bytes: u64,
    blocks: u64,
}

/// Enqueue `pages` pages of consecutive row ids, waiting whenever the
/// output buffer is full.
async fn produce(
    manager: &OutputBufferManager,
    p: usize,
    pages: u64,
    rows_per_page: u64,
    consumers: u32,
    compress: bool,
) -> anyhow::Result<ProducerStats> {
    let codec = BincodeCodec::<Vec<u64>>::new().compressed(compress);
    let task_id = producer_id(p);
    let mut stats = ProducerStats::default();

    for i in 0..pages {
        let first = (p as u64 * pages + i) * rows_per_page;
        let rows: Vec<u64> = (first..first + rows_per_page).collect();
        let page = codec.encode(&rows)?;
        stats.pages += 1;
        stats.bytes += page.size();

        let destination = (i % u64::from(consumers)) as u32;
        if let EnqueueStatus::Blocked(future) = manager.enqueue(&task_id, destination, page)? {
            stats.blocks += 1;
            future.await;
        }
    }
    manager.no_more_data(&task_id)?;
    debug!(task_id = %task_id, pages = stats.pages, blocks = stats.blocks, "producer done");
    Ok(stats)
}

/// Read every page for `destination` from all producers.
async fn consume(
    destination: u32,
    producers: usize,
    config: ExchangeConfig,
    pool: Arc<MemoryPool>,
) -> anyhow::Result<(ConsumerReport, Vec<u64>)> {
    let codec = BincodeCodec::<Vec<u64>>::new();
    let client = ExchangeClient::new(format!("consumer-{destination}"), destination, config, pool)?;
    for p in 0..producers {
        client.add_remote_task_id(&format!("local://{}", producer_id(p)))?;
    }
    client.no_more_remote_tasks();

    let mut rows = Vec::new();
    loop {
        let batch = client.next(1 << 20)?;
        for page in &batch.pages {
            rows.extend(codec.decode(page)?);
        }
        if batch.at_end {
            break;
        }
        if batch.future.is_valid() && !batch.future.wait_for(STALL_TIMEOUT).await {
            bail!("consumer {destination} stalled for {STALL_TIMEOUT:?}");
        }
    }

    let stats = client.stats();
    client.close();
    debug!(destination, rows = rows.len(), "consumer done");
    Ok((
        ConsumerReport {
            destination,
            rows: rows.len() as u64,
            stats,
        },
        rows,
    ))
}

/// Check exactly-once delivery: broadcast consumers each see every row,
/// otherwise every row lands on exactly one consumer.
fn verify(kind: OutputKind, rows_produced: u64, consumer_rows: &[Vec<u64>]) -> anyhow::Result<()> {
    let check = |rows: &mut Vec<u64>, who: &str| -> anyhow::Result<()> {
        rows.sort_unstable();
        if rows.len() as u64 != rows_produced {
            bail!("{who} received {} rows, expected {rows_produced}", rows.len());
        }
        if let Some(pos) = rows.iter().enumerate().position(|(i, row)| *row != i as u64) {
            bail!("{who} is missing or duplicating row {pos}");
        }
        Ok(())
    };

    match kind {
        OutputKind::Broadcast => {
            for (destination, rows) in consumer_rows.iter().enumerate() {
                check(&mut rows.clone(), &format!("consumer {destination}"))?;
            }
        }
        OutputKind::Partitioned | OutputKind::Arbitrary => {
            let mut all: Vec<u64> = consumer_rows.iter().flatten().copied().collect();
            check(&mut all, "consumers")?;
        }
    }
    info!(rows = rows_produced, "every row delivered exactly once");
    Ok(())
}

fn print_report(report: &Report) {
    println!(
        "{} shuffle: {} producers -> {} consumers",
        report.kind, report.producers, report.consumers
    );
    println!(
        "  produced {} pages, {} rows, {} bytes ({} producer blocks)",
        report.pages_produced, report.rows_produced, report.bytes_produced, report.producer_blocks
    );
    println!("  elapsed {} ms", report.elapsed_ms);
    for consumer in &report.consumer_reports {
        let metric = |name: &str| consumer.stats.get(name).map_or(0, |m| m.sum);
        println!(
            "  consumer {}: {} rows, {} pages, peak {} bytes, avg page {} bytes, {} timeouts",
            consumer.destination,
            consumer.rows,
            metric("numReceivedPages"),
            metric("peakBytes"),
            metric("averageReceivedPageBytes"),
            metric("numTimeouts"),
        );
    }
}

