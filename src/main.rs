use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use workgrid::config::SchedulerConfig;
use workgrid::dispatch::SimulatedDispatcher;
use workgrid::manifest::WorkItem;
use workgrid::registry::{ComputeNode, NodeCapability};
use workgrid::service::GridService;
use workgrid::shutdown::install_shutdown_handler;
use workgrid::{BatchOptions, Strategy};

#[derive(Parser, Debug)]
#[command(name = "workgrid")]
#[command(version)]
#[command(about = "Distributed job scheduling and load-balancing engine")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Submit a batch of synthetic items against a simulated node pool
    Batch(BatchArgs),

    /// Stream synthetic items through the micro-batch pipeline
    Stream(StreamArgs),

    /// Show the node pool snapshot and service metrics
    Nodes(PoolArgs),
}

#[derive(Parser, Debug)]
struct PoolArgs {
    /// Number of simulated nodes in the pool
    #[arg(long, default_value_t = 4)]
    nodes: usize,

    /// Fraction of items the simulated pool fails, 0.0-1.0
    #[arg(long, default_value_t = 0.02)]
    fail_rate: f64,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Parser, Debug)]
struct BatchArgs {
    #[command(flatten)]
    pool: PoolArgs,

    /// Number of synthetic work items to submit
    #[arg(long, default_value_t = 200)]
    items: usize,

    /// Placement strategy
    #[arg(long, default_value = "weighted-capacity")]
    strategy: StrategyArg,

    /// Redundant node subsets executing the same item set
    #[arg(long, default_value_t = 1)]
    redundancy: usize,

    /// Deadline in seconds
    #[arg(long, default_value_t = 60)]
    deadline_secs: u64,

    /// Requester region for geo_proximity placement
    #[arg(long)]
    region: Option<String>,
}

#[derive(Parser, Debug)]
struct StreamArgs {
    #[command(flatten)]
    pool: PoolArgs,

    /// Number of synthetic items to stream
    #[arg(long, default_value_t = 500)]
    items: usize,

    /// Micro-batch size
    #[arg(long, default_value_t = 50)]
    micro_batch: usize,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    RoundRobin,
    WeightedCapacity,
    GeoProximity,
}

impl From<StrategyArg> for Strategy {
    fn from(value: StrategyArg) -> Self {
        match value {
            StrategyArg::RoundRobin => Strategy::RoundRobin,
            StrategyArg::WeightedCapacity => Strategy::WeightedCapacity,
            StrategyArg::GeoProximity => Strategy::GeoProximity,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

const REGIONS: [&str; 3] = ["us-east", "eu-west", "ap-south"];

/// Build a service over a simulated pool of `count` nodes with a spread of
/// capacities and loads.
async fn build_pool(
    args: &PoolArgs,
    config: SchedulerConfig,
) -> Result<(GridService, Arc<SimulatedDispatcher>), Box<dyn std::error::Error>> {
    let dispatcher = Arc::new(SimulatedDispatcher::new(args.fail_rate));
    let service = GridService::new(config, dispatcher.clone());

    for i in 0..args.nodes {
        let id = format!("node-{}", i + 1);
        let region = REGIONS[i % REGIONS.len()];
        let units = 4 + 4 * (i as u32 % 4);
        dispatcher.set_node_load(&id, 10.0 + (i as f64 * 17.0) % 80.0);
        service
            .register_node(ComputeNode::new(&id, region, NodeCapability::new("cpu", units)))
            .await?;
    }

    Ok((service, dispatcher))
}

fn synthetic_items(count: usize) -> Vec<WorkItem> {
    (0..count)
        .map(|i| WorkItem::new(format!("item-{i:05}"), format!("cas://demo/{i:05}")))
        .collect()
}

async fn handle_batch(args: BatchArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SchedulerConfig::new().with_poll_interval(Duration::from_millis(100));
    let (service, _dispatcher) = build_pool(&args.pool, config).await?;
    let cancel = install_shutdown_handler();
    service.run(cancel.clone());

    let options = BatchOptions {
        redundancy: args.redundancy,
        deadline: Some(Duration::from_secs(args.deadline_secs)),
        strategy: args.strategy.into(),
        region: args.region.clone(),
        ..Default::default()
    };

    let batch_id = service
        .submit(synthetic_items(args.items), "demo-scoring", options)
        .await?;
    println!("Submitted batch {batch_id}");

    // Show a couple of progress snapshots while the batch runs.
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    let result = loop {
        tokio::select! {
            _ = ticker.tick() => {
                let status = service.status(batch_id).await?;
                println!(
                    "  [{}] {:>5.1}%  {}/{} succeeded, {} failed",
                    status.state, status.progress_pct, status.succeeded,
                    status.total_items, status.failed
                );
                if status.state.is_terminal() {
                    break service
                        .await_completion(batch_id, Duration::from_secs(1))
                        .await?;
                }
            }
            _ = cancel.cancelled() => {
                println!("Interrupted, collecting partial results");
                break service
                    .await_completion(batch_id, Duration::from_millis(1))
                    .await?;
            }
        }
    };

    match args.pool.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&result)?),
        OutputFormat::Table => {
            println!();
            println!("Batch {}", result.batch_id);
            println!("{}", "=".repeat(46));
            println!("State:       {}", result.state);
            println!("Items:       {}", result.total_items);
            println!(
                "Succeeded:   {} ({:.1}%)",
                result.succeeded,
                100.0 * result.success_rate()
            );
            println!("Failed:      {}", result.failed_items.len());
            println!("Latency:     {:.1} ms/item", result.avg_item_latency_ms);
            println!("Throughput:  {:.1} items/s", result.throughput_per_sec);
            println!("Wall clock:  {} ms", result.wall_clock_ms);
            println!();
            println!("{:<12} {:<8} SHARE", "NODE", "ITEMS");
            println!("{}", "-".repeat(30));
            let mut per_node: Vec<_> = result.per_node.iter().collect();
            per_node.sort_by(|a, b| a.0.cmp(b.0));
            for (node_id, util) in per_node {
                println!(
                    "{:<12} {:<8} {:.1}%",
                    node_id, util.items_processed, util.share_pct
                );
            }
        }
    }
    Ok(())
}

async fn handle_stream(args: StreamArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SchedulerConfig::new().with_micro_batch_size(args.micro_batch);
    let (service, _dispatcher) = build_pool(&args.pool, config).await?;
    let cancel = install_shutdown_handler();
    service.run(cancel.clone());

    let (tx, rx) = mpsc::channel(args.micro_batch * 2);
    let item_count = args.items;
    let producer = tokio::spawn(async move {
        for item in synthetic_items(item_count) {
            if tx.send(item).await.is_err() {
                break;
            }
        }
    });

    let delivered = Arc::new(std::sync::atomic::AtomicUsize::new(0));
    let delivered_cb = delivered.clone();
    let summary = service
        .process_stream(
            rx,
            Arc::new(move |item_id, outcome| {
                let n = delivered_cb.fetch_add(1, std::sync::atomic::Ordering::Relaxed) + 1;
                if n % 100 == 0 {
                    println!("  {n} results delivered (latest: {item_id}, ok={})", outcome.success);
                }
            }),
        )
        .await?;
    producer.await?;

    match args.pool.output {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
        OutputFormat::Table => {
            println!();
            println!("Stream summary");
            println!("{}", "=".repeat(30));
            println!("Consumed:      {}", summary.items_consumed);
            println!("Delivered:     {}", summary.items_delivered);
            println!("Micro-batches: {}", summary.micro_batches);
            println!("Nodes used:    {}", summary.nodes_used.join(", "));
        }
    }
    Ok(())
}

async fn handle_nodes(args: PoolArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = SchedulerConfig::new().with_probe_interval(Duration::from_millis(200));
    let (service, _dispatcher) = build_pool(&args, config).await?;
    let cancel = install_shutdown_handler();
    service.run(cancel.clone());

    // Let the health monitor complete a probe sweep before reading.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let nodes = service.node_status().await;
    let metrics = service.metrics().await;

    match args.output {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "nodes": nodes,
                "metrics": metrics,
            }))?);
        }
        OutputFormat::Table => {
            println!("{:<10} {:<10} {:<12} {:<7} {:<7} STATUS", "NODE", "REGION", "ACCEL", "UNITS", "LOAD");
            println!("{}", "-".repeat(60));
            for node in &nodes {
                println!(
                    "{:<10} {:<10} {:<12} {:<7} {:<7.1} {}",
                    node.id,
                    node.region,
                    node.capability.accelerator,
                    node.capability.parallel_units,
                    node.load_pct,
                    node.status
                );
            }
            println!();
            println!(
                "Active: {}  Capacity: {} units  Avg load: {:.1}%  Active batches: {}",
                metrics.active_nodes,
                metrics.total_capacity,
                metrics.average_load,
                metrics.active_batches
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Commands::Batch(batch_args) => handle_batch(batch_args).await?,
        Commands::Stream(stream_args) => handle_stream(stream_args).await?,
        Commands::Nodes(pool_args) => handle_nodes(pool_args).await?,
    }

    Ok(())
}
