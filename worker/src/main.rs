use clap::Parser;
use judge_config::Settings;
use judge_worker::Worker;
use judge_worker::WorkerArgs;
use tracing_subscriber::prelude::*;

#[derive(Debug, Parser)]
#[command(name = "judge-worker", about = "Judge worker: claims queued jobs and executes them")]
struct Cli {
    /// Redis stream name (queue:light or queue:torch).
    #[arg(long)]
    stream: String,
    /// Redis consumer group.
    #[arg(long)]
    group: String,
    /// Consumer name; must end in a digit suffix identifying the worker
    /// index.
    #[arg(long)]
    consumer: String,
    /// Seconds between autoclaim passes.
    #[arg(long, default_value_t = 30)]
    reclaim_interval: u64,
}

fn main() -> anyhow::Result<()> {
    // Dispatch the warm-child mode before anything else: the child must not
    // inherit a runtime, a logger, or the worker CLI surface.
    let mut raw_args = std::env::args().skip(1);
    if raw_args.next().as_deref() == Some("warm-child") {
        let preload_tensor = raw_args.any(|arg| arg == "--preload-tensor");
        std::process::exit(judge_executor::run_warm_child(preload_tensor));
    }

    let cli = Cli::parse();
    init_tracing();

    let settings = Settings::from_env()?;
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    runtime.block_on(async move {
        let worker = Worker::build(
            settings,
            WorkerArgs {
                stream: cli.stream,
                group: cli.group,
                consumer: cli.consumer,
                reclaim_interval_s: cli.reclaim_interval,
            },
        )
        .await?;
        worker.run().await
    })
}

fn init_tracing() {
    let default_level = "info";
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(default_level))
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(env_filter);
    let _ = tracing_subscriber::registry().with(fmt_layer).try_init();
}
