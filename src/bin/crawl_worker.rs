use clap::Parser;
use crawlhub::client::HttpCoordinatorClient;
use crawlhub::config::CrawlConfig;
use crawlhub::executor::CommandExecutor;
use crawlhub::shutdown::Shutdown;
use crawlhub::worker::{run_pool, WorkerSettings};
use crawlhub::{init_tracing, CrawlError};
use dotenv::dotenv;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "crawl_worker")]
#[command(about = "Runs crawl jobs leased from a coordinator", long_about = None)]
struct Cli {
    #[arg(long, env = "CRAWL_COORDINATOR_URL", default_value = "http://127.0.0.1:8080")]
    coordinator: String,
    /// Concurrent execution slots in this process
    #[arg(long, default_value_t = 1)]
    workers: usize,
    /// Prefix for worker ids (default: <hostname>-<pid>)
    #[arg(long)]
    worker_prefix: Option<String>,
    #[arg(long)]
    executor_timeout_secs: Option<u64>,
    /// Executor program and its arguments; receives the job descriptor as JSON on stdin
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<(), CrawlError> {
    dotenv().ok();
    init_tracing("crawl_worker");
    let cli = Cli::parse();

    let config = CrawlConfig::from_env()?;
    let mut settings = WorkerSettings::from(&config);
    if let Some(secs) = cli.executor_timeout_secs {
        settings.executor_timeout = Duration::from_secs(secs);
    }

    let (program, args) = match cli.command.split_first() {
        Some((program, args)) => (program.clone(), args.to_vec()),
        None => return Err(CrawlError::Config("executor command is required".to_string())),
    };
    let executor = Arc::new(CommandExecutor::new(program, args));

    let client = Arc::new(HttpCoordinatorClient::new(&cli.coordinator, config.request_timeout)?);
    let health = client.health().await?;
    tracing::info!(coordinator = client.base_url(), status = %health.status, "coordinator reachable");

    let prefix = cli.worker_prefix.unwrap_or_else(|| {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "worker".to_string());
        format!("{}-{}", host, std::process::id())
    });

    let shutdown = Arc::new(Shutdown::new());
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, finishing current jobs");
                shutdown.trigger();
            }
        }
    });

    let summaries = run_pool(client, executor, settings, cli.workers, &prefix, shutdown).await;

    println!("{:<24} {:>10} {:>8} {:>10} {:>12}", "worker", "completed", "failed", "rejected", "net errors");
    for s in &summaries {
        println!(
            "{:<24} {:>10} {:>8} {:>10} {:>12}",
            s.worker_id, s.completed, s.failed, s.rejected, s.transport_errors
        );
    }
    Ok(())
}
