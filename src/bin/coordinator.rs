use clap::Parser;
use crawlhub::catalog::load_catalog;
use crawlhub::config::CrawlConfig;
use crawlhub::coordinator::Coordinator;
use crawlhub::export::{ExportSink, JsonFileSink};
use crawlhub::server::serve;
use crawlhub::shutdown::Shutdown;
use crawlhub::{init_tracing, CrawlError};
use dotenv::dotenv;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "coordinator")]
#[command(about = "Hands out crawl jobs to workers and merges their results", long_about = None)]
struct Cli {
    /// Catalog file: a JSON array or JSON lines of {entity_key, keyword?, descriptor?}
    #[arg(long)]
    catalog: PathBuf,
    #[arg(long, env = "CRAWL_BIND", default_value = "0.0.0.0:8080")]
    bind: String,
    /// Overrides CRAWL_STATE_DIR
    #[arg(long)]
    state_dir: Option<PathBuf>,
    /// Where the merged dataset is written on exit (default: <state_dir>/export.json)
    #[arg(long)]
    export_path: Option<PathBuf>,
    #[arg(long)]
    lease_ttl_secs: Option<u64>,
    #[arg(long)]
    max_attempts: Option<u32>,
    /// Keep serving after every job finished
    #[arg(long)]
    keep_running: bool,
    /// Seconds to keep answering after completion so idle workers learn the crawl is over
    #[arg(long, default_value_t = 5)]
    linger_secs: u64,
}

#[tokio::main]
async fn main() -> Result<(), CrawlError> {
    dotenv().ok();
    init_tracing("coordinator");
    let cli = Cli::parse();

    let mut config = CrawlConfig::from_env()?;
    if let Some(dir) = cli.state_dir {
        config.state_dir = dir;
    }
    if let Some(secs) = cli.lease_ttl_secs {
        config.lease_ttl = Duration::from_secs(secs);
    }
    if let Some(n) = cli.max_attempts {
        config.max_attempts = n;
    }
    config.validate()?;
    let export_path = cli
        .export_path
        .unwrap_or_else(|| config.state_dir.join("export.json"));

    let catalog = load_catalog(&cli.catalog)?;
    tracing::info!(entries = catalog.len(), path = %cli.catalog.display(), "catalog read");
    let coordinator = Coordinator::start(config, catalog)?;
    let shutdown = Arc::new(Shutdown::new());

    let listener = TcpListener::bind(&cli.bind).await?;
    let server = tokio::spawn(serve(listener, coordinator.clone(), shutdown.clone()));
    let maintenance = tokio::spawn({
        let coordinator = coordinator.clone();
        let shutdown = shutdown.clone();
        async move {
            let result = coordinator.run_maintenance(shutdown.clone()).await;
            if let Err(e) = &result {
                tracing::error!(error = %e, "maintenance failed, shutting down");
                shutdown.trigger();
            }
            result
        }
    });

    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("interrupt received, shutting down");
                shutdown.trigger();
            }
        }
    });

    if cli.keep_running {
        shutdown.wait().await;
    } else {
        let mut stats = coordinator.subscribe_stats();
        let finished = async {
            loop {
                if coordinator.is_complete().await {
                    break;
                }
                if stats.changed().await.is_err() {
                    break;
                }
            }
        };
        tokio::select! {
            _ = shutdown.wait() => {}
            _ = finished => {
                tracing::info!(linger_secs = cli.linger_secs, "all jobs finished");
                tokio::select! {
                    _ = shutdown.wait() => {}
                    _ = tokio::time::sleep(Duration::from_secs(cli.linger_secs)) => {}
                }
                shutdown.trigger();
            }
        }
    }

    // Requests still draining after the final checkpoint are refused by the coordinator.
    let served = server
        .await
        .map_err(|e| CrawlError::Other(format!("server task failed: {}", e)))?;
    maintenance
        .await
        .map_err(|e| CrawlError::Other(format!("maintenance task failed: {}", e)))??;
    served?;

    let entities = coordinator.export().await;
    let written = JsonFileSink::new(export_path.clone()).write(&entities)?;

    let stats = coordinator.get_stats();
    println!("[coordinator] done={} failed={} pending={} leased={} total={}",
             stats.done, stats.failed, stats.pending, stats.leased, stats.total);
    println!("[coordinator] exported {} entities to {}", written, export_path.display());
    Ok(())
}
