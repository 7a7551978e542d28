use std::sync::Arc;

use clap::Parser;
use pulsewatch::config::AppConfig;
use pulsewatch::logging::init_logging;
use pulsewatch::poller::Poller;
use pulsewatch::queue::Queue;
use pulsewatch::shutdown::shutdown_signal;
use pulsewatch::version::VERSION;
use pulsewatch::db;
use tokio::sync::watch;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about = "Expires silent checks and publishes flip notifications", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let config = AppConfig::load(args.config.as_deref())?;
    let _log_guard = init_logging(&config.log_dir, "poller.log");
    info!("Starting poller, version: {}", VERSION);

    let pool = db::connect(config.database()?).await.map_err(|e| {
        error!(error = %e, "Failed to connect to the database");
        e
    })?;

    let queue = Queue::connect(config.rabbitmq()?.clone());
    tokio::select! {
        connected = queue.wait_connected() => connected?,
        _ = shutdown_signal() => {
            queue.close().await?;
            pool.close().await;
            return Ok(());
        }
    }
    info!(queue = queue.name(), "Connected to RabbitMQ");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let poller = Poller::new(pool.clone(), Arc::clone(&queue), config.poller.interval);
    let poller_task = tokio::spawn(async move { poller.run(shutdown_rx).await });

    shutdown_signal().await;
    shutdown_tx.send_replace(true);
    // a tick stuck publishing to a missing broker rolls back instead of hanging
    queue.shutdown();
    if let Err(e) = poller_task.await {
        error!(error = %e, "Poller task failed");
    }

    info!("Shutting down...");
    if let Err(e) = queue.close().await {
        error!(error = %e, "Queue shutdown failed");
    }
    pool.close().await;
    info!("Shutdown complete");
    Ok(())
}
