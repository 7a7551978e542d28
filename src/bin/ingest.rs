use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use pulsewatch::config::AppConfig;
use pulsewatch::db;
use pulsewatch::lifecycle::LifecycleService;
use pulsewatch::logging::init_logging;
use pulsewatch::shutdown::shutdown_signal;
use pulsewatch::version::VERSION;
use pulsewatch::web::{AppState, create_router};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about = "Accepts pings over HTTP", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let config = AppConfig::load(args.config.as_deref())?;
    let _log_guard = init_logging(&config.log_dir, "ingest.log");
    info!("Starting ping ingest, version: {}", VERSION);

    let pool = db::connect(config.database()?).await?;
    let state = Arc::new(AppState {
        recorder: Arc::new(LifecycleService::new(pool.clone())),
        max_body_bytes: config.ingest.max_body_bytes,
    });
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(&config.ingest.listen_address).await?;
    info!("Ping ingest listening on {}", listener.local_addr()?);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    pool.close().await;
    info!("Shutdown complete");
    Ok(())
}
