use std::sync::Arc;

use clap::Parser;
use pulsewatch::config::AppConfig;
use pulsewatch::logging::init_logging;
use pulsewatch::notifications::Notifier;
use pulsewatch::notifications::senders::{HttpWebhookSender, MailjetSender};
use pulsewatch::queue::Queue;
use pulsewatch::shutdown::shutdown_signal;
use pulsewatch::version::VERSION;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(author, version = VERSION, about = "Delivers queued flip notifications by email and webhook", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let args = Args::parse();

    let config = AppConfig::load(args.config.as_deref())?;
    let _log_guard = init_logging(&config.log_dir, "notifier.log");
    info!("Starting notifier, version: {}", VERSION);

    let settings = &config.notifier;
    let email = MailjetSender::new(config.mailjet()?, settings.http_timeout)?;
    let webhooks = HttpWebhookSender::new(settings.http_timeout, settings.webhook_attempts)?;
    let notifier = Arc::new(Notifier::new(Arc::new(email), Arc::new(webhooks)));

    let queue = Queue::connect(config.rabbitmq()?.clone());
    let consumer = queue.consume(notifier, settings.concurrency);
    info!(concurrency = settings.concurrency, queue = queue.name(), "Notifier consuming");

    shutdown_signal().await;
    info!("Shutting down...");
    consumer.shutdown().await;
    if let Err(e) = queue.close().await {
        error!(error = %e, "Queue shutdown failed");
    }
    info!("Shutdown complete");
    Ok(())
}
