//! Durable notification queue on top of a single AMQP connection.
//!
//! A supervisor task owns the connection and channel and republishes them
//! through a `watch` channel after every reconnect. Publishers wait on that
//! channel; the consumer pump resubscribes whenever a new channel appears.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use lapin::options::BasicPublishOptions;
use lapin::publisher_confirm::{Confirmation, PublisherConfirm};
use lapin::{BasicProperties, Channel};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::RabbitMqConfig;

mod consumer;
mod state;

pub use consumer::ConsumerHandle;
pub use state::ConnectionState;

use state::{Link, Supervisor, signalled};

const DELIVERY_MODE_PERSISTENT: u8 = 2;

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("AMQP error: {0}")]
    Amqp(#[from] lapin::Error),
    #[error("Queue is shutting down")]
    ShuttingDown,
    #[error("Publish confirmation timed out after {0:?}")]
    PublishTimeout(Duration),
    #[error("Publish nacked by broker for message {0}")]
    Nacked(String),
    #[error("Publisher confirms are not enabled on the channel")]
    ConfirmsDisabled,
    #[error("Queue supervisor failed: {0}")]
    Supervisor(String),
}

/// Publishes a batch and only returns `Ok` once the broker confirmed every message.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish_batch(&self, messages: Vec<Vec<u8>>) -> Result<(), QueueError>;
}

/// Processes one delivery. `true` acks it, `false` requeues it.
#[async_trait]
pub trait DeliveryHandler: Send + Sync {
    async fn handle(&self, message_id: &str, payload: &[u8]) -> bool;
}

pub struct Queue {
    config: RabbitMqConfig,
    link: watch::Receiver<Link>,
    done: watch::Sender<bool>,
    publish_lock: Mutex<()>,
    supervisor: StdMutex<Option<JoinHandle<Result<(), QueueError>>>>,
}

impl Queue {
    /// Starts the connection supervisor and returns immediately.
    pub fn connect(config: RabbitMqConfig) -> Arc<Self> {
        let (link_tx, link_rx) = watch::channel(Link::initial());
        let (done_tx, done_rx) = watch::channel(false);

        let supervisor = Supervisor::new(config.clone(), link_tx, done_rx);
        let handle = tokio::spawn(supervisor.run());

        Arc::new(Self {
            config,
            link: link_rx,
            done: done_tx,
            publish_lock: Mutex::new(()),
            supervisor: StdMutex::new(Some(handle)),
        })
    }

    pub fn state(&self) -> ConnectionState {
        self.link.borrow().state
    }

    pub fn name(&self) -> &str {
        &self.config.queue
    }

    pub(crate) fn reinit_delay(&self) -> Duration {
        self.config.reinit_delay
    }

    /// Waits until a channel is usable. Fails only on shutdown.
    pub async fn wait_connected(&self) -> Result<(), QueueError> {
        self.channel_after(0).await.map(|_| ())
    }

    /// Waits for a connected channel newer than `generation`.
    pub(crate) async fn channel_after(&self, generation: u64) -> Result<(u64, Channel), QueueError> {
        let mut link = self.link.clone();
        let mut done = self.done.subscribe();
        loop {
            if *done.borrow() {
                return Err(QueueError::ShuttingDown);
            }
            {
                let current = link.borrow_and_update();
                if current.state == ConnectionState::Connected && current.generation > generation {
                    if let Some(channel) = &current.channel {
                        return Ok((current.generation, channel.clone()));
                    }
                }
            }
            tokio::select! {
                changed = link.changed() => {
                    if changed.is_err() {
                        return Err(QueueError::ShuttingDown);
                    }
                }
                _ = signalled(&mut done) => {}
            }
        }
    }

    /// Registers `handler` and starts `concurrency` workers. Prefetch is twice
    /// the worker count so idle workers always find buffered deliveries.
    pub fn consume(
        self: &Arc<Self>,
        handler: Arc<dyn DeliveryHandler>,
        concurrency: usize,
    ) -> ConsumerHandle {
        let concurrency = concurrency.max(1);
        let prefetch = u16::try_from(concurrency.saturating_mul(2)).unwrap_or(u16::MAX);

        let (tx, rx) = mpsc::channel(concurrency);
        let workers = consumer::spawn_workers(rx, handler, concurrency);
        let (stop_tx, stop_rx) = watch::channel(false);
        let pump = tokio::spawn(consumer::pump(Arc::clone(self), tx, stop_rx, prefetch));

        ConsumerHandle {
            stop: stop_tx,
            pump,
            workers,
        }
    }

    /// Sets the done signal without waiting for the supervisor. Blocked
    /// publishers and waiters return `ShuttingDown`.
    pub fn shutdown(&self) {
        self.done.send_replace(true);
    }

    /// Signals shutdown first, then lets the supervisor close the channel and
    /// the connection. Returns the first close error.
    pub async fn close(&self) -> Result<(), QueueError> {
        self.shutdown();
        let handle = self.supervisor.lock().ok().and_then(|mut guard| guard.take());
        match handle {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(QueueError::Supervisor(e.to_string())),
            },
            None => Ok(()),
        }
    }

    async fn publish_one(&self, body: &[u8], message_id: &str) -> Result<PublisherConfirm, QueueError> {
        let mut done = self.done.subscribe();
        loop {
            let (_, channel) = self.channel_after(0).await?;
            let properties = BasicProperties::default()
                .with_content_type("application/json".to_string().into())
                .with_delivery_mode(DELIVERY_MODE_PERSISTENT)
                .with_message_id(message_id.to_string().into());

            match channel
                .basic_publish(
                    "",
                    &self.config.queue,
                    BasicPublishOptions::default(),
                    body,
                    properties,
                )
                .await
            {
                Ok(confirm) => return Ok(confirm),
                Err(e) => {
                    warn!(message_id, error = %e, "Publish failed, retrying");
                    tokio::select! {
                        _ = signalled(&mut done) => return Err(QueueError::ShuttingDown),
                        _ = tokio::time::sleep(self.config.publish_retry_delay) => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Publisher for Queue {
    async fn publish_batch(&self, messages: Vec<Vec<u8>>) -> Result<(), QueueError> {
        let _serialized = self.publish_lock.lock().await;

        let mut pending = Vec::with_capacity(messages.len());
        for body in &messages {
            let message_id = Uuid::new_v4().to_string();
            let confirm = self.publish_one(body, &message_id).await?;
            pending.push((message_id, confirm));
        }

        let timeout = self.config.publish_timeout;
        let confirmations = async {
            for (message_id, confirm) in pending {
                match confirm.await? {
                    Confirmation::Ack(_) => debug!(%message_id, "Publish confirmed"),
                    Confirmation::Nack(_) => {
                        error!(%message_id, "Publish nacked by broker");
                        return Err(QueueError::Nacked(message_id));
                    }
                    Confirmation::NotRequested => return Err(QueueError::ConfirmsDisabled),
                }
            }
            Ok::<(), QueueError>(())
        };

        tokio::time::timeout(timeout, confirmations)
            .await
            .map_err(|_| QueueError::PublishTimeout(timeout))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_config() -> RabbitMqConfig {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        RabbitMqConfig {
            host: "127.0.0.1".to_string(),
            port,
            user: "guest".to_string(),
            password: "guest".to_string(),
            queue: "notifications".to_string(),
            publish_timeout: Duration::from_secs(5),
            reconnect_delay: Duration::from_millis(50),
            reinit_delay: Duration::from_millis(50),
            publish_retry_delay: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn close_unblocks_waiters_without_broker() {
        let queue = Queue::connect(unreachable_config());
        assert_ne!(queue.state(), ConnectionState::Connected);

        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.wait_connected().await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        tokio::time::timeout(Duration::from_secs(5), queue.close())
            .await
            .expect("close should finish")
            .unwrap();

        let waited = tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .expect("waiter should finish")
            .unwrap();
        assert!(matches!(waited, Err(QueueError::ShuttingDown)));
        assert_eq!(queue.state(), ConnectionState::Closed);

        let published = queue.publish_batch(vec![b"{}".to_vec()]).await;
        assert!(matches!(published, Err(QueueError::ShuttingDown)));
    }

    #[tokio::test]
    async fn shutdown_releases_publish_blocked_on_missing_broker() {
        let mut config = unreachable_config();
        config.publish_timeout = Duration::from_millis(200);
        let queue = Queue::connect(config);

        let publish = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.publish_batch(vec![b"{}".to_vec()]).await })
        };

        // the confirm timeout does not apply while no channel exists
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!publish.is_finished());

        queue.shutdown();
        let published = tokio::time::timeout(Duration::from_secs(3), publish)
            .await
            .expect("publish should return after shutdown")
            .unwrap();
        assert!(matches!(published, Err(QueueError::ShuttingDown)));

        tokio::time::timeout(Duration::from_secs(5), queue.close())
            .await
            .expect("close should finish")
            .unwrap();
    }
}
