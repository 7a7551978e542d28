use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Consumer};
use tokio::sync::{Mutex, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use super::state::signalled;
use super::{DeliveryHandler, Queue, QueueError};

/// A received message that still has to be settled with the broker.
#[async_trait]
pub(crate) trait InboundMessage: Send + 'static {
    fn message_id(&self) -> String;
    fn body(&self) -> &[u8];
    async fn ack(self) -> Result<(), QueueError>;
    async fn requeue(self) -> Result<(), QueueError>;
}

#[async_trait]
impl InboundMessage for Delivery {
    fn message_id(&self) -> String {
        self.properties
            .message_id()
            .as_ref()
            .map(|id| id.as_str().to_string())
            .unwrap_or_default()
    }

    fn body(&self) -> &[u8] {
        &self.data
    }

    async fn ack(self) -> Result<(), QueueError> {
        self.acker.ack(BasicAckOptions::default()).await?;
        Ok(())
    }

    async fn requeue(self) -> Result<(), QueueError> {
        self.acker
            .nack(BasicNackOptions {
                multiple: false,
                requeue: true,
            })
            .await?;
        Ok(())
    }
}

/// Starts `concurrency` workers sharing one receiver. Each worker exits once
/// the sender side is dropped and the buffer is drained.
pub(crate) fn spawn_workers<M: InboundMessage>(
    deliveries: mpsc::Receiver<M>,
    handler: Arc<dyn DeliveryHandler>,
    concurrency: usize,
) -> Vec<JoinHandle<()>> {
    let deliveries = Arc::new(Mutex::new(deliveries));
    (0..concurrency)
        .map(|worker| {
            let deliveries = Arc::clone(&deliveries);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                loop {
                    let next = deliveries.lock().await.recv().await;
                    let Some(message) = next else {
                        break;
                    };

                    let message_id = message.message_id();
                    let settled = if handler.handle(&message_id, message.body()).await {
                        message.ack().await
                    } else {
                        message.requeue().await
                    };
                    if let Err(e) = settled {
                        error!(worker, %message_id, error = %e, "Failed to settle delivery");
                    }
                }
            })
        })
        .collect()
}

async fn subscribe(channel: &Channel, queue: &str, prefetch: u16) -> Result<Consumer, QueueError> {
    channel
        .basic_qos(prefetch, BasicQosOptions::default())
        .await?;
    let consumer = channel
        .basic_consume(
            queue,
            "",
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await?;
    Ok(consumer)
}

/// Subscribes on every new channel the supervisor brings up and forwards
/// deliveries to the worker pool until stopped.
pub(crate) async fn pump(
    queue: Arc<Queue>,
    deliveries: mpsc::Sender<Delivery>,
    mut stop: watch::Receiver<bool>,
    prefetch: u16,
) {
    let mut generation = 0;
    'channels: loop {
        let next = tokio::select! {
            _ = signalled(&mut stop) => break,
            next = queue.channel_after(generation) => next,
        };
        let Ok((channel_generation, channel)) = next else {
            break;
        };

        let mut consumer = match subscribe(&channel, queue.name(), prefetch).await {
            Ok(consumer) => consumer,
            Err(e) => {
                warn!(error = %e, "Failed to subscribe to queue, retrying");
                tokio::select! {
                    _ = signalled(&mut stop) => break,
                    _ = tokio::time::sleep(queue.reinit_delay()) => {}
                }
                continue;
            }
        };
        generation = channel_generation;
        info!(generation, prefetch, "Consuming from queue");

        loop {
            let item = tokio::select! {
                _ = signalled(&mut stop) => break 'channels,
                item = consumer.next() => item,
            };
            match item {
                Some(Ok(delivery)) => {
                    tokio::select! {
                        _ = signalled(&mut stop) => break 'channels,
                        sent = deliveries.send(delivery) => {
                            if sent.is_err() {
                                break 'channels;
                            }
                        }
                    }
                }
                Some(Err(e)) => {
                    warn!(error = %e, "Delivery stream failed, waiting for a new channel");
                    break;
                }
                None => {
                    warn!("Delivery stream ended, waiting for a new channel");
                    break;
                }
            }
        }
    }
    info!("Consumer pump stopped");
}

/// Running consumer. Dropping it leaves the tasks running; call
/// [`ConsumerHandle::shutdown`] to stop.
pub struct ConsumerHandle {
    pub(crate) stop: watch::Sender<bool>,
    pub(crate) pump: JoinHandle<()>,
    pub(crate) workers: Vec<JoinHandle<()>>,
}

impl ConsumerHandle {
    /// Stops pulling deliveries and waits for in-flight handlers to finish.
    pub async fn shutdown(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.pump.await {
            error!(error = %e, "Consumer pump task failed");
        }
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "Consumer worker task failed");
            }
        }
        info!("Consumer stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Settled {
        Ack(String),
        Requeue(String),
    }

    struct FakeMessage {
        id: String,
        body: Vec<u8>,
        log: Arc<StdMutex<Vec<Settled>>>,
    }

    #[async_trait]
    impl InboundMessage for FakeMessage {
        fn message_id(&self) -> String {
            self.id.clone()
        }

        fn body(&self) -> &[u8] {
            &self.body
        }

        async fn ack(self) -> Result<(), QueueError> {
            self.log.lock().unwrap().push(Settled::Ack(self.id));
            Ok(())
        }

        async fn requeue(self) -> Result<(), QueueError> {
            self.log.lock().unwrap().push(Settled::Requeue(self.id));
            Ok(())
        }
    }

    /// Accepts bodies equal to "ok", after a short pause so work overlaps.
    struct SlowHandler {
        in_flight: std::sync::atomic::AtomicUsize,
        peak: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl DeliveryHandler for SlowHandler {
        async fn handle(&self, _message_id: &str, payload: &[u8]) -> bool {
            use std::sync::atomic::Ordering;
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            payload == b"ok"
        }
    }

    #[tokio::test]
    async fn workers_ack_success_and_requeue_failure() {
        let log = Arc::new(StdMutex::new(Vec::new()));
        let handler = Arc::new(SlowHandler {
            in_flight: Default::default(),
            peak: Default::default(),
        });
        let (tx, rx) = mpsc::channel(4);
        let workers = spawn_workers(rx, handler.clone(), 4);

        for i in 0..8 {
            let body = if i % 2 == 0 { b"ok".to_vec() } else { b"bad".to_vec() };
            tx.send(FakeMessage {
                id: format!("m-{i}"),
                body,
                log: log.clone(),
            })
            .await
            .unwrap();
        }
        drop(tx);
        for worker in workers {
            worker.await.unwrap();
        }

        let log = log.lock().unwrap();
        assert_eq!(log.len(), 8);
        assert!(log.contains(&Settled::Ack("m-0".to_string())));
        assert!(log.contains(&Settled::Requeue("m-1".to_string())));
        let acks = log.iter().filter(|s| matches!(s, Settled::Ack(_))).count();
        assert_eq!(acks, 4);

        let peak = handler.peak.load(std::sync::atomic::Ordering::SeqCst);
        assert!(peak > 1, "handlers should overlap, peak was {peak}");
        assert!(peak <= 4);
    }
}
