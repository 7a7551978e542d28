use std::time::Duration;

use lapin::options::{ConfirmSelectOptions, QueueDeclareOptions};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tokio::sync::{mpsc, watch};
use tracing::{info, warn};

use super::QueueError;
use crate::config::RabbitMqConfig;

const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ChannelBroken,
    Reinitializing,
    Closed,
}

/// What the supervisor publishes to publishers and the consumer pump.
/// `generation` grows by one for every channel that reaches `Connected`.
#[derive(Clone)]
pub(crate) struct Link {
    pub state: ConnectionState,
    pub channel: Option<Channel>,
    pub generation: u64,
}

impl Link {
    pub(crate) fn initial() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            channel: None,
            generation: 0,
        }
    }
}

enum LinkEvent {
    Done,
    ConnectionLost(String),
    ChannelLost(String),
}

enum Outcome {
    Shutdown(Result<(), QueueError>),
    ConnectionLost,
}

/// Resolves once `done` is set or its sender is gone.
pub(crate) async fn signalled(done: &mut watch::Receiver<bool>) {
    let _ = done.wait_for(|d| *d).await;
}

/// Owns the broker connection. Reconnects after connection loss, reopens the
/// channel after channel loss, and closes both once `done` is set.
pub(crate) struct Supervisor {
    config: RabbitMqConfig,
    link: watch::Sender<Link>,
    done: watch::Receiver<bool>,
    generation: u64,
}

impl Supervisor {
    pub(crate) fn new(
        config: RabbitMqConfig,
        link: watch::Sender<Link>,
        done: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            link,
            done,
            generation: 0,
        }
    }

    pub(crate) async fn run(mut self) -> Result<(), QueueError> {
        let url = self.config.amqp_url();
        let result = loop {
            if self.is_done() {
                break Ok(());
            }

            self.publish(ConnectionState::Connecting, None);
            info!(host = %self.config.host, port = self.config.port, "Attempting to connect to RabbitMQ");

            let connection = match Connection::connect(&url, ConnectionProperties::default()).await {
                Ok(connection) => connection,
                Err(e) => {
                    warn!(error = %e, "Failed to connect to RabbitMQ, retrying");
                    self.publish(ConnectionState::Disconnected, None);
                    if self.sleep_or_done(self.config.reconnect_delay).await {
                        break Ok(());
                    }
                    continue;
                }
            };

            if self.is_done() {
                break close(&connection, None).await;
            }

            match self.maintain(&connection).await {
                Outcome::Shutdown(result) => break result,
                Outcome::ConnectionLost => {
                    self.publish(ConnectionState::Disconnected, None);
                    if self.sleep_or_done(self.config.reconnect_delay).await {
                        break Ok(());
                    }
                }
            }
        };

        self.publish(ConnectionState::Closed, None);
        info!("Queue supervisor stopped");
        result
    }

    /// Keeps a channel open on `connection` until the connection dies or
    /// shutdown is requested.
    async fn maintain(&mut self, connection: &Connection) -> Outcome {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let tx = events_tx.clone();
        connection.on_error(move |e| {
            let _ = tx.send(LinkEvent::ConnectionLost(e.to_string()));
        });

        loop {
            let channel = match self.open_channel(connection).await {
                Ok(channel) => channel,
                Err(e) => {
                    warn!(error = %e, "Failed to initialize channel, retrying");
                    if !connection.status().connected() {
                        return Outcome::ConnectionLost;
                    }
                    if self.sleep_or_done(self.config.reinit_delay).await {
                        return Outcome::Shutdown(close(connection, None).await);
                    }
                    self.publish(ConnectionState::Reinitializing, None);
                    continue;
                }
            };

            let tx = events_tx.clone();
            channel.on_error(move |e| {
                let _ = tx.send(LinkEvent::ChannelLost(e.to_string()));
            });

            self.generation += 1;
            self.publish(ConnectionState::Connected, Some(channel.clone()));
            info!(generation = self.generation, queue = %self.config.queue, "Queue channel ready");

            match self.wait_for_event(connection, &channel, &mut events_rx).await {
                LinkEvent::Done => {
                    return Outcome::Shutdown(close(connection, Some(&channel)).await);
                }
                LinkEvent::ConnectionLost(reason) => {
                    warn!(%reason, "RabbitMQ connection lost");
                    return Outcome::ConnectionLost;
                }
                LinkEvent::ChannelLost(reason) => {
                    warn!(%reason, "RabbitMQ channel closed, reinitializing");
                    self.publish(ConnectionState::ChannelBroken, None);
                    if !connection.status().connected() {
                        return Outcome::ConnectionLost;
                    }
                    if self.sleep_or_done(self.config.reinit_delay).await {
                        return Outcome::Shutdown(close(connection, None).await);
                    }
                    self.publish(ConnectionState::Reinitializing, None);
                }
            }
        }
    }

    async fn open_channel(&self, connection: &Connection) -> Result<Channel, QueueError> {
        let channel = connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .queue_declare(
                &self.config.queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(channel)
    }

    async fn wait_for_event(
        &mut self,
        connection: &Connection,
        channel: &Channel,
        events: &mut mpsc::UnboundedReceiver<LinkEvent>,
    ) -> LinkEvent {
        let mut ticker = tokio::time::interval(STATUS_POLL_INTERVAL);
        loop {
            tokio::select! {
                _ = signalled(&mut self.done) => return LinkEvent::Done,
                Some(event) = events.recv() => return event,
                _ = ticker.tick() => {
                    if !connection.status().connected() {
                        return LinkEvent::ConnectionLost("connection is no longer connected".to_string());
                    }
                    if !channel.status().connected() {
                        return LinkEvent::ChannelLost("channel is no longer connected".to_string());
                    }
                }
            }
        }
    }

    fn is_done(&self) -> bool {
        *self.done.borrow()
    }

    /// Returns true if shutdown was requested before the delay elapsed.
    async fn sleep_or_done(&mut self, delay: Duration) -> bool {
        tokio::select! {
            _ = signalled(&mut self.done) => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    fn publish(&self, state: ConnectionState, channel: Option<Channel>) {
        self.link.send_replace(Link {
            state,
            channel,
            generation: self.generation,
        });
    }
}

/// Closes the channel, then the connection. Both are attempted; the first
/// error wins.
async fn close(connection: &Connection, channel: Option<&Channel>) -> Result<(), QueueError> {
    let mut result = Ok(());
    if let Some(channel) = channel {
        if let Err(e) = channel.close(200, "shutdown").await {
            result = Err(QueueError::Amqp(e));
        }
    }
    if let Err(e) = connection.close(200, "shutdown").await {
        if result.is_ok() {
            result = Err(QueueError::Amqp(e));
        }
    }
    result
}
