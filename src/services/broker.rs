use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicQosOptions,
        BasicRejectOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    Channel, Connection, ConnectionProperties,
};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::services::pipeline::{self, Disposition};
use crate::worker_state::WorkerState;

/// Unacknowledged deliveries allowed per consumer.
const PREFETCH_COUNT: u16 = 1;

/// Open the broker connection, retrying with a fixed delay. The last
/// attempt's error is returned once `max_attempts` is exhausted.
pub async fn connect(config: &BrokerConfig) -> Result<Connection, BrokerError> {
    let uri = config.amqp_uri();
    let connection = retry_with_delay(
        config.connect_max_attempts,
        config.retry_delay(),
        || Connection::connect_uri(uri.clone(), ConnectionProperties::default()),
    )
    .await
    .map_err(|(attempts, source)| BrokerError::ConnectionExhausted { attempts, source })?;

    tracing::info!(host = %config.host, port = config.port, "Connected to RabbitMQ");
    Ok(connection)
}

/// Run `attempt` up to `max_attempts` times, sleeping `delay` between tries.
pub async fn retry_with_delay<T, E, F, Fut>(
    max_attempts: u32,
    delay: Duration,
    mut attempt: F,
) -> Result<T, (u32, E)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = max_attempts.max(1);
    let mut n = 1;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(e) if n >= max_attempts => {
                tracing::error!(attempt = n, max_attempts, error = %e, "Giving up connecting to broker");
                return Err((n, e));
            }
            Err(e) => {
                tracing::warn!(attempt = n, max_attempts, error = %e, "Broker connection attempt failed");
                tokio::time::sleep(delay).await;
                n += 1;
            }
        }
    }
}

/// Settles a single delivery with the broker.
#[async_trait]
pub trait Settle: Send + Sync {
    async fn ack(&self) -> Result<(), lapin::Error>;
    async fn reject(&self) -> Result<(), lapin::Error>;
}

#[async_trait]
impl Settle for Acker {
    async fn ack(&self) -> Result<(), lapin::Error> {
        Acker::ack(self, BasicAckOptions::default()).await
    }

    async fn reject(&self) -> Result<(), lapin::Error> {
        Acker::reject(self, BasicRejectOptions { requeue: false }).await
    }
}

/// Delivery counters reported when the consumer stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub delivered: u64,
    pub acked: u64,
    pub rejected: u64,
}

/// Execute the pipeline for one delivery and settle it: ack on success,
/// reject without requeue on any failure.
pub async fn handle_delivery<S: Settle + ?Sized>(
    state: &WorkerState,
    body: &[u8],
    settler: &S,
) -> Result<Disposition, BrokerError> {
    let disposition = pipeline::execute(state, body).await.disposition();
    match disposition {
        Disposition::Ack => settler.ack().await.map_err(BrokerError::Acknowledge)?,
        Disposition::Reject => settler.reject().await.map_err(BrokerError::Acknowledge)?,
    }
    Ok(disposition)
}

/// Consume `queue` one delivery at a time until `shutdown` resolves.
///
/// `shutdown` is only observed between deliveries, so an in-flight job always
/// runs to completion and is settled before this returns.
pub async fn consume(
    connection: &Connection,
    queue: &str,
    state: &WorkerState,
    shutdown: impl Future<Output = ()>,
) -> Result<ConsumeStats, BrokerError> {
    let channel = connection
        .create_channel()
        .await
        .map_err(BrokerError::Channel)?;

    declare_queue(&channel, queue).await?;

    channel
        .basic_qos(PREFETCH_COUNT, BasicQosOptions::default())
        .await
        .map_err(BrokerError::Qos)?;

    let consumer_tag = format!("cell-worker-{}", Uuid::new_v4());
    let consumer = channel
        .basic_consume(
            queue,
            &consumer_tag,
            BasicConsumeOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(BrokerError::Consume)?;

    tracing::info!(queue, consumer_tag = %consumer_tag, "Worker ready, waiting for messages");

    let deliveries = consumer.map(|next| next.map(|delivery| (delivery.data, delivery.acker)));
    let stats = run_consumer(deliveries, state, shutdown).await?;

    if let Err(e) = channel
        .basic_cancel(&consumer_tag, BasicCancelOptions::default())
        .await
    {
        tracing::warn!(error = %e, "Failed to cancel consumer");
    }
    if let Err(e) = channel.close(200, "worker shutdown").await {
        tracing::warn!(error = %e, "Failed to close channel");
    }

    Ok(stats)
}

/// Drive `deliveries` through the pipeline one at a time until `shutdown`
/// resolves. Each item is a message body and the handle that settles it.
///
/// `shutdown` is checked before each pull, never while a delivery is being
/// handled. A failed or finished stream is an error: the broker only ends a
/// consumer when the channel or connection goes away.
pub async fn run_consumer<St, S>(
    deliveries: St,
    state: &WorkerState,
    shutdown: impl Future<Output = ()>,
) -> Result<ConsumeStats, BrokerError>
where
    St: Stream<Item = Result<(Vec<u8>, S), lapin::Error>>,
    S: Settle,
{
    let mut stats = ConsumeStats::default();
    tokio::pin!(deliveries);
    tokio::pin!(shutdown);

    loop {
        let next = tokio::select! {
            biased;
            _ = &mut shutdown => {
                tracing::info!("Stop requested, no longer accepting deliveries");
                return Ok(stats);
            }
            next = deliveries.next() => next,
        };

        let (body, settler) = match next {
            Some(Ok(delivery)) => delivery,
            Some(Err(e)) => return Err(BrokerError::Delivery(e)),
            None => return Err(BrokerError::ConsumerClosed),
        };

        stats.delivered += 1;
        match handle_delivery(state, &body, &settler).await? {
            Disposition::Ack => stats.acked += 1,
            Disposition::Reject => stats.rejected += 1,
        }
    }
}

/// Idempotent durable declaration of the job queue.
async fn declare_queue(channel: &Channel, queue: &str) -> Result<(), BrokerError> {
    channel
        .queue_declare(
            queue,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
            FieldTable::default(),
        )
        .await
        .map_err(BrokerError::QueueDeclare)?;
    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to connect to RabbitMQ after {attempts} attempts: {source}")]
    ConnectionExhausted {
        attempts: u32,
        #[source]
        source: lapin::Error,
    },

    #[error("failed to create channel: {0}")]
    Channel(#[source] lapin::Error),

    #[error("failed to declare queue: {0}")]
    QueueDeclare(#[source] lapin::Error),

    #[error("failed to set prefetch: {0}")]
    Qos(#[source] lapin::Error),

    #[error("failed to start consumer: {0}")]
    Consume(#[source] lapin::Error),

    #[error("delivery stream failed: {0}")]
    Delivery(#[source] lapin::Error),

    #[error("consumer was cancelled by the broker")]
    ConsumerClosed,

    #[error("failed to settle delivery: {0}")]
    Acknowledge(#[source] lapin::Error),
}
