//! Keeps a relational table in sync with a Kafka topic.
//!
//! Every message of the topic carries one record. The record is decoded, written into the table
//! with an idempotent upsert and only then is the offset of the message committed for the consumer
//! group. Delivery is therefore at-least-once: a crash between the write and the commit replays
//! the message, and replaying it leaves the table unchanged.
//!
//! - `source` reads the topic and commits offsets, one worker per partition group.
//! - `driver` turns a message into a write, retrying transient failures with backoff.
//! - `sink` writes into PostgreSQL.

use std::net::SocketAddr;

use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub use crate::error::{Error, Result};

use crate::config::Settings;
use crate::driver::Driver;
use crate::metrics::HealthState;
use crate::sink::postgres::new_pg_sink;
use crate::source::StreamSource;
use crate::source::kafka::new_kafka_source;

mod config;
mod decode;
mod driver;
mod error;
mod message;
mod metrics;
mod retry;
mod sink;
mod source;

#[cfg(test)]
mod test_utils;

/// Runs the sync until SIGINT/SIGTERM or a fatal error. Returns the fatal error, if any.
pub async fn run() -> Result<()> {
    let settings = Settings::load()?;

    let cancel = CancellationToken::new();
    let shutdown_cancel = cancel.clone();
    // wait for SIG{INT,TERM} and invoke cancellation token.
    let shutdown_handle: JoinHandle<()> = tokio::spawn(async move {
        shutdown_signal().await;
        shutdown_cancel.cancel();
    });

    let result = start(settings, cancel).await;
    if !shutdown_handle.is_finished() {
        shutdown_handle.abort();
    }
    result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match signal::ctrl_c().await {
            Ok(()) => info!("Received Ctrl+C signal"),
            Err(e) => {
                error!(?e, "Failed to install Ctrl+C handler");
                std::future::pending::<()>().await;
            }
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received terminate signal");
            }
            Err(e) => {
                error!(?e, "Failed to install terminate signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn start(settings: Settings, cancel: CancellationToken) -> Result<()> {
    info!(
        brokers = settings.source.kafka.brokers.join(","),
        topic = settings.source.kafka.topic,
        consumer_group = settings.source.kafka.consumer_group,
        table = settings.sink.table.table,
        workers = settings.workers,
        "Starting tablesync"
    );

    // stops the metrics server and the lag poller once the pipeline is done
    let background = CancellationToken::new();
    let health = HealthState::default();
    let metrics_addr = SocketAddr::from(([0, 0, 0, 0], settings.metrics.port));
    let metrics_server =
        metrics::spawn_metrics_server(metrics_addr, health.clone(), background.clone());

    let result = start_pipeline(&settings, &health, cancel, &background).await;
    health.mark_unready();
    background.cancel();

    // a failed server has already logged why
    if let Err(e) = metrics_server.await {
        warn!(?e, "Metrics server task failed");
    }

    match &result {
        Ok(()) => info!("Gracefully stopped"),
        Err(e) => error!(error = %e, "Stopped on a fatal error"),
    }
    result
}

async fn start_pipeline(
    settings: &Settings,
    health: &HealthState,
    cancel: CancellationToken,
    background: &CancellationToken,
) -> Result<()> {
    let kafka = new_kafka_source(settings.source.clone(), cancel.clone()).await?;
    let pg = new_pg_sink(settings.sink.clone()).await?;
    health.mark_ready();

    let lag_task = tokio::spawn(metrics::expose_pending(
        kafka.clone(),
        settings.source.kafka.topic.clone(),
        settings.metrics.lag_refresh_interval,
        background.clone(),
    ));

    let drivers: Vec<_> = (0..settings.workers)
        .map(|_| {
            Driver::new(
                settings.sink.mapping.decoder(),
                pg.clone(),
                settings.sink.retry.clone(),
                settings.sink.write_timeout,
                cancel.clone(),
            )
        })
        .collect();

    let result = StreamSource::new(kafka.clone(), kafka)
        .commit_retry(settings.sink.retry.clone())
        .consume(drivers, cancel)
        .await;

    // every worker has joined, no write is in flight anymore
    pg.close().await;
    background.cancel();
    if let Err(e) = lag_task.await {
        warn!(?e, "Lag poller task failed");
    }
    result
}
