//! Startup and graceful shutdown of the inventory consumer.
//!
//! 1. **Startup**: connect the pool, apply migrations, spawn the consumer
//! 2. **Runtime**: apply sale events until a signal arrives or the loop stops
//! 3. **Shutdown**: broadcast shutdown, give the current message
//!    `shutdown_timeout` to finish, abort otherwise

use crate::config::Config;
use anyhow::Context;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use stocksync_core::inventory::InventoryStore;
use stocksync_postgres::PostgresInventoryStore;
use stocksync_redpanda::RedpandaSubscriber;
use stocksync_runtime::metrics::MetricsServer;
use stocksync_runtime::{ConsumerConfig, ConsumerExit, SalesConsumer};
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Run the inventory service until a shutdown signal or a fatal consumer exit.
///
/// # Errors
///
/// Returns an error if the metrics exporter, the database or the subscriber
/// cannot be set up, or if the consumer stopped without being asked to.
pub async fn run(config: Config) -> anyhow::Result<()> {
    if let Some(addr) = config.metrics_addr {
        MetricsServer::new(addr)
            .start()
            .context("Failed to start metrics exporter")?;
    }

    info!(max_connections = config.database.max_connections, "Connecting to inventory database");
    let pool = stocksync_postgres::connect(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to inventory database")?;
    stocksync_postgres::migrate(&pool)
        .await
        .context("Failed to migrate inventory database")?;
    let store = Arc::new(PostgresInventoryStore::new(pool));

    let subscriber = RedpandaSubscriber::builder()
        .brokers(&config.kafka.bootstrap_servers)
        .consumer_group(&config.kafka.consumer_group)
        .auto_offset_reset(&config.kafka.auto_offset_reset)
        .build()
        .context("Invalid Kafka configuration")?;

    info!(
        brokers = %config.kafka.bootstrap_servers,
        topic = %config.kafka.sales_topic,
        consumer_group = %config.kafka.consumer_group,
        deduplicate_sales = config.deduplicate_sales,
        "Starting sales consumer"
    );
    let consumer = SalesConsumer::with_config(
        Arc::new(subscriber),
        store,
        ConsumerConfig {
            topic: config.kafka.sales_topic.clone(),
            deduplicate_sales: config.deduplicate_sales,
        },
    );

    exit_result(supervise(consumer, shutdown_signal(), config.shutdown_timeout).await)
}

/// Map how the consumer exited to the process result.
///
/// Only a requested shutdown is a clean exit; a consumer that stopped on its
/// own must make the process fail so it gets restarted.
///
/// # Errors
///
/// Returns an error if the subscription failed or the message stream ended.
pub fn exit_result(exit: Option<ConsumerExit>) -> anyhow::Result<()> {
    match exit {
        Some(ConsumerExit::Shutdown) => {
            info!("Graceful shutdown complete");
            Ok(())
        }
        Some(ConsumerExit::BootstrapFailed(e)) => {
            Err(e).context("Sales consumer could not subscribe")
        }
        Some(ConsumerExit::StreamEnded) => {
            anyhow::bail!("Sales consumer stopped because the message stream ended")
        }
        None => {
            warn!("Consumer did not stop in time; exiting anyway");
            Ok(())
        }
    }
}

/// Spawn `consumer` and stop it when `signal` resolves.
///
/// Returns how the loop exited, or `None` if it had to be aborted after
/// `timeout` or its task failed.
pub async fn supervise<S, F>(
    consumer: SalesConsumer<S>,
    signal: F,
    timeout: Duration,
) -> Option<ConsumerExit>
where
    S: InventoryStore + 'static,
    F: Future<Output = ()>,
{
    let (shutdown_tx, _) = broadcast::channel(1);
    let mut handle = consumer.spawn(shutdown_tx);

    tokio::select! {
        () = signal => info!("Shutdown signal received, stopping consumer"),
        () = handle.stopped() => warn!("Sales consumer stopped on its own"),
    }

    let abort = handle.abort_handle();
    match tokio::time::timeout(timeout, handle.shutdown()).await {
        Ok(Ok(exit)) => Some(exit),
        Ok(Err(e)) => {
            error!(error = %e, "Consumer task failed");
            None
        }
        Err(_) => {
            warn!(timeout_secs = timeout.as_secs(), "Consumer shutdown timed out");
            abort.abort();
            None
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stocksync_core::event::ProductId;
    use stocksync_core::event_bus::EventBusError;
    use stocksync_runtime::ConsumerState;
    use stocksync_testing::{InMemoryBroker, InMemoryInventoryStore};

    #[tokio::test]
    async fn signal_stops_the_consumer() {
        let broker = InMemoryBroker::new();
        let store = Arc::new(InMemoryInventoryStore::with_products([(ProductId::new(1), 5)]));
        let consumer = SalesConsumer::new(Arc::new(broker.subscriber("inventario-group")), store);
        let mut state = consumer.state();

        let (signal_tx, signal_rx) = tokio::sync::oneshot::channel::<()>();
        let supervisor = tokio::spawn(supervise(
            consumer,
            async move {
                let _ = signal_rx.await;
            },
            Duration::from_secs(5),
        ));

        state
            .wait_for(|s| *s == ConsumerState::Consuming)
            .await
            .unwrap();
        signal_tx.send(()).unwrap();

        assert_eq!(supervisor.await.unwrap(), Some(ConsumerExit::Shutdown));
    }

    #[tokio::test]
    async fn bootstrap_failure_ends_supervision() {
        let broker = InMemoryBroker::new();
        broker.refuse_subscriptions(true);
        let store = Arc::new(InMemoryInventoryStore::new());
        let consumer = SalesConsumer::new(Arc::new(broker.subscriber("inventario-group")), store);

        let exit = supervise(consumer, std::future::pending(), Duration::from_secs(5)).await;

        assert!(matches!(exit, Some(ConsumerExit::BootstrapFailed(_))));
    }

    #[test]
    fn only_requested_shutdown_is_a_clean_exit() {
        assert!(exit_result(Some(ConsumerExit::Shutdown)).is_ok());
        assert!(exit_result(None).is_ok());
        assert!(exit_result(Some(ConsumerExit::StreamEnded)).is_err());
        assert!(
            exit_result(Some(ConsumerExit::BootstrapFailed(EventBusError::SubscriptionFailed {
                topic: "topic_ventas".to_string(),
                reason: "unreachable".to_string(),
            })))
            .is_err()
        );
    }
}
