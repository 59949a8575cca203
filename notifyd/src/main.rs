use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::info;

use notifyd::channels::AdapterRegistry;
use notifyd::config::{EngineConfig, QueueBackend};
use notifyd::database::{
    self,
    repositories::{MemoryNotificationRepository, NotificationRepository, SqlxNotificationRepository},
};
use notifyd::dispatch::{DispatchContext, DispatchCoordinator};
use notifyd::logging;
use notifyd::queue::{MemoryQueueStore, PriorityQueue, QueueStore, RedisQueueStore};

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let config = EngineConfig::load().context("loading configuration")?;

    let (logging_config, _log_guard) = logging::init_logging(config.log_dir.as_deref())?;
    let shutdown_token = CancellationToken::new();
    logging_config.start_retention_cleanup(shutdown_token.child_token());

    let repository: Arc<dyn NotificationRepository> = if config.uses_memory_database() {
        info!("Using in-memory record store");
        Arc::new(MemoryNotificationRepository::new())
    } else {
        let pool = database::init_pool(&config.database_url)
            .await
            .with_context(|| format!("opening database {}", config.database_url))?;
        database::run_migrations(&pool).await?;
        Arc::new(SqlxNotificationRepository::new(pool))
    };

    let store: Arc<dyn QueueStore> = match &config.queue {
        QueueBackend::Memory => Arc::new(MemoryQueueStore::new()),
        QueueBackend::Redis(redis) => Arc::new(RedisQueueStore::connect(redis).await?),
    };

    let adapters = AdapterRegistry::from_configs(&config.channel_configs())?;
    let ctx = Arc::new(DispatchContext::new(
        repository,
        Arc::new(PriorityQueue::new(store)),
        config.retry.clone(),
    ));

    let coordinator = DispatchCoordinator::new(ctx, adapters, config.coordinator_config());
    coordinator.start().await?;
    info!(
        "notifyd started, serving {:?}",
        coordinator.active_channels()
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    coordinator.shutdown().await;
    shutdown_token.cancel();

    Ok(())
}
