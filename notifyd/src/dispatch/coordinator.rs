//! Lifecycle of the dispatch components.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::events::StatusChange;
use super::recovery::{RecoveryConfig, StaleSweeper};
use super::scheduler::{Scheduler, SchedulerConfig};
use super::worker_pool::{ChannelWorkerPool, WorkerConfig};
use super::DispatchContext;
use crate::channels::AdapterRegistry;
use crate::domain::Channel;
use crate::{Error, Result};

/// Settings for every dispatch component.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    #[serde(default)]
    pub workers: WorkerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// How long shutdown waits for in-flight dispatches before aborting them.
    #[serde(default = "default_shutdown_drain_timeout_ms")]
    pub shutdown_drain_timeout_ms: u64,
}

fn default_shutdown_drain_timeout_ms() -> u64 {
    30_000
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            workers: WorkerConfig::default(),
            scheduler: SchedulerConfig::default(),
            recovery: RecoveryConfig::default(),
            shutdown_drain_timeout_ms: default_shutdown_drain_timeout_ms(),
        }
    }
}

impl CoordinatorConfig {
    pub fn shutdown_drain_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_drain_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        self.workers.validate()?;
        self.scheduler.validate()?;
        self.recovery.validate()?;
        if self.shutdown_drain_timeout_ms == 0 {
            return Err(Error::config("shutdown_drain_timeout_ms must be greater than zero"));
        }
        Ok(())
    }
}

/// Starts and stops the worker pools, the scheduler and the staleness sweeper.
pub struct DispatchCoordinator {
    ctx: Arc<DispatchContext>,
    adapters: AdapterRegistry,
    config: CoordinatorConfig,
    cancellation_token: CancellationToken,
    pools: parking_lot::Mutex<Vec<Arc<ChannelWorkerPool>>>,
    background: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl DispatchCoordinator {
    pub fn new(
        ctx: Arc<DispatchContext>,
        adapters: AdapterRegistry,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            ctx,
            adapters,
            config,
            cancellation_token: CancellationToken::new(),
            pools: parking_lot::Mutex::new(Vec::new()),
            background: parking_lot::Mutex::new(None),
        }
    }

    /// Recover stale work and requeue stored PENDING notifications, then start
    /// one worker pool per channel with an adapter, the scheduler loop and the
    /// sweeper loop.
    pub async fn start(&self) -> Result<()> {
        if self.background.lock().is_some() {
            return Err(Error::Other("Dispatch coordinator already started".to_string()));
        }
        if self.cancellation_token.is_cancelled() {
            return Err(Error::Other("Dispatch coordinator was shut down".to_string()));
        }

        // Anything left in PROCESSING by a previous run.
        let sweeper = Arc::new(StaleSweeper::new(self.ctx.clone(), self.config.recovery.clone()));
        match sweeper.run_once(Utc::now()).await {
            Ok(report) => info!(
                recovered = report.recovered,
                exhausted = report.exhausted,
                "Startup recovery sweep complete"
            ),
            Err(e) => error!("Startup recovery sweep failed: {}", e),
        }

        // Queue references may not have survived the previous run.
        if let Err(e) = sweeper.requeue_pending().await {
            error!("Startup requeue of pending notifications failed: {}", e);
        }

        let mut pools = Vec::new();
        for channel in Channel::ALL {
            let Some(adapter) = self.adapters.get(channel) else {
                warn!("No adapter configured for {}, its notifications will stay queued", channel);
                continue;
            };
            let pool = Arc::new(ChannelWorkerPool::new(
                channel,
                self.config.workers.clone(),
                &self.cancellation_token,
            ));
            pool.start(self.ctx.clone(), adapter);
            pools.push(pool);
        }
        *self.pools.lock() = pools;

        let mut background = JoinSet::new();

        let scheduler = Scheduler::new(self.ctx.clone(), self.config.scheduler.clone());
        let token = self.cancellation_token.child_token();
        background.spawn(async move { scheduler.run(token).await });

        let token = self.cancellation_token.child_token();
        background.spawn(async move { sweeper.run(token).await });

        *self.background.lock() = Some(background);

        info!(
            "Dispatch coordinator started with {} channel pools",
            self.pools.lock().len()
        );
        Ok(())
    }

    /// Stop accepting work and wait for in-flight dispatches.
    ///
    /// Waits at most the configured drain timeout; remaining tasks are aborted
    /// and their notifications are left for the next startup sweep.
    pub async fn shutdown(&self) {
        info!("Shutting down dispatch coordinator");
        self.cancellation_token.cancel();

        let pools: Vec<_> = self.pools.lock().drain(..).collect();
        let background = self.background.lock().take();

        let drain = async {
            join_all(pools.iter().map(|pool| pool.stop())).await;
            if let Some(mut background) = background {
                while background.join_next().await.is_some() {}
            }
        };

        let timeout = self.config.shutdown_drain_timeout();
        if tokio::time::timeout(timeout, drain).await.is_err() {
            let in_flight: usize = pools.iter().map(|pool| pool.in_flight()).sum();
            warn!(
                "Shutdown drain timed out after {:?}; aborting {} in-flight dispatches",
                timeout, in_flight
            );
        }

        info!("Dispatch coordinator stopped");
    }

    pub fn context(&self) -> &Arc<DispatchContext> {
        &self.ctx
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.ctx.events.subscribe()
    }

    /// Channels with a running worker pool.
    pub fn active_channels(&self) -> Vec<Channel> {
        self.pools.lock().iter().map(|pool| pool.channel()).collect()
    }

    pub fn is_running(&self) -> bool {
        self.background.lock().is_some() && !self.cancellation_token.is_cancelled()
    }
}
