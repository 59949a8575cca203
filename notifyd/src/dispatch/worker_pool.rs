//! Per-channel dispatch worker pools.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use rand::random;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::DispatchContext;
use super::outcome::{FailureOutcome, apply_failure, apply_permanent_failure};
use crate::channels::ChannelAdapter;
use crate::domain::{Channel, Notification, NotificationStatus};
use crate::queue::QueueRef;
use crate::{Error, Result};

/// Configuration for the dispatch workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Workers per channel unless overridden.
    #[serde(default = "default_parallelism")]
    pub parallelism: usize,
    /// Per-channel worker counts.
    #[serde(default)]
    pub channel_parallelism: HashMap<Channel, usize>,
    /// Idle wait between empty dequeues in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Upper bound on a single adapter call in milliseconds.
    #[serde(default = "default_adapter_timeout_ms")]
    pub adapter_timeout_ms: u64,
    /// First delay when the record or queue store is unreachable.
    #[serde(default = "default_infra_backoff_initial_ms")]
    pub infra_backoff_initial_ms: u64,
    /// Cap on the store-unreachable delay.
    #[serde(default = "default_infra_backoff_max_ms")]
    pub infra_backoff_max_ms: u64,
}

fn default_parallelism() -> usize {
    2
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_adapter_timeout_ms() -> u64 {
    30_000
}

fn default_infra_backoff_initial_ms() -> u64 {
    100
}

fn default_infra_backoff_max_ms() -> u64 {
    5_000
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            parallelism: default_parallelism(),
            channel_parallelism: HashMap::new(),
            poll_interval_ms: default_poll_interval_ms(),
            adapter_timeout_ms: default_adapter_timeout_ms(),
            infra_backoff_initial_ms: default_infra_backoff_initial_ms(),
            infra_backoff_max_ms: default_infra_backoff_max_ms(),
        }
    }
}

impl WorkerConfig {
    pub fn parallelism_for(&self, channel: Channel) -> usize {
        self.channel_parallelism
            .get(&channel)
            .copied()
            .unwrap_or(self.parallelism)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn adapter_timeout(&self) -> Duration {
        Duration::from_millis(self.adapter_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(Error::config("worker parallelism must be at least 1"));
        }
        if let Some((channel, _)) = self.channel_parallelism.iter().find(|(_, n)| **n == 0) {
            return Err(Error::config(format!(
                "worker parallelism for {} must be at least 1",
                channel
            )));
        }
        if self.poll_interval_ms == 0 || self.adapter_timeout_ms == 0 {
            return Err(Error::config(
                "poll_interval_ms and adapter_timeout_ms must be greater than zero",
            ));
        }
        if self.infra_backoff_initial_ms == 0
            || self.infra_backoff_max_ms < self.infra_backoff_initial_ms
        {
            return Err(Error::config(
                "infra backoff must be positive with max >= initial",
            ));
        }
        Ok(())
    }
}

/// Backoff for store-unreachable errors. Separate from the notification retry
/// policy: these waits never count against a notification.
struct InfraBackoff {
    initial_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl InfraBackoff {
    fn new(config: &WorkerConfig) -> Self {
        Self {
            initial_ms: config.infra_backoff_initial_ms,
            max_ms: config.infra_backoff_max_ms,
            attempt: 0,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let exp_ms = self
            .initial_ms
            .saturating_mul(1u64 << self.attempt.min(20));
        let capped_ms = exp_ms.min(self.max_ms);
        let jitter_ms = random::<u64>() % (capped_ms / 4 + 1);
        self.attempt = self.attempt.saturating_add(1);
        Duration::from_millis((capped_ms + jitter_ms).min(self.max_ms))
    }
}

/// Result of dispatching one queued reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent {
        notification_id: String,
    },
    Failed {
        notification_id: String,
        outcome: FailureOutcome,
    },
    /// The reference was dropped without a transition.
    Skipped {
        notification_id: String,
        reason: &'static str,
    },
}

/// A single dispatch worker for one channel.
pub struct ChannelWorker {
    ctx: Arc<DispatchContext>,
    adapter: Arc<dyn ChannelAdapter>,
    channel: Channel,
    config: WorkerConfig,
    cancellation_token: CancellationToken,
    in_flight: Arc<AtomicUsize>,
}

impl ChannelWorker {
    pub fn new(
        ctx: Arc<DispatchContext>,
        adapter: Arc<dyn ChannelAdapter>,
        channel: Channel,
        config: WorkerConfig,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            adapter,
            channel,
            config,
            cancellation_token,
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn with_in_flight(mut self, in_flight: Arc<AtomicUsize>) -> Self {
        self.in_flight = in_flight;
        self
    }

    /// Pop the next reference for this channel and dispatch it.
    ///
    /// Returns `Ok(None)` when the channel queue is empty. Store outages are
    /// retried with the infrastructure backoff until they clear or the worker
    /// is cancelled.
    pub async fn dispatch_next(&self) -> Result<Option<DispatchOutcome>> {
        let mut backoff = InfraBackoff::new(&self.config);
        let item = self
            .retry_infra("dequeue", &mut backoff, || self.ctx.queue.dequeue(self.channel))
            .await?;

        let Some(item) = item else {
            return Ok(None);
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.dispatch(item, &mut backoff).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result.map(Some)
    }

    async fn dispatch(
        &self,
        item: QueueRef,
        backoff: &mut InfraBackoff,
    ) -> Result<DispatchOutcome> {
        let id = item.notification_id.clone();

        let loaded = self
            .retry_infra("load", backoff, || self.ctx.repository.load(&id))
            .await;
        let mut notification = match loaded {
            Ok(n) => n,
            Err(Error::NotFound { .. }) => {
                warn!(notification_id = %id, channel = %self.channel, "Queued notification no longer exists");
                return Ok(skipped(id, "not found"));
            }
            Err(err) => {
                self.requeue(&item).await;
                return Err(err);
            }
        };

        if notification.channel != self.channel {
            warn!(
                notification_id = %id,
                expected = %self.channel,
                actual = %notification.channel,
                "Queued notification belongs to another channel"
            );
            return Ok(skipped(id, "wrong channel"));
        }

        if !notification.is_queueable() {
            debug!(
                notification_id = %id,
                status = %notification.status,
                "Skipping notification that is no longer pending"
            );
            return Ok(skipped(id, "not pending"));
        }

        notification.mark_processing()?;
        match self.persist_with_retry(&mut notification, backoff).await {
            Ok(()) => self.ctx.events.publish_path(
                &notification,
                &[NotificationStatus::Pending, NotificationStatus::Processing],
            ),
            Err(Error::ConcurrentModification { .. }) => {
                debug!(notification_id = %id, "Lost the race to claim notification");
                return Ok(skipped(id, "concurrent modification"));
            }
            Err(err) => {
                if err.is_infrastructure() {
                    self.requeue(&item).await;
                }
                return Err(err);
            }
        }

        let (outcome, path) = self.deliver(&mut notification).await?;

        match self.persist_with_retry(&mut notification, backoff).await {
            Ok(()) => self.ctx.events.publish_path(&notification, &path),
            Err(Error::ConcurrentModification { .. }) => {
                warn!(
                    notification_id = %id,
                    "Notification was recovered while its dispatch was in flight; outcome discarded"
                );
                return Ok(skipped(id, "concurrent modification"));
            }
            Err(err) => {
                error!(
                    notification_id = %id,
                    error = %err,
                    "Failed to record dispatch outcome; left PROCESSING for the staleness sweep"
                );
                return Err(err);
            }
        }

        Ok(outcome)
    }

    /// Invoke the adapter under the timeout and apply the outcome in memory.
    async fn deliver(
        &self,
        notification: &mut Notification,
    ) -> Result<(DispatchOutcome, Vec<NotificationStatus>)> {
        let timeout = self.config.adapter_timeout();
        let started = std::time::Instant::now();
        let result = tokio::time::timeout(timeout, self.adapter.send(notification)).await;

        let (outcome, path) = match result {
            Ok(Ok(())) => {
                notification.mark_sent()?;
                info!(
                    notification_id = %notification.id,
                    channel = %self.channel,
                    priority = %notification.priority,
                    adapter = self.adapter.name(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Notification sent"
                );
                return Ok((
                    DispatchOutcome::Sent {
                        notification_id: notification.id.clone(),
                    },
                    vec![NotificationStatus::Processing, NotificationStatus::Sent],
                ));
            }
            Ok(Err(err)) if !err.is_recoverable() => {
                error!(
                    notification_id = %notification.id,
                    channel = %self.channel,
                    adapter = self.adapter.name(),
                    error = %err,
                    "Adapter failed with a non-recoverable error, not retrying"
                );
                apply_permanent_failure(notification, &err)?
            }
            Ok(Err(err)) => self.retry_or_exhaust(notification, &err.to_string())?,
            Err(_) => {
                let reason = Error::AdapterTimeout(timeout).to_string();
                self.retry_or_exhaust(notification, &reason)?
            }
        };

        Ok((
            DispatchOutcome::Failed {
                notification_id: notification.id.clone(),
                outcome,
            },
            path,
        ))
    }

    fn retry_or_exhaust(
        &self,
        notification: &mut Notification,
        reason: &str,
    ) -> Result<(FailureOutcome, Vec<NotificationStatus>)> {
        let (outcome, path) = apply_failure(notification, reason, &self.ctx.retry_policy)?;
        if let FailureOutcome::Retrying {
            retry_at,
            retry_count,
        } = &outcome
        {
            warn!(
                notification_id = %notification.id,
                channel = %self.channel,
                retry_count = retry_count,
                retry_at = %retry_at,
                error = %reason,
                "Dispatch failed, retry scheduled"
            );
        }
        Ok((outcome, path))
    }

    async fn retry_infra<T, F, Fut>(
        &self,
        op_name: &'static str,
        backoff: &mut InfraBackoff,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        loop {
            match op().await {
                Err(err) if err.is_infrastructure() => {
                    if !self.pause_for_infra(op_name, backoff, &err).await {
                        return Err(err);
                    }
                }
                other => return other,
            }
        }
    }

    /// `persist` borrows the notification mutably, so it cannot go through
    /// [`Self::retry_infra`]'s `FnMut` closure.
    async fn persist_with_retry(
        &self,
        notification: &mut Notification,
        backoff: &mut InfraBackoff,
    ) -> Result<()> {
        loop {
            match self.ctx.repository.persist(notification).await {
                Err(err) if err.is_infrastructure() => {
                    if !self.pause_for_infra("persist", backoff, &err).await {
                        return Err(err);
                    }
                }
                other => return other,
            }
        }
    }

    /// Wait out a store outage. Returns false when the worker was cancelled
    /// and the call should not be retried.
    async fn pause_for_infra(
        &self,
        op_name: &'static str,
        backoff: &mut InfraBackoff,
        err: &Error,
    ) -> bool {
        if self.cancellation_token.is_cancelled() {
            return false;
        }
        let delay = backoff.next_delay();
        warn!(
            channel = %self.channel,
            operation = op_name,
            error = %err,
            "Store unavailable, retrying in {:?}",
            delay
        );
        tokio::select! {
            _ = self.cancellation_token.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }

    /// Put a popped reference back when it could not be processed.
    async fn requeue(&self, item: &QueueRef) {
        if let Err(e) = self
            .ctx
            .queue
            .enqueue(self.channel, item.priority, item.clone())
            .await
        {
            error!(
                notification_id = %item.notification_id,
                channel = %self.channel,
                error = %e,
                "Failed to requeue notification reference"
            );
        }
    }
}

fn skipped(notification_id: String, reason: &'static str) -> DispatchOutcome {
    DispatchOutcome::Skipped {
        notification_id,
        reason,
    }
}

/// A group of dispatch workers serving one channel.
pub struct ChannelWorkerPool {
    channel: Channel,
    config: WorkerConfig,
    in_flight: Arc<AtomicUsize>,
    cancellation_token: CancellationToken,
    tasks: parking_lot::Mutex<Option<JoinSet<()>>>,
}

impl ChannelWorkerPool {
    /// Create a pool whose workers stop when `parent` is cancelled.
    pub fn new(channel: Channel, config: WorkerConfig, parent: &CancellationToken) -> Self {
        Self {
            channel,
            config,
            in_flight: Arc::new(AtomicUsize::new(0)),
            cancellation_token: parent.child_token(),
            tasks: parking_lot::Mutex::new(Some(JoinSet::new())),
        }
    }

    /// Start the workers.
    pub fn start(&self, ctx: Arc<DispatchContext>, adapter: Arc<dyn ChannelAdapter>) {
        let channel = self.channel;
        let workers = self.config.parallelism_for(channel).max(1);
        let poll_interval = self.config.poll_interval();
        let notifier = ctx.queue.notifier(channel);

        info!(
            "Starting {} worker pool with {} workers (adapter: {})",
            channel,
            workers,
            adapter.name()
        );

        let mut tasks = self.tasks.lock();
        if let Some(ref mut join_set) = *tasks {
            for i in 0..workers {
                let cancellation_token = self.cancellation_token.clone();
                let notifier = notifier.clone();
                let worker = ChannelWorker::new(
                    ctx.clone(),
                    adapter.clone(),
                    channel,
                    self.config.clone(),
                    cancellation_token.clone(),
                )
                .with_in_flight(self.in_flight.clone());

                join_set.spawn(async move {
                    debug!("{} worker {} started", channel, i);

                    loop {
                        if cancellation_token.is_cancelled() {
                            break;
                        }

                        match worker.dispatch_next().await {
                            Ok(Some(_)) => continue,
                            Ok(None) => {}
                            Err(e) => {
                                error!("{} worker {} dispatch error: {}", channel, i, e);
                            }
                        }

                        tokio::select! {
                            _ = cancellation_token.cancelled() => break,
                            _ = notifier.notified() => {}
                            _ = tokio::time::sleep(poll_interval) => {}
                        }
                    }

                    debug!("{} worker {} shutting down", channel, i);
                });
            }
        }
    }

    /// Stop the workers and wait for in-flight dispatches to finish.
    ///
    /// Dropping the returned future before it completes aborts the remaining
    /// workers.
    pub async fn stop(&self) {
        info!("Stopping {} worker pool", self.channel);
        self.cancellation_token.cancel();

        let join_set = {
            let mut tasks = self.tasks.lock();
            tasks.take()
        };

        if let Some(mut join_set) = join_set {
            while join_set.join_next().await.is_some() {}
        }

        info!("{} worker pool stopped", self.channel);
    }

    /// Number of dispatches currently between dequeue and outcome.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn channel(&self) -> Channel {
        self.channel
    }

    pub fn is_running(&self) -> bool {
        !self.cancellation_token.is_cancelled()
    }
}
