//! Sharded signal delivery.
//!
//! Entities are partitioned across a fixed number of shards; a work
//! registry grants one node exclusive, time-bounded access to a shard,
//! and all signals for entities of that shard are serialized through the
//! holder. Within a session, messages are processed in `received_at`
//! order with signal-id deduplication against the idempotence window;
//! across shards, sessions run in parallel on a bounded worker pool.

pub mod catch_up;
mod inbox;
mod monitor;
mod strategy;

pub use inbox::{InboxMessage, InboxStatus, InboxWriter, MessageKey, ShardIndex};
pub use monitor::{DeliveryMonitor, NoOpMonitor, PageStats};
pub use strategy::{ShardingStrategy, UniformHashStrategy};

use std::collections::HashSet;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::entity::EntityId;
use crate::interfaces::{
    InboxStorage, NodeId, Page, ShardSession, ShardedWorkRegistry, StorageError,
};
use crate::signal::{DispatchOutcome, IgnoreReason, SignalId, TypeUrl};
use self::catch_up::{CatchUpRegistry, CatchUpStatus};

/// Result type for delivery operations.
pub type Result<T> = std::result::Result<T, DeliveryError>;

/// Errors that stop a delivery session.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("endpoint failed fatally{}: {message}", fmt_signal(.signal_id))]
    Endpoint {
        signal_id: Option<SignalId>,
        message: String,
    },
}

fn fmt_signal(signal_id: &Option<SignalId>) -> String {
    match signal_id {
        Some(id) => format!(" on {id}"),
        None => String::new(),
    }
}

/// The receiving side of a repository: runs one inbox message against its
/// entity inside a transaction.
///
/// `deliver` returns the per-signal outcome; an `Err` is a fatal failure
/// that interrupts the rest of the page.
#[async_trait]
pub trait DispatchEndpoint: Send + Sync {
    fn entity_type(&self) -> &TypeUrl;

    async fn deliver(&self, message: &InboxMessage) -> Result<DispatchOutcome>;
}

/// Statistics of one `deliver_messages_from` call.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeliveryStats {
    pub shard: ShardIndex,
    pub delivered_count: u32,
}

/// Configuration of the delivery machinery.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Number of shards. At least 1.
    pub shard_count: u32,
    /// Messages read per page. At least 1.
    pub page_size: usize,
    /// How long delivered messages are retained for deduplication.
    pub idempotence_window: Duration,
    /// The window near the present in which catch-up replays and live
    /// events coexist.
    pub turbulence_period: Duration,
    /// Worker tasks draining shards. Defaults to the CPU count.
    pub workers: usize,
    /// Sleep between scans when no shard has work.
    pub idle_backoff: Duration,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            shard_count: 1,
            page_size: 500,
            idempotence_window: Duration::from_secs(3600),
            turbulence_period: Duration::from_millis(500),
            workers: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
            idle_backoff: Duration::from_millis(50),
        }
    }
}

/// Builder for [`Delivery`].
pub struct DeliveryBuilder {
    config: DeliveryConfig,
    strategy: Arc<dyn ShardingStrategy>,
    work_registry: Option<Arc<dyn ShardedWorkRegistry>>,
    monitor: Arc<dyn DeliveryMonitor>,
    node: NodeId,
}

impl Default for DeliveryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeliveryBuilder {
    pub fn new() -> Self {
        DeliveryBuilder {
            config: DeliveryConfig::default(),
            strategy: Arc::new(UniformHashStrategy),
            work_registry: None,
            monitor: Arc::new(NoOpMonitor),
            node: NodeId::generate(),
        }
    }

    pub fn shard_count(mut self, count: u32) -> Self {
        self.config.shard_count = count.max(1);
        self
    }

    pub fn page_size(mut self, size: usize) -> Self {
        self.config.page_size = size.max(1);
        self
    }

    pub fn idempotence_window(mut self, window: Duration) -> Self {
        self.config.idempotence_window = window;
        self
    }

    pub fn turbulence_period(mut self, period: Duration) -> Self {
        self.config.turbulence_period = period;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers.max(1);
        self
    }

    pub fn idle_backoff(mut self, backoff: Duration) -> Self {
        self.config.idle_backoff = backoff;
        self
    }

    pub fn strategy(mut self, strategy: Arc<dyn ShardingStrategy>) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn work_registry(mut self, registry: Arc<dyn ShardedWorkRegistry>) -> Self {
        self.work_registry = Some(registry);
        self
    }

    pub fn monitor(mut self, monitor: Arc<dyn DeliveryMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn node(mut self, node: NodeId) -> Self {
        self.node = node;
        self
    }

    /// Finish the builder with the inbox storage to run on.
    ///
    /// The work registry defaults to the in-memory implementation.
    pub fn finish(self, storage: Arc<dyn InboxStorage>) -> Delivery {
        let registry = self
            .work_registry
            .unwrap_or_else(|| Arc::new(crate::storage::InMemoryWorkRegistry::default()));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (outcomes, _) = broadcast::channel(1024);
        Delivery {
            config: self.config,
            storage,
            registry,
            strategy: self.strategy,
            monitor: self.monitor,
            node: self.node,
            endpoints: RwLock::new(std::collections::HashMap::new()),
            catch_ups: Arc::new(CatchUpRegistry::default()),
            outcomes,
            shutdown_tx,
            shutdown_rx,
            workers: std::sync::Mutex::new(Vec::new()),
        }
    }
}

/// The delivery engine of one node.
pub struct Delivery {
    config: DeliveryConfig,
    storage: Arc<dyn InboxStorage>,
    registry: Arc<dyn ShardedWorkRegistry>,
    strategy: Arc<dyn ShardingStrategy>,
    monitor: Arc<dyn DeliveryMonitor>,
    node: NodeId,
    endpoints: RwLock<std::collections::HashMap<TypeUrl, Arc<dyn DispatchEndpoint>>>,
    catch_ups: Arc<CatchUpRegistry>,
    outcomes: broadcast::Sender<DispatchOutcome>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Delivery {
    pub fn builder() -> DeliveryBuilder {
        DeliveryBuilder::new()
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    pub fn node(&self) -> &NodeId {
        &self.node
    }

    pub fn shard_count(&self) -> u32 {
        self.config.shard_count
    }

    /// The write side handed to repositories.
    pub fn writer(&self) -> InboxWriter {
        InboxWriter::new(
            Arc::clone(&self.storage),
            Arc::clone(&self.strategy),
            self.config.shard_count,
        )
    }

    /// The catch-up job registry shared with catch-up processes.
    pub fn catch_ups(&self) -> Arc<CatchUpRegistry> {
        Arc::clone(&self.catch_ups)
    }

    /// The shard a target lives in.
    pub fn shard_for(&self, entity_type: &TypeUrl, id: &EntityId) -> ShardIndex {
        self.strategy
            .shard_for(id, entity_type, self.config.shard_count)
    }

    /// Register the endpoint of an entity type. Later registrations of
    /// the same type replace earlier ones.
    pub fn register_endpoint(&self, endpoint: Arc<dyn DispatchEndpoint>) {
        let entity_type = endpoint.entity_type().clone();
        self.endpoints
            .write()
            .expect("endpoints lock")
            .insert(entity_type, endpoint);
    }

    /// Observe per-signal dispatch outcomes. Lagging receivers miss
    /// outcomes rather than applying backpressure.
    pub fn subscribe_outcomes(&self) -> broadcast::Receiver<DispatchOutcome> {
        self.outcomes.subscribe()
    }

    /// Deliver pending messages of one shard.
    ///
    /// Returns `Some(stats)` iff this node obtained the shard session;
    /// `None` while another node holds the lease.
    #[tracing::instrument(name = "delivery.shard", skip_all, fields(shard = %shard, node = %self.node))]
    pub async fn deliver_messages_from(&self, shard: ShardIndex) -> Result<Option<DeliveryStats>> {
        let Some(session) = self.registry.pick_up(shard, &self.node).await else {
            return Ok(None);
        };

        let mut stats = DeliveryStats {
            shard,
            delivered_count: 0,
        };
        loop {
            let page = match self.read_page_with_retry(shard).await {
                Ok(page) => page,
                Err(e) => {
                    // The page stays pending; another round will retry.
                    self.registry.release(&session).await;
                    return Err(e);
                }
            };
            let outcome = self.process_page(&session, page).await;
            match outcome {
                PageResult::Done { stats: page_stats, full_page } => {
                    stats.delivered_count += page_stats.delivered;
                    if !page_stats.is_empty() {
                        self.monitor.page_committed(shard, &page_stats);
                    }
                    if !full_page || page_stats.delivered + page_stats.ignored == 0 {
                        break;
                    }
                }
                PageResult::LeaseLost => {
                    debug!("session superseded; abandoning shard");
                    return Ok(Some(stats));
                }
                PageResult::Fatal { stats: page_stats, error } => {
                    if !page_stats.is_empty() {
                        self.monitor.page_committed(shard, &page_stats);
                    }
                    self.registry.release(&session).await;
                    return Err(error);
                }
            }
        }
        self.registry.release(&session).await;
        Ok(Some(stats))
    }

    /// Remove delivered messages whose idempotence window has passed.
    pub async fn sweep(&self) -> Result<usize> {
        Ok(self.storage.delete_expired(Utc::now()).await?)
    }

    /// Start the worker pool draining all shards of this node.
    pub fn start_workers(self: &Arc<Self>) {
        let mut handles = Vec::with_capacity(self.config.workers);
        for worker in 0..self.config.workers {
            let delivery = Arc::clone(self);
            let shutdown = self.shutdown_rx.clone();
            handles.push(tokio::spawn(async move {
                delivery.worker_loop(worker, shutdown).await;
            }));
        }
        self.workers.lock().expect("workers lock").extend(handles);
        info!(
            workers = self.config.workers,
            shards = self.config.shard_count,
            "delivery workers started"
        );
    }

    /// Stop picking up new pages and wait for workers to finish their
    /// current ones.
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("workers lock");
            workers.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        info!("delivery workers stopped");
    }

    async fn worker_loop(&self, worker: usize, shutdown: watch::Receiver<bool>) {
        let shard_count = self.config.shard_count as usize;
        let mut next = worker % shard_count;
        let mut idle_scans = 0usize;
        loop {
            if *shutdown.borrow() {
                break;
            }
            let shard = ShardIndex::new(next as u32, self.config.shard_count);
            next = (next + 1) % shard_count;

            let had_work = match self.deliver_messages_from(shard).await {
                Ok(Some(stats)) => stats.delivered_count > 0,
                Ok(None) => false,
                Err(e) => {
                    warn!(shard = %shard, error = %e, "shard delivery failed; will retry");
                    false
                }
            };

            if had_work {
                idle_scans = 0;
            } else {
                idle_scans += 1;
                if idle_scans >= shard_count {
                    idle_scans = 0;
                    if let Err(e) = self.sweep().await {
                        warn!(error = %e, "inbox sweep failed");
                    }
                    tokio::time::sleep(self.config.idle_backoff).await;
                }
            }
        }
    }

    async fn read_page_with_retry(&self, shard: ShardIndex) -> Result<Page> {
        let read = || async { self.storage.read_page(shard, self.config.page_size).await };
        let page = read
            .retry(
                ExponentialBuilder::default()
                    .with_min_delay(Duration::from_millis(10))
                    .with_max_delay(Duration::from_millis(500))
                    .with_max_times(3),
            )
            .await?;
        Ok(page)
    }

    /// Process one page within a held session.
    async fn process_page(&self, session: &ShardSession, page: Page) -> PageResult {
        let mut stats = PageStats::default();

        // Delivered rows inside the idempotence window seed the dedup set.
        let mut seen: HashSet<MessageKey> = page
            .messages
            .iter()
            .filter(|m| m.status == InboxStatus::Delivered)
            .map(InboxMessage::key)
            .collect();

        let mut pending: Vec<&InboxMessage> = page
            .messages
            .iter()
            .filter(|m| m.status == InboxStatus::ToDeliver)
            .collect();
        pending.sort_by(|a, b| InboxMessage::page_order(a, b));
        let full_page = pending.len() >= self.config.page_size;

        let keep_until = || {
            Utc::now()
                + chrono::Duration::from_std(self.config.idempotence_window)
                    .unwrap_or_else(|_| chrono::Duration::hours(1))
        };

        let mut index = 0usize;
        while index < pending.len() {
            let message = pending[index];
            index += 1;

            // Catch-up gating: live messages of a projection under
            // catch-up stay pending until the process completes.
            if let Some(status) = self
                .catch_ups
                .gate_for(&message.target_type, &message.target_id)
                .await
            {
                let paused = matches!(
                    status,
                    CatchUpStatus::Started | CatchUpStatus::Finalizing
                ) && !message.from_catch_up;
                if paused {
                    stats.paused += 1;
                    continue;
                }
            }

            // Ownership check: an expired lease means another node may
            // already be redelivering this shard.
            if self.registry.extend_lease(session).await.is_err() {
                return PageResult::LeaseLost;
            }

            let key = message.key();
            if seen.contains(&key) {
                let outcome = DispatchOutcome::Ignored {
                    signal_id: message.signal.id,
                    reason: IgnoreReason::Duplicate,
                };
                if let Err(e) = self.confirm(&key, keep_until(), &mut stats, outcome).await {
                    return PageResult::Fatal {
                        stats,
                        error: e.into(),
                    };
                }
                continue;
            }

            let endpoint = {
                let endpoints = self.endpoints.read().expect("endpoints lock");
                endpoints.get(&message.target_type).cloned()
            };
            let Some(endpoint) = endpoint else {
                error!(target = %message.target_type, "no endpoint for inbox message");
                let outcome = DispatchOutcome::Error {
                    signal_id: message.signal.id,
                    cause: format!("no endpoint for `{}`", message.target_type),
                };
                stats.errored += 1;
                let _ = self.outcomes.send(outcome);
                continue;
            };

            match endpoint.deliver(message).await {
                Ok(outcome) => {
                    seen.insert(key.clone());
                    if let Err(e) = self.confirm(&key, keep_until(), &mut stats, outcome).await {
                        return PageResult::Fatal {
                            stats,
                            error: e.into(),
                        };
                    }
                }
                Err(error) => {
                    // Fatal: this message stays pending; the untouched
                    // remainder of the page is reported interrupted.
                    error!(signal = %message.signal.id, error = %error, "fatal delivery failure");
                    stats.errored += 1;
                    let _ = self.outcomes.send(DispatchOutcome::Error {
                        signal_id: message.signal.id,
                        cause: error.to_string(),
                    });
                    for untouched in &pending[index..] {
                        stats.interrupted += 1;
                        let _ = self.outcomes.send(DispatchOutcome::Interrupted {
                            signal_id: untouched.signal.id,
                            stopped_at: message.signal.id,
                        });
                    }
                    return PageResult::Fatal {
                        stats,
                        error,
                    };
                }
            }
        }

        PageResult::Done { stats, full_page }
    }

    /// Mark one message delivered and publish its outcome.
    async fn confirm(
        &self,
        key: &MessageKey,
        keep_until: chrono::DateTime<Utc>,
        stats: &mut PageStats,
        outcome: DispatchOutcome,
    ) -> std::result::Result<(), StorageError> {
        self.storage
            .mark_delivered(std::slice::from_ref(key), keep_until)
            .await?;
        match &outcome {
            DispatchOutcome::Success { .. } => stats.delivered += 1,
            DispatchOutcome::Ignored { .. } => stats.ignored += 1,
            DispatchOutcome::Error { .. } => stats.errored += 1,
            DispatchOutcome::Interrupted { .. } => stats.interrupted += 1,
        }
        let _ = self.outcomes.send(outcome);
        Ok(())
    }
}

enum PageResult {
    Done { stats: PageStats, full_page: bool },
    LeaseLost,
    Fatal { stats: PageStats, error: DeliveryError },
}
