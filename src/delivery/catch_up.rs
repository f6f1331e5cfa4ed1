//! Projection catch-up.
//!
//! A catch-up process rebuilds projection state from the event history
//! while the live stream keeps flowing. History is read in rounds up to
//! the turbulence window; inside the window, replays and live events
//! coexist and are deduplicated by signal id in the shard inbox. While a
//! projection is catching up, its live messages stay pending; they drain
//! once the process completes.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use uuid::Uuid;

use super::{Delivery, ShardIndex};
use crate::bus::EventBus;
use crate::entity::{EntityId, Version};
use crate::interfaces::{EventStore, EventStreamQuery, StorageError};
use crate::signal::{
    EventFactory, Signal, SignalMessage, TenantId, TypeUrl,
};

/// Result type for catch-up operations.
pub type Result<T> = std::result::Result<T, CatchUpError>;

/// Errors raised by catch-up processes.
#[derive(Debug, thiserror::Error)]
pub enum CatchUpError {
    #[error("a catch-up for `{projection_type}` is already running")]
    AlreadyStarted { projection_type: TypeUrl },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Status of one catch-up process.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CatchUpStatus {
    Undefined,
    Started,
    Finalizing,
    Completed,
}

/// Identity of one catch-up process.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CatchUpId {
    pub projection_type: TypeUrl,
    pub uuid: Uuid,
}

impl fmt::Display for CatchUpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.projection_type.simple_name(), self.uuid)
    }
}

impl fmt::Debug for CatchUpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CatchUpId({self})")
    }
}

/// What a catch-up was asked to do.
#[derive(Clone, Debug)]
pub struct CatchUpRequest {
    pub tenant: TenantId,
    /// Projection instances to rebuild; empty means every instance.
    pub targets: BTreeSet<EntityId>,
    pub since_when: DateTime<Utc>,
    /// Event classes to replay; empty means all classes.
    pub event_types: Vec<TypeUrl>,
}

/// The state of one catch-up process.
#[derive(Clone, Debug)]
pub struct CatchUp {
    pub id: CatchUpId,
    pub request: CatchUpRequest,
    pub status: CatchUpStatus,
    pub when_last_read: DateTime<Utc>,
    pub current_round: u32,
    pub affected_shards: BTreeSet<u32>,
    pub total_shards: u32,
}

/// Registry of running catch-up jobs, consulted by delivery for gating.
#[derive(Default)]
pub struct CatchUpRegistry {
    jobs: RwLock<HashMap<CatchUpId, CatchUp>>,
}

impl CatchUpRegistry {
    pub async fn upsert(&self, job: CatchUp) {
        self.jobs.write().await.insert(job.id.clone(), job);
    }

    pub async fn remove(&self, id: &CatchUpId) {
        self.jobs.write().await.remove(id);
    }

    pub async fn get(&self, id: &CatchUpId) -> Option<CatchUp> {
        self.jobs.read().await.get(id).cloned()
    }

    /// The status of a job covering the given target, if one exists.
    pub async fn gate_for(
        &self,
        projection_type: &TypeUrl,
        target: &EntityId,
    ) -> Option<CatchUpStatus> {
        let jobs = self.jobs.read().await;
        jobs.values()
            .find(|job| {
                job.id.projection_type == *projection_type
                    && (job.request.targets.is_empty() || job.request.targets.contains(target))
            })
            .map(|job| job.status)
    }

    /// Whether a new request would overlap a running job.
    pub async fn overlaps(
        &self,
        projection_type: &TypeUrl,
        targets: &BTreeSet<EntityId>,
    ) -> bool {
        let jobs = self.jobs.read().await;
        jobs.values().any(|job| {
            job.id.projection_type == *projection_type
                && job.status != CatchUpStatus::Completed
                && (job.request.targets.is_empty()
                    || targets.is_empty()
                    || !job.request.targets.is_disjoint(targets))
        })
    }
}

/// The projection-side port of a catch-up process.
///
/// Implemented by projection repositories: resets targeted state and
/// enqueues replayed events into the shard inboxes with the replay mark.
#[async_trait]
pub trait CatchUpTarget: Send + Sync {
    fn projection_type(&self) -> &TypeUrl;

    /// Erase the state of the targeted instances (all if empty) before
    /// the replay starts.
    async fn purge(
        &self,
        tenant: &TenantId,
        targets: &BTreeSet<EntityId>,
    ) -> std::result::Result<(), StorageError>;

    /// Route and enqueue one replayed event, narrowed to the given
    /// targets when non-empty. Returns the ids actually dispatched to.
    async fn dispatch_replay(
        &self,
        event: &Signal,
        narrow_to: &BTreeSet<EntityId>,
    ) -> std::result::Result<BTreeSet<EntityId>, StorageError>;
}

// Lifecycle events of a catch-up process. They travel the event bus like
// any other event, so observers and tests can follow the process.

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CatchUpRequested {
    pub catch_up_id: String,
    pub projection_type: String,
}

impl SignalMessage for CatchUpRequested {
    const TYPE_NAME: &'static str = "sigrail.catchup.CatchUpRequested";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CatchUpStarted {
    pub catch_up_id: String,
    pub projection_type: String,
}

impl SignalMessage for CatchUpStarted {
    const TYPE_NAME: &'static str = "sigrail.catchup.CatchUpStarted";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryEventsRecalled {
    pub catch_up_id: String,
    pub round: u32,
    pub recalled: u32,
}

impl SignalMessage for HistoryEventsRecalled {
    const TYPE_NAME: &'static str = "sigrail.catchup.HistoryEventsRecalled";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HistoryFullyRecalled {
    pub catch_up_id: String,
}

impl SignalMessage for HistoryFullyRecalled {
    const TYPE_NAME: &'static str = "sigrail.catchup.HistoryFullyRecalled";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveEventsPickedUp {
    pub catch_up_id: String,
    pub picked_up: u32,
}

impl SignalMessage for LiveEventsPickedUp {
    const TYPE_NAME: &'static str = "sigrail.catchup.LiveEventsPickedUp";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CatchUpCompleted {
    pub catch_up_id: String,
    pub projection_type: String,
}

impl SignalMessage for CatchUpCompleted {
    const TYPE_NAME: &'static str = "sigrail.catchup.CatchUpCompleted";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardProcessingRequested {
    pub catch_up_id: String,
    pub index: u32,
    pub of_total: u32,
}

impl SignalMessage for ShardProcessingRequested {
    const TYPE_NAME: &'static str = "sigrail.catchup.ShardProcessingRequested";
}

/// Drives catch-ups for one projection type.
#[derive(Clone)]
pub struct CatchUpProcess {
    target: Arc<dyn CatchUpTarget>,
    event_store: Arc<dyn EventStore>,
    event_bus: Arc<EventBus>,
    delivery: Arc<Delivery>,
    registry: Arc<CatchUpRegistry>,
    page_size: usize,
    turbulence: ChronoDuration,
}

impl CatchUpProcess {
    pub(crate) fn new(
        target: Arc<dyn CatchUpTarget>,
        event_store: Arc<dyn EventStore>,
        event_bus: Arc<EventBus>,
        delivery: Arc<Delivery>,
    ) -> Self {
        let config = delivery.config();
        let turbulence = ChronoDuration::from_std(config.turbulence_period)
            .unwrap_or_else(|_| ChronoDuration::milliseconds(500));
        CatchUpProcess {
            target,
            event_store,
            event_bus,
            registry: delivery.catch_ups(),
            page_size: config.page_size,
            turbulence,
            delivery,
        }
    }

    pub fn projection_type(&self) -> &TypeUrl {
        self.target.projection_type()
    }

    /// Start a catch-up for the given instances (all when empty).
    ///
    /// Purges the targeted state, then replays history in rounds on a
    /// background task. Fails if an overlapping catch-up is running.
    pub async fn start(
        &self,
        tenant: TenantId,
        since_when: DateTime<Utc>,
        targets: BTreeSet<EntityId>,
        event_types: Vec<TypeUrl>,
    ) -> Result<CatchUpId> {
        let projection_type = self.target.projection_type().clone();
        if self.registry.overlaps(&projection_type, &targets).await {
            return Err(CatchUpError::AlreadyStarted { projection_type });
        }

        let id = CatchUpId {
            projection_type: projection_type.clone(),
            uuid: Uuid::new_v4(),
        };
        // Shift the lower bound a nanosecond back so `since_when` itself
        // is included by the strictly-after read.
        let when_last_read = since_when - ChronoDuration::nanoseconds(1);
        let job = CatchUp {
            id: id.clone(),
            request: CatchUpRequest {
                tenant: tenant.clone(),
                targets: targets.clone(),
                since_when,
                event_types,
            },
            status: CatchUpStatus::Undefined,
            when_last_read,
            current_round: 0,
            affected_shards: BTreeSet::new(),
            total_shards: self.delivery.shard_count(),
        };
        self.registry.upsert(job.clone()).await;

        let mut emitter = SignalEmitter::new(&id, &tenant);
        self.emit(
            &mut emitter,
            &CatchUpRequested {
                catch_up_id: id.to_string(),
                projection_type: projection_type.to_string(),
            },
        )
        .await;

        // The replay rebuilds state from scratch; the targeted instances
        // are erased before the first round.
        self.target.purge(&tenant, &targets).await?;
        let mut job = job;
        job.status = CatchUpStatus::Started;
        self.registry.upsert(job).await;
        self.emit(
            &mut emitter,
            &CatchUpStarted {
                catch_up_id: id.to_string(),
                projection_type: projection_type.to_string(),
            },
        )
        .await;
        info!(catch_up = %id, "catch-up started");

        let process = self.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            process.run(task_id, emitter).await;
        });
        Ok(id)
    }

    async fn run(self, id: CatchUpId, mut emitter: SignalEmitter) {
        loop {
            let Some(job) = self.registry.get(&id).await else {
                return;
            };
            match job.status {
                CatchUpStatus::Started => {
                    if let Err(e) = self.recall_round(&id, &mut emitter).await {
                        error!(catch_up = %id, error = %e, "catch-up round failed");
                        self.registry.remove(&id).await;
                        return;
                    }
                }
                CatchUpStatus::Finalizing => {
                    if let Err(e) = self.finalize(&id, &mut emitter).await {
                        error!(catch_up = %id, error = %e, "catch-up finalization failed");
                        self.registry.remove(&id).await;
                        return;
                    }
                    return;
                }
                CatchUpStatus::Undefined | CatchUpStatus::Completed => return,
            }
        }
    }

    /// One recall round: read a history page below the turbulence window
    /// and replay it, or conclude the history is fully recalled.
    async fn recall_round(&self, id: &CatchUpId, emitter: &mut SignalEmitter) -> Result<()> {
        let Some(mut job) = self.registry.get(id).await else {
            return Ok(());
        };
        job.current_round += 1;

        let turbulence_start = Utc::now() - self.turbulence;
        let events = self
            .read_events(&job, Some(turbulence_start), Some(self.page_size))
            .await?;

        if events.is_empty() {
            job.status = CatchUpStatus::Finalizing;
            self.registry.upsert(job).await;
            self.emit(
                emitter,
                &HistoryFullyRecalled {
                    catch_up_id: id.to_string(),
                },
            )
            .await;
            return Ok(());
        }

        let kept = strip_last_timestamp(events);
        let recalled = kept.len() as u32;
        // Events sharing the stripped timestamp are re-read next round,
        // preserving order when the store holds more of that instant.
        job.when_last_read = kept
            .last()
            .map(|e| e.context.timestamp)
            .unwrap_or(job.when_last_read);
        self.dispatch_batch(&mut job, &kept).await?;
        let round = job.current_round;
        self.registry.upsert(job).await;
        self.emit(
            emitter,
            &HistoryEventsRecalled {
                catch_up_id: id.to_string(),
                round,
                recalled,
            },
        )
        .await;
        debug!(catch_up = %id, round, recalled, "history events recalled");
        Ok(())
    }

    /// Read the remainder (turbulence window included), then complete.
    async fn finalize(&self, id: &CatchUpId, emitter: &mut SignalEmitter) -> Result<()> {
        let Some(mut job) = self.registry.get(id).await else {
            return Ok(());
        };

        let events = self.read_events(&job, None, None).await?;
        if !events.is_empty() {
            self.dispatch_batch(&mut job, &events).await?;
            self.emit(
                emitter,
                &LiveEventsPickedUp {
                    catch_up_id: id.to_string(),
                    picked_up: events.len() as u32,
                },
            )
            .await;
        }

        job.status = CatchUpStatus::Completed;
        let affected: Vec<u32> = job.affected_shards.iter().copied().collect();
        let total = job.total_shards;
        self.registry.upsert(job).await;
        self.emit(
            emitter,
            &CatchUpCompleted {
                catch_up_id: id.to_string(),
                projection_type: self.target.projection_type().to_string(),
            },
        )
        .await;
        info!(catch_up = %id, "catch-up completed");

        // Nudge every touched shard so the paused live messages drain
        // without waiting for the next worker scan.
        for index in affected {
            self.emit(
                emitter,
                &ShardProcessingRequested {
                    catch_up_id: id.to_string(),
                    index,
                    of_total: total,
                },
            )
            .await;
        }
        self.registry.remove(id).await;
        for index in self.all_shards() {
            let _ = self
                .delivery
                .deliver_messages_from(ShardIndex::new(index, total))
                .await;
        }
        Ok(())
    }

    fn all_shards(&self) -> std::ops::Range<u32> {
        0..self.delivery.shard_count()
    }

    async fn read_events(
        &self,
        job: &CatchUp,
        read_before: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<Signal>> {
        if let Some(before) = read_before {
            if before <= job.when_last_read {
                return Ok(Vec::new());
            }
        }
        let query = EventStreamQuery {
            event_types: job.request.event_types.clone(),
            after: Some(job.when_last_read),
            before: read_before,
            limit,
        };
        let stream = self.event_store.read(&job.request.tenant, &query).await?;
        let events: Vec<Signal> = stream
            // An open filter must not replay catch-up lifecycle events.
            .filter(|e| {
                let own = e.message_class().as_str().contains("/sigrail.catchup.");
                async move { !own }
            })
            .collect()
            .await;
        Ok(events)
    }

    async fn dispatch_batch(&self, job: &mut CatchUp, events: &[Signal]) -> Result<()> {
        for event in events {
            let dispatched = self
                .target
                .dispatch_replay(event, &job.request.targets)
                .await?;
            for target in dispatched {
                let shard = self
                    .delivery
                    .shard_for(self.target.projection_type(), &target);
                job.affected_shards.insert(shard.index);
            }
        }
        job.total_shards = self.delivery.shard_count();
        Ok(())
    }

    async fn emit<M: SignalMessage>(&self, emitter: &mut SignalEmitter, message: &M) {
        match emitter.create(message) {
            Ok(event) => {
                let ack = self.event_bus.post(event).await;
                if !ack.is_ok() {
                    error!(catch_up_event = M::TYPE_NAME, ?ack, "catch-up event not accepted");
                }
            }
            Err(e) => error!(catch_up_event = M::TYPE_NAME, error = %e, "catch-up event packing failed"),
        }
    }
}

/// Emits the lifecycle events of one catch-up with increasing versions.
struct SignalEmitter {
    factory: EventFactory,
    seq: u64,
}

impl SignalEmitter {
    fn new(id: &CatchUpId, tenant: &TenantId) -> Self {
        SignalEmitter {
            factory: EventFactory::for_import(
                EntityId::Str(format!("catch-up:{id}")),
                tenant.clone(),
            ),
            seq: 0,
        }
    }

    fn create<M: SignalMessage>(
        &mut self,
        message: &M,
    ) -> std::result::Result<Signal, crate::signal::PayloadError> {
        self.seq += 1;
        self.factory.create(message, Version::of(self.seq))
    }
}

/// Drop the trailing events that share the last timestamp of the batch.
///
/// The store may hold further events of that same instant; they are read
/// in the next round to preserve ordering. A batch whose events all share
/// one timestamp is kept whole.
fn strip_last_timestamp(events: Vec<Signal>) -> Vec<Signal> {
    let Some(last) = events.last() else {
        return events;
    };
    let last_ts = last.context.timestamp;
    match events.iter().rposition(|e| e.context.timestamp != last_ts) {
        Some(index) => events[..=index].to_vec(),
        None => events,
    }
}
