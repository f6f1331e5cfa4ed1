//! Staged application of one signal to an entity.
//!
//! A transaction snapshots the entity, applies handler steps phase by
//! phase on a mutable builder, and commits atomically: either every phase
//! is reflected in the committed record, or none is. Any failure marks
//! the whole transaction failed and the pre-transaction state survives
//! untouched.

use std::sync::Arc;

use super::{EntityId, EntityRecord, LifecycleFlags, Version, VersioningStrategy};
use crate::model::HandlerError;
use crate::signal::{Signal, SignalId};

/// Result type for transaction operations.
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Errors produced by the transaction lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum TransactionError {
    #[error("phase for signal {signal_id} failed: {source}")]
    PhaseFailed {
        signal_id: SignalId,
        source: HandlerError,
    },

    #[error("builder of `{entity}` violates constraints: {message}")]
    ConstraintViolated { entity: EntityId, message: String },

    #[error("version {attempted} does not advance the current version {current}")]
    VersionMonotonicity { current: u64, attempted: u64 },

    #[error("event {signal_id} carries no version to copy")]
    MissingEventVersion { signal_id: SignalId },

    #[error("transaction already failed: {0}")]
    AlreadyFailed(String),
}

/// Validates an entity state builder against its schema invariants.
pub type Validator<S> = dyn Fn(&S) -> std::result::Result<(), String> + Send + Sync;

/// One applied step: the signal consumed and the version stamped.
#[derive(Clone, Debug, PartialEq)]
pub struct Phase {
    pub signal_id: SignalId,
    pub version: Version,
}

/// Callbacks around the transaction lifecycle.
///
/// The policy also decides whether a phase failure is propagated to the
/// repository (interrupting the rest of the delivery page) or contained
/// as a per-signal error outcome.
pub trait TransactionListener<S>: Send + Sync {
    fn on_before_phase(&self, _phase: &Phase) {}
    fn on_after_phase(&self, _phase: &Phase) {}
    fn on_phase_fail(&self, _phase: &Phase, _error: &TransactionError) {}
    fn on_before_commit(&self, _state: &S, _version: Version, _flags: LifecycleFlags) {}

    /// Whether phase failures must be rethrown to the repository.
    fn propagation_required(&self) -> bool {
        false
    }
}

/// Listener that observes nothing and contains failures.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoOpListener;

impl<S> TransactionListener<S> for NoOpListener {}

/// Listener that requires phase failures to reach the repository.
#[derive(Clone, Copy, Debug, Default)]
pub struct PropagationRequiredListener;

impl<S> TransactionListener<S> for PropagationRequiredListener {
    fn propagation_required(&self) -> bool {
        true
    }
}

/// The result of a committed transaction.
#[derive(Clone, Debug)]
pub struct Committed<S> {
    pub record: EntityRecord<S>,
    pub phases: Vec<Phase>,
}

/// An ephemeral transaction around a single entity for one signal dispatch.
pub struct Transaction<S> {
    id: EntityId,
    version0: Version,
    builder: S,
    version: Version,
    flags: LifecycleFlags,
    strategy: VersioningStrategy,
    validator: Option<Arc<Validator<S>>>,
    listener: Arc<dyn TransactionListener<S>>,
    phases: Vec<Phase>,
    failed: Option<String>,
}

impl<S: Clone> Transaction<S> {
    /// Start a transaction over the given record.
    ///
    /// The record itself is the untouched pre-transaction snapshot; the
    /// transaction works on a cloned builder.
    pub fn start(record: &EntityRecord<S>, strategy: VersioningStrategy) -> Self {
        Transaction {
            id: record.id.clone(),
            version0: record.version,
            builder: record.state.clone(),
            version: record.version,
            flags: record.flags,
            strategy,
            validator: None,
            listener: Arc::new(NoOpListener),
            phases: Vec::new(),
            failed: None,
        }
    }

    /// Attach a builder validator.
    pub fn with_validator(mut self, validator: Arc<Validator<S>>) -> Self {
        self.validator = Some(validator);
        self
    }

    /// Replace the lifecycle listener.
    pub fn with_listener(mut self, listener: Arc<dyn TransactionListener<S>>) -> Self {
        self.listener = listener;
        self
    }

    /// The mutable state being built.
    pub fn builder(&self) -> &S {
        &self.builder
    }

    /// The version the next phase will advance from.
    pub fn current_version(&self) -> Version {
        self.version
    }

    /// The version the entity had when the transaction started.
    pub fn initial_version(&self) -> Version {
        self.version0
    }

    /// Pending lifecycle flags.
    pub fn flags(&self) -> LifecycleFlags {
        self.flags
    }

    /// Mark the entity archived (or unarchived) at commit.
    pub fn set_archived(&mut self, archived: bool) {
        self.flags.archived = archived;
    }

    /// Mark the entity deleted (or restored) at commit.
    pub fn set_deleted(&mut self, deleted: bool) {
        self.flags.deleted = deleted;
    }

    /// Apply one step for `signal` on the builder.
    ///
    /// Runs the listener hooks, the step itself, and builder validation.
    /// On failure the transaction as a whole becomes unusable and the
    /// error is returned.
    pub fn apply_phase<F>(&mut self, signal: &Signal, step: F) -> Result<()>
    where
        F: FnOnce(&mut S) -> std::result::Result<(), HandlerError>,
    {
        if let Some(cause) = &self.failed {
            return Err(TransactionError::AlreadyFailed(cause.clone()));
        }

        let next_version = match self.next_version(signal) {
            Ok(version) => version,
            Err(error) => {
                let phase = Phase {
                    signal_id: signal.id,
                    version: self.version,
                };
                return Err(self.fail(phase, error));
            }
        };
        let phase = Phase {
            signal_id: signal.id,
            version: next_version,
        };
        self.listener.on_before_phase(&phase);

        if let Err(source) = step(&mut self.builder) {
            let error = TransactionError::PhaseFailed {
                signal_id: signal.id,
                source,
            };
            return Err(self.fail(phase, error));
        }

        if let Some(validator) = &self.validator {
            if let Err(message) = validator(&self.builder) {
                let error = TransactionError::ConstraintViolated {
                    entity: self.id.clone(),
                    message,
                };
                return Err(self.fail(phase, error));
            }
        }

        self.version = next_version;
        self.phases.push(phase.clone());
        self.listener.on_after_phase(&phase);
        Ok(())
    }

    /// Commit: produce the new record reflecting every applied phase.
    pub fn commit(self) -> Result<Committed<S>> {
        if let Some(cause) = self.failed {
            return Err(TransactionError::AlreadyFailed(cause));
        }
        self.listener
            .on_before_commit(&self.builder, self.version, self.flags);
        Ok(Committed {
            record: EntityRecord {
                id: self.id,
                state: self.builder,
                version: self.version,
                flags: self.flags,
            },
            phases: self.phases,
        })
    }

    /// Discard the transaction. The pre-transaction record is untouched.
    pub fn rollback(self) {
        drop(self);
    }

    /// Whether phase failures must be rethrown to the repository.
    pub fn propagation_required(&self) -> bool {
        self.listener.propagation_required()
    }

    fn next_version(&self, signal: &Signal) -> Result<Version> {
        match self.strategy {
            VersioningStrategy::AutoIncrement => Ok(self.version.increment()),
            VersioningStrategy::FromEvent => {
                let event_version = signal.context.version.ok_or(
                    TransactionError::MissingEventVersion {
                        signal_id: signal.id,
                    },
                )?;
                if event_version.number <= self.version.number {
                    return Err(TransactionError::VersionMonotonicity {
                        current: self.version.number,
                        attempted: event_version.number,
                    });
                }
                Ok(event_version)
            }
        }
    }

    fn fail(&mut self, phase: Phase, error: TransactionError) -> TransactionError {
        self.failed = Some(error.to_string());
        self.listener.on_phase_fail(&phase, &error);
        error
    }
}
