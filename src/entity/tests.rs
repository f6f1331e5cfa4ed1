use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::transaction::{
    NoOpListener, PropagationRequiredListener, Transaction, TransactionError, TransactionListener,
};
use super::*;
use crate::model::HandlerError;
use crate::signal::{EventFactory, Signal, SignalMessage, TenantId};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct Counter {
    sum: i64,
}

impl SignalMessage for Counter {
    const TYPE_NAME: &'static str = "calc.Counter";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct AddNumber {
    value: i64,
}

impl SignalMessage for AddNumber {
    const TYPE_NAME: &'static str = "calc.AddNumber";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct NumberAdded {
    value: i64,
}

impl SignalMessage for NumberAdded {
    const TYPE_NAME: &'static str = "calc.NumberAdded";
}

fn command() -> Signal {
    Signal::command(&AddNumber { value: 1 }, None, TenantId::single()).unwrap()
}

fn event(value: i64, version: u64) -> Signal {
    let factory = EventFactory::for_producer(EntityId::from("calc-1"), &command());
    factory
        .create(&NumberAdded { value }, Version::of(version))
        .unwrap()
}

fn fresh() -> EntityRecord<Counter> {
    EntityRecord::fresh(EntityId::from("calc-1"))
}

#[test]
fn entity_id_bytes_are_deterministic_and_distinct() {
    assert_eq!(
        EntityId::from("calc-1").to_bytes(),
        EntityId::from("calc-1").to_bytes()
    );
    assert_ne!(
        EntityId::from("1").to_bytes(),
        EntityId::Int(1).to_bytes()
    );
    assert_ne!(
        EntityId::Int(1).to_bytes(),
        EntityId::Int(2).to_bytes()
    );
}

#[test]
fn version_increments_monotonically() {
    let v1 = Version::initial();
    let v2 = v1.increment();
    assert_eq!(v2.number, v1.number + 1);
}

#[test]
fn lifecycle_flags_default_active() {
    let flags = LifecycleFlags::default();
    assert!(flags.is_active());
}

#[test]
fn auto_increment_applies_phases_in_order() {
    let record = fresh();
    let mut tx = Transaction::start(&record, VersioningStrategy::AutoIncrement);

    for value in [3, 5, -2] {
        tx.apply_phase(&event(value, 0), |builder| {
            builder.sum += value;
            Ok(())
        })
        .unwrap();
    }

    let committed = tx.commit().unwrap();
    assert_eq!(committed.record.state.sum, 6);
    assert_eq!(committed.record.version.number, 3);
    assert_eq!(committed.phases.len(), 3);
    assert_eq!(
        committed.phases.iter().map(|p| p.version.number).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
}

#[test]
fn from_event_copies_event_versions() {
    let record = fresh();
    let mut tx = Transaction::start(&record, VersioningStrategy::FromEvent);

    tx.apply_phase(&event(3, 1), |builder| {
        builder.sum += 3;
        Ok(())
    })
    .unwrap();
    tx.apply_phase(&event(5, 2), |builder| {
        builder.sum += 5;
        Ok(())
    })
    .unwrap();

    let committed = tx.commit().unwrap();
    assert_eq!(committed.record.version.number, 2);
}

#[test]
fn from_event_enforces_monotonicity() {
    let record = fresh();
    let mut tx = Transaction::start(&record, VersioningStrategy::FromEvent);

    tx.apply_phase(&event(3, 2), |builder| {
        builder.sum += 3;
        Ok(())
    })
    .unwrap();

    let stale = tx.apply_phase(&event(5, 2), |builder| {
        builder.sum += 5;
        Ok(())
    });
    assert!(matches!(
        stale,
        Err(TransactionError::VersionMonotonicity {
            current: 2,
            attempted: 2
        })
    ));
    // The failed transaction cannot commit.
    assert!(matches!(
        tx.commit(),
        Err(TransactionError::AlreadyFailed(_))
    ));
}

#[test]
fn from_event_requires_an_event_version() {
    let record = fresh();
    let mut tx = Transaction::start(&record, VersioningStrategy::FromEvent);
    let result = tx.apply_phase(&command(), |_| Ok(()));
    assert!(matches!(
        result,
        Err(TransactionError::MissingEventVersion { .. })
    ));
}

#[test]
fn failed_phase_aborts_the_whole_transaction() {
    let record = fresh();
    let mut tx = Transaction::start(&record, VersioningStrategy::AutoIncrement);

    tx.apply_phase(&event(3, 0), |builder| {
        builder.sum += 3;
        Ok(())
    })
    .unwrap();
    let failed = tx.apply_phase(&event(5, 0), |builder| {
        builder.sum += 5;
        Err(HandlerError::failed("applier exploded"))
    });
    assert!(matches!(failed, Err(TransactionError::PhaseFailed { .. })));

    // No commit is possible; the pre-transaction record is what survives.
    assert!(tx.commit().is_err());
    assert_eq!(record.state.sum, 0);
    assert_eq!(record.version.number, 0);
}

#[test]
fn validator_rejects_invalid_builders() {
    let record = fresh();
    let mut tx = Transaction::start(&record, VersioningStrategy::AutoIncrement)
        .with_validator(Arc::new(|state: &Counter| {
            if state.sum < 0 {
                Err("sum must not go negative".to_string())
            } else {
                Ok(())
            }
        }));

    let result = tx.apply_phase(&event(-2, 0), |builder| {
        builder.sum -= 2;
        Ok(())
    });
    assert!(matches!(
        result,
        Err(TransactionError::ConstraintViolated { .. })
    ));
}

#[test]
fn lifecycle_flags_commit_with_the_record() {
    let record = fresh();
    let mut tx = Transaction::start(&record, VersioningStrategy::AutoIncrement);
    tx.set_archived(true);
    tx.apply_phase(&event(1, 0), |builder| {
        builder.sum += 1;
        Ok(())
    })
    .unwrap();
    let committed = tx.commit().unwrap();
    assert!(committed.record.flags.archived);
    assert!(!committed.record.flags.deleted);
}

#[derive(Default)]
struct CountingListener {
    before: AtomicUsize,
    after: AtomicUsize,
    failed: AtomicUsize,
    commits: AtomicUsize,
}

impl TransactionListener<Counter> for CountingListener {
    fn on_before_phase(&self, _phase: &super::transaction::Phase) {
        self.before.fetch_add(1, Ordering::SeqCst);
    }

    fn on_after_phase(&self, _phase: &super::transaction::Phase) {
        self.after.fetch_add(1, Ordering::SeqCst);
    }

    fn on_phase_fail(&self, _phase: &super::transaction::Phase, _error: &TransactionError) {
        self.failed.fetch_add(1, Ordering::SeqCst);
    }

    fn on_before_commit(&self, _state: &Counter, _version: Version, _flags: LifecycleFlags) {
        self.commits.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn listener_sees_the_lifecycle() {
    let listener = Arc::new(CountingListener::default());
    let record = fresh();
    let mut tx = Transaction::start(&record, VersioningStrategy::AutoIncrement)
        .with_listener(Arc::clone(&listener) as Arc<dyn TransactionListener<Counter>>);

    tx.apply_phase(&event(1, 0), |builder| {
        builder.sum += 1;
        Ok(())
    })
    .unwrap();
    let _ = tx.apply_phase(&event(2, 0), |_| Err(HandlerError::failed("no")));

    assert_eq!(listener.before.load(Ordering::SeqCst), 2);
    assert_eq!(listener.after.load(Ordering::SeqCst), 1);
    assert_eq!(listener.failed.load(Ordering::SeqCst), 1);
    assert_eq!(listener.commits.load(Ordering::SeqCst), 0);
}

#[test]
fn listener_policies_differ_on_propagation() {
    let record = fresh();
    let contained =
        Transaction::start(&record, VersioningStrategy::AutoIncrement).with_listener(Arc::new(NoOpListener));
    assert!(!contained.propagation_required());

    let propagated = Transaction::start(&record, VersioningStrategy::AutoIncrement)
        .with_listener(Arc::new(PropagationRequiredListener));
    assert!(propagated.propagation_required());
}
