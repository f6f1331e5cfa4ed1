//! Single-target arithmetic through the full dispatch pipeline.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use sigrail::delivery::DeliveryBuilder;
use sigrail::signal::EventFactory;
use sigrail::{BoundedContext, EntityId, TenantId, TypeUrl};

/// Spec scenario: four signals land on one calculator, in order, and the
/// final state is their sum.
#[tokio::test]
async fn single_shard_single_target_sum() {
    let repository = calc_repository();
    let context = BoundedContext::builder("calc")
        .manual_delivery()
        .with_delivery(DeliveryBuilder::new().shard_count(1))
        .register_aggregate(repository.clone())
        .build()
        .unwrap();

    let ack1 = context.post_command(add_number("calc-1", 3)).await;
    let ack2 = context.post_command(add_number("calc-1", 5)).await;

    let imported = EventFactory::for_import(EntityId::from("importer"), TenantId::single())
        .create(
            &NumberImported {
                calc_id: "calc-1".into(),
                value: 7,
            },
            sigrail::Version::of(1),
        )
        .unwrap();
    let ack3 = context.post_event(imported).await;
    let ack4 = context.post_command(add_number("calc-1", -2)).await;

    for ack in [&ack1, &ack2, &ack3, &ack4] {
        assert!(ack.is_ok(), "unexpected ack: {ack:?}");
    }

    drain(&context).await;

    let record = repository
        .find(&TenantId::single(), &EntityId::from("calc-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state.sum, 13);
    assert_eq!(record.version.number, 4);
}

/// Spec scenario: the same command enqueued twice within the idempotence
/// window takes effect exactly once.
#[tokio::test]
async fn duplicate_command_is_deduplicated() {
    let monitor = CapturingMonitor::new();
    let repository = calc_repository();
    let context = BoundedContext::builder("calc")
        .manual_delivery()
        .with_delivery(
            DeliveryBuilder::new()
                .shard_count(3)
                .idempotence_window(Duration::from_secs(3600))
                .monitor(Arc::clone(&monitor) as Arc<dyn sigrail::DeliveryMonitor>),
        )
        .register_aggregate(repository.clone())
        .build()
        .unwrap();

    let command = add_number("calc-1", 10);
    let ack1 = context.post_command(command.clone()).await;
    let ack2 = context.post_command(command).await;
    assert!(ack1.is_ok());
    assert!(ack2.is_ok());

    drain(&context).await;

    let record = repository
        .find(&TenantId::single(), &EntityId::from("calc-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state.sum, 10, "duplicate must not double-apply");
    assert_eq!(monitor.total_ignored(), 1);
    assert_eq!(monitor.total_delivered(), 1);
}

/// Different targets land in their own shards but keep per-target FIFO.
#[tokio::test]
async fn multiple_targets_are_independent() {
    let repository = calc_repository();
    let context = BoundedContext::builder("calc")
        .manual_delivery()
        .with_delivery(DeliveryBuilder::new().shard_count(4))
        .register_aggregate(repository.clone())
        .build()
        .unwrap();

    for calc in ["calc-a", "calc-b", "calc-c"] {
        for value in [1, 2, 3] {
            context.post_command(add_number(calc, value)).await;
        }
    }
    drain(&context).await;

    for calc in ["calc-a", "calc-b", "calc-c"] {
        let record = repository
            .find(&TenantId::single(), &EntityId::from(calc))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.state.sum, 6);
        assert_eq!(record.version.number, 3);
    }
}

/// A default payload never enters the system.
#[tokio::test]
async fn default_payloads_never_enqueue() {
    let result = sigrail::Signal::command(&AddNumber::default(), None, TenantId::single());
    assert!(result.is_err());

    // Even a hand-built empty payload is refused by the bus.
    let repository = calc_repository();
    let context = BoundedContext::builder("calc")
        .manual_delivery()
        .register_aggregate(repository)
        .build()
        .unwrap();
    let mut command = add_number("calc-1", 1);
    command.payload = sigrail::AnyPayload {
        type_url: TypeUrl::of::<AddNumber>(),
        value: Vec::new(),
    };
    let ack = context.post_command(command).await;
    assert!(!ack.is_ok());
}
