//! Property tests over the pure parts of the dispatch substrate.

mod common;

use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use proptest::prelude::*;
use uuid::Uuid;

use common::{AddNumber, CalcState, NumberAdded};
use sigrail::delivery::{InboxMessage, InboxStatus, ShardIndex, ShardingStrategy, UniformHashStrategy};
use sigrail::entity::transaction::{Transaction, TransactionError};
use sigrail::entity::{EntityRecord, VersioningStrategy};
use sigrail::route::{CommandRouting, RoutingError};
use sigrail::signal::{EventFactory, Signal};
use sigrail::{EntityId, TenantId, TypeUrl, Version};

fn arb_entity_id() -> impl Strategy<Value = EntityId> {
    prop_oneof![
        any::<i64>().prop_map(EntityId::Int),
        "[a-z0-9-]{1,24}".prop_map(EntityId::Str),
        any::<[u8; 16]>().prop_map(|b| EntityId::Uuid(Uuid::from_bytes(b))),
    ]
}

proptest! {
    /// The sharding function is total, in range, and identical across
    /// strategy instances (hence across nodes).
    #[test]
    fn sharding_is_deterministic_and_in_range(
        id in arb_entity_id(),
        type_name in "[A-Za-z.]{1,32}",
        total in 1u32..=64,
    ) {
        let entity_type = TypeUrl::parse(format!("type.sigrail.dev/{type_name}"));
        let here = UniformHashStrategy.shard_for(&id, &entity_type, total);
        let there = UniformHashStrategy.shard_for(&id, &entity_type, total);
        prop_assert!(here.index < total);
        prop_assert_eq!(here, there);
    }

    /// Page order is a total order: received_at ascending, ties broken
    /// by signal id.
    #[test]
    fn page_order_is_consistent(offsets in prop::collection::vec(0i64..10_000, 2..50)) {
        let base = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let mut messages: Vec<InboxMessage> = offsets
            .iter()
            .map(|ms| {
                let event = EventFactory::for_import(
                    EntityId::from("feed"),
                    TenantId::single(),
                )
                .create(&NumberAdded { value: 1 }, Version::of(1))
                .unwrap();
                InboxMessage {
                    shard: ShardIndex::new(0, 1),
                    signal: event,
                    target_type: TypeUrl::of::<CalcState>(),
                    target_id: EntityId::from("calc-1"),
                    status: InboxStatus::ToDeliver,
                    received_at: base + ChronoDuration::milliseconds(*ms),
                    keep_until: None,
                    from_catch_up: false,
                }
            })
            .collect();
        messages.sort_by(InboxMessage::page_order);
        for pair in messages.windows(2) {
            let ordered = pair[0].received_at < pair[1].received_at
                || (pair[0].received_at == pair[1].received_at
                    && pair[0].signal.id <= pair[1].signal.id);
            prop_assert!(ordered);
        }
    }

    /// Version monotonicity: a `FromEvent` transaction accepts a version
    /// sequence iff it is strictly increasing.
    #[test]
    fn from_event_versions_must_strictly_increase(
        versions in prop::collection::vec(1u64..50, 1..12),
    ) {
        let record = EntityRecord::<CalcState>::fresh(EntityId::from("calc-1"));
        let mut tx = Transaction::start(&record, VersioningStrategy::FromEvent);
        let command = Signal::command(
            &AddNumber { calc_id: "calc-1".into(), value: 1 },
            None,
            TenantId::single(),
        ).unwrap();
        let factory = EventFactory::for_producer(EntityId::from("calc-1"), &command);

        let mut last = 0u64;
        let mut failed_at = None;
        for (index, version) in versions.iter().enumerate() {
            let event = factory
                .create(&NumberAdded { value: 1 }, Version::of(*version))
                .unwrap();
            let result = tx.apply_phase(&event, |state| {
                state.sum += 1;
                Ok(())
            });
            if *version > last {
                prop_assert!(result.is_ok(), "increasing version refused");
                last = *version;
            } else {
                prop_assert!(
                    matches!(result, Err(TransactionError::VersionMonotonicity { .. })),
                    "expected VersionMonotonicity error"
                );
                failed_at = Some(index);
                break;
            }
        }

        match failed_at {
            None => {
                let committed = tx.commit().unwrap();
                prop_assert_eq!(committed.record.version.number, last);
            }
            Some(_) => prop_assert!(tx.commit().is_err()),
        }
    }

    /// Command routing is total: every signal resolves to exactly one id
    /// or fails with a routing error, never anything else.
    #[test]
    fn command_routing_is_total(
        calc_id in "[a-z0-9-]{0,24}",
        value in any::<i64>(),
        field in prop_oneof![Just("calc_id".to_string()), "[a-z_]{1,12}"],
    ) {
        prop_assume!(!(calc_id.is_empty() && value == 0));
        let routing = CommandRouting::by_id_field(field.clone());
        let command = Signal::command(
            &AddNumber { calc_id: calc_id.clone(), value },
            None,
            TenantId::single(),
        ).unwrap();
        match routing.apply(&command) {
            Ok(target) => {
                prop_assert_eq!(&field, "calc_id");
                prop_assert_eq!(target, EntityId::Str(calc_id));
            }
            Err(RoutingError::RouteFailed { .. }) => {}
            Err(other) => prop_assert!(false, "unexpected error: {other}"),
        }
    }

    /// Entity id serialization is injective across the generated space.
    #[test]
    fn entity_id_bytes_distinguish_ids(a in arb_entity_id(), b in arb_entity_id()) {
        if a != b {
            prop_assert_ne!(a.to_bytes(), b.to_bytes());
        } else {
            prop_assert_eq!(a.to_bytes(), b.to_bytes());
        }
    }
}
