//! Projection catch-up while live traffic keeps flowing.

mod common;

use std::collections::BTreeSet;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use common::*;
use sigrail::delivery::DeliveryBuilder;
use sigrail::interfaces::EventStore;
use sigrail::signal::{EventFactory, Signal};
use sigrail::{BoundedContext, EntityId, TenantId, TypeUrl, Version};

fn number_added(value: i64, at: chrono::DateTime<Utc>) -> Signal {
    let factory = EventFactory::for_import(EntityId::from("number-feed"), TenantId::single());
    let mut event = factory
        .create(&NumberAdded { value }, Version::of(value as u64))
        .unwrap();
    event.context.timestamp = at;
    event
}

fn catch_up_context() -> (BoundedContext, sigrail::ProjectionRepository<TotalsState>) {
    let projection = totals_repository();
    let context = BoundedContext::builder("calc")
        .manual_delivery()
        .with_delivery(
            DeliveryBuilder::new()
                .shard_count(2)
                .page_size(20)
                .idempotence_window(Duration::from_secs(3600))
                .turbulence_period(Duration::from_secs(10)),
        )
        .register_projection(projection.clone())
        .build()
        .unwrap();
    (context, projection)
}

/// Spec scenario: 100 historical events (half inside the turbulence
/// window), two live events arriving mid-catch-up. The final state is the
/// fold of all 102 events, each applied exactly once.
#[tokio::test]
async fn catch_up_converges_with_live_traffic() {
    let (context, projection) = catch_up_context();
    let tenant = TenantId::single();

    // Pre-existing history the projection has never consumed: the first
    // half well in the past, the second half inside the turbulence window.
    let now = Utc::now();
    let mut history = Vec::new();
    for i in 1..=50i64 {
        history.push(number_added(i, now - ChronoDuration::seconds(60) + ChronoDuration::milliseconds(i * 10)));
    }
    for i in 51..=100i64 {
        history.push(number_added(i, now - ChronoDuration::seconds(5) + ChronoDuration::milliseconds((i - 50) * 10)));
    }
    context
        .event_bus()
        .event_store()
        .append(&tenant, history)
        .await
        .unwrap();

    let process = context
        .catch_up(&TypeUrl::of::<TotalsState>())
        .expect("projection has a catch-up process");
    process
        .start(
            tenant.clone(),
            now - ChronoDuration::hours(1),
            BTreeSet::new(),
            vec![TypeUrl::of::<NumberAdded>()],
        )
        .await
        .unwrap();

    // Live traffic during the catch-up.
    for value in [101i64, 102] {
        let ack = context.post_event(number_added(value, Utc::now())).await;
        assert!(ack.is_ok());
    }

    let expected: i64 = (1..=102).sum();
    let mut record = None;
    for _ in 0..500 {
        drain(&context).await;
        if let Some(found) = projection
            .find(&tenant, &EntityId::from(TOTALS_ID))
            .await
            .unwrap()
        {
            if found.state.grand_total == expected {
                record = Some(found);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let record = record.expect("catch-up never converged");
    assert_eq!(record.state.grand_total, expected);
    // Exactly once each: no event was applied both as replay and live.
    assert_eq!(record.state.events_seen, 102);
    assert_eq!(record.version.number, 102);
}

/// An overlapping catch-up request for the same projection is refused.
#[tokio::test]
async fn overlapping_catch_up_is_refused() {
    let (context, _projection) = catch_up_context();
    let tenant = TenantId::single();

    // Enough history that the first catch-up stays busy for a moment.
    let now = Utc::now();
    let history: Vec<Signal> = (1..=200i64)
        .map(|i| {
            number_added(
                i,
                now - ChronoDuration::seconds(120) + ChronoDuration::milliseconds(i * 10),
            )
        })
        .collect();
    context
        .event_bus()
        .event_store()
        .append(&tenant, history)
        .await
        .unwrap();

    let process = context.catch_up(&TypeUrl::of::<TotalsState>()).unwrap();
    process
        .start(
            tenant.clone(),
            now - ChronoDuration::hours(1),
            BTreeSet::new(),
            vec![TypeUrl::of::<NumberAdded>()],
        )
        .await
        .unwrap();

    let second = process
        .start(
            tenant,
            now - ChronoDuration::hours(1),
            BTreeSet::new(),
            vec![TypeUrl::of::<NumberAdded>()],
        )
        .await;
    assert!(matches!(
        second,
        Err(sigrail::delivery::catch_up::CatchUpError::AlreadyStarted { .. })
    ));
}

/// Catch-up with `since_when` in the middle of history replays only the
/// tail, after erasing the previous state.
#[tokio::test]
async fn catch_up_since_midpoint_rebuilds_the_tail() {
    let (context, projection) = catch_up_context();
    let tenant = TenantId::single();

    let now = Utc::now();
    let cut = now - ChronoDuration::seconds(30);
    let history: Vec<Signal> = (1..=10i64)
        .map(|i| {
            number_added(
                i,
                now - ChronoDuration::seconds(60) + ChronoDuration::seconds(5 * i as i64),
            )
        })
        .collect();
    context
        .event_bus()
        .event_store()
        .append(&tenant, history)
        .await
        .unwrap();

    let process = context.catch_up(&TypeUrl::of::<TotalsState>()).unwrap();
    process
        .start(tenant.clone(), cut, BTreeSet::new(), vec![TypeUrl::of::<NumberAdded>()])
        .await
        .unwrap();

    // Events 6..=10 have timestamps at or after the cut (-30s); the
    // lower bound is inclusive of `since_when` itself.
    let expected: i64 = (6..=10).sum();
    let mut converged = false;
    for _ in 0..500 {
        drain(&context).await;
        if let Some(found) = projection
            .find(&tenant, &EntityId::from(TOTALS_ID))
            .await
            .unwrap()
        {
            if found.state.grand_total == expected {
                converged = true;
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(converged, "midpoint catch-up never converged");
}
