use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::*;
use crate::interfaces::{NoValidationSchemaRegistry, SchemaRegistry, Violations};
use crate::signal::{
    Ack, AckStatus, AnyPayload, DispatchOutcome, Envelope, Signal, SignalKind, SignalMessage,
    TenantId,
};
use crate::storage::InMemoryEventStore;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct Ping {
    n: u32,
}

impl SignalMessage for Ping {
    const TYPE_NAME: &'static str = "test.Ping";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct Pong {
    n: u32,
}

impl SignalMessage for Pong {
    const TYPE_NAME: &'static str = "test.Pong";
}

struct CountingDispatcher {
    id: String,
    classes: Vec<TypeUrl>,
    count: Arc<AtomicUsize>,
}

impl CountingDispatcher {
    fn new(id: &str, classes: Vec<TypeUrl>) -> (Arc<Self>, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let dispatcher = Arc::new(CountingDispatcher {
            id: id.to_string(),
            classes,
            count: Arc::clone(&count),
        });
        (dispatcher, count)
    }
}

#[async_trait]
impl SignalDispatcher for CountingDispatcher {
    fn id(&self) -> &str {
        &self.id
    }

    fn message_classes(&self) -> Vec<TypeUrl> {
        self.classes.clone()
    }

    async fn dispatch(&self, signal: &Signal) -> DispatchOutcome {
        self.count.fetch_add(1, Ordering::SeqCst);
        DispatchOutcome::quiet_success(signal.id)
    }
}

fn schema() -> Arc<dyn SchemaRegistry> {
    Arc::new(NoValidationSchemaRegistry)
}

fn ping(n: u32) -> Signal {
    Signal::command(&Ping { n }, None, TenantId::single()).unwrap()
}

#[tokio::test]
async fn unicast_registry_refuses_second_dispatcher() {
    let registry = DispatcherRegistry::unicast();
    let (first, _) = CountingDispatcher::new("first", vec![TypeUrl::of::<Ping>()]);
    let (second, _) = CountingDispatcher::new("second", vec![TypeUrl::of::<Ping>()]);

    registry.register(first).unwrap();
    let result = registry.register(second);
    assert!(matches!(result, Err(BusError::DuplicateHandler { .. })));
}

#[tokio::test]
async fn empty_class_set_is_invalid() {
    let registry = DispatcherRegistry::multicast();
    let (dispatcher, _) = CountingDispatcher::new("empty", vec![]);
    let result = registry.register(dispatcher);
    assert!(matches!(result, Err(BusError::InvalidDispatcher { .. })));
}

#[tokio::test]
async fn unregister_removes_all_associations() {
    let registry = DispatcherRegistry::multicast();
    let (dispatcher, _) = CountingDispatcher::new(
        "wide",
        vec![TypeUrl::of::<Ping>(), TypeUrl::of::<Pong>()],
    );
    registry.register(dispatcher).unwrap();
    assert_eq!(registry.registered_classes().len(), 2);

    registry.unregister("wide");
    assert!(registry.registered_classes().is_empty());
}

#[tokio::test]
async fn command_without_dispatcher_is_acked_with_error() {
    let bus = CommandBus::new(schema(), FilterChain::default());
    let ack = bus.post(ping(1)).await;
    assert!(matches!(
        ack.status,
        AckStatus::Error { ref code, .. } if code == "unsupported_command"
    ));
}

#[tokio::test]
async fn command_reaches_its_single_dispatcher() {
    let bus = CommandBus::new(schema(), FilterChain::default());
    let (dispatcher, count) = CountingDispatcher::new("calc", vec![TypeUrl::of::<Ping>()]);
    bus.register(dispatcher).unwrap();

    let ack = bus.post(ping(1)).await;
    assert!(ack.is_ok());
    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn empty_payload_is_rejected_before_dispatch() {
    let bus = CommandBus::new(schema(), FilterChain::default());
    let (dispatcher, count) = CountingDispatcher::new("calc", vec![TypeUrl::of::<Ping>()]);
    bus.register(dispatcher).unwrap();

    let mut signal = ping(1);
    signal.payload = AnyPayload {
        type_url: TypeUrl::of::<Ping>(),
        value: Vec::new(),
    };
    let ack = bus.post(signal).await;
    assert!(matches!(
        ack.status,
        AckStatus::Error { ref code, .. } if code == "default_message"
    ));
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn wrong_family_is_rejected() {
    let bus = CommandBus::new(schema(), FilterChain::default());
    let mut signal = ping(1);
    signal.kind = SignalKind::Event;
    let ack = bus.post(signal).await;
    assert!(matches!(
        ack.status,
        AckStatus::Error { ref code, .. } if code == "wrong_signal_kind"
    ));
}

struct RefusingSchema;

impl SchemaRegistry for RefusingSchema {
    fn validate(&self, _payload: &AnyPayload) -> std::result::Result<(), Violations> {
        Err(Violations::of(vec!["field `n` must be positive".into()]))
    }
}

#[tokio::test]
async fn schema_violations_surface_in_the_ack() {
    let bus = CommandBus::new(Arc::new(RefusingSchema), FilterChain::default());
    let ack = bus.post(ping(1)).await;
    assert!(matches!(
        ack.status,
        AckStatus::Error { ref code, ref message } if code == "invalid_payload"
            && message.contains("positive")
    ));
}

struct AnsweringFilter;

impl BusFilter for AnsweringFilter {
    fn accept(&self, envelope: &Envelope<'_>) -> FilterOutcome {
        FilterOutcome::Ack(Ack::error(envelope.signal_id(), "scheduled", "later"))
    }
}

struct DroppingFilter;

impl BusFilter for DroppingFilter {
    fn accept(&self, _envelope: &Envelope<'_>) -> FilterOutcome {
        FilterOutcome::Drop
    }
}

#[tokio::test]
async fn filter_can_answer_instead_of_dispatching() {
    let filters = FilterChain::new(vec![Arc::new(AnsweringFilter)]);
    let bus = CommandBus::new(schema(), filters);
    let (dispatcher, count) = CountingDispatcher::new("calc", vec![TypeUrl::of::<Ping>()]);
    bus.register(dispatcher).unwrap();

    let ack = bus.post(ping(1)).await;
    assert!(matches!(
        ack.status,
        AckStatus::Error { ref code, .. } if code == "scheduled"
    ));
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn filter_can_drop_silently() {
    let filters = FilterChain::new(vec![Arc::new(DroppingFilter)]);
    let bus = CommandBus::new(schema(), filters);
    let (dispatcher, count) = CountingDispatcher::new("calc", vec![TypeUrl::of::<Ping>()]);
    bus.register(dispatcher).unwrap();

    let ack = bus.post(ping(1)).await;
    assert!(ack.is_ok());
    assert_eq!(count.load(Ordering::SeqCst), 0);
}

fn event(n: u32) -> Signal {
    let cmd = ping(n);
    let factory = crate::signal::EventFactory::for_producer(
        crate::entity::EntityId::from("test-1"),
        &cmd,
    );
    factory
        .create(&Pong { n }, crate::entity::Version::of(u64::from(n)))
        .unwrap()
}

#[tokio::test]
async fn events_fan_out_to_every_dispatcher() {
    let store = Arc::new(InMemoryEventStore::new());
    let bus = EventBus::new(schema(), FilterChain::default(), store);
    let (first, first_count) = CountingDispatcher::new("one", vec![TypeUrl::of::<Pong>()]);
    let (second, second_count) = CountingDispatcher::new("two", vec![TypeUrl::of::<Pong>()]);
    bus.register(first).unwrap();
    bus.register(second).unwrap();

    let ack = bus.post(event(1)).await;
    assert!(ack.is_ok());
    assert_eq!(first_count.load(Ordering::SeqCst), 1);
    assert_eq!(second_count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn events_are_stored_even_without_dispatchers() {
    let store = Arc::new(InMemoryEventStore::new());
    let bus = EventBus::new(schema(), FilterChain::default(), Arc::clone(&store) as _);

    let ack = bus.post(event(1)).await;
    assert!(ack.is_ok());
    assert_eq!(store.len(&TenantId::single()).await, 1);
}

#[tokio::test]
async fn store_failure_fails_the_ack() {
    let store = Arc::new(InMemoryEventStore::new());
    store.set_fail_on_append(true).await;
    let bus = EventBus::new(schema(), FilterChain::default(), Arc::clone(&store) as _);

    let ack = bus.post(event(1)).await;
    assert!(matches!(
        ack.status,
        AckStatus::Error { ref code, .. } if code == "event_store"
    ));
}

#[tokio::test]
async fn batch_acks_come_back_in_input_order() {
    let bus = CommandBus::new(schema(), FilterChain::default());
    let (dispatcher, _) = CountingDispatcher::new("calc", vec![TypeUrl::of::<Ping>()]);
    bus.register(dispatcher).unwrap();

    let commands: Vec<Signal> = (1..=3).map(ping).collect();
    let ids: Vec<_> = commands.iter().map(|c| c.id).collect();
    let acks = bus.post_all(commands).await;
    assert_eq!(acks.iter().map(|a| a.signal_id).collect::<Vec<_>>(), ids);
}

#[tokio::test]
async fn rejection_bus_fans_out() {
    let bus = RejectionBus::new(schema(), FilterChain::default());
    let (dispatcher, count) = CountingDispatcher::new("pm", vec![TypeUrl::of::<Pong>()]);
    bus.register(dispatcher).unwrap();

    let cmd = ping(1);
    let payload = AnyPayload::pack(&Pong { n: 1 }).unwrap();
    let rejection = Signal::rejection(payload, &cmd);
    let ack = bus.post(rejection).await;
    assert!(ack.is_ok());
    assert_eq!(count.load(Ordering::SeqCst), 1);
}
