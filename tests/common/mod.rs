//! Shared fixtures: a calculator aggregate, a totals projection, and an
//! order process manager, wired the way a hosting application would.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};

use sigrail::delivery::{DeliveryMonitor, PageStats, ShardIndex};
use sigrail::model::{
    AggregateClass, CommandContext, EventContext, ProcessManagerClass, ProjectionClass,
};
use sigrail::route::{CommandRouting, EventRouting};
use sigrail::signal::SignalMessage;
use sigrail::{
    AggregateRepository, BoundedContext, EntityId, ProcessManagerRepository,
    ProjectionRepository, Signal, TenantId,
};

// ---------------------------------------------------------------------------
// Calculator domain
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CalcState {
    pub sum: i64,
}

impl SignalMessage for CalcState {
    const TYPE_NAME: &'static str = "calc.CalcState";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct AddNumber {
    pub calc_id: String,
    pub value: i64,
}

impl SignalMessage for AddNumber {
    const TYPE_NAME: &'static str = "calc.AddNumber";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NumberImported {
    pub calc_id: String,
    pub value: i64,
}

impl SignalMessage for NumberImported {
    const TYPE_NAME: &'static str = "calc.NumberImported";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct NumberAdded {
    pub value: i64,
}

impl SignalMessage for NumberAdded {
    const TYPE_NAME: &'static str = "calc.NumberAdded";
}

/// The calculator: commands and imported numbers fold into a sum.
pub fn calc_repository() -> AggregateRepository<CalcState> {
    let class = AggregateClass::<CalcState>::new()
        .handle_command(
            |_state: &CalcState, cmd: AddNumber, _ctx: &CommandContext<'_>| {
                Ok(vec![NumberAdded { value: cmd.value }])
            },
        )
        .unwrap()
        .react_on_event(
            |_state: &CalcState, event: NumberImported, _ctx: &EventContext<'_>| {
                Ok(vec![NumberAdded { value: event.value }])
            },
        )
        .unwrap()
        .apply_event(|state: &mut CalcState, event: NumberAdded| {
            state.sum += event.value;
        })
        .unwrap();

    let event_routing = EventRouting::by_producer();
    event_routing
        .route(|event: &NumberImported, _ctx: &EventContext<'_>| {
            std::iter::once(EntityId::from(event.calc_id.clone())).collect()
        })
        .unwrap();

    AggregateRepository::new(class, CommandRouting::by_id_field("calc_id"))
        .with_event_routing(event_routing)
}

pub fn add_number(calc_id: &str, value: i64) -> Signal {
    Signal::command(
        &AddNumber {
            calc_id: calc_id.to_string(),
            value,
        },
        Some("tester"),
        TenantId::single(),
    )
    .unwrap()
}

// ---------------------------------------------------------------------------
// Totals projection
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TotalsState {
    pub grand_total: i64,
    pub events_seen: u32,
}

impl SignalMessage for TotalsState {
    const TYPE_NAME: &'static str = "calc.TotalsState";
}

/// A projection folding every `NumberAdded` into one grand total.
pub fn totals_repository() -> ProjectionRepository<TotalsState> {
    let class = ProjectionClass::<TotalsState>::new()
        .subscribe_to_event(
            |state: &mut TotalsState, event: NumberAdded, _ctx: &EventContext<'_>| {
                state.grand_total += event.value;
                state.events_seen += 1;
                Ok(())
            },
        )
        .unwrap();
    let routing =
        EventRouting::with_default(|_| std::iter::once(EntityId::from("totals")).collect());
    ProjectionRepository::new(class, routing)
}

pub const TOTALS_ID: &str = "totals";

// ---------------------------------------------------------------------------
// Order process manager domain
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderProcessState {
    pub orders_seen: u32,
}

impl SignalMessage for OrderProcessState {
    const TYPE_NAME: &'static str = "shop.OrderProcessState";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PlaceOrder {
    pub order_id: String,
    pub customer: String,
    pub items: u32,
}

impl SignalMessage for PlaceOrder {
    const TYPE_NAME: &'static str = "shop.PlaceOrder";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ReserveStock {
    pub order_id: String,
    pub items: u32,
}

impl SignalMessage for ReserveStock {
    const TYPE_NAME: &'static str = "shop.ReserveStock";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ChargeCard {
    pub order_id: String,
    pub customer: String,
}

impl SignalMessage for ChargeCard {
    const TYPE_NAME: &'static str = "shop.ChargeCard";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StockState {
    pub reserved: u32,
}

impl SignalMessage for StockState {
    const TYPE_NAME: &'static str = "shop.StockState";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StockReserved {
    pub items: u32,
    /// The root order command this reservation descends from.
    pub placed_by: String,
}

impl SignalMessage for StockReserved {
    const TYPE_NAME: &'static str = "shop.StockReserved";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CardState {
    pub charges: u32,
}

impl SignalMessage for CardState {
    const TYPE_NAME: &'static str = "shop.CardState";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CardCharged {
    pub customer: String,
    pub placed_by: String,
}

impl SignalMessage for CardCharged {
    const TYPE_NAME: &'static str = "shop.CardCharged";
}

/// The order process: substitutes `PlaceOrder` with the two commands the
/// downstream aggregates execute.
pub fn order_process_repository() -> ProcessManagerRepository<OrderProcessState> {
    let class = ProcessManagerClass::<OrderProcessState>::new()
        .substitute_command(
            |state: &mut OrderProcessState, cmd: PlaceOrder, _ctx: &CommandContext<'_>| {
                state.orders_seen += 1;
                Ok((
                    ReserveStock {
                        order_id: cmd.order_id.clone(),
                        items: cmd.items,
                    },
                    ChargeCard {
                        order_id: cmd.order_id,
                        customer: cmd.customer,
                    },
                ))
            },
        )
        .unwrap();
    ProcessManagerRepository::new(class, CommandRouting::by_id_field("order_id"))
}

/// Stock aggregate; the produced event records the ancestor command id.
pub fn stock_repository() -> AggregateRepository<StockState> {
    let class = AggregateClass::<StockState>::new()
        .handle_command(
            |_state: &StockState, cmd: ReserveStock, ctx: &CommandContext<'_>| {
                Ok(vec![StockReserved {
                    items: cmd.items,
                    placed_by: ctx
                        .parent_command_id()
                        .map(|id| id.to_string())
                        .unwrap_or_default(),
                }])
            },
        )
        .unwrap()
        .apply_event(|state: &mut StockState, event: StockReserved| {
            state.reserved += event.items;
        })
        .unwrap();
    AggregateRepository::new(class, CommandRouting::by_id_field("order_id"))
}

pub fn card_repository() -> AggregateRepository<CardState> {
    let class = AggregateClass::<CardState>::new()
        .handle_command(
            |_state: &CardState, cmd: ChargeCard, ctx: &CommandContext<'_>| {
                Ok(vec![CardCharged {
                    customer: cmd.customer,
                    placed_by: ctx
                        .parent_command_id()
                        .map(|id| id.to_string())
                        .unwrap_or_default(),
                }])
            },
        )
        .unwrap()
        .apply_event(|state: &mut CardState, event: CardCharged| {
            state.charges += 1;
        })
        .unwrap();
    AggregateRepository::new(class, CommandRouting::by_id_field("order_id"))
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Monitor that captures every committed page.
#[derive(Default)]
pub struct CapturingMonitor {
    pages: Mutex<Vec<(ShardIndex, PageStats)>>,
}

impl CapturingMonitor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn total_ignored(&self) -> u32 {
        self.pages.lock().unwrap().iter().map(|(_, s)| s.ignored).sum()
    }

    pub fn total_delivered(&self) -> u32 {
        self.pages
            .lock()
            .unwrap()
            .iter()
            .map(|(_, s)| s.delivered)
            .sum()
    }
}

impl DeliveryMonitor for CapturingMonitor {
    fn page_committed(&self, shard: ShardIndex, stats: &PageStats) {
        self.pages.lock().unwrap().push((shard, *stats));
    }
}

/// Drive every shard until a pass delivers nothing, settling cascades of
/// produced signals. For contexts built with `manual_delivery`.
pub async fn drain(context: &BoundedContext) {
    let shard_count = context.delivery().shard_count();
    loop {
        let mut delivered = 0;
        for shard in 0..shard_count {
            if let Ok(Some(stats)) = context
                .delivery()
                .deliver_messages_from(ShardIndex::new(shard, shard_count))
                .await
            {
                delivered += stats.delivered_count;
            }
        }
        if delivered == 0 {
            break;
        }
    }
}
