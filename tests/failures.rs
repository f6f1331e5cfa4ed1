//! Failure semantics: atomic rollback and the diagnostic channel.

mod common;

use serde::{Deserialize, Serialize};

use common::drain;
use sigrail::diagnostics::DiagnosticEvent;
use sigrail::interfaces::EventStore;
use sigrail::model::{AggregateClass, CommandContext};
use sigrail::route::CommandRouting;
use sigrail::signal::SignalMessage;
use sigrail::{
    AggregateRepository, BoundedContext, EntityId, HandlerError, Signal, TenantId,
};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct VaultState {
    deposits: u32,
    balance: i64,
}

impl SignalMessage for VaultState {
    const TYPE_NAME: &'static str = "bank.VaultState";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct DepositTwice {
    vault_id: String,
    amount: i64,
}

impl SignalMessage for DepositTwice {
    const TYPE_NAME: &'static str = "bank.DepositTwice";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct Deposited {
    amount: i64,
    /// The second half of a double deposit; applying it fails.
    poisoned: bool,
}

impl SignalMessage for Deposited {
    const TYPE_NAME: &'static str = "bank.Deposited";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct Deposit {
    vault_id: String,
    amount: i64,
}

impl SignalMessage for Deposit {
    const TYPE_NAME: &'static str = "bank.Deposit";
}

/// An aggregate whose double-deposit command emits two events and whose
/// applier fails on the second one.
fn vault_repository() -> AggregateRepository<VaultState> {
    let class = AggregateClass::<VaultState>::new()
        .handle_command(
            |_state: &VaultState, cmd: DepositTwice, _ctx: &CommandContext<'_>| {
                Ok(vec![
                    Deposited {
                        amount: cmd.amount,
                        poisoned: false,
                    },
                    Deposited {
                        amount: cmd.amount,
                        poisoned: true,
                    },
                ])
            },
        )
        .unwrap()
        .handle_command(
            |_state: &VaultState, cmd: Deposit, _ctx: &CommandContext<'_>| {
                Ok(vec![Deposited {
                    amount: cmd.amount,
                    poisoned: false,
                }])
            },
        )
        .unwrap()
        .try_apply_event(|state: &mut VaultState, event: Deposited| {
            if event.poisoned {
                return Err(HandlerError::failed("ledger page is full"));
            }
            state.deposits += 1;
            state.balance += event.amount;
            Ok(())
        })
        .unwrap();
    AggregateRepository::new(class, CommandRouting::by_id_field("vault_id"))
}

/// Spec scenario: the second event apply fails, so the entity stays
/// unchanged, nothing reaches the event store, the outcome is an error
/// for the command, and the diagnostic channel reports the failure.
#[tokio::test]
async fn failure_in_second_phase_rolls_everything_back() {
    let repository = vault_repository();
    let context = BoundedContext::builder("bank")
        .manual_delivery()
        .register_aggregate(repository.clone())
        .build()
        .unwrap();
    let mut diagnostics = context.subscribe_diagnostics();
    let mut outcomes = context.subscribe_outcomes();

    let command = Signal::command(
        &DepositTwice {
            vault_id: "vault-1".into(),
            amount: 100,
        },
        None,
        TenantId::single(),
    )
    .unwrap();
    let command_id = command.id;
    let ack = context.post_command(command).await;
    assert!(ack.is_ok(), "enqueue itself succeeds");

    drain(&context).await;

    // Entity unchanged: the first event's effect was rolled back too.
    let record = repository
        .find(&TenantId::single(), &EntityId::from("vault-1"))
        .await
        .unwrap();
    assert!(record.is_none(), "no state must survive the failed dispatch");

    // Event store untouched.
    use futures::StreamExt;
    let stored: Vec<_> = context
        .event_bus()
        .event_store()
        .read(
            &TenantId::single(),
            &sigrail::interfaces::EventStreamQuery::default(),
        )
        .await
        .unwrap()
        .collect()
        .await;
    assert!(stored.is_empty());

    // The dispatch outcome names the failing command.
    let outcome = outcomes.try_recv().unwrap();
    let sigrail::DispatchOutcome::Error { signal_id, .. } = outcome else {
        panic!("expected an error outcome, got {outcome:?}");
    };
    assert_eq!(signal_id, command_id);

    // And the diagnostic channel carries the handler failure.
    let diagnostic = diagnostics.try_recv().unwrap();
    assert!(matches!(
        diagnostic,
        DiagnosticEvent::HandlerFailedUnexpectedly { signal_id, .. } if signal_id == command_id
    ));
}

/// After a failure, the same aggregate still accepts later commands.
#[tokio::test]
async fn failed_dispatch_does_not_poison_the_entity() {
    let repository = vault_repository();
    let context = BoundedContext::builder("bank")
        .manual_delivery()
        .register_aggregate(repository.clone())
        .build()
        .unwrap();

    let failing = Signal::command(
        &DepositTwice {
            vault_id: "vault-1".into(),
            amount: 100,
        },
        None,
        TenantId::single(),
    )
    .unwrap();
    context.post_command(failing).await;
    drain(&context).await;

    let good = Signal::command(
        &Deposit {
            vault_id: "vault-1".into(),
            amount: 25,
        },
        None,
        TenantId::single(),
    )
    .unwrap();
    context.post_command(good).await;
    drain(&context).await;

    let record = repository
        .find(&TenantId::single(), &EntityId::from("vault-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.state.balance, 25);
    assert_eq!(record.state.deposits, 1);
    assert_eq!(record.version.number, 1);
}
