use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::*;
use crate::entity::Version;
use crate::signal::{EventFactory, SignalMessage, TenantId};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct CreateTask {
    task_id: String,
    title: String,
}

impl SignalMessage for CreateTask {
    const TYPE_NAME: &'static str = "tasks.CreateTask";
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct TaskCreated {
    task_id: String,
    assignees: Vec<String>,
}

impl SignalMessage for TaskCreated {
    const TYPE_NAME: &'static str = "tasks.TaskCreated";
}

fn create_task(id: &str) -> Signal {
    Signal::command(
        &CreateTask {
            task_id: id.to_string(),
            title: "write tests".to_string(),
        },
        None,
        TenantId::single(),
    )
    .unwrap()
}

fn task_created(id: &str, assignees: &[&str]) -> Signal {
    let factory = EventFactory::for_producer(EntityId::from(id), &create_task(id));
    factory
        .create(
            &TaskCreated {
                task_id: id.to_string(),
                assignees: assignees.iter().map(|s| s.to_string()).collect(),
            },
            Version::of(1),
        )
        .unwrap()
}

#[test]
fn command_default_reads_the_id_field() {
    let routing = CommandRouting::by_id_field("task_id");
    let target = routing.apply(&create_task("task-7")).unwrap();
    assert_eq!(target, EntityId::from("task-7"));
}

#[test]
fn command_default_fails_on_missing_field() {
    let routing = CommandRouting::by_id_field("nope");
    let result = routing.apply(&create_task("task-7"));
    assert!(matches!(result, Err(RoutingError::RouteFailed { .. })));
}

#[test]
fn explicit_command_route_wins_over_default() {
    let routing = CommandRouting::by_id_field("task_id");
    routing
        .route(|cmd: &CreateTask, _ctx: &CommandContext<'_>| EntityId::Str(format!("board-of-{}", cmd.task_id)))
        .unwrap();
    let target = routing.apply(&create_task("task-7")).unwrap();
    assert_eq!(target, EntityId::from("board-of-task-7"));
}

#[test]
fn duplicate_command_route_is_refused() {
    let routing = CommandRouting::by_id_field("task_id");
    routing
        .route(|cmd: &CreateTask, _ctx: &CommandContext<'_>| EntityId::Str(cmd.task_id.clone()))
        .unwrap();
    let duplicate = routing.route(|cmd: &CreateTask, _ctx: &CommandContext<'_>| EntityId::Str(cmd.task_id.clone()));
    assert!(matches!(duplicate, Err(RoutingError::DuplicateRoute(_))));
}

#[test]
fn removing_a_missing_route_is_an_error() {
    let routing = CommandRouting::by_id_field("task_id");
    let missing = routing.remove(&TypeUrl::of::<CreateTask>());
    assert!(matches!(missing, Err(RoutingError::RouteNotFound(_))));
}

#[test]
fn removed_route_falls_back_to_default() {
    let routing = CommandRouting::by_id_field("task_id");
    routing
        .route(|_cmd: &CreateTask, _ctx: &CommandContext<'_>| EntityId::from("elsewhere"))
        .unwrap();
    routing.remove(&TypeUrl::of::<CreateTask>()).unwrap();
    let target = routing.apply(&create_task("task-7")).unwrap();
    assert_eq!(target, EntityId::from("task-7"));
}

#[test]
fn event_default_routes_to_the_producer() {
    let routing = EventRouting::by_producer();
    let targets = routing.apply(&task_created("task-7", &[]));
    assert_eq!(targets, one("task-7"));
}

#[test]
fn event_without_producer_routes_nowhere() {
    let routing = EventRouting::by_producer();
    let mut event = task_created("task-7", &[]);
    event.context.producer = None;
    assert!(routing.apply(&event).is_empty());
}

#[test]
fn explicit_event_route_may_fan_out() {
    let routing = EventRouting::by_producer();
    routing
        .route(|event: &TaskCreated, _ctx: &EventContext<'_>| {
            event
                .assignees
                .iter()
                .map(|a| EntityId::Str(a.clone()))
                .collect::<BTreeSet<_>>()
        })
        .unwrap();
    let targets = routing.apply(&task_created("task-7", &["ann", "bob"]));
    assert_eq!(targets.len(), 2);
    assert!(targets.contains(&EntityId::from("ann")));
    assert!(targets.contains(&EntityId::from("bob")));
}

#[test]
fn event_route_with_no_targets_means_ignored() {
    let routing = EventRouting::by_producer();
    routing
        .route(|_event: &TaskCreated, _ctx: &EventContext<'_>| BTreeSet::new())
        .unwrap();
    assert!(routing.apply(&task_created("task-7", &["ann"])).is_empty());
}
