//! Coordinator lifecycle: state machine, drain variants, crash handling.

use std::sync::Arc;
use std::time::Duration;

use streamfuse::config::Configuration;
use streamfuse::events::{EventBus, ExecScope};
use streamfuse::exec::{AppStatus, Coordinator, DrainKind, RunError};
use streamfuse::graph::{ActorDecl, StreamGraph, StreamGraphBuilder};
use streamfuse::rate::{InputRate, Rate};
use streamfuse::types::{ActorId, GroupId, Item, Token};
use streamfuse::utils::testing::{failing_kernel, kernel, InterpFactory};

/// `in -> compress(pop 2, push 1) -> out`, keeping the first of each pair.
fn compress_graph() -> (StreamGraph, ActorId) {
    let mut b = StreamGraphBuilder::new();
    let compress = b.add_actor(ActorDecl::filter(
        "compress",
        InputRate::popping(2),
        Rate::fixed(1),
    ));
    b.connect_input(Token::OverallInput, (compress, 0)).unwrap();
    b.connect_output((compress, 0), Token::OverallOutput).unwrap();
    (b.build().unwrap(), compress)
}

fn compress_factory(compress: ActorId) -> InterpFactory {
    InterpFactory::new().with_kernel(compress, kernel(|items| vec![items[0].clone()]))
}

/// `in -> a -> b -> c -> out`, all unit-rate pass-through stages.
fn relay_graph() -> StreamGraph {
    let mut b = StreamGraphBuilder::new();
    let stages: Vec<ActorId> = ["a", "b", "c"]
        .iter()
        .map(|name| {
            b.add_actor(ActorDecl::filter(
                *name,
                InputRate::popping(1),
                Rate::fixed(1),
            ))
        })
        .collect();
    b.connect_input(Token::OverallInput, (stages[0], 0)).unwrap();
    b.connect((stages[0], 0), (stages[1], 0)).unwrap();
    b.connect((stages[1], 0), (stages[2], 0)).unwrap();
    b.connect_output((stages[2], 0), Token::OverallOutput)
        .unwrap();
    b.build().unwrap()
}

async fn expect_output(app: &mut Coordinator) -> Item {
    tokio::time::timeout(Duration::from_secs(5), app.next_output())
        .await
        .expect("output timed out")
        .expect("output channel failed")
        .expect("output closed early")
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_enforces_valid_transitions() {
    let (graph, compress) = compress_graph();
    let mut app = Coordinator::new(graph, Arc::new(compress_factory(compress)));
    assert_eq!(app.status(), AppStatus::NotStarted);

    // Draining before starting is rejected.
    assert!(matches!(
        app.drain(DrainKind::Final).await,
        Err(RunError::InvalidTransition { .. })
    ));

    let config = Configuration::builder().build();
    app.start(&config).await.unwrap();
    assert_eq!(app.status(), AppStatus::Running);

    // Starting twice is rejected.
    assert!(matches!(
        app.start(&config).await,
        Err(RunError::InvalidTransition { .. })
    ));

    app.drain(DrainKind::Final).await.unwrap();
    assert_eq!(app.status(), AppStatus::Stopped);

    // Stopped is terminal: no restart, no input.
    assert!(matches!(
        app.start(&config).await,
        Err(RunError::InvalidTransition { .. })
    ));
    assert!(matches!(
        app.push_input(Item::I64(0)).await,
        Err(RunError::InvalidTransition { .. })
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn intermediate_drain_collects_and_reseeds_leftovers() {
    let (graph, compress) = compress_graph();
    let mut app = Coordinator::new(graph, Arc::new(compress_factory(compress)));
    let config = Configuration::builder().build();
    app.start(&config).await.unwrap();

    // Five inputs: two full firings consume four, one item stays behind.
    for i in 0..5i64 {
        app.push_input(Item::I64(i)).await.unwrap();
    }
    assert_eq!(expect_output(&mut app).await, Item::I64(0));
    assert_eq!(expect_output(&mut app).await, Item::I64(2));

    let data = app.drain(DrainKind::Intermediate).await.unwrap();
    assert_eq!(app.status(), AppStatus::Reconfiguring);
    assert_eq!(data.items_for(Token::OverallInput), &[Item::I64(4)]);
    assert_eq!(data.total_items(), 1);

    // Restarting seeds the leftover back in: one more input completes the
    // pending pair and the old item comes out first.
    app.start(&config).await.unwrap();
    assert_eq!(app.status(), AppStatus::Running);
    app.push_input(Item::I64(5)).await.unwrap();
    assert_eq!(expect_output(&mut app).await, Item::I64(4));

    app.drain(DrainKind::Final).await.unwrap();
    assert_eq!(app.status(), AppStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn backlogged_drain_preserves_the_transport_backlog() {
    let (graph, compress) = compress_graph();
    let mut app = Coordinator::new(graph, Arc::new(compress_factory(compress)));
    app.start(&Configuration::builder().build()).await.unwrap();

    // Far more items than the consumer ring holds: most are still queued
    // on the input transport when the drain begins.
    for i in 0..40i64 {
        app.push_input(Item::I64(i)).await.unwrap();
    }
    let data = app.drain(DrainKind::Intermediate).await.unwrap();

    // Each pair consumed left one retained output in the residue; every
    // unconsumed item must come back on the input side, oldest first,
    // through to the last item fed.
    let inputs = data.items_for(Token::OverallInput);
    let outputs = data.items_for(Token::OverallOutput);
    assert_eq!(
        inputs.len() + 2 * outputs.len(),
        40,
        "inputs: {inputs:?}, outputs: {outputs:?}"
    );
    let first = 40 - inputs.len() as i64;
    let expected: Vec<Item> = (first..40).map(Item::I64).collect();
    assert_eq!(inputs, expected.as_slice());
}

#[tokio::test(flavor = "multi_thread")]
async fn multi_group_intermediate_drain_conserves_in_flight_items() {
    let graph = relay_graph();
    // Both fuse switches off: three single-actor groups in a chain.
    let config = Configuration::builder()
        .with_fuse(GroupId(1), false)
        .with_fuse(GroupId(2), false)
        .build();
    let mut app = Coordinator::new(graph, Arc::new(InterpFactory::new()));
    app.start(&config).await.unwrap();

    for i in 0..10i64 {
        app.push_input(Item::I64(i)).await.unwrap();
    }

    // Drain with the items scattered across transports, rings, and
    // inter-group edges; all ten must land somewhere in the residue.
    let data = app.drain(DrainKind::Intermediate).await.unwrap();
    assert_eq!(app.status(), AppStatus::Reconfiguring);
    assert_eq!(data.total_items(), 10, "residue: {data:?}");

    // Restarting replays the in-flight items in their original order.
    app.start(&config).await.unwrap();
    for i in 0..10i64 {
        assert_eq!(expect_output(&mut app).await, Item::I64(i));
    }
    app.drain(DrainKind::Final).await.unwrap();
    assert_eq!(app.status(), AppStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn final_drain_discards_leftovers() {
    let (graph, compress) = compress_graph();
    let mut app = Coordinator::new(graph, Arc::new(compress_factory(compress)));
    app.start(&Configuration::builder().build()).await.unwrap();

    app.push_input(Item::I64(7)).await.unwrap();
    let data = app.drain(DrainKind::Final).await.unwrap();
    assert!(data.is_empty());
    assert_eq!(app.status(), AppStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn work_unit_crash_forces_drain_to_error() {
    let (graph, compress) = compress_graph();
    let factory =
        InterpFactory::new().with_kernel(compress, failing_kernel(0, "bad firing"));
    let mut app = Coordinator::new(graph, Arc::new(factory));
    app.start(&Configuration::builder().build()).await.unwrap();

    app.push_input(Item::I64(1)).await.unwrap();
    app.push_input(Item::I64(2)).await.unwrap();

    // Give the core a moment to hit the failure.
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The drain still completes; the status records the crash.
    app.drain(DrainKind::Final).await.unwrap();
    assert_eq!(app.status(), AppStatus::Error);
    let reason = app.crash_reason().expect("crash reason recorded");
    assert!(reason.contains("bad firing"), "reason: {reason}");
}

#[tokio::test(flavor = "multi_thread")]
async fn lifecycle_events_reach_the_bus() {
    let (graph, compress) = compress_graph();
    let bus = EventBus::new();
    let mut app = Coordinator::new(graph, Arc::new(compress_factory(compress)))
        .with_events(bus.emitter());

    app.start(&Configuration::builder().build()).await.unwrap();
    app.drain(DrainKind::Final).await.unwrap();

    let events = bus.collect();
    let coordinator_messages: Vec<&str> = events
        .iter()
        .filter(|e| e.scope == ExecScope::Coordinator)
        .map(|e| e.message.as_str())
        .collect();
    for expected in [
        "status: compiling",
        "status: running",
        "status: draining",
        "status: stopped",
    ] {
        assert!(
            coordinator_messages.contains(&expected),
            "missing {expected:?} in {coordinator_messages:?}"
        );
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn rejected_configuration_leaves_app_startable() {
    // A graph with a range rate can't be scheduled; start() must fail
    // cleanly and leave the app in NotStarted for the next attempt.
    let mut b = StreamGraphBuilder::new();
    let loose = b.add_actor(ActorDecl::filter(
        "loose",
        InputRate::popping(1),
        Rate::range(1, 4).unwrap(),
    ));
    let tight = b.add_actor(ActorDecl::filter(
        "tight",
        InputRate::popping(1),
        Rate::fixed(1),
    ));
    b.connect_input(Token::OverallInput, (loose, 0)).unwrap();
    b.connect((loose, 0), (tight, 0)).unwrap();
    b.connect_output((tight, 0), Token::OverallOutput).unwrap();
    let graph = b.build().unwrap();

    let mut app = Coordinator::new(graph, Arc::new(InterpFactory::new()));
    let err = app
        .start(&Configuration::builder().build())
        .await
        .unwrap_err();
    assert!(matches!(err, RunError::Compile(_)));
    assert_eq!(app.status(), AppStatus::NotStarted);
}
