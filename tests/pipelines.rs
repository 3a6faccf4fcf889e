//! End-to-end pipeline execution through the coordinator with the
//! interpreting work-unit backend.

use std::sync::Arc;
use std::time::Duration;

use streamfuse::config::Configuration;
use streamfuse::exec::{AppStatus, Coordinator, DrainKind};
use streamfuse::types::Item;
use streamfuse::utils::testing::{kernel, three_stage_pipeline, split_join_graph, InterpFactory};

async fn expect_output(app: &mut Coordinator) -> Item {
    tokio::time::timeout(Duration::from_secs(5), app.next_output())
        .await
        .expect("output timed out")
        .expect("output channel failed")
        .expect("output closed early")
}

#[tokio::test(flavor = "multi_thread")]
async fn three_stage_chain_round_trips_items() {
    let (graph, [source, downsample, _sink]) = three_stage_pipeline();
    // source duplicates its input (pop 1, push 2); downsample keeps the
    // first of each pair; sink passes through. Net effect: identity.
    let factory = InterpFactory::new()
        .with_kernel(source, kernel(|items| {
            vec![items[0].clone(), items[0].clone()]
        }))
        .with_kernel(downsample, kernel(|items| vec![items[0].clone()]));
    let mut app = Coordinator::new(graph, Arc::new(factory));

    app.start(&Configuration::builder().build()).await.unwrap();
    assert_eq!(app.status(), AppStatus::Running);

    for i in 0..8i64 {
        app.push_input(Item::I64(i)).await.unwrap();
    }
    for i in 0..8i64 {
        assert_eq!(expect_output(&mut app).await, Item::I64(i));
    }

    let data = app.drain(DrainKind::Final).await.unwrap();
    assert!(data.is_empty());
    assert_eq!(app.status(), AppStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn split_join_preserves_round_robin_order() {
    let (graph, _) = split_join_graph();
    // Pass-through kernels everywhere: split deals (a, b) to its two
    // branches, join reassembles them in port order.
    let mut app = Coordinator::new(graph, Arc::new(InterpFactory::new()));
    app.start(&Configuration::builder().build()).await.unwrap();

    for i in 0..6i64 {
        app.push_input(Item::I64(i)).await.unwrap();
    }
    for i in 0..6i64 {
        assert_eq!(expect_output(&mut app).await, Item::I64(i));
    }

    app.drain(DrainKind::Final).await.unwrap();
    assert_eq!(app.status(), AppStatus::Stopped);
}

#[tokio::test(flavor = "multi_thread")]
async fn cross_machine_partition_runs_through_channels() {
    use streamfuse::compile::PartitionMap;
    use streamfuse::types::{GroupId, MachineId};

    let (graph, [source, downsample, _sink]) = three_stage_pipeline();
    let factory = InterpFactory::new()
        .with_kernel(source, kernel(|items| {
            vec![items[0].clone(), items[0].clone()]
        }))
        .with_kernel(downsample, kernel(|items| vec![items[0].clone()]));
    // Keep three groups and spread them over two machines so the interior
    // edges run through boundary channel pairs.
    let config = Configuration::builder()
        .with_fuse(GroupId(1), false)
        .with_fuse(GroupId(2), false)
        .build();
    let partition = PartitionMap::new()
        .assign(GroupId(0), MachineId(0))
        .assign(GroupId(1), MachineId(1))
        .assign(GroupId(2), MachineId(1));
    let mut app =
        Coordinator::new(graph, Arc::new(factory)).with_partition(partition);

    app.start(&config).await.unwrap();
    for i in 0..4i64 {
        app.push_input(Item::I64(i)).await.unwrap();
    }
    for i in 0..4i64 {
        assert_eq!(expect_output(&mut app).await, Item::I64(i));
    }
    app.drain(DrainKind::Final).await.unwrap();
    assert_eq!(app.status(), AppStatus::Stopped);
}
