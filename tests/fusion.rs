//! Fusion engine behavior: switches, peeking, initial data, idempotence.

use streamfuse::config::Configuration;
use streamfuse::fusion::fuse_groups;
use streamfuse::graph::{ActorDecl, GroupArena, StreamGraphBuilder};
use streamfuse::rate::{InputRate, Rate};
use streamfuse::types::{GroupId, Item, Token};
use streamfuse::utils::testing::{peeking_pipeline, split_join_graph, three_stage_pipeline};

#[test]
fn chain_fuses_completely_by_default() {
    let (graph, actors) = three_stage_pipeline();
    let config = Configuration::builder().build();
    let plan = streamfuse::compile::compile(graph, &config).unwrap();
    assert_eq!(plan.groups().len(), 1);
    let gid = plan.groups().group_of(actors[0]);
    for actor in actors {
        assert_eq!(plan.groups().group_of(actor), gid);
    }
}

#[test]
fn split_join_fuses_completely() {
    let (graph, actors) = split_join_graph();
    let plan = streamfuse::compile::compile(graph, &Configuration::builder().build()).unwrap();
    assert_eq!(plan.groups().len(), 1);
    let group = plan
        .groups()
        .group(plan.groups().group_of(actors[0]))
        .unwrap();
    // The merged internal schedule balances all four members at one firing.
    for actor in actors {
        assert_eq!(group.firings_of(actor), 1, "actor {actor}");
    }
}

#[test]
fn fusion_switch_keeps_a_group_separate() {
    let (graph, actors) = three_stage_pipeline();
    let config = Configuration::builder().with_fuse(GroupId(1), false).build();
    let plan = streamfuse::compile::compile(graph, &config).unwrap();
    // downsample refused to fuse upward; sink still fused into it.
    assert_eq!(plan.groups().len(), 2);
    assert_ne!(
        plan.groups().group_of(actors[0]),
        plan.groups().group_of(actors[1]),
    );
    assert_eq!(
        plan.groups().group_of(actors[1]),
        plan.groups().group_of(actors[2]),
    );
}

#[test]
fn peeking_group_is_never_fused() {
    let (graph, [pre, avg, post]) = peeking_pipeline();
    let plan = streamfuse::compile::compile(graph, &Configuration::builder().build()).unwrap();
    assert_eq!(plan.groups().len(), 2);
    assert_ne!(plan.groups().group_of(pre), plan.groups().group_of(avg));
    // Peeking blocks fusing *into a predecessor*; a non-peeking successor
    // still fuses downward into the peeking group.
    assert_eq!(plan.groups().group_of(avg), plan.groups().group_of(post));
}

#[test]
fn seeded_edge_blocks_fusion_across_it() {
    let mut b = StreamGraphBuilder::new();
    let source = b.add_actor(ActorDecl::filter(
        "source",
        InputRate::popping(1),
        Rate::fixed(1),
    ));
    let sink = b.add_actor(ActorDecl::filter(
        "sink",
        InputRate::popping(1),
        Rate::fixed(1),
    ));
    b.connect_input(Token::OverallInput, (source, 0)).unwrap();
    let edge = b.connect((source, 0), (sink, 0)).unwrap();
    b.connect_output((sink, 0), Token::OverallOutput).unwrap();
    b.seed(edge, vec![Item::I64(1), Item::I64(2)]).unwrap();
    let graph = b.build().unwrap();

    let plan = streamfuse::compile::compile(graph, &Configuration::builder().build()).unwrap();
    assert_eq!(plan.groups().len(), 2);
    assert_ne!(
        plan.groups().group_of(source),
        plan.groups().group_of(sink)
    );
}

#[test]
fn fusion_is_idempotent_at_fixed_point() {
    let (graph, _) = three_stage_pipeline();
    let config = Configuration::builder().build();
    // Singleton groups carry their trivial one-firing schedules already.
    let mut groups = GroupArena::singletons(&graph);
    let first = {
        let plan = streamfuse::compile::compile(graph.clone(), &config).unwrap();
        plan.groups().len()
    };
    // Driving the engine directly: after reaching the fixed point, another
    // pass performs zero merges and leaves the partition unchanged.
    let merges = fuse_groups(&graph, &mut groups, &config).unwrap();
    assert_eq!(groups.len(), first);
    assert!(merges > 0);
    let again = fuse_groups(&graph, &mut groups, &config).unwrap();
    assert_eq!(again, 0);
    assert_eq!(groups.len(), first);
}

#[test]
fn fusion_preserves_per_actor_throughput() {
    // Fused or not, each actor fires the same number of times per steady
    // iteration: internal firings times the external multiplicity.
    let (graph, actors) = three_stage_pipeline();
    let fused =
        streamfuse::compile::compile(graph.clone(), &Configuration::builder().build()).unwrap();
    let apart = streamfuse::compile::compile(
        graph,
        &Configuration::builder()
            .with_fuse(GroupId(1), false)
            .with_fuse(GroupId(2), false)
            .build(),
    )
    .unwrap();
    for actor in actors {
        let total = |plan: &streamfuse::compile::CompiledPlan| {
            let gid = plan.groups().group_of(actor);
            let internal = plan.groups().group(gid).map(|g| g.firings_of(actor)).unwrap();
            internal * plan.external_schedule().multiplicity(&gid)
        };
        assert_eq!(total(&fused), total(&apart), "actor {actor}");
    }
}
