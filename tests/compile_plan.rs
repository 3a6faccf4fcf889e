//! Compilation pipeline output: token schedules, unboxing, allocation.

use streamfuse::compile::{compile, PartitionMap};
use streamfuse::config::Configuration;
use streamfuse::graph::{ActorDecl, StreamGraphBuilder};
use streamfuse::rate::{InputRate, Rate};
use streamfuse::types::{ElementType, GroupId, MachineId, Token};
use streamfuse::utils::testing::three_stage_pipeline;

/// `in -> a(pop 1, push 3) -> b(pop 2, push 2) -> c(pop 9, push 1) -> out`.
/// The minimal balance vector over (a, b, c) is (6, 9, 2).
fn fractional_chain() -> streamfuse::graph::StreamGraph {
    let mut g = StreamGraphBuilder::new();
    let a = g.add_actor(ActorDecl::filter("a", InputRate::popping(1), Rate::fixed(3)));
    let b = g.add_actor(ActorDecl::filter("b", InputRate::popping(2), Rate::fixed(2)));
    let c = g.add_actor(ActorDecl::filter("c", InputRate::popping(9), Rate::fixed(1)));
    g.connect_input(Token::OverallInput, (a, 0)).unwrap();
    g.connect((a, 0), (b, 0)).unwrap();
    g.connect((b, 0), (c, 0)).unwrap();
    g.connect_output((c, 0), Token::OverallOutput).unwrap();
    g.build().unwrap()
}

#[test]
fn token_schedule_counts_boundary_items() {
    let plan = compile(fractional_chain(), &Configuration::builder().build()).unwrap();
    // One steady iteration consumes 6 overall-input items and produces 2.
    assert_eq!(plan.token_reads().get(&Token::OverallInput), Some(&6));
    assert_eq!(plan.token_writes().get(&Token::OverallOutput), Some(&2));
}

#[test]
fn token_schedule_is_fusion_invariant() {
    let fused = compile(fractional_chain(), &Configuration::builder().build()).unwrap();
    let apart = compile(
        fractional_chain(),
        &Configuration::builder()
            .with_fuse(GroupId(1), false)
            .with_fuse(GroupId(2), false)
            .build(),
    )
    .unwrap();
    assert_eq!(fused.groups().len(), 1);
    assert_eq!(apart.groups().len(), 3);
    assert_eq!(fused.token_reads(), apart.token_reads());
    assert_eq!(fused.token_writes(), apart.token_writes());
}

#[test]
fn internal_storages_need_no_buffers() {
    let (graph, _) = three_stage_pipeline();
    let plan = compile(graph, &Configuration::builder().build()).unwrap();
    // Fully fused: only the two boundary storages get requirements.
    assert_eq!(plan.requirements().len(), 2);
    for (sid, req) in plan.requirements() {
        let storage = plan.graph().storage(*sid).unwrap();
        assert!(storage.touches_boundary());
        assert!(u64::try_from(req.capacity(1)).unwrap() >= req.items_per_iteration);
    }
}

#[test]
fn unboxing_narrows_agreed_primitive_types() {
    let mut b = StreamGraphBuilder::new();
    let double = b.add_actor(
        ActorDecl::filter("double", InputRate::popping(1), Rate::fixed(1))
            .typed(ElementType::I64, ElementType::I64),
    );
    let stringify = b.add_actor(
        ActorDecl::filter("stringify", InputRate::popping(1), Rate::fixed(1))
            .typed(ElementType::I64, ElementType::Text),
    );
    b.connect_input(Token::OverallInput, (double, 0)).unwrap();
    let mid = b.connect((double, 0), (stringify, 0)).unwrap();
    let out = b.connect_output((stringify, 0), Token::OverallOutput).unwrap();
    let graph = b.build().unwrap();

    let plan = compile(
        graph,
        &Configuration::builder().with_fuse(GroupId(1), false).build(),
    )
    .unwrap();
    // Both actors agree on i64 across the middle edge; narrowed.
    assert_eq!(
        plan.graph().storage(mid).unwrap().element_type(),
        ElementType::I64
    );
    // Text is never unboxed.
    assert_eq!(
        plan.graph().storage(out).unwrap().element_type(),
        ElementType::Any
    );
}

#[test]
fn multiplier_scales_producer_side_buffers() {
    let (graph, actors) = three_stage_pipeline();
    let config = Configuration::builder()
        .with_fuse(GroupId(1), false)
        .with_fuse(GroupId(2), false)
        .with_multiplier(MachineId(1), 8)
        .build();
    let plan = compile(graph, &config).unwrap();
    let partition = PartitionMap::new()
        .assign(plan.groups().group_of(actors[0]), MachineId(1));

    let base = plan
        .allocate_buffers(&PartitionMap::new(), &config)
        .unwrap();
    let scaled = plan.allocate_buffers(&partition, &config).unwrap();
    // The source's output storage is owned by machine 1 under the
    // partition and gets the larger multiplier.
    let edge = plan
        .graph()
        .storages()
        .iter()
        .find(|s| s.token() == Some(Token::Between(actors[0], actors[1])))
        .map(|s| s.id())
        .unwrap();
    assert!(scaled[&edge].capacity() > base[&edge].capacity());
}
