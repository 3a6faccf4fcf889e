//! Priming schedule computation on compiled plans.

use streamfuse::config::Configuration;
use streamfuse::types::{GroupId, Token};
use streamfuse::utils::testing::{peeking_pipeline, three_stage_pipeline};

#[test]
fn peek_window_drives_upstream_priming() {
    // avg pops 1 but examines 3, so its input needs indices {0, 1, 2}
    // before the first steady iteration; pre must fire 3 times.
    let (graph, [pre, avg, _post]) = peeking_pipeline();
    let plan = streamfuse::compile::compile(graph, &Configuration::builder().build()).unwrap();
    let pre_group = plan.groups().group_of(pre);
    let avg_group = plan.groups().group_of(avg);

    assert_eq!(plan.init_schedule().actual_init(pre_group), 3);
    assert_eq!(plan.init_schedule().total_init(pre_group), 3);
    // The downstream group has no actor-consumed output; nothing to prime.
    assert_eq!(plan.init_schedule().actual_init(avg_group), 0);
    assert_eq!(plan.init_schedule().total_init(avg_group), 0);
}

#[test]
fn total_init_accumulates_downstream_allowances() {
    // Unfused three-stage chain: the source must prime its own consumer
    // and additionally cover the middle group's priming firings.
    let (graph, actors) = three_stage_pipeline();
    let config = Configuration::builder()
        .with_fuse(GroupId(1), false)
        .with_fuse(GroupId(2), false)
        .build();
    let plan = streamfuse::compile::compile(graph, &config).unwrap();
    let init = plan.init_schedule();

    let g = |i: usize| plan.groups().group_of(actors[i]);
    assert_eq!(init.actual_init(g(0)), 1);
    assert_eq!(init.actual_init(g(1)), 1);
    assert_eq!(init.actual_init(g(2)), 0);
    assert_eq!(init.total_init(g(0)), 2);
    assert_eq!(init.total_init(g(1)), 1);
    assert_eq!(init.total_init(g(2)), 0);
}

#[test]
fn total_init_dominates_actual_init() {
    for plan in [
        streamfuse::compile::compile(
            three_stage_pipeline().0,
            &Configuration::builder().with_fuse(GroupId(1), false).build(),
        )
        .unwrap(),
        streamfuse::compile::compile(peeking_pipeline().0, &Configuration::builder().build())
            .unwrap(),
    ] {
        let init = plan.init_schedule();
        for gid in plan.group_order() {
            assert!(
                init.total_init(gid) >= init.actual_init(gid),
                "group {gid}"
            );
        }
    }
}

#[test]
fn priming_writes_reserve_buffer_headroom() {
    // The pre -> avg storage must hold one steady iteration (1 item), the
    // peek overhang (2 items), and the 3 priming writes.
    let (graph, [pre, avg, _post]) = peeking_pipeline();
    let plan = streamfuse::compile::compile(graph, &Configuration::builder().build()).unwrap();
    let edge = plan
        .graph()
        .storages()
        .iter()
        .find(|s| s.token() == Some(Token::Between(pre, avg)))
        .map(|s| s.id())
        .unwrap();
    let req = plan.requirements().get(&edge).unwrap();
    assert_eq!(req.items_per_iteration, 1);
    assert_eq!(req.peek_overhang, 2);
    assert_eq!(req.init_transient, 3);
    assert_eq!(req.capacity(1), 6);
}
