/// Partial escape analysis over complete graphs
///
/// The merge tests run a single closure so they can look at the effects each
/// block recorded before anything is applied; the remaining tests run the
/// phase and check the rewritten graph.

use pea_compiler::graph::{ControlFlowGraph, Graph, GraphBuilder, LocationIdentity, NodeId, Op, ScheduleResult, Stamp};
use pea_compiler::phases::ea::partial_escape::PartialEscapePolicy;
use pea_compiler::phases::ea::{EffectsClosure, EffectsPhase};
use pea_compiler::phases::{GraphPhase, PhaseManager, PhaseResult};
use pea_compiler::EscapeConfig;

fn field() -> LocationIdentity {
    LocationIdentity::new(1)
}

fn run_partial_escape(graph: &mut Graph) -> PhaseResult {
    pea_compiler::logging::init_test();
    let mut phase = EffectsPhase::partial_escape(&EscapeConfig::default());
    phase.run(graph).expect("partial escape failed")
}

fn count(graph: &Graph, pred: impl Fn(&Op) -> bool) -> usize {
    graph.count(pred)
}

fn is_commit(graph: &Graph, node: Option<NodeId>) -> bool {
    node.map_or(false, |n| matches!(graph.op(n), Op::CommitAllocation { .. }))
}

/// obj = new; if (p) { obj.f = left } else { obj.f = right }; return obj.f
struct StoreDiamond {
    graph: Graph,
    merge: NodeId,
    ret: NodeId,
}

fn store_diamond(same_value: bool) -> (StoreDiamond, NodeId, NodeId) {
    let mut b = GraphBuilder::new();
    let condition = b.parameter(0, Stamp::Bool);
    let left_value = b.parameter(1, Stamp::Int);
    let right_value = if same_value {
        left_value
    } else {
        b.parameter(2, Stamp::Int)
    };
    let obj = b.new_instance(1);
    let (t, f) = b.if_(condition);
    b.switch_to(t);
    b.store_field(obj, 0, field(), left_value);
    let left = b.end();
    b.switch_to(f);
    b.store_field(obj, 0, field(), right_value);
    let right = b.end();
    let merge = b.merge(&[left, right]);
    let load = b.load_field(obj, 0, field(), Stamp::Int);
    let ret = b.return_(Some(load));
    (
        StoreDiamond {
            graph: b.finish(),
            merge,
            ret,
        },
        left_value,
        right_value,
    )
}

#[test]
fn test_identical_entries_merge_without_phi() {
    let (StoreDiamond { mut graph, merge, ret }, value, _) = store_diamond(true);
    let cfg = ControlFlowGraph::compute(&graph).unwrap();
    let merge_block = cfg.block_of(merge).unwrap();

    let mut closure = EffectsClosure::new(&mut graph, &cfg, None, PartialEscapePolicy::new());
    closure.process().unwrap();
    assert!(closure.has_changed());
    assert_eq!(closure.block_effects(merge_block).names(), vec!["replace at usages"]);

    closure.apply_effects().unwrap();
    drop(closure);
    assert_eq!(graph.input(ret, 0), Some(value));
    assert_eq!(count(&graph, |op| matches!(op, Op::ValuePhi)), 0);
    assert_eq!(count(&graph, |op| matches!(op, Op::NewInstance { .. } | Op::StoreField { .. })), 0);
}

#[test]
fn test_differing_entries_merge_into_phi() {
    let (StoreDiamond { mut graph, merge, ret }, left, right) = store_diamond(false);
    let cfg = ControlFlowGraph::compute(&graph).unwrap();
    let merge_block = cfg.block_of(merge).unwrap();

    let mut closure = EffectsClosure::new(&mut graph, &cfg, None, PartialEscapePolicy::new());
    closure.process().unwrap();
    assert_eq!(
        closure.block_effects(merge_block).names(),
        vec!["add floating node", "set phi input", "set phi input", "replace at usages"]
    );

    closure.apply_effects().unwrap();
    drop(closure);
    let phi = graph.input(ret, 0).unwrap();
    assert!(matches!(graph.op(phi), Op::ValuePhi));
    assert_eq!(graph.input(phi, 0), Some(merge));
    assert_eq!(graph.phi_value_at(phi, 0), Some(left));
    assert_eq!(graph.phi_value_at(phi, 1), Some(right));
    assert_eq!(graph.phis(merge), vec![phi]);
    assert_eq!(count(&graph, |op| matches!(op, Op::LoadField { .. })), 0);
}

#[test]
fn test_object_escaping_on_one_branch_is_materialized_on_the_other() {
    let mut b = GraphBuilder::new();
    let condition = b.parameter(0, Stamp::Bool);
    let x = b.parameter(1, Stamp::Int);
    let obj = b.new_instance(1);
    b.store_field(obj, 0, field(), x);
    let (t, f) = b.if_(condition);
    b.switch_to(t);
    let left = b.end();
    b.switch_to(f);
    let call = b.invoke(&[obj], Stamp::Void);
    let right = b.end();
    let merge = b.merge(&[left, right]);
    let load = b.load_field(obj, 0, field(), Stamp::Int);
    b.return_(Some(load));
    let mut graph = b.finish();

    let cfg = ControlFlowGraph::compute(&graph).unwrap();
    let left_block = cfg.block_of(left).unwrap();
    let mut closure = EffectsClosure::new(&mut graph, &cfg, None, PartialEscapePolicy::new());
    closure.process().unwrap();
    // The still-virtual predecessor materializes at its own end.
    assert_eq!(
        closure.block_effects(left_block).names(),
        vec!["add floating node", "add fixed node"]
    );
    closure.apply_effects().unwrap();
    drop(closure);

    let phi = graph.input(load, 0).unwrap();
    assert!(matches!(graph.op(phi), Op::ValuePhi));
    assert_eq!(graph.input(phi, 0), Some(merge));
    let v0 = graph.phi_value_at(phi, 0);
    let m = graph.phi_value_at(phi, 1);
    assert!(is_commit(&graph, v0));
    assert!(is_commit(&graph, m));
    assert_ne!(v0, m);
    assert_eq!(graph.next(v0.unwrap()), Some(left));
    assert_eq!(graph.next(m.unwrap()), Some(call));
    assert_eq!(graph.input(call, 0), m);
    assert_eq!(graph.input(v0.unwrap(), 1), Some(x));
    assert_eq!(count(&graph, |op| matches!(op, Op::NewInstance { .. })), 0);
    assert!(ControlFlowGraph::compute(&graph).is_ok());
}

#[test]
fn test_phase_reports_materialization() {
    let mut b = GraphBuilder::new();
    let x = b.parameter(0, Stamp::Int);
    let obj = b.new_instance(1);
    b.store_field(obj, 0, field(), x);
    let call = b.invoke(&[obj], Stamp::Void);
    b.return_(None);
    let mut graph = b.finish();

    let result = run_partial_escape(&mut graph);
    assert!(result.modified);
    assert_eq!(result.rounds, 2);
    assert_eq!(result.stats["virtualized"], 1);
    assert_eq!(result.stats["materialized"], 1);
    assert!(is_commit(&graph, graph.input(call, 0)));
    assert_eq!(count(&graph, |op| matches!(op, Op::StoreField { .. })), 0);
}

#[test]
fn test_nothing_to_do_leaves_graph_untouched() {
    let mut b = GraphBuilder::new();
    let obj = b.parameter(0, Stamp::Object);
    let load = b.load_field(obj, 0, field(), Stamp::Int);
    b.return_(Some(load));
    let mut graph = b.finish();
    let before = graph.alive_nodes().count();

    let result = run_partial_escape(&mut graph);
    assert!(!result.modified);
    assert_eq!(result.rounds, 1);
    assert_eq!(result.nodes_removed, 0);
    assert_eq!(graph.alive_nodes().count(), before);
}

#[test]
fn test_loop_carried_field_becomes_phi() {
    let mut b = GraphBuilder::new();
    let zero = b.constant(0);
    let one = b.constant(1);
    let limit = b.parameter(0, Stamp::Int);
    let counter = b.new_instance(1);
    b.store_field(counter, 0, field(), zero);
    let lb = b.loop_begin();
    let value = b.load_field(counter, 0, field(), Stamp::Int);
    let done = b.int_equals(value, limit);
    let (body, exit) = b.if_exit(done, lb, true);
    b.switch_to(body);
    let next = b.add(value, one);
    b.store_field(counter, 0, field(), next);
    b.loop_end(lb);
    b.switch_to(exit);
    let result = b.proxy(value, exit);
    let ret = b.return_(Some(result));
    let mut graph = b.finish();

    let phase_result = run_partial_escape(&mut graph);
    assert!(phase_result.modified);
    assert_eq!(phase_result.stats["materialized"], 0);
    assert_eq!(
        count(&graph, |op| matches!(
            op,
            Op::NewInstance { .. } | Op::LoadField { .. } | Op::StoreField { .. }
        )),
        0
    );

    assert_eq!(graph.input(ret, 0), Some(result));
    let phi = graph.input(result, 0).unwrap();
    assert!(matches!(graph.op(phi), Op::ValuePhi));
    assert_eq!(graph.input(phi, 0), Some(lb));
    assert_eq!(graph.phi_value_at(phi, 0), Some(zero));
    assert_eq!(graph.phi_value_at(phi, 1), Some(next));
    assert_eq!(graph.input(next, 0), Some(phi));
    assert_eq!(graph.input(done, 0), Some(phi));
    assert!(ControlFlowGraph::compute(&graph).is_ok());
}

#[test]
fn test_nested_loops_scalar_replace_both_fields() {
    let mut b = GraphBuilder::new();
    let zero = b.constant(0);
    let one = b.constant(1);
    let limit = b.parameter(0, Stamp::Int);
    let second = LocationIdentity::new(2);
    let counter = b.new_instance(2);
    b.store_field(counter, 0, field(), zero);
    b.store_field(counter, 1, second, zero);

    let outer = b.loop_begin();
    let i = b.load_field(counter, 0, field(), Stamp::Int);
    let outer_done = b.int_equals(i, limit);
    let (outer_body, outer_exit) = b.if_exit(outer_done, outer, true);
    b.switch_to(outer_body);
    let inner = b.loop_begin();
    let j = b.load_field(counter, 1, second, Stamp::Int);
    let inner_done = b.int_equals(j, limit);
    let (inner_body, inner_exit) = b.if_exit(inner_done, inner, true);
    b.switch_to(inner_body);
    let next_j = b.add(j, one);
    b.store_field(counter, 1, second, next_j);
    b.loop_end(inner);
    b.switch_to(inner_exit);
    let next_i = b.add(i, one);
    b.store_field(counter, 0, field(), next_i);
    b.loop_end(outer);
    b.switch_to(outer_exit);
    let result = b.proxy(i, outer_exit);
    b.return_(Some(result));
    let mut graph = b.finish();

    let phase_result = run_partial_escape(&mut graph);
    assert_eq!(phase_result.stats["virtualized"], 1);
    assert_eq!(phase_result.stats["materialized"], 0);
    assert_eq!(
        count(&graph, |op| matches!(
            op,
            Op::NewInstance { .. } | Op::LoadField { .. } | Op::StoreField { .. }
        )),
        0
    );

    let i_phi = graph.input(result, 0).unwrap();
    assert!(matches!(graph.op(i_phi), Op::ValuePhi));
    assert_eq!(graph.input(i_phi, 0), Some(outer));
    assert_eq!(graph.phi_value_at(i_phi, 1), Some(next_i));
    let j_phi = graph.input(next_j, 0).unwrap();
    assert!(matches!(graph.op(j_phi), Op::ValuePhi));
    assert_eq!(graph.input(j_phi, 0), Some(inner));
    assert_eq!(graph.input(inner_done, 0), Some(j_phi));
    assert!(ControlFlowGraph::compute(&graph).is_ok());
}

#[test]
fn test_loop_escape_materializes_inside_loop() {
    let mut b = GraphBuilder::new();
    let condition = b.parameter(0, Stamp::Bool);
    let lb = b.loop_begin();
    let (body, exit) = b.if_exit(condition, lb, true);
    b.switch_to(body);
    let obj = b.new_instance(0);
    let call = b.invoke(&[obj], Stamp::Void);
    b.loop_end(lb);
    b.switch_to(exit);
    b.return_(None);
    let mut graph = b.finish();

    let cfg = ControlFlowGraph::compute(&graph).unwrap();
    let body_block = cfg.block_of(body).unwrap();
    let schedule = ScheduleResult::compute(&graph, &cfg);
    let mut closure = EffectsClosure::new(&mut graph, &cfg, Some(&schedule), PartialEscapePolicy::new());
    closure.process().unwrap();
    assert!(closure.block_effects(body_block).names().contains(&"add fixed node"));
    closure.apply_effects().unwrap();
    drop(closure);

    let commit = graph.input(call, 0);
    assert!(is_commit(&graph, commit));
    assert_eq!(graph.next(commit.unwrap()), Some(call));
    assert_eq!(graph.predecessor(commit.unwrap()), Some(body));
}

#[test]
fn test_object_escaping_in_loop_is_materialized_before_it() {
    let mut b = GraphBuilder::new();
    let x = b.parameter(0, Stamp::Int);
    let condition = b.parameter(1, Stamp::Bool);
    let obj = b.new_instance(1);
    b.store_field(obj, 0, field(), x);
    let lb = b.loop_begin();
    let (body, exit) = b.if_exit(condition, lb, true);
    b.switch_to(body);
    let call = b.invoke(&[obj], Stamp::Void);
    b.loop_end(lb);
    b.switch_to(exit);
    b.return_(None);
    let mut graph = b.finish();

    // The first loop pass materializes at the call; the kept pass does it once
    // on the loop entry.
    let result = run_partial_escape(&mut graph);
    assert!(result.modified);
    assert_eq!(result.rounds, 2);
    assert_eq!(result.stats["virtualized"], 1);
    assert_eq!(result.stats["materialized"], 1);
    assert_eq!(result.stats["ensure_virtualized_violations"], 0);
    assert_eq!(count(&graph, |op| matches!(op, Op::CommitAllocation { .. })), 1);

    let phi = graph.input(call, 0).unwrap();
    assert!(matches!(graph.op(phi), Op::ValuePhi));
    assert_eq!(graph.input(phi, 0), Some(lb));
    let commit = graph.phi_value_at(phi, 0);
    assert!(is_commit(&graph, commit));
    assert_eq!(graph.input(commit.unwrap(), 1), Some(x));
    assert!(ControlFlowGraph::compute(&graph).is_ok());
}

#[test]
fn test_virtual_phi_input_keeps_object_virtual() {
    let mut b = GraphBuilder::new();
    let condition = b.parameter(0, Stamp::Bool);
    let x = b.parameter(1, Stamp::Int);
    let obj = b.new_instance(1);
    b.store_field(obj, 0, field(), x);
    let (t, f) = b.if_(condition);
    b.switch_to(t);
    let left = b.end();
    b.switch_to(f);
    let right = b.end();
    let merge = b.merge(&[left, right]);
    let phi = b.phi(merge, &[obj, obj], Stamp::Object);
    let load = b.load_field(phi, 0, field(), Stamp::Int);
    let ret = b.return_(Some(load));
    let mut graph = b.finish();

    let result = run_partial_escape(&mut graph);
    assert_eq!(result.stats["materialized"], 0);
    assert_eq!(graph.input(ret, 0), Some(x));
    assert!(!graph.is_alive(phi));
    assert_eq!(count(&graph, |op| matches!(op, Op::CommitAllocation { .. })), 0);
}

#[test]
fn test_lock_released_before_escape_is_not_reacquired() {
    let mut b = GraphBuilder::new();
    let obj = b.new_instance(0);
    let monitor = b.monitor_enter(obj);
    b.monitor_exit(obj, monitor);
    let call = b.invoke(&[obj], Stamp::Void);
    b.return_(None);
    let mut graph = b.finish();

    run_partial_escape(&mut graph);
    let commit = graph.input(call, 0).unwrap();
    assert!(matches!(graph.op(commit), Op::CommitAllocation { .. }));
    assert_eq!(graph.next(commit), Some(call));
    assert_eq!(count(&graph, |op| matches!(op, Op::MonitorEnter | Op::MonitorExit)), 0);
}

#[test]
fn test_differing_locks_force_materialization() {
    let mut b = GraphBuilder::new();
    let condition = b.parameter(0, Stamp::Bool);
    let obj = b.new_instance(0);
    let (t, f) = b.if_(condition);
    b.switch_to(t);
    b.monitor_enter(obj);
    let left = b.end();
    b.switch_to(f);
    let right = b.end();
    b.merge(&[left, right]);
    b.return_(None);
    let mut graph = b.finish();

    let result = run_partial_escape(&mut graph);
    assert_eq!(result.stats["materialized"], 1);
    assert_eq!(count(&graph, |op| matches!(op, Op::CommitAllocation { .. })), 2);
    // The locked side re-acquires the lock on the real object.
    assert_eq!(count(&graph, |op| matches!(op, Op::MonitorEnter)), 1);
}

#[test]
fn test_escape_in_dead_branch_is_removed() {
    let mut b = GraphBuilder::new();
    let never = b.logic_constant(false);
    let x = b.parameter(0, Stamp::Int);
    let obj = b.new_instance(1);
    b.store_field(obj, 0, field(), x);
    let (t, f) = b.if_(never);
    b.switch_to(t);
    let call = b.invoke(&[obj], Stamp::Void);
    let left = b.end();
    b.switch_to(f);
    let right = b.end();
    b.merge(&[left, right]);
    let load = b.load_field(obj, 0, field(), Stamp::Int);
    let ret = b.return_(Some(load));
    let mut graph = b.finish();

    let result = run_partial_escape(&mut graph);
    assert_eq!(result.stats["materialized"], 0);
    assert!(!graph.is_alive(call));
    assert_eq!(graph.input(ret, 0), Some(x));
    assert_eq!(count(&graph, |op| matches!(op, Op::If { .. } | Op::Merge)), 0);
    assert!(ControlFlowGraph::compute(&graph).is_ok());
}

#[test]
fn test_pipeline_runs_both_phases() {
    let mut b = GraphBuilder::new();
    let obj = b.parameter(0, Stamp::Object);
    let first = b.load_field(obj, 0, field(), Stamp::Int);
    let second = b.load_field(obj, 0, field(), Stamp::Int);
    let sum = b.add(first, second);
    b.return_(Some(sum));
    let mut graph = b.finish();

    let mut manager = PhaseManager::from_config(&EscapeConfig::default());
    let result = manager.run(&mut graph).unwrap();
    assert!(result.modified);
    assert_eq!(result.stats["eliminated_loads"], 1);
    assert_eq!(graph.inputs(sum), &[Some(first), Some(first)]);
}
