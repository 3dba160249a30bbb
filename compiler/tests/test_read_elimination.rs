/// Read elimination across merges and loops, including the loop kill caches
/// it fills while an outer loop revisits an inner one.

use pea_compiler::graph::{ControlFlowGraph, Graph, GraphBuilder, LocationIdentity, Op, Stamp};
use pea_compiler::phases::ea::read_elimination::ReadEliminationPolicy;
use pea_compiler::phases::ea::{EffectsClosure, EffectsPhase};
use pea_compiler::phases::{GraphPhase, PhaseResult};
use pea_compiler::EscapeConfig;

fn loc(id: u32) -> LocationIdentity {
    LocationIdentity::new(id)
}

fn run_read_elimination(graph: &mut Graph) -> PhaseResult {
    pea_compiler::logging::init_test();
    let mut phase = EffectsPhase::read_elimination(&EscapeConfig::default());
    phase.run(graph).expect("read elimination failed")
}

#[test]
fn test_call_in_loop_keeps_load() {
    let mut b = GraphBuilder::new();
    let obj = b.parameter(0, Stamp::Object);
    let x = b.parameter(1, Stamp::Int);
    let condition = b.parameter(2, Stamp::Bool);
    b.store_field(obj, 0, loc(1), x);
    let lb = b.loop_begin();
    let (body, exit) = b.if_exit(condition, lb, true);
    b.switch_to(body);
    let load = b.load_field(obj, 0, loc(1), Stamp::Int);
    let call = b.invoke(&[load], Stamp::Void);
    b.store_field(obj, 1, loc(2), x);
    b.loop_end(lb);
    b.switch_to(exit);
    b.return_(None);
    let mut graph = b.finish();

    // The call kills everything, so only the first iteration could use the
    // cached value; the load has to stay.
    let result = run_read_elimination(&mut graph);
    assert_eq!(result.stats["eliminated_loads"], 0);
    assert!(graph.is_alive(load));
    assert_eq!(graph.input(call, 0), Some(load));
}

#[test]
fn test_retried_loop_leaves_phase_result_clean() {
    let mut b = GraphBuilder::new();
    let obj = b.parameter(0, Stamp::Object);
    let x = b.parameter(1, Stamp::Int);
    let condition = b.parameter(2, Stamp::Bool);
    b.store_field(obj, 0, loc(1), x);
    let lb = b.loop_begin();
    let (body, exit) = b.if_exit(condition, lb, true);
    b.switch_to(body);
    let load = b.load_field(obj, 0, loc(1), Stamp::Int);
    b.invoke(&[load], Stamp::Void);
    b.loop_end(lb);
    b.switch_to(exit);
    b.return_(None);
    let mut graph = b.finish();
    let before = graph.alive_nodes().count();

    // The first loop pass folds the load, the second one has to undo that.
    let result = run_read_elimination(&mut graph);
    assert!(!result.modified);
    assert_eq!(result.rounds, 1);
    assert_eq!(result.nodes_removed, 0);
    assert_eq!(result.stats["eliminated_loads"], 0);
    assert_eq!(result.stats["eliminated_stores"], 0);
    assert_eq!(graph.alive_nodes().count(), before);
}

#[test]
fn test_load_in_loop_without_kills_is_eliminated() {
    let mut b = GraphBuilder::new();
    let obj = b.parameter(0, Stamp::Object);
    let x = b.parameter(1, Stamp::Int);
    let condition = b.parameter(2, Stamp::Bool);
    b.store_field(obj, 0, loc(1), x);
    let lb = b.loop_begin();
    let (body, exit) = b.if_exit(condition, lb, true);
    b.switch_to(body);
    let load = b.load_field(obj, 0, loc(1), Stamp::Int);
    b.store_field(obj, 1, loc(2), load);
    b.loop_end(lb);
    b.switch_to(exit);
    b.return_(None);
    let mut graph = b.finish();

    let result = run_read_elimination(&mut graph);
    assert_eq!(result.stats["eliminated_loads"], 1);
    assert!(!graph.is_alive(load));
    assert_eq!(graph.count(|op| matches!(op, Op::LoadField { .. })), 0);
}

#[test]
fn test_field_stored_in_loop_is_read_through_phi() {
    let mut b = GraphBuilder::new();
    let obj = b.parameter(0, Stamp::Object);
    let zero = b.constant(0);
    let one = b.constant(1);
    let condition = b.parameter(1, Stamp::Bool);
    b.store_field(obj, 0, loc(1), zero);
    let lb = b.loop_begin();
    let current = b.load_field(obj, 0, loc(1), Stamp::Int);
    let (body, exit) = b.if_exit(condition, lb, true);
    b.switch_to(body);
    let next = b.add(current, one);
    b.store_field(obj, 0, loc(1), next);
    b.loop_end(lb);
    b.switch_to(exit);
    let after = b.load_field(obj, 0, loc(1), Stamp::Int);
    let ret = b.return_(Some(after));
    let mut graph = b.finish();

    let result = run_read_elimination(&mut graph);
    assert_eq!(result.stats["eliminated_loads"], 2);
    let phi = graph.input(next, 0).unwrap();
    assert!(matches!(graph.op(phi), Op::ValuePhi));
    assert_eq!(graph.input(phi, 0), Some(lb));
    assert_eq!(graph.phi_value_at(phi, 0), Some(zero));
    assert_eq!(graph.phi_value_at(phi, 1), Some(next));

    // After the loop the load reads the header value through a proxy.
    let proxy = graph.input(ret, 0).unwrap();
    assert!(matches!(graph.op(proxy), Op::ValueProxy));
    assert_eq!(graph.input(proxy, 0), Some(phi));
    assert_eq!(graph.input(proxy, 1), Some(exit));
    assert!(ControlFlowGraph::compute(&graph).is_ok());
}

#[test]
fn test_store_in_inner_loop_is_remembered_by_its_kill_cache() {
    let mut b = GraphBuilder::new();
    let obj = b.parameter(0, Stamp::Object);
    let other = b.parameter(1, Stamp::Object);
    let x = b.parameter(2, Stamp::Int);
    let y = b.parameter(3, Stamp::Int);
    let condition = b.parameter(4, Stamp::Bool);
    b.store_field(obj, 0, loc(1), x);
    b.store_field(obj, 1, loc(2), y);

    let outer = b.loop_begin();
    let (outer_body, outer_exit) = b.if_exit(condition, outer, true);
    b.switch_to(outer_body);
    b.store_field(obj, 0, loc(1), x);
    let inner = b.loop_begin();
    let (inner_body, inner_exit) = b.if_exit(condition, inner, true);
    b.switch_to(inner_body);
    b.store_field(other, 0, loc(1), y);
    b.loop_end(inner);
    b.switch_to(inner_exit);
    b.loop_end(outer);
    b.switch_to(outer_exit);
    b.return_(None);
    let mut graph = b.finish();

    let cfg = ControlFlowGraph::compute(&graph).unwrap();
    let inner_loop = cfg.loop_of_header(cfg.block_of(inner).unwrap()).unwrap();
    let outer_loop = cfg.loop_of_header(cfg.block_of(outer).unwrap()).unwrap();
    let mut closure = EffectsClosure::new(&mut graph, &cfg, None, ReadEliminationPolicy::new(5));
    closure.process().unwrap();

    let cache = closure.loop_kill_cache(inner_loop).expect("inner loop was revisited");
    assert!(cache.contains_location(loc(1)));
    assert!(!cache.contains_location(loc(2)));
    assert!(!cache.kills_all());
    assert!(cache.visits() >= 2);
    // The outer loop is only walked to convergence once.
    assert!(closure.loop_kill_cache(outer_loop).is_some());
    assert!(!closure.loop_kill_cache(outer_loop).unwrap().loop_kills_locations());
}

#[test]
fn test_stores_on_both_branches_merge_into_phi() {
    let mut b = GraphBuilder::new();
    let obj = b.parameter(0, Stamp::Object);
    let condition = b.parameter(1, Stamp::Bool);
    let one = b.constant(1);
    let two = b.constant(2);
    let (t, f) = b.if_(condition);
    b.switch_to(t);
    b.store_field(obj, 0, loc(1), one);
    let left = b.end();
    b.switch_to(f);
    b.store_field(obj, 0, loc(1), two);
    let right = b.end();
    let merge = b.merge(&[left, right]);
    let load = b.load_field(obj, 0, loc(1), Stamp::Int);
    let ret = b.return_(Some(load));
    let mut graph = b.finish();

    run_read_elimination(&mut graph);
    let phi = graph.input(ret, 0).unwrap();
    assert!(matches!(graph.op(phi), Op::ValuePhi));
    assert_eq!(graph.input(phi, 0), Some(merge));
    assert_eq!(graph.phi_value_at(phi, 0), Some(one));
    assert_eq!(graph.phi_value_at(phi, 1), Some(two));
    assert!(!graph.is_alive(load));
}

#[test]
fn test_store_to_unrelated_location_keeps_cache() {
    let mut b = GraphBuilder::new();
    let obj = b.parameter(0, Stamp::Object);
    let x = b.parameter(1, Stamp::Int);
    let first = b.load_field(obj, 0, loc(1), Stamp::Int);
    b.store_field(obj, 1, loc(2), x);
    let second = b.load_field(obj, 0, loc(1), Stamp::Int);
    b.store_field(obj, 1, LocationIdentity::ANY, x);
    let third = b.load_field(obj, 0, loc(1), Stamp::Int);
    let sum = b.add(second, third);
    b.return_(Some(sum));
    let mut graph = b.finish();

    let result = run_read_elimination(&mut graph);
    assert_eq!(result.stats["eliminated_loads"], 1);
    assert!(graph.is_alive(first));
    assert!(!graph.is_alive(second));
    assert!(graph.is_alive(third));
    assert_eq!(graph.inputs(sum), &[Some(first), Some(third)]);
}
