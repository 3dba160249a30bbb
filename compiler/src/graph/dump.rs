//! Graph Dump Utility
//!
//! Pretty-prints a node graph block by block. Useful for debugging the effects
//! phases and for the CLI's `--dump` flag.

use super::cfg::{Block, ControlFlowGraph};
use super::schedule::ScheduleResult;
use super::{Graph, NodeId, Op};
use std::fmt::Write;

/// Dump the whole graph, one block at a time in block order.
pub fn dump_graph(graph: &Graph) -> String {
    let mut out = String::new();
    let cfg = match ControlFlowGraph::compute(graph) {
        Ok(cfg) => cfg,
        Err(e) => {
            writeln!(out, "; malformed graph: {}", e).unwrap();
            return out;
        }
    };
    let schedule = ScheduleResult::compute(graph, &cfg);
    writeln!(out, "; nodes: {}", graph.alive_nodes().count()).unwrap();
    writeln!(out, "; blocks: {}, loops: {}", cfg.blocks().len(), cfg.loops().len()).unwrap();
    for block in cfg.blocks() {
        write!(out, "{}", dump_block(graph, &cfg, block, Some(&schedule))).unwrap();
    }
    out
}

/// Dump a single block. Without a schedule only the fixed nodes are shown.
pub fn dump_block(graph: &Graph, cfg: &ControlFlowGraph, block: &Block, schedule: Option<&ScheduleResult>) -> String {
    let mut out = String::new();
    let preds: Vec<String> = block.predecessors.iter().map(|p| p.to_string()).collect();
    write!(out, "{}:", block.id).unwrap();
    if !preds.is_empty() {
        write!(out, "  ; preds = {}", preds.join(", ")).unwrap();
    }
    if let Some(l) = block.loop_id {
        write!(out, "  ; loop {} depth {}", l, cfg.loop_info(l).depth).unwrap();
    }
    writeln!(out).unwrap();

    for phi in graph.phis(block.begin) {
        writeln!(out, "    {}", dump_node(graph, phi)).unwrap();
    }
    if matches!(graph.op(block.begin), Op::LoopExit) {
        for proxy in graph.proxies(block.begin) {
            writeln!(out, "    {}", dump_node(graph, proxy)).unwrap();
        }
    }
    let nodes = match schedule {
        Some(schedule) => schedule.nodes_for(block.id),
        None => block.nodes.as_slice(),
    };
    for &node in nodes {
        writeln!(out, "    {}", dump_node(graph, node)).unwrap();
    }
    out
}

/// One-line rendering of a node: `n7 = LoadField[f0, loc1](n3) : int`
pub fn dump_node(graph: &Graph, node: NodeId) -> String {
    let mut out = String::new();
    write!(out, "{} = {}", node, graph.op(node).name()).unwrap();
    match graph.op(node) {
        Op::If {
            true_successor,
            false_successor,
        } => write!(out, "[T: {}, F: {}]", true_successor, false_successor).unwrap(),
        Op::Parameter(index) => write!(out, "[{}]", index).unwrap(),
        Op::Constant(value) => write!(out, "[{}]", value).unwrap(),
        Op::LogicConstant(value) => write!(out, "[{}]", value).unwrap(),
        Op::NewInstance { field_count } => write!(out, "[fields: {}]", field_count).unwrap(),
        Op::VirtualObject { object_id, field_count } => {
            write!(out, "[vobj{}, fields: {}]", object_id, field_count).unwrap()
        }
        Op::CommitAllocation { object_id } => write!(out, "[vobj{}]", object_id).unwrap(),
        Op::LoadField { field, location } | Op::StoreField { field, location } => {
            write!(out, "[f{}, {}]", field, location).unwrap()
        }
        Op::MonitorId { lock_depth } => write!(out, "[depth {}]", lock_depth).unwrap(),
        _ => {}
    }
    let inputs: Vec<String> = graph
        .inputs(node)
        .iter()
        .map(|i| match i {
            Some(i) => i.to_string(),
            None => "null".to_string(),
        })
        .collect();
    write!(out, "({})", inputs.join(", ")).unwrap();
    if let Some(next) = graph.next(node) {
        write!(out, " -> {}", next).unwrap();
    }
    write!(out, " : {}", graph.stamp(node)).unwrap();
    out
}
