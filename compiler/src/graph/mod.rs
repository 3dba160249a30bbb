//! Node Graph
//!
//! This module defines the arena-backed node graph the escape analysis runs on.
//! Nodes are addressed by [`NodeId`] handles; identity maps over nodes are plain
//! hash maps keyed by those handles.
//!
//! The graph is split into two layers:
//! - **Fixed nodes** form the control chain. A fixed-with-next node points at its
//!   successor through `next`, an `If` names its two successor begins, and an `End`
//!   or `LoopEnd` flows into the merge that lists it as an input.
//! - **Floating nodes** (constants, phis, arithmetic, ...) are only reachable
//!   through inputs and have no position of their own.
//!
//! Input layout conventions (phi input `i` always matches merge end `i`):
//!
//! | op           | inputs                                  |
//! |--------------|-----------------------------------------|
//! | `Merge`      | `[end0, end1, ...]`                     |
//! | `LoopBegin`  | `[forward_end, loop_end0, ...]`         |
//! | `LoopEnd`    | `[loop_begin]`                          |
//! | `LoopExit`   | `[loop_begin]`                          |
//! | `ValuePhi`   | `[merge, value0, value1, ...]`          |
//! | `ValueProxy` | `[value, loop_exit]`                    |
//! | `If`         | `[condition]`                           |
//! | `LoadField`  | `[object]`                              |
//! | `StoreField` | `[object, value]`                       |
//! | `MonitorEnter` / `MonitorExit` | `[object, monitor_id]` |
//! | `CommitAllocation` | `[entry0, entry1, ...]`           |

pub mod builder;
pub mod cfg;
pub mod dump;
pub mod schedule;

pub use builder::GraphBuilder;
pub use cfg::{Block, BlockId, ControlFlowGraph, DominatorTree, Loop, LoopId};
pub use schedule::ScheduleResult;

use fxhash::FxHashSet;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use std::fmt;

/// Handle of a node in a [`Graph`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(u32);

impl NodeId {
    pub fn new(id: u32) -> Self {
        Self(id)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Opaque token naming a class of memory locations.
///
/// Two accesses with different identities never alias. [`LocationIdentity::ANY`]
/// aliases everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocationIdentity(u32);

impl LocationIdentity {
    pub const ANY: LocationIdentity = LocationIdentity(u32::MAX);

    pub fn new(id: u32) -> Self {
        debug_assert!(id != u32::MAX, "reserved for LocationIdentity::ANY");
        Self(id)
    }

    pub fn is_any(self) -> bool {
        self == Self::ANY
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    /// Whether a write to `self` may overwrite a location of identity `other`
    pub fn overlaps(self, other: LocationIdentity) -> bool {
        self.is_any() || other.is_any() || self == other
    }
}

impl fmt::Display for LocationIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_any() {
            write!(f, "ANY")
        } else {
            write!(f, "loc{}", self.0)
        }
    }
}

/// Value kind of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stamp {
    Void,
    Int,
    Bool,
    Object,
}

impl fmt::Display for Stamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stamp::Void => "void",
            Stamp::Int => "int",
            Stamp::Bool => "bool",
            Stamp::Object => "object",
        };
        f.write_str(name)
    }
}

/// Kind of memory effect a node has
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryKill {
    /// Overwrites locations of one identity
    Single(LocationIdentity),
    /// May overwrite any location
    Any,
}

/// Node operation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    // Control
    Start,
    Begin,
    Merge,
    LoopBegin,
    LoopExit,
    End,
    LoopEnd,
    Return,
    If {
        true_successor: NodeId,
        false_successor: NodeId,
    },

    // Values
    Parameter(u32),
    Constant(i64),
    LogicConstant(bool),
    ValuePhi,
    ValueProxy,
    Add,
    IntegerEquals,

    // Objects and memory
    NewInstance {
        field_count: usize,
    },
    VirtualObject {
        object_id: usize,
        field_count: usize,
    },
    CommitAllocation {
        object_id: usize,
    },
    LoadField {
        field: usize,
        location: LocationIdentity,
    },
    StoreField {
        field: usize,
        location: LocationIdentity,
    },
    MonitorId {
        lock_depth: u32,
    },
    MonitorEnter,
    MonitorExit,
    EnsureVirtualized,
    Invoke,
}

impl Op {
    /// Fixed node with a single `next` successor
    pub fn is_fixed_with_next(&self) -> bool {
        matches!(
            self,
            Op::Start
                | Op::Begin
                | Op::Merge
                | Op::LoopBegin
                | Op::LoopExit
                | Op::NewInstance { .. }
                | Op::CommitAllocation { .. }
                | Op::LoadField { .. }
                | Op::StoreField { .. }
                | Op::MonitorEnter
                | Op::MonitorExit
                | Op::EnsureVirtualized
                | Op::Invoke
        )
    }

    pub fn is_fixed(&self) -> bool {
        self.is_fixed_with_next()
            || matches!(self, Op::End | Op::LoopEnd | Op::Return | Op::If { .. })
    }

    pub fn is_floating(&self) -> bool {
        !self.is_fixed()
    }

    /// Nodes that can start a block
    pub fn is_begin(&self) -> bool {
        matches!(
            self,
            Op::Start | Op::Begin | Op::Merge | Op::LoopBegin | Op::LoopExit
        )
    }

    pub fn is_merge(&self) -> bool {
        matches!(self, Op::Merge | Op::LoopBegin)
    }

    pub fn is_phi(&self) -> bool {
        matches!(self, Op::ValuePhi)
    }

    pub fn is_virtual_object(&self) -> bool {
        matches!(self, Op::VirtualObject { .. })
    }

    pub fn memory_kill(&self) -> Option<MemoryKill> {
        match self {
            Op::StoreField { location, .. } => Some(MemoryKill::Single(*location)),
            Op::Invoke | Op::MonitorEnter | Op::MonitorExit => Some(MemoryKill::Any),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Op::Start => "Start",
            Op::Begin => "Begin",
            Op::Merge => "Merge",
            Op::LoopBegin => "LoopBegin",
            Op::LoopExit => "LoopExit",
            Op::End => "End",
            Op::LoopEnd => "LoopEnd",
            Op::Return => "Return",
            Op::If { .. } => "If",
            Op::Parameter(_) => "Parameter",
            Op::Constant(_) => "Constant",
            Op::LogicConstant(_) => "LogicConstant",
            Op::ValuePhi => "ValuePhi",
            Op::ValueProxy => "ValueProxy",
            Op::Add => "Add",
            Op::IntegerEquals => "IntegerEquals",
            Op::NewInstance { .. } => "NewInstance",
            Op::VirtualObject { .. } => "VirtualObject",
            Op::CommitAllocation { .. } => "CommitAllocation",
            Op::LoadField { .. } => "LoadField",
            Op::StoreField { .. } => "StoreField",
            Op::MonitorId { .. } => "MonitorId",
            Op::MonitorEnter => "MonitorEnter",
            Op::MonitorExit => "MonitorExit",
            Op::EnsureVirtualized => "EnsureVirtualized",
            Op::Invoke => "Invoke",
        }
    }
}

/// Lifecycle of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// Allocated during analysis but not yet part of the graph; its inputs are
    /// not registered as usages until it is attached.
    Detached,
    Alive,
    Deleted,
}

pub type Inputs = SmallVec<[Option<NodeId>; 4]>;

/// A node in the graph
#[derive(Debug, Clone)]
pub struct Node {
    pub op: Op,
    pub stamp: Stamp,
    inputs: Inputs,
    next: Option<NodeId>,
    predecessor: Option<NodeId>,
    usages: Vec<NodeId>,
    state: NodeState,
}

impl Node {
    pub fn inputs(&self) -> &[Option<NodeId>] {
        &self.inputs
    }

    pub fn usages(&self) -> &[NodeId] {
        &self.usages
    }

    pub fn state(&self) -> NodeState {
        self.state
    }
}

/// The node arena
#[derive(Debug, Clone)]
pub struct Graph {
    nodes: Vec<Node>,
    start: NodeId,
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

impl Graph {
    /// Create a graph holding only its start node
    pub fn new() -> Self {
        let mut graph = Self {
            nodes: Vec::new(),
            start: NodeId(0),
        };
        graph.start = graph.add(Op::Start, &[], Stamp::Void);
        graph
    }

    pub fn start(&self) -> NodeId {
        self.start
    }

    /// Total number of node slots, including deleted and detached nodes
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    pub fn op(&self, id: NodeId) -> &Op {
        &self.nodes[id.index()].op
    }

    pub fn stamp(&self, id: NodeId) -> Stamp {
        self.nodes[id.index()].stamp
    }

    pub fn inputs(&self, id: NodeId) -> &[Option<NodeId>] {
        &self.nodes[id.index()].inputs
    }

    pub fn input(&self, id: NodeId, index: usize) -> Option<NodeId> {
        self.nodes[id.index()].inputs.get(index).copied().flatten()
    }

    pub fn usages(&self, id: NodeId) -> &[NodeId] {
        &self.nodes[id.index()].usages
    }

    pub fn next(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].next
    }

    pub fn predecessor(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.index()].predecessor
    }

    pub fn is_alive(&self, id: NodeId) -> bool {
        self.nodes[id.index()].state == NodeState::Alive
    }

    pub fn is_detached(&self, id: NodeId) -> bool {
        self.nodes[id.index()].state == NodeState::Detached
    }

    pub fn is_deleted(&self, id: NodeId) -> bool {
        self.nodes[id.index()].state == NodeState::Deleted
    }

    /// Ids of all alive nodes, in creation order
    pub fn alive_nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| n.state == NodeState::Alive)
            .map(|(i, _)| NodeId(i as u32))
    }

    /// Number of alive nodes matching `pred`
    pub fn count(&self, pred: impl Fn(&Op) -> bool) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.state == NodeState::Alive && pred(&n.op))
            .count()
    }

    // ------------------------------------------------------------------
    // Node creation
    // ------------------------------------------------------------------

    /// Add a node and register it as a usage of its inputs
    pub fn add(&mut self, op: Op, inputs: &[Option<NodeId>], stamp: Stamp) -> NodeId {
        let id = self.push(op, inputs, stamp, NodeState::Alive);
        for input in inputs.iter().flatten() {
            self.nodes[input.index()].usages.push(id);
        }
        id
    }

    /// Allocate a node that is not yet part of the graph.
    ///
    /// Detached nodes are invisible to usage queries until [`Graph::attach`] runs,
    /// which is how analysis creates nodes without mutating the graph it walks.
    pub fn add_detached(&mut self, op: Op, inputs: &[Option<NodeId>], stamp: Stamp) -> NodeId {
        self.push(op, inputs, stamp, NodeState::Detached)
    }

    fn push(&mut self, op: Op, inputs: &[Option<NodeId>], stamp: Stamp, state: NodeState) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(Node {
            op,
            stamp,
            inputs: inputs.iter().copied().collect(),
            next: None,
            predecessor: None,
            usages: Vec::new(),
            state,
        });
        id
    }

    /// Make a detached node part of the graph
    pub fn attach(&mut self, id: NodeId) {
        if self.nodes[id.index()].state != NodeState::Detached {
            debug_assert!(false, "{} is not detached", id);
            return;
        }
        self.nodes[id.index()].state = NodeState::Alive;
        let inputs: SmallVec<[NodeId; 4]> = self.nodes[id.index()].inputs.iter().flatten().copied().collect();
        for input in inputs {
            self.nodes[input.index()].usages.push(id);
        }
    }

    pub(crate) fn set_op(&mut self, id: NodeId, op: Op) {
        self.nodes[id.index()].op = op;
    }

    // ------------------------------------------------------------------
    // Inputs and usages
    // ------------------------------------------------------------------

    fn tracks_usages(&self, id: NodeId) -> bool {
        self.nodes[id.index()].state == NodeState::Alive
    }

    fn remove_usage(&mut self, of: NodeId, usage: NodeId) {
        let usages = &mut self.nodes[of.index()].usages;
        if let Some(pos) = usages.iter().position(|&u| u == usage) {
            usages.swap_remove(pos);
        }
    }

    /// Overwrite input `index` of `id`, keeping usage lists consistent
    pub fn set_input(&mut self, id: NodeId, index: usize, value: Option<NodeId>) {
        let tracked = self.tracks_usages(id);
        let old = self.nodes[id.index()].inputs[index];
        if old == value {
            return;
        }
        if tracked {
            if let Some(old) = old {
                self.remove_usage(old, id);
            }
            if let Some(new) = value {
                self.nodes[new.index()].usages.push(id);
            }
        }
        self.nodes[id.index()].inputs[index] = value;
    }

    /// Append an input to `id`
    pub fn push_input(&mut self, id: NodeId, value: Option<NodeId>) {
        self.nodes[id.index()].inputs.push(None);
        let index = self.nodes[id.index()].inputs.len() - 1;
        self.set_input(id, index, value);
    }

    /// Remove input `index` of `id`, shifting later inputs down
    pub fn remove_input(&mut self, id: NodeId, index: usize) {
        self.set_input(id, index, None);
        self.nodes[id.index()].inputs.remove(index);
    }

    /// Replace the first occurrence of `old` among the inputs of `id`
    pub fn replace_first_input(&mut self, id: NodeId, old: NodeId, new: Option<NodeId>) -> bool {
        let position = self.nodes[id.index()]
            .inputs
            .iter()
            .position(|&input| input == Some(old));
        match position {
            Some(index) => {
                self.set_input(id, index, new);
                true
            }
            None => false,
        }
    }

    /// Redirect every usage of `id` to `replacement`
    pub fn replace_at_usages(&mut self, id: NodeId, replacement: Option<NodeId>) {
        debug_assert!(replacement != Some(id));
        let usages = std::mem::take(&mut self.nodes[id.index()].usages);
        for usage in usages {
            let slots: SmallVec<[usize; 4]> = self.nodes[usage.index()]
                .inputs
                .iter()
                .enumerate()
                .filter(|(_, input)| **input == Some(id))
                .map(|(i, _)| i)
                .collect();
            // The usage entry for `id` was already dropped with the take above.
            for slot in slots {
                self.nodes[usage.index()].inputs[slot] = replacement;
                if let Some(new) = replacement {
                    self.nodes[new.index()].usages.push(usage);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    /// Link `id -> next` in the control chain
    pub fn set_next(&mut self, id: NodeId, next: Option<NodeId>) {
        debug_assert!(self.op(id).is_fixed_with_next());
        if let Some(old) = self.nodes[id.index()].next {
            if self.nodes[old.index()].predecessor == Some(id) {
                self.nodes[old.index()].predecessor = None;
            }
        }
        self.nodes[id.index()].next = next;
        if let Some(next) = next {
            self.nodes[next.index()].predecessor = Some(id);
        }
    }

    /// Control successors of a fixed node
    pub fn successors(&self, id: NodeId) -> SmallVec<[NodeId; 2]> {
        match self.op(id) {
            Op::If {
                true_successor,
                false_successor,
            } => SmallVec::from_slice(&[*true_successor, *false_successor]),
            _ => self.next(id).into_iter().collect(),
        }
    }

    /// Rewire the control edge `pred -> old` to `pred -> new`
    pub fn replace_successor(&mut self, pred: NodeId, old: NodeId, new: Option<NodeId>) {
        match self.nodes[pred.index()].op.clone() {
            Op::If {
                true_successor,
                false_successor,
            } => {
                let new = match new {
                    Some(new) => new,
                    None => {
                        debug_assert!(false, "cannot clear a successor of {}", pred);
                        return;
                    }
                };
                let op = if true_successor == old {
                    Op::If {
                        true_successor: new,
                        false_successor,
                    }
                } else {
                    Op::If {
                        true_successor,
                        false_successor: new,
                    }
                };
                self.nodes[pred.index()].op = op;
                self.nodes[new.index()].predecessor = Some(pred);
            }
            _ => {
                if self.nodes[pred.index()].next == Some(old) {
                    self.set_next(pred, new);
                }
            }
        }
        if self.nodes[old.index()].predecessor == Some(pred) {
            self.nodes[old.index()].predecessor = None;
        }
    }

    /// Insert the fixed-with-next node `id` right before `position`
    pub fn add_before_fixed(&mut self, position: NodeId, id: NodeId) {
        debug_assert!(self.op(id).is_fixed_with_next());
        match self.predecessor(position) {
            Some(pred) => {
                self.replace_successor(pred, position, Some(id));
                self.set_next(id, Some(position));
            }
            None => debug_assert!(false, "{} has no predecessor", position),
        }
    }

    /// Unlink a fixed-with-next node from the control chain without deleting it
    pub fn remove_fixed(&mut self, id: NodeId) {
        if !self.op(id).is_fixed_with_next() {
            return;
        }
        let pred = self.predecessor(id);
        let next = self.next(id);
        self.set_next(id, None);
        if let Some(pred) = pred {
            self.replace_successor(pred, id, next);
        }
        self.nodes[id.index()].predecessor = None;
    }

    // ------------------------------------------------------------------
    // Structure queries
    // ------------------------------------------------------------------

    /// Phis attached to a merge, in creation order
    pub fn phis(&self, merge: NodeId) -> Vec<NodeId> {
        let mut phis: Vec<NodeId> = self
            .usages(merge)
            .iter()
            .copied()
            .filter(|&u| self.is_alive(u) && self.op(u).is_phi() && self.input(u, 0) == Some(merge))
            .collect();
        phis.sort();
        phis.dedup();
        phis
    }

    /// Value proxies attached to a loop exit, in creation order
    pub fn proxies(&self, loop_exit: NodeId) -> Vec<NodeId> {
        let mut proxies: Vec<NodeId> = self
            .usages(loop_exit)
            .iter()
            .copied()
            .filter(|&u| {
                self.is_alive(u) && matches!(self.op(u), Op::ValueProxy) && self.input(u, 1) == Some(loop_exit)
            })
            .collect();
        proxies.sort();
        proxies.dedup();
        proxies
    }

    pub fn phi_value_at(&self, phi: NodeId, index: usize) -> Option<NodeId> {
        self.input(phi, index + 1)
    }

    pub fn set_phi_value(&mut self, phi: NodeId, index: usize, value: Option<NodeId>) {
        let slot = index + 1;
        while self.nodes[phi.index()].inputs.len() <= slot {
            self.nodes[phi.index()].inputs.push(None);
        }
        self.set_input(phi, slot, value);
    }

    pub fn phi_value_count(&self, phi: NodeId) -> usize {
        self.inputs(phi).len().saturating_sub(1)
    }

    /// Ends flowing into a merge, in predecessor order
    pub fn merge_ends(&self, merge: NodeId) -> Vec<NodeId> {
        self.inputs(merge).iter().flatten().copied().collect()
    }

    /// The merge an `End` or `LoopEnd` flows into
    pub fn end_merge(&self, end: NodeId) -> Option<NodeId> {
        match self.op(end) {
            Op::LoopEnd => self.input(end, 0),
            Op::End => self
                .usages(end)
                .iter()
                .copied()
                .find(|&u| self.is_alive(u) && self.op(u).is_merge()),
            _ => None,
        }
    }

    pub fn loop_exits(&self, loop_begin: NodeId) -> Vec<NodeId> {
        let mut exits: Vec<NodeId> = self
            .usages(loop_begin)
            .iter()
            .copied()
            .filter(|&u| self.is_alive(u) && matches!(self.op(u), Op::LoopExit))
            .collect();
        exits.sort();
        exits.dedup();
        exits
    }

    // ------------------------------------------------------------------
    // Deletion
    // ------------------------------------------------------------------

    /// Delete a node. Its remaining usages must already have been redirected.
    pub fn kill(&mut self, id: NodeId) {
        if self.is_deleted(id) {
            return;
        }
        debug_assert!(
            self.usages(id).iter().all(|&u| !self.is_alive(u)),
            "{} ({}) still has live usages",
            id,
            self.op(id).name()
        );
        if self.op(id).is_fixed() {
            if let Some(next) = self.next(id) {
                if self.predecessor(next) == Some(id) {
                    self.nodes[next.index()].predecessor = None;
                }
            }
            self.nodes[id.index()].next = None;
            if let Some(pred) = self.predecessor(id) {
                if self.next(pred) == Some(id) {
                    self.nodes[pred.index()].next = None;
                }
            }
            self.nodes[id.index()].predecessor = None;
        }
        let was_alive = self.is_alive(id);
        let inputs = std::mem::take(&mut self.nodes[id.index()].inputs);
        if was_alive {
            for input in inputs.iter().flatten() {
                self.remove_usage(*input, id);
            }
        }
        self.nodes[id.index()].usages.clear();
        self.nodes[id.index()].state = NodeState::Deleted;
    }

    /// Delete a node, then every floating input that became unused
    pub fn kill_with_unused_floating_inputs(&mut self, id: NodeId) {
        let mut worklist = vec![id];
        while let Some(node) = worklist.pop() {
            if self.is_deleted(node) {
                continue;
            }
            let inputs: SmallVec<[NodeId; 4]> = self.inputs(node).iter().flatten().copied().collect();
            self.kill(node);
            for input in inputs {
                if self.is_alive(input) && self.op(input).is_floating() && self.usages(input).is_empty() {
                    worklist.push(input);
                }
            }
        }
    }

    /// Replace the control split `split` by its successor `survivor` and delete the
    /// control flow that hung off the other successor.
    pub fn remove_split_propagate(&mut self, split: NodeId, survivor: NodeId) {
        let (true_successor, false_successor) = match self.op(split) {
            Op::If {
                true_successor,
                false_successor,
            } => (*true_successor, *false_successor),
            _ => {
                debug_assert!(false, "{} is not a split", split);
                return;
            }
        };
        let dead = if survivor == true_successor {
            false_successor
        } else {
            true_successor
        };
        let pred = self.predecessor(split);
        self.nodes[split.index()].predecessor = None;
        self.nodes[survivor.index()].predecessor = None;
        self.nodes[dead.index()].predecessor = None;
        if let Some(pred) = pred {
            self.set_next(pred, Some(survivor));
        }
        self.kill_with_unused_floating_inputs(split);
        self.kill_cfg(dead);
    }

    /// Delete all control flow reachable from `start` up to the merges it joins
    pub fn kill_cfg(&mut self, start: NodeId) {
        let mut worklist = vec![start];
        let mut visited = FxHashSet::default();
        let mut dead = Vec::new();
        while let Some(node) = worklist.pop() {
            if !self.is_alive(node) || !visited.insert(node) {
                continue;
            }
            match self.op(node) {
                Op::End => {
                    if let Some(merge) = self.end_merge(node) {
                        self.remove_end(merge, node, &mut worklist);
                    } else {
                        dead.push(node);
                    }
                }
                Op::LoopEnd => {
                    match self.input(node, 0) {
                        Some(loop_begin) if self.is_alive(loop_begin) && !visited.contains(&loop_begin) => {
                            self.remove_loop_end(loop_begin, node);
                        }
                        _ => dead.push(node),
                    }
                }
                _ => {
                    worklist.extend(self.successors(node));
                    dead.push(node);
                }
            }
        }
        for node in dead {
            if self.is_alive(node) {
                self.replace_at_usages(node, None);
                self.kill_with_unused_floating_inputs(node);
            }
        }
    }

    fn drop_phi_input(&mut self, phi: NodeId, index: usize) {
        let value = self.phi_value_at(phi, index);
        self.remove_input(phi, index + 1);
        if let Some(value) = value {
            if self.is_alive(value) && self.op(value).is_floating() && self.usages(value).is_empty() {
                self.kill_with_unused_floating_inputs(value);
            }
        }
    }

    fn remove_end(&mut self, merge: NodeId, end: NodeId, worklist: &mut Vec<NodeId>) {
        let index = match self.inputs(merge).iter().position(|&i| i == Some(end)) {
            Some(index) => index,
            None => return,
        };
        for phi in self.phis(merge) {
            self.drop_phi_input(phi, index);
        }
        self.remove_input(merge, index);
        self.kill(end);

        let is_loop = matches!(self.op(merge), Op::LoopBegin);
        let forward_ends = if is_loop {
            if index == 0 {
                0
            } else {
                1
            }
        } else {
            self.inputs(merge).len()
        };
        if forward_ends == 0 {
            // Nothing flows into this merge any more.
            for phi in self.phis(merge) {
                self.replace_at_usages(phi, None);
                self.kill_with_unused_floating_inputs(phi);
            }
            worklist.push(merge);
        } else if !is_loop && forward_ends == 1 {
            self.reduce_trivial_merge(merge);
        }
    }

    fn remove_loop_end(&mut self, loop_begin: NodeId, loop_end: NodeId) {
        let index = match self.inputs(loop_begin).iter().position(|&i| i == Some(loop_end)) {
            Some(index) if index > 0 => index,
            _ => {
                self.kill(loop_end);
                return;
            }
        };
        for phi in self.phis(loop_begin) {
            self.drop_phi_input(phi, index);
        }
        self.remove_input(loop_begin, index);
        self.kill(loop_end);
        if self.inputs(loop_begin).len() == 1 {
            self.reduce_degenerate_loop_begin(loop_begin);
        }
    }

    /// Fold a merge with a single remaining end into straight-line control flow
    fn reduce_trivial_merge(&mut self, merge: NodeId) {
        let end = match self.input(merge, 0) {
            Some(end) => end,
            None => return,
        };
        for phi in self.phis(merge) {
            let value = self.phi_value_at(phi, 0);
            self.replace_at_usages(phi, value);
            self.kill(phi);
        }
        let pred = self.predecessor(end);
        let next = self.next(merge);
        self.set_input(merge, 0, None);
        self.kill(end);
        self.set_next(merge, None);
        if let (Some(pred), Some(next)) = (pred, next) {
            self.set_next(pred, Some(next));
        }
        self.replace_at_usages(merge, None);
        self.kill(merge);
    }

    /// Turn a loop that lost all its back edges into straight-line control flow
    fn reduce_degenerate_loop_begin(&mut self, loop_begin: NodeId) {
        for exit in self.loop_exits(loop_begin) {
            for proxy in self.proxies(exit) {
                let value = self.input(proxy, 0);
                self.replace_at_usages(proxy, value);
                self.kill(proxy);
            }
            self.set_input(exit, 0, None);
            self.nodes[exit.index()].inputs.clear();
            self.set_op(exit, Op::Begin);
        }
        self.set_op(loop_begin, Op::Merge);
        self.reduce_trivial_merge(loop_begin);
    }

    // ------------------------------------------------------------------
    // Reachability
    // ------------------------------------------------------------------

    /// Fixed nodes reachable from start through control edges
    pub fn control_reachable(&self) -> FxHashSet<NodeId> {
        let mut flood = FxHashSet::default();
        let mut worklist = vec![self.start];
        while let Some(node) = worklist.pop() {
            if !self.is_alive(node) || !flood.insert(node) {
                continue;
            }
            match self.op(node) {
                Op::End => worklist.extend(self.end_merge(node)),
                Op::LoopEnd => {}
                _ => worklist.extend(self.successors(node)),
            }
        }
        flood
    }

    /// Nodes reachable from start through control edges and then inputs.
    /// Phis are only reached when something reachable uses them.
    pub fn reachable(&self) -> FxHashSet<NodeId> {
        let mut flood = self.control_reachable();
        let mut worklist: Vec<NodeId> = flood.iter().copied().collect();
        while let Some(node) = worklist.pop() {
            for input in self.inputs(node).iter().flatten() {
                if self.is_alive(*input) && flood.insert(*input) {
                    worklist.push(*input);
                }
            }
        }
        flood
    }
}
