//! Deferred graph effects
//!
//! Analysis never mutates the graph it walks. Instead it records [`Effect`]s in
//! per-block [`GraphEffectList`]s that are replayed once the analysis has
//! converged: first every general effect, then every control-flow-kill effect.

use crate::graph::{Graph, NodeId};
use std::fmt;

/// One deferred graph mutation
pub trait Effect: fmt::Debug {
    fn name(&self) -> &'static str;

    /// Effects that remove control flow run in the second replay pass
    fn is_cfg_kill(&self) -> bool {
        false
    }

    /// Perform the mutation. Nodes that become garbage are pushed to `obsolete`
    /// and deleted after replay.
    fn apply(&self, graph: &mut Graph, obsolete: &mut Vec<NodeId>);
}

fn attach_if_detached(graph: &mut Graph, node: NodeId) {
    if graph.is_detached(node) {
        graph.attach(node);
    }
}

/// Add a floating node created during analysis
#[derive(Debug)]
pub struct AddFloatingNode {
    pub node: NodeId,
}

impl Effect for AddFloatingNode {
    fn name(&self) -> &'static str {
        "add floating node"
    }

    fn apply(&self, graph: &mut Graph, _obsolete: &mut Vec<NodeId>) {
        attach_if_detached(graph, self.node);
    }
}

/// Add a fixed node created during analysis and link it in before `position`
#[derive(Debug)]
pub struct AddFixedNodeBefore {
    pub node: NodeId,
    pub position: NodeId,
}

impl Effect for AddFixedNodeBefore {
    fn name(&self) -> &'static str {
        "add fixed node"
    }

    fn apply(&self, graph: &mut Graph, _obsolete: &mut Vec<NodeId>) {
        debug_assert!(graph.is_alive(self.position), "insertion point {} is gone", self.position);
        attach_if_detached(graph, self.node);
        graph.add_before_fixed(self.position, self.node);
    }
}

/// Set input `index` of a phi created during analysis
#[derive(Debug)]
pub struct InitializePhiInput {
    pub phi: NodeId,
    pub index: usize,
    pub value: NodeId,
}

impl Effect for InitializePhiInput {
    fn name(&self) -> &'static str {
        "set phi input"
    }

    fn apply(&self, graph: &mut Graph, _obsolete: &mut Vec<NodeId>) {
        attach_if_detached(graph, self.value);
        graph.set_phi_value(self.phi, self.index, Some(self.value));
    }
}

/// Redirect all usages of `node` to `replacement` and drop `node`
#[derive(Debug)]
pub struct ReplaceAtUsages {
    pub node: NodeId,
    pub replacement: NodeId,
}

impl Effect for ReplaceAtUsages {
    fn name(&self) -> &'static str {
        "replace at usages"
    }

    fn apply(&self, graph: &mut Graph, obsolete: &mut Vec<NodeId>) {
        attach_if_detached(graph, self.replacement);
        graph.replace_at_usages(self.node, Some(self.replacement));
        if graph.op(self.node).is_fixed_with_next() {
            graph.remove_fixed(self.node);
        }
        obsolete.push(self.node);
    }
}

/// Replace the first occurrence of `old` among the inputs of `node`
#[derive(Debug)]
pub struct ReplaceFirstInput {
    pub node: NodeId,
    pub old: NodeId,
    pub new: NodeId,
}

impl Effect for ReplaceFirstInput {
    fn name(&self) -> &'static str {
        "replace first input"
    }

    fn apply(&self, graph: &mut Graph, _obsolete: &mut Vec<NodeId>) {
        if graph.is_alive(self.node) {
            attach_if_detached(graph, self.new);
            graph.replace_first_input(self.node, self.old, Some(self.new));
        }
    }
}

/// Unlink `node` from the control chain and schedule it for deletion
#[derive(Debug)]
pub struct DeleteNode {
    pub node: NodeId,
}

impl Effect for DeleteNode {
    fn name(&self) -> &'static str {
        "delete node"
    }

    fn apply(&self, graph: &mut Graph, obsolete: &mut Vec<NodeId>) {
        if graph.op(self.node).is_fixed_with_next() {
            graph.remove_fixed(self.node);
        }
        obsolete.push(self.node);
    }
}

/// Remove the branch of `if_node` that a constant condition never takes
#[derive(Debug)]
pub struct KillIfBranch {
    pub if_node: NodeId,
    pub survivor: NodeId,
}

impl Effect for KillIfBranch {
    fn name(&self) -> &'static str {
        "kill if branch"
    }

    fn is_cfg_kill(&self) -> bool {
        true
    }

    fn apply(&self, graph: &mut Graph, _obsolete: &mut Vec<NodeId>) {
        if graph.is_alive(self.if_node) {
            graph.remove_split_propagate(self.if_node, self.survivor);
        }
    }
}

/// Ordered list of deferred effects
#[derive(Default)]
pub struct GraphEffectList {
    effects: Vec<Box<dyn Effect>>,
}

impl GraphEffectList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, effect: impl Effect + 'static) {
        self.effects.push(Box::new(effect));
    }

    pub fn add_boxed(&mut self, effect: Box<dyn Effect>) {
        self.effects.push(effect);
    }

    /// Append every effect of `other`, leaving it empty
    pub fn add_all(&mut self, other: &mut GraphEffectList) {
        self.effects.append(&mut other.effects);
    }

    /// Insert every effect of `other` at `position`, leaving it empty
    pub fn insert_all(&mut self, other: &mut GraphEffectList, position: usize) {
        let tail = self.effects.split_off(position);
        self.effects.append(&mut other.effects);
        self.effects.extend(tail);
    }

    pub fn clear(&mut self) {
        self.effects.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    /// Whether the list removes control flow
    pub fn has_cfg_kills(&self) -> bool {
        self.effects.iter().any(|e| e.is_cfg_kill())
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn Effect> {
        self.effects.iter().map(|e| e.as_ref())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.effects.iter().map(|e| e.name()).collect()
    }

    /// Replay either the general effects or the control-flow-kill effects
    pub fn apply(&self, graph: &mut Graph, obsolete: &mut Vec<NodeId>, cfg_kills: bool) {
        for effect in &self.effects {
            if effect.is_cfg_kill() == cfg_kills {
                log::trace!("applying effect {:?}", effect);
                effect.apply(graph, obsolete);
            }
        }
    }

    // Convenience constructors for the built-in effects

    pub fn add_floating_node(&mut self, node: NodeId) {
        self.add(AddFloatingNode { node });
    }

    pub fn add_fixed_node_before(&mut self, node: NodeId, position: NodeId) {
        self.add(AddFixedNodeBefore { node, position });
    }

    pub fn initialize_phi_input(&mut self, phi: NodeId, index: usize, value: NodeId) {
        self.add(InitializePhiInput { phi, index, value });
    }

    pub fn replace_at_usages(&mut self, node: NodeId, replacement: NodeId) {
        self.add(ReplaceAtUsages { node, replacement });
    }

    pub fn replace_first_input(&mut self, node: NodeId, old: NodeId, new: NodeId) {
        self.add(ReplaceFirstInput { node, old, new });
    }

    pub fn delete_node(&mut self, node: NodeId) {
        self.add(DeleteNode { node });
    }

    pub fn kill_if_branch(&mut self, if_node: NodeId, survivor: NodeId) {
        self.add(KillIfBranch { if_node, survivor });
    }
}

impl fmt::Debug for GraphEffectList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.effects.iter()).finish()
    }
}
