//! Scalar alias table
//!
//! Maps graph values to their current stand-in during analysis. A value with no
//! entry is its own alias. Policies may also alias a value to a virtual object
//! node; such aliases are never handed out as scalar substitutes.

use crate::graph::{Graph, NodeId};
use fxhash::{FxHashMap, FxHashSet};

#[derive(Debug, Default)]
pub struct AliasTable {
    aliases: FxHashMap<NodeId, NodeId>,
    has_scalar_replaced_inputs: FxHashSet<NodeId>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raw alias lookup, including virtual object aliases
    pub fn get(&self, node: NodeId) -> Option<NodeId> {
        self.aliases.get(&node).copied()
    }

    /// Record an alias without touching the scalar-replaced-inputs marks
    pub fn set_alias(&mut self, node: NodeId, alias: NodeId) {
        self.aliases.insert(node, alias);
    }

    /// Forget the alias of `node`
    pub fn clear(&mut self, node: NodeId) {
        self.aliases.remove(&node);
    }

    /// Record `alias` as the scalar replacement of `node` and mark every usage
    /// of `node` as having a scalar-replaced input.
    pub fn add_scalar_alias(&mut self, graph: &Graph, node: NodeId, alias: NodeId) {
        debug_assert!(
            !graph.op(alias).is_virtual_object(),
            "virtual object {} used as scalar alias of {}",
            alias,
            node
        );
        self.aliases.insert(node, alias);
        for &usage in graph.usages(node) {
            self.has_scalar_replaced_inputs.insert(usage);
        }
    }

    /// Current scalar stand-in for `node`, or `node` itself when it has none
    pub fn get_scalar_alias(&self, graph: &Graph, node: NodeId) -> NodeId {
        debug_assert!(!graph.op(node).is_virtual_object());
        if !graph.is_alive(node) {
            return node;
        }
        match self.aliases.get(&node) {
            Some(&alias) if !graph.op(alias).is_virtual_object() => alias,
            _ => node,
        }
    }

    pub fn has_scalar_replaced_inputs(&self, node: NodeId) -> bool {
        self.has_scalar_replaced_inputs.contains(&node)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{Op, Stamp};

    #[test]
    fn test_scalar_alias_resolution() {
        let mut graph = Graph::new();
        let a = graph.add(Op::Constant(1), &[], Stamp::Int);
        let b = graph.add(Op::Constant(2), &[], Stamp::Int);
        let user = graph.add(Op::Add, &[Some(a), Some(a)], Stamp::Int);
        let vobj = graph.add_detached(
            Op::VirtualObject {
                object_id: 0,
                field_count: 0,
            },
            &[],
            Stamp::Object,
        );
        let mut aliases = AliasTable::new();

        assert_eq!(aliases.get_scalar_alias(&graph, a), a);
        assert!(!aliases.has_scalar_replaced_inputs(user));

        aliases.add_scalar_alias(&graph, a, b);
        assert_eq!(aliases.get_scalar_alias(&graph, a), b);
        assert_eq!(aliases.get_scalar_alias(&graph, a), aliases.get_scalar_alias(&graph, a));
        assert!(aliases.has_scalar_replaced_inputs(user));

        // Virtual object aliases are not scalar substitutes.
        aliases.set_alias(b, vobj);
        assert_eq!(aliases.get_scalar_alias(&graph, b), b);
        assert_eq!(aliases.get(b), Some(vobj));

        aliases.clear(a);
        assert_eq!(aliases.get_scalar_alias(&graph, a), a);
    }

    #[test]
    fn test_dead_nodes_alias_themselves() {
        let mut graph = Graph::new();
        let a = graph.add(Op::Constant(1), &[], Stamp::Int);
        let b = graph.add(Op::Constant(2), &[], Stamp::Int);
        let mut aliases = AliasTable::new();
        aliases.add_scalar_alias(&graph, a, b);
        graph.kill(a);
        assert_eq!(aliases.get_scalar_alias(&graph, a), a);
    }
}
