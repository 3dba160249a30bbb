//! Graph builder
//!
//! Convenience API for constructing structured graphs. The builder keeps track
//! of the fixed node new fixed nodes are appended after.

use super::{Graph, LocationIdentity, NodeId, Op, Stamp};

/// Builder for [`Graph`]s with structured control flow
pub struct GraphBuilder {
    graph: Graph,
    /// Last fixed-with-next node of the current block, `None` after a block end
    current: Option<NodeId>,
    next_lock_depth: u32,
}

impl Default for GraphBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphBuilder {
    pub fn new() -> Self {
        let graph = Graph::new();
        let start = graph.start();
        Self {
            graph,
            current: Some(start),
            next_lock_depth: 0,
        }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    /// Current insertion point
    pub fn current(&self) -> Option<NodeId> {
        self.current
    }

    /// Continue appending after `node`
    pub fn switch_to(&mut self, node: NodeId) {
        debug_assert!(self.graph.op(node).is_fixed_with_next());
        self.current = Some(node);
    }

    pub fn finish(self) -> Graph {
        self.graph
    }

    fn append(&mut self, op: Op, inputs: &[Option<NodeId>], stamp: Stamp) -> NodeId {
        let node = self.graph.add(op, inputs, stamp);
        match self.current {
            Some(current) => self.graph.set_next(current, Some(node)),
            None => panic!("no insertion point for {}", node),
        }
        self.current = if self.graph.op(node).is_fixed_with_next() {
            Some(node)
        } else {
            None
        };
        node
    }

    // ------------------------------------------------------------------
    // Floating values
    // ------------------------------------------------------------------

    pub fn constant(&mut self, value: i64) -> NodeId {
        self.graph.add(Op::Constant(value), &[], Stamp::Int)
    }

    pub fn logic_constant(&mut self, value: bool) -> NodeId {
        self.graph.add(Op::LogicConstant(value), &[], Stamp::Bool)
    }

    pub fn parameter(&mut self, index: u32, stamp: Stamp) -> NodeId {
        self.graph.add(Op::Parameter(index), &[], stamp)
    }

    pub fn add(&mut self, x: NodeId, y: NodeId) -> NodeId {
        self.graph.add(Op::Add, &[Some(x), Some(y)], Stamp::Int)
    }

    pub fn int_equals(&mut self, x: NodeId, y: NodeId) -> NodeId {
        self.graph.add(Op::IntegerEquals, &[Some(x), Some(y)], Stamp::Bool)
    }

    // ------------------------------------------------------------------
    // Fixed nodes
    // ------------------------------------------------------------------

    pub fn new_instance(&mut self, field_count: usize) -> NodeId {
        self.append(Op::NewInstance { field_count }, &[], Stamp::Object)
    }

    pub fn load_field(&mut self, object: NodeId, field: usize, location: LocationIdentity, stamp: Stamp) -> NodeId {
        self.append(Op::LoadField { field, location }, &[Some(object)], stamp)
    }

    pub fn store_field(&mut self, object: NodeId, field: usize, location: LocationIdentity, value: NodeId) -> NodeId {
        self.append(
            Op::StoreField { field, location },
            &[Some(object), Some(value)],
            Stamp::Void,
        )
    }

    /// Lock `object`, returning the monitor id used to unlock it again
    pub fn monitor_enter(&mut self, object: NodeId) -> NodeId {
        let lock_depth = self.next_lock_depth;
        self.next_lock_depth += 1;
        let monitor_id = self.graph.add(Op::MonitorId { lock_depth }, &[], Stamp::Void);
        self.append(Op::MonitorEnter, &[Some(object), Some(monitor_id)], Stamp::Void);
        monitor_id
    }

    pub fn monitor_exit(&mut self, object: NodeId, monitor_id: NodeId) -> NodeId {
        self.next_lock_depth = self.next_lock_depth.saturating_sub(1);
        self.append(Op::MonitorExit, &[Some(object), Some(monitor_id)], Stamp::Void)
    }

    pub fn invoke(&mut self, args: &[NodeId], stamp: Stamp) -> NodeId {
        let inputs: Vec<Option<NodeId>> = args.iter().copied().map(Some).collect();
        self.append(Op::Invoke, &inputs, stamp)
    }

    pub fn ensure_virtualized(&mut self, object: NodeId) -> NodeId {
        self.append(Op::EnsureVirtualized, &[Some(object)], Stamp::Void)
    }

    pub fn return_(&mut self, value: Option<NodeId>) -> NodeId {
        let inputs: Vec<Option<NodeId>> = value.into_iter().map(Some).collect();
        self.append(Op::Return, &inputs, Stamp::Void)
    }

    // ------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------

    /// Split on `condition`, returning the `(true, false)` successor begins.
    /// The insertion point is left unset; pick a branch with [`switch_to`].
    ///
    /// [`switch_to`]: GraphBuilder::switch_to
    pub fn if_(&mut self, condition: NodeId) -> (NodeId, NodeId) {
        let true_begin = self.graph.add(Op::Begin, &[], Stamp::Void);
        let false_begin = self.graph.add(Op::Begin, &[], Stamp::Void);
        let split = self.append(
            Op::If {
                true_successor: true_begin,
                false_successor: false_begin,
            },
            &[Some(condition)],
            Stamp::Void,
        );
        self.graph.nodes[true_begin.index()].predecessor = Some(split);
        self.graph.nodes[false_begin.index()].predecessor = Some(split);
        (true_begin, false_begin)
    }

    /// Terminate the current block with an `End`
    pub fn end(&mut self) -> NodeId {
        self.append(Op::End, &[], Stamp::Void)
    }

    /// Join `ends` in a new merge and continue after it
    pub fn merge(&mut self, ends: &[NodeId]) -> NodeId {
        let inputs: Vec<Option<NodeId>> = ends.iter().copied().map(Some).collect();
        let merge = self.graph.add(Op::Merge, &inputs, Stamp::Void);
        self.current = Some(merge);
        merge
    }

    /// A phi at `merge` with one value per merge end
    pub fn phi(&mut self, merge: NodeId, values: &[NodeId], stamp: Stamp) -> NodeId {
        let mut inputs = vec![Some(merge)];
        inputs.extend(values.iter().copied().map(Some));
        self.graph.add(Op::ValuePhi, &inputs, stamp)
    }

    /// End the current block and open a loop header after it
    pub fn loop_begin(&mut self) -> NodeId {
        let forward_end = self.end();
        let loop_begin = self.graph.add(Op::LoopBegin, &[Some(forward_end)], Stamp::Void);
        self.current = Some(loop_begin);
        loop_begin
    }

    /// A loop phi with `initial` as its forward value; back-edge values are
    /// added with [`append_phi_value`].
    ///
    /// [`append_phi_value`]: GraphBuilder::append_phi_value
    pub fn loop_phi(&mut self, loop_begin: NodeId, initial: NodeId, stamp: Stamp) -> NodeId {
        self.graph
            .add(Op::ValuePhi, &[Some(loop_begin), Some(initial)], stamp)
    }

    pub fn append_phi_value(&mut self, phi: NodeId, value: NodeId) {
        self.graph.push_input(phi, Some(value));
    }

    /// Close the current block with a back edge to `loop_begin`
    pub fn loop_end(&mut self, loop_begin: NodeId) -> NodeId {
        let loop_end = self.append(Op::LoopEnd, &[Some(loop_begin)], Stamp::Void);
        self.graph.push_input(loop_begin, Some(loop_end));
        loop_end
    }

    /// Split on `condition`, leaving `loop_begin` through a `LoopExit` when the
    /// condition equals `exit_when`. Returns `(body_begin, loop_exit)`; the
    /// insertion point is left unset.
    pub fn if_exit(&mut self, condition: NodeId, loop_begin: NodeId, exit_when: bool) -> (NodeId, NodeId) {
        let body = self.graph.add(Op::Begin, &[], Stamp::Void);
        let exit = self.graph.add(Op::LoopExit, &[Some(loop_begin)], Stamp::Void);
        let (true_successor, false_successor) = if exit_when { (exit, body) } else { (body, exit) };
        let split = self.append(
            Op::If {
                true_successor,
                false_successor,
            },
            &[Some(condition)],
            Stamp::Void,
        );
        self.graph.nodes[body.index()].predecessor = Some(split);
        self.graph.nodes[exit.index()].predecessor = Some(split);
        (body, exit)
    }

    /// Proxy `value` out of a loop through `loop_exit`
    pub fn proxy(&mut self, value: NodeId, loop_exit: NodeId) -> NodeId {
        let stamp = self.graph.stamp(value);
        self.graph
            .add(Op::ValueProxy, &[Some(value), Some(loop_exit)], stamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_diamond_structure() {
        let mut b = GraphBuilder::new();
        let p = b.parameter(0, Stamp::Bool);
        let (t, f) = b.if_(p);
        b.switch_to(t);
        let e1 = b.end();
        b.switch_to(f);
        let e2 = b.end();
        let m = b.merge(&[e1, e2]);
        let one = b.constant(1);
        let two = b.constant(2);
        let phi = b.phi(m, &[one, two], Stamp::Int);
        b.return_(Some(phi));
        let graph = b.finish();

        assert_eq!(graph.merge_ends(m), vec![e1, e2]);
        assert_eq!(graph.end_merge(e1), Some(m));
        assert_eq!(graph.phis(m), vec![phi]);
        assert_eq!(graph.phi_value_at(phi, 1), Some(two));
        assert_eq!(graph.predecessor(t).map(|s| graph.op(s).name()), Some("If"));
    }

    #[test]
    fn test_loop_structure() {
        let mut b = GraphBuilder::new();
        let zero = b.constant(0);
        let lb = b.loop_begin();
        let i = b.loop_phi(lb, zero, Stamp::Int);
        let ten = b.constant(10);
        let done = b.int_equals(i, ten);
        let (body, exit) = b.if_exit(done, lb, true);
        b.switch_to(body);
        let one = b.constant(1);
        let next = b.add(i, one);
        b.append_phi_value(i, next);
        let le = b.loop_end(lb);
        b.switch_to(exit);
        let out = b.proxy(i, exit);
        b.return_(Some(out));
        let graph = b.finish();

        assert_eq!(graph.inputs(lb).len(), 2);
        assert_eq!(graph.input(lb, 1), Some(le));
        assert_eq!(graph.end_merge(le), Some(lb));
        assert_eq!(graph.loop_exits(lb), vec![exit]);
        assert_eq!(graph.proxies(exit), vec![out]);
        assert_eq!(graph.phi_value_count(i), 2);
    }
}
