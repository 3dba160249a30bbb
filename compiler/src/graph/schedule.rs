//! Node schedule
//!
//! Assigns every floating node to a block and orders each block's nodes so a
//! node comes after the inputs it depends on. Floating nodes are placed early:
//! in the deepest (in dominator order) block among their inputs' blocks, right
//! before their first user in that block. Phis and proxies are owned by their
//! merge or loop exit and are not part of any node list.

use super::cfg::{BlockId, ControlFlowGraph};
use super::{Graph, NodeId, Op};
use fxhash::{FxHashMap, FxHashSet};

#[derive(Debug, Clone)]
pub struct ScheduleResult {
    block_to_nodes: Vec<Vec<NodeId>>,
    node_to_block: FxHashMap<NodeId, BlockId>,
}

impl ScheduleResult {
    pub fn compute(graph: &Graph, cfg: &ControlFlowGraph) -> Self {
        let mut node_to_block: FxHashMap<NodeId, BlockId> = FxHashMap::default();
        for block in cfg.blocks() {
            for &node in &block.nodes {
                node_to_block.insert(node, block.id);
            }
            for phi in graph.phis(block.begin) {
                node_to_block.insert(phi, block.id);
            }
            if matches!(graph.op(block.begin), Op::LoopExit) {
                for proxy in graph.proxies(block.begin) {
                    node_to_block.insert(proxy, block.id);
                }
            }
        }

        // Place floating nodes that live fixed nodes, phis or proxies depend on.
        let live = Self::live_nodes(graph);
        let mut floating: Vec<NodeId> = live
            .iter()
            .copied()
            .filter(|&n| Self::is_scheduled_floating(graph, n))
            .collect();
        floating.sort();
        for &node in &floating {
            Self::place_early(graph, cfg, node, &mut node_to_block);
        }

        let mut pending: Vec<Vec<NodeId>> = vec![Vec::new(); cfg.blocks().len()];
        for &node in &floating {
            if let Some(block) = node_to_block.get(&node) {
                pending[block.index()].push(node);
            }
        }

        let mut emitted: FxHashSet<NodeId> = FxHashSet::default();
        let mut block_to_nodes = Vec::with_capacity(cfg.blocks().len());
        for block in cfg.blocks() {
            let mut list = Vec::new();
            let last = block.nodes.len() - 1;
            for (index, &fixed) in block.nodes.iter().enumerate() {
                if index == last {
                    // Floating nodes nobody in this block uses go before the block end.
                    for &node in &pending[block.id.index()] {
                        Self::emit(graph, node, block.id, &node_to_block, &mut emitted, &mut list);
                    }
                }
                for input in graph.inputs(fixed).iter().flatten() {
                    Self::emit(graph, *input, block.id, &node_to_block, &mut emitted, &mut list);
                }
                list.push(fixed);
            }
            block_to_nodes.push(list);
        }

        Self {
            block_to_nodes,
            node_to_block,
        }
    }

    /// Control-reachable nodes plus the phis and proxies hanging off them,
    /// closed over inputs
    fn live_nodes(graph: &Graph) -> FxHashSet<NodeId> {
        let mut live = graph.control_reachable();
        let mut worklist: Vec<NodeId> = live.iter().copied().collect();
        while let Some(node) = worklist.pop() {
            let mut next: Vec<NodeId> = graph.inputs(node).iter().flatten().copied().collect();
            if graph.op(node).is_merge() {
                next.extend(graph.phis(node));
            }
            if matches!(graph.op(node), Op::LoopExit) {
                next.extend(graph.proxies(node));
            }
            for n in next {
                if graph.is_alive(n) && live.insert(n) {
                    worklist.push(n);
                }
            }
        }
        live
    }

    fn is_scheduled_floating(graph: &Graph, node: NodeId) -> bool {
        let op = graph.op(node);
        op.is_floating()
            && !matches!(op, Op::ValuePhi | Op::ValueProxy | Op::VirtualObject { .. })
            && graph.is_alive(node)
    }

    fn place_early(
        graph: &Graph,
        cfg: &ControlFlowGraph,
        node: NodeId,
        node_to_block: &mut FxHashMap<NodeId, BlockId>,
    ) -> BlockId {
        if let Some(&block) = node_to_block.get(&node) {
            return block;
        }
        let mut placement = cfg.start_block();
        let inputs: Vec<NodeId> = graph.inputs(node).iter().flatten().copied().collect();
        for input in inputs {
            let block = if Self::is_scheduled_floating(graph, input) {
                Self::place_early(graph, cfg, input, node_to_block)
            } else {
                match node_to_block.get(&input) {
                    Some(&block) => block,
                    None => continue,
                }
            };
            if cfg.dominators().depth(block) > cfg.dominators().depth(placement) {
                placement = block;
            }
        }
        node_to_block.insert(node, placement);
        placement
    }

    /// Emit `node` and its same-block floating inputs, inputs first
    fn emit(
        graph: &Graph,
        node: NodeId,
        block: BlockId,
        node_to_block: &FxHashMap<NodeId, BlockId>,
        emitted: &mut FxHashSet<NodeId>,
        list: &mut Vec<NodeId>,
    ) {
        if !Self::is_scheduled_floating(graph, node)
            || node_to_block.get(&node) != Some(&block)
            || emitted.contains(&node)
        {
            return;
        }
        emitted.insert(node);
        for input in graph.inputs(node).iter().flatten() {
            Self::emit(graph, *input, block, node_to_block, emitted, list);
        }
        list.push(node);
    }

    /// Nodes of `block` in processing order
    pub fn nodes_for(&self, block: BlockId) -> &[NodeId] {
        self.block_to_nodes
            .get(block.index())
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn block_of(&self, node: NodeId) -> Option<BlockId> {
        self.node_to_block.get(&node).copied()
    }
}
