//! Control Flow Graph
//!
//! Block-level view of a node [`Graph`]:
//! - Blocks in reverse postorder (loop back edges ignored), so every block's
//!   forward predecessors come first
//! - Predecessor lists ordered to match merge inputs, so phi input `i` belongs to
//!   predecessor `i`
//! - Dominator tree (Cooper, Harvey and Kennedy's iterative algorithm)
//! - Natural loop nest with loop exits

use super::{Graph, NodeId, Op};
use fxhash::{FxHashMap, FxHashSet};
use std::collections::VecDeque;
use std::fmt;

/// Index of a block in reverse postorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockId(u32);

impl BlockId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "B{}", self.0)
    }
}

/// Index of a loop; outer loops get smaller ids than the loops nested in them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoopId(u32);

impl LoopId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LoopId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L{}", self.0)
    }
}

/// A basic block: a begin node followed by its fixed chain
#[derive(Debug, Clone)]
pub struct Block {
    pub id: BlockId,
    /// First node (`Start`, `Begin`, `Merge`, `LoopBegin` or `LoopExit`)
    pub begin: NodeId,
    /// Last fixed node (`End`, `LoopEnd`, `If` or `Return`)
    pub end: NodeId,
    /// Fixed nodes from `begin` to `end`, inclusive
    pub nodes: Vec<NodeId>,
    /// Predecessors in merge-input order; for loop headers the forward
    /// predecessor comes first, followed by the back edges
    pub predecessors: Vec<BlockId>,
    pub successors: Vec<BlockId>,
    /// Innermost loop containing this block
    pub loop_id: Option<LoopId>,
    pub is_loop_header: bool,
    /// Block starts with a forward `Merge`
    pub is_merge: bool,
    /// Block ends with a back edge
    pub is_loop_end: bool,
}

/// A natural loop
#[derive(Debug, Clone)]
pub struct Loop {
    pub id: LoopId,
    pub header: BlockId,
    /// Blocks of the loop body including the header and nested loops, in block order
    pub blocks: Vec<BlockId>,
    /// Blocks starting with a `LoopExit` of this loop, in block order
    pub exits: Vec<BlockId>,
    /// Blocks ending with a back edge, in loop-begin input order
    pub loop_ends: Vec<BlockId>,
    pub parent: Option<LoopId>,
    /// Nesting depth (0 = outermost)
    pub depth: usize,
}

impl Loop {
    pub fn contains(&self, block: BlockId) -> bool {
        self.blocks.binary_search(&block).is_ok()
    }
}

/// Dominator tree over blocks
#[derive(Debug, Clone)]
pub struct DominatorTree {
    /// Immediate dominator per block (the start block has none)
    idom: Vec<Option<BlockId>>,
    children: Vec<Vec<BlockId>>,
    depth: Vec<usize>,
}

impl DominatorTree {
    /// Compute the tree for blocks given in reverse postorder.
    fn compute(blocks: &[Block]) -> Self {
        let count = blocks.len();
        let mut idom: Vec<Option<BlockId>> = vec![None; count];
        if count == 0 {
            return Self {
                idom,
                children: Vec::new(),
                depth: Vec::new(),
            };
        }
        let entry = BlockId(0);
        idom[0] = Some(entry);

        let mut changed = true;
        while changed {
            changed = false;
            for block in blocks.iter().skip(1) {
                let mut new_idom: Option<BlockId> = None;
                for &pred in &block.predecessors {
                    if idom[pred.index()].is_none() {
                        continue;
                    }
                    new_idom = Some(match new_idom {
                        None => pred,
                        Some(current) => Self::intersect(current, pred, &idom),
                    });
                }
                if new_idom != idom[block.id.index()] {
                    idom[block.id.index()] = new_idom;
                    changed = true;
                }
            }
        }
        idom[0] = None;

        let mut children: Vec<Vec<BlockId>> = vec![Vec::new(); count];
        for (index, dom) in idom.iter().enumerate() {
            if let Some(dom) = dom {
                children[dom.index()].push(BlockId(index as u32));
            }
        }

        let mut depth = vec![0; count];
        let mut queue = VecDeque::new();
        queue.push_back(entry);
        while let Some(block) = queue.pop_front() {
            for &child in &children[block.index()] {
                depth[child.index()] = depth[block.index()] + 1;
                queue.push_back(child);
            }
        }

        Self { idom, children, depth }
    }

    /// Walk both blocks up the tree until they meet. Block ids are RPO indices.
    fn intersect(mut b1: BlockId, mut b2: BlockId, idom: &[Option<BlockId>]) -> BlockId {
        while b1 != b2 {
            while b1 > b2 {
                match idom[b1.index()] {
                    Some(dom) if dom != b1 => b1 = dom,
                    _ => return b1,
                }
            }
            while b2 > b1 {
                match idom[b2.index()] {
                    Some(dom) if dom != b2 => b2 = dom,
                    _ => return b2,
                }
            }
        }
        b1
    }

    pub fn idom(&self, block: BlockId) -> Option<BlockId> {
        self.idom.get(block.index()).copied().flatten()
    }

    pub fn children(&self, block: BlockId) -> &[BlockId] {
        self.children.get(block.index()).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn depth(&self, block: BlockId) -> usize {
        self.depth.get(block.index()).copied().unwrap_or(0)
    }

    /// Check if block A dominates block B.
    pub fn dominates(&self, a: BlockId, b: BlockId) -> bool {
        let mut current = b;
        loop {
            if current == a {
                return true;
            }
            match self.idom(current) {
                Some(dom) => current = dom,
                None => return false,
            }
        }
    }
}

/// Block structure of a graph
#[derive(Debug, Clone)]
pub struct ControlFlowGraph {
    blocks: Vec<Block>,
    loops: Vec<Loop>,
    block_of_node: FxHashMap<NodeId, BlockId>,
    loop_of_begin: FxHashMap<NodeId, LoopId>,
    dominators: DominatorTree,
}

impl ControlFlowGraph {
    /// Compute blocks, dominators and loops for the control flow reachable from start
    pub fn compute(graph: &Graph) -> Result<Self, String> {
        // Discover blocks in DFS order from the start node.
        let mut chains: Vec<Vec<NodeId>> = Vec::new();
        let mut chain_of_begin: FxHashMap<NodeId, usize> = FxHashMap::default();
        let mut worklist = vec![graph.start()];
        while let Some(begin) = worklist.pop() {
            if chain_of_begin.contains_key(&begin) {
                continue;
            }
            let chain = Self::walk_chain(graph, begin)?;
            let last = chain[chain.len() - 1];
            chain_of_begin.insert(begin, chains.len());
            chains.push(chain);
            for succ in Self::chain_successors(graph, last)? {
                if !chain_of_begin.contains_key(&succ) {
                    worklist.push(succ);
                }
            }
        }

        // Forward successors by chain index; back edges are kept separately.
        let mut forward: Vec<Vec<usize>> = Vec::with_capacity(chains.len());
        for chain in &chains {
            let last = chain[chain.len() - 1];
            let succs = if matches!(graph.op(last), Op::LoopEnd) {
                Vec::new()
            } else {
                Self::chain_successors(graph, last)?
                    .into_iter()
                    .map(|s| chain_of_begin[&s])
                    .collect()
            };
            forward.push(succs);
        }

        let entry = chain_of_begin[&graph.start()];
        let rpo = Self::reverse_postorder(&forward, entry);
        let mut block_of_chain = vec![None; chains.len()];
        for (index, &chain) in rpo.iter().enumerate() {
            block_of_chain[chain] = Some(BlockId(index as u32));
        }

        let mut blocks = Vec::with_capacity(rpo.len());
        let mut block_of_node = FxHashMap::default();
        let mut block_of_begin = FxHashMap::default();
        for (index, &chain) in rpo.iter().enumerate() {
            let id = BlockId(index as u32);
            let nodes = chains[chain].clone();
            for &node in &nodes {
                block_of_node.insert(node, id);
            }
            let begin = nodes[0];
            block_of_begin.insert(begin, id);
            let end = nodes[nodes.len() - 1];
            blocks.push(Block {
                id,
                begin,
                end,
                nodes,
                predecessors: Vec::new(),
                successors: Vec::new(),
                loop_id: None,
                is_loop_header: matches!(graph.op(begin), Op::LoopBegin),
                is_merge: matches!(graph.op(begin), Op::Merge),
                is_loop_end: matches!(graph.op(end), Op::LoopEnd),
            });
        }

        // Successors, then predecessors in merge-input order.
        for index in 0..blocks.len() {
            let end = blocks[index].end;
            let successors: Vec<BlockId> = Self::chain_successors(graph, end)?
                .into_iter()
                .filter_map(|s| block_of_begin.get(&s).copied())
                .collect();
            blocks[index].successors = successors;
        }
        for index in 0..blocks.len() {
            let begin = blocks[index].begin;
            let predecessors: Vec<BlockId> = if graph.op(begin).is_merge() {
                graph
                    .merge_ends(begin)
                    .into_iter()
                    .filter_map(|end| block_of_node.get(&end).copied())
                    .collect()
            } else {
                graph
                    .predecessor(begin)
                    .and_then(|pred| block_of_node.get(&pred).copied())
                    .into_iter()
                    .collect()
            };
            blocks[index].predecessors = predecessors;
        }

        let dominators = DominatorTree::compute(&blocks);
        let loops = Self::find_loops(graph, &mut blocks, &block_of_node, &block_of_begin)?;
        let loop_of_begin = loops
            .iter()
            .map(|l| (blocks[l.header.index()].begin, l.id))
            .collect();

        Ok(Self {
            blocks,
            loops,
            block_of_node,
            loop_of_begin,
            dominators,
        })
    }

    /// Follow `next` from a begin node to the node that ends its block
    fn walk_chain(graph: &Graph, begin: NodeId) -> Result<Vec<NodeId>, String> {
        let mut chain = vec![begin];
        let mut current = begin;
        while graph.op(current).is_fixed_with_next() {
            current = graph
                .next(current)
                .ok_or_else(|| format!("{} ({}) has no successor", current, graph.op(current).name()))?;
            if graph.op(current).is_merge() || matches!(graph.op(current), Op::LoopExit) {
                return Err(format!("{} is entered without an end", current));
            }
            chain.push(current);
        }
        Ok(chain)
    }

    fn chain_successors(graph: &Graph, last: NodeId) -> Result<Vec<NodeId>, String> {
        Ok(match graph.op(last) {
            Op::If {
                true_successor,
                false_successor,
            } => vec![*true_successor, *false_successor],
            Op::End => vec![graph
                .end_merge(last)
                .ok_or_else(|| format!("{} does not flow into a merge", last))?],
            Op::LoopEnd => vec![graph
                .input(last, 0)
                .ok_or_else(|| format!("{} has no loop begin", last))?],
            Op::Return => Vec::new(),
            other => return Err(format!("{} ({}) cannot end a block", last, other.name())),
        })
    }

    /// Reverse postorder of the forward edges
    fn reverse_postorder(forward: &[Vec<usize>], entry: usize) -> Vec<usize> {
        let mut visited = FxHashSet::default();
        let mut postorder = Vec::new();
        let mut stack: Vec<(usize, usize)> = vec![(entry, 0)];
        visited.insert(entry);
        while let Some((chain, next_child)) = stack.pop() {
            if let Some(&succ) = forward[chain].get(next_child) {
                stack.push((chain, next_child + 1));
                if visited.insert(succ) {
                    stack.push((succ, 0));
                }
            } else {
                postorder.push(chain);
            }
        }
        postorder.reverse();
        postorder
    }

    fn find_loops(
        graph: &Graph,
        blocks: &mut [Block],
        block_of_node: &FxHashMap<NodeId, BlockId>,
        block_of_begin: &FxHashMap<NodeId, BlockId>,
    ) -> Result<Vec<Loop>, String> {
        let mut loops: Vec<Loop> = Vec::new();
        for header in blocks.iter().filter(|b| b.is_loop_header) {
            let loop_begin = header.begin;
            let loop_ends: Vec<BlockId> = graph
                .inputs(loop_begin)
                .iter()
                .skip(1)
                .flatten()
                .filter_map(|end| block_of_node.get(end).copied())
                .collect();

            // Body: everything reaching a back edge without passing the header.
            let mut body: FxHashSet<BlockId> = FxHashSet::default();
            body.insert(header.id);
            let mut stack = loop_ends.clone();
            while let Some(block) = stack.pop() {
                if body.insert(block) {
                    stack.extend(blocks[block.index()].predecessors.iter().copied());
                }
            }
            let mut body: Vec<BlockId> = body.into_iter().collect();
            body.sort();

            let mut exits: Vec<BlockId> = graph
                .loop_exits(loop_begin)
                .into_iter()
                .filter_map(|exit| block_of_begin.get(&exit).copied())
                .collect();
            exits.sort();

            loops.push(Loop {
                id: LoopId(loops.len() as u32),
                header: header.id,
                blocks: body,
                exits,
                loop_ends,
                parent: None,
                depth: 0,
            });
        }

        // Innermost enclosing loop becomes the parent; headers are in RPO, so
        // enclosing loops always come first.
        for index in 0..loops.len() {
            let header = loops[index].header;
            let parent = loops[..index]
                .iter()
                .filter(|outer| outer.contains(header))
                .max_by_key(|outer| outer.header)
                .map(|outer| outer.id);
            loops[index].parent = parent;
            loops[index].depth = parent.map(|p| loops[p.index()].depth + 1).unwrap_or(0);
        }

        // Each block belongs to the innermost loop containing it.
        for l in &loops {
            for &block in &l.blocks {
                let innermost = match blocks[block.index()].loop_id {
                    Some(existing) => loops[existing.index()].depth < l.depth,
                    None => true,
                };
                if innermost {
                    blocks[block.index()].loop_id = Some(l.id);
                }
            }
        }

        for l in &loops {
            if l.loop_ends.is_empty() {
                return Err(format!("loop at {} has no back edge", blocks[l.header.index()].begin));
            }
        }
        Ok(loops)
    }

    pub fn blocks(&self) -> &[Block] {
        &self.blocks
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.index()]
    }

    pub fn start_block(&self) -> BlockId {
        BlockId(0)
    }

    pub fn loops(&self) -> &[Loop] {
        &self.loops
    }

    pub fn loop_info(&self, id: LoopId) -> &Loop {
        &self.loops[id.index()]
    }

    /// The loop a header block starts
    pub fn loop_of_header(&self, block: BlockId) -> Option<LoopId> {
        let begin = self.blocks[block.index()].begin;
        self.loop_of_begin.get(&begin).copied()
    }

    /// Block a fixed node belongs to
    pub fn block_of(&self, node: NodeId) -> Option<BlockId> {
        self.block_of_node.get(&node).copied()
    }

    pub fn dominators(&self) -> &DominatorTree {
        &self.dominators
    }

    /// Whether `block` is nested inside loop `l` (at any depth)
    pub fn is_in_loop(&self, block: BlockId, l: LoopId) -> bool {
        self.loops[l.index()].contains(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{GraphBuilder, Stamp};

    fn diamond() -> (Graph, NodeId, NodeId, NodeId) {
        let mut b = GraphBuilder::new();
        let p = b.parameter(0, Stamp::Bool);
        let (t, f) = b.if_(p);
        b.switch_to(t);
        let e1 = b.end();
        b.switch_to(f);
        let e2 = b.end();
        let m = b.merge(&[e1, e2]);
        b.return_(None);
        (b.finish(), t, f, m)
    }

    #[test]
    fn test_diamond_blocks() {
        let (graph, t, f, m) = diamond();
        let cfg = ControlFlowGraph::compute(&graph).unwrap();
        assert_eq!(cfg.blocks().len(), 4);

        let tb = cfg.block_of(t).unwrap();
        let fb = cfg.block_of(f).unwrap();
        let mb = cfg.block_of(m).unwrap();
        assert_eq!(cfg.block(mb).predecessors, vec![tb, fb]);
        assert_eq!(cfg.block(cfg.start_block()).successors, vec![tb, fb]);
        // Merge comes after both predecessors.
        assert!(mb > tb && mb > fb);
        assert_eq!(cfg.dominators().idom(mb), Some(cfg.start_block()));
        assert!(cfg.dominators().dominates(cfg.start_block(), tb));
        assert!(!cfg.dominators().dominates(tb, mb));
    }

    #[test]
    fn test_nested_loops() {
        let mut b = GraphBuilder::new();
        let c = b.parameter(0, Stamp::Bool);
        let outer = b.loop_begin();
        let (outer_body, outer_exit) = b.if_exit(c, outer, true);
        b.switch_to(outer_body);
        let inner = b.loop_begin();
        let (inner_body, inner_exit) = b.if_exit(c, inner, false);
        b.switch_to(inner_body);
        b.loop_end(inner);
        b.switch_to(inner_exit);
        b.loop_end(outer);
        b.switch_to(outer_exit);
        b.return_(None);
        let graph = b.finish();

        let cfg = ControlFlowGraph::compute(&graph).unwrap();
        assert_eq!(cfg.loops().len(), 2);
        let outer_loop = cfg.loop_info(LoopId(0));
        let inner_loop = cfg.loop_info(LoopId(1));
        assert_eq!(cfg.block(outer_loop.header).begin, outer);
        assert_eq!(cfg.block(inner_loop.header).begin, inner);
        assert_eq!(inner_loop.parent, Some(outer_loop.id));
        assert_eq!(inner_loop.depth, 1);
        assert!(outer_loop.contains(inner_loop.header));
        assert!(outer_loop.contains(cfg.block_of(inner_exit).unwrap()));
        assert!(!inner_loop.contains(cfg.block_of(inner_exit).unwrap()));
        assert_eq!(outer_loop.exits, vec![cfg.block_of(outer_exit).unwrap()]);
        assert_eq!(inner_loop.exits, vec![cfg.block_of(inner_exit).unwrap()]);

        let header = cfg.block(inner_loop.header);
        assert_eq!(header.predecessors.len(), 2);
        assert_eq!(header.predecessors[1], inner_loop.loop_ends[0]);
        assert_eq!(cfg.block(cfg.block_of(inner_body).unwrap()).loop_id, Some(inner_loop.id));
    }

    #[test]
    fn test_missing_successor_is_malformed() {
        let mut graph = Graph::new();
        let begin = graph.add(Op::Begin, &[], Stamp::Void);
        graph.set_next(graph.start(), Some(begin));
        assert!(ControlFlowGraph::compute(&graph).is_err());
    }
}
