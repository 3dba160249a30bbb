//! Reentrant block iterator
//!
//! Walks the blocks of a [`ControlFlowGraph`] so that every block is visited
//! after all of its forward predecessors, threading a per-block state through
//! the walk. Loops are handed to the closure as a unit; the closure usually
//! calls [`process_loop`] (possibly several times) to walk the loop body.

use crate::graph::cfg::{BlockId, ControlFlowGraph, LoopId};
use crate::graph::NodeId;
use crate::phases::ea::EffectsError;
use fxhash::FxHashMap;
use std::collections::VecDeque;

/// Callbacks driven by [`apply`]
pub trait BlockIteratorClosure {
    type State;

    fn process_block(&mut self, cfg: &ControlFlowGraph, block: BlockId, state: Self::State)
        -> Result<Self::State, EffectsError>;

    /// Join the states of all forward predecessors of a merge block, given in
    /// predecessor order.
    fn merge(&mut self, cfg: &ControlFlowGraph, merge: BlockId, states: Vec<Self::State>)
        -> Result<Self::State, EffectsError>;

    fn clone_state(&self, state: &Self::State) -> Self::State;

    /// Process a whole loop entered with `initial`, returning one state per loop
    /// exit in `Loop::exits` order.
    fn process_loop(&mut self, cfg: &ControlFlowGraph, l: LoopId, initial: Self::State)
        -> Result<Vec<Self::State>, EffectsError>;
}

/// End and exit states of one walk over a loop body
pub struct LoopInfo<S> {
    /// States at the back edges, in loop-begin input order
    pub end_states: Vec<S>,
    /// States at the loop exits, in `Loop::exits` order
    pub exit_states: Vec<S>,
}

/// Walk the graph from `start`.
///
/// Blocks for which `stop_at` answers true are not processed; the state that
/// reached them is returned keyed by their begin node. States at back edges are
/// returned keyed by the `LoopEnd` node.
pub fn apply<C: BlockIteratorClosure>(
    closure: &mut C,
    cfg: &ControlFlowGraph,
    start: BlockId,
    initial: C::State,
    stop_at: Option<&dyn Fn(BlockId) -> bool>,
) -> Result<FxHashMap<NodeId, C::State>, EffectsError> {
    let mut queue: VecDeque<BlockId> = VecDeque::new();
    let mut states: FxHashMap<NodeId, C::State> = FxHashMap::default();
    let mut state = initial;
    let mut current = start;

    loop {
        let mut next: Option<(BlockId, C::State)> = None;
        if stop_at.map_or(false, |stop| stop(current)) {
            states.insert(cfg.block(current).begin, state);
        } else {
            let state = closure.process_block(cfg, current, state)?;
            let block = cfg.block(current);
            match block.successors.len() {
                0 => {}
                1 => {
                    let successor = block.successors[0];
                    let succ_block = cfg.block(successor);
                    if succ_block.is_loop_header {
                        if block.is_loop_end {
                            // Back edges only lead to headers that are already being processed.
                            states.insert(block.end, state);
                        } else {
                            recurse_into_loop(closure, cfg, &mut queue, &mut states, state, successor)?;
                        }
                    } else if succ_block.is_merge {
                        if all_ends_visited(cfg, &states, current, successor) {
                            let merged = merge_states(cfg, &mut states, state, current, successor)?;
                            next = Some((successor, closure.merge(cfg, successor, merged)?));
                        } else {
                            states.insert(block.end, state);
                        }
                    } else {
                        next = Some((successor, state));
                    }
                }
                _ => {
                    for &successor in block.successors.iter().skip(1) {
                        queue.push_front(successor);
                        states.insert(cfg.block(successor).begin, closure.clone_state(&state));
                    }
                    next = Some((block.successors[0], state));
                }
            }
        }

        match next {
            Some((block, next_state)) => {
                current = block;
                state = next_state;
            }
            None => match queue.pop_front() {
                None => return Ok(states),
                Some(queued) => {
                    current = queued;
                    let begin = cfg.block(current).begin;
                    state = states.remove(&begin).ok_or_else(|| {
                        EffectsError::MalformedGraph(format!("no state recorded for queued block {}", current))
                    })?;
                }
            },
        }
    }
}

fn recurse_into_loop<C: BlockIteratorClosure>(
    closure: &mut C,
    cfg: &ControlFlowGraph,
    queue: &mut VecDeque<BlockId>,
    states: &mut FxHashMap<NodeId, C::State>,
    state: C::State,
    header: BlockId,
) -> Result<(), EffectsError> {
    let l = cfg.loop_of_header(header).ok_or_else(|| {
        EffectsError::MalformedGraph(format!("{} is not a loop header", header))
    })?;
    let exit_states = closure.process_loop(cfg, l, state)?;
    let exits = &cfg.loop_info(l).exits;
    if exits.len() != exit_states.len() {
        return Err(EffectsError::MalformedGraph(format!(
            "loop {} has {} exits but {} exit states",
            l,
            exits.len(),
            exit_states.len()
        )));
    }
    for (&exit, exit_state) in exits.iter().zip(exit_states) {
        states.insert(cfg.block(exit).begin, exit_state);
        queue.push_front(exit);
    }
    Ok(())
}

fn all_ends_visited<S>(cfg: &ControlFlowGraph, states: &FxHashMap<NodeId, S>, current: BlockId, merge: BlockId) -> bool {
    cfg.block(merge)
        .predecessors
        .iter()
        .all(|&pred| pred == current || states.contains_key(&cfg.block(pred).end))
}

fn merge_states<S>(
    cfg: &ControlFlowGraph,
    states: &mut FxHashMap<NodeId, S>,
    state: S,
    current: BlockId,
    merge: BlockId,
) -> Result<Vec<S>, EffectsError> {
    let predecessors = &cfg.block(merge).predecessors;
    let mut merged = Vec::with_capacity(predecessors.len());
    let mut current_state = Some(state);
    for &pred in predecessors {
        let end_state = if pred == current {
            current_state.take()
        } else {
            states.remove(&cfg.block(pred).end)
        };
        match end_state {
            Some(s) => merged.push(s),
            None => {
                return Err(EffectsError::MalformedGraph(format!(
                    "missing end state of {} at merge {}",
                    pred, merge
                )))
            }
        }
    }
    Ok(merged)
}

/// Walk the body of loop `l` once, starting at its header with `initial`.
pub fn process_loop<C: BlockIteratorClosure>(
    closure: &mut C,
    cfg: &ControlFlowGraph,
    l: LoopId,
    initial: C::State,
) -> Result<LoopInfo<C::State>, EffectsError> {
    let info = cfg.loop_info(l);
    let stop_at = |block: BlockId| !cfg.is_in_loop(block, l);
    let mut block_end_states = apply(closure, cfg, info.header, initial, Some(&stop_at))?;

    let header = cfg.block(info.header);
    let mut end_states = Vec::with_capacity(header.predecessors.len().saturating_sub(1));
    for &pred in header.predecessors.iter().skip(1) {
        let end = cfg.block(pred).end;
        let state = block_end_states.remove(&end).ok_or(EffectsError::MissingExitState {
            header: header.begin,
            exit: end,
        })?;
        end_states.push(state);
    }
    let mut exit_states = Vec::with_capacity(info.exits.len());
    for &exit in &info.exits {
        let begin = cfg.block(exit).begin;
        let state = block_end_states.remove(&begin).ok_or(EffectsError::MissingExitState {
            header: header.begin,
            exit: begin,
        })?;
        exit_states.push(state);
    }
    Ok(LoopInfo {
        end_states,
        exit_states,
    })
}
