//! Effects closure
//!
//! The generic dataflow engine behind the escape-analysis phases. It walks the
//! control flow graph with the reentrant block iterator, hands every node to an
//! [`EffectsPolicy`], reconciles predecessor states at merges through a
//! [`MergeProcessor`], iterates loops to a fixed point and finally replays the
//! recorded effects on the graph.
//!
//! Nothing here mutates the graph before [`EffectsClosure::apply_effects`];
//! nodes the analysis needs are created detached and attached by effects.

use super::alias::AliasTable;
use super::effects::GraphEffectList;
use super::loop_kill_cache::LoopKillCache;
use super::EffectsError;
use crate::graph::cfg::{BlockId, ControlFlowGraph, LoopId};
use crate::graph::schedule::ScheduleResult;
use crate::graph::{Graph, NodeId, Op, Stamp};
use crate::phases::block_iterator::{self, BlockIteratorClosure};
use fxhash::{FxHashMap, FxHashSet};
use indexmap::IndexMap;
use log::{debug, trace};

/// Fixed-point bound for a single loop
pub const MAX_LOOP_ITERATIONS: usize = 10;

/// Capabilities the engine needs from a per-block abstract state
pub trait EffectsBlockState: Sized {
    fn is_dead(&self) -> bool;

    fn mark_as_dead(&mut self);

    /// Deep copy for a diverging branch or a new loop iteration
    fn clone_state(&self) -> Self;

    /// Structural equality; the loop fixed-point test
    fn equivalent_to(&self, other: &Self) -> bool;
}

/// Named policy counters of one analysis run.
///
/// A counter holds the nodes it was recorded for, so a node seen again by a
/// later loop iteration counts once. Counters recorded during a loop iteration
/// that does not converge are rolled back with the iteration's effects.
#[derive(Debug, Clone, Default)]
pub struct EffectsCounters {
    counters: IndexMap<&'static str, FxHashSet<NodeId>>,
}

impl EffectsCounters {
    /// Counters starting at zero for every name in `names`
    pub fn new(names: &[&'static str]) -> Self {
        let mut counters = IndexMap::new();
        for &name in names {
            counters.insert(name, FxHashSet::default());
        }
        Self { counters }
    }

    pub fn record(&mut self, name: &'static str, node: NodeId) {
        self.counters.entry(name).or_default().insert(node);
    }

    pub fn get(&self, name: &str) -> usize {
        self.counters.get(name).map_or(0, |nodes| nodes.len())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, usize)> + '_ {
        self.counters.iter().map(|(&name, nodes)| (name, nodes.len()))
    }
}

/// Engine-owned data a policy may read and update while processing
pub struct EffectsContext<'a> {
    pub graph: &'a mut Graph,
    pub cfg: &'a ControlFlowGraph,
    pub aliases: &'a mut AliasTable,
    pub loop_kill_caches: &'a mut FxHashMap<LoopId, LoopKillCache>,
    pub counters: &'a mut EffectsCounters,
}

impl EffectsContext<'_> {
    pub fn get_scalar_alias(&self, node: NodeId) -> NodeId {
        self.aliases.get_scalar_alias(self.graph, node)
    }

    pub fn add_scalar_alias(&mut self, node: NodeId, alias: NodeId) {
        self.aliases.add_scalar_alias(self.graph, node, alias);
    }

    pub fn has_scalar_replaced_inputs(&self, node: NodeId) -> bool {
        self.aliases.has_scalar_replaced_inputs(node)
    }
}

/// The per-node rules plugged into the engine
pub trait EffectsPolicy {
    type State: EffectsBlockState;

    fn name(&self) -> &'static str;

    /// State at the start node
    fn initial_state(&self) -> Self::State;

    /// Process one node, recording graph changes in `effects`. `last_fixed` is
    /// the closest preceding fixed-with-next node, the anchor for insertions.
    /// Returns true if the effects remove `node`.
    fn process_node(
        &mut self,
        cx: &mut EffectsContext<'_>,
        node: NodeId,
        state: &mut Self::State,
        effects: &mut GraphEffectList,
        last_fixed: Option<NodeId>,
    ) -> bool;

    /// Removals of nodes answering false here do not count as changes
    fn is_significant_node(&self, graph: &Graph, node: NodeId) -> bool {
        !matches!(graph.op(node), Op::CommitAllocation { .. })
    }

    /// Called at a loop exit after its proxies were processed, with the state
    /// the loop was entered with.
    fn process_loop_exit(
        &mut self,
        cx: &mut EffectsContext<'_>,
        exit: NodeId,
        initial: &Self::State,
        exit_state: &mut Self::State,
        effects: &mut GraphEffectList,
    );

    /// Reconcile the live predecessor states of a merge. `states[i]` came from
    /// predecessor `processor.state_index(i)`.
    fn merge(
        &mut self,
        cx: &mut EffectsContext<'_>,
        processor: &mut MergeProcessor<Self::State>,
        states: &mut [Self::State],
    ) -> Result<Self::State, EffectsError>;

    /// Called after the per-predecessor effects of a merge were committed
    fn commit_ends(&mut self, _cx: &mut EffectsContext<'_>, _processor: &MergeProcessor<Self::State>) {}

    /// Remove facts that loop `l` invalidates from the state it is entered with
    fn strip_killed_loop_locations(
        &mut self,
        _cx: &mut EffectsContext<'_>,
        _l: LoopId,
        initial: Self::State,
    ) -> Self::State {
        initial
    }

    fn process_initial_loop_state(&mut self, _cx: &mut EffectsContext<'_>, _l: LoopId, _state: &mut Self::State) {}

    /// Called once loop `l` converged
    fn process_killed_loop_locations(
        &mut self,
        _cx: &mut EffectsContext<'_>,
        _l: LoopId,
        _initial: &Self::State,
        _merged: &Self::State,
    ) {
    }

    /// Counters reported in the phase result, even when they stay at zero
    fn counter_names(&self) -> &'static [&'static str] {
        &[]
    }
}

/// Per-merge reconciliation workspace.
///
/// One processor is created per merge block (and reused across the iterations
/// of a loop, so the phis it creates stay stable). Predecessor indexes passed to
/// its methods refer to the live states handed to [`EffectsPolicy::merge`].
pub struct MergeProcessor<S> {
    merge_block: BlockId,
    merge: NodeId,
    predecessors: Vec<BlockId>,
    predecessor_ends: Vec<NodeId>,
    /// Effects that run before the merge block's own effects
    pub merge_effects: GraphEffectList,
    /// Effects that run after `merge_effects`, such as phi initialization
    pub after_merge_effects: GraphEffectList,
    end_effects: Vec<GraphEffectList>,
    state_indexes: Vec<usize>,
    new_state: Option<S>,
    value_phis: FxHashMap<(NodeId, usize), NodeId>,
}

impl<S> MergeProcessor<S> {
    pub fn new(cfg: &ControlFlowGraph, merge_block: BlockId) -> Self {
        let block = cfg.block(merge_block);
        let predecessors = block.predecessors.clone();
        let predecessor_ends = predecessors.iter().map(|&p| cfg.block(p).end).collect();
        Self {
            merge_block,
            merge: block.begin,
            predecessors,
            predecessor_ends,
            merge_effects: GraphEffectList::new(),
            after_merge_effects: GraphEffectList::new(),
            end_effects: Vec::new(),
            state_indexes: Vec::new(),
            new_state: None,
            value_phis: FxHashMap::default(),
        }
    }

    pub fn merge_block(&self) -> BlockId {
        self.merge_block
    }

    pub fn merge_node(&self) -> NodeId {
        self.merge
    }

    /// Number of live states being merged
    pub fn state_count(&self) -> usize {
        self.state_indexes.len()
    }

    /// Original predecessor position of live state `i`
    pub fn state_index(&self, i: usize) -> usize {
        self.state_indexes[i]
    }

    pub fn predecessor(&self, i: usize) -> BlockId {
        self.predecessors[self.state_indexes[i]]
    }

    /// Last node of the predecessor of live state `i`, the anchor for
    /// materializations on that edge
    pub fn predecessor_end(&self, i: usize) -> NodeId {
        self.predecessor_ends[self.state_indexes[i]]
    }

    /// Effects that land at the end of the predecessor of live state `i`
    pub fn end_effects(&mut self, i: usize) -> &mut GraphEffectList {
        &mut self.end_effects[i]
    }

    pub fn phis(&self, graph: &Graph) -> Vec<NodeId> {
        graph.phis(self.merge)
    }

    pub fn phi_value_at(&self, graph: &Graph, phi: NodeId, i: usize) -> Option<NodeId> {
        graph.phi_value_at(phi, self.state_indexes[i])
    }

    /// A new detached phi with one empty input per predecessor
    pub fn create_value_phi(&self, graph: &mut Graph, stamp: Stamp) -> NodeId {
        let mut inputs = vec![Some(self.merge)];
        inputs.resize(self.predecessors.len() + 1, None);
        graph.add_detached(Op::ValuePhi, &inputs, stamp)
    }

    /// The phi for `(key, index)`, created on first request. Returns the phi and
    /// whether it was created by this call.
    pub fn value_phi(&mut self, graph: &mut Graph, key: NodeId, index: usize, stamp: Stamp) -> (NodeId, bool) {
        if let Some(&phi) = self.value_phis.get(&(key, index)) {
            return (phi, false);
        }
        let phi = self.create_value_phi(graph, stamp);
        self.value_phis.insert((key, index), phi);
        (phi, true)
    }

    /// Record input `i` of `phi` for commit time
    pub fn set_phi_input(&mut self, phi: NodeId, i: usize, value: NodeId) {
        let index = self.state_indexes[i];
        self.after_merge_effects.initialize_phi_input(phi, index, value);
    }

    pub fn new_state(&self) -> Option<&S> {
        self.new_state.as_ref()
    }

    fn reset(&mut self, state_indexes: Vec<usize>) {
        self.merge_effects.clear();
        self.after_merge_effects.clear();
        self.end_effects = state_indexes.iter().map(|_| GraphEffectList::new()).collect();
        self.state_indexes = state_indexes;
        self.new_state = None;
    }

    fn set_new_state(&mut self, state: S) {
        self.reset(Vec::new());
        self.new_state = Some(state);
    }

    fn take_new_state(&mut self) -> Result<S, EffectsError> {
        self.new_state
            .take()
            .ok_or_else(|| EffectsError::MalformedGraph(format!("merge at {} produced no state", self.merge)))
    }
}

macro_rules! context {
    ($closure:expr) => {
        EffectsContext {
            graph: &mut *$closure.graph,
            cfg: $closure.cfg,
            aliases: &mut $closure.aliases,
            loop_kill_caches: &mut $closure.loop_location_kill_cache,
            counters: &mut $closure.counters,
        }
    };
}

/// Where a collected effect list lives
#[derive(Debug, Clone, Copy)]
enum EffectsSource {
    Block(BlockId),
    LoopMerge(LoopId),
}

/// Walks the graph once more to find the order effect lists are replayed in
struct EffectsCollector<'a> {
    block_effects: &'a [GraphEffectList],
    loop_merge_effects: &'a FxHashMap<LoopId, GraphEffectList>,
    order: Vec<EffectsSource>,
}

impl BlockIteratorClosure for EffectsCollector<'_> {
    type State = ();

    fn process_block(&mut self, _cfg: &ControlFlowGraph, block: BlockId, _state: ()) -> Result<(), EffectsError> {
        if !self.block_effects[block.index()].is_empty() {
            self.order.push(EffectsSource::Block(block));
        }
        Ok(())
    }

    fn merge(&mut self, _cfg: &ControlFlowGraph, _merge: BlockId, _states: Vec<()>) -> Result<(), EffectsError> {
        Ok(())
    }

    fn clone_state(&self, _state: &()) {}

    fn process_loop(&mut self, cfg: &ControlFlowGraph, l: LoopId, initial: ()) -> Result<Vec<()>, EffectsError> {
        let info = block_iterator::process_loop(self, cfg, l, initial)?;
        if self.loop_merge_effects.get(&l).map_or(false, |e| !e.is_empty()) {
            self.order.push(EffectsSource::LoopMerge(l));
        }
        Ok(info.exit_states)
    }
}

/// The engine: one analysis run of a policy over a graph
pub struct EffectsClosure<'g, P: EffectsPolicy> {
    graph: &'g mut Graph,
    cfg: &'g ControlFlowGraph,
    schedule: Option<&'g ScheduleResult>,
    policy: P,
    aliases: AliasTable,
    block_effects: Vec<GraphEffectList>,
    loop_merge_effects: FxHashMap<LoopId, GraphEffectList>,
    loop_location_kill_cache: FxHashMap<LoopId, LoopKillCache>,
    loop_entry_states: FxHashMap<NodeId, P::State>,
    counters: EffectsCounters,
    changed: bool,
    max_loop_iterations: usize,
}

impl<'g, P: EffectsPolicy> EffectsClosure<'g, P> {
    pub fn new(
        graph: &'g mut Graph,
        cfg: &'g ControlFlowGraph,
        schedule: Option<&'g ScheduleResult>,
        policy: P,
    ) -> Self {
        let block_effects = cfg.blocks().iter().map(|_| GraphEffectList::new()).collect();
        let counters = EffectsCounters::new(policy.counter_names());
        Self {
            graph,
            cfg,
            schedule,
            policy,
            aliases: AliasTable::new(),
            block_effects,
            loop_merge_effects: FxHashMap::default(),
            loop_location_kill_cache: FxHashMap::default(),
            loop_entry_states: FxHashMap::default(),
            counters,
            changed: false,
            max_loop_iterations: MAX_LOOP_ITERATIONS,
        }
    }

    pub fn with_max_loop_iterations(mut self, max_loop_iterations: usize) -> Self {
        self.max_loop_iterations = max_loop_iterations;
        self
    }

    pub fn graph(&self) -> &Graph {
        self.graph
    }

    pub fn cfg(&self) -> &ControlFlowGraph {
        self.cfg
    }

    pub fn policy(&self) -> &P {
        &self.policy
    }

    pub fn policy_mut(&mut self) -> &mut P {
        &mut self.policy
    }

    pub fn into_policy(self) -> P {
        self.policy
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    pub fn aliases_mut(&mut self) -> &mut AliasTable {
        &mut self.aliases
    }

    pub fn block_effects(&self, block: BlockId) -> &GraphEffectList {
        &self.block_effects[block.index()]
    }

    pub fn block_effects_mut(&mut self, block: BlockId) -> &mut GraphEffectList {
        &mut self.block_effects[block.index()]
    }

    /// After-merge effects of a converged loop, replayed after its body
    pub fn loop_merge_effects(&self, l: LoopId) -> Option<&GraphEffectList> {
        self.loop_merge_effects.get(&l)
    }

    pub fn loop_kill_cache(&self, l: LoopId) -> Option<&LoopKillCache> {
        self.loop_location_kill_cache.get(&l)
    }

    /// State the converged iteration of the loop at `loop_begin` was entered with
    pub fn loop_entry_state(&self, loop_begin: NodeId) -> Option<&P::State> {
        self.loop_entry_states.get(&loop_begin)
    }

    pub fn counters(&self) -> &EffectsCounters {
        &self.counters
    }

    /// Whether the walk found a significant node to remove
    pub fn has_changed(&self) -> bool {
        self.changed
    }

    /// Effects are worth replaying if a significant node goes away or a dead
    /// branch gets cut
    pub fn needs_apply_effects(&self) -> bool {
        self.changed
            || self.block_effects.iter().any(|e| e.has_cfg_kills())
            || self.loop_merge_effects.values().any(|e| e.has_cfg_kills())
    }

    /// Whether any block or loop recorded an effect
    pub fn has_effects(&self) -> bool {
        self.block_effects.iter().any(|e| !e.is_empty())
            || self.loop_merge_effects.values().any(|e| !e.is_empty())
    }

    pub fn get_scalar_alias(&self, node: NodeId) -> NodeId {
        self.aliases.get_scalar_alias(self.graph, node)
    }

    pub fn add_scalar_alias(&mut self, node: NodeId, alias: NodeId) {
        self.aliases.add_scalar_alias(self.graph, node, alias);
    }

    pub fn has_scalar_replaced_inputs(&self, node: NodeId) -> bool {
        self.aliases.has_scalar_replaced_inputs(node)
    }

    /// Run the analysis over the whole graph
    pub fn process(&mut self) -> Result<(), EffectsError> {
        let cfg = self.cfg;
        let initial = self.policy.initial_state();
        block_iterator::apply(self, cfg, cfg.start_block(), initial, None)?;
        Ok(())
    }

    /// Merge `states` (in predecessor order) at a merge block
    pub fn merge_states(&mut self, merge: BlockId, states: Vec<P::State>) -> Result<P::State, EffectsError> {
        if !self.block_effects[merge.index()].is_empty() {
            return Err(EffectsError::MergeEffectsNotEmpty {
                block: self.cfg.block(merge).begin,
            });
        }
        let mut processor = MergeProcessor::new(self.cfg, merge);
        self.do_merge_without_dead(&mut processor, states)?;
        self.commit_ends(&mut processor);
        let effects = &mut self.block_effects[merge.index()];
        effects.add_all(&mut processor.merge_effects);
        effects.add_all(&mut processor.after_merge_effects);
        let state = processor.take_new_state()?;
        debug!(
            "merge at {}: {} effects, dead: {}",
            processor.merge,
            self.block_effects[merge.index()].len(),
            state.is_dead()
        );
        Ok(state)
    }

    fn do_merge_without_dead(
        &mut self,
        processor: &mut MergeProcessor<P::State>,
        mut states: Vec<P::State>,
    ) -> Result<(), EffectsError> {
        let alive = states.iter().filter(|s| !s.is_dead()).count();
        if alive == 0 {
            if states.is_empty() {
                return Err(EffectsError::MalformedGraph(format!(
                    "merge at {} has no predecessor states",
                    processor.merge
                )));
            }
            processor.set_new_state(states.swap_remove(0));
            return Ok(());
        }
        let (state_indexes, mut alive_states): (Vec<usize>, Vec<P::State>) = if alive == states.len() {
            ((0..states.len()).collect(), states)
        } else {
            states
                .into_iter()
                .enumerate()
                .filter(|(_, s)| !s.is_dead())
                .unzip()
        };
        processor.reset(state_indexes);
        let mut cx = context!(self);
        let new_state = self.policy.merge(&mut cx, processor, &mut alive_states)?;
        processor.new_state = Some(new_state);
        Ok(())
    }

    /// Move the per-predecessor effects of a merge into the predecessor blocks
    fn commit_ends(&mut self, processor: &mut MergeProcessor<P::State>) {
        for i in 0..processor.end_effects.len() {
            let predecessor = processor.predecessor(i);
            self.block_effects[predecessor.index()].add_all(&mut processor.end_effects[i]);
        }
        let mut cx = context!(self);
        self.policy.commit_ends(&mut cx, processor);
    }

    fn process_loop_fixed_point(&mut self, l: LoopId, initial: P::State) -> Result<Vec<P::State>, EffectsError> {
        let cfg = self.cfg;
        let info = cfg.loop_info(l);
        if initial.is_dead() {
            return Ok(info.exits.iter().map(|_| initial.clone_state()).collect());
        }
        let header = cfg.block(info.header);
        let loop_begin = header.begin;

        // Inner loops are entered with the facts the loop kills removed, so their
        // result does not depend on information a later outer iteration may change.
        let stripped = {
            let mut cx = context!(self);
            self.policy
                .strip_killed_loop_locations(&mut cx, l, initial.clone_state())
        };
        let mut last_merged = stripped.clone_state();
        {
            let mut cx = context!(self);
            self.policy
                .process_initial_loop_state(&mut cx, l, &mut last_merged);
        }
        let mut processor = MergeProcessor::new(cfg, info.header);

        for iteration in 0..self.max_loop_iterations {
            debug!(
                "process loop {} (header {}, begin {}), iteration {}",
                l, info.header, loop_begin, iteration
            );
            let saved_counters = self.counters.clone();
            let saved_changed = self.changed;
            let loop_info = block_iterator::process_loop(self, cfg, l, last_merged.clone_state())?;

            let mut states = Vec::with_capacity(1 + loop_info.end_states.len());
            states.push(stripped.clone_state());
            states.extend(loop_info.end_states);
            self.do_merge_without_dead(&mut processor, states)?;

            let converged = match processor.new_state() {
                Some(new_state) => new_state.equivalent_to(&last_merged),
                None => false,
            };
            if converged {
                self.commit_ends(&mut processor);
                self.block_effects[info.header.index()].insert_all(&mut processor.merge_effects, 0);
                let after_merge = std::mem::take(&mut processor.after_merge_effects);
                self.loop_merge_effects.insert(l, after_merge);

                if loop_info.exit_states.len() != info.exits.len() {
                    let exit = info
                        .exits
                        .get(loop_info.exit_states.len())
                        .map(|&b| cfg.block(b).begin)
                        .unwrap_or(loop_begin);
                    return Err(EffectsError::MissingExitState {
                        header: loop_begin,
                        exit,
                    });
                }
                self.loop_entry_states.insert(loop_begin, stripped.clone_state());

                let merged = processor.take_new_state()?;
                let mut cx = context!(self);
                self.policy
                    .process_killed_loop_locations(&mut cx, l, &stripped, &merged);
                debug!("loop {} converged after {} iterations", l, iteration + 1);
                return Ok(loop_info.exit_states);
            }

            last_merged = processor.take_new_state()?;
            for &block in &info.blocks {
                self.block_effects[block.index()].clear();
            }
            self.counters = saved_counters;
            self.changed = saved_changed;
        }
        Err(EffectsError::TooManyIterations {
            loop_begin,
            header: info.header,
            iterations: self.max_loop_iterations,
        })
    }

    fn process_block_impl(&mut self, block: BlockId, mut state: P::State) -> Result<P::State, EffectsError> {
        if state.is_dead() {
            return Ok(state);
        }
        let cfg = self.cfg;
        let b = cfg.block(block);
        let mut effects = std::mem::take(&mut self.block_effects[block.index()]);

        let begin_pred = self.graph.predecessor(b.begin);
        if let Some(pred) = begin_pred {
            if let Op::If { true_successor, .. } = *self.graph.op(pred) {
                let condition = self.graph.input(pred, 0);
                if let Some(condition) = condition {
                    let alias = self.aliases.get_scalar_alias(self.graph, condition);
                    if let Op::LogicConstant(value) = *self.graph.op(alias) {
                        let dead_branch = value != (b.begin == true_successor);
                        if dead_branch {
                            trace!("{} is dead: {} folds to {}", block, pred, value);
                            state.mark_as_dead();
                            let survivor = self.successor_for(pred, value);
                            effects.kill_if_branch(pred, survivor);
                            self.block_effects[block.index()] = effects;
                            return Ok(state);
                        }
                    }
                }
            }
        }

        trace!("block {}: preds {:?}, succs {:?}", block, b.predecessors, b.successors);
        let mut last_fixed = begin_pred.filter(|&p| self.graph.op(p).is_fixed_with_next());
        let nodes: &[NodeId] = match self.schedule {
            Some(schedule) => schedule.nodes_for(block),
            None => &b.nodes,
        };
        for &node in nodes {
            self.aliases.clear(node);
            if matches!(self.graph.op(node), Op::LoopExit) {
                let loop_begin = self.graph.input(node, 0).ok_or_else(|| {
                    EffectsError::MalformedGraph(format!("loop exit {} has no loop begin", node))
                })?;
                for proxy in self.graph.proxies(node) {
                    self.aliases.clear(proxy);
                    let mut cx = context!(self);
                    let removed = self
                        .policy
                        .process_node(&mut cx, proxy, &mut state, &mut effects, last_fixed);
                    self.changed |= removed && self.policy.is_significant_node(self.graph, proxy);
                }
                let initial = self
                    .loop_entry_states
                    .get(&loop_begin)
                    .ok_or(EffectsError::MissingLoopEntryState {
                        loop_exit: node,
                        loop_begin,
                    })?;
                let mut cx = context!(self);
                self.policy
                    .process_loop_exit(&mut cx, node, initial, &mut state, &mut effects);
            }
            let mut cx = context!(self);
            let removed = self
                .policy
                .process_node(&mut cx, node, &mut state, &mut effects, last_fixed);
            self.changed |= removed && self.policy.is_significant_node(self.graph, node);
            if self.graph.op(node).is_fixed_with_next() {
                last_fixed = Some(node);
            }
            if state.is_dead() {
                break;
            }
        }
        self.block_effects[block.index()] = effects;
        Ok(state)
    }

    fn successor_for(&self, split: NodeId, value: bool) -> NodeId {
        match *self.graph.op(split) {
            Op::If {
                true_successor,
                false_successor,
            } => {
                if value {
                    true_successor
                } else {
                    false_successor
                }
            }
            _ => split,
        }
    }

    /// Replay every recorded effect on the graph and delete what became
    /// obsolete. Returns the number of deleted nodes.
    pub fn apply_effects(&mut self) -> Result<usize, EffectsError> {
        let cfg = self.cfg;
        let mut collector = EffectsCollector {
            block_effects: &self.block_effects,
            loop_merge_effects: &self.loop_merge_effects,
            order: Vec::new(),
        };
        block_iterator::apply(&mut collector, cfg, cfg.start_block(), (), None)?;
        let order = collector.order;

        let mut obsolete: Vec<NodeId> = Vec::new();
        for cfg_kills in [false, true] {
            debug!("==== applying {} effects", if cfg_kills { "cfg kill" } else { "general" });
            for source in &order {
                let effects = match source {
                    EffectsSource::Block(block) => &self.block_effects[block.index()],
                    EffectsSource::LoopMerge(l) => match self.loop_merge_effects.get(l) {
                        Some(effects) => effects,
                        None => continue,
                    },
                };
                effects.apply(self.graph, &mut obsolete, cfg_kills);
            }
        }

        assert_non_reachable(self.graph, &obsolete)?;
        let mut removed = 0;
        for node in obsolete {
            if self.graph.is_alive(node) {
                self.graph.replace_at_usages(node, None);
                self.graph.kill_with_unused_floating_inputs(node);
                removed += 1;
            }
        }
        Ok(removed)
    }
}

/// Obsolete fixed nodes must be unreachable through control flow, and no
/// obsolete node may still be an input of something reachable.
fn assert_non_reachable(graph: &Graph, obsolete: &[NodeId]) -> Result<(), EffectsError> {
    let control = graph.control_reachable();
    for &node in obsolete {
        if graph.is_alive(node) && graph.op(node).is_fixed() && control.contains(&node) {
            return Err(EffectsError::ObsoleteNodeReachable { node });
        }
    }
    let reachable = graph.reachable();
    let obsolete: FxHashSet<NodeId> = obsolete.iter().copied().collect();
    for &node in &obsolete {
        if graph.is_alive(node) && reachable.contains(&node) {
            return Err(EffectsError::ObsoleteNodeReachable { node });
        }
    }
    Ok(())
}

impl<P: EffectsPolicy> BlockIteratorClosure for EffectsClosure<'_, P> {
    type State = P::State;

    fn process_block(
        &mut self,
        _cfg: &ControlFlowGraph,
        block: BlockId,
        state: P::State,
    ) -> Result<P::State, EffectsError> {
        self.process_block_impl(block, state)
    }

    fn merge(&mut self, _cfg: &ControlFlowGraph, merge: BlockId, states: Vec<P::State>) -> Result<P::State, EffectsError> {
        self.merge_states(merge, states)
    }

    fn clone_state(&self, state: &P::State) -> P::State {
        state.clone_state()
    }

    fn process_loop(&mut self, _cfg: &ControlFlowGraph, l: LoopId, initial: P::State) -> Result<Vec<P::State>, EffectsError> {
        self.process_loop_fixed_point(l, initial)
    }
}
