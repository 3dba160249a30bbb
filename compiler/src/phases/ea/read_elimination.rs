//! Read elimination
//!
//! Caches the last known value of `(object, field, location)` triples along
//! control flow. A load that hits the cache is replaced by the cached value; a
//! store writing the value already cached is dropped. Stores kill every entry
//! of an overlapping location, calls and monitor operations kill everything.
//!
//! Loops remember which locations they overwrite in a [`LoopKillCache`] so that
//! later visits of the same loop start without those facts and converge in one
//! iteration.

use super::closure::{EffectsBlockState, EffectsContext, EffectsPolicy, MergeProcessor};
use super::effects::GraphEffectList;
use super::loop_kill_cache::LoopKillCache;
use super::phase::EffectsPhase;
use super::EffectsError;
use crate::config::EscapeConfig;
use crate::graph::cfg::LoopId;
use crate::graph::{Graph, LocationIdentity, MemoryKill, NodeId, Op, Stamp};
use fxhash::FxHashMap;
use indexmap::{IndexMap, IndexSet};
use log::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub object: NodeId,
    pub field: usize,
    pub location: LocationIdentity,
}

impl CacheKey {
    fn with_object(self, object: NodeId) -> Self {
        Self { object, ..self }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReadEliminationBlockState {
    dead: bool,
    cache: IndexMap<CacheKey, NodeId>,
}

impl ReadEliminationBlockState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_entry(&self, key: &CacheKey) -> Option<NodeId> {
        self.cache.get(key).copied()
    }

    pub fn add_cache_entry(&mut self, key: CacheKey, value: NodeId) {
        self.cache.insert(key, value);
    }

    pub fn cache_len(&self) -> usize {
        self.cache.len()
    }

    pub fn keys(&self) -> impl Iterator<Item = &CacheKey> {
        self.cache.keys()
    }

    /// Drop every entry a write to `location` may overwrite
    pub fn kill_location(&mut self, location: LocationIdentity) {
        self.cache.retain(|key, _| !key.location.overlaps(location));
    }

    pub fn kill_all(&mut self) {
        self.cache.clear();
    }
}

impl EffectsBlockState for ReadEliminationBlockState {
    fn is_dead(&self) -> bool {
        self.dead
    }

    fn mark_as_dead(&mut self) {
        self.dead = true;
    }

    fn clone_state(&self) -> Self {
        self.clone()
    }

    fn equivalent_to(&self, other: &Self) -> bool {
        self.dead == other.dead && self.cache == other.cache
    }
}

#[derive(Debug)]
pub struct ReadEliminationPolicy {
    max_loop_visits: usize,
    /// `(field, location)` pairs, numbered for phi keys
    slots: IndexSet<(usize, LocationIdentity)>,
    exit_proxies: FxHashMap<(NodeId, NodeId), NodeId>,
}

impl ReadEliminationPolicy {
    pub fn new(max_loop_visits: usize) -> Self {
        Self {
            max_loop_visits,
            slots: IndexSet::new(),
            exit_proxies: FxHashMap::default(),
        }
    }

    fn slot(&mut self, key: &CacheKey) -> usize {
        self.slots.insert_full((key.field, key.location)).0
    }

    fn exit_proxy(&mut self, graph: &mut Graph, exit: NodeId, value: NodeId) -> NodeId {
        *self.exit_proxies.entry((exit, value)).or_insert_with(|| {
            let stamp = graph.stamp(value);
            graph.add_detached(Op::ValueProxy, &[Some(value), Some(exit)], stamp)
        })
    }

    /// Cached values of `key` on the object flowing into `phi` from every
    /// predecessor become one phi cached for `phi` itself.
    fn merge_read_cache_phi(
        &mut self,
        cx: &mut EffectsContext<'_>,
        processor: &mut MergeProcessor<ReadEliminationBlockState>,
        states: &[ReadEliminationBlockState],
        phi: NodeId,
        key: CacheKey,
        new_state: &mut ReadEliminationBlockState,
    ) {
        let mut values = Vec::with_capacity(states.len());
        for (i, state) in states.iter().enumerate() {
            let Some(object) = processor.phi_value_at(cx.graph, phi, i) else { return };
            match state.cache_entry(&key.with_object(object)) {
                Some(value) if values.first().map_or(true, |&first| cx.graph.stamp(first) == cx.graph.stamp(value)) => {
                    values.push(value)
                }
                _ => return,
            }
        }
        let phi_key = key.with_object(phi);
        let slot = self.slot(&phi_key);
        let stamp = cx.graph.stamp(values[0]);
        let (value_phi, _) = processor.value_phi(cx.graph, phi, slot, stamp);
        processor.merge_effects.add_floating_node(value_phi);
        for (i, value) in values.into_iter().enumerate() {
            processor.set_phi_input(value_phi, i, value);
        }
        new_state.add_cache_entry(phi_key, value_phi);
    }
}

impl EffectsPolicy for ReadEliminationPolicy {
    type State = ReadEliminationBlockState;

    fn name(&self) -> &'static str {
        "ReadElimination"
    }

    fn initial_state(&self) -> ReadEliminationBlockState {
        ReadEliminationBlockState::new()
    }

    fn process_node(
        &mut self,
        cx: &mut EffectsContext<'_>,
        node: NodeId,
        state: &mut ReadEliminationBlockState,
        effects: &mut GraphEffectList,
        _last_fixed: Option<NodeId>,
    ) -> bool {
        match *cx.graph.op(node) {
            Op::LoadField { field, location } => {
                let Some(object) = cx.graph.input(node, 0) else { return false };
                let key = CacheKey {
                    object: cx.get_scalar_alias(object),
                    field,
                    location,
                };
                match state.cache_entry(&key) {
                    Some(value) if value != node && cx.graph.stamp(value) == cx.graph.stamp(node) => {
                        trace!("{} reads cached {}", node, value);
                        effects.replace_at_usages(node, value);
                        cx.add_scalar_alias(node, value);
                        cx.counters.record("eliminated_loads", node);
                        true
                    }
                    _ => {
                        state.add_cache_entry(key, node);
                        false
                    }
                }
            }
            Op::StoreField { field, location } => {
                let (Some(object), Some(value)) = (cx.graph.input(node, 0), cx.graph.input(node, 1)) else {
                    state.kill_location(location);
                    return false;
                };
                let key = CacheKey {
                    object: cx.get_scalar_alias(object),
                    field,
                    location,
                };
                let value = cx.get_scalar_alias(value);
                if state.cache_entry(&key) == Some(value) {
                    trace!("{} stores the cached {}", node, value);
                    effects.delete_node(node);
                    cx.counters.record("eliminated_stores", node);
                    true
                } else {
                    state.kill_location(location);
                    state.add_cache_entry(key, value);
                    false
                }
            }
            ref op => {
                match op.memory_kill() {
                    Some(MemoryKill::Single(location)) => state.kill_location(location),
                    Some(MemoryKill::Any) => state.kill_all(),
                    None => {}
                }
                false
            }
        }
    }

    fn process_loop_exit(
        &mut self,
        cx: &mut EffectsContext<'_>,
        exit: NodeId,
        initial: &ReadEliminationBlockState,
        exit_state: &mut ReadEliminationBlockState,
        effects: &mut GraphEffectList,
    ) {
        let changed: Vec<(CacheKey, NodeId)> = exit_state
            .cache
            .iter()
            .filter(|(key, value)| initial.cache_entry(key) != Some(**value))
            .map(|(key, value)| (*key, *value))
            .collect();
        for (key, value) in changed {
            let proxy = self.exit_proxy(cx.graph, exit, value);
            effects.add_floating_node(proxy);
            exit_state.add_cache_entry(key, proxy);
        }
    }

    fn merge(
        &mut self,
        cx: &mut EffectsContext<'_>,
        processor: &mut MergeProcessor<ReadEliminationBlockState>,
        states: &mut [ReadEliminationBlockState],
    ) -> Result<ReadEliminationBlockState, EffectsError> {
        let mut new_state = ReadEliminationBlockState::new();
        let keys: Vec<(CacheKey, NodeId)> = states[0].cache.iter().map(|(k, v)| (*k, *v)).collect();
        for (key, first) in &keys {
            let mut phi_needed = false;
            let mut present = true;
            for state in states[1..].iter() {
                match state.cache_entry(key) {
                    Some(value) if cx.graph.stamp(value) == cx.graph.stamp(*first) => phi_needed |= value != *first,
                    _ => {
                        present = false;
                        break;
                    }
                }
            }
            if !present {
                continue;
            }
            if !phi_needed {
                new_state.add_cache_entry(*key, *first);
                continue;
            }
            let slot = self.slot(key);
            let stamp = cx.graph.stamp(*first);
            let (phi, _) = processor.value_phi(cx.graph, key.object, slot, stamp);
            processor.merge_effects.add_floating_node(phi);
            for (i, state) in states.iter().enumerate() {
                if let Some(value) = state.cache_entry(key) {
                    processor.set_phi_input(phi, i, value);
                }
            }
            new_state.add_cache_entry(*key, phi);
        }

        for phi in processor.phis(cx.graph) {
            if cx.graph.stamp(phi) != Stamp::Object {
                continue;
            }
            let Some(first_object) = processor.phi_value_at(cx.graph, phi, 0) else { continue };
            for (key, _) in keys.iter().filter(|(k, _)| k.object == first_object) {
                self.merge_read_cache_phi(cx, processor, states, phi, *key, &mut new_state);
            }
        }
        Ok(new_state)
    }

    fn strip_killed_loop_locations(
        &mut self,
        cx: &mut EffectsContext<'_>,
        l: LoopId,
        mut initial: ReadEliminationBlockState,
    ) -> ReadEliminationBlockState {
        if let Some(cache) = cx.loop_kill_caches.get(&l) {
            if cache.loop_kills_locations() {
                let before = initial.cache_len();
                initial.cache.retain(|key, _| !cache.contains_location(key.location));
                trace!("loop {}: stripped {} killed entries", l, before - initial.cache_len());
            }
        }
        initial
    }

    fn process_killed_loop_locations(
        &mut self,
        cx: &mut EffectsContext<'_>,
        l: LoopId,
        initial: &ReadEliminationBlockState,
        merged: &ReadEliminationBlockState,
    ) {
        if initial.cache_len() == 0 {
            return;
        }
        let Some(cache) = cx.loop_kill_caches.get_mut(&l) else {
            // Fully processed once; the next visit reuses what is learned then.
            cx.loop_kill_caches.insert(l, LoopKillCache::new(1));
            return;
        };
        if cache.visits() > self.max_loop_visits {
            debug!("loop {} visited {} times, killing all locations", l, cache.visits());
            cache.set_kills_all();
        } else {
            let mut live: IndexSet<LocationIdentity> = initial.keys().map(|k| k.location).collect();
            for key in merged.keys() {
                live.shift_remove(&key.location);
            }
            for location in live {
                cache.remember_loop_killed_location(location);
            }
        }
        cache.visited();
    }

    fn counter_names(&self) -> &'static [&'static str] {
        &["eliminated_loads", "eliminated_stores"]
    }
}

impl EffectsPhase<ReadEliminationPolicy> {
    pub fn read_elimination(config: &EscapeConfig) -> Self {
        let max_loop_visits = config.read_elimination_max_loop_visits;
        EffectsPhase::new("ReadElimination", config, move || ReadEliminationPolicy::new(max_loop_visits))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::GraphBuilder;
    use crate::phases::GraphPhase;

    fn loc(id: u32) -> LocationIdentity {
        LocationIdentity::new(id)
    }

    fn run(graph: &mut Graph) -> crate::phases::PhaseResult {
        let mut phase = EffectsPhase::read_elimination(&EscapeConfig::default());
        phase.run(graph).expect("read elimination failed")
    }

    #[test]
    fn test_kill_location_respects_any() {
        let mut state = ReadEliminationBlockState::new();
        let key = |object: u32, location| CacheKey {
            object: NodeId::new(object),
            field: 0,
            location,
        };
        state.add_cache_entry(key(1, loc(1)), NodeId::new(10));
        state.add_cache_entry(key(2, loc(2)), NodeId::new(11));
        state.kill_location(loc(1));
        assert_eq!(state.cache_len(), 1);
        state.kill_location(LocationIdentity::ANY);
        assert_eq!(state.cache_len(), 0);
    }

    #[test]
    fn test_second_load_is_eliminated() {
        let mut b = GraphBuilder::new();
        let obj = b.parameter(0, Stamp::Object);
        let first = b.load_field(obj, 0, loc(1), Stamp::Int);
        let second = b.load_field(obj, 0, loc(1), Stamp::Int);
        let sum = b.add(first, second);
        b.return_(Some(sum));
        let mut graph = b.finish();

        let result = run(&mut graph);
        assert!(result.modified);
        assert!(graph.is_deleted(second));
        assert_eq!(graph.inputs(sum), &[Some(first), Some(first)]);
        assert_eq!(result.stats["eliminated_loads"], 1);
    }

    #[test]
    fn test_store_forwards_to_load() {
        let mut b = GraphBuilder::new();
        let obj = b.parameter(0, Stamp::Object);
        let value = b.parameter(1, Stamp::Int);
        b.store_field(obj, 0, loc(1), value);
        let load = b.load_field(obj, 0, loc(1), Stamp::Int);
        let ret = b.return_(Some(load));
        let mut graph = b.finish();

        run(&mut graph);
        assert!(graph.is_deleted(load));
        assert_eq!(graph.input(ret, 0), Some(value));
    }

    #[test]
    fn test_call_kills_cache() {
        let mut b = GraphBuilder::new();
        let obj = b.parameter(0, Stamp::Object);
        let first = b.load_field(obj, 0, loc(1), Stamp::Int);
        b.invoke(&[], Stamp::Void);
        let second = b.load_field(obj, 0, loc(1), Stamp::Int);
        let sum = b.add(first, second);
        b.return_(Some(sum));
        let mut graph = b.finish();

        let result = run(&mut graph);
        assert!(!result.modified);
        assert!(graph.is_alive(second));
    }

    #[test]
    fn test_redundant_store_is_dropped() {
        let mut b = GraphBuilder::new();
        let obj = b.parameter(0, Stamp::Object);
        let value = b.load_field(obj, 0, loc(1), Stamp::Int);
        let store = b.store_field(obj, 0, loc(1), value);
        b.return_(None);
        let mut graph = b.finish();

        let result = run(&mut graph);
        assert!(graph.is_deleted(store));
        assert_eq!(result.stats["eliminated_stores"], 1);
    }

    #[test]
    fn test_diamond_merges_to_phi() {
        let mut b = GraphBuilder::new();
        let obj = b.parameter(0, Stamp::Object);
        let c = b.parameter(1, Stamp::Bool);
        let one = b.constant(1);
        let two = b.constant(2);
        let (t, f) = b.if_(c);
        b.switch_to(t);
        b.store_field(obj, 0, loc(1), one);
        let e1 = b.end();
        b.switch_to(f);
        b.store_field(obj, 0, loc(1), two);
        let e2 = b.end();
        let m = b.merge(&[e1, e2]);
        let load = b.load_field(obj, 0, loc(1), Stamp::Int);
        let ret = b.return_(Some(load));
        let mut graph = b.finish();

        run(&mut graph);
        assert!(graph.is_deleted(load));
        let phi = graph.input(ret, 0).unwrap();
        assert!(graph.op(phi).is_phi());
        assert_eq!(graph.phis(m), vec![phi]);
        assert_eq!(graph.phi_value_at(phi, 0), Some(one));
        assert_eq!(graph.phi_value_at(phi, 1), Some(two));
    }
}
