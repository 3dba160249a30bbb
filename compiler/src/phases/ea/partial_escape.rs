//! Partial escape analysis
//!
//! Every allocation starts out virtual: its fields live in the block state and
//! loads, stores and locks on it are folded away. An object is materialized
//! only on the paths where it escapes, right before the node it escapes into.
//! Merges keep an object virtual when all predecessors agree on it and
//! otherwise materialize it at the end of the predecessors that still hold it
//! virtually.

use super::closure::{EffectsBlockState, EffectsContext, EffectsPolicy, MergeProcessor};
use super::effects::GraphEffectList;
use super::object_state::ObjectState;
use super::phase::EffectsPhase;
use super::EffectsError;
use crate::config::EscapeConfig;
use crate::graph::cfg::LoopId;
use crate::graph::{Graph, NodeId, Op, Stamp};
use fxhash::FxHashMap;
use log::{debug, trace, warn};
use std::rc::Rc;

/// Object states of one program point, indexed by object id
#[derive(Debug, Default)]
pub struct PartialEscapeBlockState {
    dead: bool,
    objects: Vec<Option<Rc<ObjectState>>>,
}

impl PartialEscapeBlockState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object_state(&self, id: usize) -> Option<&ObjectState> {
        self.objects.get(id).and_then(|o| o.as_deref())
    }

    pub fn has_object_state(&self, id: usize) -> bool {
        self.object_state(id).is_some()
    }

    /// Whether virtual object `id` has an entry at `field`
    pub fn has_field(&self, id: usize, field: usize) -> bool {
        self.object_state(id).map_or(false, |o| field < o.entry_count())
    }

    pub fn add_object(&mut self, id: usize, state: ObjectState) {
        self.put(id, Rc::new(state));
    }

    fn put(&mut self, id: usize, state: Rc<ObjectState>) {
        if self.objects.len() <= id {
            self.objects.resize(id + 1, None);
        }
        self.objects[id] = Some(state);
    }

    /// Writable state of object `id`. Shared states are copied first.
    pub fn object_state_mut(&mut self, id: usize) -> Option<&mut ObjectState> {
        let slot = self.objects.get_mut(id)?.as_mut()?;
        if slot.is_copy_on_write() || Rc::strong_count(slot) > 1 {
            *slot = Rc::new(slot.clone_state());
        }
        Rc::get_mut(slot)
    }

    /// The state of object `id`, marked shared so it can go into another block state
    fn shared(&self, id: usize) -> Option<Rc<ObjectState>> {
        let state = self.objects.get(id)?.as_ref()?;
        state.share();
        Some(Rc::clone(state))
    }

    /// Ids of all tracked objects
    pub fn object_ids(&self) -> impl Iterator<Item = usize> + '_ {
        self.objects
            .iter()
            .enumerate()
            .filter_map(|(id, o)| o.as_ref().map(|_| id))
    }

    pub fn virtual_object_count(&self) -> usize {
        self.objects.iter().flatten().filter(|o| o.is_virtual()).count()
    }

    fn capacity(&self) -> usize {
        self.objects.len()
    }
}

impl EffectsBlockState for PartialEscapeBlockState {
    fn is_dead(&self) -> bool {
        self.dead
    }

    fn mark_as_dead(&mut self) {
        self.dead = true;
    }

    fn clone_state(&self) -> Self {
        Self {
            dead: self.dead,
            objects: self
                .objects
                .iter()
                .map(|o| {
                    o.as_ref().map(|state| {
                        state.share();
                        Rc::clone(state)
                    })
                })
                .collect(),
        }
    }

    fn equivalent_to(&self, other: &Self) -> bool {
        if self.dead != other.dead {
            return false;
        }
        let len = self.capacity().max(other.capacity());
        (0..len).all(|id| match (self.object_state(id), other.object_state(id)) {
            (None, None) => true,
            (Some(a), Some(b)) => a == b && a.ensure_virtualized() == b.ensure_virtualized(),
            _ => false,
        })
    }
}

/// What a value stands for at a program point
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Resolved {
    /// A virtual object that is still virtual here
    Virtual(usize),
    /// A virtual object that escaped; its materialized value
    Materialized(NodeId),
    /// Anything else, after scalar replacement
    Plain(NodeId),
}

#[derive(Debug, Default)]
pub struct PartialEscapePolicy {
    /// Virtual object node per object id
    virtual_objects: Vec<NodeId>,
    allocation_ids: FxHashMap<NodeId, usize>,
    default_value: Option<NodeId>,
    exit_proxies: FxHashMap<(NodeId, NodeId), NodeId>,
}

impl PartialEscapePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// The virtual object node standing for object `id`
    pub fn virtual_object(&self, id: usize) -> Option<NodeId> {
        self.virtual_objects.get(id).copied()
    }

    fn object_for_allocation(&mut self, graph: &mut Graph, allocation: NodeId, field_count: usize) -> usize {
        if let Some(&id) = self.allocation_ids.get(&allocation) {
            return id;
        }
        let id = self.virtual_objects.len();
        let object = graph.add_detached(
            Op::VirtualObject {
                object_id: id,
                field_count,
            },
            &[],
            Stamp::Object,
        );
        trace!("allocation {} becomes virtual object {} ({})", allocation, object, id);
        self.virtual_objects.push(object);
        self.allocation_ids.insert(allocation, id);
        id
    }

    /// Value of fields that were never written
    fn default_value(&mut self, graph: &mut Graph) -> NodeId {
        *self
            .default_value
            .get_or_insert_with(|| graph.add_detached(Op::Constant(0), &[], Stamp::Int))
    }

    /// Object id of `value` if it is one of this run's virtual objects, or
    /// aliased to one
    fn virtual_id(&self, cx: &EffectsContext<'_>, value: NodeId) -> Option<usize> {
        let object = if cx.graph.op(value).is_virtual_object() {
            value
        } else {
            cx.aliases.get(value)?
        };
        match *cx.graph.op(object) {
            Op::VirtualObject { object_id, .. } if self.virtual_objects.get(object_id) == Some(&object) => {
                Some(object_id)
            }
            _ => None,
        }
    }

    fn resolve(&self, cx: &EffectsContext<'_>, state: &PartialEscapeBlockState, value: NodeId) -> Resolved {
        if let Some(id) = self.virtual_id(cx, value) {
            match state.object_state(id) {
                Some(object) if object.is_virtual() => return Resolved::Virtual(id),
                Some(object) => {
                    if let Some(materialized) = object.materialized_value() {
                        return Resolved::Materialized(materialized);
                    }
                }
                None => {}
            }
        }
        if cx.graph.op(value).is_virtual_object() {
            return Resolved::Plain(value);
        }
        Resolved::Plain(cx.get_scalar_alias(value))
    }

    fn resolve_input(
        &self,
        cx: &EffectsContext<'_>,
        state: &PartialEscapeBlockState,
        node: NodeId,
        index: usize,
    ) -> Option<Resolved> {
        let value = cx.graph.input(node, index)?;
        Some(self.resolve(cx, state, value))
    }

    /// Value to store in an entry for `resolved`
    fn entry_for(&self, resolved: Resolved) -> NodeId {
        match resolved {
            Resolved::Virtual(id) => self.virtual_objects[id],
            Resolved::Materialized(value) | Resolved::Plain(value) => value,
        }
    }

    /// Materialize object `id` before `position`, returning the value that
    /// stands for it from there on. Objects referenced from its entries are
    /// materialized first.
    fn materialize(
        &mut self,
        cx: &mut EffectsContext<'_>,
        state: &mut PartialEscapeBlockState,
        id: usize,
        position: NodeId,
        effects: &mut GraphEffectList,
    ) -> NodeId {
        let object = self.virtual_objects[id];
        let (entries, locks, ensure_virtualized) = match state.object_state(id) {
            Some(current) if current.is_virtual() => (
                current.entries().map(<[_]>::to_vec).unwrap_or_default(),
                current.lock_ids(),
                current.ensure_virtualized(),
            ),
            Some(current) => return current.materialized_value().unwrap_or(object),
            None => return object,
        };
        if ensure_virtualized {
            warn!(
                "object {} must stay virtual but escapes before {} ({})",
                object,
                position,
                cx.graph.op(position).name()
            );
            cx.counters.record("ensure_virtualized_violations", position);
        }

        let commit = cx
            .graph
            .add_detached(Op::CommitAllocation { object_id: id }, &[Some(object)], Stamp::Object);
        // Escape first so that cyclic references resolve to the commit.
        if let Some(current) = state.object_state_mut(id) {
            current.escape(commit);
        }
        cx.counters.record("materialized", object);

        for entry in entries {
            let value = match entry {
                None => self.default_value(cx.graph),
                Some(value) => match self.virtual_id(cx, value) {
                    Some(inner) if cx.graph.op(value).is_virtual_object() => {
                        self.materialize(cx, state, inner, position, effects)
                    }
                    _ => value,
                },
            };
            if cx.graph.is_detached(value) {
                effects.add_floating_node(value);
            }
            cx.graph.push_input(commit, Some(value));
        }
        effects.add_floating_node(object);
        effects.add_fixed_node_before(commit, position);
        for &monitor_id in locks.iter().rev() {
            let enter = cx
                .graph
                .add_detached(Op::MonitorEnter, &[Some(commit), Some(monitor_id)], Stamp::Void);
            effects.add_fixed_node_before(enter, position);
        }
        debug!("materialize {} as {} before {}", object, commit, position);
        commit
    }

    /// Where materializations for `node` go
    fn insertion_point(graph: &Graph, node: NodeId, last_fixed: Option<NodeId>) -> Option<NodeId> {
        if graph.op(node).is_fixed() {
            Some(node)
        } else {
            last_fixed.and_then(|fixed| graph.next(fixed))
        }
    }

    /// `node` uses its inputs in a way that cannot be virtualized: materialize
    /// every virtual input and point the escaped ones at their values.
    fn process_escapes(
        &mut self,
        cx: &mut EffectsContext<'_>,
        state: &mut PartialEscapeBlockState,
        node: NodeId,
        effects: &mut GraphEffectList,
        last_fixed: Option<NodeId>,
    ) {
        let inputs: Vec<NodeId> = cx.graph.inputs(node).iter().flatten().copied().collect();
        for input in inputs {
            match self.resolve(cx, state, input) {
                Resolved::Virtual(id) => {
                    let Some(position) = Self::insertion_point(cx.graph, node, last_fixed) else {
                        warn!("no insertion point to materialize {} for {}", input, node);
                        continue;
                    };
                    let value = self.materialize(cx, state, id, position, effects);
                    effects.replace_first_input(node, input, value);
                }
                Resolved::Materialized(value) if value != input => {
                    effects.replace_first_input(node, input, value);
                }
                _ => {}
            }
        }
    }

    fn fold_load(
        &mut self,
        cx: &mut EffectsContext<'_>,
        state: &PartialEscapeBlockState,
        load: NodeId,
        id: usize,
        field: usize,
        effects: &mut GraphEffectList,
    ) {
        let entry = state.object_state(id).and_then(|o| o.entry(field));
        let value = match entry {
            Some(value) => value,
            None => self.default_value(cx.graph),
        };
        match self.resolve(cx, state, value) {
            Resolved::Virtual(inner) => {
                cx.aliases.set_alias(load, self.virtual_objects[inner]);
                effects.delete_node(load);
            }
            Resolved::Materialized(value) | Resolved::Plain(value) => {
                cx.add_scalar_alias(load, value);
                effects.replace_at_usages(load, value);
            }
        }
    }

    fn materialize_at_end(
        &mut self,
        cx: &mut EffectsContext<'_>,
        processor: &mut MergeProcessor<PartialEscapeBlockState>,
        state: &mut PartialEscapeBlockState,
        i: usize,
        id: usize,
    ) -> NodeId {
        let position = processor.predecessor_end(i);
        self.materialize(cx, state, id, position, processor.end_effects(i))
    }

    fn identical_object_states(states: &[PartialEscapeBlockState], id: usize) -> bool {
        let first = match states[0].objects.get(id).and_then(|o| o.as_ref()) {
            Some(first) => first,
            None => return false,
        };
        states[1..].iter().all(|s| match s.objects.get(id).and_then(|o| o.as_ref()) {
            Some(other) => {
                Rc::ptr_eq(first, other)
                    || (**first == **other && first.ensure_virtualized() == other.ensure_virtualized())
            }
            None => false,
        })
    }

    /// Merge object `id`, present in every state. Returns true if a
    /// predecessor state had to materialize something.
    fn merge_object(
        &mut self,
        cx: &mut EffectsContext<'_>,
        processor: &mut MergeProcessor<PartialEscapeBlockState>,
        states: &mut [PartialEscapeBlockState],
        id: usize,
        new_state: &mut PartialEscapeBlockState,
    ) -> bool {
        if Self::identical_object_states(states, id) {
            if let Some(shared) = states[0].shared(id) {
                new_state.put(id, shared);
            }
            return false;
        }

        let mut virtual_count = 0;
        let mut locks_match = true;
        let mut ensure_virtualized = true;
        let mut unique_materialized = None;
        if let Some(first) = states[0].object_state(id) {
            if !first.is_virtual() {
                unique_materialized = first.materialized_value();
            }
            for state in states.iter() {
                let Some(object) = state.object_state(id) else { continue };
                ensure_virtualized &= object.ensure_virtualized();
                if object.is_virtual() {
                    virtual_count += 1;
                    unique_materialized = None;
                    locks_match &= object.locks_equal(first);
                } else if object.materialized_value() != unique_materialized {
                    unique_materialized = None;
                }
            }
        }

        if virtual_count == states.len() && locks_match {
            return self.merge_virtual_entries(cx, processor, states, id, ensure_virtualized, new_state);
        }
        if let Some(value) = unique_materialized {
            new_state.add_object(id, ObjectState::new_materialized(value, None, ensure_virtualized));
            return false;
        }

        let (phi, _) = processor.value_phi(cx.graph, self.virtual_objects[id], usize::MAX, Stamp::Object);
        processor.merge_effects.add_floating_node(phi);
        let mut materialized = false;
        for i in 0..states.len() {
            let is_virtual = states[i].object_state(id).map_or(false, |o| o.is_virtual());
            let value = if is_virtual {
                if !ensure_virtualized {
                    if let Some(object) = states[i].object_state_mut(id) {
                        object.set_ensure_virtualized(false);
                    }
                }
                materialized = true;
                self.materialize_at_end(cx, processor, &mut states[i], i, id)
            } else {
                match states[i].object_state(id).and_then(|o| o.materialized_value()) {
                    Some(value) => value,
                    None => continue,
                }
            };
            processor.set_phi_input(phi, i, value);
        }
        new_state.add_object(id, ObjectState::new_materialized(phi, None, false));
        materialized
    }

    fn merge_virtual_entries(
        &mut self,
        cx: &mut EffectsContext<'_>,
        processor: &mut MergeProcessor<PartialEscapeBlockState>,
        states: &mut [PartialEscapeBlockState],
        id: usize,
        ensure_virtualized: bool,
        new_state: &mut PartialEscapeBlockState,
    ) -> bool {
        let (entry_count, locks) = match states[0].object_state(id) {
            Some(first) => (first.entry_count(), first.locks().clone()),
            None => return false,
        };
        let mut entries = Vec::with_capacity(entry_count);
        let mut materialized = false;
        for index in 0..entry_count {
            let values: Vec<Option<NodeId>> = states
                .iter()
                .map(|s| s.object_state(id).and_then(|o| o.entry(index)))
                .collect();
            if values.iter().all(|v| *v == values[0]) {
                entries.push(values[0]);
                continue;
            }

            // Virtual objects cannot flow into a phi.
            for (i, value) in values.iter().enumerate() {
                let Some(value) = *value else { continue };
                if !cx.graph.op(value).is_virtual_object() {
                    continue;
                }
                if let Some(inner) = self.virtual_id(cx, value) {
                    if states[i].object_state(inner).map_or(false, |o| o.is_virtual()) {
                        self.materialize_at_end(cx, processor, &mut states[i], i, inner);
                        materialized = true;
                    }
                }
            }
            if materialized {
                continue;
            }

            let stamp = values
                .iter()
                .flatten()
                .map(|&v| cx.graph.stamp(v))
                .next()
                .unwrap_or(Stamp::Int);
            let (phi, _) = processor.value_phi(cx.graph, self.virtual_objects[id], index, stamp);
            processor.merge_effects.add_floating_node(phi);
            for (i, value) in values.iter().enumerate() {
                let value = match *value {
                    Some(value) => match self.resolve(cx, &states[i], value) {
                        Resolved::Materialized(m) => m,
                        _ => value,
                    },
                    None => self.default_value(cx.graph),
                };
                processor.set_phi_input(phi, i, value);
            }
            entries.push(Some(phi));
        }
        if !materialized {
            new_state.add_object(
                id,
                ObjectState::new_virtual_with_locks(entries, locks, ensure_virtualized),
            );
        }
        materialized
    }

    /// Reconcile an existing phi whose inputs may be virtual. Returns true if
    /// a predecessor state had to materialize something.
    fn merge_phi(
        &mut self,
        cx: &mut EffectsContext<'_>,
        processor: &mut MergeProcessor<PartialEscapeBlockState>,
        states: &mut [PartialEscapeBlockState],
        phi: NodeId,
    ) -> bool {
        let count = states.len();
        let mut objects: Vec<Option<usize>> = vec![None; count];
        let mut virtual_inputs = 0;
        let mut unique = true;
        let mut ensure_virtualized = true;
        for i in 0..count {
            let Some(value) = processor.phi_value_at(cx.graph, phi, i) else { continue };
            let Some(id) = self.virtual_id(cx, value) else { continue };
            let Some(object) = states[i].object_state(id) else {
                return false;
            };
            objects[i] = Some(id);
            if object.is_virtual() {
                if objects[0] != Some(id) {
                    unique = false;
                }
                ensure_virtualized &= object.ensure_virtualized();
                virtual_inputs += 1;
            }
        }

        if virtual_inputs == count && unique {
            if let Some(id) = objects[0] {
                trace!("phi {} is virtual object {}", phi, self.virtual_objects[id]);
                cx.aliases.set_alias(phi, self.virtual_objects[id]);
                processor.merge_effects.delete_node(phi);
                return false;
            }
        }

        let mut materialized = false;
        if virtual_inputs > 0 {
            for i in 0..count {
                let Some(id) = objects[i] else { continue };
                if states[i].object_state(id).map_or(false, |o| o.is_virtual()) {
                    if !ensure_virtualized {
                        if let Some(object) = states[i].object_state_mut(id) {
                            object.set_ensure_virtualized(false);
                        }
                    }
                    self.materialize_at_end(cx, processor, &mut states[i], i, id);
                    materialized = true;
                }
            }
        }
        for i in 0..count {
            let Some(id) = objects[i] else { continue };
            let value = states[i]
                .object_state(id)
                .filter(|o| !o.is_virtual())
                .and_then(|o| o.materialized_value());
            if let Some(value) = value {
                processor.set_phi_input(phi, i, value);
            }
        }
        materialized
    }

    fn exit_proxy(&mut self, graph: &mut Graph, exit: NodeId, value: NodeId) -> NodeId {
        *self.exit_proxies.entry((exit, value)).or_insert_with(|| {
            let stamp = graph.stamp(value);
            graph.add_detached(Op::ValueProxy, &[Some(value), Some(exit)], stamp)
        })
    }
}

impl EffectsPolicy for PartialEscapePolicy {
    type State = PartialEscapeBlockState;

    fn name(&self) -> &'static str {
        "PartialEscape"
    }

    fn initial_state(&self) -> PartialEscapeBlockState {
        PartialEscapeBlockState::new()
    }

    fn process_node(
        &mut self,
        cx: &mut EffectsContext<'_>,
        node: NodeId,
        state: &mut PartialEscapeBlockState,
        effects: &mut GraphEffectList,
        last_fixed: Option<NodeId>,
    ) -> bool {
        let op = cx.graph.op(node).clone();
        let object = self.resolve_input(cx, state, node, 0);
        match (op, object) {
            (Op::NewInstance { field_count }, _) => {
                let id = self.object_for_allocation(cx.graph, node, field_count);
                state.add_object(id, ObjectState::new_virtual(vec![None; field_count], &[], false));
                cx.aliases.set_alias(node, self.virtual_objects[id]);
                cx.counters.record("virtualized", node);
                effects.delete_node(node);
                true
            }
            (Op::LoadField { field, .. } | Op::StoreField { field, .. }, Some(Resolved::Virtual(id)))
                if !state.has_field(id, field) =>
            {
                warn!("{} reads or writes field {} past the end of object {}", node, field, id);
                self.process_escapes(cx, state, node, effects, last_fixed);
                false
            }
            (Op::LoadField { field, .. }, Some(Resolved::Virtual(id))) => {
                self.fold_load(cx, state, node, id, field, effects);
                true
            }
            (Op::StoreField { field, .. }, Some(Resolved::Virtual(id))) => {
                let value = self
                    .resolve_input(cx, state, node, 1)
                    .map(|resolved| self.entry_for(resolved));
                if let Some(object) = state.object_state_mut(id) {
                    object.set_entry(field, value);
                }
                effects.delete_node(node);
                true
            }
            (Op::MonitorEnter, Some(Resolved::Virtual(id))) if cx.graph.input(node, 1).is_some() => {
                if let (Some(monitor_id), Some(object)) = (cx.graph.input(node, 1), state.object_state_mut(id)) {
                    object.add_lock(monitor_id);
                }
                effects.delete_node(node);
                true
            }
            (Op::MonitorExit, Some(Resolved::Virtual(id))) => {
                if let Some(object) = state.object_state_mut(id) {
                    object.remove_lock();
                }
                effects.delete_node(node);
                true
            }
            (Op::EnsureVirtualized, Some(Resolved::Virtual(id))) => {
                if let Some(object) = state.object_state_mut(id) {
                    object.set_ensure_virtualized(true);
                }
                effects.delete_node(node);
                true
            }
            (Op::EnsureVirtualized, _) => {
                warn!("{} is not virtual at {}", cx.graph.input(node, 0).map_or("?".to_string(), |n| n.to_string()), node);
                cx.counters.record("ensure_virtualized_violations", node);
                false
            }
            (Op::ValueProxy, Some(Resolved::Virtual(id))) => {
                cx.aliases.set_alias(node, self.virtual_objects[id]);
                effects.delete_node(node);
                true
            }
            (Op::CommitAllocation { .. } | Op::VirtualObject { .. }, _) => false,
            _ => {
                self.process_escapes(cx, state, node, effects, last_fixed);
                false
            }
        }
    }

    fn process_loop_exit(
        &mut self,
        cx: &mut EffectsContext<'_>,
        exit: NodeId,
        initial: &PartialEscapeBlockState,
        exit_state: &mut PartialEscapeBlockState,
        effects: &mut GraphEffectList,
    ) {
        let ids: Vec<usize> = exit_state.object_ids().collect();
        for id in ids {
            let before = initial.object_state(id);
            let Some(object) = exit_state.object_state(id) else { continue };
            if object.is_virtual() {
                let entries = object.entries().map(<[_]>::to_vec).unwrap_or_default();
                for (index, entry) in entries.into_iter().enumerate() {
                    let Some(value) = entry else { continue };
                    if cx.graph.op(value).is_virtual_object() {
                        continue;
                    }
                    let unchanged = before.map_or(false, |b| b.is_virtual() && b.entry(index) == Some(value));
                    if unchanged {
                        continue;
                    }
                    let proxy = self.exit_proxy(cx.graph, exit, value);
                    effects.add_floating_node(proxy);
                    if let Some(object) = exit_state.object_state_mut(id) {
                        object.set_entry(index, Some(proxy));
                    }
                }
            } else if let Some(value) = object.materialized_value() {
                let unchanged = before.map_or(false, |b| !b.is_virtual() && b.materialized_value() == Some(value));
                if unchanged {
                    continue;
                }
                let proxy = self.exit_proxy(cx.graph, exit, value);
                effects.add_floating_node(proxy);
                if let Some(object) = exit_state.object_state_mut(id) {
                    object.update_materialized_value(proxy);
                }
            }
        }
    }

    fn merge(
        &mut self,
        cx: &mut EffectsContext<'_>,
        processor: &mut MergeProcessor<PartialEscapeBlockState>,
        states: &mut [PartialEscapeBlockState],
    ) -> Result<PartialEscapeBlockState, EffectsError> {
        loop {
            let mut new_state = PartialEscapeBlockState::new();
            let mut materialized = false;
            let capacity = states.iter().map(|s| s.capacity()).max().unwrap_or(0);
            for id in 0..capacity {
                if states.iter().all(|s| s.has_object_state(id)) {
                    materialized |= self.merge_object(cx, processor, states, id, &mut new_state);
                }
            }
            for phi in processor.phis(cx.graph) {
                cx.aliases.clear(phi);
                materialized |= self.merge_phi(cx, processor, states, phi);
            }
            if !materialized {
                return Ok(new_state);
            }
            trace!("merge at {} materialized objects, merging again", processor.merge_node());
            processor.merge_effects.clear();
            processor.after_merge_effects.clear();
        }
    }

    fn process_initial_loop_state(&mut self, cx: &mut EffectsContext<'_>, l: LoopId, state: &mut PartialEscapeBlockState) {
        let header = cx.cfg.block(cx.cfg.loop_info(l).header).begin;
        for phi in cx.graph.phis(header) {
            let Some(initial) = cx.graph.phi_value_at(phi, 0) else { continue };
            match self.resolve(cx, state, initial) {
                Resolved::Virtual(id) => cx.aliases.set_alias(phi, self.virtual_objects[id]),
                _ => cx.aliases.clear(phi),
            }
        }
    }

    fn counter_names(&self) -> &'static [&'static str] {
        &["virtualized", "materialized", "ensure_virtualized_violations"]
    }
}

impl EffectsPhase<PartialEscapePolicy> {
    pub fn partial_escape(config: &EscapeConfig) -> Self {
        EffectsPhase::new("PartialEscape", config, PartialEscapePolicy::new)
    }
}
