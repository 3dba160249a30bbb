//! Per-object analysis state
//!
//! An [`ObjectState`] describes one abstract object: either virtual (its fields
//! are tracked as entries) or materialized (backed by a real value), plus the
//! locks held on it. Block states share object states copy-on-write.

use crate::graph::{Graph, NodeId, Op};
use std::cell::{Cell, OnceCell};
use std::fmt;
use std::rc::Rc;

/// Persistent, innermost-first list of lock tokens.
///
/// Pushing a lock allocates a new head pointing at the old list, so clones of
/// an object state share their lock lists.
#[derive(Debug, PartialEq, Eq)]
pub struct LockState {
    pub monitor_id: NodeId,
    pub next: Option<Rc<LockState>>,
}

impl LockState {
    pub fn new(monitor_id: NodeId, next: Option<Rc<LockState>>) -> Self {
        Self { monitor_id, next }
    }

    /// Lock tokens, innermost first
    pub fn iter(this: &Option<Rc<LockState>>) -> impl Iterator<Item = NodeId> + '_ {
        let mut current = this.as_deref();
        std::iter::from_fn(move || {
            let lock = current?;
            current = lock.next.as_deref();
            Some(lock.monitor_id)
        })
    }
}

/// Immutable export of an object state, referencing the virtual object it describes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EscapeObjectState {
    /// Entries holding a default value (zero or `false` constants) are `None`
    Virtual {
        object: NodeId,
        entries: Vec<Option<NodeId>>,
    },
    Materialized {
        object: NodeId,
        value: NodeId,
    },
}

impl EscapeObjectState {
    pub fn object(&self) -> NodeId {
        match self {
            EscapeObjectState::Virtual { object, .. } | EscapeObjectState::Materialized { object, .. } => *object,
        }
    }
}

pub struct ObjectState {
    /// Present iff the object is virtual
    entries: Option<Vec<Option<NodeId>>>,
    /// Present iff the object is materialized
    materialized_value: Option<NodeId>,
    locks: Option<Rc<LockState>>,
    ensure_virtualized: bool,
    cached_state: OnceCell<Rc<EscapeObjectState>>,
    copy_on_write: Cell<bool>,
}

impl ObjectState {
    /// A virtual object with the given entries and locks (outermost lock first)
    pub fn new_virtual(entries: Vec<Option<NodeId>>, locks: &[NodeId], ensure_virtualized: bool) -> Self {
        let mut lock_state = None;
        for &monitor_id in locks {
            lock_state = Some(Rc::new(LockState::new(monitor_id, lock_state)));
        }
        Self::with_lock_state(Some(entries), None, lock_state, ensure_virtualized)
    }

    /// A virtual object sharing an existing lock list
    pub fn new_virtual_with_locks(
        entries: Vec<Option<NodeId>>,
        locks: Option<Rc<LockState>>,
        ensure_virtualized: bool,
    ) -> Self {
        Self::with_lock_state(Some(entries), None, locks, ensure_virtualized)
    }

    /// An object already backed by `materialized_value`
    pub fn new_materialized(
        materialized_value: NodeId,
        locks: Option<Rc<LockState>>,
        ensure_virtualized: bool,
    ) -> Self {
        Self::with_lock_state(None, Some(materialized_value), locks, ensure_virtualized)
    }

    fn with_lock_state(
        entries: Option<Vec<Option<NodeId>>>,
        materialized_value: Option<NodeId>,
        locks: Option<Rc<LockState>>,
        ensure_virtualized: bool,
    ) -> Self {
        debug_assert!(entries.is_some() != materialized_value.is_some());
        Self {
            entries,
            materialized_value,
            locks,
            ensure_virtualized,
            cached_state: OnceCell::new(),
            copy_on_write: Cell::new(false),
        }
    }

    /// Deep copy of the entries; the lock list and the cached export are shared.
    /// The copy is not copy-on-write.
    pub fn clone_state(&self) -> Self {
        let cached_state = OnceCell::new();
        if let Some(cached) = self.cached_state.get() {
            let _ = cached_state.set(Rc::clone(cached));
        }
        Self {
            entries: self.entries.clone(),
            materialized_value: self.materialized_value,
            locks: self.locks.clone(),
            ensure_virtualized: self.ensure_virtualized,
            cached_state,
            copy_on_write: Cell::new(false),
        }
    }

    /// Mark this instance as referenced by more than one block state. The next
    /// writer must clone it first.
    pub fn share(&self) -> &Self {
        self.copy_on_write.set(true);
        self
    }

    pub fn is_copy_on_write(&self) -> bool {
        self.copy_on_write.get()
    }

    pub fn is_virtual(&self) -> bool {
        debug_assert!(self.materialized_value.is_none() ^ self.entries.is_none());
        self.materialized_value.is_none()
    }

    /// Entries of a virtual object; `None` once materialized
    pub fn entries(&self) -> Option<&[Option<NodeId>]> {
        self.entries.as_deref()
    }

    pub fn entry(&self, index: usize) -> Option<NodeId> {
        self.entries.as_ref().and_then(|e| e.get(index).copied().flatten())
    }

    pub fn entry_count(&self) -> usize {
        self.entries.as_ref().map_or(0, |e| e.len())
    }

    pub fn materialized_value(&self) -> Option<NodeId> {
        self.materialized_value
    }

    /// Overwrite one entry; returns false when the object is materialized
    /// or has no such field
    pub fn set_entry(&mut self, index: usize, value: Option<NodeId>) -> bool {
        match self.entries.as_mut().and_then(|e| e.get_mut(index)) {
            Some(slot) => {
                *slot = value;
                self.cached_state = OnceCell::new();
                true
            }
            None => false,
        }
    }

    /// Switch to the materialized form, backed by `materialized`
    pub fn escape(&mut self, materialized: NodeId) {
        debug_assert!(self.is_virtual());
        self.materialized_value = Some(materialized);
        self.entries = None;
        self.cached_state = OnceCell::new();
        debug_assert!(!self.is_virtual());
    }

    pub fn update_materialized_value(&mut self, value: NodeId) {
        debug_assert!(!self.is_virtual());
        self.cached_state = OnceCell::new();
        self.materialized_value = Some(value);
    }

    pub fn add_lock(&mut self, monitor_id: NodeId) {
        self.cached_state = OnceCell::new();
        self.locks = Some(Rc::new(LockState::new(monitor_id, self.locks.take())));
    }

    /// Pop the innermost lock
    pub fn remove_lock(&mut self) -> Option<NodeId> {
        let head = self.locks.take()?;
        self.cached_state = OnceCell::new();
        self.locks = head.next.clone();
        Some(head.monitor_id)
    }

    pub fn has_locks(&self) -> bool {
        self.locks.is_some()
    }

    pub fn locks(&self) -> &Option<Rc<LockState>> {
        &self.locks
    }

    /// Lock tokens, innermost first
    pub fn lock_ids(&self) -> Vec<NodeId> {
        LockState::iter(&self.locks).collect()
    }

    /// Same lock tokens in the same order, and both lists end together
    pub fn locks_equal(&self, other: &ObjectState) -> bool {
        let mut a = LockState::iter(&self.locks);
        let mut b = LockState::iter(&other.locks);
        loop {
            match (a.next(), b.next()) {
                (None, None) => return true,
                (Some(x), Some(y)) if x == y => continue,
                _ => return false,
            }
        }
    }

    pub fn ensure_virtualized(&self) -> bool {
        self.ensure_virtualized
    }

    pub fn set_ensure_virtualized(&mut self, ensure_virtualized: bool) {
        self.ensure_virtualized = ensure_virtualized;
    }

    /// Export this state for the virtual object `object`, caching the result
    /// until the next mutation.
    pub fn create_escape_object_state(&self, graph: &Graph, object: NodeId) -> Rc<EscapeObjectState> {
        let state = self.cached_state.get_or_init(|| {
            log::trace!("creating escape object state for {}", object);
            let exported = match (&self.entries, self.materialized_value) {
                (Some(entries), _) => EscapeObjectState::Virtual {
                    object,
                    entries: entries
                        .iter()
                        .map(|entry| entry.filter(|&value| !is_default_constant(graph, value)))
                        .collect(),
                },
                (None, Some(value)) => EscapeObjectState::Materialized { object, value },
                (None, None) => unreachable!("object state is neither virtual nor materialized"),
            };
            Rc::new(exported)
        });
        Rc::clone(state)
    }
}

fn is_default_constant(graph: &Graph, value: NodeId) -> bool {
    matches!(graph.op(value), Op::Constant(0) | Op::LogicConstant(false))
}

impl Clone for ObjectState {
    fn clone(&self) -> Self {
        self.clone_state()
    }
}

impl PartialEq for ObjectState {
    fn eq(&self, other: &Self) -> bool {
        self.entries == other.entries
            && self.locks_equal(other)
            && self.materialized_value == other.materialized_value
    }
}

impl Eq for ObjectState {}

impl fmt::Debug for ObjectState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.entries, self.materialized_value) {
            (Some(entries), _) => {
                write!(f, "[")?;
                for (i, entry) in entries.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    match entry {
                        Some(value) => write!(f, "{}", value)?,
                        None => write!(f, "null")?,
                    }
                }
                write!(f, "]")?;
            }
            (None, Some(value)) => write!(f, "mat {}", value)?,
            (None, None) => write!(f, "<invalid>")?,
        }
        let locks = self.lock_ids();
        if !locks.is_empty() {
            write!(f, " locked {:?}", locks)?;
        }
        if self.ensure_virtualized {
            write!(f, " ensure")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::Stamp;

    fn ids(n: u32) -> Vec<NodeId> {
        (0..n).map(NodeId::new).collect()
    }

    #[test]
    fn test_escape_switches_to_materialized() {
        let n = ids(4);
        let mut state = ObjectState::new_virtual(vec![Some(n[1]), None], &[], false);
        assert!(state.is_virtual());
        assert_eq!(state.entry(0), Some(n[1]));
        assert_eq!(state.entry(1), None);

        state.escape(n[3]);
        assert!(!state.is_virtual());
        assert_eq!(state.materialized_value(), Some(n[3]));

        state.update_materialized_value(n[2]);
        assert_eq!(state.materialized_value(), Some(n[2]));
    }

    #[test]
    fn test_accessors_return_none_for_the_other_form() {
        let n = ids(3);
        let mut state = ObjectState::new_virtual(vec![Some(n[1])], &[], false);
        assert_eq!(state.materialized_value(), None);
        assert_eq!(state.entry(4), None);
        assert!(!state.set_entry(4, Some(n[2])));
        assert_eq!(state.entries(), Some(&[Some(n[1])][..]));

        state.escape(n[2]);
        assert_eq!(state.entries(), None);
        assert_eq!(state.entry(0), None);
        assert_eq!(state.entry_count(), 0);
        assert!(!state.set_entry(0, Some(n[1])));
        assert_eq!(state.materialized_value(), Some(n[2]));
    }

    #[test]
    fn test_locks_equal_compares_whole_sequence() {
        let n = ids(4);
        let (a, b, c) = (n[1], n[2], n[3]);
        let ab1 = ObjectState::new_virtual(vec![], &[a, b], false);
        let ab2 = ObjectState::new_virtual(vec![], &[a, b], false);
        let ac = ObjectState::new_virtual(vec![], &[a, c], false);
        let a_only = ObjectState::new_virtual(vec![], &[a], false);

        assert!(ab1.locks_equal(&ab2));
        assert!(!ab1.locks_equal(&ac));
        assert!(!ab1.locks_equal(&a_only));
        assert!(!a_only.locks_equal(&ab1));
        assert_eq!(ab1.lock_ids(), vec![b, a]);
    }

    #[test]
    fn test_lock_push_pop() {
        let n = ids(3);
        let mut state = ObjectState::new_virtual(vec![None], &[], false);
        assert!(!state.has_locks());
        state.add_lock(n[1]);
        state.add_lock(n[2]);
        let clone = state.clone_state();
        assert_eq!(state.remove_lock(), Some(n[2]));
        assert_eq!(state.remove_lock(), Some(n[1]));
        assert_eq!(state.remove_lock(), None);
        // The clone keeps its own view of the shared list.
        assert_eq!(clone.lock_ids(), vec![n[2], n[1]]);
    }

    #[test]
    fn test_clone_is_deep_for_entries_and_clears_copy_on_write() {
        let n = ids(3);
        let state = ObjectState::new_virtual(vec![Some(n[1])], &[], true);
        state.share();
        assert!(state.is_copy_on_write());

        let mut copy = state.clone_state();
        assert!(!copy.is_copy_on_write());
        copy.set_entry(0, Some(n[2]));
        assert_eq!(state.entry(0), Some(n[1]));
        assert_eq!(copy.entry(0), Some(n[2]));
        assert!(copy.ensure_virtualized());
        assert_ne!(state, copy);
    }

    #[test]
    fn test_escape_object_state_is_cached_until_mutation() {
        let mut graph = Graph::new();
        let zero = graph.add(Op::Constant(0), &[], Stamp::Int);
        let five = graph.add(Op::Constant(5), &[], Stamp::Int);
        let vobj = graph.add(
            Op::VirtualObject {
                object_id: 0,
                field_count: 2,
            },
            &[],
            Stamp::Object,
        );
        let mut state = ObjectState::new_virtual(vec![Some(zero), Some(five)], &[], false);

        let first = state.create_escape_object_state(&graph, vobj);
        assert_eq!(
            *first,
            EscapeObjectState::Virtual {
                object: vobj,
                entries: vec![None, Some(five)],
            }
        );
        let second = state.create_escape_object_state(&graph, vobj);
        assert!(Rc::ptr_eq(&first, &second));

        state.set_entry(0, Some(five));
        let third = state.create_escape_object_state(&graph, vobj);
        assert!(!Rc::ptr_eq(&first, &third));

        state.escape(five);
        let materialized = state.create_escape_object_state(&graph, vobj);
        assert_eq!(
            *materialized,
            EscapeObjectState::Materialized {
                object: vobj,
                value: five,
            }
        );
    }
}
