//! Escape Analysis Effects Framework
//!
//! The reusable engine behind partial escape analysis and read elimination:
//! - [`ObjectState`]: per-object virtual/materialized state with locks
//! - [`GraphEffectList`]: deferred graph mutations, replayed after analysis
//! - [`AliasTable`]: scalar replacements recorded during the walk
//! - [`LoopKillCache`]: per-loop record of overwritten memory locations
//! - [`EffectsClosure`]: block walk, merge protocol, loop fixed point and commit
//! - [`EffectsPhase`]: repeated analyse-and-commit rounds over a graph
//!
//! Concrete per-node rules are supplied through [`EffectsPolicy`];
//! [`partial_escape`] and [`read_elimination`] hold the two built-in policies.

pub mod alias;
pub mod closure;
pub mod effects;
pub mod loop_kill_cache;
pub mod object_state;
pub mod partial_escape;
pub mod phase;
pub mod read_elimination;

pub use alias::AliasTable;
pub use closure::{
    EffectsBlockState, EffectsClosure, EffectsContext, EffectsCounters, EffectsPolicy, MergeProcessor,
    MAX_LOOP_ITERATIONS,
};
pub use effects::{Effect, GraphEffectList};
pub use loop_kill_cache::LoopKillCache;
pub use object_state::{EscapeObjectState, LockState, ObjectState};
pub use phase::EffectsPhase;

use crate::graph::cfg::BlockId;
use crate::graph::NodeId;
use std::fmt;

/// Errors raised by the effects engine.
///
/// All of them are internal compiler errors: the analysis of the current graph
/// is aborted and the graph is left as it was before the failed round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EffectsError {
    /// A loop did not reach a fixed point within the iteration bound
    TooManyIterations {
        loop_begin: NodeId,
        header: BlockId,
        iterations: usize,
    },
    /// A loop exit was reached before its loop converged
    MissingLoopEntryState { loop_exit: NodeId, loop_begin: NodeId },
    /// A loop walk produced no state for one of its exits or back edges
    MissingExitState { header: NodeId, exit: NodeId },
    /// A merge block already had effects when it was merged
    MergeEffectsNotEmpty { block: NodeId },
    /// A node scheduled for deletion is still reachable after replay
    ObsoleteNodeReachable { node: NodeId },
    MalformedGraph(String),
}

impl fmt::Display for EffectsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EffectsError::TooManyIterations {
                loop_begin,
                header,
                iterations,
            } => write!(
                f,
                "too many iterations at loop {} (header {}): no fixed point after {} iterations",
                loop_begin, header, iterations
            ),
            EffectsError::MissingLoopEntryState { loop_exit, loop_begin } => {
                write!(f, "no entry state for loop {} at exit {}", loop_begin, loop_exit)
            }
            EffectsError::MissingExitState { header, exit } => {
                write!(f, "no loop exit state at {} / {}", exit, header)
            }
            EffectsError::MergeEffectsNotEmpty { block } => {
                write!(f, "merge block at {} already has effects", block)
            }
            EffectsError::ObsoleteNodeReachable { node } => {
                write!(f, "obsolete node {} is still reachable", node)
            }
            EffectsError::MalformedGraph(msg) => write!(f, "malformed graph: {}", msg),
        }
    }
}

impl std::error::Error for EffectsError {}

impl From<String> for EffectsError {
    fn from(msg: String) -> Self {
        EffectsError::MalformedGraph(msg)
    }
}
