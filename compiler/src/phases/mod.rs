//! Graph Phases
//!
//! Phases transform a node graph in place. They are organized like the rest of
//! the pipeline: each phase reports a [`PhaseResult`] and a [`PhaseManager`]
//! runs a configured sequence of them.

pub mod block_iterator;
pub mod ea;

use crate::config::EscapeConfig;
use crate::graph::Graph;
use ea::partial_escape::PartialEscapePolicy;
use ea::read_elimination::ReadEliminationPolicy;
use ea::{EffectsError, EffectsPhase};
use std::collections::HashMap;

/// A transformation over a whole graph
pub trait GraphPhase {
    /// Get the name of this phase
    fn name(&self) -> &'static str;

    fn run(&mut self, graph: &mut Graph) -> Result<PhaseResult, EffectsError>;
}

/// Result of a phase run
#[derive(Debug, Clone, Default)]
pub struct PhaseResult {
    /// Whether the graph was modified
    pub modified: bool,

    /// Number of analyse-and-commit rounds that ran
    pub rounds: usize,

    /// Number of nodes deleted while committing effects
    pub nodes_removed: usize,

    /// Policy counters
    pub stats: HashMap<String, usize>,
}

impl PhaseResult {
    /// Create a result indicating no changes
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// Create a result indicating changes
    pub fn changed() -> Self {
        Self {
            modified: true,
            ..Self::default()
        }
    }

    /// Combine results
    pub fn combine(mut self, other: PhaseResult) -> Self {
        self.modified |= other.modified;
        self.rounds += other.rounds;
        self.nodes_removed += other.nodes_removed;
        for (key, value) in other.stats {
            *self.stats.entry(key).or_insert(0) += value;
        }
        self
    }
}

/// Runs a sequence of phases
#[derive(Default)]
pub struct PhaseManager {
    phases: Vec<Box<dyn GraphPhase>>,
}

impl PhaseManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_phase<P: GraphPhase + 'static>(&mut self, phase: P) {
        self.phases.push(Box::new(phase));
    }

    /// Partial escape analysis, followed by read elimination when enabled
    pub fn from_config(config: &EscapeConfig) -> Self {
        let mut manager = Self::new();
        if !config.enabled {
            return manager;
        }
        manager.add_phase(EffectsPhase::<PartialEscapePolicy>::partial_escape(config));
        if config.read_elimination {
            manager.add_phase(EffectsPhase::<ReadEliminationPolicy>::read_elimination(config));
        }
        manager
    }

    pub fn phase_names(&self) -> Vec<&'static str> {
        self.phases.iter().map(|p| p.name()).collect()
    }

    /// Run every phase once, in order
    pub fn run(&mut self, graph: &mut Graph) -> Result<PhaseResult, EffectsError> {
        let mut total = PhaseResult::unchanged();
        for phase in &mut self.phases {
            let result = phase.run(graph)?;
            tracing::debug!(
                phase = phase.name(),
                modified = result.modified,
                removed = result.nodes_removed,
                "phase finished"
            );
            total = total.combine(result);
        }
        Ok(total)
    }
}
