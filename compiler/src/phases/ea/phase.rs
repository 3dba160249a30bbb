//! Effects phase driver
//!
//! Runs analyse-and-commit rounds of an [`EffectsPolicy`] over a graph: every
//! round recomputes the control flow graph and schedule, walks the graph with a
//! fresh [`EffectsClosure`], replays the recorded effects when they remove
//! something, and stops as soon as a round finds nothing significant to remove.

use super::closure::{EffectsClosure, EffectsPolicy};
use super::EffectsError;
use crate::config::EscapeConfig;
use crate::graph::cfg::ControlFlowGraph;
use crate::graph::schedule::ScheduleResult;
use crate::graph::Graph;
use crate::phases::{GraphPhase, PhaseResult};

pub struct EffectsPhase<P: EffectsPolicy> {
    name: &'static str,
    iterations: usize,
    max_loop_iterations: usize,
    use_schedule: bool,
    factory: Box<dyn FnMut() -> P>,
}

impl<P: EffectsPolicy> EffectsPhase<P> {
    /// A phase creating a fresh policy with `factory` for every round
    pub fn new(name: &'static str, config: &EscapeConfig, factory: impl FnMut() -> P + 'static) -> Self {
        Self {
            name,
            iterations: config.iterations,
            max_loop_iterations: config.max_loop_iterations,
            use_schedule: config.use_schedule,
            factory: Box::new(factory),
        }
    }

    pub fn with_iterations(mut self, iterations: usize) -> Self {
        self.iterations = iterations;
        self
    }

    fn run_rounds(&mut self, graph: &mut Graph) -> Result<PhaseResult, EffectsError> {
        let mut result = PhaseResult::unchanged();
        for round in 0..self.iterations {
            let cfg = ControlFlowGraph::compute(graph)?;
            let schedule = if self.use_schedule {
                Some(ScheduleResult::compute(graph, &cfg))
            } else {
                None
            };

            let policy = (self.factory)();
            let mut closure = EffectsClosure::new(graph, &cfg, schedule.as_ref(), policy)
                .with_max_loop_iterations(self.max_loop_iterations);
            closure.process()?;
            let changed = closure.has_changed();
            result.rounds += 1;

            if closure.needs_apply_effects() {
                let removed = closure.apply_effects()?;
                result.modified = true;
                result.nodes_removed += removed;
            }
            for (key, value) in closure.counters().iter() {
                *result.stats.entry(key.to_string()).or_insert(0) += value;
            }
            log::debug!(
                "{} round {}: changed = {}, removed so far = {}",
                self.name,
                round,
                changed,
                result.nodes_removed
            );
            if !changed {
                break;
            }
        }
        Ok(result)
    }
}

impl<P: EffectsPolicy> GraphPhase for EffectsPhase<P> {
    fn name(&self) -> &'static str {
        self.name
    }

    fn run(&mut self, graph: &mut Graph) -> Result<PhaseResult, EffectsError> {
        let _span = tracing::debug_span!("effects_phase", phase = self.name).entered();
        let result = self.run_rounds(graph)?;
        tracing::debug!(
            rounds = result.rounds,
            removed = result.nodes_removed,
            "{} finished",
            self.name
        );
        Ok(result)
    }
}
