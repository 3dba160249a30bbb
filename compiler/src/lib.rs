//! Partial escape analysis engine
//!
//! A small sea-of-nodes style graph IR with a control flow graph, plus the
//! effects-based escape analysis framework that runs over it:
//!
//! - [`graph`]: node arena, builder, control flow graph, schedule and dumps
//! - [`phases`]: the reentrant block iterator and the escape analysis phases
//! - [`config`]: [`config::EscapeConfig`]
//! - [`logging`]: `env_logger` setup

pub mod config;
pub mod graph;
pub mod logging;
pub mod phases;

pub use config::EscapeConfig;
pub use graph::{Graph, GraphBuilder, NodeId};
pub use phases::ea::EffectsError;
pub use phases::{GraphPhase, PhaseManager, PhaseResult};
