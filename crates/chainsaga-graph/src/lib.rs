//! Chainsaga Graph
//!
//! Static, declarative step tables for chainsaga workflows. A [`StepGraph`]
//! maps each step kind to its success transitions, its failure transition,
//! and the prior steps whose output it may read. It is pure data: lookups
//! never perform I/O and never fail at runtime.
//!
//! Graphs are validated once, when built:
//! - every edge targets a declared step or one of the absorbing steps
//!   (`markSuccess`, `markFailure`)
//! - every step has a success transition
//! - the transition relation is acyclic, so every branch reaches an
//!   absorbing step within [`StepGraph::max_hops`] transitions
//! - every declared step is reachable from the init step

mod config;
mod error;
mod graph;
mod kind;

pub use config::{GraphDef, StepConfig};
pub use error::GraphError;
pub use graph::{StepGraph, Transition};
pub use kind::{StepKind, WORKFLOW_TOPIC, WorkflowKind};
