use std::collections::{BTreeMap, HashMap, HashSet};

use crate::config::{GraphDef, StepConfig};
use crate::error::GraphError;
use crate::kind::{StepKind, WorkflowKind};

/// Which outgoing edge of a step to follow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
  Success,
  Failure,
}

/// Static, validated step table for one workflow kind.
///
/// A `StepGraph` can only be obtained through [`StepGraph::new`] (or one of
/// the parsing helpers), which checks that every branch ends in
/// `markSuccess` or `markFailure`. Lookups are pure and never fail.
#[derive(Debug, Clone)]
pub struct StepGraph {
  kind: WorkflowKind,
  init: StepKind,
  steps: HashMap<StepKind, StepConfig>,
  /// Adjacency list: step -> success and failure successors.
  adjacency: HashMap<StepKind, Vec<StepKind>>,
  /// Longest path from init to an absorbing step.
  max_hops: usize,
}

impl StepGraph {
  /// Build and validate a graph.
  pub fn new(
    kind: WorkflowKind,
    init: StepKind,
    steps: impl IntoIterator<Item = (StepKind, StepConfig)>,
  ) -> Result<Self, GraphError> {
    let steps: HashMap<StepKind, StepConfig> = steps.into_iter().collect();

    let mut adjacency: HashMap<StepKind, Vec<StepKind>> = HashMap::new();

    for (from, config) in &steps {
      let edges = config
        .on_success
        .iter()
        .chain(std::iter::once(&config.on_failure));
      for to in edges {
        let targets = adjacency.entry(from.clone()).or_default();
        if !targets.contains(to) {
          targets.push(to.clone());
        }
      }
    }

    let mut graph = Self {
      kind,
      init,
      steps,
      adjacency,
      max_hops: 0,
    };
    graph.validate()?;
    graph.max_hops = graph.longest_path(&graph.init.clone(), &mut HashMap::new());
    Ok(graph)
  }

  /// Build a graph from its serializable definition.
  pub fn from_def(def: GraphDef) -> Result<Self, GraphError> {
    Self::new(def.kind, def.init, def.steps)
  }

  /// Parse and validate a JSON graph definition.
  pub fn from_json(json: &str) -> Result<Self, GraphError> {
    let def: GraphDef = serde_json::from_str(json)?;
    Self::from_def(def)
  }

  pub fn kind(&self) -> &WorkflowKind {
    &self.kind
  }

  /// The step every new workflow of this kind starts with.
  pub fn init_kind(&self) -> &StepKind {
    &self.init
  }

  /// Configuration for a declared step, `None` for absorbing or unknown kinds.
  pub fn config(&self, kind: &str) -> Option<&StepConfig> {
    self.steps.get(kind)
  }

  pub fn contains(&self, kind: &str) -> bool {
    self.steps.contains_key(kind)
  }

  /// Successors to schedule after `kind` finishes with the given transition.
  pub fn next(&self, kind: &str, transition: Transition) -> &[StepKind] {
    match (self.steps.get(kind), transition) {
      (Some(config), Transition::Success) => &config.on_success,
      (Some(config), Transition::Failure) => std::slice::from_ref(&config.on_failure),
      (None, _) => &[],
    }
  }

  /// Prior steps whose responses `kind` may read.
  pub fn read_sources(&self, kind: &str) -> &[StepKind] {
    self
      .steps
      .get(kind)
      .map(|c| c.read_data_from.as_slice())
      .unwrap_or(&[])
  }

  /// Name of the handler registered for `kind`.
  pub fn handler_name<'a>(&'a self, kind: &'a str) -> &'a str {
    self
      .steps
      .get(kind)
      .and_then(|c| c.handler.as_deref())
      .unwrap_or(kind)
  }

  /// All declared (non-absorbing) step kinds, sorted.
  pub fn kinds(&self) -> Vec<&StepKind> {
    let mut kinds: Vec<&StepKind> = self.steps.keys().collect();
    kinds.sort();
    kinds
  }

  /// Upper bound on the number of transitions from init to an absorbing step.
  pub fn max_hops(&self) -> usize {
    self.max_hops
  }

  /// Serializable form of this graph.
  pub fn to_def(&self) -> GraphDef {
    GraphDef {
      kind: self.kind.clone(),
      init: self.init.clone(),
      steps: self
        .steps
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect::<BTreeMap<_, _>>(),
    }
  }

  fn downstream(&self, kind: &str) -> &[StepKind] {
    self
      .adjacency
      .get(kind)
      .map(|v| v.as_slice())
      .unwrap_or(&[])
  }

  fn validate(&self) -> Result<(), GraphError> {
    if !self.steps.contains_key(&self.init) {
      return Err(GraphError::MissingInit(self.init.clone()));
    }

    for (kind, config) in self.sorted_steps() {
      if kind.is_absorbing() {
        return Err(GraphError::ReservedKind(kind.clone()));
      }
      if config.on_success.is_empty() {
        return Err(GraphError::DeadEnd(kind.clone()));
      }
      for to in config
        .on_success
        .iter()
        .chain(std::iter::once(&config.on_failure))
      {
        if !to.is_absorbing() && !self.steps.contains_key(to) {
          return Err(GraphError::UnknownTarget {
            from: kind.clone(),
            to: to.clone(),
          });
        }
      }
      for source in &config.read_data_from {
        if !self.steps.contains_key(source) {
          return Err(GraphError::UnknownReadSource {
            step: kind.clone(),
            source_kind: source.clone(),
          });
        }
      }
      if let Some(target) = &config.retry_from {
        if !self.steps.contains_key(target) {
          return Err(GraphError::UnknownRetryTarget {
            step: kind.clone(),
            target: target.clone(),
          });
        }
      }
    }

    self.check_acyclic()?;

    let reachable = self.reachable_from_init();
    if let Some((kind, _)) = self
      .sorted_steps()
      .into_iter()
      .find(|(kind, _)| !reachable.contains(*kind))
    {
      return Err(GraphError::Unreachable(kind.clone()));
    }

    Ok(())
  }

  fn sorted_steps(&self) -> Vec<(&StepKind, &StepConfig)> {
    let mut steps: Vec<_> = self.steps.iter().collect();
    steps.sort_by(|a, b| a.0.cmp(b.0));
    steps
  }

  fn check_acyclic(&self) -> Result<(), GraphError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
      Visiting,
      Done,
    }

    fn visit<'a>(
      graph: &'a StepGraph,
      kind: &'a StepKind,
      marks: &mut HashMap<&'a StepKind, Mark>,
    ) -> Result<(), GraphError> {
      match marks.get(kind) {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => return Err(GraphError::Cycle(kind.clone())),
        None => {}
      }
      marks.insert(kind, Mark::Visiting);
      for next in graph.downstream(kind.as_str()) {
        if !next.is_absorbing() {
          visit(graph, next, marks)?;
        }
      }
      marks.insert(kind, Mark::Done);
      Ok(())
    }

    let mut marks = HashMap::new();
    for (kind, _) in self.sorted_steps() {
      visit(self, kind, &mut marks)?;
    }
    Ok(())
  }

  fn reachable_from_init(&self) -> HashSet<&StepKind> {
    let mut seen = HashSet::new();
    let mut stack = vec![&self.init];
    while let Some(kind) = stack.pop() {
      if !seen.insert(kind) {
        continue;
      }
      stack.extend(self.downstream(kind.as_str()).iter().filter(|k| !k.is_absorbing()));
    }
    seen
  }

  /// Longest path length in edges; only called on a validated (acyclic) graph.
  fn longest_path(&self, kind: &StepKind, memo: &mut HashMap<StepKind, usize>) -> usize {
    if kind.is_absorbing() {
      return 0;
    }
    if let Some(hops) = memo.get(kind) {
      return *hops;
    }
    let hops = self
      .downstream(kind.as_str())
      .iter()
      .map(|next| 1 + self.longest_path(next, memo))
      .max()
      .unwrap_or(0);
    memo.insert(kind.clone(), hops);
    hops
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn kind(s: &str) -> StepKind {
    StepKind::new(s)
  }

  fn stake_graph() -> StepGraph {
    StepGraph::new(
      WorkflowKind::new("stake"),
      kind("init"),
      [
        (kind("init"), StepConfig::new(["approve"])),
        (
          kind("approve"),
          StepConfig::new(["mint"])
            .on_failure("rollback")
            .read_data_from(["init"]),
        ),
        (
          kind("mint"),
          StepConfig::new(["markSuccess"])
            .on_failure("rollback")
            .read_data_from(["approve"]),
        ),
        (kind("rollback"), StepConfig::new(["markFailure"])),
      ],
    )
    .unwrap()
  }

  #[test]
  fn test_next_follows_declared_edges() {
    let graph = stake_graph();

    assert_eq!(graph.next("init", Transition::Success), &[kind("approve")]);
    assert_eq!(graph.next("approve", Transition::Failure), &[kind("rollback")]);
    assert_eq!(graph.next("init", Transition::Failure), &[kind("markFailure")]);
    assert!(graph.next("markSuccess", Transition::Success).is_empty());
    assert!(graph.next("nope", Transition::Success).is_empty());
  }

  #[test]
  fn test_read_sources() {
    let graph = stake_graph();

    assert_eq!(graph.read_sources("mint"), &[kind("approve")]);
    assert!(graph.read_sources("init").is_empty());
  }

  #[test]
  fn test_handler_name_defaults_to_kind() {
    let graph = StepGraph::new(
      WorkflowKind::new("w"),
      kind("init"),
      [(kind("init"), StepConfig::new(["markSuccess"]).handler("noop"))],
    )
    .unwrap();

    assert_eq!(graph.handler_name("init"), "noop");
    assert_eq!(stake_graph().handler_name("approve"), "approve");
  }

  #[test]
  fn test_max_hops() {
    // init -> approve -> mint -> rollback -> markFailure
    assert_eq!(stake_graph().max_hops(), 4);
  }

  #[test]
  fn test_missing_init() {
    let err = StepGraph::new(
      WorkflowKind::new("w"),
      kind("init"),
      [(kind("other"), StepConfig::new(["markSuccess"]))],
    )
    .unwrap_err();

    assert!(matches!(err, GraphError::MissingInit(k) if k == kind("init")));
  }

  #[test]
  fn test_unknown_target() {
    let err = StepGraph::new(
      WorkflowKind::new("w"),
      kind("init"),
      [(kind("init"), StepConfig::new(["ghost"]))],
    )
    .unwrap_err();

    assert!(matches!(err, GraphError::UnknownTarget { to, .. } if to == kind("ghost")));
  }

  #[test]
  fn test_dead_end() {
    let err = StepGraph::new(
      WorkflowKind::new("w"),
      kind("init"),
      [(kind("init"), StepConfig::new(Vec::<StepKind>::new()))],
    )
    .unwrap_err();

    assert!(matches!(err, GraphError::DeadEnd(_)));
  }

  #[test]
  fn test_cycle_rejected() {
    let err = StepGraph::new(
      WorkflowKind::new("w"),
      kind("init"),
      [
        (kind("init"), StepConfig::new(["a"])),
        (kind("a"), StepConfig::new(["b"])),
        (kind("b"), StepConfig::new(["markSuccess"]).on_failure("a")),
      ],
    )
    .unwrap_err();

    assert!(matches!(err, GraphError::Cycle(_)));
  }

  #[test]
  fn test_unreachable_step() {
    let err = StepGraph::new(
      WorkflowKind::new("w"),
      kind("init"),
      [
        (kind("init"), StepConfig::new(["markSuccess"])),
        (kind("orphan"), StepConfig::new(["markSuccess"])),
      ],
    )
    .unwrap_err();

    assert!(matches!(err, GraphError::Unreachable(k) if k == kind("orphan")));
  }

  #[test]
  fn test_reserved_kind() {
    let err = StepGraph::new(
      WorkflowKind::new("w"),
      kind("init"),
      [
        (kind("init"), StepConfig::new(["markSuccess"])),
        (kind("markSuccess"), StepConfig::new(["markFailure"])),
      ],
    )
    .unwrap_err();

    assert!(matches!(err, GraphError::ReservedKind(_)));
  }

  #[test]
  fn test_unknown_read_source_and_retry_target() {
    let err = StepGraph::new(
      WorkflowKind::new("w"),
      kind("init"),
      [(
        kind("init"),
        StepConfig::new(["markSuccess"]).read_data_from(["ghost"]),
      )],
    )
    .unwrap_err();
    assert!(matches!(err, GraphError::UnknownReadSource { .. }));

    let err = StepGraph::new(
      WorkflowKind::new("w"),
      kind("init"),
      [(kind("init"), StepConfig::new(["markSuccess"]).retry_from("ghost"))],
    )
    .unwrap_err();
    assert!(matches!(err, GraphError::UnknownRetryTarget { .. }));
  }

  #[test]
  fn test_from_json_roundtrips_through_def() {
    let graph = stake_graph();
    let json = serde_json::to_string(&graph.to_def()).unwrap();
    let parsed = StepGraph::from_json(&json).unwrap();

    assert_eq!(parsed.to_def(), graph.to_def());
  }
}
