//! Builder for synthetic stages injected around a parent stage.

use crate::core::{ContextMap, SyntheticStageOwner};
use crate::model::StageExecution;
use tracing::debug;

/// Accumulates synthetic stages before or after a parent stage.
///
/// Every stage that goes through the builder gets the parent's id, the
/// builder's owner and a ref id derived from the parent's ref id
/// (`1<1`, `1<2` for before stages, `1>1` for after stages). `append` also
/// links the new stage after the previously added one so the stages run in
/// declaration order; `add` leaves the stage unlinked so it can start a
/// parallel branch.
///
/// # Example
///
/// ```
/// use orca::prelude::*;
///
/// let parent = StageExecution::new("exec", "deploy", "Deploy", ContextMap::new())
///     .with_ref_id("1");
/// let mut graph = StageGraphBuilder::after_stages(&parent);
/// graph.append(|stage| {
///     stage.stage_type = "wait".into();
///     stage.name = "Wait".into();
/// });
/// graph.append(|stage| {
///     stage.stage_type = "updatePipeline".into();
///     stage.name = "Update".into();
/// });
///
/// let stages: Vec<_> = graph.build().collect();
/// assert_eq!(stages[1].requisite_stage_ref_ids, vec!["1>1".to_string()]);
/// ```
#[derive(Debug)]
pub struct StageGraphBuilder {
    parent_id: String,
    parent_ref_id: String,
    execution_id: String,
    owner: SyntheticStageOwner,
    existing: usize,
    stages: Vec<StageExecution>,
    last_added: Option<usize>,
}

impl StageGraphBuilder {
    fn new(parent: &StageExecution, owner: SyntheticStageOwner) -> Self {
        Self {
            parent_id: parent.id.clone(),
            parent_ref_id: parent.ref_id.clone().unwrap_or_else(|| parent.id.clone()),
            execution_id: parent.execution_id.clone(),
            owner,
            existing: 0,
            stages: Vec::new(),
            last_added: None,
        }
    }

    /// Creates a builder for stages that run before `parent`'s tasks.
    #[must_use]
    pub fn before_stages(parent: &StageExecution) -> Self {
        Self::new(parent, SyntheticStageOwner::Before)
    }

    /// Creates a builder for stages that run after `parent`'s tasks.
    #[must_use]
    pub fn after_stages(parent: &StageExecution) -> Self {
        Self::new(parent, SyntheticStageOwner::After)
    }

    /// Offsets generated ref ids past siblings already in the execution.
    #[must_use]
    pub fn with_existing_count(mut self, existing: usize) -> Self {
        self.existing = existing;
        self
    }

    /// The owner assigned to every built stage.
    #[must_use]
    pub fn owner(&self) -> SyntheticStageOwner {
        self.owner
    }

    /// Id of the parent stage.
    #[must_use]
    pub fn parent_id(&self) -> &str {
        &self.parent_id
    }

    /// Creates a new stage configured by `init` without linking it.
    pub fn add<F>(&mut self, init: F) -> &StageExecution
    where
        F: FnOnce(&mut StageExecution),
    {
        let mut stage = StageExecution::new(self.execution_id.clone(), "", "", ContextMap::new());
        init(&mut stage);
        self.add_stage(stage)
    }

    /// Adds an already-constructed stage without linking it.
    pub fn add_stage(&mut self, mut stage: StageExecution) -> &StageExecution {
        stage.parent_stage_id = Some(self.parent_id.clone());
        stage.synthetic_stage_owner = Some(self.owner);
        stage.execution_id.clone_from(&self.execution_id);
        stage.ref_id = Some(self.next_ref_id());

        debug!(
            parent_id = %self.parent_id,
            owner = %self.owner,
            stage_type = %stage.stage_type,
            ref_id = ?stage.ref_id,
            "Adding synthetic stage"
        );

        self.stages.push(stage);
        let index = self.stages.len() - 1;
        self.last_added = Some(index);
        &self.stages[index]
    }

    /// Creates a new stage configured by `init`, linked after the last added stage.
    pub fn append<F>(&mut self, init: F) -> &StageExecution
    where
        F: FnOnce(&mut StageExecution),
    {
        let mut stage = StageExecution::new(self.execution_id.clone(), "", "", ContextMap::new());
        init(&mut stage);
        self.append_stage(stage)
    }

    /// Adds an already-constructed stage, linked after the last added stage.
    pub fn append_stage(&mut self, stage: StageExecution) -> &StageExecution {
        let previous = self.last_added;
        self.add_stage(stage);
        let index = self.stages.len() - 1;
        if let Some(previous) = previous {
            self.link(previous, index);
        }
        &self.stages[index]
    }

    /// Adds an edge so that the stage with id `next` waits for `previous`.
    ///
    /// Returns false if either stage was not added through this builder.
    pub fn connect(&mut self, previous: &str, next: &str) -> bool {
        let previous = self.stages.iter().position(|s| s.id == previous);
        let next = self.stages.iter().position(|s| s.id == next);
        match (previous, next) {
            (Some(previous), Some(next)) => {
                self.link(previous, next);
                true
            }
            _ => false,
        }
    }

    /// The most recently added stage.
    #[must_use]
    pub fn last_added(&self) -> Option<&StageExecution> {
        self.last_added.map(|i| &self.stages[i])
    }

    /// Number of stages added so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns true if no stages were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Consumes the builder, yielding stages in declaration order.
    pub fn build(self) -> impl Iterator<Item = StageExecution> {
        self.stages.into_iter()
    }

    fn link(&mut self, previous: usize, next: usize) {
        let Some(ref_id) = self.stages[previous].ref_id.clone() else {
            return;
        };
        let requisites = &mut self.stages[next].requisite_stage_ref_ids;
        if !requisites.contains(&ref_id) {
            requisites.push(ref_id);
        }
    }

    fn next_ref_id(&self) -> String {
        format!(
            "{}{}{}",
            self.parent_ref_id,
            self.owner.ref_id_separator(),
            self.existing + self.stages.len() + 1
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn parent() -> StageExecution {
        StageExecution::new("exec-1", "deploy", "Deploy", ContextMap::new()).with_ref_id("1")
    }

    #[test]
    fn test_after_builder_preserves_declaration_order() {
        let parent = parent();
        let mut graph = StageGraphBuilder::after_stages(&parent);
        for i in 0..5 {
            graph.append(|stage| {
                stage.stage_type = "wait".into();
                stage.name = format!("wait-{i}");
            });
        }

        let stages: Vec<StageExecution> = graph.build().collect();
        assert_eq!(stages.len(), 5);
        for (i, stage) in stages.iter().enumerate() {
            assert_eq!(stage.name, format!("wait-{i}"));
            assert_eq!(stage.parent_stage_id.as_deref(), Some(parent.id.as_str()));
            assert_eq!(stage.synthetic_stage_owner, Some(SyntheticStageOwner::After));
            assert_eq!(stage.execution_id, "exec-1");
            assert_eq!(stage.ref_id.as_deref(), Some(format!("1>{}", i + 1).as_str()));
        }
        assert!(stages[0].requisite_stage_ref_ids.is_empty());
        assert_eq!(stages[3].requisite_stage_ref_ids, vec!["1>3".to_string()]);
    }

    #[test]
    fn test_before_builder_marks_owner() {
        let parent = parent();
        let mut graph = StageGraphBuilder::before_stages(&parent);
        graph.add(|stage| stage.stage_type = "disableCluster".into());

        let stages: Vec<StageExecution> = graph.build().collect();
        assert_eq!(stages.len(), 1);
        assert_eq!(stages[0].synthetic_stage_owner, Some(SyntheticStageOwner::Before));
        assert_eq!(stages[0].ref_id.as_deref(), Some("1<1"));
    }

    #[test]
    fn test_add_leaves_stages_parallel_and_connect_links() {
        let parent = parent();
        let mut graph = StageGraphBuilder::after_stages(&parent);
        let a = graph.add(|s| s.name = "a".into()).id.clone();
        let b = graph.add(|s| s.name = "b".into()).id.clone();
        let join = graph.add(|s| s.name = "join".into()).id.clone();

        assert!(graph.connect(&a, &join));
        assert!(graph.connect(&b, &join));
        assert!(graph.connect(&b, &join));
        assert!(!graph.connect("missing", &join));
        assert_eq!(graph.last_added().map(|s| s.name.as_str()), Some("join"));

        let stages: Vec<StageExecution> = graph.build().collect();
        assert!(stages[1].requisite_stage_ref_ids.is_empty());
        assert_eq!(stages[2].requisite_stage_ref_ids, vec!["1>1".to_string(), "1>2".to_string()]);
    }

    #[test]
    fn test_append_stage_relinks_constructed_stage() {
        let parent = parent();
        let foreign = StageExecution::new("other-exec", "wait", "Wait", ContextMap::new())
            .with_ref_id("99");

        let mut graph = StageGraphBuilder::before_stages(&parent).with_existing_count(2);
        graph.append_stage(foreign);

        let stage = graph.build().next().unwrap();
        assert_eq!(stage.execution_id, "exec-1");
        assert_eq!(stage.ref_id.as_deref(), Some("1<3"));
        assert_eq!(stage.parent_stage_id.as_deref(), Some(parent.id.as_str()));
    }

    #[test]
    fn test_empty_builder() {
        let graph = StageGraphBuilder::after_stages(&parent());
        assert!(graph.is_empty());
        assert_eq!(graph.build().count(), 0);
    }
}
