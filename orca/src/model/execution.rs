//! Pipeline executions and graph navigation over their stages.

use super::StageExecution;
use crate::core::{ContextMap, EpochMillis, ExecutionStatus, ExecutionType, SyntheticStageOwner};
use crate::errors::GraphValidationError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;
use uuid::Uuid;

/// Pause bookkeeping for an execution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PausedDetails {
    /// Who paused the execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused_by: Option<String>,
    /// When the execution was paused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause_time: Option<EpochMillis>,
    /// When the execution was resumed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_time: Option<EpochMillis>,
    /// Total time spent paused, filled in on resume.
    #[serde(default)]
    pub paused_ms: u64,
}

impl PausedDetails {
    /// True while paused and not yet resumed.
    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.pause_time.is_some() && self.resume_time.is_none()
    }
}

/// One run of a pipeline or orchestration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineExecution {
    /// Unique, time-ordered id (UUID v7).
    pub id: String,

    /// Pipeline or orchestration.
    #[serde(rename = "type")]
    pub execution_type: ExecutionType,

    /// Owning application.
    pub application: String,

    /// Display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Current status.
    #[serde(default)]
    pub status: ExecutionStatus,

    /// All stages, synthetic ones included, in display order.
    #[serde(default)]
    pub stages: Vec<StageExecution>,

    /// Set once a user cancels the execution.
    #[serde(default, rename = "canceled")]
    pub is_canceled: bool,

    /// Who canceled the execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub canceled_by: Option<String>,

    /// Why the execution was canceled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancellation_reason: Option<String>,

    /// When the execution was created.
    pub build_time: EpochMillis,

    /// When the execution started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<EpochMillis>,

    /// When the execution completed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<EpochMillis>,

    /// Pause bookkeeping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paused: Option<PausedDetails>,

    /// What triggered the execution.
    #[serde(default)]
    pub trigger: Value,
}

impl PipelineExecution {
    /// Creates a new, empty execution.
    #[must_use]
    pub fn new(execution_type: ExecutionType, application: impl Into<String>) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            execution_type,
            application: application.into(),
            name: None,
            status: ExecutionStatus::NotStarted,
            stages: Vec::new(),
            is_canceled: false,
            canceled_by: None,
            cancellation_reason: None,
            build_time: chrono::Utc::now().timestamp_millis(),
            start_time: None,
            end_time: None,
            paused: None,
            trigger: Value::Object(ContextMap::new()),
        }
    }

    /// Sets the name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Sets the trigger.
    #[must_use]
    pub fn with_trigger(mut self, trigger: Value) -> Self {
        self.trigger = trigger;
        self
    }

    /// Adds a stage, taking ownership of its execution id.
    #[must_use]
    pub fn with_stage(mut self, mut stage: StageExecution) -> Self {
        stage.execution_id.clone_from(&self.id);
        self.stages.push(stage);
        self
    }

    /// Looks up a stage by id.
    #[must_use]
    pub fn stage_by_id(&self, stage_id: &str) -> Option<&StageExecution> {
        self.stages.iter().find(|s| s.id == stage_id)
    }

    /// Looks up a stage by id for mutation.
    pub fn stage_mut(&mut self, stage_id: &str) -> Option<&mut StageExecution> {
        self.stages.iter_mut().find(|s| s.id == stage_id)
    }

    /// Looks up a stage by ref id.
    #[must_use]
    pub fn stage_by_ref_id(&self, ref_id: &str) -> Option<&StageExecution> {
        self.stages
            .iter()
            .find(|s| s.ref_id.as_deref() == Some(ref_id))
    }

    /// The parent of a synthetic stage.
    #[must_use]
    pub fn parent_of(&self, stage_id: &str) -> Option<&StageExecution> {
        let parent_id = self.stage_by_id(stage_id)?.parent_stage_id.as_deref()?;
        self.stage_by_id(parent_id)
    }

    /// The root ancestor of a stage (the stage itself when it has no parent).
    #[must_use]
    pub fn top_level_stage_of(&self, stage_id: &str) -> Option<&StageExecution> {
        let mut current = self.stage_by_id(stage_id)?;
        while let Some(parent_id) = current.parent_stage_id.as_deref() {
            current = self.stage_by_id(parent_id)?;
        }
        Some(current)
    }

    /// The nearest stage, starting with the stage itself and walking up its
    /// parents, that configures `stageTimeoutMs`.
    #[must_use]
    pub fn parent_with_timeout(&self, stage_id: &str) -> Option<&StageExecution> {
        let mut current = self.stage_by_id(stage_id);
        while let Some(stage) = current {
            if stage.timeout().is_some() {
                return Some(stage);
            }
            current = stage
                .parent_stage_id
                .as_deref()
                .and_then(|id| self.stage_by_id(id));
        }
        None
    }

    /// Synthetic children of a stage, in order.
    #[must_use]
    pub fn direct_children_of(&self, stage_id: &str) -> Vec<&StageExecution> {
        self.stages
            .iter()
            .filter(|s| s.parent_stage_id.as_deref() == Some(stage_id))
            .collect()
    }

    /// Synthetic stages that run before a stage's tasks.
    #[must_use]
    pub fn before_stages_of(&self, stage_id: &str) -> Vec<&StageExecution> {
        self.children_with_owner(stage_id, SyntheticStageOwner::Before)
    }

    /// Synthetic stages that run after a stage's tasks.
    #[must_use]
    pub fn after_stages_of(&self, stage_id: &str) -> Vec<&StageExecution> {
        self.children_with_owner(stage_id, SyntheticStageOwner::After)
    }

    fn children_with_owner(&self, stage_id: &str, owner: SyntheticStageOwner) -> Vec<&StageExecution> {
        self.stages
            .iter()
            .filter(|s| {
                s.parent_stage_id.as_deref() == Some(stage_id)
                    && s.synthetic_stage_owner == Some(owner)
            })
            .collect()
    }

    /// Stages whose outputs are visible to a stage, nearest first.
    ///
    /// The stage itself comes first. A stage with requisites sees the
    /// requisite stages, their synthetic children and their ancestors. A
    /// stage without requisites sees its parent and the parent's ancestors.
    #[must_use]
    pub fn ancestors_of(&self, stage_id: &str) -> Vec<&StageExecution> {
        let Some(stage) = self.stage_by_id(stage_id) else {
            return Vec::new();
        };
        let mut visited = HashSet::new();
        let mut ancestors = vec![stage];
        ancestors.extend(self.ancestors_only(stage, &mut visited));
        ancestors
    }

    fn ancestors_only<'a>(
        &'a self,
        stage: &'a StageExecution,
        visited: &mut HashSet<String>,
    ) -> Vec<&'a StageExecution> {
        visited.insert(stage.id.clone());

        if !stage.requisite_stage_ref_ids.is_empty() {
            let previous: Vec<&StageExecution> = self
                .stages
                .iter()
                .filter(|s| {
                    s.ref_id
                        .as_ref()
                        .is_some_and(|r| stage.requisite_stage_ref_ids.contains(r))
                        && !visited.contains(&s.id)
                })
                .collect();
            let previous_ids: HashSet<&str> = previous.iter().map(|s| s.id.as_str()).collect();
            let synthetic = self.stages.iter().filter(|s| {
                s.parent_stage_id
                    .as_deref()
                    .is_some_and(|p| previous_ids.contains(p))
            });

            let mut result: Vec<&StageExecution> = previous.clone();
            result.extend(synthetic);
            for prior in previous {
                result.extend(self.ancestors_only(prior, visited));
            }
            result
        } else if let Some(parent) = stage
            .parent_stage_id
            .as_deref()
            .filter(|id| !visited.contains(*id))
            .and_then(|id| self.stage_by_id(id))
        {
            let mut result = vec![parent];
            result.extend(self.ancestors_only(parent, visited));
            result
        } else {
            Vec::new()
        }
    }

    /// The context a task sees: ancestor outputs overlaid by the stage's own
    /// context, nearer ancestors winning over farther ones.
    #[must_use]
    pub fn merged_context_of(&self, stage_id: &str) -> ContextMap {
        let ancestors = self.ancestors_of(stage_id);
        let mut merged = ContextMap::new();
        for ancestor in ancestors.iter().skip(1).rev() {
            for (key, value) in &ancestor.outputs {
                merged.insert(key.clone(), value.clone());
            }
        }
        if let Some(stage) = ancestors.first() {
            for (key, value) in &stage.context {
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// A copy of the stage whose context is the merged context.
    #[must_use]
    pub fn stage_with_merged_context(&self, stage_id: &str) -> Option<StageExecution> {
        let mut stage = self.stage_by_id(stage_id)?.clone();
        stage.context = self.merged_context_of(stage_id);
        Some(stage)
    }

    /// Top-level stages in dependency order.
    ///
    /// Fails on duplicate ref ids, requisites that name no stage, and cycles.
    pub fn top_level_stages(&self) -> Result<Vec<&StageExecution>, GraphValidationError> {
        let roots: Vec<&StageExecution> = self
            .stages
            .iter()
            .filter(|s| s.parent_stage_id.is_none())
            .collect();

        let mut by_ref: HashMap<&str, usize> = HashMap::new();
        for (index, stage) in roots.iter().enumerate() {
            if let Some(ref_id) = stage.ref_id.as_deref() {
                if by_ref.insert(ref_id, index).is_some() {
                    return Err(GraphValidationError::new(format!(
                        "Duplicate stage ref id '{ref_id}'"
                    ))
                    .with_stages(vec![ref_id.to_string()])
                    .with_code("GRAPH-DUPLICATE-REF"));
                }
            }
        }

        let mut in_degree = vec![0usize; roots.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); roots.len()];
        for (index, stage) in roots.iter().enumerate() {
            for requisite in &stage.requisite_stage_ref_ids {
                let Some(&upstream) = by_ref.get(requisite.as_str()) else {
                    return Err(GraphValidationError::new(format!(
                        "Stage '{}' requires unknown stage '{requisite}'",
                        stage.name
                    ))
                    .with_stages(vec![stage.id.clone()])
                    .with_code("GRAPH-UNKNOWN-REQUISITE"));
                };
                in_degree[index] += 1;
                dependents[upstream].push(index);
            }
        }

        let mut ready: VecDeque<usize> = (0..roots.len()).filter(|i| in_degree[*i] == 0).collect();
        let mut ordered = Vec::with_capacity(roots.len());
        while let Some(index) = ready.pop_front() {
            ordered.push(roots[index]);
            for &next in &dependents[index] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.push_back(next);
                }
            }
        }

        if ordered.len() != roots.len() {
            let cyclic = roots
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, s)| s.id.clone())
                .collect();
            return Err(GraphValidationError::new("Stage requisites form a cycle")
                .with_stages(cyclic)
                .with_code("GRAPH-CYCLE"));
        }
        Ok(ordered)
    }

    /// Top-level stages that list this stage as a requisite.
    #[must_use]
    pub fn downstream_stages_of(&self, stage_id: &str) -> Vec<&StageExecution> {
        let Some(ref_id) = self.stage_by_id(stage_id).and_then(|s| s.ref_id.as_deref()) else {
            return Vec::new();
        };
        self.stages
            .iter()
            .filter(|s| s.parent_stage_id.is_none() && s.requisite_stage_ref_ids.iter().any(|r| r == ref_id))
            .collect()
    }

    /// Stages named by a stage's requisites.
    #[must_use]
    pub fn upstream_stages_of(&self, stage_id: &str) -> Vec<&StageExecution> {
        let Some(stage) = self.stage_by_id(stage_id) else {
            return Vec::new();
        };
        stage
            .requisite_stage_ref_ids
            .iter()
            .filter_map(|r| self.stage_by_ref_id(r))
            .collect()
    }

    /// Inserts a planned synthetic stage next to its parent.
    ///
    /// Before stages land ahead of the parent, after stages behind the
    /// parent's last descendant, so repeated inserts keep declaration order.
    pub fn insert_synthetic(&mut self, mut stage: StageExecution) -> Result<(), GraphValidationError> {
        stage.validate_synthetic_linkage()?;
        let (Some(parent_id), Some(owner)) = (stage.parent_stage_id.clone(), stage.synthetic_stage_owner)
        else {
            return Err(GraphValidationError::new(format!(
                "Stage {} is not a synthetic stage",
                stage.id
            )));
        };
        let parent_index = self
            .stages
            .iter()
            .position(|s| s.id == parent_id)
            .ok_or_else(|| GraphValidationError::unknown_stage(&parent_id))?;

        stage.execution_id.clone_from(&self.id);
        match owner {
            SyntheticStageOwner::Before => self.stages.insert(parent_index, stage),
            SyntheticStageOwner::After => {
                let index = self.last_descendant_index(&parent_id).unwrap_or(parent_index);
                self.stages.insert(index + 1, stage);
            }
        }
        Ok(())
    }

    fn last_descendant_index(&self, stage_id: &str) -> Option<usize> {
        let mut last = self.stages.iter().position(|s| s.id == stage_id)?;
        for (index, stage) in self.stages.iter().enumerate() {
            if self.descends_from(stage, stage_id) {
                last = last.max(index);
            }
        }
        Some(last)
    }

    fn descends_from(&self, stage: &StageExecution, ancestor_id: &str) -> bool {
        let mut current = stage.parent_stage_id.as_deref();
        while let Some(id) = current {
            if id == ancestor_id {
                return true;
            }
            current = self.stage_by_id(id).and_then(|s| s.parent_stage_id.as_deref());
        }
        false
    }

    /// Marks the execution as canceled.
    pub fn cancel(&mut self, user: Option<&str>, reason: Option<&str>) {
        self.is_canceled = true;
        self.canceled_by = user.map(str::to_string);
        self.cancellation_reason = reason.map(str::to_string);
    }

    /// Pauses the execution.
    pub fn pause(&mut self, user: Option<&str>, now: EpochMillis) {
        self.status = ExecutionStatus::Paused;
        self.paused = Some(PausedDetails {
            paused_by: user.map(str::to_string),
            pause_time: Some(now),
            resume_time: None,
            paused_ms: 0,
        });
    }

    /// Resumes a paused execution, recording how long it was paused.
    pub fn resume(&mut self, now: EpochMillis) {
        if let Some(paused) = self.paused.as_mut() {
            if let Some(pause_time) = paused.pause_time {
                paused.resume_time = Some(now);
                paused.paused_ms = u64::try_from(now - pause_time).unwrap_or(0);
            }
        }
        if self.status == ExecutionStatus::Paused {
            self.status = ExecutionStatus::Running;
        }
    }

    /// Time spent paused, counted only when the pause began after `instant`.
    #[must_use]
    pub fn paused_duration_relative_to(&self, instant: EpochMillis) -> Duration {
        match &self.paused {
            Some(paused) if paused.pause_time.is_some_and(|t| t > instant) => {
                Duration::from_millis(paused.paused_ms)
            }
            _ => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn stage(stage_type: &str, ref_id: &str) -> StageExecution {
        StageExecution::new("", stage_type, stage_type, ContextMap::new()).with_ref_id(ref_id)
    }

    fn names(stages: &[&StageExecution]) -> Vec<String> {
        stages.iter().map(|s| s.name.clone()).collect()
    }

    #[test]
    fn test_with_stage_sets_execution_id() {
        let execution = PipelineExecution::new(ExecutionType::Pipeline, "app").with_stage(stage("wait", "1"));
        assert_eq!(execution.stages[0].execution_id, execution.id);
    }

    #[test]
    fn test_top_level_stages_topological() {
        let execution = PipelineExecution::new(ExecutionType::Pipeline, "app")
            .with_stage(stage("c", "3").with_requisites(["1", "2"]))
            .with_stage(stage("a", "1"))
            .with_stage(stage("b", "2").with_requisites(["1"]));

        let ordered = execution.top_level_stages().unwrap();
        assert_eq!(names(&ordered), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_top_level_stages_rejects_unknown_requisite() {
        let execution = PipelineExecution::new(ExecutionType::Pipeline, "app")
            .with_stage(stage("a", "1").with_requisites(["9"]));
        let err = execution.top_level_stages().unwrap_err();
        assert_eq!(err.code.as_deref(), Some("GRAPH-UNKNOWN-REQUISITE"));
    }

    #[test]
    fn test_top_level_stages_rejects_cycle() {
        let execution = PipelineExecution::new(ExecutionType::Pipeline, "app")
            .with_stage(stage("a", "1").with_requisites(["2"]))
            .with_stage(stage("b", "2").with_requisites(["1"]));
        let err = execution.top_level_stages().unwrap_err();
        assert_eq!(err.code.as_deref(), Some("GRAPH-CYCLE"));
        assert_eq!(err.stages.len(), 2);
    }

    #[test]
    fn test_top_level_stages_rejects_duplicate_ref() {
        let execution = PipelineExecution::new(ExecutionType::Pipeline, "app")
            .with_stage(stage("a", "1"))
            .with_stage(stage("b", "1"));
        assert!(execution.top_level_stages().is_err());
    }

    #[test]
    fn test_insert_synthetic_keeps_order() {
        let parent = stage("parent", "1");
        let parent_id = parent.id.clone();
        let mut execution = PipelineExecution::new(ExecutionType::Pipeline, "app")
            .with_stage(parent)
            .with_stage(stage("next", "2").with_requisites(["1"]));

        for name in ["b1", "b2"] {
            let s = StageExecution::new("", name, name, ContextMap::new())
                .with_parent(&parent_id, SyntheticStageOwner::Before);
            execution.insert_synthetic(s).unwrap();
        }
        for name in ["a1", "a2"] {
            let s = StageExecution::new("", name, name, ContextMap::new())
                .with_parent(&parent_id, SyntheticStageOwner::After);
            execution.insert_synthetic(s).unwrap();
        }

        let order: Vec<&str> = execution.stages.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(order, vec!["b1", "b2", "parent", "a1", "a2", "next"]);
        assert_eq!(names(&execution.before_stages_of(&parent_id)), vec!["b1", "b2"]);
        assert_eq!(names(&execution.after_stages_of(&parent_id)), vec!["a1", "a2"]);
        assert!(execution.stages.iter().all(|s| s.execution_id == execution.id));
    }

    #[test]
    fn test_parent_with_timeout_walks_up() {
        let parent = stage("parent", "1").with_context_entry("stageTimeoutMs", 1000);
        let parent_id = parent.id.clone();
        let child = StageExecution::new("", "child", "child", ContextMap::new())
            .with_parent(&parent_id, SyntheticStageOwner::Before);
        let child_id = child.id.clone();
        let grandchild = StageExecution::new("", "grandchild", "grandchild", ContextMap::new())
            .with_parent(&child_id, SyntheticStageOwner::After);
        let grandchild_id = grandchild.id.clone();

        let execution = PipelineExecution::new(ExecutionType::Pipeline, "app")
            .with_stage(child)
            .with_stage(parent)
            .with_stage(grandchild);

        assert_eq!(execution.parent_with_timeout(&grandchild_id).unwrap().id, parent_id);
        assert_eq!(execution.top_level_stage_of(&grandchild_id).unwrap().id, parent_id);
        assert_eq!(execution.parent_of(&grandchild_id).unwrap().id, child_id);
    }

    #[test]
    fn test_merged_context_prefers_nearest() {
        let mut first = stage("first", "1");
        first.outputs.insert("image".into(), json!("old"));
        first.outputs.insert("region".into(), json!("us-east-1"));
        let mut second = stage("second", "2").with_requisites(["1"]);
        second.outputs.insert("image".into(), json!("new"));
        let third = stage("third", "3")
            .with_requisites(["2"])
            .with_context_entry("region", "eu-west-1");
        let third_id = third.id.clone();

        let execution = PipelineExecution::new(ExecutionType::Pipeline, "app")
            .with_stage(first)
            .with_stage(second)
            .with_stage(third);

        let ancestors = execution.ancestors_of(&third_id);
        assert_eq!(names(&ancestors), vec!["third", "second", "first"]);

        let merged = execution.merged_context_of(&third_id);
        assert_eq!(merged["image"], json!("new"));
        assert_eq!(merged["region"], json!("eu-west-1"));
    }

    #[test]
    fn test_ancestors_of_synthetic_include_parent() {
        let mut parent = stage("parent", "1");
        parent.outputs.insert("cluster".into(), json!("app-main"));
        let parent_id = parent.id.clone();
        let child = StageExecution::new("", "child", "child", ContextMap::new())
            .with_parent(&parent_id, SyntheticStageOwner::Before);
        let child_id = child.id.clone();

        let execution = PipelineExecution::new(ExecutionType::Pipeline, "app")
            .with_stage(child)
            .with_stage(parent);

        assert_eq!(names(&execution.ancestors_of(&child_id)), vec!["child", "parent"]);
        assert_eq!(execution.merged_context_of(&child_id)["cluster"], json!("app-main"));
    }

    #[test]
    fn test_paused_duration_only_counts_later_pauses() {
        let mut execution = PipelineExecution::new(ExecutionType::Pipeline, "app");
        execution.status = ExecutionStatus::Running;
        execution.pause(Some("alice"), 1_000);
        assert_eq!(execution.status, ExecutionStatus::Paused);
        execution.resume(4_000);
        assert_eq!(execution.status, ExecutionStatus::Running);

        assert_eq!(execution.paused_duration_relative_to(500), Duration::from_millis(3_000));
        assert_eq!(execution.paused_duration_relative_to(2_000), Duration::ZERO);
    }

    #[test]
    fn test_cancel() {
        let mut execution = PipelineExecution::new(ExecutionType::Orchestration, "app");
        execution.cancel(Some("bob"), Some("wrong cluster"));
        assert!(execution.is_canceled);
        assert_eq!(execution.canceled_by.as_deref(), Some("bob"));

        let json = serde_json::to_value(&execution).unwrap();
        assert_eq!(json["canceled"], true);
        assert_eq!(json["type"], "ORCHESTRATION");
    }

    #[test]
    fn test_downstream_and_upstream() {
        let a = stage("a", "1");
        let a_id = a.id.clone();
        let b = stage("b", "2").with_requisites(["1"]);
        let b_id = b.id.clone();
        let execution = PipelineExecution::new(ExecutionType::Pipeline, "app")
            .with_stage(a)
            .with_stage(b);

        assert_eq!(names(&execution.downstream_stages_of(&a_id)), vec!["b"]);
        assert_eq!(names(&execution.upstream_stages_of(&b_id)), vec!["a"]);
    }
}
