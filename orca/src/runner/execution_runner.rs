//! In-process driver for whole executions.
//!
//! Stages are scheduled as soon as their requisite stages have completed
//! without halting, so independent branches run concurrently. Each stage is
//! planned when it starts, runs its before stages, its tasks and then the
//! after stages planned from what the tasks produced, and on TERMINAL also the stages its definition contributes for
//! failure handling. Synthetic stages are scheduled the same way within
//! their parent.
//!
//! The execution is shared between branches behind a mutex that is only
//! held for reads and writes, never across an await.

use super::clock::Clock;
use super::task_runner::{RunOutcome, TaskAttempt, TaskRunner};
use crate::core::{ExecutionStatus, ExecutionType, SyntheticStageOwner};
use crate::errors::{exception_details, GraphValidationError, OrcaError};
use crate::events::{EventSink, ExecutionEvent};
use crate::graph::StagePlanner;
use crate::model::{context_keys, PipelineExecution, StageExecution};
use crate::observability::StageSpanAttributes;
use crate::repository::ExecutionRepository;
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn, Instrument};

#[derive(Debug)]
struct RunState {
    execution: PipelineExecution,
    planned: HashSet<String>,
}

type SharedState = Arc<Mutex<RunState>>;

/// Runs executions to completion.
pub struct ExecutionRunner {
    repository: Arc<dyn ExecutionRepository>,
    planner: StagePlanner,
    task_runner: TaskRunner,
    clock: Arc<dyn Clock>,
    events: Arc<dyn EventSink>,
    running: DashMap<String, SharedState>,
}

impl std::fmt::Debug for ExecutionRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRunner")
            .field("planner", &self.planner)
            .field("task_runner", &self.task_runner)
            .field("running", &self.running.len())
            .finish_non_exhaustive()
    }
}

impl ExecutionRunner {
    /// Creates a new execution runner.
    #[must_use]
    pub fn new(
        repository: Arc<dyn ExecutionRepository>,
        planner: StagePlanner,
        task_runner: TaskRunner,
        clock: Arc<dyn Clock>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            repository,
            planner,
            task_runner,
            clock,
            events,
            running: DashMap::new(),
        }
    }

    /// The repository executions are written to.
    #[must_use]
    pub fn repository(&self) -> &Arc<dyn ExecutionRepository> {
        &self.repository
    }

    /// Returns true while the execution is being driven by this runner.
    #[must_use]
    pub fn is_running(&self, execution_id: &str) -> bool {
        self.running.contains_key(execution_id)
    }

    /// A copy of the live state of a running execution.
    #[must_use]
    pub fn snapshot(&self, execution_id: &str) -> Option<PipelineExecution> {
        let state = self.state(execution_id)?;
        let snapshot = state.lock().execution.clone();
        Some(snapshot)
    }

    /// Validates, stores and runs an execution, returning its final state.
    ///
    /// Validation errors are returned before anything is stored or run.
    /// Failures while running are recorded on the stages and the
    /// execution status instead.
    pub async fn start(&self, mut execution: PipelineExecution) -> Result<PipelineExecution, OrcaError> {
        self.planner.validate(&execution)?;
        let top_level: Vec<String> = execution
            .top_level_stages()?
            .into_iter()
            .map(|s| s.id.clone())
            .collect();

        execution.status = ExecutionStatus::Running;
        execution.start_time = Some(self.clock.now_millis());
        self.repository.store(&execution).await?;

        let execution_id = execution.id.clone();
        let span = tracing::info_span!(
            "execution",
            execution_id = %execution_id,
            application = %execution.application
        );
        info!(parent: &span, stages = top_level.len(), "Starting execution");
        self.events
            .emit(&ExecutionEvent::ExecutionStarted {
                execution_id: execution_id.clone(),
                application: execution.application.clone(),
            })
            .await;

        let state: SharedState = Arc::new(Mutex::new(RunState {
            execution,
            planned: HashSet::new(),
        }));
        self.running.insert(execution_id.clone(), state.clone());
        let result = self.run_graph(&state, top_level.clone(), true).instrument(span).await;
        self.running.remove(&execution_id);
        result?;

        let execution = {
            let mut guard = state.lock();
            let execution = &mut guard.execution;
            let status = if execution.is_canceled {
                ExecutionStatus::Canceled
            } else {
                ExecutionStatus::for_execution(
                    top_level
                        .iter()
                        .filter_map(|id| execution.stage_by_id(id))
                        .map(|s| s.status),
                )
            };
            execution.status = status;
            execution.end_time = Some(self.clock.now_millis());
            execution.clone()
        };

        self.repository.store(&execution).await?;
        info!(execution_id = %execution.id, status = %execution.status, "Execution complete");
        self.events
            .emit(&ExecutionEvent::ExecutionCompleted {
                execution_id: execution.id.clone(),
                status: execution.status,
            })
            .await;
        Ok(execution)
    }

    /// Cancels an execution.
    ///
    /// Running tasks observe the cancellation on their next attempt and
    /// their `on_cancel` hooks run; stages not yet started never start.
    pub async fn cancel(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        user: Option<&str>,
        reason: Option<&str>,
    ) -> Result<(), OrcaError> {
        if let Some(state) = self.state(execution_id) {
            state.lock().execution.cancel(user, reason);
        }
        info!(execution_id, canceled_by = ?user, reason = ?reason, "Canceling execution");
        self.repository
            .cancel(
                execution_type,
                execution_id,
                user.map(str::to_string),
                reason.map(str::to_string),
            )
            .await?;
        Ok(())
    }

    /// Pauses an execution; tasks stop being invoked until it resumes.
    pub async fn pause(
        &self,
        execution_type: ExecutionType,
        execution_id: &str,
        user: Option<&str>,
    ) -> Result<(), OrcaError> {
        let now = self.clock.now_millis();
        if let Some(state) = self.state(execution_id) {
            state.lock().execution.pause(user, now);
        }
        self.repository
            .pause(execution_type, execution_id, user.map(str::to_string), now)
            .await?;
        Ok(())
    }

    /// Resumes a paused execution.
    pub async fn resume(&self, execution_type: ExecutionType, execution_id: &str) -> Result<(), OrcaError> {
        let now = self.clock.now_millis();
        if let Some(state) = self.state(execution_id) {
            state.lock().execution.resume(now);
        }
        self.repository.resume(execution_type, execution_id, now).await?;
        Ok(())
    }

    fn state(&self, execution_id: &str) -> Option<SharedState> {
        self.running.get(execution_id).map(|entry| entry.value().clone())
    }

    /// Runs a set of sibling stages honoring their requisites.
    ///
    /// A stage starts once every requisite in the set has completed without
    /// halting. Nothing new starts after a halt or once the execution is
    /// canceled. For top-level stages a TERMINAL or CANCELED stage also
    /// marks the execution so running branches wind down.
    fn run_graph<'a>(
        &'a self,
        state: &'a SharedState,
        stage_ids: Vec<String>,
        top_level: bool,
    ) -> BoxFuture<'a, Result<ExecutionStatus, OrcaError>> {
        async move {
            if stage_ids.is_empty() {
                return Ok(ExecutionStatus::Succeeded);
            }

            let (refs, requisites) = {
                let guard = state.lock();
                let mut refs = HashMap::new();
                let mut requisites = HashMap::new();
                for id in &stage_ids {
                    let stage = guard
                        .execution
                        .stage_by_id(id)
                        .ok_or_else(|| GraphValidationError::unknown_stage(id))?;
                    refs.insert(stage.ref_id.clone().unwrap_or_else(|| stage.id.clone()), id.clone());
                    requisites.insert(id.clone(), stage.requisite_stage_ref_ids.clone());
                }
                (refs, requisites)
            };

            let mut pending: Vec<String> = stage_ids;
            let mut finished: HashMap<String, ExecutionStatus> = HashMap::new();
            let mut in_flight = FuturesUnordered::new();
            let mut halted = false;

            loop {
                if !halted && !self.is_winding_down(state) {
                    let (ready, waiting): (Vec<String>, Vec<String>) = pending.into_iter().partition(|id| {
                        requisites[id]
                            .iter()
                            .filter_map(|ref_id| refs.get(ref_id))
                            .all(|upstream| finished.get(upstream).is_some_and(|s| allows_downstream(*s)))
                    });
                    pending = waiting;
                    for id in ready {
                        let future = self.run_stage(state, id.clone());
                        in_flight.push(async move { (id, future.await) });
                    }
                }

                let Some((id, result)) = in_flight.next().await else {
                    break;
                };
                let status = result?;
                debug!(stage_id = %id, status = %status, "Stage finished");
                finished.insert(id, status);

                if matches!(status, ExecutionStatus::Terminal | ExecutionStatus::Canceled) {
                    halted = true;
                    if top_level {
                        let mut guard = state.lock();
                        if !guard.execution.status.is_complete() {
                            guard.execution.status = status;
                        }
                    }
                }
            }

            if !pending.is_empty() {
                debug!(not_started = pending.len(), "Stages left unstarted");
            }
            Ok(ExecutionStatus::aggregate(finished.into_values()))
        }
        .boxed()
    }

    fn is_winding_down(&self, state: &SharedState) -> bool {
        let guard = state.lock();
        guard.execution.is_canceled || guard.execution.status.is_complete()
    }

    /// Runs one stage and everything it contributes.
    fn run_stage<'a>(&'a self, state: &'a SharedState, stage_id: String) -> BoxFuture<'a, Result<ExecutionStatus, OrcaError>> {
        async move {
            let (already_done, manually_skipped) = {
                let guard = state.lock();
                let stage = guard
                    .execution
                    .stage_by_id(&stage_id)
                    .ok_or_else(|| GraphValidationError::unknown_stage(&stage_id))?;
                (
                    stage.status.is_complete().then_some(stage.status),
                    self.planner.is_manually_skipped(stage),
                )
            };
            if let Some(status) = already_done {
                return Ok(status);
            }

            if let Err(err) = self.ensure_planned(state, &stage_id).await {
                warn!(stage_id = %stage_id, error = %err, "Stage planning failed");
                let details = match &err {
                    OrcaError::Validation(validation) => validation.to_details(),
                    other => exception_details("PlanningError", &other.to_string(), HashMap::new()),
                };
                let stage = {
                    let mut guard = state.lock();
                    let now = self.clock.now_millis();
                    let stage = guard
                        .execution
                        .stage_mut(&stage_id)
                        .ok_or_else(|| GraphValidationError::unknown_stage(&stage_id))?;
                    stage.context.insert(context_keys::EXCEPTION.to_string(), details);
                    let status = stage.failure_status(ExecutionStatus::Terminal);
                    stage.start(now);
                    stage.complete(status, now);
                    stage.clone()
                };
                self.repository.store_stage(&stage).await?;
                self.emit_stage_completed(&stage).await;
                return Ok(stage.status);
            }

            let stage = self.update_stage(state, &stage_id, |stage, now| stage.start(now))?;
            self.repository.store_stage(&stage).await?;
            self.events
                .emit(&ExecutionEvent::StageStarted {
                    execution_id: stage.execution_id.clone(),
                    stage_id: stage.id.clone(),
                    stage_type: stage.stage_type.clone(),
                })
                .await;

            let span = StageSpanAttributes::for_stage(&stage).span();
            let status = self
                .run_stage_body(state, &stage_id, manually_skipped)
                .instrument(span)
                .await?;

            let stage = self.update_stage(state, &stage_id, |stage, now| stage.complete(status, now))?;
            self.repository.store_stage(&stage).await?;
            self.emit_stage_completed(&stage).await;
            Ok(status)
        }
        .boxed()
    }

    async fn run_stage_body(
        &self,
        state: &SharedState,
        stage_id: &str,
        manually_skipped: bool,
    ) -> Result<ExecutionStatus, OrcaError> {
        if manually_skipped {
            info!("Stage was manually skipped");
            return Ok(ExecutionStatus::Skipped);
        }

        let before = self.children(state, stage_id, SyntheticStageOwner::Before);
        let mut statuses = vec![self.run_graph(state, before, false).await?];

        if allows_downstream(ExecutionStatus::aggregate(statuses.iter().copied())) {
            statuses.push(self.run_tasks(state, stage_id).await?);
        }
        if allows_downstream(ExecutionStatus::aggregate(statuses.iter().copied())) {
            match self.plan_after_stages(state, stage_id).await {
                Ok(()) => {
                    let after = self.children(state, stage_id, SyntheticStageOwner::After);
                    statuses.push(self.run_graph(state, after, false).await?);
                }
                Err(err) => {
                    warn!(stage_id = %stage_id, error = %err, "Could not plan after stages");
                    let details = exception_details("PlanningError", &err.to_string(), HashMap::new());
                    let stage = self.update_stage(state, stage_id, |stage, _| {
                        stage.context.insert(context_keys::EXCEPTION.to_string(), details);
                    })?;
                    self.repository.store_stage(&stage).await?;
                    statuses.push(ExecutionStatus::Terminal);
                }
            }
        }

        let status = ExecutionStatus::aggregate(statuses);
        if status == ExecutionStatus::Terminal {
            self.run_failure_stages(state, stage_id).await?;
        }
        Ok(status)
    }

    async fn plan_after_stages(&self, state: &SharedState, stage_id: &str) -> Result<(), OrcaError> {
        let snapshot = state.lock().execution.clone();
        let stages = self.planner.plan_after_stages(&snapshot, stage_id).await?;
        for stage in stages {
            state.lock().execution.insert_synthetic(stage.clone())?;
            self.repository.add_stage(&stage).await?;
        }
        Ok(())
    }

    async fn run_failure_stages(&self, state: &SharedState, stage_id: &str) -> Result<(), OrcaError> {
        let snapshot = state.lock().execution.clone();
        let stages = match self.planner.plan_failure_stages(&snapshot, stage_id).await {
            Ok(stages) => stages,
            Err(err) => {
                warn!(error = %err, "Could not plan failure stages");
                return Ok(());
            }
        };
        if stages.is_empty() {
            return Ok(());
        }

        let ids: Vec<String> = stages.iter().map(|s| s.id.clone()).collect();
        info!(count = ids.len(), "Running failure stages");
        for stage in stages {
            state.lock().execution.insert_synthetic(stage.clone())?;
            self.repository.add_stage(&stage).await?;
        }
        // Failure handling runs even though the execution is winding down.
        for id in ids {
            self.run_stage(state, id).await?;
        }
        Ok(())
    }

    async fn ensure_planned(&self, state: &SharedState, stage_id: &str) -> Result<(), OrcaError> {
        let snapshot = {
            let guard = state.lock();
            if guard.planned.contains(stage_id) {
                return Ok(());
            }
            guard.execution.clone()
        };

        let plan = self.planner.plan(&snapshot, stage_id).await?;
        let synthetic = plan.before_stages.clone();
        {
            let mut guard = state.lock();
            plan.apply(&mut guard.execution)?;
            guard.planned.insert(stage_id.to_string());
        }

        let stage = self.update_stage(state, stage_id, |_, _| {})?;
        self.repository.store_stage(&stage).await?;
        for stage in &synthetic {
            self.repository.add_stage(stage).await?;
        }
        Ok(())
    }

    async fn run_tasks(&self, state: &SharedState, stage_id: &str) -> Result<ExecutionStatus, OrcaError> {
        let task_ids: Vec<String> = {
            let guard = state.lock();
            guard
                .execution
                .stage_by_id(stage_id)
                .map(|s| s.tasks.iter().map(|t| t.id.clone()).collect())
                .unwrap_or_default()
        };

        let mut statuses = Vec::new();
        for task_id in task_ids {
            let status = self.run_task(state, stage_id, &task_id).await?;
            statuses.push(if status == ExecutionStatus::Redirect {
                ExecutionStatus::Succeeded
            } else {
                status
            });
            if !matches!(
                status,
                ExecutionStatus::Succeeded
                    | ExecutionStatus::Skipped
                    | ExecutionStatus::FailedContinue
                    | ExecutionStatus::Redirect
            ) {
                break;
            }
        }

        if statuses.is_empty() {
            return Ok(ExecutionStatus::Succeeded);
        }
        Ok(ExecutionStatus::aggregate(statuses))
    }

    async fn run_task(&self, state: &SharedState, stage_id: &str, task_id: &str) -> Result<ExecutionStatus, OrcaError> {
        let (stage, task_type, done) = {
            let mut guard = state.lock();
            let now = self.clock.now_millis();
            let stage = guard
                .execution
                .stage_mut(stage_id)
                .ok_or_else(|| GraphValidationError::unknown_stage(stage_id))?;
            let task = stage
                .task_by_id_mut(task_id)
                .ok_or_else(|| GraphValidationError::new(format!("Stage {stage_id} has no task {task_id}")))?;
            let done = task.status.is_complete().then_some(task.status);
            if done.is_none() {
                task.start(now);
            }
            let task_type = task.implementing_type.clone();
            (stage.clone(), task_type, done)
        };
        if let Some(status) = done {
            return Ok(status);
        }

        self.repository.store_stage(&stage).await?;
        self.events
            .emit(&ExecutionEvent::TaskStarted {
                execution_id: stage.execution_id.clone(),
                stage_id: stage.id.clone(),
                task_id: task_id.to_string(),
                task_type: task_type.clone(),
            })
            .await;

        loop {
            let snapshot = state.lock().execution.clone();
            let skipped = snapshot
                .stage_by_id(stage_id)
                .is_some_and(|stage| self.planner.is_manually_skipped(stage));
            let attempt = if skipped {
                info!(task_id, "Stage was manually skipped");
                TaskAttempt::new(RunOutcome::Complete(ExecutionStatus::Skipped))
            } else {
                self.task_runner.run_task(&snapshot, stage_id, task_id).await?
            };

            let stage = self.update_stage(state, stage_id, |stage, now| {
                attempt.apply(stage);
                if let RunOutcome::Complete(status) = attempt.outcome {
                    if let Some(task) = stage.task_by_id_mut(task_id) {
                        task.complete(status, now);
                    }
                }
            })?;
            self.repository.store_stage(&stage).await?;

            match attempt.outcome {
                RunOutcome::Reschedule(delay) => self.clock.sleep(delay).await,
                RunOutcome::Pause => self.clock.sleep(self.task_runner.config().default_backoff()).await,
                RunOutcome::Complete(status) => {
                    self.events
                        .emit(&ExecutionEvent::TaskCompleted {
                            execution_id: stage.execution_id.clone(),
                            stage_id: stage.id.clone(),
                            task_id: task_id.to_string(),
                            task_type,
                            status,
                        })
                        .await;
                    return Ok(status);
                }
            }
        }
    }

    fn children(&self, state: &SharedState, stage_id: &str, owner: SyntheticStageOwner) -> Vec<String> {
        let guard = state.lock();
        guard
            .execution
            .direct_children_of(stage_id)
            .into_iter()
            .filter(|s| s.synthetic_stage_owner == Some(owner))
            .map(|s| s.id.clone())
            .collect()
    }

    fn update_stage<F>(&self, state: &SharedState, stage_id: &str, f: F) -> Result<StageExecution, OrcaError>
    where
        F: FnOnce(&mut StageExecution, i64),
    {
        let now = self.clock.now_millis();
        let mut guard = state.lock();
        let stage = guard
            .execution
            .stage_mut(stage_id)
            .ok_or_else(|| GraphValidationError::unknown_stage(stage_id))?;
        f(stage, now);
        Ok(stage.clone())
    }

    async fn emit_stage_completed(&self, stage: &StageExecution) {
        self.events
            .emit(&ExecutionEvent::StageCompleted {
                execution_id: stage.execution_id.clone(),
                stage_id: stage.id.clone(),
                stage_type: stage.stage_type.clone(),
                status: stage.status,
            })
            .await;
    }
}

/// Statuses after which downstream work may start.
fn allows_downstream(status: ExecutionStatus) -> bool {
    status.is_complete() && !status.is_halt()
}
