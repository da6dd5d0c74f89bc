//! State-driven task lifecycle scheduler
//!
//! The [`Scheduler`] watches a task's state and drives it to a terminal
//! state by looping:
//!
//! ```text
//! loop until task terminal:
//!     handler = on_state[task.state]          (NoHandler if absent)
//!     event   = handler(scheduler, ctx, queue, task)
//!     null event -> stop (recursion in progress elsewhere)
//!     task.handle_event(event)                 (errors propagate, no retry)
//!     on_state_changed[(old, new)]?(...)       (exactly once per transition)
//! ```
//!
//! The scheduler is *state-driven* where a workflow is *event-driven*: it
//! never looks inside one attempt, it only reacts to the task state an
//! attempt left behind. The two machines meet in the task event a handler
//! returns after invoking [`TaskExecutor::run_once`].
//!
//! # Tree scheduling
//!
//! The built-in `Running` handler recurses into children in insertion
//! order; a sibling never starts before its predecessor is terminal. A
//! cancelled child makes the parent re-plan (`Init` back to `Created`,
//! bounded by the revisit budget) or cancel once the budget is exhausted.
//! Cancellation of a parent propagates depth-first to every non-terminal
//! descendant before the parent's changed-callback returns.
//!
//! The "no orchestrator" configuration is the degenerate case: `Created`
//! simply answers `Planned` and leaves the tree flat.

use crate::agent::TaskExecutor;
use crate::context::Context;
use crate::error::{CoreError, Result};
use crate::machine::StateMachine;
use crate::messages::Message;
use crate::queue::OutQueue;
use crate::task::{lifecycle_machine, TaskEvent, TaskRef, TaskState};
use futures::future::BoxFuture;
use parking_lot::RwLock;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;

/// Per-state handler: inspects the task, does the state's work, and returns
/// the event to apply - or `None` to leave the drive loop without
/// transitioning.
pub type OnStateFn = Arc<
    dyn for<'a> Fn(
            &'a Scheduler,
            &'a Context,
            &'a OutQueue,
            &'a TaskRef,
        ) -> BoxFuture<'a, Result<Option<TaskEvent>>>
        + Send
        + Sync,
>;

/// Post-transition callback, invoked exactly once after `(from, to)` is
/// applied. Must not drive further transitions on the same task.
pub type OnStateChangedFn = Arc<
    dyn for<'a> Fn(
            &'a Scheduler,
            &'a Context,
            &'a OutQueue,
            &'a TaskRef,
        ) -> BoxFuture<'a, Result<()>>
        + Send
        + Sync,
>;

/// State-driven controller driving tasks (and task trees) to termination.
///
/// Build with [`Scheduler::builder`]. The scheduler compiles its own copy
/// of the task lifecycle machine at construction - the transition authority
/// handler registrations are validated against - and installs the built-in
/// handlers and callbacks described in the [module docs](self).
pub struct Scheduler {
    machine: StateMachine<TaskState, TaskEvent>,
    on_state: RwLock<HashMap<TaskState, OnStateFn>>,
    on_state_changed: RwLock<HashMap<(TaskState, TaskState), OnStateChangedFn>>,
    executor: Arc<dyn TaskExecutor>,
    orchestrator: Option<Arc<dyn TaskExecutor>>,
    max_error_retry: u32,
}

/// Builder for [`Scheduler`]; see [`Scheduler::builder`].
pub struct SchedulerBuilder {
    executor: Option<Arc<dyn TaskExecutor>>,
    orchestrator: Option<Arc<dyn TaskExecutor>>,
    max_error_retry: u32,
}

impl SchedulerBuilder {
    /// The executor agent invoked for leaf tasks (required).
    pub fn executor(mut self, executor: Arc<dyn TaskExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// The orchestrator agent invoked in `Created` to decompose a task
    /// into sub-tasks (optional; absent means flat scheduling).
    pub fn orchestrator(mut self, orchestrator: Arc<dyn TaskExecutor>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Revisit budget for the scheduler's lifecycle machine (default 1).
    ///
    /// Bounds the `Running -> Running` retry loop and `Init` re-planning;
    /// tasks driven by this scheduler should be built with the same
    /// `max_retries`.
    pub fn max_error_retry(mut self, retries: u32) -> Self {
        self.max_error_retry = retries;
        self
    }

    /// Compile the lifecycle machine and install the built-in handlers.
    pub fn build(self) -> Result<Scheduler> {
        let executor = self
            .executor
            .ok_or_else(|| CoreError::Configuration("scheduler needs an executor".into()))?;

        let scheduler = Scheduler {
            machine: lifecycle_machine(self.max_error_retry)?,
            on_state: RwLock::new(HashMap::new()),
            on_state_changed: RwLock::new(HashMap::new()),
            executor,
            orchestrator: self.orchestrator,
            max_error_retry: self.max_error_retry,
        };
        scheduler.install_builtins()?;
        Ok(scheduler)
    }
}

impl Scheduler {
    /// Start building a scheduler.
    pub fn builder() -> SchedulerBuilder {
        SchedulerBuilder {
            executor: None,
            orchestrator: None,
            max_error_retry: 1,
        }
    }

    fn install_builtins(&self) -> Result<()> {
        self.set_on_state_fn(
            TaskState::Created,
            Arc::new(|s, ctx, queue, task| Box::pin(s.created_handler(ctx, queue, task))),
        )?;
        self.set_on_state_fn(
            TaskState::Running,
            Arc::new(|s, ctx, queue, task| Box::pin(s.running_handler(ctx, queue, task))),
        )?;

        self.set_on_state_changed_fn(
            (TaskState::Running, TaskState::Finished),
            Arc::new(|s, ctx, queue, task| Box::pin(s.finished_callback(ctx, queue, task))),
        )?;
        self.set_on_state_changed_fn(
            (TaskState::Running, TaskState::Canceled),
            Arc::new(|s, ctx, queue, task| Box::pin(s.canceled_callback(ctx, queue, task))),
        )?;
        self.set_on_state_changed_fn(
            (TaskState::Running, TaskState::Created),
            Arc::new(|s, ctx, queue, task| Box::pin(s.replanned_callback(ctx, queue, task))),
        )?;
        Ok(())
    }

    /// Register (or replace) the handler for a state.
    ///
    /// Terminal states take no handler; registering one is a configuration
    /// error.
    pub fn set_on_state_fn(&self, state: TaskState, handler: OnStateFn) -> Result<()> {
        if !self.machine.valid_states().contains(&state) {
            return Err(CoreError::Configuration(format!(
                "unknown task state '{state}'"
            )));
        }
        if state.is_terminal() {
            return Err(CoreError::Configuration(format!(
                "terminal state '{state}' cannot have a handler"
            )));
        }
        self.on_state.write().insert(state, handler);
        Ok(())
    }

    /// Register (or replace) the callback for a `(from, to)` transition.
    ///
    /// The pair must exist in the lifecycle machine's transition table.
    pub fn set_on_state_changed_fn(
        &self,
        transition: (TaskState, TaskState),
        callback: OnStateChangedFn,
    ) -> Result<()> {
        let (from, to) = transition;
        let reachable = [
            TaskEvent::Planned,
            TaskEvent::Done,
            TaskEvent::Init,
            TaskEvent::Cancel,
        ]
        .iter()
        .any(|event| self.machine.transition_target(&from, event) == Some(&to));
        if !reachable {
            return Err(CoreError::Configuration(format!(
                "no transition from '{from}' to '{to}' exists"
            )));
        }
        self.on_state_changed.write().insert(transition, callback);
        Ok(())
    }

    /// The configured retry budget.
    pub fn max_error_retry(&self) -> u32 {
        self.max_error_retry
    }

    /// The executor agent.
    pub fn executor(&self) -> &Arc<dyn TaskExecutor> {
        &self.executor
    }

    /// The orchestrator agent, if configured.
    pub fn orchestrator(&self) -> Option<&Arc<dyn TaskExecutor>> {
        self.orchestrator.as_ref()
    }

    /// Drive one task to a terminal state.
    ///
    /// Transition failures (`NoTransition`, `CycleLimitExceeded`) and
    /// handler errors propagate; the scheduler performs no retry of its
    /// own. Boxed for recursion into sub-tasks.
    pub fn schedule<'a>(
        &'a self,
        ctx: &'a Context,
        queue: &'a OutQueue,
        task: &'a TaskRef,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            loop {
                let state = task.state();
                if state.is_terminal() {
                    return Ok(());
                }

                let handler = self.on_state.read().get(&state).cloned().ok_or_else(|| {
                    CoreError::NoHandler {
                        state: state.to_string(),
                    }
                })?;

                tracing::debug!(task = %task.title(), state = %state, "dispatching state handler");
                let Some(event) = handler(self, ctx, queue, task).await? else {
                    return Ok(());
                };

                let old = state;
                let new = task.handle_event(event).await?;

                let callback = self.on_state_changed.read().get(&(old, new)).cloned();
                if let Some(callback) = callback {
                    callback(self, ctx, queue, task).await?;
                }
            }
        })
    }

    /// Drive the root task and close the queue afterwards.
    ///
    /// On failure a final error-flagged `System` message describing the
    /// cause is emitted before the queue closes.
    pub async fn execute(&self, ctx: &Context, queue: &OutQueue, task: &TaskRef) -> Result<()> {
        let result = self.schedule(ctx, queue, task).await;
        if let Err(err) = &result {
            tracing::warn!(task = %task.title(), error = %err, "schedule aborted");
            let note = Message::system(format!("task '{}' aborted: {err}", task.title()))
                .with_error(true);
            let _ = queue.put(note).await;
        }
        queue.close();
        result
    }

    // --- built-in handlers ----------------------------------------------

    async fn created_handler(
        &self,
        ctx: &Context,
        queue: &OutQueue,
        task: &TaskRef,
    ) -> Result<Option<TaskEvent>> {
        if let Some(orchestrator) = &self.orchestrator {
            // No point planning where children could not be attached; the
            // orchestrator itself decides whether a shallower task is
            // atomic.
            let decomposable =
                task.sub_tasks().is_empty() && task.current_depth() < task.root().max_depth();
            if decomposable {
                tracing::debug!(task = %task.title(), orchestrator = %orchestrator.name(), "orchestrating");
                orchestrator.run_once(ctx, queue, task).await?;
            }
        }
        Ok(Some(TaskEvent::Planned))
    }

    async fn running_handler(
        &self,
        ctx: &Context,
        queue: &OutQueue,
        task: &TaskRef,
    ) -> Result<Option<TaskEvent>> {
        let children = task.sub_tasks();
        if children.is_empty() {
            return self.run_leaf(ctx, queue, task).await;
        }

        // Children run in insertion order; a sibling never starts before
        // its predecessor is terminal.
        for child in &children {
            if !child.is_terminal() {
                self.schedule(ctx, queue, child).await?;
            }
        }

        if let Some(cancelled) = children.iter().find(|c| c.state() == TaskState::Canceled) {
            task.set_error(format!(
                "sub-task '{}' was cancelled{}",
                cancelled.title(),
                cancelled
                    .error_info()
                    .map(|info| format!(": {info}"))
                    .unwrap_or_default()
            ));
            // Re-plan unless the budget for re-entering Created is spent.
            if task.remaining_revisits(TaskState::Created) == 0 {
                return Ok(Some(TaskEvent::Cancel));
            }
            return Ok(Some(TaskEvent::Init));
        }

        let aggregated = children
            .iter()
            .map(|c| format!("{}: {}", c.title(), c.output().unwrap_or_default()))
            .collect::<Vec<_>>()
            .join("\n");
        task.set_output(aggregated);
        Ok(Some(TaskEvent::Done))
    }

    async fn run_leaf(
        &self,
        ctx: &Context,
        queue: &OutQueue,
        task: &TaskRef,
    ) -> Result<Option<TaskEvent>> {
        // Each attempt starts clean; a stale error from the previous
        // attempt must not mask a clean run.
        task.clean_error();
        match self.executor.run_once(ctx, queue, task).await {
            Ok(stage) => {
                tracing::debug!(task = %task.title(), stage = %stage, "executor finished");
                if task.is_error() {
                    Ok(Some(TaskEvent::Planned))
                } else {
                    Ok(Some(TaskEvent::Done))
                }
            }
            Err(err) => {
                tracing::warn!(task = %task.title(), error = %err, "executor failed");
                task.set_error(err.to_string());
                Ok(Some(TaskEvent::Cancel))
            }
        }
    }

    // --- built-in transition callbacks ----------------------------------

    async fn finished_callback(
        &self,
        _ctx: &Context,
        queue: &OutQueue,
        task: &TaskRef,
    ) -> Result<()> {
        task.clean_error();
        for child in task.sub_tasks() {
            child.remove_parent();
        }
        queue
            .put(
                Message::system(format!("task '{}' completed", task.title())).with_metadata(
                    "completed_at",
                    json!(chrono::Utc::now().to_rfc3339()),
                ),
            )
            .await?;
        Ok(())
    }

    async fn canceled_callback(
        &self,
        _ctx: &Context,
        queue: &OutQueue,
        task: &TaskRef,
    ) -> Result<()> {
        cancel_descendants(task).await;
        queue
            .put(
                Message::system(format!(
                    "task '{}' was cancelled{}",
                    task.title(),
                    task.error_info()
                        .map(|info| format!(": {info}"))
                        .unwrap_or_default()
                ))
                .with_error(true)
                .with_metadata("canceled_at", json!(chrono::Utc::now().to_rfc3339())),
            )
            .await?;
        Ok(())
    }

    async fn replanned_callback(
        &self,
        _ctx: &Context,
        _queue: &OutQueue,
        task: &TaskRef,
    ) -> Result<()> {
        tracing::debug!(task = %task.title(), "clearing children for re-planning");
        task.clear_sub_tasks();
        task.clean_error();
        Ok(())
    }
}

/// Apply `Cancel` to every non-terminal descendant, depth-first.
///
/// A `Created` descendant is first driven `Planned` - the fixed lifecycle
/// table only cancels out of `Running`. Best effort: a descendant whose
/// revisit budget is exhausted is logged and left behind rather than
/// aborting the sweep.
fn cancel_descendants(task: &TaskRef) -> BoxFuture<'_, ()> {
    Box::pin(async move {
        for child in task.sub_tasks() {
            cancel_descendants(&child).await;
            if child.is_terminal() {
                continue;
            }
            if child.state() == TaskState::Created {
                if let Err(err) = child.handle_event(TaskEvent::Planned).await {
                    tracing::warn!(task = %child.title(), error = %err, "could not stage child for cancellation");
                    continue;
                }
            }
            if let Err(err) = child.handle_event(TaskEvent::Cancel).await {
                tracing::warn!(task = %child.title(), error = %err, "could not cancel child");
            }
        }
    })
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("executor", &self.executor.name())
            .field("orchestrator", &self.orchestrator.as_ref().map(|o| o.name()))
            .field("max_error_retry", &self.max_error_retry)
            .finish()
    }
}
