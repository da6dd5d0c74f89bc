//! Self-driving workflows: how an agent executes one attempt of a task
//!
//! A [`Workflow`] is a [`StateMachine`] that drives *itself*: each stage has
//! an action function which does the work (observe, think, act - through the
//! hosting agent) and returns the next workflow event. The driver is a plain
//! loop, not a coroutine scheduler:
//!
//! ```text
//! loop {
//!     stage  = current stage            (stop if terminal)
//!     event  = actions[stage](run)      (async, may call host primitives)
//!     handle_event(event)               (may consume revisit budget)
//! }
//! ```
//!
//! The workflow never touches the task's *lifecycle* state; it only mutates
//! the task's `Running` context buffer through the host's primitives. The
//! scheduler and the workflow communicate exclusively through the task event
//! a scheduler handler returns after the run - this is what keeps the two
//! machines decoupled.
//!
//! # Event chain
//!
//! Every workflow declares an [`event_chain`](WorkflowBuilder::event_chain):
//! the ordered events of its nominal pass. [`WorkflowBuilder::compile`]
//! walks the chain from the initial stage and rejects the workflow unless it
//! lands in an end state. At runtime actions may deviate from the chain
//! (retry loops, tool round-trips) within the machine's revisit budgets.
//!
//! # Hosting
//!
//! Actions reach the agent through [`WorkflowHost`], an object-safe seam
//! carrying the three primitives. The agent implements it; workflows stay
//! independent of any concrete agent type (and no reference cycle forms
//! between the two).

use crate::context::Context;
use crate::error::{CompilationReason, CoreError, Result};
use crate::llm::CompletionConfig;
use crate::machine::{MachineEvent, MachineState, StateMachine};
use crate::messages::{Message, ToolCallRequest};
use crate::queue::OutQueue;
use crate::task::TaskRef;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::sync::Arc;

/// Projection turning a task into the messages an LLM should see.
///
/// The default projection (no `ObserveFn`) is the task protocol as a leading
/// system message plus a snapshot of the `Running` context buffer; a custom
/// projection may select any task attributes instead.
pub type ObserveFn = Arc<dyn Fn(&TaskRef) -> Vec<Message> + Send + Sync>;

/// The primitives a workflow action may call on its hosting agent.
#[async_trait]
pub trait WorkflowHost: Send + Sync {
    /// Gather the conversation context for the LLM.
    async fn observe(
        &self,
        ctx: &Context,
        queue: &OutQueue,
        task: &TaskRef,
        observe_fn: Option<&ObserveFn>,
    ) -> Result<Vec<Message>>;

    /// Route the observation to the named LLM and return its reply.
    ///
    /// Takes the task so hook interference can be recorded in the task's
    /// `Running` context (and on the queue) by the host itself; callers
    /// must not re-append a reply flagged as interference.
    async fn think(
        &self,
        ctx: &Context,
        queue: &OutQueue,
        task: &TaskRef,
        llm_name: &str,
        observed: Vec<Message>,
        config: &CompletionConfig,
    ) -> Result<Message>;

    /// Invoke one tool call and return the result message.
    ///
    /// `end_tool` is the workflow's end-workflow pseudo-tool, if any; a call
    /// to it is answered synthetically.
    async fn act(
        &self,
        ctx: &Context,
        queue: &OutQueue,
        call: &ToolCallRequest,
        task: &TaskRef,
        end_tool: Option<&str>,
    ) -> Result<Message>;

    /// The default LLM name this host routes to.
    fn default_llm(&self) -> &str;
}

/// Everything an action can see, bundled to keep the callback signature
/// stable.
pub struct WorkflowRun<'a, S, E> {
    /// The hosting agent's primitives.
    pub host: &'a dyn WorkflowHost,
    /// The workflow being driven (prompts, labels, config, end tool).
    pub workflow: &'a Workflow<S, E>,
    /// Shared execution context.
    pub ctx: &'a Context,
    /// Output message queue.
    pub queue: &'a OutQueue,
    /// The task being attempted.
    pub task: &'a TaskRef,
}

impl<'a, S, E> Clone for WorkflowRun<'a, S, E> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<'a, S, E> Copy for WorkflowRun<'a, S, E> {}

/// Async stage action: does the stage's work, returns the next event.
pub type WorkflowAction<S, E> =
    Arc<dyn for<'a> Fn(WorkflowRun<'a, S, E>) -> BoxFuture<'a, Result<E>> + Send + Sync>;

/// A compiled, self-driving stage machine. Built with [`WorkflowBuilder`].
pub struct Workflow<S, E> {
    machine: StateMachine<S, E>,
    event_chain: Vec<E>,
    actions: HashMap<S, WorkflowAction<S, E>>,
    prompts: HashMap<S, String>,
    observe_fns: HashMap<S, ObserveFn>,
    completion: CompletionConfig,
    labels: HashMap<String, String>,
    end_workflow_tool: Option<String>,
}

/// Builder for [`Workflow`]; mirrors the machine-definition phase and
/// freezes everything at [`compile`](Self::compile).
pub struct WorkflowBuilder<S, E> {
    machine: StateMachine<S, E>,
    event_chain: Vec<E>,
    actions: HashMap<S, WorkflowAction<S, E>>,
    prompts: HashMap<S, String>,
    observe_fns: HashMap<S, ObserveFn>,
    completion: CompletionConfig,
    labels: HashMap<String, String>,
    end_workflow_tool: Option<String>,
}

impl<S: MachineState, E: MachineEvent> WorkflowBuilder<S, E> {
    /// Start defining a workflow over the given stage set.
    pub fn new(
        stages: impl IntoIterator<Item = S>,
        initial: S,
        end_stages: impl IntoIterator<Item = S>,
    ) -> Result<Self> {
        Ok(Self {
            machine: StateMachine::new(stages, initial, end_stages)?,
            event_chain: Vec::new(),
            actions: HashMap::new(),
            prompts: HashMap::new(),
            observe_fns: HashMap::new(),
            completion: CompletionConfig::default(),
            labels: HashMap::new(),
            end_workflow_tool: None,
        })
    }

    /// Register a stage transition.
    pub fn transition(mut self, from: S, event: E, to: S) -> Result<Self> {
        self.machine.set_transition(from, event, to, None)?;
        Ok(self)
    }

    /// Set the nominal event sequence.
    pub fn event_chain(mut self, chain: impl IntoIterator<Item = E>) -> Self {
        self.event_chain = chain.into_iter().collect();
        self
    }

    /// Attach a stage's action function.
    pub fn action<F>(mut self, stage: S, action: F) -> Self
    where
        F: for<'a> Fn(WorkflowRun<'a, S, E>) -> BoxFuture<'a, Result<E>> + Send + Sync + 'static,
    {
        self.actions.insert(stage, Arc::new(action));
        self
    }

    /// Attach a stage prompt.
    pub fn prompt(mut self, stage: S, prompt: impl Into<String>) -> Self {
        self.prompts.insert(stage, prompt.into());
        self
    }

    /// Attach a stage-specific observation projection.
    pub fn observe(mut self, stage: S, observe_fn: ObserveFn) -> Self {
        self.observe_fns.insert(stage, observe_fn);
        self
    }

    /// Set the completion configuration used by this workflow's think calls.
    pub fn completion(mut self, completion: CompletionConfig) -> Self {
        self.completion = completion;
        self
    }

    /// Attach a routing label consumed by hooks.
    pub fn label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Name the pseudo-tool whose invocation ends the workflow gracefully.
    pub fn end_workflow_tool(mut self, name: impl Into<String>) -> Self {
        self.end_workflow_tool = Some(name.into());
        self
    }

    /// Compile the stage machine and verify the event chain reaches an end
    /// stage.
    pub fn compile(mut self, max_revisit: u32) -> Result<Workflow<S, E>> {
        self.machine.compile(max_revisit)?;

        // The nominal pass must terminate.
        let mut stage = self.machine.initial_state().clone();
        for event in &self.event_chain {
            match self.machine.transition_target(&stage, event) {
                Some(next) => stage = next.clone(),
                None => {
                    return Err(CoreError::no_transition(&stage, event));
                }
            }
        }
        if !self.machine.end_states().contains(&stage) {
            return Err(CoreError::compilation(
                CompilationReason::NoPathToEnd,
                &[&stage],
            ));
        }

        Ok(Workflow {
            machine: self.machine,
            event_chain: self.event_chain,
            actions: self.actions,
            prompts: self.prompts,
            observe_fns: self.observe_fns,
            completion: self.completion,
            labels: self.labels,
            end_workflow_tool: self.end_workflow_tool,
        })
    }
}

impl<S: MachineState, E: MachineEvent> Workflow<S, E> {
    /// Self-drive from the current stage until a terminal stage.
    ///
    /// Fails with [`CoreError::MissingAction`] if a non-terminal stage has
    /// no action; machine errors (`NoTransition`, `CycleLimitExceeded`)
    /// propagate. The caller is responsible for [`reset`](Self::reset)
    /// between attempts.
    pub async fn run(
        &mut self,
        host: &dyn WorkflowHost,
        ctx: &Context,
        queue: &OutQueue,
        task: &TaskRef,
    ) -> Result<S> {
        loop {
            let stage = self.machine.current_state().clone();
            if self.machine.end_states().contains(&stage) {
                tracing::debug!(workflow_id = %self.machine.id(), stage = ?stage, "workflow reached end stage");
                return Ok(stage);
            }

            let action = self
                .actions
                .get(&stage)
                .cloned()
                .ok_or_else(|| CoreError::MissingAction {
                    stage: format!("{stage:?}"),
                })?;

            let event = action(WorkflowRun {
                host,
                workflow: &*self,
                ctx,
                queue,
                task,
            })
            .await?;

            tracing::trace!(workflow_id = %self.machine.id(), stage = ?stage, event = ?event, "stage action returned");
            self.machine.handle_event(event).await?;
        }
    }

    /// Return the machine to its initial stage and refill revisit budgets.
    pub fn reset(&mut self) {
        self.machine.reset();
    }

    /// The current stage.
    pub fn current_stage(&self) -> &S {
        self.machine.current_state()
    }

    /// Whether the current stage is terminal.
    pub fn at_end(&self) -> bool {
        self.machine.at_end()
    }

    /// The workflow machine's id.
    pub fn id(&self) -> &str {
        self.machine.id()
    }

    /// The nominal event sequence.
    pub fn event_chain(&self) -> &[E] {
        &self.event_chain
    }

    /// The prompt attached to a stage.
    pub fn prompt(&self, stage: &S) -> Option<&str> {
        self.prompts.get(stage).map(String::as_str)
    }

    /// The observation projection attached to a stage.
    pub fn observe_fn(&self, stage: &S) -> Option<ObserveFn> {
        self.observe_fns.get(stage).cloned()
    }

    /// The completion configuration for think calls.
    pub fn completion_config(&self) -> &CompletionConfig {
        &self.completion
    }

    /// Routing labels consumed by hooks.
    pub fn labels(&self) -> &HashMap<String, String> {
        &self.labels
    }

    /// The end-workflow pseudo-tool name, if configured.
    pub fn end_workflow_tool(&self) -> Option<&str> {
        self.end_workflow_tool.as_deref()
    }
}

impl<S: std::fmt::Debug, E: std::fmt::Debug> std::fmt::Debug for Workflow<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Workflow")
            .field("machine", &self.machine)
            .field("event_chain", &self.event_chain)
            .field("labels", &self.labels)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Stage {
        Work,
        Check,
        Done,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Ev {
        Worked,
        Passed,
        Failed,
    }

    struct NullHost;

    #[async_trait]
    impl WorkflowHost for NullHost {
        async fn observe(
            &self,
            _ctx: &Context,
            _queue: &OutQueue,
            _task: &TaskRef,
            _observe_fn: Option<&ObserveFn>,
        ) -> Result<Vec<Message>> {
            Ok(Vec::new())
        }

        async fn think(
            &self,
            _ctx: &Context,
            _queue: &OutQueue,
            _task: &TaskRef,
            _llm_name: &str,
            _observed: Vec<Message>,
            _config: &CompletionConfig,
        ) -> Result<Message> {
            Ok(Message::assistant("noop"))
        }

        async fn act(
            &self,
            _ctx: &Context,
            _queue: &OutQueue,
            call: &ToolCallRequest,
            _task: &TaskRef,
            _end_tool: Option<&str>,
        ) -> Result<Message> {
            Ok(Message::tool("noop", call.id.clone()))
        }

        fn default_llm(&self) -> &str {
            "null"
        }
    }

    fn builder() -> WorkflowBuilder<Stage, Ev> {
        WorkflowBuilder::new([Stage::Work, Stage::Check, Stage::Done], Stage::Work, [Stage::Done])
            .unwrap()
            .transition(Stage::Work, Ev::Worked, Stage::Check)
            .unwrap()
            .transition(Stage::Check, Ev::Passed, Stage::Done)
            .unwrap()
            .transition(Stage::Check, Ev::Failed, Stage::Work)
            .unwrap()
            .event_chain([Ev::Worked, Ev::Passed])
    }

    #[test]
    fn compile_rejects_chain_that_stops_short() {
        let err = builder()
            .event_chain([Ev::Worked])
            .compile(1)
            .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Compilation {
                reason: CompilationReason::NoPathToEnd,
                ..
            }
        ));
    }

    #[test]
    fn compile_rejects_chain_with_unknown_edge() {
        let err = builder()
            .event_chain([Ev::Passed])
            .compile(1)
            .unwrap_err();
        assert!(matches!(err, CoreError::NoTransition { .. }));
    }

    #[tokio::test]
    async fn run_drives_actions_to_the_end() {
        let work_runs = Arc::new(AtomicUsize::new(0));
        let work_runs2 = work_runs.clone();

        let mut workflow = builder()
            .action(Stage::Work, move |_run| {
                let counter = work_runs2.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Ev::Worked)
                })
            })
            .action(Stage::Check, |_run| Box::pin(async move { Ok(Ev::Passed) }))
            .compile(1)
            .unwrap();

        let ctx = Context::new();
        let queue = OutQueue::bounded(4);
        let task = crate::task::Task::builder("t").build().unwrap();

        let last = workflow.run(&NullHost, &ctx, &queue, &task).await.unwrap();
        assert_eq!(last, Stage::Done);
        assert_eq!(work_runs.load(Ordering::SeqCst), 1);
        assert!(workflow.at_end());
    }

    #[tokio::test]
    async fn retry_loop_is_bounded_by_revisit_budget() {
        let mut workflow = builder()
            .action(Stage::Work, |_run| Box::pin(async move { Ok(Ev::Worked) }))
            // Check always rejects, bouncing back to Work.
            .action(Stage::Check, |_run| Box::pin(async move { Ok(Ev::Failed) }))
            .compile(1)
            .unwrap();

        let ctx = Context::new();
        let queue = OutQueue::bounded(4);
        let task = crate::task::Task::builder("t").build().unwrap();

        let err = workflow.run(&NullHost, &ctx, &queue, &task).await.unwrap_err();
        assert!(matches!(err, CoreError::CycleLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn missing_action_is_reported() {
        let mut workflow = builder()
            .action(Stage::Work, |_run| Box::pin(async move { Ok(Ev::Worked) }))
            .compile(1)
            .unwrap();

        let ctx = Context::new();
        let queue = OutQueue::bounded(4);
        let task = crate::task::Task::builder("t").build().unwrap();

        let err = workflow.run(&NullHost, &ctx, &queue, &task).await.unwrap_err();
        assert!(matches!(err, CoreError::MissingAction { .. }));
    }

    #[tokio::test]
    async fn reset_allows_a_second_pass() {
        let mut workflow = builder()
            .action(Stage::Work, |_run| Box::pin(async move { Ok(Ev::Worked) }))
            .action(Stage::Check, |_run| Box::pin(async move { Ok(Ev::Passed) }))
            .compile(0)
            .unwrap();

        let ctx = Context::new();
        let queue = OutQueue::bounded(4);
        let task = crate::task::Task::builder("t").build().unwrap();

        workflow.run(&NullHost, &ctx, &queue, &task).await.unwrap();
        workflow.reset();
        assert_eq!(*workflow.current_stage(), Stage::Work);
        workflow.run(&NullHost, &ctx, &queue, &task).await.unwrap();
    }

    #[test]
    fn accessors_expose_configuration() {
        let observe: ObserveFn = Arc::new(|_task| vec![Message::user("projected")]);
        let workflow = builder()
            .action(Stage::Work, |_run| Box::pin(async move { Ok(Ev::Worked) }))
            .action(Stage::Check, |_run| Box::pin(async move { Ok(Ev::Passed) }))
            .prompt(Stage::Work, "do the work")
            .observe(Stage::Work, observe)
            .label("llm", "fast")
            .end_workflow_tool("finish")
            .compile(1)
            .unwrap();

        assert_eq!(workflow.prompt(&Stage::Work), Some("do the work"));
        assert!(workflow.prompt(&Stage::Check).is_none());
        assert!(workflow.observe_fn(&Stage::Work).is_some());
        assert_eq!(workflow.labels().get("llm").map(String::as_str), Some("fast"));
        assert_eq!(workflow.end_workflow_tool(), Some("finish"));
        assert_eq!(workflow.event_chain().len(), 2);
    }
}
