//! ReAct executor: reason ⇄ act until a final answer
//!
//! The most common executor shape: the LLM alternates between *reasoning*
//! (deciding whether to answer or call tools) and *acting* (running the
//! requested tools), observing tool results each round.
//!
//! ```text
//!            ActRequested
//!   ┌─────────────────────────┐
//!   │                         ▼
//! Reason ◀───────────────── Act
//!   │  ⟲ Reconsider   Observed
//!   │
//!   ├── Finish ──▶ End    (final answer, or end-tool invoked from Act)
//!   └── Fail ────▶ End    (genuine tool failure; task error set)
//! ```
//!
//! Failure triage happens at the top of the Reason stage: a genuine tool
//! error in the previous round sets the task's error info and fails the
//! attempt (the scheduler then retries the task, consuming its revisit
//! budget); an interference sentinel instead flows into the next think so
//! the LLM can re-decide. The reason/act loop itself is bounded by the
//! workflow's revisit budget (`max_iterations`).

use std::sync::Arc;
use taskgraph_core::agent::Agent;
use taskgraph_core::error::Result;
use taskgraph_core::llm::{CompletionConfig, LanguageModel};
use taskgraph_core::messages::{Message, Role};
use taskgraph_core::task::TaskState;
use taskgraph_core::tool::ToolService;
use taskgraph_core::workflow::{Workflow, WorkflowBuilder, WorkflowRun};

/// Stages of the ReAct loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReactStage {
    /// Observe + think; route to Act, End, or another think.
    Reason,
    /// Execute the pending tool calls.
    Act,
    /// Terminal.
    End,
}

/// Events driving the ReAct loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReactEvent {
    /// The reply carries tool calls.
    ActRequested,
    /// Tool results are in; think again.
    Observed,
    /// Re-think without acting (interference).
    Reconsider,
    /// Final answer produced.
    Finish,
    /// Genuine failure; task error info is set.
    Fail,
}

/// Configuration for [`react_workflow`] / [`ReactAgentBuilder`].
#[derive(Clone)]
pub struct ReactOptions {
    /// Revisit budget for the reason/act loop (default 8).
    pub max_iterations: u32,
    /// System prompt prepended at the Reason stage.
    pub system_prompt: Option<String>,
    /// Pseudo-tool name signalling graceful termination.
    pub end_tool: Option<String>,
    /// Completion configuration for think calls.
    pub completion: CompletionConfig,
}

impl Default for ReactOptions {
    fn default() -> Self {
        Self {
            max_iterations: 8,
            system_prompt: None,
            end_tool: None,
            completion: CompletionConfig::default(),
        }
    }
}

fn reason_action(
    run: WorkflowRun<'_, ReactStage, ReactEvent>,
) -> futures::future::BoxFuture<'_, Result<ReactEvent>> {
    Box::pin(async move {
        let running = run.task.context(TaskState::Running);

        // Triage the previous round before spending an LLM call on it. The
        // failure note keeps a *stale* tool error from re-failing the next
        // attempt: its presence means this failure was already charged.
        if let Some(last) = running.last() {
            if last.role == Role::Tool && last.is_error && !last.is_interference() {
                run.task
                    .set_error(format!("tool call failed: {}", last.text()));
                running.append(Message::user(format!(
                    "the tool call failed: {}; this attempt is being abandoned",
                    last.text()
                )));
                return Ok(ReactEvent::Fail);
            }
        }

        let observe_fn = run.workflow.observe_fn(&ReactStage::Reason);
        let mut observed = run
            .host
            .observe(run.ctx, run.queue, run.task, observe_fn.as_ref())
            .await?;
        if let Some(prompt) = run.workflow.prompt(&ReactStage::Reason) {
            observed.insert(0, Message::system(prompt));
        }

        let llm = run
            .workflow
            .labels()
            .get("llm")
            .map(String::as_str)
            .unwrap_or_else(|| run.host.default_llm());
        let reply = run
            .host
            .think(
                run.ctx,
                run.queue,
                run.task,
                llm,
                observed,
                run.workflow.completion_config(),
            )
            .await?;

        if reply.is_interference() {
            // Already recorded by the think primitive.
            return Ok(ReactEvent::Reconsider);
        }
        running.append(reply.clone());
        if reply.is_error {
            run.task
                .set_error(format!("llm call failed: {}", reply.text()));
            return Ok(ReactEvent::Fail);
        }
        if reply.has_tool_calls() {
            return Ok(ReactEvent::ActRequested);
        }

        run.task.set_output(reply.text());
        Ok(ReactEvent::Finish)
    })
}

fn act_action(
    run: WorkflowRun<'_, ReactStage, ReactEvent>,
) -> futures::future::BoxFuture<'_, Result<ReactEvent>> {
    Box::pin(async move {
        let running = run.task.context(TaskState::Running);
        let calls = running
            .snapshot()
            .iter()
            .rev()
            .find(|m| m.role == Role::Assistant && m.has_tool_calls())
            .map(|m| m.tool_calls.clone())
            .unwrap_or_default();

        let end_tool = run.workflow.end_workflow_tool();
        for call in &calls {
            let result = run
                .host
                .act(run.ctx, run.queue, call, run.task, end_tool)
                .await?;
            // Interference sentinels are already in the context (the act
            // primitive records them); everything else is appended here.
            if !result.is_interference() {
                running.append(result.clone());
            }
            if end_tool == Some(call.name.as_str()) && !result.is_error {
                run.task.set_output(result.text());
                return Ok(ReactEvent::Finish);
            }
        }
        Ok(ReactEvent::Observed)
    })
}

/// Build the ReAct workflow.
pub fn react_workflow(options: &ReactOptions) -> Result<Workflow<ReactStage, ReactEvent>> {
    use ReactEvent::*;
    use ReactStage::*;

    let mut builder = WorkflowBuilder::new([Reason, Act, End], Reason, [End])?
        .transition(Reason, ActRequested, Act)?
        .transition(Act, Observed, Reason)?
        .transition(Act, Finish, End)?
        .transition(Reason, Reconsider, Reason)?
        .transition(Reason, Finish, End)?
        .transition(Reason, Fail, End)?
        .event_chain([Finish])
        .action(Reason, reason_action)
        .action(Act, act_action)
        .completion(options.completion.clone());

    if let Some(prompt) = &options.system_prompt {
        builder = builder.prompt(Reason, prompt.clone());
    }
    if let Some(end_tool) = &options.end_tool {
        builder = builder.end_workflow_tool(end_tool.clone());
    }
    builder.compile(options.max_iterations)
}

/// Builder producing a ready-to-schedule ReAct executor agent.
///
/// ```rust,ignore
/// let agent = ReactAgentBuilder::new(model)
///     .with_tools(tool_service)
///     .with_system_prompt("You are a careful research assistant.")
///     .with_max_iterations(10)
///     .build()?;
/// ```
pub struct ReactAgentBuilder {
    name: String,
    model: Arc<dyn LanguageModel>,
    tools: Option<Arc<dyn ToolService>>,
    options: ReactOptions,
    catch_llm_errors: bool,
}

impl ReactAgentBuilder {
    /// Start from the model every think call routes to.
    pub fn new(model: Arc<dyn LanguageModel>) -> Self {
        Self {
            name: "react".to_string(),
            model,
            tools: None,
            options: ReactOptions::default(),
            catch_llm_errors: false,
        }
    }

    /// Name the agent (default `"react"`).
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Attach the tool service.
    pub fn with_tools(mut self, tools: Arc<dyn ToolService>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Cap the reason/act loop (default 8).
    pub fn with_max_iterations(mut self, max_iterations: u32) -> Self {
        self.options.max_iterations = max_iterations;
        self
    }

    /// Prepend a system prompt at every Reason stage.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.options.system_prompt = Some(prompt.into());
        self
    }

    /// Let the LLM end the run by calling this pseudo-tool.
    pub fn with_end_tool(mut self, name: impl Into<String>) -> Self {
        self.options.end_tool = Some(name.into());
        self
    }

    /// Completion configuration for think calls.
    pub fn with_completion(mut self, completion: CompletionConfig) -> Self {
        self.options.completion = completion;
        self
    }

    /// Fold LLM adapter errors into error replies instead of propagating.
    pub fn with_catch_llm_errors(mut self, catch: bool) -> Self {
        self.catch_llm_errors = catch;
        self
    }

    /// Build the agent.
    pub fn build(self) -> Result<Agent<ReactStage, ReactEvent>> {
        let workflow = react_workflow(&self.options)?;
        let mut builder = Agent::builder(self.name)
            .llm("main", self.model)
            .workflow(workflow)
            .catch_llm_errors(self.catch_llm_errors);
        if let Some(tools) = self.tools {
            builder = builder.tool_service(tools);
        }
        builder.build()
    }
}
