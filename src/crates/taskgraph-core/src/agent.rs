//! Agents: observe / think / act wrapped in ordered hook chains
//!
//! An [`Agent`] hosts a [`Workflow`] and owns the three primitives its
//! stage actions call:
//!
//! - [`observe`](Agent::observe) - gather the conversation context for the
//!   LLM (task protocol + `Running` context buffer, or a custom projection),
//! - [`think`](Agent::think) - route the observation to a named LLM and
//!   return the assistant reply,
//! - [`act`](Agent::act) - invoke one tool through the external tool
//!   service.
//!
//! Each primitive is wrapped in hook chains (pre/post); a fourth pair wraps
//! [`run_once`](Agent::run_once), the canonical execution entry the
//! scheduler's handlers invoke. Hooks are the extension seam for long-term
//! memory, redaction, permission checks, and audit logging - concerns the
//! core deliberately knows nothing about.
//!
//! # Hook rules
//!
//! - Within a chain, hooks run in registration order; each (sync or async)
//!   is awaited before the next runs.
//! - Hooks are registered under a caller-chosen name. Removing a name
//!   removes the **first** matching instance only, so a hook registered
//!   twice survives one removal.
//! - A hook returns [`HookOutcome`]: `Continue`, or `Interfere(reason)` to
//!   request out-of-band human approval. Interference is not an error: the
//!   primitive synthesizes an error-flagged sentinel message (role `Tool`
//!   inside `act`, role `User` elsewhere), appends it to the task's
//!   `Running` context itself, pushes it to the out queue in `think` and
//!   `act` (whose ordinary outputs reach the queue), and returns it so the
//!   workflow can decide to re-think. Workflow actions must not re-append
//!   a message flagged as interference. A hook `Err` propagates
//!   unmodified.
//!
//! # Mutation discipline
//!
//! Observation-transforming chains (`post_observe`, `pre_think`) receive
//! `&mut Vec<Message>` and mutate in place; reply/result-transforming
//! chains (`post_think`, `post_act`) receive `&mut Message`. The remaining
//! chains are read-only with respect to messages.

use crate::context::Context;
use crate::error::{CoreError, Result};
use crate::llm::{CompletionConfig, LanguageModel};
use crate::machine::{MachineEvent, MachineState};
use crate::messages::{Message, ToolCallRequest};
use crate::queue::OutQueue;
use crate::task::{TaskRef, TaskState};
use crate::tool::ToolService;
use crate::workflow::{ObserveFn, Workflow, WorkflowHost};
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// What a hook decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    /// Proceed with the chain.
    Continue,
    /// Stop and request out-of-band human approval, with a reason shown to
    /// the LLM.
    Interfere(String),
}

/// Hook over (ctx, queue, task): `pre_run_once`, `post_run_once`,
/// `pre_observe`, `pre_act`.
pub type TaskHook = Arc<
    dyn for<'a> Fn(&'a Context, &'a OutQueue, &'a TaskRef) -> BoxFuture<'a, Result<HookOutcome>>
        + Send
        + Sync,
>;

/// Hook mutating the observation in place: `post_observe`.
pub type ObservedHook = Arc<
    dyn for<'a> Fn(
            &'a Context,
            &'a OutQueue,
            &'a TaskRef,
            &'a mut Vec<Message>,
        ) -> BoxFuture<'a, Result<HookOutcome>>
        + Send
        + Sync,
>;

/// Hook mutating the outgoing messages in place: `pre_think`.
pub type MessagesHook = Arc<
    dyn for<'a> Fn(
            &'a Context,
            &'a OutQueue,
            &'a mut Vec<Message>,
        ) -> BoxFuture<'a, Result<HookOutcome>>
        + Send
        + Sync,
>;

/// Hook mutating the LLM reply in place: `post_think`.
pub type ReplyHook = Arc<
    dyn for<'a> Fn(
            &'a Context,
            &'a OutQueue,
            &'a [Message],
            &'a mut Message,
        ) -> BoxFuture<'a, Result<HookOutcome>>
        + Send
        + Sync,
>;

/// Hook mutating the tool result in place: `post_act`.
pub type ResultHook = Arc<
    dyn for<'a> Fn(
            &'a Context,
            &'a OutQueue,
            &'a TaskRef,
            &'a mut Message,
        ) -> BoxFuture<'a, Result<HookOutcome>>
        + Send
        + Sync,
>;

#[derive(Default)]
struct HookChains {
    pre_run_once: Vec<(String, TaskHook)>,
    post_run_once: Vec<(String, TaskHook)>,
    pre_observe: Vec<(String, TaskHook)>,
    post_observe: Vec<(String, ObservedHook)>,
    pre_think: Vec<(String, MessagesHook)>,
    post_think: Vec<(String, ReplyHook)>,
    pre_act: Vec<(String, TaskHook)>,
    post_act: Vec<(String, ResultHook)>,
}

fn remove_first<H>(chain: &mut Vec<(String, H)>, name: &str) -> bool {
    if let Some(pos) = chain.iter().position(|(n, _)| n == name) {
        chain.remove(pos);
        true
    } else {
        false
    }
}

/// The four read-only hook points sharing the [`TaskHook`] signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskHookPoint {
    PreRunOnce,
    PostRunOnce,
    PreObserve,
    PreAct,
}

/// Type-erased execution entry consumed by the scheduler.
///
/// Implemented by [`Agent`] for every stage/event pair; the returned string
/// is the terminal workflow stage, debug-rendered.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Executor name, for logging.
    fn name(&self) -> &str;

    /// Run one workflow attempt against the task.
    async fn run_once(&self, ctx: &Context, queue: &OutQueue, task: &TaskRef) -> Result<String>;
}

/// An executor hosting one workflow, a name→LLM map, and a tool service.
///
/// Construct with [`Agent::builder`]; share as `Arc<Agent<_, _>>` (or as
/// `Arc<dyn TaskExecutor>` towards the scheduler). The LLM map and tool
/// service are fixed at construction; hook chains may be extended or pruned
/// at any time.
pub struct Agent<S, E> {
    name: String,
    llms: HashMap<String, Arc<dyn LanguageModel>>,
    default_llm: String,
    tools: Option<Arc<dyn ToolService>>,
    workflow: tokio::sync::Mutex<Workflow<S, E>>,
    hooks: RwLock<HookChains>,
    catch_llm_errors: bool,
}

/// Builder for [`Agent`]; see [`Agent::builder`].
pub struct AgentBuilder<S, E> {
    name: String,
    llms: HashMap<String, Arc<dyn LanguageModel>>,
    default_llm: Option<String>,
    first_llm: Option<String>,
    tools: Option<Arc<dyn ToolService>>,
    workflow: Option<Workflow<S, E>>,
    catch_llm_errors: bool,
}

impl<S: MachineState, E: MachineEvent> AgentBuilder<S, E> {
    /// Register a language model under a routing name. The first registered
    /// model becomes the default unless [`default_llm`](Self::default_llm)
    /// overrides it.
    pub fn llm(mut self, name: impl Into<String>, model: Arc<dyn LanguageModel>) -> Self {
        let name = name.into();
        if self.first_llm.is_none() {
            self.first_llm = Some(name.clone());
        }
        self.llms.insert(name, model);
        self
    }

    /// Pick the default routing name for `think`.
    pub fn default_llm(mut self, name: impl Into<String>) -> Self {
        self.default_llm = Some(name.into());
        self
    }

    /// Attach the external tool service.
    pub fn tool_service(mut self, tools: Arc<dyn ToolService>) -> Self {
        self.tools = Some(tools);
        self
    }

    /// Attach the workflow this agent drives.
    pub fn workflow(mut self, workflow: Workflow<S, E>) -> Self {
        self.workflow = Some(workflow);
        self
    }

    /// Fold LLM adapter errors into error-flagged assistant messages
    /// (they then behave like tool errors) instead of propagating.
    pub fn catch_llm_errors(mut self, catch: bool) -> Self {
        self.catch_llm_errors = catch;
        self
    }

    /// Validate and build the agent.
    pub fn build(self) -> Result<Agent<S, E>> {
        let workflow = self.workflow.ok_or_else(|| {
            CoreError::Configuration(format!("agent '{}' needs a workflow", self.name))
        })?;
        let default_llm = self
            .default_llm
            .or(self.first_llm)
            .ok_or_else(|| {
                CoreError::Configuration(format!(
                    "agent '{}' needs at least one language model",
                    self.name
                ))
            })?;
        if !self.llms.contains_key(&default_llm) {
            return Err(CoreError::Configuration(format!(
                "agent '{}': default llm '{default_llm}' is not registered",
                self.name
            )));
        }
        Ok(Agent {
            name: self.name,
            llms: self.llms,
            default_llm,
            tools: self.tools,
            workflow: tokio::sync::Mutex::new(workflow),
            hooks: RwLock::new(HookChains::default()),
            catch_llm_errors: self.catch_llm_errors,
        })
    }
}

impl<S: MachineState, E: MachineEvent> Agent<S, E> {
    /// Start building an agent with the given name.
    pub fn builder(name: impl Into<String>) -> AgentBuilder<S, E> {
        AgentBuilder {
            name: name.into(),
            llms: HashMap::new(),
            default_llm: None,
            first_llm: None,
            tools: None,
            workflow: None,
            catch_llm_errors: false,
        }
    }

    /// The agent's name.
    pub fn agent_name(&self) -> &str {
        &self.name
    }

    // --- hook registration ----------------------------------------------

    /// Append a `pre_run_once` hook.
    pub fn add_pre_run_once_hook<F>(&self, name: impl Into<String>, hook: F)
    where
        F: for<'a> Fn(&'a Context, &'a OutQueue, &'a TaskRef) -> BoxFuture<'a, Result<HookOutcome>>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.write().pre_run_once.push((name.into(), Arc::new(hook)));
    }

    /// Remove the first `pre_run_once` hook with this name.
    pub fn remove_pre_run_once_hook(&self, name: &str) -> bool {
        remove_first(&mut self.hooks.write().pre_run_once, name)
    }

    /// Append a `post_run_once` hook.
    pub fn add_post_run_once_hook<F>(&self, name: impl Into<String>, hook: F)
    where
        F: for<'a> Fn(&'a Context, &'a OutQueue, &'a TaskRef) -> BoxFuture<'a, Result<HookOutcome>>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.write().post_run_once.push((name.into(), Arc::new(hook)));
    }

    /// Remove the first `post_run_once` hook with this name.
    pub fn remove_post_run_once_hook(&self, name: &str) -> bool {
        remove_first(&mut self.hooks.write().post_run_once, name)
    }

    /// Append a `pre_observe` hook.
    pub fn add_pre_observe_hook<F>(&self, name: impl Into<String>, hook: F)
    where
        F: for<'a> Fn(&'a Context, &'a OutQueue, &'a TaskRef) -> BoxFuture<'a, Result<HookOutcome>>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.write().pre_observe.push((name.into(), Arc::new(hook)));
    }

    /// Remove the first `pre_observe` hook with this name.
    pub fn remove_pre_observe_hook(&self, name: &str) -> bool {
        remove_first(&mut self.hooks.write().pre_observe, name)
    }

    /// Append a `post_observe` hook (mutates the observation in place).
    pub fn add_post_observe_hook<F>(&self, name: impl Into<String>, hook: F)
    where
        F: for<'a> Fn(
                &'a Context,
                &'a OutQueue,
                &'a TaskRef,
                &'a mut Vec<Message>,
            ) -> BoxFuture<'a, Result<HookOutcome>>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.write().post_observe.push((name.into(), Arc::new(hook)));
    }

    /// Remove the first `post_observe` hook with this name.
    pub fn remove_post_observe_hook(&self, name: &str) -> bool {
        remove_first(&mut self.hooks.write().post_observe, name)
    }

    /// Append a `pre_think` hook (mutates the outgoing messages in place).
    pub fn add_pre_think_hook<F>(&self, name: impl Into<String>, hook: F)
    where
        F: for<'a> Fn(
                &'a Context,
                &'a OutQueue,
                &'a mut Vec<Message>,
            ) -> BoxFuture<'a, Result<HookOutcome>>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.write().pre_think.push((name.into(), Arc::new(hook)));
    }

    /// Remove the first `pre_think` hook with this name.
    pub fn remove_pre_think_hook(&self, name: &str) -> bool {
        remove_first(&mut self.hooks.write().pre_think, name)
    }

    /// Append a `post_think` hook (mutates the reply in place).
    pub fn add_post_think_hook<F>(&self, name: impl Into<String>, hook: F)
    where
        F: for<'a> Fn(
                &'a Context,
                &'a OutQueue,
                &'a [Message],
                &'a mut Message,
            ) -> BoxFuture<'a, Result<HookOutcome>>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.write().post_think.push((name.into(), Arc::new(hook)));
    }

    /// Remove the first `post_think` hook with this name.
    pub fn remove_post_think_hook(&self, name: &str) -> bool {
        remove_first(&mut self.hooks.write().post_think, name)
    }

    /// Append a `pre_act` hook.
    pub fn add_pre_act_hook<F>(&self, name: impl Into<String>, hook: F)
    where
        F: for<'a> Fn(&'a Context, &'a OutQueue, &'a TaskRef) -> BoxFuture<'a, Result<HookOutcome>>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.write().pre_act.push((name.into(), Arc::new(hook)));
    }

    /// Remove the first `pre_act` hook with this name.
    pub fn remove_pre_act_hook(&self, name: &str) -> bool {
        remove_first(&mut self.hooks.write().pre_act, name)
    }

    /// Append a `post_act` hook (mutates the tool result in place).
    pub fn add_post_act_hook<F>(&self, name: impl Into<String>, hook: F)
    where
        F: for<'a> Fn(
                &'a Context,
                &'a OutQueue,
                &'a TaskRef,
                &'a mut Message,
            ) -> BoxFuture<'a, Result<HookOutcome>>
            + Send
            + Sync
            + 'static,
    {
        self.hooks.write().post_act.push((name.into(), Arc::new(hook)));
    }

    /// Remove the first `post_act` hook with this name.
    pub fn remove_post_act_hook(&self, name: &str) -> bool {
        remove_first(&mut self.hooks.write().post_act, name)
    }

    // --- chain runners ---------------------------------------------------

    async fn run_task_hooks(
        &self,
        point: TaskHookPoint,
        ctx: &Context,
        queue: &OutQueue,
        task: &TaskRef,
    ) -> Result<Option<String>> {
        let chain: Vec<(String, TaskHook)> = {
            let hooks = self.hooks.read();
            match point {
                TaskHookPoint::PreRunOnce => hooks.pre_run_once.clone(),
                TaskHookPoint::PostRunOnce => hooks.post_run_once.clone(),
                TaskHookPoint::PreObserve => hooks.pre_observe.clone(),
                TaskHookPoint::PreAct => hooks.pre_act.clone(),
            }
        };
        for (name, hook) in chain {
            match hook(ctx, queue, task).await? {
                HookOutcome::Continue => {}
                HookOutcome::Interfere(reason) => {
                    tracing::debug!(agent = %self.name, hook = %name, point = ?point, "hook requested interference");
                    return Ok(Some(reason));
                }
            }
        }
        Ok(None)
    }

    async fn run_post_observe_hooks(
        &self,
        ctx: &Context,
        queue: &OutQueue,
        task: &TaskRef,
        observed: &mut Vec<Message>,
    ) -> Result<Option<String>> {
        let chain = self.hooks.read().post_observe.clone();
        for (name, hook) in chain {
            match hook(ctx, queue, task, observed).await? {
                HookOutcome::Continue => {}
                HookOutcome::Interfere(reason) => {
                    tracing::debug!(agent = %self.name, hook = %name, "post_observe interference");
                    return Ok(Some(reason));
                }
            }
        }
        Ok(None)
    }

    async fn run_pre_think_hooks(
        &self,
        ctx: &Context,
        queue: &OutQueue,
        observed: &mut Vec<Message>,
    ) -> Result<Option<String>> {
        let chain = self.hooks.read().pre_think.clone();
        for (name, hook) in chain {
            match hook(ctx, queue, observed).await? {
                HookOutcome::Continue => {}
                HookOutcome::Interfere(reason) => {
                    tracing::debug!(agent = %self.name, hook = %name, "pre_think interference");
                    return Ok(Some(reason));
                }
            }
        }
        Ok(None)
    }

    async fn run_post_think_hooks(
        &self,
        ctx: &Context,
        queue: &OutQueue,
        observed: &[Message],
        reply: &mut Message,
    ) -> Result<Option<String>> {
        let chain = self.hooks.read().post_think.clone();
        for (name, hook) in chain {
            match hook(ctx, queue, observed, reply).await? {
                HookOutcome::Continue => {}
                HookOutcome::Interfere(reason) => {
                    tracing::debug!(agent = %self.name, hook = %name, "post_think interference");
                    return Ok(Some(reason));
                }
            }
        }
        Ok(None)
    }

    async fn run_post_act_hooks(
        &self,
        ctx: &Context,
        queue: &OutQueue,
        task: &TaskRef,
        result: &mut Message,
    ) -> Result<Option<String>> {
        let chain = self.hooks.read().post_act.clone();
        for (name, hook) in chain {
            match hook(ctx, queue, task, result).await? {
                HookOutcome::Continue => {}
                HookOutcome::Interfere(reason) => {
                    tracing::debug!(agent = %self.name, hook = %name, "post_act interference");
                    return Ok(Some(reason));
                }
            }
        }
        Ok(None)
    }

    // --- run_once --------------------------------------------------------

    /// Run one workflow attempt: `pre_run_once` chain, reset the workflow,
    /// drive it to a terminal stage, `post_run_once` chain.
    ///
    /// Interference in the run-once chains is recorded in the task's
    /// `Running` context and the run proceeds - the LLM sees the note on its
    /// next observation.
    pub async fn run_once(&self, ctx: &Context, queue: &OutQueue, task: &TaskRef) -> Result<S> {
        tracing::debug!(agent = %self.name, task = %task.title(), "run_once starting");
        if let Some(reason) = self
            .run_task_hooks(TaskHookPoint::PreRunOnce, ctx, queue, task)
            .await?
        {
            task.context(TaskState::Running)
                .append(Message::interference(reason));
        }

        let mut workflow = self.workflow.lock().await;
        workflow.reset();
        let stage = workflow.run(self, ctx, queue, task).await?;
        drop(workflow);

        if let Some(reason) = self
            .run_task_hooks(TaskHookPoint::PostRunOnce, ctx, queue, task)
            .await?
        {
            task.context(TaskState::Running)
                .append(Message::interference(reason));
        }
        tracing::debug!(agent = %self.name, task = %task.title(), stage = ?stage, "run_once finished");
        Ok(stage)
    }
}

#[async_trait]
impl<S: MachineState, E: MachineEvent> WorkflowHost for Agent<S, E> {
    async fn observe(
        &self,
        ctx: &Context,
        queue: &OutQueue,
        task: &TaskRef,
        observe_fn: Option<&ObserveFn>,
    ) -> Result<Vec<Message>> {
        if let Some(reason) = self
            .run_task_hooks(TaskHookPoint::PreObserve, ctx, queue, task)
            .await?
        {
            let sentinel = Message::interference(reason);
            task.context(TaskState::Running).append(sentinel.clone());
            return Ok(vec![sentinel]);
        }

        let mut observed = match observe_fn {
            Some(project) => project(task),
            None => {
                let mut messages = Vec::new();
                let protocol = task.protocol();
                if !protocol.is_empty() {
                    messages.push(Message::system(protocol));
                }
                messages.extend(task.context(TaskState::Running).snapshot());
                messages
            }
        };

        if let Some(reason) = self
            .run_post_observe_hooks(ctx, queue, task, &mut observed)
            .await?
        {
            let sentinel = Message::interference(reason);
            task.context(TaskState::Running).append(sentinel.clone());
            observed.push(sentinel);
        }
        Ok(observed)
    }

    async fn think(
        &self,
        ctx: &Context,
        queue: &OutQueue,
        task: &TaskRef,
        llm_name: &str,
        mut observed: Vec<Message>,
        config: &CompletionConfig,
    ) -> Result<Message> {
        if let Some(reason) = self.run_pre_think_hooks(ctx, queue, &mut observed).await? {
            let sentinel = Message::interference(reason);
            task.context(TaskState::Running).append(sentinel.clone());
            queue.put(sentinel.clone()).await?;
            return Ok(sentinel);
        }

        let model = self
            .llms
            .get(llm_name)
            .ok_or_else(|| CoreError::Llm(format!("unknown llm '{llm_name}'")))?;

        tracing::debug!(agent = %self.name, llm = %llm_name, messages = observed.len(), "think");
        let completion = if model.supports_streaming() {
            model.completion_streaming(&observed, config, queue).await
        } else {
            model.completion(&observed, config).await
        };
        let mut reply = match completion {
            Ok(reply) => reply,
            Err(err) if self.catch_llm_errors => {
                tracing::warn!(agent = %self.name, llm = %llm_name, error = %err, "llm error caught");
                Message::assistant(err.to_string()).with_error(true)
            }
            Err(err) => return Err(err),
        };

        if let Some(reason) = self
            .run_post_think_hooks(ctx, queue, &observed, &mut reply)
            .await?
        {
            reply = Message::interference(reason);
            task.context(TaskState::Running).append(reply.clone());
        }

        queue.put(reply.clone()).await?;
        Ok(reply)
    }

    async fn act(
        &self,
        ctx: &Context,
        queue: &OutQueue,
        call: &ToolCallRequest,
        task: &TaskRef,
        end_tool: Option<&str>,
    ) -> Result<Message> {
        if let Some(reason) = self
            .run_task_hooks(TaskHookPoint::PreAct, ctx, queue, task)
            .await?
        {
            let sentinel = Message::interference_for_call(&call.id, reason);
            task.context(TaskState::Running).append(sentinel.clone());
            queue.put(sentinel.clone()).await?;
            return Ok(sentinel);
        }

        let mut result = if end_tool == Some(call.name.as_str()) {
            // Graceful-termination pseudo-tool: answered synthetically.
            let content = call
                .args
                .get("result")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("workflow complete")
                .to_string();
            Message::tool(content, &call.id)
        } else {
            match &self.tools {
                None => Message::tool(
                    format!("no tool service configured; cannot call '{}'", call.name),
                    &call.id,
                )
                .with_error(true),
                Some(service) => {
                    tracing::debug!(agent = %self.name, tool = %call.name, "act");
                    match service.call(&call.name, &call.args).await {
                        Ok(mut message) => {
                            message.tool_call_id = Some(call.id.clone());
                            message
                        }
                        Err(err) => {
                            tracing::warn!(agent = %self.name, tool = %call.name, error = %err, "tool service failed");
                            Message::tool(err.to_string(), &call.id).with_error(true)
                        }
                    }
                }
            }
        };

        if let Some(reason) = self
            .run_post_act_hooks(ctx, queue, task, &mut result)
            .await?
        {
            result = Message::interference_for_call(&call.id, reason);
        }

        queue.put(result.clone()).await?;
        Ok(result)
    }

    fn default_llm(&self) -> &str {
        &self.default_llm
    }
}

#[async_trait]
impl<S: MachineState, E: MachineEvent> TaskExecutor for Agent<S, E> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run_once(&self, ctx: &Context, queue: &OutQueue, task: &TaskRef) -> Result<String> {
        let stage = Agent::run_once(self, ctx, queue, task).await?;
        Ok(format!("{stage:?}"))
    }
}

impl<S, E> std::fmt::Debug for Agent<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("llms", &self.llms.keys().collect::<Vec<_>>())
            .field("default_llm", &self.default_llm)
            .field("has_tools", &self.tools.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::Task;
    use crate::workflow::WorkflowBuilder;
    use serde_json::Map;
    use std::sync::Mutex as StdMutex;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Stage {
        Go,
        Done,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Ev {
        Finish,
    }

    struct Scripted {
        replies: StdMutex<Vec<Message>>,
    }

    impl Scripted {
        fn new(replies: Vec<Message>) -> Arc<Self> {
            Arc::new(Self {
                replies: StdMutex::new(replies),
            })
        }
    }

    #[async_trait]
    impl LanguageModel for Scripted {
        async fn completion(
            &self,
            _messages: &[Message],
            _config: &CompletionConfig,
        ) -> Result<Message> {
            let mut replies = self.replies.lock().unwrap();
            if replies.is_empty() {
                return Err(CoreError::Llm("script exhausted".into()));
            }
            Ok(replies.remove(0))
        }
    }

    fn simple_workflow() -> Workflow<Stage, Ev> {
        WorkflowBuilder::new([Stage::Go, Stage::Done], Stage::Go, [Stage::Done])
            .unwrap()
            .transition(Stage::Go, Ev::Finish, Stage::Done)
            .unwrap()
            .event_chain([Ev::Finish])
            .action(Stage::Go, |run| {
                Box::pin(async move {
                    let observed = run
                        .host
                        .observe(run.ctx, run.queue, run.task, None)
                        .await?;
                    let reply = run
                        .host
                        .think(
                            run.ctx,
                            run.queue,
                            run.task,
                            run.host.default_llm(),
                            observed,
                            run.workflow.completion_config(),
                        )
                        .await?;
                    run.task.set_output(reply.text());
                    Ok(Ev::Finish)
                })
            })
            .compile(1)
            .unwrap()
    }

    fn agent_with(replies: Vec<Message>) -> Agent<Stage, Ev> {
        Agent::builder("tester")
            .llm("main", Scripted::new(replies))
            .workflow(simple_workflow())
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn build_requires_workflow_and_llm() {
        let missing_wf: Result<Agent<Stage, Ev>> = Agent::builder("x")
            .llm("main", Scripted::new(vec![]))
            .build();
        assert!(matches!(missing_wf, Err(CoreError::Configuration(_))));

        let missing_llm: Result<Agent<Stage, Ev>> =
            Agent::builder("x").workflow(simple_workflow()).build();
        assert!(matches!(missing_llm, Err(CoreError::Configuration(_))));
    }

    #[tokio::test]
    async fn run_once_drives_the_workflow() {
        let agent = agent_with(vec![Message::assistant("42")]);
        let ctx = Context::new();
        let queue = OutQueue::bounded(8);
        let task = Task::builder("t").build().unwrap();

        let stage = agent.run_once(&ctx, &queue, &task).await.unwrap();
        assert_eq!(stage, Stage::Done);
        assert_eq!(task.output().as_deref(), Some("42"));
    }

    #[tokio::test]
    async fn observe_includes_protocol_and_running_context() {
        let agent = agent_with(vec![]);
        let ctx = Context::new();
        let queue = OutQueue::bounded(8);
        let task = Task::builder("t").protocol("<answer>text</answer>").build().unwrap();
        task.context(TaskState::Running).append(Message::user("hi"));

        let observed = agent.observe(&ctx, &queue, &task, None).await.unwrap();
        assert_eq!(observed.len(), 2);
        assert_eq!(observed[0].role, crate::messages::Role::System);
        assert_eq!(observed[0].text(), "<answer>text</answer>");
        assert_eq!(observed[1].text(), "hi");
    }

    #[tokio::test]
    async fn custom_observe_fn_overrides_default() {
        let agent = agent_with(vec![]);
        let ctx = Context::new();
        let queue = OutQueue::bounded(8);
        let task = Task::builder("t").protocol("ignored").build().unwrap();

        let project: ObserveFn = Arc::new(|task| vec![Message::user(task.title())]);
        let observed = agent
            .observe(&ctx, &queue, &task, Some(&project))
            .await
            .unwrap();
        assert_eq!(observed.len(), 1);
        assert_eq!(observed[0].text(), "t");
    }

    #[tokio::test]
    async fn hooks_run_in_registration_order() {
        let agent = agent_with(vec![]);
        let order = Arc::new(StdMutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = order.clone();
            agent.add_pre_observe_hook(tag, move |_ctx, _queue, _task| {
                let order = order.clone();
                Box::pin(async move {
                    order.lock().unwrap().push(tag);
                    Ok(HookOutcome::Continue)
                })
            });
        }

        let ctx = Context::new();
        let queue = OutQueue::bounded(8);
        let task = Task::builder("t").build().unwrap();
        agent.observe(&ctx, &queue, &task, None).await.unwrap();

        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }

    #[tokio::test]
    async fn removing_a_twice_registered_hook_removes_one_instance() {
        let agent = agent_with(vec![]);
        let count = Arc::new(StdMutex::new(0));

        for _ in 0..2 {
            let count = count.clone();
            agent.add_pre_observe_hook("dup", move |_ctx, _queue, _task| {
                let count = count.clone();
                Box::pin(async move {
                    *count.lock().unwrap() += 1;
                    Ok(HookOutcome::Continue)
                })
            });
        }

        assert!(agent.remove_pre_observe_hook("dup"));

        let ctx = Context::new();
        let queue = OutQueue::bounded(8);
        let task = Task::builder("t").build().unwrap();
        agent.observe(&ctx, &queue, &task, None).await.unwrap();

        assert_eq!(*count.lock().unwrap(), 1);
        assert!(agent.remove_pre_observe_hook("dup"));
        assert!(!agent.remove_pre_observe_hook("dup"));
    }

    #[tokio::test]
    async fn post_observe_mutates_in_place() {
        let agent = agent_with(vec![]);
        agent.add_post_observe_hook("inject", |_ctx, _queue, _task, observed| {
            Box::pin(async move {
                observed.push(Message::user("retrieved memory"));
                Ok(HookOutcome::Continue)
            })
        });

        let ctx = Context::new();
        let queue = OutQueue::bounded(8);
        let task = Task::builder("t").build().unwrap();
        let observed = agent.observe(&ctx, &queue, &task, None).await.unwrap();
        assert_eq!(observed.last().unwrap().text(), "retrieved memory");
    }

    #[tokio::test]
    async fn pre_act_interference_returns_flagged_tool_message() {
        let agent = agent_with(vec![]);
        agent.add_pre_act_hook("approval", |_ctx, _queue, _task| {
            Box::pin(async move { Ok(HookOutcome::Interfere("approval required".into())) })
        });

        let ctx = Context::new();
        let queue = OutQueue::bounded(8);
        let task = Task::builder("t").build().unwrap();
        let call = ToolCallRequest::new("search", Map::new());

        let result = agent.act(&ctx, &queue, &call, &task, None).await.unwrap();
        assert!(result.is_error);
        assert!(result.is_interference());
        assert_eq!(result.text(), "approval required");
        assert_eq!(result.tool_call_id.as_deref(), Some(call.id.as_str()));
        // The sentinel is recorded in the running context and on the queue.
        assert_eq!(task.context(TaskState::Running).len(), 1);
        queue.close();
        assert_eq!(queue.drain().await.len(), 1);
    }

    #[tokio::test]
    async fn act_answers_end_tool_synthetically() {
        let agent = agent_with(vec![]);
        let ctx = Context::new();
        let queue = OutQueue::bounded(8);
        let task = Task::builder("t").build().unwrap();

        let mut args = Map::new();
        args.insert("result".into(), serde_json::json!("final answer"));
        let call = ToolCallRequest::new("finish", args);

        let result = agent
            .act(&ctx, &queue, &call, &task, Some("finish"))
            .await
            .unwrap();
        assert!(!result.is_error);
        assert_eq!(result.text(), "final answer");
    }

    #[tokio::test]
    async fn act_without_tool_service_is_an_error_message() {
        let agent = agent_with(vec![]);
        let ctx = Context::new();
        let queue = OutQueue::bounded(8);
        let task = Task::builder("t").build().unwrap();
        let call = ToolCallRequest::new("search", Map::new());

        let result = agent.act(&ctx, &queue, &call, &task, None).await.unwrap();
        assert!(result.is_error);
        assert!(result.text().contains("no tool service"));
    }

    #[tokio::test]
    async fn think_unknown_llm_is_an_error() {
        let agent = agent_with(vec![]);
        let ctx = Context::new();
        let queue = OutQueue::bounded(8);
        let task = Task::builder("t").build().unwrap();
        let err = agent
            .think(&ctx, &queue, &task, "nope", Vec::new(), &CompletionConfig::new())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Llm(_)));
    }

    #[tokio::test]
    async fn pre_think_interference_is_recorded_and_streamed() {
        let agent = agent_with(vec![Message::assistant("never reached")]);
        agent.add_pre_think_hook("mask", |_ctx, _queue, _observed| {
            Box::pin(async move { Ok(HookOutcome::Interfere("redaction pending".into())) })
        });

        let ctx = Context::new();
        let queue = OutQueue::bounded(8);
        let task = Task::builder("t").build().unwrap();

        let reply = agent
            .think(&ctx, &queue, &task, "main", Vec::new(), &CompletionConfig::new())
            .await
            .unwrap();
        assert!(reply.is_error);
        assert!(reply.is_interference());
        assert_eq!(reply.text(), "redaction pending");

        // The sentinel reaches the running context without caller help...
        let history = task.context(TaskState::Running).snapshot();
        assert_eq!(history.len(), 1);
        assert!(history[0].is_interference());

        // ...and the queue, like any other think output.
        queue.close();
        let streamed = queue.drain().await;
        assert_eq!(streamed.len(), 1);
        assert!(streamed[0].is_interference());
        assert_eq!(streamed[0].text(), "redaction pending");
    }

    #[tokio::test]
    async fn caught_llm_errors_become_error_replies() {
        let agent = Agent::builder("tester")
            .llm("main", Scripted::new(vec![]))
            .workflow(simple_workflow())
            .catch_llm_errors(true)
            .build()
            .unwrap();
        let ctx = Context::new();
        let queue = OutQueue::bounded(8);
        let task = Task::builder("t").build().unwrap();

        let reply = agent
            .think(&ctx, &queue, &task, "main", Vec::new(), &CompletionConfig::new())
            .await
            .unwrap();
        assert!(reply.is_error);
        assert!(reply.text().contains("script exhausted"));
    }

    #[tokio::test]
    async fn post_think_can_rewrite_the_reply() {
        let agent = agent_with(vec![Message::assistant("MASKED-SECRET")]);
        agent.add_post_think_hook("unmask", |_ctx, _queue, _observed, reply| {
            Box::pin(async move {
                let text = reply.text().replace("MASKED-SECRET", "hello");
                *reply = Message::assistant(text);
                Ok(HookOutcome::Continue)
            })
        });

        let ctx = Context::new();
        let queue = OutQueue::bounded(8);
        let task = Task::builder("t").build().unwrap();
        let reply = agent
            .think(&ctx, &queue, &task, "main", Vec::new(), &CompletionConfig::new())
            .await
            .unwrap();
        assert_eq!(reply.text(), "hello");

        queue.close();
        let streamed = queue.drain().await;
        assert_eq!(streamed.len(), 1);
        assert_eq!(streamed[0].text(), "hello");
    }
}
