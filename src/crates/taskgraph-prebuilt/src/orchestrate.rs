//! Orchestrate workflow: decompose a task into sub-tasks
//!
//! A single-stage planning workflow: observe the task (title, input,
//! protocol, and whatever planning history has accumulated), ask the LLM
//! for a JSON array of sub-task specs, and attach one child task per spec.
//!
//! LLMs hand back *almost*-JSON often enough that strict parsing alone
//! would be brittle: a normalization pass strips code fences and trailing
//! commas before `serde_json` gets to be strict. Output that still fails to
//! parse does not crash the orchestration - the complaint is recorded in
//! the task's planning context and the stage retries, bounded by the
//! workflow's revisit budget.
//!
//! Planning conversation lives in the task's `Created` context buffer, kept
//! separate from the `Running` buffer the executor will use.

use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use taskgraph_core::agent::Agent;
use taskgraph_core::error::Result;
use taskgraph_core::llm::{CompletionConfig, LanguageModel};
use taskgraph_core::messages::Message;
use taskgraph_core::task::{Task, TaskState};
use taskgraph_core::workflow::{ObserveFn, Workflow, WorkflowBuilder};

/// Stages of the orchestrate workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrchestrateStage {
    /// Ask the LLM for a plan and attach the sub-tasks.
    Plan,
    /// Terminal.
    End,
}

/// Events driving the orchestrate workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrchestrateEvent {
    /// Sub-tasks attached (or the task was judged atomic).
    Planned,
    /// Unusable output; ask again.
    Retry,
}

/// One sub-task as described by the LLM.
#[derive(Debug, Clone, Deserialize)]
pub struct SubTaskSpec {
    /// Sub-task title.
    pub title: String,
    /// Task type label.
    #[serde(default = "default_task_type")]
    pub task_type: String,
    /// Protocol string for the sub-task.
    #[serde(default)]
    pub protocol: String,
    /// Input payload.
    #[serde(default)]
    pub input: Value,
    /// Routing tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

fn default_task_type() -> String {
    "task".to_string()
}

const DEFAULT_PLAN_PROMPT: &str = "Decompose the task into ordered sub-tasks. Reply with a JSON \
     array; each element is an object with \"title\" (required) and \
     optionally \"task_type\", \"protocol\", \"input\", and \"tags\". \
     Reply with an empty array if the task is atomic.";

/// Configuration for [`orchestrate_workflow`].
#[derive(Clone)]
pub struct OrchestrateOptions {
    /// How many unparseable plans to tolerate (default 2).
    pub max_parse_retries: u32,
    /// Prompt prepended to every planning request.
    pub plan_prompt: String,
    /// Retry budget given to each created sub-task (default 1).
    pub child_max_retries: u32,
    /// Completion configuration; `format_json` is forced on.
    pub completion: CompletionConfig,
}

impl Default for OrchestrateOptions {
    fn default() -> Self {
        Self {
            max_parse_retries: 2,
            plan_prompt: DEFAULT_PLAN_PROMPT.to_string(),
            child_max_retries: 1,
            completion: CompletionConfig::default(),
        }
    }
}

static FENCE_RE: OnceLock<Regex> = OnceLock::new();
static TRAILING_COMMA_RE: OnceLock<Regex> = OnceLock::new();

/// Normalize almost-JSON LLM output: unwrap a ```-fence and drop trailing
/// commas. Anything else stays untouched for the strict parser to judge.
pub fn normalize_llm_json(raw: &str) -> String {
    let trimmed = raw.trim();
    let fence = FENCE_RE
        .get_or_init(|| Regex::new(r"(?s)^```[a-zA-Z]*\s*(.*?)\s*```$").expect("valid regex"));
    let inner = fence
        .captures(trimmed)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(trimmed);
    let trailing = TRAILING_COMMA_RE
        .get_or_init(|| Regex::new(r",\s*([}\]])").expect("valid regex"));
    trailing.replace_all(inner, "$1").into_owned()
}

/// Parse a plan into sub-task specs.
///
/// Accepts a top-level array, or an object wrapping the array under
/// `sub_tasks` / `subtasks` / `tasks`.
pub fn parse_sub_tasks(raw: &str) -> Result<Vec<SubTaskSpec>> {
    let normalized = normalize_llm_json(raw);
    let value: Value = serde_json::from_str(&normalized)?;
    let candidate = match value {
        Value::Object(mut obj) => ["sub_tasks", "subtasks", "tasks"]
            .iter()
            .find_map(|key| obj.remove(*key))
            .unwrap_or(Value::Object(obj)),
        other => other,
    };
    Ok(serde_json::from_value(candidate)?)
}

fn default_plan_observation() -> ObserveFn {
    Arc::new(|task| {
        let mut observed = Vec::new();
        let protocol = task.protocol();
        if !protocol.is_empty() {
            observed.push(Message::system(protocol));
        }
        observed.push(Message::user(format!(
            "Task: {}\nInput: {}",
            task.title(),
            task.input()
        )));
        observed.extend(task.context(TaskState::Created).snapshot());
        observed
    })
}

/// Build the orchestrate workflow.
pub fn orchestrate_workflow(
    options: &OrchestrateOptions,
) -> Result<Workflow<OrchestrateStage, OrchestrateEvent>> {
    use OrchestrateEvent::*;
    use OrchestrateStage::*;

    let child_max_retries = options.child_max_retries;
    WorkflowBuilder::new([Plan, End], Plan, [End])?
        .transition(Plan, Planned, End)?
        .transition(Plan, Retry, Plan)?
        .event_chain([Planned])
        .prompt(Plan, options.plan_prompt.clone())
        .observe(Plan, default_plan_observation())
        .completion(options.completion.clone().with_format_json(true))
        .action(Plan, move |run| {
            Box::pin(async move {
                let planning = run.task.context(TaskState::Created);

                let observe_fn = run.workflow.observe_fn(&Plan);
                let mut observed = run
                    .host
                    .observe(run.ctx, run.queue, run.task, observe_fn.as_ref())
                    .await?;
                if let Some(prompt) = run.workflow.prompt(&Plan) {
                    observed.insert(0, Message::system(prompt));
                }

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
                // Interference sentinels are recorded by the think
                // primitive (in the Running buffer); only ordinary replies
                // belong to the planning history.
                if !reply.is_interference() {
                    planning.append(reply.clone());
                }

                if reply.is_error {
                    planning.append(Message::user(
                        "planning was interrupted; produce the JSON plan again",
                    ));
                    return Ok(Retry);
                }

                let specs = match parse_sub_tasks(&reply.text()) {
                    Ok(specs) => specs,
                    Err(err) => {
                        tracing::warn!(task = %run.task.title(), error = %err, "unparseable plan");
                        planning.append(Message::user(format!(
                            "the plan was not valid JSON ({err}); reply with only a JSON \
                             array of sub-task objects"
                        )));
                        return Ok(Retry);
                    }
                };

                for spec in specs {
                    let child = Task::builder(spec.title)
                        .task_type(spec.task_type)
                        .protocol(spec.protocol)
                        .input(spec.input)
                        .tags(spec.tags)
                        .max_retries(child_max_retries)
                        .completion(run.task.completion())
                        .build()?;
                    run.task.add_sub_task(child)?;
                }
                tracing::debug!(
                    task = %run.task.title(),
                    children = run.task.sub_tasks().len(),
                    "plan attached"
                );
                Ok(Planned)
            })
        })
        .compile(options.max_parse_retries)
}

/// Build an orchestrator agent around one model.
pub fn orchestrator_agent(
    name: impl Into<String>,
    model: Arc<dyn LanguageModel>,
    options: &OrchestrateOptions,
) -> Result<Agent<OrchestrateStage, OrchestrateEvent>> {
    Agent::builder(name)
        .llm("main", model)
        .workflow(orchestrate_workflow(options)?)
        .build()
}
