//! Reflect executor: draft → critique → revise
//!
//! A linear self-improvement chain with a bounded rejection loop:
//!
//! ```text
//! Draft ──Drafted──▶ Critique ──Critiqued──▶ Revise ──Revised──▶ End
//!   ▲                   │
//!   └──────Rejected─────┘   (bounded by max_rounds)
//! ```
//!
//! The critique stage asks the LLM for a verdict; a reply starting with
//! `REVISE` sends the workflow back to drafting, anything else approves.
//! The final revision becomes the task output.

use std::sync::Arc;
use taskgraph_core::agent::Agent;
use taskgraph_core::error::Result;
use taskgraph_core::llm::{CompletionConfig, LanguageModel};
use taskgraph_core::messages::Message;
use taskgraph_core::task::TaskState;
use taskgraph_core::workflow::{Workflow, WorkflowBuilder, WorkflowRun};

/// Stages of the reflect chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReflectStage {
    /// Produce a candidate answer.
    Draft,
    /// Judge the candidate.
    Critique,
    /// Produce the final answer from draft + critique.
    Revise,
    /// Terminal.
    End,
}

/// Events driving the reflect chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReflectEvent {
    /// Candidate produced.
    Drafted,
    /// Candidate accepted; go polish it.
    Critiqued,
    /// Candidate rejected; draft again.
    Rejected,
    /// Final answer produced.
    Revised,
}

/// Configuration for [`reflect_workflow`].
#[derive(Clone)]
pub struct ReflectOptions {
    /// How many rejection rounds are allowed (default 2).
    pub max_rounds: u32,
    /// Prompt for the draft stage.
    pub draft_prompt: String,
    /// Prompt for the critique stage.
    pub critique_prompt: String,
    /// Prompt for the revise stage.
    pub revise_prompt: String,
    /// Completion configuration for think calls.
    pub completion: CompletionConfig,
}

impl Default for ReflectOptions {
    fn default() -> Self {
        Self {
            max_rounds: 2,
            draft_prompt: "Draft an answer to the task.".to_string(),
            critique_prompt: "Critique the draft above. Reply APPROVE if it is good enough, \
                              or REVISE followed by what must change."
                .to_string(),
            revise_prompt: "Produce the final answer, applying the critique.".to_string(),
            completion: CompletionConfig::default(),
        }
    }
}

async fn prompted_think(
    run: WorkflowRun<'_, ReflectStage, ReflectEvent>,
    stage: ReflectStage,
) -> Result<Message> {
    let observe_fn = run.workflow.observe_fn(&stage);
    let mut observed = run
        .host
        .observe(run.ctx, run.queue, run.task, observe_fn.as_ref())
        .await?;
    if let Some(prompt) = run.workflow.prompt(&stage) {
        observed.push(Message::system(prompt));
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
    if !reply.is_interference() {
        run.task.context(TaskState::Running).append(reply.clone());
    }
    Ok(reply)
}

/// Build the reflect workflow.
pub fn reflect_workflow(
    options: &ReflectOptions,
) -> Result<Workflow<ReflectStage, ReflectEvent>> {
    use ReflectEvent::*;
    use ReflectStage::*;

    WorkflowBuilder::new([Draft, Critique, Revise, End], Draft, [End])?
        .transition(Draft, Drafted, Critique)?
        .transition(Critique, Critiqued, Revise)?
        .transition(Critique, Rejected, Draft)?
        .transition(Revise, Revised, End)?
        .event_chain([Drafted, Critiqued, Revised])
        .prompt(Draft, options.draft_prompt.clone())
        .prompt(Critique, options.critique_prompt.clone())
        .prompt(Revise, options.revise_prompt.clone())
        .completion(options.completion.clone())
        .action(Draft, |run| {
            Box::pin(async move {
                prompted_think(run, Draft).await?;
                Ok(Drafted)
            })
        })
        .action(Critique, |run| {
            Box::pin(async move {
                let verdict = prompted_think(run, Critique).await?;
                if verdict.text().trim_start().starts_with("REVISE") {
                    Ok(Rejected)
                } else {
                    Ok(Critiqued)
                }
            })
        })
        .action(Revise, |run| {
            Box::pin(async move {
                let final_answer = prompted_think(run, Revise).await?;
                run.task.set_output(final_answer.text());
                Ok(Revised)
            })
        })
        .compile(options.max_rounds)
}

/// Build a reflect executor agent around one model.
pub fn reflect_agent(
    name: impl Into<String>,
    model: Arc<dyn LanguageModel>,
    options: &ReflectOptions,
) -> Result<Agent<ReflectStage, ReflectEvent>> {
    Agent::builder(name)
        .llm("main", model)
        .workflow(reflect_workflow(options)?)
        .build()
}
