//! # taskgraph-core
//!
//! Core execution engine for task-driven agent orchestration: three
//! interlocking state machines plus the agent loop that animates them.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ Scheduler (state-driven)                                     │
//! │   watches task.state → runs handler → applies returned event │
//! │                                                              │
//! │   ┌────────────────┐     run_once      ┌───────────────────┐ │
//! │   │ Task            │◀───────────────── │ Agent             │ │
//! │   │  CREATED        │   (via handler)   │  observe / think  │ │
//! │   │  RUNNING  ⟲     │                   │  / act + hooks    │ │
//! │   │  FINISHED       │                   │        │          │ │
//! │   │  CANCELED       │                   │        ▼          │ │
//! │   └────────────────┘                   │ ┌───────────────┐ │ │
//! │         │ children (tree,              │ │ Workflow       │ │ │
//! │         ▼  insertion order)            │ │ (self-driving) │ │ │
//! │   ┌────────────────┐                   │ └───────────────┘ │ │
//! │   │ sub-tasks ...   │                   └───────────────────┘ │
//! │   └────────────────┘                                          │
//! │                          messages ▼                           │
//! │                       ┌──────────────┐                        │
//! │                       │ OutQueue      │──▶ external observer  │
//! │                       └──────────────┘                        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! - [`machine`] - generic compiled [`StateMachine`] with reachability
//!   validation and per-state revisit budgets
//! - [`task`] - the fixed CREATED/RUNNING/FINISHED/CANCELED lifecycle,
//!   per-state context buffers, and the task tree
//! - [`workflow`] - self-driving stage machines (the shape of one attempt)
//! - [`agent`] - observe/think/act primitives wrapped in ordered hook
//!   chains, plus `run_once`
//! - [`scheduler`] - the state-driven drive loop, sub-task recursion,
//!   retry and cancellation semantics
//! - [`messages`], [`tool`], [`llm`], [`queue`], [`context`] - the data
//!   model and the three inward-facing contracts external collaborators
//!   implement
//!
//! LLM providers, tool brokers, and memory stores live *outside* this
//! crate: implement [`LanguageModel`] and [`ToolService`], register hooks,
//! and the core stays provider-agnostic.
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskgraph_core::{Agent, Context, OutQueue, Scheduler, Task};
//!
//! let agent = Arc::new(
//!     Agent::builder("executor")
//!         .llm("main", my_model)
//!         .tool_service(my_tools)
//!         .workflow(my_workflow)
//!         .build()?,
//! );
//! let scheduler = Scheduler::builder()
//!     .executor(agent)
//!     .max_error_retry(2)
//!     .build()?;
//!
//! let task = Task::builder("answer the question")
//!     .protocol("<answer>plain text</answer>")
//!     .input(serde_json::json!("What is 2+2?"))
//!     .build()?;
//!
//! let ctx = Context::new();
//! let queue = OutQueue::bounded(64);
//! scheduler.execute(&ctx, &queue, &task).await?;
//! assert!(task.is_terminal());
//! ```

pub mod agent;
pub mod context;
pub mod error;
pub mod llm;
pub mod machine;
pub mod messages;
pub mod queue;
pub mod scheduler;
pub mod task;
pub mod tool;
pub mod workflow;

pub use agent::{Agent, AgentBuilder, HookOutcome, TaskExecutor};
pub use context::Context;
pub use error::{CompilationReason, CoreError, Result};
pub use llm::{CompletionConfig, LanguageModel};
pub use machine::{StateMachine, Transition, TransitionAction};
pub use messages::{
    CompletionUsage, ContentBlock, Message, Role, StopReason, ToolCallRequest,
};
pub use queue::{OutQueue, Queue};
pub use scheduler::{OnStateChangedFn, OnStateFn, Scheduler, SchedulerBuilder};
pub use task::{ContextBuffer, Task, TaskBuilder, TaskEvent, TaskRef, TaskState};
pub use tool::{Tool, ToolRegistry, ToolService};
pub use workflow::{ObserveFn, Workflow, WorkflowAction, WorkflowBuilder, WorkflowHost, WorkflowRun};
