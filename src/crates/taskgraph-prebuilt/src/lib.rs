//! # taskgraph-prebuilt
//!
//! Ready-made workflow and agent builders on top of
//! [`taskgraph-core`](taskgraph_core):
//!
//! - [`react`] - the reason ⇄ act executor loop (the default executor for
//!   leaf tasks)
//! - [`reflect`] - draft → critique → revise with a bounded rejection loop
//! - [`orchestrate`] - sub-task planning from LLM-produced JSON, with a
//!   tolerant normalization pass before strict parsing
//!
//! A typical tree setup pairs an orchestrator with a ReAct executor:
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use taskgraph_core::Scheduler;
//! use taskgraph_prebuilt::{orchestrator_agent, OrchestrateOptions, ReactAgentBuilder};
//!
//! let executor = Arc::new(
//!     ReactAgentBuilder::new(model.clone())
//!         .with_tools(tools)
//!         .with_system_prompt("Solve the task you are given.")
//!         .build()?,
//! );
//! let planner = Arc::new(orchestrator_agent("planner", model, &OrchestrateOptions::default())?);
//!
//! let scheduler = Scheduler::builder()
//!     .executor(executor)
//!     .orchestrator(planner)
//!     .max_error_retry(2)
//!     .build()?;
//! ```

pub mod orchestrate;
pub mod react;
pub mod reflect;

pub use orchestrate::{
    normalize_llm_json, orchestrate_workflow, orchestrator_agent, parse_sub_tasks,
    OrchestrateEvent, OrchestrateOptions, OrchestrateStage, SubTaskSpec,
};
pub use react::{react_workflow, ReactAgentBuilder, ReactEvent, ReactOptions, ReactStage};
pub use reflect::{reflect_agent, reflect_workflow, ReflectEvent, ReflectOptions, ReflectStage};
