//! Error types for state machines, tasks, agents, and scheduling
//!
//! All fallible operations in the crate return [`Result`], an alias over
//! [`CoreError`]. The taxonomy separates *structural* failures (invalid
//! machine definitions, missing handlers, exhausted cycle budgets) from
//! *transient* ones: tool failures and human interference are represented as
//! ordinary error-flagged messages, never as `CoreError` variants, so they
//! flow through task context instead of unwinding the drive loop.
//!
//! # Error Categories
//!
//! ```text
//! CoreError
//! ├── Compilation         - machine validation failure (setup time only)
//! ├── NoTransition        - event has no mapping from the current state
//! ├── CycleLimitExceeded  - per-state revisit budget exhausted
//! ├── DepthLimitExceeded  - task tree deeper than the root allows
//! ├── CycleInTree         - child/parent link would create a cycle
//! ├── NoHandler           - scheduler has no handler for a state
//! ├── MissingAction       - workflow stage has no action function
//! ├── Llm / Tool          - adapter- or service-level failures
//! ├── QueueClosed         - put() after close()
//! ├── Configuration       - builder misuse
//! └── Serialization       - serde_json errors
//! ```

use thiserror::Error;

/// Convenience result type using [`CoreError`].
pub type Result<T> = std::result::Result<T, CoreError>;

/// Why a state machine failed to compile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilationReason {
    /// One or more valid states cannot be reached from the initial state.
    Unreachable,
    /// One or more valid states have no forward path to any end state.
    NoPathToEnd,
    /// A transition or designated state references a state outside the
    /// valid set, or the machine was mutated after compilation.
    InvalidState,
}

impl std::fmt::Display for CompilationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unreachable => write!(f, "unreachable states"),
            Self::NoPathToEnd => write!(f, "no path to an end state"),
            Self::InvalidState => write!(f, "invalid state reference"),
        }
    }
}

/// Error type shared by every component in the crate.
#[derive(Error, Debug)]
pub enum CoreError {
    /// State machine validation failed at `compile()` (or a transition was
    /// registered against an unknown or already-compiled machine).
    ///
    /// Never raised at runtime; a compiled machine only produces
    /// [`CoreError::NoTransition`] or [`CoreError::CycleLimitExceeded`].
    #[error("state machine compilation failed ({reason}): [{}]", states.join(", "))]
    Compilation {
        /// What kind of validation failed.
        reason: CompilationReason,
        /// The offending states, as debug-rendered names.
        states: Vec<String>,
    },

    /// The event has no transition registered from the current state.
    ///
    /// Indicates a logic bug in handler or action code; propagates out of
    /// `Scheduler::schedule` without recovery.
    #[error("no transition from state '{state}' on event '{event}'")]
    NoTransition {
        /// Debug-rendered current state.
        state: String,
        /// Debug-rendered offending event.
        event: String,
    },

    /// A state was re-entered more often than its revisit budget allows.
    ///
    /// The budget is set at `compile(max_revisit)`; retry loops consume it.
    #[error("revisit budget exhausted for state '{state}'")]
    CycleLimitExceeded {
        /// Debug-rendered state whose budget ran out.
        state: String,
    },

    /// Adding a sub-task would exceed the tree's maximum depth.
    #[error("task depth {depth} exceeds the maximum of {max_depth}")]
    DepthLimitExceeded {
        /// Depth the child would have had.
        depth: usize,
        /// Maximum depth configured on the root task.
        max_depth: usize,
    },

    /// Adding a sub-task would create a cycle (or break the single-parent
    /// invariant) in the task tree.
    #[error("task '{task}' cannot be attached without creating a cycle")]
    CycleInTree {
        /// Title or id of the offending task.
        task: String,
    },

    /// The scheduler has no `on_state` handler for a non-terminal state.
    #[error("no handler registered for task state '{state}'")]
    NoHandler {
        /// The unhandled task state.
        state: String,
    },

    /// A workflow reached a non-terminal stage that has no action function.
    #[error("no action registered for workflow stage '{stage}'")]
    MissingAction {
        /// Debug-rendered stage.
        stage: String,
    },

    /// A language-model adapter reported a failure.
    #[error("llm error: {0}")]
    Llm(String),

    /// A tool-service transport failure that could not be folded into a
    /// tool-result message.
    #[error("tool error: {0}")]
    Tool(String),

    /// `put()` was called on a queue that has been closed.
    #[error("queue is closed")]
    QueueClosed,

    /// A builder was used inconsistently (missing executor, unknown LLM
    /// name, empty state set, ...).
    #[error("configuration error: {0}")]
    Configuration(String),

    /// JSON serialization/deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    /// Build a [`CoreError::Compilation`] from debug-renderable states.
    pub fn compilation<S: std::fmt::Debug>(reason: CompilationReason, states: &[S]) -> Self {
        Self::Compilation {
            reason,
            states: states.iter().map(|s| format!("{s:?}")).collect(),
        }
    }

    /// Build a [`CoreError::NoTransition`] from debug-renderable parts.
    pub fn no_transition<S: std::fmt::Debug, E: std::fmt::Debug>(state: &S, event: &E) -> Self {
        Self::NoTransition {
            state: format!("{state:?}"),
            event: format!("{event:?}"),
        }
    }

    /// Build a [`CoreError::CycleLimitExceeded`] for a state.
    pub fn cycle_limit<S: std::fmt::Debug>(state: &S) -> Self {
        Self::CycleLimitExceeded {
            state: format!("{state:?}"),
        }
    }

    /// True for the two runtime transition failures that a supervisor may
    /// want to treat as "cancel the root" rather than a crash.
    pub fn is_transition_failure(&self) -> bool {
        matches!(
            self,
            Self::NoTransition { .. } | Self::CycleLimitExceeded { .. }
        )
    }
}
