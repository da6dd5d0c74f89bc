//! Tasks: status-bearing units of work forming a tree
//!
//! A [`Task`] is a [`StateMachine`] specialized to the fixed lifecycle
//!
//! ```text
//!            Planned                Done
//!  CREATED ─────────▶ RUNNING ─────────────▶ FINISHED
//!     ▲                 │  ▲ │
//!     │      Init       │  └─┘ Planned (retry, consumes revisit budget)
//!     └─────────────────┘
//!                       │      Cancel
//!                       └─────────────────▶ CANCELED
//! ```
//!
//! plus the payload that makes it a unit of *work*: typed input, textual
//! output, error info, tags, a protocol string describing the expected
//! input/output shape, and one conversation [`ContextBuffer`] per state so
//! state-specific prompts do not pollute one another.
//!
//! Tasks may form a tree: children are owned in insertion order, the parent
//! link is a non-owning [`Weak`] back-reference. Depth and acyclicity are
//! validated on [`add_sub_task`](Task::add_sub_task).
//!
//! A task's state is only ever changed by events - typically applied by the
//! scheduler's drive loop. Handler code mutates the `Running` context
//! buffer and the output/error fields, never the state directly.

use crate::error::{CoreError, Result};
use crate::llm::CompletionConfig;
use crate::machine::StateMachine;
use crate::messages::Message;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::{Arc, Weak};

/// Shared handle to a task.
pub type TaskRef = Arc<Task>;

/// Lifecycle states of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Created, not yet planned.
    Created,
    /// Being executed (or waiting on children).
    Running,
    /// Terminal: completed with output.
    Finished,
    /// Terminal: cancelled, `error_info` describes why.
    Canceled,
}

impl TaskState {
    /// Whether this state is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Canceled)
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

/// Events that drive the task lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskEvent {
    /// Planning finished; start (or retry) execution.
    Planned,
    /// Execution succeeded.
    Done,
    /// Reset to `Created` for re-planning.
    Init,
    /// Abort execution.
    Cancel,
}

impl std::fmt::Display for TaskEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Planned => write!(f, "planned"),
            Self::Done => write!(f, "done"),
            Self::Init => write!(f, "init"),
            Self::Cancel => write!(f, "cancel"),
        }
    }
}

/// Build the fixed lifecycle machine, compiled with `max_retries` as the
/// per-state revisit budget.
///
/// Shared by [`Task`] and the scheduler's transition authority so the two
/// can never disagree about the table.
pub fn lifecycle_machine(max_retries: u32) -> Result<StateMachine<TaskState, TaskEvent>> {
    use TaskEvent::*;
    use TaskState::*;

    let mut machine = StateMachine::new(
        [Created, Running, Finished, Canceled],
        Created,
        [Finished, Canceled],
    )?;
    machine.set_transition(Created, Planned, Running, None)?;
    machine.set_transition(Running, Done, Finished, None)?;
    machine.set_transition(Running, Planned, Running, None)?;
    machine.set_transition(Running, Init, Created, None)?;
    machine.set_transition(Running, Cancel, Canceled, None)?;
    machine.compile(max_retries)?;
    Ok(machine)
}

/// Ordered list of messages accumulated for one task state.
///
/// Cloneable handle; clones share the underlying buffer.
#[derive(Clone, Default)]
pub struct ContextBuffer {
    messages: Arc<Mutex<Vec<Message>>>,
}

impl ContextBuffer {
    /// Create an empty buffer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one message.
    pub fn append(&self, message: Message) {
        self.messages.lock().push(message);
    }

    /// Copy of the current contents, in order.
    pub fn snapshot(&self) -> Vec<Message> {
        self.messages.lock().clone()
    }

    /// Drop all messages.
    pub fn clear(&self) {
        self.messages.lock().clear();
    }

    /// Number of buffered messages.
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Clone of the most recent message, if any.
    pub fn last(&self) -> Option<Message> {
        self.messages.lock().last().cloned()
    }
}

impl std::fmt::Debug for ContextBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextBuffer")
            .field("len", &self.len())
            .finish()
    }
}

struct TaskInner {
    machine: StateMachine<TaskState, TaskEvent>,
    title: String,
    task_type: String,
    tags: HashSet<String>,
    protocol: String,
    template: Option<String>,
    input: Value,
    output: Option<String>,
    error_info: Option<String>,
    max_depth: usize,
    completion: CompletionConfig,
    contexts: std::collections::HashMap<TaskState, ContextBuffer>,
    parent: Weak<Task>,
    children: Vec<TaskRef>,
}

/// A hierarchical, status-bearing unit of work.
///
/// `Task` is `Send + Sync`; all accessors take `&self` and lock an internal
/// mutex for the duration of the call only - never across an `await`.
/// Construct through [`Task::builder`].
pub struct Task {
    inner: Mutex<TaskInner>,
}

/// Builder for [`Task`]; see [`Task::builder`].
pub struct TaskBuilder {
    title: String,
    task_type: String,
    tags: HashSet<String>,
    protocol: String,
    template: Option<String>,
    input: Value,
    max_depth: usize,
    max_retries: u32,
    completion: CompletionConfig,
}

impl TaskBuilder {
    /// Set the task type label.
    pub fn task_type(mut self, task_type: impl Into<String>) -> Self {
        self.task_type = task_type.into();
        self
    }

    /// Add routing tags.
    pub fn tags<I: IntoIterator<Item = T>, T: Into<String>>(mut self, tags: I) -> Self {
        self.tags.extend(tags.into_iter().map(Into::into));
        self
    }

    /// Set the protocol string (free-form input/output shape description).
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Set the prompt template name.
    pub fn template(mut self, template: impl Into<String>) -> Self {
        self.template = Some(template.into());
        self
    }

    /// Set the input payload.
    pub fn input(mut self, input: Value) -> Self {
        self.input = input;
        self
    }

    /// Maximum depth of the tree rooted at this task (default 3).
    pub fn max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Revisit budget for every lifecycle state (default 1); bounds the
    /// `Running -> Running` retry loop and `Init` re-planning.
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Completion configuration used when an agent works this task.
    pub fn completion(mut self, completion: CompletionConfig) -> Self {
        self.completion = completion;
        self
    }

    /// Compile the lifecycle machine and build the task.
    pub fn build(self) -> Result<TaskRef> {
        let machine = lifecycle_machine(self.max_retries)?;
        Ok(Arc::new(Task {
            inner: Mutex::new(TaskInner {
                machine,
                title: self.title,
                task_type: self.task_type,
                tags: self.tags,
                protocol: self.protocol,
                template: self.template,
                input: self.input,
                output: None,
                error_info: None,
                max_depth: self.max_depth,
                completion: self.completion,
                contexts: std::collections::HashMap::new(),
                parent: Weak::new(),
                children: Vec::new(),
            }),
        }))
    }
}

impl Task {
    /// Start building a task with the given title.
    pub fn builder(title: impl Into<String>) -> TaskBuilder {
        TaskBuilder {
            title: title.into(),
            task_type: "task".to_string(),
            tags: HashSet::new(),
            protocol: String::new(),
            template: None,
            input: Value::Null,
            max_depth: 3,
            max_retries: 1,
            completion: CompletionConfig::default(),
        }
    }

    /// The underlying machine's unique id.
    pub fn id(&self) -> String {
        self.inner.lock().machine.id().to_string()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TaskState {
        *self.inner.lock().machine.current_state()
    }

    /// Whether the task is in a terminal state.
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// Apply a lifecycle event, returning the new state.
    ///
    /// Propagates `NoTransition` and `CycleLimitExceeded` from the machine;
    /// on failure the state is unchanged.
    pub async fn handle_event(&self, event: TaskEvent) -> Result<TaskState> {
        let (from, to, action) = self.inner.lock().machine.apply(event)?;
        tracing::debug!(
            task = %self.title(),
            from = %from,
            event = %event,
            to = %to,
            "task transition"
        );
        if let Some(action) = action {
            action(crate::machine::Transition { from, event, to }).await?;
        }
        Ok(to)
    }

    /// Remaining re-entries allowed for a lifecycle state.
    pub fn remaining_revisits(&self, state: TaskState) -> u32 {
        self.inner
            .lock()
            .machine
            .remaining_revisits(&state)
            .unwrap_or(0)
    }

    /// Return the machine to `Created` and refill revisit budgets.
    ///
    /// Context buffers, output, and error info are left untouched.
    pub fn reset(&self) {
        self.inner.lock().machine.reset();
    }

    /// The task title.
    pub fn title(&self) -> String {
        self.inner.lock().title.clone()
    }

    /// Replace the task title.
    pub fn set_title(&self, title: impl Into<String>) {
        self.inner.lock().title = title.into();
    }

    /// The task type label.
    pub fn task_type(&self) -> String {
        self.inner.lock().task_type.clone()
    }

    /// Routing tags.
    pub fn tags(&self) -> HashSet<String> {
        self.inner.lock().tags.clone()
    }

    /// The protocol string.
    pub fn protocol(&self) -> String {
        self.inner.lock().protocol.clone()
    }

    /// The prompt template name, if any.
    pub fn template(&self) -> Option<String> {
        self.inner.lock().template.clone()
    }

    /// The input payload.
    pub fn input(&self) -> Value {
        self.inner.lock().input.clone()
    }

    /// Replace the input payload.
    pub fn set_input(&self, input: Value) {
        self.inner.lock().input = input;
    }

    /// The output, if produced.
    pub fn output(&self) -> Option<String> {
        self.inner.lock().output.clone()
    }

    /// Store the output.
    pub fn set_output(&self, output: impl Into<String>) {
        self.inner.lock().output = Some(output.into());
    }

    /// Store the output and transition `Running -> Finished`.
    pub async fn set_completed(&self, output: impl Into<String>) -> Result<()> {
        self.set_output(output);
        self.handle_event(TaskEvent::Done).await?;
        Ok(())
    }

    /// The completion configuration.
    pub fn completion(&self) -> CompletionConfig {
        self.inner.lock().completion.clone()
    }

    /// Record error information. Does not change state; the scheduler
    /// decides whether to retry or cancel.
    pub fn set_error(&self, info: impl Into<String>) {
        self.inner.lock().error_info = Some(info.into());
    }

    /// Clear error information.
    pub fn clean_error(&self) {
        self.inner.lock().error_info = None;
    }

    /// Whether error information is set.
    pub fn is_error(&self) -> bool {
        self.inner.lock().error_info.is_some()
    }

    /// The recorded error information, if any.
    pub fn error_info(&self) -> Option<String> {
        self.inner.lock().error_info.clone()
    }

    /// The conversation buffer for one lifecycle state, created lazily.
    pub fn context(&self, state: TaskState) -> ContextBuffer {
        self.inner
            .lock()
            .contexts
            .entry(state)
            .or_default()
            .clone()
    }

    // --- tree operations -------------------------------------------------

    /// Attach `child` as the last sub-task.
    ///
    /// Validates the depth limit (against this tree's root), acyclicity,
    /// and the single-parent invariant.
    pub fn add_sub_task(self: &Arc<Self>, child: TaskRef) -> Result<()> {
        let depth = self.current_depth() + 1;
        let max_depth = self.root().max_depth();
        if depth > max_depth {
            return Err(CoreError::DepthLimitExceeded { depth, max_depth });
        }

        let child_id = child.id();
        // A descendant may not become an ancestor: reject if the child is
        // already on this node's ancestor chain (including this node).
        let mut cursor = Some(self.clone());
        while let Some(node) = cursor {
            if node.id() == child_id {
                return Err(CoreError::CycleInTree {
                    task: child.title(),
                });
            }
            cursor = node.parent();
        }
        if child.parent().is_some() {
            return Err(CoreError::CycleInTree {
                task: child.title(),
            });
        }

        child.inner.lock().parent = Arc::downgrade(self);
        self.inner.lock().children.push(child);
        Ok(())
    }

    /// Detach `child` if present; silently does nothing otherwise.
    pub fn remove_sub_task(&self, child: &TaskRef) {
        let child_id = child.id();
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.children.iter().position(|c| c.id() == child_id) {
            let removed = inner.children.remove(pos);
            drop(inner);
            removed.remove_parent();
        }
    }

    /// Detach every child.
    pub fn clear_sub_tasks(&self) {
        let children = std::mem::take(&mut self.inner.lock().children);
        for child in children {
            child.remove_parent();
        }
    }

    /// Children in insertion order.
    pub fn sub_tasks(&self) -> Vec<TaskRef> {
        self.inner.lock().children.clone()
    }

    /// The parent, if attached and still alive.
    pub fn parent(&self) -> Option<TaskRef> {
        self.inner.lock().parent.upgrade()
    }

    /// Drop the parent back-reference.
    pub fn remove_parent(&self) {
        self.inner.lock().parent = Weak::new();
    }

    /// Whether this task has no parent.
    pub fn is_root(&self) -> bool {
        self.parent().is_none()
    }

    /// Whether this task has no children.
    pub fn is_leaf(&self) -> bool {
        self.inner.lock().children.is_empty()
    }

    /// Distance from the root (0 for a root).
    pub fn current_depth(&self) -> usize {
        let mut depth = 0;
        let mut cursor = self.parent();
        while let Some(node) = cursor {
            depth += 1;
            cursor = node.parent();
        }
        depth
    }

    /// The root of this task's tree (itself, for a root).
    pub fn root(self: &Arc<Self>) -> TaskRef {
        let mut node = self.clone();
        while let Some(parent) = node.parent() {
            node = parent;
        }
        node
    }

    /// The configured maximum tree depth.
    pub fn max_depth(&self) -> usize {
        self.inner.lock().max_depth
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("Task")
            .field("id", &inner.machine.id())
            .field("title", &inner.title)
            .field("state", inner.machine.current_state())
            .field("children", &inner.children.len())
            .field("error", &inner.error_info)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(title: &str) -> TaskRef {
        Task::builder(title).max_retries(2).build().unwrap()
    }

    #[tokio::test]
    async fn lifecycle_happy_path() {
        let t = task("t");
        assert_eq!(t.state(), TaskState::Created);
        t.handle_event(TaskEvent::Planned).await.unwrap();
        assert_eq!(t.state(), TaskState::Running);
        t.set_completed("42").await.unwrap();
        assert_eq!(t.state(), TaskState::Finished);
        assert_eq!(t.output().as_deref(), Some("42"));
        assert!(t.is_terminal());
    }

    #[tokio::test]
    async fn terminal_states_accept_nothing() {
        let t = task("t");
        t.handle_event(TaskEvent::Planned).await.unwrap();
        t.handle_event(TaskEvent::Cancel).await.unwrap();
        assert_eq!(t.state(), TaskState::Canceled);
        let err = t.handle_event(TaskEvent::Planned).await.unwrap_err();
        assert!(matches!(err, CoreError::NoTransition { .. }));
    }

    #[tokio::test]
    async fn retry_loop_consumes_revisits() {
        let t = Task::builder("t").max_retries(1).build().unwrap();
        t.handle_event(TaskEvent::Planned).await.unwrap();
        t.handle_event(TaskEvent::Planned).await.unwrap(); // retry 1
        let err = t.handle_event(TaskEvent::Planned).await.unwrap_err();
        assert!(matches!(err, CoreError::CycleLimitExceeded { .. }));
        assert_eq!(t.state(), TaskState::Running);
    }

    #[tokio::test]
    async fn init_resets_to_created() {
        let t = task("t");
        t.handle_event(TaskEvent::Planned).await.unwrap();
        t.handle_event(TaskEvent::Init).await.unwrap();
        assert_eq!(t.state(), TaskState::Created);
    }

    #[test]
    fn error_info_round_trip() {
        let t = task("t");
        assert!(!t.is_error());
        t.set_error("boom");
        assert!(t.is_error());
        assert_eq!(t.error_info().as_deref(), Some("boom"));
        t.clean_error();
        assert!(!t.is_error());
    }

    #[test]
    fn contexts_are_isolated_per_state() {
        let t = task("t");
        t.context(TaskState::Created).append(Message::user("plan"));
        t.context(TaskState::Running).append(Message::user("run"));
        t.context(TaskState::Running).append(Message::assistant("ok"));

        assert_eq!(t.context(TaskState::Created).len(), 1);
        assert_eq!(t.context(TaskState::Running).len(), 2);
        assert_eq!(
            t.context(TaskState::Running).last().unwrap().text(),
            "ok"
        );

        t.context(TaskState::Running).clear();
        assert!(t.context(TaskState::Running).is_empty());
        assert_eq!(t.context(TaskState::Created).len(), 1);
    }

    #[test]
    fn reset_keeps_contexts() {
        let t = task("t");
        t.context(TaskState::Running).append(Message::user("keep"));
        t.reset();
        assert_eq!(t.state(), TaskState::Created);
        assert_eq!(t.context(TaskState::Running).len(), 1);
    }

    #[test]
    fn tree_links_and_depth() {
        let root = task("root");
        let child = task("child");
        let grandchild = task("grandchild");

        root.add_sub_task(child.clone()).unwrap();
        child.add_sub_task(grandchild.clone()).unwrap();

        assert!(root.is_root());
        assert!(!root.is_leaf());
        assert!(grandchild.is_leaf());
        assert_eq!(grandchild.current_depth(), 2);
        assert_eq!(grandchild.root().id(), root.id());
        assert_eq!(child.parent().unwrap().id(), root.id());

        let order: Vec<String> = root.sub_tasks().iter().map(|t| t.title()).collect();
        assert_eq!(order, vec!["child"]);
    }

    #[test]
    fn depth_limit_is_enforced_against_the_root() {
        let root = Task::builder("root").max_depth(1).build().unwrap();
        let child = task("child");
        let grandchild = task("grandchild");

        root.add_sub_task(child.clone()).unwrap();
        // Child's own max_depth (3) does not matter; the root's does.
        let err = child.add_sub_task(grandchild).unwrap_err();
        assert!(matches!(err, CoreError::DepthLimitExceeded { depth: 2, max_depth: 1 }));
    }

    #[test]
    fn cycles_are_rejected() {
        let root = task("root");
        let child = task("child");
        root.add_sub_task(child.clone()).unwrap();

        // An ancestor may not become a descendant.
        let err = child.add_sub_task(root.clone()).unwrap_err();
        assert!(matches!(err, CoreError::CycleInTree { .. }));

        // Nor may a node adopt itself.
        let err = root.add_sub_task(root.clone()).unwrap_err();
        assert!(matches!(err, CoreError::CycleInTree { .. }));

        // A child with a parent cannot be attached elsewhere.
        let other = task("other");
        let err = other.add_sub_task(child).unwrap_err();
        assert!(matches!(err, CoreError::CycleInTree { .. }));
    }

    #[test]
    fn remove_sub_task_is_silent_when_absent() {
        let root = task("root");
        let child = task("child");
        let stranger = task("stranger");
        root.add_sub_task(child.clone()).unwrap();

        root.remove_sub_task(&stranger); // no-op
        assert_eq!(root.sub_tasks().len(), 1);

        root.remove_sub_task(&child);
        assert!(root.is_leaf());
        assert!(child.is_root());
    }

    #[test]
    fn clear_sub_tasks_detaches_children() {
        let root = task("root");
        let a = task("a");
        let b = task("b");
        root.add_sub_task(a.clone()).unwrap();
        root.add_sub_task(b.clone()).unwrap();

        root.clear_sub_tasks();
        assert!(root.is_leaf());
        assert!(a.is_root());
        assert!(b.is_root());
    }
}
