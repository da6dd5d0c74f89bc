//! Generic compiled state machine
//!
//! [`StateMachine`] is the foundation every other component builds on: the
//! task lifecycle, the workflow stages, and the scheduler's transition
//! authority are all instances of the same generic machine over a
//! user-chosen state/event pair.
//!
//! A machine goes through two phases:
//!
//! 1. **Definition** - [`StateMachine::new`] fixes the valid states, the
//!    initial state, and the end states; [`set_transition`](StateMachine::set_transition)
//!    registers edges, optionally carrying an async action.
//! 2. **Compilation** - [`compile`](StateMachine::compile) validates the
//!    graph and freezes it. After compilation the only mutating operations
//!    are [`handle_event`](StateMachine::handle_event) and
//!    [`reset`](StateMachine::reset).
//!
//! # Validation
//!
//! Compilation rejects the machine unless:
//!
//! - every valid state is reachable from the initial state (forward BFS),
//! - every valid state has a forward path to some end state (reverse BFS
//!   from the terminal set),
//! - every transition endpoint is a valid state.
//!
//! # Revisit budgets
//!
//! `compile(max_revisit)` grants every state the same budget of re-entries.
//! The first visit to a state is free; each later entry (including a
//! self-loop) consumes one unit. When a state's budget is exhausted the next
//! entry fails with [`CoreError::CycleLimitExceeded`] instead of silently
//! looping - this is what bounds retry loops in the task lifecycle.
//!
//! # Example
//!
//! ```rust
//! use taskgraph_core::machine::StateMachine;
//!
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum S { Idle, Busy, Done }
//! #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
//! enum E { Go, Finish }
//!
//! let mut machine = StateMachine::new([S::Idle, S::Busy, S::Done], S::Idle, [S::Done]).unwrap();
//! machine.set_transition(S::Idle, E::Go, S::Busy, None).unwrap();
//! machine.set_transition(S::Busy, E::Finish, S::Done, None).unwrap();
//! machine.compile(0).unwrap();
//!
//! assert!(machine.is_compiled());
//! assert_eq!(*machine.current_state(), S::Idle);
//! ```

use crate::error::{CompilationReason, CoreError, Result};
use futures::future::BoxFuture;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;
use uuid::Uuid;

/// Bounds required of a machine state type.
///
/// Blanket-implemented; plain fieldless enums deriving the std traits
/// qualify automatically.
pub trait MachineState: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> MachineState for T {}

/// Bounds required of a machine event type. Blanket-implemented.
pub trait MachineEvent: Clone + Eq + Hash + Debug + Send + Sync + 'static {}
impl<T: Clone + Eq + Hash + Debug + Send + Sync + 'static> MachineEvent for T {}

/// A transition that has just been applied, handed to its action.
///
/// Actions fire after the state update, so `to` is the machine's current
/// state at the time the action runs.
#[derive(Debug, Clone)]
pub struct Transition<S, E> {
    /// State the machine left.
    pub from: S,
    /// Event that triggered the transition.
    pub event: E,
    /// State the machine entered.
    pub to: S,
}

/// Async side effect attached to a transition.
///
/// The action must be non-blocking beyond logging; its errors propagate out
/// of [`StateMachine::handle_event`].
pub type TransitionAction<S, E> =
    Arc<dyn Fn(Transition<S, E>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

struct Edge<S, E> {
    to: S,
    action: Option<TransitionAction<S, E>>,
}

impl<S: Clone, E> Clone for Edge<S, E> {
    fn clone(&self) -> Self {
        Self {
            to: self.to.clone(),
            action: self.action.clone(),
        }
    }
}

/// Generic compiled transition graph over a state/event pair.
///
/// See the [module docs](self) for the definition/compilation lifecycle.
pub struct StateMachine<S, E> {
    id: String,
    valid_states: HashSet<S>,
    initial_state: S,
    current_state: S,
    end_states: HashSet<S>,
    transitions: HashMap<(S, E), Edge<S, E>>,
    revisit_budget: HashMap<S, u32>,
    max_revisit: u32,
    visited: HashSet<S>,
    compiled: bool,
}

impl<S: MachineState, E: MachineEvent> StateMachine<S, E> {
    /// Create an uncompiled machine.
    ///
    /// Fails with [`CoreError::Compilation`] (`InvalidState`) if the initial
    /// state or any end state is outside the valid set, or with
    /// [`CoreError::Configuration`] if either set is empty.
    pub fn new(
        valid_states: impl IntoIterator<Item = S>,
        initial_state: S,
        end_states: impl IntoIterator<Item = S>,
    ) -> Result<Self> {
        let valid_states: HashSet<S> = valid_states.into_iter().collect();
        let end_states: HashSet<S> = end_states.into_iter().collect();
        if valid_states.is_empty() {
            return Err(CoreError::Configuration(
                "state machine needs at least one valid state".into(),
            ));
        }
        if end_states.is_empty() {
            return Err(CoreError::Configuration(
                "state machine needs at least one end state".into(),
            ));
        }
        if !valid_states.contains(&initial_state) {
            return Err(CoreError::compilation(
                CompilationReason::InvalidState,
                &[&initial_state],
            ));
        }
        let stray: Vec<&S> = end_states
            .iter()
            .filter(|s| !valid_states.contains(s))
            .collect();
        if !stray.is_empty() {
            return Err(CoreError::compilation(CompilationReason::InvalidState, &stray));
        }

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            current_state: initial_state.clone(),
            initial_state,
            valid_states,
            end_states,
            transitions: HashMap::new(),
            revisit_budget: HashMap::new(),
            max_revisit: 0,
            visited: HashSet::new(),
            compiled: false,
        })
    }

    /// Register one edge `(from, event) -> to` with an optional action.
    ///
    /// Only valid before [`compile`](Self::compile); endpoints must be valid
    /// states. Registering the same `(from, event)` twice replaces the edge.
    pub fn set_transition(
        &mut self,
        from: S,
        event: E,
        to: S,
        action: Option<TransitionAction<S, E>>,
    ) -> Result<()> {
        if self.compiled {
            return Err(CoreError::Configuration(
                "cannot add transitions to a compiled state machine".into(),
            ));
        }
        let stray: Vec<&S> = [&from, &to]
            .into_iter()
            .filter(|s| !self.valid_states.contains(s))
            .collect();
        if !stray.is_empty() {
            return Err(CoreError::compilation(CompilationReason::InvalidState, &stray));
        }
        self.transitions.insert((from, event), Edge { to, action });
        Ok(())
    }

    /// Validate the transition graph and freeze the machine.
    ///
    /// `max_revisit` becomes every state's revisit budget; `0` forbids all
    /// re-entry (strict DAG execution).
    pub fn compile(&mut self, max_revisit: u32) -> Result<()> {
        if self.compiled {
            return Err(CoreError::Configuration(
                "state machine is already compiled".into(),
            ));
        }

        // Forward reachability from the initial state.
        let mut forward: HashSet<S> = HashSet::new();
        let mut frontier = VecDeque::from([self.initial_state.clone()]);
        forward.insert(self.initial_state.clone());
        while let Some(state) = frontier.pop_front() {
            for ((from, _), edge) in &self.transitions {
                if *from == state && forward.insert(edge.to.clone()) {
                    frontier.push_back(edge.to.clone());
                }
            }
        }
        let unreachable: Vec<&S> = self
            .valid_states
            .iter()
            .filter(|s| !forward.contains(s))
            .collect();
        if !unreachable.is_empty() {
            return Err(CoreError::compilation(
                CompilationReason::Unreachable,
                &unreachable,
            ));
        }

        // Reverse reachability from the terminal set.
        let mut backward: HashSet<S> = self.end_states.clone();
        let mut frontier: VecDeque<S> = self.end_states.iter().cloned().collect();
        while let Some(state) = frontier.pop_front() {
            for ((from, _), edge) in &self.transitions {
                if edge.to == state && backward.insert(from.clone()) {
                    frontier.push_back(from.clone());
                }
            }
        }
        let stranded: Vec<&S> = self
            .valid_states
            .iter()
            .filter(|s| !backward.contains(s))
            .collect();
        if !stranded.is_empty() {
            return Err(CoreError::compilation(
                CompilationReason::NoPathToEnd,
                &stranded,
            ));
        }

        self.max_revisit = max_revisit;
        self.revisit_budget = self
            .valid_states
            .iter()
            .map(|s| (s.clone(), max_revisit))
            .collect();
        self.visited = HashSet::from([self.initial_state.clone()]);
        self.compiled = true;
        tracing::debug!(machine_id = %self.id, max_revisit, "state machine compiled");
        Ok(())
    }

    /// Apply an event without running its action.
    ///
    /// Performs the lookup, revisit accounting, and state update, returning
    /// `(from, to, action)` so callers that guard the machine with a lock
    /// can drop the guard before awaiting the action. Most callers want
    /// [`handle_event`](Self::handle_event).
    pub fn apply(&mut self, event: E) -> Result<(S, S, Option<TransitionAction<S, E>>)> {
        if !self.compiled {
            return Err(CoreError::Configuration(
                "state machine must be compiled before handling events".into(),
            ));
        }
        let from = self.current_state.clone();
        let edge = self
            .transitions
            .get(&(from.clone(), event.clone()))
            .ok_or_else(|| CoreError::no_transition(&from, &event))?
            .clone();

        if self.visited.contains(&edge.to) {
            let budget = self
                .revisit_budget
                .get_mut(&edge.to)
                .ok_or_else(|| CoreError::cycle_limit(&edge.to))?;
            if *budget == 0 {
                return Err(CoreError::cycle_limit(&edge.to));
            }
            *budget -= 1;
        } else {
            self.visited.insert(edge.to.clone());
        }

        self.current_state = edge.to.clone();
        tracing::trace!(
            machine_id = %self.id,
            from = ?from,
            event = ?event,
            to = ?edge.to,
            "transition applied"
        );
        Ok((from, edge.to, edge.action))
    }

    /// Apply an event and run the transition's action, if any.
    ///
    /// The action fires after the state update, so it observes the new
    /// state. Returns the new state.
    pub async fn handle_event(&mut self, event: E) -> Result<S> {
        let (from, to, action) = self.apply(event.clone())?;
        if let Some(action) = action {
            action(Transition {
                from,
                event,
                to: to.clone(),
            })
            .await?;
        }
        Ok(to)
    }

    /// Return to the initial state and refill every revisit budget.
    ///
    /// Does not touch anything outside the machine; `Task` layers its own
    /// semantics (context buffers survive a reset) on top.
    pub fn reset(&mut self) {
        self.current_state = self.initial_state.clone();
        for budget in self.revisit_budget.values_mut() {
            *budget = self.max_revisit;
        }
        self.visited = HashSet::from([self.initial_state.clone()]);
    }

    /// Remaining re-entries allowed for `state`, or `None` before
    /// compilation / for an unknown state.
    pub fn remaining_revisits(&self, state: &S) -> Option<u32> {
        if !self.compiled {
            return None;
        }
        self.revisit_budget.get(state).copied()
    }

    /// The machine's unique identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The current state.
    pub fn current_state(&self) -> &S {
        &self.current_state
    }

    /// The initial state.
    pub fn initial_state(&self) -> &S {
        &self.initial_state
    }

    /// Whether [`compile`](Self::compile) has succeeded.
    pub fn is_compiled(&self) -> bool {
        self.compiled
    }

    /// The designated terminal states.
    pub fn end_states(&self) -> &HashSet<S> {
        &self.end_states
    }

    /// All valid states.
    pub fn valid_states(&self) -> &HashSet<S> {
        &self.valid_states
    }

    /// Whether the current state is terminal.
    pub fn at_end(&self) -> bool {
        self.end_states.contains(&self.current_state)
    }

    /// Whether `(current_state, event)` has a registered transition.
    pub fn accepts(&self, event: &E) -> bool {
        self.transitions
            .contains_key(&(self.current_state.clone(), event.clone()))
    }

    /// Target of `(state, event)` without applying anything.
    pub fn transition_target(&self, state: &S, event: &E) -> Option<&S> {
        self.transitions
            .get(&(state.clone(), event.clone()))
            .map(|edge| &edge.to)
    }
}

impl<S: Debug, E> Debug for StateMachine<S, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateMachine")
            .field("id", &self.id)
            .field("current_state", &self.current_state)
            .field("compiled", &self.compiled)
            .field("transitions", &self.transitions.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum S {
        A,
        B,
        C,
        End,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum E {
        Next,
        Back,
        Finish,
    }

    fn linear() -> StateMachine<S, E> {
        let mut m = StateMachine::new([S::A, S::B, S::End], S::A, [S::End]).unwrap();
        m.set_transition(S::A, E::Next, S::B, None).unwrap();
        m.set_transition(S::B, E::Finish, S::End, None).unwrap();
        m
    }

    #[test]
    fn rejects_invalid_initial_state() {
        let err = StateMachine::<S, E>::new([S::A, S::B], S::End, [S::B]).unwrap_err();
        assert!(matches!(err, CoreError::Compilation { .. }));
    }

    #[test]
    fn compile_rejects_unreachable_states() {
        let mut m = StateMachine::new([S::A, S::B, S::C, S::End], S::A, [S::End]).unwrap();
        m.set_transition(S::A, E::Next, S::B, None).unwrap();
        m.set_transition(S::B, E::Finish, S::End, None).unwrap();
        // C has edges out but nothing reaches it.
        m.set_transition(S::C, E::Finish, S::End, None).unwrap();
        let err = m.compile(0).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Compilation {
                reason: CompilationReason::Unreachable,
                ..
            }
        ));
    }

    #[test]
    fn compile_rejects_states_without_path_to_end() {
        let mut m = StateMachine::new([S::A, S::B, S::End], S::A, [S::End]).unwrap();
        m.set_transition(S::A, E::Next, S::B, None).unwrap();
        m.set_transition(S::A, E::Finish, S::End, None).unwrap();
        // B is reachable but a dead end.
        let err = m.compile(0).unwrap_err();
        assert!(matches!(
            err,
            CoreError::Compilation {
                reason: CompilationReason::NoPathToEnd,
                ..
            }
        ));
    }

    #[test]
    fn set_transition_rejects_unknown_states() {
        let mut m = StateMachine::new([S::A, S::End], S::A, [S::End]).unwrap();
        let err = m.set_transition(S::A, E::Next, S::C, None).unwrap_err();
        assert!(matches!(err, CoreError::Compilation { .. }));
    }

    #[test]
    fn set_transition_fails_after_compile() {
        let mut m = linear();
        m.compile(0).unwrap();
        let err = m.set_transition(S::B, E::Back, S::A, None).unwrap_err();
        assert!(matches!(err, CoreError::Configuration(_)));
    }

    #[tokio::test]
    async fn handle_event_walks_the_chain() {
        let mut m = linear();
        m.compile(0).unwrap();
        assert_eq!(m.handle_event(E::Next).await.unwrap(), S::B);
        assert_eq!(m.handle_event(E::Finish).await.unwrap(), S::End);
        assert!(m.at_end());
    }

    #[tokio::test]
    async fn unknown_event_is_no_transition() {
        let mut m = linear();
        m.compile(0).unwrap();
        let err = m.handle_event(E::Back).await.unwrap_err();
        assert!(matches!(err, CoreError::NoTransition { .. }));
        // State unchanged on failure.
        assert_eq!(*m.current_state(), S::A);
    }

    #[tokio::test]
    async fn revisit_budget_counts_reentries_only() {
        let mut m = StateMachine::new([S::A, S::B, S::End], S::A, [S::End]).unwrap();
        m.set_transition(S::A, E::Next, S::B, None).unwrap();
        m.set_transition(S::B, E::Back, S::A, None).unwrap();
        m.set_transition(S::B, E::Finish, S::End, None).unwrap();
        m.compile(1).unwrap();

        m.handle_event(E::Next).await.unwrap(); // first visit to B: free
        m.handle_event(E::Back).await.unwrap(); // re-enter A: budget 1 -> 0
        m.handle_event(E::Next).await.unwrap(); // re-enter B: budget 1 -> 0
        let err = m.handle_event(E::Back).await.unwrap_err();
        assert!(matches!(err, CoreError::CycleLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn zero_budget_forbids_self_loop() {
        let mut m = StateMachine::new([S::A, S::End], S::A, [S::End]).unwrap();
        m.set_transition(S::A, E::Next, S::A, None).unwrap();
        m.set_transition(S::A, E::Finish, S::End, None).unwrap();
        m.compile(0).unwrap();
        let err = m.handle_event(E::Next).await.unwrap_err();
        assert!(matches!(err, CoreError::CycleLimitExceeded { .. }));
    }

    #[tokio::test]
    async fn reset_refills_budgets() {
        let mut m = StateMachine::new([S::A, S::End], S::A, [S::End]).unwrap();
        m.set_transition(S::A, E::Next, S::A, None).unwrap();
        m.set_transition(S::A, E::Finish, S::End, None).unwrap();
        m.compile(2).unwrap();
        m.handle_event(E::Next).await.unwrap();
        m.handle_event(E::Next).await.unwrap();
        assert_eq!(m.remaining_revisits(&S::A), Some(0));

        m.reset();
        assert_eq!(*m.current_state(), S::A);
        assert_eq!(m.remaining_revisits(&S::A), Some(2));
        m.handle_event(E::Next).await.unwrap();
    }

    #[tokio::test]
    async fn action_runs_after_state_update() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = seen.clone();
        let action: TransitionAction<S, E> = Arc::new(move |t: Transition<S, E>| {
            let seen = seen2.clone();
            Box::pin(async move {
                assert_eq!(t.from, S::A);
                assert_eq!(t.to, S::B);
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });

        let mut m = StateMachine::new([S::A, S::B, S::End], S::A, [S::End]).unwrap();
        m.set_transition(S::A, E::Next, S::B, Some(action)).unwrap();
        m.set_transition(S::B, E::Finish, S::End, None).unwrap();
        m.compile(0).unwrap();

        m.handle_event(E::Next).await.unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        // Random linear chains with optional back-edges: compilation must
        // accept them, and driving the forward chain must reach the end.
        proptest! {
            #[test]
            fn compiled_chain_reaches_end(len in 2usize..8, budget in 0u32..4) {
                let states: Vec<usize> = (0..len).collect();
                let end = len - 1;
                let mut m = StateMachine::new(states.clone(), 0usize, [end]).unwrap();
                for i in 0..end {
                    m.set_transition(i, 0u8, i + 1, None).unwrap();
                }
                prop_assert!(m.compile(budget).is_ok());

                let rt = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .unwrap();
                rt.block_on(async {
                    for _ in 0..end {
                        m.handle_event(0u8).await.unwrap();
                    }
                });
                prop_assert!(m.at_end());
            }

            #[test]
            fn revisits_never_exceed_budget(budget in 0u32..5) {
                // Two-state ping-pong; count how many times state 0 can be
                // re-entered before the machine errors out.
                let mut m = StateMachine::new([0usize, 1, 2], 0usize, [2]).unwrap();
                m.set_transition(0, 0u8, 1, None).unwrap();
                m.set_transition(1, 0u8, 0, None).unwrap();
                m.set_transition(0, 1u8, 2, None).unwrap();
                m.compile(budget).unwrap();

                let rt = tokio::runtime::Builder::new_current_thread()
                    .build()
                    .unwrap();
                let reentries = rt.block_on(async {
                    let mut count = 0u32;
                    loop {
                        if m.handle_event(0u8).await.is_err() {
                            break count;
                        }
                        if m.handle_event(0u8).await.is_err() {
                            break count;
                        }
                        count += 1;
                    }
                });
                prop_assert!(reentries <= budget);
            }
        }
    }
}
