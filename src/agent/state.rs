//! Task lifecycle state machine
//!
//! Every lifecycle change goes through [`AgentStateMachine::transition`],
//! which only accepts the `(from, to, trigger)` triples in
//! [`ALLOWED_TRANSITIONS`]. The machine also keeps the retry counter used to
//! compute exponential backoff for failed tool calls.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Lifecycle state of a single task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Idle,
    Planning,
    Executing,
    Waiting,
    Delivering,
    Completed,
    Failed,
}

impl AgentState {
    /// All states, in declaration order
    pub const ALL: [AgentState; 7] = [
        Self::Idle,
        Self::Planning,
        Self::Executing,
        Self::Waiting,
        Self::Delivering,
        Self::Completed,
        Self::Failed,
    ];

    /// Terminal states accept no further transitions
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Planning => write!(f, "planning"),
            Self::Executing => write!(f, "executing"),
            Self::Waiting => write!(f, "waiting"),
            Self::Delivering => write!(f, "delivering"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// What caused a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionTrigger {
    NewTask,
    PlanCreated,
    ToolSuccess,
    ToolFailureRetry,
    UserInputNeeded,
    UserResponds,
    TaskComplete,
    ResultSent,
    MaxRetriesExceeded,
    PlanningFailed,
}

impl TransitionTrigger {
    pub const ALL: [TransitionTrigger; 10] = [
        Self::NewTask,
        Self::PlanCreated,
        Self::ToolSuccess,
        Self::ToolFailureRetry,
        Self::UserInputNeeded,
        Self::UserResponds,
        Self::TaskComplete,
        Self::ResultSent,
        Self::MaxRetriesExceeded,
        Self::PlanningFailed,
    ];
}

impl std::fmt::Display for TransitionTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::NewTask => "new_task",
            Self::PlanCreated => "plan_created",
            Self::ToolSuccess => "tool_success",
            Self::ToolFailureRetry => "tool_failure_retry",
            Self::UserInputNeeded => "user_input_needed",
            Self::UserResponds => "user_responds",
            Self::TaskComplete => "task_complete",
            Self::ResultSent => "result_sent",
            Self::MaxRetriesExceeded => "max_retries_exceeded",
            Self::PlanningFailed => "planning_failed",
        };
        write!(f, "{}", s)
    }
}

/// One legal edge of the lifecycle graph
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: AgentState,
    pub to: AgentState,
    pub trigger: TransitionTrigger,
}

const fn edge(from: AgentState, to: AgentState, trigger: TransitionTrigger) -> StateTransition {
    StateTransition { from, to, trigger }
}

/// The complete allow-list. Anything not listed here is rejected.
pub const ALLOWED_TRANSITIONS: &[StateTransition] = &[
    edge(AgentState::Idle, AgentState::Planning, TransitionTrigger::NewTask),
    edge(AgentState::Planning, AgentState::Executing, TransitionTrigger::PlanCreated),
    edge(AgentState::Executing, AgentState::Executing, TransitionTrigger::ToolSuccess),
    edge(AgentState::Executing, AgentState::Executing, TransitionTrigger::ToolFailureRetry),
    edge(AgentState::Executing, AgentState::Waiting, TransitionTrigger::UserInputNeeded),
    edge(AgentState::Waiting, AgentState::Executing, TransitionTrigger::UserResponds),
    edge(AgentState::Executing, AgentState::Delivering, TransitionTrigger::TaskComplete),
    edge(AgentState::Delivering, AgentState::Idle, TransitionTrigger::ResultSent),
    edge(AgentState::Executing, AgentState::Failed, TransitionTrigger::MaxRetriesExceeded),
    edge(AgentState::Planning, AgentState::Failed, TransitionTrigger::PlanningFailed),
];

/// Retry and backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries allowed before escalating to the user
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay_ms: u64,
    /// Upper bound for any computed delay
    pub max_delay_ms: u64,
    /// Growth factor between consecutive retries
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Backoff for the given 1-based attempt.
    ///
    /// Attempt 0 is treated as the first attempt.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }
}

/// Lifecycle state machine for one task
#[derive(Debug, Clone)]
pub struct AgentStateMachine {
    state: AgentState,
    retry_count: u32,
    config: RetryConfig,
}

impl AgentStateMachine {
    /// Create a machine in `Idle`
    pub fn new(config: RetryConfig) -> Self {
        Self {
            state: AgentState::Idle,
            retry_count: 0,
            config,
        }
    }

    /// Current state
    pub fn state(&self) -> AgentState {
        self.state
    }

    /// Consecutive failed attempts since the last non-retry transition
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether `(current, to, trigger)` is in the allow-list
    pub fn can_transition(&self, to: AgentState, trigger: TransitionTrigger) -> bool {
        ALLOWED_TRANSITIONS
            .iter()
            .any(|t| t.from == self.state && t.to == to && t.trigger == trigger)
    }

    /// Move to `to`, or fail without touching the current state.
    pub fn transition(&mut self, to: AgentState, trigger: TransitionTrigger) -> Result<AgentState> {
        if !self.can_transition(to, trigger) {
            return Err(Error::InvalidTransition {
                from: self.state,
                to,
                trigger,
            });
        }

        tracing::debug!(from = %self.state, to = %to, trigger = %trigger, "State transition");
        self.state = to;
        if trigger != TransitionTrigger::ToolFailureRetry {
            self.retry_count = 0;
        }
        Ok(to)
    }

    /// Count a failed attempt. Returns whether another retry is permitted.
    pub fn increment_retry(&mut self) -> bool {
        self.retry_count = self.retry_count.saturating_add(1);
        self.retry_count <= self.config.max_retries
    }

    /// Backoff before the next retry, based on the current counter
    pub fn retry_delay(&self) -> Duration {
        self.config.delay_for_attempt(self.retry_count)
    }

    /// Back to `Idle` with a clean counter
    pub fn reset(&mut self) {
        self.state = AgentState::Idle;
        self.retry_count = 0;
    }

    #[cfg(test)]
    pub(crate) fn force_state(&mut self, state: AgentState) {
        self.state = state;
    }
}

impl Default for AgentStateMachine {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_allowed(from: AgentState, to: AgentState, trigger: TransitionTrigger) -> bool {
        ALLOWED_TRANSITIONS
            .iter()
            .any(|t| t.from == from && t.to == to && t.trigger == trigger)
    }

    #[test]
    fn test_happy_path() {
        let mut sm = AgentStateMachine::default();
        assert_eq!(sm.state(), AgentState::Idle);

        sm.transition(AgentState::Planning, TransitionTrigger::NewTask).unwrap();
        sm.transition(AgentState::Executing, TransitionTrigger::PlanCreated).unwrap();
        sm.transition(AgentState::Executing, TransitionTrigger::ToolSuccess).unwrap();
        sm.transition(AgentState::Delivering, TransitionTrigger::TaskComplete).unwrap();
        sm.transition(AgentState::Idle, TransitionTrigger::ResultSent).unwrap();
        assert_eq!(sm.state(), AgentState::Idle);
    }

    #[test]
    fn test_every_illegal_triple_is_rejected() {
        let mut checked = 0;
        for from in AgentState::ALL {
            for to in AgentState::ALL {
                for trigger in TransitionTrigger::ALL {
                    if is_allowed(from, to, trigger) {
                        continue;
                    }
                    let mut sm = AgentStateMachine::default();
                    sm.force_state(from);
                    sm.retry_count = 2;

                    assert!(!sm.can_transition(to, trigger));
                    let err = sm.transition(to, trigger).unwrap_err();
                    assert!(matches!(
                        err,
                        Error::InvalidTransition { from: f, to: t, trigger: tr }
                            if f == from && t == to && tr == trigger
                    ));
                    assert_eq!(sm.state(), from);
                    assert_eq!(sm.retry_count(), 2);
                    checked += 1;
                }
            }
        }
        assert_eq!(checked, 7 * 7 * 10 - ALLOWED_TRANSITIONS.len());
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for t in ALLOWED_TRANSITIONS {
            assert!(!t.from.is_terminal());
        }
    }

    #[test]
    fn test_retry_counter_reset_rules() {
        let mut sm = AgentStateMachine::default();
        sm.force_state(AgentState::Executing);

        assert!(sm.increment_retry());
        sm.transition(AgentState::Executing, TransitionTrigger::ToolFailureRetry)
            .unwrap();
        assert_eq!(sm.retry_count(), 1);

        sm.transition(AgentState::Executing, TransitionTrigger::ToolSuccess)
            .unwrap();
        assert_eq!(sm.retry_count(), 0);
    }

    #[test]
    fn test_retry_budget() {
        let mut sm = AgentStateMachine::default();
        assert!(sm.increment_retry());
        assert!(sm.increment_retry());
        assert!(sm.increment_retry());
        assert!(!sm.increment_retry());
        assert_eq!(sm.retry_count(), 4);
    }

    #[test]
    fn test_default_backoff() {
        let mut sm = AgentStateMachine::default();
        sm.increment_retry();
        assert_eq!(sm.retry_delay(), Duration::from_millis(1000));
        sm.increment_retry();
        assert_eq!(sm.retry_delay(), Duration::from_millis(2000));
        sm.increment_retry();
        assert_eq!(sm.retry_delay(), Duration::from_millis(4000));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig::default();
        assert_eq!(config.delay_for_attempt(5), Duration::from_millis(16_000));
        assert_eq!(config.delay_for_attempt(6), Duration::from_millis(30_000));
        assert_eq!(config.delay_for_attempt(60), Duration::from_millis(30_000));
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1000));
    }

    #[test]
    fn test_reset() {
        let mut sm = AgentStateMachine::default();
        sm.transition(AgentState::Planning, TransitionTrigger::NewTask).unwrap();
        sm.increment_retry();
        sm.reset();
        assert_eq!(sm.state(), AgentState::Idle);
        assert_eq!(sm.retry_count(), 0);
    }

    #[test]
    fn test_state_serialization() {
        let json = serde_json::to_string(&AgentState::Delivering).unwrap();
        assert_eq!(json, "\"delivering\"");
        let trigger: TransitionTrigger = serde_json::from_str("\"tool_failure_retry\"").unwrap();
        assert_eq!(trigger, TransitionTrigger::ToolFailureRetry);
        assert_eq!(trigger.to_string(), "tool_failure_retry");
    }
}
