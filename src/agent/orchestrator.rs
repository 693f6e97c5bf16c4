//! Task orchestrator
//!
//! Composes the state machine, plan manager and event emitter for a single
//! task, records tool history, and turns tool failures into retry or
//! escalation decisions. The orchestrator never sleeps or re-invokes a
//! tool; it tells the caller what to do through [`ToolOutcome`].
//!
//! An illegal lifecycle call is fatal for the instance: it emits an `error`
//! event, returns [`Error::InvalidTransition`], and every later mutating call
//! returns [`Error::TaskSpent`]. A failed task is spent the same way.

use crate::agent::events::{EventEmitter, EventPayload, MessageKind, ObservationSource};
use crate::agent::plan::{Phase, PhaseDefinition, PlanManager, TaskPlan};
use crate::agent::state::{AgentState, AgentStateMachine, RetryConfig, TransitionTrigger};
use crate::agent::types::{ToolCall, ToolOutcome, ToolResult};
use crate::browser::{SecurityDenial, SecurityServices};
use crate::error::{Error, Result};
use std::sync::Arc;

/// Drives one task from prompt to result
#[derive(Debug)]
pub struct AgentOrchestrator {
    task_id: String,
    state_machine: AgentStateMachine,
    plan_manager: PlanManager,
    events: Arc<EventEmitter>,
    tool_calls: Vec<ToolCall>,
    tool_results: Vec<ToolResult>,
    security: SecurityServices,
    spent: bool,
}

impl AgentOrchestrator {
    pub fn new(task_id: impl Into<String>, retry: RetryConfig, security: SecurityServices) -> Self {
        let task_id = task_id.into();
        Self {
            events: Arc::new(EventEmitter::new(task_id.clone())),
            task_id,
            state_machine: AgentStateMachine::new(retry),
            plan_manager: PlanManager::new(),
            tool_calls: Vec::new(),
            tool_results: Vec::new(),
            security,
            spent: false,
        }
    }

    /// Orchestrator with a generated `task-<uuid>` id
    pub fn with_generated_id(retry: RetryConfig, security: SecurityServices) -> Self {
        Self::new(format!("task-{}", uuid::Uuid::new_v4()), retry, security)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    pub fn state(&self) -> AgentState {
        self.state_machine.state()
    }

    pub fn retry_count(&self) -> u32 {
        self.state_machine.retry_count()
    }

    pub fn plan(&self) -> Option<&TaskPlan> {
        self.plan_manager.plan()
    }

    pub fn current_phase(&self) -> Option<&Phase> {
        self.plan_manager.current_phase()
    }

    pub fn is_plan_complete(&self) -> bool {
        self.plan_manager.is_complete()
    }

    pub fn tool_calls(&self) -> &[ToolCall] {
        &self.tool_calls
    }

    pub fn tool_results(&self) -> &[ToolResult] {
        &self.tool_results
    }

    /// Emitter to subscribe on
    pub fn events(&self) -> &Arc<EventEmitter> {
        &self.events
    }

    pub fn security(&self) -> &SecurityServices {
        &self.security
    }

    /// True after an illegal lifecycle call or `fail_task`
    pub fn is_spent(&self) -> bool {
        self.spent
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Idle → Planning
    pub fn start_task(&mut self, prompt: impl Into<String>) -> Result<()> {
        self.precheck(AgentState::Planning, TransitionTrigger::NewTask)?;
        let prompt = prompt.into();

        tracing::info!(task_id = %self.task_id, "Task started");
        self.events.emit(EventPayload::TaskCreated { prompt });
        self.state_machine
            .transition(AgentState::Planning, TransitionTrigger::NewTask)?;
        Ok(())
    }

    /// Install the plan and move Planning → Executing
    pub fn create_plan(
        &mut self,
        goal: impl Into<String>,
        phases: Vec<PhaseDefinition>,
    ) -> Result<()> {
        self.precheck(AgentState::Executing, TransitionTrigger::PlanCreated)?;
        self.plan_manager.create_plan(goal, phases)?;
        self.state_machine
            .transition(AgentState::Executing, TransitionTrigger::PlanCreated)?;
        self.emit_plan_and_phase();
        Ok(())
    }

    /// Replace the plan without a state change
    pub fn update_plan(
        &mut self,
        goal: impl Into<String>,
        phases: Vec<PhaseDefinition>,
        current_phase_id: u32,
    ) -> Result<()> {
        self.ensure_usable()?;
        self.plan_manager
            .update_plan(goal, phases, current_phase_id)?;
        self.emit_plan_and_phase();
        Ok(())
    }

    /// Complete the current phase and start `next_phase_id`
    pub fn advance_phase(&mut self, next_phase_id: u32) -> Result<()> {
        self.ensure_usable()?;
        self.plan_manager.advance_phase(next_phase_id)?;
        tracing::info!(task_id = %self.task_id, phase = next_phase_id, "Phase advanced");
        self.emit_plan_and_phase();
        Ok(())
    }

    // =========================================================================
    // Tool loop
    // =========================================================================

    /// Append a call to the history. Only accepted while executing.
    pub fn record_tool_call(&mut self, call: ToolCall) -> Result<()> {
        self.ensure_usable()?;
        if self.state() != AgentState::Executing {
            return Err(Error::NotExecuting(self.state()));
        }
        tracing::debug!(task_id = %self.task_id, tool = %call.name, call_id = %call.id, "Tool call");
        self.tool_calls.push(call.clone());
        self.events.emit(EventPayload::ActionStarted { call });
        Ok(())
    }

    /// Record a result and decide what happens next.
    ///
    /// Success keeps executing. A failure within the retry budget returns
    /// the backoff for the caller to honor; past the budget the task asks
    /// the user how to proceed.
    pub fn record_tool_result(&mut self, result: ToolResult) -> Result<ToolOutcome> {
        let trigger = if result.success {
            TransitionTrigger::ToolSuccess
        } else {
            TransitionTrigger::ToolFailureRetry
        };
        self.precheck(AgentState::Executing, trigger)?;

        let observation = match (&result.error, result.success) {
            (Some(error), false) => error.clone(),
            _ => result.output.clone(),
        };
        let call_id = result.call_id.clone();
        let success = result.success;

        self.tool_results.push(result.clone());
        self.events.emit(EventPayload::ActionCompleted { result });
        self.events.emit(EventPayload::ObservationReceived {
            source: ObservationSource::Tool,
            content: observation.clone(),
            call_id: Some(call_id),
        });

        if success {
            self.state_machine
                .transition(AgentState::Executing, TransitionTrigger::ToolSuccess)?;
            return Ok(ToolOutcome::Continue);
        }

        if self.state_machine.increment_retry() {
            self.state_machine
                .transition(AgentState::Executing, TransitionTrigger::ToolFailureRetry)?;
            let attempt = self.state_machine.retry_count();
            let delay = self.state_machine.retry_delay();
            tracing::warn!(
                task_id = %self.task_id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Tool failed, retry scheduled by caller"
            );
            return Ok(ToolOutcome::RetryAfter { attempt, delay });
        }

        tracing::warn!(
            task_id = %self.task_id,
            max_retries = self.state_machine.config().max_retries,
            "Retry budget exhausted, asking the user"
        );
        self.request_user_input(format!(
            "I was unable to complete this step after several attempts. \
             Last error: {}. How would you like me to proceed?",
            observation
        ))?;
        Ok(ToolOutcome::AwaitingUser)
    }

    /// Feed a security refusal back as a failed tool result
    pub fn record_security_denial(
        &mut self,
        call_id: impl Into<String>,
        denial: SecurityDenial,
    ) -> Result<ToolOutcome> {
        tracing::warn!(task_id = %self.task_id, "Tool call denied: {}", denial);
        self.record_tool_result(denial.into_tool_result(call_id))
    }

    // =========================================================================
    // User interaction
    // =========================================================================

    /// Executing → Waiting, with the question sent as an `ask` message
    pub fn request_user_input(&mut self, message: impl Into<String>) -> Result<()> {
        self.precheck(AgentState::Waiting, TransitionTrigger::UserInputNeeded)?;
        self.state_machine
            .transition(AgentState::Waiting, TransitionTrigger::UserInputNeeded)?;
        self.events.emit(EventPayload::MessageSent {
            kind: MessageKind::Ask,
            content: message.into(),
        });
        Ok(())
    }

    /// Waiting → Executing
    pub fn receive_user_input(&mut self, input: impl Into<String>) -> Result<()> {
        self.precheck(AgentState::Executing, TransitionTrigger::UserResponds)?;
        self.state_machine
            .transition(AgentState::Executing, TransitionTrigger::UserResponds)?;
        self.events.emit(EventPayload::ObservationReceived {
            source: ObservationSource::User,
            content: input.into(),
            call_id: None,
        });
        Ok(())
    }

    // =========================================================================
    // Termination
    // =========================================================================

    /// Executing → Delivering → Idle
    pub fn complete_task(&mut self, result: impl Into<String>) -> Result<()> {
        self.precheck(AgentState::Delivering, TransitionTrigger::TaskComplete)?;
        let result = result.into();

        if let Err(e) = self.plan_manager.complete_current_phase() {
            tracing::debug!(task_id = %self.task_id, "Plan left incomplete: {}", e);
        }
        self.state_machine
            .transition(AgentState::Delivering, TransitionTrigger::TaskComplete)?;

        self.events.emit(EventPayload::MessageSent {
            kind: MessageKind::Result,
            content: result.clone(),
        });
        self.events.emit(EventPayload::TaskCompleted { result });
        self.state_machine
            .transition(AgentState::Idle, TransitionTrigger::ResultSent)?;

        tracing::info!(task_id = %self.task_id, "Task completed");
        Ok(())
    }

    /// Fail from Planning or Executing. Terminal: the instance is spent
    /// afterwards. A task waiting on the user must be resumed first.
    pub fn fail_task(&mut self, error: impl Into<String>) -> Result<()> {
        let trigger = match self.state() {
            AgentState::Planning => TransitionTrigger::PlanningFailed,
            _ => TransitionTrigger::MaxRetriesExceeded,
        };
        self.precheck(AgentState::Failed, trigger)?;
        let error = error.into();

        self.plan_manager.mark_current_phase_failed();
        tracing::warn!(task_id = %self.task_id, error = %error, "Task failed");
        self.events.emit(EventPayload::TaskFailed { error });
        self.state_machine.transition(AgentState::Failed, trigger)?;
        self.spent = true;
        Ok(())
    }

    // =========================================================================
    // Internals
    // =========================================================================

    fn ensure_usable(&self) -> Result<()> {
        if self.spent {
            return Err(Error::TaskSpent(self.task_id.clone()));
        }
        Ok(())
    }

    /// Refuse an illegal transition before anything is recorded or emitted.
    /// The refusal spends the instance.
    fn precheck(&mut self, to: AgentState, trigger: TransitionTrigger) -> Result<()> {
        self.ensure_usable()?;
        if self.state_machine.can_transition(to, trigger) {
            return Ok(());
        }

        let err = Error::InvalidTransition {
            from: self.state(),
            to,
            trigger,
        };
        self.spent = true;
        tracing::warn!(task_id = %self.task_id, "{}", err);
        self.events.emit(EventPayload::Error {
            message: err.to_string(),
        });
        Err(err)
    }

    fn emit_plan_and_phase(&self) {
        let Some(plan) = self.plan_manager.plan() else {
            return;
        };
        self.events
            .emit(EventPayload::PlanUpdated { plan: plan.clone() });
        if let Some(phase) = plan.current_phase() {
            self.events.emit(EventPayload::PhaseStarted {
                phase_id: phase.id,
                title: phase.title.clone(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::plan::PhaseStatus;
    use crate::config::TaskPilotConfig;
    use parking_lot::Mutex;
    use std::time::Duration;

    fn orchestrator() -> AgentOrchestrator {
        let security = SecurityServices::from_config(&TaskPilotConfig::default()).unwrap();
        AgentOrchestrator::new("task-1", RetryConfig::default(), security)
    }

    fn record_events(orch: &AgentOrchestrator) -> Arc<Mutex<Vec<&'static str>>> {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        orch.events().subscribe_all(move |e| l.lock().push(e.event_type()));
        log
    }

    fn phases(n: u32) -> Vec<PhaseDefinition> {
        (1..=n)
            .map(|id| PhaseDefinition::new(id, format!("Phase {}", id)))
            .collect()
    }

    fn planned() -> AgentOrchestrator {
        let mut orch = orchestrator();
        orch.start_task("Compare laptop prices").unwrap();
        orch.create_plan("Compare laptop prices", phases(3)).unwrap();
        orch
    }

    #[test]
    fn test_full_task_flow() {
        let mut orch = orchestrator();
        let log = record_events(&orch);

        orch.start_task("Compare laptop prices").unwrap();
        assert_eq!(orch.state(), AgentState::Planning);

        orch.create_plan("Compare laptop prices", phases(3)).unwrap();
        assert_eq!(orch.state(), AgentState::Executing);

        let call = ToolCall::new("browser.navigate", serde_json::json!({"url": "https://example.com"}));
        let call_id = call.id.clone();
        orch.record_tool_call(call).unwrap();
        let outcome = orch
            .record_tool_result(ToolResult::success(call_id, "loaded", 120))
            .unwrap();
        assert_eq!(outcome, ToolOutcome::Continue);

        orch.advance_phase(2).unwrap();
        orch.advance_phase(3).unwrap();
        orch.complete_task("Cheapest is model B").unwrap();

        assert_eq!(orch.state(), AgentState::Idle);
        assert!(orch.is_plan_complete());
        assert_eq!(orch.plan().unwrap().current_phase_id, 3);
        assert_eq!(orch.tool_calls().len(), 1);
        assert_eq!(orch.tool_results().len(), 1);

        assert_eq!(
            *log.lock(),
            vec![
                "task.created",
                "plan.updated",
                "phase.started",
                "action.started",
                "action.completed",
                "observation.received",
                "plan.updated",
                "phase.started",
                "plan.updated",
                "phase.started",
                "message.sent",
                "task.completed",
            ]
        );
    }

    #[test]
    fn test_failures_retry_then_escalate() {
        let mut orch = planned();
        let log = record_events(&orch);

        let mut delays = Vec::new();
        for _ in 0..3 {
            match orch
                .record_tool_result(ToolResult::failure("call-1", "timeout", 10))
                .unwrap()
            {
                ToolOutcome::RetryAfter { delay, .. } => delays.push(delay),
                other => panic!("expected retry, got {:?}", other),
            }
            assert_eq!(orch.state(), AgentState::Executing);
        }
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(4000)
            ]
        );
        assert_eq!(orch.retry_count(), 3);

        let outcome = orch
            .record_tool_result(ToolResult::failure("call-1", "timeout", 10))
            .unwrap();
        assert_eq!(outcome, ToolOutcome::AwaitingUser);
        assert_eq!(orch.state(), AgentState::Waiting);
        assert_eq!(orch.retry_count(), 0);
        assert_eq!(log.lock().last(), Some(&"message.sent"));

        orch.receive_user_input("Try the other store").unwrap();
        assert_eq!(orch.state(), AgentState::Executing);
    }

    #[test]
    fn test_success_resets_retry_counter() {
        let mut orch = planned();
        orch.record_tool_result(ToolResult::failure("c", "boom", 1))
            .unwrap();
        orch.record_tool_result(ToolResult::failure("c", "boom", 1))
            .unwrap();
        assert_eq!(orch.retry_count(), 2);

        orch.record_tool_result(ToolResult::success("c", "ok", 1))
            .unwrap();
        assert_eq!(orch.retry_count(), 0);

        assert_eq!(
            orch.record_tool_result(ToolResult::failure("c", "boom", 1))
                .unwrap(),
            ToolOutcome::RetryAfter {
                attempt: 1,
                delay: Duration::from_millis(1000)
            }
        );
    }

    #[test]
    fn test_invalid_transition_spends_instance() {
        let mut orch = orchestrator();
        let log = record_events(&orch);

        let err = orch.complete_task("too early").unwrap_err();
        assert!(matches!(
            err,
            Error::InvalidTransition {
                from: AgentState::Idle,
                to: AgentState::Delivering,
                trigger: TransitionTrigger::TaskComplete,
            }
        ));
        assert_eq!(orch.state(), AgentState::Idle);
        assert!(orch.is_spent());
        assert_eq!(*log.lock(), vec!["error"]);

        assert!(matches!(orch.start_task("again"), Err(Error::TaskSpent(_))));
        assert!(matches!(
            orch.record_tool_call(ToolCall::new("noop", serde_json::Value::Null)),
            Err(Error::TaskSpent(_))
        ));
        assert_eq!(log.lock().len(), 1);
    }

    #[test]
    fn test_tool_result_outside_execution_is_rejected() {
        let mut orch = orchestrator();
        orch.start_task("prompt").unwrap();

        assert!(orch
            .record_tool_result(ToolResult::success("c", "ok", 1))
            .is_err());
        assert!(orch.tool_results().is_empty());
        assert!(orch.is_spent());
    }

    #[test]
    fn test_invalid_plan_does_not_spend() {
        let mut orch = orchestrator();
        orch.start_task("prompt").unwrap();

        let err = orch.create_plan("goal", Vec::new()).unwrap_err();
        assert!(matches!(err, Error::InvalidPlan(_)));
        assert_eq!(orch.state(), AgentState::Planning);
        assert!(!orch.is_spent());

        orch.create_plan("goal", phases(2)).unwrap();
        assert!(matches!(orch.advance_phase(3), Err(Error::InvalidPlan(_))));
        assert_eq!(orch.plan().unwrap().current_phase_id, 1);
    }

    #[test]
    fn test_fail_during_planning() {
        let mut orch = orchestrator();
        orch.start_task("prompt").unwrap();
        let log = record_events(&orch);

        orch.fail_task("model refused to plan").unwrap();
        assert_eq!(orch.state(), AgentState::Failed);
        assert_eq!(*log.lock(), vec!["task.failed"]);
    }

    #[test]
    fn test_fail_during_execution_marks_phase() {
        let mut orch = planned();
        orch.advance_phase(2).unwrap();
        orch.fail_task("site unavailable").unwrap();

        assert_eq!(orch.state(), AgentState::Failed);
        let plan = orch.plan().unwrap();
        assert_eq!(plan.phase(1).unwrap().status, PhaseStatus::Completed);
        assert_eq!(plan.phase(2).unwrap().status, PhaseStatus::Failed);
        assert_eq!(plan.phase(3).unwrap().status, PhaseStatus::Pending);

        assert!(orch.fail_task("again").is_err());
    }

    #[test]
    fn test_escalated_task_can_resume_then_fail() {
        let mut orch = planned();
        for _ in 0..4 {
            orch.record_tool_result(ToolResult::failure("c", "blocked", 0))
                .unwrap();
        }
        assert_eq!(orch.state(), AgentState::Waiting);
        let log = record_events(&orch);

        orch.receive_user_input("Give up").unwrap();
        orch.fail_task("Navigation target refused by security policy")
            .unwrap();

        assert_eq!(orch.state(), AgentState::Failed);
        assert!(orch.is_spent());
        assert_eq!(*log.lock(), vec!["observation.received", "task.failed"]);
    }

    #[test]
    fn test_failed_task_is_spent() {
        let mut orch = planned();
        orch.fail_task("site unavailable").unwrap();
        assert!(orch.is_spent());
        let log = record_events(&orch);

        assert!(matches!(
            orch.record_tool_call(ToolCall::new("noop", serde_json::Value::Null)),
            Err(Error::TaskSpent(_))
        ));
        assert!(matches!(orch.advance_phase(2), Err(Error::TaskSpent(_))));
        assert!(matches!(
            orch.update_plan("Revised", phases(2), 1),
            Err(Error::TaskSpent(_))
        ));
        assert!(orch.tool_calls().is_empty());
        assert_eq!(orch.plan().unwrap().current_phase_id, 1);
        assert!(log.lock().is_empty());
    }

    #[test]
    fn test_tool_call_outside_execution_is_rejected() {
        let mut orch = orchestrator();
        let log = record_events(&orch);
        let call = || ToolCall::new("noop", serde_json::Value::Null);

        assert!(matches!(
            orch.record_tool_call(call()),
            Err(Error::NotExecuting(AgentState::Idle))
        ));
        orch.start_task("prompt").unwrap();
        assert!(matches!(
            orch.record_tool_call(call()),
            Err(Error::NotExecuting(AgentState::Planning))
        ));
        assert!(orch.tool_calls().is_empty());
        assert!(!orch.is_spent());
        assert_eq!(*log.lock(), vec!["task.created"]);

        orch.create_plan("goal", phases(1)).unwrap();
        orch.record_tool_call(call()).unwrap();
        assert_eq!(orch.tool_calls().len(), 1);
    }

    #[test]
    fn test_update_plan_emits() {
        let mut orch = planned();
        let log = record_events(&orch);

        orch.update_plan("Revised", phases(4), 2).unwrap();
        assert_eq!(orch.current_phase().unwrap().id, 2);
        assert_eq!(*log.lock(), vec!["plan.updated", "phase.started"]);
    }

    #[test]
    fn test_security_denial_flows_through_failure_path() {
        let mut orch = planned();
        orch.security().limiter.init_session("browser-1");

        let denial = orch
            .security()
            .check_navigation("browser-1", "http://10.0.0.5/admin")
            .unwrap_err();
        let call = ToolCall::new("browser.navigate", serde_json::json!({"url": "http://10.0.0.5/admin"}));
        let call_id = call.id.clone();
        orch.record_tool_call(call).unwrap();

        let outcome = orch.record_security_denial(call_id.clone(), denial).unwrap();
        assert!(matches!(outcome, ToolOutcome::RetryAfter { attempt: 1, .. }));

        let result = orch.tool_results().last().unwrap();
        assert_eq!(result.call_id, call_id);
        assert!(!result.success);
        assert!(result.error.as_deref().unwrap().contains("network filter"));
    }

    #[test]
    fn test_generated_task_id() {
        let security = SecurityServices::from_config(&TaskPilotConfig::default()).unwrap();
        let orch = AgentOrchestrator::with_generated_id(RetryConfig::default(), security);
        assert!(orch.task_id().starts_with("task-"));
        assert_eq!(orch.events().task_id(), orch.task_id());
    }
}
