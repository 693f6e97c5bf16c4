//! Sequential task plan
//!
//! A plan is an ordered list of phases with exactly one phase in progress.
//! Phases are entered strictly in order: the manager refuses to skip
//! forward or move backward.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Status of a single phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// Tool families a phase expects to use
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhaseCapabilities {
    pub browser: bool,
    pub shell: bool,
    pub search: bool,
    pub file_io: bool,
    pub deep_research: bool,
}

/// Caller-supplied phase definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseDefinition {
    pub id: u32,
    pub title: String,
    #[serde(default)]
    pub capabilities: PhaseCapabilities,
}

impl PhaseDefinition {
    pub fn new(id: u32, title: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            capabilities: PhaseCapabilities::default(),
        }
    }

    pub fn with_capabilities(mut self, capabilities: PhaseCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }
}

/// A phase as tracked by the plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Phase {
    pub id: u32,
    pub title: String,
    pub capabilities: PhaseCapabilities,
    pub status: PhaseStatus,
}

/// The current plan for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub goal: String,
    pub phases: Vec<Phase>,
    pub current_phase_id: u32,
}

impl TaskPlan {
    /// Phase by id
    pub fn phase(&self, id: u32) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    /// The phase `current_phase_id` points at
    pub fn current_phase(&self) -> Option<&Phase> {
        self.phase(self.current_phase_id)
    }

    fn phase_mut(&mut self, id: u32) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.id == id)
    }
}

/// Owns the plan for one task
#[derive(Debug, Default)]
pub struct PlanManager {
    plan: Option<TaskPlan>,
}

impl PlanManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current plan, if one has been created
    pub fn plan(&self) -> Option<&TaskPlan> {
        self.plan.as_ref()
    }

    pub fn current_phase(&self) -> Option<&Phase> {
        self.plan.as_ref().and_then(TaskPlan::current_phase)
    }

    /// Replace any existing plan. The first phase starts in progress.
    pub fn create_plan(
        &mut self,
        goal: impl Into<String>,
        phases: Vec<PhaseDefinition>,
    ) -> Result<&TaskPlan> {
        validate_phase_ids(&phases)?;
        let first_id = phases[0].id;
        self.plan = Some(build_plan(goal.into(), phases, first_id));
        self.require_plan()
    }

    /// Replace the plan, deriving every status from `current_phase_id`.
    pub fn update_plan(
        &mut self,
        goal: impl Into<String>,
        phases: Vec<PhaseDefinition>,
        current_phase_id: u32,
    ) -> Result<&TaskPlan> {
        validate_phase_ids(&phases)?;
        if !phases.iter().any(|p| p.id == current_phase_id) {
            return Err(Error::InvalidPlan(format!(
                "current phase {} is not part of the plan",
                current_phase_id
            )));
        }
        self.plan = Some(build_plan(goal.into(), phases, current_phase_id));
        self.require_plan()
    }

    /// Move from the current phase to `next_phase_id`, which must be the
    /// immediate successor.
    pub fn advance_phase(&mut self, next_phase_id: u32) -> Result<&TaskPlan> {
        let plan = self
            .plan
            .as_mut()
            .ok_or_else(|| Error::InvalidPlan("no active plan".to_string()))?;

        let current_id = plan.current_phase_id;
        if plan.phase(current_id).is_none() {
            return Err(Error::InvalidPlan(format!(
                "current phase {} does not exist",
                current_id
            )));
        }
        if plan.phase(next_phase_id).is_none() {
            return Err(Error::InvalidPlan(format!(
                "phase {} does not exist",
                next_phase_id
            )));
        }
        if current_id.checked_add(1) != Some(next_phase_id) {
            return Err(Error::InvalidPlan(format!(
                "cannot advance from phase {} to phase {}; phases must advance one at a time",
                current_id, next_phase_id
            )));
        }

        if let Some(current) = plan.phase_mut(current_id) {
            current.status = PhaseStatus::Completed;
        }
        if let Some(next) = plan.phase_mut(next_phase_id) {
            next.status = PhaseStatus::InProgress;
        }
        plan.current_phase_id = next_phase_id;
        self.require_plan()
    }

    /// Mark the final phase completed. Only valid on the last phase.
    pub fn complete_current_phase(&mut self) -> Result<&TaskPlan> {
        let plan = self
            .plan
            .as_mut()
            .ok_or_else(|| Error::InvalidPlan("no active plan".to_string()))?;

        let current_id = plan.current_phase_id;
        if plan.phase(current_id.saturating_add(1)).is_some() {
            return Err(Error::InvalidPlan(format!(
                "phase {} is not the final phase",
                current_id
            )));
        }
        if let Some(current) = plan.phase_mut(current_id) {
            current.status = PhaseStatus::Completed;
        }
        self.require_plan()
    }

    /// True iff a plan exists and every phase is completed
    pub fn is_complete(&self) -> bool {
        self.plan.as_ref().is_some_and(|plan| {
            plan.phases
                .iter()
                .all(|p| p.status == PhaseStatus::Completed)
        })
    }

    /// Mark the current phase failed, keeping `current_phase_id`.
    ///
    /// Returns whether a phase was marked.
    pub fn mark_current_phase_failed(&mut self) -> bool {
        let Some(plan) = self.plan.as_mut() else {
            return false;
        };
        let current_id = plan.current_phase_id;
        match plan.phase_mut(current_id) {
            Some(phase) => {
                phase.status = PhaseStatus::Failed;
                true
            }
            None => false,
        }
    }

    /// Drop the plan
    pub fn clear(&mut self) {
        self.plan = None;
    }

    fn require_plan(&self) -> Result<&TaskPlan> {
        self.plan
            .as_ref()
            .ok_or_else(|| Error::InvalidPlan("no active plan".to_string()))
    }
}

fn validate_phase_ids(phases: &[PhaseDefinition]) -> Result<()> {
    if phases.is_empty() {
        return Err(Error::InvalidPlan("a plan needs at least one phase".to_string()));
    }
    for (index, phase) in phases.iter().enumerate() {
        let expected = index as u32 + 1;
        if phase.id != expected {
            return Err(Error::InvalidPlan(format!(
                "phase ids must be sequential from 1: expected {}, found {}",
                expected, phase.id
            )));
        }
    }
    Ok(())
}

fn build_plan(goal: String, phases: Vec<PhaseDefinition>, current_phase_id: u32) -> TaskPlan {
    let phases = phases
        .into_iter()
        .map(|def| {
            let status = match def.id.cmp(&current_phase_id) {
                std::cmp::Ordering::Less => PhaseStatus::Completed,
                std::cmp::Ordering::Equal => PhaseStatus::InProgress,
                std::cmp::Ordering::Greater => PhaseStatus::Pending,
            };
            Phase {
                id: def.id,
                title: def.title,
                capabilities: def.capabilities,
                status,
            }
        })
        .collect();

    TaskPlan {
        goal,
        phases,
        current_phase_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three_phases() -> Vec<PhaseDefinition> {
        vec![
            PhaseDefinition::new(1, "Research"),
            PhaseDefinition::new(2, "Collect"),
            PhaseDefinition::new(3, "Report"),
        ]
    }

    fn statuses(manager: &PlanManager) -> Vec<PhaseStatus> {
        manager
            .plan()
            .unwrap()
            .phases
            .iter()
            .map(|p| p.status)
            .collect()
    }

    #[test]
    fn test_create_plan() {
        let mut manager = PlanManager::new();
        let plan = manager.create_plan("Find flights", three_phases()).unwrap();

        assert_eq!(plan.goal, "Find flights");
        assert_eq!(plan.current_phase_id, 1);
        assert_eq!(
            statuses(&manager),
            vec![PhaseStatus::InProgress, PhaseStatus::Pending, PhaseStatus::Pending]
        );
        assert!(!manager.is_complete());
    }

    #[test]
    fn test_create_plan_rejects_bad_ids() {
        let mut manager = PlanManager::new();
        assert!(manager.create_plan("empty", vec![]).is_err());

        let gapped = vec![PhaseDefinition::new(1, "a"), PhaseDefinition::new(3, "b")];
        assert!(matches!(
            manager.create_plan("gap", gapped),
            Err(Error::InvalidPlan(_))
        ));
        assert!(manager.plan().is_none());
    }

    #[test]
    fn test_update_plan_derives_statuses() {
        let mut manager = PlanManager::new();
        manager.create_plan("goal", three_phases()).unwrap();
        manager.mark_current_phase_failed();

        manager.update_plan("new goal", three_phases(), 2).unwrap();
        assert_eq!(
            statuses(&manager),
            vec![PhaseStatus::Completed, PhaseStatus::InProgress, PhaseStatus::Pending]
        );
        assert_eq!(manager.plan().unwrap().goal, "new goal");

        assert!(manager.update_plan("goal", three_phases(), 9).is_err());
        assert_eq!(manager.plan().unwrap().current_phase_id, 2);
    }

    #[test]
    fn test_advance_sequentially_to_completion() {
        let mut manager = PlanManager::new();
        manager.create_plan("goal", three_phases()).unwrap();

        manager.advance_phase(2).unwrap();
        manager.advance_phase(3).unwrap();
        assert_eq!(
            statuses(&manager),
            vec![PhaseStatus::Completed, PhaseStatus::Completed, PhaseStatus::InProgress]
        );
        assert!(!manager.is_complete());

        manager.complete_current_phase().unwrap();
        assert!(manager.is_complete());
        assert_eq!(manager.plan().unwrap().current_phase_id, 3);
    }

    #[test]
    fn test_advance_rejects_skips_and_leaves_plan_untouched() {
        let mut manager = PlanManager::new();
        manager.create_plan("goal", three_phases()).unwrap();
        manager.advance_phase(2).unwrap();
        let before = manager.plan().unwrap().clone();

        for bad in [0, 1, 2, 4, 99] {
            assert!(matches!(manager.advance_phase(bad), Err(Error::InvalidPlan(_))));
            assert_eq!(manager.plan().unwrap(), &before);
        }
    }

    #[test]
    fn test_advance_without_plan() {
        let mut manager = PlanManager::new();
        assert!(manager.advance_phase(2).is_err());
        assert!(manager.complete_current_phase().is_err());
        assert!(!manager.mark_current_phase_failed());
        assert!(!manager.is_complete());
    }

    #[test]
    fn test_complete_current_phase_requires_final_phase() {
        let mut manager = PlanManager::new();
        manager.create_plan("goal", three_phases()).unwrap();
        assert!(manager.complete_current_phase().is_err());
        assert_eq!(manager.current_phase().unwrap().status, PhaseStatus::InProgress);
    }

    #[test]
    fn test_mark_current_phase_failed() {
        let mut manager = PlanManager::new();
        manager.create_plan("goal", three_phases()).unwrap();
        manager.advance_phase(2).unwrap();

        assert!(manager.mark_current_phase_failed());
        assert_eq!(
            statuses(&manager),
            vec![PhaseStatus::Completed, PhaseStatus::Failed, PhaseStatus::Pending]
        );
        assert_eq!(manager.plan().unwrap().current_phase_id, 2);
        assert!(!manager.is_complete());
    }

    #[test]
    fn test_phase_definition_deserialize_defaults() {
        let def: PhaseDefinition =
            serde_json::from_str(r#"{"id":1,"title":"Browse","capabilities":{"browser":true}}"#)
                .unwrap();
        assert!(def.capabilities.browser);
        assert!(!def.capabilities.shell);
    }
}
