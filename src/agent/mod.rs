//! Agent task control core
//!
//! One [`AgentOrchestrator`] drives one task through its lifecycle:
//!
//! ```text
//! start_task ──► create_plan ──► tool loop ──► complete_task
//!   (Idle→Planning)  (→Executing)   │  ▲            (→Delivering→Idle)
//!                                    │  │ retry / user input
//!                                    ▼  │
//!                                  fail_task (→Failed)
//! ```
//!
//! - `state` - lifecycle allow-list and retry/backoff bookkeeping
//! - `plan` - strictly sequential plan phases
//! - `events` - typed synchronous event fan-out
//! - `types` - tool call/result history records
//! - `orchestrator` - the facade composing the above

pub mod events;
pub mod orchestrator;
pub mod plan;
pub mod state;
pub mod types;

pub use events::{
    AgentEvent, EventEmitter, EventPayload, MessageKind, ObservationSource, SubscriptionId,
};
pub use orchestrator::AgentOrchestrator;
pub use plan::{Phase, PhaseCapabilities, PhaseDefinition, PhaseStatus, PlanManager, TaskPlan};
pub use state::{AgentState, AgentStateMachine, RetryConfig, TransitionTrigger};
pub use types::{ToolCall, ToolOutcome, ToolResult};
