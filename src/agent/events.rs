//! Typed lifecycle events for one task
//!
//! `EventEmitter` is a synchronous, in-process fan-out. Handlers subscribe to
//! a single event type or to the `*` wildcard. Dispatch order is
//! type-specific handlers first, then wildcard handlers, each in
//! subscription order.

use crate::agent::plan::TaskPlan;
use crate::agent::types::{ToolCall, ToolResult};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Channel that receives every event
pub const WILDCARD: &str = "*";

// =============================================================================
// Event payloads
// =============================================================================

/// Kind of outbound message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// Question to the user; the task waits for an answer
    Ask,
    /// Final task result
    Result,
    /// Progress note
    Info,
}

/// Where an observation came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObservationSource {
    Tool,
    User,
}

/// Event payload, one variant per event type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum EventPayload {
    #[serde(rename = "task.created")]
    TaskCreated { prompt: String },

    #[serde(rename = "plan.updated")]
    PlanUpdated { plan: TaskPlan },

    #[serde(rename = "phase.started")]
    PhaseStarted { phase_id: u32, title: String },

    #[serde(rename = "action.started")]
    ActionStarted { call: ToolCall },

    #[serde(rename = "action.completed")]
    ActionCompleted { result: ToolResult },

    #[serde(rename = "observation.received")]
    ObservationReceived {
        source: ObservationSource,
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        call_id: Option<String>,
    },

    #[serde(rename = "message.sent")]
    MessageSent { kind: MessageKind, content: String },

    #[serde(rename = "task.completed")]
    TaskCompleted { result: String },

    #[serde(rename = "task.failed")]
    TaskFailed { error: String },

    #[serde(rename = "error")]
    Error { message: String },
}

impl EventPayload {
    /// Wire name of this event type
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::TaskCreated { .. } => "task.created",
            Self::PlanUpdated { .. } => "plan.updated",
            Self::PhaseStarted { .. } => "phase.started",
            Self::ActionStarted { .. } => "action.started",
            Self::ActionCompleted { .. } => "action.completed",
            Self::ObservationReceived { .. } => "observation.received",
            Self::MessageSent { .. } => "message.sent",
            Self::TaskCompleted { .. } => "task.completed",
            Self::TaskFailed { .. } => "task.failed",
            Self::Error { .. } => "error",
        }
    }
}

/// A broadcast lifecycle event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEvent {
    pub task_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl AgentEvent {
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

// =============================================================================
// EventEmitter
// =============================================================================

/// Handle returned by [`EventEmitter::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&AgentEvent) + Send + Sync>;

/// Per-task synchronous publish/subscribe
pub struct EventEmitter {
    task_id: String,
    handlers: RwLock<HashMap<String, Vec<(SubscriptionId, Handler)>>>,
    next_id: AtomicU64,
}

impl EventEmitter {
    /// Create an emitter bound to `task_id`
    pub fn new(task_id: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            handlers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Subscribe to one event type, or to [`WILDCARD`] for all of them
    pub fn subscribe<F>(&self, event_type: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .write()
            .entry(event_type.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        id
    }

    /// Subscribe to every event
    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&AgentEvent) + Send + Sync + 'static,
    {
        self.subscribe(WILDCARD, handler)
    }

    /// Remove a subscription. Returns whether it existed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let mut removed = false;
        for list in handlers.values_mut() {
            let before = list.len();
            list.retain(|(sid, _)| *sid != id);
            removed |= list.len() != before;
        }
        handlers.retain(|_, list| !list.is_empty());
        removed
    }

    /// Number of handlers registered for exactly `event_type`
    pub fn handler_count(&self, event_type: &str) -> usize {
        self.handlers
            .read()
            .get(event_type)
            .map(Vec::len)
            .unwrap_or(0)
    }

    /// Build an event and deliver it synchronously.
    ///
    /// Handlers run on a snapshot taken before dispatch, so a handler may
    /// subscribe, unsubscribe, or emit without deadlocking. A panicking
    /// handler is logged and skipped.
    pub fn emit(&self, payload: EventPayload) -> AgentEvent {
        let event = AgentEvent {
            task_id: self.task_id.clone(),
            timestamp: Utc::now(),
            payload,
        };
        let event_type = event.event_type();

        let snapshot: Vec<Handler> = {
            let handlers = self.handlers.read();
            let specific = handlers.get(event_type).into_iter().flatten();
            let wildcard = handlers.get(WILDCARD).into_iter().flatten();
            specific
                .chain(wildcard)
                .map(|(_, handler)| Arc::clone(handler))
                .collect()
        };

        tracing::debug!(
            task_id = %self.task_id,
            event_type,
            handlers = snapshot.len(),
            "Dispatching event"
        );

        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
                tracing::warn!(
                    task_id = %self.task_id,
                    event_type,
                    "Event handler panicked; continuing with remaining handlers"
                );
            }
        }

        event
    }
}

impl std::fmt::Debug for EventEmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let counts: HashMap<String, usize> = self
            .handlers
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.len()))
            .collect();
        f.debug_struct("EventEmitter")
            .field("task_id", &self.task_id)
            .field("handlers", &counts)
            .finish()
    }
}
