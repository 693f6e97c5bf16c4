//! Tool call and result records
//!
//! Both are append-only history entries: the orchestrator never mutates
//! them after they are recorded. Results refer back to their call by id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// A request to run an external tool on the agent's behalf
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub parameters: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl ToolCall {
    /// New call with a generated id and the current timestamp
    pub fn new(name: impl Into<String>, parameters: serde_json::Value) -> Self {
        Self {
            id: format!("call-{}", uuid::Uuid::new_v4()),
            name: name.into(),
            parameters,
            timestamp: Utc::now(),
        }
    }
}

/// Outcome reported by the tool-execution backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolResult {
    pub call_id: String,
    pub success: bool,
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ToolResult {
    pub fn success(call_id: impl Into<String>, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            call_id: call_id.into(),
            success: true,
            output: output.into(),
            error: None,
            duration_ms,
        }
    }

    pub fn failure(call_id: impl Into<String>, error: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            call_id: call_id.into(),
            success: false,
            output: String::new(),
            error: Some(error.into()),
            duration_ms,
        }
    }
}

/// What the caller should do after a tool result has been recorded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolOutcome {
    /// Result accepted, keep executing
    Continue,
    /// Failure within budget. The caller waits `delay` and re-invokes the
    /// tool itself; nothing is scheduled by the core.
    RetryAfter { attempt: u32, delay: Duration },
    /// Retry budget exhausted, the task is waiting for user input
    AwaitingUser,
}
