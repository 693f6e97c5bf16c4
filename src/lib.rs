//! TaskPilot - agent task control core with guarded browser automation
//!
//! TaskPilot drives a single agent task through an explicit lifecycle and
//! gates every browser action the agent may perform.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                     AgentOrchestrator                        │
//! │  ┌───────────────────┐ ┌─────────────┐ ┌─────────────────┐   │
//! │  │ AgentStateMachine │ │ PlanManager │ │  EventEmitter   │   │
//! │  │ - allow-list      │ │ - phases    │ │ - typed events  │   │
//! │  │ - retry/backoff   │ │ - sequence  │ │ - `*` wildcard  │   │
//! │  └───────────────────┘ └─────────────┘ └─────────────────┘   │
//! └───────────────────────────────┬──────────────────────────────┘
//!                                 │ injected, shared per process
//! ┌───────────────────────────────▼──────────────────────────────┐
//! │                      SecurityServices                        │
//! │  ┌───────────────┐ ┌─────────────────┐ ┌──────────────────┐  │
//! │  │ NetworkFilter │ │ ResourceLimiter │ │ ContentSecurity  │  │
//! │  │ - SSRF rules  │ │ - per session   │ │ - CSP header     │  │
//! │  │ - downloads   │ │ - scoped guards │ │ - domain lists   │  │
//! │  └───────────────┘ └─────────────────┘ └──────────────────┘  │
//! └──────────────────────────────────────────────────────────────┘
//!            SessionPersistence (sealed rows in a SessionStore)
//! ```
//!
//! ## Modules
//!
//! - [`agent`]: lifecycle state machine, plan, events, orchestrator
//! - [`browser`]: network filter, resource limiter, CSP, session persistence
//! - [`crypto`]: AES-256-GCM sealing for persisted browser state
//! - [`config`]: Configuration management

pub mod agent;
pub mod browser;
pub mod config;
pub mod crypto;
pub mod error;

pub use agent::{AgentOrchestrator, AgentState, ToolOutcome};
pub use browser::SecurityServices;
pub use config::TaskPilotConfig;
pub use error::{Error, Result};
