//! Security layer for browser automation
//!
//! Every browser tool call is gated here before it reaches the automation
//! engine:
//!
//! - `network` - SSRF, sensitive-domain and download filtering
//! - `limiter` - per-session page, action, duration and download ceilings
//! - `csp` - what a loaded page may do, and the domain allow/block lists
//! - `persistence` - encrypted save/restore of browser session state

pub mod csp;
pub mod limiter;
pub mod network;
pub mod persistence;

pub use csp::{ContentSecurityManager, ContentSecurityPolicy, PageCapabilities, PolicyUpdate};
pub use limiter::{ActionGuard, LimitCheck, PageGuard, ResourceLimiter, ResourceLimits};
pub use network::{sanitize_url_for_logging, BlockCategory, FilterResult, NetworkFilter};
pub use persistence::{
    FileSessionStore, MemorySessionStore, PersistedSession, SessionPersistence, SessionSnapshot,
    SessionStore,
};

use crate::agent::ToolResult;
use crate::config::TaskPilotConfig;
use crate::error::Result;
use std::sync::Arc;

/// Why a browser action was refused
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityDenial {
    /// Rejected by the URL filter
    Network(FilterResult),
    /// Domain is blocked, or missing from a configured allowlist
    Domain(String),
    /// Session is over a resource ceiling
    Limit(LimitCheck),
}

impl SecurityDenial {
    pub fn reason(&self) -> String {
        match self {
            Self::Network(result) => format!(
                "Blocked by network filter ({}): {}",
                result
                    .category
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "unknown".to_string()),
                result.reason.as_deref().unwrap_or("no reason given")
            ),
            Self::Domain(domain) => {
                format!("Domain {} is not allowed by the content policy", domain)
            }
            Self::Limit(check) => format!(
                "Resource limit reached: {}",
                check.reason.as_deref().unwrap_or("no reason given")
            ),
        }
    }

    /// Failed tool result to feed back into the orchestrator
    pub fn into_tool_result(self, call_id: impl Into<String>) -> ToolResult {
        ToolResult::failure(call_id, self.reason(), 0)
    }
}

impl std::fmt::Display for SecurityDenial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.reason())
    }
}

/// Guards shared by every running task
#[derive(Debug, Clone)]
pub struct SecurityServices {
    pub network: Arc<NetworkFilter>,
    pub limiter: Arc<ResourceLimiter>,
    pub content_security: Arc<ContentSecurityManager>,
}

impl SecurityServices {
    pub fn new(
        network: Arc<NetworkFilter>,
        limiter: Arc<ResourceLimiter>,
        content_security: Arc<ContentSecurityManager>,
    ) -> Self {
        Self {
            network,
            limiter,
            content_security,
        }
    }

    pub fn from_config(config: &TaskPilotConfig) -> Result<Self> {
        Ok(Self::new(
            Arc::new(NetworkFilter::new(&config.network)?),
            Arc::new(ResourceLimiter::new(config.limits.clone())),
            Arc::new(ContentSecurityManager::new(
                config.content_security.clone(),
            )),
        ))
    }

    /// URL filter, then content-policy domain check, then action limits
    pub fn check_navigation(
        &self,
        session_id: &str,
        url: &str,
    ) -> std::result::Result<(), SecurityDenial> {
        self.check_url(url)?;

        let check = self.limiter.can_execute_action(session_id);
        if !check.allowed {
            tracing::warn!(session_id, reason = ?check.reason, "Navigation over limit");
            return Err(SecurityDenial::Limit(check));
        }
        Ok(())
    }

    /// Same URL checks as navigation, then the download size budget
    pub fn check_download(
        &self,
        session_id: &str,
        url: &str,
        size_bytes: u64,
    ) -> std::result::Result<(), SecurityDenial> {
        self.check_url(url)?;

        let check = self.limiter.can_download(session_id, size_bytes);
        if !check.allowed {
            tracing::warn!(session_id, reason = ?check.reason, "Download over limit");
            return Err(SecurityDenial::Limit(check));
        }
        Ok(())
    }

    fn check_url(&self, url: &str) -> std::result::Result<(), SecurityDenial> {
        let result = self.network.validate_url(url);
        if !result.allowed {
            return Err(SecurityDenial::Network(result));
        }

        // validate_url only passes http(s) URLs with a host
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default();
        if !self.content_security.is_domain_allowed(&host) {
            tracing::warn!(
                url = %sanitize_url_for_logging(url),
                "Domain rejected by content policy"
            );
            return Err(SecurityDenial::Domain(host));
        }
        Ok(())
    }
}
