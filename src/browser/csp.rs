//! Content security policy for pages opened by the agent

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// What a loaded page is permitted to do
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContentSecurityPolicy {
    pub allow_scripts: bool,
    pub allow_inline_scripts: bool,
    pub allow_external_images: bool,
    pub allow_iframes: bool,
    pub allow_forms: bool,
    pub allow_popups: bool,
    /// Substring or suffix match; always wins over the allowlist
    pub blocked_domains: Vec<String>,
    /// Empty means anything not blocked is allowed
    pub allowed_domains: Vec<String>,
}

impl Default for ContentSecurityPolicy {
    fn default() -> Self {
        Self {
            allow_scripts: true,
            allow_inline_scripts: false,
            allow_external_images: true,
            allow_iframes: false,
            allow_forms: true,
            allow_popups: false,
            blocked_domains: vec![
                "malware.com".to_string(),
                "phishing.com".to_string(),
                "malicious-site.com".to_string(),
                "coinhive.com".to_string(),
                "crypto-loot.com".to_string(),
            ],
            allowed_domains: Vec::new(),
        }
    }
}

/// Partial update applied by [`ContentSecurityManager::update_policy`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyUpdate {
    pub allow_scripts: Option<bool>,
    pub allow_inline_scripts: Option<bool>,
    pub allow_external_images: Option<bool>,
    pub allow_iframes: Option<bool>,
    pub allow_forms: Option<bool>,
    pub allow_popups: Option<bool>,
    pub blocked_domains: Option<Vec<String>>,
    pub allowed_domains: Option<Vec<String>>,
}

/// Capability flags handed to the browser engine when opening a page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageCapabilities {
    pub javascript_enabled: bool,
    pub inline_scripts: bool,
    pub external_images: bool,
    pub iframes: bool,
    pub forms: bool,
    pub popups: bool,
}

/// Owns one mutable policy, shared by every task
#[derive(Debug, Default)]
pub struct ContentSecurityManager {
    policy: RwLock<ContentSecurityPolicy>,
}

impl ContentSecurityManager {
    pub fn new(policy: ContentSecurityPolicy) -> Self {
        Self {
            policy: RwLock::new(normalize(policy)),
        }
    }

    /// Copy of the current policy
    pub fn policy(&self) -> ContentSecurityPolicy {
        self.policy.read().clone()
    }

    pub fn update_policy(&self, update: PolicyUpdate) {
        let mut policy = self.policy.write();
        if let Some(v) = update.allow_scripts {
            policy.allow_scripts = v;
        }
        if let Some(v) = update.allow_inline_scripts {
            policy.allow_inline_scripts = v;
        }
        if let Some(v) = update.allow_external_images {
            policy.allow_external_images = v;
        }
        if let Some(v) = update.allow_iframes {
            policy.allow_iframes = v;
        }
        if let Some(v) = update.allow_forms {
            policy.allow_forms = v;
        }
        if let Some(v) = update.allow_popups {
            policy.allow_popups = v;
        }
        if let Some(v) = update.blocked_domains {
            policy.blocked_domains = normalize_domains(v);
        }
        if let Some(v) = update.allowed_domains {
            policy.allowed_domains = normalize_domains(v);
        }
        tracing::info!("Content security policy updated");
    }

    pub fn block_domain(&self, domain: &str) {
        let domain = domain.trim().to_lowercase();
        let mut policy = self.policy.write();
        if !domain.is_empty() && !policy.blocked_domains.contains(&domain) {
            policy.blocked_domains.push(domain);
        }
    }

    pub fn allow_domain(&self, domain: &str) {
        let domain = domain.trim().to_lowercase();
        let mut policy = self.policy.write();
        if !domain.is_empty() && !policy.allowed_domains.contains(&domain) {
            policy.allowed_domains.push(domain);
        }
    }

    /// Blocklist first, then the allowlist if one is configured
    pub fn is_domain_allowed(&self, domain: &str) -> bool {
        let domain = domain.trim().trim_end_matches('.').to_lowercase();
        let policy = self.policy.read();

        let blocked = policy.blocked_domains.iter().any(|b| {
            domain.contains(b.as_str()) || domain.ends_with(&format!(".{}", b))
        });
        if blocked {
            tracing::debug!(domain = %domain, "Domain is on the blocklist");
            return false;
        }

        if policy.allowed_domains.is_empty() {
            return true;
        }
        policy
            .allowed_domains
            .iter()
            .any(|a| domain == *a || domain.ends_with(&format!(".{}", a)))
    }

    pub fn page_capabilities(&self) -> PageCapabilities {
        let policy = self.policy.read();
        PageCapabilities {
            javascript_enabled: policy.allow_scripts,
            inline_scripts: policy.allow_scripts && policy.allow_inline_scripts,
            external_images: policy.allow_external_images,
            iframes: policy.allow_iframes,
            forms: policy.allow_forms,
            popups: policy.allow_popups,
        }
    }

    /// `Content-Security-Policy` header value for the current policy
    pub fn to_header_string(&self) -> String {
        let policy = self.policy.read();

        let script_src = match (policy.allow_scripts, policy.allow_inline_scripts) {
            (false, _) => "script-src 'none'",
            (true, false) => "script-src 'self'",
            (true, true) => "script-src 'self' 'unsafe-inline'",
        };
        let img_src = if policy.allow_external_images {
            "img-src 'self' data: https:"
        } else {
            "img-src 'self' data:"
        };
        let frame_src = if policy.allow_iframes {
            "frame-src 'self'"
        } else {
            "frame-src 'none'"
        };
        let form_action = if policy.allow_forms {
            "form-action 'self'"
        } else {
            "form-action 'none'"
        };

        ["default-src 'self'", script_src, img_src, frame_src, form_action].join("; ")
    }
}

fn normalize(mut policy: ContentSecurityPolicy) -> ContentSecurityPolicy {
    policy.blocked_domains = normalize_domains(policy.blocked_domains);
    policy.allowed_domains = normalize_domains(policy.allowed_domains);
    policy
}

fn normalize_domains(domains: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(domains.len());
    for d in domains {
        let d = d.trim().trim_start_matches("*.").to_lowercase();
        if !d.is_empty() && !out.contains(&d) {
            out.push(d);
        }
    }
    out
}
