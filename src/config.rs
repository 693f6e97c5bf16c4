//! TaskPilot configuration management
//!
//! Every section is optional in TOML; missing fields fall back to defaults.
//!
//! ```toml
//! [retry]
//! max_retries = 5
//!
//! [limits]
//! max_pages = 4
//!
//! [network]
//! allow_sensitive_domains = true
//!
//! [content_security]
//! allowed_domains = ["example.com"]
//!
//! [persistence]
//! ttl_secs = 3600
//! ```

use crate::agent::RetryConfig;
use crate::browser::csp::ContentSecurityPolicy;
use crate::browser::limiter::ResourceLimits;
use crate::browser::network::NetworkFilterConfig;
use crate::browser::persistence::FileSessionStore;
use crate::crypto::SessionCipher;
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that overrides `persistence.secret`
pub const SESSION_SECRET_ENV: &str = "TASKPILOT_SESSION_SECRET";

/// Upper bound for `persistence.ttl_secs` (one year)
pub const MAX_SESSION_TTL_SECS: u64 = 365 * 24 * 60 * 60;

/// Main TaskPilot configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskPilotConfig {
    /// Tool failure retry and backoff
    pub retry: RetryConfig,

    /// Browser resource ceilings
    pub limits: ResourceLimits,

    /// URL filter extras
    pub network: NetworkFilterConfig,

    /// Page content policy
    pub content_security: ContentSecurityPolicy,

    /// Session persistence
    pub persistence: PersistenceConfig,

    /// Stale browser session sweeper
    pub sweeper: SweeperConfig,
}

/// Session store backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    File,
    Memory,
}

/// Session persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub backend: StoreBackend,

    /// Lifetime of a saved session in seconds
    pub ttl_secs: u64,

    /// Directory for the file backend (default ~/.taskpilot/sessions)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Secret the session key is derived from. Never written back out.
    #[serde(skip_serializing)]
    pub secret: Option<String>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::File,
            ttl_secs: 24 * 60 * 60,
            data_dir: None,
            secret: None,
        }
    }
}

impl PersistenceConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(FileSessionStore::default_dir)
    }

    /// Key derived from the configured secret, or a random one
    pub fn cipher(&self) -> Result<SessionCipher> {
        match self.secret.as_deref() {
            Some(secret) => SessionCipher::from_secret(secret),
            None => {
                tracing::warn!(
                    "No session secret configured; saved sessions will not survive a restart"
                );
                Ok(SessionCipher::generate())
            }
        }
    }
}

/// Stale browser session sweeper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub enabled: bool,

    /// Seconds between sweeps
    pub interval_secs: u64,

    /// Idle time after which a session is dropped
    pub max_idle_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            max_idle_secs: 30 * 60,
        }
    }
}

impl SweeperConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_idle(&self) -> Duration {
        Duration::from_secs(self.max_idle_secs)
    }
}

impl TaskPilotConfig {
    /// Parse and validate a TOML document. Environment is not consulted.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a TOML file and apply environment overrides
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&content)?;
        config.apply_env();
        Ok(config)
    }

    /// `load(path)` when a path is given, otherwise defaults plus environment
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let mut config = Self::default();
                config.apply_env();
                Ok(config)
            }
        }
    }

    fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var(SESSION_SECRET_ENV) {
            if !secret.is_empty() {
                self.persistence.secret = Some(secret);
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let multiplier = self.retry.backoff_multiplier;
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(Error::Config(format!(
                "retry.backoff_multiplier must be >= 1.0, got {}",
                multiplier
            )));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(Error::Config(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms".to_string(),
            ));
        }
        if self.limits.max_pages == 0 || self.limits.max_contexts == 0 {
            return Err(Error::Config(
                "limits.max_pages and limits.max_contexts must be positive".to_string(),
            ));
        }
        if self.limits.max_concurrent_actions == 0 {
            return Err(Error::Config(
                "limits.max_concurrent_actions must be positive".to_string(),
            ));
        }
        if self.persistence.ttl_secs == 0 || self.persistence.ttl_secs > MAX_SESSION_TTL_SECS {
            return Err(Error::Config(format!(
                "persistence.ttl_secs must be between 1 and {}",
                MAX_SESSION_TTL_SECS
            )));
        }
        if self.sweeper.enabled && self.sweeper.interval_secs == 0 {
            return Err(Error::Config("sweeper.interval_secs must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TaskPilotConfig::default();
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.retry.initial_delay_ms, 1000);
        assert_eq!(config.limits.max_pages, 10);
        assert_eq!(config.limits.max_contexts, 5);
        assert!(!config.network.allow_sensitive_domains);
        assert!(config.content_security.allowed_domains.is_empty());
        assert_eq!(config.persistence.ttl(), Duration::from_secs(86_400));
        assert_eq!(config.persistence.backend, StoreBackend::File);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml() {
        let config = TaskPilotConfig::from_toml_str(
            r#"
            [retry]
            max_retries = 5

            [limits]
            max_pages = 4

            [content_security]
            allowed_domains = ["example.com"]

            [persistence]
            backend = "memory"
            ttl_secs = 60
            "#,
        )
        .unwrap();

        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.max_delay_ms, 30_000);
        assert_eq!(config.limits.max_pages, 4);
        assert_eq!(config.limits.max_contexts, 5);
        assert_eq!(config.content_security.allowed_domains, vec!["example.com"]);
        assert!(!config.content_security.allow_iframes);
        assert_eq!(config.persistence.backend, StoreBackend::Memory);
        assert_eq!(config.persistence.ttl_secs, 60);
    }

    #[test]
    fn test_empty_toml_is_default() {
        let config = TaskPilotConfig::from_toml_str("").unwrap();
        assert_eq!(config.limits, ResourceLimits::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(TaskPilotConfig::from_toml_str("[retry]\nbackoff_multiplier = 0.5").is_err());
        assert!(TaskPilotConfig::from_toml_str("[limits]\nmax_pages = 0").is_err());
        assert!(TaskPilotConfig::from_toml_str("[persistence]\nttl_secs = 0").is_err());
        assert!(
            TaskPilotConfig::from_toml_str("[persistence]\nttl_secs = 10000000000000").is_err()
        );
        assert!(TaskPilotConfig::from_toml_str(&format!(
            "[persistence]\nttl_secs = {}",
            MAX_SESSION_TTL_SECS
        ))
        .is_ok());
        assert!(TaskPilotConfig::from_toml_str("[retry]\nmax_retries = \"three\"").is_err());
    }

    #[test]
    fn test_secret_is_not_serialized() {
        let mut config = TaskPilotConfig::default();
        config.persistence.secret = Some("hunter2".to_string());

        let toml = toml::to_string_pretty(&config).unwrap();
        assert!(!toml.contains("hunter2"));
        assert!(toml.contains("[persistence]"));
    }

    #[test]
    fn test_cipher_from_secret() {
        let config = PersistenceConfig {
            secret: Some("shared".to_string()),
            ..Default::default()
        };
        let sealed = config.cipher().unwrap().seal(b"cookie").unwrap();
        assert_eq!(config.cipher().unwrap().open(&sealed).unwrap(), b"cookie");
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("taskpilot.toml");
        std::fs::write(&path, "[sweeper]\ninterval_secs = 5\n").unwrap();

        let config = TaskPilotConfig::load(&path).unwrap();
        assert_eq!(config.sweeper.interval(), Duration::from_secs(5));

        assert!(TaskPilotConfig::load(&dir.path().join("missing.toml")).is_err());
    }
}
