//! Store configuration.
//!
//! Loaded from a YAML file, a YAML string, or the process environment.

use crate::error::{MushafDbError, Result};
use crate::schema::{parse_schema, CollectionSchema};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

fn default_branch() -> String {
    "main".to_string()
}

fn default_base_path() -> String {
    "db".to_string()
}

fn default_media_path() -> String {
    "media".to_string()
}

fn default_poll_interval_secs() -> u64 {
    10
}

#[derive(Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    pub owner: String,
    pub repo: String,
    #[serde(default)]
    pub token: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    #[serde(default = "default_base_path", alias = "basePath")]
    pub base_path: String,
    /// Binary assets live under this path; the store itself never touches it.
    #[serde(default = "default_media_path", alias = "mediaPath")]
    pub media_path: String,
    /// Extra collection schemas, replacing built-ins of the same name.
    #[serde(default)]
    pub schemas: HashMap<String, CollectionSchema>,
    #[serde(default)]
    pub auth: AuthConfig,
    /// Carried for the application; not interpreted here.
    #[serde(default, alias = "paymentGateways")]
    pub payment_gateways: serde_json::Value,
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Sessions never expire when unset.
    #[serde(default)]
    pub session_ttl_secs: Option<u64>,
    /// Overrides https://api.github.com, e.g. for GitHub Enterprise.
    #[serde(default)]
    pub api_base: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_true", alias = "requireEmailVerification")]
    pub require_email_verification: bool,
    #[serde(default = "default_otp_triggers", alias = "otpTriggers")]
    pub otp_triggers: Vec<String>,
}

fn default_true() -> bool {
    true
}

fn default_otp_triggers() -> Vec<String> {
    vec!["register".to_string()]
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            require_email_verification: true,
            otp_triggers: default_otp_triggers(),
        }
    }
}

/// Bounded retry of writes that failed with a retryable remote error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_delay_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl RetryConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

impl StoreConfig {
    pub fn new(owner: &str, repo: &str, token: &str) -> Self {
        Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            token: token.to_string(),
            branch: default_branch(),
            base_path: default_base_path(),
            media_path: default_media_path(),
            schemas: HashMap::new(),
            auth: AuthConfig::default(),
            payment_gateways: serde_json::Value::Null,
            poll_interval_secs: default_poll_interval_secs(),
            retry: RetryConfig::default(),
            session_ttl_secs: None,
            api_base: None,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: StoreConfig = serde_yaml::from_str(content)?;
        config.check()?;
        Ok(config)
    }

    /// Read `GITHUB_OWNER`, `GITHUB_REPO`, `GITHUB_TOKEN`, `GITHUB_BRANCH`,
    /// `MUSHAFDB_BASE_PATH`, `MUSHAFDB_MEDIA_PATH` and `MUSHAFDB_SCHEMA_FILE`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key).filter(|v| !v.is_empty()).ok_or_else(|| {
                MushafDbError::Config(format!("{key} environment variable is required"))
            })
        };

        let mut config = Self::new(
            &required("GITHUB_OWNER")?,
            &required("GITHUB_REPO")?,
            &required("GITHUB_TOKEN")?,
        );
        if let Some(branch) = lookup("GITHUB_BRANCH") {
            config.branch = branch;
        }
        if let Some(base_path) = lookup("MUSHAFDB_BASE_PATH") {
            config.base_path = base_path;
        }
        if let Some(media_path) = lookup("MUSHAFDB_MEDIA_PATH") {
            config.media_path = media_path;
        }
        if let Some(schema_file) = lookup("MUSHAFDB_SCHEMA_FILE") {
            config.schemas = parse_schema(Path::new(&schema_file))?.collections;
        }
        config.check()?;
        Ok(config)
    }

    fn check(&self) -> Result<()> {
        if self.owner.is_empty() || self.repo.is_empty() {
            return Err(MushafDbError::Config("owner and repo must be set".into()));
        }
        if self.branch.is_empty() {
            return Err(MushafDbError::Config("branch must not be empty".into()));
        }
        if self.poll_interval_secs == 0 {
            return Err(MushafDbError::Config("poll_interval_secs must be positive".into()));
        }
        Ok(())
    }

    /// `<base_path>/<collection>.json`
    pub fn collection_path(&self, collection: &str) -> String {
        let base = self.base_path.trim_matches('/');
        if base.is_empty() {
            format!("{collection}.json")
        } else {
            format!("{base}/{collection}.json")
        }
    }

    /// `<media_path>/<name>`
    pub fn media_path_for(&self, name: &str) -> String {
        format!("{}/{}", self.media_path.trim_end_matches('/'), name.trim_start_matches('/'))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn session_ttl(&self) -> Option<Duration> {
        self.session_ttl_secs.map(Duration::from_secs)
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("token", &if self.token.is_empty() { "" } else { "***" })
            .field("branch", &self.branch)
            .field("base_path", &self.base_path)
            .field("media_path", &self.media_path)
            .field("schemas", &self.schemas.keys().collect::<Vec<_>>())
            .field("auth", &self.auth)
            .field("poll_interval_secs", &self.poll_interval_secs)
            .field("retry", &self.retry)
            .field("session_ttl_secs", &self.session_ttl_secs)
            .field("api_base", &self.api_base)
            .finish()
    }
}
