//! TOML-based configuration system for imagesync.
//!
//! All sensitive values (registry credentials, webhook secret) are stored
//! as `_env` fields that reference environment variable names. The actual
//! secrets are resolved at runtime via [`AppConfig::resolve_env_vars`].

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Top-level application configuration loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Daemon / polling settings.
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Git identity and SSH transport settings.
    pub git: GitConfig,

    /// Registry client settings.
    #[serde(default)]
    pub registry: RegistryConfig,

    /// Webhook / status endpoint settings.
    #[serde(default)]
    pub web: WebConfig,

    /// Pass behaviour settings.
    #[serde(default)]
    pub sync: SyncConfig,

    /// Repositories to keep updated.
    #[serde(default, rename = "repositories")]
    pub repositories: Vec<RepoConfig>,

    /// Version policies, matched against repository names in order.
    #[serde(default, rename = "policies")]
    pub policies: Vec<PolicyRuleConfig>,
}

// ---------------------------------------------------------------------------
// Daemon
// ---------------------------------------------------------------------------

/// Daemon / polling configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between update passes (default 300).
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Minimum tracing level: trace, debug, info, warn, error.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for persistent data (working trees).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_poll_interval() -> u64 {
    300
}
fn default_log_level() -> String {
    "info".into()
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/imagesync")
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            log_level: default_log_level(),
            data_dir: default_data_dir(),
        }
    }
}

// ---------------------------------------------------------------------------
// Git
// ---------------------------------------------------------------------------

/// Git identity and SSH transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Commit author name.
    #[serde(default = "default_author_name")]
    pub author_name: String,

    /// Commit author email.
    #[serde(default = "default_author_email")]
    pub author_email: String,

    /// Branch commits are pushed to unless a repository overrides it.
    #[serde(default = "default_branch")]
    pub branch: String,

    /// Path to the provisioned SSH private key.
    pub ssh_key_path: PathBuf,

    /// Path to the known-hosts record the remote's host key is verified
    /// against. Trust-on-first-use is not supported: the record must exist
    /// before the tool runs.
    #[serde(default = "default_known_hosts")]
    pub known_hosts_path: PathBuf,
}

fn default_author_name() -> String {
    "imagesync".into()
}
fn default_author_email() -> String {
    "imagesync@localhost".into()
}
fn default_branch() -> String {
    "main".into()
}
fn default_known_hosts() -> PathBuf {
    PathBuf::from("/etc/imagesync/known_hosts")
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Registry client configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry host used for repositories that do not name one
    /// (e.g. `app/base`).
    #[serde(default = "default_registry_host")]
    pub default_host: String,

    /// Environment variable holding the registry username.
    #[serde(default)]
    pub username_env: Option<String>,

    /// Environment variable holding the registry password or token.
    #[serde(default)]
    pub password_env: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_registry_timeout")]
    pub timeout_secs: u64,

    /// Retry attempts for transient failures.
    #[serde(default = "default_registry_retries")]
    pub retries: u32,

    /// Initial backoff between retries, in milliseconds (doubled per
    /// attempt).
    #[serde(default = "default_registry_backoff")]
    pub backoff_ms: u64,

    /// Maximum concurrent requests per registry host.
    #[serde(default = "default_registry_concurrency")]
    pub max_concurrent_requests: usize,

    /// Resolved username (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub username: Option<String>,

    /// Resolved password (populated by `resolve_env_vars`).
    #[serde(skip)]
    pub password: Option<String>,
}

fn default_registry_host() -> String {
    "registry-1.docker.io".into()
}
fn default_registry_timeout() -> u64 {
    30
}
fn default_registry_retries() -> u32 {
    3
}
fn default_registry_backoff() -> u64 {
    500
}
fn default_registry_concurrency() -> usize {
    4
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_host: default_registry_host(),
            username_env: None,
            password_env: None,
            timeout_secs: default_registry_timeout(),
            retries: default_registry_retries(),
            backoff_ms: default_registry_backoff(),
            max_concurrent_requests: default_registry_concurrency(),
            username: None,
            password: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Web
// ---------------------------------------------------------------------------

/// Webhook / status endpoint configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Listen address (default `127.0.0.1:3000`).
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Environment variable holding the webhook HMAC secret. When unset,
    /// the webhook endpoint is disabled.
    #[serde(default)]
    pub webhook_secret_env: Option<String>,

    /// Resolved webhook secret.
    #[serde(skip)]
    pub webhook_secret: Option<String>,
}

fn default_listen() -> String {
    "127.0.0.1:3000".into()
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            webhook_secret_env: None,
            webhook_secret: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Pass behaviour
// ---------------------------------------------------------------------------

/// Pass behaviour configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Maximum repositories processed concurrently.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_repos: usize,

    /// Bounded non-fast-forward retry budget for the publisher.
    #[serde(default = "default_publish_retries")]
    pub publish_retries: u32,

    /// Bounded re-plan budget when the mutator reports a moved tip.
    #[serde(default = "default_replan_retries")]
    pub replan_retries: u32,

    /// Optional global deadline for a pass, in seconds. Repositories not
    /// started by then are reported as failed with kind `deadline`.
    #[serde(default)]
    pub deadline_secs: Option<u64>,
}

fn default_max_concurrent() -> usize {
    4
}
fn default_publish_retries() -> u32 {
    3
}
fn default_replan_retries() -> u32 {
    1
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_concurrent_repos: default_max_concurrent(),
            publish_retries: default_publish_retries(),
            replan_retries: default_replan_retries(),
            deadline_secs: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Repositories
// ---------------------------------------------------------------------------

/// One git repository to keep updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoConfig {
    /// Short name, used for the working-tree directory and in results.
    pub name: String,

    /// SSH clone URL (e.g. `git@github.com:acme/deployments.git`).
    pub url: String,

    /// Branch override; defaults to `git.branch`.
    #[serde(default)]
    pub branch: Option<String>,
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

/// How a reference's current value is pinned and compared.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Pinning {
    /// The tag is the tracked value.
    #[default]
    Tag,
    /// The digest is the tracked value; tag and digest are rewritten
    /// together.
    Digest,
}

/// One version policy rule, matched against repository names in order.
///
/// Exactly one of `semver`, `tag`, or `filter` must be set:
/// - `semver`: a semantic-version range; the newest matching version wins.
/// - `tag`: a floating tag name, always re-resolved to its current digest.
/// - `filter`: a regular expression; the newest matching tag under natural
///   (alphanumeric) ordering wins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyRuleConfig {
    /// Glob pattern matched against the full repository name.
    pub pattern: String,

    /// Pinning mode.
    #[serde(default)]
    pub pinning: Pinning,

    /// Semantic-version range, e.g. `^1.2.0`.
    #[serde(default)]
    pub semver: Option<String>,

    /// Floating tag name, e.g. `latest`.
    #[serde(default)]
    pub tag: Option<String>,

    /// Regular expression tag filter, e.g. `^v[0-9]+`.
    #[serde(default)]
    pub filter: Option<String>,
}

// ---------------------------------------------------------------------------
// Loading & resolving
// ---------------------------------------------------------------------------

impl AppConfig {
    /// Load an [`AppConfig`] from a TOML file at the given path.
    ///
    /// This does **not** resolve environment variables -- call
    /// [`resolve_env_vars`](Self::resolve_env_vars) afterwards.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        info!(path = %path.display(), "loading configuration");

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let contents = std::fs::read_to_string(path)?;
        let config: AppConfig =
            toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        debug!("configuration parsed successfully");
        Ok(config)
    }

    /// Resolve all `*_env` fields from environment variables and populate
    /// the corresponding resolved fields.
    ///
    /// Fields that reference a missing variable log a warning but do
    /// **not** fail -- anonymous registry access and a disabled webhook are
    /// both valid configurations.
    pub fn resolve_env_vars(&mut self) -> Result<(), ConfigError> {
        info!("resolving environment variable references in config");

        if let Some(ref env_name) = self.registry.username_env {
            self.registry.username = resolve_optional_env(env_name, "registry.username_env");
        }
        if let Some(ref env_name) = self.registry.password_env {
            self.registry.password = resolve_optional_env(env_name, "registry.password_env");
        }
        if let Some(ref env_name) = self.web.webhook_secret_env {
            self.web.webhook_secret = resolve_optional_env(env_name, "web.webhook_secret_env");
        }

        debug!("environment variable resolution complete");
        Ok(())
    }

    /// Validate that all required fields are present and sane.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.repositories.is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "repositories".into(),
                detail: "at least one repository must be configured".into(),
            });
        }
        for repo in &self.repositories {
            if repo.name.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: "repositories.name".into(),
                    detail: "repository name must not be empty".into(),
                });
            }
            if repo.url.is_empty() {
                return Err(ConfigError::InvalidValue {
                    field: format!("repositories.{}.url", repo.name),
                    detail: "repository URL must not be empty".into(),
                });
            }
        }
        for rule in &self.policies {
            let selectors =
                [&rule.semver, &rule.tag, &rule.filter].iter().filter(|s| s.is_some()).count();
            if selectors != 1 {
                return Err(ConfigError::InvalidValue {
                    field: format!("policies.{}", rule.pattern),
                    detail: "exactly one of 'semver', 'tag', or 'filter' must be set".into(),
                });
            }
        }
        if self.git.ssh_key_path.as_os_str().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "git.ssh_key_path".into(),
                detail: "SSH key path must not be empty".into(),
            });
        }
        if self.sync.max_concurrent_repos == 0 {
            return Err(ConfigError::InvalidValue {
                field: "sync.max_concurrent_repos".into(),
                detail: "concurrency must be > 0".into(),
            });
        }
        if self.daemon.poll_interval_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "daemon.poll_interval_secs".into(),
                detail: "poll interval must be > 0".into(),
            });
        }

        Ok(())
    }

    /// Convenience: load, resolve, and validate in one call.
    pub fn load_and_resolve<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut config = Self::load_from_file(path)?;
        config.resolve_env_vars()?;
        config.validate()?;
        Ok(config)
    }

    /// The branch a repository is pushed to.
    pub fn branch_for<'a>(&'a self, repo: &'a RepoConfig) -> &'a str {
        repo.branch.as_deref().unwrap_or(&self.git.branch)
    }
}

/// Try to read an environment variable by name. Returns `Some(value)` on
/// success; logs a warning and returns `None` if the variable is unset.
fn resolve_optional_env(env_name: &str, field: &str) -> Option<String> {
    match std::env::var(env_name) {
        Ok(val) if !val.is_empty() => {
            debug!(field, env_name, "resolved env var");
            Some(val)
        }
        Ok(_) => {
            warn!(field, env_name, "env var is set but empty");
            None
        }
        Err(_) => {
            warn!(field, env_name, "env var not set");
            None
        }
    }
}
