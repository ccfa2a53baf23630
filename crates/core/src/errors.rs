//! Error types for the imagesync core library.
//!
//! Each pipeline stage has its own error type derived with `thiserror`, and
//! a top-level [`CoreError`] enum unifies them for callers that want a
//! single error type. Failures are scoped to the smallest unit possible:
//! extraction problems skip one reference, registry problems fail one
//! repository, and nothing short of a panic aborts a whole pass.

use std::path::PathBuf;

use thiserror::Error;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Unified error type for the entire core library.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Mutate(#[from] MutateError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

// ---------------------------------------------------------------------------
// Extraction warnings
// ---------------------------------------------------------------------------

/// A non-fatal problem found while scanning one file for image references.
///
/// Warnings are collected and reported; they never abort the scan, and the
/// offending reference is simply excluded from the result.
#[derive(Debug, Clone, Error)]
#[error("{}:{line}: {detail}", file.display())]
pub struct ExtractWarning {
    /// File the malformed reference was found in.
    pub file: PathBuf,
    /// 1-based line number.
    pub line: usize,
    /// What was wrong with the token.
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Registry errors
// ---------------------------------------------------------------------------

/// Errors from registry tag listing and manifest resolution.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Transient failure (network, timeout, 5xx). Retried with backoff;
    /// surfacing this means the retries were exhausted.
    #[error("registry unavailable for '{repository}': {detail}")]
    Unavailable { repository: String, detail: String },

    /// No tag satisfied the policy. Terminal for this reference this pass.
    #[error("no version of '{repository}' matches the policy: {detail}")]
    NoMatchingVersion { repository: String, detail: String },

    /// The registry rejected our credentials.
    #[error("registry authentication failed for '{repository}': {detail}")]
    AuthenticationFailed { repository: String, detail: String },

    /// The registry returned a non-success status that is not transient.
    #[error("registry API error for '{repository}' (HTTP {status}): {detail}")]
    Api {
        repository: String,
        status: u16,
        detail: String,
    },

    /// The registry response could not be interpreted.
    #[error("registry response parse error for '{repository}': {detail}")]
    Parse { repository: String, detail: String },
}

impl RegistryError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable { .. })
    }
}

// ---------------------------------------------------------------------------
// Planner errors
// ---------------------------------------------------------------------------

/// Errors from computing a change set.
///
/// Per-reference problems (no matching version, policy mismatch) are
/// reported as warnings on the plan, not as errors; only failures that
/// invalidate the whole repository's plan surface here.
#[derive(Debug, Error)]
pub enum PlanError {
    /// The registry could not be reached for a referenced repository.
    #[error("plan aborted: {0}")]
    Registry(#[from] RegistryError),
}

// ---------------------------------------------------------------------------
// Git errors
// ---------------------------------------------------------------------------

/// Errors from local Git (git2) operations.
#[derive(Debug, Error)]
pub enum GitError {
    /// The repository path does not exist or is not a git repo.
    #[error("git repository not found at '{0}'")]
    RepositoryNotFound(String),

    /// A `git2` library error.
    #[error("git2 error: {0}")]
    Git2Error(#[from] git2::Error),

    /// A ref (branch, SHA) could not be resolved.
    #[error("git ref not found: {0}")]
    RefNotFound(String),

    /// Push was rejected by the remote.
    #[error("git push rejected for branch '{branch}': {detail}")]
    PushRejected { branch: String, detail: String },

    /// The remote's SSH host key did not match the known-hosts record.
    #[error("host key verification failed for '{host}': {detail}")]
    HostKeyMismatch { host: String, detail: String },

    /// Generic I/O wrapper.
    #[error("git I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Mutator errors
// ---------------------------------------------------------------------------

/// Errors from applying a change set to a working tree.
#[derive(Debug, Error)]
pub enum MutateError {
    /// The branch tip advanced since the change set was planned. The caller
    /// must re-plan against the new tip.
    #[error("working tree tip moved: planned against {expected}, found {actual}")]
    ConcurrentModification { expected: String, actual: String },

    /// Two edits target overlapping byte ranges in the same file.
    #[error("conflicting edits in '{}' at bytes {first_start}..{second_start}", file.display())]
    EditConflict {
        file: PathBuf,
        first_start: usize,
        second_start: usize,
    },

    /// The bytes at an edit's span no longer match the extracted original.
    #[error("span validation failed in '{}': expected '{expected}', found '{found}'", file.display())]
    SpanValidation {
        file: PathBuf,
        expected: String,
        found: String,
    },

    /// Underlying git failure while staging or committing.
    #[error(transparent)]
    Git(#[from] GitError),

    /// Generic I/O wrapper.
    #[error("mutate I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Publisher errors
// ---------------------------------------------------------------------------

/// Errors from pushing a commit to the remote.
#[derive(Debug, Error)]
pub enum PublishError {
    /// SSH authentication could not be established. Terminal, not retried.
    #[error("publish authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The remote rejected the push for a non-conflict reason
    /// (permissions, branch protection). Terminal.
    #[error("push rejected by remote for branch '{branch}': {detail}")]
    PublishRejected { branch: String, detail: String },

    /// The remote tip kept moving; the bounded retry budget was exhausted.
    #[error("publish conflict: remote tip moved {attempts} times, giving up")]
    PublishConflict { attempts: u32 },

    /// Re-applying the change set during conflict retry failed.
    #[error(transparent)]
    Mutate(#[from] MutateError),

    /// Underlying git failure.
    #[error(transparent)]
    Git(#[from] GitError),
}

// ---------------------------------------------------------------------------
// Configuration errors
// ---------------------------------------------------------------------------

/// Errors from configuration loading and validation.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Config file not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parse error.
    #[error("configuration parse error: {0}")]
    ParseError(String),

    /// A config value is invalid.
    #[error("invalid configuration value for '{field}': {detail}")]
    InvalidValue { field: String, detail: String },

    /// Generic I/O error reading the config file.
    #[error("configuration I/O error: {0}")]
    IoError(#[from] std::io::Error),
}
