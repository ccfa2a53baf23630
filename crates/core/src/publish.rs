//! Publishing: push the update commit to the remote branch.
//!
//! The publisher is an explicit finite state machine,
//! `Idle -> Authenticating -> Pushing -> {Succeeded, ConflictRetry,
//! Failed}`, driven by one loop so the retry bound is visible in the
//! transitions rather than hidden in recursion. A non-fast-forward
//! rejection refetches the remote tip, rebuilds the commit by re-applying
//! the original change set against the refreshed tree, and pushes again,
//! at most `max_attempts` times. Authentication failures and any other
//! rejection are terminal.

use tracing::{info, instrument, warn};

use crate::errors::{GitError, PublishError};
use crate::git::{GitClient, SshAuth};
use crate::mutate::{self, CommitDescriptor, CommitIdentity};
use crate::plan::ChangeSet;

// ---------------------------------------------------------------------------
// States
// ---------------------------------------------------------------------------

/// States of one publish run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishState {
    Idle,
    Authenticating,
    Pushing { attempt: u32 },
    ConflictRetry { attempt: u32 },
    Succeeded,
    Failed,
}

impl std::fmt::Display for PublishState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Authenticating => write!(f, "authenticating"),
            Self::Pushing { attempt } => write!(f, "pushing (attempt {})", attempt),
            Self::ConflictRetry { attempt } => write!(f, "conflict_retry (attempt {})", attempt),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// A successfully published commit.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    pub descriptor: CommitDescriptor,
    /// Push attempts used (1 = no conflict encountered).
    pub attempts: u32,
}

// ---------------------------------------------------------------------------
// Publisher
// ---------------------------------------------------------------------------

/// Pushes commits with a bounded conflict-retry budget.
pub struct Publisher {
    max_attempts: u32,
}

impl Publisher {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }

    /// Publish `descriptor` onto `branch`.
    ///
    /// On a non-fast-forward rejection the original `changeset` is
    /// re-applied against the refreshed remote tip (building a new commit)
    /// and the push retried. If upstream rewrote one of the referenced
    /// spans in the meantime, the re-apply fails and surfaces as a
    /// [`PublishError::Mutate`].
    #[instrument(skip_all, fields(branch, commit = %descriptor.commit_id))]
    pub fn publish(
        &self,
        git: &GitClient,
        changeset: &ChangeSet,
        mut descriptor: CommitDescriptor,
        identity: &CommitIdentity,
        branch: &str,
        auth: Option<&SshAuth>,
    ) -> Result<PublishOutcome, PublishError> {
        let mut attempts = 0u32;
        let mut state = PublishState::Authenticating;

        loop {
            state = match state {
                PublishState::Authenticating => {
                    if let Some(auth) = auth {
                        auth.validate()
                            .map_err(|e| PublishError::AuthenticationFailed(e.to_string()))?;
                    }
                    PublishState::Pushing { attempt: 1 }
                }

                PublishState::Pushing { attempt } => {
                    attempts = attempt;
                    match git.push(branch, auth) {
                        Ok(()) => PublishState::Succeeded,
                        Err(e) if is_non_fast_forward(&e) => {
                            warn!(attempt, error = %e, "push rejected: remote tip moved");
                            if attempt >= self.max_attempts {
                                return Err(PublishError::PublishConflict { attempts: attempt });
                            }
                            PublishState::ConflictRetry { attempt }
                        }
                        Err(e) if is_authentication(&e) => {
                            return Err(PublishError::AuthenticationFailed(e.to_string()));
                        }
                        Err(GitError::PushRejected { branch, detail }) => {
                            return Err(PublishError::PublishRejected { branch, detail });
                        }
                        Err(e) => return Err(PublishError::Git(e)),
                    }
                }

                PublishState::ConflictRetry { attempt } => {
                    let tip = git.fetch_branch(branch, auth)?;
                    git.reset_hard(tip)?;
                    descriptor = mutate::apply(git, changeset, tip, identity, branch)?;
                    PublishState::Pushing {
                        attempt: attempt + 1,
                    }
                }

                PublishState::Succeeded => {
                    info!(commit = %descriptor.commit_id, attempts, "publish succeeded");
                    return Ok(PublishOutcome {
                        descriptor,
                        attempts,
                    });
                }

                // Idle is the pre-publish state and Failed is expressed by
                // the returned error; neither is re-entered by the loop.
                PublishState::Idle | PublishState::Failed => unreachable!(),
            };
        }
    }
}

// ---------------------------------------------------------------------------
// Rejection classification
// ---------------------------------------------------------------------------

/// Whether a push failure means the remote tip moved under us.
fn is_non_fast_forward(err: &GitError) -> bool {
    match err {
        GitError::Git2Error(e) => {
            e.code() == git2::ErrorCode::NotFastForward
                || e.message().contains("non-fast-forward")
        }
        GitError::PushRejected { detail, .. } => {
            let detail = detail.to_ascii_lowercase();
            detail.contains("non-fast-forward")
                || detail.contains("fetch first")
                || detail.contains("cannot lock ref")
        }
        _ => false,
    }
}

/// Whether a push failure is an authentication problem.
fn is_authentication(err: &GitError) -> bool {
    match err {
        GitError::Git2Error(e) => {
            e.class() == git2::ErrorClass::Ssh || e.code() == git2::ErrorCode::Auth
        }
        GitError::HostKeyMismatch { .. } => true,
        _ => false,
    }
}
