//! Update planning: compare resolved candidates against current values
//! and produce a deterministic, ordered change set.
//!
//! The planner is pure aside from calls through the resolver; repeated
//! `(repository, policy)` pairs hit the resolver's per-pass cache, so the
//! registry is queried at most once per pair per pass. Per-reference
//! problems (no matching version, policy mismatch) are reported as plan
//! warnings; only a registry failure aborts the repository's plan.

use serde::Serialize;
use tracing::{debug, info};

use crate::config::Pinning;
use crate::errors::PlanError;
use crate::policy::PolicySet;
use crate::reference::ImageReference;
use crate::registry::TagSource;
use crate::resolve::{ResolvedCandidate, Resolution, Resolver};

// ---------------------------------------------------------------------------
// Change set
// ---------------------------------------------------------------------------

/// One planned update: a reference and the candidate it moves to.
#[derive(Debug, Clone)]
pub struct Change {
    pub reference: ImageReference,
    pub candidate: ResolvedCandidate,
    /// Pinning mode of the matched policy; decides both the comparison
    /// rule and how the replacement token is rendered.
    pub pinning: Pinning,
}

impl Change {
    /// The value shown as the "old" side in messages.
    pub fn old_value(&self) -> &str {
        match self.pinning {
            Pinning::Tag => self.reference.current_tag.as_deref().unwrap_or("none"),
            Pinning::Digest => self.reference.current_value(),
        }
    }

    /// The value shown as the "new" side in messages.
    pub fn new_value(&self) -> &str {
        match self.pinning {
            Pinning::Tag => &self.candidate.tag,
            Pinning::Digest => &self.candidate.digest,
        }
    }
}

/// An ordered sequence of changes for one pass over one repository.
///
/// Ordering is `(source file, span start)`, so diffs and commit messages
/// are reproducible.
#[derive(Debug, Clone, Default)]
pub struct ChangeSet {
    changes: Vec<Change>,
}

impl ChangeSet {
    /// Build a change set from pre-computed changes, restoring the
    /// deterministic ordering.
    pub fn from_changes(mut changes: Vec<Change>) -> Self {
        changes.sort_by(|a, b| a.reference.cmp(&b.reference));
        Self { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.changes.iter()
    }

    /// Commit message enumerating every updated repository `old -> new`.
    pub fn commit_message(&self) -> String {
        let mut lines: Vec<String> = Vec::new();
        for change in &self.changes {
            let line = format!(
                "{} {} -> {}",
                change.candidate.repository,
                change.old_value(),
                change.new_value()
            );
            if !lines.contains(&line) {
                lines.push(line);
            }
        }
        match lines.len() {
            0 => String::new(),
            1 => format!("Update {}", lines[0]),
            n => format!("Update {} container images\n\n{}\n", n, lines.join("\n")),
        }
    }
}

/// A reference skipped during planning, with the reason.
#[derive(Debug, Clone, Serialize)]
pub struct PlanWarning {
    pub reference: String,
    pub detail: String,
}

/// The outcome of planning one repository.
#[derive(Debug, Default)]
pub struct Plan {
    pub changes: ChangeSet,
    pub skipped: Vec<PlanWarning>,
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// Plan updates for the given references.
///
/// References with no matching policy rule are left alone. A reference is
/// emitted as a [`Change`] only when the candidate genuinely differs from
/// the current value under the policy's comparison rule.
pub async fn plan<S: TagSource>(
    references: &[ImageReference],
    policies: &PolicySet,
    resolver: &Resolver<S>,
) -> Result<Plan, PlanError> {
    let mut out = Plan::default();

    for reference in references {
        let Some(rule) = policies.rule_for(&reference.repository) else {
            continue;
        };

        if rule.policy.pinning == Pinning::Tag && reference.current_digest.is_some() {
            out.skipped.push(PlanWarning {
                reference: reference.to_string(),
                detail: "reference pins a digest but the matched policy is tag-based".into(),
            });
            continue;
        }

        let candidate = match resolver.resolve(&reference.repository, rule).await? {
            Resolution::Resolved(c) => c,
            Resolution::NoMatch(detail) => {
                out.skipped.push(PlanWarning {
                    reference: reference.to_string(),
                    detail,
                });
                continue;
            }
        };

        if differs(reference, &candidate, rule.policy.pinning) {
            debug!(
                reference = %reference,
                tag = %candidate.tag,
                digest = %candidate.digest,
                "planned update"
            );
            out.changes.changes.push(Change {
                reference: reference.clone(),
                candidate,
                pinning: rule.policy.pinning,
            });
        }
    }

    out.changes
        .changes
        .sort_by(|a, b| a.reference.cmp(&b.reference));
    info!(
        changes = out.changes.len(),
        skipped = out.skipped.len(),
        "planning completed"
    );
    Ok(out)
}

/// The policy's comparison rule: digest equality under digest pinning,
/// tag equality otherwise. A digest-pinned reference whose digest is
/// unchanged produces no change even if the tag string moved upstream.
fn differs(reference: &ImageReference, candidate: &ResolvedCandidate, pinning: Pinning) -> bool {
    match pinning {
        Pinning::Tag => reference.current_tag.as_deref() != Some(candidate.tag.as_str()),
        Pinning::Digest => reference.current_digest.as_deref() != Some(candidate.digest.as_str()),
    }
}
