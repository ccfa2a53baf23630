//! Working-tree mutation: apply a change set as span-validated textual
//! edits, stage the touched files, and build a single commit.
//!
//! Each edit replaces exactly the byte range the reference was extracted
//! from, after checking that the range still holds the original token.
//! Validation of every edit happens before any file is written, so a
//! failing change set leaves the tree untouched. Tag and digest are
//! rewritten together in the one edit, never separately.

use std::collections::BTreeMap;
use std::path::PathBuf;

use git2::Oid;
use tracing::{debug, info, instrument};

use crate::config::Pinning;
use crate::errors::MutateError;
use crate::git::GitClient;
use crate::plan::{Change, ChangeSet};
use crate::reference::{render_reference, Span};

// ---------------------------------------------------------------------------
// Edits
// ---------------------------------------------------------------------------

/// One structured `(span, replacement)` operation against a file.
#[derive(Debug, Clone)]
pub struct Edit {
    pub file: PathBuf,
    pub span: Span,
    /// The token the span is expected to hold.
    pub original: String,
    pub replacement: String,
}

impl Edit {
    /// Render the edit for a planned change.
    pub fn for_change(change: &Change) -> Self {
        let reference = &change.reference;
        let candidate = &change.candidate;
        let replacement = match change.pinning {
            // The planner refuses digest-carrying references under tag
            // pinning, so a tag edit never silently drops a digest.
            Pinning::Tag => render_reference(&reference.repository, Some(&candidate.tag), None),
            Pinning::Digest => {
                // Preserve the reference's shape: keep a tag only if the
                // original carried one.
                let tag = reference.current_tag.as_ref().map(|_| candidate.tag.as_str());
                render_reference(&reference.repository, tag, Some(&candidate.digest))
            }
        };
        Self {
            file: reference.source_file.clone(),
            span: reference.span,
            original: reference.render(),
            replacement,
        }
    }
}

// ---------------------------------------------------------------------------
// Commit descriptor
// ---------------------------------------------------------------------------

/// Author identity for the generated commit.
#[derive(Debug, Clone)]
pub struct CommitIdentity {
    pub name: String,
    pub email: String,
}

/// The commit built from a change set.
///
/// Valid only while `parent_id` is the tip of the target branch; if the
/// remote moves, the descriptor is stale and must be rebuilt by
/// re-applying the change set against the refreshed tree.
#[derive(Debug, Clone)]
pub struct CommitDescriptor {
    pub commit_id: String,
    pub parent_id: String,
    pub branch: String,
    pub message: String,
    pub changed_files: Vec<PathBuf>,
}

// ---------------------------------------------------------------------------
// Apply
// ---------------------------------------------------------------------------

/// Apply `changeset` to the working tree and build one commit on top of
/// `expected_tip`.
///
/// Fails with [`MutateError::ConcurrentModification`] when the tree's tip
/// has advanced since planning, [`MutateError::EditConflict`] when two
/// edits overlap, and [`MutateError::SpanValidation`] when a span no
/// longer holds the extracted token. All validation runs before any write.
#[instrument(skip_all, fields(changes = changeset.len(), branch))]
pub fn apply(
    git: &GitClient,
    changeset: &ChangeSet,
    expected_tip: Oid,
    identity: &CommitIdentity,
    branch: &str,
) -> Result<CommitDescriptor, MutateError> {
    let actual = git.head_oid()?;
    if actual != expected_tip {
        return Err(MutateError::ConcurrentModification {
            expected: expected_tip.to_string(),
            actual: actual.to_string(),
        });
    }

    // Group edits per file, ordered by span.
    let mut per_file: BTreeMap<PathBuf, Vec<Edit>> = BTreeMap::new();
    for change in changeset.iter() {
        let edit = Edit::for_change(change);
        per_file.entry(edit.file.clone()).or_default().push(edit);
    }

    // Validate everything up front, producing the new contents in memory.
    let mut rewritten: Vec<(PathBuf, String)> = Vec::with_capacity(per_file.len());
    for (file, mut edits) in per_file {
        edits.sort_by_key(|e| e.span.start);
        for pair in edits.windows(2) {
            if pair[0].span.overlaps(&pair[1].span) {
                return Err(MutateError::EditConflict {
                    file: file.clone(),
                    first_start: pair[0].span.start,
                    second_start: pair[1].span.start,
                });
            }
        }

        let full_path = git.repo_path().join(&file);
        let mut content = std::fs::read_to_string(&full_path)?;
        for edit in &edits {
            let found = content
                .get(edit.span.start..edit.span.end)
                .unwrap_or("<out of range>");
            if found != edit.original {
                return Err(MutateError::SpanValidation {
                    file: file.clone(),
                    expected: edit.original.clone(),
                    found: found.to_string(),
                });
            }
        }

        // Apply back to front so earlier spans stay valid.
        for edit in edits.iter().rev() {
            content.replace_range(edit.span.start..edit.span.end, &edit.replacement);
            debug!(
                file = %file.display(),
                old = %edit.original,
                new = %edit.replacement,
                "edit applied"
            );
        }
        rewritten.push((file, content));
    }

    // Only now touch the tree.
    let changed_files: Vec<PathBuf> = rewritten.iter().map(|(f, _)| f.clone()).collect();
    for (file, content) in &rewritten {
        std::fs::write(git.repo_path().join(file), content)?;
    }
    git.stage(&changed_files)?;

    let message = changeset.commit_message();
    let commit_id = git.commit_staged(&message, &identity.name, &identity.email, expected_tip)?;
    info!(
        commit = %commit_id,
        files = changed_files.len(),
        "built update commit"
    );

    Ok(CommitDescriptor {
        commit_id: commit_id.to_string(),
        parent_id: expected_tip.to_string(),
        branch: branch.to_string(),
        message,
        changed_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::extract::extract;
    use crate::resolve::ResolvedCandidate;
    use crate::testutil::bare_remote_with_files;

    const DIGEST_A: &str =
        "sha256:aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa";
    const DIGEST_B: &str =
        "sha256:bbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb";

    fn identity() -> CommitIdentity {
        CommitIdentity {
            name: "imagesync".into(),
            email: "imagesync@test".into(),
        }
    }

    /// Extract references from the working tree and pair each with a
    /// candidate produced by `f`.
    fn changes_from_tree(
        workdir: &std::path::Path,
        pinning: Pinning,
        f: impl Fn(&str) -> ResolvedCandidate,
    ) -> ChangeSet {
        let extraction = extract(workdir);
        let changes = extraction
            .references
            .into_iter()
            .map(|r| {
                let candidate = f(&r.repository);
                Change {
                    reference: r,
                    candidate,
                    pinning,
                }
            })
            .collect();
        ChangeSet::from_changes(changes)
    }

    fn candidate(repository: &str, tag: &str, digest: &str) -> ResolvedCandidate {
        ResolvedCandidate {
            repository: repository.to_string(),
            tag: tag.to_string(),
            digest: digest.to_string(),
        }
    }

    #[test]
    fn test_apply_rewrites_commits_and_preserves_syntax() {
        let dockerfile = "# build\nFROM --platform=linux/amd64 app/base:1.2.0 AS runtime\n";
        let (_remote, url) = bare_remote_with_files(&[("Dockerfile", dockerfile)]);
        let work = tempfile::tempdir().unwrap();
        let git = GitClient::clone_or_reset(&url, work.path(), "main", None).unwrap();
        let tip = git.head_oid().unwrap();

        let changeset = changes_from_tree(work.path(), Pinning::Tag, |repo| {
            candidate(repo, "1.3.0", DIGEST_B)
        });
        let descriptor = apply(&git, &changeset, tip, &identity(), "main").unwrap();

        let updated = std::fs::read_to_string(work.path().join("Dockerfile")).unwrap();
        assert_eq!(
            updated,
            "# build\nFROM --platform=linux/amd64 app/base:1.3.0 AS runtime\n"
        );
        assert_eq!(descriptor.parent_id, tip.to_string());
        assert_eq!(descriptor.message, "Update app/base 1.2.0 -> 1.3.0");
        assert_eq!(git.head_oid().unwrap().to_string(), descriptor.commit_id);
    }

    #[test]
    fn test_apply_multiple_edits_in_one_file() {
        let yaml = "image: app/base:1.0.0\nother: x\nimage: app/web:2.0.0\n";
        let (_remote, url) = bare_remote_with_files(&[("deploy.yaml", yaml)]);
        let work = tempfile::tempdir().unwrap();
        let git = GitClient::clone_or_reset(&url, work.path(), "main", None).unwrap();
        let tip = git.head_oid().unwrap();

        let changeset = changes_from_tree(work.path(), Pinning::Tag, |repo| match repo {
            "app/base" => candidate(repo, "1.1.0", DIGEST_A),
            _ => candidate(repo, "2.5.0", DIGEST_B),
        });
        apply(&git, &changeset, tip, &identity(), "main").unwrap();

        let updated = std::fs::read_to_string(work.path().join("deploy.yaml")).unwrap();
        assert_eq!(updated, "image: app/base:1.1.0\nother: x\nimage: app/web:2.5.0\n");
    }

    #[test]
    fn test_digest_pinning_rewrites_tag_and_digest_atomically() {
        let yaml = format!("image: app/base:1.0.0@{}\n", DIGEST_A);
        let (_remote, url) = bare_remote_with_files(&[("deploy.yaml", &yaml)]);
        let work = tempfile::tempdir().unwrap();
        let git = GitClient::clone_or_reset(&url, work.path(), "main", None).unwrap();
        let tip = git.head_oid().unwrap();

        let changeset = changes_from_tree(work.path(), Pinning::Digest, |repo| {
            candidate(repo, "1.4.0", DIGEST_B)
        });
        apply(&git, &changeset, tip, &identity(), "main").unwrap();

        let updated = std::fs::read_to_string(work.path().join("deploy.yaml")).unwrap();
        assert_eq!(updated, format!("image: app/base:1.4.0@{}\n", DIGEST_B));
    }

    #[test]
    fn test_stale_tip_is_concurrent_modification() {
        let (_remote, url) = bare_remote_with_files(&[("Dockerfile", "FROM app/base:1.0.0\n")]);
        let work = tempfile::tempdir().unwrap();
        let git = GitClient::clone_or_reset(&url, work.path(), "main", None).unwrap();
        let tip = git.head_oid().unwrap();

        let changeset = changes_from_tree(work.path(), Pinning::Tag, |repo| {
            candidate(repo, "1.1.0", DIGEST_A)
        });

        // Advance the local tree past the planned tip.
        std::fs::write(work.path().join("unrelated.txt"), "x").unwrap();
        git.stage(&[PathBuf::from("unrelated.txt")]).unwrap();
        git.commit_staged("unrelated", "T", "t@t", tip).unwrap();

        let err = apply(&git, &changeset, tip, &identity(), "main").unwrap_err();
        assert!(matches!(err, MutateError::ConcurrentModification { .. }));
    }

    #[test]
    fn test_failed_validation_leaves_tree_untouched() {
        let yaml = "image: app/base:1.0.0\nimage: app/web:2.0.0\n";
        let (_remote, url) = bare_remote_with_files(&[("deploy.yaml", yaml)]);
        let work = tempfile::tempdir().unwrap();
        let git = GitClient::clone_or_reset(&url, work.path(), "main", None).unwrap();
        let tip = git.head_oid().unwrap();

        let changeset = changes_from_tree(work.path(), Pinning::Tag, |repo| match repo {
            "app/base" => candidate(repo, "1.1.0", DIGEST_A),
            _ => candidate(repo, "2.5.0", DIGEST_B),
        });

        // Rewrite the file after planning: spans no longer hold the tokens.
        let edited = "# someone inserted a line\nimage: app/base:1.0.0\nimage: app/web:2.0.0\n";
        std::fs::write(work.path().join("deploy.yaml"), edited).unwrap();

        let err = apply(&git, &changeset, tip, &identity(), "main").unwrap_err();
        assert!(matches!(err, MutateError::SpanValidation { .. }));
        // No partial write, no commit.
        assert_eq!(
            std::fs::read_to_string(work.path().join("deploy.yaml")).unwrap(),
            edited
        );
        assert_eq!(git.head_oid().unwrap(), tip);
    }

    #[test]
    fn test_overlapping_edits_rejected() {
        let (_remote, url) = bare_remote_with_files(&[("Dockerfile", "FROM app/base:1.0.0\n")]);
        let work = tempfile::tempdir().unwrap();
        let git = GitClient::clone_or_reset(&url, work.path(), "main", None).unwrap();
        let tip = git.head_oid().unwrap();

        let extraction = extract(work.path());
        let reference = extraction.references[0].clone();
        let mut shifted = reference.clone();
        shifted.span = Span::new(reference.span.start + 2, reference.span.end + 2);

        let changeset = ChangeSet::from_changes(vec![
            Change {
                reference,
                candidate: candidate("app/base", "1.1.0", DIGEST_A),
                pinning: Pinning::Tag,
            },
            Change {
                reference: shifted,
                candidate: candidate("app/base", "1.1.0", DIGEST_A),
                pinning: Pinning::Tag,
            },
        ]);

        let err = apply(&git, &changeset, tip, &identity(), "main").unwrap_err();
        assert!(matches!(err, MutateError::EditConflict { .. }));
    }

    #[test]
    fn test_digest_only_reference_stays_digest_only() {
        let reference = crate::reference::ImageReference {
            source_file: PathBuf::from("deploy.yaml"),
            line: 1,
            span: Span::new(7, 7 + 9 + DIGEST_A.len()),
            repository: "app/base".into(),
            current_tag: None,
            current_digest: Some(DIGEST_A.into()),
        };
        let edit = Edit::for_change(&Change {
            reference,
            candidate: candidate("app/base", "1.4.0", DIGEST_B),
            pinning: Pinning::Digest,
        });
        assert_eq!(edit.replacement, format!("app/base@{}", DIGEST_B));
    }
}
