//! In-memory and on-disk fixtures shared by unit tests.

use std::collections::HashMap;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use git2::{Repository, Signature};

use crate::errors::RegistryError;
use crate::registry::TagSource;

/// In-memory registry fixture counting the queries it serves.
pub(crate) struct FakeRegistry {
    tags: HashMap<String, Vec<String>>,
    digests: HashMap<(String, String), String>,
    pub list_calls: AtomicUsize,
    pub digest_calls: AtomicUsize,
    pub unavailable: bool,
}

impl FakeRegistry {
    pub fn new() -> Self {
        Self {
            tags: HashMap::new(),
            digests: HashMap::new(),
            list_calls: AtomicUsize::new(0),
            digest_calls: AtomicUsize::new(0),
            unavailable: false,
        }
    }

    /// Seed a repository with `(tag, digest)` pairs.
    pub fn with_repo(mut self, repository: &str, tags: &[(&str, &str)]) -> Self {
        self.tags.insert(
            repository.to_string(),
            tags.iter().map(|(t, _)| t.to_string()).collect(),
        );
        for (tag, digest) in tags {
            self.digests
                .insert((repository.to_string(), tag.to_string()), digest.to_string());
        }
        self
    }
}

impl TagSource for FakeRegistry {
    async fn list_tags(&self, repository: &str) -> Result<Vec<String>, RegistryError> {
        self.list_calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable {
            return Err(RegistryError::Unavailable {
                repository: repository.to_string(),
                detail: "fixture down".into(),
            });
        }
        self.tags
            .get(repository)
            .cloned()
            .ok_or_else(|| RegistryError::NoMatchingVersion {
                repository: repository.to_string(),
                detail: "not found on registry".into(),
            })
    }

    async fn manifest_digest(&self, repository: &str, tag: &str) -> Result<String, RegistryError> {
        self.digest_calls.fetch_add(1, Ordering::SeqCst);
        self.digests
            .get(&(repository.to_string(), tag.to_string()))
            .cloned()
            .ok_or_else(|| RegistryError::NoMatchingVersion {
                repository: repository.to_string(),
                detail: format!("tag '{}' has no manifest", tag),
            })
    }
}

// ---------------------------------------------------------------------------
// Git fixtures
// ---------------------------------------------------------------------------

/// A bare "remote" seeded with the given files on `main`. Returns the
/// tempdir guard and the remote URL (a local path).
pub(crate) fn bare_remote_with_files(files: &[(&str, &str)]) -> (tempfile::TempDir, String) {
    let remote_dir = tempfile::tempdir().unwrap();
    Repository::init_bare(remote_dir.path()).unwrap();
    let url = remote_dir.path().to_str().unwrap().to_string();
    commit_to_remote(&url, files, "seed");
    (remote_dir, url)
}

/// Commit `files` on top of the remote's current `main` tip (if any) and
/// push. Used to seed remotes and to advance them mid-test.
pub(crate) fn commit_to_remote(url: &str, files: &[(&str, &str)], message: &str) {
    let work = tempfile::tempdir().unwrap();
    let repo = Repository::init(work.path()).unwrap();

    let parent = {
        let mut remote = repo.remote("origin", url).unwrap();
        let _ = remote.fetch(&["main"], None, None);
        repo.find_reference("FETCH_HEAD")
            .ok()
            .and_then(|r| r.peel_to_commit().ok())
    };
    if let Some(ref base) = parent {
        repo.reference("refs/heads/main", base.id(), true, "base").unwrap();
        repo.set_head("refs/heads/main").unwrap();
        repo.checkout_head(Some(git2::build::CheckoutBuilder::new().force()))
            .unwrap();
    }

    for (path, content) in files {
        let full = work.path().join(path);
        if let Some(dir) = full.parent() {
            std::fs::create_dir_all(dir).unwrap();
        }
        std::fs::write(full, content).unwrap();
    }

    let mut index = repo.index().unwrap();
    index
        .add_all(["*"], git2::IndexAddOption::DEFAULT, None)
        .unwrap();
    index.write().unwrap();
    let tree = repo.find_tree(index.write_tree().unwrap()).unwrap();
    let sig = Signature::now("Fixture", "fixture@test").unwrap();
    let parents: Vec<&git2::Commit> = parent.iter().collect();
    let oid = repo
        .commit(Some("HEAD"), &sig, &sig, message, &tree, &parents)
        .unwrap();
    repo.reference("refs/heads/main", oid, true, "fixture").unwrap();

    let mut remote = repo.find_remote("origin").unwrap();
    remote
        .push(&["refs/heads/main:refs/heads/main"], None)
        .unwrap();
}
