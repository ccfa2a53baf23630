//! Per-pass resolution of `(repository, policy)` pairs to candidates.
//!
//! The [`Resolver`] wraps a [`TagSource`] with a cache that lives for one
//! pass. Cache entries are single-flight: two workers resolving the same
//! key concurrently share one registry query. Terminal outcomes (a
//! resolved candidate, or no matching version) are cached; transient
//! failures are not, so a later reference may retry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, instrument};

use crate::errors::RegistryError;
use crate::policy::{PolicyRule, VersionPolicy};
use crate::registry::TagSource;

/// The newest tag/digest pair a repository resolves to under one policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCandidate {
    pub repository: String,
    pub tag: String,
    pub digest: String,
}

/// A cached, terminal resolution outcome.
#[derive(Debug, Clone)]
pub enum Resolution {
    Resolved(ResolvedCandidate),
    /// No tag satisfied the policy this pass. Terminal for every reference
    /// sharing the key, so it is cached too.
    NoMatch(String),
}

/// Policy-driven resolution with a per-pass, single-flight cache.
pub struct Resolver<S> {
    source: Arc<S>,
    cache: Mutex<HashMap<String, Arc<OnceCell<Resolution>>>>,
}

impl<S: TagSource> Resolver<S> {
    /// Create a resolver for one pass. Drop it when the pass ends; the
    /// cache must not outlive the pass (floating tags move).
    pub fn new(source: Arc<S>) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve `repository` under `rule`, deduplicating queries across the
    /// pass. Transient registry failures surface as
    /// [`RegistryError::Unavailable`] after the client's retry budget.
    #[instrument(skip(self, rule), fields(pattern = %rule.pattern))]
    pub async fn resolve(
        &self,
        repository: &str,
        rule: &PolicyRule,
    ) -> Result<Resolution, RegistryError> {
        let key = format!("{}|{}", repository, rule.pattern);
        let cell = {
            let mut cache = self.cache.lock().await;
            cache.entry(key).or_default().clone()
        };

        let resolution = cell
            .get_or_try_init(|| async {
                match self.resolve_uncached(repository, &rule.policy).await {
                    Ok(candidate) => Ok(Resolution::Resolved(candidate)),
                    Err(RegistryError::NoMatchingVersion { detail, .. }) => {
                        Ok(Resolution::NoMatch(detail))
                    }
                    Err(e) => Err(e),
                }
            })
            .await?;

        Ok(resolution.clone())
    }

    async fn resolve_uncached(
        &self,
        repository: &str,
        policy: &VersionPolicy,
    ) -> Result<ResolvedCandidate, RegistryError> {
        let tags = self.source.list_tags(repository).await?;

        let selected = policy.selector.select_newest(tags.iter().map(String::as_str));
        let Some(tag) = selected else {
            return Err(RegistryError::NoMatchingVersion {
                repository: repository.to_string(),
                detail: format!("0 of {} tags accepted by {}", tags.len(), policy.selector),
            });
        };

        let digest = self.source.manifest_digest(repository, &tag).await?;
        debug!(repository, tag = %tag, digest = %digest, "resolved candidate");

        Ok(ResolvedCandidate {
            repository: repository.to_string(),
            tag,
            digest,
        })
    }
}
