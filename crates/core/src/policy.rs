//! Version policies: which tags a reference may move to, and how "newest"
//! is decided.
//!
//! Rules are configured per repository-name glob pattern and evaluated in
//! order; the first match wins. A reference whose repository matches no
//! rule is left alone (no-op policy).
//!
//! The comparison predicate is deliberately pluggable per rule:
//!
//! | Selector | Accepts | Ordering |
//! |----------|---------|----------|
//! | `semver` | tags parsing as semver inside the range | semver precedence |
//! | `tag`    | exactly the named floating tag | identity |
//! | `filter` | tags matching a regular expression | natural (alphanumeric) |

use regex_lite::Regex;
use semver::{Version, VersionReq};
use tracing::debug;

use crate::config::{Pinning, PolicyRuleConfig};
use crate::errors::ConfigError;

// ---------------------------------------------------------------------------
// Selector
// ---------------------------------------------------------------------------

/// The tag acceptance predicate and ordering for one policy rule.
#[derive(Debug, Clone)]
pub enum VersionSelector {
    /// Accept semver tags within a range, newest by semver precedence.
    Semver(VersionReq),
    /// Accept exactly one floating tag, re-resolved to its digest each pass.
    Floating(String),
    /// Accept tags matching a regular expression, newest by natural order.
    Filter(Regex),
}

impl VersionSelector {
    /// Whether `tag` is eligible under this selector.
    pub fn accepts(&self, tag: &str) -> bool {
        match self {
            Self::Semver(req) => parse_semver_tag(tag).map_or(false, |v| req.matches(&v)),
            Self::Floating(name) => tag == name,
            Self::Filter(re) => re.is_match(tag),
        }
    }

    /// Select the newest eligible tag, or `None` when nothing matches.
    pub fn select_newest<'a, I>(&self, tags: I) -> Option<String>
    where
        I: IntoIterator<Item = &'a str>,
    {
        match self {
            Self::Semver(req) => tags
                .into_iter()
                .filter_map(|t| parse_semver_tag(t).map(|v| (v, t)))
                .filter(|(v, _)| req.matches(v))
                .max_by(|(a, _), (b, _)| a.cmp(b))
                .map(|(_, t)| t.to_string()),
            Self::Floating(name) => tags
                .into_iter()
                .find(|t| *t == name)
                .map(str::to_string),
            Self::Filter(re) => tags
                .into_iter()
                .filter(|t| re.is_match(t))
                .max_by(|a, b| alphanumeric_sort::compare_str(a, b))
                .map(str::to_string),
        }
    }
}

impl std::fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Semver(req) => write!(f, "semver {}", req),
            Self::Floating(name) => write!(f, "floating tag '{}'", name),
            Self::Filter(re) => write!(f, "filter /{}/", re.as_str()),
        }
    }
}

/// Parse a tag as a semantic version, tolerating a leading `v`.
fn parse_semver_tag(tag: &str) -> Option<Version> {
    Version::parse(tag.strip_prefix('v').unwrap_or(tag)).ok()
}

// ---------------------------------------------------------------------------
// Policy & rules
// ---------------------------------------------------------------------------

/// The pinning mode and selector applied to one reference.
#[derive(Debug, Clone)]
pub struct VersionPolicy {
    pub pinning: Pinning,
    pub selector: VersionSelector,
}

impl std::fmt::Display for VersionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pin = match self.pinning {
            Pinning::Tag => "tag",
            Pinning::Digest => "digest",
        };
        write!(f, "{} pinning, {}", pin, self.selector)
    }
}

/// One compiled rule: a repository-name glob plus the policy it applies.
#[derive(Debug, Clone)]
pub struct PolicyRule {
    /// Glob pattern matched against the full repository name. Also serves
    /// as the rule's identity in the per-pass resolution cache.
    pub pattern: String,
    pub policy: VersionPolicy,
}

/// An ordered set of compiled policy rules.
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    rules: Vec<PolicyRule>,
}

impl PolicySet {
    /// Compile the configured rules, validating ranges and expressions.
    pub fn from_config(rules: &[PolicyRuleConfig]) -> Result<Self, ConfigError> {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            let selector = match (&rule.semver, &rule.tag, &rule.filter) {
                (Some(range), None, None) => {
                    let req = VersionReq::parse(range).map_err(|e| ConfigError::InvalidValue {
                        field: format!("policies.{}.semver", rule.pattern),
                        detail: e.to_string(),
                    })?;
                    VersionSelector::Semver(req)
                }
                (None, Some(tag), None) => VersionSelector::Floating(tag.clone()),
                (None, None, Some(filter)) => {
                    let re = Regex::new(filter).map_err(|e| ConfigError::InvalidValue {
                        field: format!("policies.{}.filter", rule.pattern),
                        detail: e.to_string(),
                    })?;
                    VersionSelector::Filter(re)
                }
                _ => {
                    return Err(ConfigError::InvalidValue {
                        field: format!("policies.{}", rule.pattern),
                        detail: "exactly one of 'semver', 'tag', or 'filter' must be set"
                            .into(),
                    })
                }
            };
            compiled.push(PolicyRule {
                pattern: rule.pattern.clone(),
                policy: VersionPolicy {
                    pinning: rule.pinning,
                    selector,
                },
            });
        }
        Ok(Self { rules: compiled })
    }

    /// Find the first rule whose pattern matches `repository`.
    pub fn rule_for(&self, repository: &str) -> Option<&PolicyRule> {
        let rule = self
            .rules
            .iter()
            .find(|r| glob_match::glob_match(&r.pattern, repository));
        if rule.is_none() {
            debug!(repository, "no policy rule matches, skipping");
        }
        rule
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rule(pattern: &str, pinning: Pinning, selector: VersionSelector) -> PolicyRule {
        PolicyRule {
            pattern: pattern.into(),
            policy: VersionPolicy { pinning, selector },
        }
    }

    fn semver_selector(range: &str) -> VersionSelector {
        VersionSelector::Semver(VersionReq::parse(range).unwrap())
    }

    #[test]
    fn test_semver_selects_newest_in_range() {
        let sel = semver_selector("^1.2.0");
        let tags = ["1.2.0", "1.3.0", "2.0.0"];
        assert_eq!(sel.select_newest(tags).as_deref(), Some("1.3.0"));
    }

    #[test]
    fn test_semver_tolerates_v_prefix_and_junk() {
        let sel = semver_selector(">=1.0.0");
        let tags = ["v1.4.0", "latest", "1.2.0", "nightly-2024"];
        assert_eq!(sel.select_newest(tags).as_deref(), Some("v1.4.0"));
    }

    #[test]
    fn test_semver_no_match() {
        let sel = semver_selector("^3");
        assert_eq!(sel.select_newest(["1.0.0", "2.0.0"]), None);
    }

    #[test]
    fn test_floating_identity() {
        let sel = VersionSelector::Floating("latest".into());
        assert!(sel.accepts("latest"));
        assert!(!sel.accepts("1.2.0"));
        assert_eq!(
            sel.select_newest(["1.2.0", "latest", "stable"]).as_deref(),
            Some("latest")
        );
        assert_eq!(sel.select_newest(["1.2.0", "stable"]), None);
    }

    #[test]
    fn test_filter_natural_ordering() {
        let sel = VersionSelector::Filter(Regex::new("^build-").unwrap());
        // Natural ordering: build-9 < build-10, unlike lexicographic.
        let tags = ["build-9", "build-10", "build-2", "release-99"];
        assert_eq!(sel.select_newest(tags).as_deref(), Some("build-10"));
    }

    #[test]
    fn test_rule_matching_first_wins() {
        let set = PolicySet {
            rules: vec![
                rule("app/*", Pinning::Tag, semver_selector("^1")),
                rule("app/**", Pinning::Digest, VersionSelector::Floating("latest".into())),
            ],
        };
        let matched = set.rule_for("app/base").unwrap();
        assert_eq!(matched.pattern, "app/*");
        assert_eq!(matched.policy.pinning, Pinning::Tag);
    }

    #[test]
    fn test_rule_matching_none() {
        let set = PolicySet {
            rules: vec![rule("app/*", Pinning::Tag, semver_selector("^1"))],
        };
        assert!(set.rule_for("other/thing").is_none());
    }

    #[test]
    fn test_glob_matches_registry_prefixed_names() {
        let set = PolicySet {
            rules: vec![rule(
                "ghcr.io/acme/**",
                Pinning::Digest,
                VersionSelector::Floating("latest".into()),
            )],
        };
        assert!(set.rule_for("ghcr.io/acme/app").is_some());
        assert!(set.rule_for("ghcr.io/other/app").is_none());
    }

    #[test]
    fn test_from_config_compiles() {
        let rules = vec![
            PolicyRuleConfig {
                pattern: "app/*".into(),
                pinning: Pinning::Tag,
                semver: Some("^1.2.0".into()),
                tag: None,
                filter: None,
            },
            PolicyRuleConfig {
                pattern: "infra/**".into(),
                pinning: Pinning::Digest,
                semver: None,
                tag: Some("latest".into()),
                filter: None,
            },
        ];
        let set = PolicySet::from_config(&rules).unwrap();
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_from_config_rejects_bad_range() {
        let rules = vec![PolicyRuleConfig {
            pattern: "app/*".into(),
            pinning: Pinning::Tag,
            semver: Some("not a range".into()),
            tag: None,
            filter: None,
        }];
        assert!(matches!(
            PolicySet::from_config(&rules),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_from_config_rejects_no_selector() {
        let rules = vec![PolicyRuleConfig {
            pattern: "app/*".into(),
            pinning: Pinning::Tag,
            semver: None,
            tag: None,
            filter: None,
        }];
        assert!(PolicySet::from_config(&rules).is_err());
    }
}
