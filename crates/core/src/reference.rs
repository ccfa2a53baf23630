//! Image-reference value types and string parsing.
//!
//! A reference string has the shape `[registry/]repository[:tag][@digest]`,
//! e.g. `ghcr.io/acme/app:1.2.0@sha256:abc…`. The first path segment is
//! treated as a registry host when it contains a dot or a port, matching
//! the convention container runtimes use.

use std::cmp::Ordering;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// A half-open byte range inside a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Whether two spans share at least one byte.
    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// One image reference extracted from a tracked file.
///
/// Immutable once extracted; uniquely identified by `(source_file, span)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageReference {
    /// Path of the file the reference was found in, relative to the
    /// working-tree root.
    pub source_file: PathBuf,
    /// 1-based line number, for diagnostics.
    pub line: usize,
    /// Byte range of the full reference token within the file.
    pub span: Span,
    /// Repository name, including the registry host when one is present.
    pub repository: String,
    /// Current tag, if the reference carries one.
    pub current_tag: Option<String>,
    /// Current digest, if the reference carries one.
    pub current_digest: Option<String>,
}

impl ImageReference {
    /// Render the reference back to its token form.
    pub fn render(&self) -> String {
        render_reference(
            &self.repository,
            self.current_tag.as_deref(),
            self.current_digest.as_deref(),
        )
    }

    /// The current value relevant for display: digest when pinned,
    /// otherwise the tag, otherwise the implicit `latest`.
    pub fn current_value(&self) -> &str {
        self.current_digest
            .as_deref()
            .or(self.current_tag.as_deref())
            .unwrap_or("latest")
    }
}

impl PartialOrd for ImageReference {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ImageReference {
    /// Deterministic ordering: file path first, then position in the file.
    fn cmp(&self, other: &Self) -> Ordering {
        self.source_file
            .cmp(&other.source_file)
            .then(self.span.start.cmp(&other.span.start))
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.render())
    }
}

/// Assemble `repository[:tag][@digest]`.
pub fn render_reference(repository: &str, tag: Option<&str>, digest: Option<&str>) -> String {
    let mut out = repository.to_string();
    if let Some(t) = tag {
        out.push(':');
        out.push_str(t);
    }
    if let Some(d) = digest {
        out.push('@');
        out.push_str(d);
    }
    out
}

/// Parse an image-reference token into `(repository, tag, digest)`.
///
/// Returns `Err(detail)` for tokens that cannot be a valid reference; the
/// extractor converts that into a non-fatal warning.
pub fn parse_reference(token: &str) -> Result<(String, Option<String>, Option<String>), String> {
    if token.is_empty() {
        return Err("empty image reference".into());
    }

    let (name_and_tag, digest) = match token.split_once('@') {
        Some((left, right)) => {
            if right.contains('@') {
                return Err("image reference has more than one digest separator".into());
            }
            if !is_valid_digest(right) {
                return Err(format!("invalid digest '{}'", right));
            }
            (left, Some(right.to_string()))
        }
        None => (token, None),
    };

    // Only a colon after the last slash separates a tag; earlier colons
    // belong to a registry host:port.
    let last_slash = name_and_tag.rfind('/');
    let tag_colon = match name_and_tag.rfind(':') {
        Some(idx) if last_slash.map_or(true, |s| idx > s) => Some(idx),
        _ => None,
    };

    let (repository, tag) = match tag_colon {
        Some(idx) => {
            let (repo, tag) = name_and_tag.split_at(idx);
            (repo.to_string(), Some(tag[1..].to_string()))
        }
        None => (name_and_tag.to_string(), None),
    };

    if repository.is_empty() {
        return Err("image reference has no repository name".into());
    }
    if let Some(ref t) = tag {
        if t.is_empty() || !t.chars().all(is_tag_char) {
            return Err(format!("invalid tag '{}'", t));
        }
    }
    if !repository.chars().all(is_repository_char) {
        return Err(format!("invalid repository name '{}'", repository));
    }

    Ok((repository, tag, digest))
}

/// Split a repository name into `(registry_host, remote_name)`.
///
/// `ghcr.io/acme/app` -> `(Some("ghcr.io"), "acme/app")`;
/// `app/base` -> `(None, "app/base")`. The first segment is a host only
/// when it contains a dot, a colon, or is `localhost`.
pub fn split_registry(repository: &str) -> (Option<&str>, &str) {
    match repository.split_once('/') {
        Some((head, rest))
            if head.contains('.') || head.contains(':') || head == "localhost" =>
        {
            (Some(head), rest)
        }
        _ => (None, repository),
    }
}

fn is_valid_digest(digest: &str) -> bool {
    match digest.split_once(':') {
        Some((algo, hex)) => {
            algo == "sha256"
                && hex.len() == 64
                && hex.chars().all(|c| c.is_ascii_hexdigit())
        }
        None => false,
    }
}

fn is_tag_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_')
}

fn is_repository_char(c: char) -> bool {
    c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '-' | '_' | '/' | ':')
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str =
        "sha256:0000000000000000000000000000000000000000000000000000000000000000";

    #[test]
    fn test_parse_plain_repository() {
        let (repo, tag, digest) = parse_reference("app/base").unwrap();
        assert_eq!(repo, "app/base");
        assert_eq!(tag, None);
        assert_eq!(digest, None);
    }

    #[test]
    fn test_parse_tagged() {
        let (repo, tag, digest) = parse_reference("app/base:1.2.0").unwrap();
        assert_eq!(repo, "app/base");
        assert_eq!(tag.as_deref(), Some("1.2.0"));
        assert_eq!(digest, None);
    }

    #[test]
    fn test_parse_digest_pinned() {
        let token = format!("app/base:1.2.0@{}", DIGEST);
        let (repo, tag, digest) = parse_reference(&token).unwrap();
        assert_eq!(repo, "app/base");
        assert_eq!(tag.as_deref(), Some("1.2.0"));
        assert_eq!(digest.as_deref(), Some(DIGEST));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let (repo, tag, _) = parse_reference("localhost:5000/app/base:1.2.0").unwrap();
        assert_eq!(repo, "localhost:5000/app/base");
        assert_eq!(tag.as_deref(), Some("1.2.0"));

        let (host, name) = split_registry(&repo);
        assert_eq!(host, Some("localhost:5000"));
        assert_eq!(name, "app/base");
    }

    #[test]
    fn test_split_registry_heuristics() {
        assert_eq!(split_registry("ghcr.io/acme/app"), (Some("ghcr.io"), "acme/app"));
        assert_eq!(split_registry("app/base"), (None, "app/base"));
        assert_eq!(split_registry("redis"), (None, "redis"));
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert!(parse_reference("").is_err());
        assert!(parse_reference("app/base@sha256:short").is_err());
        assert!(parse_reference("app/base@md5:abcd").is_err());
        assert!(parse_reference("app/base:").is_err());
        assert!(parse_reference("APP/Base:1.0").is_err());
        let doubled = format!("a@{}@{}", DIGEST, DIGEST);
        assert!(parse_reference(&doubled).is_err());
    }

    #[test]
    fn test_render_round_trip() {
        for token in [
            "app/base",
            "app/base:1.2.0",
            "ghcr.io/acme/app:v3",
            &format!("app/base:1.2.0@{}", DIGEST),
            &format!("app/base@{}", DIGEST),
        ] {
            let (repo, tag, digest) = parse_reference(token).unwrap();
            assert_eq!(
                render_reference(&repo, tag.as_deref(), digest.as_deref()),
                *token
            );
        }
    }

    #[test]
    fn test_reference_ordering() {
        let make = |file: &str, start: usize| ImageReference {
            source_file: PathBuf::from(file),
            line: 1,
            span: Span::new(start, start + 10),
            repository: "app/base".into(),
            current_tag: Some("1.0".into()),
            current_digest: None,
        };
        let mut refs = vec![make("b.yaml", 5), make("a.yaml", 50), make("a.yaml", 5)];
        refs.sort();
        assert_eq!(refs[0].source_file, PathBuf::from("a.yaml"));
        assert_eq!(refs[0].span.start, 5);
        assert_eq!(refs[1].span.start, 50);
        assert_eq!(refs[2].source_file, PathBuf::from("b.yaml"));
    }

    #[test]
    fn test_span_overlap() {
        assert!(Span::new(0, 10).overlaps(&Span::new(5, 15)));
        assert!(!Span::new(0, 10).overlaps(&Span::new(10, 20)));
    }
}
