//! Reference extraction: scan a working tree for image-reference tokens.
//!
//! Two file kinds are recognized:
//! - Dockerfiles (`Dockerfile`, `Dockerfile.*`, `*.dockerfile`): the image
//!   source of each `FROM` instruction;
//! - YAML manifests (`*.yaml`, `*.yml`): `image:` scalar fields, which
//!   covers Kubernetes manifests, compose files, and CI definitions.
//!
//! Everything else is skipped without error. Parsing is line/token based
//! and tolerant: build-stage references, `scratch`, build-arg variables,
//! and template placeholders are skipped silently; malformed references
//! become [`ExtractWarning`]s and never abort the scan. Re-running on
//! unchanged files yields an identical sequence.

use std::path::{Path, PathBuf};

use regex_lite::Regex;
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::errors::ExtractWarning;
use crate::reference::{parse_reference, ImageReference, Span};

/// The outcome of scanning one working tree.
#[derive(Debug, Default)]
pub struct Extraction {
    /// References in deterministic `(file, span)` order.
    pub references: Vec<ImageReference>,
    /// Non-fatal problems encountered along the way.
    pub warnings: Vec<ExtractWarning>,
}

/// Scan the working tree rooted at `root`.
pub fn extract(root: &Path) -> Extraction {
    let mut out = Extraction::default();

    let walker = WalkDir::new(root)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.file_name() != ".git");

    for entry in walker {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "skipping unreadable directory entry");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(file_name) = entry.file_name().to_str() else {
            continue;
        };

        let kind = match classify(file_name) {
            Some(k) => k,
            None => continue,
        };

        let rel_path = entry
            .path()
            .strip_prefix(root)
            .unwrap_or(entry.path())
            .to_path_buf();

        let content = match std::fs::read_to_string(entry.path()) {
            Ok(c) => c,
            Err(e) => {
                out.warnings.push(ExtractWarning {
                    file: rel_path,
                    line: 0,
                    detail: format!("unreadable file: {}", e),
                });
                continue;
            }
        };

        match kind {
            FileKind::Dockerfile => scan_dockerfile(&rel_path, &content, &mut out),
            FileKind::Yaml => scan_yaml(&rel_path, &content, &mut out),
        }
    }

    out.references.sort();
    debug!(
        references = out.references.len(),
        warnings = out.warnings.len(),
        "extraction completed"
    );
    out
}

#[derive(Debug, Clone, Copy)]
enum FileKind {
    Dockerfile,
    Yaml,
}

fn classify(file_name: &str) -> Option<FileKind> {
    if file_name == "Dockerfile"
        || file_name == "Containerfile"
        || file_name.starts_with("Dockerfile.")
        || file_name.ends_with(".dockerfile")
    {
        return Some(FileKind::Dockerfile);
    }
    if file_name.ends_with(".yaml") || file_name.ends_with(".yml") {
        return Some(FileKind::Yaml);
    }
    None
}

// ---------------------------------------------------------------------------
// Dockerfile scanning
// ---------------------------------------------------------------------------

/// Extract the image source of each `FROM` instruction.
///
/// `FROM [--platform=…] <image> [AS <stage>]`. References to earlier build
/// stages, `scratch`, and `$VAR`/`${VAR}` build arguments are not
/// registry-resolvable and are skipped silently.
fn scan_dockerfile(file: &Path, content: &str, out: &mut Extraction) {
    let mut stage_names: Vec<String> = Vec::new();

    for (line_no, line, line_start) in lines_with_offsets(content) {
        let trimmed = line.trim_start();
        let rest = match strip_keyword(trimmed, "FROM") {
            Some(r) => r,
            None => continue,
        };

        // Tokenize the remainder: flags first, then the image, then AS.
        let mut image_token: Option<&str> = None;
        let mut tokens = rest.split_whitespace();
        while let Some(tok) = tokens.next() {
            if tok.starts_with("--") {
                continue;
            }
            image_token = Some(tok);
            break;
        }
        let Some(token) = image_token else { continue };

        let is_stage_ref = stage_names.contains(&token.to_ascii_lowercase());

        // Remember the stage name so later `FROM <stage>` lines are skipped.
        if let Some(next) = tokens.next() {
            if next.eq_ignore_ascii_case("AS") {
                if let Some(name) = tokens.next() {
                    stage_names.push(name.to_ascii_lowercase());
                }
            }
        }

        if token.starts_with('$') || token.eq_ignore_ascii_case("scratch") || is_stage_ref {
            continue;
        }

        let token_offset = offset_of(line, token);
        push_reference(file, line_no, line_start + token_offset, token, out);
    }
}

// ---------------------------------------------------------------------------
// YAML scanning
// ---------------------------------------------------------------------------

/// Extract `image:` scalar fields from YAML, quoted or bare, including
/// sequence items (`- image: …`).
fn scan_yaml(file: &Path, content: &str, out: &mut Extraction) {
    // Compiled per file; the expression is small and the file count is too.
    let image_line = Regex::new(r#"^\s*(?:-\s+)?image:\s*["']?([^"'\s#]+)"#)
        .expect("static regex must compile");

    for (line_no, line, line_start) in lines_with_offsets(content) {
        let Some(caps) = image_line.captures(line) else {
            continue;
        };
        let m = caps.get(1).expect("group 1 always present on match");
        let token = m.as_str();

        // Helm/template placeholders and env substitutions are not ours.
        if token.starts_with('$') || token.contains("{{") {
            continue;
        }

        push_reference(file, line_no, line_start + m.start(), token, out);
    }
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn push_reference(file: &Path, line_no: usize, start: usize, token: &str, out: &mut Extraction) {
    match parse_reference(token) {
        Ok((repository, tag, digest)) => {
            out.references.push(ImageReference {
                source_file: file.to_path_buf(),
                line: line_no,
                span: Span::new(start, start + token.len()),
                repository,
                current_tag: tag,
                current_digest: digest,
            });
        }
        Err(detail) => {
            warn!(file = %file.display(), line = line_no, %detail, "skipping malformed reference");
            out.warnings.push(ExtractWarning {
                file: file.to_path_buf(),
                line: line_no,
                detail,
            });
        }
    }
}

/// Iterate `(1-based line number, line without newline, byte offset)`.
fn lines_with_offsets(content: &str) -> impl Iterator<Item = (usize, &str, usize)> {
    let mut offset = 0;
    content.split_inclusive('\n').enumerate().map(move |(i, raw)| {
        let start = offset;
        offset += raw.len();
        (i + 1, raw.trim_end_matches(['\n', '\r']), start)
    })
}

/// Case-insensitive instruction keyword match followed by whitespace.
fn strip_keyword<'a>(line: &'a str, keyword: &str) -> Option<&'a str> {
    let bytes = line.as_bytes();
    if bytes.len() > keyword.len()
        && bytes[..keyword.len()].eq_ignore_ascii_case(keyword.as_bytes())
        && bytes[keyword.len()].is_ascii_whitespace()
    {
        Some(&line[keyword.len() + 1..])
    } else {
        None
    }
}

/// Byte offset of `token` within `line`. The token is a subslice of the
/// line, so pointer arithmetic gives the exact position even when the
/// same text occurs earlier in the line.
fn offset_of(line: &str, token: &str) -> usize {
    token.as_ptr() as usize - line.as_ptr() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_tree(files: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (path, content) in files {
            let full = dir.path().join(path);
            if let Some(parent) = full.parent() {
                std::fs::create_dir_all(parent).unwrap();
            }
            std::fs::write(full, content).unwrap();
        }
        dir
    }

    #[test]
    fn test_dockerfile_from_lines() {
        let dir = write_tree(&[(
            "Dockerfile",
            "FROM app/base:1.2.0\nRUN echo hi\nFROM ghcr.io/acme/tool:v3 AS build\n",
        )]);
        let result = extract(dir.path());
        assert_eq!(result.references.len(), 2);
        assert_eq!(result.references[0].repository, "app/base");
        assert_eq!(result.references[0].current_tag.as_deref(), Some("1.2.0"));
        assert_eq!(result.references[0].line, 1);
        assert_eq!(result.references[1].repository, "ghcr.io/acme/tool");
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_dockerfile_skips_stages_scratch_and_args() {
        let dir = write_tree(&[(
            "Dockerfile",
            concat!(
                "ARG BASE=app/base:1.0\n",
                "FROM golang:1.22 AS build\n",
                "FROM scratch\n",
                "FROM $BASE\n",
                "FROM ${BASE}\n",
                "FROM build\n",
            ),
        )]);
        let result = extract(dir.path());
        assert_eq!(result.references.len(), 1);
        assert_eq!(result.references[0].repository, "golang");
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_dockerfile_platform_flag() {
        let dir = write_tree(&[(
            "Dockerfile",
            "FROM --platform=linux/amd64 app/base:1.2.0\n",
        )]);
        let result = extract(dir.path());
        assert_eq!(result.references.len(), 1);
        assert_eq!(result.references[0].repository, "app/base");
    }

    #[test]
    fn test_yaml_image_fields() {
        let dir = write_tree(&[(
            "deploy/app.yaml",
            concat!(
                "apiVersion: apps/v1\n",
                "kind: Deployment\n",
                "spec:\n",
                "  containers:\n",
                "    - image: app/base:1.2.0\n",
                "      name: app\n",
                "    - image: \"ghcr.io/acme/sidecar:2.0\"  # pinned\n",
                "  # image: commented/out:1.0\n",
            ),
        )]);
        let result = extract(dir.path());
        assert_eq!(result.references.len(), 2);
        assert_eq!(result.references[0].repository, "app/base");
        assert_eq!(result.references[1].repository, "ghcr.io/acme/sidecar");
        assert_eq!(result.references[1].current_tag.as_deref(), Some("2.0"));
    }

    #[test]
    fn test_yaml_skips_templates() {
        let dir = write_tree(&[(
            "chart.yaml",
            "image: {{ .Values.image }}\nimage: $IMAGE\nimage: app/base:1.0\n",
        )]);
        let result = extract(dir.path());
        assert_eq!(result.references.len(), 1);
        assert_eq!(result.references[0].repository, "app/base");
    }

    #[test]
    fn test_malformed_reference_is_warning_not_fatal() {
        let dir = write_tree(&[(
            "app.yaml",
            "image: app/base@sha256:tooshort\nimage: app/base:1.0\n",
        )]);
        let result = extract(dir.path());
        assert_eq!(result.references.len(), 1);
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.warnings[0].line, 1);
    }

    #[test]
    fn test_unsupported_files_skipped() {
        let dir = write_tree(&[
            ("README.md", "FROM not/a:dockerfile\n"),
            ("script.sh", "image: nope/nope:1\n"),
        ]);
        let result = extract(dir.path());
        assert!(result.references.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_spans_address_exact_token() {
        let content = "FROM --platform=linux/arm64 app/base:1.2.0 AS runtime\n";
        let dir = write_tree(&[("Dockerfile", content)]);
        let result = extract(dir.path());
        let r = &result.references[0];
        assert_eq!(&content[r.span.start..r.span.end], "app/base:1.2.0");
    }

    #[test]
    fn test_deterministic_order_and_idempotence() {
        let dir = write_tree(&[
            ("b/app.yaml", "image: app/b:1.0\n"),
            ("a/app.yaml", "image: app/a:1.0\nimage: app/a2:1.0\n"),
            ("Dockerfile", "FROM app/base:1.0\n"),
        ]);
        let first = extract(dir.path());
        let second = extract(dir.path());
        assert_eq!(first.references, second.references);

        let files: Vec<_> = first
            .references
            .iter()
            .map(|r| r.source_file.display().to_string())
            .collect();
        assert_eq!(files, ["Dockerfile", "a/app.yaml", "a/app.yaml", "b/app.yaml"]);
        assert!(first.references[1].span.start < first.references[2].span.start);
    }
}
