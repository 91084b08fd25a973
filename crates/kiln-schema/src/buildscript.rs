//! Parsing of builder build scripts (Dockerfile syntax plus two extensions).
//!
//! `# %include <path>` pulls a file, or with a trailing `/` a whole subtree,
//! of the outer source tree into the build context under `extra/vct/`.
//!
//! `FROM secure:<repository>:<tag-prefix>:sha256 <digest>:<url>` names a base
//! image that must be downloaded and verified before import; the line is
//! rewritten to `FROM <image-id>` once the import succeeds.

use crate::SchemaError;

pub const INCLUDE_DIRECTIVE: &str = "# %include ";
pub const SECURE_FROM: &str = "FROM secure:";
const DIGEST_SCHEME: &str = "sha256 ";

/// A base image reference that must be digest-verified before use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecureBaseRef {
    pub repository: String,
    pub tag_prefix: String,
    /// Lowercase hex SHA-256 of the downloaded bytes.
    pub digest: String,
    pub url: String,
}

impl SecureBaseRef {
    /// Parse the part of a `FROM secure:` line after the prefix.
    pub fn parse(spec: &str) -> Result<Self, SchemaError> {
        let mut parts = spec.splitn(4, ':');
        let (Some(repository), Some(tag_prefix), Some(digest), Some(url)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(SchemaError::InvalidDirective(format!(
                "expected 'secure:<repository>:<tag-prefix>:sha256 <digest>:<url>', got '{spec}'"
            )));
        };

        let Some(digest) = digest.strip_prefix(DIGEST_SCHEME) else {
            return Err(SchemaError::InvalidDirective(
                "FROM secure: requires sha256 digests".to_owned(),
            ));
        };
        if digest.len() != 64 || !digest.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(SchemaError::InvalidDirective(format!(
                "malformed sha256 digest '{digest}'"
            )));
        }
        if repository.is_empty() || url.is_empty() {
            return Err(SchemaError::InvalidDirective(format!(
                "repository and url must not be empty: '{spec}'"
            )));
        }

        Ok(Self {
            repository: repository.to_owned(),
            tag_prefix: tag_prefix.to_owned(),
            digest: digest.to_ascii_lowercase(),
            url: url.to_owned(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Text(String),
    Include { raw: String, path: String },
    SecureFrom(SecureBaseRef),
}

/// A parsed build script that can be rendered with secure bases resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildScript {
    lines: Vec<Line>,
}

impl BuildScript {
    pub fn parse(text: &str) -> Result<Self, SchemaError> {
        let mut lines = Vec::new();
        for raw in text.lines() {
            let line = raw.trim_end();
            if let Some(path) = line.strip_prefix(INCLUDE_DIRECTIVE) {
                let path = path.trim();
                if path.is_empty() {
                    return Err(SchemaError::InvalidDirective(
                        "empty %include path".to_owned(),
                    ));
                }
                lines.push(Line::Include {
                    raw: line.to_owned(),
                    path: path.to_owned(),
                });
            } else if let Some(spec) = line.strip_prefix(SECURE_FROM) {
                lines.push(Line::SecureFrom(SecureBaseRef::parse(spec)?));
            } else {
                lines.push(Line::Text(line.to_owned()));
            }
        }
        Ok(Self { lines })
    }

    /// Paths named by `# %include` directives, in script order.
    pub fn includes(&self) -> Vec<&str> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                Line::Include { path, .. } => Some(path.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn secure_bases(&self) -> Vec<&SecureBaseRef> {
        self.lines
            .iter()
            .filter_map(|l| match l {
                Line::SecureFrom(base) => Some(base),
                _ => None,
            })
            .collect()
    }

    /// Render the script, replacing each `FROM secure:` line with
    /// `FROM <id>` where `id` comes from `resolve`.
    pub fn render<E>(
        &self,
        mut resolve: impl FnMut(&SecureBaseRef) -> Result<String, E>,
    ) -> Result<String, E> {
        let mut out = Vec::with_capacity(self.lines.len());
        for line in &self.lines {
            match line {
                Line::Text(text) => out.push(text.clone()),
                Line::Include { raw, .. } => out.push(raw.clone()),
                Line::SecureFrom(base) => out.push(format!("FROM {}", resolve(base)?)),
            }
        }
        Ok(out.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "0f0e0d0c0b0a09080706050403020100f0e0d0c0b0a090807060504030201000";

    fn secure_line() -> String {
        format!("FROM secure:centos:centos7:sha256 {DIGEST}:https://example.com/c7.tar.xz")
    }

    #[test]
    fn parses_includes_and_secure_from() {
        let text = format!(
            "{}\n# %include testing/docker/shared/\n# %include pylib/setup.py\nRUN true\n",
            secure_line()
        );
        let script = BuildScript::parse(&text).unwrap();
        assert_eq!(
            script.includes(),
            vec!["testing/docker/shared/", "pylib/setup.py"]
        );
        let bases = script.secure_bases();
        assert_eq!(bases.len(), 1);
        assert_eq!(bases[0].repository, "centos");
        assert_eq!(bases[0].tag_prefix, "centos7");
        assert_eq!(bases[0].digest, DIGEST);
        assert_eq!(bases[0].url, "https://example.com/c7.tar.xz");
    }

    #[test]
    fn render_replaces_secure_from() {
        let text = format!("{}\nRUN echo hi   \n", secure_line());
        let script = BuildScript::parse(&text).unwrap();
        let rendered = script
            .render(|base| Ok::<_, String>(format!("img-{}", base.repository)))
            .unwrap();
        assert_eq!(rendered, "FROM img-centos\nRUN echo hi");
    }

    #[test]
    fn render_propagates_resolver_error() {
        let script = BuildScript::parse(&secure_line()).unwrap();
        let err = script.render(|_| Err::<String, _>("boom")).unwrap_err();
        assert_eq!(err, "boom");
    }

    #[test]
    fn rejects_missing_digest_scheme() {
        let line = format!("FROM secure:centos:centos7:md5 {DIGEST}:https://example.com/x");
        let err = BuildScript::parse(&line).unwrap_err();
        assert!(err.to_string().contains("sha256"));
    }

    #[test]
    fn rejects_malformed_digest() {
        let line = "FROM secure:centos:centos7:sha256 nothex:https://example.com/x";
        assert!(BuildScript::parse(line).is_err());
    }

    #[test]
    fn rejects_truncated_secure_reference() {
        assert!(BuildScript::parse("FROM secure:centos:centos7").is_err());
    }

    #[test]
    fn plain_script_passes_through() {
        let script = BuildScript::parse("FROM centos:7\nRUN yum update").unwrap();
        assert!(script.includes().is_empty());
        assert!(script.secure_bases().is_empty());
        let out = script.render(|_| Ok::<_, String>(String::new())).unwrap();
        assert_eq!(out, "FROM centos:7\nRUN yum update");
    }
}
