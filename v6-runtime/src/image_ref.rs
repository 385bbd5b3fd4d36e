//! Minimal container image reference parser: `[registry/]repository[:tag|@digest]`.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ImageRefError {
    #[error("invalid repository name: {0}")]
    InvalidRepository(String),
}

const DEFAULT_REGISTRY: &str = "docker.io";
const DEFAULT_TAG: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub registry: String,
    pub repository: String,
    pub tag: String,
}

/// A reference segment is treated as a registry host (rather than the
/// first path component of the repository) iff it contains a `.` or `:`,
/// or is exactly `localhost` — matching the convention Docker itself uses.
fn looks_like_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

fn is_valid_registry(registry: &str) -> bool {
    registry
        .chars()
        .next()
        .map(|c| c.is_ascii_alphanumeric())
        .unwrap_or(false)
}

fn is_valid_repository(repo: &str) -> bool {
    !repo.is_empty()
        && repo
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false)
        && repo
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '-' | '_' | '.'))
}

pub fn parse(reference: &str) -> Result<ImageRef, ImageRefError> {
    let mut remainder = reference;

    let (registry, rest) = match remainder.split_once('/') {
        Some((first, rest)) if looks_like_registry(first) => (first.to_string(), rest),
        _ => (DEFAULT_REGISTRY.to_string(), remainder),
    };
    remainder = rest;

    if !is_valid_registry(&registry) {
        return Err(ImageRefError::InvalidRepository(registry));
    }

    // A digest reference (`@sha256:...`) takes priority over a `:tag` split
    // since digests themselves contain a colon.
    let (repository, tag) = if let Some((repo, digest)) = remainder.split_once('@') {
        (repo.to_string(), digest.to_string())
    } else if let Some((repo, tag)) = remainder.rsplit_once(':') {
        (repo.to_string(), tag.to_string())
    } else {
        (remainder.to_string(), DEFAULT_TAG.to_string())
    };

    if !is_valid_repository(&repository) {
        return Err(ImageRefError::InvalidRepository(repository));
    }

    Ok(ImageRef {
        registry,
        repository,
        tag,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_digest_reference() {
        let r = parse("harbor2.example.ai/demo/avg@sha256:abcd").unwrap();
        assert_eq!(r.registry, "harbor2.example.ai");
        assert_eq!(r.repository, "demo/avg");
        assert_eq!(r.tag, "sha256:abcd");
    }

    #[test]
    fn bare_name_gets_defaults() {
        let r = parse("image").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "image");
        assert_eq!(r.tag, "latest");
    }

    #[test]
    fn registry_with_port_and_nested_repo() {
        let r = parse("my.reg:5000/nested/image:tag").unwrap();
        assert_eq!(r.registry, "my.reg:5000");
        assert_eq!(r.repository, "nested/image");
        assert_eq!(r.tag, "tag");
    }

    #[test]
    fn rejects_invalid_repository() {
        let err = parse("-bad.example/image").unwrap_err();
        assert!(matches!(err, ImageRefError::InvalidRepository(_)));
    }
}
