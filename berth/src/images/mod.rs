//! Machine images: preparation (build or pull) and snapshots.

mod prepare;
mod registry;
mod snapshot;

pub use prepare::{ImagePreparer, machine_image_name};
pub use registry::{RegistryClient, RegistryError};
#[cfg(feature = "registry-http")]
pub use registry::HttpRegistryClient;
pub use snapshot::{SnapshotPipeline, generate_snapshot_repository};

use berth_shared::constants::images;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::LazyLock;

static SNAPSHOT_LOCATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!("^(.+/)?{}.+$", regex::escape(images::SNAPSHOT_PREFIX)))
        .unwrap_or_else(|e| unreachable!("snapshot location pattern is valid: {e}"))
});

/// Whether an image location points at a machine snapshot.
pub fn is_snapshot_location(location: &str) -> bool {
    SNAPSHOT_LOCATION.is_match(location)
}

// ============================================================================
// Image location
// ============================================================================

/// An image location `[registry/]repository[:tag][@digest]`.
///
/// Produced by snapshot saves and accepted as a machine image source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub registry: Option<String>,
    pub repository: String,
    #[serde(default)]
    pub tag: Option<String>,
    #[serde(default)]
    pub digest: Option<String>,
}

impl Snapshot {
    /// Parse a location. `None` when there is no repository part.
    pub fn parse(location: &str) -> Option<Self> {
        let location = location.trim();

        let (rest, digest) = match location.rsplit_once('@') {
            Some((rest, digest)) if !digest.is_empty() => (rest, Some(digest.to_string())),
            Some((rest, _)) => (rest, None),
            None => (location, None),
        };

        let (rest, tag) = match rest.rsplit_once(':') {
            Some((name, tag)) if !tag.contains('/') && !tag.is_empty() => (name, Some(tag.to_string())),
            _ => (rest, None),
        };

        let (registry, repository) = if is_fully_qualified(rest) {
            match rest.split_once('/') {
                Some((registry, repository)) => (Some(registry.to_string()), repository),
                None => (None, rest),
            }
        } else {
            (None, rest)
        };

        if repository.is_empty() {
            return None;
        }

        Some(Self {
            registry,
            repository: repository.to_string(),
            tag,
            digest,
        })
    }

    /// `[registry/]repository`
    pub fn full_repository(&self) -> String {
        match &self.registry {
            Some(registry) => format!("{}/{}", registry, self.repository),
            None => self.repository.clone(),
        }
    }

    /// `[registry/]repository[:tag]`, optionally followed by `@digest`.
    pub fn location(&self, with_digest: bool) -> String {
        let mut location = self.full_repository();
        if let Some(tag) = &self.tag {
            location.push(':');
            location.push_str(tag);
        }
        if with_digest && let Some(digest) = &self.digest {
            location.push('@');
            location.push_str(digest);
        }
        location
    }

    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or(images::LATEST_TAG)
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.location(true))
    }
}

/// Check if an image reference starts with a registry host.
///
/// The part before the first `/` counts as a registry when it contains a
/// `.` or `:`, or is exactly `localhost`.
fn is_fully_qualified(image_ref: &str) -> bool {
    if let Some(slash_pos) = image_ref.find('/') {
        let first_part = &image_ref[..slash_pos];
        first_part.contains('.') || first_part.contains(':') || first_part == "localhost"
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_fully_qualified() {
        assert!(is_fully_qualified("docker.io/library/alpine"));
        assert!(is_fully_qualified("localhost/myimage"));
        assert!(is_fully_qualified("localhost:5000/myimage"));

        assert!(!is_fully_qualified("alpine"));
        assert!(!is_fully_qualified("library/alpine"));
        assert!(!is_fully_qualified("eclipse/ubuntu_jdk8"));
    }

    #[test]
    fn test_parse_plain_and_tagged() {
        let s = Snapshot::parse("alpine").unwrap();
        assert_eq!(s.registry, None);
        assert_eq!(s.repository, "alpine");
        assert_eq!(s.tag_or_latest(), "latest");

        let s = Snapshot::parse("eclipse/ubuntu_jdk8:1.2").unwrap();
        assert_eq!(s.repository, "eclipse/ubuntu_jdk8");
        assert_eq!(s.tag.as_deref(), Some("1.2"));
    }

    #[test]
    fn test_parse_registry_port_tag_and_digest() {
        let s = Snapshot::parse("localhost:5000/machine_snapshot_abc:latest@sha256:0123").unwrap();
        assert_eq!(s.registry.as_deref(), Some("localhost:5000"));
        assert_eq!(s.repository, "machine_snapshot_abc");
        assert_eq!(s.tag.as_deref(), Some("latest"));
        assert_eq!(s.digest.as_deref(), Some("sha256:0123"));
        assert_eq!(s.location(false), "localhost:5000/machine_snapshot_abc:latest");
        assert_eq!(s.to_string(), "localhost:5000/machine_snapshot_abc:latest@sha256:0123");
    }

    #[test]
    fn test_registry_port_is_not_a_tag() {
        let s = Snapshot::parse("localhost:5000/repo").unwrap();
        assert_eq!(s.registry.as_deref(), Some("localhost:5000"));
        assert_eq!(s.repository, "repo");
        assert_eq!(s.tag, None);
    }

    #[test]
    fn test_parse_without_repository() {
        assert!(Snapshot::parse("").is_none());
        assert!(Snapshot::parse("registry.example.com/").is_none());
    }

    #[test]
    fn test_snapshot_location_detection() {
        assert!(is_snapshot_location("machine_snapshot_abcdef"));
        assert!(is_snapshot_location("localhost:5000/machine_snapshot_abcdef:latest"));
        assert!(!is_snapshot_location("ubuntu"));
        assert!(!is_snapshot_location("machine_snapshot_"));
    }
}
