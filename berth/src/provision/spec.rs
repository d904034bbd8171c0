//! Desired state of a workspace machine.

use crate::servers::ServerConf;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

/// How to build the machine image.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Build context: a path or URL understood by the engine.
    #[serde(default)]
    pub context: Option<String>,
    /// Dockerfile path inside the context.
    #[serde(default)]
    pub dockerfile_path: Option<String>,
    /// Inline Dockerfile. Takes precedence over `context`.
    #[serde(default)]
    pub dockerfile_content: Option<String>,
    #[serde(default)]
    pub args: BTreeMap<String, String>,
}

impl BuildSpec {
    /// Whether there is anything to build from.
    pub fn has_source(&self) -> bool {
        self.context.is_some() || self.dockerfile_content.is_some()
    }
}

/// A machine to provision. Either `build` or `image` must be usable.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineSpec {
    /// Machine id, reported in lifecycle events.
    #[serde(default)]
    pub id: String,
    pub container_name: String,
    #[serde(default)]
    pub build: Option<BuildSpec>,
    /// Pullable reference or snapshot location.
    #[serde(default)]
    pub image: Option<String>,
    /// Memory limit in bytes. 0 leaves it to the engine.
    #[serde(default)]
    pub mem_limit: i64,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    /// Exposed `port/proto` keys.
    #[serde(default)]
    pub expose: Vec<String>,
    /// Ports published to the host.
    #[serde(default)]
    pub ports: Vec<String>,
    /// `host:container[:mode]` binds, or bare paths for named volumes.
    #[serde(default)]
    pub volumes: Vec<String>,
    #[serde(default)]
    pub volumes_from: Vec<String>,
    /// Networks joined after creation, besides the primary one.
    #[serde(default)]
    pub networks: Vec<String>,
    #[serde(default)]
    pub links: Vec<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Server metadata per port. Wins over `che:server:*` labels; the ports
    /// are exposed as well.
    #[serde(default)]
    pub servers: HashMap<String, ServerConf>,
    #[serde(default)]
    pub command: Option<Vec<String>>,
    #[serde(default)]
    pub entrypoint: Option<Vec<String>>,
}

impl MachineSpec {
    pub fn from_image(container_name: impl Into<String>, image: impl Into<String>) -> Self {
        Self {
            container_name: container_name.into(),
            image: Some(image.into()),
            ..Default::default()
        }
    }

    /// Build spec, if it has a source.
    pub fn buildable(&self) -> Option<&BuildSpec> {
        self.build.as_ref().filter(|b| b.has_source())
    }

    /// Neither a build source nor an image reference.
    pub fn has_no_source(&self) -> bool {
        self.buildable().is_none() && self.image.is_none()
    }
}

/// Who a machine belongs to.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeIdentity {
    pub workspace_id: String,
    #[serde(default)]
    pub env_name: String,
    #[serde(default)]
    pub owner: String,
}

impl RuntimeIdentity {
    pub fn new(workspace_id: impl Into<String>) -> Self {
        Self {
            workspace_id: workspace_id.into(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_detection() {
        let mut spec = MachineSpec {
            container_name: "c".to_string(),
            build: Some(BuildSpec::default()),
            ..Default::default()
        };
        assert!(spec.has_no_source());

        spec.build = Some(BuildSpec {
            dockerfile_content: Some("FROM alpine".to_string()),
            ..Default::default()
        });
        assert!(spec.buildable().is_some());

        let spec = MachineSpec::from_image("c", "alpine");
        assert!(!spec.has_no_source());
        assert!(spec.buildable().is_none());
    }

    #[test]
    fn test_deserialize_minimal() {
        let spec: MachineSpec =
            serde_json::from_str(r#"{"container_name": "ws", "image": "ubuntu:22.04"}"#).unwrap();
        assert_eq!(spec.image.as_deref(), Some("ubuntu:22.04"));
        assert!(spec.volumes.is_empty());
    }
}
