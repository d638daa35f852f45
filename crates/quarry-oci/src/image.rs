//! Docker image archive documents.
//!
//! Based on the Docker Image Specification v1.2 and the archive layout read
//! by `docker load`:
//! <https://github.com/moby/docker-image-spec>

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Version written to every layer's `VERSION` file.
pub const LAYER_FORMAT_VERSION: &str = "1.0";

/// `rootfs.type` of every image.
pub const ROOTFS_TYPE: &str = "layers";

/// Prefix of the self-describing checksum in layer metadata.
pub const CHECKSUM_PREFIX: &str = "tarsum.v1+sha256:";

/// Serializes as an empty JSON object, the value type of port and volume sets.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyObject {}

/// Image configuration (`<image_id>.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageConfig {
    /// Creation timestamp.
    pub created: String,
    /// Author.
    pub author: String,
    /// Architecture.
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// Execution parameters.
    pub config: ContainerConfig,
    /// Rootfs information.
    pub rootfs: RootFs,
    /// History entries, one per layer.
    pub history: Vec<HistoryEntry>,
}

/// Execution parameters of containers started from the image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainerConfig {
    /// Exposed ports, `PORT/PROTO` keys.
    #[serde(default)]
    pub exposed_ports: BTreeMap<String, EmptyObject>,
    /// Environment variables (`KEY=VALUE`).
    #[serde(default)]
    pub env: Vec<String>,
    /// Entrypoint.
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// Default command.
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Volumes.
    #[serde(default)]
    pub volumes: BTreeMap<String, EmptyObject>,
    /// Working directory.
    #[serde(default)]
    pub working_dir: String,
    /// Healthcheck.
    #[serde(default)]
    pub healthcheck: Healthcheck,
}

/// The subset of [`ContainerConfig`] recorded in each layer's metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LayerConfig {
    /// Exposed ports.
    #[serde(default)]
    pub exposed_ports: BTreeMap<String, EmptyObject>,
    /// Environment variables.
    #[serde(default)]
    pub env: Vec<String>,
    /// Entrypoint.
    #[serde(default)]
    pub entrypoint: Vec<String>,
    /// Default command.
    #[serde(default)]
    pub cmd: Vec<String>,
    /// Volumes.
    #[serde(default)]
    pub volumes: BTreeMap<String, EmptyObject>,
    /// Working directory.
    #[serde(default)]
    pub working_dir: String,
}

impl From<&ContainerConfig> for LayerConfig {
    fn from(config: &ContainerConfig) -> Self {
        Self {
            exposed_ports: config.exposed_ports.clone(),
            env: config.env.clone(),
            entrypoint: config.entrypoint.clone(),
            cmd: config.cmd.clone(),
            volumes: config.volumes.clone(),
            working_dir: config.working_dir.clone(),
        }
    }
}

/// Healthcheck configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Healthcheck {
    /// Healthcheck command, `["NONE"]` disables it.
    pub test: Vec<String>,
    /// Interval between checks (nanoseconds).
    pub interval: u64,
    /// Timeout for each check (nanoseconds).
    pub timeout: u64,
    /// Number of retries before unhealthy.
    pub retries: u32,
}

impl Default for Healthcheck {
    fn default() -> Self {
        Self {
            test: vec!["NONE".to_string()],
            interval: 0,
            timeout: 0,
            retries: 0,
        }
    }
}

/// Root filesystem information.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootFs {
    /// Type (must be "layers").
    #[serde(rename = "type")]
    pub fs_type: String,
    /// Layer diff IDs (`sha256:<digest>`), bottom to top.
    pub diff_ids: Vec<String>,
}

impl Default for RootFs {
    fn default() -> Self {
        Self {
            fs_type: ROOTFS_TYPE.to_string(),
            diff_ids: Vec::new(),
        }
    }
}

/// History entry for an image layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Creation timestamp.
    pub created: String,
    /// What created this layer.
    pub created_by: String,
}

/// Per-layer metadata record (`<digest>/json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayerMetadata {
    /// Layer digest (bare hex).
    pub id: String,
    /// Creation timestamp.
    pub created: String,
    /// Author.
    pub author: String,
    /// `tarsum.v1+sha256:<digest>`.
    pub checksum: String,
    /// Runtime configuration snapshot.
    pub config: LayerConfig,
}

/// One entry of `manifest.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestEntry {
    /// `<image_id>.json`.
    pub config: String,
    /// `<digest>/layer.tar`, bottom to top.
    pub layers: Vec<String>,
    /// `name:tag` pairs.
    pub repo_tags: Vec<String>,
}

/// The `repositories` index: image name to `<tag>:<top layer digest>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Repositories(pub BTreeMap<String, String>);

impl Repositories {
    /// Iterate `(name, "<tag>:<digest>")` pairs in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Split an index value into `(tag, digest)`.
    #[must_use]
    pub fn split_value(value: &str) -> Option<(&str, &str)> {
        value.rsplit_once(':')
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::to_canonical_vec;

    fn canonical_string<T: Serialize>(value: &T) -> String {
        String::from_utf8(to_canonical_vec(value).unwrap()).unwrap()
    }

    #[test]
    fn manifest_serialization() {
        let manifest = vec![ManifestEntry {
            config: "abc.json".to_string(),
            layers: vec!["d1/layer.tar".to_string(), "d2/layer.tar".to_string()],
            repo_tags: vec!["app:latest".to_string()],
        }];

        insta::assert_snapshot!(
            canonical_string(&manifest),
            @r#"[{"Config":"abc.json","Layers":["d1/layer.tar","d2/layer.tar"],"RepoTags":["app:latest"]}]"#
        );
    }

    #[test]
    fn repositories_serialization() {
        let mut repositories = Repositories::default();
        repositories
            .0
            .insert("web".to_string(), "1.0:d2".to_string());
        repositories
            .0
            .insert("app".to_string(), "latest:d2".to_string());

        insta::assert_snapshot!(
            canonical_string(&repositories),
            @r#"{"app":"latest:d2","web":"1.0:d2"}"#
        );
        assert_eq!(Repositories::split_value("1.0:d2"), Some(("1.0", "d2")));
    }

    #[test]
    fn container_config_keys() {
        let mut config = ContainerConfig::default();
        config
            .exposed_ports
            .insert("80/tcp".to_string(), EmptyObject {});

        let json = canonical_string(&config);
        assert!(json.starts_with(r#"{"Cmd":[],"Entrypoint":[],"Env":[],"ExposedPorts":{"80/tcp":{}}"#));
        assert!(json.contains(
            r#""Healthcheck":{"Interval":0,"Retries":0,"Test":["NONE"],"Timeout":0}"#
        ));
        assert!(json.ends_with(r#""Volumes":{},"WorkingDir":""}"#));
    }

    #[test]
    fn layer_config_drops_healthcheck() {
        let mut config = ContainerConfig::default();
        config.cmd = vec!["/bin/app".to_string()];
        config.healthcheck.retries = 3;

        let layer = LayerConfig::from(&config);
        let json = canonical_string(&layer);
        assert!(json.contains(r#""Cmd":["/bin/app"]"#));
        assert!(!json.contains("Healthcheck"));
    }

    #[test]
    fn image_config_round_trip() {
        let config = ImageConfig {
            created: "2011-11-11T00:00:00Z".to_string(),
            author: "tester".to_string(),
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
            config: ContainerConfig::default(),
            rootfs: RootFs {
                diff_ids: vec!["sha256:d1".to_string()],
                ..RootFs::default()
            },
            history: vec![HistoryEntry {
                created: "2011-11-11T00:00:00Z".to_string(),
                created_by: "tester".to_string(),
            }],
        };

        let bytes = to_canonical_vec(&config).unwrap();
        let parsed: ImageConfig = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(parsed, config);
        assert_eq!(parsed.rootfs.fs_type, "layers");
    }
}
