//! User-declared image settings and their validation.
//!
//! [`ImageSettings`] is the raw, deserializable form found in an Imagefile.
//! [`ImageSettings::validate`] checks it eagerly, before any assembly work,
//! and produces the [`ImageDefinition`] the assembler consumes.

use std::collections::BTreeMap;

use quarry_common::{QuarryError, QuarryResult};
use quarry_oci::image::EmptyObject;
use quarry_oci::{ContainerConfig, Healthcheck, LayerConfig};
use serde::{Deserialize, Deserializer, Serialize};

use crate::reference::ImageName;
use crate::timestamp::TimestampPolicy;

/// Author recorded in images unless overridden.
pub const DEFAULT_AUTHOR: &str = "quarry image assembler";

const NANOS_PER_SECOND: u64 = 1_000_000_000;
const PORT_PROTOCOLS: [&str; 2] = ["tcp", "udp"];

/// Raw image settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct ImageSettings {
    /// `PORT` or `PORT/tcp|udp`.
    #[serde(deserialize_with = "scalar_list")]
    pub exposed_ports: Vec<String>,
    /// Environment (`KEY=VALUE`).
    pub env: Vec<String>,
    /// Entrypoint.
    pub entry_point: Vec<String>,
    /// Default command.
    pub cmd: Vec<String>,
    /// Volume mount points.
    pub volumes: Vec<String>,
    /// Working directory.
    pub working_dir: String,
    /// Health check.
    pub health_check: HealthCheckSettings,
    /// `name[:tag]` identifiers.
    pub image_names: Vec<String>,
    /// `now`, `deterministic` or `YYYY-MM-DDTHH:MM:SSZ`.
    pub timestamp: String,
    /// Author recorded in the image and in every layer.
    pub author: String,
    /// Architecture recorded in the image config.
    pub architecture: String,
    /// Operating system recorded in the image config.
    pub os: String,
}

impl Default for ImageSettings {
    fn default() -> Self {
        Self {
            exposed_ports: Vec::new(),
            env: Vec::new(),
            entry_point: Vec::new(),
            cmd: Vec::new(),
            volumes: Vec::new(),
            working_dir: String::new(),
            health_check: HealthCheckSettings::default(),
            image_names: Vec::new(),
            timestamp: TimestampPolicy::Now.to_string(),
            author: DEFAULT_AUTHOR.to_string(),
            architecture: "amd64".to_string(),
            os: "linux".to_string(),
        }
    }
}

/// Raw health check settings. Durations are in seconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields, default)]
pub struct HealthCheckSettings {
    /// Test command; `["NONE"]` disables the check.
    pub tests: Vec<String>,
    /// Seconds between checks.
    pub interval: u64,
    /// Seconds before a check times out.
    pub timeout: u64,
    /// Consecutive failures before unhealthy.
    pub retries: u32,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            tests: vec!["NONE".to_string()],
            interval: 0,
            timeout: 0,
            retries: 0,
        }
    }
}

/// Validated image settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageDefinition {
    /// Image names, declaration order.
    pub names: Vec<ImageName>,
    /// Timestamp policy.
    pub timestamp: TimestampPolicy,
    /// Author.
    pub author: String,
    /// Architecture.
    pub architecture: String,
    /// Operating system.
    pub os: String,
    /// Runtime configuration.
    pub config: ContainerConfig,
}

impl ImageDefinition {
    /// Runtime configuration recorded in each layer's metadata.
    #[must_use]
    pub fn layer_config(&self) -> LayerConfig {
        LayerConfig::from(&self.config)
    }
}

impl ImageSettings {
    /// Validate the settings.
    ///
    /// Checks run in a fixed order: exposed ports, image names, timestamp.
    ///
    /// # Errors
    ///
    /// Returns the first configuration error found.
    pub fn validate(&self) -> QuarryResult<ImageDefinition> {
        let mut exposed_ports = BTreeMap::new();
        for port in &self.exposed_ports {
            validate_port(port)?;
            exposed_ports.insert(port.clone(), EmptyObject {});
        }

        if self.image_names.is_empty() {
            return Err(QuarryError::MissingImageName);
        }
        let names = self
            .image_names
            .iter()
            .map(|name| ImageName::parse(name))
            .collect::<QuarryResult<Vec<_>>>()?;

        let timestamp: TimestampPolicy = self.timestamp.parse()?;

        let health = &self.health_check;
        let config = ContainerConfig {
            exposed_ports,
            env: self.env.clone(),
            entrypoint: self.entry_point.clone(),
            cmd: self.cmd.clone(),
            volumes: self
                .volumes
                .iter()
                .map(|volume| (volume.clone(), EmptyObject {}))
                .collect(),
            working_dir: self.working_dir.clone(),
            healthcheck: Healthcheck {
                test: health.tests.clone(),
                interval: health.interval.saturating_mul(NANOS_PER_SECOND),
                timeout: health.timeout.saturating_mul(NANOS_PER_SECOND),
                retries: health.retries,
            },
        };

        Ok(ImageDefinition {
            names,
            timestamp,
            author: self.author.clone(),
            architecture: self.architecture.clone(),
            os: self.os.clone(),
            config,
        })
    }
}

/// Validate one exposed port specification.
///
/// # Errors
///
/// Returns an error for an unknown protocol, a non-integer port or a port
/// outside 0..=65535.
pub fn validate_port(spec: &str) -> QuarryResult<u16> {
    let port = match spec.split_once('/') {
        Some((port, option)) => {
            if !PORT_PROTOCOLS.contains(&option) {
                return Err(QuarryError::InvalidPortOption {
                    port: spec.to_string(),
                    option: option.to_string(),
                });
            }
            port
        }
        None => spec,
    };

    let number: i64 = port.trim().parse().map_err(|_| QuarryError::InvalidPort {
        port: spec.to_string(),
    })?;

    u16::try_from(number).map_err(|_| QuarryError::PortOutOfRange {
        port: spec.to_string(),
    })
}

/// Accept YAML/TOML lists mixing strings and integers (`- 80`, `- "53/udp"`).
fn scalar_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Scalar {
        Text(String),
        Number(i64),
    }

    let items = Vec::<Scalar>::deserialize(deserializer)?;
    Ok(items
        .into_iter()
        .map(|item| match item {
            Scalar::Text(text) => text,
            Scalar::Number(number) => number.to_string(),
        })
        .collect())
}
