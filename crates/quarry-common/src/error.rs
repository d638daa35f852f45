//! Common error types for the Quarry image assembler.

use std::path::{Path, PathBuf};

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`QuarryError`].
pub type QuarryResult<T> = Result<T, QuarryError>;

/// Errors raised while validating, assembling or verifying an image.
///
/// Every variant maps to a stable reason code, see [`QuarryError::reason`].
#[derive(Error, Diagnostic, Debug)]
pub enum QuarryError {
    /// An exposed port carries a protocol other than `tcp` or `udp`.
    #[error("Invalid port option {option} for port {port}. Options include: tcp, udp")]
    #[diagnostic(
        code(quarry::config::invalid_port_option),
        help("Exposed ports look like '8080', '8080/tcp' or '53/udp'")
    )]
    InvalidPortOption {
        /// The full port specification.
        port: String,
        /// The rejected protocol suffix.
        option: String,
    },

    /// An exposed port is not an integer.
    #[error("Invalid port {port}")]
    #[diagnostic(code(quarry::config::invalid_port))]
    InvalidPort {
        /// The full port specification.
        port: String,
    },

    /// An exposed port number is outside 0..=65535.
    #[error("Invalid port number {port}")]
    #[diagnostic(code(quarry::config::port_out_of_range))]
    PortOutOfRange {
        /// The full port specification.
        port: String,
    },

    /// An image name or tag does not follow the repository syntax.
    #[error("{name} image name is not valid")]
    #[diagnostic(
        code(quarry::config::invalid_image_name),
        help("Names must be of form 'NAME' or 'NAME:TAG' using [a-z0-9] separated by '.', '_', '/' or '-'")
    )]
    InvalidImageName {
        /// The rejected name.
        name: String,
    },

    /// No image name was declared.
    #[error("At least one image name must be declared")]
    #[diagnostic(code(quarry::config::missing_image_name))]
    MissingImageName,

    /// The timestamp policy is neither `now`, `deterministic` nor a valid timestamp.
    #[error("{value} timestamp is not valid")]
    #[diagnostic(
        code(quarry::config::invalid_timestamp),
        help("Use 'now', 'deterministic' or a UTC timestamp such as 2024-01-31T12:00:00Z")
    )]
    InvalidTimestamp {
        /// The rejected value.
        value: String,
    },

    /// The image element does not have at least one build dependency.
    #[error("{element} must have at least one build dependency, found {found}")]
    #[diagnostic(code(quarry::graph::build_dependency_count))]
    BuildDependencyCount {
        /// The image element.
        element: String,
        /// Number of build dependencies found.
        found: usize,
    },

    /// The image element declares runtime dependencies of its own.
    #[error("{element} must not have runtime dependencies, found {found}")]
    #[diagnostic(
        code(quarry::graph::runtime_dependencies),
        help("Declare the dependency as a build dependency so it lands in a layer")
    )]
    RuntimeDependencies {
        /// The image element.
        element: String,
        /// Number of runtime dependencies found.
        found: usize,
    },

    /// The staging collaborator failed to materialize a node.
    #[error("Failed to stage {node}: {source}")]
    #[diagnostic(code(quarry::staging))]
    Staging {
        /// Name of the node that could not be staged.
        node: String,
        /// The underlying failure.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A produced image does not satisfy its digest or ordering invariants.
    #[error("Verification failed: {message}")]
    #[diagnostic(code(quarry::verify))]
    Verification {
        /// What did not match.
        message: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(quarry::io))]
    Io(#[from] std::io::Error),

    /// I/O error on a known path.
    #[error("I/O error on {}: {source}", path.display())]
    #[diagnostic(code(quarry::io))]
    IoAt {
        /// Path being read or written.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(quarry::serialization))]
    Serialization(String),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(quarry::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(code(quarry::internal), help("This is a bug, please report it"))]
    Internal {
        /// The error message.
        message: String,
    },
}

impl QuarryError {
    /// Wrap an I/O error with the path it happened on.
    pub fn io_at(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Self::IoAt {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    /// Wrap a staging failure for `node`.
    pub fn staging(
        node: impl Into<String>,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        Self::Staging {
            node: node.into(),
            source: source.into(),
        }
    }

    /// Stable, greppable reason code for this error kind.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::InvalidPortOption { .. } => "invalid-port-option",
            Self::InvalidPort { .. } => "invalid-port",
            Self::PortOutOfRange { .. } => "port-out-of-range",
            Self::InvalidImageName { .. } => "invalid-image-name",
            Self::MissingImageName => "missing-image-name",
            Self::InvalidTimestamp { .. } => "invalid-timestamp",
            Self::BuildDependencyCount { .. } => "bdepend-wrong-count",
            Self::RuntimeDependencies { .. } => "rdepend-forbidden",
            Self::Staging { .. } => "staging-failed",
            Self::Verification { .. } => "verification-failed",
            Self::Io(_) | Self::IoAt { .. } => "io",
            Self::Serialization(_) => "serialization",
            Self::Config { .. } => "config",
            Self::Internal { .. } => "internal",
        }
    }
}

impl From<serde_json::Error> for QuarryError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
