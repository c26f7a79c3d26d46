//! Error taxonomy for resolution, planning and execution.
//!
//! Graph and execution errors surface to the run caller with the causing
//! instance id. Reference errors are logged by the substitution loop and never
//! abort it.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// A required input has no dependency, override, default, or directive.
    #[error("mandatory input unmet: input '{input}' of tile '{tile}' (instance '{instance}')")]
    MandatoryInputUnmet {
        instance: String,
        tile: String,
        input: String,
    },

    /// `dependsOn` names an instance that is not declared in the deployment.
    #[error("unknown dependency: instance '{instance}' depends on undeclared '{dependency}'")]
    UnknownDependency { instance: String, dependency: String },

    /// A tile-internal reference names a dependency the tile does not declare.
    #[error("tile '{tile}' (instance '{instance}') references undeclared dependency '{dependency}'")]
    UndeclaredTileDependency {
        instance: String,
        tile: String,
        dependency: String,
    },

    /// The tile descriptor could not be fetched or parsed.
    #[error("cannot fetch tile {tile}@{version} for instance '{instance}': {reason}")]
    TileFetch {
        instance: String,
        tile: String,
        version: String,
        reason: String,
    },

    #[error("dependency cycle detected involving: {0}")]
    DependencyCycle(String),

    /// The plan references an instance that was never registered.
    #[error("instance '{0}' is missing from the registry")]
    MissingInstance(String),

    /// Malformed or unresolvable `$()` / `$cdk()` expression.
    #[error("cannot resolve reference {expr}: {reason}")]
    Reference { expr: String, reason: String },

    #[error("failed to render script for '{instance}': {reason}")]
    ScriptRender { instance: String, reason: String },

    #[error("stage '{instance}' failed: {reason}")]
    StageFailed { instance: String, reason: String },

    #[error("stage '{instance}' has no output log at {path}")]
    MissingOutputLog { instance: String, path: String },

    /// A dependency was interrupted, so the dependent never starts.
    #[error("stage '{instance}' cannot start: dependency '{dependency}' was interrupted")]
    DependencyInterrupted { instance: String, dependency: String },

    #[error("run cancelled")]
    Cancelled,

    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// The instance this error is attributable to, if any.
    pub fn instance(&self) -> Option<&str> {
        match self {
            Self::MandatoryInputUnmet { instance, .. }
            | Self::UnknownDependency { instance, .. }
            | Self::UndeclaredTileDependency { instance, .. }
            | Self::TileFetch { instance, .. }
            | Self::ScriptRender { instance, .. }
            | Self::StageFailed { instance, .. }
            | Self::MissingOutputLog { instance, .. }
            | Self::DependencyInterrupted { instance, .. } => Some(instance),
            Self::MissingInstance(instance) => Some(instance),
            _ => None,
        }
    }

    /// True for errors raised while building the instance graph.
    pub fn is_graph_error(&self) -> bool {
        matches!(
            self,
            Self::MandatoryInputUnmet { .. }
                | Self::UnknownDependency { .. }
                | Self::UndeclaredTileDependency { .. }
                | Self::TileFetch { .. }
                | Self::DependencyCycle(_)
        )
    }
}
