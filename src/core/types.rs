//! Tile and Deployment document types.
//!
//! These are the already-validated trees produced by the parser. All types
//! derive Serialize/Deserialize for YAML roundtripping; field names follow the
//! camelCase spelling of the documents.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

/// The only supported document API version.
pub const API_VERSION: &str = "mahjong.io/v1alpha1";

// ============================================================================
// Enumerations
// ============================================================================

/// Tile category. Decides the stage kind and how cross-tile references render.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Category {
    Network,
    Compute,
    ContainerProvider,
    Storage,
    Database,
    Application,
    ContainerApplication,
    Analysis,
    #[serde(rename = "ML")]
    Ml,
}

impl Category {
    /// Application kinds run imperative commands instead of a declarative deploy.
    pub fn is_application(self) -> bool {
        matches!(self, Self::Application | Self::ContainerApplication)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "Network",
            Self::Compute => "Compute",
            Self::ContainerProvider => "ContainerProvider",
            Self::Storage => "Storage",
            Self::Database => "Database",
            Self::Application => "Application",
            Self::ContainerApplication => "ContainerApplication",
            Self::Analysis => "Analysis",
            Self::Ml => "ML",
        };
        write!(f, "{}", s)
    }
}

/// Declared type of an input or output value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoType {
    #[default]
    String,
    Number,
    #[serde(rename = "CDKObject")]
    CdkObject,
    FromCommand,
    Secret,
    #[serde(rename = "String[]")]
    StringArray,
    #[serde(rename = "Number[]")]
    NumberArray,
    #[serde(rename = "CDKObject[]")]
    CdkObjectArray,
}

impl IoType {
    pub fn is_array(self) -> bool {
        matches!(
            self,
            Self::StringArray | Self::NumberArray | Self::CdkObjectArray
        )
    }

    /// Values of string-like types are quoted when rendered.
    pub fn is_string_like(self) -> bool {
        matches!(
            self,
            Self::String | Self::Secret | Self::FromCommand | Self::StringArray
        )
    }
}

impl fmt::Display for IoType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::String => "String",
            Self::Number => "Number",
            Self::CdkObject => "CDKObject",
            Self::FromCommand => "FromCommand",
            Self::Secret => "Secret",
            Self::StringArray => "String[]",
            Self::NumberArray => "Number[]",
            Self::CdkObjectArray => "CDKObject[]",
        };
        write!(f, "{}", s)
    }
}

/// How a tile's manifests are applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ManifestType {
    #[serde(rename = "CDK")]
    Cdk,
    K8s,
    Helm,
    Kustomize,
}

impl fmt::Display for ManifestType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cdk => write!(f, "CDK"),
            Self::K8s => write!(f, "K8s"),
            Self::Helm => write!(f, "Helm"),
            Self::Kustomize => write!(f, "Kustomize"),
        }
    }
}

// ============================================================================
// Tile
// ============================================================================

/// A reusable, versioned infrastructure-component descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tile {
    pub api_version: String,
    pub kind: String,
    pub metadata: TileMetadata,
    pub spec: TileSpec,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileMetadata {
    pub name: String,
    pub category: Category,
    pub version: String,

    /// Vendor service this tile provides (e.g. "EKS")
    #[serde(default)]
    pub vendor_service: Option<String>,

    /// Vendor service this tile runs on top of
    #[serde(default)]
    pub dependent_on_vendor_service: Option<String>,

    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileSpec {
    #[serde(default)]
    pub global: GlobalDetail,

    #[serde(default)]
    pub pre_run: RunHooks,

    /// Other tiles this tile pulls in, by reference name
    #[serde(default)]
    pub dependencies: Vec<TileDependency>,

    #[serde(default)]
    pub inputs: Vec<TileInput>,

    #[serde(default)]
    pub manifests: Option<TileManifest>,

    /// Outputs in declaration order
    #[serde(default)]
    pub outputs: Vec<TileOutput>,

    #[serde(default, alias = "PostRun")]
    pub post_run: RunHooks,

    #[serde(default)]
    pub notes: Vec<String>,
}

impl Tile {
    /// Look up a declared dependency by its reference name.
    pub fn dependency(&self, name: &str) -> Option<&TileDependency> {
        self.spec.dependencies.iter().find(|d| d.name == name)
    }

    pub fn category(&self) -> Category {
        self.metadata.category
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GlobalDetail {
    #[serde(default)]
    pub env: Vec<EnvVar>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

/// Pre-run or post-run stage list.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunHooks {
    #[serde(default)]
    pub stages: Vec<HookStage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HookStage {
    pub name: String,
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub readiness_probe: Option<ReadinessProbe>,
}

/// Bounded retry-loop health check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessProbe {
    pub command: String,
    #[serde(default)]
    pub initial_delay_seconds: u64,
    #[serde(default = "default_period")]
    pub period_seconds: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_seconds: u64,
    /// Passing runs required; -1 disables
    #[serde(default = "default_threshold")]
    pub success_threshold: i64,
    /// Failing runs tolerated; -1 disables
    #[serde(default = "default_threshold")]
    pub failure_threshold: i64,
}

fn default_period() -> u64 {
    10
}

fn default_probe_timeout() -> u64 {
    300
}

fn default_threshold() -> i64 {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileDependency {
    /// Reference name used by inputs
    pub name: String,
    pub tile_reference: String,
    pub tile_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileInput {
    pub name: String,

    #[serde(default)]
    pub input_type: IoType,

    #[serde(default)]
    pub description: Option<String>,

    /// Structural references to fields of dependency tiles
    #[serde(default)]
    pub dependencies: Vec<InputDependency>,

    #[serde(default)]
    pub default_value: Option<serde_yaml_ng::Value>,

    #[serde(default)]
    pub default_values: Vec<serde_yaml_ng::Value>,

    #[serde(default)]
    pub require: bool,

    /// Push this input's value into a dependency tile's input
    #[serde(default, rename = "override")]
    pub override_target: Option<InputOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDependency {
    /// Reference name in the tile's dependencies
    pub name: String,
    pub field: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputOverride {
    /// Reference name in the tile's dependencies
    pub name: String,
    pub field: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileManifest {
    #[serde(default)]
    pub manifest_type: Option<ManifestType>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub folders: Vec<String>,
    #[serde(default)]
    pub flags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TileOutput {
    pub name: String,

    #[serde(default)]
    pub output_type: IoType,

    #[serde(default)]
    pub default_value: Option<serde_yaml_ng::Value>,

    /// Shell command whose stdout becomes the value
    #[serde(default)]
    pub default_value_command: Option<String>,

    #[serde(default)]
    pub description: Option<String>,
}

// ============================================================================
// Deployment
// ============================================================================

/// A document instantiating tiles with concrete overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Deployment {
    pub api_version: String,
    pub kind: String,
    pub metadata: DeploymentMetadata,
    pub spec: DeploymentSpec,
}

impl Deployment {
    /// Instance ids in the literal key order of the document.
    pub fn original_order(&self) -> Vec<&str> {
        self.spec.template.tiles.keys().map(String::as_str).collect()
    }

    pub fn instance(&self, id: &str) -> Option<&DeploymentTile> {
        self.spec.template.tiles.get(id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentMetadata {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub template: DeploymentTemplate,
    #[serde(default)]
    pub summary: DeploymentSummary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentTemplate {
    /// Instance id → instance (order-preserving)
    pub tiles: IndexMap<String, DeploymentTile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentTile {
    pub tile_reference: String,
    pub tile_version: String,

    /// Instances that must be done first
    #[serde(default)]
    pub depends_on: Vec<String>,

    #[serde(default)]
    pub inputs: Vec<DeploymentInput>,

    #[serde(default)]
    pub manifests: Option<TileManifest>,

    #[serde(default)]
    pub region: Option<String>,

    #[serde(default)]
    pub profile: Option<String>,
}

impl DeploymentTile {
    pub fn input(&self, name: &str) -> Option<&DeploymentInput> {
        self.inputs.iter().find(|i| i.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentInput {
    pub name: String,
    #[serde(default)]
    pub input_value: Option<serde_yaml_ng::Value>,
    #[serde(default)]
    pub input_values: Vec<serde_yaml_ng::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentSummary {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub outputs: Vec<SummaryOutput>,
    #[serde(default)]
    pub notes: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryOutput {
    pub name: String,
    pub value: String,
}

// ============================================================================
// Value helper
// ============================================================================

/// Convert a serde_yaml_ng::Value to its plain string form.
pub fn yaml_value_to_string(val: &serde_yaml_ng::Value) -> String {
    match val {
        serde_yaml_ng::Value::String(s) => s.clone(),
        serde_yaml_ng::Value::Number(n) => n.to_string(),
        serde_yaml_ng::Value::Bool(b) => b.to_string(),
        serde_yaml_ng::Value::Null => String::new(),
        other => serde_yaml_ng::to_string(other)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    }
}
