//! Per-run instance registry.
//!
//! An arena of [`TileInstanceNode`]s keyed by instance id, with the resolved
//! [`Stack`] and live [`OutputSet`] of each instance stored under the same key.
//! Parent, root and dependency relations are plain id lookups. Registration
//! order is preserved and serves as the final tie-break for execution order.

use super::error::{Error, Result};
use super::types::{yaml_value_to_string, Category, IoType, ManifestType, Tile};
use heck::{ToLowerCamelCase, ToShoutySnakeCase, ToUpperCamelCase};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;

// ============================================================================
// Status
// ============================================================================

/// Lifecycle of one instance within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    Created,
    Progress,
    Done,
    Interrupted,
}

impl StageStatus {
    /// Forward-only transitions: Created → Progress → Done, and
    /// Created|Progress → Interrupted.
    pub fn can_transition_to(self, next: StageStatus) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Progress)
                | (Self::Created, Self::Interrupted)
                | (Self::Progress, Self::Done)
                | (Self::Progress, Self::Interrupted)
        )
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Progress => write!(f, "Progress"),
            Self::Done => write!(f, "Done"),
            Self::Interrupted => write!(f, "Interrupted"),
        }
    }
}

// ============================================================================
// Node / Stack / OutputSet
// ============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct TileInstanceNode {
    pub instance: String,
    /// Rank of the top-level instance this node was resolved under
    pub executable_order: u32,
    pub tile_name: String,
    pub tile_version: String,
    pub category: Category,
    /// Family this instance belongs to
    pub root_instance: String,
    /// Instances that depend on this one; outputs propagate to them
    pub parent_instances: Vec<String>,
    /// Instances that must be Done before this one starts
    pub dependencies: Vec<String>,
    pub status: StageStatus,
    /// Pulled in by a tile dependency rather than declared in the deployment
    pub generated: bool,
}

impl TileInstanceNode {
    pub fn new(instance: &str, tile: &Tile, rank: u32, root: &str) -> Self {
        Self {
            instance: instance.to_string(),
            executable_order: rank,
            tile_name: tile.metadata.name.clone(),
            tile_version: tile.metadata.version.clone(),
            category: tile.metadata.category,
            root_instance: root.to_string(),
            parent_instances: Vec::new(),
            dependencies: Vec::new(),
            status: StageStatus::Created,
            generated: false,
        }
    }
}

/// Where an input's value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InputSource {
    Reference,
    Directive,
    Deployment,
    Default,
    Unset,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputParameter {
    pub name: String,
    pub value: String,
    pub input_type: IoType,
    /// Value came from a deployment override or an override directive
    pub is_override: bool,
    pub source: InputSource,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StackManifest {
    pub manifest_type: Option<ManifestType>,
    pub namespace: String,
    pub files: Vec<String>,
    pub folders: Vec<String>,
    pub flags: Vec<String>,
}

/// Fully resolved, renderable form of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct Stack {
    pub instance: String,
    pub tile_name: String,
    pub tile_version: String,
    pub category: Category,
    /// Unpacked tile bundle
    pub tile_folder: PathBuf,
    pub tile_variable: String,
    pub tile_stack_name: String,
    pub tile_stack_variable: String,
    pub input_parameters: IndexMap<String, InputParameter>,
    pub manifest: StackManifest,
    pub region: Option<String>,
    pub profile: Option<String>,
}

impl Stack {
    pub fn input(&self, name: &str) -> Option<&str> {
        self.input_parameters.get(name).map(|p| p.value.as_str())
    }
}

/// Generated variable for a tile inside infra-as-code source.
pub fn tile_variable(tile_name: &str) -> String {
    tile_name.to_lower_camel_case()
}

/// Generated variable for an instance's stack.
pub fn stack_variable(instance: &str) -> String {
    format!("{}Stack", instance.to_lower_camel_case())
}

/// Deployable stack name for an instance.
pub fn stack_name(instance: &str) -> String {
    format!("{}Stack", instance.to_upper_camel_case())
}

/// Environment variable carrying a dependency's output at run time.
pub fn dependency_env_name(tile_name: &str, field: &str) -> String {
    format!(
        "D_TBD_{}_{}",
        tile_name.to_shouty_snake_case(),
        field.to_shouty_snake_case()
    )
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputDetail {
    pub name: String,
    pub output_type: IoType,
    pub default_value: Option<String>,
    pub default_value_command: Option<String>,
    pub description: Option<String>,
    /// Last extracted value; empty until the stage has produced it
    pub value: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OutputSet {
    pub tile_name: String,
    pub tile_version: String,
    /// Declaration order is kept
    pub outputs: IndexMap<String, OutputDetail>,
}

impl OutputSet {
    pub fn from_tile(tile: &Tile) -> Self {
        let outputs = tile
            .spec
            .outputs
            .iter()
            .map(|o| {
                let detail = OutputDetail {
                    name: o.name.clone(),
                    output_type: o.output_type,
                    default_value: o
                        .default_value
                        .as_ref()
                        .map(yaml_value_to_string)
                        .filter(|v| !v.is_empty()),
                    default_value_command: o.default_value_command.clone(),
                    description: o.description.clone(),
                    value: String::new(),
                };
                (o.name.clone(), detail)
            })
            .collect();
        Self {
            tile_name: tile.metadata.name.clone(),
            tile_version: tile.metadata.version.clone(),
            outputs,
        }
    }

    /// Current value, if one has been extracted.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.outputs
            .get(name)
            .map(|o| o.value.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, name: &str, value: &str) {
        match self.outputs.get_mut(name) {
            Some(o) => o.value = value.to_string(),
            None => {
                self.outputs.insert(
                    name.to_string(),
                    OutputDetail {
                        name: name.to_string(),
                        output_type: IoType::String,
                        default_value: None,
                        default_value_command: None,
                        description: None,
                        value: value.to_string(),
                    },
                );
            }
        }
    }

    /// Outputs that currently hold a value.
    pub fn known(&self) -> impl Iterator<Item = &OutputDetail> {
        self.outputs.values().filter(|o| !o.value.is_empty())
    }
}

// ============================================================================
// Registry
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct Registry {
    nodes: IndexMap<String, TileInstanceNode>,
    stacks: HashMap<String, Stack>,
    outputs: HashMap<String, OutputSet>,
    tiles: HashMap<String, Tile>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// Register a node with its tile. Every parent and dependency the node
    /// names must already be present. Returns false if the id was taken.
    pub fn register(&mut self, node: TileInstanceNode, tile: Tile) -> Result<bool> {
        if self.nodes.contains_key(&node.instance) {
            return Ok(false);
        }
        if let Some(missing) = node
            .parent_instances
            .iter()
            .chain(node.dependencies.iter())
            .find(|id| !self.nodes.contains_key(id.as_str()))
        {
            return Err(Error::MissingInstance(missing.clone()));
        }
        let id = node.instance.clone();
        for dep in &node.dependencies {
            if let Some(d) = self.nodes.get_mut(dep) {
                push_unique(&mut d.parent_instances, &id);
            }
        }
        self.outputs.insert(id.clone(), OutputSet::from_tile(&tile));
        self.tiles.insert(id.clone(), tile);
        self.nodes.insert(id, node);
        Ok(true)
    }

    pub fn set_stack(&mut self, stack: Stack) -> Result<()> {
        if !self.nodes.contains_key(&stack.instance) {
            return Err(Error::MissingInstance(stack.instance));
        }
        self.stacks.insert(stack.instance.clone(), stack);
        Ok(())
    }

    /// Record that `dependent` must wait for `dependency`.
    pub fn link(&mut self, dependent: &str, dependency: &str) -> Result<()> {
        if !self.nodes.contains_key(dependency) {
            return Err(Error::MissingInstance(dependency.to_string()));
        }
        let node = self
            .nodes
            .get_mut(dependent)
            .ok_or_else(|| Error::MissingInstance(dependent.to_string()))?;
        push_unique(&mut node.dependencies, dependency);
        if let Some(dep) = self.nodes.get_mut(dependency) {
            push_unique(&mut dep.parent_instances, dependent);
        }
        Ok(())
    }

    pub fn node(&self, id: &str) -> Option<&TileInstanceNode> {
        self.nodes.get(id)
    }

    pub fn stack(&self, id: &str) -> Option<&Stack> {
        self.stacks.get(id)
    }

    pub fn stack_mut(&mut self, id: &str) -> Option<&mut Stack> {
        self.stacks.get_mut(id)
    }

    pub fn outputs(&self, id: &str) -> Option<&OutputSet> {
        self.outputs.get(id)
    }

    pub fn tile(&self, id: &str) -> Option<&Tile> {
        self.tiles.get(id)
    }

    /// Nodes in registration order.
    pub fn nodes(&self) -> impl Iterator<Item = &TileInstanceNode> {
        self.nodes.values()
    }

    /// The instance of `tile_name` already resolved under `root`, if any.
    pub fn family_member(&self, root: &str, tile_name: &str) -> Option<&str> {
        self.nodes
            .values()
            .find(|n| n.root_instance == root && n.tile_name == tile_name)
            .map(|n| n.instance.as_str())
    }

    pub fn status(&self, id: &str) -> Option<StageStatus> {
        self.nodes.get(id).map(|n| n.status)
    }

    /// Move an instance forward. Backward or repeated transitions are refused
    /// and reported as `false`.
    pub fn set_status(&mut self, id: &str, next: StageStatus) -> Result<bool> {
        let node = self
            .nodes
            .get_mut(id)
            .ok_or_else(|| Error::MissingInstance(id.to_string()))?;
        if !node.status.can_transition_to(next) {
            tracing::warn!(
                instance = id,
                from = %node.status,
                to = %next,
                "refusing status transition"
            );
            return Ok(false);
        }
        node.status = next;
        Ok(true)
    }

    pub fn record_output(&mut self, id: &str, name: &str, value: &str) -> Result<()> {
        let set = self
            .outputs
            .get_mut(id)
            .ok_or_else(|| Error::MissingInstance(id.to_string()))?;
        set.set(name, value);
        Ok(())
    }

    /// Copy every known output of `id` into each direct parent's output set.
    /// Returns the number of parents updated.
    pub fn propagate_outputs(&mut self, id: &str) -> Result<usize> {
        let node = self
            .nodes
            .get(id)
            .ok_or_else(|| Error::MissingInstance(id.to_string()))?;
        let parents = node.parent_instances.clone();
        let known: Vec<(String, String)> = self
            .outputs
            .get(id)
            .map(|s| s.known().map(|o| (o.name.clone(), o.value.clone())).collect())
            .unwrap_or_default();
        let mut updated = 0;
        for parent in &parents {
            if let Some(set) = self.outputs.get_mut(parent) {
                for (name, value) in &known {
                    set.set(name, value);
                }
                updated += 1;
            }
        }
        Ok(updated)
    }

    /// Nodes ordered by executable rank, ties broken by registration order.
    pub fn sorted_grid(&self) -> Vec<&TileInstanceNode> {
        let mut grid: Vec<&TileInstanceNode> = self.nodes.values().collect();
        grid.sort_by_key(|n| n.executable_order);
        grid
    }

    /// Topological order over `dependencies` (Kahn's algorithm). Among ready
    /// instances the earliest in the sorted grid goes first.
    pub fn execution_order(&self) -> Result<Vec<String>> {
        let grid = self.sorted_grid();
        let position: HashMap<&str, usize> = grid
            .iter()
            .enumerate()
            .map(|(i, n)| (n.instance.as_str(), i))
            .collect();

        let mut in_degree: Vec<usize> = vec![0; grid.len()];
        let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); grid.len()];
        for (i, node) in grid.iter().enumerate() {
            for dep in &node.dependencies {
                let d = *position
                    .get(dep.as_str())
                    .ok_or_else(|| Error::MissingInstance(dep.clone()))?;
                adjacency[d].push(i);
                in_degree[i] += 1;
            }
        }

        let mut ready: BTreeSet<usize> = (0..grid.len()).filter(|&i| in_degree[i] == 0).collect();
        let mut order = Vec::with_capacity(grid.len());
        while let Some(current) = ready.pop_first() {
            order.push(grid[current].instance.clone());
            for &next in &adjacency[current] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != grid.len() {
            let ordered: HashSet<&str> = order.iter().map(String::as_str).collect();
            let members: Vec<&str> = grid
                .iter()
                .map(|n| n.instance.as_str())
                .filter(|id| !ordered.contains(id))
                .collect();
            return Err(Error::DependencyCycle(members.join(", ")));
        }
        Ok(order)
    }

    /// Every instance `id` waits on, directly or transitively.
    pub fn transitive_dependencies(&self, id: &str) -> Vec<String> {
        let mut seen: HashSet<&str> = HashSet::new();
        let mut out = Vec::new();
        let mut queue: VecDeque<&str> = VecDeque::new();
        queue.push_back(id);
        while let Some(current) = queue.pop_front() {
            let Some(node) = self.nodes.get(current) else {
                continue;
            };
            for dep in &node.dependencies {
                if seen.insert(dep.as_str()) {
                    out.push(dep.clone());
                    queue.push_back(dep.as_str());
                }
            }
        }
        out
    }

    /// Family roots in first-seen order, each with its member ids.
    pub fn families(&self) -> IndexMap<String, Vec<String>> {
        let mut families: IndexMap<String, Vec<String>> = IndexMap::new();
        for node in self.nodes.values() {
            families
                .entry(node.root_instance.clone())
                .or_default()
                .push(node.instance.clone());
        }
        families
    }
}

fn push_unique(list: &mut Vec<String>, id: &str) {
    if !list.iter().any(|x| x == id) {
        list.push(id.to_string());
    }
}
