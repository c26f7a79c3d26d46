//! Tile graph resolution.
//!
//! Turns a Deployment into a populated [`Registry`]: one node, stack and
//! output set per instance, including instances pulled in only because a
//! requested tile depends on them. Instances are processed in original order;
//! an instance whose `dependsOn` targets are not resolved yet is deferred.
//!
//! Input precedence, per input:
//! 1. structural reference to a dependency tile's field
//! 2. override directive recorded by a tile higher in the family
//! 3. deployment-declared value
//! 4. tile default
//!
//! A required input with none of these fails the whole resolution.

use super::error::{Error, Result};
use super::registry::{
    dependency_env_name, stack_name, stack_variable, tile_variable, InputParameter, InputSource,
    Registry, Stack, StackManifest, TileInstanceNode,
};
use super::types::*;
use crate::repo::{TileBundle, TileSource};
use indexmap::IndexMap;
use std::collections::HashMap;

/// Override directives for one run, keyed by (root, target tile, field).
#[derive(Debug, Clone, Default)]
pub struct OverrideTable {
    entries: HashMap<(String, String, String), String>,
}

impl OverrideTable {
    pub fn record(&mut self, root: &str, tile: &str, field: &str, value: String) {
        self.entries
            .insert((root.to_string(), tile.to_string(), field.to_string()), value);
    }

    pub fn get(&self, root: &str, tile: &str, field: &str) -> Option<&str> {
        self.entries
            .get(&(root.to_string(), tile.to_string(), field.to_string()))
            .map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-instance context that does not live on the node.
struct Placement<'d> {
    declared: Option<&'d DeploymentTile>,
    region: Option<String>,
    profile: Option<String>,
}

pub struct TileGraphResolver<'a> {
    source: &'a dyn TileSource,
    registry: &'a mut Registry,
    overrides: OverrideTable,
    next_rank: u32,
}

impl<'a> TileGraphResolver<'a> {
    pub fn new(source: &'a dyn TileSource, registry: &'a mut Registry) -> Self {
        Self {
            source,
            registry,
            overrides: OverrideTable::default(),
            next_rank: 0,
        }
    }

    /// Resolve every declared instance and its transitive tile dependencies.
    pub fn resolve(mut self, deployment: &Deployment) -> Result<OverrideTable> {
        let tiles = &deployment.spec.template.tiles;
        for (id, declared) in tiles {
            if let Some(dep) = declared.depends_on.iter().find(|d| !tiles.contains_key(*d)) {
                return Err(Error::UnknownDependency {
                    instance: id.clone(),
                    dependency: dep.clone(),
                });
            }
        }

        let mut deferred: Vec<&str> = Vec::new();
        for id in deployment.original_order() {
            let declared = &tiles[id];
            if self.parents_resolved(declared) {
                self.resolve_declared(id, declared)?;
            } else {
                tracing::debug!(instance = id, "deferring until dependsOn targets resolve");
                deferred.push(id);
            }
        }

        while !deferred.is_empty() {
            let before = deferred.len();
            let mut waiting = Vec::new();
            for id in deferred {
                let declared = &tiles[id];
                if self.parents_resolved(declared) {
                    self.resolve_declared(id, declared)?;
                } else {
                    waiting.push(id);
                }
            }
            if waiting.len() == before {
                return Err(Error::DependencyCycle(waiting.join(", ")));
            }
            deferred = waiting;
        }

        tracing::info!(
            deployment = %deployment.metadata.name,
            instances = self.registry.len(),
            directives = self.overrides.len(),
            "resolved tile graph"
        );
        Ok(self.overrides)
    }

    fn parents_resolved(&self, declared: &DeploymentTile) -> bool {
        declared.depends_on.iter().all(|d| self.registry.contains(d))
    }

    fn resolve_declared(&mut self, id: &str, declared: &DeploymentTile) -> Result<()> {
        let root = declared
            .depends_on
            .first()
            .and_then(|d| self.registry.node(d))
            .map(|n| n.root_instance.clone())
            .unwrap_or_else(|| id.to_string());
        let rank = self.next_rank;
        self.next_rank += 1;

        let bundle = self.fetch(id, &declared.tile_reference, &declared.tile_version)?;
        let mut node = TileInstanceNode::new(id, &bundle.tile, rank, &root);
        node.dependencies = declared.depends_on.clone();
        let placement = Placement {
            declared: Some(declared),
            region: declared.region.clone(),
            profile: declared.profile.clone(),
        };
        self.resolve_instance(node, bundle, placement)
    }

    fn fetch(&self, instance: &str, name: &str, version: &str) -> Result<TileBundle> {
        self.source
            .fetch(name, version)
            .map_err(|e| Error::TileFetch {
                instance: instance.to_string(),
                tile: name.to_string(),
                version: version.to_string(),
                reason: e.to_string(),
            })
    }

    fn resolve_instance(
        &mut self,
        node: TileInstanceNode,
        bundle: TileBundle,
        placement: Placement<'_>,
    ) -> Result<()> {
        let id = node.instance.clone();
        let root = node.root_instance.clone();
        let rank = node.executable_order;
        let TileBundle { tile, folder } = bundle;

        self.registry.register(node, tile.clone())?;
        tracing::debug!(instance = %id, tile = %tile.metadata.name, root = %root, "registered instance");

        self.record_directives(&id, &root, &tile, placement.declared)?;

        let mut dep_instances: HashMap<&str, String> = HashMap::new();
        for dep in &tile.spec.dependencies {
            if let Some(existing) = self.registry.family_member(&root, &dep.tile_reference) {
                let existing = existing.to_string();
                self.registry.link(&id, &existing)?;
                dep_instances.insert(dep.name.as_str(), existing);
                continue;
            }
            let child_id = format!("{}-{}-generated", dep.tile_reference, root);
            let child_bundle = self.fetch(&child_id, &dep.tile_reference, &dep.tile_version)?;
            let mut child = TileInstanceNode::new(&child_id, &child_bundle.tile, rank, &root);
            child.generated = true;
            child.parent_instances.push(id.clone());
            let child_placement = Placement {
                declared: None,
                region: placement.region.clone(),
                profile: placement.profile.clone(),
            };
            self.resolve_instance(child, child_bundle, child_placement)?;
            self.registry.link(&id, &child_id)?;
            dep_instances.insert(dep.name.as_str(), child_id);
        }

        let input_parameters =
            self.compute_inputs(&id, &root, &tile, placement.declared, &dep_instances)?;
        let stack = Stack {
            instance: id.clone(),
            tile_name: tile.metadata.name.clone(),
            tile_version: tile.metadata.version.clone(),
            category: tile.metadata.category,
            tile_folder: folder,
            tile_variable: tile_variable(&tile.metadata.name),
            tile_stack_name: stack_name(&id),
            tile_stack_variable: stack_variable(&id),
            input_parameters,
            manifest: merge_manifest(
                tile.spec.manifests.as_ref(),
                placement.declared.and_then(|d| d.manifests.as_ref()),
            ),
            region: placement.region,
            profile: placement.profile,
        };
        self.registry.set_stack(stack)
    }

    /// Record this tile's override directives before its dependencies resolve,
    /// and patch targets that were resolved earlier in the family.
    fn record_directives(
        &mut self,
        id: &str,
        root: &str,
        tile: &Tile,
        declared: Option<&DeploymentTile>,
    ) -> Result<()> {
        for input in &tile.spec.inputs {
            let Some(target) = &input.override_target else {
                continue;
            };
            let dep = tile
                .dependency(&target.name)
                .ok_or_else(|| Error::UndeclaredTileDependency {
                    instance: id.to_string(),
                    tile: tile.metadata.name.clone(),
                    dependency: target.name.clone(),
                })?;
            let value = self
                .overrides
                .get(root, &tile.metadata.name, &input.name)
                .map(str::to_string)
                .or_else(|| declared_value(declared, input))
                .or_else(|| default_value(input));
            let Some(value) = value else {
                continue;
            };
            tracing::debug!(
                instance = id,
                target = %dep.tile_reference,
                field = %target.field,
                "recording override directive"
            );
            self.overrides
                .record(root, &dep.tile_reference, &target.field, value.clone());

            let existing = self
                .registry
                .family_member(root, &dep.tile_reference)
                .map(str::to_string);
            if let Some(existing) = existing {
                if let Some(stack) = self.registry.stack_mut(&existing) {
                    if let Some(param) = stack.input_parameters.get_mut(&target.field) {
                        if param.source != InputSource::Reference {
                            param.value = value;
                            param.is_override = true;
                            param.source = InputSource::Directive;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn compute_inputs(
        &self,
        id: &str,
        root: &str,
        tile: &Tile,
        declared: Option<&DeploymentTile>,
        dep_instances: &HashMap<&str, String>,
    ) -> Result<IndexMap<String, InputParameter>> {
        let mut params = IndexMap::new();
        for input in &tile.spec.inputs {
            let (value, source) = if !input.dependencies.is_empty() {
                (
                    self.structural_value(id, tile, input, dep_instances)?,
                    InputSource::Reference,
                )
            } else if let Some(v) = self.overrides.get(root, &tile.metadata.name, &input.name) {
                (v.to_string(), InputSource::Directive)
            } else if let Some(v) = declared_value(declared, input) {
                (v, InputSource::Deployment)
            } else if let Some(v) = default_value(input) {
                (v, InputSource::Default)
            } else if input.require {
                return Err(Error::MandatoryInputUnmet {
                    instance: id.to_string(),
                    tile: tile.metadata.name.clone(),
                    input: input.name.clone(),
                });
            } else {
                (String::new(), InputSource::Unset)
            };
            params.insert(
                input.name.clone(),
                InputParameter {
                    name: input.name.clone(),
                    value,
                    input_type: input.input_type,
                    is_override: matches!(source, InputSource::Directive | InputSource::Deployment),
                    source,
                },
            );
        }
        Ok(params)
    }

    fn structural_value(
        &self,
        id: &str,
        tile: &Tile,
        input: &TileInput,
        dep_instances: &HashMap<&str, String>,
    ) -> Result<String> {
        let mut refs = Vec::with_capacity(input.dependencies.len());
        for d in &input.dependencies {
            let instance = dep_instances
                .get(d.name.as_str())
                .ok_or_else(|| Error::UndeclaredTileDependency {
                    instance: id.to_string(),
                    tile: tile.metadata.name.clone(),
                    dependency: d.name.clone(),
                })?;
            let dep_tile = self
                .registry
                .node(instance)
                .map(|n| n.tile_name.clone())
                .ok_or_else(|| Error::MissingInstance(instance.clone()))?;
            let rendered = if tile.category().is_application() {
                format!("${}", dependency_env_name(&dep_tile, &d.field))
            } else {
                format!(
                    "{}.{}.{}",
                    stack_variable(instance),
                    tile_variable(&dep_tile),
                    d.field
                )
            };
            refs.push(rendered);
        }
        Ok(match refs.len() {
            1 => refs.remove(0),
            _ => format!("[{}]", refs.join(", ")),
        })
    }
}

fn declared_value(declared: Option<&DeploymentTile>, input: &TileInput) -> Option<String> {
    let d = declared?.input(&input.name)?;
    format_value(input.input_type, d.input_value.as_ref(), &d.input_values)
}

fn default_value(input: &TileInput) -> Option<String> {
    format_value(input.input_type, input.default_value.as_ref(), &input.default_values)
}

/// Render a value for its declared type: quoted if string-like, bracketed
/// and comma-joined if an array.
pub fn format_value(
    io_type: IoType,
    value: Option<&serde_yaml_ng::Value>,
    values: &[serde_yaml_ng::Value],
) -> Option<String> {
    let quote = |s: String| {
        if io_type.is_string_like() {
            format!("\"{}\"", s)
        } else {
            s
        }
    };
    if io_type.is_array() {
        let items: Vec<String> = if values.is_empty() {
            value.into_iter().map(yaml_value_to_string).collect()
        } else {
            values.iter().map(yaml_value_to_string).collect()
        };
        let items: Vec<String> = items.into_iter().filter(|s| !s.is_empty()).collect();
        if items.is_empty() {
            return None;
        }
        return Some(format!(
            "[{}]",
            items.into_iter().map(quote).collect::<Vec<_>>().join(", ")
        ));
    }
    let raw = value
        .map(yaml_value_to_string)
        .or_else(|| values.first().map(yaml_value_to_string))?;
    if raw.is_empty() {
        return None;
    }
    Some(quote(raw))
}

/// Deployment manifest fields win over the tile's when present.
fn merge_manifest(tile: Option<&TileManifest>, declared: Option<&TileManifest>) -> StackManifest {
    let empty = TileManifest::default();
    let t = tile.unwrap_or(&empty);
    let d = declared.unwrap_or(&empty);
    let pick = |a: &Vec<String>, b: &Vec<String>| if a.is_empty() { b.clone() } else { a.clone() };
    StackManifest {
        manifest_type: d.manifest_type.or(t.manifest_type),
        namespace: d
            .namespace
            .clone()
            .or_else(|| t.namespace.clone())
            .unwrap_or_default(),
        files: pick(&d.files, &t.files),
        folders: pick(&d.folders, &t.folders),
        flags: pick(&d.flags, &t.flags),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::core::parser::parse_deployment;
    use crate::repo::StaticTileSource;

    pub(crate) const NETWORK: &str = r#"
apiVersion: mahjong.io/v1alpha1
kind: Tile
metadata:
  name: Network0
  category: Network
  version: 0.0.1
spec:
  inputs:
    - name: cidr
      inputType: String
      defaultValue: 10.0.0.0/16
  outputs:
    - name: baseVpc
      outputType: CDKObject
"#;

    pub(crate) const EKS: &str = r#"
apiVersion: mahjong.io/v1alpha1
kind: Tile
metadata:
  name: Eks0
  category: ContainerProvider
  vendorService: EKS
  version: 0.0.5
spec:
  dependencies:
    - name: network
      tileReference: Network0
      tileVersion: 0.0.1
  inputs:
    - name: vpc
      inputType: CDKObject
      dependencies:
        - name: network
          field: baseVpc
    - name: cidr
      inputType: String
      override:
        name: network
        field: cidr
    - name: clusterName
      inputType: String
      require: true
    - name: capacity
      inputType: Number
      defaultValue: 2
  outputs:
    - name: clusterName
      outputType: String
    - name: masterRoleARN
      outputType: String
"#;

    pub(crate) const APP: &str = r#"
apiVersion: mahjong.io/v1alpha1
kind: Tile
metadata:
  name: App0
  category: ContainerApplication
  dependentOnVendorService: EKS
  version: 0.1.0
spec:
  dependencies:
    - name: eks
      tileReference: Eks0
      tileVersion: 0.0.5
  inputs:
    - name: cluster
      dependencies:
        - name: eks
          field: clusterName
    - name: replicas
      inputType: Number
      defaultValue: 1
  manifests:
    manifestType: K8s
    namespace: app
    files: [deploy.yaml]
  outputs:
    - name: endpoint
      defaultValueCommand: kubectl get svc app -o name
"#;

    pub(crate) fn source() -> StaticTileSource {
        StaticTileSource::new()
            .with_folder("/bundles")
            .with_yaml(NETWORK)
            .unwrap()
            .with_yaml(EKS)
            .unwrap()
            .with_yaml(APP)
            .unwrap()
    }

    pub(crate) fn resolve_yaml(src: &StaticTileSource, yaml: &str) -> Result<Registry> {
        let deployment = parse_deployment(yaml.as_bytes())?;
        let mut registry = Registry::new();
        TileGraphResolver::new(src, &mut registry).resolve(&deployment)?;
        Ok(registry)
    }

    fn deployment(tiles: &str) -> String {
        format!(
            "apiVersion: mahjong.io/v1alpha1\nkind: Deployment\nmetadata:\n  name: test\nspec:\n  template:\n    tiles:\n{}",
            tiles
        )
    }

    const EKS_ONLY: &str = r#"      eks:
        tileReference: Eks0
        tileVersion: 0.0.5
        inputs:
          - name: clusterName
            inputValue: demo
"#;

    #[test]
    fn test_resolver_pulls_transitive_dependency() {
        let reg = resolve_yaml(&source(), &deployment(EKS_ONLY)).unwrap();
        assert_eq!(reg.len(), 2);
        let generated = reg.node("Network0-eks-generated").unwrap();
        assert!(generated.generated);
        assert_eq!(generated.root_instance, "eks");
        assert_eq!(generated.parent_instances, vec!["eks"]);
        assert_eq!(reg.node("eks").unwrap().dependencies, vec!["Network0-eks-generated"]);
        assert_eq!(
            reg.execution_order().unwrap(),
            vec!["Network0-eks-generated", "eks"]
        );
    }

    #[test]
    fn test_resolver_structural_reference() {
        let reg = resolve_yaml(&source(), &deployment(EKS_ONLY)).unwrap();
        let stack = reg.stack("eks").unwrap();
        assert_eq!(
            stack.input("vpc").unwrap(),
            format!("{}.network0.baseVpc", stack_variable("Network0-eks-generated"))
        );
        assert_eq!(
            stack.input_parameters["vpc"].source,
            InputSource::Reference
        );
        assert_eq!(stack.input("clusterName"), Some("\"demo\""));
        assert_eq!(stack.input("capacity"), Some("2"));
        assert!(!stack.input_parameters["capacity"].is_override);
        assert_eq!(stack.tile_folder, std::path::PathBuf::from("/bundles/Eks0/0.0.5"));
    }

    #[test]
    fn test_resolver_depends_on_links_declared_instance() {
        let yaml = deployment(
            r#"      net:
        tileReference: Network0
        tileVersion: 0.0.1
      eks:
        tileReference: Eks0
        tileVersion: 0.0.5
        dependsOn: [net]
        inputs:
          - name: clusterName
            inputValue: demo
"#,
        );
        let reg = resolve_yaml(&source(), &yaml).unwrap();
        // Network0 is shared, not duplicated
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.node("eks").unwrap().root_instance, "net");
        assert_eq!(reg.node("net").unwrap().parent_instances, vec!["eks"]);
        assert_eq!(reg.execution_order().unwrap(), vec!["net", "eks"]);
    }

    #[test]
    fn test_resolver_defers_until_parent_resolved() {
        let yaml = deployment(
            r#"      eks:
        tileReference: Eks0
        tileVersion: 0.0.5
        dependsOn: [net]
        inputs:
          - name: clusterName
            inputValue: demo
      net:
        tileReference: Network0
        tileVersion: 0.0.1
"#,
        );
        let reg = resolve_yaml(&source(), &yaml).unwrap();
        assert_eq!(reg.node("net").unwrap().executable_order, 0);
        assert_eq!(reg.node("eks").unwrap().executable_order, 1);
        assert_eq!(reg.execution_order().unwrap(), vec!["net", "eks"]);
    }

    #[test]
    fn test_resolver_mandatory_input_unmet() {
        let yaml = deployment(
            "      eks:\n        tileReference: Eks0\n        tileVersion: 0.0.5\n",
        );
        let err = resolve_yaml(&source(), &yaml).unwrap_err();
        match err {
            Error::MandatoryInputUnmet { instance, tile, input } => {
                assert_eq!(instance, "eks");
                assert_eq!(tile, "Eks0");
                assert_eq!(input, "clusterName");
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[test]
    fn test_resolver_unknown_dependency() {
        let yaml = deployment(
            "      net:\n        tileReference: Network0\n        tileVersion: 0.0.1\n        dependsOn: [vpc]\n",
        );
        let err = resolve_yaml(&source(), &yaml).unwrap_err();
        assert!(matches!(err, Error::UnknownDependency { ref dependency, .. } if dependency == "vpc"));
        assert_eq!(err.instance(), Some("net"));
    }

    #[test]
    fn test_resolver_fetch_failure_keeps_siblings() {
        let yaml = deployment(
            r#"      net:
        tileReference: Network0
        tileVersion: 0.0.1
      db:
        tileReference: Rds0
        tileVersion: 1.0.0
"#,
        );
        let deployment = parse_deployment(yaml.as_bytes()).unwrap();
        let src = source();
        let mut registry = Registry::new();
        let err = TileGraphResolver::new(&src, &mut registry)
            .resolve(&deployment)
            .unwrap_err();
        assert!(matches!(err, Error::TileFetch { ref instance, .. } if instance == "db"));
        assert!(registry.contains("net"));
    }

    #[test]
    fn test_resolver_application_defers_to_env() {
        let yaml = deployment(
            r#"      app:
        tileReference: App0
        tileVersion: 0.1.0
        inputs:
          - name: clusterName
            inputValue: demo
"#,
        );
        // the generated Eks0 has no deployment entry to supply clusterName
        let err = resolve_yaml(&source(), &yaml).unwrap_err();
        assert!(matches!(err, Error::MandatoryInputUnmet { ref tile, .. } if tile == "Eks0"));

        let with_eks = deployment(
            r#"      eks:
        tileReference: Eks0
        tileVersion: 0.0.5
        inputs:
          - name: clusterName
            inputValue: demo
      app:
        tileReference: App0
        tileVersion: 0.1.0
        dependsOn: [eks]
"#,
        );
        let reg = resolve_yaml(&source(), &with_eks).unwrap();
        let app = reg.stack("app").unwrap();
        assert_eq!(app.input("cluster"), Some("$D_TBD_EKS0_CLUSTER_NAME"));
        assert_eq!(app.manifest.namespace, "app");
        assert_eq!(app.manifest.files, vec!["deploy.yaml"]);
        assert_eq!(reg.len(), 3);
        assert_eq!(
            reg.execution_order().unwrap(),
            vec!["Network0-eks-generated", "eks", "app"]
        );
    }

    #[test]
    fn test_resolver_directive_beats_target_default() {
        let yaml = deployment(
            r#"      eks:
        tileReference: Eks0
        tileVersion: 0.0.5
        inputs:
          - name: clusterName
            inputValue: demo
          - name: cidr
            inputValue: 10.9.0.0/16
"#,
        );
        let reg = resolve_yaml(&source(), &yaml).unwrap();
        let net = reg.stack("Network0-eks-generated").unwrap();
        assert_eq!(net.input("cidr"), Some("\"10.9.0.0/16\""));
        assert_eq!(net.input_parameters["cidr"].source, InputSource::Directive);
        assert!(net.input_parameters["cidr"].is_override);
    }

    #[test]
    fn test_resolver_directive_beats_deployment_value() {
        let yaml = deployment(
            r#"      net:
        tileReference: Network0
        tileVersion: 0.0.1
        inputs:
          - name: cidr
            inputValue: 10.1.0.0/16
      eks:
        tileReference: Eks0
        tileVersion: 0.0.5
        dependsOn: [net]
        inputs:
          - name: clusterName
            inputValue: demo
          - name: cidr
            inputValue: 10.9.0.0/16
"#,
        );
        let reg = resolve_yaml(&source(), &yaml).unwrap();
        // net resolved first with its own value; eks's directive patches it
        assert_eq!(reg.stack("net").unwrap().input("cidr"), Some("\"10.9.0.0/16\""));
    }

    #[test]
    fn test_resolver_deployment_value_without_directive() {
        let yaml = deployment(
            r#"      net:
        tileReference: Network0
        tileVersion: 0.0.1
        inputs:
          - name: cidr
            inputValue: 10.1.0.0/16
"#,
        );
        let reg = resolve_yaml(&source(), &yaml).unwrap();
        let net = reg.stack("net").unwrap();
        assert_eq!(net.input("cidr"), Some("\"10.1.0.0/16\""));
        assert_eq!(net.input_parameters["cidr"].source, InputSource::Deployment);
    }

    #[test]
    fn test_resolver_directive_never_beats_reference() {
        let src = StaticTileSource::new()
            .with_yaml(
                "apiVersion: mahjong.io/v1alpha1\nkind: Tile\nmetadata:\n  name: Base0\n  category: Network\n  version: 1.0.0\nspec: {}\n",
            )
            .unwrap()
            .with_yaml(
                r#"
apiVersion: mahjong.io/v1alpha1
kind: Tile
metadata:
  name: Mid0
  category: Network
  version: 1.0.0
spec:
  dependencies:
    - name: base
      tileReference: Base0
      tileVersion: 1.0.0
  inputs:
    - name: link
      dependencies:
        - name: base
          field: id
"#,
            )
            .unwrap()
            .with_yaml(
                r#"
apiVersion: mahjong.io/v1alpha1
kind: Tile
metadata:
  name: Top0
  category: Compute
  version: 1.0.0
spec:
  dependencies:
    - name: mid
      tileReference: Mid0
      tileVersion: 1.0.0
  inputs:
    - name: link
      defaultValue: forced
      override:
        name: mid
        field: link
"#,
            )
            .unwrap();
        let yaml = deployment("      top:\n        tileReference: Top0\n        tileVersion: 1.0.0\n");
        let reg = resolve_yaml(&src, &yaml).unwrap();
        let mid = reg.stack("Mid0-top-generated").unwrap();
        assert_eq!(mid.input_parameters["link"].source, InputSource::Reference);
        assert!(mid.input("link").unwrap().ends_with(".base0.id"));
        assert_eq!(reg.len(), 3);
    }

    #[test]
    fn test_resolver_independent_families() {
        let yaml = deployment(
            r#"      a:
        tileReference: Network0
        tileVersion: 0.0.1
      b:
        tileReference: Network0
        tileVersion: 0.0.1
"#,
        );
        let reg = resolve_yaml(&source(), &yaml).unwrap();
        let fams = reg.families();
        assert_eq!(fams.len(), 2);
        assert_eq!(reg.node("b").unwrap().root_instance, "b");
    }

    #[test]
    fn test_resolver_format_value() {
        use serde_yaml_ng::Value;
        let s = Value::String("x".into());
        assert_eq!(format_value(IoType::String, Some(&s), &[]), Some("\"x\"".into()));
        assert_eq!(format_value(IoType::Number, Some(&Value::from(3)), &[]), Some("3".into()));
        let many = vec![Value::String("a".into()), Value::String("b".into())];
        assert_eq!(
            format_value(IoType::StringArray, None, &many),
            Some("[\"a\", \"b\"]".into())
        );
        assert_eq!(
            format_value(IoType::CdkObjectArray, None, &many),
            Some("[a, b]".into())
        );
        assert_eq!(format_value(IoType::String, None, &[]), None);
    }

    #[test]
    fn test_resolver_manifest_merge() {
        let tile = TileManifest {
            manifest_type: Some(ManifestType::Helm),
            namespace: Some("tile-ns".into()),
            files: vec!["chart".into()],
            folders: vec![],
            flags: vec!["--wait".into()],
        };
        let declared = TileManifest {
            namespace: Some("prod".into()),
            ..Default::default()
        };
        let m = merge_manifest(Some(&tile), Some(&declared));
        assert_eq!(m.namespace, "prod");
        assert_eq!(m.files, vec!["chart"]);
        assert_eq!(m.manifest_type, Some(ManifestType::Helm));
        assert_eq!(merge_manifest(None, None), StackManifest::default());
    }
}
