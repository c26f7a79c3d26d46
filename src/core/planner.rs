//! Plan generation: turn a resolved registry into runnable stages.
//!
//! Stages are stored in execution order (dependencies first). Each stage
//! carries the environment lines, preparation commands, main commands and
//! post-run commands for one instance, generated by category: declarative
//! infra deploys a stack, application kinds apply manifests and echo their
//! outputs.

use super::config::EngineConfig;
use super::error::{Error, Result};
use super::reference::ReferenceResolver;
use super::registry::{Registry, Stack};
use super::types::*;
use heck::ToKebabCase;
use indexmap::IndexMap;
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Prefix of generated readiness-probe placeholders.
pub const PROBE_PREFIX: &str = "dice-probe-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StageKind {
    /// Build and deploy a generated infra-as-code stack
    DeclarativeInfra,
    /// Run imperative commands (manifest appliers)
    Command,
}

/// One instance's runnable unit.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionStage {
    pub name: String,
    pub kind: StageKind,
    pub tile_name: String,
    pub tile_version: String,
    pub category: Category,
    /// Deployable stack name, used to find outputs in tool logs
    pub stack_name: String,
    pub env: Vec<String>,
    pub prep: Vec<String>,
    pub commands: Vec<String>,
    pub post_commands: Vec<String>,
    /// Placeholder id → probe spec
    pub probes: IndexMap<String, ReadinessProbe>,
    /// Declared outputs in declaration order
    pub outputs: Vec<String>,
    /// Needs cluster credentials injected before running
    pub needs_kube: bool,
}

#[derive(Debug, Clone)]
pub struct ExecutionPlan {
    pub stages: Vec<ExecutionStage>,
    index: HashMap<String, usize>,
    /// Family root → stage names, each in execution order
    pub parallel: IndexMap<String, Vec<String>>,
    pub deployment: Arc<Deployment>,
}

impl ExecutionPlan {
    pub fn stage(&self, name: &str) -> Option<&ExecutionStage> {
        self.index.get(name).map(|&i| &self.stages[i])
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.stages.iter().map(|s| s.name.as_str()).collect()
    }

    /// Sequential flow, e.g. `net -> eks -> app`.
    pub fn flow(&self) -> String {
        self.names().join(" -> ")
    }

    /// One flow line per family.
    pub fn family_flows(&self) -> Vec<String> {
        self.parallel
            .iter()
            .map(|(root, names)| format!("[{}] {}", root, names.join(" -> ")))
            .collect()
    }
}

/// Build the execution plan for a resolved registry.
pub fn build_plan(
    registry: &Registry,
    deployment: Arc<Deployment>,
    config: &EngineConfig,
    work_dir: &Path,
) -> Result<ExecutionPlan> {
    let order = registry.execution_order()?;
    let resolver = ReferenceResolver::new(registry);

    let mut stages = Vec::with_capacity(order.len());
    let mut index = HashMap::new();
    for id in &order {
        let stack = registry
            .stack(id)
            .ok_or_else(|| Error::MissingInstance(id.clone()))?;
        let tile = registry
            .tile(id)
            .ok_or_else(|| Error::MissingInstance(id.clone()))?;
        let outputs = registry
            .outputs(id)
            .map(|o| o.outputs.keys().cloned().collect())
            .unwrap_or_default();
        let stage = build_stage(id, stack, tile, outputs, &resolver, config, work_dir, registry);
        index.insert(id.clone(), stages.len());
        stages.push(stage);
    }

    let mut parallel: IndexMap<String, Vec<String>> = IndexMap::new();
    for id in &order {
        if let Some(node) = registry.node(id) {
            parallel
                .entry(node.root_instance.clone())
                .or_default()
                .push(id.clone());
        }
    }

    tracing::info!(
        deployment = %deployment.metadata.name,
        stages = stages.len(),
        families = parallel.len(),
        "built execution plan"
    );
    Ok(ExecutionPlan {
        stages,
        index,
        parallel,
        deployment,
    })
}

#[allow(clippy::too_many_arguments)]
fn build_stage(
    id: &str,
    stack: &Stack,
    tile: &Tile,
    outputs: Vec<String>,
    resolver: &ReferenceResolver<'_>,
    config: &EngineConfig,
    work_dir: &Path,
    registry: &Registry,
) -> ExecutionStage {
    let kind = if tile.category().is_application() {
        StageKind::Command
    } else {
        StageKind::DeclarativeInfra
    };

    let mut env = vec![
        format!("export WORK_HOME={}", work_dir.display()),
        format!("export TILE_HOME={}", stack.tile_folder.display()),
    ];
    if let Some(region) = &stack.region {
        env.push(format!("export AWS_DEFAULT_REGION={}", region));
        env.push(format!("export AWS_REGION={}", region));
    }
    if let Some(profile) = &stack.profile {
        env.push(format!("export AWS_PROFILE={}", profile));
    }
    for var in &tile.spec.global.env {
        let value = resolver.substitute(&var.value, Some(id));
        let value = resolver.substitute(&value, None);
        env.push(format!("export {}={}", var.name, value));
    }

    let mut probes = IndexMap::new();
    let mut prep = hook_commands(id, "pre", &tile.spec.pre_run, &mut probes);
    let mut commands = Vec::new();

    match kind {
        StageKind::DeclarativeInfra => {
            prep.extend(
                ["cd $WORK_HOME", "npm install", "npm run build", "cdk list"]
                    .iter()
                    .map(|s| s.to_string()),
            );
            commands.push(format!(
                "cdk deploy {} --require-approval never",
                stack.tile_stack_name
            ));
            commands.push(force_output_read(&stack.tile_stack_name));
        }
        StageKind::Command => {
            let namespace = stack.manifest.namespace.as_str();
            if !namespace.is_empty() && namespace != "default" {
                prep.push(format!(
                    "kubectl create namespace {} --dry-run=client -o yaml | kubectl apply -f -",
                    namespace
                ));
            }
            commands.extend(manifest_commands(id, stack));
            commands.push(format!("sleep {}", config.settle_seconds));
            if let Some(set) = registry.outputs(id) {
                for out in set.outputs.values() {
                    if let Some(cmd) = &out.default_value_command {
                        commands.push(format!("echo \"{{\\\"{}=$({})\\\"}}\"", out.name, cmd));
                    } else if let Some(value) = &out.default_value {
                        commands.push(format!(
                            "echo \"{{\\\"{}={}\\\"}}\"",
                            out.name,
                            escape_double_quoted(value)
                        ));
                    }
                }
            }
        }
    }

    let post_commands = hook_commands(id, "post", &tile.spec.post_run, &mut probes);
    let needs_kube = matches!(
        stack.manifest.manifest_type,
        Some(ManifestType::K8s | ManifestType::Helm | ManifestType::Kustomize)
    ) || tile
        .metadata
        .dependent_on_vendor_service
        .as_deref()
        .is_some_and(|s| s.eq_ignore_ascii_case("EKS"));

    ExecutionStage {
        name: id.to_string(),
        kind,
        tile_name: stack.tile_name.clone(),
        tile_version: stack.tile_version.clone(),
        category: stack.category,
        stack_name: stack.tile_stack_name.clone(),
        env,
        prep,
        commands,
        post_commands,
        probes,
        outputs,
        needs_kube,
    }
}

/// Copy hook commands; probe-bearing stages become placeholders.
fn hook_commands(
    id: &str,
    phase: &str,
    hooks: &RunHooks,
    probes: &mut IndexMap<String, ReadinessProbe>,
) -> Vec<String> {
    let mut out = Vec::new();
    for stage in &hooks.stages {
        if !stage.command.is_empty() {
            out.push(stage.command.clone());
        }
        if let Some(probe) = &stage.readiness_probe {
            let placeholder = format!("{}{}-{}-{}", PROBE_PREFIX, id, phase, probes.len());
            probes.insert(placeholder.clone(), probe.clone());
            out.push(placeholder);
        }
    }
    out
}

/// Re-emit stack outputs as `Stack.Key = Value` lines, best-effort.
fn force_output_read(stack_name: &str) -> String {
    format!(
        "aws cloudformation describe-stacks --stack-name {s} \
         --query 'Stacks[0].Outputs[].[OutputKey,OutputValue]' --output text \
         | awk -v s={s} '{{print s\".\"$1\" = \"$2}}' || true",
        s = stack_name
    )
}

fn manifest_commands(id: &str, stack: &Stack) -> Vec<String> {
    let m = &stack.manifest;
    let namespace = if m.namespace.is_empty() {
        "default"
    } else {
        m.namespace.as_str()
    };
    let Some(manifest_type) = m.manifest_type else {
        return Vec::new();
    };
    let flags = m.flags.join(" ");
    m.files
        .iter()
        .chain(m.folders.iter())
        .map(|path| match manifest_type {
            ManifestType::K8s => {
                format!("kubectl apply -f $TILE_HOME/{} -n {}", path, namespace)
            }
            ManifestType::Helm => format!(
                "helm install {} $TILE_HOME/{} -n {} {}",
                id.to_kebab_case(),
                path,
                namespace,
                flags
            )
            .trim_end()
            .to_string(),
            ManifestType::Kustomize => format!(
                "kustomize build $TILE_HOME/{} | kubectl apply -n {} -f -",
                path, namespace
            ),
            ManifestType::Cdk => format!("echo skipping CDK manifest {}", path),
        })
        .collect()
}

/// Escape a literal for a double-quoted shell string so nothing expands.
pub fn escape_double_quoted(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('`', "\\`")
        .replace("$(", "\\$(")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_deployment;
    use crate::core::resolver::tests::{resolve_yaml, source};

    const NET_EKS_APP: &str = r#"
apiVersion: mahjong.io/v1alpha1
kind: Deployment
metadata:
  name: full
spec:
  template:
    tiles:
      net:
        tileReference: Network0
        tileVersion: 0.0.1
        region: us-west-2
      eks:
        tileReference: Eks0
        tileVersion: 0.0.5
        dependsOn: [net]
        inputs:
          - name: clusterName
            inputValue: demo
      app:
        tileReference: App0
        tileVersion: 0.1.0
        dependsOn: [eks]
"#;

    fn plan_for(yaml: &str) -> ExecutionPlan {
        let reg = resolve_yaml(&source(), yaml).unwrap();
        let d = Arc::new(parse_deployment(yaml.as_bytes()).unwrap());
        build_plan(&reg, d, &EngineConfig::default(), Path::new("/work")).unwrap()
    }

    #[test]
    fn test_planner_order_and_lookup() {
        let plan = plan_for(NET_EKS_APP);
        assert_eq!(plan.names(), vec!["net", "eks", "app"]);
        assert_eq!(plan.flow(), "net -> eks -> app");
        assert_eq!(plan.stage("eks").unwrap().tile_name, "Eks0");
        assert!(plan.stage("ghost").is_none());
        assert_eq!(plan.parallel.len(), 1);
        assert_eq!(plan.family_flows(), vec!["[net] net -> eks -> app"]);
    }

    #[test]
    fn test_planner_declarative_stage() {
        let plan = plan_for(NET_EKS_APP);
        let net = plan.stage("net").unwrap();
        assert_eq!(net.kind, StageKind::DeclarativeInfra);
        assert!(net.env.contains(&"export WORK_HOME=/work".to_string()));
        assert!(net.env.contains(&"export TILE_HOME=/bundles/Network0/0.0.1".to_string()));
        assert!(net.env.contains(&"export AWS_DEFAULT_REGION=us-west-2".to_string()));
        assert_eq!(net.prep, vec!["cd $WORK_HOME", "npm install", "npm run build", "cdk list"]);
        assert_eq!(net.commands[0], "cdk deploy NetStack --require-approval never");
        assert!(net.commands[1].ends_with("|| true"));
        assert!(!net.needs_kube);
        assert_eq!(net.outputs, vec!["baseVpc"]);
    }

    #[test]
    fn test_planner_application_stage() {
        let plan = plan_for(NET_EKS_APP);
        let app = plan.stage("app").unwrap();
        assert_eq!(app.kind, StageKind::Command);
        assert!(app.needs_kube);
        assert_eq!(
            app.prep,
            vec!["kubectl create namespace app --dry-run=client -o yaml | kubectl apply -f -"]
        );
        assert_eq!(app.commands[0], "kubectl apply -f $TILE_HOME/deploy.yaml -n app");
        assert_eq!(app.commands[1], "sleep 10");
        assert_eq!(
            app.commands[2],
            "echo \"{\\\"endpoint=$(kubectl get svc app -o name)\\\"}\""
        );
    }

    #[test]
    fn test_planner_independent_families() {
        let yaml = r#"
apiVersion: mahjong.io/v1alpha1
kind: Deployment
metadata:
  name: two
spec:
  template:
    tiles:
      a:
        tileReference: Network0
        tileVersion: 0.0.1
      b:
        tileReference: Network0
        tileVersion: 0.0.1
"#;
        let plan = plan_for(yaml);
        assert_eq!(plan.parallel.len(), 2);
        assert_eq!(plan.parallel["a"], vec!["a"]);
        assert_eq!(plan.parallel["b"], vec!["b"]);
    }

    #[test]
    fn test_planner_missing_stack_is_fatal() {
        let yaml = NET_EKS_APP;
        let mut reg = resolve_yaml(&source(), yaml).unwrap();
        let t = crate::core::registry::tests::tile("Orphan0", "Network");
        reg.register(
            crate::core::registry::TileInstanceNode::new("orphan", &t, 9, "orphan"),
            t,
        )
        .unwrap();
        let d = Arc::new(parse_deployment(yaml.as_bytes()).unwrap());
        let err = build_plan(&reg, d, &EngineConfig::default(), Path::new("/w")).unwrap_err();
        assert!(matches!(err, Error::MissingInstance(ref id) if id == "orphan"));
    }

    #[test]
    fn test_planner_hooks_and_probes() {
        let hooks: RunHooks = serde_yaml_ng::from_str(
            r#"
stages:
  - name: warmup
    command: echo warm
  - name: wait
    readinessProbe:
      command: curl -f localhost
      timeoutSeconds: 30
"#,
        )
        .unwrap();
        let mut probes = IndexMap::new();
        let cmds = hook_commands("app", "pre", &hooks, &mut probes);
        assert_eq!(cmds, vec!["echo warm", "dice-probe-app-pre-0"]);
        assert_eq!(probes["dice-probe-app-pre-0"].timeout_seconds, 30);
    }

    #[test]
    fn test_planner_escape_double_quoted() {
        assert_eq!(escape_double_quoted("a\"b"), "a\\\"b");
        assert_eq!(escape_double_quoted("$(whoami)"), "\\$(whoami)");
        assert_eq!(escape_double_quoted("c:\\x"), "c:\\\\x");
    }
}
