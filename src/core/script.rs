//! Stage script rendering.
//!
//! A stage becomes a bash script: header, cluster access, dependency output
//! exports, environment, preparation and main commands. References are
//! resolved with the stage as `self` first, then without context. Probe
//! placeholders are swapped for an invocation of the probe runner.

use super::config::EngineConfig;
use super::error::{Error, Result};
use super::planner::{escape_double_quoted, ExecutionStage, PROBE_PREFIX};
use super::reference::ReferenceResolver;
use super::registry::{dependency_env_name, Registry};
use super::types::ReadinessProbe;
use std::path::{Path, PathBuf};

pub const SCRIPT_HEADER: &str = "#!/bin/bash\nset -xe";

/// Everything a render needs besides the stage itself.
pub struct RenderContext<'a> {
    pub registry: &'a Registry,
    pub config: &'a EngineConfig,
    pub run_dir: &'a Path,
    pub dry_run: bool,
}

impl RenderContext<'_> {
    /// Main script: environment, preparation, commands.
    pub fn main_script(&self, stage: &ExecutionStage) -> Result<String> {
        let mut lines = vec![SCRIPT_HEADER.to_string()];
        lines.extend(self.kube_lines(stage)?);
        for dep in self.registry.transitive_dependencies(&stage.name) {
            lines.extend(self.output_exports(&dep));
        }
        lines.extend(stage.env.iter().cloned());
        for cmd in stage.prep.iter().chain(stage.commands.iter()) {
            lines.push(self.render_line(stage, cmd)?);
        }
        lines.push("echo $?".to_string());
        Ok(lines.join("\n") + "\n")
    }

    /// Post-run script, with the stage's own outputs exported.
    pub fn post_script(&self, stage: &ExecutionStage) -> Result<Option<String>> {
        if stage.post_commands.is_empty() {
            return Ok(None);
        }
        let mut lines = vec![SCRIPT_HEADER.to_string()];
        lines.extend(self.kube_lines(stage)?);
        lines.extend(self.output_exports(&stage.name));
        lines.extend(stage.env.iter().cloned());
        for cmd in &stage.post_commands {
            lines.push(self.render_line(stage, cmd)?);
        }
        lines.push("echo $?".to_string());
        Ok(Some(lines.join("\n") + "\n"))
    }

    fn render_line(&self, stage: &ExecutionStage, line: &str) -> Result<String> {
        let line = match stage.probes.get(line) {
            Some(probe) if line.starts_with(PROBE_PREFIX) => self.probe_wrapper(stage, line, probe)?,
            _ => line.to_string(),
        };
        Ok(self.resolve(stage, &line))
    }

    fn resolve(&self, stage: &ExecutionStage, text: &str) -> String {
        let resolver = ReferenceResolver::new(self.registry);
        let first = resolver.substitute(text, Some(&stage.name));
        resolver.substitute(&first, None)
    }

    /// Write the probe command to its own script and call the probe runner on it.
    fn probe_wrapper(
        &self,
        stage: &ExecutionStage,
        placeholder: &str,
        probe: &ReadinessProbe,
    ) -> Result<String> {
        let path = self.run_dir.join(format!("{}.sh", placeholder));
        let body = format!("{}\n{}\n", SCRIPT_HEADER, self.resolve(stage, &probe.command));
        std::fs::create_dir_all(self.run_dir)
            .and_then(|_| std::fs::write(&path, body))
            .map_err(|e| Error::ScriptRender {
                instance: stage.name.clone(),
                reason: format!("cannot write probe script {}: {}", path.display(), e),
            })?;
        Ok(format!(
            "{} probe --command {} --initial-delay-seconds {} --period-seconds {} \
             --timeout-seconds {} --success-threshold {} --failure-threshold {}",
            self.config.probe_command(),
            path.display(),
            probe.initial_delay_seconds,
            probe.period_seconds,
            probe.timeout_seconds,
            probe.success_threshold,
            probe.failure_threshold
        ))
    }

    /// `export D_TBD_<TILE>_<OUTPUT>=...` for every known declared output of `id`.
    fn output_exports(&self, id: &str) -> Vec<String> {
        let (Some(node), Some(set), Some(tile)) = (
            self.registry.node(id),
            self.registry.outputs(id),
            self.registry.tile(id),
        ) else {
            return Vec::new();
        };
        tile.spec
            .outputs
            .iter()
            .filter_map(|o| {
                set.value(&o.name).map(|v| {
                    format!(
                        "export {}=\"{}\"",
                        dependency_env_name(&node.tile_name, &o.name),
                        escape_double_quoted(v)
                    )
                })
            })
            .collect()
    }

    /// Cluster credentials for stages that talk to Kubernetes.
    fn kube_lines(&self, stage: &ExecutionStage) -> Result<Vec<String>> {
        if !stage.needs_kube {
            return Ok(Vec::new());
        }
        let (cluster, role) = match self.cluster_access(&stage.name) {
            (Some(cluster), Some(role)) => (cluster, role),
            (cluster, _) => {
                if self.dry_run {
                    return Ok(vec!["# no cluster to configure in dry run".to_string()]);
                }
                let missing = if cluster.is_none() { "clusterName" } else { "masterRoleARN" };
                return Err(Error::ScriptRender {
                    instance: stage.name.clone(),
                    reason: format!("no {} from an EKS dependency or the stage inputs", missing),
                });
            }
        };
        let kubeconfig = self.kubeconfig_path(&stage.name);
        let mut update = format!(
            "aws eks update-kubeconfig --name {} --kubeconfig $KUBECONFIG --role-arn {}",
            cluster, role
        );
        if let Some(region) = self.registry.stack(&stage.name).and_then(|s| s.region.as_ref()) {
            update.push_str(&format!(" --region {}", region));
        }
        Ok(vec![
            format!("export KUBECONFIG={}", kubeconfig.display()),
            update,
        ])
    }

    fn kubeconfig_path(&self, instance: &str) -> PathBuf {
        self.run_dir.join(format!("{}-kubeconfig", instance))
    }

    /// Cluster name and role from an EKS dependency's outputs, else from the
    /// stage's own inputs.
    fn cluster_access(&self, id: &str) -> (Option<String>, Option<String>) {
        for dep in self.registry.transitive_dependencies(id) {
            let is_eks = self
                .registry
                .tile(&dep)
                .and_then(|t| t.metadata.vendor_service.as_deref())
                .is_some_and(|s| s.eq_ignore_ascii_case("EKS"));
            if !is_eks {
                continue;
            }
            if let Some(set) = self.registry.outputs(&dep) {
                if let Some(cluster) = set.value("clusterName") {
                    return (
                        Some(cluster.to_string()),
                        set.value("masterRoleARN").map(str::to_string),
                    );
                }
            }
        }
        let stack = self.registry.stack(id);
        let input = |name: &str| {
            stack
                .and_then(|s| s.input(name))
                .map(|v| v.trim_matches('"').to_string())
                .filter(|v| !v.is_empty())
        };
        (input("clusterName"), input("masterRoleARN"))
    }
}
