//! Deployment engine: parse, resolve, plan, run.

use super::cancel::Cancellation;
use super::config::EngineConfig;
use super::error::{Error, Result};
use super::executor::{run_plan, RunReport};
use super::journal::Journal;
use super::parser::load_deployment;
use super::planner::build_plan;
use super::reference::EnvMap;
use super::registry::Registry;
use super::resolver::TileGraphResolver;
use super::state::{RunContext, RunStatus, RunStore};
use crate::repo::TileSource;
use crate::sink::LogSink;
use chrono::Utc;
use parking_lot::RwLock;
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub dry_run: bool,
    pub parallel: bool,
    /// Token to stop the run from outside; a fresh one is made if absent
    pub cancel: Option<Cancellation>,
}

pub struct Engine {
    config: Arc<EngineConfig>,
    source: Arc<dyn TileSource>,
    sink: Arc<dyn LogSink>,
    store: Arc<RunStore>,
}

impl Engine {
    pub fn new(config: EngineConfig, source: Arc<dyn TileSource>, sink: Arc<dyn LogSink>) -> Self {
        Self {
            config: Arc::new(config),
            source,
            sink,
            store: Arc::new(RunStore::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &RunStore {
        &self.store
    }

    /// Validate, resolve and plan a deployment without running anything.
    pub fn prepare(&self, bytes: &[u8], opts: &RunOptions) -> Result<Arc<RunContext>> {
        let deployment = Arc::new(load_deployment(bytes)?);
        let mut registry = Registry::new();
        let overrides = TileGraphResolver::new(self.source.as_ref(), &mut registry)
            .resolve(&deployment)?;
        tracing::debug!(overrides = overrides.len(), "recorded override directives");

        let run_id = uuid::Uuid::new_v4().to_string();
        let run_dir = self.config.run_dir(&run_id);
        let plan = build_plan(&registry, deployment.clone(), &self.config, &run_dir)?;
        let env = EnvMap::from_lines(
            plan.stages
                .iter()
                .flat_map(|s| s.env.iter().map(String::as_str)),
        );

        let ctx = Arc::new(RunContext {
            run_id: run_id.clone(),
            deployment,
            registry: Arc::new(RwLock::new(registry)),
            plan: Arc::new(plan),
            env,
            config: self.config.clone(),
            source: self.source.clone(),
            sink: self.sink.clone(),
            journal: Journal::new(&run_dir),
            run_dir,
            dry_run: opts.dry_run,
            parallel: opts.parallel,
            cancel: opts.cancel.clone().unwrap_or_default(),
            started_at: Utc::now(),
        });
        if let Some(previous) = self.store.insert(&ctx) {
            tracing::info!(
                deployment = %ctx.deployment.metadata.name,
                previous_run = %previous,
                run_id = %run_id,
                "deployment was run before"
            );
        }
        Ok(ctx)
    }

    /// Prepare and run a deployment to completion.
    ///
    /// Errors that stop the run before any stage starts (parse, validation,
    /// resolution, planning) come back as `Err`. Once the plan runs, the
    /// result is always `Ok`: a failed or cancelled stage is recorded in
    /// [`RunReport::failure`] next to the stages that did finish. Use
    /// [`RunReport::into_result`] to treat a failed run as an error.
    pub async fn deploy(&self, bytes: &[u8], opts: RunOptions) -> Result<RunReport> {
        let ctx = self.prepare(bytes, &opts)?;
        ctx.log(&format!("run {} started: {}", ctx.run_id, ctx.plan.flow()));
        let report = run_plan(ctx.clone()).await;
        let status = match &report.failure {
            None => RunStatus::Succeeded,
            Some(Error::Cancelled) => RunStatus::Cancelled,
            Some(_) => RunStatus::Failed,
        };
        self.store.set_status(&report.run_id, status);
        tracing::info!(
            run_id = %report.run_id,
            stages_done = report.stages_done,
            ?status,
            "run finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::registry::StageStatus;
    use crate::core::resolver::tests::source;
    use crate::sink::MemorySink;

    const NET_EKS: &str = r#"
apiVersion: mahjong.io/v1alpha1
kind: Deployment
metadata:
  name: engine
spec:
  template:
    tiles:
      net:
        tileReference: Network0
        tileVersion: 0.0.1
      eks:
        tileReference: Eks0
        tileVersion: 0.0.5
        dependsOn: [net]
        inputs:
          - name: clusterName
            inputValue: demo
"#;

    fn engine(dir: &std::path::Path) -> (Engine, Arc<MemorySink>) {
        let sink = Arc::new(MemorySink::new());
        let config = EngineConfig {
            work_home: dir.to_path_buf(),
            poll_interval_ms: 10,
            settle_seconds: 0,
            ..EngineConfig::default()
        };
        (Engine::new(config, Arc::new(source()), sink.clone()), sink)
    }

    #[test]
    fn test_engine_prepare_plans_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(dir.path());
        let ctx = engine.prepare(NET_EKS.as_bytes(), &RunOptions::default()).unwrap();
        assert_eq!(ctx.plan.flow(), "net -> eks");
        assert!(ctx.run_dir.starts_with(dir.path()));
        assert!(ctx.env.get("WORK_HOME").is_some());
        assert_eq!(engine.store().run_ids(), vec![ctx.run_id.clone()]);
        assert_eq!(ctx.registry.read().status("eks"), Some(StageStatus::Created));
    }

    #[test]
    fn test_engine_prepare_rejects_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(dir.path());
        let bad = NET_EKS.replace("kind: Deployment", "kind: Tile");
        let err = engine.prepare(bad.as_bytes(), &RunOptions::default()).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(engine.store().run_ids().is_empty());
    }

    #[test]
    fn test_engine_prepare_mandatory_input() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(dir.path());
        let yaml = NET_EKS.replace("        inputs:\n          - name: clusterName\n            inputValue: demo\n", "");
        let err = engine.prepare(yaml.as_bytes(), &RunOptions::default()).unwrap_err();
        assert!(err.is_graph_error());
    }

    #[tokio::test]
    async fn test_engine_dry_run_deploy() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, sink) = engine(dir.path());
        let opts = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let report = engine.deploy(NET_EKS.as_bytes(), opts).await.unwrap();
        assert!(report.succeeded());
        assert_eq!(report.stages_done, 2);
        let record = engine.store().get(&report.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Succeeded);
        assert!(sink.contains("started: net -> eks"));
        assert!(dir.path().join("runs").join(&report.run_id).join("eks.sh").exists());
    }

    #[tokio::test]
    async fn test_engine_repeated_deploy_kept_separately() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(dir.path());
        let opts = RunOptions {
            dry_run: true,
            ..RunOptions::default()
        };
        let a = engine.deploy(NET_EKS.as_bytes(), opts.clone()).await.unwrap();
        let b = engine.deploy(NET_EKS.as_bytes(), opts).await.unwrap();
        assert_ne!(a.run_id, b.run_id);
        assert_eq!(engine.store().run_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_engine_stage_failure_in_report() {
        const FAIL: &str = "apiVersion: mahjong.io/v1alpha1\nkind: Tile\nmetadata:\n  name: Fail0\n  category: Application\n  version: 1.0.0\nspec:\n  preRun:\n    stages:\n      - name: boom\n        command: exit 3\n";
        const DEPLOY: &str = "apiVersion: mahjong.io/v1alpha1\nkind: Deployment\nmetadata:\n  name: failing\nspec:\n  template:\n    tiles:\n      bad:\n        tileReference: Fail0\n        tileVersion: 1.0.0\n";
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig {
            work_home: dir.path().to_path_buf(),
            poll_interval_ms: 10,
            settle_seconds: 0,
            ..EngineConfig::default()
        };
        let source = crate::repo::StaticTileSource::new().with_yaml(FAIL).unwrap();
        let engine = Engine::new(config, Arc::new(source), Arc::new(MemorySink::new()));
        let report = engine.deploy(DEPLOY.as_bytes(), RunOptions::default()).await.unwrap();
        assert!(!report.succeeded());
        assert_eq!(report.interrupted.len(), 1);
        let run_id = report.run_id.clone();
        assert_eq!(engine.store().get(&run_id).unwrap().status, RunStatus::Failed);
        let err = report.into_result().unwrap_err();
        assert_eq!(err.instance(), Some("bad"));
    }

    #[tokio::test]
    async fn test_engine_cancelled_run_status() {
        let dir = tempfile::tempdir().unwrap();
        let (engine, _) = engine(dir.path());
        let cancel = Cancellation::new();
        cancel.cancel();
        let opts = RunOptions {
            dry_run: true,
            parallel: false,
            cancel: Some(cancel),
        };
        let report = engine.deploy(NET_EKS.as_bytes(), opts).await.unwrap();
        assert!(matches!(report.failure, Some(Error::Cancelled)));
        let record = engine.store().get(&report.run_id).unwrap();
        assert_eq!(record.status, RunStatus::Cancelled);
    }
}
