//! Run state: the per-run context and the run store.
//!
//! A [`RunContext`] owns everything one deployment run touches: registry,
//! plan, sink, journal, cancellation. It is created at run start and kept in
//! the [`RunStore`] afterwards for read-only introspection.

use super::cancel::Cancellation;
use super::config::EngineConfig;
use super::journal::Journal;
use super::planner::ExecutionPlan;
use super::reference::EnvMap;
use super::registry::Registry;
use super::types::Deployment;
use crate::repo::TileSource;
use crate::sink::LogSink;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;

pub struct RunContext {
    pub run_id: String,
    pub deployment: Arc<Deployment>,
    /// Families read it concurrently; each mutates only its own instances
    pub registry: Arc<RwLock<Registry>>,
    pub plan: Arc<ExecutionPlan>,
    /// Flattened `export` lines of every stage
    pub env: EnvMap,
    pub config: Arc<EngineConfig>,
    pub source: Arc<dyn TileSource>,
    pub sink: Arc<dyn LogSink>,
    pub journal: Journal,
    pub run_dir: PathBuf,
    pub dry_run: bool,
    pub parallel: bool,
    pub cancel: Cancellation,
    pub started_at: DateTime<Utc>,
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("run_id", &self.run_id)
            .field("deployment", &self.deployment.metadata.name)
            .field("stages", &self.plan.len())
            .field("run_dir", &self.run_dir)
            .field("dry_run", &self.dry_run)
            .field("parallel", &self.parallel)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl RunContext {
    pub fn log(&self, line: &str) {
        self.sink.write(line);
    }

    pub fn stage_log(&self, stage: &str, line: &str) {
        self.sink.write(&format!("[{}] {}", stage, line));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// What the store keeps for one run.
#[derive(Clone)]
pub struct RunRecord {
    pub run_id: String,
    pub deployment_name: String,
    pub registry: Arc<RwLock<Registry>>,
    pub plan: Arc<ExecutionPlan>,
    pub started_at: DateTime<Utc>,
    pub status: RunStatus,
}

/// Runs keyed by run id, in start order.
#[derive(Default)]
pub struct RunStore {
    runs: RwLock<IndexMap<String, RunRecord>>,
}

impl RunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep a run. Returns the id of the latest earlier run of the same
    /// deployment, if there was one.
    pub fn insert(&self, ctx: &RunContext) -> Option<String> {
        let name = ctx.deployment.metadata.name.clone();
        let mut runs = self.runs.write();
        let previous = runs
            .values()
            .rev()
            .find(|r| r.deployment_name == name)
            .map(|r| r.run_id.clone());
        runs.insert(
            ctx.run_id.clone(),
            RunRecord {
                run_id: ctx.run_id.clone(),
                deployment_name: name,
                registry: ctx.registry.clone(),
                plan: ctx.plan.clone(),
                started_at: ctx.started_at,
                status: RunStatus::Running,
            },
        );
        previous
    }

    pub fn set_status(&self, run_id: &str, status: RunStatus) {
        if let Some(r) = self.runs.write().get_mut(run_id) {
            r.status = status;
        }
    }

    pub fn get(&self, run_id: &str) -> Option<RunRecord> {
        self.runs.read().get(run_id).cloned()
    }

    pub fn run_ids(&self) -> Vec<String> {
        self.runs.read().keys().cloned().collect()
    }

    /// Copy of a run's registry as it is right now.
    pub fn registry_snapshot(&self, run_id: &str) -> Option<Registry> {
        let record = self.get(run_id)?;
        let snapshot = record.registry.read().clone();
        Some(snapshot)
    }

    /// Sequential flow, e.g. `net -> eks -> app`.
    pub fn flow(&self, run_id: &str) -> Option<String> {
        self.get(run_id).map(|r| r.plan.flow())
    }

    /// One flow per family.
    pub fn parallel_flows(&self, run_id: &str) -> Option<Vec<String>> {
        self.get(run_id).map(|r| r.plan.family_flows())
    }
}
