//! Stage scheduler.
//!
//! A stage waits for its dependencies, renders its script, runs it (or copies
//! the dry-run fixture), harvests outputs into the registry and finishes with
//! the post-run script. A failure marks the stage Interrupted and stops its
//! sequence. Parallel mode runs one sequence per family.

use super::error::{Error, Result};
use super::extract::{extract_outputs, LogLine};
use super::journal::{hash_script, RunEvent};
use super::planner::ExecutionStage;
use super::reference::{has_reference, ReferenceResolver};
use super::registry::{Registry, StageStatus};
use super::script::RenderContext;
use super::state::RunContext;
use crate::transport::{exec_streaming, Stream};
use parking_lot::Mutex;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;

/// Result of a run.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: String,
    pub stages_done: usize,
    /// Stage id and reason, for every stage that ended Interrupted
    pub interrupted: Vec<(String, String)>,
    pub summary_path: Option<PathBuf>,
    pub duration: Duration,
    /// First error that stopped a sequence
    pub failure: Option<Error>,
}

impl RunReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn into_result(self) -> Result<Self> {
        match self.failure {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}

/// Execute the whole plan of `ctx`. Stage failures are reported in the
/// returned [`RunReport`], never as a panic or early return.
pub async fn run_plan(ctx: Arc<RunContext>) -> RunReport {
    let start = Instant::now();
    ctx.journal.record(RunEvent::RunStarted {
        run_id: ctx.run_id.clone(),
        deployment: ctx.deployment.metadata.name.clone(),
        dry_run: ctx.dry_run,
        parallel: ctx.parallel,
    });
    tracing::info!(
        run_id = %ctx.run_id,
        stages = ctx.plan.len(),
        dry_run = ctx.dry_run,
        parallel = ctx.parallel,
        "starting run"
    );

    let outcome = if ctx.parallel {
        run_parallel(ctx.clone()).await
    } else {
        let names = ctx.plan.names().iter().map(|s| s.to_string()).collect();
        run_sequence(ctx.clone(), names).await
    };

    let summary_path = if ctx.plan.is_empty() {
        None
    } else {
        match write_summary(&ctx).await {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::error!(error = %e, "cannot write summary");
                None
            }
        }
    };

    let stages_done = {
        let reg = ctx.registry.read();
        reg.nodes().filter(|n| n.status == StageStatus::Done).count()
    };
    ctx.journal.record(RunEvent::RunCompleted {
        run_id: ctx.run_id.clone(),
        succeeded: outcome.is_ok(),
        stages_done,
        duration_seconds: start.elapsed().as_secs_f64(),
    });

    RunReport {
        run_id: ctx.run_id.clone(),
        stages_done,
        interrupted: interrupted_stages(&ctx),
        summary_path,
        duration: start.elapsed(),
        failure: outcome.err(),
    }
}

/// Interrupted stages with the reason the journal recorded for them.
fn interrupted_stages(ctx: &RunContext) -> Vec<(String, String)> {
    let mut reasons = std::collections::HashMap::new();
    for te in ctx.journal.read().unwrap_or_default() {
        if let RunEvent::StageInterrupted { run_id, stage, reason } = te.event {
            if run_id == ctx.run_id {
                reasons.insert(stage, reason);
            }
        }
    }
    let reg = ctx.registry.read();
    reg.nodes()
        .filter(|n| n.status == StageStatus::Interrupted)
        .map(|n| {
            let reason = reasons
                .remove(&n.instance)
                .unwrap_or_else(|| "interrupted".to_string());
            (n.instance.clone(), reason)
        })
        .collect()
}

/// One concurrent sequence per family. Every family runs to its own end; the
/// first failure is reported after all have finished.
async fn run_parallel(ctx: Arc<RunContext>) -> Result<()> {
    let mut set = JoinSet::new();
    for (root, names) in &ctx.plan.parallel {
        let ctx = ctx.clone();
        let root = root.clone();
        let names = names.clone();
        set.spawn(async move {
            let result = run_sequence(ctx.clone(), names.clone()).await;
            if let Err(e) = &result {
                if !matches!(e, Error::Cancelled) {
                    abandon_remaining(&ctx, &names, e);
                }
            }
            (root, result)
        });
    }

    let mut first_error = None;
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((root, Ok(()))) => tracing::info!(family = %root, "family finished"),
            Ok((root, Err(e))) => {
                tracing::error!(family = %root, error = %e, "family failed");
                first_error.get_or_insert(e);
            }
            Err(e) => {
                tracing::error!(error = %e, "family task aborted");
                first_error.get_or_insert(Error::StageFailed {
                    instance: "family".to_string(),
                    reason: e.to_string(),
                });
            }
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Mark the stages a stopped sequence never reached as Interrupted, so stages
/// in other families that depend on them stop waiting.
fn abandon_remaining(ctx: &RunContext, names: &[String], cause: &Error) {
    let reason = match cause.instance() {
        Some(stage) => format!("not started: {} stopped its sequence", stage),
        None => format!("not started: {}", cause),
    };
    let mut abandoned = Vec::new();
    {
        let mut reg = ctx.registry.write();
        for name in names {
            if reg.status(name) == Some(StageStatus::Created)
                && matches!(reg.set_status(name, StageStatus::Interrupted), Ok(true))
            {
                abandoned.push(name);
            }
        }
    }
    for name in abandoned {
        ctx.journal.record(RunEvent::StageInterrupted {
            run_id: ctx.run_id.clone(),
            stage: name.clone(),
            reason: reason.clone(),
        });
        ctx.stage_log(name, &format!("stage interrupted: {}", reason));
        tracing::warn!(stage = %name, %reason, "stage abandoned");
    }
}

/// Run stages strictly in order; stop at the first failure.
pub async fn run_sequence(ctx: Arc<RunContext>, names: Vec<String>) -> Result<()> {
    for name in names {
        if ctx.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        run_stage(&ctx, &name).await?;
    }
    Ok(())
}

async fn run_stage(ctx: &RunContext, name: &str) -> Result<()> {
    let started = Instant::now();
    let outcome = match wait_for_dependencies(ctx, name).await {
        Ok(()) => {
            ctx.registry.write().set_status(name, StageStatus::Progress)?;
            ctx.stage_log(name, "stage started");
            execute_stage(ctx, name).await
        }
        Err(e) => Err(e),
    };

    match outcome {
        Ok(outputs) => {
            ctx.registry.write().set_status(name, StageStatus::Done)?;
            ctx.journal.record(RunEvent::StageDone {
                run_id: ctx.run_id.clone(),
                stage: name.to_string(),
                duration_seconds: started.elapsed().as_secs_f64(),
                outputs,
            });
            ctx.stage_log(name, "stage done");
            tracing::info!(stage = name, outputs, "stage done");
            Ok(())
        }
        Err(e) => {
            ctx.registry.write().set_status(name, StageStatus::Interrupted)?;
            ctx.journal.record(RunEvent::StageInterrupted {
                run_id: ctx.run_id.clone(),
                stage: name.to_string(),
                reason: e.to_string(),
            });
            ctx.stage_log(name, &format!("stage interrupted: {}", e));
            tracing::error!(stage = name, error = %e, "stage interrupted");
            Err(e)
        }
    }
}

/// Poll until every dependency is Done. An Interrupted dependency fails the
/// stage at once.
async fn wait_for_dependencies(ctx: &RunContext, name: &str) -> Result<()> {
    let poll = Duration::from_millis(ctx.config.poll_interval_ms);
    loop {
        let statuses: Vec<(String, Option<StageStatus>)> = {
            let reg = ctx.registry.read();
            let node = reg
                .node(name)
                .ok_or_else(|| Error::MissingInstance(name.to_string()))?;
            node.dependencies
                .iter()
                .map(|d| (d.clone(), reg.status(d)))
                .collect()
        };
        if let Some((dep, _)) = statuses
            .iter()
            .find(|(_, s)| *s == Some(StageStatus::Interrupted))
        {
            return Err(Error::DependencyInterrupted {
                instance: name.to_string(),
                dependency: dep.clone(),
            });
        }
        if let Some((dep, _)) = statuses.iter().find(|(_, s)| s.is_none()) {
            return Err(Error::MissingInstance(dep.clone()));
        }
        if statuses.iter().all(|(_, s)| *s == Some(StageStatus::Done)) {
            return Ok(());
        }
        tracing::debug!(stage = name, "waiting for dependencies");
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            _ = ctx.cancel.cancelled() => return Err(Error::Cancelled),
        }
    }
}

/// Steps after the stage is in Progress. Returns the number of outputs found.
async fn execute_stage(ctx: &RunContext, name: &str) -> Result<usize> {
    let stage = ctx
        .plan
        .stage(name)
        .cloned()
        .ok_or_else(|| Error::MissingInstance(name.to_string()))?;
    tokio::fs::create_dir_all(&ctx.run_dir).await?;

    let script = {
        let reg = ctx.registry.read();
        render_ctx(ctx, &reg).main_script(&stage)?
    };
    let script_path = ctx.run_dir.join(format!("{}.sh", name));
    tokio::fs::write(&script_path, &script).await?;
    ctx.journal.record(RunEvent::StageStarted {
        run_id: ctx.run_id.clone(),
        stage: name.to_string(),
        script_hash: hash_script(&script),
    });

    let log_path = ctx.run_dir.join(format!("{}-output.log", name));
    if ctx.dry_run {
        copy_fixture(ctx, &stage, &log_path).await?;
    } else {
        run_script(ctx, name, &script_path, &log_path).await?;
    }

    let found = harvest_outputs(ctx, &stage, &log_path).await?;

    let post = {
        let reg = ctx.registry.read();
        render_ctx(ctx, &reg).post_script(&stage)?
    };
    if let Some(post) = post {
        let post_path = ctx.run_dir.join(format!("{}-post.sh", name));
        tokio::fs::write(&post_path, &post).await?;
        if !ctx.dry_run {
            let post_log = ctx.run_dir.join(format!("{}-post-output.log", name));
            run_script(ctx, name, &post_path, &post_log).await?;
        }
    }
    Ok(found)
}

fn render_ctx<'a>(ctx: &'a RunContext, reg: &'a Registry) -> RenderContext<'a> {
    RenderContext {
        registry: reg,
        config: &ctx.config,
        run_dir: &ctx.run_dir,
        dry_run: ctx.dry_run,
    }
}

/// Execute a script, teeing every line to the sink and the JSON-lines log.
async fn run_script(ctx: &RunContext, name: &str, script: &Path, log_path: &Path) -> Result<()> {
    let file = std::fs::File::create(log_path)?;
    let file = Arc::new(Mutex::new(file));
    let sink = ctx.sink.clone();
    let stage = name.to_string();
    let writer = file.clone();
    let on_line = move |stream: Stream, line: &str| {
        sink.write(&format!("[{}] {}", stage, line));
        let record = match stream {
            Stream::Stdout => LogLine::info(line),
            Stream::Stderr => LogLine::error(line),
        };
        if let Ok(json) = serde_json::to_string(&record) {
            let _ = writeln!(writer.lock(), "{}", json);
        }
    };

    let code = exec_streaming(&ctx.config.shell, script, on_line, &ctx.cancel).await?;
    file.lock().flush()?;
    if code != 0 {
        return Err(Error::StageFailed {
            instance: name.to_string(),
            reason: format!("{} exited with code {}", script.display(), code),
        });
    }
    Ok(())
}

/// Dry run: the tile's recorded log stands in for execution.
async fn copy_fixture(ctx: &RunContext, stage: &ExecutionStage, log_path: &Path) -> Result<()> {
    match ctx.source.fixture_log(&stage.tile_name, &stage.tile_version) {
        Some(fixture) => {
            tokio::fs::copy(&fixture, log_path).await?;
            ctx.stage_log(&stage.name, &format!("dry run: using {}", fixture.display()));
        }
        None => {
            tokio::fs::write(log_path, b"").await?;
            ctx.stage_log(&stage.name, "dry run: no fixture log");
        }
    }
    Ok(())
}

/// Read the stage log back, record extracted outputs and push them upward.
async fn harvest_outputs(ctx: &RunContext, stage: &ExecutionStage, log_path: &Path) -> Result<usize> {
    let content = tokio::fs::read_to_string(log_path)
        .await
        .map_err(|_| Error::MissingOutputLog {
            instance: stage.name.clone(),
            path: log_path.display().to_string(),
        })?;
    let extracted = extract_outputs(stage, &content);

    let resolved: Vec<(String, String)> = {
        let reg = ctx.registry.read();
        let resolver = ReferenceResolver::new(&reg);
        extracted
            .into_iter()
            .map(|(k, v)| {
                let v = if v.contains('$') { ctx.env.substitute(&v) } else { v };
                let v = resolver.substitute(&v, Some(&stage.name));
                if has_reference(&v) {
                    tracing::warn!(stage = %stage.name, output = %k, value = %v, "output still holds a reference");
                }
                (k, v)
            })
            .collect()
    };

    let mut reg = ctx.registry.write();
    for (k, v) in &resolved {
        tracing::debug!(stage = %stage.name, output = %k, value = %v, "extracted output");
        reg.record_output(&stage.name, k, v)?;
    }
    reg.propagate_outputs(&stage.name)?;
    Ok(resolved.len())
}

/// Render the deployment summary to the sink and `output-summary.txt`.
pub async fn write_summary(ctx: &RunContext) -> Result<PathBuf> {
    let text = render_summary(ctx);
    for line in text.lines() {
        ctx.log(line);
    }
    tokio::fs::create_dir_all(&ctx.run_dir).await?;
    let path = ctx.run_dir.join("output-summary.txt");
    tokio::fs::write(&path, &text).await?;
    Ok(path)
}

pub fn render_summary(ctx: &RunContext) -> String {
    let summary = &ctx.deployment.spec.summary;
    let reg = ctx.registry.read();
    let resolver = ReferenceResolver::new(&reg);
    let replace_all = |text: &str| ctx.env.substitute(&resolver.substitute(text, None));
    let mut lines = vec![format!("# Summary: {}", ctx.deployment.metadata.name)];
    if !summary.description.is_empty() {
        lines.push(replace_all(summary.description.trim()));
    }
    if !summary.outputs.is_empty() {
        lines.push(String::new());
        lines.push("## Outputs".to_string());
        for out in &summary.outputs {
            lines.push(format!("{}: {}", out.name, replace_all(&out.value)));
        }
    }
    if !summary.notes.is_empty() {
        lines.push(String::new());
        lines.push("## Notes".to_string());
        for note in &summary.notes {
            lines.push(format!("- {}", replace_all(note)));
        }
    }
    lines.join("\n") + "\n"
}
